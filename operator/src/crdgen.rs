use kube::CustomResourceExt;

use rook_operator::cluster::CephCluster;
use rook_operator::volume::Volume;

fn main() {
    print!("{}", serde_yaml::to_string(&CephCluster::crd()).unwrap());
    println!("---");
    print!("{}", serde_yaml::to_string(&Volume::crd()).unwrap());
}
