//! Cephx keys, keyrings and the admin key rotation policy.
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use rand::RngCore;

use crate::{
    ceph::version::CephVersion,
    cluster::{CephxConfig, CephxStatus},
    error::{Error, Result},
};

/// Canonical admin user.
pub const ADMIN_USERNAME: &str = "client.admin";
/// Temporary identity used to rotate the admin key.
pub const ADMIN_ROTATOR_USERNAME: &str = "client.admin-rotator";
/// Capabilities shared by the admin and the rotator identities.
pub const ADMIN_CAPS: &[&str] = &[
    "mds", "allow *", "mon", "allow *", "osd", "allow *", "mgr", "allow *",
];

/// Key version recorded for clusters created by this operator before their first reconcile
/// completed.
pub const UNINITIALIZED: &str = "Uninitialized";

/// Rotation policies accepted in `security.cephx.daemon.keyRotationPolicy`.
pub const POLICY_DISABLED: &str = "Disabled";
/// Rotate whenever the desired generation exceeds the recorded one.
pub const POLICY_KEY_GENERATION: &str = "KeyGeneration";
/// Rotate whenever the cluster moves to a newer Ceph version.
pub const POLICY_WITH_CEPH_VERSION_UPDATE: &str = "WithCephVersionUpdate";

/// Render a keyring for `name`. `caps` is a flat list of subsystem and capability pairs.
pub fn gen_keyring(name: &str, key: &str, caps: &[&str]) -> Result<String> {
    if key.is_empty() {
        return Err(Error::Validation(format!("empty key for {name}")));
    }
    if caps.len() % 2 != 0 {
        return Err(Error::Validation(format!(
            "caps for {name} must be subsystem and capability pairs, got {} entries",
            caps.len()
        )));
    }
    let mut keyring = format!("[{name}]\n\tkey = {key}\n");
    for pair in caps.chunks(2) {
        keyring.push_str(&format!("\tcaps {} = \"{}\"\n", pair[0], pair[1]));
    }
    Ok(keyring)
}

/// Keyring of the admin user with full capabilities.
pub fn admin_keyring(key: &str) -> Result<String> {
    gen_keyring(ADMIN_USERNAME, key, ADMIN_CAPS)
}

/// Generate a new random cephx secret.
///
/// The encoding is the one produced by `ceph-authtool --gen-print-key`: a little endian header
/// of key type, creation time and length followed by 16 random bytes, base64 encoded.
pub fn generate_cephx_key(rng: &mut impl RngCore) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut secret = [0u8; 16];
    rng.fill_bytes(&mut secret);

    let mut raw = Vec::with_capacity(12 + secret.len());
    raw.extend_from_slice(&1u16.to_le_bytes());
    raw.extend_from_slice(&(now.as_secs() as u32).to_le_bytes());
    raw.extend_from_slice(&now.subsec_nanos().to_le_bytes());
    raw.extend_from_slice(&(secret.len() as u16).to_le_bytes());
    raw.extend_from_slice(&secret);
    base64::engine::general_purpose::STANDARD.encode(raw)
}

/// Decide whether the admin key should be rotated now.
///
/// `running` is the version the cluster currently runs and `image` the version of the desired
/// image. An unknown policy is an error; every other undecidable case means no rotation.
pub fn should_rotate_cephx_keys(
    cfg: &CephxConfig,
    running: &CephVersion,
    image: &CephVersion,
    status: &CephxStatus,
) -> Result<bool> {
    if !running.supports_cephx_key_rotation() {
        return Ok(false);
    }
    match cfg.key_rotation_policy.as_str() {
        "" | POLICY_DISABLED => Ok(false),
        POLICY_KEY_GENERATION => Ok(status.key_ceph_version != UNINITIALIZED
            && cfg.key_generation > status.key_generation),
        POLICY_WITH_CEPH_VERSION_UPDATE => {
            if !image.is_known() || status.key_ceph_version == UNINITIALIZED {
                return Ok(false);
            }
            if status.key_ceph_version.is_empty() {
                return Ok(true);
            }
            let recorded = CephVersion::parse_status(&status.key_ceph_version)?;
            Ok(!recorded.is_at_least(image))
        }
        other => Err(Error::Validation(format!(
            "unknown cephx key rotation policy {other:?}"
        ))),
    }
}

/// The cephx status after a rotation attempt.
pub fn updated_cephx_status(
    did_rotate: bool,
    cfg: &CephxConfig,
    running: &CephVersion,
    status: &CephxStatus,
) -> CephxStatus {
    let wanted = if cfg.key_rotation_policy == POLICY_KEY_GENERATION {
        cfg.key_generation
    } else {
        0
    };
    if status.key_ceph_version == UNINITIALIZED {
        return CephxStatus {
            key_generation: wanted.max(1),
            key_ceph_version: running.status_string(),
        };
    }
    if !did_rotate {
        return status.clone();
    }
    CephxStatus {
        key_generation: wanted.max(status.key_generation + 1),
        key_ceph_version: running.status_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;
    use rand::rngs::mock::StepRng;

    fn status(generation: u32, version: &str) -> CephxStatus {
        CephxStatus {
            key_generation: generation,
            key_ceph_version: version.to_owned(),
        }
    }

    fn policy(policy: &str, generation: u32) -> CephxConfig {
        CephxConfig {
            key_rotation_policy: policy.to_owned(),
            key_generation: generation,
        }
    }

    const RUNNING: CephVersion = CephVersion::new(20, 3, 0);

    #[test]
    fn renders_admin_keyring() {
        expect![[r#"
            [client.admin]
            	key = AQBBBB==
            	caps mds = "allow *"
            	caps mon = "allow *"
            	caps osd = "allow *"
            	caps mgr = "allow *"
        "#]]
        .assert_eq(&admin_keyring("AQBBBB==").unwrap());
    }

    #[test]
    fn rejects_bad_keyring_input() {
        assert!(gen_keyring("client.x", "", ADMIN_CAPS).is_err());
        assert!(gen_keyring("client.x", "key", &["mon"]).is_err());
        assert_eq!(
            gen_keyring("client.x", "key", &[]).unwrap(),
            "[client.x]\n\tkey = key\n"
        );
    }

    #[test]
    fn generated_key_has_native_layout() {
        let key = generate_cephx_key(&mut StepRng::new(1, 1));
        let raw = base64::engine::general_purpose::STANDARD
            .decode(&key)
            .unwrap();
        assert_eq!(raw.len(), 28);
        assert_eq!(&raw[0..2], &[1, 0]);
        assert_eq!(&raw[10..12], &[16, 0]);
    }

    #[test]
    fn disabled_policies_never_rotate() {
        for p in ["", "Disabled"] {
            assert!(!should_rotate_cephx_keys(
                &policy(p, 5),
                &RUNNING,
                &RUNNING,
                &status(1, "19.2.3-0")
            )
            .unwrap());
        }
    }

    #[test]
    fn old_clusters_never_rotate() {
        // checked before the policy so even a bogus policy is not an error
        assert!(!should_rotate_cephx_keys(
            &policy("bogus", 5),
            &CephVersion::new(19, 2, 4),
            &RUNNING,
            &status(1, "19.2.3-0")
        )
        .unwrap());
        assert!(should_rotate_cephx_keys(
            &policy("bogus", 5),
            &RUNNING,
            &RUNNING,
            &status(1, "19.2.3-0")
        )
        .is_err());
    }

    #[test]
    fn key_generation_policy() {
        let cfg = policy(POLICY_KEY_GENERATION, 2);
        assert!(
            should_rotate_cephx_keys(&cfg, &RUNNING, &RUNNING, &status(1, "19.2.3-0")).unwrap()
        );
        assert!(
            !should_rotate_cephx_keys(&cfg, &RUNNING, &RUNNING, &status(2, "19.2.3-0")).unwrap()
        );
        assert!(
            !should_rotate_cephx_keys(&cfg, &RUNNING, &RUNNING, &status(0, UNINITIALIZED))
                .unwrap()
        );
        assert!(should_rotate_cephx_keys(&cfg, &RUNNING, &RUNNING, &status(0, "")).unwrap());
    }

    #[test]
    fn version_update_policy() {
        let cfg = policy(POLICY_WITH_CEPH_VERSION_UPDATE, 0);
        let check = |image: CephVersion, recorded: &str| {
            should_rotate_cephx_keys(&cfg, &RUNNING, &image, &status(1, recorded))
        };
        assert!(!check(CephVersion::default(), "").unwrap());
        assert!(!check(RUNNING, UNINITIALIZED).unwrap());
        assert!(check(RUNNING, "").unwrap());
        assert!(check(RUNNING, "20.2.1-0").unwrap());
        assert!(!check(RUNNING, "20.3.0-0").unwrap());
        assert!(!check(RUNNING, "20.3.0-7").unwrap());
        assert!(!check(RUNNING, "21.0.0-0").unwrap());
        assert!(check(RUNNING, "20.3").is_err());
    }

    #[test]
    fn status_after_rotation() {
        let cfg = policy(POLICY_KEY_GENERATION, 2);
        assert_eq!(
            updated_cephx_status(true, &cfg, &RUNNING, &status(1, "19.2.3-0")),
            status(2, "20.3.0-0")
        );
        assert_eq!(
            updated_cephx_status(true, &policy(POLICY_KEY_GENERATION, 5), &RUNNING, &status(1, "19.2.3-0")),
            status(5, "20.3.0-0")
        );
        assert_eq!(
            updated_cephx_status(false, &cfg, &RUNNING, &status(1, "19.2.3-0")),
            status(1, "19.2.3-0")
        );
        assert_eq!(
            updated_cephx_status(
                true,
                &policy(POLICY_WITH_CEPH_VERSION_UPDATE, 0),
                &RUNNING,
                &status(3, "19.2.3-0")
            ),
            status(4, "20.3.0-0")
        );
    }

    #[test]
    fn status_initialization() {
        assert_eq!(
            updated_cephx_status(false, &policy("", 0), &RUNNING, &status(0, UNINITIALIZED)),
            status(1, "20.3.0-0")
        );
        assert_eq!(
            updated_cephx_status(
                false,
                &policy(POLICY_KEY_GENERATION, 3),
                &RUNNING,
                &status(0, UNINITIALIZED)
            ),
            status(3, "20.3.0-0")
        );
    }
}
