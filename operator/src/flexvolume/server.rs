//! Installs the driver on the host and serves the coordinator on a socket next to it.
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::Context as _;
use nix::sys::{stat::utimes, time::TimeVal};
use tokio::{net::UnixListener, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    error::Result,
    flexvolume::{
        mountdir::driver_dir,
        plugin::{Capabilities, DriverStatus},
        rpc::serve_connection,
        VolumeController, DEFAULT_DRIVER_NAME, FLEXVOLUME_VENDOR, FLEXVOLUME_VENDOR_LEGACY,
        SETTINGS_FILE_NAME, UNIX_SOCKET_NAME,
    },
    utils::write_file_atomic,
};

/// First delay between touches of the driver files.
pub const INITIAL_TOUCH_INTERVAL: Duration = Duration::from_secs(2 * 60);
/// Longest delay between touches of the driver files.
pub const MAX_TOUCH_INTERVAL: Duration = Duration::from_secs(32 * 60);

/// The delay that follows `current`: doubled, capped at [`MAX_TOUCH_INTERVAL`].
pub fn next_touch_interval(current: Duration) -> Duration {
    (current * 2).min(MAX_TOUCH_INTERVAL)
}

/// Vendor and driver names the agent installs itself under.
pub fn driver_targets(operator_namespace: &str, legacy_vendor: bool) -> Vec<(String, String)> {
    let mut targets = vec![(FLEXVOLUME_VENDOR.to_owned(), DEFAULT_DRIVER_NAME.to_owned())];
    if !operator_namespace.is_empty() && operator_namespace != DEFAULT_DRIVER_NAME {
        targets.push((FLEXVOLUME_VENDOR.to_owned(), operator_namespace.to_owned()));
    }
    if legacy_vendor {
        targets.push((
            FLEXVOLUME_VENDOR_LEGACY.to_owned(),
            DEFAULT_DRIVER_NAME.to_owned(),
        ));
    }
    targets
}

/// Copy the driver binary into `<flexvolume_dir>/<vendor>~<driver>/<driver>` and write its
/// capability descriptor next to it. Both files are replaced atomically.
pub fn install_driver(
    flexvolume_dir: &Path,
    vendor: &str,
    driver: &str,
    binary: &Path,
    capabilities: &Capabilities,
) -> Result<PathBuf> {
    let dir = driver_dir(flexvolume_dir, vendor, driver);
    let contents = fs::read(binary)
        .with_context(|| format!("failed to read driver binary {}", binary.display()))?;
    write_file_atomic(&dir.join(driver), &contents, 0o755)?;

    let settings = DriverStatus {
        capabilities: Some(capabilities.clone()),
        ..DriverStatus::success()
    };
    let settings = serde_json::to_vec(&settings).map_err(anyhow::Error::from)?;
    write_file_atomic(&dir.join(SETTINGS_FILE_NAME), &settings, 0o644)?;
    info!(dir = %dir.display(), "installed flexvolume driver");
    Ok(dir)
}

/// Update the access and modification times of `path` to now.
fn touch_file(path: &Path) -> Result<()> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let time = TimeVal::new(now.as_secs() as _, now.subsec_micros() as _);
    utimes(path, &time, &time)
        .with_context(|| format!("failed to touch {}", path.display()))?;
    Ok(())
}

struct Listener {
    socket: PathBuf,
    accept: JoinHandle<()>,
    touch: JoinHandle<()>,
}

/// Serves one coordinator on a socket per installed driver.
pub struct FlexvolumeServer<C: ?Sized> {
    controller: Arc<C>,
    touch_interval: Duration,
    listeners: Vec<Listener>,
}

impl<C> FlexvolumeServer<C>
where
    C: VolumeController + ?Sized + 'static,
{
    /// Server dispatching calls to `controller`.
    pub fn new(controller: Arc<C>) -> Self {
        Self {
            controller,
            touch_interval: INITIAL_TOUCH_INTERVAL,
            listeners: Vec::new(),
        }
    }

    #[cfg(test)]
    fn with_touch_interval(mut self, interval: Duration) -> Self {
        self.touch_interval = interval;
        self
    }

    /// Install the driver as `vendor~driver` and start accepting calls on its socket.
    /// Returns the socket path.
    pub async fn start(
        &mut self,
        flexvolume_dir: &Path,
        vendor: &str,
        driver: &str,
        binary: &Path,
        capabilities: &Capabilities,
    ) -> Result<PathBuf> {
        let dir = install_driver(flexvolume_dir, vendor, driver, binary, capabilities)?;
        let socket = dir.join(UNIX_SOCKET_NAME);
        match fs::remove_file(&socket) {
            Ok(()) => debug!(socket = %socket.display(), "removed stale socket"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(anyhow::Error::from(err)
                    .context(format!("failed to remove stale socket {}", socket.display()))
                    .into())
            }
        }
        let listener = UnixListener::bind(&socket)
            .with_context(|| format!("failed to listen on {}", socket.display()))?;
        fs::set_permissions(&socket, fs::Permissions::from_mode(0o770))
            .with_context(|| format!("failed to set permissions on {}", socket.display()))?;

        let controller = self.controller.clone();
        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let controller = controller.clone();
                        tokio::spawn(async move {
                            if let Err(err) = serve_connection(controller, stream).await {
                                warn!(%err, "driver connection failed");
                            }
                        });
                    }
                    Err(err) => {
                        error!(%err, "failed to accept driver connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        let files = vec![dir.join(driver), socket.clone()];
        let mut interval = self.touch_interval;
        let touch = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                for file in &files {
                    if let Err(err) = touch_file(file) {
                        warn!(%err, "failed to refresh driver file");
                    }
                }
                interval = next_touch_interval(interval);
            }
        });

        info!(socket = %socket.display(), "listening for flexvolume driver calls");
        self.listeners.push(Listener {
            socket: socket.clone(),
            accept,
            touch,
        });
        Ok(socket)
    }

    /// Close every listener and remove its socket.
    pub fn stop_all(&mut self) {
        for listener in self.listeners.drain(..) {
            listener.accept.abort();
            listener.touch.abort();
            if let Err(err) = fs::remove_file(&listener.socket) {
                debug!(socket = %listener.socket.display(), %err, "socket not removed");
            }
        }
    }
}

impl<C: ?Sized> Drop for FlexvolumeServer<C> {
    fn drop(&mut self) {
        for listener in &self.listeners {
            listener.accept.abort();
            listener.touch.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::FileTypeExt;

    use super::*;
    use crate::flexvolume::{
        rpc::RpcClient, stub::MockVolumeControllerTest, AttachOptions,
    };

    fn fake_binary(dir: &Path) -> PathBuf {
        let binary = dir.join("rookflex");
        fs::write(&binary, b"#!/bin/sh\necho driver\n").unwrap();
        binary
    }

    #[test]
    fn touch_intervals_double_to_cap() {
        let mut interval = INITIAL_TOUCH_INTERVAL;
        let mut minutes = vec![interval.as_secs() / 60];
        for _ in 0..6 {
            interval = next_touch_interval(interval);
            minutes.push(interval.as_secs() / 60);
        }
        assert_eq!(minutes, vec![2, 4, 8, 16, 32, 32, 32]);
    }

    #[test]
    fn targets() {
        assert_eq!(
            driver_targets("rook-ceph", true),
            vec![
                ("ceph.rook.io".to_owned(), "rook".to_owned()),
                ("ceph.rook.io".to_owned(), "rook-ceph".to_owned()),
                ("rook.io".to_owned(), "rook".to_owned()),
            ]
        );
        assert_eq!(driver_targets("rook", false).len(), 1);
    }

    #[test]
    fn installs_binary_and_settings() {
        let src = tempfile::tempdir().unwrap();
        let flexmnt = tempfile::tempdir().unwrap();
        let binary = fake_binary(src.path());

        let dir = install_driver(
            flexmnt.path(),
            "ceph.rook.io",
            "rook",
            &binary,
            &Capabilities::new(false, true),
        )
        .unwrap();

        assert_eq!(dir, flexmnt.path().join("ceph.rook.io~rook"));
        let installed = dir.join("rook");
        assert_eq!(fs::read(&installed).unwrap(), fs::read(&binary).unwrap());
        assert_eq!(
            fs::metadata(&installed).unwrap().permissions().mode() & 0o777,
            0o755
        );
        let settings: DriverStatus =
            serde_json::from_slice(&fs::read(dir.join(SETTINGS_FILE_NAME)).unwrap()).unwrap();
        assert_eq!(settings.capabilities, Some(Capabilities::new(false, true)));
        let leftovers: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with('.'))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[tokio::test]
    async fn serves_calls_on_socket() {
        let src = tempfile::tempdir().unwrap();
        let flexmnt = tempfile::tempdir().unwrap();
        let binary = fake_binary(src.path());
        // A stale socket from a previous agent.
        let dir = flexmnt.path().join("ceph.rook.io~rook");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(UNIX_SOCKET_NAME), b"").unwrap();

        let mut controller = MockVolumeControllerTest::new();
        controller
            .expect_attach()
            .times(1)
            .returning(|_| Ok("/dev/rbd7".to_owned()));
        let mut server = FlexvolumeServer::new(Arc::new(controller))
            .with_touch_interval(Duration::from_millis(20));

        let socket = server
            .start(
                flexmnt.path(),
                "ceph.rook.io",
                "rook",
                &binary,
                &Capabilities::new(false, true),
            )
            .await
            .unwrap();

        let metadata = fs::metadata(&socket).unwrap();
        assert!(metadata.file_type().is_socket());
        assert_eq!(metadata.permissions().mode() & 0o777, 0o770);

        let client = RpcClient::connect(&socket).await.unwrap();
        assert_eq!(
            client.attach(&AttachOptions::default()).await.unwrap(),
            "/dev/rbd7"
        );

        let before = fs::metadata(dir.join("rook")).unwrap().modified().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let after = fs::metadata(dir.join("rook")).unwrap().modified().unwrap();
        assert!(after >= before);

        server.stop_all();
        assert!(!socket.exists());
    }
}
