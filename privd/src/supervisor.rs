//! Startup, launcher supervision and teardown of the daemon.

use crate::{
    auth::Secret,
    config::Config,
    error::Error,
    executor::Executor,
    operations::{Registry, System},
    server::Server,
};
use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd::{chown, getpid, getuid, Group, Pid, User},
};
use privd_log::{debug, info, warn};
use std::{
    fs, io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    signal::unix::{signal, Signal as SignalStream, SignalKind},
    time::interval,
};

/// Run the daemon until the launcher disappears or SIGTERM is received.
pub async fn run(config: Config, secret: Secret, launcher: Pid) -> Result<(), Error> {
    if !getuid().is_root() {
        return Err(Error::PermissionDenied);
    }

    supervise(config, secret, launcher).await
}

/// Serve the channel on behalf of the launcher.
///
/// The channel entry and the PID file are removed however this returns.
pub(crate) async fn supervise(config: Config, secret: Secret, launcher: Pid) -> Result<(), Error> {
    let _pid_file = PidFile::create(&config.pid_file)?;
    let channel = Arc::new(Channel::claim(&config.socket_path)?);

    let executor = Arc::new(Executor::new(config.run_as_timeout));
    let registry = Arc::new(Registry::new(
        Arc::new(System::new(&config)),
        executor.clone(),
    ));

    // Listen for SIGTERM before the monitor can raise it.
    let mut sigterm = signal(SignalKind::terminate())?;

    let monitor = tokio::spawn({
        let channel = channel.clone();
        let probe_interval = config.probe_interval;
        async move {
            watch(launcher, probe_interval).await;
            info!("Launcher {} is gone, shutting down", launcher);
            channel.remove();
            if let Err(err) = kill(getpid(), Signal::SIGTERM) {
                warn!("Failed to terminate: {}", err);
            }
        }
    });

    let result = listen(&channel, &config, secret, registry, &mut sigterm).await;

    monitor.abort();
    // Drops the monitor's handle on the channel.
    let _ = monitor.await;
    executor.kill_all();

    // The channel and the PID file are removed on drop.
    result
}

/// Accept clients until SIGTERM is received.
async fn listen(
    channel: &Channel,
    config: &Config,
    secret: Secret,
    registry: Arc<Registry>,
    sigterm: &mut SignalStream,
) -> Result<(), Error> {
    let server = Server::bind(channel.path(), Arc::new(secret), registry)?;
    channel.hand_over(config.socket_user.as_deref(), config.socket_group.as_deref())?;
    info!("Listening on {}", channel.path().display());

    tokio::select! {
        result = server.serve() => result,
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
            Ok(())
        }
    }
}

/// Complete when the launcher process no longer exists.
///
/// Only `ESRCH` counts as gone; a process we may not signal is alive.
pub async fn watch(launcher: Pid, probe_interval: Duration) {
    let mut interval = interval(probe_interval);
    loop {
        interval.tick().await;
        match kill(launcher, None::<Signal>) {
            Err(Errno::ESRCH) => break,
            Ok(()) | Err(_) => {}
        }
    }
}

/// The PID file, removed on drop.
#[derive(Debug)]
pub struct PidFile(PathBuf);

impl PidFile {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, format!("{}\n", getpid()))?;
        Ok(Self(path.to_path_buf()))
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        remove(&self.0);
    }
}

/// The filesystem entry of the local channel, removed on drop.
#[derive(Debug)]
pub struct Channel(PathBuf);

impl Channel {
    /// Claim the path, removing a stale entry of a previous run.
    pub fn claim<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::remove_file(path) {
            Ok(()) => debug!("Removed stale channel {}", path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(Self(path.to_path_buf()))
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    /// Hand the channel to the trusted user and group.
    pub fn hand_over(&self, user: Option<&str>, group: Option<&str>) -> Result<(), Error> {
        let uid = match user {
            Some(name) => Some(
                User::from_name(name)?
                    .ok_or_else(|| Error::UserNotFound(name.to_string()))?
                    .uid,
            ),
            None => None,
        };
        let gid = match group {
            Some(name) => Some(
                Group::from_name(name)?
                    .ok_or_else(|| Error::GroupNotFound(name.to_string()))?
                    .gid,
            ),
            None => None,
        };

        if uid.is_some() || gid.is_some() {
            chown(self.0.as_path(), uid, gid)?;
            fs::set_permissions(&self.0, fs::Permissions::from_mode(0o660))?;
        }

        Ok(())
    }

    pub fn remove(&self) {
        remove(&self.0);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.remove();
    }
}

fn remove(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!("Failed to remove {}: {}", path.display(), err),
    }
}
