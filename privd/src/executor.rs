//! Run operations under a different user and group identity.
//!
//! The identity of a process can only be dropped once, so every call
//! forks a disposable worker process that drops its privileges, runs
//! the operation, and sends the outcome back over a single-use socket
//! pair.  The daemon itself always stays root.

use crate::{
    error::{Error, Fault},
    imsg::{self, Message},
};
use close_fds::close_open_fds;
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags},
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{self, fork, ForkResult, Gid, Group, Pid, Uid, User},
};
use parking_lot::Mutex;
use privd_log::{debug, warn};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::HashSet,
    convert::TryFrom,
    io::Read,
    os::unix::{io::AsRawFd, net::UnixStream},
    panic::{self, AssertUnwindSafe},
    thread,
    time::{Duration, Instant},
};

/// Time a worker gets to exit on its own after the acknowledgement.
pub const EXIT_GRACE: Duration = Duration::from_millis(100);

/// Numeric target identity of a worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    /// Target user.
    pub uid: Uid,
    /// Target groups; the first one is the primary group.
    pub gids: Vec<Gid>,
}

impl Identity {
    /// Resolve user and group names, or decimal IDs, to an identity.
    pub fn resolve<S: AsRef<str>>(user: &str, groups: &[S]) -> Result<Self, Error> {
        let uid = match user.parse::<libc::uid_t>() {
            Ok(uid) => Uid::from_raw(uid),
            Err(_) => {
                User::from_name(user)?
                    .ok_or_else(|| Error::UserNotFound(user.to_string()))?
                    .uid
            }
        };

        let gids = groups
            .iter()
            .map(|group| {
                let group = group.as_ref();
                match group.parse::<libc::gid_t>() {
                    Ok(gid) => Ok(Gid::from_raw(gid)),
                    Err(_) => Group::from_name(group)?
                        .map(|group| group.gid)
                        .ok_or_else(|| Error::GroupNotFound(group.to_string())),
                }
            })
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(Self { uid, gids })
    }

    /// Switch the current process to this identity.
    ///
    /// The groups must be set first, setting the user removes the
    /// privileges that are needed to change the groups.
    fn assume(&self) -> Result<(), Error> {
        if let Some(primary) = self.gids.first() {
            cfg_if::cfg_if! {
                if #[cfg(any(target_os = "android", target_os = "freebsd",
                             target_os = "linux", target_os = "openbsd"))] {
                    unistd::setresgid(*primary, *primary, *primary)
                        .map_err(|err| Error::Privdrop("setresgid", err))?;
                } else {
                    unistd::setgid(*primary).map_err(|err| Error::Privdrop("setgid", err))?;
                }
            }

            #[cfg(not(any(target_os = "ios", target_os = "macos", target_os = "redox")))]
            unistd::setgroups(&self.gids).map_err(|err| Error::Privdrop("setgroups", err))?;
        }

        cfg_if::cfg_if! {
            if #[cfg(any(target_os = "android", target_os = "freebsd",
                         target_os = "linux", target_os = "openbsd"))] {
                unistd::setresuid(self.uid, self.uid, self.uid)
                    .map_err(|err| Error::Privdrop("setresuid", err))?;
            } else {
                unistd::setuid(self.uid).map_err(|err| Error::Privdrop("setuid", err))?;
            }
        }

        Ok(())
    }
}

/// Forks workers that run operations under a target identity.
#[derive(Debug)]
pub struct Executor {
    /// Maximum time to wait for an outcome.
    timeout: Duration,
    /// PIDs of the running workers.
    workers: Mutex<HashSet<Pid>>,
}

impl Executor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            workers: Default::default(),
        }
    }

    /// Number of workers that are currently running.
    pub fn in_flight(&self) -> usize {
        self.workers.lock().len()
    }

    /// Forcibly terminate all running workers.
    pub fn kill_all(&self) {
        for pid in self.workers.lock().iter() {
            debug!("Killing worker {}", pid);
            let _ = kill(*pid, Signal::SIGKILL);
        }
    }

    /// Run `operation` in a new worker under `identity`.
    ///
    /// This blocks the calling thread until the worker delivered its
    /// outcome or the timeout expired.  The worker is always reaped
    /// before this function returns.
    pub fn run_as<F, T>(&self, identity: &Identity, operation: F) -> Result<T, Fault>
    where
        F: FnOnce() -> Result<T, Fault>,
        T: Serialize + DeserializeOwned,
    {
        let (channel, remote) = UnixStream::pair().map_err(Error::from)?;

        // The child only runs the operation and never returns from
        // this match, it must not touch the async runtime.
        let pid = match unsafe { fork() }.map_err(Error::from)? {
            ForkResult::Parent { child, .. } => child,
            ForkResult::Child => {
                drop(channel);
                let status = worker(remote, identity, operation);
                unsafe { libc::_exit(status) }
            }
        };
        drop(remote);

        let mut worker = Worker::new(pid, channel, &self.workers);
        worker.outcome(self.timeout)
    }
}

/// The parent's handle of a running worker.
///
/// Dropping it reaps the worker, killing it if required.
struct Worker<'a> {
    pid: Pid,
    channel: UnixStream,
    workers: &'a Mutex<HashSet<Pid>>,
}

impl<'a> Worker<'a> {
    fn new(pid: Pid, channel: UnixStream, workers: &'a Mutex<HashSet<Pid>>) -> Self {
        workers.lock().insert(pid);
        debug!("Started worker {}", pid);
        Self {
            pid,
            channel,
            workers,
        }
    }

    /// Wait for the outcome and acknowledge it.
    fn outcome<T: DeserializeOwned>(&mut self, timeout: Duration) -> Result<T, Fault> {
        if !self.poll(timeout)? {
            warn!("Worker {} timed out after {:?}", self.pid, timeout);
            let _ = kill(self.pid, Signal::SIGKILL);
            return Err(Fault::Timeout);
        }

        // The outcome is written at once; bound the read anyway.
        self.channel
            .set_read_timeout(Some(timeout))
            .map_err(Error::from)?;

        let outcome = match imsg::recv_sync::<Result<T, Fault>>(&mut self.channel) {
            Ok((message, outcome)) if message.id == Message::OUTCOME => outcome,
            Ok((message, _)) => {
                return Err(Fault::Protocol(format!(
                    "unexpected worker message {}",
                    message.id
                )))
            }
            Err(err) => {
                return Err(Fault::WorkerDied(format!(
                    "worker {} sent no outcome: {}",
                    self.pid, err
                )))
            }
        };

        let _ = imsg::send_sync(&mut self.channel, Message::new(Message::ACK), &());

        outcome
    }

    /// Wait until the channel becomes readable.
    fn poll(&self, timeout: Duration) -> Result<bool, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let millis = libc::c_int::try_from(remaining.as_millis()).unwrap_or(libc::c_int::MAX);
            let mut fds = [PollFd::new(self.channel.as_raw_fd(), PollFlags::POLLIN)];

            match poll(&mut fds, millis) {
                Ok(0) => break Ok(false),
                Ok(_) => break Ok(true),
                Err(Errno::EINTR) => continue,
                Err(err) => break Err(err.into()),
            }
        }
    }

    /// Reap the worker, killing it after the grace period.
    fn reap(&mut self) {
        let deadline = Instant::now() + EXIT_GRACE;
        loop {
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(WaitStatus::StillAlive) => {
                    debug!("Killing worker {}", self.pid);
                    match kill(self.pid, Signal::SIGKILL) {
                        // The worker might have exited in the meantime.
                        Ok(()) | Err(Errno::ESRCH) => {}
                        Err(err) => warn!("Failed to kill worker {}: {}", self.pid, err),
                    }
                    let _ = waitpid(self.pid, None);
                    break;
                }
                Ok(WaitStatus::Exited(_, 0)) => break,
                Ok(status) => {
                    debug!("Worker {} terminated: {:?}", self.pid, status);
                    break;
                }
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    warn!("Failed to reap worker {}: {}", self.pid, err);
                    break;
                }
            }
        }
    }
}

impl Drop for Worker<'_> {
    fn drop(&mut self) {
        // Forget the pid before it is reaped and can be reused.
        self.workers.lock().remove(&self.pid);
        self.reap();
    }
}

/// Body of the worker process, returns the exit status.
fn worker<F, T>(mut channel: UnixStream, identity: &Identity, operation: F) -> i32
where
    F: FnOnce() -> Result<T, Fault>,
    T: Serialize,
{
    // Die with the thread that forked us.
    #[cfg(any(target_os = "android", target_os = "linux"))]
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL);
    }

    // Only keep stdio and the outcome channel.
    unsafe {
        close_open_fds(3, &[channel.as_raw_fd()]);
    }

    let outcome = identity.assume().map_err(Fault::from).and_then(|()| {
        panic::catch_unwind(AssertUnwindSafe(operation))
            .unwrap_or_else(|_| Err(Fault::Operation("operation panicked".to_string())))
    });

    if imsg::send_sync(&mut channel, Message::new(Message::OUTCOME), &outcome).is_err() {
        return 1;
    }

    // Wait for the acknowledgement, or until the parent goes away.
    let mut ack = [0u8; Message::HEADER_LENGTH];
    let _ = channel.read(&mut ack);

    0
}

#[cfg(test)]
mod tests {
    use super::{Executor, Identity, Worker, EXIT_GRACE};
    use crate::error::{Error, Fault};
    use nix::{
        errno::Errno,
        sys::signal::kill,
        unistd::{getgid, getgroups, getpid, getuid, Gid, Group, Pid, Uid, User},
    };
    use std::{
        fs,
        os::unix::net::UnixStream,
        process::Command,
        sync::Arc,
        thread,
        time::{Duration, Instant},
    };

    fn current() -> Identity {
        Identity {
            uid: getuid(),
            gids: vec![],
        }
    }

    #[test]
    fn test_resolve_numeric() {
        let identity = Identity::resolve("65534", &["65533", "100"]).unwrap();
        assert_eq!(identity.uid, Uid::from_raw(65534));
        assert_eq!(identity.gids, vec![Gid::from_raw(65533), Gid::from_raw(100)]);
    }

    #[test]
    fn test_resolve_root() {
        let identity = Identity::resolve::<&str>("root", &[]).unwrap();
        assert!(identity.uid.is_root());
        assert!(identity.gids.is_empty());
    }

    #[test]
    fn test_resolve_unknown() {
        assert!(matches!(
            Identity::resolve::<&str>("no-such-user-privd", &[]),
            Err(Error::UserNotFound(_))
        ));
        assert!(matches!(
            Identity::resolve("root", &["no-such-group-privd"]),
            Err(Error::GroupNotFound(_))
        ));
    }

    #[test]
    fn test_success() {
        let executor = Executor::new(Duration::from_secs(10));
        let parent = getpid();

        let (pid, value) = executor
            .run_as(&current(), || Ok((getpid().as_raw(), "sdb".to_string())))
            .unwrap();

        assert_ne!(Pid::from_raw(pid), parent);
        assert_eq!(value, "sdb");
        assert_eq!(executor.in_flight(), 0);
    }

    #[test]
    fn test_error_is_propagated() {
        let executor = Executor::new(Duration::from_secs(10));
        let fault = Fault::Os {
            errno: libc::EACCES,
            message: "Permission denied".to_string(),
        };

        let expected = fault.clone();
        let result = executor.run_as::<_, ()>(&current(), move || Err(fault));

        assert_eq!(result, Err(expected));
    }

    #[test]
    fn test_panic_is_captured() {
        let executor = Executor::new(Duration::from_secs(10));
        let result = executor.run_as::<_, ()>(&current(), || panic!("boom"));

        assert!(matches!(result, Err(Fault::Operation(_))));
        assert_eq!(executor.in_flight(), 0);
    }

    #[test]
    fn test_worker_crash() {
        let executor = Executor::new(Duration::from_secs(10));
        let result = executor.run_as::<_, ()>(&current(), || unsafe { libc::_exit(3) });

        assert!(matches!(result, Err(Fault::WorkerDied(_))));
    }

    #[test]
    fn test_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("worker.pid");
        let executor = Executor::new(Duration::from_secs(1));

        let start = Instant::now();
        let worker_pid_file = pid_file.clone();
        let result = executor.run_as::<_, ()>(&current(), move || {
            fs::write(&worker_pid_file, getpid().to_string()).unwrap();
            thread::sleep(Duration::from_secs(30));
            Ok(())
        });

        assert_eq!(result, Err(Fault::Timeout));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(executor.in_flight(), 0);

        // The worker must be gone, including its zombie.
        let pid: i32 = fs::read_to_string(&pid_file).unwrap().parse().unwrap();
        assert_eq!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH));
    }

    #[test]
    fn test_concurrent_calls() {
        let executor = Arc::new(Executor::new(Duration::from_secs(10)));

        let handles = (0..8i64)
            .map(|i| {
                let executor = executor.clone();
                thread::spawn(move || executor.run_as(&current(), move || Ok(i * i)))
            })
            .collect::<Vec<_>>();

        for (i, handle) in handles.into_iter().enumerate() {
            let i = i as i64;
            assert_eq!(handle.join().unwrap(), Ok(i * i));
        }
        assert_eq!(executor.in_flight(), 0);
    }

    fn nobody() -> Option<(User, Group)> {
        let user = User::from_name("nobody").ok()??;
        let group = ["nogroup", "nobody"]
            .iter()
            .find_map(|name| Group::from_name(name).ok()?)?;
        Some((user, group))
    }

    #[test]
    fn test_groups_before_user() {
        if !getuid().is_root() {
            return;
        }
        let (user, group) = match nobody() {
            Some(nobody) => nobody,
            None => return,
        };

        let executor = Executor::new(Duration::from_secs(10));
        let identity = Identity::resolve(&user.name, &[group.name.as_str()]).unwrap();
        let (uid, gid, groups) = executor
            .run_as(&identity, || {
                let groups = getgroups()?
                    .into_iter()
                    .map(|gid| gid.as_raw())
                    .collect::<Vec<_>>();
                Ok((getuid().as_raw(), getgid().as_raw(), groups))
            })
            .unwrap();

        assert_eq!(uid, user.uid.as_raw());
        assert_eq!(gid, group.gid.as_raw());
        assert_eq!(groups, vec![group.gid.as_raw()]);

        // The parent is still root.
        assert!(getuid().is_root());
    }

    #[test]
    fn test_identities_do_not_mix() {
        if !getuid().is_root() {
            return;
        }
        let (user, group) = match nobody() {
            Some(nobody) => nobody,
            None => return,
        };

        let executor = Arc::new(Executor::new(Duration::from_secs(10)));
        let identities = vec![
            Identity {
                uid: user.uid,
                gids: vec![group.gid],
            },
            Identity {
                uid: Uid::from_raw(0),
                gids: vec![Gid::from_raw(0)],
            },
        ];

        let handles = identities
            .into_iter()
            .cycle()
            .take(6)
            .map(|identity| {
                let executor = executor.clone();
                thread::spawn(move || {
                    let observed = executor.run_as(&identity, || {
                        thread::sleep(Duration::from_millis(50));
                        Ok(unistd_ids())
                    });
                    (identity, observed)
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            let (identity, observed) = handle.join().unwrap();
            assert_eq!(
                observed.unwrap(),
                (identity.uid.as_raw(), identity.gids[0].as_raw())
            );
        }
    }

    #[test]
    fn test_reaped_worker_is_not_tracked() {
        let executor = Executor::new(Duration::from_secs(10));
        let (channel, _remote) = UnixStream::pair().unwrap();

        // A worker that ignores the acknowledgement and must be killed.
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let worker = Worker::new(Pid::from_raw(child.id() as i32), channel, &executor.workers);
        assert_eq!(executor.in_flight(), 1);

        thread::scope(|scope| {
            let reaper = scope.spawn(move || drop(worker));

            thread::sleep(EXIT_GRACE / 2);
            assert!(!reaper.is_finished());
            assert_eq!(executor.in_flight(), 0);
            executor.kill_all();

            reaper.join().unwrap();
        });
    }

    fn unistd_ids() -> (u32, u32) {
        (getuid().as_raw(), getgid().as_raw())
    }
}
