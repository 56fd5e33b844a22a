//! ep0 event reactor and child reaper.
//!
//! The pump owns the set of watched endpoint-zero fds. Each registration
//! runs as a cooperative task on the current-thread runtime: when the fd
//! becomes readable, exactly one fixed-size event is read and dispatched
//! into the daemon, which decides whether polling continues. A companion
//! task watches `SIGCHLD` and moves instances whose handler died into
//! their terminal state.

use nix::{
    errno::Errno,
    sys::wait::{waitpid, WaitPidFlag, WaitStatus},
};
use std::{
    collections::HashMap,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    sync::{Arc, Mutex},
};
use tokio::{
    io::{unix::AsyncFd, Interest},
    signal::unix::{signal, SignalKind},
};

use crate::{core::SharedDaemon, ffs::blocks::Event, Error, Result};

/// The ep0 event reactor.
#[derive(Debug, Default)]
pub struct EventPump {
    watches: Mutex<HashMap<RawFd, tokio::task::JoinHandle<()>>>,
}

impl EventPump {
    /// Creates an empty pump.
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch an instance's ep0 fd, dispatching its events into the daemon.
    pub fn register(self: &Arc<Self>, daemon: SharedDaemon, gadget: String, function: u64, ep0: Arc<OwnedFd>) {
        let fd = ep0.as_raw_fd();
        tracing::debug!("watching ep0 fd {fd} of function {function} in gadget {gadget}");

        let pump = self.clone();
        let task = tokio::spawn(async move {
            watch_ep0(daemon, &gadget, function, ep0).await;
            pump.watches.lock().unwrap().remove(&fd);
        });

        if let Some(old) = self.watches.lock().unwrap().insert(fd, task) {
            old.abort();
        }
    }

    /// Drop a registration. Must be called before the fd is closed.
    pub fn deregister(&self, fd: RawFd) {
        if let Some(task) = self.watches.lock().unwrap().remove(&fd) {
            tracing::debug!("dropping ep0 fd {fd} from the event pump");
            task.abort();
        }
    }

    /// Number of watched fds.
    pub fn len(&self) -> usize {
        self.watches.lock().unwrap().len()
    }

    /// Whether no fd is watched.
    pub fn is_empty(&self) -> bool {
        self.watches.lock().unwrap().is_empty()
    }
}

async fn watch_ep0(daemon: SharedDaemon, gadget: &str, function: u64, ep0: Arc<OwnedFd>) {
    let afd = match AsyncFd::with_interest(ep0, Interest::READABLE) {
        Ok(afd) => afd,
        Err(err) => {
            tracing::error!("cannot watch ep0 of function {function} in gadget {gadget}: {err}");
            return;
        }
    };

    'watch: loop {
        let mut guard = match afd.readable().await {
            Ok(guard) => guard,
            Err(err) => {
                tracing::error!("polling ep0 failed: {err}");
                break;
            }
        };

        loop {
            match read_event(afd.get_ref().as_raw_fd()) {
                Ok(Some(event)) => {
                    let keep = daemon.lock().unwrap().handle_ep0_event(gadget, function, event.event);
                    if !keep {
                        break 'watch;
                    }
                }
                Ok(None) => {
                    guard.clear_ready();
                    break;
                }
                Err(err) => {
                    tracing::error!("unable to read event from ffs: {err}");
                    break 'watch;
                }
            }
        }
    }
}

/// Read exactly one event; `None` when the fd is drained.
fn read_event(fd: RawFd) -> Result<Option<Event>> {
    let mut buf = [0u8; Event::SIZE];
    match Errno::result(unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) }) {
        Ok(n) if n as usize == Event::SIZE => Ok(Some(Event::parse(&buf)?)),
        Ok(_) => Err(Error::BadValue("short event read".into())),
        Err(Errno::EAGAIN) => Ok(None),
        Err(errno) => Err(errno.into()),
    }
}

/// Reap exited handler children and update their instances.
pub async fn reap_children(daemon: SharedDaemon) {
    let mut sigchld = match signal(SignalKind::child()) {
        Ok(stream) => stream,
        Err(err) => {
            tracing::error!("cannot install SIGCHLD handler: {err}");
            return;
        }
    };

    while sigchld.recv().await.is_some() {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    if let Some(pid) = status.pid() {
                        tracing::debug!("child {pid} exited: {status:?}");
                        daemon.lock().unwrap().child_exited(pid);
                    }
                }
                Err(Errno::ECHILD) => break,
                Err(err) => {
                    tracing::warn!("waitpid failed: {err}");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ffs::blocks::FfsEvent;

    #[test]
    fn short_event_read() {
        // A pipe with less than one event's worth of data must error out.
        let (rx, tx) = nix::unistd::pipe().unwrap();
        nix::unistd::write(&tx, &[0u8; 5]).unwrap();
        drop(tx);

        assert!(read_event(rx.as_raw_fd()).is_err());
    }

    #[test]
    fn whole_event_read() {
        let (rx, tx) = nix::unistd::pipe().unwrap();
        let mut raw = [0u8; Event::SIZE];
        raw[8] = FfsEvent::Bind.code();
        nix::unistd::write(&tx, &raw).unwrap();

        let event = read_event(rx.as_raw_fd()).unwrap().unwrap();
        assert_eq!(event.event, FfsEvent::Bind);
    }
}
