//! Endpoint fd recovery for spawned FunctionFS services.
//!
//! The daemon launches a service handler with its endpoint file descriptors
//! occupying a contiguous range starting at fd 3, index 0 always being ep0
//! and the remaining indices following the ascending numeric order of the
//! endpoint files. The environment carries `LISTEN_FDS`, `LISTEN_PID` and
//! `ACTIVATION_EVENT`; handlers call into this module to recover them.

use nix::{errno::Errno, unistd};
use std::{env, os::fd::RawFd};

use crate::{ffs::blocks::FfsEvent, Error, Result};

/// First endpoint fd in a spawned service.
pub const ENDPOINT_FDS_START: RawFd = 3;

/// Number of endpoint fds passed to this process.
///
/// Returns zero when the activation environment is absent or addressed at
/// another process. Each fd in the range is marked close-on-exec. With
/// `unset_environment` the variables are removed so they do not leak into
/// further children.
pub fn endpoint_fd_count(unset_environment: bool) -> Result<usize> {
    let result = (|| {
        let Ok(pid) = env::var("LISTEN_PID") else { return Ok(0) };
        let pid: i32 =
            pid.parse().map_err(|_| Error::InvalidParam(format!("bad LISTEN_PID value {pid:?}")))?;
        if pid <= 0 {
            return Err(Error::InvalidParam(format!("bad LISTEN_PID value {pid}")));
        }

        // Addressed at another process?
        if unistd::getpid().as_raw() != pid {
            return Ok(0);
        }

        let Ok(count) = env::var("LISTEN_FDS") else { return Ok(0) };
        let count: usize =
            count.parse().map_err(|_| Error::InvalidParam(format!("bad LISTEN_FDS value {count:?}")))?;

        for fd in ENDPOINT_FDS_START..ENDPOINT_FDS_START + count as RawFd {
            let flags = Errno::result(unsafe { libc::fcntl(fd, libc::F_GETFD) }).map_err(Error::from)?;
            if flags & libc::FD_CLOEXEC != 0 {
                continue;
            }
            Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) })
                .map_err(Error::from)?;
        }

        Ok(count)
    })();

    if unset_environment {
        env::remove_var("LISTEN_PID");
        env::remove_var("LISTEN_FDS");
    }

    result
}

/// Fd of the endpoint with the given index.
///
/// Index 0 is ep0. The caller is responsible for bounding the index by
/// [`endpoint_fd_count`].
pub fn endpoint_fd(index: usize) -> RawFd {
    ENDPOINT_FDS_START + index as RawFd
}

/// Endpoint index of a recovered fd.
pub fn endpoint_index(fd: RawFd) -> usize {
    (fd - ENDPOINT_FDS_START) as usize
}

/// Activation event that triggered the spawn.
pub fn activation_event(unset_environment: bool) -> Result<FfsEvent> {
    let result = match env::var("ACTIVATION_EVENT") {
        Ok(value) => match value.parse::<u8>().ok().and_then(FfsEvent::from_repr) {
            Some(event) => Ok(event),
            None => Err(Error::BadValue(format!("bad ACTIVATION_EVENT value {value:?}"))),
        },
        Err(_) => Err(Error::NotDefined("ACTIVATION_EVENT".into())),
    };

    if unset_environment {
        env::remove_var("ACTIVATION_EVENT");
    }

    result
}

#[cfg(test)]
mod test {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        env::remove_var("LISTEN_PID");
        env::remove_var("LISTEN_FDS");
        env::remove_var("ACTIVATION_EVENT");
    }

    #[test]
    #[serial]
    fn no_environment() {
        clear_env();
        assert_eq!(endpoint_fd_count(false).unwrap(), 0);
        assert!(matches!(activation_event(false), Err(Error::NotDefined(_))));
    }

    #[test]
    #[serial]
    fn foreign_pid() {
        clear_env();
        env::set_var("LISTEN_PID", "1");
        env::set_var("LISTEN_FDS", "3");
        assert_eq!(endpoint_fd_count(false).unwrap(), 0);
        clear_env();
    }

    #[test]
    #[serial]
    fn own_pid_and_unset() {
        clear_env();
        env::set_var("LISTEN_PID", unistd::getpid().to_string());
        env::set_var("LISTEN_FDS", "0");
        assert_eq!(endpoint_fd_count(true).unwrap(), 0);
        assert!(env::var("LISTEN_PID").is_err());
        assert!(env::var("LISTEN_FDS").is_err());
    }

    #[test]
    #[serial]
    fn event_recovery() {
        clear_env();
        env::set_var("ACTIVATION_EVENT", "2");
        assert_eq!(activation_event(true).unwrap(), FfsEvent::Enable);
        assert!(env::var("ACTIVATION_EVENT").is_err());

        env::set_var("ACTIVATION_EVENT", "junk");
        assert!(matches!(activation_event(true), Err(Error::BadValue(_))));
    }

    #[test]
    fn index_mapping() {
        assert_eq!(endpoint_fd(0), 3);
        assert_eq!(endpoint_fd(2), 5);
        assert_eq!(endpoint_index(5), 2);
    }
}
