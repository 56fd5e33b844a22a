//! Child launch for FunctionFS services.
//!
//! Hands the child a contiguous range of endpoint file descriptors starting
//! at the activation base fd and tells it so through the activation
//! environment. The fd shuffle follows the socket-activation discipline:
//! open the endpoint table, close every stray fd, shift the table into
//! place, then exec.

use nix::{
    errno::Errno,
    sys::resource::{getrlimit, Resource},
    unistd::{self, ForkResult, Pid},
};
use std::{
    ffi::CString,
    fs,
    os::fd::RawFd,
    os::unix::prelude::OsStrExt,
    path::Path,
};

use super::{blocks::FfsEvent, FfsService};
use crate::{activation::ENDPOINT_FDS_START, Error, Result};

/// Maximum number of endpoint fds handed to a child.
pub const MAX_ENDPOINTS: usize = 32;

fn dup_to(fd: RawFd, min: RawFd) -> Result<RawFd> {
    Errno::result(unsafe { libc::fcntl(fd, libc::F_DUPFD, min) }).map_err(Error::from)
}

fn clear_cloexec(fd: RawFd) -> Result<()> {
    Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFD, 0) }).map_err(Error::from)?;
    Ok(())
}

fn clear_status_flags(fd: RawFd) -> Result<()> {
    Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFL, 0) }).map_err(Error::from)?;
    Ok(())
}

fn close_tolerant(fd: RawFd) -> Result<()> {
    match unistd::close(fd) {
        Ok(()) | Err(Errno::EINTR) | Err(Errno::EBADF) => Ok(()),
        Err(errno) => Err(errno.into()),
    }
}

/// Data endpoint names of a FunctionFS mount, ascending by number.
///
/// Matches `ep<number>` entries, ignoring `ep0` which is already open.
fn endpoint_names(mount_dir: &Path) -> Result<Vec<String>> {
    let mut endpoints = Vec::new();
    for entry in fs::read_dir(mount_dir).map_err(Error::from)? {
        let entry = entry.map_err(Error::from)?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(number) = name.strip_prefix("ep") else { continue };
        let Ok(number) = number.parse::<u32>() else { continue };
        if number == 0 {
            continue;
        }
        endpoints.push((number, name.to_string()));
    }

    endpoints.sort_by_key(|(number, _)| *number);
    Ok(endpoints.into_iter().map(|(_, name)| name).collect())
}

/// Open the endpoint fd table: ep0 first, then the data endpoints in
/// ascending numeric order.
fn open_fd_table(ep0: RawFd, mount_dir: &Path) -> Result<Vec<RawFd>> {
    use std::os::unix::prelude::IntoRawFd;

    let names = endpoint_names(mount_dir)?;
    if names.len() + 1 > MAX_ENDPOINTS {
        return Err(Error::BadValue(format!("more than {MAX_ENDPOINTS} endpoints")));
    }

    let mut fds = vec![ep0];
    for name in names {
        let file = fs::File::options().read(true).write(true).open(mount_dir.join(name))?;
        fds.push(file.into_raw_fd());
    }

    Ok(fds)
}

/// Close every fd except the table and stdio.
///
/// Fast path enumerates `/proc/self/fd`; the fallback walks up to the soft
/// fd limit. Both tolerate `EINTR` and `EBADF`.
fn close_stray_fds(keep: &[RawFd]) -> Result<()> {
    let listed: Option<Vec<RawFd>> = match fs::read_dir("/proc/self/fd") {
        Ok(dir) => {
            let mut fds = Vec::new();
            for entry in dir.flatten() {
                if let Some(fd) = entry.file_name().to_str().and_then(|name| name.parse().ok()) {
                    fds.push(fd);
                }
            }
            // The directory handle is gone here, so closing its former fd
            // below just reports EBADF.
            Some(fds)
        }
        Err(_) => None,
    };

    match listed {
        Some(fds) => {
            for fd in fds {
                if fd >= ENDPOINT_FDS_START && !keep.contains(&fd) {
                    close_tolerant(fd)?;
                }
            }
        }
        None => {
            let (soft, _hard) = getrlimit(Resource::RLIMIT_NOFILE).map_err(Error::from)?;
            for fd in ENDPOINT_FDS_START..soft as RawFd {
                if !keep.contains(&fd) {
                    close_tolerant(fd)?;
                }
            }
        }
    }

    Ok(())
}

/// Shift the fd table into the contiguous range starting at the activation
/// base.
///
/// `dup` may return an unrelated free fd, so passes restart from the first
/// entry still out of place. Duplicates drop close-on-exec; entries already
/// in place get it cleared explicitly since this process opens all files
/// close-on-exec.
fn shift_fds(fds: &mut [RawFd]) -> Result<()> {
    let mut start = 0;
    loop {
        let mut restart_from = None;

        for i in start..fds.len() {
            let want = ENDPOINT_FDS_START + i as RawFd;
            if fds[i] == want {
                clear_cloexec(fds[i])?;
                continue;
            }

            let fd = dup_to(fds[i], want)?;
            match unistd::close(fds[i]) {
                Ok(()) | Err(Errno::EINTR) => (),
                Err(errno) => return Err(errno.into()),
            }
            fds[i] = fd;

            if fd != want && restart_from.is_none() {
                restart_from = Some(i);
            }
        }

        match restart_from {
            Some(i) => start = i,
            None => break,
        }
    }

    Ok(())
}

/// The activation environment: exactly `LISTEN_FDS`, `LISTEN_PID` and
/// `ACTIVATION_EVENT`.
fn child_env(n_fds: usize, event: FfsEvent) -> Result<Vec<CString>> {
    let nul = |_| Error::InvalidParam("embedded NUL in environment".into());
    Ok(vec![
        CString::new(format!("LISTEN_FDS={n_fds}")).map_err(nul)?,
        CString::new(format!("LISTEN_PID={}", unistd::getpid())).map_err(nul)?,
        CString::new(format!("ACTIVATION_EVENT={}", event.code())).map_err(nul)?,
    ])
}

/// Apply the service's chroot, working directory and credentials.
fn apply_privileges(service: &FfsService) -> Result<()> {
    if let Some(root) = &service.chroot_dir {
        unistd::chroot(root.as_path()).map_err(Error::from)?;
        unistd::chdir("/").map_err(Error::from)?;
    }
    if let Some(dir) = &service.working_dir {
        unistd::chdir(dir.as_path()).map_err(Error::from)?;
    }
    if let Some(gid) = service.gid {
        unistd::setgid(gid).map_err(Error::from)?;
    }
    if let Some(uid) = service.uid {
        unistd::setuid(uid).map_err(Error::from)?;
    }
    Ok(())
}

/// Child side: prepare the fd range, compose argv and envp, exec.
fn exec_service(service: &FfsService, mount_dir: &Path, ep0: RawFd) -> Result<()> {
    let mut fds = open_fd_table(ep0, mount_dir)?;
    close_stray_fds(&fds)?;
    shift_fds(&mut fds)?;

    // ep0 was polled non-blocking by the daemon; the child expects plain
    // blocking reads.
    clear_status_flags(ENDPOINT_FDS_START)?;

    apply_privileges(service)?;

    let exec = CString::new(service.exec_path.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidParam("embedded NUL in exec path".into()))?;
    let argv = [exec.clone()];
    let envp = child_env(fds.len(), service.activation_event)?;

    unistd::execve(&exec, &argv, &envp).map_err(Error::from)?;
    Ok(())
}

/// Fork and exec the service handler over a prepared FunctionFS mount.
///
/// The child inherits `ep0` and opens the data endpoints itself; in the
/// parent the returned pid is recorded by the caller, which also closes its
/// copy of `ep0`.
pub fn launch(service: &FfsService, mount_dir: &Path, ep0: RawFd) -> Result<Pid> {
    match unsafe { unistd::fork() }.map_err(Error::from)? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            if let Err(err) = exec_service(service, mount_dir, ep0) {
                eprintln!("gadgetd: starting ffs service {}: {err}", service.name);
            }
            std::process::exit(-1);
        }
    }
}
