//! gadgetd manages USB gadget devices on Linux through the kernel's
//! configfs-based gadget subsystem and the FunctionFS user-space function
//! interface. Clients create, configure and bind gadgets over the system
//! message bus; user-space FunctionFS services are launched as child
//! processes with preopened endpoint file descriptors, analogous to socket
//! activation.
//!
//! ### Requirements
//!
//! The Linux kernel configuration options `CONFIG_USB_GADGET`,
//! `CONFIG_USB_CONFIGFS` and `CONFIG_USB_CONFIGFS_F_FS` need to be enabled
//! and the `configfs` filesystem must be mounted.
//!
//! root permissions are required to run the daemon.
//!
//! Spawned FunctionFS services use the [`activation`] module to recover
//! their preopened endpoint file descriptors.

#![warn(missing_docs)]

#[cfg(not(target_os = "linux"))]
compile_error!("gadgetd only supports Linux");

use proc_mounts::MountIter;
use std::{ffi::OsStr, io::ErrorKind, path::PathBuf, process::Command};

pub mod activation;
pub mod config;
pub mod configfs;
pub mod core;
pub mod dbus;
pub mod error;
pub mod ffs;
pub mod lang;
pub mod objects;
pub mod probe;
pub mod pump;
pub mod registry;
pub mod udc;

pub use error::{Error, Result};

/// 8-bit value to hexadecimal notation.
fn hex_u8(value: u8) -> String {
    format!("0x{:02x}", value)
}

/// 16-bit value to hexadecimal notation.
fn hex_u16(value: u16) -> String {
    format!("0x{:04x}", value)
}

/// Returns where configfs is mounted.
pub fn configfs_mount() -> Result<PathBuf> {
    for mount in MountIter::new().map_err(Error::from)? {
        let Ok(mount) = mount else { continue };
        if mount.fstype == "configfs" {
            return Ok(mount.dest);
        }
    }

    Err(Error::NotFound("configfs mount".into()))
}

/// Request a kernel module to be loaded.
fn request_module(name: impl AsRef<OsStr>) -> Result<()> {
    let mut res = Command::new("modprobe").arg("-q").arg(name.as_ref()).output();

    match res {
        Err(err) if err.kind() == ErrorKind::NotFound => {
            res = Command::new("/sbin/modprobe").arg("-q").arg(name.as_ref()).output();
        }
        _ => (),
    }

    match res {
        Ok(out) if out.status.success() => Ok(()),
        Ok(_) => Err(Error::Other("modprobe failed".into())),
        Err(err) => Err(err.into()),
    }
}
