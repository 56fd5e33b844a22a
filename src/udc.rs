//! USB device controllers (UDC).

use std::{
    ffi::OsStr,
    fmt, fs,
    path::{Path, PathBuf},
};

use crate::{Error, Result};

/// USB device controller (UDC).
///
/// Call [`udcs`] to obtain the controllers available on the system. The
/// daemon snapshots the list once at startup.
#[derive(Clone)]
pub struct Udc {
    dir: PathBuf,
}

impl fmt::Debug for Udc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Udc").field("name", &self.name()).finish()
    }
}

impl Udc {
    /// The name of the USB device controller.
    pub fn name(&self) -> &OsStr {
        self.dir.file_name().unwrap_or_else(|| OsStr::new(""))
    }

    /// Indicates current state of the USB device controller.
    ///
    /// Not all controllers support reporting all states.
    pub fn state(&self) -> Result<UdcState> {
        Ok(fs::read_to_string(self.dir.join("state"))
            .map_err(Error::from)?
            .trim()
            .parse()
            .unwrap_or_default())
    }
}

/// USB device controller (UDC) connection state.
#[derive(Default, Debug, strum::Display, strum::EnumString, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum UdcState {
    /// Not attached.
    #[strum(serialize = "not attached")]
    NotAttached,
    /// Attached.
    #[strum(serialize = "attached")]
    Attached,
    /// Powered.
    #[strum(serialize = "powered")]
    Powered,
    /// Default.
    #[strum(serialize = "default")]
    Default,
    /// Addressed.
    #[strum(serialize = "addressed")]
    Addressed,
    /// Configured.
    #[strum(serialize = "configured")]
    Configured,
    /// Suspended.
    #[strum(serialize = "suspended")]
    Suspended,
    /// Unknown state.
    #[default]
    #[strum(serialize = "UNKNOWN")]
    Unknown,
}

/// Gets the available USB device controllers under the given sysfs class
/// directory, sorted by name.
pub fn udcs(class_dir: &Path) -> Result<Vec<Udc>> {
    if !class_dir.is_dir() {
        return Err(Error::NotFound(format!("sysfs class directory {}", class_dir.display())));
    }

    let udc_dir = class_dir.join("udc");
    if !udc_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut udcs = Vec::new();
    for entry in fs::read_dir(&udc_dir).map_err(Error::from)? {
        let entry = entry.map_err(Error::from)?;
        udcs.push(Udc { dir: entry.path() });
    }

    udcs.sort_by_key(|udc| udc.name().to_os_string());
    Ok(udcs)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn discovery() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("udc/fe980000.usb")).unwrap();
        fs::create_dir_all(tmp.path().join("udc/dummy_udc.0")).unwrap();
        fs::write(tmp.path().join("udc/dummy_udc.0/state"), "not attached\n").unwrap();

        let udcs = udcs(tmp.path()).unwrap();
        assert_eq!(udcs.len(), 2);
        assert_eq!(udcs[0].name(), "dummy_udc.0");
        assert_eq!(udcs[0].state().unwrap(), UdcState::NotAttached);
        assert_eq!(udcs[1].name(), "fe980000.usb");
    }

    #[test]
    fn no_udc_dir() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(udcs(tmp.path()).unwrap().is_empty());
    }
}
