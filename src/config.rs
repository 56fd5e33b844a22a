//! Daemon configuration file.

use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::{Error, Result};

/// Default configuration file location.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/gadgetd/gadgetd.conf";

/// Process-wide daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DaemonConfig {
    /// Mount point of configfs. Discovered from the mount table when unset.
    pub configfs_mount_point: Option<PathBuf>,
    /// Directory containing FunctionFS service files.
    pub ffs_service_dir: PathBuf,
    /// Root under which per-instance FunctionFS mounts are created.
    pub ffs_mount_root: PathBuf,
    /// Default gadget declaration kept for provisioning tools.
    pub default_gadget: Option<DefaultGadget>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            configfs_mount_point: Some("/sys/kernel/config".into()),
            ffs_service_dir: "/etc/gadgetd/functions.d".into(),
            ffs_mount_root: "/tmp/gadgetd".into(),
            default_gadget: None,
        }
    }
}

/// Gadget defaults carried in the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DefaultGadget {
    /// USB specification version in BCD.
    #[serde(rename = "bcdUSB")]
    pub bcd_usb: Option<u16>,
    /// Device class code.
    #[serde(rename = "bDeviceClass")]
    pub device_class: Option<u8>,
    /// Device subclass code.
    #[serde(rename = "bDeviceSubClass")]
    pub device_sub_class: Option<u8>,
    /// Device protocol code.
    #[serde(rename = "bDeviceProtocol")]
    pub device_protocol: Option<u8>,
    /// Maximum endpoint 0 packet size.
    #[serde(rename = "bMaxPacketSize0")]
    pub max_packet_size0: Option<u8>,
    /// Vendor id.
    #[serde(rename = "idVendor")]
    pub id_vendor: Option<u16>,
    /// Product id.
    #[serde(rename = "idProduct")]
    pub id_product: Option<u16>,
    /// Device release number in BCD.
    #[serde(rename = "bcdDevice")]
    pub bcd_device: Option<u16>,
    /// Serial number string.
    pub serial_number: Option<String>,
    /// Manufacturer string.
    pub manufacturer: Option<String>,
    /// Product name string.
    pub product_name: Option<String>,
    /// Configuration description string.
    pub configuration: Option<String>,
}

impl DaemonConfig {
    /// Read the configuration from the given file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|err| Error::FileOpenFailed(format!("{}: {err}", path.display())))?;
        toml::from_str(&data).map_err(|err| Error::BadValue(format!("{}: {err}", path.display())))
    }

    /// Read the configuration from `path`, or from the default location.
    ///
    /// An explicitly given path that cannot be read is an error; a missing
    /// file at the default location falls back to built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => match Self::load(Path::new(DEFAULT_CONFIG_FILE)) {
                Ok(config) => Ok(config),
                Err(Error::FileOpenFailed(_)) => {
                    tracing::info!("no configuration file at {DEFAULT_CONFIG_FILE}, using defaults");
                    Ok(Self::default())
                }
                Err(err) => Err(err),
            },
        }
    }
}
