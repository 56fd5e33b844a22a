//! Kernel gadget store in configfs.
//!
//! Typed access to the `usb_gadget` tree: gadget directories, device
//! descriptor attributes, string tables, configurations, function
//! directories and UDC bindings. All operations act directly on the kernel
//! state; the daemon keeps no shadow copy of attribute values.

use std::{
    fs,
    io::ErrorKind,
    os::unix::fs::symlink,
    path::{Path, PathBuf},
};

use crate::{hex_u16, hex_u8, lang::LangId, request_module, Error, Result};

/// Gadget device descriptor attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
pub enum GadgetAttr {
    /// USB specification version in BCD.
    #[strum(serialize = "bcdUSB")]
    BcdUsb,
    /// Device class code.
    #[strum(serialize = "bDeviceClass")]
    DeviceClass,
    /// Device subclass code.
    #[strum(serialize = "bDeviceSubClass")]
    DeviceSubClass,
    /// Device protocol code.
    #[strum(serialize = "bDeviceProtocol")]
    DeviceProtocol,
    /// Maximum endpoint 0 packet size.
    #[strum(serialize = "bMaxPacketSize0")]
    MaxPacketSize0,
    /// Vendor id.
    #[strum(serialize = "idVendor")]
    IdVendor,
    /// Product id.
    #[strum(serialize = "idProduct")]
    IdProduct,
    /// Device release number in BCD.
    #[strum(serialize = "bcdDevice")]
    BcdDevice,
}

impl GadgetAttr {
    /// Whether the attribute is a 16-bit descriptor field.
    pub fn is_u16(&self) -> bool {
        matches!(self, Self::BcdUsb | Self::IdVendor | Self::IdProduct | Self::BcdDevice)
    }
}

/// Gadget string-table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum GadgetString {
    /// Serial number.
    #[strum(serialize = "serialnumber")]
    SerialNumber,
    /// Manufacturer name.
    #[strum(serialize = "manufacturer")]
    Manufacturer,
    /// Product name.
    #[strum(serialize = "product")]
    Product,
}

impl GadgetString {
    /// All string slots of a language.
    pub const ALL: [Self; 3] = [Self::SerialNumber, Self::Manufacturer, Self::Product];
}

/// Handle to the `usb_gadget` tree of a mounted configfs.
#[derive(Debug, Clone)]
pub struct GadgetFs {
    root: PathBuf,
}

impl GadgetFs {
    /// Open the gadget tree under the given configfs mount point.
    pub fn new(configfs: &Path) -> Result<Self> {
        let _ = request_module("libcomposite");

        let root = configfs.join("usb_gadget");
        if root.is_dir() {
            Ok(Self { root })
        } else {
            Err(Error::NotFound(format!("usb_gadget tree at {}", root.display())))
        }
    }

    /// Directory of the given gadget.
    pub fn gadget_dir(&self, gadget: &str) -> PathBuf {
        self.root.join(gadget)
    }

    /// Names of all gadgets present in the kernel store.
    pub fn gadget_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in dir_entries(&self.root)? {
            if entry.path().is_dir() {
                if let Ok(name) = entry.file_name().into_string() {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Create a gadget directory.
    pub fn create_gadget(&self, gadget: &str) -> Result<()> {
        let dir = self.gadget_dir(gadget);
        tracing::debug!("creating gadget at {}", dir.display());
        create_dir(&dir).map_err(|err| match err {
            Error::Exist(_) => Error::Exist(format!("gadget {gadget} already exists")),
            err => err,
        })?;

        // The kernel materializes these on real configfs; creating them here
        // keeps the layout identical on plain filesystems.
        for sub in ["configs", "functions", "strings"] {
            match create_dir(&dir.join(sub)) {
                Ok(()) | Err(Error::Exist(_)) => (),
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }

    /// Write a device descriptor attribute.
    pub fn set_attr(&self, gadget: &str, attr: GadgetAttr, value: u16) -> Result<()> {
        let path = self.gadget_dir(gadget).join(attr.to_string());
        let text = if attr.is_u16() {
            hex_u16(value)
        } else {
            let value =
                u8::try_from(value).map_err(|_| Error::InvalidParam(format!("{attr} is an 8-bit field")))?;
            hex_u8(value)
        };
        tracing::debug!("setting {} to {text}", path.display());
        fs::write(&path, text).map_err(Error::from)
    }

    /// Read a device descriptor attribute.
    pub fn get_attr(&self, gadget: &str, attr: GadgetAttr) -> Result<u16> {
        let path = self.gadget_dir(gadget).join(attr.to_string());
        let data = fs::read_to_string(&path)?;
        parse_hex(data.trim()).ok_or_else(|| Error::BadValue(format!("{}: {}", path.display(), data.trim())))
    }

    /// Create the string table directory for a language.
    pub fn ensure_lang(&self, gadget: &str, lang: LangId) -> Result<()> {
        let dir = self.gadget_dir(gadget).join("strings").join(lang.configfs_dir());
        match create_dir(&dir) {
            Ok(()) | Err(Error::Exist(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Write one gadget string.
    pub fn set_string(&self, gadget: &str, lang: LangId, slot: GadgetString, value: &str) -> Result<()> {
        self.ensure_lang(gadget, lang)?;
        let path = self.gadget_dir(gadget).join("strings").join(lang.configfs_dir()).join(slot.to_string());
        tracing::debug!("setting {} to {value:?}", path.display());
        fs::write(&path, value).map_err(Error::from)
    }

    /// Read one gadget string.
    pub fn get_string(&self, gadget: &str, lang: LangId, slot: GadgetString) -> Result<String> {
        let path = self.gadget_dir(gadget).join("strings").join(lang.configfs_dir()).join(slot.to_string());
        Ok(fs::read_to_string(&path).map(|s| s.trim_end_matches(['\n', '\0']).to_string()).unwrap_or_default())
    }

    /// Name of a configuration directory.
    pub fn config_dir_name(label: &str, id: u8) -> String {
        format!("{label}.{id}")
    }

    /// Create a configuration with its English description.
    pub fn create_config(&self, gadget: &str, label: &str, id: u8) -> Result<()> {
        let dir = self.gadget_dir(gadget).join("configs").join(Self::config_dir_name(label, id));
        tracing::debug!("creating config at {}", dir.display());
        create_dir(&dir)
            .map_err(|err| match err {
                Error::Exist(_) => Error::Exist(format!("config {id} already exists")),
                err => err,
            })?;

        let lang_dir = dir.join("strings").join(LangId::ENGLISH_US.configfs_dir());
        match fs::create_dir_all(&lang_dir) {
            Ok(()) => fs::write(lang_dir.join("configuration"), label).map_err(Error::from),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Remove a configuration, detaching its functions.
    pub fn remove_config(&self, gadget: &str, label: &str, id: u8) -> Result<()> {
        let dir = self.gadget_dir(gadget).join("configs").join(Self::config_dir_name(label, id));
        tracing::debug!("removing config at {}", dir.display());
        remove_config_dir(&dir)?;
        remove_dir_tolerant(&dir)
    }

    /// Create a function directory (`driver.instance`).
    pub fn create_function(&self, gadget: &str, driver: &str, instance: &str) -> Result<PathBuf> {
        let dir = self.gadget_dir(gadget).join("functions").join(format!("{driver}.{instance}"));
        tracing::debug!("creating function at {}", dir.display());
        create_dir(&dir).map_err(|err| match err {
            Error::Exist(_) => Error::Exist(format!("function {driver}.{instance} already exists")),
            err => err,
        })?;
        Ok(dir)
    }

    /// Remove a function directory, detaching it from all configurations.
    pub fn remove_function(&self, gadget: &str, driver: &str, instance: &str) -> Result<()> {
        let name = format!("{driver}.{instance}");
        for config in dir_entries(&self.gadget_dir(gadget).join("configs"))? {
            let link = config.path().join(&name);
            if link.symlink_metadata().map(|m| m.file_type().is_symlink()).unwrap_or(false) {
                tracing::debug!("detaching {}", link.display());
                fs::remove_file(&link)?;
            }
        }

        let dir = self.gadget_dir(gadget).join("functions").join(&name);
        tracing::debug!("removing function at {}", dir.display());
        fs::remove_dir(&dir).map_err(Error::from)
    }

    /// Read a textual attribute of a function directory.
    pub fn function_attr(&self, gadget: &str, function_dir: &str, attr: &str) -> Result<String> {
        let path = self.gadget_dir(gadget).join("functions").join(function_dir).join(attr);
        let data = fs::read_to_string(&path)?;
        Ok(data.trim().to_string())
    }

    /// Attach a function to a configuration by symlink.
    pub fn attach_function(&self, gadget: &str, config_dir: &str, function_dir: &str) -> Result<()> {
        let target = self.gadget_dir(gadget).join("functions").join(function_dir);
        let link = self.gadget_dir(gadget).join("configs").join(config_dir).join(function_dir);
        tracing::debug!("linking {} into {}", target.display(), link.display());
        match symlink(&target, &link) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Err(Error::Exist(format!("function {function_dir} is already attached")))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Bind the gadget to the named UDC.
    pub fn bind_udc(&self, gadget: &str, udc: &str) -> Result<()> {
        let path = self.gadget_dir(gadget).join("UDC");
        tracing::debug!("binding {} to {udc}", path.display());
        fs::write(&path, udc).map_err(Error::from)
    }

    /// Unbind the gadget from its UDC.
    pub fn unbind_udc(&self, gadget: &str) -> Result<()> {
        let path = self.gadget_dir(gadget).join("UDC");
        tracing::debug!("unbinding {}", path.display());
        match fs::write(&path, "\n") {
            Ok(()) => Ok(()),
            // Already unbound.
            Err(err) if err.raw_os_error() == Some(nix::errno::Errno::ENODEV as i32) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Remove a gadget recursively: configurations, functions and strings.
    pub fn remove_gadget(&self, gadget: &str) -> Result<()> {
        let dir = self.gadget_dir(gadget);
        tracing::debug!("removing gadget at {}", dir.display());

        let _ = fs::write(dir.join("UDC"), "\n");

        for config in dir_entries(&dir.join("configs"))? {
            if !config.path().is_dir() {
                continue;
            }
            remove_config_dir(&config.path())?;
            remove_dir_tolerant(&config.path())?;
        }

        for func in dir_entries(&dir.join("functions"))? {
            if func.path().is_dir() {
                fs::remove_dir(func.path())?;
            }
        }

        for lang in dir_entries(&dir.join("strings"))? {
            if lang.path().is_dir() {
                remove_dir_tolerant(&lang.path())?;
            }
        }

        for sub in ["configs", "functions", "strings"] {
            let _ = fs::remove_dir(dir.join(sub));
        }
        remove_dir_tolerant(&dir)?;

        tracing::debug!("removed gadget at {}", dir.display());
        Ok(())
    }
}

/// Remove the contents of a configuration directory.
fn remove_config_dir(dir: &Path) -> Result<()> {
    for entry in dir_entries(dir)? {
        if entry.path().symlink_metadata()?.file_type().is_symlink() {
            fs::remove_file(entry.path())?;
        }
    }

    for lang in dir_entries(&dir.join("strings"))? {
        if lang.path().is_dir() {
            remove_dir_tolerant(&lang.path())?;
        }
    }
    let _ = fs::remove_dir(dir.join("strings"));

    Ok(())
}

/// Remove a directory, recursing when it still holds plain files.
///
/// configfs drops a directory's attribute files by itself, ordinary
/// filesystems do not.
fn remove_dir_tolerant(dir: &Path) -> Result<()> {
    match fs::remove_dir(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.raw_os_error() == Some(nix::errno::Errno::ENOTEMPTY as i32) => {
            fs::remove_dir_all(dir).map_err(Error::from)
        }
        Err(err) => Err(err.into()),
    }
}

/// Directory entries, treating a missing directory as empty.
fn dir_entries(dir: &Path) -> Result<Vec<fs::DirEntry>> {
    match fs::read_dir(dir) {
        Ok(entries) => {
            let mut out = Vec::new();
            for entry in entries {
                out.push(entry?);
            }
            Ok(out)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}

fn create_dir(dir: &Path) -> Result<()> {
    match fs::create_dir(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            Err(Error::Exist(format!("{} already exists", dir.display())))
        }
        Err(err) => Err(err.into()),
    }
}

fn parse_hex(value: &str) -> Option<u16> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}
