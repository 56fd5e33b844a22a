//! Kernel USB function discovery.
//!
//! At startup the daemon probes two sources for available kernel functions:
//! `usbfunc:` module aliases of the running kernel and, if present, the
//! `func_list` published by the gadget subsystem in sysfs. Each recognized
//! name becomes a registered [`KernelFunctionType`].

use std::{
    ffi::CStr,
    fs::File,
    io::{BufRead, BufReader, Error as IoError, ErrorKind},
    path::Path,
    sync::Arc,
};

use crate::{
    objects::{Function, FunctionKind},
    registry::{FunctionEnv, FunctionGroup, FunctionRegistry, FunctionType},
    Error, Result,
};

/// Kernel functions the daemon knows how to instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum KernelFunction {
    /// Generic serial.
    Gser,
    /// CDC ACM serial.
    Acm,
    /// OBEX serial.
    Obex,
    /// CDC subset network.
    Geth,
    /// CDC ECM network.
    Ecm,
    /// CDC NCM network.
    Ncm,
    /// CDC EEM network.
    Eem,
    /// RNDIS network.
    Rndis,
    /// Phonet.
    Phonet,
    /// FunctionFS.
    Ffs,
}

impl KernelFunction {
    /// Function group of instances of this kernel function.
    pub fn group(&self) -> FunctionGroup {
        match self {
            Self::Gser | Self::Acm | Self::Obex => FunctionGroup::Serial,
            Self::Geth | Self::Ecm | Self::Ncm | Self::Eem | Self::Rndis => FunctionGroup::Net,
            Self::Phonet => FunctionGroup::Phonet,
            Self::Ffs => FunctionGroup::Ffs,
        }
    }
}

/// Function type backed by a kernel function driver.
#[derive(Debug)]
pub struct KernelFunctionType {
    func: KernelFunction,
    name: String,
}

impl KernelFunctionType {
    /// Creates the type for a kernel function.
    pub fn new(func: KernelFunction) -> Self {
        Self { name: func.to_string(), func }
    }
}

impl FunctionType for KernelFunctionType {
    fn name(&self) -> &str {
        &self.name
    }

    fn group(&self) -> FunctionGroup {
        self.func.group()
    }

    fn create_instance(&self, env: &FunctionEnv, gadget: &str, instance: &str) -> Result<Function> {
        env.gadget_fs.create_function(gadget, &self.name, instance)?;
        Ok(Function::new(self.name.clone(), instance, self.group(), FunctionKind::Kernel))
    }

    fn remove_instance(&self, env: &FunctionEnv, gadget: &str, function: &mut Function) -> Result<()> {
        env.gadget_fs.remove_function(gadget, function.driver(), &function.instance)
    }
}

/// Release string of the running kernel.
fn kernel_release() -> Result<String> {
    let mut uts = libc::utsname {
        sysname: [0; 65],
        nodename: [0; 65],
        release: [0; 65],
        version: [0; 65],
        machine: [0; 65],
        domainname: [0; 65],
    };

    if unsafe { libc::uname(&mut uts) } == -1 {
        return Err(IoError::last_os_error().into());
    }

    let release = unsafe { CStr::from_ptr(uts.release.as_ptr() as *const _) }
        .to_str()
        .map_err(|_| Error::BadValue("invalid kernel release string".into()))?;

    Ok(release.to_string())
}

/// Append `usbfunc:` names from a modules.alias file.
///
/// Unrelated alias lines are tolerated by skipping to end of line after the
/// keyword; a line that does not start with the keyword fails the scan.
fn scan_modules_alias(path: &Path, names: &mut Vec<String>) -> Result<()> {
    let file = File::open(path).map_err(|err| match err.kind() {
        ErrorKind::NotFound => Error::FileOpenFailed(format!("{}: {err}", path.display())),
        _ => err.into(),
    })?;

    for line in BufReader::new(file).lines() {
        let line = line.map_err(Error::from)?;
        let line = line.trim_start();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("alias") => (),
            _ => return Err(Error::BadValue(format!("{}: malformed alias line", path.display()))),
        }

        let Some(alias) = fields.next() else {
            return Err(Error::BadValue(format!("{}: malformed alias line", path.display())));
        };

        if let Some(name) = alias.strip_prefix("usbfunc:") {
            if !name.is_empty() && !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }

    Ok(())
}

/// Append whitespace-separated names from the gadget subsystem's function
/// list in sysfs.
fn scan_func_list(path: &Path, names: &mut Vec<String>) -> Result<()> {
    let data = std::fs::read_to_string(path).map_err(|err| match err.kind() {
        ErrorKind::NotFound => Error::FileOpenFailed(format!("{}: {err}", path.display())),
        _ => err.into(),
    })?;

    for name in data.split_whitespace() {
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }

    Ok(())
}

/// The union of kernel function names discovered from module aliases and
/// sysfs, without duplicates. A missing source is logged and skipped.
pub fn list_kernel_functions() -> Result<Vec<String>> {
    let release = kernel_release()?;
    let alias_path = format!("/lib/modules/{release}/modules.alias");

    let mut names = Vec::new();
    match scan_modules_alias(Path::new(&alias_path), &mut names) {
        Ok(()) => (),
        Err(Error::FileOpenFailed(_)) => tracing::info!("modules.alias file not found"),
        Err(err) => return Err(err),
    }

    match scan_func_list(Path::new("/sys/class/usb_gadget/func_list"), &mut names) {
        Ok(()) => (),
        Err(Error::FileOpenFailed(_)) => tracing::info!("func_list file not found"),
        Err(err) => return Err(err),
    }

    names.sort();
    names.dedup();
    Ok(names)
}

/// Register a kernel function type for every discovered name.
///
/// Names without a kernel function table entry cannot be instantiated and
/// are skipped; this is not an error.
pub fn register_kernel_functions(registry: &mut FunctionRegistry) -> Result<()> {
    for name in list_kernel_functions()? {
        let Ok(func) = name.parse::<KernelFunction>() else {
            tracing::info!("unsupported kernel function {name} found, skipping");
            continue;
        };

        registry.register(Arc::new(KernelFunctionType::new(func)))?;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn groups() {
        assert_eq!(KernelFunction::Acm.group(), FunctionGroup::Serial);
        assert_eq!(KernelFunction::Rndis.group(), FunctionGroup::Net);
        assert_eq!(KernelFunction::Phonet.group(), FunctionGroup::Phonet);
        assert_eq!(KernelFunction::Ffs.group(), FunctionGroup::Ffs);
    }

    #[test]
    fn alias_scan() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "# comment line\n\
             alias usbfunc:acm usb_f_acm\n\
             alias pci:v00008086d* snd_hda_intel\n\
             alias usbfunc:ecm usb_f_ecm\n\
             alias usbfunc:acm usb_f_acm\n"
        )
        .unwrap();

        let mut names = Vec::new();
        scan_modules_alias(file.path(), &mut names).unwrap();
        assert_eq!(names, ["acm", "ecm"]);
    }

    #[test]
    fn alias_scan_rejects_malformed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not_an_alias usbfunc:acm usb_f_acm\n").unwrap();

        let mut names = Vec::new();
        assert!(matches!(scan_modules_alias(file.path(), &mut names), Err(Error::BadValue(_))));
    }

    #[test]
    fn alias_scan_missing_file() {
        let mut names = Vec::new();
        let err = scan_modules_alias(Path::new("/nonexistent/modules.alias"), &mut names).unwrap_err();
        assert!(matches!(err, Error::FileOpenFailed(_)));
    }

    #[test]
    fn func_list_scan() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "acm ncm\nffs\n").unwrap();

        let mut names = vec!["acm".to_string()];
        scan_func_list(file.path(), &mut names).unwrap();
        assert_eq!(names, ["acm", "ncm", "ffs"]);
    }

    #[test]
    fn kernel_release_is_readable() {
        assert!(!kernel_release().unwrap().is_empty());
    }
}
