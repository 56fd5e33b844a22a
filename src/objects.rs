//! Remote object model: object paths, entities and the path map.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{ffs::FfsFunction, registry::FunctionGroup, Error, Result};

/// Root of the exported object tree.
pub const OBJECT_ROOT: &str = "/org/usb/Gadget";

/// Makes a valid object path part from a string.
///
/// Object path parts may contain only `[A-Za-z0-9_]`; every other character
/// is replaced with `_`. `/` is reserved for path separation and rejected,
/// as is an empty input.
pub fn sanitize_path_part(value: &str) -> Result<String> {
    if value.is_empty() {
        return Err(Error::InvalidParam("empty object path part".into()));
    }

    let mut part = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '/' {
            return Err(Error::InvalidParam(format!("'/' not allowed in object path part {value:?}")));
        }
        part.push(if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' });
    }

    Ok(part)
}

/// Object path of a gadget.
pub fn gadget_path(gadget: &str) -> Result<String> {
    Ok(format!("{OBJECT_ROOT}/{}", sanitize_path_part(gadget)?))
}

/// Object path of a configuration.
pub fn config_path(gadget: &str, id: u8) -> Result<String> {
    Ok(format!("{}/Config/{id}", gadget_path(gadget)?))
}

/// Object path of a function.
pub fn function_path(gadget: &str, type_name: &str, instance: &str) -> Result<String> {
    Ok(format!(
        "{}/Function/{}/{}",
        gadget_path(gadget)?,
        sanitize_path_part(type_name)?,
        sanitize_path_part(instance)?
    ))
}

/// Object path of a USB device controller.
pub fn udc_path(udc: &str) -> Result<String> {
    Ok(format!("{OBJECT_ROOT}/UDC/{}", sanitize_path_part(udc)?))
}

/// What an exported object path refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectKind {
    /// A gadget, by name.
    Gadget(String),
    /// A configuration, by gadget name and id.
    Config {
        /// Owning gadget.
        gadget: String,
        /// Configuration id.
        id: u8,
    },
    /// A function, by gadget name and function handle.
    Function {
        /// Owning gadget.
        gadget: String,
        /// Function handle.
        id: u64,
    },
    /// A USB device controller, by kernel name.
    Udc(String),
}

/// Map from exported object path to the entity behind it.
#[derive(Debug, Default)]
pub struct ObjectMap {
    entries: HashMap<String, ObjectKind>,
}

impl ObjectMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object path.
    pub fn insert(&mut self, path: String, kind: ObjectKind) {
        self.entries.insert(path, kind);
    }

    /// Resolve an object path.
    pub fn get(&self, path: &str) -> Option<&ObjectKind> {
        self.entries.get(path)
    }

    /// Drop an object path.
    pub fn remove(&mut self, path: &str) -> Option<ObjectKind> {
        self.entries.remove(path)
    }

    /// Drop a path and everything below it.
    pub fn remove_subtree(&mut self, path: &str) {
        let prefix = format!("{path}/");
        self.entries.retain(|p, _| p != path && !p.starts_with(&prefix));
    }
}

static NEXT_FUNCTION_ID: AtomicU64 = AtomicU64::new(1);

/// Function implementation payload.
#[derive(Debug)]
pub enum FunctionKind {
    /// Backed by a kernel function driver.
    Kernel,
    /// Backed by a user-space FunctionFS service.
    Ffs(FfsFunction),
}

/// USB function instance owned by a gadget.
#[derive(Debug)]
pub struct Function {
    /// Daemon-unique handle.
    pub id: u64,
    /// Registered type name.
    pub type_name: String,
    /// Instance name, unique within `(gadget, type)`.
    pub instance: String,
    /// Group tag selecting the exported remote interfaces.
    pub group: FunctionGroup,
    /// Implementation payload.
    pub kind: FunctionKind,
}

impl Function {
    /// Creates a function entity with a fresh handle.
    pub fn new(type_name: impl Into<String>, instance: impl Into<String>, group: FunctionGroup, kind: FunctionKind) -> Self {
        Self {
            id: NEXT_FUNCTION_ID.fetch_add(1, Ordering::Relaxed),
            type_name: type_name.into(),
            instance: instance.into(),
            group,
            kind,
        }
    }

    /// Kernel function driver behind this instance.
    pub fn driver(&self) -> &str {
        match self.kind {
            FunctionKind::Kernel => &self.type_name,
            FunctionKind::Ffs(_) => "ffs",
        }
    }

    /// Name of this function's directory in configfs.
    pub fn configfs_name(&self) -> String {
        format!("{}.{}", self.driver(), self.instance)
    }
}

/// USB configuration owned by a gadget.
#[derive(Debug)]
pub struct GadgetConfig {
    /// Configuration id, unique within the gadget.
    pub id: u8,
    /// Textual label.
    pub label: String,
    /// Handles of attached functions.
    pub functions: Vec<u64>,
}

/// Top-level gadget entity.
#[derive(Debug)]
pub struct Gadget {
    /// Gadget name, unique per daemon.
    pub name: String,
    /// Owned functions.
    pub functions: Vec<Function>,
    /// Owned configurations.
    pub configs: Vec<GadgetConfig>,
}

impl Gadget {
    /// Creates an empty gadget entity.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), functions: Vec::new(), configs: Vec::new() }
    }

    /// Function by handle.
    pub fn function(&self, id: u64) -> Option<&Function> {
        self.functions.iter().find(|f| f.id == id)
    }

    /// Mutable function by handle.
    pub fn function_mut(&mut self, id: u64) -> Option<&mut Function> {
        self.functions.iter_mut().find(|f| f.id == id)
    }

    /// Configuration by id.
    pub fn config(&self, id: u8) -> Option<&GadgetConfig> {
        self.configs.iter().find(|c| c.id == id)
    }

    /// Mutable configuration by id.
    pub fn config_mut(&mut self, id: u8) -> Option<&mut GadgetConfig> {
        self.configs.iter_mut().find(|c| c.id == id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sanitize() {
        assert_eq!(sanitize_path_part("g1").unwrap(), "g1");
        assert_eq!(sanitize_path_part("my-service.conf").unwrap(), "my_service_conf");
        assert_eq!(sanitize_path_part("a b\tc").unwrap(), "a_b_c");
        assert!(sanitize_path_part("").is_err());
        assert!(sanitize_path_part("a/b").is_err());
    }

    #[test]
    fn sanitize_preserves_length_and_charset() {
        for input in ["plain", "white space", "Ünïcode", "dots.and-dashes", "_"] {
            let part = sanitize_path_part(input).unwrap();
            assert_eq!(part.chars().count(), input.chars().count());
            assert!(part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
        }
    }

    #[test]
    fn paths() {
        assert_eq!(gadget_path("g1").unwrap(), "/org/usb/Gadget/g1");
        assert_eq!(config_path("g1", 1).unwrap(), "/org/usb/Gadget/g1/Config/1");
        assert_eq!(
            function_path("g1", "ffs.echo", "inst 0").unwrap(),
            "/org/usb/Gadget/g1/Function/ffs_echo/inst_0"
        );
        assert_eq!(udc_path("dummy_udc.0").unwrap(), "/org/usb/Gadget/UDC/dummy_udc_0");
    }

    #[test]
    fn subtree_removal() {
        let mut map = ObjectMap::new();
        map.insert("/org/usb/Gadget/g1".into(), ObjectKind::Gadget("g1".into()));
        map.insert("/org/usb/Gadget/g1/Config/1".into(), ObjectKind::Config { gadget: "g1".into(), id: 1 });
        map.insert("/org/usb/Gadget/g10".into(), ObjectKind::Gadget("g10".into()));

        map.remove_subtree("/org/usb/Gadget/g1");
        assert!(map.get("/org/usb/Gadget/g1").is_none());
        assert!(map.get("/org/usb/Gadget/g1/Config/1").is_none());
        assert!(map.get("/org/usb/Gadget/g10").is_some());
    }
}
