//! Daemon core: the process-wide context and the operations behind the
//! remote interface.
//!
//! All state lives in one [`Daemon`] value: the configuration, the kernel
//! gadget store, the UDC snapshot, the function-type registry, the gadget
//! graph and the object map. The bus layer and the event pump share it
//! behind a single lock.

use nix::unistd::Pid;
use std::{
    collections::HashMap,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    sync::{Arc, Mutex},
};

use crate::{
    config::DaemonConfig,
    configfs::{GadgetAttr, GadgetFs, GadgetString},
    ffs::blocks::FfsEvent,
    lang::LangId,
    objects::{self, FunctionKind, Gadget, GadgetConfig, ObjectKind, ObjectMap},
    registry::{FunctionEnv, FunctionGroup, FunctionRegistry},
    udc::Udc,
    Error, Result,
};

/// Attribute value of the width the client sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrValue {
    /// 8-bit descriptor field value.
    U8(u8),
    /// 16-bit descriptor field value.
    U16(u16),
}

impl AttrValue {
    /// The value widened to 16 bit.
    pub fn widen(&self) -> u16 {
        match self {
            Self::U8(value) => u16::from(*value),
            Self::U16(value) => *value,
        }
    }
}

/// Controller snapshot entry with its enabled-gadget path.
#[derive(Debug)]
pub struct UdcEntry {
    /// The controller.
    pub udc: Udc,
    /// Object path of the gadget currently enabled on it.
    pub enabled_gadget: Option<String>,
}

/// Summary of a function used by the bus layer.
#[derive(Debug, Clone)]
pub struct FunctionSummary {
    /// Owning gadget.
    pub gadget: String,
    /// Function handle.
    pub id: u64,
    /// Registered type name.
    pub type_name: String,
    /// Instance name.
    pub instance: String,
    /// Function group.
    pub group: FunctionGroup,
    /// ep0 fd of a FunctionFS instance still owned by the daemon.
    pub ep0_fd: Option<RawFd>,
}

/// Result of creating a function.
#[derive(Debug)]
pub struct CreatedFunction {
    /// Exported object path.
    pub path: String,
    /// Function group.
    pub group: FunctionGroup,
    /// Function handle.
    pub id: u64,
    /// Owning gadget.
    pub gadget: String,
    /// ep0 fd to watch for a FunctionFS instance.
    pub ep0: Option<Arc<OwnedFd>>,
}

/// Children of a gadget, used to tear down its remote objects.
#[derive(Debug, Default)]
pub struct GadgetChildren {
    /// Function object paths with their groups.
    pub functions: Vec<(String, FunctionGroup)>,
    /// Configuration object paths.
    pub configs: Vec<String>,
    /// ep0 fds of FunctionFS instances still owned by the daemon.
    pub ffs_fds: Vec<RawFd>,
}

/// Daemon state shared between the bus layer and the event pump.
pub type SharedDaemon = Arc<Mutex<Daemon>>;

/// The daemon context.
#[derive(Debug)]
pub struct Daemon {
    config: DaemonConfig,
    gadget_fs: GadgetFs,
    registry: FunctionRegistry,
    udcs: Vec<UdcEntry>,
    gadgets: Vec<Gadget>,
    objects: ObjectMap,
}

impl Daemon {
    /// Creates the daemon context.
    pub fn new(config: DaemonConfig, gadget_fs: GadgetFs, registry: FunctionRegistry, udcs: Vec<Udc>) -> Self {
        let mut objects = ObjectMap::new();
        let udcs = udcs
            .into_iter()
            .map(|udc| {
                let name = udc.name().to_string_lossy().into_owned();
                if let Ok(path) = objects::udc_path(&name) {
                    objects.insert(path, ObjectKind::Udc(name));
                }
                UdcEntry { udc, enabled_gadget: None }
            })
            .collect();

        Self { config, gadget_fs, registry, udcs, gadgets: Vec::new(), objects }
    }

    /// The daemon configuration.
    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Environment for function types.
    fn env(&self) -> FunctionEnv {
        FunctionEnv {
            gadget_fs: self.gadget_fs.clone(),
            ffs_mount_root: self.config.ffs_mount_root.clone(),
        }
    }

    fn gadget(&self, name: &str) -> Result<&Gadget> {
        self.gadgets
            .iter()
            .find(|g| g.name == name)
            .ok_or_else(|| Error::NotFound(format!("gadget {name}")))
    }

    fn gadget_mut(&mut self, name: &str) -> Result<&mut Gadget> {
        self.gadgets
            .iter_mut()
            .find(|g| g.name == name)
            .ok_or_else(|| Error::NotFound(format!("gadget {name}")))
    }

    fn resolve(&self, path: &str) -> Result<&ObjectKind> {
        self.objects.get(path).ok_or_else(|| Error::NotFound(format!("object {path}")))
    }

    /// Create a gadget from the client-supplied attribute and string maps.
    ///
    /// An unknown attribute or string key is an immediate hard error and no
    /// kernel state is touched. Failures after kernel-side creation remove
    /// the kernel gadget again.
    pub fn create_gadget(
        &mut self, name: &str, attrs: &HashMap<String, AttrValue>, strings: &HashMap<String, String>,
    ) -> Result<String> {
        if name.is_empty() || objects::sanitize_path_part(name)? != name {
            return Err(Error::InvalidParam(format!("gadget name {name:?} is not a valid path token")));
        }

        let mut parsed_attrs = Vec::new();
        for (key, value) in attrs {
            let attr: GadgetAttr =
                key.parse().map_err(|_| Error::InvalidParam(format!("unknown attribute {key}")))?;
            parsed_attrs.push((attr, *value));
        }

        let mut parsed_strings = Vec::new();
        for (key, value) in strings {
            let slot: GadgetString =
                key.parse().map_err(|_| Error::InvalidParam(format!("unknown gadget string {key}")))?;
            parsed_strings.push((slot, value.clone()));
        }

        let path = objects::gadget_path(name)?;
        self.gadget_fs.create_gadget(name)?;

        if let Err(err) = self.apply_gadget_settings(name, &parsed_attrs, &parsed_strings) {
            let _ = self.gadget_fs.remove_gadget(name);
            return Err(err);
        }

        self.gadgets.push(Gadget::new(name));
        self.objects.insert(path.clone(), ObjectKind::Gadget(name.to_string()));
        tracing::info!("created gadget {name}");
        Ok(path)
    }

    fn apply_gadget_settings(
        &self, name: &str, attrs: &[(GadgetAttr, AttrValue)], strings: &[(GadgetString, String)],
    ) -> Result<()> {
        for (attr, value) in attrs {
            self.gadget_fs.set_attr(name, *attr, value.widen())?;
        }

        // The English (US) slot exists even without strings; this tells the
        // kernel driver which language the gadget provides.
        self.gadget_fs.ensure_lang(name, LangId::ENGLISH_US)?;
        if strings.is_empty() {
            for slot in GadgetString::ALL {
                self.gadget_fs.set_string(name, LangId::ENGLISH_US, slot, "")?;
            }
        } else {
            for (slot, value) in strings {
                self.gadget_fs.set_string(name, LangId::ENGLISH_US, *slot, value)?;
            }
        }

        Ok(())
    }

    /// Children of a gadget object, for remote-object teardown.
    pub fn gadget_children(&self, path: &str) -> Result<(String, GadgetChildren)> {
        let ObjectKind::Gadget(name) = self.resolve(path)? else {
            return Err(Error::NotFound(format!("gadget object {path}")));
        };
        let name = name.clone();
        let gadget = self.gadget(&name)?;

        let mut children = GadgetChildren::default();
        for func in &gadget.functions {
            children
                .functions
                .push((objects::function_path(&name, &func.type_name, &func.instance)?, func.group));
            if let FunctionKind::Ffs(ffs) = &func.kind {
                if let Some(ep0) = ffs.ep0() {
                    children.ffs_fds.push(ep0.as_raw_fd());
                }
            }
        }
        for config in &gadget.configs {
            children.configs.push(objects::config_path(&name, config.id)?);
        }

        Ok((name, children))
    }

    /// Remove a gadget and everything it owns, kernel side included.
    pub fn remove_gadget(&mut self, path: &str) -> Result<()> {
        let ObjectKind::Gadget(name) = self.resolve(path)? else {
            return Err(Error::NotFound(format!("gadget object {path}")));
        };
        let name = name.clone();

        // Instances must release their mounts before the kernel directories
        // can go away.
        let gadget = self.gadget_mut(&name)?;
        for func in &mut gadget.functions {
            if let FunctionKind::Ffs(ffs) = &mut func.kind {
                ffs.shutdown();
            }
        }

        self.gadget_fs.remove_gadget(&name)?;

        for entry in &mut self.udcs {
            if entry.enabled_gadget.as_deref() == Some(path) {
                entry.enabled_gadget = None;
            }
        }

        self.gadgets.retain(|g| g.name != name);
        self.objects.remove_subtree(path);
        tracing::info!("removed gadget {name}");
        Ok(())
    }

    /// Object path of a gadget by name.
    pub fn find_gadget(&self, name: &str) -> Result<String> {
        self.gadget(name)?;
        objects::gadget_path(name)
    }

    /// Create a function instance through its registered type.
    pub fn create_function(&mut self, gadget: &str, type_name: &str, instance: &str) -> Result<CreatedFunction> {
        if self
            .gadget(gadget)?
            .functions
            .iter()
            .any(|f| f.type_name == type_name && f.instance == instance)
        {
            return Err(Error::Exist(format!("function {type_name}.{instance} already exists")));
        }

        let ty = self
            .registry
            .lookup(type_name)
            .ok_or_else(|| Error::NotFound(format!("function type {type_name}")))?;

        let env = self.env();
        let function = ty.create_instance(&env, gadget, instance)?;

        let path = objects::function_path(gadget, type_name, instance)?;
        let created = CreatedFunction {
            path: path.clone(),
            group: function.group,
            id: function.id,
            gadget: gadget.to_string(),
            ep0: match &function.kind {
                FunctionKind::Ffs(ffs) => ffs.ep0().cloned(),
                FunctionKind::Kernel => None,
            },
        };

        self.objects.insert(path, ObjectKind::Function { gadget: gadget.to_string(), id: function.id });
        self.gadget_mut(gadget)?.functions.push(function);
        tracing::info!("created function {type_name}.{instance} in gadget {gadget}");
        Ok(created)
    }

    /// Summary of a function object.
    pub fn function_summary(&self, path: &str) -> Result<FunctionSummary> {
        let ObjectKind::Function { gadget, id } = self.resolve(path)? else {
            return Err(Error::NotFound(format!("function object {path}")));
        };
        let (gadget, id) = (gadget.clone(), *id);

        let func = self
            .gadget(&gadget)?
            .function(id)
            .ok_or_else(|| Error::NotFound(format!("function object {path}")))?;

        Ok(FunctionSummary {
            gadget,
            id,
            type_name: func.type_name.clone(),
            instance: func.instance.clone(),
            group: func.group,
            ep0_fd: match &func.kind {
                FunctionKind::Ffs(ffs) => ffs.ep0().map(|fd| fd.as_raw_fd()),
                FunctionKind::Kernel => None,
            },
        })
    }

    /// Remove a function instance.
    ///
    /// The caller must have deregistered the instance's ep0 fd from the
    /// event pump beforehand.
    pub fn remove_function(&mut self, path: &str) -> Result<()> {
        let summary = self.function_summary(path)?;
        let env = self.env();

        let gadget = self.gadget_mut(&summary.gadget)?;
        let pos = gadget
            .functions
            .iter()
            .position(|f| f.id == summary.id)
            .ok_or_else(|| Error::NotFound(format!("function object {path}")))?;
        let mut function = gadget.functions.remove(pos);

        let result = match self.registry.lookup(&summary.type_name) {
            Some(ty) => ty.remove_instance(&env, &summary.gadget, &mut function),
            // The type left the registry; fall back to plain kernel removal.
            None => {
                if let FunctionKind::Ffs(ffs) = &mut function.kind {
                    ffs.shutdown();
                }
                env.gadget_fs.remove_function(&summary.gadget, function.driver(), &function.instance)
            }
        };

        if let Err(err) = result {
            // Kernel-side removal failed; keep the entity so the client can
            // retry.
            self.gadget_mut(&summary.gadget)?.functions.insert(pos, function);
            return Err(err);
        }

        for config in &mut self.gadget_mut(&summary.gadget)?.configs {
            config.functions.retain(|fid| *fid != summary.id);
        }
        self.objects.remove(path);
        tracing::info!("removed function {}.{}", summary.type_name, summary.instance);
        Ok(())
    }

    /// Object path of a function by type and instance name.
    pub fn find_function(&self, gadget: &str, type_name: &str, instance: &str) -> Result<String> {
        let g = self.gadget(gadget)?;
        g.functions
            .iter()
            .find(|f| f.type_name == type_name && f.instance == instance)
            .ok_or_else(|| Error::NotFound(format!("function {type_name}.{instance}")))?;
        objects::function_path(gadget, type_name, instance)
    }

    /// Create a configuration within a gadget.
    pub fn create_config(&mut self, gadget: &str, id: u8, label: &str) -> Result<String> {
        if id == 0 {
            return Err(Error::InvalidParam("configuration id must be positive".into()));
        }
        if label.is_empty() {
            return Err(Error::InvalidParam("configuration label must not be empty".into()));
        }
        if self.gadget(gadget)?.config(id).is_some() {
            return Err(Error::Exist(format!("config {id} already exists")));
        }

        self.gadget_fs.create_config(gadget, label, id)?;

        let path = objects::config_path(gadget, id)?;
        self.objects.insert(path.clone(), ObjectKind::Config { gadget: gadget.to_string(), id });
        self.gadget_mut(gadget)?.configs.push(GadgetConfig {
            id,
            label: label.to_string(),
            functions: Vec::new(),
        });
        tracing::info!("created config {id} in gadget {gadget}");
        Ok(path)
    }

    /// Remove a configuration.
    pub fn remove_config(&mut self, path: &str) -> Result<()> {
        let ObjectKind::Config { gadget, id } = self.resolve(path)? else {
            return Err(Error::NotFound(format!("config object {path}")));
        };
        let (gadget, id) = (gadget.clone(), *id);

        let label = self
            .gadget(&gadget)?
            .config(id)
            .ok_or_else(|| Error::NotFound(format!("config object {path}")))?
            .label
            .clone();

        self.gadget_fs.remove_config(&gadget, &label, id)?;
        self.gadget_mut(&gadget)?.configs.retain(|c| c.id != id);
        self.objects.remove(path);
        tracing::info!("removed config {id} from gadget {gadget}");
        Ok(())
    }

    /// Object path of a configuration by id.
    pub fn find_config(&self, gadget: &str, id: u8) -> Result<String> {
        self.gadget(gadget)?
            .config(id)
            .ok_or_else(|| Error::NotFound(format!("config {id}")))?;
        objects::config_path(gadget, id)
    }

    /// Attach a function to a configuration of the same gadget.
    pub fn attach_function(&mut self, config_path: &str, function_path: &str) -> Result<()> {
        let ObjectKind::Config { gadget, id } = self.resolve(config_path)? else {
            return Err(Error::NotFound(format!("config object {config_path}")));
        };
        let (gadget, id) = (gadget.clone(), *id);

        let summary = self.function_summary(function_path)?;
        if summary.gadget != gadget {
            return Err(Error::InvalidParam("function belongs to another gadget".into()));
        }

        let g = self.gadget(&gadget)?;
        let label = g
            .config(id)
            .ok_or_else(|| Error::NotFound(format!("config object {config_path}")))?
            .label
            .clone();
        let function_dir = g
            .function(summary.id)
            .ok_or_else(|| Error::NotFound(format!("function object {function_path}")))?
            .configfs_name();

        self.gadget_fs.attach_function(&gadget, &GadgetFs::config_dir_name(&label, id), &function_dir)?;

        if let Some(config) = self.gadget_mut(&gadget)?.config_mut(id) {
            config.functions.push(summary.id);
        }
        tracing::info!("attached {function_dir} to config {id} of gadget {gadget}");
        Ok(())
    }

    /// Read a gadget descriptor attribute.
    pub fn get_attr(&self, gadget: &str, attr: GadgetAttr) -> Result<u16> {
        self.gadget(gadget)?;
        self.gadget_fs.get_attr(gadget, attr)
    }

    /// Write a gadget descriptor attribute.
    pub fn set_attr(&self, gadget: &str, attr: GadgetAttr, value: u16) -> Result<()> {
        self.gadget(gadget)?;
        self.gadget_fs.set_attr(gadget, attr, value)
    }

    /// Read an English gadget string.
    pub fn get_gadget_string(&self, gadget: &str, slot: GadgetString) -> Result<String> {
        self.gadget(gadget)?;
        self.gadget_fs.get_string(gadget, LangId::ENGLISH_US, slot)
    }

    /// Write an English gadget string.
    pub fn set_gadget_string(&self, gadget: &str, slot: GadgetString, value: &str) -> Result<()> {
        self.gadget(gadget)?;
        self.gadget_fs.set_string(gadget, LangId::ENGLISH_US, slot, value)
    }

    /// Serial port number of a serial-group function.
    pub fn function_port_num(&self, gadget: &str, id: u64) -> Result<u32> {
        let func = self
            .gadget(gadget)?
            .function(id)
            .ok_or_else(|| Error::NotFound(format!("function {id}")))?;
        let value = self.gadget_fs.function_attr(gadget, &func.configfs_name(), "port_num")?;
        value.parse().map_err(|_| Error::BadValue(format!("port_num value {value:?}")))
    }

    /// Names of registered function types.
    pub fn list_available_functions(&self) -> Vec<String> {
        self.registry.type_names().map(str::to_string).collect()
    }

    /// Unregister all function types at shutdown.
    pub fn unregister_types(&mut self) {
        self.registry.unregister_all();
    }

    /// UDC names with their object paths.
    pub fn udc_names(&self) -> Vec<(String, String)> {
        self.udcs
            .iter()
            .filter_map(|entry| {
                let name = entry.udc.name().to_string_lossy().into_owned();
                let path = objects::udc_path(&name).ok()?;
                Some((name, path))
            })
            .collect()
    }

    fn udc_entry_mut(&mut self, udc: &str) -> Result<&mut UdcEntry> {
        self.udcs
            .iter_mut()
            .find(|entry| entry.udc.name() == udc)
            .ok_or_else(|| Error::NotFound(format!("udc {udc}")))
    }

    /// Enable a gadget on the given UDC.
    pub fn enable_gadget(&mut self, udc: &str, gadget_path: &str) -> Result<bool> {
        let ObjectKind::Gadget(name) = self.resolve(gadget_path)? else {
            return Err(Error::NotFound(format!("gadget object {gadget_path}")));
        };
        let name = name.clone();
        self.gadget(&name)?;

        self.udc_entry_mut(udc)?;
        self.gadget_fs.bind_udc(&name, udc)?;

        let entry = self.udc_entry_mut(udc)?;
        entry.enabled_gadget = Some(gadget_path.to_string());
        tracing::info!("enabled gadget {name} on udc {udc}");
        Ok(true)
    }

    /// Disable the gadget currently enabled on the given UDC.
    pub fn disable_gadget(&mut self, udc: &str) -> Result<bool> {
        let entry = self.udc_entry_mut(udc)?;
        let Some(path) = entry.enabled_gadget.clone() else {
            return Err(Error::NotFound("No gadget enabled".into()));
        };

        let name = match self.objects.get(&path) {
            Some(ObjectKind::Gadget(name)) => Some(name.clone()),
            _ => None,
        };
        if let Some(name) = name {
            self.gadget_fs.unbind_udc(&name)?;
        }

        self.udc_entry_mut(udc)?.enabled_gadget = None;
        tracing::info!("disabled gadget on udc {udc}");
        Ok(true)
    }

    /// Object path of the gadget enabled on a UDC; empty when unbound.
    pub fn enabled_gadget(&self, udc: &str) -> String {
        self.udcs
            .iter()
            .find(|entry| entry.udc.name() == udc)
            .and_then(|entry| entry.enabled_gadget.clone())
            .unwrap_or_default()
    }

    /// Dispatch one ep0 event to a FunctionFS instance.
    ///
    /// Returns whether the event pump should keep polling the fd.
    pub fn handle_ep0_event(&mut self, gadget: &str, id: u64, event: FfsEvent) -> bool {
        let Ok(g) = self.gadget_mut(gadget) else { return false };
        let Some(func) = g.function_mut(id) else { return false };
        let FunctionKind::Ffs(ffs) = &mut func.kind else { return false };

        tracing::debug!("event {event} for function {}.{}", func.type_name, func.instance);
        match ffs.handle_event(event) {
            Ok(keep) => keep,
            Err(err) => {
                tracing::error!("error while processing ffs event: {err}");
                false
            }
        }
    }

    /// Note the exit of a handler child process.
    pub fn child_exited(&mut self, pid: Pid) {
        for gadget in &mut self.gadgets {
            for func in &mut gadget.functions {
                if let FunctionKind::Ffs(ffs) = &mut func.kind {
                    if ffs.child() == Some(pid) {
                        tracing::info!(
                            "ffs service of function {}.{} exited, pid {pid}",
                            func.type_name,
                            func.instance
                        );
                        ffs.child_exited();
                        return;
                    }
                }
            }
        }
    }
}
