//! System bus surface of the daemon.
//!
//! Thin interface structs per capability, delegating every operation to the
//! [`core`](crate::core) context. Objects appear and disappear on the bus as
//! the entities behind them are created and removed.

use std::{collections::HashMap, sync::Arc};
use zbus::{
    fdo, interface,
    zvariant::{OwnedObjectPath, OwnedValue, Value},
    Connection, ObjectServer,
};

use crate::{
    configfs::{GadgetAttr, GadgetString},
    core::{AttrValue, SharedDaemon},
    objects,
    pump::EventPump,
    registry::FunctionGroup,
    Error, Result,
};

/// Well-known bus name of the daemon.
pub const BUS_NAME: &str = "org.usb.gadgetd";

/// Shared handles the interface structs close over.
#[derive(Clone)]
pub struct Ctx {
    /// Daemon state.
    pub daemon: SharedDaemon,
    /// ep0 event reactor.
    pub pump: Arc<EventPump>,
}

fn to_fdo(err: impl std::fmt::Display) -> fdo::Error {
    fdo::Error::Failed(err.to_string())
}

fn object_path(path: &str) -> fdo::Result<OwnedObjectPath> {
    OwnedObjectPath::try_from(path.to_string()).map_err(to_fdo)
}

fn attr_value(value: &OwnedValue) -> fdo::Result<AttrValue> {
    match &**value {
        Value::U16(value) => Ok(AttrValue::U16(*value)),
        Value::U8(value) => Ok(AttrValue::U8(*value)),
        _ => Err(to_fdo(Error::InvalidParam("bad type of attribute value".into()))),
    }
}

/// Gadget life cycle at the object root.
pub struct GadgetManager {
    ctx: Ctx,
}

impl GadgetManager {
    /// Creates the manager interface.
    pub fn new(ctx: Ctx) -> Self {
        Self { ctx }
    }
}

#[interface(name = "org.usb.device.GadgetManager")]
impl GadgetManager {
    /// Create a gadget from descriptor values and strings.
    async fn create_gadget(
        &self, #[zbus(object_server)] server: &ObjectServer, name: String,
        descriptors: HashMap<String, OwnedValue>, strings: HashMap<String, String>,
    ) -> fdo::Result<OwnedObjectPath> {
        let mut attrs = HashMap::new();
        for (key, value) in &descriptors {
            attrs.insert(key.clone(), attr_value(value)?);
        }

        let path = {
            let mut daemon = self.ctx.daemon.lock().unwrap();
            daemon.create_gadget(&name, &attrs, &strings)?
        };

        export_gadget(server, &self.ctx, &name, &path).await?;
        object_path(&path)
    }

    /// Remove a gadget and all its children.
    async fn remove_gadget(
        &self, #[zbus(object_server)] server: &ObjectServer, gadget_path: OwnedObjectPath,
    ) -> fdo::Result<()> {
        let path = gadget_path.as_str();
        let (_name, children) = self.ctx.daemon.lock().unwrap().gadget_children(path)?;

        // Watches go first so no event fires while the kernel state is torn
        // down and the fds are closed.
        for fd in &children.ffs_fds {
            self.ctx.pump.deregister(*fd);
        }

        self.ctx.daemon.lock().unwrap().remove_gadget(path)?;

        for (function_path, group) in &children.functions {
            unexport_function(server, function_path, *group).await;
        }
        for config_path in &children.configs {
            let _ = server.remove::<ConfigObject, _>(config_path.as_str()).await;
        }
        unexport_gadget(server, path).await;
        Ok(())
    }

    /// Object path of a gadget by name.
    async fn find_gadget_by_name(&self, name: String) -> fdo::Result<OwnedObjectPath> {
        let path = self.ctx.daemon.lock().unwrap().find_gadget(&name)?;
        object_path(&path)
    }

    /// Names of the function types that can be instantiated.
    async fn list_available_functions(&self) -> fdo::Result<Vec<String>> {
        Ok(self.ctx.daemon.lock().unwrap().list_available_functions())
    }
}

/// Device descriptor fields of a gadget.
pub struct GadgetDescriptors {
    ctx: Ctx,
    gadget: String,
}

impl GadgetDescriptors {
    fn get(&self, attr: GadgetAttr) -> fdo::Result<u16> {
        Ok(self.ctx.daemon.lock().unwrap().get_attr(&self.gadget, attr)?)
    }

    fn set(&self, attr: GadgetAttr, value: u16) -> fdo::Result<()> {
        Ok(self.ctx.daemon.lock().unwrap().set_attr(&self.gadget, attr, value)?)
    }
}

#[interface(name = "org.usb.device.Gadget.Descriptors")]
impl GadgetDescriptors {
    /// USB specification version in BCD.
    #[zbus(property, name = "bcdUSB")]
    fn bcd_usb(&self) -> fdo::Result<u16> {
        self.get(GadgetAttr::BcdUsb)
    }

    #[zbus(property, name = "bcdUSB")]
    fn set_bcd_usb(&mut self, value: u16) -> fdo::Result<()> {
        self.set(GadgetAttr::BcdUsb, value)
    }

    /// Device class code.
    #[zbus(property, name = "bDeviceClass")]
    fn b_device_class(&self) -> fdo::Result<u8> {
        Ok(self.get(GadgetAttr::DeviceClass)? as u8)
    }

    #[zbus(property, name = "bDeviceClass")]
    fn set_b_device_class(&mut self, value: u8) -> fdo::Result<()> {
        self.set(GadgetAttr::DeviceClass, u16::from(value))
    }

    /// Device subclass code.
    #[zbus(property, name = "bDeviceSubClass")]
    fn b_device_sub_class(&self) -> fdo::Result<u8> {
        Ok(self.get(GadgetAttr::DeviceSubClass)? as u8)
    }

    #[zbus(property, name = "bDeviceSubClass")]
    fn set_b_device_sub_class(&mut self, value: u8) -> fdo::Result<()> {
        self.set(GadgetAttr::DeviceSubClass, u16::from(value))
    }

    /// Device protocol code.
    #[zbus(property, name = "bDeviceProtocol")]
    fn b_device_protocol(&self) -> fdo::Result<u8> {
        Ok(self.get(GadgetAttr::DeviceProtocol)? as u8)
    }

    #[zbus(property, name = "bDeviceProtocol")]
    fn set_b_device_protocol(&mut self, value: u8) -> fdo::Result<()> {
        self.set(GadgetAttr::DeviceProtocol, u16::from(value))
    }

    /// Maximum endpoint 0 packet size.
    #[zbus(property, name = "bMaxPacketSize0")]
    fn b_max_packet_size0(&self) -> fdo::Result<u8> {
        Ok(self.get(GadgetAttr::MaxPacketSize0)? as u8)
    }

    #[zbus(property, name = "bMaxPacketSize0")]
    fn set_b_max_packet_size0(&mut self, value: u8) -> fdo::Result<()> {
        self.set(GadgetAttr::MaxPacketSize0, u16::from(value))
    }

    /// Vendor id.
    #[zbus(property, name = "idVendor")]
    fn id_vendor(&self) -> fdo::Result<u16> {
        self.get(GadgetAttr::IdVendor)
    }

    #[zbus(property, name = "idVendor")]
    fn set_id_vendor(&mut self, value: u16) -> fdo::Result<()> {
        self.set(GadgetAttr::IdVendor, value)
    }

    /// Product id.
    #[zbus(property, name = "idProduct")]
    fn id_product(&self) -> fdo::Result<u16> {
        self.get(GadgetAttr::IdProduct)
    }

    #[zbus(property, name = "idProduct")]
    fn set_id_product(&mut self, value: u16) -> fdo::Result<()> {
        self.set(GadgetAttr::IdProduct, value)
    }

    /// Device release number in BCD.
    #[zbus(property, name = "bcdDevice")]
    fn bcd_device(&self) -> fdo::Result<u16> {
        self.get(GadgetAttr::BcdDevice)
    }

    #[zbus(property, name = "bcdDevice")]
    fn set_bcd_device(&mut self, value: u16) -> fdo::Result<()> {
        self.set(GadgetAttr::BcdDevice, value)
    }
}

/// English string table of a gadget.
pub struct GadgetStrings {
    ctx: Ctx,
    gadget: String,
}

impl GadgetStrings {
    fn get(&self, slot: GadgetString) -> fdo::Result<String> {
        Ok(self.ctx.daemon.lock().unwrap().get_gadget_string(&self.gadget, slot)?)
    }

    fn set(&self, slot: GadgetString, value: &str) -> fdo::Result<()> {
        Ok(self.ctx.daemon.lock().unwrap().set_gadget_string(&self.gadget, slot, value)?)
    }
}

#[interface(name = "org.usb.device.Gadget.Strings")]
impl GadgetStrings {
    /// Manufacturer name.
    #[zbus(property, name = "manufacturer")]
    fn manufacturer(&self) -> fdo::Result<String> {
        self.get(GadgetString::Manufacturer)
    }

    #[zbus(property, name = "manufacturer")]
    fn set_manufacturer(&mut self, value: String) -> fdo::Result<()> {
        self.set(GadgetString::Manufacturer, &value)
    }

    /// Product name.
    #[zbus(property, name = "product")]
    fn product(&self) -> fdo::Result<String> {
        self.get(GadgetString::Product)
    }

    #[zbus(property, name = "product")]
    fn set_product(&mut self, value: String) -> fdo::Result<()> {
        self.set(GadgetString::Product, &value)
    }

    /// Serial number.
    #[zbus(property, name = "serialnumber")]
    fn serialnumber(&self) -> fdo::Result<String> {
        self.get(GadgetString::SerialNumber)
    }

    #[zbus(property, name = "serialnumber")]
    fn set_serialnumber(&mut self, value: String) -> fdo::Result<()> {
        self.set(GadgetString::SerialNumber, &value)
    }
}

/// Function life cycle within a gadget.
pub struct FunctionManager {
    ctx: Ctx,
    gadget: String,
}

#[interface(name = "org.usb.device.Gadget.FunctionManager")]
impl FunctionManager {
    /// Create a function instance of a registered type.
    async fn create_function(
        &self, #[zbus(object_server)] server: &ObjectServer, instance: String, function_type: String,
    ) -> fdo::Result<OwnedObjectPath> {
        let created = {
            let mut daemon = self.ctx.daemon.lock().unwrap();
            daemon.create_function(&self.gadget, &function_type, &instance)?
        };

        if let Some(ep0) = created.ep0.clone() {
            self.ctx.pump.register(self.ctx.daemon.clone(), created.gadget.clone(), created.id, ep0);
        }

        let function = FunctionObject {
            type_name: function_type.clone(),
            instance: instance.clone(),
            group: created.group,
        };
        server.at(created.path.as_str(), function).await.map_err(to_fdo)?;
        if created.group == FunctionGroup::Serial {
            let serial = SerialFunction { ctx: self.ctx.clone(), gadget: created.gadget.clone(), id: created.id };
            server.at(created.path.as_str(), serial).await.map_err(to_fdo)?;
        }

        object_path(&created.path)
    }

    /// Remove a function instance.
    async fn remove_function(
        &self, #[zbus(object_server)] server: &ObjectServer, function_path: OwnedObjectPath,
    ) -> fdo::Result<()> {
        let path = function_path.as_str();
        let summary = self.ctx.daemon.lock().unwrap().function_summary(path)?;

        if let Some(fd) = summary.ep0_fd {
            self.ctx.pump.deregister(fd);
        }

        self.ctx.daemon.lock().unwrap().remove_function(path)?;
        unexport_function(server, path, summary.group).await;
        Ok(())
    }

    /// Object path of a function by type and instance name.
    async fn find_function_by_name(&self, function_type: String, instance: String) -> fdo::Result<OwnedObjectPath> {
        let path = self.ctx.daemon.lock().unwrap().find_function(&self.gadget, &function_type, &instance)?;
        object_path(&path)
    }
}

/// Configuration life cycle within a gadget.
pub struct ConfigManager {
    ctx: Ctx,
    gadget: String,
}

#[interface(name = "org.usb.device.Gadget.ConfigManager")]
impl ConfigManager {
    /// Create a configuration.
    async fn create_config(
        &self, #[zbus(object_server)] server: &ObjectServer, id: u8, label: String,
    ) -> fdo::Result<OwnedObjectPath> {
        let path = {
            let mut daemon = self.ctx.daemon.lock().unwrap();
            daemon.create_config(&self.gadget, id, &label)?
        };

        let config = ConfigObject { ctx: self.ctx.clone(), gadget: self.gadget.clone(), id, label };
        server.at(path.as_str(), config).await.map_err(to_fdo)?;
        object_path(&path)
    }

    /// Remove a configuration.
    async fn remove_config(
        &self, #[zbus(object_server)] server: &ObjectServer, config_path: OwnedObjectPath,
    ) -> fdo::Result<()> {
        self.ctx.daemon.lock().unwrap().remove_config(config_path.as_str())?;
        let _ = server.remove::<ConfigObject, _>(config_path.as_str()).await;
        Ok(())
    }

    /// Object path of a configuration by id.
    async fn find_config_by_id(&self, id: u8) -> fdo::Result<OwnedObjectPath> {
        let path = self.ctx.daemon.lock().unwrap().find_config(&self.gadget, id)?;
        object_path(&path)
    }
}

/// One USB configuration.
pub struct ConfigObject {
    ctx: Ctx,
    gadget: String,
    id: u8,
    label: String,
}

#[interface(name = "org.usb.device.GadgetConfig")]
impl ConfigObject {
    /// Attach a function of the same gadget to this configuration.
    async fn attach_function(&self, function_path: OwnedObjectPath) -> fdo::Result<()> {
        let config_path = objects::config_path(&self.gadget, self.id).map_err(to_fdo)?;
        Ok(self.ctx.daemon.lock().unwrap().attach_function(&config_path, function_path.as_str())?)
    }

    /// Configuration id.
    #[zbus(property)]
    fn id(&self) -> u8 {
        self.id
    }

    /// Configuration label.
    #[zbus(property)]
    fn label(&self) -> String {
        self.label.clone()
    }
}

/// One USB function.
pub struct FunctionObject {
    type_name: String,
    instance: String,
    group: FunctionGroup,
}

#[interface(name = "org.usb.device.Function")]
impl FunctionObject {
    /// Registered type name.
    #[zbus(property, name = "type")]
    fn type_name(&self) -> String {
        self.type_name.clone()
    }

    /// Instance name.
    #[zbus(property)]
    fn instance(&self) -> String {
        self.instance.clone()
    }

    /// Function group.
    #[zbus(property)]
    fn group(&self) -> String {
        self.group.to_string()
    }
}

/// Serial-port surface of serial-group functions.
pub struct SerialFunction {
    ctx: Ctx,
    gadget: String,
    id: u64,
}

#[interface(name = "org.usb.device.SerialFunction")]
impl SerialFunction {
    /// Number of the TTY port allocated by the kernel.
    #[zbus(property, name = "port_num")]
    fn port_num(&self) -> fdo::Result<u32> {
        Ok(self.ctx.daemon.lock().unwrap().function_port_num(&self.gadget, self.id)?)
    }
}

/// One USB device controller.
pub struct UdcObject {
    ctx: Ctx,
    name: String,
}

#[interface(name = "org.usb.device.UDC")]
impl UdcObject {
    /// Enable a gadget on this controller.
    async fn enable_gadget(&self, gadget_path: OwnedObjectPath) -> fdo::Result<bool> {
        Ok(self.ctx.daemon.lock().unwrap().enable_gadget(&self.name, gadget_path.as_str())?)
    }

    /// Disable the currently enabled gadget.
    async fn disable_gadget(&self) -> fdo::Result<bool> {
        Ok(self.ctx.daemon.lock().unwrap().disable_gadget(&self.name)?)
    }

    /// Kernel name of the controller.
    #[zbus(property, name = "name")]
    fn name(&self) -> String {
        self.name.clone()
    }

    /// Object path of the enabled gadget; empty when unbound.
    #[zbus(property, name = "enabled-gadget")]
    fn enabled_gadget(&self) -> String {
        self.ctx.daemon.lock().unwrap().enabled_gadget(&self.name)
    }
}

/// Export the per-gadget interfaces at the gadget's path.
async fn export_gadget(server: &ObjectServer, ctx: &Ctx, gadget: &str, path: &str) -> fdo::Result<()> {
    let descriptors = GadgetDescriptors { ctx: ctx.clone(), gadget: gadget.to_string() };
    server.at(path, descriptors).await.map_err(to_fdo)?;
    let strings = GadgetStrings { ctx: ctx.clone(), gadget: gadget.to_string() };
    server.at(path, strings).await.map_err(to_fdo)?;
    let functions = FunctionManager { ctx: ctx.clone(), gadget: gadget.to_string() };
    server.at(path, functions).await.map_err(to_fdo)?;
    let configs = ConfigManager { ctx: ctx.clone(), gadget: gadget.to_string() };
    server.at(path, configs).await.map_err(to_fdo)?;
    Ok(())
}

/// Drop the per-gadget interfaces.
async fn unexport_gadget(server: &ObjectServer, path: &str) {
    let _ = server.remove::<GadgetDescriptors, _>(path).await;
    let _ = server.remove::<GadgetStrings, _>(path).await;
    let _ = server.remove::<FunctionManager, _>(path).await;
    let _ = server.remove::<ConfigManager, _>(path).await;
}

/// Drop the interfaces of a function object.
async fn unexport_function(server: &ObjectServer, path: &str, group: FunctionGroup) {
    let _ = server.remove::<FunctionObject, _>(path).await;
    if group == FunctionGroup::Serial {
        let _ = server.remove::<SerialFunction, _>(path).await;
    }
}

/// Connect to the system bus, claim the daemon's name and export the object
/// tree.
pub async fn serve(ctx: Ctx) -> Result<Connection> {
    let connection = zbus::connection::Builder::system()
        .map_err(zbus_err)?
        .name(BUS_NAME)
        .map_err(zbus_err)?
        .serve_at(objects::OBJECT_ROOT, GadgetManager::new(ctx.clone()))
        .map_err(zbus_err)?
        .build()
        .await
        .map_err(zbus_err)?;

    tracing::info!("acquired bus name {BUS_NAME}");

    export_udcs(&connection, &ctx).await?;
    Ok(connection)
}

/// Export one UDC object per discovered controller.
pub async fn export_udcs(connection: &Connection, ctx: &Ctx) -> Result<()> {
    let udcs = ctx.daemon.lock().unwrap().udc_names();
    for (name, path) in udcs {
        let udc = UdcObject { ctx: ctx.clone(), name };
        connection.object_server().at(path.as_str(), udc).await.map_err(zbus_err)?;
    }
    Ok(())
}

fn zbus_err(err: zbus::Error) -> Error {
    Error::Other(err.to_string())
}
