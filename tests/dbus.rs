//! Wire-level checks of the exported object tree.
//!
//! Serves the interfaces over a peer-to-peer connection pair and reads
//! properties back through `org.freedesktop.DBus.Properties`, so the names
//! clients see on the bus are asserted literally.

use std::{
    collections::HashMap,
    fs,
    sync::{Arc, Mutex},
};
use zbus::zvariant::{OwnedObjectPath, OwnedValue, Value};

use gadgetd::{
    config::DaemonConfig,
    configfs::GadgetFs,
    core::Daemon,
    dbus::{self, Ctx, GadgetManager},
    objects,
    probe::{KernelFunction, KernelFunctionType},
    pump::EventPump,
    registry::FunctionRegistry,
    udc,
};

const PROPERTIES: &str = "org.freedesktop.DBus.Properties";

fn ctx(tmp: &tempfile::TempDir) -> Ctx {
    fs::create_dir(tmp.path().join("usb_gadget")).unwrap();
    fs::create_dir_all(tmp.path().join("class/udc/dummy_udc.0")).unwrap();

    let gadget_fs = GadgetFs::new(tmp.path()).unwrap();
    let mut registry = FunctionRegistry::new();
    registry.register(Arc::new(KernelFunctionType::new(KernelFunction::Acm))).unwrap();
    let udcs = udc::udcs(&tmp.path().join("class")).unwrap();

    let daemon = Arc::new(Mutex::new(Daemon::new(DaemonConfig::default(), gadget_fs, registry, udcs)));
    Ctx { daemon, pump: Arc::new(EventPump::new()) }
}

async fn connections(ctx: &Ctx) -> (zbus::Connection, zbus::Connection) {
    let guid = zbus::Guid::generate();
    let (server_stream, client_stream) = tokio::net::UnixStream::pair().unwrap();

    let server = zbus::connection::Builder::unix_stream(server_stream)
        .server(guid)
        .unwrap()
        .p2p()
        .serve_at(objects::OBJECT_ROOT, GadgetManager::new(ctx.clone()))
        .unwrap()
        .build();
    let client = zbus::connection::Builder::unix_stream(client_stream).p2p().build();

    let (server, client) = tokio::join!(server, client);
    (server.unwrap(), client.unwrap())
}

async fn get_property(
    client: &zbus::Connection, path: &str, interface: &str, property: &str,
) -> zbus::Result<OwnedValue> {
    let reply = client
        .call_method(None::<&str>, path, Some(PROPERTIES), "Get", &(interface, property))
        .await?;
    let body = reply.body();
    Ok(body.deserialize()?)
}

#[tokio::test]
async fn property_wire_names() {
    let tmp = tempfile::tempdir().unwrap();
    let ctx = ctx(&tmp);

    let (server, client) = connections(&ctx).await;
    dbus::export_udcs(&server, &ctx).await.unwrap();

    let udc_path = "/org/usb/Gadget/UDC/dummy_udc_0";
    let udc_iface = "org.usb.device.UDC";

    let name = get_property(&client, udc_path, udc_iface, "name").await.unwrap();
    assert!(matches!(&*name, Value::Str(s) if s.as_str() == "dummy_udc.0"));

    let enabled = get_property(&client, udc_path, udc_iface, "enabled-gadget").await.unwrap();
    assert!(matches!(&*enabled, Value::Str(s) if s.as_str().is_empty()));

    // The lowercase names are the wire contract; no renamed duplicates.
    assert!(get_property(&client, udc_path, udc_iface, "Name").await.is_err());
    assert!(get_property(&client, udc_path, udc_iface, "EnabledGadget").await.is_err());

    // Serial functions publish their port number as `port_num`.
    let reply = client
        .call_method(
            None::<&str>,
            objects::OBJECT_ROOT,
            Some("org.usb.device.GadgetManager"),
            "CreateGadget",
            &("g1", HashMap::<String, Value>::new(), HashMap::<String, String>::new()),
        )
        .await
        .unwrap();
    let body = reply.body();
    let gadget_path: OwnedObjectPath = body.deserialize().unwrap();

    let reply = client
        .call_method(
            None::<&str>,
            gadget_path.as_str(),
            Some("org.usb.device.Gadget.FunctionManager"),
            "CreateFunction",
            &("tty0", "acm"),
        )
        .await
        .unwrap();
    let body = reply.body();
    let function_path: OwnedObjectPath = body.deserialize().unwrap();

    // The kernel fills port_num on real hardware.
    fs::write(tmp.path().join("usb_gadget/g1/functions/acm.tty0/port_num"), "2\n").unwrap();

    let serial_iface = "org.usb.device.SerialFunction";
    let port = get_property(&client, function_path.as_str(), serial_iface, "port_num").await.unwrap();
    assert!(matches!(&*port, Value::U32(2)));
    assert!(get_property(&client, function_path.as_str(), serial_iface, "PortNum").await.is_err());
}
