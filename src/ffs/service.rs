//! Declarative FunctionFS service files.
//!
//! A service file names the program implementing a USB function, the event
//! that triggers its launch and the USB descriptors of the function. Each
//! file in the service directory becomes one registerable function type.

use nix::unistd::{Gid, Group, Uid, User};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use super::{
    blocks::{Desc, DescBlock, EndpointDesc, FfsEvent, InterfaceDesc, StringsBlock, DIR_IN, DIR_OUT},
    FfsService, ServiceOptions,
};
use crate::{lang::LangId, Error, Result};

/// Whitelisted `bInterfaceClass` symbols.
fn interface_class(name: &str) -> Option<u8> {
    Some(match name {
        "USB_CLASS_PER_INTERFACE" => 0x00,
        "USB_CLASS_AUDIO" => 0x01,
        "USB_CLASS_COMM" => 0x02,
        "USB_CLASS_HID" => 0x03,
        "USB_CLASS_PHYSICAL" => 0x05,
        "USB_CLASS_STILL_IMAGE" => 0x06,
        "USB_CLASS_PRINTER" => 0x07,
        "USB_CLASS_MASS_STORAGE" => 0x08,
        "USB_CLASS_HUB" => 0x09,
        "USB_CLASS_CDC_DATA" => 0x0a,
        "USB_CLASS_CSCID" => 0x0b,
        "USB_CLASS_CONTENT_SEC" => 0x0d,
        "USB_CLASS_VIDEO" => 0x0e,
        "USB_CLASS_WIRELESS_CONTROLLER" => 0xe0,
        "USB_CLASS_MISC" => 0xef,
        "USB_CLASS_APP_SPEC" => 0xfe,
        "USB_CLASS_VENDOR_SPEC" => 0xff,
        _ => return None,
    })
}

/// `USB_CONFIG_ATT_*` attribute symbols.
fn config_att(name: &str) -> Option<u8> {
    Some(match name {
        "USB_CONFIG_ATT_ONE" => 1 << 7,
        "USB_CONFIG_ATT_SELFPOWER" => 1 << 6,
        "USB_CONFIG_ATT_WAKEUP" => 1 << 5,
        "USB_CONFIG_ATT_BATTERY" => 1 << 4,
        _ => return None,
    })
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceFile {
    activation_event: String,
    exec: PathBuf,
    working_dir: Option<PathBuf>,
    chroot_to: Option<PathBuf>,
    user: Option<String>,
    uid: Option<u32>,
    group: Option<String>,
    gid: Option<u32>,
    #[serde(default)]
    allow_multiple: bool,
    #[serde(default)]
    allow_concurrent: bool,
    descriptors: Descriptors,
    #[serde(default)]
    strings: Vec<StringEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Descriptors {
    fs_desc: Vec<DescEntry>,
    hs_desc: Option<Vec<DescEntry>>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum DescEntry {
    #[serde(rename = "INTERFACE_DESC")]
    Interface {
        #[serde(rename = "bInterfaceClass")]
        class: NumOrName,
        #[serde(rename = "bInterfaceSubClass", default)]
        sub_class: u8,
        #[serde(rename = "iInterface", default)]
        name_idx: u8,
    },
    #[serde(rename = "EP_NO_AUDIO_DESC")]
    Endpoint {
        address: u8,
        direction: Direction,
        #[serde(rename = "bmAttributes")]
        attributes: AttrSpec,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NumOrName {
    Num(u8),
    Name(String),
}

impl NumOrName {
    fn resolve_class(&self) -> Result<u8> {
        match self {
            Self::Num(value) => Ok(*value),
            Self::Name(name) => {
                interface_class(name).ok_or_else(|| Error::BadValue(format!("unknown interface class {name}")))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Direction {
    In,
    Out,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AttrSpec {
    Num(u8),
    Flags(String),
}

impl AttrSpec {
    fn resolve(&self) -> Result<u8> {
        match self {
            Self::Num(value) => Ok(*value),
            Self::Flags(spec) => {
                let mut attrs = 0;
                for flag in spec.split('|') {
                    let flag = flag.trim();
                    attrs |= config_att(flag)
                        .ok_or_else(|| Error::BadValue(format!("unknown attribute flag {flag}")))?;
                }
                Ok(attrs)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StringEntry {
    lang: LangId,
    str: String,
}

/// Build one speed block, assigning interface numbers by scan order and
/// accumulating endpoint counts into the preceding interface.
fn build_speed_block(entries: &[DescEntry]) -> Result<Vec<Desc>> {
    let mut descs: Vec<Desc> = Vec::new();
    let mut interface_number: u8 = 0;

    for entry in entries {
        match entry {
            DescEntry::Interface { class, sub_class, name_idx } => {
                descs.push(
                    InterfaceDesc {
                        interface_number,
                        alternate_setting: 0,
                        num_endpoints: 0,
                        interface_class: class.resolve_class()?,
                        interface_sub_class: *sub_class,
                        interface_protocol: 0,
                        name_idx: *name_idx,
                    }
                    .into(),
                );
                interface_number = interface_number
                    .checked_add(1)
                    .ok_or_else(|| Error::BadValue("too many interfaces".into()))?;
            }
            DescEntry::Endpoint { address, direction, attributes } => {
                let owner = descs.iter_mut().rev().find_map(|desc| match desc {
                    Desc::Interface(intf) => Some(intf),
                    _ => None,
                });
                let Some(owner) = owner else {
                    return Err(Error::BadValue("endpoint descriptor without preceding interface".into()));
                };
                owner.num_endpoints = owner
                    .num_endpoints
                    .checked_add(1)
                    .ok_or_else(|| Error::BadValue("too many endpoints".into()))?;

                let direction_bit = match direction {
                    Direction::In => DIR_IN,
                    Direction::Out => DIR_OUT,
                };
                descs.push(
                    EndpointDesc {
                        endpoint_address: address | direction_bit,
                        attributes: attributes.resolve()?,
                        max_packet_size: 0,
                        interval: 0,
                    }
                    .into(),
                );
            }
        }
    }

    Ok(descs)
}

fn resolve_uid(file: &ServiceFile) -> Result<Option<Uid>> {
    match (&file.user, file.uid) {
        (Some(_), Some(_)) => Err(Error::Other("user and uid cannot be both defined".into())),
        (Some(name), None) => match User::from_name(name).map_err(Error::from)? {
            Some(user) => Ok(Some(user.uid)),
            None => Err(Error::NotFound(format!("user {name}"))),
        },
        (None, Some(uid)) => match User::from_uid(Uid::from_raw(uid)).map_err(Error::from)? {
            Some(user) => Ok(Some(user.uid)),
            None => Err(Error::NotFound(format!("uid {uid}"))),
        },
        (None, None) => Ok(None),
    }
}

fn resolve_gid(file: &ServiceFile) -> Result<Option<Gid>> {
    match (&file.group, file.gid) {
        (Some(_), Some(_)) => Err(Error::Other("group and gid cannot be both defined".into())),
        (Some(name), None) => match Group::from_name(name).map_err(Error::from)? {
            Some(group) => Ok(Some(group.gid)),
            None => Err(Error::NotFound(format!("group {name}"))),
        },
        (None, Some(gid)) => match Group::from_gid(Gid::from_raw(gid)).map_err(Error::from)? {
            Some(group) => Ok(Some(group.gid)),
            None => Err(Error::NotFound(format!("gid {gid}"))),
        },
        (None, None) => Ok(None),
    }
}

fn check_file(path: &Path) -> Result<()> {
    let meta = fs::metadata(path).map_err(|_| Error::NotFound(format!("path {}", path.display())))?;
    if !meta.is_file() {
        return Err(Error::BadValue(format!("{} is not a file", path.display())));
    }
    Ok(())
}

fn check_dir(path: &Path) -> Result<()> {
    let meta = fs::metadata(path).map_err(|_| Error::NotFound(format!("path {}", path.display())))?;
    if !meta.is_dir() {
        return Err(Error::BadValue(format!("{} is not a directory", path.display())));
    }
    Ok(())
}

/// Load one service file.
pub fn load_service(path: &Path) -> Result<FfsService> {
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| Error::InvalidParam(format!("bad service file name {}", path.display())))?
        .to_string();

    let data = fs::read_to_string(path)
        .map_err(|err| Error::FileOpenFailed(format!("{}: {err}", path.display())))?;
    let file: ServiceFile =
        toml::from_str(&data).map_err(|err| Error::BadValue(format!("{}: {err}", path.display())))?;

    let activation_event = file
        .activation_event
        .parse::<FfsEvent>()
        .map_err(|_| Error::BadValue(format!("unsupported event type {}", file.activation_event)))?;
    if !matches!(activation_event, FfsEvent::Bind | FfsEvent::Enable | FfsEvent::Setup) {
        return Err(Error::BadValue(format!("unsupported event type {}", file.activation_event)));
    }

    check_file(&file.exec)?;
    if let Some(dir) = &file.working_dir {
        check_dir(dir)?;
    }
    if let Some(dir) = &file.chroot_to {
        check_dir(dir)?;
    }

    let uid = resolve_uid(&file)?;
    let gid = resolve_gid(&file)?;

    if file.allow_concurrent && !file.allow_multiple {
        return Err(Error::BadValue("allow_concurrent requires allow_multiple".into()));
    }
    let mut options = ServiceOptions::empty();
    options.set(ServiceOptions::ALLOW_MULTIPLE, file.allow_multiple);
    options.set(ServiceOptions::ALLOW_CONCURRENT, file.allow_concurrent);

    let mut langs: Vec<(LangId, Vec<String>)> = Vec::new();
    for entry in &file.strings {
        if langs.iter().any(|(lang, _)| *lang == entry.lang) {
            return Err(Error::BadValue(format!("duplicate language {}", entry.lang)));
        }
        langs.push((entry.lang, vec![entry.str.clone()]));
    }

    let block = DescBlock {
        fs_descs: build_speed_block(&file.descriptors.fs_desc)?,
        hs_descs: match &file.descriptors.hs_desc {
            Some(entries) => build_speed_block(entries)?,
            None => Vec::new(),
        },
    };

    let descriptors = block.to_bytes()?;
    let strings = StringsBlock { langs }.to_bytes()?;

    Ok(FfsService::new(
        name,
        file.exec,
        file.working_dir,
        file.chroot_to,
        uid,
        gid,
        options,
        activation_event,
        descriptors,
        strings,
    ))
}

/// Load every service file in a directory, in alphabetical order.
///
/// Dot-files and files ending in `.example` are ignored; a file that fails
/// to parse is logged and skipped without affecting its siblings.
pub fn load_service_dir(dir: &Path) -> Result<Vec<Arc<FfsService>>> {
    let entries = fs::read_dir(dir).map_err(|err| Error::FileOpenFailed(format!("{}: {err}", dir.display())))?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(Error::from)?;
        paths.push(entry.path());
    }
    paths.sort();

    let mut services = Vec::new();
    for path in paths {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else { continue };
        if name.starts_with('.') || name.ends_with(".example") || !path.is_file() {
            continue;
        }

        match load_service(&path) {
            Ok(service) => {
                tracing::info!("loaded ffs service {}", service.name);
                services.push(Arc::new(service));
            }
            Err(err) => tracing::warn!("skipping service file {}: {err}", path.display()),
        }
    }

    Ok(services)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    const SERVICE: &str = r#"
        activation_event = "FUNCTIONFS_ENABLE"
        exec = "/bin/sh"
        allow_multiple = true

        [[descriptors.fs_desc]]
        type = "INTERFACE_DESC"
        bInterfaceClass = "USB_CLASS_VENDOR_SPEC"
        iInterface = 1

        [[descriptors.fs_desc]]
        type = "EP_NO_AUDIO_DESC"
        address = 1
        direction = "in"
        bmAttributes = 2

        [[descriptors.fs_desc]]
        type = "EP_NO_AUDIO_DESC"
        address = 2
        direction = "out"
        bmAttributes = "USB_CONFIG_ATT_ONE | USB_CONFIG_ATT_WAKEUP"

        [[strings]]
        lang = 0x0409
        str = "Loopback"
    "#;

    fn write_service(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = fs::File::create(&path).unwrap();
        write!(file, "{contents}").unwrap();
        path
    }

    #[cfg(not(feature = "legacy-descriptors"))]
    #[test]
    fn full_service() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write_service(tmp.path(), "loopback", SERVICE);

        let service = load_service(&path).unwrap();
        assert_eq!(service.name, "loopback");
        assert_eq!(service.activation_event, FfsEvent::Enable);
        assert_eq!(service.exec_path, Path::new("/bin/sh"));
        assert!(service.options.contains(ServiceOptions::ALLOW_MULTIPLE));
        assert!(!service.options.contains(ServiceOptions::ALLOW_CONCURRENT));

        let block = DescBlock::parse(&service.descriptors).unwrap();
        assert_eq!(block.fs_descs.len(), 3);
        let Desc::Interface(intf) = &block.fs_descs[0] else { panic!("expected interface") };
        assert_eq!(intf.interface_number, 0);
        assert_eq!(intf.num_endpoints, 2);
        assert_eq!(intf.interface_class, 0xff);
        let Desc::EndpointNoAudio(ep) = &block.fs_descs[1] else { panic!("expected endpoint") };
        assert_eq!(ep.endpoint_address, 1 | DIR_IN);
        assert_eq!(ep.attributes, 2);
        let Desc::EndpointNoAudio(ep) = &block.fs_descs[2] else { panic!("expected endpoint") };
        assert_eq!(ep.endpoint_address, 2);
        assert_eq!(ep.attributes, (1 << 7) | (1 << 5));
    }

    #[cfg(not(feature = "legacy-descriptors"))]
    #[test]
    fn interface_numbers_per_speed_block() {
        let tmp = tempfile::tempdir().unwrap();
        let contents = r#"
            activation_event = "FUNCTIONFS_BIND"
            exec = "/bin/sh"

            [[descriptors.fs_desc]]
            type = "INTERFACE_DESC"
            bInterfaceClass = 3

            [[descriptors.fs_desc]]
            type = "INTERFACE_DESC"
            bInterfaceClass = 8

            [[descriptors.hs_desc]]
            type = "INTERFACE_DESC"
            bInterfaceClass = 3
        "#;
        let path = write_service(tmp.path(), "multi", contents);

        let service = load_service(&path).unwrap();
        let block = DescBlock::parse(&service.descriptors).unwrap();
        let numbers: Vec<u8> = block
            .fs_descs
            .iter()
            .map(|desc| match desc {
                Desc::Interface(intf) => intf.interface_number,
                _ => panic!("expected interface"),
            })
            .collect();
        assert_eq!(numbers, [0, 1]);
        let Desc::Interface(hs) = &block.hs_descs[0] else { panic!("expected interface") };
        assert_eq!(hs.interface_number, 0);
    }

    #[test]
    fn rejects_bad_event() {
        let tmp = tempfile::tempdir().unwrap();
        let contents = SERVICE.replace("FUNCTIONFS_ENABLE", "FUNCTIONFS_SUSPEND");
        let path = write_service(tmp.path(), "bad", &contents);
        assert!(matches!(load_service(&path), Err(Error::BadValue(_))));
    }

    #[test]
    fn rejects_missing_exec() {
        let tmp = tempfile::tempdir().unwrap();
        let contents = SERVICE.replace("/bin/sh", "/nonexistent/handler");
        let path = write_service(tmp.path(), "bad", &contents);
        assert!(matches!(load_service(&path), Err(Error::NotFound(_))));
    }

    #[test]
    fn rejects_user_uid_conflict() {
        let tmp = tempfile::tempdir().unwrap();
        let contents = format!("user = \"root\"\nuid = 0\n{SERVICE}");
        let path = write_service(tmp.path(), "bad", &contents);
        assert!(matches!(load_service(&path), Err(Error::Other(_))));
    }

    #[test]
    fn rejects_concurrent_without_multiple() {
        let tmp = tempfile::tempdir().unwrap();
        let contents = SERVICE.replace("allow_multiple = true", "allow_concurrent = true");
        let path = write_service(tmp.path(), "bad", &contents);
        assert!(matches!(load_service(&path), Err(Error::BadValue(_))));
    }

    #[test]
    fn rejects_duplicate_language() {
        let tmp = tempfile::tempdir().unwrap();
        let contents = format!("{SERVICE}\n[[strings]]\nlang = 0x0409\nstr = \"again\"\n");
        let path = write_service(tmp.path(), "bad", &contents);
        assert!(matches!(load_service(&path), Err(Error::BadValue(_))));
    }

    #[test]
    fn rejects_unknown_key() {
        let tmp = tempfile::tempdir().unwrap();
        let contents = format!("unexpected_option = 1\n{SERVICE}");
        let path = write_service(tmp.path(), "bad", &contents);
        assert!(matches!(load_service(&path), Err(Error::BadValue(_))));
    }

    #[test]
    fn rejects_endpoint_without_interface() {
        let tmp = tempfile::tempdir().unwrap();
        let contents = r#"
            activation_event = "FUNCTIONFS_BIND"
            exec = "/bin/sh"

            [[descriptors.fs_desc]]
            type = "EP_NO_AUDIO_DESC"
            address = 1
            direction = "in"
            bmAttributes = 2
        "#;
        let path = write_service(tmp.path(), "bad", contents);
        assert!(matches!(load_service(&path), Err(Error::BadValue(_))));
    }

    #[test]
    fn directory_walk() {
        let tmp = tempfile::tempdir().unwrap();
        write_service(tmp.path(), "bravo", SERVICE);
        write_service(tmp.path(), "alpha", SERVICE);
        write_service(tmp.path(), ".hidden", SERVICE);
        write_service(tmp.path(), "skipped.example", SERVICE);
        write_service(tmp.path(), "broken", "activation_event = 42\n");

        let services = load_service_dir(tmp.path()).unwrap();
        let names: Vec<_> = services.iter().map(|service| service.name.as_str()).collect();
        assert_eq!(names, ["alpha", "bravo"]);
    }

    #[test]
    fn missing_directory() {
        assert!(matches!(
            load_service_dir(Path::new("/nonexistent/functions.d")),
            Err(Error::FileOpenFailed(_))
        ));
    }
}
