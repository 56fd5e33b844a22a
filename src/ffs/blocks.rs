//! FunctionFS wire formats and mount helpers.

use bitflags::bitflags;
use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use nix::mount::{MntFlags, MsFlags};
use std::{
    io::Read,
    path::Path,
};

use crate::{lang::LangId, Error, Result};

/// USB direction to device.
pub const DIR_OUT: u8 = 0x00;
/// USB direction to host.
pub const DIR_IN: u8 = 0x80;

#[cfg(not(feature = "legacy-descriptors"))]
const DESCRIPTORS_MAGIC_V2: u32 = 3;
#[cfg(feature = "legacy-descriptors")]
const DESCRIPTORS_MAGIC: u32 = 1;
const STRINGS_MAGIC: u32 = 2;

bitflags! {
    /// Header flags of the V2 descriptor block.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DescFlags: u32 {
        /// Full-speed descriptors follow.
        const HAS_FS_DESC = 1;
        /// High-speed descriptors follow.
        const HAS_HS_DESC = 2;
        /// Super-speed descriptors follow.
        const HAS_SS_DESC = 4;
    }
}

/// FunctionFS endpoint-zero event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::FromRepr)]
#[repr(u8)]
pub enum FfsEvent {
    /// Function was bound to the gadget.
    #[strum(serialize = "FUNCTIONFS_BIND")]
    Bind = 0,
    /// Function was unbound from the gadget.
    #[strum(serialize = "FUNCTIONFS_UNBIND")]
    Unbind = 1,
    /// Function was enabled by the host.
    #[strum(serialize = "FUNCTIONFS_ENABLE")]
    Enable = 2,
    /// Function was disabled by the host.
    #[strum(serialize = "FUNCTIONFS_DISABLE")]
    Disable = 3,
    /// Control request addressed at the function.
    #[strum(serialize = "FUNCTIONFS_SETUP")]
    Setup = 4,
    /// Bus suspend.
    #[strum(serialize = "FUNCTIONFS_SUSPEND")]
    Suspend = 5,
    /// Bus resume.
    #[strum(serialize = "FUNCTIONFS_RESUME")]
    Resume = 6,
}

impl FfsEvent {
    /// Numeric kernel event code.
    pub fn code(&self) -> u8 {
        *self as u8
    }
}

/// Event read from endpoint zero.
#[derive(Debug, Clone)]
pub struct Event {
    /// Setup request payload; meaningful for [`FfsEvent::Setup`] only.
    pub ctrl: [u8; 8],
    /// Event type.
    pub event: FfsEvent,
}

impl Event {
    /// Size of the raw event data.
    pub const SIZE: usize = 12;

    /// Parse raw event data.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut buf = buf;
        let mut ctrl = [0; 8];
        buf.read_exact(&mut ctrl).map_err(|_| Error::BadValue("short event data".into()))?;
        let code = buf.read_u8().map_err(|_| Error::BadValue("short event data".into()))?;
        let event =
            FfsEvent::from_repr(code).ok_or_else(|| Error::BadValue(format!("unknown event type {code}")))?;
        Ok(Self { ctrl, event })
    }
}

/// A single USB descriptor within a speed block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Desc {
    /// Interface descriptor.
    Interface(InterfaceDesc),
    /// Endpoint descriptor without audio extension.
    EndpointNoAudio(EndpointDesc),
}

impl From<InterfaceDesc> for Desc {
    fn from(value: InterfaceDesc) -> Self {
        Self::Interface(value)
    }
}

impl From<EndpointDesc> for Desc {
    fn from(value: EndpointDesc) -> Self {
        Self::EndpointNoAudio(value)
    }
}

impl Desc {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        data.write_u8(0).map_err(Error::from)?;

        match self {
            Self::Interface(d) => d.write(&mut data)?,
            Self::EndpointNoAudio(d) => d.write(&mut data)?,
        }

        data[0] = data.len().try_into().map_err(|_| Error::BadValue("descriptor too long".into()))?;
        Ok(data)
    }

    /// Parse one descriptor, advancing the buffer.
    pub fn parse(buf: &mut &[u8]) -> Result<Self> {
        let short = || Error::BadValue("short descriptor data".into());
        let data = *buf;
        if data.len() < 2 {
            return Err(short());
        }
        let len = data[0] as usize;
        let kind = data[1];
        if len < 2 || data.len() < len {
            return Err(short());
        }
        let mut body = &data[2..len];
        *buf = &data[len..];

        match kind {
            InterfaceDesc::TYPE if len == InterfaceDesc::SIZE => Ok(Self::Interface(InterfaceDesc {
                interface_number: body.read_u8().map_err(|_| short())?,
                alternate_setting: body.read_u8().map_err(|_| short())?,
                num_endpoints: body.read_u8().map_err(|_| short())?,
                interface_class: body.read_u8().map_err(|_| short())?,
                interface_sub_class: body.read_u8().map_err(|_| short())?,
                interface_protocol: body.read_u8().map_err(|_| short())?,
                name_idx: body.read_u8().map_err(|_| short())?,
            })),
            EndpointDesc::TYPE if len == EndpointDesc::SIZE => Ok(Self::EndpointNoAudio(EndpointDesc {
                endpoint_address: body.read_u8().map_err(|_| short())?,
                attributes: body.read_u8().map_err(|_| short())?,
                max_packet_size: body.read_u16::<LE>().map_err(|_| short())?,
                interval: body.read_u8().map_err(|_| short())?,
            })),
            _ => Err(Error::BadValue(format!("unexpected descriptor type 0x{kind:02x}"))),
        }
    }
}

/// USB interface descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDesc {
    /// Interface number, assigned by scan order.
    pub interface_number: u8,
    /// Alternate setting.
    pub alternate_setting: u8,
    /// Number of endpoints belonging to this interface.
    pub num_endpoints: u8,
    /// Interface class code.
    pub interface_class: u8,
    /// Interface subclass code.
    pub interface_sub_class: u8,
    /// Interface protocol code.
    pub interface_protocol: u8,
    /// Index of the interface name string.
    pub name_idx: u8,
}

impl InterfaceDesc {
    /// Interface descriptor type.
    pub const TYPE: u8 = 0x04;
    /// Encoded size.
    pub const SIZE: usize = 9;

    fn write(&self, data: &mut Vec<u8>) -> Result<()> {
        data.write_u8(Self::TYPE).map_err(Error::from)?;
        data.write_u8(self.interface_number).map_err(Error::from)?;
        data.write_u8(self.alternate_setting).map_err(Error::from)?;
        data.write_u8(self.num_endpoints).map_err(Error::from)?;
        data.write_u8(self.interface_class).map_err(Error::from)?;
        data.write_u8(self.interface_sub_class).map_err(Error::from)?;
        data.write_u8(self.interface_protocol).map_err(Error::from)?;
        data.write_u8(self.name_idx).map_err(Error::from)?;
        Ok(())
    }
}

/// USB endpoint descriptor without audio extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDesc {
    /// Endpoint address including the direction bit.
    pub endpoint_address: u8,
    /// Attributes.
    pub attributes: u8,
    /// Maximum packet size; zero lets the kernel pick.
    pub max_packet_size: u16,
    /// Polling interval.
    pub interval: u8,
}

impl EndpointDesc {
    /// Endpoint descriptor type.
    pub const TYPE: u8 = 0x05;
    /// Encoded size without audio fields.
    pub const SIZE: usize = 7;

    fn write(&self, data: &mut Vec<u8>) -> Result<()> {
        data.write_u8(Self::TYPE).map_err(Error::from)?;
        data.write_u8(self.endpoint_address).map_err(Error::from)?;
        data.write_u8(self.attributes).map_err(Error::from)?;
        data.write_u16::<LE>(self.max_packet_size).map_err(Error::from)?;
        data.write_u8(self.interval).map_err(Error::from)?;
        Ok(())
    }
}

/// FunctionFS descriptor block in the on-wire layout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DescBlock {
    /// Full-speed descriptors.
    pub fs_descs: Vec<Desc>,
    /// High-speed descriptors.
    pub hs_descs: Vec<Desc>,
}

impl DescBlock {
    /// Encode the block for writing into endpoint zero.
    #[cfg(not(feature = "legacy-descriptors"))]
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let overflow = || Error::BadValue("too many descriptor entries".into());

        let mut flags = DescFlags::HAS_FS_DESC;
        flags.set(DescFlags::HAS_HS_DESC, !self.hs_descs.is_empty());

        let mut data = Vec::new();
        data.write_u32::<LE>(DESCRIPTORS_MAGIC_V2).map_err(Error::from)?;
        data.write_u32::<LE>(0).map_err(Error::from)?; // length
        data.write_u32::<LE>(flags.bits()).map_err(Error::from)?;

        data.write_u32::<LE>(self.fs_descs.len().try_into().map_err(|_| overflow())?).map_err(Error::from)?;
        if flags.contains(DescFlags::HAS_HS_DESC) {
            data.write_u32::<LE>(self.hs_descs.len().try_into().map_err(|_| overflow())?)
                .map_err(Error::from)?;
        }

        for desc in self.fs_descs.iter().chain(&self.hs_descs) {
            data.extend(desc.to_bytes()?);
        }

        let len: u32 = data.len().try_into().map_err(|_| overflow())?;
        data[4..8].copy_from_slice(&len.to_le_bytes());
        Ok(data)
    }

    /// Encode the block in the pre-V2 layout.
    #[cfg(feature = "legacy-descriptors")]
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let overflow = || Error::BadValue("too many descriptor entries".into());

        let mut data = Vec::new();
        data.write_u32::<LE>(DESCRIPTORS_MAGIC).map_err(Error::from)?;
        data.write_u32::<LE>(0).map_err(Error::from)?; // length
        data.write_u32::<LE>(self.fs_descs.len().try_into().map_err(|_| overflow())?).map_err(Error::from)?;
        data.write_u32::<LE>(self.hs_descs.len().try_into().map_err(|_| overflow())?).map_err(Error::from)?;

        for desc in self.fs_descs.iter().chain(&self.hs_descs) {
            data.extend(desc.to_bytes()?);
        }

        let len: u32 = data.len().try_into().map_err(|_| overflow())?;
        data[4..8].copy_from_slice(&len.to_le_bytes());
        Ok(data)
    }

    /// Decode an encoded V2 block.
    #[cfg(not(feature = "legacy-descriptors"))]
    pub fn parse(data: &[u8]) -> Result<Self> {
        let short = || Error::BadValue("short descriptor block".into());
        let mut buf = data;

        if buf.read_u32::<LE>().map_err(|_| short())? != DESCRIPTORS_MAGIC_V2 {
            return Err(Error::BadValue("bad descriptor block magic".into()));
        }
        let length = buf.read_u32::<LE>().map_err(|_| short())?;
        if length as usize != data.len() {
            return Err(Error::BadValue("descriptor block length mismatch".into()));
        }
        let flags = DescFlags::from_bits(buf.read_u32::<LE>().map_err(|_| short())?)
            .ok_or_else(|| Error::BadValue("unknown descriptor block flags".into()))?;

        let fs_count =
            if flags.contains(DescFlags::HAS_FS_DESC) { buf.read_u32::<LE>().map_err(|_| short())? } else { 0 };
        let hs_count =
            if flags.contains(DescFlags::HAS_HS_DESC) { buf.read_u32::<LE>().map_err(|_| short())? } else { 0 };

        let mut block = Self::default();
        for _ in 0..fs_count {
            block.fs_descs.push(Desc::parse(&mut buf)?);
        }
        for _ in 0..hs_count {
            block.hs_descs.push(Desc::parse(&mut buf)?);
        }

        if !buf.is_empty() {
            return Err(Error::BadValue("trailing descriptor block data".into()));
        }
        Ok(block)
    }
}

/// FunctionFS strings block: one string table per language.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringsBlock {
    /// Strings per language.
    pub langs: Vec<(LangId, Vec<String>)>,
}

impl StringsBlock {
    /// Encode the block for writing into endpoint zero.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let str_count = self.langs.first().map(|(_, strs)| strs.len()).unwrap_or_default();
        if !self.langs.iter().all(|(_, strs)| strs.len() == str_count) {
            return Err(Error::BadValue("string count differs across languages".into()));
        }

        let overflow = || Error::BadValue("too many strings".into());

        let mut data = Vec::new();
        data.write_u32::<LE>(STRINGS_MAGIC).map_err(Error::from)?;
        data.write_u32::<LE>(0).map_err(Error::from)?; // length
        data.write_u32::<LE>(str_count.try_into().map_err(|_| overflow())?).map_err(Error::from)?;
        data.write_u32::<LE>(self.langs.len().try_into().map_err(|_| overflow())?).map_err(Error::from)?;

        for (lang, strs) in &self.langs {
            data.write_u16::<LE>(u16::from(*lang)).map_err(Error::from)?;
            for s in strs {
                data.extend_from_slice(s.as_bytes());
                data.write_u8(0).map_err(Error::from)?;
            }
        }

        let len: u32 = data.len().try_into().map_err(|_| overflow())?;
        data[4..8].copy_from_slice(&len.to_le_bytes());
        Ok(data)
    }
}

/// Filesystem type of FunctionFS.
pub const FS_TYPE: &str = "functionfs";

/// Mount a FunctionFS instance at the given directory.
///
/// Contract: the mount source is the raw instance name, with no further
/// encoding.
pub fn mount(instance: &str, target: &Path) -> Result<()> {
    nix::mount::mount(Some(instance), target, Some(FS_TYPE), MsFlags::empty(), None::<&str>)
        .map_err(|errno| Error::from_errno(errno, format!("mounting functionfs at {}", target.display())))
}

/// Unmount a FunctionFS instance, falling back to a lazy unmount.
pub fn umount(target: &Path) -> Result<()> {
    match nix::mount::umount(target) {
        Ok(()) => Ok(()),
        Err(err) => {
            tracing::debug!("unmount failed, trying lazy unmount: {err}");
            nix::mount::umount2(target, MntFlags::MNT_DETACH)
                .map_err(|errno| Error::from_errno(errno, format!("unmounting {}", target.display())))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn interface(number: u8, eps: u8) -> InterfaceDesc {
        InterfaceDesc {
            interface_number: number,
            alternate_setting: 0,
            num_endpoints: eps,
            interface_class: 0xff,
            interface_sub_class: 0,
            interface_protocol: 0,
            name_idx: 1,
        }
    }

    fn endpoint(addr: u8) -> EndpointDesc {
        EndpointDesc { endpoint_address: addr, attributes: 0x02, max_packet_size: 0, interval: 0 }
    }

    #[test]
    fn desc_block_length() {
        let block = DescBlock {
            fs_descs: vec![interface(0, 2).into(), endpoint(1 | DIR_IN).into(), endpoint(2 | DIR_OUT).into()],
            hs_descs: vec![interface(0, 1).into(), endpoint(1 | DIR_IN).into()],
        };
        let data = block.to_bytes().unwrap();

        // header + per-block count words + descriptor payload
        let payload = InterfaceDesc::SIZE + 2 * EndpointDesc::SIZE + InterfaceDesc::SIZE + EndpointDesc::SIZE;
        let expected = if cfg!(feature = "legacy-descriptors") {
            16 + payload
        } else {
            12 + 2 * 4 + payload
        };
        assert_eq!(data.len(), expected);
        assert_eq!(u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize, data.len());
    }

    #[cfg(not(feature = "legacy-descriptors"))]
    #[test]
    fn desc_block_round_trip() {
        let block = DescBlock {
            fs_descs: vec![interface(0, 2).into(), endpoint(1 | DIR_IN).into(), endpoint(2 | DIR_OUT).into()],
            hs_descs: vec![interface(0, 2).into(), endpoint(1 | DIR_IN).into(), endpoint(2 | DIR_OUT).into()],
        };
        let decoded = DescBlock::parse(&block.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, block);
    }

    #[cfg(not(feature = "legacy-descriptors"))]
    #[test]
    fn desc_block_omits_absent_speeds() {
        let fs_only = DescBlock { fs_descs: vec![interface(0, 0).into()], hs_descs: Vec::new() };
        let data = fs_only.to_bytes().unwrap();
        let flags = u32::from_le_bytes(data[8..12].try_into().unwrap());
        assert_eq!(flags, DescFlags::HAS_FS_DESC.bits());
        // header + one count word + one interface descriptor
        assert_eq!(data.len(), 12 + 4 + InterfaceDesc::SIZE);
    }

    #[test]
    fn strings_block_length() {
        let block = StringsBlock {
            langs: vec![
                (LangId::ENGLISH_US, vec!["Loopback".to_string()]),
                (LangId(0x040c), vec!["Boucle".to_string()]),
            ],
        };
        let data = block.to_bytes().unwrap();

        let expected = 16 + (2 + "Loopback".len() + 1) + (2 + "Boucle".len() + 1);
        assert_eq!(data.len(), expected);
        assert_eq!(u32::from_le_bytes(data[4..8].try_into().unwrap()) as usize, data.len());
        assert_eq!(u32::from_le_bytes(data[8..12].try_into().unwrap()), 1); // str_count
        assert_eq!(u32::from_le_bytes(data[12..16].try_into().unwrap()), 2); // lang_count
    }

    #[test]
    fn strings_block_rejects_uneven_tables() {
        let block = StringsBlock {
            langs: vec![
                (LangId::ENGLISH_US, vec!["a".to_string(), "b".to_string()]),
                (LangId(0x040c), vec!["c".to_string()]),
            ],
        };
        assert!(matches!(block.to_bytes(), Err(Error::BadValue(_))));
    }

    #[test]
    fn event_parse() {
        let mut raw = [0u8; Event::SIZE];
        raw[8] = FfsEvent::Enable.code();
        let event = Event::parse(&raw).unwrap();
        assert_eq!(event.event, FfsEvent::Enable);

        raw[8] = 42;
        assert!(Event::parse(&raw).is_err());
        assert!(Event::parse(&raw[..7]).is_err());
    }

    #[test]
    fn event_names() {
        assert_eq!("FUNCTIONFS_ENABLE".parse::<FfsEvent>().unwrap(), FfsEvent::Enable);
        assert_eq!(FfsEvent::Bind.code(), 0);
        assert_eq!(FfsEvent::Setup.code(), 4);
    }
}
