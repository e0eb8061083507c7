//! MGMT wire types.
//!
//! Every frame is a 6-octet little-endian header `(opcode, dev_id,
//! param_len)` followed by the declared payload, in both directions.

use crate::octets::{Octets, OctetsError};
use bitflags::bitflags;
use btdirect_shared::{Address, AddressType};
use bytes::{BufMut, Bytes, BytesMut};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use strum::Display;
use thiserror::Error;

pub const MGMT_HEADER_SIZE: usize = 6;

/// Device id sentinel addressing no particular adapter.
pub const MGMT_INDEX_NONE: u16 = 0xFFFF;

/// Commands sent over the control channel.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, FromPrimitive)]
#[repr(u16)]
pub enum MgmtOpcode {
    ReadVersion = 0x0001,
    ReadCommands = 0x0002,
    ReadIndexList = 0x0003,
    ReadInfo = 0x0004,
    SetPowered = 0x0005,
    SetDiscoverable = 0x0006,
    SetConnectable = 0x0007,
    SetFastConnectable = 0x0008,
    SetBondable = 0x0009,
    SetLinkSecurity = 0x000A,
    SetSsp = 0x000B,
    SetHs = 0x000C,
    SetLe = 0x000D,
    SetDevClass = 0x000E,
    SetLocalName = 0x000F,
    Disconnect = 0x0014,
    GetConnections = 0x0015,
    SetIoCapability = 0x0018,
    PairDevice = 0x0019,
    CancelPairDevice = 0x001A,
    UnpairDevice = 0x001B,
    StartDiscovery = 0x0023,
    StopDiscovery = 0x0024,
    ConfirmName = 0x0025,
    BlockDevice = 0x0026,
    UnblockDevice = 0x0027,
    SetDeviceId = 0x0028,
    SetAdvertising = 0x0029,
    SetBredr = 0x002A,
    SetStaticAddress = 0x002B,
    SetScanParams = 0x002C,
    SetSecureConn = 0x002D,
    SetDebugKeys = 0x002E,
    SetPrivacy = 0x002F,
    GetConnInfo = 0x0031,
    AddDeviceWhitelist = 0x0033,
    RemoveDeviceWhitelist = 0x0034,
}

/// Events received over the control channel.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, FromPrimitive)]
#[repr(u16)]
pub enum MgmtEventCode {
    CmdComplete = 0x0001,
    CmdStatus = 0x0002,
    ControllerError = 0x0003,
    IndexAdded = 0x0004,
    IndexRemoved = 0x0005,
    NewSettings = 0x0006,
    ClassOfDevChanged = 0x0007,
    LocalNameChanged = 0x0008,
    NewLinkKey = 0x0009,
    NewLongTermKey = 0x000A,
    DeviceConnected = 0x000B,
    DeviceDisconnected = 0x000C,
    ConnectFailed = 0x000D,
    PinCodeRequest = 0x000E,
    UserConfirmRequest = 0x000F,
    UserPasskeyRequest = 0x0010,
    AuthFailed = 0x0011,
    DeviceFound = 0x0012,
    Discovering = 0x0013,
    DeviceBlocked = 0x0014,
    DeviceUnblocked = 0x0015,
    DeviceUnpaired = 0x0016,
    PasskeyNotify = 0x0017,
    NewIrk = 0x0018,
    NewCsrk = 0x0019,
    DeviceWhitelistAdded = 0x001A,
    DeviceWhitelistRemoved = 0x001B,
    NewConnParam = 0x001C,
}

/// Command status reported by the kernel, surfaced verbatim.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, FromPrimitive)]
#[repr(u8)]
pub enum MgmtStatus {
    Success = 0x00,
    UnknownCommand = 0x01,
    NotConnected = 0x02,
    Failed = 0x03,
    ConnectFailed = 0x04,
    AuthFailed = 0x05,
    NotPaired = 0x06,
    NoResources = 0x07,
    Timeout = 0x08,
    AlreadyConnected = 0x09,
    Busy = 0x0A,
    Rejected = 0x0B,
    NotSupported = 0x0C,
    InvalidParams = 0x0D,
    Disconnected = 0x0E,
    NotPowered = 0x0F,
    Cancelled = 0x10,
    InvalidIndex = 0x11,
    RfKilled = 0x12,
    AlreadyPaired = 0x13,
    PermissionDenied = 0x14,
    Unknown = 0xFF,
}

impl MgmtStatus {
    pub fn from_raw(v: u8) -> Self {
        Self::from_u8(v).unwrap_or(Self::Unknown)
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

bitflags! {
    /// Adapter setting bitmask, both supported and current.
    pub struct AdapterSetting: u32 {
        const POWERED = 0x0000_0001;
        const CONNECTABLE = 0x0000_0002;
        const FAST_CONNECTABLE = 0x0000_0004;
        const DISCOVERABLE = 0x0000_0008;
        const BONDABLE = 0x0000_0010;
        const LINK_SECURITY = 0x0000_0020;
        const SSP = 0x0000_0040;
        const BREDR = 0x0000_0080;
        const HS = 0x0000_0100;
        const LE = 0x0000_0200;
        const ADVERTISING = 0x0000_0400;
        const SECURE_CONN = 0x0000_0800;
        const DEBUG_KEYS = 0x0000_1000;
        const PRIVACY = 0x0000_2000;
        const CONFIGURATION = 0x0000_4000;
        const STATIC_ADDRESS = 0x0000_8000;
        const PHY_CONFIGURATION = 0x0001_0000;
    }
}

bitflags! {
    /// Discovery scan type: a bitmask over address kinds.
    pub struct ScanType: u8 {
        const BREDR = 1 << 0;
        const LE = (1 << 1) | (1 << 2);
        const DUAL = Self::BREDR.bits | Self::LE.bits;
    }
}

/// The requested Bluetooth operation mode of an adapter.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash)]
pub enum BtMode {
    #[strum(serialize = "dual")]
    Dual,
    #[strum(serialize = "br/edr")]
    BrEdr,
    #[strum(serialize = "le")]
    Le,
}

impl BtMode {
    /// The scan type discovery uses in this mode.
    pub fn scan_type(self) -> ScanType {
        match self {
            Self::Dual => ScanType::DUAL,
            Self::BrEdr => ScanType::BREDR,
            Self::Le => ScanType::LE,
        }
    }
}

/// Whitelist connect policy for `AddDeviceWhitelist`.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, FromPrimitive)]
#[repr(u8)]
pub enum WhitelistConnectType {
    /// Report the device while scanning, never connect.
    ReportOnly = 0x00,
    /// Allow an incoming connection.
    Incoming = 0x01,
    /// Auto-connect when seen.
    AutoConnect = 0x02,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MgmtParseError {
    #[error("frame shorter than mgmt header: {0} octets")]
    ShortHeader(usize),
    #[error("unknown mgmt opcode 0x{0:04x}")]
    UnknownOpcode(u16),
    #[error("frame param length {declared} does not match payload {actual}")]
    ParamLengthMismatch { declared: usize, actual: usize },
    #[error("truncated mgmt event 0x{opcode:04x}: {source}")]
    Truncated {
        opcode: u16,
        #[source]
        source: OctetsError,
    },
    #[error("current settings 0x{current:08x} exceed supported 0x{supported:08x}")]
    SettingsExceedSupported { current: u32, supported: u32 },
}

/// A command frame sent to the kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MgmtCommand {
    pub opcode: MgmtOpcode,
    pub dev_id: u16,
    pub param: Bytes,
}

impl MgmtCommand {
    pub fn new(opcode: MgmtOpcode, dev_id: u16) -> Self {
        Self {
            opcode,
            dev_id,
            param: Bytes::new(),
        }
    }

    pub fn with_param(opcode: MgmtOpcode, dev_id: u16, param: Bytes) -> Self {
        Self {
            opcode,
            dev_id,
            param,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MGMT_HEADER_SIZE + self.param.len());
        buf.put_u16_le(self.opcode as u16);
        buf.put_u16_le(self.dev_id);
        buf.put_u16_le(self.param.len() as u16);
        buf.put_slice(&self.param);
        buf.freeze()
    }

    /// Parses a command frame back; used by tests and loopback transports.
    pub fn parse(frame: &[u8]) -> Result<Self, MgmtParseError> {
        let (opcode, dev_id, param) = split_frame(frame)?;
        let opcode =
            MgmtOpcode::from_u16(opcode).ok_or(MgmtParseError::UnknownOpcode(opcode))?;
        Ok(Self {
            opcode,
            dev_id,
            param,
        })
    }
}

fn split_frame(frame: &[u8]) -> Result<(u16, u16, Bytes), MgmtParseError> {
    if frame.len() < MGMT_HEADER_SIZE {
        return Err(MgmtParseError::ShortHeader(frame.len()));
    }
    let view = Octets::new(frame);
    let opcode = view.u16_at(0).unwrap();
    let dev_id = view.u16_at(2).unwrap();
    let declared = view.u16_at(4).unwrap() as usize;
    let actual = frame.len() - MGMT_HEADER_SIZE;
    if declared != actual {
        return Err(MgmtParseError::ParamLengthMismatch { declared, actual });
    }
    Ok((
        opcode,
        dev_id,
        Bytes::copy_from_slice(&frame[MGMT_HEADER_SIZE..]),
    ))
}

/// A parsed event frame from the kernel (or from the HCI engine's
/// normalization, which emits the same shapes).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MgmtEvent {
    CmdComplete {
        dev_id: u16,
        req_opcode: u16,
        status: MgmtStatus,
        data: Bytes,
    },
    CmdStatus {
        dev_id: u16,
        req_opcode: u16,
        status: MgmtStatus,
    },
    IndexAdded {
        dev_id: u16,
    },
    IndexRemoved {
        dev_id: u16,
    },
    NewSettings {
        dev_id: u16,
        settings: AdapterSetting,
    },
    LocalNameChanged {
        dev_id: u16,
        name: String,
        short_name: String,
    },
    DeviceConnected {
        dev_id: u16,
        address: Address,
        address_type: AddressType,
        /// Controller connection handle; 0 when the kernel event carried
        /// none, filled in by the HCI engine's normalization.
        handle: u16,
        eir: Bytes,
    },
    DeviceDisconnected {
        dev_id: u16,
        address: Address,
        address_type: AddressType,
        reason: u8,
    },
    ConnectFailed {
        dev_id: u16,
        address: Address,
        address_type: AddressType,
        status: u8,
    },
    DeviceFound {
        dev_id: u16,
        address: Address,
        address_type: AddressType,
        rssi: i8,
        flags: u32,
        eir: Bytes,
    },
    Discovering {
        dev_id: u16,
        scan_type: ScanType,
        enabled: bool,
    },
    /// Anything this stack does not interpret, passed through.
    Unknown {
        dev_id: u16,
        opcode: u16,
        param: Bytes,
    },
}

impl MgmtEvent {
    pub fn dev_id(&self) -> u16 {
        match self {
            Self::CmdComplete { dev_id, .. }
            | Self::CmdStatus { dev_id, .. }
            | Self::IndexAdded { dev_id }
            | Self::IndexRemoved { dev_id }
            | Self::NewSettings { dev_id, .. }
            | Self::LocalNameChanged { dev_id, .. }
            | Self::DeviceConnected { dev_id, .. }
            | Self::DeviceDisconnected { dev_id, .. }
            | Self::ConnectFailed { dev_id, .. }
            | Self::DeviceFound { dev_id, .. }
            | Self::Discovering { dev_id, .. }
            | Self::Unknown { dev_id, .. } => *dev_id,
        }
    }

    pub fn event_code(&self) -> Option<MgmtEventCode> {
        match self {
            Self::CmdComplete { .. } => Some(MgmtEventCode::CmdComplete),
            Self::CmdStatus { .. } => Some(MgmtEventCode::CmdStatus),
            Self::IndexAdded { .. } => Some(MgmtEventCode::IndexAdded),
            Self::IndexRemoved { .. } => Some(MgmtEventCode::IndexRemoved),
            Self::NewSettings { .. } => Some(MgmtEventCode::NewSettings),
            Self::LocalNameChanged { .. } => Some(MgmtEventCode::LocalNameChanged),
            Self::DeviceConnected { .. } => Some(MgmtEventCode::DeviceConnected),
            Self::DeviceDisconnected { .. } => Some(MgmtEventCode::DeviceDisconnected),
            Self::ConnectFailed { .. } => Some(MgmtEventCode::ConnectFailed),
            Self::DeviceFound { .. } => Some(MgmtEventCode::DeviceFound),
            Self::Discovering { .. } => Some(MgmtEventCode::Discovering),
            Self::Unknown { opcode, .. } => MgmtEventCode::from_u16(*opcode),
        }
    }

    pub fn is_reply(&self) -> bool {
        matches!(self, Self::CmdComplete { .. } | Self::CmdStatus { .. })
    }

    /// Parses one event frame.
    pub fn parse(frame: &[u8]) -> Result<Self, MgmtParseError> {
        let (opcode, dev_id, param) = split_frame(frame)?;
        let view = Octets::new(&param);
        let truncated = |source| MgmtParseError::Truncated { opcode, source };
        let event = match MgmtEventCode::from_u16(opcode) {
            Some(MgmtEventCode::CmdComplete) => Self::CmdComplete {
                dev_id,
                req_opcode: view.u16_at(0).map_err(truncated)?,
                status: MgmtStatus::from_raw(view.u8_at(2).map_err(truncated)?),
                data: param.slice(3..),
            },
            Some(MgmtEventCode::CmdStatus) => Self::CmdStatus {
                dev_id,
                req_opcode: view.u16_at(0).map_err(truncated)?,
                status: MgmtStatus::from_raw(view.u8_at(2).map_err(truncated)?),
            },
            Some(MgmtEventCode::IndexAdded) => Self::IndexAdded { dev_id },
            Some(MgmtEventCode::IndexRemoved) => Self::IndexRemoved { dev_id },
            Some(MgmtEventCode::NewSettings) => Self::NewSettings {
                dev_id,
                settings: AdapterSetting::from_bits_truncate(view.u32_at(0).map_err(truncated)?),
            },
            Some(MgmtEventCode::LocalNameChanged) => Self::LocalNameChanged {
                dev_id,
                name: read_name(view.slice_at(0, 249).map_err(truncated)?),
                short_name: read_name(view.slice_at(249, 11).map_err(truncated)?),
            },
            Some(MgmtEventCode::DeviceConnected) => Self::DeviceConnected {
                dev_id,
                address: view.address_at(0).map_err(truncated)?,
                address_type: addr_type(view.u8_at(6).map_err(truncated)?),
                handle: 0,
                eir: eir_tail(&param, 7 + 4 + 2, view).map_err(truncated)?,
            },
            Some(MgmtEventCode::DeviceDisconnected) => Self::DeviceDisconnected {
                dev_id,
                address: view.address_at(0).map_err(truncated)?,
                address_type: addr_type(view.u8_at(6).map_err(truncated)?),
                reason: view.u8_at(7).map_err(truncated)?,
            },
            Some(MgmtEventCode::ConnectFailed) => Self::ConnectFailed {
                dev_id,
                address: view.address_at(0).map_err(truncated)?,
                address_type: addr_type(view.u8_at(6).map_err(truncated)?),
                status: view.u8_at(7).map_err(truncated)?,
            },
            Some(MgmtEventCode::DeviceFound) => Self::DeviceFound {
                dev_id,
                address: view.address_at(0).map_err(truncated)?,
                address_type: addr_type(view.u8_at(6).map_err(truncated)?),
                rssi: view.i8_at(7).map_err(truncated)?,
                flags: view.u32_at(8).map_err(truncated)?,
                eir: eir_tail(&param, 8 + 4 + 2, view).map_err(truncated)?,
            },
            Some(MgmtEventCode::Discovering) => Self::Discovering {
                dev_id,
                scan_type: ScanType::from_bits_truncate(view.u8_at(0).map_err(truncated)?),
                enabled: view.u8_at(1).map_err(truncated)? != 0,
            },
            _ => Self::Unknown {
                dev_id,
                opcode,
                param,
            },
        };
        Ok(event)
    }

    /// Encodes the event back into a frame; used by tests and the HCI
    /// normalization path.
    pub fn encode(&self) -> Bytes {
        let mut param = BytesMut::new();
        let opcode = match self {
            Self::CmdComplete {
                req_opcode,
                status,
                data,
                ..
            } => {
                param.put_u16_le(*req_opcode);
                param.put_u8(*status as u8);
                param.put_slice(data);
                MgmtEventCode::CmdComplete
            }
            Self::CmdStatus {
                req_opcode, status, ..
            } => {
                param.put_u16_le(*req_opcode);
                param.put_u8(*status as u8);
                MgmtEventCode::CmdStatus
            }
            Self::IndexAdded { .. } => MgmtEventCode::IndexAdded,
            Self::IndexRemoved { .. } => MgmtEventCode::IndexRemoved,
            Self::NewSettings { settings, .. } => {
                param.put_u32_le(settings.bits());
                MgmtEventCode::NewSettings
            }
            Self::LocalNameChanged {
                name, short_name, ..
            } => {
                param.put_slice(&write_name(name, 249));
                param.put_slice(&write_name(short_name, 11));
                MgmtEventCode::LocalNameChanged
            }
            Self::DeviceConnected {
                address,
                address_type,
                eir,
                ..
            } => {
                param.put_slice(&address.to_le_bytes());
                param.put_u8(*address_type as u8);
                param.put_u32_le(0);
                param.put_u16_le(eir.len() as u16);
                param.put_slice(eir);
                MgmtEventCode::DeviceConnected
            }
            Self::DeviceDisconnected {
                address,
                address_type,
                reason,
                ..
            } => {
                param.put_slice(&address.to_le_bytes());
                param.put_u8(*address_type as u8);
                param.put_u8(*reason);
                MgmtEventCode::DeviceDisconnected
            }
            Self::ConnectFailed {
                address,
                address_type,
                status,
                ..
            } => {
                param.put_slice(&address.to_le_bytes());
                param.put_u8(*address_type as u8);
                param.put_u8(*status);
                MgmtEventCode::ConnectFailed
            }
            Self::DeviceFound {
                address,
                address_type,
                rssi,
                flags,
                eir,
                ..
            } => {
                param.put_slice(&address.to_le_bytes());
                param.put_u8(*address_type as u8);
                param.put_u8(*rssi as u8);
                param.put_u32_le(*flags);
                param.put_u16_le(eir.len() as u16);
                param.put_slice(eir);
                MgmtEventCode::DeviceFound
            }
            Self::Discovering {
                scan_type, enabled, ..
            } => {
                param.put_u8(scan_type.bits());
                param.put_u8(u8::from(*enabled));
                MgmtEventCode::Discovering
            }
            Self::Unknown { opcode, param: p, .. } => {
                param.put_slice(p);
                return encode_frame(*opcode, self.dev_id(), &param);
            }
        };
        encode_frame(opcode as u16, self.dev_id(), &param)
    }
}

fn encode_frame(opcode: u16, dev_id: u16, param: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(MGMT_HEADER_SIZE + param.len());
    buf.put_u16_le(opcode);
    buf.put_u16_le(dev_id);
    buf.put_u16_le(param.len() as u16);
    buf.put_slice(param);
    buf.freeze()
}

fn addr_type(raw: u8) -> AddressType {
    AddressType::from_u8(raw).unwrap_or(AddressType::Undefined)
}

fn read_name(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn write_name(name: &str, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    let bytes = name.as_bytes();
    let n = bytes.len().min(len - 1);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

fn eir_tail(param: &Bytes, offset: usize, view: Octets<'_>) -> Result<Bytes, OctetsError> {
    let eir_len = view.u16_at(offset - 2)? as usize;
    view.slice_at(offset, eir_len)?;
    Ok(param.slice(offset..offset + eir_len))
}

/// Reply payload of `ReadVersion`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MgmtVersion {
    pub version: u8,
    pub revision: u16,
}

impl MgmtVersion {
    pub fn parse(data: &[u8]) -> Result<Self, MgmtParseError> {
        let view = Octets::new(data);
        let truncated = |source| MgmtParseError::Truncated {
            opcode: MgmtOpcode::ReadVersion as u16,
            source,
        };
        Ok(Self {
            version: view.u8_at(0).map_err(truncated)?,
            revision: view.u16_at(1).map_err(truncated)?,
        })
    }
}

/// Immutable-per-controller record filled from `ReadInfo`, with the mutable
/// current settings, class, and names alongside.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdapterInfo {
    pub dev_id: u16,
    pub address: Address,
    pub hci_version: u8,
    pub manufacturer: u16,
    pub supported_settings: AdapterSetting,
    pub current_settings: AdapterSetting,
    pub dev_class: u32,
    pub name: String,
    pub short_name: String,
}

impl AdapterInfo {
    pub fn parse(dev_id: u16, data: &[u8]) -> Result<Self, MgmtParseError> {
        let view = Octets::new(data);
        let truncated = |source| MgmtParseError::Truncated {
            opcode: MgmtOpcode::ReadInfo as u16,
            source,
        };
        let supported =
            AdapterSetting::from_bits_truncate(view.u32_at(9).map_err(truncated)?);
        let current_raw = view.u32_at(13).map_err(truncated)?;
        let current = AdapterSetting::from_bits_truncate(current_raw);
        if !supported.contains(current) {
            return Err(MgmtParseError::SettingsExceedSupported {
                current: current_raw,
                supported: supported.bits(),
            });
        }
        Ok(Self {
            dev_id,
            address: view.address_at(0).map_err(truncated)?,
            hci_version: view.u8_at(6).map_err(truncated)?,
            manufacturer: view.u16_at(7).map_err(truncated)?,
            supported_settings: supported,
            current_settings: current,
            dev_class: view.u24_at(17).map_err(truncated)?,
            name: read_name(view.slice_at(20, 249).map_err(truncated)?),
            short_name: read_name(view.slice_at(269, 11).map_err(truncated)?),
        })
    }

    /// Applies a `NewSettings` update, keeping the supported-set invariant.
    pub fn apply_settings(&mut self, settings: AdapterSetting) {
        self.current_settings = settings & self.supported_settings;
    }
}

/// Parses the index list reply of `ReadIndexList`.
pub fn parse_index_list(data: &[u8]) -> Result<Vec<u16>, MgmtParseError> {
    let view = Octets::new(data);
    let truncated = |source| MgmtParseError::Truncated {
        opcode: MgmtOpcode::ReadIndexList as u16,
        source,
    };
    let count = view.u16_at(0).map_err(truncated)? as usize;
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        out.push(view.u16_at(2 + i * 2).map_err(truncated)?);
    }
    Ok(out)
}

/// Parses the `ReadCommands` reply into (commands, events).
pub fn parse_command_list(data: &[u8]) -> Result<(Vec<u16>, Vec<u16>), MgmtParseError> {
    let view = Octets::new(data);
    let truncated = |source| MgmtParseError::Truncated {
        opcode: MgmtOpcode::ReadCommands as u16,
        source,
    };
    let num_commands = view.u16_at(0).map_err(truncated)? as usize;
    let num_events = view.u16_at(2).map_err(truncated)? as usize;
    let mut commands = Vec::with_capacity(num_commands);
    let mut events = Vec::with_capacity(num_events);
    for i in 0..num_commands {
        commands.push(view.u16_at(4 + i * 2).map_err(truncated)?);
    }
    for i in 0..num_events {
        events.push(view.u16_at(4 + (num_commands + i) * 2).map_err(truncated)?);
    }
    Ok((commands, events))
}
