//! HCI wire types.
//!
//! Raw channel frames are `packet_type(1) | payload`; event payloads are
//! `event_code(1) | param_len(1) | param`, with meta events prefixing the
//! param with a subevent octet.

use crate::octets::{Octets, OctetsError};
use btdirect_shared::{Address, AddressType};
use bytes::{BufMut, Bytes, BytesMut};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use strum::Display;
use thiserror::Error;

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, FromPrimitive)]
#[repr(u8)]
pub enum HciPacketType {
    Command = 0x01,
    AclData = 0x02,
    ScoData = 0x03,
    Event = 0x04,
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, FromPrimitive)]
#[repr(u8)]
pub enum HciEventCode {
    ConnComplete = 0x03,
    DisconnComplete = 0x05,
    CmdComplete = 0x0E,
    CmdStatus = 0x0F,
    HardwareError = 0x10,
    LeMeta = 0x3E,
}

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, FromPrimitive)]
#[repr(u8)]
pub enum HciMetaEventCode {
    LeConnComplete = 0x01,
    LeAdvReport = 0x02,
    LeConnUpdateComplete = 0x03,
}

/// Command opcodes, `OGF << 10 | OCF`.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, FromPrimitive)]
#[repr(u16)]
pub enum HciOpcode {
    CreateConn = 0x0405,
    Disconnect = 0x0406,
    SetEventMask = 0x0C01,
    Reset = 0x0C03,
    ReadLocalVersion = 0x1001,
    LeSetEventMask = 0x2001,
    LeSetScanParams = 0x200B,
    LeSetScanEnable = 0x200C,
    LeCreateConn = 0x200D,
    LeCreateConnCancel = 0x200E,
}

/// Controller status codes, surfaced verbatim, plus the stack-internal
/// pseudo codes `InternalTimeout`/`InternalFailure`.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, FromPrimitive)]
#[repr(u8)]
pub enum HciStatus {
    Success = 0x00,
    UnknownCommand = 0x01,
    UnknownConnectionIdentifier = 0x02,
    HardwareFailure = 0x03,
    PageTimeout = 0x04,
    AuthenticationFailure = 0x05,
    PinOrKeyMissing = 0x06,
    MemoryCapacityExceeded = 0x07,
    ConnectionTimeout = 0x08,
    ConnectionLimitExceeded = 0x09,
    SyncConnectionLimitExceeded = 0x0A,
    ConnectionAlreadyExists = 0x0B,
    CommandDisallowed = 0x0C,
    RejectedLimitedResources = 0x0D,
    RejectedSecurityReasons = 0x0E,
    RejectedUnacceptableBdAddr = 0x0F,
    ConnectionAcceptTimeout = 0x10,
    UnsupportedFeature = 0x11,
    InvalidParams = 0x12,
    RemoteUserTerminatedConnection = 0x13,
    RemoteTerminatedLowResources = 0x14,
    RemoteTerminatedPowerOff = 0x15,
    ConnectionTerminatedByLocalHost = 0x16,
    UnacceptableConnectionParam = 0x3B,
    /// No reply within the configured timeout; not a controller code.
    InternalTimeout = 0xFD,
    /// Engine unusable, e.g. after a socket error; not a controller code.
    InternalFailure = 0xFE,
    Unknown = 0xFF,
}

impl HciStatus {
    pub fn from_raw(v: u8) -> Self {
        Self::from_u8(v).unwrap_or(Self::Unknown)
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Socket-level event filter, mirroring the kernel's `hci_filter`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct HciFilter {
    pub type_mask: u32,
    pub event_mask: [u32; 2],
    pub opcode: u16,
}

impl HciFilter {
    pub fn set_packet_type(&mut self, ptype: HciPacketType) {
        self.type_mask |= 1 << (ptype as u32 & 31);
    }

    pub fn set_event(&mut self, event: HciEventCode) {
        let bit = event as u32 & 63;
        self.event_mask[(bit >> 5) as usize] |= 1 << (bit & 31);
    }

    /// The filter every engine installs at open: event packets carrying the
    /// events this stack interprets.
    pub fn standard() -> Self {
        let mut filter = Self::default();
        filter.set_packet_type(HciPacketType::Event);
        for event in [
            HciEventCode::ConnComplete,
            HciEventCode::DisconnComplete,
            HciEventCode::CmdComplete,
            HciEventCode::CmdStatus,
            HciEventCode::HardwareError,
            HciEventCode::LeMeta,
        ] {
            filter.set_event(event);
        }
        filter
    }
}

/// Per-engine LE meta-event mask; bit `subevent - 1`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct MetaEventMask(pub u32);

impl MetaEventMask {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn with(mut self, meta: HciMetaEventCode) -> Self {
        self.0 |= 1 << (meta as u32 - 1);
        self
    }

    pub fn test(&self, meta: HciMetaEventCode) -> bool {
        self.0 & (1 << (meta as u32 - 1)) != 0
    }
}

impl Default for MetaEventMask {
    /// At minimum the LE connection-complete subevent.
    fn default() -> Self {
        Self::new().with(HciMetaEventCode::LeConnComplete)
    }
}

/// A command, encoded as `0x01 | opcode | param_len | param`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HciCommand {
    pub opcode: HciOpcode,
    pub param: Bytes,
}

impl HciCommand {
    pub fn new(opcode: HciOpcode) -> Self {
        Self {
            opcode,
            param: Bytes::new(),
        }
    }

    pub fn with_param(opcode: HciOpcode, param: Bytes) -> Self {
        Self { opcode, param }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.param.len());
        buf.put_u8(HciPacketType::Command as u8);
        buf.put_u16_le(self.opcode as u16);
        buf.put_u8(self.param.len() as u8);
        buf.put_slice(&self.param);
        buf.freeze()
    }
}

/// LE connection parameters for `LeCreateConn`, 1.25 ms / 0.625 ms units as
/// on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeConnParams {
    pub scan_interval: u16,
    pub scan_window: u16,
    pub own_address_type: AddressType,
    pub conn_interval_min: u16,
    pub conn_interval_max: u16,
    pub conn_latency: u16,
    pub supervision_timeout: u16,
}

impl Default for LeConnParams {
    fn default() -> Self {
        Self {
            scan_interval: 0x0004,
            scan_window: 0x0004,
            own_address_type: AddressType::LePublic,
            conn_interval_min: 0x000F,
            conn_interval_max: 0x000F,
            conn_latency: 0x0000,
            supervision_timeout: 0x0C80,
        }
    }
}

pub fn le_create_conn_param(
    peer: Address,
    peer_kind: AddressType,
    params: &LeConnParams,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(25);
    buf.put_u16_le(params.scan_interval);
    buf.put_u16_le(params.scan_window);
    buf.put_u8(0); // filter policy: use peer address
    buf.put_u8(le_addr_type(peer_kind));
    buf.put_slice(&peer.to_le_bytes());
    buf.put_u8(le_addr_type(params.own_address_type));
    buf.put_u16_le(params.conn_interval_min);
    buf.put_u16_le(params.conn_interval_max);
    buf.put_u16_le(params.conn_latency);
    buf.put_u16_le(params.supervision_timeout);
    buf.put_u16_le(0x0001); // min CE length
    buf.put_u16_le(0x0001); // max CE length
    buf.freeze()
}

pub fn create_conn_param(
    peer: Address,
    packet_type: u16,
    clock_offset: u16,
    role_switch: bool,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(13);
    buf.put_slice(&peer.to_le_bytes());
    buf.put_u16_le(packet_type);
    buf.put_u8(0x02); // page scan repetition mode R2
    buf.put_u8(0x00);
    buf.put_u16_le(clock_offset);
    buf.put_u8(u8::from(role_switch));
    buf.freeze()
}

pub fn disconnect_param(handle: u16, reason: HciStatus) -> Bytes {
    let mut buf = BytesMut::with_capacity(3);
    buf.put_u16_le(handle);
    buf.put_u8(reason as u8);
    buf.freeze()
}

fn le_addr_type(kind: AddressType) -> u8 {
    match kind {
        AddressType::LeRandom => 0x01,
        _ => 0x00,
    }
}

fn le_addr_kind(raw: u8) -> AddressType {
    match raw {
        0x00 => AddressType::LePublic,
        0x01 => AddressType::LeRandom,
        _ => AddressType::Undefined,
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HciParseError {
    #[error("frame shorter than hci event header: {0} octets")]
    ShortHeader(usize),
    #[error("not an event packet: type 0x{0:02x}")]
    NotAnEvent(u8),
    #[error("event param length {declared} does not match payload {actual}")]
    ParamLengthMismatch { declared: usize, actual: usize },
    #[error("truncated hci event 0x{code:02x}: {source}")]
    Truncated {
        code: u8,
        #[source]
        source: OctetsError,
    },
}

/// A parsed HCI event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HciEvent {
    CmdComplete {
        num_hci_cmd_pkts: u8,
        opcode: u16,
        return_param: Bytes,
    },
    CmdStatus {
        status: HciStatus,
        num_hci_cmd_pkts: u8,
        opcode: u16,
    },
    ConnComplete {
        status: HciStatus,
        handle: u16,
        address: Address,
        link_type: u8,
        encrypt: u8,
    },
    DisconnComplete {
        status: HciStatus,
        handle: u16,
        reason: u8,
    },
    LeConnComplete {
        status: HciStatus,
        handle: u16,
        role: u8,
        peer_address_type: AddressType,
        peer_address: Address,
        conn_interval: u16,
        conn_latency: u16,
        supervision_timeout: u16,
    },
    LeAdvReport {
        data: Bytes,
    },
    HardwareError {
        code: u8,
    },
    /// Filtered-in but uninterpreted; dropped by the engine.
    Unknown {
        code: u8,
        subevent: Option<u8>,
        param: Bytes,
    },
}

impl HciEvent {
    pub fn is_reply(&self) -> bool {
        matches!(self, Self::CmdComplete { .. } | Self::CmdStatus { .. })
    }

    /// Parses one raw-channel frame.
    pub fn parse(frame: &[u8]) -> Result<Self, HciParseError> {
        if frame.len() < 3 {
            return Err(HciParseError::ShortHeader(frame.len()));
        }
        if frame[0] != HciPacketType::Event as u8 {
            return Err(HciParseError::NotAnEvent(frame[0]));
        }
        let code = frame[1];
        let declared = frame[2] as usize;
        let param = &frame[3..];
        if declared != param.len() {
            return Err(HciParseError::ParamLengthMismatch {
                declared,
                actual: param.len(),
            });
        }
        let view = Octets::new(param);
        let truncated = |source| HciParseError::Truncated { code, source };
        let event = match HciEventCode::from_u8(code) {
            Some(HciEventCode::CmdComplete) => Self::CmdComplete {
                num_hci_cmd_pkts: view.u8_at(0).map_err(truncated)?,
                opcode: view.u16_at(1).map_err(truncated)?,
                return_param: Bytes::copy_from_slice(&param[3..]),
            },
            Some(HciEventCode::CmdStatus) => Self::CmdStatus {
                status: HciStatus::from_raw(view.u8_at(0).map_err(truncated)?),
                num_hci_cmd_pkts: view.u8_at(1).map_err(truncated)?,
                opcode: view.u16_at(2).map_err(truncated)?,
            },
            Some(HciEventCode::ConnComplete) => Self::ConnComplete {
                status: HciStatus::from_raw(view.u8_at(0).map_err(truncated)?),
                handle: view.u16_at(1).map_err(truncated)?,
                address: view.address_at(3).map_err(truncated)?,
                link_type: view.u8_at(9).map_err(truncated)?,
                encrypt: view.u8_at(10).map_err(truncated)?,
            },
            Some(HciEventCode::DisconnComplete) => Self::DisconnComplete {
                status: HciStatus::from_raw(view.u8_at(0).map_err(truncated)?),
                handle: view.u16_at(1).map_err(truncated)?,
                reason: view.u8_at(3).map_err(truncated)?,
            },
            Some(HciEventCode::HardwareError) => Self::HardwareError {
                code: view.u8_at(0).map_err(truncated)?,
            },
            Some(HciEventCode::LeMeta) => {
                let subevent = view.u8_at(0).map_err(truncated)?;
                match HciMetaEventCode::from_u8(subevent) {
                    Some(HciMetaEventCode::LeConnComplete) => Self::LeConnComplete {
                        status: HciStatus::from_raw(view.u8_at(1).map_err(truncated)?),
                        handle: view.u16_at(2).map_err(truncated)?,
                        role: view.u8_at(4).map_err(truncated)?,
                        peer_address_type: le_addr_kind(view.u8_at(5).map_err(truncated)?),
                        peer_address: view.address_at(6).map_err(truncated)?,
                        conn_interval: view.u16_at(12).map_err(truncated)?,
                        conn_latency: view.u16_at(14).map_err(truncated)?,
                        supervision_timeout: view.u16_at(16).map_err(truncated)?,
                    },
                    Some(HciMetaEventCode::LeAdvReport) => Self::LeAdvReport {
                        data: Bytes::copy_from_slice(&param[1..]),
                    },
                    _ => Self::Unknown {
                        code,
                        subevent: Some(subevent),
                        param: Bytes::copy_from_slice(param),
                    },
                }
            }
            None => Self::Unknown {
                code,
                subevent: None,
                param: Bytes::copy_from_slice(param),
            },
        };
        Ok(event)
    }

    /// Encodes the event into a raw-channel frame; test and loopback aid.
    pub fn encode(&self) -> Bytes {
        let mut param = BytesMut::new();
        let code: u8 = match self {
            Self::CmdComplete {
                num_hci_cmd_pkts,
                opcode,
                return_param,
            } => {
                param.put_u8(*num_hci_cmd_pkts);
                param.put_u16_le(*opcode);
                param.put_slice(return_param);
                HciEventCode::CmdComplete as u8
            }
            Self::CmdStatus {
                status,
                num_hci_cmd_pkts,
                opcode,
            } => {
                param.put_u8(*status as u8);
                param.put_u8(*num_hci_cmd_pkts);
                param.put_u16_le(*opcode);
                HciEventCode::CmdStatus as u8
            }
            Self::ConnComplete {
                status,
                handle,
                address,
                link_type,
                encrypt,
            } => {
                param.put_u8(*status as u8);
                param.put_u16_le(*handle);
                param.put_slice(&address.to_le_bytes());
                param.put_u8(*link_type);
                param.put_u8(*encrypt);
                HciEventCode::ConnComplete as u8
            }
            Self::DisconnComplete {
                status,
                handle,
                reason,
            } => {
                param.put_u8(*status as u8);
                param.put_u16_le(*handle);
                param.put_u8(*reason);
                HciEventCode::DisconnComplete as u8
            }
            Self::LeConnComplete {
                status,
                handle,
                role,
                peer_address_type,
                peer_address,
                conn_interval,
                conn_latency,
                supervision_timeout,
            } => {
                param.put_u8(HciMetaEventCode::LeConnComplete as u8);
                param.put_u8(*status as u8);
                param.put_u16_le(*handle);
                param.put_u8(*role);
                param.put_u8(match peer_address_type {
                    AddressType::LeRandom => 0x01,
                    _ => 0x00,
                });
                param.put_slice(&peer_address.to_le_bytes());
                param.put_u16_le(*conn_interval);
                param.put_u16_le(*conn_latency);
                param.put_u16_le(*supervision_timeout);
                param.put_u8(0x00); // master clock accuracy
                HciEventCode::LeMeta as u8
            }
            Self::LeAdvReport { data } => {
                param.put_u8(HciMetaEventCode::LeAdvReport as u8);
                param.put_slice(data);
                HciEventCode::LeMeta as u8
            }
            Self::HardwareError { code } => {
                param.put_u8(*code);
                HciEventCode::HardwareError as u8
            }
            Self::Unknown {
                code,
                subevent,
                param: p,
            } => {
                debug_assert!(subevent.is_none() || p.first() == subevent.as_ref());
                param.put_slice(p);
                *code
            }
        };
        let mut buf = BytesMut::with_capacity(3 + param.len());
        buf.put_u8(HciPacketType::Event as u8);
        buf.put_u8(code);
        buf.put_u8(param.len() as u8);
        buf.put_slice(&param);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_encode_layout() {
        let cmd = HciCommand::with_param(
            HciOpcode::Disconnect,
            disconnect_param(0x0040, HciStatus::RemoteUserTerminatedConnection),
        );
        let frame = cmd.encode();
        assert_eq!(&frame[..], &[0x01, 0x06, 0x04, 0x03, 0x40, 0x00, 0x13]);
    }

    #[test]
    fn event_encode_parse_round_trip() {
        let addr: Address = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let events = [
            HciEvent::CmdComplete {
                num_hci_cmd_pkts: 1,
                opcode: HciOpcode::Reset as u16,
                return_param: Bytes::from_static(&[0x00]),
            },
            HciEvent::CmdStatus {
                status: HciStatus::Success,
                num_hci_cmd_pkts: 1,
                opcode: HciOpcode::LeCreateConn as u16,
            },
            HciEvent::LeConnComplete {
                status: HciStatus::Success,
                handle: 0x0040,
                role: 0,
                peer_address_type: AddressType::LePublic,
                peer_address: addr,
                conn_interval: 0x000F,
                conn_latency: 0,
                supervision_timeout: 0x0C80,
            },
            HciEvent::DisconnComplete {
                status: HciStatus::Success,
                handle: 0x0040,
                reason: 0x13,
            },
            HciEvent::HardwareError { code: 0x42 },
        ];
        for event in events {
            let frame = event.encode();
            assert_eq!(HciEvent::parse(&frame).unwrap(), event, "{event:?}");
        }
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(matches!(
            HciEvent::parse(&[0x04, 0x0E]),
            Err(HciParseError::ShortHeader(2))
        ));
        assert!(matches!(
            HciEvent::parse(&[0x02, 0x0E, 0x00]),
            Err(HciParseError::NotAnEvent(0x02))
        ));
        assert!(matches!(
            HciEvent::parse(&[0x04, 0x0E, 0x05, 0x01]),
            Err(HciParseError::ParamLengthMismatch { declared: 5, actual: 1 })
        ));
    }

    #[test]
    fn standard_filter_masks() {
        let filter = HciFilter::standard();
        assert_eq!(filter.type_mask, 1 << 0x04);
        // CONN_COMPLETE(0x03), DISCONN_COMPLETE(0x05), CMD_COMPLETE(0x0E),
        // CMD_STATUS(0x0F), HARDWARE_ERROR(0x10), LE_META(0x3E)
        assert_eq!(
            filter.event_mask[0],
            (1 << 0x03) | (1 << 0x05) | (1 << 0x0E) | (1 << 0x0F) | (1 << 0x10)
        );
        assert_eq!(filter.event_mask[1], 1 << (0x3E - 32));
    }

    #[test]
    fn meta_mask_defaults_to_le_conn_complete() {
        let mask = MetaEventMask::default();
        assert!(mask.test(HciMetaEventCode::LeConnComplete));
        assert!(!mask.test(HciMetaEventCode::LeAdvReport));
    }
}
