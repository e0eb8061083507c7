//! ATT protocol data units.
//!
//! Every PDU is `opcode(1) | params(0..MTU-1) | auth_sig(0|12)`; bit 7 of the
//! opcode flags an authentication signature, bit 6 flags a command, bits 0-5
//! are the method. PDUs form a closed set, parsed by a single match over the
//! opcode; unknown opcodes are rejected so the caller can drop the frame.

use crate::octets::{Octets, OctetsError};
use btdirect_shared::BtUuid;
use bytes::{BufMut, Bytes, BytesMut};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use strum::Display;
use thiserror::Error;

/// Fixed channel id carrying ATT over L2CAP.
pub const ATT_CID: u16 = 0x0004;

/// Minimum ATT MTU for LE (BT Core Spec Vol 3, Part G, 5.2.1).
pub const ATT_MTU_MIN: u16 = 23;

/// Maximum length of an attribute value (BT Core Spec Vol 3, Part F, 3.2.8).
pub const ATT_VALUE_MAX: u16 = 512;

const OPCODE_METHOD_MASK: u8 = 0x3F;
const OPCODE_COMMAND_FLAG: u8 = 0x40;
const OPCODE_AUTH_SIG_FLAG: u8 = 0x80;
const AUTH_SIG_LEN: usize = 12;

#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, FromPrimitive)]
#[repr(u8)]
pub enum AttOpcode {
    ErrorRsp = 0x01,
    ExchangeMtuReq = 0x02,
    ExchangeMtuRsp = 0x03,
    FindInformationReq = 0x04,
    FindInformationRsp = 0x05,
    FindByTypeValueReq = 0x06,
    FindByTypeValueRsp = 0x07,
    ReadByTypeReq = 0x08,
    ReadByTypeRsp = 0x09,
    ReadReq = 0x0A,
    ReadRsp = 0x0B,
    ReadBlobReq = 0x0C,
    ReadBlobRsp = 0x0D,
    ReadMultipleReq = 0x0E,
    ReadMultipleRsp = 0x0F,
    ReadByGroupTypeReq = 0x10,
    ReadByGroupTypeRsp = 0x11,
    WriteReq = 0x12,
    WriteRsp = 0x13,
    HandleValueNtf = 0x1B,
    HandleValueInd = 0x1D,
    HandleValueCfm = 0x1E,
    WriteCmd = 0x52,
    SignedWriteCmd = 0xD2,
}

impl AttOpcode {
    pub fn method(self) -> u8 {
        self as u8 & OPCODE_METHOD_MASK
    }

    pub fn is_command(self) -> bool {
        self as u8 & OPCODE_COMMAND_FLAG != 0
    }

    pub fn has_auth_sig(self) -> bool {
        self as u8 & OPCODE_AUTH_SIG_FLAG != 0
    }
}

/// ATT error codes carried in an `ErrorRsp`.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq, Hash, FromPrimitive)]
#[repr(u8)]
pub enum AttErrorCode {
    InvalidHandle = 0x01,
    ReadNotPermitted = 0x02,
    WriteNotPermitted = 0x03,
    InvalidPdu = 0x04,
    InsufficientAuthentication = 0x05,
    RequestNotSupported = 0x06,
    InvalidOffset = 0x07,
    InsufficientAuthorization = 0x08,
    PrepareQueueFull = 0x09,
    AttributeNotFound = 0x0A,
    AttributeNotLong = 0x0B,
    InsufficientEncryptionKeySize = 0x0C,
    InvalidAttributeValueLength = 0x0D,
    UnlikelyError = 0x0E,
    InsufficientEncryption = 0x0F,
    UnsupportedGroupType = 0x10,
    InsufficientResources = 0x11,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AttDecodeError {
    #[error("empty pdu")]
    Empty,
    #[error("unknown att opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("truncated {opcode} pdu: {source}")]
    Truncated {
        opcode: AttOpcode,
        #[source]
        source: OctetsError,
    },
    #[error("{opcode} pdu carries {len} trailing octets")]
    TrailingData { opcode: AttOpcode, len: usize },
}

/// A parsed ATT PDU.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttPdu {
    ErrorRsp {
        /// Opcode of the request that caused the error, verbatim.
        req_opcode: u8,
        handle: u16,
        /// Error code, verbatim; see [AttPdu::error_code].
        error: u8,
    },
    ExchangeMtuReq {
        mtu: u16,
    },
    ExchangeMtuRsp {
        mtu: u16,
    },
    FindInformationReq {
        start: u16,
        end: u16,
    },
    FindInformationRsp {
        /// 0x01: 16-bit types, 0x02: 128-bit types.
        format: u8,
        data: Bytes,
    },
    ReadByTypeReq {
        start: u16,
        end: u16,
        attr_type: BtUuid,
    },
    ReadByTypeRsp {
        element_len: u8,
        data: Bytes,
    },
    ReadReq {
        handle: u16,
    },
    ReadRsp {
        value: Bytes,
    },
    ReadBlobReq {
        handle: u16,
        offset: u16,
    },
    ReadBlobRsp {
        value: Bytes,
    },
    ReadByGroupTypeReq {
        start: u16,
        end: u16,
        group_type: BtUuid,
    },
    ReadByGroupTypeRsp {
        element_len: u8,
        data: Bytes,
    },
    WriteReq {
        handle: u16,
        value: Bytes,
    },
    WriteRsp,
    WriteCmd {
        handle: u16,
        value: Bytes,
    },
    SignedWriteCmd {
        handle: u16,
        value: Bytes,
        auth_sig: [u8; AUTH_SIG_LEN],
    },
    HandleValueNtf {
        handle: u16,
        value: Bytes,
    },
    HandleValueInd {
        handle: u16,
        value: Bytes,
    },
    HandleValueCfm,
}

impl AttPdu {
    pub fn opcode(&self) -> AttOpcode {
        match self {
            Self::ErrorRsp { .. } => AttOpcode::ErrorRsp,
            Self::ExchangeMtuReq { .. } => AttOpcode::ExchangeMtuReq,
            Self::ExchangeMtuRsp { .. } => AttOpcode::ExchangeMtuRsp,
            Self::FindInformationReq { .. } => AttOpcode::FindInformationReq,
            Self::FindInformationRsp { .. } => AttOpcode::FindInformationRsp,
            Self::ReadByTypeReq { .. } => AttOpcode::ReadByTypeReq,
            Self::ReadByTypeRsp { .. } => AttOpcode::ReadByTypeRsp,
            Self::ReadReq { .. } => AttOpcode::ReadReq,
            Self::ReadRsp { .. } => AttOpcode::ReadRsp,
            Self::ReadBlobReq { .. } => AttOpcode::ReadBlobReq,
            Self::ReadBlobRsp { .. } => AttOpcode::ReadBlobRsp,
            Self::ReadByGroupTypeReq { .. } => AttOpcode::ReadByGroupTypeReq,
            Self::ReadByGroupTypeRsp { .. } => AttOpcode::ReadByGroupTypeRsp,
            Self::WriteReq { .. } => AttOpcode::WriteReq,
            Self::WriteRsp => AttOpcode::WriteRsp,
            Self::WriteCmd { .. } => AttOpcode::WriteCmd,
            Self::SignedWriteCmd { .. } => AttOpcode::SignedWriteCmd,
            Self::HandleValueNtf { .. } => AttOpcode::HandleValueNtf,
            Self::HandleValueInd { .. } => AttOpcode::HandleValueInd,
            Self::HandleValueCfm => AttOpcode::HandleValueCfm,
        }
    }

    /// Known error code of an `ErrorRsp`, if this is one.
    pub fn error_code(&self) -> Option<AttErrorCode> {
        match self {
            Self::ErrorRsp { error, .. } => AttErrorCode::from_u8(*error),
            _ => None,
        }
    }

    /// Whether this is an `ErrorRsp` caused by the given request opcode.
    pub fn is_error_for(&self, req: AttOpcode) -> bool {
        matches!(self, Self::ErrorRsp { req_opcode, .. } if *req_opcode == req as u8)
    }

    /// Parses one PDU from a single L2CAP datagram.
    pub fn parse(frame: &[u8]) -> Result<Self, AttDecodeError> {
        let view = Octets::new(frame);
        let raw = view.u8_at(0).map_err(|_| AttDecodeError::Empty)?;
        let opcode = AttOpcode::from_u8(raw).ok_or(AttDecodeError::UnknownOpcode(raw))?;
        let truncated = |source| AttDecodeError::Truncated { opcode, source };
        let params_end = if opcode.has_auth_sig() {
            frame
                .len()
                .checked_sub(AUTH_SIG_LEN)
                .filter(|end| *end >= 1)
                .ok_or_else(|| {
                    truncated(OctetsError::OutOfBounds {
                        index: 1,
                        count: AUTH_SIG_LEN,
                        len: frame.len(),
                    })
                })?
        } else {
            frame.len()
        };
        let rest = |from: usize| -> Bytes {
            Bytes::copy_from_slice(&frame[from.min(params_end)..params_end])
        };
        let fixed = |expected: usize| -> Result<(), AttDecodeError> {
            if params_end - 1 < expected {
                Err(truncated(OctetsError::OutOfBounds {
                    index: 1,
                    count: expected,
                    len: params_end - 1,
                }))
            } else if params_end - 1 > expected {
                Err(AttDecodeError::TrailingData {
                    opcode,
                    len: params_end - 1 - expected,
                })
            } else {
                Ok(())
            }
        };
        let pdu = match opcode {
            AttOpcode::ErrorRsp => {
                fixed(4)?;
                Self::ErrorRsp {
                    req_opcode: view.u8_at(1).map_err(truncated)?,
                    handle: view.u16_at(2).map_err(truncated)?,
                    error: view.u8_at(4).map_err(truncated)?,
                }
            }
            AttOpcode::ExchangeMtuReq => {
                fixed(2)?;
                Self::ExchangeMtuReq {
                    mtu: view.u16_at(1).map_err(truncated)?,
                }
            }
            AttOpcode::ExchangeMtuRsp => {
                fixed(2)?;
                Self::ExchangeMtuRsp {
                    mtu: view.u16_at(1).map_err(truncated)?,
                }
            }
            AttOpcode::FindInformationReq => {
                fixed(4)?;
                Self::FindInformationReq {
                    start: view.u16_at(1).map_err(truncated)?,
                    end: view.u16_at(3).map_err(truncated)?,
                }
            }
            AttOpcode::FindInformationRsp => Self::FindInformationRsp {
                format: view.u8_at(1).map_err(truncated)?,
                data: rest(2),
            },
            AttOpcode::ReadByTypeReq => {
                let width = params_end
                    .checked_sub(5)
                    .filter(|w| *w == 2 || *w == 16)
                    .ok_or_else(|| {
                        truncated(OctetsError::OutOfBounds {
                            index: 5,
                            count: 2,
                            len: params_end,
                        })
                    })?;
                Self::ReadByTypeReq {
                    start: view.u16_at(1).map_err(truncated)?,
                    end: view.u16_at(3).map_err(truncated)?,
                    attr_type: view.uuid_at(5, width).map_err(truncated)?,
                }
            }
            AttOpcode::ReadByTypeRsp => Self::ReadByTypeRsp {
                element_len: view.u8_at(1).map_err(truncated)?,
                data: rest(2),
            },
            AttOpcode::ReadReq => {
                fixed(2)?;
                Self::ReadReq {
                    handle: view.u16_at(1).map_err(truncated)?,
                }
            }
            AttOpcode::ReadRsp => Self::ReadRsp { value: rest(1) },
            AttOpcode::ReadBlobReq => {
                fixed(4)?;
                Self::ReadBlobReq {
                    handle: view.u16_at(1).map_err(truncated)?,
                    offset: view.u16_at(3).map_err(truncated)?,
                }
            }
            AttOpcode::ReadBlobRsp => Self::ReadBlobRsp { value: rest(1) },
            AttOpcode::ReadByGroupTypeReq => {
                let width = params_end
                    .checked_sub(5)
                    .filter(|w| *w == 2 || *w == 16)
                    .ok_or_else(|| {
                        truncated(OctetsError::OutOfBounds {
                            index: 5,
                            count: 2,
                            len: params_end,
                        })
                    })?;
                Self::ReadByGroupTypeReq {
                    start: view.u16_at(1).map_err(truncated)?,
                    end: view.u16_at(3).map_err(truncated)?,
                    group_type: view.uuid_at(5, width).map_err(truncated)?,
                }
            }
            AttOpcode::ReadByGroupTypeRsp => Self::ReadByGroupTypeRsp {
                element_len: view.u8_at(1).map_err(truncated)?,
                data: rest(2),
            },
            AttOpcode::WriteReq => Self::WriteReq {
                handle: view.u16_at(1).map_err(truncated)?,
                value: rest(3),
            },
            AttOpcode::WriteRsp => {
                fixed(0)?;
                Self::WriteRsp
            }
            AttOpcode::WriteCmd => Self::WriteCmd {
                handle: view.u16_at(1).map_err(truncated)?,
                value: rest(3),
            },
            AttOpcode::SignedWriteCmd => {
                let mut auth_sig = [0u8; AUTH_SIG_LEN];
                auth_sig.copy_from_slice(
                    view.slice_at(params_end, AUTH_SIG_LEN).map_err(truncated)?,
                );
                Self::SignedWriteCmd {
                    handle: view.u16_at(1).map_err(truncated)?,
                    value: rest(3),
                    auth_sig,
                }
            }
            AttOpcode::HandleValueNtf => Self::HandleValueNtf {
                handle: view.u16_at(1).map_err(truncated)?,
                value: rest(3),
            },
            AttOpcode::HandleValueInd => Self::HandleValueInd {
                handle: view.u16_at(1).map_err(truncated)?,
                value: rest(3),
            },
            AttOpcode::HandleValueCfm => {
                fixed(0)?;
                Self::HandleValueCfm
            }
            AttOpcode::FindByTypeValueReq
            | AttOpcode::FindByTypeValueRsp
            | AttOpcode::ReadMultipleReq
            | AttOpcode::ReadMultipleRsp => {
                // Not produced by this client; reject like an unknown method.
                return Err(AttDecodeError::UnknownOpcode(raw));
            }
        };
        Ok(pdu)
    }

    /// Encodes into a single L2CAP datagram.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u8(self.opcode() as u8);
        match self {
            Self::ErrorRsp {
                req_opcode,
                handle,
                error,
            } => {
                buf.put_u8(*req_opcode);
                buf.put_u16_le(*handle);
                buf.put_u8(*error);
            }
            Self::ExchangeMtuReq { mtu } | Self::ExchangeMtuRsp { mtu } => {
                buf.put_u16_le(*mtu);
            }
            Self::FindInformationReq { start, end } => {
                buf.put_u16_le(*start);
                buf.put_u16_le(*end);
            }
            Self::FindInformationRsp { format, data } => {
                buf.put_u8(*format);
                buf.put_slice(data);
            }
            Self::ReadByTypeReq {
                start,
                end,
                attr_type,
            } => {
                buf.put_u16_le(*start);
                buf.put_u16_le(*end);
                put_uuid(&mut buf, *attr_type);
            }
            Self::ReadByGroupTypeReq {
                start,
                end,
                group_type,
            } => {
                buf.put_u16_le(*start);
                buf.put_u16_le(*end);
                put_uuid(&mut buf, *group_type);
            }
            Self::ReadByTypeRsp { element_len, data }
            | Self::ReadByGroupTypeRsp { element_len, data } => {
                buf.put_u8(*element_len);
                buf.put_slice(data);
            }
            Self::ReadReq { handle } => {
                buf.put_u16_le(*handle);
            }
            Self::ReadRsp { value } | Self::ReadBlobRsp { value } => {
                buf.put_slice(value);
            }
            Self::ReadBlobReq { handle, offset } => {
                buf.put_u16_le(*handle);
                buf.put_u16_le(*offset);
            }
            Self::WriteReq { handle, value }
            | Self::WriteCmd { handle, value }
            | Self::HandleValueNtf { handle, value }
            | Self::HandleValueInd { handle, value } => {
                buf.put_u16_le(*handle);
                buf.put_slice(value);
            }
            Self::SignedWriteCmd {
                handle,
                value,
                auth_sig,
            } => {
                buf.put_u16_le(*handle);
                buf.put_slice(value);
                buf.put_slice(auth_sig);
            }
            Self::WriteRsp | Self::HandleValueCfm => {}
        }
        buf.freeze()
    }
}

fn put_uuid(buf: &mut BytesMut, uuid: BtUuid) {
    let mut tmp = [0u8; 16];
    let n = uuid.num_bytes();
    uuid.write_le(&mut tmp[..n]);
    buf.put_slice(&tmp[..n]);
}
