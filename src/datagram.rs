//! The on-wire representation of everything this protocol exchanges. This module is the only
//!  place that knows about the byte layout (see the crate documentation for the format).

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use crate::safe_converter::{PrecheckedCast, SafeCast};

/// Every datagram starts with this marker, allowing cheap rejection of foreign traffic
pub const PROTOCOL_ID: u32 = 0x5544_4d31;

/// This is the maximum number of payload bytes in a single fragment. It is chosen so that a
///  fragment including its header fits into a UDP datagram on an IPV4 network with full
///  Ethernet frames (1472 bytes) without IP level fragmentation.
pub const MAX_MTU: usize = 1400;

/// protocol id (4) + kind (1) + message id (4) + position (4) + flags (1) + data length
///  (varint, 2 bytes for lengths up to `MAX_MTU`)
pub const MAX_HEADER_LEN: usize = 16;

pub const MAX_DATAGRAM_LEN: usize = MAX_MTU + MAX_HEADER_LEN;

const KIND_DATA_PART: u8 = 0;
const KIND_DATA_RESEND: u8 = 1;
const KIND_DATA_ACK: u8 = 2;

const FLAG_IS_LAST: u8 = 0x01;

/// A single fragment of a message, starting at byte `position` of the message's payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataPart {
    pub message_id: u32,
    pub position: u32,
    pub is_last: bool,
    pub data: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Datagram {
    DataPart(DataPart),
    /// "I am stuck at `position`, please send from there"
    DataResend { message_id: u32, position: u32 },
    /// "I have `position` contiguous bytes" - echoing the full length means the message is done
    DataAck { message_id: u32, position: u32 },
}

impl Datagram {
    pub fn message_id(&self) -> u32 {
        match self {
            Datagram::DataPart(part) => part.message_id,
            Datagram::DataResend { message_id, .. } => *message_id,
            Datagram::DataAck { message_id, .. } => *message_id,
        }
    }

    /// Appends the serialized datagram to `buf`, returning the number of bytes written
    pub fn ser(&self, buf: &mut BytesMut) -> usize {
        let initial_len = buf.len();

        buf.put_u32(PROTOCOL_ID);
        match self {
            Datagram::DataPart(part) => {
                buf.put_u8(KIND_DATA_PART);
                buf.put_u32(part.message_id);
                buf.put_u32(part.position);
                buf.put_u8(if part.is_last { FLAG_IS_LAST } else { 0 });
                buf.put_u32_varint(part.data.len().prechecked_cast());
                buf.put_slice(&part.data);
            }
            Datagram::DataResend { message_id, position } => {
                buf.put_u8(KIND_DATA_RESEND);
                buf.put_u32(*message_id);
                buf.put_u32(*position);
            }
            Datagram::DataAck { message_id, position } => {
                buf.put_u8(KIND_DATA_ACK);
                buf.put_u32(*message_id);
                buf.put_u32(*position);
            }
        }

        buf.len() - initial_len
    }

    /// Parses a complete datagram. Fragment data is split off `buf` without copying.
    pub fn deser(buf: &mut Bytes) -> anyhow::Result<Datagram> {
        let protocol_id = buf.try_get_u32()?;
        if protocol_id != PROTOCOL_ID {
            bail!("foreign protocol id {:#010x}", protocol_id);
        }

        let kind = buf.try_get_u8()?;
        let message_id = buf.try_get_u32()?;
        let position = buf.try_get_u32()?;

        let result = match kind {
            KIND_DATA_PART => {
                let flags = buf.try_get_u8()?;
                if flags & !FLAG_IS_LAST != 0 {
                    bail!("unsupported flags {:#04x}", flags);
                }

                let data_len: usize = buf.try_get_u32_varint()?.safe_cast();
                if data_len > buf.remaining() {
                    bail!("declared data length {} exceeds the remaining {} bytes", data_len, buf.remaining());
                }

                Datagram::DataPart(DataPart {
                    message_id,
                    position,
                    is_last: flags & FLAG_IS_LAST != 0,
                    data: buf.split_to(data_len),
                })
            }
            KIND_DATA_RESEND => Datagram::DataResend { message_id, position },
            KIND_DATA_ACK => Datagram::DataAck { message_id, position },
            other => bail!("unknown datagram kind {}", other),
        };

        if buf.has_remaining() {
            bail!("{} trailing bytes after datagram", buf.remaining());
        }
        Ok(result)
    }
}
