//! Source RCON packet framing.
//!
//! Every packet is a little-endian i32 length followed by that many bytes:
//! request id, packet type, the payload, and two NUL terminators. The length
//! field does not count itself, so the smallest valid value is ten.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// SERVERDATA_EXECCOMMAND; also the type of the server's auth response.
pub const TYPE_COMMAND: i32 = 2;
/// SERVERDATA_AUTH
pub const TYPE_AUTH: i32 = 3;
/// Request id the server substitutes when authentication fails.
pub const AUTH_FAILED_ID: i32 = -1;

/// Bytes past the length field with an empty payload: id, type, two NULs.
const FRAME_OVERHEAD: usize = 10;
/// Sanity cap well above anything a Minecraft server sends.
const MAX_FRAME: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum RconError {
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: i32,
    pub ptype: i32,
    pub payload: String,
}

impl Packet {
    pub fn auth(id: i32, password: &str) -> Self {
        Self {
            id,
            ptype: TYPE_AUTH,
            payload: password.to_string(),
        }
    }

    pub fn command(id: i32, command: &str) -> Self {
        Self {
            id,
            ptype: TYPE_COMMAND,
            payload: command.to_string(),
        }
    }
}

/// Length-delimited codec for RCON frames.
#[derive(Debug, Default)]
pub struct RconCodec;

impl Encoder<Packet> for RconCodec {
    type Error = RconError;

    fn encode(&mut self, pkt: Packet, dst: &mut BytesMut) -> Result<(), RconError> {
        let len = pkt.payload.len() + FRAME_OVERHEAD;
        dst.reserve(4 + len);
        dst.put_i32_le(len as i32);
        dst.put_i32_le(pkt.id);
        dst.put_i32_le(pkt.ptype);
        dst.put_slice(pkt.payload.as_bytes());
        dst.put_slice(&[0, 0]);
        Ok(())
    }
}

impl Decoder for RconCodec {
    type Item = Packet;
    type Error = RconError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, RconError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let declared = i32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        if declared < FRAME_OVERHEAD as i32 || declared as usize > MAX_FRAME {
            // Consume the length field so a later frame has a chance to
            // line up again.
            src.advance(4);
            return Err(RconError::MalformedPacket(format!(
                "declared length {declared}"
            )));
        }
        let declared = declared as usize;
        if src.len() < 4 + declared {
            return Ok(None);
        }

        src.advance(4);
        let mut frame = src.split_to(declared);
        let id = frame.get_i32_le();
        let ptype = frame.get_i32_le();
        let body = &frame[..frame.len() - 2];
        Ok(Some(Packet {
            id,
            ptype,
            payload: String::from_utf8_lossy(body).into_owned(),
        }))
    }
}
