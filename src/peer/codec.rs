//! The BitTorrent peer wire protocol (`spec.md` §4.1): the handshake frame
//! and the length-prefixed post-handshake message stream.
//!
//! Mirrors the teacher's two-codec split (`HandshakeCodec` / `PeerCodec`)
//! swapped out via `Framed::into_parts`/`from_parts` so the already-read
//! buffer contents survive the switch (see `peer.rs`).

use std::convert::TryInto;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::*, BlockInfo, PeerId, Sha1Hash};

/// The hard cap on a single post-handshake frame, per `spec.md` §4.1's
/// "Non-goals" (no stream-level compression/encryption) combined with its
/// block-length cap: a `piece` message can be at most a few hundred KiB
/// larger than the maximum block length, so anything past this is either
/// malicious or a different protocol entirely.
const MAX_FRAME_LEN: usize = 2 * 1024 * 1024;

/// The maximum length of a single requested or delivered block, per
/// `spec.md` §4.1 ("Invariants").
pub(crate) const MAX_BLOCK_LEN: u32 = 131_072;

pub(crate) const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// The fixed-format handshake message exchanged before any other traffic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub prot: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        let mut prot = [0; 19];
        prot.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self { prot, reserved: [0; 8], info_hash, peer_id }
    }
}

/// Length-prefix-free codec for the single handshake frame (`spec.md`
/// §4.1): 1 + 19 + 8 + 20 + 20 = 68 bytes, always.
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> Result<()> {
        let Handshake { prot, reserved, info_hash, peer_id } = handshake;
        buf.reserve(1 + prot.len() + reserved.len() + info_hash.len() + peer_id.len());
        buf.put_u8(prot.len() as u8);
        buf.put(&prot[..]);
        buf.put(&reserved[..]);
        buf.put(&info_hash[..]);
        buf.put(&peer_id[..]);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        let prot_len = buf[0] as usize;
        if prot_len != PROTOCOL_STRING.len() {
            return Err(Error::Protocol(format!(
                "unexpected protocol string length {}",
                prot_len
            )));
        }

        let frame_len = 1 + prot_len + 8 + 20 + 20;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(1);
        let mut prot = [0; 19];
        buf.copy_to_slice(&mut prot);
        if prot != PROTOCOL_STRING.as_bytes() {
            return Err(Error::Protocol(
                "unexpected protocol string".into(),
            ));
        }

        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake { prot, reserved, info_hash, peer_id }))
    }
}

/// The message ids of the post-handshake wire protocol (`spec.md` §4.1).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
}

impl std::convert::TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Have),
            5 => Ok(Self::Bitfield),
            6 => Ok(Self::Request),
            7 => Ok(Self::Block),
            8 => Ok(Self::Cancel),
            _ => Err(Error::Protocol(format!("unknown message id {}", value))),
        }
    }
}

/// A post-handshake peer protocol message.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Message {
    /// Sent periodically as the only message with no id and no body, to keep
    /// the TCP connection from being dropped for inactivity.
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: crate::PieceIndex },
    Bitfield(crate::Bitfield),
    Request(BlockInfo),
    Block { piece_index: crate::PieceIndex, offset: u32, data: Vec<u8> },
    Cancel(BlockInfo),
}

impl Message {
    /// Returns the message's id, or `None` for `KeepAlive`, which has none.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have { .. } => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request(_) => Some(MessageId::Request),
            Self::Block { .. } => Some(MessageId::Block),
            Self::Cancel(_) => Some(MessageId::Cancel),
        }
    }
}

/// Length-prefixed codec for the post-handshake message stream
/// (`spec.md` §4.1): a 4-byte big-endian length prefix (excluding itself),
/// followed by a 1-byte id and a variable-length body, except for the
/// zero-length keep-alive.
pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                buf.reserve(4);
                buf.put_u32(0);
            }
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {
                buf.reserve(5);
                buf.put_u32(1);
                buf.put_u8(msg.id().unwrap() as u8);
            }
            Message::Have { piece_index } => {
                buf.reserve(9);
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index as u32);
            }
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                buf.reserve(5 + bytes.len());
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put(&bytes[..]);
            }
            Message::Request(block) | Message::Cancel(block) => {
                let id = if matches!(msg, Message::Request(_)) {
                    MessageId::Request
                } else {
                    MessageId::Cancel
                };
                buf.reserve(17);
                buf.put_u32(13);
                buf.put_u8(id as u8);
                buf.put_u32(block.piece_index as u32);
                buf.put_u32(block.offset);
                buf.put_u32(block.len);
            }
            Message::Block { piece_index, offset, data } => {
                buf.reserve(13 + data.len());
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Block as u8);
                buf.put_u32(piece_index as u32);
                buf.put_u32(offset);
                buf.put(&data[..]);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        loop {
            if buf.len() < 4 {
                return Ok(None);
            }
            let msg_len = u32::from_be_bytes(buf[0..4].try_into().unwrap());
            if msg_len as usize > MAX_FRAME_LEN {
                return Err(Error::CapacityExceeded);
            }
            if msg_len == 0 {
                buf.advance(4);
                return Ok(Some(Message::KeepAlive));
            }

            let frame_len = 4 + msg_len as usize;
            if buf.len() < frame_len {
                buf.reserve(frame_len - buf.len());
                return Ok(None);
            }

            buf.advance(4);
            let id: MessageId = buf[0].try_into()?;
            buf.advance(1);
            let body_len = msg_len as usize - 1;

            let msg = match id {
                MessageId::Choke => Message::Choke,
                MessageId::Unchoke => Message::Unchoke,
                MessageId::Interested => Message::Interested,
                MessageId::NotInterested => Message::NotInterested,
                MessageId::Have => {
                    expect_len(body_len, 4)?;
                    let piece_index = buf.get_u32() as crate::PieceIndex;
                    Message::Have { piece_index }
                }
                MessageId::Bitfield => {
                    let mut bytes = vec![0u8; body_len];
                    buf.copy_to_slice(&mut bytes);
                    Message::Bitfield(crate::Bitfield::from_vec(bytes))
                }
                MessageId::Request | MessageId::Cancel => {
                    expect_len(body_len, 12)?;
                    let piece_index = buf.get_u32() as crate::PieceIndex;
                    let offset = buf.get_u32();
                    let len = buf.get_u32();
                    if len > MAX_BLOCK_LEN {
                        return Err(Error::CapacityExceeded);
                    }
                    let block = BlockInfo { piece_index, offset, len };
                    if id == MessageId::Request {
                        Message::Request(block)
                    } else {
                        Message::Cancel(block)
                    }
                }
                MessageId::Block => {
                    if body_len < 8 {
                        return Err(Error::Protocol(
                            "piece message shorter than header".into(),
                        ));
                    }
                    let piece_index = buf.get_u32() as crate::PieceIndex;
                    let offset = buf.get_u32();
                    let data_len = body_len - 8;
                    if data_len as u32 > MAX_BLOCK_LEN {
                        return Err(Error::CapacityExceeded);
                    }
                    let mut data = vec![0u8; data_len];
                    buf.copy_to_slice(&mut data);
                    Message::Block { piece_index, offset, data }
                }
            };

            return Ok(Some(msg));
        }
    }
}

fn expect_len(actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        Err(Error::Protocol(format!(
            "expected body length {}, got {}",
            expected, actual
        )))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_roundtrips() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(handshake.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), 68);
        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn handshake_rejects_wrong_protocol_string() {
        let mut buf = BytesMut::new();
        buf.put_u8(4);
        buf.put(&b"fake"[..]);
        buf.put(&[0u8; 8][..]);
        buf.put(&[0u8; 20][..]);
        buf.put(&[0u8; 20][..]);
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn keep_alive_roundtrips() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 0]);
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::KeepAlive);
    }

    #[test]
    fn choke_roundtrips() {
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Choke, &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Choke);
    }

    #[test]
    fn request_roundtrips() {
        let block = BlockInfo { piece_index: 3, offset: 16384, len: 16384 };
        let mut buf = BytesMut::new();
        PeerCodec.encode(Message::Request(block), &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Request(block));
    }

    #[test]
    fn block_roundtrips() {
        let data = vec![42u8; 1024];
        let msg = Message::Block { piece_index: 1, offset: 0, data: data.clone() };
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn bitfield_roundtrips() {
        let bitfield = crate::Bitfield::from_vec(vec![0b1010_0000]);
        let msg = Message::Bitfield(bitfield.clone());
        let mut buf = BytesMut::new();
        PeerCodec.encode(msg, &mut buf).unwrap();
        let decoded = PeerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Bitfield(bitfield));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_LEN + 1) as u32);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn request_with_oversized_block_len_is_rejected() {
        let block = BlockInfo { piece_index: 0, offset: 0, len: MAX_BLOCK_LEN + 1 };
        let mut buf = BytesMut::new();
        buf.put_u32(13);
        buf.put_u8(MessageId::Request as u8);
        buf.put_u32(block.piece_index as u32);
        buf.put_u32(block.offset);
        buf.put_u32(block.len);
        assert!(PeerCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn incomplete_frame_returns_none() {
        let mut buf = BytesMut::new();
        buf.put_u32(5);
        buf.put_u8(MessageId::Have as u8);
        // missing the 4-byte piece index
        assert_eq!(PeerCodec.decode(&mut buf).unwrap(), None);
    }
}
