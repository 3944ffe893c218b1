//! Framed packet encoding and decoding.
//!
//! [`FramedPktBuf`] is the server's reusable, in-place view over one datagram:
//! header fields are read and rewritten directly in the buffer so a received
//! packet can be repurposed for a reply or for each relayed copy without
//! allocating. [`FramedPacket`] is the owned form used by clients and tests.

use crate::command::ServerCmdType;
use crate::error::{CommandError, FrameError};
use crate::ids::PeerId;
use crate::{HEADER_SIZE, MAX_MESSAGE_SIZE};
use rtdt_crypto::CryptoError;
use rtdt_crypto::aead::AeadKey;

const TARGET_OFFSET: usize = 0;
const SOURCE_OFFSET: usize = 4;
const SEQUENCE_OFFSET: usize = 8;

/// Reusable datagram buffer sized to the maximum message.
pub struct FramedPktBuf {
    buf: Box<[u8]>,
    len: usize,
}

impl FramedPktBuf {
    /// Allocate an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; MAX_MESSAGE_SIZE].into_boxed_slice(),
            len: 0,
        }
    }

    /// Number of valid bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if nothing was loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns `true` if the buffer holds at least a full header.
    #[must_use]
    pub fn has_valid_size(&self) -> bool {
        self.len >= HEADER_SIZE
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.buf[offset..offset + 4]);
        u32::from_be_bytes(b)
    }

    fn write_u32(&mut self, offset: usize, v: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&v.to_be_bytes());
    }

    /// Target peer.
    #[must_use]
    pub fn target(&self) -> PeerId {
        PeerId(self.read_u32(TARGET_OFFSET))
    }

    /// Source peer.
    #[must_use]
    pub fn source(&self) -> PeerId {
        PeerId(self.read_u32(SOURCE_OFFSET))
    }

    /// Sequence number.
    #[must_use]
    pub fn sequence(&self) -> u32 {
        self.read_u32(SEQUENCE_OFFSET)
    }

    /// Overwrite the target.
    pub fn set_target(&mut self, target: PeerId) {
        self.write_u32(TARGET_OFFSET, target.0);
    }

    /// Overwrite the source.
    pub fn set_source(&mut self, source: PeerId) {
        self.write_u32(SOURCE_OFFSET, source.0);
    }

    /// Overwrite the sequence number.
    pub fn set_sequence(&mut self, seq: u32) {
        self.write_u32(SEQUENCE_OFFSET, seq);
    }

    /// Rewrite the header as a server-originated packet for `target`.
    pub fn set_reply_header(&mut self, target: PeerId, seq: u32) {
        self.set_target(target);
        self.set_source(PeerId::SERVER);
        self.set_sequence(seq);
    }

    /// Bytes after the header.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        if self.len < HEADER_SIZE {
            return &[];
        }
        &self.buf[HEADER_SIZE..self.len]
    }

    /// Command tag and payload of an internal server command.
    ///
    /// # Errors
    ///
    /// Returns `CommandError::Empty` if there is no data, or
    /// `CommandError::UnknownType` for an unrecognized tag.
    pub fn server_cmd(&self) -> Result<(ServerCmdType, &[u8]), CommandError> {
        let data = self.data();
        let (&tag, payload) = data.split_first().ok_or(CommandError::Empty)?;
        Ok((ServerCmdType::try_from(tag)?, payload))
    }

    /// Replace the data with `cmd` followed by `payload`, keeping the header.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::TooLarge` if the result exceeds the maximum
    /// message size.
    pub fn set_cmd_payload(&mut self, cmd: ServerCmdType, payload: &[u8]) -> Result<(), FrameError> {
        let total = HEADER_SIZE + 1 + payload.len();
        if total > self.buf.len() {
            return Err(FrameError::TooLarge {
                max: self.buf.len(),
                actual: total,
            });
        }

        self.buf[HEADER_SIZE] = cmd as u8;
        self.buf[HEADER_SIZE + 1..total].copy_from_slice(payload);
        self.len = total;
        Ok(())
    }

    /// Replace only the command tag, keeping the current payload.
    pub fn set_cmd_type(&mut self, cmd: ServerCmdType) {
        self.buf[HEADER_SIZE] = cmd as u8;
        self.len = self.len.max(HEADER_SIZE + 1);
    }

    /// Load an unencrypted datagram.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::TooLarge` if `data` exceeds the buffer.
    pub fn set_full_data(&mut self, data: &[u8]) -> Result<(), FrameError> {
        if data.len() > self.buf.len() {
            return Err(FrameError::TooLarge {
                max: self.buf.len(),
                actual: data.len(),
            });
        }
        self.buf[..data.len()].copy_from_slice(data);
        self.len = data.len();
        Ok(())
    }

    /// Open a `nonce || ciphertext || tag` datagram into this buffer.
    ///
    /// On failure the previous contents are no longer meaningful.
    ///
    /// # Errors
    ///
    /// Returns the underlying `CryptoError` if the datagram is too short or
    /// fails authentication.
    pub fn decrypt_from(&mut self, sealed: &[u8], key: &AeadKey) -> Result<(), CryptoError> {
        self.len = 0;
        let n = key.open_into(sealed, &[], &mut self.buf)?;
        self.len = n;
        Ok(())
    }

    /// The valid bytes, ready to be written (or sealed) to the network.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Copy into an owned packet.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::TooShort` if no full header is loaded.
    pub fn to_packet(&self) -> Result<FramedPacket, FrameError> {
        FramedPacket::decode(self.as_bytes())
    }
}

impl Default for FramedPktBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FramedPktBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedPktBuf")
            .field("len", &self.len)
            .field("target", &self.target())
            .field("source", &self.source())
            .field("sequence", &self.sequence())
            .finish()
    }
}

/// Owned framed packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FramedPacket {
    /// Destination peer, or [`PeerId::SERVER`].
    pub target: PeerId,
    /// Originating peer, or [`PeerId::SERVER`].
    pub source: PeerId,
    /// Per-destination sequence number.
    pub sequence: u32,
    /// Payload.
    pub data: Vec<u8>,
}

impl FramedPacket {
    /// Parse from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::TooShort` if `raw` is shorter than the header.
    pub fn decode(raw: &[u8]) -> Result<Self, FrameError> {
        if raw.len() < HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: HEADER_SIZE,
                actual: raw.len(),
            });
        }

        let target = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let source = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let sequence = u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]);

        Ok(Self {
            target: PeerId(target),
            source: PeerId(source),
            sequence,
            data: raw[HEADER_SIZE..].to_vec(),
        })
    }

    /// Append the wire encoding to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.reserve(HEADER_SIZE + self.data.len());
        out.extend_from_slice(&self.target.0.to_be_bytes());
        out.extend_from_slice(&self.source.0.to_be_bytes());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.data);
    }

    /// Wire encoding.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.data.len());
        self.encode_into(&mut out);
        out
    }

    /// Command tag and payload, for packets exchanged with the server.
    ///
    /// # Errors
    ///
    /// See [`FramedPktBuf::server_cmd`].
    pub fn server_cmd(&self) -> Result<(ServerCmdType, &[u8]), CommandError> {
        let (&tag, payload) = self.data.split_first().ok_or(CommandError::Empty)?;
        Ok((ServerCmdType::try_from(tag)?, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_header_accessors() {
        let mut buf = FramedPktBuf::new();
        buf.set_full_data(&[0, 0, 0, 7, 0, 0, 0, 7, 0, 0, 1, 0, 0xaa, 0xbb])
            .unwrap();

        assert!(buf.has_valid_size());
        assert_eq!(buf.target(), PeerId(7));
        assert_eq!(buf.source(), PeerId(7));
        assert_eq!(buf.sequence(), 256);
        assert_eq!(buf.data(), &[0xaa, 0xbb]);
    }

    #[test]
    fn test_short_buffer_invalid() {
        let mut buf = FramedPktBuf::new();
        buf.set_full_data(&[1, 2, 3]).unwrap();
        assert!(!buf.has_valid_size());
        assert!(buf.data().is_empty());
        assert!(matches!(
            buf.to_packet(),
            Err(FrameError::TooShort {
                expected: 12,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_rewrite_in_place() {
        let pkt = FramedPacket {
            target: PeerId(5),
            source: PeerId(5),
            sequence: 9,
            data: b"frame".to_vec(),
        };
        let mut buf = FramedPktBuf::new();
        buf.set_full_data(&pkt.encode()).unwrap();

        buf.set_target(PeerId(6));
        buf.set_sequence(42);

        let out = FramedPacket::decode(buf.as_bytes()).unwrap();
        assert_eq!(out.target, PeerId(6));
        assert_eq!(out.source, PeerId(5));
        assert_eq!(out.sequence, 42);
        assert_eq!(out.data, b"frame");
    }

    #[test]
    fn test_cmd_payload() {
        let mut buf = FramedPktBuf::new();
        buf.set_full_data(&[0u8; 40]).unwrap();
        buf.set_reply_header(PeerId(3), 11);
        buf.set_cmd_payload(ServerCmdType::Pong, b"abc").unwrap();

        assert_eq!(buf.len(), HEADER_SIZE + 4);
        let (cmd, payload) = buf.server_cmd().unwrap();
        assert_eq!(cmd, ServerCmdType::Pong);
        assert_eq!(payload, b"abc");
        assert_eq!(buf.source(), PeerId::SERVER);
    }

    #[test]
    fn test_set_cmd_type_keeps_payload() {
        let ping = FramedPacket {
            target: PeerId::SERVER,
            source: PeerId(1),
            sequence: 1,
            data: vec![ServerCmdType::Ping as u8, 1, 2, 3],
        };
        let mut buf = FramedPktBuf::new();
        buf.set_full_data(&ping.encode()).unwrap();
        buf.set_cmd_type(ServerCmdType::Pong);

        let (cmd, payload) = buf.server_cmd().unwrap();
        assert_eq!(cmd, ServerCmdType::Pong);
        assert_eq!(payload, &[1, 2, 3]);
    }

    #[test]
    fn test_server_cmd_errors() {
        let mut buf = FramedPktBuf::new();
        buf.set_full_data(&[0u8; HEADER_SIZE]).unwrap();
        assert!(matches!(buf.server_cmd(), Err(CommandError::Empty)));

        buf.set_full_data(&[0u8; HEADER_SIZE + 1]).unwrap();
        assert!(matches!(buf.server_cmd(), Err(CommandError::UnknownType(0))));
    }

    #[test]
    fn test_decrypt_from() {
        let key = AeadKey::generate(&mut OsRng);
        let pkt = FramedPacket {
            target: PeerId(2),
            source: PeerId(2),
            sequence: 1,
            data: vec![9; 100],
        };
        let sealed = key.seal(&pkt.encode(), &[]).unwrap();

        let mut buf = FramedPktBuf::new();
        buf.decrypt_from(&sealed, &key).unwrap();
        assert_eq!(buf.to_packet().unwrap(), pkt);

        let other = AeadKey::generate(&mut OsRng);
        assert!(buf.decrypt_from(&sealed, &other).is_err());
        assert!(buf.is_empty());
    }

    proptest! {
        #[test]
        fn prop_header_fields(target in any::<u32>(), source in any::<u32>(), seq in any::<u32>(),
                              data in prop::collection::vec(any::<u8>(), 0..256)) {
            let pkt = FramedPacket { target: PeerId(target), source: PeerId(source), sequence: seq, data };
            let mut buf = FramedPktBuf::new();
            buf.set_full_data(&pkt.encode()).unwrap();

            prop_assert_eq!(buf.target(), pkt.target);
            prop_assert_eq!(buf.source(), pkt.source);
            prop_assert_eq!(buf.sequence(), pkt.sequence);
            prop_assert_eq!(buf.data(), pkt.data.as_slice());
        }
    }
}
