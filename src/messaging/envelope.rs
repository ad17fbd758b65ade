use std::fmt::{Debug, Formatter};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::messaging::error::{MessagingError, MessagingResult};

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);


/// Determines whether a message is tracked for acknowledgement and re-sent until it is
///  acknowledged (`Reliable`), or sent once and forgotten (`Unreliable`).
///
/// Sequence numbers are counted separately per delivery mode.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum DeliveryMode {
    Unreliable = 0,
    Reliable = 1,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum EnvelopeKind {
    Message = 1,
    Ack = 2,
}


/// A payload stamped with its sender-side sequence number. Sequence numbers start at 1 and are
///  strictly increasing per (recipient, delivery mode).
#[derive(Clone, Eq, PartialEq)]
pub struct SequencedMessage {
    pub sequence: u64,
    pub mode: DeliveryMode,
    pub payload: Bytes,
}
impl Debug for SequencedMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}({:?}, {} bytes)", self.sequence, self.mode, self.payload.len())
    }
}

/// Confirms receipt of a single reliable message. Acks are never acknowledged themselves.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Ack {
    pub sequence: u64,
}


/// The outer shape of every datagram this layer sends. The layout is:
///
/// ```ascii
/// 0: envelope kind (u8): 1 = MESSAGE, 2 = ACK
/// 1: CRC-32 (u32) over the envelope kind and everything after the checksum
/// 5: MESSAGE: delivery mode (u8), sequence (u64), payload (rest of the datagram)
///    ACK:     sequence (u64)
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Envelope {
    Message(SequencedMessage),
    Ack(Ack),
}

impl Envelope {
    const CHECKSUM_OFFSET: usize = size_of::<u8>();
    const HEADER_LEN: usize = Self::CHECKSUM_OFFSET + size_of::<u32>();

    /// The number of bytes a MESSAGE envelope adds to its payload
    pub const MESSAGE_OVERHEAD: usize = Self::HEADER_LEN + size_of::<u8>() + size_of::<u64>();

    fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Message(_) => EnvelopeKind::Message,
            Envelope::Ack(_) => EnvelopeKind::Ack,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        let start = buf.len();

        buf.put_u8(self.kind().into());
        buf.put_u32(0); // patched below
        match self {
            Envelope::Message(msg) => {
                buf.put_u8(msg.mode.into());
                buf.put_u64(msg.sequence);
                buf.put_slice(&msg.payload);
            }
            Envelope::Ack(ack) => {
                buf.put_u64(ack.sequence);
            }
        }

        let checksum = Self::checksum(buf[start], &buf[start + Self::HEADER_LEN..]);
        buf[start + Self::CHECKSUM_OFFSET..start + Self::HEADER_LEN].copy_from_slice(&checksum.to_be_bytes());
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    /// Parses a complete datagram. Anything that is not a well-formed MESSAGE or ACK envelope is
    ///  reported as [MessagingError::UnrecognizedEnvelope].
    pub fn try_deser(datagram: &[u8]) -> MessagingResult<Envelope> {
        let mut buf = datagram;

        let raw_kind = buf.try_get_u8()
            .map_err(|_| MessagingError::unrecognized("empty datagram"))?;
        let checksum = buf.try_get_u32()
            .map_err(|e| MessagingError::unrecognized(format!("incomplete envelope header: {}", e)))?;
        if Self::checksum(raw_kind, buf) != checksum {
            return Err(MessagingError::unrecognized("checksum mismatch"));
        }

        let kind = EnvelopeKind::try_from(raw_kind)
            .map_err(|_| MessagingError::unrecognized(format!("unknown envelope kind {}", raw_kind)))?;

        match kind {
            EnvelopeKind::Message => {
                let raw_mode = buf.try_get_u8()
                    .map_err(|e| MessagingError::unrecognized(format!("missing delivery mode: {}", e)))?;
                let mode = DeliveryMode::try_from(raw_mode)
                    .map_err(|_| MessagingError::unrecognized(format!("unknown delivery mode {}", raw_mode)))?;
                let sequence = Self::try_get_sequence(&mut buf)?;

                Ok(Envelope::Message(SequencedMessage {
                    sequence,
                    mode,
                    payload: Bytes::copy_from_slice(buf),
                }))
            }
            EnvelopeKind::Ack => {
                let sequence = Self::try_get_sequence(&mut buf)?;
                if buf.has_remaining() {
                    return Err(MessagingError::unrecognized(format!("{} trailing bytes after ACK", buf.remaining())));
                }
                Ok(Envelope::Ack(Ack { sequence }))
            }
        }
    }

    /// covers the envelope kind and everything after the checksum field
    fn checksum(raw_kind: u8, body: &[u8]) -> u32 {
        let mut digest = CRC.digest();
        digest.update(&[raw_kind]);
        digest.update(body);
        digest.finalize()
    }

    fn try_get_sequence(buf: &mut &[u8]) -> MessagingResult<u64> {
        let sequence = buf.try_get_u64()
            .map_err(|e| MessagingError::unrecognized(format!("incomplete sequence number: {}", e)))?;
        if sequence == 0 {
            return Err(MessagingError::unrecognized("sequence number 0"));
        }
        Ok(sequence)
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn with_checksum(kind: u8, body: &[u8]) -> Vec<u8> {
        let mut result = vec![kind];
        result.extend_from_slice(&Envelope::checksum(kind, body).to_be_bytes());
        result.extend_from_slice(body);
        result
    }

    #[test]
    fn test_ser_message() {
        let envelope = Envelope::Message(SequencedMessage {
            sequence: 0x0102,
            mode: DeliveryMode::Reliable,
            payload: Bytes::from_static(b"abc"),
        });

        let expected = with_checksum(1, b"\x01\0\0\0\0\0\0\x01\x02abc");
        assert_eq!(envelope.to_bytes().as_ref(), expected.as_slice());
    }

    #[test]
    fn test_ser_ack() {
        let envelope = Envelope::Ack(Ack { sequence: 5 });

        let expected = with_checksum(2, b"\0\0\0\0\0\0\0\x05");
        assert_eq!(envelope.to_bytes().as_ref(), expected.as_slice());
    }

    #[test]
    fn test_ser_appends_to_buffer() {
        let mut buf = BytesMut::from(&b"xyz"[..]);
        Envelope::Ack(Ack { sequence: 1 }).ser(&mut buf);

        assert_eq!(&buf[..3], b"xyz");
        assert_eq!(Envelope::try_deser(&buf[3..]).unwrap(), Envelope::Ack(Ack { sequence: 1 }));
    }

    #[rstest]
    #[case::unreliable_empty_payload(with_checksum(1, b"\0\0\0\0\0\0\0\0\x07"), Envelope::Message(SequencedMessage { sequence: 7, mode: DeliveryMode::Unreliable, payload: Bytes::new() }))]
    #[case::reliable_with_payload(with_checksum(1, b"\x01\0\0\0\0\0\0\0\x01hello"), Envelope::Message(SequencedMessage { sequence: 1, mode: DeliveryMode::Reliable, payload: Bytes::from_static(b"hello") }))]
    #[case::ack(with_checksum(2, b"\0\0\0\0\0\0\x01\0"), Envelope::Ack(Ack { sequence: 256 }))]
    fn test_try_deser(#[case] datagram: Vec<u8>, #[case] expected: Envelope) {
        assert_eq!(Envelope::try_deser(&datagram).unwrap(), expected);
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::unknown_kind(with_checksum(9, b"\0\0\0\0\0\0\0\x01"))]
    #[case::no_checksum(vec![2, 0, 0])]
    #[case::wrong_checksum(vec![2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1])]
    #[case::unknown_mode(with_checksum(1, b"\x05\0\0\0\0\0\0\0\x01"))]
    #[case::no_mode(with_checksum(1, b""))]
    #[case::short_sequence(with_checksum(1, b"\x01\0\0\x01"))]
    #[case::zero_sequence(with_checksum(1, b"\x01\0\0\0\0\0\0\0\0abc"))]
    #[case::ack_zero_sequence(with_checksum(2, b"\0\0\0\0\0\0\0\0"))]
    #[case::ack_trailing_bytes(with_checksum(2, b"\0\0\0\0\0\0\0\x01\x01"))]
    fn test_try_deser_unrecognized(#[case] datagram: Vec<u8>) {
        match Envelope::try_deser(&datagram) {
            Err(MessagingError::UnrecognizedEnvelope(msg)) => println!("{}", msg),
            other => panic!("expected UnrecognizedEnvelope, was {:?}", other),
        }
    }

    #[test]
    fn test_corrupted_payload_is_rejected() {
        let mut datagram = Envelope::Message(SequencedMessage {
            sequence: 3,
            mode: DeliveryMode::Reliable,
            payload: Bytes::from_static(b"payload"),
        }).to_bytes().to_vec();

        let last = datagram.len() - 1;
        datagram[last] ^= 0x40;

        assert!(matches!(Envelope::try_deser(&datagram), Err(MessagingError::UnrecognizedEnvelope(_))));
    }

    #[rstest]
    #[case::ack_to_message(Envelope::Ack(Ack { sequence: 0x01_0000_0000_0000 }), 1)]
    #[case::message_to_ack(Envelope::Message(SequencedMessage { sequence: 1, mode: DeliveryMode::Unreliable, payload: Bytes::new() }), 2)]
    #[case::unknown_kind(Envelope::Ack(Ack { sequence: 1 }), 7)]
    fn test_changed_kind_fails_checksum(#[case] envelope: Envelope, #[case] changed_kind: u8) {
        let mut datagram = envelope.to_bytes().to_vec();
        datagram[0] = changed_kind;

        match Envelope::try_deser(&datagram) {
            Err(MessagingError::UnrecognizedEnvelope(msg)) => assert_eq!(msg, "checksum mismatch"),
            other => panic!("expected a checksum mismatch, was {:?}", other),
        }
    }
}
