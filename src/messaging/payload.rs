use anyhow::anyhow;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use uuid::Uuid;

use crate::messaging::message_module::MessageModuleId;

/// Correlates a request with its response. Random UUIDs rather than a counter, so that a late
///  response from before a restart can not be mistaken for the response to a new request.
pub type RequestId = Uuid;

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
enum PayloadKind {
    Plain = 1,
    Request = 2,
    Response = 3,
}

/// The application level content of a sequenced message. The channel dispatches on the shape:
///  plain messages and requests go to the handler registered for their module id, responses go
///  to the request correlator.
///
/// ```ascii
/// 0: payload kind (u8): 1 = PLAIN, 2 = REQUEST, 3 = RESPONSE
/// PLAIN:    module id (u64), module specific data (rest)
/// REQUEST:  request id (u128), module id (u64), module specific data (rest)
/// RESPONSE: request id (u128), response data (rest)
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Payload {
    Plain {
        module_id: MessageModuleId,
        buf: Bytes,
    },
    Request {
        request_id: RequestId,
        module_id: MessageModuleId,
        buf: Bytes,
    },
    Response {
        request_id: RequestId,
        buf: Bytes,
    },
}

impl Payload {
    fn kind(&self) -> PayloadKind {
        match self {
            Payload::Plain { .. } => PayloadKind::Plain,
            Payload::Request { .. } => PayloadKind::Request,
            Payload::Response { .. } => PayloadKind::Response,
        }
    }

    pub fn ser(&self, out: &mut BytesMut) {
        out.put_u8(self.kind().into());
        match self {
            Payload::Plain { module_id, buf } => {
                out.put_u64(module_id.0);
                out.put_slice(buf);
            }
            Payload::Request { request_id, module_id, buf } => {
                out.put_u128(request_id.as_u128());
                out.put_u64(module_id.0);
                out.put_slice(buf);
            }
            Payload::Response { request_id, buf } => {
                out.put_u128(request_id.as_u128());
                out.put_slice(buf);
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn try_deser(mut buf: &[u8]) -> anyhow::Result<Payload> {
        let raw_kind = buf.try_get_u8()?;
        let kind = PayloadKind::try_from(raw_kind)
            .map_err(|_| anyhow!("invalid payload kind {}", raw_kind))?;

        let payload = match kind {
            PayloadKind::Plain => {
                let module_id = MessageModuleId(buf.try_get_u64()?);
                Payload::Plain { module_id, buf: Bytes::copy_from_slice(buf) }
            }
            PayloadKind::Request => {
                let request_id = Uuid::from_u128(buf.try_get_u128()?);
                let module_id = MessageModuleId(buf.try_get_u64()?);
                Payload::Request { request_id, module_id, buf: Bytes::copy_from_slice(buf) }
            }
            PayloadKind::Response => {
                let request_id = Uuid::from_u128(buf.try_get_u128()?);
                Payload::Response { request_id, buf: Bytes::copy_from_slice(buf) }
            }
        };
        Ok(payload)
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const MODULE: MessageModuleId = MessageModuleId::new(b"TestModl");

    #[rstest]
    #[case::plain(Payload::Plain { module_id: MODULE, buf: Bytes::from_static(b"xy") },
        b"\x01TestModlxy".to_vec())]
    #[case::request(Payload::Request { request_id: Uuid::from_u128(0x0102), module_id: MODULE, buf: Bytes::new() },
        [&[2u8][..], &[0; 14], &[1, 2], b"TestModl"].concat())]
    #[case::response(Payload::Response { request_id: Uuid::from_u128(3), buf: Bytes::from_static(b"\x2a") },
        [&[3u8][..], &[0; 15], &[3], &[42]].concat())]
    fn test_ser(#[case] payload: Payload, #[case] expected: Vec<u8>) {
        assert_eq!(payload.to_bytes().as_ref(), expected.as_slice());
        assert_eq!(Payload::try_deser(&expected).unwrap(), payload);
    }

    #[rstest]
    #[case::empty(b"")]
    #[case::unknown_kind(b"\x09TestModl")]
    #[case::short_module_id(b"\x01Test")]
    #[case::short_request_id(b"\x02\0\0\0\0")]
    #[case::short_response_id(b"\x03\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0")]
    fn test_try_deser_invalid(#[case] buf: &[u8]) {
        assert!(Payload::try_deser(buf).is_err());
    }
}
