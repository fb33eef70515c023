//! Topic/service wire frames: prefix byte, request id, and the
//! string/sequence/map framing layered on top of `varint`.
//!
//! Each payload item (topic arg, kwarg value, request/response payload) is
//! carried as an already-codec-encoded opaque byte blob — the payload codec
//! itself lives in `payload.rs` and is applied by the caller before a value
//! reaches this layer. An empty args/kwargs sequence costs nothing beyond
//! its zero count byte: no codec call happens for a sequence with no
//! elements, grounded on `original_source/src/easymesh/objectio.py`'s
//! zero-length fast path for absent data.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::mesh::codec::varint::{decode_varint, encode_varint, DEFAULT_MAX_HEADER_LEN};
use crate::mesh::error::{Error, Result};
use crate::mesh::specs::RequestId;

pub const TOPIC_PREFIX: u8 = b't';
pub const SERVICE_REQUEST_PREFIX: u8 = b's';
pub const REQUEST_ID_WIDTH: usize = 2; // RequestId is u16

pub const STATUS_OK: u8 = 0x00;
pub const STATUS_ERROR: u8 = 0xEE;

fn encode_string(s: &str, out: &mut Vec<u8>) -> Result<()> {
    encode_varint(s.len() as u64, DEFAULT_MAX_HEADER_LEN, out)?;
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn decode_string(buf: &[u8]) -> Result<(String, &[u8])> {
    let (len, rest) = decode_varint(buf)?;
    let len = len as usize;
    if rest.len() < len {
        return Err(Error::protocol("truncated string payload"));
    }
    let s = std::str::from_utf8(&rest[..len])
        .map_err(|e| Error::wrapped(crate::mesh::error::ErrorKind::Protocol, "invalid utf-8 string", e))?
        .to_string();
    Ok((s, &rest[len..]))
}

fn encode_blob(b: &[u8], out: &mut Vec<u8>) -> Result<()> {
    encode_varint(b.len() as u64, DEFAULT_MAX_HEADER_LEN, out)?;
    out.extend_from_slice(b);
    Ok(())
}

fn decode_blob(buf: &[u8]) -> Result<(Vec<u8>, &[u8])> {
    let (len, rest) = decode_varint(buf)?;
    let len = len as usize;
    if rest.len() < len {
        return Err(Error::protocol("truncated blob payload"));
    }
    Ok((rest[..len].to_vec(), &rest[len..]))
}

fn encode_args(args: &[Vec<u8>], out: &mut Vec<u8>) -> Result<()> {
    encode_varint(args.len() as u64, DEFAULT_MAX_HEADER_LEN, out)?;
    for arg in args {
        encode_blob(arg, out)?;
    }
    Ok(())
}

fn decode_args(buf: &[u8]) -> Result<(Vec<Vec<u8>>, &[u8])> {
    let (count, mut rest) = decode_varint(buf)?;
    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (item, next) = decode_blob(rest)?;
        args.push(item);
        rest = next;
    }
    Ok((args, rest))
}

fn encode_kwargs(kwargs: &[(String, Vec<u8>)], out: &mut Vec<u8>) -> Result<()> {
    encode_varint(kwargs.len() as u64, DEFAULT_MAX_HEADER_LEN, out)?;
    for (k, v) in kwargs {
        encode_string(k, out)?;
        encode_blob(v, out)?;
    }
    Ok(())
}

fn decode_kwargs(buf: &[u8]) -> Result<(Vec<(String, Vec<u8>)>, &[u8])> {
    let (count, mut rest) = decode_varint(buf)?;
    let mut kwargs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (k, next) = decode_string(rest)?;
        let (v, next) = decode_blob(next)?;
        kwargs.push((k, v));
        rest = next;
    }
    Ok((kwargs, rest))
}

/// On-wire topic message: raw encoded args/kwargs, ready to write after the
/// `'t'` prefix byte.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WireTopicFrame {
    pub topic: String,
    pub args: Vec<Vec<u8>>,
    pub kwargs: Vec<(String, Vec<u8>)>,
}

impl WireTopicFrame {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = vec![TOPIC_PREFIX];
        encode_string(&self.topic, &mut out)?;
        encode_args(&self.args, &mut out)?;
        encode_kwargs(&self.kwargs, &mut out)?;
        Ok(out)
    }

    /// Decode the body *after* the prefix byte has already been consumed by
    /// the caller's dispatch switch.
    pub fn decode_body(buf: &[u8]) -> Result<Self> {
        let (topic, rest) = decode_string(buf)?;
        let (args, rest) = decode_args(rest)?;
        let (kwargs, rest) = decode_kwargs(rest)?;
        if !rest.is_empty() {
            return Err(Error::protocol("trailing bytes after topic frame"));
        }
        Ok(WireTopicFrame { topic, args, kwargs })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WireServiceRequestFrame {
    pub id: RequestId,
    pub service: String,
    pub args: Vec<Vec<u8>>,
    pub kwargs: Vec<(String, Vec<u8>)>,
}

impl WireServiceRequestFrame {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = vec![SERVICE_REQUEST_PREFIX];
        crate::mesh::codec::varint::encode_fixed(self.id as u64, REQUEST_ID_WIDTH, &mut out)?;
        encode_string(&self.service, &mut out)?;
        encode_args(&self.args, &mut out)?;
        encode_kwargs(&self.kwargs, &mut out)?;
        Ok(out)
    }

    pub fn decode_body(buf: &[u8]) -> Result<Self> {
        let (id, rest) = crate::mesh::codec::varint::decode_fixed(buf, REQUEST_ID_WIDTH)?;
        let (service, rest) = decode_string(rest)?;
        let (args, rest) = decode_args(rest)?;
        let (kwargs, rest) = decode_kwargs(rest)?;
        if !rest.is_empty() {
            return Err(Error::protocol("trailing bytes after service request frame"));
        }
        Ok(WireServiceRequestFrame {
            id: id as RequestId,
            service,
            args,
            kwargs,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WireServiceStatus {
    Ok(Vec<u8>),
    Error(String),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WireServiceResponseFrame {
    pub id: RequestId,
    pub status: WireServiceStatus,
}

impl WireServiceResponseFrame {
    /// No prefix byte — responses are only ever read on a connection the
    /// reader already knows is a response channel (spec.md §4.1: "identity
    /// inferred by direction on a symmetric stream after handshake").
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        crate::mesh::codec::varint::encode_fixed(self.id as u64, REQUEST_ID_WIDTH, &mut out)?;
        match &self.status {
            WireServiceStatus::Ok(payload) => {
                out.push(STATUS_OK);
                encode_blob(payload, &mut out)?;
            }
            WireServiceStatus::Error(message) => {
                out.push(STATUS_ERROR);
                encode_string(message, &mut out)?;
            }
        }
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (id, rest) = crate::mesh::codec::varint::decode_fixed(buf, REQUEST_ID_WIDTH)?;
        let (&status_byte, rest) = rest
            .split_first()
            .ok_or_else(|| Error::protocol("truncated service response status byte"))?;
        let (status, rest) = match status_byte {
            STATUS_OK => {
                let (payload, rest) = decode_blob(rest)?;
                (WireServiceStatus::Ok(payload), rest)
            }
            STATUS_ERROR => {
                let (message, rest) = decode_string(rest)?;
                (WireServiceStatus::Error(message), rest)
            }
            other => {
                return Err(Error::protocol(format!(
                    "unknown service response status byte {:#x}",
                    other
                )))
            }
        };
        if !rest.is_empty() {
            return Err(Error::protocol("trailing bytes after service response frame"));
        }
        Ok(WireServiceResponseFrame { id: id as RequestId, status })
    }
}

/// Inbound dispatch on a peer-to-peer stream: read the prefix byte and
/// route to the right frame decoder. Any byte other than `'t'`/`'s'` is a
/// protocol violation (spec.md §4.1) and the caller must close the stream.
pub enum InboundFrame {
    Topic(WireTopicFrame),
    ServiceRequest(WireServiceRequestFrame),
}

pub fn decode_inbound(buf: &[u8]) -> Result<InboundFrame> {
    let (&prefix, body) = buf
        .split_first()
        .ok_or_else(|| Error::protocol("empty frame"))?;
    match prefix {
        TOPIC_PREFIX => Ok(InboundFrame::Topic(WireTopicFrame::decode_body(body)?)),
        SERVICE_REQUEST_PREFIX => Ok(InboundFrame::ServiceRequest(
            WireServiceRequestFrame::decode_body(body)?,
        )),
        other => Err(Error::protocol(format!(
            "unknown frame prefix byte {:#x}",
            other
        ))),
    }
}

async fn read_varint_async<R: AsyncRead + Unpin>(r: &mut R) -> Result<u64> {
    let len = r
        .read_u8()
        .await
        .map_err(|e| Error::wrapped(crate::mesh::error::ErrorKind::Connection, "connection closed reading varint length", e))?;
    if len == 0 {
        return Ok(0);
    }
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf[..len as usize])
        .await
        .map_err(|e| Error::wrapped(crate::mesh::error::ErrorKind::Connection, "connection closed reading varint payload", e))?;
    Ok(u64::from_le_bytes(buf))
}

async fn read_blob_async<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    let len = read_varint_async(r).await? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)
        .await
        .map_err(|e| Error::wrapped(crate::mesh::error::ErrorKind::Connection, "connection closed reading blob", e))?;
    Ok(buf)
}

async fn read_string_async<R: AsyncRead + Unpin>(r: &mut R) -> Result<String> {
    let bytes = read_blob_async(r).await?;
    String::from_utf8(bytes).map_err(|e| Error::wrapped(crate::mesh::error::ErrorKind::Protocol, "invalid utf-8 string", e))
}

async fn read_args_async<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<Vec<u8>>> {
    let count = read_varint_async(r).await?;
    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        args.push(read_blob_async(r).await?);
    }
    Ok(args)
}

async fn read_kwargs_async<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<(String, Vec<u8>)>> {
    let count = read_varint_async(r).await?;
    let mut kwargs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let k = read_string_async(r).await?;
        let v = read_blob_async(r).await?;
        kwargs.push((k, v));
    }
    Ok(kwargs)
}

/// Reads one inbound frame directly off a connected stream: the prefix byte
/// followed by whichever frame shape it names. Used by the server-side
/// accept loop, where frames arrive back to back on one long-lived
/// connection rather than as separately length-prefixed messages.
pub async fn read_inbound_async<R: AsyncRead + Unpin>(r: &mut R) -> Result<InboundFrame> {
    let prefix = r
        .read_u8()
        .await
        .map_err(|e| Error::wrapped(crate::mesh::error::ErrorKind::Connection, "connection closed reading frame prefix", e))?;
    match prefix {
        TOPIC_PREFIX => {
            let topic = read_string_async(r).await?;
            let args = read_args_async(r).await?;
            let kwargs = read_kwargs_async(r).await?;
            Ok(InboundFrame::Topic(WireTopicFrame { topic, args, kwargs }))
        }
        SERVICE_REQUEST_PREFIX => {
            let (id, _) = crate::mesh::codec::varint::decode_fixed(&{
                let mut buf = [0u8; REQUEST_ID_WIDTH];
                r.read_exact(&mut buf)
                    .await
                    .map_err(|e| Error::wrapped(crate::mesh::error::ErrorKind::Connection, "connection closed reading request id", e))?;
                buf
            }, REQUEST_ID_WIDTH)?;
            let service = read_string_async(r).await?;
            let args = read_args_async(r).await?;
            let kwargs = read_kwargs_async(r).await?;
            Ok(InboundFrame::ServiceRequest(WireServiceRequestFrame {
                id: id as RequestId,
                service,
                args,
                kwargs,
            }))
        }
        other => Err(Error::protocol(format!("unknown frame prefix byte {:#x}", other))),
    }
}

/// Reads one service-response frame off a stream that's already known to be
/// a response channel (no prefix byte to dispatch on).
pub async fn read_service_response_async<R: AsyncRead + Unpin>(r: &mut R) -> Result<WireServiceResponseFrame> {
    let mut id_buf = [0u8; REQUEST_ID_WIDTH];
    r.read_exact(&mut id_buf)
        .await
        .map_err(|e| Error::wrapped(crate::mesh::error::ErrorKind::Connection, "connection closed reading response id", e))?;
    let (id, _) = crate::mesh::codec::varint::decode_fixed(&id_buf, REQUEST_ID_WIDTH)?;

    let status_byte = r
        .read_u8()
        .await
        .map_err(|e| Error::wrapped(crate::mesh::error::ErrorKind::Connection, "connection closed reading response status", e))?;
    let status = match status_byte {
        STATUS_OK => WireServiceStatus::Ok(read_blob_async(r).await?),
        STATUS_ERROR => WireServiceStatus::Error(read_string_async(r).await?),
        other => {
            return Err(Error::protocol(format!(
                "unknown service response status byte {:#x}",
                other
            )))
        }
    };
    Ok(WireServiceResponseFrame { id: id as RequestId, status })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_frame_round_trip() {
        let frame = WireTopicFrame {
            topic: "test".into(),
            args: vec![b"arg".to_vec()],
            kwargs: vec![("key".into(), b"value".to_vec())],
        };
        let encoded = frame.encode().unwrap();
        assert_eq!(encoded[0], TOPIC_PREFIX);
        match decode_inbound(&encoded).unwrap() {
            InboundFrame::Topic(decoded) => assert_eq!(decoded, frame),
            _ => panic!("expected topic frame"),
        }
    }

    #[test]
    fn empty_topic_frame_round_trip() {
        let frame = WireTopicFrame {
            topic: "".into(),
            args: vec![],
            kwargs: vec![],
        };
        let encoded = frame.encode().unwrap();
        match decode_inbound(&encoded).unwrap() {
            InboundFrame::Topic(decoded) => assert_eq!(decoded, frame),
            _ => panic!("expected topic frame"),
        }
    }

    #[test]
    fn service_request_frame_round_trip() {
        let frame = WireServiceRequestFrame {
            id: 42,
            service: "multiply".into(),
            args: vec![b"3".to_vec(), b"4".to_vec()],
            kwargs: vec![],
        };
        let encoded = frame.encode().unwrap();
        assert_eq!(encoded[0], SERVICE_REQUEST_PREFIX);
        match decode_inbound(&encoded).unwrap() {
            InboundFrame::ServiceRequest(decoded) => assert_eq!(decoded, frame),
            _ => panic!("expected service request frame"),
        }
    }

    #[test]
    fn service_response_ok_round_trip() {
        let frame = WireServiceResponseFrame {
            id: 7,
            status: WireServiceStatus::Ok(b"12".to_vec()),
        };
        let encoded = frame.encode().unwrap();
        let decoded = WireServiceResponseFrame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn service_response_error_round_trip() {
        let frame = WireServiceResponseFrame {
            id: 7,
            status: WireServiceStatus::Error("boom".into()),
        };
        let encoded = frame.encode().unwrap();
        assert_eq!(encoded[REQUEST_ID_WIDTH], STATUS_ERROR);
        let decoded = WireServiceResponseFrame::decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn unknown_prefix_byte_is_protocol_error() {
        let buf = vec![b'x', 0];
        assert!(decode_inbound(&buf).is_err());
    }

    #[tokio::test]
    async fn read_inbound_async_matches_decode_inbound() {
        let frame = WireTopicFrame {
            topic: "test".into(),
            args: vec![b"arg".to_vec()],
            kwargs: vec![("key".into(), b"value".to_vec())],
        };
        let encoded = frame.encode().unwrap();
        let mut cursor = std::io::Cursor::new(encoded);
        match read_inbound_async(&mut cursor).await.unwrap() {
            InboundFrame::Topic(decoded) => assert_eq!(decoded, frame),
            _ => panic!("expected topic frame"),
        }
    }

    #[tokio::test]
    async fn read_service_response_async_matches_decode() {
        let frame = WireServiceResponseFrame {
            id: 9,
            status: WireServiceStatus::Error("nope".into()),
        };
        let encoded = frame.encode().unwrap();
        let mut cursor = std::io::Cursor::new(encoded);
        let decoded = read_service_response_async(&mut cursor).await.unwrap();
        assert_eq!(decoded, frame);
    }
}
