//! Minimal ZooKeeper wire codec.
//!
//! Covers the session handshake and the read-only requests the store needs
//! (`getData`, `getChildren`, `ping`). Every frame is a big-endian `i32`
//! length followed by a jute-encoded payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const OP_GET_DATA: i32 = 4;
pub const OP_GET_CHILDREN: i32 = 8;
pub const OP_PING: i32 = 11;

pub const XID_PING: i32 = -2;

pub const ERR_OK: i32 = 0;
pub const ERR_NO_NODE: i32 = -101;

/// Largest frame accepted from a server.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Size of a serialized `Stat` record.
pub const STAT_LEN: usize = 68;

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// Session handshake sent on connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub protocol_version: i32,
    pub last_zxid_seen: i64,
    pub timeout_ms: i32,
    pub session_id: i64,
    pub passwd: Vec<u8>,
}

impl ConnectRequest {
    pub fn new(timeout_ms: i32) -> Self {
        Self {
            protocol_version: 0,
            last_zxid_seen: 0,
            timeout_ms,
            session_id: 0,
            passwd: vec![0; 16],
        }
    }

    /// Length-prefixed frame.
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        body.put_i32(self.protocol_version);
        body.put_i64(self.last_zxid_seen);
        body.put_i32(self.timeout_ms);
        body.put_i64(self.session_id);
        put_buffer(&mut body, Some(&self.passwd));
        body.put_u8(0); // read-only: false
        frame(body)
    }

    pub fn decode(mut buf: Bytes) -> io::Result<Self> {
        Ok(Self {
            protocol_version: get_i32(&mut buf)?,
            last_zxid_seen: get_i64(&mut buf)?,
            timeout_ms: get_i32(&mut buf)?,
            session_id: get_i64(&mut buf)?,
            passwd: get_buffer(&mut buf)?.unwrap_or_default(),
        })
    }
}

/// Server answer to the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub protocol_version: i32,
    pub timeout_ms: i32,
    pub session_id: i64,
    pub passwd: Vec<u8>,
}

impl ConnectResponse {
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        body.put_i32(self.protocol_version);
        body.put_i32(self.timeout_ms);
        body.put_i64(self.session_id);
        put_buffer(&mut body, Some(&self.passwd));
        frame(body)
    }

    pub fn decode(mut buf: Bytes) -> io::Result<Self> {
        Ok(Self {
            protocol_version: get_i32(&mut buf)?,
            timeout_ms: get_i32(&mut buf)?,
            session_id: get_i64(&mut buf)?,
            passwd: get_buffer(&mut buf)?.unwrap_or_default(),
        })
    }
}

/// Header preceding every reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub xid: i32,
    pub zxid: i64,
    pub err: i32,
}

impl ReplyHeader {
    pub fn decode(buf: &mut Bytes) -> io::Result<Self> {
        Ok(Self {
            xid: get_i32(buf)?,
            zxid: get_i64(buf)?,
            err: get_i32(buf)?,
        })
    }

    pub fn put(&self, buf: &mut BytesMut) {
        buf.put_i32(self.xid);
        buf.put_i64(self.zxid);
        buf.put_i32(self.err);
    }
}

/// Encode a request. `path` is omitted for pings; path requests never set a watch.
pub fn encode_request(xid: i32, op: i32, path: Option<&str>) -> Bytes {
    let mut body = BytesMut::new();
    body.put_i32(xid);
    body.put_i32(op);
    if let Some(path) = path {
        put_string(&mut body, path);
        body.put_u8(0);
    }
    frame(body)
}

/// Decode a `getChildren` reply body.
pub fn decode_children(mut buf: Bytes) -> io::Result<Vec<String>> {
    let count = get_i32(&mut buf)?;
    if count < 0 {
        return Ok(Vec::new());
    }
    let mut children = Vec::with_capacity(count as usize);
    for _ in 0..count {
        children.push(get_string(&mut buf)?);
    }
    Ok(children)
}

/// Decode a `getData` reply body, discarding the trailing stat.
pub fn decode_data(mut buf: Bytes) -> io::Result<Vec<u8>> {
    let data = get_buffer(&mut buf)?.unwrap_or_default();
    if buf.remaining() < STAT_LEN {
        return Err(invalid("truncated stat"));
    }
    Ok(data)
}

/// Read one length-prefixed frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Bytes> {
    let len = reader.read_i32().await?;
    if len < 0 || len as usize > MAX_FRAME {
        return Err(invalid("frame length out of range"));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Bytes::from(payload))
}

pub fn frame(body: BytesMut) -> Bytes {
    let mut out = BytesMut::with_capacity(body.len() + 4);
    out.put_i32(body.len() as i32);
    out.extend_from_slice(&body);
    out.freeze()
}

pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_i32(s.len() as i32);
    buf.extend_from_slice(s.as_bytes());
}

pub fn put_buffer(buf: &mut BytesMut, data: Option<&[u8]>) {
    match data {
        Some(data) => {
            buf.put_i32(data.len() as i32);
            buf.extend_from_slice(data);
        }
        None => buf.put_i32(-1),
    }
}

pub fn get_i32(buf: &mut Bytes) -> io::Result<i32> {
    if buf.remaining() < 4 {
        return Err(invalid("truncated int"));
    }
    Ok(buf.get_i32())
}

pub fn get_i64(buf: &mut Bytes) -> io::Result<i64> {
    if buf.remaining() < 8 {
        return Err(invalid("truncated long"));
    }
    Ok(buf.get_i64())
}

/// A `-1` length encodes a null buffer.
pub fn get_buffer(buf: &mut Bytes) -> io::Result<Option<Vec<u8>>> {
    let len = get_i32(buf)?;
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(invalid("truncated buffer"));
    }
    Ok(Some(buf.split_to(len).to_vec()))
}

pub fn get_string(buf: &mut Bytes) -> io::Result<String> {
    let data = get_buffer(buf)?.unwrap_or_default();
    String::from_utf8(data).map_err(|_| invalid("string is not UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strip_len(frame: Bytes) -> Bytes {
        let mut frame = frame;
        let len = frame.get_i32() as usize;
        assert_eq!(len, frame.remaining());
        frame
    }

    #[test]
    fn test_connect_request_layout() {
        let frame = ConnectRequest::new(30_000).encode();
        // 4 len + 4 + 8 + 4 + 8 + (4 + 16) + 1
        assert_eq!(frame.len(), 49);

        let decoded = ConnectRequest::decode(strip_len(frame)).unwrap();
        assert_eq!(decoded.timeout_ms, 30_000);
        assert_eq!(decoded.passwd.len(), 16);
    }

    #[test]
    fn test_get_data_request_layout() {
        let mut body = strip_len(encode_request(7, OP_GET_DATA, Some("/app")));
        assert_eq!(get_i32(&mut body).unwrap(), 7);
        assert_eq!(get_i32(&mut body).unwrap(), OP_GET_DATA);
        assert_eq!(get_string(&mut body).unwrap(), "/app");
        assert_eq!(body.get_u8(), 0);
        assert!(!body.has_remaining());
    }

    #[test]
    fn test_ping_has_no_path() {
        let body = strip_len(encode_request(XID_PING, OP_PING, None));
        assert_eq!(body.len(), 8);
    }

    #[test]
    fn test_decode_data_with_stat() {
        let mut body = BytesMut::new();
        put_buffer(&mut body, Some(b"value"));
        body.extend_from_slice(&[0u8; STAT_LEN]);
        assert_eq!(decode_data(body.freeze()).unwrap(), b"value");
    }

    #[test]
    fn test_decode_null_data() {
        let mut body = BytesMut::new();
        put_buffer(&mut body, None);
        body.extend_from_slice(&[0u8; STAT_LEN]);
        assert!(decode_data(body.freeze()).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_input() {
        let mut body = BytesMut::new();
        body.put_i32(10);
        body.extend_from_slice(b"abc");
        assert!(decode_children(body.freeze()).is_err());
    }

    #[tokio::test]
    async fn test_read_frame_rejects_negative_length() {
        let data: &[u8] = &[0xff, 0xff, 0xff, 0xff];
        let mut reader = data;
        assert!(read_frame(&mut reader).await.is_err());
    }
}
