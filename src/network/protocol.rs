//! Wire protocol framing and packet encoding.
//!
//! Every packet is framed as a 4-byte header (payload length, 3 bytes
//! little-endian; sequence, 1 byte) followed by the payload.
//!
//! Connection phase:
//!
//! - Handshake init (server): protocol version (1 byte), server version
//!   (length-prefixed utf-8), session id (4 bytes big-endian), challenge
//!   seed (20 bytes).
//! - Login request (client): protocol version (1 byte), database
//!   (utf-8s), open flags (4 bytes big-endian), user (utf-8s), login
//!   signature (20 bytes). A protocol version byte of `0xFF` marks a
//!   cancel request instead: session id (4 bytes big-endian) and a flags
//!   byte whose low bit selects query-only cancel.
//!
//! Command phase: the first payload byte is the command code; responses
//! are OK (0x00), ERROR (0xFF) and result sets (column-count header,
//! column packets, EOF, row packets, EOF).

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::ServerError;
use crate::network::auth::{SEED_LEN, SIGN_LEN};

/// Version 1 of the handshake/command protocol.
pub const PROTOCOL_VERSION: u8 = 1;

/// Login packet protocol-version byte that marks a cancel request.
pub const CANCEL_MARKER: u8 = 0xFF;

/// Largest payload expressible in the 3-byte length field.
pub const MAX_PAYLOAD: usize = 0x00FF_FFFF;

/// Command codes (client to server).
pub mod command {
    pub const COM_QUIT: u8 = 0x01;
    pub const COM_QUERY: u8 = 0x03;
    pub const COM_PING: u8 = 0x0e;
    pub const COM_STMT_PREPARE: u8 = 0x16;
    pub const COM_STMT_EXECUTE: u8 = 0x17;
    pub const COM_STMT_CLOSE: u8 = 0x19;
}

/// Leading response bytes (server to client).
pub mod status {
    pub const OK: u8 = 0x00;
    pub const EOF: u8 = 0xFE;
    pub const ERROR: u8 = 0xFF;
}

/// Splits one frame off the front of `buf` when fully buffered.
pub fn parse_frame(buf: &mut BytesMut) -> Option<(u8, Bytes)> {
    if buf.len() < 4 {
        return None;
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], 0]) as usize;
    if buf.len() < 4 + len {
        return None;
    }
    let header = buf.split_to(4);
    let seq = header[3];
    let payload = buf.split_to(len).freeze();
    Some((seq, payload))
}

/// Prepends the frame header to a payload.
pub fn frame(seq: u8, payload: &[u8]) -> Bytes {
    debug_assert!(payload.len() <= MAX_PAYLOAD);
    let mut out = BytesMut::with_capacity(4 + payload.len());
    let len = payload.len() as u32;
    out.put_u8(len as u8);
    out.put_u8((len >> 8) as u8);
    out.put_u8((len >> 16) as u8);
    out.put_u8(seq);
    out.put_slice(payload);
    out.freeze()
}

/// Writes one frame directly to a stream. Used during the connection
/// phase and by reject paths that bypass the write queue.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    seq: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    writer.write_all(&frame(seq, payload)).await?;
    writer.flush().await
}

/// Reads one frame from a stream (client side and tests).
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<(u8, Bytes)> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok((header[3], Bytes::from(payload)))
}

/// Payload builder with the length-encoded primitives of the frontend
/// protocol.
#[derive(Default)]
pub struct Packet {
    buf: BytesMut,
}

impl Packet {
    pub fn new() -> Self {
        Packet {
            buf: BytesMut::new(),
        }
    }

    pub fn put_u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn put_u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16(v);
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32(v);
        self
    }

    pub fn put_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.put_slice(v);
        self
    }

    /// Length-encoded integer: one byte below 251, otherwise a marker
    /// byte plus a fixed-width little-endian value.
    pub fn put_lenenc_int(&mut self, v: u64) -> &mut Self {
        if v < 251 {
            self.buf.put_u8(v as u8);
        } else if v <= 0xFFFF {
            self.buf.put_u8(0xFC);
            self.buf.put_u16_le(v as u16);
        } else if v <= 0xFF_FFFF {
            self.buf.put_u8(0xFD);
            self.buf.put_u8(v as u8);
            self.buf.put_u8((v >> 8) as u8);
            self.buf.put_u8((v >> 16) as u8);
        } else {
            self.buf.put_u8(0xFE);
            self.buf.put_u64_le(v);
        }
        self
    }

    /// Length-prefixed utf-8 string.
    pub fn put_utf8s(&mut self, v: &str) -> &mut Self {
        self.put_lenenc_int(v.len() as u64);
        self.buf.put_slice(v.as_bytes());
        self
    }

    pub fn into_payload(self) -> Bytes {
        self.buf.freeze()
    }

    /// OK response: affected row count plus an info string.
    pub fn ok(affected: u64, info: &str) -> Bytes {
        let mut p = Packet::new();
        p.put_u8(status::OK).put_lenenc_int(affected).put_utf8s(info);
        p.into_payload()
    }

    /// Prepare-OK response: statement id, result column count, parameter
    /// count.
    pub fn prepare_ok(stmt_id: u32, columns: u16, params: u16) -> Bytes {
        let mut p = Packet::new();
        p.put_u8(status::OK)
            .put_u32(stmt_id)
            .put_u16(columns)
            .put_u16(params);
        p.into_payload()
    }

    /// ERROR response: severity, 5-byte SQLSTATE, message.
    pub fn error(severity: &str, sqlstate: &str, message: &str) -> Bytes {
        debug_assert_eq!(sqlstate.len(), 5);
        let mut p = Packet::new();
        p.put_u8(status::ERROR)
            .put_utf8s(severity)
            .put_bytes(sqlstate.as_bytes())
            .put_utf8s(message);
        p.into_payload()
    }

    /// Result set header: number of columns.
    pub fn result_header(columns: u64) -> Bytes {
        let mut p = Packet::new();
        p.put_lenenc_int(columns);
        p.into_payload()
    }

    /// One column description packet.
    pub fn column(name: &str) -> Bytes {
        let mut p = Packet::new();
        p.put_utf8s(name);
        p.into_payload()
    }

    /// One data row; `None` encodes SQL NULL.
    pub fn data_row(values: &[Option<String>]) -> Bytes {
        let mut p = Packet::new();
        for value in values {
            match value {
                Some(v) => {
                    p.put_u8(0);
                    p.put_utf8s(v);
                }
                None => {
                    p.put_u8(1);
                }
            }
        }
        p.into_payload()
    }

    pub fn eof() -> Bytes {
        let mut p = Packet::new();
        p.put_u8(status::EOF);
        p.into_payload()
    }
}

/// Payload reader mirroring [`Packet`].
pub struct PacketReader {
    buf: Bytes,
    pos: usize,
}

impl PacketReader {
    pub fn new(buf: Bytes) -> Self {
        PacketReader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn get_u8(&mut self) -> Result<u8, ServerError> {
        if self.remaining() < 1 {
            return Err(truncated());
        }
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn get_u16(&mut self) -> Result<u16, ServerError> {
        if self.remaining() < 2 {
            return Err(truncated());
        }
        let v = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    pub fn get_u32(&mut self) -> Result<u32, ServerError> {
        if self.remaining() < 4 {
            return Err(truncated());
        }
        let v = u32::from_be_bytes([
            self.buf[self.pos],
            self.buf[self.pos + 1],
            self.buf[self.pos + 2],
            self.buf[self.pos + 3],
        ]);
        self.pos += 4;
        Ok(v)
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<Bytes, ServerError> {
        if self.remaining() < n {
            return Err(truncated());
        }
        let v = self.buf.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(v)
    }

    pub fn get_lenenc_int(&mut self) -> Result<u64, ServerError> {
        let first = self.get_u8()?;
        Ok(match first {
            0xFC => {
                let b = self.get_bytes(2)?;
                u16::from_le_bytes([b[0], b[1]]) as u64
            }
            0xFD => {
                let b = self.get_bytes(3)?;
                u32::from_le_bytes([b[0], b[1], b[2], 0]) as u64
            }
            0xFE => {
                let b = self.get_bytes(8)?;
                u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
            }
            v => v as u64,
        })
    }

    pub fn get_utf8s(&mut self) -> Result<String, ServerError> {
        let len = self.get_lenenc_int()? as usize;
        let bytes = self.get_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ServerError::Protocol("malformed utf-8 string".to_string()))
    }

    /// The rest of the payload as utf-8 (COM_QUERY text).
    pub fn rest_utf8(&mut self) -> Result<String, ServerError> {
        let bytes = self.get_bytes(self.remaining())?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ServerError::Protocol("malformed utf-8 string".to_string()))
    }
}

fn truncated() -> ServerError {
    ServerError::Protocol("truncated packet".to_string())
}

/// The handshake init packet sent by the server after accept.
pub struct HandshakeInit {
    pub seq: u8,
    pub protocol_version: u8,
    pub server_version: String,
    pub session_id: u32,
    pub seed: [u8; SEED_LEN],
}

impl HandshakeInit {
    pub fn encode(&self) -> Bytes {
        let mut p = Packet::new();
        p.put_u8(self.protocol_version)
            .put_utf8s(&self.server_version)
            .put_u32(self.session_id)
            .put_bytes(&self.seed);
        p.into_payload()
    }

    pub fn decode(payload: Bytes) -> Result<HandshakeInit, ServerError> {
        let mut r = PacketReader::new(payload);
        let protocol_version = r.get_u8()?;
        let server_version = r.get_utf8s()?;
        let session_id = r.get_u32()?;
        let seed_bytes = r.get_bytes(SEED_LEN)?;
        let mut seed = [0u8; SEED_LEN];
        seed.copy_from_slice(&seed_bytes);
        Ok(HandshakeInit {
            seq: 0,
            protocol_version,
            server_version,
            session_id,
            seed,
        })
    }
}

/// The client's reply to the handshake: a login or a cancel request.
pub enum LoginRequest {
    Login {
        protocol_version: u8,
        database: String,
        open_flags: u32,
        user: String,
        sign: Bytes,
    },
    Cancel {
        session_id: u32,
        query_only: bool,
    },
}

impl LoginRequest {
    pub fn decode(payload: Bytes) -> Result<LoginRequest, ServerError> {
        let mut r = PacketReader::new(payload);
        let version = r.get_u8()?;
        if version == CANCEL_MARKER {
            let session_id = r.get_u32()?;
            let flags = r.get_u8()?;
            return Ok(LoginRequest::Cancel {
                session_id,
                query_only: flags & 0x01 != 0,
            });
        }
        let database = r.get_utf8s()?;
        let open_flags = r.get_u32()?;
        let user = r.get_utf8s()?;
        let sign = r.get_bytes(SIGN_LEN)?;
        Ok(LoginRequest::Login {
            protocol_version: version,
            database,
            open_flags,
            user,
            sign,
        })
    }

    pub fn encode_login(database: &str, user: &str, sign: &[u8; SIGN_LEN]) -> Bytes {
        let mut p = Packet::new();
        p.put_u8(PROTOCOL_VERSION)
            .put_utf8s(database)
            .put_u32(0)
            .put_utf8s(user)
            .put_bytes(sign);
        p.into_payload()
    }

    pub fn encode_cancel(session_id: u32, query_only: bool) -> Bytes {
        let mut p = Packet::new();
        p.put_u8(CANCEL_MARKER)
            .put_u32(session_id)
            .put_u8(u8::from(query_only));
        p.into_payload()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let payload = Packet::ok(3, "done");
        let framed = frame(7, &payload);
        let mut buf = BytesMut::from(&framed[..]);
        let (seq, parsed) = parse_frame(&mut buf).expect("complete frame");
        assert_eq!(seq, 7);
        assert_eq!(parsed, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_frame_incomplete() {
        let payload = Packet::eof();
        let framed = frame(0, &payload);
        let mut buf = BytesMut::from(&framed[..framed.len() - 1]);
        assert!(parse_frame(&mut buf).is_none());
    }

    #[test]
    fn test_lenenc_int_round_trip() {
        for v in [0u64, 250, 251, 0xFFFF, 0x10000, 0xFF_FFFF, 0x1_000_000, u64::MAX] {
            let mut p = Packet::new();
            p.put_lenenc_int(v);
            let mut r = PacketReader::new(p.into_payload());
            assert_eq!(r.get_lenenc_int().unwrap(), v);
        }
    }

    #[test]
    fn test_handshake_round_trip() {
        let init = HandshakeInit {
            seq: 0,
            protocol_version: PROTOCOL_VERSION,
            server_version: "rsqlited 0.4.0".to_string(),
            session_id: 42,
            seed: [7u8; SEED_LEN],
        };
        let decoded = HandshakeInit::decode(init.encode()).unwrap();
        assert_eq!(decoded.server_version, "rsqlited 0.4.0");
        assert_eq!(decoded.session_id, 42);
        assert_eq!(decoded.seed, [7u8; SEED_LEN]);
    }

    #[test]
    fn test_login_and_cancel_decode() {
        let sign = [9u8; SIGN_LEN];
        let login = LoginRequest::decode(LoginRequest::encode_login("testdb", "test", &sign))
            .unwrap();
        match login {
            LoginRequest::Login {
                database,
                user,
                sign: s,
                ..
            } => {
                assert_eq!(database, "testdb");
                assert_eq!(user, "test");
                assert_eq!(&s[..], &sign[..]);
            }
            LoginRequest::Cancel { .. } => panic!("expected login"),
        }
        let cancel = LoginRequest::decode(LoginRequest::encode_cancel(5, true)).unwrap();
        match cancel {
            LoginRequest::Cancel {
                session_id,
                query_only,
            } => {
                assert_eq!(session_id, 5);
                assert!(query_only);
            }
            LoginRequest::Login { .. } => panic!("expected cancel"),
        }
    }

    #[test]
    fn test_truncated_packet_rejected() {
        let mut r = PacketReader::new(Bytes::from_static(&[0xFC, 0x01]));
        assert!(r.get_lenenc_int().is_err());
    }
}
