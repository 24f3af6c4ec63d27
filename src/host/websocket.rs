//! RFC 6455 WebSocket handshake and framing (C12).

use base64::{engine::general_purpose::STANDARD, Engine};
use sha1::{Digest, Sha1};
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes `Sec-WebSocket-Accept` from a client's `Sec-WebSocket-Key`.
///
/// # Examples
/// ```ignore
/// assert_eq!(
///     accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=",
/// );
/// ```
pub(crate) fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    fn from_byte(b: u8) -> Option<Self> {
        match b & 0x0F {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    const fn as_byte(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// A complete, reassembled WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close { code: Option<u16>, reason: String },
}

/// An error encountered while reading or writing WebSocket frames.
#[derive(Debug)]
pub enum WsError {
    Io(io::Error),
    Protocol(&'static str),
    TooLarge,
}

impl From<io::Error> for WsError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl std::fmt::Display for WsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "websocket io error: {e}"),
            Self::Protocol(msg) => write!(f, "websocket protocol violation: {msg}"),
            Self::TooLarge => write!(f, "websocket message exceeds configured maximum size"),
        }
    }
}

impl std::error::Error for WsError {}

/// Frame-level access to an upgraded WebSocket connection, handed to the
/// registered [`WebSocketHandler`](super::action::WebSocketHandler).
pub struct WebSocketStream<'a> {
    stream: &'a mut TcpStream,
    max_message_size: usize,
    closed: bool,
}

impl<'a> WebSocketStream<'a> {
    pub(crate) fn new(stream: &'a mut TcpStream, max_message_size: usize) -> Self {
        Self { stream, max_message_size, closed: false }
    }

    /// Reads and reassembles the next complete message, automatically
    /// replying to pings with a pong. Returns `Ok(None)` once a close
    /// handshake has completed.
    pub async fn recv(&mut self) -> Result<Option<Message>, WsError> {
        if self.closed {
            return Ok(None);
        }

        let mut assembled: Vec<u8> = Vec::new();
        let mut assembling_opcode: Option<Opcode> = None;

        loop {
            let (fin, opcode, payload) = self.read_frame().await?;

            if opcode.is_control() {
                if !fin || payload.len() > 125 {
                    return Err(WsError::Protocol("fragmented or oversized control frame"));
                }
                match opcode {
                    Opcode::Ping => {
                        self.write_frame(true, Opcode::Pong, &payload).await?;
                        continue;
                    }
                    Opcode::Pong => return Ok(Some(Message::Pong(payload))),
                    Opcode::Close => {
                        let (code, reason) = parse_close(&payload);
                        self.write_frame(true, Opcode::Close, &payload).await.ok();
                        self.closed = true;
                        return Ok(Some(Message::Close { code, reason }));
                    }
                    _ => unreachable!(),
                }
            }

            let effective_opcode = match (assembling_opcode, opcode) {
                (None, Opcode::Continuation) => {
                    return Err(WsError::Protocol("continuation with no prior fragment"))
                }
                (None, op) => op,
                (Some(_), Opcode::Continuation) => assembling_opcode.unwrap(),
                (Some(_), _) => return Err(WsError::Protocol("new message while fragment pending")),
            };
            assembling_opcode = Some(effective_opcode);

            if assembled.len() + payload.len() > self.max_message_size {
                return Err(WsError::TooLarge);
            }
            assembled.extend_from_slice(&payload);

            if fin {
                return Ok(Some(match effective_opcode {
                    Opcode::Text => Message::Text(
                        String::from_utf8(assembled).map_err(|_| WsError::Protocol("invalid utf-8"))?,
                    ),
                    Opcode::Binary => Message::Binary(assembled),
                    _ => return Err(WsError::Protocol("unexpected data opcode")),
                }));
            }
        }
    }

    pub async fn send_text(&mut self, text: &str) -> Result<(), WsError> {
        self.write_frame(true, Opcode::Text, text.as_bytes()).await
    }

    pub async fn send_binary(&mut self, data: &[u8]) -> Result<(), WsError> {
        self.write_frame(true, Opcode::Binary, data).await
    }

    pub async fn send_ping(&mut self, data: &[u8]) -> Result<(), WsError> {
        self.write_frame(true, Opcode::Ping, data).await
    }

    /// Sends a close frame and marks the stream closed. Idempotent.
    pub async fn close(&mut self, code: u16, reason: &str) -> Result<(), WsError> {
        if self.closed {
            return Ok(());
        }
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        self.write_frame(true, Opcode::Close, &payload).await?;
        self.closed = true;
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<(bool, Opcode, Vec<u8>), WsError> {
        let mut head = [0u8; 2];
        self.stream.read_exact(&mut head).await?;

        let fin = head[0] & 0x80 != 0;
        let opcode = Opcode::from_byte(head[0]).ok_or(WsError::Protocol("unknown opcode"))?;
        let masked = head[1] & 0x80 != 0;
        let len7 = head[1] & 0x7F;

        if !masked {
            return Err(WsError::Protocol("client frame not masked"));
        }

        let len: u64 = match len7 {
            126 => {
                let mut ext = [0u8; 2];
                self.stream.read_exact(&mut ext).await?;
                u16::from_be_bytes(ext) as u64
            }
            127 => {
                let mut ext = [0u8; 8];
                self.stream.read_exact(&mut ext).await?;
                u64::from_be_bytes(ext)
            }
            n => n as u64,
        };

        if opcode.is_control() && len > 125 {
            return Err(WsError::Protocol("oversized control frame"));
        }
        if len as usize > self.max_message_size {
            return Err(WsError::TooLarge);
        }

        let mut mask = [0u8; 4];
        self.stream.read_exact(&mut mask).await?;

        let mut payload = vec![0u8; len as usize];
        self.stream.read_exact(&mut payload).await?;
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= mask[i % 4];
        }

        Ok((fin, opcode, payload))
    }

    /// Server-to-client frames are sent unmasked, per RFC 6455 section 5.2.
    async fn write_frame(&mut self, fin: bool, opcode: Opcode, payload: &[u8]) -> Result<(), WsError> {
        let mut head = Vec::with_capacity(10 + payload.len());
        head.push((if fin { 0x80 } else { 0 }) | opcode.as_byte());

        let len = payload.len();
        if len < 126 {
            head.push(len as u8);
        } else if len <= u16::MAX as usize {
            head.push(126);
            head.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            head.push(127);
            head.extend_from_slice(&(len as u64).to_be_bytes());
        }
        head.extend_from_slice(payload);

        self.stream.write_all(&head).await?;
        Ok(())
    }
}

fn parse_close(payload: &[u8]) -> (Option<u16>, String) {
    if payload.len() < 2 {
        return (None, String::new());
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    (Some(code), reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc_example() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn opcode_roundtrip() {
        for op in [Opcode::Continuation, Opcode::Text, Opcode::Binary, Opcode::Close, Opcode::Ping, Opcode::Pong] {
            assert_eq!(Opcode::from_byte(op.as_byte()), Some(op));
        }
    }

    #[test]
    fn control_opcodes_identified() {
        assert!(Opcode::Close.is_control());
        assert!(Opcode::Ping.is_control());
        assert!(Opcode::Pong.is_control());
        assert!(!Opcode::Text.is_control());
        assert!(!Opcode::Binary.is_control());
    }

    #[test]
    fn parses_close_payload() {
        let mut payload = 1000u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"bye");
        assert_eq!(parse_close(&payload), (Some(1000), "bye".to_owned()));
        assert_eq!(parse_close(&[]), (None, String::new()));
    }
}
