//! Server-Sent Events framing over an upgraded connection (C11).

use std::io;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Writes `text/event-stream` frames directly to the socket.
///
/// Obtained by [`Host`](super::Host) and handed to the registered
/// [`SseProducer`](super::action::SseProducer) once the `200` handshake
/// (written via [`Response::upgrade_sse`](crate::Response::upgrade_sse))
/// has been flushed. Dropping the sink ends the stream.
pub struct EventSink<'a> {
    stream: &'a mut TcpStream,
}

impl<'a> EventSink<'a> {
    pub(crate) fn new(stream: &'a mut TcpStream) -> Self {
        Self { stream }
    }

    /// Sends one SSE event. `data` is split on `\n` so multi-line payloads
    /// get one `data:` line each, per the `text/event-stream` format.
    pub async fn send_event(
        &mut self,
        id: Option<&str>,
        event: Option<&str>,
        data: &str,
    ) -> io::Result<()> {
        let mut frame = String::new();
        if let Some(id) = id {
            frame.push_str("id: ");
            frame.push_str(id);
            frame.push('\n');
        }
        if let Some(event) = event {
            frame.push_str("event: ");
            frame.push_str(event);
            frame.push('\n');
        }
        for line in data.split('\n') {
            frame.push_str("data: ");
            frame.push_str(line);
            frame.push('\n');
        }
        frame.push('\n');

        self.stream.write_all(frame.as_bytes()).await
    }

    /// Sends a comment line (`: text`), commonly used as a keep-alive that
    /// clients ignore.
    pub async fn comment(&mut self, text: &str) -> io::Result<()> {
        let mut frame = String::with_capacity(text.len() + 3);
        frame.push_str(": ");
        frame.push_str(text);
        frame.push('\n');
        self.stream.write_all(frame.as_bytes()).await
    }

    /// Shorthand for [`comment`](Self::comment) with a fixed `keepalive` body.
    pub async fn keepalive(&mut self) -> io::Result<()> {
        self.comment("keepalive").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// `EventSink` writes straight to a `TcpStream`, so exercising its
    /// framing needs a real connected socket pair rather than a buffer.
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    async fn read_available(stream: &mut TcpStream) -> String {
        let mut buf = vec![0u8; 4096];
        let n = stream.read(&mut buf).await.unwrap();
        String::from_utf8(buf[..n].to_vec()).unwrap()
    }

    #[tokio::test]
    async fn send_event_frames_id_event_and_multiline_data() {
        let (mut client, mut server) = socket_pair().await;
        let mut sink = EventSink::new(&mut server);

        sink.send_event(Some("42"), Some("update"), "line one\nline two").await.unwrap();

        let frame = read_available(&mut client).await;
        assert_eq!(frame, "id: 42\nevent: update\ndata: line one\ndata: line two\n\n");
    }

    #[tokio::test]
    async fn send_event_without_id_or_event_name() {
        let (mut client, mut server) = socket_pair().await;
        let mut sink = EventSink::new(&mut server);

        sink.send_event(None, None, "hello").await.unwrap();

        let frame = read_available(&mut client).await;
        assert_eq!(frame, "data: hello\n\n");
    }

    #[tokio::test]
    async fn comment_and_keepalive() {
        let (mut client, mut server) = socket_pair().await;
        let mut sink = EventSink::new(&mut server);

        sink.comment("hi").await.unwrap();
        assert_eq!(read_available(&mut client).await, ": hi\n");

        sink.keepalive().await.unwrap();
        assert_eq!(read_available(&mut client).await, ": keepalive\n");
    }
}
