//! Framed sessions over reliable byte streams.
//!
//! Every wire message is `0x01` | `u32 LE body length` | body, body at most
//! 1 MiB. A session is strictly request/response until it is upgraded with
//! [`Session::keep_alive`], which drops the read/write deadline.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::trace;

use crate::error::{Error, Result};
use crate::messages::{self, Envelope, MAX_MESSAGE_SIZE};
use crate::storage::SessionId;

/// Leading frame byte.
pub const FRAME_MAGIC: u8 = 0x01;

/// Fixed frame header: magic byte plus little-endian length.
pub const FRAME_HEADER_SIZE: usize = 5;

/// Write one envelope as a single frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, envelope: &Envelope) -> Result<()> {
    let body = messages::encode(envelope)?;
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(Error::BadRequest(format!(
            "message of {} bytes exceeds the {} byte cap",
            body.len(),
            MAX_MESSAGE_SIZE
        )));
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    frame.push(FRAME_MAGIC);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    stream
        .write_all(&frame)
        .await
        .map_err(|e| Error::Protocol(format!("frame write failed: {}", e)))?;
    Ok(())
}

/// Read exactly one frame and decode its envelope.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Envelope> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    let mut filled = 0;
    while filled < header.len() {
        let n = stream
            .read(&mut header[filled..])
            .await
            .map_err(|e| Error::Protocol(format!("header read failed: {}", e)))?;
        if n == 0 {
            if filled == 0 {
                // Clean half-close before any header byte arrived.
                return Err(Error::InvalidState("peer closed the session".into()));
            }
            return Err(Error::Protocol("connection closed mid-header".into()));
        }
        filled += n;
    }

    if header[0] != FRAME_MAGIC {
        return Err(Error::Protocol(format!(
            "bad frame magic 0x{:02x}",
            header[0]
        )));
    }
    let body_len = u32::from_le_bytes(header[1..5].try_into().expect("4 byte slice")) as usize;
    if body_len > MAX_MESSAGE_SIZE {
        return Err(Error::BadRequest(format!(
            "declared body of {} bytes exceeds the {} byte cap",
            body_len, MAX_MESSAGE_SIZE
        )));
    }

    let mut body = vec![0u8; body_len];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| Error::Protocol(format!("body read failed: {}", e)))?;

    Ok(messages::decode(&body)?)
}

/// One full-duplex byte stream carrying framed messages.
pub struct Session {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    id: SessionId,
    deadline: Option<Duration>,
}

impl Session {
    /// Wrap an accepted connection. Dispatch-mode sessions carry a
    /// read/write deadline until upgraded.
    pub fn new(stream: TcpStream, deadline: Duration) -> Result<Self> {
        let peer = stream
            .peer_addr()
            .map_err(Error::Connection)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader,
            writer,
            id: peer.to_string(),
            deadline: Some(deadline),
        })
    }

    /// Connect to a remote endpoint.
    pub async fn connect(addr: std::net::SocketAddr, deadline: Duration) -> Result<Self> {
        let connect = TcpStream::connect(addr);
        let stream = tokio::time::timeout(deadline, connect)
            .await
            .map_err(|_| {
                Error::Connection(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", addr),
                ))
            })?
            .map_err(Error::Connection)?;
        Self::new(stream, deadline)
    }

    /// Stable identifier of this session: the remote `address:port`.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Mark the session long-lived; reads and writes no longer time out.
    pub fn keep_alive(&mut self) {
        self.deadline = None;
    }

    pub async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        trace!(session = %self.id, id = envelope.id, "sending frame");
        match self.deadline {
            Some(deadline) => tokio::time::timeout(deadline, write_frame(&mut self.writer, envelope))
                .await
                .map_err(|_| Error::Protocol(format!("session {} write timed out", self.id)))?,
            None => write_frame(&mut self.writer, envelope).await,
        }
    }

    pub async fn receive(&mut self) -> Result<Envelope> {
        let envelope = match self.deadline {
            Some(deadline) => tokio::time::timeout(deadline, read_frame(&mut self.reader))
                .await
                .map_err(|_| Error::Protocol(format!("session {} read timed out", self.id)))??,
            None => read_frame(&mut self.reader).await?,
        };
        trace!(session = %self.id, id = envelope.id, "received frame");
        Ok(envelope)
    }

    /// Split into halves for the notification bridge: the writer pushes
    /// change requests, the reader only watches for disconnect.
    pub fn into_split(self) -> (SessionId, OwnedReadHalf, OwnedWriteHalf) {
        (self.id, self.reader, self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{NodeRequest, Request};

    fn envelope(id: u32) -> Envelope {
        Envelope::request(id, Request::Node(NodeRequest::GetNodeInfo))
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let sent = envelope(42);
        write_frame(&mut a, &sent).await.unwrap();
        let received = read_frame(&mut b).await.unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn sequential_frames_stay_ordered() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        for id in 0..5 {
            write_frame(&mut a, &envelope(id)).await.unwrap();
        }
        for id in 0..5 {
            assert_eq!(read_frame(&mut b).await.unwrap().id, id);
        }
    }

    #[tokio::test]
    async fn bad_magic_is_protocol_violation() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        tokio::io::AsyncWriteExt::write_all(&mut a, &[0x02, 1, 0, 0, 0, 0])
            .await
            .unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn oversized_length_is_bad_request() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let len = (MAX_MESSAGE_SIZE as u32 + 1).to_le_bytes();
        let mut header = vec![FRAME_MAGIC];
        header.extend_from_slice(&len);
        tokio::io::AsyncWriteExt::write_all(&mut a, &header).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[tokio::test]
    async fn clean_close_is_invalid_state() {
        let (a, mut b) = tokio::io::duplex(4096);
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn truncated_header_is_protocol_violation() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        tokio::io::AsyncWriteExt::write_all(&mut a, &[FRAME_MAGIC, 9]).await.unwrap();
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn truncated_body_is_protocol_violation() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let mut frame = vec![FRAME_MAGIC];
        frame.extend_from_slice(&100u32.to_le_bytes());
        frame.extend_from_slice(&[0u8; 10]);
        tokio::io::AsyncWriteExt::write_all(&mut a, &frame).await.unwrap();
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
