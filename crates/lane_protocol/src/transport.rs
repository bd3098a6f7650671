//! Length-prefixed framing over TCP.
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes of
//! JSON-encoded [`Envelope`]. Reading and writing are split so that a
//! connection can be driven by separate reader and writer tasks.

use crate::codec::{Envelope, ProtocolError, MAX_FRAME_LEN};
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Reading half of a framed connection.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads one raw frame. Returns `Ok(None)` when the peer closed the
    /// connection cleanly between frames.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let mut len_bytes = [0u8; 4];
        match self.inner.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(len));
        }

        let mut data = vec![0u8; len];
        self.inner.read_exact(&mut data).await?;
        Ok(Some(data))
    }

    pub async fn read_envelope(&mut self) -> Result<Option<Envelope>, ProtocolError> {
        match self.read_frame().await? {
            Some(frame) => Envelope::decode(&frame).map(Some),
            None => Ok(None),
        }
    }
}

/// Writing half of a framed connection.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_frame(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        if data.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(data.len()));
        }
        let len = data.len() as u32;
        self.inner.write_all(&len.to_be_bytes()).await?;
        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn write_envelope(&mut self, envelope: &Envelope) -> Result<(), ProtocolError> {
        let bytes = envelope.encode()?;
        self.write_frame(&bytes).await
    }

    /// Closes the write side of the connection.
    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// A framed TCP connection to a peer.
pub struct FramedConnection {
    stream: TcpStream,
    addr: SocketAddr,
}

impl FramedConnection {
    pub fn new(stream: TcpStream, addr: SocketAddr) -> Self {
        Self { stream, addr }
    }

    /// Opens a connection to `address`.
    pub async fn connect(address: &str) -> Result<Self, ProtocolError> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        let addr = stream.peer_addr()?;
        Ok(Self { stream, addr })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn into_split(self) -> (FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>) {
        let (read, write) = self.stream.into_split();
        (FrameReader::new(read), FrameWriter::new(write))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[tokio::test(flavor = "multi_thread")]
    async fn frames_round_trip_over_a_duplex_pipe() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer
            .write_envelope(&Envelope::new(1, Message::Deregister))
            .await
            .unwrap();
        drop(writer);

        let envelope = reader.read_envelope().await.unwrap().unwrap();
        assert_eq!(envelope.seq, 1);
        assert_eq!(envelope.message, Message::Deregister);

        // Clean close between frames reads as end of stream.
        assert!(reader.read_envelope().await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn oversized_length_prefix_is_rejected() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server);

        let bogus = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        client.write_all(&bogus).await.unwrap();

        match reader.read_frame().await {
            Err(ProtocolError::FrameTooLarge(len)) => assert_eq!(len, MAX_FRAME_LEN + 1),
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }
}
