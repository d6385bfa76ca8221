//! Length-prefixed framing over any async byte stream, plus TCP adapters.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::protocol::LEN_PREFIX;
use crate::transport::Connector;

pub const DEFAULT_CONTROL_PORT: u16 = 9999;
pub const DEFAULT_BULK_PORT: u16 = 8888;

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<()> {
    let len = u32::try_from(data.len()).map_err(|_| Error::MessageTooLarge {
        size: data.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes()).await.map_err(Error::from_io)?;
    writer.write_all(data).await.map_err(Error::from_io)?;
    writer.flush().await.map_err(Error::from_io)?;
    Ok(())
}

/// Outcome of reading one frame.
#[derive(Debug)]
pub enum Frame {
    Data(Vec<u8>),
    /// The announced length exceeded `max`; its bytes were read and dropped.
    Oversized(usize),
}

/// Read one length-prefixed frame of at most `max` bytes.
///
/// Oversized frames are drained so the stream stays aligned on the next
/// frame, unless they exceed `16 * max`, which is treated as a corrupt stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max: usize) -> Result<Frame> {
    let mut len_bytes = [0u8; LEN_PREFIX];
    reader.read_exact(&mut len_bytes).await.map_err(Error::from_io)?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > max {
        if len > max.saturating_mul(16) {
            return Err(Error::MessageTooLarge { size: len, max });
        }
        let mut sink = tokio::io::sink();
        let mut limited = (&mut *reader).take(len as u64);
        tokio::io::copy(&mut limited, &mut sink).await.map_err(Error::from_io)?;
        return Ok(Frame::Oversized(len));
    }

    let mut buffer = vec![0u8; len];
    reader.read_exact(&mut buffer).await.map_err(Error::from_io)?;
    Ok(Frame::Data(buffer))
}

/// A framed duplex connection over a byte stream.
///
/// Reads go through an internal buffer, so a `receive` or `receive_raw`
/// dropped mid-frame (say by a timeout) resumes where it stopped.
pub struct Connection<S> {
    stream: S,
    max_frame: usize,
    buffer: Vec<u8>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub fn new(stream: S, max_frame: usize) -> Self {
        Self {
            stream,
            max_frame,
            buffer: Vec::new(),
        }
    }

    /// Send a message (length-prefixed)
    pub async fn send(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.max_frame {
            return Err(Error::MessageTooLarge {
                size: data.len(),
                max: self.max_frame,
            });
        }
        write_frame(&mut self.stream, data).await
    }

    /// Receive a message (length-prefixed)
    pub async fn receive(&mut self) -> Result<Vec<u8>> {
        self.fill(LEN_PREFIX).await?;
        let mut prefix = [0u8; LEN_PREFIX];
        prefix.copy_from_slice(&self.buffer[..LEN_PREFIX]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_frame {
            return Err(Error::MessageTooLarge {
                size: len,
                max: self.max_frame,
            });
        }

        self.fill(LEN_PREFIX + len).await?;
        let frame = self.buffer[LEN_PREFIX..LEN_PREFIX + len].to_vec();
        self.buffer.drain(..LEN_PREFIX + len);
        Ok(frame)
    }

    /// Send raw bytes (for file chunks)
    pub async fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await.map_err(Error::from_io)?;
        self.stream.flush().await.map_err(Error::from_io)?;
        Ok(())
    }

    /// Receive exactly `size` raw bytes (for file chunks)
    pub async fn receive_raw(&mut self, size: usize) -> Result<Vec<u8>> {
        self.fill(size).await?;
        let rest = self.buffer.split_off(size);
        Ok(std::mem::replace(&mut self.buffer, rest))
    }

    /// Shut down the write half; the peer sees EOF.
    pub async fn close(&mut self) -> Result<()> {
        self.stream.shutdown().await.map_err(Error::from_io)
    }

    /// Buffer at least `want` bytes. Cancel-safe: read bytes stay buffered.
    async fn fill(&mut self, want: usize) -> Result<()> {
        while self.buffer.len() < want {
            self.buffer.reserve(want - self.buffer.len());
            let read = self.stream.read_buf(&mut self.buffer).await.map_err(Error::from_io)?;
            if read == 0 {
                return Err(Error::TransportClosed);
            }
        }
        Ok(())
    }
}

/// Bind a TCP listener for incoming links.
pub async fn bind(port: Option<u16>, default_port: u16) -> Result<TcpListener> {
    let port = port.unwrap_or(default_port);
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Wait for one connection on `listener`.
pub async fn accept(listener: &TcpListener) -> Result<(TcpStream, SocketAddr)> {
    let (stream, peer_addr) = listener.accept().await?;
    stream.set_nodelay(true)?;
    debug!("Accepted connection from {}", peer_addr);
    Ok((stream, peer_addr))
}

/// Connect to a remote host
pub async fn connect(host: &str, port: u16) -> Result<TcpStream> {
    let addr = format!("{}:{}", host, port);
    let stream = TcpStream::connect(&addr).await?;
    stream.set_nodelay(true)?;
    debug!("Connected to {}", addr);
    Ok(stream)
}

/// Control-link connector dialing `host:port` on every (re)connect.
pub fn tcp_connector(host: &str, port: u16) -> impl Connector<Transport = TcpStream> {
    let addr = format!("{}:{}", host, port);
    move || {
        let addr = addr.clone();
        async move {
            let stream = TcpStream::connect(&addr).await?;
            stream.set_nodelay(true)?;
            debug!("Connected to {}", addr);
            Ok::<_, io::Error>(stream)
        }
    }
}

/// Control-link connector that waits for the next peer on `listener`.
pub fn tcp_acceptor(listener: Arc<TcpListener>) -> impl Connector<Transport = TcpStream> {
    move || {
        let listener = listener.clone();
        async move {
            let (stream, peer_addr) = listener.accept().await?;
            stream.set_nodelay(true)?;
            info!("Control link from {}", peer_addr);
            Ok::<_, io::Error>(stream)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server_handle = tokio::spawn(async move {
            let (stream, _) = accept(&listener).await.unwrap();
            let mut conn = Connection::new(stream, 1024);
            let data = conn.receive().await.unwrap();
            assert_eq!(data, b"test");
            conn.send(b"response").await.unwrap();
        });

        let stream = connect("127.0.0.1", port).await.unwrap();
        let mut conn = Connection::new(stream, 1024);
        conn.send(b"test").await.unwrap();
        let response = conn.receive().await.unwrap();
        assert_eq!(response, b"response");

        server_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_raw_bytes_follow_frame() {
        let (a, b) = tokio::io::duplex(4096);
        let mut left = Connection::new(a, 64);
        let mut right = Connection::new(b, 64);

        left.send(b"header").await.unwrap();
        left.send_raw(&[7u8; 100]).await.unwrap();

        assert_eq!(right.receive().await.unwrap(), b"header");
        assert_eq!(right.receive_raw(100).await.unwrap(), vec![7u8; 100]);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_drained() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_frame(&mut a, &[1u8; 40]).await.unwrap();
        write_frame(&mut a, b"ok").await.unwrap();

        assert!(matches!(read_frame(&mut b, 16).await.unwrap(), Frame::Oversized(40)));
        match read_frame(&mut b, 16).await.unwrap() {
            Frame::Data(data) => assert_eq!(data, b"ok"),
            other => panic!("expected data, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_rejects_large_message() {
        let (a, _b) = tokio::io::duplex(64);
        let mut conn = Connection::new(a, 8);
        let err = conn.send(&[0u8; 9]).await.unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge { size: 9, max: 8 }));
    }

    #[tokio::test]
    async fn test_cancelled_raw_read_resumes() {
        let (mut a, b) = tokio::io::duplex(4096);
        let mut conn = Connection::new(b, 64);

        a.write_all(&[1u8; 30]).await.unwrap();
        let attempt = tokio::time::timeout(Duration::from_millis(20), conn.receive_raw(50)).await;
        assert!(attempt.is_err());

        a.write_all(&[2u8; 20]).await.unwrap();
        write_frame(&mut a, b"next").await.unwrap();
        let payload = conn.receive_raw(50).await.unwrap();
        assert_eq!(&payload[..30], &[1u8; 30]);
        assert_eq!(&payload[30..], &[2u8; 20]);
        assert_eq!(conn.receive().await.unwrap(), b"next");
    }

    #[tokio::test]
    async fn test_oversized_frame_fails_receive() {
        let (mut a, b) = tokio::io::duplex(4096);
        write_frame(&mut a, &[1u8; 40]).await.unwrap();
        let mut conn = Connection::new(b, 16);
        assert!(matches!(
            conn.receive().await,
            Err(Error::MessageTooLarge { size: 40, max: 16 })
        ));
    }

    #[tokio::test]
    async fn test_eof_is_transport_closed() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);
        let mut conn = Connection::new(b, 64);
        assert!(matches!(conn.receive().await, Err(Error::TransportClosed)));
    }
}
