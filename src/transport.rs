use std::future::Future;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::protocol::HotspotInfo;

/// Byte stream carrying the control channel (an RFCOMM socket on device).
///
/// `send` is a framed write, `receive` a framed read and `close` a shutdown;
/// see [`crate::network`]. Any `AsyncRead + AsyncWrite` stream qualifies, so
/// platform bindings only have to hand over a stream.
pub trait ControlTransport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> ControlTransport for T {}

/// Byte stream carrying one file transfer (a TCP socket over the hotspot).
pub trait BulkTransport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> BulkTransport for T {}

/// Produces control transports, once per (re)connect attempt.
///
/// Implemented for closures returning a future, e.g.
/// `move || tokio::net::TcpStream::connect(addr)`.
pub trait Connector: Send + 'static {
    type Transport: ControlTransport;

    fn connect(&mut self) -> impl Future<Output = io::Result<Self::Transport>> + Send;
}

impl<F, Fut, T> Connector for F
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = io::Result<T>> + Send,
    T: ControlTransport,
{
    type Transport = T;

    fn connect(&mut self) -> impl Future<Output = io::Result<T>> + Send {
        self()
    }
}

/// Platform WiFi capability backing the bulk link.
pub trait BulkNetwork: Send {
    /// Start an access point (producer role).
    fn create_hotspot(&mut self) -> impl Future<Output = io::Result<HotspotInfo>> + Send;

    /// Join the peer's access point (consumer role).
    fn join(&mut self, info: &HotspotInfo) -> impl Future<Output = io::Result<()>> + Send;

    /// Tear down whichever of the two is active.
    fn stop(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}
