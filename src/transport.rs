//! Transport channel beneath the frame codec.
//!
//! A [`Connector`] opens a byte stream to an endpoint; the session wraps it in
//! a [`Transport`] for the handshake and then splits it so the reception loop
//! owns the read half while commands write through the other half.
//!
//! Failures are always returned to the caller: a read of zero bytes is turned
//! into `UnexpectedEof` and a send that does not complete within the write
//! timeout into `TimedOut`, so the session can treat both as transport loss.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

/// TCP port the instrument listens on.
pub const DEFAULT_PORT: u16 = 5000;

const DEFAULT_KEEPALIVE_SECS: u64 = 10;
const READ_CHUNK: usize = 16 * 1024;

/// Any bidirectional byte stream usable as a device link.
pub trait Link: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Link for T {}

pub type BoxedLink = Box<dyn Link>;

/// Opens links to device endpoints.
///
/// The session only talks to the network through this trait, which lets tests
/// substitute an in-memory device.
pub trait Connector: Send + Sync {
    fn open<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, io::Result<BoxedLink>>;
}

/// Connector for instruments reachable over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    /// Port used when the endpoint is a bare host or IP address.
    pub port: u16,
    pub nodelay: bool,
    /// Idle time before keepalive probes start, `None` to leave the OS default.
    pub keepalive: Option<Duration>,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            nodelay: true,
            keepalive: Some(Duration::from_secs(DEFAULT_KEEPALIVE_SECS)),
        }
    }
}

impl TcpConnector {
    fn target(&self, endpoint: &str) -> String {
        if endpoint.parse::<SocketAddr>().is_ok() {
            return endpoint.to_string();
        }
        if let Ok(ip) = endpoint.parse::<IpAddr>() {
            return SocketAddr::new(ip, self.port).to_string();
        }
        if endpoint.contains(':') {
            endpoint.to_string()
        } else {
            format!("{}:{}", endpoint, self.port)
        }
    }
}

impl Connector for TcpConnector {
    fn open<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, io::Result<BoxedLink>> {
        Box::pin(async move {
            let target = self.target(endpoint);
            debug!("opening TCP connection: target={}", target);
            let stream = TcpStream::connect(&target).await?;
            stream.set_nodelay(self.nodelay)?;
            if let Some(idle) = self.keepalive {
                // Keepalive only speeds up loss detection; a failure here is not fatal.
                if let Err(e) = configure_keepalive(&stream, idle) {
                    warn!("failed to enable TCP keepalive: target={}, error={}", target, e);
                }
            }
            Ok(Box::new(stream) as BoxedLink)
        })
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn configure_keepalive(stream: &TcpStream, idle: Duration) -> io::Result<()> {
    use nix::sys::socket::{setsockopt, sockopt};

    setsockopt(stream, sockopt::KeepAlive, &true)?;
    let idle_secs = idle.as_secs().clamp(1, u32::MAX as u64) as u32;
    setsockopt(stream, sockopt::TcpKeepIdle, &idle_secs)?;
    Ok(())
}

#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
fn configure_keepalive(stream: &TcpStream, _idle: Duration) -> io::Result<()> {
    use nix::sys::socket::{setsockopt, sockopt};

    setsockopt(stream, sockopt::KeepAlive, &true)?;
    Ok(())
}

#[cfg(not(unix))]
fn configure_keepalive(_stream: &TcpStream, _idle: Duration) -> io::Result<()> {
    Ok(())
}

async fn send_with_timeout<W>(writer: &mut W, frame: &[u8], limit: Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        writer.write_all(frame).await?;
        writer.flush().await
    };
    tokio::time::timeout(limit, write).await.map_err(|_| {
        io::Error::new(
            io::ErrorKind::TimedOut,
            format!("send did not complete within {:?}", limit),
        )
    })?
}

async fn recv_chunk<'b, R>(reader: &mut R, buf: &'b mut [u8]) -> io::Result<&'b [u8]>
where
    R: AsyncRead + Unpin,
{
    let n = reader.read(buf).await?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed by peer",
        ));
    }
    Ok(&buf[..n])
}

/// An open, not yet split device link.
pub struct Transport {
    link: BoxedLink,
    buf: Vec<u8>,
    write_timeout: Duration,
}

impl Transport {
    pub fn new(link: BoxedLink, write_timeout: Duration) -> Self {
        Self {
            link,
            buf: vec![0u8; READ_CHUNK],
            write_timeout,
        }
    }

    /// Write one encoded frame.
    pub async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        send_with_timeout(&mut self.link, frame, self.write_timeout).await
    }

    /// Wait for the next chunk of inbound bytes.
    pub async fn recv(&mut self) -> io::Result<&[u8]> {
        recv_chunk(&mut self.link, &mut self.buf).await
    }

    pub async fn close(&mut self) -> io::Result<()> {
        self.link.shutdown().await
    }

    /// Split into independently owned read and write halves.
    pub fn into_split(self) -> (TransportReader, TransportWriter) {
        let (read, write) = tokio::io::split(self.link);
        (
            TransportReader {
                half: read,
                buf: self.buf,
            },
            TransportWriter {
                half: write,
                write_timeout: self.write_timeout,
            },
        )
    }
}

/// Read half, owned by the reception loop.
pub struct TransportReader {
    half: ReadHalf<BoxedLink>,
    buf: Vec<u8>,
}

impl TransportReader {
    /// Wait for the next chunk of inbound bytes. Cancel-safe.
    pub async fn recv(&mut self) -> io::Result<&[u8]> {
        recv_chunk(&mut self.half, &mut self.buf).await
    }
}

/// Write half, owned by the session under its lock.
pub struct TransportWriter {
    half: WriteHalf<BoxedLink>,
    write_timeout: Duration,
}

impl TransportWriter {
    pub async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        send_with_timeout(&mut self.half, frame, self.write_timeout).await
    }

    pub async fn close(&mut self) -> io::Result<()> {
        self.half.shutdown().await
    }
}
