//! Peer transport: bounded-timeout TCP links.
//!
//! The sending loops and the supervisor talk to peers through the
//! [`Connector`]/[`Link`] seam so they can be exercised against in-memory
//! fakes; [`TcpConnector`] is the production implementation over
//! `tokio::net::TcpStream`.
//!
//! All blocking operations are bounded: connect, send and receive each carry
//! a configured timeout and fail with a retryable connection error when it
//! elapses. Dropping a link closes the socket; there is no explicit close
//! call at use sites.

use crate::binlog::BoxFuture;
use crate::codec::{self, Reply};
use crate::config::RelaySettings;
use crate::error::{RelayError, Result};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Connect/send/receive bounds for one link.
#[derive(Debug, Clone, Copy)]
pub struct LinkTimeouts {
    pub connect: Duration,
    pub send: Duration,
    pub recv: Duration,
}

impl From<&RelaySettings> for LinkTimeouts {
    fn from(settings: &RelaySettings) -> Self {
        Self {
            connect: settings.connect_timeout(),
            send: settings.send_timeout(),
            recv: settings.recv_timeout(),
        }
    }
}

/// An established connection to a peer endpoint.
pub trait Link: Send {
    /// Transmit the whole buffer, bounded by the send timeout.
    fn send_all<'a>(&'a mut self, bytes: &'a [u8]) -> BoxFuture<'a, ()>;

    /// Await exactly one reply, bounded by the receive timeout.
    fn recv_reply(&mut self) -> BoxFuture<'_, Reply>;

    /// Socket descriptor, surfaced into the registry diagnostic.
    fn descriptor(&self) -> i32;
}

/// Factory for peer links.
pub trait Connector: Send + Sync + 'static {
    /// Connect to `ip:port`, bounded by `timeouts.connect`. `server_id` is
    /// carried for error context only.
    fn connect(
        &self,
        server_id: i32,
        ip: &str,
        port: u16,
        timeouts: LinkTimeouts,
    ) -> BoxFuture<'_, Box<dyn Link>>;
}

/// Production connector over TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(
        &self,
        server_id: i32,
        ip: &str,
        port: u16,
        timeouts: LinkTimeouts,
    ) -> BoxFuture<'_, Box<dyn Link>> {
        let addr = format!("{}:{}", ip, port);
        Box::pin(async move {
            let stream = match timeout(timeouts.connect, TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    return Err(RelayError::connection(
                        server_id,
                        format!("connect {}: {}", addr, e),
                    ))
                }
                Err(_) => {
                    return Err(RelayError::connection(
                        server_id,
                        format!("connect {}: timed out after {:?}", addr, timeouts.connect),
                    ))
                }
            };
            // Commands are small and latency-sensitive; don't batch in the kernel.
            let _ = stream.set_nodelay(true);
            Ok(Box::new(TcpLink {
                server_id,
                stream,
                timeouts,
                rx_buf: Vec::new(),
            }) as Box<dyn Link>)
        })
    }
}

/// A live TCP link to a peer.
pub struct TcpLink {
    server_id: i32,
    stream: TcpStream,
    timeouts: LinkTimeouts,
    rx_buf: Vec<u8>,
}

impl Link for TcpLink {
    fn send_all<'a>(&'a mut self, bytes: &'a [u8]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            match timeout(self.timeouts.send, self.stream.write_all(bytes)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(RelayError::connection(
                    self.server_id,
                    format!("send: {}", e),
                )),
                Err(_) => Err(RelayError::connection(
                    self.server_id,
                    format!("send: timed out after {:?}", self.timeouts.send),
                )),
            }
        })
    }

    fn recv_reply(&mut self) -> BoxFuture<'_, Reply> {
        Box::pin(async move {
            loop {
                if let Some((reply, consumed)) = codec::parse_reply(&self.rx_buf)? {
                    self.rx_buf.drain(..consumed);
                    return Ok(reply);
                }

                let mut chunk = [0u8; 4096];
                let n = match timeout(self.timeouts.recv, self.stream.read(&mut chunk)).await {
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => {
                        return Err(RelayError::connection(
                            self.server_id,
                            format!("recv: {}", e),
                        ))
                    }
                    Err(_) => {
                        return Err(RelayError::connection(
                            self.server_id,
                            format!("recv: timed out after {:?}", self.timeouts.recv),
                        ))
                    }
                };
                if n == 0 {
                    return Err(RelayError::connection(
                        self.server_id,
                        "recv: connection closed by peer",
                    ));
                }
                self.rx_buf.extend_from_slice(&chunk[..n]);
            }
        })
    }

    #[cfg(unix)]
    fn descriptor(&self) -> i32 {
        use std::os::fd::AsRawFd;
        self.stream.as_raw_fd()
    }

    #[cfg(not(unix))]
    fn descriptor(&self) -> i32 {
        -1
    }
}
