//! Outbound dialing.

use std::future::Future;
use std::io;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::net::TcpStream;

use crate::connect::idle::IdleTimeoutConn;
use crate::connect::BoxConn;

/// Obtains outbound connections.
///
/// `is_connect` tells implementations that pool or multiplex whether the
/// connection will carry a raw CONNECT tunnel.
pub trait Dialer: Send + Sync {
    fn dial<'a>(
        &'a self,
        is_connect: bool,
        network: &'a str,
        addr: &'a str,
    ) -> BoxFuture<'a, io::Result<BoxConn>>;
}

/// Dials plain TCP with a connect timeout, optionally adding idle timing.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
    idle_timeout: Duration,
}

impl TcpDialer {
    /// Create a dialer that gives up after `connect_timeout`.
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            idle_timeout: Duration::ZERO,
        }
    }

    /// Wrap dialed connections in [`IdleTimeoutConn`]. Zero disables it.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

impl Dialer for TcpDialer {
    fn dial<'a>(
        &'a self,
        is_connect: bool,
        network: &'a str,
        addr: &'a str,
    ) -> BoxFuture<'a, io::Result<BoxConn>> {
        Box::pin(async move {
            if !matches!(network, "tcp" | "tcp4" | "tcp6") {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unsupported network {network}"),
                ));
            }

            let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| {
                    io::Error::new(io::ErrorKind::TimedOut, format!("dial {addr} timed out"))
                })??;
            stream.set_nodelay(true)?;

            tracing::debug!(
                addr = %addr,
                is_connect,
                local_addr = ?stream.local_addr().ok(),
                "Dialed upstream"
            );

            if self.idle_timeout.is_zero() {
                Ok(Box::new(stream) as BoxConn)
            } else {
                Ok(Box::new(IdleTimeoutConn::new(stream, self.idle_timeout)) as BoxConn)
            }
        })
    }
}

/// Adapts an async closure into a [`Dialer`].
pub struct DialFn<F>(F);

pub fn dial_fn<F, Fut>(f: F) -> DialFn<F>
where
    F: Fn(bool, String, String) -> Fut + Send + Sync,
    Fut: Future<Output = io::Result<BoxConn>> + Send + 'static,
{
    DialFn(f)
}

impl<F, Fut> Dialer for DialFn<F>
where
    F: Fn(bool, String, String) -> Fut + Send + Sync,
    Fut: Future<Output = io::Result<BoxConn>> + Send + 'static,
{
    fn dial<'a>(
        &'a self,
        is_connect: bool,
        network: &'a str,
        addr: &'a str,
    ) -> BoxFuture<'a, io::Result<BoxConn>> {
        Box::pin((self.0)(is_connect, network.to_owned(), addr.to_owned()))
    }
}
