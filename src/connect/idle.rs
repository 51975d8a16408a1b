//! Idle timing for transport connections.
//!
//! A connection wrapped in [`IdleTimeoutConn`] fails pending I/O once neither
//! direction has made progress for the idle timeout. The failure is an
//! `io::Error` of kind `TimedOut` wrapping [`Idled`], which the relay treats as
//! a normal end of a persistent connection rather than a transport failure.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

/// Marker error for connections closed after sitting idle.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("connection idled")]
pub struct Idled;

pub fn idled() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, Idled)
}

/// True if `err` signals an idle-timeout closure.
pub fn is_idled(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<Idled>())
}

/// Header map with the single `Keep-Alive` header advertising when idle
/// connections get closed. Empty if idle timing is disabled.
pub fn idle_keep_alive_header(idle_timeout: Duration) -> HeaderMap {
    let mut header = HeaderMap::with_capacity(1);
    add_idle_keep_alive(&mut header, idle_timeout);
    header
}

/// Advertise a little less than the real timeout so clients give up on the
/// connection before the proxy closes it under them.
pub fn add_idle_keep_alive(header: &mut HeaderMap, idle_timeout: Duration) {
    let secs = idle_timeout.as_secs();
    if secs == 0 {
        return;
    }
    let value = format!("timeout={}", secs.saturating_sub(2));
    if let Ok(value) = HeaderValue::from_str(&value) {
        header.insert(HeaderName::from_static("keep-alive"), value);
    }
}

/// Wraps a connection with an inactivity deadline shared by reads and writes.
pub struct IdleTimeoutConn<T> {
    inner: T,
    timeout: Duration,
    deadline: Pin<Box<Sleep>>,
}

impl<T> IdleTimeoutConn<T> {
    /// Wrap `inner`, closing it after `timeout` without reads or writes.
    pub fn new(inner: T, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            deadline: Box::pin(tokio::time::sleep(timeout)),
        }
    }

    fn touch(&mut self) {
        let next = Instant::now() + self.timeout;
        self.deadline.as_mut().reset(next);
    }

    fn poll_idle<R>(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<R>> {
        match self.deadline.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(idled())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for IdleTimeoutConn<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(res) => {
                this.touch();
                Poll::Ready(res)
            }
            Poll::Pending => this.poll_idle(cx),
        }
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for IdleTimeoutConn<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(res) => {
                this.touch();
                Poll::Ready(res)
            }
            Poll::Pending => this.poll_idle(cx),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn keep_alive_header_trails_the_idle_timeout() {
        let header = idle_keep_alive_header(Duration::from_secs(70));
        assert_eq!(header.len(), 1);
        assert_eq!(header["keep-alive"], "timeout=68");
    }

    #[test]
    fn keep_alive_header_omitted_without_idle_timeout() {
        assert!(idle_keep_alive_header(Duration::ZERO).is_empty());
        assert_eq!(idle_keep_alive_header(Duration::from_secs(1))["keep-alive"], "timeout=0");
    }

    #[test]
    fn idled_errors_are_recognised() {
        assert!(is_idled(&idled()));
        assert!(!is_idled(&io::Error::new(io::ErrorKind::TimedOut, "read timed out")));
        assert!(!is_idled(&io::Error::from(io::ErrorKind::TimedOut)));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_connection_idles_out() {
        let (client, _server) = tokio::io::duplex(64);
        let mut conn = IdleTimeoutConn::new(client, Duration::from_secs(5));

        let mut buf = [0u8; 8];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert!(is_idled(&err));
    }

    #[tokio::test(start_paused = true)]
    async fn traffic_keeps_connection_alive() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut conn = IdleTimeoutConn::new(client, Duration::from_secs(5));

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(3)).await;
            server.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
        }
    }
}
