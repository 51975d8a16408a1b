//! Bidirectional byte relay for established tunnels.
//!
//! # Responsibilities
//! - Copy upstream → downstream and downstream → upstream concurrently
//! - Borrow one buffer per direction and always hand both back
//! - Always close the upstream connection, whatever the outcome
//! - Separate benign teardown from real transport failure
//!
//! # Error classification
//! ```text
//! downstream → upstream:  EOF, broken pipe, reset by peer   → ignored
//!                         anything else                      → RelayError::Read
//! upstream → downstream:  idled                              → ignored
//!                         anything else                      → RelayError::Write
//! ```
//! When both directions fail, the downstream → upstream error wins.
//!
//! # Design Decisions
//! - No timeout layer of its own: connections arrive already idle-timed
//! - Closing the downstream elsewhere unblocks both copy loops

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::connect::buffer::{BufferSource, MAX_DATA_LEN};
use crate::connect::dial::Dialer;
use crate::connect::idle::is_idled;
use crate::connect::BoxConn;
use crate::error::Error;
use crate::observability::metrics;

/// Transport failure while relaying a tunnel.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Failure on the side that reads from the client.
    #[error("error piping data to downstream: {0}")]
    Read(#[source] io::Error),
    /// Failure on the side that writes to the client.
    #[error("error piping data to upstream: {0}")]
    Write(#[source] io::Error),
}

/// Relays tunnel bytes using buffers from a shared [`BufferSource`].
#[derive(Clone)]
pub struct Relay {
    dialer: Arc<dyn Dialer>,
    buffers: Arc<dyn BufferSource>,
}

impl Relay {
    /// Create a relay that dials with `dialer` and borrows from `buffers`.
    pub fn new(dialer: Arc<dyn Dialer>, buffers: Arc<dyn BufferSource>) -> Self {
        Self { dialer, buffers }
    }

    /// Dial `addr` for a CONNECT tunnel, then [`copy`](Self::copy).
    pub async fn dial_and_copy<D>(&self, addr: &str, downstream: &mut D) -> Result<(), Error>
    where
        D: AsyncRead + AsyncWrite + Unpin,
    {
        let upstream = self
            .dialer
            .dial(true, "tcp", addr)
            .await
            .map_err(|source| {
                metrics::record_dial_failure();
                Error::Dial {
                    addr: addr.to_owned(),
                    source,
                }
            })?;
        self.copy(upstream, downstream).await?;
        Ok(())
    }

    /// Copy bytes both ways until each direction hits end-of-stream or an
    /// error. Takes ownership of `upstream` and closes it before returning.
    pub async fn copy<D>(&self, upstream: BoxConn, downstream: &mut D) -> Result<(), RelayError>
    where
        D: AsyncRead + AsyncWrite + Unpin,
    {
        let mut buf_out = Lease::new(self.buffers.as_ref());
        let mut buf_in = Lease::new(self.buffers.as_ref());

        let (mut up_read, mut up_write) = tokio::io::split(upstream);
        let (mut down_read, mut down_write) = tokio::io::split(&mut *downstream);

        let (to_upstream, to_downstream) = tokio::join!(
            pipe(&mut down_read, &mut up_write, buf_out.as_mut_slice()),
            pipe(&mut up_read, &mut down_write, buf_in.as_mut_slice()),
        );

        let mut upstream = up_read.unsplit(up_write);
        if let Err(e) = upstream.shutdown().await {
            tracing::trace!(error = %e, "Error closing upstream connection");
        }
        drop(upstream);

        tracing::debug!(
            bytes_to_upstream = to_upstream.0,
            bytes_to_downstream = to_downstream.0,
            "Tunnel closed"
        );
        metrics::record_relay_bytes("upstream", to_upstream.0);
        metrics::record_relay_bytes("downstream", to_downstream.0);

        classify(to_upstream.1, to_downstream.1)
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay").finish_non_exhaustive()
    }
}

fn classify(read: io::Result<()>, write: io::Result<()>) -> Result<(), RelayError> {
    if let Err(e) = read {
        if !is_benign_read_error(&e) {
            metrics::record_relay_error("upstream");
            return Err(RelayError::Read(e));
        }
    }
    if let Err(e) = write {
        if !is_idled(&e) {
            metrics::record_relay_error("downstream");
            return Err(RelayError::Write(e));
        }
    }
    Ok(())
}

// Structured kinds first. Some transports only report the reason in the
// message, hence the substring check.
fn is_benign_read_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
    ) || err.to_string().contains("broken pipe")
}

/// Copy until end-of-stream or error, then half-close the writer so the peer
/// sees end-of-stream too. Returns the bytes copied alongside the result.
async fn pipe<R, W>(reader: &mut R, writer: &mut W, buf: &mut [u8]) -> (u64, io::Result<()>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = 0u64;
    let result = loop {
        let n = match reader.read(buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            break Err(e);
        }
        if let Err(e) = writer.flush().await {
            break Err(e);
        }
        copied += n as u64;
    };
    let _ = writer.shutdown().await;
    (copied, result)
}

/// A buffer borrowed from a [`BufferSource`], returned when dropped.
struct Lease<'a> {
    source: &'a dyn BufferSource,
    buf: Option<Vec<u8>>,
}

impl<'a> Lease<'a> {
    fn new(source: &'a dyn BufferSource) -> Self {
        Self {
            source,
            buf: Some(source.get()),
        }
    }

    /// At most [`MAX_DATA_LEN`] bytes, whatever the source handed out.
    fn as_mut_slice(&mut self) -> &mut [u8] {
        let buf = self.buf.as_deref_mut().unwrap_or_default();
        let len = buf.len().min(MAX_DATA_LEN);
        &mut buf[..len]
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.source.put(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect::dial::dial_fn;
    use crate::connect::idle::idled;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    /// Counts buffers handed out and returned.
    #[derive(Default)]
    struct CountingBuffers {
        gets: AtomicUsize,
        puts: AtomicUsize,
    }

    impl BufferSource for CountingBuffers {
        fn get(&self) -> Vec<u8> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            vec![0; MAX_DATA_LEN]
        }

        fn put(&self, _buf: Vec<u8>) {
            self.puts.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Connection whose reads follow a script and then report end-of-stream.
    struct ScriptedConn {
        reads: VecDeque<io::Result<Vec<u8>>>,
        write_error: Option<fn() -> io::Error>,
        written: Arc<Mutex<Vec<u8>>>,
        largest_write: Arc<AtomicUsize>,
        shutdowns: Arc<AtomicUsize>,
        drops: Arc<AtomicUsize>,
    }

    impl ScriptedConn {
        fn new(reads: Vec<io::Result<Vec<u8>>>) -> Self {
            Self {
                reads: reads.into(),
                write_error: None,
                written: Arc::default(),
                largest_write: Arc::default(),
                shutdowns: Arc::default(),
                drops: Arc::default(),
            }
        }

        fn failing_writes(mut self, err: fn() -> io::Error) -> Self {
            self.write_error = Some(err);
            self
        }
    }

    impl AsyncRead for ScriptedConn {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.reads.pop_front() {
                Some(Ok(mut data)) => {
                    let n = data.len().min(buf.remaining());
                    let rest = data.split_off(n);
                    buf.put_slice(&data);
                    if !rest.is_empty() {
                        self.reads.push_front(Ok(rest));
                    }
                    Poll::Ready(Ok(()))
                }
                Some(Err(e)) => Poll::Ready(Err(e)),
                None => Poll::Ready(Ok(())),
            }
        }
    }

    impl AsyncWrite for ScriptedConn {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if let Some(err) = self.write_error {
                return Poll::Ready(Err(err()));
            }
            self.written.lock().unwrap().extend_from_slice(buf);
            self.largest_write.fetch_max(buf.len(), Ordering::SeqCst);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }
    }

    impl Drop for ScriptedConn {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn never_dials() -> Arc<dyn Dialer> {
        Arc::new(dial_fn(|_, _, addr| async move {
            Err::<BoxConn, _>(io::Error::other(format!("unexpected dial to {addr}")))
        }))
    }

    fn relay(buffers: &Arc<CountingBuffers>) -> Relay {
        Relay::new(never_dials(), buffers.clone())
    }

    fn broken_pipe() -> io::Error {
        io::Error::other("write tcp 10.0.0.1:443: broken pipe")
    }

    #[tokio::test]
    async fn relays_bytes_both_ways() {
        let buffers = Arc::new(CountingBuffers::default());
        let upstream = ScriptedConn::new(vec![Ok(b"pong".to_vec())]);
        let upstream_written = upstream.written.clone();
        let mut downstream = ScriptedConn::new(vec![Ok(b"ping".to_vec())]);

        relay(&buffers)
            .copy(Box::new(upstream), &mut downstream)
            .await
            .unwrap();

        assert_eq!(*upstream_written.lock().unwrap(), b"ping");
        assert_eq!(*downstream.written.lock().unwrap(), b"pong");
    }

    /// Hands out buffers far larger than a frame.
    struct OversizedBuffers;

    impl BufferSource for OversizedBuffers {
        fn get(&self) -> Vec<u8> {
            vec![0; 64 * 1024]
        }

        fn put(&self, _buf: Vec<u8>) {}
    }

    #[tokio::test]
    async fn writes_never_exceed_max_data_len() {
        let payload: Vec<u8> = (0..40_000u32).map(|i| i as u8).collect();
        let upstream = ScriptedConn::new(vec![Ok(payload.clone())]);
        let upstream_largest = upstream.largest_write.clone();
        let mut downstream = ScriptedConn::new(vec![Ok(vec![7; 20_000])]);

        Relay::new(never_dials(), Arc::new(OversizedBuffers))
            .copy(Box::new(upstream), &mut downstream)
            .await
            .unwrap();

        assert_eq!(*downstream.written.lock().unwrap(), payload);
        assert_eq!(downstream.largest_write.load(Ordering::SeqCst), MAX_DATA_LEN);
        assert_eq!(upstream_largest.load(Ordering::SeqCst), MAX_DATA_LEN);
    }

    #[tokio::test]
    async fn broken_pipe_from_downstream_is_benign() {
        let buffers = Arc::new(CountingBuffers::default());
        let upstream = ScriptedConn::new(vec![]);
        let upstream_drops = upstream.drops.clone();
        let upstream_shutdowns = upstream.shutdowns.clone();
        let mut downstream = ScriptedConn::new(vec![Err(broken_pipe())]);

        let result = relay(&buffers).copy(Box::new(upstream), &mut downstream).await;

        assert!(result.is_ok());
        assert_eq!(buffers.gets.load(Ordering::SeqCst), 2);
        assert_eq!(buffers.puts.load(Ordering::SeqCst), 2);
        assert_eq!(upstream_drops.load(Ordering::SeqCst), 1);
        assert!(upstream_shutdowns.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn structured_reset_from_downstream_is_benign() {
        let buffers = Arc::new(CountingBuffers::default());
        let upstream = ScriptedConn::new(vec![]);
        let mut downstream =
            ScriptedConn::new(vec![Err(io::Error::from(io::ErrorKind::ConnectionReset))]);

        let result = relay(&buffers).copy(Box::new(upstream), &mut downstream).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn idled_downstream_write_is_benign() {
        let buffers = Arc::new(CountingBuffers::default());
        let upstream = ScriptedConn::new(vec![Ok(b"late data".to_vec())]);
        let mut downstream = ScriptedConn::new(vec![]).failing_writes(idled);

        let result = relay(&buffers).copy(Box::new(upstream), &mut downstream).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn generic_downstream_read_error_is_reported() {
        let buffers = Arc::new(CountingBuffers::default());
        let upstream = ScriptedConn::new(vec![]);
        let upstream_drops = upstream.drops.clone();
        let mut downstream = ScriptedConn::new(vec![Err(io::Error::other("input/output error"))]);

        let err = relay(&buffers)
            .copy(Box::new(upstream), &mut downstream)
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Read(_)));
        assert!(err.to_string().contains("downstream"));
        assert!(err.to_string().contains("input/output error"));
        assert_eq!(upstream_drops.load(Ordering::SeqCst), 1);
        assert_eq!(buffers.puts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn generic_downstream_write_error_is_reported() {
        let buffers = Arc::new(CountingBuffers::default());
        let upstream = ScriptedConn::new(vec![Ok(b"data".to_vec())]);
        let mut downstream = ScriptedConn::new(vec![])
            .failing_writes(|| io::Error::from(io::ErrorKind::ConnectionAborted));

        let err = relay(&buffers)
            .copy(Box::new(upstream), &mut downstream)
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Write(_)));
        assert!(err.to_string().contains("upstream"));
    }

    #[tokio::test]
    async fn read_side_error_takes_priority() {
        let buffers = Arc::new(CountingBuffers::default());
        let upstream = ScriptedConn::new(vec![Ok(b"data".to_vec())]);
        let mut downstream = ScriptedConn::new(vec![Err(io::Error::other("read failed"))])
            .failing_writes(|| io::Error::other("write failed"));

        let err = relay(&buffers)
            .copy(Box::new(upstream), &mut downstream)
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Read(_)));
    }

    #[tokio::test]
    async fn dial_and_copy_dials_connect_target() {
        let buffers = Arc::new(CountingBuffers::default());
        let dialed = Arc::new(Mutex::new(Vec::new()));
        let seen = dialed.clone();
        let dialer = dial_fn(move |is_connect, network, addr| {
            seen.lock().unwrap().push((is_connect, network, addr));
            async move { Ok::<BoxConn, io::Error>(Box::new(ScriptedConn::new(vec![Ok(b"hello".to_vec())]))) }
        });
        let relay = Relay::new(Arc::new(dialer), buffers.clone());
        let mut downstream = ScriptedConn::new(vec![]);

        relay.dial_and_copy("example.com:443", &mut downstream).await.unwrap();

        assert_eq!(
            *dialed.lock().unwrap(),
            vec![(true, "tcp".to_string(), "example.com:443".to_string())]
        );
        assert_eq!(*downstream.written.lock().unwrap(), b"hello");
        assert_eq!(buffers.puts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dial_and_copy_surfaces_dial_errors() {
        let buffers = Arc::new(CountingBuffers::default());
        let dialer = dial_fn(|_, _, _| async {
            Err::<BoxConn, _>(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"))
        });
        let relay = Relay::new(Arc::new(dialer), buffers.clone());
        let mut downstream = ScriptedConn::new(vec![]);

        let err = relay.dial_and_copy("example.com:443", &mut downstream).await.unwrap_err();

        assert!(matches!(err, Error::Dial { .. }));
        assert_eq!(buffers.gets.load(Ordering::SeqCst), 0);
    }
}
