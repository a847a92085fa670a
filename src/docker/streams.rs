use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};

pub type InputStream = Box<dyn AsyncRead + Send + Unpin>;
pub type OutputStream = Box<dyn AsyncWrite + Send + Unpin>;

/// A writer that several sessions can write into, e.g. a container-wide stdout
/// that every execution falls back to. Writes from different sessions may
/// interleave at write-call granularity.
#[derive(Clone)]
pub struct SharedSink {
    inner: Arc<Mutex<OutputStream>>,
}

impl SharedSink {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }

    pub fn stderr() -> Self {
        Self::new(tokio::io::stderr())
    }

    pub fn discard() -> Self {
        Self::new(tokio::io::sink())
    }
}

impl std::fmt::Debug for SharedSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSink").finish_non_exhaustive()
    }
}

impl AsyncWrite for SharedSink {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut guard = self.inner.lock();
        Pin::new(&mut **guard).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut guard = self.inner.lock();
        Pin::new(&mut **guard).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Shared sinks outlive any single session; only flush.
        let mut guard = self.inner.lock();
        Pin::new(&mut **guard).poll_flush(cx)
    }
}

/// In-memory capture buffer used by `Execution::output` and friends.
#[derive(Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner.lock().clone()
    }

    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.inner.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.inner.lock().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn shared_sink_clones_write_to_one_target() {
        let buffer = SharedBuffer::new();
        let sink = SharedSink::new(buffer.clone());

        let mut a = sink.clone();
        let mut b = sink;
        a.write_all(b"one ").await.unwrap();
        b.write_all(b"two").await.unwrap();
        a.shutdown().await.unwrap();
        b.write_all(b"!").await.unwrap();

        assert_eq!(buffer.contents(), b"one two!");
    }
}
