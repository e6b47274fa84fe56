//! Stream wrapper that counts bytes as an upload body is consumed.

use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::{Duration, Instant};

/// Called with the running byte total.
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Counts the bytes yielded by `inner`, reporting the total periodically and once at the end.
pub struct ProgressStream<S> {
    inner: S,
    sent: Arc<AtomicU64>,
    last_report: Instant,
    callback: ProgressCallback,
}

impl<S> ProgressStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>>,
{
    pub fn new(inner: S, callback: ProgressCallback) -> Self {
        Self {
            inner,
            sent: Arc::new(AtomicU64::new(0)),
            last_report: Instant::now(),
            callback,
        }
    }

    /// Shared counter of bytes yielded so far; stays readable after the stream is consumed.
    pub fn counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.sent)
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin,
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = Pin::new(&mut self.inner).poll_next(cx);

        match &polled {
            Poll::Ready(Some(Ok(chunk))) => {
                let total = self.sent.fetch_add(chunk.len() as u64, Ordering::Relaxed)
                    + chunk.len() as u64;
                if self.last_report.elapsed() >= REPORT_INTERVAL {
                    self.last_report = Instant::now();
                    (self.callback)(total);
                }
            }
            Poll::Ready(None) => (self.callback)(self.sent.load(Ordering::Relaxed)),
            Poll::Ready(Some(Err(_))) | Poll::Pending => {}
        }

        polled
    }
}
