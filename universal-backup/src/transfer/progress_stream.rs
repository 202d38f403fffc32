//! Stream wrapper that reports bytes seen so far.
//!
//! Wraps the `ReaderStream`s feeding captures, uploads and downloads. The
//! callback fires at most every [`REPORT_EVERY`] while chunks flow, and once
//! more with the final total when the stream ends.

use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::{Duration, Instant};

/// Receives the running byte count
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

pub const REPORT_EVERY: Duration = Duration::from_millis(250);

pub struct ProgressStream<S> {
    inner: S,
    seen: u64,
    last_report: Instant,
    callback: ProgressCallback,
}

impl<S> ProgressStream<S> {
    pub fn new(inner: S, callback: ProgressCallback) -> Self {
        Self {
            inner,
            seen: 0,
            last_report: Instant::now(),
            callback,
        }
    }

    fn report_if_due(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_report) >= REPORT_EVERY {
            (self.callback)(self.seen);
            self.last_report = now;
        }
    }
}

impl<S, E> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_next(cx);

        match &polled {
            Poll::Ready(Some(Ok(chunk))) => {
                this.seen += chunk.len() as u64;
                this.report_if_due();
            }
            Poll::Ready(None) => (this.callback)(this.seen),
            _ => {}
        }
        polled
    }
}
