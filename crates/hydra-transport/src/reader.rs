//! Idle-aware stream reader.
//!
//! Wraps a response body stream so that (a) client cancellation unblocks any
//! pending read immediately and (b) an upstream that goes silent past the
//! idle timeout is cut off instead of pinning the connection forever. After
//! close, reads return end-of-stream; close is idempotent.

use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Default silence budget before the watchdog cuts the stream.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Why the reader stopped before natural end-of-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The caller's context was cancelled (client went away).
    Cancelled,
    /// No bytes arrived within the idle timeout.
    IdleTimeout,
}

type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>>;

pub struct StreamReader {
    stream: Option<BodyStream>,
    cancel: CancellationToken,
    idle_timeout: Duration,
    check_interval: Duration,
    last_read: Instant,
    close_reason: Option<CloseReason>,
}

impl StreamReader {
    pub fn from_response(
        response: reqwest::Response,
        idle_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self::from_stream(
            response.bytes_stream().map(|r| r.map_err(|e| e.to_string())),
            idle_timeout,
            cancel,
        )
    }

    pub fn from_stream<S>(stream: S, idle_timeout: Duration, cancel: CancellationToken) -> Self
    where
        S: Stream<Item = Result<Bytes, String>> + Send + 'static,
    {
        // Watchdog granularity: a quarter of the timeout, clamped to 10–30 s.
        let check_interval = (idle_timeout / 4)
            .max(Duration::from_secs(10))
            .min(Duration::from_secs(30));
        Self {
            stream: Some(Box::pin(stream)),
            cancel,
            idle_timeout,
            check_interval,
            last_read: Instant::now(),
            close_reason: None,
        }
    }

    /// Next body chunk. `None` is end-of-stream: natural EOF, cancellation,
    /// or an idle trip; `close_reason()` says which of the latter two.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, String>> {
        enum Step {
            Cancelled,
            WatchdogTick,
            Body(Option<Result<Bytes, String>>),
        }

        loop {
            let Some(stream) = self.stream.as_mut() else {
                return None;
            };
            let step = tokio::select! {
                _ = self.cancel.cancelled() => Step::Cancelled,
                _ = tokio::time::sleep(self.check_interval) => Step::WatchdogTick,
                chunk = stream.next() => Step::Body(chunk),
            };
            match step {
                Step::Cancelled => {
                    self.close(CloseReason::Cancelled);
                    return None;
                }
                Step::WatchdogTick => {
                    if self.last_read.elapsed() >= self.idle_timeout {
                        warn!(
                            idle_secs = self.last_read.elapsed().as_secs(),
                            "stream idle timeout, closing body"
                        );
                        self.close(CloseReason::IdleTimeout);
                        return None;
                    }
                    // Not idle long enough yet; keep waiting on the body.
                }
                Step::Body(Some(result)) => {
                    if result.is_ok() {
                        self.last_read = Instant::now();
                    }
                    return Some(result);
                }
                Step::Body(None) => {
                    // Natural EOF: drop the body, no close reason.
                    self.stream = None;
                    return None;
                }
            }
        }
    }

    /// Idempotent close; drops the body, which aborts any pending transfer.
    pub fn close(&mut self, reason: CloseReason) {
        if self.stream.take().is_some() {
            self.close_reason = Some(reason);
        }
    }

    /// Set when the stream was cut short; `None` after a natural EOF.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::wrappers::ReceiverStream;

    type ChunkSender = tokio::sync::mpsc::Sender<Result<Bytes, String>>;

    fn channel_stream() -> (ChunkSender, ReceiverStream<Result<Bytes, String>>) {
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        (tx, ReceiverStream::new(rx))
    }

    #[tokio::test]
    async fn reads_until_natural_eof() {
        let (tx, rx) = channel_stream();
        let mut reader =
            StreamReader::from_stream(rx, DEFAULT_IDLE_TIMEOUT, CancellationToken::new());

        tx.send(Ok(Bytes::from_static(b"one"))).await.unwrap();
        tx.send(Ok(Bytes::from_static(b"two"))).await.unwrap();
        drop(tx);

        assert_eq!(reader.next_chunk().await.unwrap().unwrap(), "one");
        assert_eq!(reader.next_chunk().await.unwrap().unwrap(), "two");
        assert!(reader.next_chunk().await.is_none());
        assert_eq!(reader.close_reason(), None);
    }

    #[tokio::test]
    async fn cancellation_unblocks_pending_read() {
        let (_tx, rx) = channel_stream();
        let cancel = CancellationToken::new();
        let mut reader = StreamReader::from_stream(rx, DEFAULT_IDLE_TIMEOUT, cancel.clone());

        let handle = tokio::spawn(async move {
            let chunk = reader.next_chunk().await;
            (chunk.is_none(), reader.close_reason())
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let (eof, reason) = handle.await.unwrap();
        assert!(eof);
        assert_eq!(reason, Some(CloseReason::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_watchdog_trips_after_timeout() {
        let (_tx, rx) = channel_stream();
        let mut reader = StreamReader::from_stream(
            rx,
            Duration::from_secs(300),
            CancellationToken::new(),
        );
        // Paused clock: the next watchdog check after the timeout fires it.
        assert!(reader.next_chunk().await.is_none());
        assert_eq!(reader.close_reason(), Some(CloseReason::IdleTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_bytes_reset_the_watchdog() {
        let (tx, rx) = channel_stream();
        let mut reader = StreamReader::from_stream(
            rx,
            Duration::from_secs(300),
            CancellationToken::new(),
        );
        let sender = tokio::spawn(async move {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_secs(100)).await;
                if tx.send(Ok(Bytes::from_static(b"tick"))).await.is_err() {
                    return;
                }
            }
            // Then go silent past the timeout, keeping the stream open so
            // the watchdog (not EOF) ends it.
            tokio::time::sleep(Duration::from_secs(400)).await;
            drop(tx);
        });
        for _ in 0..3 {
            let chunk = reader.next_chunk().await;
            assert!(chunk.is_some(), "stream stayed alive while bytes flowed");
        }
        assert!(reader.next_chunk().await.is_none());
        assert_eq!(reader.close_reason(), Some(CloseReason::IdleTimeout));
        sender.await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_reads_return_eof() {
        let (tx, rx) = channel_stream();
        let mut reader =
            StreamReader::from_stream(rx, DEFAULT_IDLE_TIMEOUT, CancellationToken::new());
        reader.close(CloseReason::IdleTimeout);
        reader.close(CloseReason::Cancelled);
        assert_eq!(reader.close_reason(), Some(CloseReason::IdleTimeout));

        tx.send(Ok(Bytes::from_static(b"late"))).await.unwrap();
        assert!(reader.next_chunk().await.is_none());
    }
}
