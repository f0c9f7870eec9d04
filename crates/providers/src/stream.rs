//! Lifecycle of one in-flight streamed completion.
//!
//! ```text
//! Idle -> Opening -> Streaming -> { Completed | Aborted | Failed }
//! ```
//!
//! Terminal states absorb: a [`StreamSession`] delivers exactly one terminal
//! event and drops everything sent after it. The response body is released
//! before that terminal event goes out, on every exit path.

use futures::{Stream, StreamExt};
use parlance_core::error::ProviderError;
use parlance_core::provider::{StreamEvent, Usage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::sse::SseDecoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Opening,
    Streaming,
    Completed,
    Aborted,
    Failed,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Failed)
    }
}

/// Sending half of a streamed completion, with the finalize-once guard.
pub struct StreamSession {
    tx: mpsc::Sender<StreamEvent>,
    state: StreamState,
}

impl StreamSession {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            tx,
            state: StreamState::Idle,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Move to a non-terminal state. Ignored once terminal.
    pub fn advance(&mut self, next: StreamState) {
        if !self.state.is_terminal() && !next.is_terminal() {
            self.state = next;
        }
    }

    /// Deliver a non-terminal event. Returns `false` if the session is
    /// already finished or the receiver has gone away.
    pub async fn emit(&self, event: StreamEvent) -> bool {
        if self.state.is_terminal() || event.is_terminal() {
            return false;
        }
        self.tx.send(event).await.is_ok()
    }

    /// Enter a terminal state and deliver its event. Only the first call has
    /// any effect.
    pub async fn finish(&mut self, state: StreamState, event: StreamEvent) -> bool {
        if self.state.is_terminal() {
            debug!(current = ?self.state, requested = ?state, "Stream already finalized");
            return false;
        }
        self.state = state;
        self.tx.send(event).await.is_ok()
    }

    pub async fn fail(&mut self, error: ProviderError) -> bool {
        warn!(error = %error, "Completion stream failed");
        self.finish(StreamState::Failed, StreamEvent::Error(error)).await
    }

    pub async fn abort(&mut self) -> bool {
        debug!("Completion stream cancelled");
        self.finish(StreamState::Aborted, StreamEvent::Aborted).await
    }
}

enum ReadOutcome {
    Ended,
    Cancelled,
    Detached,
    Failed(ProviderError),
}

/// Read `body` to the end, decoding frames into events on `session`.
///
/// Cancellation is checked before every read. The body is dropped before
/// the terminal event is delivered. Returns the final state.
pub async fn pump<S, B>(
    mut session: StreamSession,
    body: S,
    cancel: CancellationToken,
) -> StreamState
where
    S: Stream<Item = Result<B, ProviderError>> + Send,
    B: AsRef<[u8]>,
{
    session.advance(StreamState::Streaming);

    let mut body = Box::pin(body);
    let mut decoder = SseDecoder::new();
    let mut deltas = 0usize;

    let outcome = 'read: loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break 'read ReadOutcome::Cancelled,
            next = body.next() => next,
        };

        match next {
            None => break ReadOutcome::Ended,
            Some(Err(e)) => break ReadOutcome::Failed(e),
            Some(Ok(bytes)) => {
                for delta in decoder.push(bytes.as_ref()) {
                    deltas += 1;
                    if !session.emit(StreamEvent::Chunk(delta)).await {
                        break 'read ReadOutcome::Detached;
                    }
                }
                if decoder.is_finished() {
                    break ReadOutcome::Ended;
                }
            }
        }
    };

    drop(body);

    match outcome {
        ReadOutcome::Ended => {
            if !decoder.is_finished() {
                debug!("Response body closed without [DONE]");
            }
            let usage = decoder.latest_usage().unwrap_or_else(|| {
                warn!(deltas, "Stream finished without a usage frame; recording zero usage");
                Usage::default()
            });
            session.emit(StreamEvent::UsageFinal(usage)).await;
            session.finish(StreamState::Completed, StreamEvent::Done).await;
        }
        ReadOutcome::Cancelled => {
            session.abort().await;
        }
        ReadOutcome::Detached => {
            debug!(deltas, "Receiver dropped; abandoning stream");
            session.finish(StreamState::Aborted, StreamEvent::Aborted).await;
        }
        ReadOutcome::Failed(e) => {
            session.fail(e).await;
        }
    }

    session.state()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::{Context, Poll};
    use std::time::Duration;

    type Bytes = Vec<u8>;

    /// Wraps a stream and counts how many times it is dropped.
    struct DropCounter<S> {
        inner: S,
        drops: Arc<AtomicUsize>,
    }

    impl<S: Stream + Unpin> Stream for DropCounter<S> {
        type Item = S::Item;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            Pin::new(&mut self.inner).poll_next(cx)
        }
    }

    impl<S> Drop for DropCounter<S> {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn frames(parts: &[&str]) -> Vec<Result<Bytes, ProviderError>> {
        parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect()
    }

    async fn drain(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn chunk(event: &StreamEvent) -> Option<&str> {
        match event {
            StreamEvent::Chunk(text) => Some(text),
            _ => None,
        }
    }

    #[tokio::test]
    async fn four_frame_example_completes() {
        let (tx, rx) = mpsc::channel(16);
        let body = stream::iter(frames(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n",
            "data: {\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2,\"total_tokens\":7}}\n",
            "data: [DONE]\n",
        ]));

        let state = pump(StreamSession::new(tx), body, CancellationToken::new()).await;
        assert_eq!(state, StreamState::Completed);

        let events = drain(rx).await;
        assert_eq!(events.len(), 4);
        assert_eq!(chunk(&events[0]), Some("Hel"));
        assert_eq!(chunk(&events[1]), Some("lo"));
        assert!(matches!(events[2], StreamEvent::UsageFinal(u) if u == Usage::new(5, 2, 7)));
        assert!(matches!(events[3], StreamEvent::Done));
    }

    #[tokio::test]
    async fn stops_reading_at_sentinel() {
        let (tx, rx) = mpsc::channel(16);
        // Anything after [DONE] must never be polled.
        let body = stream::iter(frames(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\ndata: [DONE]\n",
        ]))
        .chain(stream::pending());

        let state = pump(StreamSession::new(tx), body, CancellationToken::new()).await;
        assert_eq!(state, StreamState::Completed);
        let events = drain(rx).await;
        assert!(matches!(events.last(), Some(StreamEvent::Done)));
    }

    #[tokio::test]
    async fn missing_usage_yields_zero() {
        let (tx, rx) = mpsc::channel(16);
        let body = stream::iter(frames(&["data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n"]));

        pump(StreamSession::new(tx), body, CancellationToken::new()).await;

        let events = drain(rx).await;
        assert_eq!(events.len(), 3);
        assert!(matches!(events[1], StreamEvent::UsageFinal(u) if u.is_zero()));
        assert!(matches!(events[2], StreamEvent::Done));
    }

    #[tokio::test]
    async fn body_error_fails_without_usage() {
        let (tx, rx) = mpsc::channel(16);
        let drops = Arc::new(AtomicUsize::new(0));
        let body = DropCounter {
            inner: stream::iter(vec![
                Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"par\"}}]}\n".to_vec()),
                Err(ProviderError::StreamInterrupted("connection reset".into())),
            ]),
            drops: drops.clone(),
        };

        let state = pump(StreamSession::new(tx), body, CancellationToken::new()).await;
        assert_eq!(state, StreamState::Failed);
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        let events = drain(rx).await;
        assert_eq!(events.len(), 2);
        assert_eq!(chunk(&events[0]), Some("par"));
        assert!(matches!(
            events[1],
            StreamEvent::Error(ProviderError::StreamInterrupted(_))
        ));
    }

    #[tokio::test]
    async fn cancel_mid_stream_aborts_once() {
        let (tx, mut rx) = mpsc::channel(16);
        let drops = Arc::new(AtomicUsize::new(0));
        let body = DropCounter {
            inner: stream::iter(frames(&[
                "data: {\"choices\":[{\"delta\":{\"content\":\"first\"}}]}\n",
                "data: {\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":1,\"total_tokens\":2}}\n",
            ]))
            .chain(stream::pending()),
            drops: drops.clone(),
        };
        let cancel = CancellationToken::new();

        let task = tokio::spawn(pump(StreamSession::new(tx), body, cancel.clone()));

        assert_eq!(
            rx.recv().await.as_ref().and_then(chunk),
            Some("first")
        );
        cancel.cancel();

        let state = task.await.unwrap();
        assert_eq!(state, StreamState::Aborted);
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        let rest = drain(rx).await;
        assert_eq!(rest.len(), 1);
        assert!(matches!(rest[0], StreamEvent::Aborted));
    }

    #[tokio::test]
    async fn cancelled_before_first_read() {
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let body = stream::iter(frames(&["data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n"]));

        let state = pump(StreamSession::new(tx), body, cancel).await;
        assert_eq!(state, StreamState::Aborted);
        let events = drain(rx).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Aborted));
    }

    #[tokio::test]
    async fn dropped_receiver_ends_stream() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let drops = Arc::new(AtomicUsize::new(0));
        let body = DropCounter {
            inner: stream::iter(frames(&["data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n"]))
                .chain(stream::pending()),
            drops: drops.clone(),
        };

        let state = tokio::time::timeout(
            Duration::from_secs(5),
            pump(StreamSession::new(tx), body, CancellationToken::new()),
        )
        .await
        .expect("pump should not hang");
        assert_eq!(state, StreamState::Aborted);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn finalize_once_guard() {
        let (tx, rx) = mpsc::channel(16);
        let mut session = StreamSession::new(tx);
        session.advance(StreamState::Opening);
        assert_eq!(session.state(), StreamState::Opening);

        assert!(session.finish(StreamState::Completed, StreamEvent::Done).await);
        assert!(!session.abort().await);
        assert!(!session.fail(ProviderError::Transport("late".into())).await);
        assert!(!session.emit(StreamEvent::Chunk("late".into())).await);
        session.advance(StreamState::Streaming);
        assert_eq!(session.state(), StreamState::Completed);
        drop(session);

        let events = drain(rx).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Done));
    }

    #[tokio::test]
    async fn emit_refuses_terminal_events() {
        let (tx, _rx) = mpsc::channel(16);
        let session = StreamSession::new(tx);
        assert!(!session.emit(StreamEvent::Done).await);
        assert_eq!(session.state(), StreamState::Idle);
    }
}
