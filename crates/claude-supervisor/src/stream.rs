use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::event::Event;
use crate::state::Status;

/// Capacity of every per-run event queue.
pub(crate) const QUEUE_CAPACITY: usize = 32;

// ─── EventStream ──────────────────────────────────────────────────────────

/// An async stream of [`Event`]s from one run, in the order the agent
/// emitted them.
///
/// Backed by a bounded Tokio mpsc channel. Dropping the stream cancels the
/// run's publish token, so the producer never blocks on a consumer that
/// will not read again; the run itself keeps going.
///
/// ```rust,ignore
/// use futures::StreamExt;
///
/// let mut stream = executor.run("say hello").await?;
/// while let Some(event) = stream.next().await {
///     println!("{}", event.raw);
/// }
/// ```
pub struct EventStream {
    rx: mpsc::Receiver<Event>,
    run_id: String,
    outcome: RunOutcome,
    publish_cancel: CancellationToken,
}

impl EventStream {
    pub(crate) fn new(
        rx: mpsc::Receiver<Event>,
        run_id: String,
        outcome: RunOutcome,
        publish_cancel: CancellationToken,
    ) -> Self {
        Self {
            rx,
            run_id,
            outcome,
            publish_cancel,
        }
    }

    /// Next event, or `None` once the run's queue is closed.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Id of the run this stream belongs to.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// How the run ended. `None` until the executor has classified it.
    pub fn outcome(&self) -> Option<Status> {
        self.outcome.get()
    }

    /// Test-only constructor: wrap a raw mpsc receiver as an `EventStream`.
    #[cfg(test)]
    pub(crate) fn from_channel(rx: mpsc::Receiver<Event>, outcome: RunOutcome) -> Self {
        Self::new(rx, "test-run".into(), outcome, CancellationToken::new())
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("run_id", &self.run_id)
            .field("outcome", &self.outcome.get())
            .finish_non_exhaustive()
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.publish_cancel.cancel();
    }
}

/// Send `event`, giving up as soon as `cancel` fires or the consumer is gone.
///
/// Returns `false` when the event was not delivered.
pub(crate) async fn publish(
    tx: &mpsc::Sender<Event>,
    event: Event,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

// ─── RunOutcome ───────────────────────────────────────────────────────────

/// Final status of one run, set exactly once by the executor before the
/// run's queue closes.
#[derive(Debug, Clone, Default)]
pub struct RunOutcome(Arc<OnceLock<Status>>);

impl RunOutcome {
    pub(crate) fn set(&self, status: Status) {
        let _ = self.0.set(status);
    }

    pub fn get(&self) -> Option<Status> {
        self.0.get().copied()
    }
}

// ─── DoneSignal ───────────────────────────────────────────────────────────

/// Completion marker of one run. Any number of waiters may observe it.
#[derive(Debug, Clone, Default)]
pub struct DoneSignal(CancellationToken);

impl DoneSignal {
    pub(crate) fn new() -> Self {
        Self(CancellationToken::new())
    }

    /// A signal that has already fired; returned when nothing is running.
    pub(crate) fn fired() -> Self {
        let signal = Self::new();
        signal.notify();
        signal
    }

    pub(crate) fn notify(&self) {
        self.0.cancel();
    }

    pub fn is_done(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Resolve once the run has finished.
    pub async fn wait(&self) {
        self.0.cancelled().await;
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::decode_line;
    use futures::StreamExt;
    use std::time::Duration;

    fn event(line: &str) -> Event {
        decode_line(line).unwrap().unwrap()
    }

    #[tokio::test]
    async fn stream_yields_events_in_order() {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let outcome = RunOutcome::default();
        let stream = EventStream::from_channel(rx, outcome.clone());

        tokio::spawn(async move {
            for text in ["a", "b", "c"] {
                let line = format!(r#"{{"type":"assistant","subtype":"text","text":"{text}"}}"#);
                tx.send(event(&line)).await.unwrap();
            }
            outcome.set(Status::Idle);
        });

        let events: Vec<Event> = stream.collect().await;
        let texts: Vec<&str> = events.iter().map(|e| e.raw.as_str()).collect();
        assert_eq!(texts.len(), 3);
        assert!(texts[0].contains(r#""a""#));
        assert!(texts[2].contains(r#""c""#));
    }

    #[tokio::test]
    async fn publish_unblocks_on_cancel() {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        assert!(publish(&tx, event(r#"{"type":"system","session_id":"s"}"#), &cancel).await);

        // Queue is full and nobody reads; cancellation must release the sender.
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            c.cancel();
        });
        let delivered = tokio::time::timeout(
            Duration::from_secs(5),
            publish(&tx, event(r#"{"type":"system","session_id":"s"}"#), &cancel),
        )
        .await
        .expect("publish hung after cancellation");
        assert!(!delivered);
    }

    #[tokio::test]
    async fn dropping_stream_cancels_publisher() {
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let stream = EventStream::new(rx, "r1".into(), RunOutcome::default(), cancel.clone());
        drop(stream);
        assert!(cancel.is_cancelled());
        assert!(!publish(&tx, event(r#"{"type":"system","session_id":"s"}"#), &cancel).await);
    }

    #[test]
    fn outcome_is_set_once() {
        let outcome = RunOutcome::default();
        assert_eq!(outcome.get(), None);
        outcome.set(Status::Idle);
        outcome.set(Status::Error);
        assert_eq!(outcome.get(), Some(Status::Idle));
    }

    #[tokio::test]
    async fn fired_signal_resolves_immediately() {
        let done = DoneSignal::fired();
        assert!(done.is_done());
        tokio::time::timeout(Duration::from_millis(100), done.wait())
            .await
            .expect("fired signal must not block");
    }

    #[test]
    fn debug_shows_run_id() {
        let (_tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let stream = EventStream::from_channel(rx, RunOutcome::default());
        let printed = format!("{stream:?}");
        assert!(printed.contains("test-run"), "{printed}");
    }
}
