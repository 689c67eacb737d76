//! Background result collection for fire-and-forget submissions.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::event::{extract_text, Event};
use crate::state::{SharedState, Status};
use crate::stream::EventStream;

/// Drain `stream` under the supervisor-owned `cancel` scope and store the
/// result once the run has ended successfully.
///
/// The caller that triggered the submission may go away; only `cancel`
/// stops the drain. A cancelled or failed run leaves the previously stored
/// result untouched.
pub(crate) fn spawn_result_drain<X: Send + 'static>(
    mut stream: EventStream,
    shared: Arc<SharedState<X>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let run_id = stream.run_id().to_owned();
        let Some(events) = collect_events(&mut stream, &cancel).await else {
            info!(run_id = %run_id, "submission drain cancelled; keeping previous result");
            return;
        };

        match stream.outcome() {
            Some(Status::Idle) => {
                let text = extract_text(&events);
                info!(run_id = %run_id, events = events.len(), "submission result stored");
                shared.store_result(&run_id, text, events);
            }
            outcome => {
                warn!(
                    run_id = %run_id,
                    outcome = ?outcome,
                    "submission did not complete; keeping previous result"
                );
            }
        }
    })
}

/// Every event until the stream closes, or `None` if `cancel` fires first.
pub(crate) async fn collect_events(
    stream: &mut EventStream,
    cancel: &CancellationToken,
) -> Option<Vec<Event>> {
    let mut events = Vec::new();
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            event = stream.next_event() => match event {
                Some(event) => events.push(event),
                None => return Some(events),
            },
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Overrides;
    use crate::metrics::NoopMetrics;
    use crate::persistent::PersistentProcess;
    use crate::process::{fake_agent, Process};
    use crate::prompter::{ExecutorOptions, Prompter};
    use crate::stream::{RunOutcome, QUEUE_CAPACITY};
    use crate::SupervisorError;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const SLOW_ANSWER: &str = r#"sleep 0.3; printf '%s\n' '{"type":"system","session_id":"s1"}' '{"type":"assistant","subtype":"text","text":"hi"}' '{"type":"result","result":"done","total_cost_usd":0.05}'"#;

    async fn wait_for_status<P: Prompter>(p: &P, status: Status) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while p.status().status != status {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("status never reached");
    }

    #[tokio::test]
    async fn submit_stores_result_and_completes() {
        let p = Process::new(fake_agent(SLOW_ANSWER), ExecutorOptions::default()).unwrap();
        p.submit("hello", &Overrides::default()).await.unwrap();

        let err = p.submit("again", &Overrides::default()).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Busy));

        wait_for_status(&p, Status::Completed).await;
        let snap = p.status();
        assert_eq!(snap.result_preview.as_deref(), Some("done"));
        assert_eq!(snap.session_id.as_deref(), Some("s1"));

        let detail = p.result_detail();
        assert_eq!(detail.text.as_deref(), Some("done"));
        assert_eq!(detail.events.len(), 3);
        assert_eq!(detail.events[0]["session_id"], "s1");
    }

    #[tokio::test]
    async fn busy_submit_leaves_previous_result_unchanged() {
        let script = r#"sleep 0.3; printf '{"type":"result","result":"answer"}\n'"#;
        let p = Process::new(fake_agent(script), ExecutorOptions::default()).unwrap();
        p.submit("first", &Overrides::default()).await.unwrap();
        wait_for_status(&p, Status::Completed).await;
        let before = p.result_detail();

        p.submit("second", &Overrides::default()).await.unwrap();
        let err = p.submit("third", &Overrides::default()).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Busy));
        assert_eq!(p.result_detail().text, before.text);
        assert_eq!(p.result_detail().completed_at, before.completed_at);
        p.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failed_run_keeps_previous_result() {
        let p = Process::new(fake_agent(SLOW_ANSWER), ExecutorOptions::default()).unwrap();
        p.submit("hello", &Overrides::default()).await.unwrap();
        wait_for_status(&p, Status::Completed).await;
        let before = p.result_detail();

        let failing = Process::new(
            fake_agent(r#"printf '{"type":"result","result":"partial"}\n'; exit 1"#),
            ExecutorOptions::default(),
        )
        .unwrap();
        failing.submit("x", &Overrides::default()).await.unwrap();
        wait_for_status(&failing, Status::Error).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(failing.result_detail().text, None);
        assert_eq!(p.result_detail(), before);
    }

    #[tokio::test]
    async fn persistent_submit_stores_result() {
        let script = r#"while read -r line; do printf '{"type":"result","result":"pong"}\n'; done"#;
        let p = PersistentProcess::new(fake_agent(script), ExecutorOptions::default()).unwrap();
        p.submit("ping", &Overrides::default()).await.unwrap();
        wait_for_status(&p, Status::Completed).await;
        assert_eq!(p.result_detail().text.as_deref(), Some("pong"));
        p.stop().await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_drain_stores_nothing() {
        let shared = Arc::new(SharedState::<()>::new("ephemeral", Arc::new(NoopMetrics)));
        let (_tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let stream = EventStream::from_channel(rx, RunOutcome::default());
        let cancel = CancellationToken::new();

        let drain = spawn_result_drain(stream, Arc::clone(&shared), cancel.clone());
        cancel.cancel();
        drain.await.unwrap();
        assert_eq!(shared.result_detail().text, None);
    }
}
