use std::collections::{HashSet, VecDeque};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::delta::DeltaTracker;
use crate::instance::ProjectInstance;
use crate::lsp::{self, LspEvent, LspEventKind};
use crate::message::Message;
use crate::pubsub::{Event, EventKind};
use crate::router::types::session_to_response_value;
use crate::session::Session;

pub(crate) const OUTBOUND_BUFFER: usize = 100;
pub(crate) const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// One SSE record before serialization: `event: <event>\ndata: <json>\n\n`.
#[derive(Debug, Clone)]
pub struct OutboundEvent {
    pub event: String,
    pub data: Value,
}

impl OutboundEvent {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn into_sse(self) -> SseEvent {
        let event = SseEvent::default().event(&self.event);
        event
            .json_data(&self.data)
            .unwrap_or_else(|_| SseEvent::default().data("{}"))
    }
}

enum FanoutEvent {
    Session(Event<Session>),
    Message(Event<Message>),
    Lsp(LspEvent),
}

/// Subscribes the connection to the instance's topics plus the process-wide
/// LSP topic and merges them into one bounded channel. One forwarder task per
/// upstream; each drops the newest event when the channel is full and exits
/// when its upstream closes or the receiver goes away. The merged channel
/// closes itself once the last forwarder has returned and dropped its sender.
fn spawn_forwarders(instance: &ProjectInstance) -> mpsc::Receiver<FanoutEvent> {
    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);

    let mut sessions = instance.sessions.subscribe();
    let sessions_tx = tx.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = sessions.recv() => match maybe {
                    Some(event) => {
                        if !forward(&sessions_tx, FanoutEvent::Session(event)) {
                            return;
                        }
                    }
                    None => return,
                },
                _ = sessions_tx.closed() => return,
            }
        }
    });

    let mut messages = instance.messages.subscribe();
    let messages_tx = tx.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = messages.recv() => match maybe {
                    Some(event) => {
                        if !forward(&messages_tx, FanoutEvent::Message(event)) {
                            return;
                        }
                    }
                    None => return,
                },
                _ = messages_tx.closed() => return,
            }
        }
    });

    // Name snapshot taken at subscription time; servers added to the
    // instance later are not observed by this connection. The LSP topic is
    // process-wide and never closes, so this worker also watches the
    // instance's closed signal.
    let lsp_names: HashSet<String> = instance.lsp_clients.names().into_iter().collect();
    let mut lsp_events = lsp::subscribe_lsp_events();
    let mut closed = instance.closed_signal();
    tokio::spawn(async move {
        if *closed.borrow() {
            return;
        }
        loop {
            tokio::select! {
                maybe = lsp_events.recv() => match maybe {
                    Some(event) => {
                        if !lsp_names.contains(&event.payload.name) {
                            continue;
                        }
                        if !forward(&tx, FanoutEvent::Lsp(event.payload)) {
                            return;
                        }
                    }
                    None => return,
                },
                _ = closed.changed() => return,
                _ = tx.closed() => return,
            }
        }
    });

    rx
}

/// Non-blocking send with drop-newest backpressure. Returns `false` once the
/// connection is gone.
fn forward(tx: &mpsc::Sender<FanoutEvent>, event: FanoutEvent) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => true,
        Err(TrySendError::Closed(_)) => false,
    }
}

struct WriterState {
    rx: mpsc::Receiver<FanoutEvent>,
    tracker: DeltaTracker,
    pending: VecDeque<OutboundEvent>,
}

/// The per-connection event stream: `server.connected` first, then the merged
/// topics with message events rewritten by the delta engine. Ends when the
/// instance shuts down; dropping it tears the forwarders down.
pub fn outbound_stream(instance: &ProjectInstance) -> impl Stream<Item = OutboundEvent> + Send {
    let state = WriterState {
        rx: spawn_forwarders(instance),
        tracker: DeltaTracker::new(),
        pending: VecDeque::new(),
    };

    let connected = OutboundEvent::new("server.connected", json!({ "status": "connected" }));
    stream::iter([connected]).chain(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((event, state));
            }
            match state.rx.recv().await {
                Some(FanoutEvent::Message(event)) => {
                    state.pending.extend(state.tracker.on_event(&event));
                }
                Some(FanoutEvent::Session(event)) => {
                    state.pending.push_back(session_event(&event));
                }
                Some(FanoutEvent::Lsp(event)) => {
                    state.pending.push_back(lsp_event(&event));
                }
                None => return None,
            }
        }
    }))
}

pub fn sse_response(
    instance: &Arc<ProjectInstance>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let stream = outbound_stream(instance).map(|event| Ok::<_, Infallible>(event.into_sse()));
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(HEARTBEAT_INTERVAL)
            .text("heartbeat"),
    )
}

fn session_event(event: &Event<Session>) -> OutboundEvent {
    match event.kind {
        EventKind::Created => OutboundEvent::new(
            "session.created",
            json!({ "info": session_to_response_value(&event.payload) }),
        ),
        EventKind::Updated => OutboundEvent::new(
            "session.updated",
            json!({ "info": session_to_response_value(&event.payload) }),
        ),
        EventKind::Deleted => OutboundEvent::new(
            "session.deleted",
            json!({ "sessionID": event.payload.id }),
        ),
    }
}

fn lsp_event(event: &LspEvent) -> OutboundEvent {
    match event.kind {
        LspEventKind::StateChanged => OutboundEvent::new(
            "lsp.server.state_changed",
            json!({
                "name": event.name,
                "state": event.state.as_str(),
                "error": event.error,
                "diagnostic_count": event.diagnostic_count,
            }),
        ),
        LspEventKind::DiagnosticsChanged => OutboundEvent::new(
            "lsp.client.diagnostics",
            json!({
                "serverID": event.name,
                "diagnostic_count": event.diagnostic_count,
            }),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CONFIG_FILE;
    use crate::instance::InstanceManager;
    use crate::lsp::LspState;
    use crate::registry::{default_data_dir, ProjectRegistry};

    const RECV_TIMEOUT: Duration = Duration::from_secs(2);

    struct Harness {
        _data_home: tempfile::TempDir,
        _project_dir: tempfile::TempDir,
        instance: Arc<ProjectInstance>,
        manager: Arc<InstanceManager>,
        path: String,
    }

    async fn harness(config_json: &str) -> Harness {
        let data_home = tempfile::tempdir().unwrap();
        let project_dir = tempfile::tempdir().unwrap();
        if !config_json.is_empty() {
            std::fs::write(project_dir.path().join(CONFIG_FILE), config_json).unwrap();
        }
        let registry = Arc::new(ProjectRegistry::open_at(data_home.path()).unwrap());
        let path = project_dir.path().to_string_lossy().to_string();
        registry.register(&path, &default_data_dir(&path)).unwrap();
        let manager = Arc::new(InstanceManager::new(registry));
        let instance = manager.get_or_create(&path).await.unwrap();
        Harness {
            _data_home: data_home,
            _project_dir: project_dir,
            instance,
            manager,
            path,
        }
    }

    async fn next_event<S>(stream: &mut S) -> OutboundEvent
    where
        S: Stream<Item = OutboundEvent> + Unpin,
    {
        tokio::time::timeout(RECV_TIMEOUT, stream.next())
            .await
            .expect("stream timed out")
            .expect("stream ended")
    }

    #[tokio::test]
    async fn connection_starts_with_server_connected() {
        let harness = harness("").await;
        let mut stream = Box::pin(outbound_stream(&harness.instance));

        let first = next_event(&mut stream).await;
        assert_eq!(first.event, "server.connected");
        assert_eq!(first.data["status"], "connected");
    }

    #[tokio::test]
    async fn session_lifecycle_flows_through_the_stream() {
        let harness = harness("").await;
        let mut stream = Box::pin(outbound_stream(&harness.instance));
        next_event(&mut stream).await;

        let session = harness.instance.sessions.create("fan-out").unwrap();
        let created = next_event(&mut stream).await;
        assert_eq!(created.event, "session.created");
        assert_eq!(created.data["info"]["id"], session.id.as_str());

        harness.instance.sessions.delete(&session.id).unwrap();
        let deleted = next_event(&mut stream).await;
        assert_eq!(deleted.event, "session.deleted");
        assert_eq!(deleted.data["sessionID"], session.id.as_str());
    }

    #[tokio::test]
    async fn lsp_events_are_filtered_to_the_instances_clients() {
        // Server names are unique to this test: the LSP topic is
        // process-wide and other tests publish on it concurrently.
        let own = harness(r#"{"lsp":{"fanout-own-ls":{"command":"fanout-own-ls"}}}"#).await;
        let mut stream = Box::pin(outbound_stream(&own.instance));
        next_event(&mut stream).await;
        tokio::task::yield_now().await;

        // Another project's server name must not reach this connection.
        lsp::publish_lsp_event(LspEvent {
            kind: LspEventKind::DiagnosticsChanged,
            name: "fanout-foreign-ls".to_string(),
            state: LspState::Ready,
            error: None,
            diagnostic_count: 4,
        });
        lsp::publish_lsp_event(LspEvent {
            kind: LspEventKind::DiagnosticsChanged,
            name: "fanout-own-ls".to_string(),
            state: LspState::Ready,
            error: None,
            diagnostic_count: 2,
        });

        let event = next_event(&mut stream).await;
        assert_eq!(event.event, "lsp.client.diagnostics");
        assert_eq!(event.data["serverID"], "fanout-own-ls");
        assert_eq!(event.data["diagnostic_count"], 2);
    }

    #[tokio::test]
    async fn slow_consumer_drops_newest_beyond_the_buffer() {
        let harness = harness("").await;
        let mut stream = Box::pin(outbound_stream(&harness.instance));
        next_event(&mut stream).await;
        tokio::task::yield_now().await;

        let session = harness.instance.sessions.create("burst").unwrap();
        next_event(&mut stream).await;

        let message = harness
            .instance
            .messages
            .create(&session.id, Default::default())
            .unwrap();
        next_event(&mut stream).await;

        // Publish far more updates than the outbound buffer without reading.
        for _ in 0..(OUTBOUND_BUFFER + 50) {
            harness
                .instance
                .messages
                .publish_for_test(EventKind::Updated, message.clone());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut snapshots = 0;
        loop {
            match tokio::time::timeout(Duration::from_millis(100), stream.next()).await {
                Ok(Some(event)) if event.event == "message.updated" => snapshots += 1,
                Ok(Some(_)) => {}
                _ => break,
            }
        }
        assert_eq!(snapshots, OUTBOUND_BUFFER);
    }

    #[tokio::test]
    async fn stream_ends_when_the_instance_is_disposed() {
        let harness = harness("").await;
        let mut stream = Box::pin(outbound_stream(&harness.instance));
        next_event(&mut stream).await;

        harness.manager.dispose_project(&harness.path).await.unwrap();
        let end = tokio::time::timeout(RECV_TIMEOUT, stream.next())
            .await
            .expect("stream should close");
        assert!(end.is_none());
    }
}
