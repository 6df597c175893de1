use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock};

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::pubsub::{EventKind, Subscription, Topic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LspState {
    Starting,
    Ready,
    Error,
    Disabled,
}

impl LspState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LspEventKind {
    StateChanged,
    DiagnosticsChanged,
}

/// Payload on the process-wide LSP topic. All projects publish here; the SSE
/// fan-out filters by server name against each instance's client set.
#[derive(Debug, Clone)]
pub struct LspEvent {
    pub kind: LspEventKind,
    pub name: String,
    pub state: LspState,
    pub error: Option<String>,
    pub diagnostic_count: usize,
}

#[derive(Debug, Clone)]
pub struct LspClient {
    pub name: String,
    pub state: LspState,
    pub diagnostic_count: usize,
}

/// The per-instance set of language-server clients. Iteration order is the
/// server-name order and stays stable across calls.
pub struct LspClientSet {
    clients: Mutex<BTreeMap<String, LspClient>>,
}

impl LspClientSet {
    /// Registers every enabled server from the project config in `starting`
    /// state and announces each on the global topic.
    pub fn from_config(config: &Config) -> Self {
        let set = Self {
            clients: Mutex::new(BTreeMap::new()),
        };
        for (name, server) in &config.lsp {
            if server.disabled {
                tracing::info!(name = %name, "skipping disabled lsp server");
                continue;
            }
            set.set_state(name, LspState::Starting, None);
        }
        set
    }

    pub fn names(&self) -> Vec<String> {
        self.clients
            .lock()
            .expect("lsp lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.clients
            .lock()
            .expect("lsp lock poisoned")
            .contains_key(name)
    }

    pub fn snapshot(&self) -> Vec<LspClient> {
        self.clients
            .lock()
            .expect("lsp lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn set_state(&self, name: &str, state: LspState, error: Option<String>) {
        let diagnostic_count = {
            let mut clients = self.clients.lock().expect("lsp lock poisoned");
            let client = clients.entry(name.to_string()).or_insert_with(|| LspClient {
                name: name.to_string(),
                state,
                diagnostic_count: 0,
            });
            client.state = state;
            client.diagnostic_count
        };
        publish_lsp_event(LspEvent {
            kind: LspEventKind::StateChanged,
            name: name.to_string(),
            state,
            error,
            diagnostic_count,
        });
    }

    pub fn set_diagnostics(&self, name: &str, diagnostic_count: usize) {
        let state = {
            let mut clients = self.clients.lock().expect("lsp lock poisoned");
            let Some(client) = clients.get_mut(name) else {
                return;
            };
            client.diagnostic_count = diagnostic_count;
            client.state
        };
        publish_lsp_event(LspEvent {
            kind: LspEventKind::DiagnosticsChanged,
            name: name.to_string(),
            state,
            error: None,
            diagnostic_count,
        });
    }

    pub fn close(&self) {
        self.clients.lock().expect("lsp lock poisoned").clear();
    }
}

fn global_topic() -> &'static Topic<LspEvent> {
    static TOPIC: OnceLock<Topic<LspEvent>> = OnceLock::new();
    TOPIC.get_or_init(Topic::new)
}

pub fn subscribe_lsp_events() -> Subscription<LspEvent> {
    global_topic().subscribe()
}

pub fn publish_lsp_event(event: LspEvent) {
    global_topic().publish(EventKind::Updated, event);
}

#[cfg(test)]
mod tests {
    use super::*;

    // The global topic is shared with concurrently running tests, so use a
    // name unique to this test and skip everything else.
    async fn recv_for(sub: &mut crate::pubsub::Subscription<LspEvent>, name: &str) -> LspEvent {
        loop {
            let event = sub.recv().await.expect("lsp topic open").payload;
            if event.name == name {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn state_changes_reach_the_global_topic() {
        let mut sub = subscribe_lsp_events();
        let set = LspClientSet {
            clients: Mutex::new(BTreeMap::new()),
        };
        set.set_state("topic-test-ls", LspState::Starting, None);
        set.set_state("topic-test-ls", LspState::Ready, None);
        set.set_diagnostics("topic-test-ls", 3);

        let first = recv_for(&mut sub, "topic-test-ls").await;
        assert_eq!(first.kind, LspEventKind::StateChanged);
        assert_eq!(first.state, LspState::Starting);

        let second = recv_for(&mut sub, "topic-test-ls").await;
        assert_eq!(second.state, LspState::Ready);

        let third = recv_for(&mut sub, "topic-test-ls").await;
        assert_eq!(third.kind, LspEventKind::DiagnosticsChanged);
        assert_eq!(third.diagnostic_count, 3);
    }

    #[test]
    fn iteration_order_is_stable() {
        let set = LspClientSet {
            clients: Mutex::new(BTreeMap::new()),
        };
        set.set_state("zls", LspState::Ready, None);
        set.set_state("gopls", LspState::Ready, None);
        set.set_state("rust-analyzer", LspState::Ready, None);

        assert_eq!(set.names(), vec!["gopls", "rust-analyzer", "zls"]);
        assert_eq!(set.names(), set.names());
    }

    #[test]
    fn diagnostics_for_unknown_server_are_ignored() {
        let set = LspClientSet {
            clients: Mutex::new(BTreeMap::new()),
        };
        set.set_diagnostics("ghost", 9);
        assert!(set.snapshot().is_empty());
    }
}
