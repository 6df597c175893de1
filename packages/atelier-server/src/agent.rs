use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::sleep;

use atelier_error::AtelierError;

use crate::config::Config;
use crate::ids;
use crate::message::{ContentPart, CreateMessageParams, MessageService, Role};
use crate::session::SessionService;

/// Outcome of one completed agent run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub session_id: String,
    pub message_id: String,
}

/// The seam between the server core and the agent internals. The system
/// prompt is a first-class capability of the contract so callers never have
/// to reach into coordinator state.
#[async_trait]
pub trait AgentCoordinator: Send + Sync {
    /// Drives one prompt to completion: creates the user message, streams the
    /// assistant message through the message service, and appends the
    /// terminal finish part last.
    async fn run(&self, session_id: &str, prompt: &str) -> Result<RunResult, AtelierError>;

    /// Cancels every in-flight run on this coordinator. Coarser than a single
    /// session; see the abort endpoint notes.
    fn cancel_all(&self);

    fn system_prompt(&self) -> String;

    fn set_system_prompt(&self, prompt: String);
}

/// Builds the coordinator for a project, or `None` when the project has no
/// usable provider. Only the built-in mock provider is runnable in-process;
/// remote providers need an external runner and are reported unconfigured.
pub fn coordinator_from_config(
    config: &Config,
    sessions: Arc<SessionService>,
    messages: Arc<MessageService>,
) -> Option<Arc<dyn AgentCoordinator>> {
    if config.has_mock_provider() {
        return Some(Arc::new(MockCoordinator::new(sessions, messages)));
    }
    if config.is_configured() {
        tracing::warn!(
            "configured providers have no in-process runner; agent coordinator disabled"
        );
    }
    None
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful coding assistant.";
const STREAM_CHUNK_CHARS: usize = 8;
const STREAM_CHUNK_DELAY: Duration = Duration::from_millis(5);

/// Deterministic in-process agent used for development and tests. It echoes
/// the prompt back in chunks so delta streaming, finish gating, and
/// cancellation all have a real code path to exercise.
pub struct MockCoordinator {
    sessions: Arc<SessionService>,
    messages: Arc<MessageService>,
    system_prompt: RwLock<String>,
    runs: Arc<Mutex<HashMap<u64, AbortHandle>>>,
    next_run_id: AtomicU64,
}

impl MockCoordinator {
    pub fn new(sessions: Arc<SessionService>, messages: Arc<MessageService>) -> Self {
        Self {
            sessions,
            messages,
            system_prompt: RwLock::new(DEFAULT_SYSTEM_PROMPT.to_string()),
            runs: Arc::new(Mutex::new(HashMap::new())),
            next_run_id: AtomicU64::new(1),
        }
    }

    fn track(&self, handle: &JoinHandle<Result<RunResult, AtelierError>>) -> RunGuard {
        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        self.runs
            .lock()
            .expect("run lock poisoned")
            .insert(run_id, handle.abort_handle());
        RunGuard {
            run_id,
            runs: self.runs.clone(),
        }
    }
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct RunGuard {
    run_id: u64,
    runs: Arc<Mutex<HashMap<u64, AbortHandle>>>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.runs
            .lock()
            .expect("run lock poisoned")
            .remove(&self.run_id);
    }
}

#[async_trait]
impl AgentCoordinator for MockCoordinator {
    async fn run(&self, session_id: &str, prompt: &str) -> Result<RunResult, AtelierError> {
        let sessions = self.sessions.clone();
        let messages = self.messages.clone();
        let session_id = session_id.to_string();
        let prompt = prompt.to_string();

        let handle =
            tokio::spawn(
                async move { run_mock_turn(&sessions, &messages, &session_id, &prompt).await },
            );
        let _guard = self.track(&handle);
        // If this future is dropped (caller cancelled), the turn stops too.
        let _abort_on_drop = AbortOnDrop(handle.abort_handle());

        match handle.await {
            Ok(result) => result,
            // Run was aborted via cancel_all.
            Err(err) if err.is_cancelled() => Err(AtelierError::RequestCancelled),
            Err(err) => Err(AtelierError::internal(format!("agent run panicked: {err}"))),
        }
    }

    fn cancel_all(&self) {
        let runs = self.runs.lock().expect("run lock poisoned");
        let count = runs.len();
        for handle in runs.values() {
            handle.abort();
        }
        if count > 0 {
            tracing::info!(count, "cancelled in-flight agent runs");
        }
    }

    fn system_prompt(&self) -> String {
        self.system_prompt
            .read()
            .expect("system prompt lock poisoned")
            .clone()
    }

    fn set_system_prompt(&self, prompt: String) {
        *self
            .system_prompt
            .write()
            .expect("system prompt lock poisoned") = prompt;
    }
}

async fn run_mock_turn(
    sessions: &SessionService,
    messages: &MessageService,
    session_id: &str,
    prompt: &str,
) -> Result<RunResult, AtelierError> {
    let session = sessions.get(session_id)?;

    messages.create(
        session_id,
        CreateMessageParams {
            role: Some(Role::User),
            parts: vec![ContentPart::Text {
                text: prompt.to_string(),
            }],
            ..Default::default()
        },
    )?;

    let mut assistant = messages.create(
        session_id,
        CreateMessageParams {
            role: Some(Role::Assistant),
            parts: vec![ContentPart::Text {
                text: String::new(),
            }],
            model: Some("mock".to_string()),
            provider: Some("mock".to_string()),
            ..Default::default()
        },
    )?;

    let reply = if prompt.trim().is_empty() {
        "OK".to_string()
    } else {
        format!("mock: {prompt}")
    };

    // Stream by code points so multibyte prompts never split a character.
    let chars: Vec<char> = reply.chars().collect();
    for chunk in chars.chunks(STREAM_CHUNK_CHARS) {
        if let Some(ContentPart::Text { text }) = assistant.parts.first_mut() {
            text.extend(chunk.iter());
        }
        assistant = messages.update(assistant)?;
        sleep(STREAM_CHUNK_DELAY).await;
    }

    assistant.parts.push(ContentPart::Finish {
        reason: "end_turn".to_string(),
        time: ids::now_ms(),
        message: None,
        details: None,
    });
    let assistant = messages.update(assistant)?;

    let prompt_tokens = prompt.split_whitespace().count() as i64;
    let completion_tokens = reply.split_whitespace().count() as i64;
    let mut session = session;
    session.message_count += 2;
    session.prompt_tokens += prompt_tokens;
    session.completion_tokens += completion_tokens;
    session.cost += (prompt_tokens + completion_tokens) as f64 * 1e-6;
    sessions.save(session)?;

    Ok(RunResult {
        session_id: session_id.to_string(),
        message_id: assistant.id,
    })
}
