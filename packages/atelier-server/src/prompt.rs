use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_stream::wrappers::ReceiverStream;

use atelier_error::AtelierError;

use crate::events::{OutboundEvent, OUTBOUND_BUFFER};
use crate::instance::ProjectInstance;
use crate::message::{Message, Role};
use crate::router::types::{message_to_response_value, session_to_response_value};

/// Hard ceiling for one prompt-to-completion cycle.
pub(crate) const PROMPT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Grace window after the finish part, absorbing trailing updates.
pub(crate) const FINISH_WAIT_DELAY: Duration = Duration::from_millis(200);
/// How long the streaming variant waits for final updates after the run ends.
const MESSAGE_WAIT_DELAY: Duration = Duration::from_millis(500);

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs one prompt to completion and returns the terminal assistant message.
///
/// The agent's `run` result and the terminal finish part are not synchronized
/// by the agent internals, so the finish part on the message stream is the
/// ground truth for completion. Run completion without a finish part only
/// flips a flag and the loop keeps waiting.
pub async fn run_sync_prompt(
    instance: &Arc<ProjectInstance>,
    session_id: &str,
    prompt: &str,
) -> Result<Message, AtelierError> {
    let coordinator = instance
        .coordinator
        .clone()
        .ok_or(AtelierError::AgentNotConfigured)?;

    let mut events = instance.messages.subscribe();

    let (done_tx, mut done_rx) = oneshot::channel();
    let run = {
        let session_id = session_id.to_string();
        let prompt = prompt.to_string();
        tokio::spawn(async move {
            let result = coordinator.run(&session_id, &prompt).await;
            if let Err(err) = &result {
                tracing::error!(session_id = %session_id, error = %err, "agent run failed");
            }
            let _ = done_tx.send(result);
        })
    };
    let _abort_on_drop = AbortOnDrop(run);

    let deadline = sleep(PROMPT_TIMEOUT);
    tokio::pin!(deadline);

    let mut run_completed = false;
    let mut assistant: Option<Message> = None;

    loop {
        tokio::select! {
            _ = &mut deadline => return Err(AtelierError::Timeout),

            result = &mut done_rx, if !run_completed => {
                run_completed = true;
                match result {
                    Ok(Ok(_)) => {
                        tracing::debug!(session_id = %session_id, "agent run completed, waiting for finish part");
                    }
                    Ok(Err(err)) => return Err(err),
                    // The run task was torn down before reporting back.
                    Err(_) => return Err(AtelierError::RequestCancelled),
                }
            }

            maybe = events.recv() => {
                let Some(event) = maybe else {
                    // Instance shut down underneath the request.
                    return Err(AtelierError::RequestCancelled);
                };
                let message = event.payload;
                if message.session_id != session_id || message.role != Role::Assistant {
                    continue;
                }
                let finished = message.finish_part().is_some();
                assistant = Some(message);
                if finished {
                    sleep(FINISH_WAIT_DELAY).await;
                    // Absorb updates that landed inside the grace window.
                    while let Some(event) = events.try_recv() {
                        let message = event.payload;
                        if message.session_id == session_id && message.role == Role::Assistant {
                            assistant = Some(message);
                        }
                    }
                    return Ok(assistant.expect("assistant message recorded"));
                }
                if run_completed {
                    tracing::debug!(session_id = %session_id, "run completed but message not finished yet");
                }
            }
        }
    }
}

/// Streaming variant of the prompt cycle: emits `message.updated` snapshots
/// while the assistant message grows and a final `message.created` carrying
/// the message plus the refreshed session. Same timeout, grace, and
/// cancellation semantics as the synchronous path.
pub fn stream_prompt(
    instance: Arc<ProjectInstance>,
    session_id: String,
    prompt: String,
) -> impl Stream<Item = OutboundEvent> {
    let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
    tokio::spawn(async move {
        drive_stream_prompt(instance, session_id, prompt, tx).await;
    });
    ReceiverStream::new(rx)
}

async fn drive_stream_prompt(
    instance: Arc<ProjectInstance>,
    session_id: String,
    prompt: String,
    tx: mpsc::Sender<OutboundEvent>,
) {
    if tx
        .send(OutboundEvent::new("start", json!({})))
        .await
        .is_err()
    {
        return;
    }

    let Some(coordinator) = instance.coordinator.clone() else {
        let _ = tx
            .send(error_event(&AtelierError::AgentNotConfigured))
            .await;
        return;
    };

    let mut events = instance.messages.subscribe();

    let (done_tx, mut done_rx) = oneshot::channel();
    let run = {
        let session_id = session_id.clone();
        let prompt = prompt.clone();
        tokio::spawn(async move {
            let _ = done_tx.send(coordinator.run(&session_id, &prompt).await);
        })
    };
    let _abort_on_drop = AbortOnDrop(run);

    let deadline = sleep(PROMPT_TIMEOUT);
    tokio::pin!(deadline);

    let mut run_completed = false;
    let mut assistant: Option<Message> = None;
    let mut sent_chars = 0usize;
    let mut failure: Option<AtelierError> = None;

    loop {
        tokio::select! {
            _ = &mut deadline => {
                failure = Some(AtelierError::Timeout);
                break;
            }

            result = &mut done_rx, if !run_completed => {
                run_completed = true;
                match result {
                    Ok(Ok(_)) => {
                        sleep(MESSAGE_WAIT_DELAY).await;
                        break;
                    }
                    Ok(Err(err)) => {
                        failure = Some(err);
                        break;
                    }
                    Err(_) => {
                        failure = Some(AtelierError::RequestCancelled);
                        break;
                    }
                }
            }

            maybe = events.recv() => {
                let Some(event) = maybe else {
                    failure = Some(AtelierError::RequestCancelled);
                    break;
                };
                let message = event.payload;
                if message.session_id != session_id || message.role != Role::Assistant {
                    continue;
                }

                let chars = message.content().chars().count();
                let finished = message.finish_part().is_some();
                assistant = Some(message.clone());

                if chars > sent_chars {
                    sent_chars = chars;
                    let snapshot = OutboundEvent::new(
                        "message.updated",
                        json!({ "info": message_to_response_value(&message) }),
                    );
                    if tx.send(snapshot).await.is_err() {
                        return;
                    }
                }

                if finished {
                    sleep(FINISH_WAIT_DELAY).await;
                    break;
                }
            }
        }
    }

    if let Some(err) = failure {
        let _ = tx.send(error_event(&err)).await;
        return;
    }

    let Some(assistant) = assistant else {
        let _ = tx
            .send(error_event(&AtelierError::internal(
                "run finished without an assistant message",
            )))
            .await;
        return;
    };

    let session = instance.sessions.get(&session_id).ok();
    let mut data = json!({ "info": message_to_response_value(&assistant) });
    if let Some(session) = session {
        data["session"] = session_to_response_value(&session);
    }
    let _ = tx.send(OutboundEvent::new("message.created", data)).await;
}

fn error_event(err: &AtelierError) -> OutboundEvent {
    let body = err.to_body();
    OutboundEvent::new(
        "error",
        json!({
            "code": body.error.code,
            "message": body.error.message,
        }),
    )
}
