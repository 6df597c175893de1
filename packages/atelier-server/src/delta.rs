use std::collections::HashMap;

use serde_json::json;

use crate::events::OutboundEvent;
use crate::message::{part_json, ContentPart, Message};
use crate::pubsub::{Event, EventKind};
use crate::router::types::message_to_response_value;

/// Last-sent bookkeeping for one message on one connection.
#[derive(Debug, Default)]
struct MessagePartState {
    /// part index → Unicode code points already sent
    lengths: HashMap<usize, usize>,
    /// parts observed on the most recent update, gating first-observation
    /// events for non-text parts
    parts_count: usize,
}

/// Turns message topic events into minimal `message.part.updated` deltas plus
/// full snapshots. State is per connection and grows with the messages it has
/// seen; a `Deleted` event releases the message's entry.
#[derive(Debug, Default)]
pub struct DeltaTracker {
    states: HashMap<String, MessagePartState>,
}

impl DeltaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_event(&mut self, event: &Event<Message>) -> Vec<OutboundEvent> {
        let message = &event.payload;
        match event.kind {
            EventKind::Created => {
                self.states
                    .insert(message.id.clone(), MessagePartState::default());
                vec![OutboundEvent::new(
                    "message.created",
                    json!({ "info": message_to_response_value(message) }),
                )]
            }
            EventKind::Updated => self.on_update(message),
            EventKind::Deleted => {
                self.states.remove(&message.id);
                vec![OutboundEvent::new(
                    "message.removed",
                    json!({
                        "messageID": message.id,
                        "sessionID": message.session_id,
                    }),
                )]
            }
        }
    }

    fn on_update(&mut self, message: &Message) -> Vec<OutboundEvent> {
        let state = self.states.entry(message.id.clone()).or_default();
        let mut out = Vec::new();

        for (index, part) in message.parts.iter().enumerate() {
            match part {
                ContentPart::Text { text } => {
                    if let Some(delta) = next_delta(state, index, text) {
                        out.push(part_updated(message, index, part, &delta));
                    }
                }
                ContentPart::Reasoning { thinking, .. } => {
                    if let Some(delta) = next_delta(state, index, thinking) {
                        out.push(part_updated(message, index, part, &delta));
                    }
                }
                ContentPart::ToolCall { .. } | ContentPart::Finish { .. } => {
                    if index >= state.parts_count {
                        out.push(part_updated(message, index, part, ""));
                    }
                }
                _ => {}
            }
        }

        state.parts_count = message.parts.len();

        // Full snapshot after the deltas so clients that cannot reconstruct
        // incrementally stay consistent.
        out.push(OutboundEvent::new(
            "message.updated",
            json!({ "info": message_to_response_value(message) }),
        ));
        out
    }
}

/// Code-point delta against the recorded length. Slicing by `char` keeps
/// multibyte characters intact.
fn next_delta(state: &mut MessagePartState, index: usize, text: &str) -> Option<String> {
    let last = state.lengths.get(&index).copied().unwrap_or(0);
    let current = text.chars().count();
    if current <= last {
        return None;
    }
    state.lengths.insert(index, current);
    Some(text.chars().skip(last).collect())
}

fn part_updated(message: &Message, index: usize, part: &ContentPart, delta: &str) -> OutboundEvent {
    OutboundEvent::new(
        "message.part.updated",
        json!({
            "messageID": message.id,
            "sessionID": message.session_id,
            "partIndex": index,
            "part": part_json(&message.id, index, part),
            "delta": delta,
        }),
    )
}
