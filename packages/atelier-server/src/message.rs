use std::sync::Arc;

use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use atelier_error::AtelierError;

use crate::db::Database;
use crate::ids;
use crate::pubsub::{EventKind, Subscription, Topic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "assistant" => Self::Assistant,
            "tool" => Self::Tool,
            _ => Self::User,
        }
    }
}

/// One entry of a message's ordered part list. A message is complete exactly
/// when it carries a `Finish` part; at most one is ever appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Reasoning {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        started_at: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        finished_at: Option<i64>,
    },
    Binary {
        path: String,
        mime_type: String,
        /// base64 payload, kept encoded end to end
        data: String,
    },
    ImageUrl {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    ToolCall {
        id: String,
        name: String,
        input: String,
        finished: bool,
        provider_executed: bool,
    },
    ToolResult {
        tool_call_id: String,
        name: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        is_error: bool,
    },
    Finish {
        reason: String,
        time: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub is_summary: bool,
    pub parts: Vec<ContentPart>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Message {
    pub fn finish_part(&self) -> Option<&ContentPart> {
        self.parts
            .iter()
            .find(|part| matches!(part, ContentPart::Finish { .. }))
    }

    pub fn finish_reason(&self) -> Option<&str> {
        match self.finish_part() {
            Some(ContentPart::Finish { reason, .. }) => Some(reason.as_str()),
            _ => None,
        }
    }

    pub fn finished_at(&self) -> Option<i64> {
        match self.finish_part() {
            Some(ContentPart::Finish { time, .. }) => Some(*time),
            _ => None,
        }
    }

    /// Concatenation of all text parts in order.
    pub fn content(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let ContentPart::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }
}

/// Wire payload for one part, shared by `message.part.updated` events and the
/// `parts` array of message responses. Synthetic part ids are derived from
/// the message id and part index.
pub fn part_json(message_id: &str, index: usize, part: &ContentPart) -> Value {
    let part_id = format!("{message_id}-part-{index}");
    match part {
        ContentPart::Text { text } => json!({
            "type": "text",
            "id": part_id,
            "text": text,
        }),
        ContentPart::Reasoning {
            thinking,
            started_at,
            finished_at,
            ..
        } => {
            let mut data = json!({
                "type": "reasoning",
                "id": part_id,
                "thinking": thinking,
            });
            if let Some(at) = started_at {
                data["started_at"] = json!(at);
            }
            if let Some(at) = finished_at {
                data["finished_at"] = json!(at);
            }
            data
        }
        ContentPart::Binary {
            path, mime_type, ..
        } => json!({
            "type": "file",
            "id": part_id,
            "name": path,
            "mime_type": mime_type,
        }),
        ContentPart::ImageUrl { url, detail } => {
            let mut data = json!({
                "type": "image_url",
                "id": part_id,
                "url": url,
            });
            if let Some(detail) = detail {
                data["detail"] = json!(detail);
            }
            data
        }
        ContentPart::ToolCall {
            id,
            name,
            input,
            finished,
            provider_executed,
        } => json!({
            "type": "tool_call",
            "id": id,
            "name": name,
            "input": input,
            "finished": finished,
            "provider_executed": provider_executed,
        }),
        ContentPart::ToolResult {
            tool_call_id,
            name,
            content,
            is_error,
            ..
        } => json!({
            "type": "tool_result",
            "id": part_id,
            "tool_call_id": tool_call_id,
            "name": name,
            "content": content,
            "is_error": is_error,
        }),
        ContentPart::Finish {
            reason,
            time,
            message,
            details,
        } => {
            let mut data = json!({
                "type": "finish",
                "reason": reason,
                "time": time,
            });
            if let Some(message) = message {
                data["message"] = json!(message);
            }
            if let Some(details) = details {
                data["details"] = json!(details);
            }
            data
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateMessageParams {
    pub role: Option<Role>,
    pub parts: Vec<ContentPart>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub is_summary: bool,
}

/// Message persistence plus the per-instance messages topic. Every mutation
/// publishes the full message payload.
pub struct MessageService {
    db: Arc<Database>,
    events: Topic<Message>,
}

impl MessageService {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            events: Topic::new(),
        }
    }

    pub fn subscribe(&self) -> Subscription<Message> {
        self.events.subscribe()
    }

    pub(crate) fn close_topic(&self) {
        self.events.close();
    }

    pub fn create(
        &self,
        session_id: &str,
        params: CreateMessageParams,
    ) -> Result<Message, AtelierError> {
        let now = ids::now_ms();
        let message = Message {
            id: ids::new_id("msg"),
            session_id: session_id.to_string(),
            role: params.role.unwrap_or(Role::User),
            model: params.model,
            provider: params.provider,
            is_summary: params.is_summary,
            parts: params.parts,
            created_at: now,
            updated_at: now,
        };

        let parts = serde_json::to_string(&message.parts)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, session_id, role, model, provider, is_summary, parts, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    message.id,
                    message.session_id,
                    message.role.as_str(),
                    message.model,
                    message.provider,
                    message.is_summary,
                    parts,
                    message.created_at,
                    message.updated_at,
                ],
            )
            .map(|_| ())
        })?;

        self.events.publish(EventKind::Created, message.clone());
        Ok(message)
    }

    pub fn get(&self, message_id: &str) -> Result<Message, AtelierError> {
        let row = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, session_id, role, model, provider, is_summary, parts, created_at, updated_at
                 FROM messages WHERE id = ?1",
                params![message_id],
                row_to_message,
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?;
        row.ok_or_else(|| AtelierError::MessageNotFound {
            message_id: message_id.to_string(),
        })
    }

    pub fn list(&self, session_id: &str) -> Result<Vec<Message>, AtelierError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, role, model, provider, is_summary, parts, created_at, updated_at
                 FROM messages WHERE session_id = ?1 ORDER BY created_at ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![session_id], row_to_message)?;
            rows.collect()
        })
    }

    /// Persists the message's parts and bumps `updated_at`, then publishes an
    /// `Updated` event carrying the new payload.
    pub fn update(&self, mut message: Message) -> Result<Message, AtelierError> {
        message.updated_at = ids::now_ms();
        let parts = serde_json::to_string(&message.parts)?;
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE messages SET parts = ?1, model = ?2, provider = ?3, updated_at = ?4 WHERE id = ?5",
                params![parts, message.model, message.provider, message.updated_at, message.id],
            )
        })?;
        if changed == 0 {
            return Err(AtelierError::MessageNotFound {
                message_id: message.id,
            });
        }

        self.events.publish(EventKind::Updated, message.clone());
        Ok(message)
    }

    pub fn delete(&self, message_id: &str) -> Result<(), AtelierError> {
        let message = self.get(message_id)?;
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM messages WHERE id = ?1", params![message_id])
                .map(|_| ())
        })?;
        self.events.publish(EventKind::Deleted, message);
        Ok(())
    }

    /// Removes every message of a session, publishing one `Deleted` event per
    /// message. Used when a session is deleted.
    pub fn delete_for_session(&self, session_id: &str) -> Result<usize, AtelierError> {
        let messages = self.list(session_id)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM messages WHERE session_id = ?1",
                params![session_id],
            )
            .map(|_| ())
        })?;
        let count = messages.len();
        for message in messages {
            self.events.publish(EventKind::Deleted, message);
        }
        Ok(count)
    }

    #[cfg(test)]
    pub(crate) fn publish_for_test(&self, kind: EventKind, message: Message) {
        self.events.publish(kind, message);
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<Message, rusqlite::Error> {
    let role: String = row.get(2)?;
    let parts_raw: String = row.get(6)?;
    let parts: Vec<ContentPart> = serde_json::from_str(&parts_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(err))
    })?;
    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: Role::parse(&role),
        model: row.get(3)?,
        provider: row.get(4)?,
        is_summary: row.get(5)?,
        parts,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionService;

    fn service_with_session() -> (Arc<Database>, MessageService, String) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let sessions = SessionService::new(db.clone());
        let session = sessions.create("test").unwrap();
        (db.clone(), MessageService::new(db), session.id)
    }

    #[tokio::test]
    async fn create_update_delete_publish_in_order() {
        let (_db, service, session_id) = service_with_session();
        let mut sub = service.subscribe();

        let message = service
            .create(
                &session_id,
                CreateMessageParams {
                    role: Some(Role::Assistant),
                    parts: vec![ContentPart::Text {
                        text: "hel".to_string(),
                    }],
                    ..Default::default()
                },
            )
            .unwrap();

        let mut updated = message.clone();
        updated.parts = vec![ContentPart::Text {
            text: "hello".to_string(),
        }];
        service.update(updated).unwrap();
        service.delete(&message.id).unwrap();

        let kinds: Vec<EventKind> = [
            sub.recv().await.unwrap().kind,
            sub.recv().await.unwrap().kind,
            sub.recv().await.unwrap().kind,
        ]
        .into();
        assert_eq!(
            kinds,
            vec![EventKind::Created, EventKind::Updated, EventKind::Deleted]
        );
    }

    #[test]
    fn parts_survive_storage_round_trip() {
        let (_db, service, session_id) = service_with_session();
        let created = service
            .create(
                &session_id,
                CreateMessageParams {
                    role: Some(Role::Assistant),
                    parts: vec![
                        ContentPart::Reasoning {
                            thinking: "let me think".to_string(),
                            signature: None,
                            started_at: Some(1),
                            finished_at: None,
                        },
                        ContentPart::ToolCall {
                            id: "call_1".to_string(),
                            name: "bash".to_string(),
                            input: "ls".to_string(),
                            finished: true,
                            provider_executed: false,
                        },
                        ContentPart::Finish {
                            reason: "end_turn".to_string(),
                            time: 42,
                            message: None,
                            details: None,
                        },
                    ],
                    ..Default::default()
                },
            )
            .unwrap();

        let loaded = service.get(&created.id).unwrap();
        assert_eq!(loaded.parts.len(), 3);
        assert_eq!(loaded.finish_reason(), Some("end_turn"));
        assert_eq!(loaded.finished_at(), Some(42));
    }

    #[test]
    fn unknown_message_is_not_found() {
        let (_db, service, _session_id) = service_with_session();
        let err = service.get("msg_missing").unwrap_err();
        assert!(matches!(err, AtelierError::MessageNotFound { .. }));
    }

    #[test]
    fn content_concatenates_text_parts_only() {
        let message = Message {
            id: "msg_1".to_string(),
            session_id: "ses_1".to_string(),
            role: Role::Assistant,
            model: None,
            provider: None,
            is_summary: false,
            parts: vec![
                ContentPart::Text {
                    text: "a".to_string(),
                },
                ContentPart::Reasoning {
                    thinking: "skip".to_string(),
                    signature: None,
                    started_at: None,
                    finished_at: None,
                },
                ContentPart::Text {
                    text: "b".to_string(),
                },
            ],
            created_at: 0,
            updated_at: 0,
        };
        assert_eq!(message.content(), "ab");
    }
}
