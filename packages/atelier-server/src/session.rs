use std::sync::Arc;

use rusqlite::params;
use serde::{Deserialize, Serialize};

use atelier_error::AtelierError;

use crate::db::Database;
use crate::ids;
use crate::pubsub::{EventKind, Subscription, Topic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Todo {
    pub content: String,
    pub status: TodoStatus,
    pub active_form: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub parent_session_id: Option<String>,
    pub title: String,
    pub message_count: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cost: f64,
    pub summary_message_id: Option<String>,
    pub todos: Vec<Todo>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Session persistence plus the per-instance sessions topic.
pub struct SessionService {
    db: Arc<Database>,
    events: Topic<Session>,
}

impl SessionService {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            events: Topic::new(),
        }
    }

    pub fn subscribe(&self) -> Subscription<Session> {
        self.events.subscribe()
    }

    pub(crate) fn close_topic(&self) {
        self.events.close();
    }

    pub fn create(&self, title: &str) -> Result<Session, AtelierError> {
        let now = ids::now_ms();
        let session = Session {
            id: ids::new_id("ses"),
            parent_session_id: None,
            title: title.to_string(),
            message_count: 0,
            prompt_tokens: 0,
            completion_tokens: 0,
            cost: 0.0,
            summary_message_id: None,
            todos: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, parent_session_id, title, message_count, prompt_tokens, completion_tokens, cost, summary_message_id, todos, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 0, 0, 0, 0, ?4, '[]', ?5, ?6)",
                params![
                    session.id,
                    session.parent_session_id,
                    session.title,
                    session.summary_message_id,
                    session.created_at,
                    session.updated_at,
                ],
            )
            .map(|_| ())
        })?;

        self.events.publish(EventKind::Created, session.clone());
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> Result<Session, AtelierError> {
        let row = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, parent_session_id, title, message_count, prompt_tokens, completion_tokens, cost, summary_message_id, todos, created_at, updated_at
                 FROM sessions WHERE id = ?1",
                params![session_id],
                row_to_session,
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?;
        row.ok_or_else(|| AtelierError::SessionNotFound {
            session_id: session_id.to_string(),
        })
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.get(session_id).is_ok()
    }

    pub fn list(&self) -> Result<Vec<Session>, AtelierError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, parent_session_id, title, message_count, prompt_tokens, completion_tokens, cost, summary_message_id, todos, created_at, updated_at
                 FROM sessions ORDER BY created_at DESC, id DESC",
            )?;
            let rows = stmt.query_map([], row_to_session)?;
            rows.collect()
        })
    }

    /// Writes the session back and publishes an `Updated` event.
    pub fn save(&self, mut session: Session) -> Result<Session, AtelierError> {
        session.updated_at = ids::now_ms();
        let todos = serde_json::to_string(&session.todos)?;
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE sessions SET parent_session_id = ?1, title = ?2, message_count = ?3, prompt_tokens = ?4, completion_tokens = ?5, cost = ?6, summary_message_id = ?7, todos = ?8, updated_at = ?9
                 WHERE id = ?10",
                params![
                    session.parent_session_id,
                    session.title,
                    session.message_count,
                    session.prompt_tokens,
                    session.completion_tokens,
                    session.cost,
                    session.summary_message_id,
                    todos,
                    session.updated_at,
                    session.id,
                ],
            )
        })?;
        if changed == 0 {
            return Err(AtelierError::SessionNotFound {
                session_id: session.id,
            });
        }

        self.events.publish(EventKind::Updated, session.clone());
        Ok(session)
    }

    /// Deletes the session row. Messages go with it via the foreign key
    /// cascade; callers that need per-message `Deleted` events remove them
    /// through the message service first.
    pub fn delete(&self, session_id: &str) -> Result<(), AtelierError> {
        let session = self.get(session_id)?;
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])
                .map(|_| ())
        })?;
        self.events.publish(EventKind::Deleted, session);
        Ok(())
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<Session, rusqlite::Error> {
    let todos_raw: String = row.get(8)?;
    let todos: Vec<Todo> = serde_json::from_str(&todos_raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(err))
    })?;
    Ok(Session {
        id: row.get(0)?,
        parent_session_id: row.get(1)?,
        title: row.get(2)?,
        message_count: row.get(3)?,
        prompt_tokens: row.get(4)?,
        completion_tokens: row.get(5)?,
        cost: row.get(6)?,
        summary_message_id: row.get(7)?,
        todos,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}
