use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use utoipa::ToSchema;

/// A pending tool-invocation approval.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct PermissionRequest {
    pub id: String,
    pub session_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub description: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    pub path: String,
}

struct PendingRequest {
    request: PermissionRequest,
    reply: Option<oneshot::Sender<bool>>,
}

/// Process-wide "grant everything" override, set once at startup from the
/// `--yolo` server flag. Per-project skipping comes from the project config.
static FORCE_SKIP_REQUESTS: AtomicBool = AtomicBool::new(false);

pub fn force_skip_requests(enabled: bool) {
    FORCE_SKIP_REQUESTS.store(enabled, Ordering::Relaxed);
}

/// Per-instance permission state: a skip-all flag, the set of auto-approved
/// sessions, persistent per-action grants, and the pending request queue.
pub struct PermissionService {
    skip_requests: AtomicBool,
    auto_approved_sessions: Mutex<HashSet<String>>,
    persistent_grants: Mutex<HashSet<String>>,
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl PermissionService {
    /// `skip_requests` comes from the project's `permissions.skip_requests`
    /// config entry; the `--yolo` override applies on top of it.
    pub fn new(skip_requests: bool) -> Self {
        Self {
            skip_requests: AtomicBool::new(skip_requests),
            auto_approved_sessions: Mutex::new(HashSet::new()),
            persistent_grants: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn skip_requests(&self) -> bool {
        self.skip_requests.load(Ordering::Relaxed) || FORCE_SKIP_REQUESTS.load(Ordering::Relaxed)
    }

    /// Grants every subsequent permission prompt for the session without
    /// queueing it. Used by the prompt coordinator for the duration of a run.
    pub fn auto_approve_session(&self, session_id: &str) {
        self.auto_approved_sessions
            .lock()
            .expect("permission lock poisoned")
            .insert(session_id.to_string());
    }

    /// Submits a request. Auto-approved sessions, persistent grants, and the
    /// skip flag resolve immediately; everything else is queued until a
    /// grant/deny arrives and resolves the returned receiver.
    pub fn request(&self, request: PermissionRequest) -> PermissionDecision {
        if self.skip_requests() {
            return PermissionDecision::Granted;
        }
        if self
            .auto_approved_sessions
            .lock()
            .expect("permission lock poisoned")
            .contains(&request.session_id)
        {
            return PermissionDecision::Granted;
        }
        if self
            .persistent_grants
            .lock()
            .expect("permission lock poisoned")
            .contains(&grant_key(&request))
        {
            return PermissionDecision::Granted;
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("permission lock poisoned").insert(
            request.id.clone(),
            PendingRequest {
                request,
                reply: Some(tx),
            },
        );
        PermissionDecision::Pending(rx)
    }

    pub fn pending(&self) -> Vec<PermissionRequest> {
        let mut requests: Vec<PermissionRequest> = self
            .pending
            .lock()
            .expect("permission lock poisoned")
            .values()
            .map(|entry| entry.request.clone())
            .collect();
        requests.sort_by(|a, b| a.id.cmp(&b.id));
        requests
    }

    pub fn grant(&self, request_id: &str) -> bool {
        self.resolve(request_id, true, false)
    }

    /// Grants the request and remembers the (tool, action, path) triple so
    /// identical future requests are approved without queueing.
    pub fn grant_persistent(&self, request_id: &str) -> bool {
        self.resolve(request_id, true, true)
    }

    pub fn deny(&self, request_id: &str) -> bool {
        self.resolve(request_id, false, false)
    }

    fn resolve(&self, request_id: &str, granted: bool, persistent: bool) -> bool {
        let entry = self
            .pending
            .lock()
            .expect("permission lock poisoned")
            .remove(request_id);
        let Some(mut entry) = entry else {
            return false;
        };
        if granted && persistent {
            self.persistent_grants
                .lock()
                .expect("permission lock poisoned")
                .insert(grant_key(&entry.request));
        }
        if let Some(tx) = entry.reply.take() {
            let _ = tx.send(granted);
        }
        true
    }
}

pub enum PermissionDecision {
    Granted,
    Pending(oneshot::Receiver<bool>),
}

fn grant_key(request: &PermissionRequest) -> String {
    format!("{}:{}:{}", request.tool_name, request.action, request.path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids;

    fn request(session_id: &str) -> PermissionRequest {
        PermissionRequest {
            id: ids::new_id("perm"),
            session_id: session_id.to_string(),
            tool_call_id: "call_1".to_string(),
            tool_name: "bash".to_string(),
            description: "run ls".to_string(),
            action: "execute".to_string(),
            params: None,
            path: "/tmp".to_string(),
        }
    }

    #[tokio::test]
    async fn skip_requests_grants_without_queueing() {
        let service = PermissionService::new(true);
        assert!(service.skip_requests());
        assert!(matches!(
            service.request(request("ses_any")),
            PermissionDecision::Granted
        ));
        assert!(service.pending().is_empty());
    }

    #[tokio::test]
    async fn auto_approved_session_grants_immediately() {
        let service = PermissionService::new(false);
        service.auto_approve_session("ses_1");

        assert!(matches!(
            service.request(request("ses_1")),
            PermissionDecision::Granted
        ));
        assert!(matches!(
            service.request(request("ses_other")),
            PermissionDecision::Pending(_)
        ));
    }

    #[tokio::test]
    async fn grant_resolves_the_waiter_and_clears_pending() {
        let service = PermissionService::new(false);
        let req = request("ses_1");
        let id = req.id.clone();

        let PermissionDecision::Pending(rx) = service.request(req) else {
            panic!("expected pending decision");
        };
        assert_eq!(service.pending().len(), 1);

        assert!(service.grant(&id));
        assert!(rx.await.unwrap());
        assert!(service.pending().is_empty());
        assert!(!service.grant(&id));
    }

    #[tokio::test]
    async fn persistent_grant_short_circuits_identical_requests() {
        let service = PermissionService::new(false);
        let first = request("ses_1");
        let id = first.id.clone();
        let PermissionDecision::Pending(rx) = service.request(first) else {
            panic!("expected pending decision");
        };
        service.grant_persistent(&id);
        assert!(rx.await.unwrap());

        // Same tool/action/path, new request id.
        assert!(matches!(
            service.request(request("ses_2")),
            PermissionDecision::Granted
        ));
    }

    #[tokio::test]
    async fn deny_resolves_false() {
        let service = PermissionService::new(false);
        let req = request("ses_1");
        let id = req.id.clone();
        let PermissionDecision::Pending(rx) = service.request(req) else {
            panic!("expected pending decision");
        };
        service.deny(&id);
        assert!(!rx.await.unwrap());
    }
}
