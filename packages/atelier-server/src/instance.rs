use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, RwLock};

use atelier_error::AtelierError;

use crate::agent::{coordinator_from_config, AgentCoordinator};
use crate::config::Config;
use crate::db::Database;
use crate::ids;
use crate::lsp::LspClientSet;
use crate::message::MessageService;
use crate::permission::PermissionService;
use crate::registry::ProjectRegistry;
use crate::session::SessionService;

/// The live per-project object graph. Immutable after construction; at most
/// one exists per project path at any instant.
pub struct ProjectInstance {
    id: String,
    config: Config,
    db: Arc<Database>,
    pub sessions: Arc<SessionService>,
    pub messages: Arc<MessageService>,
    pub permissions: Arc<PermissionService>,
    pub coordinator: Option<Arc<dyn AgentCoordinator>>,
    pub lsp_clients: Arc<LspClientSet>,
    shut_down: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for ProjectInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectInstance").field("id", &self.id).finish()
    }
}

impl ProjectInstance {
    fn build(config: Config) -> Result<Self, AtelierError> {
        let db = Arc::new(Database::open(config.data_dir())?);
        let sessions = Arc::new(SessionService::new(db.clone()));
        let messages = Arc::new(MessageService::new(db.clone()));
        let permissions = Arc::new(PermissionService::new(config.permissions.skip_requests));
        let lsp_clients = Arc::new(LspClientSet::from_config(&config));
        let coordinator = coordinator_from_config(&config, sessions.clone(), messages.clone());
        let (closed_tx, _) = watch::channel(false);

        Ok(Self {
            id: ids::new_id("app"),
            config,
            db,
            sessions,
            messages,
            permissions,
            coordinator,
            lsp_clients,
            shut_down: AtomicBool::new(false),
            closed_tx,
        })
    }

    /// Unique per construction; a disposed-and-recreated project yields a
    /// different id.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Resolves to `true` once the instance has been shut down. Used by
    /// long-lived tasks that are not bound to one of the instance topics.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Releases everything in reverse order of acquisition: coordinator runs
    /// first, then LSP clients, then the database, then the topics. Safe to
    /// call more than once.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(coordinator) = &self.coordinator {
            coordinator.cancel_all();
        }
        self.lsp_clients.close();
        self.db.close();
        self.messages.close_topic();
        self.sessions.close_topic();
        let _ = self.closed_tx.send(true);
    }
}

impl Drop for ProjectInstance {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Process-wide owner of the project-path → instance map. Lookups hold the
/// read lock; creation and disposal hold the write lock.
pub struct InstanceManager {
    registry: Arc<ProjectRegistry>,
    instances: RwLock<HashMap<String, Arc<ProjectInstance>>>,
}

impl InstanceManager {
    pub fn new(registry: Arc<ProjectRegistry>) -> Self {
        Self {
            registry,
            instances: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ProjectRegistry> {
        &self.registry
    }

    /// Returns the live instance for the project, creating one on demand.
    /// Double-checked: the fast path holds only the read lock; losers of a
    /// create race observe the winner's instance after re-checking under the
    /// write lock.
    pub async fn get_or_create(&self, project_path: &str) -> Result<Arc<ProjectInstance>, AtelierError> {
        if let Some(instance) = self.instances.read().await.get(project_path) {
            return Ok(instance.clone());
        }

        let mut instances = self.instances.write().await;
        if let Some(instance) = instances.get(project_path) {
            return Ok(instance.clone());
        }

        let project = self
            .registry
            .find(project_path)?
            .ok_or_else(|| AtelierError::ProjectNotFound {
                path: project_path.to_string(),
            })?;

        let config = Config::load(Path::new(&project.path), Path::new(&project.data_dir))?;
        prepare_data_dir(Path::new(&project.data_dir))?;

        // Database::open runs migrations; every later failure drops the
        // connection on the way out, so partial construction never leaks.
        let instance = Arc::new(ProjectInstance::build(config)?);
        instances.insert(project_path.to_string(), instance.clone());
        let _ = self.registry.touch(project_path);

        tracing::info!(project = %project_path, instance = %instance.id(), "auto-created project instance");
        Ok(instance)
    }

    /// Read-only lookup; never creates.
    pub async fn get(&self, project_path: &str) -> Option<Arc<ProjectInstance>> {
        self.instances.read().await.get(project_path).cloned()
    }

    /// Removes and shuts down one instance. Idempotent: an absent key is
    /// success, and the second call releases nothing.
    pub async fn dispose_project(&self, project_path: &str) -> Result<(), AtelierError> {
        let mut instances = self.instances.write().await;
        match instances.remove(project_path) {
            Some(instance) => {
                instance.shutdown();
                tracing::info!(project = %project_path, "disposed project instance");
            }
            None => {
                tracing::info!(project = %project_path, "project instance already disposed");
            }
        }
        Ok(())
    }

    /// Shuts down every instance and returns the disposed project paths.
    pub async fn dispose_all(&self) -> Vec<String> {
        let mut instances = self.instances.write().await;
        let mut paths = Vec::with_capacity(instances.len());
        for (path, instance) in instances.drain() {
            instance.shutdown();
            tracing::info!(project = %path, "disposed project instance");
            paths.push(path);
        }
        paths
    }

    /// Scans all live instances for the one whose session store contains the
    /// id. Holds only the read lock; scan order is unspecified.
    pub async fn instance_for_session(
        &self,
        session_id: &str,
    ) -> Result<Arc<ProjectInstance>, AtelierError> {
        let instances = self.instances.read().await;
        for instance in instances.values() {
            if instance.sessions.contains(session_id) {
                return Ok(instance.clone());
            }
        }
        Err(AtelierError::SessionNotFound {
            session_id: session_id.to_string(),
        })
    }

    pub async fn live_count(&self) -> usize {
        self.instances.read().await.len()
    }
}

/// Creates the data directory (0o755) and drops a `.gitignore` covering it.
fn prepare_data_dir(data_dir: &Path) -> Result<(), AtelierError> {
    std::fs::create_dir_all(data_dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(data_dir, std::fs::Permissions::from_mode(0o755))?;
    }
    let gitignore = data_dir.join(".gitignore");
    if !gitignore.exists() {
        std::fs::write(gitignore, "*\n")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::default_data_dir;

    struct Harness {
        _data_home: tempfile::TempDir,
        project_dir: tempfile::TempDir,
        manager: Arc<InstanceManager>,
    }

    fn harness() -> Harness {
        let data_home = tempfile::tempdir().unwrap();
        let project_dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ProjectRegistry::open_at(data_home.path()).unwrap());
        let path = project_dir.path().to_string_lossy().to_string();
        registry.register(&path, &default_data_dir(&path)).unwrap();
        Harness {
            _data_home: data_home,
            project_dir,
            manager: Arc::new(InstanceManager::new(registry)),
        }
    }

    fn project_path(harness: &Harness) -> String {
        harness.project_dir.path().to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn unregistered_project_is_not_found() {
        let harness = harness();
        let err = harness
            .manager
            .get_or_create("/nowhere/at/all")
            .await
            .unwrap_err();
        assert!(matches!(err, AtelierError::ProjectNotFound { .. }));
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let harness = harness();
        let path = project_path(&harness);

        let first = harness.manager.get_or_create(&path).await.unwrap();
        let second = harness.manager.get_or_create(&path).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let data_dir = harness.project_dir.path().join(".atelier");
        assert!(data_dir.is_dir());
        assert_eq!(
            std::fs::read_to_string(data_dir.join(".gitignore")).unwrap(),
            "*\n"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_callers_observe_one_instance() {
        let harness = harness();
        let path = project_path(&harness);

        let mut handles = Vec::new();
        for _ in 0..50 {
            let manager = harness.manager.clone();
            let path = path.clone();
            handles.push(tokio::spawn(
                async move { manager.get_or_create(&path).await },
            ));
        }

        let mut instances = Vec::new();
        for handle in handles {
            instances.push(handle.await.unwrap().unwrap());
        }
        let first = &instances[0];
        assert!(instances.iter().all(|i| Arc::ptr_eq(first, i)));
        assert_eq!(harness.manager.live_count().await, 1);
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_recreate_yields_new_instance() {
        let harness = harness();
        let path = project_path(&harness);

        let before = harness.manager.get_or_create(&path).await.unwrap();
        let before_id = before.id().to_string();

        harness.manager.dispose_project(&path).await.unwrap();
        harness.manager.dispose_project(&path).await.unwrap();
        assert!(before.is_shut_down());

        let after = harness.manager.get_or_create(&path).await.unwrap();
        assert_ne!(after.id(), before_id);
        assert!(!after.is_shut_down());
    }

    #[tokio::test]
    async fn shutdown_closes_services() {
        let harness = harness();
        let path = project_path(&harness);
        let instance = harness.manager.get_or_create(&path).await.unwrap();

        let mut sessions_sub = instance.sessions.subscribe();
        instance.shutdown();
        instance.shutdown();

        assert!(sessions_sub.recv().await.is_none());
        assert!(instance.sessions.list().is_err());
    }

    #[tokio::test]
    async fn dispose_all_drains_every_instance() {
        let harness = harness();
        let path = project_path(&harness);
        harness.manager.get_or_create(&path).await.unwrap();

        let disposed = harness.manager.dispose_all().await;
        assert_eq!(disposed, vec![path]);
        assert_eq!(harness.manager.live_count().await, 0);
    }

    #[tokio::test]
    async fn session_scan_finds_the_owning_instance() {
        let harness = harness();
        let path = project_path(&harness);
        let instance = harness.manager.get_or_create(&path).await.unwrap();
        let session = instance.sessions.create("scan me").unwrap();

        let found = harness
            .manager
            .instance_for_session(&session.id)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&found, &instance));

        let err = harness
            .manager
            .instance_for_session("ses_missing")
            .await
            .unwrap_err();
        assert!(matches!(err, AtelierError::SessionNotFound { .. }));
    }
}
