//! Wiring of the offline-sync components for the daemon.

use crate::config::DaemonConfig;
use anyhow::{Context, Result};
use offline_sync::{
    ActivitySource, EventBus, FileBackend, MergeEngine, OfflineOperation,
    OperationQueue, SessionActivity, SessionRegistry, SpaceType, StorageEvent,
    StorageHealthMonitor, Subscription, SyncOrchestrator, SyncTransport,
};
use std::sync::Arc;
use tracing::{info, warn};

pub struct Engine {
    pub config: DaemonConfig,
    pub queue: Arc<OperationQueue>,
    pub merge: Arc<MergeEngine>,
    pub health: StorageHealthMonitor,
    pub sessions: Arc<SessionRegistry>,
    pub activity: Arc<EventBus<SessionActivity>>,
    session_id: String,
    _subscriptions: (Subscription<StorageEvent>, Subscription<SessionActivity>),
}

impl Engine {
    /// Open the durable queue under the configured data directory.
    ///
    /// Both backends live on disk so an edit accepted during an outage of the
    /// queue directory outlives the process. Anything left in the fallback is
    /// migrated into the primary on open.
    pub async fn open(config: DaemonConfig) -> Result<Self> {
        let engine_config = &config.engine;
        let queue_dir = config.queue_dir();
        let primary = FileBackend::open(&queue_dir)
            .await
            .with_context(|| format!("Failed to open queue at {}", queue_dir.display()))?
            .named("queue");
        let fallback_dir = config.fallback_dir();
        let fallback = FileBackend::open(&fallback_dir)
            .await
            .with_context(|| format!("Failed to open fallback at {}", fallback_dir.display()))?
            .named("fallback");

        let events = Arc::new(EventBus::new());
        let storage_log = events.subscribe(|event: StorageEvent| {
            warn!(kind = ?event.kind, details = ?event.details, "{}", event.message);
        });

        let queue = Arc::new(
            OperationQueue::new(
                Arc::new(primary),
                Arc::new(fallback),
                engine_config.queue.clone(),
                events,
            )
            .with_thresholds(&engine_config.health),
        );
        let migrated = queue.migrate_fallback().await?;
        if migrated > 0 {
            info!("Migrated {} operations into {}", migrated, queue_dir.display());
        }

        let merge = Arc::new(MergeEngine::new(&engine_config.merge));
        let health = StorageHealthMonitor::new(
            Arc::clone(&queue),
            Arc::clone(&merge),
            engine_config.health.clone(),
        );

        let session_id = uuid::Uuid::new_v4().to_string();
        let sessions = Arc::new(SessionRegistry::new(session_id.clone(), &engine_config.sessions));
        let activity = Arc::new(EventBus::new());
        let attached = sessions.attach(&activity);

        Ok(Self {
            config,
            queue,
            merge,
            health,
            sessions,
            activity,
            session_id,
            _subscriptions: (storage_log, attached),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Queue a local update for `doc_id`, attributed to this process's session.
    pub async fn enqueue(
        &self,
        space_type: SpaceType,
        space_id: &str,
        doc_id: &str,
        update: Vec<u8>,
    ) -> Result<OfflineOperation> {
        let op = OfflineOperation::new(space_type, space_id, doc_id, update, &self.session_id, None)?;
        self.queue.save(op.clone()).await?;
        self.activity.emit(SessionActivity {
            session_id: self.session_id.clone(),
            client_id: None,
            source: ActivitySource::LocalEdit,
        });
        Ok(op)
    }

    pub fn orchestrator(&self, transport: Arc<dyn SyncTransport>) -> SyncOrchestrator {
        SyncOrchestrator::new(
            Arc::clone(&self.queue),
            transport,
            Arc::clone(&self.activity),
            self.config.engine.sync.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offline_sync::{DrainOutcome, MemoryBackend, MockTransport, QueueBackend};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> DaemonConfig {
        let mut config = DaemonConfig::from_sources(None, |_| None).unwrap();
        config.data_dir = dir.path().to_path_buf();
        config.engine.sync.workspace_id = Some("ws".into());
        config
    }

    #[tokio::test]
    async fn test_enqueue_persists_and_records_local_session() {
        let dir = TempDir::new().unwrap();
        {
            let engine = Engine::open(config(&dir)).await.unwrap();
            engine
                .enqueue(SpaceType::Workspace, "ws", "note", vec![1, 2, 3])
                .await
                .unwrap();

            let sessions = engine.sessions.list();
            assert_eq!(sessions.len(), 1);
            assert_eq!(sessions[0].label, "local");
        }

        let engine = Engine::open(config(&dir)).await.unwrap();
        let ops = engine.queue.list().await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].doc_id, "note");
    }

    #[tokio::test]
    async fn test_fallback_writes_survive_restart_and_migrate() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        {
            // Queue directory unusable: the write lands in the fallback directory.
            let primary = Arc::new(MemoryBackend::named("queue"));
            primary.set_available(false);
            let queue = OperationQueue::new(
                primary,
                Arc::new(FileBackend::open(config.fallback_dir()).await.unwrap()),
                config.engine.queue.clone(),
                Arc::new(EventBus::new()),
            );
            let op = OfflineOperation::new(SpaceType::Workspace, "ws", "note", vec![9], "s1", None)
                .unwrap();
            queue.save(op).await.unwrap();
        }

        let engine = Engine::open(config.clone()).await.unwrap();
        let ops = engine.queue.list().await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].update, vec![9]);

        let fallback = FileBackend::open(config.fallback_dir()).await.unwrap();
        assert_eq!(fallback.count().await.unwrap(), 0);
        let primary = FileBackend::open(config.queue_dir()).await.unwrap();
        assert_eq!(primary.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_orchestrator_drains_through_transport() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(config(&dir)).await.unwrap();
        engine
            .enqueue(SpaceType::Workspace, "ws", "note", vec![1])
            .await
            .unwrap();

        let transport = Arc::new(MockTransport::new());
        let orchestrator = engine.orchestrator(transport.clone());
        let outcome = orchestrator.drain().await.unwrap();

        assert!(matches!(outcome, DrainOutcome::Completed(r) if r.is_success()));
        assert_eq!(transport.request_count(), 1);
        assert!(engine.queue.list().await.unwrap().is_empty());
    }
}
