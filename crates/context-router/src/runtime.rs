//! Assembles a running [`ContextRouter`] from configuration.
//!
//! [`Runtime::open`] connects the configured chunk store, loads persisted
//! profiles and the latest ranking model, selects the embedding provider,
//! and prepares the feedback channel. The CLI opens a runtime per
//! command; `ctxr serve` additionally starts the adaptation worker with
//! [`Runtime::spawn_adaptation`].

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use context_router_core::embedding::EmbeddingProvider;
use context_router_core::feedback::{feedback_channel, AdaptationWorker, ImpressionLog};
use context_router_core::metrics::{InMemoryMetrics, MetricsSink};
use context_router_core::models::FeedbackEvent;
use context_router_core::profile::{AgentProfile, ProfileRegistry};
use context_router_core::ranker::{ModelHandle, RankingModelState};
use context_router_core::store::{ChunkStore, InMemoryChunkStore};
use context_router_core::ContextRouter;

use crate::config::{Config, StoreBackend};
use crate::db;
use crate::embedding::create_provider;
use crate::migrate;
use crate::sqlite_store::SqliteChunkStore;
use crate::state_store::SqliteStateStore;

/// Receiving half of the feedback queue, held until the worker starts.
struct PendingWorker {
    rx: mpsc::Receiver<FeedbackEvent>,
    impressions: Arc<ImpressionLog>,
}

pub struct Runtime {
    pub config: Arc<Config>,
    pub store: Arc<dyn ChunkStore>,
    pub state: SqliteStateStore,
    pub embedder: Option<Arc<dyn EmbeddingProvider>>,
    pub metrics: Arc<InMemoryMetrics>,
    pub router: Arc<ContextRouter>,
    pool: sqlx::SqlitePool,
    pending: Option<PendingWorker>,
}

impl Runtime {
    pub async fn open(config: &Config) -> Result<Self> {
        let config = Arc::new(config.clone());

        let (pool, store): (sqlx::SqlitePool, Arc<dyn ChunkStore>) = match config.store.backend {
            StoreBackend::Sqlite => {
                let pool = db::connect(&config).await?;
                migrate::apply(&pool).await?;
                let store = Arc::new(SqliteChunkStore::new(pool.clone()));
                (pool, store)
            }
            StoreBackend::Memory => {
                let pool = db::connect_memory().await?;
                migrate::apply(&pool).await?;
                (pool, Arc::new(InMemoryChunkStore::new()))
            }
        };
        let state = SqliteStateStore::new(pool.clone());

        let registry = Arc::new(load_registry(&config, &state).await?);
        let model = Arc::new(ModelHandle::new(load_model(&state).await?));
        let embedder = create_provider(&config.embedding)?;
        let metrics = Arc::new(InMemoryMetrics::new());
        let sink: Arc<dyn MetricsSink> = metrics.clone();

        let mut builder = ContextRouter::builder(Arc::clone(&store))
            .registry(registry)
            .min_confidence(config.classifier.min_confidence)
            .retrieval(config.retrieval.settings())
            .model(model)
            .metrics(Arc::clone(&sink));
        if let Some(embedder) = &embedder {
            builder = builder.embedder(Arc::clone(embedder));
        }

        let mut pending = None;
        if config.feedback.enabled {
            let impressions = Arc::new(ImpressionLog::new(&config.feedback.impression_settings()));
            let (recorder, rx) = feedback_channel(config.feedback.channel_capacity, sink);
            builder = builder
                .recorder(Arc::new(recorder))
                .impressions(Arc::clone(&impressions));
            pending = Some(PendingWorker { rx, impressions });
        }

        Ok(Self {
            router: Arc::new(builder.build()),
            config,
            store,
            state,
            embedder,
            metrics,
            pool,
            pending,
        })
    }

    /// Start the background adaptation worker. Returns `None` when feedback
    /// is disabled or the worker was already started.
    pub fn spawn_adaptation<F>(&mut self, shutdown: F) -> Result<Option<JoinHandle<()>>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(PendingWorker { rx, impressions }) = self.pending.take() else {
            return Ok(None);
        };
        let settings = self.config.feedback.adaptation_settings()?;
        let worker = AdaptationWorker::new(
            rx,
            impressions,
            Arc::clone(self.router.model()),
            settings,
            self.metrics.clone(),
        )
        .with_persistence(Arc::new(self.state.clone()));
        info!(rule = %self.config.feedback.rule, "adaptation worker started");
        Ok(Some(tokio::spawn(worker.run(shutdown))))
    }

    /// Validate, publish, and persist a profile. Returns the new profile-set
    /// version.
    pub async fn upsert_profile(&self, profile: AgentProfile) -> Result<u64> {
        let version = self.router.registry().upsert(profile.clone())?;
        self.state
            .save_profile(&profile)
            .await
            .with_context(|| format!("Failed to persist profile '{}'", profile.id))?;
        Ok(version)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// Built-ins with config overrides, then stored profiles on top.
async fn load_registry(config: &Config, state: &SqliteStateStore) -> Result<ProfileRegistry> {
    let mut profiles = config.effective_profiles()?;
    for stored in state.load_profiles().await? {
        if let Err(e) = stored.validate() {
            warn!(profile = %stored.id, error = %e, "ignoring invalid stored profile");
            continue;
        }
        match profiles.iter_mut().find(|p| p.id == stored.id) {
            Some(existing) => *existing = stored,
            None => profiles.push(stored),
        }
    }
    Ok(ProfileRegistry::new(profiles)?)
}

async fn load_model(state: &SqliteStateStore) -> Result<RankingModelState> {
    match state.latest_model().await? {
        Some(model) => match model.validate() {
            Ok(()) => {
                info!(version = model.version, "resuming ranking model");
                Ok(model)
            }
            Err(e) => {
                warn!(version = model.version, error = %e, "stored ranking model is invalid; starting fresh");
                Ok(RankingModelState::initial())
            }
        },
        None => Ok(RankingModelState::initial()),
    }
}
