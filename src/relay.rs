use anyhow::{Context, Result};
use relay_core::{EventStore, IngestionPipeline, MemoryCache, QueryEngine};
use std::sync::Arc;
use tracing::info;

use crate::config::Config;

/// The ingestion and query halves of a relay, sharing one store.
#[derive(Clone)]
pub struct Relay {
    pub pipeline: Arc<IngestionPipeline>,
    pub engine: Arc<QueryEngine>,
}

impl Relay {
    /// Open the configured database and wire the pipeline and query engine
    /// around it.
    pub fn open(config: &Config) -> Result<Self> {
        let db_path = config.db_path();
        let store = EventStore::open(&db_path, &config.store_options())
            .with_context(|| format!("Failed to open event store at {}", db_path.display()))?;
        info!(
            "Result cache: {} entries, ttl {}s",
            config.cache.capacity, config.cache.ttl_secs
        );
        Ok(Self::with_store(store, config))
    }

    pub fn with_store(store: EventStore, config: &Config) -> Self {
        let cache = Arc::new(MemoryCache::new(config.cache.capacity));
        let engine = QueryEngine::new(store.clone(), cache, config.query_options());
        let pipeline = IngestionPipeline::new(store).with_id_check(config.ingest.verify_event_id);
        Self {
            pipeline: Arc::new(pipeline),
            engine: Arc::new(engine),
        }
    }

    pub fn store(&self) -> &EventStore {
        self.pipeline.store()
    }
}

/// Events from a JSON file holding either one event object or an array of
/// them.
pub fn parse_events(content: &str) -> Result<Vec<relay_core::Event>> {
    let value: serde_json::Value = serde_json::from_str(content).context("File is not valid JSON")?;
    if value.is_array() {
        serde_json::from_value(value).context("Array entries must be events")
    } else {
        Ok(vec![serde_json::from_value(value).context("Not an event object")?])
    }
}
