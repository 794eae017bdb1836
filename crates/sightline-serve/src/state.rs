//! Application state.

use std::sync::Arc;

use sightline_ingest::{IdentityStore, LoopHandle};

use crate::cache::{ResponseCache, new_cache};
use crate::config::Config;

/// Shared application state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The live aggregate set, written only by the ingestion loop.
    pub store: IdentityStore,

    /// Status and stop control of the ingestion loop.
    pub ingest: LoopHandle,

    /// Application configuration.
    pub config: Arc<Config>,

    /// Pins and other short-lived responses.
    pub cache: ResponseCache,
}

impl AppState {
    pub fn new(config: Config, store: IdentityStore, ingest: LoopHandle) -> Self {
        let ttl = (config.snapshot_interval * 4).max(std::time::Duration::from_secs(1));
        Self {
            store,
            ingest,
            config: Arc::new(config),
            cache: new_cache(ttl),
        }
    }
}
