//! Application state shared across handlers.

use crate::events::EventBus;
use crate::handlers::admin::AdminSessions;
use depot_core::config::AppConfig;
use depot_metadata::MetadataStore;
use depot_storage::ShardedStore;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Sharded blob store.
    pub store: Arc<ShardedStore>,
    /// Metadata store.
    pub metadata: Arc<dyn MetadataStore>,
    /// Lifecycle event bus.
    pub events: Arc<EventBus>,
    /// Admin sessions, signed with the configured secret.
    pub admin_sessions: Arc<AdminSessions>,
}

impl AppState {
    /// Create a new application state.
    pub fn new(
        config: AppConfig,
        store: Arc<ShardedStore>,
        metadata: Arc<dyn MetadataStore>,
        events: Arc<EventBus>,
    ) -> Self {
        let admin_sessions = Arc::new(AdminSessions::new(&config.admin.session_secret));
        Self {
            config: Arc::new(config),
            store,
            metadata,
            events,
            admin_sessions,
        }
    }
}
