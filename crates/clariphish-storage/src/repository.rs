//! Repository layer for data access

pub mod campaigns;
pub mod events;
pub mod recipients;

use crate::db::{Backend, DatabasePool};
use crate::memory::MemoryStore;
use std::sync::Arc;

// Re-export concrete repository implementations
pub use campaigns::DbCampaignRepository;
pub use events::DbEventStore;
pub use recipients::DbRecipientRepository;

// Re-export repository traits
pub use campaigns::{CampaignDirectory, ContentResolver};
pub use events::EventStore;
pub use recipients::{StatusRegister, TokenRegistry};

/// Every repository the services need, behind trait objects
#[derive(Clone)]
pub struct Repositories {
    pub tokens: Arc<dyn TokenRegistry>,
    pub events: Arc<dyn EventStore>,
    pub status: Arc<dyn StatusRegister>,
    pub campaigns: Arc<dyn CampaignDirectory>,
    pub content: Arc<dyn ContentResolver>,
    pub backend: Arc<dyn Backend>,
}

impl Repositories {
    /// PostgreSQL-backed repositories sharing one pool
    pub fn postgres(pool: DatabasePool) -> Self {
        let recipients = Arc::new(DbRecipientRepository::new(pool.clone()));
        let campaigns = Arc::new(DbCampaignRepository::new(pool.clone()));

        Self {
            tokens: recipients.clone(),
            events: Arc::new(DbEventStore::new(pool.clone())),
            status: recipients,
            campaigns: campaigns.clone(),
            content: campaigns,
            backend: Arc::new(pool),
        }
    }

    /// Repositories backed by a single in-memory store
    pub fn in_memory(store: MemoryStore) -> Self {
        let store = Arc::new(store);

        Self {
            tokens: store.clone(),
            events: store.clone(),
            status: store.clone(),
            campaigns: store.clone(),
            content: store.clone(),
            backend: store,
        }
    }
}
