use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;

use dealq_events::{DealCreated, HandlerRegistry, PersistenceError};

/// Persistence collaborator for deal events.
///
/// Implementations must tolerate the same deal being saved twice: with
/// after-handling acks a job can be redelivered.
#[async_trait]
pub trait DealStore: Send + Sync {
    async fn save_deal(&self, deal: &DealCreated) -> Result<(), PersistenceError>;
}

#[async_trait]
impl<S> DealStore for Arc<S>
where
    S: DealStore + ?Sized,
{
    async fn save_deal(&self, deal: &DealCreated) -> Result<(), PersistenceError> {
        (**self).save_deal(deal).await
    }
}

/// In-memory deal table keyed by deal id, for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDealStore {
    deals: RwLock<HashMap<String, DealCreated>>,
    writes: AtomicU64,
}

impl InMemoryDealStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<DealCreated> {
        self.deals.read().ok()?.get(id).cloned()
    }

    pub fn list(&self) -> Vec<DealCreated> {
        let map = match self.deals.read() {
            Ok(m) => m,
            Err(_) => return vec![],
        };
        let mut deals: Vec<_> = map.values().cloned().collect();
        deals.sort_by(|a, b| a.id.cmp(&b.id));
        deals
    }

    pub fn len(&self) -> usize {
        self.deals.read().map(|m| m.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Successful `save_deal` calls, duplicates included.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DealStore for InMemoryDealStore {
    async fn save_deal(&self, deal: &DealCreated) -> Result<(), PersistenceError> {
        let mut map = self
            .deals
            .write()
            .map_err(|_| PersistenceError::new("deal table lock poisoned"))?;
        map.insert(deal.id.clone(), deal.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!(deal_id = %deal.id, "deal saved");
        Ok(())
    }
}

/// Route `DealCreated` events to `store`.
pub fn register_deal_store<S>(registry: &mut HandlerRegistry, store: Arc<S>) -> &mut HandlerRegistry
where
    S: DealStore + ?Sized + 'static,
{
    registry.register::<DealCreated, _, _>(move |deal: DealCreated| {
        let store = store.clone();
        async move { store.save_deal(&deal).await }
    })
}
