//! Persistence sink backed by the SQLite store.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use coldchain_core::{Reading, ReadingSink};
use coldchain_store::Store;

/// Writes every reading to the shared [`Store`].
#[derive(Clone)]
pub struct StoreSink {
    store: Arc<Mutex<Store>>,
}

impl StoreSink {
    pub fn new(store: Arc<Mutex<Store>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ReadingSink for StoreSink {
    async fn record(&self, reading: &Reading) -> coldchain_core::Result<()> {
        let store = self.store.lock().await;
        store
            .insert_reading(reading)
            .map(|_| ())
            .map_err(coldchain_core::Error::sink)
    }
}
