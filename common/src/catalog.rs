//! Recording catalog – a bounded, newest-first list of recording metadata.
//!
//! Metadata is persisted through a [`KeyValueStore`] and survives restarts.
//! Payloads are kept in memory only, keyed by recording id, and are evicted
//! together with their catalog entry.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::recording::{CatalogEntry, Payload, Recording};
use crate::store::{load_json, save_json, KeyValueStore, StoreError, RECORDINGS_KEY};

/// Maximum number of catalog entries kept.
pub const CATALOG_CAPACITY: usize = 20;

pub struct Catalog {
    store: Arc<dyn KeyValueStore>,
    payloads: HashMap<String, Payload>,
}

impl Catalog {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            payloads: HashMap::new(),
        }
    }

    /// All persisted entries, newest first.
    pub fn load_all(&self) -> Result<Vec<CatalogEntry>, StoreError> {
        Ok(load_json::<Vec<CatalogEntry>>(self.store.as_ref(), RECORDINGS_KEY)?.unwrap_or_default())
    }

    /// Insert a finished recording at the front, evicting the oldest
    /// entries beyond [`CATALOG_CAPACITY`].  The whole list is rewritten.
    pub fn append(&mut self, recording: &Recording) -> Result<(), StoreError> {
        let mut entries = self.load_all()?;
        entries.insert(0, recording.entry());
        if entries.len() > CATALOG_CAPACITY {
            for evicted in entries.drain(CATALOG_CAPACITY..) {
                debug!("Catalog full – evicting {} ({})", evicted.id, evicted.name);
                self.payloads.remove(&evicted.id);
            }
        }
        save_json(self.store.as_ref(), RECORDINGS_KEY, &entries)?;

        self.payloads
            .insert(recording.id.clone(), Arc::clone(&recording.payload));
        info!("Catalog: added {} ({} entries)", recording.name, entries.len());
        Ok(())
    }

    pub fn find(&self, id: &str) -> Result<Option<CatalogEntry>, StoreError> {
        Ok(self.load_all()?.into_iter().find(|e| e.id == id))
    }

    /// Payload captured during this session, if still held.
    pub fn payload(&self, id: &str) -> Option<Payload> {
        self.payloads.get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::{TimeZone, Utc};

    fn recording(n: u64) -> Recording {
        Recording {
            id: n.to_string(),
            name: format!("take-{n}"),
            captured_at: Utc.timestamp_opt(1_700_000_000 + n as i64, 0).unwrap(),
            duration_secs: n,
            mime_type: "audio/mp4".into(),
            payload: Arc::from(vec![n as u8; 4]),
        }
    }

    #[test]
    fn test_newest_first_and_capped() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut catalog = Catalog::new(Arc::clone(&store));
        for n in 1..=25 {
            catalog.append(&recording(n)).unwrap();
            assert!(catalog.load_all().unwrap().len() <= CATALOG_CAPACITY);
        }
        let entries = catalog.load_all().unwrap();
        assert_eq!(entries.len(), CATALOG_CAPACITY);
        assert_eq!(entries[0].id, "25");
        assert_eq!(entries[CATALOG_CAPACITY - 1].id, "6");
    }

    #[test]
    fn test_eviction_drops_payload() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let mut catalog = Catalog::new(store);
        for n in 1..=21 {
            catalog.append(&recording(n)).unwrap();
        }
        assert!(catalog.payload("1").is_none());
        assert_eq!(catalog.payload("21").unwrap().len(), 4);
    }

    #[test]
    fn test_metadata_survives_without_payload() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        Catalog::new(Arc::clone(&store)).append(&recording(7)).unwrap();

        // A fresh catalog over the same store models a restart.
        let reopened = Catalog::new(store);
        let entry = reopened.find("7").unwrap().unwrap();
        assert_eq!(entry.name, "take-7");
        assert!(reopened.payload("7").is_none());
    }
}
