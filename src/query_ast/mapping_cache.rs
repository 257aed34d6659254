use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::debug;

use super::errors::BackendError;
use super::executor::MappingLookup;
use crate::models::structs::FieldMapping;

pub const DEFAULT_MAPPING_TTL: Duration = Duration::from_secs(300);

#[derive(Clone)]
struct MappingEntry {
    mapping: FieldMapping,
    fetched_at: Instant,
}

/// Per-index memo in front of another [`MappingLookup`]. Failed lookups are never cached.
pub struct CachedMappingLookup<L> {
    inner: L,
    ttl: Duration,
    entries: Mutex<HashMap<String, MappingEntry>>,
}

impl<L: MappingLookup> CachedMappingLookup<L> {
    pub fn new(inner: L, ttl: Duration) -> Self {
        Self { inner, ttl, entries: Mutex::new(HashMap::new()) }
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }

    pub fn invalidate(&self, index: &str) {
        if let Ok(mut g) = self.entries.lock() {
            g.remove(index);
        }
    }

    fn get(&self, index: &str) -> Option<FieldMapping> {
        let g = self.entries.lock().ok()?;
        let entry = g.get(index)?;
        (entry.fetched_at.elapsed() < self.ttl).then(|| entry.mapping.clone())
    }

    fn insert(&self, index: &str, mapping: FieldMapping) {
        if let Ok(mut g) = self.entries.lock() {
            g.insert(index.to_string(), MappingEntry { mapping, fetched_at: Instant::now() });
        }
    }
}

#[async_trait::async_trait]
impl<L: MappingLookup> MappingLookup for CachedMappingLookup<L> {
    async fn get_mapping(&self, index: &str) -> Result<FieldMapping, BackendError> {
        if let Some(hit) = self.get(index) {
            debug!("mapping cache hit for {}", index);
            return Ok(hit);
        }
        let mapping = self.inner.get_mapping(index).await?;
        self.insert(index, mapping.clone());
        Ok(mapping)
    }
}
