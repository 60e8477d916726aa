//! Resolves SOR record IDs↔display names across related tables via a
//! process-wide TTL cache (§4.4).
//!
//! The cache is intentionally a plain `HashMap` behind a `tokio::sync::RwLock`
//! rather than a crate like `moka` — nothing in this workspace's dependency
//! stack pulls in a cache crate, and the eviction policy here (single TTL,
//! no LRU pressure) doesn't need one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use xsync_schemas::{EngineResult, SorRecord};
use xsync_sor_client::{ListRecordsParams, SorClient};

const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

struct CacheEntry {
    id_to_name: HashMap<String, String>,
    name_to_id: HashMap<String, String>,
    captured_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.captured_at.elapsed() < ttl
    }
}

#[derive(Debug, Default)]
pub struct ResolveIdsToNames {
    pub resolved: Vec<(String, String)>,
    pub missing: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ResolveNamesToIds {
    pub resolved: Vec<(String, String)>,
    pub missing: Vec<String>,
    pub created: Vec<(String, String)>,
    pub warnings: Vec<String>,
}

/// Keyed by `(baseId, linkedTableId)` per §4.4.
pub struct LinkedRecordResolver {
    sor: Arc<dyn SorClient>,
    ttl: Duration,
    cache: RwLock<HashMap<(String, String), CacheEntry>>,
}

impl LinkedRecordResolver {
    pub fn new(sor: Arc<dyn SorClient>) -> Self {
        Self::with_ttl(sor, DEFAULT_TTL)
    }

    pub fn with_ttl(sor: Arc<dyn SorClient>, ttl: Duration) -> Self {
        Self { sor, ttl, cache: RwLock::new(HashMap::new()) }
    }

    /// Warms the cache for a configuration's first use (§4.4).
    pub async fn preload_table(
        &self,
        token: &str,
        base_id: &str,
        linked_table_id: &str,
        primary_field_id: &str,
    ) -> EngineResult<()> {
        self.ensure_fresh(token, base_id, linked_table_id, primary_field_id).await?;
        Ok(())
    }

    pub async fn resolve_ids_to_names(
        &self,
        token: &str,
        base_id: &str,
        linked_table_id: &str,
        primary_field_id: &str,
        ids: &[String],
        strict_mode: bool,
    ) -> EngineResult<ResolveIdsToNames> {
        let entry_names = self.ensure_fresh(token, base_id, linked_table_id, primary_field_id).await?;

        let mut out = ResolveIdsToNames::default();
        for id in ids {
            match entry_names.get(id) {
                Some(name) => out.resolved.push((id.clone(), name.clone())),
                None if strict_mode => out.missing.push(id.clone()),
                None => {
                    out.warnings.push(format!("linked id '{id}' not found in '{linked_table_id}'; passed through"));
                    out.resolved.push((id.clone(), id.clone()));
                }
            }
        }
        Ok(out)
    }

    pub async fn resolve_names_to_ids(
        &self,
        token: &str,
        base_id: &str,
        linked_table_id: &str,
        primary_field_id: &str,
        names: &[String],
        create_missing: bool,
    ) -> EngineResult<ResolveNamesToIds> {
        self.ensure_fresh(token, base_id, linked_table_id, primary_field_id).await?;

        let mut out = ResolveNamesToIds::default();
        let mut to_create = Vec::new();

        {
            let cache = self.cache.read().await;
            let entry = cache.get(&(base_id.to_string(), linked_table_id.to_string()));
            for name in names {
                let found = entry.and_then(|e| {
                    e.name_to_id
                        .iter()
                        .find(|(n, _)| n.eq_ignore_ascii_case(name))
                        .map(|(_, id)| id.clone())
                });
                match found {
                    Some(id) => out.resolved.push((name.clone(), id)),
                    None if create_missing => to_create.push(name.clone()),
                    None => out.missing.push(name.clone()),
                }
            }
        }

        if !to_create.is_empty() {
            let new_records: Vec<SorRecord> = to_create
                .iter()
                .map(|name| SorRecord {
                    id: String::new(),
                    fields: HashMap::from([(primary_field_id.to_string(), serde_json::json!(name))]),
                })
                .collect();
            let created = self.sor.create_records(token, base_id, linked_table_id, &new_records).await?;

            let mut cache = self.cache.write().await;
            let entry = cache
                .entry((base_id.to_string(), linked_table_id.to_string()))
                .or_insert_with(|| CacheEntry { id_to_name: HashMap::new(), name_to_id: HashMap::new(), captured_at: Instant::now() });

            for (name, rec) in to_create.iter().zip(created.iter()) {
                entry.id_to_name.insert(rec.id.clone(), name.clone());
                entry.name_to_id.insert(name.clone(), rec.id.clone());
                out.created.push((name.clone(), rec.id.clone()));
                out.resolved.push((name.clone(), rec.id.clone()));
            }
        }

        Ok(out)
    }

    /// Loads the cache entry for `(base_id, linked_table_id)` if absent or
    /// expired, and returns a snapshot of its `id -> name` map.
    async fn ensure_fresh(
        &self,
        token: &str,
        base_id: &str,
        linked_table_id: &str,
        primary_field_id: &str,
    ) -> EngineResult<HashMap<String, String>> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&(base_id.to_string(), linked_table_id.to_string())) {
                if entry.is_fresh(self.ttl) {
                    return Ok(entry.id_to_name.clone());
                }
            }
        }

        let records = self
            .sor
            .list_records(token, base_id, linked_table_id, &ListRecordsParams::default())
            .await?;

        let mut id_to_name = HashMap::new();
        let mut name_to_id = HashMap::new();
        for record in &records {
            if let Some(name) = record.fields.get(primary_field_id).and_then(|v| v.as_str()) {
                id_to_name.insert(record.id.clone(), name.to_string());
                name_to_id.insert(name.to_string(), record.id.clone());
            }
        }

        let snapshot = id_to_name.clone();
        let mut cache = self.cache.write().await;
        cache.insert(
            (base_id.to_string(), linked_table_id.to_string()),
            CacheEntry { id_to_name, name_to_id, captured_at: Instant::now() },
        );
        Ok(snapshot)
    }
}
