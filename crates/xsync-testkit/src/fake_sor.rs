use std::sync::Mutex;

use async_trait::async_trait;
use xsync_schemas::{EngineResult, SorRecord, TableSchema};
use xsync_sor_client::{ListRecordsParams, SorClient};

/// In-memory `SorClient` double. Seed it with [`FakeSorClient::new`], then
/// call [`FakeSorClient::records`] to inspect what the pipeline wrote.
/// IDs for records created via `create_records` are assigned
/// `r<next-sequence-number>`, mirroring the real API's server-generated ids.
pub struct FakeSorClient {
    schema: TableSchema,
    records: Mutex<Vec<SorRecord>>,
    next_id: Mutex<u64>,
}

impl FakeSorClient {
    pub fn new(schema: TableSchema, records: Vec<SorRecord>) -> Self {
        let next_id = records.len() as u64 + 1;
        Self { schema, records: Mutex::new(records), next_id: Mutex::new(next_id) }
    }

    pub fn records(&self) -> Vec<SorRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl SorClient for FakeSorClient {
    async fn list_tables(&self, _token: &str, _base_id: &str) -> EngineResult<Vec<TableSchema>> {
        Ok(vec![self.schema.clone()])
    }

    async fn list_records(
        &self,
        _token: &str,
        _base_id: &str,
        _table_id: &str,
        _params: &ListRecordsParams,
    ) -> EngineResult<Vec<SorRecord>> {
        Ok(self.records.lock().unwrap().clone())
    }

    async fn create_records(
        &self,
        _token: &str,
        _base_id: &str,
        _table_id: &str,
        records: &[SorRecord],
    ) -> EngineResult<Vec<SorRecord>> {
        let mut store = self.records.lock().unwrap();
        let mut next_id = self.next_id.lock().unwrap();
        let mut created = Vec::with_capacity(records.len());
        for r in records {
            let id = format!("r{}", *next_id);
            *next_id += 1;
            let stamped = SorRecord { id, fields: r.fields.clone() };
            store.push(stamped.clone());
            created.push(stamped);
        }
        Ok(created)
    }

    async fn update_records(
        &self,
        _token: &str,
        _base_id: &str,
        _table_id: &str,
        records: &[SorRecord],
    ) -> EngineResult<Vec<SorRecord>> {
        let mut store = self.records.lock().unwrap();
        for incoming in records {
            if let Some(existing) = store.iter_mut().find(|r| r.id == incoming.id) {
                existing.fields = incoming.fields.clone();
            }
        }
        Ok(records.to_vec())
    }

    async fn delete_records(
        &self,
        _token: &str,
        _base_id: &str,
        _table_id: &str,
        record_ids: &[String],
    ) -> EngineResult<()> {
        let mut store = self.records.lock().unwrap();
        store.retain(|r| !record_ids.contains(&r.id));
        Ok(())
    }
}
