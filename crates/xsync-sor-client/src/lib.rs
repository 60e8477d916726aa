//! Typed wrapper over the SOR's REST API (§4.1, §6).
//!
//! Every request is funneled through a shared [`RateLimiter`] (default 5
//! requests/second) and retried per [`RetryPolicy`] on `429`/`5xx`; any
//! other `4xx` is never retried. Batch writes are capped at 10 records —
//! callers (the pipelines) are responsible for chunking larger sets.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use xsync_ratelimit::{retry_with_backoff, RateLimiter, RetryPolicy};
use xsync_schemas::{EngineError, EngineResult, SorRecord, TableSchema};

pub const MAX_BATCH_SIZE: usize = 10;
const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Default)]
pub struct ListRecordsParams {
    pub view: Option<String>,
    pub sort_field: Option<String>,
    pub max_records: Option<u32>,
    pub filter_formula: Option<String>,
}

/// The typed SOR operations from §4.1's contract table. A fake
/// implementation backs pipeline tests (see `xsync-testkit`).
#[async_trait]
pub trait SorClient: Send + Sync {
    async fn list_tables(&self, token: &str, base_id: &str) -> EngineResult<Vec<TableSchema>>;

    async fn list_records(
        &self,
        token: &str,
        base_id: &str,
        table_id: &str,
        params: &ListRecordsParams,
    ) -> EngineResult<Vec<SorRecord>>;

    async fn create_records(
        &self,
        token: &str,
        base_id: &str,
        table_id: &str,
        records: &[SorRecord],
    ) -> EngineResult<Vec<SorRecord>>;

    async fn update_records(
        &self,
        token: &str,
        base_id: &str,
        table_id: &str,
        records: &[SorRecord],
    ) -> EngineResult<Vec<SorRecord>>;

    async fn delete_records(
        &self,
        token: &str,
        base_id: &str,
        table_id: &str,
        record_ids: &[String],
    ) -> EngineResult<()>;
}

fn check_batch_size(records_len: usize) -> EngineResult<()> {
    if records_len > MAX_BATCH_SIZE {
        return Err(EngineError::validation(format!(
            "batch of {records_len} exceeds the SOR's hard limit of {MAX_BATCH_SIZE}; caller must chunk"
        )));
    }
    Ok(())
}

pub struct HttpSorClient {
    http: reqwest::Client,
    base_url: String,
    limiter: Arc<RateLimiter>,
    retry_policy: RetryPolicy,
}

impl HttpSorClient {
    pub fn new(base_url: impl Into<String>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            limiter,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Classifies a non-2xx HTTP status into the engine's error taxonomy,
    /// per §4.1's "exponential backoff on 429/5xx", "4xx other than 429 is
    /// never retried".
    fn classify_status(status: reqwest::StatusCode, body: &str) -> EngineError {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            EngineError::rate_limit(format!("SOR rate limit: {body}"))
        } else if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            EngineError::oauth(format!("SOR auth error {status}: {body}"))
        } else if status.is_server_error() {
            EngineError::network(format!("SOR server error {status}: {body}"))
        } else {
            EngineError::validation(format!("SOR request rejected {status}: {body}"))
        }
    }

    async fn send_json(
        &self,
        token: &str,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> EngineResult<Value> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);

        retry_with_backoff(&self.retry_policy, || {
            let url = url.clone();
            let token = token.to_string();
            let method = method.clone();
            let query = query.to_vec();
            let body = body.cloned();
            async move {
                self.limiter.acquire().await;

                let mut req = self
                    .http
                    .request(method, &url)
                    .bearer_auth(&token)
                    .query(&query);
                if let Some(b) = &body {
                    req = req.json(b);
                }

                let resp = req
                    .send()
                    .await
                    .map_err(|e| EngineError::network(format!("SOR request failed: {e}")))?;

                let status = resp.status();
                let text = resp
                    .text()
                    .await
                    .map_err(|e| EngineError::network(format!("SOR response read failed: {e}")))?;

                if !status.is_success() {
                    return Err(Self::classify_status(status, &text));
                }

                serde_json::from_str(&text)
                    .map_err(|e| EngineError::validation(format!("SOR response decode failed: {e}")))
            }
        })
        .await
    }
}

#[async_trait]
impl SorClient for HttpSorClient {
    async fn list_tables(&self, token: &str, base_id: &str) -> EngineResult<Vec<TableSchema>> {
        let body = self
            .send_json(token, reqwest::Method::GET, &format!("/meta/bases/{base_id}/tables"), &[], None)
            .await?;
        let tables = body
            .get("tables")
            .cloned()
            .ok_or_else(|| EngineError::fetch_missing_field("tables"))?;
        serde_json::from_value(tables)
            .map_err(|e| EngineError::validation(format!("table schema decode failed: {e}")))
    }

    async fn list_records(
        &self,
        token: &str,
        base_id: &str,
        table_id: &str,
        params: &ListRecordsParams,
    ) -> EngineResult<Vec<SorRecord>> {
        let mut out = Vec::new();
        let mut offset: Option<String> = None;

        loop {
            let mut query = vec![("pageSize".to_string(), DEFAULT_PAGE_SIZE.to_string())];
            if let Some(v) = &params.view {
                query.push(("view".to_string(), v.clone()));
            }
            if let Some(v) = &params.sort_field {
                query.push(("sort".to_string(), v.clone()));
            }
            if let Some(v) = &params.max_records {
                query.push(("maxRecords".to_string(), v.to_string()));
            }
            if let Some(v) = &params.filter_formula {
                query.push(("filterByFormula".to_string(), v.clone()));
            }
            if let Some(o) = &offset {
                query.push(("offset".to_string(), o.clone()));
            }
            let query_refs: Vec<(&str, String)> = query.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();

            let body = self
                .send_json(token, reqwest::Method::GET, &format!("/{base_id}/{table_id}"), &query_refs, None)
                .await?;

            let records_json = body
                .get("records")
                .cloned()
                .ok_or_else(|| EngineError::fetch_missing_field("records"))?;
            let page: Vec<SorRecord> = serde_json::from_value(records_json)
                .map_err(|e| EngineError::validation(format!("record decode failed: {e}")))?;
            out.extend(page);

            offset = body.get("offset").and_then(|v| v.as_str()).map(str::to_string);
            if offset.is_none() {
                break;
            }
        }

        Ok(out)
    }

    async fn create_records(
        &self,
        token: &str,
        base_id: &str,
        table_id: &str,
        records: &[SorRecord],
    ) -> EngineResult<Vec<SorRecord>> {
        check_batch_size(records.len())?;
        let body = serde_json::json!({ "records": records, "typecast": true });
        let resp = self
            .send_json(token, reqwest::Method::POST, &format!("/{base_id}/{table_id}"), &[], Some(&body))
            .await?;
        let created = resp
            .get("records")
            .cloned()
            .ok_or_else(|| EngineError::fetch_missing_field("records"))?;
        serde_json::from_value(created)
            .map_err(|e| EngineError::validation(format!("created-record decode failed: {e}")))
    }

    async fn update_records(
        &self,
        token: &str,
        base_id: &str,
        table_id: &str,
        records: &[SorRecord],
    ) -> EngineResult<Vec<SorRecord>> {
        check_batch_size(records.len())?;
        let body = serde_json::json!({ "records": records, "typecast": true });
        let resp = self
            .send_json(token, reqwest::Method::PATCH, &format!("/{base_id}/{table_id}"), &[], Some(&body))
            .await?;
        let updated = resp
            .get("records")
            .cloned()
            .ok_or_else(|| EngineError::fetch_missing_field("records"))?;
        serde_json::from_value(updated)
            .map_err(|e| EngineError::validation(format!("updated-record decode failed: {e}")))
    }

    async fn delete_records(
        &self,
        token: &str,
        base_id: &str,
        table_id: &str,
        record_ids: &[String],
    ) -> EngineResult<()> {
        check_batch_size(record_ids.len())?;
        let query: Vec<(&str, String)> = record_ids.iter().map(|id| ("records[]", id.clone())).collect();
        self.send_json(token, reqwest::Method::DELETE, &format!("/{base_id}/{table_id}"), &query, None)
            .await?;
        Ok(())
    }
}

trait FetchMissingField {
    fn fetch_missing_field(field: &str) -> Self;
}

impl FetchMissingField for EngineError {
    fn fetch_missing_field(field: &str) -> Self {
        EngineError::new(
            xsync_schemas::ErrorKind::Fetch,
            format!("SOR response missing expected field '{field}'"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_over_ten_is_rejected() {
        let records: Vec<SorRecord> = (0..11)
            .map(|i| SorRecord {
                id: i.to_string(),
                fields: Default::default(),
            })
            .collect();
        assert!(check_batch_size(records.len()).is_err());
        assert!(check_batch_size(10).is_ok());
    }

}
