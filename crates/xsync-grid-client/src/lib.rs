//! Typed wrapper over the grid service's REST API (§4.1, §6).
//!
//! Shares the SOR client's backoff-with-jitter policy but keeps its own
//! rate limiter instance — the grid and SOR token buckets are independent
//! (§5: "shared across pipelines targeting the same SOR account").

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use xsync_ratelimit::{retry_with_backoff, RateLimiter, RetryPolicy};
use xsync_schemas::{EngineError, EngineResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetMetadata {
    pub sheet_id: i64,
    pub title: String,
    pub row_count: u32,
    pub column_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkbookMetadata {
    pub title: String,
    pub sheets: Vec<SheetMetadata>,
}

#[derive(Debug, Clone)]
pub struct DropdownValidation {
    pub column_index: u32,
    pub choices: Vec<String>,
    /// `true` for single-select (reject values outside `choices`), `false`
    /// for multi-select (lenient) per §4.7's dropdown-propagation policy.
    pub strict: bool,
}

#[derive(Debug, Clone)]
pub struct WriteConfirmation {
    pub updated_range: String,
    pub updated_rows: usize,
}

/// The typed grid operations from §4.1's contract table.
#[async_trait]
pub trait GridClient: Send + Sync {
    async fn get_metadata(&self, token: &str, workbook_id: &str) -> EngineResult<WorkbookMetadata>;

    async fn get_values(
        &self,
        token: &str,
        workbook_id: &str,
        sheet_title: &str,
        a1_range: Option<&str>,
    ) -> EngineResult<Vec<Vec<Value>>>;

    async fn update_values(
        &self,
        token: &str,
        workbook_id: &str,
        a1_range: &str,
        values: &[Vec<Value>],
    ) -> EngineResult<WriteConfirmation>;

    async fn append_rows(
        &self,
        token: &str,
        workbook_id: &str,
        sheet_title: &str,
        values: &[Vec<Value>],
    ) -> EngineResult<WriteConfirmation>;

    async fn ensure_column_count(&self, token: &str, workbook_id: &str, sheet_id: i64, n: u32) -> EngineResult<()>;

    async fn hide_column(&self, token: &str, workbook_id: &str, sheet_id: i64, column_index: u32) -> EngineResult<()>;

    async fn batch_set_dropdown_validation(
        &self,
        token: &str,
        workbook_id: &str,
        sheet_id: i64,
        validations: &[DropdownValidation],
    ) -> EngineResult<()>;
}

/// Translates a zero-based column index to spreadsheet letters: base-26
/// `A..Z, AA, AB, ...` with `column 0 → "A"` (§4.1).
pub fn column_index_to_letter(mut index: u32) -> String {
    let mut letters = Vec::new();
    loop {
        let rem = index % 26;
        letters.push((b'A' + rem as u8) as char);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    letters.iter().rev().collect()
}

pub struct HttpGridClient {
    http: reqwest::Client,
    base_url: String,
    limiter: Arc<RateLimiter>,
    retry_policy: RetryPolicy,
}

impl HttpGridClient {
    pub fn new(base_url: impl Into<String>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            limiter,
            retry_policy: RetryPolicy::default(),
        }
    }

    fn classify_status(status: reqwest::StatusCode, body: &str) -> EngineError {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            EngineError::rate_limit(format!("grid rate limit: {body}"))
        } else if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            EngineError::oauth(format!("grid auth error {status}: {body}"))
        } else if status.is_server_error() {
            EngineError::network(format!("grid server error {status}: {body}"))
        } else {
            EngineError::validation(format!("grid request rejected {status}: {body}"))
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
                    .map_err(|e| EngineError::network(format!("grid request failed: {e}")))?;

                let status = resp.status();
                let text = resp
                    .text()
                    .await
                    .map_err(|e| EngineError::network(format!("grid response read failed: {e}")))?;

                if !status.is_success() {
                    return Err(Self::classify_status(status, &text));
                }

                serde_json::from_str(&text)
                    .map_err(|e| EngineError::validation(format!("grid response decode failed: {e}")))
            }
        })
        .await
    }
}

#[async_trait]
impl GridClient for HttpGridClient {
    async fn get_metadata(&self, token: &str, workbook_id: &str) -> EngineResult<WorkbookMetadata> {
        let body = self
            .send_json(token, reqwest::Method::GET, &format!("/spreadsheets/{workbook_id}"), &[], None)
            .await?;
        serde_json::from_value(body).map_err(|e| EngineError::validation(format!("workbook metadata decode failed: {e}")))
    }

    async fn get_values(
        &self,
        token: &str,
        workbook_id: &str,
        sheet_title: &str,
        a1_range: Option<&str>,
    ) -> EngineResult<Vec<Vec<Value>>> {
        let range = match a1_range {
            Some(r) => format!("{sheet_title}!{r}"),
            None => sheet_title.to_string(),
        };
        let body = self
            .send_json(
                token,
                reqwest::Method::GET,
                &format!("/spreadsheets/{workbook_id}/values/{range}"),
                &[],
                None,
            )
            .await?;
        let values = body.get("values").cloned().unwrap_or(Value::Array(vec![]));
        serde_json::from_value(values).map_err(|e| EngineError::validation(format!("values decode failed: {e}")))
    }

    async fn update_values(
        &self,
        token: &str,
        workbook_id: &str,
        a1_range: &str,
        values: &[Vec<Value>],
    ) -> EngineResult<WriteConfirmation> {
        let body = serde_json::json!({ "range": a1_range, "majorDimension": "ROWS", "values": values });
        let resp = self
            .send_json(
                token,
                reqwest::Method::PUT,
                &format!("/spreadsheets/{workbook_id}/values/{a1_range}"),
                &[("valueInputOption", "USER_ENTERED".to_string())],
                Some(&body),
            )
            .await?;
        Ok(WriteConfirmation {
            updated_range: resp.get("updatedRange").and_then(|v| v.as_str()).unwrap_or(a1_range).to_string(),
            updated_rows: resp.get("updatedRows").and_then(|v| v.as_u64()).unwrap_or(values.len() as u64) as usize,
        })
    }

    async fn append_rows(
        &self,
        token: &str,
        workbook_id: &str,
        sheet_title: &str,
        values: &[Vec<Value>],
    ) -> EngineResult<WriteConfirmation> {
        let body = serde_json::json!({ "majorDimension": "ROWS", "values": values });
        let resp = self
            .send_json(
                token,
                reqwest::Method::POST,
                &format!("/spreadsheets/{workbook_id}/values/{sheet_title}:append"),
                &[
                    ("valueInputOption", "USER_ENTERED".to_string()),
                    ("insertDataOption", "INSERT_ROWS".to_string()),
                ],
                Some(&body),
            )
            .await?;
        let updates = resp.get("updates").cloned().unwrap_or(Value::Null);
        Ok(WriteConfirmation {
            updated_range: updates.get("updatedRange").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            updated_rows: updates.get("updatedRows").and_then(|v| v.as_u64()).unwrap_or(values.len() as u64) as usize,
        })
    }

    async fn ensure_column_count(&self, token: &str, workbook_id: &str, sheet_id: i64, n: u32) -> EngineResult<()> {
        let body = serde_json::json!({
            "requests": [{
                "appendDimension": { "sheetId": sheet_id, "dimension": "COLUMNS", "length": n }
            }]
        });
        self.send_json(token, reqwest::Method::POST, &format!("/spreadsheets/{workbook_id}:batchUpdate"), &[], Some(&body))
            .await?;
        Ok(())
    }

    async fn hide_column(&self, token: &str, workbook_id: &str, sheet_id: i64, column_index: u32) -> EngineResult<()> {
        let body = serde_json::json!({
            "requests": [{
                "updateDimensionProperties": {
                    "range": {
                        "sheetId": sheet_id,
                        "dimension": "COLUMNS",
                        "startIndex": column_index,
                        "endIndex": column_index + 1
                    },
                    "properties": { "hiddenByUser": true },
                    "fields": "hiddenByUser"
                }
            }]
        });
        self.send_json(token, reqwest::Method::POST, &format!("/spreadsheets/{workbook_id}:batchUpdate"), &[], Some(&body))
            .await?;
        Ok(())
    }

    async fn batch_set_dropdown_validation(
        &self,
        token: &str,
        workbook_id: &str,
        sheet_id: i64,
        validations: &[DropdownValidation],
    ) -> EngineResult<()> {
        let requests: Vec<Value> = validations
            .iter()
            .map(|v| {
                serde_json::json!({
                    "setDataValidation": {
                        "range": {
                            "sheetId": sheet_id,
                            "startColumnIndex": v.column_index,
                            "endColumnIndex": v.column_index + 1
                        },
                        "rule": {
                            "condition": {
                                "type": "ONE_OF_LIST",
                                "values": v.choices.iter().map(|c| serde_json::json!({"userEnteredValue": c})).collect::<Vec<_>>()
                            },
                            "strict": v.strict,
                            "showCustomUi": true
                        }
                    }
                })
            })
            .collect();
        let body = serde_json::json!({ "requests": requests });
        self.send_json(token, reqwest::Method::POST, &format!("/spreadsheets/{workbook_id}:batchUpdate"), &[], Some(&body))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_letters_follow_base_26() {
        assert_eq!(column_index_to_letter(0), "A");
        assert_eq!(column_index_to_letter(25), "Z");
        assert_eq!(column_index_to_letter(26), "AA");
        assert_eq!(column_index_to_letter(27), "AB");
    }

    #[test]
    fn reserved_id_column_is_aa() {
        assert_eq!(column_index_to_letter(xsync_schemas::RESERVED_ID_COLUMN), "AA");
    }
}
