//! Bidirectional value conversion between SOR field types and grid cell
//! values (§4.3). Every conversion is pure and returns `{value, errors,
//! warnings}` so the calling pipeline can aggregate these per record
//! without this crate knowing about records, runs, or I/O.
//!
//! `linkedRecords` conversions stop short of id/name resolution — that
//! requires the cache-backed `LinkedRecordResolver` (`xsync-linked`), which
//! this crate does not depend on. `grid_to_sor` for a linked field returns
//! the raw split display names; the pipeline resolves them afterward.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use xsync_schemas::SorFieldType;

#[derive(Debug, Clone, Default)]
pub struct ConversionResult {
    pub value: Value,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ConversionResult {
    fn ok(value: Value) -> Self {
        Self { value, errors: Vec::new(), warnings: Vec::new() }
    }

    fn error(message: impl Into<String>) -> Self {
        Self { value: Value::Null, errors: vec![message.into()], warnings: Vec::new() }
    }

    fn dropped_with_warning(message: impl Into<String>) -> Self {
        Self { value: Value::Null, errors: Vec::new(), warnings: vec![message.into()] }
    }
}

/// §4.3: SOR value → grid cell representation.
///
/// `linked_names` must already hold the resolved display names for a
/// `linkedRecords` field, in the same order as the underlying record ids.
pub fn sor_to_grid(field_type: &SorFieldType, value: Option<&Value>, linked_names: &[String]) -> ConversionResult {
    use SorFieldType::*;
    match field_type {
        Text | Email | Url | Phone => match value {
            Some(Value::String(s)) => ConversionResult::ok(Value::String(s.trim().to_string())),
            Some(Value::Null) | None => ConversionResult::ok(Value::String(String::new())),
            Some(other) => ConversionResult::ok(Value::String(other.to_string())),
        },
        Number | Currency | Percent | Duration | Rating => match value.and_then(Value::as_f64) {
            Some(n) => ConversionResult::ok(serde_json::json!(n)),
            None => match value {
                Some(Value::Null) | None => ConversionResult::ok(Value::String(String::new())),
                Some(_) => ConversionResult::error("expected a numeric value"),
            },
        },
        Checkbox => {
            let b = value.and_then(Value::as_bool).unwrap_or(false);
            ConversionResult::ok(Value::String(if b { "TRUE".into() } else { "FALSE".into() }))
        }
        Date | DateTime => match value.and_then(Value::as_str) {
            Some(s) => match parse_flexible_datetime(s) {
                Some(dt) => ConversionResult::ok(Value::String(dt.to_rfc3339())),
                None => ConversionResult::error(format!("unparseable date/time value '{s}'")),
            },
            None => ConversionResult::ok(Value::String(String::new())),
        },
        SingleSelect { .. } => match value.and_then(Value::as_str) {
            Some(s) => ConversionResult::ok(Value::String(s.to_string())),
            None => ConversionResult::ok(Value::String(String::new())),
        },
        MultipleSelects { .. } => match value.and_then(Value::as_array) {
            Some(arr) => {
                let names: Vec<String> = arr.iter().filter_map(Value::as_str).map(str::to_string).collect();
                ConversionResult::ok(Value::String(names.join(", ")))
            }
            None => ConversionResult::ok(Value::String(String::new())),
        },
        LinkedRecords { .. } => ConversionResult::ok(Value::String(linked_names.join(", "))),
        Attachments => match value.and_then(Value::as_array) {
            Some(arr) => {
                let urls: Vec<String> = arr
                    .iter()
                    .filter_map(|a| a.get("url").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect();
                ConversionResult::ok(Value::String(urls.join(",")))
            }
            None => ConversionResult::ok(Value::String(String::new())),
        },
        Collaborator => match value {
            Some(Value::Array(arr)) => {
                let names: Vec<String> = arr
                    .iter()
                    .filter_map(|c| c.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect();
                ConversionResult::ok(Value::String(names.join(", ")))
            }
            Some(Value::Object(_)) => {
                let name = value.and_then(|v| v.get("name")).and_then(Value::as_str).unwrap_or_default();
                ConversionResult::ok(Value::String(name.to_string()))
            }
            _ => ConversionResult::ok(Value::String(String::new())),
        },
        Formula | Rollup | Count | Lookup | AutoNumber | CreatedTime | CreatedBy | LastModifiedTime
        | LastModifiedBy | Button => ConversionResult::ok(Value::String(
            value.map(|v| best_effort_stringify(v)).unwrap_or_default(),
        )),
        Barcode => {
            let text = value.and_then(|v| v.get("text")).and_then(Value::as_str).unwrap_or_default();
            ConversionResult::ok(Value::String(text.to_string()))
        }
    }
}

/// §4.3: grid cell → SOR value. Read-only field types always warn-and-drop
/// regardless of cell contents, since a Grid→SOR write must never attempt
/// them.
pub fn grid_to_sor(field_type: &SorFieldType, cell: &Value) -> ConversionResult {
    use SorFieldType::*;
    let text = cell_as_str(cell);

    if field_type.is_read_only() {
        return ConversionResult::dropped_with_warning("field is read-only; write skipped");
    }

    match field_type {
        Text | Email | Url | Phone => ConversionResult::ok(Value::String(text.trim().to_string())),
        Number | Currency | Percent | Duration | Rating => match text.trim().parse::<f64>() {
            Ok(n) if n.is_finite() => ConversionResult::ok(serde_json::json!(n)),
            _ if text.trim().is_empty() => ConversionResult::ok(Value::Null),
            _ => ConversionResult::error(format!("'{text}' is not a valid number")),
        },
        Checkbox => {
            let t = text.trim().to_ascii_uppercase();
            match t.as_str() {
                "TRUE" | "1" | "YES" => ConversionResult::ok(Value::Bool(true)),
                "FALSE" | "0" | "NO" | "" => ConversionResult::ok(Value::Bool(false)),
                _ => ConversionResult::error(format!("'{text}' is not a recognized checkbox value")),
            }
        }
        Date | DateTime => {
            if text.trim().is_empty() {
                return ConversionResult::ok(Value::Null);
            }
            match parse_flexible_datetime(&text) {
                Some(dt) => ConversionResult::ok(Value::String(dt.to_rfc3339())),
                None => ConversionResult::error(format!("unparseable date/time value '{text}'")),
            }
        }
        SingleSelect { options } => {
            if text.trim().is_empty() {
                return ConversionResult::ok(Value::Null);
            }
            match options.iter().find(|o| o.eq_ignore_ascii_case(text.trim())) {
                Some(matched) => ConversionResult::ok(Value::String(matched.clone())),
                None => ConversionResult::error(format!(
                    "'{text}' is not an allowed option; expected one of: {}",
                    options.join(", ")
                )),
            }
        }
        MultipleSelects { options } => {
            let mut matched = Vec::new();
            let mut warnings = Vec::new();
            for raw in text.split(',') {
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match options.iter().find(|o| o.eq_ignore_ascii_case(trimmed)) {
                    Some(opt) => matched.push(Value::String(opt.clone())),
                    None => warnings.push(format!("unknown multi-select option '{trimmed}' ignored")),
                }
            }
            ConversionResult { value: Value::Array(matched), errors: Vec::new(), warnings }
        }
        LinkedRecords { .. } => {
            let names: Vec<String> = text.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect();
            ConversionResult::ok(serde_json::json!(names))
        }
        Attachments => ConversionResult::dropped_with_warning("attachments are unsupported on write"),
        Collaborator => ConversionResult::dropped_with_warning("collaborator fields are unsupported on write"),
        Barcode => ConversionResult::dropped_with_warning("barcode fields are unsupported on write"),
        Formula | Rollup | Count | Lookup | AutoNumber | CreatedTime | CreatedBy | LastModifiedTime
        | LastModifiedBy | Button => unreachable!("handled by the read-only check above"),
    }
}

fn cell_as_str(cell: &Value) -> String {
    match cell {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn best_effort_stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Accepts RFC3339 first, then a handful of common locale date(-time)
/// formats, normalizing everything to UTC (§4.3: "parse ISO-8601 or common
/// locale formats").
fn parse_flexible_datetime(s: &str) -> Option<DateTime<Utc>> {
    let trimmed = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%m/%d/%Y %H:%M:%S", "%m/%d/%Y"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(ndt, Utc));
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(DateTime::from_naive_utc_and_offset(d.and_hms_opt(0, 0, 0).unwrap(), Utc));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkbox_recognizes_case_insensitive_truthy_values() {
        for v in ["true", "TRUE", "1", "yes", "Yes"] {
            let r = grid_to_sor(&SorFieldType::Checkbox, &Value::String(v.into()));
            assert_eq!(r.value, Value::Bool(true), "{v}");
        }
        for v in ["false", "0", "no", ""] {
            let r = grid_to_sor(&SorFieldType::Checkbox, &Value::String(v.into()));
            assert_eq!(r.value, Value::Bool(false), "{v}");
        }
    }

    #[test]
    fn single_select_rejects_unknown_option() {
        let field = SorFieldType::SingleSelect { options: vec!["Free".into(), "Pro".into()] };
        let r = grid_to_sor(&field, &Value::String("Gold".into()));
        assert!(!r.errors.is_empty());
    }

    #[test]
    fn single_select_matches_case_insensitively() {
        let field = SorFieldType::SingleSelect { options: vec!["Free".into(), "Pro".into()] };
        let r = grid_to_sor(&field, &Value::String("pro".into()));
        assert_eq!(r.value, Value::String("Pro".into()));
    }

    #[test]
    fn multiple_selects_warns_on_unknown_and_keeps_known() {
        let field = SorFieldType::MultipleSelects { options: vec!["Red".into(), "Blue".into()] };
        let r = grid_to_sor(&field, &Value::String("Red, Green".into()));
        assert_eq!(r.value, serde_json::json!(["Red"]));
        assert_eq!(r.warnings.len(), 1);
    }

    #[test]
    fn read_only_fields_are_dropped_with_warning_not_error() {
        let r = grid_to_sor(&SorFieldType::Formula, &Value::String("42".into()));
        assert!(r.errors.is_empty());
        assert_eq!(r.warnings.len(), 1);
        assert_eq!(r.value, Value::Null);
    }

    #[test]
    fn attachments_and_collaborators_are_dropped_on_write() {
        assert!(!grid_to_sor(&SorFieldType::Attachments, &Value::String("x".into())).warnings.is_empty());
        assert!(!grid_to_sor(&SorFieldType::Collaborator, &Value::String("x".into())).warnings.is_empty());
    }

    #[test]
    fn number_rejects_non_numeric_text() {
        let r = grid_to_sor(&SorFieldType::Number, &Value::String("abc".into()));
        assert!(!r.errors.is_empty());
    }

    #[test]
    fn linked_records_split_on_comma_and_trim() {
        let field = SorFieldType::LinkedRecords { linked_table_id: "tbl1".into() };
        let r = grid_to_sor(&field, &Value::String("Ada, Bob ,  Cleo".into()));
        assert_eq!(r.value, serde_json::json!(["Ada", "Bob", "Cleo"]));
    }

    #[test]
    fn sor_to_grid_joins_linked_names_with_comma_space() {
        let field = SorFieldType::LinkedRecords { linked_table_id: "tbl1".into() };
        let r = sor_to_grid(&field, None, &["Ada".into(), "Bob".into()]);
        assert_eq!(r.value, Value::String("Ada, Bob".into()));
    }
}
