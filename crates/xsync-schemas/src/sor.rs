//! SOR-side schema and record shapes shared by the client, type mapper,
//! and linked-record resolver (§4.1/§4.3).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The exhaustive SOR field type taxonomy from §4.3. `options` carries the
/// allowed choice set for the two select variants; `linked_table_id`
/// identifies the related table for `LinkedRecords`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SorFieldType {
    Text,
    Email,
    Url,
    Phone,
    Number,
    Currency,
    Percent,
    Duration,
    Rating,
    Checkbox,
    Date,
    DateTime,
    SingleSelect { options: Vec<String> },
    MultipleSelects { options: Vec<String> },
    LinkedRecords { linked_table_id: String },
    Attachments,
    Collaborator,
    Formula,
    Rollup,
    Count,
    Lookup,
    AutoNumber,
    CreatedTime,
    CreatedBy,
    LastModifiedTime,
    LastModifiedBy,
    Button,
    Barcode,
}

impl SorFieldType {
    /// §4.3: these types are computed by the SOR and a Grid→SOR write must
    /// never attempt to set them.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            SorFieldType::Formula
                | SorFieldType::Rollup
                | SorFieldType::Count
                | SorFieldType::Lookup
                | SorFieldType::AutoNumber
                | SorFieldType::CreatedTime
                | SorFieldType::CreatedBy
                | SorFieldType::LastModifiedTime
                | SorFieldType::LastModifiedBy
                | SorFieldType::Button
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSchema {
    pub id: String,
    pub name: String,
    pub field_type: SorFieldType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub id: String,
    pub name: String,
    pub primary_field_id: String,
    pub fields: Vec<FieldSchema>,
}

impl TableSchema {
    pub fn field(&self, id: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub fn primary_field(&self) -> Option<&FieldSchema> {
        self.field(&self.primary_field_id)
    }
}

/// A SOR record: an opaque id plus a field-id-keyed bag of raw JSON values,
/// the shape returned by `ListRecords` before type mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SorRecord {
    pub id: String,
    pub fields: HashMap<String, serde_json::Value>,
}
