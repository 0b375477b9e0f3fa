//! Core row model and the canonical <-> external schema codec for donorsync.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const CRATE_NAME: &str = "donorsync-core";

/// Reserved external column carrying a JSON-encoded metadata blob.
pub const META_FIELD: &str = "_meta";

/// Column used as the ordering/identity key across snapshots.
pub const DATE_FIELD: &str = "date";

/// Insertion-ordered mapping of field name to scalar (or nested) value.
pub type FieldMap = Map<String, Value>;

/// One exported row, keyed by external column name.
///
/// Rows inside a snapshot are expected to arrive sorted by `date` descending. That ordering
/// comes from the portal export and is not checked here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(FieldMap);

impl Row {
    pub fn new(fields: FieldMap) -> Self {
        Self(fields)
    }

    /// Value of the `date` column when it is present and textual.
    pub fn date(&self) -> Option<&str> {
        self.0.get(DATE_FIELD).and_then(Value::as_str)
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn fields(&self) -> &FieldMap {
        &self.0
    }

    pub fn into_fields(self) -> FieldMap {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl From<FieldMap> for Row {
    fn from(fields: FieldMap) -> Self {
        Self(fields)
    }
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("external column {external:?} is mapped by both {first:?} and {second:?}")]
    DuplicateExternalName {
        external: String,
        first: String,
        second: String,
    },
    #[error("invalid _meta payload: {0}")]
    InvalidMeta(#[source] serde_json::Error),
}

/// Canonical field key -> external column name, configured per upload destination.
///
/// External names are unique so the mapping can be inverted for incoming reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, String>", into = "BTreeMap<String, String>")]
pub struct CanonicalFieldSchema {
    forward: BTreeMap<String, String>,
    inverse: BTreeMap<String, String>,
}

impl TryFrom<BTreeMap<String, String>> for CanonicalFieldSchema {
    type Error = SchemaError;

    fn try_from(forward: BTreeMap<String, String>) -> Result<Self, Self::Error> {
        Self::new(forward)
    }
}

impl From<CanonicalFieldSchema> for BTreeMap<String, String> {
    fn from(schema: CanonicalFieldSchema) -> Self {
        schema.forward
    }
}

impl CanonicalFieldSchema {
    pub fn new(forward: BTreeMap<String, String>) -> Result<Self, SchemaError> {
        let mut inverse = BTreeMap::new();
        for (canonical, external) in &forward {
            if let Some(first) = inverse.insert(external.clone(), canonical.clone()) {
                return Err(SchemaError::DuplicateExternalName {
                    external: external.clone(),
                    first,
                    second: canonical.clone(),
                });
            }
        }
        Ok(Self { forward, inverse })
    }

    pub fn from_pairs<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, SchemaError> {
        Self::new(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    pub fn canonical_keys(&self) -> impl Iterator<Item = &str> {
        self.forward.keys().map(String::as_str)
    }

    /// Forward lookup; unmapped keys pass through unchanged.
    pub fn external_name<'a>(&'a self, canonical: &'a str) -> &'a str {
        self.forward
            .get(canonical)
            .map(String::as_str)
            .unwrap_or(canonical)
    }

    /// Inverse lookup; unmapped columns pass through unchanged.
    pub fn canonical_key<'a>(&'a self, external: &'a str) -> &'a str {
        self.inverse
            .get(external)
            .map(String::as_str)
            .unwrap_or(external)
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Reshape an external row into canonical keys.
    ///
    /// Every schema key is present in the result; keys the source omitted hold `null`. The
    /// reserved `_meta` column is parsed out of the flat fields into [`NormalizedRecord::meta`];
    /// a null or empty `_meta` stays in the flat fields untouched.
    pub fn normalize(&self, external: &FieldMap) -> Result<NormalizedRecord, SchemaError> {
        self.normalize_with_id(None, external)
    }

    pub fn normalize_with_id(
        &self,
        id: Option<String>,
        external: &FieldMap,
    ) -> Result<NormalizedRecord, SchemaError> {
        let mut fields: FieldMap = self
            .forward
            .keys()
            .map(|key| (key.clone(), Value::Null))
            .collect();
        let mut meta = None;

        for (column, value) in external {
            if column == META_FIELD {
                if let Some(parsed) = decode_meta(value)? {
                    meta = Some(parsed);
                    continue;
                }
            }
            fields.insert(self.canonical_key(column).to_string(), value.clone());
        }

        Ok(NormalizedRecord { id, fields, meta })
    }

    /// Reshape a canonical-keyed object into the external column naming.
    ///
    /// Null values are dropped and a surviving `_meta` value is re-encoded as a JSON string.
    pub fn denormalize(&self, object: &FieldMap) -> DenormalizedPayload {
        let mut out = FieldMap::new();
        for (key, value) in object {
            if value.is_null() {
                continue;
            }
            let column = self.external_name(key);
            if column == META_FIELD {
                out.insert(column.to_string(), encode_meta(value));
            } else {
                out.insert(column.to_string(), value.clone());
            }
        }
        DenormalizedPayload(out)
    }

    /// Inverse of [`Self::normalize`] for a full record, metadata included.
    pub fn denormalize_record(&self, record: &NormalizedRecord) -> DenormalizedPayload {
        let mut object = record.fields.clone();
        if let Some(meta) = &record.meta {
            object.insert(META_FIELD.to_string(), meta.clone());
        }
        self.denormalize(&object)
    }
}

fn decode_meta(value: &Value) -> Result<Option<Value>, SchemaError> {
    match value {
        Value::Null => Ok(None),
        Value::String(raw) if raw.is_empty() => Ok(None),
        Value::String(raw) => serde_json::from_str(raw)
            .map(Some)
            .map_err(SchemaError::InvalidMeta),
        other => Ok(Some(other.clone())),
    }
}

fn encode_meta(value: &Value) -> Value {
    match value {
        Value::String(_) => value.clone(),
        other => Value::String(other.to_string()),
    }
}

/// A row reshaped into canonical keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    /// Opaque identifier assigned by the record store, when the record came back from one.
    pub id: Option<String>,
    pub fields: FieldMap,
    #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl NormalizedRecord {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// True when the key is declared by the schema but the source left it empty.
    pub fn is_null(&self, key: &str) -> bool {
        matches!(self.fields.get(key), Some(Value::Null))
    }
}

/// Canonical object mapped back to external column names, ready for a record-store write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DenormalizedPayload(FieldMap);

impl DenormalizedPayload {
    pub fn fields(&self) -> &FieldMap {
        &self.0
    }

    pub fn into_fields(self) -> FieldMap {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> FieldMap {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn donor_schema() -> CanonicalFieldSchema {
        CanonicalFieldSchema::from_pairs([
            ("amount", "Amount ($)"),
            ("donor_name", "Donor Name"),
            ("date", "date"),
            ("email", "Email"),
        ])
        .expect("schema")
    }

    #[test]
    fn normalize_parses_meta_and_seeds_nulls() {
        let schema = donor_schema();
        let row = map(json!({"Amount ($)": "12", "_meta": "{\"src\":\"x\"}"}));

        let record = schema.normalize(&row).expect("normalize");

        assert_eq!(record.get("amount"), Some(&json!("12")));
        assert_eq!(record.meta, Some(json!({"src": "x"})));
        assert!(record.is_null("donor_name"));
        assert!(record.is_null("date"));
        assert!(record.is_null("email"));
        assert!(record.get(META_FIELD).is_none());
        assert_eq!(record.fields.len(), 4);
    }

    #[test]
    fn unmapped_columns_pass_through_both_ways() {
        let schema = donor_schema();
        let row = map(json!({"Campaign": "spring", "Donor Name": "Ada"}));

        let record = schema.normalize(&row).expect("normalize");
        assert_eq!(record.get("Campaign"), Some(&json!("spring")));
        assert_eq!(record.get("donor_name"), Some(&json!("Ada")));

        let payload = schema.denormalize_record(&record);
        assert_eq!(payload.fields(), &row);
    }

    #[test]
    fn round_trip_restores_non_null_fields() {
        let schema = donor_schema();
        let row = map(json!({
            "date": "2024-01-05",
            "Amount ($)": "9",
            "Email": "",
        }));

        let payload = schema.denormalize_record(&schema.normalize(&row).expect("normalize"));

        assert_eq!(payload.fields(), &row);
    }

    #[test]
    fn denormalize_strips_nulls_and_encodes_meta() {
        let schema = donor_schema();
        let object = map(json!({
            "amount": 5,
            "email": null,
            "_meta": {"src": "x"},
        }));

        let payload = schema.denormalize(&object);

        assert_eq!(
            payload.fields(),
            &map(json!({"Amount ($)": 5, "_meta": "{\"src\":\"x\"}"}))
        );
    }

    #[test]
    fn empty_meta_stays_in_flat_fields() {
        let schema = donor_schema();
        let row = map(json!({"Amount ($)": "3", "_meta": ""}));
        let record = schema.normalize(&row).expect("normalize");

        assert!(record.meta.is_none());
        assert_eq!(record.get("_meta"), Some(&json!("")));
        assert_eq!(schema.denormalize_record(&record).fields(), &row);
    }

    #[test]
    fn malformed_meta_is_rejected() {
        let schema = donor_schema();
        let err = schema
            .normalize(&map(json!({"_meta": "{not json"})))
            .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidMeta(_)));
    }

    #[test]
    fn duplicate_external_names_are_rejected() {
        let err = CanonicalFieldSchema::from_pairs([("a", "Same"), ("b", "Same")]).unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateExternalName { .. }));

        let parsed: Result<CanonicalFieldSchema, _> =
            serde_json::from_value(json!({"a": "Same", "b": "Same"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn row_exposes_date_key() {
        let row: Row = [("date", "2024-01-02"), ("amt", "5")].into_iter().collect();
        assert_eq!(row.date(), Some("2024-01-02"));
        assert_eq!(row.len(), 2);
    }
}
