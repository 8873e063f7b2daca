//! Domain model, field normalization, and the snapshot differ.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "bridge-core";

/// Composite business key matching one source row to one remote page.
///
/// Parts are stored pre-normalized (trimmed, lower-cased), so two keys
/// compare equal whenever the underlying identities do, regardless of how
/// either store cased or padded them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalKey(Vec<String>);

impl CanonicalKey {
    pub fn new(parts: Vec<String>) -> Self {
        Self(parts.into_iter().map(|p| normalize_identity(&p)).collect())
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// Identity normalization: the two stores may disagree on casing and
/// surrounding whitespace for the same logical id.
pub fn normalize_identity(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Normalized scalar value of one record field.
///
/// `Absent` stands in for SQL NULL, a missing remote property, and the
/// empty string alike; the equivalence is enforced at construction so
/// plain `==` is the comparison rule everywhere downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Absent,
    Text(String),
    Number(f64),
    Date(NaiveDate),
    Tags(BTreeSet<String>),
}

impl FieldValue {
    pub fn from_text(raw: Option<&str>) -> Self {
        match raw {
            Some(s) if !s.trim().is_empty() => Self::Text(s.to_string()),
            _ => Self::Absent,
        }
    }

    /// Numeric-like text: empty or whitespace-only means absent, never zero.
    pub fn number_from_str(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Self::Absent;
        }
        match trimmed.parse::<f64>() {
            Ok(n) => Self::Number(n),
            Err(_) => Self::Absent,
        }
    }

    /// Accepts `YYYY-MM-DD`, tolerating a trailing time component.
    pub fn date_from_str(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.len() < 10 {
            return Self::Absent;
        }
        match NaiveDate::parse_from_str(&trimmed[..10], "%Y-%m-%d") {
            Ok(d) => Self::Date(d),
            Err(_) => Self::Absent,
        }
    }

    /// Comma-joined multi-valued field: order-insensitive, duplicates collapse.
    pub fn tags_from_joined(raw: &str) -> Self {
        let set: BTreeSet<String> = raw
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if set.is_empty() {
            Self::Absent
        } else {
            Self::Tags(set)
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// Stable display form used in key parts and summary lines. Whole
    /// numbers print without a fractional part so `12` and `12.0` agree
    /// across the two stores.
    pub fn display_string(&self) -> String {
        match self {
            Self::Absent => String::new(),
            Self::Text(s) => s.clone(),
            Self::Number(n) if n.fract() == 0.0 && n.is_finite() => format!("{}", *n as i64),
            Self::Number(n) => format!("{n}"),
            Self::Date(d) => d.to_string(),
            Self::Tags(set) => set.iter().cloned().collect::<Vec<_>>().join(", "),
        }
    }
}

/// Which side of the sync a record snapshot came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    Source,
    Remote { page_id: String },
}

impl Origin {
    pub fn page_id(&self) -> Option<&str> {
        match self {
            Self::Source => None,
            Self::Remote { page_id } => Some(page_id),
        }
    }
}

/// The unit of reconciliation: one logical entity as seen by one side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub key: CanonicalKey,
    pub fields: BTreeMap<String, FieldValue>,
    pub origin: Origin,
}

impl CanonicalRecord {
    pub fn field(&self, name: &str) -> &FieldValue {
        self.fields.get(name).unwrap_or(&FieldValue::Absent)
    }
}

/// Property shape of a record field on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Title,
    Text,
    Number,
    Date,
    Select,
    MultiSelect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

/// Fixed, known schema of one sync job's record shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSchema {
    pub key_fields: Vec<String>,
    pub fields: Vec<FieldSpec>,
}

impl RecordSchema {
    pub fn kind_of(&self, name: &str) -> Option<FieldKind> {
        self.fields.iter().find(|f| f.name == name).map(|f| f.kind)
    }

    /// Every key field must be declared; catches registry typos up front.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.key_fields.is_empty() {
            return Err(SchemaError::EmptyKey);
        }
        for key in &self.key_fields {
            if self.kind_of(key).is_none() {
                return Err(SchemaError::UnknownKeyField(key.clone()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("schema declares no key fields")]
    EmptyKey,
    #[error("key field `{0}` is not declared in the field list")]
    UnknownKeyField(String),
}

/// Parameterized SQL for the optional source-side synced flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncFlagSql {
    pub mark_sql: String,
    pub reset_sql: String,
}

/// One sync job: a source query, a remote database, and the schema that
/// maps between them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: String,
    pub remote_database_id: String,
    /// SQL with a `{where_clause}` placeholder filled in per fetch scope.
    pub query: String,
    #[serde(default)]
    pub unsynced_filter: Option<String>,
    pub schema: RecordSchema,
    #[serde(default)]
    pub sync_flag: Option<SyncFlagSql>,
}

/// A record set aside during extraction: never mutated, always reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidRecord {
    /// Remote page id when the record came from the remote side.
    pub page_id: Option<String>,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Raw source row as delivered by the repository: column name to JSON scalar.
pub type SourceRow = BTreeMap<String, JsonValue>;

fn scalar_to_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(FieldValue::number_from_str(&n.to_string()).display_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn normalize_scalar(kind: FieldKind, value: &JsonValue) -> FieldValue {
    match kind {
        FieldKind::Title | FieldKind::Text | FieldKind::Select => {
            FieldValue::from_text(scalar_to_text(value).as_deref())
        }
        FieldKind::Number => match value {
            JsonValue::Number(n) => n.as_f64().map(FieldValue::Number).unwrap_or(FieldValue::Absent),
            JsonValue::String(s) => FieldValue::number_from_str(s),
            _ => FieldValue::Absent,
        },
        FieldKind::Date => match value {
            JsonValue::String(s) => FieldValue::date_from_str(s),
            _ => FieldValue::Absent,
        },
        FieldKind::MultiSelect => match value {
            JsonValue::String(s) => FieldValue::tags_from_joined(s),
            _ => FieldValue::Absent,
        },
    }
}

fn key_from_fields(
    schema: &RecordSchema,
    fields: &BTreeMap<String, FieldValue>,
) -> Result<CanonicalKey, String> {
    let mut parts = Vec::with_capacity(schema.key_fields.len());
    for name in &schema.key_fields {
        let value = fields.get(name).unwrap_or(&FieldValue::Absent);
        if value.is_absent() {
            return Err(format!("missing identity field `{name}`"));
        }
        match value {
            FieldValue::Tags(_) => return Err(format!("identity field `{name}` is multi-valued")),
            other => parts.push(other.display_string()),
        }
    }
    Ok(CanonicalKey::new(parts))
}

/// Normalizes one source row against the job schema.
///
/// Missing or malformed non-identity fields fail closed to `Absent`; a
/// missing or empty identity part makes the whole record invalid.
pub fn extract_source(schema: &RecordSchema, row: &SourceRow) -> Result<CanonicalRecord, InvalidRecord> {
    let mut fields = BTreeMap::new();
    for spec in &schema.fields {
        let raw = row.get(&spec.name).unwrap_or(&JsonValue::Null);
        fields.insert(spec.name.clone(), normalize_scalar(spec.kind, raw));
    }
    let key = key_from_fields(schema, &fields).map_err(|reason| InvalidRecord {
        page_id: None,
        reason,
    })?;
    Ok(CanonicalRecord {
        key,
        fields,
        origin: Origin::Source,
    })
}

fn rich_fragment_text(fragments: &JsonValue) -> Option<String> {
    let first = fragments.as_array()?.first()?;
    if let Some(plain) = first.get("plain_text").and_then(|v| v.as_str()) {
        return Some(plain.to_string());
    }
    first
        .get("text")
        .and_then(|t| t.get("content"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Digs one property out of a remote page's property bag, failing closed to
/// `Absent` on any missing or unexpected nesting.
pub fn remote_property_value(kind: FieldKind, property: &JsonValue) -> FieldValue {
    match kind {
        FieldKind::Title => {
            FieldValue::from_text(property.get("title").and_then(rich_fragment_text).as_deref())
        }
        FieldKind::Text => FieldValue::from_text(
            property
                .get("rich_text")
                .and_then(rich_fragment_text)
                .as_deref(),
        ),
        FieldKind::Number => property
            .get("number")
            .and_then(|v| v.as_f64())
            .map(FieldValue::Number)
            .unwrap_or(FieldValue::Absent),
        FieldKind::Date => property
            .get("date")
            .and_then(|d| d.get("start"))
            .and_then(|v| v.as_str())
            .map(FieldValue::date_from_str)
            .unwrap_or(FieldValue::Absent),
        FieldKind::Select => FieldValue::from_text(
            property
                .get("select")
                .and_then(|s| s.get("name"))
                .and_then(|v| v.as_str()),
        ),
        FieldKind::MultiSelect => {
            let set: BTreeSet<String> = property
                .get("multi_select")
                .and_then(|v| v.as_array())
                .map(|opts| {
                    opts.iter()
                        .filter_map(|o| o.get("name").and_then(|n| n.as_str()))
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default();
            if set.is_empty() {
                FieldValue::Absent
            } else {
                FieldValue::Tags(set)
            }
        }
    }
}

/// Normalizes one remote page against the job schema.
pub fn extract_remote(
    schema: &RecordSchema,
    page_id: &str,
    properties: &JsonValue,
) -> Result<CanonicalRecord, InvalidRecord> {
    let mut fields = BTreeMap::new();
    for spec in &schema.fields {
        let prop = properties.get(&spec.name).unwrap_or(&JsonValue::Null);
        fields.insert(spec.name.clone(), remote_property_value(spec.kind, prop));
    }
    let key = key_from_fields(schema, &fields).map_err(|reason| InvalidRecord {
        page_id: Some(page_id.to_string()),
        reason,
    })?;
    Ok(CanonicalRecord {
        key,
        fields,
        origin: Origin::Remote {
            page_id: page_id.to_string(),
        },
    })
}

/// Builds the remote property bag for a create or update call, the inverse
/// of [`remote_property_value`].
pub fn remote_properties(schema: &RecordSchema, record: &CanonicalRecord) -> JsonValue {
    let mut properties = serde_json::Map::new();
    for spec in &schema.fields {
        let value = record.field(&spec.name);
        let prop = match spec.kind {
            FieldKind::Title => serde_json::json!({
                "title": [{ "text": { "content": value.display_string() } }]
            }),
            FieldKind::Text => serde_json::json!({
                "rich_text": [{ "text": { "content": value.display_string() } }]
            }),
            FieldKind::Number => match value {
                FieldValue::Number(n) => serde_json::json!({ "number": n }),
                _ => serde_json::json!({ "number": JsonValue::Null }),
            },
            FieldKind::Date => match value {
                FieldValue::Date(d) => serde_json::json!({ "date": { "start": d.to_string() } }),
                _ => serde_json::json!({ "date": JsonValue::Null }),
            },
            FieldKind::Select => serde_json::json!({
                "select": { "name": value.display_string() }
            }),
            FieldKind::MultiSelect => {
                let options: Vec<JsonValue> = match value {
                    FieldValue::Tags(set) => set
                        .iter()
                        .map(|tag| serde_json::json!({ "name": tag }))
                        .collect(),
                    _ => Vec::new(),
                };
                serde_json::json!({ "multi_select": options })
            }
        };
        properties.insert(spec.name.clone(), prop);
    }
    JsonValue::Object(properties)
}

// ---------------------------------------------------------------------------
// Differ
// ---------------------------------------------------------------------------

/// Field-level change carried by a `NeedsUpdate` entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub old: FieldValue,
    pub new: FieldValue,
}

/// A source record that exists remotely but differs in at least one field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingUpdate {
    pub record: CanonicalRecord,
    pub page_id: String,
    pub changed_fields: BTreeMap<String, FieldChange>,
}

/// A remote page whose key collided with an earlier page in the same
/// snapshot. First match wins; these are never matched or mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateAnomaly {
    pub key: CanonicalKey,
    pub page_id: String,
}

/// Three-way partition of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiffReport {
    pub updates: Vec<PendingUpdate>,
    pub creates: Vec<CanonicalRecord>,
    pub orphans: Vec<CanonicalRecord>,
    pub unchanged: Vec<CanonicalRecord>,
    pub anomalies: Vec<DuplicateAnomaly>,
}

/// Compares two complete snapshots and partitions the source records into
/// updates, creates, and unchanged, plus remote-only orphans.
///
/// Orphans are reported, never deleted; deletion stays a human decision.
pub fn diff_snapshots(
    source_records: &[CanonicalRecord],
    remote_records: &[CanonicalRecord],
) -> DiffReport {
    let mut report = DiffReport::default();

    let mut remote_index: HashMap<&CanonicalKey, &CanonicalRecord> =
        HashMap::with_capacity(remote_records.len());
    for remote in remote_records {
        if remote_index.contains_key(&remote.key) {
            report.anomalies.push(DuplicateAnomaly {
                key: remote.key.clone(),
                page_id: remote
                    .origin
                    .page_id()
                    .unwrap_or_default()
                    .to_string(),
            });
        } else {
            remote_index.insert(&remote.key, remote);
        }
    }

    let mut source_keys: BTreeSet<&CanonicalKey> = BTreeSet::new();
    for source in source_records {
        source_keys.insert(&source.key);
        match remote_index.get(&source.key) {
            Some(remote) => {
                let mut changed = BTreeMap::new();
                for (name, new_value) in &source.fields {
                    let old_value = remote.field(name);
                    if old_value != new_value {
                        changed.insert(
                            name.clone(),
                            FieldChange {
                                old: old_value.clone(),
                                new: new_value.clone(),
                            },
                        );
                    }
                }
                if changed.is_empty() {
                    report.unchanged.push(source.clone());
                } else {
                    report.updates.push(PendingUpdate {
                        record: source.clone(),
                        page_id: remote
                            .origin
                            .page_id()
                            .unwrap_or_default()
                            .to_string(),
                        changed_fields: changed,
                    });
                }
            }
            None => report.creates.push(source.clone()),
        }
    }

    for remote in remote_records {
        if !source_keys.contains(&remote.key)
            && remote_index
                .get(&remote.key)
                .is_some_and(|first| std::ptr::eq(*first, remote))
        {
            report.orphans.push(remote.clone());
        }
    }

    report
}

// ---------------------------------------------------------------------------
// Per-record mutation outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Created,
    Updated,
    Skipped,
    Failed,
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Result of driving one record through mutate + verify.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncOutcome {
    pub key: CanonicalKey,
    pub action: SyncAction,
    pub verified: bool,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> RecordSchema {
        RecordSchema {
            key_fields: vec!["user_id".into(), "program_id".into()],
            fields: vec![
                FieldSpec { name: "user_id".into(), kind: FieldKind::Title },
                FieldSpec { name: "program_id".into(), kind: FieldKind::Number },
                FieldSpec { name: "email".into(), kind: FieldKind::Text },
                FieldSpec { name: "Long_Name".into(), kind: FieldKind::Text },
                FieldSpec { name: "Time".into(), kind: FieldKind::Number },
                FieldSpec { name: "DateTaken".into(), kind: FieldKind::Date },
                FieldSpec { name: "Category".into(), kind: FieldKind::MultiSelect },
            ],
        }
    }

    fn source_row(user_id: &str, program_id: i64, time: &str) -> SourceRow {
        BTreeMap::from([
            ("user_id".to_string(), json!(user_id)),
            ("program_id".to_string(), json!(program_id)),
            ("email".to_string(), json!("a@x.edu")),
            ("Long_Name".to_string(), json!("Course Design")),
            ("Time".to_string(), json!(time)),
            ("DateTaken".to_string(), json!("2024-05-01")),
            ("Category".to_string(), json!("Teaching, Assessment")),
        ])
    }

    fn remote_page(user_id: &str, program_id: f64, time: JsonValue) -> JsonValue {
        json!({
            "user_id": { "title": [{ "text": { "content": user_id } }] },
            "program_id": { "number": program_id },
            "email": { "rich_text": [{ "text": { "content": "a@x.edu" } }] },
            "Long_Name": { "rich_text": [{ "text": { "content": "Course Design" } }] },
            "Time": { "number": time },
            "DateTaken": { "date": { "start": "2024-05-01" } },
            "Category": { "multi_select": [{ "name": "Assessment" }, { "name": "Teaching" }] },
        })
    }

    #[test]
    fn empty_text_and_null_are_the_same_value() {
        assert_eq!(FieldValue::from_text(Some("")), FieldValue::Absent);
        assert_eq!(FieldValue::from_text(None), FieldValue::Absent);
        assert_eq!(FieldValue::from_text(Some("  ")), FieldValue::Absent);
        assert_ne!(FieldValue::from_text(Some("x")), FieldValue::Absent);
    }

    #[test]
    fn whitespace_number_is_absent_not_zero() {
        assert_eq!(FieldValue::number_from_str("   "), FieldValue::Absent);
        assert_eq!(FieldValue::number_from_str("3"), FieldValue::Number(3.0));
        assert_eq!(FieldValue::number_from_str("not-a-number"), FieldValue::Absent);
    }

    #[test]
    fn identity_parts_fold_case_and_whitespace() {
        let a = CanonicalKey::new(vec!["Dr.Smith@X.EDU ".into()]);
        let b = CanonicalKey::new(vec!["dr.smith@x.edu".into()]);
        assert_eq!(a, b);
    }

    #[test]
    fn tags_ignore_order_and_duplicates() {
        let a = FieldValue::tags_from_joined("Teaching, Assessment, Teaching");
        let b = FieldValue::tags_from_joined("Assessment,Teaching");
        assert_eq!(a, b);
    }

    #[test]
    fn date_tolerates_datetime_suffix() {
        assert_eq!(
            FieldValue::date_from_str("2024-05-01 00:00:00"),
            FieldValue::Date(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap())
        );
        assert_eq!(FieldValue::date_from_str("05/01/2024"), FieldValue::Absent);
    }

    #[test]
    fn missing_identity_field_invalidates_the_record() {
        let schema = schema();
        let mut row = source_row("12", 3, "2");
        row.insert("user_id".to_string(), json!(""));
        let err = extract_source(&schema, &row).unwrap_err();
        assert!(err.reason.contains("user_id"));
        assert!(err.page_id.is_none());
    }

    #[test]
    fn malformed_non_identity_field_defaults_to_absent() {
        let schema = schema();
        let mut row = source_row("12", 3, "2");
        row.insert("DateTaken".to_string(), json!("garbage"));
        let record = extract_source(&schema, &row).unwrap();
        assert_eq!(record.field("DateTaken"), &FieldValue::Absent);
    }

    #[test]
    fn source_and_remote_extractions_agree() {
        let schema = schema();
        let source = extract_source(&schema, &source_row("12", 3, "2")).unwrap();
        let remote = extract_remote(&schema, "page-1", &remote_page("12", 3.0, json!(2.0))).unwrap();
        assert_eq!(source.key, remote.key);
        let report = diff_snapshots(&[source], &[remote]);
        assert!(report.updates.is_empty());
        assert!(report.creates.is_empty());
        assert_eq!(report.unchanged.len(), 1);
    }

    #[test]
    fn empty_time_matches_remote_null_time() {
        let schema = schema();
        let source = extract_source(&schema, &source_row("5", 9, "")).unwrap();
        let remote =
            extract_remote(&schema, "page-1", &remote_page("5", 9.0, JsonValue::Null)).unwrap();
        let report = diff_snapshots(&[source], &[remote]);
        assert_eq!(report.unchanged.len(), 1);
        assert!(report.updates.is_empty());
    }

    #[test]
    fn diff_carries_exactly_the_changed_field() {
        let schema = schema();
        let source = extract_source(&schema, &source_row("12", 3, "3")).unwrap();
        let remote = extract_remote(&schema, "page-1", &remote_page("12", 3.0, json!(2.0))).unwrap();
        let report = diff_snapshots(&[source], &[remote]);
        assert_eq!(report.updates.len(), 1);
        let update = &report.updates[0];
        assert_eq!(update.page_id, "page-1");
        assert_eq!(update.changed_fields.len(), 1);
        let change = update.changed_fields.get("Time").expect("Time changed");
        assert_eq!(change.old, FieldValue::Number(2.0));
        assert_eq!(change.new, FieldValue::Number(3.0));
    }

    #[test]
    fn source_only_key_becomes_a_create() {
        let schema = schema();
        let source = extract_source(&schema, &source_row("1", 2, "3")).unwrap();
        let report = diff_snapshots(&[source], &[]);
        assert_eq!(report.creates.len(), 1);
        assert_eq!(report.creates[0].key.to_string(), "1/2");
    }

    #[test]
    fn remote_only_key_becomes_an_orphan() {
        let schema = schema();
        let remote = extract_remote(&schema, "page-9", &remote_page("99", 1.0, json!(1.0))).unwrap();
        let report = diff_snapshots(&[], &[remote]);
        assert_eq!(report.orphans.len(), 1);
        assert_eq!(report.orphans[0].origin.page_id(), Some("page-9"));
    }

    #[test]
    fn duplicate_remote_key_first_match_wins() {
        let schema = schema();
        let source = extract_source(&schema, &source_row("12", 3, "3")).unwrap();
        let first = extract_remote(&schema, "page-1", &remote_page("12", 3.0, json!(2.0))).unwrap();
        let second = extract_remote(&schema, "page-2", &remote_page("12", 3.0, json!(7.0))).unwrap();
        let report = diff_snapshots(&[source], &[first, second]);
        assert_eq!(report.updates.len(), 1);
        assert_eq!(report.updates[0].page_id, "page-1");
        assert_eq!(report.anomalies.len(), 1);
        assert_eq!(report.anomalies[0].page_id, "page-2");
        assert!(report.orphans.is_empty());
    }

    #[test]
    fn diff_is_idempotent_on_unchanged_snapshots() {
        let schema = schema();
        let source = vec![extract_source(&schema, &source_row("12", 3, "2")).unwrap()];
        let remote =
            vec![extract_remote(&schema, "page-1", &remote_page("12", 3.0, json!(2.0))).unwrap()];
        for _ in 0..2 {
            let report = diff_snapshots(&source, &remote);
            assert!(report.updates.is_empty());
            assert!(report.creates.is_empty());
        }
    }

    #[test]
    fn payload_round_trips_through_remote_extraction() {
        let schema = schema();
        let record = extract_source(&schema, &source_row("12", 3, "2")).unwrap();
        let properties = remote_properties(&schema, &record);
        let back = extract_remote(&schema, "page-1", &properties).unwrap();
        assert_eq!(record.key, back.key);
        assert_eq!(record.fields, back.fields);
    }

    #[test]
    fn schema_rejects_undeclared_key_field() {
        let bad = RecordSchema {
            key_fields: vec!["missing".into()],
            fields: vec![FieldSpec { name: "email".into(), kind: FieldKind::Title }],
        };
        assert_eq!(bad.validate(), Err(SchemaError::UnknownKeyField("missing".into())));
    }
}
