//! Canonical enquiry model shared by every upstream source and the dashboard payload.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "enquiry-core";

/// Canonical column ids, in the order the dashboard renders them.
pub const CANONICAL_FIELD_IDS: [&str; 9] = [
    "status",
    "email",
    "phone",
    "enquiry_type",
    "event_date",
    "guest_count",
    "budget",
    "lead_source",
    "notes",
];

pub const UNKNOWN_NAME: &str = "Unknown";

/// One canonical column cell. `value` carries the upstream raw value when the source has one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnValue {
    pub id: String,
    pub text: String,
    pub value: Option<String>,
}

impl ColumnValue {
    pub fn empty(id: &str) -> Self {
        Self {
            id: id.to_string(),
            text: String::new(),
            value: None,
        }
    }
}

/// Canonical enquiry record as served to the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub column_values: Vec<ColumnValue>,
}

impl Entry {
    /// Builds an entry whose columns follow [`CANONICAL_FIELD_IDS`] exactly.
    ///
    /// Cells supplied for unknown ids are dropped; canonical ids with no supplied cell get an
    /// empty one.
    pub fn with_canonical_fields(
        id: impl Into<String>,
        name: impl Into<String>,
        created_at: impl Into<String>,
        cells: Vec<ColumnValue>,
    ) -> Self {
        let mut by_id: HashMap<String, ColumnValue> =
            cells.into_iter().map(|c| (c.id.clone(), c)).collect();
        let column_values = CANONICAL_FIELD_IDS
            .iter()
            .map(|field_id| {
                by_id
                    .remove(*field_id)
                    .unwrap_or_else(|| ColumnValue::empty(field_id))
            })
            .collect();
        Self {
            id: id.into(),
            name: name.into(),
            created_at: created_at.into(),
            column_values,
        }
    }

    pub fn field(&self, field_id: &str) -> Option<&ColumnValue> {
        self.column_values.iter().find(|c| c.id == field_id)
    }

    pub fn field_text(&self, field_id: &str) -> &str {
        self.field(field_id).map(|c| c.text.as_str()).unwrap_or("")
    }
}

/// `"<first> <last>"` trimmed, or [`UNKNOWN_NAME`] when both parts are blank.
pub fn compose_name(first: &str, last: &str) -> String {
    let joined = format!("{} {}", first.trim(), last.trim());
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        UNKNOWN_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Normalizes an upstream timestamp to RFC 3339 UTC. Unparseable input is passed through.
pub fn normalize_timestamp(raw: &str) -> String {
    let raw = raw.trim();
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => format_timestamp(ts.with_timezone(&Utc)),
        Err(_) => raw.to_string(),
    }
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Working merge state: one entry per id, last write wins.
///
/// Iteration order follows the most recent write of each id.
#[derive(Debug, Clone, Default)]
pub struct EntryCollection {
    entries: HashMap<String, (u64, Entry)>,
    next_seq: u64,
}

impl EntryCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, entry: Entry) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(entry.id.clone(), (seq, entry));
    }

    pub fn merge_all(&mut self, entries: impl IntoIterator<Item = Entry>) {
        for entry in entries {
            self.merge(entry);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Entry> {
        self.entries.get(id).map(|(_, e)| e)
    }

    pub fn into_entries(self) -> Vec<Entry> {
        let mut rows: Vec<(u64, Entry)> = self.entries.into_values().collect();
        rows.sort_by_key(|(seq, _)| *seq);
        rows.into_iter().map(|(_, e)| e).collect()
    }
}

/// `{"data":{"boards":[{"items_page":{"items":[...]}}]},"_method":..,"_count":..}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardPayload {
    pub data: BoardsEnvelope,
    #[serde(rename = "_method")]
    pub method: String,
    #[serde(rename = "_count")]
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardsEnvelope {
    pub boards: Vec<BoardEnvelope>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardEnvelope {
    pub items_page: ItemsPage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemsPage {
    pub items: Vec<Entry>,
}

impl DashboardPayload {
    pub fn new(items: Vec<Entry>, method: impl Into<String>) -> Self {
        let count = items.len();
        Self {
            data: BoardsEnvelope {
                boards: vec![BoardEnvelope {
                    items_page: ItemsPage { items },
                }],
            },
            method: method.into(),
            count,
        }
    }

    pub fn items(&self) -> &[Entry] {
        self.data
            .boards
            .first()
            .map(|b| b.items_page.items.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, email: &str) -> Entry {
        Entry::with_canonical_fields(
            id,
            "Jo Bloggs",
            "2026-02-24T12:00:00Z",
            vec![ColumnValue {
                id: "email".into(),
                text: email.into(),
                value: None,
            }],
        )
    }

    #[test]
    fn canonical_fields_are_always_complete_and_ordered() {
        let e = Entry::with_canonical_fields(
            "1",
            "x",
            "",
            vec![
                ColumnValue { id: "notes".into(), text: "hi".into(), value: None },
                ColumnValue { id: "not_canonical".into(), text: "drop".into(), value: None },
            ],
        );
        let ids: Vec<&str> = e.column_values.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, CANONICAL_FIELD_IDS.to_vec());
        assert_eq!(e.field_text("notes"), "hi");
        assert_eq!(e.field_text("email"), "");
    }

    #[test]
    fn merge_is_idempotent() {
        let batch = vec![entry("1", "a@x.com"), entry("2", "b@x.com")];
        let mut once = EntryCollection::new();
        once.merge_all(batch.clone());
        let mut twice = EntryCollection::new();
        twice.merge_all(batch.clone());
        twice.merge_all(batch);
        assert_eq!(once.into_entries(), twice.into_entries());
    }

    #[test]
    fn last_write_wins_per_id() {
        let mut c = EntryCollection::new();
        c.merge(entry("7", "first@x.com"));
        c.merge(entry("8", "other@x.com"));
        c.merge(entry("7", "second@x.com"));
        assert_eq!(c.len(), 2);
        assert_eq!(c.get("7").unwrap().field_text("email"), "second@x.com");
        let order: Vec<String> = c.into_entries().into_iter().map(|e| e.id).collect();
        assert_eq!(order, vec!["8".to_string(), "7".to_string()]);
    }

    #[test]
    fn compose_name_trims_and_defaults() {
        assert_eq!(compose_name(" Ada ", ""), "Ada");
        assert_eq!(compose_name("Ada", "Lovelace"), "Ada Lovelace");
        assert_eq!(compose_name("", "  "), "Unknown");
    }

    #[test]
    fn timestamps_normalize_to_utc() {
        assert_eq!(normalize_timestamp("2026-02-24T14:00:00+02:00"), "2026-02-24T12:00:00Z");
        assert_eq!(normalize_timestamp("yesterday"), "yesterday");
    }

    #[test]
    fn payload_serializes_with_wire_names() {
        let payload = DashboardPayload::new(vec![entry("1", "a@x.com")], "standard");
        let v = serde_json::to_value(&payload).unwrap();
        assert_eq!(v["_method"], "standard");
        assert_eq!(v["_count"], 1);
        let item = &v["data"]["boards"][0]["items_page"]["items"][0];
        assert_eq!(item["created_at"], "2026-02-24T12:00:00Z");
        assert_eq!(item["column_values"][1]["id"], "email");
        assert!(item["column_values"][0]["value"].is_null());
    }
}
