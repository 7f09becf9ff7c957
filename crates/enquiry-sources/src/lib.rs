//! Upstream source definitions: query strategies, field mappers and activity-log reconstruction.
//!
//! Two native shapes are understood. Board sources speak a GraphQL items API where each item
//! carries `column_values`; contact sources speak a REST API where each contact carries loosely
//! keyed `customFields`. Both are mapped onto the canonical [`Entry`] layout.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use enquiry_core::{compose_name, format_timestamp, normalize_timestamp, ColumnValue, Entry};
use enquiry_upstream::{Endpoint, RequestMethod, UpstreamRequest};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "enquiry-sources";

/// Bumped whenever an alias list below changes meaning.
pub const ALIAS_TABLE_VERSION: u32 = 1;

pub const ACTIVITY_LOG_LIMIT: usize = 500;
/// Activity timestamps count 100ns ticks since the Unix epoch.
pub const ACTIVITY_TICKS_PER_MILLI: i64 = 10_000;
pub const CREATED_EVENT: &str = "create_pulse";

pub const STATUS_BOOKED: &str = "Booked";
pub const STATUS_PENDING: &str = "Pending";
pub const BOOKED_KEYWORDS: [&str; 4] = ["booked", "confirmed", "deposit paid", "deposit_paid"];

/// Max page size the contact API accepts.
pub const CONTACT_PAGE_LIMIT: usize = 100;
pub const CONTACT_API_VERSION: &str = "2021-07-28";

const ITEM_FIELDS: &str = "id name created_at column_values { id text value column { title } }";
const SAMPLE_FIELDS: &str = "id name created_at";
const PROBE_SAMPLE_LIMIT: usize = 5;
const PROBE_ACTIVITY_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Board,
    /// Same board, queried with archived items included. Paired with a [`SourceKind::Board`]
    /// source so archived and moved enquiries merge into the active list.
    BoardArchived,
    Contacts,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("record has no usable id")]
    MissingId,
    #[error("activity event {event_id}: {message}")]
    MalformedPayload { event_id: String, message: String },
}

/// Default success predicate: the strategy returned at least one record.
pub fn non_empty(count: usize) -> bool {
    count > 0
}

/// Accepts any completed request, including an empty one.
pub fn any_count(_count: usize) -> bool {
    true
}

/// One parameterized attempt against a source, plus its success predicate.
#[derive(Debug, Clone)]
pub struct QueryStrategy {
    pub name: &'static str,
    pub method: RequestMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<JsonValue>,
    /// JSON pointer to the record array inside the response body.
    pub records_pointer: &'static str,
    pub accept: fn(usize) -> bool,
}

impl QueryStrategy {
    pub fn graphql(name: &'static str, query: String, records_pointer: &'static str) -> Self {
        Self {
            name,
            method: RequestMethod::Post,
            path: String::new(),
            query: Vec::new(),
            body: Some(json!({ "query": query })),
            records_pointer,
            accept: non_empty,
        }
    }

    pub fn rest_get(
        name: &'static str,
        path: impl Into<String>,
        query: Vec<(String, String)>,
        records_pointer: &'static str,
    ) -> Self {
        Self {
            name,
            method: RequestMethod::Get,
            path: path.into(),
            query,
            body: None,
            records_pointer,
            accept: non_empty,
        }
    }

    pub fn rest_post(
        name: &'static str,
        path: impl Into<String>,
        body: JsonValue,
        records_pointer: &'static str,
    ) -> Self {
        Self {
            name,
            method: RequestMethod::Post,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
            records_pointer,
            accept: non_empty,
        }
    }

    pub fn with_accept(mut self, accept: fn(usize) -> bool) -> Self {
        self.accept = accept;
        self
    }

    pub fn build(&self, source_key: &str, endpoint: &Endpoint) -> UpstreamRequest {
        UpstreamRequest {
            source_key: source_key.to_string(),
            method: self.method,
            url: endpoint.url_for(&self.path),
            auth: endpoint.auth.clone(),
            headers: endpoint.headers.clone(),
            query: self.query.clone(),
            body: self.body.clone(),
        }
    }

    pub fn is_success(&self, record_count: usize) -> bool {
        (self.accept)(record_count)
    }

    /// Records at `records_pointer`. A missing or non-array node yields no records.
    pub fn extract_records(&self, body: &JsonValue) -> Vec<JsonValue> {
        body.pointer(self.records_pointer)
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
    }
}

/// One configured upstream.
#[derive(Debug, Clone)]
pub struct Source {
    pub key: String,
    pub kind: SourceKind,
    pub endpoint: Endpoint,
    /// Board id for board sources, location id for contact sources.
    pub container_id: String,
    pub page_limit: usize,
    /// Native custom-field id to canonical field id, for fields that carry no readable key.
    pub field_ids: BTreeMap<String, String>,
}

impl Source {
    pub fn board(
        key: impl Into<String>,
        endpoint: Endpoint,
        board_id: impl Into<String>,
        page_limit: usize,
    ) -> Self {
        Self {
            key: key.into(),
            kind: SourceKind::Board,
            endpoint,
            container_id: board_id.into(),
            page_limit: page_limit.max(1),
            field_ids: BTreeMap::new(),
        }
    }

    pub fn board_archived(
        key: impl Into<String>,
        endpoint: Endpoint,
        board_id: impl Into<String>,
        page_limit: usize,
    ) -> Self {
        Self {
            kind: SourceKind::BoardArchived,
            ..Self::board(key, endpoint, board_id, page_limit)
        }
    }

    pub fn contacts(
        key: impl Into<String>,
        endpoint: Endpoint,
        location_id: impl Into<String>,
        page_limit: usize,
    ) -> Self {
        Self {
            key: key.into(),
            kind: SourceKind::Contacts,
            endpoint: endpoint.with_header("Version", CONTACT_API_VERSION),
            container_id: location_id.into(),
            page_limit: page_limit.clamp(1, CONTACT_PAGE_LIMIT),
            field_ids: BTreeMap::new(),
        }
    }

    pub fn with_field_ids(mut self, field_ids: BTreeMap<String, String>) -> Self {
        self.field_ids = field_ids;
        self
    }

    fn sample(&self) -> Self {
        Self {
            page_limit: PROBE_SAMPLE_LIMIT,
            ..self.clone()
        }
    }

    fn archived_items_strategy(&self) -> QueryStrategy {
        QueryStrategy::graphql(
            "archived_rule",
            items_page_query(
                &self.container_id,
                self.page_limit,
                Some("include_archived: true"),
                ITEM_FIELDS,
            ),
            "/data/boards/0/items_page/items",
        )
    }

    /// Strategies in the order they should be attempted.
    pub fn strategies(&self) -> Vec<QueryStrategy> {
        match self.kind {
            SourceKind::Board => {
                let board = &self.container_id;
                let limit = self.page_limit;
                vec![
                    QueryStrategy::graphql(
                        "standard",
                        items_page_query(board, limit, None, ITEM_FIELDS),
                        "/data/boards/0/items_page/items",
                    ),
                    self.archived_items_strategy(),
                    QueryStrategy::graphql(
                        "items_field",
                        legacy_items_query(board, limit, ITEM_FIELDS),
                        "/data/boards/0/items",
                    ),
                ]
            }
            SourceKind::BoardArchived => vec![self.archived_items_strategy()],
            SourceKind::Contacts => vec![
                QueryStrategy::rest_post(
                    "contacts_search",
                    "/contacts/search",
                    json!({ "locationId": self.container_id, "pageLimit": self.page_limit }),
                    "/contacts",
                ),
                QueryStrategy::rest_get(
                    "contacts_list",
                    "/contacts/",
                    vec![
                        ("locationId".to_string(), self.container_id.clone()),
                        ("limit".to_string(), self.page_limit.to_string()),
                    ],
                    "/contacts",
                ),
            ],
        }
    }

    pub fn mapper(&self) -> Box<dyn FieldMapper> {
        match self.kind {
            SourceKind::Board | SourceKind::BoardArchived => Box::new(BoardItemMapper),
            SourceKind::Contacts => Box::new(ContactMapper::with_field_ids(self.field_ids.clone())),
        }
    }

    /// Bounded activity-log query, for sources that keep one. An archived view shares its
    /// board's log, so only the plain board source replays it.
    pub fn activity_log_strategy(&self) -> Option<QueryStrategy> {
        match self.kind {
            SourceKind::Board => Some(
                QueryStrategy::graphql(
                    "log_reconstruction",
                    activity_query(&self.container_id, ACTIVITY_LOG_LIMIT),
                    "/data/boards/0/activity_logs",
                )
                .with_accept(any_count),
            ),
            SourceKind::BoardArchived | SourceKind::Contacts => None,
        }
    }

    /// Exploratory queries used to inspect undocumented upstream behaviour.
    pub fn probes(&self) -> Vec<QueryStrategy> {
        let probe = |s: QueryStrategy| s.with_accept(any_count);
        match self.kind {
            SourceKind::Board => {
                let board = &self.container_id;
                vec![
                    probe(QueryStrategy::graphql(
                        "board",
                        format!("query {{ boards(ids: [{board}]) {{ id name state board_kind }} }}"),
                        "/data/boards",
                    )),
                    probe(QueryStrategy::graphql(
                        "active_items",
                        items_page_query(board, PROBE_SAMPLE_LIMIT, None, SAMPLE_FIELDS),
                        "/data/boards/0/items_page/items",
                    )),
                    probe(QueryStrategy::graphql(
                        "archived_rule_items",
                        items_page_query(
                            board,
                            PROBE_SAMPLE_LIMIT,
                            Some("include_archived: true"),
                            SAMPLE_FIELDS,
                        ),
                        "/data/boards/0/items_page/items",
                    )),
                    probe(QueryStrategy::graphql(
                        "items_field",
                        legacy_items_query(board, PROBE_SAMPLE_LIMIT, SAMPLE_FIELDS),
                        "/data/boards/0/items",
                    )),
                    probe(QueryStrategy::graphql(
                        "board_groups",
                        format!("query {{ boards(ids: [{board}]) {{ groups {{ id title archived }} }} }}"),
                        "/data/boards/0/groups",
                    )),
                    probe(QueryStrategy::graphql(
                        "board_columns",
                        format!("query {{ boards(ids: [{board}]) {{ columns {{ id title type }} }} }}"),
                        "/data/boards/0/columns",
                    )),
                    probe(QueryStrategy::graphql(
                        "recent_activity",
                        activity_query(board, PROBE_ACTIVITY_LIMIT),
                        "/data/boards/0/activity_logs",
                    )),
                    probe(QueryStrategy::graphql(
                        "empty_filter_items",
                        items_page_query(board, PROBE_SAMPLE_LIMIT, Some("rules: []"), SAMPLE_FIELDS),
                        "/data/boards/0/items_page/items",
                    )),
                ]
            }
            SourceKind::BoardArchived => vec![probe(QueryStrategy {
                name: "archived_rule_items",
                ..self.sample().archived_items_strategy()
            })],
            SourceKind::Contacts => {
                let mut strategies = self.sample().strategies();
                let list = strategies.pop().map(|s| QueryStrategy { name: "contacts_sample", ..s });
                let search = strategies.pop();
                search.into_iter().chain(list).map(probe).collect()
            }
        }
    }
}

fn items_page_query(board_id: &str, limit: usize, query_params: Option<&str>, fields: &str) -> String {
    let params = query_params
        .map(|p| format!(", query_params: {{ {p} }}"))
        .unwrap_or_default();
    format!(
        "query {{ boards(ids: [{board_id}]) {{ items_page(limit: {limit}{params}) {{ items {{ {fields} }} }} }} }}"
    )
}

fn legacy_items_query(board_id: &str, limit: usize, fields: &str) -> String {
    format!("query {{ boards(ids: [{board_id}]) {{ items(limit: {limit}) {{ {fields} }} }} }}")
}

fn activity_query(board_id: &str, limit: usize) -> String {
    format!(
        "query {{ boards(ids: [{board_id}]) {{ activity_logs(limit: {limit}) {{ id event data created_at }} }} }}"
    )
}

/// A value found under one alias of a native record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasValue {
    pub text: String,
    pub raw: Option<String>,
}

/// Flat `alias -> value` view over every key a native record exposes a value under.
///
/// Keys are normalized with [`normalize_alias`]. The first non-empty value written under an
/// alias is kept.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    values: HashMap<String, AliasValue>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, alias: &str, value: AliasValue) {
        let key = normalize_alias(alias);
        if key.is_empty() {
            return;
        }
        match self.values.get(&key) {
            Some(existing) if !existing.text.trim().is_empty() => {}
            _ => {
                self.values.insert(key, value);
            }
        }
    }

    pub fn get(&self, alias: &str) -> Option<&AliasValue> {
        self.values.get(&normalize_alias(alias))
    }

    /// First alias, in priority order, holding non-empty text.
    pub fn coalesce(&self, aliases: &[&str]) -> Option<&AliasValue> {
        aliases
            .iter()
            .filter_map(|alias| self.get(alias))
            .find(|v| !v.text.trim().is_empty())
    }

    pub fn coalesce_text(&self, aliases: &[&str]) -> String {
        self.coalesce(aliases)
            .map(|v| v.text.trim().to_string())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

pub fn normalize_alias(key: &str) -> String {
    key.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Alias priority list for one canonical field.
#[derive(Debug, Clone, Copy)]
pub struct FieldAliases {
    pub field_id: &'static str,
    pub aliases: &'static [&'static str],
}

pub const BOARD_FIELD_ALIASES: &[FieldAliases] = &[
    FieldAliases { field_id: "status", aliases: &["status", "status_1", "enquiry_status", "stage"] },
    FieldAliases { field_id: "email", aliases: &["email", "email_1", "e_mail", "email_address"] },
    FieldAliases { field_id: "phone", aliases: &["phone", "phone_1", "phone_number", "mobile"] },
    FieldAliases { field_id: "enquiry_type", aliases: &["enquiry_type", "dropdown", "type", "service"] },
    FieldAliases { field_id: "event_date", aliases: &["event_date", "date4", "date", "date_1"] },
    FieldAliases { field_id: "guest_count", aliases: &["guest_count", "numbers", "guests", "number_of_guests"] },
    FieldAliases { field_id: "budget", aliases: &["budget", "numbers1", "budget_range"] },
    FieldAliases { field_id: "lead_source", aliases: &["lead_source", "source", "how_did_you_hear_about_us"] },
    FieldAliases { field_id: "notes", aliases: &["notes", "long_text", "message", "text_1"] },
];

/// `status` is absent: contact status is derived from tags.
pub const CONTACT_FIELD_ALIASES: &[FieldAliases] = &[
    FieldAliases { field_id: "email", aliases: &["email", "email_address"] },
    FieldAliases { field_id: "phone", aliases: &["phone", "phone_number", "mobile"] },
    FieldAliases { field_id: "enquiry_type", aliases: &["enquiry_type", "type_of_enquiry", "service"] },
    FieldAliases { field_id: "event_date", aliases: &["event_date", "wedding_date", "date_of_event"] },
    FieldAliases { field_id: "guest_count", aliases: &["guest_count", "number_of_guests", "guests"] },
    FieldAliases { field_id: "budget", aliases: &["budget", "budget_range"] },
    FieldAliases { field_id: "lead_source", aliases: &["lead_source", "source", "attribution_source"] },
    FieldAliases { field_id: "notes", aliases: &["notes", "message", "enquiry_message"] },
];

const CONTACT_NAME_ALIASES: &[&str] = &["contactName", "name", "fullName"];
const CONTACT_FIRST_NAME_ALIASES: &[&str] = &["firstName", "first_name"];
const CONTACT_LAST_NAME_ALIASES: &[&str] = &["lastName", "last_name"];

fn canonical_cells(table: &AliasTable, fields: &[FieldAliases]) -> Vec<ColumnValue> {
    fields
        .iter()
        .map(|f| match table.coalesce(f.aliases) {
            Some(v) => ColumnValue {
                id: f.field_id.to_string(),
                text: v.text.trim().to_string(),
                value: v.raw.clone(),
            },
            None => ColumnValue::empty(f.field_id),
        })
        .collect()
}

/// Converts one native record into a canonical entry.
pub trait FieldMapper: Send + Sync {
    fn map_record(&self, record: &JsonValue) -> Result<Entry, MappingError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BoardItemMapper;

impl BoardItemMapper {
    /// Indexes every column value by column id and by column title.
    pub fn alias_table(record: &JsonValue) -> AliasTable {
        let mut table = AliasTable::new();
        let Some(columns) = record.get("column_values").and_then(|c| c.as_array()) else {
            return table;
        };
        for column in columns {
            let value = AliasValue {
                text: column.get("text").map(json_text).unwrap_or_default(),
                raw: column.get("value").and_then(raw_json),
            };
            if let Some(id) = column.get("id").and_then(|v| v.as_str()) {
                table.insert(id, value.clone());
            }
            if let Some(title) = column.pointer("/column/title").and_then(|v| v.as_str()) {
                table.insert(title, value);
            }
        }
        table
    }
}

impl FieldMapper for BoardItemMapper {
    fn map_record(&self, record: &JsonValue) -> Result<Entry, MappingError> {
        let id = record_id(record).ok_or(MappingError::MissingId)?;
        let table = Self::alias_table(record);
        let name = record
            .get("name")
            .map(json_text)
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| compose_name("", ""));
        let created_at = record
            .get("created_at")
            .map(json_text)
            .map(|ts| normalize_timestamp(&ts))
            .unwrap_or_default();
        Ok(Entry::with_canonical_fields(
            id,
            name,
            created_at,
            canonical_cells(&table, BOARD_FIELD_ALIASES),
        ))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContactMapper {
    field_ids: BTreeMap<String, String>,
}

impl ContactMapper {
    /// `field_ids` maps native custom-field ids onto canonical field ids. Without an entry,
    /// a custom field that only carries an id resolves through nothing.
    pub fn with_field_ids(field_ids: BTreeMap<String, String>) -> Self {
        Self { field_ids }
    }

    /// Indexes scalar top-level fields by their key and every custom field under its internal
    /// id, human key, field key (with and without the `contact.` prefix) and display name.
    /// A field whose id is mapped is also indexed under its canonical field id.
    pub fn alias_table(&self, record: &JsonValue) -> AliasTable {
        let mut table = AliasTable::new();
        if let Some(obj) = record.as_object() {
            for (key, value) in obj {
                if is_scalar(value) {
                    table.insert(
                        key,
                        AliasValue {
                            text: json_text(value),
                            raw: None,
                        },
                    );
                }
            }
        }

        let custom = record
            .get("customFields")
            .or_else(|| record.get("customField"))
            .and_then(|c| c.as_array());
        for field in custom.into_iter().flatten() {
            let raw_value = field
                .get("value")
                .or_else(|| field.get("field_value"))
                .or_else(|| field.get("fieldValue"))
                .unwrap_or(&JsonValue::Null);
            let value = AliasValue {
                text: json_text(raw_value),
                raw: raw_json(raw_value),
            };
            if let Some(canonical) = field
                .get("id")
                .and_then(|v| v.as_str())
                .and_then(|id| self.field_ids.get(id))
            {
                table.insert(canonical, value.clone());
            }
            for key in ["id", "key", "fieldKey", "name"] {
                let Some(alias) = field.get(key).and_then(|v| v.as_str()) else {
                    continue;
                };
                table.insert(alias, value.clone());
                if let Some(stripped) = alias.strip_prefix("contact.") {
                    table.insert(stripped, value.clone());
                }
            }
        }
        table
    }
}

impl FieldMapper for ContactMapper {
    fn map_record(&self, record: &JsonValue) -> Result<Entry, MappingError> {
        let id = record_id(record).ok_or(MappingError::MissingId)?;
        let table = self.alias_table(record);

        let explicit_name = table.coalesce_text(CONTACT_NAME_ALIASES);
        let name = if explicit_name.is_empty() {
            compose_name(
                &table.coalesce_text(CONTACT_FIRST_NAME_ALIASES),
                &table.coalesce_text(CONTACT_LAST_NAME_ALIASES),
            )
        } else {
            explicit_name
        };

        let created_at = record
            .get("dateAdded")
            .or_else(|| record.get("createdAt"))
            .map(json_text)
            .map(|ts| normalize_timestamp(&ts))
            .unwrap_or_default();

        let tags = contact_tags(record);
        let mut cells = canonical_cells(&table, CONTACT_FIELD_ALIASES);
        cells.push(ColumnValue {
            id: "status".to_string(),
            text: derive_status(&tags).to_string(),
            value: if tags.is_empty() {
                None
            } else {
                Some(JsonValue::from(tags.clone()).to_string())
            },
        });
        Ok(Entry::with_canonical_fields(id, name, created_at, cells))
    }
}

fn contact_tags(record: &JsonValue) -> Vec<String> {
    match record.get("tags") {
        Some(JsonValue::Array(items)) => items
            .iter()
            .map(json_text)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
        Some(JsonValue::String(s)) => s
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

/// "Booked" when any tag mentions a [`BOOKED_KEYWORDS`] entry, otherwise "Pending".
pub fn derive_status(tags: &[String]) -> &'static str {
    let booked = tags.iter().any(|tag| {
        let lower = tag.to_ascii_lowercase();
        BOOKED_KEYWORDS.iter().any(|kw| lower.contains(kw))
    });
    if booked {
        STATUS_BOOKED
    } else {
        STATUS_PENDING
    }
}

fn record_id(record: &JsonValue) -> Option<String> {
    let id = match record.get("id")? {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

fn is_scalar(value: &JsonValue) -> bool {
    matches!(
        value,
        JsonValue::String(_) | JsonValue::Number(_) | JsonValue::Bool(_)
    )
}

/// Display text for an arbitrary JSON value.
pub fn json_text(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Array(items) => items
            .iter()
            .map(json_text)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(", "),
        JsonValue::Object(obj) => obj
            .get("text")
            .or_else(|| obj.get("label"))
            .map(json_text)
            .unwrap_or_else(|| value.to_string()),
    }
}

fn raw_json(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Entries rebuilt from an activity log, plus the events that could not be decoded.
#[derive(Debug, Clone, Default)]
pub struct ReconstructionOutcome {
    pub entries: Vec<Entry>,
    pub created_events: usize,
    pub skipped: Vec<MappingError>,
}

/// Rebuilds approximate entries from "record created" activity events.
#[derive(Debug, Clone, Copy)]
pub struct LogReconstructor {
    limit: usize,
}

impl Default for LogReconstructor {
    fn default() -> Self {
        Self {
            limit: ACTIVITY_LOG_LIMIT,
        }
    }
}

impl LogReconstructor {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    pub fn reconstruct(&self, events: &[JsonValue]) -> ReconstructionOutcome {
        let mut outcome = ReconstructionOutcome::default();
        for event in events.iter().take(self.limit) {
            if event.get("event").and_then(|e| e.as_str()) != Some(CREATED_EVENT) {
                continue;
            }
            outcome.created_events += 1;
            match reconstruct_event(event) {
                Ok(entry) => outcome.entries.push(entry),
                Err(err) => outcome.skipped.push(err),
            }
        }
        outcome
    }
}

fn reconstruct_event(event: &JsonValue) -> Result<Entry, MappingError> {
    let event_id = event
        .get("id")
        .map(json_text)
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| "<unknown>".to_string());
    let malformed = |message: String| MappingError::MalformedPayload {
        event_id: event_id.clone(),
        message,
    };

    let payload = match event.get("data") {
        Some(JsonValue::String(text)) => serde_json::from_str::<JsonValue>(text)
            .map_err(|e| malformed(format!("undecodable payload: {e}")))?,
        Some(value) if value.is_object() => value.clone(),
        _ => return Err(malformed("missing payload".to_string())),
    };
    if !payload.is_object() {
        return Err(malformed("payload is not an object".to_string()));
    }

    let item_id = payload
        .get("pulse_id")
        .or_else(|| payload.get("item_id"))
        .map(json_text)
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| malformed("payload has no item id".to_string()))?;
    let name = payload
        .get("pulse_name")
        .or_else(|| payload.get("item_name"))
        .map(json_text)
        .unwrap_or_default();
    let created_at = event
        .get("created_at")
        .map(json_text)
        .map(|raw| activity_timestamp(&raw))
        .unwrap_or_default();

    let native = json!({
        "id": item_id,
        "name": name,
        "column_values": payload_columns(payload.get("column_values")),
    });
    let mut entry = BoardItemMapper.map_record(&native)?;
    entry.created_at = created_at;
    Ok(entry)
}

/// Column snapshots arrive either as an item-style array or as an object keyed by column id.
fn payload_columns(columns: Option<&JsonValue>) -> JsonValue {
    match columns {
        Some(JsonValue::Array(items)) => JsonValue::Array(items.clone()),
        Some(JsonValue::Object(map)) => JsonValue::Array(
            map.iter()
                .map(|(id, value)| {
                    json!({
                        "id": id,
                        "text": json_text(value),
                        "value": raw_json(value),
                    })
                })
                .collect(),
        ),
        _ => JsonValue::Array(Vec::new()),
    }
}

/// Converts a tick-count timestamp to RFC 3339; other formats go through
/// [`normalize_timestamp`].
pub fn activity_timestamp(raw: &str) -> String {
    let trimmed = raw.trim();
    let converted = trimmed
        .parse::<i64>()
        .ok()
        .and_then(|ticks| DateTime::<Utc>::from_timestamp_millis(ticks / ACTIVITY_TICKS_PER_MILLI));
    match converted {
        Some(ts) => format_timestamp(ts),
        None => normalize_timestamp(trimmed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enquiry_upstream::AuthHeader;

    fn board_source() -> Source {
        Source::board(
            "intake",
            Endpoint::new("https://board.example.test/v2", AuthHeader::Raw("k".into())),
            "42",
            500,
        )
    }

    fn contact_source() -> Source {
        Source::contacts(
            "crm",
            Endpoint::new("https://crm.example.test", AuthHeader::Bearer("t".into())),
            "loc-1",
            500,
        )
    }

    #[test]
    fn board_strategies_are_ordered_and_target_the_board() {
        let source = board_source();
        let names: Vec<_> = source.strategies().iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["standard", "archived_rule", "items_field"]);
        let req = source.strategies()[1].build(&source.key, &source.endpoint);
        let query = req.body.unwrap()["query"].as_str().unwrap().to_string();
        assert!(query.contains("boards(ids: [42])"));
        assert!(query.contains("include_archived: true"));
        assert!(query.contains("limit: 500"));
        assert_eq!(req.auth, AuthHeader::Raw("k".into()));
    }

    #[test]
    fn contact_source_clamps_page_size_and_sends_version_header() {
        let source = contact_source();
        assert_eq!(source.page_limit, CONTACT_PAGE_LIMIT);
        let list = &source.strategies()[1];
        let req = list.build(&source.key, &source.endpoint);
        assert_eq!(req.url, "https://crm.example.test/contacts/");
        assert!(req.query.contains(&("limit".to_string(), "100".to_string())));
        assert!(req
            .headers
            .contains(&("Version".to_string(), CONTACT_API_VERSION.to_string())));
    }

    #[test]
    fn probe_batteries_have_stable_names() {
        let names: Vec<_> = board_source().probes().iter().map(|p| p.name).collect();
        assert_eq!(
            names,
            vec![
                "board",
                "active_items",
                "archived_rule_items",
                "items_field",
                "board_groups",
                "board_columns",
                "recent_activity",
                "empty_filter_items",
            ]
        );
        let names: Vec<_> = contact_source().probes().iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["contacts_search", "contacts_sample"]);
        assert!(board_source().probes().iter().all(|p| p.is_success(0)));
    }

    #[test]
    fn archived_board_source_only_queries_archived_items() {
        let source = Source::board_archived(
            "intake_archived",
            Endpoint::new("https://board.example.test/v2", AuthHeader::Raw("k".into())),
            "42",
            500,
        );
        let strategies = source.strategies();
        let names: Vec<_> = strategies.iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["archived_rule"]);
        let req = strategies[0].build(&source.key, &source.endpoint);
        assert!(req.body.unwrap()["query"].as_str().unwrap().contains("include_archived: true"));
        assert!(source.activity_log_strategy().is_none());
        let probes: Vec<_> = source.probes().iter().map(|p| p.name).collect();
        assert_eq!(probes, vec!["archived_rule_items"]);
    }

    #[test]
    fn extract_records_tolerates_missing_paths() {
        let s = &board_source().strategies()[0];
        assert!(s.extract_records(&json!({"data": {"boards": []}})).is_empty());
        let body = json!({"data": {"boards": [{"items_page": {"items": [{"id": "1"}]}}]}});
        assert_eq!(s.extract_records(&body).len(), 1);
        assert!(!s.is_success(0));
        assert!(s.is_success(1));
    }

    #[test]
    fn coalesce_takes_first_non_empty_alias() {
        let mut table = AliasTable::new();
        table.insert("field_a", AliasValue { text: "".into(), raw: None });
        table.insert("field_b", AliasValue { text: "X".into(), raw: Some("\"X\"".into()) });
        assert_eq!(table.coalesce_text(&["field_a", "field_b"]), "X");
        assert_eq!(table.coalesce_text(&["missing"]), "");
    }

    #[test]
    fn alias_table_keeps_first_non_empty_value() {
        let mut table = AliasTable::new();
        table.insert("Event Date", AliasValue { text: "2026-06-01".into(), raw: None });
        table.insert("event_date", AliasValue { text: "other".into(), raw: None });
        assert_eq!(table.get("EVENT-DATE").unwrap().text, "2026-06-01");
    }

    #[test]
    fn board_item_maps_by_column_id_and_title() {
        let item = json!({
            "id": 1001,
            "name": "  Priya Shah ",
            "created_at": "2026-01-05T09:30:00Z",
            "column_values": [
                {"id": "email_1", "text": "", "value": null, "column": {"title": "Primary Email"}},
                {"id": "e_mail", "text": "priya@example.com", "value": "{\"email\":\"priya@example.com\"}"},
                {"id": "date4", "text": "2026-09-12", "value": "{\"date\":\"2026-09-12\"}", "column": {"title": "Event Date"}},
                {"id": "status", "text": "New", "value": "{\"index\":0}"}
            ]
        });
        let entry = BoardItemMapper.map_record(&item).unwrap();
        assert_eq!(entry.id, "1001");
        assert_eq!(entry.name, "Priya Shah");
        assert_eq!(entry.field_text("email"), "priya@example.com");
        assert_eq!(entry.field_text("event_date"), "2026-09-12");
        assert_eq!(
            entry.field("event_date").unwrap().value.as_deref(),
            Some("{\"date\":\"2026-09-12\"}")
        );
        assert_eq!(entry.field_text("status"), "New");
        assert_eq!(entry.field_text("budget"), "");
        assert_eq!(entry.column_values.len(), enquiry_core::CANONICAL_FIELD_IDS.len());
    }

    #[test]
    fn board_item_without_name_is_unknown_and_without_id_is_rejected() {
        let entry = BoardItemMapper.map_record(&json!({"id": "5", "name": ""})).unwrap();
        assert_eq!(entry.name, "Unknown");
        assert_eq!(
            BoardItemMapper.map_record(&json!({"name": "x"})).unwrap_err(),
            MappingError::MissingId
        );
    }

    #[test]
    fn contact_custom_fields_resolve_through_every_alias() {
        let contact = json!({
            "id": "c-1",
            "firstName": "Sam",
            "lastName": "",
            "email": "sam@example.com",
            "source": "Website form",
            "dateAdded": "2026-03-01T10:00:00.000Z",
            "tags": ["new lead", "Deposit Paid"],
            "customFields": [
                {"id": "hX9a", "value": "120"},
                {"id": "k2Lm", "fieldKey": "contact.event_date", "value": "2026-10-10"},
                {"id": "zz", "key": "budget", "value": ["5k", "10k"]}
            ]
        });
        let entry = ContactMapper::default().map_record(&contact).unwrap();
        assert_eq!(entry.name, "Sam");
        assert_eq!(entry.created_at, "2026-03-01T10:00:00Z");
        assert_eq!(entry.field_text("event_date"), "2026-10-10");
        assert_eq!(entry.field_text("budget"), "5k, 10k");
        assert_eq!(entry.field("budget").unwrap().value.as_deref(), Some("[\"5k\",\"10k\"]"));
        assert_eq!(entry.field_text("lead_source"), "Website form");
        assert_eq!(entry.field_text("guest_count"), "");
        assert_eq!(entry.field_text("status"), STATUS_BOOKED);
    }

    #[test]
    fn contact_fields_keyed_only_by_id_need_a_field_id_map() {
        let contact = json!({
            "id": "c-7",
            "customFields": [{"id": "R8vT2kqL", "value": "2026-11-07"}]
        });
        let unmapped = ContactMapper::default().map_record(&contact).unwrap();
        assert_eq!(unmapped.field_text("event_date"), "");

        let field_ids = BTreeMap::from([("R8vT2kqL".to_string(), "event_date".to_string())]);
        let source = contact_source().with_field_ids(field_ids);
        let entry = source.mapper().map_record(&contact).unwrap();
        assert_eq!(entry.field_text("event_date"), "2026-11-07");
        assert_eq!(entry.field("event_date").unwrap().value.as_deref(), Some("2026-11-07"));
    }

    #[test]
    fn contact_explicit_name_wins_and_blank_names_default() {
        let named = json!({"id": "1", "contactName": "Ana B", "firstName": "Z"});
        assert_eq!(ContactMapper::default().map_record(&named).unwrap().name, "Ana B");
        let blank = json!({"id": "2", "firstName": " ", "lastName": ""});
        let entry = ContactMapper::default().map_record(&blank).unwrap();
        assert_eq!(entry.name, "Unknown");
        assert_eq!(entry.field_text("status"), STATUS_PENDING);
        assert!(entry.field("status").unwrap().value.is_none());
    }

    #[test]
    fn status_keywords_are_case_insensitive() {
        assert_eq!(derive_status(&["CONFIRMED".to_string()]), STATUS_BOOKED);
        assert_eq!(derive_status(&["enquiry".to_string()]), STATUS_PENDING);
        assert_eq!(derive_status(&[]), STATUS_PENDING);
    }

    #[test]
    fn activity_ticks_convert_to_rfc3339() {
        // 2026-02-24T12:00:00Z = 1771934400000 ms
        assert_eq!(activity_timestamp("17719344000000000"), "2026-02-24T12:00:00Z");
        assert_eq!(activity_timestamp("2026-02-24T12:00:00Z"), "2026-02-24T12:00:00Z");
    }

    #[test]
    fn reconstruction_skips_malformed_payloads_and_other_events() {
        let events = vec![
            json!({"id": "a1", "event": "create_pulse", "created_at": "17719344000000000",
                   "data": "{\"pulse_id\": 77, \"pulse_name\": \"Lee Park\", \"column_values\": {\"email\": {\"text\": \"lee@example.com\"}}}"}),
            json!({"id": "a2", "event": "create_pulse", "created_at": "17719344000000000", "data": "{not json"}),
            json!({"id": "a3", "event": "update_column_value", "data": "{}"}),
            json!({"id": "a4", "event": "create_pulse", "data": "{\"pulse_name\": \"No id\"}"}),
        ];
        let outcome = LogReconstructor::default().reconstruct(&events);
        assert_eq!(outcome.created_events, 3);
        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(outcome.skipped.len(), 2);
        let entry = &outcome.entries[0];
        assert_eq!(entry.id, "77");
        assert_eq!(entry.name, "Lee Park");
        assert_eq!(entry.created_at, "2026-02-24T12:00:00Z");
        assert_eq!(entry.field_text("email"), "lee@example.com");
        assert!(matches!(
            &outcome.skipped[0],
            MappingError::MalformedPayload { event_id, .. } if event_id == "a2"
        ));

        let retained = outcome.clone();
        assert_eq!(retained.skipped, outcome.skipped);
        assert_eq!(retained.entries, outcome.entries);
    }

    #[test]
    fn reconstruction_is_bounded() {
        let event = json!({"event": "create_pulse", "data": {"pulse_id": 1}});
        let events = vec![event; 10];
        let outcome = LogReconstructor::new(3).reconstruct(&events);
        assert_eq!(outcome.created_events, 3);
    }
}
