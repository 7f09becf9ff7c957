use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use enquiry_core::CANONICAL_FIELD_IDS;
use enquiry_sources::{Source, SourceKind};
use enquiry_upstream::{AuthHeader, Endpoint};
use serde::Deserialize;
use thiserror::Error;

pub const CREDENTIAL_ENV: &str = "BOARD_API_KEY";
/// Older deployments name the board credential after the board vendor.
pub const LEGACY_CREDENTIAL_ENV: &str = "MONDAY_API_KEY";
pub const DEFAULT_INTAKE_BOARD_ID: &str = "5089267332";
pub const DEFAULT_BOARD_API_URL: &str = "https://api.monday.com/v2";
pub const DEFAULT_CRM_API_URL: &str = "https://services.leadconnectorhq.com";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} not set")]
    MissingCredential(&'static str),
    #[error("source registry {path}: {message}")]
    Registry { path: String, message: String },
}

/// Optional YAML override for the source list.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<RegistryEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryEntry {
    pub key: String,
    pub kind: SourceKind,
    pub container_id: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Native custom-field id to canonical field id; contact sources only.
    #[serde(default)]
    pub field_ids: BTreeMap<String, String>,
}

fn enabled_by_default() -> bool {
    true
}

impl SourceRegistry {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let registry_error = |message: String| ConfigError::Registry {
            path: path.display().to_string(),
            message,
        };
        let text = std::fs::read_to_string(path).map_err(|e| registry_error(e.to_string()))?;
        serde_yaml::from_str(&text).map_err(|e| registry_error(e.to_string()))
    }
}

/// Per-request aggregation settings. Nothing here outlives one request.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub board_api_key: String,
    pub crm_api_key: Option<String>,
    pub board_api_url: String,
    pub crm_api_url: String,
    pub source_keys: Vec<String>,
    pub intake_board_id: String,
    pub downstream_board_id: Option<String>,
    pub crm_location_id: Option<String>,
    /// `native_id=canonical_field` pairs, comma separated.
    pub crm_field_ids: Option<String>,
    pub http_timeout_secs: u64,
    pub page_limit: usize,
    pub registry_path: Option<PathBuf>,
}

impl AggregatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads settings through `lookup`; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let board_api_key = var(CREDENTIAL_ENV)
            .or_else(|| var(LEGACY_CREDENTIAL_ENV))
            .ok_or(ConfigError::MissingCredential(CREDENTIAL_ENV))?;
        let source_keys = var("ENQUIRY_SOURCES")
            .map(|v| {
                v.split(',')
                    .map(|k| k.trim().to_ascii_lowercase())
                    .filter(|k| !k.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|keys| !keys.is_empty())
            .unwrap_or_else(|| vec!["intake".to_string()]);

        Ok(Self {
            board_api_key,
            crm_api_key: var("CRM_API_KEY"),
            board_api_url: var("BOARD_API_URL").unwrap_or_else(|| DEFAULT_BOARD_API_URL.to_string()),
            crm_api_url: var("CRM_API_URL").unwrap_or_else(|| DEFAULT_CRM_API_URL.to_string()),
            source_keys,
            intake_board_id: var("INTAKE_BOARD_ID")
                .or_else(|| var("MONDAY_BOARD_ID"))
                .unwrap_or_else(|| DEFAULT_INTAKE_BOARD_ID.to_string()),
            downstream_board_id: var("DOWNSTREAM_BOARD_ID"),
            crm_location_id: var("CRM_LOCATION_ID"),
            crm_field_ids: var("CRM_FIELD_IDS"),
            http_timeout_secs: var("UPSTREAM_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            page_limit: var("UPSTREAM_PAGE_LIMIT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(500),
            registry_path: var("ENQUIRY_SOURCES_FILE").map(PathBuf::from),
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }

    /// Resolves configured keys into sources, in processing order.
    ///
    /// Keys that cannot be resolved are dropped and reported as warnings.
    pub fn build_sources(&self) -> Result<(Vec<Source>, Vec<String>), ConfigError> {
        let mut warnings = Vec::new();
        let planned: Vec<RegistryEntry> = match &self.registry_path {
            Some(path) => SourceRegistry::load(path)?
                .sources
                .into_iter()
                .filter(|s| s.enabled)
                .collect(),
            None => {
                let crm_field_ids = self
                    .crm_field_ids
                    .as_deref()
                    .map(|raw| parse_field_ids(raw, &mut warnings))
                    .unwrap_or_default();
                self.source_keys
                    .iter()
                    .filter_map(|key| {
                        let (kind, container_id) = match key.as_str() {
                            "intake" => (SourceKind::Board, Some(self.intake_board_id.clone())),
                            "intake_archived" => {
                                (SourceKind::BoardArchived, Some(self.intake_board_id.clone()))
                            }
                            "downstream" => (SourceKind::Board, self.downstream_board_id.clone()),
                            "downstream_archived" => {
                                (SourceKind::BoardArchived, self.downstream_board_id.clone())
                            }
                            "crm" => (SourceKind::Contacts, self.crm_location_id.clone()),
                            other => {
                                warnings.push(format!("unknown source key {other:?} ignored"));
                                return None;
                            }
                        };
                        let Some(container_id) = container_id else {
                            warnings.push(format!("source {key} has no container id configured; skipped"));
                            return None;
                        };
                        let field_ids = match kind {
                            SourceKind::Contacts => crm_field_ids.clone(),
                            _ => BTreeMap::new(),
                        };
                        Some(RegistryEntry {
                            key: key.clone(),
                            kind,
                            container_id,
                            enabled: true,
                            field_ids,
                        })
                    })
                    .collect()
            }
        };

        let mut sources = Vec::with_capacity(planned.len());
        for entry in planned {
            let RegistryEntry {
                key,
                kind,
                container_id,
                field_ids,
                ..
            } = entry;
            let board_endpoint =
                || Endpoint::new(&self.board_api_url, AuthHeader::Raw(self.board_api_key.clone()));
            let source = match kind {
                SourceKind::Board => Source::board(key, board_endpoint(), container_id, self.page_limit),
                SourceKind::BoardArchived => {
                    Source::board_archived(key, board_endpoint(), container_id, self.page_limit)
                }
                SourceKind::Contacts => {
                    let auth = match &self.crm_api_key {
                        Some(token) => AuthHeader::Bearer(token.clone()),
                        None => {
                            warnings.push(format!("source {key}: CRM_API_KEY not set"));
                            AuthHeader::None
                        }
                    };
                    let field_ids = retain_canonical_targets(&key, field_ids, &mut warnings);
                    Source::contacts(key, Endpoint::new(&self.crm_api_url, auth), container_id, self.page_limit)
                        .with_field_ids(field_ids)
                }
            };
            sources.push(source);
        }
        Ok((sources, warnings))
    }
}

/// Parses `native_id=canonical_field` pairs. Malformed pairs are reported and dropped.
fn parse_field_ids(raw: &str, warnings: &mut Vec<String>) -> BTreeMap<String, String> {
    let mut field_ids = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some((id, field)) if !id.trim().is_empty() && !field.trim().is_empty() => {
                field_ids.insert(id.trim().to_string(), field.trim().to_ascii_lowercase());
            }
            _ => warnings.push(format!("CRM_FIELD_IDS entry {pair:?} ignored")),
        }
    }
    field_ids
}

fn retain_canonical_targets(
    key: &str,
    mut field_ids: BTreeMap<String, String>,
    warnings: &mut Vec<String>,
) -> BTreeMap<String, String> {
    field_ids.retain(|id, field| {
        let known = CANONICAL_FIELD_IDS.contains(&field.as_str());
        if !known {
            warnings.push(format!("source {key}: field id {id} maps to unknown field {field:?}"));
        }
        known
    });
    field_ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn missing_credential_is_reported_by_name() {
        let err = AggregatorConfig::from_lookup(lookup(&[("ENQUIRY_SOURCES", "intake")])).unwrap_err();
        assert_eq!(err, ConfigError::MissingCredential("BOARD_API_KEY"));
        assert_eq!(err.to_string(), "BOARD_API_KEY not set");

        let blank = AggregatorConfig::from_lookup(lookup(&[("BOARD_API_KEY", "  ")])).unwrap_err();
        assert_eq!(blank, ConfigError::MissingCredential("BOARD_API_KEY"));
    }

    #[test]
    fn legacy_credential_name_is_accepted() {
        let config = AggregatorConfig::from_lookup(lookup(&[("MONDAY_API_KEY", "legacy")])).unwrap();
        assert_eq!(config.board_api_key, "legacy");

        let both = AggregatorConfig::from_lookup(lookup(&[
            ("BOARD_API_KEY", "current"),
            ("MONDAY_API_KEY", "legacy"),
        ]))
        .unwrap();
        assert_eq!(both.board_api_key, "current");
    }

    #[test]
    fn archived_keys_pair_with_their_board() {
        let config = AggregatorConfig::from_lookup(lookup(&[
            ("BOARD_API_KEY", "k"),
            ("ENQUIRY_SOURCES", "intake,intake_archived,downstream_archived"),
            ("INTAKE_BOARD_ID", "11"),
            ("DOWNSTREAM_BOARD_ID", "22"),
        ]))
        .unwrap();
        let (sources, warnings) = config.build_sources().unwrap();
        assert!(warnings.is_empty());
        let planned: Vec<_> = sources
            .iter()
            .map(|s| (s.key.as_str(), s.kind, s.container_id.as_str()))
            .collect();
        assert_eq!(
            planned,
            vec![
                ("intake", SourceKind::Board, "11"),
                ("intake_archived", SourceKind::BoardArchived, "11"),
                ("downstream_archived", SourceKind::BoardArchived, "22"),
            ]
        );
        assert_eq!(sources[1].strategies()[0].name, "archived_rule");
    }

    #[test]
    fn crm_field_ids_are_parsed_and_checked() {
        let config = AggregatorConfig::from_lookup(lookup(&[
            ("BOARD_API_KEY", "k"),
            ("CRM_API_KEY", "t"),
            ("ENQUIRY_SOURCES", "crm"),
            ("CRM_LOCATION_ID", "loc-1"),
            ("CRM_FIELD_IDS", "R8vT2kqL=Event_Date, broken, x9=shoe_size"),
        ]))
        .unwrap();
        let (sources, warnings) = config.build_sources().unwrap();
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|w| w.contains("broken")));
        assert!(warnings.iter().any(|w| w.contains("shoe_size")));
        assert_eq!(
            sources[0].field_ids,
            BTreeMap::from([("R8vT2kqL".to_string(), "event_date".to_string())])
        );
    }

    #[test]
    fn defaults_to_the_intake_board() {
        let config = AggregatorConfig::from_lookup(lookup(&[("BOARD_API_KEY", "k")])).unwrap();
        let (sources, warnings) = config.build_sources().unwrap();
        assert!(warnings.is_empty());
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].key, "intake");
        assert_eq!(sources[0].container_id, DEFAULT_INTAKE_BOARD_ID);
        assert_eq!(sources[0].endpoint.base_url, DEFAULT_BOARD_API_URL);
        assert_eq!(config.request_timeout(), Duration::from_secs(20));
    }

    #[test]
    fn unresolvable_sources_become_warnings() {
        let config = AggregatorConfig::from_lookup(lookup(&[
            ("BOARD_API_KEY", "k"),
            ("ENQUIRY_SOURCES", "intake, downstream ,crm,ledger"),
            ("CRM_LOCATION_ID", "loc-9"),
        ]))
        .unwrap();
        let (sources, warnings) = config.build_sources().unwrap();
        let keys: Vec<_> = sources.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["intake", "crm"]);
        assert_eq!(warnings.len(), 3);
        assert!(warnings.iter().any(|w| w.contains("ledger")));
        assert!(warnings.iter().any(|w| w.contains("downstream")));
        assert!(warnings.iter().any(|w| w.contains("CRM_API_KEY")));
    }

    #[test]
    fn registry_file_overrides_source_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.yaml");
        std::fs::write(
            &path,
            r#"
sources:
  - key: downstream
    kind: board
    container_id: "777"
  - key: paused
    kind: board
    container_id: "1"
    enabled: false
  - key: downstream_archived
    kind: board_archived
    container_id: "777"
  - key: crm
    kind: contacts
    container_id: loc-1
    field_ids:
      R8vT2kqL: event_date
"#,
        )
        .unwrap();
        let config = AggregatorConfig::from_lookup(lookup(&[
            ("BOARD_API_KEY", "k"),
            ("CRM_API_KEY", "t"),
            ("ENQUIRY_SOURCES_FILE", path.to_str().unwrap()),
        ]))
        .unwrap();
        let (sources, warnings) = config.build_sources().unwrap();
        assert!(warnings.is_empty());
        let keys: Vec<_> = sources.iter().map(|s| (s.key.as_str(), s.kind)).collect();
        assert_eq!(
            keys,
            vec![
                ("downstream", SourceKind::Board),
                ("downstream_archived", SourceKind::BoardArchived),
                ("crm", SourceKind::Contacts),
            ]
        );
        assert_eq!(sources[2].endpoint.auth, AuthHeader::Bearer("t".into()));
        assert_eq!(sources[2].field_ids.get("R8vT2kqL").map(String::as_str), Some("event_date"));
    }

    #[test]
    fn unreadable_registry_is_a_config_error() {
        let config = AggregatorConfig::from_lookup(lookup(&[
            ("BOARD_API_KEY", "k"),
            ("ENQUIRY_SOURCES_FILE", "/nonexistent/sources.yaml"),
        ]))
        .unwrap();
        assert!(matches!(config.build_sources(), Err(ConfigError::Registry { .. })));
    }
}
