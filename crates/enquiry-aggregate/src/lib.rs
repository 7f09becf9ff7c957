//! Multi-source aggregation: strategy fallback, merge/dedupe, activity-log reconstruction and
//! diagnostics.

mod config;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use enquiry_core::{DashboardPayload, EntryCollection};
use enquiry_sources::{LogReconstructor, QueryStrategy, Source};
use enquiry_upstream::{Upstream, UpstreamError};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub use config::{
    AggregatorConfig, ConfigError, RegistryEntry, SourceRegistry, CREDENTIAL_ENV,
    DEFAULT_BOARD_API_URL, DEFAULT_CRM_API_URL, DEFAULT_INTAKE_BOARD_ID,
};

pub const CRATE_NAME: &str = "enquiry-aggregate";

/// Method marker when no strategy of a source produced usable data.
pub const NO_STRATEGY_SUCCEEDED: &str = "none";
pub const LOG_RECONSTRUCTION_METHOD: &str = "log_reconstruction";

const PROBE_SAMPLE_SIZE: usize = 5;

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Every attempted request failed and nothing could be reconstructed.
    #[error("{0}")]
    UpstreamTotalFailure(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptFailure {
    pub strategy: String,
    pub error: String,
}

/// Result of walking one source's strategy list.
#[derive(Debug, Clone, Default)]
pub struct FallbackOutcome {
    pub records: Vec<JsonValue>,
    pub winner: Option<&'static str>,
    pub failures: Vec<AttemptFailure>,
    /// Attempts that completed without a transport error, whether or not they had records.
    pub completed_attempts: usize,
}

impl FallbackOutcome {
    pub fn method(&self) -> &'static str {
        self.winner.unwrap_or(NO_STRATEGY_SUCCEEDED)
    }
}

/// Runs strategies in order and stops at the first one that yields usable data.
#[derive(Clone, Copy)]
pub struct FallbackExecutor<'a> {
    upstream: &'a dyn Upstream,
    request_timeout: Duration,
}

impl<'a> FallbackExecutor<'a> {
    pub fn new(upstream: &'a dyn Upstream, request_timeout: Duration) -> Self {
        Self {
            upstream,
            request_timeout,
        }
    }

    /// Issues one strategy's request. A timeout is reported like any other transport error.
    pub async fn run(
        &self,
        source: &Source,
        strategy: &QueryStrategy,
    ) -> Result<(JsonValue, Vec<JsonValue>), String> {
        let request = strategy.build(&source.key, &source.endpoint);
        let body = match tokio::time::timeout(self.request_timeout, self.upstream.send(&request)).await {
            Ok(Ok(body)) => body,
            Ok(Err(err)) => return Err(describe_upstream_error(&err)),
            Err(_) => {
                return Err(format!(
                    "timed out after {}s",
                    self.request_timeout.as_secs_f64()
                ))
            }
        };
        let records = strategy.extract_records(&body);
        Ok((body, records))
    }

    pub async fn execute(&self, source: &Source, strategies: &[QueryStrategy]) -> FallbackOutcome {
        let mut outcome = FallbackOutcome::default();
        for strategy in strategies {
            match self.run(source, strategy).await {
                Ok((_, records)) => {
                    outcome.completed_attempts += 1;
                    debug!(source = %source.key, strategy = strategy.name, records = records.len(), "strategy completed");
                    if strategy.is_success(records.len()) {
                        outcome.winner = Some(strategy.name);
                        outcome.records = records;
                        return outcome;
                    }
                }
                Err(error) => {
                    debug!(source = %source.key, strategy = strategy.name, %error, "strategy failed");
                    outcome.failures.push(AttemptFailure {
                        strategy: strategy.name.to_string(),
                        error,
                    });
                }
            }
        }
        outcome
    }
}

fn describe_upstream_error(err: &UpstreamError) -> String {
    if err.is_timeout() {
        format!("timed out: {err}")
    } else {
        err.to_string()
    }
}

/// What one source contributed to a merge.
#[derive(Debug, Clone, Serialize)]
pub struct SourceOutcome {
    pub source: String,
    pub method: String,
    pub fetched: usize,
    pub merged: usize,
    pub failures: Vec<AttemptFailure>,
    #[serde(skip)]
    pub completed_attempts: usize,
}

#[derive(Debug, Default)]
pub struct Reconciliation {
    pub collection: EntryCollection,
    pub sources: Vec<SourceOutcome>,
    pub warnings: Vec<String>,
}

/// Fetches every source in order and merges entries by id, last source wins.
pub struct SourceReconciler<'a> {
    executor: FallbackExecutor<'a>,
}

impl<'a> SourceReconciler<'a> {
    pub fn new(executor: FallbackExecutor<'a>) -> Self {
        Self { executor }
    }

    pub async fn reconcile(&self, sources: &[Source]) -> Reconciliation {
        let mut reconciliation = Reconciliation::default();
        for source in sources {
            let fallback = self.executor.execute(source, &source.strategies()).await;
            let mapper = source.mapper();
            let mut merged = 0usize;
            for record in &fallback.records {
                match mapper.map_record(record) {
                    Ok(entry) => {
                        reconciliation.collection.merge(entry);
                        merged += 1;
                    }
                    Err(err) => reconciliation
                        .warnings
                        .push(format!("source {}: record skipped: {err}", source.key)),
                }
            }
            for failure in &fallback.failures {
                reconciliation.warnings.push(format!(
                    "source {} strategy {} failed: {}",
                    source.key, failure.strategy, failure.error
                ));
            }
            reconciliation.sources.push(SourceOutcome {
                source: source.key.clone(),
                method: fallback.method().to_string(),
                fetched: fallback.records.len(),
                merged,
                failures: fallback.failures,
                completed_attempts: fallback.completed_attempts,
            });
        }
        reconciliation
    }
}

/// Structured account of one aggregation; the caller decides what to log.
#[derive(Debug, Clone, Serialize)]
pub struct AggregationReport {
    pub method: String,
    pub count: usize,
    pub reconstructed: bool,
    pub warnings: Vec<String>,
    pub sources: Vec<SourceOutcome>,
}

#[derive(Debug, Clone)]
pub struct Aggregation {
    pub payload: DashboardPayload,
    pub report: AggregationReport,
}

/// Outcome of a single diagnostic probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ProbeOutcome {
    Result {
        count: usize,
        sample: Vec<JsonValue>,
        raw: JsonValue,
    },
    Error {
        error: String,
    },
}

impl ProbeOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, ProbeOutcome::Error { .. })
    }
}

pub type DiagnosticReport = BTreeMap<String, ProbeOutcome>;

/// Runs every probe of every source; a failing probe only affects its own key.
pub struct DiagnosticProbe<'a> {
    executor: FallbackExecutor<'a>,
}

impl<'a> DiagnosticProbe<'a> {
    pub fn new(executor: FallbackExecutor<'a>) -> Self {
        Self { executor }
    }

    /// Keys are probe names, prefixed with `<source>.` when more than one source is probed.
    pub async fn run(&self, sources: &[Source]) -> DiagnosticReport {
        let prefixed = sources.len() > 1;
        let mut report = DiagnosticReport::new();
        for source in sources {
            for probe in source.probes() {
                let key = if prefixed {
                    format!("{}.{}", source.key, probe.name)
                } else {
                    probe.name.to_string()
                };
                let outcome = match self.executor.run(source, &probe).await {
                    Ok((raw, records)) => ProbeOutcome::Result {
                        count: records.len(),
                        sample: records.into_iter().take(PROBE_SAMPLE_SIZE).collect(),
                        raw,
                    },
                    Err(error) => ProbeOutcome::Error { error },
                };
                report.insert(key, outcome);
            }
        }
        report
    }
}

/// Entry point behind the data and diagnose endpoints.
#[derive(Clone)]
pub struct Aggregator {
    upstream: Arc<dyn Upstream>,
    request_timeout: Duration,
    reconstructor: LogReconstructor,
}

impl Aggregator {
    pub fn new(upstream: Arc<dyn Upstream>, request_timeout: Duration) -> Self {
        Self {
            upstream,
            request_timeout,
            reconstructor: LogReconstructor::default(),
        }
    }

    pub fn with_reconstructor(mut self, reconstructor: LogReconstructor) -> Self {
        self.reconstructor = reconstructor;
        self
    }

    fn executor(&self) -> FallbackExecutor<'_> {
        FallbackExecutor::new(self.upstream.as_ref(), self.request_timeout)
    }

    pub async fn aggregate(&self, sources: &[Source]) -> Result<Aggregation, AggregationError> {
        let executor = self.executor();
        let Reconciliation {
            mut collection,
            sources: mut outcomes,
            mut warnings,
        } = SourceReconciler::new(executor).reconcile(sources).await;

        let contributing: Vec<&SourceOutcome> = outcomes.iter().filter(|o| o.merged > 0).collect();
        let mut method = match contributing.as_slice() {
            [] => NO_STRATEGY_SUCCEEDED.to_string(),
            [only] => only.method.clone(),
            many => many
                .iter()
                .map(|o| o.source.as_str())
                .collect::<Vec<_>>()
                .join("+"),
        };

        let mut reconstructed = false;
        if collection.is_empty() {
            for source in sources {
                let Some(strategy) = source.activity_log_strategy() else {
                    continue;
                };
                let mut outcome = SourceOutcome {
                    source: source.key.clone(),
                    method: LOG_RECONSTRUCTION_METHOD.to_string(),
                    fetched: 0,
                    merged: 0,
                    failures: Vec::new(),
                    completed_attempts: 0,
                };
                match executor.run(source, &strategy).await {
                    Ok((_, events)) => {
                        outcome.completed_attempts = 1;
                        let rebuilt = self.reconstructor.reconstruct(&events);
                        outcome.fetched = rebuilt.created_events;
                        outcome.merged = rebuilt.entries.len();
                        for skipped in &rebuilt.skipped {
                            warnings.push(format!("source {}: {skipped}", source.key));
                        }
                        collection.merge_all(rebuilt.entries);
                    }
                    Err(error) => {
                        warnings.push(format!(
                            "source {} activity log failed: {error}",
                            source.key
                        ));
                        outcome.failures.push(AttemptFailure {
                            strategy: strategy.name.to_string(),
                            error,
                        });
                    }
                }
                outcomes.push(outcome);
            }
            if !collection.is_empty() {
                reconstructed = true;
                method = LOG_RECONSTRUCTION_METHOD.to_string();
            }
        }

        if collection.is_empty() {
            let completed: usize = outcomes.iter().map(|o| o.completed_attempts).sum();
            let last_error = outcomes
                .iter()
                .flat_map(|o| o.failures.iter())
                .last()
                .map(|f| f.error.clone());
            if let (0, Some(error)) = (completed, last_error) {
                return Err(AggregationError::UpstreamTotalFailure(error));
            }
        }

        let entries = collection.into_entries();
        let payload = DashboardPayload::new(entries, method.clone());
        Ok(Aggregation {
            report: AggregationReport {
                method,
                count: payload.count,
                reconstructed,
                warnings,
                sources: outcomes,
            },
            payload,
        })
    }

    pub async fn diagnose(&self, sources: &[Source]) -> DiagnosticReport {
        DiagnosticProbe::new(self.executor()).run(sources).await
    }
}
