use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::archive;
use crate::cancel::CancellationToken;
use crate::domain::SourceKind;
use crate::error::IngestError;
use crate::geo::{CountryCodeSet, GeoCodeResolver};
use crate::normalize::IndicatorBatch;
use crate::registry::SessionEnv;
use crate::sources::{DataSource, FetchContext, SourceFetch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceOutcome {
    Succeeded,
    Partial,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFailureReport {
    pub unit: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceReport {
    pub source: SourceKind,
    pub outcome: SourceOutcome,
    pub raw_records: usize,
    pub rows: usize,
    pub unit_failures: Vec<UnitFailureReport>,
    pub error: Option<String>,
    pub raw_archive: Option<Utf8PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub started_at: String,
    pub finished_at: String,
    pub country_codes: usize,
    pub sources: Vec<SourceReport>,
}

impl RunSummary {
    pub fn succeeded(&self) -> usize {
        self.sources
            .iter()
            .filter(|report| report.outcome != SourceOutcome::Failed)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.sources.len() - self.succeeded()
    }
}

#[derive(Debug)]
pub struct RunOutput {
    pub batches: Vec<IndicatorBatch>,
    pub summary: RunSummary,
}

pub struct FetchOrchestrator {
    sources: Vec<Box<dyn DataSource>>,
    resolver: Option<GeoCodeResolver>,
    raw_dir: Option<Utf8PathBuf>,
    cancel: CancellationToken,
}

impl FetchOrchestrator {
    pub fn new(sources: Vec<Box<dyn DataSource>>, cancel: CancellationToken) -> Self {
        Self {
            sources,
            resolver: None,
            raw_dir: None,
            cancel,
        }
    }

    pub fn with_geo_tree(mut self, env: &SessionEnv, tree_url: impl Into<String>) -> Self {
        let transport = Arc::new(env.shared_transport());
        self.resolver = Some(GeoCodeResolver::new(transport, tree_url));
        self
    }

    pub fn with_raw_dir(mut self, raw_dir: impl Into<Utf8PathBuf>) -> Self {
        self.raw_dir = Some(raw_dir.into());
        self
    }

    /// Runs every source in order. A failing source is reported and skipped;
    /// cancellation aborts the run.
    pub fn run(&self) -> Result<RunOutput, IngestError> {
        let started_at = Utc::now().to_rfc3339();
        let countries = match &self.resolver {
            Some(resolver) => resolver.resolve_country_codes(),
            None => CountryCodeSet::default(),
        };
        let ctx = FetchContext {
            countries: &countries,
        };

        let mut batches = Vec::new();
        let mut reports = Vec::new();
        for source in &self.sources {
            let kind = source.kind();
            self.cancel.check(kind.as_str())?;
            info!(source = %kind, "fetching source");

            match source.fetch(&ctx) {
                Ok(fetch) => {
                    let (batch, report) = self.finish_source(source.as_ref(), fetch);
                    info!(source = %kind, rows = batch.len(), "source normalized");
                    batches.push(batch);
                    reports.push(report);
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    error!(source = %kind, error = %err, "source failed");
                    reports.push(SourceReport {
                        source: kind,
                        outcome: SourceOutcome::Failed,
                        raw_records: 0,
                        rows: 0,
                        unit_failures: Vec::new(),
                        error: Some(err.to_string()),
                        raw_archive: None,
                    });
                }
            }
        }

        let summary = RunSummary {
            started_at,
            finished_at: Utc::now().to_rfc3339(),
            country_codes: countries.len(),
            sources: reports,
        };
        if !summary.sources.is_empty() && summary.succeeded() == 0 {
            return Err(IngestError::AllSourcesFailed(summary.sources.len()));
        }
        Ok(RunOutput { batches, summary })
    }

    fn finish_source(&self, source: &dyn DataSource, fetch: SourceFetch) -> (IndicatorBatch, SourceReport) {
        let kind = source.kind();
        let raw_archive = self
            .raw_dir
            .as_deref()
            .and_then(|dir| self.archive_raw(source, &fetch, dir));
        let batch = source.normalize(&fetch.records);
        let unit_failures: Vec<UnitFailureReport> = fetch
            .unit_failures
            .iter()
            .map(|failure| UnitFailureReport {
                unit: failure.unit.clone(),
                error: failure.error.to_string(),
            })
            .collect();
        let outcome = if unit_failures.is_empty() {
            SourceOutcome::Succeeded
        } else {
            SourceOutcome::Partial
        };
        let report = SourceReport {
            source: kind,
            outcome,
            raw_records: fetch.records.len(),
            rows: batch.len(),
            unit_failures,
            error: None,
            raw_archive,
        };
        (batch, report)
    }

    fn archive_raw(&self, source: &dyn DataSource, fetch: &SourceFetch, dir: &Utf8Path) -> Option<Utf8PathBuf> {
        let path = archive::raw_archive_path(dir, source.kind());
        match source.save_raw(&fetch.records, &path) {
            Ok(()) => Some(path),
            Err(err) => {
                warn!(source = %source.kind(), error = %err, "could not archive raw records");
                None
            }
        }
    }
}
