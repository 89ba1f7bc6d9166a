pub mod hdr;
pub mod nd_gain;
pub mod owid;
pub mod un_sdg;
pub mod world_bank;

use std::io::Read;

use camino::Utf8Path;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::archive;
use crate::domain::{SourceKind, YearSelection};
use crate::error::IngestError;
use crate::geo::CountryCodeSet;
use crate::normalize::IndicatorBatch;
use crate::record::RawRecord;

#[derive(Debug, Clone, Copy)]
pub struct FetchContext<'a> {
    pub countries: &'a CountryCodeSet,
}

#[derive(Debug)]
pub struct UnitFailure {
    pub unit: String,
    pub error: IngestError,
}

#[derive(Debug, Default)]
pub struct SourceFetch {
    pub records: Vec<RawRecord>,
    pub unit_failures: Vec<UnitFailure>,
}

pub trait DataSource: Send {
    fn kind(&self) -> SourceKind;

    fn fetch(&self, ctx: &FetchContext<'_>) -> Result<SourceFetch, IngestError>;

    fn normalize(&self, records: &[RawRecord]) -> IndicatorBatch;

    fn save_raw(&self, records: &[RawRecord], destination: &Utf8Path) -> Result<(), IngestError> {
        archive::save_raw(records, destination)
    }
}

pub(crate) fn parse_settings<T: DeserializeOwned>(
    kind: SourceKind,
    value: Value,
) -> Result<T, IngestError> {
    serde_json::from_value(value).map_err(|err| invalid(kind, err.to_string()))
}

pub(crate) fn invalid(kind: SourceKind, message: impl Into<String>) -> IngestError {
    IngestError::InvalidSourceSettings {
        source_name: kind.to_string(),
        message: message.into(),
    }
}

pub(crate) fn resolve_years(kind: SourceKind, years: &YearSelection) -> Result<Vec<i32>, IngestError> {
    years.resolve().map_err(|message| invalid(kind, message))
}

pub(crate) fn read_csv_records<R: Read>(reader: R, context: &str) -> Result<Vec<RawRecord>, IngestError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers = reader
        .headers()
        .map_err(|err| IngestError::Csv(format!("{context}: {err}")))?
        .clone();
    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|err| IngestError::Csv(format!("{context}: {err}")))?;
        let record: RawRecord = headers
            .iter()
            .enumerate()
            .map(|(idx, column)| (column.to_string(), csv_cell(row.get(idx).unwrap_or(""))))
            .collect();
        records.push(record);
    }
    Ok(records)
}

fn csv_cell(text: &str) -> Value {
    if text.trim().is_empty() {
        Value::Null
    } else {
        Value::String(text.to_string())
    }
}

/// Collects per-unit results: cancellation propagates, other errors are
/// recorded and become the source error when no unit succeeded.
pub(crate) struct UnitCollector {
    kind: SourceKind,
    attempted: usize,
    fetch: SourceFetch,
}

impl UnitCollector {
    pub(crate) fn new(kind: SourceKind) -> Self {
        Self {
            kind,
            attempted: 0,
            fetch: SourceFetch::default(),
        }
    }

    pub(crate) fn record(
        &mut self,
        unit: String,
        result: Result<Vec<RawRecord>, IngestError>,
    ) -> Result<(), IngestError> {
        self.attempted += 1;
        match result {
            Ok(records) => {
                info!(source = %self.kind, unit = unit.as_str(), records = records.len(), "unit fetched");
                self.fetch.records.extend(records);
                Ok(())
            }
            Err(err) if err.is_cancelled() => Err(err),
            Err(err) => {
                if err.status() == Some(401) {
                    error!(source = %self.kind, unit = unit.as_str(), "authentication failed (401)");
                } else {
                    warn!(source = %self.kind, unit = unit.as_str(), error = %err, "unit failed; continuing");
                }
                self.fetch.unit_failures.push(UnitFailure { unit, error: err });
                Ok(())
            }
        }
    }

    pub(crate) fn push_failure(&mut self, unit: String, error: IngestError) {
        self.attempted += 1;
        self.fetch.unit_failures.push(UnitFailure { unit, error });
    }

    pub(crate) fn finish(self) -> Result<SourceFetch, IngestError> {
        let mut fetch = self.fetch;
        if self.attempted == 0 || fetch.unit_failures.len() < self.attempted {
            return Ok(fetch);
        }
        if self.attempted == 1 {
            return Err(fetch.unit_failures.remove(0).error);
        }
        let details = fetch
            .unit_failures
            .iter()
            .map(|failure| format!("{}: {}", failure.unit, failure.error))
            .collect::<Vec<_>>()
            .join("; ");
        Err(IngestError::AllUnitsFailed {
            source_name: self.kind.to_string(),
            count: self.attempted,
            details,
        })
    }
}
