use std::fs::File;
use std::io::{Cursor, Read, Seek};

use camino::Utf8PathBuf;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};
use zip::ZipArchive;

use crate::domain::SourceKind;
use crate::error::IngestError;
use crate::normalize::{IndicatorBatch, Normalizer, NullPolicy, finalize, melt_wide};
use crate::record::{RawRecord, first_text};
use crate::sources::{DataSource, FetchContext, SourceFetch, invalid, parse_settings, read_csv_records};
use crate::transport::RetryingTransport;

pub const INDICATORS_PREFIX: &str = "resources/indicators/";
pub const VULNERABILITY_PREFIX: &str = "resources/vulnerability/";
pub const VULNERABILITY_INDICATOR: &str = "vulnerability_index";

#[derive(Debug, Clone, Deserialize)]
pub struct NdGainSettings {
    #[serde(default)]
    pub zip_path: Option<Utf8PathBuf>,
    #[serde(default)]
    pub zip_url: Option<String>,
    /// Indicator name prefixes to keep; empty keeps every score file.
    #[serde(default)]
    pub indicators: Vec<String>,
    #[serde(default)]
    pub include_vulnerability_index: bool,
}

pub struct NdGainSource {
    transport: RetryingTransport,
    settings: NdGainSettings,
}

impl NdGainSource {
    pub fn new(settings: NdGainSettings, transport: RetryingTransport) -> Result<Self, IngestError> {
        if settings.zip_path.is_none() && settings.zip_url.is_none() {
            return Err(invalid(SourceKind::NdGain, "either zip_path or zip_url is required"));
        }
        Ok(Self {
            transport,
            settings,
        })
    }

    pub fn from_value(value: Value, transport: RetryingTransport) -> Result<Self, IngestError> {
        Self::new(parse_settings(SourceKind::NdGain, value)?, transport)
    }

    fn load_archive(&self) -> Result<Vec<RawRecord>, IngestError> {
        if let Some(path) = &self.settings.zip_path {
            let file = File::open(path)
                .map_err(|err| IngestError::Archive(format!("open zip {path}: {err}")))?;
            return read_archive(file, &self.settings);
        }
        let url = self
            .settings
            .zip_url
            .as_deref()
            .ok_or_else(|| invalid(SourceKind::NdGain, "either zip_path or zip_url is required"))?;
        let response = self.transport.get(url, &[], "nd-gain archive")?;
        read_archive(Cursor::new(response.body), &self.settings)
    }
}

impl DataSource for NdGainSource {
    fn kind(&self) -> SourceKind {
        SourceKind::NdGain
    }

    fn fetch(&self, _ctx: &FetchContext<'_>) -> Result<SourceFetch, IngestError> {
        self.transport.cancellation().check("nd-gain archive")?;
        let records = self.load_archive()?;
        Ok(SourceFetch {
            records,
            unit_failures: Vec::new(),
        })
    }

    fn normalize(&self, records: &[RawRecord]) -> IndicatorBatch {
        NdGainNormalizer.normalize(records)
    }
}

pub fn read_archive<R: Read + Seek>(
    reader: R,
    settings: &NdGainSettings,
) -> Result<Vec<RawRecord>, IngestError> {
    let mut archive = ZipArchive::new(reader).map_err(|err| IngestError::Archive(err.to_string()))?;
    let names: Vec<String> = archive.file_names().map(str::to_string).collect();

    let mut selected: Vec<(String, String)> = names
        .iter()
        .filter_map(|name| score_indicator(name).map(|indicator| (name.clone(), indicator)))
        .filter(|(_, indicator)| wanted(indicator, &settings.indicators))
        .collect();
    if settings.include_vulnerability_index {
        selected.extend(
            names
                .iter()
                .filter(|name| name.starts_with(VULNERABILITY_PREFIX) && name.ends_with(".csv"))
                .map(|name| (name.clone(), VULNERABILITY_INDICATOR.to_string())),
        );
    }
    info!(files = selected.len(), "nd-gain files selected");

    let mut records = Vec::new();
    for (name, indicator) in selected {
        let parsed = archive
            .by_name(&name)
            .map_err(|err| IngestError::Archive(err.to_string()))
            .and_then(|entry| read_csv_records(entry, &name));
        match parsed {
            Ok(rows) => {
                records.extend(rows.into_iter().map(|mut row| {
                    row.insert("indicator".to_string(), Value::String(indicator.clone()));
                    row
                }));
            }
            Err(err) => warn!(file = name.as_str(), error = %err, "skipping unreadable file"),
        }
    }
    Ok(records)
}

/// `resources/indicators/<name>/score.csv` → `<name>`.
fn score_indicator(path: &str) -> Option<String> {
    let rest = path.strip_prefix(INDICATORS_PREFIX)?;
    let name = rest.strip_suffix("/score.csv")?;
    (!name.is_empty() && !name.contains('/')).then(|| name.to_string())
}

fn wanted(indicator: &str, prefixes: &[String]) -> bool {
    prefixes.is_empty() || prefixes.iter().any(|prefix| indicator.starts_with(prefix.as_str()))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NdGainNormalizer;

impl Normalizer for NdGainNormalizer {
    fn normalize(&self, records: &[RawRecord]) -> IndicatorBatch {
        let rows = records
            .iter()
            .flat_map(|record| {
                let indicator = first_text(record, &["indicator"]).unwrap_or_default();
                melt_wide(record, Some("ISO3"), Some("Name"), &indicator)
            })
            .collect();
        finalize(SourceKind::NdGain, rows, NullPolicy::Retain)
    }
}
