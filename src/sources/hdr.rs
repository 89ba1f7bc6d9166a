use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{SourceKind, YearSelection};
use crate::error::IngestError;
use crate::normalize::{
    IndicatorBatch, NormalizedRow, Normalizer, NullPolicy, coerce_value, coerce_year, finalize,
};
use crate::record::{RawRecord, first_text, first_value};
use crate::sources::{
    DataSource, FetchContext, SourceFetch, UnitCollector, invalid, parse_settings, resolve_years,
};
use crate::transport::RetryingTransport;

pub const DEFAULT_BASE_URL: &str = "https://hdrdata.org/api";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HdrEndpoint {
    #[default]
    #[serde(rename = "query")]
    Query,
    #[serde(rename = "query-detailed")]
    QueryDetailed,
}

impl HdrEndpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            HdrEndpoint::Query => "query",
            HdrEndpoint::QueryDetailed => "query-detailed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum HdrIndicatorEntry {
    Shorthand(String),
    Detailed {
        code: String,
        #[serde(default)]
        endpoint: HdrEndpoint,
    },
}

impl HdrIndicatorEntry {
    pub fn code(&self) -> &str {
        match self {
            HdrIndicatorEntry::Shorthand(code) => code,
            HdrIndicatorEntry::Detailed { code, .. } => code,
        }
    }

    pub fn endpoint(&self) -> HdrEndpoint {
        match self {
            HdrIndicatorEntry::Shorthand(_) => HdrEndpoint::Query,
            HdrIndicatorEntry::Detailed { endpoint, .. } => *endpoint,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HdrSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub indicators: Vec<HdrIndicatorEntry>,
    #[serde(flatten)]
    pub years: YearSelection,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

pub struct HdrSource {
    transport: RetryingTransport,
    settings: HdrSettings,
    api_key: String,
    years: Vec<i32>,
}

impl HdrSource {
    pub fn new(
        settings: HdrSettings,
        api_key: String,
        transport: RetryingTransport,
    ) -> Result<Self, IngestError> {
        let kind = SourceKind::Hdr;
        if settings.indicators.is_empty() {
            return Err(invalid(kind, "at least one indicator is required"));
        }
        if api_key.trim().is_empty() {
            return Err(IngestError::MissingApiKey(kind.to_string()));
        }
        let years = resolve_years(kind, &settings.years)?;
        Ok(Self {
            transport,
            settings,
            api_key,
            years,
        })
    }

    pub fn from_value(
        value: Value,
        api_key: Option<String>,
        transport: RetryingTransport,
    ) -> Result<Self, IngestError> {
        let api_key = api_key.ok_or_else(|| IngestError::MissingApiKey(SourceKind::Hdr.to_string()))?;
        Self::new(parse_settings(SourceKind::Hdr, value)?, api_key, transport)
    }

    fn fetch_unit(&self, entry: &HdrIndicatorEntry, year: i32) -> Result<Vec<RawRecord>, IngestError> {
        let url = format!(
            "{}/CompositeIndices/{}",
            self.settings.base_url.trim_end_matches('/'),
            entry.endpoint().as_str()
        );
        let params = vec![
            ("apikey".to_string(), self.api_key.clone()),
            ("year".to_string(), year.to_string()),
            ("indicator".to_string(), entry.code().to_string()),
        ];
        let context = format!("hdr {} {year}", entry.code());
        let body = self.transport.get(&url, &params, &context)?.json(&context)?;
        Ok(tag_records(body, entry.code(), year))
    }
}

/// A list body yields one record per object, an object body one record.
fn tag_records(body: Value, indicator: &str, year: i32) -> Vec<RawRecord> {
    let objects = match body {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
        Value::Object(map) => vec![map],
        _ => Vec::new(),
    };
    objects
        .into_iter()
        .map(|mut record| {
            record.insert("indicator".to_string(), Value::String(indicator.to_string()));
            record.insert("year".to_string(), Value::from(year));
            record
        })
        .collect()
}

impl DataSource for HdrSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Hdr
    }

    fn fetch(&self, _ctx: &FetchContext<'_>) -> Result<SourceFetch, IngestError> {
        let mut units = UnitCollector::new(self.kind());
        for entry in &self.settings.indicators {
            for &year in &self.years {
                let unit = format!("{} {year}", entry.code());
                units.record(unit, self.fetch_unit(entry, year))?;
            }
        }
        units.finish()
    }

    fn normalize(&self, records: &[RawRecord]) -> IndicatorBatch {
        HdrNormalizer.normalize(records)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HdrNormalizer;

impl Normalizer for HdrNormalizer {
    fn normalize(&self, records: &[RawRecord]) -> IndicatorBatch {
        let rows = records
            .iter()
            .map(|record| NormalizedRow {
                country_code: first_text(record, &["iso3", "countryCode", "ISO3"]),
                country: first_text(record, &["country", "countryName", "Country"]),
                indicator: first_text(record, &["indicator"]).unwrap_or_default(),
                year: record.get("year").and_then(coerce_year),
                value: first_value(record, &["value", "index", "Value"]).and_then(coerce_value),
                ..NormalizedRow::default()
            })
            .collect();
        finalize(SourceKind::Hdr, rows, NullPolicy::Drop)
    }
}
