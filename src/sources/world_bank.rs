use std::collections::HashMap;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::domain::{IndicatorEntry, SourceKind, YearSelection};
use crate::error::IngestError;
use crate::normalize::{
    IndicatorBatch, NormalizedRow, Normalizer, NullPolicy, coerce_value, coerce_year, finalize,
};
use crate::pagination::{FetchRequest, PageLayout, PaginatedFetch};
use crate::record::{RawRecord, first_text};
use crate::sources::{
    DataSource, FetchContext, SourceFetch, UnitCollector, invalid, parse_settings, resolve_years,
};
use crate::transport::RetryingTransport;

pub const DEFAULT_BASE_URL: &str = "https://api.worldbank.org/v2";

pub const ALIAS_KEY: &str = "_indicator_alias";

#[derive(Debug, Clone, Deserialize)]
pub struct WorldBankSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_countries")]
    pub countries: Vec<String>,
    pub indicators: Vec<IndicatorEntry>,
    #[serde(flatten)]
    pub years: YearSelection,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_countries() -> Vec<String> {
    vec!["all".to_string()]
}

fn default_per_page() -> u32 {
    1000
}

pub struct WorldBankSource {
    transport: RetryingTransport,
    settings: WorldBankSettings,
    date_range: String,
    normalizer: WorldBankNormalizer,
}

impl WorldBankSource {
    pub fn new(settings: WorldBankSettings, transport: RetryingTransport) -> Result<Self, IngestError> {
        let kind = SourceKind::WorldBank;
        if settings.indicators.is_empty() {
            return Err(invalid(kind, "at least one indicator is required"));
        }
        if settings.countries.is_empty() {
            return Err(invalid(kind, "countries must not be empty"));
        }
        if settings.per_page == 0 {
            return Err(invalid(kind, "per_page must be positive"));
        }
        resolve_years(kind, &settings.years)?;
        let (start, end) = settings
            .years
            .bounds()
            .map_err(|message| invalid(kind, message))?;
        let normalizer = WorldBankNormalizer::new(&settings.indicators);
        Ok(Self {
            transport,
            date_range: format!("{start}:{end}"),
            settings,
            normalizer,
        })
    }

    pub fn from_value(value: Value, transport: RetryingTransport) -> Result<Self, IngestError> {
        Self::new(parse_settings(SourceKind::WorldBank, value)?, transport)
    }

    fn fetch_indicator(&self, entry: &IndicatorEntry) -> Result<Vec<RawRecord>, IngestError> {
        let code = entry.code();
        let url = format!(
            "{}/country/{}/indicator/{}",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.countries.join(";"),
            code
        );
        let request = FetchRequest::new(
            url,
            vec![("date".to_string(), self.date_range.clone())],
            self.settings.per_page,
        );
        let mut records =
            PaginatedFetch::new(&self.transport, PageLayout::MetadataPair, format!("worldbank {code}"))
                .fetch_all(request)?;
        for record in &mut records {
            record.insert(ALIAS_KEY.to_string(), Value::String(entry.alias().to_string()));
        }
        Ok(records)
    }
}

impl DataSource for WorldBankSource {
    fn kind(&self) -> SourceKind {
        SourceKind::WorldBank
    }

    fn fetch(&self, _ctx: &FetchContext<'_>) -> Result<SourceFetch, IngestError> {
        let mut units = UnitCollector::new(self.kind());
        for entry in &self.settings.indicators {
            units.record(entry.code().to_string(), self.fetch_indicator(entry))?;
        }
        units.finish()
    }

    fn normalize(&self, records: &[RawRecord]) -> IndicatorBatch {
        self.normalizer.normalize(records)
    }
}

/// Uses the alias tagged at fetch time; untagged records fall back to
/// `indicator.id` looked up case-insensitively in the configured codes.
#[derive(Debug, Clone, Default)]
pub struct WorldBankNormalizer {
    aliases: HashMap<String, String>,
}

impl WorldBankNormalizer {
    pub fn new(indicators: &[IndicatorEntry]) -> Self {
        let aliases = indicators
            .iter()
            .map(|entry| (entry.code().to_uppercase(), entry.alias().to_string()))
            .collect();
        Self { aliases }
    }

    fn indicator(&self, record: &RawRecord) -> String {
        if let Some(alias) = first_text(record, &[ALIAS_KEY]) {
            return alias;
        }
        let id = nested(record, "indicator")
            .and_then(|obj| first_text(obj, &["id"]))
            .unwrap_or_default();
        self.aliases.get(&id.to_uppercase()).cloned().unwrap_or(id)
    }

    fn row(&self, record: &RawRecord) -> NormalizedRow {
        let country = nested(record, "country");
        let indicator = self.indicator(record);

        NormalizedRow {
            country_code: first_text(record, &["countryiso3code"])
                .or_else(|| country.and_then(|obj| first_text(obj, &["id"]))),
            country: country.and_then(|obj| first_text(obj, &["value"])),
            indicator,
            year: record.get("date").and_then(coerce_year),
            value: record.get("value").and_then(coerce_value),
            ..NormalizedRow::default()
        }
    }
}

fn nested<'a>(record: &'a RawRecord, key: &str) -> Option<&'a Map<String, Value>> {
    record.get(key).and_then(|v| v.as_object())
}

impl Normalizer for WorldBankNormalizer {
    fn normalize(&self, records: &[RawRecord]) -> IndicatorBatch {
        let rows = records.iter().map(|record| self.row(record)).collect();
        finalize(SourceKind::WorldBank, rows, NullPolicy::Drop)
    }
}
