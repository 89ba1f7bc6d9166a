use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::SourceKind;
use crate::error::IngestError;
use crate::normalize::{
    IndicatorBatch, NormalizedRow, Normalizer, NullPolicy, coerce_value, coerce_year, finalize,
    melt_wide, optional_text,
};
use crate::record::{RawRecord, value_to_string};
use crate::sources::{
    DataSource, FetchContext, SourceFetch, UnitCollector, invalid, parse_settings, read_csv_records,
};
use crate::transport::RetryingTransport;

pub const SOURCE_URL_KEY: &str = "_source_url";

const ENTITY_ALIASES: &[&str] = &["entity", "country", "country_name", "name"];
const CODE_ALIASES: &[&str] = &["code", "iso3", "iso_code", "country_code"];
const YEAR_ALIASES: &[&str] = &["year", "date"];
const VALUE_ALIASES: &[&str] = &["value", "val", "state_capacity_index"];
// Value headers too generic to name an indicator after.
const GENERIC_VALUE_NAMES: &[&str] = &["value", "val"];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OwidDataset {
    pub url: String,
    #[serde(default)]
    pub indicator: Option<String>,
    #[serde(default)]
    pub value_column: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OwidSettings {
    pub datasets: Vec<OwidDataset>,
}

pub struct OwidSource {
    transport: RetryingTransport,
    settings: OwidSettings,
    normalizer: OwidNormalizer,
}

impl OwidSource {
    pub fn new(settings: OwidSettings, transport: RetryingTransport) -> Result<Self, IngestError> {
        if settings.datasets.is_empty() {
            return Err(invalid(SourceKind::Owid, "at least one dataset is required"));
        }
        let normalizer = OwidNormalizer::new(settings.datasets.clone());
        Ok(Self {
            transport,
            settings,
            normalizer,
        })
    }

    pub fn from_value(value: Value, transport: RetryingTransport) -> Result<Self, IngestError> {
        Self::new(parse_settings(SourceKind::Owid, value)?, transport)
    }

    fn fetch_dataset(&self, dataset: &OwidDataset) -> Result<Vec<RawRecord>, IngestError> {
        let context = format!("owid {}", dataset.url);
        let body = self.transport.get(&dataset.url, &[], &context)?;
        let mut records = read_csv_records(body.body.as_slice(), &context)?;
        for record in &mut records {
            record.insert(SOURCE_URL_KEY.to_string(), Value::String(dataset.url.clone()));
        }
        Ok(records)
    }
}

impl DataSource for OwidSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Owid
    }

    fn fetch(&self, _ctx: &FetchContext<'_>) -> Result<SourceFetch, IngestError> {
        let mut units = UnitCollector::new(self.kind());
        for dataset in &self.settings.datasets {
            units.record(dataset.url.clone(), self.fetch_dataset(dataset))?;
        }
        units.finish()
    }

    fn normalize(&self, records: &[RawRecord]) -> IndicatorBatch {
        self.normalizer.normalize(records)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnRoles {
    pub entity: Option<String>,
    pub code: Option<String>,
    pub year: Option<String>,
    pub value: Option<String>,
}

/// Matches columns against the known aliases case-insensitively. The last
/// matching column wins for each role; `value_column` overrides detection.
pub fn detect_columns(columns: &[String], value_column: Option<&str>) -> ColumnRoles {
    let mut roles = ColumnRoles::default();
    for column in columns {
        let lower = column.to_lowercase();
        if ENTITY_ALIASES.contains(&lower.as_str()) {
            roles.entity = Some(column.clone());
        } else if CODE_ALIASES.contains(&lower.as_str()) {
            roles.code = Some(column.clone());
        } else if YEAR_ALIASES.contains(&lower.as_str()) {
            roles.year = Some(column.clone());
        } else if VALUE_ALIASES.contains(&lower.as_str()) {
            roles.value = Some(column.clone());
        }
    }
    if let Some(wanted) = value_column {
        roles.value = columns
            .iter()
            .find(|column| column.eq_ignore_ascii_case(wanted))
            .cloned();
    }
    roles
}

#[derive(Debug, Clone, Default)]
pub struct OwidNormalizer {
    datasets: Vec<OwidDataset>,
}

impl OwidNormalizer {
    pub fn new(datasets: Vec<OwidDataset>) -> Self {
        Self { datasets }
    }

    fn dataset(&self, url: &str) -> Option<&OwidDataset> {
        self.datasets.iter().find(|dataset| dataset.url == url)
    }

    fn normalize_group(&self, url: &str, records: &[&RawRecord]) -> Vec<NormalizedRow> {
        let Some(first) = records.first() else {
            return Vec::new();
        };
        let dataset = self.dataset(url);
        let columns: Vec<String> = first
            .keys()
            .filter(|key| key.as_str() != SOURCE_URL_KEY)
            .cloned()
            .collect();
        let mut roles = detect_columns(&columns, dataset.and_then(|d| d.value_column.as_deref()));
        debug!(url, ?roles, "detected columns");

        if roles.year.is_none() {
            let indicator = indicator_name(dataset, None, url);
            return records
                .iter()
                .flat_map(|record| {
                    melt_wide(record, roles.code.as_deref(), roles.entity.as_deref(), &indicator)
                })
                .collect();
        }

        if roles.value.is_none() {
            roles.value = first_numeric_column(&columns, &roles, records);
            if roles.value.is_none() {
                warn!(url, "no value column found; values will be null");
            }
        }
        let indicator = indicator_name(dataset, roles.value.as_deref(), url);
        records
            .iter()
            .map(|record| NormalizedRow {
                country_code: optional_text(roles.code.as_ref().and_then(|c| record.get(c))),
                country: optional_text(roles.entity.as_ref().and_then(|c| record.get(c))),
                indicator: indicator.clone(),
                year: roles.year.as_ref().and_then(|c| record.get(c)).and_then(coerce_year),
                value: roles.value.as_ref().and_then(|c| record.get(c)).and_then(coerce_value),
                ..NormalizedRow::default()
            })
            .collect()
    }
}

fn first_numeric_column(columns: &[String], roles: &ColumnRoles, records: &[&RawRecord]) -> Option<String> {
    let taken = [&roles.entity, &roles.code, &roles.year];
    columns
        .iter()
        .filter(|column| !taken.iter().any(|role| role.as_deref() == Some(column.as_str())))
        .find(|column| {
            let mut cells = records
                .iter()
                .filter_map(|record| record.get(column.as_str()))
                .filter(|cell| !cell.is_null())
                .peekable();
            cells.peek().is_some() && cells.all(|cell| coerce_value(cell).is_some())
        })
        .cloned()
}

fn indicator_name(dataset: Option<&OwidDataset>, value_column: Option<&str>, url: &str) -> String {
    if let Some(name) = dataset.and_then(|d| d.indicator.as_deref()) {
        return name.to_string();
    }
    if let Some(column) = value_column
        && !GENERIC_VALUE_NAMES.contains(&column.to_lowercase().as_str())
    {
        return column.to_lowercase().replace(' ', "_");
    }
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let file = path.rsplit('/').next().unwrap_or(path);
    file.strip_suffix(".csv").unwrap_or(file).to_string()
}

impl Normalizer for OwidNormalizer {
    fn normalize(&self, records: &[RawRecord]) -> IndicatorBatch {
        let mut groups: Vec<(String, Vec<&RawRecord>)> = Vec::new();
        for record in records {
            let url = record.get(SOURCE_URL_KEY).map(value_to_string).unwrap_or_default();
            match groups.iter_mut().find(|(seen, _)| *seen == url) {
                Some((_, members)) => members.push(record),
                None => groups.push((url, vec![record])),
            }
        }
        let rows = groups
            .iter()
            .flat_map(|(url, members)| self.normalize_group(url, members))
            .collect();
        finalize(SourceKind::Owid, rows, NullPolicy::Retain)
    }
}
