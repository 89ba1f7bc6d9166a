use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::dimension::{DimensionFetch, DimensionQuery};
use crate::domain::{IndicatorEntry, SourceKind, YearSelection};
use crate::error::IngestError;
use crate::geo::CountryCodeSet;
use crate::normalize::{
    IndicatorBatch, NormalizedRow, Normalizer, NullPolicy, coerce_value, coerce_year, finalize,
    optional_text,
};
use crate::pagination::{FetchRequest, PageLayout, PaginatedFetch, RecordFilter};
use crate::record::{DIMENSIONS_KEY, RawRecord, first_text, value_to_string};
use crate::sources::{
    DataSource, FetchContext, SourceFetch, UnitCollector, invalid, parse_settings, resolve_years,
};
use crate::transport::RetryingTransport;

pub const DEFAULT_BASE_URL: &str = "https://unstats.un.org/SDGAPI/v1/sdg";
pub const DEFAULT_DATA_ENDPOINT: &str = "/Indicator/Data";

const SERIES_CODE_FIELD: &str = "series_code";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct IndicatorClassSpec {
    #[serde(default)]
    pub fetch_by_dimension: bool,
    #[serde(default)]
    pub dimension_field: Option<String>,
    #[serde(default)]
    pub classes: BTreeMap<String, String>,
}

/// Indicator code → how its dimension maps onto classes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct IndicatorClassTable(BTreeMap<String, IndicatorClassSpec>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionFetchSpec {
    pub indicator: String,
    pub dimension_name: String,
    pub dimension_values: Vec<String>,
}

impl IndicatorClassTable {
    pub fn get(&self, indicator: &str) -> Option<&IndicatorClassSpec> {
        self.0.get(indicator)
    }

    pub fn dimension_fetch_specs(&self, codes: &[&str]) -> Vec<DimensionFetchSpec> {
        codes
            .iter()
            .filter_map(|code| {
                let spec = self.0.get(*code)?;
                if !spec.fetch_by_dimension {
                    return None;
                }
                let field = spec.dimension_field.as_deref()?;
                if field.is_empty() || field == SERIES_CODE_FIELD || spec.classes.is_empty() {
                    return None;
                }
                Some(DimensionFetchSpec {
                    indicator: code.to_string(),
                    dimension_name: field.to_string(),
                    dimension_values: spec.classes.keys().cloned().collect(),
                })
            })
            .collect()
    }

    fn classify(&self, indicator: &str, record: &Map<String, Value>) -> (Option<String>, Option<String>) {
        let Some(spec) = self.0.get(indicator) else {
            return (None, None);
        };
        let Some(field) = spec.dimension_field.as_deref() else {
            return (None, None);
        };
        let field = if field == SERIES_CODE_FIELD { "series" } else { field };
        let code = optional_text(record.get(field)).or_else(|| {
            record
                .get(DIMENSIONS_KEY)
                .and_then(|v| v.as_object())
                .and_then(|dims| optional_text(dims.get(field)))
        });
        let name = code.as_ref().and_then(|code| spec.classes.get(code).cloned());
        (code, name)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnSdgSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_data_endpoint")]
    pub data_endpoint: String,
    pub indicators: Vec<IndicatorEntry>,
    #[serde(flatten)]
    pub years: YearSelection,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub dimension_filters: Vec<String>,
    #[serde(default = "default_true")]
    pub filter_countries: bool,
    #[serde(default)]
    pub indicator_classes: IndicatorClassTable,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_data_endpoint() -> String {
    DEFAULT_DATA_ENDPOINT.to_string()
}

fn default_page_size() -> u32 {
    1000
}

fn default_true() -> bool {
    true
}

pub struct UnSdgSource {
    transport: RetryingTransport,
    settings: UnSdgSettings,
    years: Vec<i32>,
    normalizer: UnSdgNormalizer,
}

impl UnSdgSource {
    pub fn new(settings: UnSdgSettings, transport: RetryingTransport) -> Result<Self, IngestError> {
        let kind = SourceKind::UnSdg;
        if settings.indicators.is_empty() {
            return Err(invalid(kind, "at least one indicator is required"));
        }
        if settings.page_size == 0 {
            return Err(invalid(kind, "page_size must be positive"));
        }
        let years = resolve_years(kind, &settings.years)?;
        let normalizer = UnSdgNormalizer::new(settings.indicator_classes.clone());
        Ok(Self {
            transport,
            settings,
            years,
            normalizer,
        })
    }

    pub fn from_value(value: Value, transport: RetryingTransport) -> Result<Self, IngestError> {
        Self::new(parse_settings(SourceKind::UnSdg, value)?, transport)
    }

    fn url(&self) -> String {
        format!(
            "{}{}",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.data_endpoint
        )
    }

    fn time_periods(&self) -> impl Iterator<Item = (String, String)> + '_ {
        self.years
            .iter()
            .map(|year| ("timePeriod".to_string(), year.to_string()))
    }

    fn fetch_bulk(
        &self,
        codes: &[&str],
        countries: Option<&CountryCodeSet>,
    ) -> Result<Vec<RawRecord>, IngestError> {
        let mut params: Vec<(String, String)> = codes
            .iter()
            .map(|code| ("indicator".to_string(), code.to_string()))
            .collect();
        params.extend(self.time_periods());
        let request = FetchRequest::new(self.url(), params, self.settings.page_size);
        let filter = RecordFilter::new(countries, &self.settings.dimension_filters);
        PaginatedFetch::new(&self.transport, PageLayout::Envelope, "unsdg bulk")
            .fetch_all_filtered(request, &filter)
    }
}

impl DataSource for UnSdgSource {
    fn kind(&self) -> SourceKind {
        SourceKind::UnSdg
    }

    fn fetch(&self, ctx: &FetchContext<'_>) -> Result<SourceFetch, IngestError> {
        let countries = self.settings.filter_countries.then_some(ctx.countries);
        let codes: Vec<&str> = self.settings.indicators.iter().map(IndicatorEntry::code).collect();
        let specs = self.settings.indicator_classes.dimension_fetch_specs(&codes);
        let bulk: Vec<&str> = codes
            .iter()
            .copied()
            .filter(|code| !specs.iter().any(|spec| spec.indicator == *code))
            .collect();
        info!(
            bulk = bulk.len(),
            by_dimension = specs.len(),
            "fetching unsdg indicators"
        );

        let mut units = UnitCollector::new(self.kind());
        if !bulk.is_empty() {
            units.record(bulk.join(","), self.fetch_bulk(&bulk, countries))?;
        }

        let by_dimension = DimensionFetch::new(&self.transport, countries);
        for spec in specs {
            let query = DimensionQuery {
                url: self.url(),
                indicator_code: spec.indicator.clone(),
                dimension_name: spec.dimension_name.clone(),
                dimension_values: spec.dimension_values.clone(),
                time_periods: self.years.clone(),
                page_size: self.settings.page_size,
            };
            let outcome = by_dimension.fetch_by_dimension(&query)?;
            let failed = outcome.failures.len();
            for failure in outcome.failures {
                let unit = format!("{} {}={}", spec.indicator, spec.dimension_name, failure.value);
                units.push_failure(unit, failure.error);
            }
            let succeeded = spec.dimension_values.len() - failed;
            if succeeded > 0 {
                units.record(spec.indicator.clone(), Ok(outcome.records))?;
            }
        }
        units.finish()
    }

    fn normalize(&self, records: &[RawRecord]) -> IndicatorBatch {
        self.normalizer.normalize(records)
    }
}

#[derive(Debug, Clone, Default)]
pub struct UnSdgNormalizer {
    classes: IndicatorClassTable,
}

impl UnSdgNormalizer {
    pub fn new(classes: IndicatorClassTable) -> Self {
        Self { classes }
    }

    fn row(&self, record: &RawRecord) -> NormalizedRow {
        let indicator = match record.get("indicator") {
            Some(Value::Array(codes)) => codes.first().map(value_to_string).unwrap_or_default(),
            Some(other) => value_to_string(other),
            None => String::new(),
        };
        let dimensions = record.get(DIMENSIONS_KEY).and_then(|v| v.as_object());
        let reporting_type = first_text(record, &["Reporting Type"])
            .or_else(|| dimensions.and_then(|dims| first_text(dims, &["Reporting Type"])));
        let nature = record
            .get("attributes")
            .and_then(|v| v.as_object())
            .and_then(|attrs| first_text(attrs, &["Nature"]));
        let (class_code, class_name) = self.classes.classify(&indicator, record);

        NormalizedRow {
            country_code: first_text(record, &["geoAreaCode"]),
            country: first_text(record, &["geoAreaName"]),
            year: record.get("timePeriodStart").and_then(coerce_year),
            value: record.get("value").and_then(coerce_value),
            series_code: first_text(record, &["series"]),
            class_code,
            class_name,
            nature,
            reporting_type,
            indicator,
        }
    }
}

impl Normalizer for UnSdgNormalizer {
    fn normalize(&self, records: &[RawRecord]) -> IndicatorBatch {
        let rows = records.iter().map(|record| self.row(record)).collect();
        finalize(SourceKind::UnSdg, rows, NullPolicy::Drop)
    }
}
