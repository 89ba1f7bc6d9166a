use std::cmp::Ordering;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::domain::SourceKind;
use crate::record::{RawRecord, value_to_string};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NormalizedRow {
    pub country_code: Option<String>,
    pub country: Option<String>,
    pub indicator: String,
    pub year: Option<i32>,
    pub value: Option<f64>,
    pub series_code: Option<String>,
    pub class_code: Option<String>,
    pub class_name: Option<String>,
    pub nature: Option<String>,
    pub reporting_type: Option<String>,
}

impl NormalizedRow {
    pub fn new(indicator: impl Into<String>) -> Self {
        Self {
            indicator: indicator.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorBatch {
    pub source: SourceKind,
    pub rows: Vec<NormalizedRow>,
}

impl IndicatorBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullPolicy {
    Drop,
    Retain,
}

impl NullPolicy {
    pub fn for_source(kind: SourceKind) -> Self {
        if kind.is_api() {
            NullPolicy::Drop
        } else {
            NullPolicy::Retain
        }
    }
}

pub trait Normalizer {
    fn normalize(&self, records: &[RawRecord]) -> IndicatorBatch;
}

pub fn coerce_value(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(_) | Value::Null | Value::Array(_) | Value::Object(_) => None,
    }?;
    number.is_finite().then_some(number)
}

pub fn coerce_year(value: &Value) -> Option<i32> {
    match value {
        Value::Number(n) => {
            if let Some(int) = n.as_i64() {
                return i32::try_from(int).ok();
            }
            n.as_f64().and_then(integral_year)
        }
        Value::String(s) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i32>()
                .ok()
                .or_else(|| trimmed.parse::<f64>().ok().and_then(integral_year))
        }
        _ => None,
    }
}

fn integral_year(value: f64) -> Option<i32> {
    if value.is_finite() && value.fract() == 0.0 && value.abs() <= f64::from(i32::MAX) {
        Some(value as i32)
    } else {
        None
    }
}

pub fn optional_text(value: Option<&Value>) -> Option<String> {
    value
        .map(value_to_string)
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

/// Applies the null policy, drops rows without an indicator, then sorts by
/// `(country, indicator, year)` with missing keys last.
pub fn finalize(source: SourceKind, rows: Vec<NormalizedRow>, policy: NullPolicy) -> IndicatorBatch {
    let mut rows = rows;
    let before = rows.len();
    rows.retain(|row| !row.indicator.trim().is_empty());
    if rows.len() != before {
        warn!(
            source = %source,
            dropped = before - rows.len(),
            "dropped rows without an indicator"
        );
    }
    if policy == NullPolicy::Drop {
        rows.retain(|row| row.value.is_some());
    }
    rows.sort_by(compare_rows);
    IndicatorBatch { source, rows }
}

fn compare_rows(a: &NormalizedRow, b: &NormalizedRow) -> Ordering {
    nulls_last(&a.country, &b.country)
        .then_with(|| a.indicator.cmp(&b.indicator))
        .then_with(|| nulls_last(&a.year, &b.year))
}

fn nulls_last<T: Ord>(a: &Option<T>, b: &Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

static YEAR_COLUMN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+(?:\.\d+)?$").expect("year column pattern compiles"));

pub fn is_year_column(name: &str) -> bool {
    YEAR_COLUMN.is_match(name.trim())
}

pub fn melt_wide(
    record: &Map<String, Value>,
    code_column: Option<&str>,
    name_column: Option<&str>,
    indicator: &str,
) -> Vec<NormalizedRow> {
    let country_code = optional_text(code_column.and_then(|c| record.get(c)));
    let country = optional_text(name_column.and_then(|c| record.get(c)));
    record
        .iter()
        .filter(|(column, _)| Some(column.as_str()) != code_column && Some(column.as_str()) != name_column)
        .filter(|(column, _)| is_year_column(column))
        .map(|(column, cell)| NormalizedRow {
            country_code: country_code.clone(),
            country: country.clone(),
            indicator: indicator.to_string(),
            year: coerce_year(&Value::String(column.clone())),
            value: coerce_value(cell),
            ..NormalizedRow::default()
        })
        .collect()
}
