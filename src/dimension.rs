use serde_json::{Value, json};
use tracing::{info, warn};

use crate::error::IngestError;
use crate::geo::CountryCodeSet;
use crate::pagination::{FetchRequest, PageLayout, PaginatedFetch, RecordFilter};
use crate::record::FlatRecord;
use crate::transport::RetryingTransport;

#[derive(Debug, Clone, PartialEq)]
pub struct DimensionQuery {
    pub url: String,
    pub indicator_code: String,
    pub dimension_name: String,
    pub dimension_values: Vec<String>,
    pub time_periods: Vec<i32>,
    pub page_size: u32,
}

#[derive(Debug)]
pub struct DimensionFailure {
    pub value: String,
    pub error: IngestError,
}

#[derive(Debug, Default)]
pub struct DimensionFetchOutcome {
    pub records: Vec<FlatRecord>,
    pub failures: Vec<DimensionFailure>,
}

pub struct DimensionFetch<'a> {
    transport: &'a RetryingTransport,
    countries: Option<&'a CountryCodeSet>,
}

impl<'a> DimensionFetch<'a> {
    pub fn new(transport: &'a RetryingTransport, countries: Option<&'a CountryCodeSet>) -> Self {
        Self {
            transport,
            countries,
        }
    }

    /// Results keep `dimension_values` order and are not de-duplicated.
    pub fn fetch_by_dimension(
        &self,
        query: &DimensionQuery,
    ) -> Result<DimensionFetchOutcome, IngestError> {
        let mut outcome = DimensionFetchOutcome::default();
        let filter = RecordFilter::new(self.countries, &[]);

        for value in &query.dimension_values {
            let label = format!(
                "{} {}={}",
                query.indicator_code, query.dimension_name, value
            );
            self.transport.cancellation().check(&label)?;

            let request = FetchRequest::new(query.url.clone(), query_params(query, value), query.page_size);
            let fetch = PaginatedFetch::new(self.transport, PageLayout::Envelope, label.clone());
            match fetch.fetch_all_filtered(request, &filter) {
                Ok(mut records) => {
                    for record in &mut records {
                        if !record.contains_key("indicator") {
                            record.insert(
                                "indicator".to_string(),
                                json!([query.indicator_code.as_str()]),
                            );
                        }
                    }
                    info!(label = label.as_str(), records = records.len(), "dimension value fetched");
                    outcome.records.extend(records);
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    warn!(label = label.as_str(), error = %err, "dimension value failed; continuing");
                    outcome.failures.push(DimensionFailure {
                        value: value.clone(),
                        error: err,
                    });
                }
            }
        }
        Ok(outcome)
    }
}

fn query_params(query: &DimensionQuery, value: &str) -> Vec<(String, String)> {
    let filter = Value::Array(vec![json!({
        "name": query.dimension_name,
        "values": [value],
    })]);
    let mut params = vec![
        ("indicator".to_string(), query.indicator_code.clone()),
        ("dimensions".to_string(), filter.to_string()),
    ];
    params.extend(
        query
            .time_periods
            .iter()
            .map(|year| ("timePeriod".to_string(), year.to_string())),
    );
    params
}
