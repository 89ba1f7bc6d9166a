use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::IngestError;
use crate::geo::CountryCodeSet;
use crate::record::{FlatRecord, RawRecord, flatten_all, value_to_string};
use crate::transport::RetryingTransport;

pub const MAX_PAGES: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLayout {
    /// `{data, totalPages, totalElements}`
    Envelope,
    /// `[metadata, data]` with `metadata.pages`
    MetadataPair,
}

impl PageLayout {
    pub fn page_size_param(&self) -> &'static str {
        match self {
            PageLayout::Envelope => "pageSize",
            PageLayout::MetadataPair => "per_page",
        }
    }

    pub fn geo_field(&self) -> &'static str {
        match self {
            PageLayout::Envelope => "geoAreaCode",
            PageLayout::MetadataPair => "countryiso3code",
        }
    }

    fn page_params(&self, page: u32, page_size: u32) -> Vec<(String, String)> {
        let mut params = vec![
            ("page".to_string(), page.to_string()),
            (self.page_size_param().to_string(), page_size.to_string()),
        ];
        if matches!(self, PageLayout::MetadataPair) {
            params.push(("format".to_string(), "json".to_string()));
        }
        params
    }

    fn parse(&self, body: &Value, first_page: bool, context: &str) -> Result<Page, IngestError> {
        let (meta, data) = match self {
            PageLayout::Envelope => {
                let object = body
                    .as_object()
                    .ok_or_else(|| IngestError::structural(context, "expected a JSON object"))?;
                (Some(object), object.get("data"))
            }
            PageLayout::MetadataPair => {
                let items = body.as_array().ok_or_else(|| {
                    IngestError::structural(context, "expected a [metadata, data] array")
                })?;
                let meta = items.first().and_then(|v| v.as_object());
                if meta.is_none() {
                    return Err(IngestError::structural(context, "missing metadata object"));
                }
                (meta, items.get(1))
            }
        };

        let (pages_key, total_key) = match self {
            PageLayout::Envelope => ("totalPages", "totalElements"),
            PageLayout::MetadataPair => ("pages", "total"),
        };
        let total_pages = meta
            .and_then(|m| m.get(pages_key))
            .and_then(as_u64)
            .map(|v| v.min(u64::from(u32::MAX)) as u32);
        let total_elements = meta.and_then(|m| m.get(total_key)).and_then(as_u64);

        let records = match data {
            None if first_page => {
                return Err(IngestError::structural(context, "response has no data array"));
            }
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| item.as_object().cloned())
                .collect(),
            Some(_) => return Err(IngestError::structural(context, "data is not an array")),
        };

        Ok(Page {
            records,
            total_pages,
            total_elements,
        })
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub url: String,
    pub query_params: Vec<(String, String)>,
    pub page_number: u32,
    pub page_size: u32,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>, query_params: Vec<(String, String)>, page_size: u32) -> Self {
        Self {
            url: url.into(),
            query_params,
            page_number: 1,
            page_size,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Page {
    pub records: Vec<RawRecord>,
    pub total_pages: Option<u32>,
    pub total_elements: Option<u64>,
}

#[derive(Debug)]
pub enum PageStep {
    Continue(u32),
    Done,
    Failed(IngestError),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RecordFilter<'a> {
    pub countries: Option<&'a CountryCodeSet>,
    pub dimension_values: &'a [String],
}

impl<'a> RecordFilter<'a> {
    pub fn new(countries: Option<&'a CountryCodeSet>, dimension_values: &'a [String]) -> Self {
        Self {
            countries,
            dimension_values,
        }
    }

    pub fn apply(&self, records: Vec<FlatRecord>, geo_field: &str) -> Vec<FlatRecord> {
        let mut records = records;
        if let Some(countries) = self.countries.filter(|set| !set.is_empty()) {
            records.retain(|record| {
                record
                    .get(geo_field)
                    .map(|code| countries.contains(&value_to_string(code)))
                    .unwrap_or(false)
            });
        }
        if !self.dimension_values.is_empty() {
            // Approximate: a filter value matches if it occurs inside any field.
            records.retain(|record| {
                let fields: Vec<String> = record.values().map(value_to_string).collect();
                self.dimension_values
                    .iter()
                    .any(|wanted| fields.iter().any(|field| field.contains(wanted.as_str())))
            });
        }
        records
    }
}

pub struct PaginatedFetch<'a> {
    transport: &'a RetryingTransport,
    layout: PageLayout,
    label: String,
}

impl<'a> PaginatedFetch<'a> {
    pub fn new(transport: &'a RetryingTransport, layout: PageLayout, label: impl Into<String>) -> Self {
        Self {
            transport,
            layout,
            label: label.into(),
        }
    }

    pub fn fetch_all(&self, request: FetchRequest) -> Result<Vec<FlatRecord>, IngestError> {
        let mut request = request;
        let mut total_pages = None;
        let mut records = Vec::new();
        loop {
            match self.step(&request, &mut total_pages, &mut records) {
                PageStep::Continue(next) => request.page_number = next,
                PageStep::Done => break,
                PageStep::Failed(err) => return Err(err),
            }
        }
        info!(
            label = self.label.as_str(),
            pages = request.page_number,
            records = records.len(),
            "pagination finished"
        );
        Ok(records)
    }

    pub fn fetch_all_filtered(
        &self,
        request: FetchRequest,
        filter: &RecordFilter<'_>,
    ) -> Result<Vec<FlatRecord>, IngestError> {
        let records = self.fetch_all(request)?;
        let fetched = records.len();
        let kept = filter.apply(records, self.layout.geo_field());
        if kept.len() != fetched {
            debug!(
                label = self.label.as_str(),
                fetched,
                kept = kept.len(),
                "filtered records"
            );
        }
        Ok(kept)
    }

    pub fn step(
        &self,
        request: &FetchRequest,
        total_pages: &mut Option<u32>,
        records: &mut Vec<FlatRecord>,
    ) -> PageStep {
        let page = request.page_number;
        let context = format!("{} page {page}", self.label);
        if let Err(err) = self.transport.cancellation().check(&context) {
            return PageStep::Failed(err);
        }

        let mut params = request.query_params.clone();
        params.extend(self.layout.page_params(page, request.page_size));

        let parsed = self
            .transport
            .get(&request.url, &params, &context)
            .and_then(|response| response.json(&context))
            .and_then(|body| self.layout.parse(&body, page == 1, &context));
        let parsed = match parsed {
            Ok(parsed) => parsed,
            Err(err) => return PageStep::Failed(err),
        };

        if page == 1 {
            *total_pages = Some(parsed.total_pages.unwrap_or(1).max(1));
            debug!(
                label = self.label.as_str(),
                total_pages = total_pages.unwrap_or(1),
                total_elements = parsed.total_elements,
                "first page"
            );
        }
        if parsed.records.is_empty() {
            return PageStep::Done;
        }
        debug!(label = self.label.as_str(), page, count = parsed.records.len(), "page fetched");
        records.extend(flatten_all(parsed.records));

        let last = total_pages.unwrap_or(1);
        if page >= last {
            return PageStep::Done;
        }
        if page >= MAX_PAGES {
            warn!(label = self.label.as_str(), max_pages = MAX_PAGES, "page cap reached");
            return PageStep::Done;
        }
        PageStep::Continue(page + 1)
    }
}
