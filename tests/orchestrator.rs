mod support;

use std::fs;
use std::sync::Arc;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use serde_json::{Value, json};

use indicator_ingest::cancel::CancellationToken;
use indicator_ingest::domain::SourceKind;
use indicator_ingest::error::IngestError;
use indicator_ingest::normalize::{IndicatorBatch, NormalizedRow};
use indicator_ingest::orchestrator::{FetchOrchestrator, SourceOutcome};
use indicator_ingest::record::RawRecord;
use indicator_ingest::registry::SourceRegistry;
use indicator_ingest::sources::{DataSource, FetchContext, SourceFetch, UnitFailure};

use support::{FakeClock, MockBackend, json_reply, record, session};

enum Behavior {
    Records(usize),
    Partial,
    Fail,
    Cancel,
}

struct StubSource {
    kind: SourceKind,
    behavior: Behavior,
}

impl StubSource {
    fn boxed(kind: SourceKind, behavior: Behavior) -> Box<dyn DataSource> {
        Box::new(Self { kind, behavior })
    }
}

fn numbered(count: usize) -> Vec<RawRecord> {
    (0..count).map(|n| record(json!({"n": n}))).collect()
}

impl DataSource for StubSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn fetch(&self, _ctx: &FetchContext<'_>) -> Result<SourceFetch, IngestError> {
        match self.behavior {
            Behavior::Records(count) => Ok(SourceFetch {
                records: numbered(count),
                unit_failures: Vec::new(),
            }),
            Behavior::Partial => Ok(SourceFetch {
                records: numbered(1),
                unit_failures: vec![UnitFailure {
                    unit: "HDI 2021".to_string(),
                    error: IngestError::Http("connection reset".to_string()),
                }],
            }),
            Behavior::Fail => Err(IngestError::Http("unreachable".to_string())),
            Behavior::Cancel => Err(IngestError::Cancelled("stub".to_string())),
        }
    }

    fn normalize(&self, records: &[RawRecord]) -> IndicatorBatch {
        let rows = records
            .iter()
            .map(|raw| NormalizedRow {
                value: raw.get("n").and_then(Value::as_f64),
                ..NormalizedRow::new("stub")
            })
            .collect();
        IndicatorBatch {
            source: self.kind,
            rows,
        }
    }
}

#[test]
fn failing_source_does_not_stop_the_others() {
    let orchestrator = FetchOrchestrator::new(
        vec![
            StubSource::boxed(SourceKind::WorldBank, Behavior::Fail),
            StubSource::boxed(SourceKind::Hdr, Behavior::Partial),
            StubSource::boxed(SourceKind::Owid, Behavior::Records(2)),
        ],
        CancellationToken::new(),
    );

    let output = orchestrator.run().unwrap();

    let sources: Vec<SourceKind> = output.batches.iter().map(|batch| batch.source).collect();
    assert_eq!(sources, vec![SourceKind::Hdr, SourceKind::Owid]);

    let summary = &output.summary;
    assert_eq!(summary.succeeded(), 2);
    assert_eq!(summary.failed(), 1);
    assert_eq!(summary.sources[0].outcome, SourceOutcome::Failed);
    assert!(summary.sources[0].error.as_deref().unwrap().contains("unreachable"));
    assert_eq!(summary.sources[1].outcome, SourceOutcome::Partial);
    assert_eq!(summary.sources[1].unit_failures[0].unit, "HDI 2021");
    assert_eq!(summary.sources[2].outcome, SourceOutcome::Succeeded);
    assert_eq!(summary.sources[2].rows, 2);
    assert_eq!(summary.sources[2].raw_archive, None);
}

#[test]
fn every_source_failing_is_an_error() {
    let orchestrator = FetchOrchestrator::new(
        vec![
            StubSource::boxed(SourceKind::WorldBank, Behavior::Fail),
            StubSource::boxed(SourceKind::UnSdg, Behavior::Fail),
        ],
        CancellationToken::new(),
    );
    assert_matches!(orchestrator.run(), Err(IngestError::AllSourcesFailed(2)));
}

#[test]
fn cancellation_inside_a_source_aborts_the_run() {
    let orchestrator = FetchOrchestrator::new(
        vec![
            StubSource::boxed(SourceKind::WorldBank, Behavior::Cancel),
            StubSource::boxed(SourceKind::Owid, Behavior::Records(1)),
        ],
        CancellationToken::new(),
    );
    assert_matches!(orchestrator.run(), Err(IngestError::Cancelled(_)));
}

#[test]
fn cancelled_token_stops_before_the_first_source() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let orchestrator = FetchOrchestrator::new(
        vec![StubSource::boxed(SourceKind::Owid, Behavior::Records(1))],
        cancel,
    );
    assert_matches!(orchestrator.run(), Err(IngestError::Cancelled(_)));
}

#[test]
fn raw_records_are_archived_per_source() {
    let dir = tempfile::tempdir().unwrap();
    let raw_dir = Utf8PathBuf::from_path_buf(dir.path().join("raw")).unwrap();
    let orchestrator = FetchOrchestrator::new(
        vec![StubSource::boxed(SourceKind::NdGain, Behavior::Records(3))],
        CancellationToken::new(),
    )
    .with_raw_dir(raw_dir.clone());

    let output = orchestrator.run().unwrap();

    let expected = raw_dir.join("ndgain_raw.json");
    assert_eq!(output.summary.sources[0].raw_archive.as_ref(), Some(&expected));
    let saved: Vec<Value> = serde_json::from_str(&fs::read_to_string(&expected).unwrap()).unwrap();
    assert_eq!(saved.len(), 3);
    assert_eq!(saved[2], json!({"n": 2}));
}

#[test]
fn geo_tree_is_resolved_once_and_filters_unsdg() {
    let backend = Arc::new(MockBackend::routed(|url, _| {
        if url.ends_with("/GeoArea/Tree") {
            json_reply(json!([{"type": "Region", "geoAreaCode": "1", "children": [
                {"type": "Country", "geoAreaCode": "4"},
                {"type": "Country", "geoAreaCode": "8"}
            ]}]))
        } else {
            json_reply(json!({
                "totalPages": 1,
                "data": [
                    {"geoAreaCode": "4", "indicator": ["1.1.1"], "timePeriodStart": 2020, "value": 1},
                    {"geoAreaCode": "1", "indicator": ["1.1.1"], "timePeriodStart": 2020, "value": 9}
                ]
            }))
        }
    }));
    let env = session(backend.clone(), Arc::new(FakeClock::new()));
    let source = SourceRegistry::standard()
        .build(
            SourceKind::UnSdg,
            json!({"base_url": "https://unstats.test", "indicators": ["1.1.1"], "years": [2020]}),
            &env,
        )
        .unwrap();

    let output = FetchOrchestrator::new(vec![source], env.cancel.clone())
        .with_geo_tree(&env, "https://unstats.test/GeoArea/Tree")
        .run()
        .unwrap();

    assert_eq!(output.summary.country_codes, 2);
    assert_eq!(output.batches[0].rows.len(), 1);
    assert_eq!(output.batches[0].rows[0].country_code.as_deref(), Some("4"));
    let tree_calls = backend
        .calls()
        .iter()
        .filter(|call| call.url.ends_with("/GeoArea/Tree"))
        .count();
    assert_eq!(tree_calls, 1);
}
