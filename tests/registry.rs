mod support;

use std::sync::Arc;

use assert_matches::assert_matches;
use serde_json::json;

use indicator_ingest::domain::SourceKind;
use indicator_ingest::error::IngestError;
use indicator_ingest::registry::SourceRegistry;

use support::{FakeClock, MockBackend, session};

#[test]
fn standard_registry_knows_every_source() {
    let registry = SourceRegistry::standard();
    let kinds: Vec<SourceKind> = registry.kinds().collect();
    assert_eq!(kinds, SourceKind::ALL.to_vec());
}

#[test]
fn empty_registry_rejects_builds() {
    let env = session(Arc::new(MockBackend::always(200)), Arc::new(FakeClock::new()));
    let result = SourceRegistry::empty()
        .build(SourceKind::Owid, json!({"datasets": []}), &env)
        .map(|source| source.kind());
    assert_matches!(result, Err(IngestError::UnknownSource(_)));
}

#[test]
fn bad_settings_fail_before_any_request() {
    let backend = Arc::new(MockBackend::always(200));
    let env = session(backend.clone(), Arc::new(FakeClock::new()));
    let result = SourceRegistry::standard().build_all(
        vec![
            (SourceKind::Owid, json!({"datasets": [{"url": "https://owid.test/a.csv"}]})),
            (SourceKind::WorldBank, json!({"indicators": "SP.POP.TOTL"})),
        ],
        &env,
    );
    assert_matches!(
        result.map(|sources| sources.len()),
        Err(IngestError::InvalidSourceSettings { source_name, .. }) if source_name == "worldbank"
    );
    assert_eq!(backend.call_count(), 0);
}

#[test]
fn hdr_build_uses_session_api_key() {
    let mut env = session(Arc::new(MockBackend::always(200)), Arc::new(FakeClock::new()));
    let settings = json!({"indicators": ["HDI"], "years": [2020]});
    assert_matches!(
        SourceRegistry::standard()
            .build(SourceKind::Hdr, settings.clone(), &env)
            .map(|source| source.kind()),
        Err(IngestError::MissingApiKey(_))
    );

    env.api_keys.insert(SourceKind::Hdr, "key".to_string());
    let source = SourceRegistry::standard()
        .build(SourceKind::Hdr, settings, &env)
        .unwrap();
    assert_eq!(source.kind(), SourceKind::Hdr);
}
