mod support;

use std::sync::Arc;

use serde_json::json;

use indicator_ingest::geo::GeoCodeResolver;

use support::{FakeClock, MockBackend, json_reply, quick_policy, transport};

#[test]
fn resolves_countries_from_tree() {
    let backend = Arc::new(MockBackend::queue(vec![json_reply(json!([
        {"type": "Region", "geoAreaCode": "1", "children": [
            {"type": "Country", "geoAreaCode": "4"}
        ]}
    ]))]));
    let transport = Arc::new(transport(backend, Arc::new(FakeClock::new()), quick_policy(2)));

    let codes = GeoCodeResolver::new(transport, "https://unstats.test/GeoArea/Tree")
        .resolve_country_codes();

    assert_eq!(codes.len(), 1);
    assert!(codes.contains("4"));
    assert!(!codes.contains("1"));
}

#[test]
fn transport_failure_yields_empty_set() {
    let backend = Arc::new(MockBackend::always(503));
    let clock = Arc::new(FakeClock::new());
    let transport = Arc::new(transport(backend.clone(), clock, quick_policy(2)));

    let codes = GeoCodeResolver::new(transport, "https://unstats.test/GeoArea/Tree")
        .resolve_country_codes();

    assert!(codes.is_empty());
    assert_eq!(backend.call_count(), 2);
}

#[test]
fn undecodable_body_yields_empty_set() {
    let backend = Arc::new(MockBackend::queue(vec![support::text_reply("<html>")]));
    let transport = Arc::new(transport(backend, Arc::new(FakeClock::new()), quick_policy(2)));

    let codes = GeoCodeResolver::new(transport, "https://unstats.test/GeoArea/Tree")
        .resolve_country_codes();
    assert!(codes.is_empty());
}
