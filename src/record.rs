use serde_json::{Map, Value};
use tracing::warn;

pub type RawRecord = Map<String, Value>;

pub type FlatRecord = Map<String, Value>;

pub const DIMENSIONS_KEY: &str = "dimensions";

/// Nested `dimensions` keys win on collision; a non-object `dimensions` is left as is.
pub fn flatten(record: &RawRecord) -> FlatRecord {
    let Some(Value::Object(dimensions)) = record.get(DIMENSIONS_KEY) else {
        return record.clone();
    };

    let mut flat: FlatRecord = record
        .iter()
        .filter(|(key, _)| key.as_str() != DIMENSIONS_KEY)
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    for (key, value) in dimensions {
        // A nested "dimensions" key would make a second pass flatten again.
        if key == DIMENSIONS_KEY {
            continue;
        }
        if let Some(previous) = flat.get(key)
            && previous != value
        {
            warn!(
                key = key.as_str(),
                top_level = %previous,
                nested = %value,
                "dimension key collides with top-level field; keeping nested value"
            );
        }
        flat.insert(key.clone(), value.clone());
    }
    flat
}

pub fn flatten_all(records: Vec<RawRecord>) -> Vec<FlatRecord> {
    records.iter().map(flatten).collect()
}

pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

pub fn first_text(record: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| record.get(*key))
        .map(value_to_string)
        .map(|text| text.trim().to_string())
        .find(|text| !text.is_empty())
}

pub fn first_value<'a>(record: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| record.get(*key))
        .find(|value| !value.is_null())
}
