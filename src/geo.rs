use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::record::value_to_string;
use crate::transport::RetryingTransport;

pub const DEFAULT_GEO_TREE_URL: &str = "https://unstats.un.org/SDGAPI/v1/sdg/GeoArea/Tree";

pub const MAX_TREE_DEPTH: usize = 32;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountryCodeSet(HashSet<String>);

impl CountryCodeSet {
    pub fn contains(&self, code: &str) -> bool {
        self.0.contains(code)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for CountryCodeSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

pub fn collect_country_codes(tree: &Value, max_depth: usize) -> CountryCodeSet {
    let mut codes = HashSet::new();
    let mut stack: Vec<(&Value, usize)> = match tree {
        Value::Array(nodes) => nodes.iter().rev().map(|node| (node, 0)).collect(),
        node => vec![(node, 0)],
    };
    let mut truncated = false;

    while let Some((node, depth)) = stack.pop() {
        let Some(object) = node.as_object() else {
            continue;
        };
        if object.get("type").and_then(|v| v.as_str()) == Some("Country")
            && let Some(code) = object.get("geoAreaCode")
        {
            let code = value_to_string(code);
            if !code.is_empty() {
                codes.insert(code);
            }
        }
        let Some(children) = object.get("children").and_then(|v| v.as_array()) else {
            continue;
        };
        if depth + 1 > max_depth {
            truncated = true;
            continue;
        }
        stack.extend(children.iter().rev().map(|child| (child, depth + 1)));
    }

    if truncated {
        warn!(max_depth, "geo-area tree exceeds depth cap; deeper nodes ignored");
    }
    CountryCodeSet(codes)
}

pub struct GeoCodeResolver {
    transport: Arc<RetryingTransport>,
    tree_url: String,
}

impl GeoCodeResolver {
    pub fn new(transport: Arc<RetryingTransport>, tree_url: impl Into<String>) -> Self {
        Self {
            transport,
            tree_url: tree_url.into(),
        }
    }

    /// Fails open: any transport or decode failure yields an empty set.
    pub fn resolve_country_codes(&self) -> CountryCodeSet {
        let body = self
            .transport
            .get(&self.tree_url, &[], "geo-area tree")
            .and_then(|response| response.json("geo-area tree"));
        match body {
            Ok(tree) => {
                let codes = collect_country_codes(&tree, MAX_TREE_DEPTH);
                info!(countries = codes.len(), "resolved country codes");
                codes
            }
            Err(err) => {
                warn!(
                    error = %err,
                    "could not resolve country codes; country filtering disabled"
                );
                CountryCodeSet::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn collects_nested_countries() {
        let tree = json!([
            {"type": "Region", "geoAreaCode": 1, "children": [
                {"type": "Country", "geoAreaCode": "4"}
            ]}
        ]);
        let expected: CountryCodeSet = ["4"].into_iter().collect();
        assert_eq!(collect_country_codes(&tree, MAX_TREE_DEPTH), expected);
    }

    #[test]
    fn numeric_codes_are_stringified() {
        let tree = json!({"type": "Country", "geoAreaCode": 840});
        assert!(collect_country_codes(&tree, MAX_TREE_DEPTH).contains("840"));
    }

    #[test]
    fn depth_cap_stops_descent() {
        let tree = json!([
            {"type": "World", "children": [
                {"type": "Region", "children": [
                    {"type": "Country", "geoAreaCode": "8"}
                ]}
            ]}
        ]);
        assert!(collect_country_codes(&tree, 1).is_empty());
        assert_eq!(collect_country_codes(&tree, 2).len(), 1);
    }

    #[test]
    fn non_object_nodes_are_skipped() {
        let tree = json!([null, 3, {"type": "Country", "geoAreaCode": "12", "children": null}]);
        assert_eq!(collect_country_codes(&tree, MAX_TREE_DEPTH).len(), 1);
    }
}
