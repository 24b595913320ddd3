//! Raw query-parameter maps.
//!
//! GET requests parse the URL query; POST requests (used by WPS Execute)
//! parse the body as the same urlencoded map. Keys are lowercased so the
//! protocol checkers can be case-insensitive; repeated keys keep every
//! value in order, which the coverage worker-mode parameters rely on.

use std::collections::HashMap;

use url::form_urlencoded;

/// Normalised multi-valued request parameters.
pub type RawQuery = HashMap<String, Vec<String>>;

/// Parse an urlencoded query or POST body into a [`RawQuery`].
pub fn parse_query(input: &str) -> RawQuery {
    let mut query = RawQuery::new();
    for (key, value) in form_urlencoded::parse(input.as_bytes()) {
        query
            .entry(key.to_lowercase())
            .or_default()
            .push(value.into_owned());
    }
    query
}

/// First value of a key, if present and non-empty.
pub fn first<'q>(query: &'q RawQuery, key: &str) -> Option<&'q str> {
    query
        .get(key)
        .and_then(|v| v.first())
        .map(|s| s.as_str())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_lowercased() {
        let q = parse_query("SERVICE=WMS&Request=GetMap");
        assert_eq!(first(&q, "service"), Some("WMS"));
        assert_eq!(first(&q, "request"), Some("GetMap"));
    }

    #[test]
    fn test_repeated_keys_keep_order() {
        let q = parse_query("wbbox=1,2,3,4&wbbox=5,6,7,8&wwidth=10");
        assert_eq!(q["wbbox"], vec!["1,2,3,4", "5,6,7,8"]);
        assert_eq!(q["wwidth"], vec!["10"]);
    }

    #[test]
    fn test_percent_decoding() {
        let q = parse_query("time=2020-01-15T00%3A00%3A00.000Z");
        assert_eq!(first(&q, "time"), Some("2020-01-15T00:00:00.000Z"));
    }

    #[test]
    fn test_empty_value_skipped_by_first() {
        let q = parse_query("styles=&layers=L");
        assert_eq!(first(&q, "styles"), None);
        assert_eq!(first(&q, "layers"), Some("L"));
    }
}
