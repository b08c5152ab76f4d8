use axum::http::{HeaderMap, Uri};

pub const RESOURCE_ID_QUERY_PARAM: &str = "resource_id";
pub const RESOURCE_ID_HEADER: &str = "x-resource-id";

/// Resolve the tenant/resource id for a request.
///
/// The query parameter wins over the header; the first `resource_id`
/// occurrence is taken when the parameter repeats. Runs before any
/// authentication work so requests without tenant identification fail
/// without incurring token-verification cost.
pub fn resolve_resource_id(uri: &Uri, headers: &HeaderMap) -> Option<String> {
    if let Some(query) = uri.query() {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if key == RESOURCE_ID_QUERY_PARAM && !value.is_empty() {
                return Some(value.into_owned());
            }
        }
    }

    headers
        .get(RESOURCE_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use axum::http::{HeaderMap, HeaderValue, Uri};

    use super::resolve_resource_id;

    fn headers_with(resource_id: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-resource-id",
            HeaderValue::from_str(resource_id).expect("header value"),
        );
        headers
    }

    #[test]
    fn query_param_wins_over_header() {
        let uri: Uri = "/mcp?resource_id=abc".parse().expect("uri");
        let resolved = resolve_resource_id(&uri, &headers_with("xyz"));
        assert_eq!(resolved.as_deref(), Some("abc"));
    }

    #[test]
    fn header_is_the_fallback() {
        let uri: Uri = "/mcp".parse().expect("uri");
        let resolved = resolve_resource_id(&uri, &headers_with("xyz"));
        assert_eq!(resolved.as_deref(), Some("xyz"));
    }

    #[test]
    fn first_query_occurrence_is_taken() {
        let uri: Uri = "/mcp?resource_id=first&resource_id=second"
            .parse()
            .expect("uri");
        let resolved = resolve_resource_id(&uri, &HeaderMap::new());
        assert_eq!(resolved.as_deref(), Some("first"));
    }

    #[test]
    fn empty_values_do_not_count() {
        let uri: Uri = "/mcp?resource_id=".parse().expect("uri");
        assert!(resolve_resource_id(&uri, &HeaderMap::new()).is_none());
        assert!(resolve_resource_id(&uri, &headers_with("  ")).is_none());
    }

    #[test]
    fn missing_everywhere_resolves_to_none() {
        let uri: Uri = "/mcp?other=1".parse().expect("uri");
        assert!(resolve_resource_id(&uri, &HeaderMap::new()).is_none());
    }

    #[test]
    fn url_encoding_in_query_is_decoded() {
        let uri: Uri = "/mcp?resource_id=tenant%2Dwest".parse().expect("uri");
        let resolved = resolve_resource_id(&uri, &HeaderMap::new());
        assert_eq!(resolved.as_deref(), Some("tenant-west"));
    }
}
