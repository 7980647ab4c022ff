//! Synthetic answer returned to the commenter when live delivery failed.

use crate::request::Response;
use bytes::Bytes;
use http::{
    HeaderMap, HeaderName, HeaderValue, StatusCode,
    header::{
        ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_ORIGIN,
        ACCESS_CONTROL_EXPOSE_HEADERS, CACHE_CONTROL, CONTENT_TYPE,
    },
};
use serde::Serialize;
use url::Origin;

/// Source-origin header of the AMP CORS protocol, checked by AMP form handlers.
pub const AMP_SOURCE_ORIGIN_HEADER: &str = "AMP-Access-Control-Allow-Source-Origin";

const JSON_CONTENT_TYPE: &str = "application/json; charset=UTF-8";
const NO_CACHE: &str = "no-cache, must-revalidate, max-age=0";

#[derive(Serialize)]
struct QueuedBody<'a> {
    error: &'a str,
}

/// Builds the "queued" response. Infallible: every header value is checked
/// once at construction.
#[derive(Debug, Clone)]
pub struct FallbackResponder {
    headers: HeaderMap,
    body: Bytes,
}

impl FallbackResponder {
    #[must_use]
    pub fn new(site_origin: &Origin, message: &str) -> Self {
        let origin = site_origin.ascii_serialization();
        // ASCII serialization of a tuple origin is always a valid header value;
        // an opaque origin serializes to "null", which is valid too.
        let origin = HeaderValue::from_str(&origin).unwrap_or(HeaderValue::from_static("null"));
        let amp_header = HeaderName::from_static("amp-access-control-allow-source-origin");

        let mut headers = HeaderMap::with_capacity(6);
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        headers.insert(
            ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
        headers.insert(
            ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static(AMP_SOURCE_ORIGIN_HEADER),
        );
        headers.insert(amp_header, origin);
        headers.insert(CACHE_CONTROL, HeaderValue::from_static(NO_CACHE));

        let body = serde_json::to_vec(&QueuedBody { error: message })
            .map(Bytes::from)
            .unwrap_or_else(|_| Bytes::from_static(b"{\"error\":\"\"}"));

        Self { headers, body }
    }

    #[must_use]
    pub fn respond(&self) -> Response {
        Response {
            status: StatusCode::OK,
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use url::Url;

    fn responder(message: &str) -> FallbackResponder {
        let origin = Url::parse("https://blog.example/").unwrap().origin();
        FallbackResponder::new(&origin, message)
    }

    #[test]
    fn body_has_a_single_error_key() {
        let resp = responder("queued \"for later\"").respond();
        let body: Value = resp.json().unwrap();
        assert_eq!(body, json!({ "error": "queued \"for later\"" }));
        assert_eq!(resp.status, StatusCode::OK);
    }

    #[test]
    fn headers_grant_credentialed_access_to_site_origin() {
        let resp = responder("queued").respond();
        let h = |name: &str| resp.headers.get(name).and_then(|v| v.to_str().ok());

        assert_eq!(h("access-control-allow-origin"), Some("https://blog.example"));
        assert_eq!(h("access-control-allow-credentials"), Some("true"));
        assert_eq!(h("content-type"), Some("application/json; charset=UTF-8"));
        assert_eq!(
            h("access-control-expose-headers"),
            Some("AMP-Access-Control-Allow-Source-Origin")
        );
        assert_eq!(
            h("amp-access-control-allow-source-origin"),
            Some("https://blog.example")
        );
        assert_eq!(h("cache-control"), Some("no-cache, must-revalidate, max-age=0"));
    }
}
