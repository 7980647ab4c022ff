//! Request routing: which handler, if any, takes ownership of a request.

use crate::{
    Error,
    request::{Request, Response},
    transport::DynAsyncTransport,
};
use async_trait::async_trait;
use http::Method;
use regex::Regex;
use std::sync::Arc;
use url::{Origin, Url};

#[cfg(feature = "tracing")]
use crate::util::url::sanitize_url_for_logs;
#[cfg(feature = "tracing")]
use tracing::field;

/// Comment form posts converted to XHR by the AMP plugin.
pub const COMMENT_SUBMISSION_PATTERN: &str =
    r"/wp-comments-post\.php\?.*_wp_amp_action_xhr_converted.*$";

/// Regular expression tested against the full request URL.
///
/// For same-origin URLs the match may start anywhere. A cross-origin URL only
/// matches when the match starts at the first character, so a pattern written
/// for the site's own paths never captures third-party traffic.
#[derive(Debug, Clone)]
pub struct RoutePattern {
    regex: Regex,
}

impl RoutePattern {
    pub fn new(pattern: &str) -> Result<Self, Error> {
        let regex = Regex::new(pattern).map_err(|err| Error::InvalidConfig {
            message: "invalid route pattern".into(),
            source: Some(Box::new(err)),
        })?;
        Ok(Self { regex })
    }

    #[must_use]
    pub fn comment_submission() -> Self {
        Self::new(COMMENT_SUBMISSION_PATTERN).expect("built-in comment route pattern compiles")
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    #[must_use]
    pub fn matches(&self, url: &Url, site_origin: &Origin) -> bool {
        let Some(found) = self.regex.find(url.as_str()) else {
            return false;
        };
        found.start() == 0 || url.origin() == *site_origin
    }
}

/// Handler owning every request its route matched.
#[async_trait]
pub trait RouteHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Result<Response, Error>;
}

struct Route {
    pattern: RoutePattern,
    method: Method,
    handler: Arc<dyn RouteHandler>,
}

/// Ordered route table. First match wins; unmatched requests go straight to
/// the network.
pub struct Router {
    site_origin: Origin,
    routes: Vec<Route>,
    network: DynAsyncTransport,
}

impl Router {
    #[must_use]
    pub fn new(site_origin: Origin, network: DynAsyncTransport) -> Self {
        Self {
            site_origin,
            routes: Vec::new(),
            network,
        }
    }

    /// `method` is compared case-sensitively.
    pub fn register(
        &mut self,
        pattern: RoutePattern,
        method: Method,
        handler: Arc<dyn RouteHandler>,
    ) -> &mut Self {
        self.routes.push(Route {
            pattern,
            method,
            handler,
        });
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn find(&self, request: &Request) -> Option<(usize, &Route)> {
        self.routes.iter().enumerate().find(|(_, route)| {
            route.method == request.method && route.pattern.matches(&request.url, &self.site_origin)
        })
    }

    /// Route `request` to the first matching handler, or pass it through.
    pub async fn fetch(&self, request: Request) -> Result<Response, Error> {
        #[cfg(feature = "tracing")]
        let result = {
            use tracing::Instrument;

            let span = tracing::debug_span!(
                "offline_comments.fetch",
                http.method = %request.method,
                http.url = %sanitize_url_for_logs(&request.url),
                route = field::Empty,
                http.status = field::Empty,
            );
            let result = self.route(request).instrument(span.clone()).await;
            if let Ok(resp) = &result {
                span.record("http.status", resp.status.as_u16() as i64);
            }
            result
        };
        #[cfg(not(feature = "tracing"))]
        let result = self.route(request).await;

        result
    }

    async fn route(&self, request: Request) -> Result<Response, Error> {
        match self.find(&request) {
            Some((_index, route)) => {
                #[cfg(feature = "tracing")]
                tracing::Span::current().record("route", _index as i64);
                route.handler.handle(request).await
            }
            None => self.network.send(request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site() -> Origin {
        Url::parse("https://blog.example/").unwrap().origin()
    }

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    #[test]
    fn comment_pattern_requires_the_xhr_marker() {
        let pattern = RoutePattern::comment_submission();
        assert!(pattern.matches(
            &url("https://blog.example/wp-comments-post.php?_wp_amp_action_xhr_converted=1"),
            &site()
        ));
        assert!(pattern.matches(
            &url("https://blog.example/blog/wp-comments-post.php?a=b&_wp_amp_action_xhr_converted=1"),
            &site()
        ));
        assert!(!pattern.matches(&url("https://blog.example/wp-comments-post.php"), &site()));
        assert!(!pattern.matches(
            &url("https://blog.example/wp-login.php?_wp_amp_action_xhr_converted=1"),
            &site()
        ));
    }

    #[test]
    fn cross_origin_urls_only_match_from_the_start() {
        let pattern = RoutePattern::comment_submission();
        assert!(!pattern.matches(
            &url("https://other.example/wp-comments-post.php?_wp_amp_action_xhr_converted=1"),
            &site()
        ));

        let anchored = RoutePattern::new(r"^https://cdn\.example/").unwrap();
        assert!(anchored.matches(&url("https://cdn.example/a.js"), &site()));
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let err = RoutePattern::new("(").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidConfig);
    }
}
