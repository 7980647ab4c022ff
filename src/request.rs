//! Request/response model shared by the router, the interceptor and the queue.
//!
//! A [`Request`] owns a single-use [`Body`]: reading it marks it used, after
//! which it can neither be read nor cloned again. [`InterceptedRequest`] is the
//! immutable snapshot that gets queued, with its body captured as a blob.

use crate::{Error, Result};
use bytes::Bytes;
use http::{
    HeaderMap, HeaderValue, Method, StatusCode,
    header::{AUTHORIZATION, COOKIE, HeaderName},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{borrow::Cow, time::Duration};
use url::{Origin, Url};

/// Which origins a request may be sent to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    SameOrigin,
    NoCors,
    #[default]
    Cors,
    Navigate,
}

/// Whether cookies and authorization travel with the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Credentials {
    Omit,
    #[default]
    SameOrigin,
    Include,
}

/// How a `3xx` answer is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RedirectPolicy {
    #[default]
    Follow,
    Error,
    /// Hand the redirect response back as-is.
    Manual,
}

#[derive(Debug, Default)]
enum BodyState {
    #[default]
    Empty,
    Unread(Bytes),
    Used,
}

/// Single-use request body.
#[derive(Debug, Default)]
pub struct Body {
    state: BodyState,
}

impl Body {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_used(&self) -> bool {
        matches!(self.state, BodyState::Used)
    }

    /// Duplicate an unread body without consuming it.
    pub fn try_clone(&self) -> Result<Self> {
        let state = match &self.state {
            BodyState::Empty => BodyState::Empty,
            BodyState::Unread(bytes) => BodyState::Unread(bytes.clone()),
            BodyState::Used => return Err(Error::BodyUsed),
        };
        Ok(Self { state })
    }

    /// Drain the body. An empty body stays readable.
    pub fn read(&mut self) -> Result<Bytes> {
        match std::mem::replace(&mut self.state, BodyState::Used) {
            BodyState::Empty => {
                self.state = BodyState::Empty;
                Ok(Bytes::new())
            }
            BodyState::Unread(bytes) => Ok(bytes),
            BodyState::Used => Err(Error::BodyUsed),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self {
            state: BodyState::Unread(bytes),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Bytes::from(bytes).into()
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Bytes::from(text).into()
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Bytes::from_static(text.as_bytes()).into()
    }
}

/// An outgoing request as issued by the page.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub mode: RequestMode,
    pub credentials: Credentials,
    pub referrer: Option<Url>,
    pub redirect: RedirectPolicy,
    pub timeout_override: Option<Duration>,
    body: Body,
}

impl Request {
    #[must_use]
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            mode: RequestMode::default(),
            credentials: Credentials::default(),
            referrer: None,
            redirect: RedirectPolicy::default(),
            timeout_override: None,
            body: Body::empty(),
        }
    }

    #[must_use]
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    #[must_use]
    pub fn post(url: Url) -> Self {
        Self::new(Method::POST, url)
    }

    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    #[must_use]
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    #[must_use]
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    #[must_use]
    pub fn referrer(mut self, referrer: Url) -> Self {
        self.referrer = Some(referrer);
        self
    }

    #[must_use]
    pub fn redirect(mut self, redirect: RedirectPolicy) -> Self {
        self.redirect = redirect;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_override = Some(timeout);
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn body_used(&self) -> bool {
        self.body.is_used()
    }

    /// Independent copy with its own unread body. Fails once the body was read.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            mode: self.mode,
            credentials: self.credentials,
            referrer: self.referrer.clone(),
            redirect: self.redirect,
            timeout_override: self.timeout_override,
            body: self.body.try_clone()?,
        })
    }

    pub fn read_body(&mut self) -> Result<Bytes> {
        self.body.read()
    }

    /// Apply `mode` and `credentials` relative to the page's origin.
    pub(crate) fn enforce_policy(&mut self, client_origin: &Origin) -> Result<()> {
        let same_origin = self.url.origin() == *client_origin;
        if self.mode == RequestMode::SameOrigin && !same_origin {
            return Err(Error::policy(format!(
                "same-origin request to foreign origin {}",
                self.url.origin().ascii_serialization()
            )));
        }

        let strip = match self.credentials {
            Credentials::Omit => true,
            Credentials::SameOrigin => !same_origin,
            Credentials::Include => false,
        };
        if strip {
            self.headers.remove(COOKIE);
            self.headers.remove(AUTHORIZATION);
        }
        Ok(())
    }
}

/// Snapshot of a failed submission, as stored in the retry queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptedRequest {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub mode: RequestMode,
    pub credentials: Credentials,
    pub referrer: Option<Url>,
    pub redirect: RedirectPolicy,
    pub body: Bytes,
}

impl InterceptedRequest {
    /// Capture `request`, which must still hold an unread body.
    ///
    /// Mode is pinned to same-origin and redirects to manual so a replay can
    /// neither leave the site nor silently change target.
    pub fn capture(mut request: Request) -> Result<Self> {
        let body = request.read_body()?;
        Ok(Self {
            url: request.url,
            method: request.method,
            headers: request.headers,
            mode: RequestMode::SameOrigin,
            credentials: request.credentials,
            referrer: request.referrer,
            redirect: RedirectPolicy::Manual,
            body,
        })
    }

    /// Fresh, unread request for a replay attempt.
    #[must_use]
    pub fn to_request(&self) -> Request {
        Request {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            mode: self.mode,
            credentials: self.credentials,
            referrer: self.referrer.clone(),
            redirect: self.redirect,
            timeout_override: None,
            body: self.body.clone().into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    #[must_use]
    pub fn text_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn json<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment_post() -> Request {
        Request::post(
            Url::parse("https://blog.example/wp-comments-post.php?_wp_amp_action_xhr_converted=1")
                .unwrap(),
        )
        .header(COOKIE, HeaderValue::from_static("wordpress_logged_in=abc"))
        .credentials(Credentials::Include)
        .referrer(Url::parse("https://blog.example/hello-world/").unwrap())
        .body("comment=hi&comment_post_ID=1")
    }

    #[test]
    fn clone_before_read_leaves_original_readable() {
        let mut original = comment_post();
        let mut copy = original.try_clone().unwrap();
        assert!(!original.body_used());

        assert_eq!(&original.read_body().unwrap()[..], b"comment=hi&comment_post_ID=1");
        assert_eq!(&copy.read_body().unwrap()[..], b"comment=hi&comment_post_ID=1");
    }

    #[test]
    fn read_body_marks_it_used() {
        let mut req = comment_post();
        req.read_body().unwrap();
        assert!(req.body_used());
        assert!(matches!(req.read_body(), Err(Error::BodyUsed)));
        assert!(matches!(req.try_clone(), Err(Error::BodyUsed)));
    }

    #[test]
    fn empty_body_is_never_used_up() {
        let mut req = Request::get(Url::parse("https://blog.example/").unwrap());
        assert!(req.read_body().unwrap().is_empty());
        assert!(!req.body_used());
        assert!(req.try_clone().is_ok());
    }

    #[test]
    fn capture_pins_mode_and_redirect() {
        let req = comment_post().mode(RequestMode::Cors);
        let captured = InterceptedRequest::capture(req).unwrap();
        assert_eq!(captured.mode, RequestMode::SameOrigin);
        assert_eq!(captured.redirect, RedirectPolicy::Manual);
        assert_eq!(captured.credentials, Credentials::Include);
        assert_eq!(&captured.body[..], b"comment=hi&comment_post_ID=1");
        assert_eq!(
            captured.referrer.as_ref().map(Url::as_str),
            Some("https://blog.example/hello-world/")
        );
    }

    #[test]
    fn same_origin_mode_refuses_foreign_origin() {
        let site = Url::parse("https://blog.example/").unwrap().origin();
        let mut req = Request::post(Url::parse("https://evil.example/wp-comments-post.php").unwrap())
            .mode(RequestMode::SameOrigin);
        let err = req.enforce_policy(&site).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Policy);
    }

    #[test]
    fn omit_credentials_strips_cookie() {
        let site = Url::parse("https://blog.example/").unwrap().origin();
        let mut req = comment_post().credentials(Credentials::Omit);
        req.enforce_policy(&site).unwrap();
        assert!(req.headers.get(COOKIE).is_none());

        let mut req = comment_post();
        req.enforce_policy(&site).unwrap();
        assert!(req.headers.get(COOKIE).is_some());
    }
}
