use crate::{
    Error,
    request::{Credentials, RequestMode},
};
use http::{HeaderMap, Method};
use std::sync::Arc;
use url::Url;

/// Request hook context passed to `OfflineCommentsBuilder::request_hook`.
///
/// Runs for every network send: live attempts, replays and pass-through
/// requests. The hook can inspect request parts and mutate headers (for
/// example to refresh a nonce before a replay).
pub struct RequestHookContext<'a> {
    pub method: &'a Method,
    pub url: &'a Url,
    pub headers: &'a mut HeaderMap,
    pub mode: RequestMode,
    pub credentials: Credentials,
}

pub type RequestHook =
    Arc<dyn for<'a> Fn(RequestHookContext<'a>) -> Result<(), Error> + Send + Sync + 'static>;
