use crate::{
    error::{Error, TransportErrorKind},
    request::{RedirectPolicy, Request, Response},
};
use async_trait::async_trait;
use bytes::BytesMut;
use http::{Method, header::REFERER};
use reqwest::{Client, redirect};
use std::{sync::Arc, time::Duration};
use url::Url;

#[cfg(feature = "rustls")]
fn ensure_rustls_provider() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

#[cfg(not(feature = "rustls"))]
fn ensure_rustls_provider() {}

/// Trait implemented by any async HTTP layer.
///
/// `Ok` means the server answered, whatever the status; `Err` means no
/// response was obtained.
#[async_trait]
pub trait AsyncTransport: Send + Sync + 'static {
    async fn send(&self, req: Request) -> Result<Response, Error>;
}

pub type DynAsyncTransport = Arc<dyn AsyncTransport>;

#[async_trait]
impl<T: AsyncTransport + ?Sized> AsyncTransport for Arc<T> {
    async fn send(&self, req: Request) -> Result<Response, Error> {
        (**self).send(req).await
    }
}

/// Default async transport built on `reqwest`.
///
/// Holds two clients because reqwest fixes the redirect policy per client.
#[derive(Clone)]
pub struct ReqwestAsync {
    follow: Client,
    manual: Client,
    timeout: Duration,
}

impl ReqwestAsync {
    /// Construct a new transport.
    ///
    /// * `insecure` – accept invalid TLS certificates.
    /// * `ua` – User-Agent header.
    /// * `timeout` – per-request timeout.
    /// * `connect_timeout` – connection establishment timeout.
    /// * `no_proxy` – ignore system proxy environment variables.
    pub fn try_new(
        insecure: bool,
        ua: &str,
        timeout: Duration,
        connect_timeout: Duration,
        no_proxy: bool,
    ) -> Result<Self, Error> {
        ensure_rustls_provider();

        let build = |policy: redirect::Policy| {
            let mut builder = Client::builder()
                .danger_accept_invalid_certs(insecure)
                .user_agent(ua)
                .redirect(policy)
                .referer(false)
                .connect_timeout(connect_timeout)
                .timeout(timeout);

            if no_proxy {
                builder = builder.no_proxy();
            }

            builder.build().map_err(|err| Error::InvalidConfig {
                message: "failed to build async HTTP client".into(),
                source: Some(Box::new(err)),
            })
        };

        Ok(Self {
            follow: build(redirect::Policy::default())?,
            manual: build(redirect::Policy::none())?,
            timeout,
        })
    }
}

fn transport_error(method: &Method, url: &Url, err: reqwest::Error) -> Error {
    let kind = if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if err.is_connect() {
        TransportErrorKind::Connect
    } else if err.is_redirect() {
        TransportErrorKind::Redirect
    } else {
        TransportErrorKind::Other
    };
    Error::Transport {
        method: method.clone(),
        path: url.path().to_string().into_boxed_str(),
        kind,
        source: Box::new(err),
    }
}

#[async_trait]
impl AsyncTransport for ReqwestAsync {
    async fn send(&self, mut req: Request) -> Result<Response, Error> {
        let body = req.read_body()?;
        let Request {
            method,
            url,
            mut headers,
            referrer,
            redirect,
            timeout_override,
            ..
        } = req;

        if let Some(referrer) = referrer {
            if !headers.contains_key(REFERER) {
                if let Ok(value) = http::HeaderValue::from_str(referrer.as_str()) {
                    headers.insert(REFERER, value);
                }
            }
        }

        let client = match redirect {
            RedirectPolicy::Follow => &self.follow,
            RedirectPolicy::Error | RedirectPolicy::Manual => &self.manual,
        };

        let mut builder = client
            .request(method.clone(), url.clone())
            .timeout(timeout_override.unwrap_or(self.timeout))
            .headers(headers);
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let mut resp = builder
            .send()
            .await
            .map_err(|e| transport_error(&method, &url, e))?;

        let status = resp.status();
        if redirect == RedirectPolicy::Error && status.is_redirection() {
            return Err(Error::Transport {
                method,
                path: url.path().to_string().into_boxed_str(),
                kind: TransportErrorKind::Redirect,
                source: format!("unexpected redirect ({status})").into(),
            });
        }

        // The server has answered; a truncated body is still a response.
        let headers = resp.headers().clone();
        let mut body = BytesMut::new();
        loop {
            match resp.chunk().await {
                Ok(Some(chunk)) => body.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        http.status = status.as_u16(),
                        received = body.len(),
                        error = %_err,
                        "response body cut short"
                    );
                    break;
                }
            }
        }
        Ok(Response {
            status,
            headers,
            body: body.freeze(),
        })
    }
}
