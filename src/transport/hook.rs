use crate::{
    Error, RequestHook, RequestHookContext,
    request::{Request, Response},
    transport::AsyncTransport,
};
use async_trait::async_trait;

/// Async transport wrapper that executes a request hook before sending.
///
/// A hook error aborts the send and counts as a failed attempt.
#[derive(Clone)]
pub struct HookAsync<T> {
    inner: T,
    hook: RequestHook,
}

impl<T> HookAsync<T> {
    pub fn new(inner: T, hook: RequestHook) -> Self {
        Self { inner, hook }
    }
}

#[async_trait]
impl<T: AsyncTransport> AsyncTransport for HookAsync<T> {
    async fn send(&self, mut req: Request) -> Result<Response, Error> {
        (self.hook)(RequestHookContext {
            method: &req.method,
            url: &req.url,
            headers: &mut req.headers,
            mode: req.mode,
            credentials: req.credentials,
        })?;

        self.inner.send(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Credentials;
    use bytes::Bytes;
    use http::{HeaderMap, HeaderValue, StatusCode};
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };
    use url::Url;

    #[derive(Default)]
    struct Capture {
        headers: Mutex<Option<HeaderMap>>,
        sends: AtomicUsize,
    }

    #[async_trait]
    impl AsyncTransport for Capture {
        async fn send(&self, req: Request) -> Result<Response, Error> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            *self.headers.lock().unwrap() = Some(req.headers);
            Ok(Response {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: Bytes::new(),
            })
        }
    }

    fn comment_post() -> Request {
        Request::post(Url::parse("https://blog.example/wp-comments-post.php").unwrap())
            .credentials(Credentials::Include)
    }

    #[tokio::test]
    async fn hook_can_refresh_headers_before_send() {
        let inner = Arc::new(Capture::default());
        let transport = HookAsync::new(
            inner.clone(),
            Arc::new(|ctx: RequestHookContext<'_>| {
                assert_eq!(ctx.credentials, Credentials::Include);
                ctx.headers
                    .insert("x-wp-nonce", HeaderValue::from_static("n1"));
                Ok(())
            }),
        );

        transport.send(comment_post()).await.unwrap();
        let headers = inner.headers.lock().unwrap().take().unwrap();
        assert_eq!(headers.get("x-wp-nonce").unwrap(), "n1");
    }

    #[tokio::test]
    async fn hook_error_aborts_the_send() {
        let inner = Arc::new(Capture::default());
        let transport = HookAsync::new(
            inner.clone(),
            Arc::new(|_: RequestHookContext<'_>| -> Result<(), Error> {
                Err(Error::policy("nonce unavailable"))
            }),
        );

        let err = transport.send(comment_post()).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Policy);
        assert_eq!(inner.sends.load(Ordering::SeqCst), 0);
    }
}
