//! Assembles router, interceptor, queue and replayer from one builder.

use crate::{
    Error, RequestHookContext,
    interceptor::{CommentInterceptor, PersistFailure, PersistFailureHook},
    messages::MessageCatalog,
    queue::{
        DEFAULT_QUEUE_NAME, FileQueue, SharedQueue,
        replay::{DEFAULT_MAX_RETENTION, Replayer, SyncHandle, SyncOptions},
    },
    request::{Request, Response},
    responder::FallbackResponder,
    route::{RouteHandler, RoutePattern, Router},
    transport::{DynAsyncTransport, ReqwestAsync, hook::HookAsync},
    util::url::site_origin,
};
use http::Method;
use std::{path::PathBuf, sync::Arc, time::Duration};
use url::Origin;

const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

enum QueueBackend {
    Directory(PathBuf),
    Custom(SharedQueue),
}

struct ExtraRoute {
    pattern: RoutePattern,
    method: Method,
    handler: Arc<dyn RouteHandler>,
}

/// Configures and constructs [`OfflineComments`].
pub struct OfflineCommentsBuilder {
    site_origin: Origin,
    insecure: bool,
    user_agent: String,
    timeout: Duration,
    connect_timeout: Duration,
    no_proxy: bool,
    transport: Option<DynAsyncTransport>,
    request_hook: Option<crate::RequestHook>,
    queue: Option<QueueBackend>,
    queue_name: String,
    messages: MessageCatalog,
    locale: Option<String>,
    route_pattern: Option<String>,
    method: Method,
    max_retention: Option<Duration>,
    on_persist_failure: Option<PersistFailureHook>,
    routes: Vec<ExtraRoute>,
}

impl OfflineCommentsBuilder {
    fn try_new(site_url: impl AsRef<str>) -> Result<Self, Error> {
        Ok(Self {
            site_origin: site_origin(site_url.as_ref())?,
            insecure: false,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            no_proxy: false,
            transport: None,
            request_hook: None,
            queue: None,
            queue_name: DEFAULT_QUEUE_NAME.to_owned(),
            messages: MessageCatalog::default(),
            locale: None,
            route_pattern: None,
            method: Method::POST,
            max_retention: Some(DEFAULT_MAX_RETENTION),
            on_persist_failure: None,
            routes: Vec::new(),
        })
    }

    /// Ignore system proxy environment variables.
    pub fn no_system_proxy(mut self) -> Self {
        self.no_proxy = true;
        self
    }

    /// Accept invalid TLS certificates (**dangerous**).
    pub fn danger_accept_invalid_certs(mut self, yes: bool) -> Self {
        self.insecure = yes;
        self
    }

    /// Override the default `User-Agent` header.
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    /// Adjust the per-request timeout. A live attempt that times out is queued.
    pub fn timeout(mut self, value: Duration) -> Self {
        self.timeout = value;
        self
    }

    /// Adjust the connection establishment timeout.
    pub fn connect_timeout(mut self, value: Duration) -> Self {
        self.connect_timeout = value;
        self
    }

    /// Replace the reqwest transport (the options above are then ignored).
    pub fn transport(mut self, transport: DynAsyncTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Add a hook invoked before every network send, live or replayed.
    pub fn request_hook<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(RequestHookContext<'a>) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.request_hook = Some(Arc::new(hook));
        self
    }

    /// Persist the queue under `dir` (one sub-directory per queue name).
    ///
    /// A queue backend is required: either this or [`Self::queue`].
    pub fn storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.queue = Some(QueueBackend::Directory(dir.into()));
        self
    }

    /// Use a caller-provided queue backend. It must be durable before its
    /// `enqueue` returns; [`crate::MemoryQueue`] is only fit for tests.
    pub fn queue(mut self, queue: SharedQueue) -> Self {
        self.queue = Some(QueueBackend::Custom(queue));
        self
    }

    pub fn queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    pub fn messages(mut self, messages: MessageCatalog) -> Self {
        self.messages = messages;
        self
    }

    /// Site locale used to pick the queued-submission message (`de_DE`).
    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    /// Override the comment route regex.
    pub fn route_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.route_pattern = Some(pattern.into());
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Evict queued entries older than this at replay time; `None` keeps them forever.
    pub fn max_retention(mut self, value: Option<Duration>) -> Self {
        self.max_retention = value;
        self
    }

    /// Called when a submission acknowledged as queued could not be stored.
    pub fn on_persist_failure<F>(mut self, hook: F) -> Self
    where
        F: for<'a> Fn(PersistFailure<'a>) + Send + Sync + 'static,
    {
        self.on_persist_failure = Some(Arc::new(hook));
        self
    }

    /// Register another route, evaluated after the comment route.
    pub fn route(
        mut self,
        pattern: RoutePattern,
        method: Method,
        handler: Arc<dyn RouteHandler>,
    ) -> Self {
        self.routes.push(ExtraRoute {
            pattern,
            method,
            handler,
        });
        self
    }

    /// Finalise configuration, open the queue and wire everything together.
    ///
    /// Fails with [`Error::InvalidConfig`] when no queue backend was chosen.
    pub async fn build(self) -> Result<OfflineComments, Error> {
        let backend = self.queue.ok_or_else(|| {
            Error::invalid_config("a queue backend is required: set storage_dir or queue")
        })?;

        let mut transport: DynAsyncTransport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestAsync::try_new(
                self.insecure,
                &self.user_agent,
                self.timeout,
                self.connect_timeout,
                self.no_proxy,
            )?),
        };

        if let Some(hook) = self.request_hook {
            transport = Arc::new(HookAsync::new(transport, hook));
        }

        let queue: SharedQueue = match backend {
            QueueBackend::Directory(dir) => Arc::new(FileQueue::open(dir, self.queue_name).await?),
            QueueBackend::Custom(queue) => queue,
        };

        let pattern = match self.route_pattern.as_deref() {
            Some(raw) => RoutePattern::new(raw)?,
            None => RoutePattern::comment_submission(),
        };

        let message = self.messages.resolve(self.locale.as_deref());
        let responder = FallbackResponder::new(&self.site_origin, message);

        let mut interceptor = CommentInterceptor::new(
            self.site_origin.clone(),
            transport.clone(),
            queue.clone(),
            responder,
        )
        .pattern(pattern.clone())
        .method(self.method.clone());
        if let Some(hook) = self.on_persist_failure {
            interceptor = interceptor.on_persist_failure(hook);
        }

        let mut router = Router::new(self.site_origin.clone(), transport.clone());
        router.register(pattern, self.method, Arc::new(interceptor.clone()));
        for route in self.routes {
            router.register(route.pattern, route.method, route.handler);
        }

        let replayer = Replayer::new(queue, transport, self.site_origin, self.max_retention);

        Ok(OfflineComments {
            inner: Arc::new(Inner {
                router,
                interceptor,
                replayer,
            }),
        })
    }
}

/// Offline comment queue: route requests, queue failed submissions, replay them.
#[derive(Clone)]
pub struct OfflineComments {
    inner: Arc<Inner>,
}

struct Inner {
    router: Router,
    interceptor: CommentInterceptor,
    replayer: Replayer,
}

impl OfflineComments {
    pub fn builder(site_url: impl AsRef<str>) -> Result<OfflineCommentsBuilder, Error> {
        OfflineCommentsBuilder::try_new(site_url)
    }

    /// Send `request` through the route table.
    pub async fn fetch(&self, request: Request) -> Result<Response, Error> {
        self.inner.router.fetch(request).await
    }

    #[must_use]
    pub fn interceptor(&self) -> &CommentInterceptor {
        &self.inner.interceptor
    }

    #[must_use]
    pub fn replayer(&self) -> &Replayer {
        &self.inner.replayer
    }

    #[must_use]
    pub fn queue(&self) -> &SharedQueue {
        self.inner.replayer.queue()
    }

    /// Start background replay; see [`Replayer::spawn`].
    #[must_use]
    pub fn spawn_sync(&self, options: SyncOptions) -> SyncHandle {
        self.inner.replayer.spawn(options)
    }
}
