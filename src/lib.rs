//! Offline comment submissions for PWA-enabled WordPress sites.
//!
//! Comment posts that cannot reach the server are captured, stored in a
//! durable FIFO queue and replayed in the background once the network is
//! back. The commenter immediately gets a JSON acknowledgment instead of an
//! error.
//!
//! ```no_run
//! # async fn run() -> Result<(), offline_comments::Error> {
//! use offline_comments::{OfflineComments, SyncOptions};
//!
//! let service = OfflineComments::builder("https://blog.example/")?
//!     .storage_dir("/var/lib/offline-comments")
//!     .locale("de_DE")
//!     .build()
//!     .await?;
//! let sync = service.spawn_sync(SyncOptions::default());
//! // Route page traffic through `service.fetch(..)`, call `sync.notify()`
//! // whenever connectivity comes back.
//! # sync.shutdown().await
//! # }
//! ```

pub mod error;
pub mod interceptor;
pub mod messages;
pub mod queue;
pub mod request;
pub mod request_hook;
pub mod responder;
pub mod route;
pub mod service;
pub mod transport;

mod util;

pub use error::{Error, ErrorKind, Result, TransportErrorKind};
pub use interceptor::{CommentInterceptor, Outcome, PendingEnqueue, PersistFailure, PersistFailureHook};
pub use messages::{DEFAULT_QUEUED_MESSAGE, MessageCatalog};
pub use queue::{
    EntryId, FileQueue, MemoryQueue, QueueEntry, ReplayReport, Replayer, RetryQueue, SharedQueue,
    SyncHandle, SyncOptions,
};
pub use request::{
    Body, Credentials, InterceptedRequest, RedirectPolicy, Request, RequestMode, Response,
};
pub use request_hook::{RequestHook, RequestHookContext};
pub use responder::FallbackResponder;
pub use route::{RouteHandler, RoutePattern, Router};
pub use service::{OfflineComments, OfflineCommentsBuilder};
