//! Network layer: the `AsyncTransport` seam, its reqwest implementation and
//! the request-hook wrapper.

pub mod async_transport;
pub mod hook;
#[cfg(feature = "metrics")]
pub(crate) mod metrics;

pub use async_transport::{AsyncTransport, DynAsyncTransport, ReqwestAsync};
pub use hook::HookAsync;
