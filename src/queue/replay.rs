//! Background replay of queued submissions.
//!
//! * Entries are replayed oldest first.
//! * Any server answer counts as delivered and removes the entry, including
//!   one cut short after the status line or refused locally as a redirect.
//! * A network failure keeps the entry and ends the pass, so no later entry
//!   overtakes it. There is no backoff: the next opportunity simply retries.
//! * One pass at a time; a trigger arriving mid-pass queues one more pass.

use super::{EntryId, SharedQueue};
use crate::{Error, transport::DynAsyncTransport};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime},
};
use tokio::{
    sync::{Mutex, Notify, watch},
    task::JoinHandle,
    time::{Instant, Interval, MissedTickBehavior},
};
use url::Origin;

#[cfg(feature = "tracing")]
use crate::util::url::sanitize_url_for_logs;

/// Default retention of queued entries: 7 days.
pub const DEFAULT_MAX_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub delivered: usize,
    /// Entries evicted for exceeding the retention window.
    pub expired: usize,
    /// Entries whose request mode forbids delivery; they can never succeed.
    pub dropped: usize,
    /// Entry whose replay failed and ended the pass.
    pub failed: Option<EntryId>,
    pub remaining: usize,
    /// Another pass was running; this trigger was folded into it.
    pub coalesced: bool,
}

/// Options of the background driver started by [`Replayer::spawn`].
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Run a pass as soon as the driver starts.
    pub initial_pass: bool,
    /// Periodic wake-up, in addition to explicit notifications.
    pub period: Option<Duration>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            initial_pass: true,
            period: None,
        }
    }
}

#[derive(Clone)]
pub struct Replayer {
    inner: Arc<Inner>,
}

struct Inner {
    queue: SharedQueue,
    transport: DynAsyncTransport,
    site_origin: Origin,
    max_retention: Option<Duration>,
    pass: Mutex<()>,
    rerun: AtomicBool,
}

impl Replayer {
    #[must_use]
    pub fn new(
        queue: SharedQueue,
        transport: DynAsyncTransport,
        site_origin: Origin,
        max_retention: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue,
                transport,
                site_origin,
                max_retention,
                pass: Mutex::new(()),
                rerun: AtomicBool::new(false),
            }),
        }
    }

    #[must_use]
    pub fn queue(&self) -> &SharedQueue {
        &self.inner.queue
    }

    /// Drain the queue once, as a host sync event would.
    pub async fn replay(&self) -> Result<ReplayReport, Error> {
        #[cfg(feature = "tracing")]
        let result = {
            use tracing::Instrument;

            let span = tracing::info_span!(
                "offline_comments.replay",
                queue = %self.inner.queue.name(),
            );
            self.replay_coalesced().instrument(span).await
        };
        #[cfg(not(feature = "tracing"))]
        let result = self.replay_coalesced().await;

        result
    }

    async fn replay_coalesced(&self) -> Result<ReplayReport, Error> {
        let mut report = ReplayReport::default();
        let mut ran = false;
        loop {
            let Ok(guard) = self.inner.pass.try_lock() else {
                self.inner.rerun.store(true, Ordering::SeqCst);
                report.coalesced = !ran;
                break;
            };
            ran = true;
            self.inner.rerun.store(false, Ordering::SeqCst);
            let result = self.pass(&mut report).await;
            drop(guard);
            result?;

            if report.failed.is_some() || !self.inner.rerun.load(Ordering::SeqCst) {
                break;
            }
        }

        if ran {
            report.remaining = self.inner.queue.len().await?;

            #[cfg(feature = "metrics")]
            {
                use crate::transport::metrics::record_replay;
                let queue = self.inner.queue.name();
                record_replay(queue, "delivered", report.delivered);
                record_replay(queue, "expired", report.expired);
                record_replay(queue, "dropped", report.dropped);
                record_replay(queue, "failed", usize::from(report.failed.is_some()));
            }
            #[cfg(feature = "tracing")]
            tracing::info!(
                delivered = report.delivered,
                expired = report.expired,
                dropped = report.dropped,
                remaining = report.remaining,
                failed = report.failed.is_some(),
                "replay pass finished"
            );
        }
        Ok(report)
    }

    async fn pass(&self, report: &mut ReplayReport) -> Result<(), Error> {
        let queue = &self.inner.queue;
        let now = SystemTime::now();

        for entry in queue.entries().await? {
            if let Some(max) = self.inner.max_retention
                && entry.age(now) > max
            {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    entry = %entry.id,
                    url = %sanitize_url_for_logs(&entry.request.url),
                    "evicting queued submission past retention"
                );
                queue.remove(entry.id).await?;
                report.expired += 1;
                continue;
            }

            let mut request = entry.request.to_request();
            if let Err(_err) = request.enforce_policy(&self.inner.site_origin) {
                #[cfg(feature = "tracing")]
                tracing::warn!(entry = %entry.id, error = %_err, "dropping undeliverable submission");
                queue.remove(entry.id).await?;
                report.dropped += 1;
                continue;
            }

            match self.inner.transport.send(request).await {
                Ok(_resp) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(
                        entry = %entry.id,
                        http.status = _resp.status.as_u16(),
                        "queued submission delivered"
                    );
                    queue.remove(entry.id).await?;
                    report.delivered += 1;
                }
                Err(err) if err.response_received() => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(entry = %entry.id, error = %err, "queued submission answered");
                    queue.remove(entry.id).await?;
                    report.delivered += 1;
                }
                // Network failure, or refused before sending (request hook).
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(entry = %entry.id, error = %_err, "replay failed, keeping entry");
                    report.failed = Some(entry.id);
                    break;
                }
            }
        }
        Ok(())
    }

    async fn replay_logged(&self) {
        if let Err(_err) = self.replay().await {
            #[cfg(feature = "tracing")]
            tracing::error!(queue = %self.inner.queue.name(), error = %_err, "replay pass aborted");
        }
    }

    /// Start the background driver standing in for the host's sync events.
    ///
    /// Dropping the returned handle stops the driver after the current pass.
    #[must_use]
    pub fn spawn(&self, options: SyncOptions) -> SyncHandle {
        let notify = Arc::new(Notify::new());
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let replayer = self.clone();
        let wake = notify.clone();

        let task = tokio::spawn(async move {
            if options.initial_pass {
                replayer.replay_logged().await;
            }

            let mut ticker = options.period.filter(|p| !p.is_zero()).map(|period| {
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                interval
            });

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    () = wake.notified() => {}
                    () = tick(&mut ticker) => {}
                }
                replayer.replay_logged().await;
            }
        });

        SyncHandle {
            notify,
            shutdown,
            task,
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Control handle of a running background driver.
pub struct SyncHandle {
    notify: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Signal that connectivity is back. Signals sent during a pass are kept.
    pub fn notify(&self) {
        self.notify.notify_one();
    }

    /// Stop the driver and wait for the current pass to finish.
    pub async fn shutdown(self) -> Result<(), Error> {
        let _ = self.shutdown.send(true);
        self.task.await.map_err(|source| Error::Task { source })
    }
}
