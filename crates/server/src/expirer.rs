//! Expiration garbage collector.
//!
//! A periodic task queries the metadata store for expired upload ids and
//! terminates each one by synthesizing an internal `DELETE /{id}` request
//! against the handler. A 404 means the files are already gone, in which
//! case only the row is tombstoned. Other failures are logged and the id
//! is retried on the next tick.

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use depot_metadata::MetadataStore;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower::ServiceExt;

/// Pause between terminated ids so a large backlog does not burst the
/// disk.
pub const DEFAULT_ID_PAUSE: Duration = Duration::from_secs(1);

/// Handle to the background GC task.
pub struct Expirer {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Expirer {
    /// Spawn the GC loop. `handler` is the internal termination router
    /// (see [`crate::routes::expirer_router`]); the sweep acts with
    /// system authority, so it carries no ownership middleware.
    pub fn spawn(
        metadata: Arc<dyn MetadataStore>,
        handler: Router,
        check_interval: Duration,
        id_pause: Duration,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so sweeps start
            // one interval after startup.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let now = OffsetDateTime::now_utc().unix_timestamp();
                        sweep(&metadata, &handler, now, id_pause).await;
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        Self { shutdown, handle }
    }

    /// Request a cooperative stop; the loop exits at the next boundary.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Stop and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.stop();
        let _ = self.handle.await;
    }
}

/// One GC pass over everything expired at `now`.
pub async fn sweep(
    metadata: &Arc<dyn MetadataStore>,
    handler: &Router,
    now: i64,
    id_pause: Duration,
) {
    tracing::debug!("filestore gc tick");
    crate::metrics::GC_SWEEPS.inc();

    let expired = match metadata.fetch_expired_ids(now).await {
        Ok(ids) => ids,
        Err(e) => {
            tracing::error!(error = %e, "failed to enumerate expired uploads");
            crate::metrics::GC_FAILURES.inc();
            return;
        }
    };

    for id in expired {
        let request = match Request::builder()
            .method(Method::DELETE)
            .uri(format!("/{id}"))
            .body(Body::empty())
        {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(%id, error = %e, "failed to build termination request");
                continue;
            }
        };

        let response = match handler.clone().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        };

        match response.status() {
            StatusCode::NOT_FOUND => {
                // The files are already gone; tombstone the row directly.
                if let Err(e) = metadata.terminate_upload(&id, 0).await {
                    tracing::error!(%id, error = %e, "failed to tombstone orphaned row");
                    crate::metrics::GC_FAILURES.inc();
                    continue;
                }
                crate::metrics::GC_UPLOADS_EXPIRED.inc();
                tracing::info!(%id, "reconciled expired upload with missing files");
            }
            StatusCode::NO_CONTENT => {
                crate::metrics::GC_UPLOADS_EXPIRED.inc();
                tracing::info!(%id, "terminated expired upload");
            }
            status => {
                tracing::error!(%id, %status, "failed to terminate expired upload");
                crate::metrics::GC_FAILURES.inc();
                continue;
            }
        }

        if !id_pause.is_zero() {
            tokio::time::sleep(id_pause).await;
        }
    }
}
