//! Periodic release of claims abandoned by crashed workers.

use std::{future::Future, time::Duration};

use strum::IntoEnumIterator;

use crate::{dispatch::MessageType, error::Error, service::Service};

const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Releases every claim older than `stale_timeout`, across all message types.
///
/// Returns the number of items released.
pub async fn sweep_once(service: &Service, stale_timeout: Duration) -> Result<u64, Error> {
    let mut released = 0;

    for message_type in MessageType::iter() {
        let messages = service
            .list_in_progress_messages(message_type, stale_timeout)
            .await?;

        for message_id in messages {
            let reset = service
                .reset_stale_claims(message_id, Some(stale_timeout))
                .await?;

            tracing::info!(%message_id, %message_type, reset, "Released stale claims");

            released += reset;
        }
    }

    Ok(released)
}

/// Sweeps every `interval` until `shutdown` resolves.
///
/// A failed sweep is logged and the next one runs on schedule.
pub async fn run(
    service: &Service,
    stale_timeout: Duration,
    interval: Duration,
    shutdown: impl Future<Output = ()>,
) {
    let mut ticker = tokio::time::interval(interval.max(MIN_INTERVAL));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutting down stale claim sweeper");
                return;
            }
            _ = ticker.tick() => {
                match sweep_once(service, stale_timeout).await {
                    Ok(0) => tracing::debug!("No stale claims found"),
                    Ok(released) => tracing::info!(released, "Stale claim sweep finished"),
                    Err(e) => tracing::error!("Stale claim sweep failed: {e}"),
                }
            }
        }
    }
}
