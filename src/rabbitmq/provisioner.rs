//! Declares the exchange/queue/binding triple for each configured exchange.
//!
//! Test suites re-run against a long-lived broker, so a triple may already
//! exist from an earlier run, possibly with different attributes. Provisioning
//! one triple runs strictly in order:
//!
//! 1. purge the queue (a missing queue is fine),
//! 2. declare queue, exchange and binding,
//! 3. on a precondition conflict only, delete the exchange and the queue and
//!    declare everything once more. A failure on that retry is final.
//!
//! Afterwards the queue exists and is empty, the exchange exists with the
//! configured type and the queue is bound to it with the empty routing key.

use lapin::options::{ExchangeDeclareOptions, QueueDeclareOptions};
use tracing::{debug, info, instrument, warn};

use super::connection::ConnectionHandle;
use super::errors::Result;
use crate::config::ExchangeConfig;

pub const DEFAULT_ROUTING_KEY: &str = "";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// Declarations matched (or created) the topology directly.
    Declared,
    /// Stale topology conflicted and was deleted and recreated.
    Recreated,
}

pub fn queue_options() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        exclusive: false,
        auto_delete: false,
        ..QueueDeclareOptions::default()
    }
}

pub fn exchange_options() -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable: true,
        auto_delete: false,
        ..ExchangeDeclareOptions::default()
    }
}

#[instrument(
    skip(handle, config),
    fields(connection = %handle.name(), queue = %config.queue, kind = %config.exchange_type)
)]
pub async fn provision_exchange(
    handle: &ConnectionHandle,
    exchange: &str,
    config: &ExchangeConfig,
) -> Result<ProvisionOutcome> {
    purge_if_present(handle, &config.queue).await?;

    let outcome = match create_bindings(handle, exchange, config).await {
        Ok(()) => ProvisionOutcome::Declared,
        Err(e) if e.is_conflict() => {
            warn!("Existing topology conflicts, recreating: {}", e);
            delete_if_present(handle.delete_exchange(exchange).await, "exchange", exchange)?;
            delete_if_present(handle.delete_queue(&config.queue).await, "queue", &config.queue)?;
            create_bindings(handle, exchange, config).await?;
            ProvisionOutcome::Recreated
        }
        Err(e) => return Err(e),
    };

    info!(?outcome, "Exchange provisioned");
    Ok(outcome)
}

async fn purge_if_present(handle: &ConnectionHandle, queue: &str) -> Result<()> {
    match handle.purge_queue(queue).await {
        Ok(purged) => {
            debug!(queue, purged, "Purged queue");
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            debug!(queue, "Queue absent, nothing to purge");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Only half of a stale pair may exist, so a missing entity is tolerated here.
fn delete_if_present(outcome: Result<()>, entity: &str, name: &str) -> Result<()> {
    match outcome {
        Err(e) if e.is_not_found() => {
            debug!(entity, name, "Nothing to delete");
            Ok(())
        }
        other => other,
    }
}

async fn create_bindings(handle: &ConnectionHandle, exchange: &str, config: &ExchangeConfig) -> Result<()> {
    handle.declare_queue(&config.queue, queue_options()).await?;
    handle
        .declare_exchange(exchange, config.exchange_type, exchange_options())
        .await?;
    handle.bind_queue(&config.queue, exchange, DEFAULT_ROUTING_KEY).await
}
