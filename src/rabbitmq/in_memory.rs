//! In-memory broker for exercising fixtures without a running RabbitMQ.
//!
//! Implements both collaborators, [`ManagementApi`] and [`AmqpConnector`], over
//! shared state. Semantics follow AMQP 0-9-1 strictly rather than RabbitMQ's
//! relaxed ones:
//! - redeclaring an entity with different attributes is a precondition failure,
//! - every operation on a missing entity (deletes included) is not-found,
//! - a channel is closed by the broker after any error on it,
//! - publishing to a missing exchange succeeds for the caller and closes the
//!   channel, the way the broker's asynchronous `channel.close` surfaces it,
//! - connecting requires the vhost to exist and the user to hold permissions.
//!
//! Only the empty-argument binding form is modelled, so a headers exchange
//! routes every message to every bound queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use lapin::options::{ExchangeDeclareOptions, QueueDeclareOptions};
use tracing::trace;

use super::amqp_client::{AmqpChannel, AmqpConnection, AmqpConnector};
use super::errors::{ErrorKind, RabbitMQError, Result};
use super::management::ManagementApi;
use crate::config::{ConnectionConfig, ExchangeType};

#[derive(Debug, Clone)]
struct ExchangeRecord {
    kind: ExchangeType,
    durable: bool,
    auto_delete: bool,
}

#[derive(Debug, Clone, Default)]
struct QueueRecord {
    durable: bool,
    exclusive: bool,
    auto_delete: bool,
    messages: VecDeque<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BindingRecord {
    exchange: String,
    queue: String,
    routing_key: String,
}

#[derive(Debug, Default)]
struct VhostState {
    exchanges: HashMap<String, ExchangeRecord>,
    queues: HashMap<String, QueueRecord>,
    bindings: Vec<BindingRecord>,
}

#[derive(Debug, Default)]
struct BrokerState {
    vhosts: HashMap<String, VhostState>,
    permissions: HashSet<(String, String)>,
    unreachable_hosts: HashSet<String>,
    failing_operations: HashMap<String, ErrorKind>,
    operation_log: Vec<String>,
    management_calls: usize,
    connections_opened: usize,
    channels_opened: usize,
    channels_in_use: usize,
}

impl BrokerState {
    fn vhost(&mut self, vhost: &str) -> Result<&mut VhostState> {
        self.vhosts
            .get_mut(vhost)
            .ok_or_else(|| RabbitMQError::ConnectionError(format!("vhost '{}' was deleted", vhost)))
    }
}

/// Cheap to clone; clones share one broker.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

fn not_found(entity: &str, name: &str, vhost: &str) -> RabbitMQError {
    RabbitMQError::NotFound(format!("NOT_FOUND - no {} '{}' in vhost '{}'", entity, name, vhost))
}

fn inequivalent(arg: &str, entity: &str, name: &str, vhost: &str) -> RabbitMQError {
    RabbitMQError::Conflict(format!(
        "PRECONDITION_FAILED - inequivalent arg '{}' for {} '{}' in vhost '{}'",
        arg, entity, name, vhost
    ))
}

/// Topic pattern match: `*` is exactly one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn words_match(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && words_match(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && words_match(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn routes(kind: ExchangeType, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeType::Direct => binding_key == routing_key,
        ExchangeType::Topic => topic_matches(binding_key, routing_key),
        ExchangeType::Fanout | ExchangeType::Headers => true,
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Connections and management calls to `host` fail as if it were down.
    pub fn unreachable_host(&self, host: &str) {
        self.state().unreachable_hosts.insert(host.to_string());
    }

    /// Makes every call of an AMQP method (e.g. `queue.declare`, or
    /// `connection.close`) fail with a transport error that is neither a
    /// conflict nor not-found.
    pub fn fail_operation(&self, method: &str) {
        self.state()
            .failing_operations
            .insert(method.to_string(), ErrorKind::Transport);
    }

    /// Makes every call of an AMQP method fail with a precondition conflict,
    /// whatever the existing topology looks like.
    pub fn conflict_on(&self, method: &str) {
        self.state()
            .failing_operations
            .insert(method.to_string(), ErrorKind::Conflict);
    }

    pub fn seed_exchange(&self, vhost: &str, exchange: &str, kind: ExchangeType) {
        let mut state = self.state();
        state.vhosts.entry(vhost.to_string()).or_default().exchanges.insert(
            exchange.to_string(),
            ExchangeRecord { kind, durable: true, auto_delete: false },
        );
    }

    pub fn seed_queue(&self, vhost: &str, queue: &str, options: QueueDeclareOptions) {
        let mut state = self.state();
        state.vhosts.entry(vhost.to_string()).or_default().queues.insert(
            queue.to_string(),
            QueueRecord {
                durable: options.durable,
                exclusive: options.exclusive,
                auto_delete: options.auto_delete,
                messages: VecDeque::new(),
            },
        );
    }

    /// Appends a message directly, creating a durable queue if needed.
    pub fn seed_message(&self, vhost: &str, queue: &str, body: &[u8]) {
        let mut state = self.state();
        state
            .vhosts
            .entry(vhost.to_string())
            .or_default()
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| QueueRecord { durable: true, ..QueueRecord::default() })
            .messages
            .push_back(body.to_vec());
    }

    pub fn vhost_exists(&self, vhost: &str) -> bool {
        self.state().vhosts.contains_key(vhost)
    }

    pub fn has_permission(&self, vhost: &str, username: &str) -> bool {
        self.state()
            .permissions
            .contains(&(vhost.to_string(), username.to_string()))
    }

    pub fn exchange_type(&self, vhost: &str, exchange: &str) -> Option<ExchangeType> {
        self.state()
            .vhosts
            .get(vhost)
            .and_then(|v| v.exchanges.get(exchange))
            .map(|e| e.kind)
    }

    pub fn queue_depth(&self, vhost: &str, queue: &str) -> Option<usize> {
        self.state()
            .vhosts
            .get(vhost)
            .and_then(|v| v.queues.get(queue))
            .map(|q| q.messages.len())
    }

    pub fn has_binding(&self, vhost: &str, exchange: &str, queue: &str, routing_key: &str) -> bool {
        let binding = BindingRecord {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        self.state()
            .vhosts
            .get(vhost)
            .map_or(false, |v| v.bindings.contains(&binding))
    }

    /// Every AMQP method issued so far, as `"<method> <target>"`.
    pub fn operation_log(&self) -> Vec<String> {
        self.state().operation_log.clone()
    }

    pub fn management_calls(&self) -> usize {
        self.state().management_calls
    }

    pub fn connections_opened(&self) -> usize {
        self.state().connections_opened
    }

    pub fn channels_opened(&self) -> usize {
        self.state().channels_opened
    }

    /// Channels opened but not yet closed by their user.
    pub fn channels_in_use(&self) -> usize {
        self.state().channels_in_use
    }
}

#[async_trait]
impl ManagementApi for InMemoryBroker {
    async fn ensure_vhost(&self, config: &ConnectionConfig) -> Result<()> {
        let mut state = self.state();
        state.management_calls += 1;

        if state.unreachable_hosts.contains(&config.host) {
            return Err(RabbitMQError::ManagementError(format!(
                "error sending request for url (http://{}:{}/api/vhosts/{}): connection refused",
                config.host, config.management_port, config.vhost
            )));
        }

        state.vhosts.entry(config.vhost.clone()).or_default();
        state
            .permissions
            .insert((config.vhost.clone(), config.username.clone()));
        Ok(())
    }
}

#[async_trait]
impl AmqpConnector for InMemoryBroker {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn AmqpConnection>> {
        let mut state = self.state();

        if state.unreachable_hosts.contains(&config.host) {
            return Err(RabbitMQError::ConnectionError(format!(
                "IO error: connection refused ({}:{})",
                config.host, config.port
            )));
        }
        if !state.vhosts.contains_key(&config.vhost) {
            return Err(RabbitMQError::ConnectionError(format!(
                "NOT_ALLOWED - vhost '{}' not found",
                config.vhost
            )));
        }
        if !state
            .permissions
            .contains(&(config.vhost.clone(), config.username.clone()))
        {
            return Err(RabbitMQError::ConnectionError(format!(
                "NOT_ALLOWED - access to vhost '{}' refused for user '{}'",
                config.vhost, config.username
            )));
        }

        state.connections_opened += 1;
        Ok(Box::new(InMemoryConnection {
            broker: self.clone(),
            vhost: config.vhost.clone(),
            open: AtomicBool::new(true),
        }))
    }
}

struct InMemoryConnection {
    broker: InMemoryBroker,
    vhost: String,
    open: AtomicBool,
}

#[async_trait]
impl AmqpConnection for InMemoryConnection {
    async fn open_channel(&self) -> Result<Box<dyn AmqpChannel>> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(RabbitMQError::ConnectionError("connection is closed".to_string()));
        }

        let mut state = self.broker.state();
        state.channels_opened += 1;
        state.channels_in_use += 1;
        let id = state.channels_opened;
        trace!(vhost = %self.vhost, id, "Channel opened");

        Ok(Box::new(InMemoryChannel {
            broker: self.broker.clone(),
            vhost: self.vhost.clone(),
            open: AtomicBool::new(true),
            released: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        let mut state = self.broker.state();
        state.operation_log.push(format!("connection.close {}", self.vhost));
        if state.failing_operations.contains_key("connection.close") {
            return Err(RabbitMQError::ConnectionError(
                "injected failure for connection.close".to_string(),
            ));
        }
        Ok(())
    }
}

struct InMemoryChannel {
    broker: InMemoryBroker,
    vhost: String,
    /// Cleared when the broker closes the channel after an error.
    open: AtomicBool,
    released: AtomicBool,
}

impl InMemoryChannel {
    fn run<T>(
        &self,
        method: &str,
        target: &str,
        operation: impl FnOnce(&mut VhostState, &str) -> Result<T>,
    ) -> Result<T> {
        if !self.open.load(Ordering::SeqCst) || self.released.load(Ordering::SeqCst) {
            return Err(RabbitMQError::ChannelError(format!(
                "invalid channel state: {} on a closed channel",
                method
            )));
        }

        let mut state = self.broker.state();
        state.operation_log.push(format!("{} {}", method, target));

        let outcome = match state.failing_operations.get(method) {
            Some(ErrorKind::Conflict) => Err(RabbitMQError::Conflict(format!(
                "PRECONDITION_FAILED - injected for {}",
                method
            ))),
            Some(_) => Err(RabbitMQError::ChannelError(format!("injected failure for {}", method))),
            None => state
                .vhost(&self.vhost)
                .and_then(|vhost| operation(vhost, &self.vhost)),
        };

        if outcome.is_err() {
            self.open.store(false, Ordering::SeqCst);
        }
        outcome
    }
}

#[async_trait]
impl AmqpChannel for InMemoryChannel {
    async fn declare_queue(&self, queue: &str, options: QueueDeclareOptions) -> Result<()> {
        self.run("queue.declare", queue, |state, vhost| {
            if queue.is_empty() {
                return Err(RabbitMQError::ChannelError(
                    "server-named queues are not supported".to_string(),
                ));
            }
            match state.queues.get(queue) {
                Some(existing) => {
                    if existing.durable != options.durable {
                        return Err(inequivalent("durable", "queue", queue, vhost));
                    }
                    if existing.exclusive != options.exclusive {
                        return Err(inequivalent("exclusive", "queue", queue, vhost));
                    }
                    if existing.auto_delete != options.auto_delete {
                        return Err(inequivalent("auto_delete", "queue", queue, vhost));
                    }
                    Ok(())
                }
                None if options.passive => Err(not_found("queue", queue, vhost)),
                None => {
                    state.queues.insert(
                        queue.to_string(),
                        QueueRecord {
                            durable: options.durable,
                            exclusive: options.exclusive,
                            auto_delete: options.auto_delete,
                            messages: VecDeque::new(),
                        },
                    );
                    Ok(())
                }
            }
        })
    }

    async fn declare_exchange(
        &self,
        exchange: &str,
        kind: ExchangeType,
        options: ExchangeDeclareOptions,
    ) -> Result<()> {
        self.run("exchange.declare", exchange, |state, vhost| {
            if exchange.is_empty() || exchange.starts_with("amq.") {
                return Err(RabbitMQError::ChannelError(format!(
                    "ACCESS_REFUSED - exchange name '{}' contains reserved prefix 'amq.'",
                    exchange
                )));
            }
            match state.exchanges.get(exchange) {
                Some(existing) => {
                    if existing.kind != kind {
                        return Err(inequivalent("type", "exchange", exchange, vhost));
                    }
                    if existing.durable != options.durable {
                        return Err(inequivalent("durable", "exchange", exchange, vhost));
                    }
                    if existing.auto_delete != options.auto_delete {
                        return Err(inequivalent("auto_delete", "exchange", exchange, vhost));
                    }
                    Ok(())
                }
                None if options.passive => Err(not_found("exchange", exchange, vhost)),
                None => {
                    state.exchanges.insert(
                        exchange.to_string(),
                        ExchangeRecord {
                            kind,
                            durable: options.durable,
                            auto_delete: options.auto_delete,
                        },
                    );
                    Ok(())
                }
            }
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.run("queue.bind", queue, |state, vhost| {
            if !state.queues.contains_key(queue) {
                return Err(not_found("queue", queue, vhost));
            }
            if !state.exchanges.contains_key(exchange) {
                return Err(not_found("exchange", exchange, vhost));
            }
            let binding = BindingRecord {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            };
            if !state.bindings.contains(&binding) {
                state.bindings.push(binding);
            }
            Ok(())
        })
    }

    async fn delete_exchange(&self, exchange: &str) -> Result<()> {
        self.run("exchange.delete", exchange, |state, vhost| {
            if state.exchanges.remove(exchange).is_none() {
                return Err(not_found("exchange", exchange, vhost));
            }
            state.bindings.retain(|b| b.exchange != exchange);
            Ok(())
        })
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.run("queue.delete", queue, |state, vhost| {
            if state.queues.remove(queue).is_none() {
                return Err(not_found("queue", queue, vhost));
            }
            state.bindings.retain(|b| b.queue != queue);
            Ok(())
        })
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32> {
        self.run("queue.purge", queue, |state, vhost| {
            let record = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| not_found("queue", queue, vhost))?;
            let purged = record.messages.len() as u32;
            record.messages.clear();
            Ok(purged)
        })
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        let outcome = self.run("basic.publish", exchange, |state, vhost| {
            // The default exchange routes straight to the queue named by the key.
            let targets: Vec<String> = if exchange.is_empty() {
                vec![routing_key.to_string()]
            } else {
                let kind = state
                    .exchanges
                    .get(exchange)
                    .map(|e| e.kind)
                    .ok_or_else(|| not_found("exchange", exchange, vhost))?;
                let mut targets: Vec<String> = state
                    .bindings
                    .iter()
                    .filter(|b| b.exchange == exchange && routes(kind, &b.routing_key, routing_key))
                    .map(|b| b.queue.clone())
                    .collect();
                // One copy per queue, however many of its bindings match.
                targets.sort_unstable();
                targets.dedup();
                targets
            };

            for queue in targets {
                if let Some(record) = state.queues.get_mut(&queue) {
                    record.messages.push_back(body.to_vec());
                }
            }
            Ok(())
        });

        // basic.publish has no reply; `run` has already closed the channel.
        match outcome {
            Err(e) if e.is_not_found() => {
                trace!(exchange, "Publish to missing exchange dropped: {}", e);
                Ok(())
            }
            other => other,
        }
    }

    async fn get_one(&self, queue: &str, auto_ack: bool) -> Result<Option<Vec<u8>>> {
        self.run("basic.get", queue, |state, vhost| {
            if !auto_ack {
                return Err(RabbitMQError::ChannelError(
                    "manual acknowledgements are not supported".to_string(),
                ));
            }
            let record = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| not_found("queue", queue, vhost))?;
            Ok(record.messages.pop_front())
        })
    }

    async fn close(&self) -> Result<()> {
        if !self.released.swap(true, Ordering::SeqCst) {
            let mut state = self.broker.state();
            state.channels_in_use = state.channels_in_use.saturating_sub(1);
        }
        if self.open.swap(false, Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RabbitMQError::ChannelError("channel already closed by broker".to_string()))
        }
    }
}
