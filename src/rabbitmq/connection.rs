use lapin::options::{ExchangeDeclareOptions, QueueDeclareOptions};
use tracing::{debug, info};

use super::amqp_client::{AmqpChannel, AmqpConnection};
use super::errors::Result;
use crate::config::ExchangeType;

/// One open transport connection for a logical connection name.
///
/// Channels are never cached: each operation below opens its own channel,
/// issues exactly one protocol method on it and closes it again. A channel the
/// broker closed after an error is therefore never reused.
pub struct ConnectionHandle {
    name: String,
    vhost: String,
    connection: Box<dyn AmqpConnection>,
}

impl ConnectionHandle {
    pub fn new(name: &str, vhost: &str, connection: Box<dyn AmqpConnection>) -> Self {
        ConnectionHandle {
            name: name.to_string(),
            vhost: vhost.to_string(),
            connection,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vhost(&self) -> &str {
        &self.vhost
    }

    /// A fresh channel; the caller owns it exclusively.
    pub async fn channel(&self) -> Result<Box<dyn AmqpChannel>> {
        self.connection.open_channel().await
    }

    async fn release<T>(&self, channel: Box<dyn AmqpChannel>, outcome: Result<T>) -> Result<T> {
        if let Err(e) = channel.close().await {
            debug!(connection = %self.name, "Ignoring channel close failure: {}", e);
        }
        outcome
    }

    pub async fn declare_queue(&self, queue: &str, options: QueueDeclareOptions) -> Result<()> {
        let channel = self.channel().await?;
        let outcome = channel.declare_queue(queue, options).await;
        self.release(channel, outcome).await
    }

    pub async fn declare_exchange(
        &self,
        exchange: &str,
        kind: ExchangeType,
        options: ExchangeDeclareOptions,
    ) -> Result<()> {
        let channel = self.channel().await?;
        let outcome = channel.declare_exchange(exchange, kind, options).await;
        self.release(channel, outcome).await
    }

    pub async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let channel = self.channel().await?;
        let outcome = channel.bind_queue(queue, exchange, routing_key).await;
        self.release(channel, outcome).await
    }

    pub async fn delete_exchange(&self, exchange: &str) -> Result<()> {
        let channel = self.channel().await?;
        let outcome = channel.delete_exchange(exchange).await;
        self.release(channel, outcome).await
    }

    pub async fn delete_queue(&self, queue: &str) -> Result<()> {
        let channel = self.channel().await?;
        let outcome = channel.delete_queue(queue).await;
        self.release(channel, outcome).await
    }

    pub async fn purge_queue(&self, queue: &str) -> Result<u32> {
        let channel = self.channel().await?;
        let outcome = channel.purge_queue(queue).await;
        self.release(channel, outcome).await
    }

    pub async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        let channel = self.channel().await?;
        let outcome = channel.publish(exchange, routing_key, body).await;
        self.release(channel, outcome).await
    }

    pub async fn get_one(&self, queue: &str, auto_ack: bool) -> Result<Option<Vec<u8>>> {
        let channel = self.channel().await?;
        let outcome = channel.get_one(queue, auto_ack).await;
        self.release(channel, outcome).await
    }

    pub async fn close(&self) -> Result<()> {
        info!(connection = %self.name, "Closing RabbitMQ connection gracefully");
        self.connection.close().await
    }
}
