//! Provisions RabbitMQ topology for automated test runs and drives
//! publish/fetch/purge operations through named connections.

pub mod config;
pub mod env;
pub mod rabbitmq;

pub use config::{ConnectionConfig, ExchangeConfig, ExchangeType, RabbitConfig};
pub use env::Settings;
pub use rabbitmq::{ErrorKind, InMemoryBroker, RabbitFixture, RabbitMQError};
