// src/rabbitmq/mod.rs
// Broker collaborators, topology provisioning and the fixture facade

pub mod amqp_client;
pub mod connection;
pub mod errors;
pub mod fixture;
pub mod in_memory;
pub mod management;
pub mod provisioner;
pub mod registry;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::{AmqpChannel, AmqpConnection, AmqpConnector, LapinConnector};
pub use connection::ConnectionHandle;
pub use errors::{ErrorKind, RabbitMQError, Result};
pub use fixture::RabbitFixture;
pub use in_memory::InMemoryBroker;
pub use management::{HttpManagementClient, ManagementApi};
pub use provisioner::{provision_exchange, ProvisionOutcome};
pub use registry::ConnectionRegistry;
