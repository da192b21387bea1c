// src/rabbitmq/errors.rs

use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::Error as LapinError;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("There is no AMQP connection with name {0}")]
    UnknownConnection(String),

    #[error("RabbitMQ precondition failed: {0}")]
    Conflict(String),

    #[error("RabbitMQ entity not found: {0}")]
    NotFound(String),

    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("Management API error: {0}")]
    ManagementError(String),

    #[error("Connection timeout: {0}")]
    TimeoutError(String),

    /// The message was already acknowledged; `body` is all that is left of it.
    #[error("Message from queue '{queue}' is not valid UTF-8: {reason}")]
    DeserializationError {
        queue: String,
        body: Vec<u8>,
        reason: String,
    },

    #[error("Queue '{queue}' is not empty, consumed message: {body:?}")]
    QueueNotEmpty { queue: String, body: String },
}

/// Coarse classification callers branch on instead of matching variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Conflict,
    NotFound,
    Transport,
    Management,
    Decode,
    Assertion,
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RabbitMQError::UnknownConnection(_) => ErrorKind::Configuration,
            RabbitMQError::Conflict(_) => ErrorKind::Conflict,
            RabbitMQError::NotFound(_) => ErrorKind::NotFound,
            RabbitMQError::ConnectionError(_)
            | RabbitMQError::ChannelError(_)
            | RabbitMQError::TimeoutError(_) => ErrorKind::Transport,
            RabbitMQError::ManagementError(_) => ErrorKind::Management,
            RabbitMQError::DeserializationError { .. } => ErrorKind::Decode,
            RabbitMQError::QueueNotEmpty { .. } => ErrorKind::Assertion,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

// Channel-level soft errors carry the reply code we classify on; the broker
// closes the channel after sending one.
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        let error_text = error.to_string();

        match &error {
            LapinError::ProtocolError(amqp_error) => match amqp_error.kind() {
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                    RabbitMQError::Conflict(error_text)
                }
                AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => RabbitMQError::NotFound(error_text),
                AMQPErrorKind::Soft(_) => RabbitMQError::ChannelError(error_text),
                AMQPErrorKind::Hard(_) => RabbitMQError::ConnectionError(error_text),
            },
            LapinError::IOError(_) | LapinError::InvalidConnectionState(_) => {
                RabbitMQError::ConnectionError(error_text)
            }
            _ => RabbitMQError::ChannelError(error_text),
        }
    }
}

impl From<Elapsed> for RabbitMQError {
    fn from(_: Elapsed) -> Self {
        RabbitMQError::TimeoutError("Connection timed out".to_string())
    }
}

impl From<reqwest::Error> for RabbitMQError {
    fn from(error: reqwest::Error) -> Self {
        RabbitMQError::ManagementError(error.to_string())
    }
}
