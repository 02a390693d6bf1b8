use thiserror::Error;

use crate::broker::BrokerError;

/// Enumeration of errors that make a single delivery unprocessable. Any of them
/// leads to the delivery being rejected without requeue.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("message body is not valid UTF-8 JSON: {0}")]
    Decode(serde_json::Error),
    #[error("message body is JSON but not an object")]
    NotAnObject,
    #[error("message body does not match the project event shape: {0}")]
    Shape(serde_json::Error),
    #[error("failed to serialize the categorized event: {0}")]
    Encode(serde_json::Error),
    #[error("failed to publish the categorized event: {0}")]
    Publish(#[from] BrokerError),
}

impl DeliveryError {
    pub fn reason(&self) -> &'static str {
        match self {
            DeliveryError::Decode(_) | DeliveryError::NotAnObject | DeliveryError::Shape(_) => {
                "undecodable"
            }
            DeliveryError::Encode(_) => "encode",
            DeliveryError::Publish(_) => "publish",
        }
    }
}

/// Enumeration of errors that stop the service.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("invalid configuration: {0}")]
    ConfigError(#[from] envconfig::Error),
    #[error("failed to build the classification client: {0}")]
    ClassifierError(#[from] reqwest::Error),
    #[error("failed to install the metrics recorder: {0}")]
    MetricsError(#[from] metrics_exporter_prometheus::BuildError),
    #[error("http server failed: {0}")]
    ServerError(#[from] std::io::Error),
    #[error("a service task panicked or was cancelled: {0}")]
    TaskError(#[from] tokio::task::JoinError),
}
