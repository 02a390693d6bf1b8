use std::str::FromStr;
use std::time;

use categorizer_common::classifier::ClassifierConfig;
use envconfig::Envconfig;
use url::form_urlencoded;

use crate::broker::Topology;
use crate::worker::{PipelineSettings, ReconnectPolicy};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8000")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub rabbitmq: RabbitMqConfig,

    #[envconfig(from = "PROJECT_EXCHANGE", default = "project.events.exchange")]
    pub project_exchange: NonEmptyString,

    #[envconfig(from = "ROUTING_KEY_CREATED", default = "project.created")]
    pub routing_key_created: NonEmptyString,

    #[envconfig(from = "ROUTING_KEY_UPDATED", default = "project.updated")]
    pub routing_key_updated: NonEmptyString,

    #[envconfig(from = "ROUTING_KEY_CATEGORIZED", default = "project.categorized")]
    pub routing_key_categorized: NonEmptyString,

    #[envconfig(from = "CATEGORIZATION_QUEUE", default = "categorization_queue")]
    pub categorization_queue: NonEmptyString,

    /// Rejected deliveries are dropped unless this is set.
    #[envconfig(from = "DEAD_LETTER_EXCHANGE")]
    pub dead_letter_exchange: Option<NonEmptyString>,

    #[envconfig(from = "PREFETCH_COUNT", default = "1")]
    pub prefetch_count: u16,

    #[envconfig(from = "RECONNECT_DELAY_MS", default = "5000")]
    pub reconnect_delay: EnvMsDuration,

    #[envconfig(from = "HEARTBEAT_INTERVAL_MS", default = "10000")]
    pub heartbeat_interval: EnvMsDuration,

    #[envconfig(nested = true)]
    pub groq: GroqConfig,
}

#[derive(Envconfig, Clone)]
pub struct RabbitMqConfig {
    #[envconfig(from = "RABBITMQ_HOST", default = "localhost")]
    pub host: String,

    #[envconfig(from = "RABBITMQ_PORT", default = "5672")]
    pub port: u16,

    #[envconfig(from = "RABBITMQ_USER", default = "guest")]
    pub user: String,

    #[envconfig(from = "RABBITMQ_PASSWORD", default = "guest")]
    pub password: String,

    #[envconfig(from = "RABBITMQ_VHOST", default = "/")]
    pub vhost: String,
}

#[derive(Envconfig, Clone)]
pub struct GroqConfig {
    #[envconfig(from = "GROQ_API_KEY")]
    pub api_key: NonEmptyString,

    #[envconfig(
        from = "GROQ_API_URL",
        default = "https://api.groq.com/openai/v1/chat/completions"
    )]
    pub api_url: String,

    #[envconfig(from = "GROQ_MODEL", default = "llama-3.1-8b-instant")]
    pub model: String,

    #[envconfig(from = "GROQ_TIMEOUT_MS", default = "10000")]
    pub timeout: EnvMsDuration,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn topology(&self) -> Topology {
        Topology {
            exchange: self.project_exchange.as_str().to_owned(),
            queue: self.categorization_queue.as_str().to_owned(),
            binding_keys: vec![
                self.routing_key_created.as_str().to_owned(),
                self.routing_key_updated.as_str().to_owned(),
            ],
            dead_letter_exchange: self
                .dead_letter_exchange
                .as_ref()
                .map(|exchange| exchange.as_str().to_owned()),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            topology: self.topology(),
            categorized_routing_key: self.routing_key_categorized.as_str().to_owned(),
            prefetch_count: self.prefetch_count,
            reconnect: ReconnectPolicy::new(self.reconnect_delay.0),
            heartbeat_interval: self.heartbeat_interval.0,
        }
    }

    pub fn classifier(&self) -> ClassifierConfig {
        ClassifierConfig {
            api_url: self.groq.api_url.clone(),
            api_key: self.groq.api_key.as_str().to_owned(),
            model: self.groq.model.clone(),
            timeout: self.groq.timeout.0,
        }
    }
}

impl RabbitMqConfig {
    /// AMQP URI for the configured broker. Credentials and vhost are percent-encoded,
    /// so the default vhost `/` becomes `%2F`.
    pub fn uri(&self) -> String {
        let encode = |part: &str| form_urlencoded::byte_serialize(part.as_bytes()).collect::<String>();

        format!(
            "amqp://{}:{}@{}:{}/{}",
            encode(&self.user),
            encode(&self.password),
            self.host,
            self.port,
            encode(&self.vhost)
        )
    }

    /// Broker address without credentials.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}
