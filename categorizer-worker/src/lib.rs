pub mod amqp;
pub mod broker;
pub mod config;
pub mod error;
pub mod server;
pub mod worker;
