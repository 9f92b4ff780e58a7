//! Keg weight-sensor link for the brewery management service.
//!
//! One worker process per host wins the owner election and keeps an MQTT
//! session to the scale's broker; every worker answers status queries from
//! the shared SQLite row.

pub mod cache;
pub mod config;
pub mod db;
pub mod election;
pub mod models;
pub mod mqtt_service;
pub mod rest_server;
pub mod service_utils;
pub mod status;
pub mod weight;
pub mod worker;

pub use cache::WeightCache;
pub use config::{Config, ConfigError};
pub use connection_test::test_connection;
pub use db::{DatabaseService, DbError};
pub use election::OwnerLock;
pub use models::{BrokerConfig, ConnectionTestResult, SensorReading, StartOutcome};
pub use mqtt_service::{ClientState, MqttService};
pub use status::StatusReader;
pub use weight::{decode_weight_payload, PayloadError};
pub use worker::WorkerRuntime;
