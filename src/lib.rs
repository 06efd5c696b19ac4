//! # siakad-queue
//!
//! Durable work queues and store-backed distributed locks for the SIAKAD
//! middleware layer.
//!
//! Provides a broker client over AMQP, a key-value store client over
//! Redis, a per-queue consumer engine with ack/requeue settlement, lease
//! locks, composite health reporting, and an admin HTTP surface. All of it
//! is observable through OpenTelemetry.

pub mod admin;
pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod jobs;
pub mod lock;
pub mod notify;
pub mod registry;
pub mod store;
pub mod telemetry;
