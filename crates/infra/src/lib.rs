//! Infrastructure layer: queues, brokers, workers, delivery, config.

pub mod config;
pub mod event_bus;
pub mod generation;
pub mod jobs;
pub mod metrics;
pub mod repos;
pub mod streaming;
pub mod workers;

#[cfg(test)]
mod integration_tests;
