//! HTTP API: enqueue, stream delivery, cancellation, and the service binary's
//! command line.

pub mod app;
pub mod cli;
