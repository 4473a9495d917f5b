//! Moogie - synthetic endpoint monitoring.
//!
//! Probes report executions to the server, which stores them, computes
//! health metrics on demand and pushes new results to live dashboards.

pub mod config;
pub mod db;
pub mod hub;
pub mod ingest;
pub mod metrics;
pub mod probe;
pub mod report;
pub mod web;
