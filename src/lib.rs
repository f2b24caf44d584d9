//! Check Notify
//!
//! Real-time notification plumbing for the check-processing backend: a
//! reference-counted pool of upstream SSE connections, per-check and global
//! status streams, cancellation of in-flight checks, and a background job
//! queue for regenerating dictionary embeddings.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
