//! Sightline Serve - HTTP read API over the live identity store.
//!
//! This crate exposes the snapshot, map pins and inspection views of the
//! aggregate set that the ingestion loop maintains in memory. Handlers only
//! ever read; the ingestion loop is the single writer.
//!
//! # Authentication
//!
//! All `/api/v1` endpoints require Bearer token authentication. Tokens are
//! configured via environment variables (typically in a `.env` file).
//!
//! # Architecture
//!
//! - **AppState**: Shared store handle, loop handle, configuration and cache
//! - **Auth**: Bearer token middleware for request authentication
//! - **Routes**: Endpoint handlers grouped by domain

mod auth;
pub mod cache;
pub mod config;
mod error;
mod routes;
mod state;

pub use self::auth::require_auth;
pub use self::cache::{PINS_KEY, ResponseCache, get_or_compute, new_cache};
pub use self::config::{Config, SourceConfig, Viewport};
pub use self::error::ApiError;
pub use self::routes::{compute_pins, router};
pub use self::state::AppState;
