//! HTTP service in front of the [`alias_pay`] payment core.
//!
//! The tool-calling front end drives checkout and confirmation over JSON;
//! the relay bridge posts HMAC-signed settlement events to `/relay/events`.
//! Collaborators (alias directory, relay, ledger, cart service) are reached
//! over HTTP through the adapters in [`upstream`].
//!
//! # Modules
//!
//! - [`routes`]: HTTP endpoints
//! - [`state`]: shared [`AppState`](state::AppState)
//! - [`config`]: environment configuration
//! - [`auth`]: relay signatures and bearer tokens
//! - [`error`]: mapping of payment errors onto HTTP responses
//! - [`metrics`]: Prometheus counters and histograms
//! - [`upstream`]: reqwest-backed collaborator adapters

pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod routes;
pub mod state;
pub mod upstream;
