//! # Feedline
//!
//! Supervision engine for long-lived change feed subscriptions.
//!
//! A change feed is a live, ordered stream of change records derived
//! from a query against a remote data source. Feedline owns everything
//! around such a stream that is not application logic:
//!
//! - [`handle`] - public API: start a subscription, send it requests,
//!   messages and notifications, migrate its state, stop it
//! - [`handler`] - the callback contract application code implements
//! - [`source`] - the capability trait over the external query client
//! - `actor` - the per-subscription state machine and event loop
//! - `fetch` - single-flight asynchronous batch pulls
//! - [`backoff`] - capped exponential reconnect delays
//! - [`change`] - the batch/record data contract
//! - [`testing`] - scripted mocks for handler and engine tests
//!
//! ## Architecture
//!
//! ```text
//! FeedHandle ──► inbox ──► FeedActor ──► FeedHandler callbacks
//!   call/cast              (one task,      init / on_update /
//!   notify/migrate          serialized)    on_call / on_cast / ...
//!   stop                       │
//!                              ▼
//!                         FeedSource (open / next / close)
//! ```
//!
//! One actor task owns one subscription: connection establishment,
//! reconnect with exponential backoff, cursor pagination, and dispatch
//! of every event category to the handler, with the handler's opaque
//! state threaded through each invocation.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Common test patterns that are acceptable
#![cfg_attr(
    test,
    allow(
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss,
        clippy::manual_let_else,
        clippy::unreadable_literal
    )
)]

/// Engine error types.
pub mod error;

/// Engine configuration and lifecycle types.
pub mod config;

/// Change batch and record types.
pub mod change;

/// Reconnect backoff policy.
pub mod backoff;

/// External data-source capability.
pub mod source;

/// Pluggable handler contract.
pub mod handler;

/// Single-flight asynchronous fetch operations.
mod fetch;

/// Subscription state machine.
mod actor;

/// Public subscription handle.
pub mod handle;

/// Subscription runtime metrics.
pub mod metrics;

/// Testing utilities (mock source, recording handler).
pub mod testing;
