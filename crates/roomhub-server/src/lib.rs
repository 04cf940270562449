//! # roomhub-server
//!
//! Axum HTTP + `WebSocket` server for a single shared message room.
//!
//! - One coordinator task owns the membership table; members reach it only
//!   through commands (add / remove / broadcast / direct-message)
//! - One receive task + one supervising state-machine task per member
//!   (keepalive pings, idle eviction, graceful teardown)
//! - HTTP surface: `WebSocket` admission, secret-gated member listing, health
//! - Graceful shutdown via `tokio::signal` + `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod room;
pub mod server;
pub mod shutdown;
