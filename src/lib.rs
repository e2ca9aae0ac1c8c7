#![forbid(unsafe_code)]

//! Progress-tracked streaming download proxy.
//!
//! Resolves a video URL to its downloadable stream variants, pipes the
//! selected variant from the upstream CDN to the client without buffering the
//! payload, and pushes real-time progress frames over a separate
//! server-sent-events channel keyed by a session token.

pub mod api;
pub mod config;
pub mod error;
pub mod progress;
pub mod provider;
pub mod proxy;
pub mod registry;
pub mod resolver;
pub mod security;
