//! Gatekeeper - Per-Client Admission Control
//!
//! This crate implements an in-memory token bucket rate limiter keyed by
//! client address. Visitors that exhaust their bucket are blocked for a
//! cooldown period, and a background sweeper evicts idle state so memory
//! stays bounded. An axum middleware layer puts the limiter in front of an
//! HTTP service.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
