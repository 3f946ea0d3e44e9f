//! HTTP surface: the middleware that puts the limiter in front of every
//! request, plus the exempt probe endpoints.

pub mod client_ip;
pub mod middleware;
mod server;

pub use server::{AppState, HttpServer};
