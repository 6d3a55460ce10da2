#![allow(clippy::type_complexity)]

pub mod cache;
pub mod config;
pub mod discovery;
pub mod http;
pub mod proxmox;
pub mod responder;
pub mod signal;
pub mod targets;
#[cfg(test)]
pub mod testing;
pub mod tls;
pub mod trace;

#[macro_use]
extern crate tracing;

/// Basic error type, dynamically dispatched and safe to send across threads
pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Basic result type, defined in terms of [`Error`] and generic over `T`
pub type Result<T> = std::result::Result<T, Error>;

pub fn get_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
