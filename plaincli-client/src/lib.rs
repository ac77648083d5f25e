//! # plaincli-client
//!
//! Client side of the plaincli protocol.
//!
//! This crate provides:
//! - Request construction (arguments, locale, encoding)
//! - The client session handler: stdin relay, output relay, exit status
//! - Optional keepalive pings while a command runs
//! - TCP connection helper with connect timeout

pub mod client;
pub mod connection;
pub mod error;
pub mod request;
pub mod session;

pub use client::Client;
pub use connection::{ConnectionConfig, DEFAULT_PING_INTERVAL};
pub use error::ClientError;
pub use request::Request;
pub use session::{ClientSide, Outcome};
