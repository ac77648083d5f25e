//! # plaincli-server
//!
//! Server side of the plaincli protocol.
//!
//! This crate provides:
//! - The per-connection session state machine (arguments, start, streaming, exit)
//! - The dispatcher seam that hands a started session to a command catalogue
//! - A small builtin command set
//! - TCP accept loop with connection limits and graceful shutdown

pub mod builtins;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod server;
pub mod session;

pub use builtins::Builtins;
pub use config::{Config, ConfigError, NetworkConfig, SessionConfig};
pub use dispatch::{CommandIo, DispatchError, Dispatcher, Invocation, OutputStream, StdinSource};
pub use error::ServerError;
pub use handler::{serve_session, ServerSide, SessionEnd, SessionOptions, SessionSummary};
pub use server::{Server, ServerConfig, ServerStats};
pub use session::{Session, SessionState};
