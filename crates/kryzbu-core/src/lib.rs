//! # Kryzbu Core Library
//!
//! Client and server sides of a small secure file store. Users register with
//! the server operator, log in once to obtain a long-lived session key, and
//! then upload, download, list and delete their own files. Every request is
//! sealed under the session key; every administrative and file event lands in
//! an HMAC-protected audit log.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        server        │      client      │
//! ├─────────────────────────────────────────┤
//! │ accounts │ index │ audit │   transfer   │
//! ├─────────────────────────────────────────┤
//! │       session (handshake, envelope)     │
//! ├─────────────────────────────────────────┤
//! │  protocol (wire)  │  storage (sqlite)   │
//! ├─────────────────────────────────────────┤
//! │                 crypto                  │
//! └─────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod accounts;
pub mod audit;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod index;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;
pub mod transfer;

pub use client::{Client, Credentials, FetchedKey, Session};
pub use config::{ClientConfig, ServerConfig};
pub use error::{Error, Result};
pub use server::{Server, ServerContext};
pub use storage::FileRecord;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
