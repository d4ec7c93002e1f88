#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! cluster-connector library: the pieces the `connector` binary is built from.
//!
//! - `tunnel`: relay channels, request proxying, heartbeats, metadata sync
//! - `cluster`: provider and metadata discovery against the API server
//! - `config`: configuration loading
//! - `tls`: relay client TLS
//! - `healthz`: liveness endpoint
//! - `identity`: cluster identity sent on long-lived channels
//! - `error`: shared error type

pub mod cluster;
pub mod config;
pub mod error;
pub mod healthz;
pub mod identity;
pub mod tls;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::{Error, Result};
pub use identity::ClusterId;
pub use tunnel::agent::{Agent, AgentOptions, CycleEnd};
