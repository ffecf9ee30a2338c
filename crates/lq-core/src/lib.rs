//! Shared foundations for the Lyquor local developer dashboard backend.
//!
//! This crate holds everything the transport, session and client layers
//! agree on:
//! - [`config`]: TOML configuration with documented defaults
//! - [`protocol`]: request envelopes, the [`protocol::Event`] sum type and
//!   its `{type, data, id}` wire shape
//! - [`sink`]: the event emission channel handed to every handler
//! - [`shutdown`]: cooperative shutdown coordination for the daemon

pub mod config;
pub mod protocol;
pub mod shutdown;
pub mod sink;
