//! Composition root for the Lyquor dashboard backend.
//!
//! Owns the session registry, the devnet supervisor and the HTTP/WebSocket
//! server, and tears all of them down on shutdown.

pub mod daemon;
