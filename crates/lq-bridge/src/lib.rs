//! Transport and dispatch layer of the Lyquor dev backend.
//!
//! Requests arrive as `{type, data, id}` envelopes over a one-shot HTTP POST
//! or a persistent WebSocket, are routed by `type` through a [`Dispatcher`],
//! and every event a handler emits is sent back stamped with the request id.
//!
//! - [`dispatcher`]: keyed handler table shared by both transports
//! - [`handlers`]: `ping`, `terminal`, `stdin`, `start-devnet`, `stop-devnet`
//! - [`devnet`]: supervisor for the single local devnet process
//! - [`editor`]: namespaced file-tree operations behind `/editor`
//! - [`http_api`]: axum router, health and one-shot dispatch
//! - [`ws`]: the persistent WebSocket transport

pub mod api_error;
pub mod devnet;
pub mod dispatcher;
pub mod editor;
pub mod handlers;
pub mod http_api;
pub mod ws;

pub use dispatcher::{DispatchError, Dispatcher, Handler, HandlerDescriptor};
