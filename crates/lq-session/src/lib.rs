//! Interactive terminal sessions for the Lyquor dev backend.
//!
//! - [`pty`]: the pseudo-terminal process wrapper and its capacity-bounded pool
//! - [`registry`]: session id to live process, with atomic get-or-create
//! - [`request`]: decoding of inbound terminal payloads into typed commands
//! - [`terminal`]: the dispatcher that drives the registry from those commands
//! - [`utf8`]: chunk-boundary-safe decoding of process output

pub mod pty;
pub mod registry;
pub mod request;
pub mod terminal;
pub mod utf8;

pub use pty::{PtyError, PtyHandle, PtyPool, ShellSpec};
pub use registry::{Session, SessionRegistry};
pub use request::{RequestError, Signal, TerminalAction, TerminalCommand};
pub use terminal::{TerminalDispatcher, TerminalError};
pub use utf8::Utf8Carry;
