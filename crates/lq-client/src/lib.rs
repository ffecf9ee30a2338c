//! Client side of the dashboard transport.
//!
//! [`RpcClient`] owns one persistent connection and a [`Correlator`] that
//! matches responses back to the call that produced them. [`ExecBus`] and
//! [`TerminalConsole`] drive terminal views from other parts of a UI.

pub mod console;
pub mod correlator;
pub mod error;
pub mod exec_bus;
pub mod transport;

pub use console::{KeyOutcome, TerminalConsole};
pub use correlator::{Correlator, PendingCall};
pub use error::{ClientError, Result};
pub use exec_bus::{ExecBus, ExecCommand};
pub use transport::{Link, RpcClient, TransportState};
