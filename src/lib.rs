//! Switchyard
//!
//! A durable message bus for CLI coding agents plus a PTY supervisor that
//! drives their interactive TUIs through a marker-based turn protocol.

pub mod bus;
pub mod config;
pub mod output;
pub mod pty;
pub mod runner;
pub mod session;
pub mod socket;

pub use bus::{Event, EventKind, MessageRouter, SendReceipt};
pub use config::{BusPaths, RelayConfig};
pub use session::{SessionHandle, SessionRegistry};
