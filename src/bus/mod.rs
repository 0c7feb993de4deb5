//! Durable mailbox bus: event log, subscriber registry, target resolution,
//! per-subscriber mailboxes, and the routing facade.
//!
//! All cross-process state lives in files; the only synchronization
//! primitive is atomic rename (see [`mailbox`]).

mod event;
mod log;
mod mailbox;
mod registry;
mod resolver;
mod router;

pub use event::{Event, EventKind};
pub use log::EventLog;
pub use mailbox::MailboxStore;
pub use registry::{
    JoinRequest, LaunchMode, Subscriber, SubscriberRegistry, SubscriberStatus, CONTROLLER_ID,
};
pub use resolver::{resolve_target, target_matches};
pub use router::{ConsumeResult, MessageRouter, SendReceipt};

use thiserror::Error;

/// Errors surfaced by bus operations.
///
/// Transient drain contention is not represented here: losing the claim race
/// is reported as an empty drain, never as an error.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("target not found: {0}")]
    TargetNotFound(String),

    #[error("unknown subscriber: {0}")]
    UnknownSubscriber(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
