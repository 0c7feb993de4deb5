//! Routing facade over the event log, registry, and mailboxes.

use serde_json::Value;
use tracing::{debug, info};

use super::{
    resolve_target, target_matches, BusError, Event, EventKind, EventLog, MailboxStore,
    SubscriberRegistry,
};
use crate::config::{BusPaths, RelayConfig};

/// Result of a `send`: the assigned sequence number and the concrete
/// subscriber ids the event was routed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub seq: u64,
    pub targets: Vec<String>,
}

/// Result of a pull-style `consume`.
#[derive(Debug, Clone)]
pub struct ConsumeResult {
    pub consumed: Vec<Event>,
    pub new_offset: u64,
}

/// Orchestrates send/broadcast/check/ack/consume over the durable bus.
#[derive(Debug, Clone)]
pub struct MessageRouter {
    log: EventLog,
    registry: SubscriberRegistry,
    mailboxes: MailboxStore,
}

impl MessageRouter {
    pub fn new(paths: &BusPaths, config: &RelayConfig) -> Self {
        Self {
            log: EventLog::new(paths.events_dir()),
            registry: SubscriberRegistry::new(
                paths.subscribers_file(),
                config.heartbeat_stale_after(),
            ),
            mailboxes: MailboxStore::new(paths.mailboxes_dir(), paths.offsets_file()),
        }
    }

    pub fn from_parts(
        log: EventLog,
        registry: SubscriberRegistry,
        mailboxes: MailboxStore,
    ) -> Self {
        Self {
            log,
            registry,
            mailboxes,
        }
    }

    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    pub fn mailboxes(&self) -> &MailboxStore {
        &self.mailboxes
    }

    /// Send a text message to a target (id, nickname, agent type, or `*`).
    pub fn send(
        &self,
        target: &str,
        message: &str,
        publisher: &str,
    ) -> Result<SendReceipt, BusError> {
        self.send_event(Event::message(publisher, target, message))
    }

    /// Route an already-built event: assign seq, append to the log, then
    /// enqueue into every resolved target's mailbox.
    pub fn send_event(&self, event: Event) -> Result<SendReceipt, BusError> {
        let subscribers = self.registry.snapshot();
        let targets = resolve_target(&subscribers, &event.target);
        if targets.is_empty() {
            return Err(BusError::TargetNotFound(event.target.clone()));
        }

        let event = self.log.append(event)?;
        for id in &targets {
            self.mailboxes.enqueue(id, &event)?;
        }

        debug!(seq = event.seq, target = %event.target, count = targets.len(), "routed event");
        Ok(SendReceipt {
            seq: event.seq,
            targets,
        })
    }

    /// Send to every active subscriber.
    pub fn broadcast(&self, message: &str, publisher: &str) -> Result<SendReceipt, BusError> {
        self.send("*", message, publisher)
    }

    /// Pending mailbox entries, without consuming them.
    pub fn check(&self, subscriber_id: &str) -> Vec<Event> {
        self.mailboxes.peek(subscriber_id)
    }

    /// Truncate a subscriber's mailbox; returns entries cleared.
    pub fn ack(&self, subscriber_id: &str) -> Result<usize, BusError> {
        self.mailboxes.ack(subscriber_id)
    }

    /// Exclusively drain a subscriber's mailbox (rename protocol). Empty on
    /// a lost race; callers retry next poll tick.
    pub fn drain(&self, subscriber_id: &str) -> Vec<Event> {
        self.mailboxes.drain(subscriber_id)
    }

    /// Pull-style read: all logged events addressed to this subscriber with
    /// seq beyond the stored cursor (or from the beginning), advancing the
    /// cursor to the max seq observed.
    pub fn consume(
        &self,
        subscriber_id: &str,
        from_beginning: bool,
    ) -> Result<ConsumeResult, BusError> {
        let subscriber = self
            .registry
            .get(subscriber_id)
            .ok_or_else(|| BusError::UnknownSubscriber(subscriber_id.to_string()))?;

        let base = if from_beginning {
            0
        } else {
            self.mailboxes.offset(subscriber_id)
        };

        let consumed: Vec<Event> = self
            .log
            .scan()
            .into_iter()
            .filter(|e| e.seq > base && target_matches(&subscriber, &e.target))
            .collect();

        let new_offset = consumed.iter().map(|e| e.seq).max().unwrap_or(base);
        if new_offset > self.mailboxes.offset(subscriber_id) {
            self.mailboxes.set_offset(subscriber_id, new_offset)?;
        }

        info!(
            subscriber = subscriber_id,
            count = consumed.len(),
            new_offset,
            "consumed events"
        );
        Ok(ConsumeResult {
            consumed,
            new_offset,
        })
    }

    /// Append a subscriber lifecycle event (join, leave, heartbeat) to the
    /// log without mailbox fanout. Pull consumers see these through
    /// [`consume`](Self::consume); the push path never queues them.
    pub fn record_lifecycle(
        &self,
        kind: EventKind,
        event_name: &str,
        publisher: &str,
        payload: Value,
    ) -> Result<u64, BusError> {
        let event = self
            .log
            .append(Event::new(kind, event_name, publisher, "*", payload))?;
        debug!(seq = event.seq, kind = ?kind, publisher, "recorded lifecycle event");
        Ok(event.seq)
    }

    /// Record a bus-internal notification in the log and the target's
    /// mailbox (restart exhausted, fallback engaged, ...).
    pub fn notify_system(
        &self,
        target: &str,
        event_name: &str,
        payload: Value,
    ) -> Result<SendReceipt, BusError> {
        self.send_event(Event::new(
            EventKind::System,
            event_name,
            super::CONTROLLER_ID,
            target,
            payload,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{JoinRequest, LaunchMode};
    use std::time::Duration;
    use tempfile::TempDir;

    fn router_in_temp() -> (TempDir, MessageRouter) {
        let temp = TempDir::new().unwrap();
        let paths = BusPaths::at(temp.path());
        let router = MessageRouter::new(&paths, &RelayConfig::default());
        (temp, router)
    }

    fn join(router: &MessageRouter, agent_type: &str, session_id: &str) {
        router
            .registry()
            .join(JoinRequest {
                agent_type: agent_type.to_string(),
                session_id: session_id.to_string(),
                nickname: None,
                launch_mode: LaunchMode::Pty,
                pid: None,
                tty_path: None,
            })
            .unwrap();
    }

    #[test]
    fn test_simple_round_trip() {
        let (_temp, router) = router_in_temp();
        join(&router, "codex", "abc1");

        let receipt = router.send("codex:abc1", "hello", "codex:pub1").unwrap();
        assert_eq!(receipt.seq, 1);
        assert_eq!(receipt.targets, vec!["codex:abc1"]);

        let drained = router.drain("codex:abc1");
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].payload["message"], "hello");
    }

    #[test]
    fn test_send_unknown_target() {
        let (_temp, router) = router_in_temp();
        assert!(matches!(
            router.send("nobody", "hi", "codex:pub1"),
            Err(BusError::TargetNotFound(_))
        ));
    }

    #[test]
    fn test_seq_strictly_increasing_across_sends() {
        let (_temp, router) = router_in_temp();
        join(&router, "codex", "abc1");
        join(&router, "gemini", "xyz1");

        let mut last = 0;
        for i in 0..5 {
            let receipt = if i % 2 == 0 {
                router.send("codex:abc1", "ping", "codex:pub1").unwrap()
            } else {
                router.broadcast("ping-all", "codex:pub1").unwrap()
            };
            assert_eq!(receipt.seq, last + 1);
            last = receipt.seq;
        }
    }

    #[test]
    fn test_broadcast_reaches_all_active() {
        let (_temp, router) = router_in_temp();
        join(&router, "codex", "abc1");
        join(&router, "gemini", "xyz1");
        router.registry().leave("gemini:xyz1").unwrap();

        let receipt = router.broadcast("hello all", "codex:pub1").unwrap();
        assert_eq!(receipt.targets, vec!["codex:abc1"]);
    }

    #[test]
    fn test_check_then_ack() {
        let (_temp, router) = router_in_temp();
        join(&router, "codex", "abc1");
        router.send("codex:abc1", "one", "codex:pub1").unwrap();
        router.send("codex:abc1", "two", "codex:pub1").unwrap();

        assert_eq!(router.check("codex:abc1").len(), 2);
        assert_eq!(router.ack("codex:abc1").unwrap(), 2);
        assert_eq!(router.ack("codex:abc1").unwrap(), 0);
        assert!(router.check("codex:abc1").is_empty());
    }

    #[test]
    fn test_consume_advances_offset() {
        let (_temp, router) = router_in_temp();
        join(&router, "codex", "abc1");
        router.send("codex:abc1", "first", "codex:pub1").unwrap();
        router.send("codex", "second", "codex:pub1").unwrap();

        let result = router.consume("codex:abc1", false).unwrap();
        assert_eq!(result.consumed.len(), 2);
        assert_eq!(result.new_offset, 2);

        // Nothing new on a second pull.
        let again = router.consume("codex:abc1", false).unwrap();
        assert!(again.consumed.is_empty());
        assert_eq!(again.new_offset, 2);

        // From the beginning replays everything.
        let replay = router.consume("codex:abc1", true).unwrap();
        assert_eq!(replay.consumed.len(), 2);
    }

    #[test]
    fn test_consume_filters_other_targets() {
        let (_temp, router) = router_in_temp();
        join(&router, "codex", "abc1");
        join(&router, "gemini", "xyz1");
        router.send("gemini:xyz1", "not yours", "codex:pub1").unwrap();
        router.send("codex:abc1", "yours", "codex:pub1").unwrap();

        let result = router.consume("codex:abc1", false).unwrap();
        assert_eq!(result.consumed.len(), 1);
        assert_eq!(result.consumed[0].payload["message"], "yours");
    }

    #[test]
    fn test_consume_unknown_subscriber() {
        let (_temp, router) = router_in_temp();
        assert!(matches!(
            router.consume("codex:none", false),
            Err(BusError::UnknownSubscriber(_))
        ));
    }

    #[test]
    fn test_enqueue_skipped_after_pull_consumer_advanced() {
        // Documented dual-path behavior: once the pull cursor passed a seq,
        // the push mailbox path will not re-deliver at or below it.
        let (_temp, router) = router_in_temp();
        join(&router, "codex", "abc1");

        router.send("codex:abc1", "one", "codex:pub1").unwrap();
        router.consume("codex:abc1", false).unwrap();

        // Mailbox still holds "one" (consume does not drain mailboxes); ack
        // clears it, and later events enqueue normally.
        router.ack("codex:abc1").unwrap();
        router.send("codex:abc1", "two", "codex:pub1").unwrap();
        let drained = router.drain("codex:abc1");
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].payload["message"], "two");
    }

    #[test]
    fn test_seq_monotonic_across_partition_rotation() {
        use std::io::Write as _;
        let temp = TempDir::new().unwrap();
        let paths = BusPaths::at(temp.path());
        paths.ensure_dirs().unwrap();

        // A partition from a previous day with seq up to 10.
        let old = Event {
            seq: 10,
            ..Event::message("codex:pub1", "*", "old")
        };
        let mut file =
            std::fs::File::create(paths.events_dir().join("events-2020-06-01.jsonl")).unwrap();
        writeln!(file, "{}", serde_json::to_string(&old).unwrap()).unwrap();

        let router = MessageRouter::new(&paths, &RelayConfig::default());
        join(&router, "codex", "abc1");
        let receipt = router.send("codex:abc1", "new", "codex:pub1").unwrap();
        assert_eq!(receipt.seq, 11);
    }

    #[test]
    fn test_lifecycle_events_logged_without_fanout() {
        let (_temp, router) = router_in_temp();
        join(&router, "codex", "abc1");

        router
            .record_lifecycle(
                EventKind::Join,
                "subscriber.join",
                "codex:abc1",
                serde_json::json!({ "nickname": "codex-1" }),
            )
            .unwrap();
        router
            .record_lifecycle(
                EventKind::Heartbeat,
                "subscriber.heartbeat",
                "codex:abc1",
                Value::Null,
            )
            .unwrap();

        // No mailbox delivery, but pull consumers see them.
        assert!(router.check("codex:abc1").is_empty());
        let result = router.consume("codex:abc1", false).unwrap();
        assert_eq!(result.consumed.len(), 2);
        assert_eq!(result.consumed[0].kind, EventKind::Join);
        assert_eq!(result.consumed[1].kind, EventKind::Heartbeat);
    }

    #[test]
    fn test_notify_system_lands_in_mailbox() {
        let (_temp, router) = router_in_temp();
        join(&router, "codex", "abc1");

        router
            .notify_system(
                "codex:abc1",
                "session.fallback",
                serde_json::json!({ "reason": "restart_exhausted" }),
            )
            .unwrap();

        let pending = router.check("codex:abc1");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, EventKind::System);
        assert_eq!(pending[0].publisher_id, crate::bus::CONTROLLER_ID);
    }
}
