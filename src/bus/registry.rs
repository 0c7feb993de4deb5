//! Subscriber identity, nickname, and liveness tracking.
//!
//! Records persist in a single JSON file so a supervising daemon and the
//! agents' own processes see one registry. Subscribers are marked inactive
//! by `leave` or liveness sweeps and only ever deleted by `unregister`.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::BusError;

/// Reserved singleton identity for the bus's own controller.
pub const CONTROLLER_ID: &str = "switchyard:controller";

/// Whether a subscriber is currently routable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriberStatus {
    Active,
    Inactive,
}

/// How the agent behind a subscriber was launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    Pty,
    Headless,
}

/// One registered agent. Identity is `"{agent_type}:{session_id}"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: String,
    pub agent_type: String,
    pub session_id: String,
    pub nickname: String,
    pub status: SubscriberStatus,
    pub launch_mode: LaunchMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tty_path: Option<String>,
    pub joined_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Subscriber {
    pub fn is_active(&self) -> bool {
        self.status == SubscriberStatus::Active
    }
}

/// Parameters for joining (or rejoining) the bus.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub agent_type: String,
    pub session_id: String,
    pub nickname: Option<String>,
    pub launch_mode: LaunchMode,
    pub pid: Option<u32>,
    pub tty_path: Option<String>,
}

/// File-backed registry of subscribers.
#[derive(Debug, Clone)]
pub struct SubscriberRegistry {
    path: PathBuf,
    stale_after: Duration,
}

impl SubscriberRegistry {
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            path: path.into(),
            stale_after,
        }
    }

    fn load(&self) -> BTreeMap<String, Subscriber> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "unreadable registry, starting empty");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        }
    }

    fn save(&self, map: &BTreeMap<String, Subscriber>) -> Result<(), BusError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(map)?)?;
        Ok(())
    }

    /// Join the bus. Rejoining an existing id preserves its nickname and
    /// join time and refreshes liveness.
    pub fn join(&self, request: JoinRequest) -> Result<Subscriber, BusError> {
        let mut map = self.load();
        let id = format!("{}:{}", request.agent_type, request.session_id);
        let now = Utc::now();

        let subscriber = match map.get(&id) {
            Some(existing) => Subscriber {
                status: SubscriberStatus::Active,
                launch_mode: request.launch_mode,
                pid: request.pid,
                tty_path: request.tty_path,
                last_heartbeat: now,
                ..existing.clone()
            },
            None => {
                let nickname = request
                    .nickname
                    .unwrap_or_else(|| next_nickname(&map, &request.agent_type));
                Subscriber {
                    id: id.clone(),
                    agent_type: request.agent_type,
                    session_id: request.session_id,
                    nickname,
                    status: SubscriberStatus::Active,
                    launch_mode: request.launch_mode,
                    pid: request.pid,
                    tty_path: request.tty_path,
                    joined_at: now,
                    last_heartbeat: now,
                }
            }
        };

        debug!(id = %subscriber.id, nickname = %subscriber.nickname, "subscriber joined");
        map.insert(id, subscriber.clone());
        self.save(&map)?;
        Ok(subscriber)
    }

    /// Flip a subscriber inactive. The record stays for later rejoin.
    pub fn leave(&self, id: &str) -> Result<(), BusError> {
        let mut map = self.load();
        let subscriber = map
            .get_mut(id)
            .ok_or_else(|| BusError::UnknownSubscriber(id.to_string()))?;
        subscriber.status = SubscriberStatus::Inactive;
        self.save(&map)
    }

    /// Refresh a subscriber's liveness timestamp.
    pub fn heartbeat(&self, id: &str) -> Result<(), BusError> {
        let mut map = self.load();
        let subscriber = map
            .get_mut(id)
            .ok_or_else(|| BusError::UnknownSubscriber(id.to_string()))?;
        subscriber.last_heartbeat = Utc::now();
        self.save(&map)
    }

    /// Mark subscribers with stale heartbeats inactive. Records are never
    /// deleted here. Returns the ids swept.
    pub fn sweep(&self) -> Result<Vec<String>, BusError> {
        let mut map = self.load();
        let now = Utc::now();
        let stale = chrono::Duration::from_std(self.stale_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(90));

        let mut swept = Vec::new();
        for subscriber in map.values_mut() {
            if subscriber.is_active() && now - subscriber.last_heartbeat > stale {
                subscriber.status = SubscriberStatus::Inactive;
                swept.push(subscriber.id.clone());
            }
        }
        if !swept.is_empty() {
            warn!(count = swept.len(), "liveness sweep marked subscribers inactive");
            self.save(&map)?;
        }
        Ok(swept)
    }

    /// Remove a record outright. The only true deletion path.
    pub fn unregister(&self, id: &str) -> Result<bool, BusError> {
        let mut map = self.load();
        let removed = map.remove(id).is_some();
        if removed {
            self.save(&map)?;
        }
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> Option<Subscriber> {
        self.load().get(id).cloned()
    }

    /// All records, active or not.
    pub fn snapshot(&self) -> Vec<Subscriber> {
        self.load().into_values().collect()
    }

    /// Active subscribers only.
    pub fn active(&self) -> Vec<Subscriber> {
        self.load()
            .into_values()
            .filter(Subscriber::is_active)
            .collect()
    }
}

/// Smallest unused `{type}-{n}` nickname among active subscribers.
fn next_nickname(map: &BTreeMap<String, Subscriber>, agent_type: &str) -> String {
    let taken: Vec<&str> = map
        .values()
        .filter(|s| s.is_active())
        .map(|s| s.nickname.as_str())
        .collect();
    let mut n = 1;
    loop {
        let candidate = format!("{}-{}", agent_type, n);
        if !taken.contains(&candidate.as_str()) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry_in_temp() -> (TempDir, SubscriberRegistry) {
        let temp = TempDir::new().unwrap();
        let registry = SubscriberRegistry::new(
            temp.path().join("subscribers.json"),
            Duration::from_secs(90),
        );
        (temp, registry)
    }

    fn join_request(agent_type: &str, session_id: &str) -> JoinRequest {
        JoinRequest {
            agent_type: agent_type.to_string(),
            session_id: session_id.to_string(),
            nickname: None,
            launch_mode: LaunchMode::Pty,
            pid: Some(1234),
            tty_path: None,
        }
    }

    #[test]
    fn test_join_assigns_id_and_nickname() {
        let (_temp, registry) = registry_in_temp();
        let sub = registry.join(join_request("codex", "abc1")).unwrap();
        assert_eq!(sub.id, "codex:abc1");
        assert_eq!(sub.nickname, "codex-1");
        assert!(sub.is_active());
    }

    #[test]
    fn test_nicknames_increment_per_type() {
        let (_temp, registry) = registry_in_temp();
        let a = registry.join(join_request("codex", "abc1")).unwrap();
        let b = registry.join(join_request("codex", "abc2")).unwrap();
        assert_eq!(a.nickname, "codex-1");
        assert_eq!(b.nickname, "codex-2");
    }

    #[test]
    fn test_rejoin_preserves_nickname_and_join_time() {
        let (_temp, registry) = registry_in_temp();
        let first = registry.join(join_request("codex", "abc1")).unwrap();
        registry.leave("codex:abc1").unwrap();

        let mut again = join_request("codex", "abc1");
        again.nickname = Some("ignored".to_string());
        again.pid = Some(9999);
        let rejoined = registry.join(again).unwrap();

        assert_eq!(rejoined.nickname, first.nickname);
        assert_eq!(rejoined.joined_at, first.joined_at);
        assert_eq!(rejoined.pid, Some(9999));
        assert!(rejoined.is_active());
    }

    #[test]
    fn test_leave_marks_inactive_without_deleting() {
        let (_temp, registry) = registry_in_temp();
        registry.join(join_request("codex", "abc1")).unwrap();
        registry.leave("codex:abc1").unwrap();

        let sub = registry.get("codex:abc1").unwrap();
        assert_eq!(sub.status, SubscriberStatus::Inactive);
        assert!(registry.active().is_empty());
    }

    #[test]
    fn test_leave_unknown_subscriber() {
        let (_temp, registry) = registry_in_temp();
        assert!(matches!(
            registry.leave("codex:none"),
            Err(BusError::UnknownSubscriber(_))
        ));
    }

    #[test]
    fn test_sweep_marks_stale_inactive() {
        let temp = TempDir::new().unwrap();
        let registry = SubscriberRegistry::new(
            temp.path().join("subscribers.json"),
            Duration::from_secs(0),
        );
        registry.join(join_request("codex", "abc1")).unwrap();

        let swept = registry.sweep().unwrap();
        assert_eq!(swept, vec!["codex:abc1".to_string()]);
        assert!(registry.get("codex:abc1").is_some());
        assert!(registry.active().is_empty());
    }

    #[test]
    fn test_heartbeat_keeps_subscriber_alive() {
        let (_temp, registry) = registry_in_temp();
        let before = registry.join(join_request("codex", "abc1")).unwrap();
        registry.heartbeat("codex:abc1").unwrap();
        let after = registry.get("codex:abc1").unwrap();
        assert!(after.last_heartbeat >= before.last_heartbeat);
    }

    #[test]
    fn test_unregister_deletes_record() {
        let (_temp, registry) = registry_in_temp();
        registry.join(join_request("codex", "abc1")).unwrap();
        assert!(registry.unregister("codex:abc1").unwrap());
        assert!(registry.get("codex:abc1").is_none());
        assert!(!registry.unregister("codex:abc1").unwrap());
    }
}
