//! Presence tracking for the room roster, remote cursors, and avatars.
//!
//! Presence is ephemeral and lives outside the shape collection. Each client
//! refreshes its own record with a heartbeat; everyone else judges liveness
//! by the age of `last_seen_at_millis` against three thresholds: a short one
//! for cursor visibility, an idle marker, and a long one for the roster.

use crate::clock::SharedClock;
use crate::config::PresenceConfig;
use crate::shapes::ClientId;
use kurbo::Point;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Whether an avatar is in play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AvatarMode {
    #[default]
    Alive,
    Dead,
}

/// Exported position of a client's avatar.
///
/// Physics stepping happens elsewhere; only its periodic output is shared.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvatarState {
    pub x: f64,
    pub y: f64,
    pub vx: f64,
    pub vy: f64,
    pub on_ground: bool,
    #[serde(default)]
    pub state: AvatarMode,
}

impl AvatarState {
    pub fn position(&self) -> Point {
        Point::new(self.x, self.y)
    }
}

/// One client's presence document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub client_id: ClientId,
    pub display_name: String,
    pub color: String,
    #[serde(default)]
    pub logged_in: bool,
    /// Server-assigned on the remote side; local clock otherwise.
    #[serde(default)]
    pub last_seen_at_millis: u64,
    #[serde(default)]
    pub cursor: Option<Point>,
    #[serde(default)]
    pub avatar: Option<AvatarState>,
}

impl PresenceRecord {
    pub fn new(
        client_id: impl Into<ClientId>,
        display_name: impl Into<String>,
        color: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            display_name: display_name.into(),
            color: color.into(),
            logged_in: true,
            last_seen_at_millis: 0,
            cursor: None,
            avatar: None,
        }
    }

    /// Milliseconds since the record was last refreshed. Timestamps from the
    /// future count as fresh.
    pub fn age_millis(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_seen_at_millis)
    }
}

/// Liveness of a client as seen from here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Active,
    Idle,
    Gone,
}

/// A roster line.
#[derive(Debug, Clone, PartialEq)]
pub struct RosterEntry {
    pub client_id: ClientId,
    pub display_name: String,
    pub color: String,
    pub idle: bool,
    pub is_self: bool,
}

/// Tracks the presence records of everyone in the room.
pub struct PresenceRegistry {
    local_client: ClientId,
    clock: SharedClock,
    config: PresenceConfig,
    records: HashMap<ClientId, PresenceRecord>,
}

impl PresenceRegistry {
    pub fn new(local_client: impl Into<ClientId>, clock: SharedClock, config: PresenceConfig) -> Self {
        Self {
            local_client: local_client.into(),
            clock,
            config,
            records: HashMap::new(),
        }
    }

    pub fn local_client(&self) -> &str {
        &self.local_client
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// Create or refresh a record with `last_seen = now`.
    pub fn heartbeat(&mut self, client_id: &str, display_name: &str, color: &str) -> &PresenceRecord {
        let now = self.clock.now_millis();
        let record = self
            .records
            .entry(client_id.to_string())
            .or_insert_with(|| PresenceRecord::new(client_id, display_name, color));
        record.display_name = display_name.to_string();
        record.color = color.to_string();
        record.logged_in = true;
        record.last_seen_at_millis = now;
        record
    }

    pub fn get(&self, client_id: &str) -> Option<&PresenceRecord> {
        self.records.get(client_id)
    }

    /// Records seen within `ttl_millis`, ordered by client id.
    pub fn list_active(&self, ttl_millis: u64) -> Vec<&PresenceRecord> {
        let now = self.clock.now_millis();
        let mut active: Vec<&PresenceRecord> = self
            .records
            .values()
            .filter(|r| r.age_millis(now) <= ttl_millis)
            .collect();
        active.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        active
    }

    /// Ids of clients seen within `ttl_millis`.
    pub fn active_ids(&self, ttl_millis: u64) -> HashSet<ClientId> {
        self.list_active(ttl_millis)
            .into_iter()
            .map(|r| r.client_id.clone())
            .collect()
    }

    /// Ids of clients still in the room, as used for lock reconciliation.
    pub fn roster_ids(&self) -> HashSet<ClientId> {
        self.active_ids(self.config.roster_ttl_ms)
    }

    /// Graceful removal.
    pub fn remove(&mut self, client_id: &str) -> Option<PresenceRecord> {
        self.records.remove(client_id)
    }

    /// Drop records older than `ttl_millis` and return their ids.
    pub fn expire(&mut self, ttl_millis: u64) -> Vec<ClientId> {
        let now = self.clock.now_millis();
        let mut expired: Vec<ClientId> = self
            .records
            .values()
            .filter(|r| r.age_millis(now) > ttl_millis)
            .map(|r| r.client_id.clone())
            .collect();
        for id in &expired {
            self.records.remove(id);
        }
        expired.sort();
        expired
    }

    /// Replace the registry with a presence-collection snapshot.
    ///
    /// Remote timestamps are authoritative. The local client's own cursor is
    /// kept as-is since the remote copy lags behind it.
    pub fn apply_remote(&mut self, records: Vec<PresenceRecord>) {
        let local = self.records.remove(&self.local_client);
        self.records = records
            .into_iter()
            .map(|r| (r.client_id.clone(), r))
            .collect();
        if let (Some(local), Some(remote)) = (local, self.records.get_mut(&self.local_client)) {
            remote.cursor = local.cursor;
            remote.avatar = local.avatar;
        }
    }

    pub fn set_cursor(&mut self, client_id: &str, cursor: Option<Point>) {
        if let Some(record) = self.records.get_mut(client_id) {
            record.cursor = cursor;
        }
    }

    pub fn status(&self, client_id: &str) -> PresenceStatus {
        let now = self.clock.now_millis();
        match self.records.get(client_id).map(|r| r.age_millis(now)) {
            Some(age) if age <= self.config.idle_after_ms => PresenceStatus::Active,
            Some(age) if age <= self.config.roster_ttl_ms => PresenceStatus::Idle,
            _ => PresenceStatus::Gone,
        }
    }

    /// Who is in the room, sorted by display name. Records that were never
    /// stamped with a last-seen time are left out.
    pub fn roster(&self) -> Vec<RosterEntry> {
        let now = self.clock.now_millis();
        let mut entries: Vec<RosterEntry> = self
            .list_active(self.config.roster_ttl_ms)
            .into_iter()
            .filter(|r| r.last_seen_at_millis > 0)
            .map(|r| RosterEntry {
                client_id: r.client_id.clone(),
                display_name: if r.display_name.trim().is_empty() {
                    r.client_id.chars().take(4).collect()
                } else {
                    r.display_name.clone()
                },
                color: r.color.clone(),
                idle: r.age_millis(now) > self.config.idle_after_ms,
                is_self: r.client_id == self.local_client,
            })
            .collect();
        entries.sort_by(|a, b| a.display_name.cmp(&b.display_name).then_with(|| a.client_id.cmp(&b.client_id)));
        entries
    }

    /// Other clients whose cursor should be drawn.
    pub fn remote_cursors(&self) -> Vec<&PresenceRecord> {
        self.list_active(self.config.cursor_ttl_ms)
            .into_iter()
            .filter(|r| r.client_id != self.local_client && r.cursor.is_some())
            .collect()
    }

    /// Other clients whose avatar should be drawn.
    pub fn remote_avatars(&self) -> Vec<&PresenceRecord> {
        self.list_active(self.config.cursor_ttl_ms)
            .into_iter()
            .filter(|r| r.client_id != self.local_client)
            .filter(|r| r.avatar.as_ref().is_some_and(|a| a.state == AvatarMode::Alive))
            .collect()
    }
}

/// Cursor and avatar values to publish.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PresenceUpdate {
    pub cursor: Option<Point>,
    pub avatar: Option<AvatarState>,
}

/// Rate limiter for the local client's cursor/avatar publications.
///
/// A publication goes out when the interval has passed since the last one
/// and the cursor or avatar moved more than the threshold on either axis.
/// Skipped values are remembered so a later [`flush`](Self::flush) can
/// publish the final position once motion stops.
#[derive(Debug)]
pub struct PresencePublisher {
    interval_ms: u64,
    threshold: f64,
    last_publish_at: Option<u64>,
    published: PresenceUpdate,
    latest: PresenceUpdate,
}

impl PresencePublisher {
    pub fn new(interval_ms: u64, threshold: f64) -> Self {
        Self {
            interval_ms,
            threshold,
            last_publish_at: None,
            published: PresenceUpdate::default(),
            latest: PresenceUpdate::default(),
        }
    }

    pub fn from_config(config: &PresenceConfig) -> Self {
        Self::new(config.publish_interval_ms, config.move_threshold)
    }

    /// Record a new cursor position; returns the update to publish, if any.
    pub fn offer_cursor(&mut self, now: u64, cursor: Point) -> Option<PresenceUpdate> {
        self.latest.cursor = Some(cursor);
        self.flush(now)
    }

    /// Record a new avatar export; dead avatars are withdrawn.
    pub fn offer_avatar(&mut self, now: u64, avatar: AvatarState) -> Option<PresenceUpdate> {
        self.latest.avatar = (avatar.state == AvatarMode::Alive).then_some(avatar);
        self.flush(now)
    }

    /// Publish the latest values if the interval allows and they moved.
    pub fn flush(&mut self, now: u64) -> Option<PresenceUpdate> {
        if let Some(last) = self.last_publish_at {
            if now.saturating_sub(last) < self.interval_ms {
                return None;
            }
        }
        if !self.has_changes() {
            return None;
        }
        self.last_publish_at = Some(now);
        self.published = self.latest.clone();
        Some(self.latest.clone())
    }

    fn has_changes(&self) -> bool {
        let cursor_moved = match (self.latest.cursor, self.published.cursor) {
            (Some(next), Some(prev)) => self.moved(next, prev),
            (Some(_), None) => true,
            _ => false,
        };
        let avatar_moved = match (&self.latest.avatar, &self.published.avatar) {
            (Some(next), Some(prev)) => self.moved(next.position(), prev.position()),
            (None, None) => false,
            _ => true,
        };
        cursor_moved || avatar_moved
    }

    fn moved(&self, next: Point, prev: Point) -> bool {
        (next.x - prev.x).abs() > self.threshold || (next.y - prev.y).abs() > self.threshold
    }
}
