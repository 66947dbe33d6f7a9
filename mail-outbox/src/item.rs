use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;
use zeroize::Zeroize;

use crate::clock::UnixTimeMs;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Opaque item identifier, assigned at enqueue time.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId(String);

impl ItemId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Priority class. Declaration order is dispatch order: `High` drains first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub const fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message content plus delivery context. The queue never looks inside.
///
/// Carries provider credentials, so `Debug` is redacted and the bytes are
/// wiped when the value is dropped.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload(#[serde(with = "serde_bytes")] Vec<u8>);

impl Payload {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn from_json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_vec(value).map(Self)
    }

    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload([REDACTED; {} bytes])", self.0.len())
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Explicit per-item state. Transitions happen only in [`QueueItem`] methods.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemState {
    Pending,
    TerminalFailed,
}

impl ItemState {
    pub const fn state_name(self) -> &'static str {
        match self {
            ItemState::Pending => "pending",
            ItemState::TerminalFailed => "terminal_failed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, ItemState::TerminalFailed)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueItem {
    pub id: ItemId,
    pub payload: Payload,
    pub priority: Priority,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: UnixTimeMs,
    pub last_attempt_at: Option<UnixTimeMs>,
    pub next_retry_at: UnixTimeMs,
    pub last_error: Option<String>,
    pub state: ItemState,
}

impl QueueItem {
    const MAX_ERROR_LENGTH: usize = 512;

    /// New pending item, eligible immediately. `max_attempts` is raised to 1 if zero.
    pub fn new(payload: Payload, priority: Priority, max_attempts: u32, now: UnixTimeMs) -> Self {
        Self {
            id: ItemId::generate(),
            payload,
            priority,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            created_at: now,
            last_attempt_at: None,
            next_retry_at: now,
            last_error: None,
            state: ItemState::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Pending and due at `now`.
    pub fn is_ready(&self, now: UnixTimeMs) -> bool {
        matches!(self.state, ItemState::Pending) && self.next_retry_at <= now
    }

    pub fn is_expired(&self, now: UnixTimeMs, expiry_window_ms: u64) -> bool {
        now.elapsed_since(self.created_at) > expiry_window_ms
    }

    /// Apply one failed attempt.
    ///
    /// `delay_for` receives the attempt count after this failure and is only
    /// consulted when the item stays pending.
    pub fn record_failure(
        &mut self,
        now: UnixTimeMs,
        error: Option<String>,
        delay_for: impl FnOnce(u32) -> Duration,
    ) -> ItemState {
        if self.is_terminal() {
            return self.state;
        }

        self.attempts = self.attempts.saturating_add(1).min(self.max_attempts);
        self.last_attempt_at = Some(now);
        self.last_error = Some(truncate_error(
            error.unwrap_or_else(|| "delivery failed".to_string()),
        ));

        if self.attempts >= self.max_attempts {
            self.state = ItemState::TerminalFailed;
        } else {
            let candidate = now.add_duration(delay_for(self.attempts));
            self.next_retry_at = self.next_retry_at.max(candidate);
        }

        self.state
    }

    /// Reset a terminal item for another full round of attempts.
    pub fn requeue(&mut self, now: UnixTimeMs) -> bool {
        if !self.is_terminal() {
            return false;
        }
        self.attempts = 0;
        self.last_attempt_at = None;
        self.next_retry_at = self.next_retry_at.max(now);
        self.state = ItemState::Pending;
        true
    }

    /// Structural check applied to items read back from storage.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.id.as_str().trim().is_empty() {
            return Err("empty id");
        }
        if self.max_attempts == 0 {
            return Err("max_attempts is zero");
        }
        if self.attempts > self.max_attempts {
            return Err("attempts exceed max_attempts");
        }
        match self.state {
            ItemState::Pending if self.attempts == self.max_attempts => {
                Err("pending item has exhausted its attempts")
            }
            ItemState::TerminalFailed if self.attempts < self.max_attempts => {
                Err("terminal item still has attempts left")
            }
            _ => Ok(()),
        }
    }
}

fn truncate_error(mut s: String) -> String {
    if s.len() <= QueueItem::MAX_ERROR_LENGTH {
        return s;
    }

    let mut truncate_at = QueueItem::MAX_ERROR_LENGTH;
    while truncate_at > 0 && !s.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }
    s.truncate(truncate_at);
    s
}
