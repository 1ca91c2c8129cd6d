//! Idle and heartbeat policy.
//!
//! Evaluated by each worker on a periodic tick, outside the read/write
//! paths. A session is idle when nothing has been read from it for the idle
//! timeout. Heartbeats are `hb=ping` frames sent to sessions that have been
//! quiet for the heartbeat interval; the peer engine answers `hb=pong`
//! itself, and neither frame reaches a handler.

use crate::config::Config;
use std::time::Duration;

/// Shortest worker tick, to bound wakeups for tiny timeouts.
const MIN_TICK: Duration = Duration::from_millis(10);

/// What a sweep should do with a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleAction {
    None,
    Heartbeat,
    Close,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdlePolicy {
    idle_timeout: Option<Duration>,
    heartbeat_interval: Option<Duration>,
}

impl IdlePolicy {
    pub fn new(idle_timeout: Option<Duration>, heartbeat_interval: Option<Duration>) -> Self {
        Self {
            idle_timeout,
            heartbeat_interval,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.idle_timeout(), config.heartbeat_interval())
    }

    pub fn is_enabled(&self) -> bool {
        self.idle_timeout.is_some() || self.heartbeat_interval.is_some()
    }

    /// How often workers should sweep, `None` when disabled.
    pub fn tick_interval(&self) -> Option<Duration> {
        let shortest = match (self.idle_timeout, self.heartbeat_interval) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => return None,
        };
        Some((shortest / 4).max(MIN_TICK))
    }

    /// Decide based on time since the last read and since the last heartbeat.
    pub fn check(&self, since_read: Duration, since_heartbeat: Duration) -> IdleAction {
        if let Some(timeout) = self.idle_timeout {
            if since_read >= timeout {
                return IdleAction::Close;
            }
        }
        if let Some(interval) = self.heartbeat_interval {
            if since_read >= interval && since_heartbeat >= interval {
                return IdleAction::Heartbeat;
            }
        }
        IdleAction::None
    }
}
