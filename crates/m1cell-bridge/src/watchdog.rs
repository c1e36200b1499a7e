//! [`Watchdog`] – link liveness monitor.
//!
//! The fast loop feeds a heartbeat for a link on every successful
//! transaction.  A link whose heartbeat is older than its deadline is
//! *silent*: the bridge treats a silent device like a lost one and reopens
//! it.
//!
//! Time is taken from [`tokio::time::Instant`] and passed in explicitly, so
//! tests can drive it with a paused clock.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Health of one watched link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkHealth {
    Alive,
    Silent,
    /// Never armed, or disarmed after the link was dropped.
    Unwatched,
}

struct Deadline {
    last_heartbeat: Instant,
    timeout: Duration,
}

#[derive(Default)]
pub struct Watchdog {
    links: HashMap<&'static str, Deadline>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start watching `link`, counting from `now`.  Re-arming resets the
    /// deadline.
    pub fn arm(&mut self, link: &'static str, timeout: Duration, now: Instant) {
        self.links.insert(
            link,
            Deadline {
                last_heartbeat: now,
                timeout,
            },
        );
    }

    /// Stop watching `link`.
    pub fn disarm(&mut self, link: &'static str) {
        self.links.remove(link);
    }

    pub fn heartbeat(&mut self, link: &'static str, now: Instant) {
        if let Some(d) = self.links.get_mut(link) {
            d.last_heartbeat = now;
        }
    }

    pub fn health(&self, link: &'static str, now: Instant) -> LinkHealth {
        match self.links.get(link) {
            None => LinkHealth::Unwatched,
            Some(d) if now.saturating_duration_since(d.last_heartbeat) <= d.timeout => {
                LinkHealth::Alive
            }
            Some(_) => LinkHealth::Silent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn armed_link_is_alive_until_deadline() {
        let t0 = Instant::now();
        let mut wd = Watchdog::new();
        wd.arm("device", 100 * MS, t0);
        assert_eq!(wd.health("device", t0 + 100 * MS), LinkHealth::Alive);
        assert_eq!(wd.health("device", t0 + 101 * MS), LinkHealth::Silent);
    }

    #[test]
    fn heartbeat_pushes_deadline() {
        let t0 = Instant::now();
        let mut wd = Watchdog::new();
        wd.arm("device", 100 * MS, t0);
        wd.heartbeat("device", t0 + 80 * MS);
        assert_eq!(wd.health("device", t0 + 150 * MS), LinkHealth::Alive);
        assert_eq!(wd.health("device", t0 + 181 * MS), LinkHealth::Silent);
    }

    #[test]
    fn disarmed_and_unknown_links_are_unwatched() {
        let t0 = Instant::now();
        let mut wd = Watchdog::new();
        wd.arm("device", MS, t0);
        wd.disarm("device");
        wd.heartbeat("device", t0);
        assert_eq!(wd.health("device", t0 + 10 * MS), LinkHealth::Unwatched);
        assert_eq!(wd.health("bus", t0), LinkHealth::Unwatched);
    }
}
