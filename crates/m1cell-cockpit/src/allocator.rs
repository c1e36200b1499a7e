//! [`CommandIdAllocator`] – fresh `command_id` values for one command window.
//!
//! Ids are seeded from wall-clock milliseconds mod 2^16 and walked forward
//! past every value that must not be reused:
//!
//! - `0` (means "no command"),
//! - values the caller says are live on the bus (the id currently in the
//!   slot, the id the bridge consumed last),
//! - ids this allocator handed out that are still in flight.
//!
//! An id stays in flight until it is released (the window was seen clear
//! after it) or the horizon passes.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// How long an unreleased id is kept out of circulation.
pub const IN_FLIGHT_HORIZON: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct CommandIdAllocator {
    in_flight: VecDeque<(u16, Instant)>,
    horizon: Duration,
}

impl Default for CommandIdAllocator {
    fn default() -> Self {
        Self::new(IN_FLIGHT_HORIZON)
    }
}

impl CommandIdAllocator {
    pub fn new(horizon: Duration) -> Self {
        Self {
            in_flight: VecDeque::new(),
            horizon,
        }
    }

    /// Allocate an id seeded from the wall clock.
    pub fn allocate(&mut self, avoid: &[u16], now: Instant) -> u16 {
        let seed = chrono::Utc::now().timestamp_millis().rem_euclid(1 << 16) as u16;
        self.allocate_from(seed, avoid, now)
    }

    /// Allocate the first usable id at or after `seed`.
    pub fn allocate_from(&mut self, seed: u16, avoid: &[u16], now: Instant) -> u16 {
        self.expire(now);
        let mut cid = seed;
        for _ in 0..=u16::MAX {
            if cid != 0 && !avoid.contains(&cid) && !self.is_in_flight(cid) {
                break;
            }
            cid = cid.wrapping_add(1);
        }
        self.in_flight.push_back((cid, now));
        cid
    }

    pub fn is_in_flight(&self, cid: u16) -> bool {
        self.in_flight.iter().any(|(id, _)| *id == cid)
    }

    pub fn release(&mut self, cid: u16) {
        self.in_flight.retain(|(id, _)| *id != cid);
    }

    /// The window read all zeros: every id handed out so far was consumed or
    /// overwritten.
    pub fn window_clear(&mut self) {
        self.in_flight.clear();
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn expire(&mut self, now: Instant) {
        while let Some((_, at)) = self.in_flight.front() {
            if now.saturating_duration_since(*at) < self.horizon {
                break;
            }
            self.in_flight.pop_front();
        }
    }
}
