/// Hysteretic UP/DOWN tracking of the panel, plus the gates that decide
/// when a network-wide discovery scan is allowed.
///
/// All timing flows through `Instant` parameters instead of internal clock
/// reads, which keeps the transitions testable and immune to wall-clock
/// jumps. Only the cache file and the router snapshot use wall-clock time.

use std::fmt;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    #[serde(rename = "UP")]
    Up,
    #[serde(rename = "DOWN")]
    Down,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Up => f.write_str("UP"),
            Mode::Down => f.write_str("DOWN"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    CameUp,
    WentDown,
}

pub struct Availability {
    mode: Mode,
    target_ip: Option<Ipv4Addr>,
    ok_streak: u32,
    fail_streak: u32,
    down_since: Option<Instant>,
    last_discovery: Option<Instant>,

    fails_to_down: u32,
    oks_to_up: u32,
    recovery_window: Duration,
    discovery_cooldown: Duration,
}

impl Availability {
    pub fn new(cfg: &Config, initial_target: Option<Ipv4Addr>) -> Self {
        Self {
            mode: Mode::Down,
            target_ip: initial_target,
            ok_streak: 0,
            fail_streak: 0,
            down_since: None,
            last_discovery: None,
            fails_to_down: cfg.fails_to_down.max(1),
            oks_to_up: cfg.oks_to_up.max(1),
            recovery_window: cfg.recovery_window(),
            discovery_cooldown: cfg.discovery_cooldown(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn target_ip(&self) -> Option<Ipv4Addr> {
        self.target_ip
    }

    pub fn ok_streak(&self) -> u32 {
        self.ok_streak
    }

    pub fn fail_streak(&self) -> u32 {
        self.fail_streak
    }

    pub fn down_since(&self) -> Option<Instant> {
        self.down_since
    }

    /// Feed one probe outcome into the state machine.
    pub fn observe(&mut self, ok: bool, now: Instant) -> Option<Transition> {
        if ok {
            self.ok_streak += 1;
            self.fail_streak = 0;
        } else {
            self.fail_streak += 1;
            self.ok_streak = 0;
        }

        let next = if self.fail_streak >= self.fails_to_down {
            Mode::Down
        } else if self.ok_streak >= self.oks_to_up {
            Mode::Up
        } else {
            self.mode
        };

        let transition = match (self.mode, next) {
            (Mode::Down, Mode::Up) => {
                self.down_since = None;
                Some(Transition::CameUp)
            }
            (Mode::Up, Mode::Down) => Some(Transition::WentDown),
            _ => None,
        };
        self.mode = next;

        // The current DOWN episode is anchored at its first DOWN tick.
        if self.mode == Mode::Down && self.down_since.is_none() {
            self.down_since = Some(now);
        }

        transition
    }

    /// Whether the post-failure recovery window is still holding discovery
    /// back so only the last known target gets probed.
    pub fn in_recovery_window(&self, now: Instant) -> bool {
        match self.down_since {
            Some(since) if self.target_ip.is_some() => {
                now.duration_since(since) < self.recovery_window
            }
            _ => false,
        }
    }

    /// Whether a discovery scan may run now. The recovery window takes
    /// precedence; after it, the cooldown between scans applies.
    pub fn may_discover(&self, now: Instant) -> bool {
        if self.in_recovery_window(now) {
            return false;
        }
        match self.last_discovery {
            Some(last) => now.duration_since(last) >= self.discovery_cooldown,
            None => true,
        }
    }

    /// Advance the cooldown. Called for every scan attempt, successful or
    /// not, so an empty network cannot trigger scan storms.
    pub fn note_discovery_attempt(&mut self, now: Instant) {
        self.last_discovery = Some(now);
    }

    /// Adopt a freshly discovered target. Clears the DOWN anchor so the
    /// next ticks probe the new address and build an ok streak.
    pub fn adopt_target(&mut self, ip: Ipv4Addr) {
        self.target_ip = Some(ip);
        self.down_since = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(fails_to_down: u32, oks_to_up: u32) -> Config {
        Config {
            fails_to_down,
            oks_to_up,
            recovery_window_sec: 12.0,
            discovery_cooldown_sec: 90.0,
            ..Config::default()
        }
    }

    fn target() -> Option<Ipv4Addr> {
        Some(Ipv4Addr::new(10, 0, 0, 5))
    }

    #[test]
    fn streaks_are_mutually_exclusive() {
        let mut avail = Availability::new(&cfg(3, 2), target());
        let t0 = Instant::now();
        for (i, ok) in [true, true, false, true, false, false, true].iter().enumerate() {
            avail.observe(*ok, t0 + Duration::from_secs(i as u64));
            assert_eq!(avail.ok_streak() * avail.fail_streak(), 0);
        }
    }

    #[test]
    fn comes_up_after_exactly_oks_to_up() {
        let mut avail = Availability::new(&cfg(3, 2), target());
        let t0 = Instant::now();
        assert_eq!(avail.observe(true, t0), None);
        assert_eq!(avail.mode(), Mode::Down);
        assert_eq!(avail.observe(true, t0), Some(Transition::CameUp));
        assert_eq!(avail.mode(), Mode::Up);
        assert_eq!(avail.down_since(), None);
    }

    #[test]
    fn goes_down_after_exactly_fails_to_down() {
        let mut avail = Availability::new(&cfg(3, 2), target());
        let t0 = Instant::now();
        avail.observe(true, t0);
        avail.observe(true, t0);
        assert_eq!(avail.mode(), Mode::Up);

        avail.observe(false, t0);
        avail.observe(false, t0);
        assert_eq!(avail.mode(), Mode::Up);
        let t_down = t0 + Duration::from_secs(4);
        assert_eq!(avail.observe(false, t_down), Some(Transition::WentDown));
        assert_eq!(avail.mode(), Mode::Down);
        assert_eq!(avail.down_since(), Some(t_down));
    }

    #[test]
    fn flapping_below_threshold_stays_up() {
        // ok, fail, ok, fail, fail, ok with fails_to_down = 3
        let mut avail = Availability::new(&cfg(3, 1), target());
        let t0 = Instant::now();
        avail.observe(true, t0);
        assert_eq!(avail.mode(), Mode::Up);
        for ok in [false, true, false, false, true] {
            avail.observe(ok, t0);
            assert_eq!(avail.mode(), Mode::Up);
        }
    }

    #[test]
    fn thresholds_of_one_follow_every_probe() {
        let mut avail = Availability::new(&cfg(1, 1), target());
        let t0 = Instant::now();
        assert_eq!(avail.observe(true, t0), Some(Transition::CameUp));
        assert_eq!(avail.observe(false, t0), Some(Transition::WentDown));
        assert_eq!(avail.observe(true, t0), Some(Transition::CameUp));
    }

    #[test]
    fn recovery_window_suppresses_discovery_with_target() {
        let mut avail = Availability::new(&cfg(3, 2), target());
        let t0 = Instant::now();
        // Up, then three failures at t=0, 2, 4
        avail.observe(true, t0);
        avail.observe(true, t0);
        avail.observe(false, t0);
        avail.observe(false, t0 + Duration::from_secs(2));
        avail.observe(false, t0 + Duration::from_secs(4));
        assert_eq!(avail.mode(), Mode::Down);

        // t=6: inside the 12 s window anchored at t=4
        assert!(avail.in_recovery_window(t0 + Duration::from_secs(6)));
        assert!(!avail.may_discover(t0 + Duration::from_secs(6)));
        // t=20: window expired, no previous scan
        assert!(!avail.in_recovery_window(t0 + Duration::from_secs(20)));
        assert!(avail.may_discover(t0 + Duration::from_secs(20)));
    }

    #[test]
    fn recovery_window_does_not_apply_without_target() {
        let mut avail = Availability::new(&cfg(3, 2), None);
        let t0 = Instant::now();
        avail.observe(false, t0);
        assert_eq!(avail.down_since(), Some(t0));
        assert!(!avail.in_recovery_window(t0));
        assert!(avail.may_discover(t0));
    }

    #[test]
    fn cooldown_advances_even_when_scan_finds_nothing() {
        let mut avail = Availability::new(&cfg(3, 2), None);
        let t0 = Instant::now();
        avail.observe(false, t0);
        assert!(avail.may_discover(t0));
        avail.note_discovery_attempt(t0);

        assert!(!avail.may_discover(t0 + Duration::from_secs(30)));
        assert!(avail.may_discover(t0 + Duration::from_secs(90)));
    }

    #[test]
    fn adopting_a_target_clears_the_down_anchor() {
        let mut avail = Availability::new(&cfg(3, 2), None);
        let t0 = Instant::now();
        avail.observe(false, t0);
        assert!(avail.down_since().is_some());

        avail.adopt_target(Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(avail.target_ip(), Some(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(avail.down_since(), None);
        assert_eq!(avail.mode(), Mode::Down);

        // the next two good probes bring it up
        avail.observe(true, t0 + Duration::from_secs(2));
        assert_eq!(
            avail.observe(true, t0 + Duration::from_secs(4)),
            Some(Transition::CameUp)
        );
    }
}
