//! Session tracker (C9): per-account rolling history, trust score and
//! rate limiting, sharded via `dashmap` to avoid a single hot lock.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::arbiter::ThreatType;
use crate::config::SessionConfig;
use crate::fingerprint::HardwareId;

/// Per-`EventKind` cap on buffered timestamps. Action/packet traffic is
/// high-volume and only needs to cover the rate-limit window; warnings and
/// confirmed violations are rare and worth keeping longer for history.
fn history_cap(kind: EventKind) -> usize {
    match kind {
        EventKind::Action | EventKind::Packet => 512,
        EventKind::Warning | EventKind::Suspicious => 128,
    }
}

const EVENT_KINDS: [EventKind; 4] = [EventKind::Action, EventKind::Packet, EventKind::Warning, EventKind::Suspicious];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Action,
    Packet,
    Warning,
    Suspicious,
}

#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub kind: EventKind,
    pub at: Instant,
}

/// Counts of a single event kind over three trailing windows, derived from
/// the rolling history rather than maintained incrementally, so they're
/// always consistent with whatever is still buffered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollingCounts {
    pub minute: u32,
    pub hour: u32,
    pub day: u32,
}

pub struct Session {
    pub account_id: u32,
    pub character_id: u32,
    pub ip: String,
    pub hardware_id: Option<HardwareId>,
    pub client_version: String,
    pub started_at: Instant,
    pub last_activity: Instant,
    pub rolling_history: HashMap<EventKind, VecDeque<Instant>>,
    pub trust_score: f32,
    pub warnings: u32,
    pub suspicious_count: u32,
    pub monitored: bool,
    pub violations_by_type: HashMap<ThreatType, u32>,
}

impl Session {
    fn new(account_id: u32, character_id: u32, ip: String, client_version: String) -> Self {
        let now = Instant::now();
        let mut rolling_history = HashMap::new();
        for kind in EVENT_KINDS {
            rolling_history.insert(kind, VecDeque::with_capacity(history_cap(kind)));
        }
        Self {
            account_id,
            character_id,
            ip,
            hardware_id: None,
            client_version,
            started_at: now,
            last_activity: now,
            rolling_history,
            trust_score: 1.0,
            warnings: 0,
            suspicious_count: 0,
            monitored: false,
            violations_by_type: HashMap::new(),
        }
    }

    fn push_event(&mut self, kind: EventKind) {
        let cap = history_cap(kind);
        let bucket = self.rolling_history.entry(kind).or_insert_with(|| VecDeque::with_capacity(cap));
        if bucket.len() >= cap {
            bucket.pop_front();
        }
        bucket.push_back(Instant::now());
        self.last_activity = Instant::now();
    }

    fn count_since(&self, kind: EventKind, window: Duration) -> u32 {
        let cutoff = Instant::now() - window;
        self.rolling_history
            .get(&kind)
            .map(|bucket| bucket.iter().filter(|at| **at >= cutoff).count() as u32)
            .unwrap_or(0)
    }

    pub fn rolling_counts(&self, kind: EventKind) -> RollingCounts {
        RollingCounts {
            minute: self.count_since(kind, Duration::from_secs(60)),
            hour: self.count_since(kind, Duration::from_secs(3600)),
            day: self.count_since(kind, Duration::from_secs(86400)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HistorySummary {
    pub violations_by_type: HashMap<ThreatType, u32>,
    pub total_violations: u32,
    pub warnings: u32,
    pub suspicious_count: u32,
}

pub struct SessionTracker {
    sessions: DashMap<u32, Session>,
    config: SessionConfig,
}

impl SessionTracker {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
        }
    }

    pub fn start_session(&self, account_id: u32, character_id: u32, ip: &str, client_version: &str) {
        self.sessions.insert(
            account_id,
            Session::new(account_id, character_id, ip.to_string(), client_version.to_string()),
        );
    }

    pub fn end_session(&self, account_id: u32) {
        self.sessions.remove(&account_id);
    }

    pub fn record_action(&self, account_id: u32) {
        if let Some(mut s) = self.sessions.get_mut(&account_id) {
            s.push_event(EventKind::Action);
        }
    }

    pub fn record_packet(&self, account_id: u32) {
        if let Some(mut s) = self.sessions.get_mut(&account_id) {
            s.push_event(EventKind::Packet);
        }
    }

    pub fn is_rate_limited(&self, account_id: u32, kind: EventKind) -> bool {
        self.sessions
            .get(&account_id)
            .map(|s| s.count_since(kind, Duration::from_secs(60)) > self.config.max_actions_per_minute)
            .unwrap_or(false)
    }

    pub fn rolling_counts(&self, account_id: u32, kind: EventKind) -> RollingCounts {
        self.sessions.get(&account_id).map(|s| s.rolling_counts(kind)).unwrap_or_default()
    }

    /// Applies a trust penalty (clamped to [0,1]) and records a warning or
    /// confirmed violation depending on severity of the underlying report.
    pub fn apply_penalty(&self, account_id: u32, threat_type: ThreatType, confirmed: bool) {
        if let Some(mut s) = self.sessions.get_mut(&account_id) {
            s.trust_score = (s.trust_score - self.config.trust_decay).clamp(0.0, 1.0);
            if confirmed {
                *s.violations_by_type.entry(threat_type).or_insert(0) += 1;
                s.push_event(EventKind::Suspicious);
                s.suspicious_count += 1;
            } else {
                s.warnings += 1;
                s.push_event(EventKind::Warning);
            }
        }
    }

    /// Linear recovery toward 1.0, called once per idle minute from the
    /// background maintenance task.
    pub fn recover_trust_tick(&self) {
        for mut entry in self.sessions.iter_mut() {
            entry.trust_score = (entry.trust_score + self.config.trust_recovery).clamp(0.0, 1.0);
        }
    }

    pub fn trust_score(&self, account_id: u32) -> Option<f32> {
        self.sessions.get(&account_id).map(|s| s.trust_score)
    }

    pub fn set_monitored(&self, account_id: u32, monitored: bool) {
        if let Some(mut s) = self.sessions.get_mut(&account_id) {
            s.monitored = monitored;
        }
    }

    pub fn history_summary(&self, account_id: u32) -> HistorySummary {
        match self.sessions.get(&account_id) {
            Some(s) => HistorySummary {
                violations_by_type: s.violations_by_type.clone(),
                total_violations: s.violations_by_type.values().sum(),
                warnings: s.warnings,
                suspicious_count: s.suspicious_count,
            },
            None => HistorySummary::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> SessionTracker {
        SessionTracker::new(SessionConfig {
            max_actions_per_minute: 5,
            trust_decay: 0.2,
            trust_recovery: 0.05,
        })
    }

    #[test]
    fn trust_score_stays_within_bounds_under_penalties() {
        let t = tracker();
        t.start_session(1, 1, "127.0.0.1", "1.0");
        for _ in 0..20 {
            t.apply_penalty(1, ThreatType::SpeedHack, true);
        }
        let score = t.trust_score(1).unwrap();
        assert!((0.0..=1.0).contains(&score));
        assert_eq!(score, 0.0);
    }

    #[test]
    fn trust_score_recovers_but_stays_within_bounds() {
        let t = tracker();
        t.start_session(1, 1, "127.0.0.1", "1.0");
        t.apply_penalty(1, ThreatType::SpeedHack, true);
        for _ in 0..100 {
            t.recover_trust_tick();
        }
        let score = t.trust_score(1).unwrap();
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn rate_limit_trips_after_threshold_actions() {
        let t = tracker();
        t.start_session(1, 1, "127.0.0.1", "1.0");
        for _ in 0..6 {
            t.record_action(1);
        }
        assert!(t.is_rate_limited(1, EventKind::Action));
    }

    #[test]
    fn rate_limit_is_scoped_to_its_own_event_kind() {
        let t = tracker();
        t.start_session(1, 1, "127.0.0.1", "1.0");
        for _ in 0..6 {
            t.record_action(1);
        }
        assert!(!t.is_rate_limited(1, EventKind::Packet));
    }

    #[test]
    fn rolling_counts_reflect_recorded_events() {
        let t = tracker();
        t.start_session(1, 1, "127.0.0.1", "1.0");
        for _ in 0..3 {
            t.record_packet(1);
        }
        let counts = t.rolling_counts(1, EventKind::Packet);
        assert_eq!(counts.minute, 3);
        assert_eq!(counts.hour, 3);
        assert_eq!(counts.day, 3);
    }

    #[test]
    fn history_summary_tracks_violations_by_type() {
        let t = tracker();
        t.start_session(1, 1, "127.0.0.1", "1.0");
        t.apply_penalty(1, ThreatType::SpeedHack, true);
        t.apply_penalty(1, ThreatType::SpeedHack, true);
        let summary = t.history_summary(1);
        assert_eq!(summary.violations_by_type.get(&ThreatType::SpeedHack), Some(&2));
        assert_eq!(summary.total_violations, 2);
    }

    #[test]
    fn end_session_clears_history() {
        let t = tracker();
        t.start_session(1, 1, "127.0.0.1", "1.0");
        t.end_session(1);
        assert!(t.trust_score(1).is_none());
    }
}
