//! Threat arbiter (C10): fuses rule hits, ML predictions and signature
//! matches into deduplicated, ranked threat reports with a recommended
//! action.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::SessionTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatType {
    Unknown,
    MemoryManipulation,
    SpeedHack,
    PacketInjection,
    PacketManipulation,
    ClientModification,
    DllInjection,
    BotAutomation,
    DebuggerDetected,
    VirtualMachine,
    SandboxDetected,
    CodeHooking,
    InvalidChecksum,
    DataTampering,
    AbnormalBehavior,
    PrivilegeEscalation,
    TimingAttack,
    EncryptionBypass,
    ApiAbuse,
    RateAbuse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatSeverity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatSeverity {
    pub fn from_confidence(confidence: f32) -> Self {
        if confidence >= 0.9 {
            ThreatSeverity::Critical
        } else if confidence >= 0.7 {
            ThreatSeverity::High
        } else if confidence >= 0.3 {
            ThreatSeverity::Medium
        } else if confidence > 0.0 {
            ThreatSeverity::Low
        } else {
            ThreatSeverity::None
        }
    }
}

/// Narrowed to actions reachable without a game-simulation or
/// client-patching collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Log,
    Alert,
    WarnPlayer,
    RestrictActions,
    TemporaryBan,
    PermanentBan,
    Disconnect,
    SilentMonitoring,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerRef {
    pub account_id: u32,
    pub character_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatReport {
    pub id: u64,
    #[serde(rename = "type")]
    pub threat_type: ThreatType,
    pub severity: ThreatSeverity,
    pub description: String,
    pub confidence: f32,
    pub confirmed: bool,
    pub detected_at: DateTime<Utc>,
    pub evidence: HashMap<String, String>,
    pub player: Option<PlayerRef>,
    pub action: RecommendedAction,
}

/// A raw, pre-fusion signal from a rule, ML model or signature match.
#[derive(Debug, Clone)]
pub struct ThreatSignal {
    pub source: &'static str,
    pub threat_type: ThreatType,
    pub account_id: u32,
    pub character_id: u32,
    pub score: f32,
    pub description: String,
    pub window_bucket: u64,
}

pub struct ThreatArbiter {
    next_id: std::sync::atomic::AtomicU64,
    temp_ban_duration_days: i64,
}

impl ThreatArbiter {
    pub fn new() -> Self {
        Self {
            next_id: std::sync::atomic::AtomicU64::new(1),
            temp_ban_duration_days: 7,
        }
    }

    /// Deduplicates signals sharing `(threat_type, account_id, window_bucket)`
    /// by keeping the max score, then maps the winner to a severity band
    /// and recommended action informed by the account's recent history.
    pub fn arbitrate(&self, signals: Vec<ThreatSignal>, tracker: &SessionTracker) -> Vec<ThreatReport> {
        let mut best: HashMap<(ThreatType, u32, u64), ThreatSignal> = HashMap::new();
        for signal in signals {
            let key = (signal.threat_type, signal.account_id, signal.window_bucket);
            best.entry(key)
                .and_modify(|existing| {
                    if signal.score > existing.score {
                        *existing = signal.clone();
                    }
                })
                .or_insert(signal);
        }

        best.into_values()
            .map(|signal| {
                let severity = ThreatSeverity::from_confidence(signal.score);
                let history = tracker.history_summary(signal.account_id);
                let action = self.recommend_action(severity, &history, signal.threat_type);
                let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                let mut evidence = HashMap::new();
                evidence.insert("source".to_string(), signal.source.to_string());
                ThreatReport {
                    id,
                    threat_type: signal.threat_type,
                    severity,
                    description: signal.description,
                    confidence: signal.score,
                    confirmed: severity >= ThreatSeverity::High,
                    detected_at: Utc::now(),
                    evidence,
                    player: Some(PlayerRef {
                        account_id: signal.account_id,
                        character_id: signal.character_id,
                    }),
                    action,
                }
            })
            .collect()
    }

    fn recommend_action(
        &self,
        severity: ThreatSeverity,
        history: &crate::session::HistorySummary,
        threat_type: ThreatType,
    ) -> RecommendedAction {
        let prior_same_type = history.violations_by_type.get(&threat_type).copied().unwrap_or(0);
        if severity == ThreatSeverity::Critical || prior_same_type >= 3 {
            RecommendedAction::PermanentBan
        } else if history.total_violations >= 1 || history.warnings >= 3 {
            RecommendedAction::TemporaryBan
        } else if history.warnings >= 1 || history.suspicious_count >= 5 {
            RecommendedAction::Disconnect
        } else if severity >= ThreatSeverity::Medium {
            RecommendedAction::WarnPlayer
        } else {
            RecommendedAction::Log
        }
    }

    pub fn temp_ban_duration(&self) -> chrono::Duration {
        chrono::Duration::days(self.temp_ban_duration_days)
    }
}

impl Default for ThreatArbiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionTracker;

    #[test]
    fn dedups_by_type_account_window_keeping_max_score() {
        let arbiter = ThreatArbiter::new();
        let tracker = SessionTracker::new(Default::default());
        let signals = vec![
            ThreatSignal {
                source: "rule",
                threat_type: ThreatType::PacketInjection,
                account_id: 1,
                character_id: 1,
                score: 0.85,
                description: "rule hit".into(),
                window_bucket: 0,
            },
            ThreatSignal {
                source: "ml",
                threat_type: ThreatType::PacketInjection,
                account_id: 1,
                character_id: 1,
                score: 0.6,
                description: "ml hit".into(),
                window_bucket: 0,
            },
        ];
        let reports = arbiter.arbitrate(signals, &tracker);
        assert_eq!(reports.len(), 1);
        assert!((reports[0].confidence - 0.85).abs() < 1e-6);
        assert_eq!(reports[0].severity, ThreatSeverity::High);
    }

    #[test]
    fn critical_severity_recommends_permanent_ban() {
        let arbiter = ThreatArbiter::new();
        let tracker = SessionTracker::new(Default::default());
        let signals = vec![ThreatSignal {
            source: "rule",
            threat_type: ThreatType::SpeedHack,
            account_id: 2,
            character_id: 1,
            score: 0.95,
            description: "critical speed hack".into(),
            window_bucket: 0,
        }];
        let reports = arbiter.arbitrate(signals, &tracker);
        assert_eq!(reports[0].action, RecommendedAction::PermanentBan);
    }

    #[test]
    fn low_severity_recommends_log_only() {
        let arbiter = ThreatArbiter::new();
        let tracker = SessionTracker::new(Default::default());
        let signals = vec![ThreatSignal {
            source: "rule",
            threat_type: ThreatType::ApiAbuse,
            account_id: 3,
            character_id: 1,
            score: 0.1,
            description: "minor".into(),
            window_bucket: 0,
        }];
        let reports = arbiter.arbitrate(signals, &tracker);
        assert_eq!(reports[0].action, RecommendedAction::Log);
    }
}
