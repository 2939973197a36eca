//! Declarative rule engine (C8): AND/OR/SEQUENCE logic over replayable
//! event streams.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::arbiter::ThreatType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Operator {
    fn apply(self, a: f64, b: f64) -> bool {
        match self {
            Operator::Eq => (a - b).abs() < f64::EPSILON,
            Operator::Ne => (a - b).abs() >= f64::EPSILON,
            Operator::Lt => a < b,
            Operator::Le => a <= b,
            Operator::Gt => a > b,
            Operator::Ge => a >= b,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    pub value: f64,
    pub negate: bool,
}

impl Condition {
    pub fn matches(&self, event: &RuleEvent) -> bool {
        let field_value = event.fields.get(self.field.as_str()).copied().unwrap_or(f64::NAN);
        let result = self.operator.apply(field_value, self.value);
        if self.negate {
            !result
        } else {
            result
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleLogic {
    And,
    Or,
    Sequence,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleParameters {
    #[serde(default)]
    pub window_ms: u64,
    #[serde(default = "default_repeat")]
    pub repeat: u32,
}

fn default_repeat() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub threat_type: ThreatType,
    pub severity: f32,
    pub enabled: bool,
    pub logic: RuleLogic,
    pub conditions: Vec<Condition>,
    pub parameters: RuleParameters,
}

/// A single timestamped event replayed through the rule engine, fields
/// named so conditions can reference them by string key (packet.type,
/// stat.level, etc.).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleEvent {
    pub timestamp_ms: u64,
    pub fields: std::collections::HashMap<String, f64>,
}

#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub rule_id: String,
    pub threat_type: ThreatType,
    pub severity: f32,
    pub matched_at_ms: u64,
}

/// Per-rule sliding window of matched condition timestamps, used only for
/// SEQUENCE rules.
struct SequenceState {
    hits: VecDeque<u64>,
}

pub struct RuleEngine {
    rules: Vec<Rule>,
    sequence_state: std::collections::HashMap<String, SequenceState>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            sequence_state: std::collections::HashMap::new(),
        }
    }

    pub fn add_rule(&mut self, rule: Rule) {
        self.sequence_state.insert(rule.id.clone(), SequenceState { hits: VecDeque::new() });
        self.rules.push(rule);
    }

    pub fn remove_rule(&mut self, id: &str) {
        self.rules.retain(|r| r.id != id);
        self.sequence_state.remove(id);
    }

    pub fn evaluate(&mut self, event: &RuleEvent) -> Vec<RuleMatch> {
        let mut matches = Vec::new();
        for rule in &self.rules {
            if !rule.enabled {
                continue;
            }
            let hit = match rule.logic {
                RuleLogic::And => rule.conditions.iter().all(|c| c.matches(event)),
                RuleLogic::Or => rule.conditions.iter().any(|c| c.matches(event)),
                RuleLogic::Sequence => {
                    let single_condition_matches = rule.conditions.iter().any(|c| c.matches(event));
                    if !single_condition_matches {
                        false
                    } else {
                        let state = self.sequence_state.entry(rule.id.clone()).or_insert(SequenceState { hits: VecDeque::new() });
                        state.hits.push_back(event.timestamp_ms);
                        let window = rule.parameters.window_ms;
                        while let Some(&front) = state.hits.front() {
                            if event.timestamp_ms.saturating_sub(front) > window {
                                state.hits.pop_front();
                            } else {
                                break;
                            }
                        }
                        if state.hits.len() as u32 >= rule.parameters.repeat {
                            state.hits.clear();
                            true
                        } else {
                            false
                        }
                    }
                }
            };
            if hit {
                matches.push(RuleMatch {
                    rule_id: rule.id.clone(),
                    threat_type: rule.threat_type,
                    severity: rule.severity,
                    matched_at_ms: event.timestamp_ms,
                });
            }
        }
        matches
    }

    /// Replays a recorded history against every enabled rule and reports
    /// precision/recall against ground-truth labels, for offline testing.
    pub fn test_against_history(&mut self, events: &[(RuleEvent, bool)]) -> (f32, f32) {
        let mut true_positive = 0u32;
        let mut false_positive = 0u32;
        let mut false_negative = 0u32;
        for (event, expected) in events {
            let matched = !self.evaluate(event).is_empty();
            match (matched, *expected) {
                (true, true) => true_positive += 1,
                (true, false) => false_positive += 1,
                (false, true) => false_negative += 1,
                (false, false) => {}
            }
        }
        let precision = if true_positive + false_positive == 0 {
            0.0
        } else {
            true_positive as f32 / (true_positive + false_positive) as f32
        };
        let recall = if true_positive + false_negative == 0 {
            0.0
        } else {
            true_positive as f32 / (true_positive + false_negative) as f32
        };
        (precision, recall)
    }

    pub fn export(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.rules)
    }

    pub fn import(&mut self, text: &str) -> Result<usize, serde_json::Error> {
        let rules: Vec<Rule> = serde_json::from_str(text)?;
        let count = rules.len();
        for rule in rules {
            self.add_rule(rule);
        }
        Ok(count)
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn packet_event(t: u64, packet_type: f64) -> RuleEvent {
        let mut fields = HashMap::new();
        fields.insert("packet.type".to_string(), packet_type);
        RuleEvent { timestamp_ms: t, fields }
    }

    fn flood_rule() -> Rule {
        Rule {
            id: "packet-flood".into(),
            name: "Packet Flood".into(),
            threat_type: ThreatType::PacketInjection,
            severity: 0.9,
            enabled: true,
            logic: RuleLogic::Sequence,
            conditions: vec![Condition {
                field: "packet.type".into(),
                operator: Operator::Eq,
                value: 0x15 as f64,
                negate: false,
            }],
            parameters: RuleParameters { window_ms: 50 * 20, repeat: 20 },
        }
    }

    #[test]
    fn and_rule_requires_all_conditions() {
        let mut engine = RuleEngine::new();
        engine.add_rule(Rule {
            id: "r1".into(),
            name: "test".into(),
            threat_type: ThreatType::SpeedHack,
            severity: 0.5,
            enabled: true,
            logic: RuleLogic::And,
            conditions: vec![
                Condition { field: "speed".into(), operator: Operator::Gt, value: 40.0, negate: false },
                Condition { field: "level".into(), operator: Operator::Ge, value: 1.0, negate: false },
            ],
            parameters: RuleParameters { window_ms: 0, repeat: 1 },
        });
        let mut fields = HashMap::new();
        fields.insert("speed".into(), 50.0);
        fields.insert("level".into(), 5.0);
        let event = RuleEvent { timestamp_ms: 0, fields };
        assert_eq!(engine.evaluate(&event).len(), 1);
    }

    #[test]
    fn sequence_rule_fires_once_per_burst() {
        let mut engine = RuleEngine::new();
        engine.add_rule(flood_rule());
        let mut total_matches = 0;
        for i in 0..25u64 {
            let event = packet_event(i * 10, 0x15 as f64);
            total_matches += engine.evaluate(&event).len();
        }
        assert_eq!(total_matches, 1);
    }

    #[test]
    fn sequence_rule_resets_outside_window() {
        let mut engine = RuleEngine::new();
        engine.add_rule(flood_rule());
        for i in 0..5u64 {
            engine.evaluate(&packet_event(i * 10, 0x15 as f64));
        }
        // Gap far larger than the window clears the accumulated hits.
        let late_event = packet_event(100_000, 0x15 as f64);
        let matches = engine.evaluate(&late_event);
        assert!(matches.is_empty());
    }

    #[test]
    fn precision_recall_against_history() {
        let mut engine = RuleEngine::new();
        engine.add_rule(Rule {
            id: "r1".into(),
            name: "speed".into(),
            threat_type: ThreatType::SpeedHack,
            severity: 0.8,
            enabled: true,
            logic: RuleLogic::Or,
            conditions: vec![Condition { field: "speed".into(), operator: Operator::Gt, value: 40.0, negate: false }],
            parameters: RuleParameters { window_ms: 0, repeat: 1 },
        });
        let mut normal = HashMap::new();
        normal.insert("speed".into(), 10.0);
        let mut cheat = HashMap::new();
        cheat.insert("speed".into(), 80.0);
        let events = vec![
            (RuleEvent { timestamp_ms: 0, fields: normal.clone() }, false),
            (RuleEvent { timestamp_ms: 1, fields: cheat.clone() }, true),
            (RuleEvent { timestamp_ms: 2, fields: normal }, false),
        ];
        let (precision, recall) = engine.test_against_history(&events);
        assert!((precision - 1.0).abs() < 1e-6);
        assert!((recall - 1.0).abs() < 1e-6);
    }
}
