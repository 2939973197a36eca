//! Signature database (C3): known-bad patterns indexed for fast lookup.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::arbiter::ThreatType;
use crate::error::{ErrorKind, Result, SentinelError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Binary,
    Network,
    Behavioral,
    ApiCall,
    FileHash,
    CodeFingerprint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Pattern {
    Bytes { bytes: Vec<u8>, mask: Option<Vec<u8>> },
    Text(String),
    Hash(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    pub description: String,
    pub pattern_kind: PatternKind,
    pub threat_type: ThreatType,
    pub severity: f32,
    pub pattern: Pattern,
    pub wildcards: bool,
    pub false_positive_rate: f32,
    pub hit_count: u64,
    pub updated_at: DateTime<Utc>,
    pub source: String,
}

#[derive(Default)]
struct Indices {
    by_name: HashMap<String, Signature>,
    by_threat_type: HashMap<ThreatType, Vec<String>>,
    by_pattern_kind: HashMap<PatternKind, Vec<String>>,
}

/// Read-mostly shared store; writers take the exclusive lock and rebuild
/// the reverse indices atomically so readers never see a half-updated view.
pub struct SignatureDatabase {
    inner: RwLock<Indices>,
}

impl SignatureDatabase {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Indices::default()),
        }
    }

    pub fn add(&self, sig: Signature) -> Result<()> {
        let mut guard = self.inner.write().expect("signature db lock poisoned");
        if guard.by_name.contains_key(&sig.name) {
            return Err(ErrorKind::InvalidInput(format!(
                "signature '{}' already exists",
                sig.name
            ))
            .into());
        }
        guard
            .by_threat_type
            .entry(sig.threat_type)
            .or_default()
            .push(sig.name.clone());
        guard
            .by_pattern_kind
            .entry(sig.pattern_kind)
            .or_default()
            .push(sig.name.clone());
        guard.by_name.insert(sig.name.clone(), sig);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let mut guard = self.inner.write().expect("signature db lock poisoned");
        let sig = guard
            .by_name
            .remove(name)
            .ok_or_else(|| SentinelError::new(ErrorKind::InvalidInput(format!("no such signature '{name}'"))))?;
        if let Some(v) = guard.by_threat_type.get_mut(&sig.threat_type) {
            v.retain(|n| n != name);
        }
        if let Some(v) = guard.by_pattern_kind.get_mut(&sig.pattern_kind) {
            v.retain(|n| n != name);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Signature> {
        self.inner.read().expect("lock poisoned").by_name.get(name).cloned()
    }

    pub fn by_threat_type(&self, threat_type: ThreatType) -> Vec<Signature> {
        let guard = self.inner.read().expect("lock poisoned");
        guard
            .by_threat_type
            .get(&threat_type)
            .into_iter()
            .flatten()
            .filter_map(|n| guard.by_name.get(n).cloned())
            .collect()
    }

    pub fn by_pattern_kind(&self, kind: PatternKind) -> Vec<Signature> {
        let guard = self.inner.read().expect("lock poisoned");
        guard
            .by_pattern_kind
            .get(&kind)
            .into_iter()
            .flatten()
            .filter_map(|n| guard.by_name.get(n).cloned())
            .collect()
    }

    /// Checks an in-memory buffer against all binary/code-fingerprint
    /// signatures; rarer (longer) patterns are checked first so a mismatch
    /// is usually found on the first comparison.
    pub fn check_memory(&self, buf: &[u8]) -> Vec<String> {
        let guard = self.inner.read().expect("lock poisoned");
        let mut candidates: Vec<&Signature> = guard
            .by_pattern_kind
            .get(&PatternKind::Binary)
            .into_iter()
            .flatten()
            .chain(guard.by_pattern_kind.get(&PatternKind::CodeFingerprint).into_iter().flatten())
            .filter_map(|n| guard.by_name.get(n))
            .collect();
        candidates.sort_by_key(|s| match &s.pattern {
            Pattern::Bytes { bytes, .. } => std::cmp::Reverse(bytes.len()),
            _ => std::cmp::Reverse(0),
        });
        candidates
            .into_iter()
            .filter(|s| matches_bytes(s, buf))
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn check_network(&self, frame: &[u8]) -> Vec<String> {
        let guard = self.inner.read().expect("lock poisoned");
        guard
            .by_pattern_kind
            .get(&PatternKind::Network)
            .into_iter()
            .flatten()
            .filter_map(|n| guard.by_name.get(n))
            .filter(|s| matches_bytes(s, frame))
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn check_file_hash(&self, hash: &str) -> Vec<String> {
        let guard = self.inner.read().expect("lock poisoned");
        guard
            .by_pattern_kind
            .get(&PatternKind::FileHash)
            .into_iter()
            .flatten()
            .filter_map(|n| guard.by_name.get(n))
            .filter(|s| matches!(&s.pattern, Pattern::Hash(h) if h == hash))
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("lock poisoned").by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes every signature to a versioned JSON document.
    pub fn export(&self) -> Result<String> {
        let guard = self.inner.read().expect("lock poisoned");
        let sigs: Vec<&Signature> = guard.by_name.values().collect();
        serde_json::to_string_pretty(&SignatureExport { version: 1, signatures: sigs })
            .map_err(|e| SentinelError::with_source(ErrorKind::Internal("signature export failed".into()), e))
    }

    pub fn import(&self, text: &str) -> Result<usize> {
        let doc: SignatureImport = serde_json::from_str(text)
            .map_err(|e| SentinelError::with_source(ErrorKind::InvalidInput("malformed signature document".into()), e))?;
        let mut count = 0;
        for sig in doc.signatures {
            if self.add(sig).is_ok() {
                count += 1;
            }
        }
        Ok(count)
    }
}

impl Default for SignatureDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct SignatureExport<'a> {
    version: u32,
    signatures: Vec<&'a Signature>,
}

#[derive(Deserialize)]
struct SignatureImport {
    #[allow(dead_code)]
    version: u32,
    signatures: Vec<Signature>,
}

fn matches_bytes(sig: &Signature, haystack: &[u8]) -> bool {
    match &sig.pattern {
        Pattern::Bytes { bytes, mask } => contains_masked(haystack, bytes, mask.as_deref()),
        Pattern::Text(t) => {
            let needle = t.as_bytes();
            contains_masked(haystack, needle, None)
        }
        Pattern::Hash(_) => false,
    }
}

fn contains_masked(haystack: &[u8], needle: &[u8], mask: Option<&[u8]>) -> bool {
    if needle.is_empty() || needle.len() > haystack.len() {
        return false;
    }
    'outer: for start in 0..=(haystack.len() - needle.len()) {
        for i in 0..needle.len() {
            let m = mask.and_then(|m| m.get(i)).copied().unwrap_or(0xFF);
            if (haystack[start + i] & m) != (needle[i] & m) {
                continue 'outer;
            }
        }
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(name: &str) -> Signature {
        Signature {
            name: name.to_string(),
            description: "test signature".into(),
            pattern_kind: PatternKind::Binary,
            threat_type: ThreatType::ClientModification,
            severity: 0.7,
            pattern: Pattern::Bytes {
                bytes: vec![0xDE, 0xAD, 0xBE, 0xEF],
                mask: None,
            },
            wildcards: false,
            false_positive_rate: 0.001,
            hit_count: 0,
            updated_at: Utc::now(),
            source: "unit-test".into(),
        }
    }

    #[test]
    fn add_then_remove_clears_all_indices() {
        let db = SignatureDatabase::new();
        db.add(sample("sig-a")).unwrap();
        db.remove("sig-a").unwrap();
        assert!(db.get("sig-a").is_none());
        assert!(db.by_threat_type(ThreatType::ClientModification).is_empty());
        assert!(db.by_pattern_kind(PatternKind::Binary).is_empty());
    }

    #[test]
    fn duplicate_name_rejected() {
        let db = SignatureDatabase::new();
        db.add(sample("sig-a")).unwrap();
        assert!(db.add(sample("sig-a")).is_err());
    }

    #[test]
    fn check_memory_finds_embedded_pattern() {
        let db = SignatureDatabase::new();
        db.add(sample("sig-a")).unwrap();
        let buf = [0x00, 0x01, 0xDE, 0xAD, 0xBE, 0xEF, 0x02];
        let hits = db.check_memory(&buf);
        assert_eq!(hits, vec!["sig-a".to_string()]);
    }

    #[test]
    fn check_memory_no_match() {
        let db = SignatureDatabase::new();
        db.add(sample("sig-a")).unwrap();
        let buf = [0x01, 0x02, 0x03];
        assert!(db.check_memory(&buf).is_empty());
    }

    #[test]
    fn export_import_round_trip() {
        let db = SignatureDatabase::new();
        db.add(sample("sig-a")).unwrap();
        let text = db.export().unwrap();
        let db2 = SignatureDatabase::new();
        let count = db2.import(&text).unwrap();
        assert_eq!(count, 1);
        assert!(db2.get("sig-a").is_some());
    }
}
