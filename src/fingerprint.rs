//! Hardware fingerprinting (C1).
//!
//! Derives a stable identifier from a handful of weighted host components
//! and supports fuzzy comparison so a marker written on one boot still
//! matches the same physical host after minor component drift (a NIC
//! replaced, a disk serial masked by a new driver).

use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// A 256-bit digest over weighted host components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct HardwareId(pub [u8; 32]);

impl HardwareId {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        if bytes.len() != 32 {
            return None;
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Some(HardwareId(out))
    }
}

/// Named, normalized component values plus the per-component weights used
/// both to build the digest and to score similarity between two ids.
#[derive(Debug, Clone)]
pub struct ComponentSet {
    pub values: HashMap<&'static str, String>,
    pub weights: HashMap<&'static str, f32>,
}

/// Owned-key snapshot of the component values a marker was armed under.
/// `HardwareId` is a one-way digest, so fuzzy "same host" comparison after
/// the fact needs this alongside it rather than trying to recover
/// components from the hash.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ComponentSnapshot(pub HashMap<String, String>);

pub const COMPONENT_NAMES: [&str; 6] = [
    "cpu_id",
    "mac_addresses",
    "motherboard_serial",
    "disk_serials",
    "bios_id",
    "gpu_id",
];

fn default_weights() -> HashMap<&'static str, f32> {
    let mut m = HashMap::new();
    m.insert("cpu_id", 0.25);
    m.insert("mac_addresses", 0.2);
    m.insert("motherboard_serial", 0.2);
    m.insert("disk_serials", 0.15);
    m.insert("bios_id", 0.1);
    m.insert("gpu_id", 0.1);
    m
}

/// Abstraction over reading raw component values from the host. A real
/// deployment would shell out to platform-specific APIs (WMI, /sys,
/// ioreg...); tests and the composition root supply deterministic sources.
pub trait HardwareComponentSource: Send + Sync {
    fn read(&self, component: &str) -> Option<String>;
}

/// Component source returning fixed values, used by tests and anywhere a
/// reproducible identity is required.
pub struct StaticComponentSource(pub HashMap<&'static str, String>);

impl HardwareComponentSource for StaticComponentSource {
    fn read(&self, component: &str) -> Option<String> {
        self.0.get(component).cloned()
    }
}

pub struct FingerprintService {
    weights: HashMap<&'static str, f32>,
    source: Box<dyn HardwareComponentSource>,
}

fn normalize(raw: &str) -> String {
    raw.trim().to_lowercase()
}

fn hash_component(name: &str, value: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b"|");
    hasher.update(value.as_bytes());
    hasher.finalize().into()
}

impl FingerprintService {
    pub fn new(source: Box<dyn HardwareComponentSource>) -> Self {
        Self {
            weights: default_weights(),
            source,
        }
    }

    pub fn set_component_weights(&mut self, weights: HashMap<&'static str, f32>) {
        self.weights = weights;
    }

    fn collect_components(&self) -> ComponentSet {
        let mut values = HashMap::new();
        for name in COMPONENT_NAMES {
            if let Some(v) = self.source.read(name) {
                values.insert(name, normalize(&v));
            }
        }
        ComponentSet {
            values,
            weights: self.weights.clone(),
        }
    }

    /// Live `ComponentSet` for fuzzy comparison against a persisted
    /// `ComponentSnapshot`.
    pub fn component_set(&self) -> ComponentSet {
        self.collect_components()
    }

    /// Owned-key snapshot of the current components, persisted alongside a
    /// marker's `HardwareId` so a later fuzzy comparison has something to
    /// compare against.
    pub fn snapshot(&self) -> ComponentSnapshot {
        let components = self.collect_components();
        ComponentSnapshot(components.values.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    /// Digest over all present components, missing ones skipped.
    pub fn generate(&self) -> HardwareId {
        let components = self.collect_components();
        Self::digest(&components)
    }

    fn digest(components: &ComponentSet) -> HardwareId {
        let mut hasher = Sha256::new();
        let mut names: Vec<_> = COMPONENT_NAMES.to_vec();
        names.sort();
        for name in names {
            if let Some(v) = components.values.get(name) {
                hasher.update(hash_component(name, v));
            }
        }
        HardwareId(hasher.finalize().into())
    }

    /// Generates a variant of the current fingerprint with a random subset
    /// of components perturbed, proportional to `level` in [0,1]. Used to
    /// exercise fuzzy-matching thresholds in tests.
    pub fn generate_fuzzy(&self, level: f32) -> HardwareId {
        use rand::Rng;
        let mut components = self.collect_components();
        let mut rng = rand::thread_rng();
        let perturb_count =
            ((COMPONENT_NAMES.len() as f32) * level.clamp(0.0, 1.0)).round() as usize;
        let mut names = COMPONENT_NAMES.to_vec();
        for _ in 0..perturb_count.min(names.len()) {
            let idx = rng.gen_range(0..names.len());
            let name = names.remove(idx);
            components
                .values
                .insert(name, format!("perturbed-{}", rng.gen::<u32>()));
        }
        Self::digest(&components)
    }

    /// Per-component weighted Hamming similarity in [0,1]. Unlike comparing
    /// the final digests directly, this degrades gracefully when only a
    /// few components drifted instead of flipping to "completely
    /// different" the moment any single byte changes.
    pub fn compare_components(a: &ComponentSet, b: &ComponentSet) -> f32 {
        let mut total_weight = 0.0f32;
        let mut matched_weight = 0.0f32;
        for name in COMPONENT_NAMES {
            let weight = *a.weights.get(name).unwrap_or(&0.0);
            match (a.values.get(name), b.values.get(name)) {
                (Some(va), Some(vb)) => {
                    total_weight += weight;
                    if va == vb {
                        matched_weight += weight;
                    } else {
                        matched_weight += weight * component_similarity(va, vb);
                    }
                }
                _ => {
                    // A component absent on either side contributes nothing
                    // to either numerator or denominator.
                }
            }
        }
        if total_weight <= 0.0 {
            0.0
        } else {
            matched_weight / total_weight
        }
    }

    /// Weighted Hamming comparison between a freshly-collected `ComponentSet`
    /// and a persisted `ComponentSnapshot`, same per-component scoring as
    /// `compare_components`. This is the only fuzzy-comparison path: once a
    /// marker's hardware identity is reduced to its `HardwareId` digest the
    /// individual components can no longer be recovered from it.
    pub fn compare_snapshot(current: &ComponentSet, snapshot: &ComponentSnapshot) -> f32 {
        let mut total_weight = 0.0f32;
        let mut matched_weight = 0.0f32;
        for name in COMPONENT_NAMES {
            let weight = *current.weights.get(name).unwrap_or(&0.0);
            match (current.values.get(name), snapshot.0.get(name)) {
                (Some(va), Some(vb)) => {
                    total_weight += weight;
                    if va == vb {
                        matched_weight += weight;
                    } else {
                        matched_weight += weight * component_similarity(va, vb);
                    }
                }
                _ => {}
            }
        }
        if total_weight <= 0.0 {
            0.0
        } else {
            matched_weight / total_weight
        }
    }
}

fn component_similarity(a: &str, b: &str) -> f32 {
    if a == b {
        return 1.0;
    }
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 1.0;
    }
    let common = a
        .bytes()
        .zip(b.bytes())
        .filter(|(x, y)| x == y)
        .count();
    common as f32 / max_len as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_source() -> StaticComponentSource {
        let mut m = HashMap::new();
        m.insert("cpu_id", "GenuineIntel-0x906EA".to_string());
        m.insert("mac_addresses", "AA:BB:CC:DD:EE:FF".to_string());
        m.insert("motherboard_serial", "MB-12345".to_string());
        m.insert("disk_serials", "WD-998877".to_string());
        m.insert("bios_id", "BIOS-2024".to_string());
        m.insert("gpu_id", "GPU-RTX".to_string());
        StaticComponentSource(m)
    }

    #[test]
    fn deterministic_generation() {
        let svc = FingerprintService::new(Box::new(fixed_source()));
        assert_eq!(svc.generate(), svc.generate());
    }

    #[test]
    fn missing_component_is_absent_not_fatal() {
        let mut m = HashMap::new();
        m.insert("cpu_id", "only-one".to_string());
        let svc = FingerprintService::new(Box::new(StaticComponentSource(m)));
        let id = svc.generate();
        assert_ne!(id.0, [0u8; 32]);
    }

    #[test]
    fn identical_component_sets_compare_to_one() {
        let set = ComponentSet {
            values: fixed_source().0,
            weights: default_weights(),
        };
        assert_eq!(FingerprintService::compare_components(&set, &set), 1.0);
    }

    #[test]
    fn disjoint_components_compare_to_zero() {
        let a = ComponentSet {
            values: fixed_source().0,
            weights: default_weights(),
        };
        let mut bvals = HashMap::new();
        bvals.insert("cpu_id", "totally-different-cpu-xyz".to_string());
        let b = ComponentSet {
            values: bvals,
            weights: default_weights(),
        };
        let score = FingerprintService::compare_components(&a, &b);
        assert!(score < 0.3, "expected low similarity, got {score}");
    }

    #[test]
    fn hex_round_trip() {
        let svc = FingerprintService::new(Box::new(fixed_source()));
        let id = svc.generate();
        let hex = id.to_hex();
        assert_eq!(HardwareId::from_hex(&hex), Some(id));
    }

    #[test]
    fn snapshot_compares_high_against_minor_drift() {
        let svc = FingerprintService::new(Box::new(fixed_source()));
        let snapshot = svc.snapshot();
        let mut drifted = fixed_source().0;
        drifted.insert("gpu_id", "GPU-DIFFERENT".to_string());
        let current = ComponentSet {
            values: drifted,
            weights: default_weights(),
        };
        let score = FingerprintService::compare_snapshot(&current, &snapshot);
        assert!(score > 0.85, "expected graded similarity after one component drifted, got {score}");
    }

    #[test]
    fn snapshot_compares_low_against_unrelated_host() {
        let svc = FingerprintService::new(Box::new(fixed_source()));
        let snapshot = svc.snapshot();
        let mut other = HashMap::new();
        other.insert("cpu_id", "totally-different-cpu".to_string());
        let current = ComponentSet {
            values: other,
            weights: default_weights(),
        };
        let score = FingerprintService::compare_snapshot(&current, &snapshot);
        assert!(score < 0.3, "expected low similarity, got {score}");
    }
}
