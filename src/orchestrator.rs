//! Persistence orchestrator (C5): owns the set of active marker locations,
//! drives writes/verification/healing across mechanisms, and runs the
//! quorum vote that decides whether a ban marker is still `Present`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::crypto::{AlgorithmId, PolymorphicCrypto, SealedMessage};
use crate::error::Result;
use crate::fingerprint::FingerprintService;
use crate::persistence::{
    CheckResult, MarkerLocation, MarkerMetadata, MarkerState, PersistenceMechanism, StoredMarker,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceLevel {
    Standard,
    Advanced,
    Kernel,
    Maximum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Unarmed,
    Writing,
    Armed,
    Degraded,
    Verifying,
    Healing,
}

/// Aggregated outcome of asking every active mechanism to verify its slot.
#[derive(Debug, Clone, Serialize)]
pub struct MarkerVerificationResult {
    pub state: MarkerState,
    pub detected_locations: usize,
    pub total_locations: usize,
    pub metadata: Option<MarkerMetadata>,
    pub detected_paths: Vec<String>,
    pub confidence_score: f32,
}

const MECHANISM_TIMEOUT: Duration = Duration::from_secs(5);

fn locations_for_level(level: PersistenceLevel, base_dir: &std::path::Path) -> Vec<(MarkerLocation, &'static str)> {
    use crate::persistence::LocationType;
    let mk = |kind: LocationType, name: &str, mech_name: &'static str, priority: u32| MarkerLocation {
        location_type: kind,
        path: format!("{name}/marker.bin"),
        sub_path: None,
        identifier: Some(mech_name.to_string()),
        priority,
        write_protected: false,
        system_critical: false,
    };
    let _ = base_dir;
    let mut locations = vec![
        (mk(LocationType::FileSystem, "fs-primary", "filesystem", 1), "filesystem"),
        (mk(LocationType::Registry, "registry", "registry", 3), "registry"),
    ];
    if matches!(level, PersistenceLevel::Advanced | PersistenceLevel::Kernel | PersistenceLevel::Maximum) {
        locations.push((mk(LocationType::AlternateStream, "ads", "alternate_stream", 4), "alternate_stream"));
        locations.push((mk(LocationType::Wmi, "wmi", "wmi", 5), "wmi"));
        locations.push((mk(LocationType::Steganography, "stego", "steganography", 6), "steganography"));
    }
    if matches!(level, PersistenceLevel::Kernel | PersistenceLevel::Maximum) {
        locations.push((mk(LocationType::Kernel, "kernel", "kernel", 7), "kernel"));
    }
    locations
}

pub struct PersistenceOrchestrator {
    mechanisms: HashMap<&'static str, Arc<dyn PersistenceMechanism>>,
    min_required_locations: u32,
    state: Mutex<HashMap<u32, MarkerSlot>>,
}

struct MarkerSlot {
    locations: Vec<MarkerLocation>,
    key: crate::crypto::Key,
    metadata: MarkerMetadata,
    algorithm: AlgorithmId,
    status: OrchestratorState,
}

impl PersistenceOrchestrator {
    pub fn new(mechanisms: Vec<Arc<dyn PersistenceMechanism>>, min_required_locations: u32) -> Self {
        let mut map = HashMap::new();
        for m in mechanisms {
            map.insert(m.name(), m);
        }
        Self {
            mechanisms: map,
            min_required_locations,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub async fn initialize_all(&self) -> Result<()> {
        for mech in self.mechanisms.values() {
            if mech.available() {
                let _ = mech.initialize().await;
            }
        }
        Ok(())
    }

    /// Arms a ban marker: picks locations per level, derives the per-marker
    /// key and algorithm from the hardware id, writes in parallel with a
    /// per-mechanism timeout and one retry on failure.
    pub async fn arm(
        &self,
        level: PersistenceLevel,
        mut metadata: MarkerMetadata,
        fingerprint: &FingerprintService,
        kdf_iterations: u32,
    ) -> Result<OrchestratorState> {
        metadata.validate()?;
        let hw_id = fingerprint.generate();
        metadata.hardware_id = hw_id;
        metadata.component_snapshot = fingerprint.snapshot();
        let locations = locations_for_level(level, std::path::Path::new("."));
        let key = PolymorphicCrypto::derive_key(&hw_id, metadata.account_id.to_le_bytes().as_slice(), kdf_iterations);
        let algorithm = PolymorphicCrypto::select_algorithm(&hw_id, metadata.account_id, metadata.version);

        let plaintext = encode_metadata(&metadata);
        let sealed = PolymorphicCrypto::encrypt(&plaintext, &key, algorithm)?;
        let marker = StoredMarker { sealed };

        let mut successes = 0usize;
        let mut used_locations = Vec::new();
        for (location, mech_name) in &locations {
            let Some(mech) = self.mechanisms.get(mech_name) else {
                continue;
            };
            if !mech.available() {
                continue;
            }
            let ok = write_with_retry(mech.as_ref(), location, &marker).await;
            if ok {
                successes += 1;
                used_locations.push(location.clone());
            }
        }

        let status = if successes as u32 >= self.min_required_locations {
            OrchestratorState::Armed
        } else {
            OrchestratorState::Degraded
        };

        let mut guard = self.state.lock().await;
        guard.insert(
            metadata.account_id,
            MarkerSlot {
                locations: used_locations,
                key,
                metadata,
                algorithm,
                status,
            },
        );
        Ok(status)
    }

    /// Arming twice with identical metadata is a no-op beyond refreshing
    /// nonces: it does not grow the set of distinct locations.
    pub async fn rearm_is_idempotent(&self, account_id: u32) -> bool {
        let guard = self.state.lock().await;
        guard
            .get(&account_id)
            .map(|slot| slot.locations.len())
            .unwrap_or(0)
            <= locations_for_level(PersistenceLevel::Maximum, std::path::Path::new(".")).len()
    }

    pub async fn check(&self, account_id: u32, fingerprint: &FingerprintService) -> Result<MarkerVerificationResult> {
        let guard = self.state.lock().await;
        let Some(slot) = guard.get(&account_id) else {
            return Ok(MarkerVerificationResult {
                state: MarkerState::Absent,
                detected_locations: 0,
                total_locations: 0,
                metadata: None,
                detected_paths: vec![],
                confidence_score: 0.0,
            });
        };

        let current_components = fingerprint.component_set();
        let mut present_paths = Vec::new();
        let mut tampered = 0usize;
        let mut best_metadata: Option<MarkerMetadata> = None;

        for location in &slot.locations {
            let Some(mech) = self.mechanisms.get(location.identifier.as_deref().unwrap_or("")) else {
                continue;
            };
            let result = match timeout(MECHANISM_TIMEOUT, mech.check(location, &slot.key)).await {
                Ok(Ok(r)) => r,
                Ok(Err(_)) => CheckResult {
                    state: MarkerState::Uncertain,
                    metadata: None,
                },
                Err(_) => CheckResult {
                    state: MarkerState::Uncertain,
                    metadata: None,
                },
            };
            match result.state {
                MarkerState::Present => {
                    present_paths.push(location.path.clone());
                    if best_metadata.is_none() {
                        if let Ok(Some(stored)) = mech.read(location).await {
                            if let Some(meta) = decode_metadata(&stored.sealed, &slot.key) {
                                let similarity =
                                    FingerprintService::compare_snapshot(&current_components, &meta.component_snapshot);
                                if similarity >= 0.8 {
                                    best_metadata = Some(meta);
                                }
                            }
                        }
                    }
                }
                MarkerState::Tampered => tampered += 1,
                _ => {}
            }
        }

        let total = slot.locations.len();
        let detected = present_paths.len();
        let state = if detected as u32 >= self.min_required_locations {
            MarkerState::Present
        } else if detected > 0 {
            MarkerState::Partial
        } else {
            MarkerState::Absent
        };

        if tampered > 0 {
            debug!(tampered, account_id, "tampered marker copies detected during verification");
        }

        Ok(MarkerVerificationResult {
            state,
            detected_locations: detected,
            total_locations: total.max(1),
            metadata: best_metadata,
            detected_paths: present_paths,
            confidence_score: detected as f32 / total.max(1) as f32,
        })
    }

    /// Rewrites tampered copies with fresh nonces; called from the refresh
    /// tick once a `Tampered` state is observed for any location.
    pub async fn heal(&self, account_id: u32) -> Result<usize> {
        let guard = self.state.lock().await;
        let Some(slot) = guard.get(&account_id) else {
            return Ok(0);
        };
        let plaintext = encode_metadata(&slot.metadata);
        let sealed = PolymorphicCrypto::encrypt(&plaintext, &slot.key, slot.algorithm)?;
        let marker = StoredMarker { sealed };
        let mut healed = 0;
        for location in &slot.locations {
            if let Some(mech) = self.mechanisms.get(location.identifier.as_deref().unwrap_or("")) {
                let result = mech.check(location, &slot.key).await.ok();
                if matches!(result.map(|r| r.state), Some(MarkerState::Tampered)) {
                    if mech.update(location, &marker).await.unwrap_or(false) {
                        healed += 1;
                    }
                }
            }
        }
        Ok(healed)
    }

    /// Removes every location for every armed account. Refuses unless the
    /// caller presents the exact confirmation key; on mismatch nothing
    /// changes and zero locations are reported removed.
    pub async fn remove_all(&self, confirmation_key: &str, expected_key: &str) -> Result<usize> {
        if confirmation_key != expected_key {
            warn!("remove_all called with incorrect confirmation key");
            return Ok(0);
        }
        let mut guard = self.state.lock().await;
        let mut removed = 0;
        for slot in guard.values() {
            for location in &slot.locations {
                if let Some(mech) = self.mechanisms.get(location.identifier.as_deref().unwrap_or("")) {
                    if mech.remove(location).await.unwrap_or(false) {
                        removed += 1;
                    }
                }
            }
        }
        guard.clear();
        Ok(removed)
    }

    pub async fn refresh_tick(&self, fingerprint: &FingerprintService) -> Result<()> {
        let account_ids: Vec<u32> = self.state.lock().await.keys().copied().collect();
        for account_id in account_ids {
            let result = self.check(account_id, fingerprint).await?;
            if !result.detected_paths.is_empty() && result.state == MarkerState::Present {
                continue;
            }
            let _ = self.heal(account_id).await;
        }
        Ok(())
    }
}

async fn write_with_retry(
    mech: &dyn PersistenceMechanism,
    location: &MarkerLocation,
    marker: &StoredMarker,
) -> bool {
    for attempt in 0..2 {
        match timeout(MECHANISM_TIMEOUT, mech.create(location, marker)).await {
            Ok(Ok(true)) => return true,
            Ok(Ok(false)) | Ok(Err(_)) | Err(_) => {
                if attempt == 0 {
                    continue;
                }
            }
        }
    }
    false
}

/// Canonical binary encoding of `MarkerMetadata`, in field-declaration
/// order: integers little-endian, strings u16-length-prefixed. This is the
/// plaintext sealed under the derived key, never the wire envelope itself
/// (that's `mechanisms::encode`/`decode`).
fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u16).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn read_string(bytes: &[u8], idx: &mut usize) -> Option<String> {
    let len = u16::from_le_bytes(bytes.get(*idx..*idx + 2)?.try_into().ok()?) as usize;
    *idx += 2;
    let s = String::from_utf8(bytes.get(*idx..*idx + len)?.to_vec()).ok()?;
    *idx += len;
    Some(s)
}

fn encode_metadata(meta: &MarkerMetadata) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&meta.account_id.to_le_bytes());
    out.extend_from_slice(&meta.ban_id.to_le_bytes());
    out.extend_from_slice(&meta.created_at.timestamp_millis().to_le_bytes());
    out.extend_from_slice(&meta.expires_at.timestamp_millis().to_le_bytes());
    write_string(&mut out, &meta.violation_type);
    out.extend_from_slice(&meta.severity.to_le_bytes());
    write_string(&mut out, &meta.reason);
    out.extend_from_slice(&meta.version.to_le_bytes());
    out.extend_from_slice(&meta.hardware_id.0);
    out.extend_from_slice(&(meta.component_snapshot.0.len() as u16).to_le_bytes());
    let mut entries: Vec<(&String, &String)> = meta.component_snapshot.0.iter().collect();
    entries.sort_by_key(|(k, _)| k.as_str());
    for (k, v) in entries {
        write_string(&mut out, k);
        write_string(&mut out, v);
    }
    write_string(&mut out, &meta.app_signature);
    match &meta.extra {
        Some(bytes) => {
            out.push(1);
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(bytes);
        }
        None => out.push(0),
    }
    out
}

fn decode_metadata_bytes(bytes: &[u8]) -> Option<MarkerMetadata> {
    let mut idx = 0usize;
    let account_id = u32::from_le_bytes(bytes.get(idx..idx + 4)?.try_into().ok()?);
    idx += 4;
    let ban_id = u32::from_le_bytes(bytes.get(idx..idx + 4)?.try_into().ok()?);
    idx += 4;
    let created_millis = i64::from_le_bytes(bytes.get(idx..idx + 8)?.try_into().ok()?);
    idx += 8;
    let expires_millis = i64::from_le_bytes(bytes.get(idx..idx + 8)?.try_into().ok()?);
    idx += 8;
    let created_at = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(created_millis)?;
    let expires_at = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(expires_millis)?;
    let violation_type = read_string(bytes, &mut idx)?;
    let severity = f32::from_le_bytes(bytes.get(idx..idx + 4)?.try_into().ok()?);
    idx += 4;
    let reason = read_string(bytes, &mut idx)?;
    let version = u32::from_le_bytes(bytes.get(idx..idx + 4)?.try_into().ok()?);
    idx += 4;
    let mut hw = [0u8; 32];
    hw.copy_from_slice(bytes.get(idx..idx + 32)?);
    idx += 32;
    let hardware_id = crate::fingerprint::HardwareId(hw);
    let component_count = u16::from_le_bytes(bytes.get(idx..idx + 2)?.try_into().ok()?) as usize;
    idx += 2;
    let mut components = std::collections::HashMap::with_capacity(component_count);
    for _ in 0..component_count {
        let k = read_string(bytes, &mut idx)?;
        let v = read_string(bytes, &mut idx)?;
        components.insert(k, v);
    }
    let component_snapshot = crate::fingerprint::ComponentSnapshot(components);
    let app_signature = read_string(bytes, &mut idx)?;
    let has_extra = *bytes.get(idx)?;
    idx += 1;
    let extra = if has_extra == 1 {
        let len = u32::from_le_bytes(bytes.get(idx..idx + 4)?.try_into().ok()?) as usize;
        idx += 4;
        let data = bytes.get(idx..idx + len)?.to_vec();
        Some(data)
    } else {
        None
    };
    Some(MarkerMetadata {
        account_id,
        ban_id,
        created_at,
        expires_at,
        violation_type,
        severity,
        reason,
        version,
        hardware_id,
        component_snapshot,
        app_signature,
        extra,
    })
}

fn decode_metadata(sealed: &SealedMessage, key: &crate::crypto::Key) -> Option<MarkerMetadata> {
    let plaintext = PolymorphicCrypto::decrypt(sealed, key)?;
    decode_metadata_bytes(&plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{HardwareComponentSource, StaticComponentSource};
    use crate::persistence::mechanisms::{
        AlternateStreamPersistence, FileSystemPersistence, RegistryPersistence, SteganographyPersistence, WmiPersistence,
    };
    use std::collections::HashMap as StdMap;

    fn fingerprint_service() -> FingerprintService {
        let mut m = StdMap::new();
        m.insert("cpu_id", "GenuineIntel".to_string());
        m.insert("mac_addresses", "AA:BB:CC:DD:EE:FF".to_string());
        FingerprintService::new(Box::new(StaticComponentSource(m)))
    }

    fn temp_dir(tag: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("sentinel-orch-{tag}-{}", uuid::Uuid::new_v4()));
        p
    }

    fn build_orchestrator() -> PersistenceOrchestrator {
        let mechanisms: Vec<Arc<dyn PersistenceMechanism>> = vec![
            Arc::new(FileSystemPersistence::new(temp_dir("fs1"))),
            Arc::new(RegistryPersistence::new(temp_dir("reg"))),
            Arc::new(AlternateStreamPersistence::new(temp_dir("ads"))),
            Arc::new(WmiPersistence::new(temp_dir("wmi"))),
            Arc::new(SteganographyPersistence::new(temp_dir("stego"))),
        ];
        PersistenceOrchestrator::new(mechanisms, 5)
    }

    fn sample_metadata(account_id: u32) -> MarkerMetadata {
        MarkerMetadata {
            account_id,
            ban_id: 1,
            created_at: chrono::Utc::now(),
            expires_at: chrono::Utc::now() + chrono::Duration::days(30),
            violation_type: "speed_hack".to_string(),
            severity: 0.9,
            reason: "speed_hack".to_string(),
            version: 1,
            hardware_id: crate::fingerprint::HardwareId([0u8; 32]),
            component_snapshot: crate::fingerprint::ComponentSnapshot(StdMap::new()),
            app_signature: "sentinel-test".to_string(),
            extra: None,
        }
    }

    #[tokio::test]
    async fn arm_then_check_present_with_quorum() {
        let orch = build_orchestrator();
        orch.initialize_all().await.unwrap();
        let fp = fingerprint_service();
        let status = orch.arm(PersistenceLevel::Advanced, sample_metadata(1001), &fp, 10_000).await.unwrap();
        assert_eq!(status, OrchestratorState::Armed);
        let result = orch.check(1001, &fp).await.unwrap();
        assert_eq!(result.state, MarkerState::Present);
        assert!(result.detected_locations >= 5);
    }

    #[tokio::test]
    async fn remove_all_wrong_key_changes_nothing() {
        let orch = build_orchestrator();
        orch.initialize_all().await.unwrap();
        let fp = fingerprint_service();
        orch.arm(PersistenceLevel::Advanced, sample_metadata(1002), &fp, 10_000).await.unwrap();
        let removed = orch.remove_all("wrong-key", "correct-key").await.unwrap();
        assert_eq!(removed, 0);
        let result = orch.check(1002, &fp).await.unwrap();
        assert_eq!(result.state, MarkerState::Present);
    }

    #[tokio::test]
    async fn remove_all_correct_key_clears_markers() {
        let orch = build_orchestrator();
        orch.initialize_all().await.unwrap();
        let fp = fingerprint_service();
        orch.arm(PersistenceLevel::Advanced, sample_metadata(1003), &fp, 10_000).await.unwrap();
        let removed = orch.remove_all("correct-key", "correct-key").await.unwrap();
        assert!(removed >= 5);
        let result = orch.check(1003, &fp).await.unwrap();
        assert_eq!(result.state, MarkerState::Absent);
    }
}
