//! Persistence mechanisms (C4): a uniform capability interface over several
//! independent backends, each storing only ciphertext.

pub mod mechanisms;

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::crypto::{Key, SealedMessage};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationType {
    FileSystem,
    Registry,
    AlternateStream,
    Wmi,
    Steganography,
    Kernel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerLocation {
    pub location_type: LocationType,
    pub path: String,
    pub sub_path: Option<String>,
    pub identifier: Option<String>,
    pub priority: u32,
    pub write_protected: bool,
    pub system_critical: bool,
}

impl MarkerLocation {
    /// Stable identity hash over the normalized fields, used as a dedup key
    /// independent of insertion order.
    pub fn identity(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.location_type.hash(&mut hasher);
        self.path.hash(&mut hasher);
        self.sub_path.hash(&mut hasher);
        self.identifier.hash(&mut hasher);
        hasher.finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarkerState {
    Absent,
    Present,
    Tampered,
    Uncertain,
    Partial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerMetadata {
    pub account_id: u32,
    pub ban_id: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub violation_type: String,
    pub severity: f32,
    pub reason: String,
    pub version: u32,
    pub hardware_id: crate::fingerprint::HardwareId,
    pub component_snapshot: crate::fingerprint::ComponentSnapshot,
    pub app_signature: String,
    pub extra: Option<Vec<u8>>,
}

impl MarkerMetadata {
    pub fn validate(&self) -> Result<()> {
        if self.created_at > self.expires_at {
            return Err(crate::error::ErrorKind::InvalidInput(
                "marker created_at must not be after expires_at".into(),
            )
            .into());
        }
        if self.version == 0 {
            return Err(crate::error::ErrorKind::InvalidInput("marker version must be >= 1".into()).into());
        }
        Ok(())
    }
}

/// Record stored at a location: sealed metadata plus the algorithm used to
/// seal it, so verification can attempt decryption under the derived key.
#[derive(Debug, Clone)]
pub struct StoredMarker {
    pub sealed: SealedMessage,
}

/// Result of verifying a single location.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub state: MarkerState,
    pub metadata: Option<MarkerMetadata>,
}

/// Capability interface every persistence backend implements.
#[async_trait::async_trait]
pub trait PersistenceMechanism: Send + Sync {
    async fn initialize(&self) -> Result<bool>;
    async fn create(&self, location: &MarkerLocation, marker: &StoredMarker) -> Result<bool>;
    async fn check(&self, location: &MarkerLocation, key: &Key) -> Result<CheckResult>;
    async fn read(&self, location: &MarkerLocation) -> Result<Option<StoredMarker>>;
    async fn update(&self, location: &MarkerLocation, marker: &StoredMarker) -> Result<bool>;
    async fn remove(&self, location: &MarkerLocation) -> Result<bool>;
    fn supported_type(&self) -> LocationType;
    fn requires_admin(&self) -> bool;
    fn available(&self) -> bool;
    fn name(&self) -> &'static str;
}
