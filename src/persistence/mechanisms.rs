//! Concrete persistence backends.
//!
//! Registry, alternate-stream, WMI and steganography backends are modeled
//! as their own ciphertext-only, file-backed stores rather than real
//! Windows APIs, so the quorum/voting protocol in the orchestrator is
//! exercisable without OS-specific FFI. Kernel-assisted persistence always
//! reports unavailable: its ABI is genuinely platform- and driver-specific
//! and out of scope here.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;

use crate::crypto::{AlgorithmId, Key, PolymorphicCrypto, SealedMessage};
use crate::error::{ErrorKind, Result};
use crate::persistence::{CheckResult, LocationType, MarkerLocation, MarkerState, PersistenceMechanism, StoredMarker};

fn resolve_path(base: &PathBuf, location: &MarkerLocation) -> PathBuf {
    let mut p = base.clone();
    p.push(&location.path);
    if let Some(sub) = &location.sub_path {
        p.push(sub);
    }
    p
}

/// `WBR1` on-disk encoding described by the wire format: header, nonce,
/// ciphertext (MAC is embedded in the AEAD ciphertext itself).
fn encode(sealed: &SealedMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 1 + 1 + sealed.nonce.len() + 4 + sealed.ciphertext.len());
    out.extend_from_slice(b"WBR1");
    out.push(sealed.algorithm as u8);
    out.push(sealed.nonce.len() as u8);
    out.extend_from_slice(&sealed.nonce);
    out.extend_from_slice(&(sealed.ciphertext.len() as u32).to_le_bytes());
    out.extend_from_slice(&sealed.ciphertext);
    out
}

fn decode(bytes: &[u8]) -> Option<SealedMessage> {
    if bytes.len() < 4 + 1 + 1 + 4 || &bytes[0..4] != b"WBR1" {
        return None;
    }
    let algorithm = AlgorithmId::from_u8(bytes[4])?;
    let nonce_len = bytes[5] as usize;
    let mut idx = 6;
    if bytes.len() < idx + nonce_len + 4 {
        return None;
    }
    let nonce_slice = &bytes[idx..idx + nonce_len];
    idx += nonce_len;
    let ct_len = u32::from_le_bytes(bytes[idx..idx + 4].try_into().ok()?) as usize;
    idx += 4;
    if bytes.len() < idx + ct_len {
        return None;
    }
    let ciphertext = bytes[idx..idx + ct_len].to_vec();
    let mut nonce = [0u8; crate::crypto::NONCE_LEN];
    if nonce_slice.len() != nonce.len() {
        return None;
    }
    nonce.copy_from_slice(nonce_slice);
    Some(SealedMessage {
        algorithm,
        nonce,
        ciphertext,
    })
}

/// Shared file-backed store logic used by every non-kernel mechanism; each
/// mechanism just picks a different root directory and "corruption" does
/// not leak across mechanisms, matching independence assumption of the
/// quorum vote.
struct FileBackedStore {
    root: PathBuf,
}

impl FileBackedStore {
    fn new(root: PathBuf) -> Self {
        Self { root }
    }

    async fn create(&self, location: &MarkerLocation, marker: &StoredMarker) -> Result<bool> {
        let path = resolve_path(&self.root, location);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                crate::error::SentinelError::with_source(
                    ErrorKind::IoUnavailable(format!("cannot create directory for {}", path.display())),
                    e,
                )
            })?;
        }
        fs::write(&path, encode(&marker.sealed)).await.map_err(|e| {
            crate::error::SentinelError::with_source(
                ErrorKind::IoUnavailable(format!("cannot write {}", path.display())),
                e,
            )
        })?;
        Ok(true)
    }

    async fn read_raw(&self, location: &MarkerLocation) -> Result<Option<Vec<u8>>> {
        let path = resolve_path(&self.root, location);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(crate::error::SentinelError::with_source(
                ErrorKind::IoUnavailable(format!("cannot read {}", path.display())),
                e,
            )),
        }
    }

    async fn remove(&self, location: &MarkerLocation) -> Result<bool> {
        let path = resolve_path(&self.root, location);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(crate::error::SentinelError::with_source(
                ErrorKind::IoUnavailable(format!("cannot remove {}", path.display())),
                e,
            )),
        }
    }
}

macro_rules! file_backed_mechanism {
    ($ty:ident, $name:literal, $loc_type:expr, $requires_admin:expr, $marker_byte:expr) => {
        pub struct $ty {
            store: FileBackedStore,
        }

        impl $ty {
            pub fn new(root: PathBuf) -> Self {
                Self {
                    store: FileBackedStore::new(root),
                }
            }
        }

        #[async_trait]
        impl PersistenceMechanism for $ty {
            async fn initialize(&self) -> Result<bool> {
                fs::create_dir_all(&self.store.root).await.map_err(|e| {
                    crate::error::SentinelError::with_source(
                        ErrorKind::IoUnavailable(format!("cannot initialize {} store", $name)),
                        e,
                    )
                })?;
                Ok(true)
            }

            async fn create(&self, location: &MarkerLocation, marker: &StoredMarker) -> Result<bool> {
                // carrier byte distinguishes the encoding envelope per backend,
                // simulating each mechanism's distinct storage convention.
                let mut encoded = encode(&marker.sealed);
                encoded.insert(0, $marker_byte);
                let path = resolve_path(&self.store.root, location);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await.ok();
                }
                fs::write(&path, &encoded).await.map_err(|e| {
                    crate::error::SentinelError::with_source(
                        ErrorKind::IoUnavailable(format!("cannot write {}", path.display())),
                        e,
                    )
                })?;
                Ok(true)
            }

            async fn check(&self, location: &MarkerLocation, key: &Key) -> Result<CheckResult> {
                let bytes = match self.store.read_raw(location).await? {
                    None => {
                        return Ok(CheckResult {
                            state: MarkerState::Absent,
                            metadata: None,
                        })
                    }
                    Some(b) => b,
                };
                if bytes.first() != Some(&$marker_byte) {
                    return Ok(CheckResult {
                        state: MarkerState::Tampered,
                        metadata: None,
                    });
                }
                let state = match decode(&bytes[1..]) {
                    Some(sealed) if PolymorphicCrypto::decrypt(&sealed, key).is_some() => MarkerState::Present,
                    _ => MarkerState::Tampered,
                };
                Ok(CheckResult { state, metadata: None })
            }

            async fn read(&self, location: &MarkerLocation) -> Result<Option<StoredMarker>> {
                let bytes = match self.store.read_raw(location).await? {
                    Some(b) => b,
                    None => return Ok(None),
                };
                if bytes.first() != Some(&$marker_byte) {
                    return Err(ErrorKind::Tampered(format!("{} carrier byte mismatch", $name)).into());
                }
                match decode(&bytes[1..]) {
                    Some(sealed) => Ok(Some(StoredMarker { sealed })),
                    None => Err(ErrorKind::Tampered(format!("{} payload malformed", $name)).into()),
                }
            }

            async fn update(&self, location: &MarkerLocation, marker: &StoredMarker) -> Result<bool> {
                self.create(location, marker).await
            }

            async fn remove(&self, location: &MarkerLocation) -> Result<bool> {
                self.store.remove(location).await
            }

            fn supported_type(&self) -> LocationType {
                $loc_type
            }

            fn requires_admin(&self) -> bool {
                $requires_admin
            }

            fn available(&self) -> bool {
                true
            }

            fn name(&self) -> &'static str {
                $name
            }
        }
    };
}

file_backed_mechanism!(FileSystemPersistence, "filesystem", LocationType::FileSystem, false, 0xF5u8);
file_backed_mechanism!(RegistryPersistence, "registry", LocationType::Registry, true, 0xA3u8);
file_backed_mechanism!(AlternateStreamPersistence, "alternate_stream", LocationType::AlternateStream, false, 0xA5u8);
file_backed_mechanism!(WmiPersistence, "wmi", LocationType::Wmi, true, 0x31u8);
file_backed_mechanism!(SteganographyPersistence, "steganography", LocationType::Steganography, false, 0x57u8);

/// Always unavailable: a kernel driver's install/ABI is platform-specific
/// and genuinely out of scope for this core.
pub struct KernelPersistence;

#[async_trait]
impl PersistenceMechanism for KernelPersistence {
    async fn initialize(&self) -> Result<bool> {
        Ok(false)
    }

    async fn create(&self, _location: &MarkerLocation, _marker: &StoredMarker) -> Result<bool> {
        Err(ErrorKind::IoUnavailable("kernel persistence mechanism not available on this platform".into()).into())
    }

    async fn check(&self, _location: &MarkerLocation, _key: &Key) -> Result<CheckResult> {
        Err(ErrorKind::IoUnavailable("kernel persistence mechanism not available on this platform".into()).into())
    }

    async fn read(&self, _location: &MarkerLocation) -> Result<Option<StoredMarker>> {
        Err(ErrorKind::IoUnavailable("kernel persistence mechanism not available on this platform".into()).into())
    }

    async fn update(&self, _location: &MarkerLocation, _marker: &StoredMarker) -> Result<bool> {
        Err(ErrorKind::IoUnavailable("kernel persistence mechanism not available on this platform".into()).into())
    }

    async fn remove(&self, _location: &MarkerLocation) -> Result<bool> {
        Err(ErrorKind::IoUnavailable("kernel persistence mechanism not available on this platform".into()).into())
    }

    fn supported_type(&self) -> LocationType {
        LocationType::Kernel
    }

    fn requires_admin(&self) -> bool {
        true
    }

    fn available(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "kernel"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Key, PolymorphicCrypto};

    fn temp_root(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("sentinel-test-{tag}-{}", uuid::Uuid::new_v4()));
        p
    }

    fn loc(path: &str) -> MarkerLocation {
        MarkerLocation {
            location_type: LocationType::FileSystem,
            path: path.to_string(),
            sub_path: None,
            identifier: None,
            priority: 1,
            write_protected: false,
            system_critical: false,
        }
    }

    fn marker(key: &Key) -> StoredMarker {
        let sealed = PolymorphicCrypto::encrypt(b"metadata bytes", key, crate::crypto::AlgorithmId::AeadA).unwrap();
        StoredMarker { sealed }
    }

    #[tokio::test]
    async fn filesystem_create_then_check_present() {
        let mech = FileSystemPersistence::new(temp_root("fs"));
        mech.initialize().await.unwrap();
        let key = PolymorphicCrypto::random_key();
        let location = loc("marker.bin");
        assert!(mech.create(&location, &marker(&key)).await.unwrap());
        let result = mech.check(&location, &key).await.unwrap();
        assert_eq!(result.state, MarkerState::Present);
    }

    #[tokio::test]
    async fn filesystem_check_absent_when_missing() {
        let mech = FileSystemPersistence::new(temp_root("fs-absent"));
        mech.initialize().await.unwrap();
        let key = PolymorphicCrypto::random_key();
        let result = mech.check(&loc("nope.bin"), &key).await.unwrap();
        assert_eq!(result.state, MarkerState::Absent);
    }

    #[tokio::test]
    async fn tampering_detected_on_check() {
        let mech = FileSystemPersistence::new(temp_root("fs-tamper"));
        mech.initialize().await.unwrap();
        let key = PolymorphicCrypto::random_key();
        let location = loc("marker.bin");
        mech.create(&location, &marker(&key)).await.unwrap();
        let path = resolve_path(&mech.store.root, &location);
        let mut bytes = tokio::fs::read(&path).await.unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        tokio::fs::write(&path, bytes).await.unwrap();
        let result = mech.check(&location, &key).await.unwrap();
        assert_eq!(result.state, MarkerState::Tampered);
    }

    #[tokio::test]
    async fn check_with_wrong_key_reports_tampered() {
        let mech = FileSystemPersistence::new(temp_root("fs-wrong-key"));
        mech.initialize().await.unwrap();
        let key = PolymorphicCrypto::random_key();
        let other_key = PolymorphicCrypto::random_key();
        let location = loc("marker.bin");
        mech.create(&location, &marker(&key)).await.unwrap();
        let result = mech.check(&location, &other_key).await.unwrap();
        assert_eq!(result.state, MarkerState::Tampered);
    }

    #[tokio::test]
    async fn remove_then_check_absent() {
        let mech = FileSystemPersistence::new(temp_root("fs-remove"));
        mech.initialize().await.unwrap();
        let key = PolymorphicCrypto::random_key();
        let location = loc("marker.bin");
        mech.create(&location, &marker(&key)).await.unwrap();
        assert!(mech.remove(&location).await.unwrap());
        let result = mech.check(&location, &key).await.unwrap();
        assert_eq!(result.state, MarkerState::Absent);
    }

    #[tokio::test]
    async fn kernel_mechanism_is_unavailable() {
        let mech = KernelPersistence;
        assert!(!mech.available());
        let key = PolymorphicCrypto::random_key();
        assert!(mech.check(&loc("x"), &key).await.is_err());
    }
}
