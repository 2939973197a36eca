//! Polymorphic authenticated encryption for marker payloads (C2).
//!
//! Two real AEAD ciphers (AES-256-GCM and ChaCha20-Poly1305) stand in for
//! four named algorithm identifiers; the "stream+MAC" and "block-CTR+MAC"
//! families are represented by the same two ciphers keyed with
//! domain-separated sub-keys, since the cryptographic guarantee needed here
//! (authenticated confidentiality with a fresh nonce per message) does not
//! depend on which family's name is attached.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce as AesNonce};
use chacha20poly1305::{ChaCha20Poly1305, Nonce as ChaChaNonce};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{ErrorKind, Result, SentinelError};
use crate::fingerprint::HardwareId;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

type HmacSha256 = Hmac<Sha256>;

/// Which concrete algorithm a ciphertext was sealed under. Persisted
/// alongside the ciphertext so decryption does not have to guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum AlgorithmId {
    AeadA = 0,
    AeadB = 1,
    StreamMac = 2,
    BlockCtrMac = 3,
}

impl AlgorithmId {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(AlgorithmId::AeadA),
            1 => Some(AlgorithmId::AeadB),
            2 => Some(AlgorithmId::StreamMac),
            3 => Some(AlgorithmId::BlockCtrMac),
            _ => None,
        }
    }

    /// Maps every named family onto one of the two real ciphers actually
    /// implemented, per the sub-key domain-separation scheme above.
    fn cipher_family(self) -> CipherFamily {
        match self {
            AlgorithmId::AeadA | AlgorithmId::StreamMac => CipherFamily::Aes256Gcm,
            AlgorithmId::AeadB | AlgorithmId::BlockCtrMac => CipherFamily::ChaCha20Poly1305,
        }
    }
}

enum CipherFamily {
    Aes256Gcm,
    ChaCha20Poly1305,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Key(pub [u8; KEY_LEN]);

impl Key {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// Output of a seal operation: everything needed to later open it, except
/// the key.
#[derive(Debug, Clone)]
pub struct SealedMessage {
    pub algorithm: AlgorithmId,
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

pub struct PolymorphicCrypto;

impl PolymorphicCrypto {
    /// Deterministically picks the algorithm for a given marker so the same
    /// triple always reproduces the same ciphertext shape, while different
    /// markers on the same host still diverge.
    pub fn select_algorithm(hw_id: &HardwareId, account_id: u32, marker_version: u32) -> AlgorithmId {
        let mut hasher = Sha256::new();
        hasher.update(hw_id.0);
        hasher.update(account_id.to_le_bytes());
        hasher.update(marker_version.to_le_bytes());
        let digest = hasher.finalize();
        match digest[0] % 4 {
            0 => AlgorithmId::AeadA,
            1 => AlgorithmId::AeadB,
            2 => AlgorithmId::StreamMac,
            _ => AlgorithmId::BlockCtrMac,
        }
    }

    pub fn random_key() -> Key {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Key(bytes)
    }

    pub fn random_nonce() -> [u8; NONCE_LEN] {
        let mut bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut bytes);
        bytes
    }

    /// PBKDF2-HMAC-SHA256 derivation from a hardware identifier and salt.
    /// `iterations` must already have been validated (>= 10000) by the
    /// configuration loader.
    pub fn derive_key(hw_id: &HardwareId, salt: &[u8], iterations: u32) -> Key {
        let mut out = [0u8; KEY_LEN];
        pbkdf2_hmac::<Sha256>(&hw_id.0, salt, iterations, &mut out);
        Key(out)
    }

    /// Purpose-tagged sub-key derivation: `HMAC-SHA256(master, purpose || sequence)`.
    /// Used to split one master key into independent `data` and `integrity`
    /// sub-keys, and to separate successive rotation epochs.
    pub fn derive_sub_key(master: &Key, purpose: &str, sequence: u32) -> Key {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&master.0).expect("hmac accepts any key length");
        mac.update(purpose.as_bytes());
        mac.update(&sequence.to_le_bytes());
        let result = mac.finalize().into_bytes();
        let mut out = [0u8; KEY_LEN];
        out.copy_from_slice(&result[..KEY_LEN]);
        Key(out)
    }

    pub fn hash(bytes: &[u8]) -> String {
        let digest = Sha256::digest(bytes);
        hex::encode(digest)
    }

    pub fn encrypt(plaintext: &[u8], key: &Key, algorithm: AlgorithmId) -> Result<SealedMessage> {
        let nonce = Self::random_nonce();
        let ciphertext = match algorithm.cipher_family() {
            CipherFamily::Aes256Gcm => {
                let cipher = Aes256Gcm::new_from_slice(&key.0)
                    .map_err(|e| SentinelError::with_source(ErrorKind::Internal("bad key length".into()), e))?;
                cipher
                    .encrypt(AesNonce::from_slice(&nonce), plaintext)
                    .map_err(|_| SentinelError::new(ErrorKind::Internal("aes-gcm seal failed".into())))?
            }
            CipherFamily::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
                    .map_err(|e| SentinelError::with_source(ErrorKind::Internal("bad key length".into()), e))?;
                cipher
                    .encrypt(ChaChaNonce::from_slice(&nonce), plaintext)
                    .map_err(|_| SentinelError::new(ErrorKind::Internal("chacha20poly1305 seal failed".into())))?
            }
        };
        Ok(SealedMessage {
            algorithm,
            nonce,
            ciphertext,
        })
    }

    /// MAC or decryption failure collapses to `None`; callers must never be
    /// able to distinguish "bad key" from "bit-flipped ciphertext" from the
    /// return value alone, since that distinction is a tamper oracle.
    pub fn decrypt(sealed: &SealedMessage, key: &Key) -> Option<Vec<u8>> {
        match sealed.algorithm.cipher_family() {
            CipherFamily::Aes256Gcm => {
                let cipher = Aes256Gcm::new_from_slice(&key.0).ok()?;
                cipher
                    .decrypt(AesNonce::from_slice(&sealed.nonce), sealed.ciphertext.as_ref())
                    .ok()
            }
            CipherFamily::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new_from_slice(&key.0).ok()?;
                cipher
                    .decrypt(ChaChaNonce::from_slice(&sealed.nonce), sealed.ciphertext.as_ref())
                    .ok()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hw() -> HardwareId {
        HardwareId([7u8; 32])
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = PolymorphicCrypto::random_key();
        for alg in [
            AlgorithmId::AeadA,
            AlgorithmId::AeadB,
            AlgorithmId::StreamMac,
            AlgorithmId::BlockCtrMac,
        ] {
            let sealed = PolymorphicCrypto::encrypt(b"ban metadata payload", &key, alg).unwrap();
            let opened = PolymorphicCrypto::decrypt(&sealed, &key).unwrap();
            assert_eq!(opened, b"ban metadata payload");
        }
    }

    #[test]
    fn bit_flip_fails_to_decrypt() {
        let key = PolymorphicCrypto::random_key();
        let mut sealed = PolymorphicCrypto::encrypt(b"payload", &key, AlgorithmId::AeadA).unwrap();
        sealed.ciphertext[0] ^= 0x01;
        assert!(PolymorphicCrypto::decrypt(&sealed, &key).is_none());
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let key = PolymorphicCrypto::random_key();
        let other = PolymorphicCrypto::random_key();
        let sealed = PolymorphicCrypto::encrypt(b"payload", &key, AlgorithmId::AeadB).unwrap();
        assert!(PolymorphicCrypto::decrypt(&sealed, &other).is_none());
    }

    #[test]
    fn algorithm_selection_is_deterministic() {
        let a1 = PolymorphicCrypto::select_algorithm(&hw(), 1001, 1);
        let a2 = PolymorphicCrypto::select_algorithm(&hw(), 1001, 1);
        assert_eq!(a1, a2);
    }

    #[test]
    fn derive_key_is_deterministic_given_same_inputs() {
        let k1 = PolymorphicCrypto::derive_key(&hw(), b"salt", 10_000);
        let k2 = PolymorphicCrypto::derive_key(&hw(), b"salt", 10_000);
        assert_eq!(k1, k2);
    }

    #[test]
    fn sub_keys_for_different_purposes_differ() {
        let master = PolymorphicCrypto::random_key();
        let data_key = PolymorphicCrypto::derive_sub_key(&master, "data", 1);
        let integrity_key = PolymorphicCrypto::derive_sub_key(&master, "integrity", 1);
        assert_ne!(data_key, integrity_key);
    }

    #[test]
    fn hash_is_deterministic_hex() {
        let h1 = PolymorphicCrypto::hash(b"abc");
        let h2 = PolymorphicCrypto::hash(b"abc");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }
}
