use std::{collections::HashMap, sync::Arc};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use shared::{
    domain::{ChatId, UserId},
    protocol::{EncryptedPayload, GroupKeyEnvelope},
};

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SYMMETRIC_KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;

/// Salt and info strings binding pairwise derivation to this protocol.
const PAIRWISE_HKDF_SALT: &[u8] = b"realtime-core/pairwise-v1";
const PAIRWISE_HKDF_INFO: &[u8] = b"pairwise-aes256gcm";

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("crypto failure: {0}")]
    Crypto(String),
    #[error("no group key envelope exists for chat {chat_id}")]
    KeyNotFound { chat_id: ChatId },
    #[error("held group key version {held} is behind current version {current}")]
    StaleKey { held: u64, current: u64 },
    #[error("invalid key material length: expected {expected}, got {actual}")]
    InvalidKeyMaterial { expected: usize, actual: usize },
    #[error("key store failure: {0}")]
    Storage(String),
}

/// Persistence seam for the identity secret. The public half is
/// recomputable, so only the 32 secret bytes are stored.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn save_identity(&self, secret_bytes: &[u8]) -> anyhow::Result<()>;
    async fn load_identity(&self) -> anyhow::Result<Option<Vec<u8>>>;
}

/// 256-bit symmetric key. Pairwise secrets and group keys share this
/// representation; both are zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; SYMMETRIC_KEY_LEN]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; SYMMETRIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// ECDH-capable identity key pair, generated once per installation.
/// The private half never leaves the device.
pub struct IdentityKeyPair {
    secret: StaticSecret,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: StaticSecret::from(bytes),
        }
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        PublicKey::from(&self.secret).to_bytes()
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
}

/// Owns the local identity and implements the group-key wrap/unwrap/rotate
/// protocol. Holds no network state.
pub struct KeyManager {
    store: Arc<dyn KeyStore>,
    identity: tokio::sync::RwLock<Option<IdentityKeyPair>>,
}

impl KeyManager {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self {
            store,
            identity: tokio::sync::RwLock::new(None),
        }
    }

    /// Loads the identity key pair from the store, generating and persisting
    /// one if absent. Safe to call on every session start; returns the
    /// public half for publication to the directory collaborator.
    pub async fn ensure_identity(&self) -> Result<[u8; PUBLIC_KEY_LEN], KeyError> {
        {
            let guard = self.identity.read().await;
            if let Some(identity) = guard.as_ref() {
                return Ok(identity.public_key());
            }
        }

        let mut guard = self.identity.write().await;
        if let Some(identity) = guard.as_ref() {
            return Ok(identity.public_key());
        }

        let identity = match self
            .store
            .load_identity()
            .await
            .map_err(|e| KeyError::Storage(e.to_string()))?
        {
            Some(mut bytes) => {
                if bytes.len() != 32 {
                    return Err(KeyError::InvalidKeyMaterial {
                        expected: 32,
                        actual: bytes.len(),
                    });
                }
                let mut secret = [0u8; 32];
                secret.copy_from_slice(&bytes);
                bytes.zeroize();
                let identity = IdentityKeyPair::from_secret_bytes(secret);
                secret.zeroize();
                identity
            }
            None => {
                let identity = IdentityKeyPair::generate();
                let mut secret = identity.secret_bytes();
                self.store
                    .save_identity(&secret)
                    .await
                    .map_err(|e| KeyError::Storage(e.to_string()))?;
                secret.zeroize();
                identity
            }
        };

        let public = identity.public_key();
        *guard = Some(identity);
        Ok(public)
    }

    pub async fn public_key(&self) -> Result<[u8; PUBLIC_KEY_LEN], KeyError> {
        self.ensure_identity().await
    }

    /// ECDH against the peer's public key, compressed through HKDF-SHA256
    /// into a fixed-length symmetric key. Deterministic per key pair,
    /// recomputed per use, never persisted.
    pub async fn derive_pairwise_secret(
        &self,
        peer_public: &[u8; PUBLIC_KEY_LEN],
    ) -> Result<SymmetricKey, KeyError> {
        self.ensure_identity().await?;
        let guard = self.identity.read().await;
        let identity = guard
            .as_ref()
            .ok_or_else(|| KeyError::Crypto("identity unavailable".to_string()))?;

        let shared = identity
            .secret
            .diffie_hellman(&PublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return Err(KeyError::Crypto(
                "peer public key produced a non-contributory shared secret".to_string(),
            ));
        }

        let hk = Hkdf::<Sha256>::new(Some(PAIRWISE_HKDF_SALT), shared.as_bytes());
        let mut okm = [0u8; SYMMETRIC_KEY_LEN];
        hk.expand(PAIRWISE_HKDF_INFO, &mut okm)
            .map_err(|_| KeyError::Crypto("hkdf expansion failed".to_string()))?;

        let key = SymmetricKey(okm);
        okm.zeroize();
        Ok(key)
    }

    /// AES-256-GCM with a random 96-bit IV per call. The IV is never reused.
    pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<EncryptedPayload, KeyError> {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| KeyError::Crypto(e.to_string()))?;
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| KeyError::Crypto("aes-gcm encryption failed".to_string()))?;
        Ok(EncryptedPayload {
            iv: iv.to_vec(),
            ciphertext,
        })
    }

    /// Fails on a tampered ciphertext, a wrong key, or a malformed IV.
    /// Callers must never fall back to treating the payload as plaintext.
    pub fn decrypt(key: &SymmetricKey, payload: &EncryptedPayload) -> Result<Vec<u8>, KeyError> {
        if payload.iv.len() != IV_LEN {
            return Err(KeyError::InvalidKeyMaterial {
                expected: IV_LEN,
                actual: payload.iv.len(),
            });
        }
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| KeyError::Crypto(e.to_string()))?;
        cipher
            .decrypt(Nonce::from_slice(&payload.iv), payload.ciphertext.as_ref())
            .map_err(|_| KeyError::Crypto("aes-gcm authentication failed".to_string()))
    }

    /// Fresh random 256-bit group key, independent of any identity key.
    pub fn generate_group_key() -> SymmetricKey {
        let mut bytes = [0u8; SYMMETRIC_KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        let key = SymmetricKey(bytes);
        bytes.zeroize();
        key
    }

    /// Encrypts the raw group key bytes under the pairwise secret between
    /// the local identity and the member's public key.
    pub async fn wrap_group_key_for_member(
        &self,
        group_key: &SymmetricKey,
        member_public: &[u8; PUBLIC_KEY_LEN],
    ) -> Result<EncryptedPayload, KeyError> {
        let pairwise = self.derive_pairwise_secret(member_public).await?;
        Self::encrypt(&pairwise, group_key.as_bytes())
    }

    /// Inverse of [`wrap_group_key_for_member`]: derives the same pairwise
    /// secret from the reader's private key and the wrapping party's public
    /// key, then re-imports the raw bytes.
    pub async fn unwrap_group_key(
        &self,
        entry: &EncryptedPayload,
        wrapping_party_public: &[u8; PUBLIC_KEY_LEN],
    ) -> Result<SymmetricKey, KeyError> {
        let pairwise = self.derive_pairwise_secret(wrapping_party_public).await?;
        let mut raw = Self::decrypt(&pairwise, entry)?;
        if raw.len() != SYMMETRIC_KEY_LEN {
            let actual = raw.len();
            raw.zeroize();
            return Err(KeyError::InvalidKeyMaterial {
                expected: SYMMETRIC_KEY_LEN,
                actual,
            });
        }
        let mut bytes = [0u8; SYMMETRIC_KEY_LEN];
        bytes.copy_from_slice(&raw);
        raw.zeroize();
        let key = SymmetricKey(bytes);
        bytes.zeroize();
        Ok(key)
    }

    /// First envelope for a chat: version 1, wrapped for every member.
    pub async fn create_group_envelope(
        &self,
        created_by: UserId,
        members: &[(UserId, [u8; PUBLIC_KEY_LEN])],
    ) -> Result<(SymmetricKey, GroupKeyEnvelope), KeyError> {
        self.build_envelope(created_by, 1, members).await
    }

    /// Generates a new group key and wraps it for every current member
    /// under a strictly greater version. Used on membership changes:
    /// a removed member's copy of the old key grants no access to content
    /// encrypted under the new version.
    pub async fn rotate_group_key(
        &self,
        created_by: UserId,
        previous_version: u64,
        members: &[(UserId, [u8; PUBLIC_KEY_LEN])],
    ) -> Result<(SymmetricKey, GroupKeyEnvelope), KeyError> {
        self.build_envelope(created_by, previous_version + 1, members)
            .await
    }

    async fn build_envelope(
        &self,
        created_by: UserId,
        version: u64,
        members: &[(UserId, [u8; PUBLIC_KEY_LEN])],
    ) -> Result<(SymmetricKey, GroupKeyEnvelope), KeyError> {
        let group_key = Self::generate_group_key();
        let mut wrapped_keys = HashMap::with_capacity(members.len());
        for (member_id, member_public) in members {
            let entry = self
                .wrap_group_key_for_member(&group_key, member_public)
                .await?;
            wrapped_keys.insert(*member_id, entry);
        }
        Ok((
            group_key,
            GroupKeyEnvelope {
                version,
                created_by,
                wrapped_keys,
            },
        ))
    }
}
