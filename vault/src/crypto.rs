//! Password-based authenticated encryption for vault payloads.
//!
//! Every sealed blob is self-contained: `salt || nonce || tag || ciphertext`.
//! The key is stretched from the password with Argon2id using the salt
//! embedded in the blob, and the payload is protected with AES-256-GCM.
//! Opening fails with [`WalletError::AuthenticationFailed`] whether the
//! password is wrong or the blob was modified; callers cannot tell which.
//!
//! Master-password hashing lives here as well but never shares keys with
//! the payload path: it produces an Argon2id PHC string.
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::RngCore;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::errors::{WalletError, WalletResult};

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const HEADER_LEN: usize = SALT_LEN + NONCE_LEN + TAG_LEN;

/// Argon2id work factor. Fixed per vault once the master password is set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KdfParameters {
    pub m_cost_kib: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfParameters {
    fn default() -> Self {
        Self {
            m_cost_kib: 64 * 1024, // 64 MiB
            t_cost: 3,
            p_cost: 1,
        }
    }
}

impl KdfParameters {
    pub const fn new(m_cost_kib: u32, t_cost: u32, p_cost: u32) -> Self {
        Self {
            m_cost_kib,
            t_cost,
            p_cost,
        }
    }

    fn argon2(&self) -> WalletResult<Argon2<'static>> {
        let params = Params::new(self.m_cost_kib, self.t_cost, self.p_cost, Some(KEY_LEN))
            .map_err(|e| WalletError::CryptoError(format!("Invalid Argon2 params: {e}")))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

/// Seals and opens payloads under a password.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Envelope {
    kdf: KdfParameters,
}

impl Envelope {
    pub fn new(kdf: KdfParameters) -> Self {
        Self { kdf }
    }

    pub fn kdf(&self) -> KdfParameters {
        self.kdf
    }

    /// Seal `plaintext` with a fresh random salt and nonce.
    pub fn seal(&self, plaintext: &[u8], password: &SecretString) -> WalletResult<Vec<u8>> {
        let mut rng = OsRng;
        let mut salt = [0u8; SALT_LEN];
        rng.fill_bytes(&mut salt);
        let mut nonce = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut nonce);
        self.seal_with(plaintext, password, salt, nonce)
    }

    /// Seal with caller-provided salt and nonce. Only for reproducible tests;
    /// reusing a nonce under the same salt and password breaks AES-GCM.
    pub fn seal_with(
        &self,
        plaintext: &[u8],
        password: &SecretString,
        salt: [u8; SALT_LEN],
        nonce: [u8; NONCE_LEN],
    ) -> WalletResult<Vec<u8>> {
        let key = self.derive_key(password, &salt)?;
        let key = aead_key(&key)?;

        let mut in_out = Zeroizing::new(plaintext.to_vec());
        let tag = key
            .seal_in_place_separate_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::empty(),
                in_out.as_mut_slice(),
            )
            .map_err(|_| WalletError::CryptoError("Encryption failure".to_string()))?;

        let mut blob = Vec::with_capacity(HEADER_LEN + in_out.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(tag.as_ref());
        blob.extend_from_slice(&in_out);
        Ok(blob)
    }

    /// Open a sealed blob. Wrong password, truncation and tampering all
    /// surface as [`WalletError::AuthenticationFailed`].
    pub fn open(&self, blob: &[u8], password: &SecretString) -> WalletResult<Zeroizing<Vec<u8>>> {
        if blob.len() < HEADER_LEN {
            return Err(WalletError::AuthenticationFailed);
        }

        let (salt, rest) = blob.split_at(SALT_LEN);
        let (nonce, rest) = rest.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(nonce);

        let key = self.derive_key(password, salt)?;
        let key = aead_key(&key)?;

        // ring expects the tag appended to the ciphertext.
        let mut in_out = Zeroizing::new(Vec::with_capacity(ciphertext.len() + TAG_LEN));
        in_out.extend_from_slice(ciphertext);
        in_out.extend_from_slice(tag);

        let plaintext_len = key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                in_out.as_mut_slice(),
            )
            .map_err(|_| WalletError::AuthenticationFailed)?
            .len();
        in_out.truncate(plaintext_len);
        Ok(in_out)
    }

    /// Hash the master password into an Argon2id PHC string.
    pub fn hash_password(&self, password: &SecretString) -> WalletResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .kdf
            .argon2()?
            .hash_password(password.expose_secret().as_bytes(), &salt)
            .map_err(|e| WalletError::CryptoError(format!("Password hashing failed: {e}")))?;
        Ok(hash.to_string())
    }

    /// Constant-time check of `password` against a stored PHC string.
    /// A malformed digest never verifies.
    pub fn verify_password(&self, password: &SecretString, digest: &str) -> bool {
        let parsed = match PasswordHash::new(digest) {
            Ok(parsed) => parsed,
            Err(err) => {
                log::warn!("Stored password hash is malformed: {err}");
                return false;
            }
        };
        match self.kdf.argon2() {
            Ok(argon2) => argon2
                .verify_password(password.expose_secret().as_bytes(), &parsed)
                .is_ok(),
            Err(_) => false,
        }
    }

    fn derive_key(
        &self,
        password: &SecretString,
        salt: &[u8],
    ) -> WalletResult<Zeroizing<[u8; KEY_LEN]>> {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        self.kdf
            .argon2()?
            .hash_password_into(password.expose_secret().as_bytes(), salt, key.as_mut())
            .map_err(|e| WalletError::CryptoError(format!("KDF failed: {e}")))?;
        Ok(key)
    }
}

fn aead_key(key: &Zeroizing<[u8; KEY_LEN]>) -> WalletResult<LessSafeKey> {
    let unbound_key = UnboundKey::new(&aead::AES_256_GCM, key.as_ref())
        .map_err(|e| WalletError::CryptoError(format!("Invalid encryption key: {e}")))?;
    Ok(LessSafeKey::new(unbound_key))
}
