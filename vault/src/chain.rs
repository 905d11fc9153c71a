//! Chain adapters turn seeds and private keys into addresses and
//! signatures. The vault only stores what they return.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bip39::{Language, Mnemonic};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use futures::future::BoxFuture;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha512;
use sha3::{Digest, Sha3_256};
use zeroize::{Zeroize, Zeroizing};

use crate::errors::{WalletError, WalletResult};

type HmacSha512 = Hmac<Sha512>;

/// The hardened index offset (0x80000000) per BIP-32/SLIP-0010.
const HARDENED_OFFSET: u32 = 0x8000_0000;
/// HMAC key for master key generation per SLIP-0010.
const MASTER_HMAC_KEY: &[u8] = b"ed25519 seed";

/// Output of a chain adapter. Secrets stay wrapped.
#[derive(Debug)]
pub struct KeyMaterial {
    pub address: String,
    pub public_key: String,
    pub private_key: Option<SecretString>,
    pub mnemonic: Option<SecretString>,
}

/// Capability interface for one chain family.
pub trait ChainAdapter: Send + Sync {
    /// Tag stored with every wallet of this family.
    fn chain_type(&self) -> &str;

    /// Fresh key material. Adapters that support HD wallets include the
    /// mnemonic, with the key at derivation index 0.
    fn generate(&self) -> WalletResult<KeyMaterial>;

    fn import_from_private_key(&self, private_key: &SecretString) -> WalletResult<KeyMaterial>;

    fn import_from_mnemonic(&self, mnemonic: &SecretString, index: u32)
        -> WalletResult<KeyMaterial>;

    /// Sign `message`, returning the signature in the chain's text encoding.
    fn sign(&self, private_key: &SecretString, message: &[u8]) -> WalletResult<String>;

    fn get_balance<'a>(&'a self, _address: &'a str) -> BoxFuture<'a, WalletResult<u128>> {
        let chain = self.chain_type().to_string();
        Box::pin(async move {
            Err(WalletError::NetworkError(format!(
                "{chain} adapter has no balance backend"
            )))
        })
    }
}

/// Adapters keyed by chain type.
#[derive(Clone, Default)]
pub struct ChainAdapters {
    adapters: BTreeMap<String, Arc<dyn ChainAdapter>>,
}

impl ChainAdapters {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in Ed25519 family.
    pub fn with_defaults() -> Self {
        let mut adapters = Self::new();
        adapters.register(Arc::new(Ed25519Adapter::default()));
        adapters
    }

    pub fn register(&mut self, adapter: Arc<dyn ChainAdapter>) {
        self.adapters
            .insert(adapter.chain_type().to_string(), adapter);
    }

    pub fn get(&self, chain_type: &str) -> WalletResult<Arc<dyn ChainAdapter>> {
        self.adapters.get(chain_type).cloned().ok_or_else(|| {
            WalletError::ValidationError(format!("Unsupported chain type '{chain_type}'"))
        })
    }

    pub fn chain_types(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ChainAdapter>> {
        self.adapters.values()
    }
}

impl fmt::Debug for ChainAdapters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.adapters.keys()).finish()
    }
}

/// Ed25519 keys derived along `m/44'/<coin>'/<index>'/0'` (SLIP-0010).
#[derive(Debug, Clone)]
pub struct Ed25519Adapter {
    chain_type: String,
    coin_type: u32,
    word_count: usize,
}

impl Default for Ed25519Adapter {
    fn default() -> Self {
        Self::new("ed25519", 501)
    }
}

impl Ed25519Adapter {
    pub fn new(chain_type: impl Into<String>, coin_type: u32) -> Self {
        Self {
            chain_type: chain_type.into(),
            coin_type,
            word_count: 12,
        }
    }

    /// Mnemonic length used by `generate` (12, 15, 18, 21 or 24 words).
    pub fn with_word_count(mut self, word_count: usize) -> WalletResult<Self> {
        if ![12, 15, 18, 21, 24].contains(&word_count) {
            return Err(WalletError::ValidationError(
                "Invalid word count: must be 12, 15, 18, 21, or 24".to_string(),
            ));
        }
        self.word_count = word_count;
        Ok(self)
    }

    pub fn derivation_path(&self, index: u32) -> String {
        format!("m/44'/{}'/{}'/0'", self.coin_type, index)
    }

    /// Check a hex signature produced by [`ChainAdapter::sign`].
    pub fn verify(public_key_hex: &str, message: &[u8], signature_hex: &str) -> WalletResult<bool> {
        let public_bytes: [u8; 32] = decode_hex_exact(public_key_hex, "public key")?;
        let verifying_key = VerifyingKey::from_bytes(&public_bytes)
            .map_err(|e| WalletError::InvalidKey(format!("Invalid public key: {e}")))?;
        let signature_bytes: [u8; 64] = decode_hex_exact(signature_hex, "signature")?;
        let signature = Signature::from_bytes(&signature_bytes);
        Ok(verifying_key.verify(message, &signature).is_ok())
    }

    fn material(signing_key: &SigningKey, mnemonic: Option<SecretString>) -> KeyMaterial {
        let public = signing_key.verifying_key().to_bytes();
        KeyMaterial {
            address: address_from_public_key(&public),
            public_key: hex::encode(public),
            private_key: Some(SecretString::from(hex::encode(signing_key.to_bytes()))),
            mnemonic,
        }
    }

    fn signing_key(private_key: &SecretString) -> WalletResult<SigningKey> {
        let raw = private_key.expose_secret().trim();
        let raw = raw.strip_prefix("0x").unwrap_or(raw);
        let bytes = Zeroizing::new(
            hex::decode(raw).map_err(|_| WalletError::InvalidKey("Private key is not hex".into()))?,
        );

        match bytes.len() {
            32 => {
                let mut secret = Zeroizing::new([0u8; 32]);
                secret.copy_from_slice(&bytes);
                Ok(SigningKey::from_bytes(&secret))
            }
            // secret || public keypair encoding
            64 => {
                let mut keypair = Zeroizing::new([0u8; 64]);
                keypair.copy_from_slice(&bytes);
                SigningKey::from_keypair_bytes(&keypair)
                    .map_err(|_| WalletError::InvalidKey("Keypair halves do not match".into()))
            }
            other => Err(WalletError::InvalidKey(format!(
                "Expected 32 or 64 key bytes, got {other}"
            ))),
        }
    }
}

impl ChainAdapter for Ed25519Adapter {
    fn chain_type(&self) -> &str {
        &self.chain_type
    }

    fn generate(&self) -> WalletResult<KeyMaterial> {
        let mnemonic = generate_mnemonic(self.word_count)?;
        self.import_from_mnemonic(&mnemonic, 0)
    }

    fn import_from_private_key(&self, private_key: &SecretString) -> WalletResult<KeyMaterial> {
        let signing_key = Self::signing_key(private_key)?;
        Ok(Self::material(&signing_key, None))
    }

    fn import_from_mnemonic(
        &self,
        mnemonic: &SecretString,
        index: u32,
    ) -> WalletResult<KeyMaterial> {
        if index >= HARDENED_OFFSET {
            return Err(WalletError::ValidationError(format!(
                "Derivation index {index} out of range"
            )));
        }

        let normalized = normalize_mnemonic(mnemonic);
        let parsed = Mnemonic::parse_in_normalized(Language::English, &normalized)
            .map_err(|e| WalletError::InvalidKey(format!("Invalid mnemonic: {e}")))?;
        let seed = Zeroizing::new(parsed.to_seed(""));

        let path = [44, self.coin_type, index, 0];
        let mut key = derive_hardened_path(seed.as_ref(), &path)?;
        let signing_key = SigningKey::from_bytes(&key);
        key.zeroize();

        Ok(Self::material(
            &signing_key,
            Some(SecretString::from(normalized.to_string())),
        ))
    }

    fn sign(&self, private_key: &SecretString, message: &[u8]) -> WalletResult<String> {
        let signing_key = Self::signing_key(private_key)?;
        Ok(hex::encode(signing_key.sign(message).to_bytes()))
    }
}

/// Collapse whitespace and case so the same phrase always maps to the
/// same seed and fingerprint.
pub fn normalize_mnemonic(mnemonic: &SecretString) -> Zeroizing<String> {
    Zeroizing::new(
        mnemonic
            .expose_secret()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase(),
    )
}

/// `0x` + last 20 bytes of SHA3-256(public key).
pub fn address_from_public_key(public_key: &[u8]) -> String {
    let digest = Sha3_256::digest(public_key);
    format!("0x{}", hex::encode(&digest[12..]))
}

fn generate_mnemonic(word_count: usize) -> WalletResult<SecretString> {
    let mut entropy = Zeroizing::new(vec![0u8; word_count / 3 * 4]);
    OsRng
        .try_fill_bytes(&mut entropy)
        .map_err(|e| WalletError::CryptoError(format!("Failed to generate entropy: {}", e)))?;

    let mnemonic = Mnemonic::from_entropy(&entropy)
        .map_err(|e| WalletError::CryptoError(format!("Failed to create mnemonic: {}", e)))?;
    Ok(SecretString::from(mnemonic.to_string()))
}

fn derive_hardened_path(seed: &[u8], indices: &[u32]) -> WalletResult<[u8; 32]> {
    let master = hmac_sha512(MASTER_HMAC_KEY, seed)?;
    let mut key = [0u8; 32];
    let mut chain_code = [0u8; 32];
    key.copy_from_slice(&master[..32]);
    chain_code.copy_from_slice(&master[32..]);

    for &index in indices {
        // data = 0x00 || parent_key || ser32(index | hardened)
        let mut data = Zeroizing::new([0u8; 37]);
        data[1..33].copy_from_slice(&key);
        data[33..].copy_from_slice(&(index | HARDENED_OFFSET).to_be_bytes());

        let child = hmac_sha512(&chain_code, data.as_ref())?;
        key.copy_from_slice(&child[..32]);
        chain_code.copy_from_slice(&child[32..]);
    }

    chain_code.zeroize();
    Ok(key)
}

fn hmac_sha512(key: &[u8], data: &[u8]) -> WalletResult<Zeroizing<[u8; 64]>> {
    let mut mac = HmacSha512::new_from_slice(key)
        .map_err(|e| WalletError::CryptoError(format!("HMAC error: {}", e)))?;
    mac.update(data);
    let mut output = Zeroizing::new([0u8; 64]);
    output.copy_from_slice(&mac.finalize().into_bytes());
    Ok(output)
}

fn decode_hex_exact<const N: usize>(value: &str, what: &str) -> WalletResult<[u8; N]> {
    let raw = value.trim();
    let raw = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes =
        hex::decode(raw).map_err(|_| WalletError::InvalidKey(format!("{what} is not hex")))?;
    bytes
        .try_into()
        .map_err(|_| WalletError::InvalidKey(format!("{what} must be {N} bytes")))
}
