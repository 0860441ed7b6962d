//! Decrypted key bundle and its sealed wire form.

use crate::error::{SyncError, SyncResult};
use cairn_crypto::{decrypt, encrypt, generate_random_key, CryptoError, DerivedKey, EncryptedData};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use zeroize::Zeroizing;

/// Default collection key plus optional per-collection overrides.
#[derive(Clone, Debug)]
pub struct KeyBundle {
    default: DerivedKey,
    collections: HashMap<String, DerivedKey>,
}

/// Plaintext JSON inside the sealed bundle.
#[derive(Serialize, Deserialize)]
struct KeyBundlePayload {
    default: String,
    #[serde(default)]
    collections: BTreeMap<String, String>,
}

impl KeyBundle {
    /// A bundle with a fresh random default key and no overrides.
    pub fn generate() -> Self {
        Self {
            default: generate_random_key(),
            collections: HashMap::new(),
        }
    }

    pub fn new(default: DerivedKey) -> Self {
        Self {
            default,
            collections: HashMap::new(),
        }
    }

    pub fn with_override(mut self, collection: impl Into<String>, key: DerivedKey) -> Self {
        self.collections.insert(collection.into(), key);
        self
    }

    pub fn default_key(&self) -> &DerivedKey {
        &self.default
    }

    /// Override for `collection`, falling back to the default key.
    pub fn key_for(&self, collection: &str) -> &DerivedKey {
        self.collections.get(collection).unwrap_or(&self.default)
    }

    pub fn has_override(&self, collection: &str) -> bool {
        self.collections.contains_key(collection)
    }

    /// Encrypts the bundle under the passphrase-derived key, producing the
    /// record payload.
    pub fn seal(&self, bundle_key: &DerivedKey) -> SyncResult<String> {
        let payload = KeyBundlePayload {
            default: self.default.to_base64(),
            collections: self
                .collections
                .iter()
                .map(|(name, key)| (name.clone(), key.to_base64()))
                .collect(),
        };
        let plaintext = Zeroizing::new(serde_json::to_vec(&payload)?);
        let sealed = encrypt(bundle_key, &plaintext)?;
        Ok(serde_json::to_string(&sealed)?)
    }

    /// Parses and decrypts a record payload.
    ///
    /// Structural problems are [`SyncError::Malformed`]; an authentication
    /// failure is [`SyncError::DecryptFailed`].
    pub fn open(payload: &str, bundle_key: &DerivedKey) -> SyncResult<Self> {
        let sealed: EncryptedData = serde_json::from_str(payload)
            .map_err(|e| SyncError::Malformed(format!("key bundle envelope: {e}")))?;

        let plaintext = match decrypt(bundle_key, &sealed) {
            Ok(pt) => Zeroizing::new(pt),
            Err(CryptoError::Decryption(_)) => return Err(SyncError::DecryptFailed),
            Err(e) => return Err(e.into()),
        };

        let parsed: KeyBundlePayload = serde_json::from_slice(&plaintext)
            .map_err(|e| SyncError::Malformed(format!("key bundle contents: {e}")))?;

        let default = decode_key(&parsed.default, "default")?;
        let mut collections = HashMap::with_capacity(parsed.collections.len());
        for (name, encoded) in &parsed.collections {
            collections.insert(name.clone(), decode_key(encoded, name)?);
        }

        Ok(Self {
            default,
            collections,
        })
    }
}

fn decode_key(encoded: &str, label: &str) -> SyncResult<DerivedKey> {
    DerivedKey::from_base64(encoded)
        .map_err(|e| SyncError::Malformed(format!("key bundle entry {label}: {e}")))
}
