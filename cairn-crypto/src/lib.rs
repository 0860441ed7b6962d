//! Encryption layer for cairn.
//!
//! Provides the primitives the sync client needs to protect its key bundle:
//! - Argon2id for deriving the bundle key from the user's passphrase
//! - ChaCha20-Poly1305 for authenticated encryption
//! - Key material that zeroizes itself on drop
//!
//! # Architecture
//!
//! Two tiers of keys are involved:
//!
//! 1. **Passphrase key**: Derived from the user's passphrase and a per-account
//!    salt. It is never stored and only ever encrypts the key bundle.
//!
//! 2. **Collection keys**: Random keys generated on fresh start. They live
//!    inside the encrypted key bundle on the server and encrypt the records
//!    of each collection.

mod cipher;
mod error;
mod key;

pub use cipher::{decrypt, encrypt, EncryptedData, NONCE_SIZE, TAG_SIZE};
pub use error::{CryptoError, CryptoResult};
pub use key::{derive_key, generate_random_key, DerivedKey, KdfParams, Salt, KEY_SIZE, SALT_SIZE};
