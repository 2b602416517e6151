//! Content encryption: per-entry AEAD bound to entry identity, and the
//! password-wrapped key file.

use std::fmt::{self, Debug};
use std::io;
use std::path::{Path, PathBuf};

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use satchel_sync::EntryId;

/// Key length in bytes.
pub const KEY_SIZE: usize = 32;
/// XChaCha20 nonce length in bytes, prepended to every ciphertext.
pub const NONCE_SIZE: usize = 24;
/// Salt length for password-based key derivation.
pub const SALT_SIZE: usize = 16;

/// A 256-bit content key. The debug rendering never exposes key material.
#[derive(Clone, PartialEq, Eq)]
pub struct ContentKey([u8; KEY_SIZE]);

impl ContentKey {
    /// Generates a fresh random key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        ContentKey(key)
    }

    /// Wraps existing key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        ContentKey(bytes)
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ContentKey(..)")
    }
}

/// AEAD failures. Decryption failure carries no detail on purpose.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// Encryption failed (nonce or key setup).
    #[error("encryption failed")]
    Encrypt,
    /// Ciphertext did not authenticate under this key and associated data.
    #[error("decryption failed")]
    Decrypt,
}

/// Seals `plaintext` under `aad` with XChaCha20-Poly1305.
/// Output layout: `nonce(24) ‖ ciphertext ‖ tag(16)`.
fn seal(key: &ContentKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Encrypt)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Reverses [`seal`].
fn open(key: &ContentKey, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_SIZE {
        return Err(CryptoError::Decrypt);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    cipher
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decrypt)
}

/// Encrypts an entry payload, binding the ciphertext to the entry id: the id
/// bytes are the associated data, so ciphertexts swapped between entries
/// fail authentication.
pub fn encrypt_payload(
    key: &ContentKey,
    plaintext: &[u8],
    id: EntryId,
) -> Result<Vec<u8>, CryptoError> {
    seal(key, plaintext, id.as_bytes())
}

/// Decrypts an entry payload previously sealed for `id`.
pub fn decrypt_payload(
    key: &ContentKey,
    sealed: &[u8],
    id: EntryId,
) -> Result<Vec<u8>, CryptoError> {
    open(key, sealed, id.as_bytes())
}

/// Argon2id parameters recorded alongside the wrapped key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct KdfParams {
    #[serde(rename = "mem")]
    memory_kib: u32,
    #[serde(rename = "time")]
    iterations: u32,
    #[serde(rename = "threads")]
    parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        KdfParams {
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 2,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyFile {
    salt: String,
    data: String,
    params: KdfParams,
}

/// Errors from the key store.
#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    /// `initialize` was called on an already initialized store.
    #[error("keystore is already initialized")]
    AlreadyInitialized,
    /// `unlock` was called but no key file exists.
    #[error("keystore is not initialized")]
    NotInitialized,
    /// The password did not unwrap the master key, or the file is corrupt.
    #[error("incorrect password or corrupted key file")]
    BadPassword,
    /// The key file did not parse.
    #[error("malformed key file")]
    Malformed(#[from] serde_json::Error),
    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

const KEY_FILE_NAME: &str = "keys.json";

/// Manages the master content key: a random key wrapped under an
/// Argon2id-derived key and persisted as a small JSON file.
#[derive(Debug)]
pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    /// A key store rooted at `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        KeyStore {
            dir: dir.as_ref().to_owned(),
        }
    }

    fn key_file_path(&self) -> PathBuf {
        self.dir.join(KEY_FILE_NAME)
    }

    /// Whether a key file exists.
    pub fn is_initialized(&self) -> bool {
        self.key_file_path().exists()
    }

    /// Generates a master key, wraps it under `password`, persists the key
    /// file, and returns the key.
    pub fn initialize(&self, password: &[u8]) -> Result<ContentKey, KeyStoreError> {
        if self.is_initialized() {
            return Err(KeyStoreError::AlreadyInitialized);
        }

        let master = ContentKey::generate();
        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        let params = KdfParams::default();
        let wrapper = derive_key(password, &salt, params);
        let wrapped = seal(&wrapper, master.as_bytes(), &[])
            .expect("wrapping a fresh key cannot fail");

        let file = KeyFile {
            salt: hex::encode(salt),
            data: hex::encode(wrapped),
            params,
        };
        std::fs::create_dir_all(&self.dir)?;
        let path = self.key_file_path();
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(master)
    }

    /// Recovers the master key using `password`.
    pub fn unlock(&self, password: &[u8]) -> Result<ContentKey, KeyStoreError> {
        let bytes = match std::fs::read(self.key_file_path()) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(KeyStoreError::NotInitialized)
            }
            Err(err) => return Err(err.into()),
        };
        let file: KeyFile = serde_json::from_slice(&bytes)?;
        let salt = hex::decode(&file.salt).map_err(|_| KeyStoreError::BadPassword)?;
        let wrapped = hex::decode(&file.data).map_err(|_| KeyStoreError::BadPassword)?;

        let wrapper = derive_key(password, &salt, file.params);
        let master = open(&wrapper, &wrapped, &[]).map_err(|_| KeyStoreError::BadPassword)?;
        let master: [u8; KEY_SIZE] = master
            .try_into()
            .map_err(|_| KeyStoreError::BadPassword)?;
        Ok(ContentKey::from_bytes(master))
    }
}

fn derive_key(password: &[u8], salt: &[u8], params: KdfParams) -> ContentKey {
    let argon = argon2::Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon2::Params::new(
            params.memory_kib,
            params.iterations,
            params.parallelism,
            Some(KEY_SIZE),
        )
        .expect("static argon2 parameters are valid"),
    );
    let mut out = [0u8; KEY_SIZE];
    argon
        .hash_password_into(password, salt, &mut out)
        .expect("argon2 with valid parameters cannot fail");
    ContentKey(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trips_under_its_id() {
        let key = ContentKey::generate();
        let id = EntryId::generate();
        let sealed = encrypt_payload(&key, b"the plaintext", id).unwrap();
        // nonce(24) ‖ ciphertext ‖ tag(16)
        assert_eq!(sealed.len(), NONCE_SIZE + b"the plaintext".len() + 16);
        assert_ne!(&sealed[NONCE_SIZE..], b"the plaintext");
        assert_eq!(
            decrypt_payload(&key, &sealed, id).unwrap(),
            b"the plaintext"
        );
    }

    #[test]
    fn ciphertext_is_bound_to_the_entry_id() {
        let key = ContentKey::generate();
        let id = EntryId::generate();
        let sealed = encrypt_payload(&key, b"bound", id).unwrap();
        assert_eq!(
            decrypt_payload(&key, &sealed, EntryId::generate()),
            Err(CryptoError::Decrypt)
        );
    }

    #[test]
    fn wrong_key_and_truncated_input_fail() {
        let key = ContentKey::generate();
        let id = EntryId::generate();
        let sealed = encrypt_payload(&key, b"secret", id).unwrap();

        assert_eq!(
            decrypt_payload(&ContentKey::generate(), &sealed, id),
            Err(CryptoError::Decrypt)
        );
        assert_eq!(
            decrypt_payload(&key, &sealed[..NONCE_SIZE - 1], id),
            Err(CryptoError::Decrypt)
        );
    }

    #[test]
    fn nonces_are_fresh_per_operation() {
        let key = ContentKey::generate();
        let id = EntryId::generate();
        let first = encrypt_payload(&key, b"same input", id).unwrap();
        let second = encrypt_payload(&key, b"same input", id).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn keystore_initialize_unlock_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        assert!(!store.is_initialized());
        assert!(matches!(
            store.unlock(b"pw"),
            Err(KeyStoreError::NotInitialized)
        ));

        let master = store.initialize(b"correct horse").unwrap();
        assert!(store.is_initialized());
        assert!(matches!(
            store.initialize(b"again"),
            Err(KeyStoreError::AlreadyInitialized)
        ));

        let unlocked = store.unlock(b"correct horse").unwrap();
        assert_eq!(unlocked, master);
        assert!(matches!(
            store.unlock(b"wrong password"),
            Err(KeyStoreError::BadPassword)
        ));
    }
}
