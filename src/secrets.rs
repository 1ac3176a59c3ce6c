//! Encrypted password handling.
//!
//! Passwords stored in service configuration may be encrypted with a
//! locally-kept key. The stored form is the hex encoding of an
//! AES-256-CBC ciphertext. When no key is installed, passwords are taken
//! as plaintext.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use zeroize::Zeroizing;

use crate::error::AuthProxyError;

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

const AES_BLOCK_SIZE: usize = 16;

/// Key material for password encryption.
#[derive(Clone)]
pub struct EncryptionKey {
    key: [u8; 32],
    iv: [u8; 16],
}

impl EncryptionKey {
    pub fn new(key: [u8; 32], iv: [u8; 16]) -> Self {
        Self { key, iv }
    }

    /// Parse key material from its hex-encoded stored form.
    pub fn from_hex(key_hex: &str, iv_hex: &str) -> Result<Self, AuthProxyError> {
        let key_bytes = hex::decode(key_hex)
            .map_err(|e| AuthProxyError::Config(format!("invalid encryption key: {e}")))?;
        let iv_bytes = hex::decode(iv_hex)
            .map_err(|e| AuthProxyError::Config(format!("invalid encryption IV: {e}")))?;

        let key: [u8; 32] = key_bytes
            .try_into()
            .map_err(|_| AuthProxyError::Config("encryption key must be 32 bytes".into()))?;
        let iv: [u8; 16] = iv_bytes
            .try_into()
            .map_err(|_| AuthProxyError::Config("encryption IV must be 16 bytes".into()))?;
        Ok(Self { key, iv })
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("key", &"[REDACTED]")
            .field("iv", &"[REDACTED]")
            .finish()
    }
}

/// Decrypt a stored password.
///
/// Without a key, or when the stored value does not look like a
/// ciphertext, the value passes through unchanged. The result is zeroed
/// on drop.
pub fn decrypt_password(key: Option<&EncryptionKey>, password: &str) -> Zeroizing<String> {
    let passthrough = || Zeroizing::new(password.to_string());

    let Some(key) = key else {
        return passthrough();
    };

    let mut ciphertext = match hex::decode(password) {
        Ok(bytes) => bytes,
        Err(_) => return passthrough(),
    };
    if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_SIZE != 0 {
        return passthrough();
    }

    let decryptor = Aes256CbcDec::new(&key.key.into(), &key.iv.into());
    match decryptor.decrypt_padded_mut::<Pkcs7>(&mut ciphertext) {
        Ok(plaintext) => Zeroizing::new(String::from_utf8_lossy(plaintext).into_owned()),
        Err(_) => {
            warn!("Password decryption failed, using the stored value as plaintext.");
            passthrough()
        }
    }
}

/// Encrypt a password into its hex-encoded stored form.
pub fn encrypt_password(key: &EncryptionKey, password: &str) -> String {
    let encryptor = Aes256CbcEnc::new(&key.key.into(), &key.iv.into());
    let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(password.as_bytes());
    hex::encode(ciphertext)
}
