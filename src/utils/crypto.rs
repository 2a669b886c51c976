//! # Symmetric Encryption
//!
//! AES-256-CBC with PKCS#7 padding behind the [`BlockCipher`] seam, plus the
//! envelope format used for every sealed packet:
//!
//! ```text
//! [u32 len][IV(16)][u32 len][ciphertext]
//! ```
//!
//! A fresh random IV is drawn for every [`Crypto::seal`]. Any malformed
//! envelope or padding error on [`Crypto::open`] is an
//! [`ProtocolError::IntegrityFailure`].
//!
//! Session keys are 32 bytes derived by SHA-256 and wiped on drop.

use crate::core::wire::{WireReader, WireWriter};
use crate::error::{ProtocolError, Result};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Session key width
pub const KEY_LEN: usize = 32;

/// AES block and IV width
pub const IV_LEN: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// 32-byte symmetric key, zeroized on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// SHA-256 over the big-endian bytes of a shared secret
    pub fn derive(secret: &[u8]) -> Self {
        let digest = Sha256::digest(secret);
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&digest);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Block cipher in a chaining mode with padding
pub trait BlockCipher: Send + Sync {
    fn iv_len(&self) -> usize;

    fn encrypt(&self, key: &SessionKey, iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>;

    /// # Errors
    /// `IntegrityFailure` on a bad IV length or invalid padding.
    fn decrypt(&self, key: &SessionKey, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Aes256Cbc;

impl BlockCipher for Aes256Cbc {
    fn iv_len(&self) -> usize {
        IV_LEN
    }

    fn encrypt(&self, key: &SessionKey, iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let enc = Aes256CbcEnc::new_from_slices(key.as_bytes(), iv)
            .map_err(|_| ProtocolError::IntegrityFailure)?;
        Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    }

    fn decrypt(&self, key: &SessionKey, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let dec = Aes256CbcDec::new_from_slices(key.as_bytes(), iv)
            .map_err(|_| ProtocolError::IntegrityFailure)?;
        dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| ProtocolError::IntegrityFailure)
    }
}

/// Envelope sealing over a [`BlockCipher`]
pub struct Crypto {
    cipher: Box<dyn BlockCipher>,
}

impl Default for Crypto {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Crypto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Crypto")
            .field("iv_len", &self.cipher.iv_len())
            .finish()
    }
}

impl Crypto {
    /// AES-256-CBC
    pub fn new() -> Self {
        Self::with_cipher(Aes256Cbc)
    }

    pub fn with_cipher<C: BlockCipher + 'static>(cipher: C) -> Self {
        Self {
            cipher: Box::new(cipher),
        }
    }

    /// Random IV from the thread-local CSPRNG
    pub fn generate_iv(&self) -> Vec<u8> {
        let mut iv = vec![0u8; self.cipher.iv_len()];
        rand::rng().fill_bytes(&mut iv);
        iv
    }

    /// Encrypt under a fresh IV and wrap in the envelope
    pub fn seal(&self, key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>> {
        let iv = self.generate_iv();
        let ciphertext = self.cipher.encrypt(key, &iv, plaintext)?;

        let mut w = WireWriter::with_capacity(8 + iv.len() + ciphertext.len());
        w.put_blob(&iv);
        w.put_blob(&ciphertext);
        Ok(w.into_vec())
    }

    /// Unwrap the envelope and decrypt
    pub fn open(&self, key: &SessionKey, envelope: &[u8]) -> Result<Vec<u8>> {
        let mut r = WireReader::new(envelope);
        let iv = r.read_blob().map_err(|_| ProtocolError::IntegrityFailure)?;
        if iv.len() != self.cipher.iv_len() {
            return Err(ProtocolError::IntegrityFailure);
        }
        let ciphertext = r.read_blob().map_err(|_| ProtocolError::IntegrityFailure)?;
        r.finish().map_err(|_| ProtocolError::IntegrityFailure)?;

        self.cipher.decrypt(key, iv, ciphertext)
    }
}
