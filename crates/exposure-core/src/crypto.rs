use anyhow::{anyhow, Result};
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Length of the opaque key blob handed out by the secret holder.
pub const STORE_KEY_LEN: usize = 64;
pub const CIPHER_KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;

const CIPHER_KEY_CONTEXT: &[u8] = b"exposure.store.cipher.v1";

/// AEAD bound to one store key blob.
///
/// The 64-byte blob is reduced to the XChaCha20 key with HMAC-SHA256 over a
/// fixed context, so the same blob always opens the same store. The derived
/// key is wiped when the cipher is dropped.
pub struct StoreCipher {
    key: Zeroizing<[u8; CIPHER_KEY_LEN]>,
}

impl StoreCipher {
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        if blob.len() != STORE_KEY_LEN {
            return Err(anyhow!(
                "store key must be {STORE_KEY_LEN} bytes, got {}",
                blob.len()
            ));
        }
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(blob)
            .map_err(|e| anyhow!("hmac init: {e}"))?;
        mac.update(CIPHER_KEY_CONTEXT);
        let mut key = Zeroizing::new([0u8; CIPHER_KEY_LEN]);
        key.copy_from_slice(&mac.finalize().into_bytes());
        Ok(Self { key })
    }

    fn aead(&self) -> Result<XChaCha20Poly1305> {
        XChaCha20Poly1305::new_from_slice(&self.key[..]).map_err(|e| anyhow!("cipher init: {e}"))
    }

    /// Encrypts under a fresh random nonce and returns both.
    pub fn seal(&self, plaintext: &[u8]) -> Result<([u8; NONCE_LEN], Vec<u8>)> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = self
            .aead()?
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|e| anyhow!("encrypt: {e}"))?;
        Ok((nonce, sealed))
    }

    pub fn open(&self, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        self.aead()?
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map(Zeroizing::new)
            .map_err(|e| anyhow!("decrypt: {e}"))
    }

    #[cfg(test)]
    fn key_bytes(&self) -> [u8; CIPHER_KEY_LEN] {
        *self.key
    }
}

/// Fresh random key blob for a new install.
pub fn generate_store_key() -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(vec![0u8; STORE_KEY_LEN]);
    OsRng.fill_bytes(&mut key);
    key
}
