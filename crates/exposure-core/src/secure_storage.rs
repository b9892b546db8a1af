use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine as _};
use keyring::Entry;
use tracing::info;
use zeroize::Zeroizing;

use crate::api::SecretKeyProvider;
use crate::crypto::{generate_store_key, STORE_KEY_LEN};

const SERVICE_NAME: &str = "ExposureNotifier";
const STORE_KEY_NAME: &str = "event_store_key";

/// Keeps the store key in the platform keyring, base64 encoded.
#[derive(Debug, Clone, Default)]
pub struct KeyringKeyProvider;

impl KeyringKeyProvider {
    pub fn new() -> Self {
        Self
    }

    fn entry(&self) -> Result<Entry> {
        Entry::new(SERVICE_NAME, STORE_KEY_NAME).map_err(|e| anyhow!("keyring init: {e}"))
    }
}

impl SecretKeyProvider for KeyringKeyProvider {
    fn get_or_create_key(&self) -> Result<Zeroizing<Vec<u8>>> {
        let entry = self.entry()?;
        match entry.get_password() {
            Ok(encoded) => {
                let encoded = Zeroizing::new(encoded);
                let decoded = Zeroizing::new(
                    general_purpose::STANDARD
                        .decode(encoded.as_bytes())
                        .map_err(|e| anyhow!("decode store key: {e}"))?,
                );
                if decoded.len() != STORE_KEY_LEN {
                    return Err(anyhow!(
                        "stored key has {} bytes, expected {STORE_KEY_LEN}",
                        decoded.len()
                    ));
                }
                Ok(decoded)
            }
            Err(keyring::Error::NoEntry) => {
                let key = generate_store_key();
                let encoded = Zeroizing::new(general_purpose::STANDARD.encode(&key[..]));
                entry
                    .set_password(&encoded)
                    .map_err(|e| anyhow!("store key: {e}"))?;
                info!("generated new event store key");
                Ok(key)
            }
            Err(e) => Err(anyhow!("load store key: {e}")),
        }
    }
}

/// Fixed key held in memory. For tooling and tests.
#[derive(Clone)]
pub struct StaticKeyProvider {
    key: Zeroizing<Vec<u8>>,
}

impl StaticKeyProvider {
    pub fn random() -> Self {
        Self {
            key: generate_store_key(),
        }
    }
}

impl SecretKeyProvider for StaticKeyProvider {
    fn get_or_create_key(&self) -> Result<Zeroizing<Vec<u8>>> {
        Ok(self.key.clone())
    }
}
