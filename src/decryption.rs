// AES-128-CBC segment decryption and per-task key material handling.

use crate::client;
use crate::error::{DecryptErrorKind, EngineError};
use aes::Aes128;
use bytes::Bytes;
use cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use reqwest::header::HeaderMap;
use reqwest::Client;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Derive the implicit IV for a segment: the 16-byte big-endian encoding of
/// its media sequence number.
pub fn derive_iv(media_sequence: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&media_sequence.to_be_bytes());
    iv
}

/// Decrypt one segment body with AES-128-CBC and strip PKCS#7 padding.
pub fn decrypt_aes128_cbc(
    data: Bytes,
    key: &[u8; 16],
    iv: &[u8; 16],
) -> Result<Bytes, EngineError> {
    let mut buffer = data.to_vec();
    let decryptor = Aes128CbcDec::new_from_slices(key, iv).map_err(|_| EngineError::Decrypt {
        kind: DecryptErrorKind::BadKeyLength,
    })?;
    let plaintext_len = decryptor
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map_err(|_| EngineError::Decrypt {
            kind: DecryptErrorKind::BadPadding,
        })?
        .len();
    buffer.truncate(plaintext_len);
    Ok(Bytes::from(buffer))
}

/// 16 bytes of key material, zeroed when the cache is torn down so task
/// deletion leaves no keys in freed memory.
struct KeyMaterial([u8; 16]);

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        for byte in self.0.iter_mut() {
            // write_volatile keeps the wipe from being optimized away.
            unsafe { std::ptr::write_volatile(byte, 0) };
        }
    }
}

/// Per-task map from key URI to key bytes. Keys are fetched lazily on first
/// use with the task's headers and cached for the task lifetime.
pub struct KeyCache {
    client: Client,
    headers: HeaderMap,
    keys: Mutex<HashMap<String, KeyMaterial>>,
}

impl KeyCache {
    pub fn new(client: Client, headers: HeaderMap) -> Self {
        Self {
            client,
            headers,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Look up or fetch the key for `uri`.
    ///
    /// Holding the map lock across the fetch keeps concurrent workers from
    /// hammering the key server with duplicate requests.
    pub async fn key_for(&self, uri: &str) -> Result<[u8; 16], EngineError> {
        let mut keys = self.keys.lock().await;
        if let Some(material) = keys.get(uri) {
            return Ok(material.0);
        }

        let body = client::get_bytes(&self.client, uri, &self.headers).await?;
        let key: [u8; 16] = body.as_ref().try_into().map_err(|_| EngineError::Decrypt {
            kind: DecryptErrorKind::BadKeyLength,
        })?;
        debug!(uri, "Fetched AES-128 key");
        keys.insert(uri.to_string(), KeyMaterial(key));
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cipher::BlockEncryptMut;

    type Aes128CbcEnc = cbc::Encryptor<Aes128>;

    const KEY: [u8; 16] = [0xAA; 16];
    const IV: [u8; 16] = [
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F,
        0x10,
    ];

    #[test]
    fn decrypts_known_ciphertext_back_to_plaintext() {
        let plaintext = b"MPEG-TS payload bytes for the first segment";
        let ciphertext = Aes128CbcEnc::new_from_slices(&KEY, &IV)
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let decrypted = decrypt_aes128_cbc(Bytes::from(ciphertext), &KEY, &IV).unwrap();
        assert_eq!(decrypted.as_ref(), plaintext);
    }

    #[test]
    fn garbage_ciphertext_reports_bad_padding() {
        let garbage = Bytes::from_static(&[0x13u8; 32]);
        let err = decrypt_aes128_cbc(garbage, &KEY, &IV).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Decrypt {
                kind: DecryptErrorKind::BadPadding
            }
        ));
    }

    #[test]
    fn implicit_iv_is_big_endian_sequence_number() {
        let iv = derive_iv(5);
        let mut expected = [0u8; 16];
        expected[15] = 5;
        assert_eq!(iv, expected);

        let iv = derive_iv(0x0102_0304_0506_0708);
        assert_eq!(&iv[..8], &[0u8; 8]);
        assert_eq!(&iv[8..], &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
    }

    #[test]
    fn consecutive_sequence_numbers_differ_in_last_byte() {
        assert_eq!(derive_iv(5)[15], 5);
        assert_eq!(derive_iv(6)[15], 6);
        assert_ne!(derive_iv(5), derive_iv(6));
    }
}
