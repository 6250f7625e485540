// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Secret payload sealing and credential placeholder resolution.
//!
//! The key is `SHA-256(bootstrapToken)`, so only the agent holding the token
//! can open a payload. Payload plaintext is a JSON object of secret name to
//! value.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::domain::bundle::CredentialsMap;
use crate::domain::integrity;
use crate::domain::protocol::SecretPayload;

const NONCE_LEN: usize = 12;
const PLACEHOLDER_PREFIX: &str = "${secret:";
const PLACEHOLDER_SUFFIX: &str = "}";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecretError {
    #[error("Secret payload encoding is invalid: {0}")]
    Encoding(String),

    #[error("Secret payload could not be decrypted")]
    Decrypt,

    #[error("Secret payload could not be encrypted")]
    Encrypt,

    #[error("Secret '{0}' referenced by the credentials map is not in the payload")]
    Missing(String),
}

pub struct SecretSealer {
    cipher: Aes256Gcm,
}

impl SecretSealer {
    pub fn from_token(token: &str) -> Self {
        let key_bytes = integrity::digest(token.as_bytes());
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    pub fn seal(&self, secrets: &BTreeMap<String, String>) -> Result<SecretPayload, SecretError> {
        let plaintext = serde_json::to_vec(secrets).map_err(|e| SecretError::Encoding(e.to_string()))?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|_| SecretError::Encrypt)?;
        Ok(SecretPayload {
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    pub fn open(&self, payload: &SecretPayload) -> Result<BTreeMap<String, String>, SecretError> {
        let nonce = BASE64
            .decode(&payload.nonce)
            .map_err(|e| SecretError::Encoding(e.to_string()))?;
        if nonce.len() != NONCE_LEN {
            return Err(SecretError::Encoding(format!("nonce must be {NONCE_LEN} bytes")));
        }
        let ciphertext = BASE64
            .decode(&payload.ciphertext)
            .map_err(|e| SecretError::Encoding(e.to_string()))?;
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| SecretError::Decrypt)?;
        serde_json::from_slice(&plaintext).map_err(|e| SecretError::Encoding(e.to_string()))
    }
}

/// Build the placeholder written into `credentials.map.json`.
pub fn placeholder(secret_name: &str) -> String {
    format!("{PLACEHOLDER_PREFIX}{secret_name}{PLACEHOLDER_SUFFIX}")
}

fn placeholder_name(value: &str) -> Option<&str> {
    value.strip_prefix(PLACEHOLDER_PREFIX)?.strip_suffix(PLACEHOLDER_SUFFIX)
}

/// Replace every `${secret:NAME}` with its value. Literal values pass
/// through unchanged.
pub fn resolve_credentials(
    map: &CredentialsMap,
    secrets: &BTreeMap<String, String>,
) -> Result<CredentialsMap, SecretError> {
    map.iter()
        .map(|(node_id, keys)| {
            let resolved = keys
                .iter()
                .map(|(key, value)| {
                    let value = match placeholder_name(value) {
                        Some(name) => secrets
                            .get(name)
                            .cloned()
                            .ok_or_else(|| SecretError::Missing(name.to_string()))?,
                        None => value.clone(),
                    };
                    Ok((key.clone(), value))
                })
                .collect::<Result<BTreeMap<_, _>, SecretError>>()?;
            Ok((node_id.clone(), resolved))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets() -> BTreeMap<String, String> {
        BTreeMap::from([("PACS_PASSWORD".to_string(), "hunter2".to_string())])
    }

    #[test]
    fn test_seal_and_open() {
        let sealer = SecretSealer::from_token("bootstrap-token");
        let payload = sealer.seal(&secrets()).unwrap();
        assert!(!payload.ciphertext.contains("hunter2"));
        assert_eq!(sealer.open(&payload).unwrap(), secrets());
    }

    #[test]
    fn test_wrong_token_cannot_open() {
        let payload = SecretSealer::from_token("right").seal(&secrets()).unwrap();
        assert_eq!(
            SecretSealer::from_token("wrong").open(&payload),
            Err(SecretError::Decrypt)
        );
    }

    #[test]
    fn test_bad_nonce_rejected() {
        let sealer = SecretSealer::from_token("t");
        let mut payload = sealer.seal(&secrets()).unwrap();
        payload.nonce = BASE64.encode([0u8; 4]);
        assert!(matches!(sealer.open(&payload), Err(SecretError::Encoding(_))));
    }

    #[test]
    fn test_resolve_credentials() {
        let mut map = CredentialsMap::new();
        map.insert(
            "n0123456789abcde".into(),
            BTreeMap::from([
                ("password".to_string(), placeholder("PACS_PASSWORD")),
                ("user".to_string(), "gatejet".to_string()),
            ]),
        );
        let resolved = resolve_credentials(&map, &secrets()).unwrap();
        assert_eq!(resolved["n0123456789abcde"]["password"], "hunter2");
        assert_eq!(resolved["n0123456789abcde"]["user"], "gatejet");

        assert_eq!(
            resolve_credentials(&map, &BTreeMap::new()),
            Err(SecretError::Missing("PACS_PASSWORD".into()))
        );
    }
}
