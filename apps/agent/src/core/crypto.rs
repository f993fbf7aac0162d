use async_trait::async_trait;
use base64::Engine as _;
use keldris_types::SecretEnvelope;
use sha2::{Digest, Sha256};

use crate::core::error::Result;

/// Opaque secret-value encryption, provided by the control plane. The core
/// never sees key material.
#[async_trait]
pub trait SecretCipher: Send + Sync {
    async fn encrypt(&self, plaintext: &str) -> Result<String>;
    async fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// Pass-through cipher for tests and for agents running without an
/// encryption service configured.
#[derive(Default)]
pub struct PlainCipher;

#[async_trait]
impl SecretCipher for PlainCipher {
    async fn encrypt(&self, plaintext: &str) -> Result<String> {
        Ok(plaintext.to_string())
    }

    async fn decrypt(&self, ciphertext: &str) -> Result<String> {
        Ok(ciphertext.to_string())
    }
}

/// Build the opaque reference string for an engine-managed secret. The value
/// itself cannot be read back from the engine, so the envelope carries only
/// this reference.
pub fn secret_ref(id: &str, name: &str, version: u64) -> String {
    let raw = format!("docker-secret-ref:{id}:{name}:{version}");
    base64::engine::general_purpose::STANDARD.encode(raw.as_bytes())
}

pub async fn build_secret_envelope(
    cipher: &dyn SecretCipher,
    id: &str,
    name: &str,
    version: u64,
) -> Result<SecretEnvelope> {
    let reference = secret_ref(id, name, version);
    let mut hasher = Sha256::new();
    hasher.update(reference.as_bytes());
    let checksum = hex::encode(hasher.finalize());
    let keldris_encrypted = cipher.encrypt(&reference).await?;
    Ok(SecretEnvelope {
        docker_encrypted_ref: reference,
        keldris_encrypted,
        checksum,
        encrypted_at: chrono::Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_ref_is_base64_of_tagged_form() {
        let encoded = secret_ref("s1", "db_password", 4);
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        assert_eq!(decoded, b"docker-secret-ref:s1:db_password:4");
    }

    #[tokio::test]
    async fn envelope_checksum_matches_reference() {
        let envelope = build_secret_envelope(&PlainCipher, "s1", "db_password", 1)
            .await
            .unwrap();
        let mut hasher = Sha256::new();
        hasher.update(envelope.docker_encrypted_ref.as_bytes());
        assert_eq!(envelope.checksum, hex::encode(hasher.finalize()));
        assert_eq!(envelope.keldris_encrypted, envelope.docker_encrypted_ref);
    }
}
