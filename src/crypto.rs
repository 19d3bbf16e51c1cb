// 凭证加解密与密钥散列：路由与凭证库共用的加密封装。
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;

/// 凭证密文的加解密接口，便于替换为外部 KMS 实现。
pub trait CredentialCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String>;
    fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// AES-256-GCM 默认实现，主密钥经 SHA-256 拉伸为 32 字节。
pub struct AesGcmCipher {
    key: [u8; 32],
}

impl AesGcmCipher {
    pub fn new(master_key: &str) -> Result<Self> {
        let trimmed = master_key.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("vault encryption key is empty"));
        }
        let digest = Sha256::digest(trimmed.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Ok(Self { key })
    }
}

impl CredentialCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| anyhow!("credential encryption failed"))?;
        let mut payload = Vec::with_capacity(NONCE_LEN + sealed.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&sealed);
        Ok(BASE64.encode(payload))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let payload = BASE64
            .decode(ciphertext.trim())
            .map_err(|_| anyhow!("credential ciphertext is not valid base64"))?;
        if payload.len() <= NONCE_LEN {
            return Err(anyhow!("credential ciphertext is truncated"));
        }
        let (nonce, sealed) = payload.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let opened = cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| anyhow!("credential decryption failed"))?;
        String::from_utf8(opened).map_err(|_| anyhow!("decrypted credentials are not utf-8"))
    }
}

/// API Key 明文的单向散列，仅散列参与查找与持久化。
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_roundtrip() {
        let cipher = AesGcmCipher::new("unit-test-master-key").expect("cipher");
        let sealed = cipher.encrypt("{\"api_key\":\"sk_test\"}").expect("encrypt");
        assert_ne!(sealed, "{\"api_key\":\"sk_test\"}");
        let opened = cipher.decrypt(&sealed).expect("decrypt");
        assert_eq!(opened, "{\"api_key\":\"sk_test\"}");
    }

    #[test]
    fn decrypt_rejects_wrong_key() {
        let cipher = AesGcmCipher::new("key-one").expect("cipher");
        let sealed = cipher.encrypt("secret").expect("encrypt");
        let other = AesGcmCipher::new("key-two").expect("cipher");
        assert!(other.decrypt(&sealed).is_err());
    }

    #[test]
    fn decrypt_rejects_garbage() {
        let cipher = AesGcmCipher::new("key").expect("cipher");
        assert!(cipher.decrypt("not-base64!!!").is_err());
        assert!(cipher.decrypt("aGVsbG8=").is_err());
    }

    #[test]
    fn hash_secret_is_stable_and_hex() {
        let first = hash_secret("ptw_abc");
        let second = hash_secret("ptw_abc");
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert_ne!(first, hash_secret("ptw_abd"));
    }
}
