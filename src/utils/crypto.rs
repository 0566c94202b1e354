use crate::utils::error::{AppError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use rand::Rng;

const NONCE_LEN: usize = 12;

/// 实例密码加解密器 (AES-256-GCM)
///
/// 密文格式为 base64(nonce || ciphertext)。
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    /// 由配置中的密钥字符串构造，不足 32 字节补零，超出部分截断
    pub fn from_key(key_str: &str) -> Result<Self> {
        if key_str.is_empty() {
            return Err(AppError::Config("encryption key must not be empty".to_string()));
        }

        let mut key = [0u8; 32];
        let key_bytes = key_str.as_bytes();
        let len = key_bytes.len().min(32);
        key[..len].copy_from_slice(&key_bytes[..len]);

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| AppError::Encryption(format!("Failed to create cipher: {}", e)))?;

        Ok(Self { cipher })
    }

    /// 加密字符串
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut rng = rand::thread_rng();
        let nonce_bytes: [u8; NONCE_LEN] = rng.r#gen();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| AppError::Encryption(format!("Encryption failed: {}", e)))?;

        let mut result = nonce_bytes.to_vec();
        result.extend_from_slice(&ciphertext);

        Ok(general_purpose::STANDARD.encode(&result))
    }

    /// 解密字符串
    pub fn decrypt(&self, encrypted: &str) -> Result<String> {
        let encrypted_data = general_purpose::STANDARD
            .decode(encrypted)
            .map_err(|e| AppError::Encryption(format!("Base64 decode failed: {}", e)))?;

        if encrypted_data.len() < NONCE_LEN {
            return Err(AppError::Encryption(
                "Invalid encrypted data: too short".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = encrypted_data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext_bytes = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| AppError::Encryption(format!("Decryption failed: {}", e)))?;

        String::from_utf8(plaintext_bytes)
            .map_err(|e| AppError::Encryption(format!("UTF-8 decode failed: {}", e)))
    }
}
