//! 敏感字段落盘保护：手机号 / 短信正文单向哈希，验证码 AES-256-GCM 加密

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::core::{PortalError, PortalResult};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// SHA-256 十六进制
pub fn hash_value(value: &str) -> String {
    format!("{:x}", Sha256::digest(value.as_bytes()))
}

/// 日志里只出现哈希前缀
pub fn hash_prefix(value: &str) -> String {
    hash_value(value).chars().take(8).collect()
}

/// 对称加密盒：密文格式为 base64(nonce || ciphertext)
#[derive(Clone)]
pub struct SecretBox {
    key: [u8; KEY_LEN],
}

impl SecretBox {
    pub fn from_key(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// 解析 base64 编码的 32 字节密钥
    pub fn from_base64(encoded: &str) -> PortalResult<Self> {
        let decoded = BASE64
            .decode(encoded.trim().as_bytes())
            .map_err(|e| PortalError::Crypto(format!("invalid key encoding: {}", e)))?;
        let key: [u8; KEY_LEN] = decoded
            .try_into()
            .map_err(|_| PortalError::Crypto(format!("key must be {} bytes", KEY_LEN)))?;
        Ok(Self { key })
    }

    pub fn random() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    /// 配置了密钥就用配置的，否则随机生成（重启后旧密文不可解）
    pub fn from_config(encoded: Option<&str>) -> PortalResult<Self> {
        match encoded {
            Some(k) if !k.trim().is_empty() => Self::from_base64(k),
            _ => {
                tracing::warn!("otp.encryption_key not set, using an ephemeral key");
                Ok(Self::random())
            }
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> PortalResult<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| PortalError::Crypto("cipher init failed".to_string()))?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| PortalError::Crypto("encryption failed".to_string()))?;
        let mut payload = nonce_bytes.to_vec();
        payload.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(payload))
    }

    pub fn decrypt(&self, encoded: &str) -> PortalResult<String> {
        let payload = BASE64
            .decode(encoded.as_bytes())
            .map_err(|e| PortalError::Crypto(format!("invalid ciphertext encoding: {}", e)))?;
        if payload.len() <= NONCE_LEN {
            return Err(PortalError::Crypto("ciphertext too short".to_string()));
        }
        let (nonce_raw, ciphertext) = payload.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|_| PortalError::Crypto("cipher init failed".to_string()))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_raw), ciphertext)
            .map_err(|_| PortalError::Crypto("decryption failed".to_string()))?;
        String::from_utf8(plaintext).map_err(|_| PortalError::Crypto("plaintext not utf-8".to_string()))
    }
}

impl std::fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretBox(***)")
    }
}
