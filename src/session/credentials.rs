//! 门户凭据解析：credential_ref → 用户名 / 密码

use std::collections::HashMap;

use async_trait::async_trait;

use crate::core::{PortalError, PortalResult};

#[derive(Clone, PartialEq, Eq)]
pub struct PortalCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for PortalCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortalCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn resolve(&self, credential_ref: &str) -> PortalResult<PortalCredentials>;
}

/// 从环境变量读取：AUTHPILOT_CRED_<REF>_USERNAME / AUTHPILOT_CRED_<REF>_PASSWORD
#[derive(Debug, Default)]
pub struct EnvCredentialProvider;

impl EnvCredentialProvider {
    fn var_name(credential_ref: &str, field: &str) -> String {
        let key: String = credential_ref
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("AUTHPILOT_CRED_{}_{}", key, field)
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentialProvider {
    async fn resolve(&self, credential_ref: &str) -> PortalResult<PortalCredentials> {
        let read = |field: &str| {
            let name = Self::var_name(credential_ref, field);
            std::env::var(&name).map_err(|_| {
                PortalError::InvalidCredentials(format!("{} is not set", name))
            })
        };
        Ok(PortalCredentials {
            username: read("USERNAME")?,
            password: read("PASSWORD")?,
        })
    }
}

/// 内存中的固定凭据表
#[derive(Debug, Default, Clone)]
pub struct StaticCredentialProvider {
    entries: HashMap<String, PortalCredentials>,
}

impl StaticCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, credential_ref: &str, username: &str, password: &str) -> Self {
        self.entries.insert(
            credential_ref.to_string(),
            PortalCredentials {
                username: username.to_string(),
                password: password.to_string(),
            },
        );
        self
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentialProvider {
    async fn resolve(&self, credential_ref: &str) -> PortalResult<PortalCredentials> {
        self.entries.get(credential_ref).cloned().ok_or_else(|| {
            PortalError::InvalidCredentials(format!("unknown credential reference {}", credential_ref))
        })
    }
}
