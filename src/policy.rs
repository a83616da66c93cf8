use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::paths::write_file_atomic;

/// 应用层开关，决定受控配置是否接管 DNS、嗅探与 nameserver-policy。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AppPolicy {
    pub control_dns: bool,
    pub control_sniff: bool,
    pub use_nameserver_policy: bool,
}

impl Default for AppPolicy {
    fn default() -> Self {
        Self {
            control_dns: true,
            control_sniff: true,
            use_nameserver_policy: false,
        }
    }
}

pub trait PolicySource {
    fn load(&self) -> Result<AppPolicy>;
}

impl PolicySource for AppPolicy {
    fn load(&self) -> Result<AppPolicy> {
        Ok(*self)
    }
}

pub struct FilePolicy {
    path: PathBuf,
}

impl FilePolicy {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn save(&self, policy: &AppPolicy) -> Result<()> {
        let text = serde_yaml::to_string(policy).context("序列化应用策略失败")?;
        write_file_atomic(&self.path, &text)
    }
}

impl PolicySource for FilePolicy {
    fn load(&self) -> Result<AppPolicy> {
        if !self.path.exists() {
            return Ok(AppPolicy::default());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("读取应用策略失败: {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(AppPolicy::default());
        }
        serde_yaml::from_str(&content)
            .with_context(|| format!("解析应用策略失败: {}", self.path.display()))
    }
}
