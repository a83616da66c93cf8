use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_dir: PathBuf,
    pub app_policy_file: PathBuf,
    pub controlled_config_file: PathBuf,
    pub profile_dir: PathBuf,
    pub profile_index_file: PathBuf,
    pub runtime_config_file: PathBuf,
}

static HOME_OVERRIDE: OnceLock<PathBuf> = OnceLock::new();

/// 由 `--home` / `CLASH_SHELL_HOME` 指定的配置目录，进程内只设置一次。
pub fn set_home_override(home: Option<PathBuf>) {
    if let Some(home) = home {
        let _ = HOME_OVERRIDE.set(home);
    }
}

pub fn app_paths() -> Result<AppPaths> {
    let config_dir = if let Some(custom) = HOME_OVERRIDE.get() {
        custom.clone()
    } else if let Some(xdg) = env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join("clash-shell")
    } else if let Some(dir) = dirs::config_dir() {
        dir.join("clash-shell")
    } else {
        let home = dirs::home_dir().context("无法获取 home 目录")?;
        home.join(".config").join("clash-shell")
    };
    Ok(AppPaths::from_home(config_dir))
}

impl AppPaths {
    pub fn from_home(config_dir: PathBuf) -> Self {
        let profile_dir = config_dir.join("profiles");
        let runtime_dir = config_dir.join("runtime");
        Self {
            app_policy_file: config_dir.join("app.yaml"),
            controlled_config_file: config_dir.join("mihomo.yaml"),
            profile_index_file: profile_dir.join("index.json"),
            profile_dir,
            runtime_config_file: runtime_dir.join("config.yaml"),
            config_dir,
        }
    }
}

/// 先写同目录临时文件再 rename，避免中途失败留下半截文件。
pub fn write_file_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("创建目录失败: {}", parent.display()))?;
    }
    let file_name = path
        .file_name()
        .with_context(|| format!("无效的文件路径: {}", path.display()))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(format!(".{}.tmp", std::process::id()));
    let tmp_path = path.with_file_name(tmp_name);

    fs::write(&tmp_path, content)
        .with_context(|| format!("写入临时文件失败: {}", tmp_path.display()))?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err).with_context(|| format!("替换文件失败: {}", path.display()));
    }
    Ok(())
}
