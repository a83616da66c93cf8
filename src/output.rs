use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use serde::Serialize;

static JSON_MODE: AtomicBool = AtomicBool::new(false);

pub fn set_json_mode(enabled: bool) {
    JSON_MODE.store(enabled, Ordering::Relaxed);
}

pub fn is_json_mode() -> bool {
    JSON_MODE.load(Ordering::Relaxed)
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("序列化 JSON 失败")?;
    println!("{}", text);
    Ok(())
}

pub fn print_yaml<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_yaml::to_string(value).context("序列化 YAML 失败")?;
    print!("{}", text);
    Ok(())
}

/// 日志统一写 stderr，保证 `--json` 时 stdout 只有 JSON。
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("CLASH_SHELL_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
