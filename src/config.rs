use anyhow::{Context, Result, bail};
use serde_yaml::{Mapping, Value};

use crate::cli::{ConfigCommand, ConfigPatchArgs, ConfigPolicyArgs};
use crate::output::{is_json_mode, print_json, print_yaml};
use crate::overlay::ConfigOverlay;
use crate::paths::app_paths;
use crate::policy::{FilePolicy, PolicySource};
use crate::yaml::{deep_merge, load_yaml, nested_assignment};

pub fn run(command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => cmd_show(),
        ConfigCommand::Patch(args) => cmd_patch(args),
        ConfigCommand::Policy(args) => cmd_policy(args),
    }
}

fn cmd_show() -> Result<()> {
    let paths = app_paths()?;
    let mut overlay = ConfigOverlay::open(&paths);
    let config = overlay.read(false);

    if is_json_mode() {
        let config = serde_json::to_value(config).context("受控配置无法转换为 JSON")?;
        return print_json(&serde_json::json!({
            "ok": true,
            "action": "config.show",
            "path": paths.controlled_config_file.display().to_string(),
            "config": config,
        }));
    }
    print_yaml(config)
}

fn cmd_patch(args: ConfigPatchArgs) -> Result<()> {
    let delta = build_delta(&args)?;
    let paths = app_paths()?;
    let mut overlay = ConfigOverlay::open(&paths);
    overlay.patch(&delta)?;

    if is_json_mode() {
        return print_json(&serde_json::json!({
            "ok": true,
            "action": "config.patch",
            "path": overlay.path().display().to_string(),
            "runtime": paths.runtime_config_file.display().to_string(),
        }));
    }

    println!("受控配置已更新: {}", overlay.path().display());
    println!("运行配置已重新生成: {}", paths.runtime_config_file.display());
    Ok(())
}

fn cmd_policy(args: ConfigPolicyArgs) -> Result<()> {
    let paths = app_paths()?;
    let source = FilePolicy::new(paths.app_policy_file.clone());
    let mut policy = source.load()?;

    let changed = args.control_dns.is_some()
        || args.control_sniff.is_some()
        || args.use_nameserver_policy.is_some();
    if let Some(v) = args.control_dns {
        policy.control_dns = v;
    }
    if let Some(v) = args.control_sniff {
        policy.control_sniff = v;
    }
    if let Some(v) = args.use_nameserver_policy {
        policy.use_nameserver_policy = v;
    }
    if changed {
        source.save(&policy)?;
    }

    if is_json_mode() {
        return print_json(&serde_json::json!({
            "ok": true,
            "action": "config.policy",
            "changed": changed,
            "policy": policy,
        }));
    }

    if changed {
        println!("应用策略已保存，下次 `clash-shell config patch` 时生效。");
    }
    println!("control-dns: {}", policy.control_dns);
    println!("control-sniff: {}", policy.control_sniff);
    println!("use-nameserver-policy: {}", policy.use_nameserver_policy);
    Ok(())
}

fn build_delta(args: &ConfigPatchArgs) -> Result<Value> {
    let mut delta = Value::Mapping(Mapping::new());
    if let Some(file) = &args.file {
        let from_file = load_yaml(file)?;
        if !from_file.is_mapping() {
            bail!("补丁文件顶层必须是对象: {}", file.display());
        }
        deep_merge(&mut delta, &from_file);
    }
    for assignment in &args.set {
        deep_merge(&mut delta, &parse_assignment(assignment)?);
    }
    Ok(delta)
}

fn parse_assignment(raw: &str) -> Result<Value> {
    let (path, value) = raw
        .split_once('=')
        .with_context(|| format!("赋值格式应为 KEY=VALUE: {raw}"))?;
    let trimmed = value.trim();
    let value = if trimmed.is_empty() {
        Value::Null
    } else {
        match serde_yaml::from_str(trimmed) {
            Ok(parsed) => parsed,
            // 以 [ 或 { 开头说明想写集合，解析失败时直接报错而不是存成字符串。
            Err(err) if trimmed.starts_with(['[', '{']) => {
                return Err(err).with_context(|| format!("无法解析 {path} 的值: {value}"));
            }
            Err(_) => Value::String(value.to_string()),
        }
    };
    nested_assignment(path, value).with_context(|| format!("无效的配置路径: {path}"))
}
