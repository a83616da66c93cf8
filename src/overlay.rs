use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde_yaml::{Mapping, Value};
use tracing::{debug, warn};

use crate::defaults;
use crate::paths::AppPaths;
use crate::policy::{AppPolicy, FilePolicy, PolicySource};
use crate::profile::RuntimeRenderer;
use crate::yaml::{deep_merge, ensure_mapping, parse_lenient, save_yaml};

/// 根据受控配置生成内核实际加载的运行配置。
pub trait ProfileGenerator {
    fn generate(&self, controlled: &Value) -> Result<()>;
}

/// 受控配置的唯一持有者：缓存、策略约束、持久化与运行配置再生成。
pub struct ConfigOverlay {
    path: PathBuf,
    cache: Option<Value>,
    policy: Box<dyn PolicySource>,
    generator: Box<dyn ProfileGenerator>,
    strip_tun_device: bool,
}

impl ConfigOverlay {
    pub fn new(
        path: PathBuf,
        policy: Box<dyn PolicySource>,
        generator: Box<dyn ProfileGenerator>,
    ) -> Self {
        Self {
            path,
            cache: None,
            policy,
            generator,
            // macOS 的 utun 设备名由系统分配，不允许自定义。
            strip_tun_device: cfg!(target_os = "macos"),
        }
    }

    pub fn open(paths: &AppPaths) -> Self {
        Self::new(
            paths.controlled_config_file.clone(),
            Box::new(FilePolicy::new(paths.app_policy_file.clone())),
            Box::new(RuntimeRenderer::new(paths.clone())),
        )
    }

    pub fn with_tun_device_stripping(mut self, enabled: bool) -> Self {
        self.strip_tun_device = enabled;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取受控配置；文件缺失或损坏时回退到内置默认值，从不失败。
    pub fn read(&mut self, force_reload: bool) -> &Value {
        if force_reload || self.cache.is_none() {
            self.cache = Some(load_controlled(&self.path));
        }
        self.cache.get_or_insert_with(defaults::controlled_config)
    }

    /// 按应用策略修正后合并 `delta`，再生成运行配置并落盘。
    ///
    /// 缓存只在落盘成功后替换，失败时内存与磁盘保持一致。
    pub fn patch(&mut self, delta: &Value) -> Result<()> {
        if !delta.is_mapping() {
            bail!("配置补丁必须是 YAML 对象");
        }
        let policy = self.policy.load()?;
        let mut config = self.read(false).clone();

        enforce_policy(&mut config, &policy, delta);
        deep_merge(&mut config, delta);
        finalize(&mut config, &policy, self.strip_tun_device);

        self.generator
            .generate(&config)
            .context("重新生成运行配置失败")?;
        save_yaml(&self.path, &config)
            .with_context(|| format!("保存受控配置失败: {}", self.path.display()))?;

        debug!(
            path = %self.path.display(),
            control_dns = policy.control_dns,
            control_sniff = policy.control_sniff,
            "受控配置已更新"
        );
        self.cache = Some(config);
        Ok(())
    }
}

fn load_controlled(path: &Path) -> Value {
    if !path.exists() {
        debug!(path = %path.display(), "受控配置不存在，使用内置默认值");
        return defaults::controlled_config();
    }
    let parsed = fs::read_to_string(path)
        .with_context(|| format!("读取受控配置失败: {}", path.display()))
        .and_then(|content| parse_lenient(&content));
    match parsed {
        Ok(value) if value.is_mapping() => value,
        Ok(_) => {
            warn!(path = %path.display(), "受控配置不是对象，使用内置默认值");
            defaults::controlled_config()
        }
        Err(err) => {
            warn!(path = %path.display(), "受控配置解析失败，使用内置默认值: {err:#}");
            defaults::controlled_config()
        }
    }
}

fn enforce_policy(config: &mut Value, policy: &AppPolicy, delta: &Value) {
    let root = ensure_mapping(config);

    if policy.control_dns {
        let enable = root.get("dns").and_then(|dns| dns.get("enable")).cloned();
        let mut dns = root
            .get("dns")
            .filter(|dns| dns.get("ipv6").is_some())
            .cloned()
            .unwrap_or_else(defaults::dns);
        // 内置 DNS 字段覆盖当前值，唯独 enable 沿用用户设置。
        deep_merge(&mut dns, &defaults::dns());
        if let Some(enable) = enable {
            ensure_mapping(&mut dns).insert(Value::from("enable"), enable);
        }
        root.insert(Value::from("dns"), dns);
    } else {
        root.remove("dns");
        root.remove("hosts");
    }

    if policy.control_sniff {
        if !root.contains_key("sniffer") {
            root.insert(Value::from("sniffer"), defaults::sniffer());
        }
    } else {
        root.remove("sniffer");
    }

    // hosts 与 nameserver-policy 整体替换，不做字段级合并。
    if let Some(hosts) = delta.get("hosts") {
        root.insert(Value::from("hosts"), hosts.clone());
    }
    if let Some(ns_policy) = delta.get("dns").and_then(|dns| dns.get("nameserver-policy")) {
        if !root.contains_key("dns") {
            root.insert(Value::from("dns"), Value::Mapping(Mapping::new()));
        }
        if let Some(dns) = root.get_mut("dns") {
            ensure_mapping(dns).insert(Value::from("nameserver-policy"), ns_policy.clone());
        }
    }
}

fn finalize(config: &mut Value, policy: &AppPolicy, strip_tun_device: bool) {
    let root = ensure_mapping(config);

    if !policy.control_dns {
        root.remove("dns");
        root.remove("hosts");
    }
    if !policy.control_sniff {
        root.remove("sniffer");
    }
    if !policy.use_nameserver_policy {
        if let Some(dns) = root.get_mut("dns").and_then(Value::as_mapping_mut) {
            dns.remove("nameserver-policy");
        }
    }
    if strip_tun_device {
        if let Some(tun) = root.get_mut("tun").and_then(Value::as_mapping_mut) {
            tun.remove("device");
        }
    }
}
