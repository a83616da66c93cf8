use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use tracing::{debug, info, warn};

use crate::cli::{
    ProfileAddArgs, ProfileCommand, ProfileFetchArgs, ProfileRemoveArgs, ProfileRenderArgs,
    ProfileUseArgs, ProfileValidateArgs,
};
use crate::output::{is_json_mode, print_json};
use crate::overlay::{ConfigOverlay, ProfileGenerator};
use crate::paths::{AppPaths, app_paths, write_file_atomic};
use crate::scheduler::{ProfileFetcher, ProfileStore};
use crate::yaml::{deep_merge, ensure_mapping, key_exists, parse_lenient, save_yaml};

/// 未登录时占位的 profile，绑定一个不可用的订阅地址，不参与任何更新。
pub const PLACEHOLDER_PROFILE_ID: &str = "default";
pub const EMPTY_PROFILE_URL: &str = "https://empty.invalid/";

const SUBSCRIPTION_USER_AGENT: &str = "clash.meta";
const RECENT_FETCH_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    Remote,
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileItem {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ProfileKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// 自动更新间隔，单位分钟。
    #[serde(default)]
    pub interval: u64,
    pub file: String,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated: Option<u64>,
}

impl ProfileItem {
    pub fn is_placeholder(&self) -> bool {
        self.id == PLACEHOLDER_PROFILE_ID && self.url.as_deref() == Some(EMPTY_PROFILE_URL)
    }

    /// 需要自动更新时返回间隔：远程、有 URL、间隔为正且不是占位 profile。
    pub fn refresh_interval(&self) -> Option<Duration> {
        if self.kind != ProfileKind::Remote
            || self.url.is_none()
            || self.interval == 0
            || self.is_placeholder()
        {
            return None;
        }
        Some(Duration::from_secs(self.interval.saturating_mul(60)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileConfig {
    #[serde(default)]
    pub current: Option<String>,
    #[serde(default)]
    pub items: Vec<ProfileItem>,
}

impl ProfileConfig {
    pub fn current_item(&self) -> Option<&ProfileItem> {
        let current = self.current.as_deref()?;
        self.items.iter().find(|p| p.id == current)
    }
}

pub fn run(command: ProfileCommand) -> Result<()> {
    match command {
        ProfileCommand::Add(args) => cmd_add(args),
        ProfileCommand::List => cmd_list(),
        ProfileCommand::Use(args) => cmd_use(args),
        ProfileCommand::Fetch(args) => cmd_fetch(args),
        ProfileCommand::Remove(args) => cmd_remove(args),
        ProfileCommand::Render(args) => cmd_render(args),
        ProfileCommand::Validate(args) => cmd_validate(args),
    }
}

fn cmd_add(args: ProfileAddArgs) -> Result<()> {
    validate_profile_id(&args.id)?;
    let paths = app_paths()?;
    let mut index = load_index(&paths.profile_index_file)?;

    if index.items.iter().any(|p| p.id == args.id) {
        bail!("profile 已存在: {}", args.id);
    }

    let mut entry = ProfileItem {
        id: args.id.clone(),
        kind: if args.file.is_some() {
            ProfileKind::Local
        } else {
            ProfileKind::Remote
        },
        url: args.url.clone(),
        interval: args.interval,
        file: format!("{}.yaml", args.id),
        created_at: now_unix(),
        updated: None,
    };

    let mut fetched = false;
    if let Some(source) = &args.file {
        import_local_profile(&entry, source, &paths.profile_dir)?;
        entry.updated = Some(now_unix());
    } else if !args.no_fetch {
        download_profile(&entry, &paths.profile_dir)?;
        entry.updated = Some(now_unix());
        fetched = true;
    }
    if args.use_profile {
        index.current = Some(entry.id.clone());
    }
    index.items.push(entry.clone());
    save_index(&paths.profile_index_file, &index)?;

    if is_json_mode() {
        return print_json(&serde_json::json!({
            "ok": true,
            "action": "profile.add",
            "profile": entry,
            "current": index.current,
        }));
    }

    println!("已添加 profile: {}", args.id);
    if fetched {
        println!("已拉取订阅内容。");
    }
    if args.use_profile {
        println!("已设为当前 profile。");
    }
    Ok(())
}

fn cmd_list() -> Result<()> {
    let paths = app_paths()?;
    let index = load_index(&paths.profile_index_file)?;

    if is_json_mode() {
        return print_json(&index);
    }

    println!("当前配置目录: {}", paths.config_dir.display());
    if index.items.is_empty() {
        println!("暂无 profile。可执行 `clash-shell profile add --id xxx --url ...`");
        return Ok(());
    }

    for profile in &index.items {
        let mark = if index.current.as_deref() == Some(profile.id.as_str()) {
            "*"
        } else {
            " "
        };
        let source = match profile.kind {
            ProfileKind::Remote => profile.url.clone().unwrap_or_default(),
            ProfileKind::Local => "local".to_string(),
        };
        let interval = if profile.interval > 0 {
            format!("每 {} 分钟更新", profile.interval)
        } else {
            "不自动更新".to_string()
        };
        println!(
            "{} {} -> {} ({}, {})",
            mark,
            profile.id,
            source,
            interval,
            profile
                .updated
                .map(|v| format!("updated={v}"))
                .unwrap_or_else(|| "未拉取".to_string())
        );
    }
    Ok(())
}

fn cmd_use(args: ProfileUseArgs) -> Result<()> {
    let paths = app_paths()?;
    let apply = args.apply || args.fetch;

    let mut index = load_index(&paths.profile_index_file)?;
    if !index.items.iter().any(|p| p.id == args.id) {
        bail!("profile 不存在: {}", args.id);
    }
    index.current = Some(args.id.clone());
    save_index(&paths.profile_index_file, &index)?;

    if args.fetch {
        refresh_profile(&paths, &args.id)?;
    }
    if apply {
        render_runtime(&paths, None)?;
    }

    if is_json_mode() {
        return print_json(&serde_json::json!({
            "ok": true,
            "action": "profile.use",
            "current": index.current,
            "applied": apply,
            "fetched": args.fetch,
        }));
    }

    println!("当前 profile 已切换为: {}", args.id);
    if apply {
        println!("已渲染到运行配置。");
    } else {
        println!(
            "提示: 仅切换了当前 profile；如需立即生效请执行 `clash-shell profile use --id {} --apply`",
            args.id
        );
    }
    Ok(())
}

fn cmd_fetch(args: ProfileFetchArgs) -> Result<()> {
    let paths = app_paths()?;
    let index = load_index(&paths.profile_index_file)?;
    let profile = index
        .items
        .iter()
        .find(|p| p.id == args.id)
        .context("profile 不存在")?;

    let profile_path = paths.profile_dir.join(&profile.file);
    if !args.force && profile_path.exists() {
        if let Some(updated) = profile.updated {
            if now_unix().saturating_sub(updated) < RECENT_FETCH_SECS {
                if is_json_mode() {
                    return print_json(&serde_json::json!({
                        "ok": true,
                        "action": "profile.fetch",
                        "id": args.id,
                        "skipped": true,
                        "reason": "recently updated",
                    }));
                }
                println!("最近 60 秒内已更新，跳过拉取。可加 --force 强制更新。");
                return Ok(());
            }
        }
    }

    let (snapshot, is_current) = refresh_profile(&paths, &args.id)?;
    if is_current {
        render_runtime(&paths, None)?;
    }

    if is_json_mode() {
        return print_json(&serde_json::json!({
            "ok": true,
            "action": "profile.fetch",
            "profile": snapshot,
            "rendered": is_current,
        }));
    }

    println!("profile 拉取成功: {}", args.id);
    Ok(())
}

fn cmd_remove(args: ProfileRemoveArgs) -> Result<()> {
    let paths = app_paths()?;
    let mut index = load_index(&paths.profile_index_file)?;

    let pos = index
        .items
        .iter()
        .position(|p| p.id == args.id)
        .context("profile 不存在")?;
    let removed = index.items.remove(pos);
    if index.current.as_deref() == Some(removed.id.as_str()) {
        index.current = None;
    }
    save_index(&paths.profile_index_file, &index)?;

    let profile_path = paths.profile_dir.join(removed.file);
    if profile_path.exists() {
        fs::remove_file(&profile_path)
            .with_context(|| format!("删除 profile 文件失败: {}", profile_path.display()))?;
    }

    if is_json_mode() {
        return print_json(&serde_json::json!({
            "ok": true,
            "action": "profile.remove",
            "removed": args.id,
            "current": index.current,
        }));
    }

    println!("已删除 profile: {}", args.id);
    Ok(())
}

fn cmd_render(args: ProfileRenderArgs) -> Result<()> {
    let paths = app_paths()?;
    let output = args
        .output
        .unwrap_or_else(|| paths.runtime_config_file.clone());
    render_runtime(&paths, Some(output.clone()))?;

    let index = load_index(&paths.profile_index_file)?;
    if is_json_mode() {
        return print_json(&serde_json::json!({
            "ok": true,
            "action": "profile.render",
            "current": index.current,
            "output": output.display().to_string(),
        }));
    }

    println!(
        "渲染完成: profile={} -> {}",
        index.current.as_deref().unwrap_or("(无)"),
        output.display()
    );
    Ok(())
}

fn cmd_validate(args: ProfileValidateArgs) -> Result<()> {
    let paths = app_paths()?;
    let index = load_index(&paths.profile_index_file)?;
    let selected = select_profile(&index, args.id.as_deref())?;
    let source_path = paths.profile_dir.join(&selected.file);
    let content = fs::read_to_string(&source_path).with_context(|| {
        format!(
            "读取 profile 失败: {}，请先执行 `clash-shell profile fetch --id {}`",
            source_path.display(),
            selected.id
        )
    })?;
    ensure_profile_content(&content)
        .with_context(|| format!("profile 不是有效 YAML 对象: {}", source_path.display()))?;
    let root = parse_lenient(&content)?;

    let mut overlay = ConfigOverlay::open(&paths);
    let overridden = overridden_keys(&root, overlay.read(false));

    if is_json_mode() {
        return print_json(&serde_json::json!({
            "ok": true,
            "action": "profile.validate",
            "profile": selected.id,
            "overridden": overridden,
        }));
    }

    println!("profile 校验通过: {}", selected.id);
    if !overridden.is_empty() {
        println!("以下字段将被受控配置覆盖:");
        for key in overridden {
            println!("- {key}");
        }
    }
    Ok(())
}

/// profile 中与受控配置取值不同、渲染时会被覆盖的顶层字段。
fn overridden_keys(profile: &Value, controlled: &Value) -> Vec<String> {
    let Some(controlled) = controlled.as_mapping() else {
        return Vec::new();
    };
    controlled
        .iter()
        .filter_map(|(key, value)| {
            let key = key.as_str()?;
            (key_exists(profile, key) && profile[key] != *value).then(|| key.to_string())
        })
        .collect()
}

fn validate_profile_id(id: &str) -> Result<()> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    if id.is_empty() || id.starts_with('.') || !id.chars().all(allowed) {
        bail!("无效的 profile 标识 `{id}`：仅支持字母/数字/.-_，且不能以 . 开头");
    }
    Ok(())
}

pub fn load_index(path: &Path) -> Result<ProfileConfig> {
    if !path.exists() {
        return Ok(ProfileConfig::default());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("读取 profile 索引失败: {}", path.display()))?;
    serde_json::from_str(&content).context("解析 profile 索引失败")
}

pub fn save_index(path: &Path, index: &ProfileConfig) -> Result<()> {
    let content = serde_json::to_string_pretty(index).context("序列化 profile 索引失败")?;
    write_file_atomic(path, &content)
}

fn select_profile<'a>(index: &'a ProfileConfig, id: Option<&str>) -> Result<&'a ProfileItem> {
    let target = if let Some(v) = id {
        v.to_string()
    } else {
        index
            .current
            .clone()
            .context("未指定 profile 且当前没有选中的 profile")?
    };
    index
        .items
        .iter()
        .find(|p| p.id == target)
        .with_context(|| format!("profile 不存在: {}", target))
}

fn build_http_client() -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .user_agent(SUBSCRIPTION_USER_AGENT)
        .build()
        .context("创建 HTTP 客户端失败")
}

/// 下载订阅并写入 profile 文件，不修改索引。
fn download_profile(entry: &ProfileItem, profile_dir: &Path) -> Result<()> {
    let url = entry
        .url
        .as_deref()
        .with_context(|| format!("profile 缺少订阅 URL: {}", entry.id))?;
    let client = build_http_client()?;

    let response = client
        .get(url)
        .send()
        .with_context(|| format!("请求订阅失败: {url}"))?
        .error_for_status()
        .with_context(|| format!("订阅响应失败: {url}"))?;

    let body = response.text().context("读取订阅响应失败")?;
    ensure_profile_content(&body).context("订阅内容不是有效 YAML 对象")?;

    let path = profile_dir.join(&entry.file);
    write_file_atomic(&path, &body)
        .with_context(|| format!("写入 profile 文件失败: {}", path.display()))
}

fn import_local_profile(entry: &ProfileItem, source: &Path, profile_dir: &Path) -> Result<()> {
    let body = fs::read_to_string(source)
        .with_context(|| format!("读取本地 profile 失败: {}", source.display()))?;
    ensure_profile_content(&body)
        .with_context(|| format!("本地 profile 不是有效 YAML 对象: {}", source.display()))?;
    let path = profile_dir.join(&entry.file);
    write_file_atomic(&path, &body)
        .with_context(|| format!("写入 profile 文件失败: {}", path.display()))
}

fn ensure_profile_content(body: &str) -> Result<()> {
    let root = parse_lenient(body)?;
    if !root.is_mapping() {
        bail!("顶层不是对象");
    }
    Ok(())
}

/// 拉取远程 profile 并回写 `updated`，返回最新条目以及它是否为当前 profile。
pub fn refresh_profile(paths: &AppPaths, id: &str) -> Result<(ProfileItem, bool)> {
    let index = load_index(&paths.profile_index_file)?;
    let entry = index
        .items
        .iter()
        .find(|p| p.id == id)
        .cloned()
        .with_context(|| format!("profile 不存在: {id}"))?;
    if entry.kind == ProfileKind::Local {
        bail!("本地 profile 无需拉取: {id}");
    }

    download_profile(&entry, &paths.profile_dir)?;
    mark_updated(&paths.profile_index_file, id)
}

// 下载期间索引可能已被其他进程改写，这里重新读取后只改 updated。
fn mark_updated(index_file: &Path, id: &str) -> Result<(ProfileItem, bool)> {
    let mut index = load_index(index_file)?;
    let is_current = index.current.as_deref() == Some(id);
    let snapshot = {
        let entry = index
            .items
            .iter_mut()
            .find(|p| p.id == id)
            .with_context(|| format!("profile 在更新期间被删除: {id}"))?;
        entry.updated = Some(now_unix());
        entry.clone()
    };
    save_index(index_file, &index)?;
    Ok((snapshot, is_current))
}

fn render_runtime(paths: &AppPaths, output: Option<PathBuf>) -> Result<()> {
    let mut overlay = ConfigOverlay::open(paths);
    let controlled = overlay.read(false).clone();
    RuntimeRenderer::new(paths.clone())
        .with_output(output)
        .generate(&controlled)
}

/// 当前 profile 内容叠加受控配置，写出内核加载的运行配置。
pub struct RuntimeRenderer {
    paths: AppPaths,
    output: Option<PathBuf>,
}

impl RuntimeRenderer {
    pub fn new(paths: AppPaths) -> Self {
        Self {
            paths,
            output: None,
        }
    }

    pub fn with_output(mut self, output: Option<PathBuf>) -> Self {
        self.output = output;
        self
    }

    fn load_base(&self) -> Result<Value> {
        let index = load_index(&self.paths.profile_index_file)?;
        let Some(item) = index.current_item() else {
            debug!("没有当前 profile，仅使用受控配置");
            return Ok(Value::Mapping(Mapping::new()));
        };
        let source = self.paths.profile_dir.join(&item.file);
        if !source.exists() {
            warn!(profile = %item.id, path = %source.display(), "当前 profile 文件不存在，仅使用受控配置");
            return Ok(Value::Mapping(Mapping::new()));
        }
        let content = fs::read_to_string(&source)
            .with_context(|| format!("读取 profile 失败: {}", source.display()))?;
        parse_lenient(&content).with_context(|| format!("解析 profile 失败: {}", source.display()))
    }
}

impl ProfileGenerator for RuntimeRenderer {
    fn generate(&self, controlled: &Value) -> Result<()> {
        let mut root = self.load_base()?;
        ensure_mapping(&mut root);
        deep_merge(&mut root, controlled);

        let output = self
            .output
            .clone()
            .unwrap_or_else(|| self.paths.runtime_config_file.clone());
        save_yaml(&output, &root)
            .with_context(|| format!("写入运行配置失败: {}", output.display()))?;
        debug!(output = %output.display(), "运行配置已生成");
        Ok(())
    }
}

pub struct IndexProfileStore {
    index_file: PathBuf,
}

impl IndexProfileStore {
    pub fn new(index_file: PathBuf) -> Self {
        Self { index_file }
    }
}

impl ProfileStore for IndexProfileStore {
    fn profile_config(&self) -> Result<ProfileConfig> {
        load_index(&self.index_file)
    }

    fn current_profile_item(&self) -> Result<Option<ProfileItem>> {
        Ok(load_index(&self.index_file)?.current_item().cloned())
    }
}

/// 通过 HTTP 拉取订阅；当前 profile 更新后同步重新渲染运行配置。
pub struct HttpProfileFetcher {
    paths: AppPaths,
    render_lock: Arc<Mutex<()>>,
}

impl HttpProfileFetcher {
    pub fn new(paths: AppPaths) -> Self {
        Self {
            paths,
            render_lock: Arc::new(Mutex::new(())),
        }
    }
}

#[async_trait]
impl ProfileFetcher for HttpProfileFetcher {
    async fn fetch(&self, item: &ProfileItem) -> Result<()> {
        let paths = self.paths.clone();
        let lock = Arc::clone(&self.render_lock);
        let entry = item.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            download_profile(&entry, &paths.profile_dir)?;

            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            let (_, is_current) = mark_updated(&paths.profile_index_file, &entry.id)?;
            if is_current {
                render_runtime(&paths, None)?;
            }
            info!(profile = %entry.id, rendered = is_current, "订阅已更新");
            Ok(())
        })
        .await
        .context("订阅更新任务异常退出")?
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|v| v.as_secs())
        .unwrap_or(0)
}
