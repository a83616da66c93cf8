use std::path::PathBuf;

use clap::{ArgGroup, Args, Parser, Subcommand};

const DEFAULT_WATCH_SECS: u64 = 30;

#[derive(Parser)]
#[command(name = "clash-shell", about = "mihomo 客户端的受控配置与订阅自动更新工具")]
pub struct Cli {
    #[arg(long, global = true, help = "以 JSON 格式输出")]
    pub json: bool,
    #[arg(
        long,
        global = true,
        env = "CLASH_SHELL_HOME",
        value_name = "DIR",
        help = "配置目录，默认 $XDG_CONFIG_HOME/clash-shell"
    )]
    pub home: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "查看或修改受控配置（show/patch/policy）")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    #[command(about = "管理订阅 profile（add/fetch/render/validate）")]
    Profile {
        #[command(subcommand)]
        command: ProfileCommand,
    },
    #[command(about = "前台运行订阅自动更新调度器，Ctrl-C 退出")]
    Daemon(DaemonArgs),
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    #[command(about = "输出当前受控配置")]
    Show,
    #[command(about = "按应用策略合并补丁并重新生成运行配置")]
    Patch(ConfigPatchArgs),
    #[command(about = "查看或修改应用策略（DNS/嗅探/nameserver-policy 接管开关）")]
    Policy(ConfigPolicyArgs),
}

#[derive(Subcommand)]
pub enum ProfileCommand {
    #[command(about = "添加订阅或本地 profile")]
    Add(ProfileAddArgs),
    #[command(about = "列出所有 profile 与当前 profile")]
    List,
    #[command(about = "切换当前 profile")]
    Use(ProfileUseArgs),
    #[command(about = "拉取指定 profile 的最新订阅内容")]
    Fetch(ProfileFetchArgs),
    #[command(about = "删除 profile")]
    Remove(ProfileRemoveArgs),
    #[command(about = "将当前 profile 与受控配置渲染到 runtime/config.yaml")]
    Render(ProfileRenderArgs),
    #[command(about = "校验 profile 内容，并列出会被受控配置覆盖的字段")]
    Validate(ProfileValidateArgs),
}

#[derive(Args, Clone)]
pub struct ConfigPatchArgs {
    #[arg(long, help = "YAML 补丁文件")]
    pub file: Option<PathBuf>,
    #[arg(
        long = "set",
        value_name = "KEY=VALUE",
        help = "按点号路径赋值，值按 YAML 解析，例如 dns.enable=false"
    )]
    pub set: Vec<String>,
}

#[derive(Args, Clone)]
pub struct ConfigPolicyArgs {
    #[arg(long, help = "是否接管 dns 与 hosts")]
    pub control_dns: Option<bool>,
    #[arg(long, help = "是否接管 sniffer")]
    pub control_sniff: Option<bool>,
    #[arg(long, help = "是否保留 dns.nameserver-policy")]
    pub use_nameserver_policy: Option<bool>,
}

#[derive(Args, Clone)]
#[command(group(ArgGroup::new("source").required(true).args(["url", "file"])))]
pub struct ProfileAddArgs {
    #[arg(long, help = "profile 标识")]
    pub id: String,
    #[arg(long, help = "订阅 URL")]
    pub url: Option<String>,
    #[arg(long, help = "导入本地 YAML 文件作为 profile")]
    pub file: Option<PathBuf>,
    #[arg(long, default_value_t = 0, help = "自动更新间隔（分钟），0 表示不自动更新")]
    pub interval: u64,
    #[arg(long = "use", help = "添加后设为当前 profile")]
    pub use_profile: bool,
    #[arg(long, help = "添加时不立即拉取")]
    pub no_fetch: bool,
}

#[derive(Args, Clone)]
pub struct ProfileUseArgs {
    #[arg(long, help = "profile 标识")]
    pub id: String,
    #[arg(long, help = "切换后立即渲染到 runtime/config.yaml")]
    pub apply: bool,
    #[arg(long, help = "切换后强制拉取最新订阅（隐含 --apply）")]
    pub fetch: bool,
}

#[derive(Args, Clone)]
pub struct ProfileFetchArgs {
    #[arg(long, help = "profile 标识")]
    pub id: String,
    #[arg(long, help = "忽略缓存强制更新")]
    pub force: bool,
}

#[derive(Args, Clone)]
pub struct ProfileRemoveArgs {
    #[arg(long, help = "profile 标识")]
    pub id: String,
}

#[derive(Args, Clone)]
pub struct ProfileRenderArgs {
    #[arg(long, help = "输出配置路径，默认 runtime/config.yaml")]
    pub output: Option<PathBuf>,
}

#[derive(Args, Clone)]
pub struct ProfileValidateArgs {
    #[arg(long, help = "profile 标识，默认使用当前 profile")]
    pub id: Option<String>,
}

#[derive(Args, Clone)]
pub struct DaemonArgs {
    #[arg(long, help = "定时器触发后按最新间隔重新排期（默认只触发一次）")]
    pub repeat: bool,
    #[arg(
        long,
        default_value_t = DEFAULT_WATCH_SECS,
        help = "重新读取 profile 索引的间隔秒数"
    )]
    pub watch_secs: u64,
}
