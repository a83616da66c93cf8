use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::cli::DaemonArgs;
use crate::paths::{AppPaths, app_paths};
use crate::profile::{HttpProfileFetcher, IndexProfileStore};
use crate::scheduler::{ProfileScheduler, SchedulerOptions};

pub fn run(args: DaemonArgs) -> Result<()> {
    let paths = app_paths()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("创建 tokio 运行时失败")?;
    runtime.block_on(serve(paths, args))
}

async fn serve(paths: AppPaths, args: DaemonArgs) -> Result<()> {
    let store = Arc::new(IndexProfileStore::new(paths.profile_index_file.clone()));
    let fetcher = Arc::new(HttpProfileFetcher::new(paths.clone()));
    let scheduler = ProfileScheduler::new(
        store,
        fetcher,
        SchedulerOptions {
            reschedule_after_fire: args.repeat,
        },
    );

    scheduler.init_all()?;
    info!(
        home = %paths.config_dir.display(),
        scheduled = scheduler.scheduled_count(),
        repeat = args.repeat,
        watch_secs = args.watch_secs,
        "调度器已启动，Ctrl-C 退出"
    );

    let mut watch = tokio::time::interval(Duration::from_secs(args.watch_secs.max(1)));
    watch.set_missed_tick_behavior(MissedTickBehavior::Delay);
    watch.tick().await;

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!("监听退出信号失败: {err}");
                }
                break;
            }
            _ = watch.tick() => {
                if let Err(err) = scheduler.sync() {
                    warn!("重新读取 profile 索引失败: {err:#}");
                }
            }
        }
    }

    scheduler.shutdown();
    info!(failures = scheduler.failures(), "调度器已停止");
    Ok(())
}
