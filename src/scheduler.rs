use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::profile::{ProfileConfig, ProfileItem};

/// 当前 profile 的定时器额外延后，错开其他 profile 的更新。
const CURRENT_PROFILE_SKEW: Duration = Duration::from_secs(10);

pub trait ProfileStore: Send + Sync {
    fn profile_config(&self) -> Result<ProfileConfig>;
    fn current_profile_item(&self) -> Result<Option<ProfileItem>>;
}

/// 拉取并保存 profile 内容；失败只会被调度器记录，不会向上传播。
#[async_trait]
pub trait ProfileFetcher: Send + Sync {
    async fn fetch(&self, item: &ProfileItem) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerOptions {
    /// 定时器触发后按最新间隔重新排期；关闭时每个定时器只触发一次。
    pub reschedule_after_fire: bool,
}

struct TimerSlot {
    generation: u64,
    handle: JoinHandle<()>,
}

struct Inner {
    store: Arc<dyn ProfileStore>,
    fetcher: Arc<dyn ProfileFetcher>,
    options: SchedulerOptions,
    timers: Mutex<HashMap<String, TimerSlot>>,
    known: Mutex<HashMap<String, ProfileItem>>,
    next_generation: AtomicU64,
    failures: AtomicU64,
}

impl Inner {
    fn lock_timers(&self) -> MutexGuard<'_, HashMap<String, TimerSlot>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_known(&self) -> MutexGuard<'_, HashMap<String, ProfileItem>> {
        self.known.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // 只移除自己那一代的条目，避免误删触发期间新装的定时器。
    fn release(&self, id: &str, generation: u64) {
        let mut timers = self.lock_timers();
        if timers.get(id).map(|slot| slot.generation) == Some(generation) {
            timers.remove(id);
        }
    }

    async fn refresh(&self, item: &ProfileItem) {
        match self.fetcher.fetch(item).await {
            Ok(()) => debug!(profile = %item.id, "订阅更新完成"),
            Err(err) => {
                let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(profile = %item.id, failures, "订阅更新失败，已忽略: {err:#}");
            }
        }
    }
}

/// 按 profile 维护一次性更新定时器，每个 id 至多一个待触发定时器。
///
/// 所有排期操作都会 `tokio::spawn`，必须在 tokio 运行时内调用。
#[derive(Clone)]
pub struct ProfileScheduler {
    inner: Arc<Inner>,
}

impl ProfileScheduler {
    pub fn new(
        store: Arc<dyn ProfileStore>,
        fetcher: Arc<dyn ProfileFetcher>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                fetcher,
                options,
                timers: Mutex::new(HashMap::new()),
                known: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
        }
    }

    /// 启动时调用：每个需要自动更新的 profile 立即更新一次并排期。
    pub fn init_all(&self) -> Result<()> {
        let config = self.inner.store.profile_config()?;
        let current = self.inner.store.current_profile_item()?;

        let mut scheduled = 0usize;
        for item in config
            .items
            .iter()
            .filter(|p| config.current.as_deref() != Some(p.id.as_str()))
        {
            if let Some(interval) = item.refresh_interval() {
                self.refresh_now(item);
                self.schedule(item, interval);
                scheduled += 1;
            }
        }
        if let Some(item) = &current {
            if let Some(interval) = item.refresh_interval() {
                self.refresh_now(item);
                self.schedule(item, interval.saturating_add(CURRENT_PROFILE_SKEW));
                scheduled += 1;
            }
        }

        *self.inner.lock_known() = config
            .items
            .iter()
            .map(|p| (p.id.clone(), p.clone()))
            .collect();
        info!(profiles = config.items.len(), scheduled, "订阅自动更新已初始化");
        Ok(())
    }

    /// profile 新增或编辑后调用；只排期，不立即更新。
    pub fn register(&self, item: &ProfileItem) {
        match item.refresh_interval() {
            Some(interval) => self.schedule(item, interval),
            None => {
                if self.cancel(&item.id) {
                    debug!(profile = %item.id, "profile 不再需要自动更新，已取消定时器");
                }
            }
        }
        self.inner
            .lock_known()
            .insert(item.id.clone(), item.clone());
    }

    pub fn cancel(&self, id: &str) -> bool {
        match self.inner.lock_timers().remove(id) {
            Some(slot) => {
                slot.handle.abort();
                true
            }
            None => false,
        }
    }

    /// 重新读取 profile 列表：新增或间隔/地址变化的重新排期，已删除的取消。
    pub fn sync(&self) -> Result<()> {
        let config = self.inner.store.profile_config()?;

        let (changed, removed) = {
            let known = self.inner.lock_known();
            let changed: Vec<ProfileItem> = config
                .items
                .iter()
                .filter(|item| match known.get(&item.id) {
                    Some(prev) => {
                        prev.kind != item.kind
                            || prev.url != item.url
                            || prev.interval != item.interval
                    }
                    None => true,
                })
                .cloned()
                .collect();
            let removed: Vec<String> = known
                .keys()
                .filter(|id| !config.items.iter().any(|p| &p.id == *id))
                .cloned()
                .collect();
            (changed, removed)
        };

        for id in removed {
            self.inner.lock_known().remove(&id);
            if self.cancel(&id) {
                info!(profile = %id, "profile 已删除，取消自动更新");
            }
        }
        for item in changed {
            info!(profile = %item.id, interval = item.interval, "profile 已变更，重新排期");
            self.register(&item);
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        let mut timers = self.inner.lock_timers();
        for (_, slot) in timers.drain() {
            slot.handle.abort();
        }
    }

    #[cfg(test)]
    fn is_scheduled(&self, id: &str) -> bool {
        self.inner.lock_timers().contains_key(id)
    }

    pub fn scheduled_count(&self) -> usize {
        self.inner.lock_timers().len()
    }

    /// 累计的更新失败次数。
    pub fn failures(&self) -> u64 {
        self.inner.failures.load(Ordering::Relaxed)
    }

    /// 安装定时器的唯一入口：先取消同 id 的旧定时器再登记新的，全程持锁。
    pub fn reschedule<F, Fut>(&self, id: &str, delay: Duration, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut timers = self.inner.lock_timers();

        let inner = Arc::clone(&self.inner);
        let key = id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.release(&key, generation);
            callback().await;
        });

        if let Some(previous) = timers.insert(id.to_string(), TimerSlot { generation, handle }) {
            previous.handle.abort();
            debug!(profile = %id, "已替换旧的更新定时器");
        }
    }

    fn refresh_now(&self, item: &ProfileItem) {
        let inner = Arc::clone(&self.inner);
        let item = item.clone();
        tokio::spawn(async move {
            inner.refresh(&item).await;
        });
    }

    fn schedule(&self, item: &ProfileItem, delay: Duration) {
        debug!(profile = %item.id, delay_secs = delay.as_secs(), "已排期订阅更新");
        let scheduler = self.clone();
        let target = item.clone();
        self.reschedule(&item.id, delay, move || async move {
            scheduler.fire(target).await;
        });
    }

    async fn fire(self, item: ProfileItem) {
        self.inner.refresh(&item).await;
        if !self.inner.options.reschedule_after_fire {
            return;
        }
        match self.next_schedule(&item) {
            Some((latest, delay)) => self.schedule(&latest, delay),
            None => debug!(profile = %item.id, "profile 已不需要自动更新，停止排期"),
        }
    }

    fn next_schedule(&self, item: &ProfileItem) -> Option<(ProfileItem, Duration)> {
        match self.inner.store.profile_config() {
            Ok(config) => {
                let latest = config.items.iter().find(|p| p.id == item.id)?.clone();
                let interval = latest.refresh_interval()?;
                let delay = if config.current.as_deref() == Some(latest.id.as_str()) {
                    interval.saturating_add(CURRENT_PROFILE_SKEW)
                } else {
                    interval
                };
                Some((latest, delay))
            }
            Err(err) => {
                warn!(profile = %item.id, "读取 profile 列表失败，沿用原间隔: {err:#}");
                item.refresh_interval().map(|interval| (item.clone(), interval))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::bail;

    use super::*;
    use crate::profile::{EMPTY_PROFILE_URL, PLACEHOLDER_PROFILE_ID, ProfileKind};

    struct MemoryStore {
        config: Mutex<ProfileConfig>,
    }

    impl MemoryStore {
        fn new(config: ProfileConfig) -> Arc<Self> {
            Arc::new(Self {
                config: Mutex::new(config),
            })
        }

        fn set(&self, config: ProfileConfig) {
            *self.config.lock().expect("锁已中毒") = config;
        }
    }

    impl ProfileStore for MemoryStore {
        fn profile_config(&self) -> Result<ProfileConfig> {
            Ok(self.config.lock().expect("锁已中毒").clone())
        }

        fn current_profile_item(&self) -> Result<Option<ProfileItem>> {
            Ok(self
                .config
                .lock()
                .expect("锁已中毒")
                .current_item()
                .cloned())
        }
    }

    #[derive(Default)]
    struct RecordingFetcher {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingFetcher {
        fn failing() -> Arc<Self> {
            Arc::new(Self {
                fail: true,
                ..Self::default()
            })
        }

        fn calls_for(&self, id: &str) -> usize {
            self.calls
                .lock()
                .expect("锁已中毒")
                .iter()
                .filter(|c| c.as_str() == id)
                .count()
        }

        fn total(&self) -> usize {
            self.calls.lock().expect("锁已中毒").len()
        }
    }

    #[async_trait]
    impl ProfileFetcher for RecordingFetcher {
        async fn fetch(&self, item: &ProfileItem) -> Result<()> {
            self.calls.lock().expect("锁已中毒").push(item.id.clone());
            if self.fail {
                bail!("模拟网络错误");
            }
            Ok(())
        }
    }

    fn remote(id: &str, interval: u64) -> ProfileItem {
        ProfileItem {
            id: id.to_string(),
            kind: ProfileKind::Remote,
            url: Some(format!("https://example.com/{id}.yaml")),
            interval,
            file: format!("{id}.yaml"),
            created_at: 0,
            updated: None,
        }
    }

    fn config(current: Option<&str>, items: Vec<ProfileItem>) -> ProfileConfig {
        ProfileConfig {
            current: current.map(str::to_string),
            items,
        }
    }

    fn scheduler_with(
        store: Arc<MemoryStore>,
        fetcher: Arc<RecordingFetcher>,
        options: SchedulerOptions,
    ) -> ProfileScheduler {
        ProfileScheduler::new(store, fetcher, options)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn register_twice_should_keep_single_timer() {
        let store = MemoryStore::new(ProfileConfig::default());
        let fetcher = Arc::new(RecordingFetcher::default());
        let scheduler = scheduler_with(store, fetcher.clone(), SchedulerOptions::default());

        scheduler.register(&remote("a", 1));
        scheduler.register(&remote("a", 1));
        assert_eq!(scheduler.scheduled_count(), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(fetcher.calls_for("a"), 1);
        assert!(!scheduler.is_scheduled("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn reregister_should_apply_new_interval() {
        let store = MemoryStore::new(ProfileConfig::default());
        let fetcher = Arc::new(RecordingFetcher::default());
        let scheduler = scheduler_with(store, fetcher.clone(), SchedulerOptions::default());

        scheduler.register(&remote("a", 1));
        scheduler.register(&remote("a", 5));

        tokio::time::sleep(Duration::from_secs(4 * 60)).await;
        assert_eq!(fetcher.calls_for("a"), 0);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(fetcher.calls_for("a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn init_all_should_skip_placeholder_profile() {
        let mut placeholder = remote(PLACEHOLDER_PROFILE_ID, 5);
        placeholder.url = Some(EMPTY_PROFILE_URL.to_string());
        let store = MemoryStore::new(config(
            Some(PLACEHOLDER_PROFILE_ID),
            vec![placeholder],
        ));
        let fetcher = Arc::new(RecordingFetcher::default());
        let scheduler = scheduler_with(store, fetcher.clone(), SchedulerOptions::default());

        scheduler.init_all().expect("初始化失败");
        settle().await;
        assert_eq!(fetcher.total(), 0);
        assert_eq!(scheduler.scheduled_count(), 0);

        tokio::time::sleep(Duration::from_secs(10 * 60)).await;
        assert_eq!(fetcher.total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn init_all_should_refresh_and_schedule_only_eligible_profiles() {
        let mut local = remote("local", 1);
        local.kind = ProfileKind::Local;
        let store = MemoryStore::new(config(
            Some("cur"),
            vec![remote("a", 1), remote("manual", 0), local, remote("cur", 2)],
        ));
        let fetcher = Arc::new(RecordingFetcher::default());
        let scheduler = scheduler_with(store, fetcher.clone(), SchedulerOptions::default());

        scheduler.init_all().expect("初始化失败");
        settle().await;

        assert_eq!(fetcher.calls_for("a"), 1);
        assert_eq!(fetcher.calls_for("cur"), 1);
        assert_eq!(fetcher.total(), 2);
        assert!(scheduler.is_scheduled("a"));
        assert!(scheduler.is_scheduled("cur"));
        assert_eq!(scheduler.scheduled_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn current_profile_timer_should_fire_after_skew() {
        let store = MemoryStore::new(config(Some("cur"), vec![remote("cur", 1)]));
        let fetcher = Arc::new(RecordingFetcher::default());
        let scheduler = scheduler_with(store, fetcher.clone(), SchedulerOptions::default());

        scheduler.init_all().expect("初始化失败");
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(fetcher.calls_for("cur"), 1, "仅有启动时的立即更新");

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fetcher.calls_for("cur"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn current_profile_with_huge_interval_should_not_overflow() {
        let store = MemoryStore::new(config(Some("cur"), vec![remote("cur", u64::MAX)]));
        let fetcher = Arc::new(RecordingFetcher::default());
        let scheduler = scheduler_with(store, fetcher.clone(), SchedulerOptions::default());

        scheduler.init_all().expect("初始化失败");
        settle().await;
        assert_eq!(fetcher.calls_for("cur"), 1);
        assert!(scheduler.is_scheduled("cur"));

        let (latest, delay) = scheduler
            .next_schedule(&remote("cur", u64::MAX))
            .expect("应当继续排期");
        assert_eq!(latest.id, "cur");
        assert_eq!(delay, Duration::MAX);
        scheduler.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn fired_timer_should_not_rearm_by_default() {
        let store = MemoryStore::new(config(None, vec![remote("a", 1)]));
        let fetcher = Arc::new(RecordingFetcher::default());
        let scheduler = scheduler_with(store, fetcher.clone(), SchedulerOptions::default());

        scheduler.register(&remote("a", 1));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(fetcher.calls_for("a"), 1);
        assert!(!scheduler.is_scheduled("a"));

        tokio::time::sleep(Duration::from_secs(5 * 60)).await;
        assert_eq!(fetcher.calls_for("a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fired_timer_should_rearm_with_latest_interval_when_enabled() {
        let store = MemoryStore::new(config(None, vec![remote("a", 1)]));
        let fetcher = Arc::new(RecordingFetcher::default());
        let scheduler = scheduler_with(
            store.clone(),
            fetcher.clone(),
            SchedulerOptions {
                reschedule_after_fire: true,
            },
        );

        scheduler.register(&remote("a", 1));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(fetcher.calls_for("a"), 1);
        assert!(scheduler.is_scheduled("a"));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fetcher.calls_for("a"), 2);

        store.set(config(None, vec![remote("a", 0)]));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fetcher.calls_for("a"), 3);
        assert!(!scheduler.is_scheduled("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_failures_should_be_counted_not_propagated() {
        let store = MemoryStore::new(config(None, vec![remote("a", 1)]));
        let fetcher = RecordingFetcher::failing();
        let scheduler = scheduler_with(store, fetcher.clone(), SchedulerOptions::default());

        scheduler.init_all().expect("初始化不应因更新失败而失败");
        settle().await;
        assert_eq!(scheduler.failures(), 1);
        assert!(scheduler.is_scheduled("a"));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(scheduler.failures(), 2);
        assert_eq!(fetcher.calls_for("a"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn register_should_cancel_timer_when_interval_cleared() {
        let store = MemoryStore::new(ProfileConfig::default());
        let fetcher = Arc::new(RecordingFetcher::default());
        let scheduler = scheduler_with(store, fetcher.clone(), SchedulerOptions::default());

        scheduler.register(&remote("a", 1));
        scheduler.register(&remote("a", 0));
        assert!(!scheduler.is_scheduled("a"));

        tokio::time::sleep(Duration::from_secs(5 * 60)).await;
        assert_eq!(fetcher.total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_should_follow_added_changed_and_removed_profiles() {
        let store = MemoryStore::new(config(None, vec![remote("a", 1)]));
        let fetcher = Arc::new(RecordingFetcher::default());
        let scheduler =
            scheduler_with(store.clone(), fetcher.clone(), SchedulerOptions::default());

        scheduler.init_all().expect("初始化失败");
        settle().await;
        assert_eq!(fetcher.calls_for("a"), 1);

        store.set(config(None, vec![remote("a", 5), remote("b", 1)]));
        scheduler.sync().expect("同步失败");
        assert!(scheduler.is_scheduled("a"));
        assert!(scheduler.is_scheduled("b"));
        settle().await;
        assert_eq!(fetcher.total(), 1, "sync 不应立即触发更新");

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(fetcher.calls_for("a"), 1, "a 已改为 5 分钟");
        assert_eq!(fetcher.calls_for("b"), 1);

        store.set(config(None, vec![remote("b", 1)]));
        scheduler.sync().expect("同步失败");
        assert!(!scheduler.is_scheduled("a"));

        tokio::time::sleep(Duration::from_secs(5 * 60)).await;
        assert_eq!(fetcher.calls_for("a"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_should_leave_unchanged_profiles_alone() {
        let store = MemoryStore::new(config(None, vec![remote("a", 1)]));
        let fetcher = Arc::new(RecordingFetcher::default());
        let scheduler = scheduler_with(store, fetcher.clone(), SchedulerOptions::default());

        scheduler.init_all().expect("初始化失败");
        tokio::time::sleep(Duration::from_secs(30)).await;
        scheduler.sync().expect("同步失败");

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(fetcher.calls_for("a"), 2, "原定时器不应被重置");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_should_abort_all_timers() {
        let store = MemoryStore::new(ProfileConfig::default());
        let fetcher = Arc::new(RecordingFetcher::default());
        let scheduler = scheduler_with(store, fetcher.clone(), SchedulerOptions::default());

        scheduler.register(&remote("a", 1));
        scheduler.register(&remote("b", 2));
        scheduler.shutdown();
        assert_eq!(scheduler.scheduled_count(), 0);
        assert!(!scheduler.cancel("a"));

        tokio::time::sleep(Duration::from_secs(5 * 60)).await;
        assert_eq!(fetcher.total(), 0);
    }
}
