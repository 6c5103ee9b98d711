//! 刷新调度
//!
//! 两段延迟：先等待固定的去抖时间，再等到帧时钟的下一个帧边界。
//! 新的调度会取消尚未执行的旧调度，因此连续事件只触发一次刷新。

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, warn};
use viewer_core::utils::lock;

/// 调度执行的刷新任务
pub type RefreshTask = Arc<dyn Fn() + Send + Sync>;

pub struct RefreshScheduler {
    debounce: Duration,
    frame_interval: Duration,
    /// 帧时钟原点
    origin: Instant,
    pending: Mutex<Option<JoinHandle<()>>>,
    runs: Arc<AtomicUsize>,
}

impl RefreshScheduler {
    pub fn new(debounce: Duration, frame_interval: Duration) -> Self {
        Self {
            debounce,
            frame_interval,
            origin: Instant::now(),
            pending: Mutex::new(None),
            runs: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 调度一次刷新，取消尚未执行的上一次调度
    ///
    /// 没有tokio运行时时只记录警告，不执行任务。
    pub fn schedule(&self, task: RefreshTask) {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No tokio runtime available, dropping scheduled refresh");
                return;
            }
        };

        let debounce = self.debounce;
        let frame_interval = self.frame_interval;
        let origin = self.origin;
        let runs = self.runs.clone();

        let mut pending = lock(&self.pending);
        if let Some(previous) = pending.take() {
            previous.abort();
        }

        *pending = Some(handle.spawn(async move {
            sleep(debounce).await;
            sleep_until(next_frame(origin, Instant::now(), frame_interval)).await;
            runs.fetch_add(1, Ordering::SeqCst);
            task();
        }));
    }

    /// 取消尚未执行的调度
    pub fn cancel(&self) -> bool {
        match lock(&self.pending).take() {
            Some(handle) => {
                let was_pending = !handle.is_finished();
                handle.abort();
                if was_pending {
                    debug!("Pending refresh cancelled");
                }
                was_pending
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.pending)
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// 已执行的刷新次数
    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

impl Default for RefreshScheduler {
    fn default() -> Self {
        Self::new(Duration::from_millis(16), Duration::from_millis(16))
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for RefreshScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshScheduler")
            .field("debounce", &self.debounce)
            .field("frame_interval", &self.frame_interval)
            .field("runs", &self.run_count())
            .finish()
    }
}

/// 帧时钟上不早于 `now` 的下一个帧边界
fn next_frame(origin: Instant, now: Instant, frame_interval: Duration) -> Instant {
    let interval = frame_interval.as_nanos();
    if interval == 0 {
        return now;
    }
    let elapsed = now.saturating_duration_since(origin).as_nanos();
    let frames = (elapsed + interval - 1) / interval;
    let offset = frames.saturating_mul(interval);
    origin + Duration::from_nanos(u64::try_from(offset).unwrap_or(u64::MAX))
}
