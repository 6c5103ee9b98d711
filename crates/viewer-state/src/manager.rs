//! 视口状态管理器
//!
//! 每个视口一条状态记录。非法转换不会返回错误或panic，而是记录警告并
//! 保持原状态：渲染引擎回调可能与销毁流程竞争，不能因此中断事件循环。

use crate::state_machine::ViewportStateMachine;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use viewer_core::utils::lock;
use viewer_core::{ImageData, MetricsSink, NoopMetrics, ViewportStateData, ViewportStatus};

/// 状态订阅回调
pub type StateSubscriber = Arc<dyn Fn(&ViewportStateData) + Send + Sync>;

type SubscriberMap = HashMap<String, Vec<(Uuid, StateSubscriber)>>;

/// 状态管理器配置
#[derive(Debug, Clone)]
pub struct ViewportStateConfig {
    /// 销毁后记录保留的时长
    pub grace_period: Duration,
    /// 不允许渲染的状态集合
    pub non_renderable: HashSet<ViewportStatus>,
}

impl Default for ViewportStateConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_millis(1000),
            non_renderable: [
                ViewportStatus::Initializing,
                ViewportStatus::Disposing,
                ViewportStatus::Disposed,
            ]
            .into_iter()
            .collect(),
        }
    }
}

/// 单个字段的更新方式
#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate<T> {
    Keep,
    Set(T),
    Clear,
}

impl<T> Default for FieldUpdate<T> {
    fn default() -> Self {
        FieldUpdate::Keep
    }
}

impl<T> FieldUpdate<T> {
    fn apply(self, slot: &mut Option<T>) {
        match self {
            FieldUpdate::Keep => {}
            FieldUpdate::Set(value) => *slot = Some(value),
            FieldUpdate::Clear => *slot = None,
        }
    }
}

/// 状态转换时合并进记录的部分数据
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    pub image_data: FieldUpdate<ImageData>,
    pub error: FieldUpdate<String>,
}

impl StatePatch {
    pub fn with_image_data(mut self, image_data: ImageData) -> Self {
        self.image_data = FieldUpdate::Set(image_data);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = FieldUpdate::Set(error.into());
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = FieldUpdate::Clear;
        self
    }

    fn apply(self, data: &mut ViewportStateData) {
        self.image_data.apply(&mut data.image_data);
        self.error.apply(&mut data.error);
    }
}

#[derive(Debug, Clone)]
struct StateRecord {
    data: ViewportStateData,
    /// 仅 Disposed 记录带有清除时间
    purge_at: Option<Instant>,
}

/// 订阅句柄
///
/// 丢弃句柄不会取消订阅，需要显式调用 [`Subscription::unsubscribe`]。
#[derive(Debug)]
pub struct Subscription {
    viewport_id: String,
    id: Option<Uuid>,
    subscribers: Weak<Mutex<SubscriberMap>>,
}

impl Subscription {
    fn detached(viewport_id: &str) -> Self {
        Self {
            viewport_id: viewport_id.to_string(),
            id: None,
            subscribers: Weak::new(),
        }
    }

    pub fn viewport_id(&self) -> &str {
        &self.viewport_id
    }

    /// 是否实际注册了回调
    pub fn is_attached(&self) -> bool {
        self.id.is_some() && self.subscribers.strong_count() > 0
    }

    /// 取消订阅，返回回调是否仍处于注册状态
    pub fn unsubscribe(self) -> bool {
        let (Some(id), Some(subscribers)) = (self.id, self.subscribers.upgrade()) else {
            return false;
        };

        let mut subscribers = lock(&subscribers);
        let Some(callbacks) = subscribers.get_mut(&self.viewport_id) else {
            return false;
        };
        let before = callbacks.len();
        callbacks.retain(|(callback_id, _)| *callback_id != id);
        let removed = callbacks.len() != before;
        if callbacks.is_empty() {
            subscribers.remove(&self.viewport_id);
        }
        removed
    }
}

/// 视口状态管理器
///
/// 所有方法都只需要 `&self`，订阅回调中可以再次调用管理器。
pub struct ViewportStateManager {
    state_machine: ViewportStateMachine,
    config: ViewportStateConfig,
    states: Mutex<HashMap<String, StateRecord>>,
    subscribers: Arc<Mutex<SubscriberMap>>,
    metrics: Arc<dyn MetricsSink>,
}

impl ViewportStateManager {
    /// 使用默认配置创建
    pub fn new() -> Self {
        Self::with_config(ViewportStateConfig::default())
    }

    pub fn with_config(config: ViewportStateConfig) -> Self {
        Self {
            state_machine: ViewportStateMachine::new(),
            config,
            states: Mutex::new(HashMap::new()),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &ViewportStateConfig {
        &self.config
    }

    pub fn state_machine(&self) -> &ViewportStateMachine {
        &self.state_machine
    }

    /// 创建初始化状态的记录
    ///
    /// 已存在记录（包括尚未过宽限期的 Disposed 记录）时忽略并返回 `false`。
    pub fn initialize(&self, viewport_id: &str) -> bool {
        let mut states = self.states_guard();
        if let Some(existing) = states.get(viewport_id) {
            warn!(
                "Viewport {} already exists with status {}, ignoring initialize",
                viewport_id, existing.data.status
            );
            return false;
        }

        states.insert(
            viewport_id.to_string(),
            StateRecord {
                data: ViewportStateData::initializing(viewport_id),
                purge_at: None,
            },
        );

        info!("Viewport {} initialized", viewport_id);
        self.metrics.transition_applied(ViewportStatus::Initializing);
        true
    }

    /// 执行状态转换，返回是否生效
    pub fn transition(&self, viewport_id: &str, to: ViewportStatus, patch: StatePatch) -> bool {
        let snapshot = {
            let mut states = self.states_guard();
            let Some(record) = states.get_mut(viewport_id) else {
                warn!("Cannot transition unknown viewport {} to {}", viewport_id, to);
                self.metrics.transition_rejected();
                return false;
            };

            if let Err(e) = self.state_machine.transition(record.data.status, to) {
                warn!("Viewport {}: {}", viewport_id, e);
                self.metrics.transition_rejected();
                return false;
            }

            let from = record.data.status;
            record.data.status = to;
            patch.apply(&mut record.data);
            record.data.last_transition = Utc::now();
            if to == ViewportStatus::Disposed {
                record.purge_at = Some(Instant::now() + self.config.grace_period);
            }

            debug!("Viewport {} transitioned {} -> {}", viewport_id, from, to);
            record.data.clone()
        };

        self.metrics.transition_applied(to);
        self.notify(viewport_id, &snapshot);
        true
    }

    /// 转换到错误状态并记录错误
    pub fn set_error(&self, viewport_id: &str, error: impl Into<String>) -> bool {
        self.transition(
            viewport_id,
            ViewportStatus::Error,
            StatePatch::default().with_error(error),
        )
    }

    /// 影像加载完成：转换到就绪状态并清除错误
    pub fn set_image_data(&self, viewport_id: &str, image_data: ImageData) -> bool {
        self.transition(
            viewport_id,
            ViewportStatus::Ready,
            StatePatch::default().with_image_data(image_data).clear_error(),
        )
    }

    /// 开始加载：转换到加载状态并清除错误
    pub fn start_loading(&self, viewport_id: &str) -> bool {
        self.transition(
            viewport_id,
            ViewportStatus::Loading,
            StatePatch::default().clear_error(),
        )
    }

    pub fn get_state(&self, viewport_id: &str) -> Option<ViewportStateData> {
        self.states_guard()
            .get(viewport_id)
            .map(|record| record.data.clone())
    }

    pub fn get_all_states(&self) -> HashMap<String, ViewportStateData> {
        self.states_guard()
            .iter()
            .map(|(id, record)| (id.clone(), record.data.clone()))
            .collect()
    }

    /// 视口当前是否允许渲染/交互
    pub fn can_render(&self, viewport_id: &str) -> bool {
        self.status(viewport_id)
            .map(|status| !self.config.non_renderable.contains(&status))
            .unwrap_or(false)
    }

    pub fn is_ready(&self, viewport_id: &str) -> bool {
        self.status(viewport_id) == Some(ViewportStatus::Ready)
    }

    pub fn is_loading(&self, viewport_id: &str) -> bool {
        self.status(viewport_id) == Some(ViewportStatus::Loading)
    }

    pub fn has_image_data(&self, viewport_id: &str) -> bool {
        self.states_guard()
            .get(viewport_id)
            .map(|record| record.data.image_data.is_some())
            .unwrap_or(false)
    }

    /// 销毁视口
    ///
    /// 先转换到 Disposing 并通知订阅者，随后移除该视口的全部订阅者，
    /// 写入终态 Disposed 记录；记录在宽限期过后才被清除，以便迟到的
    /// 异步回调仍能按ID读取状态。
    pub fn dispose(&self, viewport_id: &str) -> bool {
        match self.status(viewport_id) {
            None => {
                debug!("Dispose requested for unknown viewport {}", viewport_id);
                return false;
            }
            Some(ViewportStatus::Disposing) | Some(ViewportStatus::Disposed) => {
                debug!("Viewport {} is already being disposed", viewport_id);
                return false;
            }
            Some(_) => {}
        }

        if !self.transition(viewport_id, ViewportStatus::Disposing, StatePatch::default()) {
            return false;
        }

        lock(&self.subscribers).remove(viewport_id);

        {
            let mut states = self.states_guard();
            if let Some(record) = states.get_mut(viewport_id) {
                record.data.status = ViewportStatus::Disposed;
                record.data.last_transition = Utc::now();
                record.purge_at = Some(Instant::now() + self.config.grace_period);
            }
        }

        self.metrics.transition_applied(ViewportStatus::Disposed);
        info!(
            "Viewport {} disposed, record kept for {:?}",
            viewport_id, self.config.grace_period
        );
        true
    }

    /// 订阅某个视口的状态变化
    ///
    /// 对已处于销毁流程的视口订阅不会注册回调。
    pub fn subscribe<F>(&self, viewport_id: &str, callback: F) -> Subscription
    where
        F: Fn(&ViewportStateData) + Send + Sync + 'static,
    {
        if matches!(
            self.status(viewport_id),
            Some(ViewportStatus::Disposing) | Some(ViewportStatus::Disposed)
        ) {
            warn!("Ignoring subscription to disposed viewport {}", viewport_id);
            return Subscription::detached(viewport_id);
        }

        let id = Uuid::new_v4();
        lock(&self.subscribers)
            .entry(viewport_id.to_string())
            .or_default()
            .push((id, Arc::new(callback)));

        Subscription {
            viewport_id: viewport_id.to_string(),
            id: Some(id),
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn subscriber_count(&self, viewport_id: &str) -> usize {
        lock(&self.subscribers)
            .get(viewport_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// 清除全部记录与订阅者
    pub fn clear_all(&self) {
        lock(&self.states).clear();
        lock(&self.subscribers).clear();
        info!("All viewport states cleared");
    }

    fn status(&self, viewport_id: &str) -> Option<ViewportStatus> {
        self.states_guard()
            .get(viewport_id)
            .map(|record| record.data.status)
    }

    /// 取得状态表并清除已过宽限期的 Disposed 记录
    fn states_guard(&self) -> std::sync::MutexGuard<'_, HashMap<String, StateRecord>> {
        let mut states = lock(&self.states);
        let now = Instant::now();
        states.retain(|viewport_id, record| match record.purge_at {
            Some(purge_at) if purge_at <= now => {
                debug!("Purging disposed viewport {}", viewport_id);
                false
            }
            _ => true,
        });
        states
    }

    fn notify(&self, viewport_id: &str, data: &ViewportStateData) {
        let callbacks: Vec<StateSubscriber> = lock(&self.subscribers)
            .get(viewport_id)
            .map(|callbacks| callbacks.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(data))).is_err() {
                error!(
                    "State subscriber for viewport {} panicked while handling {}",
                    viewport_id, data.status
                );
            }
        }
    }
}

impl Default for ViewportStateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ViewportStateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewportStateManager")
            .field("config", &self.config)
            .field("viewports", &lock(&self.states).len())
            .finish()
    }
}
