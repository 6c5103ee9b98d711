//! 渲染引擎能力抽象
//!
//! 视口协调层把渲染引擎视为外部协作者，只依赖这里定义的能力：
//! 读取/写入相机与显示属性、切换堆栈影像、渲染，以及在渲染表面上
//! 订阅/取消订阅视口事件。

use crate::models::{Camera, CanvasSize, ImageData, ViewportProperties};
use crate::utils::{read_lock, write_lock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// 渲染引擎
pub trait RenderingEngine: Send + Sync {
    /// 引擎ID
    fn id(&self) -> &str;

    /// 按ID获取视口，视口不存在时返回 `None`
    fn get_viewport(&self, viewport_id: &str) -> Option<Arc<dyn ViewportHandle>>;
}

/// 单个视口的操作句柄
pub trait ViewportHandle: Send + Sync {
    fn id(&self) -> &str;

    fn camera(&self) -> Camera;

    fn set_camera(&self, camera: Camera);

    fn properties(&self) -> ViewportProperties;

    fn set_properties(&self, properties: ViewportProperties);

    /// 当前堆栈的影像ID序列
    fn image_ids(&self) -> Vec<String>;

    fn current_image_id_index(&self) -> usize;

    fn current_image_id(&self) -> Option<String> {
        self.image_ids().get(self.current_image_id_index()).cloned()
    }

    fn set_image_id_index(&self, index: usize);

    /// 当前帧的影像元数据，尚未加载时为 `None`
    fn image_data(&self) -> Option<ImageData>;

    fn canvas_size(&self) -> CanvasSize;

    fn render(&self);
}

/// 视口事件类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ViewportEventKind {
    CameraModified,
    StackNewImage,
    VoiModified,
}

/// 视口事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ViewportEvent {
    CameraModified {
        viewport_id: String,
    },
    StackNewImage {
        viewport_id: String,
        image_id: String,
        image_index: usize,
    },
    VoiModified {
        viewport_id: String,
    },
}

impl ViewportEvent {
    pub fn kind(&self) -> ViewportEventKind {
        match self {
            ViewportEvent::CameraModified { .. } => ViewportEventKind::CameraModified,
            ViewportEvent::StackNewImage { .. } => ViewportEventKind::StackNewImage,
            ViewportEvent::VoiModified { .. } => ViewportEventKind::VoiModified,
        }
    }

    pub fn viewport_id(&self) -> &str {
        match self {
            ViewportEvent::CameraModified { viewport_id }
            | ViewportEvent::StackNewImage { viewport_id, .. }
            | ViewportEvent::VoiModified { viewport_id } => viewport_id,
        }
    }
}

/// 事件处理回调
pub type EventHandler = Arc<dyn Fn(&ViewportEvent) + Send + Sync>;

/// 事件订阅标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// 渲染表面：视口底层元素上的事件订阅能力
pub trait RenderSurface: Send + Sync {
    fn subscribe(&self, kind: ViewportEventKind, handler: EventHandler) -> SubscriptionId;

    /// 取消订阅，返回订阅是否存在
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

/// 渲染引擎注册表
///
/// 叠加层等组件只持有引擎ID，在每次刷新时通过注册表查找引擎。
#[derive(Default)]
pub struct EngineRegistry {
    engines: RwLock<HashMap<String, Arc<dyn RenderingEngine>>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册引擎，同ID的旧引擎被替换
    pub fn register(&self, engine: Arc<dyn RenderingEngine>) {
        let id = engine.id().to_string();
        tracing::debug!("Registering rendering engine {}", id);
        write_lock(&self.engines).insert(id, engine);
    }

    pub fn unregister(&self, engine_id: &str) -> Option<Arc<dyn RenderingEngine>> {
        write_lock(&self.engines).remove(engine_id)
    }

    pub fn get(&self, engine_id: &str) -> Option<Arc<dyn RenderingEngine>> {
        read_lock(&self.engines).get(engine_id).cloned()
    }

    pub fn engine_ids(&self) -> Vec<String> {
        read_lock(&self.engines).keys().cloned().collect()
    }
}

impl fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("engines", &self.engine_ids())
            .finish()
    }
}
