//! 内存渲染引擎
//!
//! 不做任何实际绘制的渲染引擎实现。视口记录所有相机/属性/堆栈写入，
//! 并像真实引擎一样在写入过程中同步地在渲染表面上派发事件。
//! 用于测试和命令行模拟。

use crate::engine::{
    EventHandler, RenderSurface, RenderingEngine, SubscriptionId, ViewportEvent,
    ViewportEventKind, ViewportHandle,
};
use crate::models::{Camera, CanvasSize, ImageData, ViewportProperties};
use crate::utils::{lock, read_lock, write_lock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// 可手动派发事件的渲染表面
#[derive(Default)]
pub struct MemorySurface {
    handlers: Mutex<HashMap<SubscriptionId, (ViewportEventKind, EventHandler)>>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同步派发事件给所有匹配类型的订阅者
    pub fn emit(&self, event: &ViewportEvent) {
        let kind = event.kind();
        let handlers: Vec<EventHandler> = lock(&self.handlers)
            .values()
            .filter(|(k, _)| *k == kind)
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in handlers {
            handler(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.handlers).len()
    }
}

impl RenderSurface for MemorySurface {
    fn subscribe(&self, kind: ViewportEventKind, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId::new();
        lock(&self.handlers).insert(id, (kind, handler));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        lock(&self.handlers).remove(&id).is_some()
    }
}

#[derive(Debug)]
struct ViewportInner {
    camera: Camera,
    properties: ViewportProperties,
    image_ids: Vec<String>,
    current_index: usize,
    dimensions: Option<[u32; 3]>,
    canvas: CanvasSize,
}

/// 内存视口
pub struct MemoryViewport {
    id: String,
    surface: Arc<MemorySurface>,
    inner: Mutex<ViewportInner>,
    set_camera_calls: AtomicUsize,
    set_properties_calls: AtomicUsize,
    set_index_calls: AtomicUsize,
    render_calls: AtomicUsize,
}

impl MemoryViewport {
    pub fn new(id: impl Into<String>, canvas: CanvasSize) -> Self {
        Self {
            id: id.into(),
            surface: Arc::new(MemorySurface::new()),
            inner: Mutex::new(ViewportInner {
                camera: Camera::default(),
                properties: ViewportProperties::default(),
                image_ids: Vec::new(),
                current_index: 0,
                dimensions: None,
                canvas,
            }),
            set_camera_calls: AtomicUsize::new(0),
            set_properties_calls: AtomicUsize::new(0),
            set_index_calls: AtomicUsize::new(0),
            render_calls: AtomicUsize::new(0),
        }
    }

    pub fn surface(&self) -> Arc<MemorySurface> {
        self.surface.clone()
    }

    /// 装载堆栈，不派发事件（对应引擎的 setStack）
    pub fn set_stack(&self, image_ids: Vec<String>, width: u32, height: u32) {
        let mut inner = lock(&self.inner);
        inner.image_ids = image_ids;
        inner.current_index = 0;
        inner.dimensions = Some([width, height, 1]);
    }

    pub fn set_canvas_size(&self, canvas: CanvasSize) {
        lock(&self.inner).canvas = canvas;
    }

    /// 用户平移：移动焦点和相机位置
    pub fn pan(&self, dx: f64, dy: f64) {
        let mut camera = self.camera();
        camera.focal_point[0] += dx;
        camera.focal_point[1] += dy;
        camera.position[0] += dx;
        camera.position[1] += dy;
        self.set_camera(camera);
    }

    /// 用户缩放：`factor > 1` 放大
    pub fn zoom(&self, factor: f64) {
        if factor <= 0.0 {
            return;
        }
        let mut camera = self.camera();
        camera.parallel_scale /= factor;
        self.set_camera(camera);
    }

    pub fn set_camera_calls(&self) -> usize {
        self.set_camera_calls.load(Ordering::SeqCst)
    }

    pub fn set_properties_calls(&self) -> usize {
        self.set_properties_calls.load(Ordering::SeqCst)
    }

    pub fn set_index_calls(&self) -> usize {
        self.set_index_calls.load(Ordering::SeqCst)
    }

    pub fn render_calls(&self) -> usize {
        self.render_calls.load(Ordering::SeqCst)
    }
}

impl ViewportHandle for MemoryViewport {
    fn id(&self) -> &str {
        &self.id
    }

    fn camera(&self) -> Camera {
        lock(&self.inner).camera
    }

    fn set_camera(&self, camera: Camera) {
        lock(&self.inner).camera = camera;
        self.set_camera_calls.fetch_add(1, Ordering::SeqCst);
        self.surface.emit(&ViewportEvent::CameraModified {
            viewport_id: self.id.clone(),
        });
    }

    fn properties(&self) -> ViewportProperties {
        lock(&self.inner).properties.clone()
    }

    fn set_properties(&self, properties: ViewportProperties) {
        lock(&self.inner).properties = properties;
        self.set_properties_calls.fetch_add(1, Ordering::SeqCst);
        self.surface.emit(&ViewportEvent::VoiModified {
            viewport_id: self.id.clone(),
        });
    }

    fn image_ids(&self) -> Vec<String> {
        lock(&self.inner).image_ids.clone()
    }

    fn current_image_id_index(&self) -> usize {
        lock(&self.inner).current_index
    }

    fn set_image_id_index(&self, index: usize) {
        let image_id = {
            let mut inner = lock(&self.inner);
            if index >= inner.image_ids.len() {
                tracing::warn!(
                    "Viewport {} ignoring image index {} (stack length {})",
                    self.id, index, inner.image_ids.len()
                );
                return;
            }
            inner.current_index = index;
            inner.image_ids[index].clone()
        };
        self.set_index_calls.fetch_add(1, Ordering::SeqCst);
        self.surface.emit(&ViewportEvent::StackNewImage {
            viewport_id: self.id.clone(),
            image_id,
            image_index: index,
        });
    }

    fn image_data(&self) -> Option<ImageData> {
        let inner = lock(&self.inner);
        let dimensions = inner.dimensions?;
        Some(ImageData {
            image_id: inner.image_ids.get(inner.current_index).cloned(),
            dimensions,
            spacing: None,
        })
    }

    fn canvas_size(&self) -> CanvasSize {
        lock(&self.inner).canvas
    }

    fn render(&self) {
        self.render_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// 内存渲染引擎
pub struct MemoryEngine {
    id: String,
    viewports: RwLock<HashMap<String, Arc<MemoryViewport>>>,
}

impl MemoryEngine {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            viewports: RwLock::new(HashMap::new()),
        }
    }

    /// 创建视口，同ID的旧视口被替换
    pub fn add_viewport(&self, viewport_id: &str, canvas: CanvasSize) -> Arc<MemoryViewport> {
        let viewport = Arc::new(MemoryViewport::new(viewport_id, canvas));
        write_lock(&self.viewports).insert(viewport_id.to_string(), viewport.clone());
        viewport
    }

    pub fn remove_viewport(&self, viewport_id: &str) -> Option<Arc<MemoryViewport>> {
        write_lock(&self.viewports).remove(viewport_id)
    }

    pub fn viewport(&self, viewport_id: &str) -> Option<Arc<MemoryViewport>> {
        read_lock(&self.viewports).get(viewport_id).cloned()
    }
}

impl RenderingEngine for MemoryEngine {
    fn id(&self) -> &str {
        &self.id
    }

    fn get_viewport(&self, viewport_id: &str) -> Option<Arc<dyn ViewportHandle>> {
        self.viewport(viewport_id)
            .map(|viewport| viewport as Arc<dyn ViewportHandle>)
    }
}
