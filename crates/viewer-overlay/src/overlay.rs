//! AI叠加层组件
//!
//! 在渲染引擎的相机/帧事件驱动下运行，任何查找失败（引擎、视口、影像
//! 元数据缺失或没有预测）都只记录日志并放弃本次计算。

use crate::transform::{compute_overlay_items, OverlayTransform};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};
use viewer_core::utils::{lock, read_lock, write_lock};
use viewer_core::{EngineRegistry, MetricsSink, NoopMetrics, OverlayItem, Prediction};

/// 叠加层组件属性
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverlayProps {
    pub viewport_id: String,
    pub rendering_engine_id: String,
    pub predictions: Vec<Prediction>,
    pub ai_image_width: f64,
    pub ai_image_height: f64,
    /// 预测所标注的影像ID；为 `None` 时在任意帧上显示
    pub target_image_id: Option<String>,
}

/// 标注绘制目标
pub trait OverlaySink: Send + Sync {
    fn draw(&self, viewport_id: &str, items: &[OverlayItem]);

    fn clear(&self, viewport_id: &str);
}

/// 记录每个视口最近一次绘制内容的绘制目标
#[derive(Debug, Default)]
pub struct RecordingSink {
    frames: Mutex<HashMap<String, Vec<OverlayItem>>>,
    draws: AtomicUsize,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self, viewport_id: &str) -> Vec<OverlayItem> {
        lock(&self.frames).get(viewport_id).cloned().unwrap_or_default()
    }

    pub fn draw_count(&self) -> usize {
        self.draws.load(Ordering::SeqCst)
    }
}

impl OverlaySink for RecordingSink {
    fn draw(&self, viewport_id: &str, items: &[OverlayItem]) {
        self.draws.fetch_add(1, Ordering::SeqCst);
        lock(&self.frames).insert(viewport_id.to_string(), items.to_vec());
    }

    fn clear(&self, viewport_id: &str) {
        lock(&self.frames).remove(viewport_id);
    }
}

/// AI叠加层
pub struct AiOverlay {
    props: RwLock<OverlayProps>,
    engines: Arc<EngineRegistry>,
    sink: Arc<dyn OverlaySink>,
    visible: AtomicBool,
    min_confidence: f64,
    metrics: Arc<dyn MetricsSink>,
}

impl AiOverlay {
    pub fn new(props: OverlayProps, engines: Arc<EngineRegistry>, sink: Arc<dyn OverlaySink>) -> Self {
        Self {
            props: RwLock::new(props),
            engines,
            sink,
            visible: AtomicBool::new(false),
            min_confidence: 0.0,
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn viewport_id(&self) -> String {
        read_lock(&self.props).viewport_id.clone()
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }

    /// 按视口当前显示的影像确定初始可见性
    pub fn mount(&self) -> bool {
        let (engine_id, viewport_id, targeted) = {
            let props = read_lock(&self.props);
            (
                props.rendering_engine_id.clone(),
                props.viewport_id.clone(),
                props.target_image_id.is_some(),
            )
        };

        // 未指定目标影像时在任意帧上显示，与堆栈是否已加载无关
        if !targeted {
            self.visible.store(true, Ordering::SeqCst);
            return true;
        }

        let current = self
            .engines
            .get(&engine_id)
            .and_then(|engine| engine.get_viewport(&viewport_id))
            .and_then(|viewport| viewport.current_image_id());

        match current {
            Some(image_id) => self.on_image_changed(&image_id),
            None => {
                debug!("Overlay for {} mounted before an image was displayed", viewport_id);
                self.visible.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// 显示帧变化：只有目标影像正在显示时叠加层才可见
    pub fn on_image_changed(&self, image_id: &str) -> bool {
        let (visible, viewport_id) = {
            let props = read_lock(&self.props);
            let visible = props
                .target_image_id
                .as_deref()
                .map_or(true, |target| target == image_id);
            (visible, props.viewport_id.clone())
        };

        self.visible.store(visible, Ordering::SeqCst);
        if !visible {
            self.sink.clear(&viewport_id);
        }
        visible
    }

    /// 替换预测结果及目标影像，并按当前显示的帧重新确定可见性
    pub fn set_predictions(&self, predictions: Vec<Prediction>, target_image_id: Option<String>) {
        {
            let mut props = write_lock(&self.props);
            props.predictions = predictions;
            props.target_image_id = target_image_id;
        }
        self.mount();
    }

    /// 重新计算并绘制标注，返回绘制的标注数量
    pub fn refresh(&self) -> usize {
        if !self.is_visible() {
            return 0;
        }

        let props = read_lock(&self.props).clone();
        match self.compute_items(&props) {
            Some(items) => {
                self.sink.draw(&props.viewport_id, &items);
                self.metrics.overlay_refreshed(items.len());
                items.len()
            }
            None => {
                self.sink.clear(&props.viewport_id);
                0
            }
        }
    }

    pub fn unmount(&self) {
        self.visible.store(false, Ordering::SeqCst);
        self.sink.clear(&self.viewport_id());
    }

    fn compute_items(&self, props: &OverlayProps) -> Option<Vec<OverlayItem>> {
        if props.predictions.is_empty() {
            debug!("No predictions for viewport {}", props.viewport_id);
            return None;
        }

        let Some(engine) = self.engines.get(&props.rendering_engine_id) else {
            warn!("Rendering engine {} not found", props.rendering_engine_id);
            return None;
        };

        let Some(viewport) = engine.get_viewport(&props.viewport_id) else {
            warn!(
                "Viewport {} not found in engine {}",
                props.viewport_id, props.rendering_engine_id
            );
            return None;
        };

        let Some(image_data) = viewport.image_data() else {
            debug!("Viewport {} has no image metadata yet", props.viewport_id);
            return None;
        };

        let Some(transform) = OverlayTransform::new(
            props.ai_image_width,
            props.ai_image_height,
            image_data.width() as f64,
            image_data.height() as f64,
            viewport.canvas_size(),
        ) else {
            warn!(
                "Degenerate overlay geometry for viewport {}: ai {}x{}, image {:?}",
                props.viewport_id, props.ai_image_width, props.ai_image_height, image_data.dimensions
            );
            return None;
        };

        Some(compute_overlay_items(&props.predictions, &transform, self.min_confidence))
    }
}

impl fmt::Debug for AiOverlay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let props = read_lock(&self.props);
        f.debug_struct("AiOverlay")
            .field("viewport_id", &props.viewport_id)
            .field("predictions", &props.predictions.len())
            .field("visible", &self.is_visible())
            .finish()
    }
}
