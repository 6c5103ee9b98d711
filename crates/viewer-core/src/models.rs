//! 核心数据模型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 视口生命周期状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViewportStatus {
    Initializing, // 初始化中
    Loading,      // 加载中
    Ready,        // 就绪
    Error,        // 出错
    Disposing,    // 销毁中
    Disposed,     // 已销毁
}

impl ViewportStatus {
    /// 全部状态
    pub const ALL: [ViewportStatus; 6] = [
        ViewportStatus::Initializing,
        ViewportStatus::Loading,
        ViewportStatus::Ready,
        ViewportStatus::Error,
        ViewportStatus::Disposing,
        ViewportStatus::Disposed,
    ];
}

impl fmt::Display for ViewportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ViewportStatus::Initializing => "INITIALIZING",
            ViewportStatus::Loading => "LOADING",
            ViewportStatus::Ready => "READY",
            ViewportStatus::Error => "ERROR",
            ViewportStatus::Disposing => "DISPOSING",
            ViewportStatus::Disposed => "DISPOSED",
        };
        f.write_str(name)
    }
}

/// 已加载影像的元数据
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageData {
    pub image_id: Option<String>,
    /// 像素尺寸 [宽, 高, 深]
    pub dimensions: [u32; 3],
    /// 像素间距 (mm)
    pub spacing: Option<[f64; 3]>,
}

impl ImageData {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image_id: None,
            dimensions: [width, height, 1],
            spacing: None,
        }
    }

    pub fn with_image_id(mut self, image_id: impl Into<String>) -> Self {
        self.image_id = Some(image_id.into());
        self
    }

    pub fn width(&self) -> u32 {
        self.dimensions[0]
    }

    pub fn height(&self) -> u32 {
        self.dimensions[1]
    }
}

/// 视口状态记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViewportStateData {
    pub viewport_id: String,
    pub status: ViewportStatus,
    pub image_data: Option<ImageData>,
    pub error: Option<String>,
    pub last_transition: DateTime<Utc>,
}

impl ViewportStateData {
    /// 创建处于初始化状态的记录
    pub fn initializing(viewport_id: impl Into<String>) -> Self {
        Self {
            viewport_id: viewport_id.into(),
            status: ViewportStatus::Initializing,
            image_data: None,
            error: None,
            last_transition: Utc::now(),
        }
    }
}

/// 相机状态（平移/缩放/朝向）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Camera {
    pub parallel_scale: f64,
    pub focal_point: [f64; 3],
    pub position: [f64; 3],
    pub view_up: [f64; 3],
    pub view_plane_normal: [f64; 3],
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            parallel_scale: 1.0,
            focal_point: [0.0, 0.0, 0.0],
            position: [0.0, 0.0, 1.0],
            view_up: [0.0, -1.0, 0.0],
            view_plane_normal: [0.0, 0.0, 1.0],
        }
    }
}

/// 窗宽窗位 (VOI) 范围
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct VoiRange {
    pub lower: f64,
    pub upper: f64,
}

impl VoiRange {
    /// 由窗宽/窗位构造
    pub fn from_window(width: f64, center: f64) -> Self {
        Self {
            lower: center - width / 2.0,
            upper: center + width / 2.0,
        }
    }
}

/// 视口显示属性
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ViewportProperties {
    pub voi_range: Option<VoiRange>,
    pub invert: bool,
}

/// 画布像素尺寸
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CanvasSize {
    pub width: f64,
    pub height: f64,
}

impl CanvasSize {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

/// 同步模式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum SyncMode {
    Pan,
    Zoom,
    Scroll,
    WindowLevel,
    All,
    None,
}

/// AI推理结果（多边形顶点位于AI影像像素空间）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Prediction {
    #[serde(default)]
    pub detection_id: Option<String>,
    pub class: String,
    pub confidence: f64,
    pub points: Vec<[f64; 2]>,
}

/// 叠加层标注项，位于画布像素空间，每帧重新计算
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OverlayItem {
    pub id: String,
    pub canvas_x: f64,
    pub canvas_y: f64,
    pub label: String,
    pub confidence_percent: u32,
}
