//! # AI叠加层模块
//!
//! 将AI推理结果（AI影像像素空间）换算到视口画布像素空间并绘制标注：
//! - 坐标变换：AI空间 → 归一化空间 → DICOM像素空间 → 画布空间
//! - 叠加层组件：按当前帧过滤、在相机/帧变化时重新计算

pub mod overlay;
pub mod transform;

pub use overlay::{AiOverlay, OverlayProps, OverlaySink, RecordingSink};
pub use transform::{anchor_point, compute_overlay_items, OverlayTransform, Point};
