//! 坐标变换
//!
//! 每个预测的锚点取多边形x坐标的平均值与y坐标的最小值（即形状水平中心的上边缘），
//! 依次经过：
//! 1. 除以AI影像宽高得到归一化坐标，与AI服务使用的分辨率无关；
//! 2. 乘以DICOM帧的真实像素尺寸得到影像像素坐标；
//! 3. 乘以 `画布尺寸 / 影像尺寸` 得到画布像素坐标，缩放后引擎会重设画布，
//!    因此当前缩放级别已隐含在该比例中。

use serde::{Deserialize, Serialize};
use viewer_core::{CanvasSize, OverlayItem, Prediction};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// 多边形锚点：水平中心、上边缘。空多边形返回 `None`
pub fn anchor_point(points: &[[f64; 2]]) -> Option<Point> {
    if points.is_empty() {
        return None;
    }
    let sum_x: f64 = points.iter().map(|p| p[0]).sum();
    let min_y = points.iter().map(|p| p[1]).fold(f64::INFINITY, f64::min);
    Some(Point::new(sum_x / points.len() as f64, min_y))
}

/// 一帧的变换参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlayTransform {
    pub ai_width: f64,
    pub ai_height: f64,
    pub image_width: f64,
    pub image_height: f64,
    pub canvas: CanvasSize,
}

impl OverlayTransform {
    /// 任一尺寸非正时返回 `None`
    pub fn new(ai_width: f64, ai_height: f64, image_width: f64, image_height: f64, canvas: CanvasSize) -> Option<Self> {
        let dims = [ai_width, ai_height, image_width, image_height, canvas.width, canvas.height];
        if dims.iter().any(|d| !d.is_finite() || *d <= 0.0) {
            return None;
        }
        Some(Self {
            ai_width,
            ai_height,
            image_width,
            image_height,
            canvas,
        })
    }

    pub fn normalize(&self, ai: Point) -> Point {
        Point::new(ai.x / self.ai_width, ai.y / self.ai_height)
    }

    pub fn to_image(&self, normalized: Point) -> Point {
        Point::new(normalized.x * self.image_width, normalized.y * self.image_height)
    }

    pub fn to_canvas(&self, image: Point) -> Point {
        Point::new(
            image.x * (self.canvas.width / self.image_width),
            image.y * (self.canvas.height / self.image_height),
        )
    }

    /// AI空间坐标直接换算到画布坐标
    pub fn project(&self, ai: Point) -> Point {
        self.to_canvas(self.to_image(self.normalize(ai)))
    }
}

/// 计算所有预测的叠加层标注项
///
/// 置信度低于 `min_confidence` 或多边形为空的预测被跳过。
pub fn compute_overlay_items(
    predictions: &[Prediction],
    transform: &OverlayTransform,
    min_confidence: f64,
) -> Vec<OverlayItem> {
    predictions
        .iter()
        .enumerate()
        .filter(|(_, prediction)| prediction.confidence >= min_confidence)
        .filter_map(|(index, prediction)| {
            let anchor = anchor_point(&prediction.points)?;
            let canvas = transform.project(anchor);
            Some(OverlayItem {
                id: prediction
                    .detection_id
                    .clone()
                    .unwrap_or_else(|| format!("prediction-{}", index)),
                canvas_x: canvas.x,
                canvas_y: canvas.y,
                label: prediction.class.clone(),
                confidence_percent: (prediction.confidence * 100.0).round().max(0.0) as u32,
            })
        })
        .collect()
}
