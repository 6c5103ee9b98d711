//! 指标上报接口
//!
//! 底层crate只通过该trait上报计数，具体的Prometheus实现位于 `viewer-admin`。

use crate::models::ViewportStatus;

/// 指标接收器
pub trait MetricsSink: Send + Sync {
    fn transition_applied(&self, _to: ViewportStatus) {}

    fn transition_rejected(&self) {}

    /// `kind` 为 camera / scroll / window_level
    fn sync_propagated(&self, _kind: &str, _targets: usize) {}

    fn sync_skipped(&self, _kind: &str, _reason: &str) {}

    fn overlay_refreshed(&self, _items: usize) {}
}

/// 不上报任何指标
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}
