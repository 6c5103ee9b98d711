//! 运行指标
//!
//! 以Prometheus格式统计状态转换、同步传播和叠加层刷新

use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use viewer_core::{MetricsSink, ViewportStatus};

/// 查看器指标收集器
#[derive(Debug, Clone)]
pub struct ViewerMetrics {
    /// Prometheus指标注册表
    registry: Registry,
    /// 生效的状态转换，按目标状态
    transitions_total: IntCounterVec,
    /// 被拒绝的状态转换
    transitions_rejected_total: IntCounter,
    /// 同步传播次数，按类型
    sync_propagations_total: IntCounterVec,
    /// 同步写入的目标视口数，按类型
    sync_targets_total: IntCounterVec,
    /// 跳过的同步调用，按类型和原因
    sync_skipped_total: IntCounterVec,
    /// 叠加层刷新次数
    overlay_refresh_total: IntCounter,
    /// 最近一次刷新绘制的标注数量
    overlay_items: IntGauge,
}

impl ViewerMetrics {
    /// 创建并注册全部指标
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let transitions_total = IntCounterVec::new(
            Opts::new("viewport_transitions_total", "Applied viewport state transitions"),
            &["status"],
        )?;

        let transitions_rejected_total = IntCounter::with_opts(Opts::new(
            "viewport_transitions_rejected_total",
            "Rejected viewport state transitions",
        ))?;

        let sync_propagations_total = IntCounterVec::new(
            Opts::new("viewport_sync_propagations_total", "Completed sync propagation passes"),
            &["kind"],
        )?;

        let sync_targets_total = IntCounterVec::new(
            Opts::new("viewport_sync_targets_total", "Viewports written by sync propagation"),
            &["kind"],
        )?;

        let sync_skipped_total = IntCounterVec::new(
            Opts::new("viewport_sync_skipped_total", "Sync calls skipped"),
            &["kind", "reason"],
        )?;

        let overlay_refresh_total = IntCounter::with_opts(Opts::new(
            "overlay_refresh_total",
            "AI overlay recomputations",
        ))?;

        let overlay_items = IntGauge::with_opts(Opts::new(
            "overlay_items",
            "Items drawn by the latest overlay refresh",
        ))?;

        // 注册所有指标
        registry.register(Box::new(transitions_total.clone()))?;
        registry.register(Box::new(transitions_rejected_total.clone()))?;
        registry.register(Box::new(sync_propagations_total.clone()))?;
        registry.register(Box::new(sync_targets_total.clone()))?;
        registry.register(Box::new(sync_skipped_total.clone()))?;
        registry.register(Box::new(overlay_refresh_total.clone()))?;
        registry.register(Box::new(overlay_items.clone()))?;

        Ok(Self {
            registry,
            transitions_total,
            transitions_rejected_total,
            sync_propagations_total,
            sync_targets_total,
            sync_skipped_total,
            overlay_refresh_total,
            overlay_items,
        })
    }

    /// 导出Prometheus文本格式
    pub fn render_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;

        Ok(String::from_utf8(buffer)?)
    }

    pub fn transitions(&self, status: ViewportStatus) -> u64 {
        self.transitions_total
            .with_label_values(&[status.to_string().as_str()])
            .get()
    }

    pub fn rejected_transitions(&self) -> u64 {
        self.transitions_rejected_total.get()
    }

    pub fn sync_propagations(&self, kind: &str) -> u64 {
        self.sync_propagations_total.with_label_values(&[kind]).get()
    }

    pub fn sync_skip_count(&self, kind: &str, reason: &str) -> u64 {
        self.sync_skipped_total.with_label_values(&[kind, reason]).get()
    }

    pub fn overlay_refreshes(&self) -> u64 {
        self.overlay_refresh_total.get()
    }
}

impl MetricsSink for ViewerMetrics {
    fn transition_applied(&self, to: ViewportStatus) {
        self.transitions_total
            .with_label_values(&[to.to_string().as_str()])
            .inc();
    }

    fn transition_rejected(&self) {
        self.transitions_rejected_total.inc();
    }

    fn sync_propagated(&self, kind: &str, targets: usize) {
        self.sync_propagations_total.with_label_values(&[kind]).inc();
        self.sync_targets_total
            .with_label_values(&[kind])
            .inc_by(targets as u64);
    }

    fn sync_skipped(&self, kind: &str, reason: &str) {
        self.sync_skipped_total.with_label_values(&[kind, reason]).inc();
    }

    fn overlay_refreshed(&self, items: usize) {
        self.overlay_refresh_total.inc();
        self.overlay_items.set(items as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_export() {
        let metrics = ViewerMetrics::new().unwrap();
        metrics.transition_applied(ViewportStatus::Ready);
        metrics.transition_applied(ViewportStatus::Ready);
        metrics.transition_rejected();
        metrics.sync_propagated("camera", 2);
        metrics.sync_skipped("scroll", "reentrant");
        metrics.overlay_refreshed(3);

        assert_eq!(metrics.transitions(ViewportStatus::Ready), 2);
        assert_eq!(metrics.rejected_transitions(), 1);
        assert_eq!(metrics.sync_propagations("camera"), 1);
        assert_eq!(metrics.sync_skip_count("scroll", "reentrant"), 1);
        assert_eq!(metrics.overlay_refreshes(), 1);

        let text = metrics.render_text().unwrap();
        assert!(text.contains("viewport_transitions_total{status=\"READY\"} 2"));
        assert!(text.contains("viewport_sync_targets_total{kind=\"camera\"} 2"));
        assert!(text.contains("overlay_items 3"));
    }
}
