//! 查看器上下文
//!
//! 组合根：持有状态管理器、各渲染引擎的同步服务、引擎注册表与指标，
//! 负责视口的挂载与卸载。

use crate::binding::{BindingServices, ViewportBinding};
use crate::scheduler::RefreshScheduler;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};
use viewer_admin::config::StateConfig;
use viewer_admin::{ConfigValidator, ViewerConfig, ViewerMetrics};
use viewer_core::utils::{lock, read_lock, write_lock};
use viewer_core::{EngineRegistry, MetricsSink, RenderSurface, RenderingEngine, Result, ViewerError};
use viewer_overlay::{AiOverlay, OverlayProps, OverlaySink};
use viewer_state::{ViewportStateConfig, ViewportStateManager};
use viewer_sync::ViewportSyncService;

struct MountedViewport {
    engine_id: String,
    binding: ViewportBinding,
    overlay: Option<Arc<AiOverlay>>,
}

/// 查看器上下文
pub struct ViewerContext {
    config: ViewerConfig,
    metrics: Arc<ViewerMetrics>,
    state: Arc<ViewportStateManager>,
    engines: Arc<EngineRegistry>,
    sync_services: RwLock<HashMap<String, Arc<ViewportSyncService>>>,
    mounted: Mutex<HashMap<String, MountedViewport>>,
}

impl ViewerContext {
    pub fn new(config: ViewerConfig) -> Result<Self> {
        ConfigValidator::new()
            .validate(&config)
            .map_err(|e| ViewerError::Config(e.to_string()))?;

        let metrics =
            Arc::new(ViewerMetrics::new().map_err(|e| ViewerError::Metrics(e.to_string()))?);
        let state = ViewportStateManager::with_config(state_config(&config.state))
            .with_metrics(metrics.clone() as Arc<dyn MetricsSink>);

        Ok(Self {
            config,
            metrics,
            state: Arc::new(state),
            engines: Arc::new(EngineRegistry::new()),
            sync_services: RwLock::new(HashMap::new()),
            mounted: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<ViewportStateManager> {
        &self.state
    }

    pub fn engines(&self) -> &Arc<EngineRegistry> {
        &self.engines
    }

    pub fn metrics(&self) -> &Arc<ViewerMetrics> {
        &self.metrics
    }

    /// 注册渲染引擎并为其创建同步服务
    pub fn register_engine(&self, engine: Arc<dyn RenderingEngine>) -> Arc<ViewportSyncService> {
        let engine_id = engine.id().to_string();
        self.engines.register(engine.clone());

        let sync = Arc::new(
            ViewportSyncService::new(engine).with_metrics(self.metrics.clone() as Arc<dyn MetricsSink>),
        );
        if write_lock(&self.sync_services)
            .insert(engine_id.clone(), sync.clone())
            .is_some()
        {
            warn!("Rendering engine {} re-registered, sync groups reset", engine_id);
        }

        info!("Rendering engine {} registered", engine_id);
        sync
    }

    pub fn sync_service(&self, engine_id: &str) -> Option<Arc<ViewportSyncService>> {
        read_lock(&self.sync_services).get(engine_id).cloned()
    }

    /// 以配置中的默认模式创建同步组
    pub fn create_sync_group(&self, engine_id: &str, group_id: &str, viewport_ids: &[&str]) -> Result<()> {
        let sync = self.require_sync(engine_id)?;
        sync.create_sync_group(
            group_id,
            viewport_ids.iter().copied(),
            &self.config.sync.default_modes,
        );
        Ok(())
    }

    /// 按配置创建AI叠加层
    pub fn create_overlay(&self, props: OverlayProps, sink: Arc<dyn OverlaySink>) -> Arc<AiOverlay> {
        Arc::new(
            AiOverlay::new(props, self.engines.clone(), sink)
                .with_min_confidence(self.config.overlay.min_confidence)
                .with_metrics(self.metrics.clone() as Arc<dyn MetricsSink>),
        )
    }

    /// 挂载视口：初始化状态记录并绑定渲染事件
    pub fn mount_viewport(
        &self,
        engine_id: &str,
        viewport_id: &str,
        surface: Arc<dyn RenderSurface>,
        overlay: Option<Arc<AiOverlay>>,
    ) -> Result<()> {
        let sync = self.require_sync(engine_id)?;

        let mut mounted = lock(&self.mounted);
        if mounted.contains_key(viewport_id) {
            return Err(ViewerError::Config(format!(
                "Viewport {} is already mounted",
                viewport_id
            )));
        }

        if !self.state.initialize(viewport_id) {
            return Err(ViewerError::Config(format!(
                "Viewport {} still has a live state record",
                viewport_id
            )));
        }

        if let Some(overlay) = &overlay {
            overlay.mount();
        }

        let binding = ViewportBinding::bind(
            viewport_id,
            surface,
            BindingServices {
                state: self.state.clone(),
                sync,
                overlay: overlay.clone(),
            },
            RefreshScheduler::new(
                self.config.scheduler.debounce(),
                self.config.scheduler.frame_interval(),
            ),
        );

        mounted.insert(
            viewport_id.to_string(),
            MountedViewport {
                engine_id: engine_id.to_string(),
                binding,
                overlay,
            },
        );
        info!("Viewport {} mounted on engine {}", viewport_id, engine_id);
        Ok(())
    }

    /// 卸载视口：解绑事件、退出同步组并销毁状态记录
    pub fn unmount_viewport(&self, viewport_id: &str) -> bool {
        let Some(viewport) = lock(&self.mounted).remove(viewport_id) else {
            warn!("Unmount requested for unknown viewport {}", viewport_id);
            return false;
        };

        viewport.binding.unbind();
        if let Some(overlay) = &viewport.overlay {
            overlay.unmount();
        }
        if let Some(sync) = self.sync_service(&viewport.engine_id) {
            sync.remove_viewport(viewport_id);
        }
        self.state.dispose(viewport_id);

        info!("Viewport {} unmounted", viewport_id);
        true
    }

    pub fn is_mounted(&self, viewport_id: &str) -> bool {
        lock(&self.mounted).contains_key(viewport_id)
    }

    /// 已挂载的视口ID，按ID排序
    pub fn mounted_viewports(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.mounted).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn overlay(&self, viewport_id: &str) -> Option<Arc<AiOverlay>> {
        lock(&self.mounted)
            .get(viewport_id)
            .and_then(|viewport| viewport.overlay.clone())
    }

    /// 卸载全部视口
    pub fn shutdown(&self) {
        for viewport_id in self.mounted_viewports() {
            self.unmount_viewport(&viewport_id);
        }
    }

    /// 导出Prometheus文本格式的指标
    pub fn metrics_text(&self) -> Result<String> {
        self.metrics
            .render_text()
            .map_err(|e| ViewerError::Metrics(e.to_string()))
    }

    fn require_sync(&self, engine_id: &str) -> Result<Arc<ViewportSyncService>> {
        self.sync_service(engine_id)
            .ok_or_else(|| ViewerError::NotFound(format!("rendering engine {}", engine_id)))
    }
}

impl fmt::Debug for ViewerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewerContext")
            .field("engines", &self.engines)
            .field("mounted", &self.mounted_viewports())
            .finish()
    }
}

fn state_config(config: &StateConfig) -> ViewportStateConfig {
    ViewportStateConfig {
        grace_period: config.grace_period(),
        non_renderable: config.non_renderable.iter().copied().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use viewer_core::memory::MemoryEngine;
    use viewer_core::{CanvasSize, ViewportStatus};

    fn context() -> (ViewerContext, Arc<MemoryEngine>) {
        let context = ViewerContext::new(ViewerConfig::default()).unwrap();
        let engine = Arc::new(MemoryEngine::new("engine"));
        context.register_engine(engine.clone());
        (context, engine)
    }

    #[tokio::test]
    async fn test_mount_and_unmount() {
        let (context, engine) = context();
        let viewport = engine.add_viewport("vp-1", CanvasSize::new(512.0, 512.0));

        context
            .mount_viewport("engine", "vp-1", viewport.surface(), None)
            .unwrap();
        assert!(context.is_mounted("vp-1"));
        assert_eq!(viewport.surface().listener_count(), 3);
        assert_eq!(
            context.state().get_state("vp-1").unwrap().status,
            ViewportStatus::Initializing
        );

        context.create_sync_group("engine", "group", &["vp-1"]).unwrap();
        assert!(context.unmount_viewport("vp-1"));
        assert!(!context.is_mounted("vp-1"));
        assert_eq!(viewport.surface().listener_count(), 0);
        assert_eq!(
            context.state().get_state("vp-1").unwrap().status,
            ViewportStatus::Disposed
        );
        let sync = context.sync_service("engine").unwrap();
        assert!(sync.get_sync_group_for_viewport("vp-1").is_none());

        assert!(!context.unmount_viewport("vp-1"));
    }

    #[tokio::test]
    async fn test_mount_errors() {
        let (context, engine) = context();
        let viewport = engine.add_viewport("vp-1", CanvasSize::new(512.0, 512.0));

        let missing = context.mount_viewport("other", "vp-1", viewport.surface(), None);
        assert!(matches!(missing, Err(ViewerError::NotFound(_))));

        context
            .mount_viewport("engine", "vp-1", viewport.surface(), None)
            .unwrap();
        let twice = context.mount_viewport("engine", "vp-1", viewport.surface(), None);
        assert!(matches!(twice, Err(ViewerError::Config(_))));

        // 宽限期内的 Disposed 记录阻止重新挂载
        context.unmount_viewport("vp-1");
        let remount = context.mount_viewport("engine", "vp-1", viewport.surface(), None);
        assert!(remount.is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = ViewerConfig::default();
        config.overlay.min_confidence = 1.5;
        assert!(matches!(ViewerContext::new(config), Err(ViewerError::Config(_))));
    }

    #[test]
    fn test_state_config_from_settings() {
        let mut settings = StateConfig::default();
        settings.grace_period_ms = 250;
        settings.non_renderable = vec![ViewportStatus::Error];

        let config = state_config(&settings);
        assert_eq!(config.grace_period.as_millis(), 250);
        assert!(config.non_renderable.contains(&ViewportStatus::Error));
        assert_eq!(config.non_renderable.len(), 1);
    }

    #[test]
    fn test_metrics_text_reflects_transitions() {
        let (context, _engine) = context();
        context.state().initialize("vp-1");
        context.state().start_loading("vp-1");

        let text = context.metrics_text().unwrap();
        assert!(text.contains("viewport_transitions_total{status=\"LOADING\"} 1"));
    }
}
