//! 视口事件绑定
//!
//! 渲染引擎事件到协调服务的接线：
//! - 相机变化：立即同步相机，并调度叠加层刷新
//! - 堆栈换帧：同步滚动位置，更新叠加层可见性并调度刷新
//! - 窗宽窗位变化：同步VOI
//!
//! 视口不在可渲染状态时事件一律忽略。

use crate::scheduler::{RefreshScheduler, RefreshTask};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use viewer_core::utils::lock;
use viewer_core::{EventHandler, RenderSurface, SubscriptionId, ViewportEvent, ViewportEventKind};
use viewer_overlay::AiOverlay;
use viewer_state::ViewportStateManager;
use viewer_sync::ViewportSyncService;

/// 事件处理所需的协调服务
#[derive(Clone)]
pub struct BindingServices {
    pub state: Arc<ViewportStateManager>,
    pub sync: Arc<ViewportSyncService>,
    pub overlay: Option<Arc<AiOverlay>>,
}

/// 单个视口的事件绑定，释放时自动解绑
pub struct ViewportBinding {
    viewport_id: String,
    surface: Arc<dyn RenderSurface>,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    scheduler: Arc<RefreshScheduler>,
}

impl ViewportBinding {
    /// 在渲染表面上注册三类事件处理器
    pub fn bind(
        viewport_id: &str,
        surface: Arc<dyn RenderSurface>,
        services: BindingServices,
        scheduler: RefreshScheduler,
    ) -> Self {
        let scheduler = Arc::new(scheduler);
        let handlers = [
            (
                ViewportEventKind::CameraModified,
                camera_handler(viewport_id, &services, &scheduler),
            ),
            (
                ViewportEventKind::StackNewImage,
                stack_handler(viewport_id, &services, &scheduler),
            ),
            (
                ViewportEventKind::VoiModified,
                voi_handler(viewport_id, &services),
            ),
        ];

        let subscriptions = handlers
            .into_iter()
            .map(|(kind, handler)| surface.subscribe(kind, handler))
            .collect();

        info!("Viewport {} bound to rendering events", viewport_id);
        Self {
            viewport_id: viewport_id.to_string(),
            surface,
            subscriptions: Mutex::new(subscriptions),
            scheduler,
        }
    }

    pub fn viewport_id(&self) -> &str {
        &self.viewport_id
    }

    pub fn scheduler(&self) -> &RefreshScheduler {
        &self.scheduler
    }

    pub fn is_bound(&self) -> bool {
        !lock(&self.subscriptions).is_empty()
    }

    /// 注销全部事件处理器并取消待执行的刷新
    pub fn unbind(&self) {
        let subscriptions: Vec<SubscriptionId> = lock(&self.subscriptions).drain(..).collect();
        if subscriptions.is_empty() {
            return;
        }

        for id in subscriptions {
            self.surface.unsubscribe(id);
        }
        self.scheduler.cancel();
        info!("Viewport {} unbound from rendering events", self.viewport_id);
    }
}

impl Drop for ViewportBinding {
    fn drop(&mut self) {
        self.unbind();
    }
}

impl fmt::Debug for ViewportBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewportBinding")
            .field("viewport_id", &self.viewport_id)
            .field("subscriptions", &lock(&self.subscriptions).len())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

fn refresh_task(overlay: &Arc<AiOverlay>) -> RefreshTask {
    let overlay = overlay.clone();
    Arc::new(move || {
        overlay.refresh();
    })
}

fn camera_handler(
    viewport_id: &str,
    services: &BindingServices,
    scheduler: &Arc<RefreshScheduler>,
) -> EventHandler {
    let viewport_id = viewport_id.to_string();
    let services = services.clone();
    let scheduler = scheduler.clone();

    Arc::new(move |_: &ViewportEvent| {
        if !services.state.can_render(&viewport_id) {
            debug!("Ignoring camera event for non-renderable viewport {}", viewport_id);
            return;
        }

        if let Some(viewport) = services.sync.engine().get_viewport(&viewport_id) {
            services.sync.sync_camera(viewport.as_ref(), &viewport_id);
        }

        if let Some(overlay) = &services.overlay {
            scheduler.schedule(refresh_task(overlay));
        }
    })
}

fn stack_handler(
    viewport_id: &str,
    services: &BindingServices,
    scheduler: &Arc<RefreshScheduler>,
) -> EventHandler {
    let viewport_id = viewport_id.to_string();
    let services = services.clone();
    let scheduler = scheduler.clone();

    Arc::new(move |event: &ViewportEvent| {
        let ViewportEvent::StackNewImage {
            image_id,
            image_index,
            ..
        } = event
        else {
            return;
        };

        if !services.state.can_render(&viewport_id) {
            debug!("Ignoring stack event for non-renderable viewport {}", viewport_id);
            return;
        }

        if let Some(viewport) = services.sync.engine().get_viewport(&viewport_id) {
            services
                .sync
                .sync_scroll(viewport.as_ref(), &viewport_id, *image_index);
        }

        if let Some(overlay) = &services.overlay {
            if overlay.on_image_changed(image_id) {
                scheduler.schedule(refresh_task(overlay));
            } else {
                scheduler.cancel();
            }
        }
    })
}

fn voi_handler(viewport_id: &str, services: &BindingServices) -> EventHandler {
    let viewport_id = viewport_id.to_string();
    let services = services.clone();

    Arc::new(move |_: &ViewportEvent| {
        if !services.state.can_render(&viewport_id) {
            debug!("Ignoring VOI event for non-renderable viewport {}", viewport_id);
            return;
        }

        if let Some(viewport) = services.sync.engine().get_viewport(&viewport_id) {
            services.sync.sync_window_level(viewport.as_ref(), &viewport_id);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use viewer_core::memory::{MemoryEngine, MemoryViewport};
    use viewer_core::{CanvasSize, EngineRegistry, Prediction, ViewportHandle, ViewportStatus};
    use viewer_overlay::{OverlayProps, RecordingSink};
    use viewer_state::StatePatch;

    struct Fixture {
        state: Arc<ViewportStateManager>,
        sync: Arc<ViewportSyncService>,
        viewports: Vec<Arc<MemoryViewport>>,
        registry: Arc<EngineRegistry>,
    }

    fn fixture(ids: &[&str]) -> Fixture {
        let engine = Arc::new(MemoryEngine::new("engine"));
        let state = Arc::new(ViewportStateManager::new());
        let viewports: Vec<Arc<MemoryViewport>> = ids
            .iter()
            .map(|id| {
                let viewport = engine.add_viewport(id, CanvasSize::new(512.0, 512.0));
                viewport.set_stack(vec!["img-0".into(), "img-1".into()], 512, 512);
                state.initialize(id);
                state.start_loading(id);
                state.transition(id, ViewportStatus::Ready, StatePatch::default());
                viewport
            })
            .collect();

        let registry = Arc::new(EngineRegistry::new());
        registry.register(engine.clone());
        let sync = Arc::new(ViewportSyncService::new(engine));
        sync.create_sync_group("group", ids.iter().copied(), &[]);

        Fixture {
            state,
            sync,
            viewports,
            registry,
        }
    }

    fn bind(fixture: &Fixture, index: usize, overlay: Option<Arc<AiOverlay>>) -> ViewportBinding {
        let viewport = &fixture.viewports[index];
        ViewportBinding::bind(
            viewport.id(),
            viewport.surface(),
            BindingServices {
                state: fixture.state.clone(),
                sync: fixture.sync.clone(),
                overlay,
            },
            RefreshScheduler::new(Duration::from_millis(16), Duration::from_millis(16)),
        )
    }

    #[tokio::test]
    async fn test_camera_event_syncs_group() {
        let fixture = fixture(&["a", "b"]);
        let _a = bind(&fixture, 0, None);
        let _b = bind(&fixture, 1, None);

        fixture.viewports[0].zoom(2.0);
        assert_eq!(fixture.viewports[1].camera().parallel_scale, 0.5);
        assert_eq!(fixture.viewports[1].set_camera_calls(), 1);
    }

    #[tokio::test]
    async fn test_non_renderable_viewport_ignores_events() {
        let fixture = fixture(&["a", "b"]);
        let _a = bind(&fixture, 0, None);

        fixture.state.transition("a", ViewportStatus::Loading, StatePatch::default());
        assert!(fixture.state.can_render("a"));
        fixture.state.dispose("a");

        fixture.viewports[0].pan(5.0, 0.0);
        assert_eq!(fixture.viewports[1].set_camera_calls(), 0);
    }

    #[tokio::test]
    async fn test_voi_event_syncs_window_level() {
        let fixture = fixture(&["a", "b"]);
        let _a = bind(&fixture, 0, None);

        let mut properties = fixture.viewports[0].properties();
        properties.voi_range = Some(viewer_core::VoiRange::from_window(400.0, 40.0));
        fixture.viewports[0].set_properties(properties);

        assert_eq!(
            fixture.viewports[1].properties().voi_range,
            Some(viewer_core::VoiRange::from_window(400.0, 40.0))
        );
    }

    #[tokio::test]
    async fn test_unbind_detaches_handlers() {
        let fixture = fixture(&["a", "b"]);
        let binding = bind(&fixture, 0, None);
        assert_eq!(fixture.viewports[0].surface().listener_count(), 3);

        binding.unbind();
        assert!(!binding.is_bound());
        assert_eq!(fixture.viewports[0].surface().listener_count(), 0);

        fixture.viewports[0].pan(1.0, 1.0);
        assert_eq!(fixture.viewports[1].set_camera_calls(), 0);

        drop(binding);
        assert_eq!(fixture.viewports[0].surface().listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stack_event_refreshes_overlay_on_target_frame() {
        let fixture = fixture(&["a"]);
        let sink = Arc::new(RecordingSink::new());
        let overlay = Arc::new(AiOverlay::new(
            OverlayProps {
                viewport_id: "a".to_string(),
                rendering_engine_id: "engine".to_string(),
                predictions: vec![Prediction {
                    detection_id: None,
                    class: "nodule".to_string(),
                    confidence: 0.8,
                    points: vec![[10.0, 10.0]],
                }],
                ai_image_width: 512.0,
                ai_image_height: 512.0,
                target_image_id: Some("img-1".to_string()),
            },
            fixture.registry.clone(),
            sink.clone(),
        ));
        overlay.mount();
        let binding = bind(&fixture, 0, Some(overlay.clone()));

        fixture.viewports[0].set_image_id_index(1);
        assert!(overlay.is_visible());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.draw_count(), 1);
        assert_eq!(binding.scheduler().run_count(), 1);

        fixture.viewports[0].set_image_id_index(0);
        assert!(!overlay.is_visible());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.draw_count(), 1);
        assert!(sink.items("a").is_empty());
    }
}
