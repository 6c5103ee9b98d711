//! 视口同步服务
//!
//! 同步是尽力而为的显示行为：组不存在、组被禁用或视口未加入任何组时
//! 一律静默跳过，绝不返回错误打断渲染。

use crate::group::{normalize_modes, SkipReason, SyncGroup, SyncOutcome};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};
use viewer_core::utils::{read_lock, write_lock};
use viewer_core::{
    Camera, MetricsSink, NoopMetrics, RenderingEngine, SyncMode, ViewportHandle,
};

#[derive(Debug, Default)]
struct SyncRegistry {
    groups: HashMap<String, SyncGroup>,
    /// 反向索引：视口ID -> 组ID
    viewport_to_group: HashMap<String, String>,
}

impl SyncRegistry {
    /// 将视口从其当前所属的其他组中移出
    fn detach(&mut self, viewport_id: &str, keep_group: &str) {
        if let Some(previous) = self.viewport_to_group.remove(viewport_id) {
            if previous != keep_group {
                if let Some(group) = self.groups.get_mut(&previous) {
                    group.viewport_ids.remove(viewport_id);
                    debug!("Viewport {} moved out of sync group {}", viewport_id, previous);
                }
            }
        }
    }

    fn attach(&mut self, group_id: &str, viewport_id: &str) -> bool {
        self.detach(viewport_id, group_id);
        let Some(group) = self.groups.get_mut(group_id) else {
            return false;
        };
        group.viewport_ids.insert(viewport_id.to_string());
        self.viewport_to_group
            .insert(viewport_id.to_string(), group_id.to_string());
        true
    }
}

/// 传播期间持有的重入标志，离开作用域时自动复位
struct UpdateGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> UpdateGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// 视口同步服务
pub struct ViewportSyncService {
    engine: Arc<dyn RenderingEngine>,
    registry: RwLock<SyncRegistry>,
    is_updating: AtomicBool,
    metrics: Arc<dyn MetricsSink>,
}

impl ViewportSyncService {
    pub fn new(engine: Arc<dyn RenderingEngine>) -> Self {
        Self {
            engine,
            registry: RwLock::new(SyncRegistry::default()),
            is_updating: AtomicBool::new(false),
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn engine(&self) -> &Arc<dyn RenderingEngine> {
        &self.engine
    }

    /// 创建同步组
    ///
    /// 同ID的旧组被替换；已属于其他组的视口会先从原组中移出。
    /// `modes` 为空时使用 `All`。
    pub fn create_sync_group<I, S>(&self, group_id: &str, viewport_ids: I, modes: &[SyncMode])
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut registry = write_lock(&self.registry);

        if let Some(old) = registry.groups.remove(group_id) {
            for viewport_id in &old.viewport_ids {
                registry.viewport_to_group.remove(viewport_id);
            }
            debug!("Replacing existing sync group {}", group_id);
        }

        registry
            .groups
            .insert(group_id.to_string(), SyncGroup::new(group_id, modes));

        for viewport_id in viewport_ids {
            let viewport_id = viewport_id.into();
            registry.attach(group_id, &viewport_id);
        }

        let group = &registry.groups[group_id];
        info!(
            "Created sync group {} with {} viewports, modes {:?}",
            group_id,
            group.viewport_ids.len(),
            group.sync_modes
        );
    }

    pub fn add_viewport_to_group(&self, group_id: &str, viewport_id: &str) -> bool {
        let mut registry = write_lock(&self.registry);
        if !registry.groups.contains_key(group_id) {
            warn!("Cannot add viewport {} to unknown sync group {}", viewport_id, group_id);
            return false;
        }
        registry.attach(group_id, viewport_id)
    }

    pub fn remove_viewport_from_group(&self, group_id: &str, viewport_id: &str) -> bool {
        let mut registry = write_lock(&self.registry);
        let removed = registry
            .groups
            .get_mut(group_id)
            .map(|group| group.viewport_ids.remove(viewport_id))
            .unwrap_or(false);

        if registry.viewport_to_group.get(viewport_id).map(String::as_str) == Some(group_id) {
            registry.viewport_to_group.remove(viewport_id);
        }
        removed
    }

    /// 将视口从其所属的组中移出，返回原组ID
    pub fn remove_viewport(&self, viewport_id: &str) -> Option<String> {
        let mut registry = write_lock(&self.registry);
        let group_id = registry.viewport_to_group.remove(viewport_id)?;
        if let Some(group) = registry.groups.get_mut(&group_id) {
            group.viewport_ids.remove(viewport_id);
        }
        Some(group_id)
    }

    pub fn set_sync_group_enabled(&self, group_id: &str, enabled: bool) -> bool {
        match write_lock(&self.registry).groups.get_mut(group_id) {
            Some(group) => {
                group.enabled = enabled;
                debug!("Sync group {} enabled = {}", group_id, enabled);
                true
            }
            None => false,
        }
    }

    pub fn set_sync_modes(&self, group_id: &str, modes: &[SyncMode]) -> bool {
        match write_lock(&self.registry).groups.get_mut(group_id) {
            Some(group) => {
                group.sync_modes = normalize_modes(modes);
                true
            }
            None => false,
        }
    }

    /// 同步相机
    ///
    /// pan 同步焦点与相机位置，zoom 同步 parallel scale；目标视口相机的
    /// 其他字段（如朝向）保持不变。
    pub fn sync_camera(&self, source: &dyn ViewportHandle, source_viewport_id: &str) -> SyncOutcome {
        let Some(_guard) = UpdateGuard::acquire(&self.is_updating) else {
            return self.skipped("camera", source_viewport_id, SkipReason::Reentrant);
        };

        let group = match self.active_group(source_viewport_id, |group| {
            group.includes(SyncMode::Pan) || group.includes(SyncMode::Zoom)
        }) {
            Ok(group) => group,
            Err(reason) => return self.skipped("camera", source_viewport_id, reason),
        };

        let pan = group.includes(SyncMode::Pan);
        let zoom = group.includes(SyncMode::Zoom);
        let source_camera = source.camera();

        let mut updated = 0;
        for target_id in group.targets(source_viewport_id) {
            let Some(target) = self.engine.get_viewport(&target_id) else {
                debug!("Sync target {} not found in engine {}", target_id, self.engine.id());
                continue;
            };

            let merged = merge_camera(target.camera(), &source_camera, pan, zoom);
            target.set_camera(merged);
            target.render();
            updated += 1;
        }

        self.propagated("camera", updated)
    }

    /// 同步堆栈滚动位置
    ///
    /// 目标索引按比例换算：`round(index / 源长度 * 目标长度)`，并截断到目标堆栈范围内，
    /// 因此组内堆栈长度可以不同。
    pub fn sync_scroll(
        &self,
        source: &dyn ViewportHandle,
        source_viewport_id: &str,
        image_index: usize,
    ) -> SyncOutcome {
        let Some(_guard) = UpdateGuard::acquire(&self.is_updating) else {
            return self.skipped("scroll", source_viewport_id, SkipReason::Reentrant);
        };

        let group = match self.active_group(source_viewport_id, |group| {
            group.includes(SyncMode::Scroll)
        }) {
            Ok(group) => group,
            Err(reason) => return self.skipped("scroll", source_viewport_id, reason),
        };

        let source_length = source.image_ids().len();
        if source_length == 0 {
            return self.skipped("scroll", source_viewport_id, SkipReason::EmptyStack);
        }

        let mut updated = 0;
        for target_id in group.targets(source_viewport_id) {
            let Some(target) = self.engine.get_viewport(&target_id) else {
                debug!("Sync target {} not found in engine {}", target_id, self.engine.id());
                continue;
            };

            let target_length = target.image_ids().len();
            let Some(index) = proportional_index(image_index, source_length, target_length) else {
                continue;
            };
            target.set_image_id_index(index);
            updated += 1;
        }

        self.propagated("scroll", updated)
    }

    /// 同步窗宽窗位
    pub fn sync_window_level(
        &self,
        source: &dyn ViewportHandle,
        source_viewport_id: &str,
    ) -> SyncOutcome {
        let Some(_guard) = UpdateGuard::acquire(&self.is_updating) else {
            return self.skipped("window_level", source_viewport_id, SkipReason::Reentrant);
        };

        let group = match self.active_group(source_viewport_id, |group| {
            group.includes(SyncMode::WindowLevel)
        }) {
            Ok(group) => group,
            Err(reason) => return self.skipped("window_level", source_viewport_id, reason),
        };

        let Some(voi_range) = source.properties().voi_range else {
            return self.skipped("window_level", source_viewport_id, SkipReason::NoVoiRange);
        };

        let mut updated = 0;
        for target_id in group.targets(source_viewport_id) {
            let Some(target) = self.engine.get_viewport(&target_id) else {
                debug!("Sync target {} not found in engine {}", target_id, self.engine.id());
                continue;
            };

            let mut properties = target.properties();
            properties.voi_range = Some(voi_range);
            target.set_properties(properties);
            target.render();
            updated += 1;
        }

        self.propagated("window_level", updated)
    }

    pub fn get_sync_group_for_viewport(&self, viewport_id: &str) -> Option<SyncGroup> {
        let registry = read_lock(&self.registry);
        let group_id = registry.viewport_to_group.get(viewport_id)?;
        registry.groups.get(group_id).cloned()
    }

    pub fn get_group(&self, group_id: &str) -> Option<SyncGroup> {
        read_lock(&self.registry).groups.get(group_id).cloned()
    }

    pub fn destroy_sync_group(&self, group_id: &str) -> bool {
        let mut registry = write_lock(&self.registry);
        let Some(group) = registry.groups.remove(group_id) else {
            return false;
        };
        for viewport_id in &group.viewport_ids {
            if registry.viewport_to_group.get(viewport_id) == Some(&group.id) {
                registry.viewport_to_group.remove(viewport_id);
            }
        }
        info!("Destroyed sync group {}", group_id);
        true
    }

    pub fn clear_all(&self) {
        let mut registry = write_lock(&self.registry);
        registry.groups.clear();
        registry.viewport_to_group.clear();
        info!("All sync groups cleared");
    }

    /// 所有同步组，按ID排序
    pub fn get_all_groups(&self) -> Vec<SyncGroup> {
        let mut groups: Vec<SyncGroup> = read_lock(&self.registry).groups.values().cloned().collect();
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        groups
    }

    /// 查找源视口所属且启用、并包含所需同步模式的组
    fn active_group<F>(&self, source_viewport_id: &str, wants: F) -> Result<SyncGroup, SkipReason>
    where
        F: Fn(&SyncGroup) -> bool,
    {
        let group = self
            .get_sync_group_for_viewport(source_viewport_id)
            .ok_or(SkipReason::NoGroup)?;
        if !group.enabled {
            return Err(SkipReason::GroupDisabled);
        }
        if !wants(&group) {
            return Err(SkipReason::ModeInactive);
        }
        Ok(group)
    }

    fn skipped(&self, kind: &str, source_viewport_id: &str, reason: SkipReason) -> SyncOutcome {
        debug!("Skipping {} sync from {}: {}", kind, source_viewport_id, reason);
        self.metrics.sync_skipped(kind, reason.as_str());
        SyncOutcome::Skipped(reason)
    }

    fn propagated(&self, kind: &str, updated: usize) -> SyncOutcome {
        self.metrics.sync_propagated(kind, updated);
        SyncOutcome::Propagated(updated)
    }
}

impl fmt::Debug for ViewportSyncService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewportSyncService")
            .field("engine", &self.engine.id())
            .field("registry", &*read_lock(&self.registry))
            .field("is_updating", &self.is_updating.load(Ordering::Acquire))
            .finish()
    }
}

/// 将源相机中参与同步的字段合并进目标相机
fn merge_camera(mut target: Camera, source: &Camera, pan: bool, zoom: bool) -> Camera {
    if pan {
        target.focal_point = source.focal_point;
        target.position = source.position;
    }
    if zoom {
        target.parallel_scale = source.parallel_scale;
    }
    target
}

/// 按比例换算目标堆栈索引，目标堆栈为空时返回 `None`
fn proportional_index(index: usize, source_length: usize, target_length: usize) -> Option<usize> {
    if source_length == 0 || target_length == 0 {
        return None;
    }
    let scaled = (index as f64 / source_length as f64 * target_length as f64).round();
    Some((scaled as usize).min(target_length - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use viewer_core::memory::{MemoryEngine, MemoryViewport};
    use viewer_core::{CanvasSize, VoiRange};

    fn engine_with(ids: &[&str]) -> (Arc<MemoryEngine>, Vec<Arc<MemoryViewport>>) {
        let engine = Arc::new(MemoryEngine::new("engine"));
        let viewports = ids
            .iter()
            .map(|id| engine.add_viewport(id, CanvasSize::new(512.0, 512.0)))
            .collect();
        (engine, viewports)
    }

    fn stack(len: usize) -> Vec<String> {
        (0..len).map(|i| format!("img-{}", i)).collect()
    }

    #[test]
    fn test_proportional_index() {
        assert_eq!(proportional_index(50, 100, 20), Some(10));
        assert_eq!(proportional_index(99, 100, 20), Some(19));
        assert_eq!(proportional_index(9, 10, 10), Some(9));
        assert_eq!(proportional_index(0, 10, 3), Some(0));
        assert_eq!(proportional_index(5, 10, 0), None);
    }

    #[test]
    fn test_merge_camera_keeps_unsynced_fields() {
        let target = Camera {
            view_up: [1.0, 0.0, 0.0],
            ..Camera::default()
        };
        let source = Camera {
            parallel_scale: 3.0,
            focal_point: [1.0, 2.0, 0.0],
            position: [1.0, 2.0, 5.0],
            ..Camera::default()
        };

        let zoom_only = merge_camera(target, &source, false, true);
        assert_eq!(zoom_only.parallel_scale, 3.0);
        assert_eq!(zoom_only.focal_point, [0.0, 0.0, 0.0]);

        let pan_only = merge_camera(target, &source, true, false);
        assert_eq!(pan_only.parallel_scale, 1.0);
        assert_eq!(pan_only.focal_point, [1.0, 2.0, 0.0]);
        assert_eq!(pan_only.view_up, [1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_sync_camera_updates_other_members() {
        let (engine, vps) = engine_with(&["a", "b", "c"]);
        let service = ViewportSyncService::new(engine.clone());
        service.create_sync_group("g", ["a", "b", "c"], &[]);

        vps[0].zoom(2.0);
        let outcome = service.sync_camera(vps[0].as_ref(), "a");

        assert_eq!(outcome, SyncOutcome::Propagated(2));
        assert_eq!(vps[1].camera().parallel_scale, 0.5);
        assert_eq!(vps[2].camera().parallel_scale, 0.5);
        assert_eq!(vps[1].render_calls(), 1);
        assert_eq!(vps[0].set_camera_calls(), 1);
    }

    #[test]
    fn test_sync_camera_skips_without_group_or_mode() {
        let (engine, vps) = engine_with(&["a", "b"]);
        let service = ViewportSyncService::new(engine);

        assert_eq!(
            service.sync_camera(vps[0].as_ref(), "a"),
            SyncOutcome::Skipped(SkipReason::NoGroup)
        );

        service.create_sync_group("g", ["a", "b"], &[SyncMode::Scroll]);
        assert_eq!(
            service.sync_camera(vps[0].as_ref(), "a"),
            SyncOutcome::Skipped(SkipReason::ModeInactive)
        );

        service.set_sync_modes("g", &[SyncMode::Pan]);
        service.set_sync_group_enabled("g", false);
        assert_eq!(
            service.sync_camera(vps[0].as_ref(), "a"),
            SyncOutcome::Skipped(SkipReason::GroupDisabled)
        );

        service.set_sync_group_enabled("g", true);
        assert_eq!(service.sync_camera(vps[0].as_ref(), "a"), SyncOutcome::Propagated(1));
    }

    #[test]
    fn test_sync_scroll_is_proportional() {
        let (engine, vps) = engine_with(&["src", "dst"]);
        vps[0].set_stack(stack(100), 512, 512);
        vps[1].set_stack(stack(20), 512, 512);
        let service = ViewportSyncService::new(engine);
        service.create_sync_group("g", ["src", "dst"], &[SyncMode::Scroll]);

        let outcome = service.sync_scroll(vps[0].as_ref(), "src", 50);
        assert_eq!(outcome, SyncOutcome::Propagated(1));
        assert_eq!(vps[1].current_image_id_index(), 10);
    }

    #[test]
    fn test_sync_scroll_empty_source_stack() {
        let (engine, vps) = engine_with(&["src", "dst"]);
        vps[1].set_stack(stack(20), 512, 512);
        let service = ViewportSyncService::new(engine);
        service.create_sync_group("g", ["src", "dst"], &[]);

        assert_eq!(
            service.sync_scroll(vps[0].as_ref(), "src", 3),
            SyncOutcome::Skipped(SkipReason::EmptyStack)
        );
        assert_eq!(vps[1].set_index_calls(), 0);
    }

    #[test]
    fn test_sync_window_level() {
        let (engine, vps) = engine_with(&["a", "b"]);
        let service = ViewportSyncService::new(engine);
        service.create_sync_group("g", ["a", "b"], &[SyncMode::WindowLevel]);

        assert_eq!(
            service.sync_window_level(vps[0].as_ref(), "a"),
            SyncOutcome::Skipped(SkipReason::NoVoiRange)
        );

        vps[1].set_properties(viewer_core::ViewportProperties {
            voi_range: None,
            invert: true,
        });
        vps[0].set_properties(viewer_core::ViewportProperties {
            voi_range: Some(VoiRange::from_window(400.0, 40.0)),
            invert: false,
        });

        assert_eq!(service.sync_window_level(vps[0].as_ref(), "a"), SyncOutcome::Propagated(1));
        let properties = vps[1].properties();
        assert_eq!(properties.voi_range, Some(VoiRange { lower: -160.0, upper: 240.0 }));
        assert!(properties.invert);
    }

    #[test]
    fn test_reentrant_calls_are_dropped() {
        let (engine, vps) = engine_with(&["a", "b"]);
        let service = ViewportSyncService::new(engine);
        service.create_sync_group("g", ["a", "b"], &[]);

        let _guard = UpdateGuard::acquire(&service.is_updating).unwrap();
        assert_eq!(
            service.sync_camera(vps[0].as_ref(), "a"),
            SyncOutcome::Skipped(SkipReason::Reentrant)
        );
        assert_eq!(vps[1].set_camera_calls(), 0);
    }

    #[test]
    fn test_guard_released_after_pass() {
        let (engine, vps) = engine_with(&["a", "b"]);
        let service = ViewportSyncService::new(engine);
        service.create_sync_group("g", ["a", "b"], &[]);

        service.sync_camera(vps[0].as_ref(), "a");
        assert!(!service.is_updating.load(Ordering::Acquire));
        assert_eq!(service.sync_camera(vps[1].as_ref(), "b"), SyncOutcome::Propagated(1));
    }

    #[test]
    fn test_joining_new_group_leaves_old_one() {
        let (engine, _vps) = engine_with(&["a", "b", "c"]);
        let service = ViewportSyncService::new(engine);
        service.create_sync_group("left", ["a", "b"], &[]);
        service.create_sync_group("right", ["b", "c"], &[]);

        let left = service.get_group("left").unwrap();
        assert!(!left.contains("b"));
        assert!(left.contains("a"));
        assert_eq!(service.get_sync_group_for_viewport("b").unwrap().id, "right");

        assert!(service.add_viewport_to_group("left", "c"));
        assert!(!service.get_group("right").unwrap().contains("c"));
        assert_eq!(service.get_sync_group_for_viewport("c").unwrap().id, "left");
    }

    #[test]
    fn test_replacing_group_clears_old_mappings() {
        let (engine, _vps) = engine_with(&["a", "b"]);
        let service = ViewportSyncService::new(engine);
        service.create_sync_group("g", ["a", "b"], &[]);
        service.create_sync_group("g", ["a"], &[SyncMode::Zoom]);

        assert!(service.get_sync_group_for_viewport("b").is_none());
        let group = service.get_sync_group_for_viewport("a").unwrap();
        assert!(group.includes(SyncMode::Zoom));
        assert!(!group.includes(SyncMode::Pan));
    }

    #[test]
    fn test_membership_management() {
        let (engine, _vps) = engine_with(&["a", "b"]);
        let service = ViewportSyncService::new(engine);

        assert!(!service.add_viewport_to_group("missing", "a"));
        service.create_sync_group("g", ["a"], &[]);
        assert!(service.add_viewport_to_group("g", "b"));
        assert!(service.remove_viewport_from_group("g", "a"));
        assert!(!service.remove_viewport_from_group("g", "a"));
        assert!(service.get_sync_group_for_viewport("a").is_none());

        assert_eq!(service.remove_viewport("b"), Some("g".to_string()));
        assert!(service.get_group("g").unwrap().viewport_ids.is_empty());

        assert!(service.destroy_sync_group("g"));
        assert!(!service.destroy_sync_group("g"));
        assert!(service.get_all_groups().is_empty());
    }

    #[test]
    fn test_clear_all() {
        let (engine, _vps) = engine_with(&["a", "b"]);
        let service = ViewportSyncService::new(engine);
        service.create_sync_group("g1", ["a"], &[]);
        service.create_sync_group("g2", ["b"], &[]);
        assert_eq!(service.get_all_groups().len(), 2);

        service.clear_all();
        assert!(service.get_all_groups().is_empty());
        assert!(service.get_sync_group_for_viewport("a").is_none());
    }
}
