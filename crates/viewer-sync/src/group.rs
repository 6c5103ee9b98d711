//! 同步组定义

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use viewer_core::SyncMode;

/// 同步组
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncGroup {
    pub id: String,
    pub viewport_ids: HashSet<String>,
    pub sync_modes: HashSet<SyncMode>,
    pub enabled: bool,
}

impl SyncGroup {
    pub fn new(id: impl Into<String>, modes: &[SyncMode]) -> Self {
        Self {
            id: id.into(),
            viewport_ids: HashSet::new(),
            sync_modes: normalize_modes(modes),
            enabled: true,
        }
    }

    /// 是否同步指定维度（`All` 覆盖全部维度）
    pub fn includes(&self, mode: SyncMode) -> bool {
        self.sync_modes.contains(&SyncMode::All) || self.sync_modes.contains(&mode)
    }

    pub fn contains(&self, viewport_id: &str) -> bool {
        self.viewport_ids.contains(viewport_id)
    }

    /// 除源视口外的成员，按ID排序
    pub fn targets(&self, source_viewport_id: &str) -> Vec<String> {
        let mut targets: Vec<String> = self
            .viewport_ids
            .iter()
            .filter(|id| id.as_str() != source_viewport_id)
            .cloned()
            .collect();
        targets.sort();
        targets
    }
}

/// 空模式列表视为 `All`
pub(crate) fn normalize_modes(modes: &[SyncMode]) -> HashSet<SyncMode> {
    if modes.is_empty() {
        [SyncMode::All].into_iter().collect()
    } else {
        modes.iter().copied().collect()
    }
}

/// 同步未执行的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// 已有传播过程在进行中
    Reentrant,
    /// 源视口不属于任何同步组
    NoGroup,
    GroupDisabled,
    ModeInactive,
    /// 源视口堆栈为空
    EmptyStack,
    /// 源视口没有窗宽窗位
    NoVoiRange,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Reentrant => "reentrant",
            SkipReason::NoGroup => "no_group",
            SkipReason::GroupDisabled => "group_disabled",
            SkipReason::ModeInactive => "mode_inactive",
            SkipReason::EmptyStack => "empty_stack",
            SkipReason::NoVoiRange => "no_voi_range",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一次同步调用的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// 已写入的目标视口数量
    Propagated(usize),
    Skipped(SkipReason),
}

impl SyncOutcome {
    pub fn propagated(&self) -> usize {
        match self {
            SyncOutcome::Propagated(count) => *count,
            SyncOutcome::Skipped(_) => 0,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, SyncOutcome::Skipped(_))
    }
}
