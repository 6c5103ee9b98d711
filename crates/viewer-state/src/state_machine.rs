//! 视口状态机
//!
//! 定义视口生命周期的合法状态转换

use std::collections::{HashMap, HashSet};
use viewer_core::{Result, ViewerError, ViewportStatus};

/// 视口状态机
#[derive(Debug, Clone)]
pub struct ViewportStateMachine {
    transitions: HashMap<ViewportStatus, HashSet<ViewportStatus>>,
}

impl ViewportStateMachine {
    /// 创建新的状态机实例
    pub fn new() -> Self {
        use ViewportStatus::*;

        let mut transitions: HashMap<ViewportStatus, HashSet<ViewportStatus>> = HashMap::new();
        let mut allow = |from: ViewportStatus, targets: &[ViewportStatus]| {
            transitions.entry(from).or_default().extend(targets.iter().copied());
        };

        // 定义状态转换规则
        allow(Initializing, &[Loading, Error, Disposing]);
        allow(Loading, &[Ready, Error, Disposing]);
        allow(Ready, &[Loading, Error, Disposing]);
        allow(Error, &[Loading, Disposing]);
        allow(Disposing, &[Disposed]);
        // Disposed 为终态

        Self { transitions }
    }

    /// 检查状态转换是否有效
    pub fn can_transition(&self, from: ViewportStatus, to: ViewportStatus) -> bool {
        self.transitions
            .get(&from)
            .map(|targets| targets.contains(&to))
            .unwrap_or(false)
    }

    /// 校验状态转换
    pub fn transition(&self, from: ViewportStatus, to: ViewportStatus) -> Result<ViewportStatus> {
        if self.can_transition(from, to) {
            Ok(to)
        } else {
            Err(ViewerError::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
            })
        }
    }

    /// 获取某状态可以转换到的所有状态
    pub fn get_possible_targets(&self, current: ViewportStatus) -> Vec<ViewportStatus> {
        let mut targets: Vec<ViewportStatus> = self
            .transitions
            .get(&current)
            .map(|targets| targets.iter().copied().collect())
            .unwrap_or_default();
        targets.sort_by_key(|status| status.to_string());
        targets
    }

    /// 是否为终态
    pub fn is_terminal(&self, status: ViewportStatus) -> bool {
        self.transitions.get(&status).map_or(true, |targets| targets.is_empty())
    }
}

impl Default for ViewportStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
