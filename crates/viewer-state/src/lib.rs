//! # 视口状态模块
//!
//! 为每个视口维护显式的生命周期状态机，作为“视口当前能否渲染/交互”
//! 的唯一事实来源，与渲染引擎自身的内部状态解耦：
//! - 状态转换图：定义合法的状态迁移
//! - 状态管理器：记录每个视口的状态并同步通知订阅者

pub mod manager;
pub mod state_machine;

pub use manager::{FieldUpdate, StatePatch, StateSubscriber, Subscription, ViewportStateConfig, ViewportStateManager};
pub use state_machine::ViewportStateMachine;
