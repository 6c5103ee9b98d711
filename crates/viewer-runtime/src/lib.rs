//! # 视口运行时
//!
//! 将渲染引擎事件接入状态管理、视口同步与AI叠加层：
//! - [`RefreshScheduler`]：去抖并对齐到帧边界的刷新调度
//! - [`ViewportBinding`]：单个视口的事件绑定
//! - [`ViewerContext`]：组合根，持有所有协调服务

pub mod binding;
pub mod context;
pub mod scheduler;

pub use binding::{BindingServices, ViewportBinding};
pub use context::ViewerContext;
pub use scheduler::{RefreshScheduler, RefreshTask};
