//! # 视口同步模块
//!
//! 将一组视口的相机（平移/缩放）、堆栈滚动位置和窗宽窗位保持一致，
//! 并通过服务级的重入保护避免多视口之间的循环更新。

pub mod group;
pub mod service;

pub use group::{SkipReason, SyncGroup, SyncOutcome};
pub use service::ViewportSyncService;
