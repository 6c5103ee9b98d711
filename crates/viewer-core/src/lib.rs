//! # Viewer Core
//!
//! 影像查看器视口协调层的核心模块，提供基础数据结构、错误定义、
//! 渲染引擎能力抽象以及内存渲染引擎实现。

pub mod engine;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod models;
pub mod utils;

pub use engine::{
    EngineRegistry, EventHandler, RenderSurface, RenderingEngine, SubscriptionId, ViewportEvent,
    ViewportEventKind, ViewportHandle,
};
pub use error::{Result, ViewerError};
pub use metrics::{MetricsSink, NoopMetrics};
pub use models::*;
