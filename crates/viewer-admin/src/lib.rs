//! # 查看器管理模块
//!
//! 提供配置管理、日志初始化和运行指标等运维功能

pub mod config;
pub mod logging;
pub mod metrics;

pub use config::{ConfigManager, ConfigValidator, ViewerConfig};
pub use logging::init_logging;
pub use metrics::ViewerMetrics;
