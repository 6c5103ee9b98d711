//! 错误定义模块

use thiserror::Error;

/// 查看器统一错误类型
#[derive(Error, Debug)]
pub enum ViewerError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("无效状态转换: 从 {from} 到 {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("DICOM处理错误: {0}")]
    Dicom(String),

    #[error("监控指标错误: {0}")]
    Metrics(String),
}

/// 查看器统一结果类型
pub type Result<T> = std::result::Result<T, ViewerError>;
