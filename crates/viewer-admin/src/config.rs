//! 配置管理
//!
//! 从配置文件与 `VIEWER_` 前缀的环境变量加载查看器配置，支持校验和保存

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info};
use viewer_core::{SyncMode, ViewportStatus};

/// 配置管理器
#[derive(Debug)]
pub struct ConfigManager {
    /// 配置数据
    config: Arc<RwLock<ViewerConfig>>,
    /// 配置文件路径
    config_path: Option<String>,
    /// 配置验证器
    validator: ConfigValidator,
}

/// 查看器完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ViewerConfig {
    /// 视口状态配置
    pub state: StateConfig,
    /// 同步配置
    pub sync: SyncConfig,
    /// 刷新调度配置
    pub scheduler: SchedulerConfig,
    /// AI叠加层配置
    pub overlay: OverlayConfig,
    /// 日志配置
    pub logging: LoggingConfig,
}

/// 视口状态配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StateConfig {
    /// 销毁后记录保留时间（毫秒）
    pub grace_period_ms: u64,
    /// 不允许渲染的状态
    pub non_renderable: Vec<ViewportStatus>,
}

/// 同步配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// 新建同步组的默认模式
    pub default_modes: Vec<SyncMode>,
}

/// 刷新调度配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 事件后的固定延迟（毫秒）
    pub debounce_ms: u64,
    /// 帧间隔（毫秒）
    pub frame_interval_ms: u64,
}

/// AI叠加层配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OverlayConfig {
    /// 低于该置信度的预测不绘制
    pub min_confidence: f64,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别（EnvFilter 语法）
    pub level: String,
    /// 日志格式：compact / full
    pub format: String,
}

/// 配置验证器
#[derive(Debug)]
pub struct ConfigValidator {
    /// 验证规则
    validation_rules: Vec<ValidationRule>,
}

/// 验证规则
#[derive(Debug)]
struct ValidationRule {
    /// 字段路径
    field_path: String,
    /// 验证函数
    validator: fn(&ViewerConfig) -> Result<()>,
    /// 错误消息
    error_message: String,
}

impl ConfigManager {
    /// 从文件创建配置管理器，文件不存在时使用默认值
    pub fn new(config_path: &str) -> Result<Self> {
        let config = Self::load_config(config_path)?;
        let manager = Self {
            config: Arc::new(RwLock::new(config)),
            config_path: Some(config_path.to_string()),
            validator: ConfigValidator::new(),
        };
        Ok(manager)
    }

    /// 使用给定配置创建（不关联文件）
    pub fn from_config(config: ViewerConfig) -> Result<Self> {
        let validator = ConfigValidator::new();
        validator.validate(&config)?;
        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path: None,
            validator,
        })
    }

    /// 从文件加载配置
    fn load_config(config_path: &str) -> Result<ViewerConfig> {
        let settings = Config::builder()
            .add_source(File::with_name(config_path).required(false))
            .add_source(
                Environment::with_prefix("VIEWER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration sources")?;

        let config: ViewerConfig = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        ConfigValidator::new().validate(&config)?;
        info!("Configuration loaded from: {}", config_path);
        Ok(config)
    }

    /// 获取配置
    pub async fn get_config(&self) -> ViewerConfig {
        let config = self.config.read().await;
        config.clone()
    }

    /// 更新配置
    pub async fn update_config(&self, new_config: ViewerConfig) -> Result<()> {
        self.validator.validate(&new_config)?;

        {
            let mut config = self.config.write().await;
            *config = new_config;
        }

        if self.config_path.is_some() {
            self.save_config().await?;
        }

        info!("Configuration updated successfully");
        Ok(())
    }

    /// 保存配置到文件
    pub async fn save_config(&self) -> Result<()> {
        let Some(path) = &self.config_path else {
            return Err(anyhow::anyhow!("Configuration is not backed by a file"));
        };

        let config = self.config.read().await;
        let config_str = toml::to_string_pretty(&*config)
            .context("Failed to serialize configuration")?;

        tokio::fs::write(path, config_str)
            .await
            .context("Failed to write configuration file")?;

        info!("Configuration saved to: {}", path);
        Ok(())
    }

    /// 重新加载配置
    pub async fn reload_config(&self) -> Result<()> {
        let Some(path) = &self.config_path else {
            return Ok(());
        };
        let new_config = Self::load_config(path)?;
        *self.config.write().await = new_config;
        info!("Configuration reloaded from: {}", path);
        Ok(())
    }

    /// 验证当前配置
    pub async fn validate_config(&self) -> Result<()> {
        let config = self.config.read().await;
        self.validator.validate(&config)
    }
}

impl ConfigValidator {
    /// 创建新的配置验证器
    pub fn new() -> Self {
        let validation_rules = vec![
            ValidationRule {
                field_path: "state.grace_period_ms".to_string(),
                validator: |config| {
                    if config.state.grace_period_ms == 0 {
                        Err(anyhow::anyhow!("Grace period cannot be 0"))
                    } else {
                        Ok(())
                    }
                },
                error_message: "Invalid disposal grace period".to_string(),
            },
            ValidationRule {
                field_path: "state.non_renderable".to_string(),
                validator: |config| {
                    if config.state.non_renderable.contains(&ViewportStatus::Ready) {
                        Err(anyhow::anyhow!("READY viewports must stay renderable"))
                    } else {
                        Ok(())
                    }
                },
                error_message: "Invalid non-renderable status set".to_string(),
            },
            ValidationRule {
                field_path: "scheduler.frame_interval_ms".to_string(),
                validator: |config| {
                    if config.scheduler.frame_interval_ms == 0 {
                        Err(anyhow::anyhow!("Frame interval cannot be 0"))
                    } else {
                        Ok(())
                    }
                },
                error_message: "Invalid scheduler frame interval".to_string(),
            },
            ValidationRule {
                field_path: "overlay.min_confidence".to_string(),
                validator: |config| {
                    if (0.0..=1.0).contains(&config.overlay.min_confidence) {
                        Ok(())
                    } else {
                        Err(anyhow::anyhow!("Minimum confidence must be within [0, 1]"))
                    }
                },
                error_message: "Invalid overlay confidence threshold".to_string(),
            },
            ValidationRule {
                field_path: "logging.format".to_string(),
                validator: |config| match config.logging.format.as_str() {
                    "compact" | "full" => Ok(()),
                    other => Err(anyhow::anyhow!("Unknown log format: {}", other)),
                },
                error_message: "Invalid logging format".to_string(),
            },
        ];

        Self { validation_rules }
    }

    /// 验证配置
    pub fn validate(&self, config: &ViewerConfig) -> Result<()> {
        for rule in &self.validation_rules {
            if let Err(e) = (rule.validator)(config) {
                error!("Configuration validation failed for {}: {}", rule.field_path, e);
                return Err(anyhow::anyhow!("{}: {}", rule.error_message, e));
            }
        }
        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl StateConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl SchedulerConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 1000,
            non_renderable: vec![
                ViewportStatus::Initializing,
                ViewportStatus::Disposing,
                ViewportStatus::Disposed,
            ],
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_modes: vec![SyncMode::All],
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 16,      // 60Hz 一帧
            frame_interval_ms: 16,
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self { min_confidence: 0.0 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ViewerConfig::default();
        assert!(ConfigValidator::new().validate(&config).is_ok());
        assert_eq!(config.scheduler.debounce(), Duration::from_millis(16));
        assert_eq!(config.state.grace_period(), Duration::from_secs(1));
    }

    #[test]
    fn test_validation_rules() {
        let validator = ConfigValidator::new();

        let mut config = ViewerConfig::default();
        config.state.grace_period_ms = 0;
        assert!(validator.validate(&config).is_err());

        let mut config = ViewerConfig::default();
        config.overlay.min_confidence = 1.5;
        assert!(validator.validate(&config).is_err());

        let mut config = ViewerConfig::default();
        config.state.non_renderable.push(ViewportStatus::Ready);
        assert!(validator.validate(&config).is_err());

        let mut config = ViewerConfig::default();
        config.logging.format = "xml".to_string();
        assert!(validator.validate(&config).is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ViewerConfig = toml::from_str(
            r#"
            [scheduler]
            debounce_ms = 32

            [sync]
            default_modes = ["pan", "windowLevel"]

            [state]
            non_renderable = ["INITIALIZING", "DISPOSED"]
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.debounce_ms, 32);
        assert_eq!(config.scheduler.frame_interval_ms, 16);
        assert_eq!(config.sync.default_modes, vec![SyncMode::Pan, SyncMode::WindowLevel]);
        assert_eq!(config.state.grace_period_ms, 1000);
        assert_eq!(config.state.non_renderable.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_file_falls_back_to_defaults() {
        let manager = ConfigManager::new("/nonexistent/viewer-config").unwrap();
        let config = manager.get_config().await;
        assert_eq!(config.state.grace_period_ms, 1000);
        assert!(manager.validate_config().await.is_ok());
    }

    #[tokio::test]
    async fn test_save_and_reload_roundtrip() {
        let path = std::env::temp_dir().join(format!("viewer-config-{}.toml", std::process::id()));
        let path_str = path.to_string_lossy().to_string();

        let manager = ConfigManager::new(&path_str).unwrap();
        let mut config = manager.get_config().await;
        config.overlay.min_confidence = 0.3;
        manager.update_config(config).await.unwrap();

        let reloaded = ConfigManager::new(&path_str).unwrap();
        assert_eq!(reloaded.get_config().await.overlay.min_confidence, 0.3);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_invalid_update_is_rejected() {
        let manager = ConfigManager::from_config(ViewerConfig::default()).unwrap();
        let mut config = manager.get_config().await;
        config.scheduler.frame_interval_ms = 0;
        assert!(manager.update_config(config).await.is_err());
        assert_eq!(manager.get_config().await.scheduler.frame_interval_ms, 16);
    }
}
