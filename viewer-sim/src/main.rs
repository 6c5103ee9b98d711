//! 视口协调模拟程序
//!
//! 在内存渲染引擎上运行一次完整的查看会话：挂载视口、建立同步组、
//! 加载影像、触发连续的相机事件与滚动，最后输出叠加层标注和运行指标。

mod dicom_header;

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use viewer_admin::{init_logging, ConfigManager, ViewerConfig};
use viewer_core::memory::{MemoryEngine, MemoryViewport};
use viewer_core::utils::{generate_dicom_uid, stack_image_ids};
use viewer_core::{CanvasSize, ImageData, OverlayItem, Prediction, ViewportHandle, ViewportStatus};
use viewer_overlay::{OverlayProps, RecordingSink};
use viewer_runtime::ViewerContext;

const ENGINE_ID: &str = "sim-engine";

/// 模拟程序命令行参数
#[derive(Parser, Debug)]
#[command(name = "viewer-sim")]
#[command(about = "DICOM查看器视口协调模拟")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// 日志级别，覆盖配置文件
    #[arg(short, long)]
    log_level: Option<String>,

    /// 视口数量
    #[arg(long, default_value = "2")]
    viewports: usize,

    /// 每个视口的堆栈长度
    #[arg(long, default_value = "40")]
    stack_length: usize,

    /// 连续触发的相机事件数
    #[arg(long, default_value = "50")]
    events: usize,

    /// 读取影像尺寸的DICOM文件
    #[arg(long)]
    dicom: Option<PathBuf>,

    /// AI预测结果JSON文件
    #[arg(long)]
    predictions: Option<PathBuf>,
}

/// 预测结果文件
#[derive(Debug, Deserialize)]
struct PredictionFile {
    ai_image_width: f64,
    ai_image_height: f64,
    predictions: Vec<Prediction>,
}

#[derive(Debug, Serialize)]
struct ViewportSummary {
    viewport_id: String,
    status: Option<ViewportStatus>,
    image_index: usize,
    parallel_scale: f64,
}

#[derive(Debug, Serialize)]
struct SessionReport {
    viewports: Vec<ViewportSummary>,
    overlay_items: Vec<OverlayItem>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ConfigManager::new(path)?.get_config().await,
        None => ViewerConfig::default(),
    };
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    init_logging(&config.logging)?;

    info!("启动视口协调模拟...");
    if args.viewports == 0 || args.stack_length == 0 {
        anyhow::bail!("--viewports and --stack-length must be positive");
    }

    let (width, height) = match &args.dicom {
        Some(path) => dicom_header::image_dimensions(path)?,
        None => (512, 512),
    };
    let predictions = match &args.predictions {
        Some(path) => load_predictions(path)?,
        None => demo_predictions(),
    };

    let context = ViewerContext::new(config)?;
    let engine = Arc::new(MemoryEngine::new(ENGINE_ID));
    context.register_engine(engine.clone());

    let viewport_ids: Vec<String> = (0..args.viewports).map(|i| format!("viewport-{}", i)).collect();
    let target_index = args.stack_length / 2;
    let sink = Arc::new(RecordingSink::new());
    let mut viewports: Vec<Arc<MemoryViewport>> = Vec::with_capacity(viewport_ids.len());

    for (index, viewport_id) in viewport_ids.iter().enumerate() {
        let viewport = engine.add_viewport(viewport_id, CanvasSize::new(1024.0, 1024.0));
        let image_ids = stack_image_ids(&generate_dicom_uid(), args.stack_length);

        // 第一个视口挂载AI叠加层，标注位于堆栈中间的帧
        let overlay = (index == 0).then(|| {
            context.create_overlay(
                OverlayProps {
                    viewport_id: viewport_id.clone(),
                    rendering_engine_id: ENGINE_ID.to_string(),
                    predictions: predictions.predictions.clone(),
                    ai_image_width: predictions.ai_image_width,
                    ai_image_height: predictions.ai_image_height,
                    target_image_id: image_ids.get(target_index).cloned(),
                },
                sink.clone(),
            )
        });

        context.mount_viewport(ENGINE_ID, viewport_id, viewport.surface(), overlay)?;
        context.state().start_loading(viewport_id);
        let mut image_data = ImageData::new(width, height);
        if let Some(first) = image_ids.first() {
            image_data = image_data.with_image_id(first.as_str());
        }
        viewport.set_stack(image_ids, width, height);
        context.state().set_image_data(viewport_id, image_data);
        viewports.push(viewport);
    }

    let ids: Vec<&str> = viewport_ids.iter().map(String::as_str).collect();
    context.create_sync_group(ENGINE_ID, "sim-group", &ids)?;

    let Some(primary) = viewports.first() else {
        anyhow::bail!("no viewports were created");
    };

    info!("Firing {} camera events on {}", args.events, primary.id());
    for step in 0..args.events {
        primary.pan(1.0, 0.5);
        if step % 10 == 0 {
            primary.zoom(1.05);
        }
    }
    settle(&context).await;

    info!("Scrolling {} to image {}", primary.id(), target_index);
    primary.set_image_id_index(target_index);
    settle(&context).await;

    let report = SessionReport {
        viewports: viewports
            .iter()
            .map(|viewport| ViewportSummary {
                viewport_id: viewport.id().to_string(),
                status: context.state().get_state(viewport.id()).map(|state| state.status),
                image_index: viewport.current_image_id_index(),
                parallel_scale: viewport.camera().parallel_scale,
            })
            .collect(),
        overlay_items: sink.items(primary.id()),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    println!("{}", context.metrics_text()?);

    context.shutdown();
    info!("模拟结束");
    Ok(())
}

/// 等待挂起的叠加层刷新完成
async fn settle(context: &ViewerContext) {
    let scheduler = &context.config().scheduler;
    let wait = scheduler.debounce() + scheduler.frame_interval() * 2;
    tokio::time::sleep(wait).await;
}

fn load_predictions(path: &Path) -> Result<PredictionFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read predictions {}", path.display()))?;
    let file: PredictionFile = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse predictions {}", path.display()))?;
    if file.predictions.is_empty() {
        warn!("Prediction file {} contains no predictions", path.display());
    }
    Ok(file)
}

fn demo_predictions() -> PredictionFile {
    PredictionFile {
        ai_image_width: 640.0,
        ai_image_height: 640.0,
        predictions: vec![
            Prediction {
                detection_id: Some("demo-1".to_string()),
                class: "nodule".to_string(),
                confidence: 0.91,
                points: vec![[300.0, 120.0], [340.0, 100.0], [330.0, 150.0]],
            },
            Prediction {
                detection_id: Some("demo-2".to_string()),
                class: "calcification".to_string(),
                confidence: 0.58,
                points: vec![[120.0, 400.0], [150.0, 380.0], [160.0, 420.0]],
            },
        ],
    }
}
