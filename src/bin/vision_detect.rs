//! vision_detect - run one image file through one model and print the result

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use waste_vision::{
    config::ServiceConfig, AnalyzeRequest, BackendKind, DetectionDispatcher, ImageCodec,
    ImagePayload,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Image file to analyze (JPEG or PNG).
    image: PathBuf,
    /// Model to run (yolo11, rt-detr, faster-rcnn). Defaults to the configured default.
    #[arg(long)]
    model: Option<String>,
    /// Config file (TOML or JSON).
    #[arg(long, env = "VISION_CONFIG")]
    config: Option<PathBuf>,
    /// Omit crop previews from the output.
    #[arg(long)]
    no_crops: bool,
}

fn media_type(path: &Path) -> Result<&'static str> {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => Ok("image/jpeg"),
        "png" => Ok("image/png"),
        _ => Err(anyhow!("unsupported image extension for {}", path.display())),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = ServiceConfig::load_from(args.config.as_deref())?;
    if let Some(model) = &args.model {
        let kind: BackendKind = model.parse()?;
        // Load only the requested model.
        config.yolo11.enabled = kind == BackendKind::Grid;
        config.rt_detr.enabled = kind == BackendKind::Transformer;
        config.faster_rcnn.enabled = kind == BackendKind::RegionProposal;
        config.default_model = model.clone();
    }

    let bytes = std::fs::read(&args.image)
        .with_context(|| format!("failed to read image {}", args.image.display()))?;
    let payload = ImagePayload::from_image_bytes(media_type(&args.image)?, &bytes);

    let registry = config.build_registry()?;
    let dispatcher =
        DetectionDispatcher::new(Arc::new(registry), ImageCodec::new(config.crop_quality));
    let request = AnalyzeRequest {
        image: payload,
        model: args.model,
    };
    let result = dispatcher.dispatch(&request)?;

    let output = if args.no_crops {
        serde_json::json!({ "detections": result.detections() })
    } else {
        serde_json::to_value(&result)?
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
