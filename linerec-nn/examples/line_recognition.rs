//! Line Recognition Example
//!
//! Recognizes the text of handwritten line images with either the
//! fixed-window CNN or the CNN + transformer model.
//!
//! # Usage
//!
//! ```bash
//! cargo run -p linerec-nn --example line_recognition -- [OPTIONS] --mapping <MAPPING> <IMAGES>...
//! ```
//!
//! # Arguments
//!
//! * `-a, --architecture` - `simple` or `transformer` (default: transformer)
//! * `-c, --config` - Model configuration JSON; defaults sized for the mapping otherwise
//! * `-m, --mapping` - Character list, one token per line
//! * `-w, --weights` - safetensors weights; freshly initialized weights otherwise
//! * `-d, --device` - Device to run on: cpu, cuda, cuda:N, or metal (default: cpu)
//! * `-v, --verbose` - Print raw class ids as well
//! * `<IMAGES>...` - Line images; they are resized to the model input height
//!
//! # Examples
//!
//! ```bash
//! cargo run -p linerec-nn --example line_recognition -- \
//!     -m mapping.txt -c transformer.json -w transformer.safetensors \
//!     line1.png line2.png
//! ```

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Instant;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use tracing::{error, info, warn};

use linerec_core::core::init_tracing;
use linerec_core::domain::CharacterMapping;
use linerec_core::utils::image::{load_line_image, resize_to_height};
use linerec_nn::utils::{images_to_tensor, parse_device};
use linerec_nn::{LineCnnSimple, LineCnnSimpleConfig, LineCnnTransformer, LineCnnTransformerConfig};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Architecture {
    Simple,
    Transformer,
}

/// Command-line arguments for the line recognition example
#[derive(Parser)]
#[command(name = "line_recognition")]
#[command(about = "Handwritten line recognition with sliding-window CNN models")]
struct Args {
    /// Model architecture
    #[arg(short, long, value_enum, default_value = "transformer")]
    architecture: Architecture,

    /// Model configuration JSON
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Character list, one token per line
    #[arg(short, long)]
    mapping: PathBuf,

    /// safetensors weights
    #[arg(short, long)]
    weights: Option<PathBuf>,

    /// Paths to input images to process
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// Device to run on: cpu, cuda, cuda:N, or metal (default: cpu)
    #[arg(short, long, default_value = "cpu")]
    device: String,

    /// Print raw class ids
    #[arg(short, long)]
    verbose: bool,
}

enum Model {
    Simple(LineCnnSimple),
    Transformer(LineCnnTransformer),
}

impl Model {
    fn input_height(&self) -> usize {
        match self {
            Model::Simple(m) => m.config().input_height,
            Model::Transformer(m) => m.config().input_height,
        }
    }

    fn predict(&self, x: &candle_core::Tensor) -> linerec_core::core::RecResult<Vec<Vec<u32>>> {
        match self {
            Model::Simple(m) => m.predict(x),
            Model::Transformer(m) => m.predict(x),
        }
    }
}

fn load_model(
    args: &Args,
    mapping: &CharacterMapping,
    device: &Device,
) -> Result<Model, Box<dyn std::error::Error>> {
    let varmap = VarMap::new();
    let random_vb = || VarBuilder::from_varmap(&varmap, DType::F32, device);
    if args.weights.is_none() {
        warn!("No weights given, running with freshly initialized weights");
    }

    let model = match args.architecture {
        Architecture::Simple => {
            let config = match &args.config {
                Some(path) => LineCnnSimpleConfig::from_path(path)?,
                None => LineCnnSimpleConfig::for_mapping(mapping),
            };
            Model::Simple(match &args.weights {
                Some(weights) => LineCnnSimple::from_safetensors(config, weights, device)?,
                None => LineCnnSimple::new(config, random_vb())?,
            })
        }
        Architecture::Transformer => {
            let config = match &args.config {
                Some(path) => LineCnnTransformerConfig::from_path(path)?,
                None => LineCnnTransformerConfig::for_mapping(mapping),
            };
            Model::Transformer(match &args.weights {
                Some(weights) => {
                    LineCnnTransformer::from_safetensors(config, mapping, weights, device)?
                }
                None => LineCnnTransformer::new(config, mapping, random_vb())?,
            })
        }
    };
    Ok(model)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();

    info!("Line Recognition Example ({:?})", args.architecture);

    let mapping = CharacterMapping::from_file(&args.mapping)?;
    info!("Loaded mapping with {} tokens", mapping.len());

    let device = parse_device(&args.device)?;
    info!("Using device: {:?}", device);

    let load_start = Instant::now();
    let model = load_model(&args, &mapping, &device)?;
    info!(
        "Model ready in {:.2}ms",
        load_start.elapsed().as_secs_f64() * 1000.0
    );

    let height = model.input_height() as u32;
    for image_path in &args.images {
        info!("Processing: {}", image_path.display());

        let image = match load_line_image(image_path) {
            Ok(img) => resize_to_height(&img, height),
            Err(e) => {
                error!("  Failed to load image: {}", e);
                continue;
            }
        };

        let infer_start = Instant::now();
        let result = images_to_tensor(&[image], &device).and_then(|x| model.predict(&x));
        match result {
            Ok(predictions) => {
                info!(
                    "  Inference time: {:.2}ms",
                    infer_start.elapsed().as_secs_f64() * 1000.0
                );
                for ids in &predictions {
                    if args.verbose {
                        info!("  Class ids: {:?}", ids);
                    }
                    info!("  Result: {}", mapping.decode(ids));
                }
            }
            Err(e) => error!("  Inference failed: {}", e),
        }
    }
    Ok(())
}
