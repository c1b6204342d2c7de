use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use rusty_rena::data::loader::{load_mask, load_matrix, load_volume, save_matrix, save_volume};
use rusty_rena::{Memory, ReNA, ReNAConfig, ReNAModel, Volume4D, VolumeMasker};

// ---------------------------------------------------------------------------
// Command line
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Debug logging (RUST_LOG still takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fit ReNA on a volume and write the reduced data
    Reduce {
        /// Volume voxel table (.json, .csv, .parquet)
        #[arg(short, long)]
        input: PathBuf,
        /// Mask voxel table; a background mask is computed when omitted
        #[arg(short, long)]
        mask: Option<PathBuf>,
        /// JSON file with ReNA parameters; flags below override it
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(short, long, allow_negative_numbers = true)]
        n_clusters: Option<i64>,
        /// Scale each cluster by the square root of its size
        #[arg(long)]
        scaling: bool,
        #[arg(long, allow_negative_numbers = true)]
        n_iter: Option<i64>,
        #[arg(long)]
        threshold: Option<f64>,
        /// Directory for cached clusterings
        #[arg(long)]
        cache_dir: Option<PathBuf>,
        /// Reduced data, CSV (samples × clusters)
        #[arg(short, long)]
        output: PathBuf,
        /// Where to save the fitted model (JSON)
        #[arg(long)]
        model: Option<PathBuf>,
        /// Where to save the label image as a voxel table
        #[arg(long)]
        labels: Option<PathBuf>,
    },
    /// Map reduced data back to voxel space
    Inverse {
        /// Fitted model written by `reduce --model`
        #[arg(long)]
        model: PathBuf,
        /// Reduced data CSV
        #[arg(short, long)]
        input: PathBuf,
        /// Output voxel table (.json, .csv, .parquet)
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Report shape, sample count and mask size of a volume
    Info {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        mask: Option<PathBuf>,
    },
}

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Reduce {
            input,
            mask,
            config,
            n_clusters,
            scaling,
            n_iter,
            threshold,
            cache_dir,
            output,
            model,
            labels,
        } => {
            let mut cfg = match config {
                Some(path) => read_config(&path)?,
                None => ReNAConfig::default(),
            };
            if let Some(n) = n_clusters {
                cfg.n_clusters = n;
            }
            if let Some(n) = n_iter {
                cfg.n_iter = n;
            }
            if let Some(t) = threshold {
                cfg.threshold = t;
            }
            cfg.scaling |= scaling;

            let volume = load_volume(&input)?;
            let masker = mask
                .as_deref()
                .map(load_mask)
                .transpose()?
                .map(VolumeMasker::with_mask);

            let mut rena = ReNA::from_config(cfg)
                .with_mask(masker)
                .with_memory(Memory::new(cache_dir));
            let reduced = rena.fit_transform(&volume)?;
            save_matrix(&reduced, "cluster", &output)?;
            log::info!(
                "wrote {} x {} reduced matrix to {}",
                reduced.nrows(),
                reduced.ncols(),
                output.display()
            );

            if let Some(path) = model {
                write_model(&rena.to_model()?, &path)?;
            }
            if let Some(path) = labels {
                let img = rena.labels_img()?.mapv(|v| v as f64);
                let shape = img.dim();
                let volume = Volume4D::new(img.into_shape((shape.0, shape.1, shape.2, 1))?)?;
                save_volume(&volume, Some(rena.mask()?), &path)?;
            }
            Ok(())
        }
        Commands::Inverse {
            model,
            input,
            output,
        } => {
            let rena = ReNA::from_model(read_model(&model)?)?;
            let reduced = load_matrix(&input)?;
            let restored = rena.inverse_transform(&reduced)?;
            save_volume(&restored, Some(rena.mask()?), &output)?;
            log::info!("wrote restored volume to {}", output.display());
            Ok(())
        }
        Commands::Info { input, mask } => {
            let volume = load_volume(&input)?;
            let mut masker = VolumeMasker::new(mask.as_deref().map(load_mask).transpose()?);
            masker.fit(&volume)?;
            log::info!(
                "shape {:?}, {} samples, {} masked voxels",
                volume.shape3(),
                volume.n_samples(),
                masker.n_features().unwrap_or(0)
            );
            Ok(())
        }
    }
}

fn read_config(path: &Path) -> Result<ReNAConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}

fn read_model(path: &Path) -> Result<ReNAModel> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading model {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing model {}", path.display()))
}

fn write_model(model: &ReNAModel, path: &Path) -> Result<()> {
    let text = serde_json::to_string_pretty(model).context("serializing model")?;
    std::fs::write(path, text).with_context(|| format!("writing model {}", path.display()))?;
    log::info!("wrote model to {}", path.display());
    Ok(())
}
