// ============================================================================
// 🏷️ Metastamp CLI
// ============================================================================
//
// Batch image metadata stamping from CSV manifests.
//
// Usage:
//   metastamp run --csv manifest.csv --images a.jpg b.jpg
//   metastamp analyze --image photo.jpg --api-key sk-...
//   metastamp stats --root ./uploads
//   metastamp sweep --max-age-hours 24 --quota-mb 100
//
// ============================================================================

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use stamp_core::janitor::JanitorConfig;
use stamp_core::logging::{init_logging, LogConfig};
use stamp_core::tag_writer::TagWriterConfig;
use stamp_core::worker_pool::default_worker_count;
use stamp_core::working_dirs::FileCategory;
use stamp_core::{
    exiftool_available, BatchSummary, OutcomeStatus, Pipeline, PipelineConfig, TagAssistClient,
};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "metastamp")]
#[command(version)]
#[command(about = "Batch image metadata stamping from CSV manifests", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Process a manifest against a set of images and archive the results
    Run {
        /// CSV manifest (FileName,Title,Description,Keywords)
        #[arg(long)]
        csv: PathBuf,

        /// Image files referenced by the manifest
        #[arg(long, required = true, num_args = 1..)]
        images: Vec<PathBuf>,

        /// Working root for images/, processed/, temp/ and logs/
        #[arg(long, default_value = "uploads")]
        root: PathBuf,

        /// Skip the advisory read-back verification after each write
        #[arg(long)]
        no_verify: bool,

        /// Per-image tag-tool timeout in seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,

        /// Worker threads (defaults to a CPU-derived count)
        #[arg(long)]
        workers: Option<usize>,

        /// Emit the summary as JSON instead of the report box
        #[arg(long)]
        json: bool,
    },

    /// Suggest title, description and keywords for an image via AI
    Analyze {
        #[arg(long)]
        image: PathBuf,

        /// OpenAI API key (sk-...)
        #[arg(long)]
        api_key: String,

        #[arg(long)]
        json: bool,
    },

    /// Show storage usage across the working directories
    Stats {
        #[arg(long, default_value = "uploads")]
        root: PathBuf,

        #[arg(long)]
        json: bool,
    },

    /// Clear working directories (all categories when none given)
    Reset {
        #[arg(long, default_value = "uploads")]
        root: PathBuf,

        /// Category to clear; repeatable
        #[arg(long = "category")]
        categories: Vec<CategoryArg>,
    },

    /// Run one storage sweep now
    Sweep {
        #[arg(long, default_value = "uploads")]
        root: PathBuf,

        /// Delete files older than this many hours
        #[arg(long, default_value_t = 24)]
        max_age_hours: u64,

        /// Total size quota in megabytes
        #[arg(long, default_value_t = 100)]
        quota_mb: u64,

        #[arg(long)]
        json: bool,
    },

    /// Copy a batch archive out of the temp directory
    Download {
        /// Archive file name as reported by `run`
        #[arg(long)]
        name: String,

        /// Destination directory
        #[arg(long)]
        dest: PathBuf,

        #[arg(long, default_value = "uploads")]
        root: PathBuf,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum CategoryArg {
    Images,
    Processed,
    Temp,
}

impl From<CategoryArg> for FileCategory {
    fn from(arg: CategoryArg) -> Self {
        match arg {
            CategoryArg::Images => FileCategory::Image,
            CategoryArg::Processed => FileCategory::Processed,
            CategoryArg::Temp => FileCategory::Temp,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_root = match &cli.command {
        Commands::Run { root, .. }
        | Commands::Stats { root, .. }
        | Commands::Reset { root, .. }
        | Commands::Sweep { root, .. }
        | Commands::Download { root, .. } => root.clone(),
        Commands::Analyze { .. } => std::env::temp_dir(),
    };
    init_logging("metastamp", LogConfig::new().with_log_dir(log_root.join("logs")))
        .context("Failed to initialize logging")?;

    match cli.command {
        Commands::Run {
            csv,
            images,
            root,
            no_verify,
            timeout,
            workers,
            json,
        } => cmd_run(csv, images, root, no_verify, timeout, workers, json),
        Commands::Analyze {
            image,
            api_key,
            json,
        } => cmd_analyze(image, api_key, json),
        Commands::Stats { root, json } => cmd_stats(root, json),
        Commands::Reset { root, categories } => cmd_reset(root, categories),
        Commands::Sweep {
            root,
            max_age_hours,
            quota_mb,
            json,
        } => cmd_sweep(root, max_age_hours, quota_mb, json),
        Commands::Download { name, dest, root } => cmd_download(name, dest, root),
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_run(
    csv: PathBuf,
    images: Vec<PathBuf>,
    root: PathBuf,
    no_verify: bool,
    timeout: u64,
    workers: Option<usize>,
    json: bool,
) -> Result<()> {
    if !json {
        println!("╔══════════════════════════════════════════════╗");
        println!("║   🏷️  Metastamp Batch Processor              ║");
        println!("╚══════════════════════════════════════════════╝");
        println!();
    }

    if !exiftool_available() {
        anyhow::bail!(
            "exiftool was not found on PATH. Install it and try again (https://exiftool.org)."
        );
    }

    let csv_text = std::fs::read_to_string(&csv)
        .with_context(|| format!("Cannot read manifest {}", csv.display()))?;

    let worker_count = workers.unwrap_or_else(default_worker_count);
    let config = PipelineConfig {
        root,
        writer: TagWriterConfig {
            timeout: Duration::from_secs(timeout),
            verify: !no_verify,
        },
        workers: Some(worker_count),
        ..PipelineConfig::new(".")
    };
    let pipeline = Pipeline::new(config)?;

    if !json {
        println!("📄 Manifest: {}", style(csv.display()).cyan());
        println!("🖼️  Images:   {}", style(images.len()).green());
        println!("⚙️  Workers:  {}", style(worker_count).green());
        println!();
    }

    let spinner = if json {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .expect("static template"),
        );
        pb.set_message("Stamping images...");
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    };

    let summary = pipeline.upload_batch(&csv_text, &images)?;
    spinner.finish_and_clear();

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_run_report(&summary);
    }

    if summary.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn print_run_report(summary: &BatchSummary) {
    for outcome in &summary.outcomes {
        match outcome.status {
            OutcomeStatus::Succeeded => {
                println!("  {} {}", style("✅").green(), outcome.filename);
            }
            OutcomeStatus::Failed => {
                let detail = outcome.detail.as_deref().unwrap_or("unknown error");
                println!("  {} {}", style("❌").red(), style(detail).dim());
            }
        }
    }

    println!();
    println!("╔══════════════════════════════════════════════╗");
    println!("║   📊 Batch Complete                          ║");
    println!("╠══════════════════════════════════════════════╣");
    println!(
        "║  ✅ Succeeded:     {:>20}      ║",
        style(summary.succeeded).green()
    );
    println!(
        "║  ❌ Failed:        {:>20}      ║",
        style(summary.failed).red()
    );
    println!("║  📋 Total:         {:>20}      ║", summary.total);
    println!("╚══════════════════════════════════════════════╝");

    if let Some(archive) = &summary.archive_path {
        println!();
        println!("📦 Archive: {}", style(archive.display()).cyan());
    }
}

fn cmd_analyze(image: PathBuf, api_key: String, json: bool) -> Result<()> {
    if !json {
        println!("🔍 Analyzing {}", style(image.display()).cyan());
    }

    let client = TagAssistClient::new();
    let tags = client
        .suggest(&image, &api_key)
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tags)?);
    } else {
        println!();
        println!("📌 Title:       {}", style(&tags.title).green());
        println!("📝 Description: {}", tags.description);
        println!("🏷️  Keywords:    {}", style(tags.keywords.join(", ")).cyan());
    }
    Ok(())
}

fn cmd_stats(root: PathBuf, json: bool) -> Result<()> {
    let pipeline = Pipeline::new(PipelineConfig::new(root))?;
    let report = pipeline.stats();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("╔══════════════════════════════════════════════╗");
    println!("║   📊 Storage Usage                           ║");
    println!("╠══════════════════════════════════════════════╣");
    println!("║  🖼️  Images:        {:>16} KB      ║", report.images_bytes / 1024);
    println!("║  🏷️  Processed:     {:>16} KB      ║", report.processed_bytes / 1024);
    println!("║  📦 Temp:          {:>16} KB      ║", report.temp_bytes / 1024);
    println!("║  📈 Total:         {:>16} KB      ║", report.total_bytes / 1024);
    println!("╠══════════════════════════════════════════════╣");
    println!("║  🔒 Active files:  {:>19}      ║", report.active_files);
    println!("║  🗂️  Image count:   {:>19}      ║", report.image_count);
    println!("╚══════════════════════════════════════════════╝");
    Ok(())
}

fn cmd_reset(root: PathBuf, categories: Vec<CategoryArg>) -> Result<()> {
    let pipeline = Pipeline::new(PipelineConfig::new(root))?;
    let categories: Vec<FileCategory> = categories.into_iter().map(Into::into).collect();
    pipeline.reset(&categories)?;

    let label = if categories.is_empty() {
        "all categories".to_string()
    } else {
        categories
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    println!("🗑️  Cleared {}", style(label).yellow());
    Ok(())
}

fn cmd_sweep(root: PathBuf, max_age_hours: u64, quota_mb: u64, json: bool) -> Result<()> {
    let pipeline = Pipeline::new(PipelineConfig::new(root))?;
    let report = pipeline.sweep(JanitorConfig {
        max_age: Duration::from_secs(max_age_hours * 3600),
        max_total_bytes: quota_mb * 1024 * 1024,
        ..JanitorConfig::default()
    });

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("🧹 Sweep complete:");
    println!("  📋 Examined:         {}", report.examined);
    println!("  ⏰ Expired removed:  {}", style(report.deleted_expired).yellow());
    println!("  📏 Quota removed:    {}", style(report.deleted_for_quota).yellow());
    println!("  🔒 Skipped (in use): {}", report.skipped_in_use);
    println!("  💾 Freed:            {} KB", report.bytes_freed / 1024);
    Ok(())
}

fn cmd_download(name: String, dest: PathBuf, root: PathBuf) -> Result<()> {
    let pipeline = Pipeline::new(PipelineConfig::new(root))?;
    std::fs::create_dir_all(&dest)
        .with_context(|| format!("Cannot create {}", dest.display()))?;

    let target = dest.join(&name);
    let mut file = std::fs::File::create(&target)
        .with_context(|| format!("Cannot create {}", target.display()))?;
    let info = pipeline
        .download_archive(&name, &mut file)
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;

    println!(
        "📦 {} ({} KB) → {}",
        style(&info.file_name).cyan(),
        info.bytes / 1024,
        style(target.display()).green()
    );
    Ok(())
}
