//! clipforge: gameplay sessions to planner/controller training data.
//!
//! Provides subcommands for each stage of the pipeline:
//!
//! - `extract`  -- Stage 1: align sessions and sample clips
//! - `label`    -- Stage 2: label clip samples with the remote model
//! - `build`    -- Stage 3: plan spans, retrieval and training streams
//! - `run`      -- All three stages in one process
//! - `inspect`  -- Print a saved build report

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use clipforge::config::PipelineConfig;
use clipforge::dataset::assembler::LABEL_CACHE_FILE;
use clipforge::dataset::{all_samples, BuildReport, DatasetAssembler, Episode};
use clipforge::label::{LabelBatcher, LabelCache, VlmLabelService};
use clipforge::retrieval::{load_side_index, HistoryCorpus, RetrievalConstructor};
use clipforge::vocab::Vocabulary;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// clipforge: gameplay sessions to planner/controller training data
#[derive(Parser)]
#[command(name = "clipforge", version, about)]
struct Cli {
    /// Path to a JSON configuration file (uses defaults if not provided).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct IoArgs {
    /// Root directory holding one sub-directory per session.
    #[arg(long, default_value = "data/sessions")]
    sessions: PathBuf,

    /// Output directory for streams and reports.
    #[arg(long, default_value = "data/dataset")]
    out: PathBuf,
}

#[derive(Args, Clone)]
struct RetrievalArgs {
    /// Attempt history (JSONL) used for the retrieved memory field.
    #[arg(long)]
    history: Option<PathBuf>,

    /// Side index (JSONL) used to backfill thin histories.
    #[arg(long)]
    side_index: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Stage 1: align sessions, sample clips and write the clip index.
    Extract {
        #[command(flatten)]
        io: IoArgs,
    },

    /// Stage 2: label every clip sample.
    Label {
        #[command(flatten)]
        io: IoArgs,

        /// Directory holding the controlled vocabulary files.
        #[arg(long, default_value = "data/vocab")]
        vocab: PathBuf,

        /// Prepare requests and cache keys without calling the model.
        #[arg(long)]
        dry_run: bool,

        /// Label at most this many samples.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Stage 3: build spans and training streams from existing labels.
    Build {
        #[command(flatten)]
        io: IoArgs,

        #[command(flatten)]
        retrieval: RetrievalArgs,
    },

    /// Run all three stages.
    Run {
        #[command(flatten)]
        io: IoArgs,

        /// Directory holding the controlled vocabulary files.
        #[arg(long, default_value = "data/vocab")]
        vocab: PathBuf,

        #[command(flatten)]
        retrieval: RetrievalArgs,
    },

    /// Print a saved build report.
    Inspect {
        /// Path to a report JSON file.
        #[arg(default_value = "data/dataset/build_report.json")]
        path: PathBuf,
    },
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Reads RUST_LOG, defaults to info.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };

    match cli.command {
        Commands::Extract { io } => cmd_extract(config, &io),
        Commands::Label {
            io,
            vocab,
            dry_run,
            limit,
        } => cmd_label(config, &io, &vocab, dry_run, limit).await,
        Commands::Build { io, retrieval } => cmd_build(config, &io, &retrieval),
        Commands::Run {
            io,
            vocab,
            retrieval,
        } => cmd_run(config, &io, &vocab, &retrieval).await,
        Commands::Inspect { path } => cmd_inspect(&path),
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

fn cmd_extract(config: PipelineConfig, io: &IoArgs) -> Result<()> {
    create_out_dir(&io.out)?;
    let assembler = DatasetAssembler::new(config);
    let (episodes, report) = assembler.extract(&io.sessions, &io.out)?;

    tracing::info!(
        episodes = episodes.len(),
        samples = all_samples(&episodes).count(),
        dropped = report.episodes_dropped,
        "Extract stage finished"
    );
    Ok(())
}

async fn cmd_label(
    config: PipelineConfig,
    io: &IoArgs,
    vocab_dir: &Path,
    dry_run: bool,
    limit: Option<usize>,
) -> Result<()> {
    create_out_dir(&io.out)?;
    let assembler = DatasetAssembler::new(config);
    let (episodes, _) = assembler.extract_episodes(&io.sessions)?;
    let mut samples: Vec<_> = all_samples(&episodes).cloned().collect();
    if let Some(limit) = limit {
        samples.truncate(limit);
    }

    let batcher = create_batcher(assembler.config(), vocab_dir, &io.out)?;

    if dry_run {
        let prepared = batcher.dry_run(&samples).await;
        let mut ready = 0;
        for (sample_id, outcome) in &prepared {
            match outcome {
                Ok(request) => {
                    ready += 1;
                    println!(
                        "{sample_id}  frames={}  key={}",
                        request.media.frame_count(),
                        request.cache_key
                    );
                }
                Err(skip) => println!("{sample_id}  skipped: {skip}"),
            }
        }
        tracing::info!(ready, total = prepared.len(), "Dry run finished");
        return Ok(());
    }

    let (records, report) = assembler.label(&batcher, &samples, &io.out).await?;
    tracing::info!(
        records = records.len(),
        accepted = report.labels.accepted,
        failed = report.labels.failed,
        cache_hits = report.labels.cache_hits,
        "Label stage finished"
    );
    Ok(())
}

fn cmd_build(config: PipelineConfig, io: &IoArgs, retrieval: &RetrievalArgs) -> Result<()> {
    create_out_dir(&io.out)?;
    let assembler = DatasetAssembler::new(config);
    let retrieval = create_retrieval(assembler.config(), retrieval)?;

    let (episodes, mut report) = assembler.extract_episodes(&io.sessions)?;
    let labels = assembler.load_labels(&io.out)?;
    report.merge(assembler.label_report(&labels));
    report.merge(assembler.build(&episodes, &labels, &retrieval, &io.out)?);
    let report = assembler.finish_report(report, &io.out)?;

    print_summary(&episodes, &report);
    Ok(())
}

async fn cmd_run(
    config: PipelineConfig,
    io: &IoArgs,
    vocab_dir: &Path,
    retrieval: &RetrievalArgs,
) -> Result<()> {
    create_out_dir(&io.out)?;
    let assembler = DatasetAssembler::new(config);
    let retrieval = create_retrieval(assembler.config(), retrieval)?;
    let batcher = create_batcher(assembler.config(), vocab_dir, &io.out)?;

    let report = assembler.run(&io.sessions, &io.out, &batcher, &retrieval).await?;
    println!("{}", report.render());
    Ok(())
}

fn cmd_inspect(path: &Path) -> Result<()> {
    let report = BuildReport::load(path)?;
    println!("Report: {}", path.display());
    println!("{}", report.render());
    Ok(())
}

// ---------------------------------------------------------------------------
// Construction helpers
// ---------------------------------------------------------------------------

fn create_out_dir(out: &Path) -> Result<()> {
    std::fs::create_dir_all(out)
        .with_context(|| format!("Failed to create output directory {}", out.display()))
}

fn create_batcher(
    config: &PipelineConfig,
    vocab_dir: &Path,
    out: &Path,
) -> Result<LabelBatcher<VlmLabelService>> {
    let vocab = Vocabulary::load(vocab_dir)?;
    let service = VlmLabelService::new(&config.model, config.labeler.clone(), vocab.clone())?;
    let cache = LabelCache::open(&out.join(LABEL_CACHE_FILE))?;
    Ok(LabelBatcher::new(
        service,
        cache,
        vocab,
        config.labeler.clone(),
        config.assembler.schema_version.clone(),
    ))
}

fn create_retrieval(config: &PipelineConfig, args: &RetrievalArgs) -> Result<RetrievalConstructor> {
    let history = HistoryCorpus::load(args.history.as_deref())?;
    let side_index = load_side_index(args.side_index.as_deref())?;
    tracing::info!(
        history = history.len(),
        side_index = side_index.len(),
        policy = %config.retrieval.policy_version,
        "Loaded retrieval sources"
    );
    Ok(RetrievalConstructor::new(
        config.retrieval.clone(),
        history,
        side_index,
    ))
}

fn print_summary(episodes: &[Episode], report: &BuildReport) {
    println!("Episodes: {}", episodes.len());
    println!("{}", report.render());
}
