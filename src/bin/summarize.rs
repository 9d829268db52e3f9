//! Summarize binary entry point.
//!
//! Runs the extraction pipeline over one or more documents and stores the
//! merged records in the paper database, optionally generating a reference
//! implementation and a blog post for each.
//!
//! # Examples
//!
//! Summarize a single paper:
//! ```bash
//! summarize paper.txt
//! ```
//!
//! Re-process a directory of papers with a custom config:
//! ```bash
//! summarize --config paperpal.toml --force papers/
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use paper_pal::{
    config::AppConfig,
    generate::{GenerationKind, Generator},
    ingestion::{
        document::collect_documents, IngestionPipeline, IngestionResult, PipelineConfig,
        SummarizeOutcome, SummarizeStatus,
    },
    models::PaperRecord,
    provider,
    store,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Summarize research papers into the paper database
#[derive(Parser, Debug)]
#[command(
    name = "summarize",
    version,
    about = "Extract structured knowledge from research papers",
    long_about = "Segment each document, extract its summary, takeaways, math, architecture, \
                  domain and future directions with a language model, and store the merged record.

EXAMPLES:
  Summarize one paper:
    summarize paper.txt

  Summarize every .txt/.md file in a directory, overwriting stored records:
    summarize --force papers/

  Also write a reference implementation and a blog post in your own style:
    summarize --code --blog --blog-style my_post.md --output-dir out/ paper.txt

  Use Gemini:
    GOOGLE_API_KEY=... PAPERPAL_PROVIDER__KIND=gemini summarize paper.txt"
)]
struct Args {
    /// Documents or directories of documents (.txt, .md)
    #[arg(required = true, value_name = "PATH")]
    paths: Vec<PathBuf>,

    /// Configuration file (TOML)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Database file path (overrides the configuration)
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,

    /// Model identifier (overrides the configuration)
    #[arg(long, value_name = "MODEL")]
    model: Option<String>,

    /// Re-process documents that are already stored
    #[arg(long)]
    force: bool,

    /// Generate a reference implementation for papers with an extracted architecture
    #[arg(long)]
    code: bool,

    /// Generate a blog post for each paper
    #[arg(long)]
    blog: bool,

    /// Writing sample the blog post should imitate
    #[arg(long, value_name = "FILE", requires = "blog")]
    blog_style: Option<PathBuf>,

    /// Directory for generated files (overrides the configuration)
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Logging verbosity level
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: String,
}

/// Initialize logging subsystem with the specified level
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Create a progress bar for tracking summarization
fn create_progress_bar(total: usize) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} papers | {msg}")
            .context("Invalid progress bar template")?
            .progress_chars("##-"),
    );
    Ok(pb)
}

/// Generate the requested artifacts for each stored paper, logging failures.
async fn generate_all(
    generator: &Generator,
    papers: &[PaperRecord],
    kinds: &[GenerationKind],
    style_sample: Option<&str>,
    cancel: &CancellationToken,
) -> usize {
    let mut failed = 0;
    for paper in papers {
        for &kind in kinds {
            if kind == GenerationKind::Code && paper.architecture.is_none() {
                info!(paper_id = %paper.paper_id, "No architecture extracted, skipping code generation");
                continue;
            }
            let saved = match generator.generate(paper, kind, style_sample, cancel).await {
                Ok(text) => generator.save(&paper.paper_id, kind, &text),
                Err(err) => Err(err),
            };
            match saved {
                Ok(path) => println!("{} {}: {}", paper.paper_id, kind, path.display()),
                Err(err) => {
                    warn!(paper_id = %paper.paper_id, "Failed to generate {}: {}", kind, err);
                    failed += 1;
                }
            }
        }
    }
    failed
}

fn report(pb: &ProgressBar, path: &Path, result: &IngestionResult<SummarizeOutcome>) {
    pb.inc(1);
    match result {
        Ok(outcome) => {
            let status = match outcome.status {
                SummarizeStatus::Created => "created",
                SummarizeStatus::Reused => "reused",
                SummarizeStatus::Overwritten => "overwritten",
            };
            let mut line = format!(
                "{} [{}] {} ({})",
                outcome.record.paper_id, status, outcome.record.title, outcome.record.domain
            );
            if outcome.record.is_degraded() {
                let missing: Vec<String> = outcome
                    .record
                    .missing_fields
                    .iter()
                    .map(|aspect| aspect.to_string())
                    .collect();
                line.push_str(&format!(" | missing: {}", missing.join(", ")));
            }
            pb.println(line);
            pb.set_message(outcome.record.title.clone());
        }
        Err(err) => pb.println(format!("FAILED {}: {}", path.display(), err)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!("Starting paper summarization");
    debug!("CLI arguments: {:?}", args);
    let start_time = Instant::now();

    let mut config = AppConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(db_path) = &args.db_path {
        config.db_path = Some(db_path.clone());
    }
    if let Some(model) = &args.model {
        config.provider.model = model.clone();
    }
    if let Some(output_dir) = &args.output_dir {
        config.generation.output_dir = output_dir.clone();
    }
    let style_sample = args
        .blog_style
        .as_deref()
        .map(std::fs::read_to_string)
        .transpose()
        .context("Failed to read blog style sample")?;

    let db_path = config.database_path();
    info!("Database path: {}", db_path.display());
    let store = store::open_sqlite(&db_path, &config.embedding, config.store.clone())
        .await
        .context("Failed to open paper store")?;

    let model = provider::from_settings(&config.provider).context("Failed to create model provider")?;
    info!("Model provider: {}", model.name());

    let generator = Generator::new(Arc::clone(&model), config.retry.clone(), config.generation.clone());
    let pipeline = IngestionPipeline::new(
        Arc::new(store),
        model,
        PipelineConfig {
            segmenter: config.segmenter.clone(),
            extraction: config.extraction.clone(),
            retry: config.retry.clone(),
            merge: config.merge.clone(),
        },
    );

    let documents = collect_documents(&args.paths, pipeline.extractor())
        .context("Failed to list input documents")?;
    if documents.is_empty() {
        warn!("No supported documents found");
        return Ok(());
    }
    info!("Found {} documents", documents.len());

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current model calls");
            on_signal.cancel();
        }
    });

    let progress = create_progress_bar(documents.len())?;
    let mut stored = Vec::new();
    let stats = pipeline
        .summarize_batch(&documents, args.force, &cancel, |path, result| {
            report(&progress, path, result);
            if let Ok(outcome) = result {
                stored.push(outcome.record.clone());
            }
        })
        .await;
    progress.finish_with_message("done");

    let mut kinds = Vec::new();
    if args.code {
        kinds.push(GenerationKind::Code);
    }
    if args.blog {
        kinds.push(GenerationKind::Blog);
    }
    let generation_failures = if kinds.is_empty() || cancel.is_cancelled() {
        0
    } else {
        generate_all(&generator, &stored, &kinds, style_sample.as_deref(), &cancel).await
    };

    let elapsed = start_time.elapsed();
    println!("\n╔════════════════════════════════════════╗");
    println!("║      Summarization Completed           ║");
    println!("╠════════════════════════════════════════╣");
    println!("║ Total processed:      {:>16} ║", stats.total_processed);
    println!("║ Created:              {:>16} ║", stats.created);
    println!("║ Overwritten:          {:>16} ║", stats.overwritten);
    println!("║ Already stored:       {:>16} ║", stats.reused);
    println!("║ Degraded:             {:>16} ║", stats.degraded);
    println!("║ Failed:               {:>16} ║", stats.failed());
    if !kinds.is_empty() {
        println!("║ Generation failures:  {:>16} ║", generation_failures);
    }
    println!("║ Elapsed time:         {:>13.2?} ║", elapsed);
    println!("╚════════════════════════════════════════╝");

    for (path, reason) in &stats.failures {
        warn!(path = %path.display(), "Failed: {}", reason);
    }
    if stats.cancelled {
        anyhow::bail!("Summarization cancelled after {} documents", stats.total_processed);
    }
    if stats.failed() > 0 && stats.failed() == stats.total_processed {
        anyhow::bail!("Every document failed to process");
    }

    info!("Summarization completed");
    Ok(())
}
