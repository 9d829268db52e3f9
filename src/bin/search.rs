//! Search binary entry point.
//!
//! Searches the paper database built by `summarize`. Single-query mode only
//! needs the store; interactive mode opens a full research session with
//! summarize, open, discuss, add, compare and generate commands.
//!
//! # Examples
//!
//! Single query with default settings:
//! ```bash
//! search --query "attention mechanisms"
//! ```
//!
//! Structured query as JSON:
//! ```bash
//! search --query "domain: reinforcement learning" --format json
//! ```
//!
//! Interactive mode:
//! ```bash
//! search --interactive
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Color, ContentArrangement, Table};
use paper_pal::{
    config::AppConfig,
    embedding::{DynamicEmbeddingProvider, EmbeddingProvider},
    ingestion::{IngestionPipeline, PipelineConfig},
    models::{DomainCount, PaperRecord, RelevanceLevel, SearchResult},
    provider,
    query::SearchQuery,
    generate::GenerationKind,
    session::{Session, SessionContext, SessionError},
    storage::sqlite::SqliteStorage,
    store::{self, PaperStore},
};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

type AppSession = Session<DynamicEmbeddingProvider, SqliteStorage>;

/// Output format for search results
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-friendly table with colored relevance levels
    Table,
    /// Machine-readable JSON format
    Json,
}

/// Search binary CLI for querying the paper database
#[derive(Parser, Debug)]
#[command(
    name = "search",
    version,
    about = "Search and explore summarized papers",
    long_about = "Query the paper database by meaning, title, domain or takeaway. Interactive \
                  mode adds opening, discussing, annotating, comparing and generating from papers.

EXAMPLES:
  Semantic query:
    search --query \"graph neural networks\"

  Structured queries:
    search --query \"title: attention is all\"
    search --query \"takeaway: residual connections\" --top-k 10

  Interactive mode:
    search --interactive"
)]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Database file path (overrides the configuration)
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,

    /// Search query, optionally prefixed with domain:, title: or takeaway:
    #[arg(long, value_name = "TEXT", conflicts_with = "interactive")]
    query: Option<String>,

    /// Number of results to return (defaults to the configuration)
    #[arg(long, value_name = "N")]
    top_k: Option<usize>,

    /// Output format
    #[arg(long, value_enum, default_value = "table")]
    format: OutputFormat,

    /// Enable interactive REPL mode
    #[arg(long, short = 'i')]
    interactive: bool,

    /// Logging verbosity level
    #[arg(long, default_value = "warn", value_name = "LEVEL")]
    log_level: String,
}

/// Setup logging with the specified level
fn setup_logging(log_level: &str) {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .init();
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let head: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

/// Format results as a pretty table
fn format_results_table(results: &[SearchResult]) -> String {
    if results.is_empty() {
        return "No results found.".to_string();
    }
    let show_takeaway = results.iter().any(|r| r.matched_takeaway.is_some());

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    let mut header = vec![
        Cell::new("Rank").add_attribute(Attribute::Bold),
        Cell::new("ID").add_attribute(Attribute::Bold),
        Cell::new("Title").add_attribute(Attribute::Bold),
        Cell::new("Domain").add_attribute(Attribute::Bold),
        Cell::new("Relevance").add_attribute(Attribute::Bold),
        Cell::new("Score").add_attribute(Attribute::Bold),
    ];
    if show_takeaway {
        header.push(Cell::new("Matched takeaway").add_attribute(Attribute::Bold));
    }
    table.set_header(header);

    for (idx, result) in results.iter().enumerate() {
        let (relevance_str, color) = match result.relevance {
            RelevanceLevel::Identical => ("IDENTICAL", Color::Green),
            RelevanceLevel::HighlySimilar => ("HIGHLY_SIMILAR", Color::Cyan),
            RelevanceLevel::Similar => ("SIMILAR", Color::Yellow),
            RelevanceLevel::Relevant => ("RELEVANT", Color::White),
        };

        let mut row = vec![
            Cell::new(idx + 1),
            Cell::new(&result.paper.paper_id),
            Cell::new(truncate(&result.paper.title, 60)),
            Cell::new(truncate(&result.paper.domain, 30)),
            Cell::new(relevance_str).fg(color),
            Cell::new(format!("{:.4}", result.score)),
        ];
        if show_takeaway {
            let takeaway = result.matched_takeaway.as_deref().unwrap_or("");
            row.push(Cell::new(truncate(takeaway, 50)));
        }
        table.add_row(row);
    }

    table.to_string()
}

fn format_domains_table(domains: &[DomainCount]) -> String {
    if domains.is_empty() {
        return "No papers stored yet.".to_string();
    }
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Domain").add_attribute(Attribute::Bold),
        Cell::new("Papers").add_attribute(Attribute::Bold),
    ]);
    for domain in domains {
        table.add_row(vec![Cell::new(&domain.domain), Cell::new(domain.count)]);
    }
    table.to_string()
}

/// Format results as JSON
fn format_results_json(results: &[SearchResult]) -> Result<String> {
    serde_json::to_string_pretty(results).with_context(|| "Failed to serialize results to JSON")
}

fn print_list(label: &str, items: &[String]) {
    println!("\n{}:", label);
    if items.is_empty() {
        println!("  (none)");
    }
    for item in items {
        println!("  - {}", item);
    }
}

/// Display one section (or all) of a paper
fn display_paper(paper: &PaperRecord, section: &str) -> bool {
    let all = section == "all";
    println!("\n{}", "═".repeat(80));
    println!("{} [{}]", paper.title, paper.paper_id);
    println!("Domain: {}", paper.domain);
    if all {
        println!("Source: {}", paper.filepath);
        println!("Updated: {}", paper.updated_at.format("%Y-%m-%d %H:%M"));
        if paper.is_degraded() {
            let missing: Vec<String> = paper.missing_fields.iter().map(|a| a.to_string()).collect();
            println!("Missing: {}", missing.join(", "));
        }
    }

    let mut shown = all || section == "domain";
    if all || section == "summary" {
        println!("\nSummary:\n{}", paper.summary);
        shown = true;
    }
    if all || section == "takeaways" {
        print_list("Key takeaways", &paper.takeaways);
        shown = true;
    }
    if all || section == "architecture" {
        println!(
            "\nArchitecture:\n{}",
            paper.architecture.as_deref().unwrap_or("(none)")
        );
        shown = true;
    }
    if all || section == "math" {
        print_list("Mathematical formulations", &paper.math_formulations);
        shown = true;
    }
    if all || section == "future" {
        print_list("Future directions", &paper.future_directions);
        shown = true;
    }
    if all || section == "notes" {
        print_list("Notes", &paper.notes);
        shown = true;
    }
    println!("{}", "═".repeat(80));
    shown
}

fn print_results(results: &[SearchResult], format: OutputFormat, elapsed: std::time::Duration) -> Result<()> {
    match format {
        OutputFormat::Table => {
            println!("{}", format_results_table(results));
            println!(
                "\nFound {} results in {:.2}s",
                results.len(),
                elapsed.as_secs_f64()
            );
        }
        OutputFormat::Json => println!("{}", format_results_json(results)?),
    }
    Ok(())
}

const HELP: &str = "Commands:
  <query>                     - Search (prefix with domain:, title: or takeaway:)
  /top N                      - Set number of results to N
  /format table|json          - Set output format
  /detail N                   - Show full details for result rank N
  /summarize PATH [--force]   - Summarize a document and open it
  /open ID                    - Open a paper as the current paper
  /show [SECTION]             - Show summary, takeaways, architecture, math, future, notes, domain or all
  /discuss QUESTION           - Ask about the current paper
  /add FIELD CONTENT          - Add takeaways, future, math, notes or set domain on the current paper
  /generate code              - Generate a reference implementation of the current paper
  /generate blog [STYLE_FILE] - Generate a blog post, optionally imitating a writing sample
  /compare add ID             - Add a paper to the comparison set
  /compare remove ID          - Remove a paper from the comparison set
  /compare list               - List the comparison set
  /compare clear              - Empty the comparison set
  /compare ASPECT|QUESTION    - Compare on methodology, results, architecture or a question
  /domains [N]                - List research domains
  /help                       - Show this help
  Ctrl+D or Ctrl+C            - Exit";

/// Print a failed session operation, with a hint for rejected credentials.
fn report_error(action: &str, err: &SessionError) {
    eprintln!("{} failed: {}", action, err);
    if err.is_auth_failure() {
        eprintln!("Check provider.api_key or the provider's API key environment variable");
    }
}

/// REPL state
struct Repl {
    session: AppSession,
    ctx: SessionContext,
    top_k: usize,
    format: OutputFormat,
    last_results: Vec<SearchResult>,
}

impl Repl {
    async fn search(&mut self, line: &str) {
        let start = Instant::now();
        match self.session.search(line, self.top_k).await {
            Ok(results) => {
                if let Err(e) = print_results(&results, self.format, start.elapsed()) {
                    eprintln!("Error formatting results: {}", e);
                }
                self.last_results = results;
            }
            Err(e) => eprintln!("Search failed: {}", e),
        }
    }

    async fn compare(&mut self, rest: &str) {
        let (sub, arg) = rest.split_once(' ').unwrap_or((rest, ""));
        let arg = arg.trim();
        let cancel = CancellationToken::new();
        match sub {
            "add" => match self.session.compare_add(&mut self.ctx, arg).await {
                Ok(true) => println!("Added {} ({} in set)", arg, self.ctx.comparison().len()),
                Ok(false) => println!("{} is already in the comparison set", arg),
                Err(e) => eprintln!("{}", e),
            },
            "remove" => match self.session.compare_remove(&mut self.ctx, arg) {
                Ok(()) => println!("Removed {}", arg),
                Err(e) => eprintln!("{}", e),
            },
            "list" => match self.session.compare_list(&self.ctx).await {
                Ok(papers) if papers.is_empty() => println!("Comparison set is empty"),
                Ok(papers) => {
                    for (i, paper) in papers.iter().enumerate() {
                        println!("  {}. {} [{}]", i + 1, paper.title, paper.paper_id);
                    }
                }
                Err(e) => eprintln!("{}", e),
            },
            "clear" => {
                self.session.compare_clear(&mut self.ctx);
                println!("Comparison set cleared");
            }
            _ => match self.session.compare(&self.ctx, rest, &cancel).await {
                Ok(answer) => println!("\n{}\n", answer),
                Err(e) => report_error("Comparison", &e),
            },
        }
    }

    async fn generate(&mut self, rest: &str, cancel: &CancellationToken) {
        let (kind, style_file) = rest.split_once(' ').unwrap_or((rest, ""));
        let kind: GenerationKind = match kind.parse() {
            Ok(kind) => kind,
            Err(e) => {
                eprintln!("{}", e);
                eprintln!("Usage: /generate code | /generate blog [STYLE_FILE]");
                return;
            }
        };
        let style_file = style_file.trim();
        let style_sample = if kind == GenerationKind::Blog && !style_file.is_empty() {
            match std::fs::read_to_string(style_file) {
                Ok(sample) => Some(sample),
                Err(e) => {
                    eprintln!("Failed to read style file {}: {}", style_file, e);
                    return;
                }
            }
        } else {
            None
        };

        println!("Generating {} ...", kind);
        match self
            .session
            .generate(&self.ctx, kind, style_sample.as_deref(), cancel)
            .await
        {
            Ok((text, path)) => {
                println!("\n{}\n", text);
                println!("Saved to {}", path.display());
            }
            Err(e) => report_error("Generation", &e),
        }
    }

    /// Handle one `/command`; returns `false` for unknown commands.
    async fn command(&mut self, line: &str) -> bool {
        let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        let cancel = CancellationToken::new();

        match cmd {
            "/help" => println!("{}", HELP),
            "/top" => match rest.parse::<usize>() {
                Ok(n) if n > 0 => {
                    self.top_k = n;
                    println!("Set top-k to {}", n);
                }
                _ => eprintln!("Usage: /top N (positive integer)"),
            },
            "/format" => match rest {
                "table" => {
                    self.format = OutputFormat::Table;
                    println!("Set output format to table");
                }
                "json" => {
                    self.format = OutputFormat::Json;
                    println!("Set output format to JSON");
                }
                _ => eprintln!("Usage: /format [table|json]"),
            },
            "/detail" => match rest.parse::<usize>() {
                Ok(rank) if rank > 0 && rank <= self.last_results.len() => {
                    let result = &self.last_results[rank - 1];
                    println!("Rank {} | {:?} | score {:.4}", rank, result.relevance, result.score);
                    display_paper(&result.paper, "all");
                }
                _ => eprintln!(
                    "Usage: /detail N (last search had {} results)",
                    self.last_results.len()
                ),
            },
            "/summarize" => {
                let force = rest.ends_with(" --force") || rest == "--force";
                let path = rest.trim_end_matches("--force").trim();
                if path.is_empty() {
                    eprintln!("Usage: /summarize PATH [--force]");
                    return true;
                }
                println!("Summarizing {} ...", path);
                match self.session.summarize(&mut self.ctx, Path::new(path), force, &cancel).await {
                    Ok(outcome) => {
                        println!(
                            "{:?}: {} [{}] ({} chunks)",
                            outcome.status, outcome.record.title, outcome.record.paper_id, outcome.chunks
                        );
                        if outcome.manifest.is_degraded() {
                            println!("{} slots degraded", outcome.manifest.entries.len());
                        }
                    }
                    Err(e) => report_error("Summarize", &e),
                }
            }
            "/open" => match self.session.open(&mut self.ctx, rest).await {
                Ok(paper) => println!("Opened: {} [{}]", paper.title, paper.paper_id),
                Err(e) => eprintln!("{}", e),
            },
            "/show" => match self.ctx.current() {
                Some(paper) => {
                    let section = if rest.is_empty() { "summary" } else { rest };
                    if !display_paper(paper, &section.to_lowercase()) {
                        eprintln!("Unknown section: {}", section);
                    }
                }
                None => eprintln!("No paper is open; open one first"),
            },
            "/discuss" => match self.session.discuss(&self.ctx, rest, &cancel).await {
                Ok(answer) => println!("\n{}\n", answer),
                Err(e) => report_error("Discussion", &e),
            },
            "/add" => {
                let (field, content) = rest.split_once(' ').unwrap_or((rest, ""));
                let content = content.trim().trim_matches('"');
                match self.session.add(&mut self.ctx, field, content).await {
                    Ok(_) => println!("Updated {}", field),
                    Err(e) => eprintln!("{}", e),
                }
            }
            "/compare" => self.compare(rest).await,
            "/generate" => self.generate(rest, &cancel).await,
            "/domains" => {
                let limit = rest.parse::<usize>().unwrap_or(20);
                match self.session.domains(limit).await {
                    Ok(domains) => println!("{}", format_domains_table(&domains)),
                    Err(e) => eprintln!("{}", e),
                }
            }
            _ => return false,
        }
        true
    }
}

/// Run interactive REPL mode
async fn run_interactive(mut repl: Repl) -> Result<()> {
    println!("Interactive Paper Search");
    println!("{}", HELP);
    println!();

    let mut rl = DefaultEditor::new().with_context(|| "Failed to create readline editor")?;

    loop {
        let prompt = match repl.ctx.current() {
            Some(paper) => format!("Search [{}]> ", paper.paper_id),
            None => "Search> ".to_string(),
        };
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                rl.add_history_entry(line).ok();

                if line.starts_with('/') {
                    if !repl.command(line).await {
                        eprintln!("Unknown command: {}. Type /help for available commands.", line);
                    }
                } else {
                    repl.search(line).await;
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                error!("Error reading input: {}", err);
                break;
            }
        }
    }

    Ok(())
}

/// Run single-query mode
async fn run_single_query(
    store: &PaperStore<DynamicEmbeddingProvider, SqliteStorage>,
    query: &str,
    top_k: usize,
    format: OutputFormat,
) -> Result<()> {
    let start = Instant::now();
    let query = SearchQuery::parse(query, top_k).context("Invalid query")?;
    debug!("Executing {} search for: {}", query.kind, query.text);
    let results = store
        .execute(&query)
        .await
        .with_context(|| format!("Failed to execute search for query: '{}'", query.text))?;
    print_results(&results, format, start.elapsed())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level);

    let mut config = AppConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(db_path) = &args.db_path {
        config.db_path = Some(db_path.clone());
    }
    let top_k = args.top_k.unwrap_or_else(|| config.search_limit());
    if top_k == 0 {
        anyhow::bail!("--top-k must be at least 1");
    }

    let db_path = config.database_path();
    info!("Opening database: {}", db_path.display());
    let store = store::open_sqlite(&db_path, &config.embedding, config.store.clone())
        .await
        .context("Failed to open paper store")?;
    info!(
        "Loaded {} papers (embedding model {})",
        store.count().await?,
        store.embedder().model_name()
    );

    if !args.interactive {
        let query = args
            .query
            .as_deref()
            .context("Either --query or --interactive is required")?;
        return run_single_query(&store, query, top_k, args.format).await;
    }

    let model = provider::from_settings(&config.provider)
        .context("Interactive mode needs a model provider; configure an API key")?;
    let pipeline = IngestionPipeline::new(
        Arc::new(store),
        Arc::clone(&model),
        PipelineConfig {
            segmenter: config.segmenter.clone(),
            extraction: config.extraction.clone(),
            retry: config.retry.clone(),
            merge: config.merge.clone(),
        },
    );
    let session = Session::new(
        pipeline,
        model,
        config.retry.clone(),
        config.comparison.clone(),
        config.discussion.clone(),
        config.generation.clone(),
    );
    let ctx = session.new_context();

    run_interactive(Repl {
        session,
        ctx,
        top_k,
        format: args.format,
        last_results: Vec::new(),
    })
    .await
}
