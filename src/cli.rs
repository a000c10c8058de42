//! The operator-facing CLI surface (spec §6.5): subcommands over a chosen
//! database path for inspecting and repairing a driver's persisted state.
//! Every command supports `--format {table,json,jsonl}` and exits non-zero
//! on error via `anyhow` at this binary edge, the teacher's own convention
//! for `main.rs`.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use crate::codec;
use crate::integrity;
use crate::model::{ErrorType, RequestStatus};
use crate::store::Store;

#[derive(Parser, Debug)]
#[command(name = "kent-driver", about = "Inspect and repair a scraper-driver database")]
pub struct Cli {
    /// Path to the driver's SQLite database.
    #[arg(long, env = "DB_PATH", global = true, default_value = "./driver.db")]
    pub db: PathBuf,

    /// Output rendering.
    #[arg(long, value_enum, global = true, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Jsonl,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Inspect Requests.
    Requests {
        #[command(subcommand)]
        action: RequestsCmd,
    },
    /// Inspect Responses.
    Responses {
        #[command(subcommand)]
        action: ResponsesCmd,
    },
    /// Inspect and resolve Errors.
    Errors {
        #[command(subcommand)]
        action: ErrorsCmd,
    },
    /// Inspect and export Results.
    Results {
        #[command(subcommand)]
        action: ResultsCmd,
    },
    /// Requeue a single Request or all Requests on a continuation.
    Requeue {
        #[command(subcommand)]
        action: RequeueCmd,
    },
    /// Integrity checks and debugger views.
    Doctor {
        #[command(subcommand)]
        action: DoctorCmd,
    },
    /// Compression dictionary lifecycle.
    Compression {
        #[command(subcommand)]
        action: CompressionCmd,
    },
}

#[derive(Subcommand, Debug)]
pub enum RequestsCmd {
    /// List Requests, optionally filtered by status/continuation.
    List {
        #[arg(long, value_enum)]
        status: Option<CliRequestStatus>,
        #[arg(long)]
        continuation: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Show one Request by id.
    Show { id: i64 },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliRequestStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Held,
}

impl From<CliRequestStatus> for RequestStatus {
    fn from(v: CliRequestStatus) -> Self {
        match v {
            CliRequestStatus::Pending => RequestStatus::Pending,
            CliRequestStatus::InProgress => RequestStatus::InProgress,
            CliRequestStatus::Completed => RequestStatus::Completed,
            CliRequestStatus::Failed => RequestStatus::Failed,
            CliRequestStatus::Held => RequestStatus::Held,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum ResponsesCmd {
    /// List Responses for a continuation.
    List {
        #[arg(long)]
        continuation: String,
    },
    /// Show one Response's metadata by request id.
    Show { request_id: i64 },
    /// Print a Response's decompressed body to stdout.
    Content { request_id: i64 },
}

#[derive(Subcommand, Debug)]
pub enum ErrorsCmd {
    /// List Errors, optionally filtered by type / unresolved-only.
    List {
        #[arg(long, value_enum)]
        error_type: Option<CliErrorType>,
        #[arg(long, default_value_t = false)]
        unresolved_only: bool,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Show one Error by id.
    Show { id: i64 },
    /// Mark an Error resolved.
    Resolve {
        id: i64,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Requeue every Request whose most recent unresolved error matches a type.
    Requeue {
        #[arg(long, value_enum)]
        error_type: CliErrorType,
        #[arg(long, default_value_t = false)]
        clear_downstream: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum CliErrorType {
    Xpath,
    Validation,
    Transient,
    Assumption,
    Fatal,
}

impl From<CliErrorType> for ErrorType {
    fn from(v: CliErrorType) -> Self {
        match v {
            CliErrorType::Xpath => ErrorType::Xpath,
            CliErrorType::Validation => ErrorType::Validation,
            CliErrorType::Transient => ErrorType::Transient,
            CliErrorType::Assumption => ErrorType::Assumption,
            CliErrorType::Fatal => ErrorType::Fatal,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum ResultsCmd {
    /// List Results, optionally filtered by type / invalid-only.
    List {
        #[arg(long)]
        result_type: Option<String>,
        #[arg(long, default_value_t = false)]
        only_invalid: bool,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Show one Result by id.
    Show { id: i64 },
    /// Export Results in bulk.
    Export {
        #[arg(long, value_enum, default_value_t = ExportFormat::Jsonl)]
        format: ExportFormat,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ExportFormat {
    Jsonl,
    Warc,
}

#[derive(Subcommand, Debug)]
pub enum RequeueCmd {
    /// Requeue a single Request by id.
    Request {
        id: i64,
        #[arg(long, default_value_t = false)]
        clear_downstream: bool,
    },
    /// Requeue every currently-failed Request on a continuation.
    Continuation {
        name: String,
        #[arg(long, default_value_t = false)]
        clear_downstream: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum DoctorCmd {
    /// Summary stats: queue depth, throughput, compression, results, errors, speculation.
    Health,
    /// Completed Requests without a Response, and orphaned Responses.
    Orphans,
    /// Completed Requests with no descendants and no Result.
    Ghosts,
    /// Stored Estimates checked against actual subtree yield.
    Estimates,
    /// Requests still pending/in-progress.
    Pending,
    /// A Request and its full descendant subtree.
    Tree { id: i64 },
    /// Per-continuation counts at every status.
    Funnel,
}

#[derive(Subcommand, Debug)]
pub enum CompressionCmd {
    /// Train a fresh dictionary for a continuation.
    Train {
        continuation: String,
        /// Maximum number of responses to sample for training.
        #[arg(long, default_value_t = codec::DEFAULT_SAMPLE_LIMIT)]
        sample_limit: i64,
        /// Size in bytes of the trained dictionary.
        #[arg(long, default_value_t = codec::DEFAULT_DICT_SIZE)]
        dict_size: usize,
    },
    /// Recompress every response for a continuation against a dictionary.
    Recompress {
        continuation: String,
        /// Dictionary id to recompress against; defaults to the continuation's latest.
        #[arg(long)]
        dict_id: Option<i64>,
        /// zstd compression level to re-encode at.
        #[arg(long, default_value_t = 3)]
        level: i32,
    },
    /// Compression ratio per continuation.
    Stats,
}

/// Entry point called from `main.rs`.
pub async fn run(cli: Cli) -> Result<()> {
    let store = Store::open(&cli.db).await.context("opening database")?;

    match cli.command {
        Command::Requests { action } => run_requests(&store, cli.format, action).await,
        Command::Responses { action } => run_responses(&store, cli.format, action).await,
        Command::Errors { action } => run_errors(&store, cli.format, action).await,
        Command::Results { action } => run_results(&store, cli.format, action).await,
        Command::Requeue { action } => run_requeue(&store, cli.format, action).await,
        Command::Doctor { action } => run_doctor(&store, cli.format, action).await,
        Command::Compression { action } => run_compression(&store, cli.format, action).await,
    }
}

async fn run_requests(store: &Store, format: OutputFormat, action: RequestsCmd) -> Result<()> {
    match action {
        RequestsCmd::List { status, continuation, limit } => {
            let rows = store
                .list_requests(status.map(Into::into), continuation.as_deref(), limit)
                .await?;
            render(format, &rows, |r| {
                format!("{}\t{}\t{}\t{}", r.id, r.status.as_str(), r.continuation, r.url)
            })
        }
        RequestsCmd::Show { id } => {
            let row = store
                .get_request(id)
                .await?
                .ok_or_else(|| anyhow!("request {id} not found"))?;
            render_one(format, &row, |r| format!("{r:#?}"))
        }
    }
}

async fn run_responses(store: &Store, format: OutputFormat, action: ResponsesCmd) -> Result<()> {
    match action {
        ResponsesCmd::List { continuation } => {
            let rows = store.responses_for_continuation(&continuation).await?;
            render(format, &rows, |r| {
                format!("{}\t{}\t{}B", r.request_id, r.status_code, r.content_size_original)
            })
        }
        ResponsesCmd::Show { request_id } => {
            let row = store
                .get_response(request_id)
                .await?
                .ok_or_else(|| anyhow!("response for request {request_id} not found"))?;
            render_one(format, &row, |r| format!("{r:#?}"))
        }
        ResponsesCmd::Content { request_id } => {
            let row = store
                .get_response(request_id)
                .await?
                .ok_or_else(|| anyhow!("response for request {request_id} not found"))?;
            let body = codec::decompress_response(store, &row.content_compressed, row.compression_dict_id)
                .await?;
            print!("{}", String::from_utf8_lossy(&body));
            Ok(())
        }
    }
}

async fn run_errors(store: &Store, format: OutputFormat, action: ErrorsCmd) -> Result<()> {
    match action {
        ErrorsCmd::List { error_type, unresolved_only, limit } => {
            let rows = store
                .list_errors(error_type.map(Into::into), unresolved_only, limit)
                .await?;
            render(format, &rows, |r| {
                format!("{}\t{}\t{}\t{}", r.id, r.error_type.as_str(), r.is_resolved, r.message)
            })
        }
        ErrorsCmd::Show { id } => {
            let rows = store.list_errors(None, false, i64::MAX).await?;
            let row = rows
                .into_iter()
                .find(|e| e.id == id)
                .ok_or_else(|| anyhow!("error {id} not found"))?;
            render_one(format, &row, |r| format!("{r:#?}"))
        }
        ErrorsCmd::Resolve { id, notes } => {
            store.resolve_error(id, notes.as_deref()).await?;
            println!("resolved error {id}");
            Ok(())
        }
        ErrorsCmd::Requeue { error_type, clear_downstream } => {
            let ids = store.request_ids_with_unresolved_error(error_type.into()).await?;
            let mut requeued = 0;
            for id in ids {
                store.requeue_request(id, clear_downstream).await?;
                requeued += 1;
            }
            println!("requeued {requeued} request(s)");
            Ok(())
        }
    }
}

async fn run_results(store: &Store, format: OutputFormat, action: ResultsCmd) -> Result<()> {
    match action {
        ResultsCmd::List { result_type, only_invalid, limit } => {
            let rows = store.list_results(result_type.as_deref(), only_invalid, limit).await?;
            render(format, &rows, |r| {
                format!("{}\t{}\t{}", r.id, r.result_type, r.is_valid)
            })
        }
        ResultsCmd::Show { id } => {
            let row = store
                .get_result(id)
                .await?
                .ok_or_else(|| anyhow!("result {id} not found"))?;
            render_one(format, &row, |r| format!("{r:#?}"))
        }
        ResultsCmd::Export { format: export_format } => match export_format {
            ExportFormat::Jsonl => {
                print!("{}", store.export_results_jsonl().await?);
                Ok(())
            }
            ExportFormat::Warc => Err(crate::warc::WarcError::NotImplemented.into()),
        },
    }
}

async fn run_requeue(store: &Store, _format: OutputFormat, action: RequeueCmd) -> Result<()> {
    match action {
        RequeueCmd::Request { id, clear_downstream } => {
            let new_id = store.requeue_request(id, clear_downstream).await?;
            println!("requeued request {id} as {new_id}");
            Ok(())
        }
        RequeueCmd::Continuation { name, clear_downstream } => {
            let failed = store
                .list_requests(Some(RequestStatus::Failed), Some(&name), i64::MAX)
                .await?;
            let mut requeued = 0;
            for request in &failed {
                store.requeue_request(request.id, clear_downstream).await?;
                requeued += 1;
            }
            println!("requeued {requeued} request(s) on continuation {name}");
            Ok(())
        }
    }
}

async fn run_doctor(store: &Store, format: OutputFormat, action: DoctorCmd) -> Result<()> {
    match action {
        DoctorCmd::Health => {
            let stats = integrity::summary_stats(store, crate::clock::now_nanos()).await?;
            render_one(format, &stats, |s| format!("{s:#?}"))
        }
        DoctorCmd::Orphans => {
            let report = integrity::check_orphans(store).await?;
            render_one(format, &report, |r| format!("{r:#?}"))
        }
        DoctorCmd::Ghosts => {
            let ghosts = integrity::check_ghosts(store).await?;
            render(format, &ghosts, |g| format!("{}\t{}", g.request_id, g.continuation))
        }
        DoctorCmd::Estimates => {
            let checks = integrity::check_estimates(store).await?;
            render(format, &checks, |c| {
                format!("{}\t{}\t{}", c.estimate_id, c.actual_count, c.passed)
            })
        }
        DoctorCmd::Pending => {
            let rows = store.list_requests(Some(RequestStatus::Pending), None, i64::MAX).await?;
            render(format, &rows, |r| format!("{}\t{}\t{}", r.id, r.continuation, r.url))
        }
        DoctorCmd::Tree { id } => {
            let nodes = integrity::request_tree(store, id).await?;
            render(format, &nodes, |n| {
                format!("{}{} #{} [{}] {}", "  ".repeat(n.depth as usize), n.continuation, n.id, n.status, n.result_count)
            })
        }
        DoctorCmd::Funnel => {
            let rows = integrity::funnel(store).await?;
            render(format, &rows, |r| {
                format!(
                    "{}\tpending={}\tin_progress={}\tcompleted={}\tfailed={}\theld={}",
                    r.continuation, r.pending, r.in_progress, r.completed, r.failed, r.held
                )
            })
        }
    }
}

async fn run_compression(store: &Store, format: OutputFormat, action: CompressionCmd) -> Result<()> {
    match action {
        CompressionCmd::Train { continuation, sample_limit, dict_size } => {
            let dict = codec::train(store, &continuation, sample_limit, dict_size).await?;
            println!(
                "trained dictionary v{} for {} ({} samples)",
                dict.version, dict.continuation, dict.sample_count
            );
            Ok(())
        }
        CompressionCmd::Recompress { continuation, dict_id, level } => {
            let (count, original_bytes, compressed_bytes) =
                codec::recompress(store, &continuation, level, dict_id).await?;
            println!("recompressed {count} response(s): {original_bytes}B -> {compressed_bytes}B");
            Ok(())
        }
        CompressionCmd::Stats => {
            let rows = store.compression_stats().await?;
            render(format, &rows, |r| {
                format!("{}\t{}B -> {}B", r.continuation, r.bytes_original, r.bytes_compressed)
            })
        }
    }
}

fn render<T: Serialize>(format: OutputFormat, rows: &[T], table_row: impl Fn(&T) -> String) -> Result<()> {
    match format {
        OutputFormat::Table => {
            for row in rows {
                println!("{}", table_row(row));
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(rows)?),
        OutputFormat::Jsonl => {
            for row in rows {
                println!("{}", serde_json::to_string(row)?);
            }
        }
    }
    Ok(())
}

fn render_one<T: Serialize>(format: OutputFormat, row: &T, table_row: impl Fn(&T) -> String) -> Result<()> {
    match format {
        OutputFormat::Table => println!("{}", table_row(row)),
        OutputFormat::Json | OutputFormat::Jsonl => println!("{}", serde_json::to_string_pretty(row)?),
    }
    Ok(())
}
