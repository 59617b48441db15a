//! CLI for kohl

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use kohl::cli_support::{HeadlessPrompt, JsonMetadataSource};
use kohl::config::{FileConfig, Settings};
use kohl::render::MarkdownRenderer;
use kohl::{
    BookOutcome, CancelToken, CommentStyle, Engine, EnginePorts, RandomUid, SystemClock,
};

#[derive(Parser)]
#[command(name = "kohl", version, about = "Sync e-reader highlights into Markdown notes")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Vault root directory
    #[arg(long, global = true, env = "KOHL_VAULT")]
    pub vault: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import highlights from a source directory containing books.json
    Import {
        /// Resolved source directory (device mount or copied dump)
        source: PathBuf,
        /// Re-process sources even when unchanged
        #[arg(long)]
        force: bool,
        /// Managed folder override (relative to the vault)
        #[arg(long)]
        folder: Option<PathBuf>,
        /// Tracking comment style: html, md, or none
        #[arg(long)]
        comment_style: Option<String>,
        /// Parallel books (clamped to CPU count)
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Rewrite tracking comments across the managed folder
    ConvertComments {
        /// Target style: html, md, or none
        style: String,
        #[arg(long)]
        folder: Option<PathBuf>,
    },
    /// Forget import-source state so every source re-processes
    ResetStatus,
    /// Show index state and counts
    Status,
}

fn resolve_settings(
    vault: &PathBuf,
    folder: Option<PathBuf>,
    comment_style: Option<String>,
    concurrency: Option<usize>,
) -> Result<Settings> {
    let vault = dunce::canonicalize(vault)
        .with_context(|| format!("vault not found: {}", vault.display()))?;

    let mut file = FileConfig::load(&vault);
    if let Some(folder) = folder {
        file.managed_folder = Some(folder);
    }
    if let Some(style) = comment_style {
        file.comment_style = Some(style);
    }
    if let Some(n) = concurrency {
        file.concurrency = Some(n);
    }

    // Relative managed folders are anchored at the vault; the vault root
    // itself is a supported (if collision-prone) choice.
    let managed = file
        .managed_folder
        .take()
        .map(|f| if f.is_absolute() { f } else { vault.join(f) })
        .unwrap_or_else(|| vault.clone());

    let defaults = Settings {
        managed_folder: managed,
        data_dir: vault.join(".kohl"),
        ..Settings::default()
    };
    Ok(file.into_settings(defaults)?)
}

fn cancel_on_ctrlc() -> CancelToken {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::warn!("interrupt received, finishing in-flight writes");
        token.cancel();
    }) {
        tracing::debug!(error = %e, "could not install interrupt handler");
    }
    cancel
}

async fn build_engine(settings: Settings) -> Result<Engine> {
    Ok(Engine::new(
        settings,
        EnginePorts {
            renderer: Arc::new(MarkdownRenderer),
            prompts: Arc::new(HeadlessPrompt),
            clock: Arc::new(SystemClock),
            ids: Arc::new(RandomUid),
        },
    )
    .await?)
}

pub fn run_with(cli: Cli) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("tokio runtime")?;
    runtime.block_on(run_async(cli))
}

async fn run_async(cli: Cli) -> Result<()> {
    let vault = cli
        .vault
        .clone()
        .or_else(|| std::env::current_dir().ok())
        .context("no vault directory")?;

    match cli.command {
        Command::Import {
            source,
            force,
            folder,
            comment_style,
            concurrency,
        } => {
            let settings = resolve_settings(&vault, folder, comment_style, concurrency)?;
            let engine = build_engine(settings).await?;
            let cancel = cancel_on_ctrlc();
            let source = JsonMetadataSource::new(&source);

            let summary = engine
                .import_all_with(&source, force, &cancel, None)
                .await?;

            println!(
                "created {}, merged {}, auto-merged {}, skipped {}, failed {}",
                summary.created,
                summary.merged,
                summary.auto_merged,
                summary.skipped,
                summary.failed
            );
            for report in &summary.per_book {
                for warning in &report.warnings {
                    println!("  warning: {}: {warning}", report.source_path.display());
                }
                if let BookOutcome::Failed = report.outcome {
                    println!(
                        "  failed: {}: {}",
                        report.source_path.display(),
                        report.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            engine.shutdown().await?;
            if summary.failed > 0 {
                bail!("{} book(s) failed to import", summary.failed);
            }
            Ok(())
        }
        Command::ConvertComments { style, folder } => {
            let target: CommentStyle = style
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
            let settings = resolve_settings(&vault, folder, None, None)?;
            let engine = build_engine(settings).await?;
            let cancel = cancel_on_ctrlc();
            let report = engine.convert_comment_style(target, &cancel).await?;
            println!("converted {}, skipped {}", report.converted, report.skipped);
            engine.shutdown().await?;
            Ok(())
        }
        Command::ResetStatus => {
            let settings = resolve_settings(&vault, None, None, None)?;
            let engine = build_engine(settings).await?;
            engine.reset_import_status().await?;
            println!("import status cleared");
            Ok(())
        }
        Command::Status => {
            let settings = resolve_settings(&vault, None, None, None)?;
            let engine = build_engine(settings).await?;
            let status = engine.status().await?;
            println!("index: {:?} (rebuild: {:?})", status.index_state, status.rebuild_phase);
            println!(
                "books: {}, notes: {}, sources: {}",
                status.books, status.note_instances, status.import_sources
            );
            println!(
                "last run: {}",
                status.last_run_at.as_deref().unwrap_or("never")
            );
            Ok(())
        }
    }
}
