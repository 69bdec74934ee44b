//! CLI entry point for the mirror tool.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, bail};
use clap::Parser;
use mirror_core::import::{DeferredQueue, DuplicatePolicy, ImportOutcome};
use mirror_core::store::NewSourceGroup;
use mirror_core::{
    CredentialVault, Credentials, Database, ImportContext, ImportSummary, Mirror, MirrorConfig,
    SystemClock,
};
use tracing::{debug, info, warn};

mod app_config;
mod cli;

use app_config::{FileConfig, load_file_config, resolve_default_data_dir};
use cli::{Args, Command, GroupsCommand, ImportArgs};

const DATA_DIR_ENV: &str = "MIRROR_DATA_DIR";
const DATABASE_FILE: &str = "mirror.db";

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (warn)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let loaded = load_file_config(args.config.as_deref())?;
    if let Some(path) = &loaded.path {
        debug!(path = %path.display(), loaded = loaded.config.is_some(), "config file");
    }
    let file_config = loaded.config.unwrap_or_default();

    let data_dir = resolve_data_dir(args.data_dir.as_deref(), &file_config);
    let mut config = MirrorConfig::rooted_at(&data_dir);
    file_config.apply(&mut config);
    if let Some(secs) = args.max_execution_secs {
        config.execution_ceiling = (secs > 0).then_some(Duration::from_secs(secs));
    }

    tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("Failed to create data directory '{}'", data_dir.display()))?;
    let db_path = data_dir.join(DATABASE_FILE);
    let db = Database::new_with_options(&db_path, file_config.database_options())
        .await
        .context("Failed to open database")?;
    let vault = CredentialVault::load_default()?;
    let mirror = Mirror::open(config, db, vault, Arc::new(SystemClock)).await?;
    info!(data_dir = %data_dir.display(), "mirror starting");

    run(&mirror, args.command).await
}

fn resolve_data_dir(flag: Option<&Path>, file_config: &FileConfig) -> PathBuf {
    if let Some(dir) = flag {
        return dir.to_path_buf();
    }
    if let Some(dir) = env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    file_config
        .data_dir
        .clone()
        .unwrap_or_else(resolve_default_data_dir)
}

async fn run(mirror: &Mirror, command: Command) -> Result<()> {
    match command {
        Command::Import(args) => run_import(mirror, args).await,
        Command::Sync { group_id } => {
            let outcome = mirror.reconciler.sync_group(group_id).await?;
            println!(
                "group {}: listed {}, imported {}, skipped {}, failed {}, deleted {}",
                outcome.group_id,
                outcome.listed,
                outcome.imported,
                outcome.skipped,
                outcome.failed,
                outcome.deleted.len()
            );
            if outcome.deferred {
                println!("pass deferred: run `mirror resume-deferred` to finish");
            }
            if outcome.aborted {
                bail!("sync of group {group_id} aborted: listing failed or was empty");
            }
            Ok(())
        }
        Command::Groups(GroupsCommand::Add {
            name,
            url,
            delete_unused,
            interval_secs,
            login,
            password,
        }) => {
            let credentials = credentials_from(login, password);
            let sealed = mirror.vault.seal(credentials.as_ref())?;
            let group = mirror
                .store
                .create_group(&NewSourceGroup {
                    name: &name,
                    url: &url,
                    credentials: sealed.as_deref(),
                    delete_unused,
                    interval_secs,
                })
                .await?;
            println!("group {} {} {}", group.id, group.name, group.url);
            Ok(())
        }
        Command::Groups(GroupsCommand::List { due }) => {
            let groups = if due {
                mirror.reconciler.due_groups(SystemTime::now()).await?
            } else {
                mirror.store.list_groups().await?
            };
            for group in groups {
                let last = group
                    .last_synced_at
                    .map_or_else(|| "never".to_string(), |t| t.to_string());
                println!(
                    "{}\t{}\t{}\tdelete_unused={}\tlast_synced={last}",
                    group.id, group.name, group.url, group.delete_unused
                );
            }
            Ok(())
        }
        Command::Resolve { name, output } => {
            let mut response = mirror.cache.serve_by_name(&name).await?;
            if response.stale {
                warn!(name = %name, "serving stale cached copy");
            }
            match output {
                Some(path) => {
                    let mut file = tokio::fs::File::create(&path)
                        .await
                        .with_context(|| format!("Failed to create '{}'", path.display()))?;
                    tokio::io::copy(&mut response.body, &mut file).await?;
                    println!(
                        "{} ({}, {} bytes) -> {}",
                        name,
                        response.content_type,
                        response.content_length,
                        path.display()
                    );
                }
                None => {
                    let mut stdout = tokio::io::stdout();
                    tokio::io::copy(&mut response.body, &mut stdout).await?;
                }
            }
            Ok(())
        }
        Command::CheckAvailability => {
            let report = mirror.library.check_availability().await?;
            println!(
                "checked {}, available {}, unavailable {}",
                report.checked,
                report.available,
                report.unavailable.len()
            );
            for id in report.unavailable {
                println!("unavailable\t{id}");
            }
            Ok(())
        }
        Command::ResumeDeferred { limit } => {
            let reset = mirror.deferred.reset_in_progress().await?;
            if reset > 0 {
                info!(reset, "returned interrupted deferred batches to pending");
            }
            let mut resumed = 0;
            while resumed < limit {
                let mut ctx = ImportContext::user();
                let Some(summary) = mirror.pipeline.resume_deferred(&mut ctx).await? else {
                    break;
                };
                resumed += 1;
                print_summary(&summary);
            }
            println!("resumed {resumed} deferred batch(es)");
            Ok(())
        }
        Command::PurgeCache => {
            let removed = mirror.cache.purge().await?;
            println!("removed {removed} cached file(s)");
            Ok(())
        }
        Command::Delete { id } => {
            if !mirror.library.delete_resource(id).await? {
                bail!("resource {id} not found");
            }
            println!("deleted {id}");
            Ok(())
        }
        Command::Hosting { id, mode } => {
            let record = mirror.library.switch_hosting(id, mode.into()).await?;
            println!("{record}");
            Ok(())
        }
    }
}

async fn run_import(mirror: &Mirror, args: ImportArgs) -> Result<()> {
    let credentials = credentials_from(args.login, args.password);
    let mut ctx = ImportContext::user();
    if args.skip_existing {
        ctx = ctx.with_duplicates(DuplicatePolicy::Skip);
    }

    let (mut imported, mut failed) = (0, 0);
    loop {
        let summary = mirror
            .pipeline
            .import_with_context(&args.url, credentials.as_ref(), &mut ctx)
            .await?;
        print_summary(&summary);
        imported += summary.imported_count();
        failed += summary.failed_count();
        if summary.is_deferred() || !args.all_pages || ctx.cursor.is_none() {
            if !args.all_pages && ctx.cursor.is_some() {
                println!("more files available: rerun with --all-pages");
            }
            break;
        }
    }

    debug!(imported, failed, "import finished");
    if imported == 0 && failed > 0 {
        bail!("no files imported from {}", args.url);
    }
    Ok(())
}

fn print_summary(summary: &ImportSummary) {
    for result in &summary.results {
        match &result.outcome {
            ImportOutcome::Imported {
                record_id,
                storage_mode,
                ..
            } => println!("{}\t{}\t#{record_id}\t{storage_mode}", result.label(), result.url),
            ImportOutcome::Skipped { reason } => {
                println!("{}\t{}\t{reason}", result.label(), result.url);
            }
            ImportOutcome::Failed(failure) => {
                println!("{}\t{}\t{failure}", result.label(), result.url);
            }
        }
    }
    if let Some(handoff) = summary.deferred {
        println!(
            "deferred\t{} file(s)\tbatch #{}",
            handoff.remaining, handoff.batch_id
        );
    }
}

fn credentials_from(login: Option<String>, password: Option<String>) -> Option<Credentials> {
    match (login, password) {
        (Some(login), Some(password)) => Some(Credentials::new(login, password)),
        _ => None,
    }
}
