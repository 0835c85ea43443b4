mod commands;
mod logging;
mod progress;

use std::io::{self, Write};
use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser};
use colored::*;
use commands::{Cli, Commands, PlanArgs, RootArgs};
use dotenv::dotenv;
use progress::CliReporter;
use reshelve_core::engine::configured_roots;
use reshelve_core::plan::chunk::ApprovalToken;
use reshelve_core::plan::DuplicateMode;
use reshelve_core::{AppConfig, OrganizeEngine, RunReport, UndoSelection};
use tracing::{error, info, warn};

fn main() {
    dotenv().ok();

    let _guard = logging::init_logger();

    let config = match reshelve_core::config::load_configuration() {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            process::exit(1);
        }
    };

    let args = Cli::parse();

    let result = match args.command {
        Some(Commands::Plan { args, json }) => run_plan(&config, &args, json),
        Some(Commands::Run {
            args,
            dry_run,
            approvals,
        }) => run_organize(&config, &args, dry_run, &approvals, false),
        Some(Commands::Approve { args, tokens }) => run_organize(&config, &args, false, &tokens, true),
        Some(Commands::Undo { root, run, from, to }) => run_undo(&config, &root, run, from, to),
        Some(Commands::Report { root, run_id, list }) => run_report(&config, &root, run_id, list),
        Some(Commands::Recover { root }) => run_recover(&config, &root),
        Some(Commands::Extract { root, archives }) => run_extract(&config, &root, &archives),
        Some(Commands::Purge { root, before, yes }) => run_purge(&config, &root, before, yes),
        Some(Commands::PrintConfig) => print_config(&config),
        None => {
            let _ = Cli::command().print_long_help();
            Ok(())
        }
    };

    if let Err(err) = result {
        error!("Error: {:#}", err);
        process::exit(1);
    }
}

fn resolve_root(config: &AppConfig, args: &RootArgs) -> Result<PathBuf> {
    if let Some(root) = &args.root {
        return Ok(root.clone());
    }
    let roots = configured_roots(config);
    if roots.len() > 1 {
        warn!("Several roots configured; using {}", roots[0].display());
    }
    roots
        .into_iter()
        .next()
        .context("No organize root given; pass --root or set root_paths")
}

fn build_engine(config: &AppConfig, args: &PlanArgs) -> Result<OrganizeEngine> {
    let root = resolve_root(config, &args.root)?;
    let mut engine = OrganizeEngine::new(config.clone(), &root)
        .with_context(|| format!("Cannot organize {}", root.display()))?;
    if let Some(decisions) = &args.decisions {
        engine = engine.with_decisions(decisions);
    }
    if args.delete_duplicates {
        engine = engine.with_duplicate_mode(DuplicateMode::Delete);
    }
    Ok(engine)
}

fn run_plan(config: &AppConfig, args: &PlanArgs, json: bool) -> Result<()> {
    let engine = build_engine(config, args)?;
    let outcome = engine.plan(&CliReporter::new())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome.plan)?);
        return Ok(());
    }

    println!();
    for chunk in &outcome.plan.chunks {
        let marker = if chunk.requires_approval {
            "needs approval".yellow()
        } else {
            "ready".green()
        };
        println!(
            "{} ({} steps, {} bytes) {}",
            chunk.id.bold(),
            chunk.len(),
            chunk.total_bytes(),
            marker
        );
        for step in &chunk.steps {
            println!(
                "    {:<18} {} -> {}",
                step.kind.to_string(),
                step.source.display(),
                step.destination.display()
            );
        }
    }
    print_summary(&outcome.report);
    Ok(())
}

fn run_organize(
    config: &AppConfig,
    args: &PlanArgs,
    dry_run: bool,
    raw_tokens: &[String],
    approved_only: bool,
) -> Result<()> {
    let mut config = config.clone();
    config.dry_run |= dry_run;

    let mut tokens = Vec::with_capacity(raw_tokens.len());
    for raw in raw_tokens {
        match ApprovalToken::parse(raw) {
            Some(token) => tokens.push(token),
            None => bail!("Malformed approval token '{}'; expected <chunk id>:<digest>", raw),
        }
    }

    let engine = build_engine(&config, args)?
        .with_approvals(tokens)
        .approved_only(approved_only);
    let report = engine.run(&CliReporter::new())?;
    print_summary(&report);
    Ok(())
}

fn run_undo(
    config: &AppConfig,
    args: &RootArgs,
    run: Option<String>,
    from: Option<u64>,
    to: Option<u64>,
) -> Result<()> {
    let root = resolve_root(config, args)?;
    let engine = OrganizeEngine::new(config.clone(), &root)?;
    let selection = match (run, from, to) {
        (Some(run_id), _, _) => UndoSelection::Run(run_id),
        (None, Some(from), Some(to)) => {
            if from > to {
                bail!("--from {} is after --to {}", from, to);
            }
            UndoSelection::Range(from..=to)
        }
        _ => UndoSelection::LastRun,
    };

    match engine.undo(selection) {
        Ok(report) => {
            info!(
                "Reverted {} entries ({} already undone)",
                format!("{}", report.reverted.len()).green(),
                report.already_undone.len()
            );
            Ok(())
        }
        Err(reshelve_core::Error::UndoConflict {
            seq,
            reason,
            reverted,
        }) => {
            error!(
                "Undo stopped at #{}: {} ({} entries reverted before the stop)",
                format!("{}", seq).red(),
                reason,
                reverted.len()
            );
            process::exit(2);
        }
        Err(e) => Err(e.into()),
    }
}

fn run_report(config: &AppConfig, args: &RootArgs, run_id: Option<String>, list: bool) -> Result<()> {
    let root = resolve_root(config, args)?;
    let engine = OrganizeEngine::new(config.clone(), &root)?;

    if list {
        let (runs, total) = engine.runs(0, 50)?;
        println!("{} runs recorded", total);
        for run in runs {
            println!(
                "{}  {:<10} {} files  started {}",
                run.run_id.bold(),
                run.status,
                run.files_scanned,
                run.started_at
            );
        }
        return Ok(());
    }

    match engine.report(run_id.as_deref())? {
        Some(report) => println!("{}", report.to_json()?),
        None => println!("No run report recorded for {}", root.display()),
    }
    Ok(())
}

fn run_recover(config: &AppConfig, args: &RootArgs) -> Result<()> {
    let root = resolve_root(config, args)?;
    let engine = OrganizeEngine::new(config.clone(), &root)?;
    let outcomes = engine.recover()?;
    if outcomes.is_empty() {
        info!("Journal is consistent; nothing to recover");
    }
    println!("{}", serde_json::to_string_pretty(&outcomes)?);
    if outcomes.iter().any(|o| o.is_unresolved()) {
        error!("Some intents need manual attention");
        process::exit(2);
    }
    Ok(())
}

fn run_extract(config: &AppConfig, args: &RootArgs, archives: &[PathBuf]) -> Result<()> {
    let root = resolve_root(config, args)?;
    let engine = OrganizeEngine::new(config.clone(), &root)?;
    for archive in archives {
        let report = engine
            .extract(archive)
            .with_context(|| format!("Extracting {}", archive.display()))?;
        info!(
            "{} -> {}: {} files ({} new, {} rejected, {} collisions)",
            report.archive_name,
            report.destination.display(),
            format!("{}", report.file_count).green(),
            report.extracted.len(),
            report.rejected.len(),
            format!("{}", report.collisions.len()).red()
        );
    }
    Ok(())
}

fn run_purge(config: &AppConfig, args: &RootArgs, before: u64, yes: bool) -> Result<()> {
    let root = resolve_root(config, args)?;
    if !yes {
        let prompt = format!(
            "Purge journal history below #{}? Deleted duplicates it covers become unrecoverable",
            before
        );
        if !prompt_confirm(&prompt, Some(false))? {
            return Ok(());
        }
    }
    let engine = OrganizeEngine::new(config.clone(), &root)?;
    let summary = engine.purge(before)?;
    info!(
        "Purged {} entries and {} graveyard files",
        summary.entries_removed, summary.blobs_removed
    );
    Ok(())
}

fn print_config(config: &AppConfig) -> Result<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

fn print_summary(report: &RunReport) {
    println!();
    info!(
        "{} files scanned ({} bytes), {} quarantined",
        format!("{}", report.files_scanned).green(),
        report.bytes_scanned,
        format!("{}", report.quarantined.len()).yellow(),
    );
    info!(
        "{} duplicate groups, {} duplicate files, {} relocated, {} bytes reclaimable",
        format!("{}", report.duplicates.groups).red(),
        format!("{}", report.duplicates.duplicate_files).red(),
        report.duplicates.relocated,
        report.duplicates.reclaimable_bytes,
    );
    for (folder, count) in &report.moves_by_destination {
        info!("  {} -> {}", format!("{}", count).cyan(), folder);
    }
    for refusal in &report.refusals {
        warn!("Refused {}: {}", refusal.path.display(), refusal.reason);
    }
    for chunk in &report.withheld {
        warn!(
            "{} withheld ({} steps, confidence {:.2}); approve with: {}",
            chunk.chunk_id.yellow(),
            chunk.steps,
            chunk.lowest_confidence,
            chunk.token
        );
    }
    for failure in report.errors.iter().filter(|e| !e.surfaced) {
        error!("{} {}: {}", failure.kind, failure.path.display(), failure.error);
    }
    for outcome in report.reconciled.iter().filter(|o| o.is_unresolved()) {
        error!("Unresolved journal intent: {:?}", outcome);
    }
    if let Some((first, last)) = report.journal_range {
        info!("Journal entries #{}..=#{}", first, last);
    }
    if report.cancelled {
        warn!("Run was cancelled; committed steps remain in the journal");
    }
}

fn prompt_confirm(prompt: &str, default: Option<bool>) -> io::Result<bool> {
    let mut input = String::new();

    loop {
        input.clear();

        match default {
            Some(true) => print!("{} (Y/n): ", prompt),
            Some(false) | None => print!("{} (y/N): ", prompt),
        }
        io::stdout().flush()?;

        io::stdin().read_line(&mut input)?;

        match input.trim().to_uppercase().as_str() {
            "Y" => return Ok(true),
            "N" => return Ok(false),
            "" => match default {
                Some(default) => return Ok(default),
                None => continue,
            },
            _ => continue,
        }
    }
}
