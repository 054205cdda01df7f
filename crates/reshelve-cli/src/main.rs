mod commands;
mod logging;
mod progress;

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser};
use colored::*;
use commands::{
    ApplyArgs, Cli, Commands, InvertArgs, PlanArgs, PlanModeArg, PlanSourceArgs, RunArgs,
    ScanArgs, ScanFilterArgs,
};
use dotenv::dotenv;
use progress::CliReporter;
use reshelve_core::advisor::{parse_rule_set, CommandAdvisor, FileAdvisor, RuleAdvisor};
use reshelve_core::plan::{self, PlanManifest, PlanReader};
use reshelve_core::rules::Rule;
use reshelve_core::scanner::NoEnrichment;
use reshelve_core::{
    AppConfig, ApplyOptions, Error, ExecutionReport, PlanOptions, ReshelveEngine,
};
use tracing::{error, info, warn};

const SAMPLE_MOVES: usize = 10;
const LISTED_FAILURES: usize = 20;

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

    let outcome = match args.command {
        Some(Commands::Scan(scan)) => run_scan(config, scan),
        Some(Commands::Plan(plan)) => run_plan(config, plan),
        Some(Commands::Apply(apply)) => run_apply(&ReshelveEngine::new(config), &apply),
        Some(Commands::Run(run)) => run_run(config, run),
        Some(Commands::Invert(invert)) => run_invert(config, invert),
        Some(Commands::PrintConfig) => {
            println!("Configuration: {:#?}", config);
            Ok(true)
        }
        None => {
            let _ = Cli::command().print_long_help();
            Ok(true)
        }
    };

    match outcome {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(err) => {
            error!("Error: {:#}", err);
            process::exit(1);
        }
    }
}

/// Every command returns whether it finished without unrecovered failures.
type CommandResult = anyhow::Result<bool>;

fn apply_filters(config: &mut AppConfig, filters: &ScanFilterArgs) {
    if let Some(min_size) = filters.min_size {
        config.min_size = min_size;
    }
    if filters.ext_include.is_some() {
        config.ext_include = filters.ext_include.clone();
    }
    if filters.ext_exclude.is_some() {
        config.ext_exclude = filters.ext_exclude.clone();
    }
    if filters.include_hidden {
        config.skip_hidden = false;
    }
}

fn apply_plan_source(config: &mut AppConfig, source: &PlanSourceArgs) {
    if let Some(delay) = source.delay {
        config.advisor.delay_secs = delay.max(0.0);
    }
    if source.advisor_cmd.is_some() {
        config.advisor.command = source.advisor_cmd.clone();
    }
}

fn run_scan(mut config: AppConfig, args: ScanArgs) -> CommandResult {
    apply_filters(&mut config, &args.filters);
    let engine = ReshelveEngine::new(config);
    scan_tree(&engine, &args.root, &args.output, &[])?;
    Ok(true)
}

fn scan_tree(
    engine: &ReshelveEngine,
    root: &Path,
    metadata: &Path,
    exclude: &[PathBuf],
) -> anyhow::Result<()> {
    let reporter = CliReporter::new();
    let result = engine.scan_excluding(root, metadata, exclude, &NoEnrichment, &reporter)?;

    println!();
    info!(
        "Scan: {}, Clusters: {}",
        format!("{:.2}s", result.scan_duration.as_secs_f64()).green(),
        format!("{:.2}s", result.cluster_duration.as_secs_f64()).green(),
    );
    info!(
        "{} files indexed ({} bytes), {} unreadable, {} filtered",
        format!("{}", result.total_files).cyan(),
        format!("{}", result.total_bytes).cyan(),
        format!("{}", result.skipped).yellow(),
        format!("{}", result.filtered).yellow(),
    );
    info!(
        "{} clusters detected, metadata written to {}",
        format!("{}", result.clusters).cyan(),
        result.metadata_path.display(),
    );
    Ok(())
}

fn run_plan(mut config: AppConfig, args: PlanArgs) -> CommandResult {
    apply_plan_source(&mut config, &args.source);
    let engine = ReshelveEngine::new(config);
    let manifest = build_plan(
        &engine,
        &args.metadata,
        &args.source,
        &args.output,
        args.allow_cross_device,
    )?;

    println!();
    print_manifest(&manifest);
    print_sample(&args.output)?;

    if args.auto {
        info!("Plan written to {}", args.output.display());
        return Ok(true);
    }
    if prompt_confirm("Apply this plan now?", Some(false))? {
        let apply = ApplyArgs {
            plan: args.output,
            root: None,
            dry_run: false,
            allow_cross_device: args.allow_cross_device,
            auto: true,
            undo_out: None,
            report_out: None,
            no_cleanup: false,
        };
        return run_apply(&engine, &apply);
    }
    info!(
        "Plan written to {}; run `reshelve apply {}` when ready",
        args.output.display(),
        args.output.display()
    );
    Ok(true)
}

fn build_plan(
    engine: &ReshelveEngine,
    metadata: &Path,
    source: &PlanSourceArgs,
    out: &Path,
    allow_cross_device: bool,
) -> anyhow::Result<PlanManifest> {
    let reporter = CliReporter::new();
    let options = PlanOptions {
        destination_root: source.dest.clone(),
        allow_cross_device,
    };
    let advisor_command = engine.config().advisor.command.clone();

    let manifest = match source.mode {
        PlanModeArg::Rules => {
            let rules = load_rules(engine, metadata, source, advisor_command.as_deref())?;
            if let Some(path) = &source.save_rules {
                let json = serde_json::to_string_pretty(&serde_json::json!({ "rules": rules }))?;
                fs::write(path, json)
                    .with_context(|| format!("writing rules to {}", path.display()))?;
                info!("Rules saved to {}", path.display());
            }
            engine.plan_rules(metadata, rules, out, &options, &reporter)?
        }
        PlanModeArg::Direct => {
            let advisor: Box<dyn RuleAdvisor> = match (&source.decisions, advisor_command) {
                (Some(path), _) => Box::new(FileAdvisor::new(path)),
                (None, Some(command)) => Box::new(CommandAdvisor::new(&command)?),
                (None, None) => bail!("direct mode needs --advisor-cmd or --decisions"),
            };
            engine.plan_direct(metadata, advisor.as_ref(), out, &options, &reporter)?
        }
    };
    Ok(manifest)
}

fn load_rules(
    engine: &ReshelveEngine,
    metadata: &Path,
    source: &PlanSourceArgs,
    advisor_command: Option<&str>,
) -> anyhow::Result<Vec<Rule>> {
    if let Some(path) = &source.rules {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading rules from {}", path.display()))?;
        return Ok(parse_rule_set(&text)?);
    }
    match advisor_command {
        Some(command) => {
            let advisor = CommandAdvisor::new(command)?;
            Ok(engine.design_rules(metadata, &advisor)?)
        }
        None => {
            warn!("No rules or advisor given; every file goes to the catch-all");
            Ok(Vec::new())
        }
    }
}

fn run_apply(engine: &ReshelveEngine, args: &ApplyArgs) -> CommandResult {
    let plan = PlanReader::open(&args.plan)?;
    if let Some(manifest) = plan.manifest()? {
        print_manifest(&manifest);
    }
    print_sample(&args.plan)?;

    if !args.dry_run
        && !args.auto
        && !prompt_confirm("Are you SURE you want to move these files?", Some(false))?
    {
        info!("Nothing was moved");
        return Ok(true);
    }

    let reporter = CliReporter::new();
    let options = ApplyOptions {
        dry_run: args.dry_run,
        allow_cross_device: args.allow_cross_device,
        undo_path: args.undo_out.clone(),
        cleanup: !args.no_cleanup,
        root: args.root.clone(),
    };
    let result = match engine.apply(&args.plan, &options, &reporter) {
        Ok(result) => result,
        Err(Error::UndoLogFailed { reason, report }) => {
            error!("Undo log unavailable, apply stopped: {}", reason);
            save_report(args.report_out.as_deref(), &report)?;
            print_report(&report, None);
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    };
    let report = &result.report;
    save_report(args.report_out.as_deref(), report)?;
    print_report(report, Some(result.duration.as_secs_f64()));
    if let Some(undo) = &result.undo_path {
        info!("Undo plan: {}", undo.display().to_string().cyan());
    }

    Ok(!report.has_failures())
}

fn run_run(mut config: AppConfig, args: RunArgs) -> CommandResult {
    apply_filters(&mut config, &args.filters);
    apply_plan_source(&mut config, &args.source);
    let engine = ReshelveEngine::new(config);

    let mut outputs = plan::artifact_paths(&args.plan_out);
    outputs.push(args.report_out.clone());
    outputs.extend(args.source.save_rules.clone());

    info!("Step 1: scanning {}", args.root.display());
    scan_tree(&engine, &args.root, &args.metadata_out, &outputs)?;

    if args.reuse_plan {
        if !args.plan_out.is_file() {
            bail!("no plan to reuse at {}", args.plan_out.display());
        }
        info!("Step 2: reusing plan {}", args.plan_out.display());
    } else {
        info!("Step 2: planning ({:?} mode)", args.source.mode);
        let manifest = build_plan(
            &engine,
            &args.metadata_out,
            &args.source,
            &args.plan_out,
            args.allow_cross_device,
        )?;
        if manifest.executable == 0 {
            info!("No moves in the plan, nothing to do");
            return Ok(true);
        }
    }

    info!("Step 3: applying {}", args.plan_out.display());
    let apply = ApplyArgs {
        plan: args.plan_out.clone(),
        root: Some(args.root.clone()),
        dry_run: args.dry_run,
        allow_cross_device: args.allow_cross_device,
        auto: args.auto,
        undo_out: None,
        report_out: Some(args.report_out.clone()),
        no_cleanup: args.no_cleanup,
    };
    let succeeded = run_apply(&engine, &apply)?;

    info!("Metadata: {}", args.metadata_out.display());
    info!("Plan:     {}", args.plan_out.display());
    info!("Report:   {}", args.report_out.display());
    if args.dry_run {
        info!("This was a dry run; run again without --dry-run to move files");
    }
    Ok(succeeded)
}

fn run_invert(config: AppConfig, args: InvertArgs) -> CommandResult {
    let out = args
        .output
        .unwrap_or_else(|| plan::undo_path(&args.plan));
    let written = ReshelveEngine::new(config).invert_plan(&args.plan, &out)?;
    info!(
        "{} inverse moves written to {}",
        format!("{}", written).cyan(),
        out.display()
    );
    Ok(true)
}

fn save_report(path: Option<&Path>, report: &ExecutionReport) -> anyhow::Result<()> {
    if let Some(path) = path {
        fs::write(path, serde_json::to_string_pretty(report)?)
            .with_context(|| format!("writing report to {}", path.display()))?;
    }
    Ok(())
}

fn print_report(report: &ExecutionReport, duration_secs: Option<f64>) {
    println!();
    info!(
        "{}{} moved, {} skipped, {} failed, {} blocked{}",
        if report.dry_run { "[dry run] " } else { "" },
        format!("{}", report.moved).green(),
        format!("{}", report.skipped_identical).yellow(),
        format!("{}", report.failed).red(),
        format!("{}", report.blocked).red(),
        duration_secs
            .map(|secs| format!(" in {}", format!("{:.2}s", secs).green()))
            .unwrap_or_default(),
    );
    if report.cleaned_directories > 0 {
        info!(
            "{} empty directories removed",
            format!("{}", report.cleaned_directories).cyan()
        );
    }
    for failure in report.failures.iter().take(LISTED_FAILURES) {
        warn!(
            "{} -> {}: {:?}",
            failure.record.source.display(),
            failure.record.final_destination.display(),
            failure.outcome
        );
    }
    if report.failures.len() > LISTED_FAILURES {
        warn!(
            "... and {} more; see the report for the full list",
            report.failures.len() - LISTED_FAILURES
        );
    }
}

fn print_manifest(manifest: &PlanManifest) {
    info!(
        "{} plan: {} -> {}",
        manifest.mode,
        manifest.root.display(),
        manifest.destination_root.display()
    );
    info!(
        "{} records, {} moves, {} blocked, {} collisions resolved, {} template errors",
        format!("{}", manifest.total_records).cyan(),
        format!("{}", manifest.executable).green(),
        format!("{}", manifest.blocked).red(),
        format!("{}", manifest.collisions_resolved).yellow(),
        format!("{}", manifest.template_errors).yellow(),
    );
}

fn print_sample(plan_path: &Path) -> anyhow::Result<()> {
    let plan = PlanReader::open(plan_path)?;
    for record in plan
        .records()?
        .filter_map(Result::ok)
        .filter(|r| !r.is_noop())
        .take(SAMPLE_MOVES)
    {
        println!(
            "  {} {} {} ({})",
            record.source.display(),
            "->".dimmed(),
            record.final_destination.display(),
            record.rule.dimmed()
        );
    }
    Ok(())
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

        if io::stdin().read_line(&mut input)? == 0 {
            return Ok(default.unwrap_or(false));
        }

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
