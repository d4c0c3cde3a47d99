use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dialoguer::Confirm;
use leafcull::config::{EngineConfig, Stages};
use leafcull::core::history::{CullAction, History, RestoreSelection};
use leafcull::core::report::{CleanupReport, total};
use leafcull::core::scanner::{CleanupPlan, DuplicateGroup};
use leafcull::core::{CategoryLabel, Executor, RemovalMode, ScannerService};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(
    name = "leafcull",
    version,
    about = "Remove duplicate and rotation-padded images from a leaf-disease dataset"
)]
struct Cli {
    /// Config file (default: `<config dir>/leafcull/config.json`)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Count images per category and check the directory layout
    Stats {
        /// Dataset root
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        #[command(flatten)]
        tuning: Tuning,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// List what a cleanup would remove, without touching anything
    Scan {
        /// Dataset root
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        #[command(flatten)]
        stages: StageFlags,
        #[command(flatten)]
        tuning: Tuning,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Remove exact duplicates, near duplicates and corner artifacts
    Clean {
        /// Dataset root
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        #[command(flatten)]
        removal: RemovalFlags,
        #[command(flatten)]
        stages: StageFlags,
        #[command(flatten)]
        tuning: Tuning,
    },

    /// Only look for images with black rotation-padding corners
    Corners {
        /// Dataset root
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        #[command(flatten)]
        removal: RemovalFlags,
        #[command(flatten)]
        tuning: Tuning,
    },

    /// Work with cleanup history
    History {
        #[command(subcommand)]
        command: HistoryCmd,
    },
}

#[derive(Subcommand, Debug)]
enum HistoryCmd {
    /// List all history records
    List {
        /// Dataset root
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
    },

    /// Move quarantined files back
    Restore {
        /// Dataset root
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        /// Index among `moved` records (default: latest)
        #[arg(long, conflicts_with = "all")]
        record: Option<usize>,
        /// Restore every `moved` record
        #[arg(long)]
        all: bool,
    },
}

#[derive(Args, Debug)]
struct RemovalFlags {
    /// Only show what would be removed
    #[arg(long)]
    dry_run: bool,
    /// Skip the confirmation prompt
    #[arg(short, long)]
    yes: bool,
    /// Move files into DIR (relative to the root; default `duplicates`) instead of deleting
    #[arg(long, value_name = "DIR", num_args = 0..=1, default_missing_value = "duplicates")]
    quarantine: Option<String>,
    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct StageFlags {
    /// Skip byte-identical duplicate detection
    #[arg(long)]
    skip_exact: bool,
    /// Skip perceptual near-duplicate detection
    #[arg(long)]
    skip_near: bool,
    /// Skip the black-corner check
    #[arg(long)]
    skip_corners: bool,
}

impl StageFlags {
    fn apply(&self, config: &mut EngineConfig) {
        config.stages.exact &= !self.skip_exact;
        config.stages.near &= !self.skip_near;
        config.stages.corners &= !self.skip_corners;
    }
}

/// Overrides for values from the config file.
#[derive(Args, Debug)]
struct Tuning {
    /// Fingerprint side length (k² bits)
    #[arg(long)]
    hash_size: Option<u32>,
    /// Maximum Hamming distance for near duplicates
    #[arg(long)]
    threshold: Option<u32>,
    /// Categories with fewer images are protected
    #[arg(long)]
    min_count: Option<usize>,
    /// Corner triangle leg length in pixels
    #[arg(long)]
    corner_size: Option<u32>,
    /// Darkness threshold per channel (0-255)
    #[arg(long)]
    darkness: Option<u8>,
    /// Fraction of dark pixels that makes a corner black
    #[arg(long)]
    dark_ratio: Option<f32>,
    /// Worker threads (0 = one per core)
    #[arg(long)]
    workers: Option<usize>,
    /// Reuse analysis results cached under the root
    #[arg(long)]
    cache: bool,
    /// Hide progress bars
    #[arg(long)]
    no_progress: bool,
}

impl Tuning {
    fn apply(&self, config: &mut EngineConfig) {
        if let Some(v) = self.hash_size {
            config.hash_size = v;
        }
        if let Some(v) = self.threshold {
            config.threshold = v;
        }
        if let Some(v) = self.min_count {
            config.min_count = v;
        }
        if let Some(v) = self.corner_size {
            config.corners.sample_size = v;
        }
        if let Some(v) = self.darkness {
            config.corners.darkness_threshold = v;
        }
        if let Some(v) = self.dark_ratio {
            config.corners.dark_ratio = v;
        }
        if let Some(v) = self.workers {
            config.workers = v;
        }
        config.use_cache |= self.cache;
        config.show_progress &= !self.no_progress;
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = EngineConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Stats { path, tuning, json } => {
            tuning.apply(&mut config);
            let scanner = ScannerService::new(config)?;
            let survey = scanner
                .survey(&path)
                .with_context(|| format!("Failed to survey {}", path.display()))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&survey)?);
                return Ok(());
            }
            println!("📁 {} image(s) in {}", survey.total, path.display());
            for (label, count) in &survey.counts {
                let marker = if survey.protected.contains(label) { " 🛡️  protected" } else { "" };
                println!("   {:<16} {:>7}{}", label.to_string(), count, marker);
            }
            for missing in &survey.layout.missing {
                eprintln!("⚠️  Expected directory missing: {}", missing);
            }
        }

        Commands::Scan {
            path,
            stages,
            tuning,
            json,
        } => {
            tuning.apply(&mut config);
            stages.apply(&mut config);
            let scanner = build_scanner(config)?;
            let plan = plan_cleanup(&scanner, &path)?;
            let report = Executor::for_scanner(&scanner, RemovalMode::DryRun).execute(&plan);

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_groups(&plan);
                print_report(&report);
            }
        }

        Commands::Clean {
            path,
            removal,
            stages,
            tuning,
        } => {
            tuning.apply(&mut config);
            stages.apply(&mut config);
            run_cleanup(config, &path, &removal)?;
        }

        Commands::Corners {
            path,
            removal,
            tuning,
        } => {
            tuning.apply(&mut config);
            config.stages = Stages::corners_only();
            run_cleanup(config, &path, &removal)?;
        }

        Commands::History { command } => match command {
            HistoryCmd::List { path } => {
                let history = History::at(&path);
                let records = history
                    .load()
                    .with_context(|| format!("Could not read history file {:?}", history.path()))?;
                if records.is_empty() {
                    println!("No history recorded in {}", path.display());
                    return Ok(());
                }

                println!("🗂️  Cleanup History:");
                let mut moved_index = 0;
                for rec in &records {
                    // Restore indices count moved records only.
                    let tag = match rec.action {
                        CullAction::Moved => {
                            moved_index += 1;
                            format!("[{}]", moved_index - 1)
                        }
                        CullAction::Deleted => "[-]".to_string(),
                    };
                    println!(
                        "{} {} ({})\n     kept: {}\n     action: {:?}",
                        tag,
                        rec.timestamp,
                        rec.reason,
                        rec.retained.as_deref().unwrap_or("-"),
                        rec.action
                    );
                    for file in &rec.culled {
                        match &file.stored {
                            Some(stored) => println!("     culled: {} → {}", file.original, stored),
                            None => println!("     culled: {}", file.original),
                        }
                    }
                    println!();
                }
            }

            HistoryCmd::Restore { path, record, all } => {
                let selection = match (all, record) {
                    (true, _) => RestoreSelection::All,
                    (false, Some(index)) => RestoreSelection::Index(index),
                    (false, None) => RestoreSelection::Latest,
                };
                let summary = History::at(&path)
                    .restore(selection)
                    .context("Failed to restore from history")?;

                println!(
                    "🔄 Restored {} file(s) from {} record(s)",
                    summary.restored, summary.records
                );
                if summary.skipped > 0 {
                    eprintln!("⚠️  Skipped {} file(s); see log for details", summary.skipped);
                }
            }
        },
    }

    Ok(())
}

/// Build the scanner and hook Ctrl-C up to its cancellation token.
fn build_scanner(config: EngineConfig) -> Result<ScannerService> {
    let scanner = ScannerService::new(config).context("Invalid configuration")?;
    let token = scanner.get_cancellation_token();
    ctrlc::set_handler(move || {
        token.store(true, Ordering::SeqCst);
    })
    .context("Failed to install Ctrl-C handler")?;
    Ok(scanner)
}

fn plan_cleanup(scanner: &ScannerService, path: &Path) -> Result<CleanupPlan> {
    println!("▶ Scanning: {}", path.display());
    benchmark("planning", || scanner.plan(path))
        .with_context(|| format!("Failed to scan {}", path.display()))
}

fn run_cleanup(mut config: EngineConfig, path: &Path, removal: &RemovalFlags) -> Result<()> {
    if let Some(dir) = &removal.quarantine {
        config.quarantine_dir = dir.clone();
    }
    let scanner = build_scanner(config)?;
    let plan = plan_cleanup(&scanner, path)?;

    let mode = if removal.dry_run {
        RemovalMode::DryRun
    } else if removal.quarantine.is_some() {
        RemovalMode::Quarantine(scanner.quarantine_root(path))
    } else {
        RemovalMode::Delete
    };

    if plan.marked() == 0 {
        println!("No files to remove.");
    } else if mode != RemovalMode::DryRun && !removal.yes {
        let verb = match &mode {
            RemovalMode::Quarantine(dir) => format!("Move {} file(s) into {}?", plan.marked(), dir.display()),
            _ => format!("Permanently delete {} file(s)?", plan.marked()),
        };
        let confirmed = Confirm::new().with_prompt(verb).default(false).interact()?;
        if !confirmed {
            println!("Aborted; nothing was changed.");
            return Ok(());
        }
    }

    let executor = Executor::for_scanner(&scanner, mode);
    let report = benchmark("removal", || executor.execute(&plan));

    if removal.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
        if !report.dry_run && report.removed > 0 {
            println!("\n✅ Recorded cleanup history in {}", History::at(path).path().display());
        }
    }
    Ok(())
}

fn print_groups(plan: &CleanupPlan) {
    let print = |title: &str, groups: Vec<&DuplicateGroup>| {
        if groups.is_empty() {
            return;
        }
        println!("Found {} {} group(s):", groups.len(), title);
        for (i, group) in groups.iter().enumerate() {
            println!(" Group {}:", i + 1);
            for &member in &group.members {
                let mark = if member == group.keep { "✔" } else { "✖" };
                println!("   {} {}", mark, plan.path(member).display());
            }
        }
    };
    print("exact duplicate", plan.exact_groups().collect());
    print("near-duplicate", plan.near_groups().collect());

    if !plan.corner_artifacts.is_empty() {
        println!("Found {} image(s) with black corners:", plan.corner_artifacts.len());
        for &index in &plan.corner_artifacts {
            println!("   ▶ {}", plan.path(index).display());
        }
    }
}

fn print_report(report: &CleanupReport) {
    let heading = if report.dry_run { "📋 Dry run" } else { "📊 Summary" };
    println!("\n{} for {}", heading, report.root.display());
    println!("   Scanned: {}", report.total_scanned);
    if !report.protected_categories.is_empty() {
        let names: Vec<String> = report.protected_categories.iter().map(|c| c.to_string()).collect();
        println!("   🛡️  Protected: {}", names.join(", "));
    }

    println!("   {:<16} {:>7} {:>7}", "Category", "Before", "After");
    for label in CategoryLabel::ALL {
        let before = report.before.get(&label).copied().unwrap_or(0);
        if before == 0 {
            continue;
        }
        let after = report.after.get(&label).copied().unwrap_or(0);
        println!("   {:<16} {:>7} {:>7}", label.to_string(), before, after);
    }

    println!(
        "   Exact duplicates: {} in {} group(s)",
        total(&report.exact_duplicates),
        report.exact_groups
    );
    println!(
        "   Near duplicates:  {} in {} group(s)",
        total(&report.near_duplicates),
        report.near_groups
    );
    println!("   Corner artifacts: {}", total(&report.corner_artifacts));
    if report.protected_survivors > 0 {
        println!("   Survivor chosen by protection in {} group(s)", report.protected_survivors);
    }

    if report.dry_run {
        println!("   Would remove: {}", report.marked);
    } else {
        println!(
            "   Removed: {} of {} attempted ({} marked)",
            report.removed, report.attempted, report.marked
        );
    }
    if report.cancelled {
        println!("   ⛔ Cancelled before finishing");
    }
    if !report.failures.is_empty() {
        eprintln!("⚠️  {} file(s) had problems:", report.failures.len());
        for failure in &report.failures {
            eprintln!("   {:?} {}: {}", failure.phase, failure.path.display(), failure.message);
        }
    }
}

/// Run `f()`, print how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    println!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}
