//! Offline commands over stored snapshots, packages and configuration.

mod error;

use crate::error::{ErrorKind, Result};
use clap::{Parser, Subcommand, ValueEnum};
use depotsync_config::Config;
use depotsync_depot::Revision;
use depotsync_engine::consistency::{Classification, classify_tree};
use depotsync_engine::labels::{Verdict, best_match, load_candidates, match_against};
use depotsync_engine::package::{self, ScriptKind};
use depotsync_engine::{BatchLimits, Options, Snapshot, batch, diff};
use exn::ResultExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "depotsync", version, about = "Resilient depot sync, reconcile and changeset packaging")]
struct Cli {
    /// Configuration file merged over the platform defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// More log output; repeat for trace.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Only log warnings and errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compare two stored snapshots.
    Diff {
        a: PathBuf,
        b: PathBuf,
        /// Print the paths in every class, not just the counts.
        #[arg(long)]
        list: bool,
    },
    /// Match a stored have snapshot against the stored label snapshots.
    MatchLabel {
        have: PathBuf,
        /// Directory of label snapshots; defaults to the settings directory.
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Show what a changeset package contains.
    Inspect {
        package: PathBuf,
        /// Print one of the packaged transfer scripts.
        #[arg(long, value_enum)]
        script: Option<Script>,
    },
    /// Check a local folder against a stored snapshot.
    Check {
        snapshot: PathBuf,
        local_dir: PathBuf,
        /// Compare content digests as well as sizes.
        #[arg(long)]
        checksums: bool,
    },
    /// Show the batches a stored snapshot would be synced in.
    PlanBatches {
        snapshot: PathBuf,
        #[arg(long)]
        max_count: Option<usize>,
        #[arg(long)]
        max_size_kb: Option<u64>,
    },
    /// Print the effective configuration.
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum Script {
    Bat,
    Bash,
}
impl From<Script> for ScriptKind {
    fn from(script: Script) -> Self {
        match script {
            Script::Bat => ScriptKind::Bat,
            Script::Bash => ScriptKind::Bash,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %&*e, "Command failed");
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        },
    }
}

/// Flags win over `RUST_LOG`, which wins over the `info` default.
fn init_tracing(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => Some("warn"),
        (false, 0) => None,
        (false, 1) => Some("debug"),
        (false, _) => Some("trace"),
    };
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref()).or_raise(|| ErrorKind::Config)?;
    match cli.command {
        Command::Diff { a, b, list } => diff_snapshots(&a, &b, list),
        Command::MatchLabel { have, dir } => match_label(&have, &dir.unwrap_or_else(|| config.settings_dir())),
        Command::Inspect { package, script } => inspect(&package, script),
        Command::Check { snapshot, local_dir, checksums } => check(&snapshot, &local_dir, checksums),
        Command::PlanBatches { snapshot, max_count, max_size_kb } => {
            let defaults = Options::from(&config).limits;
            let limits = BatchLimits {
                max_count: max_count.unwrap_or(defaults.max_count),
                max_size_kb: max_size_kb.unwrap_or(defaults.max_size_kb),
            };
            plan_batches(&snapshot, limits)
        },
        Command::Config => {
            let json = serde_json::to_string_pretty(&config).or_raise(|| ErrorKind::Output)?;
            println!("{json}");
            Ok(())
        },
    }
}

fn load(path: &Path) -> Result<Snapshot> {
    Snapshot::load(path).or_raise(|| ErrorKind::Read(path.to_path_buf()))
}

fn diff_snapshots(a: &Path, b: &Path, list: bool) -> Result<()> {
    let a = load(a)?;
    let b = load(b)?;
    let b = match a.branch_root == b.branch_root {
        true => b,
        false => b.remap(&a.branch_root),
    };
    let d = diff(&a, &b);
    println!("{} {} -> {} {}", a.branch_root, a.revision, b.branch_root, b.revision);
    for (class, paths) in [
        ("unchanged", &d.identical),
        ("new", &d.new_files),
        ("deleted", &d.deleted_files),
        ("updated", &d.differing),
    ] {
        println!("{class}: {}", paths.len());
        if list {
            for path in paths {
                println!("  {path}");
            }
        }
    }
    Ok(())
}

fn match_label(have: &Path, dir: &Path) -> Result<()> {
    let have = load(have)?;
    let candidates = load_candidates(dir, &have.branch_root).or_raise(|| ErrorKind::Read(dir.to_path_buf()))?;
    let matches = match_against(&have, &candidates);
    if matches.is_empty() {
        println!("No stored labels for {} in {}", have.branch_root, dir.display());
        return Ok(());
    }
    for m in &matches {
        match m.verdict {
            Verdict::Rejected { missing, extra } => {
                println!("{}: rejected, {missing} files missing, {extra} extra", m.label);
            },
            Verdict::Compared { matching, differing } => {
                println!("{}: {matching} matching, {differing} differing", m.label);
            },
        }
    }
    if let Some(best) = best_match(&matches) {
        let kind = if best.is_full_match() { "full" } else { "closest" };
        println!("{kind} match: {}", best.label);
    }
    Ok(())
}

fn inspect(archive: &Path, script: Option<Script>) -> Result<()> {
    let contents = package::open(archive).or_raise(|| ErrorKind::Read(archive.to_path_buf()))?;
    if let Some(script) = script {
        let text = match script {
            Script::Bat => contents.bat,
            Script::Bash => contents.bash,
        };
        match text {
            Some(text) => print!("{text}"),
            None => println!("Package has no `{}` entry", ScriptKind::from(script).entry_name()),
        }
        return Ok(());
    }

    let snapshot = &contents.snapshot;
    println!("{} {}", snapshot.branch_root, snapshot.revision);
    if !snapshot.description.is_empty() {
        println!("{}", snapshot.description.trim_end());
    }
    let plan = package::classify(snapshot, &Snapshot::new(&snapshot.branch_root, &Revision::Have, ""), true);
    for (class, paths) in [("delete", &plan.files_to_delete), ("add", &plan.files_to_add), ("edit", &plan.files_to_edit)]
    {
        for path in paths {
            println!("{class:>6} {path}");
        }
    }
    println!("{} archived entries", contents.entries.len());
    Ok(())
}

fn check(snapshot: &Path, local_dir: &Path, checksums: bool) -> Result<()> {
    let snapshot = load(snapshot)?;
    let report = classify_tree(&snapshot, local_dir, checksums).or_raise(|| ErrorKind::Check(local_dir.to_path_buf()))?;
    for classification in [
        Classification::Missing,
        Classification::Corrupt,
        Classification::WritableOverride,
        Classification::Extra,
    ] {
        for path in report.bucket(classification) {
            println!("{:>9} {path}", classification.to_string());
        }
    }
    for skipped in &report.skipped {
        println!("  skipped {} ({})", skipped.path, skipped.reason);
    }
    println!(
        "{} good, {} missing, {} corrupt, {} writable, {} extra",
        report.good.len(),
        report.missing.len(),
        report.corrupt.len(),
        report.writable_override.len(),
        report.extra.len()
    );
    Ok(())
}

fn plan_batches(snapshot: &Path, limits: BatchLimits) -> Result<()> {
    let snapshot = load(snapshot)?;
    let paths: Vec<String> = snapshot.paths().cloned().collect();
    let batches = batch::plan(&paths, |p| snapshot.size_kb(p), limits);
    for (index, batch) in batches.iter().enumerate() {
        println!("batch {}: {} files, {} KB", index + 1, batch.len(), batch.size_kb);
    }
    println!("{} files in {} batches", paths.len(), batches.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use rstest::rstest;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[rstest]
    #[case(&["depotsync", "diff", "a.revisions", "b.revisions", "--list"])]
    #[case(&["depotsync", "match-label", "have.revisions", "--dir", "labels"])]
    #[case(&["depotsync", "inspect", "change.zip", "--script", "bash"])]
    #[case(&["depotsync", "-vv", "check", "s.revisions", "local", "--checksums"])]
    #[case(&["depotsync", "plan-batches", "s.revisions", "--max-count", "10"])]
    #[case(&["depotsync", "config", "-q"])]
    fn test_parses(#[case] args: &[&str]) {
        assert!(Cli::try_parse_from(args).is_ok());
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["depotsync", "-q", "-v", "config"]).is_err());
    }

    #[test]
    fn test_diff_and_plan_over_stored_snapshots() {
        use depotsync_depot::{FileKind, FileRecord};
        let dir = tempfile::tempdir().unwrap();
        let a = Snapshot::new("//depot/main/", &Revision::label("v1"), "")
            .with_records([FileRecord::new("//depot/main/a", FileKind::Text).with_size(1).with_digest("A")]);
        let b = Snapshot::new("//depot/main/", &Revision::label("v2"), "")
            .with_records([FileRecord::new("//depot/main/b", FileKind::Text).with_size(1).with_digest("B")]);
        let a = a.save(dir.path()).unwrap();
        let b = b.save(dir.path()).unwrap();

        assert!(diff_snapshots(&a, &b, true).is_ok());
        assert!(plan_batches(&b, BatchLimits::default()).is_ok());
        assert!(match_label(&a, dir.path()).is_ok());
        assert!(load(&dir.path().join("missing.revisions")).is_err());
    }
}
