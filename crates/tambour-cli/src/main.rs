//! Tambour CLI - EMB embroidery to Tajima DST
#![allow(clippy::collapsible_if)]

mod config;
mod errors;

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};
use config::Config;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tambour_core::{
    BatchItem, ConversionOutput, ConversionRequest, DesignMetadata, Diagnostic, EmbLayout,
    JobInput, JobOutcome, JobRunner, OutputTarget, RunnerConfig, convert_batch, derive, dst, emb,
};
use tracing_subscriber::{
    EnvFilter, Registry, layer::SubscriberExt, reload, util::SubscriberInitExt,
};

/// Collect `.emb` files from patterns, directories, and globs.
///
/// When `recursive` is true, directories are walked recursively. Files named
/// explicitly are kept whatever their extension.
fn collect_files(patterns: Vec<String>, recursive: bool, v: Verbosity) -> Vec<String> {
    let mut files = Vec::new();

    for pattern in patterns {
        let path = PathBuf::from(&pattern);

        if path.is_dir() {
            let depth = if recursive { usize::MAX } else { 1 };
            for entry in walkdir::WalkDir::new(&path)
                .max_depth(depth)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                let file_path = entry.path().to_string_lossy().to_string();
                if is_emb(&file_path) {
                    files.push(file_path);
                }
            }
        } else if pattern.contains('*') || pattern.contains('?') || pattern.contains('[') {
            files.extend(expand_glob_pattern(&pattern, v));
        } else {
            files.push(pattern);
        }
    }

    files.sort();
    files.dedup();
    files
}

fn is_emb(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("emb"))
}

/// Expand a single glob pattern.
fn expand_glob_pattern(pattern: &str, v: Verbosity) -> Vec<String> {
    let mut files = Vec::new();

    match glob::glob(pattern) {
        Ok(paths) => {
            for entry in paths.flatten() {
                if entry.is_file() {
                    files.push(entry.to_string_lossy().to_string());
                }
            }
            if files.is_empty() {
                v.info(&format!("Warning: pattern '{}' matched no files", pattern));
            }
        }
        Err(e) => {
            v.info(&format!(
                "Warning: invalid glob pattern '{}': {}",
                pattern, e
            ));
        }
    }

    files
}

/// Output verbosity level.
#[derive(Clone, Copy)]
enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Verbosity {
    fn from_flags(verbose: bool, quiet: bool) -> Self {
        if quiet {
            Verbosity::Quiet
        } else if verbose {
            Verbosity::Verbose
        } else {
            Verbosity::Normal
        }
    }

    /// Default log filter when `RUST_LOG` is unset. Decode diagnostics are
    /// printed as part of the report, so core warnings stay quiet by default.
    fn log_filter(self) -> &'static str {
        match self {
            Verbosity::Quiet => "error",
            Verbosity::Normal => "tambour_core=error,warn",
            Verbosity::Verbose => "tambour_core=debug,info",
        }
    }

    fn info(self, msg: &str) {
        if !matches!(self, Verbosity::Quiet) {
            println!("{msg}");
        }
    }

    fn debug(self, msg: &str) {
        if matches!(self, Verbosity::Verbose) {
            println!("[debug] {msg}");
        }
    }

    fn warn(self, msg: &str) {
        if !matches!(self, Verbosity::Quiet) {
            eprintln!("{msg}");
        }
    }
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Logs go to stderr so reports on stdout stay machine-readable.
///
/// Returns a handle for adjusting the filter once the config is loaded, or
/// `None` when `RUST_LOG` fixes it.
fn init_logging(v: Verbosity) -> Option<FilterHandle> {
    let from_env = EnvFilter::try_from_default_env().ok();
    let pinned = from_env.is_some();
    let (filter, handle) =
        reload::Layer::new(from_env.unwrap_or_else(|| EnvFilter::new(v.log_filter())));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();

    (!pinned).then_some(handle)
}

#[derive(Parser)]
#[command(name = "tambour")]
#[command(version)]
#[command(about = "Convert EMB embroidery designs to Tajima DST", long_about = None)]
struct Cli {
    /// Verbose output (show job transitions and debug info)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet output (only errors)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to config file (default: ~/.config/tambour/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert EMB file(s) to DST
    Convert {
        /// Input file(s), directories or glob patterns
        #[arg(required = true)]
        input: Vec<String>,
        /// Output file (single input only; default: input with a .dst extension)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Output directory for batch conversions
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Recursively process directories
        #[arg(short = 'r', long)]
        recursive: bool,
        /// Layout profile name or layout file (TOML, YAML or JSON)
        #[arg(long)]
        layout: Option<String>,
        /// Design label written to the DST header (default: input file stem)
        #[arg(long)]
        label: Option<String>,
        /// Read each written DST back and check it against its header
        #[arg(long)]
        verify: bool,
    },

    /// Show design metadata for an EMB file
    Info {
        /// Input file
        input: PathBuf,
        /// Print a JSON report
        #[arg(long)]
        json: bool,
        /// Layout profile name or layout file
        #[arg(long)]
        layout: Option<String>,
    },

    /// Print a resolved layout profile
    Layout {
        /// Profile name or layout file (default: the configured default)
        name: Option<String>,
        /// Output format
        #[arg(long, default_value = "toml")]
        format: LayoutFormat,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },

    /// Generate man page
    Manpage,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum LayoutFormat {
    Toml,
    Yaml,
    Json,
}

impl LayoutFormat {
    fn as_str(self) -> &'static str {
        match self {
            LayoutFormat::Toml => "toml",
            LayoutFormat::Yaml => "yaml",
            LayoutFormat::Json => "json",
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let verbose_flag = cli.verbose;
    let quiet_flag = cli.quiet;
    let log_filter = init_logging(Verbosity::from_flags(verbose_flag, quiet_flag));

    // Load config file
    let config = if let Some(ref path) = cli.config {
        Config::load_from_path(Some(path.clone()))
    } else {
        Config::load()
    };

    // Apply config defaults, CLI flags override
    let verbose = verbose_flag || config.defaults.verbose;
    let quiet = quiet_flag || config.defaults.quiet;
    let verbosity = Verbosity::from_flags(verbose, quiet);
    if let Some(handle) = log_filter {
        if let Err(e) = handle.reload(EnvFilter::new(verbosity.log_filter())) {
            verbosity.warn(&format!("Warning: could not apply log level from config: {e}"));
        }
    }

    match cli.command {
        Commands::Convert {
            input,
            output,
            output_dir,
            recursive,
            layout,
            label,
            verify,
        } => {
            let layout = config.resolve_layout(layout.as_deref())?;
            let files = collect_files(input, recursive, verbosity);
            if files.is_empty() {
                bail!("No input files found");
            }
            let verify = verify || config.defaults.verify;

            if files.len() > 1 || output_dir.is_some() {
                if output.is_some() {
                    bail!("--output takes a single input. Use --output-dir for batch conversion.");
                }
                let out_dir = output_dir.context("Batch conversion requires --output-dir")?;
                cmd_convert_batch(files, &out_dir, layout, label, verify, verbosity)
            } else {
                let input = PathBuf::from(&files[0]);
                let output = output.unwrap_or_else(|| input.with_extension("dst"));
                cmd_convert(&config, &input, output, layout, label, verify, verbosity)
            }
        }
        Commands::Info {
            input,
            json,
            layout,
        } => {
            let layout = config.resolve_layout(layout.as_deref())?;
            cmd_info(&input, &layout, json)
        }
        Commands::Layout { name, format } => {
            let layout = config.resolve_layout(name.as_deref())?;
            let bytes = layout.to_bytes(format.as_str())?;
            print!("{}", String::from_utf8_lossy(&bytes));
            Ok(())
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "tambour", &mut std::io::stdout());
            Ok(())
        }
        Commands::Manpage => {
            let cmd = Cli::command();
            let man = clap_mangen::Man::new(cmd);
            man.render(&mut std::io::stdout())?;
            Ok(())
        }
    }
}

fn display(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Convert one file through a job runner, reporting transitions as they happen.
fn cmd_convert(
    config: &Config,
    input: &Path,
    output: PathBuf,
    layout: EmbLayout,
    label: Option<String>,
    verify: bool,
    v: Verbosity,
) -> Result<()> {
    let bytes = std::fs::read(input)
        .map_err(|e| anyhow::anyhow!(errors::file_read_error(&display(input), &e)))?;

    let runner = JobRunner::new(RunnerConfig {
        admission: config.defaults.admission,
        layout: Arc::new(layout),
        on_transition: None,
    });

    let label = label.or_else(|| {
        input
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
    });
    let mut request = ConversionRequest::new(bytes).with_target(OutputTarget::File(output.clone()));
    if let Some(label) = label {
        request = request.with_label(label);
    }

    let handle = runner
        .submit(request)
        .map_err(|e| anyhow::anyhow!(errors::runner_error_message(&e)))?;
    v.debug(&format!("{} submitted for {}", handle.id(), display(input)));

    // The channel closes once the job is terminal.
    for transition in runner.subscribe(&handle) {
        v.debug(&format!(
            "{}: {} -> {}",
            transition.id, transition.from, transition.to
        ));
    }

    let outcome = runner.wait(&handle);
    match outcome.as_ref() {
        JobOutcome::Succeeded(result) => {
            report_diagnostics(&display(input), &result.diagnostics, v);
            if verify {
                verify_output(&result.bytes)
                    .with_context(|| format!("Verification of '{}' failed", output.display()))?;
                v.debug("verified DST against its header");
            }
            v.info(&format!(
                "{} -> {} ({} stitches, {} records)",
                display(input),
                output.display(),
                result.metadata.stitch_count,
                result.records
            ));
            Ok(())
        }
        JobOutcome::Failed(err) => bail!(errors::job_failure_message(&display(input), err)),
        JobOutcome::Cancelled { during } => {
            bail!("Conversion of '{}' was cancelled while {}", display(input), during)
        }
    }
}

/// Convert many files independently; one failure does not stop the rest.
fn cmd_convert_batch(
    files: Vec<String>,
    out_dir: &Path,
    layout: EmbLayout,
    label: Option<String>,
    verify: bool,
    v: Verbosity,
) -> Result<()> {
    std::fs::create_dir_all(out_dir).context("Failed to create output directory")?;

    let items: Vec<BatchItem> = files
        .iter()
        .map(|file| {
            let input = PathBuf::from(file);
            let stem = input
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("output");
            let target = OutputTarget::File(out_dir.join(format!("{stem}.dst")));
            BatchItem {
                label: label.clone(),
                ..BatchItem::new(JobInput::File(input), target)
            }
        })
        .collect();

    let pb = if !matches!(v, Verbosity::Quiet) {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("Converting {} files", files.len()));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        Some(pb)
    } else {
        None
    };

    let results = convert_batch(items, &layout);

    if let Some(pb) = pb {
        pb.finish_and_clear();
    }

    let mut failed = 0;
    for (file, result) in files.iter().zip(&results) {
        match result {
            Ok(output) => {
                report_diagnostics(file, &output.diagnostics, v);
                if verify {
                    if let Err(e) = verify_output(&output.bytes) {
                        failed += 1;
                        eprintln!("Verification of '{}' failed: {:#}", file, e);
                        continue;
                    }
                }
                v.debug(&format!("{} -> {}", file, describe_target(output)));
            }
            Err(JobOutcome::Failed(err)) => {
                failed += 1;
                eprintln!("{}", errors::job_failure_message(file, err));
            }
            Err(other) => {
                failed += 1;
                eprintln!("Conversion of '{}' ended {}", file, other.state());
            }
        }
    }

    v.info(&format!(
        "Converted {} of {} files to {}",
        files.len() - failed,
        files.len(),
        out_dir.display()
    ));
    if failed > 0 {
        bail!("{} of {} conversions failed", failed, files.len());
    }
    Ok(())
}

fn describe_target(output: &ConversionOutput) -> String {
    output
        .path
        .as_deref()
        .map(display)
        .unwrap_or_else(|| "memory".to_string())
}

fn report_diagnostics(input: &str, diagnostics: &[Diagnostic], v: Verbosity) {
    for line in errors::diagnostic_lines(input, diagnostics) {
        v.warn(&line);
    }
}

/// Replay a DST stream and check the needle path against its header.
fn verify_output(bytes: &[u8]) -> Result<()> {
    let replay = dst::replay(bytes)?;
    let header = &replay.header;

    if header.record_count != replay.records.len() {
        bail!(
            "header declares {} records, stream has {}",
            header.record_count,
            replay.records.len()
        );
    }
    if header.end != replay.end {
        bail!(
            "header ends at {:?}, needle ends at {:?}",
            header.end,
            replay.end
        );
    }
    if header.extents != replay.extents {
        bail!(
            "header extents {:?} differ from replayed {:?}",
            header.extents,
            replay.extents
        );
    }
    Ok(())
}

#[derive(Serialize)]
struct InfoReport<'a> {
    file: String,
    metadata: &'a DesignMetadata,
    header: &'a emb::EmbHeader,
    diagnostics: &'a [Diagnostic],
    skipped: &'a [emb::SkippedRegion],
}

fn cmd_info(input: &Path, layout: &EmbLayout, json: bool) -> Result<()> {
    let bytes = std::fs::read(input)
        .map_err(|e| anyhow::anyhow!(errors::file_read_error(&display(input), &e)))?;
    let decoded = emb::decode(&bytes, layout)
        .with_context(|| format!("Failed to decode '{}'", input.display()))?;
    let metadata = derive(&decoded.design);

    if json {
        let report = InfoReport {
            file: display(input),
            metadata: &metadata,
            header: &decoded.header,
            diagnostics: &decoded.diagnostics,
            skipped: &decoded.skipped,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("File:         {}", input.display());
    println!("Version:      {}", decoded.header.version);
    println!("{}", metadata);
    if !decoded.skipped.is_empty() {
        println!("Skipped:");
        for region in &decoded.skipped {
            let name = match (&region.name, region.tag) {
                (Some(name), _) => name.clone(),
                (None, Some(tag)) => format!("tag {:#010x}", tag),
                (None, None) => "vendor header".to_string(),
            };
            println!("  {} ({} bytes at {})", name, region.len, region.offset);
        }
    }
    for line in errors::diagnostic_lines(&display(input), &decoded.diagnostics) {
        println!("{line}");
    }
    Ok(())
}
