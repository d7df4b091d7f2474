//! # trackbench-cli
//!
//! Binary entry point for the trackbench harness.
//!
//! This crate provides:
//! - CLI argument parsing using `clap`
//! - Credential and configuration checks at startup
//! - Worker startup, suite execution, and cleanup
//! - Report and session-comparison output

use std::io::{stdout, IsTerminal};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, warn};

use trackbench_adapters::{api_key_from_env, ChatClient, WorkerSupervisor, API_KEY_ENV};
use trackbench_core::{
    run_suite, CaseSuite, ConversationPipeline, HarnessConfig, PipelineSettings, SessionTracker,
    SuiteOptions,
};

/// Color output mode for terminal display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
enum ColorMode {
    /// Automatically detect if stdout is a TTY
    #[default]
    Auto,
    /// Always use colors
    Always,
    /// Never use colors
    Never,
}

impl ColorMode {
    fn should_use_colors(self) -> bool {
        match self {
            ColorMode::Always => true,
            ColorMode::Never => false,
            ColorMode::Auto => stdout().is_terminal(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "trackbench",
    version,
    about = "Drive a DAW chat assistant through a scored test suite and track regressions"
)]
struct Args {
    /// Path to the harness configuration file
    #[arg(short, long, default_value = "trackbench.yml")]
    config: PathBuf,

    /// Case suite file (overrides the config's cases_file)
    #[arg(long)]
    cases: Option<PathBuf>,

    /// Tracking directory (overrides the config's tracking.dir)
    #[arg(long)]
    tracking_dir: Option<PathBuf>,

    /// Compare against a previous session: "auto", "off", or a session file path
    #[arg(long, default_value = "auto")]
    compare: String,

    /// Also write the flat per-run results file to this path
    #[arg(long)]
    results_file: Option<PathBuf>,

    /// Color output mode
    #[arg(long, value_enum, default_value_t = ColorMode::Auto)]
    color: ColorMode,

    /// Show per-case detail while running
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    // The bearer credential is the one startup condition with its own
    // exit path: without it neither service role can be reached.
    if api_key_from_env().is_none() {
        eprintln!("Error: {API_KEY_ENV} environment variable not set");
        eprintln!("Please set it with: export {API_KEY_ENV}=your-api-key");
        std::process::exit(1);
    }

    match run(args).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(args: Args) -> Result<i32> {
    let mut config = HarnessConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    if let Some(dir) = args.tracking_dir {
        config.tracking.dir = dir;
    }

    let cases_path = args.cases.unwrap_or_else(|| config.cases_path());
    let suite = CaseSuite::from_file(&cases_path)
        .with_context(|| format!("Failed to load case suite from {}", cases_path.display()))?;

    let system_prompt = config.system_prompt().context("Failed to read system prompt")?;
    let tools = config.tool_catalog().context("Failed to read tool catalog")?;

    // Checked before run(); read again for the client.
    let api_key = api_key_from_env().context("missing API credential")?;
    let chat = ChatClient::new(api_key, &config.chat.base_url);

    let use_colors = args.color.should_use_colors();
    banner(use_colors, &suite, &cases_path);

    let mut supervisor = WorkerSupervisor::new(config.worker.to_command());
    supervisor
        .start()
        .await
        .context("Failed to start tool worker")?;
    let channel = supervisor
        .take_channel()
        .context("Worker channel unavailable")?;

    let rpc_timeout = Duration::from_millis(config.pipeline.rpc_timeout_ms);
    if let Some(tool) = &config.worker.health_check_tool {
        // Best-effort probe; readiness detection alone is heuristic.
        match channel.call(tool, serde_json::json!({}), rpc_timeout).await {
            Ok(_) => info!(tool = %tool, "Worker health probe succeeded"),
            Err(e) => warn!(tool = %tool, "Worker health probe failed: {e}"),
        }
    }

    let settings = PipelineSettings {
        model: config.chat.model.clone(),
        eval_model: config.chat.eval_model.clone(),
        system_prompt,
        tools,
        rubric: config.pipeline.rubric.clone(),
        rpc_timeout,
    };
    let pipeline = ConversationPipeline::new(&chat, &channel, settings);

    let mut tracker = SessionTracker::new(&config.tracking.dir, &config.tracking.label);
    let options = SuiteOptions {
        inter_case_delay: Duration::from_millis(config.pipeline.inter_case_delay_ms),
        conversation_timeout: config
            .pipeline
            .conversation_timeout_secs
            .map(Duration::from_secs),
    };

    let bar = ProgressBar::new(suite.cases.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let interrupted = {
        let bar = &bar;
        let verbose = args.verbose;
        tokio::select! {
            () = run_suite(&pipeline, &suite.cases, &mut tracker, &options, |_, record| {
                let mark = if record.success { "ok" } else { "FAIL" };
                if verbose {
                    bar.println(format!(
                        "[{mark} {:.1}/10] \"{}\"",
                        record.avg_score, record.input
                    ));
                }
                bar.set_message(format!("{mark}: {}", record.input));
                bar.inc(1);
            }) => false,
            _ = tokio::signal::ctrl_c() => true,
        }
    };
    bar.finish_and_clear();

    supervisor.stop().await;

    if interrupted {
        eprintln!("\nInterrupted, worker stopped");
        return Ok(130);
    }

    let session_path = tracker.save().context("Failed to save session")?;
    if let Some(results_path) = &args.results_file {
        tracker
            .save_results(results_path)
            .context("Failed to write results file")?;
    }

    println!();
    print!("{}", tracker.report(config.tracking.top_issues).render());

    match comparison_target(&args.compare, &config.tracking.dir, &session_path)? {
        Some(previous) => {
            println!();
            info!(previous = %previous.display(), "Comparing with previous session");
            print!("{}", tracker.compare_with_previous(&previous)?.render());
        }
        None => {
            if args.compare == "auto" {
                info!("No previous session to compare against");
            }
        }
    }

    println!("\nSession saved to {}", session_path.display());
    Ok(0)
}

/// Resolves the `--compare` flag to a previous session file, if any.
fn comparison_target(
    compare: &str,
    tracking_dir: &std::path::Path,
    current: &std::path::Path,
) -> Result<Option<PathBuf>> {
    match compare {
        "off" => Ok(None),
        "auto" => {
            let files = SessionTracker::session_files(tracking_dir)?;
            // The just-saved session sorts last; take the one before it.
            Ok(files
                .into_iter()
                .filter(|f| f != current)
                .next_back())
        }
        path => Ok(Some(PathBuf::from(path))),
    }
}

fn banner(use_colors: bool, suite: &CaseSuite, cases_path: &std::path::Path) {
    let title = suite
        .metadata
        .name
        .clone()
        .unwrap_or_else(|| "trackbench".to_string());
    if use_colors {
        println!("\x1b[1m{title}\x1b[0m");
    } else {
        println!("{title}");
    }
    println!(
        "{} cases from {}\n",
        suite.cases.len(),
        cases_path.display()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comparison_target_off() {
        let target = comparison_target("off", std::path::Path::new("x"), std::path::Path::new("y"))
            .unwrap();
        assert!(target.is_none());
    }

    #[test]
    fn test_comparison_target_explicit_path() {
        let target = comparison_target(
            "conversation-tracking/session-20250101T000000000Z.json",
            std::path::Path::new("x"),
            std::path::Path::new("y"),
        )
        .unwrap();
        assert_eq!(
            target.unwrap(),
            PathBuf::from("conversation-tracking/session-20250101T000000000Z.json")
        );
    }

    #[test]
    fn test_comparison_target_auto_picks_latest_prior() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("session-20250101T000000000Z.json");
        let newer = dir.path().join("session-20250102T000000000Z.json");
        let current = dir.path().join("session-20250103T000000000Z.json");
        for path in [&old, &newer, &current] {
            std::fs::write(path, "{}").unwrap();
        }

        let target = comparison_target("auto", dir.path(), &current).unwrap();
        assert_eq!(target.unwrap(), newer);
    }

    #[test]
    fn test_comparison_target_auto_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let current = dir.path().join("session-20250103T000000000Z.json");
        let target = comparison_target("auto", dir.path(), &current).unwrap();
        assert!(target.is_none());
    }
}
