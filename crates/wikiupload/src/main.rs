use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wikiupload_core::config::{DEFAULT_CONFIG_FILE, Secret, UploadConfig, load_config};
use wikiupload_core::execute::{CancelToken, ExecuteOptions, RetryPolicy, UploadReport, execute};
use wikiupload_core::plan::{PlanOptions, UploadPlan, mark_unchanged, plan, schedule_all};
use wikiupload_core::resolve::normalize_separators;
use wikiupload_core::session::{MediaWikiClient, MediaWikiClientConfig, SessionClient};

#[derive(Debug, Parser)]
#[command(
    name = "wikiupload",
    version,
    about = "Upload a static site build to a team wiki"
)]
struct Cli {
    #[arg(short, long, global = true, action = clap::ArgAction::Count, help = "Increase log verbosity (-v, -vv, -vvv)")]
    verbose: u8,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Upload build output matching the given globs")]
    Upload(UploadArgs),
}

#[derive(Debug, Args)]
struct UploadArgs {
    #[arg(value_name = "GLOB", help = "Files to upload, relative to the build root (default: everything)")]
    globs: Vec<String>,
    #[arg(long, alias = "config", value_name = "PATH", help = "TOML configuration file with an [upload] or [igem] table")]
    ini: Option<PathBuf>,
    #[arg(long, value_name = "DIR", help = "Build output directory")]
    root: Option<PathBuf>,
    #[arg(short = 'U', long)]
    username: Option<String>,
    #[arg(short, long)]
    password: Option<String>,
    #[arg(long)]
    team: Option<String>,
    #[arg(long, help = "Sub-path appended after the team namespace")]
    prefix: Option<String>,
    #[arg(long, help = "Wiki edition year, e.g. 2017")]
    year: Option<u32>,
    #[arg(long, help = "Strip leading whitespace, BOM and configured markers")]
    strip: bool,
    #[arg(long, help = "Upload folder/index.html as the folder's own page")]
    no_index: bool,
    #[arg(long, help = "Skip pages whose remote content is unchanged")]
    check_unchanged: bool,
    #[arg(long, value_name = "GLOB", help = "Exclude files matching this glob (repeatable)")]
    ignore: Vec<String>,
    #[arg(long, value_name = "N")]
    workers: Option<usize>,
    #[arg(long, value_name = "N", help = "Retries for transient failures")]
    retries: Option<usize>,
    #[arg(short = 'n', long, help = "Plan and rewrite without logging in or writing")]
    dry_run: bool,
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    init_logging(cli.verbose);

    match cli.command {
        Some(Commands::Upload(args)) => run_upload(args, cli.verbose),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_upload(args: UploadArgs, verbose: u8) -> Result<()> {
    let config_path = args
        .ini
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let mut config = load_config(&config_path)?;
    config.apply_env();
    apply_cli_overrides(&mut config, &args);

    let build_root = args
        .root
        .clone()
        .or_else(|| config.upload.build_root.clone())
        .unwrap_or_else(|| PathBuf::from("."));

    let remote_base = if args.dry_run {
        match config.endpoints() {
            Ok(endpoints) => endpoints.url,
            Err(error) => {
                warn!(error = %error, "no wiki configured, rewriting with relative URLs");
                String::new()
            }
        }
    } else {
        config.endpoints()?.url
    };
    let credentials = if args.dry_run {
        None
    } else {
        Some(config.credentials()?)
    };

    let mut options = PlanOptions::from_config(&config, &remote_base);
    if !args.globs.is_empty() {
        options.include = args
            .globs
            .iter()
            .map(|glob| relative_glob(glob, &build_root))
            .collect();
    }
    options.protected.push(config_path.clone());
    let plan = plan(&build_root, &options)?;

    let Some(credentials) = credentials else {
        return print_plan(&build_root, &plan, args.format);
    };

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        warn!("interrupt received, finishing in-flight uploads");
        handler_token.cancel();
    })
    .context("failed to install interrupt handler")?;

    let api = MediaWikiClient::new(MediaWikiClientConfig::from_config(&config)?)?;
    let session = SessionClient::login(api, credentials, config.summary())
        .context("could not establish a wiki session")?
        .with_chunk_size(config.chunk_size());

    let planned = if config.upload.check_unchanged {
        mark_unchanged(&session, plan.targets)
    } else {
        schedule_all(plan.targets)
    };
    let report = execute(
        &session,
        planned,
        &ExecuteOptions {
            retry: RetryPolicy::from_config(&config),
            workers: config.workers(),
            cancel,
        },
    );

    print_report(&report, args.format)?;
    if !report.success {
        print_failures(&report, verbose);
        std::process::exit(1);
    }
    info!(ok = report.ok, skipped = report.skipped, "upload complete");
    Ok(())
}

/// CLI flags win over environment and file values.
fn apply_cli_overrides(config: &mut UploadConfig, args: &UploadArgs) {
    let section = &mut config.upload;
    if let Some(username) = &args.username {
        section.username = Some(username.clone());
    }
    if let Some(password) = &args.password {
        section.password = Some(Secret::new(password.clone()));
    }
    if let Some(team) = &args.team {
        section.team = Some(team.clone());
    }
    if let Some(prefix) = &args.prefix {
        section.prefix = Some(prefix.clone());
    }
    if let Some(year) = args.year {
        section.year = Some(year);
    }
    if args.strip {
        section.strip = true;
    }
    if args.no_index {
        section.no_index = true;
    }
    if args.check_unchanged {
        section.check_unchanged = true;
    }
    if !args.ignore.is_empty() {
        section.ignore.extend(args.ignore.iter().cloned());
    }
    if let Some(workers) = args.workers {
        section.workers = Some(workers);
    }
    if let Some(retries) = args.retries {
        section.max_retries = Some(retries);
    }
}

/// Accept globs written from the working directory, e.g. `build/**/*` with `--root build`.
fn relative_glob(glob: &str, build_root: &Path) -> String {
    let glob = normalize_separators(glob);
    let glob = glob.trim_start_matches("./");
    let root = normalize_path(build_root);
    let root = root.trim_start_matches("./").trim_end_matches('/');
    if root.is_empty() || root == "." {
        return glob.to_string();
    }
    glob.strip_prefix(&format!("{root}/"))
        .unwrap_or(glob)
        .to_string()
}

fn print_plan(build_root: &Path, plan: &UploadPlan, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let targets: Vec<_> = plan
                .targets
                .iter()
                .map(|target| {
                    json!({
                        "local_path": target.relative_path,
                        "remote_page_name": target.remote_page_name,
                        "content_kind": target.content_kind,
                        "mime_type": target.mime_type,
                        "bytes": target.payload.len(),
                        "unresolved": target.unresolved,
                    })
                })
                .collect();
            let report = json!({
                "dry_run": true,
                "build_root": normalize_path(build_root),
                "excluded": plan.excluded,
                "targets": targets,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => {
            println!("dry run");
            println!("build_root: {}", normalize_path(build_root));
            println!("targets: {}", plan.targets.len());
            println!("excluded: {}", plan.excluded);
            for target in &plan.targets {
                println!(
                    "  - {} -> {} ({}, {} bytes)",
                    target.relative_path,
                    target.remote_page_name,
                    target.content_kind.as_str(),
                    target.payload.len()
                );
                for reference in &target.unresolved {
                    println!("      unresolved: {reference}");
                }
            }
        }
    }
    Ok(())
}

fn print_report(report: &UploadReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Text => {
            println!("upload report");
            println!("ok: {}", report.ok);
            println!("skipped: {}", report.skipped);
            println!("failed: {}", report.failed);
            println!("not_attempted: {}", report.not_attempted);
            println!("cancelled: {}", format_flag(report.cancelled));
            if let Some(reason) = &report.aborted {
                println!("aborted: {reason}");
            }
            println!("relogins: {}", report.relogins);
            println!("requests: {}", report.request_count);
        }
    }
    Ok(())
}

fn print_failures(report: &UploadReport, verbose: u8) {
    eprintln!(
        "upload failed: {} failed, {} not attempted",
        report.failed, report.not_attempted
    );
    for failure in report.failures() {
        let detail = failure.error_detail.as_deref().unwrap_or("unknown error");
        let reason = if verbose > 0 {
            detail.to_string()
        } else {
            short_reason(detail)
        };
        eprintln!(
            "  - {} -> {}: {}",
            failure.local_path, failure.remote_page_name, reason
        );
    }
    if let Some(reason) = &report.aborted {
        eprintln!("aborted: {reason}");
    }
    if report.cancelled {
        eprintln!("cancelled by user");
    }
}

/// Error category plus the wiki's error code when one is present, e.g.
/// `permanent failure [protectedpage]`.
fn short_reason(detail: &str) -> String {
    let category = detail.split(':').next().unwrap_or(detail).trim();
    let code = detail
        .split_once('[')
        .and_then(|(_, rest)| rest.split_once(']'))
        .map(|(code, _)| code)
        .filter(|code| !code.is_empty());
    match code {
        Some(code) => format!("{category} [{code}]"),
        None => category.to_string(),
    }
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
