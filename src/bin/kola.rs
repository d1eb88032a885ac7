use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use kola::config::KolaConfig;
use kola::filter::{self, FilterContext, Patterns};
use kola::register::Test;
use kola::registry::{Registry, RegistryBuilder, Table};
use kola::runner::{RunOptions, Runner};
use kola::{external, platform, suites, Error};

const LOG_FILE: &str = "kola.log";

/// Run integration tests against CoreOS images
#[derive(Parser)]
#[command(name = "kola", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run tests; patterns are globs over test names (default `*`)
    Run(RunArgs),
    /// Run upgrade tests
    RunUpgrade(RunArgs),
    /// List registered tests
    List(ListArgs),
}

#[derive(Args)]
struct Common {
    /// YAML or JSON file with defaults
    #[arg(long, env = "KOLA_CONFIG")]
    config: Option<PathBuf>,
    /// Platform name used for filtering and reporting
    #[arg(short, long)]
    platform: Option<String>,
    /// Provisioning backend (mock, local)
    #[arg(long)]
    backend: Option<String>,
    /// Distribution (fcos, rhcos, scos)
    #[arg(short = 'b', long)]
    distro: Option<String>,
    /// Directory for logs, console output and report.json
    #[arg(short = 'd', long)]
    output_dir: Option<PathBuf>,
    /// Register external tests from DIR/tests/kola
    #[arg(short = 'E', long = "exttest", value_name = "DIR")]
    exttest: Vec<PathBuf>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    common: Common,
    /// Maximum number of tests running at once
    #[arg(short = 'j', long)]
    parallel: Option<usize>,
    /// Only run tests with this tag; `!tag` excludes
    #[arg(long = "tag")]
    tags: Vec<String>,
    /// Version of the build under test, skipping detection
    #[arg(long)]
    os_version: Option<String>,
    #[arg(long)]
    firmware: Option<String>,
    /// Machines have no internet access
    #[arg(long)]
    no_net: bool,
    /// Rerun failed tests once
    #[arg(long)]
    rerun: bool,
    /// Tags whose failures are cleared by a passing rerun (`all` for any)
    #[arg(long = "allow-rerun-success", value_name = "TAG")]
    allow_rerun_success: Vec<String>,
    #[arg(long)]
    denylist: Option<PathBuf>,
    /// Public key authorized on every machine
    #[arg(long)]
    ssh_key: Option<PathBuf>,
    /// kolet binary uploaded for native functions
    #[arg(long)]
    kolet: Option<PathBuf>,
    patterns: Vec<String>,
}

#[derive(Args)]
struct ListArgs {
    #[command(flatten)]
    common: Common,
    /// Print JSON instead of a table
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ListItem<'a> {
    name: &'a str,
    description: &'a str,
    platforms: &'a [String],
    architectures: &'a [String],
    distros: &'a [String],
    tags: &'a [String],
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run(args) => cmd_run(args, Table::Tests).await,
        Command::RunUpgrade(args) => cmd_run(args, Table::UpgradeTests).await,
        Command::List(args) => cmd_list(args),
    };
    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing(output_dir: Option<&Path>) -> std::io::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (file_layer, guard) = match output_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, LOG_FILE));
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(guard)
}

/// Config file, then `KOLA_*` variables, then flags
fn resolve_config(common: &Common) -> kola::Result<KolaConfig> {
    let mut config = match &common.config {
        Some(path) => KolaConfig::load(path)?,
        None => KolaConfig::default(),
    };
    config.apply_env_overrides()?;
    if let Some(platform) = &common.platform {
        config.platform = platform.clone();
    }
    if let Some(backend) = &common.backend {
        config.backend = backend.clone();
    }
    if let Some(distro) = &common.distro {
        config.distro = distro.clone();
    }
    if let Some(dir) = &common.output_dir {
        config.output_dir = dir.clone();
    }
    config.validate()?;
    Ok(config)
}

fn build_registry(exttests: &[PathBuf]) -> kola::Result<Registry> {
    let mut builder = RegistryBuilder::new();
    suites::register_all(&mut builder);
    for dir in exttests {
        let count = external::register_external_tests(&mut builder, dir)?;
        tracing::info!(dir = %dir.display(), count, "registered external tests");
    }
    builder.build()
}

async fn cmd_run(args: RunArgs, table: Table) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = resolve_config(&args.common)?;
    if let Some(parallel) = args.parallel {
        config.parallel = parallel;
    }
    config.tags.extend(args.tags.iter().cloned());
    if args.os_version.is_some() {
        config.os_version = args.os_version.clone();
    }
    if args.firmware.is_some() {
        config.firmware = args.firmware.clone();
    }
    config.no_net |= args.no_net;
    config.rerun |= args.rerun;
    config
        .rerun_success_tags
        .extend(args.allow_rerun_success.iter().cloned());
    if let Some(denylist) = &args.denylist {
        config.denylist = denylist.clone();
    }
    if args.ssh_key.is_some() {
        config.ssh_key = args.ssh_key.clone();
    }
    config.validate()?;

    let _guard = init_tracing(Some(&config.output_dir))?;
    let registry = build_registry(&args.common.exttest)?;
    let provider = platform::provider_for(&config.backend, &config.platform)?;
    let mut options = RunOptions::from_config(&config)?.table(table);
    if let Some(kolet) = &args.kolet {
        options = options.kolet(kolet);
    }
    tracing::info!(
        platform = %config.platform,
        backend = %config.backend,
        parallel = config.parallel,
        %table,
        "starting run"
    );

    let runner = Runner::new(provider, options);
    let report = match runner.run(&registry, &args.patterns).await {
        Ok(report) => report,
        Err(e @ Error::SuiteEmpty) => {
            println!("FAIL, output in {}", config.output_dir.display());
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    print!("{}", report.summary());
    for warning in report.warnings() {
        println!("warning: {} failed but is marked warn-only", warning.name);
    }
    if report.flakes_tolerated {
        println!("all failures passed on rerun");
    }
    println!(
        "{}, output in {}",
        if report.success() { "PASS" } else { "FAIL" },
        config.output_dir.display()
    );
    report.check()?;
    Ok(())
}

fn cmd_list(args: ListArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(None)?;
    let config = resolve_config(&args.common)?;
    let registry = build_registry(&args.common.exttest)?;

    let all = registry.tests().chain(registry.upgrade_tests());
    let tests: Vec<Arc<Test>> = if args.common.platform.is_some() || args.common.distro.is_some() {
        let ctx = FilterContext::new(config.platform.clone(), config.distro.clone());
        filter::filter_tests(all, &Patterns::new::<&str>(&[])?, &ctx)
    } else {
        all.cloned().collect()
    };

    if args.json {
        let items: Vec<ListItem<'_>> = tests
            .iter()
            .map(|t| ListItem {
                name: &t.name,
                description: &t.description,
                platforms: &t.platforms,
                architectures: &t.architectures,
                distros: &t.distros,
                tags: &t.tags,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    println!(
        "{:<45} {:<20} {:<20} {}",
        "Test Name", "Platforms", "Architectures", "Distributions"
    );
    for t in &tests {
        println!(
            "{:<45} {:<20} {:<20} {}",
            t.name,
            or_all(&t.platforms),
            or_all(&t.architectures),
            or_all(&t.distros)
        );
    }
    Ok(())
}

fn or_all(items: &[String]) -> String {
    if items.is_empty() {
        "all".to_string()
    } else {
        items.join(",")
    }
}
