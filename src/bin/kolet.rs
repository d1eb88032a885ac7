use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::process::Command as Process;

use kola::external::{EXT_DATA_DIR, EXT_DATA_ENV};
use kola::registry::RegistryBuilder;
use kola::{suites, Error};

/// Native code runner for kola, executed inside the machine under test
#[derive(Parser)]
#[command(name = "kolet", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a native function declared by a test
    Run { test: String, func: String },
    /// Run an external test executable
    RunExt { test: String, executable: PathBuf },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::Run { test, func } => match run_native(&test, &func).await {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("{}: {}", func, e);
                1
            }
        },
        Command::RunExt { test, executable } => run_external(&test, executable).await?,
    };
    std::process::exit(code);
}

async fn run_native(test: &str, func: &str) -> kola::Result<()> {
    let mut builder = RegistryBuilder::new();
    suites::register_all(&mut builder);
    let registry = builder.build()?;

    let descriptor = registry
        .get(test)
        .ok_or_else(|| Error::NativeFunc(format!("test {} not found", test)))?;
    let native = descriptor.native_func(func).ok_or_else(|| {
        Error::NativeFunc(format!("test {} has no native function {}", test, func))
    })?;
    tracing::info!(test, func, "running native function");
    native.call().await
}

async fn run_external(test: &str, executable: PathBuf) -> kola::Result<i32> {
    tracing::info!(test, executable = %executable.display(), "running external test");
    let status = Process::new(&executable)
        .env("KOLA_TEST", test)
        .env(EXT_DATA_ENV, EXT_DATA_DIR)
        .status()
        .await?;
    Ok(status.code().unwrap_or(1))
}
