use std::io::Write;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use minidock::{ChrootIsolation, Config, HttpTransport, Sandbox};

#[derive(Parser, Debug)]
#[command(name = "minidock", version, about = "Run a command inside a pulled image")]
struct Cli {
    /// Log at debug level when RUST_LOG is unset.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Pull <IMAGE> and run <COMMAND> inside it.
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// JSON config file; flags and environment override its values.
    #[arg(long, env = "MINIDOCK_CONFIG")]
    config: Option<PathBuf>,

    /// Token endpoint [default: https://auth.docker.io/token]
    #[arg(long, env = "MINIDOCK_AUTH_URL")]
    auth_url: Option<String>,

    /// Auth service name [default: registry.docker.io]
    #[arg(long, env = "MINIDOCK_AUTH_SERVICE")]
    auth_service: Option<String>,

    /// Registry API base [default: https://registry.hub.docker.com/v2]
    #[arg(long, env = "MINIDOCK_REGISTRY_URL")]
    registry_url: Option<String>,

    /// Directory under which the sandbox root is created.
    #[arg(long, env = "MINIDOCK_TMP_DIR")]
    tmp_dir: Option<PathBuf>,

    /// Leave the sandbox root on disk.
    #[arg(long, env = "MINIDOCK_KEEP_ROOT")]
    keep_root: bool,

    /// Image reference, `name` or `name:tag`.
    image: String,

    /// Absolute path of the command to run.
    command: String,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

impl RunArgs {
    fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        if let Some(auth_url) = &self.auth_url {
            config.auth_url = auth_url.clone();
        }
        if let Some(auth_service) = &self.auth_service {
            config.auth_service = auth_service.clone();
        }
        if let Some(registry_url) = &self.registry_url {
            config.registry_url = registry_url.clone();
        }
        if let Some(tmp_dir) = &self.tmp_dir {
            config.temp_base = tmp_dir.clone();
        }
        config.keep_root |= self.keep_root;

        Ok(config)
    }
}

// Usage: minidock run <image> <command> <arg1> <arg2> ...
fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let Commands::Run(args) = cli.command;
    let config = args.config()?;
    let transport = HttpTransport::new();
    let sandbox = Sandbox::new(&config, &transport, ChrootIsolation);

    let mut stdout = std::io::stdout().lock();
    let mut stderr = std::io::stderr();
    match sandbox.run(&args.image, &args.command, &args.args, &mut stdout, &mut stderr) {
        Ok(status) => {
            stdout.flush()?;
            std::process::exit(status);
        }

        Err(e) => {
            tracing::debug!(error = ?e, "pipeline failed");
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}
