use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tulpa::config::Config;
use tulpa::server::Server;

/// Tulpa - reverse proxy that reruns your app when files change
#[derive(Parser)]
#[command(name = "tulpa")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port the app listens on (default: 3000)
    #[arg(short = 'a', long)]
    app_port: Option<u16>,

    /// Port the proxy listens on (default: 4000)
    #[arg(short = 'p', long)]
    proxy_port: Option<u16>,

    /// Give up on a request after this many milliseconds (default: 10000)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Quiet period between reruns in milliseconds, 0 disables (default: 200)
    #[arg(long)]
    debounce_ms: Option<u64>,

    /// Force a rerun at least this often under constant traffic (default: 1000)
    #[arg(long)]
    debounce_ceiling_ms: Option<u64>,

    /// Pause between forward attempts in milliseconds (default: 50)
    #[arg(long)]
    retry_backoff_ms: Option<u64>,

    /// Directory to skip while scanning, relative to the root (repeatable)
    #[arg(short = 'x', long = "ignore")]
    ignore: Vec<String>,

    /// Wait for the command to exit before forwarding (build-then-serve commands)
    #[arg(short = 'w', long)]
    wait: bool,

    /// Verbose logging
    #[arg(short = 'v', long)]
    verbose: bool,

    /// TOML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Directory to watch (default: current directory)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Command that builds and/or starts the app
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl Cli {
    /// File values first, then flags on top
    fn into_config(self) -> anyhow::Result<(Config, Vec<String>)> {
        let mut config = match self.config {
            Some(ref path) => Config::read(path)
                .map_err(|e| anyhow::anyhow!("{}: {}", path.display(), e))?,
            None => Config::default(),
        };

        if let Some(port) = self.app_port {
            config.app_port = port;
        }
        if let Some(port) = self.proxy_port {
            config.proxy_port = port;
        }
        if let Some(ms) = self.timeout_ms {
            config.timeout_ms = ms;
        }
        if let Some(ms) = self.debounce_ms {
            config.debounce_ms = ms;
        }
        if let Some(ms) = self.debounce_ceiling_ms {
            config.debounce_ceiling_ms = ms;
        }
        if let Some(ms) = self.retry_backoff_ms {
            config.retry_backoff_ms = ms;
        }
        if !self.ignore.is_empty() {
            config.ignore = self.ignore;
        }
        if let Some(root) = self.root {
            config.root = root;
        }
        config.wait |= self.wait;
        config.verbose |= self.verbose;

        config.validate()?;
        Ok((config, self.command))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logging is set up after the merge so the file's `verbose` key counts
    let verbose_flag = cli.verbose;
    let config_path = cli.config.clone();
    let (config, command) = match cli.into_config() {
        Ok(parsed) => parsed,
        Err(e) => {
            init_logging(verbose_flag);
            error!(error = %e, "Failed to load configuration");
            return Err(e);
        }
    };

    init_logging(config.verbose);
    if let Some(path) = config_path {
        info!(path = %path.display(), "Configuration loaded");
    }
    info!(
        app_port = config.app_port,
        proxy_port = config.proxy_port,
        root = %config.root.display(),
        wait = config.wait,
        command = %command.join(" "),
        "Starting tulpa"
    );

    Server::new(config, command).run_until_signal().await
}

fn init_logging(verbose: bool) {
    let directive = if verbose { "tulpa=debug" } else { "tulpa=info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().expect("valid log directive")),
        )
        .init();
}
