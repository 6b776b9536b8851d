use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use log::info;
use piped::config::{Config, ConfigError, ConfigOverrides};
use piped::Piped;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "piped")]
#[command(about = "A fan-out traffic relay with redundancy groups and background reconnects")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Piped Team")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay
    Run {
        /// Path to configuration file; without one, everything comes from flags
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Enable debug output
        #[arg(long)]
        debug: bool,
        /// Enable trace output, including reconnect attempts
        #[arg(long)]
        trace: bool,
        /// One redundancy group, backends separated by commas; repeatable
        #[arg(short, long = "server", value_name = "ADDR[,ADDR...]")]
        servers: Vec<String>,
        /// TCP port to listen on
        #[arg(long)]
        tcp_port: Option<u16>,
        /// UDP port to listen on
        #[arg(long)]
        udp_port: Option<u16>,
    },
    /// Generate an example configuration file
    Config {
        /// Listener mode (tcp or udp)
        #[arg(short, long)]
        mode: String,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            debug,
            trace,
            servers,
            tcp_port,
            udp_port,
        } => {
            let overrides = ConfigOverrides {
                debug,
                trace,
                servers,
                tcp_port,
                udp_port,
            };
            run_piped(config, overrides).await?;
        }
        Commands::Config { mode, output } => {
            generate_config(mode, output)?;
        }
        Commands::Validate { config } => {
            validate_config(config)?;
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

async fn run_piped(config_path: Option<PathBuf>, overrides: ConfigOverrides) -> Result<()> {
    let config = match &config_path {
        Some(path) => Config::load_with_overrides(path, &overrides)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => {
            let mut config = Config::default();
            config.apply_overrides(&overrides);
            config.validate().context("Invalid command line configuration")?;
            config
        }
    };

    init_logging(&config)?;

    info!("Starting piped v{}", env!("CARGO_PKG_VERSION"));
    match &config_path {
        Some(path) => info!("Configuration loaded from: {:?}", path),
        None => info!("Configuration taken from the command line"),
    }
    info!("Relaying to {} group(s)", config.servers.len());

    let piped = Piped::start(config).await.context("Failed to start piped")?;
    piped.run().await.context("Piped stopped with an error")?;

    Ok(())
}

fn generate_config(mode: String, output: PathBuf) -> Result<()> {
    println!("Generating {} configuration file: {:?}", mode, output);

    Config::create_example_config(&output, &mode).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  piped run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Groups: {}", config.servers.len());
            for (i, group) in config.servers.groups().iter().enumerate() {
                println!("    {}: {}", i, group.join(", "));
            }
            if let Some(overflow) = &config.overflow {
                println!("  Overflow: {}", overflow);
            }
            if let Some(port) = config.listen.tcp_port {
                println!("  TCP port: {}", port);
            }
            if let Some(port) = config.listen.udp_port {
                println!("  UDP port: {}", port);
            }
            println!("  Admin: {}", config.admin.port);
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(e.into());
        }
    }

    Ok(())
}

fn show_version() {
    println!("piped v{}", env!("CARGO_PKG_VERSION"));
    println!("A fan-out traffic relay with redundancy groups and background reconnects");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • TCP, UDP, unix socket, stdin and file-tail listeners");
    println!("  • First-healthy-wins backend selection per redundancy group");
    println!("  • Backpressure detection and background reconnects");
    println!("  • statsd health metrics and a line-based admin interface");
}

fn init_logging(config: &Config) -> Result<()> {
    let level = if config.logging.trace {
        "trace"
    } else if config.logging.debug {
        "debug"
    } else {
        config.logging.level.as_str()
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Invalid log filter")?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }

    info!("Logging initialized at level: {}", level);
    Ok(())
}
