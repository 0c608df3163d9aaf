use anyhow::Context;
use clap::Parser;
use log::info;
use relay_proxy::config::{Config, LoggingConfig, LogTarget};
use relay_proxy::logging::{self, CustomLogger, LogSink};
use relay_proxy::{ProxyError, Server};
use tokio::signal;

#[derive(Parser)]
#[clap(
    version,
    about = "Forward HTTP proxy with CONNECT tunneling and optional Basic authentication"
)]
struct Args {
    #[clap(long, value_name = "ADDR", help = "Proxy listen address (default :8080)")]
    http: Option<String>,

    #[clap(long, value_name = "USER:PASS", help = "Basic credentials required from clients")]
    auth: Option<String>,

    #[clap(long, alias = "genAuth", help = "Generate random credentials for auth")]
    gen_auth: bool,

    #[clap(short = 'l', long, value_name = "FILE", help = "Append log output to this file")]
    log_file: Option<String>,

    #[clap(long, alias = "ll", value_name = "LEVEL", help = "Log level: debug, info, warn or error (default debug)")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(long, value_name = "BYTES", help = "Maximum request header size in bytes")]
    max_header_size: Option<usize>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        generate_sample_config(config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let config = load_config(&args)?;
    config.validate()?;
    init_logging(&args, &config).context("Failed to configure logging")?;

    info!("Starting proxy server...");
    let server = Server::new(&config, LogSink::default());

    tokio::select! {
        result = server.run() => result?,
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load configuration file {}", path))?,
        None => Config::default(),
    };

    if let Some(http) = &args.http {
        config.listen_addr = http.clone();
    }
    if let Some(auth) = &args.auth {
        config.auth = Some(auth.clone());
    }
    if args.gen_auth {
        config.gen_auth = true;
    }
    if let Some(max_header_size) = args.max_header_size {
        config.max_header_size = max_header_size;
    }

    Ok(config)
}

/// File logging through `CustomLogger` when a log file or logging section is
/// configured, `env_logger` on stderr otherwise.
fn init_logging(args: &Args, config: &Config) -> Result<(), ProxyError> {
    let level = args.log_level.as_deref().map(logging::parse_log_level).transpose()?;
    let format = args.log_format.as_deref().map(logging::parse_log_format).transpose()?;

    if args.log_file.is_none() && config.logging.is_none() {
        return logging::init_fallback(level.unwrap_or_default(), format.unwrap_or_default());
    }

    let mut logging_config = config.logging.clone().unwrap_or(LoggingConfig {
        level: None,
        format: None,
        targets: None,
    });
    if level.is_some() {
        logging_config.level = level;
    }
    if format.is_some() {
        logging_config.format = format;
    }
    if let Some(log_file) = &args.log_file {
        logging_config.targets = Some(vec![LogTarget::file(log_file)]);
    }
    CustomLogger::init(logging_config)
}

fn generate_sample_config(file_path: &str) -> Result<(), ProxyError> {
    let sample = Config {
        listen_addr: ":8080".to_string(),
        auth: Some("username:password".to_string()),
        logging: Some(LoggingConfig {
            targets: Some(vec![LogTarget::file("server.log")]),
            ..LoggingConfig::default()
        }),
        ..Config::default()
    };
    sample.to_file(file_path)
}
