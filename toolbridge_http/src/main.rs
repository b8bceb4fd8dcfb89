use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use toolbridge_http::config::{call_timeout_secs, init_timeout_secs};
use toolbridge_http::{BridgeConfig, ProviderSpec, start_bridge};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// HTTP front door for stdio JSON-RPC tool providers.
///
/// Each provider runs as a child process, started on first use and restarted
/// on the next request after it dies.
#[derive(Parser, Debug)]
#[command(name = "toolbridge")]
#[command(version, about)]
struct Args {
    /// Address to bind the HTTP server.
    #[arg(long, default_value = "127.0.0.1:3000")]
    bind_addr: SocketAddr,

    /// TOML file declaring `[[providers]]` and an optional `default_provider`.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Provider shorthand `name=command [args...]`; may be repeated.
    #[arg(long = "provider", value_name = "NAME=COMMAND")]
    providers: Vec<String>,

    /// Provider used when a request names none (default: the first one).
    #[arg(long)]
    default_provider: Option<String>,

    /// Seconds allowed for spawn + initialize [env: TOOLBRIDGE_INIT_TIMEOUT_SECS].
    #[arg(long)]
    init_timeout_secs: Option<u64>,

    /// Seconds allowed for each call [env: TOOLBRIDGE_CALL_TIMEOUT_SECS].
    #[arg(long)]
    call_timeout_secs: Option<u64>,

    /// Echo every line exchanged with providers to the terminal, colored.
    #[arg(long)]
    colored_output: bool,
}

impl Args {
    fn into_config(self) -> anyhow::Result<BridgeConfig> {
        let mut config = BridgeConfig {
            bind_addr: self.bind_addr,
            default_provider: self.default_provider,
            init_timeout: Duration::from_secs(
                self.init_timeout_secs
                    .unwrap_or_else(init_timeout_secs),
            ),
            call_timeout: Duration::from_secs(
                self.call_timeout_secs
                    .unwrap_or_else(call_timeout_secs),
            ),
            enable_colored_output: self.colored_output,
            ..BridgeConfig::default()
        };

        for shorthand in &self.providers {
            config.providers.push(ProviderSpec::parse_shorthand(shorthand)?);
        }
        if let Some(path) = &self.config {
            config.load_providers_file(path)?;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Args::parse().into_config()?;

    tracing::info!("Starting toolbridge on {}", config.bind_addr);
    for provider in &config.providers {
        tracing::info!(
            provider = %provider.name,
            command = %provider.command,
            args = ?provider.args,
            "Registered provider"
        );
    }

    start_bridge(config).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn cli_providers_follow_file_providers() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("providers.toml");
        fs::write(&path, "[[providers]]\nname = \"xero\"\ncommand = \"xero-mcp\"\n").unwrap();

        let args = Args::try_parse_from([
            "toolbridge",
            "--config",
            path.to_str().unwrap(),
            "--provider",
            "supabase=supabase-mcp --read-only",
            "--call-timeout-secs",
            "3",
        ])
        .unwrap();
        let config = args.into_config().unwrap();

        let names: Vec<_> = config.providers.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["xero", "supabase"]);
        assert_eq!(config.providers[1].args, ["--read-only"]);
        assert_eq!(config.call_timeout, Duration::from_secs(3));
        assert_eq!(config.default_provider_name(), Some("xero"));
    }

    #[test]
    fn missing_providers_is_an_error() {
        let args = Args::try_parse_from(["toolbridge"]).unwrap();
        assert!(args.into_config().is_err());
    }

    #[test]
    fn unknown_default_provider_is_an_error() {
        let args = Args::try_parse_from([
            "toolbridge",
            "--provider",
            "xero=xero-mcp",
            "--default-provider",
            "ghost",
        ])
        .unwrap();
        assert!(args.into_config().is_err());
    }
}
