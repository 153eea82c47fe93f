//! vipwatchd: the vipwatch daemon.
//!
//! Watches the EC2 instance that owns a virtual IP and, when it is lost,
//! launches a replacement in another availability zone and moves every
//! route for the virtual IP to it.
//!
//! # Usage
//!
//! ```text
//! vipwatchd --instance-id i-0abc --security-group sg-0123 --keypair ops \
//!     --user-data-file bootstrap.sh --route-destination 10.0.0.10/32
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use ipnet::Ipv4Net;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vipwatch_cloud::{AwsCli, CloudProvider};
use vipwatch_core::VipwatchConfig;
use vipwatch_failover::{FailoverController, FailoverSettings, RandomNames, validate_template};
use vipwatch_health::PingProber;

#[derive(Parser, Debug)]
#[command(name = "vipwatchd", about = "Virtual IP owner failover controller")]
struct Cli {
    /// Instance that currently owns the virtual IP.
    #[arg(long)]
    instance_id: String,

    /// Security group given to replacements.
    #[arg(long)]
    security_group: String,

    /// Key pair name given to replacements.
    #[arg(long = "keypair")]
    key_name: String,

    /// Bootstrap template rendered into each replacement's user data.
    #[arg(long)]
    user_data_file: PathBuf,

    /// CIDR routed through the owner, e.g. 10.0.0.10/32.
    #[arg(long)]
    route_destination: Ipv4Net,

    /// Optional vipwatch.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides `aws.region`.
    #[arg(long)]
    region: Option<String>,

    /// Overrides `aws.profile`.
    #[arg(long)]
    profile: Option<String>,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);
    run(cli).await
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,vipwatchd=debug,vipwatch_failover=debug")
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<VipwatchConfig> {
    let mut config = match &cli.config {
        Some(path) => VipwatchConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => VipwatchConfig::default(),
    };
    if let Some(region) = &cli.region {
        config.aws.region = Some(region.clone());
    }
    if let Some(profile) = &cli.profile {
        config.aws.profile = Some(profile.clone());
    }
    Ok(config)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    let timings = config.timings()?;

    let template = std::fs::read_to_string(&cli.user_data_file).with_context(|| {
        format!(
            "failed to read bootstrap template {}",
            cli.user_data_file.display()
        )
    })?;
    validate_template(&template).context("invalid bootstrap template")?;

    info!(
        instance = %cli.instance_id,
        cidr = %cli.route_destination,
        region = config.aws.region.as_deref().unwrap_or("default"),
        "vipwatchd starting"
    );

    let cloud: Arc<dyn CloudProvider> =
        Arc::new(AwsCli::new(&config.aws, timings.wait_poll_interval));
    let prober = Arc::new(PingProber::new(
        &config.monitor.ping_binary,
        timings.probe_packet_timeout,
        timings.probe_timeout,
    ));
    let names = Arc::new(RandomNames::new(&config.failover.name_prefix));

    let settings = FailoverSettings {
        destination_cidr: cli.route_destination,
        security_group: cli.security_group,
        key_name: cli.key_name,
        template,
        fallback: config.fallback.clone(),
        timings,
    };
    let mut controller = FailoverController::new(cloud, prober, names, settings, &cli.instance_id);

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                error!(error = %e, "cannot listen for ctrl-c, stop the process another way");
                // Keep the sender alive so the controller keeps running.
                std::future::pending::<()>().await;
            }
        }
    });

    controller.run(shutdown_rx).await?;
    info!("vipwatchd stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const REQUIRED: [&str; 11] = [
        "vipwatchd",
        "--instance-id",
        "i-0abc",
        "--security-group",
        "sg-1",
        "--keypair",
        "ops",
        "--user-data-file",
        "bootstrap.sh",
        "--route-destination",
        "10.0.0.10/32",
    ];

    #[test]
    fn parses_required_flags() {
        let cli = Cli::try_parse_from(REQUIRED).unwrap();
        assert_eq!(cli.instance_id, "i-0abc");
        assert_eq!(cli.key_name, "ops");
        assert_eq!(cli.route_destination, "10.0.0.10/32".parse::<Ipv4Net>().unwrap());
        assert_eq!(cli.log_format, LogFormat::Text);
        assert!(cli.config.is_none());
    }

    #[test]
    fn rejects_bad_cidr() {
        let mut args = REQUIRED.to_vec();
        args[10] = "10.0.0.300/32";
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn missing_instance_id_is_an_error() {
        let args: Vec<&str> = REQUIRED
            .iter()
            .copied()
            .filter(|a| *a != "--instance-id" && *a != "i-0abc")
            .collect();
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[aws]\nregion = \"us-east-1\"\nprofile = \"file\"\n[monitor]\ninterval = \"10s\""
        )
        .unwrap();

        let path = file.path().to_string_lossy().to_string();
        let mut args = REQUIRED.to_vec();
        args.extend(["--config", path.as_str(), "--profile", "cli"]);
        let cli = Cli::try_parse_from(args).unwrap();
        let config = load_config(&cli).unwrap();

        assert_eq!(config.aws.region.as_deref(), Some("us-east-1"));
        assert_eq!(config.aws.profile.as_deref(), Some("cli"));
        assert_eq!(config.timings().unwrap().interval.as_secs(), 10);
    }
}
