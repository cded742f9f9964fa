use std::{net::SocketAddr, path::PathBuf, process::ExitCode};

use clap::Parser;

use common_net::telemetry;
use operator::{BoxError, OperatorConfig, OperatorSettings};

#[derive(Debug, Parser)]
#[command(author, version, about = "Operator node: watches the robot feed and sends commands")]
struct OperatorCli {
    #[arg(long = "config", value_name = "PATH")]
    config_path: Option<PathBuf>,

    /// Robot signaling url, e.g. ws://robot:8765
    #[arg(long, value_name = "URL")]
    robot_url: Option<String>,

    #[arg(long, value_name = "ADDR")]
    media_bind: Option<SocketAddr>,

    #[arg(long, value_name = "IP")]
    advertise_ip: Option<String>,

    #[arg(long, value_name = "MS")]
    retry_interval_ms: Option<u64>,
}

impl OperatorCli {
    fn resolve_config_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            return Some(path.clone());
        }
        std::env::var("OPERATOR_CONFIG_PATH").ok().map(PathBuf::from)
    }

    fn apply_overrides(&self, settings: &mut OperatorSettings) {
        if let Some(url) = &self.robot_url {
            settings.robot_url = url.clone();
        }
        if let Some(addr) = self.media_bind {
            settings.media_bind_addr = addr.to_string();
        }
        if let Some(ip) = &self.advertise_ip {
            settings.advertise_ip = ip.clone();
        }
        if let Some(ms) = self.retry_interval_ms {
            settings.retry_interval_ms = ms;
        }
    }
}

fn build_config(cli: &OperatorCli) -> Result<OperatorConfig, BoxError> {
    let mut settings = match cli.resolve_config_path() {
        Some(path) => OperatorSettings::from_file(&path)?,
        None => OperatorSettings::from_env()?,
    };
    cli.apply_overrides(&mut settings);
    settings.into_config()
}

#[tokio::main]
async fn main() -> ExitCode {
    telemetry::init("operator");

    let cli = OperatorCli::parse();
    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "operator: invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match operator::run_with_ctrl_c(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "operator stopped with an error");
            ExitCode::FAILURE
        }
    }
}
