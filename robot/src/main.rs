use std::{net::SocketAddr, path::PathBuf, process::ExitCode};

use clap::Parser;

use common_net::telemetry;
use robot::{BoxError, RobotConfig, RobotSettings};

#[derive(Debug, Parser)]
#[command(author, version, about = "Robot node: media source and signaling endpoint")]
struct RobotCli {
    #[arg(long = "config", value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[arg(long, value_name = "ADDR")]
    bind: Option<SocketAddr>,

    #[arg(long, value_name = "ADDR")]
    media_bind: Option<SocketAddr>,

    #[arg(long, value_name = "IP")]
    advertise_ip: Option<String>,

    #[arg(long, value_name = "ADDR")]
    metrics_addr: Option<SocketAddr>,

    #[arg(long, action = clap::ArgAction::SetTrue)]
    no_metrics: bool,

    #[arg(long, value_name = "FPS")]
    frame_rate: Option<u32>,
}

impl RobotCli {
    fn resolve_config_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            return Some(path.clone());
        }
        std::env::var("ROBOT_CONFIG_PATH").ok().map(PathBuf::from)
    }

    fn apply_overrides(&self, settings: &mut RobotSettings) {
        if let Some(addr) = self.bind {
            settings.bind_addr = addr.to_string();
        }
        if let Some(addr) = self.media_bind {
            settings.media_bind_addr = addr.to_string();
        }
        if let Some(ip) = &self.advertise_ip {
            settings.advertise_ip = ip.clone();
        }
        if let Some(addr) = self.metrics_addr {
            settings.metrics_addr = addr.to_string();
        }
        if self.no_metrics {
            settings.metrics_addr.clear();
        }
        if let Some(rate) = self.frame_rate {
            settings.frame_rate = rate;
        }
    }
}

fn build_config(cli: &RobotCli) -> Result<RobotConfig, BoxError> {
    let mut settings = match cli.resolve_config_path() {
        Some(path) => RobotSettings::from_file(&path)?,
        None => RobotSettings::from_env()?,
    };
    cli.apply_overrides(&mut settings);
    settings.into_config()
}

#[tokio::main]
async fn main() -> ExitCode {
    telemetry::init("robot");

    let cli = RobotCli::parse();
    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "robot: invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match robot::run_with_ctrl_c(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "robot stopped with an error");
            ExitCode::FAILURE
        }
    }
}
