use std::{net::SocketAddr, path::PathBuf, process::ExitCode};

use clap::Parser;

use common_net::telemetry;
use recorder::{BoxError, RecorderConfig, RecorderSettings};

#[derive(Debug, Parser)]
#[command(author, version, about = "Recorder node: records the robot feed and aligned commands")]
struct RecorderCli {
    #[arg(long = "config", value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[arg(long, value_name = "URL")]
    robot_url: Option<String>,

    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    #[arg(long, value_name = "N")]
    max_retries: Option<u32>,

    #[arg(long, value_name = "ADDR")]
    media_bind: Option<SocketAddr>,

    #[arg(long, value_name = "IP")]
    advertise_ip: Option<String>,
}

impl RecorderCli {
    fn resolve_config_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            return Some(path.clone());
        }
        std::env::var("RECORDER_CONFIG_PATH").ok().map(PathBuf::from)
    }

    fn apply_overrides(&self, settings: &mut RecorderSettings) {
        if let Some(url) = &self.robot_url {
            settings.robot_url = url.clone();
        }
        if let Some(dir) = &self.output_dir {
            settings.output_dir = dir.display().to_string();
        }
        if let Some(retries) = self.max_retries {
            settings.max_retries = retries;
        }
        if let Some(addr) = self.media_bind {
            settings.media_bind_addr = addr.to_string();
        }
        if let Some(ip) = &self.advertise_ip {
            settings.advertise_ip = ip.clone();
        }
    }
}

fn build_config(cli: &RecorderCli) -> Result<RecorderConfig, BoxError> {
    let mut settings = match cli.resolve_config_path() {
        Some(path) => RecorderSettings::from_file(&path)?,
        None => RecorderSettings::from_env()?,
    };
    cli.apply_overrides(&mut settings);
    settings.into_config()
}

#[tokio::main]
async fn main() -> ExitCode {
    telemetry::init("recorder");

    let cli = RecorderCli::parse();
    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, "recorder: invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match recorder::run_with_ctrl_c(config).await {
        Ok(Some(summary)) => {
            tracing::info!(commands = summary.commands, units = summary.media.units, "recorder done");
            ExitCode::SUCCESS
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "recorder stopped with an error");
            ExitCode::FAILURE
        }
    }
}
