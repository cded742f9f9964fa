//! Recording node: joins the robot as a recorder, writes every received
//! media unit and an aligned log of the commands relayed to it, and stops
//! after one session.

use std::{
    fs,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    pin::pin,
    sync::Arc,
    time::Duration,
};

use common_net::{
    clock::{self, Clock},
    config::{env_or, SessionSettings},
    link::{self, LinkEnd},
    media::{MediaEngine, UdpMediaEngine},
    message::{ControlMessage, PeerRole},
    peer::{CloseReason, Collaborators, PeerId, PeerMachine},
    registry::SessionRegistry,
    shutdown::{self, ShutdownReceiver},
    transport::{ControlChannel, TransportError, WsChannel},
};
use serde::{Deserialize, Serialize};
use tokio::time;
use tracing::{error, info, warn};

pub mod recording;

pub use recording::{
    read_units, CommandRecorder, MediaRecorder, MediaStats, RecordingError, COMMANDS_FILE,
    UNITS_FILE,
};

pub type BoxError = common_net::BoxError;

const ENV_PREFIX: &str = "RECORDER";
const ROBOT_PEER_ID: &str = "robot";
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecorderSettings {
    pub robot_url: String,
    pub output_dir: String,
    /// Connection attempts before giving up.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub media_bind_addr: String,
    /// IP placed in media candidates; empty means the bound address.
    pub advertise_ip: String,
    pub session: SessionSettings,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            robot_url: "ws://127.0.0.1:8765".into(),
            output_dir: "output".into(),
            max_retries: 10,
            initial_backoff_ms: 2_000,
            max_backoff_ms: 10_000,
            media_bind_addr: "0.0.0.0:0".into(),
            advertise_ip: String::new(),
            session: SessionSettings::default(),
        }
    }
}

impl RecorderSettings {
    pub fn from_env() -> Result<Self, BoxError> {
        let defaults = Self::default();
        Ok(Self {
            robot_url: env_or("RECORDER_ROBOT_URL", defaults.robot_url)?,
            output_dir: env_or("RECORDER_OUTPUT_DIR", defaults.output_dir)?,
            max_retries: env_or("RECORDER_MAX_RETRIES", defaults.max_retries)?,
            initial_backoff_ms: env_or("RECORDER_INITIAL_BACKOFF_MS", defaults.initial_backoff_ms)?,
            max_backoff_ms: env_or("RECORDER_MAX_BACKOFF_MS", defaults.max_backoff_ms)?,
            media_bind_addr: env_or("RECORDER_MEDIA_BIND_ADDR", defaults.media_bind_addr)?,
            advertise_ip: env_or("RECORDER_ADVERTISE_IP", defaults.advertise_ip)?,
            session: SessionSettings::from_env(ENV_PREFIX, defaults.session)?,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, BoxError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn into_config(self) -> Result<RecorderConfig, BoxError> {
        RecorderConfig::from_settings(self)
    }
}

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub robot_url: String,
    pub output_dir: PathBuf,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub media_bind_addr: SocketAddr,
    pub advertise_ip: Option<IpAddr>,
    pub session: SessionSettings,
}

impl RecorderConfig {
    pub fn from_settings(settings: RecorderSettings) -> Result<Self, BoxError> {
        settings.session.validate()?;
        if settings.max_retries == 0 {
            return Err("max_retries must be at least 1".into());
        }
        if settings.output_dir.trim().is_empty() {
            return Err("output_dir must not be empty".into());
        }
        let advertise_ip = match settings.advertise_ip.trim() {
            "" => None,
            raw => Some(raw.parse()?),
        };
        Ok(Self {
            robot_url: settings.robot_url,
            output_dir: PathBuf::from(settings.output_dir),
            max_retries: settings.max_retries,
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms.max(settings.initial_backoff_ms)),
            media_bind_addr: settings.media_bind_addr.parse()?,
            advertise_ip,
            session: settings.session,
        })
    }

    pub fn from_env() -> Result<Self, BoxError> {
        RecorderSettings::from_env()?.into_config()
    }

    pub fn commands_path(&self) -> PathBuf {
        self.output_dir.join(COMMANDS_FILE)
    }

    pub fn units_path(&self) -> PathBuf {
        self.output_dir.join(UNITS_FILE)
    }
}

/// Delay before connection attempt `attempt + 1`: doubles from `initial`
/// and never exceeds `max`.
pub fn backoff_delay(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    initial.saturating_mul(factor).min(max)
}

/// Why the recording stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingEnd {
    /// Shutdown was requested locally.
    Stopped,
    RobotClosed,
    SessionClosed,
    Failed(TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSummary {
    pub commands: usize,
    pub media: MediaStats,
    pub end: RecordingEnd,
}

pub struct Recorder {
    config: RecorderConfig,
    engine: Arc<UdpMediaEngine>,
    clock: Arc<dyn Clock>,
}

impl Recorder {
    pub async fn bind(config: RecorderConfig) -> Result<Self, BoxError> {
        let clock = clock::system();
        let engine = UdpMediaEngine::bind(
            config.media_bind_addr,
            config.advertise_ip,
            clock.clone(),
            config.session.media_queue_capacity,
        )
        .await?;
        info!(media = %engine.advertised_addr(), "recorder media socket bound");
        Ok(Self {
            config,
            engine: Arc::new(engine),
            clock,
        })
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Connect with backoff and record one session. Returns `None` when
    /// shutdown arrives before a connection, and an error once every
    /// attempt has failed.
    pub async fn run(
        &self,
        mut shutdown_rx: ShutdownReceiver,
    ) -> Result<Option<RecordingSummary>, BoxError> {
        let max = self.config.max_retries;
        for attempt in 1..=max {
            if shutdown::is_triggered(&shutdown_rx) {
                return Ok(None);
            }
            match WsChannel::connect(&self.config.robot_url).await {
                Ok(mut channel) => {
                    info!(url = %self.config.robot_url, attempt, "connected to robot");
                    let summary = self.record_once(&mut channel, &mut shutdown_rx).await?;
                    return Ok(Some(summary));
                }
                Err(err) => warn!(url = %self.config.robot_url, attempt, max, %err, "robot unreachable"),
            }
            if attempt == max {
                break;
            }

            let delay = backoff_delay(self.config.initial_backoff, self.config.max_backoff, attempt);
            info!(?delay, "retrying");
            tokio::select! {
                _ = shutdown_rx.changed() => return Ok(None),
                _ = time::sleep(delay) => {}
            }
        }

        Err(format!("robot at {} unreachable after {max} attempts", self.config.robot_url).into())
    }

    /// Record one session over a connected channel until the robot goes
    /// away or shutdown is requested. The output files are replaced.
    pub async fn record_once<C>(
        &self,
        channel: &mut C,
        shutdown_rx: &mut ShutdownReceiver,
    ) -> Result<RecordingSummary, BoxError>
    where
        C: ControlChannel + ?Sized,
    {
        let cursor = Arc::new(common_net::alignment::MediaCursor::new());
        let mut commands =
            CommandRecorder::create(self.config.commands_path(), cursor.clone(), self.clock.clone())?;
        let media = MediaRecorder::create(self.config.units_path(), cursor)?;
        info!(
            commands = %commands.path().display(),
            media = %media.path().display(),
            "recording"
        );

        let (stop_media, media_stop_rx) = shutdown::channel();
        let mut media_task = tokio::spawn(recording::record_media(
            self.engine.subscribe(),
            media,
            media_stop_rx,
        ));

        let registry = SessionRegistry::new(self.clock.clone(), self.config.session.liveness_timeout());
        let engine: Arc<dyn MediaEngine> = self.engine.clone();
        let parts = PeerMachine::build(
            PeerId::from(ROBOT_PEER_ID),
            Collaborators::new(engine, self.clock.clone()),
            self.config.session.clone(),
        );
        let handle = parts.session.handle.clone();

        let mut stopping = false;
        let mut media_finished = None;
        let result = {
            let observer = |message: &ControlMessage| match commands.record(message) {
                Ok(Some(entry)) => info!(
                    kind = %entry.command.kind(),
                    media_sequence = entry.media_sequence_at_receipt,
                    "command recorded"
                ),
                Ok(None) => {}
                Err(err) => error!(%err, "command log write failed"),
            };
            let mut session = pin!(link::run_session(
                channel,
                &registry,
                parts,
                Some(PeerRole::Recorder),
                observer,
            ));
            let mut sweep = time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    result = &mut session => break result,
                    _ = sweep.tick() => {
                        if !registry.sweep().await.is_empty() {
                            warn!("robot went silent, closing session");
                        }
                    }
                    joined = &mut media_task, if media_finished.is_none() => {
                        match &joined {
                            Ok(Err(err)) => error!(%err, "media recording failed, ending session"),
                            Err(err) => error!(%err, "media task failed, ending session"),
                            Ok(Ok(_)) => warn!("media queue closed, ending session"),
                        }
                        media_finished = Some(joined);
                        handle.close(CloseReason::Requested);
                    }
                    _ = shutdown_rx.changed(), if !stopping => {
                        stopping = true;
                        handle.close(CloseReason::Requested);
                    }
                }
            }
        };

        let media = match media_finished {
            Some(joined) => joined??,
            None => {
                shutdown::trigger(&stop_media);
                media_task.await??
            }
        };

        let end = match result {
            _ if stopping => RecordingEnd::Stopped,
            Ok(LinkEnd::RemoteClosed) => RecordingEnd::RobotClosed,
            Ok(LinkEnd::SessionClosed) => RecordingEnd::SessionClosed,
            Err(err) => RecordingEnd::Failed(err),
        };
        let summary = RecordingSummary {
            commands: commands.entries().len(),
            media,
            end,
        };
        info!(
            commands = summary.commands,
            units = summary.media.units,
            dropped = summary.media.dropped,
            end = ?summary.end,
            "recording finished"
        );
        Ok(summary)
    }
}

pub async fn run_with_ctrl_c(config: RecorderConfig) -> Result<Option<RecordingSummary>, BoxError> {
    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let ctrl_c = shutdown::trigger_on_ctrl_c(shutdown_tx, "recorder");
    let recorder = Recorder::bind(config).await?;
    let result = recorder.run(shutdown_rx).await;
    ctrl_c.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let initial = Duration::from_secs(2);
        let max = Duration::from_secs(10);
        let delays: Vec<u64> = (1..=6)
            .map(|attempt| backoff_delay(initial, max, attempt).as_secs())
            .collect();
        assert_eq!(delays, vec![2, 4, 8, 10, 10, 10]);
        assert_eq!(backoff_delay(initial, max, 200), max);
    }

    #[test]
    fn defaults_follow_recording_layout() {
        let config = RecorderSettings::default().into_config().expect("config");
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.commands_path(), PathBuf::from("output").join("commands.jsonl"));
        assert_eq!(config.units_path(), PathBuf::from("output").join("recording.units"));
    }

    #[test]
    fn zero_retries_is_rejected() {
        let settings = RecorderSettings {
            max_retries: 0,
            ..RecorderSettings::default()
        };
        assert!(settings.into_config().is_err());
    }
}
