//! Viewer/controller node: connects to the robot, negotiates a media
//! session as the controlling peer, reports latency and turns keystrokes
//! into commands. Reconnects until told to stop.

use std::{
    fs,
    net::{IpAddr, SocketAddr},
    path::Path,
    pin::pin,
    sync::Arc,
    time::Duration,
};

use common_net::{
    clock::{self, Clock},
    config::{env_or, SessionSettings},
    latency::Latency,
    link::{self, LinkEnd},
    media::{MediaEngine, UdpMediaEngine},
    message::PeerRole,
    peer::{CloseReason, Collaborators, PeerId, PeerMachine, SessionInput},
    registry::SessionRegistry,
    shutdown::{self, ShutdownReceiver},
    transport::{ControlChannel, TransportError, WsChannel},
};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, watch},
    time,
};
use tracing::{debug, info, warn};

pub mod keys;
pub mod viewer;

pub use keys::{KeyCommand, KeyMapper};

pub type BoxError = common_net::BoxError;

const ENV_PREFIX: &str = "OPERATOR";
const DEFAULT_ROBOT_URL: &str = "ws://127.0.0.1:8765";
const ROBOT_PEER_ID: &str = "robot";
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OperatorSettings {
    pub robot_url: String,
    pub retry_interval_ms: u64,
    pub media_bind_addr: String,
    /// IP placed in media candidates; empty means the bound address.
    pub advertise_ip: String,
    pub latency_report_interval_ms: u64,
    pub session: SessionSettings,
}

impl Default for OperatorSettings {
    fn default() -> Self {
        Self {
            robot_url: DEFAULT_ROBOT_URL.into(),
            retry_interval_ms: 1_000,
            media_bind_addr: "0.0.0.0:0".into(),
            advertise_ip: String::new(),
            latency_report_interval_ms: 1_000,
            session: SessionSettings::default(),
        }
    }
}

impl OperatorSettings {
    pub fn from_env() -> Result<Self, BoxError> {
        let defaults = Self::default();
        Ok(Self {
            robot_url: env_or("OPERATOR_ROBOT_URL", defaults.robot_url)?,
            retry_interval_ms: env_or("OPERATOR_RETRY_INTERVAL_MS", defaults.retry_interval_ms)?,
            media_bind_addr: env_or("OPERATOR_MEDIA_BIND_ADDR", defaults.media_bind_addr)?,
            advertise_ip: env_or("OPERATOR_ADVERTISE_IP", defaults.advertise_ip)?,
            latency_report_interval_ms: env_or(
                "OPERATOR_LATENCY_REPORT_INTERVAL_MS",
                defaults.latency_report_interval_ms,
            )?,
            session: SessionSettings::from_env(ENV_PREFIX, defaults.session)?,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, BoxError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn into_config(self) -> Result<OperatorConfig, BoxError> {
        OperatorConfig::from_settings(self)
    }
}

#[derive(Debug, Clone)]
pub struct OperatorConfig {
    pub robot_url: String,
    pub retry_interval: Duration,
    pub media_bind_addr: SocketAddr,
    pub advertise_ip: Option<IpAddr>,
    pub latency_report_interval: Duration,
    pub session: SessionSettings,
}

impl OperatorConfig {
    pub fn from_settings(settings: OperatorSettings) -> Result<Self, BoxError> {
        settings.session.validate()?;
        if !settings.robot_url.starts_with("ws://") && !settings.robot_url.starts_with("wss://") {
            return Err(format!("robot_url must be a ws:// url, got {:?}", settings.robot_url).into());
        }
        let advertise_ip = match settings.advertise_ip.trim() {
            "" => None,
            raw => Some(raw.parse()?),
        };
        Ok(Self {
            robot_url: settings.robot_url,
            retry_interval: Duration::from_millis(settings.retry_interval_ms.max(1)),
            media_bind_addr: settings.media_bind_addr.parse()?,
            advertise_ip,
            latency_report_interval: Duration::from_millis(
                settings.latency_report_interval_ms.max(1),
            ),
            session: settings.session,
        })
    }

    pub fn from_env() -> Result<Self, BoxError> {
        OperatorSettings::from_env()?.into_config()
    }
}

/// How one connection attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The operator asked to stop, by key or shutdown.
    Quit,
    /// The robot or the session went away; the caller may reconnect.
    Disconnected(LinkEnd),
}

pub struct Operator {
    config: OperatorConfig,
    engine: Arc<UdpMediaEngine>,
    clock: Arc<dyn Clock>,
    latency: watch::Sender<Latency>,
}

impl Operator {
    /// Bind the media socket. Nothing is connected yet.
    pub async fn bind(config: OperatorConfig) -> Result<Self, BoxError> {
        let clock = clock::system();
        let engine = UdpMediaEngine::bind(
            config.media_bind_addr,
            config.advertise_ip,
            clock.clone(),
            config.session.media_queue_capacity,
        )
        .await?;
        info!(media = %engine.advertised_addr(), "operator media socket bound");
        let (latency, _) = watch::channel(Latency::Unknown);
        Ok(Self {
            config,
            engine: Arc::new(engine),
            clock,
            latency,
        })
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    /// Latest smoothed latency of the current session.
    pub fn latency_watch(&self) -> watch::Receiver<Latency> {
        self.latency.subscribe()
    }

    /// Connect, run a session, and reconnect after `retry_interval` whenever
    /// the robot is unreachable or the session ends, until a `Quit` key or
    /// shutdown.
    pub async fn run(
        &self,
        mut keys: mpsc::UnboundedReceiver<KeyCommand>,
        mut shutdown_rx: ShutdownReceiver,
    ) -> Result<(), BoxError> {
        let mut attempt = 0u64;
        while !shutdown::is_triggered(&shutdown_rx) {
            attempt += 1;
            match WsChannel::connect(&self.config.robot_url).await {
                Ok(mut channel) => {
                    info!(url = %self.config.robot_url, attempt, "connected to robot");
                    match self.run_once(&mut channel, &mut keys, &mut shutdown_rx).await {
                        Ok(SessionEnd::Quit) => break,
                        Ok(SessionEnd::Disconnected(end)) => {
                            warn!(?end, "session with robot ended, reconnecting")
                        }
                        Err(err) => warn!(%err, "control channel failed, reconnecting"),
                    }
                }
                Err(err) => {
                    debug!(url = %self.config.robot_url, attempt, %err, "robot unreachable")
                }
            }

            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = time::sleep(self.config.retry_interval) => {}
            }
        }
        info!(attempts = attempt, "operator stopped");
        Ok(())
    }

    /// One session over an already connected channel. The session offers
    /// as controller; key commands are sent once the media path is up.
    pub async fn run_once<C>(
        &self,
        channel: &mut C,
        keys: &mut mpsc::UnboundedReceiver<KeyCommand>,
        shutdown_rx: &mut ShutdownReceiver,
    ) -> Result<SessionEnd, TransportError>
    where
        C: ControlChannel + ?Sized,
    {
        let registry = SessionRegistry::new(self.clock.clone(), self.config.session.liveness_timeout());
        let engine: Arc<dyn MediaEngine> = self.engine.clone();
        let collab = Collaborators::new(engine, self.clock.clone());
        let parts = PeerMachine::build(
            PeerId::from(ROBOT_PEER_ID),
            collab,
            self.config.session.clone(),
        );
        let handle = parts.session.handle.clone();

        self.latency.send_replace(Latency::Unknown);
        let (stop_viewer, viewer_stop_rx) = shutdown::channel();
        let viewer = tokio::spawn(viewer::watch_latency(
            self.engine.subscribe(),
            handle.clock_offset_watch(),
            self.config.session.latency_smoothing,
            self.config.latency_report_interval,
            self.latency.clone(),
            viewer_stop_rx,
        ));

        let mut session = pin!(link::run_session(
            channel,
            &registry,
            parts,
            Some(PeerRole::Controller),
            |_| {},
        ));
        let mut quit = false;
        let mut keys_open = true;
        let mut sweep = time::interval(SWEEP_INTERVAL);

        let result = loop {
            tokio::select! {
                result = &mut session => break result,
                _ = sweep.tick() => {
                    if !registry.sweep().await.is_empty() {
                        warn!("robot went silent, closing session");
                    }
                }
                key = keys.recv(), if keys_open && !quit => match key {
                    Some(KeyCommand::Quit) => {
                        info!("quit requested");
                        quit = true;
                        handle.close(CloseReason::Requested);
                    }
                    Some(command) => {
                        let Some(message) = command.to_message(self.clock.now_micros()) else {
                            continue;
                        };
                        if !handle.state().is_live() {
                            warn!(state = %handle.state(), ?command, "not connected, command dropped");
                        } else if !handle.send(SessionInput::Send(message)) {
                            warn!(?command, "session gone, command dropped");
                        }
                    }
                    None => keys_open = false,
                },
                changed = shutdown_rx.changed(), if !quit => {
                    if changed.is_err() || shutdown::is_triggered(shutdown_rx) {
                        quit = true;
                        handle.close(CloseReason::Requested);
                    }
                }
            }
        };

        shutdown::trigger(&stop_viewer);
        match viewer.await {
            Ok(stats) => info!(
                frames = stats.frames,
                dropped = stats.dropped,
                latency = %stats.latency,
                "viewer stopped"
            ),
            Err(err) => warn!(%err, "viewer task failed"),
        }

        let end = result?;
        Ok(if quit {
            SessionEnd::Quit
        } else {
            SessionEnd::Disconnected(end)
        })
    }
}

/// Run with stdin keys and Ctrl-C handling.
pub async fn run_with_ctrl_c(config: OperatorConfig) -> Result<(), BoxError> {
    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let ctrl_c = shutdown::trigger_on_ctrl_c(shutdown_tx, "operator");
    let (keys_tx, keys_rx) = mpsc::unbounded_channel();
    let reader = keys::spawn_stdin_reader(keys_tx);

    let operator = Operator::bind(config).await?;
    let result = operator.run(keys_rx, shutdown_rx).await;

    ctrl_c.abort();
    if let Some(reader) = reader {
        reader.abort();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_target_local_robot() {
        let config = OperatorSettings::default().into_config().expect("config");
        assert_eq!(config.robot_url, "ws://127.0.0.1:8765");
        assert_eq!(config.retry_interval, Duration::from_secs(1));
        assert_eq!(config.session.ping_interval(), Some(Duration::from_secs(5)));
        assert_eq!(config.advertise_ip, None);
    }

    #[test]
    fn non_websocket_url_is_rejected() {
        let settings = OperatorSettings {
            robot_url: "http://robot:8765".into(),
            ..OperatorSettings::default()
        };
        assert!(settings.into_config().is_err());
    }

    #[test]
    fn file_settings_override_defaults() {
        let settings: OperatorSettings =
            serde_json::from_str(r#"{"robot_url": "ws://robot:8765", "advertise_ip": "10.0.0.9"}"#)
                .expect("json");
        let config = settings.into_config().expect("config");
        assert_eq!(config.robot_url, "ws://robot:8765");
        assert_eq!(config.advertise_ip, Some("10.0.0.9".parse().expect("ip")));
        assert_eq!(config.latency_report_interval, Duration::from_secs(1));
    }
}
