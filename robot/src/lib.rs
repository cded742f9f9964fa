//! Media source node: accepts control channels over WebSocket, answers
//! offers, relays controller commands and streams synthetic capture to every
//! connected peer.

use std::{
    fs,
    net::{IpAddr, SocketAddr},
    path::Path,
    sync::Arc,
    time::Duration,
};

use common_net::{
    clock,
    config::{env_or, SessionSettings},
    media::{MediaEngine, SyntheticCapture, UdpMediaEngine},
    metrics,
    peer::{CloseReason, Collaborators},
    registry::{spawn_sweeper, SessionRegistry},
    shutdown::{self, ShutdownReceiver},
};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::oneshot, time::timeout};
use tracing::{info, warn};

pub mod node;
pub mod pump;

pub use node::RobotNode;

pub type BoxError = common_net::BoxError;

pub const METRICS_PATH: &str = "/metrics";
const ENV_PREFIX: &str = "ROBOT";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8765";
const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9101";
const DEFAULT_MEDIA_BIND_ADDR: &str = "0.0.0.0:5004";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RobotSettings {
    pub bind_addr: String,
    /// Empty disables the exporter.
    pub metrics_addr: String,
    pub media_bind_addr: String,
    /// IP placed in media candidates; empty means the bound address.
    pub advertise_ip: String,
    pub frame_rate: u32,
    pub frame_width: usize,
    pub frame_height: usize,
    pub sweep_interval_ms: u64,
    pub session: SessionSettings,
}

impl Default for RobotSettings {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.into(),
            metrics_addr: DEFAULT_METRICS_ADDR.into(),
            media_bind_addr: DEFAULT_MEDIA_BIND_ADDR.into(),
            advertise_ip: String::new(),
            frame_rate: 30,
            frame_width: 64,
            frame_height: 48,
            sweep_interval_ms: 1_000,
            // The robot only answers pings; clients drive clock sync.
            session: SessionSettings::default().without_ping(),
        }
    }
}

impl RobotSettings {
    pub fn from_env() -> Result<Self, BoxError> {
        let defaults = Self::default();
        Ok(Self {
            bind_addr: env_or("ROBOT_BIND_ADDR", defaults.bind_addr)?,
            metrics_addr: env_or("ROBOT_METRICS_ADDR", defaults.metrics_addr)?,
            media_bind_addr: env_or("ROBOT_MEDIA_BIND_ADDR", defaults.media_bind_addr)?,
            advertise_ip: env_or("ROBOT_ADVERTISE_IP", defaults.advertise_ip)?,
            frame_rate: env_or("ROBOT_FRAME_RATE", defaults.frame_rate)?,
            frame_width: env_or("ROBOT_FRAME_WIDTH", defaults.frame_width)?,
            frame_height: env_or("ROBOT_FRAME_HEIGHT", defaults.frame_height)?,
            sweep_interval_ms: env_or("ROBOT_SWEEP_INTERVAL_MS", defaults.sweep_interval_ms)?,
            session: SessionSettings::from_env(ENV_PREFIX, defaults.session)?,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, BoxError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn into_config(self) -> Result<RobotConfig, BoxError> {
        RobotConfig::from_settings(self)
    }
}

/// Addresses the robot actually bound, reported once it is serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RobotReady {
    pub signaling_addr: SocketAddr,
    pub media_addr: SocketAddr,
}

#[derive(Debug)]
pub struct RobotConfig {
    pub bind_addr: SocketAddr,
    pub metrics_addr: Option<SocketAddr>,
    pub media_bind_addr: SocketAddr,
    pub advertise_ip: Option<IpAddr>,
    pub frame_rate: u32,
    pub frame_width: usize,
    pub frame_height: usize,
    pub sweep_interval: Duration,
    pub session: SessionSettings,
    pub ready_tx: Option<oneshot::Sender<RobotReady>>,
}

impl RobotConfig {
    pub fn from_settings(settings: RobotSettings) -> Result<Self, BoxError> {
        settings.session.validate()?;
        if settings.frame_rate == 0 {
            return Err("frame_rate must be positive".into());
        }
        Ok(Self {
            bind_addr: settings.bind_addr.parse()?,
            metrics_addr: parse_optional(&settings.metrics_addr)?,
            media_bind_addr: settings.media_bind_addr.parse()?,
            advertise_ip: parse_optional(&settings.advertise_ip)?,
            frame_rate: settings.frame_rate,
            frame_width: settings.frame_width,
            frame_height: settings.frame_height,
            sweep_interval: Duration::from_millis(settings.sweep_interval_ms.max(1)),
            session: settings.session,
            ready_tx: None,
        })
    }

    pub fn from_env() -> Result<Self, BoxError> {
        RobotSettings::from_env()?.into_config()
    }
}

fn parse_optional<T>(raw: &str) -> Result<Option<T>, BoxError>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    Ok(Some(raw.parse()?))
}

pub async fn run_with_ctrl_c(config: RobotConfig) -> Result<(), BoxError> {
    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let ctrl_c = shutdown::trigger_on_ctrl_c(shutdown_tx, "robot");
    let result = run(config, shutdown_rx).await;
    ctrl_c.abort();
    result
}

pub async fn run(config: RobotConfig, shutdown_rx: ShutdownReceiver) -> Result<(), BoxError> {
    let clock = clock::system();
    let capacity = config.session.media_queue_capacity;

    let engine = Arc::new(
        UdpMediaEngine::bind(
            config.media_bind_addr,
            config.advertise_ip,
            clock.clone(),
            capacity,
        )
        .await?,
    );
    let capture = SyntheticCapture::new(
        clock.clone(),
        config.frame_rate,
        config.frame_width,
        config.frame_height,
    );
    let registry = Arc::new(SessionRegistry::new(
        clock.clone(),
        config.session.liveness_timeout(),
    ));
    let engine_dyn: Arc<dyn MediaEngine> = engine.clone();
    let collab = Collaborators::new(engine_dyn.clone(), clock)
        .with_capture(capture.clone())
        .with_overlay(capture.clone());

    let listener = TcpListener::bind(config.bind_addr).await?;
    let ready = RobotReady {
        signaling_addr: listener.local_addr()?,
        media_addr: engine.local_addr()?,
    };
    info!(
        signaling = %ready.signaling_addr,
        media = %ready.media_addr,
        advertised = %engine.advertised_addr(),
        "robot node listening"
    );
    if let Some(tx) = config.ready_tx {
        let _ = tx.send(ready);
    }

    let metrics_task = config.metrics_addr.map(|addr| {
        metrics::spawn_metrics_exporter(addr, METRICS_PATH, "robot", shutdown_rx.clone())
    });
    let sweeper = spawn_sweeper(registry.clone(), config.sweep_interval, shutdown_rx.clone());
    let (frames, capture_task) = capture.start(capacity, shutdown_rx.clone());
    let pump_task = tokio::spawn(pump::run(frames, engine_dyn, shutdown_rx.clone()));

    let node = RobotNode::new(registry.clone(), collab, config.session);
    let mut connections = node.serve(listener, shutdown_rx).await;

    info!("robot node shutting down");
    registry.close_all(CloseReason::Requested).await;
    let drained = timeout(DRAIN_TIMEOUT, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = connections.len(), "connections did not drain in time");
        connections.abort_all();
    }

    for task in [sweeper, capture_task, pump_task] {
        let _ = task.await;
    }
    if let Some(task) = metrics_task {
        let _ = task.await;
    }
    Ok(())
}
