use std::{fs, future::Future, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use common_net::{
    alignment::{read_jsonl, replay_state_at},
    clock::{self, Clock},
    config::SessionSettings,
    media::{MediaEngine, UdpMediaEngine},
    message::{ControlKind, ControlMessage, PeerRole},
    peer::PeerId,
    shutdown::{self, ShutdownSender},
    telemetry,
    transport::{ControlChannel, WsChannel},
};
use recorder::{read_units, BoxError, Recorder, RecorderSettings, RecordingEnd};
use robot::{RobotReady, RobotSettings};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_tungstenite::MaybeTlsStream;

const WAIT: Duration = Duration::from_secs(5);

async fn start_robot() -> Result<(RobotReady, ShutdownSender, JoinHandle<Result<(), BoxError>>), BoxError> {
    telemetry::init("recorder-test");
    let settings = RobotSettings {
        bind_addr: "127.0.0.1:0".into(),
        metrics_addr: String::new(),
        media_bind_addr: "127.0.0.1:0".into(),
        frame_rate: 50,
        ..RobotSettings::default()
    };
    let mut config = settings.into_config()?;
    let (ready_tx, ready_rx) = oneshot::channel();
    config.ready_tx = Some(ready_tx);
    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let task = tokio::spawn(robot::run(config, shutdown_rx));
    let ready = timeout(WAIT, ready_rx).await??;
    Ok((ready, shutdown_tx, task))
}

fn recorder_settings(robot: SocketAddr, output_dir: &Path) -> RecorderSettings {
    RecorderSettings {
        robot_url: format!("ws://{robot}"),
        output_dir: output_dir.display().to_string(),
        media_bind_addr: "127.0.0.1:0".into(),
        session: SessionSettings {
            ping_interval_ms: 200,
            ..SessionSettings::default()
        },
        ..RecorderSettings::default()
    }
}

async fn eventually<F, Fut>(mut check: F) -> Result<(), BoxError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(WAIT, async {
        while !check().await {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;
    Ok(())
}

fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|meta| meta.len()).unwrap_or(0)
}

/// Controller speaking the wire protocol directly.
struct Controller {
    channel: WsChannel<MaybeTlsStream<TcpStream>>,
    _engine: UdpMediaEngine,
    clock: Arc<dyn Clock>,
}

impl Controller {
    async fn join(robot: SocketAddr) -> Result<Self, BoxError> {
        let clock = clock::system();
        let engine = UdpMediaEngine::bind("127.0.0.1:0".parse()?, None, clock.clone(), 64).await?;
        let mut channel = WsChannel::connect(&format!("ws://{robot}")).await?;
        let robot_id = PeerId::from("robot");

        for message in engine.create_offer(&robot_id, PeerRole::Controller).await? {
            channel.send_message(&message).await?;
        }
        loop {
            let message = timeout(WAIT, channel.recv_message()).await??;
            if message.kind().is_negotiation()
                && engine.negotiate(&robot_id, &message).await?.established
            {
                break;
            }
        }

        channel
            .send_message(&ControlMessage::ping(1, clock.now_micros()))
            .await?;
        loop {
            let message = timeout(WAIT, channel.recv_message()).await??;
            if message.kind() == ControlKind::Pong {
                break;
            }
        }

        Ok(Self {
            channel,
            _engine: engine,
            clock,
        })
    }

    async fn send(&mut self, build: impl FnOnce(i64) -> ControlMessage) -> Result<(), BoxError> {
        let message = build(self.clock.now_micros());
        self.channel.send_message(&message).await?;
        Ok(())
    }
}

#[tokio::test]
async fn relayed_commands_are_aligned_with_recorded_media() -> Result<(), BoxError> {
    let output = tempfile::tempdir()?;
    let (ready, robot_shutdown, robot_task) = start_robot().await?;

    let config = recorder_settings(ready.signaling_addr, output.path()).into_config()?;
    let units_path = config.units_path();
    let commands_path = config.commands_path();
    let recorder = Recorder::bind(config).await?;
    let (recorder_shutdown, recorder_shutdown_rx) = shutdown::channel();
    let recording = tokio::spawn(async move { recorder.run(recorder_shutdown_rx).await });

    // Media on disk means the robot has the recorder's session live.
    eventually(|| {
        let path = units_path.clone();
        async move { file_len(&path) > 0 }
    })
    .await?;

    let mut controller = Controller::join(ready.signaling_addr).await?;
    controller.send(ControlMessage::play).await?;
    sleep(Duration::from_millis(200)).await;
    controller.send(|now| ControlMessage::text("hello", now)).await?;
    sleep(Duration::from_millis(200)).await;
    controller.send(ControlMessage::pause).await?;

    eventually(|| {
        let path = commands_path.clone();
        async move { read_jsonl(&path).map(|entries| entries.len() == 3).unwrap_or(false) }
    })
    .await?;

    shutdown::trigger(&recorder_shutdown);
    let summary = timeout(WAIT, recording).await???.ok_or("recorder never connected")?;
    assert_eq!(summary.end, RecordingEnd::Stopped);
    assert_eq!(summary.commands, 3);
    assert!(summary.media.units > 0);

    let entries = read_jsonl(&commands_path)?;
    let kinds: Vec<ControlKind> = entries.iter().map(|entry| entry.command.kind()).collect();
    assert_eq!(kinds, vec![ControlKind::Play, ControlKind::Text, ControlKind::Pause]);
    for pair in entries.windows(2) {
        assert!(pair[0].media_sequence_at_receipt <= pair[1].media_sequence_at_receipt);
        assert!(pair[0].received_at <= pair[1].received_at);
    }
    assert!(entries[0].media_sequence_at_receipt < entries[2].media_sequence_at_receipt);

    let paused_at = entries[2].media_sequence_at_receipt;
    let state = replay_state_at(&entries, paused_at);
    assert!(!state.playing);
    assert_eq!(state.overlay_text, "hello");

    let units = read_units(&units_path)?;
    assert_eq!(units.len() as u64, summary.media.units);
    assert!(units.iter().all(|unit| unit.arrival_timestamp.is_some()));
    assert!(units.windows(2).all(|pair| pair[0].sequence < pair[1].sequence));

    shutdown::trigger(&robot_shutdown);
    timeout(WAIT, robot_task).await???;
    Ok(())
}

#[tokio::test]
async fn robot_shutdown_ends_the_recording() -> Result<(), BoxError> {
    let output = tempfile::tempdir()?;
    let (ready, robot_shutdown, robot_task) = start_robot().await?;

    let config = recorder_settings(ready.signaling_addr, output.path()).into_config()?;
    let units_path = config.units_path();
    let recorder = Recorder::bind(config).await?;
    let (_recorder_shutdown, recorder_shutdown_rx) = shutdown::channel();
    let recording = tokio::spawn(async move { recorder.run(recorder_shutdown_rx).await });

    eventually(|| {
        let path = units_path.clone();
        async move { file_len(&path) > 0 }
    })
    .await?;

    shutdown::trigger(&robot_shutdown);
    timeout(WAIT, robot_task).await???;

    let summary = timeout(WAIT, recording).await???.ok_or("recorder never connected")?;
    assert_eq!(summary.end, RecordingEnd::RobotClosed);
    assert_eq!(summary.commands, 0);
    assert!(summary.media.units > 0);
    Ok(())
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn media_write_failure_ends_the_recording() -> Result<(), BoxError> {
    let output = tempfile::tempdir()?;
    let (ready, robot_shutdown, robot_task) = start_robot().await?;

    let config = recorder_settings(ready.signaling_addr, output.path()).into_config()?;
    std::os::unix::fs::symlink("/dev/full", config.units_path())?;
    let recorder = Recorder::bind(config).await?;
    let (_recorder_shutdown, recorder_shutdown_rx) = shutdown::channel();

    // Nothing but the disk failure can end this recording.
    let outcome = timeout(WAIT, recorder.run(recorder_shutdown_rx)).await?;
    let err = outcome.expect_err("media cannot be written");
    assert!(err.to_string().contains("recording io"), "{err}");

    shutdown::trigger(&robot_shutdown);
    timeout(WAIT, robot_task).await???;
    Ok(())
}

#[tokio::test]
async fn gives_up_after_max_retries() -> Result<(), BoxError> {
    telemetry::init("recorder-test");
    let output = tempfile::tempdir()?;
    let reserved = TcpListener::bind("127.0.0.1:0").await?;
    let nowhere = reserved.local_addr()?;
    drop(reserved);

    let settings = RecorderSettings {
        max_retries: 3,
        initial_backoff_ms: 10,
        max_backoff_ms: 20,
        ..recorder_settings(nowhere, output.path())
    };
    let recorder = Recorder::bind(settings.into_config()?).await?;
    let (_shutdown_tx, shutdown_rx) = shutdown::channel();

    let result = timeout(WAIT, recorder.run(shutdown_rx)).await?;
    let err = result.expect_err("robot is not there");
    assert!(err.to_string().contains("3 attempts"), "{err}");
    Ok(())
}

#[tokio::test]
async fn shutdown_during_backoff_is_not_an_error() -> Result<(), BoxError> {
    let output = tempfile::tempdir()?;
    let reserved = TcpListener::bind("127.0.0.1:0").await?;
    let nowhere = reserved.local_addr()?;
    drop(reserved);

    let recorder = Recorder::bind(recorder_settings(nowhere, output.path()).into_config()?).await?;
    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let recording = tokio::spawn(async move { recorder.run(shutdown_rx).await });

    sleep(Duration::from_millis(100)).await;
    shutdown::trigger(&shutdown_tx);
    let outcome = timeout(WAIT, recording).await???;
    assert!(outcome.is_none());
    Ok(())
}
