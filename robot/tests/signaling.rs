use std::{net::SocketAddr, sync::Arc, time::Duration};

use common_net::{
    clock::{self, Clock},
    config::SessionSettings,
    media::{recv_latest, MediaEngine, UdpMediaEngine},
    message::{ControlBody, ControlKind, ControlMessage, PeerRole},
    peer::PeerId,
    shutdown::{self, ShutdownSender},
    telemetry,
    transport::{ControlChannel, WsChannel},
};
use robot::{BoxError, RobotReady, RobotSettings};
use tokio::{
    net::TcpStream,
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::MaybeTlsStream;

const WAIT: Duration = Duration::from_secs(5);

struct TestRobot {
    ready: RobotReady,
    shutdown_tx: ShutdownSender,
    task: JoinHandle<Result<(), BoxError>>,
}

impl TestRobot {
    async fn start(session: SessionSettings, sweep_interval_ms: u64) -> Result<Self, BoxError> {
        telemetry::init("robot-test");

        let settings = RobotSettings {
            bind_addr: "127.0.0.1:0".into(),
            metrics_addr: String::new(),
            media_bind_addr: "127.0.0.1:0".into(),
            frame_rate: 50,
            sweep_interval_ms,
            session,
            ..RobotSettings::default()
        };
        let mut config = settings.into_config()?;
        let (ready_tx, ready_rx) = oneshot::channel();
        config.ready_tx = Some(ready_tx);

        let (shutdown_tx, shutdown_rx) = shutdown::channel();
        let task = tokio::spawn(robot::run(config, shutdown_rx));
        let ready = timeout(WAIT, ready_rx).await??;
        Ok(Self {
            ready,
            shutdown_tx,
            task,
        })
    }

    async fn stop(self) -> Result<(), BoxError> {
        shutdown::trigger(&self.shutdown_tx);
        timeout(WAIT, self.task).await???;
        Ok(())
    }
}

fn robot_session() -> SessionSettings {
    SessionSettings::default().without_ping()
}

struct Client {
    channel: WsChannel<MaybeTlsStream<TcpStream>>,
    engine: UdpMediaEngine,
    robot: PeerId,
    clock: Arc<dyn Clock>,
    nonce: u64,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Result<Self, BoxError> {
        let clock = clock::system();
        let engine =
            UdpMediaEngine::bind("127.0.0.1:0".parse()?, None, clock.clone(), 64).await?;
        let channel = WsChannel::connect(&format!("ws://{addr}")).await?;
        Ok(Self {
            channel,
            engine,
            robot: PeerId::from("robot"),
            clock,
            nonce: 0,
        })
    }

    async fn recv(&mut self) -> Result<ControlMessage, BoxError> {
        Ok(timeout(WAIT, self.channel.recv_message()).await??)
    }

    /// Offer, then feed replies to the engine until the media path is up.
    async fn negotiate(&mut self, role: PeerRole) -> Result<Vec<ControlKind>, BoxError> {
        for message in self.engine.create_offer(&self.robot, role).await? {
            self.channel.send_message(&message).await?;
        }
        let mut replies = Vec::new();
        loop {
            let message = self.recv().await?;
            replies.push(message.kind());
            if message.kind().is_negotiation()
                && self.engine.negotiate(&self.robot, &message).await?.established
            {
                return Ok(replies);
            }
        }
    }

    /// Ping and wait for the matching pong; everything the robot queued
    /// before it has then been processed.
    async fn sync(&mut self) -> Result<ControlMessage, BoxError> {
        self.nonce += 1;
        let nonce = self.nonce;
        self.channel
            .send_message(&ControlMessage::ping(nonce, self.clock.now_micros()))
            .await?;
        loop {
            let message = self.recv().await?;
            if matches!(message.body(), ControlBody::Pong { nonce: n, .. } if *n == nonce) {
                return Ok(message);
            }
        }
    }

    /// Ping and return whatever arrives next.
    async fn ping_and_recv(&mut self) -> Result<ControlMessage, BoxError> {
        self.nonce += 1;
        self.channel
            .send_message(&ControlMessage::ping(self.nonce, self.clock.now_micros()))
            .await?;
        self.recv().await
    }

    async fn recv_kind(&mut self, kind: ControlKind) -> Result<ControlMessage, BoxError> {
        loop {
            let message = self.recv().await?;
            if message.kind() == kind {
                return Ok(message);
            }
        }
    }
}

#[tokio::test]
async fn offer_is_answered_and_media_flows() -> Result<(), BoxError> {
    let robot = TestRobot::start(robot_session(), 1_000).await?;
    let mut client = Client::connect(robot.ready.signaling_addr).await?;
    let mut units = client.engine.subscribe();

    let replies = client.negotiate(PeerRole::Viewer).await?;
    assert_eq!(replies, vec![ControlKind::Answer, ControlKind::Candidate]);

    let first = timeout(WAIT, recv_latest(&mut units))
        .await?
        .ok_or("media queue closed")?;
    assert!(first.unit.arrival_timestamp.is_some());
    assert_eq!(first.unit.payload.len(), 64 * 48);

    robot.stop().await
}

#[tokio::test]
async fn pong_echoes_ping_timestamp() -> Result<(), BoxError> {
    let robot = TestRobot::start(robot_session(), 1_000).await?;
    let mut client = Client::connect(robot.ready.signaling_addr).await?;

    let before = client.clock.now_micros();
    let pong = client.sync().await?;
    match pong.body() {
        ControlBody::Pong { ping_sent_at, .. } => assert!(*ping_sent_at >= before),
        other => panic!("expected pong, got {other:?}"),
    }
    assert!(pong.sent_at().is_some());

    robot.stop().await
}

#[tokio::test]
async fn controller_commands_are_relayed_to_other_peers() -> Result<(), BoxError> {
    let robot = TestRobot::start(robot_session(), 1_000).await?;
    let mut controller = Client::connect(robot.ready.signaling_addr).await?;
    let mut recorder = Client::connect(robot.ready.signaling_addr).await?;

    controller.negotiate(PeerRole::Controller).await?;
    controller.sync().await?;
    recorder.negotiate(PeerRole::Recorder).await?;
    recorder.sync().await?;

    let now = controller.clock.now_micros();
    controller
        .channel
        .send_message(&ControlMessage::pause(now))
        .await?;
    controller
        .channel
        .send_message(&ControlMessage::text("hello", now + 1))
        .await?;

    let pause = recorder.recv_kind(ControlKind::Pause).await?;
    assert_eq!(pause.sent_at(), Some(now));
    let text = recorder.recv_kind(ControlKind::Text).await?;
    assert_eq!(
        text.body(),
        &ControlBody::Text {
            message: "hello".into()
        }
    );

    // The originator gets no echo: the next thing it sees is its own pong.
    assert_eq!(controller.ping_and_recv().await?.kind(), ControlKind::Pong);

    robot.stop().await
}

#[tokio::test]
async fn viewer_commands_are_not_relayed() -> Result<(), BoxError> {
    let robot = TestRobot::start(robot_session(), 1_000).await?;
    let mut viewer = Client::connect(robot.ready.signaling_addr).await?;
    let mut other = Client::connect(robot.ready.signaling_addr).await?;

    viewer.negotiate(PeerRole::Viewer).await?;
    other.negotiate(PeerRole::Recorder).await?;
    other.sync().await?;

    let now = viewer.clock.now_micros();
    viewer.channel.send_message(&ControlMessage::pause(now)).await?;
    viewer.sync().await?;

    // Relays are queued before the viewer's pong, so a pong here means none.
    assert_eq!(other.ping_and_recv().await?.kind(), ControlKind::Pong);

    robot.stop().await
}

#[tokio::test]
async fn undecodable_units_do_not_close_the_channel() -> Result<(), BoxError> {
    let robot = TestRobot::start(robot_session(), 1_000).await?;
    let mut client = Client::connect(robot.ready.signaling_addr).await?;

    client.channel.send_raw("{{{ not json").await?;
    client
        .channel
        .send_raw(r#"{"kind":"reboot","sent_at":1}"#)
        .await?;
    client.channel.send_raw(r#"{"kind":"play"}"#).await?;

    client.sync().await?;
    client.negotiate(PeerRole::Viewer).await?;

    robot.stop().await
}

#[tokio::test]
async fn answer_before_offer_closes_the_session() -> Result<(), BoxError> {
    let robot = TestRobot::start(robot_session(), 1_000).await?;
    let mut client = Client::connect(robot.ready.signaling_addr).await?;

    client
        .channel
        .send_message(&ControlMessage::answer("v=0\r\nm=video 9 RTP/AVP 96\r\n"))
        .await?;

    let outcome = timeout(WAIT, client.channel.recv_message()).await?;
    assert!(outcome.is_err(), "expected the robot to close, got {outcome:?}");

    robot.stop().await
}

#[tokio::test]
async fn silent_peer_is_closed_by_liveness_sweep() -> Result<(), BoxError> {
    let session = SessionSettings {
        liveness_timeout_ms: 300,
        ..robot_session()
    };
    let robot = TestRobot::start(session, 50).await?;
    let mut silent = Client::connect(robot.ready.signaling_addr).await?;
    silent.negotiate(PeerRole::Viewer).await?;

    let outcome = timeout(WAIT, async {
        loop {
            if let Err(err) = silent.channel.recv_message().await {
                return err;
            }
        }
    })
    .await?;
    assert!(!outcome.is_recoverable(), "channel should be gone: {outcome}");

    robot.stop().await
}
