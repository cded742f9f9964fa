use std::time::Duration;

use common_net::{
    clock::Micros,
    latency::{Latency, LatencyMeter},
    media::{recv_latest, MediaUnit},
    shutdown::ShutdownReceiver,
};
use tokio::{
    sync::{broadcast, watch},
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info};

/// Totals reported when the viewer stops.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewerStats {
    pub frames: u64,
    pub dropped: u64,
    pub latency: Latency,
}

/// Consume received units and keep the smoothed latency current in
/// `latest`, logging it every `report_every`. Latency stays unknown until
/// `offset` holds an estimate. Returns when `stop_rx` fires or the media
/// queue closes.
pub async fn watch_latency(
    mut units: broadcast::Receiver<MediaUnit>,
    offset: watch::Receiver<Option<Micros>>,
    alpha: f64,
    report_every: Duration,
    latest: watch::Sender<Latency>,
    mut stop_rx: ShutdownReceiver,
) -> ViewerStats {
    let mut meter = LatencyMeter::new(alpha);
    let mut frames = 0u64;
    let mut dropped = 0u64;
    let mut report = time::interval(report_every);
    report.set_missed_tick_behavior(MissedTickBehavior::Skip);
    report.tick().await;

    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            _ = report.tick() => {
                info!(latency = %meter.current(), frames, dropped, "viewer");
            }
            received = recv_latest(&mut units) => {
                let Some(received) = received else {
                    debug!("media queue closed");
                    break;
                };
                frames += 1;
                dropped += received.dropped;
                let current_offset = *offset.borrow();
                let latency = meter.observe(&received.unit, current_offset);
                if latency != Latency::Unknown {
                    latest.send_replace(latency);
                }
            }
        }
    }

    ViewerStats {
        frames,
        dropped,
        latency: meter.current(),
    }
}
