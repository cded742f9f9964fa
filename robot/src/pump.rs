use std::sync::Arc;

use common_net::{
    media::{recv_latest, MediaEngine, MediaUnit},
    shutdown::ShutdownReceiver,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Forward captured frames to every established peer. Runs apart from the
/// control path; a slow send only costs frames, never signaling.
pub async fn run(
    mut frames: broadcast::Receiver<MediaUnit>,
    engine: Arc<dyn MediaEngine>,
    mut shutdown_rx: ShutdownReceiver,
) {
    let mut forwarded = 0u64;
    loop {
        let received = tokio::select! {
            _ = shutdown_rx.changed() => break,
            received = recv_latest(&mut frames) => received,
        };
        let Some(received) = received else {
            debug!("capture ended");
            break;
        };
        if received.dropped > 0 {
            debug!(dropped = received.dropped, "media pump fell behind capture");
        }

        match engine.send_media_unit(&received.unit).await {
            Ok(peers) if peers > 0 => forwarded += 1,
            Ok(_) => {}
            Err(err) => warn!(%err, sequence = received.unit.sequence, "media send failed"),
        }
    }
    info!(forwarded, "media pump stopped");
}
