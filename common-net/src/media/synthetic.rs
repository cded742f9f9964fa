use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

use super::{media_queue, CaptureControl, MediaUnit, Overlay};
use crate::clock::Clock;
use crate::shutdown::ShutdownReceiver;

/// Stand-in camera producing a moving gradient with the overlay text burned
/// into the first rows. Frame production stops while paused.
pub struct SyntheticCapture {
    clock: Arc<dyn Clock>,
    frame_interval: Duration,
    width: usize,
    height: usize,
    playing: watch::Sender<bool>,
    text: RwLock<String>,
}

impl SyntheticCapture {
    pub fn new(clock: Arc<dyn Clock>, frame_rate: u32, width: usize, height: usize) -> Arc<Self> {
        let (playing, _) = watch::channel(true);
        Arc::new(Self {
            clock,
            frame_interval: Duration::from_secs(1) / frame_rate.max(1),
            width: width.max(1),
            height: height.max(1),
            playing,
            text: RwLock::new(String::new()),
        })
    }

    pub fn is_playing(&self) -> bool {
        *self.playing.borrow()
    }

    pub fn text(&self) -> String {
        self.text
            .read()
            .map(|text| text.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Grab one frame, stamping its capture timestamp now.
    pub fn acquire(&self, sequence: u64) -> MediaUnit {
        let payload = self.render(sequence);
        MediaUnit::new(sequence, self.clock.now_micros(), payload)
    }

    fn render(&self, sequence: u64) -> Vec<u8> {
        let shift = (sequence % 256) as usize;
        let mut frame: Vec<u8> = (0..self.width * self.height)
            .map(|i| ((i % self.width + i / self.width + shift) % 256) as u8)
            .collect();
        let text = self.text();
        let burned = text.len().min(frame.len());
        frame[..burned].copy_from_slice(&text.as_bytes()[..burned]);
        frame
    }

    /// Run the capture loop until shutdown or until every receiver is gone.
    /// Sequence numbers only advance for frames actually produced.
    pub fn start(
        self: &Arc<Self>,
        queue_capacity: usize,
        mut shutdown: ShutdownReceiver,
    ) -> (broadcast::Receiver<MediaUnit>, JoinHandle<()>) {
        let (tx, rx) = media_queue(queue_capacity);
        let capture = self.clone();

        let handle = tokio::spawn(async move {
            let mut playing = capture.playing.subscribe();
            let mut ticker = time::interval(capture.frame_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut sequence = 0u64;
            info!(interval = ?capture.frame_interval, "synthetic capture started");

            loop {
                if !*playing.borrow_and_update() {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        changed = playing.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            continue;
                        }
                    }
                }

                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }
                if !*playing.borrow() {
                    continue;
                }

                if tx.send(capture.acquire(sequence)).is_err() {
                    debug!("no media consumers left");
                    break;
                }
                sequence += 1;
            }
            info!(frames = sequence, "synthetic capture stopped");
        });

        (rx, handle)
    }
}

impl CaptureControl for SyntheticCapture {
    fn set_playing(&self, playing: bool) {
        self.playing.send_replace(playing);
    }
}

impl Overlay for SyntheticCapture {
    fn set_text(&self, text: &str) {
        match self.text.write() {
            Ok(mut current) => *current = text.to_owned(),
            Err(poisoned) => *poisoned.into_inner() = text.to_owned(),
        }
    }
}
