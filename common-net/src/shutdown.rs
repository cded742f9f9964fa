use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub type ShutdownSender = watch::Sender<bool>;
pub type ShutdownReceiver = watch::Receiver<bool>;

pub fn channel() -> (ShutdownSender, ShutdownReceiver) {
    watch::channel(false)
}

pub fn trigger(sender: &ShutdownSender) {
    sender.send_replace(true);
}

pub fn is_triggered(receiver: &ShutdownReceiver) -> bool {
    *receiver.borrow()
}

/// Resolves once shutdown is triggered or every sender is gone.
pub async fn wait(mut receiver: ShutdownReceiver) {
    // An Err means the sender was dropped, which also ends the node.
    let _ = receiver.wait_for(|triggered| *triggered).await;
}

/// Trigger `sender` on Ctrl-C.
pub fn trigger_on_ctrl_c(sender: ShutdownSender, service: &'static str) -> JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!(service, "ctrl-c received, shutting down"),
            Err(err) => warn!(%err, service, "ctrl-c listener failed, shutting down"),
        }
        trigger(&sender);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_returns_after_trigger() {
        let (tx, rx) = channel();
        let waiter = tokio::spawn(wait(rx.clone()));
        assert!(!is_triggered(&rx));
        trigger(&tx);
        waiter.await.expect("join");
        assert!(is_triggered(&rx));
    }

    #[tokio::test]
    async fn dropped_sender_releases_waiters() {
        let (tx, rx) = channel();
        drop(tx);
        wait(rx).await;
    }
}
