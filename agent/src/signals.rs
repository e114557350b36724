//! Process signals driving the pipeline lifecycle

use async_trait::async_trait;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;
use tracing::info;

/// What the orchestrator does after draining the current generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Exit without error
    Terminate,
    /// Restart with freshly resolved state
    Reload,
}

#[async_trait]
pub trait SignalSource: Send {
    async fn next(&mut self) -> ControlSignal;
}

/// SIGINT, SIGTERM and SIGQUIT terminate; SIGHUP reloads
pub struct UnixSignals {
    interrupt: Signal,
    terminate: Signal,
    quit: Signal,
    hangup: Signal,
}

impl UnixSignals {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }
}

#[async_trait]
impl SignalSource for UnixSignals {
    async fn next(&mut self) -> ControlSignal {
        let (name, control) = tokio::select! {
            _ = self.interrupt.recv() => ("SIGINT", ControlSignal::Terminate),
            _ = self.terminate.recv() => ("SIGTERM", ControlSignal::Terminate),
            _ = self.quit.recv() => ("SIGQUIT", ControlSignal::Terminate),
            _ = self.hangup.recv() => ("SIGHUP", ControlSignal::Reload),
        };
        info!("Received {}", name);
        control
    }
}

/// Signals injected through a channel. A closed channel terminates.
pub struct ChannelSignals {
    rx: mpsc::Receiver<ControlSignal>,
}

impl ChannelSignals {
    pub fn new() -> (mpsc::Sender<ControlSignal>, Self) {
        let (tx, rx) = mpsc::channel(4);
        (tx, Self { rx })
    }
}

#[async_trait]
impl SignalSource for ChannelSignals {
    async fn next(&mut self) -> ControlSignal {
        self.rx.recv().await.unwrap_or(ControlSignal::Terminate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_signals() {
        let (tx, mut signals) = ChannelSignals::new();
        tx.send(ControlSignal::Reload).await.unwrap();
        assert_eq!(signals.next().await, ControlSignal::Reload);

        drop(tx);
        assert_eq!(signals.next().await, ControlSignal::Terminate);
    }
}
