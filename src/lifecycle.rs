use std::{io, sync::Arc, thread, time::Duration};

use futures::StreamExt;
use log::{debug, error, info, warn};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::{Handle, Signals},
};
use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task::JoinError,
    time::{interval_at, Instant},
};
use tonic::Status;

use crate::{
    connection::{ConnectionError, Connector, SendError, UpdateStream},
    dispatcher::{DispatchMetrics, Dispatcher, TransactionHandler},
    subscription::SubscriptionDescriptor,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Connecting,
    Subscribing,
    Listening,
    ShuttingDown,
    Terminated,
}

impl LifecycleState {
    fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Subscribing)
                | (Connecting, Terminated)
                | (Subscribing, Listening)
                | (Subscribing, Terminated)
                | (Listening, ShuttingDown)
                | (ShuttingDown, Terminated)
        )
    }
}

/// Every way the listening phase can end. All of them go through one channel, so only
/// the first one received drives the shutdown.
#[derive(Debug)]
pub enum ShutdownTrigger {
    Interrupt(i32),
    EndOfStream,
    StreamError(Status),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownReason {
    Interrupted,
    EndOfStream,
    /// Remote ended the stream with an error status. Logged, not fatal.
    StreamError,
}

impl From<Option<ShutdownTrigger>> for ShutdownReason {
    fn from(trigger: Option<ShutdownTrigger>) -> Self {
        match trigger {
            Some(ShutdownTrigger::Interrupt(signal)) => {
                info!("Received signal {signal}, shutting down...");
                ShutdownReason::Interrupted
            }
            Some(ShutdownTrigger::EndOfStream) | None => {
                info!("Stream ended by remote, shutting down...");
                ShutdownReason::EndOfStream
            }
            Some(ShutdownTrigger::StreamError(status)) => {
                error!("Error receiving message: {status}");
                ShutdownReason::StreamError
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("ConnectionError {0}")]
    ConnectionError(#[from] ConnectionError),
    #[error("SendError {0}")]
    SendError(#[from] SendError),
    #[error("Illegal lifecycle transition {0:?} -> {1:?}")]
    IllegalTransition(LifecycleState, LifecycleState),
    #[error("Reader task failed: {0}")]
    ReaderError(#[from] JoinError),
}

#[derive(Debug)]
pub struct Shutdown<H> {
    pub reason: ShutdownReason,
    pub handler: H,
    /// Triggers that arrived after the first one and were dropped
    pub ignored_triggers: usize,
}

pub struct LifecycleController {
    state: LifecycleState,
    shutdown_sender: UnboundedSender<ShutdownTrigger>,
    shutdown_receiver: UnboundedReceiver<ShutdownTrigger>,
    metrics: Arc<DispatchMetrics>,
    metrics_report_interval: Duration,
}

impl LifecycleController {
    pub fn new(metrics: Arc<DispatchMetrics>, metrics_report_interval: Duration) -> Self {
        let (shutdown_sender, shutdown_receiver) = mpsc::unbounded_channel();
        Self {
            state: LifecycleState::Idle,
            shutdown_sender,
            shutdown_receiver,
            metrics,
            metrics_report_interval,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Sender for anything outside the controller that may end the stream (signals).
    pub fn shutdown_sender(&self) -> UnboundedSender<ShutdownTrigger> {
        self.shutdown_sender.clone()
    }

    fn transition(&mut self, next: LifecycleState) -> Result<(), LifecycleError> {
        if !self.state.can_transition_to(next) {
            return Err(LifecycleError::IllegalTransition(self.state, next));
        }
        debug!("Lifecycle {:?} -> {:?}", self.state, next);
        self.state = next;
        Ok(())
    }

    /// Counts and drops whatever triggers are still queued.
    fn drain_triggers(&mut self) -> usize {
        let mut ignored_triggers = 0;
        while let Ok(trigger) = self.shutdown_receiver.try_recv() {
            debug!("Shutdown already in progress, ignoring {trigger:?}");
            ignored_triggers += 1;
        }
        ignored_triggers
    }

    /// A trigger arrived before the stream reached Listening: nothing to dispatch yet.
    fn abort_setup<H>(
        &mut self,
        trigger: Option<ShutdownTrigger>,
        handler: H,
    ) -> Result<Shutdown<H>, LifecycleError> {
        info!("Shutdown requested while {:?}", self.state);
        let reason = ShutdownReason::from(trigger);
        self.transition(LifecycleState::Terminated)?;
        Ok(Shutdown {
            reason,
            handler,
            ignored_triggers: self.drain_triggers(),
        })
    }

    /// Connects, subscribes, and dispatches frames until the first shutdown trigger.
    /// The stream handle is closed on every path that opened it. A trigger received
    /// while connecting or subscribing terminates without listening.
    pub async fn run<C, H>(
        &mut self,
        connector: &C,
        descriptor: &SubscriptionDescriptor,
        handler: H,
    ) -> Result<Shutdown<H>, LifecycleError>
    where
        C: Connector + ?Sized,
        H: TransactionHandler + 'static,
    {
        self.transition(LifecycleState::Connecting)?;
        // a completed open wins over a trigger queued at the same time
        let opened = tokio::select! {
            biased;
            opened = connector.open() => opened,
            trigger = self.shutdown_receiver.recv() => {
                return self.abort_setup(trigger, handler);
            }
        };
        let handle = match opened {
            Ok(handle) => handle,
            Err(e) => {
                error!("Failed to connect to {}: {e}", connector.endpoint());
                self.transition(LifecycleState::Terminated)?;
                return Err(e.into());
            }
        };
        info!("Connected to gRPC endpoint {}", connector.endpoint());

        self.transition(LifecycleState::Subscribing)?;
        let sent = tokio::select! {
            biased;
            sent = handle.send(descriptor) => sent,
            trigger = self.shutdown_receiver.recv() => {
                handle.close().await;
                return self.abort_setup(trigger, handler);
            }
        };
        if let Err(e) = sent {
            error!("Failed to send subscription request: {e}");
            handle.close().await;
            self.transition(LifecycleState::Terminated)?;
            return Err(e.into());
        }
        info!(
            "Subscription request sent. Filter: {}, commitment: {:?}, accounts: {:?}, required: {:?}, excluded: {:?}. Listening for updates...",
            descriptor.filter_name(),
            descriptor.commitment(),
            descriptor.accounts(),
            descriptor.account_required(),
            descriptor.account_exclude(),
        );
        self.transition(LifecycleState::Listening)?;

        let (stop_sender, stop_receiver) = oneshot::channel();
        let dispatcher = Dispatcher::new(handler, self.metrics.clone());
        let reader = match handle.take_updates().await {
            Some(updates) => tokio::spawn(read_updates(
                updates,
                dispatcher,
                self.shutdown_sender.clone(),
                stop_receiver,
            )),
            None => {
                warn!("Update stream unavailable, shutting down");
                let _ = self.shutdown_sender.send(ShutdownTrigger::EndOfStream);
                tokio::spawn(async move { dispatcher })
            }
        };

        let mut metrics_tick = interval_at(
            Instant::now() + self.metrics_report_interval,
            self.metrics_report_interval,
        );
        let trigger = loop {
            tokio::select! {
                trigger = self.shutdown_receiver.recv() => break trigger,
                _ = metrics_tick.tick() => {
                    self.metrics.report();
                    self.metrics.reset();
                }
            }
        };

        self.transition(LifecycleState::ShuttingDown)?;
        let reason = ShutdownReason::from(trigger);

        handle.close().await;
        // reader may already be gone after end of stream
        let _ = stop_sender.send(());
        let dispatcher = reader.await?;

        let ignored_triggers = self.drain_triggers();
        self.metrics.reset();
        self.transition(LifecycleState::Terminated)?;
        info!("Stream closed");

        Ok(Shutdown {
            reason,
            handler: dispatcher.into_handler(),
            ignored_triggers,
        })
    }
}

/// Single reader of the inbound half. Reports how the stream ended through the
/// shutdown channel and hands the dispatcher back when done.
async fn read_updates<H: TransactionHandler>(
    mut updates: UpdateStream,
    mut dispatcher: Dispatcher<H>,
    shutdown_sender: UnboundedSender<ShutdownTrigger>,
    mut stop_receiver: oneshot::Receiver<()>,
) -> Dispatcher<H> {
    loop {
        tokio::select! {
            biased;
            _ = &mut stop_receiver => break,
            message = updates.next() => match message {
                Some(Ok(update)) => {
                    dispatcher.on_frame(update);
                }
                Some(Err(status)) => {
                    let _ = shutdown_sender.send(ShutdownTrigger::StreamError(status));
                    break;
                }
                None => {
                    let _ = shutdown_sender.send(ShutdownTrigger::EndOfStream);
                    break;
                }
            },
        }
    }
    dispatcher
}

/// Forwards SIGINT/SIGTERM into the shutdown channel from a dedicated thread.
/// Close the returned handle to stop listening.
pub fn shutdown_notifier(shutdown_sender: UnboundedSender<ShutdownTrigger>) -> io::Result<Handle> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let handle = signals.handle();
    thread::Builder::new()
        .name("gawSignals".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                if shutdown_sender
                    .send(ShutdownTrigger::Interrupt(signal))
                    .is_err()
                {
                    break;
                }
            }
        })?;
    Ok(handle)
}
