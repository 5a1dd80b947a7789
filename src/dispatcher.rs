use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use log::{debug, info, warn};
use solana_metrics::datapoint_info;
use solana_sdk::signature::Signature;
use thiserror::Error;
use yellowstone_grpc_proto::prelude::{
    subscribe_update::UpdateOneof, SubscribeUpdate, SubscribeUpdateTransaction,
};

#[derive(Debug, Error)]
pub enum FrameHandlingError {
    #[error("transaction update at slot {0} carries no transaction info")]
    MissingTransactionInfo(u64),
    #[error("signature has {0} bytes, expected 64")]
    InvalidSignature(usize),
    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// Receives every transaction update matching the subscription, in arrival order.
pub trait TransactionHandler: Send {
    fn on_transaction(
        &mut self,
        filters: &[String],
        update: &SubscribeUpdateTransaction,
    ) -> Result<(), FrameHandlingError>;
}

/// Logs one line per transaction, keyed by its base58 signature.
#[derive(Debug, Default)]
pub struct LoggingHandler {
    logged: u64,
}

impl LoggingHandler {
    /// Transactions successfully logged so far.
    pub fn logged(&self) -> u64 {
        self.logged
    }
}

impl TransactionHandler for LoggingHandler {
    fn on_transaction(
        &mut self,
        filters: &[String],
        update: &SubscribeUpdateTransaction,
    ) -> Result<(), FrameHandlingError> {
        let tx_info = update
            .transaction
            .as_ref()
            .ok_or(FrameHandlingError::MissingTransactionInfo(update.slot))?;
        let signature = Signature::try_from(tx_info.signature.as_slice())
            .map_err(|_| FrameHandlingError::InvalidSignature(tx_info.signature.len()))?;

        info!(
            "Transaction update received! slot: {}, signature: {signature}, filters: {filters:?}",
            update.slot
        );
        debug!("Full transaction update: {update:?}");
        self.logged += 1;
        Ok(())
    }
}

/// What the dispatcher did with a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    HandlerFailed,
    KeepAlive,
    Discarded,
}

#[derive(Debug, Default)]
struct FrameCounters {
    received: AtomicU64,
    transactions: AtomicU64,
    handler_failures: AtomicU64,
    discarded: AtomicU64,
    pings: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameCounts {
    pub received: u64,
    pub transactions: u64,
    pub handler_failures: u64,
    pub discarded: u64,
    pub pings: u64,
}

impl FrameCounters {
    fn load(&self) -> FrameCounts {
        FrameCounts {
            received: self.received.load(Ordering::Relaxed),
            transactions: self.transactions.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            pings: self.pings.load(Ordering::Relaxed),
        }
    }
}

/// Frame counters shared between the reader task and the metrics reporter.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    current: FrameCounters,
    // persist after reset
    cumulative: FrameCounters,
}

impl DispatchMetrics {
    pub fn report(&self) {
        let current = self.current.load();
        datapoint_info!(
            "geyser_account_watcher-dispatch_metrics",
            ("received", current.received, i64),
            ("transactions", current.transactions, i64),
            ("handler_failures", current.handler_failures, i64),
            ("discarded", current.discarded, i64),
            ("pings", current.pings, i64),
        );
        debug!("Dispatch metrics since last report: {current:?}");
    }

    /// resets current values, increments cumulative values
    pub fn reset(&self) {
        let pairs = [
            (&self.current.received, &self.cumulative.received),
            (&self.current.transactions, &self.cumulative.transactions),
            (&self.current.handler_failures, &self.cumulative.handler_failures),
            (&self.current.discarded, &self.cumulative.discarded),
            (&self.current.pings, &self.cumulative.pings),
        ];
        for (current, cumulative) in pairs {
            cumulative.fetch_add(current.swap(0, Ordering::Relaxed), Ordering::Relaxed);
        }
    }

    /// Everything counted so far, reported or not.
    pub fn totals(&self) -> FrameCounts {
        let current = self.current.load();
        let cumulative = self.cumulative.load();
        FrameCounts {
            received: current.received + cumulative.received,
            transactions: current.transactions + cumulative.transactions,
            handler_failures: current.handler_failures + cumulative.handler_failures,
            discarded: current.discarded + cumulative.discarded,
            pings: current.pings + cumulative.pings,
        }
    }
}

/// Routes transaction updates to the handler and drops everything else. One dispatcher
/// per stream; frames are handled strictly one at a time.
pub struct Dispatcher<H> {
    handler: H,
    metrics: Arc<DispatchMetrics>,
}

impl<H: TransactionHandler> Dispatcher<H> {
    pub fn new(handler: H, metrics: Arc<DispatchMetrics>) -> Self {
        Self { handler, metrics }
    }

    pub fn on_frame(&mut self, frame: SubscribeUpdate) -> Dispatch {
        let counters = &self.metrics.current;
        counters.received.fetch_add(1, Ordering::Relaxed);

        let SubscribeUpdate {
            filters,
            update_oneof,
            ..
        } = frame;
        match update_oneof {
            Some(UpdateOneof::Transaction(update)) => {
                counters.transactions.fetch_add(1, Ordering::Relaxed);
                let handler = &mut self.handler;
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    handler.on_transaction(&filters, &update)
                }))
                .unwrap_or_else(|payload| {
                    Err(FrameHandlingError::Panicked(panic_message(payload)))
                });
                match result {
                    Ok(()) => Dispatch::Handled,
                    Err(e) => {
                        counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                        warn!("Failed to handle transaction update at slot {}: {e}", update.slot);
                        Dispatch::HandlerFailed
                    }
                }
            }
            Some(UpdateOneof::Ping(_)) => {
                counters.pings.fetch_add(1, Ordering::Relaxed);
                debug!("Ping received, filters: {filters:?}");
                Dispatch::KeepAlive
            }
            _ => {
                counters.discarded.fetch_add(1, Ordering::Relaxed);
                Dispatch::Discarded
            }
        }
    }

    #[cfg(test)]
    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use yellowstone_grpc_proto::prelude::{
        SubscribeUpdateAccount, SubscribeUpdatePing, SubscribeUpdateSlot,
        SubscribeUpdateTransactionInfo,
    };

    use super::*;

    #[derive(Default)]
    struct Recorder {
        slots: Vec<u64>,
        signatures: Vec<Vec<u8>>,
        fail_on_slot: Option<u64>,
        panic_on_slot: Option<u64>,
    }

    impl TransactionHandler for Recorder {
        fn on_transaction(
            &mut self,
            _filters: &[String],
            update: &SubscribeUpdateTransaction,
        ) -> Result<(), FrameHandlingError> {
            if self.panic_on_slot == Some(update.slot) {
                panic!("boom at {}", update.slot);
            }
            self.slots.push(update.slot);
            if let Some(info) = &update.transaction {
                self.signatures.push(info.signature.clone());
            }
            if self.fail_on_slot == Some(update.slot) {
                return Err(FrameHandlingError::MissingTransactionInfo(update.slot));
            }
            Ok(())
        }
    }

    fn tx_update(slot: u64, signature: Vec<u8>) -> SubscribeUpdateTransaction {
        SubscribeUpdateTransaction {
            transaction: Some(SubscribeUpdateTransactionInfo {
                signature,
                ..Default::default()
            }),
            slot,
        }
    }

    fn frame(update: UpdateOneof) -> SubscribeUpdate {
        SubscribeUpdate {
            filters: vec!["account_monitor".to_string()],
            update_oneof: Some(update),
            ..Default::default()
        }
    }

    fn tx_frame(slot: u64) -> SubscribeUpdate {
        frame(UpdateOneof::Transaction(tx_update(slot, vec![slot as u8; 64])))
    }

    fn slot_frame(slot: u64) -> SubscribeUpdate {
        frame(UpdateOneof::Slot(SubscribeUpdateSlot {
            slot,
            ..Default::default()
        }))
    }

    fn dispatcher(recorder: Recorder) -> (Dispatcher<Recorder>, Arc<DispatchMetrics>) {
        let metrics = Arc::new(DispatchMetrics::default());
        (Dispatcher::new(recorder, metrics.clone()), metrics)
    }

    #[test]
    fn test_slot_update_is_discarded() {
        let (mut dispatcher, metrics) = dispatcher(Recorder::default());
        assert_eq!(dispatcher.on_frame(slot_frame(42)), Dispatch::Discarded);
        assert!(dispatcher.handler().slots.is_empty());
        assert_eq!(metrics.totals().discarded, 1);
    }

    #[test]
    fn test_transaction_update_is_handled_once() {
        let (mut dispatcher, metrics) = dispatcher(Recorder::default());
        let signature = vec![7u8; 64];
        let update = frame(UpdateOneof::Transaction(tx_update(42, signature.clone())));

        assert_eq!(dispatcher.on_frame(update), Dispatch::Handled);
        assert_eq!(dispatcher.handler().slots, vec![42]);
        assert_eq!(dispatcher.handler().signatures, vec![signature]);
        assert_eq!(metrics.totals().transactions, 1);
    }

    #[test]
    fn test_mixed_frames_handled_in_order() {
        let (mut dispatcher, metrics) = dispatcher(Recorder::default());
        let frames = vec![
            slot_frame(1),
            tx_frame(2),
            frame(UpdateOneof::Account(SubscribeUpdateAccount {
                slot: 3,
                ..Default::default()
            })),
            tx_frame(4),
            frame(UpdateOneof::Ping(SubscribeUpdatePing::default())),
            SubscribeUpdate::default(),
            tx_frame(5),
            slot_frame(6),
        ];
        let dispatched = frames
            .into_iter()
            .map(|f| dispatcher.on_frame(f))
            .collect::<Vec<_>>();

        assert_eq!(dispatcher.handler().slots, vec![2, 4, 5]);
        assert_eq!(
            dispatched,
            vec![
                Dispatch::Discarded,
                Dispatch::Handled,
                Dispatch::Discarded,
                Dispatch::Handled,
                Dispatch::KeepAlive,
                Dispatch::Discarded,
                Dispatch::Handled,
                Dispatch::Discarded,
            ]
        );
        assert_eq!(
            metrics.totals(),
            FrameCounts {
                received: 8,
                transactions: 3,
                handler_failures: 0,
                discarded: 4,
                pings: 1,
            }
        );
    }

    #[test]
    fn test_handler_error_does_not_stop_dispatch() {
        let (mut dispatcher, metrics) = dispatcher(Recorder {
            fail_on_slot: Some(2),
            ..Default::default()
        });
        assert_eq!(dispatcher.on_frame(tx_frame(1)), Dispatch::Handled);
        assert_eq!(dispatcher.on_frame(tx_frame(2)), Dispatch::HandlerFailed);
        assert_eq!(dispatcher.on_frame(tx_frame(3)), Dispatch::Handled);
        assert_eq!(dispatcher.handler().slots, vec![1, 2, 3]);
        assert_eq!(metrics.totals().handler_failures, 1);
    }

    #[test]
    fn test_handler_panic_is_contained() {
        let (mut dispatcher, metrics) = dispatcher(Recorder {
            panic_on_slot: Some(2),
            ..Default::default()
        });
        assert_eq!(dispatcher.on_frame(tx_frame(1)), Dispatch::Handled);
        assert_eq!(dispatcher.on_frame(tx_frame(2)), Dispatch::HandlerFailed);
        assert_eq!(dispatcher.on_frame(tx_frame(3)), Dispatch::Handled);
        assert_eq!(dispatcher.handler().slots, vec![1, 3]);
        assert_eq!(metrics.totals().handler_failures, 1);
    }

    #[test]
    fn test_logging_handler() {
        let mut handler = LoggingHandler::default();
        assert!(handler
            .on_transaction(&[], &tx_update(42, vec![1u8; 64]))
            .is_ok());
        assert_eq!(handler.logged(), 1);
        assert!(matches!(
            handler.on_transaction(&[], &tx_update(42, vec![1u8; 10])),
            Err(FrameHandlingError::InvalidSignature(10))
        ));

        let empty = SubscribeUpdateTransaction {
            transaction: None,
            slot: 42,
        };
        assert!(matches!(
            handler.on_transaction(&[], &empty),
            Err(FrameHandlingError::MissingTransactionInfo(42))
        ));
        // failures are not counted as logged
        assert_eq!(handler.logged(), 1);
    }

    #[test]
    fn test_metrics_reset_keeps_totals() {
        let (mut dispatcher, metrics) = dispatcher(Recorder::default());
        dispatcher.on_frame(tx_frame(1));
        dispatcher.on_frame(slot_frame(2));
        metrics.report();
        metrics.reset();
        dispatcher.on_frame(tx_frame(3));

        assert_eq!(metrics.current.load().received, 1);
        assert_eq!(metrics.cumulative.load().received, 2);
        assert_eq!(metrics.totals().received, 3);
        assert_eq!(metrics.totals().transactions, 2);
    }
}
