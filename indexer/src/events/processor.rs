//! Event processor implementation.
//!
//! Classifies a batch of raw logs, fans them out to the protocol handlers
//! and merges what the handlers produced into one [`OnChainData`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tracing::{debug, error, info};

use super::accumulator::OnChainData;
use super::classifier::LogClassifier;
use super::log::{ClassifiedEvent, ProtocolKind, RawLog};
use super::metrics::EventMetrics;
use crate::handlers::ProtocolDispatch;

/// Result of processing one batch.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Merged output of every handler that succeeded.
    pub data: OnChainData,

    /// Protocols whose handler failed; their output was discarded.
    pub failed: Vec<ProtocolKind>,
}

impl BatchOutcome {
    /// Returns true if every handler succeeded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Event processor for a batch of chain logs.
///
/// Handlers of different protocols run concurrently, each into its own
/// accumulator. A failing handler does not affect its siblings.
///
/// # Example
///
/// ```rust,ignore
/// use orderflow_indexer::events::EventProcessor;
///
/// let processor = EventProcessor::new(classifier, dispatch);
/// let outcome = processor.process(logs).await;
/// println!("{} fills", outcome.data.fill_events.len());
/// ```
pub struct EventProcessor {
    /// Signature registry.
    classifier: Arc<LogClassifier>,

    /// Protocol handlers.
    dispatch: ProtocolDispatch,

    /// Metrics for monitoring.
    metrics: Arc<EventMetrics>,
}

impl EventProcessor {
    /// Creates a processor.
    #[must_use]
    pub fn new(classifier: Arc<LogClassifier>, dispatch: ProtocolDispatch) -> Self {
        Self {
            classifier,
            dispatch,
            metrics: Arc::new(EventMetrics::new()),
        }
    }

    /// Records into shared metrics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<EventMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Returns a reference to the metrics.
    #[must_use]
    pub fn metrics(&self) -> Arc<EventMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Groups classified logs by protocol, each group in chain order.
    fn group(&self, logs: Vec<RawLog>) -> BTreeMap<ProtocolKind, Vec<ClassifiedEvent>> {
        let mut groups: BTreeMap<ProtocolKind, Vec<ClassifiedEvent>> = BTreeMap::new();
        let mut classified = 0_u64;

        for log in logs {
            match self.classifier.classify(log) {
                Some(event) => {
                    classified += 1;
                    groups.entry(event.protocol()).or_default().push(event);
                }
                None => self.metrics.record_skipped(),
            }
        }
        self.metrics.record_classified(classified);

        for events in groups.values_mut() {
            events.sort_by_key(|event| event.log.ordering_key());
        }
        groups
    }

    /// Processes a batch of logs.
    pub async fn process(&self, logs: Vec<RawLog>) -> BatchOutcome {
        let start = Instant::now();
        let total = logs.len();
        let groups = self.group(logs);

        let arms = groups.into_iter().filter_map(|(protocol, events)| {
            let Some(handler) = self.dispatch.get(protocol) else {
                debug!(protocol = %protocol, count = events.len(), "no handler registered, skipping");
                return None;
            };
            Some(async move {
                let mut data = OnChainData::new();
                let result = handler.handle(&events, &mut data).await;
                (protocol, events.len(), result.map(|()| data))
            })
        });

        let mut outcome = BatchOutcome::default();
        for (protocol, count, result) in join_all(arms).await {
            match result {
                Ok(data) => outcome.data.merge(data),
                Err(e) => {
                    self.metrics.record_handler_error();
                    error!(
                        protocol = %protocol,
                        events = count,
                        error = %e,
                        "protocol handler failed, discarding its output"
                    );
                    outcome.failed.push(protocol);
                }
            }
        }

        let data = &outcome.data;
        self.metrics.record_batch(
            data.fill_events.len() as u64,
            (data.cancel_events.len() + data.bulk_cancel_events.len()) as u64,
            (data.maker_state_triggers().len() + data.order_triggers.len()) as u64,
            start.elapsed(),
        );
        info!(
            logs = total,
            fills = data.fill_events.len(),
            cancels = data.cancel_events.len(),
            transfers = data.fungible_transfers.len(),
            swaps = data.swaps.len(),
            failed = outcome.failed.len(),
            "processed log batch"
        );

        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use alloy_primitives::{Address, B256, U256};
    use async_trait::async_trait;

    use super::*;
    use crate::abi::{IERC20, IERC721, ISeaport};
    use crate::config::ProtocolAddresses;
    use crate::error::{IndexerError, TraceError};
    use crate::events::log::EventKind;
    use crate::handlers::tests::classified;
    use crate::handlers::{Erc721Handler, ProtocolHandler, SeaportHandler};

    struct Failing;

    #[async_trait]
    impl ProtocolHandler for Failing {
        fn protocol(&self) -> ProtocolKind {
            ProtocolKind::Erc20
        }

        async fn handle(
            &self,
            _events: &[ClassifiedEvent],
            _data: &mut OnChainData,
        ) -> Result<(), IndexerError> {
            Err(TraceError::InvalidResponse("node down".to_string()).into())
        }
    }

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<(u64, u64, u64)>>,
    }

    #[async_trait]
    impl ProtocolHandler for Recording {
        fn protocol(&self) -> ProtocolKind {
            ProtocolKind::Erc721
        }

        async fn handle(
            &self,
            events: &[ClassifiedEvent],
            _data: &mut OnChainData,
        ) -> Result<(), IndexerError> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.extend(events.iter().map(|e| e.log.ordering_key()));
            }
            Ok(())
        }
    }

    fn addresses() -> ProtocolAddresses {
        ProtocolAddresses {
            seaport: vec![Address::repeat_byte(0x5a)],
            payment_processor: Address::repeat_byte(0xee),
            weth: Address::repeat_byte(0x77),
        }
    }

    fn cancel_log() -> RawLog {
        classified(
            EventKind::SeaportOrderCancelled,
            Address::repeat_byte(0x5a),
            &ISeaport::OrderCancelled {
                orderHash: B256::repeat_byte(1),
                offerer: Address::repeat_byte(2),
                zone: Address::ZERO,
            },
            1,
            0,
        )
        .log
    }

    fn erc20_log() -> RawLog {
        classified(
            EventKind::Erc20Transfer,
            Address::repeat_byte(0x99),
            &IERC20::Transfer {
                from: Address::repeat_byte(2),
                to: Address::repeat_byte(3),
                value: U256::from(1),
            },
            1,
            1,
        )
        .log
    }

    fn nft_log(block: u64, log_index: u64) -> RawLog {
        let mut log = classified(
            EventKind::Erc721Transfer,
            Address::repeat_byte(0xcc),
            &IERC721::Transfer {
                from: Address::repeat_byte(2),
                to: Address::repeat_byte(3),
                tokenId: U256::from(1),
            },
            1,
            log_index,
        )
        .log;
        log.block_number = block;
        log
    }

    fn processor(dispatch: ProtocolDispatch) -> EventProcessor {
        EventProcessor::new(
            Arc::new(LogClassifier::with_protocols(&addresses())),
            dispatch,
        )
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_abort_siblings() {
        let dispatch = ProtocolDispatch::new()
            .with(Arc::new(SeaportHandler::new()))
            .with(Arc::new(Failing));
        let processor = processor(dispatch);

        let outcome = processor.process(vec![cancel_log(), erc20_log()]).await;

        assert!(!outcome.is_complete());
        assert_eq!(outcome.failed, vec![ProtocolKind::Erc20]);
        assert_eq!(outcome.data.cancel_events.len(), 1);
        assert!(outcome.data.fungible_transfers.is_empty());
        assert_eq!(processor.metrics().handler_errors(), 1);
        assert_eq!(processor.metrics().cancels(), 1);
    }

    #[tokio::test]
    async fn test_groups_sorted_by_ordering_key() {
        let recording = Arc::new(Recording::default());
        let dispatch = ProtocolDispatch::new().with(Arc::clone(&recording) as Arc<dyn ProtocolHandler>);
        let processor = processor(dispatch);

        let outcome = processor
            .process(vec![nft_log(11, 0), nft_log(10, 5), nft_log(10, 2)])
            .await;

        assert!(outcome.is_complete());
        let seen = recording.seen.lock().expect("lock").clone();
        assert_eq!(seen, vec![(10, 2, 1), (10, 5, 1), (11, 0, 1)]);
    }

    #[tokio::test]
    async fn test_unknown_and_unhandled_logs_skipped() {
        let processor = processor(ProtocolDispatch::new().with(Arc::new(Erc721Handler::new())));
        let mut unknown = cancel_log();
        unknown.topics = vec![B256::repeat_byte(0x42)];

        let outcome = processor
            .process(vec![unknown, cancel_log(), nft_log(1, 0)])
            .await;

        assert!(outcome.is_complete());
        assert!(outcome.data.cancel_events.is_empty());
        assert_eq!(outcome.data.maker_state_triggers().len(), 1);
        let metrics = processor.metrics();
        assert_eq!(metrics.logs_skipped(), 1);
        assert_eq!(metrics.logs_classified(), 2);
        assert_eq!(metrics.batches(), 1);
    }
}
