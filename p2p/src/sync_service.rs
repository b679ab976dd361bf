use core::time::Duration;
use std::sync::Arc;

use anyhow::{Error as AnyhowError, Result};
use futures::{
    channel::mpsc::UnboundedReceiver,
    future::{self, BoxFuture},
    stream::FuturesUnordered,
    FutureExt as _, StreamExt as _,
};
use log::{debug, info};
use thiserror::Error;
use tokio::{select, sync::broadcast};
use types::{config::Config, containers::SignedBeaconBlock};

use crate::{
    messages::{P2pToSync, SyncAction, SyncEvent},
    misc::{
        BatchId, BatchProcessResult, BlocksByRangeRequest, ChainId, PeerId, SyncConfig,
        SYNC_EVENT_CHANNEL_CAPACITY,
    },
    network::SyncNetwork,
    processor::ChainSegmentProcessor,
    range_sync::RangeSync,
    sync_chain::SyncChainDebugState,
};

#[derive(Debug, Error)]
#[error("BlocksByRange request to peer {peer_id} timed out after {timeout:?}")]
pub struct RequestTimedOut {
    pub peer_id: PeerId,
    pub timeout: Duration,
}

struct DownloadOutcome {
    chain_id: ChainId,
    batch_id: BatchId,
    peer_id: PeerId,
    result: Result<Vec<Arc<SignedBeaconBlock>>>,
}

struct ProcessingOutcome {
    chain_id: ChainId,
    batch_id: BatchId,
    result: BatchProcessResult,
}

/// Runs [`RangeSync`] against a network and a block processor.
///
/// Downloads run concurrently. Each chain processes at most one batch at a time.
pub struct SyncService<N, P> {
    range_sync: RangeSync,
    network: Arc<N>,
    processor: Arc<P>,
    request_timeout: Duration,
    downloads: FuturesUnordered<BoxFuture<'static, DownloadOutcome>>,
    processing: FuturesUnordered<BoxFuture<'static, ProcessingOutcome>>,
    sync_events_tx: broadcast::Sender<SyncEvent>,
    p2p_to_sync_rx: UnboundedReceiver<P2pToSync>,
}

impl<N, P> SyncService<N, P>
where
    N: SyncNetwork + 'static,
    P: ChainSegmentProcessor + 'static,
{
    #[must_use]
    pub fn new(
        chain_config: Arc<Config>,
        sync_config: SyncConfig,
        network: Arc<N>,
        processor: Arc<P>,
        p2p_to_sync_rx: UnboundedReceiver<P2pToSync>,
    ) -> Self {
        let (sync_events_tx, _) = broadcast::channel(SYNC_EVENT_CHANNEL_CAPACITY);

        Self {
            range_sync: RangeSync::new(chain_config, sync_config),
            network,
            processor,
            request_timeout: sync_config.request_timeout,
            downloads: FuturesUnordered::new(),
            processing: FuturesUnordered::new(),
            sync_events_tx,
            p2p_to_sync_rx,
        }
    }

    /// Returns a receiver of all events published after this call.
    ///
    /// A receiver that falls more than [`SYNC_EVENT_CHANNEL_CAPACITY`] events behind loses the
    /// oldest ones.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sync_events_tx.subscribe()
    }

    #[must_use]
    pub fn debug_state(&self) -> Vec<SyncChainDebugState> {
        self.range_sync.debug_state()
    }

    /// Runs until the sending half of the `P2pToSync` channel is dropped.
    pub async fn run(mut self) -> Result<()> {
        loop {
            select! {
                message = self.p2p_to_sync_rx.next() => {
                    let Some(message) = message else {
                        info!(
                            "stopping sync service ({} downloads and {} batches in progress)",
                            self.downloads.len(),
                            self.processing.len(),
                        );
                        break Ok(());
                    };

                    let local = self.processor.local_status();

                    let actions = match message {
                        P2pToSync::AddPeer(peer_id, status) => {
                            debug!("peer {peer_id} connected with status {status:?}");
                            self.range_sync.add_peer(&local, peer_id, &status)
                        }
                        P2pToSync::RemovePeer(peer_id) => {
                            debug!("peer {peer_id} disconnected");
                            self.range_sync.remove_peer(&local, peer_id)
                        }
                    };

                    self.handle_actions(actions);
                }

                Some(outcome) = self.downloads.next(), if !self.downloads.is_empty() => {
                    let DownloadOutcome { chain_id, batch_id, peer_id, result } = outcome;

                    let local = self.processor.local_status();

                    let actions = self.range_sync.on_download_result(
                        &local,
                        chain_id,
                        batch_id,
                        peer_id,
                        result,
                    );

                    self.handle_actions(actions);
                }

                Some(outcome) = self.processing.next(), if !self.processing.is_empty() => {
                    let ProcessingOutcome { chain_id, batch_id, result } = outcome;

                    let local = self.processor.local_status();

                    let actions = self.range_sync.on_processing_result(
                        &local,
                        chain_id,
                        batch_id,
                        result,
                    );

                    self.handle_actions(actions);
                }
            }

            self.publish_events();
        }
    }

    fn handle_actions(&mut self, actions: Vec<SyncAction>) {
        for action in actions {
            match action {
                SyncAction::DownloadBatch {
                    chain_id,
                    batch_id,
                    peer_id,
                    request,
                } => self.spawn_download(chain_id, batch_id, peer_id, request),
                SyncAction::ProcessBatch {
                    chain_id,
                    batch_id,
                    blocks,
                } => self.spawn_processing(chain_id, batch_id, blocks),
                SyncAction::ReportPeer {
                    peer_id,
                    action,
                    reason,
                } => {
                    debug!("reporting peer {peer_id} ({action:?}, {reason:?})");
                    self.network.report_peer(peer_id, action, reason);
                }
            }
        }
    }

    fn spawn_download(
        &self,
        chain_id: ChainId,
        batch_id: BatchId,
        peer_id: PeerId,
        request: BlocksByRangeRequest,
    ) {
        debug!("requesting batch {batch_id} of chain {chain_id} from peer {peer_id}: {request:?}");

        let network = Arc::clone(&self.network);
        let timeout = self.request_timeout;

        self.downloads.push(
            async move {
                let result = tokio::time::timeout(timeout, network.blocks_by_range(peer_id, request))
                    .await
                    .unwrap_or_else(|_| Err(AnyhowError::new(RequestTimedOut { peer_id, timeout })));

                DownloadOutcome {
                    chain_id,
                    batch_id,
                    peer_id,
                    result,
                }
            }
            .boxed(),
        );
    }

    fn spawn_processing(
        &self,
        chain_id: ChainId,
        batch_id: BatchId,
        blocks: Vec<Arc<SignedBeaconBlock>>,
    ) {
        // Batches of skipped slots need no import.
        if blocks.is_empty() {
            self.processing.push(
                future::ready(ProcessingOutcome {
                    chain_id,
                    batch_id,
                    result: BatchProcessResult::Success { imported_blocks: 0 },
                })
                .boxed(),
            );

            return;
        }

        let processor = Arc::clone(&self.processor);

        self.processing.push(
            async move {
                let block_count = blocks.len();
                let result = processor.process_chain_segment(blocks).await;

                if let Err(error) = &result {
                    debug!("batch {batch_id} of chain {chain_id} failed to import: {error}");
                }

                ProcessingOutcome {
                    chain_id,
                    batch_id,
                    result: BatchProcessResult::from_segment_result(
                        block_count,
                        result.as_ref().copied(),
                    ),
                }
            }
            .boxed(),
        );
    }

    fn publish_events(&mut self) {
        for event in self.range_sync.drain_events() {
            // Sending only fails when nobody is subscribed.
            let _ = self.sync_events_tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use fork_choice_control::ChainSegmentError;
    use futures::channel::mpsc::{self, UnboundedSender};
    use parking_lot::Mutex;
    use tokio::sync::broadcast::error::RecvError;
    use types::{
        containers::BeaconBlock,
        primitives::{Slot, H256},
    };

    use super::*;
    use crate::misc::{PeerAction, PeerReportReason, StatusMessage};

    #[derive(Default)]
    struct TestNetwork {
        // Peers that never answer.
        unresponsive: bool,
        reports: Mutex<Vec<(PeerId, PeerAction, PeerReportReason)>>,
    }

    #[async_trait::async_trait]
    impl SyncNetwork for TestNetwork {
        async fn blocks_by_range(
            &self,
            _peer_id: PeerId,
            request: BlocksByRangeRequest,
        ) -> Result<Vec<Arc<SignedBeaconBlock>>> {
            if self.unresponsive {
                return future::pending().await;
            }

            let blocks = (request.start_slot..request.start_slot + request.count)
                .map(|slot| {
                    Arc::new(SignedBeaconBlock {
                        message: BeaconBlock {
                            slot,
                            ..BeaconBlock::default()
                        },
                        ..SignedBeaconBlock::default()
                    })
                })
                .collect();

            Ok(blocks)
        }

        fn report_peer(&self, peer_id: PeerId, action: PeerAction, reason: PeerReportReason) {
            self.reports.lock().push((peer_id, action, reason));
        }
    }

    #[derive(Default)]
    struct TestProcessor {
        status: Mutex<StatusMessage>,
        imported: Mutex<HashMap<Slot, usize>>,
    }

    #[async_trait::async_trait]
    impl ChainSegmentProcessor for TestProcessor {
        fn local_status(&self) -> StatusMessage {
            *self.status.lock()
        }

        async fn process_chain_segment(
            &self,
            blocks: Vec<Arc<SignedBeaconBlock>>,
        ) -> Result<(), ChainSegmentError> {
            let mut imported = self.imported.lock();
            let mut status = self.status.lock();

            for block in &blocks {
                *imported.entry(block.slot()).or_default() += 1;
                status.head_slot = status.head_slot.max(block.slot());
            }

            Ok(())
        }
    }

    fn start(
        network: TestNetwork,
        request_timeout: Duration,
    ) -> (
        UnboundedSender<P2pToSync>,
        broadcast::Receiver<SyncEvent>,
        Arc<TestNetwork>,
        Arc<TestProcessor>,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let _ = env_logger::builder().is_test(true).try_init();

        let network = Arc::new(network);
        let processor = Arc::new(TestProcessor::default());
        let (p2p_to_sync_tx, p2p_to_sync_rx) = mpsc::unbounded();

        let sync_config = SyncConfig {
            request_timeout,
            ..SyncConfig::default()
        };

        let service = SyncService::new(
            Arc::new(Config::minimal()),
            sync_config,
            Arc::clone(&network),
            Arc::clone(&processor),
            p2p_to_sync_rx,
        );

        let events = service.subscribe();
        let handle = tokio::spawn(service.run());

        (p2p_to_sync_tx, events, network, processor, handle)
    }

    async fn next_terminal_event(events: &mut broadcast::Receiver<SyncEvent>) -> SyncEvent {
        loop {
            match events.recv().await {
                Ok(event @ (SyncEvent::ChainCompleted { .. } | SyncEvent::ChainFailed { .. })) => {
                    break event;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("sync service stopped without finishing a chain"),
            }
        }
    }

    fn finalized_status(finalized_epoch: u64) -> StatusMessage {
        StatusMessage {
            finalized_root: H256::repeat_byte(1),
            finalized_epoch,
            head_root: H256::repeat_byte(1),
            head_slot: 1000,
        }
    }

    #[tokio::test]
    async fn syncs_finalized_chain_from_single_peer() -> Result<()> {
        let (p2p_to_sync_tx, mut events, network, processor, handle) =
            start(TestNetwork::default(), Duration::from_secs(180));

        P2pToSync::AddPeer(PeerId(1), finalized_status(4)).send(&p2p_to_sync_tx);

        assert_eq!(
            next_terminal_event(&mut events).await,
            SyncEvent::ChainCompleted {
                chain_id: ChainId(0),
            },
        );

        // The 4 epochs before the finalized checkpoint, each block imported once.
        let imported = processor.imported.lock().clone();

        assert_eq!(imported.len(), 32);
        assert!(imported.values().all(|count| *count == 1));
        assert!(network.reports.lock().is_empty());

        drop(p2p_to_sync_tx);

        handle.await??;

        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_peers_time_out_and_fail_chain() -> Result<()> {
        let network = TestNetwork {
            unresponsive: true,
            ..TestNetwork::default()
        };

        let (p2p_to_sync_tx, mut events, network, processor, handle) =
            start(network, Duration::from_secs(1));

        P2pToSync::AddPeer(PeerId(1), finalized_status(4)).send(&p2p_to_sync_tx);

        assert_eq!(
            next_terminal_event(&mut events).await,
            SyncEvent::ChainFailed {
                chain_id: ChainId(0),
            },
        );

        assert_eq!(
            *network.reports.lock(),
            [(
                PeerId(1),
                PeerAction::LowToleranceError,
                PeerReportReason::SyncChainFailed,
            )],
        );
        assert!(processor.imported.lock().is_empty());

        drop(p2p_to_sync_tx);

        handle.await??;

        Ok(())
    }
}
