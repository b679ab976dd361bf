use core::cmp::Reverse;
use std::{collections::BTreeMap, sync::Arc};

use anyhow::Error as AnyhowError;
use derive_more::Display;
use helper_functions::misc;
use itertools::Itertools as _;
use log::{debug, info, warn};
use serde::Serialize;
use types::{config::Config, containers::SignedBeaconBlock, primitives::Slot};

use crate::{
    messages::{SyncAction, SyncEvent},
    misc::{
        BatchId, BatchProcessResult, ChainId, PeerAction, PeerId, PeerReportReason,
        RangeSyncType, StatusMessage, SyncConfig, MIN_FINALIZED_CHAIN_VALIDATED_EPOCHS,
        PARALLEL_HEAD_CHAINS,
    },
    sync_chain::{SyncChain, SyncChainDebugState, SyncChainError, SyncChainStatus},
};

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug, Display, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeSyncState {
    #[default]
    #[display("idle")]
    Idle,
    #[display("finalized")]
    Finalized,
    #[display("head")]
    Head,
}

/// Decides which [`SyncChain`]s download.
///
/// At most one finalized chain syncs at a time and head chains only sync once no finalized chain
/// is left. Every method takes the local status so that chains made obsolete by imports are
/// dropped as soon as possible.
pub struct RangeSync {
    chain_config: Arc<Config>,
    sync_config: SyncConfig,
    chains: BTreeMap<ChainId, SyncChain>,
    syncing_finalized: Option<ChainId>,
    next_chain_id: u64,
    state: RangeSyncState,
    events: Vec<SyncEvent>,
}

impl RangeSync {
    #[must_use]
    pub fn new(chain_config: Arc<Config>, sync_config: SyncConfig) -> Self {
        Self {
            chain_config,
            sync_config,
            chains: BTreeMap::new(),
            syncing_finalized: None,
            next_chain_id: 0,
            state: RangeSyncState::Idle,
            events: vec![],
        }
    }

    #[must_use]
    pub const fn state(&self) -> RangeSyncState {
        self.state
    }

    #[must_use]
    pub fn chain(&self, chain_id: ChainId) -> Option<&SyncChain> {
        self.chains.get(&chain_id)
    }

    pub fn chains(&self) -> impl Iterator<Item = &SyncChain> {
        self.chains.values()
    }

    #[must_use]
    pub fn debug_state(&self) -> Vec<SyncChainDebugState> {
        self.chains.values().map(SyncChain::debug_state).collect()
    }

    /// Takes the events produced since the last call.
    pub fn drain_events(&mut self) -> Vec<SyncEvent> {
        core::mem::take(&mut self.events)
    }

    /// Assigns a newly connected peer to the chain matching its status.
    ///
    /// A peer belongs to at most one chain. Peers with nothing to offer are only removed from
    /// their previous chain.
    pub fn add_peer(
        &mut self,
        local: &StatusMessage,
        peer_id: PeerId,
        remote: &StatusMessage,
    ) -> Vec<SyncAction> {
        let mut actions = vec![];

        self.remove_peer_from_chains(peer_id, &mut actions);

        let Some(sync_type) = RangeSyncType::new(local, remote) else {
            debug!("peer {peer_id} has no blocks we need (remote status: {remote:?})");
            self.update_into(local, &mut actions);
            return actions;
        };

        let (target_slot, target_root) = match sync_type {
            RangeSyncType::Finalized => (
                misc::compute_start_slot_at_epoch(&self.chain_config, remote.finalized_epoch),
                remote.finalized_root,
            ),
            RangeSyncType::Head => (remote.head_slot, remote.head_root),
        };

        let existing_chain = self
            .chains
            .values_mut()
            .find(|chain| {
                chain.sync_type() == sync_type
                    && chain.target_slot() == target_slot
                    && chain.target_root() == target_root
            });

        if let Some(chain) = existing_chain {
            actions.extend(chain.add_peer(peer_id));
        } else {
            let chain_id = ChainId(self.next_chain_id);

            self.next_chain_id += 1;

            let chain = SyncChain::new(
                Arc::clone(&self.chain_config),
                self.sync_config,
                chain_id,
                sync_type,
                local.finalized_epoch,
                target_slot,
                target_root,
                peer_id,
            );

            info!("added chain {chain} (id: {chain_id}) with peer {peer_id}");

            self.events.push(SyncEvent::ChainAdded {
                chain_id,
                sync_type,
                target_slot,
            });

            self.chains.insert(chain_id, chain);
        }

        self.update_into(local, &mut actions);

        actions
    }

    pub fn remove_peer(&mut self, local: &StatusMessage, peer_id: PeerId) -> Vec<SyncAction> {
        let mut actions = vec![];

        self.remove_peer_from_chains(peer_id, &mut actions);
        self.update_into(local, &mut actions);

        actions
    }

    pub fn on_download_result(
        &mut self,
        local: &StatusMessage,
        chain_id: ChainId,
        batch_id: BatchId,
        peer_id: PeerId,
        result: Result<Vec<Arc<SignedBeaconBlock>>, AnyhowError>,
    ) -> Vec<SyncAction> {
        let mut actions = vec![];

        if let Some(chain) = self.chains.get_mut(&chain_id) {
            let result = chain.on_download_result(batch_id, peer_id, result);
            self.handle_chain_result(chain_id, result, &mut actions);
        } else {
            debug!("ignoring download of batch {batch_id} for removed chain {chain_id}");
        }

        self.update_into(local, &mut actions);

        actions
    }

    pub fn on_processing_result(
        &mut self,
        local: &StatusMessage,
        chain_id: ChainId,
        batch_id: BatchId,
        result: BatchProcessResult,
    ) -> Vec<SyncAction> {
        let mut actions = vec![];

        if let Some(chain) = self.chains.get_mut(&chain_id) {
            self.events.push(match result {
                BatchProcessResult::Success { imported_blocks } => SyncEvent::BatchProcessed {
                    chain_id,
                    batch_id,
                    imported_blocks,
                },
                BatchProcessResult::Failed { imported_blocks } => SyncEvent::BatchFailed {
                    chain_id,
                    batch_id,
                    imported_blocks,
                },
            });

            let result = chain.on_processing_result(batch_id, result);
            self.handle_chain_result(chain_id, result, &mut actions);
        } else {
            debug!("ignoring processing result of batch {batch_id} for removed chain {chain_id}");
        }

        self.update_into(local, &mut actions);

        actions
    }

    /// Prunes chains made obsolete by `local` and reselects the chains that should sync.
    pub fn update(&mut self, local: &StatusMessage) -> Vec<SyncAction> {
        let mut actions = vec![];
        self.update_into(local, &mut actions);
        actions
    }

    fn update_into(&mut self, local: &StatusMessage, actions: &mut Vec<SyncAction>) {
        self.prune_chains(local);

        if self.update_finalized_chains(local, actions) {
            for chain in self.head_chains_mut() {
                chain.stop_syncing();
            }
        } else {
            self.update_head_chains(local, actions);
        }

        self.update_state();
    }

    // Back-fill sync has no chains here. A back-fill chain would be removed under the same
    // conditions as a forward chain: nothing left to do, no peers, or a target already covered.
    fn prune_chains(&mut self, local: &StatusMessage) {
        let local_finalized_slot =
            misc::compute_start_slot_at_epoch(&self.chain_config, local.finalized_epoch);

        let stale = self
            .chains
            .values()
            .filter(|chain| Self::is_stale(chain, local_finalized_slot))
            .map(SyncChain::id)
            .collect_vec();

        for chain_id in stale {
            if let Some(chain) = self.chains.remove(&chain_id) {
                debug!(
                    "removing stale chain {chain} (status: {}, peers: {})",
                    chain.status(),
                    chain.peer_count(),
                );
            }

            if self.syncing_finalized == Some(chain_id) {
                self.syncing_finalized = None;
            }
        }
    }

    fn is_stale(chain: &SyncChain, local_finalized_slot: Slot) -> bool {
        chain.peer_count() == 0
            || chain.target_slot() <= local_finalized_slot
            || matches!(
                chain.status(),
                SyncChainStatus::Synced | SyncChainStatus::Error,
            )
    }

    // Returns `true` if a finalized chain is syncing.
    fn update_finalized_chains(
        &mut self,
        local: &StatusMessage,
        actions: &mut Vec<SyncAction>,
    ) -> bool {
        // The lowest id wins ties among new candidates.
        let Some(best_id) = self
            .chains
            .values()
            .filter(|chain| chain.sync_type() == RangeSyncType::Finalized)
            .max_by_key(|chain| (chain.peer_count(), Reverse(chain.id())))
            .map(SyncChain::id)
        else {
            self.syncing_finalized = None;
            return false;
        };

        let new_id = match self.syncing_finalized.and_then(|id| self.chains.get(&id)) {
            Some(current) if current.id() == best_id => current.id(),
            Some(current) => {
                let best_peers = self.chains.get(&best_id).map_or(0, SyncChain::peer_count);

                if best_peers > current.peer_count()
                    && current.validated_epochs() >= MIN_FINALIZED_CHAIN_VALIDATED_EPOCHS
                {
                    info!(
                        "switching finalized sync from {current} ({} peers) \
                         to chain {best_id} ({best_peers} peers)",
                        current.peer_count(),
                    );

                    best_id
                } else {
                    current.id()
                }
            }
            None => best_id,
        };

        if let Some(old_id) = self.syncing_finalized.filter(|old_id| *old_id != new_id) {
            if let Some(old_chain) = self.chains.get_mut(&old_id) {
                old_chain.stop_syncing();
            }
        }

        self.syncing_finalized = Some(new_id);
        self.start_chain(new_id, local, actions);

        self.syncing_finalized.is_some()
    }

    fn update_head_chains(&mut self, local: &StatusMessage, actions: &mut Vec<SyncAction>) {
        // Chains already syncing win ties.
        let selected = self
            .chains
            .values()
            .filter(|chain| chain.sync_type() == RangeSyncType::Head)
            .sorted_by_key(|chain| (Reverse(chain.peer_count()), !chain.is_syncing(), chain.id()))
            .map(SyncChain::id)
            .collect_vec();

        let (to_start, to_stop) = selected.split_at(selected.len().min(PARALLEL_HEAD_CHAINS));

        for chain_id in to_stop {
            if let Some(chain) = self.chains.get_mut(chain_id) {
                chain.stop_syncing();
            }
        }

        for chain_id in to_start {
            self.start_chain(*chain_id, local, actions);
        }
    }

    fn start_chain(&mut self, chain_id: ChainId, local: &StatusMessage, actions: &mut Vec<SyncAction>) {
        let Some(chain) = self.chains.get_mut(&chain_id) else {
            return;
        };

        if chain.is_syncing() {
            return;
        }

        let result = chain.start_syncing(local.finalized_epoch);
        self.handle_chain_result(chain_id, result, actions);
    }

    fn handle_chain_result(
        &mut self,
        chain_id: ChainId,
        result: Result<Vec<SyncAction>, SyncChainError>,
        actions: &mut Vec<SyncAction>,
    ) {
        match result {
            Ok(chain_actions) => {
                actions.extend(chain_actions);

                let synced = self
                    .chains
                    .get(&chain_id)
                    .is_some_and(|chain| chain.status() == SyncChainStatus::Synced);

                if synced {
                    self.complete_chain(chain_id);
                }
            }
            Err(error) => self.fail_chain(&error, actions),
        }
    }

    fn complete_chain(&mut self, chain_id: ChainId) {
        if let Some(chain) = self.chains.remove(&chain_id) {
            info!("chain {chain} completed");
            self.events.push(SyncEvent::ChainCompleted { chain_id });
        }

        if self.syncing_finalized == Some(chain_id) {
            self.syncing_finalized = None;
        }
    }

    fn fail_chain(&mut self, error: &SyncChainError, actions: &mut Vec<SyncAction>) {
        let chain_id = error.chain_id;

        if let Some(chain) = self.chains.remove(&chain_id) {
            warn!("removing failed chain {chain}: {}", error.source);

            actions.extend(
                chain
                    .peer_ids()
                    .sorted()
                    .map(|peer_id| SyncAction::ReportPeer {
                        peer_id,
                        action: PeerAction::LowToleranceError,
                        reason: PeerReportReason::SyncChainFailed,
                    }),
            );

            self.events.push(SyncEvent::ChainFailed { chain_id });
        }

        if self.syncing_finalized == Some(chain_id) {
            self.syncing_finalized = None;
        }
    }

    fn remove_peer_from_chains(&mut self, peer_id: PeerId, actions: &mut Vec<SyncAction>) {
        let chain_ids = self
            .chains
            .values()
            .filter(|chain| chain.has_peer(peer_id))
            .map(SyncChain::id)
            .collect_vec();

        for chain_id in chain_ids {
            if let Some(chain) = self.chains.get_mut(&chain_id) {
                let result = chain.remove_peer(peer_id);
                self.handle_chain_result(chain_id, result, actions);
            }
        }
    }

    fn head_chains_mut(&mut self) -> impl Iterator<Item = &mut SyncChain> {
        self.chains
            .values_mut()
            .filter(|chain| chain.sync_type() == RangeSyncType::Head)
    }

    fn update_state(&mut self) {
        let state = if self.syncing_finalized.is_some() {
            RangeSyncState::Finalized
        } else if self.chains.values().any(SyncChain::is_syncing) {
            RangeSyncState::Head
        } else {
            RangeSyncState::Idle
        };

        if state != self.state {
            info!("range sync state changed from {} to {state}", self.state);

            self.state = state;
            self.events.push(SyncEvent::StateChanged { state });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use anyhow::anyhow;
    use types::primitives::{Epoch, H256};

    use super::*;

    const LOCAL_HEAD_SLOT: Slot = 20;

    fn local(finalized_epoch: Epoch) -> StatusMessage {
        StatusMessage {
            finalized_root: H256::zero(),
            finalized_epoch,
            head_root: H256::repeat_byte(0xff),
            head_slot: LOCAL_HEAD_SLOT,
        }
    }

    fn finalized_peer(finalized_epoch: Epoch, fork: u8) -> StatusMessage {
        StatusMessage {
            finalized_root: H256::repeat_byte(fork),
            finalized_epoch,
            head_root: H256::repeat_byte(fork),
            head_slot: 1000,
        }
    }

    fn head_peer(head_slot: Slot, fork: u8) -> StatusMessage {
        StatusMessage {
            finalized_root: H256::zero(),
            finalized_epoch: 0,
            head_root: H256::repeat_byte(fork),
            head_slot,
        }
    }

    fn range_sync() -> RangeSync {
        let _ = env_logger::builder().is_test(true).try_init();

        RangeSync::new(Arc::new(Config::minimal()), SyncConfig::default())
    }

    fn syncing_chains(range_sync: &RangeSync) -> Vec<(RangeSyncType, ChainId)> {
        range_sync
            .chains()
            .filter(|chain| chain.is_syncing())
            .map(|chain| (chain.sync_type(), chain.id()))
            .collect()
    }

    fn chain_downloads(actions: &[SyncAction]) -> Vec<ChainId> {
        actions
            .iter()
            .filter_map(|action| match action {
                SyncAction::DownloadBatch { chain_id, .. } => Some(*chain_id),
                _ => None,
            })
            .dedup()
            .collect()
    }

    // Answers downloads and processing until `done` returns `true` or no work is left.
    // Returns the peer reports.
    fn drive(
        range_sync: &mut RangeSync,
        local: &StatusMessage,
        initial_actions: Vec<SyncAction>,
        mut download: impl FnMut() -> Result<Vec<Arc<SignedBeaconBlock>>, AnyhowError>,
        done: impl Fn(&RangeSync) -> bool,
    ) -> Vec<(PeerId, PeerAction, PeerReportReason)> {
        let mut queue = VecDeque::from(initial_actions);
        let mut reports = vec![];

        while !done(range_sync) {
            let Some(action) = queue.pop_front() else {
                break;
            };

            let new_actions = match action {
                SyncAction::DownloadBatch {
                    chain_id,
                    batch_id,
                    peer_id,
                    ..
                } => range_sync.on_download_result(local, chain_id, batch_id, peer_id, download()),
                SyncAction::ProcessBatch {
                    chain_id, batch_id, ..
                } => range_sync.on_processing_result(
                    local,
                    chain_id,
                    batch_id,
                    BatchProcessResult::Success { imported_blocks: 1 },
                ),
                SyncAction::ReportPeer {
                    peer_id,
                    action,
                    reason,
                } => {
                    reports.push((peer_id, action, reason));
                    vec![]
                }
            };

            queue.extend(new_actions);
        }

        reports
    }

    #[test]
    fn peers_without_new_blocks_create_no_chains() {
        let mut range_sync = range_sync();

        let actions = range_sync.add_peer(&local(2), PeerId(1), &head_peer(LOCAL_HEAD_SLOT, 1));

        assert!(actions.is_empty());
        assert_eq!(range_sync.chains().count(), 0);
        assert_eq!(range_sync.state(), RangeSyncState::Idle);
    }

    #[test]
    fn finalized_chain_syncs_before_head_chains() {
        let mut range_sync = range_sync();
        let local = local(0);

        let actions = range_sync.add_peer(&local, PeerId(1), &head_peer(64, 1));

        assert_eq!(range_sync.state(), RangeSyncState::Head);
        assert_eq!(chain_downloads(&actions), [ChainId(0)]);

        let actions = range_sync.add_peer(&local, PeerId(2), &finalized_peer(4, 2));

        assert_eq!(range_sync.state(), RangeSyncState::Finalized);
        assert_eq!(chain_downloads(&actions), [ChainId(1)]);
        assert_eq!(
            syncing_chains(&range_sync),
            [(RangeSyncType::Finalized, ChainId(1))],
        );

        assert_eq!(
            range_sync.drain_events(),
            [
                SyncEvent::ChainAdded {
                    chain_id: ChainId(0),
                    sync_type: RangeSyncType::Head,
                    target_slot: 64,
                },
                SyncEvent::StateChanged {
                    state: RangeSyncState::Head,
                },
                SyncEvent::ChainAdded {
                    chain_id: ChainId(1),
                    sync_type: RangeSyncType::Finalized,
                    target_slot: 32,
                },
                SyncEvent::StateChanged {
                    state: RangeSyncState::Finalized,
                },
            ],
        );
    }

    #[test]
    fn head_chains_resume_after_finalized_chain_completes() {
        let mut range_sync = range_sync();
        let local = local(0);

        range_sync.add_peer(&local, PeerId(1), &head_peer(64, 1));

        let actions = range_sync.add_peer(&local, PeerId(2), &finalized_peer(1, 2));

        drive(
            &mut range_sync,
            &local,
            actions,
            || Ok(vec![]),
            |range_sync| range_sync.state() == RangeSyncState::Head,
        );

        assert_eq!(syncing_chains(&range_sync), [(RangeSyncType::Head, ChainId(0))]);
        assert!(range_sync
            .drain_events()
            .contains(&SyncEvent::ChainCompleted { chain_id: ChainId(1) }));
    }

    #[test]
    fn peers_with_same_target_share_a_chain() {
        let mut range_sync = range_sync();
        let local = local(0);

        range_sync.add_peer(&local, PeerId(1), &finalized_peer(4, 1));
        range_sync.add_peer(&local, PeerId(2), &finalized_peer(4, 1));

        itertools::assert_equal(range_sync.chains().map(SyncChain::peer_count), [2]);
    }

    #[test]
    fn tie_keeps_current_finalized_chain() {
        let mut range_sync = range_sync();
        let local = local(0);

        range_sync.add_peer(&local, PeerId(1), &finalized_peer(4, 1));
        range_sync.add_peer(&local, PeerId(2), &finalized_peer(5, 2));

        assert_eq!(
            syncing_chains(&range_sync),
            [(RangeSyncType::Finalized, ChainId(0))],
        );
    }

    #[test]
    fn more_popular_chain_replaces_current_only_after_progress() {
        let mut range_sync = range_sync();
        let local = local(0);

        let actions = range_sync.add_peer(&local, PeerId(1), &finalized_peer(20, 1));

        range_sync.add_peer(&local, PeerId(2), &finalized_peer(30, 2));
        range_sync.add_peer(&local, PeerId(3), &finalized_peer(30, 2));

        assert_eq!(
            syncing_chains(&range_sync),
            [(RangeSyncType::Finalized, ChainId(0))],
        );

        drive(
            &mut range_sync,
            &local,
            actions,
            || Ok(vec![]),
            |range_sync| {
                range_sync
                    .chain(ChainId(0))
                    .is_some_and(|chain| !chain.is_syncing())
            },
        );

        let replaced = range_sync.chain(ChainId(0)).expect("replaced chain is kept");

        assert_eq!(replaced.validated_epochs(), MIN_FINALIZED_CHAIN_VALIDATED_EPOCHS);
        assert_eq!(
            syncing_chains(&range_sync),
            [(RangeSyncType::Finalized, ChainId(1))],
        );
    }

    #[test]
    fn head_chains_are_limited_to_most_popular() {
        let mut range_sync = range_sync();
        let local = local(0);

        range_sync.add_peer(&local, PeerId(1), &head_peer(64, 1));
        range_sync.add_peer(&local, PeerId(2), &head_peer(72, 2));
        range_sync.add_peer(&local, PeerId(3), &head_peer(80, 3));

        assert_eq!(
            syncing_chains(&range_sync),
            [
                (RangeSyncType::Head, ChainId(0)),
                (RangeSyncType::Head, ChainId(1)),
            ],
        );

        range_sync.add_peer(&local, PeerId(4), &head_peer(80, 3));
        range_sync.add_peer(&local, PeerId(5), &head_peer(72, 2));

        assert_eq!(
            syncing_chains(&range_sync),
            [
                (RangeSyncType::Head, ChainId(1)),
                (RangeSyncType::Head, ChainId(2)),
            ],
        );
    }

    #[test]
    fn stale_chains_are_pruned() {
        let mut range_sync = range_sync();

        range_sync.add_peer(&local(0), PeerId(1), &finalized_peer(3, 1));
        range_sync.add_peer(&local(0), PeerId(2), &head_peer(64, 2));

        assert_eq!(range_sync.chains().count(), 2);

        // Blocks up to epoch 3 were finalized through some other chain.
        range_sync.update(&local(3));

        itertools::assert_equal(range_sync.chains().map(SyncChain::id), [ChainId(1)]);
        assert_eq!(range_sync.state(), RangeSyncState::Head);

        range_sync.remove_peer(&local(3), PeerId(2));

        assert_eq!(range_sync.chains().count(), 0);
        assert_eq!(range_sync.state(), RangeSyncState::Idle);
    }

    #[test]
    fn peer_moves_to_chain_matching_its_latest_status() {
        let mut range_sync = range_sync();
        let local = local(0);

        range_sync.add_peer(&local, PeerId(1), &finalized_peer(3, 1));
        range_sync.add_peer(&local, PeerId(1), &finalized_peer(4, 1));

        itertools::assert_equal(range_sync.chains().map(SyncChain::id), [ChainId(1)]);
    }

    #[test]
    fn failed_chain_penalizes_all_its_peers() {
        let mut range_sync = range_sync();
        let local = local(0);

        let mut actions = range_sync.add_peer(&local, PeerId(1), &finalized_peer(1, 1));
        actions.extend(range_sync.add_peer(&local, PeerId(2), &finalized_peer(1, 1)));

        let reports = drive(
            &mut range_sync,
            &local,
            actions,
            || Err(anyhow!("timed out")),
            |range_sync| range_sync.chains().count() == 0,
        );

        assert_eq!(
            reports,
            [
                (
                    PeerId(1),
                    PeerAction::LowToleranceError,
                    PeerReportReason::SyncChainFailed,
                ),
                (
                    PeerId(2),
                    PeerAction::LowToleranceError,
                    PeerReportReason::SyncChainFailed,
                ),
            ],
        );
        assert!(range_sync
            .drain_events()
            .contains(&SyncEvent::ChainFailed { chain_id: ChainId(0) }));
        assert_eq!(range_sync.state(), RangeSyncState::Idle);
    }
}
