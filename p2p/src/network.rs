use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use types::containers::SignedBeaconBlock;

use crate::misc::{BlocksByRangeRequest, PeerAction, PeerId, PeerReportReason};

/// Network operations range sync depends on.
#[async_trait]
pub trait SyncNetwork: Send + Sync {
    /// Requests blocks in `request` from `peer_id`.
    ///
    /// Skipped slots are simply missing from the response.
    async fn blocks_by_range(
        &self,
        peer_id: PeerId,
        request: BlocksByRangeRequest,
    ) -> Result<Vec<Arc<SignedBeaconBlock>>>;

    fn report_peer(&self, peer_id: PeerId, action: PeerAction, reason: PeerReportReason);
}
