use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use types::{
    containers::ExecutionPayload,
    primitives::{ExecutionBlockHash, H256},
};

use crate::types::{PayloadStatusV1, PayloadValidationStatus};

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Submits `payload` for validation.
    ///
    /// An `Err` means the engine could not be reached or did not respond in a usable way.
    /// Callers treat it the same as [`PayloadValidationStatus::ElError`].
    async fn notify_new_payload(
        &self,
        beacon_block_root: H256,
        payload: &ExecutionPayload,
    ) -> Result<PayloadStatusV1>;
}

#[async_trait]
impl<E: ExecutionEngine + ?Sized> ExecutionEngine for &E {
    async fn notify_new_payload(
        &self,
        beacon_block_root: H256,
        payload: &ExecutionPayload,
    ) -> Result<PayloadStatusV1> {
        (**self).notify_new_payload(beacon_block_root, payload).await
    }
}

#[async_trait]
impl<E: ExecutionEngine + ?Sized> ExecutionEngine for Arc<E> {
    async fn notify_new_payload(
        &self,
        beacon_block_root: H256,
        payload: &ExecutionPayload,
    ) -> Result<PayloadStatusV1> {
        self.as_ref()
            .notify_new_payload(beacon_block_root, payload)
            .await
    }
}

/// Execution engine with scripted responses.
///
/// Payloads without a scripted response get `default_status`.
/// A `Valid` default reports the payload's own hash as the latest valid hash.
pub struct MockExecutionEngine {
    default_status: PayloadValidationStatus,
    responses: Mutex<HashMap<ExecutionBlockHash, PayloadStatusV1>>,
    delay: Option<Duration>,
    notified: Mutex<Vec<ExecutionBlockHash>>,
}

impl MockExecutionEngine {
    #[must_use]
    pub fn new(default_status: PayloadValidationStatus) -> Self {
        Self {
            default_status,
            responses: Mutex::default(),
            delay: None,
            notified: Mutex::default(),
        }
    }

    #[must_use]
    pub fn valid() -> Self {
        Self::new(PayloadValidationStatus::Valid)
    }

    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_response(&self, block_hash: ExecutionBlockHash, status: PayloadStatusV1) {
        self.responses.lock().insert(block_hash, status);
    }

    /// Hashes of payloads whose validation ran to completion, in call order.
    #[must_use]
    pub fn notified_payloads(&self) -> Vec<ExecutionBlockHash> {
        self.notified.lock().clone()
    }
}

#[async_trait]
impl ExecutionEngine for MockExecutionEngine {
    async fn notify_new_payload(
        &self,
        beacon_block_root: H256,
        payload: &ExecutionPayload,
    ) -> Result<PayloadStatusV1> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let block_hash = payload.block_hash;

        self.notified.lock().push(block_hash);

        let status = self
            .responses
            .lock()
            .get(&block_hash)
            .cloned()
            .unwrap_or_else(|| match self.default_status {
                PayloadValidationStatus::Valid => PayloadStatusV1::valid(block_hash),
                status => PayloadStatusV1::new(status),
            });

        debug!(
            "mock execution engine: payload {block_hash:?} of block {beacon_block_root:?} \
             is {:?}",
            status.status,
        );

        Ok(status)
    }
}
