//! Block requests and their completion channels.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use super::RenderTarget;
use crate::util::{Result, TracerError};

/// Per-request rendering parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderParams {
    pub samples_per_pixel: u32,
    pub exposure: f32,
    pub seed: u32,
}

impl Default for RenderParams {
    fn default() -> Self {
        Self {
            samples_per_pixel: 1,
            exposure: 1.0,
            seed: 0,
        }
    }
}

/// Request to render rows `block_y .. block_y + block_h` of the frame.
///
/// The block always spans the full frame width. A request is consumed by
/// exactly one tracer, which answers on exactly one of its two channels:
/// the block height on success, the error on failure.
pub struct BlockRequest {
    pub block_y: u32,
    pub block_h: u32,
    pub target: Arc<RenderTarget>,
    pub params: RenderParams,
    done: Sender<u32>,
    failed: Sender<TracerError>,
}

impl BlockRequest {
    /// Create a request with fresh completion channels.
    pub fn new(target: Arc<RenderTarget>, block_y: u32, block_h: u32, params: RenderParams) -> (Self, BlockCompletion) {
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let (failed_tx, failed_rx) = crossbeam_channel::bounded(1);
        let request = Self::with_channels(target, block_y, block_h, params, done_tx, failed_tx);
        let completion = BlockCompletion {
            done: done_rx,
            failed: failed_rx,
        };
        (request, completion)
    }

    /// Create a request answering on caller-provided channels, e.g. one pair
    /// shared by every block of a frame.
    pub fn with_channels(
        target: Arc<RenderTarget>,
        block_y: u32,
        block_h: u32,
        params: RenderParams,
        done: Sender<u32>,
        failed: Sender<TracerError>,
    ) -> Self {
        Self {
            block_y,
            block_h,
            target,
            params,
            done,
            failed,
        }
    }

    /// Deliver the outcome and consume the request.
    pub(crate) fn complete(self, result: Result<()>) {
        // a caller that stopped listening is not the tracer's problem
        match result {
            Ok(()) => {
                let _ = self.done.send(self.block_h);
            }
            Err(err) => {
                let _ = self.failed.send(err);
            }
        }
    }
}

impl std::fmt::Debug for BlockRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockRequest")
            .field("block_y", &self.block_y)
            .field("block_h", &self.block_h)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// Receiving side of a [`BlockRequest`] created with [`BlockRequest::new`].
pub struct BlockCompletion {
    done: Receiver<u32>,
    failed: Receiver<TracerError>,
}

impl BlockCompletion {
    /// Wait up to `timeout` for the outcome.
    ///
    /// `None` means no answer arrived: the request is still running, was
    /// dropped by a busy tracer, or was discarded without being served.
    pub fn wait(&self, timeout: Duration) -> Option<Result<u32>> {
        // the request drops both senders right after answering, so a
        // disconnected channel means the answer (if any) sits in the other one
        crossbeam_channel::select! {
            recv(self.done) -> msg => match msg {
                Ok(rows) => Some(Ok(rows)),
                Err(_) => self.failed.try_recv().ok().map(Err),
            },
            recv(self.failed) -> msg => match msg {
                Ok(err) => Some(Err(err)),
                Err(_) => self.done.try_recv().ok().map(Ok),
            },
            default(timeout) => None,
        }
    }

    /// Outcome if it has already arrived.
    pub fn try_get(&self) -> Option<Result<u32>> {
        self.wait(Duration::ZERO)
    }
}
