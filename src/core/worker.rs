//! Block fetch worker
//!
//! One worker owns one block: it opens a range-scoped connection, streams the
//! body chunk by chunk, and writes each chunk at the block's absolute file
//! offset. Blocks target disjoint file regions, so workers never take a lock
//! around writes. Failures are returned as classified outcomes, never thrown
//! across the worker/coordinator boundary; retry policy lives in the
//! coordinator.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::TryStreamExt;
use log::{debug, warn};
use reqwest::Client;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::core::block::{Block, BlockState};
use crate::core::error::{Error, Result};
use crate::core::events::SinkSet;
use crate::core::task::Task;

/// Terminal classification of a single block fetch.
#[derive(Debug)]
pub(crate) enum BlockOutcome {
    Done,
    Canceled,
    Failed(Error),
}

pub(crate) struct FetchWorker {
    pub client: Client,
    pub task: Arc<Task>,
    pub block: Arc<Block>,
    pub sinks: SinkSet,
    pub token: CancellationToken,
    pub read_timeout: Duration,
    /// Backoff delay before a retry attempt starts
    pub start_delay: Duration,
}

impl FetchWorker {
    pub(crate) async fn run(self) -> (u32, BlockOutcome) {
        let index = self.block.index;

        if !self.start_delay.is_zero() {
            tokio::select! {
                _ = self.token.cancelled() => return (index, BlockOutcome::Canceled),
                _ = tokio::time::sleep(self.start_delay) => {}
            }
        }

        let outcome = match self.fetch().await {
            Ok(true) => {
                self.block.set_state(BlockState::Done);
                BlockOutcome::Done
            }
            Ok(false) => {
                self.block.set_state(BlockState::Pending);
                BlockOutcome::Canceled
            }
            Err(err) => {
                self.block.set_state(BlockState::Failed);
                BlockOutcome::Failed(err)
            }
        };
        (index, outcome)
    }

    /// Ok(true) on completion, Ok(false) when canceled.
    async fn fetch(&self) -> Result<bool> {
        let block = &self.block;
        let task = &self.task;

        if block.is_done() {
            // restored from a breakpoint with nothing left to do
            debug!("block {} of task {} already complete", block.index, task.id);
            return Ok(true);
        }

        block.set_state(BlockState::Connecting);
        self.sinks.connect_start(task, block.index);

        let offset = block.start + block.bytes_completed();
        let mut request = self.client.get(&task.url);
        let ranged = match block.end {
            Some(end) => {
                request = request.header("Range", format!("bytes={offset}-{end}"));
                true
            }
            // unknown total length: plain GET of the whole body
            None => false,
        };

        let response = tokio::select! {
            _ = self.token.cancelled() => return Ok(false),
            result = request.send() => result?,
        };
        let status = response.status();
        self.sinks.connect_end(task, block.index, status.as_u16());

        if ranged {
            match status.as_u16() {
                206 => {}
                // an origin without range support answers 200 with the whole
                // body; usable only when this block starts at offset 0
                200 if offset == 0 => {}
                200 => {
                    // a 200 to a nonzero-offset range request would replay the
                    // whole body into the middle of the file
                    return Err(Error::HttpError(format!(
                        "server ignored range request for block {}",
                        block.index
                    )));
                }
                _ => {
                    return Err(Error::HttpStatus {
                        status: status.as_u16(),
                        context: format!("range request for block {}", block.index),
                    });
                }
            }
        } else if !status.is_success() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                context: "fetch request".to_string(),
            });
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&task.path)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;

        block.set_state(BlockState::Fetching);
        self.sinks.fetch_start(task, block.index, block.remaining().unwrap_or(0));

        let mut stream = response.bytes_stream();
        loop {
            let chunk: Option<Bytes> = tokio::select! {
                _ = self.token.cancelled() => {
                    file.flush().await?;
                    return Ok(false);
                }
                result = tokio::time::timeout(self.read_timeout, stream.try_next()) => match result {
                    Err(_) => {
                        return Err(Error::StreamInterrupted(format!(
                            "block {} read timed out after {:?}",
                            block.index, self.read_timeout
                        )))
                    }
                    Ok(Err(err)) => {
                        return Err(Error::StreamInterrupted(format!(
                            "block {}: {err}",
                            block.index
                        )))
                    }
                    Ok(Ok(chunk)) => chunk,
                },
            };

            let Some(mut chunk) = chunk else { break };
            if chunk.is_empty() {
                continue;
            }

            if let Some(remaining) = block.remaining() {
                if chunk.len() as u64 > remaining {
                    warn!(
                        "block {}: server sent {} bytes past the requested range, truncating",
                        block.index,
                        chunk.len() as u64 - remaining
                    );
                    chunk = chunk.slice(0..remaining as usize);
                    if chunk.is_empty() {
                        break;
                    }
                }
            }

            file.write_all(&chunk).await?;
            // counted only after the write completed, so a breakpoint never
            // claims bytes that are not on disk
            block.add_completed(chunk.len() as u64);
            self.sinks.fetch_progress(task, block.index, chunk.len() as u64);
        }
        file.flush().await?;

        if let Some(len) = block.len() {
            let transferred = block.bytes_completed();
            if transferred != len {
                return Err(Error::StreamInterrupted(format!(
                    "block {} connection closed early: {transferred} of {len} bytes",
                    block.index
                )));
            }
        }

        self.sinks.fetch_end(task, block.index);
        Ok(true)
    }
}
