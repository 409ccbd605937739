/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! The collaborator contracts consumed by the decoder job: the codec bridge
//! wrapping the concrete hardware/software decoder, the factory creating it,
//! the demuxer supplying compressed chunks, and the sink receiving released
//! output buffers.

use crate::access_unit::{AccessUnitChunk, CryptoInfo, MediaConfig};
use crate::error::CodecError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Opaque handle to a DRM key session attached to the decoder job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrmSessionHandle {
    pub session_id: u64,
}

/// Result of asking the codec for a free input buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum DequeueInputResult {
    /// A free input buffer, identified by index.
    Index(usize),
    /// No buffer freed up within the timeout. Retry on the next cycle.
    TryAgainLater,
    /// Unrecoverable codec failure.
    Error(String),
}

/// Result of submitting data into an acquired input buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueInputStatus {
    /// The unit was accepted.
    Ok,
    /// The codec's input side has already seen end of stream.
    InputEos,
    /// The codec cannot take the unit right now. The acquired buffer index
    /// must be retained and reused on the next cycle.
    TryAgainLater,
    /// The decryption key for this unit is not available yet. Retryable
    /// without state loss; the buffer index must be retained.
    MissingKey,
    /// Unrecoverable codec failure.
    Error(String),
}

/// A decoded output buffer as handed out by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputBufferInfo {
    pub index: usize,
    pub offset: usize,
    pub size: usize,
    /// Presentation timestamp of the decoded frame.
    pub presentation_timestamp: Duration,
    /// The codec has emitted its last output. The buffer is an empty stub.
    pub is_end_of_stream: bool,
}

/// Output format parameters reported by the codec when they change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutputFormat {
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u8,
}

/// Result of pulling decoded output from the codec.
#[derive(Debug, Clone, PartialEq)]
pub enum DequeueOutputResult {
    /// A decoded buffer is available.
    Frame(OutputBufferInfo),
    /// The output format changed. Apply it and keep pulling.
    FormatChanged(OutputFormat),
    /// Nothing decoded within the timeout.
    TryAgainLater,
    /// Unrecoverable codec failure.
    Error(String),
}

/// Abstraction over the concrete hardware/software decoder.
///
/// All methods may block for up to the given timeout; the decoder job only
/// ever invokes them from its dedicated decode thread. Dropping the bridge
/// releases the underlying codec instance.
pub trait CodecBridge: Send {
    /// Acquires a free input buffer index, waiting up to `timeout`.
    fn dequeue_input_buffer(&mut self, timeout: Duration) -> DequeueInputResult;

    /// Submits one compressed unit into the buffer at `index`.
    fn queue_input(
        &mut self,
        index: usize,
        payload: &[u8],
        timestamp: Duration,
        crypto: Option<&CryptoInfo>,
    ) -> QueueInputStatus;

    /// Submits the end-of-stream marker into the buffer at `index`.
    fn queue_eos(&mut self, index: usize) -> QueueInputStatus;

    /// Pulls one decoded buffer, waiting up to `timeout`.
    fn dequeue_output(&mut self, timeout: Duration) -> DequeueOutputResult;

    /// Discards all buffered input and output.
    fn flush(&mut self) -> std::result::Result<(), CodecError>;
}

/// Creates codec bridge instances for a given stream configuration.
pub trait CodecFactory: Send {
    fn create_codec(
        &mut self,
        config: &MediaConfig,
        drm_session: Option<&DrmSessionHandle>,
    ) -> std::result::Result<Box<dyn CodecBridge>, CodecError>;
}

/// An output buffer released towards the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasedBuffer {
    pub index: usize,
    pub offset: usize,
    pub size: usize,
    pub presentation_timestamp: Duration,
    /// False for preroll frames, end-of-stream stubs and buffers released
    /// after the job was stopped.
    pub should_render: bool,
}

/// Receives released output buffers. Invoked from the decode thread.
pub trait FrameSink: Send {
    fn release_buffer(&mut self, buffer: ReleasedBuffer);
}

/// The demuxer boundary: supplies compressed access unit chunks.
///
/// At most one request is outstanding at a time; the implementation invokes
/// `on_ready` exactly once per request, from any thread. A request that is
/// outstanding across a stream flush is answered with post-flush data or
/// with aborted units, never with stale pre-flush samples.
pub trait ChunkSource: Send {
    fn request_chunk(&mut self, on_ready: Box<dyn FnOnce(AccessUnitChunk) + Send>);
}
