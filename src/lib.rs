//! # Decoder Job
//!
//! An asynchronous decoder-job state machine for hardware-backed media
//! playback. The job prefetches compressed access units from a demuxer,
//! feeds them to a codec on a dedicated decode thread, schedules decoded
//! output against a wall clock, and handles flush, drain, end-of-stream,
//! config-change and DRM-retry transitions.

pub mod access_unit;
pub mod chunk_store;
pub mod codec;
pub mod decoder_job;
pub mod error;
pub mod scheduler;
pub mod statistics;

pub use access_unit::{AccessUnit, AccessUnitChunk, CryptoInfo, MediaConfig, SubsampleEntry};
pub use chunk_store::{DoubleBufferedChunkStore, SlotSelector};
pub use codec::{
    ChunkSource, CodecBridge, CodecFactory, DequeueInputResult, DequeueOutputResult,
    DrmSessionHandle, FrameSink, OutputBufferInfo, OutputFormat, QueueInputStatus, ReleasedBuffer,
};
pub use decoder_job::{
    DecodeCompletion, DecodeStatus, DecoderJob, DecoderJobConfig, JobState,
};
pub use error::{CodecError, DecoderJobError, Result};
pub use scheduler::{compute_render_decision, RenderDecision};
pub use statistics::JobStatistics;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_are_bounded() {
        let config = DecoderJobConfig::default();
        assert!(config.input_dequeue_timeout <= std::time::Duration::from_secs(1));
        assert!(config.output_dequeue_timeout <= std::time::Duration::from_secs(1));
        assert!(config.skip_reconfigure_before_first_output);
    }
}
