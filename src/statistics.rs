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

//! Lifetime counters maintained by the decoder job.

use serde::{Deserialize, Serialize};

/// Counters that persist over the decoder job lifetime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobStatistics {
    /// Decode cycles completed, regardless of status.
    pub decode_cycles: u64,
    /// Output buffers pulled from the codec.
    pub frames_decoded: u64,
    /// Buffers released with rendering enabled.
    pub frames_rendered: u64,
    /// Rendered frames whose target render time had already passed.
    pub late_frames: u64,
    /// Cycles that stalled on a missing decryption key.
    pub missing_key_stalls: u64,
    /// Cycles that stalled on a busy codec input side.
    pub try_again_stalls: u64,
    /// Access units skipped because the demuxer aborted them.
    pub aborted_units: u64,
    /// Config-change markers encountered.
    pub config_changes: u64,
    /// Drains run to completion ahead of a reconfiguration.
    pub drains_completed: u64,
    /// Flushes requested by the owner.
    pub flushes: u64,
    /// Codec instances created.
    pub codec_creations: u64,
    /// Codec instances released.
    pub codec_releases: u64,
    /// Demuxer pulls issued.
    pub prefetch_requests: u64,
    /// Chunks delivered by the demuxer.
    pub chunks_received: u64,
}
