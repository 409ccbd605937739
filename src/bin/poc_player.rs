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

use anyhow::Result;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use videocall_decoder_job::{
    AccessUnit, AccessUnitChunk, ChunkSource, CodecBridge, CodecError, CodecFactory,
    DecodeStatus, DecoderJob, DecoderJobConfig, DequeueInputResult, DequeueOutputResult,
    DrmSessionHandle, FrameSink, MediaConfig, OutputBufferInfo, QueueInputStatus, ReleasedBuffer,
};

const FRAME_PERIOD: Duration = Duration::from_millis(33);
const UNITS_PER_CHUNK: usize = 8;
const TOTAL_UNITS: usize = 48;

/// A lock-step stand-in codec. Every accepted unit becomes a decoded frame
/// on the same cycle; the end of stream comes out two pulls after it went in.
struct SimulatedCodec {
    pending: VecDeque<OutputBufferInfo>,
    eos_queued: bool,
    eos_delay: usize,
    next_index: usize,
}

impl SimulatedCodec {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            eos_queued: false,
            eos_delay: 2,
            next_index: 0,
        }
    }
}

impl CodecBridge for SimulatedCodec {
    fn dequeue_input_buffer(&mut self, _timeout: Duration) -> DequeueInputResult {
        let index = self.next_index;
        self.next_index += 1;
        DequeueInputResult::Index(index)
    }

    fn queue_input(
        &mut self,
        index: usize,
        payload: &[u8],
        timestamp: Duration,
        _crypto: Option<&videocall_decoder_job::CryptoInfo>,
    ) -> QueueInputStatus {
        self.pending.push_back(OutputBufferInfo {
            index,
            offset: 0,
            size: payload.len(),
            presentation_timestamp: timestamp,
            is_end_of_stream: false,
        });
        QueueInputStatus::Ok
    }

    fn queue_eos(&mut self, _index: usize) -> QueueInputStatus {
        self.eos_queued = true;
        QueueInputStatus::Ok
    }

    fn dequeue_output(&mut self, _timeout: Duration) -> DequeueOutputResult {
        if let Some(info) = self.pending.pop_front() {
            return DequeueOutputResult::Frame(info);
        }
        if self.eos_queued {
            if self.eos_delay > 0 {
                self.eos_delay -= 1;
                return DequeueOutputResult::TryAgainLater;
            }
            return DequeueOutputResult::Frame(OutputBufferInfo {
                index: 0,
                offset: 0,
                size: 0,
                presentation_timestamp: Duration::ZERO,
                is_end_of_stream: true,
            });
        }
        DequeueOutputResult::TryAgainLater
    }

    fn flush(&mut self) -> std::result::Result<(), CodecError> {
        self.pending.clear();
        self.eos_queued = false;
        Ok(())
    }
}

struct SimulatedCodecFactory;

impl CodecFactory for SimulatedCodecFactory {
    fn create_codec(
        &mut self,
        config: &MediaConfig,
        _drm_session: Option<&DrmSessionHandle>,
    ) -> std::result::Result<Box<dyn CodecBridge>, CodecError> {
        println!("[FACTORY] Creating simulated codec for {}", config.mime_type);
        Ok(Box::new(SimulatedCodec::new()))
    }
}

/// Produces chunks of timestamped units off a background thread with a bit
/// of latency jitter, the way a network-backed demuxer would.
struct SimulatedDemuxer {
    next_unit: usize,
}

impl ChunkSource for SimulatedDemuxer {
    fn request_chunk(&mut self, on_ready: Box<dyn FnOnce(AccessUnitChunk) + Send>) {
        let first = self.next_unit;
        self.next_unit += UNITS_PER_CHUNK;

        std::thread::spawn(move || {
            let latency = rand::thread_rng().gen_range(5..25);
            std::thread::sleep(Duration::from_millis(latency));

            let mut units = Vec::new();
            for i in first..(first + UNITS_PER_CHUNK).min(TOTAL_UNITS) {
                let mut unit = AccessUnit::data(FRAME_PERIOD * i as u32, vec![0xab; 900]);
                unit.is_key_frame = i % 16 == 0;
                units.push(unit);
            }
            if first + UNITS_PER_CHUNK >= TOTAL_UNITS {
                units.push(AccessUnit::end_of_stream());
            }
            on_ready(AccessUnitChunk::new(units));
        });
    }
}

struct ConsoleSink;

impl FrameSink for ConsoleSink {
    fn release_buffer(&mut self, buffer: ReleasedBuffer) {
        if buffer.should_render {
            println!(
                "[SINK] Rendered frame @ {:>6.1}ms ({} bytes)",
                buffer.presentation_timestamp.as_secs_f64() * 1000.0,
                buffer.size
            );
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    println!("--- Decoder Job Playback Simulation ---");

    let mut job = DecoderJob::new(
        DecoderJobConfig::default(),
        MediaConfig::new("video/vp9"),
        Box::new(SimulatedDemuxer { next_unit: 0 }),
        Box::new(SimulatedCodecFactory),
        Box::new(ConsoleSink),
        Box::new(|format| println!("[MAIN_THREAD] Output format changed: {format:?}")),
    );

    let prefetched = Arc::new(Mutex::new(false));
    let cell = prefetched.clone();
    job.prefetch(Box::new(move || *cell.lock().unwrap() = true))
        .expect("prefetch");
    while !*prefetched.lock().unwrap() {
        job.wait_for_events(Duration::from_millis(10));
    }

    let start = Instant::now();
    while !job.output_reached_end_of_stream() {
        let completion: Arc<Mutex<Option<DecodeStatus>>> = Arc::new(Mutex::new(None));
        let cell = completion.clone();
        job.decode(
            start,
            Duration::ZERO,
            Box::new(move |c| *cell.lock().unwrap() = Some(c.status)),
        )?;

        let status = loop {
            job.wait_for_events(Duration::from_millis(10));
            if let Some(status) = completion.lock().unwrap().take() {
                break status;
            }
        };

        match status {
            DecodeStatus::Ok | DecodeStatus::InputExhausted | DecodeStatus::OutputExhausted => {}
            DecodeStatus::TryAgainLater | DecodeStatus::MissingKey => {
                std::thread::sleep(Duration::from_millis(5));
            }
            other => anyhow::bail!("playback failed: {other:?}"),
        }
    }

    let stats = job.stats();
    println!(
        "\n[STATS] cycles: {} | decoded: {} | rendered: {} | late: {} | chunks: {}",
        stats.decode_cycles,
        stats.frames_decoded,
        stats.frames_rendered,
        stats.late_frames,
        stats.chunks_received
    );
    job.release();
    Ok(())
}
