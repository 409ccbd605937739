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

//! The DecoderJob, which drives one codec through its full lifecycle: it
//! prefetches compressed chunks from the demuxer, feeds units to the codec on
//! a dedicated decode thread, schedules decoded output against the wall
//! clock and handles flush, drain, end-of-stream, config-change and DRM
//! retry transitions.
//!
//! All public entry points run on the owner context. Completions are queued
//! internally and delivered when the owner calls `process_events` or
//! `wait_for_events`, so callback bodies never need their own locking.

use crate::access_unit::{AccessUnit, AccessUnitChunk, MediaConfig};
use crate::chunk_store::DoubleBufferedChunkStore;
use crate::codec::{
    ChunkSource, CodecBridge, CodecFactory, DequeueInputResult, DequeueOutputResult,
    DrmSessionHandle, FrameSink, OutputFormat, QueueInputStatus, ReleasedBuffer,
};
use crate::error::{DecoderJobError, Result};
use crate::scheduler::compute_render_decision;
use crate::statistics::JobStatistics;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Configuration for a decoder job.
#[derive(Debug, Clone)]
pub struct DecoderJobConfig {
    /// Bounded wait when acquiring a free codec input buffer.
    pub input_dequeue_timeout: Duration,
    /// Bounded wait when pulling decoded output from the codec.
    pub output_dequeue_timeout: Duration,
    /// Take a config change without draining when the codec has not produced
    /// any output yet. Some hardware codecs cannot reconfigure before their
    /// first output frame; draining them at that point would hang.
    pub skip_reconfigure_before_first_output: bool,
}

impl Default for DecoderJobConfig {
    fn default() -> Self {
        Self {
            input_dequeue_timeout: Duration::from_millis(250),
            output_dequeue_timeout: Duration::from_millis(250),
            skip_reconfigure_before_first_output: true,
        }
    }
}

/// Observable lifecycle state of a decoder job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// No work in flight.
    Idle,
    /// A demuxer pull is outstanding and no decode cycle is running.
    Prefetching,
    /// A decode cycle is in flight.
    Decoding,
    /// A config change was hit; the old codec is flushing out its buffered
    /// frames before being discarded.
    Draining,
    /// A flush is pending and will be applied by the next decode cycle.
    Flushing,
    /// Release was requested while a cycle was in flight; teardown happens
    /// when that cycle completes.
    Releasing,
    /// The job is gone. All operations fail.
    Terminal,
}

/// Status reported by one completed decode cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeStatus {
    /// The cycle made progress.
    Ok,
    /// Transient codec-side congestion. Retry the same unit next cycle.
    TryAgainLater,
    /// The end-of-stream marker has been fed to the codec.
    InputExhausted,
    /// The codec has emitted its last output.
    OutputExhausted,
    /// The decryption key for the current unit is not available. Retry the
    /// same unit once the key arrives; no decoder state is lost.
    MissingKey,
    /// The current unit was cancelled upstream and skipped.
    Aborted,
    /// Codec (re)creation failed. Retrying the next decode attempts it again.
    ConfigurationFailed,
    /// Unrecoverable codec failure. The codec instance must be discarded.
    Fatal(String),
}

/// Result of one decode cycle, delivered through the completion callback.
#[derive(Debug, Clone)]
pub struct DecodeCompletion {
    pub status: DecodeStatus,
    /// The released frame's render time had already passed.
    pub late_frame: bool,
    /// Reported timestamp of the frame released this cycle, if any.
    pub presentation_timestamp: Option<Duration>,
    /// Largest timestamp reported so far on this stream.
    pub max_presentation_timestamp: Option<Duration>,
}

pub type CompletionCallback = Box<dyn FnOnce(DecodeCompletion) + Send>;
pub type PrefetchCallback = Box<dyn FnOnce() + Send>;
pub type ConfigChangedCallback = Box<dyn FnMut(OutputFormat) + Send>;

/// What the decode thread should feed this cycle.
enum TaskInput {
    /// One real access unit, copied out of the chunk store.
    Unit(AccessUnit),
    /// The synthetic end-of-stream fed while draining ahead of a reconfig.
    DrainEos,
    /// Nothing to feed; only pull output.
    PullOnly,
}

/// One decode cycle posted to the decode thread.
///
/// The codec travels inside the task and comes back inside the outcome, so
/// the owner context cannot touch it while the decode thread might.
struct DecodeTask {
    codec: Box<dyn CodecBridge>,
    input: TaskInput,
    needs_flush: bool,
    retained_input_buffer: Option<usize>,
    start_wall_clock: Instant,
    start_presentation_timestamp: Duration,
    preroll_gate: Option<Duration>,
    input_timeout: Duration,
    output_timeout: Duration,
}

/// What one decode cycle produced.
struct CycleOutcome {
    /// The codec handed back by the decode thread. None for cycles that were
    /// resolved on the owner context without touching the codec.
    codec: Option<Box<dyn CodecBridge>>,
    status: DecodeStatus,
    late_frame: bool,
    presentation_timestamp: Option<Duration>,
    format_changed: Option<OutputFormat>,
    consumed_input: bool,
    fed_input_eos: bool,
    reached_output_eos: bool,
    retained_input_buffer: Option<usize>,
    rendered: bool,
    produced_output: bool,
}

impl CycleOutcome {
    fn synthetic(status: DecodeStatus) -> Self {
        Self {
            codec: None,
            status,
            late_frame: false,
            presentation_timestamp: None,
            format_changed: None,
            consumed_input: false,
            fed_input_eos: false,
            reached_output_eos: false,
            retained_input_buffer: None,
            rendered: false,
            produced_output: false,
        }
    }
}

/// Messages sent to the decode thread.
enum WorkerMessage {
    Decode(DecodeTask),
    Shutdown,
}

/// Events delivered back onto the owner context.
enum JobEvent {
    CycleFinished(CycleOutcome),
    ChunkArrived(AccessUnitChunk),
    PrefetchSatisfied,
}

/// Bookkeeping for the one in-flight decode cycle.
struct CycleContext {
    on_complete: CompletionCallback,
    start_wall_clock: Instant,
    start_presentation_timestamp: Duration,
    /// The cycle is waiting for a demuxer pull to land before it can feed.
    stalled_on_prefetch: bool,
}

/// Drives one (demuxer, codec factory) pair through decode cycles.
pub struct DecoderJob {
    config: DecoderJobConfig,
    state: JobState,
    store: DoubleBufferedChunkStore,
    demuxer: Box<dyn ChunkSource>,
    factory: Box<dyn CodecFactory>,

    /// Present while the job is idle; in flight cycles own it via the task.
    codec: Option<Box<dyn CodecBridge>>,
    codec_config: MediaConfig,
    pending_config: Option<MediaConfig>,
    needs_codec_reconfig: bool,
    drm_session: Option<DrmSessionHandle>,

    needs_flush: bool,
    input_eos: bool,
    output_eos: bool,
    drain_requested: bool,
    preroll_gate: Option<Duration>,
    /// Input buffer acquired but not yet consumed, carried across cycles so
    /// a MissingKey or TryAgainLater retry does not leak it.
    pending_input_buffer: Option<usize>,
    queued_any_input: bool,
    decoded_any_output: bool,
    max_reported_timestamp: Option<Duration>,

    stop_requested: Arc<AtomicBool>,
    cycle: Option<CycleContext>,
    prefetch_callback: Option<PrefetchCallback>,
    on_config_changed: ConfigChangedCallback,
    release_pending: bool,
    resource_release_pending: bool,

    task_tx: Option<Sender<WorkerMessage>>,
    event_tx: Sender<JobEvent>,
    event_rx: Receiver<JobEvent>,
    worker: Option<JoinHandle<()>>,

    stats: JobStatistics,
}

impl DecoderJob {
    /// Creates a job bound to one demuxer and one codec factory and starts
    /// its decode thread. The sink is owned by the decode thread; released
    /// buffers reach it without crossing back to the owner context.
    pub fn new(
        config: DecoderJobConfig,
        media_config: MediaConfig,
        demuxer: Box<dyn ChunkSource>,
        factory: Box<dyn CodecFactory>,
        sink: Box<dyn FrameSink>,
        on_config_changed: ConfigChangedCallback,
    ) -> Self {
        let (task_tx, task_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        let stop_requested = Arc::new(AtomicBool::new(false));

        let worker = {
            let event_tx = event_tx.clone();
            let stop = stop_requested.clone();
            thread::Builder::new()
                .name("decoder-job".to_string())
                .spawn(move || decode_thread_main(task_rx, event_tx, sink, stop))
                .expect("Failed to spawn decode thread")
        };

        Self {
            config,
            state: JobState::Idle,
            store: DoubleBufferedChunkStore::new(),
            demuxer,
            factory,
            codec: None,
            codec_config: media_config,
            pending_config: None,
            needs_codec_reconfig: false,
            drm_session: None,
            needs_flush: false,
            input_eos: false,
            output_eos: false,
            drain_requested: false,
            preroll_gate: None,
            pending_input_buffer: None,
            queued_any_input: false,
            decoded_any_output: false,
            max_reported_timestamp: None,
            stop_requested,
            cycle: None,
            prefetch_callback: None,
            on_config_changed,
            release_pending: false,
            resource_release_pending: false,
            task_tx: Some(task_tx),
            event_tx,
            event_rx,
            worker: Some(worker),
            stats: JobStatistics::default(),
        }
    }

    /// Requests compressed data ahead of decoding. Owner context only.
    ///
    /// When data is already staged, `on_ready` fires on the next event pass
    /// rather than re-entrantly. A second prefetch while one is outstanding
    /// replaces the completion callback without issuing a duplicate pull.
    pub fn prefetch(&mut self, on_ready: PrefetchCallback) -> Result<()> {
        self.ensure_not_released()?;
        if self.cycle.is_some() {
            return Err(DecoderJobError::DecodeInFlight);
        }

        self.prefetch_callback = Some(on_ready);
        if self.store.has_current_unit() {
            let _ = self.event_tx.send(JobEvent::PrefetchSatisfied);
            return Ok(());
        }
        if !self.store.prefetch_outstanding() {
            self.state = JobState::Prefetching;
            self.issue_demuxer_pull();
        }
        Ok(())
    }

    /// Begins one decode cycle. Owner context only.
    ///
    /// Returns immediately; the real work runs on the decode thread and
    /// `on_complete` fires exactly once from a later `process_events` call.
    /// Fails synchronously only on a precondition violation or when codec
    /// (re)creation fails and cannot be deferred; the reconfiguration flag
    /// stays set in that case so the next call retries.
    pub fn decode(
        &mut self,
        start_wall_clock: Instant,
        start_presentation_timestamp: Duration,
        on_complete: CompletionCallback,
    ) -> Result<()> {
        self.ensure_not_released()?;
        if self.cycle.is_some() {
            return Err(DecoderJobError::DecodeInFlight);
        }

        self.stop_requested.store(false, Ordering::SeqCst);
        self.cycle = Some(CycleContext {
            on_complete,
            start_wall_clock,
            start_presentation_timestamp,
            stalled_on_prefetch: false,
        });
        self.state = if self.drain_requested {
            JobState::Draining
        } else {
            JobState::Decoding
        };

        match self.continue_cycle() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.cycle = None;
                self.state = JobState::Idle;
                Err(e)
            }
        }
    }

    /// Asks the in-flight cycle to complete with an abort status at its next
    /// safe checkpoint. Does not block and does not preempt codec calls.
    pub fn stop_decode(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    /// Marks that the next decode must flush the codec first and resets the
    /// stream-exhaustion flags. The codec itself is not touched until then,
    /// so a mid-cycle call is safe. Calling this repeatedly before the next
    /// decode has the same effect as calling it once.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_not_released()?;
        self.needs_flush = true;
        self.input_eos = false;
        self.output_eos = false;
        self.drain_requested = false;
        self.pending_config = None;
        self.pending_input_buffer = None;
        self.store.reset();
        self.stats.flushes += 1;
        if self.cycle.is_none() && self.state != JobState::Prefetching {
            self.state = JobState::Flushing;
        }
        debug!("[DECODER_JOB] Flush requested; applied on the next decode");
        Ok(())
    }

    /// Suppresses rendering of output before `timestamp` without suppressing
    /// decode. The gate clears once a frame at or past it is released.
    pub fn begin_prerolling(&mut self, timestamp: Duration) -> Result<()> {
        self.ensure_not_released()?;
        if self.cycle.is_some() {
            return Err(DecoderJobError::DecodeInFlight);
        }
        self.preroll_gate = Some(timestamp);
        Ok(())
    }

    pub fn is_prerolling(&self) -> bool {
        self.preroll_gate.is_some()
    }

    /// Attaches or replaces the decryption context. The codec is recreated
    /// on the next decode so it picks up the new session.
    pub fn set_drm_session(&mut self, handle: DrmSessionHandle) {
        self.drm_session = Some(handle);
        self.needs_codec_reconfig = true;
    }

    /// Destroys the codec instance, immediately when idle, otherwise once
    /// the in-flight cycle completes. The job itself stays usable; the next
    /// decode recreates the codec.
    pub fn release_decoder_resources(&mut self) {
        if self.cycle.is_some() {
            self.resource_release_pending = true;
            return;
        }
        self.release_codec_now();
        if self.drain_requested {
            // The codec that was draining is gone, so the drain is over.
            self.finish_drain();
        }
        if self.state == JobState::Draining {
            self.state = JobState::Idle;
        }
    }

    /// Irreversibly tears the job down. With a cycle in flight the teardown
    /// is deferred to that cycle's completion; the owner observes the
    /// `Terminal` state instead of the job deleting itself.
    pub fn release(&mut self) {
        if self.state == JobState::Terminal {
            return;
        }
        if self.cycle.is_some() {
            self.release_pending = true;
            self.state = JobState::Releasing;
            self.stop_requested.store(true, Ordering::SeqCst);
            return;
        }
        self.enter_terminal();
    }

    /// True once the codec has emitted its last output. Masked while a drain
    /// is in progress: the end of the old codec's stream is an internal
    /// reconfiguration step, not the end of playback.
    pub fn output_reached_end_of_stream(&self) -> bool {
        self.output_eos && !self.drain_requested
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn stats(&self) -> &JobStatistics {
        &self.stats
    }

    /// Drains completed work and fires the corresponding callbacks. Owner
    /// context only. Returns the number of events handled.
    pub fn process_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.event_rx.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        handled
    }

    /// Blocks up to `timeout` for the next event, then drains the rest.
    /// Owner context only.
    pub fn wait_for_events(&mut self, timeout: Duration) -> usize {
        match self.event_rx.recv_timeout(timeout) {
            Ok(event) => {
                self.handle_event(event);
                1 + self.process_events()
            }
            Err(_) => 0,
        }
    }

    // --- Cycle driving ---

    /// Runs the owner-context part of the cycle up to the next suspension
    /// point: posting to the decode thread, or stalling on a prefetch.
    fn continue_cycle(&mut self) -> Result<()> {
        if self.stop_requested.load(Ordering::SeqCst) {
            self.post_synthetic_completion(DecodeStatus::Aborted);
            return Ok(());
        }

        if self.drain_requested {
            let input = if self.input_eos {
                TaskInput::PullOnly
            } else {
                TaskInput::DrainEos
            };
            self.post_decode_task(input);
            return Ok(());
        }

        if self.output_eos {
            self.post_synthetic_completion(DecodeStatus::OutputExhausted);
            return Ok(());
        }

        if self.input_eos {
            self.ensure_codec()?;
            self.post_decode_task(TaskInput::PullOnly);
            return Ok(());
        }

        if !self.store.has_current_unit() {
            // Stall the cycle behind one demuxer round trip.
            self.issue_demuxer_pull();
            if let Some(cycle) = self.cycle.as_mut() {
                cycle.stalled_on_prefetch = true;
            }
            return Ok(());
        }

        let unit = match self.store.current_unit() {
            Some(unit) => unit.clone(),
            None => return Ok(()),
        };

        if unit.is_config_changed {
            return self.handle_config_change();
        }

        if unit.is_aborted {
            self.store.advance_cursor();
            self.stats.aborted_units += 1;
            self.post_synthetic_completion(DecodeStatus::Aborted);
            return Ok(());
        }

        self.ensure_codec()?;
        self.post_decode_task(TaskInput::Unit(unit));
        Ok(())
    }

    /// Handles the current unit being a config-change marker.
    fn handle_config_change(&mut self) -> Result<()> {
        self.stats.config_changes += 1;
        if let Some(config) = self.store.current_chunk_config().cloned() {
            self.pending_config = Some(config);
        }

        let needs_real_reconfig = self
            .pending_config
            .as_ref()
            .is_some_and(|c| *c != self.codec_config);
        let take_cheaply = self.codec.is_none()
            || !needs_real_reconfig
            || (self.config.skip_reconfigure_before_first_output && !self.decoded_any_output);

        if take_cheaply {
            if needs_real_reconfig || self.codec.is_none() {
                self.needs_codec_reconfig = true;
            } else {
                self.pending_config = None;
            }
            self.store.advance_cursor();
            debug!("[DECODER_JOB] Config change taken without a drain");
            self.post_synthetic_completion(DecodeStatus::Ok);
            return Ok(());
        }

        // The codec has produced output, so it may hold buffered frames that
        // must come out before the instance can be discarded.
        self.drain_requested = true;
        self.state = JobState::Draining;
        debug!("[DECODER_JOB] Config change: draining the old codec");
        self.post_decode_task(TaskInput::DrainEos);
        Ok(())
    }

    /// Creates or recreates the codec when needed. Never touches a codec
    /// that is mid-drain.
    fn ensure_codec(&mut self) -> Result<()> {
        if self.drain_requested {
            return Ok(());
        }
        if self.codec.is_some() && !self.needs_codec_reconfig {
            return Ok(());
        }

        self.release_codec_now();
        if let Some(next) = self.pending_config.take() {
            self.codec_config = next;
        }
        match self
            .factory
            .create_codec(&self.codec_config, self.drm_session.as_ref())
        {
            Ok(codec) => {
                self.codec = Some(codec);
                self.needs_codec_reconfig = false;
                // A fresh codec starts clean.
                self.needs_flush = false;
                self.pending_input_buffer = None;
                self.queued_any_input = false;
                self.decoded_any_output = false;
                self.stats.codec_creations += 1;
                debug!("[DECODER_JOB] Codec created for {}", self.codec_config.mime_type);
                Ok(())
            }
            Err(e) => {
                warn!("[DECODER_JOB] Codec creation failed: {e}");
                self.needs_codec_reconfig = true;
                Err(DecoderJobError::CodecCreation(e.to_string()))
            }
        }
    }

    /// Hands the cycle to the decode thread along with the codec.
    fn post_decode_task(&mut self, input: TaskInput) {
        let (start_wall_clock, start_presentation_timestamp) = match self.cycle.as_ref() {
            Some(cycle) => (cycle.start_wall_clock, cycle.start_presentation_timestamp),
            None => return,
        };
        let codec = match self.codec.take() {
            Some(codec) => codec,
            None => {
                self.post_synthetic_completion(DecodeStatus::ConfigurationFailed);
                return;
            }
        };

        let task = DecodeTask {
            codec,
            input,
            needs_flush: std::mem::take(&mut self.needs_flush),
            retained_input_buffer: self.pending_input_buffer.take(),
            start_wall_clock,
            start_presentation_timestamp,
            preroll_gate: self.preroll_gate,
            input_timeout: self.config.input_dequeue_timeout,
            output_timeout: self.config.output_dequeue_timeout,
        };
        if let Some(tx) = &self.task_tx {
            let _ = tx.send(WorkerMessage::Decode(task));
        }
    }

    /// Completes the in-flight cycle on the owner context without a decode
    /// thread round trip. Delivery still goes through the event queue so the
    /// completion callback is never invoked re-entrantly.
    fn post_synthetic_completion(&mut self, status: DecodeStatus) {
        let _ = self
            .event_tx
            .send(JobEvent::CycleFinished(CycleOutcome::synthetic(status)));
    }

    fn issue_demuxer_pull(&mut self) {
        if !self.store.begin_prefetch() {
            return;
        }
        self.stats.prefetch_requests += 1;
        let event_tx = self.event_tx.clone();
        self.demuxer.request_chunk(Box::new(move |chunk| {
            let _ = event_tx.send(JobEvent::ChunkArrived(chunk));
        }));
    }

    // --- Event handling (owner context) ---

    fn handle_event(&mut self, event: JobEvent) {
        match event {
            JobEvent::PrefetchSatisfied => {
                if let Some(on_ready) = self.prefetch_callback.take() {
                    on_ready();
                }
            }
            JobEvent::ChunkArrived(chunk) => self.handle_chunk_arrived(chunk),
            JobEvent::CycleFinished(outcome) => self.finish_cycle(outcome),
        }
    }

    fn handle_chunk_arrived(&mut self, chunk: AccessUnitChunk) {
        if self.state == JobState::Terminal {
            return;
        }
        self.store.deliver_chunk(chunk);
        self.stats.chunks_received += 1;

        if self.state == JobState::Prefetching {
            self.state = JobState::Idle;
        }
        if let Some(on_ready) = self.prefetch_callback.take() {
            on_ready();
        }

        let stalled = self
            .cycle
            .as_ref()
            .is_some_and(|cycle| cycle.stalled_on_prefetch);
        if !stalled {
            return;
        }
        if let Some(cycle) = self.cycle.as_mut() {
            cycle.stalled_on_prefetch = false;
        }

        // "Data just arrived" is a safe checkpoint for cancellation.
        if self.release_pending || self.stop_requested.load(Ordering::SeqCst) {
            self.post_synthetic_completion(DecodeStatus::Aborted);
            return;
        }
        if self.continue_cycle().is_err() {
            // Codec recreation failed while resuming; surface it through the
            // completion callback since there is no synchronous caller.
            self.post_synthetic_completion(DecodeStatus::ConfigurationFailed);
        }
    }

    /// The tail of the decode cycle, run when its outcome lands back on the
    /// owner context.
    fn finish_cycle(&mut self, outcome: CycleOutcome) {
        // Synthetic completions never carried the codec away.
        if let Some(codec) = outcome.codec {
            self.codec = Some(codec);
            self.pending_input_buffer = outcome.retained_input_buffer;
        }

        if outcome.consumed_input {
            self.queued_any_input = true;
        }
        if outcome.fed_input_eos {
            self.input_eos = true;
            self.queued_any_input = true;
        }
        if outcome.reached_output_eos {
            self.output_eos = true;
        }
        if outcome.produced_output && !outcome.reached_output_eos {
            self.decoded_any_output = true;
            self.stats.frames_decoded += 1;
        }

        let mut status = outcome.status;

        if self.drain_requested && outcome.reached_output_eos {
            // The old codec has flushed everything out; recreate on the next
            // cycle and keep going. The caller never sees this as stream end.
            self.finish_drain();
            status = DecodeStatus::Ok;
        } else if outcome.consumed_input && !self.input_eos {
            self.store.advance_cursor();
        }

        if let Some(format) = outcome.format_changed {
            (self.on_config_changed)(format);
        }

        if let Some(timestamp) = outcome.presentation_timestamp {
            self.max_reported_timestamp =
                Some(self.max_reported_timestamp.map_or(timestamp, |m| m.max(timestamp)));
            if self.preroll_gate.is_some_and(|gate| timestamp >= gate) {
                self.preroll_gate = None;
            }
        }

        if self.resource_release_pending {
            self.resource_release_pending = false;
            self.release_codec_now();
            if self.drain_requested {
                self.finish_drain();
            }
        }

        self.stats.decode_cycles += 1;
        match status {
            DecodeStatus::MissingKey => self.stats.missing_key_stalls += 1,
            DecodeStatus::TryAgainLater => self.stats.try_again_stalls += 1,
            _ => {}
        }
        if outcome.rendered {
            self.stats.frames_rendered += 1;
            if outcome.late_frame {
                self.stats.late_frames += 1;
            }
        }

        let completion = DecodeCompletion {
            status,
            late_frame: outcome.late_frame,
            presentation_timestamp: outcome.presentation_timestamp,
            max_presentation_timestamp: self.max_reported_timestamp,
        };

        let cycle = self.cycle.take();

        if self.release_pending {
            self.enter_terminal();
        } else {
            self.state = if self.drain_requested {
                JobState::Draining
            } else if self.needs_flush {
                JobState::Flushing
            } else {
                JobState::Idle
            };
        }

        if let Some(cycle) = cycle {
            (cycle.on_complete)(completion);
        }
    }

    // --- Teardown helpers ---

    fn finish_drain(&mut self) {
        if !self.drain_requested {
            return;
        }
        self.drain_requested = false;
        self.release_codec_now();
        self.needs_codec_reconfig = true;
        self.input_eos = false;
        self.output_eos = false;
        self.pending_input_buffer = None;
        // Step past the config-change marker the drain was triggered by.
        self.store.advance_cursor();
        self.stats.drains_completed += 1;
        debug!("[DECODER_JOB] Drain complete; the codec will be recreated");
    }

    fn release_codec_now(&mut self) {
        if self.codec.take().is_some() {
            self.stats.codec_releases += 1;
            debug!("[DECODER_JOB] Codec released");
        }
    }

    fn enter_terminal(&mut self) {
        self.release_pending = false;
        self.release_codec_now();
        self.prefetch_callback = None;
        self.state = JobState::Terminal;
        self.shutdown_worker();
    }

    fn shutdown_worker(&mut self) {
        if let Some(tx) = self.task_tx.take() {
            let _ = tx.send(WorkerMessage::Shutdown);
        }
        if let Some(handle) = self.worker.take() {
            handle.join().expect("Decode thread failed to join");
        }
    }

    fn ensure_not_released(&self) -> Result<()> {
        if self.state == JobState::Terminal {
            return Err(DecoderJobError::Released);
        }
        Ok(())
    }
}

impl Drop for DecoderJob {
    fn drop(&mut self) {
        self.shutdown_worker();
    }
}

// --- Decode thread ---

fn decode_thread_main(
    task_rx: Receiver<WorkerMessage>,
    event_tx: Sender<JobEvent>,
    mut sink: Box<dyn FrameSink>,
    stop: Arc<AtomicBool>,
) {
    while let Ok(message) = task_rx.recv() {
        match message {
            WorkerMessage::Decode(task) => {
                let outcome = run_decode_cycle(task, sink.as_mut(), &stop);
                if event_tx.send(JobEvent::CycleFinished(outcome)).is_err() {
                    break;
                }
            }
            WorkerMessage::Shutdown => break,
        }
    }
}

/// The decode-context half of one cycle: flush if needed, feed one unit,
/// pull one output, schedule its release.
fn run_decode_cycle(
    task: DecodeTask,
    sink: &mut dyn FrameSink,
    stop: &AtomicBool,
) -> CycleOutcome {
    let DecodeTask {
        mut codec,
        input,
        needs_flush,
        retained_input_buffer,
        start_wall_clock,
        start_presentation_timestamp,
        preroll_gate,
        input_timeout,
        output_timeout,
    } = task;

    let mut outcome = CycleOutcome::synthetic(DecodeStatus::Ok);
    outcome.retained_input_buffer = retained_input_buffer;

    let finish = |mut outcome: CycleOutcome, codec: Box<dyn CodecBridge>| {
        outcome.codec = Some(codec);
        outcome
    };

    if stop.load(Ordering::SeqCst) {
        outcome.status = DecodeStatus::Aborted;
        return finish(outcome, codec);
    }

    if needs_flush {
        if let Err(e) = codec.flush() {
            outcome.status = DecodeStatus::Fatal(e.to_string());
            return finish(outcome, codec);
        }
        // Whatever buffer was acquired before the flush is void now.
        outcome.retained_input_buffer = None;
    }

    enum InputKind<'a> {
        Eos,
        Data(&'a AccessUnit),
        None,
    }
    let kind = match &input {
        TaskInput::PullOnly => InputKind::None,
        TaskInput::DrainEos => InputKind::Eos,
        TaskInput::Unit(unit) if unit.is_end_of_stream => InputKind::Eos,
        TaskInput::Unit(unit) => InputKind::Data(unit),
    };
    let pull_only = matches!(kind, InputKind::None);

    if !pull_only {
        let index = match outcome.retained_input_buffer.take() {
            Some(index) => index,
            None => match codec.dequeue_input_buffer(input_timeout) {
                DequeueInputResult::Index(index) => index,
                DequeueInputResult::TryAgainLater => {
                    outcome.status = DecodeStatus::TryAgainLater;
                    return finish(outcome, codec);
                }
                DequeueInputResult::Error(e) => {
                    outcome.status = DecodeStatus::Fatal(e);
                    return finish(outcome, codec);
                }
            },
        };

        let status = match &kind {
            InputKind::Eos => codec.queue_eos(index),
            InputKind::Data(unit) => {
                codec.queue_input(index, &unit.payload, unit.timestamp, unit.crypto.as_ref())
            }
            InputKind::None => QueueInputStatus::Ok,
        };
        match status {
            QueueInputStatus::Ok => match kind {
                InputKind::Eos => outcome.fed_input_eos = true,
                InputKind::Data(_) => outcome.consumed_input = true,
                InputKind::None => {}
            },
            QueueInputStatus::InputEos => outcome.fed_input_eos = true,
            QueueInputStatus::TryAgainLater => {
                // Keep the acquired index; re-acquiring would leak it.
                outcome.retained_input_buffer = Some(index);
                outcome.status = DecodeStatus::TryAgainLater;
                return finish(outcome, codec);
            }
            QueueInputStatus::MissingKey => {
                outcome.retained_input_buffer = Some(index);
                outcome.status = DecodeStatus::MissingKey;
                return finish(outcome, codec);
            }
            QueueInputStatus::Error(e) => {
                outcome.status = DecodeStatus::Fatal(e);
                return finish(outcome, codec);
            }
        }
    }

    // Pull decoded output. Only format changes keep this loop going; both
    // TryAgainLater and errors return immediately.
    loop {
        match codec.dequeue_output(output_timeout) {
            DequeueOutputResult::FormatChanged(format) => {
                outcome.format_changed = Some(format);
            }
            DequeueOutputResult::TryAgainLater => break,
            DequeueOutputResult::Error(e) => {
                outcome.status = DecodeStatus::Fatal(e);
                return finish(outcome, codec);
            }
            DequeueOutputResult::Frame(info) => {
                outcome.produced_output = true;
                if info.is_end_of_stream {
                    outcome.reached_output_eos = true;
                    sink.release_buffer(ReleasedBuffer {
                        index: info.index,
                        offset: info.offset,
                        size: info.size,
                        presentation_timestamp: info.presentation_timestamp,
                        should_render: false,
                    });
                } else {
                    let decision = compute_render_decision(
                        start_wall_clock,
                        start_presentation_timestamp,
                        info.presentation_timestamp,
                        Instant::now(),
                        preroll_gate,
                    );
                    let mut should_render = decision.should_render;
                    if !decision.delay.is_zero() {
                        thread::sleep(decision.delay);
                        // The job may have been stopped, flushed or released
                        // while the buffer was held back.
                        if stop.load(Ordering::SeqCst) {
                            should_render = false;
                        }
                    }
                    sink.release_buffer(ReleasedBuffer {
                        index: info.index,
                        offset: info.offset,
                        size: info.size,
                        presentation_timestamp: decision.reported_timestamp,
                        should_render,
                    });
                    outcome.presentation_timestamp = Some(decision.reported_timestamp);
                    outcome.late_frame = decision.late;
                    outcome.rendered = should_render;
                }
                break;
            }
        }
    }

    outcome.status = if outcome.reached_output_eos {
        DecodeStatus::OutputExhausted
    } else if outcome.presentation_timestamp.is_some() || outcome.consumed_input {
        DecodeStatus::Ok
    } else if outcome.fed_input_eos || pull_only {
        DecodeStatus::InputExhausted
    } else {
        DecodeStatus::Ok
    };
    finish(outcome, codec)
}
