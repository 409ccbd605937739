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

//! Decides when a decoded buffer is released for rendering, relative to a
//! wall-clock start reference and the target presentation position.

use std::time::{Duration, Instant};

/// The outcome of scheduling one decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderDecision {
    /// The frame is eligible for rendering (at or past the preroll gate).
    pub should_render: bool,
    /// How long to hold the buffer before releasing it. Zero releases now.
    pub delay: Duration,
    /// The frame's render time had already passed when it became ready.
    pub late: bool,
    /// Presentation timestamp to report downstream, clamped so it is never
    /// earlier than the start position of the current playback run.
    pub reported_timestamp: Duration,
}

/// Computes whether to release a decoded buffer now, late, or after a delay.
///
/// The target media position at `now` is
/// `(now - start_wall_clock) + start_presentation_timestamp`; the time to
/// render is the frame timestamp minus that position. A positive value means
/// the frame is early and its release must be delayed; zero or negative means
/// release immediately, and strictly negative marks the frame late.
///
/// Frames before `preroll_gate` are released immediately and unrendered:
/// preroll suppresses presentation, not decoding.
pub fn compute_render_decision(
    start_wall_clock: Instant,
    start_presentation_timestamp: Duration,
    frame_timestamp: Duration,
    now: Instant,
    preroll_gate: Option<Duration>,
) -> RenderDecision {
    let reported_timestamp = frame_timestamp.max(start_presentation_timestamp);

    if let Some(gate) = preroll_gate {
        if frame_timestamp < gate {
            return RenderDecision {
                should_render: false,
                delay: Duration::ZERO,
                late: false,
                reported_timestamp,
            };
        }
    }

    let target_position = now.saturating_duration_since(start_wall_clock)
        + start_presentation_timestamp;

    if frame_timestamp > target_position {
        RenderDecision {
            should_render: true,
            delay: frame_timestamp - target_position,
            late: false,
            reported_timestamp,
        }
    } else {
        RenderDecision {
            should_render: true,
            delay: Duration::ZERO,
            late: frame_timestamp < target_position,
            reported_timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn early_frame_is_delayed_and_not_late() {
        let t0 = Instant::now();
        let decision =
            compute_render_decision(t0, Duration::ZERO, ms(50), t0 + ms(10), None);
        assert!(decision.should_render);
        assert_eq!(decision.delay, ms(40));
        assert!(!decision.late);
    }

    #[test]
    fn past_due_frame_is_released_immediately_and_late() {
        let t0 = Instant::now();
        let decision =
            compute_render_decision(t0, Duration::ZERO, ms(50), t0 + ms(80), None);
        assert!(decision.should_render);
        assert_eq!(decision.delay, Duration::ZERO);
        assert!(decision.late);
        assert_eq!(decision.reported_timestamp, ms(50));
    }

    #[test]
    fn exactly_on_time_is_not_late() {
        let t0 = Instant::now();
        let decision =
            compute_render_decision(t0, Duration::ZERO, ms(50), t0 + ms(50), None);
        assert_eq!(decision.delay, Duration::ZERO);
        assert!(!decision.late);
    }

    #[test]
    fn reported_timestamp_never_precedes_the_start_position() {
        let t0 = Instant::now();
        // Playback started at 100ms into the stream; a stale 40ms frame
        // shows up late. Downstream clocks must not see time move backwards.
        let decision =
            compute_render_decision(t0, ms(100), ms(40), t0 + ms(10), None);
        assert!(decision.late);
        assert_eq!(decision.reported_timestamp, ms(100));
    }

    #[test]
    fn start_offset_shifts_the_target_position() {
        let t0 = Instant::now();
        // 10ms of wall clock from a 100ms start position targets 110ms.
        let decision =
            compute_render_decision(t0, ms(100), ms(150), t0 + ms(10), None);
        assert_eq!(decision.delay, ms(40));
    }

    #[test]
    fn preroll_gate_suppresses_rendering_without_delay() {
        let t0 = Instant::now();
        let decision =
            compute_render_decision(t0, Duration::ZERO, ms(50), t0, Some(ms(100)));
        assert!(!decision.should_render);
        assert_eq!(decision.delay, Duration::ZERO);
        assert!(!decision.late);
    }

    #[test]
    fn frame_at_the_gate_is_renderable() {
        let t0 = Instant::now();
        let decision =
            compute_render_decision(t0, Duration::ZERO, ms(100), t0, Some(ms(100)));
        assert!(decision.should_render);
    }
}
