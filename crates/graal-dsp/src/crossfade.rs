//! IR update state machine
//!
//! ```text
//! Over --request--> Pending --period start--> Stream2InProgress
//!   ^                                                |
//!   |                                          period start
//!   +---- next block ---- Stream1InProgress <--------+
//! ```
//!
//! A first upload (nothing to fade from) goes straight to
//! `Stream1InProgress`. Transitions are evaluated once per block, before
//! any channel is processed.

use graal_core::{GraalError, GraalResult, Sample};

/// Engine-wide update state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XfadeState {
    /// No update in flight
    #[default]
    Over,
    /// Update staged, waiting for the next coarse period
    Pending,
    /// Coarse stream sweeping old and new filter side by side
    Stream2InProgress,
    /// One block of fine-stream dual processing and output blending
    Stream1InProgress,
}

/// What a channel fades from while an update is in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FadeKind {
    /// Not part of the update
    #[default]
    Hold,
    /// Channel had no filter before
    FromSilence,
    /// Channel had a filter before
    FromPrevious,
}

/// Side effect of a state change that the scheduler has to carry out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    /// Staged filters become active, active ones become previous
    Swap,
    /// Fade finished: drop previous filters
    Finished,
}

#[derive(Debug, Clone)]
pub struct Crossfade {
    state: XfadeState,
    ratio: u64,
}

impl Crossfade {
    pub fn new(ratio: usize) -> Self {
        Self {
            state: XfadeState::Over,
            ratio: ratio.max(1) as u64,
        }
    }

    #[inline]
    pub fn state(&self) -> XfadeState {
        self.state
    }

    #[inline]
    pub fn is_over(&self) -> bool {
        self.state == XfadeState::Over
    }

    /// Advance the machine for block `run`
    pub fn evaluate(&mut self, run: u64) -> Transition {
        if self.state == XfadeState::Stream1InProgress {
            self.set(XfadeState::Over);
            return Transition::Finished;
        }
        if run % self.ratio == 0 {
            match self.state {
                XfadeState::Stream2InProgress => self.set(XfadeState::Stream1InProgress),
                XfadeState::Pending => {
                    self.set(XfadeState::Stream2InProgress);
                    return Transition::Swap;
                }
                _ => {}
            }
        }
        Transition::None
    }

    /// Accept an update. Only possible while no other update is in flight.
    pub fn request(&mut self, first_upload: bool) -> GraalResult<Transition> {
        if !self.is_over() {
            log::warn!("IR update rejected: {:?} in progress", self.state);
            return Err(GraalError::UpdateInFlight);
        }
        if first_upload {
            self.set(XfadeState::Stream1InProgress);
            Ok(Transition::Swap)
        } else {
            self.set(XfadeState::Pending);
            Ok(Transition::None)
        }
    }

    /// Drop any update in flight
    pub fn reset(&mut self) {
        self.state = XfadeState::Over;
    }

    fn set(&mut self, next: XfadeState) {
        log::debug!("Crossfade {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

/// Linear blend of `old` into `new` over the first `fade_len` samples;
/// the rest of the block is fully `new`.
pub fn blend(out: &mut [Sample], old: &[Sample], new: &[Sample], fade_len: usize) {
    debug_assert_eq!(out.len(), old.len());
    debug_assert_eq!(out.len(), new.len());
    let fade_len = fade_len.clamp(1, out.len().max(1));
    let step = 1.0 / fade_len as Sample;

    for (i, ((o, &a), &b)) in out.iter_mut().zip(old).zip(new).enumerate() {
        *o = if i < fade_len {
            let w = (i + 1) as Sample * step;
            a + (b - a) * w
        } else {
            b
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_full_cycle_two_stream() {
        let mut xfade = Crossfade::new(4);
        assert_eq!(xfade.request(false), Ok(Transition::None));
        assert_eq!(xfade.state(), XfadeState::Pending);

        // Waits for the period start
        for run in 1..4 {
            assert_eq!(xfade.evaluate(run), Transition::None);
            assert_eq!(xfade.state(), XfadeState::Pending);
        }
        assert_eq!(xfade.evaluate(4), Transition::Swap);
        assert_eq!(xfade.state(), XfadeState::Stream2InProgress);

        for run in 5..8 {
            xfade.evaluate(run);
            assert_eq!(xfade.state(), XfadeState::Stream2InProgress);
        }
        xfade.evaluate(8);
        assert_eq!(xfade.state(), XfadeState::Stream1InProgress);
        assert_eq!(xfade.evaluate(9), Transition::Finished);
        assert!(xfade.is_over());
    }

    #[test]
    fn test_uniform_cycle() {
        let mut xfade = Crossfade::new(1);
        xfade.request(false).unwrap();
        assert_eq!(xfade.evaluate(1), Transition::Swap);
        assert_eq!(xfade.evaluate(2), Transition::None);
        assert_eq!(xfade.state(), XfadeState::Stream1InProgress);
        assert_eq!(xfade.evaluate(3), Transition::Finished);
        assert_eq!(xfade.state(), XfadeState::Over);
    }

    #[test]
    fn test_first_upload_skips_to_stream1() {
        let mut xfade = Crossfade::new(8);
        assert_eq!(xfade.request(true), Ok(Transition::Swap));
        assert_eq!(xfade.state(), XfadeState::Stream1InProgress);
        assert_eq!(xfade.evaluate(3), Transition::Finished);
    }

    #[test]
    fn test_request_in_flight_rejected() {
        let mut xfade = Crossfade::new(2);
        xfade.request(false).unwrap();
        assert_eq!(xfade.request(false), Err(GraalError::UpdateInFlight));
        assert_eq!(xfade.request(true), Err(GraalError::UpdateInFlight));
        xfade.reset();
        assert!(xfade.request(false).is_ok());
    }

    #[test]
    fn test_blend_ramp() {
        let old = [0.0; 8];
        let new = [1.0; 8];
        let mut out = [0.0; 8];
        blend(&mut out, &old, &new, 4);
        assert_relative_eq!(out[0], 0.25);
        assert_relative_eq!(out[1], 0.5);
        assert_relative_eq!(out[3], 1.0);
        assert_eq!(&out[4..], &[1.0; 4]);
    }
}
