//! Per-connection playback state.
//!
//! A `StreamingSession` is either idle or playing one frame range. It holds
//! no I/O: the connection task asks it which frame is due, sends that frame,
//! then reports the send so the next deadline can be scheduled.

use std::time::Duration;

use megane_wire::ClientCommand;
use tokio::time::Instant;

use crate::validation::{CommandOutcome, PlaybackDefaults, validate_command};

/// A validated playback request over `[start, end)` every `stride` frames.
#[derive(Debug, Clone, PartialEq)]
pub struct Playback {
    pub start: u32,
    pub end: u32,
    pub stride: u32,
    pub fps: f64,
    /// Pause after each frame send, `1 / fps`.
    pub interval: Duration,
}

impl Playback {
    /// True if the range yields no frames.
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Frame indices this playback visits, in order.
    pub fn frames(&self) -> impl Iterator<Item = u32> {
        (self.start..self.end).step_by(self.stride.max(1) as usize)
    }
}

/// Playback state of one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackState {
    Idle,
    Playing {
        playback: Playback,
        /// Next frame to send.
        cursor: u32,
        /// When `cursor` may be sent.
        due: Instant,
    },
}

/// Playback state machine for one connection.
#[derive(Debug, Clone)]
pub struct StreamingSession {
    state: PlaybackState,
}

impl Default for StreamingSession {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingSession {
    pub fn new() -> Self {
        Self {
            state: PlaybackState::Idle,
        }
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn is_playing(&self) -> bool {
        matches!(self.state, PlaybackState::Playing { .. })
    }

    /// Start `playback`, replacing whatever was playing. The first frame is
    /// due immediately. An empty range leaves the session idle.
    pub fn start(&mut self, playback: Playback, now: Instant) {
        self.state = if playback.is_empty() {
            PlaybackState::Idle
        } else {
            PlaybackState::Playing {
                cursor: playback.start,
                playback,
                due: now,
            }
        };
    }

    /// Validate `command` and apply its effect on playback.
    ///
    /// The returned outcome tells the caller what to send: only
    /// [`CommandOutcome::SendFrame`] needs action outside the session.
    pub fn apply(
        &mut self,
        command: &ClientCommand,
        n_frames: Option<usize>,
        defaults: &PlaybackDefaults,
        now: Instant,
    ) -> CommandOutcome {
        let outcome = validate_command(command, n_frames, defaults);
        match &outcome {
            CommandOutcome::StartPlayback(playback) => self.start(playback.clone(), now),
            CommandOutcome::Stop | CommandOutcome::EmptyRange { .. } => self.reset(),
            _ => {}
        }
        outcome
    }

    pub fn reset(&mut self) {
        self.state = PlaybackState::Idle;
    }

    /// Go idle. Returns whether a playback was interrupted.
    pub fn stop(&mut self) -> bool {
        let was_playing = self.is_playing();
        self.state = PlaybackState::Idle;
        was_playing
    }

    /// Deadline of the next frame, if playing.
    pub fn next_due(&self) -> Option<Instant> {
        match &self.state {
            PlaybackState::Playing { due, .. } => Some(*due),
            PlaybackState::Idle => None,
        }
    }

    /// The frame to send now, if one is due.
    pub fn due_frame(&self, now: Instant) -> Option<u32> {
        match &self.state {
            PlaybackState::Playing { cursor, due, .. } if *due <= now => Some(*cursor),
            _ => None,
        }
    }

    /// Record that the due frame was sent at `now`: advance by the stride and
    /// schedule the next frame one interval later, or go idle once the range
    /// is exhausted.
    pub fn frame_sent(&mut self, now: Instant) {
        let PlaybackState::Playing {
            playback, cursor, ..
        } = &self.state
        else {
            return;
        };

        let next = cursor.saturating_add(playback.stride);
        if *cursor == u32::MAX || next >= playback.end {
            self.state = PlaybackState::Idle;
            return;
        }

        let due = now + playback.interval;
        let playback = playback.clone();
        self.state = PlaybackState::Playing {
            playback,
            cursor: next,
            due,
        };
    }
}
