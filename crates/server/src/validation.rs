//! Command validation for the streaming server.
//!
//! Rules:
//! - request_frame outside `[0, n_frames)`: DROP
//! - request_frame / stream with no trajectory loaded: DROP
//! - fps not finite or `<= 0`: REJECT
//! - stride `<= 0`: REJECT
//! - negative start: REJECT
//! - end past the last frame: CLAMP
//! - start `>=` end after clamping: EMPTY (playback of zero frames)
//!
//! Dropped and rejected commands leave the session untouched.

use std::time::Duration;

use megane_wire::ClientCommand;

use crate::DEFAULT_FPS;
use crate::session::Playback;

/// Values used for omitted `stream` fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackDefaults {
    pub fps: f64,
}

impl Default for PlaybackDefaults {
    fn default() -> Self {
        Self { fps: DEFAULT_FPS }
    }
}

/// Result of validating one command against the loaded trajectory.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// Send this one frame; playback state unchanged.
    SendFrame(u32),
    /// Replace any playback with this one.
    StartPlayback(Playback),
    /// Halt playback.
    Stop,
    /// Dropped: frame index outside the trajectory.
    DroppedOutOfRange { frame: i64, n_frames: usize },
    /// Dropped: no trajectory is loaded.
    DroppedNoTrajectory,
    /// Rejected: fps not finite or not positive.
    RejectedFps(f64),
    /// Rejected: stride not positive.
    RejectedStride(i64),
    /// Rejected: negative start.
    RejectedRange { start: i64, end: i64 },
    /// Accepted but the clamped range holds no frames.
    EmptyRange { start: u32, end: u32 },
}

impl CommandOutcome {
    /// True if the command changes what the connection sends.
    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            Self::SendFrame(_) | Self::StartPlayback(_) | Self::Stop | Self::EmptyRange { .. }
        )
    }
}

/// Validate a command.
///
/// # Arguments
/// * `command` - The parsed client command
/// * `n_frames` - Frame count of the loaded trajectory, `None` if there is none
/// * `defaults` - Values for omitted `stream` fields
pub fn validate_command(
    command: &ClientCommand,
    n_frames: Option<usize>,
    defaults: &PlaybackDefaults,
) -> CommandOutcome {
    match command {
        ClientCommand::Stop => CommandOutcome::Stop,
        ClientCommand::RequestFrame { frame } => {
            let Some(n_frames) = n_frames else {
                return CommandOutcome::DroppedNoTrajectory;
            };
            match u32::try_from(*frame) {
                Ok(index) if (index as usize) < n_frames => CommandOutcome::SendFrame(index),
                _ => CommandOutcome::DroppedOutOfRange {
                    frame: *frame,
                    n_frames,
                },
            }
        }
        ClientCommand::Stream {
            start,
            end,
            stride,
            fps,
        } => {
            let Some(n_frames) = n_frames else {
                return CommandOutcome::DroppedNoTrajectory;
            };
            validate_stream(*start, *end, *stride, *fps, n_frames, defaults)
        }
    }
}

fn validate_stream(
    start: Option<i64>,
    end: Option<i64>,
    stride: Option<i64>,
    fps: Option<f64>,
    n_frames: usize,
    defaults: &PlaybackDefaults,
) -> CommandOutcome {
    // Frame ids are u32 on the wire.
    let frame_count = u32::try_from(n_frames).unwrap_or(u32::MAX);

    let fps = fps.unwrap_or(defaults.fps);
    if !fps.is_finite() || fps <= 0.0 {
        return CommandOutcome::RejectedFps(fps);
    }
    let Ok(interval) = Duration::try_from_secs_f64(1.0 / fps) else {
        return CommandOutcome::RejectedFps(fps);
    };

    let stride = stride.unwrap_or(1);
    let Ok(stride_u32) = u32::try_from(stride) else {
        return CommandOutcome::RejectedStride(stride);
    };
    if stride_u32 == 0 {
        return CommandOutcome::RejectedStride(stride);
    }

    let raw_start = start.unwrap_or(0);
    let raw_end = end.unwrap_or(i64::from(frame_count));
    if raw_start < 0 {
        return CommandOutcome::RejectedRange {
            start: raw_start,
            end: raw_end,
        };
    }

    let start = u32::try_from(raw_start).unwrap_or(u32::MAX);
    let end = raw_end.clamp(0, i64::from(frame_count)) as u32;
    if start >= end {
        return CommandOutcome::EmptyRange { start, end };
    }

    CommandOutcome::StartPlayback(Playback {
        start,
        end,
        stride: stride_u32,
        fps,
        interval,
    })
}
