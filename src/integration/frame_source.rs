//! Capture-side interface.

use std::fmt;

use crossbeam_channel::{Receiver, TryRecvError};

use crate::tracker::Frame;

/// A producer of grayscale frames, polled by the capture thread.
///
/// Implement this trait to connect a camera, a video decoder or a test
/// fixture to the pipeline.
///
/// # Example
///
/// ```ignore
/// use recipe_track::{Frame, FrameSource};
///
/// struct MyCamera {
///     // Device handle here
/// }
///
/// impl FrameSource for MyCamera {
///     type Error = std::io::Error;
///
///     fn next_frame(&mut self) -> Result<Option<Frame>, Self::Error> {
///         // Grab, convert to gray and return
///         Ok(None)
///     }
/// }
/// ```
pub trait FrameSource {
    /// Device or decoding failure. The capture thread reports it and retries.
    type Error: fmt::Display;

    /// The next frame, or `Ok(None)` when none is available yet.
    fn next_frame(&mut self) -> Result<Option<Frame>, Self::Error>;
}

/// Frames pushed by another thread through a channel.
pub struct ChannelSource {
    rx: Receiver<Frame>,
}

impl ChannelSource {
    pub fn new(rx: Receiver<Frame>) -> Self {
        Self { rx }
    }
}

/// Every sender of a [`ChannelSource`] is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("frame channel disconnected")]
pub struct SourceDisconnected;

impl FrameSource for ChannelSource {
    type Error = SourceDisconnected;

    fn next_frame(&mut self) -> Result<Option<Frame>, Self::Error> {
        match self.rx.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(SourceDisconnected),
        }
    }
}
