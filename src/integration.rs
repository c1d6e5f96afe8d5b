//! Threaded pipeline connecting a frame source to the tracking state machine.
//!
//! A capture thread polls a [`FrameSource`] into a small drop-oldest queue; a
//! processing thread applies session commands and feeds frames to the
//! [`TrackingStateMachine`](crate::tracker::TrackingStateMachine); results
//! and status changes are delivered as [`PipelineEvent`]s.

mod builder;
mod frame_source;
mod pipeline;
mod queue;

pub use builder::{LocalizerFactory, PipelineBuilder, PipelineConfig};
pub use frame_source::{ChannelSource, FrameSource, SourceDisconnected};
pub use pipeline::{PipelineEvent, SourceStatus, TrackingPipeline};
pub use queue::{BoundedQueue, DropReason, PipelineStats};
