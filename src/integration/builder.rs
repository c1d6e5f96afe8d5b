//! Builder wiring a [`FrameSource`] and a [`RecipeStore`] into a running
//! [`TrackingPipeline`].

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::Settings;
use crate::error::{ConfigError, PipelineError};
use crate::recipe::{Recipe, RecipeStore};
use crate::tracker::{Localizer, ReacquireHandle, TrackerConfig};

use super::FrameSource;
use super::pipeline::{CaptureLoop, EventSink, ProcessingLoop, TrackingPipeline};
use super::queue::{BoundedQueue, StatsCounters};

/// Builds the detector and tracker for a new session, in that order.
pub type LocalizerFactory = Arc<
    dyn Fn(&Arc<Recipe>, &TrackerConfig) -> (Box<dyn Localizer + Send>, Box<dyn Localizer + Send>)
        + Send
        + Sync,
>;

/// Queue sizes and polling intervals of the pipeline threads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Frames held between capture and processing
    pub frame_queue_capacity: usize,
    /// Events held for the presentation consumer
    pub event_queue_capacity: usize,
    /// Sleep when no frame or command is pending
    pub idle_poll_ms: u64,
    /// Wait before polling a failed frame source again
    pub retry_backoff_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_queue_capacity: 2,
            event_queue_capacity: 64,
            idle_poll_ms: 5,
            retry_backoff_ms: 500,
        }
    }
}

impl PipelineConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_queue_capacity == 0 {
            return Err(ConfigError::invalid(
                "pipeline.frame_queue_capacity",
                "must be at least 1",
            ));
        }
        if self.event_queue_capacity == 0 {
            return Err(ConfigError::invalid(
                "pipeline.event_queue_capacity",
                "must be at least 1",
            ));
        }
        if self.idle_poll_ms == 0 {
            return Err(ConfigError::invalid("pipeline.idle_poll_ms", "must be at least 1"));
        }
        Ok(())
    }
}

/// Consuming builder for [`TrackingPipeline`].
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use recipe_track::{PipelineBuilder, RecipeStore, RegistrationConfig};
/// use recipe_track::integration::ChannelSource;
///
/// let store = Arc::new(RecipeStore::open("recipes", RegistrationConfig::default())?);
/// let (tx, rx) = crossbeam_channel::unbounded();
/// let pipeline = PipelineBuilder::new()
///     .store(store)
///     .frame_queue_capacity(2)
///     .build(ChannelSource::new(rx))?;
/// ```
#[derive(Default)]
pub struct PipelineBuilder {
    config: PipelineConfig,
    tracker: TrackerConfig,
    store: Option<Arc<RecipeStore>>,
    localizers: Option<LocalizerFactory>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the pipeline and tracker sections of `settings`.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new()
            .config(settings.pipeline.clone())
            .tracker_config(settings.tracker.clone())
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Thresholds applied to every session started on the pipeline.
    pub fn tracker_config(mut self, tracker: TrackerConfig) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn store(mut self, store: Arc<RecipeStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn frame_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.frame_queue_capacity = capacity;
        self
    }

    pub fn event_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.event_queue_capacity = capacity;
        self
    }

    /// Replace the default feature matcher and fast tracker.
    pub fn localizers(mut self, factory: LocalizerFactory) -> Self {
        self.localizers = Some(factory);
        self
    }

    /// Validate the configuration and spawn the capture and processing
    /// threads. No session runs until [`TrackingPipeline::start`].
    ///
    /// # Arguments
    /// * `source` - Frame producer polled by the capture thread
    ///
    /// # Returns
    /// The running pipeline, or a configuration error (including a missing
    /// store) or a thread spawn failure.
    pub fn build<S>(self, source: S) -> Result<TrackingPipeline, PipelineError>
    where
        S: FrameSource + Send + 'static,
    {
        self.config.validate()?;
        self.tracker.validate()?;
        let store = self
            .store
            .ok_or_else(|| ConfigError::invalid("pipeline.store", "a recipe store is required"))?;

        let stats = Arc::new(StatsCounters::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let reacquire = ReacquireHandle::default();
        let frames = BoundedQueue::new(self.config.frame_queue_capacity);
        let event_queue = BoundedQueue::new(self.config.event_queue_capacity);
        let events_rx = event_queue.receiver();
        let sink = EventSink::new(event_queue, stats.clone());
        let (command_tx, command_rx) = crossbeam_channel::unbounded();

        let capture = CaptureLoop {
            source,
            frames: frames.clone(),
            events: sink.clone(),
            stats: stats.clone(),
            shutdown: shutdown.clone(),
            idle_poll: self.config.idle_poll(),
            retry_backoff: self.config.retry_backoff(),
        };
        let processing = ProcessingLoop {
            commands: command_rx,
            frames,
            events: sink,
            stats: stats.clone(),
            shutdown: shutdown.clone(),
            reacquire: reacquire.clone(),
            config: self.tracker,
            localizers: self.localizers,
            idle_poll: self.config.idle_poll(),
        };

        let processing = thread::Builder::new()
            .name("recipe-track-processing".into())
            .spawn(move || processing.run())
            .map_err(|source| PipelineError::Spawn {
                name: "processing",
                source,
            })?;
        let capture = match thread::Builder::new()
            .name("recipe-track-capture".into())
            .spawn(move || capture.run())
        {
            Ok(handle) => handle,
            Err(source) => {
                // The processing thread exits once the command sender is dropped.
                drop(command_tx);
                let _ = processing.join();
                return Err(PipelineError::Spawn {
                    name: "capture",
                    source,
                });
            }
        };

        info!(
            frame_queue = self.config.frame_queue_capacity,
            event_queue = self.config.event_queue_capacity,
            "tracking pipeline running"
        );
        Ok(TrackingPipeline::from_parts(
            store, command_tx, events_rx, reacquire, shutdown, stats, capture, processing,
        ))
    }
}
