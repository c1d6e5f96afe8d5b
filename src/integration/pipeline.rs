//! Threaded capture and processing around a [`TrackingStateMachine`].
//!
//! ```text
//! FrameSource -> [capture] -> BoundedQueue<Frame> -> [processing]
//!                                                         |    ^
//!            consumer <- BoundedQueue<PipelineEvent> <----+    |
//!                                  commands (start / stop) + reacquire flag
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Select, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::recipe::{Recipe, RecipeId, RecipeStore};
use crate::tracker::{Frame, ReacquireHandle, TrackerConfig, TrackingResult, TrackingStateMachine};

use super::FrameSource;
use super::builder::LocalizerFactory;
use super::queue::{BoundedQueue, DropReason, PipelineStats, StatsCounters};

/// Availability changes of the frame source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceStatus {
    /// The source failed. Reported once until the next frame arrives.
    Unavailable { reason: String },
    /// Frames are flowing again after a failure.
    Restored,
}

/// Everything the presentation side receives, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PipelineEvent {
    Result(TrackingResult),
    Source(SourceStatus),
    SessionStarted {
        recipe_id: RecipeId,
    },
    SessionStopped {
        recipe_id: RecipeId,
        frames_processed: u64,
        /// Frames still queued at stop time, never evaluated
        frames_discarded: u64,
    },
}

pub(crate) enum Command {
    Start(Arc<Recipe>),
    Stop,
}

/// Event queue plus its drop counter, shared by both threads.
#[derive(Clone)]
pub(crate) struct EventSink {
    queue: BoundedQueue<PipelineEvent>,
    stats: Arc<StatsCounters>,
}

impl EventSink {
    pub(crate) fn new(queue: BoundedQueue<PipelineEvent>, stats: Arc<StatsCounters>) -> Self {
        Self { queue, stats }
    }

    fn emit(&self, event: PipelineEvent) {
        let evicted = self.queue.push(event);
        if evicted > 0 {
            self.stats.events_dropped(evicted);
            debug!(evicted, "event queue full, oldest events dropped");
        }
    }
}

/// Running pipeline. Dropping it shuts both threads down.
pub struct TrackingPipeline {
    store: Arc<RecipeStore>,
    commands: Sender<Command>,
    events: Receiver<PipelineEvent>,
    reacquire: ReacquireHandle,
    shutdown: Arc<AtomicBool>,
    stats: Arc<StatsCounters>,
    capture: Option<JoinHandle<()>>,
    processing: Option<JoinHandle<()>>,
}

impl TrackingPipeline {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        store: Arc<RecipeStore>,
        commands: Sender<Command>,
        events: Receiver<PipelineEvent>,
        reacquire: ReacquireHandle,
        shutdown: Arc<AtomicBool>,
        stats: Arc<StatsCounters>,
        capture: JoinHandle<()>,
        processing: JoinHandle<()>,
    ) -> Self {
        Self {
            store,
            commands,
            events,
            reacquire,
            shutdown,
            stats,
            capture: Some(capture),
            processing: Some(processing),
        }
    }

    /// Begin tracking the saved recipe `id`.
    ///
    /// The recipe is loaded here, so store errors are returned to the caller.
    /// A running session is stopped first.
    ///
    /// # Arguments
    /// * `id` - Recipe to track; must be saved in the pipeline's store
    ///
    /// # Returns
    /// `Recipe` errors from loading, or `Disconnected` once the processing
    /// thread is gone.
    pub fn start(&self, id: &RecipeId) -> Result<(), PipelineError> {
        let recipe = Arc::new(self.store.load(id)?);
        self.commands
            .send(Command::Start(recipe))
            .map_err(|_| PipelineError::Disconnected)
    }

    /// End the running session at the next frame boundary.
    pub fn stop(&self) -> Result<(), PipelineError> {
        self.commands
            .send(Command::Stop)
            .map_err(|_| PipelineError::Disconnected)
    }

    /// Drop the current estimate and search the whole frame again.
    pub fn force_reacquire(&self) {
        self.reacquire.request();
    }

    /// Receiver of results, session and source events. Clones share one
    /// queue, so each event goes to a single receiver.
    pub fn events(&self) -> Receiver<PipelineEvent> {
        self.events.clone()
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats.snapshot()
    }

    pub fn store(&self) -> &Arc<RecipeStore> {
        &self.store
    }

    /// Stop both threads and wait for them.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        let handles = [
            ("capture", self.capture.take()),
            ("processing", self.processing.take()),
        ];
        for (name, handle) in handles {
            if let Some(handle) = handle
                && handle.join().is_err()
            {
                warn!(thread = name, "pipeline thread panicked");
            }
        }
    }
}

impl Drop for TrackingPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub(crate) struct CaptureLoop<S> {
    pub source: S,
    pub frames: BoundedQueue<Frame>,
    pub events: EventSink,
    pub stats: Arc<StatsCounters>,
    pub shutdown: Arc<AtomicBool>,
    pub idle_poll: Duration,
    pub retry_backoff: Duration,
}

impl<S: FrameSource> CaptureLoop<S> {
    pub(crate) fn run(mut self) {
        let mut unavailable = false;
        while !self.shutdown.load(Ordering::Acquire) {
            match self.source.next_frame() {
                Ok(Some(frame)) => {
                    if unavailable {
                        unavailable = false;
                        info!("frame source restored");
                        self.events.emit(PipelineEvent::Source(SourceStatus::Restored));
                    }
                    self.stats.captured();
                    let sequence = frame.sequence();
                    let evicted = self.frames.push(frame);
                    if evicted > 0 {
                        self.stats.dropped(DropReason::Overflow, evicted);
                        debug!(sequence, evicted, "frame queue full, oldest frames dropped");
                    }
                }
                Ok(None) => thread::sleep(self.idle_poll),
                Err(e) => {
                    self.stats.source_error();
                    if !unavailable {
                        unavailable = true;
                        warn!(error = %e, "frame source unavailable");
                        self.events.emit(PipelineEvent::Source(SourceStatus::Unavailable {
                            reason: e.to_string(),
                        }));
                    }
                    thread::sleep(self.retry_backoff);
                }
            }
        }
        debug!("capture thread exiting");
    }
}

struct ActiveSession {
    machine: TrackingStateMachine,
    recipe_id: RecipeId,
    last_sequence: Option<u64>,
    frames_processed: u64,
}

pub(crate) struct ProcessingLoop {
    pub commands: Receiver<Command>,
    pub frames: BoundedQueue<Frame>,
    pub events: EventSink,
    pub stats: Arc<StatsCounters>,
    pub shutdown: Arc<AtomicBool>,
    pub reacquire: ReacquireHandle,
    pub config: TrackerConfig,
    pub localizers: Option<LocalizerFactory>,
    pub idle_poll: Duration,
}

impl ProcessingLoop {
    pub(crate) fn run(self) {
        let frames = self.frames.receiver();
        let mut ready = Select::new();
        let command_op = ready.recv(&self.commands);
        ready.recv(&frames);
        let mut session: Option<ActiveSession> = None;

        while !self.shutdown.load(Ordering::Acquire) {
            if !self.drain_commands(&mut session) {
                break;
            }
            match ready.ready_timeout(self.idle_poll) {
                Ok(op) if op == command_op => {
                    if !self.drain_commands(&mut session) {
                        break;
                    }
                }
                Ok(_) => {
                    // Taken under the queue lock so a concurrent eviction
                    // can only replace the frame with a newer one.
                    if let Some(frame) = self.frames.pop() {
                        // Commands sent before this frame was dequeued win.
                        if !self.drain_commands(&mut session) {
                            break;
                        }
                        self.handle_frame(frame, &mut session);
                    }
                }
                Err(_) => {}
            }
        }

        self.stop_session(&mut session);
        debug!("processing thread exiting");
    }

    /// Apply every pending command. False once the command side is gone.
    fn drain_commands(&self, session: &mut Option<ActiveSession>) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(command) => self.apply(command, session),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn apply(&self, command: Command, session: &mut Option<ActiveSession>) {
        match command {
            Command::Start(recipe) => {
                self.stop_session(session);
                let recipe_id = recipe.id;
                let machine = match &self.localizers {
                    Some(factory) => {
                        let (detector, tracker) = factory(&recipe, &self.config);
                        TrackingStateMachine::with_localizers(
                            recipe.clone(),
                            self.config.clone(),
                            detector,
                            tracker,
                        )
                    }
                    None => TrackingStateMachine::new(recipe.clone(), self.config.clone()),
                }
                .with_reacquire_handle(self.reacquire.clone());

                info!(
                    recipe = %recipe_id,
                    name = %recipe.name,
                    version = recipe.version,
                    "session started"
                );
                *session = Some(ActiveSession {
                    machine,
                    recipe_id,
                    last_sequence: None,
                    frames_processed: 0,
                });
                self.events.emit(PipelineEvent::SessionStarted { recipe_id });
            }
            Command::Stop => {
                if session.is_none() {
                    debug!("stop requested without an active session");
                }
                self.stop_session(session);
            }
        }
    }

    fn stop_session(&self, session: &mut Option<ActiveSession>) {
        let Some(active) = session.take() else {
            return;
        };
        let discarded = self.frames.drain();
        if discarded > 0 {
            self.stats.dropped(DropReason::Stopped, discarded);
        }
        info!(
            recipe = %active.recipe_id,
            frames_processed = active.frames_processed,
            frames_discarded = discarded,
            "session stopped"
        );
        self.events.emit(PipelineEvent::SessionStopped {
            recipe_id: active.recipe_id,
            frames_processed: active.frames_processed,
            frames_discarded: discarded as u64,
        });
    }

    fn handle_frame(&self, frame: Frame, session: &mut Option<ActiveSession>) {
        let sequence = frame.sequence();
        let Some(active) = session.as_mut() else {
            self.stats.dropped(DropReason::NoSession, 1);
            debug!(sequence, "no active session, frame dropped");
            return;
        };
        if active.last_sequence.is_some_and(|last| sequence <= last) {
            self.stats.dropped(DropReason::OutOfOrder, 1);
            debug!(sequence, last = ?active.last_sequence, "out-of-order frame dropped");
            return;
        }
        active.last_sequence = Some(sequence);

        let result = active.machine.process(&frame);
        active.frames_processed += 1;
        self.stats.processed();
        self.events.emit(PipelineEvent::Result(result));
    }
}
