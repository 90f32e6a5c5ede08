//! Cooperative, cancellable driver of one streamed diffusion run.
//!
//! A session is one producer future (walk [`ForwardProcess::frames`],
//! encode and send the frames that pass the stride filter) raced against
//! the command channel on a single task with `tokio::select!`. The
//! producer yields after every step, so a queued cancel is seen within
//! one step. Cancelling drops the producer future mid-walk.
//!
//! Session lifecycle:
//!
//! ```text
//! Idle --start--> Running --last step--> Completed
//!                    |------cancel-----> Canceled
//!                    |------failure----> Errored
//!                    '------hang-up----> Disconnected
//! ```
//!
//! Exactly one terminal transition happens. `Disconnected` sends
//! nothing; every other terminal state sends one terminal message.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use web_time::Instant;

use kasumi_diffusion::{DiffusionError, ForwardProcess, Frame, ScheduleBuilder, compare};
use kasumi_export::decode_data_url;

use crate::encoder::FrameEncoder;
use crate::protocol::{Command, FrameUpdate, StartDirective, StreamConfig, StreamMessage, Terminal};
use crate::slot::ScheduleSlot;
use crate::StreamError;

/// Serde support for `Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Serialize, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "detail")]
pub enum SessionOutcome {
    /// Every step was processed and the final frame was sent.
    Completed,
    /// The client canceled; an acknowledgment was sent.
    Canceled,
    /// The run failed; an error message with this detail was sent.
    Errored(String),
    /// The command channel closed or the outbound receiver was dropped.
    Disconnected,
}

/// Result of one session, returned to the caller instead of being kept
/// in shared state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionReport {
    /// Terminal state.
    pub outcome: SessionOutcome,
    /// Progress messages sent, not counting the terminal message.
    pub frames_emitted: usize,
    /// Steps whose noise was applied.
    pub steps_processed: usize,
    /// Realized `beta` of every processed step, in order.
    pub betas: Vec<f64>,
    /// Wall-clock duration of the run (seconds).
    #[serde(with = "duration_serde")]
    pub elapsed: Duration,
}

/// Counters the producer updates as it goes; they stay valid after the
/// producer is dropped.
#[derive(Debug, Default)]
struct Tally {
    frames_emitted: usize,
    steps_processed: usize,
}

/// Why the producer stopped before completing.
enum Interrupt {
    Failed(StreamError),
    Disconnected,
}

impl From<StreamError> for Interrupt {
    fn from(err: StreamError) -> Self {
        Self::Failed(err)
    }
}

impl From<DiffusionError> for Interrupt {
    fn from(err: DiffusionError) -> Self {
        Self::Failed(err.into())
    }
}

/// Drives streamed runs for one connection.
///
/// Owns the frame encoder and the connection's [`ScheduleSlot`]. Runs
/// are sequential: one session at a time per orchestrator.
#[derive(Debug)]
pub struct StreamOrchestrator<E> {
    encoder: E,
    builder: ScheduleBuilder,
    slot: ScheduleSlot,
}

impl<E: FrameEncoder> StreamOrchestrator<E> {
    /// An orchestrator with the default schedule limits and a fresh slot.
    pub fn new(encoder: E) -> Self {
        Self {
            encoder,
            builder: ScheduleBuilder::default(),
            slot: ScheduleSlot::new(),
        }
    }

    /// Use `builder` to validate and build schedules.
    #[must_use]
    pub fn with_builder(mut self, builder: ScheduleBuilder) -> Self {
        self.builder = builder;
        self
    }

    /// Record realized schedules into `slot` (e.g. one shared with the
    /// transport's query handler).
    #[must_use]
    pub fn with_slot(mut self, slot: ScheduleSlot) -> Self {
        self.slot = slot;
        self
    }

    /// The slot holding the current or last run's `beta` sequence.
    pub const fn slot(&self) -> &ScheduleSlot {
        &self.slot
    }

    /// The frame encoder.
    pub const fn encoder(&self) -> &E {
        &self.encoder
    }

    /// Validate a start directive and build its forward process.
    ///
    /// This is the `Idle -> Running` check: any error here is reported to
    /// the caller and no session starts.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Malformed`] for an unparsable directive,
    /// [`StreamError::Export`] for an undecodable image payload, and
    /// [`StreamError::Diffusion`] for invalid parameters or images.
    pub fn prepare(
        &self,
        directive: &str,
        max_side: Option<u32>,
    ) -> Result<(ForwardProcess, StreamConfig), StreamError> {
        let directive = StartDirective::parse(directive)?;
        let bytes = decode_data_url(&directive.image)?;
        let config = directive.stream_config(max_side);
        let process = kasumi_diffusion::prepare(
            &bytes,
            &directive.diffusion_config(),
            &self.builder,
            config.max_side,
        )?;
        Ok((process, config))
    }

    /// Run one session to a terminal state.
    ///
    /// `commands` carries raw client messages; `outbound` receives every
    /// message for the client, in order. Commands are polled before the
    /// producer whenever both are ready.
    #[allow(clippy::future_not_send)]
    pub async fn run(
        &mut self,
        process: &ForwardProcess,
        config: &StreamConfig,
        commands: &mut mpsc::Receiver<String>,
        outbound: &mpsc::Sender<StreamMessage>,
    ) -> SessionReport {
        let started = Instant::now();
        self.slot.clear();
        tracing::info!(
            steps = process.steps(),
            stride = config.stride(),
            metrics = config.include_metrics,
            "stream session started",
        );

        let mut tally = Tally::default();
        let interrupted = {
            let producer = produce(
                process,
                config,
                &mut self.encoder,
                &self.slot,
                outbound,
                &mut tally,
            );
            tokio::pin!(producer);

            loop {
                tokio::select! {
                    biased;
                    command = commands.recv() => match command.as_deref().map(Command::parse) {
                        Some(Command::Cancel) => break Some(SessionOutcome::Canceled),
                        Some(Command::Ignored) => {
                            tracing::debug!("ignored client message");
                        }
                        None => break Some(SessionOutcome::Disconnected),
                    },
                    result = &mut producer => break match result {
                        Ok(()) => None,
                        Err(Interrupt::Disconnected) => Some(SessionOutcome::Disconnected),
                        Err(Interrupt::Failed(err)) => {
                            tracing::error!(kind = ?err.kind(), %err, "stream session failed");
                            Some(SessionOutcome::Errored(err.to_string()))
                        }
                    },
                }
            }
        };

        let outcome = match interrupted {
            None => SessionOutcome::Completed,
            Some(SessionOutcome::Canceled) => {
                tracing::info!(steps_processed = tally.steps_processed, "stream session canceled");
                finish(outbound, Terminal::Canceled).await
            }
            Some(SessionOutcome::Errored(detail)) => finish(outbound, Terminal::Error { detail }).await,
            Some(other) => other,
        };

        let report = SessionReport {
            outcome,
            frames_emitted: tally.frames_emitted,
            steps_processed: tally.steps_processed,
            betas: self.slot.snapshot(),
            elapsed: started.elapsed(),
        };
        tracing::info!(
            outcome = ?report.outcome,
            frames = report.frames_emitted,
            steps = report.steps_processed,
            elapsed_ms = report.elapsed.as_millis(),
            "stream session finished",
        );
        report
    }

    /// Validate `directive`, then run it.
    ///
    /// # Errors
    ///
    /// Returns the [`prepare`](Self::prepare) error if the session could
    /// not start. Failures after start are reported in the session
    /// itself and in the returned report.
    #[allow(clippy::future_not_send)]
    pub async fn serve(
        &mut self,
        directive: &str,
        max_side: Option<u32>,
        commands: &mut mpsc::Receiver<String>,
        outbound: &mpsc::Sender<StreamMessage>,
    ) -> Result<SessionReport, StreamError> {
        let (process, config) = self.prepare(directive, max_side)?;
        Ok(self.run(&process, &config, commands, outbound).await)
    }
}

/// Send the terminal message for a canceled or failed run.
async fn finish(outbound: &mpsc::Sender<StreamMessage>, terminal: Terminal) -> SessionOutcome {
    let outcome = match &terminal {
        Terminal::Canceled => SessionOutcome::Canceled,
        Terminal::Error { detail } => SessionOutcome::Errored(detail.clone()),
        Terminal::Completed(_) => SessionOutcome::Completed,
    };
    if outbound.send(terminal.into()).await.is_err() {
        return SessionOutcome::Disconnected;
    }
    outcome
}

/// The producer: walk every step, emit stride hits, then send the
/// completed message carrying the last emitted frame.
#[allow(clippy::future_not_send)]
async fn produce<E: FrameEncoder>(
    process: &ForwardProcess,
    config: &StreamConfig,
    encoder: &mut E,
    slot: &ScheduleSlot,
    outbound: &mpsc::Sender<StreamMessage>,
    tally: &mut Tally,
) -> Result<(), Interrupt> {
    let steps = process.steps();
    let reference = config.include_metrics.then(|| process.x0().quantize());
    let mut last = None;

    for frame in process.frames() {
        let Frame { t, beta, image } = frame?;

        if config.emits(t, steps) {
            let pixels = image.quantize();
            let encoded = encoder.encode(t, &pixels, config.quality)?;
            let metrics = reference
                .as_ref()
                .map(|x0| compare(&pixels, x0))
                .transpose()?;
            if let Some(failure) = metrics.as_ref().and_then(|m| m.error.as_ref()) {
                tracing::warn!(
                    t,
                    kind = ?failure.kind,
                    detail = %failure.detail,
                    "metric undefined for frame",
                );
            }

            let update = FrameUpdate::new(t, beta, steps, encoded, metrics);
            outbound
                .send(StreamMessage::Progress(update.clone()))
                .await
                .map_err(|_| Interrupt::Disconnected)?;
            tally.frames_emitted += 1;
            tracing::debug!(t, beta, "frame emitted");
            last = Some(update);
        }

        slot.push(beta);
        tally.steps_processed += 1;
        tokio::task::yield_now().await;
    }

    let last = last.ok_or(StreamError::NoFrames)?;
    outbound
        .send(Terminal::Completed(last).into())
        .await
        .map_err(|_| Interrupt::Disconnected)
}
