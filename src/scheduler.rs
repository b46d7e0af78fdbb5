//! Staged execution of a scrambling run.
//!
//! A run is an ordered task list (`setup -> load -> compute xN -> transfer ->
//! commit`) executed against one exclusively-owned engine. Progress and the
//! single terminal event travel over one typed channel per run; a shared
//! cancel token is checked at every stage boundary, and a signaled run emits
//! `Terminated(Cancelled)` and flushes without surfacing any partial image.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use image::ImageReader;

use crate::config::{CipherDirection, CipherMode, ColorProcessing, RenderConfig};
use crate::encoding;
use crate::engine::ComputeEngine;
use crate::errors::RenderError;
use crate::layout::PixelLayout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderEvent {
    Progress(String),
    PassCompleted(String),
    Succeeded(PathBuf),
    Terminated(TerminationReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    Cancelled,
    Failed(String),
}

/// Shared cancellation flag, checked at every stage boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderTask {
    Setup,
    LoadImage,
    Compute(CipherMode),
    Transfer,
    Commit,
}

/// Derive the ordered task list for one run.
pub fn pass_tasks(
    direction: CipherDirection,
    color_processing: ColorProcessing,
) -> Vec<RenderTask> {
    let mut tasks = vec![RenderTask::Setup, RenderTask::LoadImage];
    tasks.extend(
        color_processing
            .pass_modes(direction)
            .into_iter()
            .map(RenderTask::Compute),
    );
    tasks.push(RenderTask::Transfer);
    tasks.push(RenderTask::Commit);
    tasks
}

pub struct RenderJob {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub config: RenderConfig,
    pub direction: CipherDirection,
    pub color_processing: ColorProcessing,
}

enum Abort {
    Cancelled,
    Failed(anyhow::Error),
}

impl From<anyhow::Error> for Abort {
    fn from(error: anyhow::Error) -> Self {
        Self::Failed(error)
    }
}

impl From<RenderError> for Abort {
    fn from(error: RenderError) -> Self {
        Self::Failed(error.into())
    }
}

#[derive(Default)]
pub struct Scheduler {
    engine: ComputeEngine,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engine(&self) -> &ComputeEngine {
        &self.engine
    }

    /// Execute one run to its single terminal event, then flush the engine.
    /// The engine (and its instruction-map cache) stays usable for the next
    /// run; `&mut self` rules out interleaved runs.
    pub fn run(&mut self, job: &RenderJob, events: &Sender<RenderEvent>, cancel: &CancelToken) {
        let outcome = self.execute(job, events, cancel);
        let terminal = match outcome {
            Ok(path) => RenderEvent::Succeeded(path),
            Err(Abort::Cancelled) => RenderEvent::Terminated(TerminationReason::Cancelled),
            Err(Abort::Failed(error)) => {
                RenderEvent::Terminated(TerminationReason::Failed(format!("{error:#}")))
            }
        };
        let _ = events.send(terminal);
        self.engine.flush();
    }

    /// Drop all engine state, including the instruction-map cache.
    pub fn reset(&mut self) {
        self.engine.reset();
    }

    fn execute(
        &mut self,
        job: &RenderJob,
        events: &Sender<RenderEvent>,
        cancel: &CancelToken,
    ) -> Result<PathBuf, Abort> {
        std::fs::create_dir_all(&job.output_dir)
            .with_context(|| format!("failed preparing {}", job.output_dir.display()))?;
        let mut config = job.config.clone();
        config.secret.validate()?;

        let mut pass_count = 0_u32;
        let mut written = None;
        for task in pass_tasks(job.direction, job.color_processing) {
            if cancel.is_cancelled() {
                return Err(Abort::Cancelled);
            }
            match task {
                RenderTask::Setup => {
                    progress(events, "Setting up GPU...");
                    pollster::block_on(self.engine.setup())?;
                }
                RenderTask::LoadImage => {
                    progress(events, "Loading image into GPU texture...");
                    let (image, layout) = decode_input(&job.input)?;
                    self.engine.load_image(&image, layout)?;
                }
                RenderTask::Compute(mode) => {
                    progress(events, "Generating lookup table...");
                    config.cipher_mode = mode;
                    progress(events, "Computing new bitmap...");
                    self.engine.compute_pass(&config, pass_count)?;
                    pass_count += 1;
                }
                RenderTask::Transfer => {
                    self.engine.transfer(pass_count)?;
                }
                RenderTask::Commit => {
                    let labels = self.engine.commit()?;
                    let image = self.engine.read_output()?;
                    for label in labels {
                        let _ = events.send(RenderEvent::PassCompleted(label.to_owned()));
                    }
                    let layout = self
                        .engine
                        .loaded_layout()
                        .ok_or_else(|| anyhow!("commit without a loaded image"))?;
                    let path = encoding::write_output(&job.output_dir, &layout, &image)?;
                    progress(events, "Done.");
                    written = Some(path);
                }
            }
        }
        written.ok_or_else(|| Abort::Failed(anyhow!("run finished without a commit stage")))
    }
}

fn progress(events: &Sender<RenderEvent>, message: &str) {
    let _ = events.send(RenderEvent::Progress(message.to_owned()));
}

fn decode_input(input: &std::path::Path) -> Result<(image::DynamicImage, PixelLayout), Abort> {
    let reader = ImageReader::open(input)
        .map_err(|_| RenderError::ResourceNotReadable(input.to_path_buf()))?
        .with_guessed_format()
        .map_err(|_| RenderError::ResourceNotReadable(input.to_path_buf()))?;
    let source_format = reader.format();
    let image = reader
        .decode()
        .map_err(|_| RenderError::ResourceNotReadable(input.to_path_buf()))?;
    let layout = PixelLayout::probe(&image, source_format)?;
    Ok((image, layout))
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::secret::CipherSecret;

    fn job(dir: &std::path::Path) -> RenderJob {
        RenderJob {
            input: dir.join("missing.png"),
            output_dir: dir.to_path_buf(),
            config: RenderConfig::new(CipherSecret::from_password("test", 256), 1, 16),
            direction: CipherDirection::Forward,
            color_processing: ColorProcessing::Permute,
        }
    }

    #[test]
    fn task_lists_match_the_color_processing_selector() {
        use RenderTask::*;
        let permute = pass_tasks(CipherDirection::Forward, ColorProcessing::Permute);
        assert_eq!(
            permute,
            vec![
                Setup,
                LoadImage,
                Compute(CipherMode::Permutation),
                Transfer,
                Commit
            ]
        );

        let both = pass_tasks(CipherDirection::Inverse, ColorProcessing::Both);
        assert_eq!(
            both,
            vec![
                Setup,
                LoadImage,
                Compute(CipherMode::Unpermutation),
                Compute(CipherMode::Substitution),
                Compute(CipherMode::Unpermutation),
                Transfer,
                Commit
            ]
        );
    }

    #[test]
    fn cancelled_run_emits_exactly_one_terminal_event_and_nothing_else() {
        let dir = tempfile::tempdir().unwrap();
        let (sender, receiver) = mpsc::channel();
        let cancel = CancelToken::new();
        cancel.cancel();

        let mut scheduler = Scheduler::new();
        scheduler.run(&job(dir.path()), &sender, &cancel);
        drop(sender);

        let received: Vec<RenderEvent> = receiver.iter().collect();
        assert_eq!(
            received,
            vec![RenderEvent::Terminated(TerminationReason::Cancelled)]
        );
    }

    #[test]
    fn scheduler_survives_a_cancelled_run_and_accepts_another() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut scheduler = Scheduler::new();

        for _ in 0..2 {
            let (sender, receiver) = mpsc::channel();
            scheduler.run(&job(dir.path()), &sender, &cancel);
            drop(sender);
            let received: Vec<RenderEvent> = receiver.iter().collect();
            assert_eq!(
                received,
                vec![RenderEvent::Terminated(TerminationReason::Cancelled)]
            );
        }
    }
}
