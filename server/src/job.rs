//! The print job state machine. One task owns the reader and pumps
//! gcode lines into the printer, one line per settled `ok`; control
//! requests are honored only between settles, so pause and cancel never
//! abandon a command the firmware has already been handed.

use std::{io, sync::Arc};

use common::status::{JobState, JobStatus};
use thiserror::Error;
use tokio::{
    select, spawn,
    sync::{mpsc, oneshot, watch},
};
use tracing::{info, warn};

use crate::{
    gcode_store::{GcodeMetadata, GcodeReader, GcodeStore, StoreError},
    printer::{serial::SerialError, PrinterHandle},
};

const RESUME_TRAVEL_FEEDRATE: f64 = 3000.0; // mm/min

#[derive(Debug, Error)]
pub enum JobError {
    #[error("printer is not connected")]
    NotConnected,
    #[error("a print job is already active")]
    AlreadyActive,
    #[error("no print job is active")]
    NotActive,
    #[error("print job is not paused")]
    NotPaused,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("printer rejected the command: {0}")]
    Serial(#[from] SerialError),
}

type Responder = oneshot::Sender<Result<(), JobError>>;

enum JobRequest {
    Start { filename: String, responder: Responder },
    Pause { responder: Responder },
    Resume { responder: Responder },
    Cancel { responder: Responder },
    Reset { responder: Responder },
}

#[derive(Clone)]
pub struct JobHandle {
    requests: mpsc::Sender<JobRequest>,
    status: watch::Receiver<JobStatus>,
}

impl JobHandle {
    async fn call(&self, request: JobRequest, receiver: oneshot::Receiver<Result<(), JobError>>) -> Result<(), JobError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| JobError::NotConnected)?;
        receiver.await.map_err(|_| JobError::NotConnected)?
    }

    pub async fn start(&self, filename: String) -> Result<(), JobError> {
        let (responder, receiver) = oneshot::channel();
        self.call(JobRequest::Start { filename, responder }, receiver).await
    }

    pub async fn pause(&self) -> Result<(), JobError> {
        let (responder, receiver) = oneshot::channel();
        self.call(JobRequest::Pause { responder }, receiver).await
    }

    pub async fn resume(&self) -> Result<(), JobError> {
        let (responder, receiver) = oneshot::channel();
        self.call(JobRequest::Resume { responder }, receiver).await
    }

    pub async fn cancel(&self) -> Result<(), JobError> {
        let (responder, receiver) = oneshot::channel();
        self.call(JobRequest::Cancel { responder }, receiver).await
    }

    pub async fn reset(&self) -> Result<(), JobError> {
        let (responder, receiver) = oneshot::channel();
        self.call(JobRequest::Reset { responder }, receiver).await
    }

    pub fn status(&self) -> JobStatus {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<JobStatus> {
        self.status.clone()
    }
}

pub fn start_job_manager(printer: PrinterHandle, store: Arc<dyn GcodeStore>) -> JobHandle {
    let (requests, requests_rx) = mpsc::channel(16);
    let (status_tx, status) = watch::channel(JobStatus::default());
    let runner = JobRunner {
        printer,
        store,
        status_tx,
        status: JobStatus::default(),
        active: None,
        resume_context: None,
    };
    spawn(runner.run(requests_rx));
    JobHandle { requests, status }
}

struct ActiveJob {
    reader: Box<dyn GcodeReader>,
    size: u64,
    metadata: GcodeMetadata,
}

/// Motion context captured at pause time so resume can put the toolhead
/// back where the stream left off, in the same coordinate modes.
struct ResumeContext {
    absolute_xyz: bool,
    absolute_e: bool,
    feedrate: f64,
    position: [f64; 4],
}

struct JobRunner {
    printer: PrinterHandle,
    store: Arc<dyn GcodeStore>,
    status_tx: watch::Sender<JobStatus>,
    status: JobStatus,
    active: Option<ActiveJob>,
    resume_context: Option<ResumeContext>,
}

impl JobRunner {
    async fn run(mut self, mut requests: mpsc::Receiver<JobRequest>) {
        loop {
            if self.status.state == JobState::Printing {
                if !self.pump(&mut requests).await {
                    return;
                }
            } else {
                match requests.recv().await {
                    None => return,
                    Some(request) => self.handle_idle(request).await,
                }
            }
        }
    }

    /// Stream one line and settle it. Control requests arriving while
    /// the line is in flight are collected and applied afterwards.
    /// Returns false when every handle is gone.
    async fn pump(&mut self, requests: &mut mpsc::Receiver<JobRequest>) -> bool {
        let next = match self.next_command().await {
            Err(error) => {
                self.fail(format!("gcode read failed: {error}"));
                return true;
            }
            Ok(None) => {
                self.complete();
                return true;
            }
            Ok(Some(line)) => line,
        };
        let printer = self.printer.clone();
        let send = printer.run_command(next, false);
        tokio::pin!(send);
        let mut settled_requests = Vec::new();
        let result = loop {
            select! {
                result = &mut send => break result,
                request = requests.recv() => match request {
                    None => return false,
                    Some(request) => settled_requests.push(request),
                },
            }
        };
        match result {
            Ok(_) => self.update_progress(),
            Err(error) => self.fail(format!("printer error during job: {error}")),
        }
        for request in settled_requests {
            self.handle_settled(request);
        }
        true
    }

    /// Next printable line of the file: comments stripped, blanks
    /// skipped.
    async fn next_command(&mut self) -> io::Result<Option<String>> {
        let active = match self.active.as_mut() {
            Some(active) => active,
            None => return Ok(None),
        };
        loop {
            match active.reader.next_line().await? {
                None => return Ok(None),
                Some(line) => {
                    let command = match line.split(';').next() {
                        Some(text) => text.trim(),
                        None => continue,
                    };
                    if command.is_empty() {
                        continue;
                    }
                    return Ok(Some(command.to_string()));
                }
            }
        }
    }

    /// Requests held back until the in-flight line settled.
    fn handle_settled(&mut self, request: JobRequest) {
        match request {
            JobRequest::Pause { responder } => {
                let result = if self.status.state == JobState::Printing {
                    self.do_pause();
                    Ok(())
                } else {
                    Err(JobError::NotActive)
                };
                drop(responder.send(result));
            }
            JobRequest::Cancel { responder } => {
                let result = match self.status.state {
                    JobState::Printing | JobState::Paused => {
                        self.do_cancel();
                        Ok(())
                    }
                    _ => Err(JobError::NotActive),
                };
                drop(responder.send(result));
            }
            JobRequest::Start { responder, .. } => {
                drop(responder.send(Err(JobError::AlreadyActive)));
            }
            JobRequest::Resume { responder } => {
                drop(responder.send(Err(JobError::NotPaused)));
            }
            JobRequest::Reset { responder } => {
                drop(responder.send(Err(JobError::AlreadyActive)));
            }
        }
    }

    async fn handle_idle(&mut self, request: JobRequest) {
        match request {
            JobRequest::Start { filename, responder } => {
                drop(responder.send(self.do_start(filename).await));
            }
            JobRequest::Pause { responder } => {
                drop(responder.send(Err(JobError::NotActive)));
            }
            JobRequest::Resume { responder } => {
                let result = if self.status.state == JobState::Paused {
                    self.do_resume().await
                } else {
                    Err(JobError::NotPaused)
                };
                drop(responder.send(result));
            }
            JobRequest::Cancel { responder } => {
                let result = if self.status.state == JobState::Paused {
                    self.do_cancel();
                    Ok(())
                } else {
                    Err(JobError::NotActive)
                };
                drop(responder.send(result));
            }
            JobRequest::Reset { responder } => {
                let result = if self.status.state.can_start() {
                    self.status = JobStatus::default();
                    self.publish();
                    Ok(())
                } else {
                    Err(JobError::AlreadyActive)
                };
                drop(responder.send(result));
            }
        }
    }

    async fn do_start(&mut self, filename: String) -> Result<(), JobError> {
        if !self.printer.is_ready() {
            return Err(JobError::NotConnected);
        }
        if !self.status.state.can_start() {
            return Err(JobError::AlreadyActive);
        }
        let file = self.store.open(&filename).await?;
        info!(filename, size = file.size, "starting print job");
        self.active = Some(ActiveJob {
            reader: file.reader,
            size: file.size,
            metadata: file.metadata,
        });
        self.resume_context = None;
        self.status = JobStatus {
            state: JobState::Printing,
            filename: Some(filename),
            file_position: 0,
            file_size: file.size,
            progress: 0.0,
            message: None,
        };
        self.printer.set_job_active(true);
        self.publish();
        Ok(())
    }

    fn do_pause(&mut self) {
        let motion = self.printer.snapshot().motion;
        self.resume_context = Some(ResumeContext {
            absolute_xyz: motion.absolute_xyz,
            absolute_e: motion.absolute_e,
            feedrate: motion.feedrate,
            position: motion.position,
        });
        self.printer.set_job_active(false);
        self.status.state = JobState::Paused;
        self.publish();
        info!("print job paused");
    }

    async fn do_resume(&mut self) -> Result<(), JobError> {
        if let Some(context) = self.resume_context.take() {
            let mut commands = vec![
                "G90".to_string(),
                format!(
                    "G1 X{:.3} Y{:.3} F{:.0}",
                    context.position[0], context.position[1], RESUME_TRAVEL_FEEDRATE
                ),
            ];
            if !context.absolute_xyz {
                commands.push("G91".to_string());
            }
            commands.push(if context.absolute_e { "M82" } else { "M83" }.to_string());
            if context.feedrate > 0.0 {
                commands.push(format!("G1 F{:.0}", context.feedrate));
            }
            for command in commands {
                if let Err(error) = self.printer.run_command(command, false).await {
                    self.fail(format!("failed to restore motion state: {error}"));
                    return Err(error.into());
                }
            }
        }
        self.printer.set_job_active(true);
        self.status.state = JobState::Printing;
        self.publish();
        info!("print job resumed");
        Ok(())
    }

    fn do_cancel(&mut self) {
        self.active = None;
        self.resume_context = None;
        self.printer.set_job_active(false);
        self.status.state = JobState::Cancelled;
        self.status.message = Some("print cancelled".to_string());
        self.publish();
        info!("print job cancelled");
    }

    fn complete(&mut self) {
        if let Some(active) = self.active.take() {
            self.status.file_position = active.reader.position();
        }
        self.resume_context = None;
        self.printer.set_job_active(false);
        self.status.state = JobState::Complete;
        self.status.progress = 1.0;
        self.publish();
        info!(filename = ?self.status.filename, "print job complete");
    }

    fn fail(&mut self, message: String) {
        warn!(message, "print job failed");
        self.active = None;
        self.resume_context = None;
        self.printer.set_job_active(false);
        self.status.state = JobState::Error;
        self.status.message = Some(message);
        self.publish();
    }

    /// Progress is the normalized offset within the printable byte
    /// range when metadata brackets one, the raw offset over file size
    /// otherwise. Always within [0, 1]; exactly 1 only at completion.
    fn update_progress(&mut self) {
        let active = match self.active.as_ref() {
            Some(active) => active,
            None => return,
        };
        let position = active.reader.position();
        let start = active.metadata.gcode_start_byte.unwrap_or(0);
        let end = active.metadata.gcode_end_byte.unwrap_or(active.size);
        let progress = if end > start {
            (position.saturating_sub(start) as f64 / (end - start) as f64).clamp(0.0, 1.0)
        } else if active.size > 0 {
            (position as f64 / active.size as f64).clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.status.file_position = position;
        self.status.progress = progress;
        self.publish();
    }

    fn publish(&self) {
        let next = self.status.clone();
        self.status_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
