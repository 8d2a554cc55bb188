pub mod connection;
pub mod messages;
pub mod motion;
pub mod parser;
pub mod serial;
pub mod watchers;

use std::{
    future::Future,
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use common::status::{HeaterReading, PrinterInfo, PrinterState};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, Lines},
    select, spawn,
    sync::{mpsc, oneshot, watch},
    time::{interval, sleep, MissedTickBehavior},
};
use tracing::{info, warn};

use crate::util::console::ConsoleLog;
use messages::{FirmwareInfo, TemperatureReport};
use motion::MotionState;
use serial::{Command, SerialChannel, SerialError};
use watchers::Watcher;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);
const LOAD_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const POLL_TICK: Duration = Duration::from_millis(250);
const REQUEST_BUFFER: usize = 64;

/// Firmware-derived state the watchers keep fresh, plus the motion
/// model maintained by introspecting the commands we send.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrinterData {
    pub motion: MotionState,
    pub heaters: Vec<(String, HeaterReading)>,
}

impl PrinterData {
    /// Merge one temperature report. Heaters keep the order they first
    /// appeared in; fields a report omits retain their last value.
    pub fn apply_temperatures(&mut self, report: &TemperatureReport) {
        for (name, sample) in &report.heaters {
            match self.heaters.iter_mut().find(|(existing, _)| existing == name) {
                Some((_, reading)) => {
                    reading.temperature = sample.current;
                    if let Some(target) = sample.target {
                        reading.target = target;
                    }
                    if let Some(power) = sample.power {
                        reading.power = power;
                    }
                }
                None => self.heaters.push((
                    name.clone(),
                    HeaterReading {
                        temperature: sample.current,
                        target: sample.target.unwrap_or(0.0),
                        power: sample.power.unwrap_or(0.0),
                    },
                )),
            }
        }
    }
}

/// Everything a client may want to know about the printer, published on
/// a watch channel whenever any of it changes.
#[derive(Debug, Clone, PartialEq)]
pub struct PrinterSnapshot {
    pub state: PrinterState,
    pub state_message: String,
    pub firmware: Option<FirmwareInfo>,
    pub motion: MotionState,
    pub heaters: Vec<(String, HeaterReading)>,
}

impl PrinterSnapshot {
    pub fn startup() -> Self {
        PrinterSnapshot {
            state: PrinterState::Startup,
            state_message: "connecting to printer".to_string(),
            firmware: None,
            motion: MotionState::default(),
            heaters: Vec::new(),
        }
    }

    pub fn info(&self) -> PrinterInfo {
        PrinterInfo {
            state: self.state,
            state_message: self.state_message.clone(),
            firmware_name: self
                .firmware
                .as_ref()
                .map(|firmware| firmware.firmware_name.clone()),
            machine_type: self
                .firmware
                .as_ref()
                .and_then(|firmware| firmware.machine_type.clone()),
        }
    }
}

enum PrinterRequest {
    Dispatch {
        text: String,
        important: bool,
        responder: oneshot::Sender<Result<String, SerialError>>,
    },
    EmergencyStop,
    Restart,
    Disconnect,
}

/// Cheap clonable handle to the printer task. All interaction with the
/// firmware funnels through here.
#[derive(Clone)]
pub struct PrinterHandle {
    requests: mpsc::Sender<PrinterRequest>,
    snapshot: watch::Receiver<PrinterSnapshot>,
    job_active: Arc<AtomicBool>,
}

impl PrinterHandle {
    /// Send one command and wait for its full response, `ok` excluded.
    pub async fn run_command(
        &self,
        text: impl Into<String>,
        important: bool,
    ) -> Result<String, SerialError> {
        let (responder, receiver) = oneshot::channel();
        self.requests
            .send(PrinterRequest::Dispatch {
                text: text.into(),
                important,
                responder,
            })
            .await
            .map_err(|_| SerialError::NotConnected)?;
        receiver.await.map_err(|_| SerialError::ConnectionLost)?
    }

    /// Run a multi-line script one command at a time, stopping at the
    /// first failure. Blank lines and comment lines are skipped.
    pub async fn run_script(&self, script: &str) -> Result<(), SerialError> {
        for line in script.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            self.run_command(line, false).await?;
        }
        Ok(())
    }

    /// M112 straight to the wire, then a full session rebuild. Pending
    /// commands are rejected rather than replayed against the halted
    /// firmware.
    pub async fn emergency_stop(&self) {
        drop(self.requests.send(PrinterRequest::EmergencyStop).await);
    }

    /// Tear the connection down and rebuild it from the handshake up.
    pub async fn restart(&self) {
        drop(self.requests.send(PrinterRequest::Restart).await);
    }

    /// Close the connection on purpose and stay offline. Commands fail
    /// with `NotConnected` until `reconnect` is called.
    pub async fn disconnect(&self) {
        drop(self.requests.send(PrinterRequest::Disconnect).await);
    }

    /// Leave the operator-requested offline state and dial the printer
    /// again from the handshake up.
    pub async fn reconnect(&self) {
        drop(self.requests.send(PrinterRequest::Restart).await);
    }

    pub fn snapshot(&self) -> PrinterSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<PrinterSnapshot> {
        self.snapshot.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.snapshot.borrow().state == PrinterState::Ready
    }

    /// The job manager flags its print phases so watcher polls stay off
    /// the wire while gcode is streaming.
    pub fn set_job_active(&self, active: bool) {
        self.job_active.store(active, Ordering::Relaxed);
    }
}

/// Spawn the printer task. `connect` is called for every connection
/// attempt; the task owns both halves for the life of each session.
pub fn start_printer<C, F, R, W>(connect: C, console: Arc<ConsoleLog>) -> PrinterHandle
where
    C: FnMut() -> F + Send + 'static,
    F: Future<Output = io::Result<(R, W)>> + Send + 'static,
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (requests, requests_rx) = mpsc::channel(REQUEST_BUFFER);
    let (snapshot_tx, snapshot) = watch::channel(PrinterSnapshot::startup());
    let job_active = Arc::new(AtomicBool::new(false));
    let handle = PrinterHandle {
        requests,
        snapshot,
        job_active: job_active.clone(),
    };
    spawn(run_printer(connect, console, requests_rx, snapshot_tx, job_active));
    handle
}

async fn run_printer<C, F, R, W>(
    mut connect: C,
    console: Arc<ConsoleLog>,
    mut requests: mpsc::Receiver<PrinterRequest>,
    snapshot: watch::Sender<PrinterSnapshot>,
    job_active: Arc<AtomicBool>,
) where
    C: FnMut() -> F + Send + 'static,
    F: Future<Output = io::Result<(R, W)>> + Send,
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    loop {
        publish_state(&snapshot, PrinterState::Startup, "connecting to printer");
        let (reader, writer) = match connect().await {
            Ok(halves) => halves,
            Err(error) => {
                warn!(%error, "failed to open printer connection");
                publish_state(
                    &snapshot,
                    PrinterState::Error,
                    &format!("connection failed: {error}"),
                );
                match wait_before_retry(&mut requests).await {
                    Idle::Reconnect => continue,
                    Idle::Offline => match stay_offline(&snapshot, &mut requests).await {
                        Idle::Reconnect => continue,
                        _ => break,
                    },
                    Idle::Shutdown => break,
                }
            }
        };
        let mut lines = BufReader::new(reader).lines();
        let mut session = Session::new(writer, console.clone(), &snapshot, &job_active);
        match session.run(&mut lines, &mut requests).await {
            SessionEnd::Shutdown => break,
            SessionEnd::Restart => continue,
            SessionEnd::Disconnected => match stay_offline(&snapshot, &mut requests).await {
                Idle::Reconnect => continue,
                _ => break,
            },
            SessionEnd::Lost(message) => {
                warn!(message, "printer session ended");
                publish_state(&snapshot, PrinterState::Error, &message);
                match wait_before_retry(&mut requests).await {
                    Idle::Reconnect => continue,
                    Idle::Offline => match stay_offline(&snapshot, &mut requests).await {
                        Idle::Reconnect => continue,
                        _ => break,
                    },
                    Idle::Shutdown => break,
                }
            }
        }
    }
    publish_state(&snapshot, PrinterState::Shutdown, "printer task stopped");
}

fn publish_state(snapshot: &watch::Sender<PrinterSnapshot>, state: PrinterState, message: &str) {
    snapshot.send_if_modified(|current| {
        if current.state == state && current.state_message == message {
            return false;
        }
        current.state = state;
        current.state_message = message.to_string();
        true
    });
}

/// What the supervisor does next after sitting out a disconnected spell.
enum Idle {
    Reconnect,
    Offline,
    Shutdown,
}

/// Sit out the reconnect delay. Commands arriving now would otherwise
/// wait silently for a printer that is not there, so they fail fast.
async fn wait_before_retry(requests: &mut mpsc::Receiver<PrinterRequest>) -> Idle {
    let deadline = sleep(RECONNECT_DELAY);
    tokio::pin!(deadline);
    loop {
        select! {
            _ = &mut deadline => return Idle::Reconnect,
            request = requests.recv() => match request {
                None => return Idle::Shutdown,
                Some(PrinterRequest::Dispatch { responder, .. }) => {
                    drop(responder.send(Err(SerialError::NotConnected)));
                }
                Some(PrinterRequest::Restart) => return Idle::Reconnect,
                Some(PrinterRequest::Disconnect) => return Idle::Offline,
                Some(PrinterRequest::EmergencyStop) => {}
            },
        }
    }
}

/// Operator-requested offline state. Unlike the retry wait there is no
/// deadline; the supervisor holds here until a reconnect request
/// arrives, failing dispatches fast the whole time.
async fn stay_offline(
    snapshot: &watch::Sender<PrinterSnapshot>,
    requests: &mut mpsc::Receiver<PrinterRequest>,
) -> Idle {
    info!("printer connection closed by request");
    publish_state(snapshot, PrinterState::Shutdown, "printer disconnected by request");
    loop {
        match requests.recv().await {
            None => return Idle::Shutdown,
            Some(PrinterRequest::Restart) => return Idle::Reconnect,
            Some(PrinterRequest::Dispatch { responder, .. }) => {
                drop(responder.send(Err(SerialError::NotConnected)));
            }
            Some(PrinterRequest::EmergencyStop | PrinterRequest::Disconnect) => {}
        }
    }
}

enum SessionEnd {
    /// Connection-level failure; the supervisor waits and reconnects.
    Lost(String),
    /// Deliberate teardown; reconnect immediately.
    Restart,
    /// Deliberate teardown; stay offline until asked to reconnect.
    Disconnected,
    /// Every handle has been dropped.
    Shutdown,
}

impl From<io::Error> for SessionEnd {
    fn from(error: io::Error) -> Self {
        SessionEnd::Lost(format!("serial I/O failed: {error}"))
    }
}

fn decode_line(result: Result<Option<String>, io::Error>) -> Result<String, SessionEnd> {
    match result {
        Ok(Some(line)) => Ok(line.trim_end_matches('\r').to_string()),
        Ok(None) => Err(SessionEnd::Lost("serial connection closed".to_string())),
        Err(error) => Err(error.into()),
    }
}

/// One connection's worth of protocol state. A reconnect discards the
/// session wholesale and builds a fresh one; nothing here survives it.
struct Session<'a, W> {
    channel: SerialChannel<W>,
    watchers: Vec<Box<dyn Watcher>>,
    data: PrinterData,
    firmware: Option<FirmwareInfo>,
    state: PrinterState,
    state_message: String,
    console: Arc<ConsoleLog>,
    snapshot: &'a watch::Sender<PrinterSnapshot>,
    job_active: &'a Arc<AtomicBool>,
}

impl<'a, W: AsyncWrite + Unpin> Session<'a, W> {
    fn new(
        writer: W,
        console: Arc<ConsoleLog>,
        snapshot: &'a watch::Sender<PrinterSnapshot>,
        job_active: &'a Arc<AtomicBool>,
    ) -> Self {
        Session {
            channel: SerialChannel::new(writer, console.clone()),
            watchers: Vec::new(),
            data: PrinterData::default(),
            firmware: None,
            state: PrinterState::Startup,
            state_message: "connecting to printer".to_string(),
            console,
            snapshot,
            job_active,
        }
    }

    async fn run<L: AsyncBufRead + Unpin>(
        &mut self,
        lines: &mut Lines<L>,
        requests: &mut mpsc::Receiver<PrinterRequest>,
    ) -> SessionEnd {
        let end = match self.run_inner(lines, requests).await {
            Ok(end) => end,
            Err(end) => end,
        };
        // Whatever was pending is not getting an answer from this
        // connection anymore.
        self.channel.fail_all(SerialError::ConnectionLost);
        end
    }

    async fn run_inner<L: AsyncBufRead + Unpin>(
        &mut self,
        lines: &mut Lines<L>,
        requests: &mut mpsc::Receiver<PrinterRequest>,
    ) -> Result<SessionEnd, SessionEnd> {
        self.handshake(lines).await?;
        self.identify(lines).await?;
        self.prime(lines).await?;
        self.set_state(PrinterState::Ready, "printer is ready");
        self.main_loop(lines, requests).await
    }

    /// M110 N0 resets Marlin's line counter and, more importantly,
    /// proves something Marlin-shaped is answering before we trust the
    /// port.
    async fn handshake<L: AsyncBufRead + Unpin>(
        &mut self,
        lines: &mut Lines<L>,
    ) -> Result<(), SessionEnd> {
        self.request(lines, "M110 N0", HANDSHAKE_TIMEOUT)
            .await
            .map_err(|_| SessionEnd::Lost(SerialError::HandshakeTimeout.to_string()))?;
        Ok(())
    }

    async fn identify<L: AsyncBufRead + Unpin>(
        &mut self,
        lines: &mut Lines<L>,
    ) -> Result<(), SessionEnd> {
        let response = self.request(lines, "M115", SETUP_TIMEOUT).await?;
        let firmware = parser::parse_firmware_info(&response)
            .map_err(|error| SessionEnd::Lost(format!("unrecognized M115 banner: {error}")))?;
        info!(
            firmware = %firmware.firmware_name,
            extruders = firmware.extruder_count,
            "identified printer firmware"
        );
        self.watchers = watchers::build_watchers(&firmware);
        self.firmware = Some(firmware);
        let setup: Vec<&'static str> = self
            .watchers
            .iter()
            .filter_map(|watcher| watcher.setup_command())
            .collect();
        for command in setup {
            self.request(lines, command, SETUP_TIMEOUT).await?;
        }
        Ok(())
    }

    /// Ask for temperatures and position once so the first published
    /// snapshot is real data, then wait for every watcher to confirm.
    async fn prime<L: AsyncBufRead + Unpin>(
        &mut self,
        lines: &mut Lines<L>,
    ) -> Result<(), SessionEnd> {
        self.request(lines, "M105", SETUP_TIMEOUT).await?;
        self.request(lines, "M114", SETUP_TIMEOUT).await?;
        let deadline = sleep(LOAD_TIMEOUT);
        tokio::pin!(deadline);
        while !self.watchers.iter().all(|watcher| watcher.is_loaded()) {
            select! {
                _ = &mut deadline => {
                    return Err(SessionEnd::Lost(
                        "printer state reports never arrived".to_string(),
                    ));
                }
                line = lines.next_line() => {
                    let line = decode_line(line)?;
                    self.receive_line(&line).await?;
                }
            }
        }
        Ok(())
    }

    /// Send one command and pump received lines until its response is
    /// in. Used during session setup, before the main loop runs.
    async fn request<L: AsyncBufRead + Unpin>(
        &mut self,
        lines: &mut Lines<L>,
        text: &str,
        timeout: Duration,
    ) -> Result<String, SessionEnd> {
        let (command, mut receiver) = Command::new(text, false);
        self.channel.enqueue(command).await?;
        self.note_dispatched();
        let deadline = sleep(timeout);
        tokio::pin!(deadline);
        loop {
            select! {
                _ = &mut deadline => {
                    return Err(SessionEnd::Lost(format!("firmware did not answer {text}")));
                }
                result = &mut receiver => {
                    return match result {
                        Ok(Ok(response)) => Ok(response),
                        Ok(Err(error)) => Err(SessionEnd::Lost(error.to_string())),
                        Err(_) => Err(SessionEnd::Lost(format!("{text} was dropped unanswered"))),
                    };
                }
                line = lines.next_line() => {
                    let line = decode_line(line)?;
                    self.receive_line(&line).await?;
                }
            }
        }
    }

    async fn main_loop<L: AsyncBufRead + Unpin>(
        &mut self,
        lines: &mut Lines<L>,
        requests: &mut mpsc::Receiver<PrinterRequest>,
    ) -> Result<SessionEnd, SessionEnd> {
        let mut poll_tick = interval(POLL_TICK);
        poll_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            select! {
                biased;
                line = lines.next_line() => {
                    let line = decode_line(line)?;
                    self.receive_line(&line).await?;
                }
                request = requests.recv() => match request {
                    None => return Ok(SessionEnd::Shutdown),
                    Some(PrinterRequest::Dispatch { text, important, responder }) => {
                        let command = Command::with_responder(text, important, responder);
                        self.channel.enqueue(command).await?;
                        self.note_dispatched();
                    }
                    Some(PrinterRequest::EmergencyStop) => {
                        self.channel.write_immediate("M112").await?;
                        return Ok(SessionEnd::Restart);
                    }
                    Some(PrinterRequest::Restart) => return Ok(SessionEnd::Restart),
                    Some(PrinterRequest::Disconnect) => return Ok(SessionEnd::Disconnected),
                },
                _ = poll_tick.tick() => self.run_polls().await?,
            }
        }
    }

    /// Watcher polls only go out on an idle channel; a busy channel
    /// skips this round.
    async fn run_polls(&mut self) -> Result<(), SessionEnd> {
        if !self.channel.is_ready() || self.channel.queued() > 0 {
            return Ok(());
        }
        let job_active = self.job_active.load(Ordering::Relaxed);
        let now = Instant::now();
        let due: Vec<&'static str> = self
            .watchers
            .iter_mut()
            .filter_map(|watcher| watcher.poll_command(now, job_active))
            .collect();
        for text in due {
            self.channel.enqueue(Command::internal(text)).await?;
        }
        self.note_dispatched();
        Ok(())
    }

    /// Run motion introspection over whatever just hit the wire, so the
    /// published snapshot tracks commands from the moment they are sent
    /// rather than when their `ok` comes back.
    fn note_dispatched(&mut self) {
        let sent = self.channel.take_dispatched();
        if sent.is_empty() {
            return;
        }
        for text in &sent {
            self.data.motion.observe(text);
        }
        self.publish();
    }

    async fn receive_line(&mut self, line: &str) -> Result<(), SessionEnd> {
        if parser::is_ok(line) {
            // Autoreport firmwares piggyback data on the ok token.
            if let Some(payload) = parser::ok_payload(line) {
                self.offer_to_watchers(payload);
            }
            self.console.received(line.to_string());
            self.channel.handle_line("ok").await?;
            self.note_dispatched();
            self.publish();
            return Ok(());
        }
        if line.starts_with("echo:busy:") {
            // Keep-alive while a long command blocks; not response data.
            return Ok(());
        }
        if let Some(message) = line.strip_prefix("Error:") {
            self.console.warning(line.to_string());
            if line.contains("kill() called") || line.contains("Printer halted") {
                return Err(SessionEnd::Lost(format!("firmware halted: {}", message.trim())));
            }
            return Ok(());
        }
        if self.offer_to_watchers(line) {
            self.publish();
            return Ok(());
        }
        self.console.received(line.to_string());
        self.channel.handle_line(line).await?;
        Ok(())
    }

    fn offer_to_watchers(&mut self, line: &str) -> bool {
        for watcher in &mut self.watchers {
            if watcher.handle(line, &mut self.data) {
                return true;
            }
        }
        false
    }

    fn set_state(&mut self, state: PrinterState, message: &str) {
        self.state = state;
        self.state_message = message.to_string();
        self.publish();
    }

    fn publish(&self) {
        let next = PrinterSnapshot {
            state: self.state,
            state_message: self.state_message.clone(),
            firmware: self.firmware.clone(),
            motion: self.data.motion,
            heaters: self.data.heaters.clone(),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}
