use std::{
    collections::VecDeque,
    sync::Arc,
    time::Instant,
};

use thiserror::Error;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::oneshot,
};

use crate::util::console::ConsoleLog;

use super::parser;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SerialError {
    #[error("printer is not connected")]
    NotConnected,
    #[error("connection lost while the command was pending")]
    ConnectionLost,
    #[error("firmware did not answer the handshake in time")]
    HandshakeTimeout,
}

/// A single queued firmware interaction. Owned exclusively by the
/// channel from enqueue until its `ok` arrives; the caller holds only
/// the receiving half of `responder`.
#[derive(Debug)]
pub struct Command {
    pub text: String,
    pub important: bool,
    pub queued_at: Instant,
    pub sent_at: Option<Instant>,
    responder: Option<oneshot::Sender<Result<String, SerialError>>>,
}

impl Command {
    pub fn new(
        text: impl Into<String>,
        important: bool,
    ) -> (Command, oneshot::Receiver<Result<String, SerialError>>) {
        let (responder, receiver) = oneshot::channel();
        (Command::with_responder(text, important, responder), receiver)
    }

    pub fn with_responder(
        text: impl Into<String>,
        important: bool,
        responder: oneshot::Sender<Result<String, SerialError>>,
    ) -> Command {
        Command {
            text: text.into(),
            important,
            queued_at: Instant::now(),
            sent_at: None,
            responder: Some(responder),
        }
    }

    /// A query nobody awaits; the interesting lines of its response are
    /// consumed by line watchers and the rest is discarded.
    pub fn internal(text: impl Into<String>) -> Command {
        Command {
            text: text.into(),
            important: false,
            queued_at: Instant::now(),
            sent_at: None,
            responder: None,
        }
    }
}

struct InFlight {
    command: Command,
    response: Vec<String>,
}

/// Strict one-command-in-flight request/response discipline over a
/// line-oriented writer. The channel is `ready` exactly when no command
/// is awaiting its `ok` terminator; dispatch of the next queued command
/// happens synchronously on receipt of `ok`, before anything else can
/// observe the previous response.
pub struct SerialChannel<W> {
    writer: W,
    queue: VecDeque<Command>,
    current: Option<InFlight>,
    console: Arc<ConsoleLog>,
    dispatched: Vec<String>,
}

impl<W: AsyncWrite + Unpin> SerialChannel<W> {
    pub fn new(writer: W, console: Arc<ConsoleLog>) -> Self {
        SerialChannel {
            writer,
            queue: VecDeque::new(),
            current: None,
            console,
            dispatched: Vec::new(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.current.is_none()
    }
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
    pub fn in_flight_text(&self) -> Option<&str> {
        self.current.as_ref().map(|in_flight| in_flight.command.text.as_str())
    }

    /// Queue a command, important ones ahead of every not-yet-dispatched
    /// entry. An already-dispatched command is never preempted.
    pub async fn enqueue(&mut self, command: Command) -> Result<(), std::io::Error> {
        if command.important {
            self.queue.push_front(command);
        } else {
            self.queue.push_back(command);
        }
        self.dispatch_if_ready().await
    }

    async fn dispatch_if_ready(&mut self) -> Result<(), std::io::Error> {
        while self.current.is_none() {
            let mut command = match self.queue.pop_front() {
                Some(command) => command,
                None => break,
            };
            if command
                .responder
                .as_ref()
                .map_or(false, |responder| responder.is_closed())
            {
                continue; // caller gave up while queued
            }
            self.writer.write_all(command.text.as_bytes()).await?;
            self.writer.write_all(b"\n").await?;
            self.writer.flush().await?;
            command.sent_at = Some(Instant::now());
            self.console.sent(command.text.clone());
            self.dispatched.push(command.text.clone());
            self.current = Some(InFlight {
                command,
                response: Vec::new(),
            });
        }
        Ok(())
    }

    /// Feed one received line that no line consumer claimed. Returns the
    /// text of the command completed by this line, if it was an `ok`.
    pub async fn handle_line(&mut self, line: &str) -> Result<Option<String>, std::io::Error> {
        if !parser::is_ok(line) {
            if let Some(in_flight) = &mut self.current {
                in_flight.response.push(line.to_string());
            }
            // Chatter outside any exchange is dropped.
            return Ok(None);
        }
        match self.current.take() {
            None => Ok(None),
            Some(in_flight) => {
                let text = in_flight.command.text;
                if let Some(responder) = in_flight.command.responder {
                    drop(responder.send(Ok(in_flight.response.join("\n"))));
                }
                self.dispatch_if_ready().await?;
                Ok(Some(text))
            }
        }
    }

    /// Drain the texts written to the wire since the last call, in wire
    /// order. Lets the session inspect outbound traffic the moment it
    /// is sent rather than when the firmware acknowledges it.
    pub fn take_dispatched(&mut self) -> Vec<String> {
        std::mem::take(&mut self.dispatched)
    }

    /// Write a line to the firmware right now, outside the queue and the
    /// one-in-flight discipline. Marlin treats M112 specially in its
    /// receive buffer, so this is only for commands whose `ok` we do not
    /// intend to wait for.
    pub async fn write_immediate(&mut self, text: &str) -> Result<(), std::io::Error> {
        self.writer.write_all(text.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        self.console.sent(text.to_string());
        Ok(())
    }

    /// Tear-down path: every queued and in-flight caller gets the error
    /// rather than a silently dropped promise.
    pub fn fail_all(&mut self, error: SerialError) {
        if let Some(in_flight) = self.current.take() {
            if let Some(responder) = in_flight.command.responder {
                drop(responder.send(Err(error)));
            }
        }
        for command in self.queue.drain(..) {
            if let Some(responder) = command.responder {
                drop(responder.send(Err(error)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> SerialChannel<Vec<u8>> {
        SerialChannel::new(Vec::new(), Arc::new(ConsoleLog::new(64)))
    }

    fn written(channel: &SerialChannel<Vec<u8>>) -> Vec<String> {
        String::from_utf8(channel.writer.clone())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_one_command_in_flight() {
        let mut channel = channel();
        let (a, _ra) = Command::new("G28", false);
        let (b, _rb) = Command::new("G1 X10", false);
        channel.enqueue(a).await.unwrap();
        channel.enqueue(b).await.unwrap();
        // Only the first hits the wire until its ok arrives.
        assert_eq!(written(&channel), vec!["G28"]);
        assert_eq!(channel.queued(), 1);
        channel.handle_line("ok").await.unwrap();
        assert_eq!(written(&channel), vec!["G28", "G1 X10"]);
    }

    #[tokio::test]
    async fn test_responses_delivered_in_dispatch_order() {
        let mut channel = channel();
        let (a, ra) = Command::new("M114", false);
        let (b, rb) = Command::new("M105", false);
        channel.enqueue(a).await.unwrap();
        channel.enqueue(b).await.unwrap();
        channel.handle_line("X:0.00 Y:0.00 Z:0.00 E:0.00").await.unwrap();
        channel.handle_line("ok").await.unwrap();
        channel.handle_line("ok").await.unwrap();
        assert_eq!(ra.await.unwrap().unwrap(), "X:0.00 Y:0.00 Z:0.00 E:0.00");
        assert_eq!(rb.await.unwrap().unwrap(), "");
    }

    #[tokio::test]
    async fn test_important_jumps_undispatched_queue() {
        let mut channel = channel();
        let (a, _ra) = Command::new("A", false);
        let (b, _rb) = Command::new("B", false);
        let (c, _rc) = Command::new("C", false);
        let (urgent, _ru) = Command::new("M114", true);
        channel.enqueue(a).await.unwrap(); // dispatched immediately
        channel.enqueue(b).await.unwrap();
        channel.enqueue(c).await.unwrap();
        channel.enqueue(urgent).await.unwrap();
        for _ in 0..4 {
            channel.handle_line("ok").await.unwrap();
        }
        // Important jumps B and C but never the already-sent A.
        assert_eq!(written(&channel), vec!["A", "M114", "B", "C"]);
    }

    #[tokio::test]
    async fn test_response_excludes_ok_line() {
        let mut channel = channel();
        let (command, receiver) = Command::new("M119", false);
        channel.enqueue(command).await.unwrap();
        channel.handle_line("Reporting endstop status").await.unwrap();
        channel.handle_line("x_min: open").await.unwrap();
        channel.handle_line("ok").await.unwrap();
        assert_eq!(
            receiver.await.unwrap().unwrap(),
            "Reporting endstop status\nx_min: open"
        );
    }

    #[tokio::test]
    async fn test_fail_all_rejects_pending_callers() {
        let mut channel = channel();
        let (a, ra) = Command::new("G28", false);
        let (b, rb) = Command::new("G1 X5", false);
        channel.enqueue(a).await.unwrap();
        channel.enqueue(b).await.unwrap();
        channel.fail_all(SerialError::ConnectionLost);
        assert_eq!(ra.await.unwrap(), Err(SerialError::ConnectionLost));
        assert_eq!(rb.await.unwrap(), Err(SerialError::ConnectionLost));
        assert!(channel.is_ready());
        assert_eq!(channel.queued(), 0);
    }

    #[tokio::test]
    async fn test_internal_command_dispatches_without_listener() {
        let mut channel = channel();
        channel.enqueue(Command::internal("M105")).await.unwrap();
        assert_eq!(written(&channel), vec!["M105"]);
        assert_eq!(
            channel.handle_line("ok").await.unwrap(),
            Some("M105".to_string())
        );
        assert!(channel.is_ready());
    }

    #[tokio::test]
    async fn test_take_dispatched_follows_wire_order() {
        let mut channel = channel();
        let (a, _ra) = Command::new("G91", false);
        let (b, _rb) = Command::new("G1 X5", false);
        channel.enqueue(a).await.unwrap();
        channel.enqueue(b).await.unwrap();
        // Only the dispatched command is visible; the queued one is not.
        assert_eq!(channel.take_dispatched(), vec!["G91"]);
        channel.handle_line("ok").await.unwrap();
        assert_eq!(channel.take_dispatched(), vec!["G1 X5"]);
        assert!(channel.take_dispatched().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_caller_is_skipped() {
        let mut channel = channel();
        let (a, _ra) = Command::new("A", false);
        channel.enqueue(a).await.unwrap();
        let (b, rb) = Command::new("B", false);
        drop(rb);
        channel.enqueue(b).await.unwrap();
        let (c, _rc) = Command::new("C", false);
        channel.enqueue(c).await.unwrap();
        channel.handle_line("ok").await.unwrap();
        // B's caller went away before dispatch; it is never sent.
        assert_eq!(written(&channel), vec!["A", "C"]);
    }
}
