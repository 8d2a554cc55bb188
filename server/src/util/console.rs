use std::{collections::VecDeque, sync::Mutex};

use chrono::{DateTime, Local};
use tokio::sync::broadcast;

/// One entry on the client-visible console: everything sent to the
/// firmware and every logically-surfaced line received from it.
#[derive(Clone, Debug)]
pub enum ConsoleEvent {
    Sent(DateTime<Local>, String),
    Received(DateTime<Local>, String),
    Warning(DateTime<Local>, String),
}

impl ConsoleEvent {
    pub fn render(&self) -> String {
        match self {
            ConsoleEvent::Sent(time, text) => format!("> {} {}", time.format("%H:%M:%S%.3f"), text),
            ConsoleEvent::Received(time, text) => {
                format!("< {} {}", time.format("%H:%M:%S%.3f"), text)
            }
            ConsoleEvent::Warning(time, text) => {
                format!("! {} {}", time.format("%H:%M:%S%.3f"), text)
            }
        }
    }
}

/// Bounded interaction log with history replay on subscribe. Live
/// delivery goes through a broadcast channel; late subscribers first get
/// the retained tail.
pub struct ConsoleLog {
    history: Mutex<VecDeque<ConsoleEvent>>,
    live: broadcast::Sender<ConsoleEvent>,
    capacity: usize,
}

impl ConsoleLog {
    pub fn new(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(capacity.max(16));
        ConsoleLog {
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            live,
            capacity,
        }
    }

    pub fn push(&self, event: ConsoleEvent) {
        {
            let mut history = self.history.lock().unwrap();
            if history.len() == self.capacity {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        drop(self.live.send(event)); // no subscribers is fine
    }

    pub fn sent(&self, text: impl Into<String>) {
        self.push(ConsoleEvent::Sent(Local::now(), text.into()));
    }
    pub fn received(&self, text: impl Into<String>) {
        self.push(ConsoleEvent::Received(Local::now(), text.into()));
    }
    pub fn warning(&self, text: impl Into<String>) {
        self.push(ConsoleEvent::Warning(Local::now(), text.into()));
    }

    /// History snapshot plus a live receiver. Events pushed between the
    /// snapshot and the first `recv` are not lost: the receiver is
    /// created under the same lock that guards the history.
    pub fn subscribe(&self) -> (Vec<ConsoleEvent>, broadcast::Receiver<ConsoleEvent>) {
        let history = self.history.lock().unwrap();
        (history.iter().cloned().collect(), self.live.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_bounded() {
        let log = ConsoleLog::new(3);
        for n in 0..5 {
            log.sent(format!("G{}", n));
        }
        let (history, _) = log.subscribe();
        let rendered: Vec<String> = history
            .iter()
            .map(|event| match event {
                ConsoleEvent::Sent(_, text) => text.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(rendered, vec!["G2", "G3", "G4"]);
    }

    #[tokio::test]
    async fn test_live_delivery() {
        let log = ConsoleLog::new(8);
        let (history, mut live) = log.subscribe();
        assert!(history.is_empty());
        log.received("ok");
        match live.recv().await.unwrap() {
            ConsoleEvent::Received(_, text) => assert_eq!(text, "ok"),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
