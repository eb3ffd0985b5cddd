//! Contains the in-memory log buffer the `status` view and the shell read
//! recent activity from, and the tracing layer that fills it.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::Subscriber;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

pub const DEFAULT_CAPACITY: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Added(String),
    Cleared,
}

/// Bounded ring buffer of `HH:MM:SS: message` lines. Clones share the same
/// storage.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
    events: broadcast::Sender<LogEvent>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(64);
        Self { lines: Arc::new(Mutex::new(VecDeque::new())), capacity: capacity.max(1), events }
    }

    pub fn push(&self, message: &str) {
        let line = format!("{}: {}", chrono::Local::now().format("%H:%M:%S"), message);
        if let Ok(mut lines) = self.lines.lock() {
            lines.push_back(line.clone());
            while lines.len() > self.capacity {
                lines.pop_front();
            }
        }
        // no subscribers is fine
        let _ = self.events.send(LogEvent::Added(line));
    }

    pub fn clear(&self) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.clear();
        }
        let _ = self.events.send(LogEvent::Cleared);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.lock().map(|lines| lines.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().map(|lines| lines.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.events.subscribe()
    }
}

/// Takes whatever `events` has queued without waiting. Lines the receiver
/// fell behind on are skipped.
pub fn pending(events: &mut broadcast::Receiver<LogEvent>) -> Vec<LogEvent> {
    let mut pending = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => pending.push(event),
            Err(TryRecvError::Lagged(skipped)) => {
                pending.push(LogEvent::Added(format!("... {} log lines skipped", skipped)));
            }
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    pending
}

/// Copies the message of every event that passes the subscriber's filter
/// into a [`LogBuffer`].
pub struct LogBufferLayer {
    buffer: LogBuffer,
}

impl LogBufferLayer {
    pub fn new(buffer: LogBuffer) -> Self {
        Self { buffer }
    }
}

struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}

impl<S> Layer<S> for LogBufferLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor { message: String::new() };
        event.record(&mut visitor);
        self.buffer.push(&format!("[{}] {}", event.metadata().level(), visitor.message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn is_timestamped(line: &str) -> bool {
        let bytes = line.as_bytes();
        line.len() > 10 && bytes[2] == b':' && bytes[5] == b':' && &line[8..10] == ": "
    }

    #[test]
    fn keeps_only_the_newest_lines() {
        let buffer = LogBuffer::new(3);
        for i in 0..5 {
            buffer.push(&format!("line {}", i));
        }
        let lines = buffer.snapshot();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with(": line 2"));
        assert!(lines[2].ends_with(": line 4"));
        assert!(lines.iter().all(|l| is_timestamped(l)));
    }

    #[test]
    fn subscribers_see_additions_and_clears() {
        let buffer = LogBuffer::default();
        let mut events = buffer.subscribe();
        buffer.push("Session ID: 42");
        buffer.clear();
        match events.try_recv().unwrap() {
            LogEvent::Added(line) => assert!(line.ends_with(": Session ID: 42")),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(events.try_recv().unwrap(), LogEvent::Cleared);
        assert!(buffer.is_empty());
    }

    #[test]
    fn pending_drains_without_blocking_and_reports_lag() {
        let buffer = LogBuffer::default();
        let mut events = buffer.subscribe();
        assert!(pending(&mut events).is_empty());
        for i in 0..70 {
            buffer.push(&format!("line {}", i));
        }
        let drained = pending(&mut events);
        assert_eq!(drained.len(), 65);
        assert_eq!(drained[0], LogEvent::Added("... 6 log lines skipped".to_string()));
        match drained.last().unwrap() {
            LogEvent::Added(line) => assert!(line.ends_with(": line 69")),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(pending(&mut events).is_empty());
    }

    #[test]
    fn layer_captures_tracing_events() {
        let buffer = LogBuffer::default();
        let subscriber = tracing_subscriber::registry().with(LogBufferLayer::new(buffer.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("created install session {}", 7);
        });
        let lines = buffer.snapshot();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with(": [INFO] created install session 7"));
    }
}
