use crossbeam_channel::Sender;

use karst_types::mac::Mac;

/// Structured progress events emitted during backup and check. Consumers
/// (CLI, TUI) subscribe through a channel; a missing subscriber drops the
/// events silently.
#[derive(Debug, Clone)]
pub enum Event {
    ImporterStarted {
        snapshot: Mac,
    },
    ImporterDone {
        snapshot: Mac,
        files: u64,
        directories: u64,
        size: u64,
    },
    Path {
        snapshot: Mac,
        pathname: String,
    },
    File {
        snapshot: Mac,
        pathname: String,
    },
    FileOk {
        snapshot: Mac,
        pathname: String,
        size: u64,
    },
    DirectoryOk {
        snapshot: Mac,
        pathname: String,
    },
    PathError {
        snapshot: Mac,
        pathname: String,
        message: String,
    },
    Warning {
        snapshot: Mac,
        message: String,
    },
    CheckBlobOk {
        snapshot: Mac,
        pathname: String,
    },
    CheckBlobFailed {
        snapshot: Mac,
        pathname: String,
        message: String,
    },
}

/// Best-effort event fan-out. Cloneable so every worker can emit.
#[derive(Clone, Default)]
pub struct EventBus {
    sender: Option<Sender<Event>>,
}

impl EventBus {
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn new(sender: Sender<Event>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    pub fn send(&self, event: Event) {
        if let Some(sender) = &self.sender {
            let _ = sender.try_send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_bus_drops_events() {
        let bus = EventBus::disabled();
        bus.send(Event::Warning {
            snapshot: Mac([0; 32]),
            message: "nobody listens".into(),
        });
    }

    #[test]
    fn events_reach_subscriber() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let bus = EventBus::new(tx);
        bus.send(Event::File {
            snapshot: Mac([1; 32]),
            pathname: "/a".into(),
        });
        assert!(matches!(rx.recv().unwrap(), Event::File { .. }));
    }
}
