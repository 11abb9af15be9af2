//! In-memory ring of recent warn+ events.
//!
//! Dropped frames, late replies and rejected emits are all logged at WARN;
//! keeping the last few in memory lets a running process report them without
//! a log file.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::Level;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// One captured warn or error event.
#[derive(Clone, Debug)]
pub struct WarnRecord {
    /// When it was recorded.
    pub at: SystemTime,
    /// `WARN` or `ERROR`.
    pub level: Level,
    /// Module that emitted it.
    pub target: String,
    /// The event's message.
    pub message: String,
    /// `key=value` pairs in the order they were recorded.
    pub fields: Vec<(String, String)>,
}

impl WarnRecord {
    /// Value of field `name`.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Bounded buffer; oldest records are evicted first.
#[derive(Clone)]
pub struct RecentLog {
    inner: Arc<Mutex<VecDeque<WarnRecord>>>,
    capacity: usize,
}

impl RecentLog {
    /// Buffer keeping the last `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn push(&self, record: WarnRecord) {
        let mut inner = self.inner.lock();
        if inner.len() == self.capacity {
            let _ = inner.pop_front();
        }
        inner.push_back(record);
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<WarnRecord> {
        self.inner.lock().iter().cloned().collect()
    }

    /// Records currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether nothing is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every record.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

/// `tracing` layer feeding a [`RecentLog`].
pub struct RecentLogLayer {
    log: RecentLog,
}

impl RecentLogLayer {
    /// Layer writing into `log`.
    pub fn new(log: RecentLog) -> Self {
        Self { log }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Vec<(String, String)>,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let mut rendered = String::new();
        let _ = write!(rendered, "{value:?}");
        if field.name() == "message" {
            self.message = Some(rendered);
        } else {
            self.fields.push((field.name().to_string(), rendered));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }
}

impl<S: tracing::Subscriber> Layer<S> for RecentLogLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        self.log.push(WarnRecord {
            at: SystemTime::now(),
            level,
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields: visitor.fields,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn capture(capacity: usize, emit: impl FnOnce()) -> RecentLog {
        let log = RecentLog::new(capacity);
        let subscriber = tracing_subscriber::registry().with(RecentLogLayer::new(log.clone()));
        tracing::subscriber::with_default(subscriber, emit);
        log
    }

    #[test]
    fn keeps_warn_and_error_only() {
        let log = capture(8, || {
            tracing::info!("ignored");
            tracing::warn!(conn_id = "conn_1", "send queue full, dropping frame");
            tracing::error!("boom");
        });

        let records = log.snapshot();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message, "send queue full, dropping frame");
        assert_eq!(records[0].field("conn_id"), Some("conn_1"));
        assert_eq!(records[1].level, Level::ERROR);
    }

    #[test]
    fn evicts_oldest_when_full() {
        let log = capture(2, || {
            for i in 0..5 {
                tracing::warn!(i, "late reply");
            }
        });

        let records = log.snapshot();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].field("i"), Some("3"));
        assert_eq!(records[1].field("i"), Some("4"));
    }

    #[test]
    fn clear_empties_buffer() {
        let log = capture(4, || tracing::warn!("x"));
        assert_eq!(log.len(), 1);
        log.clear();
        assert!(log.is_empty());
    }
}
