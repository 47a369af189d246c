//! Capture of formatted log lines for forwarding to API clients.

use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// One captured event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapLine {
    pub level: Level,
    pub target: String,
    /// The event message followed by any extra fields as `key=value`.
    pub message: String,
}

impl TapLine {
    /// `[W][nativeapi_server::connection]: message`
    pub fn format(&self) -> String {
        let letter = match self.level {
            Level::ERROR => 'E',
            Level::WARN => 'W',
            Level::INFO => 'I',
            Level::DEBUG => 'D',
            _ => 'V',
        };
        format!("[{letter}][{}]: {}", self.target, self.message)
    }
}

struct TapInner {
    lines: VecDeque<TapLine>,
    capacity: usize,
    max_level: Level,
    dropped: u64,
}

/// Bounded queue of captured lines, usable as a tracing [`Layer`].
///
/// When full, the oldest line is discarded. Events more verbose than
/// `max_level` (DEBUG by default) are ignored, which keeps packet-level
/// trace output from the forwarding path out of the queue.
#[derive(Clone)]
pub struct LogTap {
    inner: Arc<Mutex<TapInner>>,
}

impl fmt::Debug for LogTap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LogTap")
            .field("len", &inner.lines.len())
            .field("capacity", &inner.capacity)
            .field("max_level", &inner.max_level)
            .finish()
    }
}

impl LogTap {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TapInner {
                lines: VecDeque::with_capacity(capacity.min(1024)),
                capacity: capacity.max(1),
                max_level: Level::DEBUG,
                dropped: 0,
            })),
        }
    }

    pub fn with_max_level(self, level: Level) -> Self {
        self.inner.lock().max_level = level;
        self
    }

    /// Take every captured line, oldest first.
    pub fn drain(&self) -> Vec<TapLine> {
        self.inner.lock().lines.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().lines.is_empty()
    }

    /// Lines discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    pub fn push(&self, line: TapLine) {
        let mut inner = self.inner.lock();
        if line.level > inner.max_level {
            return;
        }
        if inner.lines.len() >= inner.capacity {
            inner.lines.pop_front();
            inner.dropped += 1;
        }
        inner.lines.push_back(line);
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for LogTap {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        visitor.message.push_str(&visitor.fields);
        self.push(TapLine {
            level: *metadata.level(),
            target: metadata.target().to_string(),
            message: visitor.message,
        });
    }
}
