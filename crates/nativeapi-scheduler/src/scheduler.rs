//! Heap-ordered timer, interval and retry engine.
//!
//! All pending work lives in two containers guarded by one mutex: a min-heap
//! keyed by absolute deadline and a `to_add` staging list. Any thread may
//! schedule or cancel; only the main loop calls [`Scheduler::call`]. Callbacks
//! run with the lock released, so they are free to schedule and cancel.
//!
//! Cancellation never removes from the middle of the heap. It flips a
//! logical-delete flag; flagged items are dropped when they reach the root, or
//! in one sweep once more than [`MAX_LOGICALLY_DELETED_ITEMS`] pile up.

use std::borrow::Cow;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

use crate::clock::{Clock, MillisExtender};

/// Logically deleted items tolerated in the heap before a full sweep.
pub const MAX_LOGICALLY_DELETED_ITEMS: u32 = 10;

/// Passing this as a delay cancels the same-named item and schedules nothing.
pub const DONT_RUN: u32 = u32::MAX;

/// Callbacks running longer than this are reported.
const BLOCKING_WARN_THRESHOLD: Duration = Duration::from_millis(50);

/// Name of a scheduled item: either a `&'static str` or an owned copy.
///
/// Names are compared by content, so a caller may drop its own string right
/// after scheduling and still cancel later. An empty name is anonymous and
/// never matches a cancel.
pub type TimerName = Cow<'static, str>;

/// Boxed scheduler callback.
pub type Callback = Box<dyn FnMut() + Send>;

/// Something that owns scheduled work.
pub trait Component: Send + Sync {
    /// Short name used in diagnostics.
    fn source(&self) -> &str;

    /// Items owned by a failed component are dropped instead of run.
    fn is_failed(&self) -> bool {
        false
    }
}

/// Whether an item fires once or repeatedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    /// Runs once after its delay.
    Timeout,
    /// Re-armed after every run.
    Interval,
}

/// Verdict returned by a [`Scheduler::set_retry`] function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryResult {
    /// Stop retrying.
    Done,
    /// Try again after the next backoff interval.
    Retry,
}

struct SchedulerItem {
    component: Option<Arc<dyn Component>>,
    name: TimerName,
    item_type: ItemType,
    interval: u32,
    next_execution: u64,
    /// Insertion order; breaks ties between equal deadlines.
    seq: u64,
    /// Taken out while the callback runs without the lock held.
    callback: Option<Callback>,
    remove: bool,
}

impl SchedulerItem {
    fn runs_before(&self, other: &Self) -> bool {
        (self.next_execution, self.seq) < (other.next_execution, other.seq)
    }

    fn matches(&self, component: Option<&Arc<dyn Component>>, name: &str, item_type: ItemType) -> bool {
        !self.name.is_empty()
            && self.item_type == item_type
            && self.name == name
            && same_component(self.component.as_ref(), component)
    }

    fn source(&self) -> &str {
        self.component.as_ref().map_or("unknown", |c| c.source())
    }
}

fn same_component(a: Option<&Arc<dyn Component>>, b: Option<&Arc<dyn Component>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b)),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Heap state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Inner {
    /// Binary min-heap on `(next_execution, seq)`.
    items: Vec<SchedulerItem>,
    to_add: Vec<SchedulerItem>,
    /// Items in `items` flagged for removal but not yet popped.
    to_remove: u32,
    millis: MillisExtender,
    next_seq: u64,
}

impl Inner {
    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if !self.items[idx].runs_before(&self.items[parent]) {
                break;
            }
            self.items.swap(idx, parent);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.items.len();
        loop {
            let left = 2 * idx + 1;
            let right = left + 1;
            let mut first = idx;
            if left < len && self.items[left].runs_before(&self.items[first]) {
                first = left;
            }
            if right < len && self.items[right].runs_before(&self.items[first]) {
                first = right;
            }
            if first == idx {
                break;
            }
            self.items.swap(idx, first);
            idx = first;
        }
    }

    fn push_heap(&mut self, item: SchedulerItem) {
        self.items.push(item);
        let last = self.items.len() - 1;
        self.sift_up(last);
    }

    fn pop_root(&mut self) -> Option<SchedulerItem> {
        if self.items.is_empty() {
            return None;
        }
        let item = self.items.swap_remove(0);
        if !self.items.is_empty() {
            self.sift_down(0);
        }
        Some(item)
    }

    /// Drop logically deleted items sitting at the root.
    fn cleanup(&mut self) {
        while self.items.first().is_some_and(|item| item.remove) {
            self.pop_root();
            self.to_remove = self.to_remove.saturating_sub(1);
        }
    }

    fn process_to_add(&mut self) {
        let staged = std::mem::take(&mut self.to_add);
        for item in staged {
            if !item.remove {
                self.push_heap(item);
            }
        }
    }

    /// Rebuild the heap without its logically deleted entries.
    fn sweep(&mut self) {
        let before = self.items.len();
        self.items.retain(|item| !item.remove);
        for idx in (0..self.items.len() / 2).rev() {
            self.sift_down(idx);
        }
        tracing::debug!(
            "Swept {} cancelled scheduler items ({} remain)",
            before - self.items.len(),
            self.items.len()
        );
        self.to_remove = 0;
    }

    fn cancel(
        &mut self,
        component: Option<&Arc<dyn Component>>,
        name: &str,
        item_type: ItemType,
    ) -> bool {
        if name.is_empty() {
            return false;
        }
        let mut found = false;
        for item in &mut self.items {
            if !item.remove && item.matches(component, name, item_type) {
                item.remove = true;
                self.to_remove += 1;
                found = true;
            }
        }
        for item in &mut self.to_add {
            if !item.remove && item.matches(component, name, item_type) {
                item.remove = true;
                found = true;
            }
        }
        found
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

struct Shared {
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
}

impl Shared {
    fn now(&self, inner: &mut Inner) -> u64 {
        inner.millis.extend(self.clock.millis())
    }
}

/// Process-wide timer engine. Cloning yields another handle to the same heap.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl Scheduler {
    /// Create an empty scheduler reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                clock,
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    /// Run `callback` once after `timeout_ms`.
    ///
    /// A pending timeout with the same component and name is cancelled first.
    pub fn set_timeout(
        &self,
        component: Option<&Arc<dyn Component>>,
        name: impl Into<TimerName>,
        timeout_ms: u32,
        callback: impl FnMut() + Send + 'static,
    ) {
        self.set_timer_common(
            component,
            ItemType::Timeout,
            name.into(),
            timeout_ms,
            Box::new(callback),
        );
    }

    /// Run `callback` every `interval_ms`, starting after a random offset of
    /// up to half an interval.
    ///
    /// A pending interval with the same component and name is cancelled first.
    pub fn set_interval(
        &self,
        component: Option<&Arc<dyn Component>>,
        name: impl Into<TimerName>,
        interval_ms: u32,
        callback: impl FnMut() + Send + 'static,
    ) {
        self.set_timer_common(
            component,
            ItemType::Interval,
            name.into(),
            interval_ms,
            Box::new(callback),
        );
    }

    /// Cancel a pending timeout. Returns `false` if nothing matched.
    pub fn cancel_timeout(&self, component: Option<&Arc<dyn Component>>, name: &str) -> bool {
        self.shared
            .inner
            .lock()
            .cancel(component, name, ItemType::Timeout)
    }

    /// Cancel a pending interval. Returns `false` if nothing matched.
    pub fn cancel_interval(&self, component: Option<&Arc<dyn Component>>, name: &str) -> bool {
        self.shared
            .inner
            .lock()
            .cancel(component, name, ItemType::Interval)
    }

    /// Call `func` now, then keep calling it with a shrinking attempt budget
    /// until it returns [`RetryResult::Done`] or `max_attempts` runs are used.
    ///
    /// The second run happens `initial_wait_ms` after the first; every later
    /// wait is the previous one multiplied by `backoff_increase_factor`. The
    /// argument passed to `func` is the number of attempts left after this one.
    /// A `max_attempts` of 0 schedules nothing.
    pub fn set_retry(
        &self,
        component: Option<&Arc<dyn Component>>,
        name: &str,
        initial_wait_ms: u32,
        max_attempts: u8,
        func: impl FnMut(u8) -> RetryResult + Send + 'static,
        backoff_increase_factor: f32,
    ) {
        if !name.is_empty() {
            self.cancel_retry(component, name);
        }
        if initial_wait_ms == DONT_RUN || max_attempts == 0 {
            return;
        }

        let factor = if backoff_increase_factor < 0.0001 {
            tracing::error!(
                "set_retry(name='{name}'): backoff factor cannot be close to zero nor negative ({backoff_increase_factor:.1}), using 1.0"
            );
            1.0
        } else {
            backoff_increase_factor
        };

        let args = Arc::new(Mutex::new(RetryArgs {
            func: Box::new(func),
            countdown: max_attempts,
            current_interval: initial_wait_ms,
            backoff_increase_factor: factor,
            component: component.cloned(),
            name: retry_name(name),
        }));
        let name = args.lock().name.clone();
        let weak = Arc::downgrade(&self.shared);
        self.set_timeout(component, name, 0, move || run_retry(&weak, &args));
    }

    /// Cancel a retry started with [`Scheduler::set_retry`].
    pub fn cancel_retry(&self, component: Option<&Arc<dyn Component>>, name: &str) -> bool {
        self.cancel_timeout(component, &retry_name(name))
    }

    /// Milliseconds until the earliest pending deadline, `Some(0)` if it is
    /// already due, `None` when nothing is scheduled in the heap.
    pub fn next_schedule_in(&self) -> Option<u32> {
        let mut inner = self.shared.inner.lock();
        inner.cleanup();
        let now = self.shared.now(&mut inner);
        let next = inner.items.first()?.next_execution;
        Some(u32::try_from(next.saturating_sub(now)).unwrap_or(u32::MAX))
    }

    /// Number of items held, including staged and logically deleted ones.
    pub fn size(&self) -> usize {
        let inner = self.shared.inner.lock();
        inner.items.len() + inner.to_add.len()
    }

    /// Whether no live item is pending. Deleted items at the root are dropped first.
    pub fn is_empty(&self) -> bool {
        let mut inner = self.shared.inner.lock();
        inner.cleanup();
        inner.items.is_empty() && inner.to_add.iter().all(|item| item.remove)
    }

    /// Run every item whose deadline has passed.
    ///
    /// Must only be called from the main loop thread.
    pub fn call(&self) {
        let now = {
            let mut inner = self.shared.inner.lock();
            let now = self.shared.now(&mut inner);
            inner.process_to_add();
            if inner.to_remove > MAX_LOGICALLY_DELETED_ITEMS {
                inner.sweep();
            }
            now
        };

        loop {
            let mut inner = self.shared.inner.lock();
            inner.cleanup();
            let Some(root) = inner.items.first_mut() else {
                break;
            };
            if root.next_execution > now {
                break;
            }
            if root.component.as_ref().is_some_and(|c| c.is_failed()) {
                inner.pop_root();
                continue;
            }

            let seq = root.seq;
            let mut callback = root.callback.take();
            let label = format!("{}/{}", root.source(), root.name);
            drop(inner);

            // The item stays at the root while its callback runs, so a cancel
            // issued from inside the callback still finds and flags it.
            if let Some(run) = callback.as_mut() {
                let guard = BlockingGuard::start(&label);
                run();
                guard.finish();
            }

            let mut inner = self.shared.inner.lock();
            // A cancelled root may already have been dropped by `cleanup`.
            if inner.items.first().is_none_or(|root| root.seq != seq) {
                continue;
            }
            let Some(mut item) = inner.pop_root() else {
                break;
            };
            if item.remove {
                inner.to_remove = inner.to_remove.saturating_sub(1);
                continue;
            }
            if item.item_type == ItemType::Interval {
                item.next_execution = now + u64::from(item.interval);
                item.callback = callback;
                inner.to_add.push(item);
            }
        }

        self.shared.inner.lock().process_to_add();
    }

    fn set_timer_common(
        &self,
        component: Option<&Arc<dyn Component>>,
        item_type: ItemType,
        name: TimerName,
        delay: u32,
        callback: Callback,
    ) {
        let mut inner = self.shared.inner.lock();
        if !name.is_empty() {
            inner.cancel(component, &name, item_type);
        }
        if delay == DONT_RUN {
            return;
        }

        let now = self.shared.now(&mut inner);
        let (interval, next_execution) = match item_type {
            ItemType::Interval => {
                let offset = if delay != 0 {
                    rand::rng().random_range(0..delay) / 2
                } else {
                    0
                };
                (delay, now + u64::from(offset))
            }
            ItemType::Timeout => (0, now + u64::from(delay)),
        };

        let seq = inner.next_seq;
        inner.next_seq += 1;
        tracing::trace!("set_{item_type:?}(name='{name}', delay={delay}ms)");
        inner.to_add.push(SchedulerItem {
            component: component.cloned(),
            name,
            item_type,
            interval,
            next_execution,
            seq,
            callback: Some(callback),
            remove: false,
        });
    }
}

// --- Retry ---

struct RetryArgs {
    func: Box<dyn FnMut(u8) -> RetryResult + Send>,
    countdown: u8,
    current_interval: u32,
    backoff_increase_factor: f32,
    component: Option<Arc<dyn Component>>,
    name: String,
}

fn retry_name(name: &str) -> String {
    format!("retry${name}")
}

fn run_retry(shared: &Weak<Shared>, args: &Arc<Mutex<RetryArgs>>) {
    let mut state = args.lock();
    state.countdown = state.countdown.saturating_sub(1);
    let countdown = state.countdown;
    if (state.func)(countdown) == RetryResult::Done || countdown == 0 {
        return;
    }
    let Some(shared) = shared.upgrade() else {
        return;
    };

    let wait = state.current_interval;
    state.current_interval = (wait as f32 * state.backoff_increase_factor) as u32;
    let component = state.component.clone();
    let name = state.name.clone();
    drop(state);

    let scheduler = Scheduler { shared };
    let weak = Arc::downgrade(&scheduler.shared);
    let args = Arc::clone(args);
    scheduler.set_timeout(component.as_ref(), name, wait, move || {
        run_retry(&weak, &args)
    });
}

// --- Diagnostics ---

struct BlockingGuard<'a> {
    label: &'a str,
    started: Instant,
}

impl<'a> BlockingGuard<'a> {
    fn start(label: &'a str) -> Self {
        Self {
            label,
            started: Instant::now(),
        }
    }

    fn finish(self) {
        let elapsed = self.started.elapsed();
        if elapsed > BLOCKING_WARN_THRESHOLD {
            tracing::warn!(
                "{} took a long time for an operation ({} ms), max is {} ms",
                self.label,
                elapsed.as_millis(),
                BLOCKING_WARN_THRESHOLD.as_millis()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn scheduler_at(start: u32) -> (Scheduler, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start));
        (Scheduler::new(clock.clone()), clock)
    }

    fn recorder() -> (Arc<Mutex<Vec<u32>>>, impl Fn(u32) -> Box<dyn FnMut() + Send>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |tag: u32| -> Box<dyn FnMut() + Send> {
            let sink = Arc::clone(&sink);
            Box::new(move || sink.lock().push(tag))
        };
        (log, make)
    }

    struct TestComponent {
        failed: AtomicBool,
    }

    impl Component for TestComponent {
        fn source(&self) -> &str {
            "test"
        }

        fn is_failed(&self) -> bool {
            self.failed.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_timeout_fires_once_at_deadline() {
        let (sched, clock) = scheduler_at(1_000);
        let (log, make) = recorder();
        sched.set_timeout(None, "t", 100, make(1));

        sched.call();
        clock.advance(99);
        sched.call();
        assert!(log.lock().is_empty());

        clock.advance(1);
        sched.call();
        clock.advance(500);
        sched.call();
        assert_eq!(*log.lock(), vec![1]);
        assert_eq!(sched.size(), 0);
    }

    #[test]
    fn test_timeouts_run_in_deadline_order() {
        let (sched, clock) = scheduler_at(0);
        let (log, make) = recorder();
        sched.set_timeout(None, "", 30, make(30));
        sched.set_timeout(None, "", 10, make(10));
        sched.set_timeout(None, "", 20, make(20));

        clock.advance(50);
        sched.call();
        assert_eq!(*log.lock(), vec![10, 20, 30]);
    }

    #[test]
    fn test_same_name_replaces_previous_timeout() {
        let (sched, clock) = scheduler_at(0);
        let (log, make) = recorder();
        sched.set_timeout(None, "restart", 10, make(1));
        sched.set_timeout(None, "restart", 20, make(2));

        clock.advance(100);
        sched.call();
        assert_eq!(*log.lock(), vec![2]);
    }

    #[test]
    fn test_owned_name_cancels_after_caller_string_dropped() {
        let (sched, clock) = scheduler_at(0);
        let (log, make) = recorder();
        {
            let name = String::from("dynamic-name");
            sched.set_timeout(None, name.clone(), 10, make(1));
        }
        let lookup = format!("dynamic-{}", "name");
        assert!(sched.cancel_timeout(None, &lookup));

        clock.advance(20);
        sched.call();
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let (sched, clock) = scheduler_at(0);
        let (log, make) = recorder();
        sched.set_timeout(None, "keep", 10, make(1));
        sched.set_timeout(None, "drop", 10, make(2));

        assert!(!sched.cancel_timeout(None, "missing"));
        assert!(sched.cancel_timeout(None, "drop"));
        assert!(!sched.cancel_timeout(None, "drop"));
        assert!(!sched.cancel_interval(None, "keep"));
        assert!(!sched.cancel_timeout(None, ""));

        clock.advance(10);
        sched.call();
        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn test_cancel_matches_component() {
        let (sched, clock) = scheduler_at(0);
        let (log, make) = recorder();
        let a: Arc<dyn Component> = Arc::new(TestComponent {
            failed: AtomicBool::new(false),
        });
        let b: Arc<dyn Component> = Arc::new(TestComponent {
            failed: AtomicBool::new(false),
        });
        sched.set_timeout(Some(&a), "shared", 10, make(1));
        sched.set_timeout(Some(&b), "shared", 10, make(2));

        assert!(sched.cancel_timeout(Some(&a), "shared"));
        clock.advance(10);
        sched.call();
        assert_eq!(*log.lock(), vec![2]);
    }

    #[test]
    fn test_interval_repeats() {
        let (sched, clock) = scheduler_at(0);
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        sched.set_interval(None, "tick", 100, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        // Initial offset is below half an interval.
        for _ in 0..10 {
            clock.advance(50);
            sched.call();
        }
        let runs = count.load(Ordering::SeqCst);
        assert!((4..=5).contains(&runs), "ran {runs} times in 500ms");
        assert_eq!(sched.size(), 1);
    }

    #[test]
    fn test_interval_cancelled_from_own_callback_is_not_rearmed() {
        let (sched, clock) = scheduler_at(0);
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let handle = sched.clone();
        sched.set_interval(None, "self-cancel", 10, move || {
            c.fetch_add(1, Ordering::SeqCst);
            handle.cancel_interval(None, "self-cancel");
        });

        for _ in 0..5 {
            clock.advance(10);
            sched.call();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(sched.size(), 0);
    }

    #[test]
    fn test_callback_can_schedule_more_work() {
        let (sched, _clock) = scheduler_at(0);
        let (log, make) = recorder();
        let handle = sched.clone();
        let follow_up = Mutex::new(Some(make(2)));
        let mut first = make(1);
        sched.set_timeout(None, "outer", 0, move || {
            first();
            if let Some(cb) = follow_up.lock().take() {
                handle.set_timeout(None, "inner", 0, cb);
            }
        });

        sched.call();
        assert_eq!(*log.lock(), vec![1]);
        sched.call();
        assert_eq!(*log.lock(), vec![1, 2]);
        assert_eq!(sched.size(), 0);
    }

    #[test]
    fn test_failed_component_items_are_dropped() {
        let (sched, clock) = scheduler_at(0);
        let (log, make) = recorder();
        let component = Arc::new(TestComponent {
            failed: AtomicBool::new(false),
        });
        let dyn_component: Arc<dyn Component> = component.clone();
        sched.set_timeout(Some(&dyn_component), "t", 10, make(1));

        component.failed.store(true, Ordering::SeqCst);
        clock.advance(10);
        sched.call();
        assert!(log.lock().is_empty());
        assert_eq!(sched.size(), 0);
    }

    #[test]
    fn test_bulk_cancel_before_merge() {
        let (sched, clock) = scheduler_at(0);
        let (log, make) = recorder();
        for i in 0..25 {
            sched.set_timeout(None, format!("bulk_{i}"), 1_000 + i, make(i));
        }
        for i in 0..25 {
            assert!(sched.cancel_timeout(None, &format!("bulk_{i}")));
        }

        assert!(sched.is_empty());
        sched.call();
        assert_eq!(sched.size(), 0);
        clock.advance(5_000);
        sched.call();
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_bulk_cancel_after_merge_triggers_sweep() {
        let (sched, clock) = scheduler_at(0);
        let (log, make) = recorder();
        sched.set_timeout(None, "survivor", 10_000, make(99));
        for i in 0..25 {
            sched.set_timeout(None, format!("bulk_{i}"), 1_000 + i, make(i));
        }
        sched.call();
        assert_eq!(sched.size(), 26);

        for i in 0..25 {
            sched.cancel_timeout(None, &format!("bulk_{i}"));
        }
        // Still physically present until the next tick.
        assert_eq!(sched.size(), 26);

        sched.call();
        assert_eq!(sched.size(), 1);

        clock.advance(10_000);
        sched.call();
        assert_eq!(*log.lock(), vec![99]);
        assert_eq!(sched.size(), 0);
    }

    #[test]
    fn test_next_schedule_in() {
        let (sched, clock) = scheduler_at(0);
        assert_eq!(sched.next_schedule_in(), None);

        sched.set_timeout(None, "a", 250, || {});
        // Staged items are not visible until merged.
        assert_eq!(sched.next_schedule_in(), None);
        sched.call();
        assert_eq!(sched.next_schedule_in(), Some(250));

        clock.advance(100);
        assert_eq!(sched.next_schedule_in(), Some(150));
        clock.advance(1_000);
        assert_eq!(sched.next_schedule_in(), Some(0));
    }

    #[test]
    fn test_dont_run_only_cancels() {
        let (sched, clock) = scheduler_at(0);
        let (log, make) = recorder();
        sched.set_timeout(None, "x", 10, make(1));
        sched.set_timeout(None, "x", DONT_RUN, make(2));

        clock.advance(100);
        sched.call();
        assert!(log.lock().is_empty());
        assert_eq!(sched.size(), 0);
    }

    #[test]
    fn test_timeout_across_rollover() {
        let (sched, clock) = scheduler_at(u32::MAX - 10);
        let (log, make) = recorder();
        sched.set_timeout(None, "wrap", 20, make(1));
        sched.call();

        clock.advance(15);
        sched.call();
        assert!(log.lock().is_empty());

        clock.advance(5);
        sched.call();
        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn test_retry_backoff_schedule() {
        let (sched, clock) = scheduler_at(0);
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&calls);
        let timer = Arc::clone(&clock);
        sched.set_retry(
            None,
            "connect",
            100,
            4,
            move |remaining| {
                seen.lock().push((timer.millis(), remaining));
                RetryResult::Retry
            },
            2.0,
        );

        for _ in 0..100 {
            sched.call();
            clock.advance(10);
        }
        assert_eq!(*calls.lock(), vec![(0, 3), (100, 2), (300, 1), (700, 0)]);
        assert_eq!(sched.size(), 0);
    }

    #[test]
    fn test_retry_stops_when_done() {
        let (sched, clock) = scheduler_at(0);
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        sched.set_retry(
            None,
            "handshake",
            10,
            10,
            move |_| {
                if c.fetch_add(1, Ordering::SeqCst) == 1 {
                    RetryResult::Done
                } else {
                    RetryResult::Retry
                }
            },
            1.0,
        );

        for _ in 0..50 {
            sched.call();
            clock.advance(10);
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_retry_zero_attempts_never_runs() {
        let (sched, clock) = scheduler_at(0);
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        sched.set_retry(
            None,
            "zero",
            10,
            0,
            move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                RetryResult::Retry
            },
            1.0,
        );
        assert_eq!(sched.size(), 0);

        for _ in 0..20 {
            sched.call();
            clock.advance(10);
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_retry_zero_factor_falls_back_to_one() {
        let (sched, clock) = scheduler_at(0);
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&stamps);
        let timer = Arc::clone(&clock);
        sched.set_retry(
            None,
            "flat",
            50,
            3,
            move |_| {
                seen.lock().push(timer.millis());
                RetryResult::Retry
            },
            0.0,
        );

        for _ in 0..30 {
            sched.call();
            clock.advance(10);
        }
        assert_eq!(*stamps.lock(), vec![0, 50, 100]);
    }

    #[test]
    fn test_cancel_retry() {
        let (sched, clock) = scheduler_at(0);
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        sched.set_retry(
            None,
            "job",
            10,
            5,
            move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                RetryResult::Retry
            },
            1.0,
        );
        sched.call();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(sched.cancel_retry(None, "job"));
        for _ in 0..10 {
            clock.advance(10);
            sched.call();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_schedule_from_other_thread() {
        let (sched, clock) = scheduler_at(0);
        let count = Arc::new(AtomicU32::new(0));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let sched = sched.clone();
                let count = Arc::clone(&count);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let count = Arc::clone(&count);
                        sched.set_timeout(None, format!("t{t}_{i}"), 5, move || {
                            count.fetch_add(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        clock.advance(5);
        sched.call();
        assert_eq!(count.load(Ordering::SeqCst), 100);
    }

    proptest! {
        #[test]
        fn test_distinct_deadlines_run_in_order(delays in proptest::collection::hash_set(0u32..10_000, 1..40)) {
            let (sched, clock) = scheduler_at(0);
            let (log, make) = recorder();
            for &d in &delays {
                sched.set_timeout(None, "", d, make(d));
            }
            clock.advance(10_000);
            sched.call();

            let ran = log.lock().clone();
            let mut expected: Vec<u32> = delays.into_iter().collect();
            expected.sort_unstable();
            prop_assert_eq!(ran, expected);
        }
    }
}
