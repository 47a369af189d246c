//! Cooperative timer scheduler shared by every component of the device.
//!
//! Timeouts, intervals and backoff retries are kept in one min-heap ordered by
//! absolute deadline. Scheduling and cancelling are thread-safe; execution
//! happens on the main loop through [`Scheduler::call`].

mod clock;
mod scheduler;

pub use clock::{Clock, ManualClock, MillisExtender, SystemClock};
pub use scheduler::{
    Callback, Component, DONT_RUN, ItemType, MAX_LOGICALLY_DELETED_ITEMS, RetryResult,
    Scheduler, TimerName,
};
