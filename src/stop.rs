//! Stop predicates.
//!
//! A stop predicate is evaluated before every record of a partition, and once
//! with `None` whenever the partition has no further record available. It is
//! the only cancellation mechanism of a consumption call.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::event::Event;

/// Shared stop predicate. `None` is the idle sentinel.
pub type StopPredicate<T> = Arc<dyn Fn(Option<&Event<T>>) -> bool + Send + Sync>;

/// Wrap a closure as a [`StopPredicate`].
pub fn predicate<T>(f: impl Fn(Option<&Event<T>>) -> bool + Send + Sync + 'static) -> StopPredicate<T> {
    Arc::new(f)
}

/// Never stops. Used for full snapshot replay.
pub fn never<T>() -> StopPredicate<T> {
    Arc::new(|_| false)
}

/// Stops a partition as soon as it has no record available.
pub fn when_caught_up<T>() -> StopPredicate<T> {
    Arc::new(|event| event.is_none())
}

/// Stops a partition when it is idle or an event is less than `lag` behind
/// the head of the partition. The triggering event is not consumed.
pub fn when_lag_below<T>(lag: Duration) -> StopPredicate<T> {
    Arc::new(move |event| event.is_none_or(|e| e.lag() < lag))
}

/// Stops every partition once `n` events have been let through in total.
///
/// The counter is shared by all partitions the predicate is handed to.
pub fn after_events<T>(n: u64) -> StopPredicate<T> {
    let seen = AtomicU64::new(0);
    Arc::new(move |event| match event {
        Some(_) => seen.fetch_add(1, Ordering::AcqRel) >= n,
        None => seen.load(Ordering::Acquire) >= n,
    })
}

/// Stops once `flag` is set, regardless of the event.
///
/// Lets a caller layer an external cancellation signal or a deadline on top
/// of any consumption call.
pub fn flag<T>(flag: Arc<AtomicBool>) -> StopPredicate<T> {
    Arc::new(move |_| flag.load(Ordering::Acquire))
}

/// Stops when either predicate stops.
pub fn or<T: 'static>(a: StopPredicate<T>, b: StopPredicate<T>) -> StopPredicate<T> {
    Arc::new(move |event| a(event) || b(event))
}
