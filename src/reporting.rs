use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::compiler::{Diagnostic, Diagnostics};
use crate::ids::ItemId;
use crate::lock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorFetch {
    /// No compile result appeared within the wait.
    NotFinished,
    Succeeded(Vec<Diagnostic>),
    Failed(Vec<Diagnostic>),
}

/// Collects compile results per item so callers can poll for them with a bounded wait. A
/// fetched result is consumed.
#[derive(Default)]
pub struct ErrorReporter {
    results: Mutex<HashMap<ItemId, Diagnostics>>,
    published: Condvar,
}

impl ErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets any earlier result so the next fetch waits for a fresh compile.
    pub fn begin(&self, item: ItemId) {
        lock(&self.results).remove(&item);
    }

    pub fn publish(&self, item: ItemId, diagnostics: Diagnostics) {
        lock(&self.results).insert(item, diagnostics);
        self.published.notify_all();
    }

    pub fn fetch(&self, item: ItemId, timeout: Duration) -> ErrorFetch {
        let deadline = Instant::now() + timeout;
        let mut results = lock(&self.results);
        loop {
            if let Some(diagnostics) = results.remove(&item) {
                return if diagnostics.success {
                    ErrorFetch::Succeeded(diagnostics.messages)
                } else {
                    ErrorFetch::Failed(diagnostics.messages)
                };
            }
            let now = Instant::now();
            if now >= deadline {
                return ErrorFetch::NotFinished;
            }
            results = match self.published.wait_timeout(results, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Drops an unfetched result of a script that is gone.
    pub fn forget(&self, item: ItemId) {
        lock(&self.results).remove(&item);
    }

    pub fn pending(&self) -> usize {
        lock(&self.results).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fetch_times_out_with_not_finished() {
        let reporter = ErrorReporter::new();
        let started = Instant::now();
        assert_eq!(reporter.fetch(ItemId::new(), Duration::from_millis(30)), ErrorFetch::NotFinished);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn fetch_wakes_when_a_result_is_published() {
        let reporter = Arc::new(ErrorReporter::new());
        let item = ItemId::new();
        let publisher = {
            let reporter = reporter.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                reporter.publish(item, Diagnostics::failed("unexpected end of input"));
            })
        };
        match reporter.fetch(item, Duration::from_secs(5)) {
            ErrorFetch::Failed(messages) => assert_eq!(messages[0].message, "unexpected end of input"),
            other => panic!("unexpected fetch result {other:?}"),
        }
        publisher.join().expect("publisher thread");
    }

    #[test]
    fn results_are_consumed_by_fetch_and_forget() {
        let reporter = ErrorReporter::new();
        let fetched = ItemId::new();
        let dropped = ItemId::new();
        reporter.publish(fetched, Diagnostics::ok());
        reporter.publish(dropped, Diagnostics::ok());
        assert_eq!(reporter.pending(), 2);

        assert_eq!(reporter.fetch(fetched, Duration::from_millis(10)), ErrorFetch::Succeeded(Vec::new()));
        assert_eq!(reporter.fetch(fetched, Duration::from_millis(10)), ErrorFetch::NotFinished);
        reporter.forget(dropped);
        assert_eq!(reporter.pending(), 0);
    }
}
