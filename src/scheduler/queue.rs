use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::events::{PriorityClass, QueueItem};
use crate::ids::ItemId;
use crate::lifecycle::LifecycleRequest;
use crate::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Listing {
    Unlisted,
    Ready(PriorityClass),
    Delayed,
}

/// Pending work of one instance.
struct Mailbox {
    events: [VecDeque<QueueItem>; PriorityClass::COUNT],
    lifecycle: VecDeque<LifecycleRequest>,
    event_in_flight: bool,
    lifecycle_in_flight: bool,
    /// Suspended or stopped: events are kept but not dispatched.
    held: bool,
    not_before: Option<Instant>,
    listing: Listing,
    maintenance_listed: bool,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            events: Default::default(),
            lifecycle: VecDeque::new(),
            event_in_flight: false,
            lifecycle_in_flight: false,
            held: false,
            not_before: None,
            listing: Listing::Unlisted,
            maintenance_listed: false,
        }
    }

    fn highest_class(&self) -> Option<PriorityClass> {
        PriorityClass::ALL.into_iter().find(|class| !self.events[class.index()].is_empty())
    }

    fn queued_events(&self) -> usize {
        self.events.iter().map(VecDeque::len).sum()
    }

    /// Events could run now, ignoring rate limits and the global switch.
    fn events_runnable(&self) -> bool {
        !self.held && !self.event_in_flight && !self.lifecycle_in_flight && self.lifecycle.is_empty()
    }

    fn discard_events(&mut self) -> usize {
        let discarded = self.queued_events();
        for class in &mut self.events {
            class.clear();
        }
        discarded
    }
}

pub(crate) enum MaintenanceJob {
    Lifecycle(ItemId, LifecycleRequest),
    /// Periodic domain recycling and plugin checks.
    Pass,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub events: usize,
    pub lifecycle: usize,
    pub delayed: usize,
    pub in_flight: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub idle: usize,
}

struct QueueState {
    mailboxes: HashMap<ItemId, Mailbox>,
    ready: [VecDeque<ItemId>; PriorityClass::COUNT],
    maintenance_ready: VecDeque<ItemId>,
    delayed: BinaryHeap<Reverse<(Instant, u64, ItemId)>>,
    delay_seq: u64,
    enabled: bool,
    shut_down: bool,
    in_flight: usize,
    execution_idle: usize,
    maintenance_idle: usize,
    last_pass: Instant,
    pass_running: bool,
}

impl QueueState {
    /// Recomputes where `item` sits in the ready buckets. Returns true when it is dispatchable now.
    fn relist(&mut self, item: ItemId, now: Instant) -> bool {
        let Some(mailbox) = self.mailboxes.get_mut(&item) else {
            return false;
        };
        if !mailbox.events_runnable() {
            return false;
        }
        let Some(class) = mailbox.highest_class() else {
            return false;
        };
        if let Some(at) = mailbox.not_before.filter(|at| *at > now) {
            if mailbox.listing != Listing::Delayed {
                mailbox.listing = Listing::Delayed;
                self.delay_seq += 1;
                self.delayed.push(Reverse((at, self.delay_seq, item)));
            }
            return false;
        }
        mailbox.not_before = None;
        match mailbox.listing {
            Listing::Ready(listed) if listed <= class => {}
            _ => {
                mailbox.listing = Listing::Ready(class);
                self.ready[class.index()].push_back(item);
            }
        }
        true
    }

    fn relist_maintenance(&mut self, item: ItemId) -> bool {
        let Some(mailbox) = self.mailboxes.get_mut(&item) else {
            return false;
        };
        if mailbox.lifecycle_in_flight || mailbox.lifecycle.is_empty() || mailbox.maintenance_listed {
            return false;
        }
        mailbox.maintenance_listed = true;
        self.maintenance_ready.push_back(item);
        true
    }

    fn promote_delayed(&mut self, now: Instant) {
        while let Some(Reverse((at, _, item))) = self.delayed.peek().copied() {
            if at > now {
                break;
            }
            self.delayed.pop();
            let Some(mailbox) = self.mailboxes.get_mut(&item) else {
                continue;
            };
            if mailbox.listing == Listing::Delayed {
                mailbox.listing = Listing::Unlisted;
                self.relist(item, now);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.delayed.peek().map(|Reverse((at, _, _))| *at)
    }

    fn take_event(&mut self, now: Instant) -> Option<QueueItem> {
        for class in PriorityClass::ALL {
            while let Some(item) = self.ready[class.index()].pop_front() {
                let Some(mailbox) = self.mailboxes.get_mut(&item) else {
                    continue;
                };
                if mailbox.listing != Listing::Ready(class) {
                    continue;
                }
                mailbox.listing = Listing::Unlisted;
                if !mailbox.events_runnable() || mailbox.not_before.is_some_and(|at| at > now) {
                    self.relist(item, now);
                    continue;
                }
                let Some(highest) = mailbox.highest_class() else {
                    continue;
                };
                let Some(event) = mailbox.events[highest.index()].pop_front() else {
                    continue;
                };
                mailbox.event_in_flight = true;
                self.in_flight += 1;
                return Some(event);
            }
        }
        None
    }

    fn take_lifecycle(&mut self) -> Option<(ItemId, LifecycleRequest)> {
        while let Some(item) = self.maintenance_ready.pop_front() {
            let Some(mailbox) = self.mailboxes.get_mut(&item) else {
                continue;
            };
            mailbox.maintenance_listed = false;
            if mailbox.lifecycle_in_flight {
                continue;
            }
            if let Some(request) = mailbox.lifecycle.pop_front() {
                mailbox.lifecycle_in_flight = true;
                self.in_flight += 1;
                return Some((item, request));
            }
        }
        None
    }

    fn busy(&self) -> bool {
        self.in_flight > 0
            || self.mailboxes.values().any(|mailbox| {
                !mailbox.lifecycle.is_empty() || (self.enabled && !mailbox.held && mailbox.queued_events() > 0)
            })
    }
}

/// Single logical priority queue shared by the execution and maintenance pools.
pub(crate) struct EventQueue {
    state: Mutex<QueueState>,
    execution_cv: Condvar,
    maintenance_cv: Condvar,
    idle_cv: Condvar,
    maintenance_interval: Duration,
}

fn wait_on<'a, T>(cv: &Condvar, guard: MutexGuard<'a, T>, timeout: Option<Duration>) -> MutexGuard<'a, T> {
    match timeout {
        Some(timeout) => match cv.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        },
        None => match cv.wait(guard) {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        },
    }
}

impl EventQueue {
    pub(crate) fn new(maintenance_interval: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                mailboxes: HashMap::new(),
                ready: Default::default(),
                maintenance_ready: VecDeque::new(),
                delayed: BinaryHeap::new(),
                delay_seq: 0,
                enabled: true,
                shut_down: false,
                in_flight: 0,
                execution_idle: 0,
                maintenance_idle: 0,
                last_pass: Instant::now(),
                pass_running: false,
            }),
            execution_cv: Condvar::new(),
            maintenance_cv: Condvar::new(),
            idle_cv: Condvar::new(),
            maintenance_interval,
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        lock(&self.state)
    }

    pub(crate) fn open_mailbox(&self, item: ItemId) {
        self.state().mailboxes.entry(item).or_insert_with(Mailbox::new);
    }

    /// Drops the mailbox and everything still queued in it.
    pub(crate) fn close_mailbox(&self, item: ItemId) -> usize {
        let discarded = {
            let mut state = self.state();
            state.mailboxes.remove(&item).map(|mailbox| mailbox.queued_events() + mailbox.lifecycle.len()).unwrap_or(0)
        };
        self.idle_cv.notify_all();
        discarded
    }

    pub(crate) fn discard_events(&self, item: ItemId) -> usize {
        let discarded = self.state().mailboxes.get_mut(&item).map(Mailbox::discard_events).unwrap_or(0);
        self.idle_cv.notify_all();
        discarded
    }

    /// Queues an event behind earlier events of the same class. Returns false when the
    /// instance has no mailbox.
    pub(crate) fn push_event(&self, event: QueueItem) -> bool {
        let ready = {
            let mut state = self.state();
            if state.shut_down {
                return false;
            }
            let item = event.item;
            let Some(mailbox) = state.mailboxes.get_mut(&item) else {
                return false;
            };
            mailbox.events[event.priority.index()].push_back(event);
            state.relist(item, Instant::now())
        };
        if ready {
            self.execution_cv.notify_one();
        }
        true
    }

    /// Puts an event that could not run back at the head of its class and holds the mailbox.
    pub(crate) fn requeue_front(&self, event: QueueItem) {
        let mut state = self.state();
        if let Some(mailbox) = state.mailboxes.get_mut(&event.item) {
            mailbox.held = true;
            mailbox.events[event.priority.index()].push_front(event);
        }
    }

    /// Teardown requests jump ahead of other pending lifecycle work.
    pub(crate) fn push_lifecycle(&self, item: ItemId, request: LifecycleRequest) -> bool {
        let ready = {
            let mut state = self.state();
            if state.shut_down {
                return false;
            }
            let Some(mailbox) = state.mailboxes.get_mut(&item) else {
                return false;
            };
            if request.priority() == PriorityClass::Stop {
                mailbox.lifecycle.push_front(request);
            } else {
                mailbox.lifecycle.push_back(request);
            }
            state.relist_maintenance(item)
        };
        if ready {
            self.maintenance_cv.notify_one();
        }
        true
    }

    pub(crate) fn set_held(&self, item: ItemId, held: bool) {
        let ready = {
            let mut state = self.state();
            match state.mailboxes.get_mut(&item) {
                Some(mailbox) if mailbox.held != held => mailbox.held = held,
                _ => return,
            }
            state.relist(item, Instant::now())
        };
        if ready {
            self.execution_cv.notify_one();
        }
        self.idle_cv.notify_all();
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.state().enabled = enabled;
        self.execution_cv.notify_all();
        self.idle_cv.notify_all();
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.state().enabled
    }

    /// Blocks until an event is dispatchable. Returns `None` once shut down.
    pub(crate) fn next_event(&self) -> Option<QueueItem> {
        let mut state = self.state();
        loop {
            if state.shut_down {
                return None;
            }
            let now = Instant::now();
            state.promote_delayed(now);
            if state.enabled {
                if let Some(event) = state.take_event(now) {
                    return Some(event);
                }
            }
            let timeout = state.next_deadline().map(|at| at.saturating_duration_since(now));
            state.execution_idle += 1;
            state = wait_on(&self.execution_cv, state, timeout);
            state.execution_idle -= 1;
        }
    }

    /// Marks the in-flight event of `item` done. `not_before` rate-limits its next dispatch.
    pub(crate) fn finish_event(&self, item: ItemId, not_before: Option<Instant>) {
        let ready = {
            let mut state = self.state();
            state.in_flight = state.in_flight.saturating_sub(1);
            let has_lifecycle = match state.mailboxes.get_mut(&item) {
                Some(mailbox) => {
                    mailbox.event_in_flight = false;
                    mailbox.not_before = not_before;
                    !mailbox.lifecycle.is_empty()
                }
                None => false,
            };
            if has_lifecycle {
                state.relist_maintenance(item);
            }
            state.relist(item, Instant::now())
        };
        if ready {
            self.execution_cv.notify_one();
        }
        self.idle_cv.notify_all();
    }

    /// Blocks until lifecycle work or the periodic pass is due. Returns `None` once shut down.
    pub(crate) fn next_maintenance(&self) -> Option<MaintenanceJob> {
        let mut state = self.state();
        loop {
            if state.shut_down {
                return None;
            }
            if let Some((item, request)) = state.take_lifecycle() {
                return Some(MaintenanceJob::Lifecycle(item, request));
            }
            let now = Instant::now();
            let due = state.last_pass + self.maintenance_interval;
            if !state.pass_running && now >= due {
                state.pass_running = true;
                state.last_pass = now;
                return Some(MaintenanceJob::Pass);
            }
            let timeout = if state.pass_running { self.maintenance_interval } else { due - now };
            state.maintenance_idle += 1;
            state = wait_on(&self.maintenance_cv, state, Some(timeout));
            state.maintenance_idle -= 1;
        }
    }

    pub(crate) fn finish_lifecycle(&self, item: ItemId) {
        let (maintenance, execution) = {
            let mut state = self.state();
            state.in_flight = state.in_flight.saturating_sub(1);
            if let Some(mailbox) = state.mailboxes.get_mut(&item) {
                mailbox.lifecycle_in_flight = false;
            }
            let maintenance = state.relist_maintenance(item);
            (maintenance, state.relist(item, Instant::now()))
        };
        if maintenance {
            self.maintenance_cv.notify_one();
        }
        if execution {
            self.execution_cv.notify_one();
        }
        self.idle_cv.notify_all();
    }

    pub(crate) fn finish_pass(&self) {
        self.state().pass_running = false;
    }

    /// Waits until nothing dispatchable is queued and nothing is in flight.
    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        loop {
            if !state.busy() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline || state.shut_down {
                return false;
            }
            let wait = (deadline - now).min(Duration::from_millis(50));
            state = wait_on(&self.idle_cv, state, Some(wait));
        }
    }

    pub(crate) fn depth(&self) -> QueueDepth {
        let state = self.state();
        QueueDepth {
            events: state.mailboxes.values().map(Mailbox::queued_events).sum(),
            lifecycle: state.mailboxes.values().map(|mailbox| mailbox.lifecycle.len()).sum(),
            delayed: state.mailboxes.values().filter(|mailbox| mailbox.listing == Listing::Delayed).count(),
            in_flight: state.in_flight,
        }
    }

    pub(crate) fn idle_workers(&self) -> (usize, usize) {
        let state = self.state();
        (state.execution_idle, state.maintenance_idle)
    }

    pub(crate) fn shutdown(&self) {
        self.state().shut_down = true;
        self.execution_cv.notify_all();
        self.maintenance_cv.notify_all();
        self.idle_cv.notify_all();
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.state().shut_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventArgs;
    use crate::ids::ObjectId;

    fn event(item: ItemId, name: &str, priority: PriorityClass) -> QueueItem {
        QueueItem {
            item,
            object: ObjectId::new(),
            event: name.to_string(),
            args: EventArgs::new(),
            detected: Vec::new(),
            script_state: "default".to_string(),
            version: 0,
            priority,
        }
    }

    fn queue_with(item: ItemId) -> EventQueue {
        let queue = EventQueue::new(Duration::from_secs(60));
        queue.open_mailbox(item);
        queue
    }

    #[test]
    fn higher_classes_drain_first_for_one_instance() {
        let item = ItemId::new();
        let queue = queue_with(item);
        queue.push_event(event(item, "touch", PriorityClass::Event));
        queue.push_event(event(item, "state_entry", PriorityClass::FirstStart));
        let first = queue.next_event().expect("event");
        assert_eq!(first.event, "state_entry");
        queue.finish_event(item, None);
        assert_eq!(queue.next_event().expect("event").event, "touch");
    }

    #[test]
    fn one_event_in_flight_per_instance() {
        let (a, b) = (ItemId::new(), ItemId::new());
        let queue = queue_with(a);
        queue.open_mailbox(b);
        queue.push_event(event(a, "a1", PriorityClass::Event));
        queue.push_event(event(a, "a2", PriorityClass::Event));
        queue.push_event(event(b, "b1", PriorityClass::Event));
        assert_eq!(queue.next_event().expect("a1").event, "a1");
        assert_eq!(queue.next_event().expect("b1").event, "b1", "a2 must wait for a1");
        queue.finish_event(a, None);
        assert_eq!(queue.next_event().expect("a2").event, "a2");
    }

    #[test]
    fn held_and_disabled_mailboxes_keep_their_events() {
        let item = ItemId::new();
        let queue = queue_with(item);
        queue.set_held(item, true);
        queue.push_event(event(item, "touch", PriorityClass::Event));
        assert!(queue.wait_idle(Duration::from_millis(10)), "held work does not count as busy");
        assert_eq!(queue.depth().events, 1);

        queue.set_enabled(false);
        queue.set_held(item, false);
        assert!(queue.wait_idle(Duration::from_millis(10)));
        queue.set_enabled(true);
        assert!(!queue.wait_idle(Duration::from_millis(10)));
        assert_eq!(queue.next_event().expect("released").event, "touch");
    }

    #[test]
    fn pending_lifecycle_blocks_events_and_stop_jumps_ahead() {
        let item = ItemId::new();
        let queue = queue_with(item);
        queue.push_event(event(item, "touch", PriorityClass::Event));
        queue.push_lifecycle(item, LifecycleRequest::Reset);
        queue.push_lifecycle(item, LifecycleRequest::Unload);
        match queue.next_maintenance() {
            Some(MaintenanceJob::Lifecycle(_, LifecycleRequest::Unload)) => {}
            _ => panic!("unload should be taken first"),
        }
        assert_eq!(queue.depth().lifecycle, 1);
        queue.finish_lifecycle(item);
        assert_eq!(queue.close_mailbox(item), 2);
        assert!(queue.wait_idle(Duration::from_millis(10)));
    }

    #[test]
    fn rate_limited_mailboxes_wait_for_their_interval() {
        let item = ItemId::new();
        let queue = queue_with(item);
        queue.push_event(event(item, "e1", PriorityClass::Event));
        queue.push_event(event(item, "e2", PriorityClass::Event));
        queue.next_event().expect("e1");
        let started = Instant::now();
        queue.finish_event(item, Some(started + Duration::from_millis(40)));
        assert_eq!(queue.depth().delayed, 1);
        assert_eq!(queue.next_event().expect("e2").event, "e2");
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn shutdown_releases_blocked_workers() {
        let queue = std::sync::Arc::new(EventQueue::new(Duration::from_secs(60)));
        let worker = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.next_event().is_none())
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.shutdown();
        assert!(worker.join().expect("worker"));
        assert!(!queue.push_event(event(ItemId::new(), "late", PriorityClass::Event)));
    }
}
