//! The execution context: one serialization domain per datapath queue.
//!
//! Polling work (the translator's per-iteration progress) and administrative
//! tasks (registration changes, termination) never run concurrently with each
//! other. Each worker activation drains tasks strictly before invoking any
//! poll, so an administrative request is never starved by a saturated poll
//! loop.
//!
//! An activation runs either on the context's dedicated worker thread or
//! inline on a notifying thread ("dispatch" mode, the low-latency analogue of
//! interrupt-context execution). Dispatch activations are time-budgeted and
//! never run tasks; when either constraint bites, the activation hands off to
//! the worker thread.

mod budget;

pub use budget::BudgetConfig;

use budget::Budget;
use budget::BudgetStatus;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Relative ordering tag for registered polls. Lower values poll first.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct PollType(pub u16);

/// Buffer-return processing polls ahead of hardware indication.
pub const POLL_TYPE_BUFFER_RETURN: PollType = PollType(0);
pub const POLL_TYPE_DATAPATH: PollType = PollType(16);
pub const POLL_TYPE_BACKGROUND: PollType = PollType(32);

/// A registered poll callback; returns the amount of work it performed.
pub type PollFn = Box<dyn FnMut() -> u32 + Send>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PollId(u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NotificationId(u64);

/// An edge-triggered wake source. While armed, the source calls
/// [`EcHandle::notify`] when its edge fires; the context disarms every
/// source whenever it resumes polling.
pub trait NotificationSource: Send {
    fn set_armed(&self, armed: bool);
}

/// How the context prefers to resume when work arrives while idle.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SchedulingHint {
    /// Always wake the worker thread.
    #[default]
    WorkerThread,
    /// Run inline on the notifying thread when possible, bounded by the
    /// dispatch budget.
    DispatchFirst,
}

#[derive(Clone, Debug)]
pub struct EcConfig {
    /// Name used in trace output and as the worker thread name.
    pub name: String,
    pub scheduling: SchedulingHint,
    pub budget: BudgetConfig,
}

impl Default for EcConfig {
    fn default() -> Self {
        Self {
            name: "ec".to_string(),
            scheduling: SchedulingHint::WorkerThread,
            budget: BudgetConfig::default(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum RunState {
    Stopped,
    /// The worker thread has been signaled and will take the next activation.
    WaitingThread,
    /// A notifying thread is entering a dispatch activation. A task arriving
    /// in this window redirects the activation to the worker thread.
    WaitingDispatch,
    Running,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Activation {
    WorkerThread,
    Dispatch,
}

struct PollEntry {
    id: PollId,
    poll_type: PollType,
    func: PollFn,
}

struct NotificationEntry {
    id: NotificationId,
    source: Box<dyn NotificationSource>,
}

/// State owned by whichever activation is currently running. Mutated only
/// from inside the serialized context, so tasks may change the lists without
/// the poll loop ever observing a mid-iteration mutation.
struct WorkLists {
    polls: Vec<PollEntry>,
    notifications: Vec<NotificationEntry>,
    notifications_armed: bool,
    terminate: bool,
}

/// Handle tasks use to mutate the context from inside its own execution.
struct TaskContext<'a> {
    work: &'a mut WorkLists,
}

impl TaskContext<'_> {
    fn insert_poll(&mut self, entry: PollEntry) {
        let pos = self
            .work
            .polls
            .iter()
            .position(|p| p.poll_type > entry.poll_type)
            .unwrap_or(self.work.polls.len());
        self.work.polls.insert(pos, entry);
    }
}

type TaskFn = Box<dyn FnOnce(&mut TaskContext<'_>) + Send>;

struct Task {
    func: TaskFn,
    done: Arc<TaskDone>,
}

#[derive(Default)]
struct TaskDone {
    done: Mutex<bool>,
    cv: Condvar,
}

impl TaskDone {
    fn signal(&self) {
        *self.done.lock() = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cv.wait(&mut done);
        }
    }
}

/// Completion handle for a queued task.
#[must_use]
pub struct TaskHandle(Arc<TaskDone>);

impl TaskHandle {
    /// Blocks until the task has run. Must not be called from inside the
    /// context's own execution.
    pub fn wait(self) {
        self.0.wait();
    }

    /// Completes whenever the task does; the caller does not wait.
    pub fn detach(self) {}
}

struct EcState {
    run_state: RunState,
    tasks: VecDeque<Task>,
    /// Present whenever no activation is running.
    work: Option<WorkLists>,
    /// Set by `notify`; cleared at the top of every poll round.
    poll_work_pending: bool,
    /// Worker thread has fully exited.
    terminated: bool,
}

struct EcShared {
    state: Mutex<EcState>,
    wake: Condvar,
    config: EcConfig,
    next_id: AtomicU64,
}

enum ExitReason {
    Idle,
    TasksPending,
    OutOfBudget,
}

impl EcShared {
    /// Runs one activation. The caller has already moved the state to
    /// `Running` and taken the work lists.
    fn run(&self, work: &mut WorkLists, activation: Activation) -> ExitReason {
        if activation == Activation::WorkerThread {
            self.drain_tasks(work);
            if work.terminate {
                return ExitReason::Idle;
            }
        } else if self.tasks_pending() {
            // Dispatch activations cannot host tasks.
            return ExitReason::TasksPending;
        }

        // Polling resumes, so notification edges are no longer needed to make
        // progress.
        if work.notifications_armed {
            for n in &work.notifications {
                n.source.set_armed(false);
            }
            work.notifications_armed = false;
        }

        let mut budget = Budget::start(&self.config.budget);
        loop {
            self.state.lock().poll_work_pending = false;
            let mut round_work = 0u32;
            for poll in &mut work.polls {
                round_work += (poll.func)();
                if self.tasks_pending() {
                    return ExitReason::TasksPending;
                }
            }

            if round_work == 0 {
                if !work.notifications_armed {
                    // Arm, then loop once more to close the race between "no
                    // work seen" and an edge that fired during this round.
                    for n in &work.notifications {
                        n.source.set_armed(true);
                    }
                    work.notifications_armed = true;
                    continue;
                }
                if self.state.lock().poll_work_pending {
                    continue;
                }
                return ExitReason::Idle;
            }

            if activation == Activation::Dispatch {
                match budget.check() {
                    BudgetStatus::Ok => {}
                    BudgetStatus::Exhausted => return ExitReason::OutOfBudget,
                }
            }
        }
    }

    fn drain_tasks(&self, work: &mut WorkLists) {
        loop {
            let task = self.state.lock().tasks.pop_front();
            let Some(task) = task else { break };
            (task.func)(&mut TaskContext { work });
            task.done.signal();
        }
    }

    fn tasks_pending(&self) -> bool {
        !self.state.lock().tasks.is_empty()
    }

    /// Puts the work lists back and decides the next run state.
    fn finish_activation(&self, work: WorkLists, reason: ExitReason) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.run_state, RunState::Running);
        let rerun = match reason {
            ExitReason::Idle => state.poll_work_pending || !state.tasks.is_empty(),
            ExitReason::TasksPending | ExitReason::OutOfBudget => true,
        };
        state.work = Some(work);
        if rerun {
            state.run_state = RunState::WaitingThread;
            self.wake.notify_one();
        } else {
            state.run_state = RunState::Stopped;
        }
    }

    fn queue_task(&self, func: TaskFn) -> TaskHandle {
        let done = Arc::new(TaskDone::default());
        let mut state = self.state.lock();
        state.tasks.push_back(Task {
            func,
            done: done.clone(),
        });
        match state.run_state {
            RunState::Stopped | RunState::WaitingDispatch => {
                state.run_state = RunState::WaitingThread;
                self.wake.notify_one();
            }
            RunState::WaitingThread | RunState::Running => {}
        }
        drop(state);
        TaskHandle(done)
    }

    fn notify(&self, allow_inline: bool) {
        let mut state = self.state.lock();
        state.poll_work_pending = true;
        match state.run_state {
            RunState::Running | RunState::WaitingThread | RunState::WaitingDispatch => {}
            RunState::Stopped => {
                let inline = allow_inline
                    && self.config.scheduling == SchedulingHint::DispatchFirst
                    && state.tasks.is_empty();
                if !inline {
                    state.run_state = RunState::WaitingThread;
                    self.wake.notify_one();
                    return;
                }
                state.run_state = RunState::WaitingDispatch;
                drop(state);

                let mut state = self.state.lock();
                if state.run_state != RunState::WaitingDispatch {
                    // A task arrived and redirected this activation to the
                    // worker thread.
                    return;
                }
                state.run_state = RunState::Running;
                let mut work = state.work.take().expect("work present when not running");
                drop(state);
                let reason = self.run(&mut work, Activation::Dispatch);
                self.finish_activation(work, reason);
            }
        }
    }
}

/// Cloneable handle for notifying the context and queueing tasks from other
/// threads (including notification sources and adapter driver callbacks).
#[derive(Clone)]
pub struct EcHandle {
    shared: Arc<EcShared>,
}

impl EcHandle {
    /// Signals that poll work may be available. Callable from any thread.
    /// With [`SchedulingHint::DispatchFirst`] the activation may run inline
    /// on the calling thread.
    pub fn notify(&self) {
        self.shared.notify(true);
    }

    /// As [`Self::notify`], but never runs inline; use from contexts that
    /// cannot host a dispatch activation.
    pub fn notify_deferred(&self) {
        self.shared.notify(false);
    }

    /// Queues a task into the serialized context. Tasks always run on the
    /// worker thread and strictly before any poll of that activation.
    pub fn queue_task(&self, f: impl FnOnce() + Send + 'static) -> TaskHandle {
        self.shared.queue_task(Box::new(move |_| f()))
    }
}

/// A serialized polling/task engine bound to one worker thread.
pub struct ExecutionContext {
    shared: Arc<EcShared>,
    worker: Option<JoinHandle<()>>,
}

impl ExecutionContext {
    pub fn new(config: EcConfig) -> Self {
        let shared = Arc::new(EcShared {
            state: Mutex::new(EcState {
                run_state: RunState::Stopped,
                tasks: VecDeque::new(),
                work: Some(WorkLists {
                    polls: Vec::new(),
                    notifications: Vec::new(),
                    notifications_armed: false,
                    terminate: false,
                }),
                poll_work_pending: false,
                terminated: false,
            }),
            wake: Condvar::new(),
            config,
            next_id: AtomicU64::new(1),
        });
        let worker = {
            let shared = shared.clone();
            let name = shared.config.name.clone();
            std::thread::Builder::new()
                .name(name)
                .spawn(move || worker_loop(shared))
                .expect("spawn worker thread")
        };
        Self {
            shared,
            worker: Some(worker),
        }
    }

    pub fn handle(&self) -> EcHandle {
        EcHandle {
            shared: self.shared.clone(),
        }
    }

    /// See [`EcHandle::notify`].
    pub fn notify(&self) {
        self.shared.notify(true);
    }

    /// See [`EcHandle::notify_deferred`].
    pub fn notify_deferred(&self) {
        self.shared.notify(false);
    }

    /// See [`EcHandle::queue_task`].
    pub fn queue_task(&self, f: impl FnOnce() + Send + 'static) -> TaskHandle {
        self.shared.queue_task(Box::new(move |_| f()))
    }

    /// Registers a poll, ordered by `poll_type`. Blocks until the context has
    /// applied the change; the poll loop never observes it mid-iteration.
    pub fn register_poll(&self, poll_type: PollType, func: PollFn) -> PollId {
        let id = PollId(self.shared.next_id.fetch_add(1, Relaxed));
        self.shared
            .queue_task(Box::new(move |cx| {
                cx.insert_poll(PollEntry {
                    id,
                    poll_type,
                    func,
                });
            }))
            .wait();
        id
    }

    pub fn unregister_poll(&self, id: PollId) {
        self.shared
            .queue_task(Box::new(move |cx| {
                cx.work.polls.retain(|p| p.id != id);
            }))
            .wait();
    }

    pub fn change_poll_function(&self, id: PollId, func: PollFn) {
        self.shared
            .queue_task(Box::new(move |cx| {
                if let Some(entry) = cx.work.polls.iter_mut().find(|p| p.id == id) {
                    entry.func = func;
                }
            }))
            .wait();
    }

    pub fn register_notification(&self, source: Box<dyn NotificationSource>) -> NotificationId {
        let id = NotificationId(self.shared.next_id.fetch_add(1, Relaxed));
        self.shared
            .queue_task(Box::new(move |cx| {
                cx.work.notifications.push(NotificationEntry { id, source });
            }))
            .wait();
        id
    }

    /// Unregisters a notification. The source is forced to the disarmed
    /// state regardless of its last observed state.
    pub fn unregister_notification(&self, id: NotificationId) {
        self.shared
            .queue_task(Box::new(move |cx| {
                if let Some(pos) = cx.work.notifications.iter().position(|n| n.id == id) {
                    let entry = cx.work.notifications.remove(pos);
                    entry.source.set_armed(false);
                }
            }))
            .wait();
    }

    /// Requests termination and waits for the worker thread to exit. All
    /// polls and notifications must already be unregistered.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.shared
            .queue_task(Box::new(|cx| {
                cx.work.terminate = true;
            }))
            .detach();
        if let Err(err) = worker.join() {
            std::panic::resume_unwind(err);
        }
        debug_assert!(self.shared.state.lock().terminated);
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

fn worker_loop(shared: Arc<EcShared>) {
    let mut state = shared.state.lock();
    loop {
        while state.run_state != RunState::WaitingThread {
            shared.wake.wait(&mut state);
        }
        state.run_state = RunState::Running;
        let mut work = state.work.take().expect("work present when not running");
        drop(state);

        let reason = shared.run(&mut work, Activation::WorkerThread);

        if work.terminate {
            // Quiesce: callers must fully unregister before terminating.
            assert!(
                work.polls.is_empty() && work.notifications.is_empty(),
                "execution context terminated with registrations outstanding"
            );
            let mut state = shared.state.lock();
            state.run_state = RunState::Stopped;
            state.work = Some(work);
            state.terminated = true;
            tracing::debug!(name = shared.config.name.as_str(), "execution context stopped");
            return;
        }

        shared.finish_activation(work, reason);
        state = shared.state.lock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct ArmFlag(Arc<AtomicBool>);

    impl NotificationSource for ArmFlag {
        fn set_armed(&self, armed: bool) {
            self.0.store(armed, Relaxed);
        }
    }

    fn ec() -> ExecutionContext {
        ExecutionContext::new(EcConfig {
            name: "test-ec".into(),
            ..Default::default()
        })
    }

    impl ExecutionContext {
        /// Test helper: waits for the context to quiesce to `Stopped`.
        fn wait_idle(&self) {
            loop {
                if self.shared.state.lock().run_state == RunState::Stopped {
                    break;
                }
                std::thread::yield_now();
            }
        }
    }

    #[test]
    fn task_completes_before_next_poll() {
        let ec = ec();
        let log: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        let handle = ec.handle();

        let id = {
            let log = log.clone();
            let mut count = 0u32;
            ec.register_poll(
                POLL_TYPE_DATAPATH,
                Box::new(move || {
                    if count >= 6 {
                        return 0;
                    }
                    count += 1;
                    log.lock().unwrap().push(format!("poll{count}"));
                    if count == 3 {
                        // The queued task must run before poll4.
                        let log = log.clone();
                        handle
                            .queue_task(move || log.lock().unwrap().push("task".into()))
                            .detach();
                    }
                    1
                }),
            )
        };

        ec.notify();
        loop {
            if log.lock().unwrap().len() >= 7 {
                break;
            }
            std::thread::yield_now();
        }
        ec.unregister_poll(id);
        assert_eq!(
            *log.lock().unwrap(),
            ["poll1", "poll2", "poll3", "task", "poll4", "poll5", "poll6"]
        );
        ec.shutdown();
    }

    #[test]
    fn polls_execute_in_type_order() {
        let ec = ec();
        let order = Arc::new(StdMutex::new(Vec::new()));
        let go = Arc::new(AtomicBool::new(false));
        let mut ids = Vec::new();
        for (tag, ty) in [
            ("datapath", POLL_TYPE_DATAPATH),
            ("return", POLL_TYPE_BUFFER_RETURN),
            ("background", POLL_TYPE_BACKGROUND),
        ] {
            let order = order.clone();
            let go = go.clone();
            let mut fired = false;
            ids.push(ec.register_poll(
                ty,
                Box::new(move || {
                    if !go.load(Relaxed) || fired {
                        return 0;
                    }
                    fired = true;
                    order.lock().unwrap().push(tag);
                    1
                }),
            ));
        }
        go.store(true, Relaxed);
        ec.notify();
        while order.lock().unwrap().len() < 3 {
            std::thread::yield_now();
        }
        assert_eq!(*order.lock().unwrap(), ["return", "datapath", "background"]);
        for id in ids {
            ec.unregister_poll(id);
        }
        ec.shutdown();
    }

    #[test]
    fn notifications_armed_only_while_idle() {
        let ec = ec();
        let armed = Arc::new(AtomicBool::new(false));
        let nid = ec.register_notification(Box::new(ArmFlag(armed.clone())));
        let pid = ec.register_poll(POLL_TYPE_DATAPATH, Box::new(|| 0));

        ec.notify();
        for _ in 0..1000 {
            if armed.load(Relaxed) {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(armed.load(Relaxed), "idle context arms its notifications");

        ec.unregister_notification(nid);
        assert!(!armed.load(Relaxed), "unregistration forces disarm");
        ec.unregister_poll(pid);
        ec.shutdown();
    }

    #[test]
    fn dispatch_first_runs_inline() {
        let ec = ExecutionContext::new(EcConfig {
            name: "inline-ec".into(),
            scheduling: SchedulingHint::DispatchFirst,
            budget: BudgetConfig::default(),
        });
        let poll_thread = Arc::new(StdMutex::new(None));
        let go = Arc::new(AtomicBool::new(false));
        let pt = poll_thread.clone();
        let g = go.clone();
        let mut fired = false;
        let id = ec.register_poll(
            POLL_TYPE_DATAPATH,
            Box::new(move || {
                if !g.load(Relaxed) || fired {
                    return 0;
                }
                fired = true;
                *pt.lock().unwrap() = Some(std::thread::current().id());
                1
            }),
        );
        ec.wait_idle();
        go.store(true, Relaxed);
        ec.notify();
        let polled_on = poll_thread.lock().unwrap().expect("poll ran inline");
        assert_eq!(polled_on, std::thread::current().id());
        ec.unregister_poll(id);
        ec.shutdown();
    }

    #[test]
    fn exhausted_budget_hands_off_to_worker() {
        let ec = ExecutionContext::new(EcConfig {
            name: "budget-ec".into(),
            scheduling: SchedulingHint::DispatchFirst,
            budget: BudgetConfig {
                limit: Duration::ZERO,
                ..Default::default()
            },
        });
        let threads = Arc::new(StdMutex::new(Vec::new()));
        let go = Arc::new(AtomicBool::new(false));
        let t = threads.clone();
        let g = go.clone();
        let mut count = 0u32;
        let id = ec.register_poll(
            POLL_TYPE_DATAPATH,
            Box::new(move || {
                if !g.load(Relaxed) || count >= 3 {
                    return 0;
                }
                count += 1;
                t.lock().unwrap().push(std::thread::current().id());
                1
            }),
        );
        ec.wait_idle();
        go.store(true, Relaxed);
        ec.notify();
        for _ in 0..1000 {
            if threads.lock().unwrap().len() >= 3 {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        let threads = threads.lock().unwrap().clone();
        assert_eq!(threads.len(), 3);
        assert_eq!(threads[0], std::thread::current().id());
        assert_ne!(threads[2], std::thread::current().id());
        ec.unregister_poll(id);
        ec.shutdown();
    }

    #[test]
    fn deferred_notify_stays_off_caller_thread() {
        let ec = ExecutionContext::new(EcConfig {
            name: "deferred-ec".into(),
            scheduling: SchedulingHint::DispatchFirst,
            budget: BudgetConfig::default(),
        });
        let poll_thread = Arc::new(StdMutex::new(None));
        let go = Arc::new(AtomicBool::new(false));
        let pt = poll_thread.clone();
        let g = go.clone();
        let mut fired = false;
        let id = ec.register_poll(
            POLL_TYPE_DATAPATH,
            Box::new(move || {
                if !g.load(Relaxed) || fired {
                    return 0;
                }
                fired = true;
                *pt.lock().unwrap() = Some(std::thread::current().id());
                1
            }),
        );
        ec.wait_idle();
        go.store(true, Relaxed);
        ec.notify_deferred();
        for _ in 0..1000 {
            if poll_thread.lock().unwrap().is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        let polled_on = poll_thread.lock().unwrap().expect("poll ran");
        assert_ne!(polled_on, std::thread::current().id());
        ec.unregister_poll(id);
        ec.shutdown();
    }

    #[test]
    fn change_poll_function_takes_effect() {
        let ec = ec();
        let hits = Arc::new(StdMutex::new(Vec::new()));
        let h = hits.clone();
        let mut fired = false;
        let id = ec.register_poll(
            POLL_TYPE_DATAPATH,
            Box::new(move || {
                if !fired {
                    fired = true;
                    h.lock().unwrap().push("old");
                    1
                } else {
                    0
                }
            }),
        );
        ec.notify();
        while hits.lock().unwrap().is_empty() {
            std::thread::yield_now();
        }
        let h = hits.clone();
        let mut fired = false;
        ec.change_poll_function(
            id,
            Box::new(move || {
                if !fired {
                    fired = true;
                    h.lock().unwrap().push("new");
                    1
                } else {
                    0
                }
            }),
        );
        ec.notify();
        while hits.lock().unwrap().len() < 2 {
            std::thread::yield_now();
        }
        assert_eq!(*hits.lock().unwrap(), ["old", "new"]);
        ec.unregister_poll(id);
        ec.shutdown();
    }
}
