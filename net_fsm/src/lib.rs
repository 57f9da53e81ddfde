//! Table-driven state machines for adapter and device lifecycle.
//!
//! Each machine is a closed table: every state lists its transitions and its
//! explicitly ignored events. An event with neither a transition nor an
//! ignore entry leaves the state unchanged, invokes nothing, and counts a
//! defect; the full (state, event) space is enumerable in tests.

pub mod adapter;
pub mod device;

use std::collections::VecDeque;
use std::fmt::Debug;

/// A machine definition: dense state/event enums, per-state transition and
/// ignore tables, and an entry function that may return a follow-up event
/// processed before the machine goes idle.
pub trait StateMachineDef {
    type State: Copy + Eq + Debug + 'static;
    type Event: Copy + Eq + Debug + 'static;
    /// The object entry functions operate on.
    type Context: ?Sized;

    const NAME: &'static str;
    const ALL_STATES: &'static [Self::State];
    const ALL_EVENTS: &'static [Self::Event];

    fn initial() -> Self::State;
    fn transitions(state: Self::State) -> &'static [(Self::Event, Self::State)];
    /// Events this state ignores by design.
    fn ignored(state: Self::State) -> &'static [Self::Event];
    /// Runs exactly once on entering `state`.
    fn entry(state: Self::State, context: &mut Self::Context) -> Option<Self::Event>;
}

/// Optional observation callbacks, filled in explicitly by the owner.
pub struct StateObserver<D: StateMachineDef + ?Sized> {
    pub on_transition: Option<fn(D::State, D::Event, D::State)>,
    pub on_defect: Option<fn(D::State, D::Event)>,
}

impl<D: StateMachineDef + ?Sized> Default for StateObserver<D> {
    fn default() -> Self {
        Self {
            on_transition: None,
            on_defect: None,
        }
    }
}

/// One automaton instance. Not internally locked; the owner provides the
/// serialization domain (callers from arbitrary contexts go through it).
pub struct StateMachine<D: StateMachineDef> {
    pub(crate) state: D::State,
    queue: VecDeque<D::Event>,
    processing: bool,
    defects: u64,
    observer: StateObserver<D>,
}

impl<D: StateMachineDef> StateMachine<D> {
    pub fn new(observer: StateObserver<D>) -> Self {
        Self {
            state: D::initial(),
            queue: VecDeque::new(),
            processing: false,
            defects: 0,
            observer,
        }
    }

    pub fn state(&self) -> D::State {
        self.state
    }

    /// Undefined (state, event) dispatches observed so far.
    pub fn defects(&self) -> u64 {
        self.defects
    }

    /// Posts an event. One event is dispatched at a time; events queued by
    /// entry functions (or re-entrant posts) drain before this returns to a
    /// non-processing caller.
    pub fn enqueue(&mut self, event: D::Event, context: &mut D::Context) {
        self.queue.push_back(event);
        if self.processing {
            return;
        }
        self.processing = true;
        while let Some(event) = self.queue.pop_front() {
            self.dispatch(event, context);
        }
        self.processing = false;
    }

    fn dispatch(&mut self, event: D::Event, context: &mut D::Context) {
        let table = D::transitions(self.state);
        if let Some(&(_, target)) = table.iter().find(|(e, _)| *e == event) {
            let source = self.state;
            self.state = target;
            if let Some(observe) = self.observer.on_transition {
                observe(source, event, target);
            }
            tracing::trace!(
                machine = D::NAME,
                ?source,
                ?event,
                ?target,
                "state transition"
            );
            if let Some(follow_up) = D::entry(target, context) {
                // A synchronous entry result outranks externally queued
                // events.
                self.queue.push_front(follow_up);
            }
        } else if D::ignored(self.state).contains(&event) {
            tracing::trace!(machine = D::NAME, state = ?self.state, ?event, "event ignored");
        } else {
            // A closed-table violation: the state is left unchanged and no
            // entry function runs.
            self.defects += 1;
            if let Some(observe) = self.observer.on_defect {
                observe(self.state, event);
            }
            tracing::error!(
                machine = D::NAME,
                state = ?self.state,
                ?event,
                "event has no transition in this state"
            );
        }
    }
}
