//! The adapter lifecycle machine: initialization, datapath
//! start/pause/restart, and halt, serialized against concurrent stack
//! callbacks by the owner.

use crate::StateMachineDef;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AdapterState {
    Halted,
    Initializing,
    InitializedWaitForStart,
    Paused,
    /// Decision state: exists purely so the client driver can veto an
    /// automatic restart.
    ShouldClientStart,
    Restarting,
    Running,
    Pausing,
    /// Pause-while-paused for an explicit client stop; keeps that reason's
    /// own completion signal.
    PausingClientStop,
    /// Pause-while-paused for self-managed I/O suspend.
    PausingSelfManagedIo,
    Halting,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AdapterEvent {
    ClientStart,
    InitializeSucceeded,
    InitializeFailed,
    SelfManagedIoInitDone,
    DatapathStart,
    ClientStartYes,
    ClientStartNo,
    RestartComplete,
    RestartFailed,
    DatapathPause,
    PauseComplete,
    ClientStop,
    SelfManagedIoSuspend,
    ClientHalt,
    HaltComplete,
}

/// Entry-function surface the machine drives. Synchronous operations return
/// the follow-up event; asynchronous ones return `None` and post their event
/// when ready.
pub trait AdapterContext {
    /// Reports the adapter to the stack. A synchronous failure here must
    /// leave no partial-start state observable.
    fn initialize(&mut self) -> AdapterEvent;
    fn self_managed_io_init(&mut self) -> AdapterEvent;
    /// The client's restart veto: `ClientStartYes` or `ClientStartNo`.
    fn should_start(&mut self) -> AdapterEvent;
    fn start_datapath(&mut self) -> Option<AdapterEvent>;
    fn stop_datapath(&mut self) -> Option<AdapterEvent>;
    fn complete_client_stop(&mut self) -> AdapterEvent;
    fn complete_self_managed_io_suspend(&mut self) -> AdapterEvent;
    fn release(&mut self) -> AdapterEvent;
}

pub struct AdapterDef;

impl StateMachineDef for AdapterDef {
    type State = AdapterState;
    type Event = AdapterEvent;
    type Context = dyn AdapterContext;

    const NAME: &'static str = "adapter";

    const ALL_STATES: &'static [AdapterState] = &[
        AdapterState::Halted,
        AdapterState::Initializing,
        AdapterState::InitializedWaitForStart,
        AdapterState::Paused,
        AdapterState::ShouldClientStart,
        AdapterState::Restarting,
        AdapterState::Running,
        AdapterState::Pausing,
        AdapterState::PausingClientStop,
        AdapterState::PausingSelfManagedIo,
        AdapterState::Halting,
    ];

    const ALL_EVENTS: &'static [AdapterEvent] = &[
        AdapterEvent::ClientStart,
        AdapterEvent::InitializeSucceeded,
        AdapterEvent::InitializeFailed,
        AdapterEvent::SelfManagedIoInitDone,
        AdapterEvent::DatapathStart,
        AdapterEvent::ClientStartYes,
        AdapterEvent::ClientStartNo,
        AdapterEvent::RestartComplete,
        AdapterEvent::RestartFailed,
        AdapterEvent::DatapathPause,
        AdapterEvent::PauseComplete,
        AdapterEvent::ClientStop,
        AdapterEvent::SelfManagedIoSuspend,
        AdapterEvent::ClientHalt,
        AdapterEvent::HaltComplete,
    ];

    fn initial() -> AdapterState {
        AdapterState::Halted
    }

    fn transitions(state: AdapterState) -> &'static [(AdapterEvent, AdapterState)] {
        use AdapterEvent as E;
        use AdapterState as S;
        match state {
            S::Halted => &[(E::ClientStart, S::Initializing)],
            S::Initializing => &[
                (E::InitializeSucceeded, S::InitializedWaitForStart),
                // Synchronous initialize failure goes straight back to
                // Halted; "wait for self-managed I/O init" is never reached.
                (E::InitializeFailed, S::Halted),
            ],
            S::InitializedWaitForStart => &[(E::SelfManagedIoInitDone, S::Paused)],
            S::Paused => &[
                (E::DatapathStart, S::ShouldClientStart),
                (E::ClientStop, S::PausingClientStop),
                (E::SelfManagedIoSuspend, S::PausingSelfManagedIo),
                (E::ClientHalt, S::Halting),
            ],
            S::ShouldClientStart => &[
                (E::ClientStartYes, S::Restarting),
                (E::ClientStartNo, S::Paused),
            ],
            S::Restarting => &[
                (E::RestartComplete, S::Running),
                (E::RestartFailed, S::Paused),
            ],
            S::Running => &[(E::DatapathPause, S::Pausing)],
            S::Pausing => &[(E::PauseComplete, S::Paused)],
            S::PausingClientStop => &[(E::PauseComplete, S::Paused)],
            S::PausingSelfManagedIo => &[(E::PauseComplete, S::Paused)],
            S::Halting => &[(E::HaltComplete, S::Halted)],
        }
    }

    fn ignored(state: AdapterState) -> &'static [AdapterEvent] {
        use AdapterEvent as E;
        use AdapterState as S;
        match state {
            // A pause request with no running datapath needs no work; the
            // overlapping pause *reasons* get their own states instead.
            S::Paused => &[E::DatapathPause],
            S::Running => &[E::DatapathStart],
            S::Halted => &[E::ClientStop, E::DatapathPause],
            // A restart racing a pause resolves when the pause completes.
            S::Pausing | S::PausingClientStop | S::PausingSelfManagedIo => &[E::DatapathStart],
            _ => &[],
        }
    }

    fn entry(state: AdapterState, context: &mut (dyn AdapterContext + 'static)) -> Option<AdapterEvent> {
        use AdapterState as S;
        match state {
            S::Halted | S::Paused | S::Running => None,
            S::Initializing => Some(context.initialize()),
            S::InitializedWaitForStart => Some(context.self_managed_io_init()),
            S::ShouldClientStart => Some(context.should_start()),
            S::Restarting => context.start_datapath(),
            S::Pausing => context.stop_datapath(),
            S::PausingClientStop => {
                let pause = context.stop_datapath();
                debug_assert!(pause.is_none() || pause == Some(AdapterEvent::PauseComplete));
                Some(context.complete_client_stop())
            }
            S::PausingSelfManagedIo => {
                let pause = context.stop_datapath();
                debug_assert!(pause.is_none() || pause == Some(AdapterEvent::PauseComplete));
                Some(context.complete_self_managed_io_suspend())
            }
            S::Halting => Some(context.release()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StateMachine;
    use crate::StateObserver;

    /// Records entry-function invocations and scripts the veto answer.
    struct Script {
        calls: Vec<&'static str>,
        allow_start: bool,
        fail_initialize: bool,
    }

    impl Script {
        fn new() -> Self {
            Self {
                calls: Vec::new(),
                allow_start: true,
                fail_initialize: false,
            }
        }
    }

    impl AdapterContext for Script {
        fn initialize(&mut self) -> AdapterEvent {
            self.calls.push("initialize");
            if self.fail_initialize {
                AdapterEvent::InitializeFailed
            } else {
                AdapterEvent::InitializeSucceeded
            }
        }

        fn self_managed_io_init(&mut self) -> AdapterEvent {
            self.calls.push("smio-init");
            AdapterEvent::SelfManagedIoInitDone
        }

        fn should_start(&mut self) -> AdapterEvent {
            self.calls.push("should-start");
            if self.allow_start {
                AdapterEvent::ClientStartYes
            } else {
                AdapterEvent::ClientStartNo
            }
        }

        fn start_datapath(&mut self) -> Option<AdapterEvent> {
            self.calls.push("start-datapath");
            Some(AdapterEvent::RestartComplete)
        }

        fn stop_datapath(&mut self) -> Option<AdapterEvent> {
            self.calls.push("stop-datapath");
            Some(AdapterEvent::PauseComplete)
        }

        fn complete_client_stop(&mut self) -> AdapterEvent {
            self.calls.push("client-stop-complete");
            AdapterEvent::PauseComplete
        }

        fn complete_self_managed_io_suspend(&mut self) -> AdapterEvent {
            self.calls.push("smio-suspend-complete");
            AdapterEvent::PauseComplete
        }

        fn release(&mut self) -> AdapterEvent {
            self.calls.push("release");
            AdapterEvent::HaltComplete
        }
    }

    fn machine() -> StateMachine<AdapterDef> {
        StateMachine::new(StateObserver::default())
    }

    #[test]
    fn full_lifecycle() {
        let mut cx = Script::new();
        let mut sm = machine();
        sm.enqueue(AdapterEvent::ClientStart, &mut cx);
        assert_eq!(sm.state(), AdapterState::Paused);
        sm.enqueue(AdapterEvent::DatapathStart, &mut cx);
        assert_eq!(sm.state(), AdapterState::Running);
        sm.enqueue(AdapterEvent::DatapathPause, &mut cx);
        assert_eq!(sm.state(), AdapterState::Paused);
        sm.enqueue(AdapterEvent::ClientHalt, &mut cx);
        assert_eq!(sm.state(), AdapterState::Halted);
        assert_eq!(
            cx.calls,
            [
                "initialize",
                "smio-init",
                "should-start",
                "start-datapath",
                "stop-datapath",
                "release"
            ]
        );
        assert_eq!(sm.defects(), 0);
    }

    #[test]
    fn client_vetoes_restart() {
        let mut cx = Script::new();
        cx.allow_start = false;
        let mut sm = machine();
        sm.enqueue(AdapterEvent::ClientStart, &mut cx);
        sm.enqueue(AdapterEvent::DatapathStart, &mut cx);
        assert_eq!(sm.state(), AdapterState::Paused);
        assert!(cx.calls.contains(&"should-start"));
        assert!(!cx.calls.contains(&"start-datapath"));
    }

    #[test]
    fn initialize_failure_returns_to_halted() {
        let mut cx = Script::new();
        cx.fail_initialize = true;
        let mut sm = machine();
        sm.enqueue(AdapterEvent::ClientStart, &mut cx);
        assert_eq!(sm.state(), AdapterState::Halted);
        // Self-managed I/O init was never reached.
        assert_eq!(cx.calls, ["initialize"]);
    }

    #[test]
    fn overlapping_pause_reasons_each_complete() {
        let mut cx = Script::new();
        let mut sm = machine();
        sm.enqueue(AdapterEvent::ClientStart, &mut cx);
        sm.enqueue(AdapterEvent::ClientStop, &mut cx);
        assert_eq!(sm.state(), AdapterState::Paused);
        assert!(cx.calls.contains(&"client-stop-complete"));
        sm.enqueue(AdapterEvent::SelfManagedIoSuspend, &mut cx);
        assert_eq!(sm.state(), AdapterState::Paused);
        assert!(cx.calls.contains(&"smio-suspend-complete"));
        assert_eq!(sm.defects(), 0);
    }

    /// No entry function runs and no state changes for any pair outside the
    /// closed table.
    #[test]
    fn closed_table_enumeration() {
        for &state in AdapterDef::ALL_STATES {
            for &event in AdapterDef::ALL_EVENTS {
                let defined = AdapterDef::transitions(state)
                    .iter()
                    .any(|(e, _)| *e == event);
                let ignored = AdapterDef::ignored(state).contains(&event);
                if defined || ignored {
                    continue;
                }
                let mut cx = Script::new();
                let mut sm = machine();
                // Force the machine into the state under test without
                // running entries.
                sm.state = state;
                sm.enqueue(event, &mut cx);
                assert_eq!(sm.state(), state, "{state:?} x {event:?}");
                assert!(cx.calls.is_empty(), "{state:?} x {event:?} ran an entry");
                assert_eq!(sm.defects(), 1);
            }
        }
    }
}
