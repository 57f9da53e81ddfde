//! The device lifecycle machine and its nested power sub-machine.

use crate::StateMachineDef;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Added,
    StartingReportToStack,
    StartingWaitForInit,
    Started,
    Resetting,
    ReleasingSurpriseRemoved,
    Releasing,
    Removed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    StartRequest,
    ReportedToStack,
    InitializeComplete,
    InitializeFailed,
    PlatformReset,
    ResetComplete,
    SurpriseRemove,
    RemoveRequest,
    ReleaseComplete,
}

pub trait DeviceContext {
    fn report_start(&mut self) -> DeviceEvent;
    fn wait_initialize(&mut self) -> Option<DeviceEvent>;
    fn platform_reset(&mut self) -> DeviceEvent;
    fn surprise_removed(&mut self) -> DeviceEvent;
    fn release(&mut self) -> DeviceEvent;
}

pub struct DeviceDef;

impl StateMachineDef for DeviceDef {
    type State = DeviceState;
    type Event = DeviceEvent;
    type Context = dyn DeviceContext;

    const NAME: &'static str = "device";

    const ALL_STATES: &'static [DeviceState] = &[
        DeviceState::Added,
        DeviceState::StartingReportToStack,
        DeviceState::StartingWaitForInit,
        DeviceState::Started,
        DeviceState::Resetting,
        DeviceState::ReleasingSurpriseRemoved,
        DeviceState::Releasing,
        DeviceState::Removed,
    ];

    const ALL_EVENTS: &'static [DeviceEvent] = &[
        DeviceEvent::StartRequest,
        DeviceEvent::ReportedToStack,
        DeviceEvent::InitializeComplete,
        DeviceEvent::InitializeFailed,
        DeviceEvent::PlatformReset,
        DeviceEvent::ResetComplete,
        DeviceEvent::SurpriseRemove,
        DeviceEvent::RemoveRequest,
        DeviceEvent::ReleaseComplete,
    ];

    fn initial() -> DeviceState {
        DeviceState::Added
    }

    fn transitions(state: DeviceState) -> &'static [(DeviceEvent, DeviceState)] {
        use DeviceEvent as E;
        use DeviceState as S;
        match state {
            S::Added => &[(E::StartRequest, S::StartingReportToStack)],
            S::StartingReportToStack => &[
                (E::ReportedToStack, S::StartingWaitForInit),
                (E::InitializeFailed, S::Releasing),
            ],
            S::StartingWaitForInit => &[
                (E::InitializeComplete, S::Started),
                (E::InitializeFailed, S::Releasing),
                (E::SurpriseRemove, S::ReleasingSurpriseRemoved),
            ],
            S::Started => &[
                (E::PlatformReset, S::Resetting),
                (E::SurpriseRemove, S::ReleasingSurpriseRemoved),
                (E::RemoveRequest, S::Releasing),
            ],
            S::Resetting => &[
                (E::ResetComplete, S::Started),
                (E::SurpriseRemove, S::ReleasingSurpriseRemoved),
            ],
            S::ReleasingSurpriseRemoved => &[(E::ReleaseComplete, S::Removed)],
            S::Releasing => &[(E::ReleaseComplete, S::Removed)],
            S::Removed => &[],
        }
    }

    fn ignored(state: DeviceState) -> &'static [DeviceEvent] {
        use DeviceEvent as E;
        use DeviceState as S;
        match state {
            // A reset requested while a start is in flight is ignored rather
            // than interrupting the start.
            S::StartingReportToStack | S::StartingWaitForInit => &[E::PlatformReset],
            S::Releasing | S::ReleasingSurpriseRemoved => &[E::PlatformReset, E::RemoveRequest],
            S::Removed => &[E::RemoveRequest, E::SurpriseRemove, E::PlatformReset],
            _ => &[],
        }
    }

    fn entry(state: DeviceState, context: &mut (dyn DeviceContext + 'static)) -> Option<DeviceEvent> {
        use DeviceState as S;
        match state {
            S::Added | S::Started | S::Removed => None,
            S::StartingReportToStack => Some(context.report_start()),
            S::StartingWaitForInit => context.wait_initialize(),
            S::Resetting => Some(context.platform_reset()),
            S::ReleasingSurpriseRemoved => Some(context.surprise_removed()),
            S::Releasing => Some(context.release()),
        }
    }
}

/// The power sub-machine hosted by the device machine while `Started`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PowerState {
    D0,
    TransitioningDx,
    Dx,
    TransitioningD0,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PowerEvent {
    PowerDown,
    PowerDownComplete,
    PowerUp,
    PowerUpComplete,
}

pub trait PowerContext {
    /// Pauses the adapter datapath ahead of the low-power transition.
    fn suspend(&mut self) -> PowerEvent;
    /// Restarts the datapath after returning to full power.
    fn resume(&mut self) -> PowerEvent;
}

pub struct PowerDef;

impl StateMachineDef for PowerDef {
    type State = PowerState;
    type Event = PowerEvent;
    type Context = dyn PowerContext;

    const NAME: &'static str = "device-power";

    const ALL_STATES: &'static [PowerState] = &[
        PowerState::D0,
        PowerState::TransitioningDx,
        PowerState::Dx,
        PowerState::TransitioningD0,
    ];

    const ALL_EVENTS: &'static [PowerEvent] = &[
        PowerEvent::PowerDown,
        PowerEvent::PowerDownComplete,
        PowerEvent::PowerUp,
        PowerEvent::PowerUpComplete,
    ];

    fn initial() -> PowerState {
        PowerState::D0
    }

    fn transitions(state: PowerState) -> &'static [(PowerEvent, PowerState)] {
        use PowerEvent as E;
        use PowerState as S;
        match state {
            S::D0 => &[(E::PowerDown, S::TransitioningDx)],
            S::TransitioningDx => &[(E::PowerDownComplete, S::Dx)],
            S::Dx => &[(E::PowerUp, S::TransitioningD0)],
            S::TransitioningD0 => &[(E::PowerUpComplete, S::D0)],
        }
    }

    fn ignored(state: PowerState) -> &'static [PowerEvent] {
        use PowerEvent as E;
        use PowerState as S;
        match state {
            S::D0 => &[E::PowerUp],
            S::Dx => &[E::PowerDown],
            _ => &[],
        }
    }

    fn entry(state: PowerState, context: &mut (dyn PowerContext + 'static)) -> Option<PowerEvent> {
        use PowerState as S;
        match state {
            S::D0 | S::Dx => None,
            S::TransitioningDx => Some(context.suspend()),
            S::TransitioningD0 => Some(context.resume()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StateMachine;
    use crate::StateObserver;

    struct Script {
        calls: Vec<&'static str>,
    }

    impl DeviceContext for Script {
        fn report_start(&mut self) -> DeviceEvent {
            self.calls.push("report-start");
            DeviceEvent::ReportedToStack
        }

        fn wait_initialize(&mut self) -> Option<DeviceEvent> {
            self.calls.push("wait-init");
            None
        }

        fn platform_reset(&mut self) -> DeviceEvent {
            self.calls.push("reset");
            DeviceEvent::ResetComplete
        }

        fn surprise_removed(&mut self) -> DeviceEvent {
            self.calls.push("surprise-removed");
            DeviceEvent::ReleaseComplete
        }

        fn release(&mut self) -> DeviceEvent {
            self.calls.push("release");
            DeviceEvent::ReleaseComplete
        }
    }

    impl PowerContext for Script {
        fn suspend(&mut self) -> PowerEvent {
            self.calls.push("suspend");
            PowerEvent::PowerDownComplete
        }

        fn resume(&mut self) -> PowerEvent {
            self.calls.push("resume");
            PowerEvent::PowerUpComplete
        }
    }

    #[test]
    fn start_is_asynchronous_then_completes() {
        let mut cx = Script { calls: Vec::new() };
        let mut sm = StateMachine::<DeviceDef>::new(StateObserver::default());
        sm.enqueue(DeviceEvent::StartRequest, &mut cx);
        assert_eq!(sm.state(), DeviceState::StartingWaitForInit);
        // Initialization completes later, from a different callback.
        sm.enqueue(DeviceEvent::InitializeComplete, &mut cx);
        assert_eq!(sm.state(), DeviceState::Started);
        assert_eq!(cx.calls, ["report-start", "wait-init"]);
    }

    #[test]
    fn reset_is_ignored_while_start_in_flight() {
        let mut cx = Script { calls: Vec::new() };
        let mut sm = StateMachine::<DeviceDef>::new(StateObserver::default());
        sm.enqueue(DeviceEvent::StartRequest, &mut cx);
        sm.enqueue(DeviceEvent::PlatformReset, &mut cx);
        assert_eq!(sm.state(), DeviceState::StartingWaitForInit);
        assert_eq!(sm.defects(), 0);
        assert!(!cx.calls.contains(&"reset"));
    }

    #[test]
    fn surprise_remove_releases() {
        let mut cx = Script { calls: Vec::new() };
        let mut sm = StateMachine::<DeviceDef>::new(StateObserver::default());
        sm.enqueue(DeviceEvent::StartRequest, &mut cx);
        sm.enqueue(DeviceEvent::InitializeComplete, &mut cx);
        sm.enqueue(DeviceEvent::SurpriseRemove, &mut cx);
        assert_eq!(sm.state(), DeviceState::Removed);
        assert!(cx.calls.contains(&"surprise-removed"));
    }

    #[test]
    fn power_round_trip() {
        let mut cx = Script { calls: Vec::new() };
        let mut sm = StateMachine::<PowerDef>::new(StateObserver::default());
        sm.enqueue(PowerEvent::PowerDown, &mut cx);
        assert_eq!(sm.state(), PowerState::Dx);
        sm.enqueue(PowerEvent::PowerUp, &mut cx);
        assert_eq!(sm.state(), PowerState::D0);
        assert_eq!(cx.calls, ["suspend", "resume"]);
    }

    #[test]
    fn device_closed_table_enumeration() {
        for &state in DeviceDef::ALL_STATES {
            for &event in DeviceDef::ALL_EVENTS {
                let defined = DeviceDef::transitions(state).iter().any(|(e, _)| *e == event);
                let ignored = DeviceDef::ignored(state).contains(&event);
                if defined || ignored {
                    continue;
                }
                let mut cx = Script { calls: Vec::new() };
                let mut sm = StateMachine::<DeviceDef>::new(StateObserver::default());
                sm.state = state;
                sm.enqueue(event, &mut cx);
                assert_eq!(sm.state(), state, "{state:?} x {event:?}");
                assert!(cx.calls.is_empty(), "{state:?} x {event:?} ran an entry");
                assert_eq!(sm.defects(), 1);
            }
        }
    }

    #[test]
    fn power_closed_table_enumeration() {
        for &state in PowerDef::ALL_STATES {
            for &event in PowerDef::ALL_EVENTS {
                let defined = PowerDef::transitions(state).iter().any(|(e, _)| *e == event);
                let ignored = PowerDef::ignored(state).contains(&event);
                if defined || ignored {
                    continue;
                }
                let mut cx = Script { calls: Vec::new() };
                let mut sm = StateMachine::<PowerDef>::new(StateObserver::default());
                sm.state = state;
                sm.enqueue(event, &mut cx);
                assert_eq!(sm.state(), state);
                assert!(cx.calls.is_empty());
            }
        }
    }
}
