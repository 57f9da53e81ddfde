//! Device lifecycle: hosts one or more adapters, the device PnP machine,
//! and the nested power sub-machine that gates the datapath across power
//! transitions.

use crate::Adapter;
use net_fsm::device::DeviceContext;
use net_fsm::device::DeviceDef;
use net_fsm::device::DeviceEvent;
use net_fsm::device::DeviceState;
use net_fsm::device::PowerContext;
use net_fsm::device::PowerDef;
use net_fsm::device::PowerEvent;
use net_fsm::device::PowerState;
use net_fsm::StateMachine;
use net_fsm::StateObserver;
use net_fsm::adapter::AdapterState;
use parking_lot::Mutex;
use std::sync::Arc;

struct DeviceRuntime {
    adapters: Vec<Arc<Adapter>>,
}

impl DeviceRuntime {
    fn halt_adapters(&mut self) {
        for adapter in &self.adapters {
            adapter.client_halt();
        }
    }
}

impl DeviceContext for DeviceRuntime {
    fn report_start(&mut self) -> DeviceEvent {
        DeviceEvent::ReportedToStack
    }

    fn wait_initialize(&mut self) -> Option<DeviceEvent> {
        for adapter in &self.adapters {
            if adapter.client_start().is_err() {
                return Some(DeviceEvent::InitializeFailed);
            }
        }
        Some(DeviceEvent::InitializeComplete)
    }

    fn platform_reset(&mut self) -> DeviceEvent {
        // Bounce the datapath: pause every adapter, then let the stack
        // decide about restarting.
        for adapter in &self.adapters {
            if adapter.state() == AdapterState::Running {
                adapter.datapath_pause();
            }
        }
        DeviceEvent::ResetComplete
    }

    fn surprise_removed(&mut self) -> DeviceEvent {
        // Queues cancel before anything is released.
        self.halt_adapters();
        DeviceEvent::ReleaseComplete
    }

    fn release(&mut self) -> DeviceEvent {
        self.halt_adapters();
        DeviceEvent::ReleaseComplete
    }
}

struct PowerRuntime {
    adapters: Vec<Arc<Adapter>>,
}

impl PowerContext for PowerRuntime {
    fn suspend(&mut self) -> PowerEvent {
        for adapter in &self.adapters {
            if adapter.state() == AdapterState::Running {
                adapter.datapath_pause();
            }
            adapter.self_managed_io_suspend();
        }
        PowerEvent::PowerDownComplete
    }

    fn resume(&mut self) -> PowerEvent {
        for adapter in &self.adapters {
            adapter.datapath_start();
        }
        PowerEvent::PowerUpComplete
    }
}

struct DeviceHost {
    machine: StateMachine<DeviceDef>,
    runtime: DeviceRuntime,
}

struct PowerHost {
    machine: StateMachine<PowerDef>,
    runtime: PowerRuntime,
}

/// One device hosting adapters and their lifecycle machines. Events may be
/// posted from arbitrary callback contexts.
pub struct Device {
    machine: Mutex<DeviceHost>,
    power: Mutex<PowerHost>,
}

impl Device {
    pub fn new(adapters: Vec<Arc<Adapter>>) -> Arc<Self> {
        Arc::new(Self {
            machine: Mutex::new(DeviceHost {
                machine: StateMachine::new(StateObserver::default()),
                runtime: DeviceRuntime {
                    adapters: adapters.clone(),
                },
            }),
            power: Mutex::new(PowerHost {
                machine: StateMachine::new(StateObserver::default()),
                runtime: PowerRuntime { adapters },
            }),
        })
    }

    fn post(&self, event: DeviceEvent) {
        let mut host = self.machine.lock();
        let host = &mut *host;
        host.machine.enqueue(event, &mut host.runtime);
    }

    pub fn state(&self) -> DeviceState {
        self.machine.lock().machine.state()
    }

    pub fn power_state(&self) -> PowerState {
        self.power.lock().machine.state()
    }

    pub fn start(&self) {
        self.post(DeviceEvent::StartRequest);
    }

    pub fn remove(&self) {
        self.post(DeviceEvent::RemoveRequest);
    }

    pub fn surprise_remove(&self) {
        self.post(DeviceEvent::SurpriseRemove);
    }

    pub fn platform_reset(&self) {
        self.post(DeviceEvent::PlatformReset);
    }

    fn post_power(&self, event: PowerEvent) {
        // The power sub-machine only runs while the device is started.
        if self.state() != DeviceState::Started {
            tracing::debug!(state = ?self.state(), ?event, "power event outside Started ignored");
            return;
        }
        let mut host = self.power.lock();
        let host = &mut *host;
        host.machine.enqueue(event, &mut host.runtime);
    }

    pub fn power_down(&self) {
        self.post_power(PowerEvent::PowerDown);
    }

    pub fn power_up(&self) {
        self.post_power(PowerEvent::PowerUp);
    }
}
