//! Adapter lifecycle glue: owns the adapter state machine, creates and
//! destroys the per-queue translation engines and their execution contexts,
//! and wires receive scaling back into the datapath.

pub mod device;

pub use net_translate::driver::AdapterDriver;
pub use net_translate::driver::RxQueueDriver;
pub use net_translate::driver::RxQueueInit;
pub use net_translate::driver::TxQueueDriver;
pub use net_translate::driver::TxQueueInit;

use net_defs::QueueId;
use net_exec::EcConfig;
use net_exec::ExecutionContext;
use net_exec::PollId;
use net_exec::SchedulingHint;
use net_exec::POLL_TYPE_DATAPATH;
use net_fsm::adapter::AdapterContext;
use net_fsm::adapter::AdapterDef;
use net_fsm::adapter::AdapterEvent;
use net_fsm::adapter::AdapterState;
use net_fsm::StateMachine;
use net_fsm::StateObserver;
use net_pool::ChunkSplitConfig;
use net_rss::RssKeywords;
use net_rss::RssManager;
use net_translate::rx::NblReturner;
use net_translate::rx::RxIndicate;
use net_translate::rx::RxQueue;
use net_translate::rx::RxQueueConfig;
use net_translate::tx::TxComplete;
use net_translate::tx::TxQueue;
use net_translate::tx::TxQueueConfig;
use net_translate::tx::TxSender;
use net_translate::DmaMapper;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("operation not permitted in state {0:?}")]
    InvalidState(AdapterState),
    #[error("queue {0:?} does not exist")]
    NoSuchQueue(QueueId),
}

/// Per-queue OS-side entrypoints, supplied by the stack binding when the
/// datapath starts.
pub trait StackBindings: Send {
    fn rx_indicate(&mut self, queue: QueueId) -> Box<dyn RxIndicate>;
    fn tx_complete(&mut self, queue: QueueId) -> Box<dyn TxComplete>;
}

/// Static adapter configuration, collected by [`AdapterBuilder`].
pub struct AdapterConfig {
    pub name: String,
    pub queue_count: u16,
    pub nbl_pool_size: u32,
    pub scheduling: SchedulingHint,
    pub bounce_pages: u32,
    pub split: ChunkSplitConfig,
    /// Client veto consulted before an automatic datapath restart.
    pub should_start: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
}

pub struct AdapterBuilder {
    config: AdapterConfig,
    rss: Option<RssArgs>,
}

struct RssArgs {
    keywords: RssKeywords,
    dispatch: Arc<dyn net_rss::IndirectionDispatch>,
}

impl AdapterBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: AdapterConfig {
                name: name.into(),
                queue_count: 1,
                nbl_pool_size: 64,
                scheduling: SchedulingHint::WorkerThread,
                bounce_pages: 16,
                split: ChunkSplitConfig::default(),
                should_start: None,
            },
            rss: None,
        }
    }

    pub fn queue_count(mut self, count: u16) -> Self {
        self.config.queue_count = count;
        self
    }

    pub fn nbl_pool_size(mut self, size: u32) -> Self {
        self.config.nbl_pool_size = size;
        self
    }

    pub fn scheduling(mut self, hint: SchedulingHint) -> Self {
        self.config.scheduling = hint;
        self
    }

    pub fn bounce_pages(mut self, pages: u32) -> Self {
        self.config.bounce_pages = pages;
        self
    }

    pub fn chunk_split(mut self, split: ChunkSplitConfig) -> Self {
        self.config.split = split;
        self
    }

    pub fn should_start(mut self, veto: Arc<dyn Fn() -> bool + Send + Sync>) -> Self {
        self.config.should_start = Some(veto);
        self
    }

    pub fn receive_scaling(
        mut self,
        keywords: RssKeywords,
        dispatch: Arc<dyn net_rss::IndirectionDispatch>,
    ) -> Self {
        self.rss = Some(RssArgs { keywords, dispatch });
        self
    }

    pub fn build(
        self,
        driver: Arc<dyn AdapterDriver>,
        dma: Option<Arc<dyn DmaMapper>>,
        stack: Box<dyn StackBindings>,
    ) -> Arc<Adapter> {
        let rss = self
            .rss
            .map(|args| Arc::new(RssManager::new(args.keywords, args.dispatch)));
        Arc::new(Adapter {
            machine: Mutex::new(MachineHost {
                machine: StateMachine::new(StateObserver::default()),
                runtime: AdapterRuntime {
                    config: self.config,
                    driver,
                    dma,
                    stack,
                    rss,
                    queues: Vec::new(),
                },
            }),
        })
    }
}

/// One datapath queue pair with its execution contexts.
struct QueuePair {
    queue_id: QueueId,
    rx: Arc<Mutex<RxQueue>>,
    rx_ec: ExecutionContext,
    rx_poll: PollId,
    returner: NblReturner,
    tx: Arc<Mutex<TxQueue>>,
    tx_ec: ExecutionContext,
    tx_poll: PollId,
    sender: TxSender,
}

struct AdapterRuntime {
    config: AdapterConfig,
    driver: Arc<dyn AdapterDriver>,
    dma: Option<Arc<dyn DmaMapper>>,
    stack: Box<dyn StackBindings>,
    rss: Option<Arc<RssManager>>,
    /// Queue id → queue pair; populated only between datapath start and
    /// pause.
    queues: Vec<QueuePair>,
}

impl AdapterRuntime {
    fn ec_config(&self, side: &str, queue: QueueId) -> EcConfig {
        EcConfig {
            name: format!("{}-{side}{}", self.config.name, queue.0),
            scheduling: self.config.scheduling,
            budget: Default::default(),
        }
    }

    fn create_queues(&mut self) -> anyhow::Result<()> {
        assert!(self.queues.is_empty(), "datapath already started");
        let caps = self.driver.datapath_capabilities();
        for number in 0..self.config.queue_count {
            let queue_id = QueueId(number);

            let rx_ec = ExecutionContext::new(self.ec_config("rx", queue_id));
            let indicate = self.stack.rx_indicate(queue_id);
            let (rx_queue, returner) = RxQueue::new(
                RxQueueConfig {
                    queue_id,
                    capabilities: caps.rx.clone(),
                    nbl_pool_size: self.config.nbl_pool_size,
                    split: self.config.split,
                },
                self.driver.as_ref(),
                rx_ec.handle(),
                indicate,
            )?;
            let rx = Arc::new(Mutex::new(rx_queue));
            let rx_poll = {
                let rx = rx.clone();
                rx_ec.register_poll(POLL_TYPE_DATAPATH, Box::new(move || rx.lock().poll()))
            };

            let tx_ec = ExecutionContext::new(self.ec_config("tx", queue_id));
            let completion = self.stack.tx_complete(queue_id);
            let (tx_queue, sender) = TxQueue::new(
                TxQueueConfig {
                    queue_id,
                    capabilities: caps.tx.clone(),
                    bounce_pages: self.config.bounce_pages,
                    split: self.config.split,
                },
                self.driver.as_ref(),
                self.dma.clone(),
                tx_ec.handle(),
                completion,
            )?;
            let tx = Arc::new(Mutex::new(tx_queue));
            let tx_poll = {
                let tx = tx.clone();
                tx_ec.register_poll(POLL_TYPE_DATAPATH, Box::new(move || tx.lock().poll()))
            };

            rx_ec.notify();
            self.queues.push(QueuePair {
                queue_id,
                rx,
                rx_ec,
                rx_poll,
                returner,
                tx,
                tx_ec,
                tx_poll,
                sender,
            });
        }
        if let Some(rss) = &self.rss {
            if let Err(err) = rss.configure() {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "receive scaling reconfiguration failed after restart"
                );
            }
        }
        tracing::info!(
            adapter = self.config.name.as_str(),
            queues = self.queues.len(),
            "datapath started"
        );
        Ok(())
    }

    fn destroy_queues(&mut self) {
        for pair in self.queues.drain(..) {
            // Unregistering blocks until the execution context has applied
            // the change, so the queue is quiesced before teardown touches
            // ring memory.
            pair.rx_ec.unregister_poll(pair.rx_poll);
            pair.rx.lock().shutdown();
            pair.rx_ec.shutdown();

            pair.tx_ec.unregister_poll(pair.tx_poll);
            pair.tx.lock().shutdown();
            pair.tx_ec.shutdown();
        }
        tracing::info!(adapter = self.config.name.as_str(), "datapath stopped");
    }
}

impl AdapterContext for AdapterRuntime {
    fn initialize(&mut self) -> AdapterEvent {
        // The stack report is a plain capability exchange here; a driver
        // that cannot describe its datapath fails the start.
        let caps = self.driver.datapath_capabilities();
        if caps.rx.ring_capacity.is_power_of_two() && caps.tx.ring_capacity.is_power_of_two() {
            AdapterEvent::InitializeSucceeded
        } else {
            tracing::error!(
                adapter = self.config.name.as_str(),
                "driver advertised non-power-of-two ring capacities"
            );
            AdapterEvent::InitializeFailed
        }
    }

    fn self_managed_io_init(&mut self) -> AdapterEvent {
        AdapterEvent::SelfManagedIoInitDone
    }

    fn should_start(&mut self) -> AdapterEvent {
        let allowed = self.config.should_start.as_ref().map_or(true, |veto| veto());
        if allowed {
            AdapterEvent::ClientStartYes
        } else {
            AdapterEvent::ClientStartNo
        }
    }

    fn start_datapath(&mut self) -> Option<AdapterEvent> {
        match self.create_queues() {
            Ok(()) => Some(AdapterEvent::RestartComplete),
            Err(err) => {
                tracing::error!(
                    error = err.as_ref() as &dyn std::error::Error,
                    "failed to start datapath"
                );
                self.destroy_queues();
                Some(AdapterEvent::RestartFailed)
            }
        }
    }

    fn stop_datapath(&mut self) -> Option<AdapterEvent> {
        self.destroy_queues();
        Some(AdapterEvent::PauseComplete)
    }

    fn complete_client_stop(&mut self) -> AdapterEvent {
        AdapterEvent::PauseComplete
    }

    fn complete_self_managed_io_suspend(&mut self) -> AdapterEvent {
        AdapterEvent::PauseComplete
    }

    fn release(&mut self) -> AdapterEvent {
        self.destroy_queues();
        AdapterEvent::HaltComplete
    }
}

struct MachineHost {
    machine: StateMachine<AdapterDef>,
    runtime: AdapterRuntime,
}

/// One network adapter: the state machine instance plus the datapath it
/// gates. Events may be posted from any callback context; the machine's own
/// lock provides the serialization.
pub struct Adapter {
    machine: Mutex<MachineHost>,
}

impl Adapter {
    fn post(&self, event: AdapterEvent) {
        let mut host = self.machine.lock();
        let host = &mut *host;
        host.machine.enqueue(event, &mut host.runtime);
    }

    pub fn state(&self) -> AdapterState {
        self.machine.lock().machine.state()
    }

    /// Client start: initialize and report to the stack, landing in
    /// `Paused`.
    pub fn client_start(&self) -> Result<(), AdapterError> {
        self.post(AdapterEvent::ClientStart);
        match self.state() {
            AdapterState::Paused => Ok(()),
            state => Err(AdapterError::InvalidState(state)),
        }
    }

    /// Stack request to start the datapath; subject to the client veto.
    pub fn datapath_start(&self) {
        self.post(AdapterEvent::DatapathStart);
    }

    pub fn datapath_pause(&self) {
        self.post(AdapterEvent::DatapathPause);
    }

    pub fn client_stop(&self) {
        self.post(AdapterEvent::ClientStop);
    }

    pub fn self_managed_io_suspend(&self) {
        self.post(AdapterEvent::SelfManagedIoSuspend);
    }

    pub fn client_halt(&self) {
        // A running datapath pauses before the halt proceeds.
        if self.state() == AdapterState::Running {
            self.post(AdapterEvent::DatapathPause);
        }
        self.post(AdapterEvent::ClientHalt);
    }

    /// Send handle for one queue; present only while the datapath runs.
    pub fn tx_sender(&self, queue: QueueId) -> Result<TxSender, AdapterError> {
        let host = self.machine.lock();
        host.runtime
            .queues
            .iter()
            .find(|pair| pair.queue_id == queue)
            .map(|pair| pair.sender.clone())
            .ok_or(AdapterError::NoSuchQueue(queue))
    }

    /// Return handle for one receive queue.
    pub fn nbl_returner(&self, queue: QueueId) -> Result<NblReturner, AdapterError> {
        let host = self.machine.lock();
        host.runtime
            .queues
            .iter()
            .find(|pair| pair.queue_id == queue)
            .map(|pair| pair.returner.clone())
            .ok_or(AdapterError::NoSuchQueue(queue))
    }

    /// Applies a receive-scaling parameter set from the control path.
    pub fn set_rss_parameters(&self, payload: &[u8]) -> Result<(), net_rss::RssError> {
        let rss = {
            let host = self.machine.lock();
            host.runtime
                .rss
                .clone()
                .ok_or(net_rss::RssError::InvalidParameter(
                    "receive scaling not configured",
                ))?
        };
        rss.set_parameters(payload)
    }

    pub fn rss(&self) -> Option<Arc<RssManager>> {
        self.machine.lock().runtime.rss.clone()
    }
}
