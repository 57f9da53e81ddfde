//! The adapter-driver dispatch boundary. The translation layer calls these
//! synchronously from the queue's execution context; implementations must be
//! safe to call from the worker thread or an inline dispatch activation.

use crate::BouncePool;
use net_defs::DatapathCapabilities;
use net_defs::QueueId;
use net_exec::EcHandle;
use net_nbl::ExternalMemory;
use net_pool::BufferPool;
use net_ring::RingPair;

/// Everything a driver needs to set up one receive queue. The pool handle
/// gives the driver data access to the buffers named in fragment
/// descriptors.
pub struct RxQueueInit {
    pub queue_id: QueueId,
    pub pool: BufferPool,
    /// Notify handle; the driver calls `notify` when its receive
    /// notification is armed and new completions arrive.
    pub ec: EcHandle,
}

/// Everything a driver needs to set up one transmit queue.
pub struct TxQueueInit {
    pub queue_id: QueueId,
    /// Resolves bounce addresses published in fragment descriptors.
    pub bounce: BouncePool,
    pub ec: EcHandle,
}

pub trait RxQueueDriver: Send {
    /// Consumes posted ring slots (filling packets and fragments) and
    /// returns completed ones by advancing the rings' completion cursors.
    fn advance(&mut self, rings: &mut RingPair);

    /// Cancels outstanding work: the driver completes every posted slot,
    /// marking unfilled packets ignored, before this queue is torn down.
    fn cancel(&mut self, rings: &mut RingPair);

    /// Arms or disarms the receive-available notification.
    fn set_armed(&mut self, armed: bool);

    /// Driver-owned buffer mode only: hands a completed buffer back to the
    /// driver by its per-buffer return context.
    fn return_rx_buffer(&mut self, _return_context: u64) {}

    /// Driver-owned buffer mode only: maps a fragment's virtual address to
    /// readable memory so its data can be transferred into a buffer list.
    fn map_rx_buffer(&self, _virtual_address: u64) -> Option<ExternalMemory> {
        None
    }
}

pub trait TxQueueDriver: Send {
    /// Transmits posted ring slots and returns completed ones by advancing
    /// the rings' completion cursors.
    fn advance(&mut self, rings: &mut RingPair);

    /// Cancels outstanding work; every posted slot completes.
    fn cancel(&mut self, rings: &mut RingPair);

    /// Arms or disarms the transmit-completion notification.
    fn set_armed(&mut self, armed: bool);
}

/// The per-adapter dispatch table supplied by the driver.
pub trait AdapterDriver: Send + Sync {
    fn datapath_capabilities(&self) -> DatapathCapabilities;

    fn create_rx_queue(&self, init: RxQueueInit) -> anyhow::Result<Box<dyn RxQueueDriver>>;

    fn create_tx_queue(&self, init: TxQueueInit) -> anyhow::Result<Box<dyn TxQueueDriver>>;
}
