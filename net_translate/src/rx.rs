//! The receive queue engine: drains the hardware-filled packet ring into
//! legacy buffer lists and indicates them to the stack in batches.
//!
//! One iteration runs five ordered phases: process returned buffer lists,
//! attach fresh buffers to ring slots, yield the rings to the adapter
//! driver, indicate completed packets, and re-evaluate notification arming.

use crate::driver::AdapterDriver;
use crate::driver::RxQueueDriver;
use crate::driver::RxQueueInit;
use crate::layout::parse_frame;
use crate::layout::resolve_frame_layer3;
use anyhow::Context as _;
use net_defs::FragmentControl;
use net_defs::FragmentDescriptor;
use net_defs::PacketDescriptor;
use net_defs::QueueId;
use net_defs::RxBufferAllocationMode;
use net_defs::RxCapabilities;
use net_defs::EXTENSION_CHECKSUM;
use net_defs::EXTENSION_LOGICAL_ADDRESS;
use net_defs::EXTENSION_MDL;
use net_defs::EXTENSION_RSC;
use net_defs::EXTENSION_VIRTUAL_ADDRESS;
use net_defs::MappingRequirement;
use net_exec::EcHandle;
use net_nbl::Mdl;
use net_nbl::MdlMemory;
use net_nbl::NblId;
use net_nbl::NblPool;
use net_nbl::NetBuffer;
use net_nbl::NetBufferList;
use net_pool::BufferPool;
use net_pool::BufferPoolParams;
use net_pool::ChunkAllocator;
use net_pool::ChunkSplitConfig;
use net_pool::MemoryConstraint;
use net_pool::PoolBuffer;
use net_ring::RingPair;
use net_ring::RingPairConfig;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::mpsc;
use std::sync::Arc;

/// Reserved slot holding the list's pool index while it is lent out.
const RESERVED_NBL_ID: usize = 0;
/// Reserved slot holding the driver's buffer return context.
const RESERVED_RETURN_CONTEXT: usize = 1;

// The per-list private context is two pointer-sized values; it must fit the
// lists' reserved area.
const _: () = assert!(2 <= net_nbl::NBL_RESERVED_SLOTS);

/// Bytes of frame prefix copied out for software classification.
const PARSE_PREFIX_LEN: usize = 128;

const CACHE_LINE: u32 = 64;

/// The single OS-facing indication entrypoint. One call per iteration
/// carries every list completed in that iteration.
pub trait RxIndicate: Send {
    fn indicate(&mut self, nbls: Vec<Box<NetBufferList>>);
}

/// Hands indicated buffer lists back to their queue. Clonable; calls may
/// come from any thread.
#[derive(Clone)]
pub struct NblReturner {
    sender: mpsc::Sender<Box<NetBufferList>>,
    pending: Arc<AtomicUsize>,
    armed: Arc<AtomicBool>,
    ec: EcHandle,
}

impl NblReturner {
    pub fn return_nbl(&self, nbl: Box<NetBufferList>) {
        self.pending.fetch_add(1, SeqCst);
        // The queue outlives every lent-out list in normal operation; after
        // teardown returns are dropped on the floor by the dead receiver.
        let _ = self.sender.send(nbl);
        if self.armed.swap(false, SeqCst) {
            self.ec.notify();
        }
    }
}

#[derive(Debug, Default)]
pub struct RxStats {
    pub packets_indicated: u64,
    pub packets_dropped: u64,
    pub buffers_posted: u64,
    pub nbls_returned: u64,
    pub pool_exhausted: u64,
    pub nbl_exhausted: u64,
}

#[derive(Clone, Debug)]
pub struct RxQueueConfig {
    pub queue_id: QueueId,
    pub capabilities: RxCapabilities,
    /// Lists that may be outstanding toward the stack at once.
    pub nbl_pool_size: u32,
    pub split: ChunkSplitConfig,
}

/// Per-queue receive translation engine. Driven by [`Self::poll`] from the
/// queue's execution context.
pub struct RxQueue {
    queue_id: QueueId,
    rings: RingPair,
    driver: Box<dyn RxQueueDriver>,
    pool: BufferPool,
    nbl_pool: NblPool,
    mode: RxBufferAllocationMode,
    frame_size: u32,
    /// Data start offset within each attached buffer, staggered per queue to
    /// spread cache-line pressure. Computed once at creation.
    payload_offset: u32,
    /// Buffers attached to posted fragment slots, by masked fragment index.
    fragment_context: Vec<Option<PoolBuffer>>,
    returned_rx: mpsc::Receiver<Box<NetBufferList>>,
    return_pending: Arc<AtomicUsize>,
    return_armed: Arc<AtomicBool>,
    ec: EcHandle,
    indicate: Box<dyn RxIndicate>,
    outstanding_nbls: usize,
    hw_armed: bool,
    stopping: bool,
    stats: RxStats,
}

impl RxQueue {
    pub fn new(
        config: RxQueueConfig,
        adapter: &dyn AdapterDriver,
        ec: EcHandle,
        indicate: Box<dyn RxIndicate>,
    ) -> anyhow::Result<(Self, NblReturner)> {
        let caps = &config.capabilities;
        let payload_offset = (u32::from(config.queue_id.0) % 4) * CACHE_LINE;

        let (mut pool, requirements) = BufferPool::initialize(BufferPoolParams {
            pool_size: caps.fragment_ring_capacity + config.nbl_pool_size,
            allocate_size: caps.maximum_frame_size + payload_offset,
            alignment_offset: caps.alignment_offset,
            alignment: caps.alignment,
        })
        .context("failed to size receive buffer pool")?;

        let mut chunk_alloc = ChunkAllocator::new(config.split);
        chunk_alloc
            .add_memory_constraints(match caps.mapping {
                MappingRequirement::None => MemoryConstraint::Unmapped,
                MappingRequirement::DmaMapped => MemoryConstraint::DmaMapped {
                    maximum_physical_address: caps.maximum_physical_address,
                },
            })
            .context("failed to record memory constraint")?;
        chunk_alloc
            .initialize()
            .context("failed to initialize chunk allocator")?;
        let chunks = chunk_alloc
            .allocate_memory_chunks(
                requirements.total_size,
                requirements.minimum_chunk_size,
                None,
            )
            .context("failed to allocate receive buffer memory")?;
        pool.add_memory_chunks(chunks);

        let mut fragment_extensions = vec![EXTENSION_VIRTUAL_ADDRESS];
        if caps.mapping == MappingRequirement::DmaMapped {
            fragment_extensions.push(EXTENSION_LOGICAL_ADDRESS);
        }
        if caps.allocation_mode == RxBufferAllocationMode::DriverOwned {
            fragment_extensions.push(EXTENSION_MDL);
        }
        let rings = RingPair::new(&RingPairConfig {
            packet_capacity: caps.ring_capacity,
            fragment_capacity: caps.fragment_ring_capacity,
            packet_extensions: vec![EXTENSION_CHECKSUM, EXTENSION_RSC],
            fragment_extensions,
        })
        .context("failed to create receive rings")?;
        // Resolve extensions once; accessors are valid for the queue's
        // lifetime.
        rings.query_packet_extension(EXTENSION_CHECKSUM)?;
        rings.query_packet_extension(EXTENSION_RSC)?;
        rings.query_fragment_extension(EXTENSION_VIRTUAL_ADDRESS)?;

        let driver = adapter
            .create_rx_queue(RxQueueInit {
                queue_id: config.queue_id,
                pool: pool.clone(),
                ec: ec.clone(),
            })
            .context("failed to create receive queue")?;

        let (sender, returned_rx) = mpsc::channel();
        let return_pending = Arc::new(AtomicUsize::new(0));
        let return_armed = Arc::new(AtomicBool::new(false));
        let returner = NblReturner {
            sender,
            pending: return_pending.clone(),
            armed: return_armed.clone(),
            ec: ec.clone(),
        };

        let fragment_count = caps.fragment_ring_capacity as usize;
        Ok((
            Self {
                queue_id: config.queue_id,
                rings,
                driver,
                pool,
                nbl_pool: NblPool::new(config.nbl_pool_size),
                mode: caps.allocation_mode,
                frame_size: caps.maximum_frame_size,
                payload_offset,
                fragment_context: (0..fragment_count).map(|_| None).collect(),
                returned_rx,
                return_pending,
                return_armed,
                ec,
                indicate,
                outstanding_nbls: 0,
                hw_armed: false,
                stopping: false,
                stats: RxStats::default(),
            },
            returner,
        ))
    }

    pub fn queue_id(&self) -> QueueId {
        self.queue_id
    }

    pub fn stats(&self) -> &RxStats {
        &self.stats
    }

    /// Free buffers in the backing pool.
    pub fn available_buffers(&self) -> usize {
        self.pool.available()
    }

    /// One full iteration of the receive engine; returns the amount of work
    /// performed, for the execution context's idle detection.
    pub fn poll(&mut self) -> u32 {
        if self.stopping {
            return 0;
        }
        // Polling resumed; edges are unnecessary until the queue idles again.
        self.return_armed.store(false, SeqCst);
        if self.hw_armed {
            self.driver.set_armed(false);
            self.hw_armed = false;
        }

        let mut work = 0;
        work += self.process_returned_nbls();
        work += self.post_buffers();
        self.driver.advance(&mut self.rings);
        work += self.indicate_completed();
        self.arm_notifications(work);
        work
    }

    /// Phase 1: recycle buffer lists the stack has handed back.
    fn process_returned_nbls(&mut self) -> u32 {
        let mut count = 0;
        while let Ok(nbl) = self.returned_rx.try_recv() {
            self.return_pending.fetch_sub(1, SeqCst);
            self.release_nbl(nbl);
            count += 1;
        }
        self.stats.nbls_returned += u64::from(count);
        count
    }

    fn release_nbl(&mut self, nbl: Box<NetBufferList>) {
        self.outstanding_nbls -= 1;
        if self.mode == RxBufferAllocationMode::DriverOwned {
            self.driver
                .return_rx_buffer(nbl.reserved(RESERVED_RETURN_CONTEXT));
        }
        let id = NblId(nbl.reserved(RESERVED_NBL_ID) as u32);
        // Resetting the shell drops its MDL chain, releasing pool buffer
        // references for the other allocation modes.
        self.nbl_pool.free(id, nbl);
    }

    /// Phase 2: attach fresh buffers (or bare slots, depending on the
    /// allocation mode) to every free ring slot and hand them to hardware.
    fn post_buffers(&mut self) -> u32 {
        let available = self
            .rings
            .packets()
            .free_slots()
            .min(self.rings.fragments().free_slots());
        let mut posted = 0;
        for _ in 0..available {
            let fragment_cursor = self.rings.fragments().posted_cursor();
            let mut descriptor = FragmentDescriptor {
                offset: self.payload_offset,
                valid_length: 0,
                capacity: self.frame_size,
                control: FragmentControl::new().with_last(true),
            };
            match self.mode {
                RxBufferAllocationMode::OsAllocatesAndAttaches => {
                    let Ok(buffer) = self.pool.allocate() else {
                        self.stats.pool_exhausted += 1;
                        break;
                    };
                    self.rings
                        .set_fragment_virtual_address(fragment_cursor, buffer.address());
                    if self.rings.has_fragment_logical_address() {
                        let logical = buffer
                            .logical_address()
                            .expect("dma pools produce logical addresses");
                        self.rings
                            .set_fragment_logical_address(fragment_cursor, logical);
                    }
                    let index = self.rings.fragments().mask_index(fragment_cursor) as usize;
                    self.fragment_context[index] = Some(buffer);
                }
                RxBufferAllocationMode::OsAllocatesOnly
                | RxBufferAllocationMode::DriverOwned => {
                    // The driver attaches its own buffer when it fills the
                    // slot.
                    descriptor.capacity = 0;
                    self.rings.set_fragment_virtual_address(fragment_cursor, 0);
                }
            }
            *self.rings.fragments_mut().get_mut(fragment_cursor) = descriptor;
            let packet_cursor = self.rings.packets().posted_cursor();
            *self.rings.packets_mut().get_mut(packet_cursor) = PacketDescriptor::default();
            self.rings.fragments_mut().post(1);
            self.rings.packets_mut().post(1);
            posted += 1;
        }
        self.stats.buffers_posted += u64::from(posted);
        posted
    }

    /// Phase 4: walk completions from the last-indicated cursor to the
    /// hardware boundary and indicate them as one batch.
    fn indicate_completed(&mut self) -> u32 {
        let mut chain: Vec<Box<NetBufferList>> = Vec::new();
        let mut processed = 0;
        while self.rings.packets().awaiting_consume() > 0 {
            if self.nbl_pool.available() == 0 {
                // Out of shells; resume from this slot next iteration.
                self.stats.nbl_exhausted += 1;
                break;
            }
            let cursor = self.rings.packets().consumed_cursor();
            let descriptor = *self.rings.packets().get(cursor);
            debug_assert!(
                descriptor.fragment_count == 0
                    || self
                        .rings
                        .fragments()
                        .mask_index(descriptor.fragment_index)
                        == self
                            .rings
                            .fragments()
                            .mask_index(self.rings.fragments().consumed_cursor()),
                "fragments completed out of packet order"
            );
            if let Some(nbl) = self.build_nbl(cursor, &descriptor) {
                chain.push(nbl);
            }
            self.rings.packets_mut().consume(1);
            if descriptor.fragment_count > 0 {
                self.rings
                    .fragments_mut()
                    .consume(u32::from(descriptor.fragment_count));
            }
            processed += 1;
        }
        if !chain.is_empty() {
            self.outstanding_nbls += chain.len();
            self.stats.packets_indicated += chain.len() as u64;
            self.indicate.indicate(chain);
        }
        processed
    }

    /// Builds one buffer list from a completed packet slot, or recycles the
    /// slot's buffers and returns `None` when it cannot be delivered.
    fn build_nbl(
        &mut self,
        packet_cursor: u32,
        descriptor: &PacketDescriptor,
    ) -> Option<Box<NetBufferList>> {
        if descriptor.flags.ignore() || descriptor.fragment_count == 0 {
            self.recycle_fragments(descriptor);
            return None;
        }

        let mut mdls = Vec::with_capacity(usize::from(descriptor.fragment_count));
        let mut total_len = 0u64;
        let mut return_context = None;
        let mut deliverable = true;
        for i in 0..u32::from(descriptor.fragment_count) {
            let fragment_cursor = descriptor.fragment_index.wrapping_add(i);
            let fragment = *self.rings.fragments().get(fragment_cursor);
            total_len += u64::from(fragment.valid_length);
            if self.mode == RxBufferAllocationMode::DriverOwned {
                // Capture the return context before any mapping attempt so a
                // failed map still returns the driver's buffer.
                let context = self.rings.fragment_mdl(fragment_cursor);
                match return_context {
                    None => return_context = Some(context),
                    // A multi-fragment packet whose fragments disagree on
                    // their return context cannot be returned correctly.
                    Some(existing) if existing != context => deliverable = false,
                    Some(_) => {}
                }
            }
            match self.take_fragment_memory(fragment_cursor, &fragment) {
                Some(mdl) => mdls.push(mdl),
                None => deliverable = false,
            }
        }

        if !deliverable || total_len == 0 || total_len > u64::from(self.frame_size) {
            self.stats.packets_dropped += 1;
            // The MDLs built so far drop here, cycling their buffers back to
            // the pool; driver-owned buffers go back through the driver.
            if let Some(context) = return_context {
                self.driver.return_rx_buffer(context);
            }
            return None;
        }

        let Ok((id, mut nbl)) = self.nbl_pool.allocate() else {
            // Checked by the caller; unreachable in practice.
            self.stats.nbl_exhausted += 1;
            return None;
        };

        let mut prefix = [0u8; PARSE_PREFIX_LEN];
        let prefix_len = (total_len as usize).min(PARSE_PREFIX_LEN);
        let data_length = total_len as usize;
        nbl.net_buffers = vec![NetBuffer::new(mdls, 0, data_length)];
        nbl.net_buffers[0].copy_data_to(&mut prefix[..prefix_len]);

        nbl.layout = parse_frame(&prefix[..prefix_len]);
        nbl.frame_layer3 =
            resolve_frame_layer3(descriptor.layout.l3_type(), &prefix[..prefix_len]);
        nbl.rx_checksum = self.rings.rx_checksum(packet_cursor);
        nbl.rsc = self.rings.rsc(packet_cursor);
        nbl.set_reserved(RESERVED_NBL_ID, u64::from(id.0));
        nbl.set_reserved(RESERVED_RETURN_CONTEXT, return_context.unwrap_or(0));
        Some(nbl)
    }

    /// Transfers a completed fragment's buffer out of the ring slot.
    fn take_fragment_memory(
        &mut self,
        fragment_cursor: u32,
        fragment: &FragmentDescriptor,
    ) -> Option<Mdl> {
        let end = fragment.offset as usize + fragment.valid_length as usize;
        match self.mode {
            RxBufferAllocationMode::OsAllocatesAndAttaches => {
                let index = self.rings.fragments().mask_index(fragment_cursor) as usize;
                let buffer = self.fragment_context[index].take()?;
                if end > buffer.capacity() {
                    return None;
                }
                Some(Mdl::with_offset(
                    MdlMemory::Pool(buffer),
                    fragment.offset as usize,
                    fragment.valid_length as usize,
                ))
            }
            RxBufferAllocationMode::OsAllocatesOnly => {
                let address = self.rings.fragment_virtual_address(fragment_cursor);
                let buffer = self.pool.adopt(address);
                if end > buffer.capacity() {
                    return None;
                }
                Some(Mdl::with_offset(
                    MdlMemory::Pool(buffer),
                    fragment.offset as usize,
                    fragment.valid_length as usize,
                ))
            }
            RxBufferAllocationMode::DriverOwned => {
                let address = self.rings.fragment_virtual_address(fragment_cursor);
                let memory = self.driver.map_rx_buffer(address)?;
                if end > memory.bytes.len() {
                    return None;
                }
                Some(Mdl::with_offset(
                    MdlMemory::External(memory),
                    fragment.offset as usize,
                    fragment.valid_length as usize,
                ))
            }
        }
    }

    /// Recycles the buffers of a slot that will not be indicated.
    fn recycle_fragments(&mut self, descriptor: &PacketDescriptor) {
        let mut returned = None;
        for i in 0..u32::from(descriptor.fragment_count) {
            let fragment_cursor = descriptor.fragment_index.wrapping_add(i);
            match self.mode {
                RxBufferAllocationMode::OsAllocatesAndAttaches => {
                    let index = self.rings.fragments().mask_index(fragment_cursor) as usize;
                    drop(self.fragment_context[index].take());
                }
                RxBufferAllocationMode::OsAllocatesOnly => {
                    let address = self.rings.fragment_virtual_address(fragment_cursor);
                    if address != 0 {
                        self.pool.free_by_address(address);
                    }
                }
                RxBufferAllocationMode::DriverOwned => {
                    let context = self.rings.fragment_mdl(fragment_cursor);
                    if returned != Some(context) {
                        self.driver.return_rx_buffer(context);
                        returned = Some(context);
                    }
                }
            }
        }
        if descriptor.fragment_count > 0 && !descriptor.flags.ignore() {
            self.stats.packets_dropped += 1;
        }
    }

    /// Phase 5: never leave both wake sources disarmed while idle.
    fn arm_notifications(&mut self, work: u32) {
        if work != 0 {
            return;
        }
        self.return_armed.store(true, SeqCst);
        if self.return_pending.load(SeqCst) > 0 {
            // A list came back between the drain and arming; make sure the
            // execution context polls again.
            self.ec.notify();
        }
        if self.outstanding_nbls == 0 && !self.hw_armed {
            self.driver.set_armed(true);
            self.hw_armed = true;
        }
    }

    /// Ordered teardown: stop accepting hardware completions before the
    /// OS-facing path is released.
    pub fn shutdown(&mut self) {
        self.stopping = true;
        self.return_armed.store(false, SeqCst);
        if self.hw_armed {
            self.driver.set_armed(false);
            self.hw_armed = false;
        }
        self.driver.cancel(&mut self.rings);

        // Consume whatever the cancellation completed, recycling instead of
        // indicating.
        while self.rings.packets().awaiting_consume() > 0 {
            let cursor = self.rings.packets().consumed_cursor();
            let descriptor = *self.rings.packets().get(cursor);
            self.recycle_fragments(&descriptor);
            self.rings.packets_mut().consume(1);
            if descriptor.fragment_count > 0 {
                self.rings
                    .fragments_mut()
                    .consume(u32::from(descriptor.fragment_count));
            }
        }

        // Forcibly reclaim buffers still attached at the hardware boundary.
        let reclaimed = self
            .fragment_context
            .iter_mut()
            .filter_map(Option::take)
            .count();
        if self.rings.packets().hardware_owned() > 0 {
            tracing::warn!(
                queue = self.queue_id.0,
                owned = self.rings.packets().hardware_owned(),
                reclaimed,
                "driver retained ring slots past cancellation"
            );
        }

        // Drain any returns that raced teardown.
        while let Ok(nbl) = self.returned_rx.try_recv() {
            self.return_pending.fetch_sub(1, SeqCst);
            self.release_nbl(nbl);
        }
        if self.outstanding_nbls > 0 {
            tracing::warn!(
                queue = self.queue_id.0,
                outstanding = self.outstanding_nbls,
                "receive queue torn down with lists outstanding"
            );
        }
    }
}
