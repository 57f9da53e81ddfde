//! Mock adapter driver used by the translation tests: a loopback-style
//! device that fills receive slots from an injected frame queue and records
//! transmitted frames.

use crate::driver::AdapterDriver;
use crate::driver::RxQueueDriver;
use crate::driver::RxQueueInit;
use crate::driver::TxQueueDriver;
use crate::driver::TxQueueInit;
use crate::BouncePool;
use net_defs::DatapathCapabilities;
use net_defs::FragmentControl;
use net_defs::PacketDescriptor;
use net_defs::PacketFlags;
use net_defs::MappingRequirement;
use net_defs::RxBufferAllocationMode;
use net_defs::RxCapabilities;
use net_defs::TxCapabilities;
use net_nbl::ExternalMemory;
use net_pool::bytes::alloc_bytes;
use net_pool::BufferPool;
use net_ring::RingPair;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::Arc;

pub fn rx_caps(mode: RxBufferAllocationMode) -> RxCapabilities {
    RxCapabilities {
        ring_capacity: 8,
        fragment_ring_capacity: 8,
        allocation_mode: mode,
        maximum_frame_size: 1500,
        alignment: 64,
        alignment_offset: 0,
        maximum_physical_address: u64::MAX,
        mapping: MappingRequirement::None,
    }
}

pub fn tx_caps() -> TxCapabilities {
    TxCapabilities {
        ring_capacity: 8,
        fragment_ring_capacity: 16,
        maximum_fragment_count: 4,
        maximum_fragment_size: 2048,
        fragment_alignment: 64,
        maximum_physical_address: u64::MAX,
        mapping: MappingRequirement::None,
        backfill: 0,
    }
}

/// Externally owned frame memory registered by address so the mock device
/// can resolve fragment descriptors the way hardware resolves DMA.
#[derive(Clone, Default)]
pub struct ExternalSpace {
    ranges: Arc<Mutex<Vec<(u64, Arc<[std::sync::atomic::AtomicU8]>)>>>,
}

impl ExternalSpace {
    pub fn register(&self, base: u64, data: &[u8]) -> ExternalMemory {
        let bytes: Arc<[std::sync::atomic::AtomicU8]> = alloc_bytes(data.len()).into();
        net_pool::bytes::atomic_write(&bytes, data);
        self.ranges.lock().push((base, bytes.clone()));
        ExternalMemory {
            base_address: base,
            bytes,
        }
    }

    pub fn read(&self, address: u64, len: usize) -> Option<Vec<u8>> {
        let ranges = self.ranges.lock();
        for (base, bytes) in ranges.iter() {
            let end = base + bytes.len() as u64;
            if address >= *base && address + len as u64 <= end {
                let offset = (address - base) as usize;
                let mut out = vec![0; len];
                net_pool::bytes::atomic_read(&bytes[offset..offset + len], &mut out);
                return Some(out);
            }
        }
        None
    }
}

#[derive(Default)]
pub struct MockState {
    /// Frames the "hardware" will deliver to receive slots.
    pub rx_frames: Mutex<VecDeque<Vec<u8>>>,
    /// Frames the "hardware" transmitted.
    pub tx_frames: Mutex<Vec<Vec<u8>>>,
    /// Overrides the valid length the device reports, to exercise the
    /// oversized-completion drop path.
    pub bad_valid_length: Mutex<Option<u32>>,
    pub rx_armed: AtomicBool,
    pub tx_armed: AtomicBool,
    /// Return contexts handed back in driver-owned mode.
    pub returned_contexts: Mutex<Vec<u64>>,
    pub next_context: AtomicU64,
}

pub struct MockAdapter {
    pub caps: DatapathCapabilities,
    pub state: Arc<MockState>,
    pub external: ExternalSpace,
}

impl MockAdapter {
    pub fn new(caps: DatapathCapabilities) -> Self {
        Self {
            caps,
            state: Arc::new(MockState::default()),
            external: ExternalSpace::default(),
        }
    }
}

impl AdapterDriver for MockAdapter {
    fn datapath_capabilities(&self) -> DatapathCapabilities {
        self.caps.clone()
    }

    fn create_rx_queue(&self, init: RxQueueInit) -> anyhow::Result<Box<dyn RxQueueDriver>> {
        Ok(Box::new(MockRxDriver {
            pool: init.pool,
            state: self.state.clone(),
            mode: self.caps.rx.allocation_mode,
            owned: Mutex::new(Vec::new()),
        }))
    }

    fn create_tx_queue(&self, init: TxQueueInit) -> anyhow::Result<Box<dyn TxQueueDriver>> {
        Ok(Box::new(MockTxDriver {
            bounce: init.bounce,
            state: self.state.clone(),
            external: self.external.clone(),
        }))
    }
}

pub struct MockRxDriver {
    pool: BufferPool,
    state: Arc<MockState>,
    mode: RxBufferAllocationMode,
    /// Driver-owned buffers lent out, by return context.
    owned: Mutex<Vec<(u64, ExternalMemory)>>,
}

impl RxQueueDriver for MockRxDriver {
    fn advance(&mut self, rings: &mut RingPair) {
        while rings.packets().hardware_owned() > 0 {
            let Some(frame) = self.state.rx_frames.lock().pop_front() else {
                break;
            };
            let packet_cursor = rings.packets().completed_cursor();
            let fragment_cursor = rings.fragments().completed_cursor();
            let mut fragment = *rings.fragments().get(fragment_cursor);
            let reported_len = self
                .state
                .bad_valid_length
                .lock()
                .take()
                .unwrap_or(frame.len() as u32);
            match self.mode {
                RxBufferAllocationMode::OsAllocatesAndAttaches => {
                    let va = rings.fragment_virtual_address(fragment_cursor);
                    self.pool.write(va, fragment.offset as usize, &frame);
                }
                RxBufferAllocationMode::OsAllocatesOnly => {
                    let buffer = self.pool.allocate().expect("mock pool sized for ring");
                    net_pool::bytes::atomic_write(buffer.data(), &frame);
                    fragment.offset = 0;
                    fragment.capacity = buffer.capacity() as u32;
                    rings.set_fragment_virtual_address(fragment_cursor, buffer.into_address());
                }
                RxBufferAllocationMode::DriverOwned => {
                    let context = self.state.next_context.fetch_add(1, Relaxed) + 1;
                    let base = 0xd000_0000 + context * 0x1_0000;
                    let bytes: Arc<[std::sync::atomic::AtomicU8]> =
                        alloc_bytes(frame.len().max(64)).into();
                    net_pool::bytes::atomic_write(&bytes, &frame);
                    let memory = ExternalMemory {
                        base_address: base,
                        bytes,
                    };
                    self.owned.lock().push((base, memory));
                    fragment.offset = 0;
                    rings.set_fragment_virtual_address(fragment_cursor, base);
                    rings.set_fragment_mdl(fragment_cursor, context);
                }
            }
            fragment.valid_length = reported_len;
            fragment.control = FragmentControl::new().with_last(true);
            *rings.fragments_mut().get_mut(fragment_cursor) = fragment;
            *rings.packets_mut().get_mut(packet_cursor) = PacketDescriptor {
                fragment_index: fragment_cursor,
                fragment_count: 1,
                flags: PacketFlags::new(),
                layout: Default::default(),
            };
            rings.packets_mut().complete(1);
            rings.fragments_mut().complete(1);
        }
    }

    fn cancel(&mut self, rings: &mut RingPair) {
        while rings.packets().hardware_owned() > 0 {
            let packet_cursor = rings.packets().completed_cursor();
            let fragment_cursor = rings.fragments().completed_cursor();
            *rings.packets_mut().get_mut(packet_cursor) = PacketDescriptor {
                fragment_index: fragment_cursor,
                fragment_count: 1,
                flags: PacketFlags::new().with_ignore(true),
                layout: Default::default(),
            };
            rings.packets_mut().complete(1);
            rings.fragments_mut().complete(1);
        }
    }

    fn set_armed(&mut self, armed: bool) {
        self.state.rx_armed.store(armed, Relaxed);
    }

    fn return_rx_buffer(&mut self, return_context: u64) {
        self.state.returned_contexts.lock().push(return_context);
        let base = 0xd000_0000 + return_context * 0x1_0000;
        self.owned.lock().retain(|(b, _)| *b != base);
    }

    fn map_rx_buffer(&self, virtual_address: u64) -> Option<ExternalMemory> {
        self.owned
            .lock()
            .iter()
            .find(|(base, _)| *base == virtual_address)
            .map(|(_, memory)| memory.clone())
    }
}

pub struct MockTxDriver {
    bounce: BouncePool,
    state: Arc<MockState>,
    external: ExternalSpace,
}

impl MockTxDriver {
    fn resolve(&self, address: u64, len: u32) -> Option<Vec<u8>> {
        if let Some(bytes) = self.bounce.resolve(address, len) {
            let mut out = vec![0; len as usize];
            net_pool::bytes::atomic_read(bytes, &mut out);
            return Some(out);
        }
        self.external.read(address, len as usize)
    }
}

impl TxQueueDriver for MockTxDriver {
    fn advance(&mut self, rings: &mut RingPair) {
        while rings.packets().hardware_owned() > 0 {
            let packet_cursor = rings.packets().completed_cursor();
            let descriptor = *rings.packets().get(packet_cursor);
            if !descriptor.flags.ignore() {
                let mut frame = Vec::new();
                for i in 0..u32::from(descriptor.fragment_count) {
                    let cursor = descriptor.fragment_index.wrapping_add(i);
                    let fragment = *rings.fragments().get(cursor);
                    let va = rings.fragment_virtual_address(cursor);
                    match self.resolve(va, fragment.valid_length) {
                        Some(data) => frame.extend_from_slice(&data),
                        None => panic!("unresolvable fragment address {va:#x}"),
                    }
                }
                self.state.tx_frames.lock().push(frame);
            }
            rings.packets_mut().complete(1);
            if descriptor.fragment_count > 0 {
                rings
                    .fragments_mut()
                    .complete(u32::from(descriptor.fragment_count));
            }
        }
    }

    fn cancel(&mut self, rings: &mut RingPair) {
        while rings.packets().hardware_owned() > 0 {
            let packet_cursor = rings.packets().completed_cursor();
            let descriptor = *rings.packets().get(packet_cursor);
            rings.packets_mut().complete(1);
            if descriptor.fragment_count > 0 {
                rings
                    .fragments_mut()
                    .complete(u32::from(descriptor.fragment_count));
            }
        }
    }

    fn set_armed(&mut self, armed: bool) {
        self.state.tx_armed.store(armed, Relaxed);
    }
}
