//! The transmit queue engine: converts legacy buffer lists into ring
//! fragments (zero-copy where addressable, bounced through owned buffers
//! otherwise) and reclaims completed packets in ring order.

use crate::bounce::BouncePool;
use crate::driver::AdapterDriver;
use crate::driver::TxQueueDriver;
use crate::driver::TxQueueInit;
use crate::layout::parse_frame;
use crate::DmaMapper;
use crate::SgList;
use anyhow::Context as _;
use arrayvec::ArrayVec;
use net_defs::FragmentControl;
use net_defs::FragmentDescriptor;
use net_defs::PacketDescriptor;
use net_defs::PacketFlags;
use net_defs::QueueId;
use net_defs::TxCapabilities;
use net_defs::EXTENSION_CHECKSUM;
use net_defs::EXTENSION_LOGICAL_ADDRESS;
use net_defs::EXTENSION_LSO;
use net_defs::EXTENSION_VIRTUAL_ADDRESS;
use net_defs::MappingRequirement;
use net_exec::EcHandle;
use net_nbl::NetBuffer;
use net_nbl::NetBufferList;
use net_pool::ChunkAllocator;
use net_pool::ChunkSplitConfig;
use net_pool::MemoryConstraint;
use net_pool::PAGE_SIZE;
use net_ring::RingPair;
use net_ring::RingPairConfig;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Hard ceiling on per-packet fragments the staging buffers support; the
/// adapter's advertised budget must fit inside it.
pub const MAX_TX_FRAGMENTS: usize = 32;

/// Bytes of frame prefix copied out for software classification.
const PARSE_PREFIX_LEN: usize = 128;

/// The OS-facing batch completion entrypoint.
pub trait TxComplete: Send {
    fn complete(&mut self, nbls: Vec<Box<NetBufferList>>);
}

/// Queues buffer lists for transmission. Clonable; the send path runs on
/// arbitrary threads and wakes the queue's execution context.
#[derive(Clone)]
pub struct TxSender {
    incoming: Arc<Mutex<VecDeque<Box<NetBufferList>>>>,
    ec: EcHandle,
}

impl TxSender {
    pub fn send(&self, nbls: impl IntoIterator<Item = Box<NetBufferList>>) {
        self.incoming.lock().extend(nbls);
        self.ec.notify();
    }
}

#[derive(Debug, Default)]
pub struct TxStats {
    pub packets_sent: u64,
    pub packets_completed: u64,
    pub packets_dropped: u64,
    pub packets_bounced: u64,
    pub translation_retries: u64,
}

#[derive(Clone, Debug)]
pub struct TxQueueConfig {
    pub queue_id: QueueId,
    pub capabilities: TxCapabilities,
    /// Bounce ring size, in pages.
    pub bounce_pages: u32,
    pub split: ChunkSplitConfig,
}

struct PendingNbl {
    nbl: Box<NetBufferList>,
    next_segment: usize,
}

#[derive(Default)]
struct TxSlotContext {
    /// Present only on the slot carrying the list's final segment; completion
    /// of that slot completes the list.
    nbl: Option<Box<NetBufferList>>,
    bounce_len: u32,
    dma: Option<SgList>,
}

/// One fragment staged before commitment; nothing touches the ring until the
/// whole packet translates.
#[derive(Copy, Clone)]
struct StagedFragment {
    virtual_address: u64,
    logical_address: u64,
    length: u32,
}

enum SegmentOutcome {
    Committed {
        fragment_index: u32,
        fragment_count: u16,
        bounce_len: u32,
        dma: Option<SgList>,
    },
    /// Ring or bounce space is temporarily unavailable; retry next iteration
    /// preserving order.
    Retry,
    /// Permanently untranslatable; the segment is dropped and counted.
    Drop,
}

enum StageError {
    BounceRequired,
    Retry,
    Drop,
}

/// Per-queue transmit translation engine. Driven by [`Self::poll`] from the
/// queue's execution context.
pub struct TxQueue {
    queue_id: QueueId,
    rings: RingPair,
    driver: Box<dyn TxQueueDriver>,
    caps: TxCapabilities,
    dma: Option<Arc<dyn DmaMapper>>,
    bounce: BouncePool,
    incoming: Arc<Mutex<VecDeque<Box<NetBufferList>>>>,
    pending: VecDeque<PendingNbl>,
    slot_context: Vec<TxSlotContext>,
    completion: Box<dyn TxComplete>,
    hw_armed: bool,
    stopping: bool,
    stats: TxStats,
}

impl TxQueue {
    pub fn new(
        config: TxQueueConfig,
        adapter: &dyn AdapterDriver,
        dma: Option<Arc<dyn DmaMapper>>,
        ec: EcHandle,
        completion: Box<dyn TxComplete>,
    ) -> anyhow::Result<(Self, TxSender)> {
        let caps = config.capabilities.clone();
        if usize::from(caps.maximum_fragment_count) > MAX_TX_FRAGMENTS {
            anyhow::bail!(
                "fragment budget {} exceeds supported maximum {MAX_TX_FRAGMENTS}",
                caps.maximum_fragment_count
            );
        }
        if caps.mapping == MappingRequirement::DmaMapped && dma.is_none() {
            anyhow::bail!("dma-mapped transmit requires a dma mapper");
        }

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
        let bounce_bytes = config.bounce_pages as usize * PAGE_SIZE;
        let chunks = chunk_alloc
            .allocate_memory_chunks(bounce_bytes, bounce_bytes, None)
            .context("failed to allocate bounce buffer memory")?;
        let bounce = BouncePool::new(
            chunks
                .into_iter()
                .next()
                .context("bounce allocation yielded no chunk")?,
        );

        let mut fragment_extensions = vec![EXTENSION_VIRTUAL_ADDRESS];
        if caps.mapping == MappingRequirement::DmaMapped {
            fragment_extensions.push(EXTENSION_LOGICAL_ADDRESS);
        }
        let rings = RingPair::new(&RingPairConfig {
            packet_capacity: caps.ring_capacity,
            fragment_capacity: caps.fragment_ring_capacity,
            packet_extensions: vec![EXTENSION_CHECKSUM, EXTENSION_LSO],
            fragment_extensions,
        })
        .context("failed to create transmit rings")?;
        rings.query_packet_extension(EXTENSION_CHECKSUM)?;
        rings.query_packet_extension(EXTENSION_LSO)?;
        rings.query_fragment_extension(EXTENSION_VIRTUAL_ADDRESS)?;

        let driver = adapter
            .create_tx_queue(TxQueueInit {
                queue_id: config.queue_id,
                bounce: bounce.clone(),
                ec: ec.clone(),
            })
            .context("failed to create transmit queue")?;

        let incoming = Arc::new(Mutex::new(VecDeque::new()));
        let sender = TxSender {
            incoming: incoming.clone(),
            ec,
        };
        let slot_count = caps.ring_capacity as usize;
        Ok((
            Self {
                queue_id: config.queue_id,
                rings,
                driver,
                caps,
                dma,
                bounce,
                incoming,
                pending: VecDeque::new(),
                slot_context: (0..slot_count).map(|_| TxSlotContext::default()).collect(),
                completion,
                hw_armed: false,
                stopping: false,
                stats: TxStats::default(),
            },
            sender,
        ))
    }

    pub fn queue_id(&self) -> QueueId {
        self.queue_id
    }

    pub fn stats(&self) -> &TxStats {
        &self.stats
    }

    /// One full iteration of the transmit engine.
    pub fn poll(&mut self) -> u32 {
        if self.stopping {
            return 0;
        }
        if self.hw_armed {
            self.driver.set_armed(false);
            self.hw_armed = false;
        }
        let mut work = 0;
        work += self.drain_incoming();
        work += self.translate_pending();
        self.driver.advance(&mut self.rings);
        work += self.complete_packets();
        if work == 0 && self.rings.packets().hardware_owned() > 0 && !self.hw_armed {
            self.driver.set_armed(true);
            self.hw_armed = true;
        }
        work
    }

    fn drain_incoming(&mut self) -> u32 {
        let mut incoming = self.incoming.lock();
        let count = incoming.len() as u32;
        self.pending.extend(incoming.drain(..).map(|nbl| PendingNbl {
            nbl,
            next_segment: 0,
        }));
        count
    }

    /// Translates pending lists in order while ring space remains.
    fn translate_pending(&mut self) -> u32 {
        let mut work = 0;
        loop {
            if self.rings.packets().free_slots() == 0 {
                break;
            }
            let Some(mut entry) = self.pending.pop_front() else {
                break;
            };
            let segment = entry.next_segment;
            match self.translate_segment(&entry.nbl, segment) {
                SegmentOutcome::Retry => {
                    self.stats.translation_retries += 1;
                    self.pending.push_front(entry);
                    break;
                }
                SegmentOutcome::Committed {
                    fragment_index,
                    fragment_count,
                    bounce_len,
                    dma,
                } => {
                    let cursor = self.rings.packets().posted_cursor();
                    let mut prefix = [0u8; PARSE_PREFIX_LEN];
                    let prefix_len = entry.nbl.net_buffers[segment].copy_data_to(&mut prefix);
                    *self.rings.packets_mut().get_mut(cursor) = PacketDescriptor {
                        fragment_index,
                        fragment_count,
                        flags: PacketFlags::new(),
                        layout: parse_frame(&prefix[..prefix_len]),
                    };
                    self.rings.set_tx_checksum(cursor, entry.nbl.tx_checksum);
                    self.rings.set_lso(cursor, entry.nbl.lso);
                    let index = self.rings.packets().mask_index(cursor) as usize;
                    self.slot_context[index] = TxSlotContext {
                        nbl: None,
                        bounce_len,
                        dma,
                    };
                    self.stats.packets_sent += 1;
                    if bounce_len > 0 {
                        self.stats.packets_bounced += 1;
                    }
                    self.finish_segment(entry, cursor);
                    work += 1;
                }
                SegmentOutcome::Drop => {
                    // The only path that silently drops: mark the slot
                    // ignored with zero fragments so the ring stays dense.
                    let cursor = self.rings.packets().posted_cursor();
                    *self.rings.packets_mut().get_mut(cursor) = PacketDescriptor {
                        fragment_index: 0,
                        fragment_count: 0,
                        flags: PacketFlags::new().with_ignore(true),
                        layout: Default::default(),
                    };
                    let index = self.rings.packets().mask_index(cursor) as usize;
                    self.slot_context[index] = TxSlotContext::default();
                    self.stats.packets_dropped += 1;
                    self.finish_segment(entry, cursor);
                    work += 1;
                }
            }
        }
        work
    }

    /// Posts the packet slot; the list rides on its final segment's slot and
    /// completes when that slot does.
    fn finish_segment(&mut self, mut entry: PendingNbl, cursor: u32) {
        entry.next_segment += 1;
        self.rings.packets_mut().post(1);
        if entry.next_segment == entry.nbl.net_buffers.len() {
            let index = self.rings.packets().mask_index(cursor) as usize;
            self.slot_context[index].nbl = Some(entry.nbl);
        } else {
            self.pending.push_front(entry);
        }
    }

    /// Translates one data segment into staged fragments and commits them.
    fn translate_segment(&mut self, nbl: &NetBufferList, segment: usize) -> SegmentOutcome {
        let nb = &nbl.net_buffers[segment];
        let data_length = nb.data_length();
        let backfill = self.caps.backfill as usize;
        let budget = usize::from(self.caps.maximum_fragment_count);
        let max_fragment = self.caps.maximum_fragment_size as usize;

        if data_length == 0 || data_length + backfill > max_fragment * budget {
            return SegmentOutcome::Drop;
        }

        let needs_mapper = self.caps.mapping == MappingRequirement::DmaMapped
            && nb.mdls().iter().any(|m| m.logical_address().is_none());

        let attempt = if needs_mapper {
            self.stage_via_mapper(nb)
        } else if backfill > nb.data_offset() {
            // No headroom for the device's backfill; copy instead.
            Err(StageError::BounceRequired)
        } else {
            self.stage_direct(nb, backfill)
        };

        match attempt {
            Ok(outcome) => outcome,
            Err(StageError::Retry) => SegmentOutcome::Retry,
            Err(StageError::Drop) => SegmentOutcome::Drop,
            Err(StageError::BounceRequired) => self.bounce_segment(nb, backfill),
        }
    }

    /// Zero-copy staging from the MDL chain.
    fn stage_direct(&mut self, nb: &NetBuffer, backfill: usize) -> Result<SegmentOutcome, StageError> {
        let budget = usize::from(self.caps.maximum_fragment_count);
        let dma_direct = self.caps.mapping == MappingRequirement::DmaMapped;
        let mut staged = ArrayVec::<StagedFragment, MAX_TX_FRAGMENTS>::new();
        let mut skip = nb.data_offset() - backfill;
        let mut remaining = nb.data_length() + backfill;

        for mdl in nb.mdls() {
            if remaining == 0 {
                break;
            }
            let len = mdl.byte_count();
            if skip >= len {
                skip -= len;
                continue;
            }
            let span = (len - skip).min(remaining);
            if span > self.caps.maximum_fragment_size as usize {
                return Err(StageError::Drop);
            }
            let virtual_address = mdl.virtual_address() + skip as u64;
            if virtual_address % u64::from(self.caps.fragment_alignment) != 0 {
                return Err(StageError::BounceRequired);
            }
            let logical_address = if dma_direct {
                let la = mdl
                    .logical_address()
                    .expect("mapper path handles unmapped chains")
                    + skip as u64;
                if la % u64::from(self.caps.fragment_alignment) != 0
                    || la + span as u64 - 1 > self.caps.maximum_physical_address
                {
                    return Err(StageError::BounceRequired);
                }
                la
            } else {
                0
            };
            if staged.len() == budget {
                // The packet needs more fragments than the adapter supports.
                return Err(StageError::BounceRequired);
            }
            staged.push(StagedFragment {
                virtual_address,
                logical_address,
                length: span as u32,
            });
            skip = 0;
            remaining -= span;
        }

        self.commit_fragments(&staged, 0, None)
    }

    /// Staging through the platform DMA abstraction.
    fn stage_via_mapper(&mut self, nb: &NetBuffer) -> Result<SegmentOutcome, StageError> {
        let mapper = self.dma.as_ref().expect("checked at queue creation").clone();
        let budget = usize::from(self.caps.maximum_fragment_count);
        let Ok(list) = mapper.build_scatter_gather(nb) else {
            return Err(StageError::BounceRequired);
        };
        let mut staged = ArrayVec::<StagedFragment, MAX_TX_FRAGMENTS>::new();
        for element in &list.elements {
            if element.length == 0
                || element.length > self.caps.maximum_fragment_size
            {
                mapper.put_scatter_gather(list);
                return Err(StageError::Drop);
            }
            if element.logical_address % u64::from(self.caps.fragment_alignment) != 0
                || element.logical_address + u64::from(element.length) - 1
                    > self.caps.maximum_physical_address
            {
                mapper.put_scatter_gather(list);
                return Err(StageError::BounceRequired);
            }
            if staged.len() == budget {
                mapper.put_scatter_gather(list);
                return Err(StageError::BounceRequired);
            }
            staged.push(StagedFragment {
                virtual_address: 0,
                logical_address: element.logical_address,
                length: element.length,
            });
        }
        // On ring-full retry, commit returns the mapping to the mapper.
        self.commit_fragments(&staged, 0, Some(list))
    }

    /// Copies the segment into an owned bounce buffer and stages the single
    /// resulting fragment.
    fn bounce_segment(&mut self, nb: &NetBuffer, backfill: usize) -> SegmentOutcome {
        let total = nb.data_length() + backfill;
        if total > self.caps.maximum_fragment_size as usize {
            return SegmentOutcome::Drop;
        }
        let Ok(buffer) = self
            .bounce
            .allocate(total as u32, self.caps.fragment_alignment)
        else {
            // Bouncing failed for lack of resources; retry later.
            return SegmentOutcome::Retry;
        };
        let mut data = vec![0; nb.data_length()];
        nb.copy_data_to(&mut data);
        net_pool::bytes::atomic_write(
            &self.bounce.bytes(buffer.offset, buffer.len)[backfill..],
            &data,
        );
        let staged = [StagedFragment {
            virtual_address: buffer.virtual_address,
            logical_address: buffer.logical_address.unwrap_or(0),
            length: total as u32,
        }];
        match self.commit_fragments(&staged, buffer.len_with_padding, None) {
            Ok(outcome) => outcome,
            Err(_) => {
                // No ring space for even one fragment; release the copy and
                // retry in order.
                self.bounce.free(buffer.len_with_padding);
                SegmentOutcome::Retry
            }
        }
    }

    /// Writes staged fragments into the ring and advances its boundary by
    /// exactly the number consumed.
    fn commit_fragments(
        &mut self,
        staged: &[StagedFragment],
        bounce_len: u32,
        dma: Option<SgList>,
    ) -> Result<SegmentOutcome, StageError> {
        let count = staged.len() as u32;
        if self.rings.fragments().free_slots() < count {
            if let Some(list) = dma {
                let mapper = self.dma.as_ref().expect("checked at queue creation");
                mapper.put_scatter_gather(list);
            }
            return Err(StageError::Retry);
        }
        let fragment_index = self.rings.fragments().posted_cursor();
        for (i, fragment) in staged.iter().enumerate() {
            let cursor = fragment_index.wrapping_add(i as u32);
            *self.rings.fragments_mut().get_mut(cursor) = FragmentDescriptor {
                offset: 0,
                valid_length: fragment.length,
                capacity: fragment.length,
                control: FragmentControl::new().with_last(i == staged.len() - 1),
            };
            self.rings
                .set_fragment_virtual_address(cursor, fragment.virtual_address);
            if self.rings.has_fragment_logical_address() {
                self.rings
                    .set_fragment_logical_address(cursor, fragment.logical_address);
            }
        }
        self.rings.fragments_mut().post(count);
        Ok(SegmentOutcome::Committed {
            fragment_index,
            fragment_count: count as u16,
            bounce_len,
            dma,
        })
    }

    /// Walks completions in ring order, releasing mappings and bounce space
    /// and batching finished lists back to the stack.
    fn complete_packets(&mut self) -> u32 {
        let mut chain = Vec::new();
        let mut processed = 0;
        while self.rings.packets().awaiting_consume() > 0 {
            let cursor = self.rings.packets().consumed_cursor();
            let descriptor = *self.rings.packets().get(cursor);
            let index = self.rings.packets().mask_index(cursor) as usize;
            let context = std::mem::take(&mut self.slot_context[index]);
            if let Some(list) = context.dma {
                let mapper = self.dma.as_ref().expect("dma context implies mapper");
                mapper.put_scatter_gather(list);
            }
            if context.bounce_len > 0 {
                self.bounce.free(context.bounce_len);
            }
            if let Some(nbl) = context.nbl {
                chain.push(nbl);
            }
            // Zero the slot so stale metadata is never reused.
            *self.rings.packets_mut().get_mut(cursor) = PacketDescriptor::default();
            self.rings.packets_mut().consume(1);
            if descriptor.fragment_count > 0 {
                self.rings
                    .fragments_mut()
                    .consume(u32::from(descriptor.fragment_count));
            }
            processed += 1;
        }
        if !chain.is_empty() {
            self.stats.packets_completed += chain.len() as u64;
            self.completion.complete(chain);
        }
        processed
    }

    /// Ordered teardown: cancel the driver's outstanding work, then complete
    /// everything still queued back to the stack.
    pub fn shutdown(&mut self) {
        self.stopping = true;
        if self.hw_armed {
            self.driver.set_armed(false);
            self.hw_armed = false;
        }
        self.driver.cancel(&mut self.rings);
        self.complete_packets();

        let mut canceled: Vec<_> = self
            .pending
            .drain(..)
            .map(|entry| entry.nbl)
            .collect();
        canceled.extend(self.incoming.lock().drain(..));
        if !canceled.is_empty() {
            self.completion.complete(canceled);
        }
        if self.rings.packets().hardware_owned() > 0 {
            tracing::warn!(
                queue = self.queue_id.0,
                owned = self.rings.packets().hardware_owned(),
                "driver retained ring slots past cancellation"
            );
        }
    }
}
