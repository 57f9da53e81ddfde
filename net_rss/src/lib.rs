//! Receive-scaling indirection management: the table-index → queue mapping,
//! processor→queue affinity, and transactional pushes of table updates to
//! the adapter dispatch.

mod params;

pub use params::HashFunction;
pub use params::RssParameters;
pub use params::RssParametersHeader;
pub use params::HASH_TYPE_IPV4;
pub use params::HASH_TYPE_IPV6;
pub use params::HASH_TYPE_TCP_IPV4;
pub use params::HASH_TYPE_TCP_IPV6;
pub use params::RSS_FLAG_DISABLE;
pub use params::RSS_FLAG_HASH_INFO_CHANGED;
pub use params::RSS_FLAG_KEY_CHANGED;
pub use params::RSS_FLAG_TABLE_CHANGED;
pub use params::RSS_HASH_KEY_MAX;

use net_defs::QueueId;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Retries used when re-pushing the full table after a datapath restart.
/// The OID path passes zero because its caller owns retry policy.
const CONFIGURE_RETRIES: u32 = 2;

#[derive(Debug, Error)]
pub enum RssError {
    #[error("parameter buffer too small: need {needed} bytes, got {actual}")]
    BufferTooSmall { needed: usize, actual: usize },
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("unsupported hash function {0}")]
    UnsupportedHashFunction(u8),
    #[error("unsupported hash type {0:#x}")]
    UnsupportedHashType(u32),
    #[error("{failed} indirection entries rejected by the adapter")]
    EntriesRejected { failed: usize },
}

/// One OS processor, bounded by the configured group/number range.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProcessorId {
    pub group: u16,
    pub number: u8,
}

/// Bounds read from the configuration keywords at initialization.
#[derive(Clone, Debug)]
pub struct RssKeywords {
    pub processor_group_count: u16,
    pub processors_per_group: u8,
    pub number_of_indirection_entries: u32,
    pub number_of_queues: u16,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryStatus {
    Pending,
    Success,
    InsufficientResources,
}

/// One table update pushed to the adapter; the adapter fills in per-entry
/// status.
#[derive(Copy, Clone, Debug)]
pub struct IndirectionEntry {
    pub index: u32,
    pub queue: QueueId,
    pub status: EntryStatus,
}

/// Adapter-side receive-scaling dispatch.
pub trait IndirectionDispatch: Send + Sync {
    /// Applies entries to the adapter's own table, setting each entry's
    /// status individually.
    fn set_indirection_entries(&self, entries: &mut [IndirectionEntry]);

    /// Enables or disables scaling with the given hash configuration.
    fn set_enabled(&self, enabled: bool, params: &RssHashConfig) -> Result<(), RssError>;
}

#[derive(Clone, Debug, Default)]
pub struct RssHashConfig {
    pub function: u8,
    pub hash_type: u32,
    pub key: Vec<u8>,
}

struct TableState {
    enabled: bool,
    hash: RssHashConfig,
    indirection: Vec<QueueId>,
}

struct AffinityMap {
    /// Queue bound to each linear processor slot.
    bound: Vec<Option<QueueId>>,
    /// Processor slot each queue is bound to.
    queue_slot: Vec<Option<usize>>,
}

/// Receive-scaling state for one adapter.
pub struct RssManager {
    keywords: RssKeywords,
    dispatch: Arc<dyn IndirectionDispatch>,
    table: Mutex<TableState>,
    /// Guards the search+bind sequence; binds race from multiple
    /// processors targeting the same index.
    affinity: Mutex<AffinityMap>,
}

impl RssManager {
    /// Builds a zeroed indirection table and an affinity map sized to the
    /// configured processor range.
    pub fn new(keywords: RssKeywords, dispatch: Arc<dyn IndirectionDispatch>) -> Self {
        let processors =
            usize::from(keywords.processor_group_count) * usize::from(keywords.processors_per_group);
        let table = TableState {
            enabled: false,
            hash: RssHashConfig::default(),
            indirection: vec![QueueId(0); keywords.number_of_indirection_entries as usize],
        };
        let affinity = AffinityMap {
            bound: vec![None; processors],
            queue_slot: vec![None; usize::from(keywords.number_of_queues)],
        };
        Self {
            keywords,
            dispatch,
            table: Mutex::new(table),
            affinity: Mutex::new(affinity),
        }
    }

    pub fn indirection_table(&self) -> Vec<QueueId> {
        self.table.lock().indirection.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.table.lock().enabled
    }

    fn slot_of(&self, processor: ProcessorId) -> Option<usize> {
        if processor.group >= self.keywords.processor_group_count
            || processor.number >= self.keywords.processors_per_group
        {
            return None;
        }
        Some(
            usize::from(processor.group) * usize::from(self.keywords.processors_per_group)
                + usize::from(processor.number),
        )
    }

    /// Maps a processor to a queue: an existing binding wins; otherwise a
    /// free queue is claimed; otherwise the queue bound to the *calling*
    /// processor is stolen and rebound to the target, trading the caller's
    /// binding for request locality.
    pub fn map_affinitized_queue(
        &self,
        target: ProcessorId,
        calling: ProcessorId,
    ) -> Result<QueueId, RssError> {
        let target_slot = self
            .slot_of(target)
            .ok_or(RssError::InvalidParameter("target processor out of range"))?;
        let mut map = self.affinity.lock();
        if let Some(queue) = map.bound[target_slot] {
            return Ok(queue);
        }
        if let Some(free) = map.queue_slot.iter().position(Option::is_none) {
            let queue = QueueId(free as u16);
            map.bound[target_slot] = Some(queue);
            map.queue_slot[free] = Some(target_slot);
            return Ok(queue);
        }
        let calling_slot = self
            .slot_of(calling)
            .ok_or(RssError::InvalidParameter("calling processor out of range"))?;
        let queue = map.bound[calling_slot]
            .ok_or(RssError::InvalidParameter("no queue bound to caller"))?;
        map.bound[calling_slot] = None;
        debug_assert!(map.bound[target_slot].is_none());
        map.bound[target_slot] = Some(queue);
        map.queue_slot[usize::from(queue.0)] = Some(target_slot);
        tracing::debug!(
            queue = queue.0,
            from_group = calling.group,
            from_number = calling.number,
            to_group = target.group,
            to_number = target.number,
            "stole queue binding for locality"
        );
        Ok(queue)
    }

    /// Pushes entries to the adapter. Failed entries are repacked and
    /// retried while `retries` remain; at zero retries each failed index is
    /// restored from the shadow captured before the attempt, so the cached
    /// table never diverges from the adapter's.
    pub fn set_indirection_entries(
        &self,
        entries: &mut Vec<IndirectionEntry>,
        mut retries: u32,
    ) -> Result<(), RssError> {
        let mut table = self.table.lock();
        for entry in entries.iter() {
            if entry.index >= table.indirection.len() as u32 {
                return Err(RssError::InvalidParameter("indirection index out of range"));
            }
            if entry.queue.0 >= self.keywords.number_of_queues {
                return Err(RssError::InvalidParameter("queue out of range"));
            }
        }
        let shadow: Vec<QueueId> = entries
            .iter()
            .map(|e| table.indirection[e.index as usize])
            .collect();
        for entry in entries.iter_mut() {
            table.indirection[entry.index as usize] = entry.queue;
            entry.status = EntryStatus::Pending;
        }

        let mut batch: Vec<IndirectionEntry> = entries.clone();
        loop {
            self.dispatch.set_indirection_entries(&mut batch);
            batch.retain(|e| e.status != EntryStatus::Success);
            if batch.is_empty() {
                return Ok(());
            }
            if retries > 0 {
                retries -= 1;
                for entry in batch.iter_mut() {
                    entry.status = EntryStatus::Pending;
                }
                continue;
            }
            // Out of retries: roll the cache back for every failed index.
            for failed in &batch {
                let position = entries
                    .iter()
                    .position(|e| e.index == failed.index)
                    .expect("failed entry came from this batch");
                table.indirection[failed.index as usize] = shadow[position];
            }
            return Err(RssError::EntriesRejected {
                failed: batch.len(),
            });
        }
    }

    /// Parses one OID payload and applies its sub-operations. Validation
    /// completes before any mutation.
    pub fn set_parameters(&self, payload: &[u8]) -> Result<(), RssError> {
        let params = RssParameters::parse(payload)?;

        if params.disable {
            let mut table = self.table.lock();
            if table.enabled {
                self.dispatch.set_enabled(false, &table.hash)?;
                table.enabled = false;
            }
            return Ok(());
        }

        if let Some(entries) = &params.indirection_entries {
            let mut update: Vec<IndirectionEntry> = entries
                .iter()
                .enumerate()
                .map(|(i, &queue)| IndirectionEntry {
                    index: i as u32,
                    queue: QueueId(queue),
                    status: EntryStatus::Pending,
                })
                .collect();
            // The OID's own caller holds the retry policy.
            self.set_indirection_entries(&mut update, 0)?;
        }

        let mut table = self.table.lock();
        if let Some(function) = params.hash_function {
            table.hash.function = function;
            table.hash.hash_type = params.hash_type;
        }
        if let Some(key) = &params.hash_key {
            table.hash.key = key.clone();
        }
        self.dispatch.set_enabled(true, &table.hash)?;
        table.enabled = true;
        Ok(())
    }

    /// Re-establishes affinity and re-pushes the entire cached table after a
    /// datapath restart; queues were recreated and must be re-bound.
    pub fn configure(&self) -> Result<(), RssError> {
        {
            let mut map = self.affinity.lock();
            // Rebind each queue to its previously chosen processor.
            let bindings: Vec<(usize, Option<usize>)> = map
                .queue_slot
                .iter()
                .copied()
                .enumerate()
                .collect();
            for slot in map.bound.iter_mut() {
                *slot = None;
            }
            for (queue, slot) in bindings {
                if let Some(slot) = slot {
                    map.bound[slot] = Some(QueueId(queue as u16));
                }
            }
        }

        let (entries, enabled, hash) = {
            let table = self.table.lock();
            let entries: Vec<IndirectionEntry> = table
                .indirection
                .iter()
                .enumerate()
                .map(|(i, &queue)| IndirectionEntry {
                    index: i as u32,
                    queue,
                    status: EntryStatus::Pending,
                })
                .collect();
            (entries, table.enabled, table.hash.clone())
        };
        let mut entries = entries;
        self.set_indirection_entries(&mut entries, CONFIGURE_RETRIES)?;
        if enabled {
            self.dispatch.set_enabled(true, &hash)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[derive(Default)]
    struct MockDispatch {
        /// Indices the adapter rejects, per remaining strike.
        fail_indices: Mutex<Vec<HashSet<u32>>>,
        applied: Mutex<Vec<Vec<(u32, u16)>>>,
        enabled: Mutex<Option<bool>>,
    }

    impl IndirectionDispatch for MockDispatch {
        fn set_indirection_entries(&self, entries: &mut [IndirectionEntry]) {
            let failing = {
                let mut strikes = self.fail_indices.lock();
                if strikes.is_empty() {
                    HashSet::new()
                } else {
                    strikes.remove(0)
                }
            };
            let mut applied = Vec::new();
            for entry in entries.iter_mut() {
                if failing.contains(&entry.index) {
                    entry.status = EntryStatus::InsufficientResources;
                } else {
                    entry.status = EntryStatus::Success;
                    applied.push((entry.index, entry.queue.0));
                }
            }
            self.applied.lock().push(applied);
        }

        fn set_enabled(&self, enabled: bool, _params: &RssHashConfig) -> Result<(), RssError> {
            *self.enabled.lock() = Some(enabled);
            Ok(())
        }
    }

    fn keywords() -> RssKeywords {
        RssKeywords {
            processor_group_count: 2,
            processors_per_group: 4,
            number_of_indirection_entries: 8,
            number_of_queues: 2,
        }
    }

    fn manager(dispatch: Arc<MockDispatch>) -> RssManager {
        RssManager::new(keywords(), dispatch)
    }

    fn entries(pairs: &[(u32, u16)]) -> Vec<IndirectionEntry> {
        pairs
            .iter()
            .map(|&(index, queue)| IndirectionEntry {
                index,
                queue: QueueId(queue),
                status: EntryStatus::Pending,
            })
            .collect()
    }

    #[test]
    fn rollback_restores_failed_indices_exactly() {
        let dispatch = Arc::new(MockDispatch::default());
        let rss = manager(dispatch.clone());
        // Seed a known table.
        let mut seed = entries(&[(0, 1), (1, 1), (2, 1), (3, 1)]);
        rss.set_indirection_entries(&mut seed, 0).unwrap();

        dispatch.fail_indices.lock().push([1, 3].into_iter().collect());
        let mut update = entries(&[(0, 0), (1, 0), (2, 0), (3, 0)]);
        let err = rss.set_indirection_entries(&mut update, 0).unwrap_err();
        assert!(matches!(err, RssError::EntriesRejected { failed: 2 }));

        let table = rss.indirection_table();
        // Succeeded indices hold the new queue, failed ones their prior one.
        assert_eq!(table[0], QueueId(0));
        assert_eq!(table[1], QueueId(1));
        assert_eq!(table[2], QueueId(0));
        assert_eq!(table[3], QueueId(1));
    }

    #[test]
    fn retry_repacks_only_failed_entries() {
        let dispatch = Arc::new(MockDispatch::default());
        let rss = manager(dispatch.clone());
        // First attempt rejects index 2; the retry accepts everything.
        dispatch.fail_indices.lock().push([2].into_iter().collect());

        let mut update = entries(&[(0, 1), (2, 1), (5, 1)]);
        rss.set_indirection_entries(&mut update, 1).unwrap();

        let calls = dispatch.applied.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], vec![(0, 1), (5, 1)]);
        assert_eq!(calls[1], vec![(2, 1)]);
        assert_eq!(rss.indirection_table()[2], QueueId(1));
    }

    #[test]
    fn affinitization_claims_then_steals() {
        let rss = manager(Arc::new(MockDispatch::default()));
        let p = |group, number| ProcessorId { group, number };

        // Two free queues claim two processors.
        let q0 = rss.map_affinitized_queue(p(0, 0), p(0, 0)).unwrap();
        let q1 = rss.map_affinitized_queue(p(0, 1), p(0, 1)).unwrap();
        assert_ne!(q0, q1);

        // Existing binding wins.
        assert_eq!(rss.map_affinitized_queue(p(0, 0), p(0, 2)).unwrap(), q0);

        // No free queues left: the caller's queue moves to the target.
        let stolen = rss.map_affinitized_queue(p(1, 3), p(0, 0)).unwrap();
        assert_eq!(stolen, q0);
        assert_eq!(rss.map_affinitized_queue(p(1, 3), p(1, 3)).unwrap(), q0);
        // The caller's processor no longer has a binding; a new request
        // from it steals back.
        let back = rss.map_affinitized_queue(p(0, 0), p(1, 3)).unwrap();
        assert_eq!(back, q0);
    }

    #[test]
    fn out_of_range_entries_are_rejected_before_mutation() {
        let dispatch = Arc::new(MockDispatch::default());
        let rss = manager(dispatch.clone());
        let before = rss.indirection_table();
        let mut update = entries(&[(0, 1), (99, 1)]);
        assert!(matches!(
            rss.set_indirection_entries(&mut update, 0),
            Err(RssError::InvalidParameter(_))
        ));
        assert_eq!(rss.indirection_table(), before);
        assert!(dispatch.applied.lock().is_empty());
    }

    #[test]
    fn configure_repushes_whole_table_with_retries() {
        let dispatch = Arc::new(MockDispatch::default());
        let rss = manager(dispatch.clone());
        let mut seed = entries(&[(4, 1), (5, 1)]);
        rss.set_indirection_entries(&mut seed, 0).unwrap();
        dispatch.applied.lock().clear();
        // One transient rejection; configure's fixed retries absorb it.
        dispatch.fail_indices.lock().push([4].into_iter().collect());

        rss.configure().unwrap();
        let calls = dispatch.applied.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].len(), 7);
        assert_eq!(calls[1], vec![(4, 1)]);
        assert_eq!(rss.indirection_table()[4], QueueId(1));
    }
}
