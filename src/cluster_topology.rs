//! `CLUSTER SLOTS` parsing and the slot-ownership table.

use std::sync::Arc;

use crate::cluster_routing::SLOT_COUNT;
use crate::types::{ErrorKind, RedisError, RedisResult, Value};

/// One contiguous slot range and the nodes serving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Slot {
    start: u16,
    end: u16,
    master: Arc<str>,
    replicas: Vec<Arc<str>>,
}

impl Slot {
    pub(crate) fn new(start: u16, end: u16, master: String, replicas: Vec<String>) -> Self {
        Slot {
            start,
            end,
            master: master.into(),
            replicas: replicas.into_iter().map(Into::into).collect(),
        }
    }

    pub(crate) fn start(&self) -> u16 {
        self.start
    }

    pub(crate) fn end(&self) -> u16 {
        self.end
    }

    pub(crate) fn master(&self) -> &Arc<str> {
        &self.master
    }

    pub(crate) fn replicas(&self) -> &[Arc<str>] {
        &self.replicas
    }
}

/// Parses the reply of `CLUSTER SLOTS` into slot ranges.
///
/// Malformed entries are skipped rather than failing the refresh, matching
/// how servers mix protocol generations during upgrades.
pub(crate) fn parse_slots(raw_slot_resp: &Value) -> RedisResult<Vec<Slot>> {
    let mut result = Vec::new();

    if let Value::Array(items) = raw_slot_resp {
        let mut iter = items.iter();
        while let Some(Value::Array(item)) = iter.next() {
            if item.len() < 3 {
                continue;
            }

            let start = if let Value::Int(start) = item[0] {
                start as u16
            } else {
                continue;
            };

            let end = if let Value::Int(end) = item[1] {
                end as u16
            } else {
                continue;
            };

            let mut nodes: Vec<String> = item
                .iter()
                .skip(2)
                .filter_map(|node| {
                    if let Value::Array(node) = node {
                        if node.len() < 2 {
                            return None;
                        }

                        let ip = if let Value::BulkString(ref ip) = node[0] {
                            String::from_utf8_lossy(ip)
                        } else {
                            return None;
                        };
                        if ip.is_empty() {
                            return None;
                        }

                        let port = if let Value::Int(port) = node[1] {
                            port as u16
                        } else {
                            return None;
                        };
                        Some(format!("{ip}:{port}"))
                    } else {
                        None
                    }
                })
                .collect();

            if nodes.is_empty() {
                continue;
            }

            let replicas = nodes.split_off(1);
            result.push(Slot::new(start, end, nodes.pop().unwrap(), replicas));
        }
    }

    Ok(result)
}

/// The slot-ownership table.
///
/// A direct-addressed array of `SLOT_COUNT` entries is consulted first; a
/// miss falls back to binary search over the ranges sorted by slot start and
/// the result is memoized into the array.  `MOVED` redirects poke single
/// entries in the array, overriding whatever the ranges say.
#[derive(Debug, Default)]
pub(crate) struct SlotMap {
    table: Vec<Option<Arc<str>>>,
    ranges: Vec<Slot>,
}

impl SlotMap {
    /// Builds a table from parsed slot ranges, validating that the ranges
    /// cover all slots without overlap.
    pub(crate) fn from_slots(mut slots: Vec<Slot>) -> RedisResult<Self> {
        slots.sort_by_key(Slot::start);
        let last_slot = slots.iter().try_fold(0u32, |prev_end, slot| {
            if prev_end != u32::from(slot.start()) {
                return Err(RedisError::from((
                    ErrorKind::ResponseError,
                    "Slot refresh error.",
                    format!(
                        "Received overlapping or non-contiguous slots at {} and {}..{}",
                        prev_end,
                        slot.start(),
                        slot.end()
                    ),
                )));
            }
            Ok(u32::from(slot.end()) + 1)
        })?;

        if last_slot != u32::from(SLOT_COUNT) {
            return Err(RedisError::from((
                ErrorKind::ResponseError,
                "Slot refresh error.",
                format!("Lacks the slots >= {last_slot}"),
            )));
        }

        log::trace!("rebuilt slot table from {} ranges", slots.len());
        Ok(SlotMap {
            table: vec![None; SLOT_COUNT as usize],
            ranges: slots,
        })
    }

    /// Looks up the primary serving `slot`, memoizing range hits into the
    /// flat table.
    pub(crate) fn node_for_slot(&mut self, slot: u16) -> Option<Arc<str>> {
        let idx = (slot & (SLOT_COUNT - 1)) as usize;
        if let Some(addr) = &self.table[idx] {
            return Some(Arc::clone(addr));
        }

        let range_idx = self
            .ranges
            .partition_point(|range| u32::from(range.end()) < u32::from(slot));
        let range = self.ranges.get(range_idx)?;
        if slot < range.start() || slot > range.end() {
            return None;
        }
        let addr = Arc::clone(range.master());
        self.table[idx] = Some(Arc::clone(&addr));
        Some(addr)
    }

    /// Points `slot` at `addr`, as instructed by a `MOVED` redirect.
    pub(crate) fn set_slot(&mut self, slot: u16, addr: Arc<str>) {
        let idx = (slot & (SLOT_COUNT - 1)) as usize;
        self.table[idx] = Some(addr);
    }

    /// Every primary address, in slot-range order, deduplicated.
    pub(crate) fn primary_addresses(&self) -> Vec<Arc<str>> {
        let mut out: Vec<Arc<str>> = Vec::new();
        for range in &self.ranges {
            if !out.iter().any(|addr| addr == range.master()) {
                out.push(Arc::clone(range.master()));
            }
        }
        out
    }

    /// Every known address, primaries and replicas alike.
    pub(crate) fn all_addresses(&self) -> Vec<Arc<str>> {
        let mut out = self.primary_addresses();
        for range in &self.ranges {
            for replica in range.replicas() {
                if !out.iter().any(|addr| addr == replica) {
                    out.push(Arc::clone(replica));
                }
            }
        }
        out
    }
}
