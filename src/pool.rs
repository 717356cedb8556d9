//! Core proxy pool implementation.

use crate::error::{DispatchError, Result};
use crate::proxy::{AddressFamily, Proxy, ProxyHealthRecord, ProxyTag};

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Per-tag collections of proxy health records.
///
/// A single mutex guards the whole map: selection (including its usage
/// increment) and failure accounting never interleave.
#[derive(Debug, Default)]
pub struct ProxyPool {
    records: Mutex<HashMap<ProxyTag, Vec<ProxyHealthRecord>>>,
}

impl ProxyPool {
    /// Create an empty proxy pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the records of every tag present in `lists`.
    ///
    /// Tags absent from `lists` keep their records. Duplicate proxies within a
    /// tag are collapsed to their first record.
    pub fn load<I, R>(&self, lists: I)
    where
        I: IntoIterator<Item = (ProxyTag, R)>,
        R: IntoIterator<Item = ProxyHealthRecord>,
    {
        let mut records = self.records.lock();
        for (tag, list) in lists {
            let mut deduped: Vec<ProxyHealthRecord> = Vec::new();
            for record in list {
                if deduped.iter().any(|r| r.proxy == record.proxy) {
                    warn!("Duplicate proxy {} for [{}] ignored", record.proxy, tag);
                    continue;
                }
                deduped.push(record);
            }
            info!("Loaded {} proxies for [{}]", deduped.len(), tag);
            records.insert(tag, deduped);
        }
    }

    /// True iff the tag is known and has at least one record.
    pub fn exists_eligible(&self, tag: &ProxyTag) -> bool {
        self.records
            .lock()
            .get(tag)
            .is_some_and(|list| !list.is_empty())
    }

    /// Pick the healthiest proxy for `tag` and count it as used.
    ///
    /// Records rank by failures, then average response time, then usage; equal
    /// keys keep load order. With a forced family only proxies whose host is a
    /// literal address of that family compete.
    pub fn select_next(&self, tag: &ProxyTag, family: AddressFamily) -> Result<Proxy> {
        let mut records = self.records.lock();
        let list = records
            .get_mut(tag)
            .ok_or_else(|| DispatchError::NoEligibleProxy { tag: tag.clone() })?;
        if list.is_empty() {
            warn!("No proxy available for [{}]", tag);
            return Err(DispatchError::NoProxyAvailable { tag: tag.clone() });
        }

        let best = list
            .iter()
            .enumerate()
            .filter(|(_, record)| record.proxy.is_family(family))
            .min_by(|(_, a), (_, b)| rank(a, b))
            .map(|(idx, _)| idx);

        let Some(idx) = best else {
            warn!("No {:?} proxy eligible for [{}]", family, tag);
            return Err(DispatchError::NoEligibleProxy { tag: tag.clone() });
        };

        let record = &mut list[idx];
        record.usage_count += 1;
        debug!(
            "Selected proxy {} for [{}] (failures: {}, usages: {})",
            record.proxy, tag, record.failure_count, record.usage_count
        );
        Ok(record.proxy.clone())
    }

    /// Count a failure against every record of `tag` holding `proxy`.
    pub fn record_failure(&self, proxy: &Proxy, tag: &ProxyTag) {
        let mut records = self.records.lock();
        let Some(list) = records.get_mut(tag) else {
            return;
        };
        for record in list.iter_mut().filter(|r| &r.proxy == proxy) {
            record.failure_count += 1;
            debug!(
                "Proxy {} for [{}] now has {} failures",
                proxy, tag, record.failure_count
            );
        }
    }

    /// Snapshot of the records held for `tag`, in load order.
    pub fn records(&self, tag: &ProxyTag) -> Vec<ProxyHealthRecord> {
        self.records.lock().get(tag).cloned().unwrap_or_default()
    }

    /// Get statistics about the proxy pool: (records, tags).
    pub fn get_stats(&self) -> (usize, usize) {
        let records = self.records.lock();
        let total = records.values().map(Vec::len).sum();
        (total, records.len())
    }
}

/// Lexicographic health ordering; `min_by` keeps the first of equal keys.
fn rank(a: &ProxyHealthRecord, b: &ProxyHealthRecord) -> Ordering {
    a.failure_count
        .cmp(&b.failure_count)
        .then_with(|| {
            a.average_response_time_millis
                .total_cmp(&b.average_response_time_millis)
        })
        .then_with(|| a.usage_count.cmp(&b.usage_count))
}
