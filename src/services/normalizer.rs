//! Deduplication, ordering and batching of gateway messages
//!
//! Gateways re-deliver messages, so an import may contain the same external
//! id several times. The first occurrence wins; the result is sorted by
//! timestamp with a stable sort so equal timestamps keep gateway order.

use std::collections::HashSet;

use crate::types::{MessageBatch, RawInboundMessage};

/// Drop duplicate external ids (first seen wins) and order by timestamp
pub fn normalize(raw: Vec<RawInboundMessage>) -> Vec<RawInboundMessage> {
    let mut seen: HashSet<String> = HashSet::with_capacity(raw.len());
    let mut unique: Vec<RawInboundMessage> = raw
        .into_iter()
        .filter(|m| seen.insert(m.external_id.clone()))
        .collect();

    unique.sort_by_key(|m| m.timestamp);
    unique
}

/// Split a normalized sequence into `ceil(len / batch_size)` contiguous batches
pub fn partition(normalized: Vec<RawInboundMessage>, batch_size: usize) -> Vec<MessageBatch> {
    let batch_size = batch_size.max(1);
    let total_batches = normalized.len().div_ceil(batch_size) as u32;

    let mut batches = Vec::with_capacity(total_batches as usize);
    let mut iter = normalized.into_iter().peekable();
    let mut batch_index = 0;

    while iter.peek().is_some() {
        let messages: Vec<RawInboundMessage> = iter.by_ref().take(batch_size).collect();
        batches.push(MessageBatch {
            batch_index,
            total_batches,
            messages,
        });
        batch_index += 1;
    }

    batches
}
