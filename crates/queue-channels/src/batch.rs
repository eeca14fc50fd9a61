//! Mapping of batch-send results back onto the buffered messages.
//!
//! Every entry of a batch carries a correlation id: the index of its message
//! in the publisher's buffer, rendered as a string. The backend reports
//! failed and successful entries in separate lists and in any order, so the
//! correlation id is the only link back to the message.

use crate::backend::BatchResponse;
use crate::error::{BatchEntryError, QueueError};
use crate::message::PublishMessage;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "batch_tests.rs"]
mod tests;

/// Correlation id for a buffer slot
pub fn correlation_id(slot: usize) -> String {
    slot.to_string()
}

/// Counts of the outcomes recorded for one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub published: usize,
    pub failed: usize,
    /// Submitted entries the backend reported in neither list
    pub unresolved: usize,
}

/// Record the outcome of every submitted entry on its message.
///
/// `slots` maps each submitted correlation id to its index in `buffer`.
/// Failures are applied before successes and a slot keeps the first result
/// it receives. Unknown correlation ids are ignored. A submitted slot that
/// the backend does not mention at all is failed with
/// [`QueueError::MissingBatchResult`].
pub fn apply_batch_response<M: PublishMessage>(
    buffer: &[M],
    slots: &HashMap<String, usize>,
    response: BatchResponse,
) -> BatchSummary {
    let mut resolved = vec![false; buffer.len()];
    let mut summary = BatchSummary::default();

    for failure in response.failed {
        let Some(slot) = claim_slot(slots, &failure.id, &mut resolved) else {
            continue;
        };
        warn!(
            correlation_id = %failure.id,
            code = %failure.code,
            sender_fault = failure.sender_fault,
            "Batch entry rejected by backend"
        );
        let error = BatchEntryError::new(&failure);
        buffer[slot].set_error(Arc::new(QueueError::BatchEntry(error)));
        summary.failed += 1;
    }

    for success in response.successful {
        let Some(slot) = claim_slot(slots, &success.id, &mut resolved) else {
            continue;
        };
        buffer[slot].set_id(success.message_id);
        summary.published += 1;
    }

    for (id, &slot) in slots {
        if slot < resolved.len() && !resolved[slot] {
            warn!(correlation_id = %id, "Backend returned no result for batch entry");
            buffer[slot].set_error(Arc::new(QueueError::MissingBatchResult {
                correlation_id: id.clone(),
            }));
            summary.unresolved += 1;
        }
    }

    debug!(
        published = summary.published,
        failed = summary.failed,
        unresolved = summary.unresolved,
        "Batch outcomes recorded"
    );
    summary
}

fn claim_slot(slots: &HashMap<String, usize>, id: &str, resolved: &mut [bool]) -> Option<usize> {
    let Some(&slot) = slots.get(id) else {
        warn!(correlation_id = %id, "Ignoring batch result with unknown correlation id");
        return None;
    };
    match resolved.get_mut(slot) {
        Some(done) if !*done => {
            *done = true;
            Some(slot)
        }
        Some(_) => {
            warn!(correlation_id = %id, "Ignoring duplicate batch result");
            None
        }
        None => None,
    }
}
