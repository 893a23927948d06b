//! The ordered stream processor (§4.4): takes the heterogeneous batch a
//! coordination-procedure call returns and replays it with per-stream
//! sequential ordering while allowing different streams to run
//! concurrently.
//!
//! Grouping relies entirely on phase 11's `ORDER BY stream_id,
//! sequence_order` contract — rows for the same stream arrive consecutive
//! in the input, so a single linear scan is enough to recover the groups.

use std::sync::Arc;

use async_trait::async_trait;
use wh_db::ClaimedWorkRow;

/// Per-message result handed back to the work-coordinator strategy
/// (§4.4.6). `Ok` carries the bits the message completed; `Err` carries
/// the bits it completed before failing plus an error string.
#[derive(Debug, Clone)]
pub enum MessageOutcome {
    Ok { completed_status_bits: i32 },
    Err { error_message: String, partial_status_bits: i32 },
}

impl MessageOutcome {
    pub fn is_err(&self) -> bool {
        matches!(self, MessageOutcome::Err { .. })
    }
}

/// The collaborator a caller supplies to actually do something with a
/// claimed row — publish to a transport, apply a perspective, dispatch a
/// receptor. The stream processor only knows how to sequence calls to it.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, row: &ClaimedWorkRow) -> MessageOutcome;
}

/// Groups `rows` by `stream_id` (relying on input order — see module docs),
/// then processes each group sequentially. Groups run one at a time unless
/// `parallelize_streams` is set, in which case up to `concurrency_cap`
/// groups run concurrently (§4.4.4).
///
/// On a message's failure, its stream's remaining messages are left
/// unprocessed in this call (they stay leased and are retried once
/// `scheduled_for`/lease expiry make them eligible again) — other streams
/// are unaffected (§4.4.5, §7 propagation policy).
pub async fn process_ordered(
    rows: Vec<ClaimedWorkRow>,
    processor: Arc<dyn MessageProcessor>,
    parallelize_streams: bool,
    concurrency_cap: usize,
) -> Vec<(ClaimedWorkRow, MessageOutcome)> {
    let groups = group_by_stream(rows);

    if !parallelize_streams || groups.len() <= 1 {
        let mut out = Vec::new();
        for group in groups {
            out.extend(process_group(group, processor.clone()).await);
        }
        return out;
    }

    use futures_util::stream::{self, StreamExt};
    let per_group: Vec<Vec<(ClaimedWorkRow, MessageOutcome)>> = stream::iter(groups)
        .map(|group| {
            let processor = processor.clone();
            async move { process_group(group, processor).await }
        })
        .buffer_unordered(concurrency_cap.max(1))
        .collect()
        .await;

    per_group.into_iter().flatten().collect()
}

async fn process_group(
    group: Vec<ClaimedWorkRow>,
    processor: Arc<dyn MessageProcessor>,
) -> Vec<(ClaimedWorkRow, MessageOutcome)> {
    let mut out = Vec::with_capacity(group.len());
    for row in group {
        let outcome = processor.process(&row).await;
        let stop = outcome.is_err();
        out.push((row, outcome));
        if stop {
            break;
        }
    }
    out
}

fn group_by_stream(rows: Vec<ClaimedWorkRow>) -> Vec<Vec<ClaimedWorkRow>> {
    let mut groups: Vec<Vec<ClaimedWorkRow>> = Vec::new();
    for row in rows {
        match groups.last_mut() {
            Some(last) if last.last().map(|r| r.stream_id) == Some(row.stream_id) => last.push(row),
            _ => groups.push(vec![row]),
        }
    }
    groups
}
