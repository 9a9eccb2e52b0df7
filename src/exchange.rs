//! Per-destination record buffers and the routing loop.
//!
//! An [`Exchange`] is shared by the local routing task and the gRPC
//! receive handler. One mutex guards every buffer, the sequence counters and
//! the [`CompletionBarrier`]; network sends always happen after the lock is
//! released.

use std::mem;
use std::sync::{Mutex, MutexGuard};

use log::{debug, info};
use tokio::sync::mpsc;

use crate::barrier::{CompletionBarrier, ReleaseSignal};
use crate::codec::Record;
use crate::error::{Result, SortError};
use crate::partition::Partitioner;
use crate::proto;
use crate::transport::PeerSet;
use crate::NodeId;

/// Encoded bytes queued for one peer before it is flushed regardless of the
/// record count.
pub const DEFAULT_BATCH_BYTES: usize = 64 * 1024 * 1024;

/// Records drained from one outbound queue, ready for the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    pub target: NodeId,
    /// Position of this batch in the sender's stream to `target`.
    pub seq: u64,
    pub records: Vec<Record>,
    /// Set on the last batch the sender will ever send to `target`.
    pub is_final: bool,
}

impl Batch {
    pub fn into_request(self, sender: NodeId) -> proto::BatchRequest {
        proto::BatchRequest {
            sender: sender as u32,
            seq: self.seq,
            records: self.records.into_iter().map(proto::Record::from).collect(),
            is_final: self.is_final,
        }
    }
}

/// Outcome of an inbound batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Applied,
    /// Already seen; acknowledged again without touching the buffer.
    Replayed,
}

#[derive(Debug)]
struct ExchangeState {
    /// Indexed by node id. The entry for this node is the local partition.
    buffers: Vec<Vec<Record>>,
    /// Encoded size of each outbound buffer.
    queued_bytes: Vec<usize>,
    next_send_seq: Vec<u64>,
    next_recv_seq: Vec<u64>,
    barrier: CompletionBarrier,
}

#[derive(Debug)]
pub struct Exchange {
    me: NodeId,
    partitioner: Partitioner,
    batch_size: usize,
    batch_bytes: usize,
    state: Mutex<ExchangeState>,
    released: ReleaseSignal,
}

impl Exchange {
    pub fn new(me: NodeId, total_nodes: usize, batch_size: usize) -> Self {
        let barrier = CompletionBarrier::new(total_nodes, me);
        let released = ReleaseSignal::new(barrier.is_released());
        Exchange {
            me,
            partitioner: Partitioner::new(total_nodes),
            batch_size: batch_size.max(1),
            batch_bytes: DEFAULT_BATCH_BYTES,
            state: Mutex::new(ExchangeState {
                buffers: vec![Vec::new(); total_nodes],
                queued_bytes: vec![0; total_nodes],
                next_send_seq: vec![0; total_nodes],
                next_recv_seq: vec![0; total_nodes],
                barrier,
            }),
            released,
        }
    }

    /// Flushes a peer's queue once its encoded size reaches `bytes`.
    pub fn with_batch_bytes(mut self, bytes: usize) -> Self {
        self.batch_bytes = bytes.max(1);
        self
    }

    pub fn me(&self) -> NodeId {
        self.me
    }

    pub fn total_nodes(&self) -> usize {
        self.partitioner.total_nodes()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    fn lock(&self) -> MutexGuard<'_, ExchangeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues a locally read record under its owning node.
    ///
    /// Returns a batch to send when a remote queue reaches the batch size
    /// or the byte budget. The local partition is never flushed.
    pub fn route(&self, record: Record) -> Option<Batch> {
        let target = self.partitioner.target(&record.key);
        let mut state = self.lock();
        if target == self.me {
            state.buffers[target].push(record);
            return None;
        }
        state.queued_bytes[target] += record.encoded_len();
        state.buffers[target].push(record);
        if state.buffers[target].len() >= self.batch_size
            || state.queued_bytes[target] >= self.batch_bytes
        {
            Some(take_batch(&mut state, target, false))
        } else {
            None
        }
    }

    /// Drains whatever is left for `target` into its final batch, which may
    /// be empty.
    pub fn finish(&self, target: NodeId) -> Batch {
        let mut state = self.lock();
        take_batch(&mut state, target, true)
    }

    /// Records currently queued for `target`.
    pub fn pending(&self, target: NodeId) -> usize {
        self.lock().buffers.get(target).map_or(0, Vec::len)
    }

    /// Applies a batch received from `sender`.
    ///
    /// Batches must arrive in `seq` order; an old `seq` is a replay of a
    /// batch whose acknowledgement was lost and is not applied twice.
    pub fn accept(
        &self,
        sender: NodeId,
        seq: u64,
        records: Vec<Record>,
        is_final: bool,
    ) -> Result<Delivery> {
        if sender >= self.total_nodes() || sender == self.me {
            return Err(SortError::Protocol(format!(
                "node {} cannot accept batches from node {}",
                self.me, sender
            )));
        }

        let mut state = self.lock();
        let expected = state.next_recv_seq[sender];
        if seq < expected {
            return Ok(Delivery::Replayed);
        }
        if seq > expected {
            return Err(SortError::Protocol(format!(
                "node {sender} sent batch {seq} but batch {expected} was expected"
            )));
        }
        if state.barrier.has_finished(sender) {
            return Err(SortError::Protocol(format!(
                "node {sender} sent batch {seq} after its final batch"
            )));
        }

        state.next_recv_seq[sender] += 1;
        let me = self.me;
        state.buffers[me].extend(records);
        if is_final && state.barrier.mark_final(sender)? {
            info!(
                "node {} received final batches from all {} peers",
                self.me,
                state.barrier.expected()
            );
            self.released.fire();
        }
        Ok(Delivery::Applied)
    }

    pub fn is_released(&self) -> bool {
        self.released.is_fired()
    }

    /// Blocks until every peer has sent its final batch.
    pub async fn wait_released(&self) {
        self.released.wait().await
    }

    /// Takes the local partition. Only meaningful once released.
    pub fn take_local(&self) -> Vec<Record> {
        let mut state = self.lock();
        let me = self.me;
        mem::take(&mut state.buffers[me])
    }
}

fn take_batch(state: &mut ExchangeState, target: NodeId, is_final: bool) -> Batch {
    let seq = state.next_send_seq[target];
    state.next_send_seq[target] += 1;
    state.queued_bytes[target] = 0;
    Batch {
        target,
        seq,
        records: mem::take(&mut state.buffers[target]),
        is_final,
    }
}

/// Counters for one node's routing phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScatterStats {
    pub records_read: u64,
    pub records_kept: u64,
    pub records_sent: u64,
    pub batches_sent: u64,
}

/// Routes every record from `records` and then sends each peer its final
/// batch.
///
/// Threshold flushes run inline, so a slow peer stalls reading.
pub async fn scatter(
    exchange: &Exchange,
    peers: &PeerSet,
    mut records: mpsc::Receiver<Result<Record>>,
) -> Result<ScatterStats> {
    let mut stats = ScatterStats::default();

    while let Some(record) = records.recv().await {
        stats.records_read += 1;
        if let Some(batch) = exchange.route(record?) {
            flush(exchange, peers, batch, &mut stats).await?;
        }
    }
    info!(
        "node {} finished reading {} records",
        exchange.me(),
        stats.records_read
    );

    for target in 0..exchange.total_nodes() {
        if target == exchange.me() {
            continue;
        }
        let batch = exchange.finish(target);
        flush(exchange, peers, batch, &mut stats).await?;
    }

    stats.records_kept = stats.records_read - stats.records_sent;
    Ok(stats)
}

async fn flush(
    exchange: &Exchange,
    peers: &PeerSet,
    batch: Batch,
    stats: &mut ScatterStats,
) -> Result<()> {
    let target = batch.target;
    let count = batch.records.len() as u64;
    let is_final = batch.is_final;

    peers.get(target)?.send_batch(batch).await?;

    stats.records_sent += count;
    stats.batches_sent += 1;
    debug!(
        "sent {} records from node {} to node {} (final: {})",
        count,
        exchange.me(),
        target,
        is_final
    );
    Ok(())
}
