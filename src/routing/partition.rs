//! Partition: hash or round-robin fan-out into N channels (§4.12).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::concurrency::{spawn_tracked, ActiveTaskCounter, CancelToken};
use crate::metadata::keys;
use crate::processor::{output_channel, Inbox};

/// FNV-1a, 64-bit. Same constants as every other FNV-1a implementation;
/// chosen (over e.g. a `Hasher` from `std`) because it is stable across
/// Rust versions and platforms, which `route(k) == route(k)` (§8, property
/// 8) depends on.
fn fnv1a_64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// How [`Partition`] assigns an item to one of its N outputs.
pub enum PartitionStrategy<T> {
    /// `FNV-1a(key_fn(value)) mod N`. The same key always maps to the same
    /// partition.
    Hash(Arc<dyn Fn(&T) -> String + Send + Sync>),
    /// An atomic counter incremented per item, giving an exactly-balanced
    /// distribution across N outputs.
    RoundRobin,
}

impl<T> PartitionStrategy<T> {
    fn name(&self) -> &'static str {
        match self {
            PartitionStrategy::Hash(_) => "hash",
            PartitionStrategy::RoundRobin => "round_robin",
        }
    }
}

/// Fans a stream out into `N` output channels by hash or round-robin.
/// Errors always go to partition 0. Every forwarded item is enriched with
/// `partition_index`, `partition_total`, and `partition_strategy` metadata.
pub struct Partition<T> {
    name: String,
    strategy: PartitionStrategy<T>,
    partition_count: usize,
    buffer_size: usize,
    round_robin_counter: AtomicUsize,
    task_counter: Option<ActiveTaskCounter>,
}

impl<T> Partition<T>
where
    T: Send + 'static,
{
    /// A partition with `partition_count` outputs (clamped to at least 1)
    /// using `strategy`.
    pub fn new(strategy: PartitionStrategy<T>, partition_count: usize) -> Self {
        let partition_count = if partition_count == 0 {
            tracing::warn!("partition count clamped to 1");
            1
        } else {
            partition_count
        };
        Self {
            name: "partition".to_string(),
            strategy,
            partition_count,
            buffer_size: 0,
            round_robin_counter: AtomicUsize::new(0),
            task_counter: None,
        }
    }

    /// Override the name used in spans.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Override every output channel's buffer size.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Route this processor's owning task through a shared
    /// [`ActiveTaskCounter`] instead of a bare `tokio::spawn`.
    pub fn with_task_counter(mut self, counter: ActiveTaskCounter) -> Self {
        self.task_counter = Some(counter);
        self
    }

    /// This partition's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn index_for(&self, item: &crate::result::Result<T>) -> usize {
        if item.is_error() {
            return 0;
        }
        match &self.strategy {
            PartitionStrategy::Hash(key_fn) => {
                let key_fn = key_fn.clone();
                let value = item.value();
                let keyed = catch_unwind(AssertUnwindSafe(|| key_fn(value)));
                match keyed {
                    Ok(key) => (fnv1a_64(key.as_bytes()) % self.partition_count as u64) as usize,
                    Err(_) => 0,
                }
            }
            PartitionStrategy::RoundRobin => {
                self.round_robin_counter.fetch_add(1, Ordering::SeqCst) % self.partition_count
            }
        }
    }

    /// Spawn the distributor task and return the `partition_count` output
    /// channels.
    pub fn process(self: Arc<Self>, ctx: CancelToken, mut input: Inbox<T>) -> Vec<Inbox<T>> {
        let mut senders = Vec::with_capacity(self.partition_count);
        let mut receivers = Vec::with_capacity(self.partition_count);
        for _ in 0..self.partition_count {
            let (tx, rx) = output_channel(self.buffer_size);
            senders.push(tx);
            receivers.push(rx);
        }

        let name = self.name.clone();
        let partition_total = self.partition_count;
        let strategy_name = self.strategy.name();
        let task_counter = self.task_counter.clone();

        spawn_tracked(task_counter.as_ref(), async move {
            loop {
                tokio::select! {
                    biased;
                    _ = ctx.cancelled() => break,
                    item = input.recv() => {
                        match item {
                            None => break,
                            Some(item) => {
                                let index = self.index_for(&item);
                                let tagged = item
                                    .with_metadata(keys::PARTITION_INDEX, index)
                                    .with_metadata(keys::PARTITION_TOTAL, partition_total)
                                    .with_metadata(keys::PARTITION_STRATEGY, strategy_name);
                                if senders[index].send(tagged).await.is_err() {
                                    tracing::debug!(name = %name, index, "partition output closed, item dropped");
                                }
                            }
                        }
                    }
                }
            }
        });

        receivers
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::processor::output_channel;
    use crate::result::Result as StreamItem;

    #[tokio::test]
    async fn hash_strategy_keeps_same_key_on_one_partition() {
        let strategy = PartitionStrategy::Hash(Arc::new(|_v: &i32| "same-key".to_string()));
        let partition = Arc::new(Partition::new(strategy, 5));

        let (tx, input) = output_channel::<i32>(128);
        for v in 0..100 {
            tx.send(StreamItem::new_success(v)).await.unwrap();
        }
        drop(tx);

        let mut outputs = partition.process(CancelToken::new(), input);
        let mut total = 0;
        let mut non_empty = 0;
        for out in outputs.iter_mut() {
            let mut count = 0;
            let mut index_seen = None;
            while let Some(item) = out.recv().await {
                count += 1;
                let idx = *item.metadata().get_as::<usize>(keys::PARTITION_INDEX).unwrap();
                assert_eq!(*index_seen.get_or_insert(idx), idx);
            }
            total += count;
            if count > 0 {
                non_empty += 1;
            }
        }
        assert_eq!(total, 100);
        assert_eq!(non_empty, 1);
    }
}
