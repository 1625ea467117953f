//! Debounced, per-entity coalescing of field writes.
//!
//! Each entity owns at most one slot holding its pending patch and the timer
//! that will flush it. Every edit merges into the patch and restarts the
//! timer. When the timer fires, the slot is taken out of the table and the
//! collected patch is handed to the flush callback.
//!
//! A flush that fails hands its patch back. The patch is then kept as failed,
//! without a timer. It stays visible through [`WriteCoalescer::pending_all`],
//! is merged into the next edit of the same entity and is retried by
//! [`WriteCoalescer::flush_all`]. Cancelling the entity discards it.
//!
//! Flushes run while holding the coalescer's gate. Coalescers constructed with
//! [`WriteCoalescer::with_gate`] on the same gate never flush concurrently, and
//! any other holder of the gate observes every patch either still pending or
//! already written.

use crate::{
    model::PendingPatch,
    services::timer::{ScheduledTask, schedule},
};
use futures_util::future::{BoxFuture, FutureExt};
use log::debug;
use std::{
    collections::{HashMap, hash_map::Entry},
    fmt::Debug,
    future::Future,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

/// Outcome of a flush; `Err` hands back the patch that was not written
pub type FlushResult<F, V> = Result<(), PendingPatch<F, V>>;

type FlushFn<K, F, V> =
    dyn Fn(K, PendingPatch<F, V>) -> BoxFuture<'static, FlushResult<F, V>> + Send + Sync;

struct Slot<F: Ord, V> {
    patch: PendingPatch<F, V>,
    timer: ScheduledTask,
    generation: u64,
}

struct Table<K, F: Ord, V> {
    slots: HashMap<K, Slot<F, V>>,
    failed: HashMap<K, PendingPatch<F, V>>,
    generation: u64,
}

impl<K: Eq + Hash + Debug, F: Ord, V> Table<K, F, V> {
    /// Keep a patch whose write failed, under any newer edits of the same entity
    fn restore(&mut self, id: K, patch: PendingPatch<F, V>) {
        debug!("keeping failed write for {id:?}");
        match self.slots.get_mut(&id) {
            Some(slot) => slot.patch.merge_older(patch),
            None => match self.failed.entry(id) {
                Entry::Occupied(mut entry) => entry.get_mut().merge_older(patch),
                Entry::Vacant(entry) => {
                    entry.insert(patch);
                }
            },
        }
    }
}

pub struct WriteCoalescer<K, F: Ord, V> {
    delay: Duration,
    gate: Arc<tokio::sync::Mutex<()>>,
    table: Arc<Mutex<Table<K, F, V>>>,
    flush: Arc<FlushFn<K, F, V>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K, F, V> WriteCoalescer<K, F, V>
where
    K: Clone + Debug + Eq + Hash + Send + 'static,
    F: Clone + Ord + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Coalescer with its own gate
    pub fn new<C, Fut>(delay: Duration, flush: C) -> Self
    where
        C: Fn(K, PendingPatch<F, V>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FlushResult<F, V>> + Send + 'static,
    {
        Self::with_gate(delay, Arc::default(), flush)
    }

    /// Coalescer whose flushes are serialized with every other holder of `gate`
    pub fn with_gate<C, Fut>(delay: Duration, gate: Arc<tokio::sync::Mutex<()>>, flush: C) -> Self
    where
        C: Fn(K, PendingPatch<F, V>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FlushResult<F, V>> + Send + 'static,
    {
        Self {
            delay,
            gate,
            table: Arc::new(Mutex::new(Table {
                slots: HashMap::new(),
                failed: HashMap::new(),
                generation: 0,
            })),
            flush: Arc::new(move |id, patch| flush(id, patch).boxed()),
        }
    }

    /// Merge `field = value` into the pending patch of `id` and restart its timer
    pub fn record(&self, id: K, field: F, value: V) {
        let mut guard = lock(&self.table);
        let table = &mut *guard;
        table.generation += 1;
        let generation = table.generation;

        let timer = schedule(
            self.delay,
            Self::fire(
                Arc::clone(&self.table),
                Arc::clone(&self.gate),
                Arc::clone(&self.flush),
                id.clone(),
                generation,
            ),
        );

        match table.slots.entry(id) {
            Entry::Occupied(mut entry) => {
                let slot = entry.get_mut();
                slot.timer.cancel();
                slot.patch.set(field, value);
                slot.timer = timer;
                slot.generation = generation;
                debug!("rescheduled write for {:?}", entry.key());
            }
            Entry::Vacant(entry) => {
                debug!("scheduled write for {:?}", entry.key());
                let mut patch = table.failed.remove(entry.key()).unwrap_or_default();
                patch.set(field, value);
                entry.insert(Slot {
                    patch,
                    timer,
                    generation,
                });
            }
        }
    }

    /// Discard the pending or failed patch of `id` without flushing it
    ///
    /// Returns whether anything was pending.
    pub fn cancel(&self, id: &K) -> bool {
        let mut table = lock(&self.table);
        let failed = table.failed.remove(id).is_some();

        match table.slots.remove(id) {
            Some(slot) => {
                slot.timer.cancel();
                debug!("cancelled pending write for {id:?}");
                true
            }
            None => failed,
        }
    }

    /// [`Self::cancel`] every entity matching `predicate`; returns how many there were
    pub fn cancel_where(&self, predicate: impl Fn(&K) -> bool) -> usize {
        let mut guard = lock(&self.table);
        let table = &mut *guard;
        let before = table.slots.len() + table.failed.len();

        table.slots.retain(|id, slot| {
            let keep = !predicate(id);
            if !keep {
                slot.timer.cancel();
                debug!("cancelled pending write for {id:?}");
            }
            keep
        });
        table.failed.retain(|id, _| !predicate(id));

        before - table.slots.len() - table.failed.len()
    }

    /// Copy of the patch not yet written for `id`, scheduled or failed
    pub fn pending(&self, id: &K) -> Option<PendingPatch<F, V>> {
        let table = lock(&self.table);
        table
            .slots
            .get(id)
            .map(|slot| slot.patch.clone())
            .or_else(|| table.failed.get(id).cloned())
    }

    /// Copies of all patches not yet written, scheduled or failed
    pub fn pending_all(&self) -> Vec<(K, PendingPatch<F, V>)> {
        let table = lock(&self.table);
        table
            .slots
            .iter()
            .map(|(id, slot)| (id.clone(), slot.patch.clone()))
            .chain(
                table
                    .failed
                    .iter()
                    .map(|(id, patch)| (id.clone(), patch.clone())),
            )
            .collect()
    }

    /// Number of entities with a scheduled patch
    pub fn len(&self) -> usize {
        lock(&self.table).slots.len()
    }

    /// Number of entities whose last write failed and has not been retried
    pub fn failed_len(&self) -> usize {
        lock(&self.table).failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retry every failed patch and flush every pending one without waiting
    ///
    /// Patches are taken one at a time so that those not yet written stay
    /// visible through [`WriteCoalescer::pending_all`]. Each is attempted at
    /// most once per call.
    pub async fn flush_all(&self) {
        let _gate = self.gate.lock().await;

        let retries: Vec<K> = lock(&self.table).failed.keys().cloned().collect();
        for id in retries {
            let Some(patch) = lock(&self.table).failed.remove(&id) else {
                continue;
            };
            debug!("retrying failed write for {id:?}");
            Self::write(&self.table, &*self.flush, id, patch).await;
        }

        loop {
            let next = {
                let mut table = lock(&self.table);
                let id = table.slots.keys().next().cloned();
                id.and_then(|id| table.slots.remove(&id).map(|slot| (id, slot)))
            };
            let Some((id, slot)) = next else {
                break;
            };

            slot.timer.cancel();
            Self::write(&self.table, &*self.flush, id, slot.patch).await;
        }
    }

    async fn write(
        table: &Mutex<Table<K, F, V>>,
        flush: &FlushFn<K, F, V>,
        id: K,
        patch: PendingPatch<F, V>,
    ) {
        if let Err(patch) = flush(id.clone(), patch).await {
            lock(table).restore(id, patch);
        }
    }

    async fn fire(
        table: Arc<Mutex<Table<K, F, V>>>,
        gate: Arc<tokio::sync::Mutex<()>>,
        flush: Arc<FlushFn<K, F, V>>,
        id: K,
        generation: u64,
    ) {
        let _gate = gate.lock().await;

        let patch = {
            let mut table = lock(&table);
            match table.slots.get(&id) {
                Some(slot) if slot.generation == generation => {
                    table.slots.remove(&id).map(|slot| slot.patch)
                }
                _ => None,
            }
        };

        if let Some(patch) = patch {
            debug!("flushing write for {id:?}");
            Self::write(&table, &*flush, id, patch).await;
        }
    }
}

impl<K, F: Ord, V> Drop for WriteCoalescer<K, F, V> {
    fn drop(&mut self) {
        for slot in lock(&self.table).slots.values() {
            slot.timer.cancel();
        }
    }
}
