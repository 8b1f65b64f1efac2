use std::collections::VecDeque;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace};

use crate::errors::AppResult;
use crate::kv::KvStore;

/// Default chunk size for [`batch_iter`], matching the downstream load
/// stage's insert batch.
pub const DEFAULT_CHUNK_SIZE: usize = 250;

/// Buffered, namespaced batch writer for the intermediate store.
///
/// Records accumulate in memory and are flushed as one serialized blob per
/// batch under `"{namespace}:{sequence_id}"`. Sequence ids are dense from 0
/// for the lifetime of one writer; opening a writer wipes the namespace so
/// a rerun never mixes data from a previous attempt.
pub struct IntermediateWriter<T> {
    kv: KvStore,
    namespace: String,
    batch: Vec<T>,
    batch_next_id: u64,
    batch_sz: usize,
    ttl_secs: u64,
}

impl<T: Serialize> IntermediateWriter<T> {
    pub fn open(kv: KvStore, namespace: &str, batch_sz: usize, ttl_secs: u64) -> AppResult<Self> {
        let writer = Self {
            kv,
            namespace: namespace.to_string(),
            batch: Vec::new(),
            batch_next_id: 0,
            batch_sz: batch_sz.max(1),
            ttl_secs,
        };
        writer.wipe()?;
        Ok(writer)
    }

    /// Scan-and-delete everything under the namespace prefix.
    fn wipe(&self) -> AppResult<()> {
        let keys = self.kv.scan_prefix(&namespace_prefix(&self.namespace))?;
        if keys.is_empty() {
            return Ok(());
        }
        debug!(
            namespace = %self.namespace,
            stale = keys.len(),
            "wiping previous intermediate data"
        );
        for chunk in batch_iter(keys, DEFAULT_CHUNK_SIZE) {
            self.kv.delete(&chunk)?;
        }
        Ok(())
    }

    /// Flush-then-buffer: the previous full batch is written out before the
    /// new record is appended, so the buffer can transiently hold
    /// `batch_sz + 1` records.
    pub fn add(&mut self, record: T) -> AppResult<()> {
        if self.batch.len() > self.batch_sz {
            self.flush()?;
        }
        self.batch.push(record);
        Ok(())
    }

    /// Writes any pending records under the next sequence id. Must be called
    /// at end-of-stream; a partial batch is otherwise lost. No-op when the
    /// buffer is empty.
    pub fn flush(&mut self) -> AppResult<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let key = batch_key(&self.namespace, self.batch_next_id);
        let payload = serde_json::to_string(&self.batch)?;
        self.kv.set_ex(&key, &payload, self.ttl_secs)?;
        trace!(key = %key, records = self.batch.len(), "flushed intermediate batch");
        self.batch_next_id += 1;
        self.batch.clear();
        Ok(())
    }
}

/// Reader half of the intermediate store hand-off.
pub struct IntermediateReader<T> {
    kv: KvStore,
    namespace: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> IntermediateReader<T> {
    pub fn new(kv: KvStore, namespace: &str) -> Self {
        Self {
            kv,
            namespace: namespace.to_string(),
            _marker: PhantomData,
        }
    }

    /// Lazy pass over all records in the namespace: batches are fetched and
    /// deserialized one at a time, in sequence-id order, and their records
    /// yielded in intra-batch order. Missing or empty batches are skipped.
    /// Each call re-scans storage, so a fresh pass is safe as long as no
    /// concurrent wipe occurs.
    pub fn records(&self) -> AppResult<RecordIter<T>> {
        let mut keys = self.kv.scan_prefix(&namespace_prefix(&self.namespace))?;
        keys.sort_by_key(|key| sequence_id(key));
        Ok(RecordIter {
            kv: self.kv.clone(),
            keys: keys.into(),
            current: Vec::new().into_iter(),
        })
    }
}

pub struct RecordIter<T> {
    kv: KvStore,
    keys: VecDeque<String>,
    current: std::vec::IntoIter<T>,
}

impl<T: DeserializeOwned> Iterator for RecordIter<T> {
    type Item = AppResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.current.next() {
                return Some(Ok(record));
            }
            let key = self.keys.pop_front()?;
            match self.kv.get(&key) {
                Ok(Some(payload)) => match serde_json::from_str::<Vec<T>>(&payload) {
                    Ok(records) => self.current = records.into_iter(),
                    Err(err) => return Some(Err(err.into())),
                },
                // Batch expired between scan and fetch; skip it.
                Ok(None) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

/// Groups any iterator into chunks of up to `size` items, lazily: no more
/// than one chunk is held in memory, no item is skipped or duplicated, and
/// the final chunk may be short.
pub fn batch_iter<I>(iter: I, size: usize) -> BatchIter<I::IntoIter>
where
    I: IntoIterator,
{
    BatchIter {
        inner: iter.into_iter(),
        size: size.max(1),
    }
}

pub struct BatchIter<I> {
    inner: I,
    size: usize,
}

impl<I: Iterator> Iterator for BatchIter<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut chunk = Vec::new();
        for _ in 0..self.size {
            match self.inner.next() {
                Some(item) => chunk.push(item),
                None => break,
            }
        }
        if chunk.is_empty() {
            None
        } else {
            Some(chunk)
        }
    }
}

fn namespace_prefix(namespace: &str) -> String {
    format!("{namespace}:")
}

fn batch_key(namespace: &str, sequence_id: u64) -> String {
    format!("{namespace}:{sequence_id}")
}

fn sequence_id(key: &str) -> u64 {
    key.rsplit(':')
        .next()
        .and_then(|suffix| suffix.parse().ok())
        .unwrap_or(u64::MAX)
}
