use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::geocode::{Address, Geocoder, ResolutionCache};
use crate::intermediate::{IntermediateReader, IntermediateWriter};
use crate::kv::KvStore;

/// One geo-coordinate observation produced by the upstream extract stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinateRecord {
    pub lat: f64,
    pub lng: f64,
    pub dist: f64,
    pub bearing: f64,
}

/// A coordinate record with its resolution outcome attached. `address` is
/// `None` when the provider definitively found nothing at the coordinates,
/// which is a valid result, not a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRecord {
    #[serde(flatten)]
    pub coordinate: CoordinateRecord,
    pub address: Option<Address>,
}

/// Shared run state: a termination flag plus a set-once error slot.
/// The first error recorded wins; every worker checks the flag between
/// suspension points and stops promptly once it is raised.
struct RunContext {
    failed: AtomicBool,
    error: Mutex<Option<AppError>>,
}

impl RunContext {
    fn new() -> Self {
        Self {
            failed: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    fn fail(&self, err: AppError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
        self.failed.store(true, Ordering::SeqCst);
    }

    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    fn take_error(&self) -> Option<AppError> {
        self.error.lock().take()
    }
}

/// Producer/consumer engine that drains an input namespace, resolves each
/// record's address, and writes the results into an output namespace.
///
/// One producer task feeds a queue; `max_concurrent` consumer tasks race
/// for records, each owning its own geocoder key lineage. Any task error
/// fails the whole run: no record is ever silently dropped.
pub struct ResolverPipeline {
    kv: KvStore,
    config: AppConfig,
}

impl ResolverPipeline {
    pub fn new(kv: KvStore, config: AppConfig) -> Self {
        Self { kv, config }
    }

    pub async fn run(&self, input_ns: &str, output_ns: &str) -> AppResult<()> {
        info!(
            input_ns,
            output_ns,
            workers = self.config.max_concurrent,
            "starting resolution run"
        );

        // Opening the writer wipes the output namespace, making reruns
        // idempotent per namespace.
        let writer = IntermediateWriter::open(
            self.kv.clone(),
            output_ns,
            self.config.intermediate_batch_sz,
            self.config.intermediate_expire_secs,
        )?;
        let writer = Arc::new(Mutex::new(writer));
        let ctx = Arc::new(RunContext::new());

        // Dropping the sender when the producer finishes is the
        // termination signal; consumers block on `recv` instead of
        // polling, and wake on close.
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(AsyncMutex::new(rx));

        let reader = IntermediateReader::<CoordinateRecord>::new(self.kv.clone(), input_ns);
        let producer = tokio::spawn(produce(reader, tx, Arc::clone(&ctx)));

        let cache = ResolutionCache::new(self.kv.clone(), self.config.cache_expire_secs);
        let mut consumers = Vec::with_capacity(self.config.max_concurrent);
        for worker in 0..self.config.max_concurrent {
            let geocoder = Geocoder::new(&self.config, cache.clone())?;
            consumers.push(tokio::spawn(consume(
                worker,
                geocoder,
                Arc::clone(&rx),
                Arc::clone(&writer),
                Arc::clone(&ctx),
            )));
        }

        for handle in consumers {
            if let Err(err) = handle.await {
                ctx.fail(AppError::Task(err.to_string()));
            }
        }

        // Consumers may have exited on an error while the producer is
        // still filling the queue.
        producer.abort();

        writer.lock().flush()?;

        if let Some(err) = ctx.take_error() {
            warn!(input_ns, output_ns, %err, "resolution run aborted");
            return Err(err);
        }
        info!(input_ns, output_ns, "resolution run complete");
        Ok(())
    }
}

/// Drains the input store into the work queue. Does not resolve anything
/// itself.
async fn produce(
    reader: IntermediateReader<CoordinateRecord>,
    tx: UnboundedSender<CoordinateRecord>,
    ctx: Arc<RunContext>,
) {
    let records = match reader.records() {
        Ok(records) => records,
        Err(err) => {
            ctx.fail(err);
            return;
        }
    };

    let mut queued = 0usize;
    for record in records {
        if ctx.is_failed() {
            return;
        }
        match record {
            Ok(record) => {
                // A send error means every consumer is gone; the run is
                // already over.
                if tx.send(record).is_err() {
                    return;
                }
                queued += 1;
            }
            Err(err) => {
                ctx.fail(err);
                return;
            }
        }
    }
    debug!(queued, "producer drained input namespace");
}

/// Dequeues records until the queue is closed and drained, resolving each
/// and writing the outcome. Exits early if any peer has failed.
async fn consume(
    worker: usize,
    mut geocoder: Geocoder,
    rx: Arc<AsyncMutex<UnboundedReceiver<CoordinateRecord>>>,
    writer: Arc<Mutex<IntermediateWriter<ResolvedRecord>>>,
    ctx: Arc<RunContext>,
) {
    loop {
        if ctx.is_failed() {
            return;
        }

        // The lock serializes only the dequeue; resolution and the write
        // happen concurrently across workers.
        let record = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(record) = record else {
            debug!(worker, "queue closed and drained; consumer exiting");
            return;
        };
        if ctx.is_failed() {
            return;
        }

        match geocoder.address(record.lat, record.lng).await {
            Ok(address) => {
                let resolved = ResolvedRecord {
                    coordinate: record,
                    address,
                };
                if let Err(err) = writer.lock().add(resolved) {
                    ctx.fail(err);
                    return;
                }
            }
            Err(err) => {
                warn!(worker, lat = record.lat, lng = record.lng, %err, "resolution failed");
                ctx.fail(err);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_error_wins() {
        let ctx = RunContext::new();
        ctx.fail(AppError::Provider("REQUEST_DENIED".into()));
        ctx.fail(AppError::QuotaExhausted);

        assert!(ctx.is_failed());
        match ctx.take_error() {
            Some(AppError::Provider(status)) => assert_eq!(status, "REQUEST_DENIED"),
            other => panic!("expected first error, got {other:?}"),
        }
        // The flag stays raised even after the error is taken.
        assert!(ctx.is_failed());
    }

    #[test]
    fn resolved_record_flattens_coordinates() {
        let record = ResolvedRecord {
            coordinate: CoordinateRecord {
                lat: -30.05,
                lng: -51.17,
                dist: 4.5,
                bearing: 120.0,
            },
            address: None,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["lat"], serde_json::json!(-30.05));
        assert_eq!(value["address"], serde_json::Value::Null);

        let back: ResolvedRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }
}
