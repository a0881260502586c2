use crate::errors::EngineResult;
use crate::events::{EngineEventKind, EventSink};
use crate::persist::{self, keys};
use crate::types::{OutcomeRecord, Statistics, StatisticsSummary, now_ms};
use drover_store::SharedStateStore;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Pure bookkeeping over run statistics, flushed to the store after
/// every update. Holds the invariant
/// `total_processed == successful + skipped + failed`.
#[derive(Clone)]
pub struct StatisticsAggregator {
    store: SharedStateStore,
    events: EventSink,
    inner: Arc<Mutex<Statistics>>,
}

impl StatisticsAggregator {
    pub fn new(store: SharedStateStore, events: EventSink) -> Self {
        Self {
            store,
            events,
            inner: Arc::new(Mutex::new(Statistics::default())),
        }
    }

    pub async fn reset(&self, run_id: impl Into<String>) -> EngineResult<()> {
        let mut stats = self.inner.lock().await;
        *stats = Statistics::new_run(run_id);
        persist::save(&self.store, keys::STATISTICS, &*stats).await?;
        Ok(())
    }

    /// Adopt persisted statistics on cold start, keeping the current
    /// in-memory run when storage holds nothing.
    pub async fn hydrate(&self) -> EngineResult<()> {
        let stored: Option<Statistics> = persist::load(&self.store, keys::STATISTICS).await?;
        let Some(stored) = stored else {
            return Ok(());
        };
        *self.inner.lock().await = stored;
        Ok(())
    }

    pub async fn record_success(&self, record: OutcomeRecord) -> EngineResult<()> {
        let mut stats = self.inner.lock().await;
        stats.total_processed += 1;
        stats.successful += 1;
        stats.total_processing_time_ms += record.processing_time_ms;
        // Incremental mean over the successful count; a windowed mean
        // would drift on long runs.
        stats.average_processing_time_ms =
            stats.total_processing_time_ms as f64 / f64::from(stats.successful);
        stats.records.push(record);
        self.flush(&mut stats).await
    }

    pub async fn record_skip(&self, record: OutcomeRecord) -> EngineResult<()> {
        let mut stats = self.inner.lock().await;
        stats.total_processed += 1;
        stats.skipped += 1;
        stats.records.push(record);
        self.flush(&mut stats).await
    }

    pub async fn record_fail(&self, record: OutcomeRecord) -> EngineResult<()> {
        let mut stats = self.inner.lock().await;
        stats.total_processed += 1;
        stats.failed += 1;
        stats.records.push(record);
        self.flush(&mut stats).await
    }

    pub async fn record_retry(&self) -> EngineResult<()> {
        let mut stats = self.inner.lock().await;
        stats.retry_attempts += 1;
        self.flush(&mut stats).await
    }

    pub async fn finalize(&self) -> EngineResult<StatisticsSummary> {
        let mut stats = self.inner.lock().await;
        if stats.end_time.is_none() {
            stats.end_time = Some(now_ms());
        }
        self.flush(&mut stats).await?;
        Ok(stats.summary())
    }

    pub async fn snapshot(&self) -> Statistics {
        self.inner.lock().await.clone()
    }

    pub async fn summary(&self) -> StatisticsSummary {
        self.inner.lock().await.summary()
    }

    async fn flush(&self, stats: &mut Statistics) -> EngineResult<()> {
        debug_assert_eq!(
            stats.total_processed,
            stats.successful + stats.skipped + stats.failed
        );
        persist::save(&self.store, keys::STATISTICS, stats).await?;
        self.events.emit(EngineEventKind::StatisticsUpdate {
            summary: stats.summary(),
        });
        Ok(())
    }
}
