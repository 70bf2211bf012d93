//! Drives products through the view, image and content stages and keeps the
//! PLU cache reconciled.
//!
//! Two loops run on their own tasks: the sync loop walks the three stages in
//! order, the reconcile loop copies the durable PLU hashes into the cache.
//! Both tick on an interval and also accept commands to run immediately or
//! to shut down.
use crate::cache::CacheService;
use crate::collaborators::{CategoryMapper, Geocoder};
use crate::content::{ContentError, ContentProcessor};
use crate::images::ImageProcessor;
use crate::materializer::{MaterializeError, Materializer, PurgeReport};
use crate::metrics_defs::{
    PLU_INTEGRITY_ERROR, STAGE_DURATION, STAGE_ITEM_FAILED, STAGE_ITEM_SUCCEEDED,
};
use crate::reconciler::{ReconcileError, ReconcileReport, Reconciler};
use crate::store::{DocumentStore, StoreError};
use plu::{PluHasher, Product, ProductId, Stage};
use shared::{counter, histogram};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{AcquireError, Semaphore, SemaphorePermit, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    #[error("document store error: {0}")]
    Store(#[from] StoreError),
    #[error("reconciliation failed: {0}")]
    Reconcile(#[from] ReconcileError),
    #[error("materialization failed: {0}")]
    Materialize(#[from] MaterializeError),
    #[error("stage lock closed")]
    ConcurrentRun(#[from] AcquireError),
    #[error("scheduler is shut down")]
    Stopped,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StageReport {
    pub stage: Stage,
    pub candidates: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl StageReport {
    fn new(stage: Stage, candidates: usize) -> Self {
        StageReport {
            stage,
            candidates,
            succeeded: 0,
            failed: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SyncReport {
    pub view: StageReport,
    pub image: StageReport,
    pub content: StageReport,
}

/// The stage processors plus one permit per stage, so that a stage never
/// runs twice at the same time.
pub struct Pipeline {
    store: Arc<dyn DocumentStore>,
    cache: Arc<dyn CacheService>,
    materializer: Materializer,
    images: ImageProcessor,
    content: Arc<ContentProcessor>,
    reconciler: Reconciler,
    view_lock: Semaphore,
    image_lock: Semaphore,
    content_lock: Semaphore,
    reconcile_lock: Semaphore,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        cache: Arc<dyn CacheService>,
        geocoder: Arc<dyn Geocoder>,
        categories: Arc<dyn CategoryMapper>,
        hasher: Arc<dyn PluHasher>,
        hash_length: usize,
        plu_ttl: Duration,
    ) -> Self {
        Pipeline {
            materializer: Materializer::new(store.clone(), hasher.clone(), hash_length),
            images: ImageProcessor::new(store.clone()),
            content: Arc::new(ContentProcessor::new(
                store.clone(),
                cache.clone(),
                geocoder,
                categories,
                hasher,
                hash_length,
            )),
            reconciler: Reconciler::new(store.clone(), cache.clone(), plu_ttl),
            store,
            cache,
            view_lock: Semaphore::new(1),
            image_lock: Semaphore::new(1),
            content_lock: Semaphore::new(1),
            reconcile_lock: Semaphore::new(1),
        }
    }

    /// Drops the product's retired PLU hashes from its record and the cache.
    pub async fn purge_retired(
        &self,
        product_id: ProductId,
    ) -> Result<PurgeReport, SchedulerError> {
        let _permit = Self::permit(&self.view_lock).await?;
        Ok(self
            .materializer
            .purge_retired(product_id, self.cache.as_ref())
            .await?)
    }

    async fn permit(lock: &Semaphore) -> Result<SemaphorePermit<'_>, AcquireError> {
        lock.acquire().await
    }

    /// Runs `process` on every candidate. A failure is logged and counted and
    /// the next candidate is processed anyway.
    async fn run_stage<'a, F, Fut, E>(
        &'a self,
        stage: Stage,
        candidates: Vec<Product>,
        process: F,
    ) -> StageReport
    where
        F: Fn(&'a Self, Product) -> Fut,
        Fut: Future<Output = Result<(), E>> + 'a,
        E: std::fmt::Display + StageFailure,
    {
        let start = Instant::now();
        let mut report = StageReport::new(stage, candidates.len());

        for product in candidates {
            let product_id = product.product_id;
            match process(self, product).await {
                Ok(()) => report.succeeded += 1,
                Err(e) => {
                    report.failed += 1;
                    if e.is_integrity() {
                        counter!(PLU_INTEGRITY_ERROR).increment(1);
                        tracing::error!(
                            product_id,
                            stage = %stage,
                            flag = stage.flag_name(),
                            error = %e,
                            "PLU integrity error"
                        );
                    } else {
                        tracing::warn!(
                            product_id,
                            stage = %stage,
                            flag = stage.flag_name(),
                            error = %e,
                            "Stage failed for product; flag left unset"
                        );
                    }
                }
            }
        }

        histogram!(STAGE_DURATION, "stage" => stage.as_str())
            .record(start.elapsed().as_secs_f64());
        counter!(STAGE_ITEM_SUCCEEDED, "stage" => stage.as_str())
            .increment(report.succeeded as u64);
        counter!(STAGE_ITEM_FAILED, "stage" => stage.as_str()).increment(report.failed as u64);

        if report.candidates > 0 {
            tracing::info!(
                stage = %stage,
                candidates = report.candidates,
                succeeded = report.succeeded,
                failed = report.failed,
                "Stage pass finished"
            );
        }
        report
    }

    /// Candidates whose prerequisite stage is done and `stage` is not.
    async fn candidates(&self, stage: Stage) -> Result<Vec<Product>, SchedulerError> {
        let products = self.store.find_products_by_flag(stage, false).await?;
        Ok(products
            .into_iter()
            .filter(|p| p.status.is_ready_for(stage))
            .collect())
    }

    pub async fn run_view_stage(&self) -> Result<StageReport, SchedulerError> {
        let _permit = Self::permit(&self.view_lock).await?;
        let candidates = self.candidates(Stage::View).await?;
        Ok(self
            .run_stage(Stage::View, candidates, |pipeline, product| async move {
                pipeline.materializer.publish(&product).await.map(|_| ())
            })
            .await)
    }

    pub async fn run_image_stage(&self) -> Result<StageReport, SchedulerError> {
        let _permit = Self::permit(&self.image_lock).await?;
        let candidates = self.candidates(Stage::Image).await?;
        Ok(self
            .run_stage(Stage::Image, candidates, |pipeline, product| async move {
                pipeline.images.process(&product).await.map(|_| ())
            })
            .await)
    }

    pub async fn run_content_stage(&self) -> Result<StageReport, SchedulerError> {
        let _permit = Self::permit(&self.content_lock).await?;
        let candidates = self.candidates(Stage::Content).await?;
        Ok(self
            .run_stage(Stage::Content, candidates, |pipeline, product| async move {
                pipeline.content.process(&product).await.map(|_| ())
            })
            .await)
    }

    /// One sync tick: view, then image, then content.
    pub async fn run_sync(&self) -> Result<SyncReport, SchedulerError> {
        let view = self.run_view_stage().await?;
        let image = self.run_image_stage().await?;
        let content = self.run_content_stage().await?;
        Ok(SyncReport {
            view,
            image,
            content,
        })
    }

    pub async fn run_reconcile(&self) -> Result<ReconcileReport, SchedulerError> {
        let _permit = Self::permit(&self.reconcile_lock).await?;
        Ok(self.reconciler.reconcile().await?)
    }
}

/// Lets the stage runner tell integrity failures from transient ones.
trait StageFailure {
    fn is_integrity(&self) -> bool {
        false
    }
}

impl StageFailure for MaterializeError {
    fn is_integrity(&self) -> bool {
        MaterializeError::is_integrity(self)
    }
}

impl StageFailure for crate::images::ImageError {}

impl StageFailure for ContentError {
    fn is_integrity(&self) -> bool {
        matches!(self, ContentError::Codec(_))
    }
}

#[derive(Debug)]
enum Command<T> {
    // Run a pass now instead of waiting for the next tick. The loop sends the
    // result once the pass finishes.
    Run(oneshot::Sender<Result<T, SchedulerError>>),
    // Finish the current pass and exit the loop.
    Shutdown,
}

struct SchedulerInner {
    pipeline: Arc<Pipeline>,
    ready: AtomicBool,
}

/// Owns the sync and reconcile loops.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    sync_tx: mpsc::Sender<Command<SyncReport>>,
    reconcile_tx: mpsc::Sender<Command<ReconcileReport>>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn start(
        pipeline: Arc<Pipeline>,
        sync_interval: Duration,
        reconcile_interval: Duration,
    ) -> Self {
        let (sync_tx, sync_rx) = mpsc::channel(16);
        let (reconcile_tx, reconcile_rx) = mpsc::channel(16);

        let inner = Arc::new(SchedulerInner {
            pipeline,
            ready: AtomicBool::new(false),
        });

        let sync_inner = inner.clone();
        let sync = tokio::spawn(async move {
            run_loop("sync", sync_interval, sync_rx, move || {
                let inner = sync_inner.clone();
                async move { inner.pipeline.run_sync().await }
            })
            .await;
        });

        let reconcile_inner = inner.clone();
        let reconcile = tokio::spawn(async move {
            run_loop("reconcile", reconcile_interval, reconcile_rx, move || {
                let inner = reconcile_inner.clone();
                async move {
                    let result = inner.pipeline.run_reconcile().await;
                    if result.is_ok() {
                        inner.ready.store(true, Ordering::Relaxed);
                    }
                    result
                }
            })
            .await;
        });

        Scheduler {
            inner,
            sync_tx,
            reconcile_tx,
            handles: parking_lot::Mutex::new(vec![sync, reconcile]),
        }
    }

    /// True once a reconciliation pass has completed.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Relaxed)
    }

    pub async fn sync_now(&self) -> Result<SyncReport, SchedulerError> {
        request(&self.sync_tx).await
    }

    pub async fn reconcile_now(&self) -> Result<ReconcileReport, SchedulerError> {
        request(&self.reconcile_tx).await
    }

    /// Lets both loops finish their current pass, then waits for them to exit.
    pub async fn shutdown(&self) {
        let _ = self.sync_tx.send(Command::Shutdown).await;
        let _ = self.reconcile_tx.send(Command::Shutdown).await;

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Scheduler loop ended abnormally");
            }
        }
        tracing::info!("Scheduler stopped");
    }
}

async fn request<T>(tx: &mpsc::Sender<Command<T>>) -> Result<T, SchedulerError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(Command::Run(reply_tx))
        .await
        .map_err(|_| SchedulerError::Stopped)?;
    reply_rx.await.map_err(|_| SchedulerError::Stopped)?
}

async fn run_loop<T, F, Fut>(
    name: &'static str,
    interval: Duration,
    mut rx: mpsc::Receiver<Command<T>>,
    pass: F,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, SchedulerError>>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = pass().await {
                    tracing::error!(loop_name = name, error = %e, "Scheduled pass failed");
                }
            }
            cmd = rx.recv() => match cmd {
                Some(Command::Run(reply)) => {
                    let _ = reply.send(pass().await);
                }
                Some(Command::Shutdown) | None => break,
            }
        }
    }
    tracing::debug!(loop_name = name, "Loop exited");
}
