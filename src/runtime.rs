//! Worker-pool runtime for linkgraph.
//!
//! Pair scoring is embarrassingly parallel and fire-and-forget; clustering is
//! a long sequential drain per graph. They run on separate bounded pools so a
//! large drain never starves scoring and vice versa.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendError, Sender, TrySendError};
use tracing::{debug, warn};

use crate::blocking::{PairDispatcher, PairProcessor, PairTask};
use crate::clustering::{ClusteringEngine, ClusteringReport};
use crate::config::LinkingConfig;
use crate::entity::EntitySource;
use crate::error::{LinkingError, LinkingResult};
use crate::ids::GraphId;
use crate::progress::CompletionCounter;
use crate::scoring::{FeatureExtractor, ScoringOracle};
use crate::storage::GraphStore;
use crate::weighting::EdgeWeighter;

/// Execution path selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionPath {
    /// Pair scoring and recording.
    Scoring,
    /// Graph draining.
    Clustering,
}

impl ExecutionPath {
    /// Short name used in errors and thread names.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Scoring => "scoring",
            Self::Clustering => "clustering",
        }
    }
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of scoring workers.
    pub scoring_workers: usize,
    /// Number of clustering workers.
    pub clustering_workers: usize,
    /// Maximum queued jobs per pool.
    pub queue_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scoring_workers: 4,
            clustering_workers: 1,
            queue_capacity: 1024,
        }
    }
}

enum Job {
    Score {
        task: PairTask,
        counter: Arc<CompletionCounter>,
    },
    Cluster {
        graph_id: GraphId,
        threshold: f64,
        reply: Sender<LinkingResult<ClusteringReport>>,
    },

    #[cfg(test)]
    Sleep {
        duration: Duration,
        reply: Sender<()>,
    },
}

struct Workers {
    processor: PairProcessor,
    engine: Arc<ClusteringEngine>,
}

impl Workers {
    fn run(&self, job: Job) {
        match job {
            Job::Score { task, counter } => {
                // Failures are recorded on the counter, panics included.
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    self.processor.process_counted(&task, &counter)
                }));
                if outcome.is_err() {
                    warn!(graph_id = %task.graph_id, a = %task.a, b = %task.b, "pair scoring panicked");
                    counter.fail_one("pair scoring panicked");
                }
            }
            Job::Cluster {
                graph_id,
                threshold,
                reply,
            } => {
                let _ = reply.send(self.engine.cluster(graph_id, threshold));
            }

            #[cfg(test)]
            Job::Sleep { duration, reply } => {
                thread::sleep(duration);
                let _ = reply.send(());
            }
        }
    }
}

struct WorkerPool {
    path: ExecutionPath,
    tx: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
}

impl WorkerPool {
    fn start(path: ExecutionPath, workers: usize, queue_capacity: usize, ctx: Arc<Workers>) -> Self {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity);

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<Job> = rx.clone();
            let ctx = Arc::clone(&ctx);
            let thread_name = format!("linkgraph-{}-{idx}", path.as_str());
            let handle = thread::Builder::new()
                .name(thread_name)
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        ctx.run(job);
                    }
                })
                .expect("failed to spawn linkgraph worker");
            handles.push(handle);
        }

        Self {
            path,
            tx,
            workers: handles,
            queue_capacity,
        }
    }

    fn idle(path: ExecutionPath) -> Self {
        Self {
            path,
            tx: bounded::<Job>(1).0,
            workers: Vec::new(),
            queue_capacity: 1,
        }
    }

    fn try_submit(&self, job: Job) -> LinkingResult<()> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(LinkingError::QueueFull {
                path: self.path.as_str().to_string(),
                capacity: self.queue_capacity,
            }),
            Err(TrySendError::Disconnected(_)) => Err(LinkingError::Disconnected {
                path: self.path.as_str().to_string(),
            }),
        }
    }

    /// Blocks while the queue is full.
    fn submit(&self, job: Job) -> LinkingResult<()> {
        self.tx.send(job).map_err(|SendError(_)| LinkingError::Disconnected {
            path: self.path.as_str().to_string(),
        })
    }

    fn shutdown(self) {
        // Close the channel: workers will drain queued jobs then exit.
        drop(self.tx);
        for handle in self.workers {
            let _ = handle.join();
        }
    }
}

/// Handle returned by [`LinkingRuntime::cluster_async`].
pub struct ClusteringHandle {
    graph_id: GraphId,
    rx: Receiver<LinkingResult<ClusteringReport>>,
}

impl ClusteringHandle {
    /// Graph being drained.
    #[must_use]
    pub const fn graph_id(&self) -> GraphId {
        self.graph_id
    }

    /// Waits for the drain to finish.
    pub fn join(self) -> LinkingResult<ClusteringReport> {
        self.rx.recv().map_err(|_| LinkingError::Disconnected {
            path: ExecutionPath::Clustering.as_str().to_string(),
        })?
    }

    /// Waits for the drain to finish with a timeout.
    ///
    /// Timing out abandons the wait only; the drain keeps running.
    pub fn join_timeout(self, timeout: Duration) -> LinkingResult<ClusteringReport> {
        self.rx
            .recv_timeout(timeout)
            .map_err(|err| match err {
                crossbeam_channel::RecvTimeoutError::Timeout => LinkingError::Timeout {
                    duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
                },
                crossbeam_channel::RecvTimeoutError::Disconnected => LinkingError::Disconnected {
                    path: ExecutionPath::Clustering.as_str().to_string(),
                },
            })?
    }
}

/// Runtime running scoring and clustering on isolated worker pools.
pub struct LinkingRuntime {
    scoring: WorkerPool,
    clustering: WorkerPool,
    weighter: Arc<EdgeWeighter>,
    default_threshold: f64,
}

impl LinkingRuntime {
    /// Creates a runtime from its parts.
    pub fn new(
        processor: PairProcessor,
        engine: Arc<ClusteringEngine>,
        default_threshold: f64,
        config: &RuntimeConfig,
    ) -> Self {
        let weighter = Arc::clone(processor.weighter());
        let ctx = Arc::new(Workers { processor, engine });
        let scoring = WorkerPool::start(
            ExecutionPath::Scoring,
            config.scoring_workers,
            config.queue_capacity,
            Arc::clone(&ctx),
        );
        let clustering = WorkerPool::start(
            ExecutionPath::Clustering,
            config.clustering_workers,
            config.queue_capacity,
            ctx,
        );
        Self {
            scoring,
            clustering,
            weighter,
            default_threshold,
        }
    }

    /// Wires a runtime over `store` according to `config`.
    ///
    /// # Errors
    /// `Validation` if the configuration is invalid.
    pub fn from_config(
        store: Arc<dyn GraphStore>,
        entities: Arc<dyn EntitySource>,
        features: Arc<dyn FeatureExtractor>,
        oracle: Arc<dyn ScoringOracle>,
        config: &LinkingConfig,
    ) -> LinkingResult<Self> {
        config.validate()?;
        let weighter = Arc::new(
            EdgeWeighter::new(Arc::clone(&store), features, oracle).with_bias(config.score_bias)?,
        );
        let processor = PairProcessor::new(weighter, entities);
        let engine = Arc::new(ClusteringEngine::new(store));
        Ok(Self::new(
            processor,
            engine,
            config.threshold,
            &config.runtime_config(),
        ))
    }

    /// Weighter shared by the scoring workers.
    #[must_use]
    pub fn weighter(&self) -> &Arc<EdgeWeighter> {
        &self.weighter
    }

    /// Threshold used by [`LinkingRuntime::cluster`].
    #[must_use]
    pub const fn default_threshold(&self) -> f64 {
        self.default_threshold
    }

    /// Queues a drain of `graph_id` on the clustering pool.
    ///
    /// # Errors
    /// `QueueFull` or `Disconnected` if the job could not be queued.
    pub fn cluster_async(&self, graph_id: GraphId, threshold: f64) -> LinkingResult<ClusteringHandle> {
        let (reply, rx) = bounded::<LinkingResult<ClusteringReport>>(1);
        self.clustering.try_submit(Job::Cluster {
            graph_id,
            threshold,
            reply,
        })?;
        debug!(%graph_id, threshold, "clustering queued");
        Ok(ClusteringHandle { graph_id, rx })
    }

    /// Drains `graph_id` with the default threshold and waits for the result.
    pub fn cluster(&self, graph_id: GraphId) -> LinkingResult<ClusteringReport> {
        self.cluster_async(graph_id, self.default_threshold)?.join()
    }

    #[cfg(test)]
    fn submit_sleep(&self, path: ExecutionPath, duration: Duration) -> LinkingResult<Receiver<()>> {
        let (reply, rx) = bounded::<()>(1);
        let job = Job::Sleep { duration, reply };
        match path {
            ExecutionPath::Scoring => self.scoring.try_submit(job)?,
            ExecutionPath::Clustering => self.clustering.try_submit(job)?,
        }
        Ok(rx)
    }
}

impl PairDispatcher for LinkingRuntime {
    fn dispatch(&self, task: PairTask, counter: Arc<CompletionCounter>) -> LinkingResult<()> {
        self.scoring.submit(Job::Score { task, counter })
    }
}

impl Drop for LinkingRuntime {
    fn drop(&mut self) {
        // Deterministic shutdown: stop workers and join threads.
        let scoring = std::mem::replace(&mut self.scoring, WorkerPool::idle(ExecutionPath::Scoring));
        let clustering =
            std::mem::replace(&mut self.clustering, WorkerPool::idle(ExecutionPath::Clustering));

        scoring.shutdown();
        clustering.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    use crate::blocking::{BlockContext, BlockingStage};
    use crate::entity::{GraphEntityPair, InMemoryEntitySource, LinkingEntity, PropertyIndex};
    use crate::ids::{EntityKeyId, EntitySetId, PropertyTypeId, SyncId};
    use crate::progress::{PollConfig, ProgressCounter, ThreadSleeper};
    use crate::scoring::{ExactMatchFeatures, ScoringError};
    use crate::storage::InMemoryGraphStore;

    fn name_oracle(features: &[Vec<f64>]) -> Result<f64, ScoringError> {
        // Same name: distance 0; different: 1.
        Ok(1.0 - features[0][0])
    }

    fn runtime(store: Arc<InMemoryGraphStore>, entities: Arc<InMemoryEntitySource>, config: RuntimeConfig) -> LinkingRuntime {
        let weighter = Arc::new(
            EdgeWeighter::new(store.clone(), Arc::new(ExactMatchFeatures), Arc::new(name_oracle))
                .with_bias(0.0)
                .unwrap(),
        );
        LinkingRuntime::new(
            PairProcessor::new(weighter, entities),
            Arc::new(ClusteringEngine::new(store)),
            0.1,
            &config,
        )
    }

    #[test]
    fn pairs_dispatched_through_runtime_complete() {
        let store = Arc::new(InMemoryGraphStore::new());
        let entities = Arc::new(InMemoryEntitySource::new());
        let set = EntitySetId::new();
        let sync = SyncId::new();
        let name = PropertyTypeId::new();
        let g = GraphId::new();

        let mut block = Vec::new();
        for n in ["ann", "ann", "bob", "bob", "cy"] {
            let key = EntityKeyId::random_in(set);
            entities
                .insert(key, sync, LinkingEntity::new().with_value(name, n))
                .unwrap();
            block.push(GraphEntityPair::new(g, key));
        }

        let rt = Arc::new(runtime(store.clone(), entities, RuntimeConfig::default()));
        let stage = BlockingStage::new(rt.clone());
        let context = BlockContext::new(HashMap::from([(set, sync)]), PropertyIndex::new([name]));

        let ticket = stage.run_block(g, &block, &context).unwrap();
        assert_eq!(ticket.dispatched(), 15);
        let poll = PollConfig {
            interval: Duration::from_millis(5),
            max_stalls: 200,
        };
        ticket.wait(&poll, &ThreadSleeper).unwrap();
        assert_eq!(ticket.counter().failed(), 0);
        assert_eq!(store.edges(g).unwrap().len(), 10);
        assert_eq!(rt.weighter().min_weight(), Some(0.0));

        let report = rt.cluster(g).unwrap();
        assert_eq!(report.merges, 2);
        let mut sizes: Vec<usize> = report.clusters.iter().map(|c| c.vertex.len()).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![1, 2, 2]);
    }

    #[test]
    fn panicking_oracle_fails_the_pair_and_keeps_the_worker() {
        let store = Arc::new(InMemoryGraphStore::new());
        let entities = Arc::new(InMemoryEntitySource::new());
        let set = EntitySetId::new();
        let sync = SyncId::new();
        let name = PropertyTypeId::new();

        let touchy = |features: &[Vec<f64>]| -> Result<f64, ScoringError> {
            assert!(features[0][0] < 0.5, "model crashed on a name match");
            Ok(1.0)
        };
        let weighter = Arc::new(
            EdgeWeighter::new(store.clone(), Arc::new(ExactMatchFeatures), Arc::new(touchy))
                .with_bias(0.0)
                .unwrap(),
        );
        let rt = Arc::new(LinkingRuntime::new(
            PairProcessor::new(weighter, entities.clone()),
            Arc::new(ClusteringEngine::new(store.clone())),
            0.1,
            &RuntimeConfig {
                scoring_workers: 1,
                clustering_workers: 1,
                queue_capacity: 16,
            },
        ));
        let stage = BlockingStage::new(rt.clone());
        let context = BlockContext::new(HashMap::from([(set, sync)]), PropertyIndex::new([name]));
        let add = |g: GraphId, n: &str| {
            let key = EntityKeyId::random_in(set);
            entities
                .insert(key, sync, LinkingEntity::new().with_value(name, n))
                .unwrap();
            GraphEntityPair::new(g, key)
        };
        let poll = PollConfig {
            interval: Duration::from_millis(5),
            max_stalls: 20,
        };

        let g = GraphId::new();
        let ticket = stage
            .run_block(g, &[add(g, "ann"), add(g, "ann")], &context)
            .unwrap();
        let err = ticket.wait(&poll, &ThreadSleeper).unwrap_err();
        assert_eq!(err.remaining, 1);
        assert_eq!(err.failed, 1);
        assert_eq!(
            ticket.counter().last_failure().as_deref(),
            Some("pair scoring panicked")
        );
        assert!(store.edges(g).unwrap().is_empty());

        // The single scoring worker is still serving.
        let h = GraphId::new();
        let ticket = stage
            .run_block(h, &[add(h, "ann"), add(h, "bob")], &context)
            .unwrap();
        ticket.wait(&poll, &ThreadSleeper).unwrap();
        assert_eq!(store.edges(h).unwrap().len(), 1);
    }

    #[test]
    fn clustering_work_does_not_starve_scoring() {
        let store = Arc::new(InMemoryGraphStore::new());
        let entities = Arc::new(InMemoryEntitySource::new());
        let rt = runtime(
            store,
            entities,
            RuntimeConfig {
                scoring_workers: 1,
                clustering_workers: 1,
                queue_capacity: 16,
            },
        );

        // Occupy the clustering worker.
        let sleep = rt
            .submit_sleep(ExecutionPath::Clustering, Duration::from_millis(200))
            .unwrap();

        let started = std::time::Instant::now();
        let quick = rt
            .submit_sleep(ExecutionPath::Scoring, Duration::from_millis(1))
            .unwrap();
        quick.recv_timeout(Duration::from_millis(100)).unwrap();
        assert!(started.elapsed() < Duration::from_millis(150));

        sleep.recv_timeout(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn clustering_queue_full_is_reported() {
        let store = Arc::new(InMemoryGraphStore::new());
        let entities = Arc::new(InMemoryEntitySource::new());
        let rt = runtime(
            store,
            entities,
            RuntimeConfig {
                scoring_workers: 1,
                clustering_workers: 1,
                queue_capacity: 1,
            },
        );

        let busy = rt
            .submit_sleep(ExecutionPath::Clustering, Duration::from_millis(200))
            .unwrap();
        // Give the worker time to pick up the first job so the queue slot frees up.
        thread::sleep(Duration::from_millis(20));
        let _queued = rt
            .submit_sleep(ExecutionPath::Clustering, Duration::from_millis(1))
            .unwrap();

        let err = rt.cluster_async(GraphId::new(), 0.1).err().unwrap();
        let LinkingError::QueueFull { path, capacity } = err else {
            panic!("expected QueueFull, got {err:?}");
        };
        assert_eq!(path, "clustering");
        assert_eq!(capacity, 1);

        busy.recv_timeout(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn join_reports_disconnected_when_reply_sender_dropped() {
        let (tx, rx) = bounded::<LinkingResult<ClusteringReport>>(1);
        drop(tx);

        let handle = ClusteringHandle {
            graph_id: GraphId::new(),
            rx,
        };
        let err = handle.join().unwrap_err();
        let LinkingError::Disconnected { path } = err else {
            panic!("expected Disconnected, got {err:?}");
        };
        assert_eq!(path, "clustering");
    }

    #[test]
    fn join_timeout_reports_timeout() {
        let (_tx, rx) = bounded::<LinkingResult<ClusteringReport>>(1);
        let handle = ClusteringHandle {
            graph_id: GraphId::new(),
            rx,
        };
        let err = handle.join_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, LinkingError::Timeout { duration_ms: 10 }));
    }
}
