//! Blocking stage.
//!
//! A block is the set of entities that share a blocking key, already assigned
//! to a graph. Every unordered pair in the block, self-pairs included, is
//! handed to a [`PairDispatcher`]. Self-pairs make sure an entity that is
//! alone in its block still ends up as a vertex.
//!
//! Dispatch may be synchronous or fire-and-forget, so returning from
//! [`BlockingStage::run_block`] does not mean the pairs are recorded. Callers
//! wait on the returned [`BlockTicket`] for that.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::entity::{EntitySource, GraphEntityPair, PropertyIndex};
use crate::error::{LinkingResult, ValidationError};
use crate::ids::{EntityKeyId, EntitySetId, GraphId, SyncId};
use crate::progress::{
    await_completion, await_completion_or_cancel, CompletionCounter, PollConfig, ProgressCounter,
    Sleeper, StallError, WaitError,
};
use crate::weighting::{EdgeWeighter, PairOutcome};

/// Shared, read-only inputs for scoring the pairs of a block.
#[derive(Debug, Clone, Default)]
pub struct BlockContext {
    /// Sync id to read each entity set at.
    pub sync_ids: Arc<HashMap<EntitySetId, SyncId>>,
    /// Properties that feed the feature matrix.
    pub property_index: Arc<PropertyIndex>,
}

impl BlockContext {
    /// Creates a context.
    #[must_use]
    pub fn new(sync_ids: HashMap<EntitySetId, SyncId>, property_index: PropertyIndex) -> Self {
        Self {
            sync_ids: Arc::new(sync_ids),
            property_index: Arc::new(property_index),
        }
    }
}

/// One candidate pair to score.
#[derive(Debug, Clone)]
pub struct PairTask {
    /// Graph the pair belongs to.
    pub graph_id: GraphId,
    /// First entity.
    pub a: EntityKeyId,
    /// Second entity; equal to `a` for a self-pair.
    pub b: EntityKeyId,
    /// Block inputs.
    pub context: BlockContext,
}

impl PairTask {
    /// Returns true for a self-pair.
    #[must_use]
    pub fn is_self_pair(&self) -> bool {
        self.a == self.b
    }
}

/// Hands pair tasks to whatever executes them.
///
/// Implementations must call [`CompletionCounter::complete_one`] once the pair
/// is recorded, or [`CompletionCounter::fail_one`] if it could not be.
pub trait PairDispatcher: Send + Sync {
    /// Dispatches one task.
    ///
    /// # Errors
    /// Errors only if the task could not be handed off; failures while
    /// processing are reported on `counter`.
    fn dispatch(&self, task: PairTask, counter: Arc<CompletionCounter>) -> LinkingResult<()>;
}

/// Loads the entities of a pair and runs them through the weighter.
#[derive(Clone)]
pub struct PairProcessor {
    weighter: Arc<EdgeWeighter>,
    entities: Arc<dyn EntitySource>,
}

impl fmt::Debug for PairProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairProcessor")
            .field("weighter", &self.weighter)
            .finish_non_exhaustive()
    }
}

impl PairProcessor {
    /// Creates a processor.
    pub fn new(weighter: Arc<EdgeWeighter>, entities: Arc<dyn EntitySource>) -> Self {
        Self { weighter, entities }
    }

    /// The weighter used for every pair.
    #[must_use]
    pub fn weighter(&self) -> &Arc<EdgeWeighter> {
        &self.weighter
    }

    /// Scores and records one pair.
    ///
    /// # Errors
    /// Entity lookup, scoring and storage errors.
    pub fn process(&self, task: &PairTask) -> LinkingResult<PairOutcome> {
        let sync_ids = task.context.sync_ids.as_ref();
        let entity_a = self.entities.require(&task.a, sync_ids)?;
        let entity_b = if task.is_self_pair() {
            entity_a.clone()
        } else {
            self.entities.require(&task.b, sync_ids)?
        };
        self.weighter.score_and_record(
            task.graph_id,
            task.a,
            &entity_a,
            task.b,
            &entity_b,
            &task.context.property_index,
        )
    }

    /// Processes one pair and records the outcome on `counter`.
    ///
    /// Success counts down; failure is recorded as a failure and does not.
    pub fn process_counted(&self, task: &PairTask, counter: &CompletionCounter) -> LinkingResult<PairOutcome> {
        let result = self.process(task);
        match &result {
            Ok(_) => counter.complete_one(),
            Err(err) => {
                warn!(graph_id = %task.graph_id, a = %task.a, b = %task.b, error = %err, "pair failed");
                counter.fail_one(err.to_string());
            }
        }
        result
    }
}

/// Dispatcher that processes each pair on the calling thread.
#[derive(Debug, Clone)]
pub struct InlineDispatcher {
    processor: PairProcessor,
}

impl InlineDispatcher {
    /// Creates an inline dispatcher.
    #[must_use]
    pub const fn new(processor: PairProcessor) -> Self {
        Self { processor }
    }
}

impl PairDispatcher for InlineDispatcher {
    fn dispatch(&self, task: PairTask, counter: Arc<CompletionCounter>) -> LinkingResult<()> {
        // The outcome is already on the counter.
        let _ = self.processor.process_counted(&task, &counter);
        Ok(())
    }
}

/// Handle for the pairs dispatched by one `run_block` call.
#[derive(Debug, Clone)]
pub struct BlockTicket {
    graph_id: GraphId,
    dispatched: u64,
    counter: Arc<CompletionCounter>,
}

impl BlockTicket {
    /// Graph the block belongs to.
    #[must_use]
    pub const fn graph_id(&self) -> GraphId {
        self.graph_id
    }

    /// Number of pairs dispatched.
    #[must_use]
    pub const fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Shared countdown for the block.
    #[must_use]
    pub fn counter(&self) -> &Arc<CompletionCounter> {
        &self.counter
    }

    /// Blocks until every pair is recorded or progress stalls.
    ///
    /// # Errors
    /// [`StallError`] after `poll.max_stalls` polls without progress.
    pub fn wait(&self, poll: &PollConfig, sleeper: &dyn Sleeper) -> Result<(), StallError> {
        await_completion(self.counter.as_ref(), poll, sleeper)
    }

    /// Like [`BlockTicket::wait`], abandoning the wait once `cancel` is set.
    ///
    /// # Errors
    /// `Stalled` or `Cancelled`.
    pub fn wait_or_cancel(
        &self,
        poll: &PollConfig,
        sleeper: &dyn Sleeper,
        cancel: &AtomicBool,
    ) -> Result<(), WaitError> {
        await_completion_or_cancel(self.counter.as_ref(), poll, sleeper, cancel)
    }
}

/// Number of unordered pairs, self-pairs included, among `n` entities.
///
/// Saturates at `u64::MAX`.
#[must_use]
pub const fn pair_count(n: u64) -> u64 {
    if n % 2 == 0 {
        (n / 2).saturating_mul(n + 1)
    } else {
        n.saturating_mul(n / 2 + 1)
    }
}

/// Every unordered pair among `entities`, self-pairs included, in a stable order.
///
/// Pairs are produced lazily; a block is never materialized as a pair list.
pub fn candidate_pairs(
    entities: &BTreeSet<EntityKeyId>,
) -> impl Iterator<Item = (EntityKeyId, EntityKeyId)> + '_ {
    entities
        .iter()
        .flat_map(move |&a| entities.range(a..).map(move |&b| (a, b)))
}

/// Fans blocks out into pair tasks.
pub struct BlockingStage {
    dispatcher: Arc<dyn PairDispatcher>,
}

impl fmt::Debug for BlockingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingStage").finish_non_exhaustive()
    }
}

impl BlockingStage {
    /// Creates a stage dispatching through `dispatcher`.
    pub fn new(dispatcher: Arc<dyn PairDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Dispatches every pair of the block and returns a ticket to wait on.
    ///
    /// Duplicate entities in `pairs` are collapsed. The ticket's counter is
    /// preset to the number of pairs before the first dispatch.
    ///
    /// # Errors
    /// - `MixedBlock` if an entry belongs to another graph
    /// - any hand-off error from the dispatcher; pairs dispatched before it
    ///   keep running. Re-running the block is safe until the graph is
    ///   drained, since recording a pair is idempotent. After a drain, pairs
    ///   touching merged-away entities fail with `VertexNotFound`
    pub fn run_block(
        &self,
        graph_id: GraphId,
        pairs: &[GraphEntityPair],
        context: &BlockContext,
    ) -> LinkingResult<BlockTicket> {
        if let Some(other) = pairs.iter().find(|p| p.graph_id != graph_id) {
            return Err(ValidationError::MixedBlock {
                graph_id: graph_id.to_string(),
                other: other.graph_id.to_string(),
            }
            .into());
        }

        let entities: BTreeSet<EntityKeyId> = pairs.iter().map(|p| p.entity_key).collect();
        let dispatched = pair_count(entities.len() as u64);
        let counter = Arc::new(CompletionCounter::new(dispatched));

        for (a, b) in candidate_pairs(&entities) {
            let task = PairTask {
                graph_id,
                a,
                b,
                context: context.clone(),
            };
            self.dispatcher.dispatch(task, Arc::clone(&counter))?;
        }

        debug!(
            %graph_id,
            entities = entities.len(),
            dispatched,
            remaining = counter.remaining(),
            "block dispatched"
        );

        Ok(BlockTicket {
            graph_id,
            dispatched,
            counter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::entity::{InMemoryEntitySource, LinkingEntity};
    use crate::error::LinkingError;
    use crate::ids::PropertyTypeId;
    use crate::progress::ThreadSleeper;
    use crate::scoring::{ExactMatchFeatures, ScoringError};
    use crate::storage::{GraphStore, InMemoryGraphStore};

    struct Fixture {
        store: Arc<InMemoryGraphStore>,
        entities: Arc<InMemoryEntitySource>,
        context: BlockContext,
        set: EntitySetId,
        sync: SyncId,
        name: PropertyTypeId,
    }

    fn fixture() -> Fixture {
        let set = EntitySetId::new();
        let sync = SyncId::new();
        let name = PropertyTypeId::new();
        Fixture {
            store: Arc::new(InMemoryGraphStore::new()),
            entities: Arc::new(InMemoryEntitySource::new()),
            context: BlockContext::new(HashMap::from([(set, sync)]), PropertyIndex::new([name])),
            set,
            sync,
            name,
        }
    }

    impl Fixture {
        fn entity(&self, name: &str) -> EntityKeyId {
            let key = EntityKeyId::random_in(self.set);
            self.entities
                .insert(key, self.sync, LinkingEntity::new().with_value(self.name, name))
                .unwrap();
            key
        }

        fn stage(&self, oracle: impl crate::scoring::ScoringOracle + 'static) -> BlockingStage {
            let weighter = Arc::new(EdgeWeighter::new(
                self.store.clone(),
                Arc::new(ExactMatchFeatures),
                Arc::new(oracle),
            ));
            let processor = PairProcessor::new(weighter, self.entities.clone());
            BlockingStage::new(Arc::new(InlineDispatcher::new(processor)))
        }
    }

    fn name_oracle(features: &[Vec<f64>]) -> Result<f64, ScoringError> {
        Ok(1.0 - features[0][0])
    }

    #[test]
    fn candidate_pairs_include_self_pairs() {
        let set = EntitySetId::new();
        let entities: BTreeSet<_> = (0..4).map(|_| EntityKeyId::random_in(set)).collect();
        let pairs: Vec<_> = candidate_pairs(&entities).collect();
        assert_eq!(pairs.len() as u64, pair_count(4));
        assert_eq!(pairs.iter().filter(|(a, b)| a == b).count(), 4);

        let unique: BTreeSet<_> = pairs.iter().map(|(a, b)| (a.min(b), a.max(b))).collect();
        assert_eq!(unique.len(), pairs.len());
    }

    #[test]
    fn pair_count_matches_enumeration_and_saturates() {
        let set = EntitySetId::new();
        for n in 0..12u64 {
            let entities: BTreeSet<_> = (0..n).map(|_| EntityKeyId::random_in(set)).collect();
            assert_eq!(candidate_pairs(&entities).count() as u64, pair_count(n));
        }
        assert_eq!(pair_count(0), 0);
        assert_eq!(pair_count(1), 1);
        assert_eq!(pair_count(u64::from(u32::MAX)), 9_223_372_034_707_292_160);
        assert_eq!(pair_count(u64::MAX), u64::MAX);
        assert_eq!(pair_count(u64::MAX - 1), u64::MAX);
    }

    #[test]
    fn candidate_pairs_are_produced_lazily() {
        let set = EntitySetId::new();
        let entities: BTreeSet<_> = (0..2_000).map(|_| EntityKeyId::random_in(set)).collect();
        let first = *entities.iter().next().unwrap();
        let last = *entities.iter().next_back().unwrap();

        let mut pairs = candidate_pairs(&entities);
        assert_eq!(pairs.next(), Some((first, first)));
        assert_eq!(candidate_pairs(&entities).last(), Some((last, last)));
    }

    #[test]
    fn lone_entity_becomes_a_vertex() {
        let fx = fixture();
        let stage = fx.stage(name_oracle);
        let g = GraphId::new();
        let e = fx.entity("solo");

        let ticket = stage
            .run_block(g, &[GraphEntityPair::new(g, e)], &fx.context)
            .unwrap();
        assert_eq!(ticket.dispatched(), 1);
        ticket.wait(&PollConfig::default(), &ThreadSleeper).unwrap();

        assert_eq!(fx.store.vertices(g).unwrap().len(), 1);
        assert!(fx.store.edges(g).unwrap().is_empty());
    }

    #[test]
    fn block_records_vertices_and_edges() {
        let fx = fixture();
        let stage = fx.stage(name_oracle);
        let g = GraphId::new();
        let keys = [fx.entity("ann"), fx.entity("ann"), fx.entity("bob")];
        let block: Vec<_> = keys.iter().map(|k| GraphEntityPair::new(g, *k)).collect();

        let ticket = stage.run_block(g, &block, &fx.context).unwrap();
        assert_eq!(ticket.dispatched(), 6);
        assert!(ticket.counter().is_complete());

        assert_eq!(fx.store.vertices(g).unwrap().len(), 3);
        let edges = fx.store.edges(g).unwrap();
        assert_eq!(edges.len(), 3);
        // ann/ann: 0.0 + 0.4 bias; the two ann/bob pairs: 1.0 + 0.4.
        assert!((edges[0].weight - 0.4).abs() < 1e-12);
        assert!((edges[2].weight - 1.4).abs() < 1e-12);
    }

    #[test]
    fn mixed_block_is_rejected() {
        let fx = fixture();
        let stage = fx.stage(name_oracle);
        let g = GraphId::new();
        let block = [
            GraphEntityPair::new(g, fx.entity("a")),
            GraphEntityPair::new(GraphId::new(), fx.entity("b")),
        ];
        let err = stage.run_block(g, &block, &fx.context).unwrap_err();
        assert!(matches!(
            err,
            LinkingError::Validation(ValidationError::MixedBlock { .. })
        ));
    }

    #[test]
    fn scoring_failure_leaves_counter_undecremented() {
        let fx = fixture();
        let failing = |_: &[Vec<f64>]| -> Result<f64, ScoringError> {
            Err(ScoringError::Unavailable("model offline".to_string()))
        };
        let stage = fx.stage(failing);
        let g = GraphId::new();
        let block = [
            GraphEntityPair::new(g, fx.entity("a")),
            GraphEntityPair::new(g, fx.entity("b")),
        ];

        let ticket = stage.run_block(g, &block, &fx.context).unwrap();
        let counter = ticket.counter();
        // Two self-pairs succeed, the cross pair fails.
        assert_eq!(counter.remaining(), 1);
        assert_eq!(counter.failed(), 1);
        assert!(counter.last_failure().unwrap().contains("model offline"));

        let poll = PollConfig {
            interval: std::time::Duration::from_millis(1),
            max_stalls: 2,
        };
        let err = ticket.wait(&poll, &ThreadSleeper).unwrap_err();
        assert_eq!(err.failed, 1);
        assert_eq!(err.remaining, 1);
    }

    #[test]
    fn missing_entity_is_a_failed_pair() {
        let fx = fixture();
        let stage = fx.stage(name_oracle);
        let g = GraphId::new();
        let ghost = EntityKeyId::random_in(fx.set);

        let ticket = stage
            .run_block(g, &[GraphEntityPair::new(g, ghost)], &fx.context)
            .unwrap();
        assert_eq!(ticket.counter().failed(), 1);
        assert_eq!(ticket.counter().remaining(), 1);
    }
}
