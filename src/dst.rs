//! Deterministic Simulation Testing for stream fan-out
//!
//! VOPR-style harness driving the coordinator and the reader with seeded
//! random lifecycle events over a small social world:
//! - Deterministic operation generation from a ChaCha8 seed
//! - Index invariants checked after every operation
//! - Deleted activities must leave no reference behind
//!
//! ## Usage
//!
//! ```rust,ignore
//! for seed in 0..100 {
//!     let mut harness = FanoutDSTHarness::with_seed(seed);
//!     harness.run(500);
//!     assert!(harness.result().is_success(), "Seed {} failed", seed);
//! }
//! ```

use crate::config::StreamConfig;
use crate::fanout::{FanoutCoordinator, StreamContext};
use crate::index::{IndexStats, StreamIndexManager};
use crate::model::{Activity, ActivityId, Identity, IdentityKind, StreamType};
use crate::reader::PaginatedReader;
use crate::store::InMemoryBackend;
use ahash::AHashSet;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;

const HOUR_MS: i64 = 3600 * 1000;
/// 2023-11-14T22:13:20Z
const START_MS: i64 = 1_700_000_000_000;

/// Configuration for fan-out DST
#[derive(Debug, Clone)]
pub struct FanoutDSTConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    pub num_persons: usize,
    pub num_spaces: usize,
    /// Probability a new post goes to one of the poster's spaces
    pub space_post_prob: f64,
    /// Probability of a relationship change per operation
    pub relationship_prob: f64,
    /// Probability an activity body disappears without a delete event
    pub orphan_prob: f64,
    /// Max hours the clock advances per operation
    pub max_step_hours: i64,
    pub stream: StreamConfig,
}

impl Default for FanoutDSTConfig {
    fn default() -> Self {
        FanoutDSTConfig {
            seed: 0,
            num_persons: 12,
            num_spaces: 3,
            space_post_prob: 0.3,
            relationship_prob: 0.1,
            orphan_prob: 0.02,
            max_step_hours: 6,
            stream: StreamConfig::test(),
        }
    }
}

impl FanoutDSTConfig {
    /// Standard configuration with given seed
    pub fn new(seed: u64) -> Self {
        FanoutDSTConfig {
            seed,
            ..Default::default()
        }
    }

    /// Few identities, tight threshold and frequent graph churn
    pub fn crowded(seed: u64) -> Self {
        let mut stream = StreamConfig::test();
        stream.connections_threshold = 3;
        stream.page_size = 2;
        stream.batch.size = 2;
        FanoutDSTConfig {
            seed,
            num_persons: 6,
            num_spaces: 2,
            space_post_prob: 0.5,
            relationship_prob: 0.3,
            orphan_prob: 0.05,
            max_step_hours: 12,
            stream,
        }
    }

    /// Many identities, slow clock (most edits stay in the same day)
    pub fn sprawling(seed: u64) -> Self {
        FanoutDSTConfig {
            seed,
            num_persons: 40,
            num_spaces: 6,
            space_post_prob: 0.2,
            relationship_prob: 0.05,
            orphan_prob: 0.01,
            max_step_hours: 1,
            stream: StreamConfig::test(),
        }
    }
}

/// Operation type for logging
#[derive(Debug, Clone)]
pub enum FanoutOp {
    Post { activity: ActivityId, owner: String },
    Update { activity: ActivityId },
    Delete { activity: ActivityId },
    Like { activity: ActivityId, identity: String },
    Unlike { activity: ActivityId, identity: String },
    Comment {
        activity: ActivityId,
        identity: String,
        /// Whether an update event preceded the comment event
        with_update: bool,
    },
    DeleteComment { activity: ActivityId, identity: String },
    Visibility { activity: ActivityId, hidden: bool },
    Connect { a: String, b: String },
    Disconnect { a: String, b: String },
    Join { member: String, space: String },
    Leave { member: String, space: String },
    Orphan { activity: ActivityId },
    Read { owner: String, stream: StreamType },
}

/// Result of a fan-out DST run
#[derive(Debug, Clone)]
pub struct FanoutDSTResult {
    pub seed: u64,
    pub total_operations: u64,
    pub posts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub likes: u64,
    pub comments: u64,
    pub visibility_changes: u64,
    pub relationship_changes: u64,
    pub membership_changes: u64,
    pub orphans: u64,
    pub reads: u64,
    /// Invariant violations found (with operation context)
    pub invariant_violations: Vec<String>,
    /// Last operation before failure (if any)
    pub last_op: Option<FanoutOp>,
}

impl FanoutDSTResult {
    pub fn new(seed: u64) -> Self {
        FanoutDSTResult {
            seed,
            total_operations: 0,
            posts: 0,
            updates: 0,
            deletes: 0,
            likes: 0,
            comments: 0,
            visibility_changes: 0,
            relationship_changes: 0,
            membership_changes: 0,
            orphans: 0,
            reads: 0,
            invariant_violations: Vec::new(),
            last_op: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} ops ({} posts, {} updates, {} deletes, {} likes, {} comments, {} reads), {} violations",
            self.seed,
            self.total_operations,
            self.posts,
            self.updates,
            self.deletes,
            self.likes,
            self.comments,
            self.reads,
            self.invariant_violations.len()
        )
    }
}

/// DST harness for the fan-out engine
pub struct FanoutDSTHarness {
    config: FanoutDSTConfig,
    rng: ChaCha8Rng,
    backend: Arc<InMemoryBackend>,
    manager: Arc<StreamIndexManager>,
    coordinator: FanoutCoordinator<InMemoryBackend>,
    reader: PaginatedReader<InMemoryBackend>,
    persons: Vec<Identity>,
    spaces: Vec<Identity>,
    live: Vec<ActivityId>,
    deleted: Vec<ActivityId>,
    clock: i64,
    next_activity: u64,
    result: FanoutDSTResult,
}

impl FanoutDSTHarness {
    pub fn new(config: FanoutDSTConfig) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(config.seed);
        let backend = Arc::new(InMemoryBackend::new());
        let manager = Arc::new(StreamIndexManager::new());
        let coordinator =
            FanoutCoordinator::new(manager.clone(), backend.clone(), config.stream.clone());
        let reader = PaginatedReader::new(manager.clone(), backend.clone());
        let persons = (0..config.num_persons)
            .map(|i| backend.add_person(&format!("p{}", i), &format!("user{}", i)))
            .collect();
        let spaces = (0..config.num_spaces)
            .map(|i| backend.add_space(&format!("s{}", i), &format!("space{}", i)))
            .collect();
        backend.set_now(START_MS);
        FanoutDSTHarness {
            result: FanoutDSTResult::new(config.seed),
            config,
            rng,
            backend,
            manager,
            coordinator,
            reader,
            persons,
            spaces,
            live: Vec::new(),
            deleted: Vec::new(),
            clock: START_MS,
            next_activity: 0,
        }
    }

    /// Create with just a seed (uses default config)
    pub fn with_seed(seed: u64) -> Self {
        Self::new(FanoutDSTConfig::new(seed))
    }

    fn random_person(&mut self) -> Identity {
        let idx = self.rng.gen_range(0..self.persons.len());
        self.persons[idx].clone()
    }

    fn random_space(&mut self) -> Option<Identity> {
        if self.spaces.is_empty() {
            return None;
        }
        let idx = self.rng.gen_range(0..self.spaces.len());
        Some(self.spaces[idx].clone())
    }

    fn random_live(&mut self) -> Option<Activity> {
        if self.live.is_empty() {
            return None;
        }
        let idx = self.rng.gen_range(0..self.live.len());
        let id = self.live[idx].clone();
        self.backend.activity(&id)
    }

    fn tick(&mut self) {
        let step = self.rng.gen_range(0..=self.config.max_step_hours) * HOUR_MS;
        self.clock += step + self.rng.gen_range(0..1000);
        self.backend.set_now(self.clock);
    }

    fn is_member(&self, space: &Identity, person: &Identity) -> bool {
        self.backend
            .space_members(&space.remote_id)
            .iter()
            .any(|m| m == &person.remote_id)
    }

    fn post(&mut self) {
        let poster = self.random_person();
        let owner = match self.random_space() {
            Some(space)
                if self.rng.gen_bool(self.config.space_post_prob) && self.is_member(&space, &poster) =>
            {
                space
            }
            _ => poster.clone(),
        };
        let mentioned: Vec<Identity> = (0..self.rng.gen_range(0..3))
            .map(|_| self.random_person())
            .collect();
        let id = ActivityId::new(format!("act{}", self.next_activity));
        self.next_activity += 1;

        let activity = Activity {
            id: id.clone(),
            owner: owner.id.clone(),
            owner_kind: owner.kind,
            stream_owner: owner.remote_id.clone(),
            poster: poster.id.clone(),
            hidden: self.rng.gen_bool(0.1),
            posted_at: self.clock,
            last_updated: None,
            mentioned_ids: mentioned.iter().map(|m| format!("{}@1", m.id)).collect(),
            commenter_ids: Vec::new(),
        };
        self.backend.put_activity(activity.clone());
        self.result.last_op = Some(FanoutOp::Post {
            activity: id.clone(),
            owner: owner.remote_id.clone(),
        });

        let mut ctx = StreamContext::new(owner, activity)
            .with_mentioners(mentioned.into_iter().map(|m| m.id).collect());
        self.coordinator.on_create_poster(&mut ctx);
        self.coordinator.on_create(&mut ctx);
        self.live.push(id);
        self.result.posts += 1;
    }

    /// Bump an activity's timestamp and move its references.
    /// Bump `last_updated` in the backend only.
    fn bump(&mut self, mut activity: Activity) -> (Activity, i64) {
        let old = activity.effective_timestamp();
        activity.last_updated = Some(self.clock.max(old));
        self.backend.put_activity(activity.clone());
        (activity, old)
    }

    fn touch(&mut self, activity: Activity) -> (Activity, i64) {
        let (activity, old) = self.bump(activity);
        let owner = self.owner_of(&activity);
        let mut ctx = StreamContext::new(owner, activity.clone()).with_old_last_updated(old);
        self.coordinator.on_update(&mut ctx);
        (activity, old)
    }

    fn owner_of(&self, activity: &Activity) -> Identity {
        let pool = match activity.owner_kind {
            IdentityKind::Person => &self.persons,
            IdentityKind::Space => &self.spaces,
        };
        pool.iter()
            .find(|i| i.id == activity.owner)
            .cloned()
            .unwrap_or_else(|| Identity::person(activity.owner.as_str(), activity.stream_owner.as_str()))
    }

    fn update(&mut self) {
        let Some(activity) = self.random_live() else {
            return self.post();
        };
        self.result.last_op = Some(FanoutOp::Update {
            activity: activity.id.clone(),
        });
        let (mut activity, _) = self.touch(activity);
        if self.rng.gen_bool(0.3) {
            let mentioned = self.random_person();
            activity.mentioned_ids.push(mentioned.id.to_string());
            self.backend.put_activity(activity.clone());
            let owner = self.owner_of(&activity);
            let mut ctx =
                StreamContext::new(owner, activity).with_mentioners(vec![mentioned.id.clone()]);
            self.coordinator.on_mentioners_added(&mut ctx);
        }
        self.result.updates += 1;
    }

    fn delete(&mut self) {
        if self.live.is_empty() {
            return;
        }
        let idx = self.rng.gen_range(0..self.live.len());
        let id = self.live.swap_remove(idx);
        self.result.last_op = Some(FanoutOp::Delete {
            activity: id.clone(),
        });
        self.backend.remove_activity(&id);
        self.coordinator.on_delete(&id);
        self.deleted.push(id);
        self.result.deletes += 1;
    }

    fn orphan(&mut self) {
        if self.live.is_empty() {
            return;
        }
        let idx = self.rng.gen_range(0..self.live.len());
        let id = self.live.swap_remove(idx);
        self.result.last_op = Some(FanoutOp::Orphan {
            activity: id.clone(),
        });
        self.backend.remove_activity(&id);
        self.result.orphans += 1;
    }

    fn like_or_unlike(&mut self) {
        let Some(activity) = self.random_live() else {
            return;
        };
        let identity = self.random_person();
        // posters keep their own MyActivities reference
        if self.rng.gen_bool(0.7) || identity.id == activity.poster {
            self.result.last_op = Some(FanoutOp::Like {
                activity: activity.id.clone(),
                identity: identity.remote_id.clone(),
            });
            self.coordinator.on_like(&identity, &activity);
        } else {
            self.result.last_op = Some(FanoutOp::Unlike {
                activity: activity.id.clone(),
                identity: identity.remote_id.clone(),
            });
            self.coordinator.on_unlike(&identity, &activity);
        }
        self.result.likes += 1;
    }

    fn comment(&mut self) {
        let Some(mut activity) = self.random_live() else {
            return;
        };
        let commenter = self.random_person();
        if !activity.is_commenter(&commenter.id) {
            activity.commenter_ids.push(commenter.id.clone());
        }
        self.backend.put_activity(activity.clone());
        // half the comments arrive without an update event ahead of them
        let with_update = self.rng.gen_bool(0.5);
        self.result.last_op = Some(FanoutOp::Comment {
            activity: activity.id.clone(),
            identity: commenter.remote_id.clone(),
            with_update,
        });
        let (activity, old) = if with_update {
            self.touch(activity)
        } else {
            self.bump(activity)
        };
        let mut ctx = StreamContext::new(commenter, activity).with_old_last_updated(old);
        self.coordinator.on_comment_update(&mut ctx);
        self.result.comments += 1;
    }

    fn delete_comment(&mut self) {
        let Some(mut activity) = self.random_live() else {
            return;
        };
        let Some(commenter) = activity.commenter_ids.pop() else {
            return;
        };
        self.backend.put_activity(activity.clone());
        self.result.last_op = Some(FanoutOp::DeleteComment {
            activity: activity.id.clone(),
            identity: commenter.to_string(),
        });
        let owner = self.owner_of(&activity);
        let mut ctx = StreamContext::new(owner, activity).with_commenters(vec![commenter]);
        self.coordinator.on_comment_delete(&mut ctx);
        self.result.comments += 1;
    }

    fn toggle_visibility(&mut self) {
        let Some(mut activity) = self.random_live() else {
            return;
        };
        activity.hidden = !activity.hidden;
        self.backend.put_activity(activity.clone());
        self.result.last_op = Some(FanoutOp::Visibility {
            activity: activity.id.clone(),
            hidden: activity.hidden,
        });
        let owner = self.owner_of(&activity);
        let mut ctx = StreamContext::new(owner, activity);
        self.coordinator.on_visibility_change(&mut ctx);
        self.result.visibility_changes += 1;
    }

    fn change_relationship(&mut self) {
        let a = self.random_person();
        let b = self.random_person();
        if a.id == b.id {
            return;
        }
        if self.rng.gen_bool(0.6) {
            self.result.last_op = Some(FanoutOp::Connect {
                a: a.remote_id.clone(),
                b: b.remote_id.clone(),
            });
            self.backend.connect(&a.id, &b.id);
            self.coordinator.on_connect(&a, &b);
        } else {
            self.result.last_op = Some(FanoutOp::Disconnect {
                a: a.remote_id.clone(),
                b: b.remote_id.clone(),
            });
            self.backend.disconnect(&a.id, &b.id);
            self.coordinator.on_disconnect(&a, &b);
        }
        if self.rng.gen_bool(0.5) {
            self.backend.record_login(&a.remote_id, self.clock);
        }
        self.result.relationship_changes += 1;
    }

    fn change_membership(&mut self) {
        let Some(space) = self.random_space() else {
            return;
        };
        let member = self.random_person();
        let mut ctx = StreamContext::membership(member.clone(), space.clone());
        if self.is_member(&space, &member) {
            self.result.last_op = Some(FanoutOp::Leave {
                member: member.remote_id.clone(),
                space: space.remote_id.clone(),
            });
            self.backend.remove_space_member(&space.remote_id, &member.remote_id);
            self.coordinator.on_space_member_removed(&mut ctx);
        } else {
            self.result.last_op = Some(FanoutOp::Join {
                member: member.remote_id.clone(),
                space: space.remote_id.clone(),
            });
            self.backend.add_space_member(&space.remote_id, &member.remote_id);
            self.coordinator.on_space_member_added(&mut ctx);
        }
        self.result.membership_changes += 1;
    }

    /// Read a page and check what comes back.
    fn read(&mut self) -> Result<(), String> {
        let owner = self.random_person();
        let stream = StreamType::ALL[self.rng.gen_range(0..StreamType::ALL.len())];
        let offset = self.rng.gen_range(0..3);
        let limit = self.rng.gen_range(1..8);
        self.result.last_op = Some(FanoutOp::Read {
            owner: owner.remote_id.clone(),
            stream,
        });
        self.result.reads += 1;

        let page = self.reader.activities(&owner, stream, offset, limit);
        if page.len() > limit {
            return Err(format!("page of {} exceeds limit {}", page.len(), limit));
        }
        let mut ids = AHashSet::new();
        for activity in &page {
            if activity.hidden {
                return Err(format!("hidden activity {} returned", activity.id));
            }
            if !ids.insert(activity.id.clone()) {
                return Err(format!("activity {} returned twice", activity.id));
            }
        }
        if self.reader.number_of(&owner, stream) < 0 {
            return Err("negative count".to_string());
        }
        Ok(())
    }

    /// Run a single random operation
    fn run_single_op(&mut self) {
        self.tick();
        let roll: f64 = self.rng.gen();
        let mut read_outcome = Ok(());

        if roll < self.config.orphan_prob {
            self.orphan();
        } else if roll < self.config.orphan_prob + self.config.relationship_prob {
            if self.rng.gen_bool(0.5) {
                self.change_relationship();
            } else {
                self.change_membership();
            }
        } else {
            match self.rng.gen_range(0..100) {
                0..=24 => self.post(),
                25..=34 => self.update(),
                35..=41 => self.delete(),
                42..=53 => self.like_or_unlike(),
                54..=63 => self.comment(),
                64..=67 => self.delete_comment(),
                68..=73 => self.toggle_visibility(),
                _ => read_outcome = self.read(),
            }
        }

        self.result.total_operations += 1;

        // Verify invariants after each operation
        if let Err(violation) = read_outcome.and_then(|_| self.check_invariants()) {
            self.result.invariant_violations.push(format!(
                "Op #{}: {:?} - {}",
                self.result.total_operations, self.result.last_op, violation
            ));
        }
    }

    /// Check all invariants
    fn check_invariants(&self) -> Result<(), String> {
        // Invariant 1: bucket counts, per-index dedup, reverse map
        self.manager.check_invariants()?;

        // Invariant 2: deleted activities leave no reference behind
        let store = self.manager.read();
        for id in &self.deleted {
            let left = store.locations_of(id);
            if !left.is_empty() {
                return Err(format!(
                    "deleted activity {} still referenced {} times",
                    id,
                    left.len()
                ));
            }
        }

        // Invariant 3: every live activity sits in its poster's MyActivities
        for id in &self.live {
            let Some(activity) = self.backend.activity(id) else {
                continue;
            };
            if !store.has_reference(&activity.poster, StreamType::MyActivities, id, None) {
                return Err(format!(
                    "activity {} missing from poster {} MyActivities",
                    id, activity.poster
                ));
            }
        }
        Ok(())
    }

    /// Run specified number of operations
    pub fn run(&mut self, operations: usize) {
        for _ in 0..operations {
            self.run_single_op();

            // Stop early if we hit a violation
            if !self.result.invariant_violations.is_empty() {
                break;
            }
        }
    }

    /// Get the result
    pub fn result(&self) -> &FanoutDSTResult {
        &self.result
    }

    pub fn stats(&self) -> IndexStats {
        self.manager.stats()
    }

    pub fn backend(&self) -> &InMemoryBackend {
        &self.backend
    }
}

/// Run a batch of DST tests with different seeds
pub fn run_fanout_batch(
    start_seed: u64,
    num_seeds: usize,
    ops_per_seed: usize,
    config_fn: fn(u64) -> FanoutDSTConfig,
) -> Vec<FanoutDSTResult> {
    (0..num_seeds)
        .map(|i| {
            let seed = start_seed + i as u64;
            let config = config_fn(seed);
            let mut harness = FanoutDSTHarness::new(config);
            harness.run(ops_per_seed);
            harness.result().clone()
        })
        .collect()
}

/// Summarize batch results
pub fn summarize_batch(results: &[FanoutDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed = total - passed;
    let total_ops: u64 = results.iter().map(|r| r.total_operations).sum();

    let mut summary = format!(
        "Fan-out DST Summary\n\
         ===================\n\
         Seeds: {} total, {} passed, {} failed\n\
         Total operations: {}\n",
        total, passed, failed, total_ops
    );

    if failed > 0 {
        summary.push_str("\nFailed seeds:\n");
        for result in results.iter().filter(|r| !r.is_success()) {
            summary.push_str(&format!("  Seed {}: {}\n", result.seed, result.summary()));
            for violation in &result.invariant_violations {
                summary.push_str(&format!("    - {}\n", violation));
            }
        }
    }

    summary
}
