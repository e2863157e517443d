// 🔀 Merge Coordinator - fold a duplicate group into one keeper
//
// Validating → MigratingChildren → MigratingAliases → MigratingTags
//            → AggregatingStats → Tombstoning → Done
//
// Failed is reachable from every step. Only Validating, MigratingChildren,
// AggregatingStats and Tombstoning can fail the merge; alias and tag
// migration are best-effort and mark the result degraded instead.
//
// Every step is idempotent, so a merge that failed part-way can be re-run
// with the same arguments. Tombstoning is the point of no return.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::deduplication::DuplicateGroup;
use crate::entities::{LocationNode, LocationStatus};
use crate::error::{ReconciliationError, ReconciliationResult, StoreError, ValidationError};
use crate::stats::{MergedStats, StatsAggregator};
use crate::store::{AliasStore, LocationStore, TagStore};

// ============================================================================
// STATE MACHINE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MergeStep {
    Validating,
    MigratingChildren,
    MigratingAliases,
    MigratingTags,
    AggregatingStats,
    Tombstoning,
    Done,
    Failed,
}

impl fmt::Display for MergeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepOutcome {
    Ok { affected: usize },
    Skipped(String),
    Failed(String),
}

impl StepOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }

    pub fn affected(&self) -> usize {
        match self {
            StepOutcome::Ok { affected } => *affected,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: MergeStep,
    pub outcome: StepOutcome,
}

// ============================================================================
// MERGE RESULT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeResult {
    pub keeper_id: String,
    pub migrated_children: usize,
    pub migrated_aliases: usize,
    pub migrated_tags: usize,
    pub tombstoned: Vec<String>,

    /// Keeper statistics after the merge
    pub usage_count: u64,
    pub popularity_score: u8,

    /// Consistent, but some secondary metadata (aliases/tags) did not move
    pub degraded: bool,

    /// Nothing was left to merge
    pub no_op: bool,

    pub steps: Vec<StepRecord>,
}

impl MergeResult {
    pub fn noop(keeper: &LocationNode) -> Self {
        MergeResult {
            keeper_id: keeper.id.clone(),
            migrated_children: 0,
            migrated_aliases: 0,
            migrated_tags: 0,
            tombstoned: Vec::new(),
            usage_count: keeper.usage_count,
            popularity_score: keeper.popularity_score,
            degraded: false,
            no_op: true,
            steps: vec![StepRecord {
                step: MergeStep::Validating,
                outcome: StepOutcome::Skipped("no other active members".to_string()),
            }],
        }
    }

    pub fn outcome_of(&self, step: MergeStep) -> Option<&StepOutcome> {
        self.steps.iter().find(|r| r.step == step).map(|r| &r.outcome)
    }

    pub fn summary(&self) -> String {
        if self.no_op {
            return format!("Keeper {}: nothing to merge", self.keeper_id);
        }
        format!(
            "Keeper {}: {} tombstoned, {} children, {} aliases, {} tags migrated, usage {}, popularity {}{}",
            self.keeper_id,
            self.tombstoned.len(),
            self.migrated_children,
            self.migrated_aliases,
            self.migrated_tags,
            self.usage_count,
            self.popularity_score,
            if self.degraded { " (degraded)" } else { "" }
        )
    }
}

// ============================================================================
// MERGE COORDINATOR
// ============================================================================

/// Validated view of the group, re-read from the store
struct MergePlan {
    keeper: LocationNode,
    loser_ids: Vec<String>,
    /// Losers whose stats were not folded into the keeper yet
    unfolded: Vec<LocationNode>,
}

pub struct MergeCoordinator<'a> {
    locations: &'a dyn LocationStore,
    aliases: Option<&'a dyn AliasStore>,
    tags: Option<&'a dyn TagStore>,
    stats: StatsAggregator,
    timeout: Option<Duration>,
}

impl<'a> MergeCoordinator<'a> {
    pub fn new(locations: &'a dyn LocationStore) -> Self {
        MergeCoordinator {
            locations,
            aliases: None,
            tags: None,
            stats: StatsAggregator::new(),
            timeout: None,
        }
    }

    pub fn with_aliases(mut self, aliases: Option<&'a dyn AliasStore>) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn with_tags(mut self, tags: Option<&'a dyn TagStore>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_stats(mut self, stats: StatsAggregator) -> Self {
        self.stats = stats;
        self
    }

    /// Deadline for the whole sequence up to (and including the start of) Tombstoning
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn merge(
        &self,
        group: &DuplicateGroup,
        keeper_id: &str,
    ) -> ReconciliationResult<MergeResult> {
        let started = Instant::now();

        if group.members.is_empty() {
            return Err(ValidationError::EmptyGroup.into());
        }
        if !group.contains(keeper_id) {
            return Err(ValidationError::KeeperNotInGroup {
                keeper_id: keeper_id.to_string(),
            }
            .into());
        }

        // ====================================================================
        // 1. Validating
        // ====================================================================
        self.check_deadline(started, MergeStep::Validating, false)?;
        let plan = match self.validate(group, keeper_id)? {
            Some(plan) => plan,
            None => {
                let keeper = self.fetch_keeper(keeper_id)?;
                info!(keeper_id, key = %group.key, "merge is a no-op, no other active members");
                return Ok(MergeResult::noop(&keeper));
            }
        };

        info!(
            keeper_id,
            key = %group.key,
            losers = plan.loser_ids.len(),
            "merging duplicate group"
        );

        let mut steps = vec![StepRecord {
            step: MergeStep::Validating,
            outcome: StepOutcome::Ok {
                affected: plan.loser_ids.len() + 1,
            },
        }];

        // ====================================================================
        // 2. MigratingChildren (must precede Tombstoning)
        // ====================================================================
        self.check_deadline(started, MergeStep::MigratingChildren, false)?;
        let children = self.migrate_children(&plan)?;
        steps.push(StepRecord {
            step: MergeStep::MigratingChildren,
            outcome: StepOutcome::Ok { affected: children },
        });

        // ====================================================================
        // 3. MigratingAliases (best-effort)
        // ====================================================================
        self.check_deadline(started, MergeStep::MigratingAliases, true)?;
        let aliases = self.migrate_aliases(&plan);
        steps.push(StepRecord {
            step: MergeStep::MigratingAliases,
            outcome: aliases,
        });

        // ====================================================================
        // 4. MigratingTags (best-effort, but never silent)
        // ====================================================================
        self.check_deadline(started, MergeStep::MigratingTags, true)?;
        let tags = self.migrate_tags(&plan);
        steps.push(StepRecord {
            step: MergeStep::MigratingTags,
            outcome: tags,
        });

        // ====================================================================
        // 5. AggregatingStats
        // ====================================================================
        self.check_deadline(started, MergeStep::AggregatingStats, true)?;
        let (merged, stats_outcome) = self.aggregate_stats(&plan)?;
        steps.push(StepRecord {
            step: MergeStep::AggregatingStats,
            outcome: stats_outcome,
        });

        // ====================================================================
        // 6. Tombstoning (sole hard-fail gate, point of no return)
        // ====================================================================
        self.check_deadline(started, MergeStep::Tombstoning, true)?;
        let tombstoned = self
            .locations
            .bulk_update_status(&plan.loser_ids, LocationStatus::Inactive)
            .map_err(|source| {
                warn!(keeper_id, error = %source, "tombstoning failed, merge can be retried");
                ReconciliationError::Persistence {
                    step: MergeStep::Tombstoning,
                    partially_applied: true,
                    source,
                }
            })?;
        if tombstoned != plan.loser_ids.len() {
            // Another request tombstoned some of them first; ours are still folded
            warn!(
                keeper_id,
                expected = plan.loser_ids.len(),
                tombstoned,
                "some losers were already tombstoned"
            );
        }
        steps.push(StepRecord {
            step: MergeStep::Tombstoning,
            outcome: StepOutcome::Ok {
                affected: tombstoned,
            },
        });

        // ====================================================================
        // 7. Done
        // ====================================================================
        let degraded = steps.iter().any(|r| r.outcome.is_failed());
        let result = MergeResult {
            keeper_id: keeper_id.to_string(),
            migrated_children: children,
            migrated_aliases: steps
                .iter()
                .find(|r| r.step == MergeStep::MigratingAliases)
                .map_or(0, |r| r.outcome.affected()),
            migrated_tags: steps
                .iter()
                .find(|r| r.step == MergeStep::MigratingTags)
                .map_or(0, |r| r.outcome.affected()),
            tombstoned: plan.loser_ids.clone(),
            usage_count: merged.usage_count,
            popularity_score: merged.popularity_score,
            degraded,
            no_op: false,
            steps,
        };

        info!(
            keeper_id,
            degraded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "{}",
            result.summary()
        );

        Ok(result)
    }

    fn check_deadline(
        &self,
        started: Instant,
        step: MergeStep,
        partially_applied: bool,
    ) -> ReconciliationResult<()> {
        match self.timeout {
            Some(timeout) if started.elapsed() > timeout => {
                warn!(%step, ?timeout, "merge deadline exceeded");
                Err(ReconciliationError::Timeout {
                    step,
                    timeout,
                    partially_applied,
                })
            }
            _ => Ok(()),
        }
    }

    fn fetch_keeper(&self, keeper_id: &str) -> ReconciliationResult<LocationNode> {
        self.locations
            .get_by_ids(&[keeper_id.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| ValidationError::UnknownLocation(keeper_id.to_string()).into())
    }

    /// Re-read every member from the store. `Ok(None)` means the keeper is the
    /// only Active member left, i.e. the merge already happened.
    fn validate(
        &self,
        group: &DuplicateGroup,
        keeper_id: &str,
    ) -> ReconciliationResult<Option<MergePlan>> {
        let mut ids = group.member_ids();
        ids.sort();
        ids.dedup();

        let fresh = self.locations.get_by_ids(&ids)?;
        if let Some(missing) = ids.iter().find(|id| !fresh.iter().any(|n| &n.id == *id)) {
            return Err(ValidationError::UnknownLocation(missing.clone()).into());
        }

        let keeper = fresh
            .iter()
            .find(|n| n.id == keeper_id)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownLocation(keeper_id.to_string()))?;

        if !keeper.is_active() {
            return Err(ReconciliationError::ConcurrentModification {
                id: keeper_id.to_string(),
                reason: format!("keeper is {}", keeper.status),
                partially_applied: false,
            });
        }
        if let Some(other) = &keeper.merged_into {
            return Err(ReconciliationError::ConcurrentModification {
                id: keeper_id.to_string(),
                reason: format!("keeper was already folded into {}", other),
                partially_applied: false,
            });
        }

        let (active_losers, gone): (Vec<LocationNode>, Vec<LocationNode>) = fresh
            .into_iter()
            .filter(|n| n.id != keeper_id)
            .partition(|n| n.is_active());

        if active_losers.is_empty() {
            return Ok(None);
        }

        if let Some(changed) = gone.first() {
            return Err(ReconciliationError::ConcurrentModification {
                id: changed.id.clone(),
                reason: format!("member is {} while others are still active", changed.status),
                partially_applied: false,
            });
        }

        for loser in &active_losers {
            if let Some(other) = loser.merged_into.as_deref().filter(|k| *k != keeper_id) {
                return Err(ReconciliationError::ConcurrentModification {
                    id: loser.id.clone(),
                    reason: format!("already folded into {}", other),
                    partially_applied: false,
                });
            }
        }

        let loser_ids = active_losers.iter().map(|n| n.id.clone()).collect();
        let unfolded = active_losers
            .into_iter()
            .filter(|n| n.merged_into.is_none())
            .collect();

        Ok(Some(MergePlan {
            keeper,
            loser_ids,
            unfolded,
        }))
    }

    fn migrate_children(&self, plan: &MergePlan) -> ReconciliationResult<usize> {
        let persistence = |source: StoreError| {
            warn!(keeper_id = %plan.keeper.id, error = %source, "child migration failed");
            ReconciliationError::Persistence {
                step: MergeStep::MigratingChildren,
                partially_applied: false,
                source,
            }
        };

        let children = self
            .locations
            .find_by_parents(&plan.loser_ids)
            .map_err(persistence)?;
        let child_ids: Vec<String> = children.into_iter().map(|c| c.id).collect();

        let moved = self
            .locations
            .reparent(&child_ids, &plan.keeper.id)
            .map_err(persistence)?;

        debug!(keeper_id = %plan.keeper.id, moved, "children re-parented");
        Ok(moved)
    }

    fn migrate_aliases(&self, plan: &MergePlan) -> StepOutcome {
        let Some(aliases) = self.aliases else {
            return StepOutcome::Skipped("alias store not configured".to_string());
        };

        let mut moved = 0;
        for loser_id in &plan.loser_ids {
            match aliases.reassign_location(loser_id, &plan.keeper.id) {
                Ok(count) => moved += count,
                Err(e) => {
                    warn!(loser_id = %loser_id, error = %e, "alias migration failed, continuing");
                    return StepOutcome::Failed(format!("aliases of {}: {}", loser_id, e));
                }
            }
        }

        debug!(keeper_id = %plan.keeper.id, moved, "aliases migrated");
        StepOutcome::Ok { affected: moved }
    }

    fn migrate_tags(&self, plan: &MergePlan) -> StepOutcome {
        let Some(tags) = self.tags else {
            return StepOutcome::Skipped("tag store not configured".to_string());
        };

        let mut migrated = 0;
        for loser_id in &plan.loser_ids {
            match self.migrate_loser_tag(tags, loser_id, &plan.keeper.id) {
                Ok(true) => migrated += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(loser_id = %loser_id, error = %e, "tag migration failed, continuing");
                    return StepOutcome::Failed(format!("tag of {}: {}", loser_id, e));
                }
            }
        }

        debug!(keeper_id = %plan.keeper.id, migrated, "tags migrated");
        StepOutcome::Ok { affected: migrated }
    }

    /// One loser's tag. Returns whether anything moved.
    fn migrate_loser_tag(
        &self,
        tags: &dyn TagStore,
        loser_id: &str,
        keeper_id: &str,
    ) -> Result<bool, StoreError> {
        let Some(loser_tag) = tags.find_tag_by_location(loser_id)? else {
            return Ok(false);
        };

        // Looked up per loser: an earlier loser may have just handed its tag over
        match tags.find_tag_by_location(keeper_id)? {
            None => {
                tags.set_tag_location(&loser_tag.id, keeper_id)?;
            }
            Some(keeper_tag) => {
                let usages = tags.reassign_tag_usages(&loser_tag.id, &keeper_tag.id)?;
                tags.retire_tag(&loser_tag.id)?;
                debug!(
                    from = %loser_tag.id,
                    to = %keeper_tag.id,
                    usages,
                    "tag usages merged, loser tag retired"
                );
            }
        }

        Ok(true)
    }

    fn aggregate_stats(
        &self,
        plan: &MergePlan,
    ) -> ReconciliationResult<(MergedStats, StepOutcome)> {
        if plan.unfolded.is_empty() {
            let current = MergedStats {
                usage_count: plan.keeper.usage_count,
                popularity_score: plan.keeper.popularity_score,
            };
            return Ok((
                current,
                StepOutcome::Skipped("statistics already folded into keeper".to_string()),
            ));
        }

        let merged = self
            .stats
            .aggregate(std::iter::once(&plan.keeper).chain(plan.unfolded.iter()));
        let folded_ids: Vec<String> = plan.unfolded.iter().map(|n| n.id.clone()).collect();

        self.locations
            .apply_merge_stats(
                &plan.keeper.id,
                merged.usage_count,
                merged.popularity_score,
                &folded_ids,
            )
            .map_err(|source| match source {
                StoreError::Conflict(reason) => ReconciliationError::ConcurrentModification {
                    id: plan.keeper.id.clone(),
                    reason,
                    partially_applied: true,
                },
                source => ReconciliationError::Persistence {
                    step: MergeStep::AggregatingStats,
                    partially_applied: true,
                    source,
                },
            })?;

        Ok((
            merged,
            StepOutcome::Ok {
                affected: folded_ids.len(),
            },
        ))
    }
}

// ============================================================================
// TESTS
// ============================================================================
