// ⚖️ Reconciliation Service - the operator-facing surface of the engine
//
// detect_duplicates / detect_orphans: read-only, never fail
// merge / merge_group:                fold a duplicate group into a keeper
// fix_orphan:                         hierarchy-checked parent assignment
// normalize_known_variant / apply_variant_rules: spelling rewrites
//
// No workflow state is kept between calls. Every successful mutation is
// appended to the audit log when one is configured (best-effort).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::ReconciliationConfig;
use crate::db::{Event, SqliteStore};
use crate::deduplication::{DuplicateDetector, DuplicateGroup, GroupKey};
use crate::entities::LocationNode;
use crate::error::{ReconciliationResult, ValidationError};
use crate::merge::{MergeCoordinator, MergeResult};
use crate::normalize::VariantRule;
use crate::orphans::{LinkageIssue, OrphanDetector, OrphanRepair};
use crate::store::{AliasStore, AuditLog, LocationStore, TagStore};

pub const DEFAULT_ACTOR: &str = "reconciliation-engine";

// ============================================================================
// RECONCILIATION REPORT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub groups: Vec<DuplicateGroup>,
    pub orphans: Vec<LocationNode>,
    pub linkage_issues: Vec<LinkageIssue>,
    pub group_count: usize,
    pub orphan_count: usize,

    /// Active nodes scanned
    pub total_node_count: usize,

    /// Nodes that sit in some duplicate group
    pub duplicate_node_count: usize,

    /// Set when the store could not be read; everything else is then empty
    pub read_error: Option<String>,

    pub generated_at: DateTime<Utc>,
}

impl ReconciliationReport {
    pub fn from_nodes(nodes: &[LocationNode]) -> Self {
        let groups = DuplicateDetector::new().detect(nodes);
        let orphan_detector = OrphanDetector::new();
        let orphans = orphan_detector.detect(nodes);
        let linkage_issues = orphan_detector.linkage_issues(nodes);

        let duplicate_node_count = groups.iter().map(|g| g.members.len()).sum();

        ReconciliationReport {
            group_count: groups.len(),
            orphan_count: orphans.len(),
            total_node_count: nodes.iter().filter(|n| n.is_active()).count(),
            duplicate_node_count,
            groups,
            orphans,
            linkage_issues,
            read_error: None,
            generated_at: Utc::now(),
        }
    }

    pub fn read_failed(error: String) -> Self {
        ReconciliationReport {
            groups: Vec::new(),
            orphans: Vec::new(),
            linkage_issues: Vec::new(),
            group_count: 0,
            orphan_count: 0,
            total_node_count: 0,
            duplicate_node_count: 0,
            read_error: Some(error),
            generated_at: Utc::now(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.read_error.is_none() && self.groups.is_empty() && self.linkage_issues.is_empty()
    }

    /// Only a failed read is worth retrying; findings are deterministic
    pub fn is_retryable(&self) -> bool {
        self.read_error.is_some()
    }

    pub fn group(&self, key: &GroupKey) -> Option<&DuplicateGroup> {
        self.groups.iter().find(|g| &g.key == key)
    }

    pub fn summary(&self) -> String {
        if let Some(error) = &self.read_error {
            return format!("Reconciliation report unavailable: {}", error);
        }
        format!(
            "Reconciliation: {} active locations, {} duplicate groups ({} locations), {} orphans, {} linkage issues",
            self.total_node_count,
            self.group_count,
            self.duplicate_node_count,
            self.orphan_count,
            self.linkage_issues.len()
        )
    }
}

// ============================================================================
// RECONCILIATION SERVICE
// ============================================================================

pub struct ReconciliationService {
    locations: Arc<dyn LocationStore>,
    aliases: Option<Arc<dyn AliasStore>>,
    tags: Option<Arc<dyn TagStore>>,
    audit: Option<Arc<dyn AuditLog>>,
    config: ReconciliationConfig,
    actor: String,
}

impl ReconciliationService {
    pub fn new(locations: Arc<dyn LocationStore>) -> Self {
        ReconciliationService {
            locations,
            aliases: None,
            tags: None,
            audit: None,
            config: ReconciliationConfig::default(),
            actor: DEFAULT_ACTOR.to_string(),
        }
    }

    /// One SQLite database backing every store seam
    pub fn sqlite(store: Arc<SqliteStore>) -> Self {
        let locations: Arc<dyn LocationStore> = store.clone();
        let aliases: Arc<dyn AliasStore> = store.clone();
        let tags: Arc<dyn TagStore> = store.clone();
        let audit: Arc<dyn AuditLog> = store;

        ReconciliationService::new(locations)
            .with_aliases(aliases)
            .with_tags(tags)
            .with_audit(audit)
    }

    pub fn with_aliases(mut self, aliases: Arc<dyn AliasStore>) -> Self {
        self.aliases = Some(aliases);
        self
    }

    pub fn with_tags(mut self, tags: Arc<dyn TagStore>) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_config(mut self, config: ReconciliationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_actor(mut self, actor: &str) -> Self {
        self.actor = actor.to_string();
        self
    }

    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    // ========================================================================
    // Detection (read-only)
    // ========================================================================

    pub fn detect_duplicates(&self) -> ReconciliationReport {
        match self.locations.list_active() {
            Ok(nodes) => {
                let report = ReconciliationReport::from_nodes(&nodes);
                info!(
                    groups = report.group_count,
                    orphans = report.orphan_count,
                    scanned = report.total_node_count,
                    "duplicate detection finished"
                );
                report
            }
            Err(e) => {
                warn!(error = %e, "could not read active locations");
                ReconciliationReport::read_failed(e.to_string())
            }
        }
    }

    pub fn detect_orphans(&self) -> Vec<LocationNode> {
        match self.locations.list_active() {
            Ok(nodes) => OrphanDetector::new().detect(&nodes),
            Err(e) => {
                warn!(error = %e, "could not read active locations, reporting no orphans");
                Vec::new()
            }
        }
    }

    // ========================================================================
    // Merge
    // ========================================================================

    /// Merge the group currently stored under `key`. The group is rebuilt from
    /// fresh state, so a stale report cannot resurrect an old membership.
    pub fn merge(&self, key: &GroupKey, keeper_id: &str) -> ReconciliationResult<MergeResult> {
        let members: Vec<LocationNode> = self
            .locations
            .list_active()?
            .into_iter()
            .filter(|n| key.matches(n))
            .collect();

        let Some(keeper) = members.iter().find(|m| m.id == keeper_id) else {
            return Err(ValidationError::KeeperNotInGroup {
                keeper_id: keeper_id.to_string(),
            }
            .into());
        };

        if members.len() < 2 {
            info!(keeper_id, key = %key, "group already consolidated");
            return Ok(MergeResult::noop(keeper));
        }

        let group = DuplicateGroup::from_members(key.clone(), members)
            .ok_or(ValidationError::EmptyGroup)?;
        self.merge_group(&group, keeper_id)
    }

    /// Merge a caller-held group snapshot; members are re-validated against the store
    pub fn merge_group(
        &self,
        group: &DuplicateGroup,
        keeper_id: &str,
    ) -> ReconciliationResult<MergeResult> {
        let result = MergeCoordinator::new(self.locations.as_ref())
            .with_aliases(self.aliases.as_deref())
            .with_tags(self.tags.as_deref())
            .with_stats(self.config.stats_aggregator())
            .with_timeout(self.config.merge_timeout())
            .merge(group, keeper_id)?;

        if !result.no_op {
            self.record(Event::new(
                "location_merged",
                "location",
                keeper_id,
                json!({
                    "key": group.key.to_string(),
                    "tombstoned": result.tombstoned,
                    "migrated_children": result.migrated_children,
                    "migrated_aliases": result.migrated_aliases,
                    "migrated_tags": result.migrated_tags,
                    "usage_count": result.usage_count,
                    "popularity_score": result.popularity_score,
                    "degraded": result.degraded,
                }),
                &self.actor,
            ));
        }

        Ok(result)
    }

    // ========================================================================
    // Orphan repair
    // ========================================================================

    pub fn fix_orphan(&self, orphan_id: &str, parent_id: &str) -> ReconciliationResult<()> {
        OrphanRepair::new(self.locations.as_ref()).fix(orphan_id, parent_id)?;

        self.record(Event::new(
            "orphan_fixed",
            "location",
            orphan_id,
            json!({ "parent_id": parent_id }),
            &self.actor,
        ));

        Ok(())
    }

    // ========================================================================
    // Variant normalization
    // ========================================================================

    /// Rewrite every Active node matching `pattern` to `canonical_form`.
    /// Returns how many nodes changed; status and dependents are untouched.
    pub fn normalize_known_variant(
        &self,
        pattern: &str,
        canonical_form: &str,
    ) -> ReconciliationResult<usize> {
        let rule = VariantRule::new(pattern, canonical_form)?;
        self.apply_rule(&rule)
    }

    /// Every configured variant rule, in order
    pub fn apply_variant_rules(&self) -> ReconciliationResult<usize> {
        let mut total = 0;
        for rule in &self.config.variant_rules {
            rule.validate()?;
            total += self.apply_rule(rule)?;
        }
        Ok(total)
    }

    fn apply_rule(&self, rule: &VariantRule) -> ReconciliationResult<usize> {
        let mut rewritten = 0;

        for node in self.locations.list_active()? {
            let Some(patch) = rule.apply_to(&node) else {
                continue;
            };

            self.locations.update_fields(&node.id, &patch)?;
            rewritten += 1;

            self.record(Event::new(
                "variant_normalized",
                "location",
                &node.id,
                json!({ "from": node.name, "to": rule.canonical_form }),
                &self.actor,
            ));
        }

        info!(
            pattern = %rule.pattern,
            canonical_form = %rule.canonical_form,
            count = rewritten,
            "variant rule applied"
        );

        Ok(rewritten)
    }

    fn record(&self, event: Event) {
        if let Some(audit) = &self.audit {
            if let Err(e) = audit.record(&event) {
                warn!(
                    event_type = %event.event_type,
                    entity_id = %event.entity_id,
                    error = %e,
                    "failed to write audit event"
                );
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
