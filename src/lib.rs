// Location Reconciliation - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod config;
pub mod db;
pub mod deduplication;  // Duplicate groups by normalized name + type
pub mod entities;
pub mod error;
pub mod logging;
pub mod merge;          // Merge state machine (keeper + tombstones)
pub mod normalize;
pub mod orphans;
pub mod reconciliation; // Operator-facing service
pub mod stats;
pub mod store;

// Re-export commonly used types
pub use config::{load_variant_rules, ReconciliationConfig};
pub use db::{
    Event, SqliteStore,
    setup_database, insert_location, get_all_locations,
    verify_count, insert_event, get_events_for_entity,
};
pub use deduplication::{DuplicateDetector, DuplicateGroup, GroupKey};
pub use entities::{
    Alias, BoundingBox, GeoInfo, LocationNode, LocationPatch, LocationStatus, LocationType, Tag,
};
pub use error::{
    ReconciliationError, ReconciliationResult, StoreError, StoreResult, ValidationError,
};
pub use merge::{MergeCoordinator, MergeResult, MergeStep, StepOutcome, StepRecord};
pub use normalize::{normalize, VariantRule};
pub use orphans::{LinkageIssue, LinkageProblem, OrphanDetector, OrphanRepair};
pub use reconciliation::{ReconciliationReport, ReconciliationService};
pub use stats::{MergedStats, StatsAggregator};
pub use store::{AliasStore, AuditLog, LocationStore, TagStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
