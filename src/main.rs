use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use location_reconciliation::logging::{default_directive, init_tracing};
use location_reconciliation::{
    load_variant_rules, GroupKey, LocationType, ReconciliationConfig, ReconciliationService,
    SqliteStore,
};

/// Find and fix duplicate or misplaced locations in the location hierarchy
#[derive(Parser)]
#[command(name = "location-reconciliation", version)]
struct Cli {
    /// SQLite database (overrides database_path from the config file)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Name recorded on audit events
    #[arg(long, global = true, default_value = "cli")]
    actor: String,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database schema
    Init,

    /// Duplicate groups, orphans and linkage issues
    Report {
        #[arg(long)]
        json: bool,
    },

    /// Active, parentless, non-country locations
    Orphans {
        #[arg(long)]
        json: bool,
    },

    /// Merge a duplicate group into one keeper
    Merge {
        /// Any spelling of the group name
        #[arg(long)]
        name: String,

        #[arg(long = "type", value_parser = parse_location_type)]
        location_type: LocationType,

        /// Member to keep; defaults to the recommended keeper
        #[arg(long)]
        keeper: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Attach an orphan to a parent one level up
    FixOrphan { orphan_id: String, parent_id: String },

    /// Rewrite every active location matching PATTERN to CANONICAL
    Normalize { pattern: String, canonical: String },

    /// Apply variant rules from the config (or a standalone rules file)
    ApplyRules {
        #[arg(long)]
        rules: Option<PathBuf>,
    },
}

fn parse_location_type(s: &str) -> Result<LocationType, String> {
    LocationType::parse(s).ok_or_else(|| {
        let known: Vec<&str> = LocationType::ALL.iter().map(|t| t.as_str()).collect();
        format!("unknown location type {:?} (expected one of {})", s, known.join(", "))
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&default_directive(cli.verbose));

    let mut config = match &cli.config {
        Some(path) => ReconciliationConfig::from_file(path)?,
        None => ReconciliationConfig::default(),
    };
    if let Some(db) = &cli.db {
        config.database_path = db.clone();
    }

    let store = Arc::new(
        SqliteStore::open(&config.database_path)
            .with_context(|| format!("Failed to open database {:?}", config.database_path))?,
    );

    if let Command::Init = cli.command {
        println!("🗄️  Database ready: {:?}", config.database_path);
        println!("✓ {} locations stored", store.count()?);
        return Ok(());
    }

    let service = ReconciliationService::sqlite(store)
        .with_config(config)
        .with_actor(&cli.actor);

    match cli.command {
        Command::Init => {}
        Command::Report { json } => run_report(&service, json)?,
        Command::Orphans { json } => run_orphans(&service, json)?,
        Command::Merge {
            name,
            location_type,
            keeper,
            json,
        } => run_merge(&service, &name, location_type, keeper, json)?,
        Command::FixOrphan {
            orphan_id,
            parent_id,
        } => {
            service.fix_orphan(&orphan_id, &parent_id)?;
            println!("✅ {} now sits under {}", orphan_id, parent_id);
        }
        Command::Normalize { pattern, canonical } => {
            let count = service.normalize_known_variant(&pattern, &canonical)?;
            println!("✅ {} locations rewritten to {:?}", count, canonical);
        }
        Command::ApplyRules { rules } => {
            let service = match rules {
                Some(path) => {
                    let mut config = service.config().clone();
                    config.variant_rules = load_variant_rules(&path)?;
                    service.with_config(config)
                }
                None => service,
            };
            let rule_count = service.config().variant_rules.len();
            let count = service.apply_variant_rules()?;
            println!("✅ {} rules applied, {} locations rewritten", rule_count, count);
        }
    }

    Ok(())
}

fn run_report(service: &ReconciliationService, json: bool) -> Result<()> {
    let report = service.detect_duplicates();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if let Some(error) = &report.read_error {
        anyhow::bail!("could not read locations: {}", error);
    }

    println!("🔍 {}", report.summary());
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    for group in &report.groups {
        println!("\n📍 {}", group.key);
        for member in &group.members {
            let marker = if member.id == group.recommended_keeper_id {
                "★"
            } else {
                " "
            };
            println!(
                "  {} {}  {:<30} popularity {:>3}  usage {}",
                marker, member.id, member.display_name, member.popularity_score, member.usage_count
            );
        }
    }

    if !report.linkage_issues.is_empty() {
        println!("\n🌳 Linkage issues");
        for issue in &report.linkage_issues {
            println!(
                "  {} {} ({}): {:?}",
                issue.location_id, issue.name, issue.location_type, issue.problem
            );
        }
    }

    if report.is_clean() {
        println!("\n✅ Nothing to reconcile");
    }

    Ok(())
}

fn run_orphans(service: &ReconciliationService, json: bool) -> Result<()> {
    let orphans = service.detect_orphans();

    if json {
        println!("{}", serde_json::to_string_pretty(&orphans)?);
        return Ok(());
    }

    println!("🌳 {} orphans", orphans.len());
    for orphan in &orphans {
        println!(
            "  {}  {} ({}) - needs a {} parent",
            orphan.id,
            orphan.display_name,
            orphan.location_type,
            orphan
                .location_type
                .parent_type()
                .map_or("-", |t| t.as_str())
        );
    }

    Ok(())
}

fn run_merge(
    service: &ReconciliationService,
    name: &str,
    location_type: LocationType,
    keeper: Option<String>,
    json: bool,
) -> Result<()> {
    let key = GroupKey::new(name, location_type);

    let keeper_id = match keeper {
        Some(id) => id,
        None => {
            let report = service.detect_duplicates();
            if let Some(error) = report.read_error {
                anyhow::bail!("could not read locations: {}", error);
            }
            report
                .group(&key)
                .map(|g| g.recommended_keeper_id.clone())
                .with_context(|| format!("No duplicate group for {}", key))?
        }
    };

    let result = service
        .merge(&key, &keeper_id)
        .with_context(|| format!("Merge of {} into {} failed", key, keeper_id))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if result.degraded {
        println!("⚠️  {}", result.summary());
    } else {
        println!("✅ {}", result.summary());
    }

    Ok(())
}
