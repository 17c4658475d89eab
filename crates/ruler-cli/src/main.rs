//! Ruler CLI

mod config;
mod rule_file;

use anyhow::Result;
use clap::{Parser, Subcommand};
use ruler_core::{
    rule_group, AlertRuleGroupKey, AlertRuleKey, CommittedChanges, Database, InstanceStore,
    Labels, LogAnnotationSink, LogForwarder, Metrics, NotificationForwarder, Provenance,
    RuleFilter, RuleStore, SnapshotEvaluator, StateManager, WebhookForwarder,
};
use ruler_scheduler::Scheduler;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::rule_file::RuleGroupFile;

/// Initialize logging with the specified verbosity level
fn init_logging(verbose: u8, quiet: bool, json: bool) -> Result<()> {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env().add_directive(format!("ruler={}", level).parse()?);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose >= 2)
        .with_file(verbose >= 3)
        .with_line_number(verbose >= 3);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }

    Ok(())
}

#[derive(Parser)]
#[command(name = "ruler")]
#[command(about = "Alert rule scheduler")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(long, env = "RULER_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Database path, overrides `[database] path`
    #[arg(long, env = "RULER_DB_PATH", global = true)]
    db_path: Option<String>,

    /// Increase verbosity (-v: info, -vv: debug, -vvv: trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Output logs as JSON (for machine parsing)
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Run,
    /// Rule management
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },
    /// Alert instance state
    State {
        #[command(subcommand)]
        action: StateAction,
    },
}

#[derive(Subcommand)]
enum RulesAction {
    /// Replace a rule group with the contents of a YAML file
    Apply {
        #[arg(short, long)]
        file: PathBuf,
        /// Source recorded on the rules (none, api, file)
        #[arg(long, default_value = "file")]
        provenance: String,
    },
    /// List rules
    List {
        #[arg(long)]
        org: Option<i64>,
        #[arg(long)]
        json: bool,
    },
    /// Delete a single rule
    Delete {
        #[arg(long, default_value = "1")]
        org: i64,
        #[arg(long)]
        uid: String,
        #[arg(long, default_value = "file")]
        provenance: String,
    },
    /// Delete every rule of a group
    DeleteGroup {
        #[arg(long, default_value = "1")]
        org: i64,
        #[arg(long)]
        namespace: String,
        #[arg(long)]
        group: String,
        #[arg(long, default_value = "file")]
        provenance: String,
    },
}

#[derive(Subcommand)]
enum StateAction {
    /// List persisted alert instances
    List {
        #[arg(long, default_value = "1")]
        org: i64,
        /// Only instances of this rule
        #[arg(long)]
        rule: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet, cli.log_json)?;

    let config = Config::load(cli.config.as_deref())?;

    let db_path = cli
        .db_path
        .clone()
        .or_else(|| config.database.path.clone())
        .unwrap_or_else(|| "~/.ruler/ruler.db".to_string());
    let db_path = shellexpand::tilde(&db_path).to_string();
    let db_path = PathBuf::from(db_path);

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db = Database::with_config(&db_path, config.to_database_config()).await?;

    match cli.command {
        Commands::Run => run_daemon(db, &config).await?,
        Commands::Rules { action } => handle_rules(&db, &config, action).await?,
        Commands::State { action } => match action {
            StateAction::List { org, rule, json } => {
                let mut instances = db.list_instances(org).await?;
                if let Some(uid) = rule {
                    instances.retain(|i| i.rule_uid == uid);
                }

                if json {
                    println!("{}", serde_json::to_string_pretty(&instances)?);
                } else if instances.is_empty() {
                    println!("No alert instances");
                } else {
                    println!(
                        "{:<24} {:<10} {:<12} {:<26} LABELS",
                        "RULE", "STATE", "REASON", "STARTS AT"
                    );
                    println!("{}", "-".repeat(100));
                    for instance in instances {
                        println!(
                            "{:<24} {:<10} {:<12} {:<26} {}",
                            instance.rule_uid,
                            instance.state().to_string(),
                            instance.reason().to_string(),
                            instance.starts_at.format("%Y-%m-%d %H:%M:%S UTC"),
                            format_labels(&instance.labels)
                        );
                    }
                }
            }
        },
    }

    Ok(())
}

async fn handle_rules(db: &Database, config: &Config, action: RulesAction) -> Result<()> {
    let scheduler_config = config.to_scheduler_config()?;
    let base = scheduler_config.base_interval_seconds();

    match action {
        RulesAction::Apply { file, provenance } => {
            let provenance: Provenance = provenance.parse()?;
            let content = std::fs::read_to_string(&file)?;
            let group_file = RuleGroupFile::parse(&content)?;
            let group_key = group_file.group_key();

            let stored_versions: HashMap<String, i64> = db
                .list_rules(&RuleFilter::group(&group_key))
                .await?
                .into_iter()
                .map(|r| (r.uid, r.version))
                .collect();
            let rules =
                group_file.into_rules(scheduler_config.default_rule_interval(), &stored_versions)?;

            let committed =
                rule_group::update_rule_group(db, &group_key, rules, provenance, base).await?;
            print_committed(&group_key, &committed);
        }
        RulesAction::List { org, json } => {
            let filter = RuleFilter {
                org_id: org,
                ..RuleFilter::all()
            };
            let rules = db.list_rules(&filter).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&rules)?);
            } else if rules.is_empty() {
                println!("No rules found");
            } else {
                println!(
                    "{:<24} {:<5} {:<16} {:<16} {:<8} {:<8} {:<8} TITLE",
                    "UID", "ORG", "NAMESPACE", "GROUP", "INTERVAL", "VERSION", "PAUSED"
                );
                println!("{}", "-".repeat(100));
                for rule in rules {
                    println!(
                        "{:<24} {:<5} {:<16} {:<16} {:<8} {:<8} {:<8} {}",
                        rule.uid,
                        rule.org_id,
                        rule.namespace_uid,
                        rule.rule_group,
                        format!("{}s", rule.interval_seconds),
                        rule.version,
                        rule.is_paused,
                        rule.title
                    );
                }
            }
        }
        RulesAction::Delete {
            org,
            uid,
            provenance,
        } => {
            let key = AlertRuleKey::new(org, uid);
            let committed =
                rule_group::delete_rule(db, &key, provenance.parse()?, base).await?;
            println!("Deleted rule {}", key);
            if !committed.updated.is_empty() {
                println!("Re-indexed {} remaining rules", committed.updated.len());
            }
        }
        RulesAction::DeleteGroup {
            org,
            namespace,
            group,
            provenance,
        } => {
            let group_key = AlertRuleGroupKey::new(org, namespace, group);
            let committed =
                rule_group::delete_rule_group(db, &group_key, provenance.parse()?, base).await?;
            println!(
                "Deleted {} rules from group {}",
                committed.deleted.len(),
                group_key
            );
        }
    }

    Ok(())
}

fn print_committed(group_key: &AlertRuleGroupKey, committed: &CommittedChanges) {
    if committed.inserted.is_empty() && committed.updated.is_empty() && committed.deleted.is_empty()
    {
        println!("Group {} unchanged", group_key);
        return;
    }
    println!("Applied group {}", group_key);
    for rule in &committed.inserted {
        println!("  + {} ({})", rule.uid, rule.title);
    }
    for update in &committed.updated {
        println!(
            "  ~ {} (version {} -> {})",
            update.new.uid, update.existing.version, update.new.version
        );
    }
    for rule in &committed.deleted {
        println!("  - {} ({})", rule.uid, rule.title);
    }
}

fn format_labels(labels: &Labels) -> String {
    let pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!("{{{}}}", pairs.join(", "))
}

async fn run_daemon(db: Database, config: &Config) -> Result<()> {
    let scheduler_config = config.to_scheduler_config()?;
    let metrics = Arc::new(Metrics::new()?);
    let store = Arc::new(db);

    let state = Arc::new(StateManager::new(
        store.clone(),
        Arc::new(LogAnnotationSink),
        metrics.clone(),
        config.to_state_config(),
    ));

    let snapshot_path = shellexpand::tilde(&config.evaluator.snapshot_path).to_string();
    let evaluator = Arc::new(SnapshotEvaluator::new(&snapshot_path));

    let forwarder: Arc<dyn NotificationForwarder> = match &config.notifications.webhook_url {
        Some(url) => Arc::new(WebhookForwarder::new(
            url.clone(),
            Duration::from_secs(config.notifications.timeout_seconds),
        )?),
        None => Arc::new(LogForwarder),
    };

    println!("Ruler scheduler");
    println!("  Base interval:  {}s", scheduler_config.base_interval_seconds());
    println!("  Jitter:         {}", scheduler_config.jitter.as_str());
    println!("  Samples:        {}", snapshot_path);
    println!(
        "  Notifications:  {}",
        config
            .notifications
            .webhook_url
            .as_deref()
            .unwrap_or("log only")
    );
    println!();
    println!("Press Ctrl+C to stop");

    let scheduler = Scheduler::new(
        scheduler_config,
        store,
        state,
        evaluator,
        forwarder,
        metrics.clone(),
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
        signal.cancel();
    });

    match scheduler.run(shutdown).await {
        Ok(()) | Err(ruler_core::Error::Cancelled) => info!("Scheduler stopped"),
        Err(e) => {
            error!(error = %e, "Scheduler failed");
            return Err(e.into());
        }
    }

    if let Some(path) = &config.notifications.metrics_file {
        let path = shellexpand::tilde(path).to_string();
        write_metrics(Path::new(&path), &metrics)?;
        info!(path = %path, "Wrote metrics");
    }

    Ok(())
}

fn write_metrics(path: &Path, metrics: &Metrics) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, metrics.gather_text())?;
    Ok(())
}
