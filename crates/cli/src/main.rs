use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kln_config::CriteriaDocument;
use kln_core::{Criteria, DeletionMarker, MarkerState, Record, DEFAULT_MARKER_KEY};
use kln_kubehub::KubeStore;
use kln_ops::{FailurePolicy, FlagOptions, FlagOutcome, SweepOptions};
use kln_store::{MemoryStore, Propagation, ResourceStore};
use serde::Serialize;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "kln",
    version,
    about = "Keep your cluster clean: find, flag and delete unwanted objects",
    after_help = "Examples:\n  kln list -f ./kln.yaml\n  kln flag            # label matches kln.com/delete=true\n  kln flag --undo     # label matches kln.com/delete=false\n  kln delete          # delete objects labelled kln.com/delete=true"
)]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Criteria document (YAML with an `items:` list)
    #[arg(short = 'f', long = "file", global = true, env = "KLN_FILE", default_value = "./kln.yaml")]
    file: PathBuf,

    /// Kubeconfig path (default: in-cluster config, KUBECONFIG, ~/.kube/config)
    #[arg(short = 'k', long = "kube-config", global = true)]
    kubeconfig: Option<PathBuf>,

    /// Label key marking objects for deletion
    #[arg(long = "marker-key", global = true, env = "KLN_MARKER_KEY", default_value = DEFAULT_MARKER_KEY)]
    marker_key: String,

    /// Evaluate against a saved `kubectl get -o json` dump instead of a cluster
    #[arg(long = "from-file", global = true)]
    from_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum PropagationArg { Background, Foreground, Orphan }

impl From<PropagationArg> for Propagation {
    fn from(p: PropagationArg) -> Self {
        match p {
            PropagationArg::Background => Propagation::Background,
            PropagationArg::Foreground => Propagation::Foreground,
            PropagationArg::Orphan => Propagation::Orphan,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List objects matching each criteria item
    List,
    /// Label matching objects for deletion
    Flag {
        /// Set the label to "false" instead of "true"
        #[arg(long = "undo", action = ArgAction::SetTrue)]
        undo: bool,
        /// Keep patching after a failed object and report every failure at the end
        #[arg(long = "keep-going", action = ArgAction::SetTrue)]
        keep_going: bool,
        /// Print what would be labelled without patching
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Delete labelled objects of every resource type named in the file.
    /// Only the gvr of each item is used; other criteria are ignored.
    Delete {
        /// Cascading policy for dependents (server default when omitted)
        #[arg(long = "propagation", value_enum)]
        propagation: Option<PropagationArg>,
        /// Print what would be deleted without deleting
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
}

impl Commands {
    fn mutates(&self) -> bool {
        match self {
            Commands::List => false,
            Commands::Flag { dry_run, .. } | Commands::Delete { dry_run, .. } => !dry_run,
        }
    }
}

fn init_tracing() {
    let env = std::env::var("KLN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KLN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KLN_METRICS_ADDR; expected host:port");
        }
    }
}

/// Per-item result for `-o json`.
#[derive(Debug, Serialize)]
struct ItemReport {
    criteria: String,
    gvr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    result: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ItemReport {
    fn for_criteria(c: &Criteria) -> Self {
        Self {
            criteria: c.label(),
            gvr: c.resource_type.key(),
            description: c.description.clone(),
            result: serde_json::Value::Null,
            error: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct Row {
    namespace: Option<String>,
    name: String,
    age: String,
    marker: MarkerState,
}

impl Row {
    fn from_record(r: &Record, marker: &DeletionMarker, now: DateTime<Utc>) -> Self {
        Self {
            namespace: r.namespace.clone(),
            name: r.name.clone(),
            age: render_age(r.creation_time, now),
            marker: marker.state_of(r),
        }
    }
}

async fn open_store(cli: &Cli, doc: &CriteriaDocument) -> Result<Box<dyn ResourceStore>> {
    let Some(path) = cli.from_file.as_deref() else {
        let store = KubeStore::connect(cli.kubeconfig.as_deref()).await?;
        return Ok(Box::new(store));
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading snapshot {}", path.display()))?;
    let raw: serde_json::Value =
        serde_yaml::from_str(&text).with_context(|| format!("parsing snapshot {}", path.display()))?;
    let mem = MemoryStore::new();
    for c in &doc.items {
        let loaded = mem.load_snapshot(&raw, &c.resource_type, c.kind.as_deref()).await;
        info!(gvr = %c.resource_type, loaded, "snapshot items loaded");
    }
    Ok(Box::new(mem))
}

async fn run_list(store: &dyn ResourceStore, doc: &CriteriaDocument, marker: &DeletionMarker, output: Output) -> Result<usize> {
    let now = Utc::now();
    let mut failed = 0usize;
    let mut reports = Vec::with_capacity(doc.items.len());
    for c in &doc.items {
        info!(gvr = %c.resource_type, criteria = %c.label(), description = ?c.description, "list invoked");
        let mut report = ItemReport::for_criteria(c);
        match kln_ops::select_at(store, c, now).await {
            Ok(matches) => {
                let rows: Vec<Row> = matches.iter().map(|r| Row::from_record(r, marker, now)).collect();
                if output == Output::Human {
                    println!("--- {} ({})", c.label(), c.resource_type);
                    if let Some(d) = &c.description { println!("    {}", d); }
                    println!("NAMESPACE   NAME                           AGE      MARKER");
                    for row in &rows {
                        let ns_col = row.namespace.clone().unwrap_or_else(|| "-".to_string());
                        println!("{:<11} {:<30} {:<8} {}", ns_col, row.name, row.age, marker_col(row.marker));
                    }
                }
                report.result = serde_json::to_value(&rows)?;
            }
            Err(e) => {
                error!(gvr = %c.resource_type, criteria = %c.label(), error = %e, "list failed");
                if output == Output::Human { eprintln!("{}: {}", c.label(), e); }
                report.error = Some(e.to_string());
                failed += 1;
            }
        }
        reports.push(report);
    }
    if output == Output::Json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }
    Ok(failed)
}

async fn run_flag(store: &dyn ResourceStore, doc: &CriteriaDocument, opts: &FlagOptions, desired: bool, output: Output) -> Result<usize> {
    let mut failed = 0usize;
    let mut reports = Vec::with_capacity(doc.items.len());
    for c in &doc.items {
        info!(gvr = %c.resource_type, criteria = %c.label(), desired, dry_run = opts.dry_run, "flag invoked");
        let mut report = ItemReport::for_criteria(c);
        match kln_ops::flag_matching(store, c, desired, opts).await {
            Ok(outcome) => {
                if output == Output::Human {
                    match &outcome {
                        FlagOutcome::NothingMatched => println!("{}: no objects match", c.label()),
                        FlagOutcome::Applied(r) => {
                            let verb = if r.dry_run { format!("would {}", r.action) } else { format!("{}ged", r.action) };
                            for rf in &r.patched { println!("{} {}", verb, rf); }
                        }
                    }
                }
                report.result = serde_json::to_value(&outcome)?;
            }
            Err(e) => {
                error!(gvr = %c.resource_type, criteria = %c.label(), error = %e, "flag failed");
                if output == Output::Human { eprintln!("{}: {}", c.label(), e); }
                report.error = Some(e.to_string());
                failed += 1;
            }
        }
        reports.push(report);
    }
    if output == Output::Json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }
    Ok(failed)
}

async fn run_delete(store: &dyn ResourceStore, doc: &CriteriaDocument, opts: &SweepOptions, output: Output) -> Result<usize> {
    let mut failed = 0usize;
    let mut reports = Vec::new();
    for rt in doc.resource_types() {
        info!(gvr = %rt, dry_run = opts.dry_run, propagation = ?opts.propagation, "delete invoked");
        let mut report = ItemReport { criteria: rt.key(), gvr: rt.key(), description: None, result: serde_json::Value::Null, error: None };
        match kln_ops::sweep(store, &rt, opts).await {
            Ok(swept) => {
                if output == Output::Human {
                    if swept.is_empty() { println!("nothing to delete in {}", rt); }
                    let verb = if swept.dry_run { "would delete" } else { "deleted" };
                    for rf in &swept.deleted { println!("{} {}", verb, rf); }
                    for rf in &swept.already_gone { println!("already gone {}", rf); }
                }
                report.result = serde_json::to_value(&swept)?;
            }
            Err(e) => {
                error!(gvr = %rt, error = %e, "delete failed");
                if output == Output::Human { eprintln!("{}: {}", rt, e); }
                report.error = Some(e.to_string());
                failed += 1;
            }
        }
        reports.push(report);
    }
    if output == Output::Json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }
    Ok(failed)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let marker = DeletionMarker::new(cli.marker_key.clone())?;
    let doc = kln_config::load_document(&cli.file)?;
    if doc.items.is_empty() {
        warn!(file = %cli.file.display(), "criteria document has no items");
        return Ok(());
    }
    if cli.from_file.is_some() && cli.command.mutates() {
        bail!("--from-file evaluates a saved dump; use `list` or `--dry-run`");
    }
    let store = open_store(&cli, &doc).await?;

    let total = match &cli.command {
        Commands::Delete { .. } => doc.resource_types().len(),
        _ => doc.items.len(),
    };
    let failed = match cli.command {
        Commands::List => run_list(store.as_ref(), &doc, &marker, cli.output).await?,
        Commands::Flag { undo, keep_going, dry_run } => {
            let opts = FlagOptions {
                marker,
                policy: if keep_going { FailurePolicy::Continue } else { FailurePolicy::Abort },
                dry_run,
            };
            run_flag(store.as_ref(), &doc, &opts, !undo, cli.output).await?
        }
        Commands::Delete { propagation, dry_run } => {
            let opts = SweepOptions { marker, propagation: propagation.map(Propagation::from), dry_run };
            run_delete(store.as_ref(), &doc, &opts, cli.output).await?
        }
    };

    if failed > 0 {
        return Err(anyhow!("{} of {} item(s) failed", failed, total));
    }
    Ok(())
}

fn marker_col(state: MarkerState) -> &'static str {
    match state {
        MarkerState::Flagged => "true",
        MarkerState::Unflagged => "false",
        MarkerState::Absent => "-",
    }
}

fn render_age(created: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(ts) = created else { return "-".to_string() };
    let mut secs = (now - ts).num_seconds().max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
