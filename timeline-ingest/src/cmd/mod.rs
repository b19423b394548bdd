use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use inquire::Confirm;

use crate::{
    context::AppContext,
    error::ToUserError,
    ingest::{IngestRequest, DEFAULT_EVENT_TYPE},
    lifecycle::{DeletionOutcome, DeletionPlan, IndexLifecycleManager},
    parse::SourceFormat,
    registry::NewRegistration,
    similarity::{SimilarityReport, SimilarityScorer},
};

#[derive(Parser, Debug)]
#[command(version, about = "Load forensic event files into a search index", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Parse a file, write its events to an index and register the index
    Ingest {
        #[command(subcommand)]
        format: IngestFormat,
    },

    /// Register an index that already exists in the datastore
    Register(RegisterArgs),

    /// Delete an index, its registration and every timeline built on it
    Delete(DeleteArgs),

    /// Cluster near-duplicate events of one data type and annotate them
    Similarity(SimilarityArgs),
}

#[derive(Subcommand, Debug)]
pub enum IngestFormat {
    /// A CSV file with a header row
    Csv(IngestArgs),
    /// One JSON object per line
    Jsonl(IngestArgs),
    /// A single JSON array of objects, loaded fully into memory
    Json(IngestArgs),
}

impl IngestFormat {
    pub fn into_parts(self) -> (SourceFormat, IngestArgs) {
        match self {
            IngestFormat::Csv(args) => (SourceFormat::Csv, args),
            IngestFormat::Jsonl(args) => (SourceFormat::Jsonl, args),
            IngestFormat::Json(args) => (SourceFormat::Json, args),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct IngestArgs {
    /// Name the index is registered under
    #[arg(long)]
    pub name: String,

    #[arg(long)]
    pub file: PathBuf,

    /// Write into this index instead of a freshly generated one
    #[arg(long)]
    pub index_id: Option<String>,

    #[arg(long)]
    pub event_type: Option<String>,

    /// Records per bulk write, overrides FLUSH_INTERVAL
    #[arg(long)]
    pub flush_interval: Option<usize>,

    #[arg(long)]
    pub owner: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct RegisterArgs {
    #[arg(long)]
    pub name: String,

    #[arg(long)]
    pub index_id: String,

    #[arg(long)]
    pub owner: Option<String>,

    #[arg(long, default_value = DEFAULT_EVENT_TYPE)]
    pub event_type: String,
}

#[derive(Args, Debug, Clone)]
pub struct DeleteArgs {
    #[arg(long)]
    pub index_id: String,

    /// Skip the confirmation prompt
    #[arg(long, default_value = "false")]
    pub yes: bool,
}

#[derive(Args, Debug, Clone)]
pub struct SimilarityArgs {
    #[arg(long)]
    pub index_id: String,

    #[arg(long)]
    pub data_type: String,

    /// Overrides SIMILARITY_THRESHOLD
    #[arg(long)]
    pub threshold: Option<f64>,
}

impl Cli {
    pub async fn run(self, context: &AppContext) -> Result<()> {
        match self.command {
            Commands::Ingest { format } => {
                let (format, args) = format.into_parts();
                ingest(context, format, args).await
            }
            Commands::Register(args) => register(&context.lifecycle, &args).await,
            Commands::Delete(args) => delete(&context.lifecycle, &args).await,
            Commands::Similarity(args) => similarity(context, &args).await,
        }
    }
}

async fn ingest(context: &AppContext, format: SourceFormat, args: IngestArgs) -> Result<()> {
    let summary = context
        .ingestor()
        .ingest(IngestRequest {
            name: args.name,
            path: args.file,
            format,
            index_name: args.index_id,
            event_type: args.event_type,
            flush_interval: args.flush_interval,
            owner: args.owner,
        })
        .await
        .user_error("Ingestion failed, the index was not registered")?;

    println!(
        "Wrote {} events to index {} in {} flushes",
        summary.records_written, summary.index_name, summary.flush_calls
    );
    if summary.skipped > 0 {
        println!("Skipped {} invalid records", summary.skipped);
    }
    println!(
        "Registered as '{}' (id {})",
        summary.registration.name, summary.registration.id
    );
    Ok(())
}

pub async fn register(lifecycle: &IndexLifecycleManager, args: &RegisterArgs) -> Result<()> {
    let (registration, created) = lifecycle
        .register_existing(&NewRegistration {
            name: args.name.clone(),
            index_name: args.index_id.clone(),
            event_type: args.event_type.clone(),
            owner: args.owner.clone(),
        })
        .await
        .user_error(format!("Could not register index {}", args.index_id))?;

    if created {
        println!(
            "Registered index {} as '{}' (id {})",
            registration.index_name, registration.name, registration.id
        );
    } else {
        println!(
            "Index {} is already registered as '{}' (id {})",
            registration.index_name, registration.name, registration.id
        );
    }
    Ok(())
}

fn describe_plan(plan: &DeletionPlan) {
    println!("Deleting index {} will remove:", plan.index_name);
    for registration in &plan.registrations {
        println!(
            "  registration '{}' (id {})",
            registration.name, registration.id
        );
    }
    for timeline in &plan.dependents {
        println!(
            "  timeline '{}' in sketch '{}' ({})",
            timeline.timeline_name, timeline.sketch_name, timeline.sketch_status
        );
    }
    let active = plan.active_sketches();
    if !active.is_empty() {
        println!(
            "WARNING: {} timelines belong to sketches that are still in use",
            active.len()
        );
    }
}

pub async fn delete(lifecycle: &IndexLifecycleManager, args: &DeleteArgs) -> Result<()> {
    let Some(plan) = lifecycle
        .plan_deletion(&args.index_id)
        .await
        .user_error("Could not look up the index")?
    else {
        println!("No such index: {}", args.index_id);
        return Ok(());
    };

    describe_plan(&plan);

    if !args.yes {
        let confirm = Confirm::new("Delete this index?")
            .with_default(false)
            .prompt();
        if !matches!(confirm, Ok(true)) {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let outcome = lifecycle
        .commit_deletion(&args.index_id, plan.token)
        .await
        .user_error("Deletion failed, run the command again to see what changed")?;

    match outcome {
        DeletionOutcome::NoSuchIndex => println!("No such index: {}", args.index_id),
        DeletionOutcome::Deleted {
            timelines_removed,
            index_removed,
        } => {
            println!(
                "Deleted index {} and {} timelines",
                args.index_id, timelines_removed
            );
            if !index_removed {
                println!("The index itself was already gone from the datastore");
            }
        }
    }
    Ok(())
}

async fn similarity(context: &AppContext, args: &SimilarityArgs) -> Result<()> {
    let mut config = context.config.similarity_config();
    if let Some(threshold) = args.threshold {
        config.threshold = threshold;
    }
    let scorer = SimilarityScorer::new(context.datastore.clone(), config)
        .user_error("Invalid similarity settings")?;

    let report = scorer
        .score(&args.index_id, &args.data_type)
        .await
        .user_error(format!("Could not score index {}", args.index_id))?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &SimilarityReport) {
    if report.is_empty() {
        println!("No events of data type '{}'", report.data_type);
        return;
    }
    let duplicates = report.clusters.iter().filter(|c| c.size() > 1).count();
    println!(
        "Scored {} events of '{}' into {} clusters, {} with more than one member",
        report.assignments.len(),
        report.data_type,
        report.clusters.len(),
        duplicates
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ingest() {
        let cli = Cli::try_parse_from([
            "timeline-ingest",
            "ingest",
            "jsonl",
            "--name",
            "case 7",
            "--file",
            "/tmp/events.jsonl",
            "--flush-interval",
            "50",
        ])
        .unwrap();
        let Commands::Ingest { format } = cli.command else {
            panic!("expected ingest");
        };
        let (format, args) = format.into_parts();
        assert_eq!(format, SourceFormat::Jsonl);
        assert_eq!(args.flush_interval, Some(50));
        assert_eq!(args.index_id, None);
    }

    #[test]
    fn test_parse_delete_and_register() {
        let cli = Cli::try_parse_from(["timeline-ingest", "delete", "--index-id", "abc", "--yes"])
            .unwrap();
        assert!(matches!(cli.command, Commands::Delete(DeleteArgs { yes: true, .. })));

        let cli =
            Cli::try_parse_from(["timeline-ingest", "register", "--name", "n", "--index-id", "i"])
                .unwrap();
        let Commands::Register(args) = cli.command else {
            panic!("expected register");
        };
        assert_eq!(args.event_type, DEFAULT_EVENT_TYPE);
    }

    #[test]
    fn test_ingest_requires_file() {
        assert!(Cli::try_parse_from(["timeline-ingest", "ingest", "csv", "--name", "x"]).is_err());
    }
}
