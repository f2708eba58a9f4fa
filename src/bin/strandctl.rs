//! strandctl - operator tool for inspecting and nudging strands.
//!
//! Talks to the store directly, so it works without the workers' prog
//! registry: signal names and resume labels are not validated here.
//!
//! Usage:
//!   strandctl list --prog Subnet --failed
//!   strandctl signal <strand-id> destroy
//!   strandctl resume <strand-id> --label wait
//!   strandctl page host:hel1-7 "hel1-7 unreachable" --details '{"rack": 7}'

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use uuid::Uuid;

use strand::backends::{
    InspectionBackend, PageBackend, PostgresBackend, SemaphoreBackend, StrandFilter,
};
use strand::config::database_url;
use strand::observability::{self, ObservabilityOptions};
use strand::page::NewPage;
use strand::strand::StrandId;

#[derive(Parser, Debug)]
#[command(name = "strandctl", about = "Inspect and operate durable strands")]
struct Args {
    /// PostgreSQL connection string (defaults to STRAND_DATABASE_URL)
    #[arg(long, env = "STRAND_DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply pending database migrations
    Migrate,
    /// Print one strand
    Show { id: StrandId },
    /// List live strands
    List {
        #[arg(long)]
        prog: Option<String>,
        #[arg(long)]
        label: Option<String>,
        /// Only strands whose lease expired without a release
        #[arg(long, default_value = "false")]
        stale: bool,
        /// Only strands halted by a fatal failure
        #[arg(long, default_value = "false")]
        failed: bool,
        /// Include strands that already exited
        #[arg(long, default_value = "false")]
        all: bool,
        #[arg(long, default_value = "100")]
        limit: usize,
    },
    /// List pages, unresolved only unless --all
    Pages {
        #[arg(long, default_value = "false")]
        all: bool,
        #[arg(long, default_value = "100")]
        limit: usize,
    },
    /// Mark a page resolved
    ResolvePage { id: Uuid },
    /// Raise a page by hand; no-op while one is open for the tag
    Page {
        tag: String,
        summary: String,
        #[arg(long)]
        strand: Option<StrandId>,
        /// JSON object stored with the page
        #[arg(long)]
        details: Option<String>,
    },
    /// Send a semaphore and make the strand due now
    Signal { id: StrandId, name: String },
    /// List semaphores a strand has not consumed yet
    Signals { id: StrandId },
    /// Clear a failure and make the strand due now
    Resume {
        id: StrandId,
        #[arg(long)]
        label: Option<String>,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init(ObservabilityOptions::default());
    let args = Args::parse();

    let dsn = match args.database_url {
        Some(dsn) => dsn,
        None => database_url()?,
    };
    let backend = PostgresBackend::connect(&dsn)
        .await
        .with_context(|| "connect to database")?;

    match args.command {
        Command::Migrate => {
            // connect() already ran the embedded migrations.
            println!("migrations applied");
        }
        Command::Show { id } => match backend.get_strand(id).await? {
            Some(strand) => print_json(&strand)?,
            None => bail!("strand {id} not found"),
        },
        Command::List {
            prog,
            label,
            stale,
            failed,
            all,
            limit,
        } => {
            let filter = StrandFilter {
                prog,
                label,
                stale_as_of: stale.then(Utc::now),
                failed_only: failed,
                include_terminal: all,
                limit,
            };
            print_json(&backend.list_strands(&filter).await?)?;
        }
        Command::Pages { all, limit } => {
            print_json(&backend.list_pages(!all, limit).await?)?;
        }
        Command::ResolvePage { id } => {
            print_json(&backend.resolve_page(id, Utc::now()).await?)?;
        }
        Command::Page {
            tag,
            summary,
            strand,
            details,
        } => {
            let details = match details {
                Some(raw) => serde_json::from_str(&raw).context("parse --details")?,
                None => serde_json::Value::Null,
            };
            let mut page = NewPage::new(tag, summary, details);
            if let Some(strand) = strand {
                page = page.for_strand_id(strand);
            }
            match backend.raise_page(&page, Utc::now()).await? {
                Some(raised) => print_json(&raised)?,
                None => println!("page already open for tag {}", page.tag),
            }
        }
        Command::Signals { id } => {
            print_json(&backend.pending_semaphores(id).await?)?;
        }
        Command::Signal { id, name } => {
            print_json(&backend.signal(id, &name, Utc::now()).await?)?;
        }
        Command::Resume { id, label } => {
            print_json(&backend.resume(id, label.as_deref(), Utc::now()).await?)?;
        }
    }
    Ok(())
}
