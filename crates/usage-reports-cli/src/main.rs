use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use usage_reports_api::ReportsApi;
use usage_reports_core::{
    DomainLookup, JiraIssueRecord, LogRecord, QueryCache, RawReportQuery, ReportKind,
};
use usage_reports_store_sqlite::UsageStore;

mod jira;

#[derive(Debug, Parser)]
#[command(name = "ur")]
#[command(about = "Usage reports CLI")]
struct Cli {
    #[arg(long, default_value = "./usage_reports.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    /// Run one report and print its page as JSON.
    Report(ReportArgs),
    /// Load usage log records from a JSON file.
    Seed(SeedArgs),
    /// Pull cap-override tickets from JIRA into the local store.
    JiraSync(JiraSyncArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate,
}

#[derive(Debug, Args)]
struct ReportArgs {
    /// user-summary, detailed-logs, cap-resets, sanctioned-domains, or
    /// jira-cap-requests
    kind: String,
    #[arg(long)]
    page: Option<String>,
    #[arg(long)]
    limit: Option<String>,
    #[arg(long)]
    level: Option<String>,
    #[arg(long)]
    search: Option<String>,
    #[arg(long)]
    start_date: Option<String>,
    #[arg(long)]
    end_date: Option<String>,
    #[arg(long)]
    sort_by: Option<String>,
    #[arg(long)]
    sort_order: Option<String>,
    #[arg(long, default_value = "./sanction-domains.json")]
    domains: PathBuf,
}

#[derive(Debug, Args)]
struct SeedArgs {
    /// JSON array of usage log records.
    #[arg(long)]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct JiraSyncArgs {
    #[arg(long)]
    base_url: String,
    #[arg(long)]
    token: String,
    #[arg(long, default_value = "CAP")]
    project_key: String,
    /// Override the generated search JQL entirely.
    #[arg(long)]
    jql: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Db { command } => {
            // Opening the store applies pending migrations.
            let store = UsageStore::open(&cli.db)?;
            let status = store.schema_status().await?;
            match command {
                DbCommand::SchemaVersion | DbCommand::Migrate => {
                    print_json(&serde_json::to_value(status)?)?;
                }
            }
        }
        Command::Report(args) => {
            let kind = ReportKind::parse(&args.kind)
                .ok_or_else(|| anyhow!("unknown report kind: {}", args.kind))?;
            let domains = match DomainLookup::load(&args.domains) {
                Ok(lookup) => lookup,
                Err(err) => {
                    tracing::warn!(
                        path = %args.domains.display(),
                        error = %err,
                        "domain watchlist unavailable; using an empty lookup"
                    );
                    DomainLookup::default()
                }
            };
            let store = UsageStore::open(&cli.db)?;
            let api = ReportsApi::new(store, QueryCache::default(), domains);

            let raw = RawReportQuery {
                page: args.page,
                limit: args.limit,
                level: args.level,
                search: args.search,
                start_date: args.start_date,
                end_date: args.end_date,
                sort_by: args.sort_by,
                sort_order: args.sort_order,
            };
            let page = api.report(kind, &raw).await?;

            let mut body = serde_json::Map::new();
            body.insert(
                kind.rows_key().to_string(),
                serde_json::Value::from(page.rows),
            );
            body.insert(
                "pagination".to_string(),
                serde_json::to_value(page.pagination)?,
            );
            print_json(&serde_json::Value::Object(body))?;
        }
        Command::Seed(args) => {
            let raw = fs::read_to_string(&args.input)
                .with_context(|| format!("failed to read {}", args.input.display()))?;
            let records: Vec<LogRecord> = serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {}", args.input.display()))?;

            let store = UsageStore::open(&cli.db)?;
            let inserted = store.insert_log_records(records).await?;
            print_json(&serde_json::json!({ "inserted": inserted }))?;
        }
        Command::JiraSync(args) => {
            let client = jira::JiraClient::new(args.base_url, args.token);
            let jql = args
                .jql
                .unwrap_or_else(|| jira::search_jql(&args.project_key));
            let issues =
                tokio::task::spawn_blocking(move || client.fetch_all(&jql)).await??;

            let records: Vec<JiraIssueRecord> =
                issues.iter().filter_map(jira::issue_record).collect();
            let skipped = issues.len().saturating_sub(records.len());
            if skipped > 0 {
                tracing::warn!(skipped, "issues without key or numeric id were skipped");
            }
            let unattributed = records
                .iter()
                .filter(|record| record.requestor_email == jira::FALLBACK_EMAIL)
                .count();
            if unattributed > 0 {
                tracing::warn!(unattributed, "issue summaries without a requestor email");
            }

            let store = UsageStore::open(&cli.db)?;
            let outcome = store.upsert_jira_issues(records).await?;
            print_json(&serde_json::json!({
                "fetched": issues.len(),
                "skipped": skipped,
                "total": outcome.total,
                "inserted": outcome.inserted,
                "updated": outcome.updated,
            }))?;
        }
    }

    Ok(())
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
