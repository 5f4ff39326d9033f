//! poly-queue - Operator CLI for the Polycast schedule
//!
//! Import collaborator records, schedule content, and inspect or steer
//! schedule entries.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use libpolycast::logging::{LogFormat, LoggingConfig};
use libpolycast::scheduling::parse_schedule;
use libpolycast::service::PolycastService;
use libpolycast::types::{ChannelSettings, EntryStatus, ScheduleTransition};
use libpolycast::{
    Channel, Config, ContentItem, Organization, Platform, PolycastError, Result, ScheduleEntry,
    ScheduleStatus,
};
use secrecy::SecretString;
use serde::Deserialize;
use std::io::Read;

#[derive(Parser, Debug)]
#[command(name = "poly-queue")]
#[command(version)]
#[command(about = "Manage the Polycast schedule")]
#[command(long_about = "\
poly-queue - Manage the Polycast schedule

DESCRIPTION:
    poly-queue is the operator tool for the Polycast schedule. Use it to
    import organizations, channels and content, schedule content to one or
    more channels, and inspect, cancel or requeue schedule entries.

COMMANDS:
    import    Import organizations, content items and channels from JSON
    schedule  Schedule a content item to one or more channels
    cancel    Cancel a pending entry
    status    Show the status of one entry
    group     Show per-channel outcomes of one schedule request
    list      List schedule entries
    requeue   Give a failed entry a fresh retry budget
    preview   Render a content item for a channel
    history   Show the status transitions of an entry

USAGE EXAMPLES:
    # Import collaborator records
    poly-queue import records.json

    # Schedule to two channels tomorrow morning
    poly-queue schedule <CONTENT_ID> -c ch-meta -c ch-linkedin --at \"tomorrow 9am\"

    # Failed entries as JSON
    poly-queue list --status failed --format json

    # Retry a failed entry
    poly-queue requeue <ENTRY_ID>

CONFIGURATION:
    Configuration file: ~/.config/polycast/config.toml
    Database location: ~/.local/share/polycast/polycast.db

    Override with environment variables:
        POLYCAST_CONFIG    - Path to config file
        POLYCAST_DB_PATH   - Path to database file

EXIT CODES:
    0 - Success
    1 - Operation refused (entry not in the required state)
    2 - Database or configuration error
    3 - Invalid input or unknown id
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Import collaborator records from a JSON file ("-" for stdin)
    Import {
        /// Path to the JSON file
        file: String,
    },

    /// Schedule a content item
    Schedule {
        /// Content item ID
        content_id: String,

        /// Channel ID (repeatable)
        #[arg(short, long = "channel", required = true)]
        channels: Vec<String>,

        /// When to publish (e.g. "now", "30m", "tomorrow 9am", RFC 3339)
        #[arg(short, long, default_value = "now")]
        at: String,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Cancel a pending entry
    Cancel {
        /// Schedule entry ID
        entry_id: String,
    },

    /// Show the status of an entry
    Status {
        /// Schedule entry ID
        entry_id: String,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show per-channel outcomes of a schedule request
    Group {
        /// Group ID printed by `schedule`
        group_id: String,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List schedule entries
    List {
        /// Filter by status (pending, claimed, publishing, posted, failed, cancelled)
        #[arg(short, long)]
        status: Option<ScheduleStatus>,

        /// Maximum number of entries
        #[arg(short, long, default_value_t = 50)]
        limit: usize,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Move a failed entry back to pending with a fresh retry budget
    Requeue {
        /// Schedule entry ID
        entry_id: String,
    },

    /// Render a content item as it would be published to a channel
    Preview {
        /// Content item ID
        content_id: String,

        /// Channel ID
        channel_id: String,
    },

    /// Show the status transitions of an entry
    History {
        /// Schedule entry ID
        entry_id: String,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Quiet by default; stdout is reserved for command output
    let level = if cli.verbose { "debug" } else { "error" };
    LoggingConfig::new(LogFormat::Text, level.to_string(), cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let service = PolycastService::from_config(config).await?;

    match cli.command {
        Commands::Import { file } => cmd_import(&service, &file).await,
        Commands::Schedule {
            content_id,
            channels,
            at,
            format,
        } => cmd_schedule(&service, &content_id, &channels, &at, &format).await,
        Commands::Cancel { entry_id } => {
            service.schedule().cancel(&entry_id).await?;
            println!("Cancelled {}", entry_id);
            Ok(())
        }
        Commands::Status { entry_id, format } => {
            let format = OutputFormat::parse(&format)?;
            let status = service.schedule().get_status(&entry_id).await?;
            match format {
                OutputFormat::Json => print_json(&status),
                OutputFormat::Text => print_status_detail(&status),
            }
            Ok(())
        }
        Commands::Group { group_id, format } => {
            let format = OutputFormat::parse(&format)?;
            let statuses = service.schedule().group_status(&group_id).await?;
            print_statuses(&statuses, format);
            Ok(())
        }
        Commands::List {
            status,
            limit,
            format,
        } => {
            let format = OutputFormat::parse(&format)?;
            let statuses = service.schedule().list(status, limit).await?;
            print_statuses(&statuses, format);
            Ok(())
        }
        Commands::Requeue { entry_id } => {
            service.schedule().requeue(&entry_id).await?;
            println!("Requeued {}", entry_id);
            Ok(())
        }
        Commands::Preview {
            content_id,
            channel_id,
        } => cmd_preview(&service, &content_id, &channel_id).await,
        Commands::History { entry_id, format } => {
            let format = OutputFormat::parse(&format)?;
            let transitions = service.schedule().history(&entry_id).await?;
            match format {
                OutputFormat::Json => print_json(&transitions),
                OutputFormat::Text => print_history(&transitions),
            }
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(format: &str) -> Result<Self> {
        match format {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(PolycastError::InvalidInput(format!(
                "Invalid format '{}'. Must be 'text' or 'json'",
                other
            ))),
        }
    }
}

/// Records owned by the surrounding product, imported as-is
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ImportFile {
    organizations: Vec<Organization>,
    content_items: Vec<ContentItem>,
    channels: Vec<ChannelRecord>,
}

#[derive(Debug, Deserialize)]
struct ChannelRecord {
    id: String,
    organization_id: String,
    platform: Platform,
    account_ref: String,
    credential: String,
    #[serde(default)]
    settings: ChannelSettings,
}

impl ChannelRecord {
    fn into_channel(self, now: i64) -> Channel {
        Channel {
            id: self.id,
            organization_id: self.organization_id,
            platform: self.platform,
            account_ref: self.account_ref,
            credential: SecretString::from(self.credential),
            settings: self.settings,
            created_at: now,
        }
    }
}

async fn cmd_import(service: &PolycastService, file: &str) -> Result<()> {
    let content = if file == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| PolycastError::InvalidInput(format!("Failed to read stdin: {}", e)))?;
        buf
    } else {
        std::fs::read_to_string(file)
            .map_err(|e| PolycastError::InvalidInput(format!("Failed to read {}: {}", file, e)))?
    };

    let records: ImportFile = serde_json::from_str(&content)
        .map_err(|e| PolycastError::InvalidInput(format!("Invalid import file: {}", e)))?;

    let db = service.database();
    let now = Utc::now().timestamp();

    // Channels reference organizations, so those go first
    for org in &records.organizations {
        db.upsert_organization(org).await?;
    }
    for item in &records.content_items {
        db.upsert_content_item(item).await?;
    }
    let channel_count = records.channels.len();
    for record in records.channels {
        db.upsert_channel(&record.into_channel(now)).await?;
    }

    println!(
        "Imported {} organization(s), {} content item(s), {} channel(s)",
        records.organizations.len(),
        records.content_items.len(),
        channel_count
    );
    Ok(())
}

async fn cmd_schedule(
    service: &PolycastService,
    content_id: &str,
    channels: &[String],
    at: &str,
    format: &str,
) -> Result<()> {
    let format = OutputFormat::parse(format)?;
    let scheduled_for = parse_schedule(at, Utc::now())?.timestamp();
    let entries = service
        .schedule()
        .create(content_id, channels, scheduled_for)
        .await?;

    match format {
        OutputFormat::Json => print_json(&entries),
        OutputFormat::Text => print_entries(&entries),
    }
    Ok(())
}

async fn cmd_preview(service: &PolycastService, content_id: &str, channel_id: &str) -> Result<()> {
    let rendered = service.preview(content_id, channel_id).await?;

    println!("{}", rendered.text);
    println!("---");
    println!("{} characters, {} media", rendered.char_count, rendered.media.len());
    for warning in &rendered.validation.warnings {
        println!("warning: {}", warning);
    }
    for error in &rendered.validation.errors {
        println!("error: {}", error);
    }

    if rendered.validation.is_valid() {
        Ok(())
    } else {
        Err(PolycastError::InvalidInput(format!(
            "content item {} cannot be published to {}",
            content_id, channel_id
        )))
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error: failed to serialize output: {}", e),
    }
}

fn print_entries(entries: &[ScheduleEntry]) {
    if let Some(first) = entries.first() {
        println!("group {}", first.group_id);
    }
    for entry in entries {
        println!(
            "{} | {} | {} | {}",
            entry.id,
            entry.channel_id,
            entry.status,
            format_timestamp(entry.scheduled_for)
        );
    }
}

fn print_statuses(statuses: &[EntryStatus], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(statuses),
        OutputFormat::Text => {
            for status in statuses {
                println!(
                    "{} | {} | {} | {} | attempts {}{}",
                    status.entry_id,
                    status.channel_id,
                    status.platform,
                    status.status,
                    status.attempt_count,
                    status
                        .last_error_kind
                        .map(|kind| format!(" | {}", kind))
                        .unwrap_or_default()
                );
            }
        }
    }
}

fn print_status_detail(status: &EntryStatus) {
    println!("entry:         {}", status.entry_id);
    println!("group:         {}", status.group_id);
    println!("channel:       {} ({})", status.channel_id, status.platform);
    println!("status:        {}", status.status);
    println!("scheduled for: {}", format_timestamp(status.scheduled_for));
    println!("attempts:      {}", status.attempt_count);
    if let Some(not_before) = status.not_before {
        println!("next attempt:  {}", format_timestamp(not_before));
    }
    if let Some(ref error) = status.last_error {
        let kind = status
            .last_error_kind
            .map(|k| k.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        println!("last error:    [{}] {}", kind, error);
    }
    if let Some(ref post_id) = status.external_post_id {
        println!("post id:       {}", post_id);
    }
    if let Some(ref url) = status.external_url {
        println!("url:           {}", url);
    }
}

fn print_history(transitions: &[ScheduleTransition]) {
    for t in transitions {
        let from = t
            .from_status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{} | {} -> {}{}",
            format_timestamp(t.at),
            from,
            t.to_status,
            t.worker_id
                .as_deref()
                .map(|w| format!(" | {}", w))
                .unwrap_or_default()
        );
    }
}

fn format_timestamp(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}
