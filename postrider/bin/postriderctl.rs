//! Command-line utility for managing the postrider queue
//!
//! This tool provides operational control over the queue, including:
//! - Listing and inspecting pending envelopes
//! - Expediting and removing envelopes
//! - Pausing and resuming delivery kinds
//! - System status and health checks
//! - Viewing statistics

use clap::{Parser, Subcommand, ValueEnum};
use postrider_common::{DeliveryKind, ENVELOPE_ID_HEX_LEN, MESSAGE_ID_HEX_LEN, now_secs};
use postrider_control::{
    ControlClient, DEFAULT_CONTROL_SOCKET, ListScope, QueueCommand, Request, RequestCommand,
    RescheduleTarget, ResponsePayload, SystemCommand,
    protocol::{QueueEnvelope, QueueStats, ResponseData},
};

/// Command-line utility for managing the postrider queue
#[derive(Parser, Debug)]
#[command(name = "postriderctl")]
#[command(about = "Manage the postrider queue", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the control socket
    #[arg(short = 'c', long, default_value = DEFAULT_CONTROL_SOCKET)]
    control_socket: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Queue management commands
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// System status and health
    System {
        #[command(subcommand)]
        action: SystemAction,
    },
}

#[derive(Subcommand, Debug)]
enum SystemAction {
    /// Check if the queue is responding
    Ping,
    /// Get system status and statistics
    Status,
}

#[derive(Subcommand, Debug)]
enum QueueAction {
    /// Show queue statistics
    Stats,
    /// List pending envelopes
    List {
        /// Only envelopes destined to this host
        #[arg(long)]
        host: Option<String>,

        /// Only envelopes of this message (8 hex digits)
        #[arg(long)]
        message: Option<String>,
    },
    /// Make envelopes due immediately and serve them next
    Reschedule {
        /// "all", an envelope ID (16 hex digits), or a message ID (8 hex digits)
        target: String,
    },
    /// Remove an envelope from the queue
    Remove {
        /// Envelope ID to remove (16 hex digits)
        envelope_id: String,
    },
    /// Hold back deliveries of one kind
    Pause {
        /// Delivery kind to hold back
        #[arg(value_enum)]
        kind: KindArg,
    },
    /// Serve deliveries of one kind again
    Resume {
        /// Delivery kind to release
        #[arg(value_enum)]
        kind: KindArg,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum KindArg {
    Mda,
    Mta,
    Bounce,
}

impl From<KindArg> for DeliveryKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Mda => Self::Mda,
            KindArg::Mta => Self::Mta,
            KindArg::Bounce => Self::Bounce,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Queue { action } => {
            handle_queue_command_direct(&cli.control_socket, action).await?;
        }
        Commands::System { action } => {
            handle_system_command_direct(&cli.control_socket, action).await?;
        }
    }

    Ok(())
}

// ============================================================================
// Control Commands (via Unix socket IPC)
// ============================================================================

/// Check control socket connectivity and return client
fn check_control_socket(socket_path: &str) -> anyhow::Result<ControlClient> {
    let client = ControlClient::new(socket_path);

    // Check if socket exists first for better error messages
    if let Err(e) = client.check_socket_exists() {
        anyhow::bail!(
            "Cannot connect to postrider control socket at {socket_path}.\n\
             Error: {e}\n\
             \n\
             Is postrider running?\n\
             You can configure the socket path with --control-socket or in postrider.config.ron"
        );
    }

    Ok(client)
}

/// Handle queue commands directly
async fn handle_queue_command_direct(socket_path: &str, action: QueueAction) -> anyhow::Result<()> {
    let client = check_control_socket(socket_path)?;
    handle_queue_command(&client, action).await
}

/// Handle system commands directly
async fn handle_system_command_direct(
    socket_path: &str,
    action: SystemAction,
) -> anyhow::Result<()> {
    let client = check_control_socket(socket_path)?;
    handle_system_command(&client, action).await
}

/// Handle queue management commands
async fn handle_queue_command(client: &ControlClient, action: QueueAction) -> anyhow::Result<()> {
    let command = match action {
        QueueAction::Stats => QueueCommand::Stats,
        QueueAction::List { host, message } => {
            let scope = match (host, message) {
                (Some(_), Some(_)) => {
                    anyhow::bail!("--host and --message cannot be combined");
                }
                (Some(host), None) => ListScope::Host(host),
                (None, Some(message)) => ListScope::Message(message.parse()?),
                (None, None) => ListScope::All,
            };
            QueueCommand::List { scope }
        }
        QueueAction::Reschedule { target } => QueueCommand::Reschedule {
            target: parse_reschedule_target(&target)?,
        },
        QueueAction::Remove { envelope_id } => QueueCommand::Remove {
            envelope: envelope_id.parse()?,
        },
        QueueAction::Pause { kind } => QueueCommand::Pause { kind: kind.into() },
        QueueAction::Resume { kind } => QueueCommand::Resume { kind: kind.into() },
    };

    let request = Request::new(RequestCommand::Queue(command));
    let response = client.send_request(request).await?;

    match response.payload {
        ResponsePayload::Ok => {
            println!("✓ Command completed successfully");
        }
        ResponsePayload::Data(data) => match &*data {
            ResponseData::QueueStats(stats) => display_stats(stats),
            ResponseData::Envelopes(envelopes) => display_envelopes(envelopes),
            ResponseData::Count(count) => {
                println!("✓ Expedited {count} envelope(s)");
            }
            ResponseData::Message(msg) => {
                println!("✓ {msg}");
            }
            ResponseData::SystemStatus(_) => {
                println!("Unexpected response for queue command: {data:?}");
            }
        },
        ResponsePayload::Error(err) => {
            anyhow::bail!("Server error: {err}");
        }
    }

    Ok(())
}

/// Handle system management commands
async fn handle_system_command(client: &ControlClient, action: SystemAction) -> anyhow::Result<()> {
    let command = match action {
        SystemAction::Ping => SystemCommand::Ping,
        SystemAction::Status => SystemCommand::Status,
    };

    let request = Request::new(RequestCommand::System(command));
    let response = client.send_request(request).await?;

    match response.payload {
        ResponsePayload::Ok => {
            println!("✓ Pong! The queue is responding");
        }
        ResponsePayload::Data(data) => match &*data {
            ResponseData::SystemStatus(status) => {
                println!("=== Postrider Status ===\n");
                println!("Version:            {}", status.version);
                println!("Uptime:             {}", format_duration(status.uptime_secs));
                println!("Pending envelopes:  {}", status.pending_envelopes);
                if status.paused_kinds.is_empty() {
                    println!("Paused kinds:       none");
                } else {
                    println!("Paused kinds:       {}", status.paused_kinds.join(", "));
                }
            }
            ResponseData::QueueStats(_)
            | ResponseData::Envelopes(_)
            | ResponseData::Count(_)
            | ResponseData::Message(_) => {
                println!("Unexpected response for system command: {data:?}");
            }
        },
        ResponsePayload::Error(err) => {
            anyhow::bail!("Server error: {err}");
        }
    }

    Ok(())
}

/// Parse a reschedule target: "all", an envelope ID, or a message ID
fn parse_reschedule_target(target: &str) -> anyhow::Result<RescheduleTarget> {
    if target.eq_ignore_ascii_case("all") {
        return Ok(RescheduleTarget::All);
    }

    if target.len() == ENVELOPE_ID_HEX_LEN {
        return Ok(RescheduleTarget::Envelope(target.parse()?));
    }

    if target.len() == MESSAGE_ID_HEX_LEN {
        return Ok(RescheduleTarget::Message(target.parse()?));
    }

    anyhow::bail!(
        "Invalid reschedule target: {target} (expected \"all\", an envelope ID, or a message ID)"
    )
}

// ============================================================================
// Display Helpers
// ============================================================================

/// Display queue statistics
fn display_stats(stats: &QueueStats) {
    println!("=== Postrider Queue Statistics ===");
    println!();
    println!("Pending envelopes:  {}", stats.pending);
    println!("Due now:            {}", stats.due_now);
    println!("Destination hosts:  {}", stats.hosts);
    println!("Delivery batches:   {}", stats.batches);
    println!("Messages:           {}", stats.messages);

    if let Some(age) = stats.oldest_age_secs {
        println!("Oldest envelope:    {}", format_duration(age));
    }

    println!();
    println!("Envelopes by Kind:");
    for (kind, count) in &stats.by_kind {
        println!("  {kind:<10} {count:>6}");
    }

    if !stats.top_destinations.is_empty() {
        println!();
        println!("Top Destinations:");
        for (host, count) in &stats.top_destinations {
            println!("  {host:<30} {count:>6}");
        }
    }

    if !stats.paused_kinds.is_empty() {
        println!();
        println!("Paused kinds: {}", stats.paused_kinds.join(", "));
    }
}

/// Display pending envelopes as a table
fn display_envelopes(envelopes: &[QueueEnvelope]) {
    if envelopes.is_empty() {
        println!("No pending envelopes");
        return;
    }

    let now = now_secs();

    println!(
        "{:<18} {:<8} {:<24} {:>8}  {:<8} {:<12}",
        "ENVELOPE ID", "KIND", "DESTINATION", "ATTEMPTS", "AGE", "DUE"
    );
    println!("{}", "-".repeat(84));

    for envelope in envelopes {
        let age = format_age(envelope.created_at, now);
        let due = format_due(envelope.due_at, now);
        println!(
            "{:<18} {:<8} {:<24} {:>8}  {age:<8} {due:<12}",
            envelope.id, envelope.kind, envelope.destination, envelope.attempts
        );
    }

    println!("\nTotal: {} envelope(s)", envelopes.len());
}

/// Format age (time since timestamp) as human-readable
fn format_age(timestamp_secs: u64, now: u64) -> String {
    let age_secs = now.saturating_sub(timestamp_secs);

    if age_secs < 60 {
        format!("{age_secs}s")
    } else if age_secs < 3600 {
        let mins = age_secs / 60;
        format!("{mins}m")
    } else if age_secs < 86400 {
        let hours = age_secs / 3600;
        format!("{hours}h")
    } else {
        let days = age_secs / 86400;
        format!("{days}d")
    }
}

/// Format when an envelope comes due, relative to now
fn format_due(due_at: u64, now: u64) -> String {
    if due_at <= now {
        "due now".to_string()
    } else {
        format!("in {}", format_duration(due_at - now))
    }
}

/// Format duration in human-readable form
fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        let mins = secs / 60;
        let rem_secs = secs % 60;
        format!("{mins}m {rem_secs}s")
    } else if secs < 86400 {
        let hours = secs / 3600;
        let rem_mins = (secs % 3600) / 60;
        format!("{hours}h {rem_mins}m")
    } else {
        let days = secs / 86400;
        let rem_hours = (secs % 86400) / 3600;
        format!("{days}d {rem_hours}h")
    }
}
