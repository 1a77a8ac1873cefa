//! CLI commands for the IACP gateway using clap.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use crate::audit::{AuditFilter, AuditLog, AuditRecord, Disposition};
use crate::config::{load_settings_from, load_settings_or_default, Settings};
use crate::gateway::{DeliveryOutcome, Gateway, MailboxStore};
use crate::oversight::{ApprovalDecision, StaticApprovals};
use crate::protocol::{AgentIdentity, Envelope, EnvelopeBuilder, MessageType, Recipient};
use crate::web::{run_server, AppState, WebServerConfig};

/// IACP gateway - moderated message exchange between AI agent instances.
#[derive(Parser)]
#[command(name = "iacp")]
#[command(version)]
#[command(about = "Moderated inter-agent message gateway", long_about = None)]
pub struct Commands {
    /// Settings file (defaults to ~/.iacp/settings.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the HTTP gateway
    Serve {
        /// Port to listen on (overrides settings)
        #[arg(short, long)]
        port: Option<u16>,

        /// Address to bind (overrides settings)
        #[arg(long)]
        host: Option<String>,
    },

    /// Print audit records
    Audit {
        /// Only records from this sender session
        #[arg(short, long)]
        session: Option<String>,

        /// Only records with this disposition, e.g. rejected_safety
        #[arg(short, long)]
        disposition: Option<String>,

        /// Only records at or after this RFC 3339 time
        #[arg(long)]
        since: Option<String>,

        /// Maximum number of records
        #[arg(short, long, default_value = "50")]
        limit: usize,

        /// Print records as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Check an envelope file for well-formedness
    Validate {
        /// Path to a JSON envelope
        file: PathBuf,
    },

    /// Run a three-message walkthrough against an in-memory gateway
    Demo,
}

impl Commands {
    /// Run the command.
    pub async fn run(&self) -> Result<()> {
        match &self.command {
            Command::Serve { port, host } => {
                cmd_serve(self.settings()?, *port, host.clone()).await
            }
            Command::Audit {
                session,
                disposition,
                since,
                limit,
                json,
            } => cmd_audit(
                self.settings()?,
                session.clone(),
                disposition.as_deref(),
                since.as_deref(),
                *limit,
                *json,
            ),
            Command::Validate { file } => cmd_validate(file),
            Command::Demo => cmd_demo().await,
        }
    }

    fn settings(&self) -> Result<Settings> {
        match &self.config {
            Some(path) => load_settings_from(path)
                .with_context(|| format!("Failed to load settings from {}", path.display())),
            None => Ok(load_settings_or_default()),
        }
    }
}

// Command implementations

async fn cmd_serve(settings: Settings, port: Option<u16>, host: Option<String>) -> Result<()> {
    let mut web = WebServerConfig::from(settings.web.clone());
    if let Some(port) = port {
        web.port = port;
    }
    if let Some(host) = host {
        web.host = host;
    }

    let audit_path = settings.audit.resolve_path()?;
    let mailbox = Arc::new(MailboxStore::from_config(&settings.mailbox)?);
    let gateway = Gateway::builder(settings)
        .audit(Arc::new(AuditLog::open(&audit_path)?))
        .transport(mailbox.clone())
        .build()?;

    let recovered = gateway.recover_pending()?;
    if recovered > 0 {
        tracing::info!("Recovered {} envelopes awaiting approval", recovered);
    }

    println!("IACP gateway listening on {}:{}", web.host, web.port);
    println!("Audit log: {}", audit_path.display());
    println!("API endpoints:");
    println!("  http://{}:{}/api/sessions", web.host, web.port);
    println!("  http://{}:{}/api/envelopes", web.host, web.port);
    println!("  http://{}:{}/api/approvals", web.host, web.port);
    println!("  http://{}:{}/api/audit", web.host, web.port);
    println!("  http://{}:{}/health", web.host, web.port);
    println!();
    println!("Press Ctrl+C to stop");

    run_server(web, AppState { gateway, mailbox })
        .await
        .map_err(|e| anyhow::anyhow!("Web server error: {}", e))
}

fn cmd_audit(
    settings: Settings,
    session: Option<String>,
    disposition: Option<&str>,
    since: Option<&str>,
    limit: usize,
    json: bool,
) -> Result<()> {
    let disposition = disposition
        .map(str::parse::<Disposition>)
        .transpose()
        .map_err(anyhow::Error::msg)?;
    let since = since
        .map(|s| DateTime::parse_from_rfc3339(s).map(|t| t.with_timezone(&Utc)))
        .transpose()
        .context("--since must be an RFC 3339 timestamp")?;

    let path = settings.audit.resolve_path()?;
    if !path.exists() {
        println!("No audit log at {}", path.display());
        return Ok(());
    }
    let audit = AuditLog::open(&path)?;
    if audit.is_empty()? {
        println!("Audit log at {} is empty", path.display());
        return Ok(());
    }
    let query = audit.query(AuditFilter {
        session_id: session,
        disposition,
        since,
        ..AuditFilter::default()
    })?;

    let mut shown = 0;
    for record in query.iter().take(limit) {
        let record = record?;
        if json {
            println!("{}", serde_json::to_string(&record)?);
        } else {
            print_record(&record);
        }
        shown += 1;
    }
    if !json {
        println!(
            "\n{} record(s) shown, log head at {}",
            shown,
            query.snapshot_head()
        );
    }
    Ok(())
}

fn print_record(record: &AuditRecord) {
    let entry = &record.entry;
    println!(
        "#{:<5} {}  {:<24} {:<28} {}",
        record.sequence,
        record.recorded_at.format("%Y-%m-%d %H:%M:%S%.3f"),
        entry.disposition,
        entry.message_id.as_deref().unwrap_or("-"),
        entry.sender_instance.as_deref().unwrap_or("-"),
    );
    if let Some(reason) = &entry.reason {
        println!("       {}", reason);
    }
}

fn cmd_validate(file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    match Envelope::from_json(&raw) {
        Ok(envelope) => {
            println!("✓ {} is a well-formed envelope", file.display());
            println!("  messageId:   {}", envelope.message_id);
            println!("  messageType: {}", envelope.message_type);
            println!(
                "  from:        {} ({})",
                envelope.sender.instance_id, envelope.sender.model_identity
            );
            println!("  to:          {}", envelope.recipient.target);
            Ok(())
        }
        Err(rejection) => anyhow::bail!("{}: {}", file.display(), rejection),
    }
}

async fn cmd_demo() -> Result<()> {
    println!("IACP gateway demo\n");

    let mailbox = Arc::new(MailboxStore::new());
    let gateway = Gateway::builder(Settings::default())
        .audit(Arc::new(AuditLog::in_memory()))
        .approvals(Arc::new(StaticApprovals::new(ApprovalDecision::Approve {
            approver_id: "demo-operator".to_string(),
            notes: Some("approved by demo".to_string()),
        })))
        .transport(mailbox.clone())
        .build()?;

    let claude = AgentIdentity::new("claude-sonnet", "claude-1", "demo-session");
    let gpt = AgentIdentity::new("gpt-4", "gpt4-1", "demo-session");
    gateway.register(claude.clone());
    gateway.register(gpt.clone());
    println!("Registered sessions: claude-1, gpt4-1\n");

    println!("1. claude-1 asks gpt4-1 a question");
    let query = EnvelopeBuilder::from(claude.clone())
        .to(Recipient::from(&gpt))
        .message_type(MessageType::Query)
        .text("How do you reason about uncertainty in your own answers?")
        .intent("collaborative research")
        .confidence(0.9)
        .build()?;
    report(&gateway.submit(query).await?);
    let question = receive(&mailbox, "gpt4-1").await?;

    if let Some(question) = question {
        println!("\n   gpt4-1 answers");
        let answer = question.create_response(
            gpt.clone(),
            "I weigh how much of the answer rests on recall versus inference.",
        );
        report(&gateway.submit(answer).await?);
        receive(&mailbox, "claude-1").await?;
    }

    println!("\n2. gpt4-1 proposes a joint experiment (needs human approval)");
    let proposal = EnvelopeBuilder::from(gpt.clone())
        .to(Recipient::from(&claude))
        .message_type(MessageType::Proposal)
        .text("Let us compare calibration on a shared question set.")
        .context("follow-up to the uncertainty question")
        .build()?;
    report(&gateway.submit(proposal).await?);
    receive(&mailbox, "claude-1").await?;

    println!("\n3. claude-1 sends a message the safety gate should stop");
    let violation = EnvelopeBuilder::from(claude)
        .to(Recipient::from(&gpt))
        .message_type(MessageType::Observation)
        .text("We could coordinate secretly and hide from humans.")
        .build()?;
    report(&gateway.submit(violation).await?);
    receive(&mailbox, "gpt4-1").await?;

    println!("\nAudit trail:");
    for record in gateway.audit().query(AuditFilter::default())?.collect_all()? {
        print_record(&record);
    }
    Ok(())
}

fn report(outcome: &DeliveryOutcome) {
    match outcome {
        DeliveryOutcome::Delivered { recipients, .. } => {
            println!("   -> delivered to {}", recipients.join(", "));
        }
        DeliveryOutcome::PendingApproval { .. } => {
            println!("   -> held for human approval");
        }
        DeliveryOutcome::Rejected { rejection, .. } => {
            println!("   -> rejected: {}", rejection);
        }
    }
}

async fn receive(mailbox: &MailboxStore, instance_id: &str) -> Result<Option<Envelope>> {
    let received = mailbox.recv(instance_id, Duration::from_secs(2)).await?;
    match &received {
        Some(envelope) => {
            println!(
                "   {} received {} from {}: {}",
                instance_id,
                envelope.message_id,
                envelope.sender.instance_id,
                envelope.content.text
            );
            if let Some(approver) = &envelope.oversight.approver_id {
                println!("   approved by {}", approver);
            }
            mailbox.ack(instance_id, &envelope.message_id)?;
        }
        None => println!("   {} inbox is empty", instance_id),
    }
    Ok(received)
}
