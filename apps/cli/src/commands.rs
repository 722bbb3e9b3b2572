//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use gapwise_core::System;
use gapwise_shared::{
    AppConfig, EquipmentType, FeedbackPolarity, FeedbackSignal, GapwiseError, InsertOutcome,
    KnowledgeUnit, ProposalStatus, Query, QuerySource, Response, ValidationStatus, Vendor,
    config_file_path, init_config, load_config,
};
use gapwise_storage::Storage;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use tracing::info;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Gapwise: answer maintenance questions and research what the knowledge base lacks.
#[derive(Parser)]
#[command(
    name = "gapwise",
    version,
    about = "Route industrial-maintenance questions, score the answers, and fill knowledge gaps.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Answer one question.
    Ask {
        /// The technician's question.
        text: String,

        /// Text read from a photo of the equipment (nameplate, HMI screen).
        #[arg(long)]
        image_text: Option<String>,

        /// The question was transcribed from voice.
        #[arg(long)]
        voice: bool,

        #[arg(long)]
        channel: Option<String>,

        #[arg(long)]
        user: Option<String>,

        /// Print the full response as JSON.
        #[arg(long)]
        json: bool,

        /// Exit without waiting for triggered research. Research still in
        /// flight is abandoned; its gap stays in the audit log.
        #[arg(long)]
        no_wait: bool,
    },

    /// Record technician feedback on a knowledge unit.
    #[command(args_conflicts_with_subcommands = true)]
    Feedback {
        #[command(subcommand)]
        action: Option<FeedbackAction>,

        /// Atom id.
        atom_id: Option<String>,

        /// positive or negative.
        polarity: Option<String>,
    },

    /// Knowledge units.
    Atoms {
        #[command(subcommand)]
        action: AtomsAction,
    },

    /// Research proposals awaiting review.
    Proposals {
        #[command(subcommand)]
        action: ProposalsAction,
    },

    /// Detected knowledge gaps.
    Gaps {
        #[command(subcommand)]
        action: GapsAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub(crate) enum FeedbackAction {
    /// Clear an atom's low-satisfaction flag.
    Reset { atom_id: String },
}

#[derive(Subcommand)]
pub(crate) enum AtomsAction {
    /// Import atoms from a JSON array file.
    Import { file: PathBuf },
    /// List atoms, newest first.
    List {
        #[arg(long, default_value = "20")]
        limit: u32,
    },
}

#[derive(Subcommand)]
pub(crate) enum ProposalsAction {
    /// List proposals (pending by default).
    List {
        /// pending, approved, rejected, inserted, or all.
        #[arg(long, default_value = "pending")]
        status: String,
    },
    /// Approve a proposal and insert its atom.
    Approve { id: String },
    /// Reject a proposal.
    Reject { id: String },
}

#[derive(Subcommand)]
pub(crate) enum GapsAction {
    /// Show the gap audit log, newest first.
    List {
        #[arg(long, default_value = "20")]
        limit: u32,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. Logs go to stderr so `--json`
/// output stays parseable.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "gapwise=info",
        1 => "gapwise=debug",
        _ => "gapwise=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Ask {
            text,
            image_text,
            voice,
            channel,
            user,
            json,
            no_wait,
        } => {
            let mut query = Query::new(text);
            if let Some(image_text) = image_text {
                query = query.with_image_text(image_text);
            }
            if voice {
                query = query.with_source(QuerySource::Voice);
            }
            if let Some(channel) = channel {
                query = query.with_channel(channel);
            }
            if let Some(user) = user {
                query = query.with_user(user);
            }
            cmd_ask(query, json, !no_wait).await
        }
        Command::Feedback {
            action,
            atom_id,
            polarity,
        } => match (action, atom_id, polarity) {
            (Some(FeedbackAction::Reset { atom_id }), _, _) => cmd_feedback_reset(&atom_id).await,
            (None, Some(atom_id), Some(polarity)) => cmd_feedback(&atom_id, &polarity).await,
            _ => Err(eyre!(
                "usage: gapwise feedback <atom-id> <positive|negative> | gapwise feedback reset <atom-id>"
            )),
        },
        Command::Atoms { action } => match action {
            AtomsAction::Import { file } => cmd_atoms_import(&file).await,
            AtomsAction::List { limit } => cmd_atoms_list(limit).await,
        },
        Command::Proposals { action } => match action {
            ProposalsAction::List { status } => cmd_proposals_list(&status).await,
            ProposalsAction::Approve { id } => cmd_proposals_approve(&id).await,
            ProposalsAction::Reject { id } => cmd_proposals_reject(&id).await,
        },
        Command::Gaps { action } => match action {
            GapsAction::List { limit } => cmd_gaps_list(limit).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn start_system() -> Result<System> {
    let config = load_config()?;
    let path = config_file_path().ok().filter(|p| p.exists());
    Ok(System::start(config, path).await?)
}

async fn open_store(config: &AppConfig) -> Result<Storage> {
    let path = config.store.resolved_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| GapwiseError::io(parent, e))?;
    }
    Ok(Storage::open(&path).await?)
}

fn spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed}]") {
        spinner.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

fn print_response(response: &Response) {
    println!();
    println!("{}", response.text.trim());
    println!();

    if !response.citations.is_empty() {
        println!("  Sources:");
        for citation in &response.citations {
            println!("    - {citation}");
        }
    }
    for qualifier in &response.qualifiers {
        println!("  Note: {qualifier}");
    }

    println!(
        "  Route: {}  Specialist: {}  Latency: {}ms",
        response.route, response.specialist, response.latency_ms
    );
    if let Some(confidence) = &response.confidence {
        let s = &confidence.scores;
        println!(
            "  Confidence: {:.2} (relevance {:.2}, completeness {:.2}, accuracy {:.2}, safety {:.2}, clarity {:.2})",
            confidence.overall, s.relevance, s.completeness, s.accuracy, s.safety, s.clarity
        );
        for warning in &confidence.warnings {
            println!("    ! {warning}");
        }
    }
    if response.degraded {
        println!("  Degraded: primary path failed, fallback answered");
    }
    if let Some(gap_id) = &response.gap_id {
        println!("  Research queued for gap {gap_id}");
    }
    println!(
        "  Tokens: {}  Est. cost: ${:.4}",
        response.tokens_used, response.cost_usd
    );
    println!();
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_ask(query: Query, json: bool, wait_for_research: bool) -> Result<()> {
    let system = start_system().await?;
    info!(query_id = %query.id, "answering query");

    let response = system.orchestrator.answer(&query).await;
    if json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print_response(&response);
    }

    if response.research_triggered && wait_for_research {
        let progress = spinner("Researching knowledge gap");
        system.dispatcher.wait_idle().await;
        progress.finish_and_clear();
        if !json {
            println!("  Research finished. Review proposals with `gapwise proposals list`.");
        }
    }

    let abandoned = system.dispatcher.in_flight();
    if abandoned > 0 {
        tracing::warn!(abandoned, "exiting with gap research in flight; it will not complete");
    }

    let dropped = system.dropped_traces();
    if dropped > 0 {
        tracing::warn!(dropped, "trace queue overflowed");
    }
    system.shutdown().await;
    Ok(())
}

async fn cmd_feedback(atom_id: &str, polarity: &str) -> Result<()> {
    let polarity: FeedbackPolarity = polarity.parse()?;
    let system = start_system().await?;
    let config = system.config.snapshot();

    let signal = FeedbackSignal {
        atom_id: atom_id.to_string(),
        polarity,
    };
    let outcome = system.feedback.record(&signal, &config).await?;
    println!(
        "Recorded. {atom_id}: {} positive / {} negative",
        outcome.stats.success_count, outcome.stats.failure_count
    );

    if let (Some(gap), Some(fill)) = (outcome.gap, outcome.fill) {
        println!("Low satisfaction: researching a replacement (gap {})", gap.id);
        let progress = spinner("Researching knowledge gap");
        let filled = fill.await.ok().flatten();
        progress.finish_and_clear();
        match filled {
            Some(filled) => println!(
                "Research via {}: {} inserted, {} pending review",
                filled.backend,
                filled.inserted.len(),
                filled.pending.len()
            ),
            None => println!("Research did not produce results; see logs."),
        }
    }

    system.shutdown().await;
    Ok(())
}

async fn cmd_feedback_reset(atom_id: &str) -> Result<()> {
    let system = start_system().await?;
    system.feedback.reset(atom_id).await?;
    println!("Feedback flag cleared for {atom_id}");
    system.shutdown().await;
    Ok(())
}

/// One entry of an atoms import file.
#[derive(Debug, Deserialize)]
struct AtomSeed {
    title: String,
    content: String,
    #[serde(default = "generic_vendor")]
    vendor: Vendor,
    #[serde(default = "unknown_equipment")]
    equipment: EquipmentType,
    #[serde(default)]
    source_url: Option<String>,
    #[serde(default)]
    validated: bool,
}

fn generic_vendor() -> Vendor {
    Vendor::Generic
}

fn unknown_equipment() -> EquipmentType {
    EquipmentType::Unknown
}

async fn cmd_atoms_import(file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file).map_err(|e| GapwiseError::io(file, e))?;
    let seeds: Vec<AtomSeed> = serde_json::from_str(&content)
        .wrap_err_with(|| format!("invalid atoms file {}", file.display()))?;

    let config = load_config()?;
    let storage = open_store(&config).await?;

    let (mut inserted, mut duplicates) = (0usize, 0usize);
    for seed in seeds {
        let mut atom = KnowledgeUnit::new(seed.title, seed.content, seed.vendor, seed.equipment);
        if let Some(url) = seed.source_url {
            atom = atom.with_source(url);
        }
        if seed.validated {
            atom = atom.with_validation(ValidationStatus::Validated);
        }
        match storage.insert_atom(&atom).await? {
            InsertOutcome::Inserted => inserted += 1,
            InsertOutcome::Duplicate => duplicates += 1,
        }
    }

    info!(inserted, duplicates, file = %file.display(), "atoms imported");
    println!("Imported {inserted} atoms ({duplicates} duplicates skipped)");
    Ok(())
}

async fn cmd_atoms_list(limit: u32) -> Result<()> {
    let config = load_config()?;
    let storage = open_store(&config).await?;
    let atoms = storage.list_atoms(limit).await?;
    if atoms.is_empty() {
        println!("No atoms. Import some with `gapwise atoms import <file.json>`.");
        return Ok(());
    }

    for atom in atoms {
        let rate = atom
            .success_rate()
            .map(|r| format!("{:.0}%", r * 100.0))
            .unwrap_or_else(|| "-".into());
        println!(
            "{}  [{}/{}] {:<10} {}  (success {rate})",
            atom.id,
            atom.vendor,
            atom.equipment,
            atom.validation.as_str(),
            atom.title
        );
    }
    Ok(())
}

async fn cmd_proposals_list(status: &str) -> Result<()> {
    let filter = match status {
        "all" => None,
        other => Some(other.parse::<ProposalStatus>()?),
    };

    let config = load_config()?;
    let storage = open_store(&config).await?;
    let proposals = storage.list_proposals(filter).await?;
    if proposals.is_empty() {
        println!("No {status} proposals.");
        return Ok(());
    }

    for proposal in proposals {
        println!(
            "{}  {:<9} conf {:.2}  gap {}  {}",
            proposal.id,
            proposal.status.as_str(),
            proposal.confidence,
            proposal.gap_id,
            proposal.unit.title
        );
        if let Some(url) = &proposal.unit.source_url {
            println!("    {url}");
        }
    }
    Ok(())
}

async fn cmd_proposals_approve(id: &str) -> Result<()> {
    let config = load_config()?;
    let storage = open_store(&config).await?;
    match storage.approve_proposal(id).await? {
        InsertOutcome::Inserted => println!("Approved {id}; atom inserted."),
        InsertOutcome::Duplicate => println!("Approved {id}; an identical atom already exists."),
    }
    Ok(())
}

async fn cmd_proposals_reject(id: &str) -> Result<()> {
    let config = load_config()?;
    let storage = open_store(&config).await?;
    storage.reject_proposal(id).await?;
    println!("Rejected {id}.");
    Ok(())
}

async fn cmd_gaps_list(limit: u32) -> Result<()> {
    let config = load_config()?;
    let storage = open_store(&config).await?;
    let gaps = storage.list_gaps(limit).await?;
    if gaps.is_empty() {
        println!("No gaps recorded.");
        return Ok(());
    }

    for gap in gaps {
        println!(
            "{}  {:<8} {:<20} {:<6} {}",
            gap.detected_at.format("%Y-%m-%d %H:%M"),
            gap.priority.as_str(),
            gap.gap_type.as_str(),
            gap.coverage_level.as_str(),
            gap.query_text
        );
        println!("    terms: {}", gap.search_terms.join(" | "));
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
