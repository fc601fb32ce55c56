/*
 * This file is part of helmgate.
 *
 * Copyright (C) 2025 helmgate contributors
 *
 * helmgate is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * helmgate is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with helmgate. If not, see <https://www.gnu.org/licenses/>.
 */

//! Command Line Interface
//!
//! Every command works directly on the device's files, the same ones the
//! daemon uses; the daemon notices authorization table edits on its own.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{debug, warn};

use hg_core::durable;
use hg_core::{
    load_config, load_config_from, AuthorizationStore, CardKey, CardSyncer, Clock, DeviceConfig,
    EventFilter, EventJournal, HttpTransport, SystemClock, Transport, UploadOutcome, UploadScheduler,
};
use hg_protocol::validate_period_tag;

#[derive(Parser)]
#[command(name = "helmgate")]
#[command(version)]
#[command(about = "helmgate - card + helmet access checkpoint tooling")]
#[command(long_about = "helmgate - card + helmet access checkpoint tooling

Inspect and maintain the files of a helmgate checkpoint. The device process
(helmgated) keeps running while these commands are used.

EXAMPLES:
    helmgate query                        Events of the current month
    helmgate query --period 202508 --helmet no
    helmgate add-card 148 19828 \"Ana Ruiz\"
    helmgate add-card 148 19828 Ana --disabled
    helmgate manifest --verify            Check the audit log against its manifest
    helmgate sync-cards                   Pull the authorization table now
    helmgate upload --period 202508       Push a month's audit log now

ENVIRONMENT VARIABLES:
    HELMGATE_CONFIG    Configuration file (default /etc/helmgate/config.json)
    HELMGATE_LOG       Log filter (trace, debug, info, warn, error)")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file to use instead of the resolved one
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List audit log events
    Query(QueryArgs),

    /// Append a row to the authorization table
    AddCard {
        /// Site code (facility) of the card
        site: u8,
        /// User code (card number)
        user: u16,
        /// Holder name
        name: String,
        /// Revoke the card instead of enabling it
        #[arg(long)]
        disabled: bool,
    },

    /// Recompute a period's integrity manifest
    Manifest {
        /// Period tag (YYYYMM), current month by default
        #[arg(long)]
        period: Option<String>,
        /// Only check the stored manifest, do not rewrite it
        #[arg(long)]
        verify: bool,
    },

    /// Pull the authorization table from the remote service
    SyncCards,

    /// Upload a period's audit log, ignoring the cooldown
    Upload {
        /// Period tag (YYYYMM), current month by default
        #[arg(long)]
        period: Option<String>,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Args)]
pub struct QueryArgs {
    /// Period tag (YYYYMM), current month by default
    #[arg(long)]
    pub period: Option<String>,
    /// Only this site code
    #[arg(long)]
    pub site: Option<u8>,
    /// Only this user code
    #[arg(long)]
    pub user: Option<u16>,
    /// Only events with (yes) or without (no) a helmet
    #[arg(long, value_enum)]
    pub helmet: Option<HelmetArg>,
    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HelmetArg {
    Yes,
    No,
}

impl QueryArgs {
    pub fn filter(&self) -> EventFilter {
        EventFilter {
            site: self.site,
            user: self.user,
            helmet: self.helmet.map(|h| h == HelmetArg::Yes),
        }
    }
}

/// Load the configuration and run the selected command
pub fn run_cli(cli: &Cli, out: &mut dyn Write) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => load_config_from(path),
        None => load_config(),
    }
    .context("loading configuration")?;
    execute_command(&cli.command, &config, out)
}

pub fn execute_command(cmd: &Commands, config: &DeviceConfig, out: &mut dyn Write) -> anyhow::Result<()> {
    match cmd {
        Commands::Query(args) => cmd_query(config, args, out),
        Commands::AddCard { site, user, name, disabled } => {
            cmd_add_card(config, CardKey::new(*site, *user), name, !disabled, out)
        }
        Commands::Manifest { period, verify } => cmd_manifest(config, period.as_deref(), *verify, out),
        Commands::SyncCards => {
            let transport = HttpTransport::new(&config.server)?;
            cmd_sync_cards(config, &transport, out)
        }
        Commands::Upload { period } => {
            let transport = HttpTransport::new(&config.server)?;
            cmd_upload(config, period.as_deref(), &transport, out)
        }
        Commands::Config => cmd_config(config, out),
    }
}

/// Period to operate on: the given tag, or the one containing "now"
pub fn resolve_period(config: &DeviceConfig, explicit: Option<&str>) -> anyhow::Result<String> {
    if !config.monthly_rotation {
        if explicit.is_some_and(|p| !p.is_empty()) {
            warn!("Monthly rotation is off, ignoring --period");
        }
        return Ok(String::new());
    }
    match explicit {
        Some(tag) => {
            validate_period_tag(tag).map_err(|e| anyhow::anyhow!("{}: {:?}", e, tag))?;
            Ok(tag.to_string())
        }
        None => Ok(config.period_for(&SystemClock::new().local_now())),
    }
}

fn period_label(period: &str) -> &str {
    if period.is_empty() {
        "(unrotated)"
    } else {
        period
    }
}

// ============================================================================
// Query Command
// ============================================================================

pub fn cmd_query(config: &DeviceConfig, args: &QueryArgs, out: &mut dyn Write) -> anyhow::Result<()> {
    let period = resolve_period(config, args.period.as_deref())?;
    let journal = EventJournal::new(config);
    let records = journal.query(&period, &args.filter())?;
    debug!(period = %period, count = records.len(), "Query complete");

    if args.json {
        serde_json::to_writer_pretty(&mut *out, &records)?;
        writeln!(out)?;
        return Ok(());
    }

    for rec in &records {
        let card = match (rec.site_code, rec.user_code) {
            (Some(site), Some(user)) => format!("{}:{}", site, user),
            _ => "-".to_string(),
        };
        writeln!(
            out,
            "{}  {:<12} {:<20} {:<7} {:<7} {:.2}  {}",
            rec.timestamp,
            card,
            if rec.nombre.is_empty() { "-" } else { rec.nombre.as_str() },
            if rec.autorizado { "granted" } else { "denied" },
            if rec.casco { "helmet" } else { "none" },
            rec.score,
            rec.img_path,
        )?;
    }
    writeln!(out, "{} event(s) in {}", records.len(), period_label(&period))?;
    Ok(())
}

// ============================================================================
// Authorization Table Commands
// ============================================================================

pub fn cmd_add_card(
    config: &DeviceConfig,
    key: CardKey,
    name: &str,
    enabled: bool,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    durable::ensure_dir(&config.state_dir)?;
    let store = AuthorizationStore::open(config.cards_csv())?;
    store.append(key, name, enabled)?;

    let state = if enabled { "enabled" } else { "disabled" };
    match store.lookup(key) {
        Some(holder) => writeln!(out, "Card {} ({}) {}", key, holder, state)?,
        None => writeln!(out, "Card {} {}", key, state)?,
    }
    writeln!(out, "{} card(s) authorized in {}", store.len(), store.path().display())?;
    Ok(())
}

pub fn cmd_sync_cards(config: &DeviceConfig, transport: &dyn Transport, out: &mut dyn Write) -> anyhow::Result<()> {
    let syncer = CardSyncer::new(config);
    if !syncer.is_configured() {
        bail!("server.cards_url is not set in the configuration");
    }
    durable::ensure_dir(&config.state_dir)?;

    let outcome = syncer
        .ensure_updated(transport, || {})
        .context("pulling the authorization table")?;
    if outcome.updated {
        writeln!(out, "Authorization table updated to version {}", outcome.version)?;
    } else {
        writeln!(out, "Authorization table already at version {}", outcome.version)?;
    }
    Ok(())
}

// ============================================================================
// Audit Log Commands
// ============================================================================

pub fn cmd_manifest(
    config: &DeviceConfig,
    period: Option<&str>,
    verify: bool,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let period = resolve_period(config, period)?;
    let journal = EventJournal::new(config);

    if verify {
        if journal.verify_manifest(&period)? {
            writeln!(out, "Manifest of {} matches the audit log", period_label(&period))?;
            return Ok(());
        }
        bail!("manifest of {} is missing or does not match the audit log", period_label(&period));
    }

    let manifest = journal.recompute_manifest(&period, &SystemClock::new().local_now())?;
    serde_json::to_writer_pretty(&mut *out, &manifest)?;
    writeln!(out)?;
    Ok(())
}

pub fn cmd_upload(
    config: &DeviceConfig,
    period: Option<&str>,
    transport: &dyn Transport,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let period = resolve_period(config, period)?;
    let journal = EventJournal::new(config);
    if journal.csv_path(&period).exists() {
        journal.recompute_manifest(&period, &SystemClock::new().local_now())?;
    }

    match UploadScheduler::new(config).upload(&journal, &period, transport) {
        UploadOutcome::Replied { status, response } if response.is_verified() => {
            writeln!(out, "Uploaded {} (HTTP {}), verified by the server", period_label(&period), status)?;
            Ok(())
        }
        UploadOutcome::Replied { status, response } => {
            bail!("server did not verify the upload (HTTP {}, ok={})", status, response.ok)
        }
        UploadOutcome::Unparsed { status, excerpt } => {
            bail!("unreadable server reply (HTTP {}): {}", status, excerpt.unwrap_or_default())
        }
        UploadOutcome::MissingFiles { csv, manifest } => {
            bail!("nothing to upload for {} (csv present: {}, manifest present: {})", period_label(&period), csv, manifest)
        }
        UploadOutcome::NotConfigured => bail!("server.function_url and server.edge_api_key must both be set"),
        UploadOutcome::Failed(reason) => bail!("upload failed: {}", reason),
        UploadOutcome::CoolingDown => bail!("upload not attempted"),
    }
}

// ============================================================================
// Config Command
// ============================================================================

pub fn cmd_config(config: &DeviceConfig, out: &mut dyn Write) -> anyhow::Result<()> {
    let mut shown = config.clone();
    if shown.server.edge_api_key.is_some() {
        shown.server.edge_api_key = Some("********".into());
    }
    serde_json::to_writer_pretty(&mut *out, &shown)?;
    writeln!(out)?;
    Ok(())
}
