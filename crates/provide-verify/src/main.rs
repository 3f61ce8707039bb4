//! provide-verify
//!
//! Command-line front end: prepare a Kubo repository and verify it, watch an
//! arbitrary node command, or print Kademlia identifiers for a CID list.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use provide_verify::{
    CidEntry, Identifier, KuboRepo, MembershipIndex, NodeCommand, VerificationReport, Verifier,
    VerifierConfig, config::EMPTY_DIR_CID, identifier::format_prefix, logging, one_per_prefix,
    parse_cid_list,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "provide-verify")]
#[command(about = "Verify that a DHT node advertises every content item it holds")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Print the final report as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Seconds between progress samples
    #[arg(long, global = true)]
    poll_interval: Option<u64>,

    /// Seconds without a new root advertisement before diagnosing a stall
    #[arg(long, global = true)]
    stall_threshold: Option<u64>,

    /// Kademlia prefix bits used to group missing items
    #[arg(long, global = true)]
    prefix_bits: Option<u8>,

    /// After every root is advertised, keep the node running and report the
    /// advertisement-count distribution until Ctrl-C
    #[arg(long, global = true)]
    keep_monitoring: bool,

    /// Interval between distribution reports while keep-monitoring (e.g. 30s, 5m)
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    distribution_interval: Option<Duration>,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a directory into a fresh Kubo repository and verify its daemon
    Run {
        #[arg(long)]
        files: PathBuf,

        #[arg(long)]
        repo: Option<PathBuf>,

        #[arg(long)]
        ipfs: Option<PathBuf>,

        /// Reuse the peer identity of the existing repository
        #[arg(long)]
        keep_identity: bool,
    },

    /// Verify an arbitrary node command against CID lists
    Watch {
        /// Root CIDs, one per line, optionally followed by a label
        #[arg(long)]
        roots: PathBuf,

        /// Other locally held CIDs
        #[arg(long)]
        locals: Option<PathBuf>,

        #[arg(long)]
        sentinel: Option<String>,

        /// Node command and its arguments
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Print the Kademlia identifier of every CID in a list
    KadIds {
        #[arg(long)]
        cids: PathBuf,

        /// Keep only the first CID of each Kademlia prefix (see --prefix-bits)
        #[arg(long)]
        one_per_prefix: bool,
    },
}

fn load_config(cli: &Cli) -> Result<VerifierConfig> {
    let mut config = match &cli.config {
        Some(path) => VerifierConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => VerifierConfig::default(),
    };
    if let Some(secs) = cli.poll_interval {
        config.poll_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = cli.stall_threshold {
        config.stall_threshold = Duration::from_secs(secs);
    }
    if let Some(bits) = cli.prefix_bits {
        config.prefix_bits = bits;
    }
    if cli.keep_monitoring {
        config.keep_monitoring = true;
    }
    if let Some(interval) = cli.distribution_interval {
        config.distribution_interval = interval;
    }
    config.validate()?;
    Ok(config)
}

fn read_cid_file(path: &Path) -> Result<Vec<CidEntry>> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(parse_cid_list(&text))
}

fn print_report(report: &VerificationReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        println!("{report}");
    }
    Ok(())
}

async fn verify(
    config: VerifierConfig,
    index: MembershipIndex,
    command: &NodeCommand,
    json: bool,
) -> Result<()> {
    let verifier = Verifier::new(config, index);
    match verifier.run(command).await {
        Ok(report) => {
            info!("Verification complete");
            print_report(&report, json)
        }
        Err(e) => {
            if let Some(report) = e.partial_report() {
                print_report(report, json)?;
            }
            Err(e.into())
        }
    }
}

async fn run_kubo(
    mut config: VerifierConfig,
    files: &Path,
    repo: Option<PathBuf>,
    ipfs: Option<PathBuf>,
    keep_identity: bool,
    json: bool,
) -> Result<()> {
    if let Some(repo) = repo {
        config.kubo.repo = repo;
    }
    if let Some(ipfs) = ipfs {
        config.kubo.binary = ipfs;
    }

    if keep_identity && config.kubo.identity.is_none() {
        config.kubo.identity = KuboRepo::new(config.kubo.clone()).read_identity().await?;
        if config.kubo.identity.is_none() {
            warn!("No identity found in {}, a new one will be generated", config.kubo.repo.display());
        }
    }

    let repo = KuboRepo::new(config.kubo.clone());
    repo.init().await?;
    let added = repo.add_dir(files).await?;
    if let Err(e) = repo.unpin(EMPTY_DIR_CID).await {
        warn!("Could not unpin the empty directory: {}", e);
    }
    let locals = repo.local_items(&added).await;

    let roots: Vec<CidEntry> = added
        .files
        .iter()
        .map(|cid| CidEntry {
            cid: cid.clone(),
            label: None,
        })
        .collect();
    let (index, skipped) = MembershipIndex::from_content_ids(&roots, &locals, Some(EMPTY_DIR_CID));
    if !skipped.is_empty() {
        warn!("{} identifiers were skipped", skipped.len());
    }

    let command = repo.daemon_command(&config);
    verify(config, index, &command, json).await
}

async fn watch(
    config: VerifierConfig,
    roots: &Path,
    locals: Option<&Path>,
    sentinel: Option<&str>,
    command: &[String],
    json: bool,
) -> Result<()> {
    let roots = read_cid_file(roots)?;
    let locals: Vec<String> = match locals {
        Some(path) => read_cid_file(path)?.into_iter().map(|e| e.cid).collect(),
        None => Vec::new(),
    };
    let (index, skipped) = MembershipIndex::from_content_ids(&roots, &locals, sentinel);
    if !skipped.is_empty() {
        warn!("{} identifiers were skipped", skipped.len());
    }

    let (program, args) = command
        .split_first()
        .context("a node command is required after --")?;
    let command = NodeCommand::new(program).args(args.iter().cloned());
    verify(config, index, &command, json).await
}

fn kad_ids(cids: &Path, one_per_prefix_bits: Option<u8>) -> Result<()> {
    let entries = read_cid_file(cids)?;
    if let Some(bits) = one_per_prefix_bits {
        let selected = one_per_prefix(&entries, bits);
        for (prefix, (entry, kad_id)) in &selected {
            println!("{} {} {}", format_prefix(*prefix, bits), kad_id.to_hex(), entry.cid);
        }
        info!("Selected {}/{} prefixes", selected.len(), 1u64 << bits);
        return Ok(());
    }

    for entry in entries {
        match Identifier::from_content_id(&entry.cid) {
            Ok(id) => println!("{} {}", id.kad_id().to_hex(), entry.cid),
            Err(e) => warn!("Skipping {}", e),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let config = load_config(&cli)?;

    match &cli.command {
        Commands::Run {
            files,
            repo,
            ipfs,
            keep_identity,
        } => {
            run_kubo(
                config,
                files,
                repo.clone(),
                ipfs.clone(),
                *keep_identity,
                cli.json,
            )
            .await
        }
        Commands::Watch {
            roots,
            locals,
            sentinel,
            command,
        } => {
            watch(
                config,
                roots,
                locals.as_deref(),
                sentinel.as_deref(),
                command,
                cli.json,
            )
            .await
        }
        Commands::KadIds {
            cids,
            one_per_prefix,
        } => kad_ids(cids, one_per_prefix.then_some(config.prefix_bits)),
    }
}
