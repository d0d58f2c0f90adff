//! Delegation Engine: delegation chain resolution and override.
//!
//! Given a user and a poll (or no poll, for global delegation), the engine
//! determines who, or what terminal target, actually casts that user's
//! voting power. It walks a mutable graph of delegation edges while
//! guaranteeing that:
//!
//! - a user's own direct vote preempts any delegate, immediately;
//! - no delegation cycle is ever accepted, and none loops silently at read time;
//! - resolutions are cached and invalidated by writes, never served stale
//!   once the write has returned;
//! - concentration of power is observable through soft-cap signals.
//!
//! # Architecture
//!
//! ## The Thin Waist
//!
//! All state mutations route through `DbBroker` (serialized per database,
//! audited to `broker.events.jsonl`), then invalidate the resolution cache
//! before returning.
//!
//! ## Read path
//!
//! `ResolutionService::resolve` is a cache lookup (fast path) or a single
//! batched store snapshot, an override check and a CPU-only graph walk
//! (slow path). Read-time anomalies come back as typed `unresolved`
//! terminals, not errors.
//!
//! # Examples
//!
//! ```bash
//! delegation-engine init
//! delegation-engine target add user alice
//! delegation-engine target add user bob
//! delegation-engine edge add alice bob
//! delegation-engine resolve alice --poll budget-2027
//! delegation-engine vote cast alice budget-2027
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: errors, configuration, SQLite pool and broker, schemas, time
//! - [`engine`]: walker, override gate, cache, concentration monitor,
//!   resolution service and write path

pub mod cli;
pub mod core;
pub mod engine;
mod subsystems;

pub use cli::Cli;

use crate::cli::{Command, EdgeCommand, OutputFormat, TargetCommand, VoteCommand};
use crate::core::error::EngineError;
use crate::core::store::Store;
use crate::core::time;
use crate::engine::Engine;
use crate::engine::model::{NewEdge, TargetRef};
use crate::engine::service::EngineStats;
use chrono::Utc;
use clap::Parser;
use colored::Colorize;
use serde_json::json;

/// Parse the command line and run it.
pub fn run() -> Result<(), EngineError> {
    run_with(Cli::parse())
}

pub fn run_with(cli: Cli) -> Result<(), EngineError> {
    let store = Store::new(cli.root);

    if let Command::Init = cli.command {
        let initialized = subsystems::initialize_all_dbs(&store.root)?;
        emit(&time::command_envelope(
            "init",
            "ok",
            json!({
                "root": store.root.to_string_lossy(),
                "subsystems": initialized,
            }),
        ))?;
        return Ok(());
    }

    let engine = Engine::open(&store)?;
    match cli.command {
        Command::Init => unreachable!("handled above"),
        Command::Target(target) => match target.command {
            TargetCommand::Add { kind, id, name } => {
                let target = TargetRef::new(kind, id);
                let name = name.unwrap_or_else(|| target.id().to_string());
                let receipt = engine.ledger.register_target(&target, &name)?;
                emit(&time::command_envelope("target.add", "ok", json!({ "receipt": receipt })))?;
            }
            TargetCommand::Deactivate { kind, id } => {
                let receipt = engine.ledger.set_target_active(&TargetRef::new(kind, id), false)?;
                emit(&time::command_envelope(
                    "target.deactivate",
                    "ok",
                    json!({ "receipt": receipt }),
                ))?;
            }
            TargetCommand::Show { kind, id } => {
                let target = TargetRef::new(kind, id);
                let metadata = engine
                    .service
                    .target(&target)?
                    .ok_or_else(|| EngineError::NotFound(format!("target {target}")))?;
                emit(&time::command_envelope("target.show", "ok", json!({ "target": metadata })))?;
            }
        },
        Command::Edge(edge) => match edge.command {
            EdgeCommand::Add {
                delegator,
                target,
                kind,
                poll,
                mode,
                anonymous,
                start,
                end,
            } => {
                let new = NewEdge {
                    delegator_id: delegator,
                    target: TargetRef::new(kind, target),
                    poll_id: poll,
                    mode,
                    is_anonymous: anonymous,
                    start_date: start,
                    end_date: end,
                };
                let receipt = engine.ledger.create_edge(&new)?;
                emit(&time::command_envelope("edge.add", "ok", json!({ "receipt": receipt })))?;
            }
            EdgeCommand::Revoke { edge_id } => {
                let receipt = engine.ledger.revoke_edge(&edge_id)?;
                emit(&time::command_envelope("edge.revoke", "ok", json!({ "receipt": receipt })))?;
            }
            EdgeCommand::List { delegator, poll } => {
                let edges = engine.service.outgoing_edges(&delegator, poll.as_deref())?;
                emit(&time::command_envelope("edge.list", "ok", json!({ "edges": edges })))?;
            }
        },
        Command::Vote(vote) => match vote.command {
            VoteCommand::Cast { user, poll } => {
                let receipt = engine.ledger.cast_vote(&user, &poll)?;
                emit(&time::command_envelope("vote.cast", "ok", json!({ "receipt": receipt })))?;
            }
        },
        Command::Sweep => {
            let report = engine.ledger.sweep_expired(Utc::now())?;
            emit(&time::command_envelope("sweep", "ok", json!({ "report": report })))?;
        }
        Command::Resolve {
            delegator,
            poll,
            public,
        } => {
            let resolution = if public {
                engine.service.resolve_public(&delegator, poll.as_deref())?
            } else {
                engine.service.resolve(&delegator, poll.as_deref())?
            };
            emit(&time::command_envelope(
                "resolve",
                "ok",
                json!({ "resolution": resolution }),
            ))?;
        }
        Command::Tally { poll, delegators } => {
            let resolutions = engine.service.resolve_many(&delegators, Some(&poll))?;
            let stats = engine.service.stats(Some(&poll))?;
            emit(&time::command_envelope(
                "tally",
                "ok",
                json!({
                    "resolutions": resolutions,
                    "concentration": stats.concentration,
                }),
            ))?;
        }
        Command::Stats { poll, format } => {
            let stats = engine.service.stats(poll.as_deref())?;
            match format {
                OutputFormat::Json => {
                    emit(&time::command_envelope("stats", "ok", json!({ "stats": stats })))?;
                }
                OutputFormat::Text => print_stats(&stats),
            }
        }
        Command::Slo => {
            let report = engine.service.slo_report();
            emit(&time::command_envelope("slo", "ok", json!({ "report": report })))?;
        }
    }
    Ok(())
}

fn emit(value: &serde_json::Value) -> Result<(), EngineError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_stats(stats: &EngineStats) {
    let poll = stats.poll_id.as_deref().unwrap_or("global");
    println!("{} {}", "poll".bold(), poll.bright_white().bold());
    println!("  active edges       {}", stats.active_edge_count);
    println!(
        "  resolved chains    {} ({} unresolved)",
        stats.concentration.resolved, stats.concentration.unresolved
    );
    println!(
        "  soft cap           {:.1}%",
        stats.concentration.threshold * 100.0
    );
    if stats.concentration.shares.is_empty() {
        println!("  {}", "no cached resolutions".dimmed());
        return;
    }
    for share in &stats.concentration.shares {
        let pct = format!("{:>6.2}%", share.share * 100.0);
        let pct = if share.above_cap {
            pct.red().bold()
        } else {
            pct.green()
        };
        println!("  {} {} ({})", pct, share.target, share.count);
    }
}
