use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use claudio::config::Config;
use claudio::plan::{parse_plan_text, validate_plan, PlanGraph, Severity};
use claudio::process::{LivenessProbe, ProcessProbe};
use claudio::session::{Instance, RecoveryManager, SessionId, SessionManager, SessionStore};
use claudio::tmux::TmuxProbe;
use claudio::ultraplan::{PlanningStrategy, UltraPlanSession};
use claudio::{clog, clog_error, Error, Result};

/// Claudio - crash-safe session state and planning for parallel agents
#[derive(Parser, Debug)]
#[command(name = "claudio")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    CLAUDIO_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to .claudio/claudio.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Repository to operate on (defaults to the current directory)
    #[arg(short = 'C', long, global = true)]
    pub repo: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Inspect and repair persisted sessions
    #[command(subcommand)]
    Sessions(SessionsCommand),

    /// Validate and order plan files
    #[command(subcommand)]
    Plan(PlanCommand),

    /// Inspect UltraPlan state
    #[command(subcommand)]
    Ultraplan(UltraplanCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum SessionsCommand {
    /// List sessions with instance counts and lock holders
    List {
        #[arg(long)]
        json: bool,
    },

    /// Check session files for corruption (all sessions if no id is given)
    Validate { session_id: Option<String> },

    /// Show recovery candidates, or recover one session
    Recover { session_id: Option<String> },

    /// Remove stale locks from every session
    Clean {
        /// Also delete unlocked sessions that have no instances
        #[arg(long)]
        empty: bool,
    },

    /// Remove a session's lock
    Unlock {
        session_id: String,

        /// Remove the lock even if its owner is still running
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum PlanCommand {
    /// Validate a plan file
    Validate {
        file: PathBuf,

        /// Print the validation result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the execution order of a plan file
    Order { file: PathBuf },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum UltraplanCommand {
    /// Show planning progress for a session
    Status { session_id: String },

    /// Attach planning state for an objective to a session (single- or
    /// multi-pass per `[ultraplan] multi_pass`)
    Init {
        session_id: String,
        objective: String,

        /// Replace existing planning state
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        clog_error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let start = match cli.repo {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let config = Config::discover(&start)?.with_debug(cli.debug);
    claudio::log::init_with_debug(&config.log_path(), config.debug);
    clog!("claudio {:?} base_dir={}", cli.command, config.base_dir.display());

    match cli.command {
        Command::Sessions(cmd) => run_sessions(&config, cmd),
        Command::Plan(PlanCommand::Validate { file, json }) => run_plan_validate(&file, json),
        Command::Plan(PlanCommand::Order { file }) => run_plan_order(&file),
        Command::Ultraplan(UltraplanCommand::Status { session_id }) => {
            run_ultraplan_status(&config, &session_id)
        }
        Command::Ultraplan(UltraplanCommand::Init {
            session_id,
            objective,
            force,
        }) => run_ultraplan_init(&config, &session_id, &objective, force),
    }
}

fn run_sessions(config: &Config, cmd: SessionsCommand) -> Result<()> {
    let store = SessionStore::from_config(config);
    let recovery = RecoveryManager::new(store.clone());

    match cmd {
        SessionsCommand::List { json } => {
            let infos = store.list()?;
            if json {
                let rows: Vec<serde_json::Value> = infos
                    .iter()
                    .map(|i| {
                        serde_json::json!({
                            "id": i.id,
                            "name": i.name,
                            "created": i.created,
                            "instance_count": i.instance_count,
                            "locked_by": i.locked_by,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
                return Ok(());
            }
            if infos.is_empty() {
                println!("No sessions in {}", store.sessions_dir().display());
                return Ok(());
            }
            for info in infos {
                let lock = match &info.locked_by {
                    Some(holder) => format!("locked by pid {} on {}", holder.pid, holder.hostname),
                    None => "unlocked".to_string(),
                };
                println!(
                    "{}  {:<24} {:>3} instance(s)  {}  {}",
                    info.id.short(),
                    info.name,
                    info.instance_count,
                    info.created.format("%Y-%m-%d %H:%M"),
                    lock
                );
            }
            Ok(())
        }

        SessionsCommand::Validate { session_id } => {
            let ids = match session_id {
                Some(id) => vec![SessionId::parse(&id)?],
                None => store.list_ids()?,
            };
            let mut bad = 0;
            for id in &ids {
                match recovery.validate_session(id) {
                    Ok(()) => println!("ok       {}", id),
                    Err(e) => {
                        bad += 1;
                        println!("invalid  {}: {}", id, e);
                    }
                }
            }
            if bad > 0 {
                return Err(Error::Validation(format!(
                    "{} of {} session(s) failed validation",
                    bad,
                    ids.len()
                )));
            }
            Ok(())
        }

        SessionsCommand::Recover { session_id: Some(id) } => {
            let id = SessionId::parse(&id)?;
            let result = recovery.recover_session(&id)?;
            match (result.lock_removed, result.previous_holder) {
                (true, Some(holder)) => println!(
                    "Removed stale lock of pid {} on {} from {}",
                    holder.pid, holder.hostname, id
                ),
                (true, None) => println!("Removed unreadable lock from {}", id),
                (false, _) => println!("Session {} has no lock to recover", id),
            }
            Ok(())
        }

        SessionsCommand::Recover { session_id: None } => {
            let candidates = recovery.check_for_recovery()?;
            if candidates.is_empty() {
                println!("No sessions need recovery");
                return Ok(());
            }
            println!("Sessions needing recovery: {}", candidates.len());
            for c in candidates {
                println!(
                    "   • {} {}: {}",
                    c.session_id,
                    c.name.as_deref().unwrap_or("(no session file)"),
                    c.reason
                );
            }
            println!();
            println!("Run `claudio sessions recover <id>` or `claudio sessions clean`.");
            Ok(())
        }

        SessionsCommand::Clean { empty } => {
            let cleaned = recovery.cleanup_stale()?;
            println!("Removed {} stale lock(s)", cleaned);
            if empty {
                let removed = recovery.cleanup_empty_sessions()?;
                println!("Deleted {} empty session(s)", removed.len());
                for id in removed {
                    println!("   • {}", id);
                }
            }
            Ok(())
        }

        SessionsCommand::Unlock { session_id, force } => {
            let id = SessionId::parse(&session_id)?;
            if force {
                let removed = store.locks().force_release(&id)?;
                println!(
                    "{}",
                    if removed { "Lock removed" } else { "No lock present" }
                );
                return Ok(());
            }
            let result = recovery.recover_session(&id)?;
            println!(
                "{}",
                if result.lock_removed { "Lock removed" } else { "No lock present" }
            );
            Ok(())
        }
    }
}

fn read_plan_file(file: &Path) -> Result<claudio::plan::PlanSpec> {
    let text = fs::read_to_string(file)?;
    parse_plan_text(&text, "")
}

fn run_plan_validate(file: &Path, json: bool) -> Result<()> {
    let plan = read_plan_file(file)?;
    let result = validate_plan(&plan);

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!(
            "{}: {} task(s), {} error(s), {} warning(s), {} info",
            file.display(),
            plan.tasks.len(),
            result.error_count,
            result.warning_count,
            result.info_count
        );
        for severity in [Severity::Error, Severity::Warning, Severity::Info] {
            for msg in result.by_severity(severity) {
                println!("  {}", msg);
            }
        }
    }

    if result.valid {
        Ok(())
    } else {
        Err(Error::ValidationFailed(result.errors().cloned().collect()))
    }
}

fn run_plan_order(file: &Path) -> Result<()> {
    let plan = read_plan_file(file)?;
    let layering = PlanGraph::build(&plan.tasks).execution_layers();

    for (i, layer) in layering.layers.iter().enumerate() {
        println!("Group {}: {}", i + 1, layer.join(", "));
    }
    if !layering.unscheduled.is_empty() {
        println!("Unschedulable (dependency cycle): {}", layering.unscheduled.join(", "));
        return Err(Error::Validation(format!(
            "{} task(s) could not be ordered",
            layering.unscheduled.len()
        )));
    }
    Ok(())
}

fn run_ultraplan_init(config: &Config, session_id: &str, objective: &str, force: bool) -> Result<()> {
    let manager = SessionManager::from_config(config);
    let mut attached = manager.attach(&SessionId::parse(session_id)?)?;
    if attached.session().ultra_plan.is_some() && !force {
        return Err(Error::AlreadyExists(format!(
            "UltraPlan state in session {} (use --force to replace)",
            session_id
        )));
    }

    let state = UltraPlanSession::from_config(objective, config);
    let mode = if state.strategy.is_multi_pass() {
        "multi-pass"
    } else {
        "single-pass"
    };
    clog!("UltraPlan {} initialised ({}) in session {}", state.id, mode, session_id);
    println!("UltraPlan {} ({}) ready in session {}", state.id, mode, session_id);
    attached.session_mut().ultra_plan = Some(state);
    attached.save()?;
    attached.detach()?;
    Ok(())
}

fn run_ultraplan_status(config: &Config, session_id: &str) -> Result<()> {
    let store = SessionStore::from_config(config);
    let session = store.load(&SessionId::parse(session_id)?)?;
    let Some(state) = &session.ultra_plan else {
        println!("Session {} has no UltraPlan state", session.id);
        return Ok(());
    };

    let tmux = TmuxProbe::new(&config.tmux_prefix);
    let liveness = |instance: &Instance| -> &'static str {
        let running = if instance.pid.is_some() {
            ProcessProbe.is_running(instance)
        } else {
            tmux.is_running(instance)
        };
        if running {
            "running"
        } else {
            "finished"
        }
    };

    println!("UltraPlan {}", state.id);
    println!("  Objective: {}", state.objective);
    println!("  Phase:     {}", state.phase);
    if let Some(error) = &state.error {
        println!("  Error:     {}", error);
    }

    match &state.strategy {
        PlanningStrategy::SinglePass { coordinator_id } => {
            println!("  Mode:      single-pass");
            match coordinator_id.as_deref() {
                Some(id) => {
                    let status = session.find_instance(id).map(liveness).unwrap_or("missing");
                    println!("  Coordinator {}: {}", id, status);
                }
                None => println!("  Coordinator: not started"),
            }
        }
        PlanningStrategy::MultiPass(mp) => {
            println!("  Mode:      multi-pass ({} planner(s))", mp.planner_count());
            for (i, id) in mp.plan_coordinator_ids.iter().enumerate() {
                let status = if mp.is_processed(i) {
                    match mp.candidate_plans.get(i) {
                        Some(Some(plan)) => format!("plan with {} task(s)", plan.tasks.len()),
                        _ => "no usable plan".to_string(),
                    }
                } else {
                    session
                        .find_instance(id)
                        .map(liveness)
                        .unwrap_or("missing")
                        .to_string()
                };
                let strategy = config.strategies.get(i).map(String::as_str).unwrap_or("-");
                println!("    [{}] {} ({}): {}", i + 1, id, strategy, status);
            }
            match &mp.plan_manager_id {
                Some(id) => println!("  Evaluator: {}", id),
                None => println!("  Evaluator: not started"),
            }
        }
    }

    if let Some(plan) = &state.plan {
        println!("  Plan:      {} task(s) in {} group(s)", plan.tasks.len(), plan.execution_order.len());
    }
    Ok(())
}
