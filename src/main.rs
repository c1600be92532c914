use clap::{ArgAction, Parser, Subcommand};
use gitsyncer::daemon::config::Settings;
use gitsyncer::daemon::errors::Result;
use gitsyncer::daemon::git_ops::DEFAULT_HISTORY_LIMIT;
use gitsyncer::daemon::manager::{SyncManager, SyncOutcome};
use gitsyncer::daemon::repo_config::RepoEntry;
use gitsyncer::daemon::scheduler::{self, Scheduler, CHECK_INTERVAL};
use log::{error, info, warn};
use std::error::Error;
use std::fmt::Display;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio::{signal, task};

/// Scheduled pull/push for local git working copies.
#[derive(Parser)]
#[command(name = "gitsyncer", version)]
struct Cli {
    /// Settings file to use instead of the per-user one
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Keep settings in ./config.json
    #[arg(long, global = true)]
    portable: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run scheduled jobs until Ctrl-C
    Daemon,
    #[command(flatten)]
    Action(Action),
}

/// One-shot commands against the settings file and the active repository.
#[derive(Subcommand)]
enum Action {
    /// Working tree status of the active repository
    Status,
    /// Recent commits of the active repository
    History {
        #[arg(short = 'n', long, default_value_t = DEFAULT_HISTORY_LIMIT)]
        limit: usize,
    },
    /// Fetch origin and merge it into the current branch
    Pull {
        /// Every registered repository
        #[arg(long)]
        all: bool,
        /// Skip the confirmation prompt before a batch
        #[arg(short, long)]
        yes: bool,
    },
    /// Commit every change and push the current branch to origin
    Push {
        /// Every registered repository
        #[arg(long)]
        all: bool,
        /// Skip the confirmation prompt before a batch
        #[arg(short, long)]
        yes: bool,
    },
    /// Make a working copy active without registering it
    Open { path: PathBuf },
    /// Manage registered repositories
    #[command(subcommand)]
    Repo(RepoCommand),
    /// Daily pull/push times
    #[command(subcommand)]
    Schedule(ScheduleCommand),
    /// Other preferences
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum RepoCommand {
    List,
    Add {
        path: PathBuf,
        /// Display name, defaults to the folder name
        #[arg(long)]
        name: Option<String>,
    },
    Remove {
        index: usize,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Select an entry by index, or `all`
    Select {
        #[arg(value_parser = parse_target)]
        target: Target,
    },
}

#[derive(Subcommand)]
enum ScheduleCommand {
    Show,
    Set {
        /// Daily pull time, HH:MM
        #[arg(long)]
        pull: String,
        /// Daily push time, HH:MM
        #[arg(long)]
        push: String,
    },
    Enable,
    Disable,
}

#[derive(Subcommand)]
enum ConfigCommand {
    Show,
    CommitMessage { message: String },
    Background {
        #[arg(action = ArgAction::Set)]
        enabled: bool,
    },
    Autostart {
        #[arg(action = ArgAction::Set)]
        enabled: bool,
    },
}

#[derive(Clone, Debug)]
enum Target {
    All,
    Index(usize),
}

fn parse_target(s: &str) -> std::result::Result<Target, String> {
    if s.eq_ignore_ascii_case("all") {
        return Ok(Target::All);
    }
    s.parse()
        .map(Target::Index)
        .map_err(|_| format!("expected an index or `all`, got '{s}'"))
}

fn settings_path(cli: &Cli) -> PathBuf {
    match (&cli.config, cli.portable) {
        (Some(path), _) => path.clone(),
        (None, true) => Settings::portable_path(),
        (None, false) => Settings::default_path(),
    }
}

fn confirm(question: &str) -> bool {
    print!("{question} [y/N] ");
    if io::stdout().flush().is_err() {
        return false;
    }

    let mut answer = String::new();
    if io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn confirm_removal(entry: &RepoEntry) -> bool {
    confirm(&format!("Remove '{}' ({})?", entry.name, entry.path.display()))
}

fn confirm_batch(op: &str, entries: &[RepoEntry]) -> bool {
    println!("{op} will run on every registered repository:");
    for entry in entries {
        println!("  {} ({})", entry.name, entry.path.display());
    }
    confirm(&format!("{op} all {}?", entries.len()))
}

fn print_outcome<T: Display>(outcome: SyncOutcome<T>) {
    match outcome {
        SyncOutcome::Single(outcome) => println!("{outcome}"),
        SyncOutcome::Batch(report) => println!("{report}"),
    }
}

fn list_repositories(manager: &SyncManager) {
    let settings = manager.settings();
    if settings.repositories.is_empty() {
        println!("No repositories registered");
        return;
    }

    for (index, entry) in settings.repositories.iter().enumerate() {
        let marker = if settings.current_repo_index == Some(index) { '*' } else { ' ' };
        println!("{marker} {index}: {} ({})", entry.name, entry.path.display());
    }
    if settings.all_selected {
        println!("* all");
    }
}

fn show_schedule(settings: &Settings) {
    let state = if settings.auto_sync_enabled { "enabled" } else { "disabled" };
    println!("Auto sync {state}");
    println!("  pull: daily at {}", settings.pull_time);
    println!("  push: daily at {}", settings.push_time);
}

fn run_action(mut manager: SyncManager, action: Action) -> Result<()> {
    match action {
        Action::Status => println!("{}", manager.status()?),
        Action::History { limit } => {
            let commits = manager.history(limit)?;
            if commits.is_empty() {
                println!("No commits yet");
            }
            for commit in commits {
                println!("{commit}\n");
            }
        }
        Action::Pull { all, yes } => {
            let proceed = |entries: &[RepoEntry]| yes || confirm_batch("Pull", entries);
            if all {
                println!("{}", manager.pull_all(proceed)?);
            } else {
                print_outcome(manager.pull_selected(proceed)?);
            }
        }
        Action::Push { all, yes } => {
            let proceed = |entries: &[RepoEntry]| yes || confirm_batch("Push", entries);
            if all {
                println!("{}", manager.push_all(proceed)?);
            } else {
                print_outcome(manager.push_selected(proceed)?);
            }
        }
        Action::Open { path } => {
            let path = manager.open_path(&path)?;
            println!("Repository: {}", path.display());
        }
        Action::Repo(RepoCommand::List) => list_repositories(&manager),
        Action::Repo(RepoCommand::Add { path, name }) => {
            let entry = manager.add_repository(&path, name.as_deref())?;
            println!("Added '{}' ({})", entry.name, entry.path.display());
        }
        Action::Repo(RepoCommand::Remove { index, yes }) => {
            let entry = manager.remove_repository(index, |entry| yes || confirm_removal(entry))?;
            println!("Removed '{}'", entry.name);
        }
        Action::Repo(RepoCommand::Select { target: Target::Index(index) }) => {
            let entry = manager.select_repository(index)?;
            println!("Selected '{}' ({})", entry.name, entry.path.display());
        }
        Action::Repo(RepoCommand::Select { target: Target::All }) => {
            manager.select_all();
            println!("All repositories selected, `pull` and `push` now run over every entry");
        }
        Action::Schedule(ScheduleCommand::Show) => show_schedule(manager.settings()),
        Action::Schedule(ScheduleCommand::Set { pull, push }) => {
            let schedule = manager.set_schedule(&pull, &push)?;
            println!("Pull at {}, push at {}", schedule.pull, schedule.push);
        }
        Action::Schedule(ScheduleCommand::Enable) => {
            manager.set_auto_sync(true)?;
            show_schedule(manager.settings());
        }
        Action::Schedule(ScheduleCommand::Disable) => {
            manager.set_auto_sync(false)?;
            show_schedule(manager.settings());
        }
        Action::Config(ConfigCommand::Show) => {
            println!("# {}", manager.settings_path().display());
            println!("{}", serde_json::to_string_pretty(manager.settings())?);
        }
        Action::Config(ConfigCommand::CommitMessage { message }) => {
            manager.set_commit_message(&message)
        }
        Action::Config(ConfigCommand::Background { enabled }) => {
            manager.set_run_in_background(enabled)
        }
        Action::Config(ConfigCommand::Autostart { enabled }) => manager.set_auto_start(enabled),
    }
    Ok(())
}

async fn current_settings(manager: &Arc<Mutex<SyncManager>>) -> Result<Settings> {
    let manager = manager.clone();
    let settings = task::spawn_blocking(move || {
        let mut manager = manager.lock().unwrap_or_else(PoisonError::into_inner);
        manager.reload();
        manager.settings().clone()
    })
    .await?;
    Ok(settings)
}

async fn run_daemon(manager: SyncManager) -> Result<()> {
    info!("Settings: {}", manager.settings_path().display());
    if !manager.settings().auto_sync_enabled {
        info!("Auto sync is off, waiting for `gitsyncer schedule enable`");
    }
    let manager = Arc::new(Mutex::new(manager));

    let (requests, jobs) = mpsc::unbounded_channel();
    let worker = scheduler::spawn_worker(jobs, manager.clone());
    let mut scheduler = Scheduler::new(requests);

    // follow `schedule` commands issued while running
    let mut ticker = time::interval(CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut rejected = false;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let settings = current_settings(&manager).await?;
                let before = scheduler.schedule();
                match scheduler.sync_with(&settings) {
                    Ok(()) => {
                        rejected = false;
                        if scheduler.schedule() != before {
                            info!("{}", scheduler.describe());
                        }
                    }
                    Err(e) if !rejected => {
                        warn!("Auto sync stays off: {e}");
                        rejected = true;
                    }
                    Err(_) => {}
                }
            }
            res = signal::ctrl_c() => {
                res?;
                info!("Shutting down");
                break;
            }
        }
    }

    // the worker drains once the scheduler and its loop are gone
    drop(scheduler);
    worker.await?;
    Ok(())
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let path = settings_path(&cli);
    let manager = task::spawn_blocking(move || SyncManager::open(path)).await?;

    let res = match cli.command {
        Command::Daemon => run_daemon(manager).await,
        // libgit2 and the prompts block, keep them off the runtime threads
        Command::Action(action) => {
            task::spawn_blocking(move || run_action(manager, action)).await?
        }
    };

    if let Err(e) = res {
        error!("{e}");
        process::exit(1);
    }
    Ok(())
}
