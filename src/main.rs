mod backup;
mod bash_parser;
mod chain_runner;
mod condition;
mod config;
mod display;
mod error;
mod executor;
mod fuzzy_matcher;
mod i18n;
mod integrity;
mod logging;
mod storage;
mod store_manager;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use bash_parser::validate_command;
use chain_runner::ChainRunner;
use config::Config;
use error::SaveError;
use executor::{CancelToken, StepExecutor, SystemShell};
use i18n::I18n;
use storage::{ChainDefinition, ChainDependency, ChainStep, EditKind, NewCommand};
use store_manager::{split_list, CommandStore, StoreConfig};

#[derive(Parser)]
#[command(name = "save")]
#[command(version, about = "Save, tag and replay shell commands; run them as dependency-ordered chains")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a command and record it
    Run {
        /// Tags to attach (comma separated)
        #[arg(long, value_delimiter = ',')]
        tag: Vec<String>,
        /// Description of the command
        #[arg(long)]
        desc: Option<String>,
        /// Remember the current directory and replay the command there
        #[arg(long)]
        dir: bool,
        /// Command to execute (wrap commands with pipes in quotes)
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Re-execute a saved command
    Rerun { id: u64 },
    /// Show the most recent commands
    List {
        /// How many to show [default: display.list_limit]
        n: Option<usize>,
    },
    /// Search commands, descriptions and tags
    Search { query: String },
    /// Commands saved with --dir in the given directory
    FilterDir { path: PathBuf },
    /// Commands carrying a tag
    FilterTag { tag: String },
    /// Tags by usage
    ListTags,
    /// Favorite commands with details
    Favorites,
    /// History statistics
    Stats,
    /// Mark a command as favorite
    Favorite {
        id: u64,
        /// Clear the favorite mark instead
        #[arg(long)]
        unset: bool,
    },
    /// Set a command's description
    Describe {
        id: u64,
        #[arg(required = true)]
        text: Vec<String>,
    },
    /// Add tags (comma separated)
    AddTags { id: u64, tags: String },
    /// Remove tags (comma separated)
    RemoveTags { id: u64, tags: String },
    /// Edit a command interactively
    Edit { id: u64 },
    /// Undo the last edit of a command
    Undo { id: u64 },
    /// Remove commands (comma separated IDs)
    Remove {
        ids: String,
        /// Do not ask for confirmation
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Import commands from a JSON file
    Import { file: PathBuf },
    /// Export commands to a JSON file
    Export { file: PathBuf },
    /// Manage and run command chains
    Chain {
        #[command(subcommand)]
        action: ChainAction,
    },
    /// Back up commands and chains
    Backup { path: Option<PathBuf> },
    /// Restore commands and chains from a backup
    Restore {
        file: PathBuf,
        /// Do not ask for confirmation
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// List backups in the backup directory
    ListBackups,
    /// Check the history file for inconsistencies
    Verify,
    /// Fix what verify reports, where possible
    Repair,
    /// Show where history and config are stored
    ConfigPath,
}

#[derive(Subcommand)]
enum ChainAction {
    /// Create a chain from step and dependency JSON files
    Create {
        name: String,
        #[arg(default_value = "")]
        description: String,
        /// JSON array of steps
        #[arg(long)]
        steps: Option<PathBuf>,
        /// JSON array of dependencies
        #[arg(long)]
        deps: Option<PathBuf>,
    },
    /// List chains
    List,
    /// Run a chain and its dependencies
    Run {
        id: u64,
        /// Report a failure as a warning and exit successfully
        #[arg(long)]
        continue_on_error: bool,
        /// Per-step timeout in seconds [default: execution.step_timeout_secs]
        #[arg(long)]
        timeout: Option<u64>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::new() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{} {:#}", "error:".red().bold(), err);
            return ExitCode::FAILURE;
        }
    };
    logging::init_logging(&config.logging);
    let i18n = I18n::new(&config.get_effective_language());

    match run(cli, &config, &i18n) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {}", i18n.t("error_prefix").red().bold(), report(&err));
            ExitCode::FAILURE
        }
    }
}

/// Store errors already carry their causes in the message.
fn report(err: &anyhow::Error) -> String {
    match err.downcast_ref::<SaveError>() {
        Some(e) => e.to_string(),
        None => format!("{:#}", err),
    }
}

fn cancel_on_ctrlc() -> CancelToken {
    let token = CancelToken::new();
    let handler_token = token.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        tracing::warn!(error = %e, "could not install Ctrl-C handler");
    }
    token
}

fn run(cli: Cli, config: &Config, i18n: &I18n) -> Result<()> {
    let mut store = CommandStore::open(StoreConfig::from_config(config))?;

    match cli.command {
        Commands::Run { tag, desc, dir, command } => {
            let raw = command.join(" ");
            validate_command(&raw)?;
            let working_dir = if dir {
                Some(std::env::current_dir().context(i18n.t("error_current_dir"))?)
            } else {
                None
            };

            cancel_on_ctrlc();
            let shell = SystemShell::new(&config.execution.shell);
            let exit_code = shell
                .run_interactive(&raw, None)
                .with_context(|| i18n.t("error_execute_command"))?;

            let new = NewCommand {
                raw,
                working_dir,
                tags: tag,
                description: desc.unwrap_or_default(),
            };
            let id = store.record_execution(new, exit_code)?;
            println!("{}", i18n.t_format("command_saved", &[&id.to_string()]).green());
            if exit_code != 0 {
                bail!(i18n.t_format("command_exit_code", &[&exit_code.to_string()]));
            }
        }
        Commands::Rerun { id } => {
            let command = store.command(id)?.clone();
            println!("{} {}", i18n.t("rerunning").cyan(), command.raw.bold());

            cancel_on_ctrlc();
            let shell = SystemShell::new(&config.execution.shell);
            let exit_code = shell
                .run_interactive(&command.raw, command.working_dir.as_deref())
                .with_context(|| i18n.t("error_execute_command"))?;
            store.record_run(id, exit_code)?;
            if exit_code != 0 {
                bail!(i18n.t_format("command_exit_code", &[&exit_code.to_string()]));
            }
            println!("{}", i18n.t_format("command_completed", &[&id.to_string()]).green());
        }
        Commands::List { n } => {
            let limit = n.unwrap_or(config.display.list_limit);
            display::print_commands(&store.recent(limit), i18n);
        }
        Commands::Search { query } => {
            let results = store.search(&query);
            if results.is_empty() {
                println!("{}", i18n.t_format("no_search_results", &[&query]).yellow());
            } else {
                println!("{}", i18n.t_format("search_results", &[&results.len().to_string()]));
                display::print_commands(&results, i18n);
            }
        }
        Commands::FilterDir { path } => {
            display::print_commands(&store.filter_by_dir(&path), i18n);
        }
        Commands::FilterTag { tag } => {
            display::print_commands(&store.filter_by_tag(&tag), i18n);
        }
        Commands::ListTags => display::print_tags(&store.tag_counts(), i18n),
        Commands::Favorites => {
            let favorites = store.favorites();
            if favorites.is_empty() {
                println!("{}", i18n.t("no_favorites").yellow());
            }
            for command in favorites {
                display::print_command_details(command, i18n);
            }
        }
        Commands::Stats => {
            display::print_statistics(&store.statistics(), store.commands().len(), i18n);
        }
        Commands::Favorite { id, unset } => {
            store.set_favorite(id, !unset)?;
            let key = if unset { "favorite_cleared" } else { "favorite_set" };
            println!("{}", i18n.t_format(key, &[&id.to_string()]).green());
        }
        Commands::Describe { id, text } => {
            store.set_description(id, &text.join(" "))?;
            println!("{}", i18n.t_format("description_updated", &[&id.to_string()]).green());
        }
        Commands::AddTags { id, tags } => {
            store.manipulate_tags(id, &split_list(&tags), &[])?;
            println!("{}", i18n.t_format("tags_updated", &[&id.to_string()]).green());
        }
        Commands::RemoveTags { id, tags } => {
            store.manipulate_tags(id, &[], &split_list(&tags))?;
            println!("{}", i18n.t_format("tags_updated", &[&id.to_string()]).green());
        }
        Commands::Edit { id } => {
            let stdin = io::stdin();
            let mut input = stdin.lock();
            let mut out = io::stdout();
            store.interactive_edit(id, &mut input, &mut out, i18n)?;
            println!("{}", i18n.t_format("command_updated", &[&id.to_string()]).green());
        }
        Commands::Undo { id } => {
            let kind = store.undo_last_edit(id)?;
            let kind = match kind {
                EditKind::TagManipulation => i18n.t("edit_kind_tags"),
                EditKind::InteractiveEdit => i18n.t("edit_kind_interactive"),
                EditKind::Description => i18n.t("edit_kind_description"),
            };
            println!("{}", i18n.t_format("edit_undone", &[&kind, &id.to_string()]).green());
        }
        Commands::Remove { ids, yes } => {
            let ids = parse_ids(&ids, i18n)?;
            if !yes && !confirm(&i18n.t_format("confirm_remove", &[&ids.len().to_string()]), i18n)? {
                println!("{}", i18n.t("aborted").yellow());
                return Ok(());
            }
            let removed = store.remove_commands(&ids)?;
            println!("{}", i18n.t_format("commands_removed", &[&removed.to_string()]).green());
        }
        Commands::Import { file } => {
            let count = store.import_commands(&file)?;
            println!("{}", i18n.t_format("commands_imported", &[&count.to_string()]).green());
        }
        Commands::Export { file } => {
            let count = store.export_commands(&file)?;
            println!(
                "{}",
                i18n.t_format("commands_exported", &[&count.to_string(), &file.display().to_string()]).green()
            );
        }
        Commands::Chain { action } => run_chain_action(action, &mut store, config, i18n)?,
        Commands::Backup { path } => {
            let path = store.create_backup(path.as_deref())?;
            println!("{}", i18n.t_format("backup_created", &[&path.display().to_string()]).green());
        }
        Commands::Restore { file, yes } => {
            if !yes && !confirm(&i18n.t_format("confirm_restore", &[&file.display().to_string()]), i18n)? {
                println!("{}", i18n.t("aborted").yellow());
                return Ok(());
            }
            let meta = store.restore_backup(&file)?;
            println!(
                "{}",
                i18n.t_format(
                    "backup_restored",
                    &[&meta.command_count.to_string(), &meta.chain_count.to_string(), &meta.version]
                )
                .green()
            );
        }
        Commands::ListBackups => display::print_backups(&store.list_backups()?, i18n),
        Commands::Verify => {
            let issues = store.verify_integrity();
            if issues.is_empty() {
                println!("{}", i18n.t("integrity_ok").green());
            } else {
                for issue in &issues {
                    println!("  {} {}", "-".red(), issue);
                }
                bail!(i18n.t_format("integrity_issues", &[&issues.len().to_string()]));
            }
        }
        Commands::Repair => {
            let repairs = store.repair_integrity()?;
            println!("{}", i18n.t_format("integrity_repaired", &[&repairs.to_string()]).green());
            let remaining = store.verify_integrity();
            if !remaining.is_empty() {
                for issue in &remaining {
                    println!("  {} {}", "-".red(), issue);
                }
                bail!(i18n.t_format("integrity_issues", &[&remaining.len().to_string()]));
            }
        }
        Commands::ConfigPath => {
            println!("{}: {}", i18n.t("label_history_file"), store.path().display());
            println!("{}: {}", i18n.t("label_backup_dir"), config.backup_dir().display());
            println!("{}: {}", i18n.t("label_config_file"), Config::get_config_path().display());
        }
    }

    Ok(())
}

fn run_chain_action(action: ChainAction, store: &mut CommandStore, config: &Config, i18n: &I18n) -> Result<()> {
    match action {
        ChainAction::Create { name, description, steps, deps } => {
            let steps: Vec<ChainStep> = match steps {
                Some(path) => read_json(&path, i18n)?,
                None => Vec::new(),
            };
            let dependencies: Vec<ChainDependency> = match deps {
                Some(path) => read_json(&path, i18n)?,
                None => Vec::new(),
            };
            let id = store.create_chain(ChainDefinition {
                name,
                description,
                steps,
                dependencies,
            })?;
            println!("{}", i18n.t_format("chain_created", &[&id.to_string()]).green());
        }
        ChainAction::List => display::print_chains(store.chains(), i18n),
        ChainAction::Run { id, continue_on_error, timeout } => {
            let step_timeout = timeout.filter(|secs| *secs > 0).map(Duration::from_secs).or(config.step_timeout());
            let cancel = cancel_on_ctrlc();
            let shell = SystemShell::new(&config.execution.shell);
            let executor = StepExecutor::new(&shell, cancel);

            println!("{}", i18n.t_format("chain_starting", &[&id.to_string()]).cyan());
            let result = ChainRunner::new(store, executor).with_step_timeout(step_timeout).run(id);
            match result {
                Ok(()) => println!("{}", i18n.t_format("chain_succeeded", &[&id.to_string()]).green()),
                Err(err) => {
                    let failure = chain_failure(&err, continue_on_error);
                    if let Some(output) = &failure.output {
                        println!("{}", i18n.t("captured_output").red().bold());
                        println!("{}", output.trim_end());
                    }
                    match failure.severity {
                        Severity::Warning => {
                            eprintln!("{} {}", i18n.t("warning_prefix").yellow().bold(), failure.message)
                        }
                        Severity::Error => return Err(err.into()),
                    }
                }
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    /// Reported on stderr; the process still exits 0.
    Warning,
    /// Propagated to `main`, which exits 1.
    Error,
}

/// How a failed chain run is reported.
#[derive(Debug, PartialEq, Eq)]
struct ChainFailure {
    severity: Severity,
    message: String,
    output: Option<String>,
}

fn chain_failure(err: &SaveError, continue_on_error: bool) -> ChainFailure {
    ChainFailure {
        severity: if continue_on_error { Severity::Warning } else { Severity::Error },
        message: err.to_string(),
        output: err.captured_output().map(str::to_string),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, i18n: &I18n) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| i18n.t_format("error_read_file", &[&path.display().to_string()]))?;
    serde_json::from_str(&content).with_context(|| i18n.t_format("error_parse_file", &[&path.display().to_string()]))
}

fn parse_ids(text: &str, i18n: &I18n) -> Result<Vec<u64>> {
    let ids = split_list(text)
        .iter()
        .map(|part| {
            part.parse::<u64>()
                .map_err(|_| SaveError::validation(i18n.t_format("invalid_id", &[part.as_str()])))
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if ids.is_empty() {
        bail!(SaveError::validation(i18n.t("no_ids_given")));
    }
    Ok(ids)
}

fn confirm(question: &str, i18n: &I18n) -> Result<bool> {
    print!("{} {}", question.yellow(), i18n.t("confirm_hint"));
    io::stdout().flush().ok();
    let mut input = String::new();
    if io::stdin().read_line(&mut input).is_err() {
        return Ok(false);
    }
    let answer = input.trim().to_lowercase();
    Ok(answer == "y" || answer == "yes")
}
