use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use crate::bash_parser::validate_command;
use crate::config::Config;
use crate::error::{Entity, Result, SaveError};
use crate::fuzzy_matcher::CommandMatcher;
use crate::i18n::I18n;
use crate::integrity::find_cycle_through;
use crate::storage::{
    percentage, Chain, ChainDefinition, Command, EditKind, EditRecord, NewCommand, StoreDocument,
};

/// Where the store lives and which build wrote it.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub backup_dir: PathBuf,
    pub version: String,
}

impl StoreConfig {
    pub fn from_config(config: &Config) -> Self {
        let path = config.history_path();
        let backup_dir = config.backup_dir();
        Self {
            path,
            backup_dir,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statistics {
    pub total_runs: u64,
    pub success_count: u64,
    pub success_rate: f64,
    pub favorite_count: usize,
    pub most_used_tags: Vec<String>,
    pub common_commands: Vec<String>,
}

pub struct CommandStore {
    pub(crate) config: StoreConfig,
    pub(crate) commands: Vec<Command>,
    pub(crate) chains: Vec<Chain>,
    pub(crate) edit_history: Vec<EditRecord>,
    pub(crate) last_command_id: u64,
    pub(crate) last_chain_id: u64,
}

impl CommandStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            commands: Vec::new(),
            chains: Vec::new(),
            edit_history: Vec::new(),
            last_command_id: 0,
            last_chain_id: 0,
        }
    }

    /// Creates the store and loads (or initializes) its file.
    pub fn open(config: StoreConfig) -> Result<Self> {
        let mut store = Self::new(config);
        store.load()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn load(&mut self) -> Result<()> {
        if let Some(dir) = self.config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| SaveError::storage(dir, e))?;
        }

        let content = match fs::read_to_string(&self.config.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.config.path.display(), "history file missing, creating it");
                return self.save();
            }
            Err(e) => return Err(SaveError::storage(&self.config.path, e)),
        };

        let document = if content.trim().is_empty() {
            StoreDocument::default()
        } else {
            StoreDocument::parse(&content)?
        };
        self.replace_contents(document);
        tracing::debug!(
            commands = self.commands.len(),
            chains = self.chains.len(),
            "history loaded"
        );
        Ok(())
    }

    /// Swaps in a new document and reseeds the ID counters from it.
    pub(crate) fn replace_contents(&mut self, document: StoreDocument) {
        self.commands = document.commands;
        self.chains = document.chains;
        self.edit_history = document.edit_history;

        for chain in &mut self.chains {
            // older documents only kept the rate
            if chain.success_count == 0 && chain.success_rate > 0.0 {
                let derived = (chain.success_rate * f64::from(chain.run_count) / 100.0).round();
                chain.success_count = (derived as u32).min(chain.run_count);
            }
        }

        self.last_command_id = self
            .last_command_id
            .max(self.commands.iter().map(|c| c.id).max().unwrap_or(0));
        self.last_chain_id = self
            .last_chain_id
            .max(self.chains.iter().map(|c| c.id).max().unwrap_or(0));
    }

    pub(crate) fn document(&self) -> StoreDocument {
        StoreDocument {
            commands: self.commands.clone(),
            chains: self.chains.clone(),
            edit_history: self.edit_history.clone(),
        }
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.document())?;
        fs::write(&self.config.path, content).map_err(|e| SaveError::storage(&self.config.path, e))
    }

    pub fn next_command_id(&mut self) -> u64 {
        self.last_command_id += 1;
        self.last_command_id
    }

    pub fn next_chain_id(&mut self) -> u64 {
        self.last_chain_id += 1;
        self.last_chain_id
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn chains(&self) -> &[Chain] {
        &self.chains
    }

    pub fn command(&self, id: u64) -> Result<&Command> {
        self.commands
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| SaveError::command_not_found(id))
    }

    fn command_mut(&mut self, id: u64) -> Result<&mut Command> {
        self.commands
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| SaveError::command_not_found(id))
    }

    pub fn chain(&self, id: u64) -> Result<&Chain> {
        self.chains
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| SaveError::chain_not_found(id))
    }

    fn remember_edit(&mut self, previous: Command, edit_type: EditKind) {
        self.edit_history.push(EditRecord {
            command_id: previous.id,
            timestamp: Utc::now(),
            previous,
            edit_type,
        });
    }

    // ---- commands ----

    /// Records a freshly executed command and returns its ID.
    pub fn record_execution(&mut self, new: NewCommand, exit_code: i32) -> Result<u64> {
        if new.raw.trim().is_empty() {
            return Err(SaveError::validation("command cannot be empty"));
        }
        let id = self.next_command_id();
        let succeeded = exit_code == 0;
        self.commands.push(Command {
            raw: new.raw,
            timestamp: Utc::now(),
            working_dir: new.working_dir,
            exit_code,
            id,
            tags: normalize_tags(new.tags),
            description: new.description,
            is_favorite: false,
            run_count: 1,
            success_count: u32::from(succeeded),
        });
        self.save()?;
        Ok(id)
    }

    /// Bumps run statistics after a replay or a chain dispatch.
    pub fn record_run(&mut self, id: u64, exit_code: i32) -> Result<()> {
        let command = self.command_mut(id)?;
        command.run_count += 1;
        if exit_code == 0 {
            command.success_count += 1;
        }
        command.exit_code = exit_code;
        self.save()
    }

    /// Removes every listed command; fails only when none of them exist.
    pub fn remove_commands(&mut self, ids: &[u64]) -> Result<usize> {
        let doomed: BTreeSet<u64> = ids.iter().copied().collect();
        let before = self.commands.len();
        self.commands.retain(|c| !doomed.contains(&c.id));
        let removed = before - self.commands.len();
        if removed == 0 {
            return Err(match ids.first() {
                Some(&id) if ids.len() == 1 => SaveError::command_not_found(id),
                _ => SaveError::validation("no commands found with the specified IDs"),
            });
        }
        self.edit_history.retain(|e| !doomed.contains(&e.command_id));
        self.save()?;
        Ok(removed)
    }

    pub fn set_favorite(&mut self, id: u64, favorite: bool) -> Result<()> {
        self.command_mut(id)?.is_favorite = favorite;
        self.save()
    }

    pub fn set_description(&mut self, id: u64, description: &str) -> Result<()> {
        let previous = self.command(id)?.clone();
        self.command_mut(id)?.description = description.trim().to_string();
        self.remember_edit(previous, EditKind::Description);
        self.save()
    }

    /// Adds then removes tags; the result is deduplicated and sorted.
    pub fn manipulate_tags(&mut self, id: u64, add: &[String], remove: &[String]) -> Result<()> {
        let previous = self.command(id)?.clone();
        let command = self.command_mut(id)?;
        command.tags = apply_tags(&command.tags, add, remove);
        self.remember_edit(previous, EditKind::TagManipulation);
        self.save()
    }

    /// Prompts for a new command text, description and tag changes.
    ///
    /// An empty answer keeps the current value. The whole edit is recorded as a
    /// single undo step.
    pub fn interactive_edit<R: BufRead, W: Write>(
        &mut self,
        id: u64,
        input: &mut R,
        out: &mut W,
        i18n: &I18n,
    ) -> Result<()> {
        let previous = self.command(id)?.clone();
        let mut edited = previous.clone();
        let io_err = SaveError::Terminal;

        writeln!(out, "\n{}", i18n.t("edit_title")).map_err(io_err)?;
        writeln!(out, "{}", i18n.t_format("edit_current_command", &[&edited.raw])).map_err(io_err)?;
        if let Some(text) = prompt(input, out, &i18n.t("edit_prompt_command")).map_err(io_err)? {
            validate_command(&text)?;
            edited.raw = text;
        }

        writeln!(out, "{}", i18n.t_format("edit_current_description", &[&edited.description]))
            .map_err(io_err)?;
        if let Some(text) = prompt(input, out, &i18n.t("edit_prompt_description")).map_err(io_err)? {
            edited.description = text;
        }

        writeln!(out, "{}", i18n.t_format("edit_current_tags", &[&edited.tags.join(", ")]))
            .map_err(io_err)?;
        let add = prompt(input, out, &i18n.t("edit_prompt_add_tags"))
            .map_err(io_err)?
            .map(|text| split_list(&text))
            .unwrap_or_default();
        let remove = prompt(input, out, &i18n.t("edit_prompt_remove_tags"))
            .map_err(io_err)?
            .map(|text| split_list(&text))
            .unwrap_or_default();
        edited.tags = apply_tags(&edited.tags, &add, &remove);

        *self.command_mut(id)? = edited;
        self.remember_edit(previous, EditKind::InteractiveEdit);
        self.save()
    }

    /// Restores the state captured by the most recent edit of `id`.
    pub fn undo_last_edit(&mut self, id: u64) -> Result<EditKind> {
        let index = self
            .edit_history
            .iter()
            .rposition(|e| e.command_id == id)
            .ok_or(SaveError::NotFound {
                entity: Entity::EditHistory,
                id,
            })?;
        self.command(id)?;
        let record = self.edit_history.remove(index);
        *self.command_mut(id)? = record.previous;
        self.save()?;
        Ok(record.edit_type)
    }

    /// Appends commands from a JSON array, giving each one a fresh ID.
    pub fn import_commands(&mut self, path: &Path) -> Result<usize> {
        let content = fs::read_to_string(path).map_err(|e| SaveError::storage(path, e))?;
        let imported: Vec<Command> = serde_json::from_str(&content)?;
        let count = imported.len();
        for mut command in imported {
            command.id = self.next_command_id();
            command.success_count = command.success_count.min(command.run_count);
            command.tags = normalize_tags(command.tags);
            if crate::storage::is_unset(&command.timestamp) {
                command.timestamp = Utc::now();
            }
            self.commands.push(command);
        }
        self.save()?;
        Ok(count)
    }

    pub fn export_commands(&self, path: &Path) -> Result<usize> {
        let content = serde_json::to_string_pretty(&self.commands)?;
        fs::write(path, content).map_err(|e| SaveError::storage(path, e))?;
        Ok(self.commands.len())
    }

    // ---- queries ----

    /// Last `n` commands, newest first.
    pub fn recent(&self, n: usize) -> Vec<&Command> {
        self.commands.iter().rev().take(n).collect()
    }

    pub fn search(&self, query: &str) -> Vec<&Command> {
        CommandMatcher::new()
            .rank(query, &self.commands)
            .into_iter()
            .map(|(command, _)| command)
            .collect()
    }

    pub fn filter_by_dir(&self, dir: &Path) -> Vec<&Command> {
        let wanted = fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
        self.commands
            .iter()
            .filter(|c| {
                c.working_dir
                    .as_deref()
                    .is_some_and(|d| d == dir || d == wanted.as_path())
            })
            .collect()
    }

    pub fn filter_by_tag(&self, tag: &str) -> Vec<&Command> {
        self.commands.iter().filter(|c| c.has_tag(tag)).collect()
    }

    pub fn favorites(&self) -> Vec<&Command> {
        self.commands.iter().filter(|c| c.is_favorite).collect()
    }

    /// Tags with their usage counts, most used first then alphabetical.
    pub fn tag_counts(&self) -> Vec<(String, usize)> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for tag in self.commands.iter().flat_map(|c| c.tags.iter()) {
            *counts.entry(tag.as_str()).or_insert(0) += 1;
        }
        let mut tags: Vec<(String, usize)> = counts.into_iter().map(|(t, n)| (t.to_string(), n)).collect();
        tags.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        tags
    }

    pub fn statistics(&self) -> Statistics {
        let mut stats = Statistics::default();
        let mut by_text: HashMap<&str, usize> = HashMap::new();
        for command in &self.commands {
            stats.total_runs += u64::from(command.run_count);
            stats.success_count += u64::from(command.success_count);
            if command.is_favorite {
                stats.favorite_count += 1;
            }
            *by_text.entry(command.raw.as_str()).or_insert(0) += 1;
        }
        if stats.total_runs > 0 {
            stats.success_rate = stats.success_count as f64 / stats.total_runs as f64 * 100.0;
        }
        stats.most_used_tags = self.tag_counts().into_iter().take(5).map(|(t, _)| t).collect();
        stats.common_commands = top_keys(by_text, 5);
        stats
    }

    // ---- chains ----

    /// Validates a chain definition against the current store and inserts it.
    pub fn create_chain(&mut self, definition: ChainDefinition) -> Result<u64> {
        let ChainDefinition {
            name,
            description,
            steps,
            mut dependencies,
        } = definition;

        if name.trim().is_empty() {
            return Err(SaveError::validation("chain name cannot be empty"));
        }
        for (index, step) in steps.iter().enumerate() {
            for command_id in step.referenced_commands() {
                self.command(command_id)?;
            }
            for condition in &step.conditions {
                condition.validate().map_err(|reason| {
                    SaveError::validation(format!("step {}: {}", index + 1, reason))
                })?;
            }
        }

        let id = self.last_chain_id + 1;
        for dependency in &mut dependencies {
            dependency.chain_id = id;
            for &upstream in &dependency.depends_on {
                if upstream != id {
                    self.chain(upstream)?;
                }
            }
        }

        let mut graph: BTreeMap<u64, Vec<u64>> = self
            .chains
            .iter()
            .map(|c| (c.id, c.upstream().collect()))
            .collect();
        graph.insert(
            id,
            dependencies.iter().flat_map(|d| d.depends_on.iter().copied()).collect(),
        );
        if let Some(cycle) = find_cycle_through(&graph, id) {
            return Err(SaveError::CyclicDependency { cycle });
        }

        let id = self.next_chain_id();
        self.chains.push(Chain {
            id,
            name,
            description,
            steps,
            dependencies,
            created_at: Utc::now(),
            last_run: None,
            success_rate: 0.0,
            run_count: 0,
            success_count: 0,
        });
        self.save()?;
        Ok(id)
    }

    /// Folds one finished run into the chain's statistics.
    pub fn record_chain_run(&mut self, id: u64, succeeded: bool) -> Result<()> {
        let chain = self
            .chains
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| SaveError::chain_not_found(id))?;
        chain.run_count += 1;
        if succeeded {
            chain.success_count += 1;
        }
        chain.success_rate = percentage(chain.success_count, chain.run_count);
        chain.last_run = Some(Utc::now());
        self.save()
    }
}

fn prompt<R: BufRead, W: Write>(input: &mut R, out: &mut W, label: &str) -> std::io::Result<Option<String>> {
    write!(out, "{}", label)?;
    out.flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    let line = line.trim();
    Ok(if line.is_empty() { None } else { Some(line.to_string()) })
}

/// Splits a comma-separated list, dropping blanks.
pub fn split_list(text: &str) -> Vec<String> {
    text.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    apply_tags(&[], &tags, &[])
}

fn apply_tags(current: &[String], add: &[String], remove: &[String]) -> Vec<String> {
    let mut tags: BTreeSet<String> = current
        .iter()
        .chain(add.iter())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    for tag in remove {
        tags.remove(tag.trim());
    }
    tags.into_iter().collect()
}

fn top_keys(counts: HashMap<&str, usize>, n: usize) -> Vec<String> {
    let mut pairs: Vec<(&str, usize)> = counts.into_iter().collect();
    pairs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    pairs.into_iter().take(n).map(|(k, _)| k.to_string()).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::{ChainDependency, ChainStep, WaitPolicy};
    use std::io::Cursor;
    use tempfile::TempDir;

    pub(crate) fn temp_store() -> (TempDir, CommandStore) {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            path: dir.path().join("history.json"),
            backup_dir: dir.path().join("backups"),
            version: "test".to_string(),
        };
        let store = CommandStore::open(config).unwrap();
        (dir, store)
    }

    pub(crate) fn add(store: &mut CommandStore, raw: &str) -> u64 {
        let new = NewCommand {
            raw: raw.to_string(),
            ..Default::default()
        };
        store.record_execution(new, 0).unwrap()
    }

    fn assert_counts_consistent(store: &CommandStore) {
        for c in store.commands() {
            assert!(c.success_count <= c.run_count, "command {} has more successes than runs", c.id);
        }
    }

    #[test]
    fn missing_file_is_created_and_reloads_empty() {
        let (dir, store) = temp_store();
        assert!(store.path().exists());
        let reopened = CommandStore::open(store.config.clone()).unwrap();
        assert!(reopened.commands().is_empty());
        drop(dir);
    }

    #[test]
    fn ids_continue_from_max_on_reload() {
        let (_dir, mut store) = temp_store();
        add(&mut store, "echo a");
        let second = add(&mut store, "echo b");
        store.remove_commands(&[second]).unwrap();

        let mut reopened = CommandStore::open(store.config.clone()).unwrap();
        assert_eq!(add(&mut reopened, "echo c"), 2);
        assert_eq!(reopened.next_command_id(), 3);
    }

    #[test]
    fn legacy_file_loads_and_seeds_counter() {
        let (_dir, mut store) = temp_store();
        fs::write(
            store.path(),
            r#"[{"command": "make", "timestamp": "2024-01-01T00:00:00Z", "exit_code": 0, "id": 41,
                 "is_favorite": true, "run_count": 3, "success_count": 2}]"#,
        )
        .unwrap();
        store.load().unwrap();
        assert_eq!(store.command(41).unwrap().raw, "make");
        assert_eq!(add(&mut store, "make test"), 42);
    }

    #[test]
    fn run_statistics_never_exceed_runs() {
        let (_dir, mut store) = temp_store();
        let id = store
            .record_execution(NewCommand { raw: "false".into(), ..Default::default() }, 1)
            .unwrap();
        store.record_run(id, 0).unwrap();
        store.record_run(id, 2).unwrap();

        let command = store.command(id).unwrap();
        assert_eq!((command.run_count, command.success_count), (3, 1));
        assert_eq!(command.exit_code, 2);
        assert_counts_consistent(&store);
    }

    #[test]
    fn empty_command_text_is_rejected() {
        let (_dir, mut store) = temp_store();
        let err = store.record_execution(NewCommand::default(), 0).unwrap_err();
        assert!(matches!(err, SaveError::Validation(_)));
        assert!(store.commands().is_empty());
    }

    #[test]
    fn missing_ids_report_not_found() {
        let (_dir, mut store) = temp_store();
        assert!(matches!(store.set_favorite(9, true), Err(SaveError::NotFound { id: 9, .. })));
        assert!(matches!(store.record_run(9, 0), Err(SaveError::NotFound { .. })));
        assert!(matches!(store.remove_commands(&[9]), Err(SaveError::NotFound { .. })));
        assert!(matches!(store.chain(3), Err(SaveError::NotFound { entity: Entity::Chain, .. })));
    }

    #[test]
    fn tags_are_deduplicated_sorted_and_undoable() {
        let (_dir, mut store) = temp_store();
        let id = add(&mut store, "docker ps");
        store
            .manipulate_tags(id, &["ops".into(), "docker".into(), "ops".into()], &[])
            .unwrap();
        assert_eq!(store.command(id).unwrap().tags, vec!["docker", "ops"]);

        store.manipulate_tags(id, &[], &["ops".into()]).unwrap();
        assert_eq!(store.command(id).unwrap().tags, vec!["docker"]);

        // undo survives a reload
        let mut reopened = CommandStore::open(store.config.clone()).unwrap();
        assert_eq!(reopened.undo_last_edit(id).unwrap(), EditKind::TagManipulation);
        assert_eq!(reopened.command(id).unwrap().tags, vec!["docker", "ops"]);
        reopened.undo_last_edit(id).unwrap();
        assert!(reopened.command(id).unwrap().tags.is_empty());
        assert!(matches!(
            reopened.undo_last_edit(id),
            Err(SaveError::NotFound { entity: Entity::EditHistory, .. })
        ));
    }

    #[test]
    fn interactive_edit_applies_answers_and_keeps_blanks() {
        let (_dir, mut store) = temp_store();
        let id = add(&mut store, "ls");
        store.manipulate_tags(id, &["fs".into(), "old".into()], &[]).unwrap();

        let mut input = Cursor::new("ls -la\n\nnew, more\nold\n");
        let mut out = Vec::new();
        store
            .interactive_edit(id, &mut input, &mut out, &I18n::new("en"))
            .unwrap();

        let command = store.command(id).unwrap();
        assert_eq!(command.raw, "ls -la");
        assert_eq!(command.description, "");
        assert_eq!(command.tags, vec!["fs", "more", "new"]);
        assert!(String::from_utf8(out).unwrap().contains("ls"));

        store.undo_last_edit(id).unwrap();
        assert_eq!(store.command(id).unwrap().raw, "ls");
    }

    struct ClosedTerminal;

    impl Write for ClosedTerminal {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "terminal closed"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn interactive_edit_reports_terminal_failures() {
        let (_dir, mut store) = temp_store();
        let id = add(&mut store, "ls");
        let mut input = Cursor::new("ls -la\n");

        let err = store
            .interactive_edit(id, &mut input, &mut ClosedTerminal, &I18n::new("en"))
            .unwrap_err();
        assert!(matches!(err, SaveError::Terminal(_)));
        assert!(err.to_string().starts_with("terminal I/O failed"));
        assert_eq!(store.command(id).unwrap().raw, "ls");
    }

    #[test]
    fn interactive_edit_rejects_broken_syntax() {
        let (_dir, mut store) = temp_store();
        let id = add(&mut store, "ls");
        let mut input = Cursor::new("if true; then echo\n");
        let mut out = Vec::new();
        let err = store
            .interactive_edit(id, &mut input, &mut out, &I18n::new("en"))
            .unwrap_err();
        assert!(matches!(err, SaveError::Validation(_)));
        assert_eq!(store.command(id).unwrap().raw, "ls");
    }

    #[test]
    fn import_assigns_fresh_ids() {
        let (dir, mut store) = temp_store();
        add(&mut store, "echo one");
        add(&mut store, "echo two");
        let file = dir.path().join("import.json");
        fs::write(
            &file,
            r#"[{"command": "echo imported", "timestamp": "2024-01-01T00:00:00Z", "exit_code": 0, "id": 1,
                 "is_favorite": false, "run_count": 1, "success_count": 1},
                {"command": "echo again", "timestamp": "2024-01-01T00:00:00Z", "exit_code": 0, "id": 2,
                 "is_favorite": false, "run_count": 0, "success_count": 4}]"#,
        )
        .unwrap();

        assert_eq!(store.import_commands(&file).unwrap(), 2);
        let ids: Vec<u64> = store.commands().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_counts_consistent(&store);
    }

    #[test]
    fn export_then_search_and_filters() {
        let (dir, mut store) = temp_store();
        let git = add(&mut store, "git status");
        let build = add(&mut store, "cargo build");
        store.manipulate_tags(build, &["Rust".into()], &[]).unwrap();
        store.set_favorite(git, true).unwrap();

        let file = dir.path().join("export.json");
        assert_eq!(store.export_commands(&file).unwrap(), 2);
        let exported: Vec<Command> = serde_json::from_str(&fs::read_to_string(&file).unwrap()).unwrap();
        assert_eq!(exported.len(), 2);

        assert_eq!(store.search("git")[0].id, git);
        assert_eq!(store.filter_by_tag("rust")[0].id, build);
        assert_eq!(store.favorites().len(), 1);
        assert_eq!(store.recent(1)[0].id, build);
    }

    #[test]
    fn statistics_summarize_history() {
        let (_dir, mut store) = temp_store();
        let a = add(&mut store, "make");
        add(&mut store, "make");
        let b = store
            .record_execution(NewCommand { raw: "ls".into(), tags: vec!["fs".into()], ..Default::default() }, 1)
            .unwrap();
        store.set_favorite(a, true).unwrap();
        store.manipulate_tags(a, &["build".into(), "fs".into()], &[]).unwrap();
        store.record_run(b, 0).unwrap();

        let stats = store.statistics();
        assert_eq!(stats.total_runs, 4);
        assert_eq!(stats.success_count, 3);
        assert!((stats.success_rate - 75.0).abs() < 1e-9);
        assert_eq!(stats.favorite_count, 1);
        assert_eq!(stats.most_used_tags, vec!["fs", "build"]);
        assert_eq!(stats.common_commands[0], "make");
    }

    #[test]
    fn chain_creation_validates_references() {
        let (_dir, mut store) = temp_store();
        let cmd = add(&mut store, "echo hi");

        let bad_command = ChainDefinition {
            name: "x".into(),
            steps: vec![ChainStep { command_id: cmd, on_failure: vec![99], ..Default::default() }],
            ..Default::default()
        };
        assert!(matches!(store.create_chain(bad_command), Err(SaveError::NotFound { id: 99, .. })));

        let bad_condition: ChainStep = serde_json::from_str(&format!(
            r#"{{"command_id": {}, "conditions": [{{"type": "exit_code", "operation": "equals", "value": "x"}}]}}"#,
            cmd
        ))
        .unwrap();
        let err = store
            .create_chain(ChainDefinition { name: "x".into(), steps: vec![bad_condition], ..Default::default() })
            .unwrap_err();
        assert!(matches!(err, SaveError::Validation(_)));

        let bad_dependency = ChainDefinition {
            name: "x".into(),
            dependencies: vec![ChainDependency { chain_id: 0, depends_on: vec![5], wait_policy: WaitPolicy::All }],
            ..Default::default()
        };
        assert!(matches!(store.create_chain(bad_dependency), Err(SaveError::NotFound { entity: Entity::Chain, .. })));
        assert!(store.chains().is_empty());
    }

    #[test]
    fn chain_dependencies_get_owner_id_and_cycles_are_refused() {
        let (_dir, mut store) = temp_store();
        let base = store
            .create_chain(ChainDefinition { name: "base".into(), ..Default::default() })
            .unwrap();
        let top = store
            .create_chain(ChainDefinition {
                name: "top".into(),
                dependencies: vec![ChainDependency { chain_id: 77, depends_on: vec![base], wait_policy: WaitPolicy::Any }],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(store.chain(top).unwrap().dependencies[0].chain_id, top);

        let self_loop = ChainDefinition {
            name: "loop".into(),
            dependencies: vec![ChainDependency { chain_id: 0, depends_on: vec![top + 1], wait_policy: WaitPolicy::All }],
            ..Default::default()
        };
        assert!(matches!(store.create_chain(self_loop), Err(SaveError::CyclicDependency { .. })));
        assert_eq!(store.chains().len(), 2);

        // the refused definition did not use up an ID
        let next = store
            .create_chain(ChainDefinition { name: "next".into(), ..Default::default() })
            .unwrap();
        assert_eq!(next, top + 1);
    }

    #[test]
    fn existing_cycle_does_not_block_unrelated_chains() {
        let (_dir, mut store) = temp_store();
        let looped = store
            .create_chain(ChainDefinition { name: "looped".into(), ..Default::default() })
            .unwrap();
        // hand-edited document: the chain waits on itself
        store.chains[0].dependencies =
            vec![ChainDependency { chain_id: looped, depends_on: vec![looped], wait_policy: WaitPolicy::All }];

        let unrelated = store
            .create_chain(ChainDefinition { name: "unrelated".into(), ..Default::default() })
            .unwrap();
        let downstream = store
            .create_chain(ChainDefinition {
                name: "downstream".into(),
                dependencies: vec![ChainDependency { chain_id: 0, depends_on: vec![looped], wait_policy: WaitPolicy::All }],
                ..Default::default()
            })
            .unwrap();
        assert_eq!((unrelated, downstream), (looped + 1, looped + 2));
        assert_eq!(store.chains().len(), 3);
    }

    #[test]
    fn chain_run_statistics_accumulate() {
        let (_dir, mut store) = temp_store();
        let id = store
            .create_chain(ChainDefinition { name: "c".into(), ..Default::default() })
            .unwrap();
        store.record_chain_run(id, true).unwrap();
        store.record_chain_run(id, false).unwrap();
        let chain = store.chain(id).unwrap();
        assert_eq!((chain.run_count, chain.success_count), (2, 1));
        assert!((chain.success_rate - 50.0).abs() < 1e-9);
        assert!(chain.last_run().is_some());
    }

    #[test]
    fn rate_only_chains_get_counts_reconstructed() {
        let (_dir, mut store) = temp_store();
        fs::write(
            store.path(),
            r#"{"commands": [], "chains": [{"id": 3, "name": "old", "steps": [],
                "created_at": "2024-01-01T00:00:00Z", "success_rate": 75, "run_count": 4}]}"#,
        )
        .unwrap();
        store.load().unwrap();
        store.record_chain_run(3, true).unwrap();
        let chain = store.chain(3).unwrap();
        assert_eq!((chain.run_count, chain.success_count), (5, 4));
        assert!((chain.success_rate - 80.0).abs() < 1e-9);
    }
}
