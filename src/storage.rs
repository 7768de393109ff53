use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::condition::Condition;

/// Documents written by older builds carry `null` where an empty list is meant.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Timestamps at or before the Unix epoch are treated as unset.
pub fn is_unset(timestamp: &DateTime<Utc>) -> bool {
    timestamp.timestamp() <= 0
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Command {
    #[serde(rename = "command")]
    pub raw: String,                   // Command text as typed
    #[serde(default)]
    pub timestamp: DateTime<Utc>,      // Creation timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,  // Saved with --dir only
    #[serde(default)]
    pub exit_code: i32,                // Exit code of the most recent run
    pub id: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "null_as_default")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(default)]
    pub run_count: u32,
    #[serde(default)]
    pub success_count: u32,
}

impl Command {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    /// Percentage of successful runs, 0 when never run.
    pub fn success_rate(&self) -> f64 {
        percentage(self.success_count, self.run_count)
    }
}

pub fn percentage(part: u32, total: u32) -> f64 {
    if total == 0 {
        0.0
    } else {
        f64::from(part) / f64::from(total) * 100.0
    }
}

/// Fields supplied by the user when a new command is recorded.
#[derive(Debug, Clone, Default)]
pub struct NewCommand {
    pub raw: String,
    pub working_dir: Option<PathBuf>,
    pub tags: Vec<String>,
    pub description: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WaitPolicy {
    #[default]
    All,
    Any,
}

impl fmt::Display for WaitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitPolicy::All => write!(f, "all"),
            WaitPolicy::Any => write!(f, "any"),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChainDependency {
    #[serde(default)]
    pub chain_id: u64,      // Owning chain
    #[serde(default, deserialize_with = "null_as_default")]
    pub depends_on: Vec<u64>,
    #[serde(default)]
    pub wait_policy: WaitPolicy,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ChainStep {
    pub command_id: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "null_as_default")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "null_as_default")]
    pub parallel_with: Vec<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "null_as_default")]
    pub on_success: Vec<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "null_as_default")]
    pub on_failure: Vec<u64>,
}

impl ChainStep {
    /// Every command ID the step can dispatch.
    pub fn referenced_commands(&self) -> impl Iterator<Item = u64> + '_ {
        std::iter::once(self.command_id)
            .chain(self.parallel_with.iter().copied())
            .chain(self.on_success.iter().copied())
            .chain(self.on_failure.iter().copied())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Chain {
    pub id: u64,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub steps: Vec<ChainStep>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "null_as_default")]
    pub dependencies: Vec<ChainDependency>,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub success_rate: f64,   // Percent, derived from success_count / run_count
    #[serde(default)]
    pub run_count: u32,
    #[serde(default)]
    pub success_count: u32,
}

impl Chain {
    /// IDs of every chain this chain waits on, across all dependency edges.
    pub fn upstream(&self) -> impl Iterator<Item = u64> + '_ {
        self.dependencies
            .iter()
            .flat_map(|dep| dep.depends_on.iter().copied())
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        self.last_run.filter(|ts| !is_unset(ts))
    }
}

/// User-supplied parts of a chain; IDs and statistics are filled in by the store.
#[derive(Debug, Clone, Default)]
pub struct ChainDefinition {
    pub name: String,
    pub description: String,
    pub steps: Vec<ChainStep>,
    pub dependencies: Vec<ChainDependency>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EditKind {
    TagManipulation,
    InteractiveEdit,
    Description,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EditRecord {
    pub command_id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "previous_state")]
    pub previous: Command,
    pub edit_type: EditKind,
}

/// On-disk shape of the history file.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct StoreDocument {
    #[serde(default, deserialize_with = "null_as_default")]
    pub commands: Vec<Command>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub chains: Vec<Chain>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "null_as_default")]
    pub edit_history: Vec<EditRecord>,
}

impl StoreDocument {
    /// Parses the current layout, falling back to the legacy bare command array.
    pub fn parse(content: &str) -> serde_json::Result<Self> {
        match serde_json::from_str::<StoreDocument>(content) {
            Ok(doc) => Ok(doc),
            Err(err) => match serde_json::from_str::<Vec<Command>>(content) {
                Ok(commands) => Ok(StoreDocument {
                    commands,
                    ..Default::default()
                }),
                Err(_) => Err(err),
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BackupMetadata {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub command_count: usize,
    pub chain_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>, // SHA256 of the serialized commands + chains
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BackupData {
    pub metadata: BackupMetadata,
    #[serde(default, deserialize_with = "null_as_default")]
    pub commands: Vec<Command>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub chains: Vec<Chain>,
}
