//! Declarative step conditions and their evaluation.
//!
//! Conditions are stored as `{"type", "operation", "value"}` strings. Known
//! kinds and operations are parsed into typed variants; anything else is kept
//! verbatim as [`Condition::Unsupported`] so older or hand-edited documents
//! still load. Evaluation never fails: a condition that cannot be evaluated is
//! reported through `tracing` and counts as false.

use chrono::{Local, NaiveDateTime, NaiveTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

macro_rules! operations {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn parse(text: &str) -> Option<Self> {
                match text {
                    $($text => Some($name::$variant),)+
                    _ => None,
                }
            }

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }
    };
}

operations!(
    /// Numeric comparison against the previous exit code.
    ExitCodeOp {
        Equals => "equals",
        NotEquals => "not_equals",
        LessThan => "less_than",
        GreaterThan => "greater_than",
        LessEquals => "less_equals",
        GreaterEquals => "greater_equals",
    }
);

operations!(
    OutputOp {
        Contains => "contains",
        NotContains => "not_contains",
        StartsWith => "starts_with",
        EndsWith => "ends_with",
        Matches => "matches",
    }
);

operations!(
    /// `equals` and `contains` take a `KEY=VALUE` operand.
    EnvVarOp {
        Exists => "exists",
        NotExists => "not_exists",
        Equals => "equals",
        Contains => "contains",
    }
);

operations!(
    WindowOp {
        Within => "within",
        Outside => "outside",
    }
);

operations!(
    FileOp {
        Exists => "exists",
        NotExists => "not_exists",
    }
);

const EXIT_CODE: &str = "exit_code";
const OUTPUT_CONTAINS: &str = "output_contains";
const ENV_VAR: &str = "env_var";
const TIME_WINDOW: &str = "time_window";
const FILE_EXISTS: &str = "file_exists";

const KNOWN_KINDS: [&str; 5] = [EXIT_CODE, OUTPUT_CONTAINS, ENV_VAR, TIME_WINDOW, FILE_EXISTS];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawCondition", into = "RawCondition")]
pub enum Condition {
    ExitCode { op: ExitCodeOp, value: String },
    Output { op: OutputOp, value: String },
    EnvVar { op: EnvVarOp, value: String },
    TimeWindow { op: WindowOp, value: String },
    FileExists { op: FileOp, path: String },
    Unsupported { kind: String, operation: String, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawCondition {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    value: String,
    #[serde(default)]
    operation: String,
}

impl From<RawCondition> for Condition {
    fn from(raw: RawCondition) -> Self {
        let RawCondition { kind, value, operation } = raw;
        let parsed = match kind.as_str() {
            EXIT_CODE => ExitCodeOp::parse(&operation).map(|op| Condition::ExitCode { op, value: value.clone() }),
            OUTPUT_CONTAINS => OutputOp::parse(&operation).map(|op| Condition::Output { op, value: value.clone() }),
            ENV_VAR => EnvVarOp::parse(&operation).map(|op| Condition::EnvVar { op, value: value.clone() }),
            TIME_WINDOW => WindowOp::parse(&operation).map(|op| Condition::TimeWindow { op, value: value.clone() }),
            FILE_EXISTS => FileOp::parse(&operation).map(|op| Condition::FileExists { op, path: value.clone() }),
            _ => None,
        };
        parsed.unwrap_or(Condition::Unsupported { kind, operation, value })
    }
}

impl From<Condition> for RawCondition {
    fn from(condition: Condition) -> Self {
        let (kind, operation, value) = match condition {
            Condition::ExitCode { op, value } => (EXIT_CODE.to_string(), op.as_str().to_string(), value),
            Condition::Output { op, value } => (OUTPUT_CONTAINS.to_string(), op.as_str().to_string(), value),
            Condition::EnvVar { op, value } => (ENV_VAR.to_string(), op.as_str().to_string(), value),
            Condition::TimeWindow { op, value } => (TIME_WINDOW.to_string(), op.as_str().to_string(), value),
            Condition::FileExists { op, path } => (FILE_EXISTS.to_string(), op.as_str().to_string(), path),
            Condition::Unsupported { kind, operation, value } => (kind, operation, value),
        };
        RawCondition { kind, value, operation }
    }
}

/// Outcome of the previously executed step, as seen by the next step's conditions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    pub last_exit_code: i32,
    pub last_output: String,
    pub last_error: Option<String>,
}

/// Evaluates every condition against `context` using the current local time.
pub fn evaluate(conditions: &[Condition], context: &ExecutionContext) -> bool {
    evaluate_at(conditions, context, Local::now().naive_local())
}

/// Same as [`evaluate`] with an explicit "now" for time windows.
pub fn evaluate_at(conditions: &[Condition], context: &ExecutionContext, now: NaiveDateTime) -> bool {
    conditions.iter().all(|condition| condition.holds(context, now))
}

impl Condition {
    pub fn kind(&self) -> &str {
        match self {
            Condition::ExitCode { .. } => EXIT_CODE,
            Condition::Output { .. } => OUTPUT_CONTAINS,
            Condition::EnvVar { .. } => ENV_VAR,
            Condition::TimeWindow { .. } => TIME_WINDOW,
            Condition::FileExists { .. } => FILE_EXISTS,
            Condition::Unsupported { kind, .. } => kind,
        }
    }

    /// Checks the operand up front so bad definitions are refused when a chain is created.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Condition::ExitCode { value, .. } => parse_exit_code(value).map(|_| ()),
            Condition::Output { op: OutputOp::Matches, value } => Regex::new(value)
                .map(|_| ())
                .map_err(|e| format!("invalid regex pattern '{}': {}", value, e)),
            Condition::Output { .. } => Ok(()),
            Condition::EnvVar { op: EnvVarOp::Equals | EnvVarOp::Contains, value } => {
                split_assignment(value).map(|_| ())
            }
            Condition::EnvVar { value, .. } if value.trim().is_empty() => {
                Err("env_var condition needs a variable name".to_string())
            }
            Condition::EnvVar { .. } => Ok(()),
            Condition::TimeWindow { value, .. } => parse_window(value).map(|_| ()),
            Condition::FileExists { path, .. } if path.trim().is_empty() => {
                Err("file_exists condition needs a path".to_string())
            }
            Condition::FileExists { .. } => Ok(()),
            Condition::Unsupported { kind, operation, .. } => Err(unsupported_message(kind, operation)),
        }
    }

    pub fn holds(&self, context: &ExecutionContext, now: NaiveDateTime) -> bool {
        match self.check(context, now) {
            Ok(satisfied) => satisfied,
            Err(reason) => {
                tracing::warn!(kind = self.kind(), "{}, condition will fail", reason);
                false
            }
        }
    }

    fn check(&self, context: &ExecutionContext, now: NaiveDateTime) -> Result<bool, String> {
        match self {
            Condition::ExitCode { op, value } => {
                let expected = parse_exit_code(value)?;
                let actual = context.last_exit_code;
                Ok(match op {
                    ExitCodeOp::Equals => actual == expected,
                    ExitCodeOp::NotEquals => actual != expected,
                    ExitCodeOp::LessThan => actual < expected,
                    ExitCodeOp::GreaterThan => actual > expected,
                    ExitCodeOp::LessEquals => actual <= expected,
                    ExitCodeOp::GreaterEquals => actual >= expected,
                })
            }
            Condition::Output { op, value } => {
                let output = context.last_output.as_str();
                Ok(match op {
                    OutputOp::Contains => output.contains(value.as_str()),
                    OutputOp::NotContains => !output.contains(value.as_str()),
                    OutputOp::StartsWith => output.starts_with(value.as_str()),
                    OutputOp::EndsWith => output.ends_with(value.as_str()),
                    OutputOp::Matches => Regex::new(value)
                        .map_err(|e| format!("invalid regex pattern '{}': {}", value, e))?
                        .is_match(output),
                })
            }
            Condition::EnvVar { op, value } => Ok(match op {
                EnvVarOp::Exists => env_value(value).is_some(),
                EnvVarOp::NotExists => env_value(value).is_none(),
                EnvVarOp::Equals => {
                    let (key, expected) = split_assignment(value)?;
                    env_value(key).unwrap_or_default() == expected
                }
                EnvVarOp::Contains => {
                    let (key, needle) = split_assignment(value)?;
                    env_value(key).unwrap_or_default().contains(needle)
                }
            }),
            Condition::TimeWindow { op, value } => {
                let (start, end) = parse_window(value)?;
                let today = now.date();
                let (start, end) = (today.and_time(start), today.and_time(end));
                Ok(match op {
                    WindowOp::Within => now > start && now < end,
                    WindowOp::Outside => now < start || now > end,
                })
            }
            Condition::FileExists { op, path } => {
                let exists = Path::new(path).exists();
                Ok(match op {
                    FileOp::Exists => exists,
                    FileOp::NotExists => !exists,
                })
            }
            Condition::Unsupported { kind, operation, .. } => Err(unsupported_message(kind, operation)),
        }
    }
}

fn unsupported_message(kind: &str, operation: &str) -> String {
    if KNOWN_KINDS.contains(&kind) {
        format!("unknown operation '{}' for {} condition", operation, kind)
    } else {
        format!("unknown condition type '{}'", kind)
    }
}

fn parse_exit_code(value: &str) -> Result<i32, String> {
    value
        .trim()
        .parse::<i32>()
        .map_err(|_| format!("invalid exit code value '{}'", value))
}

/// Empty variables count as unset.
fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn split_assignment(value: &str) -> Result<(&str, &str), String> {
    value
        .split_once('=')
        .ok_or_else(|| format!("invalid env_var operand '{}', expected KEY=VALUE", value))
}

fn parse_window(value: &str) -> Result<(NaiveTime, NaiveTime), String> {
    let parts: Vec<&str> = value.split('-').collect();
    if parts.len() != 2 {
        return Err(format!("invalid time window '{}', expected HH:MM-HH:MM", value));
    }
    let parse = |text: &str| {
        NaiveTime::parse_from_str(text.trim(), "%H:%M")
            .map_err(|e| format!("invalid time '{}' in window: {}", text, e))
    };
    Ok((parse(parts[0])?, parse(parts[1])?))
}
