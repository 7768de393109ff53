use tree_sitter::{Node, Parser, TreeCursor};

use crate::error::{Result, SaveError};

/// Location of the first broken construct in a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxIssue {
    pub row: usize,
    pub column: usize,
    pub missing: bool,
    pub near: String,
}

pub struct BashParser {
    parser: Parser,
}

impl BashParser {
    pub fn new() -> Result<Self> {
        let mut parser = Parser::new();
        let lang = tree_sitter_bash::language();
        parser
            .set_language(&lang)
            .map_err(|e| SaveError::validation(format!("cannot load bash grammar: {}", e)))?;
        Ok(Self { parser })
    }

    pub fn parse_to_tree(&mut self, source: &str) -> Option<tree_sitter::Tree> {
        self.parser.parse(source, None)
    }

    /// Returns the first ERROR or MISSING node, `None` when the source parses cleanly.
    pub fn first_issue(&mut self, source: &str) -> Option<SyntaxIssue> {
        let tree = self.parse_to_tree(source)?;
        let root = tree.root_node();
        if !root.has_error() {
            return None;
        }
        find_issue(root, source.as_bytes()).or(Some(SyntaxIssue {
            row: 0,
            column: 0,
            missing: false,
            near: source.trim().chars().take(20).collect(),
        }))
    }
}

fn find_issue(node: Node, source: &[u8]) -> Option<SyntaxIssue> {
    if node.is_error() || node.is_missing() {
        let near = node
            .utf8_text(source)
            .map(|text| text.chars().take(20).collect())
            .unwrap_or_default();
        return Some(SyntaxIssue {
            row: node.start_position().row,
            column: node.start_position().column,
            missing: node.is_missing(),
            near: if node.is_missing() { node.kind().to_string() } else { near },
        });
    }
    let mut cursor: TreeCursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.has_error() || child.is_missing() {
            if let Some(issue) = find_issue(child, source) {
                return Some(issue);
            }
        }
    }
    None
}

/// Refuses empty command text and text the bash grammar cannot parse.
pub fn validate_command(command: &str) -> Result<()> {
    if command.trim().is_empty() {
        return Err(SaveError::validation("command cannot be empty"));
    }
    let mut parser = BashParser::new()?;
    match parser.first_issue(command) {
        None => Ok(()),
        Some(issue) if issue.missing => Err(SaveError::validation(format!(
            "invalid shell syntax: missing '{}' at {}:{}",
            issue.near,
            issue.row + 1,
            issue.column + 1
        ))),
        Some(issue) => Err(SaveError::validation(format!(
            "invalid shell syntax near '{}' at {}:{}",
            issue.near,
            issue.row + 1,
            issue.column + 1
        ))),
    }
}
