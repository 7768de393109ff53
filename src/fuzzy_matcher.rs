use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;

use crate::storage::Command;

/// Scores saved commands against a search query.
///
/// A command matches when the query is a case-insensitive substring of its
/// text, description or one of its tags, or when it fuzzy-matches the command
/// text. Stronger matches on the command text rank first.
pub struct CommandMatcher {
    matcher: SkimMatcherV2,
}

impl CommandMatcher {
    pub fn new() -> Self {
        Self {
            matcher: SkimMatcherV2::default().ignore_case(),
        }
    }

    /// Exact substring match, scored by position (earlier is better)
    fn exact_score(&self, query: &str, text: &str, base: i64) -> Option<i64> {
        let pos = text.find(query)?;
        let prefix_bonus = if pos == 0 { 200 } else { 0 };
        Some(base + prefix_bonus + (query.len() as i64) * 10 - pos.min(100) as i64)
    }

    pub fn score(&self, query: &str, command: &Command) -> Option<i64> {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return Some(0);
        }

        let raw = command.raw.to_lowercase();
        let description = command.description.to_lowercase();

        let candidates = [
            self.exact_score(&query, &raw, 1000),
            command
                .tags
                .iter()
                .filter_map(|tag| self.exact_score(&query, &tag.to_lowercase(), 900))
                .max(),
            self.exact_score(&query, &description, 700),
            self.matcher.fuzzy_match(&command.raw, &query),
        ];
        candidates.into_iter().flatten().max()
    }

    /// Matching commands, best first; ties keep the newest (highest ID) first.
    pub fn rank<'a>(&self, query: &str, commands: &'a [Command]) -> Vec<(&'a Command, i64)> {
        let mut results: Vec<(&Command, i64)> = commands
            .iter()
            .filter_map(|command| self.score(query, command).map(|score| (command, score)))
            .collect();
        results.sort_by(|a, b| b.1.cmp(&a.1).then(b.0.id.cmp(&a.0.id)));
        results
    }
}

impl Default for CommandMatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(id: u64, raw: &str, description: &str, tags: &[&str]) -> Command {
        Command {
            raw: raw.to_string(),
            timestamp: chrono::Utc::now(),
            working_dir: None,
            exit_code: 0,
            id,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            description: description.to_string(),
            is_favorite: false,
            run_count: 1,
            success_count: 1,
        }
    }

    #[test]
    fn matches_text_tags_and_description() {
        let matcher = CommandMatcher::new();
        let commands = vec![
            command(1, "git status", "", &[]),
            command(2, "docker ps", "", &["Git-Hooks"]),
            command(3, "make release", "bump git tag", &[]),
            command(4, "cargo build", "", &[]),
        ];

        let ids: Vec<u64> = matcher.rank("GIT", &commands).iter().map(|(c, _)| c.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn fuzzy_hits_rank_below_substring_hits() {
        let matcher = CommandMatcher::new();
        let commands = vec![
            command(1, "kubectl get pods", "", &[]),
            command(2, "kgp", "", &[]),
        ];
        let ranked = matcher.rank("kgp", &commands);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].0.id, 2);
    }

    #[test]
    fn unrelated_query_matches_nothing() {
        let matcher = CommandMatcher::new();
        let commands = vec![command(1, "ls -la", "list", &["fs"])];
        assert!(matcher.rank("zzz", &commands).is_empty());
    }
}
