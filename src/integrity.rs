use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use thiserror::Error;

use crate::error::{format_cycle, Result};
use crate::storage::{is_unset, Chain, Command};
use crate::store_manager::CommandStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityIssue {
    #[error("duplicate command ID found: {0}")]
    DuplicateCommandId(u64),
    #[error("duplicate chain ID found: {0}")]
    DuplicateChainId(u64),
    #[error("chain {chain} depends on non-existent chain {missing}")]
    MissingDependency { chain: u64, missing: u64 },
    #[error("chain {chain} references non-existent command {command}")]
    MissingCommand { chain: u64, command: u64 },
    #[error("command {0} has invalid timestamp")]
    UnsetTimestamp(u64),
    #[error("command {0} has more successes than runs")]
    SuccessExceedsRuns(u64),
    #[error("chain dependency cycle: {}", format_cycle(.0))]
    DependencyCycle(Vec<u64>),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

fn visit(
    node: u64,
    graph: &BTreeMap<u64, Vec<u64>>,
    marks: &mut HashMap<u64, Mark>,
    stack: &mut Vec<u64>,
) -> Option<Vec<u64>> {
    match marks.get(&node) {
        Some(Mark::Done) => return None,
        Some(Mark::Visiting) => {
            let start = stack.iter().position(|n| *n == node)?;
            let mut cycle = stack[start..].to_vec();
            cycle.push(node);
            return Some(cycle);
        }
        None => {}
    }
    marks.insert(node, Mark::Visiting);
    stack.push(node);
    for &next in graph.get(&node).into_iter().flatten() {
        if graph.contains_key(&next) {
            if let Some(cycle) = visit(next, graph, marks, stack) {
                return Some(cycle);
            }
        }
    }
    stack.pop();
    marks.insert(node, Mark::Done);
    None
}

/// Finds one cycle in a chain dependency graph, returned as a closed path.
///
/// Edges pointing at chains absent from the graph are ignored.
pub fn find_cycle(graph: &BTreeMap<u64, Vec<u64>>) -> Option<Vec<u64>> {
    let mut marks = HashMap::new();
    let mut stack = Vec::new();
    graph
        .keys()
        .find_map(|&node| visit(node, graph, &mut marks, &mut stack))
}

/// Finds a cycle that passes through `start`, ignoring cycles elsewhere in the graph.
///
/// Searches breadth-first so the shortest such cycle is returned.
pub fn find_cycle_through(graph: &BTreeMap<u64, Vec<u64>>, start: u64) -> Option<Vec<u64>> {
    let mut parent: HashMap<u64, u64> = HashMap::new();
    let mut queue = VecDeque::from([start]);
    while let Some(node) = queue.pop_front() {
        for &next in graph.get(&node).into_iter().flatten() {
            if next == start {
                let mut trail = Vec::new();
                let mut at = node;
                while at != start {
                    trail.push(at);
                    match parent.get(&at) {
                        Some(&up) => at = up,
                        None => break,
                    }
                }
                let mut cycle = vec![start];
                cycle.extend(trail.into_iter().rev());
                cycle.push(start);
                return Some(cycle);
            }
            if graph.contains_key(&next) && !parent.contains_key(&next) {
                parent.insert(next, node);
                queue.push_back(next);
            }
        }
    }
    None
}

fn dependency_graph(chains: &[Chain]) -> BTreeMap<u64, Vec<u64>> {
    chains.iter().map(|c| (c.id, c.upstream().collect())).collect()
}

impl CommandStore {
    /// Lists every consistency problem in the loaded document.
    pub fn verify_integrity(&self) -> Vec<IntegrityIssue> {
        let mut issues = Vec::new();

        let mut command_ids = BTreeSet::new();
        for command in &self.commands {
            if !command_ids.insert(command.id) {
                issues.push(IntegrityIssue::DuplicateCommandId(command.id));
            }
        }
        let mut chain_ids = BTreeSet::new();
        for chain in &self.chains {
            if !chain_ids.insert(chain.id) {
                issues.push(IntegrityIssue::DuplicateChainId(chain.id));
            }
        }

        for chain in &self.chains {
            for missing in chain.upstream().filter(|id| !chain_ids.contains(id)) {
                issues.push(IntegrityIssue::MissingDependency { chain: chain.id, missing });
            }
            let referenced: BTreeSet<u64> = chain.steps.iter().flat_map(|s| s.referenced_commands()).collect();
            for command in referenced.into_iter().filter(|id| !command_ids.contains(id)) {
                issues.push(IntegrityIssue::MissingCommand { chain: chain.id, command });
            }
        }

        for command in &self.commands {
            if is_unset(&command.timestamp) {
                issues.push(IntegrityIssue::UnsetTimestamp(command.id));
            }
            if command.success_count > command.run_count {
                issues.push(IntegrityIssue::SuccessExceedsRuns(command.id));
            }
        }

        if let Some(cycle) = find_cycle(&dependency_graph(&self.chains)) {
            issues.push(IntegrityIssue::DependencyCycle(cycle));
        }
        issues
    }

    /// Fixes what can be fixed mechanically and saves; returns the number of repairs.
    ///
    /// Steps whose primary command is missing are left alone and still show up
    /// in [`CommandStore::verify_integrity`].
    pub fn repair_integrity(&mut self) -> Result<usize> {
        let mut repairs = 0;

        let mut seen = BTreeSet::new();
        let before = self.commands.len();
        self.commands.retain(|c| seen.insert(c.id));
        repairs += before - self.commands.len();

        let mut seen = BTreeSet::new();
        let before = self.chains.len();
        self.chains.retain(|c| seen.insert(c.id));
        repairs += before - self.chains.len();

        let chain_ids: BTreeSet<u64> = self.chains.iter().map(|c| c.id).collect();
        let command_ids: BTreeSet<u64> = self.commands.iter().map(|c| c.id).collect();
        for chain in &mut self.chains {
            for dependency in &mut chain.dependencies {
                let before = dependency.depends_on.len();
                dependency.depends_on.retain(|id| chain_ids.contains(id));
                repairs += before - dependency.depends_on.len();
            }
            chain.dependencies.retain(|d| !d.depends_on.is_empty());
            for step in &mut chain.steps {
                for list in [&mut step.parallel_with, &mut step.on_success, &mut step.on_failure] {
                    let before = list.len();
                    list.retain(|id| command_ids.contains(id));
                    repairs += before - list.len();
                }
            }
        }

        // break cycles by dropping the edge that closes each one
        while let Some(cycle) = find_cycle(&dependency_graph(&self.chains)) {
            let (from, to) = (cycle[cycle.len() - 2], cycle[cycle.len() - 1]);
            tracing::warn!(from, to, "dropping dependency edge to break a cycle");
            for chain in self.chains.iter_mut().filter(|c| c.id == from) {
                for dependency in &mut chain.dependencies {
                    dependency.depends_on.retain(|id| *id != to);
                }
                chain.dependencies.retain(|d| !d.depends_on.is_empty());
            }
            repairs += 1;
        }

        let now = Utc::now();
        for command in &mut self.commands {
            repairs += usize::from(fix_command(command, now));
        }

        self.save()?;
        Ok(repairs)
    }
}

fn fix_command(command: &mut Command, now: chrono::DateTime<Utc>) -> bool {
    let mut changed = false;
    if is_unset(&command.timestamp) {
        command.timestamp = now;
        changed = true;
    }
    if command.success_count > command.run_count {
        command.success_count = command.run_count;
        changed = true;
    }
    changed
}
