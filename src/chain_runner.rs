use std::fmt;
use std::time::Duration;

use crate::condition::{self, ExecutionContext};
use crate::error::{Handler, Result, SaveError};
use crate::executor::{Deadline, StepExecutor, StepOutcome};
use crate::storage::{Chain, ChainDependency, ChainStep, WaitPolicy};
use crate::store_manager::CommandStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    ResolvingDependencies,
    RunningSteps,
    Succeeded,
    Failed,
}

impl fmt::Display for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChainState::ResolvingDependencies => "resolving dependencies",
            ChainState::RunningSteps => "running steps",
            ChainState::Succeeded => "succeeded",
            ChainState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Runs chains: dependencies first, then each step with its conditions,
/// parallel peers and handlers. Every dispatched command and every chain
/// invocation is folded into the store's statistics.
pub struct ChainRunner<'a> {
    store: &'a mut CommandStore,
    executor: StepExecutor<'a>,
    step_timeout: Option<Duration>,
    in_progress: Vec<u64>,
}

impl<'a> ChainRunner<'a> {
    pub fn new(store: &'a mut CommandStore, executor: StepExecutor<'a>) -> Self {
        Self {
            store,
            executor,
            step_timeout: None,
            in_progress: Vec::new(),
        }
    }

    pub fn with_step_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn run(&mut self, chain_id: u64) -> Result<()> {
        if let Some(pos) = self.in_progress.iter().position(|id| *id == chain_id) {
            let mut cycle = self.in_progress[pos..].to_vec();
            cycle.push(chain_id);
            return Err(SaveError::CyclicDependency { cycle });
        }
        let chain = self.store.chain(chain_id)?.clone();

        tracing::info!(chain_id, name = %chain.name, "starting chain");
        self.in_progress.push(chain_id);
        let result = self.run_chain(&chain);
        self.in_progress.pop();
        self.finish(chain_id, result)
    }

    fn transition(&self, chain_id: u64, state: ChainState) {
        tracing::debug!(chain_id, %state, "chain state");
    }

    fn finish(&mut self, chain_id: u64, result: Result<()>) -> Result<()> {
        let state = if result.is_ok() {
            ChainState::Succeeded
        } else {
            ChainState::Failed
        };
        self.transition(chain_id, state);
        match &result {
            Ok(()) => tracing::info!(chain_id, "chain finished"),
            Err(e) => tracing::info!(chain_id, error = %e, "chain failed"),
        }

        match self.store.record_chain_run(chain_id, result.is_ok()) {
            Ok(()) => result,
            Err(e) if result.is_err() => {
                tracing::error!(chain_id, error = %e, "could not record chain statistics");
                result
            }
            Err(e) => Err(e),
        }
    }

    fn run_chain(&mut self, chain: &Chain) -> Result<()> {
        self.transition(chain.id, ChainState::ResolvingDependencies);
        for dependency in &chain.dependencies {
            self.resolve_dependency(dependency)?;
        }

        self.transition(chain.id, ChainState::RunningSteps);
        let mut context = ExecutionContext::default();
        for (index, step) in chain.steps.iter().enumerate() {
            if !condition::evaluate(&step.conditions, &context) {
                tracing::debug!(chain_id = chain.id, step = index + 1, "conditions not met, skipping step");
                continue;
            }
            self.run_step(chain.id, index, step, &mut context)?;
        }
        Ok(())
    }

    fn resolve_dependency(&mut self, dependency: &ChainDependency) -> Result<()> {
        match dependency.wait_policy {
            WaitPolicy::All => {
                for &upstream in &dependency.depends_on {
                    self.run(upstream)
                        .map_err(|e| dependency_failure(upstream, WaitPolicy::All, e))?;
                }
                Ok(())
            }
            WaitPolicy::Any => {
                let mut last_failure = None;
                for &upstream in &dependency.depends_on {
                    match self.run(upstream) {
                        Ok(()) => return Ok(()),
                        Err(e @ SaveError::CyclicDependency { .. }) => return Err(e),
                        Err(e) => {
                            tracing::warn!(upstream, error = %e, "dependency chain failed, trying the next one");
                            last_failure = Some((upstream, e));
                        }
                    }
                }
                match last_failure {
                    Some((upstream, e)) => Err(dependency_failure(upstream, WaitPolicy::Any, e)),
                    None => Ok(()),
                }
            }
        }
    }

    fn run_step(&mut self, chain_id: u64, index: usize, step: &ChainStep, context: &mut ExecutionContext) -> Result<()> {
        self.store.command(step.command_id)?;
        let deadline = self.step_timeout.map(Deadline::after);
        tracing::debug!(
            chain_id,
            step = index + 1,
            command_id = step.command_id,
            peers = ?step.parallel_with,
            "dispatching step"
        );

        let primary = if step.parallel_with.is_empty() {
            self.executor.run(self.store, step.command_id, deadline)
        } else {
            let group = self
                .executor
                .run_group(self.store, step.command_id, &step.parallel_with, deadline)?;
            for (peer, result) in &group.peers {
                self.record(*peer, result)?;
                if let Err(e) = result {
                    tracing::warn!(chain_id, command_id = *peer, error = %e, "parallel command failed");
                }
            }
            group.primary
        };
        self.record(step.command_id, &primary)?;
        update_context(context, &primary);

        match primary {
            Ok(_) => self.run_handlers(Handler::OnSuccess, &step.on_success),
            Err(cause) => {
                if !self.executor.is_cancelled() {
                    self.run_handlers(Handler::OnFailure, &step.on_failure)?;
                }
                Err(SaveError::StepFailed {
                    command_id: step.command_id,
                    source: Box::new(cause),
                })
            }
        }
    }

    /// Runs handlers in order, stopping at the first failure.
    fn run_handlers(&mut self, handler: Handler, commands: &[u64]) -> Result<()> {
        for &command_id in commands {
            let deadline = self.step_timeout.map(Deadline::after);
            let result = self.executor.run(self.store, command_id, deadline);
            self.record(command_id, &result)?;
            if let Err(e) = result {
                return Err(SaveError::HandlerFailed {
                    handler,
                    command_id,
                    source: Box::new(e),
                });
            }
        }
        Ok(())
    }

    fn record(&mut self, command_id: u64, result: &Result<StepOutcome>) -> Result<()> {
        let exit_code = match result {
            Ok(outcome) => outcome.exit_code,
            Err(SaveError::NotFound { .. }) => return Ok(()),
            Err(e) => e.exit_code().unwrap_or(-1),
        };
        self.store.record_run(command_id, exit_code)
    }
}

fn dependency_failure(chain_id: u64, policy: WaitPolicy, cause: SaveError) -> SaveError {
    match cause {
        SaveError::CyclicDependency { .. } => cause,
        cause => SaveError::DependencyFailure {
            chain_id,
            policy,
            source: Box::new(cause),
        },
    }
}

fn update_context(context: &mut ExecutionContext, result: &Result<StepOutcome>) {
    match result {
        Ok(outcome) => {
            context.last_exit_code = outcome.exit_code;
            context.last_output = outcome.output.clone();
            context.last_error = None;
        }
        Err(e) => {
            context.last_exit_code = e.exit_code().unwrap_or(-1);
            context.last_output = e.captured_output().unwrap_or_default().to_string();
            context.last_error = Some(e.to_string());
        }
    }
}
