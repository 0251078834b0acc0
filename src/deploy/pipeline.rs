//! Deployment pipeline: steps over the hosts of one stage
//!
//! Hosts are the parties of a grid and steps are its phases. A host whose
//! step fails is broken for the rest of the run while the other hosts keep
//! going; the report says which hosts got through each step.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::BearConfig;
use crate::core::errors::{BearError, Result};
use crate::core::pool::WorkerPool;
use crate::deploy::releases::ReleasesLayout;
use crate::deploy::remote::{CommandOutput, CommandRunner, HostAddress};
use crate::deploy::shell;
use crate::grid::{Grid, GridObserver, OnceEntered, PartyState, Phase, PhaseContext, PhaseKey};

/// A host of the stage being deployed; the input of one party
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub address: HostAddress,
}

type TaskFn =
    dyn Fn(HostContext) -> BoxFuture<'static, anyhow::Result<Vec<CommandOutput>>> + Send + Sync;

#[derive(Clone)]
enum StepAction {
    /// Run on every host
    Commands(Vec<String>),
    /// Run once for the whole stage, on whichever host gets there first
    Shared(Vec<String>),
    /// Arbitrary per-host work
    Task(Arc<TaskFn>),
}

/// One step of a deployment
#[derive(Clone)]
pub struct Step {
    name: String,
    action: StepAction,
    as_root: bool,
    wait_timeout: Option<Duration>,
}

impl Step {
    /// Commands run on every host, in order, stopping at the first failure
    pub fn commands<I, S>(name: impl Into<String>, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            action: StepAction::Commands(commands.into_iter().map(Into::into).collect()),
            as_root: false,
            wait_timeout: None,
        }
    }

    /// Commands run once for the whole stage. The first host to reach the
    /// step runs them; every host records the same output.
    pub fn shared<I, S>(name: impl Into<String>, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            action: StepAction::Shared(commands.into_iter().map(Into::into).collect()),
            as_root: false,
            wait_timeout: None,
        }
    }

    /// Custom work per host, e.g. release bookkeeping
    pub fn task<F, Fut>(name: impl Into<String>, task: F) -> Self
    where
        F: Fn(HostContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Vec<CommandOutput>>> + Send + 'static,
    {
        let task: Arc<TaskFn> = Arc::new(move |ctx: HostContext| task(ctx).boxed());
        Self {
            name: name.into(),
            action: StepAction::Task(task),
            as_root: false,
            wait_timeout: None,
        }
    }

    /// Run this step's commands through `sudo`
    pub fn as_root(mut self) -> Self {
        self.as_root = true;
        self
    }

    /// Bound for hosts waiting on another host's run of this shared step.
    /// Defaults to the deployment's `wait_timeout_ms`.
    pub fn wait_timeout(mut self, limit: Duration) -> Self {
        self.wait_timeout = Some(limit);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.action, StepAction::Shared(_))
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.action {
            StepAction::Commands(c) => format!("commands({})", c.len()),
            StepAction::Shared(c) => format!("shared({})", c.len()),
            StepAction::Task(_) => "task".to_string(),
        };
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("kind", &kind)
            .field("as_root", &self.as_root)
            .field("wait_timeout", &self.wait_timeout)
            .finish()
    }
}

/// What a step body can reach on its host
#[derive(Clone)]
pub struct HostContext {
    runner: Arc<dyn CommandRunner>,
    target: Target,
    layout: ReleasesLayout,
    as_root: bool,
}

impl HostContext {
    pub fn host(&self) -> &HostAddress {
        &self.target.address
    }

    pub fn host_name(&self) -> &str {
        &self.target.name
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    pub fn releases_layout(&self) -> &ReleasesLayout {
        &self.layout
    }

    /// Run one command; a non-zero exit is an error
    pub async fn run(&self, command: &str) -> anyhow::Result<CommandOutput> {
        let command = if self.as_root {
            shell::sudo(command)
        } else {
            command.to_string()
        };
        let output = self.runner.run(self.host(), &command).await?;
        Ok(output.check(self.host(), &command)?)
    }

    pub async fn run_all<S: AsRef<str>>(&self, commands: &[S]) -> anyhow::Result<Vec<CommandOutput>> {
        let mut outputs = Vec::with_capacity(commands.len());
        for command in commands {
            outputs.push(self.run(command.as_ref()).await?);
        }
        Ok(outputs)
    }
}

/// Result of one step on one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutput {
    pub host: String,
    /// Host whose commands produced `outputs`; differs from `host` for
    /// shared steps run by another host
    pub ran_on: String,
    pub outputs: Vec<CommandOutput>,
}

struct SharedRun {
    ran_on: String,
    outputs: Vec<CommandOutput>,
}

struct StepRuntime {
    step: Step,
    runner: Arc<dyn CommandRunner>,
    layout: ReleasesLayout,
    wait_timeout: Duration,
    shared: OnceEntered<SharedRun>,
}

impl StepRuntime {
    fn host_context(&self, target: &Target) -> HostContext {
        HostContext {
            runner: self.runner.clone(),
            target: target.clone(),
            layout: self.layout.clone(),
            as_root: self.step.as_root,
        }
    }
}

async fn run_step(ctx: PhaseContext<Target>, runtime: Arc<StepRuntime>) -> anyhow::Result<StepOutput> {
    let target = ctx.input();
    let host = runtime.host_context(target);

    match &runtime.step.action {
        StepAction::Commands(commands) => Ok(StepOutput {
            host: target.name.clone(),
            ran_on: target.name.clone(),
            outputs: host.run_all(commands).await?,
        }),
        StepAction::Task(task) => Ok(StepOutput {
            host: target.name.clone(),
            ran_on: target.name.clone(),
            outputs: (**task)(host).await?,
        }),
        StepAction::Shared(commands) => {
            let commands = commands.clone();
            let ran_on = target.name.clone();
            let flight = runtime
                .shared
                .run_once(ctx.party().index(), move || async move {
                    let outputs = host.run_all(&commands).await?;
                    Ok(SharedRun { ran_on, outputs })
                });

            let run = if flight.is_owner() {
                info!("{} runs shared step '{}'", target.name, runtime.step.name);
                flight.wait().await?
            } else {
                debug!(
                    "{} waits for shared step '{}' run by party {}",
                    target.name,
                    runtime.step.name,
                    flight.owner()
                );
                match tokio::time::timeout(runtime.wait_timeout, flight.wait()).await {
                    Ok(result) => result?,
                    Err(_) => anyhow::bail!(
                        "timed out after {:?} waiting for shared step '{}'",
                        runtime.wait_timeout,
                        runtime.step.name
                    ),
                }
            };
            Ok(StepOutput {
                host: target.name.clone(),
                ran_on: run.ran_on.clone(),
                outputs: run.outputs.clone(),
            })
        }
    }
}

/// Runs a list of steps over the hosts of one stage
pub struct Deployment {
    name: String,
    stage: String,
    targets: Vec<Target>,
    steps: Vec<Step>,
    runner: Arc<dyn CommandRunner>,
    pool: WorkerPool,
    layout: ReleasesLayout,
    wait_timeout: Duration,
    observers: Vec<Arc<dyn GridObserver>>,
}

impl Deployment {
    pub fn for_stage(
        config: &BearConfig,
        stage: &str,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        config.validate()?;
        let stage_config = config.stage(stage)?;
        let targets = stage_config
            .hosts
            .iter()
            .map(|host| Target {
                name: host.name.clone(),
                address: host.host_address(),
            })
            .collect();

        Ok(Self {
            name: config.name.clone(),
            stage: stage_config.name.clone(),
            targets,
            steps: Vec::new(),
            runner,
            pool: WorkerPool::new(config.max_workers)?,
            layout: ReleasesLayout::from_config(&config.releases),
            wait_timeout: config.wait_timeout(),
            observers: Vec::new(),
        })
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn GridObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Run on an existing pool instead of one sized from the config
    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Run every step on every host and wait for all hosts to finish
    pub async fn run(&self) -> Result<DeploymentReport> {
        if self.steps.is_empty() {
            return Err(BearError::validation("deployment has no steps"));
        }

        let run_id = cuid2::create_id();
        let started_at = Utc::now();
        info!(
            "Deploying {} to {} ({} hosts, {} steps), run {}",
            self.name,
            self.stage,
            self.targets.len(),
            self.steps.len(),
            run_id
        );

        let mut builder = Grid::builder(self.steps.len(), self.targets.clone())
            .name(format!("{}:{}", self.name, self.stage));
        for observer in &self.observers {
            builder = builder.with_observer(observer.clone());
        }

        let mut keys: Vec<PhaseKey<StepOutput>> = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let runtime = Arc::new(StepRuntime {
                step: step.clone(),
                runner: self.runner.clone(),
                layout: self.layout.clone(),
                wait_timeout: step.wait_timeout.unwrap_or(self.wait_timeout),
                shared: OnceEntered::new(),
            });
            let phase = Phase::from_fn(step.name.clone(), move |ctx: PhaseContext<Target>| {
                run_step(ctx, runtime.clone())
            });
            keys.push(builder.add_phase(phase)?);
        }

        let grid = builder.start(&self.pool)?;
        grid.join().await;

        let mut steps = Vec::with_capacity(keys.len());
        for (step, key) in self.steps.iter().zip(keys) {
            let results = grid.aggregate_successful(key).await?;
            let mut report = StepReport {
                name: step.name.clone(),
                shared: step.is_shared(),
                ran_on: None,
                succeeded: Vec::new(),
                failed: Vec::new(),
            };
            for (target, result) in self.targets.iter().zip(results) {
                match result {
                    Some(output) => {
                        if report.shared {
                            report.ran_on = Some(output.ran_on.clone());
                        }
                        report.succeeded.push(target.name.clone());
                    }
                    None => report.failed.push(target.name.clone()),
                }
            }
            steps.push(report);
        }

        let hosts = grid
            .parties()
            .iter()
            .map(|party| HostReport {
                name: party.input().name.clone(),
                address: party.input().address.to_string(),
                state: party.state(),
                broken_at: party.broken_at().map(|phase| self.steps[phase].name.clone()),
                error: party.failure().map(|e| e.to_string()),
            })
            .collect();

        let report = DeploymentReport {
            run_id,
            name: self.name.clone(),
            stage: self.stage.clone(),
            started_at,
            finished_at: Utc::now(),
            steps,
            hosts,
        };

        if report.success() {
            info!("Deployment {} succeeded on every host", report.run_id);
        } else {
            warn!(
                "Deployment {} failed on {:?}",
                report.run_id,
                report.failed_hosts()
            );
        }
        Ok(report)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub name: String,
    pub shared: bool,
    /// Host that ran a shared step
    pub ran_on: Option<String>,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostReport {
    pub name: String,
    pub address: String,
    pub state: PartyState,
    /// Step in which the host broke
    pub broken_at: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentReport {
    pub run_id: String,
    pub name: String,
    pub stage: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<StepReport>,
    pub hosts: Vec<HostReport>,
}

impl DeploymentReport {
    pub fn success(&self) -> bool {
        self.hosts.iter().all(|host| host.state == PartyState::Active)
    }

    pub fn failed_hosts(&self) -> Vec<&str> {
        self.hosts
            .iter()
            .filter(|host| host.state == PartyState::Broken)
            .map(|host| host.name.as_str())
            .collect()
    }

    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|step| step.name == name)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
