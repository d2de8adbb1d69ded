//! Analysis run scheduler.
//!
//! The [`Orchestrator`] drives a [`TaskGraph`] to completion. Each round it
//! starts every ready node as a task in a `JoinSet`, with a `Semaphore`
//! bounding how many generation calls are in flight, then waits for the
//! next task to finish and records the outcome in the [`RunState`]. A
//! failed node fails its transitive dependents without invoking them. A
//! node whose task panics fails the same way; its siblings keep running.
//!
//! Node prompts are assembled from:
//!
//! 1. the role's task plus depth and verbosity instructions,
//! 2. for the coordinator, a deterministic overview of the project,
//! 3. the outputs of the node's direct dependencies,
//! 4. code retrieved for the node's queries and for any
//!    `semantic_queries` emitted upstream.
//!
//! Cancelling the token aborts in-flight tasks and marks every
//! non-terminal node `failed(cancelled)`; the partial report is still
//! assembled. A stored partial report can be resumed: roles that finished
//! keep their output and only the rest are run again.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use codescope_core::analysis::AnalysisSettings;
use codescope_core::context::truncate_chars;
use codescope_core::error::FailureReason;
use codescope_core::generation::{GenerationConfig, Generator};
use codescope_core::graph::{RunState, TaskGraph};
use codescope_core::index::ScoredChunk;
use codescope_core::overview::ProjectOverview;
use codescope_core::report::{parse_role_output, AnalysisReport, RoleOutcome};
use codescope_core::retrieve::Retriever;
use codescope_core::roles::AgentRole;

use crate::progress::{ProgressEvent, ProgressReporter};
use crate::services::Services;

/// Key under which the coordinator proposes extra retrieval queries.
const SEMANTIC_QUERIES: &str = "semantic_queries";

/// Everything a node task needs, owned so it can move into the task.
struct NodeJob {
    role: AgentRole,
    snapshot_id: String,
    queries: Vec<String>,
    upstream: Vec<(AgentRole, Value)>,
    overview: Option<String>,
}

type NodeResult = (AgentRole, Result<Value, FailureReason>);

pub struct Orchestrator {
    generator: Arc<dyn Generator>,
    retriever: Arc<Retriever>,
    concurrency: usize,
    overview: Option<String>,
}

impl Orchestrator {
    pub fn new(generator: Arc<dyn Generator>, retriever: Arc<Retriever>, concurrency: usize) -> Self {
        Self {
            generator,
            retriever,
            concurrency: concurrency.max(1),
            overview: None,
        }
    }

    /// Project overview handed to the coordinator.
    pub fn with_overview(mut self, overview: &ProjectOverview) -> Self {
        self.overview = Some(overview.render());
        self
    }

    /// Run every node of `graph` against `snapshot_id`.
    ///
    /// Always returns a report with one entry per node, unless the run is
    /// rejected up front.
    pub async fn run(
        &self,
        snapshot_id: &str,
        graph: &TaskGraph,
        settings: &AnalysisSettings,
        cancel: CancellationToken,
        progress: &dyn ProgressReporter,
    ) -> Result<AnalysisReport> {
        settings.validate()?;
        self.drive(snapshot_id, RunState::new(graph), settings, cancel, progress)
            .await
    }

    /// Run again the roles of `previous` that did not finish.
    ///
    /// Roles that are done in `previous` keep their output and are not
    /// invoked. The result is a new report with its own run id.
    pub async fn resume(
        &self,
        previous: &AnalysisReport,
        graph: &TaskGraph,
        settings: &AnalysisSettings,
        cancel: CancellationToken,
        progress: &dyn ProgressReporter,
    ) -> Result<AnalysisReport> {
        settings.validate()?;
        let completed: Vec<(AgentRole, Value)> = previous
            .entries
            .iter()
            .filter_map(|(role, outcome)| match outcome {
                RoleOutcome::Done { output } => Some((*role, output.clone())),
                RoleOutcome::Failed { .. } => None,
            })
            .collect();
        info!(previous = %previous.id, reused = completed.len(), "resuming analysis");
        let run = RunState::resume(graph, completed);
        self.drive(&previous.snapshot_id, run, settings, cancel, progress)
            .await
    }

    async fn drive(
        &self,
        snapshot_id: &str,
        mut run: RunState<'_>,
        settings: &AnalysisSettings,
        cancel: CancellationToken,
        progress: &dyn ProgressReporter,
    ) -> Result<AnalysisReport> {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now().timestamp();
        let total = run.graph().len();
        info!(run = %run_id, snapshot = snapshot_id, roles = total, depth = settings.depth.as_str(), "analysis started");

        let settings = Arc::new(settings.clone());
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<NodeResult> = JoinSet::new();
        let mut task_roles: HashMap<Id, AgentRole> = HashMap::new();

        loop {
            if cancel.is_cancelled() {
                cancel_run(&mut tasks, &mut run);
                break;
            }

            for role in run.start_ready() {
                let job = self.job(snapshot_id, role, &run);
                debug!(role = %role, queries = job.queries.len(), "node started");
                let generator = Arc::clone(&self.generator);
                let retriever = Arc::clone(&self.retriever);
                let settings = Arc::clone(&settings);
                let semaphore = Arc::clone(&semaphore);
                let handle = tasks.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return (job.role, Err(FailureReason::Cancelled));
                    };
                    let role = job.role;
                    (role, run_node(job, generator.as_ref(), &retriever, &settings).await)
                });
                task_roles.insert(handle.id(), role);
            }

            if run.is_finished() {
                break;
            }

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                joined = tasks.join_next_with_id() => Some(joined),
            };
            let Some(joined) = next else {
                cancel_run(&mut tasks, &mut run);
                break;
            };

            match joined {
                Some(Ok((id, (role, result)))) => {
                    task_roles.remove(&id);
                    record(&mut run, role, result);
                }
                Some(Err(e)) => match task_roles.remove(&e.id()) {
                    Some(role) => {
                        error!(role = %role, error = %e, "analysis task panicked");
                        let reason = FailureReason::Panicked {
                            message: panic_message(e),
                        };
                        record(&mut run, role, Err(reason));
                    }
                    None => {
                        error!(error = %e, "unknown analysis task failed");
                        cancel_run(&mut tasks, &mut run);
                        break;
                    }
                },
                None => {
                    warn!("no runnable roles left; cancelling the rest of the run");
                    run.cancel();
                    break;
                }
            }

            let done = run.terminal_count();
            info!("{}/{} roles terminal", done, total);
            progress.report(ProgressEvent::Analyzing {
                n: done as u64,
                total: total as u64,
            });
        }

        let report = AnalysisReport::assemble(
            run_id,
            snapshot_id,
            &settings,
            started_at,
            Utc::now().timestamp(),
            run.into_states(),
        );
        info!(
            run = %report.id,
            failed = report.failed_roles().len(),
            "analysis finished"
        );
        Ok(report)
    }

    fn job(&self, snapshot_id: &str, role: AgentRole, run: &RunState<'_>) -> NodeJob {
        let graph = run.graph();
        let node = graph.node(role);
        let mut queries: Vec<String> = node.map(|n| n.queries.clone()).unwrap_or_default();

        // Queries proposed by any completed ancestor.
        for ancestor in graph.roles() {
            if !graph.transitive_dependents(ancestor).contains(&role) {
                continue;
            }
            if let Some(extra) = run
                .output(ancestor)
                .and_then(|o| o.get(SEMANTIC_QUERIES))
                .and_then(Value::as_array)
            {
                for q in extra.iter().filter_map(Value::as_str) {
                    if !queries.iter().any(|existing| existing == q) {
                        queries.push(q.to_string());
                    }
                }
            }
        }

        let upstream = node
            .map(|n| {
                n.depends_on
                    .iter()
                    .filter_map(|dep| run.output(*dep).map(|o| (*dep, o.clone())))
                    .collect()
            })
            .unwrap_or_default();

        let overview = match role {
            AgentRole::Coordinator => self.overview.clone(),
            _ => None,
        };

        NodeJob {
            role,
            snapshot_id: snapshot_id.to_string(),
            queries,
            upstream,
            overview,
        }
    }
}

fn record(run: &mut RunState<'_>, role: AgentRole, result: Result<Value, FailureReason>) {
    match result {
        Ok(output) => {
            run.complete(role, output);
            info!(role = %role, "role done");
        }
        Err(reason) => {
            warn!(role = %role, %reason, "role failed");
            for dependent in run.fail(role, reason) {
                warn!(role = %dependent, upstream = %role, "role skipped");
            }
        }
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic without a message".to_string()
    }
}

fn cancel_run(tasks: &mut JoinSet<NodeResult>, run: &mut RunState<'_>) {
    tasks.abort_all();
    let cancelled = run.cancel();
    if !cancelled.is_empty() {
        warn!(roles = cancelled.len(), "analysis cancelled");
    }
}

async fn run_node(
    job: NodeJob,
    generator: &dyn Generator,
    retriever: &Retriever,
    settings: &AnalysisSettings,
) -> Result<Value, FailureReason> {
    let params = settings.depth.parameters();
    let chunks = retriever
        .retrieve_many(&job.snapshot_id, &job.queries, params.retrieval_k, params.chunk_limit)
        .await;
    let prompt = build_prompt(
        job.role,
        settings,
        job.overview.as_deref(),
        &job.upstream,
        &chunks,
    );
    let config = GenerationConfig {
        max_output_tokens: settings.verbosity.max_output_tokens(),
        temperature: settings.temperature_for(job.role),
        role_system_prompt: job.role.system_prompt().to_string(),
    };
    debug!(role = %job.role, chunks = chunks.len(), prompt_chars = prompt.len(), "invoking generator");
    let response = generator.generate(&prompt, &config).await?;
    parse_role_output(job.role, &response)
}

/// Render a node prompt within the depth's character budget.
///
/// The project overview and dependency findings are placed before code
/// context; code chunks are added best first until the budget runs out.
pub fn build_prompt(
    role: AgentRole,
    settings: &AnalysisSettings,
    overview: Option<&str>,
    upstream: &[(AgentRole, Value)],
    chunks: &[ScoredChunk],
) -> String {
    let params = settings.depth.parameters();
    let budget = params.prompt_chars;

    let mut prompt = format!(
        "## Task\n{}\n\nProduce a {}.\n{}\n\nRespond with one JSON object containing the keys: {}.\n",
        role.task(),
        params.detail_level,
        settings.verbosity.instructions(),
        role.required_keys().join(", "),
    );

    if let Some(overview) = overview {
        prompt.push_str("\n## Project overview\n");
        prompt.push_str(overview);
    }

    if !upstream.is_empty() {
        prompt.push_str("\n## Findings from other analysts\n");
        let share = budget.saturating_sub(prompt.chars().count()) / 2 / upstream.len();
        for (dep, output) in upstream {
            let rendered = serde_json::to_string_pretty(output).unwrap_or_default();
            prompt.push_str(&format!("\n### {}\n{}\n", dep.title(), truncate_chars(&rendered, share)));
        }
    }

    if !chunks.is_empty() {
        prompt.push_str("\n## Code context\n");
        for hit in chunks {
            let header = format!("\n### {} ({})\n```\n", hit.chunk.location(), hit.chunk.language.as_str());
            let room = budget
                .saturating_sub(prompt.chars().count())
                .saturating_sub(header.chars().count() + 5);
            if room < 40 {
                break;
            }
            prompt.push_str(&header);
            prompt.push_str(&truncate_chars(hit.chunk.text.trim_end(), room));
            prompt.push_str("\n```\n");
        }
    }

    truncate_chars(&prompt, budget)
}

fn orchestrator_for(services: &Services, overview: &ProjectOverview) -> Orchestrator {
    Orchestrator::new(
        Arc::clone(&services.generator),
        Arc::clone(&services.retriever),
        services.config.analysis.concurrency,
    )
    .with_overview(overview)
}

async fn project_overview(services: &Services, snapshot_id: &str) -> Result<ProjectOverview> {
    let chunks = services.store.list_chunks(snapshot_id).await?;
    let overview = ProjectOverview::from_chunks(&chunks);
    debug!(
        snapshot = snapshot_id,
        files = overview.total_files,
        entry_points = overview.entry_points.len(),
        "project overview built"
    );
    Ok(overview)
}

/// Plan, run and store an analysis of `snapshot_id`.
pub async fn analyze(
    services: &Services,
    snapshot_id: &str,
    settings: &AnalysisSettings,
    cancel: CancellationToken,
    progress: &dyn ProgressReporter,
) -> Result<AnalysisReport> {
    let snapshot = services.indexed_snapshot(snapshot_id).await?;
    let graph = TaskGraph::plan(&settings.roles)?;
    let overview = project_overview(services, &snapshot.id).await?;
    let report = orchestrator_for(services, &overview)
        .run(&snapshot.id, &graph, settings, cancel, progress)
        .await?;
    services.store.save_report(&report).await?;
    Ok(report)
}

/// Resume the stored run `run_id` of `snapshot_id` and store the result
/// as a new report.
///
/// The run keeps its depth, verbosity and roles. Fails when the run does
/// not exist, belongs to another snapshot, or has nothing left to do.
pub async fn resume_analysis(
    services: &Services,
    snapshot_id: &str,
    run_id: &str,
    cancel: CancellationToken,
    progress: &dyn ProgressReporter,
) -> Result<AnalysisReport> {
    let snapshot = services.indexed_snapshot(snapshot_id).await?;
    let previous = services
        .store
        .get_report(run_id)
        .await?
        .ok_or_else(|| anyhow!("Analysis run {} not found", run_id))?;
    if previous.snapshot_id != snapshot.id {
        bail!(
            "Analysis run {} belongs to snapshot {}, not {}",
            run_id,
            previous.snapshot_id,
            snapshot.id
        );
    }
    if previous.succeeded() {
        bail!("Analysis run {} already finished every role; nothing to resume", run_id);
    }

    let settings = AnalysisSettings {
        depth: previous.depth,
        verbosity: previous.verbosity,
        roles: previous.requested_roles.clone(),
        temperature: services.config.generation.temperature,
    };
    let graph = TaskGraph::plan(&settings.roles)?;
    let overview = project_overview(services, &snapshot.id).await?;
    let report = orchestrator_for(services, &overview)
        .resume(&previous, &graph, &settings, cancel, progress)
        .await?;
    services.store.save_report(&report).await?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use codescope_core::analysis::{Depth, Verbosity};
    use codescope_core::models::{CodeChunk, Language};
    use serde_json::json;

    fn settings() -> AnalysisSettings {
        AnalysisSettings {
            depth: Depth::Quick,
            verbosity: Verbosity::Low,
            roles: vec![AgentRole::Sde],
            temperature: 0.3,
        }
    }

    fn scored(i: u32, text: &str) -> ScoredChunk {
        ScoredChunk {
            chunk: Arc::new(CodeChunk {
                id: format!("c{}", i),
                snapshot_id: "s".to_string(),
                path: format!("src/m{}.rs", i),
                language: Language::Rust,
                start_line: 1,
                end_line: 10,
                start_byte: 0,
                end_byte: text.len() as u64,
                ordinal: i,
                text: text.to_string(),
                hash: String::new(),
            }),
            score: 1.0 - i as f32 * 0.1,
        }
    }

    #[test]
    fn test_prompt_contains_task_keys_and_context() {
        let upstream = vec![(AgentRole::BestPractice, json!({"overall_assessment": "solid"}))];
        let prompt = build_prompt(AgentRole::Sde, &settings(), None, &upstream, &[scored(0, "fn main() {}")]);
        assert!(prompt.contains(AgentRole::Sde.task()));
        assert!(prompt.contains("architecture_summary"));
        assert!(prompt.contains("Be concise"));
        assert!(prompt.contains("solid"));
        assert!(prompt.contains("src/m0.rs:L1-10 (rust)"));
    }

    #[test]
    fn test_prompt_respects_depth_budget() {
        let big = "x".repeat(5_000);
        let chunks: Vec<ScoredChunk> = (0..10).map(|i| scored(i, &big)).collect();
        let prompt = build_prompt(AgentRole::Sde, &settings(), None, &[], &chunks);
        assert!(prompt.chars().count() <= Depth::Quick.parameters().prompt_chars);
        assert!(prompt.contains("src/m0.rs"));
        assert!(!prompt.contains("src/m9.rs"));
    }

    #[test]
    fn test_overview_precedes_code_context() {
        let overview = "Files: 2\nEntry points: src/main.rs\n";
        let prompt = build_prompt(
            AgentRole::Coordinator,
            &settings(),
            Some(overview),
            &[],
            &[scored(0, "fn main() {}")],
        );
        let at = prompt.find("## Project overview\nFiles: 2").unwrap();
        assert!(at < prompt.find("## Code context").unwrap());
        assert!(!build_prompt(AgentRole::Coordinator, &settings(), None, &[], &[]).contains("Project overview"));
    }
}
