//! The stage scheduler.
//!
//! Stages declare a name, dependencies, a deadline budget, a policy and an
//! optional contended resource. Stages sharing a resource (`tab:<platform>`)
//! run serially in declaration order; the rest fan out in parallel under a
//! configurable cap. Every stage gets a child deadline clamped to the
//! remaining pipeline budget, and cancelling the pipeline cancels all
//! in-flight stages.
//!
//! Results come back sorted by stage name so downstream merges are
//! deterministic regardless of wall-clock completion order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use bayline_core::deadline::RunDeadline;
use bayline_types::SourceError;

/// Every browser-driven vendor stage contends on this one resource.
pub const SHARED_BROWSER: &str = "tab:shared-browser";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagePolicy {
    Required,
    Optional,
}

/// Static description of one pipeline stage; the orchestrator declares the
/// full set and asserts the dependency graph is sound at startup.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub name: &'static str,
    pub needs: &'static [&'static str],
    pub may_suspend: bool,
    pub timeout: Duration,
    pub policy: StagePolicy,
    pub resource: Option<&'static str>,
}

/// Kahn's algorithm over the stage specs. Errors on unknown dependencies and
/// cycles; returns a valid execution order.
pub fn validate_stages(specs: &[StageSpec]) -> anyhow::Result<Vec<&'static str>> {
    let names: Vec<&'static str> = specs.iter().map(|s| s.name).collect();
    for spec in specs {
        for dep in spec.needs {
            if !names.contains(dep) {
                bail!("stage `{}` depends on unknown stage `{dep}`", spec.name);
            }
        }
    }

    let mut remaining: HashMap<&'static str, Vec<&'static str>> = specs
        .iter()
        .map(|s| (s.name, s.needs.to_vec()))
        .collect();
    let mut order = Vec::with_capacity(specs.len());
    while !remaining.is_empty() {
        let ready: Vec<&'static str> = specs
            .iter()
            .map(|s| s.name)
            .filter(|name| {
                remaining
                    .get(name)
                    .map(|needs| needs.iter().all(|d| !remaining.contains_key(d)))
                    .unwrap_or(false)
            })
            .collect();
        if ready.is_empty() {
            bail!("stage dependency cycle involving: {:?}", remaining.keys().collect::<Vec<_>>());
        }
        for name in ready {
            remaining.remove(name);
            order.push(name);
        }
    }
    Ok(order)
}

/// One unit of fan-out work. The closure receives the stage's own deadline
/// scope; adapters must honor its cancellation at their I/O boundaries.
pub struct FanTask<T> {
    pub name: String,
    pub resource: Option<String>,
    pub timeout: Duration,
    pub run: Box<dyn FnOnce(RunDeadline) -> BoxFuture<'static, Result<T, SourceError>> + Send>,
}

impl<T> FanTask<T> {
    pub fn new<F>(
        name: impl Into<String>,
        resource: Option<&str>,
        timeout: Duration,
        run: F,
    ) -> Self
    where
        F: FnOnce(RunDeadline) -> BoxFuture<'static, Result<T, SourceError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            resource: resource.map(str::to_string),
            timeout,
            run: Box::new(run),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageScheduler {
    max_parallel: usize,
}

impl StageScheduler {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
        }
    }

    /// Runs independent tasks concurrently under `scope`. Tasks sharing a
    /// resource run serially in submission order; the rest run in parallel
    /// capped at `max_parallel`. Results are returned sorted by task name.
    pub async fn fan_out<T: Send + 'static>(
        &self,
        scope: &RunDeadline,
        tasks: Vec<FanTask<T>>,
    ) -> Vec<(String, Result<T, SourceError>)> {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut join_set: JoinSet<Vec<(String, Result<T, SourceError>)>> = JoinSet::new();

        // Partition: each named resource becomes one serial chain.
        let mut serial: HashMap<String, Vec<FanTask<T>>> = HashMap::new();
        let mut parallel: Vec<FanTask<T>> = Vec::new();
        for task in tasks {
            match task.resource.clone() {
                Some(resource) => serial.entry(resource).or_default().push(task),
                None => parallel.push(task),
            }
        }

        for (resource, chain) in serial {
            let scope = scope.clone();
            join_set.spawn(async move {
                debug!(target: "bayline.schedule", resource = %resource, stages = chain.len(), "serial chain start");
                let mut results = Vec::with_capacity(chain.len());
                for task in chain {
                    let child = scope.with_deadline(task.timeout);
                    let name = task.name.clone();
                    let out = child.run((task.run)(child.clone())).await;
                    results.push((name, out));
                }
                results
            });
        }

        for task in parallel {
            let scope = scope.clone();
            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let child = scope.with_deadline(task.timeout);
                let name = task.name.clone();
                let out = child.run((task.run)(child.clone())).await;
                vec![(name, out)]
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(mut chunk) => results.append(&mut chunk),
                Err(err) => {
                    debug!(target: "bayline.schedule", error = %err, "fan-out task panicked");
                }
            }
        }

        // Deterministic observation order regardless of completion order.
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn spec(
        name: &'static str,
        needs: &'static [&'static str],
        policy: StagePolicy,
    ) -> StageSpec {
        StageSpec {
            name,
            needs,
            may_suspend: true,
            timeout: Duration::from_secs(5),
            policy,
            resource: None,
        }
    }

    #[test]
    fn topological_order_respects_needs() {
        let specs = vec![
            spec("identify", &[], StagePolicy::Required),
            spec("classify", &["identify"], StagePolicy::Required),
            spec("research", &["classify"], StagePolicy::Optional),
        ];
        let order = validate_stages(&specs).unwrap();
        assert_eq!(order, vec!["identify", "classify", "research"]);
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let specs = vec![spec("classify", &["nope"], StagePolicy::Required)];
        assert!(validate_stages(&specs).is_err());
    }

    #[test]
    fn cycles_are_rejected() {
        let specs = vec![
            spec("a", &["b"], StagePolicy::Required),
            spec("b", &["a"], StagePolicy::Required),
        ];
        assert!(validate_stages(&specs).is_err());
    }

    #[tokio::test]
    async fn shared_resource_tasks_run_serially() {
        let scheduler = StageScheduler::new(8);
        let scope = RunDeadline::new(Duration::from_secs(10));
        let active = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let max_seen = Arc::new(std::sync::atomic::AtomicU32::new(0));

        let mut tasks = Vec::new();
        for index in 0u32..3 {
            let active = active.clone();
            let max_seen = max_seen.clone();
            tasks.push(FanTask::new(
                format!("browser-{index}"),
                Some(SHARED_BROWSER),
                Duration::from_secs(5),
                move |_deadline| {
                    Box::pin(async move {
                        let now = active.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, std::sync::atomic::Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        active.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                        Ok(index)
                    }) as BoxFuture<'static, Result<u32, SourceError>>
                },
            ));
        }

        let results = scheduler.fan_out(&scope, tasks).await;
        assert_eq!(results.len(), 3);
        assert_eq!(max_seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unshared_tasks_overlap() {
        let scheduler = StageScheduler::new(8);
        let scope = RunDeadline::new(Duration::from_secs(10));
        let started = Instant::now();

        let mut tasks = Vec::new();
        for index in 0u32..4 {
            tasks.push(FanTask::new(
                format!("api-{index}"),
                None,
                Duration::from_secs(5),
                move |_deadline| {
                    Box::pin(async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(index)
                    }) as BoxFuture<'static, Result<u32, SourceError>>
                },
            ));
        }

        let results = scheduler.fan_out(&scope, tasks).await;
        assert_eq!(results.len(), 4);
        // Serial execution would take ≥200ms.
        assert!(started.elapsed() < Duration::from_millis(180));
    }

    #[tokio::test]
    async fn results_sort_by_name_not_completion() {
        let scheduler = StageScheduler::new(8);
        let scope = RunDeadline::new(Duration::from_secs(10));

        let slow = FanTask::new("a-slow", None, Duration::from_secs(5), |_d| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(60)).await;
                Ok("slow")
            }) as BoxFuture<'static, Result<&'static str, SourceError>>
        });
        let fast = FanTask::new("b-fast", None, Duration::from_secs(5), |_d| {
            Box::pin(async { Ok("fast") }) as BoxFuture<'static, Result<&'static str, SourceError>>
        });

        let results = scheduler.fan_out(&scope, vec![fast, slow]).await;
        assert_eq!(results[0].0, "a-slow");
        assert_eq!(results[1].0, "b-fast");
    }

    #[tokio::test]
    async fn per_task_timeout_yields_deadline_exceeded() {
        let scheduler = StageScheduler::new(8);
        let scope = RunDeadline::new(Duration::from_secs(10));
        let task = FanTask::new("slow", None, Duration::from_millis(30), |_d| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            }) as BoxFuture<'static, Result<(), SourceError>>
        });
        let results = scheduler.fan_out(&scope, vec![task]).await;
        assert_eq!(results[0].1, Err(SourceError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn cancelling_scope_cancels_in_flight_tasks() {
        let scheduler = StageScheduler::new(8);
        let scope = RunDeadline::new(Duration::from_secs(30));
        let task_scope = scope.clone();

        let handle = tokio::spawn(async move {
            let task = FanTask::new("hang", None, Duration::from_secs(20), |_d| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_secs(15)).await;
                    Ok(())
                }) as BoxFuture<'static, Result<(), SourceError>>
            });
            scheduler.fan_out(&task_scope, vec![task]).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        scope.cancel();
        let results = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("cancellation must complete within the cleanup interval")
            .unwrap();
        assert_eq!(results[0].1, Err(SourceError::DeadlineExceeded));
    }
}
