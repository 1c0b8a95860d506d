//! Concurrent execution over the resource graph.
//!
//! Nodes move `pending -> ready -> in_progress -> {succeeded, failed}`. A node
//! is ready once every producer succeeded; downstream of a failure nodes stay
//! pending and are reported as skipped. Independent branches keep going.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AbortPolicy, EngineConfig};
use crate::declaration::Address;
use crate::graph::ResourceGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    InProgress,
    Succeeded,
    Failed,
}

/// Work performed for one node.
#[async_trait]
pub trait NodeExecutor: Send + Sync + 'static {
    type Output: Send + 'static;

    async fn execute(&self, address: &Address) -> anyhow::Result<Self::Output>;
}

#[derive(Debug)]
pub enum NodeResult<T> {
    Succeeded(T),
    Failed(String),
    /// Never dispatched: a producer failed or the run was cancelled.
    Skipped,
}

#[derive(Debug)]
pub struct NodeRecord<T> {
    pub result: NodeResult<T>,
    /// Logical clock reading at dispatch.
    pub dispatched_at: Option<u64>,
    /// Logical clock reading at completion.
    pub completed_at: Option<u64>,
}

#[derive(Debug)]
pub struct Schedule<T> {
    pub nodes: BTreeMap<Address, NodeRecord<T>>,
    pub cancelled: bool,
}

impl<T> Schedule<T> {
    pub fn all_succeeded(&self) -> bool {
        !self.cancelled
            && self
                .nodes
                .values()
                .all(|n| matches!(n.result, NodeResult::Succeeded(_)))
    }

    pub fn failed(&self) -> impl Iterator<Item = &Address> {
        self.nodes
            .iter()
            .filter(|(_, n)| matches!(n.result, NodeResult::Failed(_)))
            .map(|(a, _)| a)
    }

    pub fn skipped(&self) -> impl Iterator<Item = &Address> {
        self.nodes
            .iter()
            .filter(|(_, n)| matches!(n.result, NodeResult::Skipped))
            .map(|(a, _)| a)
    }
}

pub struct Scheduler {
    max_concurrency: usize,
    abort_policy: AbortPolicy,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(max_concurrency: usize, abort_policy: AbortPolicy, cancel: CancellationToken) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            abort_policy,
            cancel,
        }
    }

    pub fn from_config(config: &EngineConfig, cancel: CancellationToken) -> Self {
        Self::new(config.max_concurrency, config.abort_policy, cancel)
    }

    /// Run `graph` in reverse dependency order.
    pub async fn teardown<E: NodeExecutor>(
        &self,
        graph: &ResourceGraph,
        executor: Arc<E>,
    ) -> Schedule<E::Output> {
        self.run(&graph.reversed(), executor).await
    }

    /// Run `graph` in dependency order.
    pub async fn run<E: NodeExecutor>(
        &self,
        graph: &ResourceGraph,
        executor: Arc<E>,
    ) -> Schedule<E::Output> {
        let mut status: BTreeMap<Address, NodeStatus> = graph
            .nodes()
            .map(|a| (a.clone(), NodeStatus::Pending))
            .collect();
        let mut waiting: BTreeMap<Address, usize> = graph
            .nodes()
            .map(|a| (a.clone(), graph.producers(a).len()))
            .collect();
        let mut ready: VecDeque<Address> = waiting
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(a, _)| a.clone())
            .collect();
        for address in &ready {
            status.insert(address.clone(), NodeStatus::Ready);
        }

        let mut clock = 0u64;
        let mut dispatched: BTreeMap<Address, u64> = BTreeMap::new();
        let mut completed: BTreeMap<Address, u64> = BTreeMap::new();
        let mut results: BTreeMap<Address, NodeResult<E::Output>> = BTreeMap::new();
        let mut tasks = JoinSet::new();
        let mut cancelled = self.cancel.is_cancelled();

        info!(
            nodes = graph.len(),
            max_concurrency = self.max_concurrency,
            "Starting schedule"
        );

        loop {
            let mut wave = 0usize;
            while !cancelled && tasks.len() < self.max_concurrency {
                let Some(address) = ready.pop_front() else {
                    break;
                };
                clock += 1;
                dispatched.insert(address.clone(), clock);
                status.insert(address.clone(), NodeStatus::InProgress);
                debug!(address = %address, seq = clock, "Dispatching node");
                let executor = executor.clone();
                tasks.spawn(async move {
                    let result = executor.execute(&address).await;
                    (address, result)
                });
                wave += 1;
            }
            if wave > 0 {
                debug!(dispatched = wave, in_flight = tasks.len(), "Wave dispatched");
            }
            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    match self.abort_policy {
                        AbortPolicy::Drain => {
                            info!(in_flight = tasks.len(), "Cancelled, waiting for in-flight nodes");
                        }
                        AbortPolicy::Abandon => {
                            warn!(in_flight = tasks.len(), "Cancelled, abandoning in-flight nodes");
                            tasks.abort_all();
                        }
                    }
                }
                joined = tasks.join_next() => {
                    let Some(joined) = joined else {
                        break;
                    };
                    let (address, result) = match joined {
                        Ok(pair) => pair,
                        Err(e) => {
                            if !e.is_cancelled() {
                                warn!(error = %e, "Node task ended abnormally");
                            }
                            continue;
                        }
                    };
                    clock += 1;
                    completed.insert(address.clone(), clock);
                    match result {
                        Ok(output) => {
                            debug!(address = %address, seq = clock, "Node succeeded");
                            status.insert(address.clone(), NodeStatus::Succeeded);
                            results.insert(address.clone(), NodeResult::Succeeded(output));
                            for consumer in graph.consumers(&address) {
                                let Some(count) = waiting.get_mut(&consumer) else {
                                    continue;
                                };
                                *count = count.saturating_sub(1);
                                if *count == 0 {
                                    status.insert(consumer.clone(), NodeStatus::Ready);
                                    ready.push_back(consumer);
                                }
                            }
                        }
                        Err(e) => {
                            let message = format!("{e:#}");
                            warn!(address = %address, error = %message, "Node failed");
                            status.insert(address.clone(), NodeStatus::Failed);
                            results.insert(address, NodeResult::Failed(message));
                        }
                    }
                }
            }
        }

        let nodes: BTreeMap<Address, NodeRecord<E::Output>> = status
            .into_iter()
            .map(|(address, state)| {
                let result = match (results.remove(&address), state) {
                    (Some(result), _) => result,
                    (None, NodeStatus::InProgress) if cancelled => {
                        NodeResult::Failed("abandoned after cancellation".to_string())
                    }
                    (None, NodeStatus::InProgress) => {
                        NodeResult::Failed("node task ended abnormally".to_string())
                    }
                    (None, _) => NodeResult::Skipped,
                };
                let record = NodeRecord {
                    result,
                    dispatched_at: dispatched.get(&address).copied(),
                    completed_at: completed.get(&address).copied(),
                };
                (address, record)
            })
            .collect();

        let schedule = Schedule { nodes, cancelled };
        info!(
            failed = schedule.failed().count(),
            skipped = schedule.skipped().count(),
            cancelled,
            "Schedule finished"
        );
        schedule
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::addr;
    use crate::graph::EdgeReason;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        fail: BTreeSet<Address>,
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        /// Cancel the run when this node starts.
        cancel_on: Option<(Address, CancellationToken)>,
    }

    #[async_trait]
    impl NodeExecutor for Recorder {
        type Output = String;

        async fn execute(&self, address: &Address) -> anyhow::Result<String> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Some((target, token)) = &self.cancel_on {
                if target == address {
                    token.cancel();
                }
            }
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail.contains(address) {
                anyhow::bail!("simulated failure of {address}");
            }
            Ok(address.to_string())
        }
    }

    fn graph(edges: &[(&str, &str)], extra: &[&str]) -> ResourceGraph {
        let mut graph = ResourceGraph::new();
        for (p, c) in edges {
            graph.add_edge(&addr(p), &addr(c), EdgeReason::Data, format!("{c}.fields.x"));
        }
        for node in extra {
            graph.add_node(addr(node));
        }
        graph
    }

    fn scheduler(limit: usize) -> Scheduler {
        Scheduler::new(limit, AbortPolicy::Drain, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_dispatch_respects_topological_order() {
        let g = graph(
            &[
                ("virtual_network.main", "subnet.a"),
                ("virtual_network.main", "subnet.b"),
                ("subnet.a", "postgresql_server.main"),
                ("subnet.b", "postgresql_server.main"),
                ("postgresql_server.main", "key_vault_secret.db"),
            ],
            &["private_dns_zone.main"],
        );
        let schedule = scheduler(10).run(&g, Arc::new(Recorder::default())).await;

        assert!(schedule.all_succeeded());
        for (producer, consumer, _) in g.edges() {
            let done = schedule.nodes[producer].completed_at.unwrap();
            let started = schedule.nodes[consumer].dispatched_at.unwrap();
            assert!(done < started, "{producer} finished at {done}, {consumer} started at {started}");
        }
        assert!(matches!(
            &schedule.nodes[&addr("key_vault_secret.db")].result,
            NodeResult::Succeeded(out) if out == "key_vault_secret.db"
        ));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let nodes: Vec<String> = (0..12).map(|i| format!("subnet.s{i}")).collect();
        let names: Vec<&str> = nodes.iter().map(String::as_str).collect();
        let g = graph(&[], &names);
        let recorder = Arc::new(Recorder {
            delay: Duration::from_millis(20),
            ..Default::default()
        });

        let schedule = scheduler(3).run(&g, recorder.clone()).await;
        assert!(schedule.all_succeeded());
        assert_eq!(recorder.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_only() {
        let g = graph(
            &[
                ("linux_scale_set.backend", "linux_scale_set.frontend"),
                ("linux_scale_set.frontend", "application_gateway.main"),
            ],
            &["key_vault.main"],
        );
        let recorder = Arc::new(Recorder {
            fail: [addr("linux_scale_set.backend")].into_iter().collect(),
            ..Default::default()
        });

        let schedule = scheduler(4).run(&g, recorder).await;
        assert!(!schedule.all_succeeded());
        assert_eq!(
            schedule.failed().cloned().collect::<Vec<_>>(),
            vec![addr("linux_scale_set.backend")]
        );
        assert_eq!(
            schedule.skipped().cloned().collect::<Vec<_>>(),
            vec![addr("application_gateway.main"), addr("linux_scale_set.frontend")]
        );
        let frontend = &schedule.nodes[&addr("linux_scale_set.frontend")];
        assert!(frontend.dispatched_at.is_none());
        assert!(matches!(
            schedule.nodes[&addr("key_vault.main")].result,
            NodeResult::Succeeded(_)
        ));
        assert!(matches!(
            &schedule.nodes[&addr("linux_scale_set.backend")].result,
            NodeResult::Failed(msg) if msg.contains("simulated failure")
        ));
    }

    #[tokio::test]
    async fn test_teardown_reverses_order() {
        let g = graph(
            &[
                ("virtual_network.main", "postgresql_server.main"),
                ("postgresql_server.main", "key_vault_secret.db"),
            ],
            &[],
        );
        let schedule = scheduler(10).teardown(&g, Arc::new(Recorder::default())).await;
        let seq = |s: &str| schedule.nodes[&addr(s)].dispatched_at.unwrap();
        assert!(seq("key_vault_secret.db") < seq("postgresql_server.main"));
        assert!(seq("postgresql_server.main") < seq("virtual_network.main"));
    }

    #[tokio::test]
    async fn test_cancel_drains_in_flight_nodes() {
        let token = CancellationToken::new();
        let g = graph(&[("subnet.a", "subnet.b")], &[]);
        let recorder = Arc::new(Recorder {
            delay: Duration::from_millis(20),
            cancel_on: Some((addr("subnet.a"), token.clone())),
            ..Default::default()
        });

        let schedule = Scheduler::new(2, AbortPolicy::Drain, token)
            .run(&g, recorder)
            .await;
        assert!(schedule.cancelled);
        assert!(matches!(schedule.nodes[&addr("subnet.a")].result, NodeResult::Succeeded(_)));
        assert!(matches!(schedule.nodes[&addr("subnet.b")].result, NodeResult::Skipped));
    }

    #[tokio::test]
    async fn test_cancel_abandons_in_flight_nodes() {
        let token = CancellationToken::new();
        let g = graph(&[("subnet.a", "subnet.b")], &[]);
        let recorder = Arc::new(Recorder {
            delay: Duration::from_secs(30),
            cancel_on: Some((addr("subnet.a"), token.clone())),
            ..Default::default()
        });

        let schedule = Scheduler::new(2, AbortPolicy::Abandon, token)
            .run(&g, recorder)
            .await;
        assert!(schedule.cancelled);
        assert!(matches!(
            &schedule.nodes[&addr("subnet.a")].result,
            NodeResult::Failed(msg) if msg.contains("abandoned")
        ));
        assert!(matches!(schedule.nodes[&addr("subnet.b")].result, NodeResult::Skipped));
    }
}
