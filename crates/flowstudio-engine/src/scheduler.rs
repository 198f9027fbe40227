//! Topological scheduler with run-time branch pruning.
//!
//! Nodes run one at a time once every inbound edge is settled. An edge is
//! settled either by its source completing (satisfied) or by being pruned:
//! a branching node prunes the edges it did not choose, and a node whose
//! inbound edges were all pruned is dead and prunes its own outbound edges.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use flowstudio_core::error::{FlowError, Result};
use flowstudio_core::graph::{Graph, Node, NodeKind};
use flowstudio_core::trace::{value_to_text, Diagnostic, StepRecord, StepStatus};
use flowstudio_core::traits::ConversationStore;
use flowstudio_core::types::{MemoryMessage, Role};

use crate::branch::chosen_successor;
use crate::context::ExecutionContext;
use crate::executors::{HandlerRegistry, NodeOutput};
use crate::text::preview;

/// Mutable scheduling state for one run: in-degrees, pruned edges and the ready queue.
struct Frontier<'g> {
    graph: &'g Graph,
    entry: &'g str,
    in_degree: HashMap<&'g str, usize>,
    live_inbound: HashMap<&'g str, usize>,
    depth: HashMap<&'g str, usize>,
    pruned: HashSet<usize>,
    visited: HashSet<&'g str>,
    dead: HashSet<&'g str>,
    queue: VecDeque<(&'g str, usize)>,
}

impl<'g> Frontier<'g> {
    fn new(graph: &'g Graph, entry: &'g str) -> Self {
        let mut frontier = Self {
            graph,
            entry,
            in_degree: graph.in_degrees(),
            live_inbound: HashMap::new(),
            depth: HashMap::new(),
            pruned: HashSet::new(),
            visited: HashSet::new(),
            dead: HashSet::new(),
            queue: VecDeque::from([(entry, 0)]),
        };

        // Nodes the entry cannot reach never run; settle their edges up front.
        let reachable = frontier.reachable_from(entry);
        let unreachable: Vec<&'g str> = graph
            .nodes
            .iter()
            .map(|n| n.id.as_str())
            .filter(|id| !reachable.contains(id))
            .collect();
        for id in unreachable {
            debug!(node_id = %id, "Node is unreachable from the entry node");
            frontier.dead.insert(id);
            let outbound = frontier.outbound(id);
            frontier.settle(outbound.into_iter().map(|i| (i, false, 0)).collect());
        }
        frontier
    }

    fn reachable_from(&self, start: &'g str) -> HashSet<&'g str> {
        let graph = self.graph;
        let mut seen = HashSet::from([start]);
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            for edge in graph.outgoing(id) {
                if seen.insert(edge.target.as_str()) {
                    stack.push(edge.target.as_str());
                }
            }
        }
        seen
    }

    fn outbound(&self, id: &str) -> Vec<usize> {
        self.graph
            .edges
            .iter()
            .enumerate()
            .filter(|(_, e)| e.source == id)
            .map(|(i, _)| i)
            .collect()
    }

    fn pending(&self, id: &str) -> usize {
        self.in_degree.get(id).copied().unwrap_or(0)
    }

    /// Settle edges as satisfied or pruned, cascading through dead nodes.
    fn settle(&mut self, work: Vec<(usize, bool, usize)>) {
        let mut work = VecDeque::from(work);
        while let Some((index, satisfied, depth)) = work.pop_front() {
            let graph = self.graph;
            let target = graph.edges[index].target.as_str();
            if let Some(d) = self.in_degree.get_mut(target) {
                *d = d.saturating_sub(1);
            }
            if satisfied {
                *self.live_inbound.entry(target).or_insert(0) += 1;
                let d = self.depth.entry(target).or_insert(depth);
                *d = (*d).max(depth);
            } else {
                self.pruned.insert(index);
            }

            if self.pending(target) > 0
                || self.visited.contains(target)
                || self.dead.contains(target)
            {
                continue;
            }
            if self.live_inbound.get(target).copied().unwrap_or(0) > 0 {
                let d = self.depth.get(target).copied().unwrap_or(depth);
                self.queue.push_back((target, d));
            } else if target != self.entry {
                debug!(node_id = %target, "Every inbound edge was pruned, skipping node");
                self.dead.insert(target);
                work.extend(self.outbound(target).into_iter().map(|i| (i, false, 0)));
            }
        }
    }

    /// Next node to consider. When nothing is ready, nodes stuck waiting on a
    /// cycle are queued so the depth guard can fail the run.
    fn next(&mut self) -> Option<(&'g str, usize)> {
        if self.queue.is_empty() {
            let graph = self.graph;
            for node in &graph.nodes {
                let id = node.id.as_str();
                if !self.visited.contains(id)
                    && !self.dead.contains(id)
                    && self.pending(id) > 0
                    && self.live_inbound.get(id).copied().unwrap_or(0) > 0
                {
                    warn!(node_id = %id, "Node is waiting on a cycle");
                    let depth = self.depth.get(id).copied().unwrap_or(0) + 1;
                    self.requeue(id, depth);
                }
            }
        }
        while let Some((id, depth)) = self.queue.pop_front() {
            if !self.visited.contains(id) {
                return Some((id, depth));
            }
        }
        None
    }

    fn requeue(&mut self, id: &'g str, depth: usize) {
        self.depth.insert(id, depth);
        self.queue.push_back((id, depth));
    }

    fn complete(&mut self, id: &'g str, depth: usize, chosen: Option<Option<&str>>) {
        self.visited.insert(id);
        let work = self
            .outbound(id)
            .into_iter()
            .map(|i| {
                let satisfied = match chosen {
                    None => true,
                    Some(choice) => choice == Some(self.graph.edges[i].target.as_str()),
                };
                (i, satisfied, depth)
            })
            .collect();
        self.settle(work);
    }

    /// Output of the first live inbound edge whose source has run.
    fn input_for(&self, id: &str, ctx: &ExecutionContext) -> Option<serde_json::Value> {
        self.graph
            .edges
            .iter()
            .enumerate()
            .filter(|(i, e)| e.target == id && !self.pruned.contains(i))
            .find_map(|(_, e)| ctx.trace.get(&e.source).map(|s| s.output.clone()))
    }

    /// Visited nodes whose outbound edges were all pruned (or that have none).
    fn is_terminal(&self, id: &str) -> bool {
        self.outbound(id).iter().all(|i| self.pruned.contains(i))
    }
}

/// Executes a validated graph against an execution context.
pub struct Scheduler {
    handlers: Arc<HandlerRegistry>,
    memory: Arc<dyn ConversationStore>,
    max_depth: usize,
}

impl Scheduler {
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        memory: Arc<dyn ConversationStore>,
        max_depth: usize,
    ) -> Self {
        Self {
            handlers,
            memory,
            max_depth,
        }
    }

    /// Run the graph to completion and return the terminal result.
    ///
    /// Completed steps accumulate in `ctx.trace`, including when the run fails.
    pub async fn run(&self, graph: &Graph, ctx: &mut ExecutionContext) -> Result<serde_json::Value> {
        let span = info_span!("run", run_id = %ctx.run_id);
        self.run_inner(graph, ctx).instrument(span).await
    }

    async fn run_inner(&self, graph: &Graph, ctx: &mut ExecutionContext) -> Result<serde_json::Value> {
        let entry = graph.entry().ok_or(FlowError::EntryNodeMissing)?;
        let mut frontier = Frontier::new(graph, &entry.id);
        let raw_input = serde_json::Value::String(ctx.raw_input.clone());

        info!(
            run_id = %ctx.run_id,
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            input = %preview(&ctx.raw_input),
            "Starting run"
        );

        while let Some((id, depth)) = frontier.next() {
            if depth >= self.max_depth {
                error!(run_id = %ctx.run_id, node_id = %id, depth, "Maximum workflow depth exceeded");
                return Err(FlowError::DepthExceeded {
                    node_id: id.to_string(),
                    max_depth: self.max_depth,
                });
            }
            if frontier.pending(id) > 0 {
                frontier.requeue(id, depth + 1);
                continue;
            }
            if ctx.cancel.is_cancelled() {
                return Err(FlowError::Cancelled);
            }

            let Some(node) = graph.node(id) else {
                return Err(FlowError::InvalidGraph(format!("unknown node '{id}'")));
            };
            let input = if id == entry.id {
                raw_input.clone()
            } else {
                frontier.input_for(id, ctx).unwrap_or_else(|| raw_input.clone())
            };

            let span = info_span!("node", node_id = %node.id, kind = %node.kind, depth);
            let mut step = self.execute_node(node, input, ctx).instrument(span).await?;

            let chosen = if node.kind.is_branching() {
                let outbound = frontier.outbound(id);
                let choice = chosen_successor(&step)
                    .filter(|c| outbound.iter().any(|&i| graph.edges[i].target == *c))
                    .map(str::to_string);
                if choice.is_none() && !outbound.is_empty() {
                    let branch = step
                        .extra
                        .get("branchTaken")
                        .or_else(|| step.extra.get("className"))
                        .map(value_to_text)
                        .unwrap_or_default();
                    warn!(run_id = %ctx.run_id, node_id = %id, branch = %branch, "No successor for the chosen branch");
                    step.diagnostics.push(Diagnostic::NoBranchTarget { branch });
                    step.status = StepStatus::Degraded;
                }
                Some(choice)
            } else {
                None
            };

            if node.kind.writes_memory() {
                self.remember(node, &step, ctx).await;
            }
            ctx.trace.record(step);
            frontier.complete(id, depth, chosen.as_ref().map(|c| c.as_deref()));
        }

        let steps = ctx.trace.steps();
        let result = steps
            .iter()
            .rev()
            .find(|s| s.node_type == NodeKind::Answer && frontier.is_terminal(&s.node_id))
            .or_else(|| steps.last())
            .map(|s| s.output.clone())
            .unwrap_or(raw_input);

        info!(run_id = %ctx.run_id, nodes_executed = steps.len(), "Run complete");
        Ok(result)
    }

    async fn execute_node(
        &self,
        node: &Node,
        input: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<StepRecord> {
        let handler = self.handlers.get(node.kind).ok_or_else(|| FlowError::InvalidNodeConfig {
            node_id: node.id.clone(),
            message: format!("no handler registered for node type {}", node.kind),
        })?;

        debug!(run_id = %ctx.run_id, node_id = %node.id, input = %preview(&value_to_text(&input)), "Executing node");
        let started_at = Utc::now();
        let timer = Instant::now();

        let result: Result<NodeOutput> = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(FlowError::Cancelled),
            out = handler.execute(node, &input, ctx) => out,
        };
        let elapsed_ms = timer.elapsed().as_millis() as u64;

        let out = result.map_err(|e| {
            error!(run_id = %ctx.run_id, node_id = %node.id, elapsed_ms, error = %e, "Node failed");
            e.in_node(&node.id)
        })?;

        info!(
            run_id = %ctx.run_id,
            node_id = %node.id,
            elapsed_ms,
            status = ?out.status,
            output = %preview(&value_to_text(&out.output)),
            "Node complete"
        );

        Ok(StepRecord {
            node_id: node.id.clone(),
            node_type: node.kind,
            label: node.label.clone(),
            started_at,
            duration_ms: elapsed_ms,
            input,
            output: out.output,
            status: out.status,
            extra: out.extra,
            diagnostics: out.diagnostics,
        })
    }

    /// Append a generate/agent output to the conversation as an assistant turn.
    async fn remember(&self, node: &Node, step: &StepRecord, ctx: &ExecutionContext) {
        let Some(conversation_id) = ctx.conversation_id.as_deref() else {
            return;
        };
        let message = MemoryMessage::new(
            Role::Assistant,
            value_to_text(&step.output),
            Some(node.kind.as_str()),
        );
        if let Err(e) = self.memory.append(conversation_id, message).await {
            warn!(run_id = %ctx.run_id, node_id = %node.id, error = %e, "Failed to append assistant message");
        }
    }
}
