//! Build graph data model: agents, nodes, tagged outputs, aggregates, badges,
//! reports, and the Select/SkipTriggers reduction algorithms.
//!
//! Dependency sets are stored as their full transitive closure at construction
//! time. This trades memory for O(1) "is X required" queries and makes the
//! minimal direct-edge computation a pure set difference.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;

use gantry_types::{GantryError, Result, Severity, SourceLocation};

use crate::task::Task;
use crate::trigger::{TriggerArena, TriggerId};

/// Lower-cased key form. Every lookup table in the graph is keyed by this;
/// all name comparisons are case-insensitive.
pub fn normalize(name: &str) -> String {
    name.to_ascii_lowercase()
}

/// Index into the node arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

/// Index into the output arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputId(pub usize);

/// Index into the agent arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AgentId(pub usize);

/// A named, tagged artifact set produced by exactly one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeOutput {
    pub producer: NodeId,
    pub tag_name: String,
}

/// The atomic unit of work.
pub struct Node {
    pub name: String,
    /// Resolved input references.
    pub inputs: Vec<OutputId>,
    /// Outputs; `outputs[0]` is always the implicit default `#<Name>` tag.
    pub outputs: Vec<OutputId>,
    /// Transitive closure of producing nodes for all inputs.
    pub input_dependencies: BTreeSet<NodeId>,
    /// Transitive closure of all ordering constraints; superset of
    /// `input_dependencies`.
    pub order_dependencies: BTreeSet<NodeId>,
    pub controlling_trigger: Option<TriggerId>,
    /// Exclusivity token paths this node (and its inputs, transitively) hold
    /// while building.
    pub required_tokens: Vec<PathBuf>,
    pub tasks: Vec<Box<dyn Task>>,
    pub notify_users: BTreeSet<String>,
    pub notify_submitters: BTreeSet<String>,
    pub notify_on_warnings: bool,
    pub agent: AgentId,
}

/// A named pool of candidate machine types holding an ordered list of nodes.
#[derive(Debug, Clone)]
pub struct Agent {
    pub name: String,
    pub possible_types: Vec<String>,
    pub nodes: Vec<NodeId>,
}

/// Named alias for a fixed set of nodes.
#[derive(Debug, Clone)]
pub struct Aggregate {
    pub name: String,
    pub nodes: BTreeSet<NodeId>,
}

/// Named rollup of a node subset for external status display.
#[derive(Debug, Clone)]
pub struct Badge {
    pub name: String,
    pub project: String,
    pub change: i64,
    pub nodes: BTreeSet<NodeId>,
}

/// Named rollup of a node subset for notification.
#[derive(Debug, Clone)]
pub struct Report {
    pub name: String,
    pub nodes: BTreeSet<NodeId>,
    pub notify_users: BTreeSet<String>,
}

/// A declared, user-overridable property; retained for help output only.
#[derive(Debug, Clone)]
pub struct GraphOption {
    pub name: String,
    pub description: String,
    pub default_value: String,
}

/// A deferred warning/error declared in the script, emitted only if its
/// enclosing context survives graph reduction.
#[derive(Debug, Clone)]
pub struct GraphDiagnostic {
    pub severity: Severity,
    pub message: String,
    pub location: SourceLocation,
    pub enclosing_node: Option<NodeId>,
    pub enclosing_agent: Option<AgentId>,
    pub enclosing_trigger: Option<TriggerId>,
}

/// The aggregate root. Entities live in arenas; the name tables define which
/// of them are part of the (possibly reduced) graph.
#[derive(Default)]
pub struct Graph {
    pub agents: Vec<Agent>,
    pub nodes: Vec<Node>,
    pub outputs: Vec<NodeOutput>,
    pub triggers: TriggerArena,
    pub name_to_agent: HashMap<String, AgentId>,
    pub name_to_node: HashMap<String, NodeId>,
    pub name_to_trigger: HashMap<String, TriggerId>,
    pub name_to_report: HashMap<String, usize>,
    pub name_to_aggregate: HashMap<String, usize>,
    pub tag_name_to_output: HashMap<String, OutputId>,
    /// Tags referenced ad hoc by tasks without being formal node outputs.
    pub local_tag_names: HashSet<String>,
    pub aggregates: Vec<Aggregate>,
    pub badges: Vec<Badge>,
    pub reports: Vec<Report>,
    pub diagnostics: Vec<GraphDiagnostic>,
    pub options: Vec<GraphOption>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn agent(&self, id: AgentId) -> &Agent {
        &self.agents[id.0]
    }

    pub fn output(&self, id: OutputId) -> &NodeOutput {
        &self.outputs[id.0]
    }

    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        self.name_to_node.get(&normalize(name)).copied()
    }

    pub fn find_agent(&self, name: &str) -> Option<AgentId> {
        self.name_to_agent.get(&normalize(name)).copied()
    }

    pub fn find_trigger(&self, qualified_name: &str) -> Option<TriggerId> {
        self.name_to_trigger.get(&normalize(qualified_name)).copied()
    }

    pub fn find_output(&self, tag_name: &str) -> Option<OutputId> {
        self.tag_name_to_output.get(&normalize(tag_name)).copied()
    }

    /// A node is live while its name still resolves to it; `select` retires
    /// culled nodes by dropping their table entries.
    pub fn is_node_live(&self, id: NodeId) -> bool {
        self.name_to_node.get(&normalize(&self.nodes[id.0].name)) == Some(&id)
    }

    pub fn is_agent_live(&self, id: AgentId) -> bool {
        self.name_to_agent.get(&normalize(&self.agents[id.0].name)) == Some(&id)
    }

    /// Live nodes in agent declaration order.
    pub fn live_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.agents
            .iter()
            .filter(|a| !a.nodes.is_empty())
            .flat_map(|a| a.nodes.iter().copied())
    }

    /// True iff `trigger` equals, or is a strict ancestor of, the node's own
    /// controlling trigger. The chain terminates at the no-trigger root, so
    /// `is_behind(n, None)` holds for every node.
    pub fn is_behind(&self, node: NodeId, trigger: Option<TriggerId>) -> bool {
        let mut cursor = self.nodes[node.0].controlling_trigger;
        loop {
            if cursor == trigger {
                return true;
            }
            match cursor {
                Some(t) => cursor = self.triggers.get(t).parent,
                None => return false,
            }
        }
    }

    /// Minimal direct input edges: the stored closure minus everything
    /// reachable through another member of the closure.
    pub fn direct_input_dependencies(&self, id: NodeId) -> BTreeSet<NodeId> {
        let set = &self.nodes[id.0].input_dependencies;
        let mut direct = set.clone();
        for dep in set {
            for transitive in &self.nodes[dep.0].input_dependencies {
                direct.remove(transitive);
            }
        }
        direct
    }

    /// Minimal direct order edges, by the same subtraction over the order
    /// closure.
    pub fn direct_order_dependencies(&self, id: NodeId) -> BTreeSet<NodeId> {
        let set = &self.nodes[id.0].order_dependencies;
        let mut direct = set.clone();
        for dep in set {
            for transitive in &self.nodes[dep.0].order_dependencies {
                direct.remove(transitive);
            }
        }
        direct
    }

    /// Resolve a target name for a build: a node, aggregate, or `#tag`
    /// reference, expanded to include the order dependencies of the named
    /// nodes so that explicit `After` constraints keep their effect under
    /// reduction.
    pub fn resolve_targets(&self, name: &str) -> Result<BTreeSet<NodeId>> {
        let mut base = BTreeSet::new();
        if let Some(tag) = name.strip_prefix('#') {
            match self.find_output(&format!("#{tag}")) {
                Some(output) => {
                    base.insert(self.outputs[output.0].producer);
                }
                None => {
                    return Err(GantryError::UnknownReference {
                        name: name.to_string(),
                    })
                }
            }
        } else if let Some(node) = self.find_node(name) {
            base.insert(node);
        } else if let Some(&idx) = self.name_to_aggregate.get(&normalize(name)) {
            base.extend(self.aggregates[idx].nodes.iter().copied());
        } else {
            return Err(GantryError::UnknownReference {
                name: name.to_string(),
            });
        }

        let mut targets = base.clone();
        for node in &base {
            targets.extend(self.nodes[node.0].order_dependencies.iter().copied());
        }
        Ok(targets)
    }

    /// Reduce the graph to exactly what is needed to build `targets`:
    /// the targets plus their input-dependency closures. Order-only "after"
    /// edges of the targets are not auto-retained here; callers wanting them
    /// kept pass a target set already expanded by [`resolve_targets`].
    pub fn select(&mut self, targets: &BTreeSet<NodeId>) {
        let mut retain = targets.clone();
        for target in targets {
            retain.extend(self.nodes[target.0].input_dependencies.iter().copied());
        }

        for agent in &mut self.agents {
            agent.nodes.retain(|n| retain.contains(n));
        }
        let empty_agents: HashSet<AgentId> = self
            .agents
            .iter()
            .enumerate()
            .filter(|(_, a)| a.nodes.is_empty())
            .map(|(i, _)| AgentId(i))
            .collect();
        self.name_to_agent.retain(|_, id| !empty_agents.contains(id));
        self.name_to_node.retain(|_, id| retain.contains(id));

        for report in &mut self.reports {
            report.nodes.retain(|n| retain.contains(n));
        }
        self.reports.retain(|r| !r.nodes.is_empty());
        self.name_to_report = self
            .reports
            .iter()
            .enumerate()
            .map(|(i, r)| (normalize(&r.name), i))
            .collect();

        // Badges referencing a culled node are dropped entirely, not trimmed.
        self.badges
            .retain(|b| b.nodes.iter().all(|n| retain.contains(n)));

        // Keep exactly the triggers on some retained node's controlling chain.
        let mut live_triggers: HashSet<TriggerId> = HashSet::new();
        for node in &retain {
            for t in self.triggers.chain(self.nodes[node.0].controlling_trigger) {
                live_triggers.insert(t);
            }
        }
        self.name_to_trigger.retain(|_, id| live_triggers.contains(id));

        // Dangling "after" edges to culled nodes no longer order anything.
        for node in &mut self.nodes {
            node.order_dependencies.retain(|d| retain.contains(d));
        }

        self.diagnostics.retain(|d| {
            d.enclosing_node.map_or(true, |n| retain.contains(&n))
                && d.enclosing_agent.map_or(true, |a| !empty_agents.contains(&a))
        });
    }

    /// Re-point every node and diagnostic whose controlling-trigger chain
    /// passes through a skipped trigger at its nearest non-skipped ancestor,
    /// and drop the skipped triggers from the trigger table.
    pub fn skip_triggers(&mut self, skip: &BTreeSet<TriggerId>) {
        for node in &mut self.nodes {
            node.controlling_trigger = self
                .triggers
                .first_not_skipped(node.controlling_trigger, skip);
        }
        for diagnostic in &mut self.diagnostics {
            diagnostic.enclosing_trigger = self
                .triggers
                .first_not_skipped(diagnostic.enclosing_trigger, skip);
        }
        self.name_to_trigger.retain(|_, id| !skip.contains(id));
    }

    /// Replay surviving deferred diagnostics through `tracing`.
    pub fn emit_diagnostics(&self) {
        for diagnostic in &self.diagnostics {
            match diagnostic.severity {
                Severity::Warning => {
                    tracing::warn!("{}: {}", diagnostic.location, diagnostic.message)
                }
                Severity::Error => {
                    tracing::error!("{}: {}", diagnostic.location, diagnostic.message)
                }
            }
        }
    }
}
