//! Read-only projections of a graph: the distributed execution plan (JSON),
//! the preprocessed markup document, and a human-readable listing.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use gantry_types::Result;

use crate::graph::{Graph, NodeId};
use crate::trigger::TriggerId;

// ---------------------------------------------------------------------------
// Execution plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedPlan {
    #[serde(rename = "Groups")]
    pub groups: Vec<ExportedGroup>,
    #[serde(rename = "Badges")]
    pub badges: Vec<ExportedBadge>,
    #[serde(rename = "Reports")]
    pub reports: Vec<ExportedReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedGroup {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Agent Types")]
    pub agent_types: Vec<String>,
    #[serde(rename = "Nodes")]
    pub nodes: Vec<ExportedNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedNode {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "DependsOn")]
    pub depends_on: String,
    #[serde(rename = "Notify")]
    pub notify: ExportedNotify,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedNotify {
    #[serde(rename = "Default")]
    pub default: String,
    #[serde(rename = "Submitters")]
    pub submitters: String,
    #[serde(rename = "Warnings")]
    pub warnings: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedBadge {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Project", skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(rename = "Change", skip_serializing_if = "Option::is_none")]
    pub change: Option<i64>,
    #[serde(rename = "AllDependencies")]
    pub all_dependencies: String,
    #[serde(rename = "DirectDependencies")]
    pub direct_dependencies: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedReport {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "AllDependencies")]
    pub all_dependencies: String,
    #[serde(rename = "DirectDependencies")]
    pub direct_dependencies: String,
    #[serde(rename = "Notify")]
    pub notify: String,
    #[serde(rename = "IsTrigger")]
    pub is_trigger: bool,
}

fn join_names(graph: &Graph, nodes: impl IntoIterator<Item = NodeId>) -> String {
    nodes
        .into_iter()
        .map(|n| graph.node(n).name.clone())
        .collect::<Vec<_>>()
        .join(";")
}

fn join_set(values: &BTreeSet<String>) -> String {
    values.iter().cloned().collect::<Vec<_>>().join(";")
}

/// Subtract everything reachable through another member's order closure,
/// leaving the minimal direct subset.
fn direct_subset(graph: &Graph, set: &BTreeSet<NodeId>) -> BTreeSet<NodeId> {
    let mut direct = set.clone();
    for dep in set {
        for transitive in &graph.node(*dep).order_dependencies {
            direct.remove(transitive);
        }
    }
    direct
}

impl Graph {
    /// Serialize the nodes still to run at exactly one trigger level as a
    /// distributed execution plan.
    pub fn export(
        &self,
        completed: &BTreeSet<NodeId>,
        trigger: Option<TriggerId>,
    ) -> ExportedPlan {
        let to_run: BTreeSet<NodeId> = self
            .live_nodes()
            .filter(|n| !completed.contains(n) && self.is_behind(*n, trigger))
            .collect();

        let mut groups = Vec::new();
        for agent in self.agents.iter().filter(|a| !a.nodes.is_empty()) {
            let group_nodes: Vec<NodeId> = agent
                .nodes
                .iter()
                .copied()
                .filter(|n| {
                    to_run.contains(n) && self.node(*n).controlling_trigger == trigger
                })
                .collect();
            if group_nodes.is_empty() {
                continue;
            }
            let nodes = group_nodes
                .iter()
                .map(|id| {
                    let node = self.node(*id);
                    let depends_on: Vec<NodeId> = self
                        .direct_order_dependencies(*id)
                        .into_iter()
                        .filter(|d| {
                            to_run.contains(d)
                                && self.node(*d).controlling_trigger == trigger
                        })
                        .collect();
                    ExportedNode {
                        name: node.name.clone(),
                        depends_on: join_names(self, depends_on),
                        notify: ExportedNotify {
                            default: join_set(&node.notify_users),
                            submitters: join_set(&node.notify_submitters),
                            warnings: node.notify_on_warnings,
                        },
                    }
                })
                .collect();
            groups.push(ExportedGroup {
                name: agent.name.clone(),
                agent_types: agent.possible_types.clone(),
                nodes,
            });
        }

        let badges = self
            .badges
            .iter()
            .map(|badge| {
                let mut all: BTreeSet<NodeId> = BTreeSet::new();
                for node in &badge.nodes {
                    all.insert(*node);
                    all.extend(self.node(*node).order_dependencies.iter().copied());
                }
                let direct = direct_subset(self, &all);
                ExportedBadge {
                    name: badge.name.clone(),
                    project: (!badge.project.is_empty()).then(|| badge.project.clone()),
                    change: (badge.change != 0).then_some(badge.change),
                    all_dependencies: join_names(self, all),
                    direct_dependencies: join_names(self, direct),
                }
            })
            .collect();

        let mut reports: Vec<ExportedReport> = self
            .reports
            .iter()
            .map(|report| {
                let direct = direct_subset(self, &report.nodes);
                ExportedReport {
                    name: report.name.clone(),
                    all_dependencies: join_names(self, report.nodes.iter().copied()),
                    direct_dependencies: join_names(self, direct),
                    notify: join_set(&report.notify_users),
                    is_trigger: false,
                }
            })
            .collect();

        // Downstream triggers at the next level get a synthesized dependency
        // block of the same shape.
        let mut downstream: Vec<TriggerId> = self
            .name_to_trigger
            .values()
            .copied()
            .filter(|t| self.triggers.get(*t).parent == trigger)
            .collect();
        downstream.sort();
        for t in downstream {
            let mut all: BTreeSet<NodeId> = BTreeSet::new();
            for node in self.live_nodes() {
                if completed.contains(&node) || !self.is_behind(node, Some(t)) {
                    continue;
                }
                for dep in &self.node(node).order_dependencies {
                    if !completed.contains(dep)
                        && self.node(*dep).controlling_trigger == trigger
                    {
                        all.insert(*dep);
                    }
                }
            }
            let direct = direct_subset(self, &all);
            reports.push(ExportedReport {
                name: self.triggers.qualified_name(t),
                all_dependencies: join_names(self, all),
                direct_dependencies: join_names(self, direct),
                notify: join_set(&self.triggers.get(t).notify_users),
                is_trigger: true,
            });
        }

        ExportedPlan {
            groups,
            badges,
            reports,
        }
    }

    /// Export the plan as pretty-printed JSON at `path`.
    pub fn export_to_file(
        &self,
        path: &Path,
        completed: &BTreeSet<NodeId>,
        trigger: Option<TriggerId>,
    ) -> Result<()> {
        let plan = self.export(completed, trigger);
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, &plan)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Preprocessed markup output
// ---------------------------------------------------------------------------

fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

impl Graph {
    fn write_agent<W: Write>(
        &self,
        writer: &mut W,
        agent: &crate::graph::Agent,
        trigger: Option<TriggerId>,
        indent: &str,
    ) -> Result<()> {
        let nodes: Vec<NodeId> = agent
            .nodes
            .iter()
            .copied()
            .filter(|n| self.node(*n).controlling_trigger == trigger)
            .collect();
        if nodes.is_empty() {
            return Ok(());
        }
        writeln!(
            writer,
            "{indent}<Agent Name=\"{}\" Type=\"{}\">",
            escape_attr(&agent.name),
            escape_attr(&agent.possible_types.join(";"))
        )?;
        for id in nodes {
            let node = self.node(id);
            let requires = node
                .inputs
                .iter()
                .map(|o| self.output(*o).tag_name.clone())
                .collect::<Vec<_>>()
                .join(";");
            let produces = node.outputs[1..]
                .iter()
                .map(|o| self.output(*o).tag_name.clone())
                .collect::<Vec<_>>()
                .join(";");
            let after: Vec<NodeId> = self
                .direct_order_dependencies(id)
                .into_iter()
                .filter(|d| !node.input_dependencies.contains(d))
                .collect();
            write!(
                writer,
                "{indent}  <Node Name=\"{}\"",
                escape_attr(&node.name)
            )?;
            if !requires.is_empty() {
                write!(writer, " Requires=\"{}\"", escape_attr(&requires))?;
            }
            if !produces.is_empty() {
                write!(writer, " Produces=\"{}\"", escape_attr(&produces))?;
            }
            if !after.is_empty() {
                write!(
                    writer,
                    " After=\"{}\"",
                    escape_attr(&join_names(self, after))
                )?;
            }
            if !node.notify_on_warnings {
                write!(writer, " NotifyOnWarnings=\"false\"")?;
            }
            if node.tasks.is_empty() {
                writeln!(writer, "/>")?;
                continue;
            }
            writeln!(writer, ">")?;
            for task in &node.tasks {
                write!(writer, "{indent}    <{}", task.name())?;
                for (key, value) in task.parameters() {
                    write!(writer, " {key}=\"{}\"", escape_attr(&value))?;
                }
                writeln!(writer, "/>")?;
            }
            writeln!(writer, "{indent}  </Node>")?;
        }
        writeln!(writer, "{indent}</Agent>")?;
        Ok(())
    }

    /// Emit the reduced graph in markup form: root-level agents first, then
    /// each trigger level wrapped in a `Trigger` element, then aggregates,
    /// reports and badges.
    pub fn write_preprocessed<W: Write>(&self, writer: &mut W) -> Result<()> {
        writeln!(
            writer,
            "<BuildGraph xmlns=\"{}\">",
            gantry_script::NAMESPACE
        )?;
        for agent in self.agents.iter().filter(|a| !a.nodes.is_empty()) {
            self.write_agent(writer, agent, None, "  ")?;
        }
        let mut live: Vec<TriggerId> = self.name_to_trigger.values().copied().collect();
        live.sort();
        for t in live {
            writeln!(
                writer,
                "  <Trigger Name=\"{}\">",
                escape_attr(&self.triggers.qualified_name(t))
            )?;
            for agent in self.agents.iter().filter(|a| !a.nodes.is_empty()) {
                self.write_agent(writer, agent, Some(t), "    ")?;
            }
            writeln!(writer, "  </Trigger>")?;
        }
        for aggregate in &self.aggregates {
            let members: Vec<NodeId> = aggregate
                .nodes
                .iter()
                .copied()
                .filter(|n| self.is_node_live(*n))
                .collect();
            writeln!(
                writer,
                "  <Aggregate Name=\"{}\" Requires=\"{}\"/>",
                escape_attr(&aggregate.name),
                escape_attr(&join_names(self, members))
            )?;
        }
        for report in &self.reports {
            writeln!(
                writer,
                "  <Report Name=\"{}\" Requires=\"{}\"/>",
                escape_attr(&report.name),
                escape_attr(&join_names(self, report.nodes.iter().copied()))
            )?;
        }
        for badge in &self.badges {
            writeln!(
                writer,
                "  <Badge Name=\"{}\" Project=\"{}\" Change=\"{}\" Requires=\"{}\"/>",
                escape_attr(&badge.name),
                escape_attr(&badge.project),
                badge.change,
                escape_attr(&join_names(self, badge.nodes.iter().copied()))
            )?;
        }
        writeln!(writer, "</BuildGraph>")?;
        Ok(())
    }

    /// Human-readable listing of the trigger forest, agents, nodes (with
    /// direct dependency annotations), aggregates and reports.
    pub fn print<W: Write>(&self, writer: &mut W, completed: &BTreeSet<NodeId>) -> Result<()> {
        if !self.options.is_empty() {
            writeln!(writer, "Options:")?;
            for option in &self.options {
                writeln!(
                    writer,
                    "  -set:{}=... {} (default: {})",
                    option.name, option.description, option.default_value
                )?;
            }
            writeln!(writer)?;
        }

        let mut levels: Vec<Option<TriggerId>> = vec![None];
        let mut live: Vec<TriggerId> = self.name_to_trigger.values().copied().collect();
        live.sort();
        levels.extend(live.into_iter().map(Some));

        for level in levels {
            match level {
                None => writeln!(writer, "Graph:")?,
                Some(t) => writeln!(
                    writer,
                    "Trigger: {}",
                    self.triggers.qualified_name(t)
                )?,
            }
            for agent in self.agents.iter().filter(|a| !a.nodes.is_empty()) {
                let nodes: Vec<NodeId> = agent
                    .nodes
                    .iter()
                    .copied()
                    .filter(|n| self.node(*n).controlling_trigger == level)
                    .collect();
                if nodes.is_empty() {
                    continue;
                }
                writeln!(
                    writer,
                    "  Agent: {} ({})",
                    agent.name,
                    agent.possible_types.join(";")
                )?;
                for id in nodes {
                    let node = self.node(id);
                    let marker = if completed.contains(&id) { " (complete)" } else { "" };
                    writeln!(writer, "    Node: {}{}", node.name, marker)?;
                    let direct = self.direct_order_dependencies(id);
                    if !direct.is_empty() {
                        writeln!(
                            writer,
                            "      depends on: {}",
                            join_names(self, direct)
                        )?;
                    }
                }
            }
        }

        for aggregate in &self.aggregates {
            writeln!(
                writer,
                "Aggregate: {} = {}",
                aggregate.name,
                join_names(
                    self,
                    aggregate
                        .nodes
                        .iter()
                        .copied()
                        .filter(|n| self.is_node_live(*n))
                )
            )?;
        }
        for report in &self.reports {
            writeln!(
                writer,
                "Report: {} = {}",
                report.name,
                join_names(self, report.nodes.iter().copied())
            )?;
        }
        Ok(())
    }
}
