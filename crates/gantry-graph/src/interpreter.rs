//! Tree-walking interpreter over a parsed build-graph script.
//!
//! Interpretation is single-pass, top-to-bottom, depth-first. Errors are
//! recorded into a [`DiagnosticSink`] and interpretation continues past them
//! on a best-effort basis; the load fails at the end if any error was
//! recorded.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use gantry_script::ScriptElement;
use gantry_types::{DiagnosticSink, GantryError, Result, Severity, SourceLocation};

use crate::expr;
use crate::graph::{
    normalize, Agent, AgentId, Aggregate, Badge, Graph, GraphDiagnostic, GraphOption, Node,
    NodeId, NodeOutput, OutputId, Report,
};
use crate::scope::ScopeStack;
use crate::task::{validate_value, TaskArgs, TaskRegistry};
use crate::trigger::TriggerId;

/// Which element set is legal at the current point of the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    /// Graph root and trigger bodies.
    Graph,
    /// Inside an `Agent` element.
    Agent,
    /// Inside a `Node` element; unrecognized names resolve as tasks here.
    Node,
}

fn split_list(text: &str) -> Vec<String> {
    text.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn validate_entity_name(name: &str) -> std::result::Result<(), String> {
    if name.trim().is_empty() {
        return Err("name must not be empty".to_string());
    }
    if name != name.trim() {
        return Err(format!("name '{name}' has leading or trailing whitespace"));
    }
    for c in name.chars() {
        if !(c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == ' ' || c == '.') {
            return Err(format!("invalid character '{c}' in name '{name}'"));
        }
    }
    Ok(())
}

/// Builds a [`Graph`] from a script document.
pub struct GraphScriptInterpreter<'a> {
    registry: &'a TaskRegistry,
    overrides: HashMap<String, String>,
    graph: Graph,
    scopes: ScopeStack,
    sink: DiagnosticSink,
    option_names: HashSet<String>,
    current_trigger: Option<TriggerId>,
    current_agent: Option<AgentId>,
    current_node: Option<NodeId>,
    include_dirs: Vec<PathBuf>,
}

impl<'a> GraphScriptInterpreter<'a> {
    pub fn new(registry: &'a TaskRegistry) -> Self {
        Self {
            registry,
            overrides: HashMap::new(),
            graph: Graph::new(),
            scopes: ScopeStack::new(),
            sink: DiagnosticSink::new(),
            option_names: HashSet::new(),
            current_trigger: None,
            current_agent: None,
            current_node: None,
            include_dirs: Vec::new(),
        }
    }

    /// Override a declared option's value (`--set NAME=VALUE`).
    pub fn set_option(&mut self, name: &str, value: &str) {
        self.overrides.insert(normalize(name), value.to_string());
    }

    /// Load and interpret a script file.
    pub fn load(self, path: &Path) -> Result<Graph> {
        let root = gantry_script::parse_file(path)?;
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        self.finish(&root, &base)
    }

    /// Interpret an already-parsed script; includes resolve against `base`.
    pub fn load_str(self, text: &str, file: &str) -> Result<Graph> {
        let root = gantry_script::parse(text, file)?;
        self.finish(&root, Path::new("."))
    }

    fn finish(self, root: &ScriptElement, base: &Path) -> Result<Graph> {
        let (graph, sink) = self.interpret(root, base);
        match graph {
            Some(graph) => Ok(graph),
            None => Err(GantryError::ScriptFailed {
                errors: sink.error_count(),
            }),
        }
    }

    /// Run the walk and return the graph (if error-free) plus all recorded
    /// diagnostics.
    pub fn interpret(
        mut self,
        root: &ScriptElement,
        base: &Path,
    ) -> (Option<Graph>, DiagnosticSink) {
        self.include_dirs.push(base.to_path_buf());
        self.process_contents(&root.children, BodyKind::Graph);
        self.include_dirs.pop();
        if self.sink.error_count() > 0 {
            (None, self.sink)
        } else {
            (Some(self.graph), self.sink)
        }
    }

    // -- attribute helpers ---------------------------------------------------

    fn expand(&mut self, text: &str, location: &SourceLocation) -> String {
        let (out, unresolved) = self.scopes.expand(text);
        for name in unresolved {
            self.sink.warning(
                location,
                format!("property '{name}' is not defined; expanding to an empty string"),
            );
        }
        out
    }

    fn attr(&mut self, elem: &ScriptElement, name: &str) -> Option<String> {
        elem.attribute(name)
            .map(|raw| raw.to_string())
            .map(|raw| self.expand(&raw, &elem.location))
    }

    fn require_attr(&mut self, elem: &ScriptElement, name: &str) -> Option<String> {
        let value = self.attr(elem, name);
        if value.is_none() {
            self.sink.error(
                &elem.location,
                format!("missing required attribute '{name}' on <{}>", elem.name),
            );
        }
        value
    }

    fn bool_attr(&mut self, elem: &ScriptElement, name: &str, default: bool) -> bool {
        match self.attr(elem, name) {
            None => default,
            Some(v) if v.eq_ignore_ascii_case("true") => true,
            Some(v) if v.eq_ignore_ascii_case("false") => false,
            Some(v) => {
                self.sink.error(
                    &elem.location,
                    format!("attribute '{name}' must be true or false, found '{v}'"),
                );
                default
            }
        }
    }

    fn check_attributes(&mut self, elem: &ScriptElement, allowed: &[&str]) {
        for (name, _) in &elem.attributes {
            if name == "If" {
                continue;
            }
            if !allowed.iter().any(|a| a.eq_ignore_ascii_case(name)) {
                self.sink.error(
                    &elem.location,
                    format!("unrecognized attribute '{name}' on <{}>", elem.name),
                );
            }
        }
    }

    /// Evaluate an element's `If` attribute. Expression errors are logged and
    /// treated as false, skipping the element without aborting the walk.
    fn condition_passes(&mut self, elem: &ScriptElement) -> bool {
        let Some(raw) = elem.attribute("If") else {
            return true;
        };
        let raw = raw.to_string();
        let expanded = self.expand(&raw, &elem.location);
        match expr::evaluate_condition(&expanded) {
            Ok(result) => result,
            Err(err) => {
                self.sink.error(&elem.location, err.to_string());
                false
            }
        }
    }

    // -- reference resolution ------------------------------------------------

    /// True iff `dep` equals or is a strict ancestor of the current trigger.
    fn trigger_compatible(&self, dep: Option<TriggerId>) -> bool {
        let mut cursor = self.current_trigger;
        loop {
            if cursor == dep {
                return true;
            }
            match cursor {
                Some(t) => cursor = self.graph.triggers.get(t).parent,
                None => return false,
            }
        }
    }

    fn push_unique(outputs: &mut Vec<OutputId>, id: OutputId) {
        if !outputs.contains(&id) {
            outputs.push(id);
        }
    }

    /// Resolve a `Requires` list to outputs. A `#tag` names exactly that
    /// output; a plain node name pulls in the node's outputs *and* inputs; an
    /// aggregate applies the node rule to each member.
    fn resolve_input_references(&mut self, list: &str, location: &SourceLocation) -> Vec<OutputId> {
        let mut outputs = Vec::new();
        for name in split_list(list) {
            if name.starts_with('#') {
                match self.graph.find_output(&name) {
                    Some(output) => Self::push_unique(&mut outputs, output),
                    None => self
                        .sink
                        .error(location, format!("unknown tag '{name}'")),
                }
            } else if let Some(node) = self.graph.find_node(&name) {
                let node = self.graph.node(node);
                for output in node.outputs.iter().chain(node.inputs.iter()) {
                    Self::push_unique(&mut outputs, *output);
                }
            } else if let Some(&idx) = self.graph.name_to_aggregate.get(&normalize(&name)) {
                let members: Vec<NodeId> =
                    self.graph.aggregates[idx].nodes.iter().copied().collect();
                for member in members {
                    let node = self.graph.node(member);
                    for output in node.outputs.iter().chain(node.inputs.iter()) {
                        Self::push_unique(&mut outputs, *output);
                    }
                }
            } else {
                self.sink
                    .error(location, format!("unknown reference '{name}'"));
            }
        }
        outputs
    }

    /// Resolve a name list to a node set: tags name their producer, node names
    /// themselves, aggregates their members.
    fn resolve_node_references(
        &mut self,
        list: &str,
        location: &SourceLocation,
    ) -> BTreeSet<NodeId> {
        let mut nodes = BTreeSet::new();
        for name in split_list(list) {
            if name.starts_with('#') {
                match self.graph.find_output(&name) {
                    Some(output) => {
                        nodes.insert(self.graph.output(output).producer);
                    }
                    None => self
                        .sink
                        .error(location, format!("unknown tag '{name}'")),
                }
            } else if let Some(node) = self.graph.find_node(&name) {
                nodes.insert(node);
            } else if let Some(&idx) = self.graph.name_to_aggregate.get(&normalize(&name)) {
                nodes.extend(self.graph.aggregates[idx].nodes.iter().copied());
            } else {
                self.sink
                    .error(location, format!("unknown reference '{name}'"));
            }
        }
        nodes
    }

    fn name_in_use(&self, name: &str) -> bool {
        let key = normalize(name);
        self.graph.name_to_node.contains_key(&key)
            || self.graph.name_to_aggregate.contains_key(&key)
            || self.graph.name_to_report.contains_key(&key)
    }

    /// Validate a name and check it against the shared node/aggregate/report
    /// namespace, logging an error on failure.
    fn claim_name(&mut self, name: &str, location: &SourceLocation) -> bool {
        if let Err(msg) = validate_entity_name(name) {
            self.sink.error(location, msg);
            return false;
        }
        if self.name_in_use(name) {
            self.sink
                .error(location, format!("'{name}' is already declared"));
            return false;
        }
        true
    }

    // -- element dispatch ----------------------------------------------------

    fn process_contents(&mut self, children: &[ScriptElement], kind: BodyKind) {
        for child in children {
            self.process_element(child, kind);
        }
    }

    fn process_element(&mut self, elem: &ScriptElement, kind: BodyKind) {
        if !self.condition_passes(elem) {
            return;
        }
        match (elem.name.as_str(), kind) {
            ("Include", BodyKind::Graph) => self.process_include(elem),
            ("Option", BodyKind::Graph) => self.process_option(elem),
            ("Property", _) => self.process_property(elem),
            ("EnvVar", _) => self.process_envvar(elem),
            ("Agent", BodyKind::Graph) => self.process_agent(elem),
            ("Trigger", BodyKind::Graph) => self.process_trigger(elem),
            ("Aggregate", BodyKind::Graph) => self.process_aggregate(elem),
            ("Report", BodyKind::Graph) => self.process_report(elem),
            ("Badge", BodyKind::Graph) => self.process_badge(elem),
            ("Node", BodyKind::Agent) => self.process_node(elem),
            ("Notify", _) => self.process_notify(elem),
            ("Warning", _) => self.process_deferred(elem, Severity::Warning),
            ("Error", _) => self.process_deferred(elem, Severity::Error),
            ("Do", k) => {
                self.check_attributes(elem, &[]);
                self.scopes.push();
                self.process_contents(&elem.children, k);
                self.scopes.pop();
            }
            ("Switch", k) => self.process_switch(elem, k),
            ("ForEach", k) => self.process_foreach(elem, k),
            (_, BodyKind::Node) => self.process_task(elem),
            (name, _) => {
                self.sink.error(
                    &elem.location,
                    format!("unrecognized element <{name}> here"),
                );
            }
        }
    }

    // -- structural elements -------------------------------------------------

    fn process_include(&mut self, elem: &ScriptElement) {
        self.check_attributes(elem, &["Script"]);
        let Some(script) = self.require_attr(elem, "Script") else {
            return;
        };
        let base = self
            .include_dirs
            .last()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("."));
        let path = base.join(&script);
        match gantry_script::parse_file(&path) {
            Ok(root) => {
                let dir = path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("."));
                self.include_dirs.push(dir);
                self.process_contents(&root.children, BodyKind::Graph);
                self.include_dirs.pop();
            }
            Err(err) => {
                self.sink.error(
                    &elem.location,
                    format!("failed to include '{}': {err}", path.display()),
                );
            }
        }
    }

    fn process_option(&mut self, elem: &ScriptElement) {
        self.check_attributes(elem, &["Name", "Description", "DefaultValue"]);
        let Some(name) = self.require_attr(elem, "Name") else {
            return;
        };
        if !self.option_names.insert(normalize(&name)) {
            self.sink.error(
                &elem.location,
                format!("option '{name}' is declared more than once"),
            );
            return;
        }
        let description = self.attr(elem, "Description").unwrap_or_default();
        let default_value = self.attr(elem, "DefaultValue").unwrap_or_default();
        let value = self
            .overrides
            .get(&normalize(&name))
            .cloned()
            .unwrap_or_else(|| default_value.clone());
        if let Err(err) = self.scopes.set(&name, value) {
            self.sink.error(&elem.location, err.to_string());
        }
        self.graph.options.push(GraphOption {
            name,
            description,
            default_value,
        });
    }

    fn process_property(&mut self, elem: &ScriptElement) {
        self.check_attributes(elem, &["Name", "Value"]);
        let Some(name) = self.require_attr(elem, "Name") else {
            return;
        };
        let Some(value) = self.require_attr(elem, "Value") else {
            return;
        };
        if let Err(err) = self.scopes.set(&name, value) {
            self.sink.error(&elem.location, err.to_string());
        }
    }

    fn process_envvar(&mut self, elem: &ScriptElement) {
        self.check_attributes(elem, &["Name"]);
        let Some(name) = self.require_attr(elem, "Name") else {
            return;
        };
        let value = std::env::var(&name).unwrap_or_default();
        self.scopes.set_root_if_unset(&name, value);
    }

    fn process_agent(&mut self, elem: &ScriptElement) {
        self.check_attributes(elem, &["Name", "Type"]);
        let Some(name) = self.require_attr(elem, "Name") else {
            return;
        };
        let types = split_list(&self.attr(elem, "Type").unwrap_or_default());

        let agent_id = match self.graph.find_agent(&name) {
            Some(id) => {
                // Re-declaration narrows the candidate pool and appends nodes.
                if !types.is_empty() {
                    let agent = &mut self.graph.agents[id.0];
                    agent.possible_types.retain(|t| {
                        types.iter().any(|n| n.eq_ignore_ascii_case(t))
                    });
                }
                id
            }
            None => {
                if let Err(msg) = validate_entity_name(&name) {
                    self.sink.error(&elem.location, msg);
                    return;
                }
                if types.is_empty() {
                    self.sink.error(
                        &elem.location,
                        format!("agent '{name}' must declare at least one type"),
                    );
                    return;
                }
                let id = AgentId(self.graph.agents.len());
                self.graph.agents.push(Agent {
                    name: name.clone(),
                    possible_types: types,
                    nodes: Vec::new(),
                });
                self.graph.name_to_agent.insert(normalize(&name), id);
                id
            }
        };

        let saved = self.current_agent;
        self.current_agent = Some(agent_id);
        self.scopes.push();
        self.process_contents(&elem.children, BodyKind::Agent);
        self.scopes.pop();
        self.current_agent = saved;
    }

    fn process_trigger(&mut self, elem: &ScriptElement) {
        self.check_attributes(elem, &["Name"]);
        let Some(name) = self.require_attr(elem, "Name") else {
            return;
        };

        let segments: Vec<&str> = name.split('.').collect();
        let mut parent: Option<TriggerId> = None;
        for (i, segment) in segments.iter().enumerate() {
            if segment.trim().is_empty() {
                self.sink.error(
                    &elem.location,
                    format!("trigger name '{name}' has an empty segment"),
                );
                return;
            }
            let qualified = segments[..=i].join(".");
            match self.graph.find_trigger(&qualified) {
                Some(id) => parent = Some(id),
                None if i + 1 < segments.len() => {
                    self.sink.error(
                        &elem.location,
                        format!("parent trigger '{qualified}' has not been declared"),
                    );
                    return;
                }
                None => {
                    let id = self.graph.triggers.add(segment.to_string(), parent);
                    self.graph.name_to_trigger.insert(normalize(&qualified), id);
                    parent = Some(id);
                }
            }
        }

        let saved = self.current_trigger;
        self.current_trigger = parent;
        self.scopes.push();
        self.process_contents(&elem.children, BodyKind::Graph);
        self.scopes.pop();
        self.current_trigger = saved;
    }

    fn process_aggregate(&mut self, elem: &ScriptElement) {
        self.check_attributes(elem, &["Name", "Requires"]);
        let Some(name) = self.require_attr(elem, "Name") else {
            return;
        };
        if !self.claim_name(&name, &elem.location) {
            return;
        }
        let requires = self.attr(elem, "Requires").unwrap_or_default();
        let nodes = self.resolve_node_references(&requires, &elem.location);
        let idx = self.graph.aggregates.len();
        self.graph.aggregates.push(Aggregate {
            name: name.clone(),
            nodes,
        });
        self.graph.name_to_aggregate.insert(normalize(&name), idx);
    }

    fn process_report(&mut self, elem: &ScriptElement) {
        self.check_attributes(elem, &["Name", "Requires"]);
        let Some(name) = self.require_attr(elem, "Name") else {
            return;
        };
        if !self.claim_name(&name, &elem.location) {
            return;
        }
        let requires = self.attr(elem, "Requires").unwrap_or_default();
        let mut nodes = self.resolve_node_references(&requires, &elem.location);
        // Reports cover everything their nodes wait for.
        for node in nodes.clone() {
            nodes.extend(self.graph.node(node).order_dependencies.iter().copied());
        }
        let idx = self.graph.reports.len();
        self.graph.reports.push(Report {
            name: name.clone(),
            nodes,
            notify_users: BTreeSet::new(),
        });
        self.graph.name_to_report.insert(normalize(&name), idx);
    }

    fn process_badge(&mut self, elem: &ScriptElement) {
        self.check_attributes(elem, &["Name", "Project", "Change", "Requires"]);
        let Some(name) = self.require_attr(elem, "Name") else {
            return;
        };
        // Badge names must not collide with the shared namespace or each
        // other, but they do not claim entries in it.
        if !self.claim_name(&name, &elem.location) {
            return;
        }
        if self
            .graph
            .badges
            .iter()
            .any(|b| b.name.eq_ignore_ascii_case(&name))
        {
            self.sink
                .error(&elem.location, format!("'{name}' is already declared"));
            return;
        }
        let project = self.attr(elem, "Project").unwrap_or_default();
        let change = match self.attr(elem, "Change") {
            None => 0,
            Some(raw) => match raw.trim().parse::<i64>() {
                Ok(value) => value,
                Err(_) => {
                    self.sink.error(
                        &elem.location,
                        format!("badge change '{raw}' is not an integer"),
                    );
                    0
                }
            },
        };
        let requires = self.attr(elem, "Requires").unwrap_or_default();
        let nodes = self.resolve_node_references(&requires, &elem.location);
        self.graph.badges.push(Badge {
            name,
            project,
            change,
            nodes,
        });
    }

    fn process_notify(&mut self, elem: &ScriptElement) {
        self.check_attributes(elem, &["Targets", "Users", "Submitters", "Warnings"]);
        let users = split_list(&self.attr(elem, "Users").unwrap_or_default());
        let submitters = split_list(&self.attr(elem, "Submitters").unwrap_or_default());
        let warnings = elem
            .has_attribute("Warnings")
            .then(|| self.bool_attr(elem, "Warnings", true));

        let apply = |node: &mut Node| {
            node.notify_users.extend(users.iter().cloned());
            node.notify_submitters.extend(submitters.iter().cloned());
            if let Some(w) = warnings {
                node.notify_on_warnings = w;
            }
        };

        match self.attr(elem, "Targets") {
            Some(targets) => {
                for name in split_list(&targets) {
                    if let Some(&idx) = self.graph.name_to_report.get(&normalize(&name)) {
                        self.graph.reports[idx]
                            .notify_users
                            .extend(users.iter().cloned());
                        continue;
                    }
                    let nodes = self.resolve_node_references(&name, &elem.location);
                    for node in nodes {
                        apply(&mut self.graph.nodes[node.0]);
                    }
                }
            }
            None => {
                if let Some(node) = self.current_node {
                    apply(&mut self.graph.nodes[node.0]);
                } else if let Some(trigger) = self.current_trigger {
                    self.graph
                        .triggers
                        .get_mut(trigger)
                        .notify_users
                        .extend(users.iter().cloned());
                } else {
                    self.sink.error(
                        &elem.location,
                        "Notify requires a Targets attribute outside a node or trigger body",
                    );
                }
            }
        }
    }

    fn process_deferred(&mut self, elem: &ScriptElement, severity: Severity) {
        self.check_attributes(elem, &["Message"]);
        let Some(message) = self.require_attr(elem, "Message") else {
            return;
        };
        self.graph.diagnostics.push(GraphDiagnostic {
            severity,
            message,
            location: elem.location.clone(),
            enclosing_node: self.current_node,
            enclosing_agent: self.current_agent,
            enclosing_trigger: self.current_trigger,
        });
    }

    // -- control elements ----------------------------------------------------

    fn process_switch(&mut self, elem: &ScriptElement, kind: BodyKind) {
        self.check_attributes(elem, &[]);
        self.scopes.push();
        for child in &elem.children {
            match child.name.as_str() {
                "Case" => {
                    if !child.has_attribute("If") {
                        self.sink.error(
                            &child.location,
                            "Case requires an If attribute",
                        );
                        continue;
                    }
                    if self.condition_passes(child) {
                        self.process_contents(&child.children, kind);
                        break;
                    }
                }
                "Default" => {
                    self.process_contents(&child.children, kind);
                    break;
                }
                other => {
                    self.sink.error(
                        &child.location,
                        format!("unexpected element <{other}> in Switch"),
                    );
                }
            }
        }
        self.scopes.pop();
    }

    fn process_foreach(&mut self, elem: &ScriptElement, kind: BodyKind) {
        self.check_attributes(elem, &["Name", "Values"]);
        let Some(name) = self.require_attr(elem, "Name") else {
            return;
        };
        let Some(values) = self.require_attr(elem, "Values") else {
            return;
        };
        self.scopes.push();
        for value in split_list(&values) {
            self.scopes.set_local(&name, value);
            self.process_contents(&elem.children, kind);
        }
        self.scopes.pop();
    }

    // -- node construction ---------------------------------------------------

    fn process_node(&mut self, elem: &ScriptElement) {
        self.check_attributes(
            elem,
            &["Name", "Requires", "Produces", "After", "Token", "NotifyOnWarnings"],
        );
        let Some(agent_id) = self.current_agent else {
            self.sink
                .error(&elem.location, "Node declared outside an Agent body");
            return;
        };
        let Some(name) = self.require_attr(elem, "Name") else {
            return;
        };
        if !self.claim_name(&name, &elem.location) {
            return;
        }

        let requires = self.attr(elem, "Requires").unwrap_or_default();
        let after = self.attr(elem, "After").unwrap_or_default();
        let produces = self.attr(elem, "Produces").unwrap_or_default();
        let tokens = self.attr(elem, "Token").unwrap_or_default();
        let notify_on_warnings = self.bool_attr(elem, "NotifyOnWarnings", true);

        let inputs = self.resolve_input_references(&requires, &elem.location);
        let direct_producers: BTreeSet<NodeId> = inputs
            .iter()
            .map(|o| self.graph.output(*o).producer)
            .collect();

        // A node may not depend on work gated behind an unrelated or
        // downstream trigger.
        for producer in &direct_producers {
            let dep_trigger = self.graph.node(*producer).controlling_trigger;
            if !self.trigger_compatible(dep_trigger) {
                let dep_name = self.graph.node(*producer).name.clone();
                let trigger_name = dep_trigger
                    .map(|t| self.graph.triggers.qualified_name(t))
                    .unwrap_or_default();
                self.sink.error(
                    &elem.location,
                    format!(
                        "node '{name}' cannot require '{dep_name}', which is \
                         behind trigger '{trigger_name}'"
                    ),
                );
            }
        }

        let mut input_dependencies = direct_producers.clone();
        for producer in &direct_producers {
            input_dependencies.extend(
                self.graph.node(*producer).input_dependencies.iter().copied(),
            );
        }

        let mut required_tokens: Vec<PathBuf> =
            split_list(&tokens).into_iter().map(PathBuf::from).collect();
        for dep in &input_dependencies {
            for token in &self.graph.node(*dep).required_tokens {
                if !required_tokens.contains(token) {
                    required_tokens.push(token.clone());
                }
            }
        }

        let after_nodes = self.resolve_node_references(&after, &elem.location);
        let mut order_dependencies = input_dependencies.clone();
        order_dependencies.extend(after_nodes);
        for dep in order_dependencies.clone() {
            order_dependencies.extend(self.graph.node(dep).order_dependencies.iter().copied());
        }

        // Dependency edges may only point at agents declared earlier.
        for dep in &order_dependencies {
            let dep_agent = self.graph.node(*dep).agent;
            if dep_agent.0 > agent_id.0 {
                let dep_name = self.graph.node(*dep).name.clone();
                let agent_name = self.graph.agent(dep_agent).name.clone();
                self.sink.error(
                    &elem.location,
                    format!(
                        "node '{name}' depends on '{dep_name}' in agent \
                         '{agent_name}', which is declared later"
                    ),
                );
            }
        }

        let node_id = NodeId(self.graph.nodes.len());
        let mut outputs = Vec::new();
        let default_tag = format!("#{name}");
        if !self.register_output(node_id, &default_tag, &elem.location, &mut outputs) {
            return;
        }
        for tag in split_list(&produces) {
            if !tag.starts_with('#') {
                self.sink.error(
                    &elem.location,
                    format!("produced tag '{tag}' must start with '#'"),
                );
                continue;
            }
            self.register_output(node_id, &tag, &elem.location, &mut outputs);
        }

        self.graph.nodes.push(Node {
            name: name.clone(),
            inputs,
            outputs,
            input_dependencies,
            order_dependencies,
            controlling_trigger: self.current_trigger,
            required_tokens,
            tasks: Vec::new(),
            notify_users: BTreeSet::new(),
            notify_submitters: BTreeSet::new(),
            notify_on_warnings,
            agent: agent_id,
        });
        self.graph.agents[agent_id.0].nodes.push(node_id);
        self.graph.name_to_node.insert(normalize(&name), node_id);

        let saved = self.current_node;
        self.current_node = Some(node_id);
        self.scopes.push();
        self.process_contents(&elem.children, BodyKind::Node);
        self.scopes.pop();
        self.current_node = saved;
    }

    fn register_output(
        &mut self,
        producer: NodeId,
        tag: &str,
        location: &SourceLocation,
        outputs: &mut Vec<OutputId>,
    ) -> bool {
        let key = normalize(tag);
        if self.graph.tag_name_to_output.contains_key(&key) {
            self.sink.error(
                location,
                format!("tag '{tag}' is already produced by another node"),
            );
            return false;
        }
        if self.graph.local_tag_names.contains(&key) {
            self.sink.error(
                location,
                format!("tag '{tag}' is already in ad-hoc use by a task"),
            );
            return false;
        }
        let id = OutputId(self.graph.outputs.len());
        self.graph.outputs.push(NodeOutput {
            producer,
            tag_name: tag.to_string(),
        });
        self.graph.tag_name_to_output.insert(key, id);
        outputs.push(id);
        true
    }

    // -- task elements -------------------------------------------------------

    fn process_task(&mut self, elem: &ScriptElement) {
        let Some(node_id) = self.current_node else {
            return;
        };
        let Some(descriptor) = self.registry.get(&elem.name) else {
            self.sink.error(
                &elem.location,
                format!("unknown task '{}'", elem.name),
            );
            return;
        };

        let mut values = HashMap::new();
        for (attr_name, raw) in &elem.attributes {
            if attr_name == "If" {
                continue;
            }
            let Some(parameter) = descriptor
                .parameters
                .iter()
                .find(|p| p.name.eq_ignore_ascii_case(attr_name))
            else {
                self.sink.error(
                    &elem.location,
                    format!("unknown attribute '{attr_name}' on task <{}>", elem.name),
                );
                continue;
            };
            let kind = parameter.kind;
            let param_name = parameter.name;
            let value = self.expand(raw, &elem.location);
            if let Err(msg) = validate_value(kind, &value) {
                self.sink.error(
                    &elem.location,
                    format!("invalid value for '{param_name}': {msg}"),
                );
                continue;
            }
            values.insert(param_name.to_ascii_lowercase(), value);
        }
        let mut missing = false;
        for parameter in &descriptor.parameters {
            if parameter.required && !values.contains_key(&parameter.name.to_ascii_lowercase()) {
                self.sink.error(
                    &elem.location,
                    format!(
                        "missing required attribute '{}' on task <{}>",
                        parameter.name, elem.name
                    ),
                );
                missing = true;
            }
        }
        if missing {
            return;
        }

        let args = TaskArgs::new(values, elem.location.clone());
        let task = match (descriptor.construct)(&args) {
            Ok(task) => task,
            Err(err) => {
                self.sink.error(&elem.location, err.to_string());
                return;
            }
        };

        for tag in task.consumed_tags() {
            match self.graph.find_output(&tag) {
                Some(output) => {
                    let producer = self.graph.output(output).producer;
                    if producer != node_id && !self.graph.node(node_id).inputs.contains(&output) {
                        let producer_name = self.graph.node(producer).name.clone();
                        self.sink.error(
                            &elem.location,
                            format!(
                                "task consumes tag '{tag}' produced by '{producer_name}' \
                                 without declaring it as an input"
                            ),
                        );
                    }
                }
                None => {
                    self.graph.local_tag_names.insert(normalize(&tag));
                }
            }
        }
        for tag in task.produced_tags() {
            match self.graph.find_output(&tag) {
                Some(output) if self.graph.output(output).producer != node_id => {
                    let producer = self.graph.output(output).producer;
                    let producer_name = self.graph.node(producer).name.clone();
                    self.sink.error(
                        &elem.location,
                        format!(
                            "task produces tag '{tag}', which is an output of '{producer_name}'"
                        ),
                    );
                }
                Some(_) => {}
                None => {
                    self.graph.local_tag_names.insert(normalize(&tag));
                }
            }
        }

        self.graph.nodes[node_id.0].tasks.push(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{JobContext, ParamKind, Task, TaskDescriptor, TaskParameter};

    struct LogTask {
        message: String,
    }

    impl Task for LogTask {
        fn name(&self) -> &str {
            "Log"
        }
        fn parameters(&self) -> Vec<(String, String)> {
            vec![("Message".to_string(), self.message.clone())]
        }
        fn execute(&self, _ctx: &mut JobContext) -> Result<()> {
            tracing::info!("{}", self.message);
            Ok(())
        }
    }

    struct StageTask {
        from: Vec<String>,
        to: Option<String>,
    }

    impl Task for StageTask {
        fn name(&self) -> &str {
            "Stage"
        }
        fn parameters(&self) -> Vec<(String, String)> {
            let mut params = Vec::new();
            if !self.from.is_empty() {
                params.push(("From".to_string(), self.from.join(";")));
            }
            if let Some(to) = &self.to {
                params.push(("To".to_string(), to.clone()));
            }
            params
        }
        fn consumed_tags(&self) -> Vec<String> {
            self.from.clone()
        }
        fn produced_tags(&self) -> Vec<String> {
            self.to.clone().into_iter().collect()
        }
        fn execute(&self, _ctx: &mut JobContext) -> Result<()> {
            Ok(())
        }
    }

    fn test_registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry.register(TaskDescriptor {
            name: "Log",
            parameters: vec![TaskParameter::required("Message", ParamKind::Text)],
            construct: |args| {
                Ok(Box::new(LogTask {
                    message: args.require("Message")?,
                }))
            },
        });
        registry.register(TaskDescriptor {
            name: "Stage",
            parameters: vec![
                TaskParameter::optional("From", ParamKind::TagList),
                TaskParameter::optional("To", ParamKind::Tag),
            ],
            construct: |args| {
                Ok(Box::new(StageTask {
                    from: args.get_list("From"),
                    to: args.get("To").map(String::from),
                }))
            },
        });
        registry
    }

    fn load(body: &str) -> Result<Graph> {
        let registry = test_registry();
        let text = format!(
            "<BuildGraph xmlns=\"{}\">{body}</BuildGraph>",
            gantry_script::NAMESPACE
        );
        GraphScriptInterpreter::new(&registry).load_str(&text, "test.xml")
    }

    #[test]
    fn minimal_agent_and_node() {
        let graph = load(
            r##"<Agent Name="Compile" Type="Win64;Linux">
                 <Node Name="Build"/>
               </Agent>"#,
        )
        .unwrap();
        let node = graph.find_node("Build").unwrap();
        assert_eq!(graph.output(graph.node(node).outputs[0]).tag_name, "##Build");
        assert_eq!(graph.agent(graph.node(node).agent).name, "Compile");
        assert!(graph.node(node).notify_on_warnings);
    }

    #[test]
    fn duplicate_node_name_fails_load() {
        let err = load(
            r#"<Agent Name="A" Type="T">
                 <Node Name="Build"/>
                 <Node Name="build"/>
               </Agent>"#,
        )
        .unwrap_err();
        assert!(matches!(err, GantryError::ScriptFailed { errors: 1 }));
    }

    #[test]
    fn requires_by_tag_and_name() {
        let graph = load(
            r##"<Agent Name="A" Type="T">
                 <Node Name="Build" Produces="#Binaries"/>
                 <Node Name="Pack" Requires="#Binaries"/>
                 <Node Name="Test" Requires="Build"/>
               </Agent>"#,
        )
        .unwrap();
        let build = graph.find_node("Build").unwrap();
        let pack = graph.find_node("Pack").unwrap();
        let test = graph.find_node("Test").unwrap();
        assert_eq!(graph.node(pack).inputs.len(), 1);
        assert_eq!(
            graph.output(graph.node(pack).inputs[0]).tag_name,
            "##Binaries"
        );
        // A plain name reference pulls in every output.
        assert_eq!(graph.node(test).inputs.len(), 2);
        assert_eq!(
            graph.node(test).input_dependencies,
            [build].into_iter().collect()
        );
    }

    #[test]
    fn plain_name_reference_includes_inputs_of_the_node() {
        // C requires A by name; A itself consumes #Upstream, so C's resolved
        // inputs are A's outputs plus A's inputs, not the outputs alone.
        let graph = load(
            r##"<Agent Name="Ag" Type="T">
                 <Node Name="Up" Produces="#Upstream"/>
                 <Node Name="A" Requires="#Upstream" Produces="#B"/>
                 <Node Name="C" Requires="A"/>
               </Agent>"#,
        )
        .unwrap();
        let c = graph.find_node("C").unwrap();
        let tags: Vec<&str> = graph
            .node(c)
            .inputs
            .iter()
            .map(|o| graph.output(*o).tag_name.as_str())
            .collect();
        assert_eq!(tags, vec!["#A", "#B", "##Upstream"]);
    }

    #[test]
    fn after_orders_without_input_dependency() {
        let graph = load(
            r##"<Agent Name="Ag" Type="T">
                 <Node Name="Build"/>
                 <Node Name="Test" Requires="Build"/>
                 <Node Name="Pack" Requires="#Build" After="Test"/>
               </Agent>"##,
        )
        .unwrap();
        let build = graph.find_node("Build").unwrap();
        let test = graph.find_node("Test").unwrap();
        let pack = graph.find_node("Pack").unwrap();
        assert_eq!(
            graph.node(pack).input_dependencies,
            [build].into_iter().collect()
        );
        assert_eq!(
            graph.node(pack).order_dependencies,
            [build, test].into_iter().collect()
        );
    }

    #[test]
    fn property_expansion_and_conditionals() {
        let graph = load(
            r#"<Property Name="Platform" Value="Linux"/>
               <Agent Name="A" Type="$(Platform)">
                 <Node Name="Build-$(Platform)"/>
                 <Do If="'$(Platform)' == 'Linux'">
                   <Node Name="LinuxOnly"/>
                 </Do>
                 <Do If="'$(Platform)' == 'Mac'">
                   <Node Name="MacOnly"/>
                 </Do>
               </Agent>"#,
        )
        .unwrap();
        assert!(graph.find_node("Build-Linux").is_some());
        assert!(graph.find_node("LinuxOnly").is_some());
        assert!(graph.find_node("MacOnly").is_none());
        assert_eq!(graph.agents[0].possible_types, vec!["Linux"]);
    }

    #[test]
    fn bad_condition_is_logged_and_treated_as_false() {
        let err = load(
            r#"<Agent Name="A" Type="T">
                 <Do If="'x' &lt; 1">
                   <Node Name="Skipped"/>
                 </Do>
               </Agent>"#,
        )
        .unwrap_err();
        assert!(matches!(err, GantryError::ScriptFailed { .. }));
    }

    #[test]
    fn switch_enters_first_matching_case() {
        let graph = load(
            r#"<Property Name="Config" Value="Shipping"/>
               <Agent Name="A" Type="T">
                 <Switch>
                   <Case If="'$(Config)' == 'Debug'">
                     <Node Name="DebugBuild"/>
                   </Case>
                   <Case If="'$(Config)' == 'Shipping'">
                     <Node Name="ShippingBuild"/>
                   </Case>
                   <Default>
                     <Node Name="DefaultBuild"/>
                   </Default>
                 </Switch>
               </Agent>"#,
        )
        .unwrap();
        assert!(graph.find_node("ShippingBuild").is_some());
        assert!(graph.find_node("DebugBuild").is_none());
        assert!(graph.find_node("DefaultBuild").is_none());
    }

    #[test]
    fn switch_falls_through_to_default() {
        let graph = load(
            r#"<Agent Name="A" Type="T">
                 <Switch>
                   <Case If="false">
                     <Node Name="Never"/>
                   </Case>
                   <Default>
                     <Node Name="Fallback"/>
                   </Default>
                 </Switch>
               </Agent>"#,
        )
        .unwrap();
        assert!(graph.find_node("Fallback").is_some());
    }

    #[test]
    fn foreach_iterates_values() {
        let graph = load(
            r#"<Agent Name="A" Type="T">
                 <ForEach Name="Platform" Values="Win64;Linux;Mac">
                   <Node Name="Build-$(Platform)"/>
                 </ForEach>
               </Agent>"#,
        )
        .unwrap();
        assert!(graph.find_node("Build-Win64").is_some());
        assert!(graph.find_node("Build-Linux").is_some());
        assert!(graph.find_node("Build-Mac").is_some());
    }

    #[test]
    fn leaked_loop_variable_is_a_scoping_error() {
        let err = load(
            r#"<Agent Name="A" Type="T">
                 <ForEach Name="Temp" Values="1;2">
                   <Node Name="N$(Temp)"/>
                 </ForEach>
               </Agent>
               <Property Name="Temp" Value="3"/>"#,
        )
        .unwrap_err();
        assert!(matches!(err, GantryError::ScriptFailed { .. }));
    }

    #[test]
    fn option_override_and_duplicate() {
        let registry = test_registry();
        let text = format!(
            "<BuildGraph xmlns=\"{}\">\
               <Option Name=\"Config\" Description=\"Build config\" DefaultValue=\"Debug\"/>\
               <Agent Name=\"A\" Type=\"T\"><Node Name=\"Build-$(Config)\"/></Agent>\
             </BuildGraph>",
            gantry_script::NAMESPACE
        );
        let mut interpreter = GraphScriptInterpreter::new(&registry);
        interpreter.set_option("Config", "Shipping");
        let graph = interpreter.load_str(&text, "test.xml").unwrap();
        assert!(graph.find_node("Build-Shipping").is_some());
        assert_eq!(graph.options.len(), 1);
        assert_eq!(graph.options[0].default_value, "Debug");

        let err = load(
            r#"<Option Name="X" DefaultValue="1"/>
               <Option Name="x" DefaultValue="2"/>"#,
        )
        .unwrap_err();
        assert!(matches!(err, GantryError::ScriptFailed { .. }));
    }

    #[test]
    fn envvar_reads_environment_into_root_scope() {
        std::env::set_var("GANTRY_TEST_BRANCH", "release-1.2");
        let graph = load(
            r#"<EnvVar Name="GANTRY_TEST_BRANCH"/>
               <Agent Name="A" Type="T">
                 <Node Name="Build-$(GANTRY_TEST_BRANCH)"/>
               </Agent>"#,
        )
        .unwrap();
        assert!(graph.find_node("Build-release-1.2").is_some());
    }

    #[test]
    fn unresolved_property_expands_empty_with_warning_only() {
        let graph = load(
            r#"<Agent Name="A" Type="T">
                 <Node Name="Build$(Missing)"/>
               </Agent>"#,
        )
        .unwrap();
        assert!(graph.find_node("Build").is_some());
    }

    #[test]
    fn trigger_declarations_and_qualified_names() {
        let graph = load(
            r#"<Trigger Name="Publish">
                 <Agent Name="A" Type="T">
                   <Node Name="Stage"/>
                 </Agent>
               </Trigger>
               <Trigger Name="Publish.Deploy">
                 <Agent Name="A" Type="T">
                   <Node Name="Ship" Requires="Stage"/>
                 </Agent>
               </Trigger>"#,
        )
        .unwrap();
        let publish = graph.find_trigger("Publish").unwrap();
        let deploy = graph.find_trigger("Publish.Deploy").unwrap();
        assert_eq!(graph.triggers.get(deploy).parent, Some(publish));
        let stage = graph.find_node("Stage").unwrap();
        let ship = graph.find_node("Ship").unwrap();
        assert_eq!(graph.node(stage).controlling_trigger, Some(publish));
        assert_eq!(graph.node(ship).controlling_trigger, Some(deploy));
    }

    #[test]
    fn qualified_trigger_requires_declared_parent() {
        let err = load(r#"<Trigger Name="Missing.Child"/>"#).unwrap_err();
        assert!(matches!(err, GantryError::ScriptFailed { .. }));
    }

    #[test]
    fn depending_on_downstream_trigger_is_an_error() {
        let err = load(
            r#"<Trigger Name="Gate">
                 <Agent Name="A" Type="T">
                   <Node Name="Gated"/>
                 </Agent>
               </Trigger>
               <Agent Name="A" Type="T">
                 <Node Name="Free" Requires="Gated"/>
               </Agent>"#,
        )
        .unwrap_err();
        assert!(matches!(err, GantryError::ScriptFailed { .. }));
    }

    #[test]
    fn depending_on_upstream_trigger_is_allowed() {
        let graph = load(
            r#"<Agent Name="A" Type="T">
                 <Node Name="Build"/>
               </Agent>
               <Trigger Name="Gate">
                 <Agent Name="A" Type="T">
                   <Node Name="Gated" Requires="Build"/>
                 </Agent>
               </Trigger>"#,
        )
        .unwrap();
        assert!(graph.find_node("Gated").is_some());
    }

    #[test]
    fn cross_agent_ordering_enforced() {
        // B is declared after A; a node in A may not depend on a node in B.
        let err = load(
            r#"<Agent Name="A" Type="T">
                 <Node Name="First"/>
               </Agent>
               <Agent Name="B" Type="T">
                 <Node Name="Second"/>
               </Agent>
               <Agent Name="A" Type="T">
                 <Node Name="Third" Requires="Second"/>
               </Agent>"#,
        )
        .unwrap_err();
        assert!(matches!(err, GantryError::ScriptFailed { .. }));
    }

    #[test]
    fn later_agent_may_depend_on_earlier() {
        let graph = load(
            r#"<Agent Name="A" Type="T">
                 <Node Name="First"/>
               </Agent>
               <Agent Name="B" Type="T">
                 <Node Name="Second" Requires="First"/>
               </Agent>"#,
        )
        .unwrap();
        assert!(graph.find_node("Second").is_some());
    }

    #[test]
    fn redeclared_agent_appends_nodes_and_intersects_types() {
        let graph = load(
            r#"<Agent Name="A" Type="Win64;Linux">
                 <Node Name="One"/>
               </Agent>
               <Agent Name="A" Type="Linux;Mac">
                 <Node Name="Two"/>
               </Agent>"#,
        )
        .unwrap();
        assert_eq!(graph.agents.len(), 1);
        assert_eq!(graph.agents[0].possible_types, vec!["Linux"]);
        assert_eq!(graph.agents[0].nodes.len(), 2);
    }

    #[test]
    fn produced_tag_collision_is_an_error() {
        let err = load(
            r##"<Agent Name="A" Type="T">
                 <Node Name="One" Produces="#Shared"/>
                 <Node Name="Two" Produces="#Shared"/>
               </Agent>"##,
        )
        .unwrap_err();
        assert!(matches!(err, GantryError::ScriptFailed { .. }));
    }

    #[test]
    fn produced_tag_must_start_with_hash() {
        let err = load(
            r#"<Agent Name="A" Type="T">
                 <Node Name="One" Produces="Bare"/>
               </Agent>"#,
        )
        .unwrap_err();
        assert!(matches!(err, GantryError::ScriptFailed { .. }));
    }

    #[test]
    fn tasks_are_constructed_and_attached() {
        let graph = load(
            r#"<Agent Name="A" Type="T">
                 <Node Name="Build">
                   <Log Message="compiling $(Missing2)x"/>
                   <Log Message="done"/>
                 </Node>
               </Agent>"#,
        )
        .unwrap();
        let node = graph.find_node("Build").unwrap();
        assert_eq!(graph.node(node).tasks.len(), 2);
        assert_eq!(graph.node(node).tasks[0].name(), "Log");
    }

    #[test]
    fn unknown_task_is_an_error() {
        let err = load(
            r#"<Agent Name="A" Type="T">
                 <Node Name="Build">
                   <Compile Target="Editor"/>
                 </Node>
               </Agent>"#,
        )
        .unwrap_err();
        assert!(matches!(err, GantryError::ScriptFailed { .. }));
    }

    #[test]
    fn task_attribute_validation() {
        // Unknown attribute and missing required attribute both fail the load.
        let err = load(
            r#"<Agent Name="A" Type="T">
                 <Node Name="Build">
                   <Log Message="ok" Level="info"/>
                 </Node>
               </Agent>"#,
        )
        .unwrap_err();
        assert!(matches!(err, GantryError::ScriptFailed { .. }));

        let err = load(
            r#"<Agent Name="A" Type="T">
                 <Node Name="Build">
                   <Log/>
                 </Node>
               </Agent>"#,
        )
        .unwrap_err();
        assert!(matches!(err, GantryError::ScriptFailed { .. }));
    }

    #[test]
    fn ad_hoc_task_tags_become_local() {
        let graph = load(
            r##"<Agent Name="A" Type="T">
                 <Node Name="Build">
                   <Stage To="#Scratch"/>
                   <Stage From="#Scratch"/>
                 </Node>
               </Agent>"#,
        )
        .unwrap();
        assert!(graph.local_tag_names.contains("##scratch"));
    }

    #[test]
    fn local_tag_blocks_later_output_declaration() {
        let err = load(
            r##"<Agent Name="A" Type="T">
                 <Node Name="Build">
                   <Stage To="#Scratch"/>
                 </Node>
                 <Node Name="Other" Produces="#Scratch"/>
               </Agent>"##,
        )
        .unwrap_err();
        assert!(matches!(err, GantryError::ScriptFailed { .. }));
    }

    #[test]
    fn consuming_foreign_output_requires_declared_input() {
        let err = load(
            r##"<Agent Name="A" Type="T">
                 <Node Name="Build" Produces="#Binaries"/>
                 <Node Name="Sneaky">
                   <Stage From="#Binaries"/>
                 </Node>
               </Agent>"##,
        )
        .unwrap_err();
        assert!(matches!(err, GantryError::ScriptFailed { .. }));

        let graph = load(
            r##"<Agent Name="A" Type="T">
                 <Node Name="Build" Produces="#Binaries"/>
                 <Node Name="Honest" Requires="#Binaries">
                   <Stage From="#Binaries"/>
                 </Node>
               </Agent>"##,
        )
        .unwrap();
        assert!(graph.find_node("Honest").is_some());
    }

    #[test]
    fn producing_foreign_output_is_an_error() {
        let err = load(
            r##"<Agent Name="A" Type="T">
                 <Node Name="Build" Produces="#Binaries"/>
                 <Node Name="Clobber">
                   <Stage To="#Binaries"/>
                 </Node>
               </Agent>"##,
        )
        .unwrap_err();
        assert!(matches!(err, GantryError::ScriptFailed { .. }));
    }

    #[test]
    fn aggregates_resolve_and_share_namespace() {
        let graph = load(
            r#"<Agent Name="A" Type="T">
                 <Node Name="One"/>
                 <Node Name="Two"/>
               </Agent>
               <Aggregate Name="Both" Requires="One;Two"/>
               <Agent Name="B" Type="T">
                 <Node Name="Three" Requires="Both"/>
               </Agent>"#,
        )
        .unwrap();
        let three = graph.find_node("Three").unwrap();
        assert_eq!(graph.node(three).input_dependencies.len(), 2);

        let err = load(
            r#"<Agent Name="A" Type="T">
                 <Node Name="One"/>
               </Agent>
               <Aggregate Name="One" Requires="One"/>"#,
        )
        .unwrap_err();
        assert!(matches!(err, GantryError::ScriptFailed { .. }));
    }

    #[test]
    fn badge_names_must_be_unique() {
        let err = load(
            r#"<Agent Name="A" Type="T">
                 <Node Name="One"/>
               </Agent>
               <Badge Name="Health" Requires="One"/>
               <Badge Name="health" Requires="One"/>"#,
        )
        .unwrap_err();
        assert!(matches!(err, GantryError::ScriptFailed { .. }));

        let err = load(
            r#"<Agent Name="A" Type="T">
                 <Node Name="One"/>
               </Agent>
               <Badge Name="One" Requires="One"/>"#,
        )
        .unwrap_err();
        assert!(matches!(err, GantryError::ScriptFailed { .. }));
    }

    #[test]
    fn report_pulls_in_order_closure() {
        let graph = load(
            r#"<Agent Name="A" Type="T">
                 <Node Name="Build"/>
                 <Node Name="Test" Requires="Build"/>
               </Agent>
               <Report Name="Nightly" Requires="Test"/>"#,
        )
        .unwrap();
        assert_eq!(graph.reports.len(), 1);
        assert_eq!(graph.reports[0].nodes.len(), 2);
    }

    #[test]
    fn notify_targets_nodes_and_reports() {
        let graph = load(
            r#"<Agent Name="A" Type="T">
                 <Node Name="Build">
                   <Notify Users="dev@example.com" Warnings="false"/>
                 </Node>
               </Agent>
               <Report Name="Nightly" Requires="Build"/>
               <Notify Targets="Nightly" Users="qa@example.com"/>
               <Notify Targets="Build" Submitters="lead@example.com"/>"#,
        )
        .unwrap();
        let build = graph.find_node("Build").unwrap();
        assert!(graph.node(build).notify_users.contains("dev@example.com"));
        assert!(!graph.node(build).notify_on_warnings);
        assert!(graph.node(build).notify_submitters.contains("lead@example.com"));
        assert!(graph.reports[0].notify_users.contains("qa@example.com"));
    }

    #[test]
    fn deferred_diagnostics_record_context() {
        let graph = load(
            r#"<Agent Name="A" Type="T">
                 <Node Name="Build">
                   <Warning Message="slow path enabled"/>
                 </Node>
                 <Error If="false" Message="never recorded"/>
               </Agent>"#,
        )
        .unwrap();
        assert_eq!(graph.diagnostics.len(), 1);
        let diagnostic = &graph.diagnostics[0];
        assert_eq!(diagnostic.severity, Severity::Warning);
        assert_eq!(diagnostic.enclosing_node, graph.find_node("Build"));
    }

    #[test]
    fn unrecognized_element_is_an_error() {
        let err = load(r#"<Frobnicate Name="X"/>"#).unwrap_err();
        assert!(matches!(err, GantryError::ScriptFailed { .. }));
    }

    #[test]
    fn include_pulls_in_sibling_script() {
        let dir = tempfile::tempdir().unwrap();
        let shared = dir.path().join("shared.xml");
        std::fs::write(
            &shared,
            format!(
                "<BuildGraph xmlns=\"{}\">\
                   <Property Name=\"SharedValue\" Value=\"42\"/>\
                 </BuildGraph>",
                gantry_script::NAMESPACE
            ),
        )
        .unwrap();
        let main = dir.path().join("main.xml");
        std::fs::write(
            &main,
            format!(
                "<BuildGraph xmlns=\"{}\">\
                   <Include Script=\"shared.xml\"/>\
                   <Agent Name=\"A\" Type=\"T\"><Node Name=\"N$(SharedValue)\"/></Agent>\
                 </BuildGraph>",
                gantry_script::NAMESPACE
            ),
        )
        .unwrap();

        let registry = test_registry();
        let graph = GraphScriptInterpreter::new(&registry).load(&main).unwrap();
        assert!(graph.find_node("N42").is_some());
    }

    #[test]
    fn missing_include_is_an_error() {
        let err = load(r#"<Include Script="does-not-exist.xml"/>"#).unwrap_err();
        assert!(matches!(err, GantryError::ScriptFailed { .. }));
    }

    #[test]
    fn node_token_accumulates_from_inputs() {
        let graph = load(
            r#"<Agent Name="A" Type="T">
                 <Node Name="Build" Token="locks/compiler.lock"/>
                 <Node Name="Pack" Requires="Build" Token="locks/packager.lock"/>
               </Agent>"#,
        )
        .unwrap();
        let pack = graph.find_node("Pack").unwrap();
        let tokens = &graph.node(pack).required_tokens;
        assert_eq!(tokens.len(), 2);
        assert!(tokens.contains(&PathBuf::from("locks/compiler.lock")));
    }
}
