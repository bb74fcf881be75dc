//! CLI binary for loading, reducing, and exporting Gantry build graphs.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;

use gantry_graph::{Graph, GraphScriptInterpreter, NodeId, TaskRegistry, TriggerId};

#[derive(Parser)]
#[command(
    name = "gantry",
    version,
    about = "Declarative build-graph front-end for distributed agents"
)]
struct Cli {
    /// Path to the build graph script
    script: PathBuf,

    /// Override a declared option (NAME=VALUE, repeatable)
    #[arg(long = "set", value_name = "NAME=VALUE")]
    set: Vec<String>,

    /// Reduce the graph to the named node, tag, or aggregate (repeatable)
    #[arg(long = "target", value_name = "NAME")]
    targets: Vec<String>,

    /// Remove a trigger fence, promoting its nodes to the parent level (repeatable)
    #[arg(long = "skip-trigger", value_name = "NAME")]
    skip_triggers: Vec<String>,

    /// Trigger level to export/list (default: the root level)
    #[arg(long = "trigger", value_name = "NAME")]
    trigger: Option<String>,

    /// Mark a node as already completed (repeatable)
    #[arg(long = "completed", value_name = "NAME")]
    completed: Vec<String>,

    /// Write the distributed execution plan as JSON
    #[arg(long = "export", value_name = "PATH")]
    export: Option<PathBuf>,

    /// Write the reduced graph back out in markup form
    #[arg(long = "preprocess", value_name = "PATH")]
    preprocess: Option<PathBuf>,

    /// Print a human-readable listing of the graph
    #[arg(long = "list")]
    list: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn load_graph(cli: &Cli) -> anyhow::Result<Graph> {
    // Concrete task sets are registered by the embedding build tooling; the
    // standalone binary understands the structural script surface.
    let registry = TaskRegistry::new();
    let mut interpreter = GraphScriptInterpreter::new(&registry);
    for assignment in &cli.set {
        match assignment.split_once('=') {
            Some((name, value)) => interpreter.set_option(name, value),
            None => bail!("--set expects NAME=VALUE, got '{assignment}'"),
        }
    }
    interpreter
        .load(&cli.script)
        .with_context(|| format!("failed to load {}", cli.script.display()))
}

fn resolve_nodes(graph: &Graph, names: &[String]) -> anyhow::Result<BTreeSet<NodeId>> {
    let mut nodes = BTreeSet::new();
    for name in names {
        match graph.find_node(name) {
            Some(id) => {
                nodes.insert(id);
            }
            None => bail!("unknown node '{name}'"),
        }
    }
    Ok(nodes)
}

fn resolve_trigger(graph: &Graph, name: Option<&str>) -> anyhow::Result<Option<TriggerId>> {
    match name {
        None => Ok(None),
        Some(name) => match graph.find_trigger(name) {
            Some(id) => Ok(Some(id)),
            None => bail!("unknown trigger '{name}'"),
        },
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut graph = load_graph(&cli)?;

    if !cli.targets.is_empty() {
        let mut targets = BTreeSet::new();
        for name in &cli.targets {
            targets.extend(
                graph
                    .resolve_targets(name)
                    .with_context(|| format!("failed to resolve target '{name}'"))?,
            );
        }
        graph.select(&targets);
    }

    if !cli.skip_triggers.is_empty() {
        let mut skip = BTreeSet::new();
        for name in &cli.skip_triggers {
            match graph.find_trigger(name) {
                Some(id) => {
                    skip.insert(id);
                }
                None => bail!("unknown trigger '{name}'"),
            }
        }
        graph.skip_triggers(&skip);
    }

    graph.emit_diagnostics();

    let completed = resolve_nodes(&graph, &cli.completed)?;
    let trigger = resolve_trigger(&graph, cli.trigger.as_deref())?;

    if let Some(path) = &cli.export {
        graph
            .export_to_file(path, &completed, trigger)
            .with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!("wrote execution plan to {}", path.display());
    }

    if let Some(path) = &cli.preprocess {
        let mut file = std::fs::File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        graph.write_preprocessed(&mut file)?;
        tracing::info!("wrote preprocessed graph to {}", path.display());
    }

    if cli.list || (cli.export.is_none() && cli.preprocess.is_none()) {
        let stdout = std::io::stdout();
        graph.print(&mut stdout.lock(), &completed)?;
    }

    Ok(())
}
