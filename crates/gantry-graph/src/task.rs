//! Task contract: the boundary between the graph core and concrete task
//! implementations.
//!
//! Task binding is an explicit, closed registry mapping an element name to a
//! descriptor (typed parameter list plus a construction function). The core
//! validates parameters against the descriptor and queries constructed tasks
//! for the tags they consume and produce; it never executes them.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use gantry_types::{GantryError, Result, SourceLocation};

// ---------------------------------------------------------------------------
// Parameter descriptors
// ---------------------------------------------------------------------------

/// Validation applied to a task parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// A single plain name.
    Name,
    /// A semicolon-separated list of plain names.
    NameList,
    /// A single `#`-prefixed tag.
    Tag,
    /// A semicolon-separated list of `#`-prefixed tags.
    TagList,
    /// Free-form text.
    Text,
    /// `true` or `false` (case-insensitive).
    Bool,
    /// A decimal integer.
    Int,
}

#[derive(Debug, Clone)]
pub struct TaskParameter {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
}

impl TaskParameter {
    pub fn required(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub fn optional(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

fn is_plain_name(value: &str) -> bool {
    !value.is_empty() && !value.starts_with('#') && !value.contains(';')
}

fn is_tag_name(value: &str) -> bool {
    value.len() > 1 && value.starts_with('#') && !value.contains(';')
}

/// Check a single value against a parameter kind.
pub fn validate_value(kind: ParamKind, value: &str) -> std::result::Result<(), String> {
    match kind {
        ParamKind::Text => Ok(()),
        ParamKind::Name => {
            if is_plain_name(value.trim()) {
                Ok(())
            } else {
                Err(format!("'{value}' is not a valid name"))
            }
        }
        ParamKind::NameList => {
            for item in value.split(';').filter(|s| !s.trim().is_empty()) {
                if !is_plain_name(item.trim()) {
                    return Err(format!("'{item}' is not a valid name"));
                }
            }
            Ok(())
        }
        ParamKind::Tag => {
            if is_tag_name(value.trim()) {
                Ok(())
            } else {
                Err(format!("'{value}' is not a valid tag (expected '#Name')"))
            }
        }
        ParamKind::TagList => {
            for item in value.split(';').filter(|s| !s.trim().is_empty()) {
                if !is_tag_name(item.trim()) {
                    return Err(format!("'{item}' is not a valid tag (expected '#Name')"));
                }
            }
            Ok(())
        }
        ParamKind::Bool => {
            if value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("false") {
                Ok(())
            } else {
                Err(format!("'{value}' is not a boolean"))
            }
        }
        ParamKind::Int => {
            if value.trim().parse::<i64>().is_ok() {
                Ok(())
            } else {
                Err(format!("'{value}' is not an integer"))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// TaskArgs — validated attribute values handed to a constructor
// ---------------------------------------------------------------------------

/// Property-expanded, descriptor-validated attribute values for one task
/// element.
#[derive(Debug, Clone)]
pub struct TaskArgs {
    values: HashMap<String, String>,
    pub location: SourceLocation,
}

impl TaskArgs {
    pub fn new(values: HashMap<String, String>, location: SourceLocation) -> Self {
        Self { values, location }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }

    pub fn get_or(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or(default).to_string()
    }

    pub fn require(&self, name: &str) -> Result<String> {
        self.get(name).map(String::from).ok_or_else(|| {
            GantryError::Validation(format!("missing required parameter '{name}'"))
        })
    }

    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        self.get(name)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(default)
    }

    /// Split a semicolon-list parameter, dropping empty entries.
    pub fn get_list(&self, name: &str) -> Vec<String> {
        self.get(name)
            .map(|v| {
                v.split(';')
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Task trait and execution context
// ---------------------------------------------------------------------------

/// Mutable state handed to a task when it executes on an agent.
pub struct JobContext {
    /// Working directory for the node's build.
    pub working_dir: PathBuf,
    /// File set accumulated into the node's default output.
    pub default_output: BTreeSet<PathBuf>,
    /// File sets for every declared input and output tag of the node.
    pub tag_to_files: HashMap<String, BTreeSet<PathBuf>>,
}

impl JobContext {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            default_output: BTreeSet::new(),
            tag_to_files: HashMap::new(),
        }
    }
}

/// A constructed task instance inside a node's task list.
pub trait Task {
    /// The registered element name this task was constructed from.
    fn name(&self) -> &str;

    /// Attribute name/value pairs for re-serialization.
    fn parameters(&self) -> Vec<(String, String)>;

    /// Tags this task reads files from.
    fn consumed_tags(&self) -> Vec<String> {
        Vec::new()
    }

    /// Tags this task writes files into.
    fn produced_tags(&self) -> Vec<String> {
        Vec::new()
    }

    /// Run the task. Errors propagate upward with context attached by the
    /// driver; the core performs no retries.
    fn execute(&self, ctx: &mut JobContext) -> Result<()>;

    /// Tasks returning the same key may be absorbed into one shared batch by
    /// the execution driver.
    fn batch_key(&self) -> Option<String> {
        None
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type TaskConstructor = fn(&TaskArgs) -> Result<Box<dyn Task>>;

/// Descriptor for one registered task type.
pub struct TaskDescriptor {
    pub name: &'static str,
    pub parameters: Vec<TaskParameter>,
    pub construct: TaskConstructor,
}

/// Closed mapping from element name to task descriptor. Lookup is
/// case-insensitive.
#[derive(Default)]
pub struct TaskRegistry {
    descriptors: HashMap<String, TaskDescriptor>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: TaskDescriptor) {
        self.descriptors
            .insert(descriptor.name.to_ascii_lowercase(), descriptor);
    }

    pub fn get(&self, name: &str) -> Option<&TaskDescriptor> {
        self.descriptors.get(&name.to_ascii_lowercase())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.descriptors.values().map(|d| d.name).collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Cache / temp-storage contract
// ---------------------------------------------------------------------------

/// Boundary to the distributed artifact cache shared between agents. The core
/// only defines the contract; implementations live with the execution driver.
pub trait TempStorage {
    /// Archive the file set of `(node, output)` for retrieval on other agents.
    fn archive_output(
        &self,
        node_name: &str,
        output_name: &str,
        files: &BTreeSet<PathBuf>,
    ) -> Result<()>;

    /// Retrieve and integrity-check a previously archived output.
    fn retrieve_output(&self, node_name: &str, output_name: &str) -> Result<BTreeSet<PathBuf>>;

    /// Mark a node as having completed successfully.
    fn mark_complete(&self, node_name: &str) -> Result<()>;

    /// Query whether a node has completed.
    fn is_complete(&self, node_name: &str) -> Result<bool>;

    /// List the manifest of tag names to file sets recorded for a node.
    fn read_manifest(&self, node_name: &str) -> Result<HashMap<String, BTreeSet<PathBuf>>>;
}
