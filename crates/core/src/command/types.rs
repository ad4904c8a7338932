//! Command data types
//!
//! The structured form of a command string: a set of parameters (subqueries
//! evaluated before the command runs) and an ordered list of subcommands,
//! each addressing either the host system or another LIMAR module.

use serde_json::Value;
use std::collections::BTreeSet;

/// A parameterised LIMAR call appearing inside a subcommand body as
/// `{{ module.method(args) : jq }}` or `{{ module.method(args) :: pq }}`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Subquery {
    pub module: String,
    pub method: String,
    pub args: Vec<String>,
    pub jq_transform: Option<String>,
    pub pq_transform: Option<String>,
}

/// One piece of an interpolatable: literal text or a parameter reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Fragment(String),
    Parameter(Subquery),
}

/// Text with embedded parameter references
pub type Interpolatable = Vec<Part>;

/// An interpolatable split into argv-like groups
pub type GroupedInterpolatable = Vec<Interpolatable>;

/// A call to another LIMAR module: `module.method(args) : jq` / `:: pq`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimarCall {
    pub module: String,
    pub method: String,
    pub args: GroupedInterpolatable,
    pub jq_transform: Option<String>,
    pub pq_transform: Option<String>,
}

/// The body of a subcommand
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubcommandData {
    /// argv for a host process
    System(GroupedInterpolatable),
    /// a call into another LIMAR module
    Limar(LimarCall),
}

/// A single shell or LIMAR call; subcommands compose a command with `&&`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subcommand {
    pub allowed_to_fail: bool,
    pub parameters: BTreeSet<Subquery>,
    pub data: SubcommandData,
}

/// The parse-only view of a command: its parameters and subcommands
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandSpec {
    pub parameters: BTreeSet<Subquery>,
    pub subcommands: Vec<Subcommand>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    Query,
    Action,
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandType::Query => write!(f, "query"),
            CommandType::Action => write!(f, "action"),
        }
    }
}

/// The full `command` record carried by a command item
///
/// The type is set by the `query`/`action` context modules after the
/// `command` context module attaches the parsed spec; topology metadata is
/// filled in at exit-manifest once every command is known.
#[derive(Debug, Clone, Default)]
pub struct CommandRecord {
    pub command_type: Option<CommandType>,
    pub spec: CommandSpec,
    /// Query-language expression applied to the aggregated subcommand stdout
    pub parse: Option<String>,
    pub dependencies: Vec<String>,
    pub dependants: Vec<String>,
    pub transitive_dependencies: Vec<String>,
    pub transitive_dependants: Vec<String>,
}

/// The outcome of one subcommand
#[derive(Debug, Clone)]
pub struct SubcommandResult {
    pub status: i32,
    pub stdout: Value,
    pub stderr: String,
}

impl SubcommandResult {
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "status": self.status,
            "stdout": self.stdout,
            "stderr": self.stderr,
        })
    }
}

/// A dictionary produced by a query, indexable by its subject id(s)
pub type Entity = Value;
