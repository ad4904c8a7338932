//! Manifest syntax tree
//!
//! The parsed form of a manifest document: a sequence of item declarations,
//! item-set declarations, and contexts, nesting under contexts. `Display`
//! reconstructs legal manifest text, so `format(parse(doc))` re-parses to an
//! equivalent structure.

use std::fmt;

/// A `name` or `name: value` pair, used for both tags and context options
pub type KvPair = (String, Option<String>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Item {
        ref_name: String,
        tags: Vec<KvPair>,
    },
    ItemSet {
        ref_name: String,
        expr: SetExpr,
    },
    Context {
        context_type: String,
        opts: Vec<KvPair>,
        body: Vec<Node>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetExpr {
    /// An item-set name: an identifier or a tag (a tag's value, if any, is
    /// dropped; the operand is the tag-named implicit set either way)
    Operand(String),
    Op {
        op: SetOp,
        left: Box<SetExpr>,
        right: Box<SetExpr>,
    },
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for node in &self.nodes {
            write_node(f, node, 0)?;
        }
        Ok(())
    }
}

impl fmt::Display for SetOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetOp::And => write!(f, "&"),
            SetOp::Or => write!(f, "|"),
        }
    }
}

impl fmt::Display for SetExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetExpr::Operand(name) => write!(f, "{name}"),
            SetExpr::Op { op, left, right } => {
                write_operand(f, left)?;
                write!(f, " {op} ")?;
                write_operand(f, right)
            }
        }
    }
}

fn write_operand(f: &mut fmt::Formatter<'_>, expr: &SetExpr) -> fmt::Result {
    match expr {
        SetExpr::Operand(_) => write!(f, "{expr}"),
        SetExpr::Op { .. } => write!(f, "({expr})"),
    }
}

fn write_node(f: &mut fmt::Formatter<'_>, node: &Node, depth: usize) -> fmt::Result {
    let indent = "  ".repeat(depth);
    match node {
        Node::Item { ref_name, tags } => {
            write!(f, "{indent}{ref_name}")?;
            if !tags.is_empty() {
                write!(f, " ({})", format_kv_pairs(tags))?;
            }
            writeln!(f)
        }
        Node::ItemSet { ref_name, expr } => {
            writeln!(f, "{indent}{ref_name} = {expr}")
        }
        Node::Context {
            context_type,
            opts,
            body,
        } => {
            write!(f, "{indent}@{context_type}")?;
            if !opts.is_empty() {
                write!(f, " ({})", format_kv_pairs(opts))?;
            }
            writeln!(f, " {{")?;
            for child in body {
                write_node(f, child, depth + 1)?;
            }
            writeln!(f, "{indent}}}")
        }
    }
}

fn format_kv_pairs(pairs: &[KvPair]) -> String {
    pairs
        .iter()
        .map(|(name, value)| match value {
            Some(value) if needs_quoting(value) => {
                let quote = if value.contains('"') { '\'' } else { '"' };
                format!("{name}: {quote}{value}{quote}")
            }
            Some(value) => format!("{name}: {value}"),
            None => name.clone(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn needs_quoting(value: &str) -> bool {
    value.is_empty() || value.contains([',', ')', '(', '\n', '"', '\''])
}
