//! Command transformer
//!
//! Parses raw command strings from the manifest into structured,
//! interpolatable subcommand data, and formats that data back into a
//! human-readable string. A command string is a `&&`-separated list of
//! subcommands; each subcommand may be marked allowed-to-fail (`!`) and/or
//! as a LIMAR call (`-`), and may embed parameter references of the form
//! `{{ module.method(args) : jq }}` (or `:: pq`).

use crate::command::types::{
    CommandSpec, Entity, GroupedInterpolatable, Interpolatable, LimarCall, Part, Subcommand,
    SubcommandData, Subquery,
};
use crate::errors::{LimarError, Result};
use crate::manifest::item::ItemSet;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use tracing::warn;

static SUBCOMMAND_SPLIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \n]&&[ \n]").expect("subcommand split regex is valid"));

static PARAMETER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\{\{ (?P<module>[a-z0-9-]*)\.(?P<method>[a-z0-9_]*)\((?P<args>.*?)\) (?::: (?P<pq>.*?)|: (?P<jq>.*?)) \}\}",
    )
    .expect("parameter regex is valid")
});

static LIMAR_CALL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<module>[a-z0-9-]*)\.(?P<method>[a-z0-9_]*)\((?P<args>.*)\) (?::: (?P<pq>.*)|: (?P<jq>.*))$",
    )
    .expect("limar call regex is valid")
});

/// How a grouped interpolatable's fragments are split into groups
#[derive(Clone, Copy)]
enum GroupDelimiter {
    /// Runs of unquoted whitespace; single/double quotes group verbatim text
    QuotedWhitespace,
    /// The literal `", "` argument separator
    CommaSpace,
}

// Parsing
// --------------------

/// Parse a raw command string into its parameters and subcommands
pub fn parse(raw_command: &str) -> Result<CommandSpec> {
    let mut subcommands = Vec::new();

    for raw_subcommand in SUBCOMMAND_SPLIT.split(raw_command) {
        let mut body = raw_subcommand.trim();
        let mut allowed_to_fail = false;
        let mut is_limar = false;

        if let Some(rest) = body.strip_prefix('!') {
            allowed_to_fail = true;
            body = rest;
        }
        if let Some(rest) = body.strip_prefix('-') {
            is_limar = true;
            body = rest;
        }
        body = body.strip_prefix(' ').unwrap_or(body);

        let subcommand = if is_limar {
            parse_limar_subcommand(body, allowed_to_fail)?
        } else {
            parse_system_subcommand(body, allowed_to_fail)
        };
        subcommands.push(subcommand);
    }

    let parameters: BTreeSet<Subquery> = subcommands
        .iter()
        .flat_map(|subcommand| subcommand.parameters.iter().cloned())
        .collect();

    Ok(CommandSpec {
        parameters,
        subcommands,
    })
}

fn parse_system_subcommand(body: &str, allowed_to_fail: bool) -> Subcommand {
    let (fragments, params) = split_fragments_params(body);
    let grouped = group_fragments_params(&fragments, &params, GroupDelimiter::QuotedWhitespace);

    Subcommand {
        allowed_to_fail,
        parameters: params.into_iter().collect(),
        data: SubcommandData::System(grouped),
    }
}

fn parse_limar_subcommand(body: &str, allowed_to_fail: bool) -> Result<Subcommand> {
    let captures = LIMAR_CALL.captures(body).ok_or_else(|| {
        LimarError::command_parse(format!("Failed to parse limar subcommand '{body}'"))
    })?;

    let (fragments, params) = split_fragments_params(&captures["args"]);
    let grouped = group_fragments_params(&fragments, &params, GroupDelimiter::CommaSpace);

    Ok(Subcommand {
        allowed_to_fail,
        parameters: params.into_iter().collect(),
        data: SubcommandData::Limar(LimarCall {
            module: captures["module"].to_string(),
            method: captures["method"].to_string(),
            args: grouped,
            jq_transform: captures.name("jq").map(|m| m.as_str().to_string()),
            pq_transform: captures.name("pq").map(|m| m.as_str().to_string()),
        }),
    })
}

/// Split a string into the literal fragments around its parameter references
/// and the parsed parameters between them (always one more fragment than
/// parameters).
fn split_fragments_params(string: &str) -> (Vec<String>, Vec<Subquery>) {
    let fragments = PARAMETER.split(string).map(str::to_string).collect();
    let params = PARAMETER
        .captures_iter(string)
        .map(|captures| Subquery {
            module: captures["module"].to_string(),
            method: captures["method"].to_string(),
            args: split_subquery_args(&captures["args"]),
            jq_transform: captures.name("jq").map(|m| m.as_str().to_string()),
            pq_transform: captures.name("pq").map(|m| m.as_str().to_string()),
        })
        .collect();
    (fragments, params)
}

fn split_subquery_args(args: &str) -> Vec<String> {
    if args.is_empty() {
        Vec::new()
    } else {
        args.split(", ").map(str::to_string).collect()
    }
}

/// Re-interleave fragments and parameters, then group on the delimiter
///
/// Quote state (for the whitespace delimiter) persists across parameter
/// boundaries, so a parameter inside a quoted span stays in its group. The
/// quote characters themselves are dropped. Empty groups are discarded.
fn group_fragments_params(
    fragments: &[String],
    params: &[Subquery],
    delimiter: GroupDelimiter,
) -> GroupedInterpolatable {
    let mut groups: GroupedInterpolatable = Vec::new();
    let mut current: Interpolatable = Vec::new();
    let mut buf = String::new();
    let mut open_quote: Option<char> = None;

    let flush_fragment = |current: &mut Interpolatable, buf: &mut String| {
        if !buf.is_empty() {
            current.push(Part::Fragment(std::mem::take(buf)));
        }
    };
    let close_group =
        |groups: &mut GroupedInterpolatable, current: &mut Interpolatable| {
            if !current.is_empty() {
                groups.push(std::mem::take(current));
            }
        };

    for (index, fragment) in fragments.iter().enumerate() {
        let mut chars = fragment.char_indices().peekable();
        while let Some((pos, ch)) = chars.next() {
            if let Some(quote) = open_quote {
                if ch == quote {
                    open_quote = None;
                } else {
                    buf.push(ch);
                }
                continue;
            }

            match delimiter {
                GroupDelimiter::QuotedWhitespace => match ch {
                    '"' | '\'' => open_quote = Some(ch),
                    ' ' | '\t' | '\n' => {
                        flush_fragment(&mut current, &mut buf);
                        close_group(&mut groups, &mut current);
                    }
                    _ => buf.push(ch),
                },
                GroupDelimiter::CommaSpace => {
                    if ch == ',' && fragment[pos..].starts_with(", ") {
                        flush_fragment(&mut current, &mut buf);
                        close_group(&mut groups, &mut current);
                        chars.next(); // consume the space
                    } else {
                        buf.push(ch);
                    }
                }
            }
        }

        if let Some(param) = params.get(index) {
            flush_fragment(&mut current, &mut buf);
            current.push(Part::Parameter(param.clone()));
        }
    }

    flush_fragment(&mut current, &mut buf);
    close_group(&mut groups, &mut current);
    groups
}

// Interpolation
// --------------------

/// Substitute evaluated parameter values into an interpolatable
pub fn interpolate(
    interpolatable: &Interpolatable,
    data: &HashMap<Subquery, String>,
) -> Result<String> {
    let mut out = String::new();
    for part in interpolatable {
        match part {
            Part::Fragment(text) => out.push_str(text),
            Part::Parameter(subquery) => {
                let value = data.get(subquery).ok_or_else(|| {
                    LimarError::command_run(format!(
                        "No evaluated value for parameter '{{{{ {} }}}}'",
                        format_subquery(subquery)
                    ))
                })?;
                out.push_str(value);
            }
        }
    }
    Ok(out)
}

/// Substitute parameter values into every group of a grouped interpolatable
pub fn interpolate_grouped(
    grouped: &GroupedInterpolatable,
    data: &HashMap<Subquery, String>,
) -> Result<Vec<String>> {
    grouped.iter().map(|group| interpolate(group, data)).collect()
}

// Checks
// --------------------

/// Whether an item carries a runnable command (a command with a type)
pub fn is_runnable(item: &crate::manifest::item::Item) -> bool {
    item.command
        .as_ref()
        .is_some_and(|command| command.command_type.is_some())
}

/// The subset of the given subject declared by at least one command item
pub fn subject_of(command_items: &ItemSet, subject: &[String]) -> Vec<String> {
    let mut all_subjects: BTreeSet<String> = BTreeSet::new();
    for item in command_items.values() {
        if let Some(subjects) = &item.borrow().subjects {
            all_subjects.extend(subjects.iter().cloned());
        }
    }

    subject
        .iter()
        .filter(|s| all_subjects.contains(*s))
        .cloned()
        .collect()
}

/// The primary subject of the given command items, in declaration order
///
/// Items without an explicit primary subject contribute all of their
/// subjects.
pub fn primary_subject_of(command_items: &ItemSet) -> Vec<String> {
    let mut primary: IndexMap<String, ()> = IndexMap::new();
    for item in command_items.values() {
        let item = item.borrow();
        if let Some(subject) = &item.primary_subject {
            primary.insert(subject.clone(), ());
        } else if let Some(subjects) = &item.subjects {
            for subject in subjects {
                primary.insert(subject.clone(), ());
            }
        }
    }
    primary.into_keys().collect()
}

// Entities
// --------------------

/// An entity's grouping key: one id value per subject element
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKey {
    Single(String),
    Composite(Vec<String>),
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKey::Single(id) => write!(f, "{id}"),
            EntityKey::Composite(ids) => write!(f, "{}", ids.join("/")),
        }
    }
}

/// Group entities by the id field(s) of the subject and deep-merge partial
/// entities sharing a key
///
/// The id field of each subject element is the `id` of its subject item.
/// Entities missing an id field are dropped with a warning.
pub fn merge_entities(
    subject_items: &ItemSet,
    outputs: &[Entity],
    subject: &[String],
) -> Result<IndexMap<EntityKey, Entity>> {
    let id_fields: Vec<String> = subject
        .iter()
        .map(|name| {
            let item = subject_items.get(name).ok_or_else(|| {
                LimarError::batch(format!("Unknown subject '{name}' while merging entities"))
            })?;
            item.borrow().id.clone().ok_or_else(|| {
                LimarError::batch(format!("Subject '{name}' has no id to merge entities by"))
            })
        })
        .collect::<Result<_>>()?;

    let mut merged: IndexMap<EntityKey, Entity> = IndexMap::new();
    for entity in outputs {
        let ids: Option<Vec<String>> = id_fields
            .iter()
            .map(|field| {
                entity
                    .get(field)
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .collect();

        let Some(ids) = ids else {
            warn!(entity = %entity, "entity missing an id field, dropping");
            continue;
        };

        let key = if ids.len() == 1 {
            EntityKey::Single(ids.into_iter().next().expect("one id"))
        } else {
            EntityKey::Composite(ids)
        };

        match merged.get_mut(&key) {
            Some(existing) => deep_merge(existing, entity),
            None => {
                merged.insert(key, entity.clone());
            }
        }
    }

    Ok(merged)
}

/// Merge `incoming` into `target`: objects merge recursively, everything
/// else overwrites
fn deep_merge(target: &mut Value, incoming: &Value) {
    match (target, incoming) {
        (Value::Object(target), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match target.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, incoming) => *target = incoming.clone(),
    }
}

// Formatting
// --------------------

/// Reconstruct the human-readable form of a parsed command
pub fn format_text(command: &CommandSpec) -> String {
    command
        .subcommands
        .iter()
        .map(format_subcommand)
        .collect::<Vec<_>>()
        .join(" && ")
}

pub fn format_subcommand(subcommand: &Subcommand) -> String {
    let marker = match (&subcommand.data, subcommand.allowed_to_fail) {
        (SubcommandData::Limar(_), true) => "!- ",
        (SubcommandData::Limar(_), false) => "- ",
        (SubcommandData::System(_), true) => "! ",
        (SubcommandData::System(_), false) => "",
    };

    let body = match &subcommand.data {
        SubcommandData::System(grouped) => format_grouped(grouped, " "),
        SubcommandData::Limar(call) => format_limar_call(call),
    };

    format!("{marker}{body}")
}

pub fn format_limar_call(call: &LimarCall) -> String {
    format!(
        "{}.{}({}) {}",
        call.module,
        call.method,
        format_grouped(&call.args, ", "),
        format_transform(call.jq_transform.as_deref(), call.pq_transform.as_deref()),
    )
}

pub fn format_grouped(grouped: &GroupedInterpolatable, separator: &str) -> String {
    grouped
        .iter()
        .map(|group| format_interpolatable(group))
        .collect::<Vec<_>>()
        .join(separator)
}

pub fn format_interpolatable(interpolatable: &Interpolatable) -> String {
    interpolatable
        .iter()
        .map(|part| match part {
            Part::Fragment(text) => text.clone(),
            Part::Parameter(subquery) => format!("{{{{ {} }}}}", format_subquery(subquery)),
        })
        .collect()
}

pub fn format_subquery(subquery: &Subquery) -> String {
    format!(
        "{}.{}({}) {}",
        subquery.module,
        subquery.method,
        subquery.args.join(", "),
        format_transform(
            subquery.jq_transform.as_deref(),
            subquery.pq_transform.as_deref()
        ),
    )
}

fn format_transform(jq: Option<&str>, pq: Option<&str>) -> String {
    match (jq, pq) {
        (Some(jq), _) => format!(": {jq}"),
        (None, Some(pq)) => format!(":: {pq}"),
        (None, None) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::item::Item;
    use serde_json::json;

    fn fragment(text: &str) -> Part {
        Part::Fragment(text.to_string())
    }

    fn argv(subcommand: &Subcommand) -> Vec<String> {
        match &subcommand.data {
            SubcommandData::System(grouped) => {
                interpolate_grouped(grouped, &HashMap::new()).unwrap()
            }
            SubcommandData::Limar(_) => panic!("expected a system subcommand"),
        }
    }

    #[test]
    fn test_parse_plain_system_command() -> anyhow::Result<()> {
        let command = parse("git status --porcelain")?;

        assert_eq!(command.subcommands.len(), 1);
        assert!(command.parameters.is_empty());
        assert_eq!(
            argv(&command.subcommands[0]),
            vec!["git", "status", "--porcelain"]
        );
        Ok(())
    }

    #[test]
    fn test_parse_subcommand_chain_and_markers() -> anyhow::Result<()> {
        let command = parse("echo hi && ! rmdir /tmp/limar-x")?;

        assert_eq!(command.subcommands.len(), 2);
        assert!(!command.subcommands[0].allowed_to_fail);
        assert!(command.subcommands[1].allowed_to_fail);
        assert_eq!(argv(&command.subcommands[1]), vec!["rmdir", "/tmp/limar-x"]);
        Ok(())
    }

    #[test]
    fn test_quotes_group_whitespace() -> anyhow::Result<()> {
        let command = parse(r#"git commit -m "a few words" --amend"#)?;

        assert_eq!(
            argv(&command.subcommands[0]),
            vec!["git", "commit", "-m", "a few words", "--amend"]
        );
        Ok(())
    }

    #[test]
    fn test_parameters_extracted_and_positioned() -> anyhow::Result<()> {
        let command = parse("ls {{ env.get(PROJECT_DIR) : . }}/src")?;

        assert_eq!(command.parameters.len(), 1);
        let param = command.parameters.iter().next().unwrap();
        assert_eq!(param.module, "env");
        assert_eq!(param.method, "get");
        assert_eq!(param.args, vec!["PROJECT_DIR"]);
        assert_eq!(param.jq_transform.as_deref(), Some("."));
        assert_eq!(param.pq_transform, None);

        let SubcommandData::System(grouped) = &command.subcommands[0].data else {
            panic!("expected system subcommand");
        };
        assert_eq!(grouped.len(), 2);
        assert_eq!(
            grouped[1],
            vec![
                Part::Parameter(param.clone()),
                fragment("/src"),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_parameter_inside_quotes_stays_in_group() -> anyhow::Result<()> {
        let command = parse(r#"echo "prefix {{ env.get(X) : . }} suffix""#)?;

        let SubcommandData::System(grouped) = &command.subcommands[0].data else {
            panic!("expected system subcommand");
        };
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[1].len(), 3);
        assert_eq!(grouped[1][0], fragment("prefix "));
        assert!(matches!(grouped[1][1], Part::Parameter(_)));
        assert_eq!(grouped[1][2], fragment(" suffix"));
        Ok(())
    }

    #[test]
    fn test_multiple_parameters_in_one_subcommand() -> anyhow::Result<()> {
        let command = parse("cp {{ env.get(SRC) : . }} {{ env.get(DST) : . }}")?;

        assert_eq!(command.parameters.len(), 2);
        let SubcommandData::System(grouped) = &command.subcommands[0].data else {
            panic!("expected system subcommand");
        };
        assert_eq!(grouped.len(), 3);
        Ok(())
    }

    #[test]
    fn test_parse_limar_subcommand() -> anyhow::Result<()> {
        let command = parse("- manifest.get_item(proj, ref) :: $[0]")?;

        let SubcommandData::Limar(call) = &command.subcommands[0].data else {
            panic!("expected limar subcommand");
        };
        assert_eq!(call.module, "manifest");
        assert_eq!(call.method, "get_item");
        assert_eq!(call.args.len(), 2);
        assert_eq!(call.jq_transform, None);
        assert_eq!(call.pq_transform.as_deref(), Some("$[0]"));
        Ok(())
    }

    #[test]
    fn test_malformed_limar_subcommand_fails() {
        assert!(parse("- not-a-call").is_err());
    }

    #[test]
    fn test_interpolate_grouped() -> anyhow::Result<()> {
        let command = parse("ls {{ env.get(DIR) : . }}/src")?;
        let param = command.parameters.iter().next().unwrap().clone();

        let mut data = HashMap::new();
        data.insert(param, "/home/user".to_string());

        let SubcommandData::System(grouped) = &command.subcommands[0].data else {
            panic!("expected system subcommand");
        };
        assert_eq!(
            interpolate_grouped(grouped, &data)?,
            vec!["ls", "/home/user/src"]
        );
        Ok(())
    }

    #[test]
    fn test_interpolate_missing_parameter_fails() -> anyhow::Result<()> {
        let command = parse("ls {{ env.get(DIR) : . }}")?;
        let SubcommandData::System(grouped) = &command.subcommands[0].data else {
            panic!("expected system subcommand");
        };
        assert!(interpolate_grouped(grouped, &HashMap::new()).is_err());
        Ok(())
    }

    #[test]
    fn test_format_round_trips() -> anyhow::Result<()> {
        let originals = [
            "git status --porcelain",
            "echo hi && ! echo bye",
            "ls {{ env.get(DIR) : . }}/src",
            "- manifest.get_item(proj) : .ref && echo done",
            "!- cache.delete(key) : .",
        ];

        for original in originals {
            let parsed = parse(original)?;
            let formatted = format_text(&parsed);
            assert_eq!(parse(&formatted)?, parsed, "round trip of '{original}'");
        }
        Ok(())
    }

    #[test]
    fn test_merge_entities_single_subject() -> anyhow::Result<()> {
        let mut subject_items = ItemSet::new();
        let mut project = Item::new("project");
        project.id = Some("name".to_string());
        subject_items.insert("project".to_string(), project.shared());

        let outputs = vec![
            json!({"name": "limar", "lang": "rust"}),
            json!({"name": "limar", "meta": {"stars": 5}}),
            json!({"name": "other", "lang": "python"}),
            json!({"lang": "orphan"}),
        ];

        let merged = merge_entities(&subject_items, &outputs, &["project".to_string()])?;
        assert_eq!(merged.len(), 2);
        assert_eq!(
            merged[&EntityKey::Single("limar".into())],
            json!({"name": "limar", "lang": "rust", "meta": {"stars": 5}})
        );
        Ok(())
    }

    #[test]
    fn test_merge_entities_composite_subject() -> anyhow::Result<()> {
        let mut subject_items = ItemSet::new();
        let mut host = Item::new("host");
        host.id = Some("host".to_string());
        let mut service = Item::new("service");
        service.id = Some("service".to_string());
        subject_items.insert("host".to_string(), host.shared());
        subject_items.insert("service".to_string(), service.shared());

        let outputs = vec![
            json!({"host": "a", "service": "web", "port": 80}),
            json!({"host": "a", "service": "web", "state": "up"}),
        ];

        let subject = vec!["host".to_string(), "service".to_string()];
        let merged = merge_entities(&subject_items, &outputs, &subject)?;
        assert_eq!(merged.len(), 1);
        assert_eq!(
            merged[&EntityKey::Composite(vec!["a".into(), "web".into()])],
            json!({"host": "a", "service": "web", "port": 80, "state": "up"})
        );
        Ok(())
    }

    #[test]
    fn test_subject_helpers() {
        let mut command_items = ItemSet::new();

        let mut q1 = Item::new("q1");
        q1.subjects = Some(vec!["project".to_string(), "remote".to_string()]);
        q1.primary_subject = Some("project".to_string());
        command_items.insert("q1".to_string(), q1.shared());

        let mut q2 = Item::new("q2");
        q2.subjects = Some(vec!["account".to_string()]);
        command_items.insert("q2".to_string(), q2.shared());

        assert_eq!(
            subject_of(
                &command_items,
                &["account".to_string(), "unknown".to_string()]
            ),
            vec!["account".to_string()]
        );
        assert_eq!(
            primary_subject_of(&command_items),
            vec!["project".to_string(), "account".to_string()]
        );
    }
}
