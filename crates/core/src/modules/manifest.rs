//! Manifest module
//!
//! Parses the manifest file and provides the item and item-set tables to
//! the rest of the application. Other modules extend the manifest format by
//! registering context-handler factories during their configuration phase;
//! the parse happens once, at start.

use crate::context::{ContextHandler, ContextModuleSet};
use crate::envparse::EnvParser;
use crate::errors::{LimarError, Result};
use crate::manifest::ast::SetExpr;
use crate::manifest::item::ItemSet;
use crate::manifest::walker::eval_set_expr;
use crate::manifest::{parser, Walker};
use crate::orchestrator::{Invocation, Module, ModuleContext};
use clap::{Arg, ArgAction, Command};
use indexmap::IndexMap;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::any::Any;
use tracing::{debug, instrument};

const ENV_PATH: &str = "LIMAR_MANIFEST_PATH";
const ENV_DEFAULT_ITEM_SET: &str = "LIMAR_MANIFEST_DEFAULT_ITEM_SET";

#[derive(Default)]
pub struct ManifestModule {
    context_modules: ContextModuleSet,
    manifest_path: Option<String>,
    default_item_set: Option<String>,
    digest: Option<String>,
    items: Option<ItemSet>,
    item_sets: IndexMap<String, ItemSet>,
}

impl ManifestModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow other modules to extend the manifest format with new contexts
    ///
    /// Registration is only useful before the manifest is parsed at start;
    /// late registration is a programming error and fails loudly.
    pub fn add_context_module<F>(&mut self, factory: F) -> Result<()>
    where
        F: Fn() -> Box<dyn ContextHandler> + 'static,
    {
        if self.items.is_some() {
            return Err(LimarError::registration(
                "Attempted registration of a context module after the manifest has been parsed"
                    .to_string(),
            ));
        }
        self.context_modules.add(factory);
        Ok(())
    }

    // Typed access for the command engine
    // --------------------

    fn items(&self) -> Result<&ItemSet> {
        self.items
            .as_ref()
            .ok_or_else(|| LimarError::internal("manifest accessed before it was parsed"))
    }

    /// All items with the given refs; unknown refs fail
    pub fn get_items(&self, refs: &[String]) -> Result<ItemSet> {
        let items = self.items()?;
        let mut result = ItemSet::new();
        for ref_name in refs {
            let item = items.get(ref_name).ok_or_else(|| {
                LimarError::manifest(format!("Item not found: '{ref_name}'"))
            })?;
            result.insert(ref_name.clone(), item.clone());
        }
        Ok(result)
    }

    /// The item-set whose name matches the given regex pattern
    ///
    /// With no pattern: the default item-set from the environment, or the
    /// full item table.
    pub fn get_item_set(&self, pattern: Option<&str>) -> Result<ItemSet> {
        let items = self.items()?;

        let Some(pattern) = pattern.or(self.default_item_set.as_deref()) else {
            return Ok(items.clone());
        };

        let matcher = Regex::new(pattern).map_err(|e| {
            LimarError::config(format!("Invalid item-set pattern '{pattern}': {e}"))
        })?;
        self.item_sets
            .iter()
            .find(|(name, _)| matcher.is_match(name))
            .map(|(_, set)| set.clone())
            .ok_or_else(|| {
                LimarError::manifest(format!("Item set not found from pattern '{pattern}'"))
            })
    }

    /// The first item whose ref matches the given regex pattern
    pub fn get_item(&self, pattern: &str, item_set_pattern: Option<&str>) -> Result<Value> {
        let item_set = self.get_item_set(item_set_pattern)?;

        let matcher = Regex::new(pattern).map_err(|e| {
            LimarError::config(format!("Invalid item pattern '{pattern}': {e}"))
        })?;
        item_set
            .values()
            .find(|item| matcher.is_match(&item.borrow().item_ref))
            .map(|item| item.borrow().to_value())
            .ok_or_else(|| {
                LimarError::manifest(format!("Item not found from pattern '{pattern}'"))
            })
    }

    /// Declare a new named item-set from an expression over existing sets
    pub fn declare_item_set(&mut self, ref_name: &str, expr: &str) -> Result<ItemSet> {
        let expr: SetExpr = parser::parse_expr(expr)?;
        let item_set = eval_set_expr(&expr, &self.item_sets);
        self.item_sets
            .insert(ref_name.to_string(), item_set.clone());
        Ok(item_set)
    }

    /// A digest of the manifest source text
    pub fn get_manifest_digest(&self) -> Result<&str> {
        self.digest
            .as_deref()
            .ok_or_else(|| LimarError::internal("manifest accessed before it was parsed"))
    }

    // Formatting
    // --------------------

    fn format_item(value: &Value) -> String {
        let Some(map) = value.as_object() else {
            return value.to_string();
        };

        let mut lines = Vec::new();
        if let Some(ref_name) = map.get("ref").and_then(Value::as_str) {
            lines.push(format!("ref: {ref_name}"));
        }
        if let Some(tags) = map.get("tags").and_then(Value::as_object) {
            let names: Vec<&str> = tags.keys().map(String::as_str).collect();
            lines.push(format!("tags: {}", names.join(", ")));
        }
        for (key, field) in map {
            if key == "ref" || key == "tags" {
                continue;
            }
            match field {
                Value::String(text) => lines.push(format!("{key}: {text}")),
                other => lines.push(format!("{key}: {other}")),
            }
        }
        lines.join("\n")
    }
}

impl Module for ManifestModule {
    fn name(&self) -> &'static str {
        "manifest"
    }

    fn configure_env(&mut self, parser: &mut EnvParser) -> Result<()> {
        parser.add_variable("path")?;
        parser.add_optional_variable("default-item-set")
    }

    fn configure_args(&mut self, command: Command) -> Command {
        let property = Arg::new("property")
            .short('p')
            .long("property")
            .action(ArgAction::Append)
            .help("Include only the given properties in the output (repeatable)");

        command
            .about("Resolve items and item sets from the manifest")
            .subcommand(
                Command::new("item")
                    .about("Resolve a regex pattern to an item")
                    .arg(Arg::new("pattern").required(true))
                    .arg(
                        Arg::new("item-set")
                            .long("item-set")
                            .help("Pattern matching the item set to resolve within"),
                    )
                    .arg(property.clone()),
            )
            .subcommand(
                Command::new("item-set")
                    .about("Resolve a regex pattern to an item set")
                    .arg(Arg::new("pattern").required(true))
                    .arg(property),
            )
    }

    fn configure(&mut self, ctx: &ModuleContext) -> Result<()> {
        let env = ctx.env();
        self.manifest_path = Some(env.require(ENV_PATH)?.to_string());
        self.default_item_set = env.get(ENV_DEFAULT_ITEM_SET).map(str::to_string);
        Ok(())
    }

    #[instrument(skip_all)]
    fn start(&mut self, _ctx: &ModuleContext) -> Result<()> {
        let path = self
            .manifest_path
            .clone()
            .ok_or_else(|| LimarError::internal("manifest path not configured"))?;

        let source = std::fs::read_to_string(&path).map_err(|e| {
            LimarError::config(format!("Cannot read manifest file '{path}': {e}"))
        })?;
        self.digest = Some(format!("{:x}", Sha256::digest(source.as_bytes())));

        let document = parser::parse(&source)?;
        let walker = Walker::new(self.context_modules.instantiate());
        let output = walker.walk(&document)?;

        debug!(
            items = output.items.len(),
            item_sets = output.item_sets.len(),
            "manifest parsed"
        );
        self.items = Some(output.items);
        self.item_sets = output.item_sets;
        Ok(())
    }

    fn run(&mut self, _ctx: &ModuleContext, invocation: &Invocation) -> Result<Value> {
        let filtered = |value: Value, matches: &clap::ArgMatches| -> Value {
            let Some(properties) = matches.get_many::<String>("property") else {
                return value;
            };
            let properties: Vec<&String> = properties.collect();
            match value {
                Value::Object(map) => Value::Object(
                    map.into_iter()
                        .filter(|(key, _)| properties.iter().any(|p| *p == key))
                        .collect(),
                ),
                other => other,
            }
        };

        // Forwarded output stays structured; terminal output is rendered
        match invocation.args.subcommand() {
            Some(("item", matches)) => {
                let pattern = matches
                    .get_one::<String>("pattern")
                    .ok_or_else(|| LimarError::config("Missing item pattern".to_string()))?;
                let item = self.get_item(
                    pattern,
                    matches.get_one::<String>("item-set").map(String::as_str),
                )?;
                let item = filtered(item, matches);

                if invocation.output_is_forward {
                    Ok(item)
                } else {
                    Ok(Value::String(Self::format_item(&item)))
                }
            }
            Some(("item-set", matches)) => {
                let pattern = matches
                    .get_one::<String>("pattern")
                    .ok_or_else(|| LimarError::config("Missing item-set pattern".to_string()))?;
                let item_set = self.get_item_set(Some(pattern))?;

                let mut output = serde_json::Map::new();
                let mut rendered = Vec::new();
                for (ref_name, item) in &item_set {
                    let value = filtered(item.borrow().to_value(), matches);
                    rendered.push(Self::format_item(&value));
                    output.insert(ref_name.clone(), value);
                }

                if invocation.output_is_forward {
                    Ok(Value::Object(output))
                } else {
                    Ok(Value::String(rendered.join("\n\n")))
                }
            }
            _ => Err(LimarError::config(
                "manifest: expected one of item, item-set".to_string(),
            )),
        }
    }

    fn call_service(
        &mut self,
        _ctx: &ModuleContext,
        method: &str,
        args: &[Value],
    ) -> Result<Value> {
        let string_arg = |index: usize| -> Result<&str> {
            args.get(index).and_then(Value::as_str).ok_or_else(|| {
                LimarError::config(format!(
                    "manifest.{method} needs a string argument {index}"
                ))
            })
        };

        match method {
            "get_item" => self.get_item(string_arg(0)?, None),
            "get_item_set" => {
                let item_set = self.get_item_set(args.first().and_then(Value::as_str))?;
                let map: serde_json::Map<String, Value> = item_set
                    .iter()
                    .map(|(ref_name, item)| (ref_name.clone(), item.borrow().to_value()))
                    .collect();
                Ok(Value::Object(map))
            }
            "get_manifest_digest" => Ok(Value::String(self.get_manifest_digest()?.to_string())),
            other => Err(LimarError::command_run(format!(
                "Module 'manifest' has no service method '{other}'"
            ))),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn parsed_module(manifest: &str) -> Result<ManifestModule> {
        let mut file = NamedTempFile::new().expect("temp manifest");
        file.write_all(manifest.as_bytes()).expect("write manifest");

        let mut module = ManifestModule::new();
        module.manifest_path = Some(file.path().to_string_lossy().to_string());
        module.start(&crate::orchestrator::ModuleContext::default())?;
        Ok(module)
    }

    #[test]
    fn test_tables_available_after_start() -> anyhow::Result<()> {
        let module = parsed_module("a (x, y)\nb (y)\ns = x & y\n")?;

        assert_eq!(module.items()?.len(), 2);
        assert_eq!(module.get_item_set(Some("^s$"))?.len(), 1);
        assert!(module.get_manifest_digest()?.len() == 64);
        Ok(())
    }

    #[test]
    fn test_get_item_by_pattern() -> anyhow::Result<()> {
        let module = parsed_module("dir/proj-one (project)\ndir/proj-two (project)\n")?;

        let item = module.get_item("one", None)?;
        assert_eq!(item["ref"], "dir/proj-one");

        assert!(module.get_item("missing", None).is_err());
        Ok(())
    }

    #[test]
    fn test_declare_item_set_post_parse() -> anyhow::Result<()> {
        let mut module = parsed_module("a (x, y)\nb (y)\n")?;

        let set = module.declare_item_set("picked", "x & y")?;
        assert_eq!(set.len(), 1);
        assert!(module.get_item_set(Some("^picked$"))?.contains_key("a"));
        Ok(())
    }

    #[test]
    fn test_late_context_module_registration_fails() -> anyhow::Result<()> {
        let mut module = parsed_module("a\n")?;
        let result =
            module.add_context_module(|| Box::new(crate::context::tags::Tags) as _);
        assert!(result.is_err());
        Ok(())
    }
}
