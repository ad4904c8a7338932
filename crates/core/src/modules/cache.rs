//! Cache module
//!
//! Manages cached data in a persistent [`Store`]. Other modules use the
//! `get`/`set`/`delete` services; the CLI surface lists, shows, deletes,
//! and clears entries. Reading and writing can be disabled independently
//! from the command line.

use crate::envparse::EnvParser;
use crate::errors::{LimarError, Result};
use crate::orchestrator::{Invocation, Module, ModuleContext, StopOutcome};
use crate::store::Store;
use clap::{Arg, ArgAction, Command};
use regex::Regex;
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeSet;
use tracing::{debug, info};

const ENV_ROOT: &str = "LIMAR_CACHE_ROOT";
const DEFAULT_ROOT: &str = "/tmp/limar-cache";

#[derive(Default)]
pub struct CacheModule {
    store: Option<Store>,
    read_cache: bool,
    write_cache: bool,
}

impl CacheModule {
    pub fn new() -> Self {
        Self::default()
    }

    fn store_mut(&mut self) -> Result<&mut Store> {
        self.store
            .as_mut()
            .ok_or_else(|| LimarError::internal("cache store used before configuration"))
    }

    // Services (also usable with typed access)
    // --------------------

    pub fn get(&mut self, name: &str) -> Result<Value> {
        let read_cache = self.read_cache;
        let store = self.store_mut()?;

        if !read_cache && !store.has_buffered(name) {
            return Err(LimarError::StoreKeyNotFound {
                key: name.to_string(),
            });
        }
        store.get(name)
    }

    pub fn set(&mut self, name: &str, data: Value) -> Result<()> {
        self.store_mut()?.set(name, data);
        debug!(name, "cached entry (not yet persisted)");
        Ok(())
    }

    pub fn delete(&mut self, names: &[String]) -> Result<()> {
        let store = self.store_mut()?;
        for name in names {
            store.remove(name);
            debug!(name, "deleted cache entry (not yet persisted)");
        }
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<String>> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| LimarError::internal("cache store used before configuration"))?;
        Ok(store.list(self.read_cache))
    }

    pub fn delete_matching(&mut self, patterns: &[String]) -> Result<Vec<String>> {
        let entry_names = self.list()?;

        let mut matched: BTreeSet<String> = BTreeSet::new();
        for pattern in patterns {
            let matcher = Regex::new(pattern).map_err(|e| {
                LimarError::config(format!("Invalid cache entry pattern '{pattern}': {e}"))
            })?;
            for name in &entry_names {
                if matcher.is_match(name) {
                    matched.insert(name.clone());
                }
            }
        }

        let matched: Vec<String> = matched.into_iter().collect();
        self.delete(&matched)?;
        Ok(matched)
    }

    pub fn clear(&mut self) -> Result<()> {
        let names = self.list()?;
        self.delete(&names)?;
        info!("deleted all cache entries (not yet persisted)");
        Ok(())
    }

    pub fn persist(&mut self) -> Result<()> {
        if self.write_cache {
            self.store_mut()?.persist()?;
            debug!("persisted cache");
        } else {
            debug!("did not persist cache (writing to cache is disabled)");
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.write_cache {
            self.store_mut()?.flush()?;
            debug!("flushed cache");
        } else {
            debug!("did not flush cache (writing to cache is disabled)");
        }
        Ok(())
    }
}

impl Module for CacheModule {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn configure_env(&mut self, parser: &mut EnvParser) -> Result<()> {
        parser.add_variable_with_default("root", DEFAULT_ROOT)
    }

    fn configure_root_args(&mut self, command: Command) -> Command {
        command
            .arg(
                Arg::new("no-read-cache")
                    .long("no-read-cache")
                    .action(ArgAction::SetTrue)
                    .global(true)
                    .help("Don't read from cache files if they exist"),
            )
            .arg(
                Arg::new("no-write-cache")
                    .long("no-write-cache")
                    .action(ArgAction::SetTrue)
                    .global(true)
                    .help("Don't persist the cache on module stop"),
            )
            .arg(
                Arg::new("no-cache")
                    .long("no-cache")
                    .action(ArgAction::SetTrue)
                    .global(true)
                    .help("Short for --no-read-cache and --no-write-cache"),
            )
            .arg(
                Arg::new("cache-root")
                    .long("cache-root")
                    .global(true)
                    .help("Override the cache root directory"),
            )
    }

    fn configure_args(&mut self, command: Command) -> Command {
        command
            .about("Manage cached data")
            .subcommand(Command::new("list").about("List all cache entries"))
            .subcommand(
                Command::new("show")
                    .about("Show the contents of a cache entry")
                    .arg(Arg::new("entry-name").required(true)),
            )
            .subcommand(
                Command::new("delete")
                    .about("Delete the cache entries matching the given regexes")
                    .arg(Arg::new("entry-patterns").num_args(0..)),
            )
            .subcommand(Command::new("clear").about("Delete all cache entries"))
    }

    fn configure(&mut self, ctx: &ModuleContext) -> Result<()> {
        let args = ctx.global_args()?;

        let root = match args.get_one::<String>("cache-root") {
            Some(root) => root.clone(),
            None => ctx.env().require(ENV_ROOT)?.to_string(),
        };
        self.store = Some(Store::new(&root)?);

        let no_cache = args.get_flag("no-cache");
        self.read_cache = !(args.get_flag("no-read-cache") || no_cache);
        self.write_cache = !(args.get_flag("no-write-cache") || no_cache);
        debug!(
            root,
            read = self.read_cache,
            write = self.write_cache,
            "cache configured"
        );
        Ok(())
    }

    fn run(&mut self, _ctx: &ModuleContext, invocation: &Invocation) -> Result<Value> {
        match invocation.args.subcommand() {
            Some(("list", _)) => {
                let names = self.list()?;
                Ok(Value::Array(names.into_iter().map(Value::String).collect()))
            }
            Some(("show", matches)) => {
                let name = matches
                    .get_one::<String>("entry-name")
                    .ok_or_else(|| LimarError::config("Missing cache entry name".to_string()))?;
                self.get(name)
            }
            Some(("delete", matches)) => {
                let patterns: Vec<String> = matches
                    .get_many::<String>("entry-patterns")
                    .map(|values| values.cloned().collect())
                    .unwrap_or_default();
                let deleted = self.delete_matching(&patterns)?;
                self.persist()?;
                Ok(Value::Array(
                    deleted.into_iter().map(Value::String).collect(),
                ))
            }
            Some(("clear", _)) => {
                self.clear()?;
                self.persist()?;
                Ok(Value::Null)
            }
            _ => Err(LimarError::config(
                "cache: expected one of list, show, delete, clear".to_string(),
            )),
        }
    }

    fn stop(&mut self, _ctx: &ModuleContext, _outcome: &StopOutcome) -> Result<()> {
        self.flush()
    }

    fn call_service(
        &mut self,
        _ctx: &ModuleContext,
        method: &str,
        args: &[Value],
    ) -> Result<Value> {
        match method {
            "get" => self.get(string_arg(args, 0, "get")?),
            "set" => {
                let name = string_arg(args, 0, "set")?.to_string();
                let data = args
                    .get(1)
                    .cloned()
                    .ok_or_else(|| LimarError::config("cache.set needs a value".to_string()))?;
                self.set(&name, data)?;
                Ok(Value::Null)
            }
            "delete" => {
                let names: Vec<String> = args
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
                self.delete(&names)?;
                Ok(Value::Null)
            }
            "delete_and_persist" => {
                let names: Vec<String> = args
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
                self.delete(&names)?;
                self.persist()?;
                Ok(Value::Null)
            }
            "list" => {
                let names = self.list()?;
                Ok(Value::Array(names.into_iter().map(Value::String).collect()))
            }
            "clear" => {
                self.clear()?;
                Ok(Value::Null)
            }
            other => Err(LimarError::command_run(format!(
                "Module 'cache' has no service method '{other}'"
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

fn string_arg<'a>(args: &'a [Value], index: usize, method: &str) -> Result<&'a str> {
    args.get(index).and_then(Value::as_str).ok_or_else(|| {
        LimarError::config(format!("cache.{method} needs a string argument {index}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn configured(temp_dir: &TempDir) -> CacheModule {
        let mut module = CacheModule::new();
        module.store = Some(Store::new(temp_dir.path()).unwrap());
        module.read_cache = true;
        module.write_cache = true;
        module
    }

    #[test]
    fn test_set_get_delete() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let mut module = configured(&temp_dir);

        module.set("a.b", json!({"x": 1}))?;
        assert_eq!(module.get("a.b")?, json!({"x": 1}));

        module.delete(&["a.b".to_string()])?;
        assert!(module.get("a.b").unwrap_err().is_key_not_found());
        Ok(())
    }

    #[test]
    fn test_read_disabled_hides_persisted_entries() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;

        let mut module = configured(&temp_dir);
        module.set("persisted", json!(1))?;
        module.flush()?;

        let mut module = configured(&temp_dir);
        module.read_cache = false;
        assert!(module.get("persisted").unwrap_err().is_key_not_found());

        module.set("fresh", json!(2))?;
        assert_eq!(module.get("fresh")?, json!(2));
        Ok(())
    }

    #[test]
    fn test_write_disabled_skips_persisting() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;

        let mut module = configured(&temp_dir);
        module.write_cache = false;
        module.set("volatile", json!(1))?;
        module.flush()?;

        let mut module = configured(&temp_dir);
        assert!(module.get("volatile").unwrap_err().is_key_not_found());
        Ok(())
    }

    #[test]
    fn test_delete_matching_persists_pattern_hits() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let mut module = configured(&temp_dir);

        module.set("query.q1", json!(1))?;
        module.set("query.q2", json!(2))?;
        module.set("action.a1", json!(3))?;

        let deleted = module.delete_matching(&["^query\\.".to_string()])?;
        assert_eq!(deleted, vec!["query.q1", "query.q2"]);
        assert!(module.get("action.a1").is_ok());
        Ok(())
    }
}
