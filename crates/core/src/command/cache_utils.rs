//! Cache utilities for the command engine
//!
//! Key derivation and the memoisation wrapper used around cacheable
//! command runs. Cache access goes through the cache module's services so
//! the read/write toggles and persistence rules apply uniformly.

use crate::errors::Result;
use crate::manifest::item::{Item, Retention};
use crate::orchestrator::ModuleContext;
use serde_json::Value;
use tracing::debug;

/// The store-blob suffix appended to every derived key
const KEY_SUFFIX: &str = ".json";

/// Whether caching is enabled for an item (disabled when unconfigured)
pub fn is_enabled(item: &Item) -> bool {
    item.cache.as_ref().is_some_and(|cache| cache.enabled)
}

/// The item's cache retention (batch when unconfigured)
pub fn retention_of(item: &Item) -> Retention {
    item.cache
        .as_ref()
        .map(|cache| cache.retention)
        .unwrap_or_default()
}

/// Derive a cache key: parts joined with `.`, `/` mapped to `.`
pub fn key(parts: &[&str]) -> String {
    format!("{}{KEY_SUFFIX}", parts.join(".").replace('/', "."))
}

/// Memoise a computation under a key, invalidating dependants on recompute
///
/// On a hit the cached value is returned and nothing else happens. On a
/// miss the computation runs, its result is cached under `key`, and every
/// key in `invalid_on_run` is deleted - so dependants of a just-recomputed
/// node are re-derived on their next access.
pub fn with_caching(
    ctx: &ModuleContext,
    cache_key: &str,
    compute: impl FnOnce() -> Result<Value>,
    invalid_on_run: &[String],
) -> Result<Value> {
    match ctx.call("cache", "get", &[Value::String(cache_key.to_string())]) {
        Ok(cached) => {
            debug!(key = cache_key, "cache hit");
            Ok(cached)
        }
        Err(e) if e.is_key_not_found() => {
            debug!(key = cache_key, "cache miss, computing");
            let output = compute()?;

            ctx.call(
                "cache",
                "set",
                &[Value::String(cache_key.to_string()), output.clone()],
            )?;
            let invalid: Vec<Value> = invalid_on_run
                .iter()
                .map(|k| Value::String(k.clone()))
                .collect();
            if !invalid.is_empty() {
                ctx.call("cache", "delete", &invalid)?;
            }

            Ok(output)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::item::CacheConfig;
    use crate::modules::cache::CacheModule;
    use crate::orchestrator::Orchestrator;
    use serde_json::json;
    use std::cell::Cell;
    use std::collections::HashMap;
    use std::rc::Rc;
    use tempfile::TempDir;

    #[test]
    fn test_key_derivation() {
        assert_eq!(key(&["query", "my/command"]), "query.my.command.json");
        assert_eq!(key(&["command_runner", "graph"]), "command_runner.graph.json");
    }

    #[test]
    fn test_enabled_and_retention_defaults() {
        let mut item = Item::new("a");
        assert!(!is_enabled(&item));
        assert_eq!(retention_of(&item), Retention::Batch);

        item.cache = Some(CacheConfig {
            enabled: true,
            retention: Retention::Session,
        });
        assert!(is_enabled(&item));
        assert_eq!(retention_of(&item), Retention::Session);
    }

    /// A context with a live cache module behind it
    fn cache_context(temp_dir: &TempDir) -> Rc<crate::orchestrator::ModuleContext> {
        let mut orchestrator = Orchestrator::new("limar");
        orchestrator
            .register(Box::new(CacheModule::new()))
            .expect("register cache");

        let mut env = HashMap::new();
        env.insert(
            "LIMAR_CACHE_ROOT".to_string(),
            temp_dir.path().to_string_lossy().to_string(),
        );
        orchestrator
            .run(&[], Some(&env))
            .expect("empty run configures the cache");
        orchestrator.context()
    }

    #[test]
    fn test_with_caching_memoises() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let ctx = cache_context(&temp_dir);

        let calls = Rc::new(Cell::new(0));
        let compute = || {
            let calls = calls.clone();
            move || {
                calls.set(calls.get() + 1);
                Ok(json!({"answer": 42}))
            }
        };

        let first = with_caching(&ctx, "memo.json", compute(), &[])?;
        let second = with_caching(&ctx, "memo.json", compute(), &[])?;

        assert_eq!(first, second);
        assert_eq!(calls.get(), 1);
        Ok(())
    }

    #[test]
    fn test_with_caching_invalidates_dependants_on_recompute() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let ctx = cache_context(&temp_dir);

        ctx.call(
            "cache",
            "set",
            &[json!("dependant.json"), json!("stale")],
        )?;

        with_caching(
            &ctx,
            "dep.json",
            || Ok(json!("fresh")),
            &["dependant.json".to_string()],
        )?;

        let err = ctx.call("cache", "get", &[json!("dependant.json")]).unwrap_err();
        assert!(err.is_key_not_found());

        // A hit does not invalidate anything
        ctx.call("cache", "set", &[json!("dependant.json"), json!("restored")])?;
        with_caching(
            &ctx,
            "dep.json",
            || Ok(json!("never computed")),
            &["dependant.json".to_string()],
        )?;
        assert_eq!(
            ctx.call("cache", "get", &[json!("dependant.json")])?,
            json!("restored")
        );
        Ok(())
    }
}
