//! `cache` context handler

use super::ContextHandler;
use crate::errors::{LimarError, Result};
use crate::manifest::item::{CacheConfig, ItemSet, Retention, SharedItem};
use crate::manifest::walker::ContextFrame;
use indexmap::IndexMap;

/// Attaches cache behaviour to items from the nearest enclosing options
///
/// `enabled`/`disabled` are read from the nearest context declaring either
/// (`disabled` outranks `enabled` within one context); `retention` from the
/// nearest context declaring it. At exit-manifest a command's cacheability
/// is AND-combined over its transitive dependencies: caching a result whose
/// inputs cannot be cached would never be invalidated correctly.
#[derive(Default)]
pub struct Cache;

impl ContextHandler for Cache {
    fn context_type(&self) -> &'static str {
        "cache"
    }

    fn on_declare_item(&mut self, contexts: &[ContextFrame], item: &SharedItem) -> Result<()> {
        let enabled = contexts
            .iter()
            .rev()
            .find(|frame| frame.has_opt("enabled") || frame.has_opt("disabled"))
            .map(|frame| !frame.has_opt("disabled"))
            .unwrap_or(true);

        let retention = contexts
            .iter()
            .rev()
            .find_map(|frame| frame.opt("retention"))
            .map(str::parse::<Retention>)
            .transpose()?
            .unwrap_or_default();

        item.borrow_mut().cache = Some(CacheConfig { enabled, retention });
        Ok(())
    }

    fn on_exit_manifest(
        &mut self,
        items: &ItemSet,
        _item_sets: &IndexMap<String, ItemSet>,
    ) -> Result<()> {
        for item in items.values() {
            let transitive_dependencies = {
                let item = item.borrow();
                match (&item.command, &item.cache) {
                    (Some(command), Some(_)) => command.transitive_dependencies.clone(),
                    _ => continue,
                }
            };

            let all_deps_cacheable = transitive_dependencies.iter().all(|dep_ref| {
                items
                    .get(dep_ref)
                    .ok_or(())
                    .and_then(|dep| {
                        dep.borrow()
                            .cache
                            .as_ref()
                            .map(|cache| cache.enabled)
                            .ok_or(())
                    })
                    .unwrap_or(false)
            });

            if !all_deps_cacheable {
                let mut item = item.borrow_mut();
                let cache = item.cache.as_mut().ok_or_else(|| {
                    LimarError::internal("cache config vanished during finalisation")
                })?;
                cache.enabled = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::command::{CommandContext, QueryType};
    use crate::manifest::parser::parse;
    use crate::manifest::Walker;

    fn handlers() -> Vec<Box<dyn ContextHandler>> {
        vec![
            Box::new(CommandContext::command()),
            Box::new(CommandContext::query()),
            Box::new(QueryType),
            Box::new(Cache),
        ]
    }

    #[test]
    fn test_nearest_options_win() -> anyhow::Result<()> {
        let manifest = "\
@cache (enabled, retention: session) {
  a
  @cache (disabled) {
    b
  }
  @cache (retention: batch) {
    c
  }
}
";
        let output = Walker::new(handlers()).walk(&parse(manifest)?)?;

        let a = output.items["a"].borrow();
        assert_eq!(
            a.cache,
            Some(CacheConfig {
                enabled: true,
                retention: Retention::Session
            })
        );

        let b = output.items["b"].borrow();
        assert!(!b.cache.as_ref().unwrap().enabled);

        let c = output.items["c"].borrow();
        assert_eq!(c.cache.as_ref().unwrap().retention, Retention::Batch);
        assert!(c.cache.as_ref().unwrap().enabled);
        Ok(())
    }

    #[test]
    fn test_uncacheable_dependency_disables_dependants() -> anyhow::Result<()> {
        let manifest = "\
@cache (disabled) {
  @query (command: \"echo base\", parse: .) {
    base
  }
}
@cache (enabled) {
  @query (command: \"echo {{ command.run_refs(base) : . }}\", parse: .) {
    dependant
  }
}
";
        let output = Walker::new(handlers()).walk(&parse(manifest)?)?;

        assert!(!output.items["base"].borrow().cache.as_ref().unwrap().enabled);
        assert!(
            !output.items["dependant"]
                .borrow()
                .cache
                .as_ref()
                .unwrap()
                .enabled
        );
        Ok(())
    }

    #[test]
    fn test_unknown_retention_fails() -> anyhow::Result<()> {
        let walker = Walker::new(handlers());
        assert!(walker
            .walk(&parse("@cache (retention: forever) {\n  a\n}\n")?)
            .is_err());
        Ok(())
    }
}
