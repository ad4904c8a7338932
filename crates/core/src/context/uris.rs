//! `uris` context handlers
//!
//! Two handlers share the `uris` context type: one computes absolute local
//! paths, the other HTTP(S) remotes. Both default an item's mapping to its
//! ref, prefix it with the nearest enclosing `local`/`remote` option, and
//! validate the result once the whole manifest is known.

use super::ContextHandler;
use crate::errors::{LimarError, Result};
use crate::manifest::item::{ItemSet, SharedItem};
use crate::manifest::walker::ContextFrame;
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

static HTTP_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new("^https?://").expect("http url regex is valid"));

/// Computes each item's absolute local path
#[derive(Default)]
pub struct UrisLocal {
    declared: BTreeSet<String>,
}

impl ContextHandler for UrisLocal {
    fn context_type(&self) -> &'static str {
        "uris"
    }

    fn on_declare_item(&mut self, contexts: &[ContextFrame], item: &SharedItem) -> Result<()> {
        let mut item = item.borrow_mut();
        let ref_name = item.item_ref.clone();

        let local_root = contexts
            .iter()
            .rev()
            .find_map(|frame| frame.opt("local"))
            .filter(|root| root.starts_with('/'));

        item.path = Some(match local_root {
            Some(root) => format!("{}/{ref_name}", root.trim_end_matches('/')),
            None => item.path.clone().unwrap_or(ref_name),
        });
        Ok(())
    }

    fn on_exit_context(
        &mut self,
        _context: &ContextFrame,
        items: &ItemSet,
        _item_sets: &IndexMap<String, ItemSet>,
    ) -> Result<()> {
        self.declared.extend(items.keys().cloned());
        Ok(())
    }

    fn on_exit_manifest(
        &mut self,
        items: &ItemSet,
        _item_sets: &IndexMap<String, ItemSet>,
    ) -> Result<()> {
        for ref_name in &self.declared {
            let Some(item) = items.get(ref_name) else {
                continue;
            };
            let item = item.borrow();
            match &item.path {
                None => {
                    return Err(LimarError::manifest(format!(
                        "Path of item '{ref_name}' not defined (required by @uris context)"
                    )))
                }
                Some(path) if !path.starts_with('/') => {
                    return Err(LimarError::manifest(format!(
                        "Path of item '{ref_name}' not absolute (required by @uris context)"
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Computes each item's HTTP(S) remote
#[derive(Default)]
pub struct UrisRemote {
    declared: BTreeSet<String>,
}

impl ContextHandler for UrisRemote {
    fn context_type(&self) -> &'static str {
        "uris"
    }

    fn on_declare_item(&mut self, contexts: &[ContextFrame], item: &SharedItem) -> Result<()> {
        let mut item = item.borrow_mut();
        let ref_name = item.item_ref.clone();

        let remote_root = contexts
            .iter()
            .rev()
            .find_map(|frame| frame.opt("remote"))
            .filter(|root| HTTP_URL.is_match(root));

        item.remote = Some(match remote_root {
            Some(root) => format!("{}/{ref_name}", root.trim_end_matches('/')),
            None => item.remote.clone().unwrap_or(ref_name),
        });
        Ok(())
    }

    fn on_exit_context(
        &mut self,
        _context: &ContextFrame,
        items: &ItemSet,
        _item_sets: &IndexMap<String, ItemSet>,
    ) -> Result<()> {
        self.declared.extend(items.keys().cloned());
        Ok(())
    }

    fn on_exit_manifest(
        &mut self,
        items: &ItemSet,
        _item_sets: &IndexMap<String, ItemSet>,
    ) -> Result<()> {
        for ref_name in &self.declared {
            let Some(item) = items.get(ref_name) else {
                continue;
            };
            let item = item.borrow();
            match &item.remote {
                None => {
                    return Err(LimarError::manifest(format!(
                        "Remote of item '{ref_name}' not defined (required by @uris context)"
                    )))
                }
                Some(remote) if !HTTP_URL.is_match(remote) => {
                    return Err(LimarError::manifest(format!(
                        "Remote of item '{ref_name}' not a valid HTTP(S) URL (required by @uris context)"
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::parser::parse;
    use crate::manifest::Walker;

    fn handlers() -> Vec<Box<dyn ContextHandler>> {
        vec![
            Box::new(UrisLocal::default()),
            Box::new(UrisRemote::default()),
        ]
    }

    #[test]
    fn test_paths_and_remotes_computed() -> anyhow::Result<()> {
        let manifest = "\
@uris (local: /home/user/dev, remote: https://git.example.com/user) {
  proj-a
  @uris (local: /srv/checkouts) {
    proj-b
  }
}
";
        let output = Walker::new(handlers()).walk(&parse(manifest)?)?;

        let a = output.items["proj-a"].borrow();
        assert_eq!(a.path.as_deref(), Some("/home/user/dev/proj-a"));
        assert_eq!(
            a.remote.as_deref(),
            Some("https://git.example.com/user/proj-a")
        );

        let b = output.items["proj-b"].borrow();
        assert_eq!(b.path.as_deref(), Some("/srv/checkouts/proj-b"));
        assert_eq!(
            b.remote.as_deref(),
            Some("https://git.example.com/user/proj-b")
        );
        Ok(())
    }

    #[test]
    fn test_relative_path_fails_validation() -> anyhow::Result<()> {
        // No local root anywhere: the path defaults to the (relative) ref
        let walker = Walker::new(vec![Box::new(UrisLocal::default())]);
        let err = walker
            .walk(&parse("@uris {\n  proj\n}\n")?)
            .unwrap_err();
        assert!(err.to_string().contains("not absolute"));
        Ok(())
    }

    #[test]
    fn test_non_http_remote_fails_validation() -> anyhow::Result<()> {
        let walker = Walker::new(vec![Box::new(UrisRemote::default())]);
        let err = walker
            .walk(&parse("@uris (remote: git@example.com) {\n  proj\n}\n")?)
            .unwrap_err();
        assert!(err.to_string().contains("HTTP(S)"));
        Ok(())
    }
}
