//! `tool` context handler

use super::ContextHandler;
use crate::errors::{LimarError, Result};
use crate::manifest::item::SharedItem;
use crate::manifest::walker::ContextFrame;
use indexmap::IndexMap;

/// Attaches the enclosing tool declaration to items
///
/// Tools are registered by their `command` option; declaring the same tool
/// command in several contexts refers to one tool.
#[derive(Default)]
pub struct Tool {
    tools: IndexMap<String, IndexMap<String, Option<String>>>,
    current_tool: Option<String>,
}

impl ContextHandler for Tool {
    fn context_type(&self) -> &'static str {
        "tool"
    }

    fn on_enter_context(&mut self, context: &ContextFrame) -> Result<()> {
        let command = context.opt("command").ok_or_else(|| {
            LimarError::manifest("A @tool context must be given a `command`".to_string())
        })?;

        if let Some(current) = &self.current_tool {
            return Err(LimarError::manifest(format!(
                "Can only have one nested @tool context: tried to nest '{command}' inside '{current}'"
            )));
        }

        self.tools
            .entry(command.to_string())
            .or_insert_with(|| context.opts.clone());
        self.current_tool = Some(command.to_string());
        Ok(())
    }

    fn on_exit_context(
        &mut self,
        _context: &ContextFrame,
        _items: &crate::manifest::item::ItemSet,
        _item_sets: &IndexMap<String, crate::manifest::item::ItemSet>,
    ) -> Result<()> {
        self.current_tool = None;
        Ok(())
    }

    fn on_declare_item(&mut self, _contexts: &[ContextFrame], item: &SharedItem) -> Result<()> {
        let current = self
            .current_tool
            .as_ref()
            .ok_or_else(|| LimarError::internal("tool handler invoked outside @tool context"))?;

        let mut item = item.borrow_mut();
        item.tags.add("tool", Some(current.clone()));
        item.tool = self.tools.get(current).cloned();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::parser::parse;
    use crate::manifest::Walker;

    #[test]
    fn test_tool_attached_to_items() -> anyhow::Result<()> {
        let walker = Walker::new(vec![Box::new(Tool::default())]);
        let output = walker.walk(&parse(
            "@tool (command: git, version-arg: --version) {\n  git-status\n}\n",
        )?)?;

        let item = output.items["git-status"].borrow();
        assert_eq!(item.tags.value_of("tool"), Some("git"));
        let tool = item.tool.as_ref().unwrap();
        assert_eq!(tool.get("version-arg").unwrap().as_deref(), Some("--version"));
        Ok(())
    }

    #[test]
    fn test_nested_tool_contexts_fail() -> anyhow::Result<()> {
        let walker = Walker::new(vec![Box::new(Tool::default())]);
        let err = walker
            .walk(&parse(
                "@tool (command: git) {\n  @tool (command: hg) {\n    x\n  }\n}\n",
            )?)
            .unwrap_err();
        assert!(err.to_string().contains("nested @tool"));
        Ok(())
    }

    #[test]
    fn test_tool_requires_command() -> anyhow::Result<()> {
        let walker = Walker::new(vec![Box::new(Tool::default())]);
        assert!(walker.walk(&parse("@tool (name: git) {\n  x\n}\n")?).is_err());
        Ok(())
    }
}
