//! Command-manifest module
//!
//! Registers the command-family context modules with the manifest module,
//! extending the manifest format with tools, commands, queries, actions,
//! caching behaviour, and subjects.

use crate::context::command::{ActionType, CommandContext, QueryType};
use crate::context::{cache, subjects, tags, tool, ContextHandler};
use crate::errors::Result;
use crate::modules::manifest::ManifestModule;
use crate::orchestrator::{Module, ModuleContext};
use std::any::Any;

#[derive(Default)]
pub struct CommandManifestModule;

impl CommandManifestModule {
    pub fn new() -> Self {
        Self
    }
}

impl Module for CommandManifestModule {
    fn name(&self) -> &'static str {
        "command-manifest"
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec!["manifest"]
    }

    fn configure(&mut self, ctx: &ModuleContext) -> Result<()> {
        ctx.with_module::<ManifestModule, _>("manifest", |manifest| {
            manifest.add_context_module(|| Box::new(tags::Tags) as Box<dyn ContextHandler>)?;
            manifest.add_context_module(|| Box::new(tool::Tool::default()) as _)?;
            manifest.add_context_module(|| Box::new(CommandContext::command()) as _)?;
            manifest.add_context_module(|| Box::new(CommandContext::query()) as _)?;
            manifest.add_context_module(|| Box::new(CommandContext::action()) as _)?;
            manifest.add_context_module(|| Box::new(QueryType) as _)?;
            manifest.add_context_module(|| Box::new(ActionType) as _)?;
            manifest.add_context_module(|| Box::new(cache::Cache) as _)?;
            manifest.add_context_module(|| Box::new(subjects::Subjects) as _)?;
            manifest.add_context_module(|| Box::new(subjects::Subject) as _)?;
            manifest
                .add_context_module(|| Box::new(subjects::PrimarySubject::default()) as _)?;
            Ok(())
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
