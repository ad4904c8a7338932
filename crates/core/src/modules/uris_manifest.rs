//! URIs-manifest module
//!
//! Registers the local/remote URI context modules with the manifest module.

use crate::context::{uris, ContextHandler};
use crate::errors::Result;
use crate::modules::manifest::ManifestModule;
use crate::orchestrator::{Module, ModuleContext};
use std::any::Any;

#[derive(Default)]
pub struct UrisManifestModule;

impl UrisManifestModule {
    pub fn new() -> Self {
        Self
    }
}

impl Module for UrisManifestModule {
    fn name(&self) -> &'static str {
        "uris-manifest"
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec!["manifest"]
    }

    fn configure(&mut self, ctx: &ModuleContext) -> Result<()> {
        ctx.with_module::<ManifestModule, _>("manifest", |manifest| {
            manifest.add_context_module(|| {
                Box::new(uris::UrisLocal::default()) as Box<dyn ContextHandler>
            })?;
            manifest.add_context_module(|| Box::new(uris::UrisRemote::default()) as _)?;
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
