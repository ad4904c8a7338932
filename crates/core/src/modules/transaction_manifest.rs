//! Transaction-manifest module
//!
//! Registers the financial-transaction context module with the manifest
//! module.

use crate::context::{transaction, ContextHandler};
use crate::errors::Result;
use crate::modules::manifest::ManifestModule;
use crate::orchestrator::{Module, ModuleContext};
use std::any::Any;

#[derive(Default)]
pub struct TransactionManifestModule;

impl TransactionManifestModule {
    pub fn new() -> Self {
        Self
    }
}

impl Module for TransactionManifestModule {
    fn name(&self) -> &'static str {
        "transaction-manifest"
    }

    fn dependencies(&self) -> Vec<&'static str> {
        vec!["manifest"]
    }

    fn configure(&mut self, ctx: &ModuleContext) -> Result<()> {
        ctx.with_module::<ManifestModule, _>("manifest", |manifest| {
            manifest.add_context_module(|| {
                Box::new(transaction::FinancialTransaction) as Box<dyn ContextHandler>
            })
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
