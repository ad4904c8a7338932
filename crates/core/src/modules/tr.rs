//! Transform module
//!
//! Exposes the query evaluator and table shaping as services, so manifest
//! subcommands and subqueries can transform data (`- tr.query(...)`) and
//! pipelines can tabulate and render forwarded entities.

use crate::errors::{LimarError, Result};
use crate::orchestrator::{Invocation, Module, ModuleContext};
use crate::query;
use serde_json::Value;
use std::any::Any;

#[derive(Default)]
pub struct TrModule;

impl TrModule {
    pub fn new() -> Self {
        Self
    }
}

impl Module for TrModule {
    fn name(&self) -> &'static str {
        "tr"
    }

    fn aliases(&self) -> Vec<&'static str> {
        vec!["tabulate", "render"]
    }

    /// Shape forwarded data: `-> tabulate` / `-> render` in a pipeline
    fn run(&mut self, _ctx: &ModuleContext, invocation: &Invocation) -> Result<Value> {
        let input = invocation.forwarded_data.clone().unwrap_or(Value::Null);

        match invocation.invoked_as.as_str() {
            "tabulate" => {
                let entities: Vec<Value> = match input {
                    Value::Array(items) => items,
                    Value::Object(map) => map.into_iter().map(|(_, v)| v).collect(),
                    other => vec![other],
                };
                Ok(query::tabulate(&entities))
            }
            "render" => Ok(Value::String(query::render_table(&input, true)?)),
            _ => Err(LimarError::config(
                "tr: invoke as 'tabulate' or 'render' in a pipeline".to_string(),
            )),
        }
    }

    fn call_service(
        &mut self,
        _ctx: &ModuleContext,
        method: &str,
        args: &[Value],
    ) -> Result<Value> {
        let expr = |index: usize| -> Result<&str> {
            args.get(index).and_then(Value::as_str).ok_or_else(|| {
                LimarError::config(format!("tr.{method} needs an expression argument"))
            })
        };
        let data = |index: usize| args.get(index).cloned().unwrap_or(Value::Null);

        match method {
            "query" => query::query_first(expr(0)?, &data(1)),
            "query_all" => query::query_all(expr(0)?, &data(1)),
            "tabulate" => {
                let entities = match data(0) {
                    Value::Array(items) => items,
                    Value::Object(map) => map.into_iter().map(|(_, v)| v).collect(),
                    other => vec![other],
                };
                Ok(query::tabulate(&entities))
            }
            "render_table" => Ok(Value::String(query::render_table(&data(0), true)?)),
            other => Err(LimarError::command_run(format!(
                "Module 'tr' has no service method '{other}'"
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
