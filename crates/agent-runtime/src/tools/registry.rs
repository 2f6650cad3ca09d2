//! In-memory tool registry.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{
    debug,
    warn,
};

use super::Tool;
use crate::model::types::FunctionDeclaration;

#[derive(Debug, Clone)]
struct RegisteredTool {
    tool: Arc<dyn Tool>,
    /// Whether this tool came from external discovery (e.g. an MCP server)
    /// rather than manual registration.
    discovered: bool,
}

/// Name-keyed tool lookup, read-only during a turn.
///
/// Manual registration and external discovery are tracked separately so that
/// re-discovery can atomically replace the discovered set while leaving
/// manually registered tools untouched.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool manually. Last writer wins.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.insert(tool, false);
    }

    /// Registers a tool produced by external discovery.
    pub fn register_discovered(&mut self, tool: Arc<dyn Tool>) {
        self.insert(tool, true);
    }

    fn insert(&mut self, tool: Arc<dyn Tool>, discovered: bool) {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            warn!(name, "overwriting existing tool registration");
        }
        self.tools.insert(name, RegisteredTool { tool, discovered });
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|r| Arc::clone(&r.tool))
    }

    pub fn all(&self) -> Vec<Arc<dyn Tool>> {
        let mut tools: Vec<_> = self.tools.values().map(|r| Arc::clone(&r.tool)).collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        tools
    }

    /// Builds the tool list sent with every model request.
    pub fn function_declarations(&self) -> Vec<FunctionDeclaration> {
        self.all()
            .into_iter()
            .map(|tool| FunctionDeclaration {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameter_schema(),
            })
            .collect()
    }

    /// Tools discovered from the given MCP server.
    pub fn tools_by_server(&self, server_name: &str) -> Vec<Arc<dyn Tool>> {
        let mut tools: Vec<_> = self
            .tools
            .values()
            .filter(|r| r.tool.server_name() == Some(server_name))
            .map(|r| Arc::clone(&r.tool))
            .collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        tools
    }

    /// Atomically replaces every discovered tool with `tools`, keeping
    /// manually registered ones.
    pub fn replace_discovered(&mut self, tools: Vec<Arc<dyn Tool>>) {
        let before = self.tools.len();
        self.tools.retain(|_, r| !r.discovered);
        for tool in tools {
            self.register_discovered(tool);
        }
        debug!(before, after = self.tools.len(), "replaced discovered tools");
    }
}
