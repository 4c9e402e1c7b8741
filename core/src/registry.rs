//! Tool definitions and the parent-side dispatch registry.
//!
//! A tool is a host-side callable exposed to the child by name. The registry
//! validates names at construction, detects duplicates, resolves incoming
//! `tool_call` frames, and generates the snippet that defines one locked
//! wrapper per tool inside the child.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Map;
use serde_json::Value;
use tracing::warn;

use securer_protocol::is_valid_identifier;

use crate::error::Result;
use crate::error::SecurerErr;

/// Host-side implementation: named arguments in, serializable value out.
pub type ToolFn =
    Arc<dyn Fn(&Map<String, Value>) -> std::result::Result<Value, String> + Send + Sync>;

/// Declared parameter types the child-side wrappers assert before the call
/// crosses the channel. Container tags validate kind only, never shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    Numeric,
    Character,
    Logical,
    Integer,
    List,
    DataFrame,
}

impl TypeTag {
    fn predicate(self) -> &'static str {
        match self {
            TypeTag::Numeric => "is.numeric",
            TypeTag::Character => "is.character",
            TypeTag::Logical => "is.logical",
            TypeTag::Integer => "is.integer",
            TypeTag::List => "is.list",
            TypeTag::DataFrame => "is.data.frame",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolParam {
    pub name: String,
    pub type_tag: Option<TypeTag>,
}

impl ToolParam {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            type_tag: None,
        }
    }

    pub fn typed(name: &str, tag: TypeTag) -> Self {
        Self {
            name: name.to_string(),
            type_tag: Some(tag),
        }
    }
}

/// Immutable tool record produced by [`define_tool`].
#[derive(Clone)]
pub struct ToolDef {
    name: String,
    description: String,
    implementation: ToolFn,

    /// `Some(vec![])` means zero-argument (any extra is rejected);
    /// `None` is the legacy arbitrary-arguments form.
    params: Option<Vec<ToolParam>>,
}

impl ToolDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub(crate) fn implementation(&self) -> &ToolFn {
        &self.implementation
    }

    /// Parameter names the dispatcher accepts, in declaration order.
    pub fn expected_params(&self) -> Option<Vec<String>> {
        self.params
            .as_ref()
            .map(|params| params.iter().map(|p| p.name.clone()).collect())
    }
}

impl fmt::Debug for ToolDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDef")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("params", &self.params)
            .finish()
    }
}

/// Validates and builds one tool record. Fails with `InvalidIdentifier` when
/// the tool name or any parameter name is not a valid identifier.
pub fn define_tool(
    name: &str,
    description: &str,
    implementation: ToolFn,
    params: Option<Vec<ToolParam>>,
) -> Result<ToolDef> {
    if !is_valid_identifier(name) {
        return Err(SecurerErr::InvalidIdentifier(name.to_string()));
    }
    if let Some(params) = &params {
        for param in params {
            if !is_valid_identifier(&param.name) {
                return Err(SecurerErr::InvalidIdentifier(param.name.clone()));
            }
        }
    }
    Ok(ToolDef {
        name: name.to_string(),
        description: description.to_string(),
        implementation,
        params,
    })
}

/// Parent-side dispatch map, read-only after session start.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    entries: BTreeMap<String, ToolDef>,
}

impl ToolRegistry {
    /// Builds the registry from validated tool records, rejecting duplicate
    /// names.
    pub fn from_tools(tools: Vec<ToolDef>) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for tool in tools {
            if entries.contains_key(tool.name()) {
                return Err(SecurerErr::DuplicateTool(tool.name().to_string()));
            }
            entries.insert(tool.name().to_string(), tool);
        }
        Ok(Self { entries })
    }

    /// Legacy name→callable form: arbitrary arguments, caller beware. Emits
    /// one deprecation warning per registration.
    pub fn from_legacy_map(tools: Vec<(String, ToolFn)>) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for (name, implementation) in tools {
            warn!(
                tool = name.as_str(),
                "legacy name->callable tool registration is deprecated; use define_tool"
            );
            if !is_valid_identifier(&name) {
                return Err(SecurerErr::InvalidIdentifier(name));
            }
            if entries.contains_key(&name) {
                return Err(SecurerErr::DuplicateTool(name));
            }
            entries.insert(
                name.clone(),
                ToolDef {
                    name,
                    description: String::new(),
                    implementation,
                    params: None,
                },
            );
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn get(&self, name: &str) -> Option<&ToolDef> {
        self.entries.get(name)
    }

    /// Generates the snippet that defines one wrapper per tool in the child:
    /// declared formals (so accidental extras fail child-side too), type
    /// assertions for declared tags, delegation to `call_tool`, and a
    /// binding lock per wrapper.
    pub fn wrapper_snippet(&self) -> String {
        let mut snippet = String::new();
        for tool in self.entries.values() {
            snippet.push_str(&wrapper_for(tool));
            snippet.push('\n');
        }
        snippet
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn wrapper_for(tool: &ToolDef) -> String {
    let name = tool.name();
    match &tool.params {
        None => format!(
            "{name} <- function(...) call_tool(\"{name}\", ...)\n\
             lockBinding(\"{name}\", globalenv())\n"
        ),
        Some(params) if params.is_empty() => format!(
            "{name} <- function() call_tool(\"{name}\")\n\
             lockBinding(\"{name}\", globalenv())\n"
        ),
        Some(params) => {
            let formals: Vec<&str> = params.iter().map(|p| p.name.as_str()).collect();
            let formals = formals.join(", ");
            let mut body = String::new();
            for param in params {
                if let Some(tag) = param.type_tag {
                    body.push_str(&format!(
                        "  stopifnot({}({}))\n",
                        tag.predicate(),
                        param.name
                    ));
                }
            }
            let forwarded: Vec<String> = params
                .iter()
                .map(|p| format!("{} = {}", p.name, p.name))
                .collect();
            let forwarded = forwarded.join(", ");
            format!(
                "{name} <- function({formals}) {{\n\
                 {body}  call_tool(\"{name}\", {forwarded})\n\
                 }}\n\
                 lockBinding(\"{name}\", globalenv())\n"
            )
        }
    }
}
