//! Terraform variable declarations and submitted values.

use std::collections::HashMap;

use hcl::{Body, Expression};
use serde::Serialize;
use thiserror::Error;

/// File holding `variable "..." {}` blocks inside a workspace.
pub const DECLARATIONS_FILE: &str = "variables.tf";

/// File the submitted values are written to, passed as `-var-file`.
pub const VALUES_FILE: &str = "terraform.tfvars";

/// One input variable of the uploaded project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariableDeclaration {
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: String,
    pub default: String,
    pub description: String,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid HCL: {0}")]
    Hcl(#[from] hcl::Error),
}

/// Reads variable declarations and previously submitted values.
pub trait VariableParser: Send + Sync + 'static {
    fn declarations(&self, source: &str) -> Result<Vec<VariableDeclaration>, ParseError>;

    fn values(&self, source: &str) -> Result<HashMap<String, String>, ParseError>;
}

/// [`VariableParser`] backed by `hcl-rs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HclParser;

impl VariableParser for HclParser {
    fn declarations(&self, source: &str) -> Result<Vec<VariableDeclaration>, ParseError> {
        let body: Body = hcl::parse(source)?;

        let vars = body
            .blocks()
            .filter(|block| block.identifier() == "variable")
            .filter_map(|block| {
                let name = block.labels().first()?.as_str().to_string();
                let attr = |key: &str| {
                    block
                        .body()
                        .attributes()
                        .find(|a| a.key() == key)
                        .map(|a| expr_to_string(a.expr()))
                };
                Some(VariableDeclaration {
                    name,
                    var_type: attr("type").unwrap_or_else(|| "string".to_string()),
                    default: attr("default").unwrap_or_default(),
                    description: attr("description").unwrap_or_default(),
                })
            })
            .collect();

        Ok(vars)
    }

    fn values(&self, source: &str) -> Result<HashMap<String, String>, ParseError> {
        let body: Body = hcl::parse(source)?;
        Ok(body
            .attributes()
            .map(|a| (a.key().to_string(), expr_to_string(a.expr())))
            .collect())
    }
}

/// Render an expression the way a form field would show it: plain strings
/// without quotes, everything else in HCL syntax.
fn expr_to_string(expr: &Expression) -> String {
    match expr {
        Expression::Null => String::new(),
        Expression::Bool(b) => b.to_string(),
        Expression::Number(n) => n.to_string(),
        Expression::String(s) => s.clone(),
        other => hcl::format::to_string(other).unwrap_or_default(),
    }
}

/// Overlay submitted values onto declared defaults.
pub fn apply_values(decls: &mut [VariableDeclaration], values: &HashMap<String, String>) {
    for decl in decls {
        if let Some(value) = values.get(&decl.name) {
            decl.default.clone_from(value);
        }
    }
}

/// Serialize one `name = "value"` line per declared variable.
///
/// Variables missing from `values` are written as empty strings.
pub fn render_values(declared: &[VariableDeclaration], values: &HashMap<String, String>) -> String {
    let mut out = String::new();
    for decl in declared {
        let value = values.get(&decl.name).map(String::as_str).unwrap_or("");
        out.push_str(&decl.name);
        out.push_str(" = \"");
        out.push_str(&escape(value));
        out.push_str("\"\n");
    }
    out
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace("${", "$${")
        .replace("%{", "%%{")
}
