//! Per-operation instruction templates for text-generation tasks.
//!
//! Templates are Tera sources keyed by operation name. Each resolved
//! parameter is exposed under its own name (strings as-is, everything else
//! as pretty JSON) and all parameters together as `inputs`. Rendering is
//! strict: an undefined variable is an error, which the orchestrator turns
//! into a generic instruction rather than a task failure.

use serde_json::Value;
use std::collections::HashMap;
use tera::{Context, Tera};
use tracing::warn;

use crate::capability::text::INSTRUCTION_PARAM;
use crate::capability::Params;

const SUMMARIZE_TEMPLATE: &str = "Summarize the research material below for a non-specialist \
reader. Cite only identifiers (PMIDs, DOIs) that appear in the material. If it contains no \
records, say that nothing was found.\n\n{{ inputs }}";

const ANSWER_TEMPLATE: &str = "Answer the question using only the material below.\n\n\
Question: {{ query }}\n\nMaterial:\n{{ inputs }}";

const COMPARE_TEMPLATE: &str = "Compare the items below. Point out where they agree and where \
they differ, and cite only identifiers that appear in them.\n\n{{ inputs }}";

const PLAN_TEMPLATE: &str = "Plan how to answer this research request: {{ query }}";

/// Built-in templates by operation.
pub const DEFAULT_TEMPLATES: [(&str, &str); 4] = [
    ("summarize", SUMMARIZE_TEMPLATE),
    ("answer", ANSWER_TEMPLATE),
    ("compare", COMPARE_TEMPLATE),
    ("plan", PLAN_TEMPLATE),
];

/// Compiled instruction templates.
#[derive(Debug, Clone)]
pub struct InstructionTemplates {
    tera: Tera,
}

impl Default for InstructionTemplates {
    fn default() -> Self {
        let mut tera = Tera::default();
        tera.autoescape_on(vec![]);
        for (operation, source) in DEFAULT_TEMPLATES {
            tera.add_raw_template(operation, source)
                .expect("built-in instruction template is valid");
        }
        Self { tera }
    }
}

impl InstructionTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the template for `operation`.
    ///
    /// # Errors
    ///
    /// Returns the Tera parse error if `source` is not a valid template.
    pub fn with_template(mut self, operation: &str, source: &str) -> Result<Self, tera::Error> {
        self.tera.add_raw_template(operation, source)?;
        Ok(self)
    }

    /// Defaults overridden by `overrides`.
    pub fn from_overrides(overrides: &HashMap<String, String>) -> Result<Self, tera::Error> {
        let mut templates = Self::default();
        for (operation, source) in overrides {
            templates = templates.with_template(operation, source)?;
        }
        Ok(templates)
    }

    pub fn has_template(&self, operation: &str) -> bool {
        self.tera.get_template_names().any(|name| name == operation)
    }

    /// Render the template for `operation` strictly.
    pub fn render(&self, operation: &str, params: &Params) -> Result<String, tera::Error> {
        self.tera.render(operation, &context_for(params))
    }

    /// Instruction for a text-generation task.
    ///
    /// An explicit `instruction` parameter wins. Otherwise the operation's
    /// template is rendered; if that fails the failure is logged and a
    /// generic instruction listing the inputs is returned.
    pub fn instruction(&self, task_id: &str, operation: &str, params: &Params) -> String {
        if let Some(Value::String(explicit)) = params.get(INSTRUCTION_PARAM) {
            if !explicit.trim().is_empty() {
                return explicit.clone();
            }
        }
        match self.render(operation, params) {
            Ok(rendered) => rendered,
            Err(err) => {
                warn!(
                    task_id,
                    operation,
                    error = %error_chain(&err),
                    "Instruction template failed; using generic instruction"
                );
                fallback_instruction(operation, params)
            }
        }
    }
}

/// Generic instruction used when no template applies.
pub fn fallback_instruction(operation: &str, params: &Params) -> String {
    format!(
        "Carry out the '{}' task using only the inputs below. Cite only identifiers that \
appear in them.\n\n{}",
        operation,
        inputs_json(params)
    )
}

fn inputs_json(params: &Params) -> String {
    let inputs: Params = params
        .iter()
        .filter(|(name, _)| name.as_str() != INSTRUCTION_PARAM)
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    serde_json::to_string_pretty(&Value::Object(inputs)).unwrap_or_default()
}

fn context_for(params: &Params) -> Context {
    let mut context = Context::new();
    for (name, value) in params {
        match value {
            Value::String(s) => context.insert(name.as_str(), s),
            other => context.insert(
                name.as_str(),
                &serde_json::to_string_pretty(other).unwrap_or_default(),
            ),
        }
    }
    context.insert("inputs", &inputs_json(params));
    context
}

/// Tera nests the useful message in `source()`.
fn error_chain(err: &tera::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}
