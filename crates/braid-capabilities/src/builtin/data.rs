use std::sync::OnceLock;

use futures::stream::BoxStream;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use braid_core::error::Result;
use braid_core::json;
use braid_core::traits::Capability;
use braid_core::types::{CapabilityEvent, Invocation};

use super::{parse_inputs, single};

// ── EchoCapability ──────────────────────────────────────────────

/// Returns its resolved inputs unchanged.
pub struct EchoCapability;

impl Capability for EchoCapability {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Return the resolved inputs unchanged."
    }
    fn invoke(&self, invocation: Invocation) -> BoxStream<'_, Result<CapabilityEvent>> {
        single(async move { Ok(invocation.inputs) })
    }
}

// ── JsonQueryCapability ─────────────────────────────────────────

pub struct JsonQueryCapability;

#[derive(Deserialize)]
struct JsonQueryInput {
    value: Value,
    path: String,
}

impl Capability for JsonQueryCapability {
    fn name(&self) -> &str {
        "json_query"
    }
    fn description(&self) -> &str {
        "Query a JSON value by dot-notation path (e.g. 'items[0].name'). Missing paths yield null."
    }
    fn invoke(&self, invocation: Invocation) -> BoxStream<'_, Result<CapabilityEvent>> {
        single(async move {
            let p: JsonQueryInput = parse_inputs("json_query", invocation.inputs)?;
            // Accept JSON text as well as structured values.
            let value = match p.value {
                Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
                other => other,
            };
            Ok(json::lookup(&value, &p.path).cloned().unwrap_or(Value::Null))
        })
    }
}

// ── TemplateCapability ──────────────────────────────────────────

pub struct TemplateCapability;

#[derive(Deserialize)]
struct TemplateInput {
    template: String,
    #[serde(flatten)]
    values: serde_json::Map<String, Value>,
}

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([^{}\s]+)\s*\}\}").expect("valid placeholder regex"))
}

/// Replace `{{key}}` placeholders with values looked up in `values`.
/// Unknown keys render as an empty string.
fn render(template: &str, values: &Value) -> String {
    placeholder()
        .replace_all(template, |caps: &regex::Captures| {
            json::lookup(values, &caps[1])
                .map(json::display)
                .unwrap_or_default()
        })
        .into_owned()
}

impl Capability for TemplateCapability {
    fn name(&self) -> &str {
        "template"
    }
    fn description(&self) -> &str {
        "Render a '{{key}}' template from the other inputs."
    }
    fn invoke(&self, invocation: Invocation) -> BoxStream<'_, Result<CapabilityEvent>> {
        single(async move {
            let p: TemplateInput = parse_inputs("template", invocation.inputs)?;
            let values = Value::Object(p.values);
            Ok(Value::String(render(&p.template, &values)))
        })
    }
}
