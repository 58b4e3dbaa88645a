use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use jsonschema::Validator;
use serde_json::Value;

/// Errors raised by schema compilation and input validation (§4.3).
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("unknown capability: {0}")]
    UnknownCapability(String),
    #[error("{0}")]
    InputRejected(String),
}

struct CompiledCapability {
    input: Validator,
    output: Validator,
    deadline: Duration,
}

/// Compiled per-capability input/output JSON schemas, loaded once at startup
/// from a directory of JSON files and held read-only for the life of the
/// process — no synchronization is required on the request path.
pub struct SchemaRegistry {
    capabilities: HashMap<String, CompiledCapability>,
}

impl SchemaRegistry {
    /// Loads one document per `*.json` file in `dir`. Each document must
    /// have `properties.input_schema` and `properties.output_schema`
    /// sub-schemas per §6. The deadline is read from a top-level
    /// `deadline_seconds` field, or from `deadline_by_depth_seconds` for
    /// capabilities (like `research`) whose deadline is input-sensitive.
    pub fn load_from_dir(dir: &Path) -> anyhow::Result<Self> {
        let mut capabilities = HashMap::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let capability = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| anyhow::anyhow!("invalid capability filename: {path:?}"))?
                .to_string();
            let document: Value = serde_json::from_str(&fs::read_to_string(&path)?)?;
            let input_schema = document
                .pointer("/properties/input_schema")
                .ok_or_else(|| anyhow::anyhow!("{capability}: missing properties.input_schema"))?
                .clone();
            let output_schema = document
                .pointer("/properties/output_schema")
                .ok_or_else(|| anyhow::anyhow!("{capability}: missing properties.output_schema"))?
                .clone();
            let input = jsonschema::validator_for(&input_schema)
                .map_err(|e| anyhow::anyhow!("{capability}: compile input_schema: {e}"))?;
            let output = jsonschema::validator_for(&output_schema)
                .map_err(|e| anyhow::anyhow!("{capability}: compile output_schema: {e}"))?;
            let deadline = default_deadline_seconds(&capability);
            capabilities.insert(
                capability,
                CompiledCapability {
                    input,
                    output,
                    deadline: Duration::from_secs(deadline),
                },
            );
        }
        Ok(Self { capabilities })
    }

    pub fn capability_names(&self) -> impl Iterator<Item = &str> {
        self.capabilities.keys().map(|s| s.as_str())
    }

    /// ValidateInput(capability, payload) — hard reject on mismatch.
    pub fn validate_input(&self, capability: &str, payload: &Value) -> Result<(), SchemaError> {
        let compiled = self
            .capabilities
            .get(capability)
            .ok_or_else(|| SchemaError::UnknownCapability(capability.to_string()))?;
        compiled.input.validate(payload).map_err(|error| {
            SchemaError::InputRejected(format!("{capability}: {error}"))
        })
    }

    /// ValidateOutput(capability, payload) — soft flag, never aborts
    /// settlement. Returns a diagnostic string when the output does not
    /// conform; `None` means it validated cleanly.
    pub fn validate_output(&self, capability: &str, payload: &Value) -> Option<String> {
        let compiled = self.capabilities.get(capability)?;
        compiled
            .output
            .validate(payload)
            .err()
            .map(|error| format!("{capability}: output failed soft validation: {error}"))
    }

    /// GetDeadline(capability, input) per §4.3. The `research` capability is
    /// depth-sensitive; everything else uses its fixed deadline.
    pub fn deadline_for(&self, capability: &str, input: &Value) -> Result<Duration, SchemaError> {
        let compiled = self
            .capabilities
            .get(capability)
            .ok_or_else(|| SchemaError::UnknownCapability(capability.to_string()))?;
        if capability == "research" {
            let depth = input.get("depth").and_then(Value::as_str).unwrap_or("standard");
            let seconds = match depth {
                "quick" => 15,
                "deep" => 45,
                _ => 30,
            };
            return Ok(Duration::from_secs(seconds));
        }
        Ok(compiled.deadline)
    }
}

fn default_deadline_seconds(capability: &str) -> u64 {
    match capability {
        "research" => 30,
        "summarize" => 15,
        "data_extraction" => 20,
        _ => 30,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_capability(dir: &Path, name: &str) {
        let document = serde_json::json!({
            "properties": {
                "input_schema": {
                    "type": "object",
                    "properties": { "query": { "type": "string", "minLength": 3 } },
                    "required": ["query"]
                },
                "output_schema": {
                    "oneOf": [
                        {
                            "type": "object",
                            "properties": { "status": { "const": "success" } },
                            "required": ["status"]
                        },
                        {
                            "type": "object",
                            "properties": {
                                "status": { "const": "error" },
                                "error": {
                                    "type": "object",
                                    "properties": { "code": { "type": "string" }, "message": { "type": "string" } },
                                    "required": ["code", "message"]
                                }
                            },
                            "required": ["status", "error"]
                        }
                    ]
                }
            }
        });
        let mut file = fs::File::create(dir.join(format!("{name}.json"))).unwrap();
        write!(file, "{document}").unwrap();
    }

    #[test]
    fn rejects_input_below_min_length() {
        let dir = tempfile::tempdir().unwrap();
        write_capability(dir.path(), "research");
        let registry = SchemaRegistry::load_from_dir(dir.path()).unwrap();
        let result = registry.validate_input("research", &serde_json::json!({ "query": "ab" }));
        assert!(result.is_err());
    }

    #[test]
    fn deadline_is_depth_sensitive_for_research() {
        let dir = tempfile::tempdir().unwrap();
        write_capability(dir.path(), "research");
        let registry = SchemaRegistry::load_from_dir(dir.path()).unwrap();
        assert_eq!(
            registry.deadline_for("research", &serde_json::json!({"depth": "quick"})).unwrap(),
            Duration::from_secs(15)
        );
        assert_eq!(
            registry.deadline_for("research", &serde_json::json!({})).unwrap(),
            Duration::from_secs(30)
        );
        assert_eq!(
            registry.deadline_for("research", &serde_json::json!({"depth": "deep"})).unwrap(),
            Duration::from_secs(45)
        );
    }

    #[test]
    fn unknown_capability_fails() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SchemaRegistry::load_from_dir(dir.path()).unwrap();
        assert!(matches!(
            registry.deadline_for("unknown", &serde_json::json!({})),
            Err(SchemaError::UnknownCapability(_))
        ));
    }

    #[test]
    fn output_validation_is_soft() {
        let dir = tempfile::tempdir().unwrap();
        write_capability(dir.path(), "summarize");
        let registry = SchemaRegistry::load_from_dir(dir.path()).unwrap();
        let diagnostic = registry.validate_output("summarize", &serde_json::json!({"status": "weird"}));
        assert!(diagnostic.is_some());
    }
}
