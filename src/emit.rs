//! Schema Emitters. Both are pure functions of a [`TypeModel`].
pub mod json_schema;
pub mod tosca;

use crate::error::ConvertError;
use crate::ir::Wiring;
use crate::lower::TypeModel;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Tosca,
    #[value(name = "jsonschema", alias = "json-schema")]
    JsonSchema,
}

/// Document-level inputs that do not come from the argument spec.
#[derive(Debug, Clone, Copy)]
pub struct EmitContext<'a> {
    pub node_type_name: &'a str,
    pub implementation: &'a str, // source module or playbook file name
    pub wiring: &'a Wiring,
}

impl OutputFormat {
    /// Suffix used for batch output files.
    pub fn file_suffix(self) -> &'static str {
        match self {
            OutputFormat::Tosca => "tosca.yaml",
            OutputFormat::JsonSchema => "schema.json",
        }
    }
}

pub fn render(model: &TypeModel, format: OutputFormat, cx: &EmitContext<'_>) -> Result<String, ConvertError> {
    match format {
        OutputFormat::JsonSchema => {
            let mut out = serde_json::to_string_pretty(&json_schema::document(model, cx))?;
            out.push('\n');
            Ok(out)
        }
        OutputFormat::Tosca => Ok(serde_yaml::to_string(&tosca::document(model, cx))?),
    }
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{ExtractMode, extract_from_source};
    use crate::lower::lower_spec;
    use crate::sandbox::SubstitutionEnv;

    #[test]
    fn renders_are_deterministic_and_well_formed() {
        let src = "argument_spec = dict(b=dict(type='int'), a=dict(options=dict(x=dict())))\n";
        let spec = extract_from_source(src, ExtractMode::StaticOnly, &SubstitutionEnv::default()).spec;
        let model = lower_spec(&spec);
        let wiring = Wiring::default();
        let cx = EmitContext { node_type_name: "Thing", implementation: "thing.py", wiring: &wiring };

        let json = render(&model, OutputFormat::JsonSchema, &cx).unwrap();
        assert_eq!(json, render(&lower_spec(&spec), OutputFormat::JsonSchema, &cx).unwrap());
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        let keys: Vec<&String> = parsed["properties"].as_object().unwrap().keys().collect();
        assert_eq!(keys, ["b", "a"]);

        let yaml = render(&model, OutputFormat::Tosca, &cx).unwrap();
        assert_eq!(yaml, render(&model, OutputFormat::Tosca, &cx).unwrap());
        let parsed: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert!(parsed["node_types"]["Thing"]["properties"]["a"].is_mapping());
    }
}
