//! One conversion per call: input path + options → rendered document.
use std::path::Path;

use heck::ToUpperCamelCase;
use log::info;

use crate::emit::{self, EmitContext, OutputFormat};
use crate::error::ConvertError;
use crate::extract::{self, Diagnostic, ExtractMode, ExtractionMiss, SpecSource};
use crate::ir::Wiring;
use crate::lower::lower_spec;
use crate::playbook;
use crate::sandbox::SubstitutionEnv;

#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    pub format: OutputFormat,
    pub node_type_name: Option<String>, // derived from the file name when absent
    pub extract_mode: ExtractMode,
}

/// A rendered document plus what happened on the way.
#[derive(Debug, Clone)]
pub struct Conversion {
    pub document: String,
    pub node_type_name: String,
    pub parameters: usize,
    pub source: Option<SpecSource>,
    pub miss: Option<ExtractionMiss>,
    pub diagnostics: Vec<Diagnostic>,
}

// ————————————————————————————————————————————————————————————————————————————
// FRONT API
// ————————————————————————————————————————————————————————————————————————————

pub fn convert_module(path: &Path, options: &ConvertOptions, env: &SubstitutionEnv) -> Result<Conversion, ConvertError> {
    let extraction = extract::extract_from_path(path, options.extract_mode, env)?;
    let model = lower_spec(&extraction.spec);
    let node_type_name = node_type_name(path, options);
    let implementation = file_name(path);
    let wiring = Wiring::default();
    let cx = EmitContext { node_type_name: &node_type_name, implementation: &implementation, wiring: &wiring };
    let document = emit::render(&model, options.format, &cx)?;
    Ok(Conversion {
        document,
        node_type_name,
        parameters: extraction.spec.len(),
        source: extraction.source,
        miss: extraction.miss,
        diagnostics: extraction.diagnostics,
    })
}

pub fn convert_playbook(path: &Path, options: &ConvertOptions) -> Result<Conversion, ConvertError> {
    let inferred = playbook::infer_from_path(path)?;
    info!("{}: {} variable(s) inferred", path.display(), inferred.spec.len());
    let model = lower_spec(&inferred.spec);
    let node_type_name = node_type_name(path, options);
    let implementation = file_name(path);
    let cx = EmitContext { node_type_name: &node_type_name, implementation: &implementation, wiring: &inferred.wiring };
    let document = emit::render(&model, options.format, &cx)?;
    Ok(Conversion {
        document,
        node_type_name,
        parameters: inferred.spec.len(),
        source: None,
        miss: None,
        diagnostics: Vec::new(),
    })
}

/// `deploy_web-server.yml` → `DeployWebServer`.
pub fn derive_node_type_name(path: &Path) -> String {
    let stem = path.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    let name = stem.replace('.', " ").to_upper_camel_case();
    if name.is_empty() { "Node".to_string() } else { name }
}

// ————————————————————————————————————————————————————————————————————————————
// INTERNAL HELPERS
// ————————————————————————————————————————————————————————————————————————————

fn node_type_name(path: &Path, options: &ConvertOptions) -> String {
    match &options.node_type_name {
        Some(name) => name.clone(),
        None => derive_node_type_name(path),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name().map(|s| s.to_string_lossy().into_owned()).unwrap_or_else(|| path.display().to_string())
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn module_file(dir: &tempfile::TempDir, name: &str, src: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(src.as_bytes()).unwrap();
        path
    }

    const PORTS_MODULE: &str = "\
from ansible.module_utils.basic import AnsibleModule

def main():
    module = AnsibleModule(
        argument_spec=dict(
            name=dict(type='str', required=True),
            ports=dict(type='list', elements='dict', options=dict(
                from_port=dict(type='int'),
                to_port=dict(type='int'),
            )),
        ),
    )
    module.exit_json(changed=False)

if __name__ == '__main__':
    main()
";

    #[test]
    fn module_conversion_is_byte_identical_across_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = module_file(&dir, "port_rules.py", PORTS_MODULE);
        let env = SubstitutionEnv::default();
        for format in [OutputFormat::Tosca, OutputFormat::JsonSchema] {
            let options = ConvertOptions { format, ..Default::default() };
            let first = convert_module(&path, &options, &env).unwrap();
            let second = convert_module(&path, &options, &env).unwrap();
            assert_eq!(first.document, second.document);
            assert_eq!(first.node_type_name, "PortRules");
            assert_eq!(first.parameters, 2);
            assert!(matches!(first.source, Some(SpecSource::Dynamic { .. })));
        }
    }

    #[test]
    fn tosca_document_names_the_module() {
        let dir = tempfile::tempdir().unwrap();
        let path = module_file(&dir, "port_rules.py", PORTS_MODULE);
        let options = ConvertOptions { node_type_name: Some("acme.nodes.Ports".into()), ..Default::default() };
        let out = convert_module(&path, &options, &SubstitutionEnv::default()).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&out.document).unwrap();
        let create = &doc["node_types"]["acme.nodes.Ports"]["interfaces"]["Standard"]["operations"]["create"];
        assert_eq!(create["implementation"].as_str(), Some("port_rules.py"));
        assert_eq!(doc["data_types"]["Ports"]["properties"]["from_port"]["type"].as_str(), Some("integer"));
    }

    #[test]
    fn missing_spec_still_produces_an_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = module_file(&dir, "noop.py", "def main():\n    raise SystemExit(1)\n");
        let options = ConvertOptions { format: OutputFormat::JsonSchema, ..Default::default() };
        let out = convert_module(&path, &options, &SubstitutionEnv::default()).unwrap();
        assert!(out.miss.is_some());
        let doc: serde_json::Value = serde_json::from_str(&out.document).unwrap();
        assert_eq!(doc["properties"], serde_json::json!({}));
    }

    #[test]
    fn missing_input_is_a_hard_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = convert_module(&dir.path().join("absent.py"), &ConvertOptions::default(), &SubstitutionEnv::default())
            .unwrap_err();
        assert!(matches!(err, ConvertError::InputNotFound { .. }));
        let err = convert_playbook(&dir.path().join("absent.yml"), &ConvertOptions::default()).unwrap_err();
        assert!(matches!(err, ConvertError::InputNotFound { .. }));
    }

    #[test]
    fn playbook_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let path = module_file(
            &dir,
            "deploy_web-server.yml",
            "- hosts: web\n  vars:\n    user: deploy\n    home: \"/home/{{ user }}\"\n  tasks:\n    - command: whoami\n      register: who\n",
        );
        let out = convert_playbook(&path, &ConvertOptions::default()).unwrap();
        assert_eq!(out.node_type_name, "DeployWebServer");
        let doc: serde_yaml::Value = serde_yaml::from_str(&out.document).unwrap();
        let node = &doc["node_types"]["DeployWebServer"];
        assert_eq!(node["properties"]["user"]["default"].as_str(), Some("deploy"));
        assert!(node["attributes"]["who"].is_mapping());
        let home = &node["interfaces"]["Standard"]["operations"]["create"]["inputs"]["home"]["concat"];
        assert_eq!(home[0].as_str(), Some("/home/"));

        let bad = module_file(&dir, "bad.yml", "- vars: [1]\n");
        assert!(matches!(convert_playbook(&bad, &ConvertOptions::default()), Err(ConvertError::PlaybookParse { .. })));
    }

    #[test]
    fn node_type_names_from_file_names() {
        assert_eq!(derive_node_type_name(Path::new("dir/deploy_web-server.yml")), "DeployWebServer");
        assert_eq!(derive_node_type_name(Path::new("install-nginx.yaml")), "InstallNginx");
        assert_eq!(derive_node_type_name(Path::new("ec2_vpc.net.py")), "Ec2VpcNet");
    }
}
