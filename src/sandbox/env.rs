//! Substitution environment: the stand-in framework types and spec helpers
//! that replace the real automation framework while a module is evaluated.
//!
//! The environment is immutable data. Every sandboxed run builds its own
//! class objects from it, so one environment can be shared across threads.

use indexmap::IndexMap;
use serde_json::{Value, json};

use crate::ir::SpecValue;

/// A stand-in for a framework base type.
#[derive(Debug, Clone)]
pub struct StandInDef {
    pub name: String,
    pub parent: Option<String>, // another stand-in this one derives from
    pub base_args: Value,       // parameters contributed by this level of ancestry
}

/// A framework function returning a ready-made partial spec, optionally merged
/// with the keyword arguments it was called with.
#[derive(Debug, Clone)]
pub struct HelperDef {
    pub name: String,
    pub args: Value,
    pub merge_keywords: bool,
}

#[derive(Debug, Clone)]
pub struct SubstitutionEnv {
    stand_ins: IndexMap<String, StandInDef>,
    helpers: IndexMap<String, HelperDef>,
    pub step_limit: usize,
    pub max_call_depth: usize,
}

// ————————————————————————————————————————————————————————————————————————————
// IMPLEMENTATION
// ————————————————————————————————————————————————————————————————————————————

impl SubstitutionEnv {
    /// An environment without any stand-ins or helpers.
    pub fn empty() -> Self {
        Self {
            stand_ins: IndexMap::new(),
            helpers: IndexMap::new(),
            step_limit: 200_000,
            max_call_depth: 64,
        }
    }

    pub fn register_stand_in(&mut self, def: StandInDef) -> &mut Self {
        self.stand_ins.insert(def.name.clone(), def);
        self
    }

    pub fn register_helper(&mut self, def: HelperDef) -> &mut Self {
        self.helpers.insert(def.name.clone(), def);
        self
    }

    pub fn stand_in(&self, name: &str) -> Option<&StandInDef> {
        self.stand_ins.get(name)
    }

    pub fn stand_ins(&self) -> impl Iterator<Item = &StandInDef> {
        self.stand_ins.values()
    }

    pub(crate) fn helper_index(&self, name: &str) -> Option<usize> {
        self.helpers.get_index_of(name)
    }

    pub(crate) fn helper_at(&self, index: usize) -> Option<&HelperDef> {
        self.helpers.get_index(index).map(|(_, h)| h)
    }

    /// Stand-ins in parent-first order, so a parent class object exists before
    /// its children are built.
    pub(crate) fn stand_ins_parent_first(&self) -> Vec<&StandInDef> {
        let mut ordered: Vec<&StandInDef> = Vec::new();
        let mut pending: Vec<&StandInDef> = self.stand_ins.values().collect();
        while !pending.is_empty() {
            let before = pending.len();
            pending.retain(|def| {
                let ready = def
                    .parent
                    .as_ref()
                    .is_none_or(|p| ordered.iter().any(|o| &o.name == p) || self.stand_ins.get(p).is_none());
                if ready {
                    ordered.push(def);
                }
                !ready
            });
            if pending.len() == before {
                // parent cycle; build the rest without parents
                ordered.extend(pending.drain(..));
            }
        }
        ordered
    }

    /// Imports from these module paths resolve through the environment.
    pub fn is_framework_module(&self, module: &str) -> bool {
        module == "ansible"
            || module.starts_with("ansible.")
            || module.starts_with("ansible_collections.")
            || module.starts_with('.')
    }
}

impl StandInDef {
    pub fn new(name: impl Into<String>, parent: Option<&str>, base_args: Value) -> Self {
        Self { name: name.into(), parent: parent.map(str::to_string), base_args }
    }

    pub(crate) fn base_spec(&self) -> SpecValue {
        SpecValue::from_json(&self.base_args)
    }
}

impl HelperDef {
    pub(crate) fn spec(&self) -> SpecValue {
        SpecValue::from_json(&self.args)
    }
}

impl Default for SubstitutionEnv {
    fn default() -> Self {
        let mut env = Self::empty();
        env.register_stand_in(StandInDef::new("AnsibleModule", None, json!({})))
            .register_stand_in(StandInDef::new("AnsibleAWSModule", Some("AnsibleModule"), aws_common_args()))
            .register_stand_in(StandInDef::new("AnsibleK8SModule", Some("AnsibleModule"), k8s_auth_args()))
            .register_helper(HelperDef {
                name: "ec2_argument_spec".into(),
                args: aws_common_args(),
                merge_keywords: false,
            })
            .register_helper(HelperDef {
                name: "aws_argument_spec".into(),
                args: aws_common_args(),
                merge_keywords: false,
            })
            .register_helper(HelperDef {
                name: "openstack_full_argument_spec".into(),
                args: openstack_cloud_args(),
                merge_keywords: true,
            });
        env
    }
}

// ————————————————————————————————————————————————————————————————————————————
// INTERNAL HELPERS
// ————————————————————————————————————————————————————————————————————————————

fn aws_common_args() -> Value {
    json!({
        "access_key": {"aliases": ["aws_access_key_id", "aws_access_key", "ec2_access_key"], "no_log": false},
        "secret_key": {"aliases": ["aws_secret_access_key", "aws_secret_key", "ec2_secret_key"], "no_log": true},
        "session_token": {"aliases": ["aws_session_token", "security_token", "access_token"], "no_log": true},
        "profile": {"aliases": ["aws_profile"]},
        "endpoint_url": {"aliases": ["aws_endpoint_url", "ec2_url", "s3_url"]},
        "validate_certs": {"type": "bool", "default": true},
        "aws_ca_bundle": {"type": "path"},
        "aws_config": {"type": "dict"},
        "debug_botocore_endpoint_logs": {"type": "bool", "default": false},
        "region": {"aliases": ["aws_region", "ec2_region"]}
    })
}

fn k8s_auth_args() -> Value {
    json!({
        "kubeconfig": {"type": "raw"},
        "context": {},
        "host": {},
        "api_key": {"no_log": true},
        "username": {},
        "password": {"no_log": true},
        "validate_certs": {"type": "bool", "aliases": ["verify_ssl"]},
        "ca_cert": {"type": "path", "aliases": ["ssl_ca_cert"]},
        "client_cert": {"type": "path", "aliases": ["cert_file"]},
        "client_key": {"type": "path", "aliases": ["key_file"], "no_log": true},
        "proxy": {},
        "persist_config": {"type": "bool"}
    })
}

fn openstack_cloud_args() -> Value {
    json!({
        "cloud": {"type": "raw"},
        "auth_type": {},
        "auth": {"type": "dict", "no_log": true},
        "region_name": {},
        "validate_certs": {"type": "bool", "aliases": ["verify"]},
        "ca_cert": {"aliases": ["cacert"]},
        "client_cert": {"aliases": ["cert"]},
        "client_key": {"no_log": true, "aliases": ["key"]},
        "wait": {"type": "bool", "default": true},
        "timeout": {"type": "int", "default": 180},
        "api_timeout": {"type": "int"},
        "interface": {"default": "public", "choices": ["admin", "internal", "public"], "aliases": ["endpoint_type"]}
    })
}

// ------------------------------- Tests ------------------------------------ //
