//! Sandbox Harness.
//!
//! Runs a module's entry routine against the stand-ins of a
//! [`SubstitutionEnv`] and reports what the first stand-in constructor was
//! given. The run never leaves the interpreter: imports other than the
//! framework resolve to opaque values and nothing is read, written or spawned.
pub mod env;
mod interp;
mod value;

use std::fmt;

use indexmap::IndexMap;
use log::debug;

pub use env::{HelperDef, StandInDef, SubstitutionEnv};

use crate::ir::SpecValue;
use crate::pysrc::{self, ast};
use interp::{Flow, Interpreter};

/// Conventional name of a module's entry routine.
pub const ENTRY_ROUTINE: &str = "main";

/// Stack of the thread a sandboxed run gets. Call depth inside the run is
/// bounded by `SubstitutionEnv::max_call_depth`; this keeps that bound well
/// inside the stack regardless of the caller's thread.
pub const SANDBOX_STACK_SIZE: usize = 64 * 1024 * 1024;

/// What a stand-in constructor received.
#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    pub stand_in: String,                      // most specific stand-in in the instance's ancestry
    pub argument_spec: SpecValue,              // as passed, not yet normalized
    pub base_args: IndexMap<String, SpecValue>, // contributed by the stand-in ancestry
    pub constraints: IndexMap<String, SpecValue>, // mutually_exclusive, required_if, ...
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Success, // exit_json
    Failure, // fail_json
}

#[derive(Debug, Clone, PartialEq)]
pub enum SandboxOutcome {
    Captured(Capture),
    NotCaptured(MissReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MissReason {
    EntryMissing,
    Raised(String),
    Exited(ExitKind),
    /// The entry routine returned normally without constructing a stand-in
    /// or calling an exit.
    SandboxViolation,
    EmptySpecification,
    LoadFailed(String),
}

// ————————————————————————————————————————————————————————————————————————————
// IMPLEMENTATION
// ————————————————————————————————————————————————————————————————————————————

/// Load `source` and run its entry routine inside the sandbox, on a thread of
/// its own with [`SANDBOX_STACK_SIZE`] of stack.
pub fn run_source(source: &str, env: &SubstitutionEnv) -> SandboxOutcome {
    let run = || match pysrc::load(source) {
        Ok(module) => run_entry(&module, env),
        Err(err) => SandboxOutcome::NotCaptured(MissReason::LoadFailed(err.to_string())),
    };
    std::thread::scope(|scope| {
        let spawned = std::thread::Builder::new()
            .name("sandbox".into())
            .stack_size(SANDBOX_STACK_SIZE)
            .spawn_scoped(scope, run);
        match spawned {
            Ok(handle) => handle.join().unwrap_or_else(|_| {
                SandboxOutcome::NotCaptured(MissReason::Raised("sandbox thread panicked".to_string()))
            }),
            Err(err) => SandboxOutcome::NotCaptured(MissReason::Raised(format!("sandbox thread did not start: {err}"))),
        }
    })
}

/// Run the top level of `module`, then its entry routine. Stops at the first
/// stand-in construction.
fn run_entry(module: &ast::Module, env: &SubstitutionEnv) -> SandboxOutcome {
    let mut interp = Interpreter::new(env);
    if let Err(flow) = interp.run_module(module) {
        debug!("sandbox: module top level stopped the run");
        return settle(flow);
    }
    match interp.call_entry(ENTRY_ROUTINE) {
        None => SandboxOutcome::NotCaptured(MissReason::EntryMissing),
        Some(Ok(_)) => SandboxOutcome::NotCaptured(MissReason::SandboxViolation),
        Some(Err(flow)) => settle(flow),
    }
}

fn settle(flow: Flow) -> SandboxOutcome {
    let reason = match flow {
        Flow::Captured(capture) if capture.is_empty() => MissReason::EmptySpecification,
        Flow::Captured(capture) => return SandboxOutcome::Captured(capture),
        Flow::Exit(kind) => MissReason::Exited(kind),
        Flow::Error(message) => MissReason::Raised(message),
        Flow::Return(_) | Flow::Break | Flow::Continue => {
            MissReason::Raised("control flow escaped the entry routine".to_string())
        }
    };
    SandboxOutcome::NotCaptured(reason)
}

impl Capture {
    /// No module parameters and nothing inherited.
    pub fn is_empty(&self) -> bool {
        let no_params = match &self.argument_spec {
            SpecValue::Map(m) => m.is_empty(),
            _ => true,
        };
        no_params && self.base_args.is_empty()
    }
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExitKind::Success => "exit_json",
            ExitKind::Failure => "fail_json",
        })
    }
}

impl fmt::Display for MissReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissReason::EntryMissing => write!(f, "no `{ENTRY_ROUTINE}` routine"),
            MissReason::Raised(message) => write!(f, "entry routine raised: {message}"),
            MissReason::Exited(kind) => write!(f, "entry routine called {kind} before constructing the module"),
            MissReason::SandboxViolation => write!(f, "entry routine completed without constructing the module"),
            MissReason::EmptySpecification => write!(f, "captured argument_spec is empty"),
            MissReason::LoadFailed(message) => write!(f, "source could not be loaded: {message}"),
        }
    }
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(src: &str) -> Capture {
        match run_source(src, &SubstitutionEnv::default()) {
            SandboxOutcome::Captured(c) => c,
            SandboxOutcome::NotCaptured(reason) => panic!("not captured: {reason}"),
        }
    }

    fn miss(src: &str) -> MissReason {
        match run_source(src, &SubstitutionEnv::default()) {
            SandboxOutcome::Captured(c) => panic!("unexpected capture: {c:?}"),
            SandboxOutcome::NotCaptured(reason) => reason,
        }
    }

    fn keys(v: &SpecValue) -> Vec<String> {
        v.as_map().map(|m| m.keys().cloned().collect()).unwrap_or_default()
    }

    #[test]
    fn captures_standard_module_construction() {
        let c = capture(
            "\
from ansible.module_utils.basic import AnsibleModule

def main():
    module = AnsibleModule(
        argument_spec=dict(name=dict(type='str', required=True), state=dict(default='present')),
        mutually_exclusive=[['a', 'b']],
        supports_check_mode=True,
    )
    module.exit_json(changed=False)

if __name__ == '__main__':
    main()
",
        );
        assert_eq!(c.stand_in, "AnsibleModule");
        assert_eq!(keys(&c.argument_spec), ["name", "state"]);
        assert!(c.base_args.is_empty());
        assert!(c.constraints.contains_key("mutually_exclusive"));
    }

    #[test]
    fn vendor_module_contributes_base_args() {
        let c = capture(
            "\
from ansible_collections.amazon.aws.plugins.module_utils.modules import AnsibleAWSModule

def main():
    argument_spec = dict(bucket=dict(required=True))
    module = AnsibleAWSModule(argument_spec=argument_spec)
",
        );
        assert_eq!(c.stand_in, "AnsibleAWSModule");
        assert_eq!(keys(&c.argument_spec), ["bucket"]);
        assert!(c.base_args.contains_key("region"));
    }

    #[test]
    fn helper_spec_is_merged_by_module_code() {
        let c = capture(
            "\
from ansible.module_utils.ec2 import ec2_argument_spec
from ansible.module_utils.basic import AnsibleModule

def main():
    argument_spec = ec2_argument_spec()
    argument_spec.update(dict(instance_id=dict()))
    AnsibleModule(argument_spec)
",
        );
        let names = keys(&c.argument_spec);
        assert!(names.contains(&"access_key".to_string()));
        assert_eq!(names.last().map(String::as_str), Some("instance_id"));
    }

    #[test]
    fn subclass_with_super_init() {
        let c = capture(
            "\
from ansible.module_utils.basic import AnsibleModule

class K8sThing(AnsibleModule):
    def __init__(self, extra):
        spec = dict(kind=dict(type='str'))
        spec.update(extra)
        super(K8sThing, self).__init__(argument_spec=spec)

class Wrapper(K8sThing):
    def __init__(self):
        super().__init__({'namespace': {}})

def main():
    Wrapper()
",
        );
        assert_eq!(keys(&c.argument_spec), ["kind", "namespace"]);
    }

    #[test]
    fn composition_through_module_class_attribute() {
        let c = capture(
            "\
from ansible.module_utils.basic import AnsibleModule

class Base(object):
    module_class = AnsibleModule

    def __init__(self, spec):
        self.module = self.module_class(argument_spec=spec)

def main():
    Base(dict(path=dict(type='path')))
",
        );
        assert_eq!(keys(&c.argument_spec), ["path"]);
    }

    #[test]
    fn classified_misses() {
        assert_eq!(miss("x = 1\n"), MissReason::EntryMissing);
        assert!(matches!(miss("def main():\n    raise ValueError('no creds')\n"), MissReason::Raised(_)));
        assert_eq!(miss("def main():\n    return 1\n"), MissReason::SandboxViolation);
        assert_eq!(
            miss("from ansible.module_utils.basic import AnsibleModule\ndef main():\n    AnsibleModule(argument_spec={})\n"),
            MissReason::EmptySpecification
        );
        assert!(matches!(miss("x = '''never closed\n"), MissReason::LoadFailed(_)));
    }

    #[test]
    fn runaway_recursion_is_a_miss() {
        let reason = miss("def f(n):\n    return [f(n + 1)]\n\ndef main():\n    f(0)\n");
        assert_eq!(reason, MissReason::Raised("maximum call depth exceeded".into()));
    }

    #[test]
    fn self_referencing_spec_is_a_miss() {
        let reason = miss(
            "\
from ansible.module_utils.basic import AnsibleModule
def main():
    spec = dict(a=dict())
    spec['self'] = spec
    AnsibleModule(argument_spec=spec)
",
        );
        assert!(matches!(reason, MissReason::Raised(message) if message.contains("nesting")));
    }

    #[test]
    fn top_level_failures_are_tolerated() {
        let c = capture(
            "\
import boto3
HAS = undefined_name
from ansible.module_utils.basic import AnsibleModule
def main():
    AnsibleModule(argument_spec={'a': {}})
",
        );
        assert_eq!(keys(&c.argument_spec), ["a"]);
    }
}
