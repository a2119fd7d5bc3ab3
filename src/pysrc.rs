//! Source Loader.
//!
//! Turns module source text into a lenient AST. Loading never runs anything;
//! only a lexical error (an unterminated string, a dedent that matches no outer
//! level) or runaway nesting fails the load. Everything else outside the
//! supported subset is kept as an opaque node.
pub mod ast;
pub mod lexer;
pub mod parser;

pub use lexer::LexError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LoadError {
    #[error(transparent)]
    Lex(#[from] LexError),
    #[error("line {line}: nesting exceeds {} levels", parser::MAX_NESTING)]
    TooDeep { line: usize },
}

/// Tokenize and parse a module.
pub fn load(source: &str) -> Result<ast::Module, LoadError> {
    let tokens = lexer::tokenize(source)?;
    parser::parse_tokens(tokens).map_err(|line| LoadError::TooDeep { line })
}

// ------------------------------- Tests ------------------------------------ //

#[cfg(test)]
mod tests {
    use super::ast::{Expr, Stmt};
    use super::*;

    #[test]
    fn loads_a_typical_module_layout() {
        let src = r#"#!/usr/bin/python
# -*- coding: utf-8 -*-
from __future__ import absolute_import, division, print_function
__metaclass__ = type

DOCUMENTATION = r'''
module: demo
'''

from ansible.module_utils.basic import AnsibleModule


def run_module():
    module_args = dict(
        name=dict(type='str', required=True),
        new=dict(type='bool', required=False, default=False)
    )
    result = dict(changed=False, original_message='', message='')
    module = AnsibleModule(argument_spec=module_args, supports_check_mode=True)
    if module.check_mode:
        module.exit_json(**result)
    module.exit_json(**result)


def main():
    run_module()


if __name__ == '__main__':
    main()
"#;
        let module = load(src).unwrap();
        let defs: Vec<&str> = module
            .body
            .iter()
            .filter_map(|s| match s {
                Stmt::FunctionDef(f) => Some(f.name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(defs, ["run_module", "main"]);
        assert!(!module.body.iter().any(|s| matches!(s, Stmt::Opaque { .. })));
    }

    #[test]
    fn walk_visits_nested_calls() {
        let module = load("def f():\n    g(h(argument_spec={}))\n").unwrap();
        let mut calls = 0;
        module.walk_exprs(&mut |e| {
            if matches!(e, Expr::Call { .. }) {
                calls += 1;
            }
        });
        assert_eq!(calls, 2);
    }

    #[test]
    fn lexical_errors_fail_the_load() {
        assert!(matches!(load("x = 'oops\n"), Err(LoadError::Lex(_))));
    }

    #[test]
    fn deep_nesting_fails_the_load() {
        let src = format!("x = {}1{}\nargument_spec = dict(a=dict())\n", "[".repeat(300), "]".repeat(300));
        assert_eq!(load(&src), Err(LoadError::TooDeep { line: 1 }));
    }
}
