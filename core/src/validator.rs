//! Fast syntactic pre-check of submitted code, plus advisory pattern
//! warnings.
//!
//! Parsing happens in-process with the tree-sitter R grammar; the child is
//! never spawned for validation. Warnings are plain substring matches
//! against identifiers that commonly request OS resources; they are advisory
//! only and never block execution.

use tree_sitter::Node;
use tree_sitter::Parser;
use tree_sitter_r::LANGUAGE as R;

/// Identifiers whose presence in code triggers an advisory warning. Not a
/// security contract; the sandbox is.
const OS_RESOURCE_IDENTIFIERS: &[&str] = &[
    "system",
    "system2",
    "shell",
    "file.remove",
    "unlink",
    "download.file",
    "url",
    "socketConnection",
    "Sys.setenv",
    "setwd",
    "install.packages",
    "dyn.load",
    ".Internal",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub valid: bool,
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

pub fn validate(code: &str) -> Validation {
    let error = parse_error(code);
    let warnings = advisory_warnings(code);
    Validation {
        valid: error.is_none(),
        error,
        warnings,
    }
}

fn parse_error(code: &str) -> Option<String> {
    let mut parser = Parser::new();
    if parser.set_language(&R.into()).is_err() {
        // Grammar failed to load; the pre-check cannot run. The child's own
        // parser is still authoritative, so fail open.
        return None;
    }
    let tree = parser.parse(code, None)?;
    let root = tree.root_node();
    if !root.has_error() {
        return None;
    }
    let message = match first_error_node(root) {
        Some(node) => {
            let start = node.start_position();
            if node.is_missing() {
                format!(
                    "incomplete expression at line {}, column {}",
                    start.row + 1,
                    start.column + 1
                )
            } else {
                format!(
                    "unexpected token at line {}, column {}",
                    start.row + 1,
                    start.column + 1
                )
            }
        }
        None => "code failed to parse".to_string(),
    };
    Some(message)
}

fn first_error_node(node: Node) -> Option<Node> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    if !node.has_error() {
        return None;
    }
    let mut cursor = node.walk();
    let children: Vec<Node> = node.children(&mut cursor).collect();
    children.into_iter().find_map(first_error_node)
}

fn advisory_warnings(code: &str) -> Vec<String> {
    OS_RESOURCE_IDENTIFIERS
        .iter()
        .filter(|identifier| code.contains(*identifier))
        .map(|identifier| format!("code references '{identifier}'"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_code_is_valid() {
        let result = validate("x <- 1 + 1\nsum(x, 2)");
        assert!(result.valid);
        assert_eq!(result.error, None);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn broken_code_reports_a_position() {
        let result = validate("f <- function(a {\n  a + 1\n}");
        assert!(!result.valid);
        let error = result.error.expect("parse error");
        assert!(error.contains("line"), "{error}");
    }

    #[test]
    fn unterminated_call_is_invalid() {
        let result = validate("mean(c(1, 2");
        assert!(!result.valid);
    }

    #[test]
    fn os_identifiers_warn_but_do_not_block() {
        let result = validate("system(\"ls -la\")");
        assert!(result.valid, "warnings are advisory only");
        assert!(
            result
                .warnings
                .iter()
                .any(|w| w.contains("'system'")),
            "{:?}",
            result.warnings
        );
    }

    #[test]
    fn warning_set_matches_substrings() {
        let result = validate("curl::curl(\"https://example.com\")");
        // "url" is a substring of "curl"; advisory matches are deliberately
        // coarse.
        assert!(result.warnings.iter().any(|w| w.contains("'url'")));
    }
}
