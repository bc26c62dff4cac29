//! Top-level import extraction from Python source.
//!
//! Parses with tree-sitter and walks the whole tree, so imports nested in
//! functions, conditionals and `try` blocks are found too. Relative imports
//! (`from . import x`, `from ..pkg import y`) point inside the project and
//! are never reported.

use std::collections::BTreeSet;
use std::path::Path;
use tree_sitter::{Node, Parser, Tree};

use crate::model::ImportReference;
use crate::traits::ParseError;

#[derive(Debug, Clone, Copy, Default)]
pub struct ImportExtractor;

impl ImportExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Top-level module names imported by `source`.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidSyntax`] when the text is not valid Python.
    pub fn extract(&self, source: &str) -> Result<BTreeSet<String>, ParseError> {
        let tree = parse(source)?;
        let mut modules = BTreeSet::new();

        let mut stack = vec![tree.root_node()];
        while let Some(node) = stack.pop() {
            match node.kind() {
                "import_statement" => {
                    let mut cursor = node.walk();
                    for name in node.children_by_field_name("name", &mut cursor) {
                        let dotted = if name.kind() == "aliased_import" {
                            name.child_by_field_name("name")
                        } else {
                            Some(name)
                        };
                        if let Some(module) = dotted.and_then(|n| top_level(n, source)) {
                            modules.insert(module);
                        }
                    }
                }
                "import_from_statement" => {
                    // `relative_import` nodes carry leading dots and are skipped.
                    if let Some(module) = node
                        .child_by_field_name("module_name")
                        .filter(|n| n.kind() == "dotted_name")
                        .and_then(|n| top_level(n, source))
                    {
                        modules.insert(module);
                    }
                }
                "future_import_statement" => {
                    modules.insert("__future__".to_string());
                }
                _ => {
                    let mut cursor = node.walk();
                    stack.extend(node.named_children(&mut cursor));
                }
            }
        }

        Ok(modules)
    }

    /// Reads `path` and extracts its imports as [`ImportReference`]s.
    pub fn extract_file(&self, path: &Path) -> Result<Vec<ImportReference>, ParseError> {
        let bytes = std::fs::read(path)?;
        let source = String::from_utf8_lossy(&bytes);
        let modules = self.extract(&source)?;

        Ok(modules
            .into_iter()
            .map(|module| ImportReference {
                module,
                origin: path.to_path_buf(),
            })
            .collect())
    }
}

fn parse(source: &str) -> Result<Tree, ParseError> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| ParseError::Grammar(e.to_string()))?;

    let tree = parser
        .parse(source, None)
        .ok_or_else(|| ParseError::Grammar("parser returned no tree".to_string()))?;

    let root = tree.root_node();
    if root.has_error() {
        let (line, column) = first_error(root)
            .map(|n| (n.start_position().row + 1, n.start_position().column + 1))
            .unwrap_or((1, 1));
        return Err(ParseError::InvalidSyntax { line, column });
    }

    Ok(tree)
}

fn first_error(root: Node<'_>) -> Option<Node<'_>> {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node.is_error() || node.is_missing() {
            return Some(node);
        }
        if node.has_error() {
            let mut cursor = node.walk();
            let children: Vec<_> = node.children(&mut cursor).collect();
            stack.extend(children.into_iter().rev());
        }
    }
    None
}

/// First segment of a `dotted_name` node.
fn top_level(dotted: Node<'_>, source: &str) -> Option<String> {
    let first = dotted.named_child(0).unwrap_or(dotted);
    let text = first.utf8_text(source.as_bytes()).ok()?;
    let segment = text.split('.').next()?.trim();
    (!segment.is_empty()).then(|| segment.to_string())
}
