//! Syntax-aware boundaries via tree-sitter.
//!
//! Used by the extractor to find the smallest definition enclosing a change,
//! and by the synthesis driver to reject generated tests that do not parse.

use serde::{Deserialize, Serialize};
use tree_sitter::{Node, Parser};

use crate::domain::unit::{Param, UnitKind, UnitSignature};

/// Source languages the engine recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Python,
    Rust,
    JavaScript,
    TypeScript,
    Go,
    Shell,
}

impl Language {
    pub fn from_path(path: &str) -> Option<Language> {
        let ext = path.rsplit_once('.').map(|(_, ext)| ext)?;
        match ext {
            "py" | "pyi" => Some(Language::Python),
            "rs" => Some(Language::Rust),
            "js" | "mjs" | "cjs" | "jsx" => Some(Language::JavaScript),
            "ts" | "mts" | "cts" => Some(Language::TypeScript),
            "go" => Some(Language::Go),
            "sh" | "bash" => Some(Language::Shell),
            _ => None,
        }
    }

    /// File extension used for generated test files.
    pub fn extension(&self) -> &'static str {
        match self {
            Language::Python => "py",
            Language::Rust => "rs",
            Language::JavaScript => "js",
            Language::TypeScript => "ts",
            Language::Go => "go",
            Language::Shell => "sh",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Rust => "rust",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Go => "go",
            Language::Shell => "shell",
        }
    }

    fn grammar(&self) -> Option<tree_sitter::Language> {
        match self {
            Language::Python => Some(tree_sitter_python::LANGUAGE.into()),
            Language::Rust => Some(tree_sitter_rust::LANGUAGE.into()),
            Language::JavaScript => Some(tree_sitter_javascript::LANGUAGE.into()),
            Language::TypeScript => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
            Language::Go => Some(tree_sitter_go::LANGUAGE.into()),
            Language::Shell => None,
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A definition found in a source file. Lines are 1-based and inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinitionSpan {
    pub kind: UnitKind,
    /// Dotted path from the outermost definition, e.g. `Reader.read`.
    pub symbol: String,
    pub start_line: u32,
    pub end_line: u32,
    pub depth: usize,
    pub signature: UnitSignature,
}

impl DefinitionSpan {
    pub fn contains_line(&self, line: u32) -> bool {
        line >= self.start_line && line <= self.end_line
    }

    pub fn len(&self) -> u32 {
        self.end_line - self.start_line + 1
    }
}

/// Result of checking a source text against its grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyntaxCheck {
    Valid,
    Invalid { line: u32, column: u32, detail: String },
    /// No grammar available for the language.
    Unsupported,
}

/// Every definition in `source`, ordered by start line (outer before inner).
///
/// Returns `None` when the language has no grammar, parsing fails, or the
/// tree contains syntax errors; callers degrade to whole-file handling.
pub fn definition_spans(language: Language, source: &str) -> Option<Vec<DefinitionSpan>> {
    let grammar = language.grammar()?;
    let mut parser = Parser::new();
    parser.set_language(&grammar).ok()?;
    let tree = parser.parse(source, None)?;
    let root = tree.root_node();
    if root.has_error() {
        return None;
    }

    let mut spans = Vec::new();
    collect(language, root, source.as_bytes(), &Scope::root(), &mut spans);
    spans.sort_by(|a, b| {
        a.start_line
            .cmp(&b.start_line)
            .then(b.end_line.cmp(&a.end_line))
            .then(a.depth.cmp(&b.depth))
    });
    Some(spans)
}

/// The innermost span containing `line`.
pub fn innermost_at(spans: &[DefinitionSpan], line: u32) -> Option<&DefinitionSpan> {
    spans
        .iter()
        .filter(|s| s.contains_line(line))
        .max_by(|a, b| a.depth.cmp(&b.depth).then(b.len().cmp(&a.len())))
}

/// Check whether `source` parses cleanly.
pub fn check_syntax(language: Language, source: &str) -> SyntaxCheck {
    let Some(grammar) = language.grammar() else {
        return SyntaxCheck::Unsupported;
    };
    let mut parser = Parser::new();
    if parser.set_language(&grammar).is_err() {
        return SyntaxCheck::Unsupported;
    }
    let Some(tree) = parser.parse(source, None) else {
        return SyntaxCheck::Invalid {
            line: 1,
            column: 1,
            detail: "parser produced no tree".to_string(),
        };
    };
    let root = tree.root_node();
    if !root.has_error() {
        return SyntaxCheck::Valid;
    }
    match first_error(root) {
        Some(node) => {
            let pos = node.start_position();
            let detail = if node.is_missing() {
                format!("missing `{}`", node.kind())
            } else {
                let text = node
                    .utf8_text(source.as_bytes())
                    .unwrap_or_default()
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                format!("unexpected `{text}`")
            };
            SyntaxCheck::Invalid {
                line: pos.row as u32 + 1,
                column: pos.column as u32 + 1,
                detail,
            }
        }
        None => SyntaxCheck::Invalid {
            line: 1,
            column: 1,
            detail: "syntax error".to_string(),
        },
    }
}

fn first_error(node: Node<'_>) -> Option<Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    for i in 0..node.child_count() {
        if let Some(child) = node.child(i) {
            if child.has_error() || child.is_missing() {
                if let Some(found) = first_error(child) {
                    return Some(found);
                }
            }
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Definition walk
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Callable,
    Container,
    /// Prefixes nested names but is not a unit itself (Rust `mod`).
    Namespace,
}

struct Scope {
    prefix: String,
    parent_role: Option<Role>,
    depth: usize,
}

impl Scope {
    fn root() -> Self {
        Self {
            prefix: String::new(),
            parent_role: None,
            depth: 0,
        }
    }

    fn qualify(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.prefix, name)
        }
    }
}

struct Definition<'t> {
    role: Role,
    name: String,
    /// Node whose range defines the unit (includes decorators).
    outer: Node<'t>,
    /// Node whose children hold nested definitions and the signature.
    inner: Node<'t>,
    /// Go methods are methods regardless of lexical nesting.
    force_method: bool,
}

fn collect(language: Language, node: Node<'_>, src: &[u8], scope: &Scope, out: &mut Vec<DefinitionSpan>) {
    for i in 0..node.named_child_count() {
        let Some(child) = node.named_child(i) else {
            continue;
        };
        match classify(language, child, src) {
            Some(def) => {
                let symbol = scope.qualify(&def.name);
                if def.role != Role::Namespace {
                    let kind = match def.role {
                        Role::Container => UnitKind::Class,
                        _ if def.force_method || scope.parent_role == Some(Role::Container) => {
                            UnitKind::Method
                        }
                        _ => UnitKind::Function,
                    };
                    let (start_line, end_line) = line_range(def.outer);
                    out.push(DefinitionSpan {
                        kind,
                        symbol: symbol.clone(),
                        start_line,
                        end_line,
                        depth: scope.depth,
                        signature: signature_of(language, def.inner, src),
                    });
                }
                let nested = Scope {
                    prefix: symbol,
                    parent_role: Some(def.role),
                    depth: scope.depth + 1,
                };
                collect(language, def.inner, src, &nested, out);
            }
            None => collect(language, child, src, scope, out),
        }
    }
}

fn classify<'t>(language: Language, node: Node<'t>, src: &[u8]) -> Option<Definition<'t>> {
    let named = |role: Role, outer: Node<'t>, inner: Node<'t>| -> Option<Definition<'t>> {
        let name = field_text(inner, "name", src)?;
        Some(Definition {
            role,
            name,
            outer,
            inner,
            force_method: false,
        })
    };

    match (language, node.kind()) {
        (Language::Python, "function_definition") => named(Role::Callable, node, node),
        (Language::Python, "class_definition") => named(Role::Container, node, node),
        (Language::Python, "decorated_definition") => {
            let inner = node.child_by_field_name("definition")?;
            let role = if inner.kind() == "class_definition" {
                Role::Container
            } else {
                Role::Callable
            };
            named(role, node, inner)
        }

        (Language::Rust, "function_item") => named(Role::Callable, node, node),
        (Language::Rust, "struct_item" | "enum_item" | "trait_item") => {
            named(Role::Container, node, node)
        }
        (Language::Rust, "mod_item") => named(Role::Namespace, node, node),
        (Language::Rust, "impl_item") => {
            let name = field_text(node, "type", src)?;
            Some(Definition {
                role: Role::Container,
                name,
                outer: node,
                inner: node,
                force_method: false,
            })
        }

        (Language::Go, "function_declaration") => named(Role::Callable, node, node),
        (Language::Go, "method_declaration") => {
            let method = field_text(node, "name", src)?;
            let name = match field_text(node, "receiver", src).and_then(|r| receiver_type(&r)) {
                Some(receiver) => format!("{receiver}.{method}"),
                None => method,
            };
            Some(Definition {
                role: Role::Callable,
                name,
                outer: node,
                inner: node,
                force_method: true,
            })
        }
        (Language::Go, "type_declaration") => {
            let spec = (0..node.named_child_count())
                .filter_map(|i| node.named_child(i))
                .find(|c| c.kind() == "type_spec")?;
            let name = field_text(spec, "name", src)?;
            Some(Definition {
                role: Role::Container,
                name,
                outer: node,
                inner: node,
                force_method: false,
            })
        }

        (
            Language::JavaScript | Language::TypeScript,
            "function_declaration" | "generator_function_declaration" | "method_definition",
        ) => named(Role::Callable, node, node),
        (
            Language::JavaScript | Language::TypeScript,
            "class_declaration" | "abstract_class_declaration" | "interface_declaration",
        ) => named(Role::Container, node, node),
        (Language::JavaScript | Language::TypeScript, "lexical_declaration") => {
            // `const f = (..) => {..}` and `const f = function (..) {..}`
            let declarator = (0..node.named_child_count())
                .filter_map(|i| node.named_child(i))
                .find(|c| c.kind() == "variable_declarator")?;
            let value = declarator.child_by_field_name("value")?;
            if !matches!(value.kind(), "arrow_function" | "function_expression" | "function") {
                return None;
            }
            let name = field_text(declarator, "name", src)?;
            Some(Definition {
                role: Role::Callable,
                name,
                outer: node,
                inner: value,
                force_method: false,
            })
        }

        _ => None,
    }
}

fn line_range(node: Node<'_>) -> (u32, u32) {
    let start = node.start_position();
    let end = node.end_position();
    let end_row = if end.column == 0 && end.row > start.row {
        end.row
    } else {
        end.row + 1
    };
    (start.row as u32 + 1, end_row as u32)
}

fn field_text(node: Node<'_>, field: &str, src: &[u8]) -> Option<String> {
    node.child_by_field_name(field)
        .and_then(|n| n.utf8_text(src).ok())
        .map(|s| s.trim().to_string())
}

fn node_text(node: Node<'_>, src: &[u8]) -> String {
    node.utf8_text(src).unwrap_or_default().trim().to_string()
}

/// `(s *Server)` -> `Server`
fn receiver_type(receiver: &str) -> Option<String> {
    let inner = receiver.trim().trim_start_matches('(').trim_end_matches(')');
    let ty = inner.split_whitespace().last()?;
    let ty = ty.trim_start_matches('*');
    let ty = ty.split('[').next().unwrap_or(ty);
    if ty.is_empty() {
        None
    } else {
        Some(ty.to_string())
    }
}

fn strip_annotation(raw: String) -> String {
    raw.trim_start_matches(':').trim().to_string()
}

fn signature_of(language: Language, node: Node<'_>, src: &[u8]) -> UnitSignature {
    let header = node
        .utf8_text(src)
        .unwrap_or_default()
        .lines()
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();

    let params = node
        .child_by_field_name("parameters")
        .map(|list| {
            (0..list.named_child_count())
                .filter_map(|i| list.named_child(i))
                .filter(|p| p.kind() != "comment")
                .map(|p| param_of(language, p, src))
                .collect()
        })
        .unwrap_or_default();

    let returns_field = match language {
        Language::Go => "result",
        _ => "return_type",
    };
    let returns = field_text(node, returns_field, src).map(strip_annotation);

    UnitSignature {
        header,
        params,
        returns,
    }
}

fn param_of(language: Language, node: Node<'_>, src: &[u8]) -> Param {
    let whole = || Param {
        name: node_text(node, src),
        annotation: None,
    };

    match (language, node.kind()) {
        (_, "identifier") => whole(),
        (Language::Python, "typed_parameter") => {
            let name = node
                .named_child(0)
                .map(|n| node_text(n, src))
                .unwrap_or_else(|| node_text(node, src));
            Param {
                name,
                annotation: field_text(node, "type", src),
            }
        }
        (Language::Python, "default_parameter" | "typed_default_parameter") => Param {
            name: field_text(node, "name", src).unwrap_or_else(|| node_text(node, src)),
            annotation: field_text(node, "type", src),
        },
        (Language::Rust, "parameter") => Param {
            name: field_text(node, "pattern", src).unwrap_or_else(|| node_text(node, src)),
            annotation: field_text(node, "type", src),
        },
        (Language::Rust, "self_parameter") => Param {
            name: "self".to_string(),
            annotation: Some(node_text(node, src)),
        },
        (Language::Go, "parameter_declaration" | "variadic_parameter_declaration") => Param {
            name: field_text(node, "name", src).unwrap_or_default(),
            annotation: field_text(node, "type", src),
        },
        (
            Language::JavaScript | Language::TypeScript,
            "required_parameter" | "optional_parameter",
        ) => Param {
            name: field_text(node, "pattern", src).unwrap_or_else(|| node_text(node, src)),
            annotation: field_text(node, "type", src).map(strip_annotation),
        },
        (Language::JavaScript | Language::TypeScript, "assignment_pattern") => Param {
            name: field_text(node, "left", src).unwrap_or_else(|| node_text(node, src)),
            annotation: None,
        },
        _ => whole(),
    }
}
