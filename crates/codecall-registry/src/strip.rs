//! Erasure of TypeScript-only syntax.
//!
//! Type syntax is overwritten with spaces in place rather than re-printed,
//! so byte offsets, line numbers, and therefore stack traces in the
//! resulting JavaScript line up with the original source. Newlines are
//! never touched.
//!
//! Constructs that have runtime semantics in TypeScript (enums, namespaces,
//! parameter properties, `import =`) cannot be erased and are reported as
//! unsupported.

use std::collections::HashSet;

use oxc_ast::ast::*;
use oxc_ast::visit::walk;
use oxc_ast::Visit;
use oxc_span::{GetSpan, Span};

/// An exported value binding of a module: `export { local as exported }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportBinding {
    /// Name visible to callers.
    pub exported: String,
    /// Name of the local binding.
    pub local: String,
}

/// Output of [`blank_types`].
#[derive(Debug, Clone)]
pub struct Blanked {
    /// JavaScript with type syntax replaced by whitespace and `export`
    /// keywords removed.
    pub code: String,
    /// Exported value bindings, in source order.
    pub exports: Vec<ExportBinding>,
}

/// Blank all TypeScript syntax in `source`, which `program` was parsed from.
///
/// Module syntax is reduced to plain declarations: `export` keywords and
/// local export lists are removed and their bindings returned in
/// [`Blanked::exports`]. Value imports, re-exports, and default exports are
/// rejected because the result runs as a classic script.
pub fn blank_types(source: &str, program: &Program<'_>) -> Result<Blanked, String> {
    let mut blanker = Blanker {
        out: source.as_bytes().to_vec(),
        exports: Vec::new(),
        type_names: collect_type_names(program),
        error: None,
    };
    blanker.visit_program(program);

    if let Some(err) = blanker.error {
        return Err(err);
    }

    let code = String::from_utf8(blanker.out)
        .map_err(|e| format!("type erasure produced invalid UTF-8: {e}"))?;
    Ok(Blanked {
        code,
        exports: blanker.exports,
    })
}

/// Names of top-level declarations that only exist at the type level.
fn collect_type_names(program: &Program<'_>) -> HashSet<String> {
    program
        .body
        .iter()
        .filter_map(|stmt| match stmt {
            Statement::ExportNamedDeclaration(e) => e.declaration.as_ref().and_then(type_name),
            Statement::TSInterfaceDeclaration(d) => Some(d.id.name.as_str()),
            Statement::TSTypeAliasDeclaration(d) => Some(d.id.name.as_str()),
            _ => None,
        })
        .map(str::to_string)
        .collect()
}

fn type_name<'d>(decl: &'d Declaration<'_>) -> Option<&'d str> {
    match decl {
        Declaration::TSInterfaceDeclaration(d) => Some(d.id.name.as_str()),
        Declaration::TSTypeAliasDeclaration(d) => Some(d.id.name.as_str()),
        _ => None,
    }
}

const MEMBER_MODIFIERS: &[&str] = &[
    "public",
    "private",
    "protected",
    "readonly",
    "override",
    "declare",
];

struct Blanker {
    out: Vec<u8>,
    exports: Vec<ExportBinding>,
    type_names: HashSet<String>,
    error: Option<String>,
}

impl Blanker {
    fn unsupported(&mut self, what: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(what.into());
        }
    }

    fn blank(&mut self, start: u32, end: u32) {
        let end = (end as usize).min(self.out.len());
        for b in &mut self.out[(start as usize).min(end)..end] {
            if *b != b'\n' && *b != b'\r' {
                *b = b' ';
            }
        }
    }

    fn blank_span(&mut self, span: Span) {
        self.blank(span.start, span.end);
    }

    /// Index of the last non-whitespace byte before `pos`.
    fn prev_token(&self, pos: u32) -> Option<usize> {
        self.out[..pos as usize]
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
    }

    /// Blank an annotation together with a preceding `:` and an optional or
    /// definite-assignment marker (`x?: T`, `x!: T`).
    fn blank_annotation(&mut self, span: Span) {
        self.blank_span(span);
        let mut pos = span.start;
        for marker in [b':', b'?'] {
            if let Some(i) = self.prev_token(pos) {
                if self.out[i] == marker || (marker == b'?' && self.out[i] == b'!') {
                    self.out[i] = b' ';
                    pos = i as u32;
                }
            }
        }
    }

    fn record_export(&mut self, exported: &str, local: &str) {
        if self.type_names.contains(local) || self.exports.iter().any(|e| e.exported == exported)
        {
            return;
        }
        self.exports.push(ExportBinding {
            exported: exported.to_string(),
            local: local.to_string(),
        });
    }

    fn record_declaration(&mut self, decl: &Declaration<'_>) {
        match decl {
            Declaration::FunctionDeclaration(f) => {
                if f.body.is_some() && !f.declare {
                    if let Some(id) = &f.id {
                        let name = id.name.to_string();
                        self.record_export(&name, &name);
                    }
                }
            }
            Declaration::VariableDeclaration(v) if !v.declare => {
                for d in &v.declarations {
                    match &d.id.kind {
                        BindingPatternKind::BindingIdentifier(id) => {
                            let name = id.name.to_string();
                            self.record_export(&name, &name);
                        }
                        _ => self.unsupported("destructuring in an exported declaration"),
                    }
                }
            }
            Declaration::ClassDeclaration(c) if !c.declare => {
                if let Some(id) = &c.id {
                    let name = id.name.to_string();
                    self.record_export(&name, &name);
                }
            }
            _ => {}
        }
    }

    /// Blank TypeScript modifiers at the start of a class member, stopping
    /// before the member key.
    fn blank_member_modifiers(&mut self, start: u32, key_start: u32) {
        let mut pos = start as usize;
        let limit = key_start as usize;
        while pos < limit {
            while pos < limit && self.out[pos].is_ascii_whitespace() {
                pos += 1;
            }
            let word_start = pos;
            while pos < limit && (self.out[pos].is_ascii_alphanumeric() || self.out[pos] == b'_') {
                pos += 1;
            }
            if word_start == pos {
                return;
            }
            let word = &self.out[word_start..pos];
            if MEMBER_MODIFIERS.iter().any(|m| m.as_bytes() == word) {
                self.blank(word_start as u32, pos as u32);
            } else if word != b"static" {
                return;
            }
        }
    }
}

impl<'a> Visit<'a> for Blanker {
    fn visit_statement(&mut self, it: &Statement<'a>) {
        match it {
            Statement::TSExportAssignment(_) => self.unsupported("`export =` assignments"),
            Statement::TSNamespaceExportDeclaration(_) => {
                self.unsupported("`export as namespace` declarations")
            }
            _ => walk::walk_statement(self, it),
        }
    }

    fn visit_declaration(&mut self, it: &Declaration<'a>) {
        match it {
            Declaration::TSTypeAliasDeclaration(d) => self.blank_span(d.span),
            Declaration::TSInterfaceDeclaration(d) => self.blank_span(d.span),
            Declaration::TSEnumDeclaration(d) => {
                self.unsupported(format!("enum '{}' (use a const object instead)", d.id.name))
            }
            Declaration::TSModuleDeclaration(d) => {
                if d.declare {
                    self.blank_span(d.span);
                } else {
                    self.unsupported("namespaces");
                }
            }
            Declaration::TSImportEqualsDeclaration(_) => {
                self.unsupported("`import x = require(...)` declarations")
            }
            Declaration::VariableDeclaration(d) if d.declare => self.blank_span(d.span),
            Declaration::FunctionDeclaration(f) if f.declare || f.body.is_none() => {
                self.blank_span(f.span)
            }
            Declaration::ClassDeclaration(c) if c.declare => self.blank_span(c.span),
            _ => walk::walk_declaration(self, it),
        }
    }

    fn visit_import_declaration(&mut self, it: &ImportDeclaration<'a>) {
        let type_only = it.import_kind.is_type()
            || it.specifiers.as_ref().is_some_and(|specs| {
                !specs.is_empty()
                    && specs.iter().all(|s| match s {
                        ImportDeclarationSpecifier::ImportSpecifier(s) => s.import_kind.is_type(),
                        _ => false,
                    })
            });
        if type_only {
            self.blank_span(it.span);
        } else {
            self.unsupported(format!(
                "value import from '{}' (function sources must be self-contained)",
                it.source.value
            ));
        }
    }

    fn visit_export_named_declaration(&mut self, it: &ExportNamedDeclaration<'a>) {
        if it.export_kind.is_type() {
            self.blank_span(it.span);
            return;
        }
        if it.source.is_some() {
            if !it.specifiers.is_empty() && it.specifiers.iter().all(|s| s.export_kind.is_type()) {
                self.blank_span(it.span);
            } else {
                self.unsupported("re-exports from another module");
            }
            return;
        }
        match &it.declaration {
            Some(decl) => {
                self.blank(it.span.start, decl.span().start);
                self.record_declaration(decl);
                self.visit_declaration(decl);
            }
            None => {
                for spec in &it.specifiers {
                    if spec.export_kind.is_type() {
                        continue;
                    }
                    let exported = spec.exported.name().to_string();
                    let local = spec.local.name().to_string();
                    self.record_export(&exported, &local);
                }
                self.blank_span(it.span);
            }
        }
    }

    fn visit_export_default_declaration(&mut self, _it: &ExportDefaultDeclaration<'a>) {
        self.unsupported("default exports (export a named function instead)");
    }

    fn visit_export_all_declaration(&mut self, _it: &ExportAllDeclaration<'a>) {
        self.unsupported("`export *` re-exports");
    }

    fn visit_ts_type_annotation(&mut self, it: &TSTypeAnnotation<'a>) {
        self.blank_annotation(it.span);
    }

    fn visit_ts_type_parameter_declaration(&mut self, it: &TSTypeParameterDeclaration<'a>) {
        self.blank_span(it.span);
    }

    fn visit_ts_type_parameter_instantiation(&mut self, it: &TSTypeParameterInstantiation<'a>) {
        self.blank_span(it.span);
    }

    fn visit_ts_as_expression(&mut self, it: &TSAsExpression<'a>) {
        self.blank(it.expression.span().end, it.span.end);
        self.visit_expression(&it.expression);
    }

    fn visit_ts_satisfies_expression(&mut self, it: &TSSatisfiesExpression<'a>) {
        self.blank(it.expression.span().end, it.span.end);
        self.visit_expression(&it.expression);
    }

    fn visit_ts_non_null_expression(&mut self, it: &TSNonNullExpression<'a>) {
        self.blank(it.expression.span().end, it.span.end);
        self.visit_expression(&it.expression);
    }

    fn visit_ts_type_assertion(&mut self, it: &TSTypeAssertion<'a>) {
        self.blank(it.span.start, it.expression.span().start);
        self.visit_expression(&it.expression);
    }

    fn visit_ts_class_implements(&mut self, it: &TSClassImplements<'a>) {
        self.blank_span(it.span);
        let Some(i) = self.prev_token(it.span.start) else {
            return;
        };
        if self.out[i] == b',' {
            self.out[i] = b' ';
        } else if i + 1 >= "implements".len()
            && &self.out[i + 1 - "implements".len()..=i] == b"implements"
        {
            self.blank((i + 1 - "implements".len()) as u32, (i + 1) as u32);
        }
    }

    fn visit_formal_parameter(&mut self, it: &FormalParameter<'a>) {
        if it.accessibility.is_some() || it.readonly {
            self.unsupported("constructor parameter properties");
            return;
        }
        if it.pattern.optional && it.pattern.type_annotation.is_none() {
            let from = it.pattern.kind.span().end;
            if let Some(offset) = self.out[from as usize..it.span.end as usize]
                .iter()
                .position(|b| *b == b'?')
            {
                let at = from + offset as u32;
                self.blank(at, at + 1);
            }
        }
        walk::walk_formal_parameter(self, it);
    }

    fn visit_class_element(&mut self, it: &ClassElement<'a>) {
        match it {
            ClassElement::TSIndexSignature(s) => self.blank_span(s.span),
            ClassElement::MethodDefinition(m) if m.value.body.is_none() => self.blank_span(m.span),
            ClassElement::PropertyDefinition(p) if p.declare => self.blank_span(p.span),
            ClassElement::MethodDefinition(m) => {
                if m.decorators.is_empty() {
                    self.blank_member_modifiers(m.span.start, m.key.span().start);
                }
                walk::walk_class_element(self, it);
            }
            ClassElement::PropertyDefinition(p) => {
                if p.decorators.is_empty() {
                    self.blank_member_modifiers(p.span.start, p.key.span().start);
                }
                walk::walk_class_element(self, it);
            }
            _ => walk::walk_class_element(self, it),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxc_allocator::Allocator;
    use oxc_parser::Parser;
    use oxc_span::SourceType;

    fn blank(src: &str) -> Result<Blanked, String> {
        let allocator = Allocator::default();
        let ret = Parser::new(&allocator, src, SourceType::ts()).parse();
        assert!(ret.errors.is_empty(), "parse errors: {:?}", ret.errors);
        blank_types(src, &ret.program)
    }

    fn squash(s: &str) -> String {
        s.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn preserves_length_and_lines() {
        let src = "export function double(x: number): number {\n  return x * 2;\n}\n";
        let out = blank(src).unwrap();
        assert_eq!(out.code.len(), src.len());
        assert_eq!(out.code.lines().count(), src.lines().count());
    }

    #[test]
    fn strips_annotations_and_export_keyword() {
        let src = "export function double(x: number): number { return x * 2; }";
        let out = blank(src).unwrap();
        assert_eq!(squash(&out.code), "function double(x ) { return x * 2; }");
        assert_eq!(
            out.exports,
            vec![ExportBinding {
                exported: "double".into(),
                local: "double".into()
            }]
        );
    }

    #[test]
    fn strips_optional_marker() {
        let out = blank("function f(a: string, b?: number) { return a; }").unwrap();
        assert!(!out.code.contains('?'), "got: {}", out.code);
        assert!(!out.code.contains(':'), "got: {}", out.code);
    }

    #[test]
    fn strips_interfaces_and_aliases() {
        let src = "interface User { id: number }\ntype Id = string;\nexport const get = (u: User): Id => String(u.id);";
        let out = blank(src).unwrap();
        assert!(!out.code.contains("interface"));
        assert!(!out.code.contains("type Id"));
        assert_eq!(out.exports.len(), 1);
        assert_eq!(out.exports[0].exported, "get");
    }

    #[test]
    fn strips_expression_level_types() {
        let src = "const a = (x as any) as string;\nconst b = y!;\nconst c = f<number>(1);\nconst d = z satisfies object;";
        let out = blank(src).unwrap();
        let code = squash(&out.code);
        assert!(!code.contains(" as "), "got: {code}");
        assert!(!code.contains('!'), "got: {code}");
        assert!(!code.contains('<'), "got: {code}");
        assert!(!code.contains("satisfies"), "got: {code}");
    }

    #[test]
    fn export_list_records_aliases_and_skips_types() {
        let src = "interface Shape { w: number }\nfunction area(s: Shape) { return s.w; }\nexport { area as computeArea, Shape };";
        let out = blank(src).unwrap();
        assert_eq!(
            out.exports,
            vec![ExportBinding {
                exported: "computeArea".into(),
                local: "area".into()
            }]
        );
        assert!(!out.code.contains("export"));
    }

    #[test]
    fn type_imports_are_erased() {
        let out = blank("import type { A } from './a';\nexport function f() { return 1; }").unwrap();
        assert!(!out.code.contains("import"));
    }

    #[test]
    fn value_imports_are_unsupported() {
        let err = blank("import { helper } from './helper';").unwrap_err();
        assert!(err.contains("value import"), "got: {err}");
    }

    #[test]
    fn enums_are_unsupported() {
        let err = blank("export enum Color { Red, Green }").unwrap_err();
        assert!(err.contains("enum 'Color'"), "got: {err}");
    }

    #[test]
    fn default_exports_are_unsupported() {
        let err = blank("export default function f() {}").unwrap_err();
        assert!(err.contains("default exports"), "got: {err}");
    }

    #[test]
    fn overload_signatures_are_erased() {
        let src = "export function f(x: string): string;\nexport function f(x: any) { return x; }";
        let out = blank(src).unwrap();
        assert_eq!(out.exports.len(), 1);
        let code = squash(&out.code);
        assert_eq!(code.matches("function").count(), 1, "got: {code}");
        assert!(code.ends_with("function f(x ) { return x; }"), "got: {code}");
    }

    #[test]
    fn class_member_modifiers_are_erased() {
        let src = "class Counter implements Tick {\n  private readonly step: number = 1;\n  public static zero = 0;\n  next(n: number): number { return n + this.step; }\n}";
        let out = blank(src).unwrap();
        let code = squash(&out.code);
        assert!(!code.contains("private"), "got: {code}");
        assert!(!code.contains("readonly"), "got: {code}");
        assert!(!code.contains("public"), "got: {code}");
        assert!(!code.contains("implements"), "got: {code}");
        assert!(code.contains("static zero = 0"), "got: {code}");
    }
}
