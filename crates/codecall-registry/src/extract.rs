//! Static extraction of exported function signatures.
//!
//! Only top-level declarations are considered. Interfaces and type aliases
//! declared in the same file are resolved; everything else that cannot be
//! reduced to a [`TypeTree`] becomes `unknown`.

use std::collections::HashMap;

use oxc_ast::ast::*;

use crate::descriptor::{FunctionDescriptor, Param};
use crate::strip::ExportBinding;
use crate::types::{PrimitiveKind, TypeTree};

/// Bound on alias/interface expansion depth.
const MAX_RESOLVE_DEPTH: usize = 32;

/// A top-level function-like binding.
#[derive(Clone, Copy)]
enum FnLike<'b, 'a> {
    Function(&'b Function<'a>),
    Arrow(&'b ArrowFunctionExpression<'a>),
}

impl<'b, 'a> FnLike<'b, 'a> {
    fn params(&self) -> &'b FormalParameters<'a> {
        match *self {
            Self::Function(f) => &f.params,
            Self::Arrow(a) => &a.params,
        }
    }

    fn return_type(&self) -> Option<&'b TSTypeAnnotation<'a>> {
        match *self {
            Self::Function(f) => f.return_type.as_deref(),
            Self::Arrow(a) => a.return_type.as_deref(),
        }
    }

    fn is_async(&self) -> bool {
        match self {
            Self::Function(f) => f.r#async,
            Self::Arrow(a) => a.r#async,
        }
    }

    fn is_generator(&self) -> bool {
        match self {
            Self::Function(f) => f.generator,
            Self::Arrow(_) => false,
        }
    }
}

#[derive(Clone, Copy)]
enum NamedType<'b, 'a> {
    Interface(&'b TSInterfaceDeclaration<'a>),
    Alias(&'b TSType<'a>),
}

/// Named types visible at the top level of one file.
struct TypeScope<'b, 'a> {
    named: HashMap<String, NamedType<'b, 'a>>,
    resolving: Vec<String>,
}

impl<'b, 'a> TypeScope<'b, 'a> {
    fn resolve(&mut self, ty: &TSType<'a>) -> TypeTree {
        if self.resolving.len() > MAX_RESOLVE_DEPTH {
            return TypeTree::unknown();
        }
        match ty {
            TSType::TSStringKeyword(_) => TypeTree::string(),
            TSType::TSNumberKeyword(_) => TypeTree::number(),
            TSType::TSBooleanKeyword(_) => TypeTree::boolean(),
            TSType::TSBigIntKeyword(_) => TypeTree::primitive(PrimitiveKind::Bigint),
            TSType::TSNullKeyword(_) => TypeTree::primitive(PrimitiveKind::Null),
            TSType::TSUndefinedKeyword(_) => TypeTree::primitive(PrimitiveKind::Undefined),
            TSType::TSVoidKeyword(_) => TypeTree::void(),
            TSType::TSAnyKeyword(_) => TypeTree::primitive(PrimitiveKind::Any),
            TSType::TSUnknownKeyword(_) => TypeTree::unknown(),
            TSType::TSNeverKeyword(_) => TypeTree::primitive(PrimitiveKind::Never),
            TSType::TSObjectKeyword(_) => TypeTree::record(TypeTree::unknown()),
            TSType::TSArrayType(a) => TypeTree::array(self.resolve(&a.element_type)),
            TSType::TSUnionType(u) => {
                let variants: Vec<TypeTree> = u.types.iter().map(|t| self.resolve(t)).collect();
                TypeTree::union(variants)
            }
            TSType::TSParenthesizedType(p) => self.resolve(&p.type_annotation),
            TSType::TSLiteralType(l) => match &l.literal {
                TSLiteral::StringLiteral(_) | TSLiteral::TemplateLiteral(_) => TypeTree::string(),
                TSLiteral::NumericLiteral(_) => TypeTree::number(),
                TSLiteral::BooleanLiteral(_) => TypeTree::boolean(),
                TSLiteral::BigIntLiteral(_) => TypeTree::primitive(PrimitiveKind::Bigint),
                TSLiteral::NullLiteral(_) => TypeTree::primitive(PrimitiveKind::Null),
                _ => TypeTree::unknown(),
            },
            TSType::TSTypeLiteral(t) => self.object_shape(&t.members),
            TSType::TSTypeReference(r) => self.resolve_reference(r),
            _ => TypeTree::unknown(),
        }
    }

    fn resolve_reference(&mut self, r: &TSTypeReference<'a>) -> TypeTree {
        let TSTypeName::IdentifierReference(id) = &r.type_name else {
            return TypeTree::unknown();
        };
        let name = id.name.as_str();
        let args: Vec<&TSType<'a>> = r
            .type_parameters
            .as_ref()
            .map(|p| p.params.iter().collect())
            .unwrap_or_default();
        let arg = |i: usize, scope: &mut Self| {
            args.get(i)
                .map(|t| scope.resolve(t))
                .unwrap_or_else(TypeTree::unknown)
        };

        match name {
            "Array" | "ReadonlyArray" => return TypeTree::array(arg(0, self)),
            "Promise" | "PromiseLike" => return TypeTree::promise(arg(0, self)),
            "Record" => return TypeTree::record(arg(1, self)),
            _ => {}
        }

        let Some(named) = self.named.get(name).copied() else {
            return TypeTree::unknown();
        };
        if self.resolving.iter().any(|n| n == name) {
            return TypeTree::unknown();
        }
        self.resolving.push(name.to_string());
        let resolved = match named {
            NamedType::Interface(decl) => self.object_shape(&decl.body.body),
            NamedType::Alias(ty) => self.resolve(ty),
        };
        self.resolving.pop();
        resolved
    }

    fn object_shape(&mut self, members: &[TSSignature<'a>]) -> TypeTree {
        let mut fields = Vec::new();
        let mut index = None;
        for member in members {
            match member {
                TSSignature::TSPropertySignature(p) => {
                    let Some(key) = property_key_name(&p.key) else {
                        continue;
                    };
                    let ty = p
                        .type_annotation
                        .as_ref()
                        .map(|a| self.resolve(&a.type_annotation))
                        .unwrap_or_else(TypeTree::unknown);
                    fields.push((key, ty, p.optional));
                }
                TSSignature::TSIndexSignature(s) => {
                    index = Some(self.resolve(&s.type_annotation.type_annotation));
                }
                _ => {}
            }
        }
        let mut shape = TypeTree::object(fields);
        if let (TypeTree::Object { index: slot, .. }, Some(ty)) = (&mut shape, index) {
            *slot = Some(Box::new(ty));
        }
        shape
    }
}

fn property_key_name(key: &PropertyKey<'_>) -> Option<String> {
    match key {
        PropertyKey::StaticIdentifier(id) => Some(id.name.to_string()),
        PropertyKey::StringLiteral(s) => Some(s.value.to_string()),
        _ => None,
    }
}

/// Type of a literal expression, if it is one.
fn literal_type(expr: &Expression<'_>) -> Option<TypeTree> {
    match expr {
        Expression::StringLiteral(_) | Expression::TemplateLiteral(_) => Some(TypeTree::string()),
        Expression::NumericLiteral(_) => Some(TypeTree::number()),
        Expression::BooleanLiteral(_) => Some(TypeTree::boolean()),
        Expression::NullLiteral(_) => Some(TypeTree::primitive(PrimitiveKind::Null)),
        Expression::BigIntLiteral(_) => Some(TypeTree::primitive(PrimitiveKind::Bigint)),
        Expression::ParenthesizedExpression(p) => literal_type(&p.expression),
        _ => None,
    }
}

/// Collect the inferred types of `return` statements, without descending
/// into nested functions. `None` marks a return whose type is not a literal.
fn collect_returns(stmts: &[Statement<'_>], out: &mut Vec<Option<TypeTree>>) {
    for stmt in stmts {
        collect_returns_in(stmt, out);
    }
}

fn collect_returns_in(stmt: &Statement<'_>, out: &mut Vec<Option<TypeTree>>) {
    match stmt {
        Statement::ReturnStatement(r) => out.push(match &r.argument {
            Some(arg) => literal_type(arg),
            None => Some(TypeTree::void()),
        }),
        Statement::BlockStatement(b) => collect_returns(&b.body, out),
        Statement::IfStatement(i) => {
            collect_returns_in(&i.consequent, out);
            if let Some(alt) = &i.alternate {
                collect_returns_in(alt, out);
            }
        }
        Statement::TryStatement(t) => {
            collect_returns(&t.block.body, out);
            if let Some(h) = &t.handler {
                collect_returns(&h.body.body, out);
            }
            if let Some(f) = &t.finalizer {
                collect_returns(&f.body, out);
            }
        }
        Statement::SwitchStatement(s) => {
            for case in &s.cases {
                collect_returns(&case.consequent, out);
            }
        }
        Statement::ForStatement(f) => collect_returns_in(&f.body, out),
        Statement::ForInStatement(f) => collect_returns_in(&f.body, out),
        Statement::ForOfStatement(f) => collect_returns_in(&f.body, out),
        Statement::WhileStatement(w) => collect_returns_in(&w.body, out),
        Statement::DoWhileStatement(d) => collect_returns_in(&d.body, out),
        Statement::LabeledStatement(l) => collect_returns_in(&l.body, out),
        _ => {}
    }
}

fn infer_return(f: FnLike<'_, '_>) -> TypeTree {
    let mut returns = Vec::new();
    match f {
        FnLike::Function(func) => {
            if let Some(body) = &func.body {
                collect_returns(&body.statements, &mut returns);
            }
        }
        FnLike::Arrow(arrow) => {
            if arrow.expression {
                let expr = arrow.body.statements.first().and_then(|s| match s {
                    Statement::ExpressionStatement(e) => Some(&e.expression),
                    _ => None,
                });
                returns.push(expr.and_then(literal_type));
            } else {
                collect_returns(&arrow.body.statements, &mut returns);
            }
        }
    }

    let Some(first) = returns.first() else {
        return TypeTree::void();
    };
    match first {
        Some(ty) if returns.iter().all(|r| r.as_ref() == Some(ty)) => ty.clone(),
        _ => TypeTree::unknown(),
    }
}

fn binding_name(pattern: &BindingPattern<'_>, index: usize) -> String {
    match &pattern.kind {
        BindingPatternKind::BindingIdentifier(id) => id.name.to_string(),
        _ => format!("arg{index}"),
    }
}

fn build_params<'a>(
    scope: &mut TypeScope<'_, 'a>,
    params: &FormalParameters<'a>,
) -> Result<Vec<Param>, String> {
    let mut out = Vec::with_capacity(params.items.len() + 1);

    for (i, param) in params.items.iter().enumerate() {
        let (pattern, default) = match &param.pattern.kind {
            BindingPatternKind::AssignmentPattern(a) => (&a.left, Some(&a.right)),
            _ => (&param.pattern, None),
        };
        let name = binding_name(pattern, i);
        let annotation = param
            .pattern
            .type_annotation
            .as_ref()
            .or(pattern.type_annotation.as_ref());

        let ty = match (annotation, default) {
            (Some(a), _) => scope.resolve(&a.type_annotation),
            (None, Some(expr)) => literal_type(expr)
                .ok_or_else(|| format!("parameter '{name}' has no type annotation"))?,
            (None, None) => return Err(format!("parameter '{name}' has no type annotation")),
        };

        let mut p = Param::new(name, ty);
        p.optional = param.pattern.optional || pattern.optional || default.is_some();
        out.push(p);
    }

    if let Some(rest) = &params.rest {
        let name = binding_name(&rest.argument, params.items.len());
        let ty = match rest.argument.type_annotation.as_ref() {
            Some(a) => match scope.resolve(&a.type_annotation) {
                array @ TypeTree::Array { .. } => array,
                _ => TypeTree::array(TypeTree::unknown()),
            },
            None => TypeTree::array(TypeTree::unknown()),
        };
        out.push(Param::new(name, ty).rest());
    }

    Ok(out)
}

fn describe_function<'a>(
    scope: &mut TypeScope<'_, 'a>,
    name: &str,
    source_file: &str,
    f: FnLike<'_, 'a>,
) -> Result<FunctionDescriptor, String> {
    if f.is_generator() {
        return Err("generator functions cannot be called remotely".into());
    }
    let params = build_params(scope, f.params())?;
    let mut return_type = match f.return_type() {
        Some(a) => scope.resolve(&a.type_annotation),
        None => infer_return(f),
    };
    if f.is_async() && !matches!(return_type, TypeTree::Promise { .. }) {
        return_type = TypeTree::promise(return_type);
    }
    Ok(FunctionDescriptor::new(name, params, return_type, source_file))
}

/// Top-level bindings of one file.
#[derive(Default)]
struct Locals<'b, 'a> {
    functions: HashMap<String, FnLike<'b, 'a>>,
    named: HashMap<String, NamedType<'b, 'a>>,
}

impl<'b, 'a> Locals<'b, 'a> {
    fn add_statement(&mut self, stmt: &'b Statement<'a>) {
        match stmt {
            Statement::ExportNamedDeclaration(e) => {
                if let Some(decl) = &e.declaration {
                    self.add_declaration(decl);
                }
            }
            Statement::FunctionDeclaration(f) => self.add_function(f),
            Statement::VariableDeclaration(v) => self.add_variables(v),
            Statement::TSInterfaceDeclaration(d) => {
                self.named
                    .insert(d.id.name.to_string(), NamedType::Interface(d));
            }
            Statement::TSTypeAliasDeclaration(d) => {
                self.named
                    .insert(d.id.name.to_string(), NamedType::Alias(&d.type_annotation));
            }
            _ => {}
        }
    }

    fn add_declaration(&mut self, decl: &'b Declaration<'a>) {
        match decl {
            Declaration::FunctionDeclaration(f) => self.add_function(f),
            Declaration::VariableDeclaration(v) => self.add_variables(v),
            Declaration::TSInterfaceDeclaration(d) => {
                self.named
                    .insert(d.id.name.to_string(), NamedType::Interface(d));
            }
            Declaration::TSTypeAliasDeclaration(d) => {
                self.named
                    .insert(d.id.name.to_string(), NamedType::Alias(&d.type_annotation));
            }
            _ => {}
        }
    }

    fn add_function(&mut self, f: &'b Function<'a>) {
        if let (Some(id), Some(_)) = (&f.id, &f.body) {
            self.functions
                .insert(id.name.to_string(), FnLike::Function(f));
        }
    }

    fn add_variables(&mut self, v: &'b VariableDeclaration<'a>) {
        for d in &v.declarations {
            let BindingPatternKind::BindingIdentifier(id) = &d.id.kind else {
                continue;
            };
            let f = match &d.init {
                Some(Expression::ArrowFunctionExpression(a)) => FnLike::Arrow(a),
                Some(Expression::FunctionExpression(f)) => FnLike::Function(f),
                _ => continue,
            };
            self.functions.insert(id.name.to_string(), f);
        }
    }
}

/// Build descriptors for every exported function of one parsed file.
///
/// Exports whose signature cannot be determined are skipped with a warning.
pub(crate) fn extract_functions(
    program: &Program<'_>,
    source_file: &str,
    exports: &[ExportBinding],
) -> Vec<FunctionDescriptor> {
    let mut locals = Locals::default();
    for stmt in &program.body {
        locals.add_statement(stmt);
    }
    let Locals { functions, named } = locals;

    let mut scope = TypeScope {
        named,
        resolving: Vec::new(),
    };

    let mut out = Vec::new();
    for export in exports {
        let Some(f) = functions.get(&export.local).copied() else {
            tracing::debug!(
                export = %export.exported,
                file = %source_file,
                "export is not a function, not registered"
            );
            continue;
        };
        match describe_function(&mut scope, &export.exported, source_file, f) {
            Ok(descriptor) => out.push(descriptor),
            Err(reason) => tracing::warn!(
                function = %export.exported,
                file = %source_file,
                %reason,
                "skipping function with no statically known signature"
            ),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strip::blank_types;
    use oxc_allocator::Allocator;
    use oxc_parser::Parser;
    use oxc_span::SourceType;

    fn extract(src: &str) -> Vec<FunctionDescriptor> {
        let allocator = Allocator::default();
        let ret = Parser::new(&allocator, src, SourceType::ts()).parse();
        assert!(ret.errors.is_empty(), "parse errors: {:?}", ret.errors);
        let blanked = blank_types(src, &ret.program).unwrap();
        extract_functions(&ret.program, "lib.ts", &blanked.exports)
    }

    fn one(src: &str) -> FunctionDescriptor {
        let mut all = extract(src);
        assert_eq!(all.len(), 1, "expected one descriptor, got {all:?}");
        all.remove(0)
    }

    #[test]
    fn annotated_function() {
        let d = one("export function double(x: number): number { return x * 2; }");
        assert_eq!(d.signature(), "double(x: number): number");
        assert_eq!(d.source_file, "lib.ts");
    }

    #[test]
    fn async_function_wraps_promise() {
        let d = one("export async function load(id: string): Promise<string[]> { return []; }");
        assert_eq!(d.return_type, TypeTree::promise(TypeTree::array(TypeTree::string())));

        let d = one("export async function ping(): string { return 'pong'; }");
        assert_eq!(d.return_type.to_string(), "Promise<string>");
    }

    #[test]
    fn arrow_exports() {
        let d = one("export const add = (a: number, b: number): number => a + b;");
        assert_eq!(d.signature(), "add(a: number, b: number): number");
    }

    #[test]
    fn interfaces_and_aliases_resolve() {
        let src = r#"
            interface User { id: number; name: string; email?: string }
            type Users = User[];
            export function save(users: Users): void {}
        "#;
        let d = one(src);
        let TypeTree::Array { element } = &d.parameter_types[0].ty else {
            panic!("expected array, got {:?}", d.parameter_types[0].ty);
        };
        let TypeTree::Object { fields, .. } = element.as_ref() else {
            panic!("expected object, got {element:?}");
        };
        assert_eq!(fields["id"].ty, TypeTree::number());
        assert!(fields["email"].optional);
        assert_eq!(d.return_type, TypeTree::void());
    }

    #[test]
    fn recursive_alias_terminates() {
        let src = r#"
            interface Node { value: number; children: Node[] }
            export function sum(n: Node): number { return 0; }
        "#;
        let d = one(src);
        let TypeTree::Object { fields, .. } = &d.parameter_types[0].ty else {
            panic!("expected object");
        };
        assert_eq!(
            fields["children"].ty,
            TypeTree::array(TypeTree::unknown())
        );
    }

    #[test]
    fn literal_and_union_types() {
        let d = one("export function pick(mode: 'fast' | 'slow', n: 1 | 2 | null): boolean { return true; }");
        assert_eq!(d.parameter_types[0].ty, TypeTree::string());
        assert_eq!(d.parameter_types[1].ty.to_string(), "number | null");
    }

    #[test]
    fn nullable_parameter_rejects_other_types() {
        let d = one("export function greet(name: string | null): string { return 'hi'; }");
        assert_eq!(d.signature(), "greet(name: string | null): string");
        assert!(d.validate_args(&[serde_json::json!("ada")]).is_ok());
        assert!(d.validate_args(&[serde_json::Value::Null]).is_ok());
        let err = d.validate_args(&[serde_json::json!(42)]).unwrap_err();
        assert_eq!(err.kind(), codecall_error::ErrorKind::InvalidArguments);
    }

    #[test]
    fn record_and_index_signatures() {
        let d = one("export function f(a: Record<string, number>, b: { [k: string]: boolean }): void {}");
        assert_eq!(d.parameter_types[0].ty, TypeTree::record(TypeTree::number()));
        assert_eq!(d.parameter_types[1].ty, TypeTree::record(TypeTree::boolean()));
    }

    #[test]
    fn defaults_infer_parameter_types() {
        let d = one("export function greet(name = 'world', times = 1) { return 'hi'; }");
        assert_eq!(d.signature(), "greet(name?: string, times?: number): string");
    }

    #[test]
    fn uninferable_parameter_skips_function() {
        let all = extract("export function loose(x) { return x; }\nexport function ok(): number { return 1; }");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "ok");
    }

    #[test]
    fn return_inference() {
        assert_eq!(one("export function a() {}").return_type, TypeTree::void());
        assert_eq!(
            one("export function b(x: boolean) { if (x) { return 1; } return 2; }").return_type,
            TypeTree::number()
        );
        assert_eq!(
            one("export function c(x: boolean) { if (x) return 1; return 'two'; }").return_type,
            TypeTree::unknown()
        );
        assert_eq!(
            one("export function d() { const inner = () => { return 'x'; }; return 5; }").return_type,
            TypeTree::number()
        );
        assert_eq!(one("export const e = () => 'x';").return_type, TypeTree::string());
    }

    #[test]
    fn rest_parameters() {
        let d = one("export function sum(...xs: number[]): number { return 0; }");
        assert!(d.parameter_types[0].rest);
        assert_eq!(d.signature(), "sum(...xs: number[]): number");
    }

    #[test]
    fn export_list_uses_exported_name() {
        let d = one("function internal(x: string): string { return x; }\nexport { internal as shout };");
        assert_eq!(d.name, "shout");
    }

    #[test]
    fn non_function_exports_are_ignored() {
        let all = extract("export const LIMIT = 5;\nexport function f(): number { return LIMIT; }");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "f");
    }

    #[test]
    fn generators_are_skipped() {
        assert!(extract("export function* gen(): Generator<number> { yield 1; }").is_empty());
    }
}
