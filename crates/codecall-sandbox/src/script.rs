//! Turning submitted code into something the script context can run.
//!
//! A submission is one of:
//!
//! - a function expression, `async () => { ... }`, called with no arguments
//! - a single expression, `double(21)`, whose value is the result
//! - a function body using `return`, `return await double(21);`
//!
//! The forms are tried in that order. TypeScript annotations are blanked,
//! and the result is wrapped so that free identifiers resolve to registered
//! functions and the outcome reaches the settle hook exactly once.

use codecall_registry::strip;
use oxc_allocator::Allocator;
use oxc_ast::ast::{Expression, Statement};
use oxc_parser::Parser;
use oxc_span::SourceType;

use crate::error::SandboxError;

/// How the submission was interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptForm {
    /// A function expression, called with no arguments.
    Callable,
    /// A single expression.
    Expression,
    /// A function body.
    Body,
}

/// A submission ready for the executor.
#[derive(Debug, Clone)]
pub struct PreparedScript {
    /// JavaScript to evaluate as a classic script.
    pub source: String,
    /// The recognized form.
    pub form: ScriptForm,
}

/// Recognize the form of `code`, blank its type syntax, and wrap it.
///
/// Fails with [`SandboxError::Syntax`] if no form parses.
pub fn prepare(code: &str) -> Result<PreparedScript, SandboxError> {
    let callable = format!("(\n{code}\n)");
    if let Some(result) = try_form(&callable, ScriptForm::Callable) {
        return result;
    }

    let expression = format!(
        "(async () => (\n{}\n))",
        code.trim_end().trim_end_matches(';')
    );
    if let Some(result) = try_form(&expression, ScriptForm::Expression) {
        return result;
    }

    let body = format!("(async () => {{\n{code}\n}})");
    match try_form(&body, ScriptForm::Body) {
        Some(result) => result,
        None => Err(SandboxError::Syntax {
            message: first_error(&body),
        }),
    }
}

/// `None` if `wrapped` does not parse as `form`; otherwise the prepared
/// script or an erasure failure.
fn try_form(wrapped: &str, form: ScriptForm) -> Option<Result<PreparedScript, SandboxError>> {
    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, wrapped, SourceType::ts()).parse();
    if ret.panicked || !ret.errors.is_empty() {
        return None;
    }
    if form == ScriptForm::Callable && !is_function_expression(&ret.program.body) {
        return None;
    }

    let result = strip::blank_types(wrapped, &ret.program)
        .map_err(|message| SandboxError::Syntax { message })
        .and_then(|blanked| {
            check_javascript(&blanked.code)?;
            Ok(PreparedScript {
                source: wrap(&blanked.code),
                form,
            })
        });
    Some(result)
}

fn is_function_expression(body: &[Statement<'_>]) -> bool {
    let [Statement::ExpressionStatement(stmt)] = body else {
        return false;
    };
    let mut expr = &stmt.expression;
    while let Expression::ParenthesizedExpression(inner) = expr {
        expr = &inner.expression;
    }
    matches!(
        expr,
        Expression::ArrowFunctionExpression(_) | Expression::FunctionExpression(_)
    )
}

fn first_error(wrapped: &str) -> String {
    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, wrapped, SourceType::ts()).parse();
    ret.errors
        .first()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "code could not be parsed".into())
}

fn check_javascript(js: &str) -> Result<(), SandboxError> {
    let allocator = Allocator::default();
    let ret = Parser::new(&allocator, js, SourceType::mjs()).parse();
    match ret.errors.first() {
        Some(e) => Err(SandboxError::Syntax {
            message: format!("unsupported TypeScript syntax: {e}"),
        }),
        None if ret.panicked => Err(SandboxError::Syntax {
            message: "unsupported TypeScript syntax".into(),
        }),
        None => Ok(()),
    }
}

fn wrap(function_js: &str) -> String {
    format!("with (codecall.__scope) {{ codecall.__settle(() => ({function_js})()); }}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(code: &str) -> ScriptForm {
        prepare(code).unwrap().form
    }

    #[test]
    fn recognizes_callable_forms() {
        assert_eq!(form("async () => { return 1; }"), ScriptForm::Callable);
        assert_eq!(form("async function main() { return 1; }"), ScriptForm::Callable);
        assert_eq!(form("() => double(2)"), ScriptForm::Callable);
    }

    #[test]
    fn recognizes_expressions() {
        assert_eq!(form("double(21)"), ScriptForm::Expression);
        assert_eq!(form("await double(21);"), ScriptForm::Expression);
        assert_eq!(form("1 + 2 // trailing comment"), ScriptForm::Expression);
    }

    #[test]
    fn recognizes_bodies() {
        assert_eq!(form("return await double(21)"), ScriptForm::Body);
        assert_eq!(
            form("const a = await double(1);\nconst b = await double(2);\nreturn a + b;"),
            ScriptForm::Body
        );
    }

    #[test]
    fn wraps_in_scope_and_settle() {
        let prepared = prepare("return await double(21)").unwrap();
        assert!(prepared.source.starts_with("with (codecall.__scope) {"));
        assert!(prepared.source.contains("codecall.__settle(() => ((async () => {"));
        assert!(prepared.source.contains("return await double(21)"));
    }

    #[test]
    fn blanks_type_annotations() {
        let prepared = prepare(
            "const xs: number[] = [1, 2];\nconst total = (a: number, b: number): number => a + b;\nreturn total(xs[0], xs[1]);",
        )
        .unwrap();
        assert_eq!(prepared.form, ScriptForm::Body);
        assert!(!prepared.source.contains(": number"), "{}", prepared.source);
        assert!(prepared.source.contains("const xs"));
    }

    #[test]
    fn preserves_line_structure() {
        let code = "const a: number = 1;\n\nreturn a;";
        let prepared = prepare(code).unwrap();
        assert_eq!(
            prepared.source.matches('\n').count(),
            code.matches('\n').count() + 2
        );
    }

    #[test]
    fn syntax_errors_are_reported() {
        let err = prepare("return (1 +").unwrap_err();
        assert!(matches!(err, SandboxError::Syntax { .. }), "{err:?}");
        assert_eq!(err.kind(), codecall_error::ErrorKind::ScriptError);
    }
}
