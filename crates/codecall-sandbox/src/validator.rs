//! Pre-execution code validator.
//!
//! The V8 isolate and the permission profile are the real boundary. These
//! checks reject obvious escape attempts early with a readable message.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::SandboxError;

/// Maximum code size in bytes (64 KB).
pub const DEFAULT_MAX_CODE_SIZE: usize = 64 * 1024;

/// Maximum bracket nesting accepted before parsing.
pub const MAX_NESTING_DEPTH: usize = 256;

/// Patterns that are banned from script code, with the label reported.
///
/// Identifiers are matched on word boundaries so that registered functions
/// such as `getFunction(...)` or `data.process.status` are not rejected.
static BANNED_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("eval(", r"\beval\s*\("),
        ("Function(", r"\bFunction\s*\("),
        ("import(", r"\bimport\s*\("),
        ("require(", r"\brequire\s*\("),
        ("Deno.", r"\bDeno\s*\."),
        ("__proto__", r"__proto__"),
        ("constructor[", r"\bconstructor\s*\["),
        ("constructor.constructor", r"\bconstructor\s*\.\s*constructor\b"),
        ("Reflect.", r"\bReflect\s*\."),
        ("globalThis[", r"\bglobalThis\s*\["),
        ("String.fromCharCode", r"\bString\s*\.\s*fromCharCode\b"),
        (
            "process.*",
            r"\bprocess\s*\.\s*(env|exit|argv|stdin|stdout|stderr|kill|binding)\b",
        ),
    ]
    .into_iter()
    .map(|(label, re)| (label, Regex::new(re).unwrap()))
    .collect()
});

/// Validates script code before it reaches the parser or V8.
pub fn validate_code(code: &str, max_size: Option<usize>) -> Result<(), SandboxError> {
    let max = max_size.unwrap_or(DEFAULT_MAX_CODE_SIZE);

    if code.len() > max {
        return Err(SandboxError::CodeTooLarge {
            max,
            actual: code.len(),
        });
    }

    if code.trim().is_empty() {
        return Err(SandboxError::ValidationFailed {
            reason: "code is empty".into(),
        });
    }

    for (label, re) in BANNED_PATTERNS.iter() {
        if re.is_match(code) {
            return Err(SandboxError::BannedPattern {
                pattern: (*label).to_string(),
            });
        }
    }

    check_nesting_depth(code)
}

/// Reject code whose brackets nest deeper than [`MAX_NESTING_DEPTH`].
///
/// Brackets inside string literals and comments are ignored. Template
/// literal interpolation is treated as plain text.
fn check_nesting_depth(code: &str) -> Result<(), SandboxError> {
    let mut depth = 0usize;
    let mut chars = code.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' | '\'' | '`' => {
                let mut escaped = false;
                for c in chars.by_ref() {
                    if escaped {
                        escaped = false;
                    } else if c == '\\' {
                        escaped = true;
                    } else if c == ch {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'/') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
            }
            '(' | '[' | '{' => {
                depth += 1;
                if depth > MAX_NESTING_DEPTH {
                    return Err(SandboxError::ValidationFailed {
                        reason: format!("nesting depth exceeds {MAX_NESTING_DEPTH}"),
                    });
                }
            }
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn banned(code: &str) -> String {
        match validate_code(code, None) {
            Err(SandboxError::BannedPattern { pattern }) => pattern,
            other => panic!("expected banned pattern for {code:?}, got {other:?}"),
        }
    }

    #[test]
    fn accepts_plain_call() {
        assert!(validate_code("return await double(21);", None).is_ok());
    }

    #[test]
    fn accepts_async_arrow() {
        let code = r#"async () => {
            const [a, b] = await codecall.waitAll([functions.double(1), functions.double(2)]);
            return a + b;
        }"#;
        assert!(validate_code(code, None).is_ok());
    }

    #[test]
    fn rejects_empty_code() {
        assert!(validate_code("", None).is_err());
        assert!(matches!(
            validate_code(" \n\t ", None),
            Err(SandboxError::ValidationFailed { .. })
        ));
    }

    #[test]
    fn rejects_oversized_code() {
        let code = "1;".repeat(40_000);
        assert!(matches!(
            validate_code(&code, None),
            Err(SandboxError::CodeTooLarge { max: DEFAULT_MAX_CODE_SIZE, .. })
        ));
    }

    #[test]
    fn custom_max_size() {
        let code = "x".repeat(100);
        assert!(validate_code(&code, Some(50)).is_err());
        assert!(validate_code(&code, Some(200)).is_ok());
    }

    #[test]
    fn rejects_escape_patterns() {
        assert_eq!(banned("return eval('1+1')"), "eval(");
        assert_eq!(banned("return new Function ('return this')()"), "Function(");
        assert_eq!(banned("const m = await import('node:fs')"), "import(");
        assert_eq!(banned("require('fs')"), "require(");
        assert_eq!(banned("Deno.exit(1)"), "Deno.");
        assert_eq!(banned("({}).__proto__.x = 1"), "__proto__");
        assert_eq!(banned("x.constructor['constructor']"), "constructor[");
        assert_eq!(
            banned("''.constructor.constructor('return this')()"),
            "constructor.constructor"
        );
        assert_eq!(banned("Reflect.ownKeys(globalThis)"), "Reflect.");
        assert_eq!(banned("globalThis['ev' + 'al']"), "globalThis[");
        assert_eq!(banned("String.fromCharCode(101)"), "String.fromCharCode");
        assert_eq!(banned("return process.env.TOKEN"), "process.*");
    }

    #[test]
    fn identifier_boundaries_avoid_false_positives() {
        assert!(validate_code("return await getFunction('x')", None).is_ok());
        assert!(validate_code("return await loadRequirement(1)", None).is_ok());
        assert!(validate_code("return data.process.status", None).is_ok());
        assert!(validate_code("return obj.constructor.name", None).is_ok());
        assert!(validate_code("return await retrieval(2)", None).is_ok());
    }

    #[test]
    fn rejects_deep_nesting() {
        let code = format!("return {}1{};", "[".repeat(300), "]".repeat(300));
        let err = validate_code(&code, None).unwrap_err();
        assert!(err.to_string().contains("nesting depth"), "{err}");
    }

    #[test]
    fn brackets_in_strings_and_comments_do_not_count() {
        let opens = "(".repeat(300);
        let code = format!(
            "// {opens}\n/* {opens} */\nreturn '{opens}' + \"{opens}\" + `{opens}`;"
        );
        assert!(validate_code(&code, None).is_ok());
    }
}
