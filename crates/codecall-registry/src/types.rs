//! Tagged type trees describing function parameters and return values.
//!
//! A [`TypeTree`] is the structural shape of a TypeScript type as far as it
//! matters for values that cross the dispatch boundary as JSON. Trees are
//! serialized with a `kind` tag so clients can walk them without a schema.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum depth [`TypeTree::check`] descends into a value.
pub const MAX_CHECK_DEPTH: usize = 64;

/// Primitive type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveKind {
    /// `string`
    String,
    /// `number`
    Number,
    /// `boolean`
    Boolean,
    /// `bigint`
    Bigint,
    /// `null`
    Null,
    /// `undefined`
    Undefined,
    /// `void`
    Void,
    /// `any`
    Any,
    /// `unknown`
    Unknown,
    /// `never`
    Never,
}

impl PrimitiveKind {
    /// The TypeScript keyword for this primitive.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Bigint => "bigint",
            Self::Null => "null",
            Self::Undefined => "undefined",
            Self::Void => "void",
            Self::Any => "any",
            Self::Unknown => "unknown",
            Self::Never => "never",
        }
    }
}

/// A field of an object shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    /// Field type.
    #[serde(rename = "type")]
    pub ty: TypeTree,
    /// Whether the field may be absent.
    #[serde(default, skip_serializing_if = "is_false")]
    pub optional: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Recursive structural type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum TypeTree {
    /// A primitive keyword type.
    Primitive {
        /// Which primitive.
        name: PrimitiveKind,
    },
    /// `T[]`, `Array<T>`, `ReadonlyArray<T>`.
    Array {
        /// Element type.
        element: Box<TypeTree>,
    },
    /// An object shape with named fields and an optional index signature.
    Object {
        /// Named fields, ordered by name.
        fields: BTreeMap<String, Field>,
        /// Type of values under the string index signature, if declared.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<Box<TypeTree>>,
    },
    /// `A | B | ...`
    Union {
        /// Alternatives, in declaration order.
        variants: Vec<TypeTree>,
    },
    /// `Promise<T>`.
    Promise {
        /// The resolved value type.
        resolved: Box<TypeTree>,
    },
}

impl TypeTree {
    /// A primitive type.
    pub fn primitive(name: PrimitiveKind) -> Self {
        Self::Primitive { name }
    }

    /// `string`
    pub fn string() -> Self {
        Self::primitive(PrimitiveKind::String)
    }

    /// `number`
    pub fn number() -> Self {
        Self::primitive(PrimitiveKind::Number)
    }

    /// `boolean`
    pub fn boolean() -> Self {
        Self::primitive(PrimitiveKind::Boolean)
    }

    /// `unknown`
    pub fn unknown() -> Self {
        Self::primitive(PrimitiveKind::Unknown)
    }

    /// `void`
    pub fn void() -> Self {
        Self::primitive(PrimitiveKind::Void)
    }

    /// `T[]`
    pub fn array(element: TypeTree) -> Self {
        Self::Array {
            element: Box::new(element),
        }
    }

    /// `Promise<T>`
    pub fn promise(resolved: TypeTree) -> Self {
        Self::Promise {
            resolved: Box::new(resolved),
        }
    }

    /// A union. Nested unions are flattened, duplicates dropped, and a
    /// single remaining variant is returned as-is.
    pub fn union(variants: impl IntoIterator<Item = TypeTree>) -> Self {
        let mut flat: Vec<TypeTree> = Vec::new();
        for v in variants {
            let parts = match v {
                Self::Union { variants } => variants,
                other => vec![other],
            };
            for p in parts {
                if !flat.contains(&p) {
                    flat.push(p);
                }
            }
        }
        if flat.len() == 1 {
            flat.remove(0)
        } else {
            Self::Union { variants: flat }
        }
    }

    /// An object shape from `(name, type, optional)` triples.
    pub fn object<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, TypeTree, bool)>,
        S: Into<String>,
    {
        Self::Object {
            fields: fields
                .into_iter()
                .map(|(name, ty, optional)| (name.into(), Field { ty, optional }))
                .collect(),
            index: None,
        }
    }

    /// `Record<string, T>`
    pub fn record(value: TypeTree) -> Self {
        Self::Object {
            fields: BTreeMap::new(),
            index: Some(Box::new(value)),
        }
    }

    /// Whether the type accepts an absent value (`undefined`, `void`, `any`,
    /// `unknown`, or a union containing one of them).
    pub fn accepts_absent(&self) -> bool {
        match self {
            Self::Primitive { name } => matches!(
                name,
                PrimitiveKind::Undefined
                    | PrimitiveKind::Void
                    | PrimitiveKind::Any
                    | PrimitiveKind::Unknown
            ),
            Self::Union { variants } => variants.iter().any(TypeTree::accepts_absent),
            _ => false,
        }
    }

    /// Check a JSON value against this type.
    ///
    /// JSON has no `undefined`, so `undefined` and `void` accept `null`.
    /// `bigint` accepts integral numbers and decimal digit strings. A
    /// `Promise<T>` in value position is checked as `T`.
    pub fn check(&self, value: &Value) -> Result<(), TypeMismatch> {
        let mut path = String::new();
        self.check_at(value, &mut path, 0)
    }

    fn check_at(&self, value: &Value, path: &mut String, depth: usize) -> Result<(), TypeMismatch> {
        if depth > MAX_CHECK_DEPTH {
            return Err(TypeMismatch {
                path: path.clone(),
                expected: format!("at most {MAX_CHECK_DEPTH} levels of nesting"),
                found: "a deeper value".into(),
            });
        }

        let mismatch = |path: &String| TypeMismatch {
            path: path.clone(),
            expected: self.to_string(),
            found: describe(value).into(),
        };

        match self {
            Self::Primitive { name } => {
                let ok = match name {
                    PrimitiveKind::Any | PrimitiveKind::Unknown => true,
                    PrimitiveKind::Never => false,
                    PrimitiveKind::String => value.is_string(),
                    PrimitiveKind::Number => value.is_number(),
                    PrimitiveKind::Boolean => value.is_boolean(),
                    PrimitiveKind::Null
                    | PrimitiveKind::Undefined
                    | PrimitiveKind::Void => value.is_null(),
                    PrimitiveKind::Bigint => match value {
                        Value::Number(n) => n.is_i64() || n.is_u64(),
                        Value::String(s) => {
                            let digits = s.strip_prefix('-').unwrap_or(s);
                            !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
                        }
                        _ => false,
                    },
                };
                if ok {
                    Ok(())
                } else {
                    Err(mismatch(path))
                }
            }
            Self::Array { element } => {
                let Value::Array(items) = value else {
                    return Err(mismatch(path));
                };
                for (i, item) in items.iter().enumerate() {
                    let len = path.len();
                    path.push_str(&format!("[{i}]"));
                    element.check_at(item, path, depth + 1)?;
                    path.truncate(len);
                }
                Ok(())
            }
            Self::Object { fields, index } => {
                let Value::Object(map) = value else {
                    return Err(mismatch(path));
                };
                for (name, field) in fields {
                    let len = path.len();
                    path.push('.');
                    path.push_str(name);
                    match map.get(name) {
                        None => {
                            if !field.optional && !field.ty.accepts_absent() {
                                return Err(TypeMismatch {
                                    path: path.clone(),
                                    expected: field.ty.to_string(),
                                    found: "nothing (missing field)".into(),
                                });
                            }
                        }
                        Some(Value::Null) if field.optional => {}
                        Some(v) => field.ty.check_at(v, path, depth + 1)?,
                    }
                    path.truncate(len);
                }
                if let Some(index) = index {
                    for (key, v) in map.iter().filter(|(k, _)| !fields.contains_key(*k)) {
                        let len = path.len();
                        path.push('.');
                        path.push_str(key);
                        index.check_at(v, path, depth + 1)?;
                        path.truncate(len);
                    }
                }
                Ok(())
            }
            Self::Union { variants } => {
                if variants
                    .iter()
                    .any(|v| v.check_at(value, &mut path.clone(), depth + 1).is_ok())
                {
                    Ok(())
                } else {
                    Err(mismatch(path))
                }
            }
            Self::Promise { resolved } => resolved.check_at(value, path, depth + 1),
        }
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl fmt::Display for TypeTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primitive { name } => f.write_str(name.as_str()),
            Self::Array { element } => match element.as_ref() {
                Self::Union { .. } => write!(f, "({element})[]"),
                _ => write!(f, "{element}[]"),
            },
            Self::Object { fields, index } => {
                if fields.is_empty() && index.is_none() {
                    return f.write_str("{}");
                }
                f.write_str("{ ")?;
                let mut first = true;
                for (name, field) in fields {
                    if !first {
                        f.write_str("; ")?;
                    }
                    first = false;
                    let mark = if field.optional { "?" } else { "" };
                    write!(f, "{name}{mark}: {}", field.ty)?;
                }
                if let Some(index) = index {
                    if !first {
                        f.write_str("; ")?;
                    }
                    write!(f, "[key: string]: {index}")?;
                }
                f.write_str(" }")
            }
            Self::Union { variants } => {
                for (i, v) in variants.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" | ")?;
                    }
                    write!(f, "{v}")?;
                }
                Ok(())
            }
            Self::Promise { resolved } => write!(f, "Promise<{resolved}>"),
        }
    }
}

/// A value did not match its declared type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeMismatch {
    /// Location inside the value, e.g. `.user.tags[2]`. Empty for the root.
    pub path: String,
    /// Rendered expected type.
    pub expected: String,
    /// What was found instead.
    pub found: String,
}

impl fmt::Display for TypeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "expected {}, got {}", self.expected, self.found)
        } else {
            write!(
                f,
                "at {}: expected {}, got {}",
                self.path, self.expected, self.found
            )
        }
    }
}

impl std::error::Error for TypeMismatch {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_with_kind_tag() {
        let ty = TypeTree::array(TypeTree::number());
        let json = serde_json::to_value(&ty).unwrap();
        assert_eq!(
            json,
            json!({"kind": "Array", "element": {"kind": "Primitive", "name": "number"}})
        );
    }

    #[test]
    fn object_serializes_optional_fields() {
        let ty = TypeTree::object([("id", TypeTree::number(), false), ("tag", TypeTree::string(), true)]);
        let json = serde_json::to_value(&ty).unwrap();
        assert_eq!(json["kind"], "Object");
        assert!(json["fields"]["id"].get("optional").is_none());
        assert_eq!(json["fields"]["tag"]["optional"], true);
        assert!(json.get("index").is_none());
    }

    #[test]
    fn union_flattens_and_dedupes() {
        let ty = TypeTree::union([
            TypeTree::string(),
            TypeTree::union([TypeTree::number(), TypeTree::string()]),
        ]);
        assert_eq!(
            ty,
            TypeTree::Union {
                variants: vec![TypeTree::string(), TypeTree::number()]
            }
        );
        assert_eq!(TypeTree::union([TypeTree::number()]), TypeTree::number());
    }

    #[test]
    fn display_renders_typescript() {
        let ty = TypeTree::promise(TypeTree::array(TypeTree::union([
            TypeTree::string(),
            TypeTree::number(),
        ])));
        assert_eq!(ty.to_string(), "Promise<(string | number)[]>");

        let obj = TypeTree::object([("a", TypeTree::number(), false), ("b", TypeTree::string(), true)]);
        assert_eq!(obj.to_string(), "{ a: number; b?: string }");
        assert_eq!(TypeTree::record(TypeTree::boolean()).to_string(), "{ [key: string]: boolean }");
    }

    #[test]
    fn check_primitives() {
        assert!(TypeTree::number().check(&json!(21)).is_ok());
        assert!(TypeTree::number().check(&json!("21")).is_err());
        assert!(TypeTree::string().check(&json!("x")).is_ok());
        assert!(TypeTree::boolean().check(&json!(true)).is_ok());
        assert!(TypeTree::void().check(&Value::Null).is_ok());
        assert!(TypeTree::unknown().check(&json!({"a": [1]})).is_ok());
        assert!(TypeTree::primitive(PrimitiveKind::Never).check(&Value::Null).is_err());
    }

    #[test]
    fn check_bigint_leniency() {
        let ty = TypeTree::primitive(PrimitiveKind::Bigint);
        assert!(ty.check(&json!(9007199254740993u64)).is_ok());
        assert!(ty.check(&json!("-123456789012345678901234567890")).is_ok());
        assert!(ty.check(&json!(1.5)).is_err());
        assert!(ty.check(&json!("12a")).is_err());
        assert!(ty.check(&json!("-")).is_err());
    }

    #[test]
    fn check_reports_path() {
        let ty = TypeTree::object([(
            "user",
            TypeTree::object([("tags", TypeTree::array(TypeTree::string()), false)]),
            false,
        )]);
        let err = ty
            .check(&json!({"user": {"tags": ["a", "b", 3]}}))
            .unwrap_err();
        assert_eq!(err.path, ".user.tags[2]");
        assert_eq!(err.expected, "string");
        assert_eq!(err.found, "number");
    }

    #[test]
    fn check_missing_and_optional_fields() {
        let ty = TypeTree::object([("id", TypeTree::number(), false), ("note", TypeTree::string(), true)]);
        assert!(ty.check(&json!({"id": 1})).is_ok());
        assert!(ty.check(&json!({"id": 1, "note": null})).is_ok());
        let err = ty.check(&json!({"note": "x"})).unwrap_err();
        assert_eq!(err.path, ".id");
        assert!(err.found.contains("missing"));
    }

    #[test]
    fn check_index_signature_covers_extra_keys() {
        let ty = TypeTree::record(TypeTree::number());
        assert!(ty.check(&json!({"a": 1, "b": 2})).is_ok());
        assert!(ty.check(&json!({"a": 1, "b": "two"})).is_err());
    }

    #[test]
    fn check_union_accepts_any_variant() {
        let ty = TypeTree::union([TypeTree::string(), TypeTree::primitive(PrimitiveKind::Null)]);
        assert!(ty.check(&json!("x")).is_ok());
        assert!(ty.check(&Value::Null).is_ok());
        let err = ty.check(&json!(1)).unwrap_err();
        assert_eq!(err.expected, "string | null");
    }

    #[test]
    fn check_depth_is_bounded() {
        let mut ty = TypeTree::unknown();
        let mut value = json!(1);
        for _ in 0..(MAX_CHECK_DEPTH + 2) {
            ty = TypeTree::array(ty);
            value = json!([value]);
        }
        let err = ty.check(&value).unwrap_err();
        assert!(err.expected.contains("levels of nesting"));
    }
}
