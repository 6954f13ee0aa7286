//! Function descriptors: the discovery record for one callable function.

use codecall_error::CallError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::TypeTree;

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Param {
    /// Parameter name. Destructured parameters are named `argN`.
    pub name: String,
    /// Declared or inferred type. For a rest parameter this is the array type.
    #[serde(rename = "type")]
    pub ty: TypeTree,
    /// `x?: T` or a parameter with a default value.
    #[serde(default, skip_serializing_if = "is_false")]
    pub optional: bool,
    /// `...xs: T[]`
    #[serde(default, skip_serializing_if = "is_false")]
    pub rest: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Param {
    /// A required parameter.
    pub fn new(name: impl Into<String>, ty: TypeTree) -> Self {
        Self {
            name: name.into(),
            ty,
            optional: false,
            rest: false,
        }
    }

    /// Mark the parameter optional.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Mark the parameter as a rest parameter.
    pub fn rest(mut self) -> Self {
        self.rest = true;
        self
    }
}

/// A callable function as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDescriptor {
    /// Unique function name.
    pub name: String,
    /// Ordered parameters.
    pub parameter_types: Vec<Param>,
    /// Return type. Async functions return `Promise<T>`.
    pub return_type: TypeTree,
    /// Source file relative to the registry root.
    pub source_file: String,
}

impl FunctionDescriptor {
    /// Create a descriptor.
    pub fn new(
        name: impl Into<String>,
        parameter_types: Vec<Param>,
        return_type: TypeTree,
        source_file: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            parameter_types,
            return_type,
            source_file: source_file.into(),
        }
    }

    /// TypeScript-like signature, e.g. `double(x: number): number`.
    pub fn signature(&self) -> String {
        let params = self
            .parameter_types
            .iter()
            .map(|p| {
                let dots = if p.rest { "..." } else { "" };
                let mark = if p.optional && !p.rest { "?" } else { "" };
                format!("{dots}{}{mark}: {}", p.name, p.ty)
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}({params}): {}", self.name, self.return_type)
    }

    /// Number of arguments that must be supplied.
    pub fn required_arity(&self) -> usize {
        self.parameter_types
            .iter()
            .rposition(|p| !p.optional && !p.rest)
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    /// Validate call arguments against the declared parameters.
    ///
    /// Missing trailing optional parameters are allowed and `null` stands in
    /// for an omitted optional argument, since `undefined` serializes to
    /// `null` on the way across.
    pub fn validate_args(&self, args: &[Value]) -> Result<(), CallError> {
        let invalid = |reason: String| CallError::InvalidArguments {
            function: self.name.clone(),
            reason,
        };

        let required = self.required_arity();
        let has_rest = self.parameter_types.last().is_some_and(|p| p.rest);
        let max = self.parameter_types.len();

        if args.len() < required {
            return Err(invalid(format!(
                "expected at least {required} argument(s), got {}",
                args.len()
            )));
        }
        if !has_rest && args.len() > max {
            return Err(invalid(format!(
                "expected at most {max} argument(s), got {}",
                args.len()
            )));
        }

        for (i, param) in self.parameter_types.iter().enumerate() {
            if param.rest {
                let element = match &param.ty {
                    TypeTree::Array { element } => element.as_ref().clone(),
                    _ => TypeTree::unknown(),
                };
                for (j, arg) in args.iter().enumerate().skip(i) {
                    element
                        .check(arg)
                        .map_err(|m| invalid(format!("argument {j} ('{}'): {m}", param.name)))?;
                }
                break;
            }
            let Some(arg) = args.get(i) else {
                break;
            };
            if param.optional && arg.is_null() {
                continue;
            }
            param
                .ty
                .check(arg)
                .map_err(|m| invalid(format!("argument '{}': {m}", param.name)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrimitiveKind;
    use codecall_error::ErrorKind;
    use serde_json::json;

    fn double() -> FunctionDescriptor {
        FunctionDescriptor::new(
            "double",
            vec![Param::new("x", TypeTree::number())],
            TypeTree::number(),
            "math.ts",
        )
    }

    #[test]
    fn serializes_discovery_shape() {
        let json = serde_json::to_value(double()).unwrap();
        assert_eq!(json["name"], "double");
        assert_eq!(json["sourceFile"], "math.ts");
        assert_eq!(json["parameterTypes"][0]["name"], "x");
        assert_eq!(json["parameterTypes"][0]["type"]["name"], "number");
        assert_eq!(json["returnType"]["kind"], "Primitive");
    }

    #[test]
    fn signature_rendering() {
        assert_eq!(double().signature(), "double(x: number): number");

        let f = FunctionDescriptor::new(
            "sum",
            vec![
                Param::new("label", TypeTree::string()).optional(),
                Param::new("xs", TypeTree::array(TypeTree::number())).rest(),
            ],
            TypeTree::promise(TypeTree::number()),
            "m.ts",
        );
        assert_eq!(
            f.signature(),
            "sum(label?: string, ...xs: number[]): Promise<number>"
        );
    }

    #[test]
    fn valid_arguments_pass() {
        assert!(double().validate_args(&[json!(21)]).is_ok());
    }

    #[test]
    fn wrong_type_is_invalid_arguments() {
        let err = double().validate_args(&[json!("21")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArguments);
        assert!(err.to_string().contains("argument 'x'"), "got: {err}");
    }

    #[test]
    fn arity_is_enforced() {
        let err = double().validate_args(&[]).unwrap_err();
        assert!(err.to_string().contains("at least 1"));
        let err = double().validate_args(&[json!(1), json!(2)]).unwrap_err();
        assert!(err.to_string().contains("at most 1"));
    }

    #[test]
    fn optional_parameters_may_be_omitted_or_null() {
        let f = FunctionDescriptor::new(
            "greet",
            vec![
                Param::new("name", TypeTree::string()),
                Param::new("punct", TypeTree::string()).optional(),
            ],
            TypeTree::string(),
            "g.ts",
        );
        assert_eq!(f.required_arity(), 1);
        assert!(f.validate_args(&[json!("a")]).is_ok());
        assert!(f.validate_args(&[json!("a"), Value::Null]).is_ok());
        assert!(f.validate_args(&[json!("a"), json!(1)]).is_err());
    }

    #[test]
    fn rest_parameters_check_each_element() {
        let f = FunctionDescriptor::new(
            "sum",
            vec![Param::new("xs", TypeTree::array(TypeTree::number())).rest()],
            TypeTree::number(),
            "m.ts",
        );
        assert!(f.validate_args(&[]).is_ok());
        assert!(f.validate_args(&[json!(1), json!(2), json!(3)]).is_ok());
        let err = f.validate_args(&[json!(1), json!("2")]).unwrap_err();
        assert!(err.to_string().contains("argument 1"), "got: {err}");
    }

    #[test]
    fn unknown_parameter_accepts_anything() {
        let f = FunctionDescriptor::new(
            "echo",
            vec![Param::new("v", TypeTree::primitive(PrimitiveKind::Any))],
            TypeTree::unknown(),
            "e.ts",
        );
        assert!(f.validate_args(&[json!({"deep": [1, {"x": null}]})]).is_ok());
    }
}
