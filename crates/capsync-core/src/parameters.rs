//! Parameter schema extraction from capability templates.
//!
//! A template declares its inputs in a top-level `parameter` struct. Each
//! regular field becomes one [`Parameter`]; the field's doc comments may carry
//! `+usage=`, `+short=`, `+alias=` and `+ignore` directives.

use serde_json::Value;
use thiserror::Error;

use crate::cue::{self, BinaryOp, CueError, Expr, Field, Label, StructLit, UnaryOp};
use crate::types::{Parameter, ParameterType};

/// Name of the top-level field holding the parameter schema.
pub const PARAMETER_FIELD: &str = "parameter";

const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParameterError {
    #[error("invalid template: {0}")]
    Parse(#[from] CueError),
    #[error("template has no 'parameter' field")]
    NoParameter,
    #[error("'parameter' is not a struct (line {line})")]
    NotStruct { line: usize },
}

/// Extract the parameter list from template source, in declaration order.
pub fn parameters_from_template(template: &str) -> Result<Vec<Parameter>, ParameterError> {
    let file = cue::parse(template)?;
    let scope = Scope { file: &file };

    let mut found = false;
    let mut fields = Vec::new();
    for field in file
        .fields
        .iter()
        .filter(|f| f.label.name() == Some(PARAMETER_FIELD))
    {
        found = true;
        if !scope.struct_fields(&field.value, 0, &mut fields) {
            return Err(ParameterError::NotStruct { line: field.line });
        }
    }
    if !found {
        return Err(ParameterError::NoParameter);
    }

    Ok(group_by_name(fields)
        .into_iter()
        .map(|(name, group)| scope.parameter(name, &group))
        .collect())
}

/// Group repeated declarations of a field, keeping first-declaration order.
fn group_by_name(fields: Vec<&Field>) -> Vec<(&str, Vec<&Field>)> {
    let mut groups: Vec<(&str, Vec<&Field>)> = Vec::new();
    for field in fields {
        let Label::Regular(name) = &field.label else {
            continue;
        };
        match groups.iter_mut().find(|(existing, _)| *existing == name.as_str()) {
            Some((_, group)) => group.push(field),
            None => groups.push((name.as_str(), vec![field])),
        }
    }
    groups
}

struct Scope<'a> {
    file: &'a StructLit,
}

impl<'a> Scope<'a> {
    fn parameter(&self, name: &str, group: &[&'a Field]) -> Parameter {
        let kind = group
            .iter()
            .fold(ParameterType::TOP, |kind, f| kind.intersect(self.kind_of(&f.value, 0)));
        let default = group.iter().find_map(|f| self.default_of(&f.value, 0));
        let optional = group.iter().all(|f| f.optional);
        let docs = group
            .iter()
            .find(|f| !f.docs.is_empty())
            .map(|f| f.docs.as_slice())
            .unwrap_or_default();

        let mut param = Parameter {
            name: name.to_string(),
            kind,
            required: !optional && default.is_none(),
            default: default.or_else(|| zero_value(kind)),
            description: String::new(),
            short: String::new(),
            alias: String::new(),
            ignore: false,
        };
        apply_directives(&mut param, docs);
        param
    }

    fn resolve(&self, name: &str) -> Option<&'a Field> {
        self.file.lookup(name)
    }

    /// Collect the fields of a struct-valued expression.
    fn struct_fields(&self, expr: &'a Expr, depth: usize, out: &mut Vec<&'a Field>) -> bool {
        if depth > MAX_DEPTH {
            return false;
        }
        match expr {
            Expr::Struct(lit) => {
                out.extend(lit.fields.iter());
                lit.embeds.iter().all(|embed| {
                    matches!(embed, Expr::Comprehension) || self.struct_fields(embed, depth + 1, out)
                })
            }
            Expr::Ident(name) => self
                .resolve(name)
                .is_some_and(|f| self.struct_fields(&f.value, depth + 1, out)),
            Expr::Call(callee, args) if is_ident(callee, "close") && args.len() == 1 => {
                self.struct_fields(&args[0], depth + 1, out)
            }
            Expr::Conjunction(parts) => parts
                .iter()
                .all(|part| self.struct_fields(part, depth + 1, out)),
            Expr::Unary(UnaryOp::Default, inner) => self.struct_fields(inner, depth + 1, out),
            _ => false,
        }
    }

    fn kind_of(&self, expr: &Expr, depth: usize) -> ParameterType {
        if depth > MAX_DEPTH {
            return ParameterType::TOP;
        }
        match expr {
            Expr::Struct(_) => ParameterType::STRUCT,
            Expr::List { .. } => ParameterType::LIST,
            Expr::Null => ParameterType::NULL,
            Expr::Bool(_) => ParameterType::BOOL,
            Expr::Int(_) => ParameterType::INT,
            Expr::Float(_) => ParameterType::FLOAT,
            Expr::String(_) | Expr::Interpolation(_) => ParameterType::STRING,
            Expr::Bytes(_) => ParameterType::BYTES,
            Expr::Bottom => ParameterType::BOTTOM,
            Expr::Ident(name) => builtin_kind(name).unwrap_or_else(|| {
                self.resolve(name)
                    .map_or(ParameterType::TOP, |f| self.kind_of(&f.value, depth + 1))
            }),
            Expr::Selector(..) | Expr::Index(..) | Expr::Comprehension => ParameterType::TOP,
            Expr::Call(callee, args) => self.call_kind(callee, args, depth),
            Expr::Unary(op, operand) => {
                let operand = self.kind_of(operand, depth + 1);
                match op {
                    UnaryOp::Default => operand,
                    UnaryOp::Neg | UnaryOp::Pos => operand.intersect(ParameterType::NUMBER),
                    UnaryOp::Not => ParameterType::BOOL,
                    UnaryOp::Lt | UnaryOp::Le | UnaryOp::Gt | UnaryOp::Ge => {
                        if operand == ParameterType::STRING || operand == ParameterType::BYTES {
                            operand
                        } else {
                            ParameterType::NUMBER
                        }
                    }
                    UnaryOp::Ne => ParameterType::TOP,
                    UnaryOp::Match | UnaryOp::NotMatch => ParameterType::STRING,
                }
            }
            Expr::Binary(op, lhs, rhs) => match op {
                BinaryOp::Div => ParameterType::FLOAT,
                BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul => {
                    let lhs = self.kind_of(lhs, depth + 1);
                    let rhs = self.kind_of(rhs, depth + 1);
                    let both = lhs.intersect(rhs);
                    if !both.is_bottom() {
                        both
                    } else if ParameterType::NUMBER.contains(lhs.union(rhs)) {
                        ParameterType::FLOAT
                    } else {
                        ParameterType::BOTTOM
                    }
                }
                _ => ParameterType::BOOL,
            },
            Expr::Disjunction(parts) => parts.iter().fold(ParameterType::BOTTOM, |kind, d| {
                kind.union(self.kind_of(&d.expr, depth + 1))
            }),
            Expr::Conjunction(parts) => parts.iter().fold(ParameterType::TOP, |kind, part| {
                kind.intersect(self.kind_of(part, depth + 1))
            }),
        }
    }

    fn call_kind(&self, callee: &Expr, args: &[Expr], depth: usize) -> ParameterType {
        match callee {
            Expr::Ident(name) => match name.as_str() {
                "close" if args.len() == 1 => self.kind_of(&args[0], depth + 1),
                "len" | "div" | "mod" | "quo" | "rem" => ParameterType::INT,
                _ => ParameterType::TOP,
            },
            Expr::Selector(package, _) => match package.as_ref() {
                Expr::Ident(package) => match package.as_str() {
                    "strings" | "regexp" | "time" | "net" | "base64" | "json" | "yaml" => {
                        ParameterType::STRING
                    }
                    "list" => ParameterType::LIST,
                    "math" => ParameterType::NUMBER,
                    "struct" => ParameterType::STRUCT,
                    _ => ParameterType::TOP,
                },
                _ => ParameterType::TOP,
            },
            _ => ParameterType::TOP,
        }
    }

    /// Value of the `*`-marked disjunct, when it is concrete.
    fn default_of(&self, expr: &Expr, depth: usize) -> Option<Value> {
        if depth > MAX_DEPTH {
            return None;
        }
        match expr {
            Expr::Disjunction(parts) => parts
                .iter()
                .filter(|d| d.default)
                .find_map(|d| concrete(&d.expr)),
            Expr::Unary(UnaryOp::Default, inner) => concrete(inner),
            Expr::Conjunction(parts) => parts.iter().find_map(|p| self.default_of(p, depth + 1)),
            Expr::Ident(name) if builtin_kind(name).is_none() => self
                .resolve(name)
                .and_then(|f| self.default_of(&f.value, depth + 1)),
            _ => None,
        }
    }
}

fn is_ident(expr: &Expr, name: &str) -> bool {
    matches!(expr, Expr::Ident(ident) if ident == name)
}

fn builtin_kind(name: &str) -> Option<ParameterType> {
    Some(match name {
        "_" => ParameterType::TOP,
        "string" => ParameterType::STRING,
        "bytes" => ParameterType::BYTES,
        "bool" => ParameterType::BOOL,
        "number" => ParameterType::NUMBER,
        "float" | "float32" | "float64" => ParameterType::FLOAT,
        "int" | "uint" | "rune" | "int8" | "int16" | "int32" | "int64" | "int128" | "uint8"
        | "uint16" | "uint32" | "uint64" | "uint128" => ParameterType::INT,
        _ => return None,
    })
}

/// JSON value of a fully concrete expression.
fn concrete(expr: &Expr) -> Option<Value> {
    match expr {
        Expr::Null => Some(Value::Null),
        Expr::Bool(b) => Some(Value::Bool(*b)),
        Expr::Int(i) => Some(Value::from(*i)),
        Expr::Float(f) => serde_json::Number::from_f64(*f).map(Value::Number),
        Expr::String(s) | Expr::Bytes(s) => Some(Value::String(s.clone())),
        Expr::Unary(UnaryOp::Neg, inner) => match inner.as_ref() {
            Expr::Int(i) => Some(Value::from(-i)),
            Expr::Float(f) => serde_json::Number::from_f64(-f).map(Value::Number),
            _ => None,
        },
        Expr::Unary(UnaryOp::Pos, inner) => concrete(inner),
        Expr::List { elems, tail: None } => elems.iter().map(concrete).collect::<Option<Vec<_>>>().map(Value::Array),
        Expr::Struct(lit) if lit.embeds.is_empty() => {
            let mut object = serde_json::Map::new();
            for field in &lit.fields {
                match &field.label {
                    Label::Regular(name) if !field.optional => {
                        object.insert(name.clone(), concrete(&field.value)?);
                    }
                    Label::Regular(_) | Label::Definition(_) | Label::Hidden(_) => {}
                    Label::Pattern(_) | Label::Dynamic(_) => return None,
                }
            }
            Some(Value::Object(object))
        }
        _ => None,
    }
}

/// Zero value for single scalar kinds.
fn zero_value(kind: ParameterType) -> Option<Value> {
    match kind {
        ParameterType::INT => Some(Value::from(0)),
        ParameterType::FLOAT | ParameterType::NUMBER => Some(Value::from(0.0)),
        ParameterType::STRING => Some(Value::String(String::new())),
        ParameterType::BOOL => Some(Value::Bool(false)),
        _ => None,
    }
}

fn apply_directives(param: &mut Parameter, docs: &[String]) {
    for line in docs.iter().map(|line| line.trim()) {
        if let Some(usage) = line.strip_prefix("+usage=") {
            param.description = usage.to_string();
        } else if let Some(short) = line.strip_prefix("+short=") {
            param.short = short.to_string();
        } else if let Some(alias) = line.strip_prefix("+alias=") {
            param.alias = alias.to_string();
        } else if line.starts_with("+ignore") {
            param.ignore = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const WEBSERVICE: &str = r#"
output: {
	apiVersion: "apps/v1"
	kind:       "Deployment"
	spec: containers: [{
		image: parameter.image
		if parameter["cmd"] != _|_ {
			command: parameter.cmd
		}
	}]
}

#Probe: {
	path: string
}

parameter: {
	// +usage=Which image would you like to use for your service
	// +short=i
	image: string

	// +usage=Which port do you want customer traffic sent to
	// +short=p
	port: *80 | int

	// +usage=Commands to run in the container
	cmd?: [...string]

	env?: [...{
		name:   string
		value?: string
	}]

	_internal: bool
	#Local: string
	[string]: _
}
"#;

    fn by_name<'a>(params: &'a [Parameter], name: &str) -> &'a Parameter {
        params.iter().find(|p| p.name == name).unwrap()
    }

    #[test]
    fn extracts_webservice_parameters() {
        let params = parameters_from_template(WEBSERVICE).unwrap();
        let names: Vec<_> = params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["image", "port", "cmd", "env"]);

        let image = by_name(&params, "image");
        assert_eq!(image.kind, ParameterType::STRING);
        assert!(image.required);
        assert_eq!(image.short, "i");
        assert_eq!(
            image.description,
            "Which image would you like to use for your service"
        );
        assert_eq!(image.default, Some(json!("")));

        let port = by_name(&params, "port");
        assert_eq!(port.kind, ParameterType::INT);
        assert!(!port.required);
        assert_eq!(port.default, Some(json!(80)));

        let cmd = by_name(&params, "cmd");
        assert_eq!(cmd.kind, ParameterType::LIST);
        assert!(!cmd.required);
        assert_eq!(cmd.default, None);

        assert_eq!(by_name(&params, "env").kind, ParameterType::LIST);
    }

    #[test]
    fn follows_definition_references() {
        let template = r#"
#Params: close({
	replicas: *1 | int & >=0
	mode: *"rolling" | "recreate"
})
parameter: #Params & {
	paused: *false | bool
}
"#;
        let params = parameters_from_template(template).unwrap();
        assert_eq!(params.len(), 3);
        assert_eq!(params[0].name, "replicas");
        assert_eq!(params[0].kind, ParameterType::INT);
        assert_eq!(params[0].default, Some(json!(1)));
        assert_eq!(params[1].kind, ParameterType::STRING);
        assert_eq!(params[1].default, Some(json!("rolling")));
        assert_eq!(params[2].default, Some(json!(false)));
        assert!(params.iter().all(|p| !p.required));
    }

    #[test]
    fn union_kinds_have_no_zero_default() {
        let template = r#"
parameter: {
	host: string | null
	ratio: number
	weight: float
	anything: _
	labels: [string]: string
}
"#;
        let params = parameters_from_template(template).unwrap();
        let host = by_name(&params, "host");
        assert_eq!(host.kind.to_string(), "null|string");
        assert_eq!(host.default, None);
        assert_eq!(by_name(&params, "ratio").default, Some(json!(0.0)));
        assert_eq!(by_name(&params, "ratio").kind.to_string(), "number");
        assert_eq!(by_name(&params, "weight").kind, ParameterType::FLOAT);
        assert_eq!(by_name(&params, "anything").kind.to_string(), "_");
        assert_eq!(by_name(&params, "labels").kind, ParameterType::STRUCT);
    }

    #[test]
    fn reads_alias_and_ignore_directives() {
        let template = r"
parameter: {
	// +alias=ns
	namespace: *null | string
	// +ignore
	// +usage=internal knob
	debug?: bool
}
";
        let params = parameters_from_template(template).unwrap();
        assert_eq!(params[0].alias, "ns");
        assert_eq!(params[0].default, Some(Value::Null));
        assert!(params[1].ignore);
        assert_eq!(params[1].description, "internal knob");
        assert!(!params[1].required);
    }

    #[test]
    fn struct_defaults_are_concrete() {
        let template = r#"
parameter: {
	resources: *{cpu: "500m", replicas: -1} | {...}
}
"#;
        let params = parameters_from_template(template).unwrap();
        assert_eq!(
            params[0].default,
            Some(json!({"cpu": "500m", "replicas": -1}))
        );
    }

    #[test]
    fn missing_parameter_is_an_error() {
        assert_eq!(
            parameters_from_template("output: {}"),
            Err(ParameterError::NoParameter)
        );
    }

    #[test]
    fn non_struct_parameter_is_an_error() {
        assert_eq!(
            parameters_from_template("output: {}\nparameter: string"),
            Err(ParameterError::NotStruct { line: 2 })
        );
    }

    #[test]
    fn parse_failures_carry_the_line() {
        let err = parameters_from_template("parameter: {\n\timage: string\n\tport: int int\n}")
            .unwrap_err();
        let ParameterError::Parse(diagnostic) = err else {
            panic!("expected parse error");
        };
        assert_eq!(diagnostic.line, 3);
    }

    #[test]
    fn deeply_nested_template_is_a_parse_error() {
        let depth = 200_000;
        let template = format!("parameter: {{ a: {}{} }}", "[".repeat(depth), "]".repeat(depth));
        let err = parameters_from_template(&template).unwrap_err();
        let ParameterError::Parse(diagnostic) = err else {
            panic!("expected parse error");
        };
        assert_eq!(diagnostic.message, "nesting too deep");
    }
}
