//! Field descriptors and value enforcement.
//!
//! A [`FieldSpec`] declares one named, validated attribute of an item
//! schema: its documentation, default, whether it is mandatory, and the
//! [`Enforce`] policy applied to every value written to it.

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;

use crate::error::{Error, Result};

/// The primitive shape a `Enforce::Type` coercion targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Str,
    Int,
    Float,
    Bool,
    List,
    Dict,
}

impl ValueKind {
    fn name(self) -> &'static str {
        match self {
            ValueKind::Str => "str",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Bool => "bool",
            ValueKind::List => "list",
            ValueKind::Dict => "dict",
        }
    }
}

/// A custom validation function: receives the raw value and returns the
/// (possibly coerced) value, or an error message.
pub type Validator =
    Arc<dyn Fn(&Value) -> std::result::Result<Value, String> + Send + Sync>;

/// Enforcement policy for a single field.
#[derive(Clone)]
pub enum Enforce {
    /// Accept any value.
    Anything,
    /// Coerce the value into the given kind, rejecting on failure.
    Type(ValueKind),
    /// The value must be a member of the given set.
    OneOf(Vec<Value>),
    /// The stringified value must fully match the pattern.
    Matches(Regex),
    /// Custom handling by a caller-supplied function.
    Custom(Validator),
}

impl fmt::Debug for Enforce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Enforce::Anything => write!(f, "Anything"),
            Enforce::Type(kind) => write!(f, "Type({})", kind.name()),
            Enforce::OneOf(values) => write!(f, "OneOf({:?})", values),
            Enforce::Matches(re) => write!(f, "Matches({})", re.as_str()),
            Enforce::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Declarative description of one piece of item information.
///
/// All fields are optional by default; marking one `mandatory` clears its
/// default, which is how an unset mandatory value is detected at save
/// time.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub key: String,
    pub doc: String,
    pub optional: bool,
    pub default: Option<Value>,
    pub enforce: Enforce,
    pub enforce_doc: String,
    pub include_default_as_kwarg: bool,
}

impl FieldSpec {
    pub fn new(key: &str, doc: &str) -> Self {
        Self {
            key: key.to_string(),
            doc: doc.to_string(),
            optional: true,
            default: None,
            enforce: Enforce::Anything,
            enforce_doc: String::new(),
            include_default_as_kwarg: true,
        }
    }

    /// Demand a value for this field before an item can be saved.
    ///
    /// Mandatory fields cannot carry a default: the missing default is
    /// what marks the field as unset.
    pub fn mandatory(mut self) -> Self {
        self.optional = false;
        self.default = None;
        self
    }

    pub fn enforce(mut self, enforce: Enforce) -> Self {
        self.enforce = enforce;
        self
    }

    /// Shorthand for `enforce(Enforce::Type(kind))`.
    pub fn of_kind(mut self, kind: ValueKind) -> Self {
        self.enforce = Enforce::Type(kind);
        self
    }

    /// Default value used when the caller supplies nothing.
    ///
    /// Ignored for mandatory fields.
    pub fn default_value(mut self, value: Value) -> Self {
        if self.optional {
            self.default = Some(value);
        }
        self
    }

    /// Human-readable explanation appended to enforcement failures.
    pub fn enforce_doc(mut self, doc: &str) -> Self {
        self.enforce_doc = doc.to_string();
        self
    }

    /// Omit this entry from generated kwargs when its value equals the
    /// default. See the loader's kwarg filtering.
    pub fn exclude_default_kwarg(mut self) -> Self {
        self.include_default_as_kwarg = false;
        self
    }

    /// The default as a concrete value (`Null` when unset).
    pub fn default_or_null(&self) -> Value {
        self.default.clone().unwrap_or(Value::Null)
    }

    /// Verify `value` against the enforcement policy, returning the value
    /// coerced where the policy calls for it.
    ///
    /// `Null` is always accepted: it is the "unset" marker, and whether
    /// unset is allowed is the business of the mandatory check, not the
    /// enforcement rule.
    pub fn enforce_value(&self, value: &Value) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }

        match &self.enforce {
            Enforce::Anything => Ok(value.clone()),
            Enforce::Type(kind) => self.coerce(*kind, value),
            Enforce::OneOf(allowed) => {
                if allowed.contains(value) {
                    Ok(value.clone())
                } else {
                    Err(self.failure(format!(
                        "{} was not found in the allowed set {:?}",
                        value, allowed
                    )))
                }
            }
            Enforce::Matches(re) => {
                let text = value_to_string(value);
                if full_match(re, &text) {
                    Ok(value.clone())
                } else {
                    Err(self.failure(format!(
                        "{:?} did not match the enforced pattern ({})",
                        text,
                        re.as_str()
                    )))
                }
            }
            Enforce::Custom(f) => f(value).map_err(|msg| self.failure(msg)),
        }
    }

    fn coerce(&self, kind: ValueKind, value: &Value) -> Result<Value> {
        match kind {
            ValueKind::Str => match value {
                Value::String(_) => Ok(value.clone()),
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                _ => Err(self.failure(format!("{} is not interpretable as str", value))),
            },
            ValueKind::Int => match value {
                Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
                // A float only narrows to int when nothing is lost.
                Value::Number(n) => match n.as_f64() {
                    Some(f) if f.fract() == 0.0 => Ok(Value::from(f as i64)),
                    _ => Err(self.failure(format!("{} is not interpretable as int", value))),
                },
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|_| self.failure(format!("{:?} is not interpretable as int", s))),
                _ => Err(self.failure(format!("{} is not interpretable as int", value))),
            },
            ValueKind::Float => match value {
                Value::Number(n) => match n.as_f64() {
                    Some(f) => Ok(Value::from(f)),
                    None => Err(self.failure(format!("{} is not interpretable as float", value))),
                },
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::from)
                    .map_err(|_| self.failure(format!("{:?} is not interpretable as float", s))),
                _ => Err(self.failure(format!("{} is not interpretable as float", value))),
            },
            ValueKind::Bool => match value {
                Value::Bool(_) => Ok(value.clone()),
                // Strings need an explicit truth table: parsing "False"
                // as truthy is the classic mistake here.
                Value::String(s) => match s.to_lowercase().as_str() {
                    "true" | "t" | "yes" | "y" => Ok(Value::Bool(true)),
                    "false" | "f" | "no" | "n" => Ok(Value::Bool(false)),
                    _ => Err(self.failure(format!(
                        "{:?} as a string is not interpretable as a boolean",
                        s
                    ))),
                },
                _ => Err(self.failure(format!("{} is not interpretable as bool", value))),
            },
            ValueKind::List => match value {
                Value::Array(_) => Ok(value.clone()),
                _ => Err(self.failure(format!("{} is not a list", value))),
            },
            ValueKind::Dict => match value {
                Value::Object(_) => Ok(value.clone()),
                _ => Err(self.failure(format!("{} is not a mapping", value))),
            },
        }
    }

    fn failure(&self, message: String) -> Error {
        let message = if self.enforce_doc.is_empty() {
            message
        } else {
            format!("{}. {}", message, self.enforce_doc)
        };
        Error::Enforce {
            key: self.key.clone(),
            message,
        }
    }
}

/// Render a value the way templates and regex matching see it.
pub(crate) fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

fn full_match(re: &Regex, text: &str) -> bool {
    re.find(text)
        .map(|m| m.start() == 0 && m.end() == text.len())
        .unwrap_or(false)
}

/// Validator for the built-in `name` field: names key records in every
/// backend and end up as identifiers in calling code.
pub(crate) fn enforce_identifier(value: &Value) -> std::result::Result<Value, String> {
    let text = match value {
        Value::String(s) => s.clone(),
        other => return Err(format!("{} is not a valid name", other)),
    };
    let mut chars = text.chars();
    let leading_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if leading_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(Value::String(text))
    } else {
        Err(format!("{:?} is not a valid name (identifier expected)", text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn anything_accepts_everything() {
        let spec = FieldSpec::new("free", "");
        assert_eq!(spec.enforce_value(&json!([1, 2])).unwrap(), json!([1, 2]));
        assert_eq!(spec.enforce_value(&json!("x")).unwrap(), json!("x"));
    }

    #[test]
    fn int_coerces_numeric_strings() {
        let spec = FieldSpec::new("number", "").of_kind(ValueKind::Int);
        assert_eq!(spec.enforce_value(&json!("42")).unwrap(), json!(42));
        assert_eq!(spec.enforce_value(&json!(7)).unwrap(), json!(7));
        assert!(spec.enforce_value(&json!("forty-two")).is_err());
    }

    #[test]
    fn float_coerces_ints_and_strings() {
        let spec = FieldSpec::new("z", "").of_kind(ValueKind::Float);
        assert_eq!(spec.enforce_value(&json!(3)).unwrap(), json!(3.0));
        assert_eq!(spec.enforce_value(&json!("3.5")).unwrap(), json!(3.5));
        assert!(spec.enforce_value(&json!({})).is_err());
    }

    #[test]
    fn bool_truth_table() {
        let spec = FieldSpec::new("active", "").of_kind(ValueKind::Bool);
        for yes in ["true", "t", "Yes", "Y"] {
            assert_eq!(spec.enforce_value(&json!(yes)).unwrap(), json!(true));
        }
        for no in ["false", "F", "no", "n"] {
            assert_eq!(spec.enforce_value(&json!(no)).unwrap(), json!(false));
        }
        assert!(spec.enforce_value(&json!("maybe")).is_err());
    }

    #[test]
    fn null_always_accepted() {
        let spec = FieldSpec::new("number", "").of_kind(ValueKind::Int);
        assert_eq!(spec.enforce_value(&Value::Null).unwrap(), Value::Null);
    }

    #[test]
    fn one_of_membership() {
        let spec = FieldSpec::new("stage", "")
            .enforce(Enforce::OneOf(vec![json!("alpha"), json!("beta")]));
        assert_eq!(spec.enforce_value(&json!("beta")).unwrap(), json!("beta"));
        assert!(spec.enforce_value(&json!("gamma")).is_err());
    }

    #[test]
    fn regex_requires_full_match() {
        let spec = FieldSpec::new("tag", "")
            .enforce(Enforce::Matches(Regex::new("dev_[0-9]+").unwrap()));
        assert!(spec.enforce_value(&json!("dev_12")).is_ok());
        // A prefix match is not enough.
        assert!(spec.enforce_value(&json!("dev_12x")).is_err());
        assert!(spec.enforce_value(&json!("device_1")).is_err());
    }

    #[test]
    fn enforce_doc_reaches_the_message() {
        let spec = FieldSpec::new("number", "")
            .of_kind(ValueKind::Int)
            .enforce_doc("This must be a number");
        let err = spec.enforce_value(&json!("nope")).unwrap_err();
        assert!(err.to_string().contains("This must be a number"));
    }

    #[test]
    fn mandatory_clears_default() {
        let spec = FieldSpec::new("name", "")
            .default_value(json!("x"))
            .mandatory();
        assert!(spec.default.is_none());
        // And a default set after the fact is ignored.
        let spec = FieldSpec::new("name", "").mandatory().default_value(json!("x"));
        assert!(spec.default.is_none());
    }

    #[test]
    fn custom_validator_coerces_or_rejects() {
        let spec = FieldSpec::new("name", "").enforce(Enforce::Custom(Arc::new(
            |v| enforce_identifier(v),
        )));
        assert!(spec.enforce_value(&json!("motor_1")).is_ok());
        assert!(spec.enforce_value(&json!("1motor")).is_err());
        assert!(spec.enforce_value(&json!("has space")).is_err());
    }
}
