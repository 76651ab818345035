//! Runtime values and the conversions between them.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use serde_json::Value as Json;

use super::ast::FunctionDef;
use super::interpreter::{Abrupt, Env, Interpreter};

/// Deepest structure walked by string and JSON conversions.
pub const MAX_WALK_DEPTH: usize = 256;

pub type NativeFn = fn(&mut Interpreter, Vec<Value>) -> Result<Value, Abrupt>;

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    Array(Rc<RefCell<Vec<Value>>>),
    Object(Rc<RefCell<Object>>),
    Function(Rc<Function>),
}

#[derive(Default)]
pub struct Object {
    pub properties: IndexMap<String, Value>,
    pub class: ObjectClass,
}

#[derive(Default)]
pub enum ObjectClass {
    #[default]
    Plain,
    Error,
    /// Created by `new` on a script function.
    Instance(Rc<Function>),
}

pub struct Function {
    pub kind: FunctionKind,
    pub properties: RefCell<IndexMap<String, Value>>,
}

pub enum FunctionKind {
    Closure {
        def: Rc<FunctionDef>,
        env: Env,
    },
    Native {
        name: &'static str,
        call: NativeFn,
        constructor: bool,
    },
    /// A built-in method read off a string, array, number or object.
    Method {
        receiver: Value,
        name: Rc<str>,
    },
}

impl Function {
    pub fn new(kind: FunctionKind) -> Self {
        Self {
            kind,
            properties: RefCell::new(IndexMap::new()),
        }
    }

    pub fn name(&self) -> String {
        if let Some(name) = self.properties.borrow().get("name") {
            return name.to_js_string();
        }
        match &self.kind {
            FunctionKind::Closure { def, .. } => def.name.clone().unwrap_or_default(),
            FunctionKind::Native { name, .. } => name.to_string(),
            FunctionKind::Method { name, .. } => name.to_string(),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Array(items) => write!(f, "Array({})", items.borrow().len()),
            Value::Object(_) => write!(f, "Object"),
            Value::Function(func) => write!(f, "Function({})", func.name()),
            other => write!(f, "{}", other.to_js_string()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Rc::from(s))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl Value {
    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn object(properties: IndexMap<String, Value>) -> Self {
        Value::Object(Rc::new(RefCell::new(Object {
            properties,
            class: ObjectClass::Plain,
        })))
    }

    pub fn constructor(name: &'static str, call: NativeFn) -> Self {
        Value::Function(Rc::new(Function::new(FunctionKind::Native {
            name,
            call,
            constructor: true,
        })))
    }

    pub fn method(receiver: &Value, name: &str) -> Self {
        Value::Function(Rc::new(Function::new(FunctionKind::Method {
            receiver: receiver.clone(),
            name: Rc::from(name),
        })))
    }

    /// `{name, message}` object flagged as an error.
    pub fn error(name: &str, message: &str) -> Self {
        let mut properties = IndexMap::new();
        properties.insert("name".to_string(), Value::from(name));
        properties.insert("message".to_string(), Value::from(message));
        Value::Object(Rc::new(RefCell::new(Object {
            properties,
            class: ObjectClass::Error,
        })))
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null | Value::Array(_) | Value::Object(_) => "object",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Function(_) => "function",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Object(o) if matches!(o.borrow().class, ObjectClass::Error))
    }

    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Number(n) => *n,
            Value::Str(s) => string_to_number(s),
            Value::Array(_) => string_to_number(&self.to_js_string()),
            Value::Object(_) | Value::Function(_) => f64::NAN,
        }
    }

    pub fn to_js_string(&self) -> String {
        self.to_string_at(0)
    }

    fn to_string_at(&self, depth: usize) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => number_to_string(*n),
            Value::Str(s) => s.to_string(),
            Value::Array(items) => {
                if depth >= MAX_WALK_DEPTH {
                    return String::new();
                }
                items
                    .borrow()
                    .iter()
                    .map(|item| match item {
                        Value::Undefined | Value::Null => String::new(),
                        other => other.to_string_at(depth + 1),
                    })
                    .collect::<Vec<_>>()
                    .join(",")
            }
            Value::Object(object) => {
                let object = object.borrow();
                match object.class {
                    ObjectClass::Error => {
                        let name = object
                            .properties
                            .get("name")
                            .map(|v| v.to_string_at(depth + 1))
                            .unwrap_or_else(|| "Error".to_string());
                        let message = object
                            .properties
                            .get("message")
                            .map(|v| v.to_string_at(depth + 1))
                            .unwrap_or_default();
                        if message.is_empty() {
                            name
                        } else {
                            format!("{}: {}", name, message)
                        }
                    }
                    _ => "[object Object]".to_string(),
                }
            }
            Value::Function(func) => match func.kind {
                FunctionKind::Closure { .. } => format!("function {}() {{ ... }}", func.name()),
                _ => format!("function {}() {{ [native code] }}", func.name()),
            },
        }
    }

    /// Key used for property access.
    pub fn to_property_key(&self) -> String {
        self.to_js_string()
    }

    /// Value reported back to the model as the completion value.
    pub fn to_json(&self) -> Json {
        self.to_json_at(&mut Vec::new())
    }

    fn to_json_at(&self, seen: &mut Vec<*const ()>) -> Json {
        match self {
            Value::Undefined | Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::Str(s) => Json::String(s.to_string()),
            Value::Function(func) => Json::String(function_label(func)),
            Value::Array(items) => {
                let ptr = Rc::as_ptr(items) as *const ();
                if seen.contains(&ptr) {
                    return Json::String("[Circular]".to_string());
                }
                if seen.len() >= MAX_WALK_DEPTH {
                    return Json::String("[Array]".to_string());
                }
                seen.push(ptr);
                let json = items.borrow().iter().map(|v| v.to_json_at(seen)).collect();
                seen.pop();
                Json::Array(json)
            }
            Value::Object(object) => {
                if self.is_error() {
                    return Json::String(self.to_js_string());
                }
                let ptr = Rc::as_ptr(object) as *const ();
                if seen.contains(&ptr) {
                    return Json::String("[Circular]".to_string());
                }
                if seen.len() >= MAX_WALK_DEPTH {
                    return Json::String("[Object]".to_string());
                }
                seen.push(ptr);
                let map = object
                    .borrow()
                    .properties
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json_at(seen)))
                    .collect();
                seen.pop();
                Json::Object(map)
            }
        }
    }

    pub fn from_json(json: &Json) -> Self {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            Json::String(s) => Value::from(s.as_str()),
            Json::Array(items) => Value::array(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => Value::object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

fn function_label(func: &Function) -> String {
    let name = func.name();
    if name.is_empty() {
        "[Function (anonymous)]".to_string()
    } else {
        format!("[Function: {}]", name)
    }
}

/// Non-finite numbers become strings; integral values stay integers.
pub fn number_to_json(n: f64) -> Json {
    if !n.is_finite() {
        return Json::String(number_to_string(n));
    }
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        return Json::from(n as i64);
    }
    serde_json::Number::from_f64(n).map_or(Json::Null, Json::Number)
}

/// Number formatting with the same digits and exponent rules as JavaScript.
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }

    let sign = if n < 0.0 { "-" } else { "" };
    // Shortest round-trip digits, e.g. "1.2345e-7".
    let formatted = format!("{:e}", n.abs());
    let (mantissa, exponent) = formatted.split_once('e').unwrap_or((formatted.as_str(), "0"));
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let k = digits.len() as i32;
    let point = exponent + 1;

    let body = if k <= point && point <= 21 {
        format!("{}{}", digits, "0".repeat((point - k) as usize))
    } else if 0 < point && point <= 21 {
        let (int, frac) = digits.split_at(point as usize);
        format!("{}.{}", int, frac)
    } else if -6 < point && point <= 0 {
        format!("0.{}{}", "0".repeat((-point) as usize), digits)
    } else {
        let (first, rest) = digits.split_at(1);
        let exp_sign = if point - 1 < 0 { "-" } else { "+" };
        if rest.is_empty() {
            format!("{}e{}{}", first, exp_sign, (point - 1).abs())
        } else {
            format!("{}.{}e{}{}", first, rest, exp_sign, (point - 1).abs())
        }
    };
    format!("{}{}", sign, body)
}

/// String to number as the unary `+` operator does it.
pub fn string_to_number(s: &str) -> f64 {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    let (sign, unsigned) = match trimmed.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    if unsigned == "Infinity" {
        return sign * f64::INFINITY;
    }
    for (prefix, radix) in [("0x", 16), ("0X", 16), ("0b", 2), ("0B", 2), ("0o", 8), ("0O", 8)] {
        if let Some(digits) = trimmed.strip_prefix(prefix) {
            return u64::from_str_radix(digits, radix).map_or(f64::NAN, |v| v as f64);
        }
    }
    let valid = unsigned
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'));
    if !valid || unsigned.starts_with(['e', 'E']) {
        return f64::NAN;
    }
    unsigned.parse::<f64>().map_or(f64::NAN, |v| sign * v)
}

/// Canonical array index for a property key.
pub fn array_index(key: &str) -> Option<usize> {
    if key == "0" {
        return Some(0);
    }
    if key.starts_with('0') || !key.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    key.parse().ok()
}

pub fn to_int32(n: f64) -> i32 {
    to_uint32(n) as i32
}

pub fn to_uint32(n: f64) -> u32 {
    if !n.is_finite() {
        return 0;
    }
    n.trunc().rem_euclid(4_294_967_296.0) as u32
}

/// Integer conversion for indices and counts (`NaN` is 0).
pub fn to_integer(n: f64) -> f64 {
    if n.is_nan() {
        0.0
    } else {
        n.trunc()
    }
}

pub fn strict_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Array(x), Value::Array(y)) => Rc::ptr_eq(x, y),
        (Value::Object(x), Value::Object(y)) => Rc::ptr_eq(x, y),
        (Value::Function(x), Value::Function(y)) => Rc::ptr_eq(x, y),
        _ => false,
    }
}

/// Equality used by `includes`: like `===` but `NaN` equals itself.
pub fn same_value_zero(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) if x.is_nan() && y.is_nan() => true,
        _ => strict_equals(a, b),
    }
}

pub fn loose_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (x, y) if x.is_nullish() && y.is_nullish() => true,
        (x, _) | (_, x) if x.is_nullish() => false,
        (Value::Number(_), Value::Str(_)) | (Value::Str(_), Value::Number(_)) => {
            a.to_number() == b.to_number()
        }
        (Value::Bool(_), _) => loose_equals(&Value::Number(a.to_number()), b),
        (_, Value::Bool(_)) => loose_equals(a, &Value::Number(b.to_number())),
        (Value::Array(_) | Value::Object(_), Value::Number(_) | Value::Str(_)) => {
            loose_equals(&Value::from(a.to_js_string()), b)
        }
        (Value::Number(_) | Value::Str(_), Value::Array(_) | Value::Object(_)) => {
            loose_equals(a, &Value::from(b.to_js_string()))
        }
        _ => strict_equals(a, b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn formats_numbers_like_javascript() {
        assert_eq!(number_to_string(3.0), "3");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(number_to_string(1e21), "1e+21");
        assert_eq!(number_to_string(123456789012345680000.0), "123456789012345680000");
        assert_eq!(number_to_string(0.000001), "0.000001");
        assert_eq!(number_to_string(1e-7), "1e-7");
        assert_eq!(number_to_string(-1.5e-9), "-1.5e-9");
        assert_eq!(number_to_string(f64::NEG_INFINITY), "-Infinity");
    }

    #[test]
    fn parses_numeric_strings() {
        assert_eq!(string_to_number("  42 "), 42.0);
        assert_eq!(string_to_number(""), 0.0);
        assert_eq!(string_to_number("0x10"), 16.0);
        assert_eq!(string_to_number("-Infinity"), f64::NEG_INFINITY);
        assert!(string_to_number("12px").is_nan());
        assert!(string_to_number("inf").is_nan());
    }

    #[test]
    fn loose_equality_coerces() {
        assert!(loose_equals(&Value::Null, &Value::Undefined));
        assert!(loose_equals(&Value::from("1"), &Value::Number(1.0)));
        assert!(loose_equals(&Value::Bool(true), &Value::Number(1.0)));
        assert!(!loose_equals(&Value::Null, &Value::Number(0.0)));
        assert!(!strict_equals(&Value::from("1"), &Value::Number(1.0)));
        assert!(same_value_zero(&Value::Number(f64::NAN), &Value::Number(f64::NAN)));
    }

    #[test]
    fn converts_to_json() {
        let value = Value::array(vec![
            Value::Number(2.0),
            Value::Number(0.5),
            Value::Number(f64::NAN),
            Value::Undefined,
            Value::error("TypeError", "bad"),
        ]);
        assert_eq!(value.to_json(), json!([2, 0.5, "NaN", null, "TypeError: bad"]));
    }

    #[test]
    fn cyclic_arrays_are_marked() {
        let items = Rc::new(RefCell::new(Vec::new()));
        let value = Value::Array(items.clone());
        items.borrow_mut().push(value.clone());
        assert_eq!(value.to_json(), json!(["[Circular]"]));
        items.borrow_mut().clear();
    }

    #[test]
    fn array_index_is_canonical() {
        assert_eq!(array_index("0"), Some(0));
        assert_eq!(array_index("12"), Some(12));
        assert_eq!(array_index("01"), None);
        assert_eq!(array_index("-1"), None);
        assert_eq!(array_index("length"), None);
    }
}
