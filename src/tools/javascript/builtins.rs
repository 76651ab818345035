//! The fixed set of globals a script can reach, plus the methods of
//! strings, arrays, numbers, objects and functions.
//!
//! Static members such as `Math.max` are method values whose receiver is
//! `undefined`; [`call_method`] dispatches them by qualified name.

use std::cmp::Ordering;
use std::rc::Rc;

use indexmap::IndexMap;
use serde_json::Value as Json;

use super::interpreter::{describe_value, Abrupt, Env, Interpreter};
use super::value::{
    array_index, number_to_string, same_value_zero, strict_equals, to_integer, to_uint32,
    Function, FunctionKind, ObjectClass, Value, MAX_WALK_DEPTH,
};
use super::ScriptError;

const STRING_METHODS: &[&str] = &[
    "at", "charAt", "charCodeAt", "concat", "endsWith", "includes", "indexOf", "lastIndexOf",
    "localeCompare", "padEnd", "padStart", "repeat", "replace", "replaceAll", "slice", "split",
    "startsWith", "substr", "substring", "toLowerCase", "toString", "toUpperCase", "trim",
    "trimEnd", "trimStart",
];

const ARRAY_METHODS: &[&str] = &[
    "at", "concat", "entries", "every", "fill", "filter", "find", "findIndex", "findLast",
    "findLastIndex", "flat", "flatMap", "forEach", "includes", "indexOf", "join", "keys",
    "lastIndexOf", "map", "pop", "push", "reduce", "reduceRight", "reverse", "shift", "slice",
    "some", "sort", "splice", "toString", "unshift", "values",
];

const NUMBER_METHODS: &[&str] = &["toFixed", "toPrecision", "toString"];

const OBJECT_METHODS: &[&str] = &["hasOwnProperty", "toString"];

const FUNCTION_METHODS: &[&str] = &["apply", "call", "toString"];

const CONSOLE: &[&str] = &[
    "console.log",
    "console.info",
    "console.warn",
    "console.error",
    "console.debug",
];

const MATH: &[&str] = &[
    "Math.abs", "Math.acos", "Math.asin", "Math.atan", "Math.atan2", "Math.cbrt", "Math.ceil",
    "Math.cos", "Math.exp", "Math.floor", "Math.hypot", "Math.log", "Math.log10", "Math.log2",
    "Math.max", "Math.min", "Math.pow", "Math.random", "Math.round", "Math.sign", "Math.sin",
    "Math.sqrt", "Math.tan", "Math.trunc",
];

/// Populate the root scope. Nothing else is reachable from a script.
pub fn install(root: &Env) {
    root.define_builtin("console", namespace(CONSOLE, &[]));
    root.define_builtin(
        "Math",
        namespace(
            MATH,
            &[
                ("PI", std::f64::consts::PI),
                ("E", std::f64::consts::E),
                ("LN2", std::f64::consts::LN_2),
                ("LN10", std::f64::consts::LN_10),
                ("LOG2E", std::f64::consts::LOG2_E),
                ("LOG10E", std::f64::consts::LOG10_E),
                ("SQRT2", std::f64::consts::SQRT_2),
                ("SQRT1_2", std::f64::consts::FRAC_1_SQRT_2),
            ],
        ),
    );
    root.define_builtin("JSON", namespace(&["JSON.stringify", "JSON.parse"], &[]));

    root.define_builtin(
        "Object",
        with_statics(
            Value::constructor("Object", object_constructor),
            &[
                "Object.keys",
                "Object.values",
                "Object.entries",
                "Object.assign",
                "Object.fromEntries",
                "Object.freeze",
            ],
            &[],
        ),
    );
    root.define_builtin(
        "Array",
        with_statics(
            Value::constructor("Array", array_constructor),
            &["Array.isArray", "Array.from", "Array.of"],
            &[],
        ),
    );
    root.define_builtin(
        "String",
        with_statics(
            Value::constructor("String", string_constructor),
            &["String.fromCharCode"],
            &[],
        ),
    );
    root.define_builtin(
        "Number",
        with_statics(
            Value::constructor("Number", number_constructor),
            &[
                "Number.isInteger",
                "Number.isSafeInteger",
                "Number.isFinite",
                "Number.isNaN",
                "Number.parseFloat",
                "Number.parseInt",
            ],
            &[
                ("MAX_SAFE_INTEGER", 9_007_199_254_740_991.0),
                ("MIN_SAFE_INTEGER", -9_007_199_254_740_991.0),
                ("EPSILON", f64::EPSILON),
                ("MAX_VALUE", f64::MAX),
                ("MIN_VALUE", 5e-324),
                ("POSITIVE_INFINITY", f64::INFINITY),
                ("NEGATIVE_INFINITY", f64::NEG_INFINITY),
                ("NaN", f64::NAN),
            ],
        ),
    );
    root.define_builtin("Boolean", Value::constructor("Boolean", boolean_constructor));

    root.define_builtin("Error", Value::constructor("Error", error_constructor));
    root.define_builtin("TypeError", Value::constructor("TypeError", type_error_constructor));
    root.define_builtin("RangeError", Value::constructor("RangeError", range_error_constructor));
    root.define_builtin(
        "SyntaxError",
        Value::constructor("SyntaxError", syntax_error_constructor),
    );
    root.define_builtin(
        "ReferenceError",
        Value::constructor("ReferenceError", reference_error_constructor),
    );

    for name in ["parseInt", "parseFloat", "isNaN", "isFinite"] {
        root.define_builtin(name, static_method(name));
    }
    root.define_builtin("undefined", Value::Undefined);
    root.define_builtin("NaN", Value::Number(f64::NAN));
    root.define_builtin("Infinity", Value::Number(f64::INFINITY));
}

fn static_method(qualified: &str) -> Value {
    Value::method(&Value::Undefined, qualified)
}

fn short_name(qualified: &str) -> &str {
    qualified.rsplit_once('.').map_or(qualified, |(_, name)| name)
}

fn namespace(methods: &[&str], constants: &[(&str, f64)]) -> Value {
    let mut properties = IndexMap::new();
    for qualified in methods {
        properties.insert(short_name(qualified).to_string(), static_method(qualified));
    }
    for (name, value) in constants {
        properties.insert(name.to_string(), Value::Number(*value));
    }
    Value::object(properties)
}

fn with_statics(constructor: Value, methods: &[&str], constants: &[(&str, f64)]) -> Value {
    if let Value::Function(function) = &constructor {
        let mut properties = function.properties.borrow_mut();
        for qualified in methods {
            properties.insert(short_name(qualified).to_string(), static_method(qualified));
        }
        for (name, value) in constants {
            properties.insert(name.to_string(), Value::Number(*value));
        }
    }
    constructor
}

fn arg(args: &[Value], index: usize) -> Value {
    args.get(index).cloned().unwrap_or_default()
}

// ---- constructors ----

fn object_constructor(_: &mut Interpreter, args: Vec<Value>) -> Result<Value, Abrupt> {
    Ok(match arg(&args, 0) {
        Value::Undefined | Value::Null => Value::object(IndexMap::new()),
        other => other,
    })
}

fn array_constructor(interp: &mut Interpreter, args: Vec<Value>) -> Result<Value, Abrupt> {
    if let [Value::Number(len)] = args.as_slice() {
        if *len < 0.0 || len.fract() != 0.0 || !len.is_finite() {
            return Err(interp.range_error("Invalid array length"));
        }
        interp.check_collection(*len as usize)?;
        return Ok(Value::array(vec![Value::Undefined; *len as usize]));
    }
    Ok(Value::array(args))
}

fn string_constructor(_: &mut Interpreter, args: Vec<Value>) -> Result<Value, Abrupt> {
    Ok(match args.first() {
        Some(value) => Value::from(value.to_js_string()),
        None => Value::from(""),
    })
}

fn number_constructor(_: &mut Interpreter, args: Vec<Value>) -> Result<Value, Abrupt> {
    Ok(Value::Number(args.first().map_or(0.0, Value::to_number)))
}

fn boolean_constructor(_: &mut Interpreter, args: Vec<Value>) -> Result<Value, Abrupt> {
    Ok(Value::Bool(arg(&args, 0).truthy()))
}

fn make_error(name: &str, args: &[Value]) -> Value {
    let message = match arg(args, 0) {
        Value::Undefined => String::new(),
        other => other.to_js_string(),
    };
    Value::error(name, &message)
}

fn error_constructor(_: &mut Interpreter, args: Vec<Value>) -> Result<Value, Abrupt> {
    Ok(make_error("Error", &args))
}

fn type_error_constructor(_: &mut Interpreter, args: Vec<Value>) -> Result<Value, Abrupt> {
    Ok(make_error("TypeError", &args))
}

fn range_error_constructor(_: &mut Interpreter, args: Vec<Value>) -> Result<Value, Abrupt> {
    Ok(make_error("RangeError", &args))
}

fn syntax_error_constructor(_: &mut Interpreter, args: Vec<Value>) -> Result<Value, Abrupt> {
    Ok(make_error("SyntaxError", &args))
}

fn reference_error_constructor(_: &mut Interpreter, args: Vec<Value>) -> Result<Value, Abrupt> {
    Ok(make_error("ReferenceError", &args))
}

// ---- property access ----

fn method_or_undefined(receiver: &Value, key: &str, methods: &[&str]) -> Value {
    if methods.contains(&key) {
        Value::method(receiver, key)
    } else {
        Value::Undefined
    }
}

/// `Foo.prototype` for script constructors, created on first use.
fn prototype_of(function: &Rc<Function>) -> Value {
    if let Some(prototype) = function.properties.borrow().get("prototype") {
        return prototype.clone();
    }
    let prototype = Value::object(IndexMap::new());
    function
        .properties
        .borrow_mut()
        .insert("prototype".to_string(), prototype.clone());
    prototype
}

pub fn get_property(interp: &mut Interpreter, object: &Value, key: &str) -> Result<Value, Abrupt> {
    match object {
        Value::Undefined | Value::Null => Err(interp.type_error(format!(
            "Cannot read properties of {} (reading '{}')",
            object.to_js_string(),
            key
        ))),
        Value::Str(s) => {
            if key == "length" {
                return Ok(Value::Number(s.chars().count() as f64));
            }
            if let Some(index) = array_index(key) {
                return Ok(s
                    .chars()
                    .nth(index)
                    .map(|c| Value::from(c.to_string()))
                    .unwrap_or_default());
            }
            Ok(method_or_undefined(object, key, STRING_METHODS))
        }
        Value::Array(items) => {
            if key == "length" {
                return Ok(Value::Number(items.borrow().len() as f64));
            }
            if let Some(index) = array_index(key) {
                return Ok(items.borrow().get(index).cloned().unwrap_or_default());
            }
            Ok(method_or_undefined(object, key, ARRAY_METHODS))
        }
        Value::Object(o) => {
            if let Some(value) = o.borrow().properties.get(key) {
                return Ok(value.clone());
            }
            let class = match &o.borrow().class {
                ObjectClass::Instance(function) => Some(function.clone()),
                _ => None,
            };
            if let Some(function) = class {
                if let Value::Object(prototype) = prototype_of(&function) {
                    if let Some(value) = prototype.borrow().properties.get(key) {
                        return Ok(value.clone());
                    }
                }
            }
            Ok(method_or_undefined(object, key, OBJECT_METHODS))
        }
        Value::Function(function) => {
            match key {
                "prototype" => return Ok(prototype_of(function)),
                "name" => return Ok(Value::from(function.name())),
                "length" => {
                    let arity = match &function.kind {
                        FunctionKind::Closure { def, .. } => def.params.len(),
                        _ => 0,
                    };
                    return Ok(Value::Number(arity as f64));
                }
                _ => {}
            }
            if let Some(value) = function.properties.borrow().get(key) {
                return Ok(value.clone());
            }
            Ok(method_or_undefined(object, key, FUNCTION_METHODS))
        }
        Value::Number(_) => Ok(method_or_undefined(object, key, NUMBER_METHODS)),
        Value::Bool(_) => Ok(method_or_undefined(object, key, &["toString"])),
    }
}

/// Enumerable keys, as `for...in` and `Object.keys` see them.
pub fn own_keys(value: &Value) -> Vec<String> {
    match value {
        Value::Object(o) => o.borrow().properties.keys().cloned().collect(),
        Value::Array(items) => (0..items.borrow().len()).map(|i| i.to_string()).collect(),
        Value::Str(s) => (0..s.chars().count()).map(|i| i.to_string()).collect(),
        Value::Function(f) => f.properties.borrow().keys().cloned().collect(),
        _ => Vec::new(),
    }
}

pub fn own_entries(value: &Value) -> Vec<(String, Value)> {
    match value {
        Value::Object(o) => o
            .borrow()
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        Value::Array(items) => items
            .borrow()
            .iter()
            .enumerate()
            .map(|(i, v)| (i.to_string(), v.clone()))
            .collect(),
        Value::Str(s) => s
            .chars()
            .enumerate()
            .map(|(i, c)| (i.to_string(), Value::from(c.to_string())))
            .collect(),
        Value::Function(f) => f
            .properties
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        _ => Vec::new(),
    }
}

// ---- method dispatch ----

pub fn call_method(
    interp: &mut Interpreter,
    receiver: &Value,
    name: &str,
    args: Vec<Value>,
) -> Result<Value, Abrupt> {
    match receiver {
        Value::Undefined => call_static(interp, name, args),
        Value::Str(s) => string_method(interp, s, name, args),
        Value::Array(_) => array_method(interp, receiver, name, args),
        Value::Number(n) => number_method(interp, *n, name, args),
        Value::Bool(b) => Ok(Value::from(b.to_string())),
        Value::Function(function) => match name {
            "call" => {
                let mut args = args.into_iter();
                let this = args.next().unwrap_or_default();
                interp.call_function(function, this, args.collect())
            }
            "apply" => {
                let this = arg(&args, 0);
                let list = match arg(&args, 1) {
                    Value::Undefined | Value::Null => Vec::new(),
                    other => interp.collect_iterable(&other)?,
                };
                interp.call_function(function, this, list)
            }
            _ => Ok(Value::from(receiver.to_js_string())),
        },
        Value::Object(o) => match name {
            "hasOwnProperty" => {
                let key = arg(&args, 0).to_property_key();
                Ok(Value::Bool(o.borrow().properties.contains_key(&key)))
            }
            _ => Ok(Value::from(receiver.to_js_string())),
        },
        Value::Null => Err(interp.type_error(format!("{} is not a function", name))),
    }
}

fn call_static(interp: &mut Interpreter, name: &str, args: Vec<Value>) -> Result<Value, Abrupt> {
    if let Some(method) = name.strip_prefix("console.") {
        let line = args
            .iter()
            .map(Value::to_js_string)
            .collect::<Vec<_>>()
            .join(" ");
        interp.check_string(line.len())?;
        tracing::trace!(method = method, "script console output");
        interp.print(line)?;
        return Ok(Value::Undefined);
    }
    if let Some(function) = name.strip_prefix("Math.") {
        return math(function, &args);
    }

    match name {
        "JSON.stringify" => json_stringify(interp, &args),
        "JSON.parse" => {
            let text = arg(&args, 0).to_js_string();
            match serde_json::from_str::<Json>(&text) {
                Ok(json) => Ok(Value::from_json(&json)),
                Err(e) => Err(interp.throw("SyntaxError", format!("Unexpected token in JSON: {}", e))),
            }
        }

        "Object.keys" | "Object.values" | "Object.entries" if arg(&args, 0).is_nullish() => {
            Err(interp.type_error("Cannot convert undefined or null to object"))
        }
        "Object.keys" => Ok(Value::array(
            own_keys(&arg(&args, 0)).into_iter().map(Value::from).collect(),
        )),
        "Object.values" => Ok(Value::array(
            own_entries(&arg(&args, 0)).into_iter().map(|(_, v)| v).collect(),
        )),
        "Object.entries" => Ok(Value::array(
            own_entries(&arg(&args, 0))
                .into_iter()
                .map(|(k, v)| Value::array(vec![Value::from(k), v]))
                .collect(),
        )),
        "Object.assign" => {
            let target = arg(&args, 0);
            if target.is_nullish() {
                return Err(interp.type_error("Cannot convert undefined or null to object"));
            }
            for source in args.iter().skip(1) {
                for (key, value) in own_entries(source) {
                    interp.set_property(&target, &key, value)?;
                }
            }
            Ok(target)
        }
        "Object.fromEntries" => {
            let mut properties = IndexMap::new();
            for entry in interp.collect_iterable(&arg(&args, 0))? {
                let key = interp.get_property(&entry, "0")?.to_property_key();
                let value = interp.get_property(&entry, "1")?;
                properties.insert(key, value);
            }
            interp.check_collection(properties.len())?;
            Ok(Value::object(properties))
        }
        // Objects are never shared outside the script; freezing is a no-op.
        "Object.freeze" => Ok(arg(&args, 0)),

        "Array.isArray" => Ok(Value::Bool(matches!(arg(&args, 0), Value::Array(_)))),
        "Array.of" => Ok(Value::array(args)),
        "Array.from" => {
            let source = arg(&args, 0);
            let items = match &source {
                Value::Array(_) | Value::Str(_) => interp.collect_iterable(&source)?,
                Value::Object(_) => {
                    let len = to_integer(interp.get_property(&source, "length")?.to_number());
                    let len = len.max(0.0) as usize;
                    interp.check_collection(len)?;
                    let mut items = Vec::with_capacity(len);
                    for index in 0..len {
                        items.push(interp.get_property(&source, &index.to_string())?);
                    }
                    items
                }
                Value::Undefined | Value::Null => {
                    return Err(interp.type_error(format!(
                        "{} is not iterable",
                        source.to_js_string()
                    )))
                }
                _ => Vec::new(),
            };
            match args.get(1) {
                Some(map) if !map.is_nullish() => {
                    let mut mapped = Vec::with_capacity(items.len());
                    for (index, item) in items.into_iter().enumerate() {
                        mapped.push(interp.call_value(
                            map,
                            Value::Undefined,
                            vec![item, Value::Number(index as f64)],
                        )?);
                    }
                    Ok(Value::array(mapped))
                }
                _ => Ok(Value::array(items)),
            }
        }

        "String.fromCharCode" => {
            let text: String = args
                .iter()
                .map(|code| {
                    char::from_u32(to_uint32(code.to_number()) & 0xFFFF)
                        .unwrap_or(char::REPLACEMENT_CHARACTER)
                })
                .collect();
            Ok(Value::from(text))
        }

        "Number.isInteger" => Ok(Value::Bool(
            matches!(arg(&args, 0), Value::Number(n) if n.is_finite() && n.fract() == 0.0),
        )),
        "Number.isSafeInteger" => Ok(Value::Bool(matches!(
            arg(&args, 0),
            Value::Number(n) if n.fract() == 0.0 && n.abs() <= 9_007_199_254_740_991.0
        ))),
        "Number.isFinite" => Ok(Value::Bool(
            matches!(arg(&args, 0), Value::Number(n) if n.is_finite()),
        )),
        "Number.isNaN" => Ok(Value::Bool(
            matches!(arg(&args, 0), Value::Number(n) if n.is_nan()),
        )),
        "parseFloat" | "Number.parseFloat" => {
            Ok(Value::Number(parse_float(&arg(&args, 0).to_js_string())))
        }
        "parseInt" | "Number.parseInt" => {
            let radix = match arg(&args, 1) {
                Value::Undefined => 0,
                other => to_integer(other.to_number()) as i64,
            };
            Ok(Value::Number(parse_int(&arg(&args, 0).to_js_string(), radix)))
        }
        "isNaN" => Ok(Value::Bool(arg(&args, 0).to_number().is_nan())),
        "isFinite" => Ok(Value::Bool(arg(&args, 0).to_number().is_finite())),

        other => Err(interp.type_error(format!("{} is not a function", other))),
    }
}

fn math(function: &str, args: &[Value]) -> Result<Value, Abrupt> {
    let x = arg(args, 0).to_number();
    let y = arg(args, 1).to_number();
    let result = match function {
        "abs" => x.abs(),
        "acos" => x.acos(),
        "asin" => x.asin(),
        "atan" => x.atan(),
        "atan2" => x.atan2(y),
        "cbrt" => x.cbrt(),
        "ceil" => x.ceil(),
        "cos" => x.cos(),
        "exp" => x.exp(),
        "floor" => x.floor(),
        "hypot" => args
            .iter()
            .map(|v| v.to_number().powi(2))
            .sum::<f64>()
            .sqrt(),
        "log" => x.ln(),
        "log10" => x.log10(),
        "log2" => x.log2(),
        "max" => args.iter().map(Value::to_number).fold(f64::NEG_INFINITY, |acc, n| {
            if acc.is_nan() || n.is_nan() {
                f64::NAN
            } else {
                acc.max(n)
            }
        }),
        "min" => args.iter().map(Value::to_number).fold(f64::INFINITY, |acc, n| {
            if acc.is_nan() || n.is_nan() {
                f64::NAN
            } else {
                acc.min(n)
            }
        }),
        "pow" => x.powf(y),
        "random" => rand::random::<f64>(),
        "round" => (x + 0.5).floor(),
        "sign" => {
            if x.is_nan() || x == 0.0 {
                x
            } else {
                x.signum()
            }
        }
        "sin" => x.sin(),
        "sqrt" => x.sqrt(),
        "tan" => x.tan(),
        _ => x.trunc(),
    };
    Ok(Value::Number(result))
}

// ---- JSON ----

fn json_stringify(interp: &mut Interpreter, args: &[Value]) -> Result<Value, Abrupt> {
    let indent = match arg(args, 2) {
        Value::Number(n) => " ".repeat(to_integer(n).clamp(0.0, 10.0) as usize),
        Value::Str(s) => s.chars().take(10).collect(),
        _ => String::new(),
    };
    let mut stack = Vec::new();
    match stringify(interp, &arg(args, 0), &indent, "", &mut stack)? {
        Some(text) => {
            interp.check_string(text.len())?;
            Ok(Value::from(text))
        }
        None => Ok(Value::Undefined),
    }
}

/// `None` for values JSON leaves out (`undefined`, functions).
fn stringify(
    interp: &mut Interpreter,
    value: &Value,
    indent: &str,
    current: &str,
    stack: &mut Vec<*const ()>,
) -> Result<Option<String>, Abrupt> {
    let (ptr, entries, is_array) = match value {
        Value::Undefined | Value::Function(_) => return Ok(None),
        Value::Null => return Ok(Some("null".to_string())),
        Value::Bool(b) => return Ok(Some(b.to_string())),
        Value::Number(n) if n.is_finite() => return Ok(Some(number_to_string(*n))),
        Value::Number(_) => return Ok(Some("null".to_string())),
        Value::Str(s) => return Ok(Some(quote(s))),
        Value::Array(items) => (Rc::as_ptr(items) as *const (), own_entries(value), true),
        Value::Object(o) => (Rc::as_ptr(o) as *const (), own_entries(value), false),
    };

    if stack.contains(&ptr) {
        return Err(interp.type_error("Converting circular structure to JSON"));
    }
    if stack.len() >= MAX_WALK_DEPTH {
        return Err(Abrupt::Fatal(ScriptError::StackOverflow));
    }
    stack.push(ptr);

    let inner = format!("{}{}", current, indent);
    let mut parts = Vec::with_capacity(entries.len());
    for (key, item) in &entries {
        let text = stringify(interp, item, indent, &inner, stack)?;
        match (is_array, text) {
            (true, text) => parts.push(text.unwrap_or_else(|| "null".to_string())),
            (false, Some(text)) => {
                let separator = if indent.is_empty() { ":" } else { ": " };
                parts.push(format!("{}{}{}", quote(key), separator, text));
            }
            (false, None) => {}
        }
    }
    stack.pop();

    let (open, close) = if is_array { ("[", "]") } else { ("{", "}") };
    if parts.is_empty() {
        return Ok(Some(format!("{}{}", open, close)));
    }
    let text = if indent.is_empty() {
        format!("{}{}{}", open, parts.join(","), close)
    } else {
        format!(
            "{}\n{}{}\n{}{}",
            open,
            inner,
            parts.join(&format!(",\n{}", inner)),
            current,
            close
        )
    };
    Ok(Some(text))
}

fn quote(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s))
}

// ---- numbers ----

fn parse_float(text: &str) -> f64 {
    let text = text.trim_start();
    let (sign, rest) = match text.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, text.strip_prefix('+').unwrap_or(text)),
    };
    if rest.starts_with("Infinity") {
        return sign * f64::INFINITY;
    }

    let bytes = rest.as_bytes();
    let digits = |mut i: usize| {
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        i
    };
    let mut end = digits(0);
    let mut seen_digit = end > 0;
    if end < bytes.len() && bytes[end] == b'.' {
        let after = digits(end + 1);
        seen_digit |= after > end + 1;
        end = after;
    }
    if !seen_digit {
        return f64::NAN;
    }
    if end < bytes.len() && matches!(bytes[end], b'e' | b'E') {
        let mut exp = end + 1;
        if exp < bytes.len() && matches!(bytes[exp], b'+' | b'-') {
            exp += 1;
        }
        let after = digits(exp);
        if after > exp {
            end = after;
        }
    }
    rest[..end].parse::<f64>().map_or(f64::NAN, |v| sign * v)
}

fn parse_int(text: &str, radix: i64) -> f64 {
    let text = text.trim_start();
    let (sign, mut rest) = match text.strip_prefix('-') {
        Some(rest) => (-1.0, rest),
        None => (1.0, text.strip_prefix('+').unwrap_or(text)),
    };
    let mut radix = radix;
    if radix == 0 || radix == 16 {
        if let Some(hex) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")) {
            rest = hex;
            radix = 16;
        }
    }
    if radix == 0 {
        radix = 10;
    }
    if !(2..=36).contains(&radix) {
        return f64::NAN;
    }

    let mut value = 0.0;
    let mut any = false;
    for c in rest.chars() {
        let Some(digit) = c.to_digit(radix as u32) else {
            break;
        };
        value = value * radix as f64 + f64::from(digit);
        any = true;
    }
    if any {
        sign * value
    } else {
        f64::NAN
    }
}

fn number_method(interp: &mut Interpreter, n: f64, name: &str, args: Vec<Value>) -> Result<Value, Abrupt> {
    match name {
        "toFixed" => {
            let digits = to_integer(arg(&args, 0).to_number());
            if !(0.0..=100.0).contains(&digits) {
                return Err(interp.range_error("toFixed() digits argument must be between 0 and 100"));
            }
            if !n.is_finite() || n.abs() >= 1e21 {
                return Ok(Value::from(number_to_string(n)));
            }
            Ok(Value::from(format!("{:.*}", digits as usize, n)))
        }
        "toPrecision" => {
            let precision = match arg(&args, 0) {
                Value::Undefined => return Ok(Value::from(number_to_string(n))),
                other => to_integer(other.to_number()),
            };
            if !n.is_finite() {
                return Ok(Value::from(number_to_string(n)));
            }
            if !(1.0..=100.0).contains(&precision) {
                return Err(interp.range_error("toPrecision() argument must be between 1 and 100"));
            }
            Ok(Value::from(to_precision(n, precision as usize)))
        }
        _ => {
            let radix = match arg(&args, 0) {
                Value::Undefined => 10,
                other => to_integer(other.to_number()) as i64,
            };
            if !(2..=36).contains(&radix) {
                return Err(interp.range_error("toString() radix must be between 2 and 36"));
            }
            if radix == 10 || !n.is_finite() {
                return Ok(Value::from(number_to_string(n)));
            }
            Ok(Value::from(to_radix(n, radix as u32)))
        }
    }
}

fn to_precision(n: f64, precision: usize) -> String {
    if n == 0.0 {
        return format!("{:.*}", precision - 1, 0.0);
    }
    let formatted = format!("{:.*e}", precision - 1, n);
    let (mantissa, exponent) = formatted.split_once('e').unwrap_or((formatted.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    if exponent < -6 || exponent >= precision as i32 {
        let sign = if exponent < 0 { "-" } else { "+" };
        return format!("{}e{}{}", mantissa, sign, exponent.abs());
    }
    let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
    format!("{:.*}", decimals, n)
}

fn to_radix(n: f64, radix: u32) -> String {
    let negative = n < 0.0;
    let n = n.abs();
    let mut int = n.trunc();
    let mut frac = n - int;
    let radix_f = f64::from(radix);

    let mut digits = Vec::new();
    loop {
        let digit = (int % radix_f) as u32;
        digits.push(std::char::from_digit(digit, radix).unwrap_or('0'));
        int = (int / radix_f).trunc();
        if int < 1.0 {
            break;
        }
    }
    digits.reverse();
    let mut text: String = digits.into_iter().collect();

    if frac > 0.0 {
        text.push('.');
        for _ in 0..20 {
            frac *= radix_f;
            let digit = frac.trunc() as u32;
            text.push(std::char::from_digit(digit, radix).unwrap_or('0'));
            frac -= frac.trunc();
            if frac <= 0.0 {
                break;
            }
        }
    }
    if negative {
        format!("-{}", text)
    } else {
        text
    }
}

// ---- strings ----

/// Resolve a possibly negative index against `len`, as `slice` does.
fn relative_index(value: &Value, len: usize, default: usize) -> usize {
    if let Value::Undefined = value {
        return default;
    }
    let n = to_integer(value.to_number());
    if n < 0.0 {
        (len as f64 + n).max(0.0) as usize
    } else {
        n.min(len as f64) as usize
    }
}

/// Last index a backwards search may start from, as array `lastIndexOf`
/// reads its `fromIndex`; `None` when nothing is searchable.
fn last_search_index(value: &Value, len: usize) -> Option<usize> {
    if len == 0 {
        return None;
    }
    let n = match value {
        Value::Undefined => return Some(len - 1),
        other => to_integer(other.to_number()),
    };
    if n < 0.0 {
        let k = len as f64 + n;
        (k >= 0.0).then_some(k as usize)
    } else {
        Some(n.min((len - 1) as f64) as usize)
    }
}

fn clamp_index(value: &Value, len: usize, default: usize) -> usize {
    if let Value::Undefined = value {
        return default;
    }
    to_integer(value.to_number()).clamp(0.0, len as f64) as usize
}

/// Char index of `needle` in `haystack`, searching from char `from`.
fn char_index_of(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    let start = haystack
        .char_indices()
        .nth(from)
        .map_or(haystack.len(), |(b, _)| b);
    haystack[start..]
        .find(needle)
        .map(|b| haystack[..start + b].chars().count())
}

fn string_method(
    interp: &mut Interpreter,
    s: &Rc<str>,
    name: &str,
    args: Vec<Value>,
) -> Result<Value, Abrupt> {
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len();
    let text = |range: std::ops::Range<usize>| -> Value {
        Value::from(chars[range].iter().collect::<String>())
    };
    let a0 = arg(&args, 0);
    let a1 = arg(&args, 1);

    Ok(match name {
        "at" => {
            let n = to_integer(a0.to_number());
            let index = if n < 0.0 { len as f64 + n } else { n };
            if index < 0.0 || index >= len as f64 {
                Value::Undefined
            } else {
                text(index as usize..index as usize + 1)
            }
        }
        "charAt" => {
            let index = to_integer(a0.to_number());
            if index < 0.0 || index >= len as f64 {
                Value::from("")
            } else {
                text(index as usize..index as usize + 1)
            }
        }
        "charCodeAt" => {
            let index = to_integer(a0.to_number());
            if index < 0.0 || index >= len as f64 {
                Value::Number(f64::NAN)
            } else {
                Value::Number(f64::from(u32::from(chars[index as usize])))
            }
        }
        "concat" => {
            let mut out = s.to_string();
            for value in &args {
                out.push_str(&value.to_js_string());
            }
            interp.check_string(out.len())?;
            Value::from(out)
        }
        "endsWith" => {
            let end = clamp_index(&a1, len, len);
            let head: String = chars[..end].iter().collect();
            Value::Bool(head.ends_with(a0.to_js_string().as_str()))
        }
        "startsWith" => {
            let from = clamp_index(&a1, len, 0);
            let rest: String = chars[from..].iter().collect();
            Value::Bool(rest.starts_with(a0.to_js_string().as_str()))
        }
        "includes" => {
            let from = clamp_index(&a1, len, 0);
            Value::Bool(char_index_of(s, &a0.to_js_string(), from).is_some())
        }
        "indexOf" => {
            let from = clamp_index(&a1, len, 0);
            Value::Number(char_index_of(s, &a0.to_js_string(), from).map_or(-1.0, |i| i as f64))
        }
        "lastIndexOf" => {
            let needle: Vec<char> = a0.to_js_string().chars().collect();
            let position = match a1.to_number() {
                n if n.is_nan() => len,
                n => to_integer(n).clamp(0.0, len as f64) as usize,
            };
            let found = if needle.len() > len {
                None
            } else {
                (0..=position.min(len - needle.len()))
                    .rev()
                    .find(|&i| chars[i..i + needle.len()] == needle[..])
            };
            Value::Number(found.map_or(-1.0, |i| i as f64))
        }
        "localeCompare" => {
            let other = a0.to_js_string();
            Value::Number(match (**s).cmp(other.as_str()) {
                Ordering::Less => -1.0,
                Ordering::Equal => 0.0,
                Ordering::Greater => 1.0,
            })
        }
        "padEnd" | "padStart" => {
            let target = to_integer(a0.to_number()).max(0.0) as usize;
            let pad = match a1 {
                Value::Undefined => " ".to_string(),
                other => other.to_js_string(),
            };
            if target <= len || pad.is_empty() {
                return Ok(Value::Str(s.clone()));
            }
            interp.check_string(target)?;
            let filler: String = pad.chars().cycle().take(target - len).collect();
            if name == "padEnd" {
                Value::from(format!("{}{}", s, filler))
            } else {
                Value::from(format!("{}{}", filler, s))
            }
        }
        "repeat" => {
            let count = to_integer(a0.to_number());
            if count < 0.0 || !count.is_finite() {
                return Err(interp.range_error(format!(
                    "Invalid count value: {}",
                    number_to_string(count)
                )));
            }
            interp.check_string(s.len().saturating_mul(count as usize))?;
            Value::from(s.repeat(count as usize))
        }
        "replace" | "replaceAll" => {
            let pattern = a0.to_js_string();
            let mut out = String::new();
            let mut rest: &str = s;
            let mut offset = 0;
            while let Some(position) = rest.find(pattern.as_str()) {
                out.push_str(&rest[..position]);
                let char_offset = offset + rest[..position].chars().count();
                let replacement = match &a1 {
                    Value::Function(_) => interp
                        .call_value(
                            &a1,
                            Value::Undefined,
                            vec![Value::from(pattern.as_str()), Value::Number(char_offset as f64)],
                        )?
                        .to_js_string(),
                    other => other.to_js_string(),
                };
                out.push_str(&replacement);
                interp.check_string(out.len())?;

                let consumed = position + pattern.len();
                offset = char_offset + pattern.chars().count();
                if pattern.is_empty() {
                    // Step past one char so an empty pattern terminates.
                    match rest[consumed..].chars().next() {
                        Some(c) if name == "replaceAll" => {
                            out.push(c);
                            rest = &rest[consumed + c.len_utf8()..];
                            offset += 1;
                            continue;
                        }
                        _ => {
                            rest = &rest[consumed..];
                            break;
                        }
                    }
                }
                rest = &rest[consumed..];
                if name == "replace" {
                    break;
                }
            }
            out.push_str(rest);
            Value::from(out)
        }
        "slice" => {
            let start = relative_index(&a0, len, 0);
            let end = relative_index(&a1, len, len);
            if start >= end {
                Value::from("")
            } else {
                text(start..end)
            }
        }
        "split" => {
            let limit = match arg(&args, 1) {
                Value::Undefined => usize::MAX,
                other => to_uint32(other.to_number()) as usize,
            };
            let parts: Vec<Value> = match a0 {
                Value::Undefined => vec![Value::Str(s.clone())],
                separator => {
                    let separator = separator.to_js_string();
                    if separator.is_empty() {
                        chars.iter().map(|c| Value::from(c.to_string())).collect()
                    } else {
                        s.split(separator.as_str()).map(Value::from).collect()
                    }
                }
            };
            interp.check_collection(parts.len())?;
            Value::array(parts.into_iter().take(limit).collect())
        }
        "substr" => {
            let start = relative_index(&a0, len, 0);
            let count = match a1 {
                Value::Undefined => len,
                other => to_integer(other.to_number()).max(0.0) as usize,
            };
            let end = start.saturating_add(count).min(len);
            text(start..end.max(start))
        }
        "substring" => {
            let mut start = clamp_index(&a0, len, 0);
            let mut end = clamp_index(&a1, len, len);
            if start > end {
                std::mem::swap(&mut start, &mut end);
            }
            text(start..end)
        }
        "toLowerCase" => Value::from(s.to_lowercase()),
        "toUpperCase" => Value::from(s.to_uppercase()),
        "trim" => Value::from(s.trim()),
        "trimEnd" => Value::from(s.trim_end()),
        "trimStart" => Value::from(s.trim_start()),
        _ => Value::Str(s.clone()),
    })
}

// ---- arrays ----

fn callback(interp: &Interpreter, args: &[Value]) -> Result<Value, Abrupt> {
    match args.first() {
        Some(f @ Value::Function(_)) => Ok(f.clone()),
        other => Err(interp.type_error(format!(
            "{} is not a function",
            describe_value(&other.cloned().unwrap_or_default())
        ))),
    }
}

fn array_method(
    interp: &mut Interpreter,
    receiver: &Value,
    name: &str,
    args: Vec<Value>,
) -> Result<Value, Abrupt> {
    let Value::Array(items) = receiver else {
        return Ok(Value::Undefined);
    };
    let len = items.borrow().len();
    let get = |index: usize| items.borrow().get(index).cloned().unwrap_or_default();
    let a0 = arg(&args, 0);
    let a1 = arg(&args, 1);

    match name {
        "push" => {
            interp.check_collection(len + args.len())?;
            items.borrow_mut().extend(args);
            Ok(Value::Number(items.borrow().len() as f64))
        }
        "pop" => Ok(items.borrow_mut().pop().unwrap_or_default()),
        "shift" => {
            let mut items = items.borrow_mut();
            Ok(if items.is_empty() {
                Value::Undefined
            } else {
                items.remove(0)
            })
        }
        "unshift" => {
            interp.check_collection(len + args.len())?;
            items.borrow_mut().splice(0..0, args);
            Ok(Value::Number(items.borrow().len() as f64))
        }
        "at" => {
            let n = to_integer(a0.to_number());
            let index = if n < 0.0 { len as f64 + n } else { n };
            Ok(if index < 0.0 { Value::Undefined } else { get(index as usize) })
        }
        "slice" => {
            let start = relative_index(&a0, len, 0);
            let end = relative_index(&a1, len, len);
            let slice = items.borrow().get(start..end.max(start)).unwrap_or_default().to_vec();
            Ok(Value::array(slice))
        }
        "splice" => {
            let start = relative_index(&a0, len, 0);
            let delete = match args.len() {
                0 => 0,
                1 => len - start,
                _ => (to_integer(a1.to_number()).max(0.0) as usize).min(len - start),
            };
            let inserted: Vec<Value> = args.into_iter().skip(2).collect();
            interp.check_collection(len - delete + inserted.len())?;
            let removed: Vec<Value> = items
                .borrow_mut()
                .splice(start..start + delete, inserted)
                .collect();
            Ok(Value::array(removed))
        }
        "concat" => {
            let mut out = items.borrow().clone();
            for value in &args {
                match value {
                    Value::Array(other) => out.extend(other.borrow().iter().cloned()),
                    other => out.push(other.clone()),
                }
                interp.check_collection(out.len())?;
            }
            Ok(Value::array(out))
        }
        "join" | "toString" => {
            let separator = match (name, &a0) {
                ("join", Value::Undefined) | ("toString", _) => ",".to_string(),
                (_, other) => other.to_js_string(),
            };
            let snapshot = items.borrow().clone();
            let mut out = String::new();
            for (index, item) in snapshot.iter().enumerate() {
                if index > 0 {
                    out.push_str(&separator);
                }
                if !item.is_nullish() {
                    out.push_str(&item.to_js_string());
                }
                interp.check_string(out.len())?;
            }
            Ok(Value::from(out))
        }
        "reverse" => {
            items.borrow_mut().reverse();
            Ok(receiver.clone())
        }
        "fill" => {
            let start = relative_index(&a1, len, 0);
            let end = relative_index(&arg(&args, 2), len, len);
            for slot in items.borrow_mut().iter_mut().take(end).skip(start) {
                *slot = a0.clone();
            }
            Ok(receiver.clone())
        }
        "includes" => {
            let from = relative_index(&a1, len, 0);
            Ok(Value::Bool(
                items.borrow().iter().skip(from).any(|item| same_value_zero(item, &a0)),
            ))
        }
        "indexOf" => {
            let from = relative_index(&a1, len, 0);
            Ok(Value::Number(
                items
                    .borrow()
                    .iter()
                    .enumerate()
                    .skip(from)
                    .find(|(_, item)| strict_equals(item, &a0))
                    .map_or(-1.0, |(i, _)| i as f64),
            ))
        }
        "lastIndexOf" => {
            let found = last_search_index(&a1, len).and_then(|start| {
                items
                    .borrow()
                    .iter()
                    .take(start + 1)
                    .rposition(|item| strict_equals(item, &a0))
            });
            Ok(Value::Number(found.map_or(-1.0, |i| i as f64)))
        }
        "keys" => Ok(Value::array((0..len).map(|i| Value::Number(i as f64)).collect())),
        "values" => Ok(Value::array(items.borrow().clone())),
        "entries" => Ok(Value::array(
            items
                .borrow()
                .iter()
                .enumerate()
                .map(|(i, v)| Value::array(vec![Value::Number(i as f64), v.clone()]))
                .collect(),
        )),
        "flat" => {
            let depth = match a0 {
                Value::Undefined => 1.0,
                other => to_integer(other.to_number()),
            };
            let depth = depth.clamp(0.0, MAX_WALK_DEPTH as f64) as usize;
            let snapshot = items.borrow().clone();
            let mut out = Vec::new();
            flatten(interp, &snapshot, depth, &mut out)?;
            Ok(Value::array(out))
        }
        "sort" => {
            let compare = match a0 {
                Value::Undefined => None,
                f @ Value::Function(_) => Some(f),
                _ => {
                    return Err(interp.type_error(
                        "The comparison function must be either a function or undefined",
                    ))
                }
            };
            let (defined, undefined): (Vec<Value>, Vec<Value>) = items
                .borrow()
                .iter()
                .cloned()
                .partition(|v| !matches!(v, Value::Undefined));
            let mut sorted = merge_sort(interp, defined, compare.as_ref())?;
            sorted.extend(undefined);
            *items.borrow_mut() = sorted;
            Ok(receiver.clone())
        }
        "reduce" | "reduceRight" => {
            let f = callback(interp, &args)?;
            let mut order: Vec<usize> = (0..len).collect();
            if name == "reduceRight" {
                order.reverse();
            }
            let mut order = order.into_iter();
            let mut acc = match args.get(1) {
                Some(initial) => initial.clone(),
                None => match order.next() {
                    Some(first) => get(first),
                    None => {
                        return Err(interp.type_error("Reduce of empty array with no initial value"))
                    }
                },
            };
            for index in order {
                let item = get(index);
                acc = interp.call_value(
                    &f,
                    Value::Undefined,
                    vec![acc, item, Value::Number(index as f64), receiver.clone()],
                )?;
            }
            Ok(acc)
        }
        _ => {
            let f = callback(interp, &args)?;
            let this = a1;
            let mut results = Vec::new();
            let indices: Box<dyn Iterator<Item = usize>> = if name.starts_with("findLast") {
                Box::new((0..len).rev())
            } else {
                Box::new(0..len)
            };
            for index in indices {
                let item = get(index);
                let result = interp.call_value(
                    &f,
                    this.clone(),
                    vec![item.clone(), Value::Number(index as f64), receiver.clone()],
                )?;
                match name {
                    "every" if !result.truthy() => return Ok(Value::Bool(false)),
                    "some" if result.truthy() => return Ok(Value::Bool(true)),
                    "find" | "findLast" if result.truthy() => return Ok(item),
                    "findIndex" | "findLastIndex" if result.truthy() => {
                        return Ok(Value::Number(index as f64))
                    }
                    "filter" if result.truthy() => results.push(item),
                    "map" => results.push(result),
                    "flatMap" => match result {
                        Value::Array(inner) => results.extend(inner.borrow().iter().cloned()),
                        other => results.push(other),
                    },
                    _ => {}
                }
                interp.check_collection(results.len())?;
            }
            Ok(match name {
                "every" => Value::Bool(true),
                "some" => Value::Bool(false),
                "findIndex" | "findLastIndex" => Value::Number(-1.0),
                "filter" | "map" | "flatMap" => Value::array(results),
                _ => Value::Undefined,
            })
        }
    }
}

fn flatten(interp: &Interpreter, items: &[Value], depth: usize, out: &mut Vec<Value>) -> Result<(), Abrupt> {
    for item in items {
        match item {
            Value::Array(inner) if depth > 0 => {
                let inner = inner.borrow().clone();
                flatten(interp, &inner, depth - 1, out)?;
            }
            other => out.push(other.clone()),
        }
        interp.check_collection(out.len())?;
    }
    Ok(())
}

/// Stable merge sort; the comparator may run script code and fail.
fn merge_sort(
    interp: &mut Interpreter,
    mut items: Vec<Value>,
    compare: Option<&Value>,
) -> Result<Vec<Value>, Abrupt> {
    if items.len() <= 1 {
        return Ok(items);
    }
    let right = items.split_off(items.len() / 2);
    let left = merge_sort(interp, items, compare)?;
    let right = merge_sort(interp, right, compare)?;

    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    while let (Some(a), Some(b)) = (left.peek(), right.peek()) {
        let take_left = match compare {
            Some(f) => {
                let order = interp
                    .call_value(f, Value::Undefined, vec![a.clone(), b.clone()])?
                    .to_number();
                !(order > 0.0)
            }
            None => a.to_js_string() <= b.to_js_string(),
        };
        let next = if take_left { left.next() } else { right.next() };
        merged.extend(next);
    }
    merged.extend(left);
    merged.extend(right);
    Ok(merged)
}
