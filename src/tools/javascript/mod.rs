//! Sandboxed JavaScript execution.
//!
//! Scripts run in a small tree-walking interpreter over a JavaScript
//! subset. The only globals are the ones [`builtins`] installs: there is
//! no `Date`, no timers, no `fetch`/`require`/`process` and no host access
//! of any kind. Every run is bounded by [`SandboxLimits`].
//!
//! Interpreter values are `Rc`-based and never leave the executing thread;
//! only the JSON-converted [`ScriptOutcome`] crosses back.

mod ast;
mod builtins;
mod interpreter;
mod lexer;
mod memory;
mod parser;
mod value;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::oneshot;

use super::{ensure_object, required_str, Tool, ToolError, ToolKind};
use interpreter::Interpreter;

pub use memory::CountingAllocator;

/// Stack reserved for the interpreter thread; evaluation depth is capped
/// well below what this can hold.
const SANDBOX_STACK_SIZE: usize = 256 * 1024 * 1024;

/// Why a script did not complete.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScriptError {
    #[error("SyntaxError: {message} (line {line})")]
    Syntax { message: String, line: usize },
    /// An exception escaped the script, already rendered (`TypeError: ...`).
    #[error("{0}")]
    Uncaught(String),
    #[error("RangeError: Maximum call stack size exceeded")]
    StackOverflow,
    #[error("Script exceeded the step budget of {0} evaluation steps")]
    StepBudget(u64),
    #[error("Script exceeded the output limit of {0} lines")]
    OutputLimit(usize),
    #[error("RangeError: Script exceeded the memory limit of {0} bytes")]
    MemoryLimit(usize),
}

/// Resource limits applied to one script run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLimits {
    pub max_steps: u64,
    pub max_call_depth: usize,
    /// Largest array, object or split result.
    pub max_collection_len: usize,
    pub max_output_lines: usize,
    /// Longest string, in bytes.
    pub max_string_len: usize,
    /// Heap the script may hold at once, in bytes. Fully enforced only
    /// with [`CountingAllocator`] installed.
    pub max_memory_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            max_steps: 1_000_000,
            max_call_depth: 200,
            max_collection_len: 1_000_000,
            max_output_lines: 1_000,
            max_string_len: 16 * 1024 * 1024,
            max_memory_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Console lines and completion value of a finished script.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptOutcome {
    pub output: Vec<String>,
    pub result: Value,
}

/// Parse and run `code` on the current thread.
///
/// Deeply nested code recurses deeply; callers should run this on a thread
/// with a generous stack, as [`JavascriptSandbox`] does.
pub fn run_script(code: &str, limits: &SandboxLimits) -> Result<ScriptOutcome, ScriptError> {
    let program = parser::parse_program(code)?;
    let mut interpreter = Interpreter::new(limits.clone());
    let value = interpreter.run(&program)?;
    Ok(ScriptOutcome {
        output: interpreter.output().to_vec(),
        result: value.to_json(),
    })
}

/// The `execute_javascript` tool.
#[derive(Debug, Clone, Default)]
pub struct JavascriptSandbox {
    limits: SandboxLimits,
}

impl JavascriptSandbox {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Run a script on a dedicated thread and wait for it without blocking
    /// the runtime.
    pub async fn run(&self, code: &str) -> Result<Result<ScriptOutcome, ScriptError>, ToolError> {
        let (tx, rx) = oneshot::channel();
        let code = code.to_string();
        let limits = self.limits.clone();

        std::thread::Builder::new()
            .name("js-sandbox".to_string())
            .stack_size(SANDBOX_STACK_SIZE)
            .spawn(move || {
                let _ = tx.send(run_script(&code, &limits));
            })
            .map_err(|e| ToolError::Execution(format!("Failed to start script thread: {}", e)))?;

        rx.await
            .map_err(|_| ToolError::Execution("Script execution terminated unexpectedly".to_string()))
    }
}

#[async_trait]
impl Tool for JavascriptSandbox {
    fn kind(&self) -> ToolKind {
        ToolKind::ExecuteJavascript
    }

    fn display_name(&self) -> &str {
        "JavaScript Execution"
    }

    fn description(&self) -> &str {
        "Execute JavaScript code in a sandboxed environment"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "JavaScript code to execute"
                }
            },
            "required": ["code"]
        })
    }

    fn validate(&self, args: &Value) -> Result<(), ToolError> {
        ensure_object(args)?;
        required_str(args, "code")?;
        Ok(())
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let code = required_str(&args, "code")?;
        tracing::debug!(bytes = code.len(), "Running script");

        // Script failures are results the model should see, not tool errors.
        Ok(match self.run(code).await? {
            Ok(outcome) => json!({
                "code": code,
                "output": outcome.output,
                "result": outcome.result,
                "success": true,
            }),
            Err(e) => {
                tracing::debug!(error = %e, "Script failed");
                json!({
                    "code": code,
                    "error": e.to_string(),
                    "success": false,
                })
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs on a sandbox-sized stack, as the tool does.
    fn run_with(code: &str, limits: SandboxLimits) -> Result<ScriptOutcome, ScriptError> {
        let code = code.to_string();
        std::thread::Builder::new()
            .stack_size(SANDBOX_STACK_SIZE)
            .spawn(move || run_script(&code, &limits))
            .unwrap()
            .join()
            .unwrap()
    }

    fn run(code: &str) -> Result<ScriptOutcome, ScriptError> {
        run_with(code, SandboxLimits::default())
    }

    fn result(code: &str) -> Value {
        match run(code) {
            Ok(outcome) => outcome.result,
            Err(e) => panic!("script failed: {}", e),
        }
    }

    fn error(code: &str) -> String {
        match run(code) {
            Ok(outcome) => panic!("script succeeded with {}", outcome.result),
            Err(e) => e.to_string(),
        }
    }

    #[test]
    fn evaluates_expressions() {
        assert_eq!(result("1 + 1"), json!(2));
        assert_eq!(result("2 ** 10"), json!(1024));
        assert_eq!(result("0.1 + 0.2"), json!(0.30000000000000004));
        assert_eq!(result("'a' + 1 + 2"), json!("a12"));
        assert_eq!(result("7 % 3 === 1 && !false"), json!(true));
        assert_eq!(result(""), Value::Null);
    }

    #[test]
    fn recursive_factorial() {
        let code = "function factorial(n) { return n <= 1 ? 1 : n * factorial(n-1); } \
                    const result = factorial(10); \
                    console.log(`Factorial of 10: ${result}`); result;";
        let outcome = run(code).unwrap();
        assert_eq!(outcome.result, json!(3628800));
        assert_eq!(outcome.output, vec!["Factorial of 10: 3628800"]);
    }

    #[test]
    fn console_joins_arguments() {
        let outcome = run("console.log('a', 1, [1, 2], null); console.error('oops')").unwrap();
        assert_eq!(outcome.output, vec!["a 1 1,2 null", "oops"]);
        assert_eq!(outcome.result, Value::Null);
    }

    #[test]
    fn top_level_return_sets_result() {
        assert_eq!(result("return 5; 6"), json!(5));
    }

    #[test]
    fn host_capabilities_do_not_exist() {
        for name in ["fetch", "require", "process", "Date", "setTimeout", "globalThis", "eval"] {
            assert_eq!(
                error(&format!("{}()", name)),
                format!("ReferenceError: {} is not defined", name)
            );
        }
        assert_eq!(result("typeof fetch"), json!("undefined"));
    }

    #[test]
    fn infinite_loop_exhausts_step_budget() {
        let limits = SandboxLimits {
            max_steps: 10_000,
            ..SandboxLimits::default()
        };
        let err = run_with("while (true) {}", limits).unwrap_err();
        assert_eq!(err, ScriptError::StepBudget(10_000));
    }

    #[test]
    fn step_budget_cannot_be_caught() {
        let limits = SandboxLimits {
            max_steps: 10_000,
            ..SandboxLimits::default()
        };
        let err = run_with("try { for (;;) {} } catch (e) { 'caught' }", limits).unwrap_err();
        assert_eq!(err, ScriptError::StepBudget(10_000));
    }

    #[test]
    fn runaway_recursion_overflows() {
        let err = run("function f(n) { return f(n + 1); } f(0)").unwrap_err();
        assert_eq!(err, ScriptError::StackOverflow);
        assert_eq!(err.to_string(), "RangeError: Maximum call stack size exceeded");
    }

    #[test]
    fn output_limit_is_enforced() {
        let limits = SandboxLimits {
            max_output_lines: 3,
            ..SandboxLimits::default()
        };
        let err = run_with("for (let i = 0; i < 10; i++) console.log(i)", limits).unwrap_err();
        assert_eq!(err, ScriptError::OutputLimit(3));
    }

    #[test]
    fn collection_limit_is_a_range_error() {
        let limits = SandboxLimits {
            max_collection_len: 100,
            ..SandboxLimits::default()
        };
        let err = run_with("const a = []; for (let i = 0; i < 200; i++) a.push(i);", limits)
            .unwrap_err();
        assert!(err.to_string().starts_with("RangeError: Collection size 101"));
    }

    #[test]
    fn many_large_strings_hit_the_memory_limit() {
        let code = "const s = 'x'.repeat(8000000); const a = []; \
                    for (let i = 0; i < 1000; i++) a.push(s + i);";
        let err = run(code).unwrap_err();
        assert_eq!(err, ScriptError::MemoryLimit(256 * 1024 * 1024));
        assert!(err.to_string().starts_with("RangeError: Script exceeded the memory limit"));
    }

    #[test]
    fn memory_limit_cannot_be_caught() {
        let limits = SandboxLimits {
            max_memory_bytes: 32 * 1024 * 1024,
            ..SandboxLimits::default()
        };
        let code = "const kept = []; \
                    try { for (;;) kept.push('y'.repeat(1000000) + kept.length) } catch (e) { 'caught' }";
        let err = run_with(code, limits).unwrap_err();
        assert_eq!(err, ScriptError::MemoryLimit(32 * 1024 * 1024));
    }

    #[test]
    fn oversized_allocation_is_refused_up_front() {
        let limits = SandboxLimits {
            max_memory_bytes: 1024 * 1024,
            ..SandboxLimits::default()
        };
        let err = run_with("'x'.repeat(2000000).length", limits).unwrap_err();
        assert_eq!(err, ScriptError::MemoryLimit(1024 * 1024));
    }

    #[test]
    fn released_memory_does_not_count() {
        let limits = SandboxLimits {
            max_memory_bytes: 16 * 1024 * 1024,
            ..SandboxLimits::default()
        };
        let code = "let s = ''; \
                    for (let i = 0; i < 200; i++) { s = 'y'.repeat(1000000) + i; } \
                    s.length";
        let outcome = run_with(code, limits).unwrap();
        assert_eq!(outcome.result, json!(1000003));
    }

    #[test]
    fn search_positions_are_honored() {
        assert_eq!(result("'abc'.endsWith('c', -5)"), json!(false));
        assert_eq!(result("'abc'.endsWith('b', 2)"), json!(true));
        assert_eq!(result("'abcabc'.lastIndexOf('abc', 2)"), json!(0));
        assert_eq!(result("'abc'.lastIndexOf('z')"), json!(-1));
        assert_eq!(result("[1, 2, 3].lastIndexOf(3, -5)"), json!(-1));
        assert_eq!(result("[1, 2, 1].lastIndexOf(1, 1)"), json!(0));
        assert_eq!(result("[1, 2, 1].lastIndexOf(1, -1)"), json!(2));
        assert_eq!(result("[1, 2, 1].indexOf(1, 1)"), json!(2));
        assert_eq!(result("[1, 2, 3].includes(1, -2)"), json!(false));
    }

    #[test]
    fn object_keys_of_nullish_throws() {
        assert_eq!(
            result("try { Object.keys(null); 'no' } catch (e) { e.name }"),
            json!("TypeError")
        );
        assert!(error("Object.entries(undefined)").contains("TypeError"));
        assert_eq!(result("Object.keys('ab')"), json!(["0", "1"]));
    }

    #[test]
    fn non_finite_numbers_become_strings() {
        assert_eq!(result("1 / 0"), json!("Infinity"));
        assert_eq!(result("-1 / 0"), json!("-Infinity"));
        assert_eq!(result("0 / 0"), json!("NaN"));
        assert_eq!(result("[1 / 0, 2]"), json!(["Infinity", 2]));
    }

    #[test]
    fn exceptions() {
        assert_eq!(
            result("try { null.x } catch (e) { e.message }"),
            json!("Cannot read properties of null (reading 'x')")
        );
        assert_eq!(
            result("let r = []; try { throw new RangeError('bad') } catch ({ name, message }) { r.push(name, message) } finally { r.push('done') } r"),
            json!(["RangeError", "bad", "done"])
        );
        assert_eq!(error("throw new TypeError('nope')"), "TypeError: nope");
        assert_eq!(error("throw 42"), "Uncaught 42");
        assert_eq!(error("undefinedFunction()"), "ReferenceError: undefinedFunction is not defined");
        assert_eq!(error("const x = 1; x = 2"), "TypeError: Assignment to constant variable.");
        assert_eq!(error("let o = {}; o.f()"), "TypeError: o.f is not a function");
        assert_eq!(result("(function () { try { return 1 } finally { 2 } })()"), json!(1));
    }

    #[test]
    fn syntax_errors_carry_line() {
        assert!(error("let x = 1;\nlet = ;").contains("(line 2)"));
        assert!(error("let x = 1;\nx +* 2").contains("(line 2)"));
        assert_eq!(error("class A {}"), "SyntaxError: 'class' is not supported (line 1)");
    }

    #[test]
    fn closures_and_scoping() {
        assert_eq!(
            result("const fns = []; for (let i = 0; i < 3; i++) fns.push(() => i); fns.map(f => f())"),
            json!([0, 1, 2])
        );
        assert_eq!(
            result("function counter() { let n = 0; return () => ++n; } const c = counter(); c(); c(); c()"),
            json!(3)
        );
        assert_eq!(result("var x = 1; { var x = 2; } x"), json!(2));
        assert_eq!(result("let y = 1; { let y = 2; } y"), json!(1));
        assert_eq!(result("hoisted(); function hoisted() { return 'ok' }"), json!("ok"));
        assert_eq!(result("const fact = function f(n) { return n ? n * f(n - 1) : 1 }; fact(5)"), json!(120));
    }

    #[test]
    fn destructuring_and_spread() {
        assert_eq!(
            result("const { a, b: [x, , y = 9], ...rest } = { a: 1, b: [2, 3], c: 4, d: 5 }; [a, x, y, rest]"),
            json!([1, 2, 9, { "c": 4, "d": 5 }])
        );
        assert_eq!(result("const f = (first, ...others) => others.length; f(1, 2, 3)"), json!(2));
        assert_eq!(result("Math.max(...[3, 9, 4])"), json!(9));
        assert_eq!(result("let a = 1, b = 2; [a, b] = [b, a]; [a, b]"), json!([2, 1]));
        assert_eq!(result("({ ...{ x: 1 }, y: 2 })"), json!({ "x": 1, "y": 2 }));
    }

    #[test]
    fn array_methods() {
        assert_eq!(
            result("[1, 2, 3, 4].filter(n => n % 2 === 0).map(n => n * 10)"),
            json!([20, 40])
        );
        assert_eq!(result("[1, 2, 3].reduce((a, b) => a + b, 0)"), json!(6));
        assert_eq!(result("[3, 1, 10, 2].sort()"), json!([1, 10, 2, 3]));
        assert_eq!(result("[3, 1, 10, 2].sort((a, b) => a - b)"), json!([1, 2, 3, 10]));
        assert_eq!(result("[[1, [2]], 3].flat(Infinity)"), json!([1, 2, 3]));
        assert_eq!(result("const a = [1, 2, 3, 4]; const r = a.splice(1, 2, 'x'); [a, r]"), json!([[1, "x", 4], [2, 3]]));
        assert_eq!(result("[1, 2, 3].includes(2) && [NaN].includes(NaN)"), json!(true));
        assert_eq!(result("['a', 'b'].join('-')"), json!("a-b"));
        assert_eq!(result("Array.from({ length: 3 }, (_, i) => i * i)"), json!([0, 1, 4]));
        assert_eq!(result("[5, 6].findIndex(n => n > 5)"), json!(1));
    }

    #[test]
    fn string_and_number_methods() {
        assert_eq!(result("'Hello'.toUpperCase() + 'abc'.slice(-2)"), json!("HELLObc"));
        assert_eq!(result("'a,b,,c'.split(',')"), json!(["a", "b", "", "c"]));
        assert_eq!(result("'aXbXc'.replaceAll('X', '-')"), json!("a-b-c"));
        assert_eq!(result("'7'.padStart(3, '0')"), json!("007"));
        assert_eq!(result("(3.14159).toFixed(2)"), json!("3.14"));
        assert_eq!(result("(255).toString(16)"), json!("ff"));
        assert_eq!(result("parseInt('42px') + parseFloat('1.5e1')"), json!(57));
        assert_eq!(result("Number('') + Number('0x1f')"), json!(31));
        assert_eq!(result("'héllo'.length"), json!(5));
        assert_eq!(result("`${1 + 1} items`"), json!("2 items"));
    }

    #[test]
    fn json_round_trip() {
        assert_eq!(
            result("JSON.stringify({ b: 1, a: [true, null, undefined], f() {} })"),
            json!(r#"{"b":1,"a":[true,null,null]}"#)
        );
        assert_eq!(result("JSON.parse('{\"x\": [1, 2]}').x[1]"), json!(2));
        assert_eq!(result("JSON.stringify([1], null, 2)"), json!("[\n  1\n]"));
        assert_eq!(
            error("const o = {}; o.self = o; JSON.stringify(o)"),
            "TypeError: Converting circular structure to JSON"
        );
        assert!(error("JSON.parse('{')").starts_with("SyntaxError: "));
    }

    #[test]
    fn objects_keep_insertion_order() {
        assert_eq!(
            result("const o = { z: 1, a: 2 }; o.m = 3; Object.keys(o)"),
            json!(["z", "a", "m"])
        );
        assert_eq!(result("Object.entries({ k: 'v' })"), json!([["k", "v"]]));
        assert_eq!(result("let s = ''; for (const k in { p: 1, q: 2 }) s += k; s"), json!("pq"));
    }

    #[test]
    fn constructors_and_prototypes() {
        let code = "function Point(x, y) { this.x = x; this.y = y; } \
                    Point.prototype.sum = function () { return this.x + this.y; }; \
                    const p = new Point(2, 3); [p.sum(), p instanceof Point]";
        assert_eq!(result(code), json!([5, true]));
        assert_eq!(result("new Error('x') instanceof Error"), json!(true));
    }

    #[test]
    fn control_flow() {
        let code = "let out = []; \
                    for (const n of [1, 2, 3, 4, 5, 6]) { \
                      if (n === 2) continue; \
                      if (n === 5) break; \
                      switch (n % 2) { case 0: out.push('even'); break; default: out.push('odd'); } \
                    } \
                    let i = 0; do { i++ } while (i < 3); out.push(i); out";
        assert_eq!(result(code), json!(["odd", "odd", "even", 3]));
        assert_eq!(result("let n = null; n?.x ?? 'none'"), json!("none"));
        assert_eq!(result("let c = 0; c ||= 5; c &&= c + 1; c"), json!(6));
    }

    #[test]
    fn deeply_nested_code_is_rejected() {
        let code = format!("{}1{}", "(".repeat(2000), ")".repeat(2000));
        let err = run(&code).unwrap_err();
        assert!(err.to_string().contains("nested too deeply"));
    }

    #[tokio::test]
    async fn tool_reports_success_payload() {
        let sandbox = JavascriptSandbox::default();
        let payload = sandbox
            .execute(json!({ "code": "console.log('hi'); 40 + 2" }))
            .await
            .unwrap();
        assert_eq!(
            payload,
            json!({ "code": "console.log('hi'); 40 + 2", "output": ["hi"], "result": 42, "success": true })
        );
    }

    #[tokio::test]
    async fn tool_reports_script_failures_as_payload() {
        let sandbox = JavascriptSandbox::default();
        let payload = sandbox.execute(json!({ "code": "fetch('x')" })).await.unwrap();
        assert_eq!(
            payload,
            json!({ "code": "fetch('x')", "error": "ReferenceError: fetch is not defined", "success": false })
        );
    }

    #[test]
    fn validation_requires_code() {
        let sandbox = JavascriptSandbox::default();
        assert!(sandbox.validate(&json!({})).is_err());
        assert!(sandbox.validate(&json!({ "code": "  " })).is_err());
        assert!(sandbox.validate(&json!({ "code": "1" })).is_ok());
    }
}
