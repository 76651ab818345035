//! Tree-walking evaluator with step, depth, size and memory limits.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use super::ast::*;
use super::builtins;
use super::memory;
use super::value::{
    array_index, loose_equals, number_to_string, strict_equals, to_int32, to_uint32, Function,
    FunctionKind, Object, ObjectClass, Value,
};
use super::{SandboxLimits, ScriptError};

/// Deepest evaluator recursion, counting statements, expressions and calls.
const MAX_EVAL_DEPTH: usize = 4096;

/// Non-local exits from evaluation.
pub enum Abrupt {
    /// A script-level exception; `try/catch` can handle it.
    Throw(Value),
    /// A resource limit was hit; ends the script regardless of `catch`.
    Fatal(ScriptError),
}

enum Flow {
    Normal,
    Return(Value),
    Break,
    Continue,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BindingKind {
    Var,
    Let,
    Const,
}

#[derive(Clone)]
struct Binding {
    value: Value,
    kind: BindingKind,
}

/// Lexical scope chain.
#[derive(Clone)]
pub struct Env(Rc<Scope>);

struct Scope {
    vars: RefCell<HashMap<String, Binding>>,
    parent: Option<Env>,
    function_scope: bool,
}

impl Env {
    fn root() -> Self {
        Env(Rc::new(Scope {
            vars: RefCell::new(HashMap::new()),
            parent: None,
            function_scope: true,
        }))
    }

    fn child(&self, function_scope: bool) -> Self {
        Env(Rc::new(Scope {
            vars: RefCell::new(HashMap::new()),
            parent: Some(self.clone()),
            function_scope,
        }))
    }

    /// Sibling scope with copies of this scope's bindings.
    fn fork(&self) -> Self {
        Env(Rc::new(Scope {
            vars: RefCell::new(self.0.vars.borrow().clone()),
            parent: self.0.parent.clone(),
            function_scope: self.0.function_scope,
        }))
    }

    pub(crate) fn define_builtin(&self, name: &str, value: Value) {
        self.0.vars.borrow_mut().insert(
            name.to_string(),
            Binding {
                value,
                kind: BindingKind::Var,
            },
        );
    }

    fn declare(&self, name: &str, value: Value, kind: BindingKind) -> Result<(), String> {
        let mut vars = self.0.vars.borrow_mut();
        if let Some(existing) = vars.get(name) {
            if kind != BindingKind::Var || existing.kind != BindingKind::Var {
                return Err(format!("Identifier '{}' has already been declared", name));
            }
        }
        vars.insert(name.to_string(), Binding { value, kind });
        Ok(())
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        let mut scope = Some(self);
        while let Some(env) = scope {
            if let Some(binding) = env.0.vars.borrow().get(name) {
                return Some(binding.value.clone());
            }
            scope = env.0.parent.as_ref();
        }
        None
    }

    fn assign(&self, name: &str, value: Value) -> Result<(), AssignError> {
        let mut scope = Some(self);
        while let Some(env) = scope {
            if let Some(binding) = env.0.vars.borrow_mut().get_mut(name) {
                if binding.kind == BindingKind::Const {
                    return Err(AssignError::Constant);
                }
                binding.value = value;
                return Ok(());
            }
            scope = env.0.parent.as_ref();
        }
        Err(AssignError::Undeclared)
    }

    fn var_scope(&self) -> Env {
        let mut env = self.clone();
        while !env.0.function_scope {
            match env.0.parent.clone() {
                Some(parent) => env = parent,
                None => break,
            }
        }
        env
    }

    fn clear(&self) {
        let vars = std::mem::take(&mut *self.0.vars.borrow_mut());
        drop(vars);
    }
}

enum AssignError {
    Constant,
    Undeclared,
}

/// How a pattern introduces its names.
#[derive(Clone, Copy)]
enum BindMode {
    Declare(BindingKind),
    Assign,
}

/// A resolved assignment target.
enum Place {
    Variable(String),
    Property(Value, String),
}

pub struct Interpreter {
    limits: SandboxLimits,
    steps: u64,
    call_depth: usize,
    eval_depth: usize,
    builtins: Env,
    output: Vec<String>,
    completion: Value,
    /// Scopes captured by closures, torn down after the run.
    captured: Vec<Weak<Scope>>,
    /// Thread allocation balance before the script started.
    memory_baseline: isize,
}

impl Interpreter {
    pub fn new(limits: SandboxLimits) -> Self {
        let memory_baseline = memory::thread_balance();
        let builtins = Env::root();
        builtins::install(&builtins);
        Self {
            limits,
            steps: 0,
            call_depth: 0,
            eval_depth: 0,
            builtins,
            output: Vec::new(),
            completion: Value::Undefined,
            captured: Vec::new(),
            memory_baseline,
        }
    }

    pub fn output(&self) -> &[String] {
        &self.output
    }

    /// Run a whole program; returns its completion value.
    pub fn run(&mut self, program: &[Stmt]) -> Result<Value, ScriptError> {
        let global = self.builtins.child(true);
        let result = self.run_in(program, &global);
        // Break closure/scope cycles so the heap can be freed.
        for scope in std::mem::take(&mut self.captured) {
            if let Some(scope) = scope.upgrade() {
                Env(scope).clear();
            }
        }
        global.clear();
        self.builtins.clear();
        result
    }

    fn run_in(&mut self, program: &[Stmt], global: &Env) -> Result<Value, ScriptError> {
        let flow = self
            .hoist_vars(program, global)
            .and_then(|_| self.exec_block(program, global));
        match flow {
            Ok(Flow::Return(value)) => Ok(value),
            Ok(_) => Ok(std::mem::take(&mut self.completion)),
            Err(Abrupt::Fatal(error)) => Err(error),
            Err(Abrupt::Throw(value)) => Err(ScriptError::Uncaught(describe_thrown(&value))),
        }
    }

    // ---- limits ----

    fn tick(&mut self) -> Result<(), Abrupt> {
        self.steps += 1;
        if self.steps > self.limits.max_steps {
            return Err(Abrupt::Fatal(ScriptError::StepBudget(self.limits.max_steps)));
        }
        self.check_memory(0)
    }

    /// Fail if the script's heap plus `incoming` more bytes would exceed
    /// the memory limit.
    fn check_memory(&self, incoming: usize) -> Result<(), Abrupt> {
        let held = memory::thread_balance()
            .saturating_sub(self.memory_baseline)
            .max(0) as usize;
        if held.saturating_add(incoming) > self.limits.max_memory_bytes {
            return Err(Abrupt::Fatal(ScriptError::MemoryLimit(
                self.limits.max_memory_bytes,
            )));
        }
        Ok(())
    }

    fn enter(&mut self) -> Result<(), Abrupt> {
        self.tick()?;
        if self.eval_depth >= MAX_EVAL_DEPTH {
            return Err(Abrupt::Fatal(ScriptError::StackOverflow));
        }
        self.eval_depth += 1;
        Ok(())
    }

    pub(crate) fn check_collection(&self, len: usize) -> Result<(), Abrupt> {
        if len > self.limits.max_collection_len {
            return Err(self.range_error(format!(
                "Collection size {} exceeds the limit of {}",
                len, self.limits.max_collection_len
            )));
        }
        self.check_memory(len.saturating_mul(std::mem::size_of::<Value>()))
    }

    pub(crate) fn check_string(&self, len: usize) -> Result<(), Abrupt> {
        if len > self.limits.max_string_len {
            return Err(self.range_error("Invalid string length"));
        }
        self.check_memory(len)
    }

    /// Record one line of console output.
    pub(crate) fn print(&mut self, line: String) -> Result<(), Abrupt> {
        if self.output.len() >= self.limits.max_output_lines {
            return Err(Abrupt::Fatal(ScriptError::OutputLimit(
                self.limits.max_output_lines,
            )));
        }
        self.output.push(line);
        Ok(())
    }

    // ---- errors ----

    pub(crate) fn throw(&self, name: &str, message: impl AsRef<str>) -> Abrupt {
        Abrupt::Throw(Value::error(name, message.as_ref()))
    }

    pub(crate) fn type_error(&self, message: impl AsRef<str>) -> Abrupt {
        self.throw("TypeError", message)
    }

    pub(crate) fn range_error(&self, message: impl AsRef<str>) -> Abrupt {
        self.throw("RangeError", message)
    }

    fn reference_error(&self, name: &str) -> Abrupt {
        self.throw("ReferenceError", format!("{} is not defined", name))
    }

    // ---- statements ----

    /// Pre-declare `var` names of a function body as `undefined`.
    fn hoist_vars(&mut self, stmts: &[Stmt], env: &Env) -> Result<(), Abrupt> {
        let mut names = Vec::new();
        for stmt in stmts {
            collect_var_names(stmt, &mut names);
        }
        for name in names {
            if env.lookup_own(&name).is_none() {
                env.declare(&name, Value::Undefined, BindingKind::Var)
                    .map_err(|m| self.throw("SyntaxError", m))?;
            }
        }
        Ok(())
    }

    fn exec_block(&mut self, stmts: &[Stmt], env: &Env) -> Result<Flow, Abrupt> {
        for stmt in stmts {
            if let Stmt::Function(def) = stmt {
                let name = def.name.clone().unwrap_or_default();
                let closure = self.make_closure(def, env);
                env.declare(&name, closure, BindingKind::Var)
                    .map_err(|m| self.throw("SyntaxError", m))?;
            }
        }
        for stmt in stmts {
            match self.exec(stmt, env)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_scoped(&mut self, stmts: &[Stmt], env: &Env) -> Result<Flow, Abrupt> {
        self.exec_block(stmts, &env.child(false))
    }

    fn exec(&mut self, stmt: &Stmt, env: &Env) -> Result<Flow, Abrupt> {
        self.enter()?;
        let result = self.exec_inner(stmt, env);
        self.eval_depth -= 1;
        result
    }

    fn exec_inner(&mut self, stmt: &Stmt, env: &Env) -> Result<Flow, Abrupt> {
        match stmt {
            Stmt::Expr(expr) => {
                let value = self.eval(expr, env)?;
                if self.call_depth == 0 {
                    self.completion = value;
                }
                Ok(Flow::Normal)
            }
            Stmt::Decl { kind, decls } => {
                for (target, init) in decls {
                    if *kind == DeclKind::Var {
                        // Already hoisted; only an initializer does anything.
                        if let Some(init) = init {
                            let value = self.eval_named(init, target, env)?;
                            self.bind_pattern(target, value, &env.var_scope(), BindMode::Assign)?;
                        }
                        continue;
                    }
                    let value = match init {
                        Some(init) => self.eval_named(init, target, env)?,
                        None => Value::Undefined,
                    };
                    let kind = if *kind == DeclKind::Const {
                        BindingKind::Const
                    } else {
                        BindingKind::Let
                    };
                    self.bind_pattern(target, value, env, BindMode::Declare(kind))?;
                }
                Ok(Flow::Normal)
            }
            Stmt::Function(_) | Stmt::Empty => Ok(Flow::Normal),
            Stmt::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, env)?,
                    None => Value::Undefined,
                };
                Ok(Flow::Return(value))
            }
            Stmt::If {
                test,
                then,
                otherwise,
            } => {
                if self.eval(test, env)?.truthy() {
                    self.exec_body(then, env)
                } else if let Some(otherwise) = otherwise {
                    self.exec_body(otherwise, env)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::Block(stmts) => self.exec_scoped(stmts, env),
            Stmt::While { test, body } => {
                while self.eval(test, env)?.truthy() {
                    match self.exec_body(body, env)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::DoWhile { body, test } => {
                loop {
                    match self.exec_body(body, env)? {
                        Flow::Break => break,
                        Flow::Return(v) => return Ok(Flow::Return(v)),
                        Flow::Normal | Flow::Continue => {}
                    }
                    if !self.eval(test, env)?.truthy() {
                        break;
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For {
                init,
                test,
                update,
                body,
            } => self.exec_for(init.as_deref(), test.as_ref(), update.as_ref(), body, env),
            Stmt::ForOf {
                kind,
                target,
                iterable,
                body,
            } => {
                let iterable = self.eval(iterable, env)?;
                self.exec_for_of(*kind, target, &iterable, body, env)
            }
            Stmt::ForIn {
                kind,
                target,
                object,
                body,
            } => {
                let object = self.eval(object, env)?;
                let keys: Vec<Value> = builtins::own_keys(&object)
                    .into_iter()
                    .map(Value::from)
                    .collect();
                self.exec_for_of(*kind, target, &Value::array(keys), body, env)
            }
            Stmt::Switch {
                discriminant,
                cases,
            } => self.exec_switch(discriminant, cases, env),
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
            Stmt::Throw(expr) => {
                let value = self.eval(expr, env)?;
                Err(Abrupt::Throw(value))
            }
            Stmt::Try {
                block,
                handler,
                finalizer,
            } => self.exec_try(block, handler.as_ref(), finalizer.as_deref(), env),
        }
    }

    /// Run a loop or branch body, giving declarations their own scope.
    fn exec_body(&mut self, body: &Stmt, env: &Env) -> Result<Flow, Abrupt> {
        match body {
            Stmt::Decl { .. } | Stmt::Function(_) => self.exec_scoped(std::slice::from_ref(body), env),
            other => self.exec(other, env),
        }
    }

    fn exec_for(
        &mut self,
        init: Option<&Stmt>,
        test: Option<&Expr>,
        update: Option<&Expr>,
        body: &Stmt,
        env: &Env,
    ) -> Result<Flow, Abrupt> {
        let mut scope = env.child(false);
        // `let` loop variables get a fresh copy per iteration.
        let per_iteration = matches!(
            init,
            Some(Stmt::Decl {
                kind: DeclKind::Let | DeclKind::Const,
                ..
            })
        );
        if let Some(init) = init {
            self.exec(init, &scope)?;
        }
        loop {
            if let Some(test) = test {
                if !self.eval(test, &scope)?.truthy() {
                    break;
                }
            }
            match self.exec_body(body, &scope)? {
                Flow::Break => break,
                Flow::Return(v) => return Ok(Flow::Return(v)),
                Flow::Normal | Flow::Continue => {}
            }
            if per_iteration {
                scope = scope.fork();
            }
            if let Some(update) = update {
                self.eval(update, &scope)?;
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_for_of(
        &mut self,
        kind: Option<DeclKind>,
        target: &Pattern,
        iterable: &Value,
        body: &Stmt,
        env: &Env,
    ) -> Result<Flow, Abrupt> {
        let items = self.iterate(iterable)?;
        let mode = match kind {
            None => BindMode::Assign,
            Some(DeclKind::Const) => BindMode::Declare(BindingKind::Const),
            Some(_) => BindMode::Declare(BindingKind::Let),
        };
        let mut index = 0;
        loop {
            // Arrays are read live so pushes during the loop are seen.
            let item = match &items {
                Iteration::Live(array) => array.borrow().get(index).cloned(),
                Iteration::Snapshot(values) => values.get(index).cloned(),
            };
            let Some(item) = item else {
                break;
            };
            index += 1;
            self.tick()?;

            let scope = env.child(false);
            if kind == Some(DeclKind::Var) {
                self.bind_pattern(target, item, &env.var_scope(), BindMode::Assign)?;
            } else {
                self.bind_pattern(target, item, &scope, mode)?;
            }
            match self.exec_body(body, &scope)? {
                Flow::Break => break,
                Flow::Return(v) => return Ok(Flow::Return(v)),
                Flow::Normal | Flow::Continue => {}
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_switch(
        &mut self,
        discriminant: &Expr,
        cases: &[SwitchCase],
        env: &Env,
    ) -> Result<Flow, Abrupt> {
        let value = self.eval(discriminant, env)?;
        let scope = env.child(false);

        let mut start = None;
        for (index, case) in cases.iter().enumerate() {
            if let Some(test) = &case.test {
                if strict_equals(&value, &self.eval(test, &scope)?) {
                    start = Some(index);
                    break;
                }
            }
        }
        let start = start.or_else(|| cases.iter().position(|c| c.test.is_none()));
        let Some(start) = start else {
            return Ok(Flow::Normal);
        };

        for case in &cases[start..] {
            match self.exec_block(&case.body, &scope)? {
                Flow::Normal => {}
                Flow::Break => return Ok(Flow::Normal),
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_try(
        &mut self,
        block: &[Stmt],
        handler: Option<&CatchClause>,
        finalizer: Option<&[Stmt]>,
        env: &Env,
    ) -> Result<Flow, Abrupt> {
        let mut result = self.exec_scoped(block, env);

        if let Some(handler) = handler {
            if let Err(Abrupt::Throw(thrown)) = result {
                let scope = env.child(false);
                result = match &handler.param {
                    Some(param) => self
                        .bind_pattern(param, thrown, &scope, BindMode::Declare(BindingKind::Let))
                        .and_then(|_| self.exec_block(&handler.body, &scope)),
                    None => self.exec_block(&handler.body, &scope),
                };
            }
        }

        if let Err(Abrupt::Fatal(_)) = result {
            return result;
        }
        if let Some(finalizer) = finalizer {
            match self.exec_scoped(finalizer, env)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        result
    }

    // ---- patterns ----

    fn bind_pattern(
        &mut self,
        pattern: &Pattern,
        value: Value,
        env: &Env,
        mode: BindMode,
    ) -> Result<(), Abrupt> {
        match pattern {
            Pattern::Ident(name) => match mode {
                BindMode::Declare(kind) => env
                    .declare(name, value, kind)
                    .map_err(|m| self.throw("SyntaxError", m)),
                BindMode::Assign => self.assign_variable(name, value, env),
            },
            Pattern::Expr(expr) => {
                let place = self.resolve_place(expr, env)?;
                self.write_place(place, value, env)
            }
            Pattern::Array { elements, rest } => {
                let items = match self.iterate(&value)? {
                    Iteration::Live(array) => array.borrow().clone(),
                    Iteration::Snapshot(values) => values,
                };
                for (index, element) in elements.iter().enumerate() {
                    if let Some(element) = element {
                        let item = items.get(index).cloned().unwrap_or_default();
                        self.bind_element(element, item, env, mode)?;
                    }
                }
                if let Some(rest) = rest {
                    let remaining = items.get(elements.len()..).unwrap_or_default().to_vec();
                    self.bind_pattern(rest, Value::array(remaining), env, mode)?;
                }
                Ok(())
            }
            Pattern::Object { properties, rest } => {
                if value.is_nullish() {
                    return Err(self.type_error(format!(
                        "Cannot destructure '{}' as it is {}.",
                        value.to_js_string(),
                        value.to_js_string()
                    )));
                }
                let mut used = Vec::new();
                for (key, element) in properties {
                    let key = match key {
                        PropertyKey::Static(name) => name.clone(),
                        PropertyKey::Computed(expr) => self.eval(expr, env)?.to_property_key(),
                    };
                    let item = self.get_property(&value, &key)?;
                    self.bind_element(element, item, env, mode)?;
                    used.push(key);
                }
                if let Some(rest) = rest {
                    let remaining: IndexMap<String, Value> = builtins::own_entries(&value)
                        .into_iter()
                        .filter(|(k, _)| !used.contains(k))
                        .collect();
                    self.bind_pattern(&Pattern::Ident(rest.clone()), Value::object(remaining), env, mode)?;
                }
                Ok(())
            }
        }
    }

    fn bind_element(
        &mut self,
        element: &PatternElement,
        value: Value,
        env: &Env,
        mode: BindMode,
    ) -> Result<(), Abrupt> {
        let value = match (&value, &element.default) {
            (Value::Undefined, Some(default)) => self.eval_named(default, &element.target, env)?,
            _ => value,
        };
        self.bind_pattern(&element.target, value, env, mode)
    }

    fn assign_variable(&mut self, name: &str, value: Value, env: &Env) -> Result<(), Abrupt> {
        match env.assign(name, value) {
            Ok(()) => Ok(()),
            Err(AssignError::Constant) => Err(self.type_error("Assignment to constant variable.")),
            Err(AssignError::Undeclared) => Err(self.reference_error(name)),
        }
    }

    fn resolve_place(&mut self, expr: &Expr, env: &Env) -> Result<Place, Abrupt> {
        match expr {
            Expr::Ident(name) => Ok(Place::Variable(name.clone())),
            Expr::Member {
                object, property, ..
            } => {
                let object = self.eval(object, env)?;
                let key = self.member_key(property, env)?;
                Ok(Place::Property(object, key))
            }
            _ => Err(self.throw("SyntaxError", "Invalid assignment target")),
        }
    }

    fn read_place(&mut self, place: &Place, env: &Env) -> Result<Value, Abrupt> {
        match place {
            Place::Variable(name) => env.lookup(name).ok_or_else(|| self.reference_error(name)),
            Place::Property(object, key) => self.get_property(object, key),
        }
    }

    fn write_place(&mut self, place: Place, value: Value, env: &Env) -> Result<(), Abrupt> {
        match place {
            Place::Variable(name) => self.assign_variable(&name, value, env),
            Place::Property(object, key) => self.set_property(&object, &key, value),
        }
    }

    // ---- properties ----

    pub(crate) fn get_property(&mut self, object: &Value, key: &str) -> Result<Value, Abrupt> {
        builtins::get_property(self, object, key)
    }

    pub(crate) fn set_property(&mut self, object: &Value, key: &str, value: Value) -> Result<(), Abrupt> {
        match object {
            Value::Array(items) => {
                if key == "length" {
                    let len = value.to_number();
                    if len < 0.0 || len.fract() != 0.0 || !len.is_finite() {
                        return Err(self.range_error("Invalid array length"));
                    }
                    let len = len as usize;
                    self.check_collection(len)?;
                    items.borrow_mut().resize(len, Value::Undefined);
                    return Ok(());
                }
                let Some(index) = array_index(key) else {
                    // Named properties on arrays are dropped.
                    return Ok(());
                };
                self.check_collection(index + 1)?;
                let mut items = items.borrow_mut();
                if index >= items.len() {
                    items.resize(index + 1, Value::Undefined);
                }
                items[index] = value;
                Ok(())
            }
            Value::Object(object) => {
                let mut object = object.borrow_mut();
                if !object.properties.contains_key(key) {
                    self.check_collection(object.properties.len() + 1)?;
                }
                object.properties.insert(key.to_string(), value);
                Ok(())
            }
            Value::Function(func) => {
                func.properties.borrow_mut().insert(key.to_string(), value);
                Ok(())
            }
            Value::Undefined | Value::Null => Err(self.type_error(format!(
                "Cannot set properties of {} (setting '{}')",
                object.to_js_string(),
                key
            ))),
            _ => Err(self.type_error(format!(
                "Cannot create property '{}' on {} '{}'",
                key,
                object.type_of(),
                object.to_js_string()
            ))),
        }
    }

    fn member_key(&mut self, property: &MemberProperty, env: &Env) -> Result<String, Abrupt> {
        match property {
            MemberProperty::Named(name) => Ok(name.clone()),
            MemberProperty::Computed(expr) => Ok(self.eval(expr, env)?.to_property_key()),
        }
    }

    // ---- iteration ----

    fn iterate(&mut self, value: &Value) -> Result<Iteration, Abrupt> {
        match value {
            Value::Array(items) => Ok(Iteration::Live(items.clone())),
            Value::Str(s) => Ok(Iteration::Snapshot(
                s.chars().map(|c| Value::from(c.to_string())).collect(),
            )),
            other => Err(self.type_error(format!("{} is not iterable", describe_value(other)))),
        }
    }

    /// Items of an iterable as a vector (spread, `Array.from`).
    pub(crate) fn collect_iterable(&mut self, value: &Value) -> Result<Vec<Value>, Abrupt> {
        Ok(match self.iterate(value)? {
            Iteration::Live(items) => items.borrow().clone(),
            Iteration::Snapshot(values) => values,
        })
    }

    // ---- expressions ----

    pub(crate) fn eval(&mut self, expr: &Expr, env: &Env) -> Result<Value, Abrupt> {
        self.enter()?;
        let result = self.eval_inner(expr, env);
        self.eval_depth -= 1;
        result
    }

    /// Evaluate an initializer, naming anonymous functions after their binding.
    fn eval_named(&mut self, expr: &Expr, target: &Pattern, env: &Env) -> Result<Value, Abrupt> {
        if let (Expr::Function(def), Pattern::Ident(name)) = (expr, target) {
            if def.name.is_none() {
                let closure = self.make_closure(def, env);
                if let Value::Function(func) = &closure {
                    func.properties
                        .borrow_mut()
                        .insert("name".to_string(), Value::from(name.as_str()));
                }
                return Ok(closure);
            }
        }
        self.eval(expr, env)
    }

    fn eval_inner(&mut self, expr: &Expr, env: &Env) -> Result<Value, Abrupt> {
        match expr {
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Null => Ok(Value::Null),
            Expr::Template { quasis, exprs } => {
                let mut text = String::new();
                for (index, quasi) in quasis.iter().enumerate() {
                    text.push_str(quasi);
                    if let Some(expr) = exprs.get(index) {
                        let value = self.eval(expr, env)?;
                        text.push_str(&value.to_js_string());
                        self.check_string(text.len())?;
                    }
                }
                Ok(Value::from(text))
            }
            Expr::Ident(name) => env.lookup(name).ok_or_else(|| self.reference_error(name)),
            Expr::This => Ok(env.lookup("this").unwrap_or_default()),
            Expr::Array(elements) => {
                let items = self.eval_elements(elements, env)?;
                Ok(Value::array(items))
            }
            Expr::Object(members) => self.eval_object(members, env),
            Expr::Function(def) => Ok(self.make_closure(def, env)),
            Expr::Unary(op, operand) => self.eval_unary(*op, operand, env),
            Expr::Update {
                increment,
                prefix,
                target,
            } => {
                let place = self.resolve_place(target, env)?;
                let old = self.read_place(&place, env)?.to_number();
                let new = if *increment { old + 1.0 } else { old - 1.0 };
                self.write_place(place, Value::Number(new), env)?;
                Ok(Value::Number(if *prefix { new } else { old }))
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.eval(lhs, env)?;
                let rhs = self.eval(rhs, env)?;
                self.binary(*op, &lhs, &rhs)
            }
            Expr::Logical(op, lhs, rhs) => {
                let lhs = self.eval(lhs, env)?;
                if short_circuits(*op, &lhs) {
                    Ok(lhs)
                } else {
                    self.eval(rhs, env)
                }
            }
            Expr::Assign { op, target, value } => self.eval_assign(*op, target, value, env),
            Expr::Conditional(test, then, otherwise) => {
                if self.eval(test, env)?.truthy() {
                    self.eval(then, env)
                } else {
                    self.eval(otherwise, env)
                }
            }
            Expr::Member { .. } | Expr::Call { .. } => {
                Ok(self.eval_chain(expr, env)?.unwrap_or_default())
            }
            Expr::New { callee, args } => {
                let constructor = self.eval(callee, env)?;
                let args = self.eval_elements(args, env)?;
                self.construct(&constructor, args, callee)
            }
            Expr::Sequence(exprs) => {
                let mut last = Value::Undefined;
                for expr in exprs {
                    last = self.eval(expr, env)?;
                }
                Ok(last)
            }
        }
    }

    /// Member/call chains; `None` means an optional link short-circuited.
    fn eval_chain(&mut self, expr: &Expr, env: &Env) -> Result<Option<Value>, Abrupt> {
        match expr {
            Expr::Member {
                object,
                property,
                optional,
            } => {
                let Some(object) = self.eval_link(object, env)? else {
                    return Ok(None);
                };
                if *optional && object.is_nullish() {
                    return Ok(None);
                }
                let key = self.member_key(property, env)?;
                self.get_property(&object, &key).map(Some)
            }
            Expr::Call {
                callee,
                args,
                optional,
            } => {
                let (function, this) = match &**callee {
                    Expr::Member {
                        object,
                        property,
                        optional: member_optional,
                    } => {
                        let Some(object) = self.eval_link(object, env)? else {
                            return Ok(None);
                        };
                        if *member_optional && object.is_nullish() {
                            return Ok(None);
                        }
                        let key = self.member_key(property, env)?;
                        (self.get_property(&object, &key)?, object)
                    }
                    other => {
                        let Some(function) = self.eval_link(other, env)? else {
                            return Ok(None);
                        };
                        (function, Value::Undefined)
                    }
                };
                if *optional && function.is_nullish() {
                    return Ok(None);
                }
                let args = self.eval_elements(args, env)?;
                let Value::Function(function) = function else {
                    return Err(self.type_error(format!("{} is not a function", describe_expr(callee))));
                };
                self.call_function(&function, this, args).map(Some)
            }
            other => self.eval(other, env).map(Some),
        }
    }

    fn eval_link(&mut self, expr: &Expr, env: &Env) -> Result<Option<Value>, Abrupt> {
        self.enter()?;
        let result = self.eval_chain(expr, env);
        self.eval_depth -= 1;
        result
    }

    fn eval_elements(&mut self, elements: &[ArrayElement], env: &Env) -> Result<Vec<Value>, Abrupt> {
        let mut items = Vec::with_capacity(elements.len());
        for element in elements {
            match element {
                ArrayElement::Item(expr) => items.push(self.eval(expr, env)?),
                ArrayElement::Spread(expr) => {
                    let value = self.eval(expr, env)?;
                    let spread = self.collect_iterable(&value)?;
                    self.check_collection(items.len() + spread.len())?;
                    items.extend(spread);
                }
                ArrayElement::Hole => items.push(Value::Undefined),
            }
        }
        Ok(items)
    }

    fn eval_object(&mut self, members: &[ObjectMember], env: &Env) -> Result<Value, Abrupt> {
        let mut properties = IndexMap::new();
        for member in members {
            match member {
                ObjectMember::Property(key, value) => {
                    let key = match key {
                        PropertyKey::Static(name) => name.clone(),
                        PropertyKey::Computed(expr) => self.eval(expr, env)?.to_property_key(),
                    };
                    let value = self.eval_named(value, &Pattern::Ident(key.clone()), env)?;
                    properties.insert(key, value);
                }
                ObjectMember::Spread(expr) => {
                    let source = self.eval(expr, env)?;
                    for (key, value) in builtins::own_entries(&source) {
                        properties.insert(key, value);
                    }
                }
            }
            self.check_collection(properties.len())?;
        }
        Ok(Value::object(properties))
    }

    fn eval_unary(&mut self, op: UnaryOp, operand: &Expr, env: &Env) -> Result<Value, Abrupt> {
        match op {
            UnaryOp::TypeOf => {
                if let Expr::Ident(name) = operand {
                    return Ok(Value::from(
                        env.lookup(name).map_or("undefined", |v| v.type_of()),
                    ));
                }
                let value = self.eval(operand, env)?;
                Ok(Value::from(value.type_of()))
            }
            UnaryOp::Delete => {
                if let Expr::Member {
                    object, property, ..
                } = operand
                {
                    let object = self.eval(object, env)?;
                    let key = self.member_key(property, env)?;
                    match &object {
                        Value::Object(o) => {
                            o.borrow_mut().properties.shift_remove(&key);
                        }
                        Value::Array(items) => {
                            if let Some(index) = array_index(&key) {
                                if let Some(slot) = items.borrow_mut().get_mut(index) {
                                    *slot = Value::Undefined;
                                }
                            }
                        }
                        _ => {}
                    }
                }
                Ok(Value::Bool(true))
            }
            _ => {
                let value = self.eval(operand, env)?;
                Ok(match op {
                    UnaryOp::Neg => Value::Number(-value.to_number()),
                    UnaryOp::Plus => Value::Number(value.to_number()),
                    UnaryOp::Not => Value::Bool(!value.truthy()),
                    UnaryOp::BitNot => Value::Number(f64::from(!to_int32(value.to_number()))),
                    _ => Value::Undefined,
                })
            }
        }
    }

    fn eval_assign(
        &mut self,
        op: AssignOp,
        target: &Pattern,
        value: &Expr,
        env: &Env,
    ) -> Result<Value, Abrupt> {
        let place = match target {
            Pattern::Ident(name) => Place::Variable(name.clone()),
            Pattern::Expr(expr) => self.resolve_place(expr, env)?,
            pattern => {
                let value = self.eval(value, env)?;
                self.bind_pattern(pattern, value.clone(), env, BindMode::Assign)?;
                return Ok(value);
            }
        };

        let value = match op {
            AssignOp::Assign => self.eval_named(value, target, env)?,
            AssignOp::Compound(op) => {
                let current = self.read_place(&place, env)?;
                let rhs = self.eval(value, env)?;
                self.binary(op, &current, &rhs)?
            }
            AssignOp::Logical(op) => {
                let current = self.read_place(&place, env)?;
                if short_circuits(op, &current) {
                    return Ok(current);
                }
                self.eval(value, env)?
            }
        };
        self.write_place(place, value.clone(), env)?;
        Ok(value)
    }

    pub(crate) fn binary(&mut self, op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, Abrupt> {
        use BinaryOp::*;
        let number = |f: fn(f64, f64) -> f64| Value::Number(f(lhs.to_number(), rhs.to_number()));
        let int = |f: fn(i32, i32) -> i32| {
            Value::Number(f64::from(f(to_int32(lhs.to_number()), to_int32(rhs.to_number()))))
        };
        Ok(match op {
            Add => {
                let is_text = |v: &Value| {
                    matches!(v, Value::Str(_) | Value::Array(_) | Value::Object(_) | Value::Function(_))
                };
                if is_text(lhs) || is_text(rhs) {
                    let left = lhs.to_js_string();
                    let right = rhs.to_js_string();
                    self.check_string(left.len() + right.len())?;
                    Value::from(left + &right)
                } else {
                    number(|a, b| a + b)
                }
            }
            Sub => number(|a, b| a - b),
            Mul => number(|a, b| a * b),
            Div => number(|a, b| a / b),
            Rem => number(|a, b| a % b),
            Exp => number(f64::powf),
            Eq => Value::Bool(loose_equals(lhs, rhs)),
            NotEq => Value::Bool(!loose_equals(lhs, rhs)),
            StrictEq => Value::Bool(strict_equals(lhs, rhs)),
            StrictNotEq => Value::Bool(!strict_equals(lhs, rhs)),
            Lt => Value::Bool(compare(lhs, rhs) == Some(std::cmp::Ordering::Less)),
            Gt => Value::Bool(compare(lhs, rhs) == Some(std::cmp::Ordering::Greater)),
            LtEq => Value::Bool(matches!(
                compare(lhs, rhs),
                Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
            )),
            GtEq => Value::Bool(matches!(
                compare(lhs, rhs),
                Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
            )),
            BitAnd => int(|a, b| a & b),
            BitOr => int(|a, b| a | b),
            BitXor => int(|a, b| a ^ b),
            Shl => int(|a, b| a.wrapping_shl(b as u32 & 31)),
            Shr => int(|a, b| a.wrapping_shr(b as u32 & 31)),
            UShr => Value::Number(f64::from(
                to_uint32(lhs.to_number()) >> (to_uint32(rhs.to_number()) & 31),
            )),
            In => {
                let key = lhs.to_property_key();
                match rhs {
                    Value::Object(o) => Value::Bool(o.borrow().properties.contains_key(&key)),
                    Value::Array(items) => Value::Bool(
                        key == "length"
                            || array_index(&key).is_some_and(|i| i < items.borrow().len()),
                    ),
                    Value::Function(f) => Value::Bool(f.properties.borrow().contains_key(&key)),
                    other => {
                        return Err(self.type_error(format!(
                            "Cannot use 'in' operator to search for '{}' in {}",
                            key,
                            other.to_js_string()
                        )))
                    }
                }
            }
            InstanceOf => Value::Bool(self.instance_of(lhs, rhs)?),
        })
    }

    fn instance_of(&self, value: &Value, constructor: &Value) -> Result<bool, Abrupt> {
        let Value::Function(constructor) = constructor else {
            return Err(self.type_error("Right-hand side of 'instanceof' is not callable"));
        };
        Ok(match &constructor.kind {
            FunctionKind::Native { name, .. } => match (*name, value) {
                ("Object", Value::Object(_) | Value::Array(_) | Value::Function(_)) => true,
                ("Array", Value::Array(_)) => true,
                ("Function", Value::Function(_)) => true,
                (name, Value::Object(o)) => match &o.borrow().class {
                    ObjectClass::Error => {
                        name == "Error"
                            || o.borrow()
                                .properties
                                .get("name")
                                .is_some_and(|n| n.to_js_string() == name)
                    }
                    _ => false,
                },
                _ => false,
            },
            FunctionKind::Closure { .. } => match value {
                Value::Object(o) => matches!(
                    &o.borrow().class,
                    ObjectClass::Instance(f) if Rc::ptr_eq(f, constructor)
                ),
                _ => false,
            },
            FunctionKind::Method { .. } => false,
        })
    }

    // ---- functions ----

    fn capture(&mut self, env: &Env) {
        let scope = Rc::downgrade(&env.0);
        if self.captured.last().is_some_and(|last| last.ptr_eq(&scope)) {
            return;
        }
        if self.captured.len() == self.captured.capacity() {
            self.captured.retain(|s| s.strong_count() > 0);
        }
        self.captured.push(scope);
    }

    fn make_closure(&mut self, def: &Rc<FunctionDef>, env: &Env) -> Value {
        self.capture(env);
        match (&def.name, def.is_arrow) {
            // Named function expressions can refer to themselves.
            (Some(name), false) => {
                let scope = env.child(false);
                self.capture(&scope);
                let function = Value::Function(Rc::new(Function::new(FunctionKind::Closure {
                    def: def.clone(),
                    env: scope.clone(),
                })));
                scope.define_builtin(name, function.clone());
                function
            }
            _ => Value::Function(Rc::new(Function::new(FunctionKind::Closure {
                def: def.clone(),
                env: env.clone(),
            }))),
        }
    }

    /// Call a value, failing with a `TypeError` if it is not a function.
    pub(crate) fn call_value(&mut self, callee: &Value, this: Value, args: Vec<Value>) -> Result<Value, Abrupt> {
        match callee {
            Value::Function(function) => self.call_function(function, this, args),
            other => Err(self.type_error(format!("{} is not a function", describe_value(other)))),
        }
    }

    pub(crate) fn call_function(
        &mut self,
        function: &Rc<Function>,
        this: Value,
        args: Vec<Value>,
    ) -> Result<Value, Abrupt> {
        if self.call_depth >= self.limits.max_call_depth {
            return Err(Abrupt::Fatal(ScriptError::StackOverflow));
        }
        self.tick()?;
        self.call_depth += 1;
        let result = match &function.kind {
            FunctionKind::Native { call, .. } => call(self, args),
            FunctionKind::Method { receiver, name } => {
                let receiver = receiver.clone();
                let name = name.clone();
                builtins::call_method(self, &receiver, &name, args)
            }
            FunctionKind::Closure { def, env } => {
                let def = def.clone();
                let env = env.clone();
                self.call_closure(&def, &env, this, args)
            }
        };
        self.call_depth -= 1;
        result
    }

    fn call_closure(
        &mut self,
        def: &FunctionDef,
        env: &Env,
        this: Value,
        args: Vec<Value>,
    ) -> Result<Value, Abrupt> {
        let scope = env.child(true);
        if !def.is_arrow {
            scope.define_builtin("this", this);
            scope.define_builtin("arguments", Value::array(args.clone()));
        }

        let params = BindMode::Declare(BindingKind::Var);
        for (index, param) in def.params.iter().enumerate() {
            let value = args.get(index).cloned().unwrap_or_default();
            self.bind_element(param, value, &scope, params)?;
        }
        if let Some(rest) = &def.rest {
            let remaining = args.get(def.params.len()..).unwrap_or_default().to_vec();
            self.bind_pattern(rest, Value::array(remaining), &scope, params)?;
        }

        match &def.body {
            FunctionBody::Expr(expr) => self.eval(expr, &scope),
            FunctionBody::Block(stmts) => {
                self.hoist_vars(stmts, &scope)?;
                match self.exec_block(stmts, &scope)? {
                    Flow::Return(value) => Ok(value),
                    _ => Ok(Value::Undefined),
                }
            }
        }
    }

    fn construct(&mut self, constructor: &Value, args: Vec<Value>, callee: &Expr) -> Result<Value, Abrupt> {
        let not_constructor = || format!("{} is not a constructor", describe_expr(callee));
        let Value::Function(function) = constructor else {
            return Err(self.type_error(not_constructor()));
        };
        match &function.kind {
            FunctionKind::Native {
                constructor: true, ..
            } => self.call_function(function, Value::Undefined, args),
            FunctionKind::Closure { def, .. } if !def.is_arrow => {
                let instance = Value::Object(Rc::new(RefCell::new(Object {
                    properties: IndexMap::new(),
                    class: ObjectClass::Instance(function.clone()),
                })));
                let result = self.call_function(function, instance.clone(), args)?;
                Ok(match result {
                    Value::Object(_) | Value::Array(_) | Value::Function(_) => result,
                    _ => instance,
                })
            }
            _ => Err(self.type_error(not_constructor())),
        }
    }
}

enum Iteration {
    Live(Rc<RefCell<Vec<Value>>>),
    Snapshot(Vec<Value>),
}

impl Env {
    fn lookup_own(&self, name: &str) -> Option<Value> {
        self.0.vars.borrow().get(name).map(|b| b.value.clone())
    }
}

fn short_circuits(op: LogicalOp, lhs: &Value) -> bool {
    match op {
        LogicalOp::And => !lhs.truthy(),
        LogicalOp::Or => lhs.truthy(),
        LogicalOp::Nullish => !lhs.is_nullish(),
    }
}

/// Relational comparison; `None` when either side is `NaN`.
fn compare(lhs: &Value, rhs: &Value) -> Option<std::cmp::Ordering> {
    let primitive = |v: &Value| match v {
        Value::Array(_) | Value::Object(_) | Value::Function(_) => Value::from(v.to_js_string()),
        other => other.clone(),
    };
    match (primitive(lhs), primitive(rhs)) {
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(&b)),
        (a, b) => a.to_number().partial_cmp(&b.to_number()),
    }
}

fn collect_var_names(stmt: &Stmt, names: &mut Vec<String>) {
    match stmt {
        Stmt::Decl {
            kind: DeclKind::Var,
            decls,
        } => {
            for (pattern, _) in decls {
                pattern_names(pattern, names);
            }
        }
        Stmt::If {
            then, otherwise, ..
        } => {
            collect_var_names(then, names);
            if let Some(otherwise) = otherwise {
                collect_var_names(otherwise, names);
            }
        }
        Stmt::Block(stmts) => stmts.iter().for_each(|s| collect_var_names(s, names)),
        Stmt::While { body, .. } | Stmt::DoWhile { body, .. } => collect_var_names(body, names),
        Stmt::For { init, body, .. } => {
            if let Some(init) = init {
                collect_var_names(init, names);
            }
            collect_var_names(body, names);
        }
        Stmt::ForOf {
            kind, target, body, ..
        }
        | Stmt::ForIn {
            kind, target, body, ..
        } => {
            if *kind == Some(DeclKind::Var) {
                pattern_names(target, names);
            }
            collect_var_names(body, names);
        }
        Stmt::Switch { cases, .. } => cases
            .iter()
            .flat_map(|c| c.body.iter())
            .for_each(|s| collect_var_names(s, names)),
        Stmt::Try {
            block,
            handler,
            finalizer,
        } => {
            block.iter().for_each(|s| collect_var_names(s, names));
            if let Some(handler) = handler {
                handler.body.iter().for_each(|s| collect_var_names(s, names));
            }
            if let Some(finalizer) = finalizer {
                finalizer.iter().for_each(|s| collect_var_names(s, names));
            }
        }
        _ => {}
    }
}

fn pattern_names(pattern: &Pattern, names: &mut Vec<String>) {
    match pattern {
        Pattern::Ident(name) => names.push(name.clone()),
        Pattern::Array { elements, rest } => {
            for element in elements.iter().flatten() {
                pattern_names(&element.target, names);
            }
            if let Some(rest) = rest {
                pattern_names(rest, names);
            }
        }
        Pattern::Object { properties, rest } => {
            for (_, element) in properties {
                pattern_names(&element.target, names);
            }
            if let Some(rest) = rest {
                names.push(rest.clone());
            }
        }
        Pattern::Expr(_) => {}
    }
}

/// Source-like name of a callee for error messages.
fn describe_expr(expr: &Expr) -> String {
    match expr {
        Expr::Ident(name) => name.clone(),
        Expr::This => "this".to_string(),
        Expr::Member {
            object,
            property: MemberProperty::Named(name),
            ..
        } => format!("{}.{}", describe_expr(object), name),
        Expr::Member { object, .. } => format!("{}[...]", describe_expr(object)),
        Expr::Call { callee, .. } => format!("{}(...)", describe_expr(callee)),
        _ => "expression".to_string(),
    }
}

pub(crate) fn describe_value(value: &Value) -> String {
    match value {
        Value::Str(s) => format!("\"{}\"", s),
        Value::Array(_) => "object".to_string(),
        Value::Object(_) => "object".to_string(),
        Value::Number(n) => number_to_string(*n),
        other => other.to_js_string(),
    }
}

/// Message for an exception that escaped the script.
fn describe_thrown(value: &Value) -> String {
    if value.is_error() {
        value.to_js_string()
    } else {
        format!("Uncaught {}", value.to_js_string())
    }
}
