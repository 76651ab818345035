//! Recursive-descent parser producing [`ast`](super::ast) nodes.

use std::rc::Rc;

use super::ast::*;
use super::lexer::{tokenize, Spanned, Token};
use super::ScriptError;

/// Maximum syntactic nesting, counting operator and member chains.
/// Bounds recursion in both parser and evaluator.
const MAX_NESTING: usize = 512;

const UNSUPPORTED: [&str; 8] = [
    "class", "import", "export", "async", "await", "yield", "with", "debugger",
];

pub fn parse_program(source: &str) -> Result<Vec<Stmt>, ScriptError> {
    let mut parser = Parser::new(tokenize(source)?, 0);
    let mut body = Vec::new();
    while !parser.at_eof() {
        body.push(parser.statement()?);
    }
    Ok(body)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Spanned>, depth: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            depth,
        }
    }

    // ---- token helpers ----

    fn current(&self) -> &Spanned {
        // The token stream always ends with Eof.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek(&self) -> &Token {
        &self.current().token
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let index = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[index].token
    }

    fn at_eof(&self) -> bool {
        matches!(self.peek(), Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn is_punct(&self, p: &str) -> bool {
        matches!(self.peek(), Token::Punct(q) if *q == p)
    }

    fn is_ident(&self, name: &str) -> bool {
        matches!(self.peek(), Token::Ident(n) if n == name)
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.is_punct(p) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_ident(&mut self, name: &str) -> bool {
        if self.is_ident(name) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::Syntax {
            message: message.into(),
            line: self.current().line,
        }
    }

    fn unexpected(&self) -> ScriptError {
        let message = match self.peek() {
            Token::Eof => "Unexpected end of input".to_string(),
            Token::Punct(p) => format!("Unexpected token '{}'", p),
            Token::Ident(name) => format!("Unexpected identifier '{}'", name),
            Token::Number(_) => "Unexpected number".to_string(),
            Token::Str(_) => "Unexpected string".to_string(),
            Token::Template { .. } => "Unexpected template string".to_string(),
        };
        self.error(message)
    }

    fn expect_punct(&mut self, p: &str) -> Result<(), ScriptError> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn identifier(&mut self) -> Result<String, ScriptError> {
        match self.peek() {
            Token::Ident(name) if !is_reserved(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected()),
        }
    }

    fn consume_semicolon(&mut self) -> Result<(), ScriptError> {
        if self.eat_punct(";") || self.is_punct("}") || self.at_eof() || self.current().newline_before
        {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn grow(&mut self) -> Result<(), ScriptError> {
        if self.depth >= MAX_NESTING {
            return Err(self.error("Code is nested too deeply"));
        }
        self.depth += 1;
        Ok(())
    }

    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, ScriptError>,
    ) -> Result<T, ScriptError> {
        let base = self.depth;
        self.grow()?;
        let result = parse(self);
        self.depth = base;
        result
    }

    // ---- statements ----

    fn statement(&mut self) -> Result<Stmt, ScriptError> {
        self.nested(Self::statement_inner)
    }

    fn statement_inner(&mut self) -> Result<Stmt, ScriptError> {
        if let Token::Ident(word) = self.peek() {
            if UNSUPPORTED.contains(&word.as_str()) {
                return Err(self.error(format!("'{}' is not supported", word)));
            }
        }

        if self.is_punct("{") {
            return Ok(Stmt::Block(self.block()?));
        }
        if self.eat_punct(";") {
            return Ok(Stmt::Empty);
        }

        let Token::Ident(word) = self.peek().clone() else {
            return self.expression_statement();
        };
        match word.as_str() {
            "var" | "let" | "const" => {
                let stmt = self.declaration()?;
                self.consume_semicolon()?;
                Ok(stmt)
            }
            "function" => {
                self.advance();
                let name = self.identifier()?;
                let def = self.function_rest(Some(name))?;
                Ok(Stmt::Function(def))
            }
            "if" => {
                self.advance();
                let test = self.paren_expression()?;
                let then = Box::new(self.statement()?);
                let otherwise = if self.eat_ident("else") {
                    Some(Box::new(self.statement()?))
                } else {
                    None
                };
                Ok(Stmt::If {
                    test,
                    then,
                    otherwise,
                })
            }
            "while" => {
                self.advance();
                let test = self.paren_expression()?;
                let body = Box::new(self.statement()?);
                Ok(Stmt::While { test, body })
            }
            "do" => {
                self.advance();
                let body = Box::new(self.statement()?);
                if !self.eat_ident("while") {
                    return Err(self.unexpected());
                }
                let test = self.paren_expression()?;
                self.eat_punct(";");
                Ok(Stmt::DoWhile { body, test })
            }
            "for" => self.for_statement(),
            "return" => {
                self.advance();
                let value = if self.is_punct(";")
                    || self.is_punct("}")
                    || self.at_eof()
                    || self.current().newline_before
                {
                    None
                } else {
                    Some(self.expression()?)
                };
                self.consume_semicolon()?;
                Ok(Stmt::Return(value))
            }
            "break" | "continue" => {
                self.advance();
                if matches!(self.peek(), Token::Ident(_)) && !self.current().newline_before {
                    return Err(self.error("Labeled statements are not supported"));
                }
                self.consume_semicolon()?;
                Ok(if word == "break" {
                    Stmt::Break
                } else {
                    Stmt::Continue
                })
            }
            "throw" => {
                self.advance();
                if self.current().newline_before {
                    return Err(self.error("Illegal newline after throw"));
                }
                let value = self.expression()?;
                self.consume_semicolon()?;
                Ok(Stmt::Throw(value))
            }
            "try" => self.try_statement(),
            "switch" => self.switch_statement(),
            _ => self.expression_statement(),
        }
    }

    fn expression_statement(&mut self) -> Result<Stmt, ScriptError> {
        let expr = self.expression()?;
        self.consume_semicolon()?;
        Ok(Stmt::Expr(expr))
    }

    fn block(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        self.expect_punct("{")?;
        let mut body = Vec::new();
        while !self.eat_punct("}") {
            if self.at_eof() {
                return Err(self.unexpected());
            }
            body.push(self.statement()?);
        }
        Ok(body)
    }

    fn paren_expression(&mut self) -> Result<Expr, ScriptError> {
        self.expect_punct("(")?;
        let expr = self.expression()?;
        self.expect_punct(")")?;
        Ok(expr)
    }

    fn decl_kind(&mut self) -> Option<DeclKind> {
        let kind = match self.peek() {
            Token::Ident(w) if w == "var" => DeclKind::Var,
            Token::Ident(w) if w == "let" => DeclKind::Let,
            Token::Ident(w) if w == "const" => DeclKind::Const,
            _ => return None,
        };
        self.advance();
        Some(kind)
    }

    fn declaration(&mut self) -> Result<Stmt, ScriptError> {
        let kind = self.decl_kind().ok_or_else(|| self.unexpected())?;
        let mut decls = Vec::new();
        loop {
            let target = self.binding_pattern()?;
            let init = if self.eat_punct("=") {
                Some(self.assignment()?)
            } else {
                None
            };
            if init.is_none() && (kind == DeclKind::Const || !matches!(target, Pattern::Ident(_))) {
                return Err(self.error("Missing initializer in declaration"));
            }
            decls.push((target, init));
            if !self.eat_punct(",") {
                break;
            }
        }
        Ok(Stmt::Decl { kind, decls })
    }

    fn for_statement(&mut self) -> Result<Stmt, ScriptError> {
        self.advance();
        self.expect_punct("(")?;

        // for (let x of / in ...)
        let start = self.pos;
        if let Some(kind) = self.decl_kind() {
            let target = self.binding_pattern()?;
            if let Some(stmt) = self.for_each_rest(Some(kind), target)? {
                return Ok(stmt);
            }
            self.pos = start;
        } else if !self.is_punct(";") {
            // for (x of / in ...) with an existing binding
            let lhs = self.nested(Self::call_or_member);
            if let Ok(lhs) = lhs {
                if self.is_ident("of") || self.is_ident("in") {
                    let target = to_pattern(lhs).map_err(|m| self.error(m))?;
                    if let Some(stmt) = self.for_each_rest(None, target)? {
                        return Ok(stmt);
                    }
                }
            }
            self.pos = start;
        }

        let init = if self.is_punct(";") {
            None
        } else if matches!(self.peek(), Token::Ident(w) if w == "var" || w == "let" || w == "const")
        {
            Some(Box::new(self.declaration()?))
        } else {
            Some(Box::new(Stmt::Expr(self.expression()?)))
        };
        self.expect_punct(";")?;
        let test = if self.is_punct(";") {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect_punct(";")?;
        let update = if self.is_punct(")") {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect_punct(")")?;
        let body = Box::new(self.statement()?);
        Ok(Stmt::For {
            init,
            test,
            update,
            body,
        })
    }

    fn for_each_rest(
        &mut self,
        kind: Option<DeclKind>,
        target: Pattern,
    ) -> Result<Option<Stmt>, ScriptError> {
        let is_of = if self.eat_ident("of") {
            true
        } else if self.eat_ident("in") {
            false
        } else {
            return Ok(None);
        };
        let source = if is_of {
            self.assignment()?
        } else {
            self.expression()?
        };
        self.expect_punct(")")?;
        let body = Box::new(self.statement()?);
        Ok(Some(if is_of {
            Stmt::ForOf {
                kind,
                target,
                iterable: source,
                body,
            }
        } else {
            Stmt::ForIn {
                kind,
                target,
                object: source,
                body,
            }
        }))
    }

    fn try_statement(&mut self) -> Result<Stmt, ScriptError> {
        self.advance();
        let block = self.block()?;
        let handler = if self.eat_ident("catch") {
            let param = if self.eat_punct("(") {
                let param = self.binding_pattern()?;
                self.expect_punct(")")?;
                Some(param)
            } else {
                None
            };
            Some(CatchClause {
                param,
                body: self.block()?,
            })
        } else {
            None
        };
        let finalizer = if self.eat_ident("finally") {
            Some(self.block()?)
        } else {
            None
        };
        if handler.is_none() && finalizer.is_none() {
            return Err(self.error("Missing catch or finally after try"));
        }
        Ok(Stmt::Try {
            block,
            handler,
            finalizer,
        })
    }

    fn switch_statement(&mut self) -> Result<Stmt, ScriptError> {
        self.advance();
        let discriminant = self.paren_expression()?;
        self.expect_punct("{")?;
        let mut cases = Vec::new();
        while !self.eat_punct("}") {
            let test = if self.eat_ident("case") {
                Some(self.expression()?)
            } else if self.eat_ident("default") {
                None
            } else {
                return Err(self.unexpected());
            };
            self.expect_punct(":")?;
            let mut body = Vec::new();
            while !self.is_ident("case") && !self.is_ident("default") && !self.is_punct("}") {
                if self.at_eof() {
                    return Err(self.unexpected());
                }
                body.push(self.statement()?);
            }
            cases.push(SwitchCase { test, body });
        }
        Ok(Stmt::Switch {
            discriminant,
            cases,
        })
    }

    // ---- patterns ----

    fn binding_pattern(&mut self) -> Result<Pattern, ScriptError> {
        self.nested(Self::binding_pattern_inner)
    }

    fn binding_pattern_inner(&mut self) -> Result<Pattern, ScriptError> {
        if self.eat_punct("[") {
            let mut elements = Vec::new();
            let mut rest = None;
            loop {
                if self.eat_punct("]") {
                    break;
                }
                if self.eat_punct(",") {
                    elements.push(None);
                    continue;
                }
                if self.eat_punct("...") {
                    rest = Some(Box::new(self.binding_pattern()?));
                    self.expect_punct("]")?;
                    break;
                }
                elements.push(Some(self.pattern_element()?));
                if !self.eat_punct(",") {
                    self.expect_punct("]")?;
                    break;
                }
            }
            return Ok(Pattern::Array { elements, rest });
        }

        if self.eat_punct("{") {
            let mut properties = Vec::new();
            let mut rest = None;
            loop {
                if self.eat_punct("}") {
                    break;
                }
                if self.eat_punct("...") {
                    rest = Some(self.identifier()?);
                    self.expect_punct("}")?;
                    break;
                }
                let key = self.property_key()?;
                let element = if self.eat_punct(":") {
                    self.pattern_element()?
                } else {
                    let PropertyKey::Static(name) = &key else {
                        return Err(self.unexpected());
                    };
                    let default = if self.eat_punct("=") {
                        Some(self.assignment()?)
                    } else {
                        None
                    };
                    PatternElement {
                        target: Pattern::Ident(name.clone()),
                        default,
                    }
                };
                properties.push((key, element));
                if !self.eat_punct(",") {
                    self.expect_punct("}")?;
                    break;
                }
            }
            return Ok(Pattern::Object { properties, rest });
        }

        Ok(Pattern::Ident(self.identifier()?))
    }

    fn pattern_element(&mut self) -> Result<PatternElement, ScriptError> {
        let target = self.binding_pattern()?;
        let default = if self.eat_punct("=") {
            Some(self.assignment()?)
        } else {
            None
        };
        Ok(PatternElement { target, default })
    }

    // ---- functions ----

    /// Parameters and body after the optional name.
    fn function_rest(&mut self, name: Option<String>) -> Result<Rc<FunctionDef>, ScriptError> {
        let (params, rest) = self.parameters()?;
        let body = FunctionBody::Block(self.block()?);
        Ok(Rc::new(FunctionDef {
            name,
            params,
            rest,
            body,
            is_arrow: false,
        }))
    }

    fn parameters(&mut self) -> Result<(Vec<PatternElement>, Option<Pattern>), ScriptError> {
        self.expect_punct("(")?;
        let mut params = Vec::new();
        let mut rest = None;
        while !self.eat_punct(")") {
            if self.eat_punct("...") {
                rest = Some(self.binding_pattern()?);
                self.expect_punct(")")?;
                break;
            }
            params.push(self.pattern_element()?);
            if !self.eat_punct(",") {
                self.expect_punct(")")?;
                break;
            }
        }
        Ok((params, rest))
    }

    fn arrow_ahead(&self) -> bool {
        match self.peek() {
            Token::Ident(name) if !is_reserved(name) => {
                matches!(self.peek_at(1), Token::Punct("=>"))
                    && !self.tokens[(self.pos + 1).min(self.tokens.len() - 1)].newline_before
            }
            Token::Punct("(") => {
                let mut depth = 0usize;
                let mut offset = 0;
                loop {
                    match self.peek_at(offset) {
                        Token::Punct("(" | "[" | "{") => depth += 1,
                        Token::Punct(")" | "]" | "}") => {
                            depth -= 1;
                            if depth == 0 {
                                return matches!(self.peek_at(offset + 1), Token::Punct("=>"));
                            }
                        }
                        Token::Eof => return false,
                        _ => {}
                    }
                    offset += 1;
                }
            }
            _ => false,
        }
    }

    fn arrow_function(&mut self) -> Result<Expr, ScriptError> {
        let (params, rest) = if self.is_punct("(") {
            self.parameters()?
        } else {
            let name = self.identifier()?;
            (
                vec![PatternElement {
                    target: Pattern::Ident(name),
                    default: None,
                }],
                None,
            )
        };
        self.expect_punct("=>")?;
        let body = if self.is_punct("{") {
            FunctionBody::Block(self.block()?)
        } else {
            FunctionBody::Expr(self.assignment()?)
        };
        Ok(Expr::Function(Rc::new(FunctionDef {
            name: None,
            params,
            rest,
            body,
            is_arrow: true,
        })))
    }

    // ---- expressions ----

    fn expression(&mut self) -> Result<Expr, ScriptError> {
        let first = self.assignment()?;
        if !self.is_punct(",") {
            return Ok(first);
        }
        let mut exprs = vec![first];
        while self.eat_punct(",") {
            exprs.push(self.assignment()?);
        }
        Ok(Expr::Sequence(exprs))
    }

    fn assignment(&mut self) -> Result<Expr, ScriptError> {
        self.nested(Self::assignment_inner)
    }

    fn assignment_inner(&mut self) -> Result<Expr, ScriptError> {
        if self.arrow_ahead() {
            return self.arrow_function();
        }

        let lhs = self.conditional()?;
        let op = match self.peek() {
            Token::Punct(p) => match assign_op(p) {
                Some(op) => op,
                None => return Ok(lhs),
            },
            _ => return Ok(lhs),
        };

        let simple = matches!(lhs, Expr::Ident(_) | Expr::Member { .. });
        if op != AssignOp::Assign && !simple {
            return Err(self.error("Invalid left-hand side in assignment"));
        }
        let target = to_pattern(lhs).map_err(|m| self.error(m))?;
        self.advance();
        let value = self.assignment()?;
        Ok(Expr::Assign {
            op,
            target: Box::new(target),
            value: Box::new(value),
        })
    }

    fn conditional(&mut self) -> Result<Expr, ScriptError> {
        let test = self.binary(0)?;
        if !self.eat_punct("?") {
            return Ok(test);
        }
        let then = self.assignment()?;
        self.expect_punct(":")?;
        let otherwise = self.assignment()?;
        Ok(Expr::Conditional(
            Box::new(test),
            Box::new(then),
            Box::new(otherwise),
        ))
    }

    fn binary(&mut self, min_prec: u8) -> Result<Expr, ScriptError> {
        let base = self.depth;
        let result = self.binary_chain(min_prec);
        self.depth = base;
        result
    }

    fn binary_chain(&mut self, min_prec: u8) -> Result<Expr, ScriptError> {
        let mut lhs = self.unary()?;
        loop {
            let Some((prec, op)) = self.binary_op() else {
                return Ok(lhs);
            };
            if prec < min_prec {
                return Ok(lhs);
            }
            self.advance();
            self.grow()?;
            // `**` is right-associative.
            let next = if matches!(op, Operator::Binary(BinaryOp::Exp)) {
                prec
            } else {
                prec + 1
            };
            let rhs = self.nested(|p| p.binary(next))?;
            lhs = match op {
                Operator::Binary(op) => Expr::Binary(op, Box::new(lhs), Box::new(rhs)),
                Operator::Logical(op) => Expr::Logical(op, Box::new(lhs), Box::new(rhs)),
            };
        }
    }

    fn binary_op(&self) -> Option<(u8, Operator)> {
        use BinaryOp::*;
        let op = match self.peek() {
            Token::Punct(p) => match *p {
                "??" => (1, Operator::Logical(LogicalOp::Nullish)),
                "||" => (1, Operator::Logical(LogicalOp::Or)),
                "&&" => (2, Operator::Logical(LogicalOp::And)),
                "|" => (3, Operator::Binary(BitOr)),
                "^" => (4, Operator::Binary(BitXor)),
                "&" => (5, Operator::Binary(BitAnd)),
                "==" => (6, Operator::Binary(Eq)),
                "!=" => (6, Operator::Binary(NotEq)),
                "===" => (6, Operator::Binary(StrictEq)),
                "!==" => (6, Operator::Binary(StrictNotEq)),
                "<" => (7, Operator::Binary(Lt)),
                "<=" => (7, Operator::Binary(LtEq)),
                ">" => (7, Operator::Binary(Gt)),
                ">=" => (7, Operator::Binary(GtEq)),
                "<<" => (8, Operator::Binary(Shl)),
                ">>" => (8, Operator::Binary(Shr)),
                ">>>" => (8, Operator::Binary(UShr)),
                "+" => (9, Operator::Binary(Add)),
                "-" => (9, Operator::Binary(Sub)),
                "*" => (10, Operator::Binary(Mul)),
                "/" => (10, Operator::Binary(Div)),
                "%" => (10, Operator::Binary(Rem)),
                "**" => (11, Operator::Binary(Exp)),
                _ => return None,
            },
            Token::Ident(w) if w == "in" => (7, Operator::Binary(In)),
            Token::Ident(w) if w == "instanceof" => (7, Operator::Binary(InstanceOf)),
            _ => return None,
        };
        Some(op)
    }

    fn unary(&mut self) -> Result<Expr, ScriptError> {
        let op = match self.peek() {
            Token::Punct("!") => Some(UnaryOp::Not),
            Token::Punct("-") => Some(UnaryOp::Neg),
            Token::Punct("+") => Some(UnaryOp::Plus),
            Token::Punct("~") => Some(UnaryOp::BitNot),
            Token::Ident(w) if w == "typeof" => Some(UnaryOp::TypeOf),
            Token::Ident(w) if w == "void" => Some(UnaryOp::Void),
            Token::Ident(w) if w == "delete" => Some(UnaryOp::Delete),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.nested(Self::unary)?;
            return Ok(Expr::Unary(op, Box::new(operand)));
        }

        if self.is_punct("++") || self.is_punct("--") {
            let increment = self.is_punct("++");
            self.advance();
            let target = self.nested(Self::unary)?;
            check_update_target(&target).map_err(|m| self.error(m))?;
            return Ok(Expr::Update {
                increment,
                prefix: true,
                target: Box::new(target),
            });
        }

        let expr = self.call_or_member()?;
        if (self.is_punct("++") || self.is_punct("--")) && !self.current().newline_before {
            let increment = self.is_punct("++");
            check_update_target(&expr).map_err(|m| self.error(m))?;
            self.advance();
            return Ok(Expr::Update {
                increment,
                prefix: false,
                target: Box::new(expr),
            });
        }
        Ok(expr)
    }

    fn arguments(&mut self) -> Result<Vec<ArrayElement>, ScriptError> {
        self.expect_punct("(")?;
        let mut args = Vec::new();
        while !self.eat_punct(")") {
            if self.eat_punct("...") {
                args.push(ArrayElement::Spread(self.assignment()?));
            } else {
                args.push(ArrayElement::Item(self.assignment()?));
            }
            if !self.eat_punct(",") {
                self.expect_punct(")")?;
                break;
            }
        }
        Ok(args)
    }

    fn call_or_member(&mut self) -> Result<Expr, ScriptError> {
        let mut expr = if self.eat_ident("new") {
            let callee = self.nested(|p| {
                let base = p.primary()?;
                p.member_suffixes(base, false)
            })?;
            let args = if self.is_punct("(") {
                self.arguments()?
            } else {
                Vec::new()
            };
            Expr::New {
                callee: Box::new(callee),
                args,
            }
        } else {
            self.primary()?
        };
        expr = self.member_suffixes(expr, true)?;
        Ok(expr)
    }

    fn member_suffixes(&mut self, expr: Expr, allow_calls: bool) -> Result<Expr, ScriptError> {
        let base = self.depth;
        let result = self.member_chain(expr, allow_calls);
        self.depth = base;
        result
    }

    fn member_chain(&mut self, mut expr: Expr, allow_calls: bool) -> Result<Expr, ScriptError> {
        loop {
            self.grow()?;
            if self.eat_punct(".") {
                let name = self.property_name()?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    property: MemberProperty::Named(name),
                    optional: false,
                };
            } else if self.is_punct("?.") {
                if !allow_calls {
                    return Err(self.error("Invalid optional chain from new expression"));
                }
                self.advance();
                expr = if self.is_punct("(") {
                    Expr::Call {
                        callee: Box::new(expr),
                        args: self.arguments()?,
                        optional: true,
                    }
                } else if self.eat_punct("[") {
                    let property = self.expression()?;
                    self.expect_punct("]")?;
                    Expr::Member {
                        object: Box::new(expr),
                        property: MemberProperty::Computed(Box::new(property)),
                        optional: true,
                    }
                } else {
                    Expr::Member {
                        object: Box::new(expr),
                        property: MemberProperty::Named(self.property_name()?),
                        optional: true,
                    }
                };
            } else if self.eat_punct("[") {
                let property = self.expression()?;
                self.expect_punct("]")?;
                expr = Expr::Member {
                    object: Box::new(expr),
                    property: MemberProperty::Computed(Box::new(property)),
                    optional: false,
                };
            } else if allow_calls && self.is_punct("(") {
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args: self.arguments()?,
                    optional: false,
                };
            } else if matches!(self.peek(), Token::Template { .. }) {
                return Err(self.error("Tagged templates are not supported"));
            } else {
                return Ok(expr);
            }
        }
    }

    /// Name after `.`; keywords are allowed here.
    fn property_name(&mut self) -> Result<String, ScriptError> {
        match self.peek() {
            Token::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected()),
        }
    }

    fn property_key(&mut self) -> Result<PropertyKey, ScriptError> {
        match self.peek().clone() {
            Token::Ident(name) => {
                self.advance();
                Ok(PropertyKey::Static(name))
            }
            Token::Str(s) => {
                self.advance();
                Ok(PropertyKey::Static(s))
            }
            Token::Number(n) => {
                self.advance();
                Ok(PropertyKey::Static(super::value::number_to_string(n)))
            }
            Token::Punct("[") => {
                self.advance();
                let key = self.assignment()?;
                self.expect_punct("]")?;
                Ok(PropertyKey::Computed(Box::new(key)))
            }
            _ => Err(self.unexpected()),
        }
    }

    fn primary(&mut self) -> Result<Expr, ScriptError> {
        match self.peek().clone() {
            Token::Number(n) => {
                self.advance();
                Ok(Expr::Number(n))
            }
            Token::Str(s) => {
                self.advance();
                Ok(Expr::Str(s.into()))
            }
            Token::Template { quasis, holes } => {
                self.advance();
                let mut exprs = Vec::with_capacity(holes.len());
                for hole in holes {
                    exprs.push(self.template_hole(&hole)?);
                }
                Ok(Expr::Template {
                    quasis: quasis.into_iter().map(Rc::from).collect(),
                    exprs,
                })
            }
            Token::Punct("(") => {
                self.advance();
                let expr = self.expression()?;
                self.expect_punct(")")?;
                Ok(expr)
            }
            Token::Punct("[") => self.array_literal(),
            Token::Punct("{") => self.object_literal(),
            Token::Ident(word) => match word.as_str() {
                "true" | "false" => {
                    self.advance();
                    Ok(Expr::Bool(word == "true"))
                }
                "null" => {
                    self.advance();
                    Ok(Expr::Null)
                }
                "this" => {
                    self.advance();
                    Ok(Expr::This)
                }
                "function" => {
                    self.advance();
                    let name = if matches!(self.peek(), Token::Ident(_)) {
                        Some(self.identifier()?)
                    } else {
                        None
                    };
                    Ok(Expr::Function(self.function_rest(name)?))
                }
                w if UNSUPPORTED.contains(&w) => Err(self.error(format!("'{}' is not supported", w))),
                _ => Ok(Expr::Ident(self.identifier()?)),
            },
            _ => Err(self.unexpected()),
        }
    }

    fn template_hole(&self, source: &str) -> Result<Expr, ScriptError> {
        let line = self.current().line;
        let mut tokens = tokenize(source)?;
        for token in &mut tokens {
            token.line += line - 1;
        }
        let mut parser = Parser::new(tokens, self.depth);
        let expr = parser.expression()?;
        if !parser.at_eof() {
            return Err(parser.unexpected());
        }
        Ok(expr)
    }

    fn array_literal(&mut self) -> Result<Expr, ScriptError> {
        self.expect_punct("[")?;
        let mut elements = Vec::new();
        loop {
            if self.eat_punct("]") {
                break;
            }
            if self.eat_punct(",") {
                elements.push(ArrayElement::Hole);
                continue;
            }
            if self.eat_punct("...") {
                elements.push(ArrayElement::Spread(self.assignment()?));
            } else {
                elements.push(ArrayElement::Item(self.assignment()?));
            }
            if !self.eat_punct(",") {
                self.expect_punct("]")?;
                break;
            }
        }
        Ok(Expr::Array(elements))
    }

    fn object_literal(&mut self) -> Result<Expr, ScriptError> {
        self.expect_punct("{")?;
        let mut members = Vec::new();
        loop {
            if self.eat_punct("}") {
                break;
            }
            if self.eat_punct("...") {
                members.push(ObjectMember::Spread(self.assignment()?));
            } else {
                let shorthand = match self.peek() {
                    Token::Ident(name) if !is_reserved(name) => Some(name.clone()),
                    _ => None,
                };
                let key = self.property_key()?;
                let value = if self.eat_punct(":") {
                    self.assignment()?
                } else if self.is_punct("(") {
                    let name = match &key {
                        PropertyKey::Static(name) => Some(name.clone()),
                        PropertyKey::Computed(_) => None,
                    };
                    Expr::Function(self.function_rest(name)?)
                } else if let Some(name) = shorthand {
                    Expr::Ident(name)
                } else {
                    return Err(self.unexpected());
                };
                members.push(ObjectMember::Property(key, value));
            }
            if !self.eat_punct(",") {
                self.expect_punct("}")?;
                break;
            }
        }
        Ok(Expr::Object(members))
    }
}

enum Operator {
    Binary(BinaryOp),
    Logical(LogicalOp),
}

fn assign_op(p: &str) -> Option<AssignOp> {
    use BinaryOp::*;
    let op = match p {
        "=" => AssignOp::Assign,
        "+=" => AssignOp::Compound(Add),
        "-=" => AssignOp::Compound(Sub),
        "*=" => AssignOp::Compound(Mul),
        "/=" => AssignOp::Compound(Div),
        "%=" => AssignOp::Compound(Rem),
        "**=" => AssignOp::Compound(Exp),
        "<<=" => AssignOp::Compound(Shl),
        ">>=" => AssignOp::Compound(Shr),
        ">>>=" => AssignOp::Compound(UShr),
        "&=" => AssignOp::Compound(BitAnd),
        "|=" => AssignOp::Compound(BitOr),
        "^=" => AssignOp::Compound(BitXor),
        "&&=" => AssignOp::Logical(LogicalOp::And),
        "||=" => AssignOp::Logical(LogicalOp::Or),
        "??=" => AssignOp::Logical(LogicalOp::Nullish),
        _ => return None,
    };
    Some(op)
}

fn check_update_target(expr: &Expr) -> Result<(), String> {
    match expr {
        Expr::Ident(_) | Expr::Member { optional: false, .. } => Ok(()),
        _ => Err("Invalid left-hand side expression in update operation".to_string()),
    }
}

/// Reinterpret an expression as an assignment target.
fn to_pattern(expr: Expr) -> Result<Pattern, String> {
    match expr {
        Expr::Ident(name) => Ok(Pattern::Ident(name)),
        Expr::Member { optional: false, .. } => Ok(Pattern::Expr(Box::new(expr))),
        Expr::Array(items) => {
            let mut elements = Vec::new();
            let mut rest = None;
            let count = items.len();
            for (index, item) in items.into_iter().enumerate() {
                match item {
                    ArrayElement::Hole => elements.push(None),
                    ArrayElement::Item(expr) => elements.push(Some(to_pattern_element(expr)?)),
                    ArrayElement::Spread(expr) if index + 1 == count => {
                        rest = Some(Box::new(to_pattern(expr)?));
                    }
                    ArrayElement::Spread(_) => {
                        return Err("Rest element must be last element".to_string())
                    }
                }
            }
            Ok(Pattern::Array { elements, rest })
        }
        Expr::Object(members) => {
            let mut properties = Vec::new();
            let mut rest = None;
            for member in members {
                match member {
                    ObjectMember::Property(key, value) => {
                        properties.push((key, to_pattern_element(value)?));
                    }
                    ObjectMember::Spread(Expr::Ident(name)) => rest = Some(name),
                    ObjectMember::Spread(_) => {
                        return Err("Invalid rest element in object pattern".to_string())
                    }
                }
            }
            Ok(Pattern::Object { properties, rest })
        }
        _ => Err("Invalid left-hand side in assignment".to_string()),
    }
}

fn to_pattern_element(expr: Expr) -> Result<PatternElement, String> {
    match expr {
        Expr::Assign {
            op: AssignOp::Assign,
            target,
            value,
        } => Ok(PatternElement {
            target: *target,
            default: Some(*value),
        }),
        other => Ok(PatternElement {
            target: to_pattern(other)?,
            default: None,
        }),
    }
}

fn is_reserved(word: &str) -> bool {
    matches!(
        word,
        "break"
            | "case"
            | "catch"
            | "const"
            | "continue"
            | "default"
            | "delete"
            | "do"
            | "else"
            | "false"
            | "finally"
            | "for"
            | "function"
            | "if"
            | "in"
            | "instanceof"
            | "let"
            | "new"
            | "null"
            | "return"
            | "switch"
            | "this"
            | "throw"
            | "true"
            | "try"
            | "typeof"
            | "var"
            | "void"
            | "while"
    ) || UNSUPPORTED.contains(&word)
}
