// File: src/compiler.rs
//
// Single-pass Pratt compiler. Parses directly into a `Chunk` of `Instr`s —
// there is no intermediate AST. A stack of `FunctionCtx` values tracks one
// compile context per enclosing function; the innermost (top) entry is
// always the one currently being written to.

use std::rc::Rc;

use crate::chunk::{Chunk, Instr, UpvalueRef};
use crate::errors::CompileError;
use crate::lexer::{unquote, TokenKind};
use crate::object::{LoxFunction, Obj};
use crate::parser::Parser;
use crate::value::{Interner, Value};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    /// -1 marks "declared but not yet initialized".
    depth: i32,
    is_captured: bool,
}

struct FunctionCtx<'src> {
    kind: FunctionKind,
    name: Option<Rc<str>>,
    arity: u8,
    chunk: Chunk,
    locals: Vec<Local<'src>>,
    scope_depth: usize,
    upvalues: Vec<UpvalueRef>,
}

impl<'src> FunctionCtx<'src> {
    fn new(kind: FunctionKind, name: Option<Rc<str>>) -> Self {
        // Slot 0 is reserved for the callee in functions or `this` in
        // methods/initializers; it is never addressable by source syntax
        // either way, so its lexeme is only meaningful for the latter.
        let slot0_name: &'src str =
            if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) { "this" } else { "" };
        FunctionCtx {
            kind,
            name,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![Local { name: slot0_name, depth: 0, is_captured: false }],
            scope_depth: 0,
            upvalues: Vec::new(),
        }
    }
}

struct ClassCtx {
    has_superclass: bool,
}

type ParseFn<'src, 'i> = fn(&mut Compiler<'src, 'i>, bool);

pub struct Compiler<'src, 'i> {
    parser: Parser<'src>,
    interner: &'i mut Interner,
    contexts: Vec<FunctionCtx<'src>>,
    classes: Vec<ClassCtx>,
}

/// Compiles a source string into the top-level script function. Fails iff
/// the parser recorded at least one error; `compile` never invokes the VM
/// itself.
pub fn compile(source: &str, interner: &mut Interner) -> Result<Rc<LoxFunction>, CompileError> {
    let mut compiler = Compiler {
        parser: Parser::new(source),
        interner,
        contexts: vec![FunctionCtx::new(FunctionKind::Script, None)],
        classes: Vec::new(),
    };

    while !compiler.parser.check(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.parser.consume(TokenKind::Eof, "Expect end of expression.");

    let (function, _) = compiler.end_function();

    if compiler.parser.had_error {
        Err(CompileError)
    } else {
        Ok(function)
    }
}

impl<'src, 'i> Compiler<'src, 'i> {
    fn current(&self) -> &FunctionCtx<'src> {
        self.contexts.last().expect("context stack is never empty")
    }

    fn current_mut(&mut self) -> &mut FunctionCtx<'src> {
        self.contexts.last_mut().expect("context stack is never empty")
    }

    fn emit(&mut self, instr: Instr, line: usize) -> usize {
        self.current_mut().chunk.emit(instr, line)
    }

    fn patch_jump(&mut self, at: usize) {
        if let Err(msg) = self.current_mut().chunk.patch_jump(at) {
            self.parser.error(&msg);
        }
    }

    fn emit_constant(&mut self, value: Value, line: usize) {
        match self.current_mut().chunk.add_constant(value) {
            Ok(idx) => {
                self.emit(Instr::Constant(idx), line);
            }
            Err(msg) => self.parser.error(&msg),
        }
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let interned = self.interner.intern(name);
        match self.current_mut().chunk.add_constant(Value::Obj(Obj::String(interned))) {
            Ok(idx) => idx,
            Err(msg) => {
                self.parser.error(&msg);
                0
            }
        }
    }

    // ---- declarations -------------------------------------------------

    fn declaration(&mut self) {
        if self.parser.match_kind(TokenKind::Class) {
            self.class_declaration();
        } else if self.parser.match_kind(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.parser.match_kind(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.parser.panic_mode {
            self.parser.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.parser.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.parser.previous.lexeme;
        let line = self.parser.previous.line;
        let name_const = self.identifier_constant(class_name);
        self.declare_variable(class_name);

        self.emit(Instr::Class(name_const), line);
        self.define_variable(name_const, line);

        self.classes.push(ClassCtx { has_superclass: false });

        if self.parser.match_kind(TokenKind::Less) {
            self.parser.consume(TokenKind::Identifier, "Expect superclass name.");
            let super_name = self.parser.previous.lexeme;
            let super_line = self.parser.previous.line;
            if super_name == class_name {
                self.parser.error("A class can't inherit from itself.");
            }
            self.resolve_and_emit(super_name, false, super_line);

            self.begin_scope();
            self.add_local("super");
            self.define_variable(0, super_line);

            self.resolve_and_emit(class_name, false, super_line);
            self.emit(Instr::Inherit, super_line);
            self.classes.last_mut().expect("class just pushed").has_superclass = true;
        }

        self.resolve_and_emit(class_name, false, line);
        self.parser.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.parser.check(TokenKind::RightBrace) && !self.parser.check(TokenKind::Eof) {
            self.method();
        }
        self.parser.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        let pop_line = self.parser.previous.line;
        self.emit(Instr::Pop, pop_line);

        if self.classes.last().expect("class just pushed").has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.parser.consume(TokenKind::Identifier, "Expect method name.");
        let method_name = self.parser.previous.lexeme;
        let line = self.parser.previous.line;
        let name_const = self.identifier_constant(method_name);

        let kind =
            if method_name == "init" { FunctionKind::Initializer } else { FunctionKind::Method };
        self.function(kind);
        self.emit(Instr::Method(name_const), line);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // Marked initialized before the body compiles so the function can
        // recurse by calling its own (global or local) name.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        let line = self.parser.previous.line;
        self.define_variable(global, line);
    }

    fn function(&mut self, kind: FunctionKind) {
        let name = self.interner.intern(self.parser.previous.lexeme);
        self.contexts.push(FunctionCtx::new(kind, Some(name)));

        self.begin_scope();
        self.parser.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.parser.check(TokenKind::RightParen) {
            loop {
                if self.current().arity == 255 {
                    self.parser.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.current_mut().arity += 1;
                }
                let param = self.parse_variable("Expect parameter name.");
                let line = self.parser.previous.line;
                self.define_variable(param, line);
                if !self.parser.match_kind(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.parser.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.parser.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_function();
        let line = self.parser.previous.line;
        let fn_const = match self.current_mut().chunk.add_constant(Value::Obj(Obj::Function(function))) {
            Ok(idx) => idx,
            Err(msg) => {
                self.parser.error(&msg);
                0
            }
        };
        self.emit(Instr::Closure(fn_const, upvalues), line);
    }

    /// Pops the innermost context, emitting its implicit return first, and
    /// hands back the built function plus the upvalue-capture list the
    /// enclosing context's `closure` instruction needs. Scopes are never
    /// explicitly closed here; the whole context is simply discarded.
    fn end_function(&mut self) -> (Rc<LoxFunction>, Vec<UpvalueRef>) {
        let line = self.parser.previous.line;
        self.emit_return(line);
        let ctx = self.contexts.pop().expect("end_function with no open context");
        let function = Rc::new(LoxFunction {
            arity: ctx.arity,
            upvalue_count: ctx.upvalues.len() as u8,
            chunk: ctx.chunk,
            name: ctx.name,
        });
        (function, ctx.upvalues)
    }

    fn emit_return(&mut self, line: usize) {
        if self.current().kind == FunctionKind::Initializer {
            self.emit(Instr::GetLocal(0), line);
        } else {
            self.emit(Instr::Nil, line);
        }
        self.emit(Instr::Return, line);
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.parser.match_kind(TokenKind::Equal) {
            self.expression();
        } else {
            let line = self.parser.previous.line;
            self.emit(Instr::Nil, line);
        }
        self.parser.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        let line = self.parser.previous.line;
        self.define_variable(global, line);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.parser.consume(TokenKind::Identifier, message);
        let name = self.parser.previous.lexeme;
        self.declare_variable(name);
        if self.current().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(name)
    }

    fn declare_variable(&mut self, name: &'src str) {
        if self.current().scope_depth == 0 {
            return;
        }
        let depth = self.current().scope_depth;
        let mut duplicate = false;
        for local in self.current().locals.iter().rev() {
            if local.depth != -1 && (local.depth as usize) < depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.parser.error("Variable with this name already declared in this scope.");
            return;
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: &'src str) {
        if self.current().locals.len() >= u8::MAX as usize + 1 {
            self.parser.error("Too many local variables in function.");
            return;
        }
        self.current_mut().locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn define_variable(&mut self, global: u8, line: usize) {
        if self.current().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit(Instr::DefineGlobal(global), line);
    }

    fn mark_initialized(&mut self) {
        if self.current().scope_depth == 0 {
            return;
        }
        let depth = self.current().scope_depth as i32;
        if let Some(local) = self.current_mut().locals.last_mut() {
            local.depth = depth;
        }
    }

    // ---- statements -----------------------------------------------------

    fn statement(&mut self) {
        if self.parser.match_kind(TokenKind::Print) {
            self.print_statement();
        } else if self.parser.match_kind(TokenKind::If) {
            self.if_statement();
        } else if self.parser.match_kind(TokenKind::Return) {
            self.return_statement();
        } else if self.parser.match_kind(TokenKind::While) {
            self.while_statement();
        } else if self.parser.match_kind(TokenKind::For) {
            self.for_statement();
        } else if self.parser.match_kind(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.parser.check(TokenKind::RightBrace) && !self.parser.check(TokenKind::Eof) {
            self.declaration();
        }
        self.parser.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn begin_scope(&mut self) {
        self.current_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let line = self.parser.previous.line;
        self.current_mut().scope_depth -= 1;
        let depth = self.current().scope_depth as i32;
        loop {
            let should_pop = match self.current().locals.last() {
                Some(local) => local.depth > depth,
                None => false,
            };
            if !should_pop {
                break;
            }
            let local = self.current_mut().locals.pop().expect("checked above");
            if local.is_captured {
                self.emit(Instr::CloseUpvalue, line);
            } else {
                self.emit(Instr::Pop, line);
            }
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.parser.consume(TokenKind::Semicolon, "Expect ';' after value.");
        let line = self.parser.previous.line;
        self.emit(Instr::Print, line);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.parser.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        let line = self.parser.previous.line;
        self.emit(Instr::Pop, line);
    }

    fn if_statement(&mut self) {
        self.parser.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.parser.consume(TokenKind::RightParen, "Expect ')' after condition.");
        let line = self.parser.previous.line;

        let then_jump = self.emit(Instr::JumpIfFalse(0), line);
        self.emit(Instr::Pop, line);
        self.statement();

        let line = self.parser.previous.line;
        let else_jump = self.emit(Instr::Jump(0), line);
        self.patch_jump(then_jump);
        self.emit(Instr::Pop, line);

        if self.parser.match_kind(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current().chunk.code.len();
        self.parser.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.parser.consume(TokenKind::RightParen, "Expect ')' after condition.");
        let line = self.parser.previous.line;

        let exit_jump = self.emit(Instr::JumpIfFalse(0), line);
        self.emit(Instr::Pop, line);
        self.statement();
        let line = self.parser.previous.line;
        self.emit(Instr::Loop(loop_start), line);

        self.patch_jump(exit_jump);
        self.emit(Instr::Pop, line);
    }

    /// Desugars to: init -> loop: test -> body -> increment -> back to
    /// test.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.parser.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        if self.parser.match_kind(TokenKind::Semicolon) {
            // no initializer
        } else if self.parser.match_kind(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current().chunk.code.len();
        let mut exit_jump = None;

        if !self.parser.match_kind(TokenKind::Semicolon) {
            self.expression();
            self.parser.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            let line = self.parser.previous.line;
            exit_jump = Some(self.emit(Instr::JumpIfFalse(0), line));
            self.emit(Instr::Pop, line);
        }

        if !self.parser.check(TokenKind::RightParen) {
            let line = self.parser.previous.line;
            let body_jump = self.emit(Instr::Jump(0), line);
            let increment_start = self.current().chunk.code.len();
            self.expression();
            let line = self.parser.previous.line;
            self.emit(Instr::Pop, line);
            self.parser.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit(Instr::Loop(loop_start), line);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        } else {
            self.parser.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
        }

        self.statement();
        let line = self.parser.previous.line;
        self.emit(Instr::Loop(loop_start), line);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit(Instr::Pop, line);
        }

        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.current().kind == FunctionKind::Script {
            self.parser.error("Can't return from top-level code.");
        }
        if self.parser.match_kind(TokenKind::Semicolon) {
            let line = self.parser.previous.line;
            self.emit_return(line);
        } else {
            if self.current().kind == FunctionKind::Initializer {
                self.parser.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.parser.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            let line = self.parser.previous.line;
            self.emit(Instr::Return, line);
        }
    }

    // ---- expressions (Pratt parsing) ------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.parser.advance();
        let (prefix, _, _) = Self::get_rule(self.parser.previous.kind);
        let prefix = match prefix {
            Some(f) => f,
            None => {
                self.parser.error("Expect expression.");
                return;
            }
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        loop {
            let (_, _, next_prec) = Self::get_rule(self.parser.current.kind);
            if precedence > next_prec {
                break;
            }
            self.parser.advance();
            let (_, infix, _) = Self::get_rule(self.parser.previous.kind);
            let infix = infix.expect("current token had an infix precedence but no infix rule");
            infix(self, can_assign);
        }

        if can_assign && self.parser.match_kind(TokenKind::Equal) {
            self.parser.error("Invalid assignment target.");
        }
    }

    fn get_rule(kind: TokenKind) -> (Option<ParseFn<'src, 'i>>, Option<ParseFn<'src, 'i>>, Precedence) {
        use TokenKind::*;
        match kind {
            LeftParen => (Some(Self::grouping), Some(Self::call), Precedence::Call),
            Dot => (None, Some(Self::dot), Precedence::Call),
            Minus => (Some(Self::unary), Some(Self::binary), Precedence::Term),
            Plus => (None, Some(Self::binary), Precedence::Term),
            Slash => (None, Some(Self::binary), Precedence::Factor),
            Star => (None, Some(Self::binary), Precedence::Factor),
            Bang => (Some(Self::unary), None, Precedence::None),
            BangEqual => (None, Some(Self::binary), Precedence::Equality),
            EqualEqual => (None, Some(Self::binary), Precedence::Equality),
            Greater | GreaterEqual | Less | LessEqual => {
                (None, Some(Self::binary), Precedence::Comparison)
            }
            Identifier => (Some(Self::variable), None, Precedence::None),
            String => (Some(Self::string), None, Precedence::None),
            Number => (Some(Self::number), None, Precedence::None),
            And => (None, Some(Self::and_), Precedence::And),
            Or => (None, Some(Self::or_), Precedence::Or),
            False | Nil | True => (Some(Self::literal), None, Precedence::None),
            Super => (Some(Self::super_), None, Precedence::None),
            This => (Some(Self::this_), None, Precedence::None),
            _ => (None, None, Precedence::None),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.parser.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let op = self.parser.previous.kind;
        let line = self.parser.previous.line;
        self.parse_precedence(Precedence::Unary);
        match op {
            TokenKind::Minus => self.emit(Instr::Negate, line),
            TokenKind::Bang => self.emit(Instr::Not, line),
            _ => unreachable!("unary rule registered for non-unary token"),
        };
    }

    fn binary(&mut self, _can_assign: bool) {
        let op = self.parser.previous.kind;
        let line = self.parser.previous.line;
        let (_, _, rule_prec) = Self::get_rule(op);
        self.parse_precedence(rule_prec.next());
        match op {
            TokenKind::BangEqual => {
                self.emit(Instr::Equal, line);
                self.emit(Instr::Not, line);
            }
            TokenKind::EqualEqual => {
                self.emit(Instr::Equal, line);
            }
            TokenKind::Greater => {
                self.emit(Instr::Greater, line);
            }
            TokenKind::GreaterEqual => {
                self.emit(Instr::Less, line);
                self.emit(Instr::Not, line);
            }
            TokenKind::Less => {
                self.emit(Instr::Less, line);
            }
            TokenKind::LessEqual => {
                self.emit(Instr::Greater, line);
                self.emit(Instr::Not, line);
            }
            TokenKind::Plus => {
                self.emit(Instr::Add, line);
            }
            TokenKind::Minus => {
                self.emit(Instr::Subtract, line);
            }
            TokenKind::Star => {
                self.emit(Instr::Multiply, line);
            }
            TokenKind::Slash => {
                self.emit(Instr::Divide, line);
            }
            _ => unreachable!("binary rule registered for non-binary token"),
        };
    }

    fn call(&mut self, _can_assign: bool) {
        let line = self.parser.previous.line;
        let argc = self.argument_list();
        self.emit(Instr::Call(argc), line);
    }

    fn dot(&mut self, can_assign: bool) {
        self.parser.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.parser.previous.lexeme;
        let line = self.parser.previous.line;
        let name_const = self.identifier_constant(name);

        if can_assign && self.parser.match_kind(TokenKind::Equal) {
            self.expression();
            let line = self.parser.previous.line;
            self.emit(Instr::SetProperty(name_const), line);
        } else if self.parser.match_kind(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit(Instr::Invoke(name_const, argc), line);
        } else {
            self.emit(Instr::GetProperty(name_const), line);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u16 = 0;
        if !self.parser.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.parser.error("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.parser.match_kind(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.parser.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc.min(255) as u8
    }

    fn number(&mut self, _can_assign: bool) {
        let line = self.parser.previous.line;
        let value: f64 = self.parser.previous.lexeme.parse().expect("scanner guarantees valid float");
        self.emit_constant(Value::Number(value), line);
    }

    fn string(&mut self, _can_assign: bool) {
        let line = self.parser.previous.line;
        let raw = unquote(self.parser.previous.lexeme);
        let interned = self.interner.intern(raw);
        self.emit_constant(Value::Obj(Obj::String(interned)), line);
    }

    fn literal(&mut self, _can_assign: bool) {
        let line = self.parser.previous.line;
        match self.parser.previous.kind {
            TokenKind::False => self.emit(Instr::False, line),
            TokenKind::Nil => self.emit(Instr::Nil, line),
            TokenKind::True => self.emit(Instr::True, line),
            _ => unreachable!("literal rule registered for non-literal token"),
        };
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.parser.previous.lexeme;
        let line = self.parser.previous.line;
        self.resolve_and_emit(name, can_assign, line);
    }

    fn this_(&mut self, _can_assign: bool) {
        let line = self.parser.previous.line;
        if self.classes.is_empty() {
            self.parser.error("Can't use 'this' outside of a class.");
            return;
        }
        self.resolve_and_emit("this", false, line);
    }

    fn super_(&mut self, _can_assign: bool) {
        let line = self.parser.previous.line;
        if self.classes.is_empty() {
            self.parser.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().expect("checked non-empty above").has_superclass {
            self.parser.error("Can't use 'super' in a class with no superclass.");
        }

        self.parser.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.parser.consume(TokenKind::Identifier, "Expect superclass method name.");
        let method_name = self.parser.previous.lexeme;
        let name_const = self.identifier_constant(method_name);

        self.resolve_and_emit("this", false, line);
        if self.parser.match_kind(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.resolve_and_emit("super", false, line);
            self.emit(Instr::SuperInvoke(name_const, argc), line);
        } else {
            self.resolve_and_emit("super", false, line);
            self.emit(Instr::GetSuper(name_const), line);
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let line = self.parser.previous.line;
        let end_jump = self.emit(Instr::JumpIfFalse(0), line);
        self.emit(Instr::Pop, line);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let line = self.parser.previous.line;
        let else_jump = self.emit(Instr::JumpIfFalse(0), line);
        let end_jump = self.emit(Instr::Jump(0), line);
        self.patch_jump(else_jump);
        self.emit(Instr::Pop, line);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    // ---- variable resolution ---------------------------------------------

    fn resolve_and_emit(&mut self, name: &str, can_assign: bool, line: usize) {
        let current = self.contexts.len() - 1;
        let (get_op, set_op, arg): (fn(u8) -> Instr, fn(u8) -> Instr, u8) =
            if let Some(slot) = self.resolve_local(current, name) {
                (Instr::GetLocal, Instr::SetLocal, slot)
            } else if let Some(upvalue) = self.resolve_upvalue(current, name) {
                (Instr::GetUpvalue, Instr::SetUpvalue, upvalue)
            } else {
                let idx = self.identifier_constant(name);
                (Instr::GetGlobal, Instr::SetGlobal, idx)
            };

        if can_assign && self.parser.match_kind(TokenKind::Equal) {
            self.expression();
            let line = self.parser.previous.line;
            self.emit(set_op(arg), line);
        } else {
            self.emit(get_op(arg), line);
        }
    }

    fn resolve_local(&mut self, ctx_idx: usize, name: &str) -> Option<u8> {
        let locals = &self.contexts[ctx_idx].locals;
        for (i, local) in locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    self.parser.error("Can't read local variable in its own initializer.");
                }
                return Some(i as u8);
            }
        }
        None
    }

    fn resolve_upvalue(&mut self, ctx_idx: usize, name: &str) -> Option<u8> {
        if ctx_idx == 0 {
            return None;
        }
        let enclosing = ctx_idx - 1;
        if let Some(local_slot) = self.resolve_local(enclosing, name) {
            self.contexts[enclosing].locals[local_slot as usize].is_captured = true;
            return Some(self.add_upvalue(ctx_idx, local_slot, true));
        }
        if let Some(upvalue) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(ctx_idx, upvalue, false));
        }
        None
    }

    fn add_upvalue(&mut self, ctx_idx: usize, index: u8, is_local: bool) -> u8 {
        let ctx = &mut self.contexts[ctx_idx];
        for (i, existing) in ctx.upvalues.iter().enumerate() {
            if existing.index == index && existing.is_local == is_local {
                return i as u8;
            }
        }
        if ctx.upvalues.len() >= u8::MAX as usize + 1 {
            self.parser.error("Too many closure variables in function.");
            return 0;
        }
        ctx.upvalues.push(UpvalueRef { is_local, index });
        (ctx.upvalues.len() - 1) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(source: &str) -> Rc<LoxFunction> {
        let mut interner = Interner::new();
        compile(source, &mut interner).expect("expected compile to succeed")
    }

    fn compile_err(source: &str) {
        let mut interner = Interner::new();
        assert!(compile(source, &mut interner).is_err());
    }

    #[test]
    fn compiles_simple_expression_statement() {
        let function = compile_ok("1 + 2;");
        assert!(matches!(function.chunk.code.last(), Some(Instr::Return)));
        assert!(function.chunk.code.iter().any(|i| matches!(i, Instr::Add)));
    }

    #[test]
    fn reading_own_initializer_is_a_compile_error() {
        compile_err("{ var a = a; }");
    }

    #[test]
    fn top_level_return_with_value_is_a_compile_error() {
        compile_err("return 1;");
    }

    #[test]
    fn redeclaring_a_local_in_the_same_scope_is_an_error() {
        compile_err("{ var a = 1; var a = 2; }");
    }

    #[test]
    fn function_emits_closure_with_matching_upvalue_count() {
        let function = compile_ok("fun make() { var x = 1; fun inc() { return x; } return inc; }");
        let found = function.chunk.constants.iter().find_map(|c| match c {
            Value::Obj(Obj::Function(f)) if f.name.as_deref() == Some("make") => Some(f.clone()),
            _ => None,
        });
        let make_fn = found.expect("make function constant present");
        let inner = make_fn.chunk.constants.iter().find_map(|c| match c {
            Value::Obj(Obj::Function(f)) => Some(f.clone()),
            _ => None,
        });
        let inc_fn = inner.expect("inc function constant present");
        assert_eq!(inc_fn.upvalue_count, 1);
    }

    #[test]
    fn this_outside_class_is_an_error() {
        compile_err("fun f() { return this; }");
    }

    #[test]
    fn invalid_assignment_target_is_an_error() {
        compile_err("1 + 2 = 3;");
    }
}
