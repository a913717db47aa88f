//! The Flint compiler: a single-pass Pratt parser that emits bytecode while
//! it parses. Strings and function objects land on the shared heap as they
//! are built; the finished product is the top-level script function.

mod error;
mod func;
mod token;
#[cfg(test)]
mod test;

pub use error::CompileError;

use flint_bytecode::Op;
use flint_core::object::Function;
use flint_core::{Gc, Heap, Value};

use func::{FunctionCtx, FunctionKind};
use token::{Scanned, Scanner, Token};

/// Compile a source string into the top-level script function, or the list
/// of everything wrong with it.
pub fn compile(source: &str, heap: &mut Heap) -> Result<Gc<Function>, Vec<CompileError>> {
    let mut parser = Parser::new(source, heap);
    parser.advance();
    while !parser.match_token(Token::Eof) {
        parser.declaration();
    }
    parser.finish()
}

/// Binding powers, weakest first. Each infix token parses its right operand
/// at one level above its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
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
            Precedence::Unary | Precedence::Call => Precedence::Call,
        }
    }
}

fn infix_precedence(token: Token) -> Precedence {
    match token {
        Token::Or => Precedence::Or,
        Token::And => Precedence::And,
        Token::BangEqual | Token::EqualEqual => Precedence::Equality,
        Token::Greater | Token::GreaterEqual | Token::Less | Token::LessEqual => {
            Precedence::Comparison
        }
        Token::Minus | Token::Plus => Precedence::Term,
        Token::Slash | Token::Star => Precedence::Factor,
        Token::LeftParen | Token::Dot => Precedence::Call,
        _ => Precedence::None,
    }
}

/// Per-class-body state for `this`/`super` validity checks.
struct ClassCtx {
    enclosing: Option<Box<ClassCtx>>,
    has_superclass: bool,
}

struct Parser<'src, 'heap> {
    scanner: Scanner<'src>,
    heap: &'heap mut Heap,
    current: Scanned<'src>,
    previous: Scanned<'src>,
    ctx: FunctionCtx,
    class_ctx: Option<Box<ClassCtx>>,
    errors: Vec<CompileError>,
    panic_mode: bool,
}

impl<'src, 'heap> Parser<'src, 'heap> {
    fn new(source: &'src str, heap: &'heap mut Heap) -> Parser<'src, 'heap> {
        let placeholder = Scanned {
            token: Token::Eof,
            lexeme: "",
            line: 1,
        };
        Parser {
            scanner: Scanner::new(source),
            heap,
            current: placeholder,
            previous: placeholder,
            ctx: FunctionCtx::new(FunctionKind::Script, None),
            class_ctx: None,
            errors: Vec::new(),
            panic_mode: false,
        }
    }

    fn finish(mut self) -> Result<Gc<Function>, Vec<CompileError>> {
        let line = self.previous.line;
        self.ctx.emit_return(line);
        if self.errors.is_empty() {
            Ok(self.heap.alloc(self.ctx.function))
        } else {
            Err(self.errors)
        }
    }

    // === Token plumbing ===

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.next_token();
            if self.current.token != Token::Error {
                break;
            }
            self.error_at_current("Unexpected character.");
        }
    }

    fn consume(&mut self, token: Token, message: &str) {
        if self.current.token == token {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, token: Token) -> bool {
        self.current.token == token
    }

    fn match_token(&mut self, token: Token) -> bool {
        if !self.check(token) {
            return false;
        }
        self.advance();
        true
    }

    // === Errors ===

    fn error_at(&mut self, at: Scanned<'src>, message: &str) {
        // Panic mode swallows everything until the next synchronization
        // point, so one mistake reports once.
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let err = CompileError::new(at.line, message);
        let err = match at.token {
            Token::Eof => err.at_eof(),
            Token::Error => err,
            _ => err.at_token(at.lexeme),
        };
        self.errors.push(err);
    }

    fn error(&mut self, message: &str) {
        let at = self.previous;
        self.error_at(at, message);
    }

    fn error_at_current(&mut self, message: &str) {
        let at = self.current;
        self.error_at(at, message);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.token != Token::Eof {
            if self.previous.token == Token::Semicolon {
                return;
            }
            match self.current.token {
                Token::Class
                | Token::Fun
                | Token::Var
                | Token::For
                | Token::If
                | Token::While
                | Token::Print
                | Token::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // === Emission wrappers, all charging the previous token's line ===

    fn emit_op(&mut self, op: Op) {
        let line = self.previous.line;
        self.ctx.emit_op(op, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.ctx.emit_byte(byte, line);
    }

    fn emit_pair(&mut self, op: Op, operand: u8) {
        let line = self.previous.line;
        self.ctx.emit_pair(op, operand, line);
    }

    fn emit_return(&mut self) {
        let line = self.previous.line;
        self.ctx.emit_return(line);
    }

    fn emit_constant(&mut self, value: Value) {
        let line = self.previous.line;
        if let Err(message) = self.ctx.emit_constant(value, line) {
            self.error(message);
        }
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.ctx.make_constant(value) {
            Ok(index) => index,
            Err(message) => {
                self.error(message);
                0
            }
        }
    }

    fn emit_jump(&mut self, op: Op) -> usize {
        let line = self.previous.line;
        self.ctx.emit_jump(op, line)
    }

    fn patch_jump(&mut self, offset: usize) {
        if let Err(message) = self.ctx.patch_jump(offset) {
            self.error(message);
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        let line = self.previous.line;
        if let Err(message) = self.ctx.emit_loop(loop_start, line) {
            self.error(message);
        }
    }

    // === Scopes and function contexts ===

    fn begin_scope(&mut self) {
        self.ctx.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.ctx.scope_depth -= 1;
        loop {
            let op = match self.ctx.locals.last() {
                Some(local) if local.depth.map_or(false, |d| d > self.ctx.scope_depth) => {
                    if local.is_captured {
                        Op::CloseUpvalue
                    } else {
                        Op::Pop
                    }
                }
                _ => break,
            };
            self.emit_op(op);
            self.ctx.locals.pop();
        }
    }

    fn begin_ctx(&mut self, kind: FunctionKind) {
        let name = self.heap.intern(self.previous.lexeme);
        let enclosing = std::mem::replace(&mut self.ctx, FunctionCtx::new(kind, Some(name)));
        self.ctx.enclosing = Some(Box::new(enclosing));
    }

    fn end_ctx(&mut self) -> FunctionCtx {
        self.emit_return();
        let enclosing = self
            .ctx
            .enclosing
            .take()
            .expect("function context nesting underflow");
        std::mem::replace(&mut self.ctx, *enclosing)
    }

    // === Declarations ===

    fn declaration(&mut self) {
        if self.match_token(Token::Class) {
            self.class_declaration();
        } else if self.match_token(Token::Fun) {
            self.fun_declaration();
        } else if self.match_token(Token::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(Token::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme;
        let name_constant = self.identifier_constant(class_name);
        if let Err(message) = self.ctx.declare_local(class_name) {
            self.error(message);
        }
        self.emit_pair(Op::Class, name_constant);
        self.define_variable(name_constant);

        self.class_ctx = Some(Box::new(ClassCtx {
            enclosing: self.class_ctx.take(),
            has_superclass: false,
        }));

        if self.match_token(Token::Less) {
            self.consume(Token::Identifier, "Expect superclass name.");
            self.variable(false);
            if class_name == self.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }

            // The superclass stays on the stack for the class body as a
            // hidden local named `super`; end_scope pops it after the
            // methods are installed.
            self.begin_scope();
            if let Err(message) = self.ctx.declare_local("super") {
                self.error(message);
            }
            self.ctx.mark_initialized();

            self.named_variable(class_name, false);
            self.emit_op(Op::Inherit);
            if let Some(ctx) = self.class_ctx.as_deref_mut() {
                ctx.has_superclass = true;
            }
        }

        self.named_variable(class_name, false);
        self.consume(Token::LeftBrace, "Expect '{' before class body.");
        while !self.check(Token::RightBrace) && !self.check(Token::Eof) {
            self.method();
        }
        self.consume(Token::RightBrace, "Expect '}' after class body.");
        self.emit_op(Op::Pop);

        let has_superclass = self.class_ctx.as_ref().map_or(false, |c| c.has_superclass);
        if has_superclass {
            self.end_scope();
        }
        self.class_ctx = self.class_ctx.take().and_then(|ctx| ctx.enclosing);
    }

    fn method(&mut self) {
        self.consume(Token::Identifier, "Expect method name.");
        let constant = self.identifier_constant(self.previous.lexeme);
        let kind = if self.previous.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_pair(Op::Method, constant);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // Initialized eagerly so the body may refer to itself.
        self.ctx.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        self.begin_ctx(kind);
        self.begin_scope();

        self.consume(Token::LeftParen, "Expect '(' after function name.");
        if !self.check(Token::RightParen) {
            loop {
                if self.ctx.function.arity == u8::MAX {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.ctx.function.arity += 1;
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(Token::Comma) {
                    break;
                }
            }
        }
        self.consume(Token::RightParen, "Expect ')' after parameters.");
        self.consume(Token::LeftBrace, "Expect '{' before function body.");
        self.block();

        // No end_scope: the frame's slots die with the context, and
        // OP_RETURN closes captured ones at runtime.
        let finished = self.end_ctx();
        let upvalues = finished.upvalues;
        let function = self.heap.alloc(finished.function);
        let constant = self.make_constant(Value::Obj(function.as_obj()));
        self.emit_pair(Op::Closure, constant);
        for upvalue in &upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.match_token(Token::Equal) {
            self.expression();
        } else {
            self.emit_op(Op::Nil);
        }
        self.consume(Token::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    /// Consume an identifier; declare it as a local in block scope, or
    /// intern it as a constant-pool name at global scope.
    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(Token::Identifier, message);
        if let Err(msg) = self.ctx.declare_local(self.previous.lexeme) {
            self.error(msg);
        }
        if self.ctx.scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.lexeme)
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let interned = self.heap.intern(name);
        self.make_constant(Value::from(interned))
    }

    fn define_variable(&mut self, global: u8) {
        if self.ctx.scope_depth > 0 {
            self.ctx.mark_initialized();
            return;
        }
        self.emit_pair(Op::DefineGlobal, global);
    }

    // === Statements ===

    fn statement(&mut self) {
        if self.match_token(Token::Print) {
            self.print_statement();
        } else if self.match_token(Token::For) {
            self.for_statement();
        } else if self.match_token(Token::If) {
            self.if_statement();
        } else if self.match_token(Token::Return) {
            self.return_statement();
        } else if self.match_token(Token::While) {
            self.while_statement();
        } else if self.match_token(Token::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(Token::RightBrace) && !self.check(Token::Eof) {
            self.declaration();
        }
        self.consume(Token::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(Token::Semicolon, "Expect ';' after value.");
        self.emit_op(Op::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(Token::Semicolon, "Expect ';' after expression.");
        self.emit_op(Op::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(Token::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(Token::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.statement();
        let else_jump = self.emit_jump(Op::Jump);

        self.patch_jump(then_jump);
        self.emit_op(Op::Pop);
        if self.match_token(Token::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.ctx.code_len();
        self.consume(Token::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(Token::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(Op::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(Token::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(Token::Semicolon) {
            // No initializer.
        } else if self.match_token(Token::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.ctx.code_len();
        let mut exit_jump = None;
        if !self.match_token(Token::Semicolon) {
            self.expression();
            self.consume(Token::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(Op::JumpIfFalse));
            self.emit_op(Op::Pop);
        }

        if !self.match_token(Token::RightParen) {
            // The increment clause textually precedes the body but runs
            // after it: jump over it now, loop back to it later.
            let body_jump = self.emit_jump(Op::Jump);
            let increment_start = self.ctx.code_len();
            self.expression();
            self.emit_op(Op::Pop);
            self.consume(Token::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(Op::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.ctx.kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }

        if self.match_token(Token::Semicolon) {
            self.emit_return();
        } else {
            if self.ctx.kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(Token::Semicolon, "Expect ';' after return value.");
            self.emit_op(Op::Return);
        }
    }

    // === Expressions ===

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix(self.previous.token, can_assign) {
            self.error("Expect expression.");
            return;
        }

        while precedence <= infix_precedence(self.current.token) {
            self.advance();
            self.infix(self.previous.token, can_assign);
        }

        if can_assign && self.match_token(Token::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    /// Dispatch the prefix rule; false means the token starts no
    /// expression.
    fn prefix(&mut self, token: Token, can_assign: bool) -> bool {
        match token {
            Token::LeftParen => self.grouping(),
            Token::Minus | Token::Bang => self.unary(),
            Token::Number => self.number(),
            Token::String => self.string(),
            Token::Identifier => self.variable(can_assign),
            Token::Nil | Token::True | Token::False => self.literal(),
            Token::This => self.this_expression(),
            Token::Super => self.super_expression(),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, token: Token, can_assign: bool) {
        match token {
            Token::Minus
            | Token::Plus
            | Token::Slash
            | Token::Star
            | Token::BangEqual
            | Token::EqualEqual
            | Token::Greater
            | Token::GreaterEqual
            | Token::Less
            | Token::LessEqual => self.binary(),
            Token::And => self.and_expression(),
            Token::Or => self.or_expression(),
            Token::LeftParen => self.call(),
            Token::Dot => self.dot(can_assign),
            _ => unreachable!("token without an infix rule has precedence None"),
        }
    }

    fn number(&mut self) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or_default();
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self) {
        let lexeme = self.previous.lexeme;
        let text = &lexeme[1..lexeme.len() - 1];
        let interned = self.heap.intern(text);
        self.emit_constant(Value::from(interned));
    }

    fn literal(&mut self) {
        match self.previous.token {
            Token::Nil => self.emit_op(Op::Nil),
            Token::True => self.emit_op(Op::True),
            Token::False => self.emit_op(Op::False),
            _ => unreachable!("literal rule only fires for literal tokens"),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(Token::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self) {
        let operator = self.previous.token;
        self.parse_precedence(Precedence::Unary);
        match operator {
            Token::Minus => self.emit_op(Op::Negate),
            Token::Bang => self.emit_op(Op::Not),
            _ => unreachable!("unary rule only fires for '-' and '!'"),
        }
    }

    fn binary(&mut self) {
        let operator = self.previous.token;
        self.parse_precedence(infix_precedence(operator).next());

        match operator {
            Token::Plus => self.emit_op(Op::Add),
            Token::Minus => self.emit_op(Op::Subtract),
            Token::Star => self.emit_op(Op::Multiply),
            Token::Slash => self.emit_op(Op::Divide),
            Token::BangEqual => {
                self.emit_op(Op::Equal);
                self.emit_op(Op::Not);
            }
            Token::EqualEqual => self.emit_op(Op::Equal),
            Token::Greater => self.emit_op(Op::Greater),
            Token::GreaterEqual => {
                self.emit_op(Op::Less);
                self.emit_op(Op::Not);
            }
            Token::Less => self.emit_op(Op::Less),
            Token::LessEqual => {
                self.emit_op(Op::Greater);
                self.emit_op(Op::Not);
            }
            _ => unreachable!("binary rule only fires for binary operators"),
        }
    }

    fn and_expression(&mut self) {
        let end_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_expression(&mut self) {
        let else_jump = self.emit_jump(Op::JumpIfFalse);
        let end_jump = self.emit_jump(Op::Jump);

        self.patch_jump(else_jump);
        self.emit_op(Op::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self) {
        let arg_count = self.argument_list();
        self.emit_pair(Op::Call, arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(Token::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    count += 1;
                }
                if !self.match_token(Token::Comma) {
                    break;
                }
            }
        }
        self.consume(Token::RightParen, "Expect ')' after arguments.");
        count as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(Token::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.lexeme);

        if can_assign && self.match_token(Token::Equal) {
            self.expression();
            self.emit_pair(Op::SetProperty, name);
        } else if self.match_token(Token::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_pair(Op::Invoke, name);
            self.emit_byte(arg_count);
        } else {
            self.emit_pair(Op::GetProperty, name);
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous.lexeme, can_assign);
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let (get_op, set_op, arg) = match self.ctx.resolve_local(name) {
            Err(message) => {
                self.error(message);
                return;
            }
            Ok(Some(slot)) => (Op::GetLocal, Op::SetLocal, slot),
            Ok(None) => match self.ctx.resolve_upvalue(name) {
                Err(message) => {
                    self.error(message);
                    return;
                }
                Ok(Some(index)) => (Op::GetUpvalue, Op::SetUpvalue, index),
                Ok(None) => {
                    let constant = self.identifier_constant(name);
                    (Op::GetGlobal, Op::SetGlobal, constant)
                }
            },
        };

        if can_assign && self.match_token(Token::Equal) {
            self.expression();
            self.emit_pair(set_op, arg);
        } else {
            self.emit_pair(get_op, arg);
        }
    }

    fn this_expression(&mut self) {
        if self.class_ctx.is_none() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_expression(&mut self) {
        let (in_class, has_superclass) = match &self.class_ctx {
            None => (false, false),
            Some(ctx) => (true, ctx.has_superclass),
        };
        if !in_class {
            self.error("Can't use 'super' outside of a class.");
        } else if !has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }

        self.consume(Token::Dot, "Expect '.' after 'super'.");
        self.consume(Token::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous.lexeme);

        self.named_variable("this", false);
        if self.match_token(Token::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable("super", false);
            self.emit_pair(Op::SuperInvoke, name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable("super", false);
            self.emit_pair(Op::GetSuper, name);
        }
    }
}
