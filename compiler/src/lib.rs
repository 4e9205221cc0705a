//! A single-pass Pratt-parsing compiler: tokens go in, bytecode comes out,
//! with no intermediate AST.

pub mod chunk;
pub mod disasm;
pub mod error;
pub mod value;

use chunk::{Function, OpCode};
use error::{CompileError, ErrorSite};
use lexer::{Scanner, Token, TokenKind};
use std::rc::Rc;
use value::Constant;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

fn precedence_of(kind: TokenKind) -> Precedence {
    use TokenKind::*;
    match kind {
        Minus | Plus => Precedence::Term,
        Slash | Star => Precedence::Factor,
        BangEqual | EqualEqual => Precedence::Equality,
        Greater | GreaterEqual | Less | LessEqual => Precedence::Comparison,
        And => Precedence::And,
        Or => Precedence::Or,
        LeftParen | Dot => Precedence::Call,
        _ => Precedence::None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    depth: i32,
    is_captured: bool,
}

struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

/// Per-function compilation state: the function being built, its locals and
/// captured upvalues, and the enclosing scope's state (pushed/popped as a
/// stack as the compiler enters and leaves nested `fun` bodies).
struct FunctionScope<'src> {
    function: Function,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

impl<'src> FunctionScope<'src> {
    fn new(name: Option<Rc<str>>, kind: FunctionKind) -> Self {
        // Slot 0 is reserved for the receiver in methods/initializers, and
        // for the (unused) callee in plain functions and the script.
        let first_local_name = if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
            "this"
        } else {
            ""
        };
        Self {
            function: Function::new(name),
            kind,
            locals: vec![Local {
                name: first_local_name,
                depth: 0,
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassScope {
    has_superclass: bool,
}

struct LoopScope {
    loop_start: usize,
    scope_depth: i32,
    break_jumps: Vec<usize>,
}

/// The compiler. Holds the token cursor over a [`Scanner`] plus the stack of
/// in-progress function and class scopes.
pub struct Compiler<'src> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    scopes: Vec<FunctionScope<'src>>,
    classes: Vec<ClassScope>,
    loops: Vec<LoopScope>,
}

/// Compiles a complete source string into the implicit top-level script
/// function, or the accumulated diagnostics if compilation failed.
pub fn compile(source: &str) -> Result<Rc<Function>, Vec<CompileError>> {
    let mut compiler = Compiler::new(source);
    compiler.run()
}

impl<'src> Compiler<'src> {
    fn new(source: &'src str) -> Self {
        let mut scanner = Scanner::new(source);
        let first = scanner.next_token();
        Self {
            scanner,
            previous: first,
            current: first,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            scopes: vec![FunctionScope::new(None, FunctionKind::Script)],
            classes: Vec::new(),
            loops: Vec::new(),
        }
    }

    fn run(&mut self) -> Result<Rc<Function>, Vec<CompileError>> {
        self.advance();
        while !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::Eof, "Expect end of expression.");
        let function = self.end_function();
        if self.had_error {
            Err(std::mem::take(&mut self.errors))
        } else {
            Ok(Rc::new(function))
        }
    }

    // ---- token stream helpers ----

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.to_string();
            self.error_at_current(&message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let site = if token.kind == TokenKind::Eof {
            ErrorSite::Eof
        } else {
            ErrorSite::Token(token.lexeme.to_string())
        };
        self.errors
            .push(CompileError::new(token.line, site, message.to_string()));
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            use TokenKind::*;
            match self.current.kind {
                Class | Fun | Var | For | If | While | Print | Return => return,
                _ => self.advance(),
            }
        }
    }

    // ---- scope/function stack ----

    fn scope(&mut self) -> &mut FunctionScope<'src> {
        self.scopes.last_mut().expect("at least one function scope")
    }

    fn line(&self) -> u32 {
        self.previous.line
    }

    fn emit(&mut self, op: OpCode) {
        let line = self.line();
        self.scope().function.chunk.write_op(op, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.line();
        self.scope().function.chunk.write_byte(byte, line);
    }

    fn emit_u16(&mut self, value: u16) {
        let line = self.line();
        self.scope().function.chunk.write_u16(value, line);
    }

    fn emit_constant(&mut self, value: Constant) {
        match self.scope().function.chunk.add_constant(value) {
            Some(index) => {
                self.emit(OpCode::Constant);
                self.emit_u16(index);
            }
            None => self.error("Too many constants in one chunk."),
        }
    }

    fn identifier_constant(&mut self, name: &str) -> u16 {
        match self
            .scope()
            .function
            .chunk
            .add_constant(Constant::Str(Rc::from(name)))
        {
            Some(index) => index,
            None => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_return(&mut self) {
        if self.scope().kind == FunctionKind::Initializer {
            self.emit(OpCode::GetLocal);
            self.emit_byte(0);
        } else {
            self.emit(OpCode::Nil);
        }
        self.emit(OpCode::Return);
    }

    fn end_function(&mut self) -> Function {
        self.emit_return();
        let scope = self.scopes.pop().expect("ending a function scope");
        scope.function
    }

    fn begin_scope(&mut self) {
        self.scope().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.scope().scope_depth -= 1;
        let depth = self.scope().scope_depth;
        loop {
            let should_pop = matches!(self.scope().locals.last(), Some(local) if local.depth > depth);
            if !should_pop {
                break;
            }
            let is_captured = self.scope().locals.last().unwrap().is_captured;
            if is_captured {
                self.emit(OpCode::CloseUpvalue);
            } else {
                self.emit(OpCode::Pop);
            }
            self.scope().locals.pop();
        }
    }

    // ---- declarations ----

    fn declaration(&mut self) {
        if self.matches(TokenKind::Class) {
            self.class_declaration();
        } else if self.matches(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let name_token = self.previous;
        let name_constant = self.identifier_constant(name_token.lexeme);
        self.declare_variable(name_token);

        self.emit(OpCode::Class);
        self.emit_u16(name_constant);
        self.define_variable(name_constant, name_token);

        self.classes.push(ClassScope {
            has_superclass: false,
        });

        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let super_token = self.previous;
            self.variable_by_name(super_token, false);
            if super_token.lexeme == name_token.lexeme {
                self.error("A class can't inherit from itself.");
            }
            self.begin_scope();
            self.add_local("super");
            self.mark_initialized();
            self.named_variable(name_token, false);
            self.emit(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(name_token, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit(OpCode::Pop); // the class itself

        let class_scope = self.classes.pop().unwrap();
        if class_scope.has_superclass {
            self.end_scope();
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name_token = self.previous;
        let name_constant = self.identifier_constant(name_token.lexeme);
        let kind = if name_token.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind, name_token.lexeme);
        self.emit(OpCode::Method);
        self.emit_u16(name_constant);
    }

    fn fun_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect function name.");
        let name_token = self.previous;
        let name_constant = self.identifier_constant(name_token.lexeme);
        self.declare_variable(name_token);
        self.mark_initialized();
        self.function(FunctionKind::Function, name_token.lexeme);
        self.define_variable(name_constant, name_token);
    }

    fn function(&mut self, kind: FunctionKind, name: &str) {
        self.scopes
            .push(FunctionScope::new(Some(Rc::from(name)), kind));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.scope().function.arity == 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                self.scope().function.arity += 1;
                self.consume(TokenKind::Identifier, "Expect parameter name.");
                let param = self.previous;
                self.declare_variable(param);
                self.mark_initialized();
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let upvalue_descs: Vec<(bool, u8)> = {
            let scope = self.scope();
            scope
                .upvalues
                .iter()
                .map(|u| (u.is_local, u.index))
                .collect()
        };
        let mut function = self.end_function();
        function.upvalue_count = upvalue_descs.len() as u32;

        let constant = match self
            .scope()
            .function
            .chunk
            .add_constant(Constant::Function(Rc::new(function)))
        {
            Some(index) => index,
            None => {
                self.error("Too many constants in one chunk.");
                0
            }
        };
        self.emit(OpCode::Closure);
        self.emit_u16(constant);
        for (is_local, index) in upvalue_descs {
            self.emit_byte(is_local as u8);
            self.emit_byte(index);
        }
    }

    fn var_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect variable name.");
        let name_token = self.previous;
        self.declare_variable(name_token);
        let global_constant = if self.scope().scope_depth == 0 {
            self.identifier_constant(name_token.lexeme)
        } else {
            0
        };

        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global_constant, name_token);
    }

    fn declare_variable(&mut self, name: Token<'src>) {
        if self.scope().scope_depth == 0 {
            return;
        }
        let depth = self.scope().scope_depth;
        let mut duplicate = false;
        for local in self.scope().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name.lexeme {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name.lexeme);
    }

    fn add_local(&mut self, name: &'src str) {
        if self.scope().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.scope().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        if self.scope().scope_depth == 0 {
            return;
        }
        let depth = self.scope().scope_depth;
        self.scope().locals.last_mut().unwrap().depth = depth;
    }

    fn define_variable(&mut self, global_constant: u16, name: Token<'src>) {
        if self.scope().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        let _ = name;
        self.emit(OpCode::DefineGlobal);
        self.emit_u16(global_constant);
    }

    // ---- statements ----

    fn statement(&mut self) {
        if self.matches(TokenKind::Print) {
            self.print_statement();
        } else if self.matches(TokenKind::If) {
            self.if_statement();
        } else if self.matches(TokenKind::Return) {
            self.return_statement();
        } else if self.matches(TokenKind::While) {
            self.while_statement();
        } else if self.matches(TokenKind::For) {
            self.for_statement();
        } else if self.matches(TokenKind::Break) {
            self.break_statement();
        } else if self.matches(TokenKind::Continue) {
            self.continue_statement();
        } else if self.matches(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit(OpCode::Pop);
        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk_len();
        self.loops.push(LoopScope {
            loop_start,
            scope_depth: self.scope().scope_depth,
            break_jumps: Vec::new(),
        });

        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit(OpCode::Pop);
        self.end_loop();
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.matches(TokenKind::Semicolon) {
            // no initializer
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk_len();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit(OpCode::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk_len();
            self.expression();
            self.emit(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.loops.push(LoopScope {
            loop_start,
            scope_depth: self.scope().scope_depth,
            break_jumps: Vec::new(),
        });

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit(OpCode::Pop);
        }
        self.end_loop();
        self.end_scope();
    }

    fn end_loop(&mut self) {
        let loop_scope = self.loops.pop().expect("ending a loop scope");
        for jump in loop_scope.break_jumps {
            self.patch_jump(jump);
        }
    }

    fn break_statement(&mut self) {
        if self.loops.is_empty() {
            self.error("Can't use 'break' outside of a loop.");
        } else {
            self.pop_locals_above_loop_depth();
            let jump = self.emit_jump(OpCode::Jump);
            self.loops.last_mut().unwrap().break_jumps.push(jump);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
    }

    fn continue_statement(&mut self) {
        if self.loops.is_empty() {
            self.error("Can't use 'continue' outside of a loop.");
        } else {
            self.pop_locals_above_loop_depth();
            let loop_start = self.loops.last().unwrap().loop_start;
            self.emit_loop(loop_start);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
    }

    fn pop_locals_above_loop_depth(&mut self) {
        let loop_depth = self.loops.last().unwrap().scope_depth;
        let count = self
            .scope()
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth > loop_depth)
            .count();
        for _ in 0..count {
            self.emit(OpCode::Pop);
        }
    }

    fn return_statement(&mut self) {
        if self.scope().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.matches(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.scope().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit(OpCode::Return);
        }
    }

    fn current_chunk_len(&mut self) -> usize {
        self.scope().function.chunk.len()
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        let line = self.line();
        self.scope().function.chunk.emit_jump(op, line)
    }

    fn patch_jump(&mut self, offset: usize) {
        if self.scope().function.chunk.patch_jump(offset).is_err() {
            self.error("Too much code to jump over.");
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        let line = self.line();
        if self
            .scope()
            .function
            .chunk
            .emit_loop(loop_start, line)
            .is_err()
        {
            self.error("Too much code to jump over.");
        }
    }

    // ---- expressions ----

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix(self.previous.kind, can_assign) {
            self.error("Expect expression.");
            return;
        }
        while precedence <= precedence_of(self.current.kind) {
            self.advance();
            self.infix(self.previous.kind, can_assign);
        }
        if can_assign && self.matches(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn prefix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        use TokenKind::*;
        match kind {
            LeftParen => self.grouping(),
            Minus | Bang => self.unary(),
            Number => self.number(),
            String => self.string(),
            True | False | Nil => self.literal(),
            Identifier => self.variable(can_assign),
            This => self.this_expr(),
            Super => self.super_expr(),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool) {
        use TokenKind::*;
        match kind {
            Minus | Plus | Slash | Star | BangEqual | EqualEqual | Greater | GreaterEqual
            | Less | LessEqual => self.binary(),
            And => self.and_expr(),
            Or => self.or_expr(),
            LeftParen => self.call_expr(),
            Dot => self.dot_expr(can_assign),
            _ => unreachable!("token {:?} has no infix rule", kind),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self) {
        let value: f64 = self.previous.lexeme.parse().expect("lexer only yields valid numbers");
        self.emit_constant(Constant::Number(value));
    }

    fn string(&mut self) {
        let lexeme = self.previous.lexeme;
        let text = &lexeme[1..lexeme.len() - 1];
        self.emit_constant(Constant::Str(Rc::from(text)));
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::True => self.emit(OpCode::True),
            TokenKind::False => self.emit(OpCode::False),
            TokenKind::Nil => self.emit(OpCode::Nil),
            _ => unreachable!(),
        }
    }

    fn unary(&mut self) {
        let kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match kind {
            TokenKind::Minus => self.emit(OpCode::Negate),
            TokenKind::Bang => self.emit(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self) {
        let kind = self.previous.kind;
        let precedence = precedence_of(kind);
        self.parse_precedence(precedence.next());
        use TokenKind::*;
        match kind {
            Plus => self.emit(OpCode::Add),
            Minus => self.emit(OpCode::Subtract),
            Star => self.emit(OpCode::Multiply),
            Slash => self.emit(OpCode::Divide),
            EqualEqual => self.emit(OpCode::Equal),
            BangEqual => {
                self.emit(OpCode::Equal);
                self.emit(OpCode::Not);
            }
            Greater => self.emit(OpCode::Greater),
            GreaterEqual => {
                self.emit(OpCode::Less);
                self.emit(OpCode::Not);
            }
            Less => self.emit(OpCode::Less),
            LessEqual => {
                self.emit(OpCode::Greater);
                self.emit(OpCode::Not);
            }
            _ => unreachable!(),
        }
    }

    fn and_expr(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_expr(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call_expr(&mut self) {
        let argc = self.argument_list();
        self.emit(OpCode::Call);
        self.emit_byte(argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc as u8
    }

    fn dot_expr(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name_token = self.previous;
        let name_constant = self.identifier_constant(name_token.lexeme);

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit(OpCode::SetProperty);
            self.emit_u16(name_constant);
        } else if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit(OpCode::Invoke);
            self.emit_u16(name_constant);
            self.emit_byte(argc);
        } else {
            self.emit(OpCode::GetProperty);
            self.emit_u16(name_constant);
        }
    }

    fn this_expr(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_expr(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name_token = self.previous;
        let name_constant = self.identifier_constant(name_token.lexeme);

        self.named_variable(synthetic_token("this", name_token.line), false);
        if self.matches(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable(synthetic_token("super", name_token.line), false);
            self.emit(OpCode::SuperInvoke);
            self.emit_u16(name_constant);
            self.emit_byte(argc);
        } else {
            self.named_variable(synthetic_token("super", name_token.line), false);
            self.emit(OpCode::GetSuper);
            self.emit_u16(name_constant);
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.variable_by_name(self.previous, can_assign);
    }

    fn variable_by_name(&mut self, name: Token<'src>, can_assign: bool) {
        self.named_variable(name, can_assign);
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let (get_op, set_op, operand) = if let Some(slot) = self.resolve_local(self.scopes.len() - 1, name.lexeme) {
            (OpCode::GetLocal, OpCode::SetLocal, Operand::Byte(slot))
        } else if let Some(slot) = self.resolve_upvalue(self.scopes.len() - 1, name.lexeme) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, Operand::Byte(slot))
        } else {
            let constant = self.identifier_constant(name.lexeme);
            (OpCode::GetGlobal, OpCode::SetGlobal, Operand::Short(constant))
        };

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit(set_op);
        } else {
            self.emit(get_op);
        }
        match operand {
            Operand::Byte(b) => self.emit_byte(b),
            Operand::Short(s) => self.emit_u16(s),
        }
    }

    fn resolve_local(&mut self, scope_index: usize, name: &str) -> Option<u8> {
        let found = self.scopes[scope_index]
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| local.name == name)
            .map(|(i, local)| (i as u8, local.depth));
        match found {
            Some((slot, -1)) => {
                self.error("Can't read local variable in its own initializer.");
                Some(slot)
            }
            Some((slot, _)) => Some(slot),
            None => None,
        }
    }

    fn resolve_upvalue(&mut self, scope_index: usize, name: &str) -> Option<u8> {
        if scope_index == 0 {
            return None;
        }
        let enclosing = scope_index - 1;
        if let Some(local_slot) = self.resolve_local(enclosing, name) {
            self.scopes[enclosing].locals[local_slot as usize].is_captured = true;
            return Some(self.add_upvalue(scope_index, local_slot, true));
        }
        if let Some(upvalue_slot) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(scope_index, upvalue_slot, false));
        }
        None
    }

    fn add_upvalue(&mut self, scope_index: usize, index: u8, is_local: bool) -> u8 {
        let scope = &mut self.scopes[scope_index];
        for (i, up) in scope.upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i as u8;
            }
        }
        if scope.upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        scope.upvalues.push(UpvalueDesc { index, is_local });
        (scope.upvalues.len() - 1) as u8
    }
}

enum Operand {
    Byte(u8),
    Short(u16),
}

fn synthetic_token(lexeme: &'static str, line: u32) -> Token<'static> {
    Token::new(TokenKind::Identifier, lexeme, line)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compiles(source: &str) -> bool {
        compile(source).is_ok()
    }

    fn errors(source: &str) -> Vec<String> {
        match compile(source) {
            Ok(_) => vec![],
            Err(errors) => errors.iter().map(|e| e.message.clone()).collect(),
        }
    }

    #[test]
    fn compiles_simple_arithmetic() {
        assert!(compiles("print 1 + 2 * 3;"));
    }

    #[test]
    fn compiles_closures_and_classes() {
        assert!(compiles(
            "fun make() { var x = 0; fun inc() { x = x + 1; return x; } return inc; } \
             class A { greet() { print \"A\"; } } class B < A { greet() { super.greet(); } }"
        ));
    }

    #[test]
    fn rejects_return_from_top_level() {
        let errs = errors("return 1;");
        assert!(errs.iter().any(|m| m.contains("top-level")));
    }

    #[test]
    fn rejects_duplicate_local_declaration() {
        let errs = errors("{ var a = 1; var a = 2; }");
        assert!(errs.iter().any(|m| m.contains("Already a variable")));
    }

    #[test]
    fn rejects_self_inheritance() {
        let errs = errors("class A < A {}");
        assert!(errs.iter().any(|m| m.contains("inherit from itself")));
    }

    #[test]
    fn rejects_break_outside_loop() {
        let errs = errors("break;");
        assert!(errs.iter().any(|m| m.contains("outside of a loop")));
    }

    #[test]
    fn too_many_parameters_is_an_error() {
        let params: Vec<String> = (0..256).map(|i| format!("a{i}")).collect();
        let source = format!("fun f({}) {{}}", params.join(", "));
        let errs = errors(&source);
        assert!(errs.iter().any(|m| m.contains("255 parameters")));
    }
}
