// Single-pass Pratt compiler: walks tokens once, emitting bytecode
// directly with no intermediate AST. Ported in meaning from
// `CLox/compiler.c` — locals/upvalues/class handling, jump patching, and
// the precedence-climbing expression parser all follow its shape, wrapped
// in an owned enclosing-compiler chain instead of a global `current`
// pointer.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::bytecode::{Chunk, OpCode};
use crate::lexer::{Scanner, Token, TokenKind};
use crate::object::{FunctionObj, Heap, ObjData};
use crate::table::StringInterner;
use crate::value::{Handle, Value};

#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
    pub line: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
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

type ParseFn = for<'src, 'h> fn(&mut State<'src, 'h>, &mut Compiler<'src>, bool);

#[derive(Clone, Copy)]
struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

static RULES: Lazy<HashMap<TokenKind, ParseRule>> = Lazy::new(build_rule_table);

fn build_rule_table() -> HashMap<TokenKind, ParseRule> {
    use Precedence as P;
    use TokenKind as T;
    let mut m = HashMap::new();
    let rule = |prefix: Option<ParseFn>, infix: Option<ParseFn>, precedence: Precedence| ParseRule {
        prefix,
        infix,
        precedence,
    };
    m.insert(T::LeftParen, rule(Some(grouping), Some(call), P::Call));
    m.insert(T::Dot, rule(Option::None, Some(dot), P::Call));
    m.insert(T::Minus, rule(Some(unary), Some(binary), P::Term));
    m.insert(T::Plus, rule(Option::None, Some(binary), P::Term));
    m.insert(T::Slash, rule(Option::None, Some(binary), P::Factor));
    m.insert(T::Star, rule(Option::None, Some(binary), P::Factor));
    m.insert(T::Bang, rule(Some(unary), Option::None, P::None));
    m.insert(T::BangEqual, rule(Option::None, Some(binary), P::Equality));
    m.insert(T::EqualEqual, rule(Option::None, Some(binary), P::Equality));
    m.insert(T::Greater, rule(Option::None, Some(binary), P::Comparison));
    m.insert(T::GreaterEqual, rule(Option::None, Some(binary), P::Comparison));
    m.insert(T::Less, rule(Option::None, Some(binary), P::Comparison));
    m.insert(T::LessEqual, rule(Option::None, Some(binary), P::Comparison));
    m.insert(T::Identifier, rule(Some(variable), Option::None, P::None));
    m.insert(T::String, rule(Some(string_literal), Option::None, P::None));
    m.insert(T::Number, rule(Some(number), Option::None, P::None));
    m.insert(T::And, rule(Option::None, Some(and_), P::And));
    m.insert(T::Or, rule(Option::None, Some(or_), P::Or));
    m.insert(T::False, rule(Some(literal), Option::None, P::None));
    m.insert(T::Nil, rule(Some(literal), Option::None, P::None));
    m.insert(T::True, rule(Some(literal), Option::None, P::None));
    m.insert(T::Super, rule(Some(super_), Option::None, P::None));
    m.insert(T::This, rule(Some(this_), Option::None, P::None));
    m
}

fn get_rule(kind: TokenKind) -> ParseRule {
    *RULES.get(&kind).unwrap_or(&ParseRule { prefix: None, infix: None, precedence: Precedence::None })
}

struct Local<'src> {
    name: &'src str,
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct UpvalueInfo {
    index: u8,
    is_local: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Function,
    Initializer,
    Method,
    Script,
}

struct ClassState {
    has_superclass: bool,
}

struct Compiler<'src> {
    enclosing: Option<Box<Compiler<'src>>>,
    function: FunctionObj,
    fn_type: FunctionType,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueInfo>,
    scope_depth: i32,
}

impl<'src> Compiler<'src> {
    fn new(fn_type: FunctionType, enclosing: Option<Box<Compiler<'src>>>) -> Self {
        let mut c = Self {
            enclosing,
            function: FunctionObj::new(),
            fn_type,
            locals: Vec::new(),
            upvalues: Vec::new(),
            scope_depth: 0,
        };
        // Slot 0 is reserved: the receiver for methods/initializers, an
        // unnameable placeholder everywhere else.
        let name = if fn_type == FunctionType::Method || fn_type == FunctionType::Initializer {
            "this"
        } else {
            ""
        };
        c.locals.push(Local { name, depth: 0, is_captured: false });
        c
    }
}

struct State<'src, 'h> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    heap: &'h mut Heap,
    strings: &'h mut StringInterner,
    class_stack: Vec<ClassState>,
}

/// Compile `source` into a top-level script function. On success the
/// returned handle points to a `FunctionObj` with no name and no
/// parameters, ready to be wrapped in a closure and run.
pub fn compile(source: &str, heap: &mut Heap, strings: &mut StringInterner) -> Result<Handle, Vec<CompileError>> {
    let dummy = Token { kind: TokenKind::Eof, lexeme: "", line: 0 };
    let mut state = State {
        scanner: Scanner::new(source),
        current: dummy,
        previous: dummy,
        had_error: false,
        panic_mode: false,
        errors: Vec::new(),
        heap,
        strings,
        class_stack: Vec::new(),
    };
    advance(&mut state);

    let mut compiler = Compiler::new(FunctionType::Script, None);
    while !check(&state, TokenKind::Eof) {
        compiler = declaration(&mut state, compiler);
    }
    consume(&mut state, TokenKind::Eof, "Expect end of expression.");

    let line = state.previous.line;
    emit_return(&mut compiler, line);

    if state.had_error {
        return Err(state.errors);
    }
    let handle = state.heap.allocate(ObjData::Function(compiler.function));
    Ok(handle)
}

// ---- token stream plumbing ----------------------------------------------

fn advance(state: &mut State) {
    state.previous = state.current;
    loop {
        state.current = state.scanner.scan_token();
        if state.current.kind != TokenKind::Error {
            break;
        }
        let message = state.current.lexeme.to_string();
        error_at_current(state, &message);
    }
}

fn check(state: &State, kind: TokenKind) -> bool {
    state.current.kind == kind
}

fn matches(state: &mut State, kind: TokenKind) -> bool {
    if !check(state, kind) {
        return false;
    }
    advance(state);
    true
}

fn consume(state: &mut State, kind: TokenKind, message: &str) {
    if state.current.kind == kind {
        advance(state);
    } else {
        error_at_current(state, message);
    }
}

fn error_at(state: &mut State, lexeme: &str, line: usize, is_eof: bool, message: &str) {
    if state.panic_mode {
        return;
    }
    state.panic_mode = true;
    state.had_error = true;
    let location = if is_eof { " at end".to_string() } else { format!(" at '{lexeme}'") };
    state.errors.push(CompileError { message: format!("[line {line}] Error{location}: {message}"), line });
}

fn error(state: &mut State, message: &str) {
    let tok = state.previous;
    error_at(state, tok.lexeme, tok.line, tok.kind == TokenKind::Eof, message);
}

fn error_at_current(state: &mut State, message: &str) {
    let tok = state.current;
    error_at(state, tok.lexeme, tok.line, tok.kind == TokenKind::Eof, message);
}

fn synchronize(state: &mut State) {
    state.panic_mode = false;
    while state.current.kind != TokenKind::Eof {
        if state.previous.kind == TokenKind::Semicolon {
            return;
        }
        match state.current.kind {
            TokenKind::Class
            | TokenKind::Fun
            | TokenKind::Var
            | TokenKind::For
            | TokenKind::If
            | TokenKind::While
            | TokenKind::Print
            | TokenKind::Return => return,
            _ => advance(state),
        }
    }
}

// ---- bytecode emission ---------------------------------------------------

fn current_chunk<'a>(compiler: &'a mut Compiler) -> &'a mut Chunk {
    &mut compiler.function.chunk
}

fn emit_byte(compiler: &mut Compiler, byte: u8, line: usize) {
    current_chunk(compiler).write(byte, line);
}

fn emit_bytes(compiler: &mut Compiler, a: u8, b: u8, line: usize) {
    emit_byte(compiler, a, line);
    emit_byte(compiler, b, line);
}

fn emit_op(compiler: &mut Compiler, op: OpCode, line: usize) {
    emit_byte(compiler, op as u8, line);
}

fn emit_jump(compiler: &mut Compiler, op: OpCode, line: usize) -> usize {
    emit_op(compiler, op, line);
    emit_byte(compiler, 0xff, line);
    emit_byte(compiler, 0xff, line);
    current_chunk(compiler).count() - 2
}

fn patch_jump<'src, 'h>(state: &mut State<'src, 'h>, compiler: &mut Compiler<'src>, offset: usize) {
    let jump = current_chunk(compiler).count() - offset - 2;
    if jump > u16::MAX as usize {
        error(state, "Too much code to jump over.");
    }
    let bytes = (jump as u16).to_be_bytes();
    current_chunk(compiler).code[offset] = bytes[0];
    current_chunk(compiler).code[offset + 1] = bytes[1];
}

fn emit_loop<'src, 'h>(state: &mut State<'src, 'h>, compiler: &mut Compiler<'src>, loop_start: usize, line: usize) {
    emit_op(compiler, OpCode::Loop, line);
    let offset = current_chunk(compiler).count() - loop_start + 2;
    if offset > u16::MAX as usize {
        error(state, "Loop body too large.");
    }
    let bytes = (offset as u16).to_be_bytes();
    emit_byte(compiler, bytes[0], line);
    emit_byte(compiler, bytes[1], line);
}

fn make_constant<'src, 'h>(state: &mut State<'src, 'h>, compiler: &mut Compiler<'src>, value: Value) -> u8 {
    let index = current_chunk(compiler).add_constant(value);
    if index > u8::MAX as usize {
        error(state, "Too many constants in one chunk.");
        return 0;
    }
    index as u8
}

fn emit_constant<'src, 'h>(state: &mut State<'src, 'h>, compiler: &mut Compiler<'src>, value: Value, line: usize) {
    let index = make_constant(state, compiler, value);
    emit_bytes(compiler, OpCode::Constant as u8, index, line);
}

fn emit_return(compiler: &mut Compiler, line: usize) {
    if compiler.fn_type == FunctionType::Initializer {
        emit_bytes(compiler, OpCode::GetLocal as u8, 0, line);
    } else {
        emit_op(compiler, OpCode::Nil, line);
    }
    emit_op(compiler, OpCode::Return, line);
}

fn identifier_constant<'src, 'h>(state: &mut State<'src, 'h>, compiler: &mut Compiler<'src>, name: &str) -> u8 {
    let handle = state.strings.intern(state.heap, name);
    let value = Value::Obj(handle);
    if let Some(index) = current_chunk(compiler).constants.iter().position(|c| *c == value) {
        return index as u8;
    }
    make_constant(state, compiler, value)
}

// ---- locals, upvalues, scopes --------------------------------------------

fn add_local<'src>(state: &mut State, compiler: &mut Compiler<'src>, name: &'src str) {
    if compiler.locals.len() >= 256 {
        error(state, "Too many local variables in function.");
        return;
    }
    compiler.locals.push(Local { name, depth: -1, is_captured: false });
}

fn declare_variable<'src>(state: &mut State<'src, '_>, compiler: &mut Compiler<'src>) {
    if compiler.scope_depth == 0 {
        return;
    }
    let name = state.previous.lexeme;
    for local in compiler.locals.iter().rev() {
        if local.depth != -1 && local.depth < compiler.scope_depth {
            break;
        }
        if local.name == name {
            error(state, "Already a variable with this name in this scope.");
        }
    }
    add_local(state, compiler, name);
}

fn mark_initialized(compiler: &mut Compiler) {
    if compiler.scope_depth == 0 {
        return;
    }
    let last = compiler.locals.len() - 1;
    compiler.locals[last].depth = compiler.scope_depth;
}

fn parse_variable<'src>(state: &mut State<'src, '_>, compiler: &mut Compiler<'src>, message: &str) -> u8 {
    consume(state, TokenKind::Identifier, message);
    declare_variable(state, compiler);
    if compiler.scope_depth > 0 {
        return 0;
    }
    identifier_constant(state, compiler, state.previous.lexeme)
}

fn define_variable<'src, 'h>(state: &mut State<'src, 'h>, compiler: &mut Compiler<'src>, global: u8, line: usize) {
    if compiler.scope_depth > 0 {
        mark_initialized(compiler);
        return;
    }
    emit_bytes(compiler, OpCode::DefineGlobal as u8, global, line);
}

fn resolve_local<'src>(state: &mut State<'src, '_>, compiler: &Compiler<'src>, name: &str) -> Option<u8> {
    for (i, local) in compiler.locals.iter().enumerate().rev() {
        if local.name == name {
            if local.depth == -1 {
                error(state, "Can't read local variable in its own initializer.");
            }
            return Some(i as u8);
        }
    }
    None
}

fn add_upvalue<'src, 'h>(state: &mut State<'src, 'h>, compiler: &mut Compiler<'src>, index: u8, is_local: bool) -> u8 {
    for (i, uv) in compiler.upvalues.iter().enumerate() {
        if uv.index == index && uv.is_local == is_local {
            return i as u8;
        }
    }
    if compiler.upvalues.len() >= 256 {
        error(state, "Too many closure variables in function.");
        return 0;
    }
    compiler.upvalues.push(UpvalueInfo { index, is_local });
    (compiler.upvalues.len() - 1) as u8
}

fn resolve_upvalue<'src>(state: &mut State<'src, '_>, compiler: &mut Compiler<'src>, name: &str) -> Option<u8> {
    let enclosing = compiler.enclosing.as_deref_mut()?;
    if let Some(local) = resolve_local(state, enclosing, name) {
        enclosing.locals[local as usize].is_captured = true;
        return Some(add_upvalue(state, compiler, local, true));
    }
    if let Some(upvalue) = resolve_upvalue(state, enclosing, name) {
        return Some(add_upvalue(state, compiler, upvalue, false));
    }
    None
}

fn begin_scope(compiler: &mut Compiler) {
    compiler.scope_depth += 1;
}

fn flush_pops(compiler: &mut Compiler, count: usize, line: usize) {
    if count == 1 {
        emit_op(compiler, OpCode::Pop, line);
    } else if count > 0 {
        emit_bytes(compiler, OpCode::PopN as u8, count.min(255) as u8, line);
    }
}

fn end_scope(compiler: &mut Compiler, line: usize) {
    compiler.scope_depth -= 1;
    let mut pending = 0usize;
    while let Some(local) = compiler.locals.last() {
        if local.depth <= compiler.scope_depth {
            break;
        }
        let local = compiler.locals.pop().unwrap();
        if local.is_captured {
            flush_pops(compiler, pending, line);
            pending = 0;
            emit_op(compiler, OpCode::CloseUpvalue, line);
        } else {
            pending += 1;
        }
    }
    flush_pops(compiler, pending, line);
}

// ---- expressions -----------------------------------------------------

fn parse_precedence<'src, 'h>(state: &mut State<'src, 'h>, compiler: &mut Compiler<'src>, precedence: Precedence) {
    advance(state);
    let prefix_rule = get_rule(state.previous.kind).prefix;
    let Some(prefix_rule) = prefix_rule else {
        error(state, "Expect expression.");
        return;
    };
    let can_assign = precedence <= Precedence::Assignment;
    prefix_rule(state, compiler, can_assign);

    while precedence <= get_rule(state.current.kind).precedence {
        advance(state);
        let infix_rule = get_rule(state.previous.kind).infix.expect("infix rule must exist for this token");
        infix_rule(state, compiler, can_assign);
    }

    if can_assign && matches(state, TokenKind::Equal) {
        error(state, "Invalid assignment target.");
    }
}

fn expression<'src, 'h>(state: &mut State<'src, 'h>, compiler: &mut Compiler<'src>) {
    parse_precedence(state, compiler, Precedence::Assignment);
}

fn number<'src, 'h>(state: &mut State<'src, 'h>, compiler: &mut Compiler<'src>, _can_assign: bool) {
    let value: f64 = state.previous.lexeme.parse().expect("scanner only emits well-formed numbers");
    emit_constant(state, compiler, Value::Number(value), state.previous.line);
}

fn string_literal<'src, 'h>(state: &mut State<'src, 'h>, compiler: &mut Compiler<'src>, _can_assign: bool) {
    let lexeme = state.previous.lexeme;
    let text = &lexeme[1..lexeme.len() - 1];
    let handle = state.strings.intern(state.heap, text);
    emit_constant(state, compiler, Value::Obj(handle), state.previous.line);
}

fn grouping<'src, 'h>(state: &mut State<'src, 'h>, compiler: &mut Compiler<'src>, _can_assign: bool) {
    expression(state, compiler);
    consume(state, TokenKind::RightParen, "Expect ')' after expression.");
}

fn unary<'src, 'h>(state: &mut State<'src, 'h>, compiler: &mut Compiler<'src>, _can_assign: bool) {
    let op = state.previous.kind;
    let line = state.previous.line;
    parse_precedence(state, compiler, Precedence::Unary);
    match op {
        TokenKind::Bang => emit_op(compiler, OpCode::Not, line),
        TokenKind::Minus => emit_op(compiler, OpCode::Negate, line),
        _ => unreachable!("unary() called for non-unary token"),
    }
}

fn binary<'src, 'h>(state: &mut State<'src, 'h>, compiler: &mut Compiler<'src>, _can_assign: bool) {
    let op = state.previous.kind;
    let line = state.previous.line;
    let rule = get_rule(op);
    parse_precedence(state, compiler, rule.precedence.next());
    match op {
        TokenKind::BangEqual => emit_bytes(compiler, OpCode::Equal as u8, OpCode::Not as u8, line),
        TokenKind::EqualEqual => emit_op(compiler, OpCode::Equal, line),
        TokenKind::Greater => emit_op(compiler, OpCode::Greater, line),
        TokenKind::GreaterEqual => emit_bytes(compiler, OpCode::Less as u8, OpCode::Not as u8, line),
        TokenKind::Less => emit_op(compiler, OpCode::Less, line),
        TokenKind::LessEqual => emit_bytes(compiler, OpCode::Greater as u8, OpCode::Not as u8, line),
        TokenKind::Plus => emit_op(compiler, OpCode::Add, line),
        TokenKind::Minus => emit_op(compiler, OpCode::Subtract, line),
        TokenKind::Star => emit_op(compiler, OpCode::Multiply, line),
        TokenKind::Slash => emit_op(compiler, OpCode::Divide, line),
        _ => unreachable!("binary() called for non-binary token"),
    }
}

fn literal<'src, 'h>(state: &mut State<'src, 'h>, compiler: &mut Compiler<'src>, _can_assign: bool) {
    let line = state.previous.line;
    match state.previous.kind {
        TokenKind::False => emit_op(compiler, OpCode::False, line),
        TokenKind::Nil => emit_op(compiler, OpCode::Nil, line),
        TokenKind::True => emit_op(compiler, OpCode::True, line),
        _ => unreachable!("literal() called for non-literal token"),
    }
}

fn and_<'src, 'h>(state: &mut State<'src, 'h>, compiler: &mut Compiler<'src>, _can_assign: bool) {
    let line = state.previous.line;
    let end_jump = emit_jump(compiler, OpCode::JumpIfFalse, line);
    emit_op(compiler, OpCode::Pop, line);
    parse_precedence(state, compiler, Precedence::And);
    patch_jump(state, compiler, end_jump);
}

fn or_<'src, 'h>(state: &mut State<'src, 'h>, compiler: &mut Compiler<'src>, _can_assign: bool) {
    let line = state.previous.line;
    let else_jump = emit_jump(compiler, OpCode::JumpIfFalse, line);
    let end_jump = emit_jump(compiler, OpCode::Jump, line);
    patch_jump(state, compiler, else_jump);
    emit_op(compiler, OpCode::Pop, line);
    parse_precedence(state, compiler, Precedence::Or);
    patch_jump(state, compiler, end_jump);
}

fn argument_list<'src, 'h>(state: &mut State<'src, 'h>, compiler: &mut Compiler<'src>) -> u8 {
    let mut count: u32 = 0;
    if !check(state, TokenKind::RightParen) {
        loop {
            expression(state, compiler);
            if count == 255 {
                error(state, "Can't have more than 255 arguments.");
            }
            count += 1;
            if !matches(state, TokenKind::Comma) {
                break;
            }
        }
    }
    consume(state, TokenKind::RightParen, "Expect ')' after arguments.");
    count.min(255) as u8
}

fn call<'src, 'h>(state: &mut State<'src, 'h>, compiler: &mut Compiler<'src>, _can_assign: bool) {
    let line = state.previous.line;
    let argc = argument_list(state, compiler);
    emit_bytes(compiler, OpCode::Call as u8, argc, line);
}

fn dot<'src, 'h>(state: &mut State<'src, 'h>, compiler: &mut Compiler<'src>, can_assign: bool) {
    consume(state, TokenKind::Identifier, "Expect property name after '.'.");
    let name = state.previous.lexeme;
    let line = state.previous.line;
    let name_idx = identifier_constant(state, compiler, name);
    if can_assign && matches(state, TokenKind::Equal) {
        expression(state, compiler);
        emit_bytes(compiler, OpCode::SetProperty as u8, name_idx, line);
    } else if matches(state, TokenKind::LeftParen) {
        let argc = argument_list(state, compiler);
        emit_byte(compiler, OpCode::Invoke as u8, line);
        emit_bytes(compiler, name_idx, argc, line);
    } else {
        emit_bytes(compiler, OpCode::GetProperty as u8, name_idx, line);
    }
}

fn named_variable<'src>(state: &mut State<'src, '_>, compiler: &mut Compiler<'src>, tok: Token<'src>, can_assign: bool) {
    let (get_op, set_op, arg) = if let Some(local) = resolve_local(state, compiler, tok.lexeme) {
        (OpCode::GetLocal, OpCode::SetLocal, local)
    } else if let Some(upvalue) = resolve_upvalue(state, compiler, tok.lexeme) {
        (OpCode::GetUpvalue, OpCode::SetUpvalue, upvalue)
    } else {
        let global = identifier_constant(state, compiler, tok.lexeme);
        (OpCode::GetGlobal, OpCode::SetGlobal, global)
    };

    if can_assign && matches(state, TokenKind::Equal) {
        expression(state, compiler);
        emit_bytes(compiler, set_op as u8, arg, tok.line);
    } else {
        emit_bytes(compiler, get_op as u8, arg, tok.line);
    }
}

fn variable<'src>(state: &mut State<'src, '_>, compiler: &mut Compiler<'src>, can_assign: bool) {
    let tok = state.previous;
    named_variable(state, compiler, tok, can_assign);
}

fn this_<'src>(state: &mut State<'src, '_>, compiler: &mut Compiler<'src>, _can_assign: bool) {
    if state.class_stack.is_empty() {
        error(state, "Can't use 'this' outside of a class.");
        return;
    }
    let tok = Token { kind: TokenKind::Identifier, lexeme: "this", line: state.previous.line };
    named_variable(state, compiler, tok, false);
}

fn super_<'src>(state: &mut State<'src, '_>, compiler: &mut Compiler<'src>, _can_assign: bool) {
    match state.class_stack.last() {
        None => error(state, "Can't use 'super' outside of a class."),
        Some(c) if !c.has_superclass => error(state, "Can't use 'super' in a class with no superclass."),
        _ => {}
    }
    consume(state, TokenKind::Dot, "Expect '.' after 'super'.");
    consume(state, TokenKind::Identifier, "Expect superclass method name.");
    let name = state.previous.lexeme;
    let line = state.previous.line;
    let name_idx = identifier_constant(state, compiler, name);

    let this_tok = Token { kind: TokenKind::Identifier, lexeme: "this", line };
    let super_tok = Token { kind: TokenKind::Identifier, lexeme: "super", line };
    named_variable(state, compiler, this_tok, false);
    if matches(state, TokenKind::LeftParen) {
        let argc = argument_list(state, compiler);
        named_variable(state, compiler, super_tok, false);
        emit_byte(compiler, OpCode::SuperInvoke as u8, line);
        emit_bytes(compiler, name_idx, argc, line);
    } else {
        named_variable(state, compiler, super_tok, false);
        emit_bytes(compiler, OpCode::GetSuper as u8, name_idx, line);
    }
}

// ---- statements --------------------------------------------------------

fn block<'src>(state: &mut State<'src, '_>, mut compiler: Compiler<'src>) -> Compiler<'src> {
    while !check(state, TokenKind::RightBrace) && !check(state, TokenKind::Eof) {
        compiler = declaration(state, compiler);
    }
    consume(state, TokenKind::RightBrace, "Expect '}' after block.");
    compiler
}

fn print_statement<'src, 'h>(state: &mut State<'src, 'h>, compiler: &mut Compiler<'src>) {
    expression(state, compiler);
    consume(state, TokenKind::Semicolon, "Expect ';' after value.");
    emit_op(compiler, OpCode::Print, state.previous.line);
}

fn expression_statement<'src, 'h>(state: &mut State<'src, 'h>, compiler: &mut Compiler<'src>) {
    expression(state, compiler);
    consume(state, TokenKind::Semicolon, "Expect ';' after expression.");
    emit_op(compiler, OpCode::Pop, state.previous.line);
}

fn if_statement<'src>(state: &mut State<'src, '_>, mut compiler: Compiler<'src>) -> Compiler<'src> {
    consume(state, TokenKind::LeftParen, "Expect '(' after 'if'.");
    expression(state, &mut compiler);
    consume(state, TokenKind::RightParen, "Expect ')' after condition.");

    let line = state.previous.line;
    let then_jump = emit_jump(&mut compiler, OpCode::JumpIfFalse, line);
    emit_op(&mut compiler, OpCode::Pop, line);
    compiler = statement(state, compiler);

    let else_jump = emit_jump(&mut compiler, OpCode::Jump, line);
    patch_jump(state, &mut compiler, then_jump);
    emit_op(&mut compiler, OpCode::Pop, line);

    if matches(state, TokenKind::Else) {
        compiler = statement(state, compiler);
    }
    patch_jump(state, &mut compiler, else_jump);
    compiler
}

fn while_statement<'src>(state: &mut State<'src, '_>, mut compiler: Compiler<'src>) -> Compiler<'src> {
    let loop_start = current_chunk(&mut compiler).count();
    consume(state, TokenKind::LeftParen, "Expect '(' after 'while'.");
    expression(state, &mut compiler);
    consume(state, TokenKind::RightParen, "Expect ')' after condition.");

    let line = state.previous.line;
    let exit_jump = emit_jump(&mut compiler, OpCode::JumpIfFalse, line);
    emit_op(&mut compiler, OpCode::Pop, line);
    compiler = statement(state, compiler);
    emit_loop(state, &mut compiler, loop_start, line);

    patch_jump(state, &mut compiler, exit_jump);
    emit_op(&mut compiler, OpCode::Pop, line);
    compiler
}

fn for_statement<'src>(state: &mut State<'src, '_>, mut compiler: Compiler<'src>) -> Compiler<'src> {
    begin_scope(&mut compiler);
    consume(state, TokenKind::LeftParen, "Expect '(' after 'for'.");

    if matches(state, TokenKind::Semicolon) {
        // no initializer
    } else if matches(state, TokenKind::Var) {
        var_declaration(state, &mut compiler);
    } else {
        expression_statement(state, &mut compiler);
    }

    let mut loop_start = current_chunk(&mut compiler).count();
    let mut exit_jump: Option<usize> = None;
    if !matches(state, TokenKind::Semicolon) {
        expression(state, &mut compiler);
        consume(state, TokenKind::Semicolon, "Expect ';' after loop condition.");
        let line = state.previous.line;
        exit_jump = Some(emit_jump(&mut compiler, OpCode::JumpIfFalse, line));
        emit_op(&mut compiler, OpCode::Pop, line);
    }

    if !matches(state, TokenKind::RightParen) {
        let line = state.previous.line;
        let body_jump = emit_jump(&mut compiler, OpCode::Jump, line);
        let increment_start = current_chunk(&mut compiler).count();
        expression(state, &mut compiler);
        emit_op(&mut compiler, OpCode::Pop, state.previous.line);
        consume(state, TokenKind::RightParen, "Expect ')' after for clauses.");

        emit_loop(state, &mut compiler, loop_start, state.previous.line);
        loop_start = increment_start;
        patch_jump(state, &mut compiler, body_jump);
    }

    compiler = statement(state, compiler);
    emit_loop(state, &mut compiler, loop_start, state.previous.line);

    if let Some(exit_jump) = exit_jump {
        patch_jump(state, &mut compiler, exit_jump);
        emit_op(&mut compiler, OpCode::Pop, state.previous.line);
    }

    end_scope(&mut compiler, state.previous.line);
    compiler
}

fn return_statement<'src, 'h>(state: &mut State<'src, 'h>, compiler: &mut Compiler<'src>) {
    if compiler.fn_type == FunctionType::Script {
        error(state, "Can't return from top-level code.");
    }
    let line = state.previous.line;
    if matches(state, TokenKind::Semicolon) {
        emit_return(compiler, line);
    } else {
        if compiler.fn_type == FunctionType::Initializer {
            error(state, "Can't return a value from an initializer.");
        }
        expression(state, compiler);
        consume(state, TokenKind::Semicolon, "Expect ';' after return value.");
        emit_op(compiler, OpCode::Return, state.previous.line);
    }
}

fn var_declaration<'src>(state: &mut State<'src, '_>, compiler: &mut Compiler<'src>) {
    let global = parse_variable(state, compiler, "Expect variable name.");
    let line = state.previous.line;
    if matches(state, TokenKind::Equal) {
        expression(state, compiler);
    } else {
        emit_op(compiler, OpCode::Nil, line);
    }
    consume(state, TokenKind::Semicolon, "Expect ';' after variable declaration.");
    define_variable(state, compiler, global, state.previous.line);
}

fn statement<'src>(state: &mut State<'src, '_>, mut compiler: Compiler<'src>) -> Compiler<'src> {
    if matches(state, TokenKind::Print) {
        print_statement(state, &mut compiler);
        compiler
    } else if matches(state, TokenKind::If) {
        if_statement(state, compiler)
    } else if matches(state, TokenKind::While) {
        while_statement(state, compiler)
    } else if matches(state, TokenKind::For) {
        for_statement(state, compiler)
    } else if matches(state, TokenKind::Return) {
        return_statement(state, &mut compiler);
        compiler
    } else if matches(state, TokenKind::LeftBrace) {
        begin_scope(&mut compiler);
        compiler = block(state, compiler);
        end_scope(&mut compiler, state.previous.line);
        compiler
    } else {
        expression_statement(state, &mut compiler);
        compiler
    }
}

/// Compile a nested function body (used for both `fun` declarations and
/// methods): push a fresh `Compiler` boxing `outer` as its enclosing scope,
/// parse the parameter list and body, then emit a `CLOSURE` into `outer`'s
/// chunk referencing the finished function plus its upvalue trailer.
fn compile_function_body<'src>(
    state: &mut State<'src, '_>,
    outer: Compiler<'src>,
    fn_type: FunctionType,
    name: &'src str,
    line: usize,
) -> Compiler<'src> {
    let mut inner = Compiler::new(fn_type, Some(Box::new(outer)));
    inner.function.name = Some(state.strings.intern(state.heap, name));

    begin_scope(&mut inner);
    consume(state, TokenKind::LeftParen, "Expect '(' after function name.");
    if !check(state, TokenKind::RightParen) {
        loop {
            if inner.function.arity >= 255 {
                error_at_current(state, "Can't have more than 255 parameters.");
            } else {
                inner.function.arity += 1;
            }
            let constant = parse_variable(state, &mut inner, "Expect parameter name.");
            define_variable(state, &mut inner, constant, state.previous.line);
            if !matches(state, TokenKind::Comma) {
                break;
            }
        }
    }
    consume(state, TokenKind::RightParen, "Expect ')' after parameters.");
    consume(state, TokenKind::LeftBrace, "Expect '{' before function body.");
    inner = block(state, inner);

    let end_line = state.previous.line;
    emit_return(&mut inner, end_line);

    inner.function.upvalue_count = inner.upvalues.len();
    let upvalues = inner.upvalues.clone();
    let function_obj = inner.function;
    let mut outer = *inner.enclosing.take().expect("nested compiler always has an enclosing compiler");

    let handle = state.heap.allocate(ObjData::Function(function_obj));
    let const_idx = make_constant(state, &mut outer, Value::Obj(handle));
    emit_bytes(&mut outer, OpCode::Closure as u8, const_idx, end_line);
    for uv in upvalues {
        emit_byte(&mut outer, if uv.is_local { 1 } else { 0 }, end_line);
        emit_byte(&mut outer, uv.index, end_line);
    }
    outer
}

fn fun_declaration<'src>(state: &mut State<'src, '_>, mut compiler: Compiler<'src>) -> Compiler<'src> {
    let global = parse_variable(state, &mut compiler, "Expect function name.");
    mark_initialized(&mut compiler);
    let name = state.previous.lexeme;
    let line = state.previous.line;
    compiler = compile_function_body(state, compiler, FunctionType::Function, name, line);
    define_variable(state, &mut compiler, global, line);
    compiler
}

fn method<'src>(state: &mut State<'src, '_>, mut compiler: Compiler<'src>) -> Compiler<'src> {
    consume(state, TokenKind::Identifier, "Expect method name.");
    let name = state.previous.lexeme;
    let line = state.previous.line;
    let constant = identifier_constant(state, &mut compiler, name);
    let fn_type = if name == "init" { FunctionType::Initializer } else { FunctionType::Method };
    compiler = compile_function_body(state, compiler, fn_type, name, line);
    emit_bytes(&mut compiler, OpCode::Method as u8, constant, line);
    compiler
}

fn class_declaration<'src>(state: &mut State<'src, '_>, mut compiler: Compiler<'src>) -> Compiler<'src> {
    consume(state, TokenKind::Identifier, "Expect class name.");
    let class_name = state.previous;
    let name_constant = identifier_constant(state, &mut compiler, class_name.lexeme);
    declare_variable(state, &mut compiler);
    emit_bytes(&mut compiler, OpCode::Class as u8, name_constant, class_name.line);
    define_variable(state, &mut compiler, name_constant, class_name.line);

    state.class_stack.push(ClassState { has_superclass: false });

    if matches(state, TokenKind::Less) {
        consume(state, TokenKind::Identifier, "Expect superclass name.");
        let superclass_tok = state.previous;
        named_variable(state, &mut compiler, superclass_tok, false);

        if superclass_tok.lexeme == class_name.lexeme {
            error(state, "A class can't inherit from itself.");
        }

        begin_scope(&mut compiler);
        add_local(state, &mut compiler, "super");
        define_variable(state, &mut compiler, 0, superclass_tok.line);

        named_variable(state, &mut compiler, class_name, false);
        emit_op(&mut compiler, OpCode::Inherit, superclass_tok.line);
        state.class_stack.last_mut().unwrap().has_superclass = true;
    }

    named_variable(state, &mut compiler, class_name, false);
    consume(state, TokenKind::LeftBrace, "Expect '{' before class body.");
    while !check(state, TokenKind::RightBrace) && !check(state, TokenKind::Eof) {
        compiler = method(state, compiler);
    }
    consume(state, TokenKind::RightBrace, "Expect '}' after class body.");
    emit_op(&mut compiler, OpCode::Pop, state.previous.line);

    let class_state = state.class_stack.pop().unwrap();
    if class_state.has_superclass {
        end_scope(&mut compiler, state.previous.line);
    }
    compiler
}

fn declaration<'src>(state: &mut State<'src, '_>, compiler: Compiler<'src>) -> Compiler<'src> {
    let compiler = if matches(state, TokenKind::Class) {
        class_declaration(state, compiler)
    } else if matches(state, TokenKind::Fun) {
        fun_declaration(state, compiler)
    } else if matches(state, TokenKind::Var) {
        let mut compiler = compiler;
        var_declaration(state, &mut compiler);
        compiler
    } else {
        statement(state, compiler)
    };
    if state.panic_mode {
        synchronize(state);
    }
    compiler
}

#[cfg(test)]
mod tests {
    use super::*;

    fn try_compile(source: &str) -> Result<Handle, Vec<CompileError>> {
        let mut heap = Heap::new();
        let mut strings = StringInterner::new();
        compile(source, &mut heap, &mut strings)
    }

    #[test]
    fn compiles_simple_arithmetic() {
        assert!(try_compile("print 1 + 2 * 3;").is_ok());
    }

    #[test]
    fn reports_self_referential_initializer() {
        let errors = try_compile("{ var a = a; }").unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("own initializer")));
    }

    #[test]
    fn reports_top_level_return() {
        let errors = try_compile("return 1;").unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("return from top-level")));
    }

    #[test]
    fn reports_self_inheriting_class() {
        let errors = try_compile("class Oops < Oops {}").unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("inherit from itself")));
    }

    #[test]
    fn repeated_identifier_references_reuse_one_constant_slot() {
        // Without deduplication each `x = x;` burns two constant slots for
        // the same name, blowing past the 256-constant limit well before a
        // real program referencing one global 300 times would.
        let mut source = String::from("var x = 0;\n");
        for _ in 0..300 {
            source.push_str("x = x;\n");
        }
        assert!(try_compile(&source).is_ok());
    }

    #[test]
    fn compiles_closures_and_classes() {
        let source = r#"
            class Counter {
                init() { this.n = 0; }
                next() { this.n = this.n + 1; return this.n; }
            }
            var c = Counter();
            print c.next();
        "#;
        assert!(try_compile(source).is_ok());
    }
}
