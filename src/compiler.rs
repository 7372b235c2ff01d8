use std::mem;

use num_traits::FromPrimitive;

use crate::bytecode::{Chunk, Instruction, UpvalueRef};
use crate::common::{Span, Spanned};
use crate::lexer::{Keyword, Lexer, PeekableLexer, Token, TokenKind};
use crate::value::{GcObj, Heap, InternedString, ObjFunction, Value};

pub mod error;

use self::error::{CompileError, CompileErrorKind, StaticError, StaticErrors};

/// A chunk's constant pool is indexed by a single byte.
pub const MAX_CONSTANTS: usize = 256;
const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunKind {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Debug, Clone, PartialEq)]
struct Local {
    ident: Spanned<String>,
    depth: usize,
    /// `false` between declaration and the end of the initializer; reading
    /// the variable in that window is a compile error.
    init: bool,
    captured: bool,
}

/// Per-function compilation state. Nested function declarations push a new
/// unit and restore the enclosing one when the body is done.
struct CompileUnit {
    fun_kind: FunKind,
    arity: usize,
    chunk: Chunk,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: usize,
}

impl CompileUnit {
    fn new(fun_kind: FunKind) -> Self {
        // slot 0 belongs to the callee; inside methods it is addressable as
        // `this`, everywhere else the empty name keeps it unresolvable
        let reserved = match fun_kind {
            FunKind::Method | FunKind::Initializer => "this",
            FunKind::Script | FunKind::Function => "",
        };
        let locals = vec![Local {
            ident: Spanned::new(String::from(reserved), Span::from_len(0, 0, 0)),
            depth: 0,
            init: true,
            captured: false,
        }];

        Self {
            fun_kind,
            arity: 0,
            chunk: Chunk::new(),
            locals,
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassUnit {
    has_superclass: bool,
}

/// Single-pass Pratt compiler: tokens in, bytecode out, no syntax tree in
/// between. Allocates constants (strings, function objects) straight into
/// the VM heap it is handed.
pub struct Compiler<'src, 'h> {
    source: &'src str,
    lexer: PeekableLexer<'src>,
    errors: StaticErrors<'src>,
    heap: &'h mut Heap,

    unit: CompileUnit,
    enclosing: Vec<CompileUnit>,
    classes: Vec<ClassUnit>,
    finish_depth: usize,
    async_depth: usize,
}

impl<'src, 'h> Compiler<'src, 'h> {
    pub fn new(source: &'src str, heap: &'h mut Heap) -> Self {
        Self {
            source,
            lexer: PeekableLexer::new(Lexer::new(source)),
            errors: StaticErrors::new(source),
            heap,
            unit: CompileUnit::new(FunKind::Script),
            enclosing: Vec::new(),
            classes: Vec::new(),
            finish_depth: 0,
            async_depth: 0,
        }
    }

    pub fn compile(mut self) -> Result<GcObj<ObjFunction>, StaticErrors<'src>> {
        loop {
            match self.lexer.peek() {
                Ok(Some(tok)) if **tok == Token::Eof => break,
                // Token::Eof is always produced before the stream ends
                Ok(None) => unreachable!(),
                Ok(Some(_)) => match self.compile_declaration() {
                    Ok(()) => (),
                    Err(err) => self.errors.push(err),
                },
                Err(err) => {
                    self.errors.push(err.into());
                    self.synchronize();
                }
            }
        }

        match self.consume(Token::is_eof, || &[TokenKind::Eof]) {
            Ok(_) => (),
            Err(err) => self.errors.push(err),
        };

        let end = Span::from_len(self.lexer.line(), self.source.len().saturating_sub(1), 0);
        self.emit_return(end);

        if !self.errors.is_empty() {
            return Err(self.errors);
        }

        let unit = self.unit;
        Ok(self.heap.gc.new_object_inner(ObjFunction {
            arity: 0,
            upvalue_count: 0,
            chunk: unit.chunk,
            name: None,
        }))
    }

    fn compile_declaration(&mut self) -> Result<(), StaticError<'src>> {
        let result = match self.lexer.next_if(|tok| {
            matches!(
                tok,
                Token::Keyword(Keyword::Var | Keyword::Fun | Keyword::Class)
            )
        })? {
            Some(tok) if tok.item == Token::Keyword(Keyword::Var) => self.compile_var_decl(tok),
            Some(tok) if tok.item == Token::Keyword(Keyword::Fun) => self.compile_fun_decl(tok),
            Some(tok) if tok.item == Token::Keyword(Keyword::Class) => {
                self.compile_class_decl(tok)
            }
            None => self.compile_stmt(),
            Some(_) => unreachable!(),
        };

        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                self.synchronize();
                Err(err)
            }
        }
    }

    fn compile_var_decl(&mut self, var_kw: Spanned<Token<'src>>) -> Result<(), StaticError<'src>> {
        let ident = self.consume(Token::is_ident, || &[TokenKind::Ident])?;
        let name = ident.item.clone().try_into_ident().unwrap();

        self.declare_variable(ident.map(|tok| tok.lexeme().to_string()))?;
        let global = if self.unit.scope_depth > 0 {
            None
        } else {
            Some(self.ident_constant(name, ident.span.clone())?)
        };

        if self.lexer.next_if(Token::is_eq)?.is_some() {
            self.compile_expr()?;
        } else {
            self.emit(Instruction::Nil, var_kw.span.combine(&ident.span));
        }

        self.consume(Token::is_semicolon, || &[TokenKind::Semicolon])?;

        self.define_variable(global, ident.span);

        Ok(())
    }

    fn compile_fun_decl(&mut self, fun_kw: Spanned<Token<'src>>) -> Result<(), StaticError<'src>> {
        let ident = self.consume(Token::is_ident, || &[TokenKind::Ident])?;
        let name = ident.item.clone().try_into_ident().unwrap();

        self.declare_variable(ident.map(|tok| tok.lexeme().to_string()))?;
        let global = if self.unit.scope_depth > 0 {
            // initialized right away so the function body can recurse
            if let Some(last) = self.unit.locals.last_mut() {
                last.init = true;
            }
            None
        } else {
            Some(self.ident_constant(name, ident.span.clone())?)
        };

        let name = self.heap.intern(name);
        self.compile_function(name, FunKind::Function, fun_kw.span)?;
        self.define_variable(global, ident.span);

        Ok(())
    }

    fn compile_function(
        &mut self,
        name: InternedString,
        fun_kind: FunKind,
        fun_span: Span,
    ) -> Result<(), StaticError<'src>> {
        self.enclosing
            .push(mem::replace(&mut self.unit, CompileUnit::new(fun_kind)));
        // a return inside this body never crosses the enclosing concurrent
        // block, so the depth counters start over
        let saved_depths = (self.finish_depth, self.async_depth);
        self.finish_depth = 0;
        self.async_depth = 0;

        let result = self.compile_function_body();

        (self.finish_depth, self.async_depth) = saved_depths;
        let unit = mem::replace(&mut self.unit, self.enclosing.pop().unwrap());
        result?;

        let upvalues = unit.upvalues;
        let fun = self.heap.gc.new_object_inner(ObjFunction {
            arity: unit.arity,
            upvalue_count: upvalues.len(),
            chunk: unit.chunk,
            name: Some(name),
        });

        let fun_const = self.make_constant(Value::new_object(fun.into()), fun_span.clone())?;
        self.emit(Instruction::Closure { fun_const, upvalues }, fun_span);

        Ok(())
    }

    /// Parameter list and body of the unit that is currently being compiled.
    fn compile_function_body(&mut self) -> Result<(), StaticError<'src>> {
        let lparen = self.consume(Token::is_lparen, || &[TokenKind::LParen])?;

        self.enter_scope();

        if !self.lexer.is_next(Token::is_rparen)? {
            loop {
                // slot 0 is reserved for the callee, so 255 parameters fill
                // the operand byte
                if self.unit.arity == u8::MAX as usize {
                    let kind = CompileErrorKind::TooManyParameters;
                    return Err(CompileError::new(kind, lparen.span).into());
                }
                self.unit.arity += 1;

                let param = self.consume(Token::is_ident, || &[TokenKind::Ident])?;
                self.declare_variable(param.map(|tok| tok.lexeme().to_string()))?;
                if let Some(last) = self.unit.locals.last_mut() {
                    last.init = true;
                }

                if self.lexer.next_if(Token::is_comma)?.is_none() {
                    break;
                }
            }
        }

        self.consume(Token::is_rparen, || &[TokenKind::RParen])?;
        let lbrace = self.consume(Token::is_lbrace, || &[TokenKind::LBrace])?;
        self.compile_block()?;

        // implicit return for bodies that run off the end; unreachable if
        // the body returned explicitly
        self.emit_return(lbrace.span);

        Ok(())
    }

    fn compile_class_decl(
        &mut self,
        _class_kw: Spanned<Token<'src>>,
    ) -> Result<(), StaticError<'src>> {
        let ident = self.consume(Token::is_ident, || &[TokenKind::Ident])?;
        let class_name = ident.item.clone().try_into_ident().unwrap();

        let name_idx = self.ident_constant(class_name, ident.span.clone())?;
        self.declare_variable(ident.map(|tok| tok.lexeme().to_string()))?;
        self.emit(Instruction::Class(name_idx.item), ident.span.clone());
        let global = if self.unit.scope_depth > 0 {
            None
        } else {
            Some(name_idx)
        };
        self.define_variable(global, ident.span.clone());

        self.classes.push(ClassUnit {
            has_superclass: false,
        });
        let result = self.compile_class_body(class_name, ident.span);
        let class = self.classes.pop().expect("pushed above");

        if class.has_superclass {
            self.exit_scope();
        }

        result
    }

    fn compile_class_body(
        &mut self,
        class_name: &'src str,
        name_span: Span,
    ) -> Result<(), StaticError<'src>> {
        if let Some(lt) = self.lexer.next_if(Token::is_lt)? {
            let superclass = self.consume(Token::is_ident, || &[TokenKind::Ident])?;
            let superclass_name = superclass.item.clone().try_into_ident().unwrap();

            if superclass_name == class_name {
                let kind = CompileErrorKind::SelfInheritance {
                    ident: class_name.to_string(),
                };
                return Err(CompileError::new(kind, superclass.span).into());
            }

            self.compile_named_variable(superclass_name, superclass.span.clone(), false)?;

            // the superclass value stays on the stack for the duration of
            // the class body, addressable as the synthetic local `super`
            self.enter_scope();
            self.unit.locals.push(Local {
                ident: Spanned::new(String::from("super"), superclass.span),
                depth: self.unit.scope_depth,
                init: true,
                captured: false,
            });

            self.compile_named_variable(class_name, name_span.clone(), false)?;
            self.emit(Instruction::Inherit, lt.span);
            self.classes
                .last_mut()
                .expect("pushed by compile_class_decl")
                .has_superclass = true;
        }

        // the class itself, for the METHOD instructions to attach to
        self.compile_named_variable(class_name, name_span.clone(), false)?;

        self.consume(Token::is_lbrace, || &[TokenKind::LBrace])?;
        while self
            .lexer
            .is_next(|tok| !matches!(tok, Token::RBrace | Token::Eof))?
        {
            self.compile_method()?;
        }
        let rbrace = self.consume(Token::is_rbrace, || &[TokenKind::RBrace])?;
        self.emit(Instruction::Pop, rbrace.span);

        Ok(())
    }

    fn compile_method(&mut self) -> Result<(), StaticError<'src>> {
        let ident = self.consume(Token::is_ident, || &[TokenKind::Ident])?;
        let method_name = ident.item.clone().try_into_ident().unwrap();

        let name_idx = self.ident_constant(method_name, ident.span.clone())?;
        let fun_kind = if method_name == "init" {
            FunKind::Initializer
        } else {
            FunKind::Method
        };

        let name = self.heap.intern(method_name);
        self.compile_function(name, fun_kind, ident.span.clone())?;
        self.emit(Instruction::Method(name_idx.item), ident.span);

        Ok(())
    }

    fn declare_variable(&mut self, ident: Spanned<String>) -> Result<(), StaticError<'src>> {
        if self.unit.scope_depth == 0 {
            return Ok(());
        }

        if self.unit.locals.len() == MAX_LOCALS {
            let kind = CompileErrorKind::TooManyLocals;
            return Err(CompileError::new(kind, ident.span).into());
        }

        for local in self.unit.locals.iter().rev() {
            if local.depth < self.unit.scope_depth {
                break;
            }
            if local.ident.item == ident.item {
                let kind = CompileErrorKind::DuplicateLocal { ident: ident.item };
                return Err(CompileError::new(kind, ident.span).into());
            }
        }

        self.unit.locals.push(Local {
            depth: self.unit.scope_depth,
            ident,
            init: false,
            captured: false,
        });

        Ok(())
    }

    /// Second half of a declaration: globals emit DEFINE_GLOBAL, locals just
    /// become readable.
    fn define_variable(&mut self, global: Option<Spanned<u8>>, span: Span) {
        match global {
            Some(idx) => self.emit(Instruction::DefineGlobal(idx.item), span),
            None => {
                if let Some(last) = self.unit.locals.last_mut() {
                    last.init = true;
                }
            }
        }
    }

    fn ident_constant(
        &mut self,
        ident: &str,
        span: Span,
    ) -> Result<Spanned<u8>, StaticError<'src>> {
        let name = Value::new_string(self.heap.intern(ident));

        // repeated references to the same name reuse the pool slot
        for (i, constant) in self.unit.chunk.constants.iter().enumerate() {
            if *constant == name {
                return Ok(Spanned::new(i as u8, span));
            }
        }

        let idx = self.make_constant(name, span.clone())?;
        Ok(Spanned::new(idx, span))
    }

    fn make_constant(&mut self, value: Value, span: Span) -> Result<u8, StaticError<'src>> {
        if self.unit.chunk.constants.len() >= MAX_CONSTANTS {
            let kind = CompileErrorKind::TooManyConstants;
            return Err(CompileError::new(kind, span).into());
        }

        Ok(self.unit.chunk.add_constant(value) as u8)
    }

    fn synchronize(&mut self) {
        loop {
            match self.lexer.peek() {
                Ok(Some(tok)) => match tok.item {
                    Token::Semicolon => {
                        // a semicolon ends a statement, the next token starts
                        // a fresh one
                        self.lexer.next().expect("we just checked that it's ok");
                        break;
                    }
                    // Eof stays for the outer loop; the keywords all start a
                    // new statement we can resume at
                    Token::Eof
                    | Token::Keyword(
                        Keyword::Class
                        | Keyword::Fun
                        | Keyword::Var
                        | Keyword::For
                        | Keyword::If
                        | Keyword::While
                        | Keyword::Print
                        | Keyword::Return
                        | Keyword::Finish
                        | Keyword::Async,
                    ) => break,
                    _ => {
                        let _ = self.lexer.next();
                    }
                },
                Ok(None) => unreachable!(
                    "Token::Eof should be returned before end, thus None can never happen here"
                ),
                Err(_) => {
                    // ignore further errors until the synchronization point
                    let _ = self.lexer.next();
                }
            }
        }
    }

    fn compile_stmt(&mut self) -> Result<(), StaticError<'src>> {
        let Some(tok) = self.lexer.next_if(|tok| {
            matches!(
                tok,
                Token::Keyword(
                    Keyword::Print
                        | Keyword::If
                        | Keyword::While
                        | Keyword::For
                        | Keyword::Return
                        | Keyword::Finish
                        | Keyword::Async
                ) | Token::LBrace
            )
        })?
        else {
            return self.compile_expr_stmt();
        };

        match tok.item {
            Token::Keyword(Keyword::Print) => self.compile_print_stmt(tok),
            Token::Keyword(Keyword::If) => self.compile_if_stmt(tok),
            Token::Keyword(Keyword::While) => self.compile_while_stmt(tok),
            Token::Keyword(Keyword::For) => self.compile_for_stmt(tok),
            Token::Keyword(Keyword::Return) => self.compile_return_stmt(tok),
            Token::Keyword(Keyword::Finish) => self.compile_finish_stmt(tok),
            Token::Keyword(Keyword::Async) => self.compile_async_stmt(tok),
            Token::LBrace => self.compile_block_stmt(tok),
            _ => unreachable!(),
        }
    }

    fn compile_return_stmt(
        &mut self,
        return_kw: Spanned<Token<'src>>,
    ) -> Result<(), StaticError<'src>> {
        if self.unit.fun_kind == FunKind::Script {
            let kind = CompileErrorKind::ReturnFromTopLevel;
            return Err(CompileError::new(kind, return_kw.span).into());
        }

        // a return would skip the end of the block the concurrent region is
        // delimited by, leaking its children
        if self.async_depth > 0 || self.finish_depth > 0 {
            let block = if self.async_depth > 0 { "async" } else { "finish" };
            let kind = CompileErrorKind::ReturnFromConcurrentBlock { block };
            return Err(CompileError::new(kind, return_kw.span).into());
        }

        if let Some(semicolon) = self.lexer.next_if(Token::is_semicolon)? {
            self.emit_return(semicolon.span);
        } else {
            if self.unit.fun_kind == FunKind::Initializer {
                let kind = CompileErrorKind::ReturnFromInitializer;
                return Err(CompileError::new(kind, return_kw.span).into());
            }

            self.compile_expr()?;
            self.consume(Token::is_semicolon, || &[TokenKind::Semicolon])?;
            self.emit(Instruction::Return, return_kw.span);
        }

        Ok(())
    }

    /// Emits the implicit function result: `this` for initializers, `nil`
    /// for everything else.
    fn emit_return(&mut self, span: Span) {
        if self.unit.fun_kind == FunKind::Initializer {
            self.emit(Instruction::GetLocal(0), span.clone());
        } else {
            self.emit(Instruction::Nil, span.clone());
        }
        self.emit(Instruction::Return, span);
    }

    fn compile_finish_stmt(
        &mut self,
        finish_kw: Spanned<Token<'src>>,
    ) -> Result<(), StaticError<'src>> {
        self.emit(Instruction::FinishBegin, finish_kw.span.clone());

        self.consume(Token::is_lbrace, || &[TokenKind::LBrace])?;
        self.enter_scope();
        self.finish_depth += 1;
        let result = self.compile_block();
        self.finish_depth -= 1;
        self.exit_scope();
        result?;

        self.emit(Instruction::FinishEnd, finish_kw.span);
        Ok(())
    }

    fn compile_async_stmt(
        &mut self,
        async_kw: Spanned<Token<'src>>,
    ) -> Result<(), StaticError<'src>> {
        // the parent skips the block; only the spawned sibling runs it
        let skip = self.emit_jump(Instruction::AsyncBegin(u16::MAX), async_kw.span.clone());

        self.consume(Token::is_lbrace, || &[TokenKind::LBrace])?;
        self.enter_scope();
        self.async_depth += 1;
        let result = self.compile_block();
        self.async_depth -= 1;
        self.exit_scope();
        result?;

        self.emit(Instruction::AsyncEnd, async_kw.span.clone());
        self.patch_jump(skip, async_kw.span)?;
        Ok(())
    }

    fn compile_for_stmt(&mut self, for_kw: Spanned<Token<'src>>) -> Result<(), StaticError<'src>> {
        self.enter_scope();
        self.consume(Token::is_lparen, || &[TokenKind::LParen])?;
        match self.lexer.peek()? {
            Some(tok) if tok.item == Token::Semicolon => {
                self.consume(Token::is_semicolon, || &[TokenKind::Semicolon])?;
            }
            Some(tok) if tok.item == Token::Keyword(Keyword::Var) => {
                let tok = self
                    .lexer
                    .next()
                    .expect("we just checked that it's ok")
                    .expect("we just checked that it's some");
                self.compile_var_decl(tok)?;
            }
            Some(_) => self.compile_expr_stmt()?,
            None => unreachable!(),
        }

        let mut loop_start = self.unit.chunk.code.len();
        let mut exit_jump = None;
        if !self.lexer.is_next(Token::is_semicolon)? {
            self.compile_expr()?;
            let semicolon = self.consume(Token::is_semicolon, || &[TokenKind::Semicolon])?;

            exit_jump =
                Some(self.emit_jump(Instruction::JumpIfFalse(u16::MAX), semicolon.span.clone()));
            self.emit(Instruction::Pop, semicolon.span);
        } else {
            self.consume(Token::is_semicolon, || &[TokenKind::Semicolon])?;
        }

        if !self.lexer.is_next(Token::is_rparen)? {
            let body_jump = self.emit_jump(Instruction::Jump(u16::MAX), for_kw.span.clone());
            let increment_start = self.unit.chunk.code.len();
            self.compile_expr()?;
            self.emit(Instruction::Pop, for_kw.span.clone());
            self.consume(Token::is_rparen, || &[TokenKind::RParen])?;

            self.emit_loop(loop_start, for_kw.span.clone())?;
            loop_start = increment_start;
            self.patch_jump(body_jump, for_kw.span.clone())?;
        } else {
            self.consume(Token::is_rparen, || &[TokenKind::RParen])?;
        }

        self.compile_stmt()?;
        self.emit_loop(loop_start, for_kw.span.clone())?;

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump, for_kw.span.clone())?;
            self.emit(Instruction::Pop, for_kw.span);
        }

        self.exit_scope();

        Ok(())
    }

    fn compile_while_stmt(
        &mut self,
        while_kw: Spanned<Token<'src>>,
    ) -> Result<(), StaticError<'src>> {
        let loop_start = self.unit.chunk.code.len();
        self.consume(Token::is_lparen, || &[TokenKind::LParen])?;
        self.compile_expr()?;
        self.consume(Token::is_rparen, || &[TokenKind::RParen])?;

        let exit_jump = self.emit_jump(Instruction::JumpIfFalse(u16::MAX), while_kw.span.clone());
        self.emit(Instruction::Pop, while_kw.span.clone());
        self.compile_stmt()?;
        self.emit_loop(loop_start, while_kw.span.clone())?;

        self.patch_jump(exit_jump, while_kw.span.clone())?;
        self.emit(Instruction::Pop, while_kw.span);

        Ok(())
    }

    fn compile_if_stmt(&mut self, if_kw: Spanned<Token<'src>>) -> Result<(), StaticError<'src>> {
        self.consume(Token::is_lparen, || &[TokenKind::LParen])?;
        self.compile_expr()?;
        self.consume(Token::is_rparen, || &[TokenKind::RParen])?;

        let then_jump = self.emit_jump(Instruction::JumpIfFalse(u16::MAX), if_kw.span.clone());
        self.emit(Instruction::Pop, if_kw.span.clone());
        self.compile_stmt()?;

        let else_jump = self.emit_jump(Instruction::Jump(u16::MAX), if_kw.span.clone());

        self.patch_jump(then_jump, if_kw.span.clone())?;
        self.emit(Instruction::Pop, if_kw.span.clone());

        if self.lexer.next_if(Token::is_else)?.is_some() {
            self.compile_stmt()?;
        }
        self.patch_jump(else_jump, if_kw.span)?;

        Ok(())
    }

    fn emit_jump(&mut self, instruction: Instruction, span: Span) -> usize {
        let operand_start = self.unit.chunk.code.len() + 1;
        self.emit(instruction, span);

        operand_start
    }

    fn patch_jump(&mut self, offset: usize, span: Span) -> Result<(), StaticError<'src>> {
        let jump =
            self.unit.chunk.code.len() - offset - (Instruction::JumpIfFalse(0).byte_len() - 1);

        if jump > u16::MAX as usize {
            let kind = CompileErrorKind::JumpTooLarge;
            return Err(CompileError::new(kind, span).into());
        }

        let dst = &mut self.unit.chunk.code[offset..offset + 2];
        debug_assert!(dst[0] == 0xff && dst[1] == 0xff);
        dst.copy_from_slice(&(jump as u16).to_le_bytes());

        Ok(())
    }

    fn emit_loop(&mut self, loop_start: usize, span: Span) -> Result<(), StaticError<'src>> {
        let offset = self.unit.chunk.code.len() - loop_start + 3;
        if offset > u16::MAX as usize {
            let kind = CompileErrorKind::JumpTooLarge;
            return Err(CompileError::new(kind, span).into());
        }

        self.emit(Instruction::Loop(offset as u16), span);
        Ok(())
    }

    fn compile_block_stmt(
        &mut self,
        _lbrace: Spanned<Token<'src>>,
    ) -> Result<(), StaticError<'src>> {
        self.enter_scope();
        let result = self.compile_block();
        self.exit_scope();
        result
    }

    fn compile_block(&mut self) -> Result<(), StaticError<'src>> {
        while self
            .lexer
            .is_next(|tok| !matches!(tok, Token::RBrace | Token::Eof))?
        {
            self.compile_declaration()?;
        }

        self.consume(Token::is_rbrace, || &[TokenKind::RBrace])?;
        Ok(())
    }

    fn enter_scope(&mut self) {
        self.unit.scope_depth += 1;
    }

    fn exit_scope(&mut self) {
        while self.unit.locals.last().map(|l| l.depth) == Some(self.unit.scope_depth) {
            let local = self.unit.locals.pop().expect("just checked");
            if local.captured {
                self.emit(Instruction::CloseUpvalue, Span::new(0, 0, 0));
            } else {
                self.emit(Instruction::Pop, Span::new(0, 0, 0));
            }
        }

        self.unit.scope_depth -= 1;
    }

    fn compile_expr_stmt(&mut self) -> Result<(), StaticError<'src>> {
        self.compile_expr()?;
        let semicolon = self.consume(Token::is_semicolon, || &[TokenKind::Semicolon])?;
        self.emit(Instruction::Pop, semicolon.span);
        Ok(())
    }

    fn compile_print_stmt(&mut self, print: Spanned<Token<'src>>) -> Result<(), StaticError<'src>> {
        self.compile_expr()?;
        self.consume(Token::is_semicolon, || &[TokenKind::Semicolon])?;

        self.emit(Instruction::Print, print.span);
        Ok(())
    }

    fn emit(&mut self, instruction: Instruction, span: Span) {
        self.unit.chunk.push(instruction, span);
    }

    fn consume(
        &mut self,
        predicate: impl Fn(&Token<'src>) -> bool,
        expected_tokens: impl Fn() -> &'static [TokenKind],
    ) -> Result<Spanned<Token<'src>>, StaticError<'src>> {
        match self.lexer.next()? {
            Some(token) if predicate(&token) => Ok(token),

            Some(token) => {
                let kind = CompileErrorKind::UnexpectedToken {
                    expected: expected_tokens(),
                    found: token.item.as_kind(),
                };
                let err = CompileError::new(kind, token.span);

                Err(err.into())
            }
            None => {
                let kind = CompileErrorKind::UnexpectedToken {
                    expected: expected_tokens(),
                    found: TokenKind::Eof,
                };
                let err = CompileError::new(
                    kind,
                    Span::from_len(self.lexer.line(), self.source.len().saturating_sub(1), 0),
                );

                Err(err.into())
            }
        }
    }

    pub fn compile_expr(&mut self) -> Result<(), StaticError<'src>> {
        self.compile_precedence(Precedence::Assignment)
    }

    fn compile_constant(&mut self, value: Value, span: Span) -> Result<(), StaticError<'src>> {
        let idx = self.make_constant(value, span.clone())?;
        self.emit(Instruction::Constant(idx), span);
        Ok(())
    }

    fn compile_grouping(&mut self) -> Result<(), StaticError<'src>> {
        self.compile_expr()?;
        self.consume(Token::is_rparen, || &[TokenKind::RParen])?;
        Ok(())
    }

    fn compile_unary(&mut self, operator: Spanned<Token<'src>>) -> Result<(), StaticError<'src>> {
        self.compile_precedence(Precedence::Unary)?; // operand

        match operator.item {
            Token::Minus => self.emit(Instruction::Negate, operator.span),
            Token::Bang => self.emit(Instruction::Not, operator.span),
            _ => unreachable!("Invalid unary operator."),
        }

        Ok(())
    }

    fn compile_binary(&mut self, operator: Spanned<Token<'src>>) -> Result<(), StaticError<'src>> {
        let precedence = Precedence::from_token(&operator);

        self.compile_precedence(precedence.next().unwrap())?;

        match operator.item {
            Token::Plus => self.emit(Instruction::Add, operator.span),
            Token::Minus => self.emit(Instruction::Subtract, operator.span),
            Token::Star => self.emit(Instruction::Multiply, operator.span),
            Token::Slash => self.emit(Instruction::Divide, operator.span),
            Token::Percent => self.emit(Instruction::Modulo, operator.span),
            Token::EqEq => self.emit(Instruction::Equal, operator.span),
            Token::BangEq => {
                self.emit(Instruction::Equal, operator.span.clone());
                self.emit(Instruction::Not, operator.span);
            }
            Token::Lt => self.emit(Instruction::Less, operator.span),
            Token::LtEq => {
                self.emit(Instruction::Greater, operator.span.clone());
                self.emit(Instruction::Not, operator.span);
            }
            Token::Gt => self.emit(Instruction::Greater, operator.span),
            Token::GtEq => {
                self.emit(Instruction::Less, operator.span.clone());
                self.emit(Instruction::Not, operator.span);
            }
            _ => unreachable!("Invalid binary operator."),
        }

        Ok(())
    }

    fn compile_precedence(&mut self, precedence: Precedence) -> Result<(), StaticError<'src>> {
        let token = self.consume(Self::has_prefix_rule, Self::prefix_tokens)?;

        let can_assign = precedence <= Precedence::Assignment;
        self.compile_prefix(token, can_assign)?;

        while let Some(infix) = self
            .lexer
            .next_if(|tok| precedence <= Precedence::from_token(tok))?
        {
            self.compile_infix(infix, can_assign)?;
        }

        if can_assign {
            if let Some(tok) = self.lexer.next_if(Token::is_eq)? {
                let kind = CompileErrorKind::InvalidAssignmentTarget;
                let err = CompileError::new(kind, tok.span);
                return Err(err.into());
            }
        }

        Ok(())
    }

    fn compile_prefix(
        &mut self,
        prefix: Spanned<Token<'src>>,
        can_assign: bool,
    ) -> Result<(), StaticError<'src>> {
        match prefix.item {
            Token::Number { value, .. } => {
                self.compile_constant(Value::new_number(value), prefix.span)
            }
            Token::String { value, .. } => {
                let s = Value::new_string(self.heap.intern(value));
                self.compile_constant(s, prefix.span)
            }
            Token::LParen => self.compile_grouping(),
            Token::LBracket => self.compile_list(prefix),
            Token::Minus | Token::Bang => self.compile_unary(prefix),
            Token::Keyword(Keyword::Nil) => {
                self.emit(Instruction::Nil, prefix.span);
                Ok(())
            }
            Token::Keyword(Keyword::True) => {
                self.emit(Instruction::True, prefix.span);
                Ok(())
            }
            Token::Keyword(Keyword::False) => {
                self.emit(Instruction::False, prefix.span);
                Ok(())
            }
            Token::Ident(ident) => self.compile_named_variable(ident, prefix.span, can_assign),
            Token::Keyword(Keyword::This) => self.compile_this(prefix),
            Token::Keyword(Keyword::Super) => self.compile_super(prefix),
            Token::Keyword(
                kw @ (Keyword::Future | Keyword::Lambda | Keyword::Reduce | Keyword::Await),
            ) => {
                // recognized but deliberately unimplemented; their semantics
                // are not pinned down yet
                let kind = CompileErrorKind::UnsupportedExpression {
                    keyword: kw.lexeme(),
                };
                Err(CompileError::new(kind, prefix.span).into())
            }
            _ => unreachable!("Invalid prefix operator."),
        }
    }

    fn compile_this(&mut self, this_kw: Spanned<Token<'src>>) -> Result<(), StaticError<'src>> {
        if self.classes.is_empty() {
            let kind = CompileErrorKind::ThisOutsideClass;
            return Err(CompileError::new(kind, this_kw.span).into());
        }

        self.compile_named_variable("this", this_kw.span, false)
    }

    fn compile_super(&mut self, super_kw: Spanned<Token<'src>>) -> Result<(), StaticError<'src>> {
        match self.classes.last() {
            None => {
                let kind = CompileErrorKind::SuperOutsideClass;
                return Err(CompileError::new(kind, super_kw.span).into());
            }
            Some(class) if !class.has_superclass => {
                let kind = CompileErrorKind::SuperWithoutSuperclass;
                return Err(CompileError::new(kind, super_kw.span).into());
            }
            Some(_) => {}
        }

        self.consume(Token::is_dot, || &[TokenKind::Dot])?;
        let method = self.consume(Token::is_ident, || &[TokenKind::Ident])?;
        let method_name = method.item.clone().try_into_ident().unwrap();
        let name_idx = self.ident_constant(method_name, method.span.clone())?;

        self.compile_named_variable("this", super_kw.span.clone(), false)?;

        if self.lexer.is_next(Token::is_lparen)? {
            let lparen = self.lexer.next()?.expect("just peeked");
            let arg_count = self.compile_arg_list(&lparen.span)?;
            self.compile_named_variable("super", super_kw.span, false)?;
            self.emit(Instruction::SuperInvoke(name_idx.item, arg_count), lparen.span);
        } else {
            self.compile_named_variable("super", super_kw.span, false)?;
            self.emit(Instruction::GetSuper(name_idx.item), method.span);
        }

        Ok(())
    }

    fn compile_list(&mut self, lbracket: Spanned<Token<'src>>) -> Result<(), StaticError<'src>> {
        let mut count: usize = 0;
        if !self.lexer.is_next(Token::is_rbracket)? {
            loop {
                if count == u8::MAX as usize {
                    let kind = CompileErrorKind::ListTooLong;
                    return Err(CompileError::new(kind, lbracket.span).into());
                }

                self.compile_expr()?;
                count += 1;

                if self.lexer.next_if(Token::is_comma)?.is_none() {
                    break;
                }
            }
        }

        self.consume(Token::is_rbracket, || &[TokenKind::RBracket])?;
        self.emit(Instruction::BuildList(count as u8), lbracket.span);

        Ok(())
    }

    fn compile_named_variable(
        &mut self,
        ident: &str,
        span: Span,
        can_assign: bool,
    ) -> Result<(), StaticError<'src>> {
        let current = self.enclosing.len();
        let (get, set) = if let Some(slot) = self.resolve_local_at(current, ident, &span)? {
            (Instruction::GetLocal(slot), Instruction::SetLocal(slot))
        } else if let Some(slot) = self.resolve_upvalue(current, ident, &span)? {
            (Instruction::GetUpvalue(slot), Instruction::SetUpvalue(slot))
        } else {
            let idx = self.ident_constant(ident, span.clone())?;
            (
                Instruction::GetGlobal(idx.item),
                Instruction::SetGlobal(idx.item),
            )
        };

        if can_assign {
            if self.lexer.next_if(Token::is_eq)?.is_some() {
                self.compile_expr()?;
                self.emit(set, span);

                return Ok(());
            }
        }

        self.emit(get, span);

        Ok(())
    }

    fn unit_at(&self, index: usize) -> &CompileUnit {
        if index == self.enclosing.len() {
            &self.unit
        } else {
            &self.enclosing[index]
        }
    }

    fn unit_at_mut(&mut self, index: usize) -> &mut CompileUnit {
        if index == self.enclosing.len() {
            &mut self.unit
        } else {
            &mut self.enclosing[index]
        }
    }

    fn resolve_local_at(
        &self,
        unit_index: usize,
        ident: &str,
        span: &Span,
    ) -> Result<Option<u8>, StaticError<'src>> {
        for (i, local) in self.unit_at(unit_index).locals.iter().enumerate().rev() {
            if local.ident.item == ident {
                if !local.init {
                    let kind = CompileErrorKind::UseOfLocalInItsOwnInitializer;
                    let err = CompileError::new(kind, span.clone());
                    return Err(err.into());
                }
                debug_assert!(i < MAX_LOCALS);
                return Ok(Some(i as u8));
            }
        }

        Ok(None)
    }

    /// Resolves `ident` in an enclosing function, threading an upvalue entry
    /// through every level between the declaring frame and `unit_index`.
    fn resolve_upvalue(
        &mut self,
        unit_index: usize,
        ident: &str,
        span: &Span,
    ) -> Result<Option<u8>, StaticError<'src>> {
        if unit_index == 0 {
            return Ok(None);
        }
        let enclosing = unit_index - 1;

        if let Some(local) = self.resolve_local_at(enclosing, ident, span)? {
            self.unit_at_mut(enclosing).locals[local as usize].captured = true;
            let upvalue = UpvalueRef {
                is_local: true,
                index: local,
            };
            return self.add_upvalue(unit_index, upvalue, span).map(Some);
        }

        if let Some(upvalue) = self.resolve_upvalue(enclosing, ident, span)? {
            let upvalue = UpvalueRef {
                is_local: false,
                index: upvalue,
            };
            return self.add_upvalue(unit_index, upvalue, span).map(Some);
        }

        Ok(None)
    }

    fn add_upvalue(
        &mut self,
        unit_index: usize,
        upvalue: UpvalueRef,
        span: &Span,
    ) -> Result<u8, StaticError<'src>> {
        let unit = self.unit_at_mut(unit_index);

        for (i, existing) in unit.upvalues.iter().enumerate() {
            if *existing == upvalue {
                return Ok(i as u8);
            }
        }

        if unit.upvalues.len() == MAX_UPVALUES {
            let kind = CompileErrorKind::TooManyUpvalues;
            return Err(CompileError::new(kind, span.clone()).into());
        }

        unit.upvalues.push(upvalue);
        Ok((unit.upvalues.len() - 1) as u8)
    }

    fn has_prefix_rule(token: &Token<'_>) -> bool {
        matches!(
            token,
            Token::Number { .. }
                | Token::String { .. }
                | Token::LParen
                | Token::LBracket
                | Token::Minus
                | Token::Bang
                | Token::Ident(_)
                | Token::Keyword(
                    Keyword::Nil
                        | Keyword::True
                        | Keyword::False
                        | Keyword::This
                        | Keyword::Super
                        | Keyword::Future
                        | Keyword::Lambda
                        | Keyword::Reduce
                        | Keyword::Await
                )
        )
    }

    const fn prefix_tokens() -> &'static [TokenKind] {
        &[
            TokenKind::Number,
            TokenKind::String,
            TokenKind::LParen,
            TokenKind::LBracket,
            TokenKind::Minus,
            TokenKind::Bang,
            TokenKind::Ident,
            TokenKind::Keyword(Keyword::Nil),
            TokenKind::Keyword(Keyword::True),
            TokenKind::Keyword(Keyword::False),
            TokenKind::Keyword(Keyword::This),
            TokenKind::Keyword(Keyword::Super),
        ]
    }

    fn compile_infix(
        &mut self,
        infix: Spanned<Token<'src>>,
        can_assign: bool,
    ) -> Result<(), StaticError<'src>> {
        match infix.item {
            Token::Plus
            | Token::Minus
            | Token::Star
            | Token::Slash
            | Token::Percent
            | Token::EqEq
            | Token::BangEq
            | Token::Gt
            | Token::GtEq
            | Token::Lt
            | Token::LtEq => self.compile_binary(infix),
            Token::Keyword(Keyword::And) => self.compile_and(infix),
            Token::Keyword(Keyword::Or) => self.compile_or(infix),
            Token::LParen => self.compile_call(infix),
            Token::Dot => self.compile_dot(infix, can_assign),
            Token::LBracket => self.compile_subscript(infix, can_assign),
            _ => unreachable!("Invalid infix operator."),
        }
    }

    fn compile_call(&mut self, lparen: Spanned<Token<'src>>) -> Result<(), StaticError<'src>> {
        let arg_count = self.compile_arg_list(&lparen.span)?;
        self.emit(Instruction::Call(arg_count), lparen.span);
        Ok(())
    }

    fn compile_dot(
        &mut self,
        dot: Spanned<Token<'src>>,
        can_assign: bool,
    ) -> Result<(), StaticError<'src>> {
        let ident = self.consume(Token::is_ident, || &[TokenKind::Ident])?;
        let name = ident.item.clone().try_into_ident().unwrap();
        let name_idx = self.ident_constant(name, ident.span.clone())?;
        let _ = dot;

        if can_assign && self.lexer.next_if(Token::is_eq)?.is_some() {
            self.compile_expr()?;
            self.emit(Instruction::SetProperty(name_idx.item), ident.span);
        } else if self.lexer.is_next(Token::is_lparen)? {
            // property access followed by a call fuses into INVOKE
            let lparen = self.lexer.next()?.expect("just peeked");
            let arg_count = self.compile_arg_list(&lparen.span)?;
            self.emit(Instruction::Invoke(name_idx.item, arg_count), lparen.span);
        } else {
            self.emit(Instruction::GetProperty(name_idx.item), ident.span);
        }

        Ok(())
    }

    fn compile_subscript(
        &mut self,
        lbracket: Spanned<Token<'src>>,
        can_assign: bool,
    ) -> Result<(), StaticError<'src>> {
        self.compile_expr()?;
        self.consume(Token::is_rbracket, || &[TokenKind::RBracket])?;

        if can_assign && self.lexer.next_if(Token::is_eq)?.is_some() {
            self.compile_expr()?;
            self.emit(Instruction::IndexSet, lbracket.span);
        } else {
            self.emit(Instruction::IndexGet, lbracket.span);
        }

        Ok(())
    }

    fn compile_arg_list(&mut self, call_span: &Span) -> Result<u8, StaticError<'src>> {
        let mut arg_count = 0;
        if !self.lexer.is_next(Token::is_rparen)? {
            loop {
                if arg_count == u8::MAX {
                    let kind = CompileErrorKind::TooManyArguments;
                    return Err(CompileError::new(kind, call_span.clone()).into());
                }
                self.compile_expr()?;
                arg_count += 1;
                if self.lexer.next_if(Token::is_comma)?.is_none() {
                    break;
                }
            }
        }

        self.consume(Token::is_rparen, || &[TokenKind::RParen])?;
        Ok(arg_count)
    }

    fn compile_and(&mut self, and: Spanned<Token<'src>>) -> Result<(), StaticError<'src>> {
        let end_jump = self.emit_jump(Instruction::JumpIfFalse(u16::MAX), and.span.clone());
        self.emit(Instruction::Pop, and.span.clone());
        self.compile_precedence(Precedence::And)?;
        self.patch_jump(end_jump, and.span)?;

        Ok(())
    }

    fn compile_or(&mut self, or: Spanned<Token<'src>>) -> Result<(), StaticError<'src>> {
        let else_jump = self.emit_jump(Instruction::JumpIfFalse(u16::MAX), or.span.clone());
        let end_jump = self.emit_jump(Instruction::Jump(u16::MAX), or.span.clone());
        self.patch_jump(else_jump, or.span.clone())?;
        self.emit(Instruction::Pop, or.span.clone());
        self.compile_precedence(Precedence::Or)?;
        self.patch_jump(end_jump, or.span)?;

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, num_derive::FromPrimitive, PartialEq, PartialOrd, Eq, Ord)]
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
    Subscript,
    Primary,
}

impl Precedence {
    fn next(self) -> Option<Self> {
        Self::from_u8(self as u8 + 1)
    }

    fn from_token(token: &Token<'_>) -> Self {
        match token {
            Token::Plus | Token::Minus => Self::Term,
            Token::Star | Token::Slash | Token::Percent => Self::Factor,
            Token::BangEq | Token::EqEq => Precedence::Equality,
            Token::Lt | Token::LtEq | Token::Gt | Token::GtEq => Precedence::Comparison,
            Token::Keyword(Keyword::And) => Precedence::And,
            Token::Keyword(Keyword::Or) => Precedence::Or,
            Token::LParen | Token::Dot => Precedence::Call,
            Token::LBracket => Precedence::Subscript,

            _ => Self::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::ByteCursor;

    fn compile(source: &str) -> Result<GcObj<ObjFunction>, usize> {
        // the heap leaks in these tests, which is fine for their size
        let heap = Box::leak(Box::new(Heap::new()));
        Compiler::new(source, heap)
            .compile()
            .map_err(|errors| errors.len())
    }

    fn instructions(fun: GcObj<ObjFunction>) -> Vec<Instruction> {
        let mut cursor = ByteCursor::new(&fun.chunk.code);
        let mut out = Vec::new();
        while !cursor.is_empty() {
            out.push(Instruction::from_bytes(&mut cursor, &fun.chunk.constants).unwrap());
        }
        out
    }

    #[test]
    fn arithmetic_precedence() {
        let fun = compile("print 1 + 2 * 3;").unwrap();
        assert_eq!(
            instructions(fun),
            vec![
                Instruction::Constant(0),
                Instruction::Constant(1),
                Instruction::Constant(2),
                Instruction::Multiply,
                Instruction::Add,
                Instruction::Print,
                Instruction::Nil,
                Instruction::Return,
            ]
        );
    }

    #[test]
    fn subscript_binds_tighter_than_unary() {
        let fun = compile("var xs = [1]; print -xs[0];").unwrap();
        let ops = instructions(fun);
        // NEGATE must come after the subscript read
        let negate = ops.iter().position(|op| *op == Instruction::Negate);
        let index = ops.iter().position(|op| *op == Instruction::IndexGet);
        assert!(index.unwrap() < negate.unwrap());
    }

    #[test]
    fn local_scopes_pop() {
        let fun = compile("{ var a = 1; }").unwrap();
        assert_eq!(
            instructions(fun),
            vec![
                Instruction::Constant(0),
                Instruction::Pop,
                Instruction::Nil,
                Instruction::Return,
            ]
        );
    }

    #[test]
    fn captured_local_closes_its_slot() {
        let fun = compile("{ var a = 1; fun f() { a = 2; } }").unwrap();
        let ops = instructions(fun);
        assert!(ops.contains(&Instruction::CloseUpvalue));
        assert!(ops.iter().any(|op| matches!(
            op,
            Instruction::Closure { upvalues, .. }
                if upvalues == &[UpvalueRef { is_local: true, index: 1 }]
        )));
    }

    #[test]
    fn async_block_is_skipped_by_parent() {
        let fun = compile("finish { async { print 1; } }").unwrap();
        let ops = instructions(fun);
        assert_eq!(ops[0], Instruction::FinishBegin);

        let Instruction::AsyncBegin(offset) = ops[1] else {
            panic!("expected ASYNC_BEGIN, got {:?}", ops[1]);
        };
        // the skip must land exactly past ASYNC_END: re-walk the bytes
        let mut skipped = 0;
        let mut landed_past_async_end = false;
        for op in &ops[2..] {
            skipped += op.byte_len();
            if skipped == offset as usize {
                landed_past_async_end = *op == Instruction::AsyncEnd;
                break;
            }
        }
        assert!(landed_past_async_end);
        assert!(ops.contains(&Instruction::FinishEnd));
    }

    #[test]
    fn initializer_returns_this() {
        let fun = compile("class C { init() { } }").unwrap();
        let class_const = fun
            .chunk
            .constants
            .iter()
            .find_map(|c| c.try_as_function())
            .expect("init function constant");
        let ops = instructions(class_const);
        assert_eq!(
            ops.last_chunk::<2>().unwrap(),
            &[Instruction::GetLocal(0), Instruction::Return]
        );
    }

    #[test]
    fn rejects_return_at_top_level() {
        assert!(compile("return 1;").is_err());
    }

    #[test]
    fn rejects_return_inside_async() {
        assert!(compile("fun f() { async { return; } }").is_err());
        assert!(compile("fun f() { finish { return; } }").is_err());
        // but plain returns still work
        assert!(compile("fun f() { return 1; }").is_ok());
        // and a function declared inside the block returns from itself, not
        // through the block
        assert!(compile("finish { fun h() { return 1; } print h(); }").is_ok());
    }

    #[test]
    fn rejects_invalid_assignment_target() {
        assert!(compile("1 + 2 = 3;").is_err());
    }

    #[test]
    fn rejects_self_inheritance() {
        assert!(compile("class A < A { }").is_err());
    }

    #[test]
    fn rejects_this_and_super_outside_class() {
        assert!(compile("print this;").is_err());
        assert!(compile("print super.x;").is_err());
        assert!(compile("class A { } class B < A { m() { super.m(); } }").is_ok());
        assert!(compile("class A { m() { super.m(); } }").is_err());
    }

    #[test]
    fn rejects_unfinished_future_syntax() {
        assert!(compile("var x = future;").is_err());
        assert!(compile("var x = lambda;").is_err());
        assert!(compile("var x = reduce;").is_err());
    }

    #[test]
    fn rejects_uninitialized_local_read() {
        assert!(compile("{ var a = a; }").is_err());
        assert!(compile("{ var a = 1; { var a = a; } }").is_err());
    }

    #[test]
    fn rejects_duplicate_local() {
        assert!(compile("{ var a = 1; var a = 2; }").is_err());
        // shadowing in a nested scope is fine
        assert!(compile("{ var a = 1; { var a = 2; } }").is_ok());
    }

    #[test]
    fn constant_pool_overflows_at_257th_constant() {
        let mut source = String::new();
        for i in 0..256 {
            source.push_str(&format!("print {};", i));
        }
        assert!(compile(&source).is_ok());

        let mut source = String::new();
        for i in 0..257 {
            source.push_str(&format!("print {};", i));
        }
        assert!(compile(&source).is_err());
    }

    #[test]
    fn empty_for_clauses_compile() {
        assert!(compile("for (;;) {}").is_ok());
    }
}
