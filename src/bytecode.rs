use std::borrow::Cow;
use std::fmt;

use hashbrown::HashMap;

use crate::common::Span;
use crate::disassembler::DisassemblerError;
use crate::value::Value;

/// A compiled function body: raw bytecode, its constant pool and a map from
/// instruction start offsets to source spans.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub constants: Vec<Value>,
    pub spans: HashMap<usize, Span>,
}

impl Chunk {
    pub fn new() -> Self {
        Self {
            code: Vec::with_capacity(8),
            constants: Vec::new(),
            spans: HashMap::new(),
        }
    }

    pub fn push(&mut self, instruction: Instruction, span: Span) {
        self.spans.insert(self.code.len(), span);
        instruction.write_bytes(&mut self.code);
    }

    /// Appends a raw operand byte to the previously pushed instruction.
    pub fn push_byte(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    /// Span of the instruction starting exactly at `offset`.
    pub fn span_at(&self, offset: usize) -> Option<&Span> {
        self.spans.get(&offset)
    }

    /// Span of the instruction covering `ip`, i.e. the one with the greatest
    /// start offset not past it. Used for stack traces where only a resume
    /// address is known.
    pub fn span_for_ip(&self, ip: usize) -> Option<&Span> {
        self.spans
            .iter()
            .filter(|(offset, _)| **offset <= ip)
            .max_by_key(|(offset, _)| **offset)
            .map(|(_, span)| span)
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self::new()
    }
}

impl AsRef<[u8]> for Chunk {
    fn as_ref(&self) -> &[u8] {
        &self.code
    }
}

/// Forward-only reader over a byte slice.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    offset: usize,
    code: &'a [u8],
}

impl<'a> ByteCursor<'a> {
    pub fn new(code: &'a [u8]) -> Self {
        ByteCursor { offset: 0, code }
    }

    pub fn u8(&mut self) -> Option<u8> {
        let result = self.code.get(self.offset).copied();
        self.offset += 1;
        result
    }

    pub fn u16(&mut self) -> Option<u16> {
        const LEN: usize = std::mem::size_of::<u16>();
        let result = self
            .code
            .get(self.offset..)?
            .first_chunk::<LEN>()
            .copied()?;
        self.offset += LEN;
        Some(u16::from_le_bytes(result))
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.offset >= self.code.len()
    }
}

const OP_RETURN: u8 = 0;
const OP_CONSTANT: u8 = 1;
const OP_NIL: u8 = 2;
const OP_TRUE: u8 = 3;
const OP_FALSE: u8 = 4;
const OP_POP: u8 = 5;
const OP_GET_LOCAL: u8 = 6;
const OP_SET_LOCAL: u8 = 7;
const OP_GET_GLOBAL: u8 = 8;
const OP_DEFINE_GLOBAL: u8 = 9;
const OP_SET_GLOBAL: u8 = 10;
const OP_GET_UPVALUE: u8 = 11;
const OP_SET_UPVALUE: u8 = 12;
const OP_GET_PROPERTY: u8 = 13;
const OP_SET_PROPERTY: u8 = 14;
const OP_GET_SUPER: u8 = 15;
const OP_EQUAL: u8 = 16;
const OP_GREATER: u8 = 17;
const OP_LESS: u8 = 18;
const OP_ADD: u8 = 19;
const OP_SUBTRACT: u8 = 20;
const OP_MULTIPLY: u8 = 21;
const OP_DIVIDE: u8 = 22;
const OP_MODULO: u8 = 23;
const OP_NOT: u8 = 24;
const OP_NEGATE: u8 = 25;
const OP_PRINT: u8 = 26;
const OP_JUMP: u8 = 27;
const OP_JUMP_IF_FALSE: u8 = 28;
const OP_LOOP: u8 = 29;
const OP_CALL: u8 = 30;
const OP_INVOKE: u8 = 31;
const OP_SUPER_INVOKE: u8 = 32;
const OP_CLOSURE: u8 = 33;
const OP_CLOSE_UPVALUE: u8 = 34;
const OP_CLASS: u8 = 35;
const OP_INHERIT: u8 = 36;
const OP_METHOD: u8 = 37;
const OP_BUILD_LIST: u8 = 38;
const OP_INDEX_GET: u8 = 39;
const OP_INDEX_SET: u8 = 40;
const OP_FINISH_BEGIN: u8 = 41;
const OP_FINISH_END: u8 = 42;
const OP_ASYNC_BEGIN: u8 = 43;
const OP_ASYNC_END: u8 = 44;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Return = OP_RETURN,
    Constant = OP_CONSTANT,
    Nil = OP_NIL,
    True = OP_TRUE,
    False = OP_FALSE,
    Pop = OP_POP,
    GetLocal = OP_GET_LOCAL,
    SetLocal = OP_SET_LOCAL,
    GetGlobal = OP_GET_GLOBAL,
    DefineGlobal = OP_DEFINE_GLOBAL,
    SetGlobal = OP_SET_GLOBAL,
    GetUpvalue = OP_GET_UPVALUE,
    SetUpvalue = OP_SET_UPVALUE,
    GetProperty = OP_GET_PROPERTY,
    SetProperty = OP_SET_PROPERTY,
    GetSuper = OP_GET_SUPER,
    Equal = OP_EQUAL,
    Greater = OP_GREATER,
    Less = OP_LESS,
    Add = OP_ADD,
    Subtract = OP_SUBTRACT,
    Multiply = OP_MULTIPLY,
    Divide = OP_DIVIDE,
    Modulo = OP_MODULO,
    Not = OP_NOT,
    Negate = OP_NEGATE,
    Print = OP_PRINT,
    Jump = OP_JUMP,
    JumpIfFalse = OP_JUMP_IF_FALSE,
    Loop = OP_LOOP,
    Call = OP_CALL,
    Invoke = OP_INVOKE,
    SuperInvoke = OP_SUPER_INVOKE,
    Closure = OP_CLOSURE,
    CloseUpvalue = OP_CLOSE_UPVALUE,
    Class = OP_CLASS,
    Inherit = OP_INHERIT,
    Method = OP_METHOD,
    BuildList = OP_BUILD_LIST,
    IndexGet = OP_INDEX_GET,
    IndexSet = OP_INDEX_SET,
    FinishBegin = OP_FINISH_BEGIN,
    FinishEnd = OP_FINISH_END,
    AsyncBegin = OP_ASYNC_BEGIN,
    AsyncEnd = OP_ASYNC_END,
}

impl OpCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn try_from_u8(byte: u8) -> Result<Self, DisassemblerError> {
        let op = match byte {
            OP_RETURN => OpCode::Return,
            OP_CONSTANT => OpCode::Constant,
            OP_NIL => OpCode::Nil,
            OP_TRUE => OpCode::True,
            OP_FALSE => OpCode::False,
            OP_POP => OpCode::Pop,
            OP_GET_LOCAL => OpCode::GetLocal,
            OP_SET_LOCAL => OpCode::SetLocal,
            OP_GET_GLOBAL => OpCode::GetGlobal,
            OP_DEFINE_GLOBAL => OpCode::DefineGlobal,
            OP_SET_GLOBAL => OpCode::SetGlobal,
            OP_GET_UPVALUE => OpCode::GetUpvalue,
            OP_SET_UPVALUE => OpCode::SetUpvalue,
            OP_GET_PROPERTY => OpCode::GetProperty,
            OP_SET_PROPERTY => OpCode::SetProperty,
            OP_GET_SUPER => OpCode::GetSuper,
            OP_EQUAL => OpCode::Equal,
            OP_GREATER => OpCode::Greater,
            OP_LESS => OpCode::Less,
            OP_ADD => OpCode::Add,
            OP_SUBTRACT => OpCode::Subtract,
            OP_MULTIPLY => OpCode::Multiply,
            OP_DIVIDE => OpCode::Divide,
            OP_MODULO => OpCode::Modulo,
            OP_NOT => OpCode::Not,
            OP_NEGATE => OpCode::Negate,
            OP_PRINT => OpCode::Print,
            OP_JUMP => OpCode::Jump,
            OP_JUMP_IF_FALSE => OpCode::JumpIfFalse,
            OP_LOOP => OpCode::Loop,
            OP_CALL => OpCode::Call,
            OP_INVOKE => OpCode::Invoke,
            OP_SUPER_INVOKE => OpCode::SuperInvoke,
            OP_CLOSURE => OpCode::Closure,
            OP_CLOSE_UPVALUE => OpCode::CloseUpvalue,
            OP_CLASS => OpCode::Class,
            OP_INHERIT => OpCode::Inherit,
            OP_METHOD => OpCode::Method,
            OP_BUILD_LIST => OpCode::BuildList,
            OP_INDEX_GET => OpCode::IndexGet,
            OP_INDEX_SET => OpCode::IndexSet,
            OP_FINISH_BEGIN => OpCode::FinishBegin,
            OP_FINISH_END => OpCode::FinishEnd,
            OP_ASYNC_BEGIN => OpCode::AsyncBegin,
            OP_ASYNC_END => OpCode::AsyncEnd,
            _ => {
                return Err(DisassemblerError {
                    message: Cow::Borrowed("Unknown opcode"),
                })
            }
        };

        Ok(op)
    }
}

/// How a closure resolves one of its upvalues: either by capturing a local
/// slot of the enclosing frame or by inheriting the enclosing closure's
/// upvalue at `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvalueRef {
    pub is_local: bool,
    pub index: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    Return,
    Constant(u8),
    Nil,
    True,
    False,
    Pop,
    GetLocal(u8),
    SetLocal(u8),
    GetGlobal(u8),
    DefineGlobal(u8),
    SetGlobal(u8),
    GetUpvalue(u8),
    SetUpvalue(u8),
    GetProperty(u8),
    SetProperty(u8),
    GetSuper(u8),
    Equal,
    Greater,
    Less,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Not,
    Negate,
    Print,
    Jump(u16),
    JumpIfFalse(u16),
    Loop(u16),
    Call(u8),
    Invoke(u8, u8),
    SuperInvoke(u8, u8),
    Closure {
        fun_const: u8,
        upvalues: Vec<UpvalueRef>,
    },
    CloseUpvalue,
    Class(u8),
    Inherit,
    Method(u8),
    BuildList(u8),
    IndexGet,
    IndexSet,
    FinishBegin,
    FinishEnd,
    AsyncBegin(u16),
    AsyncEnd,
}

impl Instruction {
    pub fn op_code(&self) -> OpCode {
        match self {
            Instruction::Return => OpCode::Return,
            Instruction::Constant(_) => OpCode::Constant,
            Instruction::Nil => OpCode::Nil,
            Instruction::True => OpCode::True,
            Instruction::False => OpCode::False,
            Instruction::Pop => OpCode::Pop,
            Instruction::GetLocal(_) => OpCode::GetLocal,
            Instruction::SetLocal(_) => OpCode::SetLocal,
            Instruction::GetGlobal(_) => OpCode::GetGlobal,
            Instruction::DefineGlobal(_) => OpCode::DefineGlobal,
            Instruction::SetGlobal(_) => OpCode::SetGlobal,
            Instruction::GetUpvalue(_) => OpCode::GetUpvalue,
            Instruction::SetUpvalue(_) => OpCode::SetUpvalue,
            Instruction::GetProperty(_) => OpCode::GetProperty,
            Instruction::SetProperty(_) => OpCode::SetProperty,
            Instruction::GetSuper(_) => OpCode::GetSuper,
            Instruction::Equal => OpCode::Equal,
            Instruction::Greater => OpCode::Greater,
            Instruction::Less => OpCode::Less,
            Instruction::Add => OpCode::Add,
            Instruction::Subtract => OpCode::Subtract,
            Instruction::Multiply => OpCode::Multiply,
            Instruction::Divide => OpCode::Divide,
            Instruction::Modulo => OpCode::Modulo,
            Instruction::Not => OpCode::Not,
            Instruction::Negate => OpCode::Negate,
            Instruction::Print => OpCode::Print,
            Instruction::Jump(_) => OpCode::Jump,
            Instruction::JumpIfFalse(_) => OpCode::JumpIfFalse,
            Instruction::Loop(_) => OpCode::Loop,
            Instruction::Call(_) => OpCode::Call,
            Instruction::Invoke(_, _) => OpCode::Invoke,
            Instruction::SuperInvoke(_, _) => OpCode::SuperInvoke,
            Instruction::Closure { .. } => OpCode::Closure,
            Instruction::CloseUpvalue => OpCode::CloseUpvalue,
            Instruction::Class(_) => OpCode::Class,
            Instruction::Inherit => OpCode::Inherit,
            Instruction::Method(_) => OpCode::Method,
            Instruction::BuildList(_) => OpCode::BuildList,
            Instruction::IndexGet => OpCode::IndexGet,
            Instruction::IndexSet => OpCode::IndexSet,
            Instruction::FinishBegin => OpCode::FinishBegin,
            Instruction::FinishEnd => OpCode::FinishEnd,
            Instruction::AsyncBegin(_) => OpCode::AsyncBegin,
            Instruction::AsyncEnd => OpCode::AsyncEnd,
        }
    }

    pub fn write_bytes(&self, dst: &mut Vec<u8>) {
        dst.push(self.op_code() as u8);
        match self {
            Instruction::Return
            | Instruction::Nil
            | Instruction::True
            | Instruction::False
            | Instruction::Pop
            | Instruction::Equal
            | Instruction::Greater
            | Instruction::Less
            | Instruction::Add
            | Instruction::Subtract
            | Instruction::Multiply
            | Instruction::Divide
            | Instruction::Modulo
            | Instruction::Not
            | Instruction::Negate
            | Instruction::Print
            | Instruction::CloseUpvalue
            | Instruction::Inherit
            | Instruction::IndexGet
            | Instruction::IndexSet
            | Instruction::FinishBegin
            | Instruction::FinishEnd
            | Instruction::AsyncEnd => {}
            Instruction::Constant(operand)
            | Instruction::GetLocal(operand)
            | Instruction::SetLocal(operand)
            | Instruction::GetGlobal(operand)
            | Instruction::DefineGlobal(operand)
            | Instruction::SetGlobal(operand)
            | Instruction::GetUpvalue(operand)
            | Instruction::SetUpvalue(operand)
            | Instruction::GetProperty(operand)
            | Instruction::SetProperty(operand)
            | Instruction::GetSuper(operand)
            | Instruction::Call(operand)
            | Instruction::Class(operand)
            | Instruction::Method(operand)
            | Instruction::BuildList(operand) => {
                dst.push(*operand);
            }
            Instruction::Jump(offset)
            | Instruction::JumpIfFalse(offset)
            | Instruction::Loop(offset)
            | Instruction::AsyncBegin(offset) => {
                dst.extend_from_slice(&offset.to_le_bytes());
            }
            Instruction::Invoke(name, argc) | Instruction::SuperInvoke(name, argc) => {
                dst.push(*name);
                dst.push(*argc);
            }
            Instruction::Closure { fun_const, upvalues } => {
                dst.push(*fun_const);
                for upvalue in upvalues {
                    dst.push(upvalue.is_local as u8);
                    dst.push(upvalue.index);
                }
            }
        }
    }

    /// Decodes the instruction at the cursor. `constants` is needed for
    /// `Closure`, whose operand count is stored on the function object rather
    /// than in the byte stream.
    pub fn from_bytes(
        bytes: &mut ByteCursor<'_>,
        constants: &[Value],
    ) -> Result<Self, DisassemblerError> {
        fn u8_operand(bytes: &mut ByteCursor<'_>) -> Result<u8, DisassemblerError> {
            bytes.u8().ok_or(DisassemblerError {
                message: Cow::Borrowed("Expected one byte operand"),
            })
        }

        fn u16_operand(bytes: &mut ByteCursor<'_>) -> Result<u16, DisassemblerError> {
            bytes.u16().ok_or(DisassemblerError {
                message: Cow::Borrowed("Expected two byte operand"),
            })
        }

        let Some(op) = bytes.u8() else {
            return Err(DisassemblerError {
                message: Cow::Borrowed("Unexpected end of bytecode"),
            });
        };

        let instr = match OpCode::try_from_u8(op)? {
            OpCode::Return => Instruction::Return,
            OpCode::Constant => Instruction::Constant(u8_operand(bytes)?),
            OpCode::Nil => Instruction::Nil,
            OpCode::True => Instruction::True,
            OpCode::False => Instruction::False,
            OpCode::Pop => Instruction::Pop,
            OpCode::GetLocal => Instruction::GetLocal(u8_operand(bytes)?),
            OpCode::SetLocal => Instruction::SetLocal(u8_operand(bytes)?),
            OpCode::GetGlobal => Instruction::GetGlobal(u8_operand(bytes)?),
            OpCode::DefineGlobal => Instruction::DefineGlobal(u8_operand(bytes)?),
            OpCode::SetGlobal => Instruction::SetGlobal(u8_operand(bytes)?),
            OpCode::GetUpvalue => Instruction::GetUpvalue(u8_operand(bytes)?),
            OpCode::SetUpvalue => Instruction::SetUpvalue(u8_operand(bytes)?),
            OpCode::GetProperty => Instruction::GetProperty(u8_operand(bytes)?),
            OpCode::SetProperty => Instruction::SetProperty(u8_operand(bytes)?),
            OpCode::GetSuper => Instruction::GetSuper(u8_operand(bytes)?),
            OpCode::Equal => Instruction::Equal,
            OpCode::Greater => Instruction::Greater,
            OpCode::Less => Instruction::Less,
            OpCode::Add => Instruction::Add,
            OpCode::Subtract => Instruction::Subtract,
            OpCode::Multiply => Instruction::Multiply,
            OpCode::Divide => Instruction::Divide,
            OpCode::Modulo => Instruction::Modulo,
            OpCode::Not => Instruction::Not,
            OpCode::Negate => Instruction::Negate,
            OpCode::Print => Instruction::Print,
            OpCode::Jump => Instruction::Jump(u16_operand(bytes)?),
            OpCode::JumpIfFalse => Instruction::JumpIfFalse(u16_operand(bytes)?),
            OpCode::Loop => Instruction::Loop(u16_operand(bytes)?),
            OpCode::Call => Instruction::Call(u8_operand(bytes)?),
            OpCode::Invoke => Instruction::Invoke(u8_operand(bytes)?, u8_operand(bytes)?),
            OpCode::SuperInvoke => {
                Instruction::SuperInvoke(u8_operand(bytes)?, u8_operand(bytes)?)
            }
            OpCode::Closure => {
                let fun_const = u8_operand(bytes)?;
                let upvalue_count = constants
                    .get(fun_const as usize)
                    .and_then(|c| c.try_as_function())
                    .map(|fun| fun.upvalue_count)
                    .ok_or(DisassemblerError {
                        message: Cow::Borrowed("Closure operand is not a function constant"),
                    })?;

                let mut upvalues = Vec::with_capacity(upvalue_count);
                for _ in 0..upvalue_count {
                    upvalues.push(UpvalueRef {
                        is_local: u8_operand(bytes)? != 0,
                        index: u8_operand(bytes)?,
                    });
                }

                Instruction::Closure { fun_const, upvalues }
            }
            OpCode::CloseUpvalue => Instruction::CloseUpvalue,
            OpCode::Class => Instruction::Class(u8_operand(bytes)?),
            OpCode::Inherit => Instruction::Inherit,
            OpCode::Method => Instruction::Method(u8_operand(bytes)?),
            OpCode::BuildList => Instruction::BuildList(u8_operand(bytes)?),
            OpCode::IndexGet => Instruction::IndexGet,
            OpCode::IndexSet => Instruction::IndexSet,
            OpCode::FinishBegin => Instruction::FinishBegin,
            OpCode::FinishEnd => Instruction::FinishEnd,
            OpCode::AsyncBegin => Instruction::AsyncBegin(u16_operand(bytes)?),
            OpCode::AsyncEnd => Instruction::AsyncEnd,
        };

        Ok(instr)
    }

    pub fn byte_len(&self) -> usize {
        1 + match self {
            Instruction::Return
            | Instruction::Nil
            | Instruction::True
            | Instruction::False
            | Instruction::Pop
            | Instruction::Equal
            | Instruction::Greater
            | Instruction::Less
            | Instruction::Add
            | Instruction::Subtract
            | Instruction::Multiply
            | Instruction::Divide
            | Instruction::Modulo
            | Instruction::Not
            | Instruction::Negate
            | Instruction::Print
            | Instruction::CloseUpvalue
            | Instruction::Inherit
            | Instruction::IndexGet
            | Instruction::IndexSet
            | Instruction::FinishBegin
            | Instruction::FinishEnd
            | Instruction::AsyncEnd => 0,
            Instruction::Constant(_)
            | Instruction::GetLocal(_)
            | Instruction::SetLocal(_)
            | Instruction::GetGlobal(_)
            | Instruction::DefineGlobal(_)
            | Instruction::SetGlobal(_)
            | Instruction::GetUpvalue(_)
            | Instruction::SetUpvalue(_)
            | Instruction::GetProperty(_)
            | Instruction::SetProperty(_)
            | Instruction::GetSuper(_)
            | Instruction::Call(_)
            | Instruction::Class(_)
            | Instruction::Method(_)
            | Instruction::BuildList(_) => 1,
            Instruction::Jump(_)
            | Instruction::JumpIfFalse(_)
            | Instruction::Loop(_)
            | Instruction::AsyncBegin(_)
            | Instruction::Invoke(_, _)
            | Instruction::SuperInvoke(_, _) => 2,
            Instruction::Closure { upvalues, .. } => 1 + 2 * upvalues.len(),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Return => write!(f, "RETURN"),
            Instruction::Constant(idx) => write!(f, "CONSTANT {}", idx),
            Instruction::Nil => write!(f, "NIL"),
            Instruction::True => write!(f, "TRUE"),
            Instruction::False => write!(f, "FALSE"),
            Instruction::Pop => write!(f, "POP"),
            Instruction::GetLocal(slot) => write!(f, "GET_LOCAL {}", slot),
            Instruction::SetLocal(slot) => write!(f, "SET_LOCAL {}", slot),
            Instruction::GetGlobal(idx) => write!(f, "GET_GLOBAL {}", idx),
            Instruction::DefineGlobal(idx) => write!(f, "DEFINE_GLOBAL {}", idx),
            Instruction::SetGlobal(idx) => write!(f, "SET_GLOBAL {}", idx),
            Instruction::GetUpvalue(slot) => write!(f, "GET_UPVALUE {}", slot),
            Instruction::SetUpvalue(slot) => write!(f, "SET_UPVALUE {}", slot),
            Instruction::GetProperty(idx) => write!(f, "GET_PROPERTY {}", idx),
            Instruction::SetProperty(idx) => write!(f, "SET_PROPERTY {}", idx),
            Instruction::GetSuper(idx) => write!(f, "GET_SUPER {}", idx),
            Instruction::Equal => write!(f, "EQUAL"),
            Instruction::Greater => write!(f, "GREATER"),
            Instruction::Less => write!(f, "LESS"),
            Instruction::Add => write!(f, "ADD"),
            Instruction::Subtract => write!(f, "SUBTRACT"),
            Instruction::Multiply => write!(f, "MULTIPLY"),
            Instruction::Divide => write!(f, "DIVIDE"),
            Instruction::Modulo => write!(f, "MODULO"),
            Instruction::Not => write!(f, "NOT"),
            Instruction::Negate => write!(f, "NEGATE"),
            Instruction::Print => write!(f, "PRINT"),
            Instruction::Jump(offset) => write!(f, "JUMP {}", offset),
            Instruction::JumpIfFalse(offset) => write!(f, "JUMP_IF_FALSE {}", offset),
            Instruction::Loop(offset) => write!(f, "LOOP {}", offset),
            Instruction::Call(argc) => write!(f, "CALL {}", argc),
            Instruction::Invoke(name, argc) => write!(f, "INVOKE {} {}", name, argc),
            Instruction::SuperInvoke(name, argc) => write!(f, "SUPER_INVOKE {} {}", name, argc),
            Instruction::Closure { fun_const, upvalues } => {
                write!(f, "CLOSURE {}", fun_const)?;
                for upvalue in upvalues {
                    let kind = if upvalue.is_local { "local" } else { "upvalue" };
                    write!(f, " ({} {})", kind, upvalue.index)?;
                }
                Ok(())
            }
            Instruction::CloseUpvalue => write!(f, "CLOSE_UPVALUE"),
            Instruction::Class(idx) => write!(f, "CLASS {}", idx),
            Instruction::Inherit => write!(f, "INHERIT"),
            Instruction::Method(idx) => write!(f, "METHOD {}", idx),
            Instruction::BuildList(count) => write!(f, "BUILD_LIST {}", count),
            Instruction::IndexGet => write!(f, "INDEX_GET"),
            Instruction::IndexSet => write!(f, "INDEX_SET"),
            Instruction::FinishBegin => write!(f, "FINISH_BEGIN"),
            Instruction::FinishEnd => write!(f, "FINISH_END"),
            Instruction::AsyncBegin(offset) => write!(f, "ASYNC_BEGIN {}", offset),
            Instruction::AsyncEnd => write!(f, "ASYNC_END"),
        }
    }
}
