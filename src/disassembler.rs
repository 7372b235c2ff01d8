use std::borrow::Cow;

use crate::bytecode::{ByteCursor, Chunk, Instruction};

/// Walks a chunk, yielding `(offset, instruction)` pairs. Needs the chunk
/// rather than the raw bytes because CLOSURE's operand count lives on the
/// function constant it references.
#[derive(Debug, Clone)]
pub struct Disassembler<'a> {
    chunk: &'a Chunk,
    cursor: ByteCursor<'a>,
}

impl<'a> Disassembler<'a> {
    pub fn new(chunk: &'a Chunk) -> Disassembler<'a> {
        Disassembler {
            chunk,
            cursor: ByteCursor::new(&chunk.code),
        }
    }

    pub fn print(self) {
        for result in self {
            match result {
                Ok((offset, op)) => println!("{:04} {}", offset, op),
                Err(err) => println!("Error: '{}'", err.message),
            }
        }
    }
}

impl<'a> Iterator for Disassembler<'a> {
    type Item = Result<(usize, Instruction), DisassemblerError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor.is_empty() {
            return None;
        }

        let offset = self.cursor.offset();
        match Instruction::from_bytes(&mut self.cursor, &self.chunk.constants) {
            Ok(op) => Some(Ok((offset, op))),
            Err(err) => Some(Err(err)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisassemblerError {
    pub message: Cow<'static, str>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Span;

    #[test]
    fn round_trips_instructions() {
        let mut chunk = Chunk::new();
        let span = Span::from_len(1, 0, 1);
        chunk.push(Instruction::True, span.clone());
        chunk.push(Instruction::JumpIfFalse(7), span.clone());
        chunk.push(Instruction::Call(2), span.clone());
        chunk.push(Instruction::Return, span);

        let ops: Vec<_> = Disassembler::new(&chunk).map(Result::unwrap).collect();
        assert_eq!(
            ops,
            vec![
                (0, Instruction::True),
                (1, Instruction::JumpIfFalse(7)),
                (4, Instruction::Call(2)),
                (6, Instruction::Return),
            ]
        );
    }

    #[test]
    fn reports_truncated_operands() {
        let mut chunk = Chunk::new();
        chunk.push(Instruction::Nil, Span::from_len(1, 0, 1));
        chunk.push_byte(crate::bytecode::OpCode::Constant.as_u8());
        // no operand byte follows

        let results: Vec<_> = Disassembler::new(&chunk).collect();
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }
}
