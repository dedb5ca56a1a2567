//! Instruction semantics consumed by the executor.
//!
//! Decoding is someone else's job: a [`Program`] hands out already lifted
//! [`Instruction`]s keyed by address, each carrying one closed [`Opcode`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::expr::{BinOp, BinRel, UnOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Register {
    id: u16,
    name: &'static str,
}

impl Register {
    pub const fn new(id: u16, name: &'static str) -> Self {
        Self { id, name }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Sizes are in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operand {
    Register { register: Register, size: usize },
    Variable { id: u32, size: usize },
    Address { value: u64, size: usize },
    Constant { value: u64, size: usize },
}

impl Operand {
    pub fn register(register: Register, size: usize) -> Self {
        Self::Register { register, size }
    }

    pub fn variable(id: u32, size: usize) -> Self {
        Self::Variable { id, size }
    }

    pub fn address(value: u64, size: usize) -> Self {
        Self::Address { value, size }
    }

    pub fn constant(value: u64, size: usize) -> Self {
        Self::Constant { value, size }
    }

    pub fn size(&self) -> usize {
        match self {
            Self::Register { size, .. }
            | Self::Variable { size, .. }
            | Self::Address { size, .. }
            | Self::Constant { size, .. } => *size,
        }
    }

    pub fn bits(&self) -> u32 {
        self.size() as u32 * 8
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register { register, size } => write!(f, "{}:{}", register, size),
            Self::Variable { id, size } => write!(f, "tmp{}:{}", id, size),
            Self::Address { value, size } => write!(f, "[{:#x}]:{}", value, size),
            Self::Constant { value, size } => write!(f, "{:#x}:{}", value, size),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatOp {
    ADD,
    SUB,
    MUL,
    DIV,
    SQRT,
    ITOF,
    FTOI,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Opcode {
    Copy { destination: Operand, source: Operand },
    /// Reads `destination.size()` bytes from the address held in `address`.
    Load { destination: Operand, address: Operand },
    Store { address: Operand, source: Operand },

    IntUnary { op: UnOp, destination: Operand, operand: Operand },
    IntBinary { op: BinOp, destination: Operand, lhs: Operand, rhs: Operand },
    IntCompare { op: BinRel, destination: Operand, lhs: Operand, rhs: Operand },
    ZeroExtend { destination: Operand, source: Operand },
    SignExtend { destination: Operand, source: Operand },

    Branch { target: u64 },
    CBranch { target: u64, condition: Operand },
    IBranch { target: Operand },
    Call { target: u64 },
    Return,

    /// Append literal bytes to the output channel.
    Output { text: Arc<[u8]> },
    Exit,
    Nop,

    Float { op: FloatOp, destination: Operand, source: Operand },
    Unsupported { mnemonic: Arc<str> },
}

impl Opcode {
    pub fn output<T: AsRef<[u8]>>(text: T) -> Self {
        Self::Output {
            text: Arc::from(text.as_ref()),
        }
    }

    pub fn unsupported<S: AsRef<str>>(mnemonic: S) -> Self {
        Self::Unsupported {
            mnemonic: Arc::from(mnemonic.as_ref()),
        }
    }

    pub fn mnemonic(&self) -> &str {
        match self {
            Self::Copy { .. } => "COPY",
            Self::Load { .. } => "LOAD",
            Self::Store { .. } => "STORE",
            Self::IntUnary { .. } => "INT_UNARY",
            Self::IntBinary { .. } => "INT_BINARY",
            Self::IntCompare { .. } => "INT_COMPARE",
            Self::ZeroExtend { .. } => "INT_ZEXT",
            Self::SignExtend { .. } => "INT_SEXT",
            Self::Branch { .. } => "BRANCH",
            Self::CBranch { .. } => "CBRANCH",
            Self::IBranch { .. } => "BRANCHIND",
            Self::Call { .. } => "CALL",
            Self::Return => "RETURN",
            Self::Output { .. } => "OUTPUT",
            Self::Exit => "EXIT",
            Self::Nop => "NOP",
            Self::Float { op, .. } => match op {
                FloatOp::ADD => "FLOAT_ADD",
                FloatOp::SUB => "FLOAT_SUB",
                FloatOp::MUL => "FLOAT_MULT",
                FloatOp::DIV => "FLOAT_DIV",
                FloatOp::SQRT => "FLOAT_SQRT",
                FloatOp::ITOF => "FLOAT_INT2FLOAT",
                FloatOp::FTOI => "FLOAT_TRUNC",
            },
            Self::Unsupported { mnemonic } => &**mnemonic,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Copy { destination, source }
            | Self::ZeroExtend { destination, source }
            | Self::SignExtend { destination, source }
            | Self::Float { destination, source, .. } => {
                write!(f, "{} {} <- {}", self.mnemonic(), destination, source)
            }
            Self::Load { destination, address } => write!(f, "LOAD {} <- *{}", destination, address),
            Self::Store { address, source } => write!(f, "STORE *{} <- {}", address, source),
            Self::IntUnary { op, destination, operand } => {
                write!(f, "{:?} {} <- {}", op, destination, operand)
            }
            Self::IntBinary { op, destination, lhs, rhs } => {
                write!(f, "{:?} {} <- {}, {}", op, destination, lhs, rhs)
            }
            Self::IntCompare { op, destination, lhs, rhs } => {
                write!(f, "{:?} {} <- {}, {}", op, destination, lhs, rhs)
            }
            Self::Branch { target } | Self::Call { target } => {
                write!(f, "{} {:#x}", self.mnemonic(), target)
            }
            Self::CBranch { target, condition } => write!(f, "CBRANCH {:#x} if {}", target, condition),
            Self::IBranch { target } => write!(f, "BRANCHIND {}", target),
            Self::Output { text } => write!(f, "OUTPUT {:?}", String::from_utf8_lossy(text)),
            _ => f.write_str(self.mnemonic()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Instruction {
    pub address: u64,
    pub length: u64,
    pub kind: Opcode,
}

impl Instruction {
    pub fn new(address: u64, length: u64, kind: Opcode) -> Self {
        Self { address, length, kind }
    }

    /// Fall-through address.
    pub fn next(&self) -> u64 {
        self.address.wrapping_add(self.length)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}: {}", self.address, self.kind)
    }
}

/// Initialised bytes mapped at `base`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub base: u64,
    pub bytes: Arc<[u8]>,
}

pub trait Program {
    fn instruction(&self, address: u64) -> Option<&Instruction>;

    fn segments(&self) -> &[Segment] {
        &[]
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProgramImage {
    instructions: BTreeMap<u64, Instruction>,
    segments: Vec<Segment>,
}

impl ProgramImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lay `ops` out from `base`, one every `stride` bytes.
    pub fn assemble<I>(base: u64, stride: u64, ops: I) -> Self
    where
        I: IntoIterator<Item = Opcode>,
    {
        let mut image = Self::new();
        for (i, kind) in ops.into_iter().enumerate() {
            image.insert(Instruction::new(base + i as u64 * stride, stride, kind));
        }
        image
    }

    pub fn insert(&mut self, instruction: Instruction) -> Option<Instruction> {
        self.instructions.insert(instruction.address, instruction)
    }

    pub fn with_segment<B: AsRef<[u8]>>(mut self, base: u64, bytes: B) -> Self {
        self.segments.push(Segment {
            base,
            bytes: Arc::from(bytes.as_ref()),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn instructions(&self) -> impl Iterator<Item = &Instruction> {
        self.instructions.values()
    }
}

impl Program for ProgramImage {
    fn instruction(&self, address: u64) -> Option<&Instruction> {
        self.instructions.get(&address)
    }

    fn segments(&self) -> &[Segment] {
        &self.segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assemble_at_stride() {
        let image = ProgramImage::assemble(0x1000, 4, vec![Opcode::Nop, Opcode::output("hi"), Opcode::Exit]);
        assert_eq!(image.len(), 3);

        let insn = image.instruction(0x1004).unwrap();
        assert_eq!(insn.next(), 0x1008);
        assert_eq!(insn.kind.mnemonic(), "OUTPUT");
        assert_eq!(insn.to_string(), "0x1004: OUTPUT \"hi\"");
        assert!(image.instruction(0x1002).is_none());
    }

    #[test]
    fn mnemonics() {
        let f = Opcode::Float {
            op: FloatOp::SQRT,
            destination: Operand::variable(0, 8),
            source: Operand::variable(1, 8),
        };
        assert_eq!(f.mnemonic(), "FLOAT_SQRT");
        assert_eq!(Opcode::unsupported("RDTSC").mnemonic(), "RDTSC");
    }
}
