//! Machine state: registers, paged memory, path constraints and output.
//!
//! Every cell holds either a concrete value or a symbolic expression. Forks
//! are plain clones: memory pages sit behind `Arc` and are copied on first
//! write, the constraint store shares its prefix, so siblings never alias
//! anything mutable.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use either::Either;

use fnv::FnvHashMap as HashMap;

use thiserror::Error;

use crate::bv::BitVec;
use crate::constraint::ConstraintStore;
use crate::expr::SymExpr;
use crate::ir::{Operand, Register};

pub type Value = Either<BitVec, SymExpr>;

/// Largest operand, in bytes.
pub const OPERAND_SIZE: usize = 8;

const PAGE_SIZE: u64 = 4096;

#[derive(Debug, Error)]
pub enum Error {
    #[error("symbolic address: {0}")]
    SymbolicAddress(SymExpr),
    #[error("cannot write to constant operand {0}")]
    ConstantDestination(Operand),
    #[error("unsupported operand size of {0} bytes; maximum supported is {1} bytes")]
    UnsupportedOperandSize(usize, usize),
}

pub trait ValueExt {
    fn bits(&self) -> u32;
    fn resize(self, bits: u32) -> Value;
    fn sign_extend(self, bits: u32) -> Value;
    fn into_expr(self) -> SymExpr;
    fn is_symbolic(&self) -> bool;
}

impl ValueExt for Value {
    fn bits(&self) -> u32 {
        self.as_ref().either(BitVec::bits, SymExpr::bits)
    }

    fn resize(self, bits: u32) -> Value {
        self.map_left(|bv| bv.resize(bits))
            .map_right(|expr| expr.resize(bits))
    }

    fn sign_extend(self, bits: u32) -> Value {
        self.map_left(|bv| bv.sign_extend(bits))
            .map_right(|expr| expr.sign_extend(bits))
    }

    fn into_expr(self) -> SymExpr {
        self.either(SymExpr::val, |expr| expr)
    }

    fn is_symbolic(&self) -> bool {
        self.is_right()
    }
}

/// Demote an expression that folded to a literal back to a concrete value.
pub fn from_expr(expr: SymExpr) -> Value {
    match expr.as_val() {
        Some(bv) => Either::Left(*bv),
        None => Either::Right(expr),
    }
}

fn check_size(size: usize) -> Result<(), Error> {
    if size == 0 || size > OPERAND_SIZE {
        Err(Error::UnsupportedOperandSize(size, OPERAND_SIZE))
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Page {
    concrete: Box<[u8]>,
    symbolic: Box<[Option<SymExpr>]>,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            concrete: vec![0u8; PAGE_SIZE as usize].into_boxed_slice(),
            symbolic: vec![None; PAGE_SIZE as usize].into_boxed_slice(),
        }
    }
}

type Byte = Either<u8, SymExpr>;

/// Sparse byte-addressed memory; unmapped bytes read as concrete zero.
#[derive(Debug, Clone, Default)]
pub struct Memory {
    pages: BTreeMap<u64, Arc<Page>>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    fn split(address: u64) -> (u64, usize) {
        (address / PAGE_SIZE, (address % PAGE_SIZE) as usize)
    }

    fn read_byte(&self, address: u64) -> Byte {
        let (page, offset) = Self::split(address);
        match self.pages.get(&page) {
            Some(page) => match page.symbolic[offset] {
                Some(ref expr) => Either::Right(expr.clone()),
                None => Either::Left(page.concrete[offset]),
            },
            None => Either::Left(0),
        }
    }

    fn write_byte(&mut self, address: u64, byte: Byte) {
        let (page, offset) = Self::split(address);
        let page = Arc::make_mut(self.pages.entry(page).or_default());
        match byte {
            Either::Left(b) => {
                page.concrete[offset] = b;
                page.symbolic[offset] = None;
            }
            Either::Right(expr) => {
                page.symbolic[offset] = Some(expr);
            }
        }
    }

    /// Little-endian read of `size` bytes.
    pub fn read(&self, address: u64, size: usize) -> Result<Value, Error> {
        check_size(size)?;

        let bytes = (0..size as u64)
            .map(|i| self.read_byte(address.wrapping_add(i)))
            .collect::<Vec<_>>();

        if bytes.iter().all(Either::is_left) {
            let concrete = bytes
                .into_iter()
                .filter_map(Either::left)
                .collect::<Vec<_>>();
            return Ok(Either::Left(BitVec::from_le_bytes(&concrete)));
        }

        let mut bytes = bytes
            .into_iter()
            .rev()
            .map(|b| b.either(|b| SymExpr::constant(b as u64, 8), |e| e));

        let mut expr = match bytes.next() {
            Some(expr) => expr,
            None => return Err(Error::UnsupportedOperandSize(size, OPERAND_SIZE)),
        };
        for low in bytes {
            expr = expr.concat(low);
        }

        Ok(from_expr(expr))
    }

    /// Little-endian write; the value's width must be a whole number of bytes.
    pub fn write(&mut self, address: u64, value: &Value) -> Result<(), Error> {
        let bits = value.bits();
        if bits % 8 != 0 {
            return Err(Error::UnsupportedOperandSize(bits.div_ceil(8) as usize, OPERAND_SIZE));
        }

        match value {
            Either::Left(bv) => {
                for (i, b) in bv.to_le_bytes().into_iter().enumerate() {
                    self.write_byte(address.wrapping_add(i as u64), Either::Left(b));
                }
            }
            Either::Right(expr) => {
                for i in 0..bits / 8 {
                    let byte = from_expr(expr.clone().extract(i * 8, i * 8 + 8))
                        .map_left(|bv| bv.to_u64() as u8);
                    self.write_byte(address.wrapping_add(i as u64), byte);
                }
            }
        }

        Ok(())
    }

    /// Map concrete bytes, e.g. initialised program data.
    pub fn write_bytes(&mut self, address: u64, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            self.write_byte(address.wrapping_add(i as u64), Either::Left(*b));
        }
    }

    pub fn is_symbolic(&self, address: u64, size: usize) -> bool {
        (0..size as u64).any(|i| self.read_byte(address.wrapping_add(i)).is_right())
    }

    pub fn mapped_pages(&self) -> usize {
        self.pages.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Running,
    Exited,
}

#[derive(Debug, Clone)]
pub struct MachineState {
    pc: u64,
    registers: BTreeMap<Register, Value>,
    temporaries: HashMap<u32, Value>,
    memory: Memory,
    constraints: ConstraintStore,
    output: Vec<u8>,
    status: Status,
    depth: usize,
}

impl MachineState {
    pub fn new(pc: u64) -> Self {
        Self {
            pc,
            registers: BTreeMap::new(),
            temporaries: HashMap::default(),
            memory: Memory::new(),
            constraints: ConstraintStore::new(),
            output: Vec::new(),
            status: Status::Running,
            depth: 0,
        }
    }

    pub fn fork(&self) -> Self {
        self.clone()
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    /// Number of instructions executed along this lineage.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub(crate) fn advance(&mut self, pc: u64) {
        self.pc = pc;
        self.depth += 1;
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn is_exited(&self) -> bool {
        self.status == Status::Exited
    }

    pub(crate) fn exit(&mut self) {
        self.status = Status::Exited;
        self.depth += 1;
    }

    pub fn constraints(&self) -> &ConstraintStore {
        &self.constraints
    }

    pub fn push_constraint(&mut self, constraint: SymExpr) {
        self.constraints.push(constraint);
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn write_output(&mut self, bytes: &[u8]) {
        self.output.extend_from_slice(bytes);
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn register(&self, register: Register) -> Option<&Value> {
        self.registers.get(&register)
    }

    /// Low `size` bytes of `register`; unwritten registers are zero.
    pub fn read_register(&self, register: Register, size: usize) -> Result<Value, Error> {
        check_size(size)?;
        let bits = size as u32 * 8;
        Ok(match self.registers.get(&register) {
            Some(value) => value.clone().resize(bits),
            None => Either::Left(BitVec::zero(bits)),
        })
    }

    /// A narrower write keeps the register's upper bits.
    pub fn write_register(&mut self, register: Register, value: Value) {
        let bits = value.bits();
        let merged = match self.registers.get(&register) {
            Some(old) if old.bits() > bits => {
                let high = old.clone().into_expr().extract(bits, old.bits());
                from_expr(high.concat(value.into_expr()))
            }
            _ => value,
        };
        self.registers.insert(register, merged);
    }

    pub fn read_memory(&self, address: &Value, size: usize) -> Result<Value, Error> {
        match address {
            Either::Left(bv) => self.memory.read(bv.to_u64(), size),
            Either::Right(expr) => Err(Error::SymbolicAddress(expr.clone())),
        }
    }

    pub fn write_memory(&mut self, address: &Value, value: &Value) -> Result<(), Error> {
        match address {
            Either::Left(bv) => self.memory.write(bv.to_u64(), value),
            Either::Right(expr) => Err(Error::SymbolicAddress(expr.clone())),
        }
    }

    pub fn read_operand(&self, operand: &Operand) -> Result<Value, Error> {
        check_size(operand.size())?;
        let bits = operand.bits();

        match operand {
            Operand::Register { register, size } => self.read_register(*register, *size),
            Operand::Variable { id, .. } => Ok(match self.temporaries.get(id) {
                Some(value) => value.clone().resize(bits),
                None => Either::Left(BitVec::zero(bits)),
            }),
            Operand::Address { value, size } => self.memory.read(*value, *size),
            Operand::Constant { value, .. } => Ok(Either::Left(BitVec::new(*value, bits))),
        }
    }

    /// Stores `value` truncated or zero-extended to the operand's size.
    pub fn write_operand(&mut self, operand: &Operand, value: Value) -> Result<(), Error> {
        check_size(operand.size())?;
        let value = value.resize(operand.bits());

        match operand {
            Operand::Register { register, .. } => self.write_register(*register, value),
            Operand::Variable { id, .. } => {
                self.temporaries.insert(*id, value);
            }
            Operand::Address { value: address, .. } => self.memory.write(*address, &value)?,
            Operand::Constant { .. } => return Err(Error::ConstantDestination(operand.clone())),
        }

        Ok(())
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "state@{:#x} (depth {}, {} constraint(s))", self.pc, self.depth, self.constraints.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::x86;
    use crate::expr::SymVar;

    #[test]
    fn symbolic_word_round_trips_through_memory() {
        let x = SymExpr::var(SymVar::new("x", 32));
        let mut memory = Memory::new();
        memory.write(0x1000, &Either::Right(x.clone())).unwrap();

        assert!(memory.is_symbolic(0x1000, 4));
        assert_eq!(memory.read(0x1000, 4).unwrap(), Either::Right(x.clone()));

        let low = memory.read(0x1000, 2).unwrap().right().unwrap();
        assert_eq!(low, x.extract(0, 16));
    }

    #[test]
    fn concrete_memory_is_little_endian() {
        let mut memory = Memory::new();
        memory.write(0x2ffe, &Either::Left(BitVec::new(0xdead_beef, 32))).unwrap();
        assert_eq!(memory.mapped_pages(), 2);
        assert_eq!(memory.read(0x2ffe, 1).unwrap(), Either::Left(BitVec::new(0xef, 8)));
        assert_eq!(memory.read(0x2ffe, 4).unwrap(), Either::Left(BitVec::new(0xdead_beef, 32)));
        assert_eq!(memory.read(0x9000, 4).unwrap(), Either::Left(BitVec::zero(32)));
        assert!(matches!(memory.read(0x9000, 16), Err(Error::UnsupportedOperandSize(16, 8))));
    }

    #[test]
    fn forks_copy_pages_on_write() {
        let mut parent = MachineState::new(0);
        parent.memory_mut().write_bytes(0x1000, b"abcd");

        let mut child = parent.fork();
        child.memory_mut().write_bytes(0x1000, b"wxyz");
        child.write_output(b"child");

        assert_eq!(parent.memory().read(0x1000, 1).unwrap(), Either::Left(BitVec::new(b'a' as u64, 8)));
        assert_eq!(child.memory().read(0x1000, 1).unwrap(), Either::Left(BitVec::new(b'w' as u64, 8)));
        assert!(parent.output().is_empty());
    }

    #[test]
    fn narrow_register_writes_keep_upper_bits() {
        let mut state = MachineState::new(0);
        state.write_register(x86::EAX, Either::Left(BitVec::new(0x1122_3344, 32)));
        state
            .write_operand(&Operand::register(x86::EAX, 1), Either::Left(BitVec::new(0xff, 8)))
            .unwrap();

        assert_eq!(
            state.read_register(x86::EAX, 4).unwrap(),
            Either::Left(BitVec::new(0x1122_33ff, 32))
        );
        assert_eq!(
            state.read_register(x86::EBX, 4).unwrap(),
            Either::Left(BitVec::zero(32))
        );
    }

    #[test]
    fn operand_errors() {
        let mut state = MachineState::new(0);
        let addr = Either::Right(SymExpr::var(SymVar::new("p", 32)));

        assert!(matches!(state.read_memory(&addr, 4), Err(Error::SymbolicAddress(_))));
        assert!(matches!(
            state.write_operand(&Operand::constant(0, 4), Either::Left(BitVec::zero(32))),
            Err(Error::ConstantDestination(_))
        ));
    }
}
