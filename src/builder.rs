use either::Either;

use log::debug;

use crate::arch::Convention;
use crate::bv::BitVec;
use crate::frame::{Error, FrameLayout};
use crate::ir::{Program, Register};
use crate::state::{MachineState, Value};

/// Builds the root state for an entry point past a function's prologue.
///
/// The effect of the skipped `mov ebp, esp; sub esp, N` is reproduced by
/// hand: the base pointer takes the initial stack pointer, the stack pointer
/// drops by the frame allocation, and every declared slot is written at its
/// base-pointer-relative offset.
pub struct StateBuilder<'a, P: Program + ?Sized> {
    program: &'a P,
    convention: Convention,
    entry: Option<u64>,
    frame: Option<FrameLayout>,
    registers: Vec<(Register, Value)>,
}

impl<'a, P: Program + ?Sized> StateBuilder<'a, P> {
    pub fn new(program: &'a P, convention: Convention) -> Self {
        Self {
            program,
            convention,
            entry: None,
            frame: None,
            registers: Vec::new(),
        }
    }

    pub fn entry(mut self, address: u64) -> Self {
        self.entry = Some(address);
        self
    }

    pub fn frame(mut self, layout: FrameLayout) -> Self {
        self.frame = Some(layout);
        self
    }

    /// Initial value for a register other than the stack and base pointer.
    pub fn register(mut self, register: Register, value: Value) -> Self {
        self.registers.push((register, value));
        self
    }

    pub fn build(self) -> Result<MachineState, Error> {
        let entry = self.entry.ok_or(Error::MissingEntry)?;
        if self.program.instruction(entry).is_none() {
            return Err(Error::InvalidEntry(entry));
        }

        let layout = self.frame.unwrap_or_else(|| FrameLayout::new(0));
        layout.validate()?;

        let mut state = MachineState::new(entry);

        for segment in self.program.segments() {
            state.memory_mut().write_bytes(segment.base, &segment.bytes);
        }

        for (register, value) in self.registers {
            state.write_register(register, value);
        }

        let bits = self.convention.address_bits();
        let bp = self.convention.initial_stack_pointer;
        let sp = bp.wrapping_sub(layout.allocation());

        state.write_register(self.convention.base_pointer, Either::Left(BitVec::new(bp, bits)));
        state.write_register(self.convention.stack_pointer, Either::Left(BitVec::new(sp, bits)));

        for slot in layout.slots() {
            if let Some(ref value) = slot.value {
                let address = bp.wrapping_add_signed(slot.offset);
                state
                    .memory_mut()
                    .write(address, &value.to_value())
                    .map_err(|_| Error::OutsideFrame {
                        offset: slot.offset,
                        size: slot.size,
                        allocation: layout.allocation(),
                    })?;
            }
        }

        debug!(
            "root state at {:#x}: {}={:#x}, {}={:#x}, {} symbol(s)",
            entry,
            self.convention.base_pointer,
            bp,
            self.convention.stack_pointer,
            sp,
            layout.symbols().len(),
        );

        Ok(state)
    }
}
