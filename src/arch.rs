use crate::ir::Register;

pub mod defaults {
    pub const INITIAL_STACK_POINTER: u64 = 0x7ffe_0000;
}

pub mod x86 {
    use crate::ir::Register;

    pub const EAX: Register = Register::new(0, "eax");
    pub const ECX: Register = Register::new(1, "ecx");
    pub const EDX: Register = Register::new(2, "edx");
    pub const EBX: Register = Register::new(3, "ebx");
    pub const ESP: Register = Register::new(4, "esp");
    pub const EBP: Register = Register::new(5, "ebp");
    pub const ESI: Register = Register::new(6, "esi");
    pub const EDI: Register = Register::new(7, "edi");

    pub const ADDRESS_SIZE: usize = 4;
}

/// Register roles and stack geometry the state constructor and the
/// call/return semantics rely on. Little-endian only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Convention {
    pub stack_pointer: Register,
    pub base_pointer: Register,
    pub address_size: usize,
    pub initial_stack_pointer: u64,
}

impl Default for Convention {
    fn default() -> Self {
        Self::x86()
    }
}

impl Convention {
    pub fn x86() -> Self {
        Self {
            stack_pointer: x86::ESP,
            base_pointer: x86::EBP,
            address_size: x86::ADDRESS_SIZE,
            initial_stack_pointer: defaults::INITIAL_STACK_POINTER,
        }
    }

    pub fn with_initial_stack_pointer(mut self, sp: u64) -> Self {
        self.initial_stack_pointer = sp;
        self
    }

    pub fn address_bits(&self) -> u32 {
        self.address_size as u32 * 8
    }
}
