//! Declared stack-frame layout for mid-function entry points.
//!
//! Entering after a function's prologue means the frame has to be rebuilt
//! by hand. The layout lists every slot by its offset below the base
//! pointer, including compiler padding between locals, and is checked in
//! full before any state is built from it.

use std::collections::BTreeSet;

use either::Either;

use itertools::Itertools;

use thiserror::Error;

use crate::bv::BitVec;
use crate::expr::{SymExpr, SymVar};
use crate::state::Value;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("{name} is {bits} bits wide; stack slots must be whole bytes")]
    UnalignedWidth { name: String, bits: u32 },
    #[error("{size}-byte slot at {} lies outside the {allocation:#x}-byte frame", bp(.offset))]
    OutsideFrame { offset: i64, size: u64, allocation: u64 },
    #[error("zero-length slot at {}", bp(.offset))]
    EmptySlot { offset: i64 },
    #[error("slot at {} overlaps slot at {}", bp(.first), bp(.second))]
    Overlap { first: i64, second: i64 },
    #[error("layout declares {declared:#x} bytes but the prologue reserves {allocation:#x}")]
    SizeMismatch { declared: u64, allocation: u64 },
    #[error("symbol {0} is placed more than once")]
    DuplicateSymbol(String),
    #[error("no entry address configured")]
    MissingEntry,
    #[error("no instruction at entry address {0:#x}")]
    InvalidEntry(u64),
}

fn bp(offset: &i64) -> String {
    let sign = if *offset < 0 { '-' } else { '+' };
    format!("bp{}{:#x}", sign, offset.unsigned_abs())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotValue {
    Symbolic(SymVar),
    Concrete(BitVec),
}

impl SlotValue {
    pub fn bits(&self) -> u32 {
        match self {
            Self::Symbolic(var) => var.bits(),
            Self::Concrete(bv) => bv.bits(),
        }
    }

    fn size(&self) -> u64 {
        self.bits().div_ceil(8) as u64
    }

    fn describe(&self) -> String {
        match self {
            Self::Symbolic(var) => var.name().to_owned(),
            Self::Concrete(bv) => bv.to_string(),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Symbolic(var) => Either::Right(SymExpr::var(var.clone())),
            Self::Concrete(bv) => Either::Left(*bv),
        }
    }
}

impl From<SymVar> for SlotValue {
    fn from(var: SymVar) -> Self {
        Self::Symbolic(var)
    }
}

impl From<BitVec> for SlotValue {
    fn from(bv: BitVec) -> Self {
        Self::Concrete(bv)
    }
}

/// `value` is `None` for padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub offset: i64,
    pub size: u64,
    pub value: Option<SlotValue>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLayout {
    allocation: u64,
    slots: Vec<Slot>,
    cursor: i64,
}

impl FrameLayout {
    /// `allocation` is the byte count the skipped prologue subtracts from
    /// the stack pointer.
    pub fn new(allocation: u64) -> Self {
        Self {
            allocation,
            slots: Vec::new(),
            cursor: 0,
        }
    }

    /// Next slot downward from the lowest one laid out so far.
    pub fn push<V: Into<SlotValue>>(mut self, value: V) -> Self {
        let value = value.into();
        let size = value.size();
        self.cursor -= size as i64;
        self.slots.push(Slot {
            offset: self.cursor,
            size,
            value: Some(value),
        });
        self
    }

    pub fn pad(mut self, len: u64) -> Self {
        self.cursor -= len as i64;
        self.slots.push(Slot {
            offset: self.cursor,
            size: len,
            value: None,
        });
        self
    }

    /// Slot at an explicit base-pointer-relative (negative) offset.
    pub fn place<V: Into<SlotValue>>(mut self, offset: i64, value: V) -> Self {
        let value = value.into();
        let size = value.size();
        self.cursor = self.cursor.min(offset);
        self.slots.push(Slot {
            offset,
            size,
            value: Some(value),
        });
        self
    }

    pub fn pad_at(mut self, offset: i64, len: u64) -> Self {
        self.cursor = self.cursor.min(offset);
        self.slots.push(Slot {
            offset,
            size: len,
            value: None,
        });
        self
    }

    pub fn allocation(&self) -> u64 {
        self.allocation
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Declared symbols, in declaration order.
    pub fn symbols(&self) -> Vec<SymVar> {
        self.slots
            .iter()
            .filter_map(|slot| match slot.value {
                Some(SlotValue::Symbolic(ref var)) => Some(var.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn offset_of(&self, var: &SymVar) -> Option<i64> {
        self.slots.iter().find_map(|slot| match slot.value {
            Some(SlotValue::Symbolic(ref v)) if v == var => Some(slot.offset),
            _ => None,
        })
    }

    pub fn validate(&self) -> Result<(), Error> {
        let mut names = BTreeSet::new();
        for var in self.symbols() {
            if !names.insert(var.name().to_owned()) {
                return Err(Error::DuplicateSymbol(var.name().to_owned()));
            }
        }

        for slot in self.slots.iter() {
            if let Some(ref value) = slot.value {
                if value.bits() % 8 != 0 {
                    return Err(Error::UnalignedWidth {
                        name: value.describe(),
                        bits: value.bits(),
                    });
                }
            }

            if slot.size == 0 {
                return Err(Error::EmptySlot { offset: slot.offset });
            }

            let end = slot.offset + slot.size as i64;
            if slot.offset < -(self.allocation as i64) || end > 0 {
                return Err(Error::OutsideFrame {
                    offset: slot.offset,
                    size: slot.size,
                    allocation: self.allocation,
                });
            }
        }

        let sorted = self.slots.iter().sorted_by_key(|slot| slot.offset).collect::<Vec<_>>();
        for (lo, hi) in sorted.iter().tuple_windows() {
            if lo.offset + lo.size as i64 > hi.offset {
                return Err(Error::Overlap {
                    first: hi.offset,
                    second: lo.offset,
                });
            }
        }

        let declared = self.slots.iter().map(|slot| slot.size).sum::<u64>();
        if declared != self.allocation {
            return Err(Error::SizeMismatch {
                declared,
                allocation: self.allocation,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(name: &str) -> SymVar {
        SymVar::new(name, 32)
    }

    #[test]
    fn push_lays_out_downward() {
        let layout = FrameLayout::new(0x18)
            .pad(8)
            .push(word("p1"))
            .push(word("p0"))
            .push(word("p2"))
            .push(word("p3"));

        assert_eq!(layout.validate(), Ok(()));
        assert_eq!(layout.offset_of(&word("p0")), Some(-0x10));
        assert_eq!(layout.offset_of(&word("p1")), Some(-0xc));
        assert_eq!(layout.offset_of(&word("p2")), Some(-0x14));
        assert_eq!(layout.offset_of(&word("p3")), Some(-0x18));
        assert_eq!(layout.symbols().len(), 4);
    }

    #[test]
    fn explicit_placement() {
        let layout = FrameLayout::new(0x10)
            .place(-0x10, word("a"))
            .pad_at(-0xc, 4)
            .place(-0x8, BitVec::new(0x41, 64));
        assert_eq!(layout.validate(), Ok(()));
    }

    #[test]
    fn size_mismatch_is_a_configuration_error() {
        let layout = FrameLayout::new(0x18).push(word("p0")).push(word("p1"));
        assert_eq!(
            layout.validate(),
            Err(Error::SizeMismatch {
                declared: 8,
                allocation: 0x18
            })
        );
    }

    #[test]
    fn rejects_malformed_layouts() {
        let overlap = FrameLayout::new(8).place(-8, word("a")).place(-6, word("b"));
        assert!(matches!(overlap.validate(), Err(Error::Overlap { .. })));

        let outside = FrameLayout::new(4).place(-8, word("a"));
        assert!(matches!(outside.validate(), Err(Error::OutsideFrame { offset: -8, .. })));

        let dup = FrameLayout::new(8).push(word("a")).push(word("a"));
        assert_eq!(dup.validate(), Err(Error::DuplicateSymbol("a".to_owned())));

        let odd = FrameLayout::new(2).push(SymVar::new("flag", 12));
        assert!(matches!(odd.validate(), Err(Error::UnalignedWidth { bits: 12, .. })));
    }

    #[test]
    fn error_messages_carry_the_offset_sign() {
        let e = Error::Overlap { first: -6, second: -8 };
        assert_eq!(e.to_string(), "slot at bp-0x6 overlaps slot at bp-0x8");

        let e = FrameLayout::new(4).place(4, SymVar::new("a", 32)).validate().unwrap_err();
        assert_eq!(
            e,
            Error::OutsideFrame {
                offset: 4,
                size: 4,
                allocation: 4
            }
        );
        assert_eq!(e.to_string(), "4-byte slot at bp+0x4 lies outside the 0x4-byte frame");
    }

    #[test]
    fn zero_length_padding_is_rejected() {
        let e = FrameLayout::new(4).push(SymVar::new("a", 32)).pad(0).validate().unwrap_err();
        assert_eq!(e, Error::EmptySlot { offset: -4 });
        assert_eq!(e.to_string(), "zero-length slot at bp-0x4");
    }
}
