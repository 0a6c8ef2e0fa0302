//! IPF memory stack frame layout.
//!
//! # Frame Layout (growing downward, offsets from the adjusted sp)
//! ```text
//! ┌───────────────────────────────┐ High addresses
//! │     Save Area                 │ ← preserved registers saved to memory
//! ├───────────────────────────────┤
//! │     Spill Area                │ ← register allocator spills
//! ├───────────────────────────────┤
//! │     Outgoing Arguments        │ ← arguments beyond the eighth
//! ├───────────────────────────────┤
//! │     Scratch Area (16 bytes)   │ ← owned by callees
//! └───────────────────────────────┘ ← sp (16-byte aligned)
//! ```
//!
//! The prolog generator reserves save slots while it decides where each
//! preserved register lives; the final frame size is read only once every
//! step has run.

use super::registers::Reg;

/// A register saved to memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveSlot {
    pub reg: Reg,
    /// Offset from the adjusted sp.
    pub offset: u32,
    pub size: u32,
}

/// Layout of a method's memory stack frame.
#[derive(Debug, Clone, Default)]
pub struct FrameLayout {
    outgoing_size: u32,
    spill_size: u32,
    save_size: u32,
    slots: Vec<SaveSlot>,
}

impl FrameLayout {
    /// Scratch area every frame leaves for its callees.
    pub const SCRATCH_SIZE: u32 = 16;
    pub const ALIGN: u32 = 16;
    pub const SLOT_SIZE: u32 = 8;

    /// `outgoing_args` counts every argument of the widest call; the first
    /// eight travel in registers.
    pub fn new(outgoing_args: u32, spill_slots: u32) -> Self {
        let stack_args = outgoing_args.saturating_sub(Reg::MAX_REG_ARGS as u32);
        FrameLayout {
            outgoing_size: stack_args * Self::SLOT_SIZE,
            spill_size: spill_slots * Self::SLOT_SIZE,
            save_size: 0,
            slots: Vec::new(),
        }
    }

    /// Offset of the outgoing argument area.
    #[inline]
    pub fn outgoing_base(&self) -> u32 {
        Self::SCRATCH_SIZE
    }

    #[inline]
    pub fn spill_base(&self) -> u32 {
        self.outgoing_base() + self.outgoing_size
    }

    #[inline]
    pub fn save_base(&self) -> u32 {
        self.spill_base() + self.spill_size
    }

    /// Reserve a save slot for `reg`. Floating-point saves take 16 bytes.
    pub fn reserve_save(&mut self, reg: Reg) -> u32 {
        let size = if matches!(reg, Reg::Fr(_)) { 16 } else { Self::SLOT_SIZE };
        let start = align(self.save_size, size);
        self.save_size = start + size;
        let slot = SaveSlot {
            reg,
            offset: self.save_base() + start,
            size,
        };
        self.slots.push(slot);
        slot.offset
    }

    pub fn slot_of(&self, reg: Reg) -> Option<&SaveSlot> {
        self.slots.iter().find(|s| s.reg == reg)
    }

    pub fn slots(&self) -> &[SaveSlot] {
        &self.slots
    }

    /// Whether the method needs a memory frame at all.
    pub fn is_empty(&self) -> bool {
        self.outgoing_size == 0 && self.spill_size == 0 && self.save_size == 0
    }

    /// Total size, 16-byte aligned. Zero when nothing lives in memory.
    pub fn size(&self) -> u32 {
        if self.is_empty() {
            return 0;
        }
        align(self.save_base() + self.save_size, Self::ALIGN)
    }
}

#[inline]
fn align(n: u32, to: u32) -> u32 {
    (n + to - 1) & !(to - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_frame_has_no_size() {
        let f = FrameLayout::new(4, 0);
        assert!(f.is_empty());
        assert_eq!(f.size(), 0);
    }

    #[test]
    fn test_areas_stack_up_in_order() {
        let mut f = FrameLayout::new(10, 2);
        assert_eq!(f.outgoing_base(), 16);
        assert_eq!(f.spill_base(), 32);
        assert_eq!(f.save_base(), 48);
        let a = f.reserve_save(Reg::Gr(4));
        let b = f.reserve_save(Reg::Fr(16));
        assert_eq!(a, 48);
        // Float slot realigned to 16.
        assert_eq!(b, 64);
        assert_eq!(f.size(), 80);
        assert_eq!(f.size() % FrameLayout::ALIGN, 0);
        assert_eq!(f.slot_of(Reg::Fr(16)).map(|s| s.size), Some(16));
    }
}
