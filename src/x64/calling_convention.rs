// This module implements the System V AMD64 calling convention for the word-sized values of
// the JIT IR. SysVAssigner hands out the argument registers RDI, RSI, RDX, RCX, R8 and R9 in
// order and places remaining arguments in 8-byte stack slots above the return address; the
// return value lives in RAX. FunctionFrame lays out the stack frame of a generated function:
// every SSA value owns an 8-byte slot below the saved frame pointer, and the frame is padded
// to keep RSP 16-byte aligned at call sites as the ABI requires. Slot tables are allocated in
// the per-function bumpalo arena.

//! System V x86-64 calling convention implementation.

use crate::x64::encoder::AsmReg;
use bumpalo::{collections::Vec as BumpVec, Bump};

/// Where an argument or return value is passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CCAssignment {
    pub reg: Option<AsmReg>,
    /// Offset from the first stack argument slot.
    pub stack_off: Option<i32>,
}

/// Trait for calling convention argument assignment.
pub trait CCAssigner {
    /// Assign the next argument.
    fn assign_arg(&mut self) -> CCAssignment;

    /// Assign the return value.
    fn assign_ret(&mut self) -> CCAssignment;

    /// Reset state for a new signature.
    fn reset(&mut self);

    /// Stack bytes used by arguments, 16-byte aligned.
    fn stack_size(&self) -> u32;
}

/// System V x86-64 calling convention assigner.
#[derive(Debug, Default)]
pub struct SysVAssigner {
    gp_cnt: usize,
    stack: u32,
}

impl SysVAssigner {
    pub const GP_ARG_REGS: [AsmReg; 6] = [
        AsmReg::RDI,
        AsmReg::RSI,
        AsmReg::RDX,
        AsmReg::RCX,
        AsmReg::R8,
        AsmReg::R9,
    ];

    pub const RET_REG: AsmReg = AsmReg::RAX;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn gp_used(&self) -> usize {
        self.gp_cnt
    }

    /// Assign `count` word arguments in order.
    pub fn assign_all(&mut self, count: usize) -> Vec<CCAssignment> {
        (0..count).map(|_| self.assign_arg()).collect()
    }
}

impl CCAssigner for SysVAssigner {
    fn assign_arg(&mut self) -> CCAssignment {
        if self.gp_cnt < Self::GP_ARG_REGS.len() {
            let reg = Self::GP_ARG_REGS[self.gp_cnt];
            self.gp_cnt += 1;
            CCAssignment {
                reg: Some(reg),
                stack_off: None,
            }
        } else {
            let off = self.stack as i32;
            self.stack += 8;
            CCAssignment {
                reg: None,
                stack_off: Some(off),
            }
        }
    }

    fn assign_ret(&mut self) -> CCAssignment {
        CCAssignment {
            reg: Some(Self::RET_REG),
            stack_off: None,
        }
    }

    fn reset(&mut self) {
        self.gp_cnt = 0;
        self.stack = 0;
    }

    fn stack_size(&self) -> u32 {
        self.stack.div_ceil(16) * 16
    }
}

/// Stack frame of a generated function.
///
/// Layout relative to RBP:
///
/// ```text
/// rbp + 16 + 8*k   incoming stack argument k
/// rbp + 8          return address
/// rbp              saved rbp
/// rbp - 8*(i+1)    slot of value i
/// ```
#[derive(Debug)]
pub struct FunctionFrame<'a> {
    /// RBP-relative slot offset per value index.
    slots: BumpVec<'a, i32>,
    pub frame_size: u32,
}

impl<'a> FunctionFrame<'a> {
    /// Frame with one slot for each of `value_count` values.
    pub fn new(arena: &'a Bump, value_count: usize) -> Self {
        let mut slots = BumpVec::with_capacity_in(value_count, arena);
        for i in 0..value_count {
            slots.push(-8 * (i as i32 + 1));
        }
        let frame_size = (value_count as u32 * 8).div_ceil(16) * 16;
        Self { slots, frame_size }
    }

    pub fn slot(&self, value_index: usize) -> i32 {
        self.slots[value_index]
    }

    /// RBP-relative offset of incoming stack argument at `stack_off`.
    pub fn incoming_arg_offset(stack_off: i32) -> i32 {
        16 + stack_off
    }
}
