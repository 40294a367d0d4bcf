//! The VM-facing output of compilation (spec §3 "Program (output)").
//!
//! The VDBE interpreter that executes this `Program` is an external
//! collaborator (spec §1); this module only defines the data it consumes.

pub mod builder;
pub mod insn;

use std::collections::BTreeMap;

use crate::value::Value;
use insn::Insn;

pub type CursorId = usize;
pub type InsnRef = u32;

/// A unique forward-jump placeholder, allocated before its target address is
/// known and resolved exactly once (spec §4.1, §4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Placeholder(pub u32);

/// A jump target: either a concrete instruction index or a not-yet-resolved
/// placeholder. `resolve_address` rewrites every `Pending` occurrence of a
/// given placeholder to `Resolved` (spec §9 redesign note).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addr {
    Resolved(InsnRef),
    Pending(Placeholder),
}

impl Addr {
    pub fn as_resolved(&self) -> Option<InsnRef> {
        match self {
            Addr::Resolved(r) => Some(*r),
            Addr::Pending(_) => None,
        }
    }
}

/// Which instruction buffer an `emit` call targets (spec §9 redesign note:
/// "subroutine buffer toggled by a depth counter -> an explicit EmitTarget").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitTarget {
    Main,
    Subroutine(SubroutineId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubroutineId(pub u32);

/// A parameter's textual or positional key (spec §3, §6 "Emitted parameter
/// mapping").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParamKey {
    Positional(u32),
    Named(String),
}

#[derive(Debug, Clone, Default)]
pub struct ParameterMap {
    map: BTreeMap<ParamKey, usize>,
}

impl ParameterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the register assigned to this parameter key, reusing the
    /// existing register if the key has already been bound (duplicate
    /// occurrences of the same parameter reuse the same slot, per spec §6).
    pub fn register_for(&mut self, key: ParamKey, alloc: impl FnOnce() -> usize) -> usize {
        if let Some(reg) = self.map.get(&key) {
            return *reg;
        }
        let reg = alloc();
        self.map.insert(key, reg);
        reg
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParamKey, &usize)> {
        self.map.iter()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// The compiled program: an ordered instruction array plus metadata a VDBE
/// instance needs to execute it (spec §3).
#[derive(Debug, Clone)]
pub struct Program {
    pub instructions: Vec<Insn>,
    pub constants: Vec<Value>,
    pub num_registers: usize,
    pub num_cursors: usize,
    pub parameters: ParameterMap,
    pub column_names: Vec<String>,
    pub sql: String,
}

impl Program {
    /// Spec §8 invariant: exactly one `Halt`.
    pub fn halt_count(&self) -> usize {
        self.instructions
            .iter()
            .filter(|i| matches!(i, Insn::Halt { .. }))
            .count()
    }

    /// Spec §8 invariant: no unresolved placeholder survives to a finished program.
    pub fn has_unresolved_jumps(&self) -> bool {
        self.instructions.iter().any(|insn| {
            let mut insn = insn.clone();
            insn.jump_targets_mut()
                .iter()
                .any(|addr| addr.as_resolved().is_none())
        })
    }
}
