//! The closed instruction set produced by the compiler (spec §6).
//!
//! Each opcode is a struct variant carrying its own typed operands rather
//! than the classic `(p1,p2,p3,p4,p5)` tuple: this is the redesign called
//! for in spec §9 ("dynamic any-typed P4 union -> a closed sum type with
//! variants... decoding is exhaustive"). Where the original design used a
//! generic P4 slot (function descriptor, vtab plan, update conflict mode,
//! collation, sort key), that payload is simply a typed field here.

use crate::catalog::ColumnSchema;
use crate::value::Affinity;
use crate::vdbe::{Addr, CursorId};
use crate::vtab::SortDirection;

/// Statement-level `ON CONFLICT` resolution (spec §4.8). Derives
/// `strum`'s `Display`/`EnumString` so the mode round-trips through the
/// `INSERT OR <mode>` surface syntax and EXPLAIN-comment stringification
/// without a hand-written match in each direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(ascii_case_insensitive)]
pub enum ConflictMode {
    Rollback,
    Abort,
    Fail,
    Ignore,
    Replace,
}

impl Default for ConflictMode {
    fn default() -> Self {
        ConflictMode::Abort
    }
}

/// A register reference that is either absolute, frame-relative (spec §4.4
/// subroutine calling convention: "arguments are read at negative FP
/// offsets"), or a stack-absolute index (the caller's view of a value it
/// pushed, per spec §3 `stack_pointer` bookkeeping).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegRef {
    Absolute(usize),
    FrameRelative(i32),
    StackAbsolute(usize),
}

impl From<usize> for RegRef {
    fn from(v: usize) -> Self {
        RegRef::Absolute(v)
    }
}

/// NULL-handling flags for comparison opcodes (mirrors the teacher's
/// `CmpInsFlags`): by default any NULL operand makes the comparison false
/// (and, for `IS`/`IS NOT`, NULL is equal to NULL).
#[derive(Debug, Clone, Copy, Default)]
pub struct CmpFlags {
    pub null_eq: bool,
    pub jump_if_null: bool,
}

/// A function descriptor attached to `Function`/`AggStep`/`AggFinal`.
#[derive(Debug, Clone)]
pub struct FuncDef {
    pub name: String,
    pub num_args: usize,
}

/// The plan handed to `VFilter`, produced by the planner (spec §4.2).
#[derive(Debug, Clone)]
pub struct VFilterPlan {
    pub idx_num: i32,
    pub idx_str: Option<String>,
    pub n_args: usize,
}

/// Schema handle attached to `OpenRead`/`OpenWrite` for a virtual table.
#[derive(Debug, Clone)]
pub struct VtabHandle {
    pub table_name: String,
    pub module: String,
    pub columns: Vec<ColumnSchema>,
}

/// The composite sort key used by `Sort`/external-sort ephemeral tables.
#[derive(Debug, Clone)]
pub struct SortKey {
    pub key_indices: Vec<usize>,
    pub collations: Vec<Option<String>>,
    pub directions: Vec<SortDirection>,
}

#[derive(Debug, Clone)]
pub enum Insn {
    // ---- Control ----
    Init {
        target_pc: Addr,
    },
    Halt {
        err_code: i32,
        description: String,
    },
    Goto {
        target_pc: Addr,
    },
    /// Runs the guarded block exactly once per program execution (used to
    /// hoist compile-time-constant subexpressions past the main loop).
    Once {
        target_pc_if_already_run: Addr,
    },
    /// Calls into the subroutine buffer; `target_pc` is the callee's
    /// `FrameEnter`. `arg_count` values must already be on the stack.
    Subroutine {
        arg_count: usize,
        target_pc: Addr,
    },
    Return,
    /// Opens a new frame; `frame_size` is patched to
    /// `max_local_offset_in_frame + 1` when the subroutine ends.
    FrameEnter {
        frame_size: usize,
    },
    FrameLeave,
    /// Pushes register `reg` onto the call stack (caller side of a
    /// subroutine call, or to stash a return-value slot before `Subroutine`).
    Push {
        reg: usize,
    },
    /// Pops `count` stack-absolute slots pushed by the caller.
    StackPop {
        count: usize,
    },

    // ---- Arithmetic / logic / bitwise ----
    Add {
        lhs: usize,
        rhs: usize,
        dest: usize,
    },
    Subtract {
        lhs: usize,
        rhs: usize,
        dest: usize,
    },
    Multiply {
        lhs: usize,
        rhs: usize,
        dest: usize,
    },
    Divide {
        lhs: usize,
        rhs: usize,
        dest: usize,
    },
    Remainder {
        lhs: usize,
        rhs: usize,
        dest: usize,
    },
    Concat {
        lhs: usize,
        rhs: usize,
        dest: usize,
    },
    BitAnd {
        lhs: usize,
        rhs: usize,
        dest: usize,
    },
    BitOr {
        lhs: usize,
        rhs: usize,
        dest: usize,
    },
    BitNot {
        reg: usize,
        dest: usize,
    },
    ShiftLeft {
        lhs: usize,
        rhs: usize,
        dest: usize,
    },
    ShiftRight {
        lhs: usize,
        rhs: usize,
        dest: usize,
    },
    Negative {
        reg: usize,
        dest: usize,
    },
    Not {
        reg: usize,
        dest: usize,
    },

    // ---- Comparisons (jump on true) ----
    Eq {
        lhs: usize,
        rhs: usize,
        target_pc: Addr,
        flags: CmpFlags,
    },
    Ne {
        lhs: usize,
        rhs: usize,
        target_pc: Addr,
        flags: CmpFlags,
    },
    Lt {
        lhs: usize,
        rhs: usize,
        target_pc: Addr,
        flags: CmpFlags,
    },
    Le {
        lhs: usize,
        rhs: usize,
        target_pc: Addr,
        flags: CmpFlags,
    },
    Gt {
        lhs: usize,
        rhs: usize,
        target_pc: Addr,
        flags: CmpFlags,
    },
    Ge {
        lhs: usize,
        rhs: usize,
        target_pc: Addr,
        flags: CmpFlags,
    },

    // ---- Null tests and branches ----
    IsNull {
        reg: usize,
        target_pc: Addr,
    },
    NotNull {
        reg: usize,
        target_pc: Addr,
    },
    IfNull {
        reg: usize,
        target_pc: Addr,
    },
    IfNotNull {
        reg: usize,
        target_pc: Addr,
    },
    IfZero {
        reg: usize,
        target_pc: Addr,
    },
    IfTrue {
        reg: usize,
        target_pc: Addr,
        jump_if_null: bool,
    },
    IfFalse {
        reg: usize,
        target_pc: Addr,
        jump_if_null: bool,
    },

    // ---- Values ----
    Integer {
        value: i32,
        dest: usize,
    },
    Int64 {
        value: i64,
        dest: usize,
    },
    Real {
        value: f64,
        dest: usize,
    },
    String8 {
        value: String,
        dest: usize,
    },
    Blob {
        value: Vec<u8>,
        dest: usize,
    },
    Null {
        dest: usize,
        dest_end: Option<usize>,
    },
    /// Shallow-copy a register (used for subroutine argument/return-value
    /// passing and group-by/aggregate result projection). `src`/`dest` are
    /// `RegRef` rather than plain registers so this one opcode covers both
    /// ordinary copies and the frame-relative/stack-absolute addressing the
    /// subroutine calling convention needs (spec §4.4).
    SCopy {
        src: RegRef,
        dest: RegRef,
    },
    Move {
        src: usize,
        dest: usize,
        count: usize,
    },
    Affinity {
        start_reg: usize,
        count: usize,
        affinity: Affinity,
    },

    // ---- Virtual table ----
    OpenRead {
        cursor_id: CursorId,
        table: VtabHandle,
    },
    OpenWrite {
        cursor_id: CursorId,
        table: VtabHandle,
    },
    /// Opens an in-memory ephemeral table (sorter / set / CTE materialization).
    OpenEphemeral {
        cursor_id: CursorId,
        num_columns: usize,
        /// Column indices making up a PRIMARY KEY enforced with `conflict`.
        primary_key: Vec<usize>,
        conflict: ConflictMode,
    },
    Close {
        cursor_id: CursorId,
    },
    VFilter {
        cursor_id: CursorId,
        pc_if_empty: Addr,
        args_start_reg: usize,
        plan: VFilterPlan,
    },
    VNext {
        cursor_id: CursorId,
        pc_if_next: Addr,
    },
    VColumn {
        cursor_id: CursorId,
        column: usize,
        dest: usize,
    },
    VRowid {
        cursor_id: CursorId,
        dest: usize,
    },
    VUpdate {
        cursor_id: CursorId,
        /// `[rowid, col0, col1, ...]` register span (INSERT/UPDATE), or a
        /// single-register `[rowid]` span for DELETE.
        argv_start_reg: usize,
        argv_count: usize,
        conflict: ConflictMode,
    },
    VBegin {
        mode: TxMode,
    },
    VCommit,
    VRollback,
    VSavepoint {
        name: String,
    },
    VRelease {
        name: String,
    },
    VRollbackTo {
        name: String,
    },

    // ---- Aggregation ----
    AggReset,
    AggStep {
        key_reg: usize,
        start_reg: usize,
        arg_count: usize,
        func: FuncDef,
    },
    AggFinal {
        key_reg: usize,
        dest: usize,
        func: FuncDef,
    },
    AggIterate {
        pc_if_empty: Addr,
    },
    AggNext {
        pc_if_next: Addr,
    },
    AggKey {
        dest: usize,
    },
    AggContext {
        dest: usize,
    },
    AggGroupValue {
        index: usize,
        dest: usize,
    },
    AggGetContext {
        key_reg: usize,
        dest: usize,
    },
    AggGetAccumulatorByKey {
        key_reg: usize,
        func: FuncDef,
        dest: usize,
    },

    // ---- Sorting & records ----
    MakeRecord {
        start_reg: usize,
        count: usize,
        dest: usize,
    },
    Sort {
        cursor_id: CursorId,
        key: SortKey,
    },
    Rewind {
        cursor_id: CursorId,
        pc_if_empty: Addr,
    },
    SeekRowid {
        cursor_id: CursorId,
        rowid_reg: usize,
        target_pc: Addr,
    },
    SeekRelative {
        cursor_id: CursorId,
        offset: i64,
    },

    // ---- Output ----
    /// Emits one result row to the host from a contiguous register span.
    /// Not present in the opcode enumeration transcribed in spec §6, but
    /// required by the row-processor contracts of §4.6/§4.9; added here
    /// rather than overloading `MakeRecord`, matching how every row-oriented
    /// engine in the pack (including the teacher) surfaces a dedicated
    /// "emit a row" opcode.
    ResultRow {
        start_reg: usize,
        count: usize,
    },

    // ---- Functions & constraints ----
    Function {
        start_reg: usize,
        arg_count: usize,
        dest: usize,
        func: FuncDef,
    },
    ConstraintViolation {
        message: String,
        conflict: ConflictMode,
    },
    /// op: 0 = ROLLBACK TO, 1 = SAVEPOINT, 2 = RELEASE (spec §4.10).
    Savepoint {
        op: u8,
        name: String,
    },
    Noop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    Deferred,
    Immediate,
    Exclusive,
}

impl Insn {
    /// Returns the `Addr` fields the label resolver must patch (spec §4.1:
    /// "opcodes that store the jump target in P2 are fixed").
    pub fn jump_targets_mut(&mut self) -> Vec<&mut Addr> {
        match self {
            Insn::Init { target_pc }
            | Insn::Goto { target_pc }
            | Insn::Once {
                target_pc_if_already_run: target_pc,
            }
            | Insn::Subroutine { target_pc, .. }
            | Insn::IsNull { target_pc, .. }
            | Insn::NotNull { target_pc, .. }
            | Insn::IfNull { target_pc, .. }
            | Insn::IfNotNull { target_pc, .. }
            | Insn::IfZero { target_pc, .. }
            | Insn::IfTrue { target_pc, .. }
            | Insn::IfFalse { target_pc, .. }
            | Insn::Eq { target_pc, .. }
            | Insn::Ne { target_pc, .. }
            | Insn::Lt { target_pc, .. }
            | Insn::Le { target_pc, .. }
            | Insn::Gt { target_pc, .. }
            | Insn::Ge { target_pc, .. }
            | Insn::Rewind {
                pc_if_empty: target_pc,
                ..
            }
            | Insn::VFilter {
                pc_if_empty: target_pc,
                ..
            }
            | Insn::VNext {
                pc_if_next: target_pc,
                ..
            }
            | Insn::AggIterate {
                pc_if_empty: target_pc,
            }
            | Insn::AggNext {
                pc_if_next: target_pc,
            }
            | Insn::SeekRowid { target_pc, .. } => vec![target_pc],
            _ => vec![],
        }
    }
}
