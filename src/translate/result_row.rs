//! Shared LIMIT/OFFSET register bookkeeping and the final `ResultRow` emission
//! used by every output stage (direct rows, aggregate finalize, window pass,
//! ORDER BY sorter drain) (spec §4.6 "LIMIT/OFFSET").

use sqlparser::ast::Expr;

use crate::catalog::Catalog;
use crate::vdbe::builder::{PlaceholderPurpose, ProgramBuilder};
use crate::vdbe::insn::Insn;
use crate::vdbe::Addr;
use crate::Result;

use super::expr::{translate_expr, ExprCtx};

/// Registers holding the remaining OFFSET/LIMIT counters (spec §4.6: "Each
/// emitted row decrements the offset first... and then the limit").
#[derive(Debug, Clone, Copy)]
pub struct LimitRegs {
    pub offset: Option<usize>,
    pub limit: Option<usize>,
    /// A register holding the constant `1`, shared by every decrement.
    pub one: usize,
}

/// Evaluates LIMIT/OFFSET expressions (if present) into fresh registers.
/// Returns `None` only when neither clause is present, so callers can treat
/// "no limiting" as a cheap no-op path.
pub fn init_limit_regs(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    ctx: &ExprCtx,
    limit: Option<&Expr>,
    offset: Option<&Expr>,
) -> Result<Option<LimitRegs>> {
    if limit.is_none() && offset.is_none() {
        return Ok(None);
    }
    let one = program.allocate_register();
    program.emit(Insn::Integer { value: 1, dest: one });
    let offset_reg = match offset {
        Some(e) => {
            let r = program.allocate_register();
            translate_expr(program, catalog, ctx, e, r)?;
            Some(r)
        }
        None => None,
    };
    let limit_reg = match limit {
        Some(e) => {
            let r = program.allocate_register();
            translate_expr(program, catalog, ctx, e, r)?;
            Some(r)
        }
        None => None,
    };
    Ok(Some(LimitRegs {
        offset: offset_reg,
        limit: limit_reg,
        one,
    }))
}

/// Emits one result row from `[start_reg, start_reg+count)`, honoring
/// OFFSET (skip-and-decrement) and LIMIT (skip once exhausted, decrement
/// after emitting). Boundary case `OFFSET 0 LIMIT 0`: `limit` starts at 0,
/// so every row is skipped and nothing is ever emitted (spec §8).
pub fn emit_output_row(
    program: &mut ProgramBuilder,
    limits: &Option<LimitRegs>,
    start_reg: usize,
    count: usize,
) -> Result<()> {
    let skip = program.allocate_address(PlaceholderPurpose::Generic);
    if let Some(l) = limits {
        if let Some(offset_reg) = l.offset {
            let proceed = program.allocate_address(PlaceholderPurpose::Generic);
            program.emit(Insn::IfZero {
                reg: offset_reg,
                target_pc: Addr::Pending(proceed),
            });
            program.emit(Insn::Subtract {
                lhs: offset_reg,
                rhs: l.one,
                dest: offset_reg,
            });
            program.emit(Insn::Goto {
                target_pc: Addr::Pending(skip),
            });
            program.resolve_address(proceed)?;
        }
        if let Some(limit_reg) = l.limit {
            program.emit(Insn::IfZero {
                reg: limit_reg,
                target_pc: Addr::Pending(skip),
            });
        }
    }
    program.emit(Insn::ResultRow { start_reg, count });
    if let Some(l) = limits {
        if let Some(limit_reg) = l.limit {
            program.emit(Insn::Subtract {
                lhs: limit_reg,
                rhs: l.one,
                dest: limit_reg,
            });
        }
    }
    program.resolve_address(skip)?;
    Ok(())
}
