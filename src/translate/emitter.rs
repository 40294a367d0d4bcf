//! Shared low-level helpers (spec §2 item 10 "Helpers"): the nested-loop
//! join scaffold, LEFT JOIN null-padding, and WHERE-residual verification.
//! Factored out so `select`, `subquery` and `cte` all drive the same join
//! engine instead of re-deriving it per consumer (spec §9 redesign note on
//! computing shared state once).

use crate::catalog::Catalog;
use crate::vdbe::builder::{CursorPlan, PlaceholderPurpose, ProgramBuilder};
use crate::vdbe::{Addr, CursorId};
use crate::Result;

use super::expr::{translate_expr, ExprCtx};
use super::plan::{JoinConstraint, JoinKind, JoinedTable, WhereTerm};

/// Drives the nested-loop scaffold over `tables` (spec §4.5) and invokes
/// `row` once per fully-joined, WHERE-residual-satisfying combination. `row`
/// receives an `ExprCtx` scoped to the whole table list with the correct
/// null-padded-cursor set for the combination currently being visited.
pub fn compile_nested_loop(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    tables: &[JoinedTable],
    where_terms: &[WhereTerm],
    row: &mut dyn FnMut(&mut ProgramBuilder, &ExprCtx) -> Result<()>,
) -> Result<()> {
    let mut null_cursors: Vec<CursorId> = Vec::new();
    compile_level(program, catalog, tables, 0, where_terms, &mut null_cursors, row)
}

fn compile_level(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    tables: &[JoinedTable],
    idx: usize,
    where_terms: &[WhereTerm],
    null_cursors: &mut Vec<CursorId>,
    row: &mut dyn FnMut(&mut ProgramBuilder, &ExprCtx) -> Result<()>,
) -> Result<()> {
    if idx == tables.len() {
        return dispatch_row(program, catalog, tables, where_terms, null_cursors, row);
    }

    let table = tables[idx].clone();
    let is_left = table.join_kind == JoinKind::Left;
    let match_flag = if is_left {
        let r = program.allocate_register();
        program.emit(crate::vdbe::insn::Insn::Integer { value: 0, dest: r });
        Some(r)
    } else {
        None
    };

    let eof = program.allocate_address(PlaceholderPurpose::Eof);
    let join_fail = program.allocate_address(PlaceholderPurpose::JoinFail);

    let plan = program.cursor_plans.get(&table.cursor).cloned();
    let (constraint_exprs, idx_num, idx_str) = match &plan {
        Some(p) => (p.constraint_exprs.clone(), p.idx_num, p.idx_str.clone()),
        None => (Vec::new(), 0, None),
    };
    let args_start = if constraint_exprs.is_empty() {
        0
    } else {
        program.allocate_registers(constraint_exprs.len())
    };
    for (i, e) in constraint_exprs.iter().enumerate() {
        let outer_ctx = ExprCtx::new(&tables[..idx]).with_null_cursors(null_cursors);
        translate_expr(program, catalog, &outer_ctx, e, args_start + i)?;
    }
    program.emit(crate::vdbe::insn::Insn::VFilter {
        cursor_id: table.cursor,
        pc_if_empty: Addr::Pending(eof),
        args_start_reg: args_start,
        plan: crate::vdbe::insn::VFilterPlan {
            idx_num,
            idx_str,
            n_args: constraint_exprs.len(),
        },
    });
    let loop_start = program.current_address();

    match &table.constraint {
        JoinConstraint::On(expr) => {
            let scope = ExprCtx::new(&tables[..=idx]).with_null_cursors(null_cursors);
            let v = program.allocate_register();
            translate_expr(program, catalog, &scope, expr, v)?;
            program.emit(crate::vdbe::insn::Insn::IfFalse {
                reg: v,
                target_pc: Addr::Pending(join_fail),
                jump_if_null: true,
            });
        }
        JoinConstraint::Using(cols) => {
            for col in cols {
                if let Some((lcursor, lidx)) = find_earlier_column(&tables[..idx], col) {
                    let ridx = match table.schema.column_index(col) {
                        Some(i) => i,
                        None => continue,
                    };
                    let a = program.allocate_register();
                    let b = program.allocate_register();
                    if null_cursors.contains(&lcursor) {
                        program.emit(crate::vdbe::insn::Insn::Null { dest: a, dest_end: None });
                    } else {
                        program.emit(crate::vdbe::insn::Insn::VColumn { cursor_id: lcursor, column: lidx, dest: a });
                    }
                    program.emit(crate::vdbe::insn::Insn::VColumn { cursor_id: table.cursor, column: ridx, dest: b });
                    program.emit(crate::vdbe::insn::Insn::IsNull { reg: a, target_pc: Addr::Pending(join_fail) });
                    program.emit(crate::vdbe::insn::Insn::IsNull { reg: b, target_pc: Addr::Pending(join_fail) });
                    let ok = program.allocate_address(PlaceholderPurpose::Generic);
                    program.emit(crate::vdbe::insn::Insn::Eq {
                        lhs: a,
                        rhs: b,
                        target_pc: Addr::Pending(ok),
                        flags: Default::default(),
                    });
                    program.emit(crate::vdbe::insn::Insn::Goto { target_pc: Addr::Pending(join_fail) });
                    program.resolve_address(ok)?;
                }
            }
        }
        JoinConstraint::None => {}
    }
    if let Some(mf) = match_flag {
        program.emit(crate::vdbe::insn::Insn::Integer { value: 1, dest: mf });
    }

    compile_level(program, catalog, tables, idx + 1, where_terms, null_cursors, row)?;

    program.resolve_address(join_fail)?;
    program.emit(crate::vdbe::insn::Insn::VNext { cursor_id: table.cursor, pc_if_next: loop_start });
    program.resolve_address(eof)?;

    if let Some(mf) = match_flag {
        let has_match = program.allocate_address(PlaceholderPurpose::Generic);
        program.emit(crate::vdbe::insn::Insn::IfTrue {
            reg: mf,
            target_pc: Addr::Pending(has_match),
            jump_if_null: false,
        });
        null_cursors.push(table.cursor);
        compile_level(program, catalog, tables, idx + 1, where_terms, null_cursors, row)?;
        null_cursors.pop();
        program.resolve_address(has_match)?;
        program.emit(crate::vdbe::insn::Insn::Integer { value: 0, dest: mf });
    }

    Ok(())
}

fn find_earlier_column(tables: &[JoinedTable], col: &str) -> Option<(CursorId, usize)> {
    for t in tables.iter().rev() {
        if let Some(idx) = t.schema.column_index(col) {
            return Some((t.cursor, idx));
        }
    }
    None
}

fn dispatch_row(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    tables: &[JoinedTable],
    where_terms: &[WhereTerm],
    null_cursors: &[CursorId],
    row: &mut dyn FnMut(&mut ProgramBuilder, &ExprCtx) -> Result<()>,
) -> Result<()> {
    let ctx = ExprCtx::new(tables).with_null_cursors(null_cursors);
    let skip = program.allocate_address(PlaceholderPurpose::Generic);
    for term in where_terms {
        if term.consumed {
            continue;
        }
        let v = program.allocate_register();
        translate_expr(program, catalog, &ctx, &term.expr, v)?;
        program.emit(crate::vdbe::insn::Insn::IfFalse {
            reg: v,
            target_pc: Addr::Pending(skip),
            jump_if_null: true,
        });
    }
    row(program, &ctx)?;
    program.resolve_address(skip)?;
    Ok(())
}

/// Looks up a cursor's access plan, defaulting to an unplanned full scan
/// (used by consumers that call `compile_nested_loop` on a table list the
/// planner hasn't seen, e.g. the non-correlated side of a subquery).
pub fn plan_or_full_scan(program: &ProgramBuilder, cursor: CursorId) -> Option<CursorPlan> {
    program.cursor_plans.get(&cursor).cloned()
}
