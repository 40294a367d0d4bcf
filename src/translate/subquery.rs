//! Subquery compilation (spec §4.4): scalar subqueries, `IN (subquery)`,
//! comparison-vs-subquery (handled by `expr::translate_expr`'s ordinary
//! `Expr::Subquery` dispatch into `compile_scalar` below — a NULL or absent
//! row naturally yields NULL, which the comparison's own NULL propagation
//! then takes care of) and `EXISTS`.
//!
//! Uncorrelated subqueries are compiled inline, once, at the point of use.
//! Correlated subqueries are compiled once as a subroutine and invoked via
//! the stack-based calling convention (spec §4.4): the caller pushes the
//! correlated argument values plus placeholder result slots, calls
//! `Subroutine`, and reads results back by their stack-absolute index once
//! the call returns.

use std::collections::HashMap;

use sqlparser::ast::{Expr, Query, Select as AstSelect, SelectItem, SetExpr, TableFactor, TableWithJoins};

use crate::catalog::Catalog;
use crate::vdbe::builder::{PlaceholderPurpose, ProgramBuilder, SubroutineDef};
use crate::vdbe::insn::{ConflictMode, Insn, RegRef};
use crate::vdbe::{Addr, CursorId};
use crate::{bail_parse_error, Result};

use super::emitter::compile_nested_loop;
use super::expr::{translate_expr, ExprCtx};
use super::plan::{JoinedTable, WhereTerm};
use super::planner::{plan_cursors, split_conjuncts};

pub fn translate_subquery_expr(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    ctx: &ExprCtx,
    expr: &Expr,
    target: usize,
) -> Result<()> {
    match expr {
        Expr::Subquery(query) => compile_scalar(program, catalog, ctx, query, target),
        Expr::InSubquery {
            expr: lhs,
            subquery,
            negated,
        } => compile_in_subquery(program, catalog, ctx, lhs, subquery, *negated, target),
        Expr::Exists { subquery, negated } => compile_exists(program, catalog, ctx, subquery, *negated, target),
        _ => bail_parse_error!("translate_subquery_expr called on a non-subquery expression"),
    }
}

fn select_core(query: &Query) -> Result<&AstSelect> {
    match query.body.as_ref() {
        SetExpr::Select(s) => Ok(s),
        _ => bail_parse_error!("only a simple SELECT is supported in subquery position"),
    }
}

fn single_result_expr(select: &AstSelect) -> Result<Expr> {
    if select.projection.len() != 1 {
        bail_parse_error!("a scalar subquery must select exactly one column");
    }
    match &select.projection[0] {
        SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } => Ok(e.clone()),
        other => bail_parse_error!("unsupported subquery projection: {other}"),
    }
}

fn where_terms_of(select: &AstSelect) -> Vec<WhereTerm> {
    select
        .selection
        .as_ref()
        .map(|w| {
            split_conjuncts(w)
                .into_iter()
                .map(|expr| WhereTerm { expr, consumed: false })
                .collect()
        })
        .unwrap_or_default()
}

fn inner_aliases(from: &[TableWithJoins]) -> Vec<String> {
    fn walk(tf: &TableFactor, out: &mut Vec<String>) {
        match tf {
            TableFactor::Table { name, alias, .. } => out.push(
                alias
                    .as_ref()
                    .map(|a| a.name.value.clone())
                    .unwrap_or_else(|| name.to_string()),
            ),
            TableFactor::Derived { alias, .. } => {
                if let Some(a) = alias {
                    out.push(a.name.value.clone());
                }
            }
            TableFactor::NestedJoin { table_with_joins, .. } => {
                walk(&table_with_joins.relation, out);
                for j in &table_with_joins.joins {
                    walk(&j.relation, out);
                }
            }
            _ => {}
        }
    }
    let mut out = Vec::new();
    for twj in from {
        walk(&twj.relation, &mut out);
        for j in &twj.joins {
            walk(&j.relation, &mut out);
        }
    }
    out
}

/// Outer-only column references found in the subquery's own selection/WHERE
/// (spec §4.4: "a subquery is correlated if it references any outer-active
/// cursor"). Only qualified references are checked: an unqualified name is
/// assumed to resolve within the subquery's own scope, matching standard SQL
/// scoping (inner names shadow outer ones).
fn correlated_refs(ctx: &ExprCtx, select: &AstSelect) -> Vec<(CursorId, usize)> {
    let inner = inner_aliases(&select.from);
    let mut out = Vec::new();
    for item in &select.projection {
        match item {
            SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } => {
                collect_compound(e, &inner, ctx, &mut out)
            }
            _ => {}
        }
    }
    if let Some(w) = &select.selection {
        collect_compound(w, &inner, ctx, &mut out);
    }
    out
}

fn collect_compound(expr: &Expr, inner: &[String], ctx: &ExprCtx, out: &mut Vec<(CursorId, usize)>) {
    if let Expr::CompoundIdentifier(parts) = expr {
        if parts.len() >= 2 {
            let qualifier = parts[parts.len() - 2].value.clone();
            let name = parts[parts.len() - 1].value.clone();
            if !inner.iter().any(|a| a.eq_ignore_ascii_case(&qualifier)) {
                if let Some((c, i)) = super::from::resolve_column(ctx.tables, Some(&qualifier), &name) {
                    if !out.contains(&(c, i)) {
                        out.push((c, i));
                    }
                }
            }
        }
        return;
    }
    match expr {
        Expr::BinaryOp { left, right, .. } => {
            collect_compound(left, inner, ctx, out);
            collect_compound(right, inner, ctx, out);
        }
        Expr::UnaryOp { expr, .. }
        | Expr::Nested(expr)
        | Expr::IsNull(expr)
        | Expr::IsNotNull(expr)
        | Expr::Cast { expr, .. }
        | Expr::Collate { expr, .. } => collect_compound(expr, inner, ctx, out),
        Expr::Between { expr, low, high, .. } => {
            collect_compound(expr, inner, ctx, out);
            collect_compound(low, inner, ctx, out);
            collect_compound(high, inner, ctx, out);
        }
        Expr::InList { expr, list, .. } => {
            collect_compound(expr, inner, ctx, out);
            for e in list {
                collect_compound(e, inner, ctx, out);
            }
        }
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            if let Some(o) = operand {
                collect_compound(o, inner, ctx, out);
            }
            for c in conditions {
                collect_compound(c, inner, ctx, out);
            }
            for r in results {
                collect_compound(r, inner, ctx, out);
            }
            if let Some(e) = else_result {
                collect_compound(e, inner, ctx, out);
            }
        }
        _ => {}
    }
}

/// A cheap textual identity for the subroutine-reuse cache (spec §4.4: "the
/// subroutine table is keyed by subquery AST identity"); using the rendered
/// SQL rather than a pointer means two textually-identical correlated
/// subqueries reuse one compiled body even across unrelated AST clones.
fn ast_key(query: &Query) -> usize {
    let text = query.to_string();
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in text.as_bytes() {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash as usize
}

fn open_inner_from(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    select: &AstSelect,
) -> Result<(Vec<JoinedTable>, Vec<WhereTerm>)> {
    let tables = super::from::build_from(program, catalog, &select.from)?;
    let mut where_terms = where_terms_of(select);
    plan_cursors(program, catalog, &tables, &mut where_terms, &[])?;
    Ok((tables, where_terms))
}

fn close_tables(program: &mut ProgramBuilder, tables: &[JoinedTable]) {
    for t in tables {
        program.emit(Insn::Close { cursor_id: t.cursor });
        program.mark_cursor_closed(t.cursor);
    }
}

/// Pushes `correlated`'s current values plus `n_results` placeholder slots,
/// calls the subroutine at `start_pc`, and returns the stack-absolute
/// indices of the reserved result slots (caller reads these back, then pops
/// the whole frame with `pop_stack`).
fn emit_call(
    program: &mut ProgramBuilder,
    correlated: &[(CursorId, usize)],
    start_pc: Addr,
    n_results: usize,
) -> Vec<usize> {
    for (cursor, col) in correlated {
        let r = program.allocate_register();
        program.emit(Insn::VColumn {
            cursor_id: *cursor,
            column: *col,
            dest: r,
        });
        program.push_value(r);
    }
    let mut result_indices = Vec::with_capacity(n_results);
    for _ in 0..n_results {
        let r = program.allocate_register();
        program.emit(Insn::Null { dest: r, dest_end: None });
        result_indices.push(program.push_value(r));
    }
    let total = correlated.len() + n_results;
    program.emit(Insn::Subroutine {
        arg_count: total,
        target_pc: start_pc,
    });
    result_indices
}

fn frame_arg_map(correlated: &[(CursorId, usize)], total_slots: usize) -> HashMap<(CursorId, usize), i32> {
    correlated
        .iter()
        .enumerate()
        .map(|(i, key)| (*key, -(total_slots as i32) + i as i32))
        .collect()
}

// ---------------------------------------------------------------------
// Scalar subquery
// ---------------------------------------------------------------------

fn compile_scalar(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    ctx: &ExprCtx,
    query: &Query,
    target: usize,
) -> Result<()> {
    let select = select_core(query)?;
    let result_expr = single_result_expr(select)?;
    let correlated = correlated_refs(ctx, select);

    if correlated.is_empty() {
        let (tables, where_terms) = open_inner_from(program, catalog, select)?;
        let found = program.allocate_register();
        program.emit(Insn::Integer { value: 0, dest: found });
        let value = program.allocate_register();
        program.emit(Insn::Null { dest: value, dest_end: None });
        compile_nested_loop(program, catalog, &tables, &where_terms, &mut |program, row_ctx| {
            let already = program.allocate_address(PlaceholderPurpose::Generic);
            program.emit(Insn::IfFalse {
                reg: found,
                target_pc: Addr::Pending(already),
                jump_if_null: false,
            });
            program.emit(Insn::Halt {
                err_code: 1,
                description: "subquery returned more than one row".to_string(),
            });
            program.resolve_address(already)?;
            program.emit(Insn::Integer { value: 1, dest: found });
            translate_expr(program, catalog, row_ctx, &result_expr, value)?;
            Ok(())
        })?;
        close_tables(program, &tables);
        program.emit(Insn::SCopy {
            src: RegRef::Absolute(value),
            dest: RegRef::Absolute(target),
        });
        return Ok(());
    }

    let (sub_id, start) = get_or_compile(program, catalog, query, &correlated, 1, |program, arg_map, total_slots| {
        let (tables, where_terms) = open_inner_from(program, catalog, select)?;
        let found = program.allocate_register();
        program.emit(Insn::Integer { value: 0, dest: found });
        let result_offset = -(total_slots as i32) + correlated.len() as i32;
        compile_nested_loop(program, catalog, &tables, &where_terms, &mut |program, row_ctx| {
            let scoped = (*row_ctx).with_arg_map(arg_map);
            let already = program.allocate_address(PlaceholderPurpose::Generic);
            program.emit(Insn::IfFalse {
                reg: found,
                target_pc: Addr::Pending(already),
                jump_if_null: false,
            });
            program.emit(Insn::Halt {
                err_code: 1,
                description: "subquery returned more than one row".to_string(),
            });
            program.resolve_address(already)?;
            program.emit(Insn::Integer { value: 1, dest: found });
            let v = program.allocate_register();
            translate_expr(program, catalog, &scoped, &result_expr, v)?;
            program.emit(Insn::SCopy {
                src: RegRef::Absolute(v),
                dest: RegRef::FrameRelative(result_offset),
            });
            Ok(())
        })?;
        close_tables(program, &tables);
        Ok(())
    })?;

    let results = emit_call(program, &correlated, start, 1);
    program.emit(Insn::SCopy {
        src: RegRef::StackAbsolute(results[0]),
        dest: RegRef::Absolute(target),
    });
    program.pop_stack(correlated.len() + 1);
    let _ = sub_id;
    Ok(())
}

// ---------------------------------------------------------------------
// EXISTS
// ---------------------------------------------------------------------

fn compile_exists(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    ctx: &ExprCtx,
    query: &Query,
    negated: bool,
    target: usize,
) -> Result<()> {
    let select = select_core(query)?;
    let correlated = correlated_refs(ctx, select);

    let found_reg = if correlated.is_empty() {
        let (tables, where_terms) = open_inner_from(program, catalog, select)?;
        let found = program.allocate_register();
        program.emit(Insn::Integer { value: 0, dest: found });
        compile_nested_loop(program, catalog, &tables, &where_terms, &mut |program, _row_ctx| {
            program.emit(Insn::Integer { value: 1, dest: found });
            Ok(())
        })?;
        close_tables(program, &tables);
        found
    } else {
        let (sub_id, start) = get_or_compile(program, catalog, query, &correlated, 1, |program, _arg_map, total_slots| {
            let (tables, where_terms) = open_inner_from(program, catalog, select)?;
            let found = program.allocate_register();
            program.emit(Insn::Integer { value: 0, dest: found });
            let result_offset = -(total_slots as i32) + correlated.len() as i32;
            compile_nested_loop(program, catalog, &tables, &where_terms, &mut |program, _row_ctx| {
                program.emit(Insn::Integer { value: 1, dest: found });
                Ok(())
            })?;
            program.emit(Insn::SCopy {
                src: RegRef::Absolute(found),
                dest: RegRef::FrameRelative(result_offset),
            });
            close_tables(program, &tables);
            Ok(())
        })?;
        let _ = sub_id;
        let results = emit_call(program, &correlated, start, 1);
        let reg = program.allocate_register();
        program.emit(Insn::SCopy {
            src: RegRef::StackAbsolute(results[0]),
            dest: RegRef::Absolute(reg),
        });
        program.pop_stack(correlated.len() + 1);
        reg
    };

    if negated {
        program.emit(Insn::Not {
            reg: found_reg,
            dest: target,
        });
    } else {
        program.emit(Insn::SCopy {
            src: RegRef::Absolute(found_reg),
            dest: RegRef::Absolute(target),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------
// IN (subquery)
// ---------------------------------------------------------------------

fn compile_in_subquery(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    ctx: &ExprCtx,
    lhs: &Expr,
    query: &Query,
    negated: bool,
    target: usize,
) -> Result<()> {
    let select = select_core(query)?;
    let result_expr = single_result_expr(select)?;
    let correlated = correlated_refs(ctx, select);

    let lhs_reg = program.allocate_register();
    translate_expr(program, catalog, ctx, lhs, lhs_reg)?;
    let lhs_null = program.allocate_address(PlaceholderPurpose::Generic);
    program.emit(Insn::IsNull {
        reg: lhs_reg,
        target_pc: Addr::Pending(lhs_null),
    });

    // Materialize the subquery's single column into a set, tracking whether
    // any row produced NULL (spec table: three-valued IN semantics).
    let set_cursor = program.allocate_cursor();
    program.emit(Insn::OpenEphemeral {
        cursor_id: set_cursor,
        num_columns: 1,
        primary_key: vec![0],
        conflict: ConflictMode::Ignore,
    });
    program.mark_cursor_opened(set_cursor);
    let has_null_reg = program.allocate_register();
    program.emit(Insn::Integer {
        value: 0,
        dest: has_null_reg,
    });

    let materialize = |program: &mut ProgramBuilder, row_ctx: &ExprCtx| -> Result<()> {
        let v = program.allocate_register();
        translate_expr(program, catalog, row_ctx, &result_expr, v)?;
        let item_null = program.allocate_address(PlaceholderPurpose::Generic);
        program.emit(Insn::IsNull {
            reg: v,
            target_pc: Addr::Pending(item_null),
        });
        let rec = program.allocate_register();
        program.emit(Insn::MakeRecord {
            start_reg: v,
            count: 1,
            dest: rec,
        });
        program.emit(Insn::VUpdate {
            cursor_id: set_cursor,
            argv_start_reg: rec,
            argv_count: 1,
            conflict: ConflictMode::Ignore,
        });
        let after = program.allocate_address(PlaceholderPurpose::Generic);
        program.emit(Insn::Goto {
            target_pc: Addr::Pending(after),
        });
        program.resolve_address(item_null)?;
        program.emit(Insn::Integer {
            value: 1,
            dest: has_null_reg,
        });
        program.resolve_address(after)?;
        Ok(())
    };

    if correlated.is_empty() {
        let (tables, where_terms) = open_inner_from(program, catalog, select)?;
        compile_nested_loop(program, catalog, &tables, &where_terms, &mut |program, row_ctx| {
            materialize(program, row_ctx)
        })?;
        close_tables(program, &tables);
    } else {
        // A correlated IN-subquery re-materializes its set inline (rather
        // than through a subroutine) since the set itself, not a single
        // scalar, is the per-outer-row result; the subroutine calling
        // convention only carries scalar/flag results back (spec §4.4).
        let (tables, where_terms) = open_inner_from(program, catalog, select)?;
        let arg_map = frame_arg_map(&correlated, correlated.len());
        compile_nested_loop(program, catalog, &tables, &where_terms, &mut |program, row_ctx| {
            let scoped = (*row_ctx).with_arg_map(&arg_map);
            materialize(program, &scoped)
        })?;
        close_tables(program, &tables);
    }

    let rec = program.allocate_register();
    program.emit(Insn::MakeRecord {
        start_reg: lhs_reg,
        count: 1,
        dest: rec,
    });
    let not_found = program.allocate_address(PlaceholderPurpose::Generic);
    program.emit(Insn::VFilter {
        cursor_id: set_cursor,
        pc_if_empty: Addr::Pending(not_found),
        args_start_reg: rec,
        plan: crate::vdbe::insn::VFilterPlan {
            idx_num: 0,
            idx_str: None,
            n_args: 1,
        },
    });
    program.emit(Insn::Integer {
        value: if negated { 0 } else { 1 },
        dest: target,
    });
    let done = program.allocate_address(PlaceholderPurpose::Generic);
    program.emit(Insn::Goto {
        target_pc: Addr::Pending(done),
    });
    program.resolve_address(not_found)?;
    let has_null_false = program.allocate_address(PlaceholderPurpose::Generic);
    program.emit(Insn::IfFalse {
        reg: has_null_reg,
        target_pc: Addr::Pending(has_null_false),
        jump_if_null: false,
    });
    program.emit(Insn::Null { dest: target, dest_end: None });
    program.emit(Insn::Goto {
        target_pc: Addr::Pending(done),
    });
    program.resolve_address(has_null_false)?;
    program.emit(Insn::Integer {
        value: if negated { 1 } else { 0 },
        dest: target,
    });
    program.emit(Insn::Goto {
        target_pc: Addr::Pending(done),
    });
    program.resolve_address(lhs_null)?;
    program.emit(Insn::Null { dest: target, dest_end: None });
    program.resolve_address(done)?;
    program.emit(Insn::Close { cursor_id: set_cursor });
    program.mark_cursor_closed(set_cursor);
    Ok(())
}

/// Returns the cached subroutine for `query` if one was already compiled for
/// this exact correlated shape, else compiles it via `build` and caches it.
fn get_or_compile(
    program: &mut ProgramBuilder,
    _catalog: &dyn Catalog,
    query: &Query,
    correlated: &[(CursorId, usize)],
    n_results: usize,
    build: impl FnOnce(&mut ProgramBuilder, &HashMap<(CursorId, usize), i32>, usize) -> Result<()>,
) -> Result<(crate::vdbe::SubroutineId, Addr)> {
    let key = ast_key(query);
    if let Some(def) = program.subroutine_defs.get(&key) {
        return Ok((def.id, def.start_address));
    }
    let total_slots = correlated.len() + n_results;
    let arg_map = frame_arg_map(correlated, total_slots);
    let (sub_id, start) = program.start_subroutine();
    build(program, &arg_map, total_slots)?;
    program.emit(Insn::Return);
    program.end_subroutine(sub_id)?;
    program.subroutine_defs.insert(
        key,
        SubroutineDef {
            id: sub_id,
            start_address: start,
            correlated: correlated.to_vec(),
            null_output_reg: None,
        },
    );
    Ok((sub_id, start))
}
