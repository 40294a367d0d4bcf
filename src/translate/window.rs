//! Window-function evaluation (spec §4.7).
//!
//! Window functions are evaluated after the main loop, over a sorted
//! ephemeral *window sorter* whose schema is `partition-by ++ order-by ++
//! passthrough-exprs ++ window-function-args ++ one placeholder column per
//! window function` (GLOSSARY). Every row the window pass needs is already
//! materialized and sorted, so each window function's frame is evaluated by
//! scanning the partition directly rather than by incremental bookkeeping;
//! the spec's Non-goals exclude cost-based/physical-plan optimization, and
//! this crate does not attempt the incremental-frame optimization a
//! production engine would layer on top.
//!
//! All window functions in one query share a single sorter, keyed by the
//! first window function's `PARTITION BY`/`ORDER BY`. A query mixing window
//! functions with different window specs only gets a correct result when
//! those specs agree; see DESIGN.md.

use std::sync::Arc;

use sqlparser::ast::Expr;

use crate::catalog::{Catalog, ColumnSchema, TableSchema};
use crate::value::Affinity;
use crate::vdbe::builder::{CursorKind, PlaceholderPurpose, ProgramBuilder};
use crate::vdbe::insn::{CmpFlags, ConflictMode, FuncDef, Insn, RegRef, SortKey};
use crate::vdbe::{Addr, CursorId};
use crate::vtab::SortDirection;
use crate::Result;

use super::expr::{translate_expr, ExprCtx};
use super::plan::{FrameBound, SelectPlan, WindowFrameUnit, WindowFunction};
use super::result_row::{emit_output_row, LimitRegs};

/// Column layout of the window sorter (spec GLOSSARY "window sorter").
pub struct WindowLayout {
    pub partition_count: usize,
    pub order_count: usize,
    /// Result-list expressions that are not themselves window-function
    /// calls; captured so the output row can still read them after the main
    /// loop's cursors have moved on.
    pub passthrough: Vec<Expr>,
    /// Sorter column base for each window function's stored argument values,
    /// parallel to `SelectPlan::window_functions`.
    pub arg_bases: Vec<usize>,
    pub arg_counts: Vec<usize>,
    pub total_columns: usize,
}

impl WindowLayout {
    fn order_base(&self) -> usize {
        self.partition_count
    }
    fn passthrough_base(&self) -> usize {
        self.partition_count + self.order_count
    }
}

fn result_column_is_window_call(plan: &SelectPlan, expr: &Expr) -> Option<usize> {
    plan.window_functions
        .iter()
        .position(|w| w.original_expr.to_string() == expr.to_string())
}

/// Builds the sorter's ephemeral schema and the index layout needed both to
/// populate it (per input row) and to read it back (the window pass).
pub fn build_window_layout(plan: &SelectPlan) -> (TableSchema, WindowLayout) {
    let partition_by = plan
        .window_functions
        .first()
        .map(|w| w.partition_by.clone())
        .unwrap_or_default();
    let order_by: Vec<Expr> = plan
        .window_functions
        .first()
        .map(|w| w.order_by.iter().map(|o| o.expr.clone()).collect())
        .unwrap_or_default();
    let passthrough: Vec<Expr> = plan
        .result_columns
        .iter()
        .filter(|rc| result_column_is_window_call(plan, &rc.expr).is_none())
        .map(|rc| rc.expr.clone())
        .collect();

    let mut cursor = partition_by.len() + order_by.len() + passthrough.len();
    let mut arg_bases = Vec::with_capacity(plan.window_functions.len());
    let mut arg_counts = Vec::with_capacity(plan.window_functions.len());
    for wf in &plan.window_functions {
        arg_bases.push(cursor);
        arg_counts.push(wf.args.len());
        cursor += wf.args.len();
    }
    let placeholder_base = cursor;
    let total_columns = placeholder_base + plan.window_functions.len();

    let columns = (0..total_columns)
        .map(|i| ColumnSchema {
            name: format!("_w{i}"),
            affinity: Affinity::Numeric,
            flags: Default::default(),
            default: None,
        })
        .collect();

    let schema = TableSchema {
        name: "<window-sorter>".to_string(),
        columns,
        primary_key: vec![],
        indexes: vec![],
        checks: vec![],
        module: "ephemeral".to_string(),
        module_args: vec![],
    };
    let layout = WindowLayout {
        partition_count: partition_by.len(),
        order_count: order_by.len(),
        passthrough,
        arg_bases,
        arg_counts,
        total_columns,
    };
    (schema, layout)
}

pub fn open_window_sorter(program: &mut ProgramBuilder, schema: TableSchema) -> CursorId {
    let cursor = program.allocate_cursor();
    let num_columns = schema.columns.len();
    program
        .table_schemas
        .insert(cursor, CursorKind::Ephemeral(Arc::new(schema)));
    program.emit(Insn::OpenEphemeral {
        cursor_id: cursor,
        num_columns,
        primary_key: vec![],
        conflict: ConflictMode::Abort,
    });
    program.mark_cursor_opened(cursor);
    cursor
}

/// Stores one input row's partition/order/passthrough/arg values plus NULL
/// placeholders into the sorter (spec §4.6: "stores all required expression
/// values and NULL placeholders, then VUpdates into the sorter").
pub fn populate_window_sorter(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    ctx: &ExprCtx,
    plan: &SelectPlan,
    layout: &WindowLayout,
    sorter_cursor: CursorId,
) -> Result<()> {
    let base = program.allocate_registers(layout.total_columns);
    if let Some(w) = plan.window_functions.first() {
        for (i, e) in w.partition_by.iter().enumerate() {
            translate_expr(program, catalog, ctx, e, base + i)?;
        }
        for (i, ob) in w.order_by.iter().enumerate() {
            translate_expr(program, catalog, ctx, &ob.expr, base + layout.order_base() + i)?;
        }
    }
    for (i, e) in layout.passthrough.iter().enumerate() {
        translate_expr(program, catalog, ctx, e, base + layout.passthrough_base() + i)?;
    }
    for (wf, &arg_base) in plan.window_functions.iter().zip(layout.arg_bases.iter()) {
        for (i, a) in wf.args.iter().enumerate() {
            translate_expr(program, catalog, ctx, a, base + arg_base + i)?;
        }
    }
    let placeholder_base = layout.arg_bases.last().copied().unwrap_or(layout.passthrough_base() + layout.passthrough.len())
        + layout.arg_counts.last().copied().unwrap_or(0);
    for i in 0..plan.window_functions.len() {
        program.emit(Insn::Null {
            dest: base + placeholder_base + i,
            dest_end: None,
        });
    }
    let rec = program.allocate_register();
    program.emit(Insn::MakeRecord {
        start_reg: base,
        count: layout.total_columns,
        dest: rec,
    });
    program.emit(Insn::VUpdate {
        cursor_id: sorter_cursor,
        argv_start_reg: rec,
        argv_count: 1,
        conflict: ConflictMode::Abort,
    });
    Ok(())
}

/// A seek that is guaranteed to succeed (the rowid was captured from this
/// same cursor earlier); the "not found" branch is therefore dead code, but
/// every jump field still needs a resolved address.
fn seek_rowid_infallible(program: &mut ProgramBuilder, cursor_id: CursorId, rowid_reg: usize) -> Result<()> {
    let not_found = program.allocate_address(PlaceholderPurpose::Generic);
    program.emit(Insn::SeekRowid {
        cursor_id,
        rowid_reg,
        target_pc: Addr::Pending(not_found),
    });
    program.resolve_address(not_found)
}

/// A register-level comparison between the anchor row's frame-relevant
/// value(s) and the currently-scanned row, used to decide both frame
/// membership and when a forward scan may stop early.
struct BoundChecks {
    /// Emits a branch to `fail` if the scanned row is before the frame start.
    before_start: Box<dyn Fn(&mut ProgramBuilder, Addr)>,
    /// Emits a branch to `stop` if the scanned row is definitely past the
    /// frame end (safe to stop scanning forward, since rows are sorted).
    past_end: Box<dyn Fn(&mut ProgramBuilder, Addr)>,
}

fn rows_bound_checks(program: &mut ProgramBuilder, start: &FrameBound, end: &FrameBound, anchor_idx: usize, scan_idx: usize) -> BoundChecks {
    let start_threshold = bound_to_index(program, start, anchor_idx);
    let end_threshold = bound_to_index(program, end, anchor_idx);
    let end_unbounded = matches!(end, FrameBound::UnboundedFollowing);
    BoundChecks {
        before_start: Box::new(move |p, fail| {
            p.emit(Insn::Lt { lhs: scan_idx, rhs: start_threshold, target_pc: fail, flags: CmpFlags::default() });
        }),
        past_end: Box::new(move |p, stop| {
            if end_unbounded {
                return;
            }
            p.emit(Insn::Gt { lhs: scan_idx, rhs: end_threshold, target_pc: stop, flags: CmpFlags::default() });
        }),
    }
}

fn bound_to_index(program: &mut ProgramBuilder, bound: &FrameBound, anchor_idx: usize) -> usize {
    let dest = program.allocate_register();
    match bound {
        FrameBound::UnboundedPreceding => {
            program.emit(Insn::Integer { value: 0, dest });
        }
        FrameBound::Preceding(n) => {
            let n_reg = program.allocate_register();
            program.emit(Insn::Integer { value: *n as i32, dest: n_reg });
            program.emit(Insn::Subtract { lhs: anchor_idx, rhs: n_reg, dest });
        }
        FrameBound::CurrentRow => {
            program.emit(Insn::SCopy { src: RegRef::Absolute(anchor_idx), dest: RegRef::Absolute(dest) });
        }
        FrameBound::Following(n) => {
            let n_reg = program.allocate_register();
            program.emit(Insn::Integer { value: *n as i32, dest: n_reg });
            program.emit(Insn::Add { lhs: anchor_idx, rhs: n_reg, dest });
        }
        FrameBound::UnboundedFollowing => {
            program.emit(Insn::Integer { value: i32::MAX, dest });
        }
    }
    dest
}

/// `RANGE` frame bound checks over a single ORDER BY value (spec §4.7:
/// "RANGE with an offset requires exactly one ORDER BY column").
fn range_bound_checks(program: &mut ProgramBuilder, start: &FrameBound, end: &FrameBound, anchor_val: usize, scan_val: usize) -> BoundChecks {
    let start_threshold = bound_to_value(program, start, anchor_val);
    let end_threshold = bound_to_value(program, end, anchor_val);
    let start_unbounded = matches!(start, FrameBound::UnboundedPreceding);
    let end_unbounded = matches!(end, FrameBound::UnboundedFollowing);
    BoundChecks {
        before_start: Box::new(move |p, fail| {
            if start_unbounded {
                return;
            }
            p.emit(Insn::Lt { lhs: scan_val, rhs: start_threshold, target_pc: fail, flags: CmpFlags::default() });
        }),
        past_end: Box::new(move |p, stop| {
            if end_unbounded {
                return;
            }
            p.emit(Insn::Gt { lhs: scan_val, rhs: end_threshold, target_pc: stop, flags: CmpFlags::default() });
        }),
    }
}

fn bound_to_value(program: &mut ProgramBuilder, bound: &FrameBound, anchor_val: usize) -> usize {
    let dest = program.allocate_register();
    match bound {
        FrameBound::UnboundedPreceding | FrameBound::UnboundedFollowing => {
            // Only meaningful on the side it's used from; `before_start`/
            // `past_end` skip the comparison entirely for an unbounded edge.
            program.emit(Insn::SCopy { src: RegRef::Absolute(anchor_val), dest: RegRef::Absolute(dest) });
        }
        FrameBound::Preceding(n) => {
            let n_reg = program.allocate_register();
            program.emit(Insn::Integer { value: *n as i32, dest: n_reg });
            program.emit(Insn::Subtract { lhs: anchor_val, rhs: n_reg, dest });
        }
        FrameBound::CurrentRow => {
            program.emit(Insn::SCopy { src: RegRef::Absolute(anchor_val), dest: RegRef::Absolute(dest) });
        }
        FrameBound::Following(n) => {
            let n_reg = program.allocate_register();
            program.emit(Insn::Integer { value: *n as i32, dest: n_reg });
            program.emit(Insn::Add { lhs: anchor_val, rhs: n_reg, dest });
        }
    }
    dest
}

/// The sort-based window pass (spec §4.7): sorts the populated sorter,
/// detects partition boundaries by comparing consecutive partition-key
/// tuples, and for each row computes every window function's frame value by
/// scanning the partition, then emits the output row honoring OFFSET/LIMIT.
pub fn emit_window_pass(
    program: &mut ProgramBuilder,
    plan: &SelectPlan,
    layout: &WindowLayout,
    sorter_cursor: CursorId,
    limits: &Option<LimitRegs>,
) -> Result<()> {
    let sort_cols = layout.partition_count + layout.order_count;
    program.emit(Insn::Sort {
        cursor_id: sorter_cursor,
        key: SortKey {
            key_indices: (0..sort_cols).collect(),
            collations: vec![None; sort_cols],
            directions: vec![SortDirection::Asc; sort_cols],
        },
    });

    let eof = program.allocate_address(PlaceholderPurpose::Eof);
    program.emit(Insn::Rewind {
        cursor_id: sorter_cursor,
        pc_if_empty: Addr::Pending(eof),
    });

    let prev_partition = if layout.partition_count > 0 {
        Some(program.allocate_registers(layout.partition_count))
    } else {
        None
    };
    let has_prev = program.allocate_register();
    program.emit(Insn::Integer { value: 0, dest: has_prev });
    let partition_start = program.allocate_register();
    let row_idx = program.allocate_register();
    let one = program.allocate_register();
    program.emit(Insn::Integer { value: 1, dest: one });

    let loop_start = program.current_address();

    let is_new = program.allocate_register();
    if let Some(prev_base) = prev_partition {
        let differs = program.allocate_address(PlaceholderPurpose::Generic);
        let settled = program.allocate_address(PlaceholderPurpose::Generic);
        program.emit(Insn::IfFalse { reg: has_prev, target_pc: Addr::Pending(differs), jump_if_null: false });
        for i in 0..layout.partition_count {
            let cur = program.allocate_register();
            program.emit(Insn::VColumn { cursor_id: sorter_cursor, column: i, dest: cur });
            program.emit(Insn::Ne { lhs: cur, rhs: prev_base + i, target_pc: Addr::Pending(differs), flags: CmpFlags::default() });
        }
        program.emit(Insn::Integer { value: 0, dest: is_new });
        program.emit(Insn::Goto { target_pc: Addr::Pending(settled) });
        program.resolve_address(differs)?;
        program.emit(Insn::Integer { value: 1, dest: is_new });
        program.resolve_address(settled)?;
    } else {
        program.emit(Insn::Subtract { lhs: one, rhs: has_prev, dest: is_new });
    }
    program.emit(Insn::Integer { value: 1, dest: has_prev });

    let new_partition = program.allocate_address(PlaceholderPurpose::Generic);
    let after_partition = program.allocate_address(PlaceholderPurpose::Generic);
    program.emit(Insn::IfTrue { reg: is_new, target_pc: Addr::Pending(new_partition), jump_if_null: false });
    program.emit(Insn::Add { lhs: row_idx, rhs: one, dest: row_idx });
    program.emit(Insn::Goto { target_pc: Addr::Pending(after_partition) });
    program.resolve_address(new_partition)?;
    program.emit(Insn::Integer { value: 0, dest: row_idx });
    let start_rowid = program.allocate_register();
    program.emit(Insn::VRowid { cursor_id: sorter_cursor, dest: start_rowid });
    program.emit(Insn::SCopy { src: RegRef::Absolute(start_rowid), dest: RegRef::Absolute(partition_start) });
    if let Some(prev_base) = prev_partition {
        for i in 0..layout.partition_count {
            let cur = program.allocate_register();
            program.emit(Insn::VColumn { cursor_id: sorter_cursor, column: i, dest: cur });
            program.emit(Insn::SCopy { src: RegRef::Absolute(cur), dest: RegRef::Absolute(prev_base + i) });
        }
    }
    program.resolve_address(after_partition)?;

    let anchor_rowid = program.allocate_register();
    program.emit(Insn::VRowid { cursor_id: sorter_cursor, dest: anchor_rowid });
    let anchor_order_val = if layout.order_count >= 1 {
        let r = program.allocate_register();
        program.emit(Insn::VColumn { cursor_id: sorter_cursor, column: layout.order_base(), dest: r });
        Some(r)
    } else {
        None
    };

    let mut result_regs = Vec::with_capacity(plan.window_functions.len());
    for (i, wf) in plan.window_functions.iter().enumerate() {
        let result_reg = program.allocate_register();
        emit_one_window_function(
            program,
            layout,
            i,
            wf,
            sorter_cursor,
            anchor_rowid,
            row_idx,
            partition_start,
            anchor_order_val,
            result_reg,
        )?;
        result_regs.push(result_reg);
    }
    seek_rowid_infallible(program, sorter_cursor, anchor_rowid)?;

    let out_count = plan.result_columns.len();
    let out_base = program.allocate_registers(out_count);
    let mut passthrough_cursor = 0usize;
    for (i, rc) in plan.result_columns.iter().enumerate() {
        if let Some(fn_idx) = result_column_is_window_call(plan, &rc.expr) {
            program.emit(Insn::SCopy { src: RegRef::Absolute(result_regs[fn_idx]), dest: RegRef::Absolute(out_base + i) });
        } else {
            program.emit(Insn::VColumn {
                cursor_id: sorter_cursor,
                column: layout.passthrough_base() + passthrough_cursor,
                dest: out_base + i,
            });
            passthrough_cursor += 1;
        }
    }
    emit_output_row(program, limits, out_base, out_count)?;

    program.emit(Insn::VNext { cursor_id: sorter_cursor, pc_if_next: loop_start });
    program.resolve_address(eof)?;
    program.emit(Insn::Close { cursor_id: sorter_cursor });
    program.mark_cursor_closed(sorter_cursor);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn emit_one_window_function(
    program: &mut ProgramBuilder,
    layout: &WindowLayout,
    fn_index: usize,
    wf: &WindowFunction,
    sorter_cursor: CursorId,
    anchor_rowid: usize,
    anchor_idx: usize,
    partition_start: usize,
    anchor_order_val: Option<usize>,
    result_reg: usize,
) -> Result<()> {
    seek_rowid_infallible(program, sorter_cursor, partition_start)?;
    let scan_idx = program.allocate_register();
    program.emit(Insn::Integer { value: 0, dest: scan_idx });

    let func = FuncDef { name: wf.func_name.clone(), num_args: wf.args.len() };
    let key_reg = program.allocate_register();
    // A value unique to this (row, window-function) pair, so the accumulator
    // keyed on it starts fresh: the anchor rowid already uniquely identifies
    // the current output row, folded together with this function's
    // SELECT-list position so distinct window functions over the same row
    // don't share an accumulator.
    let fn_tag = program.allocate_register();
    program.emit(Insn::Integer { value: fn_index as i32, dest: fn_tag });
    program.emit(Insn::MakeRecord { start_reg: anchor_rowid, count: 1, dest: key_reg });
    program.emit(Insn::Concat { lhs: key_reg, rhs: fn_tag, dest: key_reg });

    let scan_loop = program.current_address();
    let stop = program.allocate_address(PlaceholderPurpose::Generic);
    let skip_row = program.allocate_address(PlaceholderPurpose::Generic);

    let checks = match wf.frame.unit {
        WindowFrameUnit::Rows => rows_bound_checks(program, &wf.frame.start, &wf.frame.end, anchor_idx, scan_idx),
        WindowFrameUnit::Range => match anchor_order_val {
            Some(a) => {
                let s = program.allocate_register();
                program.emit(Insn::VColumn { cursor_id: sorter_cursor, column: layout.order_base(), dest: s });
                range_bound_checks(program, &wf.frame.start, &wf.frame.end, a, s)
            }
            None => rows_bound_checks(program, &wf.frame.start, &wf.frame.end, anchor_idx, scan_idx),
        },
    };
    (checks.past_end)(program, Addr::Pending(stop));
    (checks.before_start)(program, Addr::Pending(skip_row));

    let arg_count = layout.arg_counts[fn_index];
    let arg_base = layout.arg_bases[fn_index];
    let arg_start = if arg_count == 0 {
        scan_idx
    } else {
        let base = program.allocate_registers(arg_count);
        for i in 0..arg_count {
            program.emit(Insn::VColumn { cursor_id: sorter_cursor, column: arg_base + i, dest: base + i });
        }
        base
    };
    program.emit(Insn::AggStep {
        key_reg,
        start_reg: arg_start,
        arg_count,
        func: func.clone(),
    });
    program.resolve_address(skip_row)?;

    let one = program.allocate_register();
    program.emit(Insn::Integer { value: 1, dest: one });
    program.emit(Insn::Add { lhs: scan_idx, rhs: one, dest: scan_idx });
    program.emit(Insn::VNext { cursor_id: sorter_cursor, pc_if_next: scan_loop });
    program.resolve_address(stop)?;

    program.emit(Insn::AggFinal { key_reg, dest: result_reg, func });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::plan::{JoinedTable, ResultColumn, RowProcessorKind, WhereTerm};
    use sqlparser::ast::{Ident, OrderByExpr};

    fn ident(name: &str) -> Expr {
        Expr::Identifier(Ident::new(name))
    }

    fn wf(name: &str, select_list_index: usize) -> WindowFunction {
        WindowFunction {
            func_name: name.to_string(),
            args: vec![],
            partition_by: vec![ident("a")],
            order_by: vec![OrderByExpr { expr: ident("b"), asc: None, nulls_first: None }],
            frame: WindowFrame::default(),
            original_expr: ident(name),
            select_list_index,
            result_reg: 0,
        }
    }

    fn empty_plan(window_functions: Vec<WindowFunction>) -> SelectPlan {
        SelectPlan {
            tables: Vec::<JoinedTable>::new(),
            where_terms: Vec::<WhereTerm>::new(),
            result_columns: vec![ResultColumn { expr: ident("row_number"), name: "row_number".to_string(), item: sqlparser::ast::SelectItem::UnnamedExpr(ident("row_number")) }],
            group_by: vec![],
            having: None,
            aggregates: vec![],
            window_functions,
            order_by: vec![],
            limit: None,
            offset: None,
            distinct: false,
            row_processor: RowProcessorKind::Window,
        }
    }

    #[test]
    fn layout_reserves_one_placeholder_column_per_window_function() {
        let plan = empty_plan(vec![wf("row_number", 0)]);
        let (schema, layout) = build_window_layout(&plan);
        // 1 partition col + 1 order col + 0 passthrough (the lone result
        // column IS the window call) + 0 args + 1 placeholder = 3.
        assert_eq!(layout.total_columns, 3);
        assert_eq!(schema.columns.len(), 3);
    }

    #[test]
    fn default_frame_is_range_unbounded_preceding_to_current_row() {
        let frame = WindowFrame::default();
        assert_eq!(frame.unit, WindowFrameUnit::Range);
        assert_eq!(frame.start, FrameBound::UnboundedPreceding);
        assert_eq!(frame.end, FrameBound::CurrentRow);
    }
}
