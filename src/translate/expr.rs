//! Expression compiler (spec §4.3). Every node dispatch here produces its
//! value in a caller-supplied target register, per the emission contract
//! table in the spec.

use std::collections::HashMap;

use sqlparser::ast::{BinaryOperator, CastKind, Expr, UnaryOperator, Value as AstValue};

use crate::catalog::{Catalog, FunctionKind};
use crate::value::{Affinity, Value};
use crate::vdbe::builder::ProgramBuilder;
use crate::vdbe::insn::{CmpFlags, FuncDef, Insn, RegRef};
use crate::vdbe::{CursorId, ParamKey};
use crate::{bail_internal_error, bail_parse_error, Result};

use super::from::resolve_column;
use super::plan::JoinedTable;

/// Threaded through every recursive call. Carries the active FROM scope plus
/// the two override mechanisms the spec's table calls out: HAVING/output
/// stage column remapping, and correlated-subquery argument slots.
#[derive(Clone, Copy, Default)]
pub struct ExprCtx<'p> {
    pub tables: &'p [JoinedTable],
    /// Keyed by `Expr::to_string()` of the original SELECT-list/GROUP
    /// BY/window expression; resolves to an already-computed register
    /// (spec §4.6 "compute the column map once... pass it to all
    /// consumers"). Used for HAVING, ORDER BY over aggregate results, and
    /// window-function-reference substitution alike.
    pub overrides: Option<&'p HashMap<String, usize>>,
    /// Present while compiling inside a correlated subquery's subroutine
    /// body: maps `(outer_cursor, outer_column)` to the `FrameRelative`
    /// offset of the caller-pushed argument slot (spec §4.4).
    pub arg_map: Option<&'p HashMap<(CursorId, usize), i32>>,
    /// Cursors that are currently null-padded (spec §4.5 LEFT JOIN
    /// null-padding): a column reference into one of these reads as NULL
    /// rather than `VColumn`, since the cursor has no positioned row on
    /// this path. This is the mechanism behind the spec's "column map"
    /// redesign note (§9) for LEFT JOIN consumers specifically.
    pub null_cursors: Option<&'p [CursorId]>,
}

impl<'p> ExprCtx<'p> {
    pub fn new(tables: &'p [JoinedTable]) -> Self {
        ExprCtx {
            tables,
            overrides: None,
            arg_map: None,
            null_cursors: None,
        }
    }

    pub fn with_overrides(mut self, overrides: &'p HashMap<String, usize>) -> Self {
        self.overrides = Some(overrides);
        self
    }

    pub fn with_arg_map(mut self, arg_map: &'p HashMap<(CursorId, usize), i32>) -> Self {
        self.arg_map = Some(arg_map);
        self
    }

    pub fn with_null_cursors(mut self, null_cursors: &'p [CursorId]) -> Self {
        self.null_cursors = Some(null_cursors);
        self
    }
}

/// Compile `expr`'s value into `target`.
pub fn translate_expr(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    ctx: &ExprCtx,
    expr: &Expr,
    target: usize,
) -> Result<()> {
    if let Some(overrides) = ctx.overrides {
        if let Some(&reg) = overrides.get(&expr.to_string()) {
            program.emit(Insn::SCopy {
                src: RegRef::Absolute(reg),
                dest: RegRef::Absolute(target),
            });
            return Ok(());
        }
    }

    match expr {
        Expr::Value(v) => translate_literal(program, v, target),

        Expr::Identifier(_) | Expr::CompoundIdentifier(_) => {
            translate_column_ref(program, catalog, ctx, expr, target)
        }

        Expr::Nested(inner) => translate_expr(program, catalog, ctx, inner, target),

        Expr::Cast { expr: inner, data_type, .. } => {
            translate_expr(program, catalog, ctx, inner, target)?;
            let affinity = affinity_of_data_type(data_type);
            program.emit(Insn::Affinity {
                start_reg: target,
                count: 1,
                affinity,
            });
            Ok(())
        }

        Expr::Collate { expr: inner, .. } => {
            // Collation attaches to later comparison operators (spec §4.3);
            // the value itself is unaffected.
            translate_expr(program, catalog, ctx, inner, target)
        }

        Expr::UnaryOp { op, expr: inner } => translate_unary(program, catalog, ctx, *op, inner, target),

        Expr::BinaryOp { left, op, right } => translate_binary(program, catalog, ctx, left, op, right, target),

        Expr::IsNull(inner) => {
            let v = program.allocate_register();
            translate_expr(program, catalog, ctx, inner, v)?;
            emit_bool_from_test(program, v, target, true)
        }
        Expr::IsNotNull(inner) => {
            let v = program.allocate_register();
            translate_expr(program, catalog, ctx, inner, v)?;
            emit_bool_from_test(program, v, target, false)
        }

        Expr::InList { expr: lhs, list, negated } => {
            translate_in_list(program, catalog, ctx, lhs, list, *negated, target)
        }

        Expr::Between { expr: inner, negated, low, high } => {
            // Decomposed into compare + jumps (spec §4.3: "implementations
            // may synthesize from primitives").
            let ge_lo = Expr::BinaryOp {
                left: inner.clone(),
                op: BinaryOperator::GtEq,
                right: low.clone(),
            };
            let le_hi = Expr::BinaryOp {
                left: inner.clone(),
                op: BinaryOperator::LtEq,
                right: high.clone(),
            };
            let combined = Expr::BinaryOp {
                left: Box::new(ge_lo),
                op: BinaryOperator::And,
                right: Box::new(le_hi),
            };
            if *negated {
                translate_expr(
                    program,
                    catalog,
                    ctx,
                    &Expr::UnaryOp { op: UnaryOperator::Not, expr: Box::new(combined) },
                    target,
                )
            } else {
                translate_expr(program, catalog, ctx, &combined, target)
            }
        }

        Expr::Case { operand, conditions, results, else_result } => {
            translate_case(program, catalog, ctx, operand.as_deref(), conditions, results, else_result.as_deref(), target)
        }

        Expr::InSubquery { .. } | Expr::Subquery(_) | Expr::Exists { .. } => {
            super::subquery::translate_subquery_expr(program, catalog, ctx, expr, target)
        }

        Expr::Function(func) => translate_function(program, catalog, ctx, func, target),

        other => bail_parse_error!("unsupported expression: {other}"),
    }
}

fn affinity_of_data_type(dt: &sqlparser::ast::DataType) -> Affinity {
    use sqlparser::ast::DataType::*;
    match dt {
        Int(_) | Integer(_) | BigInt(_) | SmallInt(_) | TinyInt(_) => Affinity::Integer,
        Real | Float(_) | Double | DoublePrecision => Affinity::Real,
        Blob(_) => Affinity::Blob,
        Text | Varchar(_) | Char(_) | String(_) => Affinity::Text,
        _ => Affinity::Numeric,
    }
}

fn translate_literal(program: &mut ProgramBuilder, v: &AstValue, target: usize) -> Result<()> {
    match v {
        AstValue::Null => {
            program.emit(Insn::Null { dest: target, dest_end: None });
            Ok(())
        }
        AstValue::Boolean(b) => {
            program.emit(Insn::Integer { value: *b as i32, dest: target });
            Ok(())
        }
        AstValue::Number(s, _) => {
            if let Ok(i) = s.parse::<i32>() {
                program.emit(Insn::Integer { value: i, dest: target });
            } else if let Ok(i) = s.parse::<i64>() {
                program.add_constant(Value::Integer(i));
                program.emit(Insn::Int64 { value: i, dest: target });
            } else if let Ok(f) = s.parse::<f64>() {
                program.add_constant(Value::Real(f));
                program.emit(Insn::Real { value: f, dest: target });
            } else {
                bail_parse_error!("invalid numeric literal: {s}");
            }
            Ok(())
        }
        AstValue::SingleQuotedString(s)
        | AstValue::DoubleQuotedString(s)
        | AstValue::EscapedStringLiteral(s) => {
            program.add_constant(Value::Text(s.clone()));
            program.emit(Insn::String8 { value: s.clone(), dest: target });
            Ok(())
        }
        AstValue::HexStringLiteral(s) => {
            let bytes = hex_decode(s);
            program.add_constant(Value::Blob(bytes.clone()));
            program.emit(Insn::Blob { value: bytes, dest: target });
            Ok(())
        }
        AstValue::Placeholder(marker) => {
            let key = parse_param_key(marker, program);
            let reg = program.register_parameter(key);
            // Placeholder bound values are written before execution; the
            // compiler only needs to reserve and emit a `Null` default.
            if reg != target {
                program.emit(Insn::SCopy {
                    src: RegRef::Absolute(reg),
                    dest: RegRef::Absolute(target),
                });
            } else {
                program.emit(Insn::Null { dest: target, dest_end: None });
            }
            Ok(())
        }
        other => bail_parse_error!("unsupported literal: {other}"),
    }
}

fn hex_decode(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() / 2);
    let bytes = s.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        let hi = (bytes[i] as char).to_digit(16).unwrap_or(0);
        let lo = (bytes[i + 1] as char).to_digit(16).unwrap_or(0);
        out.push(((hi << 4) | lo) as u8);
        i += 2;
    }
    out
}

/// `?` uses sequential positional indices starting at 1; `:name`/`@name`/
/// `$name` use the textual key (spec §6).
fn parse_param_key(marker: &str, program: &ProgramBuilder) -> ParamKey {
    if marker == "?" {
        let next = program.parameters.len() as u32 + 1;
        return ParamKey::Positional(next);
    }
    let mut chars = marker.chars();
    match chars.next() {
        Some(':') | Some('@') | Some('$') => ParamKey::Named(marker.to_string()),
        _ => {
            if let Ok(n) = marker.trim_start_matches('?').parse::<u32>() {
                ParamKey::Positional(n)
            } else {
                ParamKey::Named(marker.to_string())
            }
        }
    }
}

fn split_ident(expr: &Expr) -> Option<(Option<String>, String)> {
    match expr {
        Expr::Identifier(id) => Some((None, id.value.clone())),
        Expr::CompoundIdentifier(parts) if parts.len() >= 2 => Some((
            Some(parts[parts.len() - 2].value.clone()),
            parts[parts.len() - 1].value.clone(),
        )),
        _ => None,
    }
}

fn translate_column_ref(
    program: &mut ProgramBuilder,
    _catalog: &dyn Catalog,
    ctx: &ExprCtx,
    expr: &Expr,
    target: usize,
) -> Result<()> {
    let (qualifier, name) = split_ident(expr)
        .ok_or_else(|| crate::error::CompileError::Internal { message: "non-identifier column ref".into() })?;

    let (cursor, col) = resolve_column(ctx.tables, qualifier.as_deref(), &name).ok_or_else(|| {
        crate::error::CompileError::Syntax {
            message: format!("no such column: {}", expr),
            location: None,
        }
    })?;

    if let Some(null_cursors) = ctx.null_cursors {
        if null_cursors.contains(&cursor) {
            program.emit(Insn::Null { dest: target, dest_end: None });
            return Ok(());
        }
    }

    if let Some(arg_map) = ctx.arg_map {
        if let Some(&offset) = arg_map.get(&(cursor, col)) {
            program.emit(Insn::SCopy {
                src: RegRef::FrameRelative(offset),
                dest: RegRef::Absolute(target),
            });
            return Ok(());
        }
    }

    program.emit(Insn::VColumn { cursor_id: cursor, column: col, dest: target });
    Ok(())
}

/// Emits `reg IS [NOT] NULL -> target` as 1/0 (spec table: "Null tests and
/// branches"). `want_null` true means target is 1 when the value is NULL.
fn emit_bool_from_test(program: &mut ProgramBuilder, reg: usize, target: usize, want_null: bool) -> Result<()> {
    let set_true = program.allocate_address(crate::vdbe::builder::PlaceholderPurpose::Generic);
    let end = program.allocate_address(crate::vdbe::builder::PlaceholderPurpose::Generic);
    if want_null {
        program.emit(Insn::IsNull { reg, target_pc: crate::vdbe::Addr::Pending(set_true) });
    } else {
        program.emit(Insn::NotNull { reg, target_pc: crate::vdbe::Addr::Pending(set_true) });
    }
    program.emit(Insn::Integer { value: 0, dest: target });
    program.emit(Insn::Goto { target_pc: crate::vdbe::Addr::Pending(end) });
    program.resolve_address(set_true)?;
    program.emit(Insn::Integer { value: 1, dest: target });
    program.resolve_address(end)?;
    Ok(())
}

fn translate_unary(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    ctx: &ExprCtx,
    op: UnaryOperator,
    inner: &Expr,
    target: usize,
) -> Result<()> {
    match op {
        UnaryOperator::Minus => {
            translate_expr(program, catalog, ctx, inner, target)?;
            program.emit(Insn::Negative { reg: target, dest: target });
            Ok(())
        }
        UnaryOperator::Plus => translate_expr(program, catalog, ctx, inner, target),
        UnaryOperator::Not => {
            translate_expr(program, catalog, ctx, inner, target)?;
            // Three-valued: NOT NULL -> NULL.
            program.emit(Insn::Not { reg: target, dest: target });
            Ok(())
        }
        UnaryOperator::PGBitwiseNot => {
            translate_expr(program, catalog, ctx, inner, target)?;
            program.emit(Insn::BitNot { reg: target, dest: target });
            Ok(())
        }
        other => bail_parse_error!("unsupported unary operator: {other:?}"),
    }
}

fn translate_binary(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    ctx: &ExprCtx,
    left: &Expr,
    op: &BinaryOperator,
    right: &Expr,
    target: usize,
) -> Result<()> {
    match op {
        BinaryOperator::And => {
            // Short-circuit: result = left-if-falsy-else-right, preserving NULL.
            translate_expr(program, catalog, ctx, left, target)?;
            let short_circuit = program.allocate_address(crate::vdbe::builder::PlaceholderPurpose::Generic);
            program.emit(Insn::IfFalse { reg: target, target_pc: crate::vdbe::Addr::Pending(short_circuit), jump_if_null: false });
            let is_null = program.allocate_address(crate::vdbe::builder::PlaceholderPurpose::Generic);
            program.emit(Insn::IsNull { reg: target, target_pc: crate::vdbe::Addr::Pending(is_null) });
            translate_expr(program, catalog, ctx, right, target)?;
            let end = program.allocate_address(crate::vdbe::builder::PlaceholderPurpose::Generic);
            program.emit(Insn::Goto { target_pc: crate::vdbe::Addr::Pending(end) });
            program.resolve_address(is_null)?;
            // left was NULL (and thus falsy under IfFalse's null semantics
            // would have already jumped away only if jump_if_null; since we
            // set jump_if_null=false above, NULL falls through here): NULL AND x
            // stays NULL unless x is FALSE, in which case result is FALSE.
            translate_expr(program, catalog, ctx, right, target)?;
            let rhs_false = program.allocate_address(crate::vdbe::builder::PlaceholderPurpose::Generic);
            program.emit(Insn::IfFalse { reg: target, target_pc: crate::vdbe::Addr::Pending(rhs_false), jump_if_null: false });
            program.emit(Insn::Null { dest: target, dest_end: None });
            program.emit(Insn::Goto { target_pc: crate::vdbe::Addr::Pending(end) });
            program.resolve_address(rhs_false)?;
            program.emit(Insn::Integer { value: 0, dest: target });
            program.resolve_address(short_circuit)?;
            program.resolve_address(end)?;
            Ok(())
        }
        BinaryOperator::Or => {
            translate_expr(program, catalog, ctx, left, target)?;
            let short_circuit = program.allocate_address(crate::vdbe::builder::PlaceholderPurpose::Generic);
            program.emit(Insn::IfTrue { reg: target, target_pc: crate::vdbe::Addr::Pending(short_circuit), jump_if_null: false });
            let is_null = program.allocate_address(crate::vdbe::builder::PlaceholderPurpose::Generic);
            program.emit(Insn::IsNull { reg: target, target_pc: crate::vdbe::Addr::Pending(is_null) });
            translate_expr(program, catalog, ctx, right, target)?;
            let end = program.allocate_address(crate::vdbe::builder::PlaceholderPurpose::Generic);
            program.emit(Insn::Goto { target_pc: crate::vdbe::Addr::Pending(end) });
            program.resolve_address(is_null)?;
            translate_expr(program, catalog, ctx, right, target)?;
            let rhs_true = program.allocate_address(crate::vdbe::builder::PlaceholderPurpose::Generic);
            program.emit(Insn::IfTrue { reg: target, target_pc: crate::vdbe::Addr::Pending(rhs_true), jump_if_null: false });
            program.emit(Insn::Null { dest: target, dest_end: None });
            program.emit(Insn::Goto { target_pc: crate::vdbe::Addr::Pending(end) });
            program.resolve_address(rhs_true)?;
            program.emit(Insn::Integer { value: 1, dest: target });
            program.resolve_address(short_circuit)?;
            program.resolve_address(end)?;
            Ok(())
        }
        BinaryOperator::Eq | BinaryOperator::NotEq | BinaryOperator::Lt | BinaryOperator::LtEq
        | BinaryOperator::Gt | BinaryOperator::GtEq => {
            let lhs = program.allocate_register();
            let rhs = program.allocate_register();
            translate_expr(program, catalog, ctx, left, lhs)?;
            translate_expr(program, catalog, ctx, right, rhs)?;
            emit_comparison(program, op, lhs, rhs, target, CmpFlags::default())
        }
        BinaryOperator::Spaceship => {
            // IS / IS NOT style null-safe equality in some dialects.
            let lhs = program.allocate_register();
            let rhs = program.allocate_register();
            translate_expr(program, catalog, ctx, left, lhs)?;
            translate_expr(program, catalog, ctx, right, rhs)?;
            emit_comparison(program, &BinaryOperator::Eq, lhs, rhs, target, CmpFlags { null_eq: true, jump_if_null: false })
        }
        arith => {
            let lhs = program.allocate_register();
            let rhs = program.allocate_register();
            translate_expr(program, catalog, ctx, left, lhs)?;
            translate_expr(program, catalog, ctx, right, rhs)?;
            match arith {
                BinaryOperator::Plus => program.emit(Insn::Add { lhs, rhs, dest: target }),
                BinaryOperator::Minus => program.emit(Insn::Subtract { lhs, rhs, dest: target }),
                BinaryOperator::Multiply => program.emit(Insn::Multiply { lhs, rhs, dest: target }),
                BinaryOperator::Divide => program.emit(Insn::Divide { lhs, rhs, dest: target }),
                BinaryOperator::Modulo => program.emit(Insn::Remainder { lhs, rhs, dest: target }),
                BinaryOperator::StringConcat => program.emit(Insn::Concat { lhs, rhs, dest: target }),
                BinaryOperator::BitwiseAnd => program.emit(Insn::BitAnd { lhs, rhs, dest: target }),
                BinaryOperator::BitwiseOr => program.emit(Insn::BitOr { lhs, rhs, dest: target }),
                BinaryOperator::PGBitwiseShiftLeft => program.emit(Insn::ShiftLeft { lhs, rhs, dest: target }),
                BinaryOperator::PGBitwiseShiftRight => program.emit(Insn::ShiftRight { lhs, rhs, dest: target }),
                other => bail_parse_error!("unsupported binary operator: {other:?}"),
            };
            Ok(())
        }
    }
}

/// Comparisons set `target` to 1/0 via a conditional jump (spec table). For
/// non-`IS` variants a NULL operand on either side makes the result NULL.
fn emit_comparison(
    program: &mut ProgramBuilder,
    op: &BinaryOperator,
    lhs: usize,
    rhs: usize,
    target: usize,
    flags: CmpFlags,
) -> Result<()> {
    let null_path = program.allocate_address(crate::vdbe::builder::PlaceholderPurpose::Generic);
    if !flags.null_eq {
        program.emit(Insn::IsNull { reg: lhs, target_pc: crate::vdbe::Addr::Pending(null_path) });
        program.emit(Insn::IsNull { reg: rhs, target_pc: crate::vdbe::Addr::Pending(null_path) });
    }
    let is_true = program.allocate_address(crate::vdbe::builder::PlaceholderPurpose::Generic);
    let target_pc = crate::vdbe::Addr::Pending(is_true);
    match op {
        BinaryOperator::Eq => program.emit(Insn::Eq { lhs, rhs, target_pc, flags }),
        BinaryOperator::NotEq => program.emit(Insn::Ne { lhs, rhs, target_pc, flags }),
        BinaryOperator::Lt => program.emit(Insn::Lt { lhs, rhs, target_pc, flags }),
        BinaryOperator::LtEq => program.emit(Insn::Le { lhs, rhs, target_pc, flags }),
        BinaryOperator::Gt => program.emit(Insn::Gt { lhs, rhs, target_pc, flags }),
        BinaryOperator::GtEq => program.emit(Insn::Ge { lhs, rhs, target_pc, flags }),
        other => bail_parse_error!("not a comparison operator: {other:?}"),
    };
    program.emit(Insn::Integer { value: 0, dest: target });
    let end = program.allocate_address(crate::vdbe::builder::PlaceholderPurpose::Generic);
    program.emit(Insn::Goto { target_pc: crate::vdbe::Addr::Pending(end) });
    program.resolve_address(is_true)?;
    program.emit(Insn::Integer { value: 1, dest: target });
    if !flags.null_eq {
        program.emit(Insn::Goto { target_pc: crate::vdbe::Addr::Pending(end) });
        program.resolve_address(null_path)?;
        program.emit(Insn::Null { dest: target, dest_end: None });
    } else {
        program.resolve_address(null_path)?;
    }
    program.resolve_address(end)?;
    Ok(())
}

/// IN (literal list): build a set via an ephemeral table, scan it (spec
/// table). NULL lhs -> NULL; a matching non-NULL element -> TRUE; no match
/// but the list contained NULL -> NULL; else FALSE. NOT IN inverts
/// TRUE/FALSE and preserves NULL.
fn translate_in_list(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    ctx: &ExprCtx,
    lhs: &Expr,
    list: &[Expr],
    negated: bool,
    target: usize,
) -> Result<()> {
    let lhs_reg = program.allocate_register();
    translate_expr(program, catalog, ctx, lhs, lhs_reg)?;

    let lhs_null = program.allocate_address(crate::vdbe::builder::PlaceholderPurpose::Generic);
    program.emit(Insn::IsNull { reg: lhs_reg, target_pc: crate::vdbe::Addr::Pending(lhs_null) });

    let set_cursor = program.allocate_cursor();
    program.emit(Insn::OpenEphemeral {
        cursor_id: set_cursor,
        num_columns: 1,
        primary_key: vec![0],
        conflict: crate::vdbe::insn::ConflictMode::Ignore,
    });
    program.mark_cursor_opened(set_cursor);

    let has_null_reg = program.allocate_register();
    program.emit(Insn::Integer { value: 0, dest: has_null_reg });

    for item in list {
        let v = program.allocate_register();
        translate_expr(program, catalog, ctx, item, v)?;
        let item_null = program.allocate_address(crate::vdbe::builder::PlaceholderPurpose::Generic);
        program.emit(Insn::IsNull { reg: v, target_pc: crate::vdbe::Addr::Pending(item_null) });
        let rec = program.allocate_register();
        program.emit(Insn::MakeRecord { start_reg: v, count: 1, dest: rec });
        program.emit(Insn::VUpdate { cursor_id: set_cursor, argv_start_reg: rec, argv_count: 1, conflict: crate::vdbe::insn::ConflictMode::Ignore });
        let after = program.allocate_address(crate::vdbe::builder::PlaceholderPurpose::Generic);
        program.emit(Insn::Goto { target_pc: crate::vdbe::Addr::Pending(after) });
        program.resolve_address(item_null)?;
        program.emit(Insn::Integer { value: 1, dest: has_null_reg });
        program.resolve_address(after)?;
    }

    let rec = program.allocate_register();
    program.emit(Insn::MakeRecord { start_reg: lhs_reg, count: 1, dest: rec });
    let not_found = program.allocate_address(crate::vdbe::builder::PlaceholderPurpose::Generic);
    program.emit(Insn::VFilter {
        cursor_id: set_cursor,
        pc_if_empty: crate::vdbe::Addr::Pending(not_found),
        args_start_reg: rec,
        plan: crate::vdbe::insn::VFilterPlan { idx_num: 0, idx_str: None, n_args: 1 },
    });
    program.emit(Insn::Integer { value: if negated { 0 } else { 1 }, dest: target });
    let done = program.allocate_address(crate::vdbe::builder::PlaceholderPurpose::Generic);
    program.emit(Insn::Goto { target_pc: crate::vdbe::Addr::Pending(done) });
    program.resolve_address(not_found)?;
    let has_null_false = program.allocate_address(crate::vdbe::builder::PlaceholderPurpose::Generic);
    program.emit(Insn::IfFalse { reg: has_null_reg, target_pc: crate::vdbe::Addr::Pending(has_null_false), jump_if_null: false });
    program.emit(Insn::Null { dest: target, dest_end: None });
    program.emit(Insn::Goto { target_pc: crate::vdbe::Addr::Pending(done) });
    program.resolve_address(has_null_false)?;
    program.emit(Insn::Integer { value: if negated { 1 } else { 0 }, dest: target });
    program.emit(Insn::Goto { target_pc: crate::vdbe::Addr::Pending(done) });
    program.resolve_address(lhs_null)?;
    program.emit(Insn::Null { dest: target, dest_end: None });
    program.resolve_address(done)?;
    program.emit(Insn::Close { cursor_id: set_cursor });
    program.mark_cursor_closed(set_cursor);
    Ok(())
}

fn translate_case(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    ctx: &ExprCtx,
    operand: Option<&Expr>,
    conditions: &[Expr],
    results: &[Expr],
    else_result: Option<&Expr>,
    target: usize,
) -> Result<()> {
    let end = program.allocate_address(crate::vdbe::builder::PlaceholderPurpose::Generic);
    let mut next_check = None;
    for (cond, result) in conditions.iter().zip(results.iter()) {
        if let Some(p) = next_check.take() {
            program.resolve_address(p)?;
        }
        let effective_cond = match operand {
            Some(op) => Expr::BinaryOp { left: Box::new(op.clone()), op: BinaryOperator::Eq, right: Box::new(cond.clone()) },
            None => cond.clone(),
        };
        let cond_reg = program.allocate_register();
        translate_expr(program, catalog, ctx, &effective_cond, cond_reg)?;
        let skip = program.allocate_address(crate::vdbe::builder::PlaceholderPurpose::Generic);
        program.emit(Insn::IfFalse { reg: cond_reg, target_pc: crate::vdbe::Addr::Pending(skip), jump_if_null: true });
        translate_expr(program, catalog, ctx, result, target)?;
        program.emit(Insn::Goto { target_pc: crate::vdbe::Addr::Pending(end) });
        next_check = Some(skip);
    }
    if let Some(p) = next_check.take() {
        program.resolve_address(p)?;
    }
    match else_result {
        Some(e) => translate_expr(program, catalog, ctx, e, target)?,
        None => {
            program.emit(Insn::Null { dest: target, dest_end: None });
        }
    }
    program.resolve_address(end)?;
    Ok(())
}

pub(crate) fn function_args(func: &sqlparser::ast::Function) -> Vec<Expr> {
    use sqlparser::ast::{FunctionArg, FunctionArgExpr, FunctionArguments};
    match &func.args {
        FunctionArguments::List(list) => list
            .args
            .iter()
            .filter_map(|a| match a {
                FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) | FunctionArg::Named { arg: FunctionArgExpr::Expr(e), .. } => {
                    Some(e.clone())
                }
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn translate_function(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    ctx: &ExprCtx,
    func: &sqlparser::ast::Function,
    target: usize,
) -> Result<()> {
    let name = func.name.to_string();
    let args = function_args(func);

    let info = catalog.find_function(&name, args.len());
    match info.as_ref().map(|i| i.kind) {
        Some(FunctionKind::Aggregate) | Some(FunctionKind::Window) if func.over.is_none() => {
            // Aggregate (or window-named) function used in plain scalar
            // context outside HAVING/grouping: no override matched above,
            // so per spec table this evaluates to NULL.
            program.emit(Insn::Null { dest: target, dest_end: None });
            return Ok(());
        }
        _ => {}
    }

    let arg_start = if args.is_empty() { target } else { program.allocate_registers(args.len()) };
    for (i, a) in args.iter().enumerate() {
        translate_expr(program, catalog, ctx, a, arg_start + i)?;
    }

    program.emit(Insn::Function {
        start_reg: arg_start,
        arg_count: args.len(),
        dest: target,
        func: FuncDef { name, num_args: args.len() },
    });
    Ok(())
}

/// Correlation analysis pre-pass (spec §4.3): walks a subquery's AST and
/// collects outer-only column references.
pub fn find_correlated_columns(
    tables: &[JoinedTable],
    outer_tables: &[JoinedTable],
    expr: &Expr,
    out: &mut Vec<(CursorId, usize)>,
) {
    walk_for_correlation(tables, outer_tables, expr, out);
}

fn walk_for_correlation(
    tables: &[JoinedTable],
    outer_tables: &[JoinedTable],
    expr: &Expr,
    out: &mut Vec<(CursorId, usize)>,
) {
    if let Some((qualifier, name)) = split_ident(expr) {
        if resolve_column(tables, qualifier.as_deref(), &name).is_none() {
            if let Some((c, i)) = resolve_column(outer_tables, qualifier.as_deref(), &name) {
                if !out.contains(&(c, i)) {
                    out.push((c, i));
                }
            }
        }
        return;
    }
    match expr {
        Expr::BinaryOp { left, right, .. } => {
            walk_for_correlation(tables, outer_tables, left, out);
            walk_for_correlation(tables, outer_tables, right, out);
        }
        Expr::UnaryOp { expr, .. }
        | Expr::Nested(expr)
        | Expr::IsNull(expr)
        | Expr::IsNotNull(expr)
        | Expr::Cast { expr, .. }
        | Expr::Collate { expr, .. } => walk_for_correlation(tables, outer_tables, expr, out),
        Expr::Between { expr, low, high, .. } => {
            walk_for_correlation(tables, outer_tables, expr, out);
            walk_for_correlation(tables, outer_tables, low, out);
            walk_for_correlation(tables, outer_tables, high, out);
        }
        Expr::InList { expr, list, .. } => {
            walk_for_correlation(tables, outer_tables, expr, out);
            for e in list {
                walk_for_correlation(tables, outer_tables, e, out);
            }
        }
        Expr::Function(f) => {
            for a in function_args(f) {
                walk_for_correlation(tables, outer_tables, &a, out);
            }
        }
        Expr::Case { operand, conditions, results, else_result } => {
            if let Some(o) = operand {
                walk_for_correlation(tables, outer_tables, o, out);
            }
            for c in conditions {
                walk_for_correlation(tables, outer_tables, c, out);
            }
            for r in results {
                walk_for_correlation(tables, outer_tables, r, out);
            }
            if let Some(e) = else_result {
                walk_for_correlation(tables, outer_tables, e, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_decode_basic() {
        assert_eq!(hex_decode("68656c6c6f"), b"hello".to_vec());
    }

    #[test]
    fn param_key_positional() {
        let program = ProgramBuilder::new(crate::vdbe::builder::ProgramBuilderOpts {
            query_mode: crate::vdbe::builder::QueryMode::Normal,
            approx_num_insns: 8,
        });
        assert_eq!(parse_param_key("?", &program), ParamKey::Positional(1));
        assert_eq!(parse_param_key(":name", &program), ParamKey::Named(":name".to_string()));
    }
}
