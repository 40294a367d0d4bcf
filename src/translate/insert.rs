//! INSERT compiler (spec §4.8), plus the NOT NULL/DEFAULT/CHECK helpers
//! shared with `update` (spec §4.8 "evaluate all CHECK expressions with the
//! proposed row values available as arguments").

use std::collections::{HashMap, HashSet};

use sqlparser::ast::{Expr, Ident, Insert, SetExpr, SqliteOnConflict};

use crate::catalog::{Catalog, DefaultValue, TableSchema};
use crate::value::Value;
use crate::vdbe::builder::{CursorKind, PlaceholderPurpose, ProgramBuilder};
use crate::vdbe::insn::{ConflictMode, Insn, VtabHandle};
use crate::vdbe::Addr;
use crate::{bail_parse_error, Result};

use super::expr::{translate_expr, ExprCtx};

pub fn translate_insert(program: &mut ProgramBuilder, catalog: &dyn Catalog, insert: &Insert) -> Result<()> {
    let table_name = insert.table_name.to_string();
    let schema = catalog.find_table(&table_name)?;
    let conflict = conflict_mode(insert.or);

    let target_columns: Vec<usize> = if insert.columns.is_empty() {
        (0..schema.columns.len()).collect()
    } else {
        let mut seen = HashSet::new();
        insert
            .columns
            .iter()
            .map(|c| {
                if !seen.insert(c.value.to_ascii_lowercase()) {
                    bail_parse_error!("duplicate column name '{}' in INSERT column list", c.value);
                }
                schema.column_index(&c.value).ok_or_else(|| crate::error::CompileError::Syntax {
                    message: format!("table {table_name} has no column named {}", c.value),
                    location: None,
                })
            })
            .collect::<Result<Vec<_>>>()?
    };

    let rows: Vec<Vec<Expr>> = match insert.source.as_deref().map(|q| &q.body) {
        None => vec![Vec::new()],
        Some(SetExpr::Values(values)) => values.rows.clone(),
        Some(other) => bail_parse_error!("unsupported INSERT source: {other:?}"),
    };

    let cursor = program.allocate_cursor();
    program.table_schemas.insert(cursor, CursorKind::Table(schema.clone()));
    program.emit(Insn::OpenWrite {
        cursor_id: cursor,
        table: VtabHandle {
            table_name: table_name.clone(),
            module: schema.module.clone(),
            columns: schema.columns.clone(),
        },
    });
    program.mark_cursor_opened(cursor);

    let ctx = ExprCtx::new(&[]);
    for row in &rows {
        if row.len() > target_columns.len() {
            bail_parse_error!(
                "table {table_name} has {} columns but {} values were supplied",
                target_columns.len(),
                row.len()
            );
        }

        let base = program.allocate_registers(schema.columns.len() + 1);
        let rowid_reg = base;
        program.emit(Insn::Null { dest: rowid_reg, dest_end: None });
        let col_base = base + 1;

        let mut provided: Vec<Option<&Expr>> = vec![None; schema.columns.len()];
        for (pos, &col_idx) in target_columns.iter().enumerate() {
            if let Some(expr) = row.get(pos) {
                provided[col_idx] = Some(expr);
            }
        }

        for (col_idx, col) in schema.columns.iter().enumerate() {
            let dest = col_base + col_idx;
            match provided[col_idx] {
                Some(expr) => translate_expr(program, catalog, &ctx, expr, dest)?,
                None => emit_default(program, catalog, col.default.as_ref(), dest)?,
            }
            if col.not_null() {
                emit_not_null_check(program, dest, &table_name, &col.name, conflict)?;
            }
        }

        emit_check_constraints(program, catalog, &schema, col_base, conflict)?;

        program.emit(Insn::VUpdate {
            cursor_id: cursor,
            argv_start_reg: rowid_reg,
            argv_count: schema.columns.len() + 1,
            conflict,
        });
    }

    program.emit(Insn::Close { cursor_id: cursor });
    program.mark_cursor_closed(cursor);
    Ok(())
}

pub(super) fn conflict_mode(or: Option<SqliteOnConflict>) -> ConflictMode {
    match or {
        Some(SqliteOnConflict::Rollback) => ConflictMode::Rollback,
        Some(SqliteOnConflict::Abort) => ConflictMode::Abort,
        Some(SqliteOnConflict::Fail) => ConflictMode::Fail,
        Some(SqliteOnConflict::Ignore) => ConflictMode::Ignore,
        Some(SqliteOnConflict::Replace) => ConflictMode::Replace,
        None => ConflictMode::Abort,
    }
}

pub(super) fn emit_default(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    default: Option<&DefaultValue>,
    dest: usize,
) -> Result<()> {
    match default {
        None => {
            program.emit(Insn::Null { dest, dest_end: None });
            Ok(())
        }
        Some(DefaultValue::Literal(v)) => {
            emit_value(program, v, dest);
            Ok(())
        }
        Some(DefaultValue::Expr(e)) => translate_expr(program, catalog, &ExprCtx::new(&[]), e, dest),
    }
}

fn emit_value(program: &mut ProgramBuilder, value: &Value, dest: usize) {
    match value {
        Value::Null => {
            program.emit(Insn::Null { dest, dest_end: None });
        }
        Value::Integer(i) => {
            if let Ok(v) = i32::try_from(*i) {
                program.emit(Insn::Integer { value: v, dest });
            } else {
                program.add_constant(Value::Integer(*i));
                program.emit(Insn::Int64 { value: *i, dest });
            }
        }
        Value::Real(f) => {
            program.add_constant(Value::Real(*f));
            program.emit(Insn::Real { value: *f, dest });
        }
        Value::Text(s) => {
            program.add_constant(Value::Text(s.clone()));
            program.emit(Insn::String8 { value: s.clone(), dest });
        }
        Value::Blob(b) => {
            program.add_constant(Value::Blob(b.clone()));
            program.emit(Insn::Blob { value: b.clone(), dest });
        }
    }
}

/// Raises a `ConstraintViolation` unless `reg` is non-NULL.
pub(super) fn emit_not_null_check(
    program: &mut ProgramBuilder,
    reg: usize,
    table_name: &str,
    col_name: &str,
    conflict: ConflictMode,
) -> Result<()> {
    let ok = program.allocate_address(PlaceholderPurpose::Generic);
    program.emit(Insn::NotNull { reg, target_pc: Addr::Pending(ok) });
    program.emit(Insn::ConstraintViolation {
        message: format!("NOT NULL constraint failed: {table_name}.{col_name}"),
        conflict,
    });
    program.resolve_address(ok)?;
    Ok(())
}

/// Evaluates every CHECK expression against a row already materialized in
/// `base..base+ncols`. Column references inside the CHECK expression are
/// resolved by overriding their `Expr::to_string()` form to the already
/// computed register directly (the same "compute once, substitute by
/// rendered-expression key" mechanism `ExprCtx::overrides` already provides
/// for HAVING/window-result substitution), since the proposed row has no
/// backing cursor to `VColumn` from yet.
pub(super) fn emit_check_constraints(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    schema: &TableSchema,
    base: usize,
    conflict: ConflictMode,
) -> Result<()> {
    if schema.checks.is_empty() {
        return Ok(());
    }
    let mut overrides = HashMap::new();
    for (i, col) in schema.columns.iter().enumerate() {
        overrides.insert(Expr::Identifier(Ident::new(col.name.clone())).to_string(), base + i);
    }
    let ctx = ExprCtx::new(&[]).with_overrides(&overrides);
    for check in &schema.checks {
        let v = program.allocate_register();
        translate_expr(program, catalog, &ctx, check, v)?;
        let ok = program.allocate_address(PlaceholderPurpose::Generic);
        // NULL is treated as satisfying the CHECK, matching SQL's
        // three-valued semantics for constraint evaluation.
        program.emit(Insn::IfTrue { reg: v, target_pc: Addr::Pending(ok), jump_if_null: true });
        program.emit(Insn::ConstraintViolation {
            message: format!("CHECK constraint failed: {check}"),
            conflict,
        });
        program.resolve_address(ok)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnFlags, ColumnSchema};
    use crate::value::Affinity;
    use crate::StaticCatalog;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn catalog_with(schema: TableSchema) -> StaticCatalog {
        let mut tables = HashMap::new();
        tables.insert(schema.name.to_ascii_lowercase(), Arc::new(schema));
        StaticCatalog {
            tables,
            functions: vec![],
            modules: HashMap::new(),
        }
    }

    fn users_schema() -> TableSchema {
        TableSchema {
            name: "users".to_string(),
            columns: vec![
                ColumnSchema {
                    name: "id".to_string(),
                    affinity: Affinity::Integer,
                    flags: ColumnFlags::PRIMARY_KEY,
                    default: None,
                },
                ColumnSchema {
                    name: "name".to_string(),
                    affinity: Affinity::Text,
                    flags: ColumnFlags::NOT_NULL,
                    default: None,
                },
                ColumnSchema {
                    name: "age".to_string(),
                    affinity: Affinity::Integer,
                    flags: ColumnFlags::empty(),
                    default: Some(DefaultValue::Literal(Value::Integer(0))),
                },
            ],
            primary_key: vec![0],
            indexes: vec![],
            checks: vec![],
            module: "memtable".to_string(),
            module_args: vec![],
        }
    }

    #[test]
    fn insert_values_fills_defaults_and_closes_cursor() {
        let catalog = catalog_with(users_schema());
        let sql = "insert into users (id, name) values (1, 'alice')";
        let program = crate::compile_sql(&catalog, sql, &crate::CompileOptions::default());
        assert!(program.is_ok(), "{program:?}");
    }

    #[test]
    fn insert_missing_not_null_column_still_compiles_with_constraint_check() {
        // Compiling always succeeds; the NOT NULL violation is a runtime
        // ConstraintViolation emitted into the program, not a compile error.
        let catalog = catalog_with(users_schema());
        let sql = "insert into users (id) values (1)";
        let program = crate::compile_sql(&catalog, sql, &crate::CompileOptions::default()).unwrap();
        assert!(program
            .instructions
            .iter()
            .any(|i| matches!(i, crate::vdbe::insn::Insn::ConstraintViolation { .. })));
    }

    #[test]
    fn default_values_inserts_one_row() {
        let mut schema = users_schema();
        schema.columns[1].flags = ColumnFlags::empty();
        let catalog = catalog_with(schema);
        let sql = "insert into users default values";
        let program = crate::compile_sql(&catalog, sql, &crate::CompileOptions::default()).unwrap();
        let updates = program
            .instructions
            .iter()
            .filter(|i| matches!(i, crate::vdbe::insn::Insn::VUpdate { .. }))
            .count();
        assert_eq!(updates, 1);
    }
}
