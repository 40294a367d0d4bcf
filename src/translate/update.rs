//! UPDATE compiler (spec §4.8), sharing the NOT NULL/DEFAULT/CHECK helpers
//! defined alongside `insert`.
//!
//! Unassigned columns are read back from the cursor with `VColumn` so every
//! `VUpdate` carries a full `[rowid, col0, col1, ...]` row, matching the
//! payload shape INSERT produces.

use std::collections::HashMap;

use sqlparser::ast::{Assignment, AssignmentTarget, Expr, TableFactor, TableWithJoins};

use crate::bail_parse_error;
use crate::catalog::Catalog;
use crate::error::CompileError;
use crate::vdbe::builder::{CursorKind, ProgramBuilder};
use crate::vdbe::insn::{Insn, VtabHandle};
use crate::Result;

use super::emitter::compile_nested_loop;
use super::expr::translate_expr;
use super::insert::{conflict_mode, emit_check_constraints, emit_not_null_check};
use super::plan::{JoinConstraint, JoinKind, JoinedTable, TableSource, WhereTerm};
use super::planner::{plan_cursors, split_conjuncts};

pub fn translate_update(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    table: &TableWithJoins,
    assignments: &[Assignment],
    from: Option<&TableWithJoins>,
    selection: &Option<Expr>,
    or: Option<sqlparser::ast::SqliteOnConflict>,
) -> Result<()> {
    if from.is_some() {
        bail_parse_error!("UPDATE ... FROM is not supported");
    }
    if !table.joins.is_empty() {
        bail_parse_error!("UPDATE supports a single target table only");
    }
    let table_name = match &table.relation {
        TableFactor::Table { name, .. } => name.to_string(),
        other => bail_parse_error!("unsupported UPDATE target: {other}"),
    };

    let schema = catalog.find_table(&table_name)?;
    let conflict = conflict_mode(or);

    let mut assigned: HashMap<usize, &Expr> = HashMap::new();
    for a in assignments {
        let col_name = match &a.target {
            AssignmentTarget::ColumnName(name) => name
                .0
                .last()
                .ok_or_else(|| CompileError::Syntax {
                    message: "UPDATE assignment target has no column name".to_string(),
                    location: None,
                })?
                .value
                .clone(),
            AssignmentTarget::Tuple(_) => bail_parse_error!("tuple assignment targets are not supported"),
        };
        let idx = schema.column_index(&col_name).ok_or_else(|| CompileError::Syntax {
            message: format!("table {table_name} has no column named {col_name}"),
            location: None,
        })?;
        if assigned.insert(idx, &a.value).is_some() {
            bail_parse_error!("column '{col_name}' assigned more than once in UPDATE");
        }
    }

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

    let tables = vec![JoinedTable {
        cursor,
        alias: table_name.clone(),
        source: TableSource::Base { table_name: table_name.clone() },
        schema: schema.clone(),
        join_kind: JoinKind::Cross,
        constraint: JoinConstraint::None,
    }];

    let mut where_terms: Vec<WhereTerm> = selection
        .as_ref()
        .map(|w| split_conjuncts(w).into_iter().map(|expr| WhereTerm { expr, consumed: false }).collect())
        .unwrap_or_default();
    plan_cursors(program, catalog, &tables, &mut where_terms, &[])?;

    compile_nested_loop(program, catalog, &tables, &where_terms, &mut |program, ctx| {
        let base = program.allocate_registers(schema.columns.len() + 1);
        let rowid_reg = base;
        let col_base = base + 1;
        program.emit(Insn::VRowid { cursor_id: cursor, dest: rowid_reg });

        for (i, col) in schema.columns.iter().enumerate() {
            let dest = col_base + i;
            match assigned.get(&i) {
                Some(expr) => translate_expr(program, catalog, ctx, expr, dest)?,
                None => {
                    program.emit(Insn::VColumn { cursor_id: cursor, column: i, dest });
                }
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
        Ok(())
    })?;

    program.emit(Insn::Close { cursor_id: cursor });
    program.mark_cursor_closed(cursor);
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::catalog::{ColumnFlags, ColumnSchema, DefaultValue, TableSchema};
    use crate::value::{Affinity, Value};
    use crate::StaticCatalog;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn users_schema() -> TableSchema {
        TableSchema {
            name: "users".to_string(),
            columns: vec![
                ColumnSchema { name: "id".to_string(), affinity: Affinity::Integer, flags: ColumnFlags::PRIMARY_KEY, default: None },
                ColumnSchema { name: "name".to_string(), affinity: Affinity::Text, flags: ColumnFlags::NOT_NULL, default: None },
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

    fn catalog_with(schema: TableSchema) -> StaticCatalog {
        let mut tables = HashMap::new();
        tables.insert(schema.name.to_ascii_lowercase(), Arc::new(schema));
        StaticCatalog { tables, functions: vec![], modules: HashMap::new() }
    }

    #[test]
    fn update_single_column_reads_back_the_rest() {
        let catalog = catalog_with(users_schema());
        let sql = "update users set age = 30 where id = 1";
        let program = crate::compile_sql(&catalog, sql, &crate::CompileOptions::default()).unwrap();
        let vupdates: Vec<_> = program
            .instructions
            .iter()
            .filter_map(|i| match i {
                crate::vdbe::insn::Insn::VUpdate { argv_count, .. } => Some(*argv_count),
                _ => None,
            })
            .collect();
        assert_eq!(vupdates, vec![4]);
        assert!(program
            .instructions
            .iter()
            .any(|i| matches!(i, crate::vdbe::insn::Insn::VColumn { .. })));
    }

    #[test]
    fn update_setting_not_null_column_to_null_still_compiles_with_constraint_check() {
        let catalog = catalog_with(users_schema());
        let sql = "update users set name = null where id = 1";
        let program = crate::compile_sql(&catalog, sql, &crate::CompileOptions::default()).unwrap();
        assert!(program
            .instructions
            .iter()
            .any(|i| matches!(i, crate::vdbe::insn::Insn::ConstraintViolation { .. })));
    }

    #[test]
    fn update_duplicate_assignment_is_a_compile_error() {
        let catalog = catalog_with(users_schema());
        let sql = "update users set age = 1, age = 2 where id = 1";
        let program = crate::compile_sql(&catalog, sql, &crate::CompileOptions::default());
        assert!(program.is_err());
    }
}
