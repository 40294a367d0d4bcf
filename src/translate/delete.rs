//! DELETE compiler (spec §4.8).
//!
//! Drives the same nested-loop/residual-WHERE engine as SELECT over a
//! single target cursor, and for every row that survives the WHERE clause
//! issues a `VRowid` read followed by a single-register `VUpdate` (the
//! `[rowid]`-only payload a vtab module reads as "delete this row").

use sqlparser::ast::{Delete, FromTable};

use crate::bail_parse_error;
use crate::catalog::Catalog;
use crate::vdbe::builder::ProgramBuilder;
use crate::vdbe::insn::Insn;
use crate::Result;

use super::emitter::compile_nested_loop;
use super::from::build_from;
use super::insert::conflict_mode;
use super::plan::WhereTerm;
use super::planner::{plan_cursors, split_conjuncts};

pub fn translate_delete(program: &mut ProgramBuilder, catalog: &dyn Catalog, delete: &Delete) -> Result<()> {
    let from = match &delete.from {
        FromTable::WithFromKeyword(f) | FromTable::WithoutKeyword(f) => f,
    };
    if from.len() != 1 || !from[0].joins.is_empty() {
        bail_parse_error!("DELETE supports a single target table only");
    }
    if delete.using.is_some() {
        bail_parse_error!("DELETE ... USING is not supported");
    }

    let tables = build_from(program, catalog, from)?;
    let target_cursor = tables[0].cursor;

    let mut where_terms: Vec<WhereTerm> = delete
        .selection
        .as_ref()
        .map(|w| split_conjuncts(w).into_iter().map(|expr| WhereTerm { expr, consumed: false }).collect())
        .unwrap_or_default();
    plan_cursors(program, catalog, &tables, &mut where_terms, &[])?;

    compile_nested_loop(program, catalog, &tables, &where_terms, &mut |program, _ctx| {
        let rowid_reg = program.allocate_register();
        program.emit(Insn::VRowid { cursor_id: target_cursor, dest: rowid_reg });
        program.emit(Insn::VUpdate {
            cursor_id: target_cursor,
            argv_start_reg: rowid_reg,
            argv_count: 1,
            conflict: conflict_mode(None),
        });
        Ok(())
    })?;

    program.emit(Insn::Close { cursor_id: target_cursor });
    program.mark_cursor_closed(target_cursor);
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
    fn delete_with_where_compiles_and_closes_cursor() {
        let catalog = catalog_with(users_schema());
        let sql = "delete from users where id = 7";
        let program = crate::compile_sql(&catalog, sql, &crate::CompileOptions::default()).unwrap();
        assert!(program
            .instructions
            .iter()
            .any(|i| matches!(i, crate::vdbe::insn::Insn::VRowid { .. })));
        assert!(program
            .instructions
            .iter()
            .any(|i| matches!(i, crate::vdbe::insn::Insn::VUpdate { argv_count: 1, .. })));
    }

    #[test]
    fn delete_without_where_scans_whole_table() {
        let catalog = catalog_with(users_schema());
        let sql = "delete from users";
        let program = crate::compile_sql(&catalog, sql, &crate::CompileOptions::default());
        assert!(program.is_ok(), "{program:?}");
    }
}
