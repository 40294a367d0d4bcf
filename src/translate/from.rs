//! FROM-clause cursor opening and join-level flattening (spec §4.5).
//!
//! Recurses the FROM clause left-to-right, opening a cursor per source and
//! producing the flattened `JoinedTable` list the SELECT orchestrator walks
//! to build its nested-loop scaffold.

use std::sync::Arc;

use sqlparser::ast::{
    Join, JoinConstraint as AstJoinConstraint, JoinOperator, TableFactor, TableWithJoins,
};
use tracing::warn;

use crate::bail_parse_error;
use crate::catalog::{Catalog, TableSchema};
use crate::vdbe::builder::{CursorKind, ProgramBuilder};
use crate::vdbe::insn::{Insn, VtabHandle};
use crate::Result;

use super::plan::{JoinConstraint, JoinKind, JoinedTable, TableSource};

/// FROM pre-pass (spec §4.5). Opens cursors immediately (`OpenRead`) for
/// base tables and table-valued functions; subquery sources are registered
/// here but compiled later by the caller via `emit_subqueries` once the
/// whole table list (and thus correlation targets) is known.
pub fn build_from(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    from: &[TableWithJoins],
) -> Result<Vec<JoinedTable>> {
    let mut tables = Vec::new();
    for twj in from {
        bind_one(program, catalog, &twj.relation, JoinKind::Cross, JoinConstraint::None, &mut tables)?;
        for join in &twj.joins {
            bind_join(program, catalog, join, &mut tables)?;
        }
    }
    check_duplicate_aliases(&tables)?;
    Ok(tables)
}

fn check_duplicate_aliases(tables: &[JoinedTable]) -> Result<()> {
    for (i, a) in tables.iter().enumerate() {
        for b in &tables[i + 1..] {
            if a.alias.eq_ignore_ascii_case(&b.alias) {
                bail_parse_error!("ambiguous alias: {} appears more than once in FROM", a.alias);
            }
        }
    }
    Ok(())
}

fn bind_join(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    join: &Join,
    tables: &mut Vec<JoinedTable>,
) -> Result<()> {
    let (kind, constraint) = match &join.join_operator {
        JoinOperator::Inner(c) => (JoinKind::Inner, from_ast_constraint(c)),
        JoinOperator::LeftOuter(c) => (JoinKind::Left, from_ast_constraint(c)),
        JoinOperator::CrossJoin => (JoinKind::Cross, JoinConstraint::None),
        // Natural join column matching is not implemented (spec §9 open
        // question): fall back to CROSS with a warning, same as the source.
        other => {
            warn!("join type {other:?} not implemented; falling back to CROSS JOIN");
            (JoinKind::Cross, JoinConstraint::None)
        }
    };
    let start = tables.len();
    bind_one(program, catalog, &join.relation, kind, constraint, tables)?;
    // A join that asked for ON/USING but bound to a NestedJoin (multiple
    // physical levels) attaches its condition to the *last* level added,
    // per spec §4.5 "the last level added carries the join type... from
    // this node".
    if tables.len() > start + 1 {
        let last = tables.len() - 1;
        let moved_kind = tables[start].join_kind;
        let moved_constraint = std::mem::replace(&mut tables[start].constraint, JoinConstraint::None);
        tables[start].join_kind = JoinKind::Cross;
        tables[last].join_kind = moved_kind;
        tables[last].constraint = moved_constraint;
    }
    Ok(())
}

fn from_ast_constraint(c: &AstJoinConstraint) -> JoinConstraint {
    match c {
        AstJoinConstraint::On(expr) => JoinConstraint::On(expr.clone()),
        AstJoinConstraint::Using(cols) => JoinConstraint::Using(
            cols.iter()
                .map(|oc| oc.to_string().trim_matches(|c| c == '"' || c == '`').to_string())
                .collect(),
        ),
        AstJoinConstraint::Natural => {
            warn!("NATURAL join column matching not implemented; falling back to CROSS JOIN");
            JoinConstraint::None
        }
        AstJoinConstraint::None => JoinConstraint::None,
    }
}

fn bind_one(
    program: &mut ProgramBuilder,
    catalog: &dyn Catalog,
    factor: &TableFactor,
    join_kind: JoinKind,
    constraint: JoinConstraint,
    tables: &mut Vec<JoinedTable>,
) -> Result<()> {
    match factor {
        TableFactor::Table { name, alias, args, .. } => {
            let raw_name = name.to_string();
            let alias_name = alias
                .as_ref()
                .map(|a| a.name.value.clone())
                .unwrap_or_else(|| raw_name.clone());

            if let Some(table_args) = args {
                // Table-valued function: resolve module, pass literal string
                // arguments verbatim to the module's connect (spec §4.5).
                let arg_strings: Vec<String> = table_args
                    .args
                    .iter()
                    .map(|a| a.to_string())
                    .collect();
                let module = catalog.get_vtab_module(&raw_name).ok_or_else(|| {
                    crate::error::CompileError::Syntax {
                        message: format!("no such table-valued function: {raw_name}"),
                        location: None,
                    }
                })?;
                let schema = Arc::new(module.connect(&raw_name, &alias_name, &arg_strings)?);
                let cursor = program.allocate_cursor();
                program.table_aliases.insert(alias_name.to_ascii_lowercase(), cursor);
                program.table_schemas.insert(cursor, CursorKind::Table(schema.clone()));
                program.emit(Insn::OpenRead {
                    cursor_id: cursor,
                    table: VtabHandle {
                        table_name: alias_name.clone(),
                        module: schema.module.clone(),
                        columns: schema.columns.clone(),
                    },
                });
                program.mark_cursor_opened(cursor);
                tables.push(JoinedTable {
                    cursor,
                    alias: alias_name.clone(),
                    source: TableSource::TableValuedFunction {
                        name: raw_name,
                        args: arg_strings,
                    },
                    schema,
                    join_kind,
                    constraint,
                });
                return Ok(());
            }

            // CTE map is checked first (spec §4.5): a CTE-named reference
            // binds to the CTE's cursor rather than opening a real table.
            if let Some(cte) = program.cte_map.get(&raw_name.to_ascii_lowercase()).cloned() {
                program.table_aliases.insert(alias_name.to_ascii_lowercase(), cte.cursor);
                tables.push(JoinedTable {
                    cursor: cte.cursor,
                    alias: alias_name,
                    source: TableSource::Cte { name: raw_name },
                    schema: cte.schema,
                    join_kind,
                    constraint,
                });
                return Ok(());
            }

            let schema = catalog.find_table(&raw_name)?;
            let cursor = program.allocate_cursor();
            program.table_aliases.insert(alias_name.to_ascii_lowercase(), cursor);
            program.table_schemas.insert(cursor, CursorKind::Table(schema.clone()));
            program.emit(Insn::OpenRead {
                cursor_id: cursor,
                table: VtabHandle {
                    table_name: raw_name.clone(),
                    module: schema.module.clone(),
                    columns: schema.columns.clone(),
                },
            });
            program.mark_cursor_opened(cursor);
            tables.push(JoinedTable {
                cursor,
                alias: alias_name,
                source: TableSource::Base { table_name: raw_name },
                schema,
                join_kind,
                constraint,
            });
            Ok(())
        }
        TableFactor::Derived { subquery, alias, .. } => {
            let alias_name = alias
                .as_ref()
                .map(|a| a.name.value.clone())
                .ok_or_else(|| crate::error::CompileError::Syntax {
                    message: "subquery in FROM clause requires an alias".to_string(),
                    location: None,
                })?;
            let mut schema = super::select::infer_subquery_schema(catalog, subquery, &alias_name)?;
            if let Some(a) = alias {
                super::select::apply_column_aliases(&mut schema, &a.columns)?;
            }
            let cursor = program.allocate_cursor();
            program.table_aliases.insert(alias_name.to_ascii_lowercase(), cursor);
            program.table_schemas.insert(cursor, CursorKind::Ephemeral(Arc::new(schema.clone())));
            program.emit(Insn::OpenEphemeral {
                cursor_id: cursor,
                num_columns: schema.columns.len(),
                primary_key: vec![],
                conflict: crate::vdbe::insn::ConflictMode::Abort,
            });
            program.mark_cursor_opened(cursor);
            tables.push(JoinedTable {
                cursor,
                alias: alias_name,
                source: TableSource::Subquery { query: subquery.clone() },
                schema: Arc::new(schema),
                join_kind,
                constraint,
            });
            Ok(())
        }
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            bind_one(
                program,
                catalog,
                &table_with_joins.relation,
                join_kind,
                constraint,
                tables,
            )?;
            for join in &table_with_joins.joins {
                bind_join(program, catalog, join, tables)?;
            }
            Ok(())
        }
        other => bail_parse_error!("unsupported FROM clause source: {other}"),
    }
}

/// Resolve a column name against the active cursor set at a given scope,
/// erroring on ambiguity (spec §4.3 "unqualified names must resolve
/// unambiguously across active cursors").
pub fn resolve_column(
    tables: &[JoinedTable],
    qualifier: Option<&str>,
    column: &str,
) -> Option<(crate::vdbe::CursorId, usize)> {
    let mut found = None;
    for t in tables {
        if let Some(q) = qualifier {
            if !t.alias.eq_ignore_ascii_case(q) {
                continue;
            }
        }
        if let Some(idx) = t.schema.column_index(column) {
            if found.is_some() {
                if qualifier.is_some() {
                    // Qualified reference matched the same alias twice only
                    // if the FROM clause itself has a duplicate alias, which
                    // `check_duplicate_aliases` already rejects.
                    return found;
                }
                return None;
            }
            found = Some((t.cursor, idx));
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnFlags, ColumnSchema};
    use crate::value::Affinity;
    use crate::vdbe::builder::{ProgramBuilder, ProgramBuilderOpts, QueryMode};
    use crate::StaticCatalog;
    use sqlparser::dialect::SQLiteDialect;
    use sqlparser::parser::Parser;
    use std::collections::HashMap;

    fn schema(name: &str) -> TableSchema {
        TableSchema {
            name: name.to_string(),
            columns: vec![ColumnSchema {
                name: "a".to_string(),
                affinity: Affinity::Integer,
                flags: ColumnFlags::empty(),
                default: None,
            }],
            primary_key: vec![],
            indexes: vec![],
            checks: vec![],
            module: "memtable".to_string(),
            module_args: vec![],
        }
    }

    fn catalog_with(names: &[&str]) -> StaticCatalog {
        let mut tables = HashMap::new();
        for n in names {
            tables.insert(n.to_string(), Arc::new(schema(n)));
        }
        StaticCatalog { tables, functions: vec![], modules: HashMap::new() }
    }

    fn from_clause(sql: &str) -> Vec<TableWithJoins> {
        let stmts = Parser::parse_sql(&SQLiteDialect {}, sql).unwrap();
        match &stmts[0] {
            sqlparser::ast::Statement::Query(q) => match &*q.body {
                sqlparser::ast::SetExpr::Select(s) => s.from.clone(),
                _ => panic!("not a SELECT"),
            },
            _ => panic!("not a query"),
        }
    }

    #[test]
    fn duplicate_alias_is_rejected() {
        let catalog = catalog_with(&["t"]);
        let mut program = ProgramBuilder::new(ProgramBuilderOpts { query_mode: QueryMode::Normal, approx_num_insns: 8 });
        let from = from_clause("select * from t, t");
        let err = build_from(&mut program, &catalog, &from);
        assert!(err.is_err());
    }

    #[test]
    fn unqualified_column_present_on_two_tables_is_ambiguous() {
        let catalog = catalog_with(&["t", "u"]);
        let mut program = ProgramBuilder::new(ProgramBuilderOpts { query_mode: QueryMode::Normal, approx_num_insns: 8 });
        let from = from_clause("select * from t, u");
        let tables = build_from(&mut program, &catalog, &from).unwrap();
        assert_eq!(resolve_column(&tables, None, "a"), None);
        assert!(resolve_column(&tables, Some("t"), "a").is_some());
    }

    #[test]
    fn natural_join_falls_back_to_cross_with_no_constraint() {
        let catalog = catalog_with(&["t", "u"]);
        let mut program = ProgramBuilder::new(ProgramBuilderOpts { query_mode: QueryMode::Normal, approx_num_insns: 8 });
        let from = from_clause("select * from t natural join u");
        let tables = build_from(&mut program, &catalog, &from).unwrap();
        assert_eq!(tables[1].join_kind, JoinKind::Cross);
        assert!(matches!(tables[1].constraint, JoinConstraint::None));
    }

    #[test]
    fn base_table_open_emits_matching_open_read() {
        let catalog = catalog_with(&["t"]);
        let mut program = ProgramBuilder::new(ProgramBuilderOpts { query_mode: QueryMode::Normal, approx_num_insns: 8 });
        let from = from_clause("select * from t");
        let tables = build_from(&mut program, &catalog, &from).unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].alias, "t");
    }
}
