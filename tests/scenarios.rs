//! End-to-end compile scenarios straight from the spec's testable-properties
//! section: schema + SQL in, assertions about the emitted `Program` out.
//! These exercise the full dispatch -> FROM -> plan -> orchestrator ->
//! expression-compiler pipeline, the way the teacher's `tests/integration`
//! crate drives full query compilation rather than unit-testing one pass at
//! a time.

use std::collections::HashMap;
use std::sync::Arc;

use vtab_sql_compiler::catalog::{ColumnFlags, ColumnSchema, TableSchema};
use vtab_sql_compiler::value::Affinity;
use vtab_sql_compiler::vdbe::insn::Insn;
use vtab_sql_compiler::vtab::{AccessPlan, ConstraintOp, IndexInfo, VirtualTableModule};
use vtab_sql_compiler::{compile_sql, CompileOptions, StaticCatalog};

/// A module granting a PK-equality plan whenever an `Eq` constraint lands on
/// column 0, and a full scan otherwise (spec §8 scenario 1).
struct PkEqModule;

impl VirtualTableModule for PkEqModule {
    fn connect(&self, _module: &str, _table: &str, _opts: &[String]) -> vtab_sql_compiler::Result<TableSchema> {
        unreachable!("StaticCatalog resolves tables directly; connect is not exercised here")
    }

    fn best_index(&self, _table: &TableSchema, info: &IndexInfo) -> vtab_sql_compiler::Result<AccessPlan> {
        let mut usage = vec![vtab_sql_compiler::vtab::ConstraintUsage::default(); info.constraints.len()];
        let mut idx_num = 0;
        for (i, c) in info.constraints.iter().enumerate() {
            if c.column == 0 && c.op == ConstraintOp::Eq && c.usable {
                usage[i] = vtab_sql_compiler::vtab::ConstraintUsage { argv_index: Some(1), omit: true };
                idx_num = 1;
            }
        }
        Ok(AccessPlan {
            idx_num,
            idx_str: None,
            usage,
            order_by_consumed: false,
            estimated_cost: if idx_num != 0 { 1.0 } else { 1_000_000.0 },
            estimated_rows: if idx_num != 0 { 1 } else { 1_000_000 },
            explanation: None,
        })
    }
}

fn table_t() -> TableSchema {
    TableSchema {
        name: "t".to_string(),
        columns: vec![
            ColumnSchema { name: "a".to_string(), affinity: Affinity::Integer, flags: ColumnFlags::PRIMARY_KEY, default: None },
            ColumnSchema { name: "b".to_string(), affinity: Affinity::Text, flags: ColumnFlags::NOT_NULL, default: None },
        ],
        primary_key: vec![0],
        indexes: vec![],
        checks: vec![],
        module: "pkeq".to_string(),
        module_args: vec![],
    }
}

fn catalog_with(tables: Vec<TableSchema>) -> StaticCatalog {
    let mut map = HashMap::new();
    for schema in tables {
        map.insert(schema.name.to_ascii_lowercase(), Arc::new(schema));
    }
    let mut modules: HashMap<String, Arc<dyn VirtualTableModule>> = HashMap::new();
    modules.insert("pkeq".to_string(), Arc::new(PkEqModule));
    modules.insert("memtable".to_string(), Arc::new(PkEqModule));
    StaticCatalog { tables: map, functions: vec![], modules }
}

/// Scenario 1: `SELECT a,b FROM t WHERE a=3` plans a PK-equality `VFilter`
/// with one handled, omitted constraint bound to the literal `3`.
#[test]
fn scenario_pk_equality_plan() {
    let catalog = catalog_with(vec![table_t()]);
    let program = compile_sql(&catalog, "select a, b from t where a = 3", &CompileOptions::default()).unwrap();

    let filter = program
        .instructions
        .iter()
        .find_map(|i| match i {
            Insn::VFilter { plan, .. } => Some(plan),
            _ => None,
        })
        .expect("a VFilter must be emitted");
    assert_ne!(filter.idx_num, 0, "plan must use the PK-equality index");
    assert_eq!(filter.n_args, 1);
    assert!(program.constants.iter().any(|c| matches!(c, vtab_sql_compiler::value::Value::Integer(3))) ||
        program.instructions.iter().any(|i| matches!(i, Insn::Integer { value: 3, .. })));
}

/// Scenario 4: `SELECT a FROM t LEFT JOIN u ON t.a=u.a` reaches the row
/// processor for the unmatched outer row with the inner side null-padded.
#[test]
fn scenario_left_join_null_pads_unmatched_row() {
    let mut u = table_t();
    u.name = "u".to_string();
    let catalog = catalog_with(vec![table_t(), u]);
    let program = compile_sql(
        &catalog,
        "select t.a from t left join u on t.a = u.a",
        &CompileOptions::default(),
    )
    .unwrap();

    assert!(program.instructions.iter().any(|i| matches!(i, Insn::Null { .. })));
    let opens = program.instructions.iter().filter(|i| matches!(i, Insn::OpenRead { .. })).count();
    assert_eq!(opens, 2);
}

/// Scenario 2/3: COUNT(*) and GROUP BY both compile to one `AggStep` per
/// group key / row and exactly one `AggFinal` per finalize iteration.
#[test]
fn scenario_count_star_and_group_by_sum() {
    let catalog = catalog_with(vec![table_t()]);

    let count = compile_sql(&catalog, "select count(*) from t", &CompileOptions::default()).unwrap();
    assert!(count.instructions.iter().any(|i| matches!(i, Insn::AggStep { .. })));
    assert!(count.instructions.iter().any(|i| matches!(i, Insn::AggFinal { .. })));

    let grouped = compile_sql(&catalog, "select a, sum(length(b)) from t group by a", &CompileOptions::default()).unwrap();
    assert!(grouped.instructions.iter().any(|i| matches!(i, Insn::AggGroupValue { .. })));
}

/// Scenario 5: a bounded recursive CTE compiles to a fixpoint loop driven by
/// a `SeekRowid` over the FIFO queue cursor.
#[test]
fn scenario_recursive_cte_counts_to_three() {
    let catalog = catalog_with(vec![]);
    let sql = "with recursive r(n) as (select 1 union all select n+1 from r where n<3) select n from r";
    let program = compile_sql(&catalog, sql, &CompileOptions::default()).unwrap();
    assert!(program.instructions.iter().any(|i| matches!(i, Insn::SeekRowid { .. })));
    let ephemeral = program.instructions.iter().filter(|i| matches!(i, Insn::OpenEphemeral { .. })).count();
    assert!(ephemeral >= 2);
}

/// Scenario 6: `row_number() OVER (PARTITION BY a ORDER BY b)` drives the
/// sort-based window processor (a sorter populated then `Sort`ed).
#[test]
fn scenario_row_number_over_partition() {
    let catalog = catalog_with(vec![table_t()]);
    let sql = "select row_number() over (partition by a order by b) from t";
    let program = compile_sql(&catalog, sql, &CompileOptions::default()).unwrap();
    assert!(program.instructions.iter().any(|i| matches!(i, Insn::Sort { .. })));
    assert!(program.instructions.iter().any(|i| matches!(i, Insn::AggFinal { .. })));
}

/// Subquery cardinality: `= (subquery)` with a subquery returning no rows or
/// one row must still compile (the >1-row error is a runtime `Halt`, not a
/// compile failure per spec §4.4/§8).
#[test]
fn scalar_subquery_comparison_compiles() {
    let catalog = catalog_with(vec![table_t()]);
    let sql = "select a from t where a = (select a from t where b = 'x')";
    let program = compile_sql(&catalog, sql, &CompileOptions::default());
    assert!(program.is_ok(), "{program:?}");
}

/// EXISTS never produces NULL: the compiled comparison result register is
/// always written via a 0/1 jump pattern, never a bare `Null` emission for
/// the EXISTS result itself.
#[test]
fn exists_subquery_compiles_to_boolean_result() {
    let catalog = catalog_with(vec![table_t()]);
    let sql = "select a from t where exists (select 1 from t as u where u.a = t.a)";
    let program = compile_sql(&catalog, sql, &CompileOptions::default()).unwrap();
    assert!(program.instructions.iter().any(|i| matches!(i, Insn::Subroutine { .. }) | matches!(i, Insn::VFilter { .. })));
}

/// Invariant: every program ends with exactly one `Halt`, and no placeholder
/// survives unresolved (enforced by `build`, so successful compilation is
/// itself the witness).
#[test]
fn every_program_ends_with_exactly_one_halt() {
    let catalog = catalog_with(vec![table_t()]);
    let program = compile_sql(&catalog, "select a, b from t where a = 3", &CompileOptions::default()).unwrap();
    let halts = program.instructions.iter().filter(|i| matches!(i, Insn::Halt { .. })).count();
    assert_eq!(halts, 1);
    assert!(matches!(program.instructions.last().unwrap(), Insn::Halt { .. }));
}

/// Parameter mapping: `?` gets sequential positional indices; duplicate
/// occurrences of the same named parameter reuse one register.
#[test]
fn named_parameter_occurrences_reuse_one_register() {
    let catalog = catalog_with(vec![table_t()]);
    let sql = "select a from t where a = :x or b = :x";
    let program = compile_sql(&catalog, sql, &CompileOptions::default()).unwrap();
    assert_eq!(program.parameters.iter().count(), 1);
}

/// INSERT fills DEFAULT/NOT NULL enforcement as a runtime `ConstraintViolation`,
/// not a compile error (spec §4.8/§8 boundary behavior).
#[test]
fn insert_with_missing_not_null_column_still_compiles() {
    let catalog = catalog_with(vec![table_t()]);
    let program = compile_sql(&catalog, "insert into t (a) values (1)", &CompileOptions::default()).unwrap();
    assert!(program.instructions.iter().any(|i| matches!(i, Insn::ConstraintViolation { .. })));
    assert!(program.instructions.iter().any(|i| matches!(i, Insn::VUpdate { .. })));
}
