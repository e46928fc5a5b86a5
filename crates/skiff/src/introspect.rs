//! Reading a database's `public` schema back from `pg_catalog`.

use std::collections::HashMap;

use skiff_db_schema::{
    CheckConstraint, Column, ForeignKey, Identity, Index, IndexColumn, ObjectType, PrimaryKey,
    ReferentialAction, Routine, Schema, Table,
};
use tracing::debug;

use crate::traced::TracedObject;
use crate::{Error, Result};

const TABLES_SQL: &str = r#"
SELECT c.oid, c.relname, c.relkind::text, c.relispartition,
       (SELECT count(*) FROM pg_inherits i WHERE i.inhrelid = c.oid) AS parents
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = 'public' AND c.relkind IN ('r', 'p')
ORDER BY c.relname
"#;

const COLUMNS_SQL: &str = r#"
SELECT a.attrelid, a.attname, format_type(a.atttypid, a.atttypmod), a.attnotnull,
       pg_get_expr(d.adbin, d.adrelid), a.attidentity::text, a.attgenerated::text,
       CASE WHEN a.attidentity <> '' THEN
         (SELECT s.seqstart FROM pg_sequence s
          WHERE s.seqrelid = pg_get_serial_sequence(format('%I.%I', n.nspname, c.relname), a.attname)::regclass)
       END AS ident_start,
       CASE WHEN a.attidentity <> '' THEN
         pg_sequence_last_value(pg_get_serial_sequence(format('%I.%I', n.nspname, c.relname), a.attname)::regclass)
       END AS ident_last
FROM pg_attribute a
JOIN pg_class c ON c.oid = a.attrelid
JOIN pg_namespace n ON n.oid = c.relnamespace
LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum
WHERE n.nspname = 'public' AND c.relkind IN ('r', 'p') AND a.attnum > 0 AND NOT a.attisdropped
ORDER BY a.attrelid, a.attnum
"#;

const CONSTRAINTS_SQL: &str = r#"
SELECT con.conrelid, con.conname, con.contype::text,
       ARRAY(SELECT a.attname::text
             FROM unnest(con.conkey) WITH ORDINALITY k(attnum, ord)
             JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
             ORDER BY k.ord) AS columns,
       fc.relname AS ref_table,
       ARRAY(SELECT a.attname::text
             FROM unnest(con.confkey) WITH ORDINALITY k(attnum, ord)
             JOIN pg_attribute a ON a.attrelid = con.confrelid AND a.attnum = k.attnum
             ORDER BY k.ord) AS ref_columns,
       con.confupdtype::text, con.confdeltype::text,
       pg_get_constraintdef(con.oid, true)
FROM pg_constraint con
JOIN pg_class c ON c.oid = con.conrelid
JOIN pg_namespace n ON n.oid = c.relnamespace
LEFT JOIN pg_class fc ON fc.oid = con.confrelid
WHERE n.nspname = 'public' AND con.contype IN ('p', 'u', 'f', 'c', 'x')
ORDER BY con.conrelid, con.conname
"#;

const INDEXES_SQL: &str = r#"
SELECT i.indrelid, ic.relname, i.indisunique, i.indisprimary,
       EXISTS (SELECT 1 FROM pg_constraint con
               WHERE con.conindid = i.indexrelid AND con.contype IN ('u', 'x')) AS is_constraint,
       pg_get_expr(i.indpred, i.indrelid, true),
       ARRAY(SELECT pg_get_indexdef(i.indexrelid, k, true)
             FROM generate_series(1, i.indnkeyatts) AS k ORDER BY k) AS keys,
       i.indoption::int2[]
FROM pg_index i
JOIN pg_class ic ON ic.oid = i.indexrelid
JOIN pg_class c ON c.oid = i.indrelid
JOIN pg_namespace n ON n.oid = c.relnamespace
WHERE n.nspname = 'public' AND c.relkind IN ('r', 'p')
ORDER BY i.indrelid, ic.relname
"#;

const ROUTINES_SQL: &str = r#"
SELECT p.proname, p.prokind::text, pg_get_function_identity_arguments(p.oid), pg_get_functiondef(p.oid)
FROM pg_proc p
JOIN pg_namespace n ON n.oid = p.pronamespace
WHERE n.nspname = 'public' AND p.prokind IN ('f', 'p')
  AND NOT EXISTS (SELECT 1 FROM pg_depend d WHERE d.objid = p.oid AND d.deptype = 'e')
ORDER BY p.proname, p.oid
"#;

/// Introspect the `public` schema of the database `conn` is connected to.
pub(crate) async fn introspect_schema(conn: &TracedObject, name: &str) -> Result<Schema> {
    let fail = |e: tokio_postgres::Error| Error::Introspect {
        schema: name.to_string(),
        reason: e.to_string(),
    };

    let mut tables: Vec<(u32, Table)> = Vec::new();
    for row in conn.query(TABLES_SQL, &[]).await.map_err(fail)? {
        let oid: u32 = row.get(0);
        let mut table = Table::new(row.get::<_, String>(1));
        let relkind: String = row.get(2);
        let is_partition: bool = row.get(3);
        let parents: i64 = row.get(4);
        table.unsupported = if relkind == "p" {
            Some("partitioned tables are not supported".to_string())
        } else if is_partition {
            Some("partitions are not supported".to_string())
        } else if parents > 0 {
            Some("table inheritance is not supported".to_string())
        } else {
            None
        };
        tables.push((oid, table));
    }
    let by_oid: HashMap<u32, usize> = tables
        .iter()
        .enumerate()
        .map(|(i, (oid, _))| (*oid, i))
        .collect();
    let position = |oid: u32| by_oid.get(&oid).copied();

    for row in conn.query(COLUMNS_SQL, &[]).await.map_err(fail)? {
        let Some(i) = position(row.get(0)) else {
            continue;
        };
        let table = &mut tables[i].1;
        let identity_kind: String = row.get(5);
        let generated: String = row.get(6);
        let identity = match identity_kind.as_str() {
            "a" | "d" => {
                let start: Option<i64> = row.get(7);
                let last: Option<i64> = row.get(8);
                let start = start.unwrap_or(1);
                Some(Identity {
                    always: identity_kind == "a",
                    start,
                    next: last.map(|l| l + 1).unwrap_or(start),
                })
            }
            _ => None,
        };
        if !generated.is_empty() && table.unsupported.is_none() {
            table.unsupported = Some("generated columns are not supported".to_string());
        }
        table.columns.push(Column {
            name: row.get(1),
            data_type: row.get(2),
            nullable: !row.get::<_, bool>(3),
            default: row.get(4),
            identity,
        });
    }

    for row in conn.query(CONSTRAINTS_SQL, &[]).await.map_err(fail)? {
        let Some(i) = position(row.get(0)) else {
            continue;
        };
        let table = &mut tables[i].1;
        let con_name: String = row.get(1);
        let kind: String = row.get(2);
        let columns: Vec<String> = row.get(3);
        match kind.as_str() {
            "p" => {
                table.primary_key = Some(PrimaryKey {
                    name: con_name,
                    columns,
                })
            }
            "f" => {
                let on_update: String = row.get(6);
                let on_delete: String = row.get(7);
                table.foreign_keys.push(ForeignKey {
                    name: con_name,
                    columns,
                    references_table: row.get::<_, Option<String>>(4).unwrap_or_default(),
                    references_columns: row.get(5),
                    on_update: ReferentialAction::from_pg_code(&on_update),
                    on_delete: ReferentialAction::from_pg_code(&on_delete),
                });
            }
            "c" => table.check_constraints.push(CheckConstraint {
                name: con_name,
                expr: row.get(8),
            }),
            "x" => {
                if table.unsupported.is_none() {
                    table.unsupported = Some("exclusion constraints are not supported".to_string());
                }
            }
            // unique constraints are read with the indexes backing them
            _ => {}
        }
    }

    for row in conn.query(INDEXES_SQL, &[]).await.map_err(fail)? {
        let Some(i) = position(row.get(0)) else {
            continue;
        };
        let is_primary: bool = row.get(3);
        if is_primary {
            continue;
        }
        let keys: Vec<String> = row.get(6);
        let options: Vec<i16> = row.get(7);
        let columns = keys
            .iter()
            .enumerate()
            .map(|(k, expr)| IndexColumn::from_pg(expr, options.get(k).copied().unwrap_or(0)))
            .collect();
        tables[i].1.indices.push(Index {
            name: row.get(1),
            columns,
            unique: row.get(2),
            constraint: row.get(4),
            where_clause: row.get(5),
        });
    }

    let mut schema = Schema::new(name);
    for (_, table) in tables {
        schema.add_table(table);
    }

    for row in conn.query(ROUTINES_SQL, &[]).await.map_err(fail)? {
        let kind: String = row.get(1);
        let routine = Routine {
            name: row.get(0),
            kind: if kind == "p" {
                ObjectType::Procedure
            } else {
                ObjectType::Function
            },
            arguments: row.get(2),
            definition: row.get(3),
        };
        if schema.routines.contains_key(&routine.name) {
            debug!(routine = %routine.name, "overloaded routine, keeping the last definition");
        }
        schema.add_routine(routine);
    }

    debug!(
        schema = name,
        tables = schema.tables.len(),
        routines = schema.routines.len(),
        "introspected schema"
    );
    Ok(schema)
}
