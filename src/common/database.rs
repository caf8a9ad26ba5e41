// # In-Memory Relational Database
//
// Narrow table store mutated only through the cached store façade and the
// persistence layer's recovery hooks. Replay hooks are idempotent: applying
// the same WAL entry twice yields the same state.

use crate::common::{Condition, ForeignKey, Row, RowId, Table, Value};
use crate::error::{DbError, Result};
use std::collections::HashMap;

/// In-memory table store with foreign-key metadata.
#[derive(Debug, Clone, Default)]
pub struct Database {
    tables: HashMap<String, Table>,
    foreign_keys: HashMap<String, Vec<ForeignKey>>,
    open: bool,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn set_open(&mut self, open: bool) {
        self.open = open;
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    pub fn table_mut(&mut self, name: &str) -> Option<&mut Table> {
        self.tables.get_mut(name)
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn contains_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn foreign_keys(&self, table: &str) -> &[ForeignKey] {
        self.foreign_keys
            .get(table)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn all_foreign_keys(&self) -> Vec<ForeignKey> {
        let mut keys: Vec<ForeignKey> = self
            .foreign_keys
            .values()
            .flat_map(|v| v.iter().cloned())
            .collect();
        keys.sort_by(|a, b| (&a.table, &a.column).cmp(&(&b.table, &b.column)));
        keys
    }

    pub fn add_foreign_key(&mut self, fk: ForeignKey) {
        let keys = self.foreign_keys.entry(fk.table.clone()).or_default();
        if !keys.contains(&fk) {
            keys.push(fk);
        }
    }

    // ------------------------------------------------------------------
    // Replay hooks
    //
    // Applied both by the write path and by WAL recovery. Recovery may
    // re-deliver operations, so these never fail on missing rows.
    // ------------------------------------------------------------------

    /// Create (or, on replay, recreate) a table. An existing table of the
    /// same name is replaced.
    pub fn create_table(&mut self, table: Table) {
        for col in &table.columns {
            if col.is_foreign {
                self.add_foreign_key(ForeignKey {
                    table: table.name.clone(),
                    column: col.name.clone(),
                    referenced_table: col.foreign_table.clone(),
                    referenced_column: col.foreign_column.clone(),
                });
            }
        }
        self.tables.insert(table.name.clone(), table);
    }

    pub fn drop_table(&mut self, name: &str) {
        self.tables.remove(name);
        self.foreign_keys.remove(name);
    }

    /// Append a row without duplicate checks; the caller (or the WAL entry
    /// being replayed) has already validated it.
    pub fn insert_row(&mut self, table: &str, row: Row) -> Result<()> {
        let t = self
            .tables
            .get_mut(table)
            .ok_or_else(|| DbError::NotFound(format!("table {}", table)))?;
        if row.id >= t.next_row_id {
            t.next_row_id = row.id + 1;
        }
        t.rows.push(row);
        Ok(())
    }

    /// Replace a row by id; silently skips rows that no longer exist.
    pub fn update_row(&mut self, table: &str, row: Row) -> Result<()> {
        let t = self
            .tables
            .get_mut(table)
            .ok_or_else(|| DbError::NotFound(format!("table {}", table)))?;
        if let Some(existing) = t.rows.iter_mut().find(|r| r.id == row.id) {
            *existing = row;
        }
        Ok(())
    }

    /// Drop a row by id; silently skips rows that no longer exist.
    pub fn delete_row(&mut self, table: &str, row_id: RowId) -> Result<()> {
        let t = self
            .tables
            .get_mut(table)
            .ok_or_else(|| DbError::NotFound(format!("table {}", table)))?;
        t.rows.retain(|r| r.id != row_id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Select rows matching the predicate, projected onto `columns`
    /// (empty = all columns), preserving insertion order.
    pub fn select(
        &self,
        table: &str,
        columns: &[String],
        condition: Option<&Condition>,
    ) -> Result<Vec<Row>> {
        let t = self
            .tables
            .get(table)
            .ok_or_else(|| DbError::NotFound(format!("table {}", table)))?;

        let projection: Option<Vec<usize>> = if columns.is_empty() {
            None
        } else {
            let mut indices = Vec::with_capacity(columns.len());
            for col in columns {
                let idx = t
                    .column_index(col)
                    .ok_or_else(|| DbError::NotFound(format!("column {}.{}", table, col)))?;
                indices.push(idx);
            }
            Some(indices)
        };

        let mut out = Vec::new();
        for row in &t.rows {
            if !t.matches(row, condition) {
                continue;
            }
            let values = match &projection {
                None => row.values.clone(),
                Some(indices) => indices.iter().map(|&i| row.values[i].clone()).collect(),
            };
            out.push(Row::new(row.id, values));
        }
        Ok(out)
    }

    /// Point lookup by primary-key value, used for foreign-key validation.
    pub fn find_by_column(&self, table: &str, column: &str, value: &Value) -> Result<Option<&Row>> {
        let t = self
            .tables
            .get(table)
            .ok_or_else(|| DbError::NotFound(format!("table {}", table)))?;
        let idx = t
            .column_index(column)
            .ok_or_else(|| DbError::NotFound(format!("column {}.{}", table, column)))?;
        Ok(t.rows.iter().find(|r| r.values.get(idx) == Some(value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ColumnDef, DataType};

    fn db_with_users() -> Database {
        let mut db = Database::new();
        db.create_table(Table::new(
            "users",
            vec![
                ColumnDef::new("id", DataType::Int).primary_key(),
                ColumnDef::new("name", DataType::Varchar).max_length(64),
            ],
        ));
        db
    }

    #[test]
    fn test_create_table_registers_foreign_keys() {
        let mut db = db_with_users();
        db.create_table(Table::new(
            "orders",
            vec![
                ColumnDef::new("id", DataType::Int).primary_key(),
                ColumnDef::new("user_id", DataType::Int).references("users", "id"),
            ],
        ));
        let fks = db.foreign_keys("orders");
        assert_eq!(fks.len(), 1);
        assert_eq!(fks[0].referenced_table, "users");
    }

    #[test]
    fn test_insert_advances_next_row_id() {
        let mut db = db_with_users();
        db.insert_row("users", Row::new(5, vec![Value::Int(1), Value::Varchar("a".into())]))
            .unwrap();
        assert_eq!(db.table("users").unwrap().next_row_id, 6);
    }

    #[test]
    fn test_update_and_delete_skip_missing_rows() {
        let mut db = db_with_users();
        // Neither missing-row operation fails: replay may re-deliver them.
        db.update_row("users", Row::new(9, vec![Value::Int(1), Value::Varchar("a".into())]))
            .unwrap();
        db.delete_row("users", 9).unwrap();
        assert!(db.table("users").unwrap().rows.is_empty());
    }

    #[test]
    fn test_recreate_replaces_table() {
        let mut db = db_with_users();
        db.insert_row("users", Row::new(1, vec![Value::Int(1), Value::Varchar("a".into())]))
            .unwrap();
        db.create_table(Table::new(
            "users",
            vec![ColumnDef::new("id", DataType::Int).primary_key()],
        ));
        assert!(db.table("users").unwrap().rows.is_empty());
        assert_eq!(db.table("users").unwrap().columns.len(), 1);
    }

    #[test]
    fn test_select_projection_and_predicate() {
        let mut db = db_with_users();
        db.insert_row("users", Row::new(1, vec![Value::Int(1), Value::Varchar("a".into())]))
            .unwrap();
        db.insert_row("users", Row::new(2, vec![Value::Int(2), Value::Varchar("b".into())]))
            .unwrap();

        let all = db.select("users", &[], None).unwrap();
        assert_eq!(all.len(), 2);

        let cond = Condition::eq("name", Value::Varchar("b".into()));
        let names = db
            .select("users", &["name".to_string()], Some(&cond))
            .unwrap();
        assert_eq!(names.len(), 1);
        assert_eq!(names[0].values, vec![Value::Varchar("b".into())]);
    }

    #[test]
    fn test_select_unknown_column_is_not_found() {
        let db = db_with_users();
        let err = db
            .select("users", &["nope".to_string()], None)
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));
    }

    #[test]
    fn test_find_by_column() {
        let mut db = db_with_users();
        db.insert_row("users", Row::new(1, vec![Value::Int(42), Value::Varchar("a".into())]))
            .unwrap();
        assert!(db
            .find_by_column("users", "id", &Value::Int(42))
            .unwrap()
            .is_some());
        assert!(db
            .find_by_column("users", "id", &Value::Int(43))
            .unwrap()
            .is_none());
    }
}
