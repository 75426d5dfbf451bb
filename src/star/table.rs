//! In-memory STAR tables.
//!
//! A [`StarFile`] is an ordered set of named [`StarTable`]s. Each table keeps
//! its columns in declaration order and its rows as typed value vectors, with
//! the invariant that every row has exactly one value per column. Consumers
//! never index rows positionally; they go through [`RowView`] accessors that
//! report missing columns by name.

use std::path::PathBuf;

use super::value::{Value, ValueType};

/// Errors from parsing, structural edits, and row access.
#[derive(Debug, thiserror::Error)]
pub enum StarError {
    #[error("malformed STAR structure at line {line}: {detail}")]
    Structure { line: usize, detail: String },
    #[error("table {table:?} row {row}: expected {expected} fields, got {got}")]
    Arity {
        table: String,
        row: usize,
        expected: usize,
        got: usize,
    },
    #[error("table {table:?} column {column:?} row {row}: {detail}")]
    BadValue {
        table: String,
        column: String,
        row: usize,
        detail: String,
    },
    #[error("table {0:?} not found")]
    MissingTable(String),
    #[error("table {table:?} has no column {column:?}")]
    MissingColumn { table: String, column: String },
    #[error("table {table:?} already has column {column:?}")]
    DuplicateColumn { table: String, column: String },
    #[error("invalid table reference {0:?}")]
    BadTableRef(String),
    #[error("{path}: {source}")]
    InFile {
        path: PathBuf,
        #[source]
        source: Box<StarError>,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StarError {
    /// Attach the file path to an error bubbling out of file-backed I/O.
    pub fn in_file(self, path: impl Into<PathBuf>) -> StarError {
        StarError::InFile {
            path: path.into(),
            source: Box::new(self),
        }
    }
}

/// A named, typed column.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub vtype: ValueType,
}

/// One `data_` block: ordered columns, ordered rows.
#[derive(Debug, Clone)]
pub struct StarTable {
    name: String,
    columns: Vec<Column>,
    rows: Vec<Vec<Value>>,
    single_row: bool,
}

impl StarTable {
    /// An empty looped table.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            rows: Vec::new(),
            single_row: false,
        }
    }

    /// An empty table that serializes as `key value` pairs instead of `loop_`.
    pub fn new_single_row(name: impl Into<String>) -> Self {
        Self {
            single_row: true,
            ..Self::new(name)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_single_row(&self) -> bool {
        self.single_row
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    fn missing(&self, column: &str) -> StarError {
        StarError::MissingColumn {
            table: self.name.clone(),
            column: column.to_string(),
        }
    }

    /// Declare a new column and give every existing row a value for it.
    ///
    /// `fill` is evaluated per row, so a column can be derived from the
    /// row's other values.
    pub fn add_column_with<F>(
        &mut self,
        name: impl Into<String>,
        vtype: ValueType,
        mut fill: F,
    ) -> Result<(), StarError>
    where
        F: FnMut(RowView<'_>) -> Value,
    {
        let name = name.into();
        if self.has_column(&name) {
            return Err(StarError::DuplicateColumn {
                table: self.name.clone(),
                column: name,
            });
        }
        let values: Vec<Value> = (0..self.rows.len())
            .map(|i| fill(RowView { table: self, index: i }))
            .collect();
        self.columns.push(Column { name, vtype });
        for (row, v) in self.rows.iter_mut().zip(values) {
            row.push(v);
        }
        Ok(())
    }

    /// Declare a new column with the same value in every row.
    pub fn add_column(
        &mut self,
        name: impl Into<String>,
        vtype: ValueType,
        value: Value,
    ) -> Result<(), StarError> {
        self.add_column_with(name, vtype, |_| value.clone())
    }

    pub fn remove_column(&mut self, name: &str) -> Result<(), StarError> {
        let idx = self.column_index(name).ok_or_else(|| self.missing(name))?;
        self.columns.remove(idx);
        for row in &mut self.rows {
            row.remove(idx);
        }
        Ok(())
    }

    /// Append a row; the value count must match the column count.
    pub fn add_row(&mut self, values: Vec<Value>) -> Result<(), StarError> {
        if values.len() != self.columns.len() {
            return Err(StarError::Arity {
                table: self.name.clone(),
                row: self.rows.len(),
                expected: self.columns.len(),
                got: values.len(),
            });
        }
        self.rows.push(values);
        Ok(())
    }

    pub fn clear_rows(&mut self) {
        self.rows.clear();
    }

    pub fn row(&self, index: usize) -> Option<RowView<'_>> {
        (index < self.rows.len()).then_some(RowView { table: self, index })
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = RowView<'_>> {
        (0..self.rows.len()).map(move |index| RowView { table: self, index })
    }
}

/// Read-only view of one row, accessed by column name.
#[derive(Clone, Copy)]
pub struct RowView<'a> {
    table: &'a StarTable,
    index: usize,
}

impl<'a> RowView<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Value of a column, `None` when the column is not declared.
    pub fn opt(&self, column: &str) -> Option<&'a Value> {
        let idx = self.table.column_index(column)?;
        Some(&self.table.rows[self.index][idx])
    }

    /// Value of a required column.
    pub fn get(&self, column: &str) -> Result<&'a Value, StarError> {
        self.opt(column).ok_or_else(|| self.table.missing(column))
    }

    pub fn get_f64(&self, column: &str) -> Result<f64, StarError> {
        self.get(column)?
            .as_f64()
            .ok_or_else(|| self.bad_value(column, "not numeric"))
    }

    pub fn get_i64(&self, column: &str) -> Result<i64, StarError> {
        self.get(column)?
            .as_i64()
            .ok_or_else(|| self.bad_value(column, "not an integer"))
    }

    pub fn get_str(&self, column: &str) -> Result<&'a str, StarError> {
        self.get(column)?
            .as_str()
            .ok_or_else(|| self.bad_value(column, "not a string"))
    }

    pub fn opt_f64(&self, column: &str) -> Option<f64> {
        self.opt(column).and_then(Value::as_f64)
    }

    pub fn opt_i64(&self, column: &str) -> Option<i64> {
        self.opt(column).and_then(Value::as_i64)
    }

    pub fn opt_str(&self, column: &str) -> Option<&'a str> {
        self.opt(column).and_then(Value::as_str)
    }

    pub fn has(&self, column: &str) -> bool {
        self.table.has_column(column)
    }

    /// Names of every column declared in the row's table.
    pub fn column_names(&self) -> Vec<String> {
        self.table.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// True if any of the given columns is declared in the table.
    pub fn has_any(&self, columns: &[&str]) -> bool {
        columns.iter().any(|c| self.table.has_column(c))
    }

    fn bad_value(&self, column: &str, detail: &str) -> StarError {
        StarError::BadValue {
            table: self.table.name.clone(),
            column: column.to_string(),
            row: self.index,
            detail: detail.to_string(),
        }
    }
}

/// An ordered collection of tables, one per `data_` block.
#[derive(Debug, Clone, Default)]
pub struct StarFile {
    tables: Vec<StarTable>,
}

impl StarFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, table: StarTable) {
        self.tables.push(table);
    }

    pub fn tables(&self) -> &[StarTable] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&StarTable> {
        self.tables.iter().find(|t| t.name() == name)
    }

    pub fn table_mut(&mut self, name: &str) -> Option<&mut StarTable> {
        self.tables.iter_mut().find(|t| t.name() == name)
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    pub fn require_table(&self, name: &str) -> Result<&StarTable, StarError> {
        self.table(name)
            .ok_or_else(|| StarError::MissingTable(name.to_string()))
    }

    /// First table in declaration order, if any.
    pub fn first_table(&self) -> Option<&StarTable> {
        self.tables.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StarTable {
        let mut t = StarTable::new("micrographs");
        t.add_column("rlnMicrographName", ValueType::Str, Value::from(""))
            .unwrap();
        t.add_column("rlnDefocusU", ValueType::Float, Value::from(0.0))
            .unwrap();
        t.add_row(vec!["mic1.mrc".into(), 10000.0.into()]).unwrap();
        t.add_row(vec!["mic2.mrc".into(), 12000.0.into()]).unwrap();
        t
    }

    #[test]
    fn row_access_by_name() {
        let t = sample();
        let row = t.row(1).unwrap();
        assert_eq!(row.get_str("rlnMicrographName").unwrap(), "mic2.mrc");
        assert_eq!(row.get_f64("rlnDefocusU").unwrap(), 12000.0);
    }

    #[test]
    fn missing_column_is_named() {
        let t = sample();
        let err = t.row(0).unwrap().get("rlnVoltage").unwrap_err();
        match err {
            StarError::MissingColumn { table, column } => {
                assert_eq!(table, "micrographs");
                assert_eq!(column, "rlnVoltage");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn arity_enforced() {
        let mut t = sample();
        let err = t.add_row(vec!["mic3.mrc".into()]).unwrap_err();
        assert!(matches!(err, StarError::Arity { expected: 2, got: 1, .. }));
    }

    #[test]
    fn derived_column() {
        let mut t = sample();
        t.add_column_with("rlnDefocusV", ValueType::Float, |row| {
            Value::from(row.get_f64("rlnDefocusU").unwrap() + 500.0)
        })
        .unwrap();
        assert_eq!(t.row(0).unwrap().get_f64("rlnDefocusV").unwrap(), 10500.0);
    }

    #[test]
    fn remove_column_keeps_rows_aligned() {
        let mut t = sample();
        t.remove_column("rlnMicrographName").unwrap();
        assert_eq!(t.columns().len(), 1);
        assert_eq!(t.row(0).unwrap().get_f64("rlnDefocusU").unwrap(), 10000.0);
        assert!(t.remove_column("rlnMicrographName").is_err());
    }

    #[test]
    fn duplicate_column_rejected() {
        let mut t = sample();
        let err = t
            .add_column("rlnDefocusU", ValueType::Float, Value::from(0.0))
            .unwrap_err();
        assert!(matches!(err, StarError::DuplicateColumn { .. }));
    }

    #[test]
    fn clear_rows_keeps_schema() {
        let mut t = sample();
        t.clear_rows();
        assert!(t.is_empty());
        assert_eq!(t.columns().len(), 2);
    }
}
