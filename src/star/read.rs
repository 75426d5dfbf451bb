//! Lazy, file-backed row reading.
//!
//! [`RowReader`] streams one named table's rows straight off disk without
//! holding the whole file in memory, which is how large particle tables are
//! walked when only a pass-through transform is needed. A reader is finite
//! and restartable: opening a fresh reader re-reads the source from the top.
//!
//! Table references use the engine's `table@file.star` notation; a bare path
//! refers to the file's first table.

use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use super::labels::LabelRegistry;
use super::parse::{label_of, split_fields};
use super::table::{Column, StarError};
use super::value::Value;

/// A `table@file` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    /// Table name; `None` selects the file's first `data_` block.
    pub table: Option<String>,
    pub path: PathBuf,
}

impl TableRef {
    /// Parse `"particles@run_data.star"` or a bare `"run_data.star"`.
    pub fn parse(s: &str) -> Result<Self, StarError> {
        match s.split_once('@') {
            Some(("", _)) => Err(StarError::BadTableRef(s.to_string())),
            Some((table, path)) => Ok(Self {
                table: Some(table.to_string()),
                path: PathBuf::from(path),
            }),
            None => Ok(Self {
                table: None,
                path: PathBuf::from(s),
            }),
        }
    }

    /// Reference a named table inside a file.
    pub fn named(table: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            table: Some(table.into()),
            path: path.into(),
        }
    }
}

/// One row read off disk, with the same by-name access as an in-memory row.
#[derive(Debug, Clone)]
pub struct StarRow {
    columns: Rc<Vec<Column>>,
    values: Vec<Value>,
    index: usize,
    table: String,
}

impl StarRow {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn opt(&self, column: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c.name == column)?;
        Some(&self.values[idx])
    }

    pub fn get(&self, column: &str) -> Result<&Value, StarError> {
        self.opt(column).ok_or_else(|| StarError::MissingColumn {
            table: self.table.clone(),
            column: column.to_string(),
        })
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

    pub fn get_str(&self, column: &str) -> Result<&str, StarError> {
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

    pub fn opt_str(&self, column: &str) -> Option<&str> {
        self.opt(column).and_then(Value::as_str)
    }

    pub fn has(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c.name == column)
    }

    pub fn has_any(&self, columns: &[&str]) -> bool {
        columns.iter().any(|c| self.has(c))
    }

    fn bad_value(&self, column: &str, detail: &str) -> StarError {
        StarError::BadValue {
            table: self.table.clone(),
            column: column.to_string(),
            row: self.index,
            detail: detail.to_string(),
        }
    }
}

/// Streaming reader over one table's rows.
#[derive(Debug)]
pub struct RowReader {
    path: PathBuf,
    table: String,
    columns: Rc<Vec<Column>>,
    lines: Lines<BufReader<File>>,
    line_no: usize,
    next_row: usize,
    /// Pairs of a single-row block are read eagerly into one pending row.
    pending: Option<Vec<Value>>,
    done: bool,
}

impl RowReader {
    /// Open a reader via a `table@file` reference.
    pub fn open_ref(r: &TableRef, registry: &LabelRegistry) -> Result<Self, StarError> {
        Self::open(&r.path, r.table.as_deref(), registry)
    }

    /// Open a reader on `path`, positioned at the start of `table`
    /// (or the first table when `None`).
    pub fn open(
        path: &Path,
        table: Option<&str>,
        registry: &LabelRegistry,
    ) -> Result<Self, StarError> {
        Self::open_inner(path, table, registry).map_err(|e| e.in_file(path))
    }

    fn open_inner(
        path: &Path,
        table: Option<&str>,
        registry: &LabelRegistry,
    ) -> Result<Self, StarError> {
        let file = File::open(path)?;
        let mut lines = BufReader::new(file).lines();
        let mut line_no = 0usize;

        // Seek to the requested data_ block.
        let name = loop {
            let Some(line) = lines.next() else {
                return Err(StarError::MissingTable(
                    table.unwrap_or("<first>").to_string(),
                ));
            };
            line_no += 1;
            let line = line?;
            let line = line.trim();
            if let Some(name) = line.strip_prefix("data_") {
                if table.is_none() || table == Some(name) {
                    break name.to_string();
                }
            }
        };

        let mut reader = Self {
            path: path.to_path_buf(),
            table: name,
            columns: Rc::new(Vec::new()),
            lines,
            line_no,
            next_row: 0,
            pending: None,
            done: false,
        };
        reader.read_header(registry)?;
        Ok(reader)
    }

    /// Column schema of the table being read.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    fn next_line(&mut self) -> Option<Result<String, StarError>> {
        let line = self.lines.next()?;
        self.line_no += 1;
        Some(line.map_err(StarError::from))
    }

    fn read_header(&mut self, registry: &LabelRegistry) -> Result<(), StarError> {
        let mut columns = Vec::new();
        let mut pairs: Option<Vec<Value>> = None;
        let mut in_loop = false;

        while let Some(line) = self.next_line() {
            let line = line?;
            let line = line.trim().to_string();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line == "loop_" {
                in_loop = true;
                continue;
            }
            if line.starts_with("data_") {
                // Empty block.
                self.done = true;
                break;
            }
            if line.starts_with('_') {
                let fields = split_fields(&line, self.line_no)?;
                let label = fields.first().and_then(|f| label_of(f)).ok_or_else(|| {
                    StarError::Structure {
                        line: self.line_no,
                        detail: format!("bad label token {line:?}"),
                    }
                })?;
                let vtype = registry.type_of(label);
                if in_loop {
                    if fields.len() != 1 {
                        return Err(StarError::Structure {
                            line: self.line_no,
                            detail: format!("bad column declaration {line:?}"),
                        });
                    }
                    columns.push(Column {
                        name: label.to_string(),
                        vtype,
                    });
                } else {
                    // Single-row block: accumulate pairs into one pending row.
                    if fields.len() != 2 {
                        return Err(StarError::Structure {
                            line: self.line_no,
                            detail: format!("expected _label value pair: {line:?}"),
                        });
                    }
                    let value =
                        Value::parse_typed(&fields[1], vtype).map_err(|detail| {
                            StarError::BadValue {
                                table: self.table.clone(),
                                column: label.to_string(),
                                row: 0,
                                detail,
                            }
                        })?;
                    columns.push(Column {
                        name: label.to_string(),
                        vtype,
                    });
                    pairs.get_or_insert_with(Vec::new).push(value);
                }
                continue;
            }
            // First data line of a loop; hand it back to the iterator.
            if !in_loop {
                return Err(StarError::Structure {
                    line: self.line_no,
                    detail: format!("unexpected line in block: {line:?}"),
                });
            }
            self.pending = Some(self.parse_data_line(&line, &columns)?);
            break;
        }

        if let Some(values) = pairs {
            self.pending = Some(values);
            self.done = true; // single row only
        }
        if in_loop && columns.is_empty() {
            return Err(StarError::Structure {
                line: self.line_no,
                detail: "loop_ with no column declarations".to_string(),
            });
        }
        self.columns = Rc::new(columns);
        Ok(())
    }

    fn parse_data_line(&self, line: &str, columns: &[Column]) -> Result<Vec<Value>, StarError> {
        let fields = split_fields(line, self.line_no)?;
        if fields.len() != columns.len() {
            return Err(StarError::Arity {
                table: self.table.clone(),
                row: self.next_row,
                expected: columns.len(),
                got: fields.len(),
            });
        }
        columns
            .iter()
            .zip(&fields)
            .map(|(col, field)| {
                Value::parse_typed(field, col.vtype).map_err(|detail| StarError::BadValue {
                    table: self.table.clone(),
                    column: col.name.clone(),
                    row: self.next_row,
                    detail,
                })
            })
            .collect()
    }

    fn make_row(&mut self, values: Vec<Value>) -> StarRow {
        let row = StarRow {
            columns: Rc::clone(&self.columns),
            values,
            index: self.next_row,
            table: self.table.clone(),
        };
        self.next_row += 1;
        row
    }

    /// Collect the remaining rows.
    pub fn read_all(self) -> Result<Vec<StarRow>, StarError> {
        self.collect()
    }
}

impl Iterator for RowReader {
    type Item = Result<StarRow, StarError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(values) = self.pending.take() {
            return Some(Ok(self.make_row(values)));
        }
        if self.done {
            return None;
        }
        loop {
            let line = match self.next_line()? {
                Ok(l) => l,
                Err(e) => return Some(Err(e.in_file(&self.path))),
            };
            let line = line.trim().to_string();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with("data_") {
                self.done = true;
                return None;
            }
            let columns = Rc::clone(&self.columns);
            return match self.parse_data_line(&line, &columns) {
                Ok(values) => Some(Ok(self.make_row(values))),
                Err(e) => {
                    self.done = true;
                    Some(Err(e.in_file(&self.path)))
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TWO_TABLES: &str = "\
# version 30001

data_optics

loop_
_rlnOpticsGroup #1
_rlnOpticsGroupName #2
1 opticsGroup1

data_particles

loop_
_rlnImageName #1
_rlnClassNumber #2
000001@stack.mrcs 2
000002@stack.mrcs 1
000003@stack.mrcs 2
";

    fn write_tmp(text: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(text.as_bytes()).unwrap();
        f
    }

    #[test]
    fn table_ref_parsing() {
        let r = TableRef::parse("particles@run_data.star").unwrap();
        assert_eq!(r.table.as_deref(), Some("particles"));
        assert_eq!(r.path, PathBuf::from("run_data.star"));

        let r = TableRef::parse("run_data.star").unwrap();
        assert_eq!(r.table, None);

        assert!(TableRef::parse("@run_data.star").is_err());
    }

    #[test]
    fn streams_named_table() {
        let f = write_tmp(TWO_TABLES);
        let reg = LabelRegistry::default();
        let reader = RowReader::open(f.path(), Some("particles"), &reg).unwrap();
        let rows = reader.read_all().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].get_str("rlnImageName").unwrap(), "000001@stack.mrcs");
        assert_eq!(rows[2].get_i64("rlnClassNumber").unwrap(), 2);
        assert_eq!(rows[1].index(), 1);
    }

    #[test]
    fn stops_at_next_block() {
        let f = write_tmp(TWO_TABLES);
        let reg = LabelRegistry::default();
        let reader = RowReader::open(f.path(), Some("optics"), &reg).unwrap();
        let rows = reader.read_all().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_str("rlnOpticsGroupName").unwrap(), "opticsGroup1");
    }

    #[test]
    fn restartable() {
        let f = write_tmp(TWO_TABLES);
        let reg = LabelRegistry::default();
        let n1 = RowReader::open(f.path(), Some("particles"), &reg)
            .unwrap()
            .count();
        let n2 = RowReader::open(f.path(), Some("particles"), &reg)
            .unwrap()
            .count();
        assert_eq!(n1, 3);
        assert_eq!(n2, 3);
    }

    #[test]
    fn first_table_by_default() {
        let f = write_tmp(TWO_TABLES);
        let reg = LabelRegistry::default();
        let reader = RowReader::open(f.path(), None, &reg).unwrap();
        assert_eq!(reader.table_name(), "optics");
    }

    #[test]
    fn missing_table_reported() {
        let f = write_tmp(TWO_TABLES);
        let reg = LabelRegistry::default();
        let err = RowReader::open(f.path(), Some("movies"), &reg).unwrap_err();
        assert!(err.to_string().contains("movies"));
    }

    #[test]
    fn single_row_block_yields_one_row() {
        let f = write_tmp("data_model_general\n_rlnImageSize 64\n_rlnVoltage 300.0\n");
        let reg = LabelRegistry::default();
        let rows = RowReader::open(f.path(), Some("model_general"), &reg)
            .unwrap()
            .read_all()
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_i64("rlnImageSize").unwrap(), 64);
    }

    #[test]
    fn bad_value_mid_stream_fails() {
        let f = write_tmp("data_x\nloop_\n_rlnDefocusU #1\n100.0\nbogus\n");
        let reg = LabelRegistry::default();
        let results: Vec<_> = RowReader::open(f.path(), None, &reg).unwrap().collect();
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert_eq!(results.len(), 2);
    }
}
