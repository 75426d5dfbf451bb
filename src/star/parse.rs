//! STAR text parser.
//!
//! Parses the `data_`/`loop_`/`_rlnLabel` dialect written by the refinement
//! engine into typed [`StarFile`] tables. Column types come from the caller's
//! [`LabelRegistry`]; labels the registry does not know are kept verbatim as
//! strings. Structural problems (row arity, bad numerics, stray data lines)
//! fail the whole parse with line/table/column context — a table is never
//! partially returned.

use std::path::Path;

use super::labels::LabelRegistry;
use super::table::{StarError, StarFile, StarTable};
use super::value::{Value, ValueType};

/// Parse STAR text into a [`StarFile`].
pub fn parse(input: &str, registry: &LabelRegistry) -> Result<StarFile, StarError> {
    Parser::new(registry).run(input)
}

/// Parse a STAR file from disk, attaching the path to any error.
pub fn parse_path(path: &Path, registry: &LabelRegistry) -> Result<StarFile, StarError> {
    let text = std::fs::read_to_string(path).map_err(|e| StarError::from(e).in_file(path))?;
    parse(&text, registry).map_err(|e| e.in_file(path))
}

enum Mode {
    /// Before any `data_` line.
    Idle,
    /// Inside a block, flavor not yet decided.
    Block,
    /// Collecting `_label` declarations after `loop_`.
    LoopHeader,
    /// Reading whitespace-delimited data lines.
    LoopData,
    /// Reading `_label value` pairs.
    SingleRow,
}

struct Parser<'r> {
    registry: &'r LabelRegistry,
    file: StarFile,
    table: Option<StarTable>,
    /// Key-value pairs of a single-row block, materialized at block end.
    pending_pairs: Vec<(String, ValueType, Value)>,
    mode: Mode,
}

impl<'r> Parser<'r> {
    fn new(registry: &'r LabelRegistry) -> Self {
        Self {
            registry,
            file: StarFile::new(),
            table: None,
            pending_pairs: Vec::new(),
            mode: Mode::Idle,
        }
    }

    fn run(mut self, input: &str) -> Result<StarFile, StarError> {
        for (i, raw) in input.lines().enumerate() {
            let line_no = i + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            self.line(line, line_no)?;
        }
        self.finish_table(input.lines().count())?;
        Ok(self.file)
    }

    fn structure(line: usize, detail: impl Into<String>) -> StarError {
        StarError::Structure {
            line,
            detail: detail.into(),
        }
    }

    fn line(&mut self, line: &str, line_no: usize) -> Result<(), StarError> {
        if let Some(name) = line.strip_prefix("data_") {
            self.finish_table(line_no)?;
            self.table = Some(StarTable::new(name));
            self.mode = Mode::Block;
            return Ok(());
        }

        match self.mode {
            Mode::Idle => Err(Self::structure(
                line_no,
                format!("content before first data_ block: {line:?}"),
            )),
            Mode::Block => {
                if line == "loop_" {
                    self.mode = Mode::LoopHeader;
                    Ok(())
                } else if line.starts_with('_') {
                    // Block flavor decided: key-value pairs.
                    let table = self.table.as_mut().unwrap();
                    let name = table.name().to_string();
                    *table = StarTable::new_single_row(name);
                    self.mode = Mode::SingleRow;
                    self.pair(line, line_no)
                } else {
                    Err(Self::structure(
                        line_no,
                        format!("expected loop_ or _label line, got {line:?}"),
                    ))
                }
            }
            Mode::LoopHeader => {
                if line.starts_with('_') {
                    // Declarations may carry a `#N` column-number annotation.
                    let fields = split_fields(line, line_no)?;
                    let label = fields
                        .first()
                        .and_then(|f| label_of(f))
                        .ok_or_else(|| {
                            Self::structure(line_no, format!("bad column declaration {line:?}"))
                        })?;
                    let table = self.table.as_mut().unwrap();
                    let vtype = self.registry.type_of(label);
                    table
                        .add_column(label, vtype, Value::from(""))
                        .map_err(|_| {
                            Self::structure(line_no, format!("duplicate column {label:?}"))
                        })?;
                    Ok(())
                } else {
                    if self.table.as_ref().unwrap().columns().is_empty() {
                        return Err(Self::structure(line_no, "loop_ with no column declarations"));
                    }
                    self.mode = Mode::LoopData;
                    self.data_row(line, line_no)
                }
            }
            Mode::LoopData => {
                if line == "loop_" || line.starts_with('_') {
                    return Err(Self::structure(
                        line_no,
                        format!("unexpected declaration inside data rows: {line:?}"),
                    ));
                }
                self.data_row(line, line_no)
            }
            Mode::SingleRow => {
                if line.starts_with('_') {
                    self.pair(line, line_no)
                } else {
                    Err(Self::structure(
                        line_no,
                        format!("expected _label value pair, got {line:?}"),
                    ))
                }
            }
        }
    }

    fn data_row(&mut self, line: &str, line_no: usize) -> Result<(), StarError> {
        let fields = split_fields(line, line_no)?;
        let table = self.table.as_mut().unwrap();
        let row_idx = table.n_rows();
        if fields.len() != table.columns().len() {
            return Err(StarError::Arity {
                table: table.name().to_string(),
                row: row_idx,
                expected: table.columns().len(),
                got: fields.len(),
            });
        }
        let mut values = Vec::with_capacity(fields.len());
        for (col, field) in table.columns().iter().zip(&fields) {
            let v = Value::parse_typed(field, col.vtype).map_err(|detail| {
                StarError::BadValue {
                    table: table.name().to_string(),
                    column: col.name.clone(),
                    row: row_idx,
                    detail,
                }
            })?;
            values.push(v);
        }
        table.add_row(values)
    }

    fn pair(&mut self, line: &str, line_no: usize) -> Result<(), StarError> {
        let fields = split_fields(line, line_no)?;
        if fields.len() != 2 {
            return Err(Self::structure(
                line_no,
                format!("expected _label value pair, got {} tokens", fields.len()),
            ));
        }
        let label = label_of(&fields[0]).ok_or_else(|| {
            Self::structure(line_no, format!("bad label token {:?}", fields[0]))
        })?;
        let table = self.table.as_mut().unwrap();
        let vtype = self.registry.type_of(label);
        let value = Value::parse_typed(&fields[1], vtype).map_err(|detail| StarError::BadValue {
            table: table.name().to_string(),
            column: label.to_string(),
            row: 0,
            detail,
        })?;
        if self.pending_pairs.iter().any(|(l, _, _)| l == label) {
            return Err(StarError::DuplicateColumn {
                table: table.name().to_string(),
                column: label.to_string(),
            });
        }
        self.pending_pairs.push((label.to_string(), vtype, value));
        Ok(())
    }

    fn finish_table(&mut self, line_no: usize) -> Result<(), StarError> {
        if let Some(mut table) = self.table.take() {
            if matches!(self.mode, Mode::LoopHeader) && table.columns().is_empty() {
                return Err(Self::structure(line_no, "unterminated loop_"));
            }
            if table.is_single_row() {
                let pairs = std::mem::take(&mut self.pending_pairs);
                let mut values = Vec::with_capacity(pairs.len());
                for (label, vtype, value) in pairs {
                    table.add_column(label, vtype, Value::from(""))?;
                    values.push(value);
                }
                table.add_row(values)?;
            }
            self.file.push(table);
        }
        Ok(())
    }
}

pub(super) fn label_of(token: &str) -> Option<&str> {
    token.strip_prefix('_').filter(|l| !l.is_empty())
}

/// Split one line into fields, honoring single/double quotes and trailing
/// `#` comments (a `#` opens a comment only at the start of a field, which
/// also strips the `#N` column-number annotations the engine writes).
pub(super) fn split_fields(line: &str, line_no: usize) -> Result<Vec<String>, StarError> {
    let bytes = line.as_bytes();
    let mut fields = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
            pos += 1;
        }
        if pos >= bytes.len() {
            break;
        }
        let b = bytes[pos];
        if b == b'#' {
            break; // comment to end of line
        }
        if b == b'\'' || b == b'"' {
            let quote = b;
            let start = pos + 1;
            let mut end = start;
            loop {
                if end >= bytes.len() {
                    return Err(StarError::Structure {
                        line: line_no,
                        detail: format!("unterminated quoted string: {line:?}"),
                    });
                }
                // Closing quote must be followed by whitespace or EOL.
                if bytes[end] == quote
                    && (end + 1 >= bytes.len() || bytes[end + 1].is_ascii_whitespace())
                {
                    break;
                }
                end += 1;
            }
            fields.push(line[start..end].to_string());
            pos = end + 1;
        } else {
            let start = pos;
            while pos < bytes.len() && !bytes[pos].is_ascii_whitespace() {
                pos += 1;
            }
            fields.push(line[start..pos].to_string());
        }
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg() -> LabelRegistry {
        LabelRegistry::default()
    }

    #[test]
    fn looped_block() {
        let input = "\
data_micrographs

loop_
_rlnMicrographName #1
_rlnDefocusU #2
mic1.mrc 10000.5
mic2.mrc 12000.0
";
        let file = parse(input, &reg()).unwrap();
        let t = file.table("micrographs").unwrap();
        assert_eq!(t.n_rows(), 2);
        assert!(!t.is_single_row());
        let row = t.row(0).unwrap();
        assert_eq!(row.get_str("rlnMicrographName").unwrap(), "mic1.mrc");
        assert_eq!(row.get_f64("rlnDefocusU").unwrap(), 10000.5);
    }

    #[test]
    fn single_row_block() {
        let input = "data_general\n_rlnVoltage 300.0\n_rlnImageName img.mrc\n";
        let file = parse(input, &reg()).unwrap();
        let t = file.table("general").unwrap();
        assert!(t.is_single_row());
        assert_eq!(t.n_rows(), 1);
        let row = t.row(0).unwrap();
        assert_eq!(row.get_f64("rlnVoltage").unwrap(), 300.0);
        assert_eq!(row.get_str("rlnImageName").unwrap(), "img.mrc");
    }

    #[test]
    fn unknown_labels_kept_as_strings() {
        let input = "data_x\nloop_\n_rlnBrandNewLabel\nhello\n";
        let file = parse(input, &reg()).unwrap();
        let row = file.table("x").unwrap().row(0).unwrap();
        assert_eq!(row.get_str("rlnBrandNewLabel").unwrap(), "hello");
    }

    #[test]
    fn version_comments_skipped() {
        let input = "# version 30001\ndata_optics\nloop_\n_rlnOpticsGroup #1\n1\n";
        let file = parse(input, &reg()).unwrap();
        assert_eq!(file.table("optics").unwrap().n_rows(), 1);
    }

    #[test]
    fn quoted_values() {
        let input = "data_x\nloop_\n_rlnMicrographName\n'my file.mrc'\n";
        let file = parse(input, &reg()).unwrap();
        let row = file.table("x").unwrap().row(0).unwrap();
        assert_eq!(row.get_str("rlnMicrographName").unwrap(), "my file.mrc");
    }

    #[test]
    fn empty_block_name() {
        let input = "data_\nloop_\n_rlnImageId\n1\n2\n";
        let file = parse(input, &reg()).unwrap();
        assert_eq!(file.table("").unwrap().n_rows(), 2);
    }

    #[test]
    fn empty_table_is_valid() {
        let input = "data_particles\nloop_\n_rlnImageName\n_rlnClassNumber\n";
        let file = parse(input, &reg()).unwrap();
        let t = file.table("particles").unwrap();
        assert_eq!(t.columns().len(), 2);
        assert_eq!(t.n_rows(), 0);
    }

    #[test]
    fn arity_mismatch_fails() {
        let input = "data_x\nloop_\n_rlnDefocusU\n_rlnDefocusV\n100.0\n";
        let err = parse(input, &reg()).unwrap_err();
        assert!(matches!(err, StarError::Arity { expected: 2, got: 1, .. }));
    }

    #[test]
    fn bad_numeric_fails_with_context() {
        let input = "data_mics\nloop_\n_rlnDefocusU\nnot_a_number\n";
        let err = parse(input, &reg()).unwrap_err();
        match err {
            StarError::BadValue { table, column, row, .. } => {
                assert_eq!(table, "mics");
                assert_eq!(column, "rlnDefocusU");
                assert_eq!(row, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn loop_without_columns_fails() {
        let input = "data_x\nloop_\n1 2 3\n";
        assert!(matches!(
            parse(input, &reg()).unwrap_err(),
            StarError::Structure { .. }
        ));
    }

    #[test]
    fn data_before_block_fails() {
        let input = "loop_\n_rlnImageId\n1\n";
        assert!(matches!(
            parse(input, &reg()).unwrap_err(),
            StarError::Structure { .. }
        ));
    }

    #[test]
    fn two_tables() {
        let input = "\
data_optics
loop_
_rlnOpticsGroup
_rlnOpticsGroupName
1 opticsGroup1

data_particles
loop_
_rlnImageName
_rlnOpticsGroup
000001@stack.mrcs 1
";
        let file = parse(input, &reg()).unwrap();
        assert_eq!(file.tables().len(), 2);
        assert!(file.has_table("optics"));
        assert_eq!(file.table("particles").unwrap().n_rows(), 1);
    }

    #[test]
    fn registry_override_applies() {
        let mut registry = LabelRegistry::default();
        registry.set("rlnMyScore", ValueType::Float);
        let input = "data_x\nloop_\n_rlnMyScore\n1.25\n";
        let file = parse(input, &registry).unwrap();
        let row = file.table("x").unwrap().row(0).unwrap();
        assert_eq!(row.get_f64("rlnMyScore").unwrap(), 1.25);
    }
}
