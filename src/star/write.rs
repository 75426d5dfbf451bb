//! STAR text serializer.
//!
//! Writes tables back out in the dialect the refinement engine reads:
//! declaration-order columns with `#N` annotations, one whitespace-delimited
//! line per row, and `_label value` lines for single-row blocks. Numeric
//! formatting is stable but not byte-identical to third-party files; the
//! round-trip contract is value equality.

use std::io::Write;
use std::path::Path;

use super::table::{StarError, StarFile, StarTable};
use super::value::Value;

/// Version stamp the 3.1-format engine writes before each block.
pub const VERSION_STAMP: &str = "# version 30001";

/// Serialize a whole file, tables in declaration order.
pub fn write_star<W: Write>(file: &StarFile, w: &mut W) -> Result<(), StarError> {
    for table in file.tables() {
        write_table(table, w)?;
    }
    Ok(())
}

/// Serialize to a file on disk, attaching the path to any error.
pub fn write_star_path(file: &StarFile, path: &Path) -> Result<(), StarError> {
    let f = std::fs::File::create(path).map_err(|e| StarError::from(e).in_file(path))?;
    let mut w = std::io::BufWriter::new(f);
    write_star(file, &mut w).map_err(|e| e.in_file(path))?;
    w.flush().map_err(|e| StarError::from(e).in_file(path))
}

/// Serialize one `data_` block.
pub fn write_table<W: Write>(table: &StarTable, w: &mut W) -> Result<(), StarError> {
    writeln!(w, "\ndata_{}\n", table.name())?;

    if table.is_single_row() {
        if let Some(row) = table.row(0) {
            for col in table.columns() {
                let value = row.get(&col.name)?;
                writeln!(w, "_{} {}", col.name, quote(&value.to_token()))?;
            }
        }
        writeln!(w)?;
        return Ok(());
    }

    writeln!(w, "loop_")?;
    for (i, col) in table.columns().iter().enumerate() {
        writeln!(w, "_{} #{}", col.name, i + 1)?;
    }
    for row in table.iter_rows() {
        let mut line = String::new();
        for (i, col) in table.columns().iter().enumerate() {
            if i > 0 {
                line.push(' ');
            }
            let value = row.get(&col.name)?;
            match value {
                Value::Str(_) => line.push_str(&quote(&value.to_token())),
                // Right-align numerics the way the engine does.
                _ => line.push_str(&format!("{:>12}", value.to_token())),
            }
        }
        writeln!(w, "{line}")?;
    }
    writeln!(w)?;
    Ok(())
}

/// Serialize a file to a `String` (test and in-memory use).
pub fn to_string(file: &StarFile) -> Result<String, StarError> {
    let mut buf = Vec::new();
    write_star(file, &mut buf)?;
    Ok(String::from_utf8(buf).expect("serializer writes UTF-8"))
}

fn quote(token: &str) -> String {
    if token.is_empty() {
        "''".to_string()
    } else if token.chars().any(|c| c.is_whitespace()) {
        if token.contains('\'') {
            format!("\"{token}\"")
        } else {
            format!("'{token}'")
        }
    } else {
        token.to_string()
    }
}
