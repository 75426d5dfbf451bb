//! STAR table engine.
//!
//! The multi-block, column-typed text format used to exchange metadata with
//! the refinement engine. [`parse`]/[`write_star`] cover whole files in
//! memory; [`RowReader`] streams a single table lazily for the large
//! per-particle files.

pub mod labels;
pub mod parse;
pub mod read;
pub mod table;
pub mod value;
pub mod write;

pub use labels::LabelRegistry;
pub use parse::{parse, parse_path};
pub use read::{RowReader, StarRow, TableRef};
pub use table::{Column, RowView, StarError, StarFile, StarTable};
pub use value::{Value, ValueType};
pub use write::{to_string, write_star, write_star_path, write_table, VERSION_STAMP};
