//! CSV table loading (SPEC_FULL.md §4.8).
//!
//! `LoadTable` is named but not specified in depth by the source
//! specification - no quoted-field escaping, no type inference beyond "every
//! cell is a string unless it parses as an integer or float". This is the
//! minimal reader that makes `Engine::load_table` concrete.

use crate::error::EngineError;
use crate::value::{Cell, HostRef};

/// One parsed data row, cell-typed by the same `int > float > string`
/// fallback order the reader uses for bare literals.
pub fn parse_rows(text: &str) -> Result<Vec<Vec<Cell>>, EngineError> {
    let mut rows = Vec::new();
    let mut expected_arity: Option<usize> = None;

    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let cells: Vec<Cell> = line.split(',').map(|field| parse_cell(field.trim())).collect();

        match expected_arity {
            None => expected_arity = Some(cells.len()),
            Some(arity) if arity != cells.len() => {
                return Err(EngineError::SyntaxError(format!(
                    "line {}: row has {} columns, expected {arity}",
                    line_no + 1,
                    cells.len()
                )))
            }
            Some(_) => {}
        }
        rows.push(cells);
    }
    Ok(rows)
}

fn parse_cell(field: &str) -> Cell {
    if let Ok(n) = field.parse::<i64>() {
        return Cell::Int(n);
    }
    if let Ok(f) = field.parse::<f32>() {
        return Cell::Float(f);
    }
    Cell::Reference(HostRef::Str(std::rc::Rc::from(field)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typed_columns() {
        let rows = parse_rows("1,2.5,hello\n3,4.0,world\n").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], Cell::Int(1));
        assert_eq!(rows[0][1], Cell::Float(2.5));
        assert!(matches!(&rows[0][2], Cell::Reference(HostRef::Str(s)) if &**s == "hello"));
    }

    #[test]
    fn blank_lines_are_skipped() {
        let rows = parse_rows("1,2\n\n3,4\n").unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn mismatched_column_count_is_a_syntax_error() {
        let err = parse_rows("1,2\n3,4,5\n").unwrap_err();
        assert!(matches!(err, EngineError::SyntaxError(_)));
    }
}
