//! Reading registry keys out of CSV or plain-text files.

use std::fs;
use std::path::Path;

use cadastro_core::RegistryKey;

use crate::error::CliError;

/// Keys found in a file plus the number of non-empty cells that were not valid keys.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct KeyFile {
    pub keys: Vec<String>,
    pub skipped: usize,
}

pub fn load(path: &Path) -> Result<KeyFile, CliError> {
    let content = fs::read_to_string(path)?;
    Ok(parse(&content))
}

/// Pick the column whose header mentions `cnpj`, or the first one, and keep every cell
/// that normalizes to a 14-digit key.
pub fn parse(content: &str) -> KeyFile {
    let mut lines = content.lines().filter(|line| !line.trim().is_empty()).peekable();
    let Some(first) = lines.peek().copied() else {
        return KeyFile::default();
    };

    let delimiter = detect_delimiter(first);
    let header_column = split(first, delimiter)
        .iter()
        .position(|cell| cell.to_ascii_lowercase().contains("cnpj"));
    let column = match header_column {
        Some(index) => {
            lines.next();
            index
        }
        None => 0,
    };

    let mut file = KeyFile::default();
    for line in lines {
        let cells = split(line, delimiter);
        let Some(cell) = cells.get(column).filter(|cell| !cell.is_empty()) else {
            continue;
        };
        match RegistryKey::parse(cell) {
            Ok(key) => file.keys.push(key.to_string()),
            Err(_) => file.skipped += 1,
        }
    }
    file
}

/// The most frequent of `;`, `,` and tab outside quoted text.
fn detect_delimiter(line: &str) -> Option<char> {
    let mut quoted = false;
    let mut counts = [0_usize; 3];
    for ch in line.chars() {
        match ch {
            '"' => quoted = !quoted,
            ';' if !quoted => counts[0] += 1,
            ',' if !quoted => counts[1] += 1,
            '\t' if !quoted => counts[2] += 1,
            _ => {}
        }
    }
    [';', ',', '\t']
        .into_iter()
        .zip(counts)
        .filter(|(_, count)| *count > 0)
        .max_by_key(|(_, count)| *count)
        .map(|(candidate, _)| candidate)
}

/// Split on `delimiter` outside double quotes. Quotes are dropped and `""` inside a quoted
/// cell is a literal quote.
fn split(line: &str, delimiter: Option<char>) -> Vec<String> {
    let mut cells = Vec::new();
    let mut cell = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if quoted && chars.peek() == Some(&'"') => {
                cell.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ch if !quoted && Some(ch) == delimiter => {
                cells.push(cell.trim().to_owned());
                cell.clear();
            }
            ch => cell.push(ch),
        }
    }
    cells.push(cell.trim().to_owned());
    cells
}
