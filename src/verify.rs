use std::io::{self, Read, Seek, SeekFrom};

use crate::catalog::Transform;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchResult {
    /// `index` is the first transform whose `before` bytes are on disk.
    Matched { index: usize, observed: Vec<u8> },
    NoMatch { observed: Vec<u8> },
}

/// Check the bytes at `offset` against each transform's `before` pattern.
///
/// Reads at most as many bytes as the longest pattern. A file that ends early
/// simply yields fewer observed bytes and cannot match the longer patterns.
/// The cursor is left past the observed bytes.
pub fn verify<R: Read + Seek>(
    reader: &mut R,
    offset: u64,
    transforms: &[Transform],
) -> io::Result<MatchResult> {
    let window = transforms.iter().map(Transform::len).max().unwrap_or(0);

    reader.seek(SeekFrom::Start(offset))?;
    let mut observed = Vec::with_capacity(window);
    reader.by_ref().take(window as u64).read_to_end(&mut observed)?;

    let matched = transforms
        .iter()
        .position(|t| observed.get(..t.len()) == Some(t.before.as_slice()));

    Ok(match matched {
        Some(index) => MatchResult::Matched { index, observed },
        None => MatchResult::NoMatch { observed },
    })
}
