//! Source input: a pull-style byte reader.
//!
//! The lexer consumes one byte at a time through [`SourceReader`];
//! non-negative return values are bytes, [`SOURCE_EOF`] marks the end of the
//! stream. This keeps the compiler independent of where the source comes
//! from (strings, files, embedded pack files).

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Sentinel returned at end of stream.
pub const SOURCE_EOF: i32 = -1;

/// A pull-style byte source.
pub trait SourceReader {
    /// The next byte (0..=255), or [`SOURCE_EOF`].
    fn read_byte(&mut self) -> i32;
}

/// Reads from an in-memory string or byte slice.
pub struct StrSource<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> StrSource<'a> {
    pub fn new(source: &'a str) -> StrSource<'a> {
        StrSource {
            bytes: source.as_bytes(),
            pos: 0,
        }
    }
}

impl SourceReader for StrSource<'_> {
    fn read_byte(&mut self) -> i32 {
        match self.bytes.get(self.pos) {
            Some(&b) => {
                self.pos += 1;
                b as i32
            }
            None => SOURCE_EOF,
        }
    }
}

/// Reads from a file, buffered.
pub struct FileSource {
    reader: BufReader<File>,
}

impl FileSource {
    pub fn open(path: &Path) -> std::io::Result<FileSource> {
        Ok(FileSource {
            reader: BufReader::new(File::open(path)?),
        })
    }
}

impl SourceReader for FileSource {
    fn read_byte(&mut self) -> i32 {
        let mut byte = [0u8; 1];
        match self.reader.read(&mut byte) {
            Ok(1) => byte[0] as i32,
            _ => SOURCE_EOF,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn str_source_yields_bytes_then_eof() {
        let mut src = StrSource::new("ab");
        assert_eq!(src.read_byte(), b'a' as i32);
        assert_eq!(src.read_byte(), b'b' as i32);
        assert_eq!(src.read_byte(), SOURCE_EOF);
        assert_eq!(src.read_byte(), SOURCE_EOF);
    }
}
