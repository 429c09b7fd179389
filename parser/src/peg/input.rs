use std::rc::Rc;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

/// Returned by `char_at()` for every index at or past the end of the input.
pub const EOI: char = '\u{FFFF}';

// Marker characters injected into a MutableInputBuffer during error recovery.
// They live in the Unicode noncharacter block, so no valid input contains them.
pub const INS_ERROR: char = '\u{FDE9}';
pub const DEL_ERROR: char = '\u{FDEA}';
pub const RESYNC: char = '\u{FDEB}';
pub const RESYNC_START: char = '\u{FDEC}';
pub const RESYNC_END: char = '\u{FDED}';
pub const RESYNC_EOI: char = '\u{FDEE}';

pub fn is_recovery_marker(c: char) -> bool {
    matches!(
        c,
        INS_ERROR | DEL_ERROR | RESYNC | RESYNC_START | RESYNC_END | RESYNC_EOI
    )
}

/// 1-based line and column of a character.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

/// Random-access character source consumed by the matchers.
///
/// Indices count Unicode scalar values, not bytes; a supplementary code point
/// occupies a single index.
pub trait InputBuffer {
    /// The character at `index`, or `EOI` when `index` is past the end.
    fn char_at(&self, index: usize) -> char;

    /// The text between `start` (inclusive) and `end` (exclusive), clamped
    /// to the buffer.
    fn extract(&self, start: usize, end: usize) -> String;

    fn position(&self, index: usize) -> Position;

    /// The text of the 1-based line `line`, without its terminator.
    fn extract_line(&self, line: usize) -> String;

    fn line_count(&self) -> usize;

    /// Number of characters, not counting the EOI sentinel.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maps an index of this buffer to an index of the text supplied by the
    /// caller. Only buffers holding injected characters differ from identity.
    fn original_index(&self, index: usize) -> usize {
        index
    }
}

#[derive(Clone, Debug)]
pub struct DefaultInputBuffer {
    chars: Vec<char>,
    // index of the first character of every line
    line_starts: Vec<usize>,
}

impl DefaultInputBuffer {
    pub fn new(text: &str) -> Self {
        let chars: Vec<char> = text.chars().collect();
        let mut line_starts = vec![0];
        for (idx, &c) in chars.iter().enumerate() {
            if c == '\n' {
                line_starts.push(idx + 1);
            }
        }
        DefaultInputBuffer { chars, line_starts }
    }

    fn line_of(&self, index: usize) -> usize {
        match self.line_starts.binary_search(&index) {
            Ok(line) => line,
            Err(next) => next - 1,
        }
    }
}

impl InputBuffer for DefaultInputBuffer {
    #[inline(always)]
    fn char_at(&self, index: usize) -> char {
        self.chars.get(index).copied().unwrap_or(EOI)
    }

    fn extract(&self, start: usize, end: usize) -> String {
        let end = end.min(self.chars.len());
        if start >= end {
            return String::new();
        }
        self.chars[start..end].iter().collect()
    }

    fn position(&self, index: usize) -> Position {
        let index = index.min(self.chars.len());
        let line = self.line_of(index);
        Position {
            line: line + 1,
            column: index - self.line_starts[line] + 1,
        }
    }

    fn extract_line(&self, line: usize) -> String {
        if line == 0 || line > self.line_starts.len() {
            return String::new();
        }
        let start = self.line_starts[line - 1];
        let end = if line < self.line_starts.len() {
            self.line_starts[line] - 1
        } else {
            self.chars.len()
        };
        let mut s = self.extract(start, end);
        if s.ends_with('\r') {
            s.pop();
        }
        s
    }

    fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    fn len(&self) -> usize {
        self.chars.len()
    }
}

/// A view over another buffer with characters injected at arbitrary
/// positions. The recovering runner owns one for the duration of a run and
/// uses it to place its marker characters.
#[derive(Clone)]
pub struct MutableInputBuffer {
    buffer: Rc<dyn InputBuffer>,
    // sorted indices (in this buffer's coordinates) of the injected chars
    inserts: Vec<usize>,
    chars: Vec<char>,
}

impl MutableInputBuffer {
    pub fn new(buffer: Rc<dyn InputBuffer>) -> Self {
        MutableInputBuffer {
            buffer,
            inserts: vec![],
            chars: vec![],
        }
    }

    pub fn num_insertions(&self) -> usize {
        self.inserts.len()
    }

    /// Injects `c` so that it ends up at `index`; everything at or after
    /// `index` moves one position to the right.
    pub fn insert_char(&mut self, index: usize, c: char) {
        let j = match self.inserts.binary_search(&index) {
            Ok(j) | Err(j) => j,
        };
        for pos in self.inserts[j..].iter_mut() {
            *pos += 1;
        }
        self.inserts.insert(j, index);
        self.chars.insert(j, c);
    }

    /// Removes the character previously injected at `index` and returns it.
    pub fn undo_char_insertion(&mut self, index: usize) -> Result<char> {
        let j = self.inserts.binary_search(&index);
        ensure!(j.is_ok(), "no injected character at index {}", index);
        let j = j.unwrap_or_default();
        self.inserts.remove(j);
        for pos in self.inserts[j..].iter_mut() {
            *pos -= 1;
        }
        Ok(self.chars.remove(j))
    }

    pub fn replace_inserted_char(&mut self, index: usize, c: char) -> Result<()> {
        let j = self.inserts.binary_search(&index);
        ensure!(
            j.is_ok(),
            "only injected characters can be replaced (index {})",
            index
        );
        self.chars[j.unwrap_or_default()] = c;
        Ok(())
    }

    pub fn original(&self) -> &Rc<dyn InputBuffer> {
        &self.buffer
    }
}

impl InputBuffer for MutableInputBuffer {
    fn char_at(&self, index: usize) -> char {
        match self.inserts.binary_search(&index) {
            Ok(j) => self.chars[j],
            Err(j) => self.buffer.char_at(index - j),
        }
    }

    fn extract(&self, start: usize, end: usize) -> String {
        let end = end.min(self.len());
        (start..end).map(|idx| self.char_at(idx)).collect()
    }

    fn position(&self, index: usize) -> Position {
        self.buffer.position(self.original_index(index))
    }

    fn extract_line(&self, line: usize) -> String {
        self.buffer.extract_line(line)
    }

    fn line_count(&self) -> usize {
        self.buffer.line_count()
    }

    fn len(&self) -> usize {
        self.buffer.len() + self.inserts.len()
    }

    fn original_index(&self, index: usize) -> usize {
        let j = match self.inserts.binary_search(&index) {
            Ok(j) | Err(j) => j,
        };
        self.buffer.original_index(index - j)
    }
}

/// Text between `start` and `end` with recovery markers resolved: deleted
/// characters and markers are dropped, injected characters are kept and
/// resynchronized regions are skipped entirely.
pub fn extract_without_markers(input: &dyn InputBuffer, start: usize, end: usize) -> String {
    let mut r = String::new();
    let mut idx = start;
    while idx < end {
        match input.char_at(idx) {
            DEL_ERROR => idx += 1,
            INS_ERROR | RESYNC | RESYNC_END | EOI => {}
            RESYNC_START => {
                idx += 1;
                while idx < end && input.char_at(idx) != RESYNC_END {
                    idx += 1;
                }
            }
            RESYNC_EOI => break,
            c => r.push(c),
        }
        idx += 1;
    }
    r
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positions_and_lines() {
        let buf = DefaultInputBuffer::new("ab\ncd\r\n\nxyz");
        assert_eq!(buf.len(), 11);
        assert_eq!(buf.char_at(1), 'b');
        assert_eq!(buf.char_at(11), EOI);
        assert_eq!(buf.position(0), Position { line: 1, column: 1 });
        assert_eq!(buf.position(4), Position { line: 2, column: 2 });
        assert_eq!(buf.position(8), Position { line: 4, column: 1 });
        assert_eq!(buf.line_count(), 4);
        assert_eq!(buf.extract_line(2), "cd");
        assert_eq!(buf.extract_line(3), "");
        assert_eq!(buf.extract_line(4), "xyz");
        assert_eq!(buf.extract_line(5), "");
        assert_eq!(buf.extract(8, 100), "xyz");
        assert_eq!(buf.extract(3, 2), "");
    }

    #[test]
    fn test_supplementary_code_points() {
        let buf = DefaultInputBuffer::new("a\u{1F600}b");
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.char_at(1), '\u{1F600}');
        assert_eq!(buf.char_at(2), 'b');
    }

    #[test]
    fn test_mutable_insertions() {
        let base: Rc<dyn InputBuffer> = Rc::new(DefaultInputBuffer::new("abc"));
        let mut buf = MutableInputBuffer::new(base);
        buf.insert_char(1, INS_ERROR);
        buf.insert_char(2, 'x');
        assert_eq!(buf.extract(0, 10), format!("a{}xbc", INS_ERROR));
        assert_eq!(buf.len(), 5);
        assert_eq!(buf.original_index(1), 1);
        assert_eq!(buf.original_index(3), 1);
        assert_eq!(buf.original_index(4), 2);
        assert_eq!(buf.position(3).column, 2);

        // inserting at an already injected index goes in front of it
        buf.insert_char(1, DEL_ERROR);
        assert_eq!(buf.extract(0, 10), format!("a{}{}xbc", DEL_ERROR, INS_ERROR));

        assert_eq!(buf.undo_char_insertion(1).unwrap(), DEL_ERROR);
        assert_eq!(buf.undo_char_insertion(2).unwrap(), 'x');
        assert!(buf.undo_char_insertion(2).is_err());
        buf.replace_inserted_char(1, RESYNC).unwrap();
        assert_eq!(buf.char_at(1), RESYNC);
        assert!(buf.replace_inserted_char(0, RESYNC).is_err());
        assert_eq!(buf.undo_char_insertion(1).unwrap(), RESYNC);
        assert_eq!(buf.extract(0, 10), "abc");
    }

    #[test]
    fn test_extract_without_markers() {
        let base: Rc<dyn InputBuffer> = Rc::new(DefaultInputBuffer::new("a-bc;d"));
        let mut buf = MutableInputBuffer::new(base);
        // delete '-', insert 'X' before 'c', skip "c;" as a resync region
        buf.insert_char(1, DEL_ERROR);
        buf.insert_char(4, INS_ERROR);
        buf.insert_char(5, 'X');
        buf.insert_char(6, RESYNC_START);
        buf.insert_char(9, RESYNC_END);
        assert_eq!(extract_without_markers(&buf, 0, buf.len()), "abXd");
    }
}
