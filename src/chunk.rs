//! Overlapping, boundary-aware text chunker.
//!
//! Splits extracted document text into segments of at most `chunk_size`
//! characters. Consecutive chunks share exactly `chunk_overlap` characters, so
//! dropping the first `chunk_overlap` characters of every chunk after the
//! first and concatenating gives back the input.
//!
//! A chunk's end is pulled back from its hard limit to the nearest natural
//! breakpoint found within `boundary_window` characters. Breakpoints are tried
//! in order: paragraph break, sentence end, line break, any whitespace. With
//! none in the window the chunk is cut at the hard limit.
//!
//! Lengths are counted in `char`s, never bytes, so multi-byte text is never
//! split inside a character.

use crate::config::ChunkingConfig;

/// Split `text` into overlapping chunks.
///
/// Text of at most `chunk_size` characters (including the empty string) comes
/// back as a single chunk equal to the input.
pub fn chunk_text(text: &str, config: &ChunkingConfig) -> Vec<String> {
    let size = config.chunk_size.max(1);
    let overlap = config.chunk_overlap.min(size - 1);

    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= size {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    loop {
        if chars.len() - start <= size {
            chunks.push(chars[start..].iter().collect());
            break;
        }

        let hard_end = start + size;
        // The next chunk starts `overlap` chars before this one ends, so the end
        // must stay past `start + overlap` for the loop to make progress.
        let floor = (start + overlap + 1).max(hard_end.saturating_sub(config.boundary_window));
        let end = find_breakpoint(&chars, floor, hard_end).unwrap_or(hard_end);

        chunks.push(chars[start..end].iter().collect());
        start = end - overlap;
    }

    chunks
}

#[derive(Clone, Copy)]
enum Breakpoint {
    Paragraph,
    Sentence,
    Line,
    Whitespace,
}

const PREFERENCE: [Breakpoint; 4] = [
    Breakpoint::Paragraph,
    Breakpoint::Sentence,
    Breakpoint::Line,
    Breakpoint::Whitespace,
];

/// Finds the latest end position in `floor..=hard_end` that sits just after a
/// breakpoint, trying breakpoint kinds in preference order.
fn find_breakpoint(chars: &[char], floor: usize, hard_end: usize) -> Option<usize> {
    if floor > hard_end {
        return None;
    }
    PREFERENCE.iter().find_map(|kind| {
        (floor..=hard_end)
            .rev()
            .find(|&end| ends_with_breakpoint(chars, end, *kind))
    })
}

fn ends_with_breakpoint(chars: &[char], end: usize, kind: Breakpoint) -> bool {
    if end == 0 || end > chars.len() {
        return false;
    }
    let last = chars[end - 1];
    let prev = if end >= 2 { Some(chars[end - 2]) } else { None };
    match kind {
        Breakpoint::Paragraph => last == '\n' && prev == Some('\n'),
        Breakpoint::Sentence => {
            last.is_whitespace() && matches!(prev, Some('.') | Some('!') | Some('?'))
        }
        Breakpoint::Line => last == '\n',
        Breakpoint::Whitespace => last.is_whitespace(),
    }
}
