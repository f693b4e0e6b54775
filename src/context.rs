//! Context assembly for the prompt.

/// Default byte budget for retrieved context.
pub const DEFAULT_CONTEXT_BUDGET: usize = 3000;

/// Joins `chunks` with `"\n"` in the given order and cuts the result to at
/// most `byte_budget` bytes, backing off to a UTF-8 character boundary.
pub fn assemble<S: AsRef<str>>(chunks: &[S], byte_budget: usize) -> String {
    let mut joined = chunks
        .iter()
        .map(|c| c.as_ref())
        .collect::<Vec<_>>()
        .join("\n");

    if joined.len() > byte_budget {
        let mut cut = byte_budget;
        while !joined.is_char_boundary(cut) {
            cut -= 1;
        }
        joined.truncate(cut);
    }
    joined
}
