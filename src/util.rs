use std::ascii;

/// Escapes raw wire bytes for logging.
pub fn bytes_to_human_str(input: &[u8]) -> String {
    input
        .iter()
        .flat_map(|&c| ascii::escape_default(c))
        .map(char::from)
        .collect()
}
