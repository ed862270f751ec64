/// Maps a source field name (CSV header or JSON key) to its canonical
/// storage column name.
///
/// CSV exports use PascalCase-with-spaces headers (`"SalesOrder ID"`),
/// JSON payloads use snake_case keys (`"salesorder_id"`); both must land
/// on a stable underscore-lowercase name. Compound words are split at
/// every lowercase-to-uppercase boundary before case folding, so
/// `SalesOrder` becomes `sales_order` and a trailing uppercase run like
/// the `ID` in `EmailID` still separates into its own word.
pub fn normalize_column_name(raw: &str) -> String {
    // Split compound words: a lowercase letter immediately followed by an
    // uppercase letter is a word boundary.
    let mut split = String::with_capacity(raw.len() + 4);
    let mut prev_was_lower = false;
    for ch in raw.chars() {
        if prev_was_lower && ch.is_ascii_uppercase() {
            split.push(' ');
        }
        prev_was_lower = ch.is_ascii_lowercase();
        split.push(ch);
    }

    // Fold everything that is not an ASCII letter or digit to an
    // underscore, lowercasing as we go, collapsing runs and stripping
    // leading underscores in the same pass.
    let mut out = String::with_capacity(split.len());
    let mut prev_was_underscore = true;
    for ch in split.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            prev_was_underscore = false;
        } else if !prev_was_underscore {
            out.push('_');
            prev_was_underscore = true;
        }
    }
    if out.ends_with('_') {
        out.pop();
    }
    out
}
