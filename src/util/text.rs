/// Maximum byte length of a generated file stem.
const MAX_STEM_LEN: usize = 200;

/// Turn a feed entry title into a safe file stem.
///
/// Control characters are dropped, path separators and characters that are
/// reserved on common filesystems become `_`, and leading dots are stripped so
/// the result can never name a hidden file or walk out of the target
/// directory. The stem is cut on a char boundary at [`MAX_STEM_LEN`] bytes.
/// An input with nothing usable left yields `"untitled"`.
pub fn sanitize_filename(title: &str) -> String {
    let mut out = String::with_capacity(title.len().min(MAX_STEM_LEN));

    for c in title.chars() {
        if c.is_control() {
            continue;
        }
        let mapped = match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        };
        if out.len() + mapped.len_utf8() > MAX_STEM_LEN {
            break;
        }
        out.push(mapped);
    }

    let trimmed = out.trim().trim_start_matches('.').trim();
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed.to_string()
    }
}
