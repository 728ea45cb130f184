//! File naming for completed uploads
//!
//! Collisions in a destination folder are resolved by inserting `-N` right
//! before the final extension: `movie.mp4`, `movie-1.mp4`, `movie-2.mp4`.

/// Reduce a client supplied name to a single safe path component.
///
/// Returns `None` when nothing usable is left (empty, `.`, `..`).
pub fn sanitize_filename(name: &str) -> Option<String> {
    // Clients on Windows send backslash separated paths
    let last = name.rsplit(|c| c == '/' || c == '\\').next()?.trim();
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();

    match cleaned.as_str() {
        "" | "." | ".." => None,
        _ => Some(cleaned),
    }
}

/// Split a name into stem and final extension (without the dot).
///
/// A leading dot does not start an extension, so `.bashrc` has none.
pub fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < name.len() => (&name[..idx], Some(&name[idx + 1..])),
        _ => (name, None),
    }
}

/// The `attempt`-th candidate name; attempt 0 is the name itself.
pub fn candidate_name(name: &str, attempt: u32) -> String {
    if attempt == 0 {
        return name.to_string();
    }
    match split_extension(name) {
        (stem, Some(ext)) => format!("{}-{}.{}", stem, attempt, ext),
        (stem, None) => format!("{}-{}", stem, attempt),
    }
}
