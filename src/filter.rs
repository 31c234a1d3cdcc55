/// Longest path the filter will look at, the kernel's PATH_MAX.
pub const PATH_MAX: usize = 4096;

/// True when `needle` occurs as a contiguous substring of `haystack`.
///
/// Degenerate inputs never match: an empty needle (Rust's `contains` would
/// say yes), an empty haystack, or either side longer than [`PATH_MAX`].
/// Note this is a plain substring scan, not a prefix or component match;
/// watching `/tmp` also matches `/var/tmp2/secret`.
pub fn path_matches(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    if haystack.len() > PATH_MAX || needle.len() > PATH_MAX {
        return false;
    }
    haystack.contains(needle)
}
