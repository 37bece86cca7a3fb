use crate::torrent::Selection;

/// Parse the interactive file-selection answer: `0` means everything,
/// otherwise comma-space separated 1-based file numbers. Out-of-range and
/// non-numeric entries are dropped.
pub fn parse_selection(input: &str, file_count: usize) -> Selection {
    let input = input.trim();
    if input == "0" {
        return Selection::All;
    }
    let indices = input
        .split(", ")
        .filter_map(|token| token.trim().parse::<usize>().ok())
        .filter(|&n| n >= 1 && n <= file_count)
        .map(|n| n - 1)
        .collect();
    Selection::Files(indices)
}
