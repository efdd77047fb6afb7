use std::fmt::Write as _;

/// Builds a comma-separated placeholder list `$start, $start+1, ...`,
/// optionally casting each placeholder (`$5::uuid, $6::uuid`).
pub(crate) fn placeholder_list(start: usize, count: usize, cast: Option<&str>) -> String {
    let mut list = String::new();

    for offset in 0..count {
        if offset > 0 {
            list.push_str(", ");
        }
        match cast {
            Some(cast) => write!(list, "${}::{cast}", start + offset).unwrap(),
            None => write!(list, "${}", start + offset).unwrap(),
        }
    }

    list
}

/// Highest `$n` placeholder index appearing in a statement, for checking
/// that parameter lists line up with the SQL they feed.
#[cfg(test)]
pub(crate) fn max_placeholder(sql: &str) -> usize {
    let mut max = 0;
    let bytes = sql.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'$' {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            if j > i + 1 {
                let index: usize = sql[i + 1..j].parse().unwrap();
                max = max.max(index);
            }
            i = j;
        } else {
            i += 1;
        }
    }

    max
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_lists_are_sequential() {
        assert_eq!(placeholder_list(1, 3, None), "$1, $2, $3");
        assert_eq!(placeholder_list(4, 2, Some("uuid")), "$4::uuid, $5::uuid");
        assert_eq!(placeholder_list(9, 0, None), "");
    }

    #[test]
    fn max_placeholder_scans_all_indices() {
        assert_eq!(max_placeholder("SELECT $1, $12 FROM t WHERE a = $3"), 12);
        assert_eq!(max_placeholder("SELECT 1"), 0);
        assert_eq!(max_placeholder("SELECT '$'"), 0);
    }
}
