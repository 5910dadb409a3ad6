use std::fmt::Write as _;

use camino::Utf8Path;

/// Render a path so a POSIX shell would parse it back unchanged; plain
/// paths are passed through as-is.
pub fn shell_quote_path(path: &Utf8Path) -> String {
    let s = path.as_str();
    if !s.is_empty()
        && s
            .chars()
            .all(|c| matches!(c, '/' | '.' | '-' | '_') || c.is_alphanumeric())
    {
        return s.to_owned();
    }
    shlex::try_quote(s)
        .map(|q| q.into_owned())
        .unwrap_or_else(|_| format!("{s:?}"))
}

/// Format a list of paths one per line with a leading indent, showing at
/// most `max` entries followed by a count of the rest.
pub fn format_path_list<'a, I>(paths: I, max: usize) -> String
where
    I: IntoIterator<Item = &'a Utf8Path>,
{
    let mut out = String::new();
    let mut remaining = 0usize;
    for (i, p) in paths.into_iter().enumerate() {
        if i < max {
            // Writing to a String cannot fail
            let _ = writeln!(out, "  {}", shell_quote_path(p));
        } else {
            remaining += 1;
        }
    }
    if remaining > 0 {
        let _ = writeln!(out, "  ...and {remaining} more");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    #[test]
    fn test_quote() {
        for v in ["/", "/var/cache/distfiles", "/dev/shm", "/run/lock"] {
            assert_eq!(shell_quote_path(Utf8Path::new(v)), v);
        }
        assert_eq!(
            shell_quote_path(Utf8Path::new("/mnt/my dir")),
            "'/mnt/my dir'"
        );
    }

    #[test]
    fn test_format_list() {
        let paths = ["/a", "/b", "/c d"].map(Utf8Path::new);
        assert_eq!(format_path_list(paths, 5), "  /a\n  /b\n  '/c d'\n");
        assert_eq!(format_path_list(paths, 1), "  /a\n  ...and 2 more\n");
        assert_eq!(format_path_list(std::iter::empty(), 3), "");
    }
}
