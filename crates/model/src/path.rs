//! The path grammar: cleaned POSIX-style paths relative to the commit root.
//! The empty path denotes the implicit root directory, which may be listed
//! but never written or inspected directly.

use crate::Error;

/// Validate a path for use as a read or write target.
/// The empty path (the root directory) is rejected here; operations which
/// accept the root validate with [`check_listable`] instead.
pub fn check(path: &str) -> Result<(), Error> {
    if path.is_empty() {
        return Err(Error::RootPath);
    }
    check_listable(path)
}

/// Validate a path where the empty root path is acceptable.
pub fn check_listable(path: &str) -> Result<(), Error> {
    if path.is_empty() {
        return Ok(());
    }
    if path.starts_with('/') {
        return Err(Error::InvalidPath {
            path: path.to_string(),
            reason: "must not begin with '/'",
        });
    }
    for component in path.split('/') {
        match component {
            "" => {
                return Err(Error::InvalidPath {
                    path: path.to_string(),
                    reason: "has an empty component",
                })
            }
            "." | ".." => {
                return Err(Error::InvalidPath {
                    path: path.to_string(),
                    reason: "has a '.' or '..' component",
                })
            }
            _ => (),
        }
    }
    Ok(())
}

/// Proper ancestors of `path`, nearest the root first, excluding the root
/// itself: `ancestors("a/b/c")` yields `"a"`, then `"a/b"`.
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.char_indices()
        .filter_map(move |(i, c)| if c == '/' { Some(&path[..i]) } else { None })
}

/// Determine if `path` is strictly beneath directory `dir`.
/// Every non-empty path is beneath the root (`""`).
pub fn is_under(dir: &str, path: &str) -> bool {
    if path.is_empty() || dir == path {
        false
    } else if dir.is_empty() {
        true
    } else {
        path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
    }
}

/// Determine if a delete of `del` covers `path`: either an exact match,
/// or `del` is an ancestor directory of `path`.
pub fn covers(del: &str, path: &str) -> bool {
    del == path || is_under(del, path)
}

/// The direct child of `dir` lying on the way to `path`, as a full path.
/// Returns None when `path` is not beneath `dir`.
pub fn direct_child<'p>(dir: &str, path: &'p str) -> Option<&'p str> {
    if !is_under(dir, path) {
        return None;
    }
    let tail = if dir.is_empty() {
        path
    } else {
        &path[dir.len() + 1..]
    };
    match tail.find('/') {
        Some(i) => Some(&path[..path.len() - tail.len() + i]),
        None => Some(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check() {
        assert!(check("foo").is_ok());
        assert!(check("dir/foo").is_ok());
        assert!(check("a/b/c-d_e.f").is_ok());

        assert!(matches!(check(""), Err(Error::RootPath)));
        assert!(check("/foo").is_err());
        assert!(check("foo//bar").is_err());
        assert!(check("foo/").is_err());
        assert!(check("./foo").is_err());
        assert!(check("foo/../bar").is_err());

        assert!(check_listable("").is_ok());
        assert!(check_listable("/x").is_err());
    }

    #[test]
    fn test_ancestors() {
        assert_eq!(ancestors("a").collect::<Vec<_>>(), Vec::<&str>::new());
        assert_eq!(ancestors("a/b/c").collect::<Vec<_>>(), vec!["a", "a/b"]);
    }

    #[test]
    fn test_is_under_and_covers() {
        assert!(is_under("", "a"));
        assert!(is_under("a", "a/b"));
        assert!(is_under("a", "a/b/c"));
        assert!(!is_under("a", "a"));
        assert!(!is_under("a", "ab"));
        assert!(!is_under("a/b", "a"));
        assert!(!is_under("", ""));

        assert!(covers("a", "a"));
        assert!(covers("a", "a/b"));
        assert!(!covers("a", "ab/c"));
    }

    #[test]
    fn test_direct_child() {
        assert_eq!(direct_child("", "a"), Some("a"));
        assert_eq!(direct_child("", "a/b/c"), Some("a"));
        assert_eq!(direct_child("a", "a/b/c"), Some("a/b"));
        assert_eq!(direct_child("a/b", "a/b/c"), Some("a/b/c"));
        assert_eq!(direct_child("a", "b/c"), None);
        assert_eq!(direct_child("a", "a"), None);
    }
}
