use std::cmp::Ordering;

/// Normalize a VFS path: rooted at `/`, no duplicate or trailing
/// separators.
pub fn normalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    out.push('/');
    for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
        if !out.ends_with('/') {
            out.push('/');
        }
        out.push_str(component);
    }
    out
}

/// Split a normalized path into `(parent, name)`. The root's parent is the
/// root itself with an empty name.
pub fn split(path: &str) -> (&str, &str) {
    if path == "/" {
        return ("/", "");
    }
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("/", path),
    }
}

/// Join a parent path and a name back into a full path.
pub fn join(parent: &str, name: &str) -> String {
    if name.is_empty() {
        return parent.to_string();
    }
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Compare two paths component by component, so sibling entries sort next
/// to each other regardless of directory depth.
pub fn path_cmp(a: &String, b: &String) -> Ordering {
    let mut left = a.split('/').filter(|c| !c.is_empty());
    let mut right = b.split('/').filter(|c| !c.is_empty());
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) => match l.cmp(r) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}
