//! Path walking over the directory layer.

use crate::{
    config::{ROOT_DEV, ROOT_INODE},
    layout::InodeKind,
    vfs::{iget, Inode},
};

/// Split the next path element off `path`.
///
/// Consumes surrounding slashes, so `"///a//bb"` yields `("a", "bb")`.
/// Returns `None` when the input is empty or all slashes. Elements are
/// returned untruncated; the directory layer bounds comparisons at the
/// on-disk name length.
pub fn skip_elem(path: &str) -> Option<(&str, &str)> {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return None;
    }
    let (elem, rest) = match path.find('/') {
        Some(at) => path.split_at(at),
        None => (path, ""),
    };
    Some((elem, rest.trim_start_matches('/')))
}

/// Walk `path` element by element.
///
/// Absolute paths start at the root of [`ROOT_DEV`], relative ones at a
/// duplicate of `cwd`. Each step locks the current directory only long
/// enough to look the element up, then descends with the reference
/// released. With `want_parent` the walk stops one element short and
/// hands back the enclosing directory together with the final name.
fn namex<'p>(path: &'p str, cwd: &Inode, want_parent: bool) -> Option<(Inode, &'p str)> {
    let mut ip = if path.starts_with('/') {
        iget(ROOT_DEV, ROOT_INODE)
    } else {
        cwd.clone()
    };

    let mut rest = path;
    while let Some((elem, next)) = skip_elem(rest) {
        let guard = ip.lock();
        if guard.kind() != InodeKind::Directory {
            return None;
        }
        if want_parent && next.is_empty() {
            drop(guard);
            return Some((ip, elem));
        }
        let child = guard.dir_lookup(elem)?;
        drop(guard);
        ip = child;
        rest = next;
    }

    if want_parent {
        // the path named no element whose parent could be returned
        None
    } else {
        Some((ip, ""))
    }
}

/// Resolve `path` to an unlocked inode reference
pub fn namei(path: &str, cwd: &Inode) -> Option<Inode> {
    namex(path, cwd, false).map(|(ip, _)| ip)
}

/// Resolve `path` to its parent directory and the final path element
pub fn nameiparent<'p>(path: &'p str, cwd: &Inode) -> Option<(Inode, &'p str)> {
    namex(path, cwd, true)
}
