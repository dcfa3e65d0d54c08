//! Find the directory inside an extracted package that holds the install tree.
//!
//! Packages are built both with and without an extra wrapping folder, so each
//! directory is scored by the marker rules of the [`RuleTable`] and the best
//! one wins. Each rule counts once per directory, and a directory holding a
//! critical marker always beats one that does not: a bundled-library folder
//! full of `*.dll` files is never the install root.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::rules::{Role, RuleTable};

/// A directory must score strictly above this to be picked on merit.
pub const MIN_PAYLOAD_SCORE: i64 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadCandidate {
    pub path: PathBuf,
    pub score: i64,
    pub depth: usize,
    /// At least one immediate child matched a critical rule.
    pub critical: bool,
}

/// Marker score of `dir` and whether it holds a critical marker.
///
/// Only immediate children are looked at, and each matching rule adds its
/// weight once no matter how many children match it.
pub fn score_dir(dir: &Path, rules: &RuleTable) -> (i64, bool) {
    let Ok(rd) = fs::read_dir(dir) else {
        return (0, false);
    };
    let matched: BTreeMap<usize, Role> = rd
        .flatten()
        .filter_map(|ent| {
            let ft = ent.file_type().ok()?;
            let name = ent.file_name().to_string_lossy().into_owned();
            rules.marker_rule(&name, ft.is_dir())
        })
        .collect();
    let score = matched.values().map(|r| r.weight()).sum();
    let critical = matched.values().any(|r| *r == Role::Critical);
    (score, critical)
}

/// Score every directory under (and including) `root`.
pub fn candidates(root: &Path, rules: &RuleTable) -> Vec<PayloadCandidate> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_dir())
        .map(|e| {
            let (score, critical) = score_dir(e.path(), rules);
            PayloadCandidate {
                score,
                critical,
                depth: e.depth(),
                path: e.into_path(),
            }
        })
        .collect()
}

/// Pick the payload root under `root`.
///
/// Directories with a critical marker come first, then the highest score;
/// ties go to the shallowest path (then lexical order).
/// When nothing scores above [`MIN_PAYLOAD_SCORE`], fall back to a top-level
/// directory named after `product`, then the first top-level directory, then
/// `root` itself.
pub fn locate(root: &Path, rules: &RuleTable, product: &str) -> PathBuf {
    let best = candidates(root, rules)
        .into_iter()
        .filter(|c| c.score > MIN_PAYLOAD_SCORE)
        .min_by(|a, b| {
            b.critical
                .cmp(&a.critical)
                .then(b.score.cmp(&a.score))
                .then(a.depth.cmp(&b.depth))
                .then_with(|| a.path.cmp(&b.path))
        });
    if let Some(c) = best {
        debug!(path = %c.path.display(), score = c.score, "payload located by score");
        return c.path;
    }

    let mut subdirs: Vec<PathBuf> = fs::read_dir(root)
        .map(|rd| {
            rd.flatten()
                .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
                .map(|e| e.path())
                .collect()
        })
        .unwrap_or_default();
    subdirs.sort();

    let prefix = product.to_lowercase();
    if !prefix.is_empty()
        && let Some(d) = subdirs.iter().find(|d| {
            d.file_name()
                .map(|n| n.to_string_lossy().to_lowercase().starts_with(&prefix))
                .unwrap_or(false)
        })
    {
        debug!(path = %d.display(), "payload located by product prefix");
        return d.clone();
    }
    if let Some(d) = subdirs.into_iter().next() {
        debug!(path = %d.display(), "payload located as first subdirectory");
        return d;
    }
    root.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(p: &Path) {
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(p, b"x").unwrap();
    }

    #[test]
    fn finds_wrapped_payload() {
        let td = tempdir().unwrap();
        let root = td.path();
        touch(&root.join("App-2.8.0/app"));
        touch(&root.join("App-2.8.0/lib/libx.so"));
        touch(&root.join("App-2.8.0/README.md"));
        touch(&root.join("notes.txt"));

        let rules = RuleTable::for_product("app");
        assert_eq!(locate(root, &rules, "app"), root.join("App-2.8.0"));
    }

    #[test]
    fn finds_flat_payload_at_root() {
        let td = tempdir().unwrap();
        let root = td.path();
        touch(&root.join("app.exe"));
        touch(&root.join("_internal/python3.dll"));

        let rules = RuleTable::for_product("app");
        assert_eq!(locate(root, &rules, "app"), root);
    }

    #[test]
    fn ties_go_to_shallowest() {
        let td = tempdir().unwrap();
        let root = td.path();
        touch(&root.join("a/app"));
        touch(&root.join("a/nested/deeper/app"));

        let rules = RuleTable::for_product("app");
        assert_eq!(locate(root, &rules, "app"), root.join("a"));
    }

    #[test]
    fn falls_back_to_product_prefix_then_first_dir_then_root() {
        let rules = RuleTable::for_product("itemtool");

        let td = tempdir().unwrap();
        touch(&td.path().join("aaa/x.txt"));
        touch(&td.path().join("ItemTool_v2/y.txt"));
        assert_eq!(
            locate(td.path(), &rules, "itemtool"),
            td.path().join("ItemTool_v2")
        );

        let td = tempdir().unwrap();
        touch(&td.path().join("zzz/x.txt"));
        touch(&td.path().join("bbb/y.txt"));
        assert_eq!(locate(td.path(), &rules, "itemtool"), td.path().join("bbb"));

        let td = tempdir().unwrap();
        touch(&td.path().join("only.txt"));
        assert_eq!(locate(td.path(), &rules, "itemtool"), td.path());
    }

    #[test]
    fn candidates_include_root_with_depth_zero() {
        let td = tempdir().unwrap();
        touch(&td.path().join("sub/app"));
        let rules = RuleTable::for_product("app");
        let c = candidates(td.path(), &rules);
        let root = c.iter().find(|c| c.depth == 0).unwrap();
        assert_eq!((root.score, root.critical), (0, false));
        let sub = c.iter().find(|c| c.depth == 1).unwrap();
        assert_eq!((sub.score, sub.critical), (10, true));
    }

    #[test]
    fn bundled_library_dir_does_not_beat_executable_dir() {
        let td = tempdir().unwrap();
        let root = td.path();
        touch(&root.join("ItemTool/ItemTool.exe"));
        for dll in ["python311.dll", "vcruntime140.dll", "libssl-3.dll", "sqlite3.dll"] {
            touch(&root.join("ItemTool/_internal").join(dll));
        }
        touch(&root.join("ItemTool/_internal/base_library.zip"));

        let rules = RuleTable::for_product("ItemTool");
        assert_eq!(locate(root, &rules, "ItemTool"), root.join("ItemTool"));
    }

    #[test]
    fn many_supporting_files_count_once() {
        let td = tempdir().unwrap();
        let lib = td.path().join("libs");
        for so in ["a.so", "b.so", "c.so", "d.so", "LICENSE", "README.md"] {
            touch(&lib.join(so));
        }
        let rules = RuleTable::for_product("app");
        // *.so, LICENSE*, README*
        assert_eq!(score_dir(&lib, &rules), (15, false));
    }

    #[test]
    fn supporting_only_dirs_still_win_without_an_executable() {
        let td = tempdir().unwrap();
        let root = td.path();
        touch(&root.join("pkg/lib/x.so"));
        touch(&root.join("pkg/README.md"));
        touch(&root.join("pkg/lib/y.so"));

        let rules = RuleTable::for_product("app");
        // pkg: lib dir + README = 10; pkg/lib: *.so once = 5
        assert_eq!(locate(root, &rules, "app"), root.join("pkg"));
    }
}
