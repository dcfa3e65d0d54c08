//! Declarative file rules shared by the payload locator and the replacement engine.
//!
//! Every "is this a critical file" or "is this user data" question is answered
//! by one [`RuleTable`], so scoring and protection can be audited in one place.

use regex::Regex;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// How the replacement engine treats one payload file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    UserData,
    Replaceable,
    RunningExecutable,
}

/// What a matching rule means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// User data: never overwritten, backed up before an update.
    Protected,
    /// Strong evidence that a directory is the payload root.
    Critical,
    /// Weak evidence that a directory is the payload root.
    Supporting,
}

impl Role {
    pub fn weight(self) -> i64 {
        match self {
            Role::Critical => 10,
            Role::Supporting => 5,
            Role::Protected => 0,
        }
    }
}

/// Which part of an entry a rule pattern is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    /// The file name of a regular file.
    FileName,
    /// The `/`-joined path of a file relative to the payload root.
    RelPath,
    /// The name of a directory.
    DirName,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub pattern: String,
    pub subject: Subject,
    pub role: Role,
    re: Regex,
}

impl Rule {
    pub fn new(pattern: &str, subject: Subject, role: Role) -> Self {
        Rule {
            pattern: pattern.to_string(),
            subject,
            role,
            re: glob_to_regex(pattern),
        }
    }

    fn matches(&self, s: &str) -> bool {
        self.re.is_match(s)
    }
}

#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: Vec<Rule>,
}

const PROTECTED_FILES: &[&str] = &[
    "item_manage.xlsm",
    "*_user_*",
    "*.backup",
    "user_settings.json",
    "config.ini",
];

const SUPPORTING_FILES: &[&str] = &["*.dll", "*.so", "*.dylib", "LICENSE*", "README*"];

const SUPPORTING_DIRS: &[&str] = &["_internal", "lib", "resources", "assets", "plugins"];

impl RuleTable {
    /// The default table for a product whose executable is named `product`.
    pub fn for_product(product: &str) -> Self {
        let mut rules = Vec::new();
        for p in PROTECTED_FILES {
            rules.push(Rule::new(p, Subject::FileName, Role::Protected));
        }
        // spreadsheets kept next to the bundled C# tool belong to the user
        rules.push(Rule::new("*C#/*.xlsm", Subject::RelPath, Role::Protected));

        rules.push(Rule::new(product, Subject::FileName, Role::Critical));
        rules.push(Rule::new(
            &format!("{}.exe", product),
            Subject::FileName,
            Role::Critical,
        ));
        for p in SUPPORTING_FILES {
            rules.push(Rule::new(p, Subject::FileName, Role::Supporting));
        }
        for p in SUPPORTING_DIRS {
            rules.push(Rule::new(p, Subject::DirName, Role::Supporting));
        }
        RuleTable { rules }
    }

    pub fn with_protected(self, patterns: &[String]) -> Self {
        self.with(patterns, Subject::FileName, Role::Protected)
    }

    pub fn with_critical(self, patterns: &[String]) -> Self {
        self.with(patterns, Subject::FileName, Role::Critical)
    }

    pub fn with_supporting(self, patterns: &[String]) -> Self {
        self.with(patterns, Subject::FileName, Role::Supporting)
    }

    fn with(mut self, patterns: &[String], subject: Subject, role: Role) -> Self {
        for p in patterns.iter().filter(|p| !p.trim().is_empty()) {
            self.rules.push(Rule::new(p.trim(), subject, role));
        }
        self
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// True if the file at `rel` (relative to a payload or install root) is user data.
    pub fn is_protected(&self, rel: &Path) -> bool {
        let name = rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let joined = slash_path(rel);
        self.rules
            .iter()
            .filter(|r| r.role == Role::Protected)
            .any(|r| match r.subject {
                Subject::FileName => r.matches(&name),
                Subject::RelPath => r.matches(&joined),
                Subject::DirName => false,
            })
    }

    /// Classify one payload file whose install-dir destination is `dest`.
    pub fn classify(&self, rel: &Path, dest: &Path, running_exe: &Path) -> Classification {
        if same_path(dest, running_exe) {
            Classification::RunningExecutable
        } else if self.is_protected(rel) {
            Classification::UserData
        } else {
            Classification::Replaceable
        }
    }

    /// Score contribution of one directory entry when locating the payload.
    ///
    /// The heaviest matching marker rule counts; protected rules never score.
    pub fn marker_weight(&self, name: &str, is_dir: bool) -> i64 {
        self.marker_rule(name, is_dir)
            .map(|(_, role)| role.weight())
            .unwrap_or(0)
    }

    /// Index and role of the heaviest marker rule matching one entry.
    pub fn marker_rule(&self, name: &str, is_dir: bool) -> Option<(usize, Role)> {
        self.rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.role != Role::Protected)
            .filter(|(_, r)| match r.subject {
                Subject::FileName => !is_dir,
                Subject::DirName => is_dir,
                Subject::RelPath => false,
            })
            .filter(|(_, r)| r.matches(name))
            .max_by_key(|(_, r)| r.role.weight())
            .map(|(i, r)| (i, r.role))
    }
}

/// Convert a minimal glob pattern into a case-insensitive, anchored regex.
/// Supported:
/// - `*` → any run of characters
/// - `?` → any single character
///
/// Everything else matches literally.
fn glob_to_regex(pat: &str) -> Regex {
    let mut s = String::from("(?i)^");
    for ch in pat.chars() {
        match ch {
            '*' => s.push_str(".*"),
            '?' => s.push('.'),
            c => s.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4]))),
        }
    }
    s.push('$');
    // every literal is escaped, so the pattern is always valid
    Regex::new(&s).expect("escaped glob is a valid regex")
}

fn slash_path(p: &Path) -> String {
    p.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Compare two paths after resolving their parent directories.
///
/// The file itself need not exist; only the parent is canonicalized.
pub fn same_path(a: &Path, b: &Path) -> bool {
    let (a, b) = (resolve_parent(a), resolve_parent(b));
    if cfg!(windows) {
        a.to_string_lossy().to_lowercase() == b.to_string_lossy().to_lowercase()
    } else {
        a == b
    }
}

fn resolve_parent(p: &Path) -> PathBuf {
    match (p.parent(), p.file_name()) {
        (Some(parent), Some(name)) => fs::canonicalize(parent)
            .map(|c| c.join(name))
            .unwrap_or_else(|_| p.to_path_buf()),
        _ => p.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_protected_patterns_match_user_data() {
        let t = RuleTable::for_product("ItemTool");
        assert!(t.is_protected(Path::new("item_manage.xlsm")));
        assert!(t.is_protected(Path::new("ITEM_MANAGE.XLSM")));
        assert!(t.is_protected(Path::new("data/report_user_2024.csv")));
        assert!(t.is_protected(Path::new("old.backup")));
        assert!(t.is_protected(Path::new("tools/C#/sheet.xlsm")));
        assert!(!t.is_protected(Path::new("tools/C#/sheet.dll")));
        assert!(!t.is_protected(Path::new("ItemTool.exe")));
    }

    #[test]
    fn extra_protected_patterns_are_appended() {
        let t = RuleTable::for_product("x").with_protected(&["*.sqlite".to_string()]);
        assert!(t.is_protected(Path::new("db/local.sqlite")));
    }

    #[test]
    fn glob_escapes_regex_metacharacters() {
        let t = RuleTable::for_product("my+tool (beta)");
        assert_eq!(t.marker_weight("my+tool (beta).exe", false), 10);
        assert_eq!(t.marker_weight("myytool (beta).exe", false), 0);
    }

    #[test]
    fn marker_weight_distinguishes_files_and_dirs() {
        let t = RuleTable::for_product("app");
        assert_eq!(t.marker_weight("app", false), 10);
        assert_eq!(t.marker_weight("libfoo.so", false), 5);
        assert_eq!(t.marker_weight("lib", true), 5);
        assert_eq!(t.marker_weight("lib", false), 0);
        assert_eq!(t.marker_weight("config.ini", false), 0);
    }

    #[test]
    fn classify_prefers_running_executable() {
        let td = tempdir().unwrap();
        let exe = td.path().join("app");
        let t = RuleTable::for_product("app");
        assert_eq!(
            t.classify(Path::new("app"), &td.path().join("app"), &exe),
            Classification::RunningExecutable
        );
        assert_eq!(
            t.classify(Path::new("config.ini"), &td.path().join("config.ini"), &exe),
            Classification::UserData
        );
        assert_eq!(
            t.classify(Path::new("readme.txt"), &td.path().join("readme.txt"), &exe),
            Classification::Replaceable
        );
    }

    #[cfg(unix)]
    #[test]
    fn same_path_sees_through_symlinked_parent() {
        let td = tempdir().unwrap();
        let real = td.path().join("real");
        fs::create_dir_all(&real).unwrap();
        std::os::unix::fs::symlink(&real, td.path().join("link")).unwrap();
        assert!(same_path(&real.join("app"), &td.path().join("link").join("app")));
    }
}
