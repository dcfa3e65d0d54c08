use std::cmp::Ordering;

/// Parse `"v2.7.1"` / `"2.7.1"` into its integer components.
fn parse_dotted(v: &str) -> Option<Vec<u64>> {
    let v = v.trim();
    let v = v.strip_prefix(['v', 'V']).unwrap_or(v);
    if v.is_empty() {
        return None;
    }
    v.split('.').map(|p| p.parse::<u64>().ok()).collect()
}

/// Compare two version strings.
///
/// Dotted-integer versions compare numerically with the shorter tuple padded
/// with zeros (`2.7` == `2.7.0`). If either side is not dotted-integer, the
/// raw strings are compared lexically.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (parse_dotted(a), parse_dotted(b)) {
        (Some(mut x), Some(mut y)) => {
            let len = x.len().max(y.len());
            x.resize(len, 0);
            y.resize(len, 0);
            x.cmp(&y)
        }
        _ => a.cmp(b),
    }
}

/// True only if `remote` is strictly greater than `local`.
pub fn is_newer(remote: &str, local: &str) -> bool {
    compare_versions(remote, local) == Ordering::Greater
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_not_lexical_ordering() {
        assert_eq!(compare_versions("2.7.1", "2.10.0"), Ordering::Less);
        assert_eq!(compare_versions("2.10.0", "2.9.9"), Ordering::Greater);
    }

    #[test]
    fn shorter_tuple_is_zero_padded() {
        assert_eq!(compare_versions("2.7", "2.7.0"), Ordering::Equal);
        assert_eq!(compare_versions("2.7", "2.7.0.1"), Ordering::Less);
        assert_eq!(compare_versions("3", "2.99.99"), Ordering::Greater);
    }

    #[test]
    fn leading_v_is_accepted() {
        assert_eq!(compare_versions("v2.8.0", "2.8"), Ordering::Equal);
    }

    #[test]
    fn non_numeric_falls_back_to_lexical() {
        assert_eq!(compare_versions("2.8.0-beta", "2.8.0"), Ordering::Greater);
        assert_eq!(compare_versions("abc", "abd"), Ordering::Less);
        assert_eq!(compare_versions("", "1.0"), Ordering::Less);
    }

    #[test]
    fn is_newer_is_strict() {
        assert!(is_newer("2.8.0", "2.7.1"));
        assert!(!is_newer("2.7.1", "2.7.1"));
        assert!(!is_newer("2.7.1", "2.8.0"));
    }

    #[test]
    fn agrees_with_padded_numeric_order() {
        let samples = ["0", "0.1", "1", "1.0.1", "1.2", "1.10", "2.7.1", "2.10", "10.0"];
        for a in samples {
            for b in samples {
                let pa = parse_dotted(a).unwrap();
                let pb = parse_dotted(b).unwrap();
                let len = pa.len().max(pb.len());
                let mut xa = pa.clone();
                let mut xb = pb.clone();
                xa.resize(len, 0);
                xb.resize(len, 0);
                assert_eq!(compare_versions(a, b), xa.cmp(&xb), "{} vs {}", a, b);
            }
        }
    }
}
