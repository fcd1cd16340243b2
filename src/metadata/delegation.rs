use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::metadata::key::KeyId;
use crate::metadata::role::Role;

/// A `/`-delimited glob pattern over target filenames: `*` matches any run
/// of non-`/` characters, `**` matches any number of path segments.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct PathPattern(pub String);

impl PathPattern {
    pub fn matches(&self, filename: &str) -> bool {
        let pattern_segments: Vec<&str> = self.0.split('/').collect();
        let name_segments: Vec<&str> = filename.split('/').collect();
        segments_match(&pattern_segments, &name_segments)
    }
}

fn segments_match(pattern: &[&str], name: &[&str]) -> bool {
    match pattern.first() {
        None => name.is_empty(),
        Some(&"**") => {
            if pattern.len() == 1 {
                return true;
            }
            (0..=name.len()).any(|i| segments_match(&pattern[1..], &name[i..]))
        }
        Some(seg) => match name.first() {
            Some(name_seg) if glob_segment_matches(seg, name_seg) => segments_match(&pattern[1..], &name[1..]),
            _ => false,
        },
    }
}

fn glob_segment_matches(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == name,
        Some((prefix, suffix)) => {
            name.starts_with(prefix) && name[prefix.len()..].ends_with(suffix) && name.len() >= prefix.len() + suffix.len()
        }
    }
}

/// A subordinate Targets role declared by a parent Targets document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DelegationDef {
    pub name: String,
    pub parent: Role,
    pub key_ids: HashSet<KeyId>,
    pub threshold: u32,
    pub paths: Vec<PathPattern>,
    pub terminating: bool,
}

impl DelegationDef {
    pub fn matches_filename(&self, filename: &str) -> bool {
        self.paths.iter().any(|p| p.matches(filename))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_within_one_segment() {
        let p = PathPattern("director/*.bin".into());
        assert!(p.matches("director/firmware.bin"));
        assert!(!p.matches("director/sub/firmware.bin"));
    }

    #[test]
    fn double_star_matches_across_segments() {
        let p = PathPattern("**/firmware.bin".into());
        assert!(p.matches("firmware.bin"));
        assert!(p.matches("director/sub/firmware.bin"));
    }

    #[test]
    fn exact_segment_requires_exact_match() {
        let p = PathPattern("images/firmware.bin".into());
        assert!(p.matches("images/firmware.bin"));
        assert!(!p.matches("images/other.bin"));
    }
}
