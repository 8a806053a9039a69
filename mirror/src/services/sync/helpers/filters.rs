use regex::{Regex, RegexBuilder};

use crate::error::MirrorError;

/// Allow/deny selection of mailbox names.
///
/// Patterns are globs matched against the full mailbox name, case-insensitive:
/// `*` matches any run of characters (including the hierarchy delimiter) and
/// `?` exactly one. The allow-list is applied first, an empty one allows
/// everything; the deny-list then removes from what is left.
#[derive(Debug, Clone, Default)]
pub struct MailboxFilter {
    only: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl MailboxFilter {
    pub fn new(only: &[String], exclude: &[String]) -> Result<Self, MirrorError> {
        Ok(Self {
            only: compile_all(only)?,
            exclude: compile_all(exclude)?,
        })
    }

    pub fn allows(&self, name: &str) -> bool {
        let allowed = self.only.is_empty() || self.only.iter().any(|re| re.is_match(name));
        allowed && !self.exclude.iter().any(|re| re.is_match(name))
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>, MirrorError> {
    patterns.iter().map(|p| glob_to_regex(p)).collect()
}

pub fn glob_to_regex(pattern: &str) -> Result<Regex, MirrorError> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    for c in pattern.chars() {
        match c {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            other => source.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    source.push('$');

    RegexBuilder::new(&source)
        .case_insensitive(true)
        .build()
        .map_err(|e| MirrorError::Config(format!("Invalid mailbox pattern {:?}: {}", pattern, e)))
}
