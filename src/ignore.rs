//! Ordered glob-based ignore matcher (C2, spec.md §4.2).
//!
//! Deliberately not `ignore`/`.gitignore` semantics: rules are evaluated
//! top-to-bottom and the *last* matching rule wins, rather than globset's
//! usual independent-highest-priority-glob resolution. `.gitignore` and
//! `.git/info/exclude` are never consulted implicitly.

use globset::{GlobBuilder, GlobMatcher};

use crate::error::ConfigError;

/// Patterns prepended when a project's `ignoreDefaults` is true (spec.md §4.2).
const DEFAULT_PATTERNS: &[&str] = &[".git/", "runtime/**"];

struct Rule {
	negate: bool,
	/// Matches the path itself, or the directory it names (for `dir_only` rules).
	matcher: GlobMatcher,
	/// Set for trailing-`/` patterns: also matches every descendant path.
	descendants: Option<GlobMatcher>,
}

impl Rule {
	fn matches(&self, path: &str, is_dir: bool) -> bool {
		if self.matcher.is_match(path) && (self.descendants.is_none() || is_dir) {
			return true;
		}
		if let Some(descendants) = &self.descendants {
			if descendants.is_match(path) {
				return true;
			}
		}
		false
	}
}

/// An ordered set of ignore rules, evaluated last-match-wins against a
/// POSIX-slash relative path.
pub struct IgnoreMatcher {
	rules: Vec<Rule>,
}

impl IgnoreMatcher {
	/// Builds a matcher from a project's `ignoreDefaults`, inline
	/// `ignorePatterns`, and the (already-read) contents of its
	/// `ignoreFile`, in that declaration order.
	pub fn new(ignore_defaults: bool, inline_patterns: &[String], ignore_file_contents: Option<&str>) -> Self {
		let mut lines: Vec<String> = Vec::new();
		if ignore_defaults {
			lines.extend(DEFAULT_PATTERNS.iter().map(|s| s.to_string()));
		}
		lines.extend(inline_patterns.iter().cloned());
		if let Some(contents) = ignore_file_contents {
			lines.extend(contents.lines().map(|l| l.to_string()));
		}

		let rules = lines.iter().filter_map(|line| parse_rule(line).ok().flatten()).collect();
		IgnoreMatcher { rules }
	}

	/// Same rule parsing as [`Self::new`], but returns parse errors instead
	/// of silently dropping malformed patterns — used when validating
	/// operator-supplied configuration up front.
	pub fn try_new(
		ignore_defaults: bool,
		inline_patterns: &[String],
		ignore_file_contents: Option<&str>,
	) -> Result<Self, ConfigError> {
		let mut lines: Vec<String> = Vec::new();
		if ignore_defaults {
			lines.extend(DEFAULT_PATTERNS.iter().map(|s| s.to_string()));
		}
		lines.extend(inline_patterns.iter().cloned());
		if let Some(contents) = ignore_file_contents {
			lines.extend(contents.lines().map(|l| l.to_string()));
		}

		let mut rules = Vec::with_capacity(lines.len());
		for line in &lines {
			if let Some(rule) = parse_rule(line)? {
				rules.push(rule);
			}
		}
		Ok(IgnoreMatcher { rules })
	}

	/// Builds a per-node matcher: `base`'s rules, then `exclude` patterns
	/// (as ignore rules), then `include` patterns (as negations) — the
	/// per-node `include`/`exclude` in spec.md §3 is evaluated last and
	/// can re-include a path the project-level rules dropped.
	pub fn for_node(base: &IgnoreMatcher, include: &[String], exclude: &[String]) -> Self {
		let mut rules = Vec::new();
		rules.extend(base.rules.iter().map(Rule::clone_into));
		for pattern in exclude {
			if let Ok(Some(rule)) = parse_rule(pattern) {
				rules.push(rule);
			}
		}
		for pattern in include {
			let negated = if pattern.starts_with('!') { pattern.clone() } else { format!("!{}", pattern) };
			if let Ok(Some(rule)) = parse_rule(&negated) {
				rules.push(rule);
			}
		}
		IgnoreMatcher { rules }
	}

	/// Whether `path` (POSIX-slash, relative to the project root) should
	/// be excluded from sync. `is_dir` distinguishes directory entries so
	/// that trailing-`/` rules only fire on their own directory entry (and
	/// always fire on descendants).
	pub fn is_ignored(&self, path: &str, is_dir: bool) -> bool {
		let mut ignored = false;
		for rule in &self.rules {
			if rule.matches(path, is_dir) {
				ignored = !rule.negate;
			}
		}
		ignored
	}
}

impl Rule {
	fn clone_into(&self) -> Rule {
		Rule { negate: self.negate, matcher: self.matcher.clone(), descendants: self.descendants.clone() }
	}
}

/// Parses one line of ignore-file/pattern-list syntax into a `Rule`,
/// returning `Ok(None)` for comments and blank lines.
fn parse_rule(line: &str) -> Result<Option<Rule>, ConfigError> {
	let trimmed = line.trim();
	if trimmed.is_empty() || trimmed.starts_with('#') {
		return Ok(None);
	}

	let (negate, rest) = match trimmed.strip_prefix('!') {
		Some(rest) => (true, rest),
		None => (false, trimmed),
	};

	let (dir_only, rest) = match rest.strip_suffix('/') {
		Some(rest) => (true, rest),
		None => (false, rest),
	};

	let anchored_pattern = if let Some(rest) = rest.strip_prefix('/') {
		rest.to_string()
	} else if rest.contains('/') {
		rest.to_string()
	} else {
		format!("**/{}", rest)
	};

	let matcher = compile(&anchored_pattern, trimmed)?;
	let descendants = if dir_only {
		let descendants_pattern = format!("{}/**", anchored_pattern.trim_end_matches('/'));
		Some(compile(&descendants_pattern, trimmed)?)
	} else {
		None
	};

	Ok(Some(Rule { negate, matcher, descendants }))
}

fn compile(pattern: &str, original: &str) -> Result<GlobMatcher, ConfigError> {
	GlobBuilder::new(pattern)
		.literal_separator(true)
		.build()
		.map(|g| g.compile_matcher())
		.map_err(|e| ConfigError::InvalidPattern { pattern: original.to_string(), message: e.to_string() })
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_patterns_ignore_git_and_runtime() {
		let matcher = IgnoreMatcher::new(true, &[], None);
		assert!(matcher.is_ignored(".git", true));
		assert!(matcher.is_ignored(".git/HEAD", false));
		assert!(matcher.is_ignored("runtime/cache/x", false));
		assert!(!matcher.is_ignored("src/main.rs", false));
	}

	#[test]
	fn no_slash_pattern_matches_at_any_depth() {
		let matcher = IgnoreMatcher::new(false, &["*.log".to_string()], None);
		assert!(matcher.is_ignored("app.log", false));
		assert!(matcher.is_ignored("logs/app.log", false));
	}

	#[test]
	fn leading_slash_anchors_to_root_only() {
		let matcher = IgnoreMatcher::new(false, &["/build".to_string()], None);
		assert!(matcher.is_ignored("build", true));
		assert!(!matcher.is_ignored("pkg/build", true));
	}

	#[test]
	fn trailing_slash_matches_directory_and_descendants() {
		let matcher = IgnoreMatcher::new(false, &["node_modules/".to_string()], None);
		assert!(matcher.is_ignored("node_modules", true));
		assert!(matcher.is_ignored("node_modules/leftpad/index.js", false));
		assert!(!matcher.is_ignored("node_modules_readme.md", false));
	}

	#[test]
	fn last_matching_rule_wins() {
		let matcher = IgnoreMatcher::new(
			false,
			&["*.log".to_string(), "!keep.log".to_string()],
			None,
		);
		assert!(matcher.is_ignored("debug.log", false));
		assert!(!matcher.is_ignored("keep.log", false));
	}

	#[test]
	fn comments_and_blank_lines_are_ignored() {
		let matcher = IgnoreMatcher::new(false, &[], Some("# comment\n\n*.tmp\n"));
		assert!(matcher.is_ignored("a.tmp", false));
	}

	#[test]
	fn node_level_include_can_re_include_after_project_exclude() {
		let base = IgnoreMatcher::new(false, &["*.log".to_string()], None);
		let node = IgnoreMatcher::for_node(&base, &["keep.log".to_string()], &[]);
		assert!(!node.is_ignored("keep.log", false));
		assert!(node.is_ignored("other.log", false));
	}

	#[test]
	fn node_level_exclude_applies_after_project_rules() {
		let base = IgnoreMatcher::new(false, &[], None);
		let node = IgnoreMatcher::for_node(&base, &[], &["secrets/".to_string()]);
		assert!(node.is_ignored("secrets", true));
		assert!(node.is_ignored("secrets/key.pem", false));
	}

	#[test]
	fn try_new_reports_an_invalid_pattern() {
		let err = IgnoreMatcher::try_new(false, &["[".to_string()], None).unwrap_err();
		assert!(matches!(err, ConfigError::InvalidPattern { .. }));
	}
}

// vim: ts=4
