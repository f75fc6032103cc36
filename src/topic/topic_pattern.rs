use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};

use arcstr::{ArcStr, Substr};
use regex::{Regex, RegexBuilder};
use thiserror::Error;

use super::limits::SEGMENT_SEPARATOR;

/// Regex fragment for `*`: exactly one non-empty segment.
const STAR_EXPR: &str = r"[\w-]+";
/// Regex fragment for `#`: any sub-path, including the empty one.
const HASH_EXPR: &str = r"[\w.-]*";

/// One dot-separated segment of a binding pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicPatternItem {
	/// Literal segment, matched verbatim
	Str(Substr),
	/// `*` wildcard, matches exactly one segment
	Star,
	/// `#` wildcard, matches zero or more segments
	Hash,
}

/// Error types for topic pattern compilation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopicPatternError {
	/// Wildcard characters mixed with literal text inside one segment
	#[error(
		"Invalid wildcard usage in pattern '{pattern}': segment '{segment}' \
		 must be exactly '*' or '#'"
	)]
	WildcardUsage {
		/// Pattern that failed to compile
		pattern: String,
		/// Offending segment
		segment: String,
	},

	/// The translated expression was rejected by the regex engine
	#[error("Pattern '{pattern}' cannot be compiled: {reason}")]
	InvalidExpression {
		/// Pattern that failed to compile
		pattern: String,
		/// Message from the regex engine
		reason: String,
	},
}

impl TopicPatternError {
	/// Creates a new WildcardUsage error
	pub fn wildcard_usage(
		pattern: impl Into<String>,
		segment: impl Into<String>,
	) -> Self {
		Self::WildcardUsage {
			pattern: pattern.into(),
			segment: segment.into(),
		}
	}
}

impl TopicPatternItem {
	/// Returns the segment as it appears in the pattern
	pub fn as_str(&self) -> &str {
		match self {
			| TopicPatternItem::Str(s) => s,
			| TopicPatternItem::Star => "*",
			| TopicPatternItem::Hash => "#",
		}
	}

	/// Returns true for `*` and `#`
	pub fn is_wildcard(&self) -> bool {
		!matches!(self, TopicPatternItem::Str(_))
	}

	fn to_expression(&self) -> String {
		match self {
			| TopicPatternItem::Str(s) => regex::escape(s),
			| TopicPatternItem::Star => STAR_EXPR.to_string(),
			| TopicPatternItem::Hash => HASH_EXPR.to_string(),
		}
	}
}

impl Display for TopicPatternItem {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl TryFrom<Substr> for TopicPatternItem {
	type Error = Substr;

	fn try_from(segment: Substr) -> Result<Self, Self::Error> {
		match segment.as_str() {
			| "*" => Ok(TopicPatternItem::Star),
			| "#" => Ok(TopicPatternItem::Hash),
			| s if s.contains(['*', '#']) => Err(segment),
			| _ => Ok(TopicPatternItem::Str(segment)),
		}
	}
}

/// Joins segment expressions with escaped dots.
///
/// A `#` takes the separator next to it into its optional group, so it can
/// stand for zero segments: `msg.#` accepts `msg`, `#.yolo` accepts `yolo` and
/// `a.#.b` accepts `a.b`.
fn translate(segments: &[TopicPatternItem]) -> String {
	let mut body = String::new();
	// Nothing but `#` groups emitted so far, each ending in its own dot
	let mut at_start = true;
	for (index, segment) in segments.iter().enumerate() {
		let last = index + 1 == segments.len();
		match (segment, at_start) {
			| (TopicPatternItem::Hash, true) if last => body.push_str(HASH_EXPR),
			| (TopicPatternItem::Hash, true) => {
				body.push_str(&format!(r"(?:{HASH_EXPR}\.)?"))
			}
			| (TopicPatternItem::Hash, false) => {
				body.push_str(&format!(r"(?:\.{HASH_EXPR})?"))
			}
			| (item, true) => {
				body.push_str(&item.to_expression());
				at_start = false;
			}
			| (item, false) => {
				body.push_str(r"\.");
				body.push_str(&item.to_expression());
			}
		}
	}
	body
}

/// A binding pattern compiled into an anchored matcher.
///
/// The pattern is split on `.` and every segment is translated on its own. The
/// result is anchored at both ends so the whole routing key has to match,
/// never a substring of it.
#[derive(Debug, Clone)]
pub struct TopicPattern {
	pattern: ArcStr,
	segments: Vec<TopicPatternItem>,
	matcher: Regex,
	case_insensitive: bool,
}

impl TopicPattern {
	/// Compiles a case-sensitive pattern.
	pub fn compile(
		pattern: impl Into<ArcStr>,
	) -> Result<Self, TopicPatternError> {
		Self::compile_with(pattern, false)
	}

	/// Compiles a pattern, optionally ignoring ASCII/Unicode case when matching.
	pub fn compile_with(
		pattern: impl Into<ArcStr>,
		case_insensitive: bool,
	) -> Result<Self, TopicPatternError> {
		let pattern = pattern.into();
		let segments = pattern
			.split(SEGMENT_SEPARATOR)
			.map(|segment| {
				TopicPatternItem::try_from(pattern.substr_from(segment)).map_err(
					|bad| TopicPatternError::wildcard_usage(pattern.as_str(), bad.as_str()),
				)
			})
			.collect::<Result<Vec<_>, _>>()?;

		let body = translate(&segments);
		let matcher = RegexBuilder::new(&format!("^(?:{body})$"))
			.case_insensitive(case_insensitive)
			.build()
			.map_err(|e| TopicPatternError::InvalidExpression {
				pattern: pattern.to_string(),
				reason: e.to_string(),
			})?;

		Ok(Self {
			pattern,
			segments,
			matcher,
			case_insensitive,
		})
	}

	/// Tests a concrete routing key against the compiled pattern.
	pub fn matches(&self, routing_key: &str) -> bool {
		self.matcher.is_match(routing_key)
	}

	/// Returns the original pattern string
	pub fn as_str(&self) -> &str {
		&self.pattern
	}

	/// Returns the original pattern as a shared string
	pub fn pattern(&self) -> &ArcStr {
		&self.pattern
	}

	/// Returns the parsed segments
	pub fn segments(&self) -> &[TopicPatternItem] {
		&self.segments
	}

	/// Returns true if the pattern contains `*` or `#`
	pub fn has_wildcards(&self) -> bool {
		self.segments.iter().any(TopicPatternItem::is_wildcard)
	}

	/// Returns true if the matcher ignores case
	pub fn is_case_insensitive(&self) -> bool {
		self.case_insensitive
	}
}

impl PartialEq for TopicPattern {
	fn eq(&self, other: &Self) -> bool {
		self.pattern == other.pattern
			&& self.case_insensitive == other.case_insensitive
	}
}

impl Eq for TopicPattern {}

impl Hash for TopicPattern {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.pattern.hash(state);
		self.case_insensitive.hash(state);
	}
}

impl Display for TopicPattern {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.pattern)
	}
}

impl TryFrom<&str> for TopicPattern {
	type Error = TopicPatternError;

	fn try_from(pattern: &str) -> Result<Self, Self::Error> {
		Self::compile(ArcStr::from(pattern))
	}
}

impl TryFrom<String> for TopicPattern {
	type Error = TopicPatternError;

	fn try_from(pattern: String) -> Result<Self, Self::Error> {
		Self::compile(ArcStr::from(pattern))
	}
}
