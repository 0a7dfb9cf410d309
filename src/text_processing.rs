use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::{ProjectCandidate, StudentProfile};

/// Default cap on normalized text, roughly 512 model tokens.
pub const DEFAULT_MAX_TEXT_CHARS: usize = 2048;

// Control characters other than the whitespace ones, which are collapsed instead.
static CONTROL_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F\x7F]").unwrap());

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\p{L}\p{N}+#.]+").unwrap());

/// Normalize text before hashing and embedding: strip control characters,
/// collapse whitespace, trim, lowercase and truncate to `max_chars`.
///
/// Two inputs that differ only in these respects share a cache key.
pub fn normalize_text(input: &str, max_chars: usize) -> String {
    let stripped = CONTROL_CHARS.replace_all(input, "");
    let collapsed = WHITESPACE.replace_all(&stripped, " ");
    let lowered = collapsed.trim().to_lowercase();

    if lowered.chars().count() <= max_chars {
        return lowered;
    }
    lowered.chars().take(max_chars).collect::<String>().trim_end().to_string()
}

fn join_non_empty(items: &[String]) -> String {
    items
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Text used to embed a student profile.
pub fn profile_text(profile: &StudentProfile) -> String {
    let mut parts = Vec::new();

    let skills = join_non_empty(&profile.skills);
    if !skills.is_empty() {
        parts.push(format!("Skills: {}.", skills));
    }
    let interests = join_non_empty(&profile.interests);
    if !interests.is_empty() {
        parts.push(format!("Interests: {}.", interests));
    }
    let specializations = join_non_empty(&profile.preferred_specializations);
    if !specializations.is_empty() {
        parts.push(format!("Preferred specializations: {}.", specializations));
    }

    parts.join(" ")
}

/// Text used to embed a project candidate.
pub fn project_text(project: &ProjectCandidate) -> String {
    let mut parts = vec![format!("{}.", project.title.trim())];

    if !project.abstract_text.trim().is_empty() {
        parts.push(project.abstract_text.trim().to_string());
    }
    parts.push(format!("Specialization: {}.", project.specialization.trim()));

    let tags = join_non_empty(&project.tags);
    if !tags.is_empty() {
        parts.push(format!("Tags: {}.", tags));
    }
    let stack = join_non_empty(&project.technology_stack);
    if !stack.is_empty() {
        parts.push(format!("Technologies: {}.", stack));
    }

    parts.join(" ")
}

fn project_vocabulary(project: &ProjectCandidate) -> Vec<String> {
    let mut vocabulary: Vec<String> = project
        .tags
        .iter()
        .chain(project.technology_stack.iter())
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();

    let prose = format!("{} {}", project.title, project.abstract_text).to_lowercase();
    vocabulary.extend(WORD.find_iter(&prose).map(|m| m.as_str().trim_matches('.').to_string()));
    vocabulary
}

/// Profile terms that also appear in the project's tags, technologies, title
/// or abstract. Comparison is case-insensitive; output keeps the profile's
/// spelling and order without duplicates.
pub fn shared_terms(terms: &[String], project: &ProjectCandidate) -> Vec<String> {
    let vocabulary = project_vocabulary(project);
    let prose = format!(" {} {} ", project.title, project.abstract_text).to_lowercase();
    let mut shared: Vec<String> = Vec::new();

    for term in terms {
        let needle = term.trim().to_lowercase();
        if needle.is_empty() {
            continue;
        }
        // Multi-word terms match as phrases inside the prose.
        let found = vocabulary.iter().any(|v| v == &needle)
            || (needle.contains(' ') && prose.contains(&needle));
        if found && !shared.iter().any(|s| s.eq_ignore_ascii_case(term.trim())) {
            shared.push(term.trim().to_string());
        }
    }

    shared
}
