use regex::RegexBuilder;

use super::budget::TokenCounter;
use crate::store::types::{InsertionPosition, LorebookEntry};

/// Admitted lorebook entries grouped by insertion position, admission order
/// preserved within each group.
#[derive(Debug, Default, Clone)]
pub struct LorebookHits {
    pub before_system: Vec<LorebookEntry>,
    pub after_system: Vec<LorebookEntry>,
    pub before_history: Vec<LorebookEntry>,
}

impl LorebookHits {
    pub fn is_empty(&self) -> bool {
        self.before_system.is_empty()
            && self.after_system.is_empty()
            && self.before_history.is_empty()
    }

    pub fn len(&self) -> usize {
        self.before_system.len() + self.after_system.len() + self.before_history.len()
    }
}

/// Scan the recent-text window for keyword triggers and admit matches within
/// the token budget.
///
/// Candidates are ordered by descending priority, ties broken by ascending
/// entry id. An entry is admitted when its content fits the remaining budget
/// (and its own `token_budget` cap, when set); otherwise it is skipped and
/// the walk continues. A bad keyword pattern skips only that entry.
pub fn match_entries(
    entries: &[LorebookEntry],
    window: &str,
    budget: usize,
    counter: &dyn TokenCounter,
) -> LorebookHits {
    let mut candidates: Vec<&LorebookEntry> = entries
        .iter()
        .filter(|entry| entry.is_enabled && entry_matches(entry, window))
        .collect();
    candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

    let mut hits = LorebookHits::default();
    let mut remaining = budget;
    for entry in candidates {
        if remaining == 0 {
            break;
        }
        let cost = counter.count(&entry.content);
        if let Some(cap) = entry.token_budget {
            if cost as i64 > cap {
                continue;
            }
        }
        if cost > remaining {
            continue;
        }
        remaining -= cost;
        let bucket = match entry.insertion_position {
            InsertionPosition::BeforeSystem => &mut hits.before_system,
            InsertionPosition::AfterSystem => &mut hits.after_system,
            InsertionPosition::BeforeHistory => &mut hits.before_history,
        };
        bucket.push(entry.clone());
    }

    hits
}

fn entry_matches(entry: &LorebookEntry, window: &str) -> bool {
    entry
        .keywords
        .iter()
        .any(|keyword| keyword_matches(entry, keyword, window))
}

fn keyword_matches(entry: &LorebookEntry, keyword: &str, window: &str) -> bool {
    if keyword.is_empty() {
        return false;
    }

    if entry.match_whole_word {
        let pattern = format!(r"\b{}\b", regex::escape(keyword));
        match RegexBuilder::new(&pattern)
            .case_insensitive(!entry.case_sensitive)
            .build()
        {
            Ok(re) => re.is_match(window),
            Err(err) => {
                tracing::warn!(
                    "lorebook entry {} keyword {:?} failed to compile: {}",
                    entry.id,
                    keyword,
                    err
                );
                false
            }
        }
    } else if entry.case_sensitive {
        window.contains(keyword)
    } else {
        window.to_lowercase().contains(&keyword.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::budget::HeuristicCounter;

    fn entry(id: &str, priority: i64, keyword: &str, content_tokens: usize) -> LorebookEntry {
        LorebookEntry {
            id: id.to_string(),
            lorebook_id: "book".to_string(),
            name: id.to_string(),
            keywords: vec![keyword.to_string()],
            content: "x".repeat(content_tokens * 4),
            priority,
            is_enabled: true,
            case_sensitive: false,
            match_whole_word: false,
            insertion_position: InsertionPosition::AfterSystem,
            token_budget: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn higher_priority_wins_the_budget() {
        let a = entry("a", 90, "dragon", 300);
        let b = entry("b", 50, "dragon", 300);
        let hits = match_entries(
            &[b.clone(), a.clone()],
            "Tell me about the dragon",
            400,
            &HeuristicCounter,
        );
        assert_eq!(hits.len(), 1);
        assert_eq!(hits.after_system[0].id, "a");
    }

    #[test]
    fn skipped_entries_do_not_stop_the_walk() {
        let big = entry("a", 90, "dragon", 300);
        let small = entry("b", 50, "dragon", 50);
        let hits = match_entries(&[big, small], "the dragon sleeps", 100, &HeuristicCounter);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits.after_system[0].id, "b");
    }

    #[test]
    fn priority_ties_break_on_entry_id() {
        let first = entry("a", 50, "moon", 10);
        let second = entry("b", 50, "moon", 10);
        let hits = match_entries(
            &[second, first],
            "under the moon",
            100,
            &HeuristicCounter,
        );
        let ids: Vec<&str> = hits.after_system.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn whole_word_matching_respects_boundaries() {
        let mut e = entry("a", 50, "cat", 10);
        e.match_whole_word = true;
        assert!(entry_matches(&e, "a cat sat"));
        assert!(!entry_matches(&e, "concatenate"));
    }

    #[test]
    fn case_sensitivity_is_per_entry() {
        let mut e = entry("a", 50, "Moon", 10);
        e.case_sensitive = true;
        assert!(!entry_matches(&e, "the moon"));
        assert!(entry_matches(&e, "the Moon"));

        e.case_sensitive = false;
        assert!(entry_matches(&e, "the moon"));
    }

    #[test]
    fn per_entry_cap_excludes_oversized_content() {
        let mut e = entry("a", 90, "dragon", 100);
        e.token_budget = Some(50);
        let hits = match_entries(&[e], "dragon", 1000, &HeuristicCounter);
        assert!(hits.is_empty());
    }

    #[test]
    fn disabled_entries_never_match() {
        let mut e = entry("a", 90, "dragon", 10);
        e.is_enabled = false;
        let hits = match_entries(&[e], "dragon", 1000, &HeuristicCounter);
        assert!(hits.is_empty());
    }
}
