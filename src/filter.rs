//! Content filter.
//!
//! Removes notes the viewer has muted, opted out of (NSFW), or that trip a
//! simple spam heuristic. Filter failure is the one error path that fails
//! closed: callers that hit an unexpected error here should surface
//! `PipelineError::Internal` rather than silently serving unfiltered content.

use crate::model::{Note, ViewerProfile};

const SPAM_HASHTAG_THRESHOLD: usize = 10;
const SPAM_PUNCTUATION_RUN: usize = 4;

pub struct ContentFilter;

impl ContentFilter {
    pub fn new() -> Self {
        Self
    }

    /// Applies every removal rule. Pure and infallible: a real deployment's
    /// failure mode (e.g. preference store unreachable) is modeled at the
    /// call site by treating a missing `ViewerProfile` as a filter failure
    /// that fails closed.
    pub fn filter(&self, notes: Vec<Note>, profile: &ViewerProfile) -> Vec<Note> {
        notes
            .into_iter()
            .filter(|note| !self.should_remove(note, profile))
            .collect()
    }

    fn should_remove(&self, note: &Note, profile: &ViewerProfile) -> bool {
        if profile.muted_users.contains(&note.author_id) {
            return true;
        }
        if note.author_suspended {
            return true;
        }
        if note.nsfw && !profile.nsfw_opt_in {
            return true;
        }
        if self.matches_muted_keyword(&note.text_content, profile) {
            return true;
        }
        if self.is_spam(note) {
            return true;
        }
        false
    }

    fn matches_muted_keyword(&self, text: &str, profile: &ViewerProfile) -> bool {
        if profile.muted_keywords.is_empty() {
            return false;
        }
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect();
        profile
            .muted_keywords
            .iter()
            .any(|kw| tokens.contains(&kw.to_lowercase()))
    }

    /// A simple spam signature: repeated punctuation runs or hashtag spam.
    fn is_spam(&self, note: &Note) -> bool {
        if note.hashtags.len() > SPAM_HASHTAG_THRESHOLD {
            return true;
        }
        let mut run = 0usize;
        let mut last: Option<char> = None;
        for c in note.text_content.chars() {
            let is_punct = matches!(c, '!' | '?' | '.');
            if is_punct && last == Some(c) {
                run += 1;
                if run >= SPAM_PUNCTUATION_RUN {
                    return true;
                }
            } else if is_punct {
                run = 1;
            } else {
                run = 0;
            }
            last = Some(c);
        }
        false
    }
}

impl Default for ContentFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn note(id: &str, author: &str) -> Note {
        Note {
            note_id: id.to_string(),
            author_id: author.to_string(),
            text_content: "just a normal note".to_string(),
            created_at: Utc::now(),
            has_media: false,
            hashtags: vec![],
            mentions: vec![],
            views: 0,
            likes: 0,
            reshares: 0,
            replies: 0,
            quotes: 0,
            nsfw: false,
            author_suspended: false,
        }
    }

    fn profile() -> ViewerProfile {
        ViewerProfile::defaulted("viewer", Utc::now())
    }

    #[test]
    fn removes_muted_author() {
        let mut p = profile();
        p.muted_users.insert("bad-author".to_string());
        let notes = vec![note("n1", "bad-author"), note("n2", "good-author")];
        let out = ContentFilter::new().filter(notes, &p);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].note_id, "n2");
    }

    #[test]
    fn removes_suspended_author() {
        let mut n = note("n1", "a");
        n.author_suspended = true;
        let out = ContentFilter::new().filter(vec![n], &profile());
        assert!(out.is_empty());
    }

    #[test]
    fn removes_nsfw_unless_opted_in() {
        let mut n = note("n1", "a");
        n.nsfw = true;
        let out = ContentFilter::new().filter(vec![n.clone()], &profile());
        assert!(out.is_empty());

        let mut p = profile();
        p.nsfw_opt_in = true;
        let out = ContentFilter::new().filter(vec![n], &p);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn removes_muted_keyword_whole_word() {
        let mut p = profile();
        p.muted_keywords.insert("crypto".to_string());
        let mut n = note("n1", "a");
        n.text_content = "check out this crypto deal".to_string();
        let out = ContentFilter::new().filter(vec![n], &p);
        assert!(out.is_empty());
    }

    #[test]
    fn keyword_match_is_whole_word_not_substring() {
        let mut p = profile();
        p.muted_keywords.insert("cat".to_string());
        let mut n = note("n1", "a");
        n.text_content = "category theory is fun".to_string();
        let out = ContentFilter::new().filter(vec![n], &p);
        assert_eq!(out.len(), 1, "substring 'cat' inside 'category' must not match");
    }

    #[test]
    fn removes_hashtag_spam() {
        let mut n = note("n1", "a");
        n.hashtags = (0..15).map(|i| format!("tag{i}")).collect();
        let out = ContentFilter::new().filter(vec![n], &profile());
        assert!(out.is_empty());
    }

    #[test]
    fn removes_repeated_punctuation_spam() {
        let mut n = note("n1", "a");
        n.text_content = "buy now!!!! limited offer".to_string();
        let out = ContentFilter::new().filter(vec![n], &profile());
        assert!(out.is_empty());
    }

    #[test]
    fn muted_users_is_superset_of_removed_authors() {
        let mut p = profile();
        p.muted_users.insert("a".to_string());
        let removed_authors: std::collections::HashSet<String> = vec![note("n1", "a")]
            .into_iter()
            .filter(|n| !ContentFilter::new().filter(vec![n.clone()], &p).iter().any(|k| k.note_id == n.note_id))
            .map(|n| n.author_id)
            .collect();
        assert!(removed_authors.is_subset(&p.muted_users));
    }
}
