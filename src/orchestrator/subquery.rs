//! Turning an LLM reply into a list of sub-queries.

use regex::Regex;
use serde_json::Value;

pub const SYSTEM_PROMPT: &str = "You split research questions into focused sub-questions. \
Reply with a JSON array of strings and nothing else, for example: \
[\"What drives X?\", \"How does Y affect Z?\", \"Where is W heading?\"]";

pub fn prompt(main_query: &str) -> String {
    format!(
        "Split this research question into 3 to 5 specific sub-questions, each covering a \
         different aspect and narrow enough for a detailed answer.\n\n\
         Research question: {}\n\n\
         Reply with only a JSON array of strings.",
        main_query
    )
}

/// Parse sub-queries from a model reply, keeping at most `cap`.
///
/// Tries, in order: the first JSON array of strings, then quoted questions,
/// then the main query alone.
pub fn parse_sub_queries(reply: &str, main_query: &str, cap: usize) -> Vec<String> {
    let cleaned = strip_fences(reply);

    let mut queries = json_array(cleaned);
    if queries.is_empty() {
        queries = quoted_questions(cleaned);
    }
    if queries.is_empty() {
        queries = vec![main_query.to_string()];
    }

    queries.truncate(cap.max(1));
    queries
}

fn strip_fences(reply: &str) -> &str {
    let mut text = reply.trim();
    for opener in ["```json", "```"] {
        if let Some(rest) = text.strip_prefix(opener) {
            text = rest;
            break;
        }
    }
    text.strip_suffix("```").unwrap_or(text).trim()
}

fn json_array(text: &str) -> Vec<String> {
    let Ok(re) = Regex::new(r"(?s)\[.*\]") else {
        return vec![];
    };
    let Some(found) = re.find(text) else {
        return vec![];
    };

    match serde_json::from_str::<Vec<Value>>(found.as_str()) {
        Ok(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                _ => None,
            })
            .collect(),
        Err(e) => {
            tracing::debug!("Sub-query array did not parse: {}", e);
            vec![]
        }
    }
}

fn quoted_questions(text: &str) -> Vec<String> {
    let Ok(re) = Regex::new(r#""([^"]+\?)""#) else {
        return vec![];
    };
    re.captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_array() {
        let parsed = parse_sub_queries(r#"["Q1", "Q2"]"#, "main", 5);
        assert_eq!(parsed, vec!["Q1", "Q2"]);
    }

    #[test]
    fn test_fenced_array_with_chatter() {
        let reply = "```json\nHere you go:\n[\"What is A?\", 42, \"What is B?\"]\n```";
        let parsed = parse_sub_queries(reply, "main", 5);
        assert_eq!(parsed, vec!["What is A?", "What is B?"]);
    }

    #[test]
    fn test_quoted_questions_fallback() {
        let reply = r#"1. "Why does X happen?" 2. "How big is Y?" [broken"#;
        let parsed = parse_sub_queries(reply, "main", 5);
        assert_eq!(parsed, vec!["Why does X happen?", "How big is Y?"]);
    }

    #[test]
    fn test_main_query_fallback() {
        assert_eq!(parse_sub_queries("no idea", "main query", 5), vec!["main query"]);
        assert_eq!(parse_sub_queries("[]", "main query", 5), vec!["main query"]);
    }

    #[test]
    fn test_cap() {
        let reply = r#"["a","b","c","d","e","f","g"]"#;
        assert_eq!(parse_sub_queries(reply, "m", 5).len(), 5);
        assert_eq!(parse_sub_queries(reply, "m", 0).len(), 1);
    }
}
