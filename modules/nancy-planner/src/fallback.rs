// Deterministic intent rules for when the linguistic adapter is out. Every
// LLM call in the planner has a pure fallback; this is the classification
// half.

use chrono::{TimeZone, Utc};
use regex::Regex;
use std::sync::OnceLock;

use nancy_common::{BrainKind, Intent, IntentFilters, QueryStrategy};

fn quarter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bq([1-4])\s*(\d{4})\b").unwrap())
}

fn year_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(19|20)\d{2}\b").unwrap())
}

/// Cues that read as metadata constraints rather than content.
const FILTER_CUES: [&str; 8] = [
    "from q", "in q", "created", "dated", "during", "between", "before", "after",
];

const MONTHS: [&str; 12] = [
    "january", "february", "march", "april", "may", "june", "july", "august",
    "september", "october", "november", "december",
];

/// Rule-based classification: metadata_filter when the query carries obvious
/// filter cues, semantic otherwise. Short queries are semantic by default.
pub fn rule_based_intent(query: &str) -> Intent {
    let lowered = query.to_lowercase();
    let filters = extract_time_filters(&lowered);

    let has_filter_cue = !filters.is_empty()
        || FILTER_CUES.iter().any(|cue| lowered.contains(cue))
        || MONTHS.iter().any(|m| lowered.contains(m));

    if has_filter_cue {
        Intent {
            strategy: QueryStrategy::MetadataFilter,
            primary_store: BrainKind::Analytical,
            needs: vec![BrainKind::Analytical],
            entities: Vec::new(),
            filters,
        }
    } else {
        Intent {
            strategy: QueryStrategy::Semantic,
            primary_store: BrainKind::Vector,
            needs: vec![BrainKind::Vector],
            entities: vec![query.trim().to_string()],
            filters: IntentFilters::default(),
        }
    }
}

/// Pull quarter/year windows out of the text. `Q4 2024` beats a bare year.
pub fn extract_time_filters(lowered: &str) -> IntentFilters {
    let mut filters = IntentFilters::default();

    if let Some(caps) = quarter_re().captures(lowered) {
        let quarter: u32 = caps[1].parse().unwrap_or(1);
        let year: i32 = caps[2].parse().unwrap_or(2024);
        let start_month = (quarter - 1) * 3 + 1;
        let start = Utc.with_ymd_and_hms(year, start_month, 1, 0, 0, 0).single();
        let end = if quarter == 4 {
            Utc.with_ymd_and_hms(year + 1, 1, 1, 0, 0, 0).single()
        } else {
            Utc.with_ymd_and_hms(year, start_month + 3, 1, 0, 0, 0).single()
        };
        filters.created_after = start;
        filters.created_before = end;
        return filters;
    }

    if let Some(m) = year_re().find(lowered) {
        if let Ok(year) = m.as_str().parse::<i32>() {
            filters.created_after = Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).single();
            filters.created_before = Utc.with_ymd_and_hms(year + 1, 1, 1, 0, 0, 0).single();
        }
    }
    filters
}

/// Multi-step detection: relationship-shaped strategies always are; anything
/// else needs strong cues from at least two disjoint categories (content
/// noun, person, time window).
pub fn is_multi_step(intent: &Intent) -> bool {
    if matches!(
        intent.strategy,
        QueryStrategy::RelationshipDiscovery
            | QueryStrategy::DecisionProvenance
            | QueryStrategy::ExpertIdentification
            | QueryStrategy::Hybrid
    ) {
        return true;
    }
    let content_cue = !intent.entities.is_empty();
    let person_cue = intent.filters.author.is_some();
    let time_cue =
        intent.filters.created_after.is_some() || intent.filters.created_before.is_some();
    [content_cue, person_cue, time_cue]
        .iter()
        .filter(|&&c| c)
        .count()
        >= 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quarter_query_becomes_metadata_filter() {
        let intent = rule_based_intent("documents from Q4 2024");
        assert_eq!(intent.strategy, QueryStrategy::MetadataFilter);
        assert_eq!(intent.needs, vec![BrainKind::Analytical]);
        let after = intent.filters.created_after.unwrap();
        let before = intent.filters.created_before.unwrap();
        assert_eq!(after.to_rfc3339(), "2024-10-01T00:00:00+00:00");
        assert_eq!(before.to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[test]
    fn q1_window_does_not_cross_years() {
        let filters = extract_time_filters("stuff in q1 2023");
        assert_eq!(
            filters.created_after.unwrap().to_rfc3339(),
            "2023-01-01T00:00:00+00:00"
        );
        assert_eq!(
            filters.created_before.unwrap().to_rfc3339(),
            "2023-04-01T00:00:00+00:00"
        );
    }

    #[test]
    fn bare_year_still_filters() {
        let intent = rule_based_intent("meeting notes 2023");
        assert_eq!(intent.strategy, QueryStrategy::MetadataFilter);
        assert!(intent.filters.created_after.is_some());
    }

    #[test]
    fn plain_content_query_is_semantic() {
        let intent = rule_based_intent("power requirements");
        assert_eq!(intent.strategy, QueryStrategy::Semantic);
        assert_eq!(intent.primary_store, BrainKind::Vector);
        assert_eq!(intent.entities, vec!["power requirements".to_string()]);
    }

    #[test]
    fn month_name_is_a_filter_cue() {
        let intent = rule_based_intent("what shipped in october");
        assert_eq!(intent.strategy, QueryStrategy::MetadataFilter);
    }

    #[test]
    fn multi_step_by_strategy_and_by_cues() {
        let mut intent = rule_based_intent("power requirements");
        assert!(!is_multi_step(&intent));

        intent.strategy = QueryStrategy::Hybrid;
        assert!(is_multi_step(&intent));

        let mut cued = rule_based_intent("power requirements");
        cued.filters.author = Some("Sarah Chen".into());
        assert!(is_multi_step(&cued));
    }
}
