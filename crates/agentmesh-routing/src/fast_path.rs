use agentmesh_core::model::{Action, Decision, SessionContext};
use regex::Regex;
use std::sync::LazyLock;

static NUMERIC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*(\d{1,3})\s*$").unwrap());

const CONFIRMATION_WORDS: &[&str] = &["yes", "yeah", "yep", "correct", "confirm", "sure", "ok", "okay"];
const PAGINATION_WORDS: &[&str] = &["next", "more", "previous", "back", "page"];
const ORDINAL_WORDS: &[(&str, usize)] = &[
    ("first", 1),
    ("second", 2),
    ("third", 3),
    ("fourth", 4),
    ("fifth", 5),
];
pub const CANCEL_WORDS: &[&str] = &["cancel", "stop", "nevermind", "never mind", "abort"];

fn normalized(message: &str) -> String {
    message.trim().to_lowercase()
}

pub fn is_cancel_vocabulary(message: &str) -> bool {
    let norm = normalized(message);
    CANCEL_WORDS.iter().any(|w| norm == *w)
}

fn is_confirmation(message: &str) -> bool {
    let norm = normalized(message);
    CONFIRMATION_WORDS.iter().any(|w| norm == *w)
}

fn is_pagination(message: &str) -> bool {
    let norm = normalized(message);
    PAGINATION_WORDS.iter().any(|w| norm == *w)
}

/// A message consisting purely of a small positional ordinal: a bare number
/// ("2") or an ordinal word ("second").
pub fn positional_ordinal(message: &str) -> Option<usize> {
    let norm = normalized(message);
    if let Some(caps) = NUMERIC.captures(&norm) {
        return caps.get(1)?.as_str().parse().ok();
    }
    ORDINAL_WORDS
        .iter()
        .find(|(word, _)| *word == norm)
        .map(|(_, n)| *n)
}

/// Pure numeric, confirmation word, pagination word, or positional ordinal —
/// the short follow-up pattern.
pub fn is_short_follow_up(message: &str) -> bool {
    positional_ordinal(message).is_some() || is_confirmation(message) || is_pagination(message)
}

/// Deterministic, no-LLM fast paths. Returns `None` when none
/// apply, so the caller falls through to LLM classification/orchestration.
pub fn decide_fast_path(ctx: &SessionContext, message: &str) -> Option<Decision> {
    if ctx.has_active_collector() {
        // Cancel vocabulary still routes through `continue_collector` so the
        // collector engine's own deterministic cancel path runs, rather than
        // falling through to LLM orchestration.
        return Some(Decision::new(
            Action::ContinueCollector,
            None,
            "session has an active collector",
        ));
    }

    if is_cancel_vocabulary(message) {
        return None;
    }

    if let Some(routed) = &ctx.routed_to_node {
        if is_short_follow_up(message) {
            return Some(Decision::new(
                Action::RouteToNode,
                Some(routed.slug.clone()),
                "short follow-up on an already-routed session",
            ));
        }
    }

    if let Some(position) = positional_ordinal(message) {
        if let Some(list) = &ctx.last_entity_list {
            if let Some(entity_id) = list.resolve_position(position) {
                return Some(Decision::new(
                    Action::ResolvePositionalReference,
                    Some(entity_id.to_string()),
                    format!("positional reference resolved against entity type {}", list.entity_type),
                ));
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentmesh_core::model::{EntityListMemory, RoutedToNode};

    #[test]
    fn active_collector_always_wins() {
        let mut ctx = SessionContext::new("s1", None);
        ctx.active_collector = Some(agentmesh_core::model::ActiveCollector {
            name: "create_invoice".into(),
            state: agentmesh_core::model::CollectorState::Collecting,
            asking_for: None,
        });
        let decision = decide_fast_path(&ctx, "anything").unwrap();
        assert_eq!(decision.action, Action::ContinueCollector);
    }

    #[test]
    fn cancel_vocabulary_with_active_collector_routes_to_continue_collector() {
        let mut ctx = SessionContext::new("s1", None);
        ctx.active_collector = Some(agentmesh_core::model::ActiveCollector {
            name: "create_invoice".into(),
            state: agentmesh_core::model::CollectorState::Collecting,
            asking_for: None,
        });
        let decision = decide_fast_path(&ctx, "cancel").unwrap();
        assert_eq!(decision.action, Action::ContinueCollector);
    }

    #[test]
    fn cancel_vocabulary_with_no_active_collector_falls_through_to_llm() {
        let ctx = SessionContext::new("s1", None);
        assert!(decide_fast_path(&ctx, "cancel").is_none());
    }

    #[test]
    fn routed_session_short_follow_up_stays_routed() {
        let mut ctx = SessionContext::new("s1", None);
        ctx.routed_to_node = Some(RoutedToNode {
            slug: "mail".into(),
            reason: None,
        });
        let decision = decide_fast_path(&ctx, "1").unwrap();
        assert_eq!(decision.action, Action::RouteToNode);
        assert_eq!(decision.resource.as_deref(), Some("mail"));
    }

    #[test]
    fn positional_reference_resolves_to_entity_id() {
        let mut ctx = SessionContext::new("s1", None);
        ctx.last_entity_list = Some(EntityListMemory {
            entity_type: "invoice".into(),
            entity_ids: vec!["A".into(), "B".into(), "C".into()],
        });
        let decision = decide_fast_path(&ctx, "2").unwrap();
        assert_eq!(decision.action, Action::ResolvePositionalReference);
        assert_eq!(decision.resource.as_deref(), Some("B"));
    }

    #[test]
    fn no_fast_path_for_free_text_with_no_session_state() {
        let ctx = SessionContext::new("s1", None);
        assert!(decide_fast_path(&ctx, "create an invoice for Acme").is_none());
    }
}
