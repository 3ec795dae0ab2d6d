use agentmesh_core::error::CoreError;
use agentmesh_core::model::{Action, Decision, SessionContext};
use agentmesh_core::ports::{LlmClient, Prompt};

use crate::fast_path::decide_fast_path;

/// Decision `continue | re_route:<slug> | local` for an already-routed
/// session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutedClassification {
    Continue,
    ReRoute(String),
    Local,
}

fn parse_routed_classification(raw: &str) -> RoutedClassification {
    let token = raw.trim();
    if token == "LOCAL" {
        return RoutedClassification::Local;
    }
    if let Some(slug) = token.strip_prefix("RE_ROUTE:") {
        return RoutedClassification::ReRoute(slug.trim().to_string());
    }
    if token == "CONTINUE" {
        return RoutedClassification::Continue;
    }
    // Unknown tokens fall back to `continue` — safer than dropping session state.
    RoutedClassification::Continue
}

fn parse_orchestration_response(raw: &str) -> Decision {
    let mut action_line = None;
    let mut resource_line = None;
    let mut reason_line = None;

    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("ACTION:") {
            action_line = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("RESOURCE:") {
            resource_line = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("REASON:") {
            reason_line = Some(rest.trim().to_string());
        }
    }

    let action = action_line.as_deref().and_then(parse_action);
    let reason = reason_line.unwrap_or_else(|| "model-provided reason missing".to_string());

    match action {
        Some(action) => {
            let resource = resource_line.filter(|r| !r.is_empty() && r != "none" && r != "None");
            Decision::new(action, resource, reason)
        }
        // Unrecognized action: default to the safest fallback (knowledge search).
        None => Decision::new(Action::SearchKnowledge, None, reason),
    }
}

fn parse_action(token: &str) -> Option<Action> {
    match token {
        "continue_collector" => Some(Action::ContinueCollector),
        "start_collector" => Some(Action::StartCollector),
        "use_tool" => Some(Action::UseTool),
        "route_to_node" => Some(Action::RouteToNode),
        "resume_session" => Some(Action::ResumeSession),
        "pause_and_handle" => Some(Action::PauseAndHandle),
        "search_knowledge" => Some(Action::SearchKnowledge),
        "conversational" => Some(Action::Conversational),
        "resolve_positional_reference" => Some(Action::ResolvePositionalReference),
        _ => None,
    }
}

/// Produces `(action, resource, reason)` for each inbound message.
pub struct RoutingDecisionEngine {
    llm: std::sync::Arc<dyn LlmClient>,
}

impl RoutingDecisionEngine {
    pub fn new(llm: std::sync::Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Classifies a follow-up message on an already-routed session.
    pub async fn classify_routed_followup(
        &self,
        ctx: &SessionContext,
        active_node_summary: &str,
        other_node_digests: &str,
        message: &str,
    ) -> Result<RoutedClassification, CoreError> {
        let recent = recent_turns_text(ctx, 4);
        let prompt = Prompt::new(format!(
            "Active node:\n{active_node_summary}\n\nOther nodes:\n{other_node_digests}\n\n\
             Recent turns:\n{recent}\n\nNew message: {message}\n\n\
             Answer with exactly one token: CONTINUE, RE_ROUTE:<slug>, or LOCAL."
        ));
        let raw = self.llm.complete(prompt).await?;
        Ok(parse_routed_classification(&raw))
    }

    /// The general-case orchestration decision.
    pub async fn orchestrate(
        &self,
        ctx: &SessionContext,
        routing_digest: &str,
        catalog_summary: &str,
        user_profile: &str,
        message: &str,
    ) -> Result<Decision, CoreError> {
        let recent = recent_turns_text(ctx, 6);
        let prompt = Prompt::new(format!(
            "Routing digest:\n{routing_digest}\n\nCatalog:\n{catalog_summary}\n\n\
             User profile:\n{user_profile}\n\nRecent turns:\n{recent}\n\nNew message: {message}\n\n\
             Respond in exactly this format:\nACTION: <action>\nRESOURCE: <resource or none>\nREASON: <reason>"
        ));
        let raw = self.llm.complete(prompt).await?;
        Ok(parse_orchestration_response(&raw))
    }

    /// Rewrites a `search_knowledge` decision to `conversational`
    /// when the message is actually a follow-up about an already-presented
    /// list, avoiding re-listing it.
    pub fn apply_follow_up_guard(&self, decision: Decision, is_list_followup: bool) -> Decision {
        if decision.action == Action::SearchKnowledge && is_list_followup {
            Decision::new(
                Action::Conversational,
                None,
                "follow-up about an already-presented list",
            )
        } else {
            decision
        }
    }

    /// Entry point composing the fast paths with the LLM orchestration call.
    /// Callers that need the routed-session classification path call
    /// `classify_routed_followup` directly before reaching here.
    pub async fn decide(
        &self,
        ctx: &SessionContext,
        message: &str,
        routing_digest: &str,
        catalog_summary: &str,
        user_profile: &str,
    ) -> Result<Decision, CoreError> {
        if let Some(decision) = decide_fast_path(ctx, message) {
            return Ok(decision);
        }
        self.orchestrate(ctx, routing_digest, catalog_summary, user_profile, message)
            .await
    }
}

fn recent_turns_text(ctx: &SessionContext, count: usize) -> String {
    ctx.conversation
        .iter()
        .rev()
        .take(count)
        .rev()
        .map(|t| format!("{:?}: {}", t.role, t.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct FixedLlm(String);

    #[async_trait]
    impl LlmClient for FixedLlm {
        async fn complete(&self, _prompt: Prompt) -> Result<String, CoreError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn orchestrate_parses_well_formed_response() {
        let engine = RoutingDecisionEngine::new(Arc::new(FixedLlm(
            "ACTION: start_collector\nRESOURCE: create_invoice\nREASON: user wants to create an invoice".into(),
        )));
        let ctx = SessionContext::new("s1", None);
        let decision = engine.orchestrate(&ctx, "", "", "", "create an invoice").await.unwrap();
        assert_eq!(decision.action, Action::StartCollector);
        assert_eq!(decision.resource.as_deref(), Some("create_invoice"));
    }

    #[tokio::test]
    async fn orchestrate_falls_back_to_search_knowledge_on_unknown_action() {
        let engine = RoutingDecisionEngine::new(Arc::new(FixedLlm(
            "ACTION: do_something_weird\nRESOURCE: none\nREASON: unclear".into(),
        )));
        let ctx = SessionContext::new("s1", None);
        let decision = engine.orchestrate(&ctx, "", "", "", "huh?").await.unwrap();
        assert_eq!(decision.action, Action::SearchKnowledge);
    }

    #[test]
    fn routed_classification_unknown_token_falls_back_to_continue() {
        assert_eq!(parse_routed_classification("GARBAGE"), RoutedClassification::Continue);
        assert_eq!(parse_routed_classification("LOCAL"), RoutedClassification::Local);
        assert_eq!(
            parse_routed_classification("RE_ROUTE:billing"),
            RoutedClassification::ReRoute("billing".into())
        );
    }

    #[test]
    fn follow_up_guard_rewrites_search_to_conversational() {
        let engine = RoutingDecisionEngine::new(Arc::new(FixedLlm(String::new())));
        let decision = Decision::new(Action::SearchKnowledge, None, "list lookup");
        let rewritten = engine.apply_follow_up_guard(decision, true);
        assert_eq!(rewritten.action, Action::Conversational);
    }

    #[test]
    fn follow_up_guard_leaves_other_actions_untouched() {
        let engine = RoutingDecisionEngine::new(Arc::new(FixedLlm(String::new())));
        let decision = Decision::new(Action::UseTool, Some("send_email".into()), "tool call");
        let rewritten = engine.apply_follow_up_guard(decision.clone(), true);
        assert_eq!(rewritten, decision);
    }
}
