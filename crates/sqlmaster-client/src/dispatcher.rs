//! Query Dispatcher
//!
//! Sends one question at a time to `/chat` and turns the reply into chat
//! entries. The user entry is appended before the request goes out; exactly one
//! assistant entry follows when the turn resolves. An ambiguous reply parks the
//! original question in a [`PendingClarification`] until the user picks the
//! sources to scope it to.
//!
//! Phases: `Idle -> Sending -> {Idle, AmbiguityPending}`. A turn that ends in
//! an answer or a failure returns straight to `Idle`; the [`TurnOutcome`] says
//! which one it was.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ChatResponse};
use crate::config::DEFAULT_CLARIFICATION_TEMPLATE;
use crate::conversation::{AssistantEntry, ChatEntry, ConversationLog, SESSION_EXPIRED_NOTICE};
use crate::error::ClientError;
use crate::session::SessionStore;
use crate::utils::TextUtils;

const AMBIGUOUS_FALLBACK: &str =
    "This question could apply to more than one table. Which ones should I use?";
const NO_ANSWER_FALLBACK: &str = "The service returned no answer.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    Idle,
    Sending,
    AmbiguityPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    EmptyQuestion,
    Busy,
    NotSignedIn,
    NoSourcesSelected,
    NothingPending,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::EmptyQuestion => "the question is empty",
            Self::Busy => "another question is still being answered",
            Self::NotSignedIn => "not signed in",
            Self::NoSourcesSelected => "no sources selected",
            Self::NothingPending => "no question is waiting for clarification",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Nothing was appended and nothing was sent.
    Rejected(RejectReason),
    Answered,
    AmbiguityPending,
    SessionExpired,
    Failed { reason: String },
    /// The conversation was cleared while the request was in flight.
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingClarification {
    pub question: String,
    pub candidates: Vec<String>,
    pub selected: Vec<String>,
}

/// Wording of the refined question; `{sources}` and `{question}` are substituted.
#[derive(Debug, Clone)]
pub struct ClarificationTemplate(String);

impl ClarificationTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    pub fn render(&self, sources: &[String], question: &str) -> String {
        self.0
            .replace("{sources}", &sources.join(", "))
            .replace("{question}", question)
    }
}

impl Default for ClarificationTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_CLARIFICATION_TEMPLATE)
    }
}

struct DispatchState {
    phase: DispatchPhase,
    /// Bumped by `clear()`; responses from an older epoch are dropped.
    epoch: u64,
    /// Set while a `/chat` request is outstanding, including one retired by `clear()`.
    in_flight: bool,
    pending: Option<PendingClarification>,
}

pub struct QueryDispatcher {
    api: ApiClient,
    session: Arc<SessionStore>,
    log: ConversationLog,
    template: ClarificationTemplate,
    state: Mutex<DispatchState>,
}

impl QueryDispatcher {
    pub fn new(
        api: ApiClient,
        session: Arc<SessionStore>,
        log: ConversationLog,
        template: ClarificationTemplate,
    ) -> Self {
        Self {
            api,
            session,
            log,
            template,
            state: Mutex::new(DispatchState {
                phase: DispatchPhase::Idle,
                epoch: 0,
                in_flight: false,
                pending: None,
            }),
        }
    }

    pub fn log(&self) -> &ConversationLog {
        &self.log
    }

    pub fn phase(&self) -> DispatchPhase {
        self.lock().phase
    }

    pub fn pending_clarification(&self) -> Option<PendingClarification> {
        self.lock().pending.clone()
    }

    pub async fn ask(&self, question: &str) -> TurnOutcome {
        let question = question.trim();
        if question.is_empty() {
            return TurnOutcome::Rejected(RejectReason::EmptyQuestion);
        }

        let started = {
            let mut state = self.lock();
            self.begin_turn(&mut state, question)
        };
        match started {
            Ok((token, epoch)) => self.complete_turn(question, &token, epoch).await,
            Err(reason) => {
                debug!("Question rejected: {:?}", reason);
                TurnOutcome::Rejected(reason)
            }
        }
    }

    /// Re-asks the parked question scoped to `selected_sources`.
    pub async fn resolve_ambiguity(&self, selected_sources: &[String]) -> TurnOutcome {
        let mut selected: Vec<String> = Vec::with_capacity(selected_sources.len());
        for name in selected_sources {
            let name = name.trim();
            if !name.is_empty() && !selected.iter().any(|s| s == name) {
                selected.push(name.to_string());
            }
        }
        if selected.is_empty() {
            return TurnOutcome::Rejected(RejectReason::NoSourcesSelected);
        }

        let started = {
            let mut state = self.lock();
            let Some(pending) = state.pending.as_ref() else {
                return TurnOutcome::Rejected(RejectReason::NothingPending);
            };
            let refined = self.template.render(&selected, &pending.question);
            self.begin_turn(&mut state, &refined)
                .map(|(token, epoch)| (refined, token, epoch))
        };
        match started {
            Ok((refined, token, epoch)) => {
                info!("Resolving ambiguity with {} source(s)", selected.len());
                self.complete_turn(&refined, &token, epoch).await
            }
            Err(reason) => TurnOutcome::Rejected(reason),
        }
    }

    /// Flips `source` in the pending selection. Returns the new selected state,
    /// or `None` when nothing is pending or the name was not offered.
    pub fn toggle_source(&self, source: &str) -> Option<bool> {
        let mut state = self.lock();
        let pending = state.pending.as_mut()?;
        if !pending.candidates.iter().any(|c| c == source) {
            return None;
        }
        if let Some(pos) = pending.selected.iter().position(|s| s == source) {
            pending.selected.remove(pos);
            Some(false)
        } else {
            pending.selected.push(source.to_string());
            Some(true)
        }
    }

    pub async fn resolve_selected(&self) -> TurnOutcome {
        let selected = self
            .pending_clarification()
            .map(|p| p.selected)
            .unwrap_or_default();
        self.resolve_ambiguity(&selected).await
    }

    /// Empties the log and returns to `Idle`. A request still in flight is
    /// retired: its response is dropped when it arrives, and new questions are
    /// rejected as busy until then.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.epoch += 1;
        state.phase = DispatchPhase::Idle;
        state.pending = None;
        self.log.clear();
        info!("Conversation cleared");
    }

    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claims the single in-flight slot and appends the user entry.
    fn begin_turn(
        &self,
        state: &mut DispatchState,
        text: &str,
    ) -> Result<(String, u64), RejectReason> {
        if state.in_flight {
            return Err(RejectReason::Busy);
        }
        let token = self
            .session
            .current_credential()
            .ok_or(RejectReason::NotSignedIn)?;
        if let Some(abandoned) = state.pending.take() {
            debug!("Dropping pending clarification for '{}'", abandoned.question);
        }
        state.phase = DispatchPhase::Sending;
        state.in_flight = true;
        self.log.append(ChatEntry::user(text));
        info!("Asking: {}", TextUtils::truncate_with_ellipsis(text, 80));
        Ok((token, state.epoch))
    }

    async fn complete_turn(&self, question: &str, token: &str, epoch: u64) -> TurnOutcome {
        let result = self.api.chat(token, question).await;

        let mut state = self.lock();
        state.in_flight = false;
        if state.epoch != epoch {
            info!("Discarding response for a turn retired by clear()");
            if matches!(result, Err(ClientError::AuthenticationExpired)) {
                self.session.expire();
            }
            return TurnOutcome::Discarded;
        }

        match result {
            Ok(response) if response.ambiguous() => {
                let entry = ambiguous_entry(response);
                let candidates = entry
                    .ambiguity
                    .as_ref()
                    .map(|a| a.candidate_sources.clone())
                    .unwrap_or_default();
                debug!("Ambiguous question, {} candidate source(s)", candidates.len());
                self.log.append(ChatEntry::Assistant(entry));
                state.pending = Some(PendingClarification {
                    question: question.to_string(),
                    candidates,
                    selected: Vec::new(),
                });
                state.phase = DispatchPhase::AmbiguityPending;
                TurnOutcome::AmbiguityPending
            }
            Ok(response) => {
                self.log.append(ChatEntry::Assistant(answer_entry(response)));
                state.phase = DispatchPhase::Idle;
                TurnOutcome::Answered
            }
            Err(ClientError::AuthenticationExpired) => {
                self.session.expire();
                self.log.append(ChatEntry::assistant(SESSION_EXPIRED_NOTICE));
                state.phase = DispatchPhase::Idle;
                TurnOutcome::SessionExpired
            }
            Err(e) => {
                warn!("Question failed: {}", e);
                let reason = e.user_detail();
                self.log.append(ChatEntry::assistant(format!("Error: {}", reason)));
                state.phase = DispatchPhase::Idle;
                TurnOutcome::Failed { reason }
            }
        }
    }
}

fn answer_entry(response: ChatResponse) -> AssistantEntry {
    AssistantEntry {
        content: response
            .answer
            .unwrap_or_else(|| NO_ANSWER_FALLBACK.to_string()),
        generated_query: response.sql.filter(|s| !s.trim().is_empty()),
        result_rows: response.data,
        plan: response.plan,
        reflection: response.reflection,
        ambiguity: None,
    }
}

fn ambiguous_entry(response: ChatResponse) -> AssistantEntry {
    AssistantEntry::with_candidates(
        response
            .answer
            .unwrap_or_else(|| AMBIGUOUS_FALLBACK.to_string()),
        response.potential_matches.unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Role;
    use crate::session::{InMemoryKvStore, KvStore, TOKEN_KEY, USERNAME_KEY};
    use mockito::Matcher;
    use serde_json::json;
    use std::time::Duration;

    fn dispatcher(server: &mockito::ServerGuard) -> (QueryDispatcher, Arc<SessionStore>) {
        let kv = InMemoryKvStore::new();
        kv.apply(&[(TOKEN_KEY, "tok"), (USERNAME_KEY, "ada")], &[]).unwrap();
        let api = ApiClient::new(server.url(), Duration::from_secs(5)).unwrap();
        let session = Arc::new(SessionStore::open(api.clone(), Arc::new(kv)).unwrap());
        let dispatcher = QueryDispatcher::new(
            api,
            Arc::clone(&session),
            ConversationLog::new(),
            ClarificationTemplate::default(),
        );
        (dispatcher, session)
    }

    fn chat_body(query: &str) -> Matcher {
        Matcher::UrlEncoded("query".into(), query.into())
    }

    async fn mock_ambiguous(server: &mut mockito::ServerGuard) -> mockito::Mock {
        server
            .mock("POST", "/chat")
            .match_body(chat_body("show totals"))
            .with_status(200)
            .with_body(
                json!({
                    "answer": "Did you mean sales or orders?",
                    "is_ambiguous": true,
                    "potential_matches": ["sales", "orders"]
                })
                .to_string(),
            )
            .create_async()
            .await
    }

    #[test]
    fn template_substitutes_sources_and_question() {
        let template = ClarificationTemplate::default();
        let refined = template.render(&["sales".into(), "orders".into()], "show totals");
        assert_eq!(refined, "In the table(s) [sales, orders], show totals");

        let custom = ClarificationTemplate::new("{question} (only {sources})");
        assert_eq!(custom.render(&["sales".into()], "count rows"), "count rows (only sales)");
    }

    #[tokio::test]
    async fn blank_question_is_a_noop() {
        let server = mockito::Server::new_async().await;
        let (d, _) = dispatcher(&server);
        assert_eq!(d.ask("   ").await, TurnOutcome::Rejected(RejectReason::EmptyQuestion));
        assert!(d.log().is_empty());
        assert_eq!(d.phase(), DispatchPhase::Idle);
    }

    #[tokio::test]
    async fn answered_turn_appends_user_then_assistant() {
        let mut server = mockito::Server::new_async().await;
        let chat = server
            .mock("POST", "/chat")
            .match_header("authorization", "Bearer tok")
            .match_body(chat_body("total revenue?"))
            .with_status(200)
            .with_body(
                json!({
                    "answer": "Revenue is 1200",
                    "sql": "SELECT SUM(amount) AS total FROM sales",
                    "data": [{"total": 1200, "currency": "EUR"}],
                    "plan": "sum amounts",
                    "reflection": "query verified"
                })
                .to_string(),
            )
            .create_async()
            .await;
        let (d, _) = dispatcher(&server);

        assert_eq!(d.ask("  total revenue?  ").await, TurnOutcome::Answered);
        chat.assert_async().await;

        let entries = d.log().entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], ChatEntry::user("total revenue?"));
        match &entries[1] {
            ChatEntry::Assistant(entry) => {
                assert_eq!(entry.content, "Revenue is 1200");
                assert_eq!(entry.generated_query.as_deref(), Some("SELECT SUM(amount) AS total FROM sales"));
                let rows = entry.result_rows.as_ref().unwrap();
                assert_eq!(rows[0].keys().collect::<Vec<_>>(), vec!["total", "currency"]);
                assert_eq!(entry.plan.as_deref(), Some("sum amounts"));
                assert_eq!(entry.reflection.as_deref(), Some("query verified"));
                assert!(entry.ambiguity.is_none());
            }
            other => panic!("expected assistant entry, got {:?}", other),
        }
        assert_eq!(d.phase(), DispatchPhase::Idle);
    }

    #[tokio::test]
    async fn second_ask_while_sending_is_rejected() {
        let mut server = mockito::Server::new_async().await;
        let chat = server
            .mock("POST", "/chat")
            .with_status(200)
            .with_body(r#"{"answer": "done"}"#)
            .expect(1)
            .create_async()
            .await;
        let (d, _) = dispatcher(&server);

        let (first, second) = tokio::join!(d.ask("first"), d.ask("second"));
        assert_eq!(first, TurnOutcome::Answered);
        assert_eq!(second, TurnOutcome::Rejected(RejectReason::Busy));
        assert_eq!(d.log().len(), 2);
        assert_eq!(d.log().entries()[0].content(), "first");
        chat.assert_async().await;
    }

    #[tokio::test]
    async fn remote_failure_appends_error_and_returns_to_idle() {
        let mut server = mockito::Server::new_async().await;
        let _chat = server
            .mock("POST", "/chat")
            .with_status(500)
            .with_body(r#"{"detail": "relation \"salez\" does not exist"}"#)
            .create_async()
            .await;
        let (d, session) = dispatcher(&server);

        let outcome = d.ask("show salez").await;
        assert_eq!(
            outcome,
            TurnOutcome::Failed {
                reason: "relation \"salez\" does not exist".into()
            }
        );
        assert_eq!(d.log().last().unwrap().content(), "Error: relation \"salez\" does not exist");
        assert_eq!(d.phase(), DispatchPhase::Idle);
        assert!(session.is_signed_in());
    }

    #[tokio::test]
    async fn unauthorized_expires_session_and_blocks_next_ask() {
        let mut server = mockito::Server::new_async().await;
        let chat = server
            .mock("POST", "/chat")
            .with_status(401)
            .with_body(r#"{"detail": "Invalid session"}"#)
            .expect(1)
            .create_async()
            .await;
        let (d, session) = dispatcher(&server);

        assert_eq!(d.ask("show totals").await, TurnOutcome::SessionExpired);
        assert_eq!(session.current_credential(), None);
        assert_eq!(d.log().len(), 2);
        assert_eq!(d.log().last().unwrap().content(), SESSION_EXPIRED_NOTICE);

        assert_eq!(d.ask("show totals again").await, TurnOutcome::Rejected(RejectReason::NotSignedIn));
        assert_eq!(d.log().len(), 2);
        chat.assert_async().await;
    }

    #[tokio::test]
    async fn ambiguity_round_trip() {
        let mut server = mockito::Server::new_async().await;
        let _first = mock_ambiguous(&mut server).await;
        let refined = server
            .mock("POST", "/chat")
            .match_body(chat_body("In the table(s) [sales, orders], show totals"))
            .with_status(200)
            .with_body(r#"{"answer": "Totals: 10 and 20", "data": []}"#)
            .expect(1)
            .create_async()
            .await;
        let (d, _) = dispatcher(&server);

        assert_eq!(d.ask("show totals").await, TurnOutcome::AmbiguityPending);
        assert_eq!(d.phase(), DispatchPhase::AmbiguityPending);
        let last = d.log().last().unwrap();
        assert!(last.is_ambiguous());
        let pending = d.pending_clarification().unwrap();
        assert_eq!(pending.question, "show totals");
        assert_eq!(pending.candidates, vec!["sales", "orders"]);

        let outcome = d
            .resolve_ambiguity(&["sales".to_string(), "orders".to_string()])
            .await;
        assert_eq!(outcome, TurnOutcome::Answered);
        refined.assert_async().await;

        let entries = d.log().entries();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[2].role(), Role::User);
        assert!(entries[2].content().contains("sales"));
        assert!(entries[2].content().contains("orders"));
        assert!(entries[2].content().contains("show totals"));
        assert!(d.pending_clarification().is_none());
        assert_eq!(d.phase(), DispatchPhase::Idle);
    }

    #[tokio::test]
    async fn resolving_with_no_sources_is_a_noop() {
        let mut server = mockito::Server::new_async().await;
        let _first = mock_ambiguous(&mut server).await;
        let (d, _) = dispatcher(&server);
        d.ask("show totals").await;
        let before = d.log().len();

        assert_eq!(
            d.resolve_ambiguity(&[]).await,
            TurnOutcome::Rejected(RejectReason::NoSourcesSelected)
        );
        assert_eq!(
            d.resolve_ambiguity(&["  ".to_string()]).await,
            TurnOutcome::Rejected(RejectReason::NoSourcesSelected)
        );
        assert_eq!(d.log().len(), before);
        assert_eq!(d.phase(), DispatchPhase::AmbiguityPending);
        assert!(d.pending_clarification().is_some());
    }

    #[tokio::test]
    async fn resolve_without_pending_clarification_is_rejected() {
        let server = mockito::Server::new_async().await;
        let (d, _) = dispatcher(&server);
        assert_eq!(
            d.resolve_ambiguity(&["sales".to_string()]).await,
            TurnOutcome::Rejected(RejectReason::NothingPending)
        );
        assert!(d.log().is_empty());
    }

    #[tokio::test]
    async fn toggled_selection_drives_resolution() {
        let mut server = mockito::Server::new_async().await;
        let _first = mock_ambiguous(&mut server).await;
        let refined = server
            .mock("POST", "/chat")
            .match_body(chat_body("In the table(s) [orders], show totals"))
            .with_status(200)
            .with_body(r#"{"answer": "20"}"#)
            .create_async()
            .await;
        let (d, _) = dispatcher(&server);
        d.ask("show totals").await;

        assert_eq!(d.toggle_source("sales"), Some(true));
        assert_eq!(d.toggle_source("orders"), Some(true));
        assert_eq!(d.toggle_source("sales"), Some(false));
        assert_eq!(d.toggle_source("customers"), None);

        assert_eq!(d.resolve_selected().await, TurnOutcome::Answered);
        refined.assert_async().await;
    }

    #[tokio::test]
    async fn new_question_abandons_pending_clarification() {
        let mut server = mockito::Server::new_async().await;
        let _first = mock_ambiguous(&mut server).await;
        let _other = server
            .mock("POST", "/chat")
            .match_body(chat_body("count customers"))
            .with_status(200)
            .with_body(r#"{"answer": "7"}"#)
            .create_async()
            .await;
        let (d, _) = dispatcher(&server);
        d.ask("show totals").await;

        assert_eq!(d.ask("count customers").await, TurnOutcome::Answered);
        assert!(d.pending_clarification().is_none());
        assert_eq!(d.toggle_source("sales"), None);
    }

    #[tokio::test]
    async fn clear_resets_everything_and_drops_in_flight_reply() {
        let mut server = mockito::Server::new_async().await;
        let _chat = server
            .mock("POST", "/chat")
            .with_status(200)
            .with_body(r#"{"answer": "late"}"#)
            .create_async()
            .await;
        let (d, _) = dispatcher(&server);

        let (outcome, during) = tokio::join!(d.ask("slow question"), async {
            assert_eq!(d.phase(), DispatchPhase::Sending);
            d.clear();
            d.ask("next question").await
        });
        assert_eq!(outcome, TurnOutcome::Discarded);
        assert_eq!(during, TurnOutcome::Rejected(RejectReason::Busy));
        assert!(d.log().is_empty());
        assert_eq!(d.phase(), DispatchPhase::Idle);

        assert_eq!(d.ask("next question").await, TurnOutcome::Answered);
        assert_eq!(d.log().len(), 2);
    }

    #[tokio::test]
    async fn retired_turn_still_honours_unauthorized() {
        let mut server = mockito::Server::new_async().await;
        let _chat = server
            .mock("POST", "/chat")
            .with_status(401)
            .with_body(r#"{"detail": "Invalid session"}"#)
            .create_async()
            .await;
        let (d, session) = dispatcher(&server);

        let (outcome, ()) = tokio::join!(d.ask("q"), async { d.clear() });
        assert_eq!(outcome, TurnOutcome::Discarded);
        assert_eq!(session.current_credential(), None);
        assert!(d.log().is_empty());
        assert_eq!(d.ask("q").await, TurnOutcome::Rejected(RejectReason::NotSignedIn));
    }

    #[tokio::test]
    async fn question_text_is_sent_verbatim_apart_from_trimming() {
        let mut server = mockito::Server::new_async().await;
        let chat = server
            .mock("POST", "/chat")
            .match_body(chat_body("rows where city = 'New  York'"))
            .with_status(200)
            .with_body(r#"{"answer": "none"}"#)
            .expect(1)
            .create_async()
            .await;
        let (d, _) = dispatcher(&server);

        assert_eq!(d.ask("  rows where city = 'New  York'\n").await, TurnOutcome::Answered);
        assert_eq!(d.log().entries()[0], ChatEntry::user("rows where city = 'New  York'"));
        chat.assert_async().await;
    }

    #[tokio::test]
    async fn missing_answer_uses_fallback_text() {
        let mut server = mockito::Server::new_async().await;
        let _chat = server
            .mock("POST", "/chat")
            .with_status(200)
            .with_body(r#"{"sql": "SELECT 1", "data": [{"?column?": 1}]}"#)
            .create_async()
            .await;
        let (d, _) = dispatcher(&server);

        assert_eq!(d.ask("anything").await, TurnOutcome::Answered);
        assert_eq!(d.log().last().unwrap().content(), NO_ANSWER_FALLBACK);
    }
}
