//! Question answering over a snapshot.
//!
//! Every question rebuilds its context from scratch: recent turns of the
//! session, code retrieved for the question, and the most relevant
//! findings of the snapshot's latest analysis report, trimmed to the
//! configured budget. Requests against the same session are serialized
//! within a process; the store assigns turn indexes, so separate processes
//! sharing a session still get dense, distinct indexes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use chrono::Utc;
use tracing::{debug, info, warn};

use codescope_core::context::{assemble_context, rank_excerpts, ContextBlock, ContextBudget};
use codescope_core::generation::{GenerationConfig, Generator};
use codescope_core::retrieve::{RetrievalFilters, Retriever};
use codescope_core::session::{ConversationSession, ConversationTurn};
use codescope_core::store::Store;

use crate::config::ChatConfig;

const CHAT_SYSTEM_PROMPT: &str = "You are a code assistant. Answer concisely and directly \
using the provided context. Cite sources by their path when you rely on them. \
If the context does not contain the answer, say so.";

const CHAT_MAX_OUTPUT_TOKENS: u32 = 1500;

type SessionKey = (String, String);

pub struct ChatService {
    store: Arc<dyn Store>,
    retriever: Arc<Retriever>,
    generator: Arc<dyn Generator>,
    config: ChatConfig,
    k: usize,
    temperature: f32,
    owner: String,
    locks: Mutex<HashMap<SessionKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChatService {
    pub fn new(
        store: Arc<dyn Store>,
        retriever: Arc<Retriever>,
        generator: Arc<dyn Generator>,
        config: ChatConfig,
        k: usize,
        temperature: f32,
    ) -> Self {
        Self {
            store,
            retriever,
            generator,
            config,
            k,
            temperature,
            owner: std::env::var("USER").unwrap_or_else(|_| "local".to_string()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_services(services: &crate::services::Services) -> Self {
        Self::new(
            Arc::clone(&services.store),
            Arc::clone(&services.retriever),
            Arc::clone(&services.generator),
            services.config.chat.clone(),
            services.config.retrieval.k,
            services.config.generation.temperature,
        )
    }

    fn session_lock(&self, snapshot_id: &str, session_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| anyhow!("session lock table poisoned"))?;
        Ok(Arc::clone(
            locks
                .entry((snapshot_id.to_string(), session_id.to_string()))
                .or_default(),
        ))
    }

    pub async fn load_session(&self, snapshot_id: &str, session_id: &str) -> Result<ConversationSession> {
        let turns = self.store.list_turns(session_id, snapshot_id).await?;
        Ok(ConversationSession::from_turns(
            session_id,
            snapshot_id,
            self.owner.clone(),
            turns,
        ))
    }

    /// Build the context block for `question`.
    ///
    /// Missing index or report data shrinks the block; it never fails the
    /// question.
    pub async fn assemble(
        &self,
        question: &str,
        session: &ConversationSession,
        snapshot_id: &str,
        budget: ContextBudget,
    ) -> ContextBlock {
        let turns = session.recent(self.config.history_turns);
        let chunks = self
            .retriever
            .retrieve(snapshot_id, question, self.k, &RetrievalFilters::default())
            .await;

        let excerpts = match self.store.latest_report(snapshot_id).await {
            Ok(Some(report)) => rank_excerpts(question, report.excerpts(self.config.excerpt_chars)),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(snapshot = snapshot_id, error = %e, "could not load the latest report");
                Vec::new()
            }
        };

        let block = assemble_context(turns, chunks, excerpts, budget, self.config.item_limits());
        debug!(snapshot = snapshot_id, context = %block.summary(), "context assembled");
        block
    }

    /// Answer `question` and append the turn to the session.
    pub async fn ask(&self, snapshot_id: &str, session_id: &str, question: &str) -> Result<ConversationTurn> {
        let lock = self.session_lock(snapshot_id, session_id)?;
        let _guard = lock.lock().await;

        let mut session = self.load_session(snapshot_id, session_id).await?;
        let block = self
            .assemble(
                question,
                &session,
                snapshot_id,
                ContextBudget::tokens(self.config.budget_tokens),
            )
            .await;

        let prompt = render_prompt(&block, question);
        let config = GenerationConfig {
            max_output_tokens: CHAT_MAX_OUTPUT_TOKENS,
            temperature: self.temperature,
            role_system_prompt: CHAT_SYSTEM_PROMPT.to_string(),
        };
        let answer = self.generator.generate(&prompt, &config).await?;

        let mut turn = session
            .append(
                question,
                block.summary(),
                answer,
                block.used_chunk_ids(),
                Utc::now().timestamp(),
            )
            .clone();
        // Another process may have answered in the same session meanwhile;
        // the store decides the final index.
        turn.index = self.store.append_turn(session_id, snapshot_id, &turn).await?;
        info!(snapshot = snapshot_id, session = session_id, turn = turn.index, "question answered");
        Ok(turn)
    }

    /// Drop every turn of a session. Returns how many were removed.
    pub async fn clear(&self, snapshot_id: &str, session_id: &str) -> Result<u64> {
        let lock = self.session_lock(snapshot_id, session_id)?;
        let _guard = lock.lock().await;
        let removed = self.store.clear_session(session_id, snapshot_id).await?;
        info!(snapshot = snapshot_id, session = session_id, removed, "session cleared");
        Ok(removed)
    }
}

fn render_prompt(block: &ContextBlock, question: &str) -> String {
    if block.is_empty() {
        format!("## Question\n{}\n", question)
    } else {
        format!("{}\n## Question\n{}\n", block.render(), question)
    }
}
