//! Chat turn orchestration.
//!
//! One turn runs through
//! `Idle → Embedding → Retrieving → Assembling → Streaming → Persisting → Done`;
//! any step may end in `Failed`, and a caller that hangs up mid-stream ends it
//! in `Cancelled`.
//!
//! The turn is split in two so the HTTP layer can pick a status code before
//! any bytes are sent:
//! - [`ChatOrchestrator::prepare`] validates the request, retrieves context,
//!   opens the model stream and then persists the user message.
//! - [`PreparedTurn::stream_to`] forwards fragments to an `mpsc` channel and,
//!   once the model finishes, persists the assistant message.
//!
//! Dropping the receiving half of the channel cancels the turn: the model
//! stream is dropped (closing the provider connection) and no assistant
//! message is stored.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::auth::authorize_document;
use crate::completion::{ChatModel, PromptMessage, TokenStream};
use crate::config::Config;
use crate::context::assemble;
use crate::error::{Error, Result};
use crate::models::{ChatTurn, Role};
use crate::retrieval::Retriever;
use crate::store::{SearchFilter, Store};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant that helps users find information in their documents.
Format your responses using markdown for better readability:

- Use **bold** for emphasis and important terms
- Use `code blocks` for technical terms, commands, or code snippets
- Use bullet points or numbered lists for multiple items
- Use tables when comparing or listing structured data
- Use ### for section headers
- Use > for important quotes or callouts
- Include syntax highlighting for code blocks using ```language\n code ```

Keep responses concise and well-structured. If you don't know the answer, say so - don't make up information.
Always ensure your markdown formatting is correct and enhances readability.";

/// Prefix of the system message carrying retrieved context.
pub const CONTEXT_PREFIX: &str = "Context from documents:\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnState {
    Idle,
    Embedding,
    Retrieving,
    Assembling,
    Streaming,
    Persisting,
    Done,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub document_id: String,
    /// Authenticated caller. Must own the document.
    pub user_id: String,
    /// Must equal the document's storage key.
    pub file_name: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The model finished. `persisted` is false if storing the assistant
    /// message failed; the caller already received the full text.
    Completed { text: String, persisted: bool },
    /// The receiver went away before the model finished.
    Cancelled { fragments_sent: usize },
}

#[derive(Debug, Clone)]
pub struct TurnReport {
    pub outcome: TurnOutcome,
    pub transitions: Vec<TurnState>,
}

#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub top_k: usize,
    pub context_budget: usize,
    /// Longest allowed gap between two streamed fragments.
    pub inactivity_timeout: Duration,
    pub system_prompt: String,
}

impl ChatSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            top_k: config.retrieval.top_k,
            context_budget: config.retrieval.context_budget_bytes,
            inactivity_timeout: Duration::from_secs(config.completion.inactivity_timeout_secs),
            system_prompt: config
                .completion
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
        }
    }
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            context_budget: crate::context::DEFAULT_CONTEXT_BUDGET,
            inactivity_timeout: Duration::from_secs(30),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// Ordered record of a turn's state changes.
#[derive(Debug, Clone)]
struct Transitions {
    document_id: String,
    states: Vec<TurnState>,
}

impl Transitions {
    fn new(document_id: &str) -> Self {
        Self {
            document_id: document_id.to_string(),
            states: vec![TurnState::Idle],
        }
    }

    fn enter(&mut self, state: TurnState) {
        tracing::debug!(document_id = %self.document_id, ?state, "chat turn");
        self.states.push(state);
    }

    fn fail(&mut self, err: Error) -> Error {
        let from = self.states.last().copied().unwrap_or(TurnState::Idle);
        tracing::warn!(document_id = %self.document_id, ?from, "chat turn failed: {}", err);
        self.enter(TurnState::Failed);
        err
    }
}

pub struct ChatOrchestrator {
    store: Arc<dyn Store>,
    retriever: Arc<Retriever>,
    model: Arc<dyn ChatModel>,
    settings: ChatSettings,
}

impl ChatOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        retriever: Arc<Retriever>,
        model: Arc<dyn ChatModel>,
        settings: ChatSettings,
    ) -> Self {
        Self {
            store,
            retriever,
            model,
            settings,
        }
    }

    /// Everything up to and including opening the model stream. On error
    /// nothing has been streamed or stored.
    pub async fn prepare(&self, request: ChatRequest) -> Result<PreparedTurn> {
        let mut transitions = Transitions::new(&request.document_id);
        match self.prepare_inner(&request, &mut transitions).await {
            Ok((prompt, stream)) => Ok(PreparedTurn {
                store: self.store.clone(),
                request,
                prompt,
                stream,
                inactivity_timeout: self.settings.inactivity_timeout,
                transitions,
            }),
            Err(e) => Err(transitions.fail(e)),
        }
    }

    async fn prepare_inner(
        &self,
        request: &ChatRequest,
        transitions: &mut Transitions,
    ) -> Result<(Vec<PromptMessage>, TokenStream)> {
        if request.message.trim().is_empty() {
            return Err(Error::InvalidRequest("message is empty".to_string()));
        }

        let doc = self
            .store
            .get_document(&request.document_id)
            .await?
            .ok_or_else(|| Error::NotFound(request.document_id.clone()))?;
        authorize_document(&request.user_id, &doc)?;
        if doc.storage_key != request.file_name {
            return Err(Error::InvalidRequest(
                "file_name does not match document".to_string(),
            ));
        }

        let history = self.store.transcript(&doc.id).await?;

        transitions.enter(TurnState::Embedding);
        let query_vec = self.retriever.embed_query(&request.message).await?;

        transitions.enter(TurnState::Retrieving);
        let filter = SearchFilter {
            file_name: request.file_name.clone(),
            user_id: Some(request.user_id.clone()),
            document_id: None,
        };
        let hits = self
            .retriever
            .search(&filter, &query_vec, self.settings.top_k)
            .await?;

        transitions.enter(TurnState::Assembling);
        let texts: Vec<&str> = hits.iter().map(|h| h.content.as_str()).collect();
        let context = assemble(&texts, self.settings.context_budget);
        let prompt = build_prompt(&self.settings.system_prompt, &context, &history, &request.message);

        transitions.enter(TurnState::Streaming);
        let stream = self.model.stream_chat(&prompt).await?;

        // Stored only once the model has accepted the prompt, so a failed
        // turn leaves no unanswered question behind. The stream is dropped
        // unread if this fails.
        self.store
            .append_turn(&ChatTurn::new(
                &request.user_id,
                &doc.id,
                Role::User,
                request.message.clone(),
            ))
            .await?;
        tracing::info!(
            document_id = %doc.id,
            model = self.model.model_name(),
            chunks = hits.len(),
            context_bytes = context.len(),
            history = history.len(),
            "chat stream opened"
        );

        Ok((prompt, stream))
    }

    /// [`prepare`](Self::prepare) followed by [`PreparedTurn::stream_to`].
    pub async fn run_turn(&self, request: ChatRequest, sink: mpsc::Sender<String>) -> Result<TurnReport> {
        self.prepare(request).await?.stream_to(sink).await
    }
}

/// System instructions, retrieved context, stored history, new message.
pub fn build_prompt(
    system_prompt: &str,
    context: &str,
    history: &[ChatTurn],
    message: &str,
) -> Vec<PromptMessage> {
    let mut prompt = Vec::with_capacity(history.len() + 3);
    prompt.push(PromptMessage::system(system_prompt));
    prompt.push(PromptMessage::system(format!("{}{}", CONTEXT_PREFIX, context)));
    for turn in history {
        prompt.push(match turn.role {
            Role::User => PromptMessage::user(turn.content.clone()),
            Role::Assistant => PromptMessage::assistant(turn.content.clone()),
        });
    }
    prompt.push(PromptMessage::user(message));
    prompt
}

/// A turn whose model stream is open but not yet consumed.
pub struct PreparedTurn {
    store: Arc<dyn Store>,
    request: ChatRequest,
    prompt: Vec<PromptMessage>,
    stream: TokenStream,
    inactivity_timeout: Duration,
    transitions: Transitions,
}

impl PreparedTurn {
    pub fn prompt(&self) -> &[PromptMessage] {
        &self.prompt
    }

    pub fn transitions(&self) -> &[TurnState] {
        &self.transitions.states
    }

    /// Forwards fragments to `sink` as they arrive, then stores the full
    /// answer. Returns `Cancelled` as soon as `sink`'s receiver is dropped.
    pub async fn stream_to(self, sink: mpsc::Sender<String>) -> Result<TurnReport> {
        let PreparedTurn {
            store,
            request,
            mut stream,
            inactivity_timeout,
            mut transitions,
            ..
        } = self;

        let mut text = String::new();
        let mut fragments_sent = 0usize;

        loop {
            let next = tokio::select! {
                biased;
                _ = sink.closed() => None,
                item = tokio::time::timeout(inactivity_timeout, stream.next()) => Some(item),
            };

            let item = match next {
                None => {
                    return Ok(cancelled(stream, transitions, fragments_sent));
                }
                Some(Err(_)) => {
                    return Err(transitions.fail(Error::Timeout {
                        operation: "completion stream",
                        after: inactivity_timeout,
                    }));
                }
                Some(Ok(item)) => item,
            };

            match item {
                None => break,
                Some(Err(e)) => return Err(transitions.fail(e.into())),
                Some(Ok(fragment)) => {
                    text.push_str(&fragment);
                    if sink.send(fragment).await.is_err() {
                        return Ok(cancelled(stream, transitions, fragments_sent));
                    }
                    fragments_sent += 1;
                }
            }
        }
        drop(stream);

        transitions.enter(TurnState::Persisting);
        let turn = ChatTurn::new(&request.user_id, &request.document_id, Role::Assistant, text.clone());
        let persisted = match store.append_turn(&turn).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    document_id = %request.document_id,
                    "failed to persist assistant turn: {}",
                    Error::Persistence(e)
                );
                false
            }
        };

        transitions.enter(TurnState::Done);
        tracing::info!(
            document_id = %request.document_id,
            fragments = fragments_sent,
            chars = text.chars().count(),
            persisted,
            "chat turn complete"
        );

        Ok(TurnReport {
            outcome: TurnOutcome::Completed { text, persisted },
            transitions: transitions.states,
        })
    }
}

fn cancelled(stream: TokenStream, mut transitions: Transitions, fragments_sent: usize) -> TurnReport {
    // Dropping the stream closes the provider connection.
    drop(stream);
    transitions.enter(TurnState::Cancelled);
    tracing::info!(
        document_id = %transitions.document_id,
        fragments_sent,
        "chat turn cancelled by client"
    );
    TurnReport {
        outcome: TurnOutcome::Cancelled { fragments_sent },
        transitions: transitions.states,
    }
}
