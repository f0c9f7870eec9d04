//! The chat orchestrator: one conversation, one turn at a time.
//!
//! A turn goes through two phases. `begin_send`/`begin_rerun` update the
//! message log, assemble the request and create the empty assistant
//! placeholder. `drive` then consumes the provider's event stream, applying
//! each delta to the placeholder and recording usage when the stream
//! completes.
//!
//! ```text
//! Composing -> Sent -> Streaming -> { Completed | Stopped | Errored }
//! ```
//!
//! Only one turn may be in flight; a second `begin_*` call is rejected with
//! [`Error::TurnInProgress`] until the first has been driven or abandoned.

use std::sync::Arc;
use std::time::Duration;

use parlance_config::{AppConfig, SamplingConfig};
use parlance_core::error::{Error, ProviderError, Result};
use parlance_core::memory::{DocumentChunk, Memory};
use parlance_core::message::{Conversation, ConversationId, Message, Role};
use parlance_core::provider::{
    CompletionRequest, ModelCatalog, Provider, SamplingParams, StreamEvent, Usage,
};
use parlance_core::store::{self, KeyValueStore, StoreKey};
use parlance_memory::{ChunkOptions, DocumentLibrary, RetrievalEngine};
use parlance_providers::OpenAiCompatProvider;
use parlance_telemetry::{PricingTable, SessionUsage, UsageAccountant, token_cost};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::{AssembledContext, AssemblyInput, AssemblyMetadata, ContextAssembler};
use crate::stream_event::{TurnEvent, TurnOutcome};

/// Per-turn context selection.
#[derive(Debug, Clone, Default)]
pub struct TurnOptions {
    /// Memories attached explicitly. Memories whose trigger words occur in
    /// the input are attached as well.
    pub memory_ids: Vec<String>,
    /// Document sources retrieval may draw from.
    pub documents: Vec<String>,
}

impl TurnOptions {
    pub fn with_memories<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.memory_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_documents<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.documents = sources.into_iter().map(Into::into).collect();
        self
    }
}

/// A turn whose placeholder exists but whose stream has not been opened.
///
/// Consumed by [`ChatOrchestrator::drive`] or [`ChatOrchestrator::abandon`].
pub struct PendingTurn {
    message_id: String,
    api_key: String,
    request: CompletionRequest,
    metadata: AssemblyMetadata,
}

impl PendingTurn {
    /// Id of the assistant placeholder.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn model(&self) -> &str {
        &self.request.model
    }

    pub fn request(&self) -> &CompletionRequest {
        &self.request
    }

    pub fn metadata(&self) -> &AssemblyMetadata {
        &self.metadata
    }
}

/// What happened during one driven turn.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub message_id: String,
    pub outcome: TurnOutcome,
    /// Final usage, present only for completed turns.
    pub usage: Option<Usage>,
    /// Cost of this request in USD; 0 when the model has no known pricing.
    pub cost: f64,
    pub metadata: AssemblyMetadata,
}

struct TurnSettings {
    model: String,
    sampling: SamplingParams,
    api_key: String,
}

pub struct ChatOrchestrator {
    provider: Arc<dyn Provider>,
    catalog: Arc<dyn ModelCatalog>,
    store: Arc<dyn KeyValueStore>,
    config: AppConfig,
    assembler: ContextAssembler,
    retrieval: RetrievalEngine,
    library: DocumentLibrary,
    accountant: UsageAccountant,
    pricing: PricingTable,
    memories: Vec<Memory>,
    conversation: Conversation,
    active: Option<String>,
    pacing: Duration,
    observer: Option<mpsc::UnboundedSender<TurnEvent>>,
}

impl ChatOrchestrator {
    /// Create an orchestrator over a fresh conversation.
    ///
    /// Loads the usage table and memories from `store`. Fails on invalid
    /// chunking settings or unreadable stored state.
    pub async fn new(
        provider: Arc<dyn Provider>,
        catalog: Arc<dyn ModelCatalog>,
        store: Arc<dyn KeyValueStore>,
        config: AppConfig,
    ) -> Result<Self> {
        let options = ChunkOptions::new(config.context.chunk_size, config.context.chunk_overlap)?;
        let library = DocumentLibrary::new(store.clone(), options)?;
        let accountant = UsageAccountant::load(store.clone()).await?;
        let memories: Vec<Memory> = store::load(store.as_ref(), &StoreKey::Memories)
            .await?
            .unwrap_or_default();

        debug!(
            provider = provider.name(),
            store = store.name(),
            memories = memories.len(),
            "Chat orchestrator ready"
        );

        Ok(Self {
            assembler: ContextAssembler::from_config(&config.context),
            pricing: PricingTable::from_config(&config.telemetry),
            pacing: Duration::from_millis(config.stream.pacing_delay_ms),
            retrieval: RetrievalEngine::new(),
            conversation: Conversation::new(),
            active: None,
            observer: None,
            provider,
            catalog,
            store,
            config,
            library,
            accountant,
            memories,
        })
    }

    /// Create an orchestrator talking to the endpoint named in `config`.
    pub async fn connect(config: AppConfig, store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let endpoint = Arc::new(OpenAiCompatProvider::from_config(&config));
        Self::new(endpoint.clone(), endpoint, store, config).await
    }

    /// Forward [`TurnEvent`]s to `observer`.
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<TurnEvent>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Switch to conversation `id`, loading its persisted log.
    pub async fn open_conversation(&mut self, id: ConversationId) -> Result<()> {
        self.ensure_idle()?;
        let messages: Vec<Message> =
            store::load(self.store.as_ref(), &StoreKey::Messages(id.clone()))
                .await?
                .unwrap_or_default();

        debug!(conversation_id = %id, messages = messages.len(), "Conversation opened");
        let mut conversation = Conversation::with_id(id);
        conversation.messages = messages;
        self.conversation = conversation;
        Ok(())
    }

    // ── Turns ────────────────────────────────────────────────────────────

    /// Chunks of the selected documents. An unreadable document store only
    /// costs the turn its document context.
    async fn document_chunks(&self, sources: &[String]) -> Vec<DocumentChunk> {
        match self.library.chunks_for(sources).await {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!(error = %e, "Document store unreadable; continuing without document context");
                Vec::new()
            }
        }
    }

    /// Append `text` as a user message and prepare the reply.
    pub async fn begin_send(&mut self, text: &str, options: &TurnOptions) -> Result<PendingTurn> {
        self.ensure_idle()?;
        let settings = self.resolve_settings().await;
        let chunks = self.document_chunks(&options.documents).await;

        let selected = self.select_memories(&options.memory_ids, text);
        self.record_memory_use(&selected).await;

        let context = self.assembler.assemble(
            &AssemblyInput {
                system_prompt: self.config.system_prompt.as_deref(),
                memories: &selected,
                document_chunks: &chunks,
                history: &self.conversation.messages,
                user_message: Some(text),
            },
            &mut self.retrieval,
        );

        self.conversation.push(Message::user(text));
        Ok(self.open_turn(settings, context))
    }

    /// Re-stream the reply to a user message.
    ///
    /// `None` picks the last user message. Everything after it is dropped.
    /// No user message is added and memory use counts are left alone.
    pub async fn begin_rerun(
        &mut self,
        user_message_id: Option<&str>,
        options: &TurnOptions,
    ) -> Result<PendingTurn> {
        self.ensure_idle()?;

        let index = match user_message_id {
            Some(id) => {
                let index = self
                    .conversation
                    .position(id)
                    .ok_or_else(|| Error::MessageNotFound(id.to_string()))?;
                if self.conversation.messages[index].role != Role::User {
                    return Err(Error::NothingToRerun(format!("{id} is not a user message")));
                }
                index
            }
            None => self
                .conversation
                .messages
                .iter()
                .rposition(|m| m.role == Role::User)
                .ok_or_else(|| Error::NothingToRerun("conversation has no user message".into()))?,
        };

        let settings = self.resolve_settings().await;
        let chunks = self.document_chunks(&options.documents).await;
        let selected = {
            let query = &self.conversation.messages[index].content;
            self.select_memories(&options.memory_ids, query)
        };

        self.conversation.truncate_after(index);

        let context = self.assembler.assemble(
            &AssemblyInput {
                system_prompt: self.config.system_prompt.as_deref(),
                memories: &selected,
                document_chunks: &chunks,
                history: &self.conversation.messages,
                user_message: None,
            },
            &mut self.retrieval,
        );

        Ok(self.open_turn(settings, context))
    }

    /// Stream the reply for `turn` into its placeholder.
    ///
    /// Always ends the turn: the outcome is reported rather than returned
    /// as an error, and the log is persisted.
    pub async fn drive(&mut self, turn: PendingTurn, cancel: CancellationToken) -> TurnReport {
        let PendingTurn {
            message_id,
            api_key,
            request,
            metadata,
        } = turn;
        let model = request.model.clone();

        let mut report = TurnReport {
            message_id: message_id.clone(),
            outcome: TurnOutcome::Errored,
            usage: None,
            cost: 0.0,
            metadata,
        };

        report.outcome = match self.provider.stream(&api_key, request, cancel).await {
            Ok(mut events) => {
                self.consume(&mut events, &model, &api_key, &mut report)
                    .await
            }
            Err(e) => {
                self.apply_failure(&message_id, &e);
                TurnOutcome::Errored
            }
        };

        self.active = None;
        self.persist_messages().await;

        info!(
            conversation_id = %self.conversation.id,
            model = %model,
            outcome = ?report.outcome,
            tokens = report.usage.map(|u| u.total_tokens).unwrap_or(0),
            cost = report.cost,
            "Turn finished"
        );
        self.emit(TurnEvent::Finished {
            message_id,
            outcome: report.outcome,
        });
        report
    }

    /// `begin_send` followed by `drive`.
    pub async fn send(
        &mut self,
        text: &str,
        options: &TurnOptions,
        cancel: CancellationToken,
    ) -> Result<TurnReport> {
        let turn = self.begin_send(text, options).await?;
        Ok(self.drive(turn, cancel).await)
    }

    /// `begin_rerun` followed by `drive`.
    pub async fn rerun(
        &mut self,
        user_message_id: Option<&str>,
        options: &TurnOptions,
        cancel: CancellationToken,
    ) -> Result<TurnReport> {
        let turn = self.begin_rerun(user_message_id, options).await?;
        Ok(self.drive(turn, cancel).await)
    }

    /// Give up on a turn that was never driven. An untouched placeholder is
    /// removed.
    pub async fn abandon(&mut self, turn: PendingTurn) {
        let untouched = self
            .conversation
            .get(&turn.message_id)
            .is_some_and(|m| m.content.is_empty());
        if untouched {
            self.conversation.remove(&turn.message_id);
        }
        self.active = None;
        self.persist_messages().await;
    }

    fn open_turn(&mut self, settings: TurnSettings, context: AssembledContext) -> PendingTurn {
        let placeholder = Message::assistant("");
        let message_id = placeholder.id.clone();
        self.conversation.push(placeholder);
        self.active = Some(message_id.clone());

        debug!(
            conversation_id = %self.conversation.id,
            model = %settings.model,
            messages = context.messages.len(),
            estimated_tokens = context.metadata.total_tokens,
            chunks = context.metadata.chunks_retrieved,
            "Turn prepared"
        );
        self.emit(TurnEvent::Started {
            conversation_id: self.conversation.id.to_string(),
            message_id: message_id.clone(),
        });

        PendingTurn {
            message_id,
            api_key: settings.api_key,
            request: CompletionRequest {
                model: settings.model,
                messages: context.messages,
                sampling: settings.sampling,
            },
            metadata: context.metadata,
        }
    }

    async fn consume(
        &mut self,
        events: &mut mpsc::Receiver<StreamEvent>,
        model: &str,
        api_key: &str,
        report: &mut TurnReport,
    ) -> TurnOutcome {
        let message_id = report.message_id.clone();

        while let Some(event) = events.recv().await {
            match event {
                StreamEvent::Chunk(delta) => {
                    if !self.pacing.is_zero() {
                        tokio::time::sleep(self.pacing).await;
                    }
                    self.apply_delta(&message_id, delta);
                }
                StreamEvent::UsageFinal(usage) => {
                    report.cost = self.account(model, api_key, usage).await;
                    report.usage = Some(usage);
                }
                StreamEvent::Done => return TurnOutcome::Completed,
                StreamEvent::Aborted => return TurnOutcome::Stopped,
                StreamEvent::Error(e) => {
                    self.apply_failure(&message_id, &e);
                    return TurnOutcome::Errored;
                }
            }
        }

        let e = ProviderError::StreamInterrupted("event channel closed before completion".into());
        self.apply_failure(&message_id, &e);
        TurnOutcome::Errored
    }

    fn apply_delta(&mut self, message_id: &str, delta: String) {
        match self.conversation.get_mut(message_id) {
            Some(message) => message.content.push_str(&delta),
            None => {
                debug!(message_id, "Placeholder removed; dropping delta");
                return;
            }
        }
        self.emit(TurnEvent::Delta {
            message_id: message_id.to_string(),
            content: delta,
        });
    }

    /// Write the error text into the placeholder, or append it as a new
    /// reply if the placeholder is gone.
    fn apply_failure(&mut self, message_id: &str, error: &ProviderError) {
        let text = format!("Error: {error}");
        warn!(conversation_id = %self.conversation.id, error = %error, "Turn failed");

        let target = if let Some(message) = self.conversation.get_mut(message_id) {
            message.content = text.clone();
            message_id.to_string()
        } else {
            let message = Message::assistant(text.clone());
            let id = message.id.clone();
            self.conversation.push(message);
            id
        };

        self.emit(TurnEvent::Error {
            message_id: target,
            message: text,
        });
    }

    async fn account(&mut self, model: &str, api_key: &str, usage: Usage) -> f64 {
        let credential = Some(api_key).filter(|k| !k.trim().is_empty());
        let pricing = self
            .pricing
            .resolve(model, self.catalog.as_ref(), credential)
            .await;

        // Price with what the record holds so the reported cost matches the
        // session total when no fresh pricing was resolved.
        let pricing = match self.accountant.record(model, usage, pricing).await {
            Ok(record) => record.pricing,
            Err(e) => {
                warn!(model, error = %e, "Failed to persist usage");
                self.accountant.get(model).and_then(|r| r.pricing)
            }
        };

        let cost = token_cost(
            u64::from(usage.prompt_tokens),
            u64::from(usage.completion_tokens),
            u64::from(usage.total_tokens),
            pricing.as_ref(),
        );
        self.emit(TurnEvent::Usage {
            model: model.to_string(),
            usage,
            cost,
        });
        cost
    }

    // ── Message log ──────────────────────────────────────────────────────

    /// Replace the content of a message. The streaming placeholder cannot
    /// be edited.
    pub async fn edit_message(&mut self, id: &str, content: impl Into<String>) -> Result<()> {
        if self.active.as_deref() == Some(id) {
            return Err(Error::TurnInProgress(self.conversation.id.to_string()));
        }
        let message = self
            .conversation
            .get_mut(id)
            .ok_or_else(|| Error::MessageNotFound(id.to_string()))?;
        message.content = content.into();
        self.save_messages().await
    }

    /// Remove a message. Deleting the pending placeholder is allowed; a
    /// failure for that turn is then appended as a new reply.
    pub async fn delete_message(&mut self, id: &str) -> Result<Message> {
        let removed = self
            .conversation
            .remove(id)
            .ok_or_else(|| Error::MessageNotFound(id.to_string()))?;
        self.save_messages().await?;
        Ok(removed)
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn messages(&self) -> &[Message] {
        &self.conversation.messages
    }

    /// Whether a turn is between `begin_*` and the end of `drive`.
    pub fn is_streaming(&self) -> bool {
        self.active.is_some()
    }

    /// Id of the placeholder currently being streamed into.
    pub fn active_message_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    // ── Memories ─────────────────────────────────────────────────────────

    pub fn memories(&self) -> &[Memory] {
        &self.memories
    }

    pub async fn add_memory(&mut self, memory: Memory) -> Result<()> {
        self.memories.push(memory);
        self.save_memories().await
    }

    pub async fn update_memory(&mut self, memory: Memory) -> Result<()> {
        let slot = self
            .memories
            .iter_mut()
            .find(|m| m.id == memory.id)
            .ok_or_else(|| Error::MemoryNotFound(memory.id.clone()))?;
        *slot = memory;
        self.save_memories().await
    }

    pub async fn remove_memory(&mut self, id: &str) -> Result<Memory> {
        let index = self
            .memories
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| Error::MemoryNotFound(id.to_string()))?;
        let removed = self.memories.remove(index);
        self.save_memories().await?;
        Ok(removed)
    }

    /// Explicitly selected memories plus those triggered by `input`, in
    /// stored order.
    fn select_memories(&self, explicit: &[String], input: &str) -> Vec<Memory> {
        self.memories
            .iter()
            .filter(|m| explicit.contains(&m.id) || m.is_triggered_by(input))
            .cloned()
            .collect()
    }

    async fn record_memory_use(&mut self, selected: &[Memory]) {
        if selected.is_empty() {
            return;
        }
        for memory in &mut self.memories {
            if selected.iter().any(|s| s.id == memory.id) {
                memory.use_count += 1;
            }
        }
        if let Err(e) = self.save_memories().await {
            warn!(error = %e, "Failed to persist memory use counts");
        }
    }

    // ── Documents ────────────────────────────────────────────────────────

    /// Chunk and store a document. Re-adding a source replaces it.
    /// Returns the number of chunks stored.
    pub async fn add_document(&mut self, source_name: &str, text: &str) -> Result<usize> {
        let (added, replaced) = self.library.add_document(source_name, text).await?;
        self.retrieval.forget(replaced.iter().map(String::as_str));
        Ok(added.len())
    }

    /// Drop a document and its cached fingerprints.
    pub async fn remove_document(&mut self, source_name: &str) -> Result<usize> {
        let removed = self.library.remove_document(source_name).await?;
        self.retrieval.forget(removed.iter().map(String::as_str));
        Ok(removed.len())
    }

    pub async fn documents(&self) -> Result<Vec<String>> {
        self.library.sources().await
    }

    // ── Settings ─────────────────────────────────────────────────────────

    pub async fn select_model(&self, model: &str) -> Result<()> {
        store::save(self.store.as_ref(), &StoreKey::SelectedModel, model).await?;
        Ok(())
    }

    pub async fn set_api_key(&self, api_key: &str) -> Result<()> {
        store::save(self.store.as_ref(), &StoreKey::ApiKey, api_key).await?;
        Ok(())
    }

    pub async fn set_sampling(&self, sampling: &SamplingConfig) -> Result<()> {
        store::save(self.store.as_ref(), &StoreKey::LlmConfig, sampling).await?;
        Ok(())
    }

    /// Model, sampling and credential for the next turn: stored values
    /// first, configuration defaults otherwise.
    async fn resolve_settings(&self) -> TurnSettings {
        let model = self
            .setting::<String>(StoreKey::SelectedModel)
            .await
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.config.default_model.clone());
        let sampling = self
            .setting::<SamplingConfig>(StoreKey::LlmConfig)
            .await
            .unwrap_or_else(|| self.config.sampling.clone())
            .to_params();
        let api_key = self
            .setting::<String>(StoreKey::ApiKey)
            .await
            .filter(|k| !k.trim().is_empty())
            .or_else(|| self.config.api_key.clone())
            .unwrap_or_default();

        TurnSettings {
            model,
            sampling,
            api_key,
        }
    }

    async fn setting<T: DeserializeOwned>(&self, key: StoreKey) -> Option<T> {
        match store::load(self.store.as_ref(), &key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "Ignoring unreadable setting");
                None
            }
        }
    }

    // ── Usage ────────────────────────────────────────────────────────────

    pub fn usage(&self) -> &UsageAccountant {
        &self.accountant
    }

    pub fn session_usage(&self) -> SessionUsage {
        self.accountant.session()
    }

    pub fn reset_session_usage(&mut self) {
        self.accountant.reset_session();
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn ensure_idle(&self) -> Result<()> {
        match self.active {
            Some(_) => Err(Error::TurnInProgress(self.conversation.id.to_string())),
            None => Ok(()),
        }
    }

    fn emit(&self, event: TurnEvent) {
        if let Some(observer) = &self.observer {
            let _ = observer.send(event);
        }
    }

    async fn save_messages(&self) -> Result<()> {
        let key = StoreKey::Messages(self.conversation.id.clone());
        store::save(self.store.as_ref(), &key, &self.conversation.messages).await?;
        Ok(())
    }

    async fn persist_messages(&self) {
        if let Err(e) = self.save_messages().await {
            warn!(conversation_id = %self.conversation.id, error = %e, "Failed to persist messages");
        }
    }

    async fn save_memories(&self) -> Result<()> {
        store::save(self.store.as_ref(), &StoreKey::Memories, &self.memories).await?;
        Ok(())
    }
}
