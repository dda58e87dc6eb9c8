use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::{mpsc, Mutex};

use crate::context::{
    match_entries, AssemblyInput, HeuristicCounter, LorebookHits, MemoryFragment, MemoryRetriever,
    PromptAssembler,
};
use crate::core::config::{ConfigService, GenerationSettings};
use crate::core::errors::ChatError;
use crate::events::{AppEvent, EventBus};
use crate::sidecar::{CancelHandle, GenerationParams, SidecarSupervisor, StreamEvent};
use crate::store::types::{AuthorType, Character, Conversation, Message, NewMessage, Persona};
use crate::store::Store;

/// Persist the streaming buffer after this many tokens...
const CHECKPOINT_TOKENS: usize = 25;
/// ...or after this much time, whichever comes first.
const CHECKPOINT_INTERVAL: Duration = Duration::from_millis(1000);
/// A stream with no activity for this long is finalized as an error.
const STREAM_STALL_TIMEOUT: Duration = Duration::from_secs(30);
/// How long `regenerate` waits for a cancelled generation to wind down.
const CANCEL_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

const INTERRUPTED_SENTINEL: &str = "[generation interrupted]";

/// Recent messages scanned for lorebook keyword triggers.
const LOREBOOK_WINDOW_MESSAGES: usize = 6;
/// Memory fragments requested from the retriever per turn.
const MEMORY_RETRIEVAL_K: usize = 5;

#[derive(Default)]
struct GenState {
    in_flight: bool,
    current_assistant_msg_id: Option<String>,
    cancel: Option<CancelHandle>,
}

struct ConvEntry {
    /// Serializes user operations for one conversation.
    op_lock: Mutex<()>,
    gen: std::sync::Mutex<GenState>,
}

/// The orchestrator: accepts user input, drives assembly and generation,
/// relays streamed tokens, and finalizes or errors the placeholder message.
/// Operations are serialized per conversation; the sidecar additionally
/// admits one generation at a time process-wide.
#[derive(Clone)]
pub struct ChatEngine {
    store: Store,
    sidecar: SidecarSupervisor,
    config: ConfigService,
    bus: EventBus,
    memory: Option<Arc<dyn MemoryRetriever>>,
    conversations: Arc<Mutex<HashMap<String, Arc<ConvEntry>>>>,
}

impl ChatEngine {
    pub fn new(
        store: Store,
        sidecar: SidecarSupervisor,
        config: ConfigService,
        bus: EventBus,
        memory: Option<Arc<dyn MemoryRetriever>>,
    ) -> Self {
        Self {
            store,
            sidecar,
            config,
            bus,
            memory,
            conversations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    async fn entry(&self, conversation_id: &str) -> Arc<ConvEntry> {
        let mut map = self.conversations.lock().await;
        map.entry(conversation_id.to_string())
            .or_insert_with(|| {
                Arc::new(ConvEntry {
                    op_lock: Mutex::new(()),
                    gen: std::sync::Mutex::new(GenState::default()),
                })
            })
            .clone()
    }

    fn settings(&self) -> Result<GenerationSettings, ChatError> {
        Ok(GenerationSettings::from_config(&self.config.load_config()?))
    }

    /// Create a conversation and seed its root greeting from the first
    /// character, when one is defined.
    pub async fn create_conversation(
        &self,
        character_ids: &[String],
        title: Option<&str>,
        persona_id: Option<&str>,
    ) -> Result<Conversation, ChatError> {
        let conversation = self
            .store
            .create_conversation(character_ids, title, persona_id)
            .await?;

        let first = self.store.get_character(&character_ids[0]).await?;
        if let Some(greeting) = first
            .first_message
            .as_deref()
            .filter(|g| !g.trim().is_empty())
        {
            let persona = self.resolve_persona(&conversation).await?;
            let user_name = persona
                .as_ref()
                .map(|p| p.name.clone())
                .unwrap_or_else(|| crate::context::template::DEFAULT_USER_NAME.to_string());
            let content = crate::context::template::substitute(greeting, &user_name, &first.name);
            let token_count = self.sidecar.token_count(&content).await as i64;
            self.store
                .append_child(
                    &conversation.id,
                    None,
                    NewMessage {
                        author_type: AuthorType::Character,
                        author_id: Some(first.id.clone()),
                        content,
                        token_count,
                        generation_params: None,
                    },
                )
                .await?;
            return self.store.get_conversation(&conversation.id).await;
        }

        Ok(conversation)
    }

    /// Accept user input and launch a generation. Returns the persisted user
    /// message; the reply streams asynchronously over the event bus.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> Result<Message, ChatError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::validation("message must not be empty"));
        }
        let settings = self.settings()?;
        if content.chars().count() > settings.max_message_length {
            return Err(ChatError::validation(format!(
                "message exceeds the {} character limit",
                settings.max_message_length
            )));
        }
        self.require_ready(conversation_id)?;

        let entry = self.entry(conversation_id).await;
        let _guard = entry.op_lock.lock().await;
        self.refuse_if_in_flight(&entry)?;

        let conversation = self.store.get_conversation(conversation_id).await?;
        let token_count = self.sidecar.token_count(content).await as i64;
        let user_message = self
            .store
            .append_child(
                conversation_id,
                conversation.active_message_id.as_deref(),
                NewMessage {
                    author_type: AuthorType::User,
                    author_id: None,
                    content: content.to_string(),
                    token_count,
                    generation_params: None,
                },
            )
            .await?;

        let speaker = self.next_speaker(&conversation).await?;
        self.launch_generation(&entry, &conversation, Some(&user_message.id), speaker, settings)
            .await?;

        Ok(user_message)
    }

    /// Create a new sibling of a character message and regenerate it. The
    /// previous take stays reachable through its branch.
    pub async fn regenerate(&self, message_id: &str) -> Result<Message, ChatError> {
        let target = self.store.get_message(message_id).await?;
        if target.author_type != AuthorType::Character {
            return Err(ChatError::validation(
                "only character messages can be regenerated",
            ));
        }
        self.require_ready(&target.conversation_id)?;

        let entry = self.entry(&target.conversation_id).await;
        let _guard = entry.op_lock.lock().await;
        self.cancel_and_drain(&entry).await?;

        let conversation = self.store.get_conversation(&target.conversation_id).await?;
        let speaker = match target.author_id.as_deref() {
            Some(author_id) => self.store.get_character(author_id).await?,
            None => self.next_speaker(&conversation).await?,
        };

        let settings = self.settings()?;
        self.check_group_budget(&conversation, &speaker, &settings)
            .await;
        let placeholder = self
            .launch_generation(
                &entry,
                &conversation,
                target.parent_id.as_deref(),
                speaker,
                settings,
            )
            .await?;
        Ok(placeholder)
    }

    /// Branch-safe edit: the new content becomes a sibling of the original,
    /// which stays reachable. Editing a user message immediately queues a
    /// fresh reply under the new sibling.
    pub async fn edit(&self, message_id: &str, new_content: &str) -> Result<Message, ChatError> {
        let target = self.store.get_message(message_id).await?;
        if target.author_type == AuthorType::System {
            return Err(ChatError::validation("system messages cannot be edited"));
        }
        let new_content = new_content.trim();
        if new_content.is_empty() {
            return Err(ChatError::validation("message must not be empty"));
        }

        let entry = self.entry(&target.conversation_id).await;
        let _guard = entry.op_lock.lock().await;
        self.refuse_if_in_flight(&entry)?;

        let token_count = self.sidecar.token_count(new_content).await as i64;
        let sibling = self
            .store
            .append_child(
                &target.conversation_id,
                target.parent_id.as_deref(),
                NewMessage {
                    author_type: target.author_type,
                    author_id: target.author_id.clone(),
                    content: new_content.to_string(),
                    token_count,
                    generation_params: None,
                },
            )
            .await?;

        if target.author_type == AuthorType::User {
            // The edit itself stands even when no reply can be generated.
            if self.sidecar.is_ready() {
                let conversation = self.store.get_conversation(&target.conversation_id).await?;
                let speaker = self.next_speaker(&conversation).await?;
                let settings = self.settings()?;
                self.launch_generation(&entry, &conversation, Some(&sibling.id), speaker, settings)
                    .await?;
            } else {
                let _ = self.require_ready(&target.conversation_id);
            }
        }

        Ok(sibling)
    }

    /// Fire the cancel token of the current generation. No-op when nothing is
    /// in flight.
    pub async fn stop_generation(&self) {
        let map = self.conversations.lock().await;
        for entry in map.values() {
            if let Ok(state) = entry.gen.lock() {
                if let Some(cancel) = &state.cancel {
                    if let Some(message_id) = &state.current_assistant_msg_id {
                        tracing::debug!("cancelling generation for message {message_id}");
                    }
                    cancel.cancel();
                }
            }
        }
    }

    pub async fn get_branch_siblings(&self, message_id: &str) -> Result<Vec<Message>, ChatError> {
        self.store.siblings(message_id).await
    }

    /// Switch the active branch. Refused while a generation is in flight.
    pub async fn switch_branch(&self, message_id: &str) -> Result<Vec<Message>, ChatError> {
        let target = self.store.get_message(message_id).await?;
        let entry = self.entry(&target.conversation_id).await;
        let _guard = entry.op_lock.lock().await;
        self.refuse_if_in_flight(&entry)?;
        self.store
            .switch_branch(&target.conversation_id, message_id)
            .await
    }

    pub async fn conversation_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Message>, ChatError> {
        self.store.messages_for_conversation(conversation_id).await
    }

    // -- internals ----------------------------------------------------------

    fn require_ready(&self, conversation_id: &str) -> Result<(), ChatError> {
        if self.sidecar.is_ready() {
            return Ok(());
        }
        let status = self.sidecar.status();
        let error = ChatError::sidecar(format!(
            "the model is not ready ({:?}); start the sidecar first",
            status.status
        ));
        self.bus.emit(AppEvent::ChatError {
            conversation_id: conversation_id.to_string(),
            message_id: None,
            error: error.to_string(),
        });
        Err(error)
    }

    fn refuse_if_in_flight(&self, entry: &ConvEntry) -> Result<(), ChatError> {
        let state = entry
            .gen
            .lock()
            .map_err(|_| ChatError::storage("engine state poisoned"))?;
        if state.in_flight {
            return Err(ChatError::busy(
                "a generation is already in flight for this conversation",
            ));
        }
        Ok(())
    }

    /// Cancel any in-flight generation and wait for the worker to wind down.
    async fn cancel_and_drain(&self, entry: &ConvEntry) -> Result<(), ChatError> {
        let cancel = {
            let state = entry
                .gen
                .lock()
                .map_err(|_| ChatError::storage("engine state poisoned"))?;
            if !state.in_flight {
                return Ok(());
            }
            state.cancel.clone()
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        let deadline = Instant::now() + CANCEL_DRAIN_TIMEOUT;
        loop {
            {
                let state = entry
                    .gen
                    .lock()
                    .map_err(|_| ChatError::storage("engine state poisoned"))?;
                if !state.in_flight {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(ChatError::busy("previous generation did not stop in time"));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn resolve_persona(
        &self,
        conversation: &Conversation,
    ) -> Result<Option<Persona>, ChatError> {
        match conversation.persona_id.as_deref() {
            Some(persona_id) => Ok(Some(self.store.get_persona(persona_id).await?)),
            None => self.store.default_persona().await,
        }
    }

    /// Round-robin speaker selection: the character after the last one that
    /// spoke on the active path, in `character_ids` order.
    async fn next_speaker(&self, conversation: &Conversation) -> Result<Character, ChatError> {
        let ids = &conversation.character_ids;
        if ids.len() == 1 {
            return self.store.get_character(&ids[0]).await;
        }

        let path = self.store.active_path(&conversation.id).await?;
        let last_speaker_idx = path
            .iter()
            .rev()
            .filter(|m| m.author_type == AuthorType::Character)
            .find_map(|m| {
                m.author_id
                    .as_deref()
                    .and_then(|id| ids.iter().position(|c| c == id))
            });
        let next = match last_speaker_idx {
            Some(idx) => (idx + 1) % ids.len(),
            None => 0,
        };
        self.store.get_character(&ids[next]).await
    }

    /// Warn when a group regeneration cannot fit the window at the chosen
    /// speaker.
    async fn check_group_budget(
        &self,
        conversation: &Conversation,
        speaker: &Character,
        settings: &GenerationSettings,
    ) {
        if !conversation.is_group() {
            return;
        }
        if let Ok(input) = self.build_assembly_parts(conversation, speaker, settings, None).await {
            let counter = HeuristicCounter;
            if PromptAssembler::assemble(
                &AssemblyInput {
                    characters: &input.characters,
                    speaker,
                    persona: input.persona.as_ref(),
                    active_path: &input.path,
                    lorebook_hits: input.lorebook_hits.clone(),
                    summaries: &input.summaries,
                    memories: &input.memories,
                    settings,
                },
                &counter,
            )
            .is_err()
            {
                self.bus.emit(AppEvent::ChatWarning {
                    message: format!(
                        "context budget exceeded for speaker {}; older history will be truncated",
                        speaker.name
                    ),
                });
            }
        }
    }

    /// Allocate the placeholder message, mark the conversation in flight,
    /// emit `chat:start`, and hand off to the streaming worker.
    async fn launch_generation(
        &self,
        entry: &Arc<ConvEntry>,
        conversation: &Conversation,
        parent_id: Option<&str>,
        speaker: Character,
        settings: GenerationSettings,
    ) -> Result<Message, ChatError> {
        let placeholder = self
            .store
            .append_child(
                &conversation.id,
                parent_id,
                NewMessage {
                    author_type: AuthorType::Character,
                    author_id: Some(speaker.id.clone()),
                    content: String::new(),
                    token_count: 0,
                    generation_params: Some(json!({
                        "temperature": settings.temperature,
                        "top_p": settings.top_p,
                        "max_tokens": settings.max_tokens,
                    })),
                },
            )
            .await?;

        let cancel = CancelHandle::new();
        {
            let mut state = entry
                .gen
                .lock()
                .map_err(|_| ChatError::storage("engine state poisoned"))?;
            state.in_flight = true;
            state.current_assistant_msg_id = Some(placeholder.id.clone());
            state.cancel = Some(cancel.clone());
        }

        self.bus.emit(AppEvent::ChatStart {
            conversation_id: conversation.id.clone(),
            message_id: placeholder.id.clone(),
        });

        let engine = self.clone();
        let entry = entry.clone();
        let conversation = conversation.clone();
        let placeholder_id = placeholder.id.clone();
        tokio::spawn(async move {
            engine
                .generation_worker(&entry, &conversation, speaker, &placeholder_id, settings, cancel)
                .await;
            let mut state = match entry.gen.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.in_flight = false;
            state.current_assistant_msg_id = None;
            state.cancel = None;
        });

        Ok(placeholder)
    }

    async fn generation_worker(
        &self,
        _entry: &ConvEntry,
        conversation: &Conversation,
        speaker: Character,
        placeholder_id: &str,
        settings: GenerationSettings,
        cancel: CancelHandle,
    ) {
        let prompt = match self
            .assemble_prompt(conversation, &speaker, &settings, placeholder_id)
            .await
        {
            Ok(prompt) => prompt,
            Err(err) => {
                self.fail_placeholder(&conversation.id, placeholder_id, &err.to_string(), "")
                    .await;
                return;
            }
        };

        let params = GenerationParams::from_settings(&settings, prompt.stop_strings.clone());
        let rx = match self
            .sidecar
            .generate(prompt.text(), params, cancel.clone())
            .await
        {
            Ok(rx) => rx,
            Err(err) => {
                self.fail_placeholder(&conversation.id, placeholder_id, &err.to_string(), "")
                    .await;
                return;
            }
        };

        self.relay_stream(&conversation.id, placeholder_id, rx).await;
    }

    async fn assemble_prompt(
        &self,
        conversation: &Conversation,
        speaker: &Character,
        settings: &GenerationSettings,
        placeholder_id: &str,
    ) -> Result<crate::context::AssembledPrompt, ChatError> {
        let parts = self
            .build_assembly_parts(conversation, speaker, settings, Some(placeholder_id))
            .await?;
        let counter = HeuristicCounter;
        let input = AssemblyInput {
            characters: &parts.characters,
            speaker,
            persona: parts.persona.as_ref(),
            active_path: &parts.path,
            lorebook_hits: parts.lorebook_hits.clone(),
            summaries: &parts.summaries,
            memories: &parts.memories,
            settings,
        };

        match PromptAssembler::assemble(&input, &counter) {
            Ok(prompt) => Ok(prompt),
            Err(ChatError::PromptTooLong(detail)) => {
                self.bus.emit(AppEvent::ChatWarning {
                    message: format!("prompt too long, truncating: {detail}"),
                });
                Ok(PromptAssembler::assemble_lossy(&input, &counter))
            }
            Err(other) => Err(other),
        }
    }

    async fn build_assembly_parts(
        &self,
        conversation: &Conversation,
        _speaker: &Character,
        settings: &GenerationSettings,
        placeholder_id: Option<&str>,
    ) -> Result<AssemblyParts, ChatError> {
        let mut characters = Vec::with_capacity(conversation.character_ids.len());
        for id in &conversation.character_ids {
            characters.push(self.store.get_character(id).await?);
        }
        let persona = self.resolve_persona(conversation).await?;

        let mut path = self.store.active_path(&conversation.id).await?;
        if let Some(placeholder_id) = placeholder_id {
            path.retain(|m| m.id != placeholder_id);
        }

        let counter = HeuristicCounter;
        let window: String = path
            .iter()
            .rev()
            .take(LOREBOOK_WINDOW_MESSAGES)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let entries = self.store.entries_for_conversation(&conversation.id).await?;
        let lorebook_hits = match_entries(&entries, &window, settings.lorebook_budget, &counter);

        let summaries = self.store.list_summaries(&conversation.id).await?;

        let memories = match (&self.memory, path.last()) {
            (Some(retriever), Some(newest)) => {
                match retriever.retrieve(&newest.content, MEMORY_RETRIEVAL_K).await {
                    Ok(memories) => memories,
                    Err(err) => {
                        tracing::warn!("memory retrieval failed: {err}");
                        Vec::new()
                    }
                }
            }
            _ => Vec::new(),
        };

        Ok(AssemblyParts {
            characters,
            persona,
            path,
            lorebook_hits,
            summaries,
            memories,
        })
    }

    /// Drain a generation stream into the placeholder: relay tokens in order,
    /// checkpoint periodically, and finalize on done / cancel / error. A
    /// stall beyond `STREAM_STALL_TIMEOUT` finalizes as an error.
    pub async fn relay_stream(
        &self,
        conversation_id: &str,
        message_id: &str,
        mut rx: mpsc::Receiver<StreamEvent>,
    ) {
        let mut buffer = String::new();
        let mut tokens_since_checkpoint = 0usize;
        let mut last_checkpoint = Instant::now();

        loop {
            let event = match tokio::time::timeout(STREAM_STALL_TIMEOUT, rx.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    self.fail_placeholder(
                        conversation_id,
                        message_id,
                        "generation stream closed unexpectedly",
                        &buffer,
                    )
                    .await;
                    return;
                }
                Err(_) => {
                    self.fail_placeholder(
                        conversation_id,
                        message_id,
                        "generation stalled and was abandoned",
                        &buffer,
                    )
                    .await;
                    return;
                }
            };

            match event {
                StreamEvent::Token(token) => {
                    buffer.push_str(&token);
                    tokens_since_checkpoint += 1;
                    self.bus.emit(AppEvent::ChatToken {
                        conversation_id: conversation_id.to_string(),
                        message_id: message_id.to_string(),
                        token,
                    });

                    if tokens_since_checkpoint >= CHECKPOINT_TOKENS
                        || last_checkpoint.elapsed() >= CHECKPOINT_INTERVAL
                    {
                        let token_count = crate::sidecar::heuristic_token_count(&buffer) as i64;
                        if let Err(err) = self
                            .store
                            .update_message_content(message_id, &buffer, token_count)
                            .await
                        {
                            tracing::warn!("streaming checkpoint failed: {err}");
                        }
                        tokens_since_checkpoint = 0;
                        last_checkpoint = Instant::now();
                    }
                }
                StreamEvent::Done => {
                    self.finalize_placeholder(conversation_id, message_id, &buffer, false)
                        .await;
                    return;
                }
                StreamEvent::Cancelled => {
                    self.finalize_placeholder(conversation_id, message_id, &buffer, true)
                        .await;
                    return;
                }
                StreamEvent::Error(err) => {
                    let content = if matches!(err, ChatError::GenerationInterrupted(_)) {
                        if buffer.is_empty() {
                            INTERRUPTED_SENTINEL.to_string()
                        } else {
                            format!("{buffer}\n\n{INTERRUPTED_SENTINEL}")
                        }
                    } else {
                        buffer.clone()
                    };
                    self.fail_placeholder(conversation_id, message_id, &err.to_string(), &content)
                        .await;
                    return;
                }
            }
        }
    }

    async fn finalize_placeholder(
        &self,
        conversation_id: &str,
        message_id: &str,
        content: &str,
        stopped_by_user: bool,
    ) {
        let token_count = self.sidecar.token_count(content).await as i64;
        if let Err(err) = self
            .store
            .update_message_content(message_id, content, token_count)
            .await
        {
            tracing::error!("failed to persist final message content: {err}");
        }
        if stopped_by_user {
            if let Err(err) = self
                .store
                .merge_generation_params(message_id, json!({ "stopped_by_user": true }))
                .await
            {
                tracing::warn!("failed to record stop flag: {err}");
            }
        }

        match self.store.get_message(message_id).await {
            Ok(message) => self.bus.emit(AppEvent::ChatComplete {
                conversation_id: conversation_id.to_string(),
                message,
            }),
            Err(err) => tracing::error!("failed to load finalized message: {err}"),
        }
    }

    /// Keep the placeholder with whatever streamed, then report the failure.
    async fn fail_placeholder(
        &self,
        conversation_id: &str,
        message_id: &str,
        error: &str,
        content: &str,
    ) {
        let token_count = crate::sidecar::heuristic_token_count(content) as i64;
        if let Err(err) = self
            .store
            .update_message_content(message_id, content, token_count)
            .await
        {
            tracing::error!("failed to persist interrupted content: {err}");
        }
        self.bus.emit(AppEvent::ChatError {
            conversation_id: conversation_id.to_string(),
            message_id: Some(message_id.to_string()),
            error: error.to_string(),
        });
    }
}

struct AssemblyParts {
    characters: Vec<Character>,
    persona: Option<Persona>,
    path: Vec<Message>,
    lorebook_hits: LorebookHits,
    summaries: Vec<crate::store::types::ConversationSummary>,
    memories: Vec<MemoryFragment>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::AppPaths;
    use crate::store::types::CharacterDraft;

    async fn engine_fixture() -> (ChatEngine, EventBus, String, String) {
        let dir = tempfile::tempdir().unwrap();
        let paths = Arc::new(AppPaths::at(dir.path().to_path_buf()));
        let bus = EventBus::default();
        let store = Store::in_memory().await.unwrap();
        let sidecar = SidecarSupervisor::new(paths.clone(), bus.clone());
        let config = ConfigService::new(paths);
        let engine = ChatEngine::new(store, sidecar, config, bus.clone(), None);

        let character = engine
            .store()
            .create_character(CharacterDraft {
                name: "Aria".to_string(),
                first_message: Some("Well met, {{user}}.".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let conversation = engine
            .create_conversation(&[character.id.clone()], Some("test"), None)
            .await
            .unwrap();

        // Leak the tempdir so paths stay valid for the test duration.
        std::mem::forget(dir);
        (engine, bus, conversation.id, character.id)
    }

    async fn placeholder_under_greeting(
        engine: &ChatEngine,
        conversation_id: &str,
        character_id: &str,
    ) -> String {
        let conversation = engine.store().get_conversation(conversation_id).await.unwrap();
        engine
            .store()
            .append_child(
                conversation_id,
                conversation.active_message_id.as_deref(),
                NewMessage {
                    author_type: AuthorType::Character,
                    author_id: Some(character_id.to_string()),
                    content: String::new(),
                    token_count: 0,
                    generation_params: None,
                },
            )
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn greeting_seeds_the_root_message() {
        let (engine, _bus, conversation_id, _) = engine_fixture().await;
        let path = engine.store().active_path(&conversation_id).await.unwrap();
        assert_eq!(path.len(), 1);
        assert_eq!(path[0].content, "Well met, You.");
        assert_eq!(path[0].author_type, AuthorType::Character);
    }

    #[tokio::test]
    async fn send_message_requires_a_ready_sidecar() {
        let (engine, _bus, conversation_id, _) = engine_fixture().await;
        let err = engine
            .send_message(&conversation_id, "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::SidecarUnavailable(_)));
    }

    #[tokio::test]
    async fn send_message_validates_content() {
        let (engine, _bus, conversation_id, _) = engine_fixture().await;
        let err = engine.send_message(&conversation_id, "  ").await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));

        let long = "x".repeat(9000);
        let err = engine.send_message(&conversation_id, &long).await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[tokio::test]
    async fn relay_concatenates_tokens_into_final_content() {
        let (engine, bus, conversation_id, character_id) = engine_fixture().await;
        let message_id =
            placeholder_under_greeting(&engine, &conversation_id, &character_id).await;
        let mut events = bus.subscribe();

        let (tx, rx) = mpsc::channel(16);
        for token in ["Hel", "lo ", "there"] {
            tx.send(StreamEvent::Token(token.to_string())).await.unwrap();
        }
        tx.send(StreamEvent::Done).await.unwrap();
        drop(tx);

        engine.relay_stream(&conversation_id, &message_id, rx).await;

        let message = engine.store().get_message(&message_id).await.unwrap();
        assert_eq!(message.content, "Hello there");
        assert!(message.token_count > 0);

        // Token events arrive in order; complete is terminal and matches the
        // sum of the streamed tokens.
        let mut streamed = String::new();
        loop {
            match events.recv().await.unwrap() {
                AppEvent::ChatToken { token, .. } => streamed.push_str(&token),
                AppEvent::ChatComplete { message, .. } => {
                    assert_eq!(message.content, streamed);
                    break;
                }
                other => panic!("unexpected event {}", other.channel()),
            }
        }
    }

    #[tokio::test]
    async fn interrupted_stream_keeps_partial_content() {
        let (engine, bus, conversation_id, character_id) = engine_fixture().await;
        let message_id =
            placeholder_under_greeting(&engine, &conversation_id, &character_id).await;
        let mut events = bus.subscribe();

        let (tx, rx) = mpsc::channel(16);
        for token in ["one ", "two ", "three ", "four ", "five"] {
            tx.send(StreamEvent::Token(token.to_string())).await.unwrap();
        }
        tx.send(StreamEvent::Error(ChatError::GenerationInterrupted(
            "process died".to_string(),
        )))
        .await
        .unwrap();
        drop(tx);

        engine.relay_stream(&conversation_id, &message_id, rx).await;

        let message = engine.store().get_message(&message_id).await.unwrap();
        assert!(message.content.starts_with("one two three four five"));
        assert!(message.content.contains(INTERRUPTED_SENTINEL));

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if let AppEvent::ChatError { message_id: id, .. } = event {
                assert_eq!(id.as_deref(), Some(message_id.as_str()));
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn cancelled_stream_finalizes_with_stop_flag() {
        let (engine, _bus, conversation_id, character_id) = engine_fixture().await;
        let message_id =
            placeholder_under_greeting(&engine, &conversation_id, &character_id).await;

        let (tx, rx) = mpsc::channel(16);
        tx.send(StreamEvent::Token("partial".to_string())).await.unwrap();
        tx.send(StreamEvent::Cancelled).await.unwrap();
        drop(tx);

        engine.relay_stream(&conversation_id, &message_id, rx).await;

        let message = engine.store().get_message(&message_id).await.unwrap();
        assert_eq!(message.content, "partial");
        let stopped = message
            .generation_params
            .as_ref()
            .and_then(|p| p.get("stopped_by_user"))
            .and_then(|v| v.as_bool());
        assert_eq!(stopped, Some(true));
    }

    #[tokio::test]
    async fn edit_creates_a_sibling_and_preserves_the_original() {
        let (engine, _bus, conversation_id, _) = engine_fixture().await;

        // Work on the greeting (a character message): edit must branch.
        let path = engine.store().active_path(&conversation_id).await.unwrap();
        let greeting_id = path[0].id.clone();

        let edited = engine.edit(&greeting_id, "A different opening.").await.unwrap();
        assert_ne!(edited.id, greeting_id);

        let original = engine.store().get_message(&greeting_id).await.unwrap();
        assert_eq!(original.content, "Well met, You.");
        assert!(!original.is_active_branch);

        let siblings = engine.get_branch_siblings(&edited.id).await.unwrap();
        assert_eq!(siblings.len(), 2);

        // Switch back restores the original greeting as the active path.
        let restored = engine.switch_branch(&greeting_id).await.unwrap();
        assert_eq!(restored.last().unwrap().id, greeting_id);
    }

    #[tokio::test]
    async fn round_robin_advances_per_assistant_turn() {
        let (engine, _bus, _conversation_id, first_id) = engine_fixture().await;
        let second = engine
            .store()
            .create_character(CharacterDraft {
                name: "Bram".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let conversation = engine
            .create_conversation(&[first_id.clone(), second.id.clone()], None, None)
            .await
            .unwrap();

        // Greeting was spoken by the first character, so the second speaks next.
        let speaker = engine.next_speaker(&conversation).await.unwrap();
        assert_eq!(speaker.id, second.id);

        engine
            .store()
            .append_child(
                &conversation.id,
                conversation.active_message_id.as_deref(),
                NewMessage {
                    author_type: AuthorType::Character,
                    author_id: Some(second.id.clone()),
                    content: "indeed".to_string(),
                    token_count: 1,
                    generation_params: None,
                },
            )
            .await
            .unwrap();

        let conversation = engine.store().get_conversation(&conversation.id).await.unwrap();
        let speaker = engine.next_speaker(&conversation).await.unwrap();
        assert_eq!(speaker.id, first_id);
    }

    #[tokio::test]
    async fn stop_generation_without_a_stream_is_a_no_op() {
        let (engine, _bus, _conversation_id, _) = engine_fixture().await;
        engine.stop_generation().await;
        engine.stop_generation().await;
    }
}
