use super::budget::{ContextBudget, TierBudget, TokenCounter};
use super::lorebook::LorebookHits;
use super::memory::MemoryFragment;
use super::template;
use crate::core::config::GenerationSettings;
use crate::core::errors::ChatError;
use crate::store::types::{AuthorType, Character, ConversationSummary, Message, Persona};

/// Everything the assembler needs for one turn.
pub struct AssemblyInput<'a> {
    pub characters: &'a [Character],
    /// The character who will speak next (round-robin in group chats).
    pub speaker: &'a Character,
    pub persona: Option<&'a Persona>,
    /// Root-to-leaf active path; the leaf is the newest message.
    pub active_path: &'a [Message],
    /// Lorebook entries already admitted within `lorebook_budget`.
    pub lorebook_hits: LorebookHits,
    /// Summaries newest-first.
    pub summaries: &'a [ConversationSummary],
    pub memories: &'a [MemoryFragment],
    pub settings: &'a GenerationSettings,
}

#[derive(Debug, Clone)]
pub struct PromptSegment {
    pub label: String,
    pub content: String,
    pub tokens: usize,
}

/// The final prompt plus its token accounting.
#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    pub segments: Vec<PromptSegment>,
    pub token_count: usize,
    pub truncated: bool,
    pub stop_strings: Vec<String>,
    pub user_name: String,
    pub speaker_name: String,
}

impl AssembledPrompt {
    pub fn text(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

pub struct PromptAssembler;

impl PromptAssembler {
    /// Assemble the prompt. Fails with `PromptTooLong` when even the newest
    /// message cannot fit the window; the caller surfaces a warning and
    /// retries with `assemble_lossy`.
    pub fn assemble(
        input: &AssemblyInput<'_>,
        counter: &dyn TokenCounter,
    ) -> Result<AssembledPrompt, ChatError> {
        build(input, counter, false)
    }

    /// Assemble, middle-truncating the newest message when it alone
    /// overflows the window.
    pub fn assemble_lossy(input: &AssemblyInput<'_>, counter: &dyn TokenCounter) -> AssembledPrompt {
        build(input, counter, true).expect("lossy assembly cannot overflow")
    }
}

fn build(
    input: &AssemblyInput<'_>,
    counter: &dyn TokenCounter,
    allow_truncation: bool,
) -> Result<AssembledPrompt, ChatError> {
    let settings = input.settings;
    let mut overall = ContextBudget::new(settings.context_size, settings.response_reserve);

    let user_name = input
        .persona
        .map(|p| p.name.clone())
        .unwrap_or_else(|| template::DEFAULT_USER_NAME.to_string());
    let speaker_name = input.speaker.name.clone();
    let sub = |text: &str| template::substitute(text, &user_name, &speaker_name);

    let mut truncated = false;

    // The response cue is part of the prompt; reserve it up front so the
    // tiers below can never squeeze it out.
    let cue = format!("{speaker_name}:");
    let cue_tokens = counter.count(&cue);
    if !overall.try_consume(cue_tokens) {
        if !allow_truncation {
            return Err(ChatError::PromptTooLong(
                "no room left for the response cue".to_string(),
            ));
        }
        truncated = true;
        let remaining = overall.remaining();
        overall.try_consume(remaining);
    }

    // Tier 0 — system prompt, capped only by the remaining window.
    let mut system_text = compose_system(input, &user_name, &sub);
    let mut system_tokens = counter.count(&system_text);
    if system_tokens > overall.remaining() {
        system_text = truncate_tail(&system_text, overall.remaining());
        system_tokens = counter.count(&system_text);
        truncated = true;
    }
    overall.try_consume(system_tokens);

    // Tier 1 — example dialogues, truncated to their ceiling.
    let mut example_segment: Option<PromptSegment> = None;
    if let Some(examples) = input
        .speaker
        .example_dialogues
        .as_deref()
        .filter(|e| !e.trim().is_empty())
    {
        let mut tier = TierBudget::new(settings.example_dialogue_budget);
        let mut text = sub(examples);
        let mut tokens = counter.count(&text);
        if tokens > tier.remaining() {
            text = truncate_tail(&text, tier.remaining());
            tokens = counter.count(&text);
            truncated = true;
        }
        if tier.admit(&mut overall, tokens) && tokens > 0 {
            example_segment = Some(PromptSegment {
                label: "examples".to_string(),
                content: format!("Example dialogue:\n{text}"),
                tokens,
            });
        }
    }

    // Tier 2 — running summaries, newest first, whole entries only.
    let mut summary_segments = Vec::new();
    {
        let mut tier = TierBudget::new(settings.summary_budget);
        for summary in input.summaries {
            let tokens = if summary.token_count > 0 {
                summary.token_count as usize
            } else {
                counter.count(&summary.content)
            };
            if tier.admit(&mut overall, tokens) {
                summary_segments.push(PromptSegment {
                    label: "summary".to_string(),
                    content: format!("Earlier in this conversation: {}", summary.content),
                    tokens,
                });
            }
        }
    }

    // Tier 3 — long-term memories.
    let mut memory_segments = Vec::new();
    {
        let mut tier = TierBudget::new(settings.memory_budget);
        for memory in input.memories {
            let tokens = counter.count(&memory.content);
            if tier.admit(&mut overall, tokens) {
                memory_segments.push(PromptSegment {
                    label: "memory".to_string(),
                    content: memory.content.clone(),
                    tokens,
                });
            }
        }
    }

    // Tier 4 — lorebook entries, pre-admitted against lorebook_budget;
    // here they only have to fit the remaining window.
    let mut lore_before_system = Vec::new();
    let mut lore_after_system = Vec::new();
    let mut lore_before_history = Vec::new();
    for (bucket, entries) in [
        (&mut lore_before_system, &input.lorebook_hits.before_system),
        (&mut lore_after_system, &input.lorebook_hits.after_system),
        (
            &mut lore_before_history,
            &input.lorebook_hits.before_history,
        ),
    ] {
        for entry in entries {
            let content = sub(&entry.content);
            let tokens = counter.count(&content);
            if overall.try_consume(tokens) {
                bucket.push(PromptSegment {
                    label: format!("lorebook:{}", entry.name),
                    content,
                    tokens,
                });
            } else {
                tracing::debug!("lorebook entry {} dropped: window exhausted", entry.id);
            }
        }
    }

    // Tier 5 — recent history, greedy from the newest message backward.
    let mut history_lines: Vec<PromptSegment> = Vec::new();
    for (idx, message) in input.active_path.iter().enumerate().rev() {
        let newest = idx == input.active_path.len() - 1;
        let mut line = format_history_line(message, input.characters, &user_name, &speaker_name);
        let mut tokens = counter.count(&line);
        if tokens > overall.remaining() {
            if !newest {
                break;
            }
            if !allow_truncation {
                return Err(ChatError::PromptTooLong(format!(
                    "newest message needs {tokens} tokens but only {} remain",
                    overall.remaining()
                )));
            }
            line = truncate_middle(&line, overall.remaining());
            tokens = counter.count(&line);
            truncated = true;
        }
        overall.try_consume(tokens);
        history_lines.push(PromptSegment {
            label: "history".to_string(),
            content: line,
            tokens,
        });
    }
    history_lines.reverse();

    // Segment order for the final prompt text; tiers were budgeted above in
    // tier order, which is not the same order.
    let mut segments = Vec::new();
    segments.extend(lore_before_system);
    segments.push(PromptSegment {
        label: "system".to_string(),
        content: system_text,
        tokens: system_tokens,
    });
    segments.extend(lore_after_system);
    segments.extend(example_segment);
    segments.extend(summary_segments);
    segments.extend(memory_segments);
    segments.extend(lore_before_history);
    segments.extend(history_lines);
    segments.push(PromptSegment {
        label: "cue".to_string(),
        content: cue,
        tokens: cue_tokens,
    });

    let mut stop_strings = vec![format!("\n{user_name}:")];
    for character in input.characters {
        if character.id != input.speaker.id {
            stop_strings.push(format!("\n{}:", character.name));
        }
    }

    Ok(AssembledPrompt {
        token_count: overall.used(),
        segments,
        truncated,
        stop_strings,
        user_name,
        speaker_name,
    })
}

fn compose_system(
    input: &AssemblyInput<'_>,
    user_name: &str,
    sub: &dyn Fn(&str) -> String,
) -> String {
    let speaker = input.speaker;

    if let Some(system_prompt) = speaker
        .system_prompt
        .as_deref()
        .filter(|s| !s.trim().is_empty())
    {
        return sub(system_prompt);
    }

    let mut parts = Vec::new();
    parts.push(format!(
        "You are {}, a character in an ongoing role-play. Stay in character.",
        speaker.name
    ));
    if !speaker.description.trim().is_empty() {
        parts.push(sub(&speaker.description));
    }
    if !speaker.personality.trim().is_empty() {
        parts.push(format!("Personality: {}", sub(&speaker.personality)));
    }
    if !speaker.scenario.trim().is_empty() {
        parts.push(format!("Scenario: {}", sub(&speaker.scenario)));
    }
    if let Some(traits) = speaker
        .physical_traits
        .as_deref()
        .filter(|t| !t.trim().is_empty())
    {
        parts.push(format!("Appearance: {}", sub(traits)));
    }
    if let Some(speech) = speaker
        .speech_patterns
        .as_deref()
        .filter(|s| !s.trim().is_empty())
    {
        parts.push(format!("Speech: {}", sub(speech)));
    }
    if input.characters.len() > 1 {
        let others: Vec<&str> = input
            .characters
            .iter()
            .filter(|c| c.id != speaker.id)
            .map(|c| c.name.as_str())
            .collect();
        if !others.is_empty() {
            parts.push(format!("Also present: {}.", others.join(", ")));
        }
    }

    match input.persona {
        Some(persona) if !persona.description.trim().is_empty() => {
            parts.push(format!(
                "The user is {}. {}",
                persona.name,
                sub(&persona.description)
            ));
        }
        Some(persona) => parts.push(format!("The user is {}.", persona.name)),
        None => parts.push(format!("The user is {user_name}.")),
    }

    parts.join("\n")
}

fn format_history_line(
    message: &Message,
    characters: &[Character],
    user_name: &str,
    speaker_name: &str,
) -> String {
    match message.author_type {
        AuthorType::User => format!("{user_name}: {}", message.content),
        AuthorType::Character => {
            let name = message
                .author_id
                .as_deref()
                .and_then(|id| characters.iter().find(|c| c.id == id))
                .map(|c| c.name.as_str())
                .unwrap_or(speaker_name);
            format!("{name}: {}", message.content)
        }
        AuthorType::System => message.content.clone(),
    }
}

/// Cut the tail so the text fits `max_tokens` under the ~4 chars/token
/// heuristic.
fn truncate_tail(text: &str, max_tokens: usize) -> String {
    let max_chars = max_tokens.saturating_mul(4);
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

/// Remove the middle of the text, keeping head and tail, so it fits
/// `max_tokens`.
fn truncate_middle(text: &str, max_tokens: usize) -> String {
    const ELLIPSIS: &str = " […] ";
    let max_chars = max_tokens.saturating_mul(4);
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    if max_chars <= ELLIPSIS.len() {
        return text.chars().take(max_chars).collect();
    }
    let keep = max_chars - ELLIPSIS.len();
    let head = keep / 2;
    let tail = keep - head;
    let head_part: String = text.chars().take(head).collect();
    let tail_part: String = text.chars().skip(total - tail).collect();
    format!("{head_part}{ELLIPSIS}{tail_part}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::budget::HeuristicCounter;
    use crate::store::types::{InsertionPosition, LorebookEntry, PovType, Rating};

    fn character(id: &str, name: &str) -> Character {
        Character {
            id: id.to_string(),
            name: name.to_string(),
            description: "A wandering bard who knows {{user}}.".to_string(),
            personality: "curious".to_string(),
            scenario: "a quiet tavern".to_string(),
            backstory: String::new(),
            system_prompt: None,
            first_message: None,
            alternate_greetings: Vec::new(),
            example_dialogues: None,
            physical_traits: None,
            speech_patterns: None,
            likes: Vec::new(),
            dislikes: Vec::new(),
            tags: Vec::new(),
            avatar_ref: None,
            rating: Rating::Sfw,
            pov_type: PovType::Any,
            is_bundled: false,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn message(id: &str, author: AuthorType, content: &str) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: "conv".to_string(),
            parent_id: None,
            author_type: author,
            author_id: None,
            content: content.to_string(),
            branch_index: 0,
            is_active_branch: true,
            token_count: 0,
            generation_params: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn settings(context_size: usize, response_reserve: usize) -> GenerationSettings {
        let mut s = GenerationSettings::from_config(
            &crate::core::config::defaults::default_config(),
        );
        s.context_size = context_size;
        s.response_reserve = response_reserve;
        s
    }

    #[test]
    fn prompt_never_exceeds_the_window() {
        let speaker = character("c1", "Aria");
        let characters = vec![speaker.clone()];
        let path: Vec<Message> = (0..40)
            .map(|i| {
                message(
                    &format!("m{i}"),
                    if i % 2 == 0 {
                        AuthorType::User
                    } else {
                        AuthorType::Character
                    },
                    &"word ".repeat(30),
                )
            })
            .collect();
        let settings = settings(512, 128);

        let input = AssemblyInput {
            characters: &characters,
            speaker: &speaker,
            persona: None,
            active_path: &path,
            lorebook_hits: LorebookHits::default(),
            summaries: &[],
            memories: &[],
            settings: &settings,
        };

        let prompt = PromptAssembler::assemble(&input, &HeuristicCounter).unwrap();
        assert!(prompt.token_count <= 512 - 128);
        // Newest message is always present.
        assert!(prompt.segments.iter().any(|s| s.label == "history"));
    }

    #[test]
    fn oversized_newest_message_signals_prompt_too_long() {
        let speaker = character("c1", "Aria");
        let characters = vec![speaker.clone()];
        let path = vec![message("m0", AuthorType::User, &"word ".repeat(2000))];
        let settings = settings(256, 64);

        let input = AssemblyInput {
            characters: &characters,
            speaker: &speaker,
            persona: None,
            active_path: &path,
            lorebook_hits: LorebookHits::default(),
            summaries: &[],
            memories: &[],
            settings: &settings,
        };

        let err = PromptAssembler::assemble(&input, &HeuristicCounter).unwrap_err();
        assert!(matches!(err, ChatError::PromptTooLong(_)));

        let prompt = PromptAssembler::assemble_lossy(&input, &HeuristicCounter);
        assert!(prompt.truncated);
        assert!(prompt.token_count <= 256 - 64);
        let history: Vec<&PromptSegment> = prompt
            .segments
            .iter()
            .filter(|s| s.label == "history")
            .collect();
        assert_eq!(history.len(), 1);
        assert!(history[0].content.contains("[…]"));
    }

    #[test]
    fn placeholders_resolve_to_persona_and_speaker() {
        let speaker = character("c1", "Aria");
        let characters = vec![speaker.clone()];
        let persona = Persona {
            id: "p1".to_string(),
            name: "Sam".to_string(),
            description: "a traveling scholar".to_string(),
            is_default: true,
            created_at: String::new(),
            updated_at: String::new(),
        };
        let path = vec![message("m0", AuthorType::User, "hello")];
        let settings = settings(2048, 256);

        let input = AssemblyInput {
            characters: &characters,
            speaker: &speaker,
            persona: Some(&persona),
            active_path: &path,
            lorebook_hits: LorebookHits::default(),
            summaries: &[],
            memories: &[],
            settings: &settings,
        };

        let prompt = PromptAssembler::assemble(&input, &HeuristicCounter).unwrap();
        let text = prompt.text();
        assert!(text.contains("who knows Sam"));
        assert!(text.contains("Sam: hello"));
        assert!(text.ends_with("Aria:"));
        assert!(prompt.stop_strings.contains(&"\nSam:".to_string()));
    }

    #[test]
    fn lorebook_positions_are_respected() {
        let speaker = character("c1", "Aria");
        let characters = vec![speaker.clone()];
        let path = vec![message("m0", AuthorType::User, "tell me about the dragon")];
        let settings = settings(4096, 256);

        let entry = |name: &str, position: InsertionPosition| LorebookEntry {
            id: name.to_string(),
            lorebook_id: "b".to_string(),
            name: name.to_string(),
            keywords: vec!["dragon".to_string()],
            content: format!("{name} lore"),
            priority: 50,
            is_enabled: true,
            case_sensitive: false,
            match_whole_word: false,
            insertion_position: position,
            token_budget: None,
            created_at: String::new(),
            updated_at: String::new(),
        };

        let hits = LorebookHits {
            before_system: vec![entry("alpha", InsertionPosition::BeforeSystem)],
            after_system: vec![entry("beta", InsertionPosition::AfterSystem)],
            before_history: vec![entry("gamma", InsertionPosition::BeforeHistory)],
        };

        let input = AssemblyInput {
            characters: &characters,
            speaker: &speaker,
            persona: None,
            active_path: &path,
            lorebook_hits: hits,
            summaries: &[],
            memories: &[],
            settings: &settings,
        };

        let prompt = PromptAssembler::assemble(&input, &HeuristicCounter).unwrap();
        let labels: Vec<&str> = prompt.segments.iter().map(|s| s.label.as_str()).collect();
        let pos = |label: &str| labels.iter().position(|l| *l == label).unwrap();
        assert!(pos("lorebook:alpha") < pos("system"));
        assert!(pos("system") < pos("lorebook:beta"));
        assert!(pos("lorebook:gamma") < pos("history"));
        assert!(pos("lorebook:gamma") > pos("lorebook:beta"));
    }

    #[test]
    fn summaries_respect_their_ceiling() {
        let speaker = character("c1", "Aria");
        let characters = vec![speaker.clone()];
        let path = vec![message("m0", AuthorType::User, "hi")];
        let mut settings = settings(4096, 256);
        settings.summary_budget = 30;

        let summary = |id: &str, tokens: i64| ConversationSummary {
            id: id.to_string(),
            conversation_id: "conv".to_string(),
            covers_up_to: None,
            content: "s".repeat((tokens as usize) * 4),
            token_count: tokens,
            created_at: String::new(),
        };
        let summaries = vec![summary("new", 20), summary("old", 20)];

        let input = AssemblyInput {
            characters: &characters,
            speaker: &speaker,
            persona: None,
            active_path: &path,
            lorebook_hits: LorebookHits::default(),
            summaries: &summaries,
            memories: &[],
            settings: &settings,
        };

        let prompt = PromptAssembler::assemble(&input, &HeuristicCounter).unwrap();
        let count = prompt
            .segments
            .iter()
            .filter(|s| s.label == "summary")
            .count();
        assert_eq!(count, 1);
    }
}
