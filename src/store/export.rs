use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::characters::json_list;
use super::types::{
    Character, Conversation, ConversationSummary, Lorebook, LorebookEntry, Message, Persona,
};
use super::Store;
use crate::core::errors::ChatError;

/// Full data snapshot exchanged by export/import.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DataArchive {
    pub characters: Vec<Character>,
    pub personas: Vec<Persona>,
    pub conversations: Vec<Conversation>,
    pub messages: Vec<Message>,
    pub lorebooks: Vec<Lorebook>,
    pub lorebook_entries: Vec<LorebookEntry>,
    pub summaries: Vec<ConversationSummary>,
    pub settings: Option<Value>,
}

impl Store {
    pub async fn export_all(&self) -> Result<DataArchive, ChatError> {
        let conversations = self.list_conversations().await?;
        let mut messages = Vec::new();
        let mut summaries = Vec::new();
        for conversation in &conversations {
            messages.extend(self.messages_for_conversation(&conversation.id).await?);
            summaries.extend(self.list_summaries(&conversation.id).await?);
        }

        let lorebooks = self.list_lorebooks().await?;
        let mut lorebook_entries = Vec::new();
        for lorebook in &lorebooks {
            lorebook_entries.extend(self.list_lorebook_entries(&lorebook.id).await?);
        }

        Ok(DataArchive {
            characters: self.list_characters().await?,
            personas: self.list_personas().await?,
            conversations,
            messages,
            lorebooks,
            lorebook_entries,
            summaries,
            settings: None,
        })
    }

    /// Upsert everything in the archive by id. Returns a human-readable
    /// summary of what was imported.
    pub async fn import_archive(&self, archive: DataArchive) -> Result<String, ChatError> {
        let mut tx = self.pool().begin().await?;

        for c in &archive.characters {
            sqlx::query(
                "INSERT OR REPLACE INTO characters (
                    id, name, description, personality, scenario, backstory,
                    system_prompt, first_message, alternate_greetings, example_dialogues,
                    physical_traits, speech_patterns, likes, dislikes, tags, avatar_ref,
                    rating, pov_type, is_bundled, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&c.id)
            .bind(&c.name)
            .bind(&c.description)
            .bind(&c.personality)
            .bind(&c.scenario)
            .bind(&c.backstory)
            .bind(&c.system_prompt)
            .bind(&c.first_message)
            .bind(json_list(&c.alternate_greetings))
            .bind(&c.example_dialogues)
            .bind(&c.physical_traits)
            .bind(&c.speech_patterns)
            .bind(json_list(&c.likes))
            .bind(json_list(&c.dislikes))
            .bind(json_list(&c.tags))
            .bind(&c.avatar_ref)
            .bind(c.rating.as_str())
            .bind(c.pov_type.as_str())
            .bind(c.is_bundled)
            .bind(&c.created_at)
            .bind(&c.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        for p in &archive.personas {
            sqlx::query(
                "INSERT OR REPLACE INTO personas (id, name, description, is_default, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&p.id)
            .bind(&p.name)
            .bind(&p.description)
            .bind(p.is_default)
            .bind(&p.created_at)
            .bind(&p.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        for c in &archive.conversations {
            sqlx::query(
                "INSERT OR REPLACE INTO conversations (id, title, character_ids, persona_id, active_message_id, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&c.id)
            .bind(&c.title)
            .bind(json_list(&c.character_ids))
            .bind(&c.persona_id)
            .bind(&c.active_message_id)
            .bind(&c.created_at)
            .bind(&c.updated_at)
            .execute(&mut *tx)
            .await?;

            for lorebook_id in &c.lorebook_ids {
                sqlx::query(
                    "INSERT OR IGNORE INTO conversation_lorebooks (conversation_id, lorebook_id) VALUES (?, ?)",
                )
                .bind(&c.id)
                .bind(lorebook_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        for m in &archive.messages {
            sqlx::query(
                "INSERT OR REPLACE INTO messages (
                    id, conversation_id, parent_id, author_type, author_id, content,
                    branch_index, is_active_branch, token_count, generation_params,
                    created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&m.id)
            .bind(&m.conversation_id)
            .bind(&m.parent_id)
            .bind(m.author_type.as_str())
            .bind(&m.author_id)
            .bind(&m.content)
            .bind(m.branch_index)
            .bind(m.is_active_branch)
            .bind(m.token_count)
            .bind(&m.generation_params)
            .bind(&m.created_at)
            .bind(&m.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        for b in &archive.lorebooks {
            sqlx::query(
                "INSERT OR REPLACE INTO lorebooks (id, name, description, is_global, is_enabled, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&b.id)
            .bind(&b.name)
            .bind(&b.description)
            .bind(b.is_global)
            .bind(b.is_enabled)
            .bind(&b.created_at)
            .bind(&b.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        for e in &archive.lorebook_entries {
            sqlx::query(
                "INSERT OR REPLACE INTO lorebook_entries (
                    id, lorebook_id, name, keywords, content, priority, is_enabled,
                    case_sensitive, match_whole_word, insertion_position, token_budget,
                    created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&e.id)
            .bind(&e.lorebook_id)
            .bind(&e.name)
            .bind(json_list(&e.keywords))
            .bind(&e.content)
            .bind(e.priority)
            .bind(e.is_enabled)
            .bind(e.case_sensitive)
            .bind(e.match_whole_word)
            .bind(e.insertion_position.as_str())
            .bind(e.token_budget)
            .bind(&e.created_at)
            .bind(&e.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        for s in &archive.summaries {
            sqlx::query(
                "INSERT OR REPLACE INTO conversation_summaries (id, conversation_id, covers_up_to, content, token_count, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&s.id)
            .bind(&s.conversation_id)
            .bind(&s.covers_up_to)
            .bind(&s.content)
            .bind(s.token_count)
            .bind(&s.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(format!(
            "imported {} characters, {} personas, {} conversations, {} messages, {} lorebooks ({} entries), {} summaries",
            archive.characters.len(),
            archive.personas.len(),
            archive.conversations.len(),
            archive.messages.len(),
            archive.lorebooks.len(),
            archive.lorebook_entries.len(),
            archive.summaries.len(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::{AuthorType, CharacterDraft, NewMessage};

    #[tokio::test]
    async fn export_then_import_round_trips_entities() {
        let source = Store::in_memory().await.unwrap();
        let character = source
            .create_character(CharacterDraft {
                name: "Aria".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let conversation = source
            .create_conversation(&[character.id.clone()], Some("chat"), None)
            .await
            .unwrap();
        source
            .append_child(
                &conversation.id,
                None,
                NewMessage {
                    author_type: AuthorType::User,
                    author_id: None,
                    content: "hello".to_string(),
                    token_count: 2,
                    generation_params: None,
                },
            )
            .await
            .unwrap();

        let archive = source.export_all().await.unwrap();

        let target = Store::in_memory().await.unwrap();
        let summary = target.import_archive(archive).await.unwrap();
        assert!(summary.contains("1 characters"));

        let imported = target.get_conversation(&conversation.id).await.unwrap();
        assert_eq!(imported.title.as_deref(), Some("chat"));
        let path = target.active_path(&conversation.id).await.unwrap();
        assert_eq!(path.len(), 1);
        assert_eq!(path[0].content, "hello");
    }
}
