use serde::Deserialize;

use super::characters::json_list;
use super::types::{conversation_from_row, summary_from_row, Conversation, ConversationSummary};
use super::Store;
use crate::core::errors::ChatError;

/// Partial update for a conversation; absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConversationUpdate {
    pub title: Option<String>,
    pub persona_id: Option<Option<String>>,
    pub character_ids: Option<Vec<String>>,
}

impl Store {
    pub async fn create_conversation(
        &self,
        character_ids: &[String],
        title: Option<&str>,
        persona_id: Option<&str>,
    ) -> Result<Conversation, ChatError> {
        if character_ids.is_empty() {
            return Err(ChatError::validation(
                "a conversation needs at least one character",
            ));
        }
        for character_id in character_ids {
            self.get_character(character_id).await?;
        }
        if let Some(persona_id) = persona_id {
            self.get_persona(persona_id).await?;
        }

        let id = Self::new_id();
        let now = Self::now();
        sqlx::query(
            "INSERT INTO conversations (id, title, character_ids, persona_id, active_message_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, NULL, ?, ?)",
        )
        .bind(&id)
        .bind(title)
        .bind(json_list(character_ids))
        .bind(persona_id)
        .bind(&now)
        .bind(&now)
        .execute(self.pool())
        .await?;

        self.get_conversation(&id).await
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Conversation, ChatError> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| ChatError::not_found(format!("conversation {id}")))?;
        let lorebook_ids = self.lorebook_ids_for_conversation(id).await?;
        Ok(conversation_from_row(&row, lorebook_ids))
    }

    pub async fn list_conversations(&self) -> Result<Vec<Conversation>, ChatError> {
        let rows = sqlx::query("SELECT * FROM conversations ORDER BY updated_at DESC")
            .fetch_all(self.pool())
            .await?;

        let mut conversations = Vec::with_capacity(rows.len());
        for row in &rows {
            let conversation = conversation_from_row(row, Vec::new());
            let lorebook_ids = self
                .lorebook_ids_for_conversation(&conversation.id)
                .await?;
            conversations.push(Conversation {
                lorebook_ids,
                ..conversation
            });
        }
        Ok(conversations)
    }

    pub async fn update_conversation(
        &self,
        id: &str,
        update: ConversationUpdate,
    ) -> Result<Conversation, ChatError> {
        let existing = self.get_conversation(id).await?;

        let title = update.title.or(existing.title);
        let persona_id = match update.persona_id {
            Some(persona_id) => {
                if let Some(ref persona_id) = persona_id {
                    self.get_persona(persona_id).await?;
                }
                persona_id
            }
            None => existing.persona_id,
        };
        let character_ids = match update.character_ids {
            Some(character_ids) => {
                if character_ids.is_empty() {
                    return Err(ChatError::validation(
                        "a conversation needs at least one character",
                    ));
                }
                for character_id in &character_ids {
                    self.get_character(character_id).await?;
                }
                character_ids
            }
            None => existing.character_ids,
        };

        sqlx::query(
            "UPDATE conversations SET title = ?, persona_id = ?, character_ids = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&title)
        .bind(&persona_id)
        .bind(json_list(&character_ids))
        .bind(Self::now())
        .bind(id)
        .execute(self.pool())
        .await?;

        self.get_conversation(id).await
    }

    pub async fn delete_conversation(&self, id: &str) -> Result<(), ChatError> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM conversation_summaries WHERE conversation_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM conversation_lorebooks WHERE conversation_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ChatError::not_found(format!("conversation {id}")));
        }
        tx.commit().await?;
        Ok(())
    }

    /// Most recently updated conversation that includes the given character.
    pub async fn find_conversation_by_character(
        &self,
        character_id: &str,
    ) -> Result<Option<Conversation>, ChatError> {
        let conversations = self.list_conversations().await?;
        Ok(conversations
            .into_iter()
            .find(|c| c.character_ids.iter().any(|id| id == character_id)))
    }

    // -- summaries ----------------------------------------------------------

    pub async fn add_summary(
        &self,
        conversation_id: &str,
        content: &str,
        covers_up_to: Option<&str>,
        token_count: i64,
    ) -> Result<ConversationSummary, ChatError> {
        self.get_conversation(conversation_id).await?;

        let id = Self::new_id();
        sqlx::query(
            "INSERT INTO conversation_summaries (id, conversation_id, covers_up_to, content, token_count, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(covers_up_to)
        .bind(content)
        .bind(token_count)
        .bind(Self::now())
        .execute(self.pool())
        .await?;

        let row = sqlx::query("SELECT * FROM conversation_summaries WHERE id = ?")
            .bind(&id)
            .fetch_one(self.pool())
            .await?;
        Ok(summary_from_row(&row))
    }

    /// Summaries newest-first; the assembler consumes them in this order.
    pub async fn list_summaries(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ConversationSummary>, ChatError> {
        let rows = sqlx::query(
            "SELECT * FROM conversation_summaries WHERE conversation_id = ? ORDER BY created_at DESC",
        )
        .bind(conversation_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(summary_from_row).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::CharacterDraft;

    async fn store_with_character() -> (Store, String) {
        let store = Store::in_memory().await.unwrap();
        let character = store
            .create_character(CharacterDraft {
                name: "Aria".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        (store, character.id)
    }

    #[tokio::test]
    async fn create_requires_known_characters() {
        let store = Store::in_memory().await.unwrap();
        let err = store
            .create_conversation(&["ghost".to_string()], None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));

        let err = store.create_conversation(&[], None, None).await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[tokio::test]
    async fn delete_cascades_to_messages() {
        let (store, character_id) = store_with_character().await;
        let conversation = store
            .create_conversation(&[character_id], Some("test"), None)
            .await
            .unwrap();

        store
            .append_child(
                &conversation.id,
                None,
                crate::store::NewMessage {
                    author_type: crate::store::AuthorType::User,
                    author_id: None,
                    content: "hi".to_string(),
                    token_count: 1,
                    generation_params: None,
                },
            )
            .await
            .unwrap();

        store.delete_conversation(&conversation.id).await.unwrap();
        let messages = store.messages_for_conversation(&conversation.id).await.unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn find_by_character_returns_latest() {
        let (store, character_id) = store_with_character().await;
        store
            .create_conversation(&[character_id.clone()], Some("first"), None)
            .await
            .unwrap();

        let found = store
            .find_conversation_by_character(&character_id)
            .await
            .unwrap();
        assert!(found.is_some());
        assert!(store
            .find_conversation_by_character("ghost")
            .await
            .unwrap()
            .is_none());
    }
}
