use super::characters::json_list;
use super::types::{
    lorebook_entry_from_row, lorebook_from_row, InsertionPosition, Lorebook, LorebookEntry,
    LorebookEntryDraft,
};
use super::Store;
use crate::core::errors::ChatError;

impl Store {
    pub async fn create_lorebook(
        &self,
        name: &str,
        description: &str,
        is_global: bool,
    ) -> Result<Lorebook, ChatError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::validation("lorebook name must not be empty"));
        }

        let id = Self::new_id();
        let now = Self::now();
        sqlx::query(
            "INSERT INTO lorebooks (id, name, description, is_global, is_enabled, created_at, updated_at)
             VALUES (?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(&id)
        .bind(name)
        .bind(description)
        .bind(is_global)
        .bind(&now)
        .bind(&now)
        .execute(self.pool())
        .await?;

        self.get_lorebook(&id).await
    }

    pub async fn update_lorebook(
        &self,
        id: &str,
        name: &str,
        description: &str,
        is_global: bool,
        is_enabled: bool,
    ) -> Result<Lorebook, ChatError> {
        let result = sqlx::query(
            "UPDATE lorebooks SET name = ?, description = ?, is_global = ?, is_enabled = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(name.trim())
        .bind(description)
        .bind(is_global)
        .bind(is_enabled)
        .bind(Self::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(ChatError::not_found(format!("lorebook {id}")));
        }
        self.get_lorebook(id).await
    }

    pub async fn get_lorebook(&self, id: &str) -> Result<Lorebook, ChatError> {
        let row = sqlx::query("SELECT * FROM lorebooks WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| ChatError::not_found(format!("lorebook {id}")))?;
        Ok(lorebook_from_row(&row))
    }

    pub async fn list_lorebooks(&self) -> Result<Vec<Lorebook>, ChatError> {
        let rows = sqlx::query("SELECT * FROM lorebooks ORDER BY name COLLATE NOCASE ASC")
            .fetch_all(self.pool())
            .await?;
        Ok(rows.iter().map(lorebook_from_row).collect())
    }

    pub async fn delete_lorebook(&self, id: &str) -> Result<(), ChatError> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM lorebook_entries WHERE lorebook_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM conversation_lorebooks WHERE lorebook_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM lorebooks WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ChatError::not_found(format!("lorebook {id}")));
        }
        tx.commit().await?;
        Ok(())
    }

    // -- entries ------------------------------------------------------------

    pub async fn create_lorebook_entry(
        &self,
        lorebook_id: &str,
        draft: LorebookEntryDraft,
    ) -> Result<LorebookEntry, ChatError> {
        self.get_lorebook(lorebook_id).await?;
        let keywords: Vec<String> = draft
            .keywords
            .iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        if keywords.is_empty() {
            return Err(ChatError::validation(
                "a lorebook entry needs at least one keyword",
            ));
        }
        if !(0..=100).contains(&draft.priority) {
            return Err(ChatError::validation("priority must be within 0..=100"));
        }

        let id = Self::new_id();
        let now = Self::now();
        sqlx::query(
            "INSERT INTO lorebook_entries (
                id, lorebook_id, name, keywords, content, priority, is_enabled,
                case_sensitive, match_whole_word, insertion_position, token_budget,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(lorebook_id)
        .bind(&draft.name)
        .bind(json_list(&keywords))
        .bind(&draft.content)
        .bind(draft.priority)
        .bind(draft.is_enabled.unwrap_or(true))
        .bind(draft.case_sensitive)
        .bind(draft.match_whole_word)
        .bind(
            draft
                .insertion_position
                .unwrap_or(InsertionPosition::AfterSystem)
                .as_str(),
        )
        .bind(draft.token_budget)
        .bind(&now)
        .bind(&now)
        .execute(self.pool())
        .await?;

        self.get_lorebook_entry(&id).await
    }

    pub async fn update_lorebook_entry(
        &self,
        id: &str,
        draft: LorebookEntryDraft,
    ) -> Result<LorebookEntry, ChatError> {
        let existing = self.get_lorebook_entry(id).await?;
        let keywords: Vec<String> = draft
            .keywords
            .iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        if keywords.is_empty() {
            return Err(ChatError::validation(
                "a lorebook entry needs at least one keyword",
            ));
        }
        if !(0..=100).contains(&draft.priority) {
            return Err(ChatError::validation("priority must be within 0..=100"));
        }

        sqlx::query(
            "UPDATE lorebook_entries SET
                name = ?, keywords = ?, content = ?, priority = ?, is_enabled = ?,
                case_sensitive = ?, match_whole_word = ?, insertion_position = ?,
                token_budget = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&draft.name)
        .bind(json_list(&keywords))
        .bind(&draft.content)
        .bind(draft.priority)
        .bind(draft.is_enabled.unwrap_or(existing.is_enabled))
        .bind(draft.case_sensitive)
        .bind(draft.match_whole_word)
        .bind(
            draft
                .insertion_position
                .unwrap_or(existing.insertion_position)
                .as_str(),
        )
        .bind(draft.token_budget)
        .bind(Self::now())
        .bind(id)
        .execute(self.pool())
        .await?;

        self.get_lorebook_entry(id).await
    }

    pub async fn get_lorebook_entry(&self, id: &str) -> Result<LorebookEntry, ChatError> {
        let row = sqlx::query("SELECT * FROM lorebook_entries WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| ChatError::not_found(format!("lorebook entry {id}")))?;
        Ok(lorebook_entry_from_row(&row))
    }

    pub async fn list_lorebook_entries(
        &self,
        lorebook_id: &str,
    ) -> Result<Vec<LorebookEntry>, ChatError> {
        let rows = sqlx::query(
            "SELECT * FROM lorebook_entries WHERE lorebook_id = ? ORDER BY priority DESC, id ASC",
        )
        .bind(lorebook_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(lorebook_entry_from_row).collect())
    }

    pub async fn delete_lorebook_entry(&self, id: &str) -> Result<(), ChatError> {
        let result = sqlx::query("DELETE FROM lorebook_entries WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(ChatError::not_found(format!("lorebook entry {id}")));
        }
        Ok(())
    }

    // -- conversation attachment --------------------------------------------

    pub async fn attach_lorebook(
        &self,
        conversation_id: &str,
        lorebook_id: &str,
    ) -> Result<(), ChatError> {
        self.get_conversation(conversation_id).await?;
        self.get_lorebook(lorebook_id).await?;
        sqlx::query(
            "INSERT OR IGNORE INTO conversation_lorebooks (conversation_id, lorebook_id) VALUES (?, ?)",
        )
        .bind(conversation_id)
        .bind(lorebook_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn detach_lorebook(
        &self,
        conversation_id: &str,
        lorebook_id: &str,
    ) -> Result<(), ChatError> {
        sqlx::query(
            "DELETE FROM conversation_lorebooks WHERE conversation_id = ? AND lorebook_id = ?",
        )
        .bind(conversation_id)
        .bind(lorebook_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub(super) async fn lorebook_ids_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<String>, ChatError> {
        use sqlx::Row;
        let rows = sqlx::query(
            "SELECT lorebook_id FROM conversation_lorebooks WHERE conversation_id = ? ORDER BY lorebook_id",
        )
        .bind(conversation_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .iter()
            .map(|row| row.try_get("lorebook_id").unwrap_or_default())
            .collect())
    }

    /// Enabled entries visible to a conversation: its attached lorebooks plus
    /// every enabled global lorebook.
    pub async fn entries_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<LorebookEntry>, ChatError> {
        let rows = sqlx::query(
            "SELECT e.* FROM lorebook_entries e
             JOIN lorebooks b ON b.id = e.lorebook_id
             WHERE e.is_enabled = 1 AND b.is_enabled = 1
               AND (b.is_global = 1 OR b.id IN (
                    SELECT lorebook_id FROM conversation_lorebooks WHERE conversation_id = ?
               ))
             ORDER BY e.priority DESC, e.id ASC",
        )
        .bind(conversation_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(lorebook_entry_from_row).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::CharacterDraft;

    #[tokio::test]
    async fn entries_require_keywords() {
        let store = Store::in_memory().await.unwrap();
        let book = store.create_lorebook("World", "", false).await.unwrap();

        let err = store
            .create_lorebook_entry(
                &book.id,
                LorebookEntryDraft {
                    name: "empty".to_string(),
                    keywords: vec!["  ".to_string()],
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[tokio::test]
    async fn conversation_sees_attached_and_global_entries() {
        let store = Store::in_memory().await.unwrap();
        let character = store
            .create_character(CharacterDraft {
                name: "Aria".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let conversation = store
            .create_conversation(&[character.id], None, None)
            .await
            .unwrap();

        let attached = store.create_lorebook("Attached", "", false).await.unwrap();
        let global = store.create_lorebook("Global", "", true).await.unwrap();
        let unrelated = store.create_lorebook("Elsewhere", "", false).await.unwrap();

        for (book, keyword) in [(&attached, "dragon"), (&global, "moon"), (&unrelated, "sun")] {
            store
                .create_lorebook_entry(
                    &book.id,
                    LorebookEntryDraft {
                        name: keyword.to_string(),
                        keywords: vec![keyword.to_string()],
                        content: format!("about the {keyword}"),
                        priority: 50,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }

        store
            .attach_lorebook(&conversation.id, &attached.id)
            .await
            .unwrap();

        let entries = store
            .entries_for_conversation(&conversation.id)
            .await
            .unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"dragon"));
        assert!(names.contains(&"moon"));
        assert!(!names.contains(&"sun"));

        store
            .detach_lorebook(&conversation.id, &attached.id)
            .await
            .unwrap();
        let entries = store
            .entries_for_conversation(&conversation.id)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
    }
}
