use serde_json::Value;

use super::types::{character_from_row, Character, CharacterDraft, PovType, Rating};
use super::Store;
use crate::core::errors::ChatError;

impl Store {
    pub async fn create_character(&self, draft: CharacterDraft) -> Result<Character, ChatError> {
        let name = draft.name.trim();
        if name.is_empty() {
            return Err(ChatError::validation("character name must not be empty"));
        }

        let id = Self::new_id();
        let now = Self::now();

        sqlx::query(
            "INSERT INTO characters (
                id, name, description, personality, scenario, backstory,
                system_prompt, first_message, alternate_greetings, example_dialogues,
                physical_traits, speech_patterns, likes, dislikes, tags, avatar_ref,
                rating, pov_type, is_bundled, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(name)
        .bind(&draft.description)
        .bind(&draft.personality)
        .bind(&draft.scenario)
        .bind(&draft.backstory)
        .bind(&draft.system_prompt)
        .bind(&draft.first_message)
        .bind(json_list(&draft.alternate_greetings))
        .bind(&draft.example_dialogues)
        .bind(&draft.physical_traits)
        .bind(&draft.speech_patterns)
        .bind(json_list(&draft.likes))
        .bind(json_list(&draft.dislikes))
        .bind(json_list(&draft.tags))
        .bind(&draft.avatar_ref)
        .bind(draft.rating.unwrap_or(Rating::Sfw).as_str())
        .bind(draft.pov_type.unwrap_or(PovType::Any).as_str())
        .bind(draft.is_bundled)
        .bind(&now)
        .bind(&now)
        .execute(self.pool())
        .await?;

        self.get_character(&id).await
    }

    pub async fn update_character(
        &self,
        id: &str,
        draft: CharacterDraft,
    ) -> Result<Character, ChatError> {
        let existing = self.get_character(id).await?;
        let name = if draft.name.trim().is_empty() {
            existing.name.clone()
        } else {
            draft.name.trim().to_string()
        };

        sqlx::query(
            "UPDATE characters SET
                name = ?, description = ?, personality = ?, scenario = ?, backstory = ?,
                system_prompt = ?, first_message = ?, alternate_greetings = ?,
                example_dialogues = ?, physical_traits = ?, speech_patterns = ?,
                likes = ?, dislikes = ?, tags = ?, avatar_ref = ?,
                rating = ?, pov_type = ?, updated_at = ?
            WHERE id = ?",
        )
        .bind(&name)
        .bind(&draft.description)
        .bind(&draft.personality)
        .bind(&draft.scenario)
        .bind(&draft.backstory)
        .bind(&draft.system_prompt)
        .bind(&draft.first_message)
        .bind(json_list(&draft.alternate_greetings))
        .bind(&draft.example_dialogues)
        .bind(&draft.physical_traits)
        .bind(&draft.speech_patterns)
        .bind(json_list(&draft.likes))
        .bind(json_list(&draft.dislikes))
        .bind(json_list(&draft.tags))
        .bind(&draft.avatar_ref)
        .bind(draft.rating.unwrap_or(existing.rating).as_str())
        .bind(draft.pov_type.unwrap_or(existing.pov_type).as_str())
        .bind(Self::now())
        .bind(id)
        .execute(self.pool())
        .await?;

        self.get_character(id).await
    }

    pub async fn get_character(&self, id: &str) -> Result<Character, ChatError> {
        let row = sqlx::query("SELECT * FROM characters WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| ChatError::not_found(format!("character {id}")))?;
        Ok(character_from_row(&row))
    }

    pub async fn list_characters(&self) -> Result<Vec<Character>, ChatError> {
        let rows = sqlx::query("SELECT * FROM characters ORDER BY name COLLATE NOCASE ASC")
            .fetch_all(self.pool())
            .await?;
        Ok(rows.iter().map(character_from_row).collect())
    }

    pub async fn delete_character(&self, id: &str) -> Result<(), ChatError> {
        let result = sqlx::query("DELETE FROM characters WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(ChatError::not_found(format!("character {id}")));
        }
        Ok(())
    }
}

pub(super) fn json_list(items: &[String]) -> Value {
    Value::Array(items.iter().cloned().map(Value::String).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_fetch_character() {
        let store = Store::in_memory().await.unwrap();
        let created = store
            .create_character(CharacterDraft {
                name: "Aria".to_string(),
                description: "A wandering bard".to_string(),
                tags: vec!["fantasy".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();

        let fetched = store.get_character(&created.id).await.unwrap();
        assert_eq!(fetched.name, "Aria");
        assert_eq!(fetched.tags, vec!["fantasy".to_string()]);
        assert_eq!(fetched.rating, Rating::Sfw);
    }

    #[tokio::test]
    async fn empty_name_is_rejected() {
        let store = Store::in_memory().await.unwrap();
        let err = store
            .create_character(CharacterDraft {
                name: "   ".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[tokio::test]
    async fn delete_missing_character_is_not_found() {
        let store = Store::in_memory().await.unwrap();
        let err = store.delete_character("nope").await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }
}
