use std::collections::HashMap;

use serde_json::Value;

use super::types::{message_from_row, Message, NewMessage};
use super::Store;
use crate::core::errors::ChatError;

impl Store {
    /// Append a message under `parent_id` (`None` for a root greeting).
    ///
    /// The new node takes the next free `branch_index` among its siblings,
    /// becomes the active branch of its parent (de-flagging the previous
    /// active sibling), and the conversation's `active_message_id` advances
    /// to it. Atomic with respect to readers.
    pub async fn append_child(
        &self,
        conversation_id: &str,
        parent_id: Option<&str>,
        msg: NewMessage,
    ) -> Result<Message, ChatError> {
        let mut tx = self.pool().begin().await?;

        let conversation_exists = sqlx::query("SELECT id FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !conversation_exists {
            return Err(ChatError::not_found(format!(
                "conversation {conversation_id}"
            )));
        }

        if let Some(parent_id) = parent_id {
            let parent = sqlx::query("SELECT conversation_id FROM messages WHERE id = ?")
                .bind(parent_id)
                .fetch_optional(&mut *tx)
                .await?;
            match parent {
                None => return Err(ChatError::not_found(format!("message {parent_id}"))),
                Some(row) => {
                    use sqlx::Row;
                    let owner: String = row.try_get("conversation_id").unwrap_or_default();
                    if owner != conversation_id {
                        return Err(ChatError::validation(
                            "parent message belongs to a different conversation",
                        ));
                    }
                }
            }
        }

        let branch_index: i64 = {
            use sqlx::Row;
            let row = sqlx::query(
                "SELECT COALESCE(MAX(branch_index), -1) + 1 AS next
                 FROM messages WHERE conversation_id = ? AND parent_id IS ?",
            )
            .bind(conversation_id)
            .bind(parent_id)
            .fetch_one(&mut *tx)
            .await?;
            row.try_get("next").unwrap_or(0)
        };

        sqlx::query(
            "UPDATE messages SET is_active_branch = 0
             WHERE conversation_id = ? AND parent_id IS ? AND is_active_branch = 1",
        )
        .bind(conversation_id)
        .bind(parent_id)
        .execute(&mut *tx)
        .await?;

        let id = Self::new_id();
        let now = Self::now();
        sqlx::query(
            "INSERT INTO messages (
                id, conversation_id, parent_id, author_type, author_id, content,
                branch_index, is_active_branch, token_count, generation_params,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(parent_id)
        .bind(msg.author_type.as_str())
        .bind(&msg.author_id)
        .bind(&msg.content)
        .bind(branch_index)
        .bind(msg.token_count)
        .bind(&msg.generation_params)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE conversations SET active_message_id = ?, updated_at = ? WHERE id = ?")
            .bind(&id)
            .bind(&now)
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        self.get_message(&id).await
    }

    /// Re-flag the active branch so that it runs through `message_id`.
    ///
    /// The path from root to the target becomes active, then extends through
    /// each previously-active child down to the deepest reachable leaf.
    /// Off-path siblings along the way are de-flagged; flags deeper inside
    /// inactive subtrees are left as-is so a later switch can re-extend
    /// through them. Returns the new active path, root first.
    pub async fn switch_branch(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<Vec<Message>, ChatError> {
        let mut tx = self.pool().begin().await?;

        let rows = sqlx::query("SELECT * FROM messages WHERE conversation_id = ?")
            .bind(conversation_id)
            .fetch_all(&mut *tx)
            .await?;
        let all: Vec<Message> = rows.iter().map(message_from_row).collect();
        let by_id: HashMap<&str, &Message> = all.iter().map(|m| (m.id.as_str(), m)).collect();

        let Some(target) = by_id.get(message_id) else {
            return Err(ChatError::not_found(format!(
                "message {message_id} in conversation {conversation_id}"
            )));
        };

        // Upward walk: target -> root.
        let mut upward = vec![(*target).clone()];
        let mut cursor = *target;
        while let Some(parent_id) = cursor.parent_id.as_deref() {
            let Some(parent) = by_id.get(parent_id) else {
                return Err(ChatError::Storage(format!(
                    "orphaned message {}: parent {parent_id} missing",
                    cursor.id
                )));
            };
            upward.push((*parent).clone());
            cursor = *parent;
        }
        upward.reverse();
        let mut path = upward;

        // Downward extension: follow previously-active children to the leaf.
        let mut cursor_id = message_id.to_string();
        loop {
            let active_children: Vec<&Message> = all
                .iter()
                .filter(|m| m.parent_id.as_deref() == Some(cursor_id.as_str()) && m.is_active_branch)
                .collect();
            match active_children.len() {
                0 => break,
                1 => {
                    let next = active_children[0].clone();
                    cursor_id = next.id.clone();
                    path.push(next);
                }
                _ => {
                    return Err(ChatError::Storage(format!(
                        "multiple active children under message {cursor_id}"
                    )));
                }
            }
        }

        // Apply flags: activate the path, de-flag off-path siblings.
        for node in &path {
            sqlx::query(
                "UPDATE messages SET is_active_branch = 0
                 WHERE conversation_id = ? AND parent_id IS ? AND id != ?",
            )
            .bind(conversation_id)
            .bind(node.parent_id.as_deref())
            .bind(&node.id)
            .execute(&mut *tx)
            .await?;
            sqlx::query("UPDATE messages SET is_active_branch = 1 WHERE id = ?")
                .bind(&node.id)
                .execute(&mut *tx)
                .await?;
        }

        let leaf_id = path.last().map(|m| m.id.clone()).unwrap_or_default();
        sqlx::query("UPDATE conversations SET active_message_id = ?, updated_at = ? WHERE id = ?")
            .bind(&leaf_id)
            .bind(Self::now())
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        for node in &mut path {
            node.is_active_branch = true;
        }
        Ok(path)
    }

    /// All messages sharing the target's parent, ordered by `branch_index`.
    pub async fn siblings(&self, message_id: &str) -> Result<Vec<Message>, ChatError> {
        let message = self.get_message(message_id).await?;
        let rows = sqlx::query(
            "SELECT * FROM messages
             WHERE conversation_id = ? AND parent_id IS ?
             ORDER BY branch_index ASC",
        )
        .bind(&message.conversation_id)
        .bind(message.parent_id.as_deref())
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(message_from_row).collect())
    }

    /// Root-to-active-leaf sequence. The prompt assembler consumes this; no
    /// other path is ever fed to the model.
    pub async fn active_path(&self, conversation_id: &str) -> Result<Vec<Message>, ChatError> {
        let conversation = self.get_conversation(conversation_id).await?;
        let Some(active_id) = conversation.active_message_id else {
            return Ok(Vec::new());
        };

        let all = self.messages_for_conversation(conversation_id).await?;
        let by_id: HashMap<&str, &Message> = all.iter().map(|m| (m.id.as_str(), m)).collect();

        let Some(mut cursor) = by_id.get(active_id.as_str()).copied() else {
            return Err(ChatError::Storage(format!(
                "active_message_id {active_id} not present in conversation {conversation_id}"
            )));
        };

        let mut path = vec![cursor.clone()];
        while let Some(parent_id) = cursor.parent_id.as_deref() {
            let Some(parent) = by_id.get(parent_id).copied() else {
                return Err(ChatError::Storage(format!(
                    "orphaned message {}: parent {parent_id} missing",
                    cursor.id
                )));
            };
            path.push(parent.clone());
            cursor = parent;
        }
        path.reverse();
        Ok(path)
    }

    pub async fn get_message(&self, id: &str) -> Result<Message, ChatError> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| ChatError::not_found(format!("message {id}")))?;
        Ok(message_from_row(&row))
    }

    pub async fn messages_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Message>, ChatError> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, branch_index ASC",
        )
        .bind(conversation_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(message_from_row).collect())
    }

    /// Overwrite a message's content in place. Used for streaming checkpoints
    /// and finalization of placeholder messages, not for user edits (edits
    /// create siblings).
    pub async fn update_message_content(
        &self,
        id: &str,
        content: &str,
        token_count: i64,
    ) -> Result<(), ChatError> {
        let result = sqlx::query(
            "UPDATE messages SET content = ?, token_count = ?, updated_at = ? WHERE id = ?",
        )
        .bind(content)
        .bind(token_count)
        .bind(Self::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(ChatError::not_found(format!("message {id}")));
        }
        Ok(())
    }

    /// Merge keys into a message's `generation_params` JSON.
    pub async fn merge_generation_params(
        &self,
        id: &str,
        patch: Value,
    ) -> Result<(), ChatError> {
        let message = self.get_message(id).await?;
        let mut params = message
            .generation_params
            .unwrap_or_else(|| Value::Object(Default::default()));
        if let (Value::Object(base), Value::Object(overlay)) = (&mut params, patch) {
            for (key, value) in overlay {
                base.insert(key, value);
            }
        }
        sqlx::query("UPDATE messages SET generation_params = ?, updated_at = ? WHERE id = ?")
            .bind(&params)
            .bind(Self::now())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::types::{AuthorType, CharacterDraft};

    fn user_msg(content: &str) -> NewMessage {
        NewMessage {
            author_type: AuthorType::User,
            author_id: None,
            content: content.to_string(),
            token_count: content.len() as i64 / 4,
            generation_params: None,
        }
    }

    fn character_msg(content: &str, author: &str) -> NewMessage {
        NewMessage {
            author_type: AuthorType::Character,
            author_id: Some(author.to_string()),
            content: content.to_string(),
            token_count: content.len() as i64 / 4,
            generation_params: None,
        }
    }

    async fn seeded() -> (Store, String, String) {
        let store = Store::in_memory().await.unwrap();
        let character = store
            .create_character(CharacterDraft {
                name: "Aria".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let conversation = store
            .create_conversation(&[character.id.clone()], None, None)
            .await
            .unwrap();
        (store, conversation.id, character.id)
    }

    #[tokio::test]
    async fn append_builds_the_active_path() {
        let (store, conversation_id, character_id) = seeded().await;

        let root = store
            .append_child(&conversation_id, None, user_msg("hello"))
            .await
            .unwrap();
        assert_eq!(root.branch_index, 0);
        assert!(root.is_active_branch);

        let reply = store
            .append_child(
                &conversation_id,
                Some(&root.id),
                character_msg("hi there", &character_id),
            )
            .await
            .unwrap();

        let conversation = store.get_conversation(&conversation_id).await.unwrap();
        assert_eq!(conversation.active_message_id.as_deref(), Some(reply.id.as_str()));

        let path = store.active_path(&conversation_id).await.unwrap();
        assert_eq!(path.len(), 2);
        assert_eq!(path[0].id, root.id);
        assert_eq!(path[1].id, reply.id);
        assert!(path.iter().all(|m| m.is_active_branch));
    }

    #[tokio::test]
    async fn sibling_append_deactivates_the_previous_branch() {
        let (store, conversation_id, character_id) = seeded().await;

        let root = store
            .append_child(&conversation_id, None, user_msg("hello"))
            .await
            .unwrap();
        let first = store
            .append_child(
                &conversation_id,
                Some(&root.id),
                character_msg("take one", &character_id),
            )
            .await
            .unwrap();
        let second = store
            .append_child(
                &conversation_id,
                Some(&root.id),
                character_msg("take two", &character_id),
            )
            .await
            .unwrap();

        assert_eq!(second.branch_index, 1);

        let siblings = store.siblings(&second.id).await.unwrap();
        assert_eq!(siblings.len(), 2);
        assert_eq!(siblings[0].id, first.id);
        assert_eq!(siblings[1].id, second.id);

        let indices: Vec<i64> = siblings.iter().map(|m| m.branch_index).collect();
        assert_eq!(indices, vec![0, 1]);

        let active: Vec<&str> = siblings
            .iter()
            .filter(|m| m.is_active_branch)
            .map(|m| m.id.as_str())
            .collect();
        assert_eq!(active, vec![second.id.as_str()]);
    }

    #[tokio::test]
    async fn switch_branch_restores_the_old_path() {
        let (store, conversation_id, character_id) = seeded().await;

        let root = store
            .append_child(&conversation_id, None, user_msg("hello"))
            .await
            .unwrap();
        let first = store
            .append_child(
                &conversation_id,
                Some(&root.id),
                character_msg("take one", &character_id),
            )
            .await
            .unwrap();
        let path_before: Vec<String> = store
            .active_path(&conversation_id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();

        // Regeneration appends a sibling and makes it active.
        store
            .append_child(
                &conversation_id,
                Some(&root.id),
                character_msg("take two", &character_id),
            )
            .await
            .unwrap();

        let restored: Vec<String> = store
            .switch_branch(&conversation_id, &first.id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(restored, path_before);

        let conversation = store.get_conversation(&conversation_id).await.unwrap();
        assert_eq!(conversation.active_message_id.as_deref(), Some(first.id.as_str()));
    }

    #[tokio::test]
    async fn switch_extends_through_previously_active_children() {
        let (store, conversation_id, character_id) = seeded().await;

        let root = store
            .append_child(&conversation_id, None, user_msg("hello"))
            .await
            .unwrap();
        let reply = store
            .append_child(
                &conversation_id,
                Some(&root.id),
                character_msg("take one", &character_id),
            )
            .await
            .unwrap();
        let followup = store
            .append_child(&conversation_id, Some(&reply.id), user_msg("and then?"))
            .await
            .unwrap();

        // Branch off at the first reply, abandoning the follow-up subtree.
        store
            .append_child(
                &conversation_id,
                Some(&root.id),
                character_msg("take two", &character_id),
            )
            .await
            .unwrap();

        // Switching back to the first reply must land on its deepest leaf.
        let path = store
            .switch_branch(&conversation_id, &reply.id)
            .await
            .unwrap();
        let ids: Vec<&str> = path.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec![root.id.as_str(), reply.id.as_str(), followup.id.as_str()]);
    }

    #[tokio::test]
    async fn switch_at_the_active_leaf_is_a_no_op() {
        let (store, conversation_id, character_id) = seeded().await;

        let root = store
            .append_child(&conversation_id, None, user_msg("hello"))
            .await
            .unwrap();
        let leaf = store
            .append_child(
                &conversation_id,
                Some(&root.id),
                character_msg("hi", &character_id),
            )
            .await
            .unwrap();

        let before: Vec<String> = store
            .active_path(&conversation_id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        let after: Vec<String> = store
            .switch_branch(&conversation_id, &leaf.id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn switch_to_foreign_message_is_not_found() {
        let (store, conversation_id, _) = seeded().await;
        let err = store
            .switch_branch(&conversation_id, "missing")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }
}
