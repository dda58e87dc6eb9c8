use super::types::{persona_from_row, Persona};
use super::Store;
use crate::core::errors::ChatError;

impl Store {
    pub async fn create_persona(
        &self,
        name: &str,
        description: &str,
        is_default: bool,
    ) -> Result<Persona, ChatError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::validation("persona name must not be empty"));
        }

        let id = Self::new_id();
        let now = Self::now();

        let mut tx = self.pool().begin().await?;
        if is_default {
            sqlx::query("UPDATE personas SET is_default = 0 WHERE is_default = 1")
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(
            "INSERT INTO personas (id, name, description, is_default, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(name)
        .bind(description)
        .bind(is_default)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.get_persona(&id).await
    }

    pub async fn update_persona(
        &self,
        id: &str,
        name: &str,
        description: &str,
    ) -> Result<Persona, ChatError> {
        let result = sqlx::query(
            "UPDATE personas SET name = ?, description = ?, updated_at = ? WHERE id = ?",
        )
        .bind(name.trim())
        .bind(description)
        .bind(Self::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(ChatError::not_found(format!("persona {id}")));
        }
        self.get_persona(id).await
    }

    /// Make one persona the default, clearing the flag everywhere else in the
    /// same transaction so at most one row ever carries it.
    pub async fn set_default_persona(&self, id: &str) -> Result<Persona, ChatError> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("UPDATE personas SET is_default = 0 WHERE is_default = 1")
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("UPDATE personas SET is_default = 1, updated_at = ? WHERE id = ?")
            .bind(Self::now())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ChatError::not_found(format!("persona {id}")));
        }
        tx.commit().await?;
        self.get_persona(id).await
    }

    pub async fn get_persona(&self, id: &str) -> Result<Persona, ChatError> {
        let row = sqlx::query("SELECT * FROM personas WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| ChatError::not_found(format!("persona {id}")))?;
        Ok(persona_from_row(&row))
    }

    pub async fn default_persona(&self) -> Result<Option<Persona>, ChatError> {
        let row = sqlx::query("SELECT * FROM personas WHERE is_default = 1 LIMIT 1")
            .fetch_optional(self.pool())
            .await?;
        Ok(row.as_ref().map(persona_from_row))
    }

    pub async fn list_personas(&self) -> Result<Vec<Persona>, ChatError> {
        let rows = sqlx::query("SELECT * FROM personas ORDER BY name COLLATE NOCASE ASC")
            .fetch_all(self.pool())
            .await?;
        Ok(rows.iter().map(persona_from_row).collect())
    }

    pub async fn delete_persona(&self, id: &str) -> Result<(), ChatError> {
        let result = sqlx::query("DELETE FROM personas WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(ChatError::not_found(format!("persona {id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn at_most_one_default_persona() {
        let store = Store::in_memory().await.unwrap();
        let a = store.create_persona("Alex", "", true).await.unwrap();
        assert!(a.is_default);

        let b = store.create_persona("Blake", "", true).await.unwrap();
        assert!(b.is_default);

        let a = store.get_persona(&a.id).await.unwrap();
        assert!(!a.is_default);

        store.set_default_persona(&a.id).await.unwrap();
        let b = store.get_persona(&b.id).await.unwrap();
        assert!(!b.is_default);

        let defaults = store
            .list_personas()
            .await
            .unwrap()
            .into_iter()
            .filter(|p| p.is_default)
            .count();
        assert_eq!(defaults, 1);
    }
}
