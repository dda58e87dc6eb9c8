use super::types::{download_from_row, Download, DownloadKind, DownloadStatus};
use super::Store;
use crate::core::errors::ChatError;

impl Store {
    pub async fn create_download(
        &self,
        url: &str,
        destination_path: &str,
        kind: DownloadKind,
        checksum: Option<&str>,
    ) -> Result<Download, ChatError> {
        if url.trim().is_empty() {
            return Err(ChatError::validation("download url must not be empty"));
        }

        let id = Self::new_id();
        let now = Self::now();
        sqlx::query(
            "INSERT INTO downloads (id, url, destination_path, kind, expected_size, downloaded_bytes, status, checksum, error, created_at, updated_at)
             VALUES (?, ?, ?, ?, NULL, 0, 'pending', ?, NULL, ?, ?)",
        )
        .bind(&id)
        .bind(url)
        .bind(destination_path)
        .bind(kind.as_str())
        .bind(checksum)
        .bind(&now)
        .bind(&now)
        .execute(self.pool())
        .await?;

        self.get_download(&id).await
    }

    pub async fn get_download(&self, id: &str) -> Result<Download, ChatError> {
        let row = sqlx::query("SELECT * FROM downloads WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| ChatError::not_found(format!("download {id}")))?;
        Ok(download_from_row(&row))
    }

    pub async fn list_downloads(&self) -> Result<Vec<Download>, ChatError> {
        let rows = sqlx::query("SELECT * FROM downloads ORDER BY created_at DESC")
            .fetch_all(self.pool())
            .await?;
        Ok(rows.iter().map(download_from_row).collect())
    }

    pub async fn set_download_expected_size(
        &self,
        id: &str,
        expected_size: i64,
    ) -> Result<(), ChatError> {
        sqlx::query("UPDATE downloads SET expected_size = ?, updated_at = ? WHERE id = ?")
            .bind(expected_size)
            .bind(Self::now())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_download_progress(
        &self,
        id: &str,
        downloaded_bytes: i64,
    ) -> Result<(), ChatError> {
        sqlx::query("UPDATE downloads SET downloaded_bytes = ?, updated_at = ? WHERE id = ?")
            .bind(downloaded_bytes)
            .bind(Self::now())
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_download_status(
        &self,
        id: &str,
        status: DownloadStatus,
        error: Option<&str>,
    ) -> Result<(), ChatError> {
        let result =
            sqlx::query("UPDATE downloads SET status = ?, error = ?, updated_at = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(error)
                .bind(Self::now())
                .bind(id)
                .execute(self.pool())
                .await?;
        if result.rows_affected() == 0 {
            return Err(ChatError::not_found(format!("download {id}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn download_lifecycle_fields() {
        let store = Store::in_memory().await.unwrap();
        let download = store
            .create_download(
                "http://localhost/model.gguf",
                "/tmp/model.gguf",
                DownloadKind::Model,
                Some("abc123"),
            )
            .await
            .unwrap();
        assert_eq!(download.status, DownloadStatus::Pending);
        assert_eq!(download.downloaded_bytes, 0);

        store
            .set_download_expected_size(&download.id, 1024)
            .await
            .unwrap();
        store.set_download_progress(&download.id, 512).await.unwrap();
        store
            .set_download_status(&download.id, DownloadStatus::Downloading, None)
            .await
            .unwrap();

        let download = store.get_download(&download.id).await.unwrap();
        assert_eq!(download.expected_size, Some(1024));
        assert_eq!(download.downloaded_bytes, 512);
        assert_eq!(download.status, DownloadStatus::Downloading);
        assert!(!download.status.is_terminal());
    }
}
