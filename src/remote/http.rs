use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};

use crate::storage::{Note, NoteId};

use super::{NotePatch, RemoteError, RemoteStore};

/// JSON-over-HTTP client for the remote note store.
///
/// Routes: `GET/POST {base}/owners/{owner}/notes`, `PATCH/DELETE {base}/notes/{id}`.
pub struct HttpRemote {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: String, token: Option<String>) -> Result<Self, RemoteError> {
        // Normalize URL - ensure no trailing slash
        let base_url = base_url.trim_end_matches('/').to_string();

        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(RemoteError::InvalidUrl(
                "URL must start with http:// or https://".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn owner_notes_url(&self, owner_id: &str) -> String {
        self.url(&format!("owners/{}/notes", urlencoding::encode(owner_id)))
    }

    fn note_url(&self, note_id: NoteId) -> String {
        self.url(&format!("notes/{}", note_id))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response, RemoteError> {
        self.authorize(request).send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                RemoteError::NetworkUnavailable(e.to_string())
            } else {
                RemoteError::Http(e)
            }
        })
    }

    /// Map non-success statuses onto the error taxonomy
    async fn check(response: Response, note_id: Option<NoteId>) -> Result<Response, RemoteError> {
        match (response.status(), note_id) {
            (StatusCode::NOT_FOUND, Some(id)) => Err(RemoteError::NotFound(id)),
            (StatusCode::CONFLICT, Some(id)) => Err(RemoteError::Conflict(id)),
            (status, _) if !status.is_success() => Err(RemoteError::Server {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
            _ => Ok(response),
        }
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn fetch_all(&self, owner_id: &str) -> Result<Vec<Note>, RemoteError> {
        let response = self.send(self.client.get(self.owner_notes_url(owner_id))).await?;
        let response = Self::check(response, None).await?;
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn create(&self, owner_id: &str, note: &Note) -> Result<Note, RemoteError> {
        let request = self.client.post(self.owner_notes_url(owner_id)).json(note);
        let response = self.send(request).await?;
        let response = Self::check(response, Some(note.id)).await?;
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn update(&self, note_id: NoteId, patch: &NotePatch) -> Result<(), RemoteError> {
        let request = self.client.patch(self.note_url(note_id)).json(patch);
        let response = self.send(request).await?;
        Self::check(response, Some(note_id)).await?;
        Ok(())
    }

    async fn delete(&self, note_id: NoteId) -> Result<(), RemoteError> {
        let response = self.send(self.client.delete(self.note_url(note_id))).await?;
        Self::check(response, Some(note_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_http_url() {
        assert!(matches!(
            HttpRemote::new("ftp://example.com".into(), None),
            Err(RemoteError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_routes() {
        let remote = HttpRemote::new("https://notes.example.com/api/".into(), None).unwrap();
        assert_eq!(
            remote.owner_notes_url("jo doe"),
            "https://notes.example.com/api/owners/jo%20doe/notes"
        );
        assert_eq!(remote.note_url(42), "https://notes.example.com/api/notes/42");
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_unavailable() {
        // Port 9 (discard) on localhost is essentially never listening
        let remote = HttpRemote::new("http://127.0.0.1:9".into(), None).unwrap();
        let err = remote.fetch_all("me").await.unwrap_err();
        assert!(err.is_transient());
    }
}
