use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;

use super::{SelectionQuery, Track, TrackCatalog};
use crate::error::{Error, Result};

#[derive(Serialize)]
struct RandomRequest<'a> {
    count: usize,
    exclude_keys: &'a [String],
    genres: &'a [String],
}

/// JSON-over-HTTP catalog client.
///
/// Endpoints: `POST /tracks/select`, `POST /tracks/random`,
/// `GET /tracks/by-name?name=…`.
#[derive(Clone)]
pub struct HttpCatalog {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpCatalog {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn map_err(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::CatalogTimeout(self.timeout)
        } else {
            Error::Catalog(e.to_string())
        }
    }

    async fn post_tracks<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Vec<Track>> {
        let resp = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        if !resp.status().is_success() {
            return Err(Error::Catalog(format!("{path}: HTTP {}", resp.status())));
        }
        resp.json::<Vec<Track>>().await.map_err(|e| self.map_err(e))
    }
}

#[async_trait]
impl TrackCatalog for HttpCatalog {
    async fn select_tracks(&self, query: &SelectionQuery) -> Result<Vec<Track>> {
        self.post_tracks("/tracks/select", query).await
    }

    async fn random_tracks(
        &self,
        count: usize,
        exclude_keys: &[String],
        genres: &[String],
    ) -> Result<Vec<Track>> {
        let body = RandomRequest {
            count,
            exclude_keys,
            genres,
        };
        self.post_tracks("/tracks/random", &body).await
    }

    async fn resolve_by_name(&self, name: &str) -> Result<Option<Track>> {
        let resp = self
            .client
            .get(self.url("/tracks/by-name"))
            .query(&[("name", name)])
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => resp
                .json::<Track>()
                .await
                .map(Some)
                .map_err(|e| self.map_err(e)),
            s => Err(Error::Catalog(format!("/tracks/by-name: HTTP {s}"))),
        }
    }
}
