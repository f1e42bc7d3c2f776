//! Notebook management over HTTP, and session construction.
//!
//! The HTTP surface is small: create, get, fork, delete. Everything that
//! happens inside a notebook goes over the duplex channel owned by
//! [`Session`].

use std::env;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{
    error::Error,
    session::Session,
    transport::TransportOptions,
    NotebookId, Result, SDK_VERSION,
};

/// Canonical management API endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.notebooks.dev";

pub fn notebook_token() -> String {
    env::var("NOTEBOOK_TOKEN").expect("Need to set NOTEBOOK_TOKEN")
}

pub fn notebook_api_url() -> Option<String> { env::var("NOTEBOOK_API_URL").ok() }

/// A notebook as the management API reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotebookData {
    pub id:       NotebookId,
    /// Duplex channel endpoint for this notebook.
    pub okra_url: String,
    #[serde(rename = "type")]
    pub kind:     String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNotebook {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub debug:        bool,
    /// Keep sessions' sockets closed until first use. Default true.
    pub start_closed: bool,
    pub telemetry:    bool,
    /// Injectable HTTP client, mostly for tests.
    pub http:         Option<reqwest::Client>,
    pub transport:    TransportOptions,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            debug:        false,
            start_closed: true,
            telemetry:    false,
            http:         None,
            transport:    TransportOptions::default(),
        }
    }
}

/// Entry point: authenticated access to the notebook management API and a
/// factory for [`Session`]s.
#[derive(Debug, Clone)]
pub struct NotebookClient {
    token:    String,
    base_url: String,
    http:     reqwest::Client,
    options:  ClientOptions,
}

impl NotebookClient {
    pub fn new(
        token: impl Into<String>,
        base_url: Option<String>,
        options: ClientOptions,
    ) -> Result<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(Error::InvalidConfig("auth token must not be empty".into()));
        }
        options.transport.validate()?;
        Ok(Self {
            token,
            base_url: base_url
                .or_else(notebook_api_url)
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned()),
            http: options.http.clone().unwrap_or_default(),
            options,
        })
    }

    #[instrument(level = "debug", skip(self, request))]
    pub async fn create(&self, request: &CreateNotebook) -> Result<NotebookData> {
        let response = self
            .http
            .post(format!("{}/notebook", self.base_url))
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn get(&self, id: &str) -> Result<NotebookData> {
        let response = self
            .http
            .get(format!("{}/notebook/{id}", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn fork(&self, id: &str) -> Result<NotebookData> {
        let response = self
            .http
            .post(format!("{}/notebook/{id}/fork", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.http
            .delete(format!("{}/notebook/{id}", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Builds a session for `notebook`. No I/O happens until the session is
    /// used; with `start_closed` (the default) even the socket stays down.
    pub fn connect(&self, notebook: &NotebookData) -> Result<Session> {
        let mut options = self.options.transport.clone();
        options.socket.start_closed = self.options.start_closed;
        Session::open(with_sdk_version(&notebook.okra_url), options)
    }
}

fn with_sdk_version(url: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}sdk_version={SDK_VERSION}")
}
