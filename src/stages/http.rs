//! Remote stage services reached over HTTP.
//!
//! Endpoint: POST `<base_url><service path>` with the stage input as JSON
//! Header: `X-Pipeline-ID: <pipeline id>`
//! Response: the stage output as JSON

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::domain::{PipelineContext, StageName};

use super::Capability;

pub const PIPELINE_ID_HEADER: &str = "X-Pipeline-ID";

/// Build the shared client used by every remote stage
pub fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to build HTTP client")
}

/// Service path handling `stage`
pub fn service_path(stage: StageName) -> &'static str {
    match stage {
        StageName::KeywordFetch => "/keywords/fetch",
        StageName::ScriptGenerate => "/scripts/generate",
        StageName::TtsRender => "/tts/render",
        StageName::VideoAssemble => "/videos/assemble",
        StageName::ThumbnailMake => "/thumbnails/generate",
        StageName::MetadataBuild => "/metadata/generate",
        StageName::Upload => "/upload/youtube",
        StageName::AbTest => "/abtests/create",
    }
}

/// Capability forwarding to a remote stage service
pub struct HttpStage<I, O> {
    client: reqwest::Client,
    stage: StageName,
    url: String,
    _io: PhantomData<fn(&I) -> O>,
}

impl<I, O> HttpStage<I, O> {
    pub fn new(client: reqwest::Client, stage: StageName, base_url: &str) -> Self {
        let url = format!("{}{}", base_url.trim_end_matches('/'), service_path(stage));
        Self {
            client,
            stage,
            url,
            _io: PhantomData,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl<I, O> fmt::Debug for HttpStage<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpStage")
            .field("stage", &self.stage)
            .field("url", &self.url)
            .finish()
    }
}

/// Boxed remote capability, typed by the registry slot it is assigned to
pub fn remote<I, O>(
    client: &reqwest::Client,
    stage: StageName,
    base_url: &str,
) -> Arc<dyn Capability<Input = I, Output = O>>
where
    I: Serialize + Send + Sync + 'static,
    O: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    Arc::new(HttpStage::<I, O>::new(client.clone(), stage, base_url))
}

#[async_trait]
impl<I, O> Capability for HttpStage<I, O>
where
    I: Serialize + Send + Sync,
    O: Serialize + DeserializeOwned + Send + Sync,
{
    type Input = I;
    type Output = O;

    fn name(&self) -> &str {
        &self.url
    }

    async fn execute(&self, input: &I, context: &PipelineContext) -> Result<O> {
        debug!(stage = %self.stage, url = %self.url, "Calling stage service");

        let response = self
            .client
            .post(&self.url)
            .header(PIPELINE_ID_HEADER, &context.id)
            .json(input)
            .send()
            .await
            .with_context(|| format!("Failed to reach {} service", self.stage))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("{} service error ({}): {}", self.stage, status, text)
        }

        response
            .json::<O>()
            .await
            .with_context(|| format!("Invalid response from {} service", self.stage))
    }
}
