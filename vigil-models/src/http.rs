//! HTTP client fronting the external detection service.
//!
//! The models run in their own service (GPU-pinned, out of scope for the
//! core); this client ships frames as base64 JPEG and maps the responses
//! onto the runner traits. Calls are bounded by a request timeout and
//! retried twice with a short back-off, so one flaky response does not fail
//! a frame.

use std::time::Duration;

use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable as _};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use eyre::Context as _;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use vigil_types::BBox;

use crate::Embedding;
use crate::imaging::encode_jpeg;
use crate::runners::{
    Detection, FaceDetector, FaceEmbedder, PhoneDetector, SpoofChecker, SpoofOutcome,
};

/// Settings for [`HttpModelRunner`].
#[derive(Debug, Clone)]
pub struct HttpModelConfig {
    /// Base URL of the detection service, e.g. `http://face-ingestor:8010`.
    pub base_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Extra attempts after a failed call.
    pub retries: usize,
    /// Delay between attempts.
    pub retry_delay: Duration,
}

impl Default for HttpModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://face-ingestor:8010".to_owned(),
            timeout: Duration::from_millis(1500),
            retries: 2,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// One client serving all four runner traits.
#[derive(Debug, Clone)]
pub struct HttpModelRunner {
    client: reqwest::Client,
    config: HttpModelConfig,
}

#[derive(Serialize)]
struct ImageRequest<'a> {
    image: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    bbox: Option<[i32; 4]>,
}

#[derive(Deserialize)]
struct DetectResponse {
    #[serde(default)]
    bbox: Option<[i32; 4]>,
    #[serde(default)]
    confidence: Option<f32>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct SpoofResponse {
    is_real: bool,
    score: f32,
}

impl HttpModelRunner {
    /// Builds the client.
    pub fn new(config: HttpModelConfig) -> eyre::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("cannot build detection-service client")?;
        Ok(Self { client, config })
    }

    async fn post<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        request: &Req,
    ) -> eyre::Result<Resp> {
        let url = format!("{}/{endpoint}", self.config.base_url.trim_end_matches('/'));
        let response = (|| async {
            self.client
                .post(&url)
                .json(request)
                .send()
                .await?
                .error_for_status()
        })
        .retry(
            ConstantBuilder::default()
                .with_delay(self.config.retry_delay)
                .with_max_times(self.config.retries),
        )
        .sleep(tokio::time::sleep)
        .notify(|err, delay| {
            tracing::warn!("detection service call to {endpoint} failed: {err:?} - retrying in {delay:?}")
        })
        .await
        .with_context(|| format!("detection service call to {endpoint} failed"))?;
        response
            .json::<Resp>()
            .await
            .with_context(|| format!("invalid response from {endpoint}"))
    }

    fn encode_frame(frame: &RgbImage) -> eyre::Result<String> {
        Ok(BASE64.encode(encode_jpeg(frame)?))
    }

    fn into_detection(response: DetectResponse) -> Option<Detection> {
        response.bbox.map(|bbox| Detection {
            bbox: BBox::from(bbox),
            confidence: response.confidence.unwrap_or(0.0),
        })
    }

    fn warmup_frame() -> RgbImage {
        RgbImage::new(240, 240)
    }
}

#[async_trait]
impl FaceDetector for HttpModelRunner {
    async fn detect_face(&self, frame: &RgbImage) -> eyre::Result<Option<Detection>> {
        let image = Self::encode_frame(frame)?;
        let response: DetectResponse = self
            .post("detect", &ImageRequest { image: &image, bbox: None })
            .await?;
        Ok(Self::into_detection(response))
    }

    async fn warmup(&self) -> eyre::Result<()> {
        self.detect_face(&Self::warmup_frame()).await.map(|_| ())
    }
}

#[async_trait]
impl PhoneDetector for HttpModelRunner {
    async fn detect_phone(&self, frame: &RgbImage) -> eyre::Result<Option<Detection>> {
        let image = Self::encode_frame(frame)?;
        let response: DetectResponse = self
            .post("detect_phone", &ImageRequest { image: &image, bbox: None })
            .await?;
        Ok(Self::into_detection(response))
    }

    async fn warmup(&self) -> eyre::Result<()> {
        self.detect_phone(&Self::warmup_frame()).await.map(|_| ())
    }
}

#[async_trait]
impl FaceEmbedder for HttpModelRunner {
    async fn embed(&self, patch: &RgbImage) -> eyre::Result<Embedding> {
        let image = Self::encode_frame(patch)?;
        let response: EmbedResponse = self
            .post("embed", &ImageRequest { image: &image, bbox: None })
            .await?;
        if response.embedding.is_empty() {
            eyre::bail!("detection service returned an empty embedding");
        }
        Ok(Embedding(response.embedding))
    }

    async fn warmup(&self) -> eyre::Result<()> {
        self.embed(&Self::warmup_frame()).await.map(|_| ())
    }
}

#[async_trait]
impl SpoofChecker for HttpModelRunner {
    async fn check_spoof(&self, frame: &RgbImage, bbox: BBox) -> eyre::Result<SpoofOutcome> {
        let image = Self::encode_frame(frame)?;
        let response: SpoofResponse = self
            .post(
                "check_spoof",
                &ImageRequest {
                    image: &image,
                    bbox: Some(bbox.into()),
                },
            )
            .await?;
        Ok(SpoofOutcome {
            is_real: response.is_real,
            score: response.score,
        })
    }

    async fn warmup(&self) -> eyre::Result<()> {
        self.check_spoof(&Self::warmup_frame(), BBox::from([0, 0, 239, 239]))
            .await
            .map(|_| ())
    }
}
