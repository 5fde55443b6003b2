use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::receipt::ServiceId;

/// Preprocessed image ready for an AI vendor call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreparedImage {
    pub base64: String,
    pub size_bytes: u64,
}

/// One positioned text block from the on-device OCR engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrBlock {
    pub text: String,
    /// Approximate vertical position of the block, top of image = 0.
    pub top: f32,
}

/// Full OCR output: the raw text blob plus positioned blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrOutput {
    pub text: String,
    pub blocks: Vec<OcrBlock>,
}

/// External collaborators the scheduler drives a job through: image
/// preprocessing, the vendor AI call, and the on-device OCR engine.
///
/// The concrete HTTP clients live outside this crate; the queue only needs
/// the raw text each one produces.
#[async_trait]
pub trait ReceiptProviders: Send + Sync {
    /// Read and compress the image at `uri`, returning it base64-encoded.
    async fn preprocess_image(&self, uri: &str) -> Result<PreparedImage, ProviderError>;

    /// Send the image to the given vision-AI vendor and return its raw
    /// text reply.
    async fn call_ai_service(
        &self,
        service_id: ServiceId,
        image_base64: &str,
    ) -> Result<String, ProviderError>;

    /// Run on-device text recognition against the image at `uri`.
    async fn recognize_text_offline(&self, uri: &str) -> Result<OcrOutput, ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),

    #[error("OCR recognition failed: {0}")]
    Ocr(String),

    #[error("image read failed: {0}")]
    Io(String),
}
