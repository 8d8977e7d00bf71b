use crate::llm::{Completion, ImageInput, LlmClient};
use crate::model::Book;
use anyhow::Result;
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct ValuationRequest {
    pub book: Book,
    pub images: Vec<ImageInput>,
    pub max_tokens: u32,
    pub required_sections: Vec<String>,
}

/// Produces a valuation report for a book from its images.
#[async_trait]
pub trait ValuationModel: Send + Sync {
    fn model_id(&self) -> &str;
    async fn generate(&self, request: &ValuationRequest) -> Result<Completion>;
}

const SYSTEM_PROMPT: &str = "You are an antiquarian bookseller appraising a book for a collector. \
Base every statement on what the photographs show. Describe the binding, edition points and condition, \
then give a market valuation.";

pub fn build_prompt(request: &ValuationRequest) -> String {
    let mut prompt = format!(
        "Title: {}\nAuthor: {}\nPhotographs attached: {}\n\n",
        request.book.title,
        request.book.author.as_deref().unwrap_or("unknown"),
        request.images.len()
    );
    prompt.push_str("Write the report in Markdown. ");
    if !request.required_sections.is_empty() {
        prompt.push_str("Include these sections, with these exact headings: ");
        prompt.push_str(&request.required_sections.join(", "));
        prompt.push_str(". ");
    }
    prompt.push_str(
        "Finish with a valuation block of exactly three lines:\nLow: $<amount>\nMid: $<amount>\nHigh: $<amount>\n",
    );
    prompt
}

pub struct LlmValuationModel {
    client: LlmClient,
    model: String,
}

impl LlmValuationModel {
    pub fn new(client: LlmClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl ValuationModel for LlmValuationModel {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &ValuationRequest) -> Result<Completion> {
        self.client
            .complete(
                &self.model,
                request.max_tokens,
                Some(SYSTEM_PROMPT),
                &build_prompt(request),
                &request.images,
            )
            .await
    }
}
