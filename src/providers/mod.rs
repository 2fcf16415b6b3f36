pub mod embedding;
pub mod llm;
pub mod specialist;

pub use embedding::{EmbeddingProvider, HashingEmbeddingProvider, OpenAIEmbeddingProvider};
pub use llm::{AnthropicProvider, LLMProvider, Message, OpenAIProvider, StaticLLMProvider};
pub use specialist::HttpSpecialistClient;
