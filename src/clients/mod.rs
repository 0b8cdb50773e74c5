pub mod openai;
pub mod traits;

pub use openai::OpenAiCompatibleClient;
pub use traits::{ClientError, CompletionClient, CompletionRequest};
