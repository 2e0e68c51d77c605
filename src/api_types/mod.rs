pub mod chat_completion;

pub use chat_completion::{
    ContentPart, CreateChatCompletionPayload, Message, MessageContent, ModelListResponse,
    ModelObject,
};
