pub type InputTokenCountResponse = crate::openai::count_tokens::types::InputTokenCount;
