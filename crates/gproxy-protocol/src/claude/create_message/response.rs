pub type CreateMessageResponse = crate::claude::create_message::types::BetaMessage;
