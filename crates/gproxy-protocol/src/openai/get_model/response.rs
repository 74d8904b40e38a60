pub type GetModelResponse = crate::openai::get_model::types::Model;
