pub type GetModelResponse = crate::claude::get_model::types::ModelInfo;
