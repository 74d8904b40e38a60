pub type ListResponseItemsResponse = crate::openai::list_response_items::types::ResponseItemList;
