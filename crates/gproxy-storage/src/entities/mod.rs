pub mod api_keys;
pub mod attempts;
pub mod credential_disallow;
pub mod credentials;
pub mod downstream_requests;
pub mod downstream_traffic;
pub mod endpoints;
pub mod global_config;
pub mod global_models;
pub mod internal_events;
pub mod model_mappings;
pub mod models;
pub mod providers;
pub mod upstream_requests;
pub mod upstream_traffic;
pub mod upstream_usages;
pub mod user_keys;
pub mod users;

pub use api_keys::Entity as ApiKeys;
pub use attempts::Entity as Attempts;
pub use credential_disallow::Entity as CredentialDisallow;
pub use credentials::Entity as Credentials;
pub use downstream_requests::Entity as DownstreamRequests;
pub use downstream_traffic::Entity as DownstreamTraffic;
pub use endpoints::Entity as Endpoints;
pub use global_config::Entity as GlobalConfig;
pub use global_models::Entity as GlobalModels;
pub use internal_events::Entity as InternalEvents;
pub use model_mappings::Entity as ModelMappings;
pub use models::Entity as Models;
pub use providers::Entity as Providers;
pub use upstream_requests::Entity as UpstreamRequests;
pub use upstream_traffic::Entity as UpstreamTraffic;
pub use upstream_usages::Entity as UpstreamUsages;
pub use user_keys::Entity as UserKeys;
pub use users::Entity as Users;
