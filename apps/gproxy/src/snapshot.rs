use std::collections::HashMap;

use gproxy_core::{AuthKeyEntry, AuthSnapshot, UserEntry};
use gproxy_provider_core::{CredentialEntry, DisallowEntry, DisallowKey, PoolSnapshot};
use gproxy_provider_impl::BaseCredential;
use gproxy_storage::StorageSnapshot;

pub fn build_provider_id_map(snapshot: &StorageSnapshot) -> HashMap<String, i64> {
    let mut map = HashMap::new();
    for provider in &snapshot.providers {
        map.insert(provider.name.clone(), provider.id);
    }
    map
}

pub fn build_provider_name_map(snapshot: &StorageSnapshot) -> HashMap<i64, String> {
    let mut map = HashMap::new();
    for provider in &snapshot.providers {
        map.insert(provider.id, provider.name.clone());
    }
    map
}

pub fn build_auth_snapshot(snapshot: &StorageSnapshot) -> AuthSnapshot {
    let mut keys_by_value = HashMap::new();
    for key in &snapshot.user_keys {
        keys_by_value.insert(
            key.api_key.clone(),
            AuthKeyEntry {
                key_id: key.id,
                user_id: key.user_id,
                enabled: key.enabled,
            },
        );
    }

    let mut users_by_id = HashMap::new();
    for user in &snapshot.users {
        users_by_id.insert(
            user.id,
            UserEntry {
                id: user.id,
                name: user.name.clone(),
            },
        );
    }

    AuthSnapshot {
        keys_by_value,
        users_by_id,
    }
}

pub fn build_provider_pools(
    snapshot: &StorageSnapshot,
) -> HashMap<String, PoolSnapshot<BaseCredential>> {
    let mut provider_by_id = HashMap::new();
    let mut provider_config_by_id: HashMap<i64, serde_json::Value> = HashMap::new();
    for provider in &snapshot.providers {
        provider_by_id.insert(provider.id, provider.name.clone());
        provider_config_by_id.insert(provider.id, provider.config_json.clone());
    }

    let mut credentials_by_provider: HashMap<String, Vec<CredentialEntry<BaseCredential>>> =
        HashMap::new();
    let mut credential_provider_by_id: HashMap<i64, String> = HashMap::new();

    for credential in &snapshot.credentials {
        let Some(provider_name) = provider_by_id.get(&credential.provider_id) else {
            continue;
        };

        credential_provider_by_id
            .insert(credential.id, provider_name.clone());

        let weight = (credential.rate_multiplier.max(0.0) * 100.0).round() as u32;

        let provider_config = provider_config_by_id
            .get(&credential.provider_id)
            .unwrap_or(&serde_json::Value::Null);
        let meta = merge_meta(provider_config, &credential.settings_json);
        let entry = CredentialEntry::new(
            credential.id.to_string(),
            credential.enabled,
            weight,
            BaseCredential {
                id: credential.id,
                name: credential.name.clone(),
                secret: credential.secret_json.clone(),
                meta,
            },
        );

        credentials_by_provider
            .entry(provider_name.clone())
            .or_default()
            .push(entry);
    }

    // Disallow tracking is not yet part of the storage snapshot read-model;
    // credential_disallow rows are admin-authored but live entirely in the
    // per-process CredentialPool state, not here.
    let disallow_by_provider: HashMap<String, HashMap<DisallowKey, DisallowEntry>> =
        HashMap::new();

    let mut pools = HashMap::new();
    for provider in &snapshot.providers {
        let name = provider.name.clone();
        let credentials = credentials_by_provider.remove(&name).unwrap_or_default();
        let disallow = disallow_by_provider.remove(&name).unwrap_or_default();
        pools.insert(name, PoolSnapshot::new(credentials, disallow));
    }

    pools
}

const CHANNEL_META_KEYS: &[&str] = &[
    "base_url",
    "claude_ai_base_url",
    "console_base_url",
];

fn merge_meta(provider: &serde_json::Value, credential: &serde_json::Value) -> serde_json::Value {
    match credential {
        serde_json::Value::Object(cred_map) => match provider {
            serde_json::Value::Object(provider_map) => {
                let mut merged = provider_map.clone();
                for (key, value) in cred_map {
                    if CHANNEL_META_KEYS.contains(&key.as_str()) {
                        continue;
                    }
                    merged.insert(key.clone(), value.clone());
                }
                serde_json::Value::Object(merged)
            }
            _ => credential.clone(),
        },
        serde_json::Value::Null => provider.clone(),
        _ => credential.clone(),
    }
}
