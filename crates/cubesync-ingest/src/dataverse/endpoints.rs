//! Dataverse Web API URL builders

/// Web API path appended to the environment URL
pub const API_PATH: &str = "/api/data/v9.2";

/// Build the Web API root for an environment, e.g.
/// `https://org.crm.dynamics.com/api/data/v9.2`
pub fn api_base(environment_url: &str) -> String {
    let env = environment_url.trim_end_matches('/');
    if env.ends_with(API_PATH) {
        env.to_string()
    } else {
        format!("{}{}", env, API_PATH)
    }
}

/// Build the `$batch` endpoint URL
pub fn batch_url(api_base: &str) -> String {
    format!("{}/$batch", api_base)
}

/// Build an identifier page query projected to the id column only
pub fn id_page_url(api_base: &str, table: &str, id_field: &str, top: usize) -> String {
    format!(
        "{}/{}?$select={}&$top={}",
        api_base, table, id_field, top
    )
}

/// Build a record URL addressed by alternate key.
///
/// Single quotes in the key are doubled per OData literal rules before the
/// key is percent-encoded.
pub fn alternate_key_url(api_base: &str, table: &str, alternate_key: &str, key: &str) -> String {
    let literal = key.replace('\'', "''");
    format!(
        "{}/{}({}='{}')",
        api_base,
        table,
        alternate_key,
        urlencoding::encode(&literal)
    )
}

/// Build a record URL addressed by primary id
pub fn record_url(api_base: &str, table: &str, id: &str) -> String {
    format!("{}/{}({})", api_base, table, id)
}

/// Build the OAuth v2 token endpoint for a tenant
pub fn token_url(authority: &str, tenant_id: &str) -> String {
    format!(
        "{}/{}/oauth2/v2.0/token",
        authority.trim_end_matches('/'),
        tenant_id
    )
}

/// Client-credentials scope for an environment
pub fn default_scope(environment_url: &str) -> String {
    let env = environment_url.trim_end_matches('/');
    let env = env.strip_suffix(API_PATH).unwrap_or(env);
    format!("{}/.default", env)
}
