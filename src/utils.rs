use crate::peer::types::ServerConfig;
use rand::Rng;

const PASSKEY_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
pub const PASSKEY_LEN: usize = 6;

/// Short random hex token, used to make store keys collision resistant.
pub fn random_token() -> String {
    hex::encode(rand::rng().random::<[u8; 4]>())
}

pub fn generate_passkey() -> String {
    let mut rng = rand::rng();
    (0..PASSKEY_LEN)
        .map(|_| PASSKEY_CHARSET[rng.random_range(0..PASSKEY_CHARSET.len())] as char)
        .collect()
}

/// Store keys may not contain `.`; identities (e-mail addresses) are stored with `_`.
pub fn identity_key(identity: &str) -> String {
    identity.replace('.', "_")
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// Adds the protocol scheme to an ICE server URL if it is missing
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    if config.url.starts_with("turn:")
        || config.url.starts_with("turns:")
        || config.url.starts_with("stun:")
    {
        config.url.clone()
    } else {
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}
