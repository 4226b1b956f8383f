//! Users as the controller sends them: one identity, one credential family,
//! and the set of inbound tags the user should be attached to.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub email: String,
    #[serde(default)]
    pub inbounds: Vec<String>,
    #[serde(flatten)]
    pub proxy: ProxyCredential,
}

/// Exactly one credential family per user, tagged by protocol name on the
/// wire: `{"vmess": {"id": "..."}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyCredential {
    Vmess {
        id: String,
    },
    Vless {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        flow: Option<String>,
    },
    Trojan {
        password: String,
    },
    Shadowsocks {
        password: String,
        method: String,
    },
}

impl User {
    /// A user with an empty membership list attaches nowhere.
    pub fn should_attach(&self, inbound_tag: &str) -> bool {
        self.inbounds.iter().any(|tag| tag == inbound_tag)
    }
}

/// The 2022 shadowsocks ciphers take base64-encoded keys; older ciphers take
/// the password verbatim. A password that already decodes as standard base64
/// is passed through untouched.
pub fn ensure_base64_key(password: &str, method: &str) -> String {
    if !method.starts_with("2022-") {
        return password.to_string();
    }
    if BASE64_STANDARD.decode(password).is_ok() {
        password.to_string()
    } else {
        BASE64_STANDARD.encode(password)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_flattened_credential() {
        let user: User = serde_json::from_value(json!({
            "email": "a@x",
            "inbounds": ["in1"],
            "vmess": {"id": "UUID1"}
        }))
        .unwrap();
        assert_eq!(user.email, "a@x");
        assert!(user.should_attach("in1"));
        assert!(!user.should_attach("in2"));
        assert!(matches!(user.proxy, ProxyCredential::Vmess { ref id } if id == "UUID1"));
    }

    #[test]
    fn empty_membership_attaches_nowhere() {
        let user: User = serde_json::from_value(json!({
            "email": "a@x",
            "trojan": {"password": "pw"}
        }))
        .unwrap();
        assert!(!user.should_attach("in1"));
    }

    #[test]
    fn legacy_cipher_keys_pass_through() {
        assert_eq!(ensure_base64_key("secret", "aes-128-gcm"), "secret");
    }

    #[test]
    fn cipher_2022_keys_are_base64_encoded_once() {
        let encoded = ensure_base64_key("secret!", "2022-blake3-aes-128-gcm");
        assert_eq!(encoded, BASE64_STANDARD.encode("secret!"));
        // Already-encoded keys are not double-encoded.
        assert_eq!(
            ensure_base64_key(&encoded, "2022-blake3-aes-128-gcm"),
            encoded
        );
    }
}
