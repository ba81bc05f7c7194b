use std::collections::HashSet;

use serde::Deserialize;
use sha2::{Digest as _, Sha256};

const DIGEST_PREFIX: &str = "h8_";
const DIGEST_HEX_LEN: usize = 8;

/// Environment-variable filtering policy applied by the producer.
///
/// Three buckets: keys in `denied_keys` are dropped outright, keys
/// matching one of `sensitive_patterns` (case-insensitive substring)
/// keep a salted digest of their value, everything else is preserved
/// verbatim. The proxy never interprets this policy.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvPolicy {
    #[serde(default)]
    denied_keys: HashSet<String>,
    #[serde(default)]
    sensitive_patterns: Vec<String>,
    #[serde(default)]
    salt: String,
}

impl EnvPolicy {
    pub fn from_json(repr: &str) -> Result<Self, serde_json::Error> {
        let mut policy: EnvPolicy = serde_json::from_str(repr)?;
        policy.sensitive_patterns = policy.sensitive_patterns.iter().map(|p| p.to_ascii_lowercase()).collect();
        Ok(policy)
    }

    /// Policy that keeps everything. What the hook uses when no
    /// filter configuration is provided.
    pub fn permissive() -> Self {
        Self {
            denied_keys: HashSet::new(),
            sensitive_patterns: Vec::new(),
            salt: String::new(),
        }
    }

    pub fn apply<'a>(&self, vars: impl IntoIterator<Item = (&'a str, &'a str)>) -> Vec<(String, String)> {
        let mut out = Vec::new();

        for (key, value) in vars {
            if self.denied_keys.contains(key) {
                continue;
            }

            if self.is_sensitive(key) {
                out.push((key.to_owned(), self.digest(value)));
            } else {
                out.push((key.to_owned(), value.to_owned()));
            }
        }

        out
    }

    fn is_sensitive(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.sensitive_patterns.iter().any(|pattern| key.contains(pattern))
    }

    fn digest(&self, value: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(value.as_bytes());

        let digest = hex::encode(hasher.finalize());

        format!("{DIGEST_PREFIX}{}", &digest[..DIGEST_HEX_LEN])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> EnvPolicy {
        EnvPolicy::from_json(
            r#"{
                "denied_keys": ["LS_COLORS"],
                "sensitive_patterns": ["TOKEN", "secret"],
                "salt": "pepper"
            }"#,
        )
        .expect("valid policy")
    }

    #[test]
    fn denied_keys_are_dropped() {
        let out = policy().apply([("LS_COLORS", "di=34"), ("TERM", "xterm")]);
        assert_eq!(out, vec![("TERM".to_owned(), "xterm".to_owned())]);
    }

    #[test]
    fn sensitive_keys_are_digested() {
        let out = policy().apply([("GITHUB_TOKEN", "ghp_abc"), ("My_Secret_Key", "hunter2")]);

        for (_, value) in &out {
            assert!(value.starts_with("h8_"), "digested value: {value}");
            assert_eq!(value.len(), "h8_".len() + 8);
            assert_ne!(value, "ghp_abc");
            assert_ne!(value, "hunter2");
        }
    }

    #[test]
    fn digest_is_deterministic_and_salted() {
        let a = policy().digest("hunter2");
        let b = policy().digest("hunter2");
        assert_eq!(a, b);

        let unsalted = EnvPolicy::permissive().digest("hunter2");
        assert_ne!(a, unsalted);
    }

    #[test]
    fn other_keys_pass_verbatim() {
        let out = policy().apply([("HOME", "/home/u"), ("SHELL", "/bin/zsh")]);
        assert_eq!(
            out,
            vec![
                ("HOME".to_owned(), "/home/u".to_owned()),
                ("SHELL".to_owned(), "/bin/zsh".to_owned()),
            ]
        );
    }

    #[test]
    fn permissive_policy_keeps_everything() {
        let out = EnvPolicy::permissive().apply([("GITHUB_TOKEN", "ghp_abc")]);
        assert_eq!(out, vec![("GITHUB_TOKEN".to_owned(), "ghp_abc".to_owned())]);
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let policy = EnvPolicy::from_json("{}").expect("empty policy is valid");
        let out = policy.apply([("PATH", "/bin")]);
        assert_eq!(out.len(), 1);
    }
}
