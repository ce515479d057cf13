//! Public-key authorization against named key-sets and their ACLs.
//!
//! A key-set authorises a login when any of its keys byte-matches the
//! presented public key AND the key-set's access-control patterns admit the
//! login name. Authentication and template selection stay independent.

use anyhow::Result;
use regex::Regex;
use russh::keys::{PublicKey, PublicKeyBase64};
use std::collections::HashMap;

use crate::config::AccessControl;
use crate::error::{AuthRejection, GatewayError};

struct KeySet {
    name: String,
    keys: Vec<PublicKey>,
}

/// Compiled key-sets and access-control lists.
pub struct Authorizer {
    key_sets: Vec<KeySet>,
    acls: HashMap<String, Vec<Regex>>,
}

impl Authorizer {
    /// Compile the raw config maps. Key-sets are scanned in name order so
    /// authorization is deterministic. An unparsable authorized-keys line or
    /// ACL pattern rejects the whole config.
    pub fn build(
        keys: &HashMap<String, Vec<String>>,
        access_control: &HashMap<String, AccessControl>,
    ) -> Result<Self> {
        let mut names: Vec<&String> = keys.keys().collect();
        names.sort();

        let mut key_sets = Vec::with_capacity(names.len());
        for name in names {
            let mut parsed = Vec::new();
            for line in &keys[name] {
                let key = line.parse::<PublicKey>().map_err(|err| {
                    GatewayError::ConfigInvalid(format!(
                        "key-set {name:?}: failed to parse public key: {err}"
                    ))
                })?;
                parsed.push(key);
            }
            key_sets.push(KeySet {
                name: name.clone(),
                keys: parsed,
            });
        }

        let mut acls = HashMap::new();
        for (name, acl) in access_control {
            let mut patterns = Vec::with_capacity(acl.patterns.len());
            for pattern in &acl.patterns {
                let regex = Regex::new(pattern).map_err(|err| {
                    GatewayError::ConfigInvalid(format!(
                        "access-control {name:?}: bad pattern {pattern:?}: {err}"
                    ))
                })?;
                patterns.push(regex);
            }
            acls.insert(name.clone(), patterns);
        }

        Ok(Self { key_sets, acls })
    }

    /// True when no key-sets are configured and the server must fall back to
    /// accepting unauthenticated clients.
    pub fn is_open(&self) -> bool {
        self.key_sets.is_empty()
    }

    /// Decide whether `offered` may log in as `user`.
    pub fn authorize(&self, user: &str, offered: &PublicKey) -> Result<(), AuthRejection> {
        let offered_blob = offered.public_key_bytes();
        for key_set in &self.key_sets {
            for key in &key_set.keys {
                if key.public_key_bytes() != offered_blob {
                    continue;
                }
                let Some(patterns) = self.acls.get(&key_set.name) else {
                    return Err(AuthRejection::NoAcl);
                };
                if patterns.iter().any(|pattern| pattern.is_match(user)) {
                    return Ok(());
                }
                return Err(AuthRejection::NotAllowed);
            }
        }
        Err(AuthRejection::KeyUnknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::Algorithm;
    use russh::keys::PrivateKey;

    fn generated_key() -> PublicKey {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .unwrap()
            .public_key()
            .clone()
    }

    fn openssh_line(key: &PublicKey) -> String {
        key.to_openssh().unwrap()
    }

    fn acl(patterns: &[&str]) -> AccessControl {
        AccessControl {
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn matching_key_and_login_accepted() {
        let key = generated_key();
        let keys = HashMap::from([("admins".to_string(), vec![openssh_line(&key)])]);
        let acls = HashMap::from([("admins".to_string(), acl(&["^root$", "^admin-.*"]))]);

        let authorizer = Authorizer::build(&keys, &acls).unwrap();
        assert!(authorizer.authorize("root", &key).is_ok());
        assert!(authorizer.authorize("admin-alice", &key).is_ok());
    }

    #[test]
    fn login_outside_acl_rejected() {
        let key = generated_key();
        let keys = HashMap::from([("admins".to_string(), vec![openssh_line(&key)])]);
        let acls = HashMap::from([("admins".to_string(), acl(&["^root$"]))]);

        let authorizer = Authorizer::build(&keys, &acls).unwrap();
        assert_eq!(
            authorizer.authorize("alice", &key),
            Err(AuthRejection::NotAllowed)
        );
    }

    #[test]
    fn key_set_without_acl_rejected() {
        let key = generated_key();
        let keys = HashMap::from([("admins".to_string(), vec![openssh_line(&key)])]);

        let authorizer = Authorizer::build(&keys, &HashMap::new()).unwrap();
        assert_eq!(authorizer.authorize("root", &key), Err(AuthRejection::NoAcl));
    }

    #[test]
    fn unknown_key_rejected() {
        let enrolled = generated_key();
        let stranger = generated_key();
        let keys = HashMap::from([("admins".to_string(), vec![openssh_line(&enrolled)])]);
        let acls = HashMap::from([("admins".to_string(), acl(&[".*"]))]);

        let authorizer = Authorizer::build(&keys, &acls).unwrap();
        assert_eq!(
            authorizer.authorize("root", &stranger),
            Err(AuthRejection::KeyUnknown)
        );
    }

    #[test]
    fn unparsable_key_line_rejects_config() {
        let keys = HashMap::from([("admins".to_string(), vec!["not a key".to_string()])]);
        assert!(Authorizer::build(&keys, &HashMap::new()).is_err());
    }

    #[test]
    fn no_key_sets_means_open_server() {
        let authorizer = Authorizer::build(&HashMap::new(), &HashMap::new()).unwrap();
        assert!(authorizer.is_open());
    }
}
