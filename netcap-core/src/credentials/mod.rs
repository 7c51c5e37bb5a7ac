//! Credential harvesting and deduplication.
//!
//! Credentials reach the store from two places: the regex harvesters run
//! over the start of every conversation, and the protocol readers (HTTP,
//! POP3) that see logins while parsing. Both go through [`CredentialStore::insert`],
//! which keeps the first flow a `(service, user, password)` triple was seen on
//! and drops every later duplicate.

pub mod harvesters;

use std::collections::HashMap;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::debug;

use crate::record::Credentials;
pub use harvesters::{Harvester, Patterns};

type CredentialKey = (String, String, String);

pub struct CredentialStore {
    patterns: Patterns,
    /// Composite key to the flow it was first seen on.
    seen: Mutex<HashMap<CredentialKey, String>>,
}

impl CredentialStore {
    pub fn new(custom_regex: Option<&str>) -> Result<Self, regex::Error> {
        Ok(Self {
            patterns: Patterns::new(custom_regex)?,
            seen: Mutex::new(HashMap::new()),
        })
    }

    /// Record a credential. Returns `false` for duplicates.
    pub fn insert(&self, credential: &Credentials) -> bool {
        let key = (
            credential.service.clone(),
            credential.user.clone(),
            credential.password.clone(),
        );
        let mut seen = self.seen.lock();
        if seen.contains_key(&key) {
            return false;
        }
        seen.insert(key, credential.flow.clone());
        true
    }

    /// Flow a credential was first seen on.
    pub fn first_flow(&self, service: &str, user: &str, password: &str) -> Option<String> {
        let key = (service.to_string(), user.to_string(), password.to_string());
        self.seen.lock().get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run the harvesters over a conversation start and return the new credentials.
    ///
    /// The harvesters mapped to the server and client ports go first. The
    /// rest run in registration order unless a port guess matched and
    /// `stop_after_match` is set; with `stop_after_match` the first hit ends
    /// the search.
    pub fn harvest(
        &self,
        data: &[u8],
        ident: &str,
        timestamp: i64,
        server_port: u16,
        client_port: u16,
        stop_after_match: bool,
    ) -> Vec<Credentials> {
        let mut found = Vec::new();
        let mut tried: SmallVec<[Harvester; 2]> = SmallVec::new();
        let mut matched = false;

        for port in [server_port, client_port] {
            let Some(harvester) = Harvester::for_port(port) else {
                continue;
            };
            if tried.contains(&harvester) {
                continue;
            }
            tried.push(harvester);
            if let Some(credential) = self.patterns.run(harvester, data, ident, timestamp) {
                matched = true;
                self.keep(credential, &mut found);
            }
        }

        if matched && stop_after_match {
            return found;
        }

        for harvester in Harvester::ALL {
            if tried.contains(&harvester) {
                continue;
            }
            if harvester == Harvester::Custom && !self.patterns.has_custom() {
                continue;
            }
            if let Some(credential) = self.patterns.run(harvester, data, ident, timestamp) {
                self.keep(credential, &mut found);
                if stop_after_match {
                    break;
                }
            }
        }
        found
    }

    fn keep(&self, credential: Credentials, found: &mut Vec<Credentials>) {
        if self.insert(&credential) {
            debug!(
                ident = %credential.flow,
                service = %credential.service,
                user = %credential.user,
                "Harvested credentials"
            );
            found.push(credential);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FTP_LOGIN: &[u8] = b"220 (vsFTPd 3.0.3)\r\nUSER ftpuser\r\n331 Please specify the password.\r\nPASS ftppass\r\n230 Login successful.\r\n";

    fn credential(flow: &str) -> Credentials {
        Credentials {
            timestamp: 1,
            service: "FTP".into(),
            flow: flow.into(),
            user: "bob".into(),
            password: "secret".into(),
            notes: String::new(),
        }
    }

    // Test 1: Duplicates keep the first flow
    #[test]
    fn test_dedup_first_flow_wins() {
        let store = CredentialStore::new(None).unwrap();
        assert!(store.insert(&credential("10.0.0.1:1000->10.0.0.2:21")));
        assert!(!store.insert(&credential("10.0.0.3:2000->10.0.0.2:21")));

        assert_eq!(store.len(), 1);
        assert_eq!(
            store.first_flow("FTP", "bob", "secret").as_deref(),
            Some("10.0.0.1:1000->10.0.0.2:21")
        );
    }

    // Test 2: Port guess finds FTP credentials
    #[test]
    fn test_harvest_port_guess() {
        let store = CredentialStore::new(None).unwrap();
        let found = store.harvest(FTP_LOGIN, "a:5000->b:21", 7, 21, 5000, true);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].service, "FTP");
        assert_eq!(found[0].user, "ftpuser");
        assert_eq!(found[0].timestamp, 7);
    }

    // Test 3: Unknown port falls back to every harvester
    #[test]
    fn test_harvest_fallback() {
        let store = CredentialStore::new(None).unwrap();
        let found = store.harvest(FTP_LOGIN, "a:5000->b:2121", 7, 2121, 5000, true);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].password, "ftppass");
    }

    // Test 4: Same login on a second flow is not returned again
    #[test]
    fn test_harvest_dedup() {
        let store = CredentialStore::new(None).unwrap();
        assert_eq!(store.harvest(FTP_LOGIN, "first", 1, 21, 5000, true).len(), 1);
        assert!(store.harvest(FTP_LOGIN, "second", 2, 21, 5001, true).is_empty());
        assert_eq!(store.first_flow("FTP", "ftpuser", "ftppass").as_deref(), Some("first"));
    }

    // Test 5: Without stop-after-match every harvester runs
    #[test]
    fn test_harvest_all() {
        let store = CredentialStore::new(Some(r"PASS (\w+)")).unwrap();
        let found = store.harvest(FTP_LOGIN, "a->b", 1, 21, 5000, false);
        let services: Vec<&str> = found.iter().map(|c| c.service.as_str()).collect();
        assert_eq!(services, vec!["FTP", "Custom Regex"]);

        let store = CredentialStore::new(Some(r"PASS (\w+)")).unwrap();
        let found = store.harvest(FTP_LOGIN, "a->b", 1, 21, 5000, true);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_invalid_custom_regex() {
        assert!(CredentialStore::new(Some("(unclosed")).is_err());
    }
}
