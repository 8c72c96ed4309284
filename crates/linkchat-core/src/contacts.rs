//! Contacts and contact codes
//!
//! Peers exchange keys out of band with a small JSON contact code,
//! `{"name": ..., "publicKey": <base64>}`, typically rendered as a QR code by the
//! host. Parsed codes become [`PeerDescriptor`]s kept in a [`ContactRegistry`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::ContactError;
use crate::types::{Fingerprint, PeerDescriptor, PublicKey};

// ----------------------------------------------------------------------------
// Contact Code
// ----------------------------------------------------------------------------

/// Wire form of a shared contact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactCode {
    pub name: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

impl ContactCode {
    /// Contact code advertising `public_key` under `name`
    pub fn new(name: impl Into<String>, public_key: &PublicKey) -> Self {
        Self {
            name: name.into(),
            public_key: public_key.to_base64(),
        }
    }

    /// JSON text to hand to the host for display
    pub fn encode(&self) -> Result<String, ContactError> {
        serde_json::to_string(self).map_err(|e| ContactError::InvalidCode(e.to_string()))
    }

    /// Parse scanned JSON text into a peer descriptor
    pub fn parse(text: &str) -> Result<PeerDescriptor, ContactError> {
        let code: ContactCode = serde_json::from_str(text.trim())
            .map_err(|e| ContactError::InvalidCode(e.to_string()))?;
        code.into_descriptor()
    }

    /// Validate the name and decode the key
    pub fn into_descriptor(self) -> Result<PeerDescriptor, ContactError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(ContactError::EmptyName);
        }
        let key = PublicKey::from_base64(&self.public_key)?;
        Ok(PeerDescriptor::new(name, key))
    }
}

// ----------------------------------------------------------------------------
// Contact Registry
// ----------------------------------------------------------------------------

/// Known peers, keyed by key fingerprint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactRegistry {
    contacts: HashMap<Fingerprint, PeerDescriptor>,
}

impl ContactRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a contact, replacing the name of one already known by the same key
    ///
    /// Returns the previous entry for that key.
    pub fn add(&mut self, contact: PeerDescriptor) -> Option<PeerDescriptor> {
        let fingerprint = contact.public_key.fingerprint();
        debug!(
            "Adding contact {} ({})",
            contact.display_name,
            fingerprint.short()
        );
        self.contacts.insert(fingerprint, contact)
    }

    /// Parse a contact code and add the result
    pub fn add_code(&mut self, text: &str) -> Result<PeerDescriptor, ContactError> {
        let contact = ContactCode::parse(text)?;
        self.add(contact.clone());
        Ok(contact)
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&PeerDescriptor> {
        self.contacts.get(fingerprint)
    }

    /// Contact that owns `public_key`, if known
    pub fn by_key(&self, public_key: &PublicKey) -> Option<&PeerDescriptor> {
        self.get(&public_key.fingerprint())
    }

    /// First contact with exactly this display name, in listing order
    pub fn find_by_name(&self, name: &str) -> Option<&PeerDescriptor> {
        self.list().into_iter().find(|c| c.display_name == name)
    }

    pub fn remove(&mut self, fingerprint: &Fingerprint) -> Option<PeerDescriptor> {
        self.contacts.remove(fingerprint)
    }

    /// All contacts sorted by display name
    pub fn list(&self) -> Vec<&PeerDescriptor> {
        let mut contacts: Vec<_> = self.contacts.values().collect();
        contacts.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.public_key.as_bytes().cmp(b.public_key.as_bytes()))
        });
        contacts
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CipherError;

    fn key(seed: u8) -> PublicKey {
        PublicKey::new([seed; 32])
    }

    #[test]
    fn test_code_uses_shared_field_names() {
        let json = ContactCode::new("alice", &key(1)).encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["name"], "alice");
        assert_eq!(value["publicKey"], key(1).to_base64());
    }

    #[test]
    fn test_parse_scanned_code() {
        let text = format!(
            r#" {{"publicKey": "{}", "name": " bob "}} "#,
            key(2).to_base64()
        );
        let contact = ContactCode::parse(&text).unwrap();
        assert_eq!(contact.display_name, "bob");
        assert_eq!(contact.public_key, key(2));
    }

    #[test]
    fn test_parse_rejects_bad_codes() {
        assert!(matches!(
            ContactCode::parse("not json"),
            Err(ContactError::InvalidCode(_))
        ));
        assert!(matches!(
            ContactCode::parse(r#"{"name": "carol"}"#),
            Err(ContactError::InvalidCode(_))
        ));
        assert!(matches!(
            ContactCode::parse(r#"{"name": "carol", "publicKey": "AAAA"}"#),
            Err(ContactError::InvalidKey(CipherError::InvalidKeyEncoding))
        ));

        let unnamed = format!(r#"{{"name": "  ", "publicKey": "{}"}}"#, key(3).to_base64());
        assert_eq!(ContactCode::parse(&unnamed), Err(ContactError::EmptyName));
    }

    #[test]
    fn test_registry_keys_contacts_by_fingerprint() {
        let mut registry = ContactRegistry::new();
        assert!(registry.is_empty());

        registry.add(PeerDescriptor::new("zed", key(1)));
        let code = ContactCode::new("amy", &key(2)).encode().unwrap();
        registry.add_code(&code).unwrap();
        assert_eq!(registry.len(), 2);

        let names: Vec<_> = registry.list().iter().map(|c| c.display_name.as_str()).collect();
        assert_eq!(names, vec!["amy", "zed"]);
        assert_eq!(registry.by_key(&key(1)).unwrap().display_name, "zed");
        assert_eq!(registry.find_by_name("amy").unwrap().public_key, key(2));

        // Same key under a new name replaces the entry
        let previous = registry.add(PeerDescriptor::new("zed2", key(1))).unwrap();
        assert_eq!(previous.display_name, "zed");
        assert_eq!(registry.len(), 2);

        registry.remove(&key(1).fingerprint()).unwrap();
        assert!(registry.by_key(&key(1)).is_none());
        assert!(registry.find_by_name("zed2").is_none());
    }
}
