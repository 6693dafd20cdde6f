//! Object identifiers for the directory tree.
//!
//! Objects are addressed three ways at once: a hierarchical distinguished
//! name, a stable GUID, and (for security principals) a SID. DN comparison is
//! case-insensitive but the original spelling is preserved for display.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable object GUID, also used for DSA invocation ids and bind handles.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Guid(pub Uuid);

impl Guid {
    /// Generate a fresh random GUID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// The all-zero GUID.
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Whether this is the all-zero GUID.
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Parse from the hyphenated textual form.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Security identifier in the textual `S-1-...` form.
///
/// Only the shape needed here is modelled: a domain prefix plus a final
/// relative id (RID) subauthority.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sid(String);

impl Sid {
    /// Wrap a textual SID. The caller is trusted to pass `S-`-form input.
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The domain-relative portion: the final subauthority, if numeric.
    pub fn rid(&self) -> Option<u32> {
        self.0.rsplit('-').next().and_then(|s| s.parse().ok())
    }

    /// The SID with the final subauthority removed (the domain prefix).
    pub fn domain(&self) -> Option<&str> {
        self.0.rfind('-').map(|pos| &self.0.as_str()[..pos])
    }

    /// Whether this SID belongs to the given domain SID.
    pub fn in_domain(&self, domain: &Sid) -> bool {
        self.domain() == Some(domain.as_str())
    }

    /// The raw textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Sid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Distinguished name. Comparison and hashing are case-insensitive; the
/// original spelling is kept for display and storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dn {
    raw: String,
}

impl Dn {
    /// Create a DN from its textual form.
    pub fn new(s: impl Into<String>) -> Self {
        Self { raw: s.into() }
    }

    /// The textual form as given.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Lowercased form used as a comparison/index key.
    pub fn key(&self) -> String {
        self.raw.to_ascii_lowercase()
    }

    /// The parent DN, or `None` at the tree root.
    ///
    /// Components are split on unescaped commas; escaped commas inside RDN
    /// values are not supported by this store.
    pub fn parent(&self) -> Option<Dn> {
        self.raw
            .split_once(',')
            .map(|(_, rest)| Dn::new(rest.trim_start()))
    }

    /// The value of the leading RDN component (`cn=Foo,...` → `Foo`).
    pub fn rdn_value(&self) -> Option<&str> {
        let first = self.raw.split(',').next()?;
        first.split_once('=').map(|(_, v)| v.trim())
    }

    /// Whether `self` equals `other` or lies beneath it.
    pub fn is_under(&self, ancestor: &Dn) -> bool {
        let own = self.key();
        let anc = ancestor.key();
        own == anc || own.ends_with(&format!(",{}", anc))
    }

    /// Whether `self` is an immediate child of `parent`.
    pub fn is_child_of(&self, parent: &Dn) -> bool {
        match self.parent() {
            Some(p) => p == *parent,
            None => false,
        }
    }
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.raw.eq_ignore_ascii_case(&other.raw)
    }
}

impl Eq for Dn {}

impl std::hash::Hash for Dn {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl std::fmt::Display for Dn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Full identifier of a directory object. Immutable once resolved for a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectIdentifier {
    /// Distinguished name.
    pub dn: Dn,
    /// Stable object GUID.
    pub guid: Guid,
    /// SID, present only for security principals and when the caller asked
    /// for extended identifiers.
    pub sid: Option<Sid>,
}

impl ObjectIdentifier {
    /// Identifier with no SID component.
    pub fn new(dn: Dn, guid: Guid) -> Self {
        Self {
            dn,
            guid,
            sid: None,
        }
    }

    /// Identifier carrying a SID.
    pub fn with_sid(dn: Dn, guid: Guid, sid: Sid) -> Self {
        Self {
            dn,
            guid,
            sid: Some(sid),
        }
    }
}

// Display shows only the DN; the extended rendering lives in the codec.
impl std::fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guid_roundtrip() {
        let g = Guid::generate();
        let parsed = Guid::parse(&g.to_string()).unwrap();
        assert_eq!(g, parsed);
        assert!(!g.is_nil());
        assert!(Guid::nil().is_nil());
    }

    #[test]
    fn test_sid_rid_and_domain() {
        let sid = Sid::new("S-1-5-21-100-200-300-1104");
        assert_eq!(sid.rid(), Some(1104));
        assert_eq!(sid.domain(), Some("S-1-5-21-100-200-300"));

        let domain = Sid::new("S-1-5-21-100-200-300");
        assert!(sid.in_domain(&domain));
        assert!(!sid.in_domain(&Sid::new("S-1-5-21-9-9-9")));
    }

    #[test]
    fn test_dn_case_insensitive_eq() {
        let a = Dn::new("CN=Server,DC=Example,DC=Com");
        let b = Dn::new("cn=server,dc=example,dc=com");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "CN=Server,DC=Example,DC=Com");
    }

    #[test]
    fn test_dn_parent_and_rdn() {
        let dn = Dn::new("cn=leaf, ou=branch, dc=example, dc=com");
        assert_eq!(dn.rdn_value(), Some("leaf"));
        let parent = dn.parent().unwrap();
        assert_eq!(parent, Dn::new("ou=branch, dc=example, dc=com"));

        let root = Dn::new("dc=com");
        assert!(root.parent().is_none());
    }

    #[test]
    fn test_dn_is_under() {
        let nc = Dn::new("dc=example,dc=com");
        let obj = Dn::new("cn=x,ou=y,DC=EXAMPLE,dc=com");
        assert!(obj.is_under(&nc));
        assert!(nc.is_under(&nc));
        assert!(!Dn::new("dc=other,dc=com").is_under(&nc));
    }
}
