//! Identity normalization.
//!
//! Transport IDs carry routing suffixes (`573001234567@s.whatsapp.net`) and
//! the same person may reach us from several numbers.  Every lock, buffer,
//! profile and handle is keyed by the canonical user this resolver returns.

use std::collections::HashMap;

use tw_domain::config::ThreadsConfig;
use tw_domain::trace::TraceEvent;

/// Resolves raw transport IDs to canonical user IDs.
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    suffixes: Vec<String>,
    /// stripped id → canonical
    links: HashMap<String, String>,
}

impl IdentityResolver {
    pub fn from_config(cfg: &ThreadsConfig) -> Self {
        let mut resolver = Self {
            suffixes: cfg.strip_suffixes.clone(),
            links: HashMap::new(),
        };
        for link in &cfg.identity_links {
            for pid in &link.peer_ids {
                let key = resolver.strip(pid);
                resolver.links.insert(key, link.canonical.clone());
            }
        }
        resolver
    }

    /// Strip a transport suffix (first match wins) and surrounding whitespace.
    pub fn strip(&self, raw: &str) -> String {
        let raw = raw.trim();
        for suffix in &self.suffixes {
            if let Some(stripped) = raw.strip_suffix(suffix.as_str()) {
                return stripped.to_owned();
            }
        }
        raw.to_owned()
    }

    /// Resolve a raw ID to its canonical user.  Unknown IDs resolve to the
    /// stripped ID itself.
    pub fn resolve(&self, raw: &str) -> String {
        let stripped = self.strip(raw);
        match self.links.get(&stripped) {
            Some(canonical) => {
                TraceEvent::IdentityResolved {
                    raw_id: raw.to_owned(),
                    canonical: canonical.clone(),
                }
                .emit();
                canonical.clone()
            }
            None => stripped,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Number of raw IDs mapped by identity links.
    pub fn len(&self) -> usize {
        self.links.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tw_domain::config::IdentityLink;

    fn resolver(links: Vec<IdentityLink>) -> IdentityResolver {
        IdentityResolver::from_config(&ThreadsConfig {
            identity_links: links,
            ..ThreadsConfig::default()
        })
    }

    #[test]
    fn strips_whatsapp_suffix() {
        let r = resolver(vec![]);
        assert_eq!(r.resolve("573001234567@s.whatsapp.net"), "573001234567");
        assert_eq!(r.resolve(" 573001234567@c.us "), "573001234567");
        assert_eq!(r.resolve("plain-id"), "plain-id");
    }

    #[test]
    fn linked_ids_share_a_canonical_user() {
        let r = resolver(vec![IdentityLink {
            canonical: "alice".into(),
            peer_ids: vec!["5511999".into(), "5511888".into(), "4242@lid".into()],
        }]);
        assert_eq!(r.resolve("5511999@s.whatsapp.net"), "alice");
        assert_eq!(r.resolve("5511888"), "alice");
        assert_eq!(r.resolve("4242@lid"), "alice");
        assert_eq!(r.resolve("4242"), "alice");
        assert_eq!(r.resolve("5511777"), "5511777");
        assert_eq!(r.len(), 3);
    }
}
