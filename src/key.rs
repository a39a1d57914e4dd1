//! Identity-key derivation.
//!
//! Two advertisements of the same type with equal keys describe the same
//! logical entity; the later one replaces the earlier.

use std::fmt;

use crate::classad::Ad;
use crate::types::AdType;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey {
    pub name: String,
    /// Host part of the advertiser's address, for types keyed by address.
    pub addr: Option<String>,
}

impl IdentityKey {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: None,
        }
    }

    pub fn with_addr(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: Some(addr.into()),
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.addr {
            Some(a) => write!(f, "{} ({})", self.name, a),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KeyRejection {
    #[error("neither Name nor Machine is set")]
    NoName,
    #[error("no address attribute and no peer address to infer one from")]
    NoAddress,
}

/// Derives the key for an incoming advertisement.
///
/// For address-keyed types a missing address attribute is inferred from
/// `origin` and written back into `ad`, so the paired private ad and later
/// readers see the same value the key was built from.
pub fn derive_key(
    ad: &mut Ad,
    ad_type: AdType,
    origin: Option<&str>,
) -> Result<IdentityKey, KeyRejection> {
    let name = entity_name(ad, ad_type).ok_or(KeyRejection::NoName)?;
    let Some(attr) = ad_type.address_attr() else {
        return Ok(IdentityKey::named(name));
    };

    let addr = match ad
        .lookup_string(attr)
        .or_else(|| ad.lookup_string("MyAddress"))
    {
        Some(a) => a,
        None => {
            let origin = origin.ok_or(KeyRejection::NoAddress)?;
            let sinful = format!("<{}>", origin);
            ad.insert(attr, sinful.as_str());
            sinful
        }
    };
    Ok(IdentityKey::with_addr(name, host_of(&addr)))
}

/// Key carried literally by an invalidation query, if it has every
/// attribute the key needs. Nothing is inferred.
pub fn key_from_query(query: &Ad, ad_type: AdType) -> Option<IdentityKey> {
    let name = query.lookup_string("Name")?;
    let name = match (ad_type, query.lookup_string("ScheddName")) {
        (AdType::Submitter, Some(schedd)) => submitter_name(&name, &schedd),
        _ => name,
    };
    match ad_type.address_attr() {
        None => Some(IdentityKey::named(name)),
        Some(attr) => {
            let addr = query
                .lookup_string(attr)
                .or_else(|| query.lookup_string("MyAddress"))?;
            Some(IdentityKey::with_addr(name, host_of(&addr)))
        }
    }
}

fn entity_name(ad: &Ad, ad_type: AdType) -> Option<String> {
    let name = ad
        .lookup_string("Name")
        .or_else(|| ad.lookup_string("Machine"))?;
    match (ad_type, ad.lookup_string("ScheddName")) {
        (AdType::Submitter, Some(schedd)) => Some(submitter_name(&name, &schedd)),
        _ => Some(name),
    }
}

fn submitter_name(name: &str, schedd: &str) -> String {
    format!("{}/{}", name, schedd)
}

/// Host part of an address: `<10.0.0.1:9618?sock=x>`, `10.0.0.1:9618` and
/// `[::1]:9618` all lose their port; bare IPv6 literals are kept whole.
pub fn host_of(addr: &str) -> String {
    let addr = addr.trim().trim_start_matches('<').trim_end_matches('>');
    let addr = addr.split('?').next().unwrap_or(addr);
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest).to_string();
    }
    match addr.rsplit_once(':') {
        Some((host, _)) if !host.contains(':') => host.to_string(),
        _ => addr.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_key_uses_address_attr() {
        let mut ad = Ad::new()
            .with("Name", "slot1@hostA")
            .with("StartdIpAddr", "<10.0.0.5:9999?sock=startd>");
        let key = derive_key(&mut ad, AdType::WorkerNode, Some("10.9.9.9:1")).unwrap();
        assert_eq!(key, IdentityKey::with_addr("slot1@hostA", "10.0.0.5"));
    }

    #[test]
    fn address_is_inferred_and_written_back() {
        let mut ad = Ad::new().with("Machine", "hostA");
        let key = derive_key(&mut ad, AdType::Scheduler, Some("10.0.0.7:4242")).unwrap();
        assert_eq!(key, IdentityKey::with_addr("hostA", "10.0.0.7"));
        assert_eq!(
            ad.lookup_string("ScheddIpAddr").as_deref(),
            Some("<10.0.0.7:4242>")
        );
    }

    #[test]
    fn my_address_is_the_fallback() {
        let mut ad = Ad::new()
            .with("Name", "slot1@hostA")
            .with("MyAddress", "<10.0.0.8:9618>");
        let key = derive_key(&mut ad, AdType::WorkerNode, None).unwrap();
        assert_eq!(key.addr.as_deref(), Some("10.0.0.8"));
        assert!(!ad.contains("StartdIpAddr"));
    }

    #[test]
    fn manager_key_is_name_only() {
        let mut ad = Ad::new()
            .with("Name", "cm.example.org")
            .with("MyAddress", "<10.0.0.1:9618>");
        let key = derive_key(&mut ad, AdType::Manager, None).unwrap();
        assert_eq!(key, IdentityKey::named("cm.example.org"));
    }

    #[test]
    fn missing_name_is_rejected() {
        let mut ad = Ad::new().with("Memory", 512);
        assert_eq!(
            derive_key(&mut ad, AdType::Manager, None),
            Err(KeyRejection::NoName)
        );
        let mut ad = Ad::new().with("Name", "slot1@hostA");
        assert_eq!(
            derive_key(&mut ad, AdType::WorkerNode, None),
            Err(KeyRejection::NoAddress)
        );
    }

    #[test]
    fn submitters_of_different_schedulers_differ() {
        let mut a = Ad::new()
            .with("Name", "alice@example.org")
            .with("ScheddName", "s1")
            .with("ScheddIpAddr", "<10.0.0.1:1>");
        let mut b = a.clone().with("ScheddName", "s2");
        let ka = derive_key(&mut a, AdType::Submitter, None).unwrap();
        let kb = derive_key(&mut b, AdType::Submitter, None).unwrap();
        assert_ne!(ka, kb);
    }

    #[test]
    fn query_key_requires_explicit_attributes() {
        let q = Ad::new().with("Name", "slot1@hostA");
        assert_eq!(key_from_query(&q, AdType::WorkerNode), None);
        assert_eq!(
            key_from_query(&q, AdType::Manager),
            Some(IdentityKey::named("slot1@hostA"))
        );
        let q = q.with("StartdIpAddr", "<10.0.0.5:9999>");
        assert_eq!(
            key_from_query(&q, AdType::WorkerNode),
            Some(IdentityKey::with_addr("slot1@hostA", "10.0.0.5"))
        );
    }

    #[test]
    fn host_of_strips_ports() {
        assert_eq!(host_of("<10.0.0.1:9618?sock=x>"), "10.0.0.1");
        assert_eq!(host_of("A:9999"), "A");
        assert_eq!(host_of("[::1]:9618"), "::1");
        assert_eq!(host_of("fe80::1"), "fe80::1");
        assert_eq!(host_of("hostA"), "hostA");
    }
}
