//! Account topology: which regions serve reads and writes, as reported by the service.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::FetchError;

/// One regional front door. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegionalEndpoint {
    region: String,
    url: Url,
}

impl RegionalEndpoint {
    #[must_use]
    pub fn new(region: impl Into<String>, url: Url) -> Self {
        Self {
            region: region.into(),
            url,
        }
    }

    #[must_use]
    pub fn region(&self) -> &str {
        &self.region
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Case-insensitive region name comparison.
    #[must_use]
    pub fn is_region(&self, region: &str) -> bool {
        self.region.eq_ignore_ascii_case(region)
    }
}

/// Snapshot of the account's regional layout at fetch time.
///
/// Replaced wholesale on every refresh; callers hold it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountTopology {
    pub default_endpoint: Url,
    pub multiple_write_locations_enabled: bool,
    pub endpoint_discovery_enabled: bool,
    /// Readable regions in service-reported order
    pub readable: Vec<RegionalEndpoint>,
    /// Writable regions in service-reported order
    pub writable: Vec<RegionalEndpoint>,
}

impl AccountTopology {
    /// Topology with no regional endpoints; everything resolves to `default_endpoint`.
    #[must_use]
    pub fn single_endpoint(default_endpoint: Url) -> Self {
        Self {
            default_endpoint,
            multiple_write_locations_enabled: false,
            endpoint_discovery_enabled: true,
            readable: Vec::new(),
            writable: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_readable(mut self, readable: Vec<RegionalEndpoint>) -> Self {
        self.readable = readable;
        self
    }

    #[must_use]
    pub fn with_writable(mut self, writable: Vec<RegionalEndpoint>) -> Self {
        self.writable = writable;
        self
    }

    #[must_use]
    pub fn with_multiple_write_locations(mut self, enabled: bool) -> Self {
        self.multiple_write_locations_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_endpoint_discovery(mut self, enabled: bool) -> Self {
        self.endpoint_discovery_enabled = enabled;
        self
    }
}

/// A region entry of the account document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationDocument {
    pub name: String,
    pub database_account_endpoint: String,
}

/// Account metadata document as served at the account path.
///
/// Unknown fields are ignored; the service sends many more.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountTopologyDocument {
    #[serde(default)]
    pub writable_locations: Vec<LocationDocument>,
    #[serde(default)]
    pub readable_locations: Vec<LocationDocument>,
    #[serde(default)]
    pub enable_multiple_write_locations: bool,
    #[serde(default = "default_true")]
    pub enable_endpoint_discovery: bool,
}

fn default_true() -> bool {
    true
}

impl AccountTopologyDocument {
    /// Convert into a typed topology anchored at `default_endpoint`.
    ///
    /// # Errors
    /// Returns [`FetchError::InvalidUrl`] if a location endpoint does not parse.
    pub fn into_topology(self, default_endpoint: Url) -> Result<AccountTopology, FetchError> {
        Ok(AccountTopology {
            default_endpoint,
            multiple_write_locations_enabled: self.enable_multiple_write_locations,
            endpoint_discovery_enabled: self.enable_endpoint_discovery,
            readable: convert_locations(self.readable_locations)?,
            writable: convert_locations(self.writable_locations)?,
        })
    }
}

fn convert_locations(locations: Vec<LocationDocument>) -> Result<Vec<RegionalEndpoint>, FetchError> {
    locations
        .into_iter()
        .map(|location| {
            let url = Url::parse(&location.database_account_endpoint).map_err(|source| {
                FetchError::InvalidUrl {
                    url: location.database_account_endpoint.clone(),
                    source,
                }
            })?;
            Ok(RegionalEndpoint::new(location.name, url))
        })
        .collect()
}

/// Derive a region's front door from the global endpoint.
///
/// The compacted, lower-cased region name is appended to the first host
/// label: `https://acct.example/` and `"West US"` give
/// `https://acct-westus.example/`. Returns `None` for IP hosts or URLs
/// without a host.
#[must_use]
pub fn regional_endpoint_url(default_endpoint: &Url, region: &str) -> Option<Url> {
    let host = match default_endpoint.host()? {
        url::Host::Domain(domain) => domain,
        url::Host::Ipv4(_) | url::Host::Ipv6(_) => return None,
    };
    let suffix: String = region
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if suffix.is_empty() {
        return None;
    }
    let (account, rest) = match host.split_once('.') {
        Some((account, rest)) => (account, Some(rest)),
        None => (host, None),
    };
    let regional_host = match rest {
        Some(rest) => format!("{account}-{suffix}.{rest}"),
        None => format!("{account}-{suffix}"),
    };
    let mut url = default_endpoint.clone();
    url.set_host(Some(&regional_host)).ok()?;
    Some(url)
}
