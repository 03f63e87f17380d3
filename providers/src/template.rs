//! Minimal text templates: `$(( .NAME ))$` actions substituted from a fixed
//! set of [Param]s. Everything outside an action is copied verbatim, so
//! binary files without delimiters pass through unchanged.

use std::str::FromStr;

use tracing::warn;

pub const OPEN: &[u8] = b"$((";
pub const CLOSE: &[u8] = b"))$";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("unterminated action starting at byte {0}")]
    Unterminated(usize),

    #[error("unsupported action {0:?} at byte {1}")]
    UnsupportedAction(String, usize),

    #[error("unknown template parameter {0:?}")]
    UnknownParam(String),
}

/// The parameters templates may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    BaseUrl,
    CanonicalUrl,
    DirectoryUrl,
    DistributionUrl,
    FeedUrl,
    RolieFeedUrl,
    ServiceCollectionUrl,
    PublisherNamespaceUrl,
    PublicOpenpgpKeyUrl,
    PublicKeyFingerprint,
}

impl FromStr for Param {
    type Err = Error;

    /// Accepts the upper snake case names as well as the CamelCase ones
    /// older template files use.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "BASE_URL" | "BaseURL" => Param::BaseUrl,
            "CANONICAL_URL" | "CanonicalURL" => Param::CanonicalUrl,
            "DIRECTORY_URL" | "DirectoryURL" => Param::DirectoryUrl,
            "DISTRIBUTION_URL" | "DistributionURL" => Param::DistributionUrl,
            "FEED_URL" | "FeedURL" => Param::FeedUrl,
            "ROLIE_FEED_URL" | "RolieFeedURL" => Param::RolieFeedUrl,
            "SERVICE_COLLECTION_URL" | "ServiceCollectionURL" => Param::ServiceCollectionUrl,
            "PUBLISHER_NAMESPACE_URL" | "PublisherNamespaceURL" => Param::PublisherNamespaceUrl,
            "PUBLIC_OPENPGP_KEY_URL" | "PublicOpenPGPKeyURL" => Param::PublicOpenpgpKeyUrl,
            "PUBLIC_KEY_FINGERPRINT" | "PublicKeyFingerprint" => Param::PublicKeyFingerprint,
            _ => return Err(Error::UnknownParam(s.to_string())),
        })
    }
}

/// Values substituted into templates for one profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateParams {
    pub base_url: String,
    pub canonical_url: String,
    pub directory_url: String,
    pub distribution_url: String,
    pub feed_url: String,
    pub rolie_feed_url: String,
    pub service_collection_url: String,
    pub publisher_namespace_url: String,
    pub public_openpgp_key_url: String,
    pub public_key_fingerprint: String,
}

impl TemplateParams {
    /// Derives all URLs from the profile's base URL.
    pub fn new(base_url: &str, key_id: &str, key_fingerprint: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        let well_known = format!("{base}/.well-known/csaf");
        Self {
            base_url: base.to_string(),
            canonical_url: format!("{well_known}/provider-metadata.json"),
            directory_url: well_known.clone(),
            distribution_url: well_known.clone(),
            feed_url: format!("{well_known}/feed-tlp-white.json"),
            rolie_feed_url: format!("{well_known}/feed-tlp-white.json"),
            service_collection_url: format!("{well_known}/service.json"),
            publisher_namespace_url: base.to_string(),
            public_openpgp_key_url: format!("{base}/{key_id}.asc"),
            public_key_fingerprint: key_fingerprint.to_string(),
        }
    }

    pub fn get(&self, param: Param) -> &str {
        match param {
            Param::BaseUrl => &self.base_url,
            Param::CanonicalUrl => &self.canonical_url,
            Param::DirectoryUrl => &self.directory_url,
            Param::DistributionUrl => &self.distribution_url,
            Param::FeedUrl => &self.feed_url,
            Param::RolieFeedUrl => &self.rolie_feed_url,
            Param::ServiceCollectionUrl => &self.service_collection_url,
            Param::PublisherNamespaceUrl => &self.publisher_namespace_url,
            Param::PublicOpenpgpKeyUrl => &self.public_openpgp_key_url,
            Param::PublicKeyFingerprint => &self.public_key_fingerprint,
        }
    }
}

/// A base URL with `{protocol}`, `{host}`, `{port}` and `{profile}`
/// placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseUrl {
    pub template: String,
    pub protocol: String,
    pub host: String,
    pub port: u16,
}

impl BaseUrl {
    pub fn expand(&self, profile: &str) -> String {
        self.template
            .replace("{protocol}", &self.protocol)
            .replace("{host}", &self.host)
            .replace("{port}", &self.port.to_string())
            .replace("{profile}", profile)
    }
}

/// How references to names outside [Param] are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnknownKeys {
    #[default]
    Strict,
    /// Deprecated: render unknown names as the empty string.
    Lenient,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(Vec<u8>),
    Param(Param),
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(input: &[u8]) -> Result<Self, Error> {
        let mut segments = Vec::new();
        let mut pos = 0;

        while let Some(start) = find(&input[pos..], OPEN).map(|i| pos + i) {
            if start > pos {
                segments.push(Segment::Literal(input[pos..start].to_vec()));
            }
            let body_start = start + OPEN.len();
            let body_end = find(&input[body_start..], CLOSE)
                .map(|i| body_start + i)
                .ok_or(Error::Unterminated(start))?;

            let body = String::from_utf8_lossy(&input[body_start..body_end]);
            let body = body.trim();
            let name = body.strip_prefix('.').unwrap_or(body);
            if !is_identifier(name) {
                return Err(Error::UnsupportedAction(body.to_string(), start));
            }
            segments.push(match name.parse() {
                Ok(param) => Segment::Param(param),
                Err(_) => Segment::Unknown(name.to_string()),
            });

            pos = body_end + CLOSE.len();
        }
        if pos < input.len() {
            segments.push(Segment::Literal(input[pos..].to_vec()));
        }

        Ok(Self { segments })
    }

    pub fn render(&self, params: &TemplateParams, unknown: UnknownKeys) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(bytes) => out.extend_from_slice(bytes),
                Segment::Param(param) => out.extend_from_slice(params.get(*param).as_bytes()),
                Segment::Unknown(name) => match unknown {
                    UnknownKeys::Strict => return Err(Error::UnknownParam(name.clone())),
                    UnknownKeys::Lenient => {
                        warn!(name = %name, "unknown template parameter rendered empty")
                    }
                },
            }
        }
        Ok(out)
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
