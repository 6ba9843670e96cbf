use serde::Deserialize;

use crate::{PrefixRecord, ResolvedRecipient};

/// How a recipient local-part is compared against a prefix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// The local-part must equal the prefix.
    Exact,
    /// The local-part must start with the prefix, the longest one wins.
    #[default]
    StartsWith,
}

/// Maps resolved recipients to the prefix that owns them.
///
/// Candidates are evaluated in specificity order: longer prefixes first,
/// so that `support-eu` claims `support-eu-billing@` before `support`.
/// Inactive prefixes never match.
#[derive(Debug, Clone, Default)]
pub struct PrefixMatcher {
    mode: MatchMode,

    /// Domains accepted for matching, empty accepts any domain. A
    /// `*.example.com` entry accepts the domain and all its subdomains.
    allowed_domains: Vec<String>,
}

impl PrefixMatcher {
    pub fn new(mode: MatchMode) -> Self {
        Self {
            mode,
            allowed_domains: Vec::new(),
        }
    }

    pub fn with_allowed_domains(mut self, domains: Vec<String>) -> Self {
        self.allowed_domains = domains
            .into_iter()
            .map(|domain| domain.trim().to_ascii_lowercase())
            .filter(|domain| !domain.is_empty())
            .collect();
        self
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    /// Tests if the recipient domain may be matched at all.
    pub fn domain_allowed(&self, domain: &str) -> bool {
        if self.allowed_domains.is_empty() {
            return true;
        }
        let domain = domain.to_ascii_lowercase();
        self.allowed_domains.iter().any(|allowed| {
            match allowed.strip_prefix("*.") {
                Some(wildcard) => domain == wildcard || domain.ends_with(&format!(".{wildcard}")),
                None => domain == *allowed,
            }
        })
    }

    /// Tests if `record` owns the given local-part, ignoring case.
    pub fn matches(&self, record: &PrefixRecord, local_part: &str) -> bool {
        if !record.is_active || record.prefix.is_empty() {
            return false;
        }
        let local_part = local_part.to_lowercase();
        let prefix = record.prefix.to_lowercase();
        match self.mode {
            MatchMode::Exact => local_part == prefix,
            MatchMode::StartsWith => local_part.starts_with(&prefix),
        }
    }

    /// Finds the owning prefix of `recipient` within `prefixes`.
    ///
    /// Ties between prefixes of the same length (only possible with
    /// records differing in case) resolve to the lowest id so the choice
    /// stays stable across runs.
    pub fn find<'a>(
        &self,
        recipient: &ResolvedRecipient,
        prefixes: &'a [PrefixRecord],
    ) -> Option<&'a PrefixRecord> {
        if !self.domain_allowed(recipient.domain()) {
            return None;
        }
        let local_part = recipient.local_part();
        prefixes
            .iter()
            .filter(|record| self.matches(record, local_part))
            .min_by(|a, b| {
                b.prefix
                    .chars()
                    .count()
                    .cmp(&a.prefix.chars().count())
                    .then(a.id.cmp(&b.id))
            })
    }
}

/// Tests if a stored `to_address` falls in the access scope of `prefix`,
/// that is whether it starts with `prefix@` ignoring case.
///
/// ```rust
/// assert!(prefixmail_core::belongs_to_prefix("Support@Example.com", "support"));
/// assert!(!prefixmail_core::belongs_to_prefix("support-eu@example.com", "support"));
/// ```
pub fn belongs_to_prefix(address: &str, prefix: &str) -> bool {
    let address = address.to_lowercase();
    let scope = format!("{}@", prefix.to_lowercase());
    address.starts_with(&scope)
}
