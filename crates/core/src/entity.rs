//! Known-entity catalog and mention extraction.
//!
//! The catalog is an immutable snapshot rebuilt by [`EntityCatalog::refresh`]
//! and passed by reference to callers. Staleness between refreshes is
//! tolerated; there is no ambient mutable cache.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::message::{normalize_mentions, EntityKind, EntityMention};
use crate::errors::ApplicationError;

/// Names shorter than this are never matched; single words like "Go" inside
/// longer text would contaminate every message.
const MIN_MATCHABLE_NAME_CHARS: usize = 3;

/// A CRM record as consumed by this pipeline: the name feeds the catalog, the
/// summary is embeddable text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmRecord {
    pub id: String,
    pub kind: EntityKind,
    pub name: String,
    pub summary: String,
}

/// Narrow read-only seam to the CRM collaborator.
#[async_trait]
pub trait CrmDirectory: Send + Sync {
    async fn records(&self, kind: EntityKind) -> Result<Vec<CrmRecord>, ApplicationError>;
}

/// A directory with no backing CRM; yields an empty catalog.
#[derive(Default)]
pub struct NoopCrmDirectory;

#[async_trait]
impl CrmDirectory for NoopCrmDirectory {
    async fn records(&self, _kind: EntityKind) -> Result<Vec<CrmRecord>, ApplicationError> {
        Ok(Vec::new())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCatalog {
    companies: Vec<String>,
    contacts: Vec<String>,
    opportunities: Vec<String>,
}

impl EntityCatalog {
    pub fn new(
        companies: Vec<String>,
        contacts: Vec<String>,
        opportunities: Vec<String>,
    ) -> Self {
        Self { companies, contacts, opportunities }
    }

    pub async fn refresh(directory: &dyn CrmDirectory) -> Result<Self, ApplicationError> {
        let mut catalog = Self::default();
        for kind in [EntityKind::Company, EntityKind::Contact, EntityKind::Opportunity] {
            let names =
                directory.records(kind).await?.into_iter().map(|record| record.name).collect();
            match kind {
                EntityKind::Company => catalog.companies = names,
                EntityKind::Contact => catalog.contacts = names,
                EntityKind::Opportunity => catalog.opportunities = names,
            }
        }
        Ok(catalog)
    }

    pub fn names(&self, kind: EntityKind) -> &[String] {
        match kind {
            EntityKind::Company => &self.companies,
            EntityKind::Contact => &self.contacts,
            EntityKind::Opportunity => &self.opportunities,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.companies.is_empty() && self.contacts.is_empty() && self.opportunities.is_empty()
    }

    /// Case-insensitive substring match against every known name. This is the
    /// original matching policy, precision tradeoffs included: a name
    /// appearing inside unrelated text still counts as a mention.
    pub fn extract_mentions(&self, text: &str) -> Vec<EntityMention> {
        let haystack = text.to_lowercase();
        let mut found = Vec::new();

        for kind in [EntityKind::Company, EntityKind::Contact, EntityKind::Opportunity] {
            for name in self.names(kind) {
                if name.chars().count() < MIN_MATCHABLE_NAME_CHARS {
                    continue;
                }
                if haystack.contains(&name.to_lowercase()) {
                    found.push(EntityMention::new(kind, name.clone()));
                }
            }
        }

        normalize_mentions(found)
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::message::{EntityKind, EntityMention};
    use crate::errors::ApplicationError;

    use super::{CrmDirectory, CrmRecord, EntityCatalog, NoopCrmDirectory};

    fn catalog() -> EntityCatalog {
        EntityCatalog::new(
            vec!["Zillow".to_string(), "Deno".to_string(), "Go".to_string()],
            vec!["Dana Lee".to_string()],
            vec!["Zillow Expansion".to_string()],
        )
    }

    #[test]
    fn matches_names_case_insensitively() {
        let mentions = catalog().extract_mentions("demo went well, ZILLOW wants pricing");
        assert_eq!(
            mentions,
            vec![EntityMention::new(EntityKind::Company, "Zillow")]
        );
    }

    #[test]
    fn matches_multiple_kinds_in_one_text() {
        let mentions =
            catalog().extract_mentions("Dana Lee asked about the Zillow Expansion timeline");
        assert_eq!(
            mentions,
            vec![
                EntityMention::new(EntityKind::Company, "Zillow"),
                EntityMention::new(EntityKind::Contact, "Dana Lee"),
                EntityMention::new(EntityKind::Opportunity, "Zillow Expansion"),
            ]
        );
    }

    #[test]
    fn ignores_names_too_short_to_match_safely() {
        let mentions = catalog().extract_mentions("let's go over the agenda");
        assert!(mentions.is_empty());
    }

    #[test]
    fn substring_policy_matches_inside_words() {
        // Known tradeoff: "Deno" matches inside "denoting".
        let mentions = catalog().extract_mentions("denoting the change in the doc");
        assert_eq!(mentions, vec![EntityMention::new(EntityKind::Company, "Deno")]);
    }

    struct StubDirectory;

    #[async_trait::async_trait]
    impl CrmDirectory for StubDirectory {
        async fn records(&self, kind: EntityKind) -> Result<Vec<CrmRecord>, ApplicationError> {
            Ok(match kind {
                EntityKind::Company => vec![CrmRecord {
                    id: "001".to_string(),
                    kind,
                    name: "Zillow".to_string(),
                    summary: "Account: Zillow".to_string(),
                }],
                _ => Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn refresh_builds_snapshot_from_directory() {
        let catalog = EntityCatalog::refresh(&StubDirectory).await.expect("refresh");
        assert_eq!(catalog.names(EntityKind::Company), ["Zillow".to_string()]);
        assert!(catalog.names(EntityKind::Contact).is_empty());
    }

    #[tokio::test]
    async fn noop_directory_yields_empty_catalog() {
        let catalog = EntityCatalog::refresh(&NoopCrmDirectory).await.expect("refresh");
        assert!(catalog.is_empty());
        assert!(catalog.extract_mentions("Zillow").is_empty());
    }
}
