use std::path::PathBuf;

use async_trait::async_trait;
use salesrag_core::chrono::Utc;
use tracing::info;

use salesrag_core::{
    ApplicationError, CrmDirectory, CrmRecord, EntityKind, EntityMention,
};
use salesrag_vector::{doc_id, Embedder, EntryMetadata, Source, VectorEntry, VectorIndex};

use crate::error::IndexError;

/// CRM directory backed by a JSON snapshot file: a flat array of records with
/// id, kind, name and summary. Keeps the pipeline runnable without live CRM
/// credentials.
pub struct StaticCrmDirectory {
    path: PathBuf,
}

impl StaticCrmDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<Vec<CrmRecord>, ApplicationError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|error| {
            ApplicationError::Configuration(format!(
                "could not read entities file `{}`: {error}",
                self.path.display()
            ))
        })?;
        serde_json::from_str(&raw).map_err(|error| {
            ApplicationError::Data(format!(
                "malformed entities file `{}`: {error}",
                self.path.display()
            ))
        })
    }
}

#[async_trait]
impl CrmDirectory for StaticCrmDirectory {
    async fn records(&self, kind: EntityKind) -> Result<Vec<CrmRecord>, ApplicationError> {
        Ok(self.load().await?.into_iter().filter(|record| record.kind == kind).collect())
    }
}

/// Ingest CRM records into the vector store under `source = salesforce`, so
/// account and contact summaries are searchable next to messages. Keyed by
/// record id; re-ingesting a changed record replaces its document.
pub async fn ingest_crm_records(
    directory: &dyn CrmDirectory,
    embedder: &dyn Embedder,
    vector: &dyn VectorIndex,
) -> Result<u64, IndexError> {
    let mut ingested = 0_u64;

    for kind in [EntityKind::Company, EntityKind::Contact, EntityKind::Opportunity] {
        for record in directory.records(kind).await? {
            let embedding = embedder.embed(&record.summary).await?;
            vector
                .upsert(&VectorEntry {
                    doc_id: doc_id(Source::Salesforce, kind.as_str(), &record.id),
                    source: Source::Salesforce,
                    metadata: EntryMetadata {
                        channel_id: None,
                        channel_name: None,
                        author_id: None,
                        ts: record.id.clone(),
                        in_thread: false,
                        mentions: vec![EntityMention::new(kind, record.name.clone())],
                    },
                    content: record.summary.clone(),
                    embedding,
                    indexed_at: Utc::now(),
                })
                .await?;
            ingested += 1;
        }
    }

    info!(event_name = "crm.ingested", records = ingested, "crm records ingested");
    Ok(ingested)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use salesrag_core::{CrmDirectory, EntityKind};
    use salesrag_vector::{
        Embedder, HashEmbedder, InMemoryVectorStore, SearchFilter, Source, VectorIndex,
    };

    use super::{ingest_crm_records, StaticCrmDirectory};

    const SNAPSHOT: &str = r#"[
        {"id": "001A", "kind": "company", "name": "Zillow", "summary": "Account: Zillow. Industry: Real Estate."},
        {"id": "003B", "kind": "contact", "name": "Dana Lee", "summary": "Contact: Dana Lee, VP Engineering at Zillow."}
    ]"#;

    fn snapshot_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        file.write_all(SNAPSHOT.as_bytes()).expect("write snapshot");
        file
    }

    #[tokio::test]
    async fn directory_filters_records_by_kind() {
        let file = snapshot_file();
        let directory = StaticCrmDirectory::new(file.path());

        let companies = directory.records(EntityKind::Company).await.expect("companies");
        assert_eq!(companies.len(), 1);
        assert_eq!(companies[0].name, "Zillow");

        let opportunities =
            directory.records(EntityKind::Opportunity).await.expect("opportunities");
        assert!(opportunities.is_empty());
    }

    #[tokio::test]
    async fn ingestion_is_idempotent_per_record_id() {
        let file = snapshot_file();
        let directory = StaticCrmDirectory::new(file.path());
        let embedder = HashEmbedder::default();
        let vector = InMemoryVectorStore::default();

        let first = ingest_crm_records(&directory, &embedder, &vector).await.expect("ingest");
        assert_eq!(first, 2);

        ingest_crm_records(&directory, &embedder, &vector).await.expect("re-ingest");
        assert_eq!(vector.count(Some(Source::Salesforce)).await.expect("count"), 2);

        let query = embedder.embed("Zillow account").await.expect("embed query");
        let hits = vector
            .search(&query, &SearchFilter::new().with_entity("Zillow"), 10)
            .await
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].source, Source::Salesforce);
    }
}
