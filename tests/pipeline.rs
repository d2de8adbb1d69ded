//! End-to-end tests of the build and chat phases with in-process
//! providers and the in-memory store.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use codescope::chat::ChatService;
use codescope::config::Config;
use codescope::ingest::{ingest, reindex};
use codescope::progress::NoProgress;
use codescope::services::Services;
use codescope::source::SourceRef;
use codescope_core::embedding::Embedder;
use codescope_core::error::{EmbeddingError, ModelError};
use codescope_core::generation::{GenerationConfig, Generator};
use codescope_core::models::{SkipReason, SnapshotStatus};
use codescope_core::retrieve::RetrievalFilters;
use codescope_core::store::memory::InMemoryStore;

const DIMS: usize = 32;

/// Hashed bag-of-words vectors. Texts containing `EMBED_FAIL` are rejected.
struct HashEmbedder;

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-bow"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.iter().any(|t| t.contains("EMBED_FAIL")) {
            return Err(EmbeddingError::permanent("rejected by provider"));
        }
        Ok(texts.iter().map(|t| bag_of_words(t)).collect())
    }
}

fn bag_of_words(text: &str) -> Vec<f32> {
    let mut v = vec![0.0; DIMS];
    for word in text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
        let h = word
            .to_lowercase()
            .bytes()
            .fold(7u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
        v[(h as usize) % DIMS] += 1.0;
    }
    v[0] += 0.01;
    v
}

/// Records every prompt and echoes how many it has seen.
#[derive(Default)]
struct RecordingGenerator {
    prompts: Mutex<Vec<String>>,
}

#[async_trait]
impl Generator for RecordingGenerator {
    fn model_name(&self) -> &str {
        "recording"
    }

    async fn generate(&self, prompt: &str, _config: &GenerationConfig) -> Result<String, ModelError> {
        let mut prompts = self.prompts.lock().unwrap();
        prompts.push(prompt.to_string());
        Ok(format!("answer #{}", prompts.len()))
    }
}

fn write(root: &Path, rel: &str, bytes: &[u8]) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, bytes).unwrap();
}

fn services(tmp: &TempDir, embedder: Arc<dyn Embedder>, generator: Arc<dyn Generator>) -> Services {
    let mut config = Config::with_db(tmp.path().join("codescope.sqlite"));
    config.embedding.batch_size = 2;
    config.embedding.concurrency = 2;
    Services::new(config, Arc::new(InMemoryStore::new()), embedder, generator)
}

fn sample_repo(tmp: &TempDir) -> std::path::PathBuf {
    let root = tmp.path().join("repo");
    write(
        &root,
        "app/routes.py",
        b"from flask import Flask\n\napp = Flask(__name__)\n\n@app.route('/orders')\ndef list_orders():\n    return orders_table.all()\n",
    );
    write(
        &root,
        "src/billing.rs",
        b"pub struct Invoice {\n    pub total: u64,\n}\n\npub fn charge_invoice(invoice: &Invoice) -> u64 {\n    invoice.total\n}\n",
    );
    write(&root, "docs/legacy.txt", &[0x4c, 0x61, 0xff, 0xfe, 0x74, 0x69, 0x6e, 0x0a]);
    root
}

#[tokio::test]
async fn test_two_clean_files_and_one_undecodable() {
    let tmp = TempDir::new().unwrap();
    let root = sample_repo(&tmp);
    let services = services(&tmp, Arc::new(HashEmbedder), Arc::new(RecordingGenerator::default()));

    let snapshot = ingest(&services, SourceRef::Directory(root), &NoProgress)
        .await
        .unwrap();
    assert_eq!(snapshot.status, SnapshotStatus::Indexed);
    assert_eq!(snapshot.file_count, 3);
    assert_eq!(snapshot.stats.skipped, 1);
    assert_eq!(snapshot.stats.embedding_failed, 0);

    let chunks = services.store.list_chunks(&snapshot.id).await.unwrap();
    let paths: HashSet<&str> = chunks.iter().map(|c| c.path.as_str()).collect();
    assert_eq!(paths, HashSet::from(["app/routes.py", "src/billing.rs"]));

    let skipped = services.store.list_skipped(&snapshot.id).await.unwrap();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].path, "docs/legacy.txt");
    assert_eq!(skipped[0].reason, SkipReason::UnsupportedEncoding);
}

#[tokio::test]
async fn test_failed_embeddings_leave_no_orphans() {
    let tmp = TempDir::new().unwrap();
    let root = sample_repo(&tmp);
    write(&root, "src/broken.rs", b"// EMBED_FAIL\nfn broken() {}\n");
    let services = services(&tmp, Arc::new(HashEmbedder), Arc::new(RecordingGenerator::default()));

    let snapshot = ingest(&services, SourceRef::Directory(root), &NoProgress)
        .await
        .unwrap();
    assert_eq!(snapshot.status, SnapshotStatus::Indexed);
    assert_eq!(snapshot.stats.embedding_failed, 1);

    let chunks = services.store.list_chunks(&snapshot.id).await.unwrap();
    let records = services.store.list_embeddings(&snapshot.id).await.unwrap();
    let chunk_ids: HashSet<&str> = chunks.iter().map(|c| c.id.as_str()).collect();

    assert!(records.len() <= chunks.len());
    assert_eq!(chunks.len() - records.len(), snapshot.stats.embedding_failed as usize);
    assert!(records.iter().all(|r| chunk_ids.contains(r.chunk_id.as_str())));
    assert!(records.iter().all(|r| r.snapshot_id == snapshot.id));
}

#[tokio::test]
async fn test_retrieval_stays_within_snapshot_and_k() {
    let tmp = TempDir::new().unwrap();
    let root = sample_repo(&tmp);
    let services = services(&tmp, Arc::new(HashEmbedder), Arc::new(RecordingGenerator::default()));

    let first = ingest(&services, SourceRef::Directory(root.clone()), &NoProgress)
        .await
        .unwrap();
    let second = ingest(&services, SourceRef::Directory(root), &NoProgress)
        .await
        .unwrap();
    assert_ne!(first.id, second.id);

    for k in [1, 2, 10] {
        let hits = services
            .retriever
            .retrieve(&first.id, "charge invoice total", k, &RetrievalFilters::default())
            .await;
        assert!(hits.len() <= k);
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| h.chunk.snapshot_id == first.id));
    }

    let top = services
        .retriever
        .retrieve(&first.id, "charge invoice total", 1, &RetrievalFilters::default())
        .await;
    assert_eq!(top[0].chunk.path, "src/billing.rs");

    let python_only = RetrievalFilters {
        path_prefix: Some("app/".to_string()),
        language: None,
    };
    let hits = services
        .retriever
        .retrieve(&first.id, "charge invoice total", 5, &python_only)
        .await;
    assert!(hits.iter().all(|h| h.chunk.path.starts_with("app/")));
}

#[tokio::test]
async fn test_chat_with_empty_index_uses_history_only() {
    let tmp = TempDir::new().unwrap();
    let root = sample_repo(&tmp);
    let generator = Arc::new(RecordingGenerator::default());
    let services = services(
        &tmp,
        Arc::new(codescope::embedding::DisabledEmbedder),
        generator.clone(),
    );

    let snapshot = ingest(&services, SourceRef::Directory(root), &NoProgress)
        .await
        .unwrap();
    assert_eq!(snapshot.status, SnapshotStatus::Indexed);
    assert_eq!(snapshot.stats.embedded, 0);

    let chat = ChatService::from_services(&services);
    let first = chat.ask(&snapshot.id, "default", "How are orders listed?").await.unwrap();
    assert!(first.used_chunk_ids.is_empty());
    assert_eq!(first.answer, "answer #1");

    let second = chat.ask(&snapshot.id, "default", "And invoices?").await.unwrap();
    assert_eq!(second.index, 1);

    let prompts = generator.prompts.lock().unwrap();
    assert!(!prompts[0].contains("## Relevant code"));
    assert!(prompts[1].contains("How are orders listed?"));
    assert!(prompts[1].contains("## Conversation so far"));
}

#[tokio::test]
async fn test_reindex_swaps_index_atomically() {
    let tmp = TempDir::new().unwrap();
    let root = sample_repo(&tmp);
    let services = services(&tmp, Arc::new(HashEmbedder), Arc::new(RecordingGenerator::default()));

    let snapshot = ingest(&services, SourceRef::Directory(root), &NoProgress)
        .await
        .unwrap();
    let before = services.registry.current(&snapshot.id).unwrap();

    let rebuilt = reindex(&services, &snapshot.id, &NoProgress).await.unwrap();
    let after = services.registry.current(&snapshot.id).unwrap();

    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(before.len(), after.len());
    assert_eq!(rebuilt.stats.embedded, snapshot.stats.embedded);
    // A reader holding the old index keeps a complete view.
    assert_eq!(before.query(&bag_of_words("charge invoice"), 10).len(), before.len());

    let records = services.store.list_embeddings(&snapshot.id).await.unwrap();
    assert_eq!(records.len(), after.len());
}
