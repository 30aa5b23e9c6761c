//! End-to-end pipeline run against mock catalogs and PMC services.

mod support;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use litharvest::classify::{BlockingClassifier, Classification};
use litharvest::download::{ClientOptions, ConcurrencyBudget, HttpClient, RateLimiter, RetryPolicy};
use litharvest::fulltext::fetch::DocumentFetcher;
use litharvest::fulltext::transfer::{HttpTransfer, Transfer};
use litharvest::fulltext::{FullTextResolver, PmcEndpoints};
use litharvest::source::{OpenAlexOptions, OpenAlexSource, PubMedSource};
use litharvest::{JsonlIngestor, Pipeline, PipelineError, PipelineParts, SourceKind};
use serde_json::json;
use support::socket_guard::start_mock_server_or_skip;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const EFETCH_XML: &str = r#"<?xml version="1.0" ?>
<PubmedArticleSet>
  <PubmedArticle>
    <MedlineCitation>
      <PMID Version="1">38000001</PMID>
      <Article>
        <Journal>
          <JournalIssue><PubDate><Year>2024</Year></PubDate></JournalIssue>
          <Title>Journal of Dementia Care</Title>
        </Journal>
        <ArticleTitle>Sleep and dementia</ArticleTitle>
        <Abstract><AbstractText>Sleep loss raises dementia risk.</AbstractText></Abstract>
        <AuthorList>
          <Author><LastName>Smith</LastName><Initials>J</Initials></Author>
        </AuthorList>
      </Article>
    </MedlineCitation>
    <PubmedData>
      <ArticleIdList>
        <ArticleId IdType="doi">10.1000/jdc.1</ArticleId>
        <ArticleId IdType="pmc">PMC1234567</ArticleId>
      </ArticleIdList>
    </PubmedData>
  </PubmedArticle>
  <PubmedArticle>
    <MedlineCitation>
      <PMID Version="1">38000002</PMID>
      <Article><ArticleTitle>Dementia care editorial</ArticleTitle></Article>
    </MedlineCitation>
  </PubmedArticle>
</PubmedArticleSet>"#;

const BIOC_XML: &str = r#"<collection><document>
  <infon key="license">CC BY</infon>
  <passage><infon key="section_type">TITLE</infon><text>Sleep and dementia</text></passage>
  <passage><infon key="section_type">ABSTRACT</infon><text>Sleep loss raises dementia risk.</text></passage>
</document></collection>"#;

/// gzip-compressed tar holding `(path, contents)` entries.
fn tarball(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, data.as_bytes())
            .expect("append entry");
    }
    let mut encoder = builder.into_inner().expect("finish tar");
    encoder.flush().expect("flush gzip");
    encoder.finish().expect("finish gzip")
}

fn client() -> HttpClient {
    HttpClient::new(
        ClientOptions {
            contact_email: "tests@example.org".into(),
            retry: RetryPolicy::with_max_attempts(1),
            ..ClientOptions::default()
        },
        Arc::new(RateLimiter::disabled()),
    )
    .expect("client should build")
}

fn keyword_classifier() -> BlockingClassifier {
    BlockingClassifier::new(|text| {
        Ok(Classification {
            aspects: Vec::new(),
            qualifies: text.to_lowercase().contains("dementia"),
        })
    })
}

async fn mount_catalogs(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/eutils/esearch.fcgi"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "esearchresult": {"idlist": ["38000001", "38000002"]}
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/eutils/efetch.fcgi"))
        .respond_with(ResponseTemplate::new(200).set_body_string(EFETCH_XML))
        .mount(server)
        .await;

    let uri = server.uri();
    Mock::given(method("GET"))
        .and(path("/works"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "meta": {"next_cursor": null},
            "results": [
                {
                    "id": "https://openalex.org/W4390000011",
                    "doi": "https://doi.org/10.2000/open.7",
                    "title": "Exercise and dementia",
                    "type": "article",
                    "abstract_inverted_index": {"Exercise": [0], "slows": [1], "dementia": [2]},
                    "primary_location": {
                        "is_oa": true,
                        "landing_page_url": format!("{uri}/landing/open7"),
                        "pdf_url": format!("{uri}/files/open7.pdf")
                    }
                },
                {
                    "id": "https://openalex.org/W4390000012",
                    "doi": "https://doi.org/10.1000/JDC.1",
                    "title": "Sleep and dementia",
                    "cited_by_count": 3,
                    "abstract_inverted_index": {"Sleep": [0], "and": [1], "dementia": [2]}
                }
            ]
        })))
        .mount(server)
        .await;
}

async fn mount_fulltext(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/bioc/BioC_xml/PMC1234567/unicode"))
        .respond_with(ResponseTemplate::new(200).set_body_string(BIOC_XML))
        .mount(server)
        .await;
    // The package carries only supplementary material, so the BioC text is rendered.
    let oa_xml = format!(
        r#"<OA><records><record id="PMC1234567" license="CC BY">
             <link format="tgz" href="{}/pub/PMC1234567.tar.gz"/>
           </record></records></OA>"#,
        server.uri()
    );
    Mock::given(method("GET"))
        .and(path("/oa.fcgi"))
        .respond_with(ResponseTemplate::new(200).set_body_string(oa_xml))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/pub/PMC1234567.tar.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(tarball(&[(
            "PMC1234567/supplement_s002.pdf",
            "%PDF-1.4 supplement",
        )])))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/landing/open7"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>landing</html>"))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/open7.pdf"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/pdf")
                .set_body_bytes(b"%PDF-1.7 open access".to_vec()),
        )
        .mount(server)
        .await;
}

fn pipeline(server: &MockServer, doc_dir: &TempDir) -> Pipeline {
    let client = client();
    let budget = Arc::new(ConcurrencyBudget::default());
    let transfer: Arc<dyn Transfer> = Arc::new(HttpTransfer::new(client.clone()));
    let fetcher = DocumentFetcher::new(&client, None).with_retry_policy(RetryPolicy::with_max_attempts(1));

    Pipeline::new(PipelineParts {
        pubmed: Arc::new(PubMedSource::with_base_url(
            client.clone(),
            "tests@example.org",
            None,
            format!("{}/eutils", server.uri()),
        )),
        openalex: Arc::new(OpenAlexSource::new(
            &client,
            OpenAlexOptions {
                base_url: format!("{}/works", server.uri()),
                mailto: "tests@example.org".into(),
                page_delay: Duration::ZERO,
                retry: RetryPolicy::with_max_attempts(1),
                ..OpenAlexOptions::default()
            },
        )),
        pmc: Arc::new(FullTextResolver::pmc(
            &client,
            transfer,
            Arc::clone(&budget),
            PmcEndpoints {
                bioc_base_url: format!("{}/bioc", server.uri()),
                oa_service_url: format!("{}/oa.fcgi", server.uri()),
                doc_dir: doc_dir.path().to_path_buf(),
            },
        )),
        direct: Arc::new(FullTextResolver::direct(
            Arc::new(fetcher),
            budget,
            doc_dir.path().to_path_buf(),
        )),
        classifier: Arc::new(keyword_classifier()),
        ingestor: Arc::new(JsonlIngestor::new(doc_dir.path().join("manifest.jsonl"))),
    })
}

#[tokio::test]
async fn test_dementia_window_end_to_end() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_catalogs(&server).await;
    mount_fulltext(&server).await;

    let doc_dir = TempDir::new().expect("temp dir");
    let report = pipeline(&server, &doc_dir)
        .search_and_resolve("dementia", 30, 1, 5)
        .await
        .expect("run should succeed");

    assert!(report.records.len() <= 5);
    assert!(report.records.iter().all(|r| r.dedupe_key().is_some()));

    let mut keys: Vec<_> = report.records.iter().filter_map(|r| r.dedupe_key()).collect();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), report.records.len(), "merged identifiers are unique");
    assert_eq!(report.records.len(), 3);

    // PubMed record merged with its OpenAlex twin and resolved through rendered BioC text.
    let sleep = report
        .records
        .iter()
        .find(|r| r.ids.pmid.as_deref() == Some("38000001"))
        .expect("pubmed record");
    assert_eq!(sleep.source, SourceKind::PubMed);
    assert_eq!(sleep.ids.openalex.as_deref(), Some("W4390000012"));
    assert_eq!(sleep.cited_by_count, Some(3));
    assert_eq!(sleep.relevant, Some(true));
    assert_eq!(sleep.license.as_deref(), Some("CC BY"));
    assert_eq!(
        sleep.fulltext_path.as_deref(),
        Some(doc_dir.path().join("PMC1234567.pdf").as_path())
    );

    // No abstract: skipped by the classifier, still reported.
    let editorial = report
        .records
        .iter()
        .find(|r| r.ids.pmid.as_deref() == Some("38000002"))
        .expect("editorial record");
    assert_eq!(editorial.relevant, None);
    assert_eq!(editorial.classification, None);
    assert_eq!(editorial.fulltext_path, None);

    // OpenAlex-only record fetched from its PDF URL.
    let exercise = report
        .records
        .iter()
        .find(|r| r.ids.openalex.as_deref() == Some("W4390000011"))
        .expect("openalex record");
    let pdf = exercise.fulltext_path.as_ref().expect("direct pdf resolved");
    assert_eq!(std::fs::read(pdf).expect("read pdf"), b"%PDF-1.7 open access");

    assert_eq!(report.stats.found, 4);
    assert_eq!(report.stats.classified, 3);
    assert_eq!(report.stats.included, 3);
    assert_eq!(report.stats.resolved, 2);
    assert_eq!(report.stats.ingested, 2);
    assert_eq!(report.stats.ingest_failed, 0);

    let manifest = std::fs::read_to_string(doc_dir.path().join("manifest.jsonl")).expect("manifest");
    assert_eq!(manifest.lines().count(), 2);
}

#[tokio::test]
async fn test_both_catalogs_down_fails_run() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let doc_dir = TempDir::new().expect("temp dir");
    let err = pipeline(&server, &doc_dir)
        .search_and_resolve("dementia", 30, 1, 5)
        .await
        .expect_err("run should fail");
    assert!(matches!(err, PipelineError::AllSourcesFailed { .. }));
}

#[tokio::test]
async fn test_one_catalog_down_still_reports() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    mount_catalogs(&server).await;
    mount_fulltext(&server).await;
    // Higher-priority override makes OpenAlex fail.
    Mock::given(method("GET"))
        .and(path("/works"))
        .respond_with(ResponseTemplate::new(500))
        .with_priority(1)
        .mount(&server)
        .await;

    let doc_dir = TempDir::new().expect("temp dir");
    let report = pipeline(&server, &doc_dir)
        .search_and_resolve("dementia", 30, 1, 5)
        .await
        .expect("run should succeed");
    assert_eq!(report.stats.found, 2);
    assert!(report.records.iter().all(|r| r.source == SourceKind::PubMed));
}
