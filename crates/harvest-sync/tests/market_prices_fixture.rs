use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use harvest_adapters::{normalize, parse_first_table, StaticCredentials};
use harvest_core::{Identifier, StagingBatch, Value};
use harvest_storage::{FetchError, FetchedResponse, MemoryWarehouse, PageRequest, PageTransport, StatusCode, Warehouse};
use harvest_sync::{dedupe_rows, DatasetRegistry, SyncConfig, SyncPipeline};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn fixture_page() -> String {
    std::fs::read_to_string(workspace_root().join("fixtures/market-prices/page-0.html"))
        .expect("fixture page")
}

async fn registry() -> DatasetRegistry {
    DatasetRegistry::load(&workspace_root().join("datasets.yaml"))
        .await
        .expect("datasets.yaml")
}

/// First page comes from the fixture; every later offset is past the end.
struct FixtureSite {
    first_page_url: String,
}

#[async_trait]
impl PageTransport for FixtureSite {
    async fn get(&self, request: &PageRequest) -> Result<FetchedResponse, FetchError> {
        let body = if request.url == self.first_page_url {
            fixture_page()
        } else {
            "<html><body><table><thead><tr><th>Commodity</th></tr></thead></table></body></html>"
                .to_string()
        };
        Ok(FetchedResponse {
            status: StatusCode::OK,
            final_url: request.url.clone(),
            body: body.into_bytes(),
        })
    }
}

#[tokio::test]
async fn registry_declares_all_sources() {
    let registry = registry().await;
    let kinds: Vec<_> = registry
        .datasets
        .iter()
        .map(|d| (d.dataset_id.as_str(), d.source.label()))
        .collect();
    assert_eq!(
        kinds,
        vec![
            ("market_prices", "paginated"),
            ("top_cryptocurrency", "paginated"),
            ("google_trending_in_kenya", "trend"),
        ]
    );
}

#[tokio::test]
async fn default_run_skips_the_unconfigured_crypto_source() {
    let registry = registry().await;
    let selected: Vec<_> = registry
        .select(&[])
        .expect("select")
        .into_iter()
        .map(|d| d.dataset_id)
        .collect();
    assert_eq!(selected, vec!["market_prices", "google_trending_in_kenya"]);

    let trend = registry.get("google_trending_in_kenya").expect("trend dataset");
    assert!(trend.dedupe_key.fields().is_empty());
}

#[tokio::test]
async fn fixture_page_normalizes_against_registry_schema() {
    let registry = registry().await;
    let market = registry.get("market_prices").expect("market_prices");

    let table = parse_first_table(&fixture_page()).unwrap().expect("table");
    assert_eq!(table.rows.len(), 3);
    let batch = StagingBatch::new(Identifier::Int(1), 0, table.into_records());
    let rows = normalize(&batch, &market.schema, &market.column_aliases);

    let supply = rows[0].value_of(&market.schema, "supply_volume");
    assert_eq!(supply, Some(&Value::Float(2700.0)));
    assert_eq!(rows[2].value_of(&market.schema, "retail"), Some(&Value::Null));

    let indices = market.dedupe_key.indices(&market.schema).unwrap();
    let (kept, removed) = dedupe_rows(rows, &indices);
    assert_eq!((kept.len(), removed), (2, 1));
}

#[tokio::test(start_paused = true)]
async fn market_prices_run_end_to_end() {
    let registry = registry().await;
    let market = registry.get("market_prices").expect("market_prices").clone();
    let warehouse = Arc::new(MemoryWarehouse::new());
    let site = Arc::new(FixtureSite {
        first_page_url: "https://kamis.kilimo.go.ke/site/market?product=1&per_page=3000".to_string(),
    });
    let pipeline = SyncPipeline::new(
        SyncConfig {
            poll_interval: Duration::from_millis(50),
            ..SyncConfig::default()
        },
        warehouse.clone(),
        site,
        Arc::new(StaticCredentials::default()),
    );

    let report = pipeline.run_dataset(&market).await;
    assert_eq!(report.aborted, None);
    assert_eq!(report.rows_fetched, 3);
    assert_eq!(report.nulled_fields, 1);
    assert_eq!(report.duplicates_removed(), 1);
    assert_eq!(warehouse.scan(&market.table).await.unwrap().len(), 2);
}

#[tokio::test]
async fn trend_dataset_without_api_key_aborts() {
    let registry = registry().await;
    let trends = registry.get("google_trending_in_kenya").expect("trends").clone();
    let pipeline = SyncPipeline::new(
        SyncConfig::default(),
        Arc::new(MemoryWarehouse::new()),
        Arc::new(FixtureSite {
            first_page_url: String::new(),
        }),
        Arc::new(StaticCredentials::default()),
    );
    let report = pipeline.run_dataset(&trends).await;
    assert!(report
        .aborted
        .as_deref()
        .is_some_and(|reason| reason.contains("SERPAPI_KEY")));
}
