// End-to-end: two gateway instances sharing one SQLite window file

use axum::{
    routing::{get, post},
    Json, Router,
};
use health_gateway_lib::gateway::audit::verify_chain;
use health_gateway_lib::gateway::config::{
    AuditSinkKind, ClientCredentials, WindowStoreConfig,
};
use health_gateway_lib::models::{AuditCategory, AuditOutcome, AuditQuery};
use health_gateway_lib::{GatewayClient, GatewayConfig, GatewayError, GatewayRequest, Operation};
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Fakes {
    base_url: String,
    api_hits: Arc<AtomicUsize>,
    token_hits: Arc<AtomicUsize>,
}

async fn spawn_fakes() -> Fakes {
    let api_hits = Arc::new(AtomicUsize::new(0));
    let token_hits = Arc::new(AtomicUsize::new(0));

    let app = Router::new()
        .route(
            "/oauth2/token",
            post({
                let hits = token_hits.clone();
                move || async move {
                    let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
                    Json(json!({"access_token": format!("token-{}", n), "expires_in": 3600}))
                }
            }),
        )
        .route(
            "/prescriptions/FHIR/R4/MedicationRequest",
            get({
                let hits = api_hits.clone();
                move || async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Json(json!({"resourceType": "Bundle", "entry": []}))
                }
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Fakes {
        base_url: format!("http://{}", addr),
        api_hits,
        token_hits,
    }
}

fn config(fakes: &Fakes, window_db: &Path) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.sandbox.base_url = fakes.base_url.clone();
    config.sandbox.token_url = format!("{}/oauth2/token", fakes.base_url);
    config.credentials = ClientCredentials {
        client_id: "pharmacy-app".to_string(),
        client_secret: "s3cret".to_string(),
        scope: String::new(),
    };
    config
        .rate_limit
        .channels
        .insert("prescriptions".to_string(), 3);
    config.rate_limit.store = WindowStoreConfig::Sqlite {
        path: window_db.to_path_buf(),
    };
    config.retry.backoff_base_ms = 5;
    config
}

fn prescriptions() -> GatewayRequest {
    GatewayRequest::new(Operation::PrescriptionList {
        nhs_number: "9434765870".to_string(),
    })
    .with_tenant("pharmacy-42")
    .fresh()
}

#[tokio::test]
async fn shared_window_enforces_budget_across_instances() {
    let fakes = spawn_fakes().await;
    let shared = tempfile::tempdir().unwrap();
    let window_db = shared.path().join("windows.db");
    let (dir_a, dir_b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());

    let a = GatewayClient::init_in(&config(&fakes, &window_db), dir_a.path()).unwrap();
    let b = GatewayClient::init_in(&config(&fakes, &window_db), dir_b.path()).unwrap();

    let mut admitted = 0;
    let mut limited = 0;
    for i in 0..6 {
        let client = if i % 2 == 0 { &a } else { &b };
        match client.call(prescriptions()).await {
            Ok(_) => admitted += 1,
            Err(GatewayError::RateLimitExceeded { retry_after }) => {
                assert!(!retry_after.is_zero());
                limited += 1;
            }
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    assert_eq!(admitted, 3);
    assert_eq!(limited, 3);
    assert_eq!(fakes.api_hits.load(Ordering::SeqCst), 3);
    // One token per instance
    assert_eq!(fakes.token_hits.load(Ordering::SeqCst), 2);

    // Each instance audited every one of its calls, in its own chain
    for client in [&a, &b] {
        let records = client.audit().query(&AuditQuery::default()).unwrap();
        assert_eq!(records.len(), 3);
        verify_chain(&records).unwrap();
        assert!(records
            .iter()
            .all(|r| r.category == AuditCategory::Prescriptions));
        assert!(records
            .iter()
            .all(|r| r.masked_subject_id.as_deref() == Some("******5870")));
    }
    let limited_records = a
        .audit()
        .query(&AuditQuery::default())
        .unwrap()
        .into_iter()
        .chain(b.audit().query(&AuditQuery::default()).unwrap())
        .filter(|r| r.outcome == AuditOutcome::RateLimited)
        .count();
    assert_eq!(limited_records, 3);
}

#[tokio::test]
async fn jsonl_audit_survives_restart() {
    let fakes = spawn_fakes().await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&fakes, &dir.path().join("windows.db"));
    config.audit.sink = AuditSinkKind::Jsonl;

    {
        let client = GatewayClient::init_in(&config, dir.path()).unwrap();
        client.call(prescriptions()).await.unwrap();
        let err = client
            .call(GatewayRequest::new(Operation::PatientLookup {
                nhs_number: "9434765870".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err, GatewayError::NotFound);
        client.shutdown().await;
    }

    let client = GatewayClient::init_in(&config, dir.path()).unwrap();
    client.call(prescriptions()).await.unwrap();

    let raw = std::fs::read_to_string(dir.path().join("audit.jsonl")).unwrap();
    assert_eq!(raw.lines().count(), 3);
    assert!(!raw.contains("9434765870"));

    let records = client.audit().query(&AuditQuery::default()).unwrap();
    verify_chain(&records).unwrap();
    assert_eq!(records[1].outcome, AuditOutcome::NotFound);

    let demographics = client
        .audit()
        .query(&AuditQuery {
            category: Some(AuditCategory::Demographics),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(demographics.len(), 1);
}
