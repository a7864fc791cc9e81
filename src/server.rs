use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Json, Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use anyhow::Result;
use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::jobs::inference::ModelError;
use crate::jobs::progress::StopOutcome;
use crate::jobs::training::{TrainingPlan, TrainingRequest};
use crate::jobs::{ProgressSnapshot, TrainingService};
use crate::rules::{Coverage, Rule, RuleBundle, RuleGenerator};

pub struct ServerError {
    status: StatusCode,
    error: anyhow::Error,
}

impl ServerError {
    fn bad_request(error: impl Into<anyhow::Error>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, error: error.into() }
    }

    fn not_found(what: impl Into<String>) -> Self {
        Self { status: StatusCode::NOT_FOUND, error: anyhow::anyhow!("{} not found", what.into()) }
    }
}

/// Model read-back errors are the caller's fault, anything else is ours
fn model_error(error: anyhow::Error) -> ServerError {
    let status = if error.is::<ModelError>() { StatusCode::BAD_REQUEST } else { StatusCode::INTERNAL_SERVER_ERROR };
    ServerError { status, error }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": format!("{:#}", self.error) }))).into_response()
    }
}

impl<E> From<E> for ServerError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, error: err.into() }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TrainingService>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/rules/generate", post(generate_rules))
        .route("/rules/parse", post(parse_rules))
        .route("/rules/coverage", post(rule_coverage))
        .route("/train", post(train))
        .route("/jobs/{id}", get(job_status))
        .route("/jobs/{id}/stop", post(stop_job))
        .route("/jobs/{id}/predict", post(predict_rows))
        .route("/jobs/{id}/rules", get(saved_rules))
        .route("/stats", get(job_stats))
        .route("/ws/{id}", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(service: Arc<TrainingService>) -> Result<()> {
    let addr = service.config().bind_addr.clone();
    let app = router(AppState { service });

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("🚀 dsrules server ready: http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    columns: Vec<String>,
    features: Vec<Vec<f64>>,
    n_classes: usize,
    #[serde(default)]
    breaks: Option<usize>,
    #[serde(default = "default_true")]
    single: bool,
    #[serde(default)]
    pairs: bool,
    /// Per column: original category label -> code
    #[serde(default)]
    encoders: HashMap<String, BTreeMap<String, i64>>,
}

async fn generate_rules(Json(req): Json<GenerateRequest>) -> Result<Json<RuleBundle>, ServerError> {
    let mut generator = RuleGenerator::new(req.n_classes).with_encoders(req.encoders);
    if let Some(breaks) = req.breaks {
        generator = generator.with_breaks(breaks);
    }
    let rules = generator
        .generate(&req.features, &req.columns, req.single, req.pairs)
        .map_err(ServerError::bad_request)?;
    Ok(Json(RuleBundle::from_rules(&rules, &req.columns)))
}

#[derive(Deserialize)]
struct ParseRequest {
    columns: Vec<String>,
    /// Rule text such as `petal > 2.5` or `lambda x, var0=2: x[var0] > 1`
    sources: Vec<String>,
}

async fn parse_rules(Json(req): Json<ParseRequest>) -> Result<Json<RuleBundle>, ServerError> {
    let rules = req
        .sources
        .iter()
        .map(|source| Rule::from_source(source, &req.columns))
        .collect::<Result<Vec<_>, _>>()
        .map_err(ServerError::bad_request)?;
    Ok(Json(RuleBundle::from_rules(&rules, &req.columns)))
}

#[derive(Deserialize)]
struct CoverageRequest {
    columns: Vec<String>,
    features: Vec<Vec<f64>>,
    #[serde(flatten)]
    rules: RuleBundle,
}

#[derive(Serialize)]
struct RuleCoverage {
    label: String,
    #[serde(flatten)]
    coverage: Coverage,
}

async fn rule_coverage(Json(req): Json<CoverageRequest>) -> Result<impl IntoResponse, ServerError> {
    let rules = req.rules.into_rules(&req.columns, None).map_err(ServerError::bad_request)?;
    let coverage: Vec<RuleCoverage> = rules
        .iter()
        .map(|rule| RuleCoverage { label: rule.caption().to_string(), coverage: rule.coverage(&req.features) })
        .collect();
    Ok(Json(json!({ "coverage": coverage })))
}

async fn train(
    State(state): State<AppState>,
    Json(req): Json<TrainingRequest>,
) -> Result<impl IntoResponse, ServerError> {
    let plan = TrainingPlan::prepare(req).map_err(ServerError::bad_request)?;
    let job_id = state.service.enqueue_plan(plan).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "jobId": job_id }))))
}

async fn job_status(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ServerError> {
    match state.service.lookup(&id).await? {
        Some(view) => Ok(Json(view)),
        None => Err(ServerError::not_found(format!("job {}", id))),
    }
}

async fn stop_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ServerError> {
    match state.service.request_stop(&id) {
        StopOutcome::Requested => Ok((StatusCode::ACCEPTED, Json(json!({ "status": "stopping" })))),
        StopOutcome::NotFound => Err(ServerError::not_found(format!("running job {}", id))),
    }
}

#[derive(Deserialize)]
struct PredictRequest {
    #[serde(alias = "predictData")]
    features: Vec<Vec<f64>>,
}

async fn predict_rows(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PredictRequest>,
) -> Result<impl IntoResponse, ServerError> {
    match state.service.predict(&id, req.features).await.map_err(model_error)? {
        Some(predictions) => Ok(Json(predictions)),
        None => Err(ServerError::not_found(format!("job {}", id))),
    }
}

async fn saved_rules(State(state): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ServerError> {
    match state.service.saved_rules(&id).await.map_err(model_error)? {
        Some(rules) => Ok(Json(rules)),
        None => Err(ServerError::not_found(format!("job {}", id))),
    }
}

async fn job_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ServerError> {
    Ok(Json(state.service.stats().await?))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_progress(socket, state, id))
}

async fn send_snapshot<S>(sender: &mut S, snapshot: &ProgressSnapshot) -> bool
where
    S: Sink<WsMessage> + Unpin,
{
    let text = serde_json::to_string(snapshot).unwrap_or_default();
    sender.send(WsMessage::Text(text.into())).await.is_ok()
}

/// Pushes every snapshot change, heartbeats the latest one and forwards an
/// inbound `stop`. Closes after a terminal status.
async fn stream_progress(socket: WebSocket, state: AppState, id: String) {
    let (mut sender, mut receiver) = socket.split();

    let Some(mut rx) = state.service.subscribe(&id) else {
        // finished or unknown: answer from the durable record
        let message = match state.service.job(&id).await {
            Ok(Some(job)) => json!({ "status": job.status, "message": job.message, "job": job }),
            _ => json!({ "error": format!("job {} not found", id) }),
        };
        let _ = sender.send(WsMessage::Text(message.to_string().into())).await;
        let _ = sender.close().await;
        return;
    };

    let heartbeat = state.service.config().poll_timeout;
    let first = rx.borrow_and_update().clone();
    if !send_snapshot(&mut sender, &first).await || first.is_terminal() {
        return;
    }

    loop {
        tokio::select! {
            changed = rx.changed() => {
                let snapshot = rx.borrow_and_update().clone();
                if !send_snapshot(&mut sender, &snapshot).await {
                    break;
                }
                if changed.is_err() || snapshot.is_terminal() {
                    break;
                }
            }
            inbound = receiver.next() => match inbound {
                Some(Ok(WsMessage::Text(text))) if text.as_str().trim() == "stop" => {
                    let outcome = state.service.request_stop(&id);
                    debug!(job_id = %id, ?outcome, "Stop received over websocket");
                }
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = tokio::time::sleep(heartbeat) => {
                let snapshot = rx.borrow().clone();
                if !send_snapshot(&mut sender, &snapshot).await {
                    break;
                }
            }
        }
    }
    let _ = sender.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::jobs::MemoryJobStore;
    use crate::classifier::default_factory;

    fn cols() -> Vec<String> {
        vec!["sepal".to_string(), "petal".to_string()]
    }

    #[tokio::test]
    async fn test_parse_rules_endpoint() {
        let req = ParseRequest { columns: cols(), sources: vec!["petal > 2.5".into(), "1 <= sepal".into()] };
        let Json(bundle) = parse_rules(Json(req)).await.ok().unwrap();
        assert_eq!(bundle.labels, vec!["petal > 2.5", "sepal >= 1"]);
        assert!(bundle.masses.is_empty());
    }

    #[tokio::test]
    async fn test_parse_rules_rejects_ternary() {
        let req = ParseRequest { columns: cols(), sources: vec!["1 if petal > 2 else 0".into()] };
        let err = parse_rules(Json(req)).await.err().unwrap();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_coverage_endpoint() {
        let req: CoverageRequest = serde_json::from_value(json!({
            "columns": ["sepal", "petal"],
            "features": [[1.0, 1.0], [1.0, 3.0], [2.0, 4.0], [2.0, 0.5]],
            "rules": [{"left": "petal", "op": ">", "right": 2.5}]
        }))
        .unwrap();
        let response = rule_coverage(Json(req)).await.ok().unwrap().into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_generate_endpoint_drops_empty_rules() {
        let req: GenerateRequest = serde_json::from_value(json!({
            "columns": ["sepal", "petal"],
            "features": [[1.0, 1.5], [1.0, 3.5], [2.0, 4.2], [2.0, 0.5], [1.0, 2.2]],
            "nClasses": 2
        }))
        .unwrap();
        let Json(bundle) = generate_rules(Json(req)).await.ok().unwrap();
        assert!(!bundle.is_empty());
        assert_eq!(bundle.masses.len(), bundle.len());
        assert!(bundle.labels.iter().any(|l| l == "sepal = 1"));
    }

    async fn trained_state(models_dir: &std::path::Path) -> (AppState, String) {
        let config = ServiceConfig { models_dir: models_dir.to_path_buf(), ..ServiceConfig::default() };
        let service = TrainingService::start_with(config, Arc::new(MemoryJobStore::new()), default_factory());
        let features: Vec<Vec<f64>> = (0..20).map(|i| vec![i as f64, 1.0]).collect();
        let targets: Vec<String> = features.iter().map(|r| if r[0] >= 10.0 { "big" } else { "small" }.to_string()).collect();
        let request: TrainingRequest = serde_json::from_value(json!({
            "columns": ["sepal", "petal"],
            "train": {"features": features, "targets": targets},
            "rules": [{"left": "sepal", "op": ">=", "right": 10}, {"left": "sepal", "op": "<", "right": 10}],
            "maxEpochs": 5,
            "minEpochs": 1
        }))
        .unwrap();
        let id = service.enqueue_training(request).await.unwrap();
        service.wait_idle().await;
        (AppState { service: Arc::new(service) }, id)
    }

    #[tokio::test]
    async fn test_predict_and_rules_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let (state, id) = trained_state(dir.path()).await;

        let req: PredictRequest = serde_json::from_value(json!({ "predictData": [[15.0, 1.0], [2.0, 1.0]] })).unwrap();
        let response = predict_rows(State(state.clone()), Path(id.clone()), Json(req)).await.ok().unwrap().into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let response = saved_rules(State(state.clone()), Path(id.clone())).await.ok().unwrap().into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let req = PredictRequest { features: Vec::new() };
        let err = predict_rows(State(state.clone()), Path(id), Json(req)).await.err().unwrap();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err = saved_rules(State(state.clone()), Path("nope".to_string())).await.err().unwrap();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let response = job_stats(State(state.clone())).await.ok().unwrap().into_response();
        assert_eq!(response.status(), StatusCode::OK);
        state.service.shutdown().await;
    }
}
