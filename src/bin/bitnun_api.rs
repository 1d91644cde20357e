use anyhow::Context;
use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use bitnun_sim::bots::{BotConfigPatch, BotError, BotManager};
use bitnun_sim::config::{load_config, ConfigFormat};
use bitnun_sim::ledger::TxKind;
use bitnun_sim::types::{Address, BotId, Metadata};
use bitnun_sim::{Node, NodeError, Session, SimConfig};
use clap::Parser;
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};

#[derive(Debug, Parser)]
#[command(name = "bitnun-api", version, about = "JSON host API over one simulated BitnunEco node")]
struct Cli {
    #[arg(long, env = "BITNUN_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = ConfigFormat::Auto)]
    config_format: ConfigFormat,
    #[arg(long, env = "BITNUN_API_BIND", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,
}

type AppState = Arc<Session>;

/// Maps library errors onto HTTP statuses.
struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<NodeError> for ApiError {
    fn from(err: NodeError) -> Self {
        let status = match &err {
            NodeError::NotFound { .. } => StatusCode::NOT_FOUND,
            NodeError::ProposalClosed(_) => StatusCode::CONFLICT,
            NodeError::NoRuntime => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        };
        Self(status, err.to_string())
    }
}

impl From<BotError> for ApiError {
    fn from(err: BotError) -> Self {
        let status = match &err {
            BotError::NotFound(_) => StatusCode::NOT_FOUND,
            BotError::InvalidInterval => StatusCode::UNPROCESSABLE_ENTITY,
            BotError::NoRuntime => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self(status, err.to_string())
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn ok<T: serde::Serialize>(value: T) -> ApiResult {
    serde_json::to_value(value)
        .map(Json)
        .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config(path, cli.config_format)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SimConfig::sample(),
    };
    let session = Arc::new(Session::from_config(config).context("assembling session")?);
    session.start().context("starting session")?;

    let app = Router::new()
        .route("/stats", get(stats))
        .route("/balance", get(balance))
        .route("/blocks", get(blocks))
        .route("/mempool", get(mempool))
        .route("/actions", post(record_action))
        .route("/transactions", post(create_transaction))
        .route("/transfer", post(transfer))
        .route("/burn", post(burn))
        .route("/contracts", post(deploy_contract))
        .route("/nfts", post(mint_nft))
        .route("/proposals", post(create_proposal))
        .route("/proposals/:id/votes", post(vote))
        .route("/bridges", post(bridge))
        .route("/bridges/:id/complete", post(complete_bridge))
        .route("/pools", post(create_pool))
        .route("/pools/:id/stake", post(stake))
        .route("/pools/:id/unstake", post(unstake))
        .route("/entities/:id", get(lookup))
        .route("/mining/start", post(start_mining))
        .route("/mining/stop", post(stop_mining))
        .route("/bots", get(list_bots))
        .route("/bots/:id", get(bot_status))
        .route("/bots/stats", get(fleet_stats))
        .route("/bots/:id/stats", get(bot_stats))
        .route("/bots/:id/start", post(start_bot))
        .route("/bots/:id/stop", post(stop_bot))
        .route("/bots/:id/pause", post(pause_bot))
        .route("/bots/:id/run", post(run_bot))
        .route("/bots/:id/config", patch(update_bot))
        .route("/telemetry", get(telemetry))
        .route("/ws", get(ws_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(false))
                .on_response(DefaultOnResponse::new().include_headers(false)),
        )
        .with_state(Arc::clone(&session));

    tracing::info!(bind = ?cli.bind, address = %session.node().address(), "host api starting");
    let listener = tokio::net::TcpListener::bind(cli.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    session.shutdown().await;
    Ok(())
}

fn node(state: &AppState) -> &Node {
    state.node()
}

fn bots(state: &AppState) -> &BotManager {
    state.bots()
}

async fn stats(State(state): State<AppState>) -> ApiResult {
    ok(node(&state).get_network_stats())
}

async fn balance(State(state): State<AppState>) -> ApiResult {
    let node = node(&state);
    ok(json!({
        "address": node.address(),
        "balance": node.get_balance(),
        "inbound": node.inbound_total(),
        "action_rewards": node.action_rewards(),
    }))
}

async fn blocks(State(state): State<AppState>) -> ApiResult {
    ok(node(&state).blocks())
}

async fn mempool(State(state): State<AppState>) -> ApiResult {
    ok(node(&state).pending_transactions())
}

#[derive(Deserialize)]
struct ActionBody {
    kind: String,
    #[serde(default)]
    metadata: Metadata,
}

async fn record_action(State(state): State<AppState>, Json(body): Json<ActionBody>) -> ApiResult {
    ok(node(&state).record_action(body.kind.as_str(), body.metadata))
}

#[derive(Deserialize)]
struct TransactionBody {
    to: String,
    amount: f64,
    #[serde(default = "default_tx_kind")]
    kind: TxKind,
}

fn default_tx_kind() -> TxKind {
    TxKind::Transfer
}

async fn create_transaction(State(state): State<AppState>, Json(body): Json<TransactionBody>) -> ApiResult {
    ok(node(&state).create_transaction(Address(body.to), body.amount, body.kind)?)
}

#[derive(Deserialize)]
struct TransferBody {
    to: String,
    amount: f64,
}

async fn transfer(State(state): State<AppState>, Json(body): Json<TransferBody>) -> ApiResult {
    ok(node(&state).transfer(Address(body.to), body.amount)?)
}

#[derive(Deserialize)]
struct AmountBody {
    amount: f64,
}

async fn burn(State(state): State<AppState>, Json(body): Json<AmountBody>) -> ApiResult {
    ok(node(&state).burn_tokens(body.amount)?)
}

#[derive(Deserialize)]
struct ContractBody {
    code: String,
    contract_type: String,
}

async fn deploy_contract(State(state): State<AppState>, Json(body): Json<ContractBody>) -> ApiResult {
    let address = node(&state).deploy_smart_contract(&body.code, &body.contract_type);
    ok(json!({ "address": address }))
}

#[derive(Deserialize)]
struct NftBody {
    #[serde(default)]
    metadata: Metadata,
    #[serde(default)]
    royalty: f64,
}

async fn mint_nft(State(state): State<AppState>, Json(body): Json<NftBody>) -> ApiResult {
    let token_id = node(&state).mint_nft(body.metadata, body.royalty);
    ok(json!({ "token_id": token_id }))
}

#[derive(Deserialize)]
struct ProposalBody {
    title: String,
    #[serde(default)]
    description: String,
    voting_period_ms: i64,
}

async fn create_proposal(State(state): State<AppState>, Json(body): Json<ProposalBody>) -> ApiResult {
    let id = node(&state).create_governance_proposal(&body.title, &body.description, body.voting_period_ms);
    ok(json!({ "id": id }))
}

#[derive(Deserialize)]
struct VoteBody {
    support: bool,
    weight: f64,
}

async fn vote(State(state): State<AppState>, Path(id): Path<String>, Json(body): Json<VoteBody>) -> ApiResult {
    ok(node(&state).vote_on_proposal(&id, body.support, body.weight)?)
}

#[derive(Deserialize)]
struct BridgeBody {
    target_chain: String,
    amount: f64,
    asset: String,
}

async fn bridge(State(state): State<AppState>, Json(body): Json<BridgeBody>) -> ApiResult {
    let id = node(&state).bridge_assets(&body.target_chain, body.amount, &body.asset);
    ok(json!({ "id": id }))
}

async fn complete_bridge(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    ok(node(&state).complete_bridge(&id)?)
}

#[derive(Deserialize)]
struct PoolBody {
    name: String,
    apy: f64,
    #[serde(default)]
    min_stake: f64,
}

async fn create_pool(State(state): State<AppState>, Json(body): Json<PoolBody>) -> ApiResult {
    let id = node(&state).create_staking_pool(&body.name, body.apy, body.min_stake);
    ok(json!({ "id": id }))
}

async fn stake(State(state): State<AppState>, Path(id): Path<String>, Json(body): Json<AmountBody>) -> ApiResult {
    ok(node(&state).stake(&id, body.amount)?)
}

async fn unstake(State(state): State<AppState>, Path(id): Path<String>, Json(body): Json<AmountBody>) -> ApiResult {
    ok(node(&state).unstake(&id, body.amount)?)
}

async fn lookup(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    match node(&state).lookup(&id) {
        Some(entity) => ok(entity),
        None => Err(ApiError(StatusCode::NOT_FOUND, format!("{id} not found"))),
    }
}

async fn start_mining(State(state): State<AppState>) -> ApiResult {
    node(&state).start_mining()?;
    ok(json!({ "mining": true }))
}

async fn stop_mining(State(state): State<AppState>) -> ApiResult {
    node(&state).stop_mining();
    ok(json!({ "mining": false }))
}

async fn list_bots(State(state): State<AppState>) -> ApiResult {
    ok(bots(&state).get_all_bots())
}

async fn bot_status(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let id = BotId(id);
    match bots(&state).get_bot_status(&id) {
        Some(bot) => ok(bot),
        None => Err(BotError::NotFound(id).into()),
    }
}

async fn bot_stats(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let id = BotId(id);
    match bots(&state).get_bot_status(&id) {
        Some(bot) => ok(bot.stats),
        None => Err(BotError::NotFound(id).into()),
    }
}

async fn fleet_stats(State(state): State<AppState>) -> ApiResult {
    ok(bots(&state).get_bot_stats())
}

async fn start_bot(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    ok(bots(&state).start_bot(&BotId(id))?)
}

async fn stop_bot(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    ok(bots(&state).stop_bot(&BotId(id))?)
}

async fn pause_bot(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    ok(bots(&state).pause_bot(&BotId(id))?)
}

async fn run_bot(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    ok(bots(&state).run_bot_now(&BotId(id)).await?)
}

async fn update_bot(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<BotConfigPatch>,
) -> ApiResult {
    ok(bots(&state).update_bot_config(&BotId(id), body)?)
}

async fn telemetry(State(state): State<AppState>) -> ApiResult {
    ok(state.telemetry().flush())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = relay_events(state, socket).await {
            tracing::warn!(error = %e, "event stream ended with error");
        }
    })
}

/// Pushes every node event to the client as JSON until either side hangs up.
async fn relay_events(state: AppState, socket: WebSocket) -> anyhow::Result<()> {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut events = state.events().stream();

    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            if let Message::Close(_) = msg {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut reader => break,
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let txt = serde_json::to_string(&event)?;
                        ws_tx.send(Message::Text(txt)).await?;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "event stream lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
    reader.abort();
    Ok(())
}
