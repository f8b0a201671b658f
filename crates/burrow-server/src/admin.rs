//! Admin HTTP API
//!
//! Exposes the facade operations on a local port for the operator CLI. No
//! credential check by design: deployments firewall or localhost-scope this
//! listener. Error kinds travel as a machine-readable `code` in the JSON
//! body so the CLI can tell an empty listing from a failure.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use burrow_proto::admin::{
    AddTunnelRequest, AddTunnelResponse, ClientInfo, ConnectionInfo, ErrorResponse,
    RegisterClientRequest, RegisterClientResponse, SocksStartRequest, TunnelInfo,
};
use burrow_proto::TunnelDirection;

use crate::error::AdminError;
use crate::server::Server;

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match &self {
            AdminError::NotFound(_) | AdminError::OutOfRange(_) => StatusCode::NOT_FOUND,
            AdminError::AlreadyExists(_) => StatusCode::CONFLICT,
            AdminError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            AdminError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            AdminError::Internal(_) | AdminError::Cancelled(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        };

        (status, Json(body)).into_response()
    }
}

/// Build the admin router.
pub fn admin_router(server: Arc<Server>) -> Router {
    Router::new()
        .route("/api/clients", get(list_clients).post(register_client))
        .route("/api/clients/{client_id}/disconnect", post(disconnect))
        .route(
            "/api/clients/{client_id}/tunnels",
            get(list_tunnels).post(add_tunnel),
        )
        .route(
            "/api/clients/{client_id}/tunnels/{tunnel_id}",
            axum::routing::delete(delete_tunnel),
        )
        .route(
            "/api/clients/{client_id}/tunnels/{tunnel_id}/connections",
            get(list_connections),
        )
        .route(
            "/api/clients/{client_id}/socks",
            post(socks_start).delete(socks_stop),
        )
        .with_state(server)
}

/// Serve the admin API on the given address until the process exits.
pub async fn serve_admin(server: Arc<Server>, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "admin API listening");
    axum::serve(listener, admin_router(server)).await
}

async fn list_clients(
    State(server): State<Arc<Server>>,
) -> Result<Json<Vec<ClientInfo>>, AdminError> {
    server.list_clients().map(Json)
}

async fn register_client(
    State(server): State<Arc<Server>>,
    Json(req): Json<RegisterClientRequest>,
) -> Result<Json<RegisterClientResponse>, AdminError> {
    let token =
        server.register_client(req.name, req.platform, req.server, req.port, req.arch)?;
    Ok(Json(RegisterClientResponse { token }))
}

async fn disconnect(
    State(server): State<Arc<Server>>,
    Path(client_id): Path<String>,
) -> Result<StatusCode, AdminError> {
    server.disconnect(&client_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_tunnels(
    State(server): State<Arc<Server>>,
    Path(client_id): Path<String>,
) -> Result<Json<Vec<TunnelInfo>>, AdminError> {
    server.list_tunnels(&client_id).map(Json)
}

async fn add_tunnel(
    State(server): State<Arc<Server>>,
    Path(client_id): Path<String>,
    Json(req): Json<AddTunnelRequest>,
) -> Result<Json<AddTunnelResponse>, AdminError> {
    let direction: TunnelDirection = req
        .direction
        .parse()
        .map_err(AdminError::InvalidArgument)?;

    let tunnel_id = server
        .add_tunnel(
            &client_id,
            req.tunnel_id,
            direction,
            req.listen_ip,
            req.listen_port,
            req.destination_ip,
            req.destination_port,
        )
        .await?;

    Ok(Json(AddTunnelResponse { tunnel_id }))
}

async fn delete_tunnel(
    State(server): State<Arc<Server>>,
    Path((client_id, tunnel_id)): Path<(String, String)>,
) -> Result<StatusCode, AdminError> {
    server.delete_tunnel(&client_id, &tunnel_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_connections(
    State(server): State<Arc<Server>>,
    Path((client_id, tunnel_id)): Path<(String, String)>,
) -> Result<Json<Vec<ConnectionInfo>>, AdminError> {
    server.list_connections(&client_id, &tunnel_id).map(Json)
}

async fn socks_start(
    State(server): State<Arc<Server>>,
    Path(client_id): Path<String>,
    Json(req): Json<SocksStartRequest>,
) -> Result<StatusCode, AdminError> {
    server.socks_start(&client_id, req.listen_port).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn socks_stop(
    State(server): State<Arc<Server>>,
    Path(client_id): Path<String>,
) -> Result<StatusCode, AdminError> {
    server.socks_stop(&client_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
