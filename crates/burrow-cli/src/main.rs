//! Operator CLI for the burrow server's admin API

mod config;

use anyhow::{bail, Context, Result};
use burrow_proto::admin::{
    AddTunnelRequest, AddTunnelResponse, ClientInfo, ConnectionInfo, ErrorResponse,
    RegisterClientRequest, RegisterClientResponse, SocksStartRequest, TunnelInfo,
};
use clap::{Parser, Subcommand};
use reqwest::{Response, StatusCode};

#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "Operator CLI for the burrow tunnel server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List connected agents
    #[command(name = "clientlist")]
    ClientList,

    /// Register a new agent and print its bearer token
    #[command(name = "clientregister")]
    ClientRegister {
        /// Friendly name for the agent
        #[arg(long)]
        name: String,
        /// Operating system platform of the agent host
        #[arg(long, default_value = "linux")]
        platform: String,
        /// Server address the agent will connect to
        #[arg(long, default_value = "")]
        server: String,
        /// Server port the agent will connect to
        #[arg(long, default_value = "5555")]
        port: u16,
        /// Architecture of the agent host
        #[arg(long, default_value = "x86_64")]
        arch: String,
    },

    /// Ask an agent to terminate
    #[command(name = "clientdisconnect")]
    ClientDisconnect {
        #[arg(long)]
        clientid: String,
    },

    /// Create a tunnel on an agent
    #[command(name = "tunnelcreate")]
    TunnelCreate {
        #[arg(long)]
        clientid: String,
        /// Tunnel direction: forward or reverse
        #[arg(long, default_value = "forward")]
        direction: String,
        /// Address the listening side binds
        #[arg(long, default_value = "0.0.0.0")]
        listenip: String,
        #[arg(long)]
        listenport: u16,
        /// Address connections are forwarded to
        #[arg(long)]
        destinationip: String,
        #[arg(long)]
        destinationport: u16,
        /// Friendly tunnel id; generated when omitted
        #[arg(long)]
        tunnelid: Option<String>,
    },

    /// Delete a tunnel
    #[command(name = "tunneldelete")]
    TunnelDelete {
        #[arg(long)]
        clientid: String,
        #[arg(long)]
        tunnelid: String,
    },

    /// List an agent's tunnels
    #[command(name = "tunnellist")]
    TunnelList {
        #[arg(long)]
        clientid: String,
    },

    /// List a tunnel's live connections
    #[command(name = "connectionlist")]
    ConnectionList {
        #[arg(long)]
        clientid: String,
        #[arg(long)]
        tunnelid: String,
    },

    /// Start a SOCKSv5 server on an agent
    #[command(name = "socksstart")]
    SocksStart {
        #[arg(long)]
        clientid: String,
        #[arg(long)]
        socksport: u16,
    },

    /// Stop an agent's SOCKSv5 server
    #[command(name = "socksstop")]
    SocksStop {
        #[arg(long)]
        clientid: String,
    },
}

struct AdminClient {
    base: String,
    http: reqwest::Client,
}

impl AdminClient {
    fn new() -> Self {
        let (host, port) = config::admin_endpoint();
        Self {
            base: format!("http://{}:{}", host, port),
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Decode a list response; an `OUT_OF_RANGE` error means "no rows",
    /// which callers render as a bare table header.
    async fn list<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        let response = self
            .http
            .get(self.url(path))
            .send()
            .await
            .context("admin API unreachable")?;

        if response.status().is_success() {
            return response.json().await.context("malformed admin response");
        }

        let error = decode_error(response).await;
        if error.code == "OUT_OF_RANGE" {
            return Ok(Vec::new());
        }
        bail!("{}: {}", error.code, error.error);
    }

    async fn expect_ok(&self, response: Response) -> Result<Response> {
        if response.status().is_success() || response.status() == StatusCode::NO_CONTENT {
            return Ok(response);
        }
        let error = decode_error(response).await;
        bail!("{}: {}", error.code, error.error);
    }
}

async fn decode_error(response: Response) -> ErrorResponse {
    let status = response.status();
    response.json().await.unwrap_or_else(|_| ErrorResponse {
        error: format!("admin API returned {}", status),
        code: "INTERNAL".to_string(),
    })
}

fn print_row(cells: &[&str], widths: &[usize]) {
    let row = cells
        .iter()
        .zip(widths)
        .map(|(cell, width)| format!("{:<w$}", cell, w = *width))
        .collect::<Vec<_>>()
        .join("  ");
    println!("{}", row.trim_end());
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let admin = AdminClient::new();

    match cli.command {
        Command::ClientList => {
            let clients: Vec<ClientInfo> = admin.list("/api/clients").await?;

            let widths = [34, 16, 22, 20, 25];
            print_row(
                &["CLIENT ID", "NAME", "REMOTE ADDRESS", "HOSTNAME", "CONNECTED"],
                &widths,
            );
            for c in clients {
                print_row(
                    &[
                        &c.client_id,
                        &c.name,
                        &c.remote_addr,
                        &c.hostname,
                        &c.connected_at.to_rfc3339(),
                    ],
                    &widths,
                );
            }
        }

        Command::ClientRegister {
            name,
            platform,
            server,
            port,
            arch,
        } => {
            let request = RegisterClientRequest {
                name,
                platform,
                server,
                port,
                arch,
            };
            let response = admin
                .http
                .post(admin.url("/api/clients"))
                .json(&request)
                .send()
                .await
                .context("admin API unreachable")?;
            let response = admin.expect_ok(response).await?;
            let body: RegisterClientResponse = response.json().await?;
            println!("token: {}", body.token);
        }

        Command::ClientDisconnect { clientid } => {
            let response = admin
                .http
                .post(admin.url(&format!("/api/clients/{}/disconnect", clientid)))
                .send()
                .await
                .context("admin API unreachable")?;
            admin.expect_ok(response).await?;
            println!("disconnect sent to {}", clientid);
        }

        Command::TunnelCreate {
            clientid,
            direction,
            listenip,
            listenport,
            destinationip,
            destinationport,
            tunnelid,
        } => {
            let request = AddTunnelRequest {
                tunnel_id: tunnelid,
                direction,
                listen_ip: listenip,
                listen_port: listenport,
                destination_ip: destinationip,
                destination_port: destinationport,
            };
            let response = admin
                .http
                .post(admin.url(&format!("/api/clients/{}/tunnels", clientid)))
                .json(&request)
                .send()
                .await
                .context("admin API unreachable")?;
            let response = admin.expect_ok(response).await?;
            let body: AddTunnelResponse = response.json().await?;
            println!("tunnel created: {}", body.tunnel_id);
        }

        Command::TunnelDelete { clientid, tunnelid } => {
            let response = admin
                .http
                .delete(admin.url(&format!("/api/clients/{}/tunnels/{}", clientid, tunnelid)))
                .send()
                .await
                .context("admin API unreachable")?;
            admin.expect_ok(response).await?;
            println!("tunnel deleted: {}", tunnelid);
        }

        Command::TunnelList { clientid } => {
            let tunnels: Vec<TunnelInfo> = admin
                .list(&format!("/api/clients/{}/tunnels", clientid))
                .await?;

            let widths = [12, 9, 16, 12, 16, 17, 11];
            print_row(
                &[
                    "TUNNEL ID",
                    "DIRECTION",
                    "LISTEN IP",
                    "LISTEN PORT",
                    "DESTINATION IP",
                    "DESTINATION PORT",
                    "CONNECTIONS",
                ],
                &widths,
            );
            for t in tunnels {
                print_row(
                    &[
                        &t.tunnel_id,
                        &t.direction,
                        &t.listen_ip,
                        &t.listen_port.to_string(),
                        &t.destination_ip,
                        &t.destination_port.to_string(),
                        &t.connections.to_string(),
                    ],
                    &widths,
                );
            }
        }

        Command::ConnectionList { clientid, tunnelid } => {
            let connections: Vec<ConnectionInfo> = admin
                .list(&format!(
                    "/api/clients/{}/tunnels/{}/connections",
                    clientid, tunnelid
                ))
                .await?;

            let widths = [34, 22, 22, 12, 12];
            print_row(
                &["CONNECTION ID", "SOURCE", "DESTINATION", "BYTES TX", "BYTES RX"],
                &widths,
            );
            for c in connections {
                print_row(
                    &[
                        &c.connection_id,
                        &c.source,
                        &c.destination,
                        &c.bytes_tx.to_string(),
                        &c.bytes_rx.to_string(),
                    ],
                    &widths,
                );
            }
        }

        Command::SocksStart { clientid, socksport } => {
            let request = SocksStartRequest {
                listen_port: socksport,
            };
            let response = admin
                .http
                .post(admin.url(&format!("/api/clients/{}/socks", clientid)))
                .json(&request)
                .send()
                .await
                .context("admin API unreachable")?;
            admin.expect_ok(response).await?;
            println!("socks start sent to {}", clientid);
        }

        Command::SocksStop { clientid } => {
            let response = admin
                .http
                .delete(admin.url(&format!("/api/clients/{}/socks", clientid)))
                .send()
                .await
                .context("admin API unreachable")?;
            admin.expect_ok(response).await?;
            println!("socks stop sent to {}", clientid);
        }
    }

    Ok(())
}
