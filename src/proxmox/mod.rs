//! A minimal client of the Proxmox VE HTTP API, only the calls needed to
//! enumerate QEMU virtual machines and their guest addresses.

mod protocol;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, COOKIE};
use http::{Method, Request, StatusCode};
use http_body_util::Full;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub use protocol::{AddressType, IpAddress, NetworkInterface, Node, VmConfig, VmSummary};
use protocol::{AgentResult, Envelope, Ticket};

use crate::config::ProxmoxConfig;
use crate::http::{HttpClient, HttpError};

#[derive(Debug, Error)]
pub enum ClientError {
    /// The ticket endpoint answered with anything but `200 OK`.
    #[error("Unable to authenticate")]
    Authenticate(StatusCode),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("decode response of {path} failed, {err}")]
    Decode {
        path: String,
        err: serde_json::Error,
    },
    #[error("response of {0} contains no data")]
    MissingData(String),
}

/// Credentials obtained from the ticket endpoint, valid for two hours. Only
/// reads are sent, so the CSRF prevention token is not kept.
#[derive(Clone)]
pub struct Session {
    ticket: String,
}

impl Session {
    fn cookie(&self) -> String {
        format!("PVEAuthCookie={}", self.ticket)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

pub struct Client {
    http: HttpClient,
    endpoint: String,
    username: String,
    password: String,
}

impl Client {
    pub fn new(config: &ProxmoxConfig) -> Result<Client, HttpError> {
        let http = HttpClient::new(&config.tls, config.timeout)?;

        Ok(Client {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn authenticate(&self) -> Result<Session, ClientError> {
        let form = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("username", &self.username)
            .append_pair("password", &self.password)
            .finish();

        let req = Request::builder()
            .method(Method::POST)
            .uri(format!("{}/access/ticket", self.endpoint))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Full::new(Bytes::from(form)))
            .map_err(HttpError::BuildRequest)?;

        let (parts, body) = self.http.fetch_response(req).await?;
        if parts.status != StatusCode::OK {
            warn!(
                message = "authentication rejected",
                username = %self.username,
                status = %parts.status,
            );

            return Err(ClientError::Authenticate(parts.status));
        }

        let ticket = decode::<Ticket>("/access/ticket", &body)?;

        debug!(
            message = "authenticated",
            username = ticket.username.as_deref().unwrap_or(&self.username),
        );

        Ok(Session {
            ticket: ticket.ticket,
        })
    }

    pub async fn list_nodes(&self, session: &Session) -> Result<Vec<Node>, ClientError> {
        self.get(session, "/nodes").await
    }

    pub async fn list_vms(
        &self,
        session: &Session,
        node: &str,
    ) -> Result<Vec<VmSummary>, ClientError> {
        self.get(session, &format!("/nodes/{node}/qemu")).await
    }

    pub async fn get_vm_config(
        &self,
        session: &Session,
        node: &str,
        vmid: u64,
    ) -> Result<VmConfig, ClientError> {
        self.get(session, &format!("/nodes/{node}/qemu/{vmid}/config"))
            .await
    }

    /// The addresses reported by the QEMU guest agent. A VM without a running
    /// agent simply has no interfaces, only transport failures are errors.
    pub async fn get_network_interfaces(
        &self,
        session: &Session,
        node: &str,
        vmid: u64,
    ) -> Result<Vec<NetworkInterface>, ClientError> {
        let path = format!("/nodes/{node}/qemu/{vmid}/agent/network-get-interfaces");
        let req = self.request(session, &path)?;

        let (parts, body) = self.http.fetch_response(req).await?;
        if !parts.status.is_success() {
            debug!(
                message = "guest agent data unavailable",
                node,
                vmid,
                status = %parts.status,
            );

            return Ok(vec![]);
        }

        match serde_json::from_slice::<Envelope<AgentResult<Vec<NetworkInterface>>>>(&body) {
            Ok(envelope) => Ok(envelope
                .data
                .and_then(|data| data.result)
                .unwrap_or_default()),
            Err(err) => {
                warn!(
                    message = "malformed guest agent response",
                    node,
                    vmid,
                    %err,
                );

                Ok(vec![])
            }
        }
    }

    fn request(&self, session: &Session, path: &str) -> Result<Request<Full<Bytes>>, HttpError> {
        Request::builder()
            .method(Method::GET)
            .uri(format!("{}{}", self.endpoint, path))
            .header(COOKIE, session.cookie())
            .body(Full::default())
            .map_err(HttpError::BuildRequest)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        session: &Session,
        path: &str,
    ) -> Result<T, ClientError> {
        let req = self.request(session, path)?;
        let body = self.http.fetch(req).await?;

        decode(path, &body)
    }
}

fn decode<T: DeserializeOwned>(path: &str, body: &[u8]) -> Result<T, ClientError> {
    let envelope =
        serde_json::from_slice::<Envelope<T>>(body).map_err(|err| ClientError::Decode {
            path: path.to_string(),
            err,
        })?;

    envelope
        .data
        .ok_or_else(|| ClientError::MissingData(path.to_string()))
}
