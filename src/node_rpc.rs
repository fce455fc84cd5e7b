//! Clients for the payment-node daemon.
//!
//! The daemon hosts every logical node in one process behind a single gRPC
//! port; which node a call addresses is decided by the credential metadata
//! attached to it. Administrative calls carry the session token obtained
//! from the HTTP init endpoint, node calls carry the per-node macaroon
//! minted at provisioning time. [`Credentials`] holds the ordered pairs,
//! parsed once and immutable afterwards, and [`CredentialInterceptor`]
//! stamps them onto every request.

use std::time::Duration;

use eyre::eyre;
use serde::Deserialize;
use tonic::metadata::{Ascii, MetadataKey, MetadataValue};
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::transport::{Channel, Endpoint};
use tonic::Request;

use crate::proto::admin_client::AdminClient;
use crate::proto::node_client::NodeClient;
use crate::proto::{
    Channel as ChannelInfo, CloseChannelRequest, CreateInvoiceRequest, CreateNodeRequest,
    CreateNodeResponse, GetBalanceRequest, GetUnusedAddressRequest, ListChannelsRequest,
    ListPaymentsRequest, OpenChannelRequest, OpenChannelResult, OpenChannelsRequest,
    PaginationRequest, PayInvoiceRequest, Payment,
};

/// Per-call deadline for connection probes, kept short so the retry loop
/// stays responsive while the daemon is still coming up.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Ordered credential pairs attached to every call on an endpoint.
#[derive(Debug, Clone)]
pub struct Credentials {
    pairs: Vec<(MetadataKey<Ascii>, MetadataValue<Ascii>)>,
}

impl Credentials {
    pub fn new(pairs: &[(&str, &str)]) -> eyre::Result<Self> {
        let mut parsed = Vec::with_capacity(pairs.len());
        for &(name, value) in pairs {
            let key: MetadataKey<Ascii> = name
                .parse()
                .map_err(|_| eyre!("invalid credential key '{name}'"))?;
            let value: MetadataValue<Ascii> = value
                .parse()
                .map_err(|_| eyre!("credential value for '{name}' is not valid ascii"))?;
            parsed.push((key, value));
        }
        Ok(Self { pairs: parsed })
    }
}

/// Inserts the endpoint's credential pairs into each outgoing request.
#[derive(Debug, Clone)]
pub struct CredentialInterceptor {
    credentials: Credentials,
}

impl Interceptor for CredentialInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, tonic::Status> {
        for (key, value) in &self.credentials.pairs {
            request.metadata_mut().insert(key.clone(), value.clone());
        }
        Ok(request)
    }
}

/// A resolved address and the credentials every call on it carries.
/// Immutable once created.
#[derive(Debug, Clone)]
pub struct RpcEndpoint {
    uri: String,
    credentials: Credentials,
}

impl RpcEndpoint {
    pub fn new(uri: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            uri: uri.into(),
            credentials,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Establishes the underlying transport. This performs the actual TCP
    /// connect, so callers wrap it in the retrying connector.
    pub async fn connect(
        &self,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> eyre::Result<Channel> {
        let channel = Endpoint::from_shared(self.uri.clone())?
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .connect()
            .await?;
        Ok(channel)
    }

    fn interceptor(&self) -> CredentialInterceptor {
        CredentialInterceptor {
            credentials: self.credentials.clone(),
        }
    }
}

type Intercepted = InterceptedService<Channel, CredentialInterceptor>;

/// Administrative client: node provisioning.
#[derive(Clone)]
pub struct AdminRpc {
    inner: AdminClient<Intercepted>,
}

impl AdminRpc {
    pub fn new(channel: Channel, endpoint: &RpcEndpoint) -> Self {
        Self {
            inner: AdminClient::with_interceptor(channel, endpoint.interceptor()),
        }
    }

    pub async fn create_node(
        &mut self,
        username: &str,
        alias: &str,
        passphrase: &str,
        start: bool,
    ) -> eyre::Result<CreateNodeResponse> {
        let response = self
            .inner
            .create_node(CreateNodeRequest {
                username: username.to_string(),
                alias: alias.to_string(),
                passphrase: passphrase.to_string(),
                start,
            })
            .await?;
        Ok(response.into_inner())
    }
}

/// Per-node client: wallet, channel, and payment operations.
#[derive(Clone)]
pub struct NodeRpc {
    inner: NodeClient<Intercepted>,
}

impl NodeRpc {
    pub fn new(channel: Channel, endpoint: &RpcEndpoint) -> Self {
        Self {
            inner: NodeClient::with_interceptor(channel, endpoint.interceptor()),
        }
    }

    /// Cheap call with a short deadline confirming the daemon accepts
    /// application-level requests for this node, not just the transport.
    pub async fn probe(&mut self) -> eyre::Result<()> {
        let mut request = Request::new(GetBalanceRequest {});
        request.set_timeout(PROBE_TIMEOUT);
        self.inner.get_balance(request).await?;
        Ok(())
    }

    pub async fn get_unused_address(&mut self) -> eyre::Result<String> {
        let response = self.inner.get_unused_address(GetUnusedAddressRequest {}).await?;
        Ok(response.into_inner().address)
    }

    /// On-chain balance in sats.
    pub async fn get_balance(&mut self) -> eyre::Result<u64> {
        let response = self.inner.get_balance(GetBalanceRequest {}).await?;
        Ok(response.into_inner().onchain_balance_sats)
    }

    pub async fn open_channels(
        &mut self,
        requests: Vec<OpenChannelRequest>,
    ) -> eyre::Result<Vec<OpenChannelResult>> {
        let response = self
            .inner
            .open_channels(OpenChannelsRequest { requests })
            .await?;
        Ok(response.into_inner().results)
    }

    pub async fn list_channels(&mut self) -> eyre::Result<Vec<ChannelInfo>> {
        let response = self.inner.list_channels(ListChannelsRequest {}).await?;
        Ok(response.into_inner().channels)
    }

    pub async fn create_invoice(
        &mut self,
        amt_msat: u64,
        description: &str,
    ) -> eyre::Result<String> {
        let response = self
            .inner
            .create_invoice(CreateInvoiceRequest {
                amt_msat,
                description: description.to_string(),
            })
            .await?;
        Ok(response.into_inner().invoice)
    }

    pub async fn pay_invoice(&mut self, invoice: &str) -> eyre::Result<()> {
        self.inner
            .pay_invoice(PayInvoiceRequest {
                invoice: invoice.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn close_channel(&mut self, channel_id: &str, force: bool) -> eyre::Result<()> {
        self.inner
            .close_channel(CloseChannelRequest {
                channel_id: channel_id.to_string(),
                force,
            })
            .await?;
        Ok(())
    }

    pub async fn list_payments(&mut self, page: u32, take: u32) -> eyre::Result<Vec<Payment>> {
        let response = self
            .inner
            .list_payments(ListPaymentsRequest {
                pagination: Some(PaginationRequest { page, take }),
            })
            .await?;
        Ok(response.into_inner().payments)
    }
}

/// The daemon's plain-HTTP bootstrap surface.
#[derive(Debug, Clone)]
pub struct ServiceApi {
    http: reqwest::Client,
    base: String,
}

#[derive(Debug, Deserialize)]
struct InitResponse {
    token: String,
}

impl ServiceApi {
    pub fn new(base: &str) -> eyre::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    /// Succeeds once the daemon's HTTP listener answers.
    pub async fn status(&self) -> eyre::Result<()> {
        self.http
            .get(format!("{}/api/v1/status", self.base))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// One-time initialization; the returned token becomes part of the
    /// administrative credential.
    pub async fn init(&self, passphrase: &str, username: &str) -> eyre::Result<String> {
        let response = self
            .http
            .post(format!("{}/api/v1/init", self.base))
            .json(&serde_json::json!({"passphrase": passphrase, "username": username}))
            .send()
            .await?
            .error_for_status()?;
        let init: InitResponse = response.json().await?;
        Ok(init.token)
    }
}
