//! JSON-RPC client for the chain node.
//!
//! The chain node is authoritative ground truth for block height and
//! spendable funds; the harness only reads and nudges it (mining blocks,
//! funding addresses). Calls go over HTTP with basic auth and a short
//! overall timeout so poll attempts stay responsive even when the node
//! wedges.

use std::time::Duration;

use eyre::{bail, eyre};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct BlockchainInfo {
    pub chain: String,
    pub blocks: u64,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

pub struct Bitcoind {
    name: String,
    http: reqwest::Client,
    url: String,
    user: String,
    password: String,
    mine_address: Option<String>,
}

impl Bitcoind {
    pub fn new(name: &str, url: &str, user: &str, password: &str) -> eyre::Result<Self> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            name: name.to_string(),
            http,
            url: url.to_string(),
            user: user.to_string(),
            password: password.to_string(),
            mine_address: None,
        })
    }

    async fn call_raw<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> eyre::Result<RpcEnvelope<T>> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "lntest",
            "method": method,
            "params": params,
        });
        let response = self
            .http
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&body)
            .send()
            .await?;
        let envelope: RpcEnvelope<T> = response.json().await?;
        if let Some(error) = envelope.error {
            bail!("{method} failed: {} (code {})", error.message, error.code);
        }
        Ok(envelope)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> eyre::Result<T> {
        self.call_raw(method, params)
            .await?
            .result
            .ok_or_else(|| eyre!("{method} returned no result"))
    }

    /// For calls whose result is null or uninteresting.
    async fn call_void(&self, method: &str, params: Value) -> eyre::Result<()> {
        self.call_raw::<Value>(method, params).await.map(|_| ())
    }

    pub async fn get_blockchain_info(&self) -> eyre::Result<BlockchainInfo> {
        self.call("getblockchaininfo", json!([])).await
    }

    pub async fn create_wallet(&self, wallet: &str) -> eyre::Result<()> {
        self.call_void("createwallet", json!([wallet])).await
    }

    pub async fn unload_wallet(&self, wallet: &str) -> eyre::Result<()> {
        self.call_void("unloadwallet", json!([wallet])).await
    }

    pub async fn load_wallet(&self, wallet: &str, load_on_startup: bool) -> eyre::Result<()> {
        self.call_void("loadwallet", json!([wallet, load_on_startup]))
            .await
    }

    pub async fn get_new_address(&self) -> eyre::Result<String> {
        self.call("getnewaddress", json!([])).await
    }

    pub async fn generate_to_address(&self, count: u64, address: &str) -> eyre::Result<Vec<String>> {
        self.call("generatetoaddress", json!([count, address])).await
    }

    /// Spendable wallet balance in chain units.
    pub async fn get_balance(&self) -> eyre::Result<f64> {
        self.call("getbalance", json!([])).await
    }

    pub async fn send_to_address(&self, address: &str, amount: f64) -> eyre::Result<String> {
        self.call("sendtoaddress", json!([address, amount])).await
    }

    /// Creates the default wallet and caches a mining address. The wallet is
    /// unloaded and reloaded with load-on-startup so it comes back if anyone
    /// restarts the node against the same datadir after the run.
    pub async fn setup(&mut self) -> eyre::Result<()> {
        self.create_wallet("default").await?;
        self.unload_wallet("default").await?;
        self.load_wallet("default", true).await?;
        self.mine_address = Some(self.get_new_address().await?);
        Ok(())
    }

    /// Mines `count` blocks to the cached address and returns the new height.
    pub async fn mine(&self, count: u64) -> eyre::Result<u64> {
        let address = self
            .mine_address
            .as_deref()
            .ok_or_else(|| eyre!("wallet not set up; no mining address"))?;
        self.generate_to_address(count, address).await?;
        let height = self.get_blockchain_info().await?.blocks;
        debug!("{} at height {height}", self.name);
        Ok(height)
    }
}
