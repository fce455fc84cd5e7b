//! The fixed business scenario the harness drives.
//!
//! Stages run strictly in order: chain bootstrap, daemon bootstrap, three
//! provisioned participants, a chain of two channels (alice -> bob ->
//! charlie), a batch of invoice payments with periodic convergence checks, a
//! payment-history audit, and a two-phase teardown (cooperative close on one
//! channel, force close on the other). Every assertion on eventually
//! consistent state goes through [`wait_until`]; scenario state itself is
//! never cached locally, the services are re-queried as the source of truth.

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use eyre::{bail, eyre, WrapErr};
use tracing::{debug, info};

use crate::bitcoind::Bitcoind;
use crate::cli::{Config, Tolerance};
use crate::connector::RetryingConnector;
use crate::error::HarnessError;
use crate::node_rpc::{AdminRpc, Credentials, NodeRpc, RpcEndpoint, ServiceApi};
use crate::poller::wait_until;
use crate::process_supervisor::ProcessSupervisor;
use crate::proto::OpenChannelRequest;

const ADMIN_USERNAME: &str = "admin";
const ADMIN_INIT_PASSPHRASE: &str = "test";
const NODE_PASSPHRASE: &str = "pass";
const INVOICE_DESCRIPTION: &str = "lntest payment";
const PAYMENT_HISTORY_PAGE_SIZE: u32 = 1000;
const DATABASE_FILE: &str = "paynode.db";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const SATS_PER_CHAIN_UNIT: f64 = 100_000_000.0;

/// A provisioned test participant. The endpoint credentials are fixed at
/// creation; nothing here is mutated after provisioning.
pub struct NodeHandle {
    pub label: String,
    pub pubkey: String,
    pub rpc: NodeRpc,
}

/// Runs the whole scenario. Any polling exhaustion aborts the run; no stage
/// is retried at this level.
pub async fn run(config: &Config, supervisor: &mut ProcessSupervisor) -> crate::Result<()> {
    // The last payment must land on a sync boundary or the final
    // channel-balance check never runs.
    if config.num_payments % config.balance_sync_interval != 0 {
        return Err(HarnessError::UnexpectedState(format!(
            "payment count {} is not a multiple of the sync interval {}",
            config.num_payments, config.balance_sync_interval
        ))
        .into());
    }

    reset_output_dir(&config.output_dir)?;

    let btc = bootstrap_chain(config, supervisor).await?;
    let mut admin = bootstrap_service(config, supervisor).await?;

    info!("mining initial block window");
    btc.mine(config.initial_blocks).await?;
    let spendable = btc.get_balance().await?;
    if spendable <= 0.0 {
        return Err(HarnessError::UnexpectedState(format!(
            "chain wallet has balance {spendable} after mining {} blocks",
            config.initial_blocks
        ))
        .into());
    }

    let mut alice = provision_node(config, &btc, &mut admin, "alice").await?;
    let mut bob = provision_node(config, &btc, &mut admin, "bob").await?;

    info!("opening channel alice -> bob");
    open_channel(config, &mut alice, &bob, config.node_listen_address(2)).await?;

    let mut charlie = provision_node(config, &btc, &mut admin, "charlie").await?;

    info!("opening channel bob -> charlie");
    open_channel(config, &mut bob, &charlie, config.node_listen_address(3)).await?;

    info!("confirming channels");
    btc.mine(config.confirmation_blocks).await?;
    wait_channels_usable(config, &btc, &alice, &bob, &charlie).await?;

    let total_paid_msat = payment_loop(config, &mut alice, &mut charlie).await?;

    audit_payments(config, &alice).await?;

    teardown(config, &btc, &mut alice, &bob, &mut charlie, total_paid_msat).await?;

    Ok(())
}

fn reset_output_dir(dir: &Path) -> eyre::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).wrap_err_with(|| format!("clearing {}", dir.display())),
    }
    std::fs::create_dir_all(dir).wrap_err_with(|| format!("creating {}", dir.display()))
}

fn log_sink(dir: &Path, name: &str) -> eyre::Result<File> {
    let path = dir.join(name);
    File::create(&path).wrap_err_with(|| format!("creating log sink {}", path.display()))
}

async fn bootstrap_chain(
    config: &Config,
    supervisor: &mut ProcessSupervisor,
) -> crate::Result<Bitcoind> {
    let args = vec![
        "--regtest".to_string(),
        "--fallbackfee=0.0000001".to_string(),
        format!("--rpcuser={}", config.chain_rpc_user),
        format!("--rpcpassword={}", config.chain_rpc_password),
        format!("--rpcport={}", config.chain_rpc_port),
        format!("--datadir={}", config.output_dir.display()),
    ];
    supervisor.spawn(
        "bitcoind",
        &config.bitcoind_bin,
        &args,
        log_sink(&config.output_dir, "btc.log")?,
    )?;

    let mut btc = Bitcoind::new(
        "btc-regtest",
        &config.chain_rpc_url(),
        &config.chain_rpc_user,
        &config.chain_rpc_password,
    )?;

    let probe = &btc;
    wait_until(
        "chain rpc reachable",
        config.wait_timeout,
        config.poll_interval,
        || async move {
            probe.get_blockchain_info().await?;
            Ok(true)
        },
    )
    .await?;

    let chain_info = btc.get_blockchain_info().await?;
    info!(
        "chain node ready on {} at height {}",
        chain_info.chain, chain_info.blocks
    );
    btc.setup().await?;
    Ok(btc)
}

async fn bootstrap_service(
    config: &Config,
    supervisor: &mut ProcessSupervisor,
) -> crate::Result<AdminRpc> {
    let args = vec![
        "--network=regtest".to_string(),
        "--bitcoind-rpc-host=127.0.0.1".to_string(),
        format!("--bitcoind-rpc-port={}", config.chain_rpc_port),
        format!("--bitcoind-rpc-username={}", config.chain_rpc_user),
        format!("--bitcoind-rpc-password={}", config.chain_rpc_password),
        format!("--data-dir={}", config.output_dir.display()),
        // TODO: point the database inside the output dir once the daemon
        // accepts a path-qualified database URL.
        format!("--database-url={DATABASE_FILE}"),
        format!("--api-port={}", config.api_port),
    ];
    supervisor.spawn(
        "paynoded",
        &config.node_bin,
        &args,
        log_sink(&config.output_dir, "node.log")?,
    )?;

    let api = ServiceApi::new(&config.api_http_base())?;
    let probe = &api;
    wait_until(
        "service status endpoint",
        config.wait_timeout,
        config.poll_interval,
        || async move {
            probe.status().await?;
            Ok(true)
        },
    )
    .await?;

    info!("initializing payment daemon");
    let token = api.init(ADMIN_INIT_PASSPHRASE, ADMIN_USERNAME).await?;
    // Admin calls authenticate via the session token; the macaroon slot must
    // be present on the wire but its value is ignored.
    let credentials = Credentials::new(&[("macaroon", "invalid"), ("token", &token)])?;
    let endpoint = RpcEndpoint::new(config.api_rpc_uri(), credentials);

    let connector = RetryingConnector::new(config.connect_attempts, config.connect_retry_delay);
    let admin = connector
        .connect(&config.api_rpc_uri(), || {
            let endpoint = endpoint.clone();
            async move {
                let channel = endpoint.connect(CONNECT_TIMEOUT, REQUEST_TIMEOUT).await?;
                Ok(AdminRpc::new(channel, &endpoint))
            }
        })
        .await?;
    Ok(admin)
}

async fn provision_node(
    config: &Config,
    btc: &Bitcoind,
    admin: &mut AdminRpc,
    label: &str,
) -> crate::Result<NodeHandle> {
    info!("provisioning {label}");
    let created = admin.create_node(label, label, NODE_PASSPHRASE, true).await?;

    let credentials = Credentials::new(&[("macaroon", &created.macaroon)])?;
    let endpoint = RpcEndpoint::new(config.api_rpc_uri(), credentials);
    let connector = RetryingConnector::new(config.connect_attempts, config.connect_retry_delay);
    let mut rpc = connector
        .connect(&config.api_rpc_uri(), || {
            let endpoint = endpoint.clone();
            async move {
                let channel = endpoint.connect(CONNECT_TIMEOUT, REQUEST_TIMEOUT).await?;
                let mut rpc = NodeRpc::new(channel, &endpoint);
                rpc.probe().await?;
                Ok(rpc)
            }
        })
        .await?;

    let address = rpc.get_unused_address().await?;
    btc.send_to_address(&address, config.funding_sat as f64 / SATS_PER_CHAIN_UNIT)
        .await?;
    btc.mine(1).await?;

    let funded = rpc.clone();
    wait_until(
        &format!("{label} on-chain balance"),
        config.wait_timeout,
        config.poll_interval,
        || {
            let mut rpc = funded.clone();
            async move { Ok(rpc.get_balance().await? > 0) }
        },
    )
    .await?;

    info!("{label} funded (pubkey {})", created.pubkey);
    Ok(NodeHandle {
        label: label.to_string(),
        pubkey: created.pubkey,
        rpc,
    })
}

async fn open_channel(
    config: &Config,
    funder: &mut NodeHandle,
    recipient: &NodeHandle,
    recipient_address: String,
) -> crate::Result<()> {
    let results = funder
        .rpc
        .open_channels(vec![OpenChannelRequest {
            counterparty_id: recipient.pubkey.clone(),
            counterparty_address: recipient_address,
            amount_sats: config.channel_value_sat,
            public: true,
        }])
        .await?;
    for result in &results {
        if !result.accepted {
            return Err(HarnessError::UnexpectedState(format!(
                "open channel {} -> {} rejected: {}",
                funder.label, recipient.label, result.error
            ))
            .into());
        }
    }

    let watcher = recipient.rpc.clone();
    wait_until(
        &format!("channel visible at {}", recipient.label),
        config.wait_timeout,
        config.poll_interval,
        || {
            let mut rpc = watcher.clone();
            async move { Ok(!rpc.list_channels().await?.is_empty()) }
        },
    )
    .await?;

    // The funding transaction has no confirmations yet, so the fresh channel
    // must still be pending.
    let pending = recipient.rpc.clone().list_channels().await?;
    if pending.first().is_some_and(|channel| channel.is_usable) {
        return Err(HarnessError::UnexpectedState(format!(
            "channel at {} usable before any confirmation",
            recipient.label
        ))
        .into());
    }
    Ok(())
}

/// One predicate over the full channel set: alice and charlie each see their
/// single channel usable, bob sees both sides usable, all at the same time.
async fn wait_channels_usable(
    config: &Config,
    btc: &Bitcoind,
    alice: &NodeHandle,
    bob: &NodeHandle,
    charlie: &NodeHandle,
) -> Result<(), HarnessError> {
    let (a, b, c) = (alice.rpc.clone(), bob.rpc.clone(), charlie.rpc.clone());
    wait_until(
        "all channels usable",
        config.wait_timeout,
        config.poll_interval,
        || {
            let (mut a, mut b, mut c) = (a.clone(), b.clone(), c.clone());
            async move {
                // Keep blocks flowing; channel readiness is only re-evaluated
                // on chain activity.
                btc.mine(1).await?;
                let alice_channels = a.list_channels().await?;
                let bob_channels = b.list_channels().await?;
                let charlie_channels = c.list_channels().await?;
                Ok(alice_channels.first().is_some_and(|ch| ch.is_usable)
                    && bob_channels.len() >= 2
                    && bob_channels.iter().all(|ch| ch.is_usable)
                    && charlie_channels.first().is_some_and(|ch| ch.is_usable))
            }
        },
    )
    .await
}

/// Pays the configured batch of invoices sequentially and, at every sync
/// boundary, waits for both channel endpoints to reflect the cumulative
/// amount within the tolerance band. Returns the total paid in msat.
async fn payment_loop(
    config: &Config,
    alice: &mut NodeHandle,
    charlie: &mut NodeHandle,
) -> crate::Result<u64> {
    let channel_value_msat = config.channel_value_sat * 1000;
    let mut total_paid_msat = 0u64;

    for i in 1..=config.num_payments {
        debug!("paying invoice {i}/{}", config.num_payments);
        let invoice = charlie
            .rpc
            .create_invoice(config.payment_msat, INVOICE_DESCRIPTION)
            .await?;
        alice.rpc.pay_invoice(&invoice).await?;
        total_paid_msat += config.payment_msat;

        if i % config.balance_sync_interval == 0 {
            info!("syncing channel balances after {i} payments");
            let expected = total_paid_msat;
            let tolerance = config.tolerance;

            let sender = alice.rpc.clone();
            wait_until(
                &format!("{} channel balance", alice.label),
                config.wait_timeout,
                config.poll_interval,
                || {
                    let mut rpc = sender.clone();
                    async move {
                        let channels = rpc.list_channels().await?;
                        let channel = channels
                            .first()
                            .ok_or_else(|| eyre!("sender lists no channels"))?;
                        let spent = channel_value_msat.saturating_sub(channel.balance_msat);
                        within_tolerance(spent, expected, &tolerance)
                    }
                },
            )
            .await?;

            let receiver = charlie.rpc.clone();
            wait_until(
                &format!("{} channel balance", charlie.label),
                config.wait_timeout,
                config.poll_interval,
                || {
                    let mut rpc = receiver.clone();
                    async move {
                        let channels = rpc.list_channels().await?;
                        let channel = channels
                            .first()
                            .ok_or_else(|| eyre!("receiver lists no channels"))?;
                        within_tolerance(channel.balance_msat, expected, &tolerance)
                    }
                },
            )
            .await?;
        }
    }

    Ok(total_paid_msat)
}

async fn audit_payments(config: &Config, alice: &NodeHandle) -> Result<(), HarnessError> {
    let expected = config.num_payments as usize;
    let rpc = alice.rpc.clone();
    wait_until(
        "payment history settled",
        config.wait_timeout,
        config.poll_interval,
        || {
            let mut rpc = rpc.clone();
            async move {
                let payments = rpc.list_payments(0, PAYMENT_HISTORY_PAGE_SIZE).await?;
                if payments.len() != expected {
                    bail!("{} payments recorded, want {expected}", payments.len());
                }
                for payment in &payments {
                    if payment.origin != "invoice_outgoing" {
                        bail!("foreign payment origin '{}' in history", payment.origin);
                    }
                    if payment.status != "succeeded" {
                        bail!("payment stuck in status '{}'", payment.status);
                    }
                }
                Ok(true)
            }
        },
    )
    .await
}

async fn teardown(
    config: &Config,
    btc: &Bitcoind,
    alice: &mut NodeHandle,
    bob: &NodeHandle,
    charlie: &mut NodeHandle,
    total_paid_msat: u64,
) -> crate::Result<()> {
    let (alice_target, bob_target, charlie_target) = settlement_targets(config, total_paid_msat);

    info!("cooperatively closing {} -> {}", alice.label, bob.label);
    let channels = alice.rpc.list_channels().await?;
    let channel = channels.first().ok_or_else(|| {
        HarnessError::UnexpectedState(format!("{} has no channel left to close", alice.label))
    })?;
    alice.rpc.close_channel(&channel.channel_id, false).await?;

    wait_channel_gone(config, btc, alice, true).await?;
    wait_channel_gone(config, btc, bob, false).await?;
    wait_settled_balance(config, btc, alice, alice_target).await?;

    info!("force closing {} <- {}", bob.label, charlie.label);
    let channels = charlie.rpc.list_channels().await?;
    let channel = channels.first().ok_or_else(|| {
        HarnessError::UnexpectedState(format!("{} has no channel left to close", charlie.label))
    })?;
    charlie.rpc.close_channel(&channel.channel_id, true).await?;

    wait_channel_gone(config, btc, charlie, false).await?;
    wait_channel_gone(config, btc, bob, true).await?;
    wait_settled_balance(config, btc, bob, bob_target).await?;

    info!("mining force-close confirmation window");
    btc.mine(config.close_blocks).await?;
    wait_settled_balance(config, btc, charlie, charlie_target).await?;

    Ok(())
}

/// Expected settled on-chain balances (alice, bob, charlie) once both
/// channels are closed: initial funding adjusted by the total paid amount
/// and the fixed on-chain fee allowance for the parties that closed.
fn settlement_targets(config: &Config, total_paid_msat: u64) -> (u64, u64, u64) {
    let total_paid_sat = total_paid_msat / 1000;
    let alice = config
        .funding_sat
        .saturating_sub(total_paid_sat)
        .saturating_sub(config.onchain_fee_allowance_sat);
    let bob = config.funding_sat;
    let charlie = (config.funding_sat + total_paid_sat)
        .saturating_sub(config.onchain_fee_allowance_sat);
    (alice, bob, charlie)
}

/// Waits until `node` no longer lists a channel in the given direction.
/// One side observes a channel as outbound and its peer as inbound, so the
/// listing is filtered by directionality before checking emptiness.
async fn wait_channel_gone(
    config: &Config,
    btc: &Bitcoind,
    node: &NodeHandle,
    outbound: bool,
) -> Result<(), HarnessError> {
    let direction = if outbound { "outbound" } else { "inbound" };
    let rpc = node.rpc.clone();
    wait_until(
        &format!("{} {direction} channel closed", node.label),
        config.wait_timeout,
        config.poll_interval,
        || {
            let mut rpc = rpc.clone();
            async move {
                btc.mine(1).await?;
                let channels = rpc.list_channels().await?;
                Ok(!channels.iter().any(|ch| ch.is_outbound == outbound))
            }
        },
    )
    .await
}

async fn wait_settled_balance(
    config: &Config,
    btc: &Bitcoind,
    node: &NodeHandle,
    expected_sat: u64,
) -> Result<(), HarnessError> {
    let tolerance = config.tolerance;
    let rpc = node.rpc.clone();
    wait_until(
        &format!("{} settled balance", node.label),
        config.wait_timeout,
        config.poll_interval,
        || {
            let mut rpc = rpc.clone();
            async move {
                btc.mine(1).await?;
                let balance = rpc.get_balance().await?;
                within_tolerance(balance, expected_sat, &tolerance)
            }
        },
    )
    .await
}

/// `Ok(true)` when `observed` falls inside the tolerance band around
/// `expected`; an error (retried by the poller) otherwise.
fn within_tolerance(observed: u64, expected: u64, tolerance: &Tolerance) -> eyre::Result<bool> {
    let (low, high) = tolerance.bounds(expected);
    let value = observed as f64;
    if value < low || value > high {
        bail!("value {observed} outside [{low:.0}, {high:.0}] (expected ~{expected})");
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use clap::Parser;

    fn config_from(args: &[&str]) -> Config {
        let mut argv = vec!["lntest"];
        argv.extend_from_slice(args);
        Config::from_cli(Cli::try_parse_from(argv).unwrap()).unwrap()
    }

    #[test]
    fn tolerance_band_accepts_values_inside_it() {
        let tolerance = Tolerance::from_percentages(0.2, 0.1).unwrap();
        assert!(within_tolerance(998_100, 1_000_000, &tolerance).is_ok());
        assert!(within_tolerance(1_000_900, 1_000_000, &tolerance).is_ok());
        assert!(within_tolerance(1_000_000, 1_000_000, &tolerance).is_ok());
    }

    #[test]
    fn tolerance_band_rejects_out_of_range_values() {
        let tolerance = Tolerance::from_percentages(0.2, 0.1).unwrap();
        let err = within_tolerance(997_999, 1_000_000, &tolerance).unwrap_err();
        assert!(err.to_string().contains("997999"));
        assert!(within_tolerance(1_001_001, 1_000_000, &tolerance).is_err());
    }

    #[test]
    fn settlement_targets_follow_the_paid_amount() {
        let config = config_from(&[]);
        let total_paid_msat = u64::from(config.num_payments) * config.payment_msat;
        let (alice, bob, charlie) = settlement_targets(&config, total_paid_msat);

        assert_eq!(alice, 100_000_000 - 400_000 - 1000);
        assert_eq!(bob, 100_000_000);
        assert_eq!(charlie, 100_000_000 + 400_000 - 1000);
    }

    #[tokio::test]
    async fn misaligned_sync_interval_is_rejected_up_front() {
        let config = config_from(&["--num-payments", "10", "--balance-sync-interval", "3"]);
        let mut supervisor = ProcessSupervisor::new();

        let err = run(&config, &mut supervisor).await.unwrap_err();
        let harness_err = err
            .downcast_ref::<HarnessError>()
            .expect("should fail with a harness error");
        assert!(matches!(harness_err, HarnessError::UnexpectedState(_)));
        assert!(supervisor.is_empty());
    }
}
