use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use eyre::{bail, eyre};

/// End-to-end payment-channel scenario harness.
///
/// Spawns a regtest chain node and a payment-node daemon, provisions three
/// participants, opens a chain of channels, pays a batch of invoices, and
/// verifies every balance settles where it should.
#[derive(Parser)]
#[command(name = "lntest")]
#[command(about = "End-to-end payment-channel scenario harness")]
#[command(version)]
pub struct Cli {
    /// Chain node binary
    #[arg(long, default_value = "bitcoind")]
    pub bitcoind_bin: String,

    /// Payment node daemon binary
    #[arg(long, default_value = "paynoded")]
    pub node_bin: String,

    /// Directory for process logs and service data (recreated on start)
    #[arg(long, default_value = "test-output")]
    pub output_dir: PathBuf,

    /// Chain node JSON-RPC port
    #[arg(long, default_value = "18883")]
    pub chain_rpc_port: u16,

    /// Chain node JSON-RPC username
    #[arg(long, default_value = "user")]
    pub chain_rpc_user: String,

    /// Chain node JSON-RPC password
    #[arg(long, default_value = "pass")]
    pub chain_rpc_password: String,

    /// Payment daemon API port (HTTP bootstrap and RPC share it)
    #[arg(long, default_value = "3301")]
    pub api_port: u16,

    /// First peer listening port; participant N listens at base + N - 1
    #[arg(long, default_value = "10000")]
    pub listen_port_base: u16,

    /// Number of invoices to pay
    #[arg(long, default_value = "100")]
    pub num_payments: u32,

    /// Check channel-balance convergence every this many payments
    #[arg(long, default_value = "25")]
    pub balance_sync_interval: u32,

    /// Amount of each payment (msat)
    #[arg(long, default_value = "4000000")]
    pub payment_msat: u64,

    /// Funding amount of each channel (sat)
    #[arg(long, default_value = "10000000")]
    pub channel_value_sat: u64,

    /// On-chain funding sent to each participant (sat)
    #[arg(long, default_value = "100000000")]
    pub funding_sat: u64,

    /// Blocks mined up front to give the chain wallet spendable coins
    #[arg(long, default_value = "110")]
    pub initial_blocks: u64,

    /// Confirmation depth mined after channel funding
    #[arg(long, default_value = "6")]
    pub confirmation_blocks: u64,

    /// Confirmation window mined after the force close
    #[arg(long, default_value = "144")]
    pub close_blocks: u64,

    /// Per-condition polling deadline (seconds)
    #[arg(long, default_value = "20")]
    pub wait_timeout_secs: u64,

    /// Interval between poll attempts (ms)
    #[arg(long, default_value = "500")]
    pub poll_interval_ms: u64,

    /// Attempts when building an RPC client against a fresh daemon
    #[arg(long, default_value = "5")]
    pub connect_attempts: u32,

    /// Delay between connection attempts (ms)
    #[arg(long, default_value = "100")]
    pub connect_retry_delay_ms: u64,

    /// Allowed shortfall when balances converge, as a percentage
    #[arg(long, default_value = "0.2")]
    pub tolerance_under_pct: f64,

    /// Allowed overshoot when balances converge, as a percentage
    #[arg(long, default_value = "0.1")]
    pub tolerance_over_pct: f64,

    /// On-chain fee allowance subtracted from settled balances (sat)
    #[arg(long, default_value = "1000")]
    pub onchain_fee_allowance_sat: u64,

    /// On failure, leave services running and wait for Ctrl-C instead of
    /// tearing down immediately
    #[arg(long)]
    pub suspend_on_failure: bool,
}

/// What to do when the scenario fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Unwind and terminate all managed processes.
    Teardown,
    /// Log the failure and park until Ctrl-C, leaving services alive for
    /// inspection; teardown runs once released.
    Suspend,
}

/// Allowed deviation between an expected and observed balance. Fees shave a
/// little off converging amounts, so the band is asymmetric: a larger
/// shortfall than overshoot is tolerated.
#[derive(Debug, Clone, Copy)]
pub struct Tolerance {
    /// Allowed shortfall as a fraction (0.002 = 0.2%).
    pub under: f64,
    /// Allowed overshoot as a fraction.
    pub over: f64,
}

impl Tolerance {
    pub fn from_percentages(under_pct: f64, over_pct: f64) -> eyre::Result<Self> {
        for pct in [under_pct, over_pct] {
            if !(0.0..100.0).contains(&pct) {
                bail!("tolerance percentage {pct} out of range [0, 100)");
            }
        }
        Ok(Self {
            under: under_pct / 100.0,
            over: over_pct / 100.0,
        })
    }

    /// Inclusive bounds for an observation of `expected`.
    pub fn bounds(&self, expected: u64) -> (f64, f64) {
        let expected = expected as f64;
        (expected * (1.0 - self.under), expected * (1.0 + self.over))
    }
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub bitcoind_bin: String,
    pub node_bin: String,
    pub output_dir: PathBuf,
    pub chain_rpc_port: u16,
    pub chain_rpc_user: String,
    pub chain_rpc_password: String,
    pub api_port: u16,
    pub listen_port_base: u16,
    pub num_payments: u32,
    pub balance_sync_interval: u32,
    pub payment_msat: u64,
    pub channel_value_sat: u64,
    pub funding_sat: u64,
    pub initial_blocks: u64,
    pub confirmation_blocks: u64,
    pub close_blocks: u64,
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
    pub connect_attempts: u32,
    pub connect_retry_delay: Duration,
    pub tolerance: Tolerance,
    pub onchain_fee_allowance_sat: u64,
    pub failure_policy: FailurePolicy,
}

impl Config {
    pub fn from_cli(cli: Cli) -> eyre::Result<Self> {
        if cli.poll_interval_ms == 0 {
            return Err(eyre!("poll interval must be positive"));
        }
        if cli.balance_sync_interval == 0 {
            return Err(eyre!("balance sync interval must be positive"));
        }

        let tolerance =
            Tolerance::from_percentages(cli.tolerance_under_pct, cli.tolerance_over_pct)?;
        let failure_policy = if cli.suspend_on_failure {
            FailurePolicy::Suspend
        } else {
            FailurePolicy::Teardown
        };

        Ok(Config {
            bitcoind_bin: cli.bitcoind_bin,
            node_bin: cli.node_bin,
            output_dir: cli.output_dir,
            chain_rpc_port: cli.chain_rpc_port,
            chain_rpc_user: cli.chain_rpc_user,
            chain_rpc_password: cli.chain_rpc_password,
            api_port: cli.api_port,
            listen_port_base: cli.listen_port_base,
            num_payments: cli.num_payments,
            balance_sync_interval: cli.balance_sync_interval,
            payment_msat: cli.payment_msat,
            channel_value_sat: cli.channel_value_sat,
            funding_sat: cli.funding_sat,
            initial_blocks: cli.initial_blocks,
            confirmation_blocks: cli.confirmation_blocks,
            close_blocks: cli.close_blocks,
            wait_timeout: Duration::from_secs(cli.wait_timeout_secs),
            poll_interval: Duration::from_millis(cli.poll_interval_ms),
            connect_attempts: cli.connect_attempts,
            connect_retry_delay: Duration::from_millis(cli.connect_retry_delay_ms),
            tolerance,
            onchain_fee_allowance_sat: cli.onchain_fee_allowance_sat,
            failure_policy,
        })
    }

    pub fn chain_rpc_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.chain_rpc_port)
    }

    /// Base URL of the daemon's HTTP bootstrap surface.
    pub fn api_http_base(&self) -> String {
        format!("http://127.0.0.1:{}", self.api_port)
    }

    /// URI of the daemon's RPC listener (same port as the HTTP surface).
    pub fn api_rpc_uri(&self) -> String {
        format!("http://127.0.0.1:{}", self.api_port)
    }

    /// Peer listening address of participant `index` (1-based).
    pub fn node_listen_address(&self, index: u32) -> String {
        format!("127.0.0.1:{}", u32::from(self.listen_port_base) + index - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_config() -> Config {
        Config::from_cli(Cli::try_parse_from(["lntest"]).unwrap()).unwrap()
    }

    #[test]
    fn defaults_match_the_scenario_constants() {
        let config = default_config();
        assert_eq!(config.num_payments, 100);
        assert_eq!(config.balance_sync_interval, 25);
        assert_eq!(config.payment_msat, 4_000_000);
        assert_eq!(config.channel_value_sat, 10_000_000);
        assert_eq!(config.funding_sat, 100_000_000);
        assert_eq!(config.wait_timeout, Duration::from_secs(20));
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.failure_policy, FailurePolicy::Teardown);
    }

    #[test]
    fn listen_addresses_are_assigned_per_participant() {
        let config = default_config();
        assert_eq!(config.node_listen_address(1), "127.0.0.1:10000");
        assert_eq!(config.node_listen_address(2), "127.0.0.1:10001");
        assert_eq!(config.node_listen_address(3), "127.0.0.1:10002");
    }

    #[test]
    fn suspend_flag_selects_the_suspend_policy() {
        let cli = Cli::try_parse_from(["lntest", "--suspend-on-failure"]).unwrap();
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.failure_policy, FailurePolicy::Suspend);
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let cli = Cli::try_parse_from(["lntest", "--poll-interval-ms", "0"]).unwrap();
        assert!(Config::from_cli(cli).is_err());
    }

    #[test]
    fn tolerance_bounds_default_band() {
        let tolerance = Tolerance::from_percentages(0.2, 0.1).unwrap();
        let (low, high) = tolerance.bounds(1_000_000);
        assert!((low - 998_000.0).abs() < 1e-6);
        assert!((high - 1_001_000.0).abs() < 1e-6);
    }

    #[test]
    fn out_of_range_tolerance_is_rejected() {
        assert!(Tolerance::from_percentages(-0.1, 0.1).is_err());
        assert!(Tolerance::from_percentages(0.2, 100.0).is_err());
    }
}
