pub mod bitcoind;
pub mod cli;
pub mod connector;
pub mod error;
pub mod node_rpc;
pub mod poller;
pub mod process_supervisor;
pub mod scenario;

/// Client stubs for the payment-node daemon, generated from
/// `proto/paynode.proto`.
pub mod proto {
    tonic::include_proto!("paynode");
}

pub type Result<T> = color_eyre::eyre::Result<T>;
