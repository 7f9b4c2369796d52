use std::num::NonZeroU32;

use clap::Args;
use guestrpc_message::sim::SimulatedHost;
use guestrpc_message::{ChannelConfig, RetryPolicy};
use guestrpc_rpci::sim::vmx_responder;
use guestrpc_transport::{Backdoor, Transport};
use tracing::debug;

use crate::exit::CliResult;

/// Transport used by every command: the real backdoor or a simulated host.
pub type CliTransport = Transport<dyn Backdoor>;

#[derive(Args, Debug, Clone, Default)]
pub struct ChannelOpts {
    /// Move payloads word by word even when bulk copy is offered.
    #[arg(long, global = true, env = "GUESTRPC_LOW_BANDWIDTH")]
    pub low_bandwidth: bool,

    /// Fail after N checkpoint-interrupted attempts instead of retrying forever.
    #[arg(long, value_name = "N", global = true, env = "GUESTRPC_MAX_RETRIES")]
    pub max_retries: Option<NonZeroU32>,

    /// Talk to an in-process simulated host instead of the hypervisor.
    #[arg(long, global = true, env = "GUESTRPC_SIMULATE")]
    pub simulate: bool,

    /// Seed the simulated host with a guestinfo value (repeatable).
    #[arg(
        long = "sim-value",
        value_name = "KEY=VALUE",
        global = true,
        value_parser = parse_key_value
    )]
    pub sim_values: Vec<(String, String)>,

    /// Let the simulated host offer the high-bandwidth path.
    #[arg(long, global = true)]
    pub sim_high_bandwidth: bool,
}

impl ChannelOpts {
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            retry: match self.max_retries {
                Some(attempts) => RetryPolicy::bounded(attempts),
                None => RetryPolicy::unbounded(),
            },
            low_bandwidth_only: self.low_bandwidth,
            ..ChannelConfig::default()
        }
    }

    pub fn open_transport(&self) -> CliResult<CliTransport> {
        if self.simulate {
            debug!(values = self.sim_values.len(), "using simulated host");
            return Ok(Transport::new(self.simulated_host()).into_dyn());
        }
        system_transport()
    }

    fn simulated_host(&self) -> SimulatedHost {
        let mut host = SimulatedHost::new();
        host.set_high_bandwidth(self.sim_high_bandwidth);
        host.set_responder(vmx_responder(self.sim_values.clone()));
        host
    }
}

#[cfg(target_arch = "x86_64")]
fn system_transport() -> CliResult<CliTransport> {
    use guestrpc_transport::PortBackdoor;

    Transport::<PortBackdoor>::system()
        .map(Transport::into_dyn)
        .map_err(|err| crate::exit::transport_error("backdoor unavailable", err))
}

#[cfg(not(target_arch = "x86_64"))]
fn system_transport() -> CliResult<CliTransport> {
    Err(crate::exit::transport_error(
        "backdoor unavailable",
        guestrpc_transport::TransportError::Unsupported {
            arch: std::env::consts::ARCH,
        },
    ))
}

fn parse_key_value(input: &str) -> Result<(String, String), String> {
    let (key, value) = input
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {input:?}"))?;
    let key = key.strip_prefix("guestinfo.").unwrap_or(key);
    if key.is_empty() {
        return Err("key must not be empty".to_string());
    }
    Ok((key.to_string(), value.to_string()))
}
