use std::fmt;

use guestrpc_message::ChannelConfig;
use guestrpc_transport::{Backdoor, Transport};
use tracing::debug;

use crate::client::send_one_with_config;
use crate::error::{Result, RpciError};

/// Namespace the VM configuration exposes to the guest.
pub const GUESTINFO_PREFIX: &str = "guestinfo.";

/// Typed access to `guestinfo.*` keys in the VM configuration.
///
/// Each call opens its own RPCI channel and closes it again. Missing or
/// unparseable values fall back to the caller's default; transport and
/// channel failures are errors.
pub struct GuestInfo<B: Backdoor + ?Sized> {
    transport: Transport<B>,
    config: ChannelConfig,
}

impl<B: Backdoor + ?Sized> Clone for GuestInfo<B> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            config: self.config.clone(),
        }
    }
}

impl<B: Backdoor + ?Sized> fmt::Debug for GuestInfo<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestInfo")
            .field("transport", &self.transport)
            .field("config", &self.config)
            .finish()
    }
}

impl<B: Backdoor + ?Sized> GuestInfo<B> {
    pub fn new(transport: Transport<B>) -> Self {
        Self::with_config(transport, ChannelConfig::default())
    }

    pub fn with_config(transport: Transport<B>, config: ChannelConfig) -> Self {
        Self { transport, config }
    }

    /// Raw value of `guestinfo.<key>`, or `None` when the host has none.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        validate_key(key)?;
        let reply = send_one_with_config(
            &self.transport,
            format!("info-get {GUESTINFO_PREFIX}{key}"),
            self.config.clone(),
        )?;
        if !reply.ok {
            debug!(key, reason = %reply.text(), "guestinfo key not set");
            return Ok(None);
        }
        Ok(Some(reply.text().into_owned()))
    }

    pub fn string(&self, key: &str, default: &str) -> Result<String> {
        Ok(self.get(key)?.unwrap_or_else(|| default.to_owned()))
    }

    pub fn bool(&self, key: &str, default: bool) -> Result<bool> {
        Ok(self
            .get(key)?
            .and_then(|value| parse_bool(&value))
            .unwrap_or(default))
    }

    pub fn int(&self, key: &str, default: i64) -> Result<i64> {
        Ok(self
            .get(key)?
            .and_then(|value| value.parse().ok())
            .unwrap_or(default))
    }

    /// Set `guestinfo.<key>` to `value`.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        validate_key(key)?;
        let reply = send_one_with_config(
            &self.transport,
            format!("info-set {GUESTINFO_PREFIX}{key} {value}"),
            self.config.clone(),
        )?;
        if !reply.ok {
            return Err(RpciError::Failed(reply.text().into_owned()));
        }
        Ok(())
    }

    pub fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        self.set(key, if value { "true" } else { "false" })
    }

    pub fn set_int(&self, key: &str, value: i64) -> Result<()> {
        self.set(key, &value.to_string())
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.contains(char::is_whitespace) {
        return Err(RpciError::InvalidKey(key.to_owned()));
    }
    Ok(())
}

/// Boolean spellings accepted in guestinfo values.
fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}
